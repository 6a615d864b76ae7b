//! Streaming: bridge integrity, flow-level chunks and model output.

use async_trait::async_trait;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;

use stitch::runtime::{generate_stream, EchoModel, MemoryOperationStore};
use stitch::prelude::*;

/// Emits one chunk per word of the input, then succeeds with the word count
struct Announcer;

#[async_trait]
impl Flow for Announcer {
    fn name(&self) -> &str {
        "announcer"
    }

    async fn run(&self, ctx: &mut FlowContext, input: Value) -> FlowResult<Value> {
        let text = input.as_str().unwrap_or_default().to_string();
        let words: Vec<String> = ctx
            .run_step("split", move || async move {
                Ok::<_, String>(text.split_whitespace().map(str::to_string).collect())
            })
            .await?;
        for word in &words {
            ctx.send_chunk(json!(word));
        }
        Ok(json!({ "words": words.len() }))
    }
}

struct Broken;

#[async_trait]
impl Flow for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn run(&self, ctx: &mut FlowContext, _input: Value) -> FlowResult<Value> {
        ctx.run_step("fetch", || async { Err::<Value, _>("upstream unavailable") })
            .await
    }
}

/// Streams a model reply through a memoized step
struct Narrator;

#[async_trait]
impl Flow for Narrator {
    fn name(&self) -> &str {
        "narrator"
    }

    async fn run(&self, ctx: &mut FlowContext, input: Value) -> FlowResult<Value> {
        let prompt = input.as_str().unwrap_or_default();
        let reply = ctx
            .generate("narrate", Arc::new(EchoModel), ModelRequest::new(prompt))
            .await?;
        Ok(json!(reply.text))
    }
}

fn engine() -> FlowEngine {
    let engine = FlowEngine::new(Arc::new(MemoryOperationStore::new()));
    engine.register(Announcer);
    engine.register(Broken);
    engine.register(Narrator);
    engine
}

#[tokio::test]
async fn chunks_arrive_in_order_before_the_final_value() {
    let response = StreamingBridge::start(|sink: ChunkSender<String>| async move {
        sink.send("a".to_string());
        sink.send("b".to_string());
        Ok::<_, String>("ab".to_string())
    })
    .await
    .unwrap();
    let (stream, final_value) = response.into_parts();

    let records: Vec<_> = stream.collect().await;
    assert_eq!(
        records,
        vec![
            StreamRecord::Chunk("a".to_string()),
            StreamRecord::Chunk("b".to_string()),
            StreamRecord::Final("ab".to_string()),
        ]
    );
    assert_eq!(final_value.await.unwrap(), "ab");
}

#[tokio::test]
async fn failure_after_output_ends_with_an_error_record() {
    let response = StreamingBridge::start(|sink: ChunkSender<String>| async move {
        sink.send("a".to_string());
        Err::<String, _>("quota exceeded")
    })
    .await
    .unwrap();
    let (stream, final_value) = response.into_parts();

    let records: Vec<_> = stream.collect().await;
    assert_eq!(
        records,
        vec![
            StreamRecord::Chunk("a".to_string()),
            StreamRecord::Error("quota exceeded".to_string()),
        ]
    );
    assert_eq!(
        final_value.await,
        Err(CoreError::StreamFailure("quota exceeded".to_string()))
    );

    let wire: Vec<String> = records
        .iter()
        .map(|record| record.to_ndjson_line().unwrap())
        .collect();
    assert_eq!(wire[0], "{\"type\":\"chunk\",\"data\":\"a\"}\n");
    assert_eq!(wire[1], "{\"type\":\"error\",\"data\":\"quota exceeded\"}\n");
}

#[tokio::test]
async fn flow_chunks_are_streamed_with_the_run_summary() {
    let engine = engine();
    let response = engine
        .start_streaming("announcer", json!("resume from the top"))
        .await
        .unwrap();

    let records: Vec<_> = response.stream.collect().await;
    assert_eq!(records.len(), 5);
    let chunks: Vec<Value> = records
        .iter()
        .filter_map(|record| match record {
            StreamRecord::Chunk(value) => Some(value.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![json!("resume"), json!("from"), json!("the"), json!("top")]);

    match records.last() {
        Some(StreamRecord::Final(summary)) => {
            assert_eq!(summary.status, OperationStatus::Succeeded);
            assert_eq!(summary.result, Some(json!({ "words": 4 })));
        }
        other => panic!("expected a final summary, got {:?}", other),
    }
}

#[tokio::test]
async fn flow_failing_before_output_rejects_the_stream() {
    let engine = engine();
    let result = engine.start_streaming("broken", Value::Null).await;
    assert!(matches!(result, Err(CoreError::StreamFailure(_))));
}

#[tokio::test]
async fn unknown_flow_is_rejected_before_streaming() {
    let engine = engine();
    let result = engine.start_streaming("missing", Value::Null).await;
    assert!(matches!(result, Err(CoreError::FlowNotRegistered(_))));
}

#[tokio::test]
async fn model_chunks_flow_through_a_streaming_run() {
    let engine = engine();
    let response = engine
        .start_streaming("narrator", json!("once upon a time"))
        .await
        .unwrap();
    let (stream, summary) = response.into_parts();

    let chunks: Vec<_> = stream
        .filter_map(|record| async move {
            match record {
                StreamRecord::Chunk(value) => value["text"].as_str().map(str::to_string),
                _ => None,
            }
        })
        .collect()
        .await;
    assert_eq!(chunks.concat(), "once upon a time");

    let summary = summary.await.unwrap();
    assert_eq!(summary.result, Some(json!("once upon a time")));
}

#[tokio::test]
async fn model_stream_aggregates_the_reply() {
    let response = generate_stream(Arc::new(EchoModel), ModelRequest::new("hello there"))
        .await
        .unwrap();
    let (stream, reply) = response.into_parts();

    let records: Vec<_> = stream.collect().await;
    assert_eq!(records.len(), 3);
    assert!(records[2].is_terminal());

    let reply = reply.await.unwrap();
    assert_eq!(reply.text, "hello there");
    assert_eq!(reply.finish_reason.as_deref(), Some("stop"));
}
