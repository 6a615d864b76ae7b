//! Push-to-pull bridge
//!
//! A producer receives a [`ChunkSender`] and returns its final value. The
//! caller gets a [`ChunkStream`] that yields the chunks in emission order
//! followed by exactly one terminal record, plus a separately awaitable
//! [`FinalResult`].
//!
//! If the reader drops the stream early the producer keeps running; its
//! further sends are simply discarded.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::CoreError;

/// One record of the streaming wire contract. Serialised records are
/// self-delimited JSON objects tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StreamRecord<C, F> {
    /// Incremental output
    Chunk(C),
    /// Stream ended successfully with the aggregated value
    Final(F),
    /// Stream ended with an error
    Error(String),
}

impl<C, F> StreamRecord<C, F> {
    /// Whether this record ends the stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamRecord::Chunk(_))
    }
}

impl<C: Serialize, F: Serialize> StreamRecord<C, F> {
    /// Serialise as one newline-terminated JSON line
    pub fn to_ndjson_line(&self) -> Result<String, CoreError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Handle given to producers for emitting chunks. Cheap to clone.
pub struct ChunkSender<C> {
    sink: Arc<dyn Fn(C) -> bool + Send + Sync>,
}

impl<C> Clone for ChunkSender<C> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
        }
    }
}

impl<C: 'static> ChunkSender<C> {
    /// Build a sender from a delivery function returning whether the chunk
    /// was accepted
    pub fn new<S>(sink: S) -> Self
    where
        S: Fn(C) -> bool + Send + Sync + 'static,
    {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Sender that discards everything
    pub fn discard() -> Self {
        Self::new(|_| false)
    }

    /// Emit a chunk. Returns `false` once nobody is reading any more.
    pub fn send(&self, chunk: C) -> bool {
        (self.sink)(chunk)
    }

    /// Adapt into a sender of another chunk type
    pub fn map<D, M>(self, f: M) -> ChunkSender<D>
    where
        D: 'static,
        M: Fn(D) -> C + Send + Sync + 'static,
    {
        ChunkSender::new(move |chunk| self.send(f(chunk)))
    }
}

enum Signal<C, F> {
    Chunk(C),
    Final(F),
    Error(String),
}

impl<C, F> From<Signal<C, F>> for StreamRecord<C, F> {
    fn from(signal: Signal<C, F>) -> Self {
        match signal {
            Signal::Chunk(c) => StreamRecord::Chunk(c),
            Signal::Final(f) => StreamRecord::Final(f),
            Signal::Error(e) => StreamRecord::Error(e),
        }
    }
}

/// Ordered, single-pass sequence of stream records
pub struct ChunkStream<C, F> {
    first: Option<Signal<C, F>>,
    rx: mpsc::UnboundedReceiver<Signal<C, F>>,
    finished: bool,
}

impl<C: Unpin, F: Unpin> Stream for ChunkStream<C, F> {
    type Item = StreamRecord<C, F>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let signal = match this.first.take() {
            Some(signal) => signal,
            None => match this.rx.poll_recv(cx) {
                Poll::Ready(Some(signal)) => signal,
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(Some(StreamRecord::Error(
                        "producer stopped without a final result".to_string(),
                    )));
                }
                Poll::Pending => return Poll::Pending,
            },
        };

        let record = StreamRecord::from(signal);
        if record.is_terminal() {
            this.finished = true;
        }
        Poll::Ready(Some(record))
    }
}

/// Awaitable final value of a streamed call
pub struct FinalResult<F> {
    rx: oneshot::Receiver<Result<F, CoreError>>,
}

impl<F> Future for FinalResult<F> {
    type Output = Result<F, CoreError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CoreError::StreamFailure(
                "producer task ended without a result".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Result of starting a streamed call
pub struct StreamingResponse<C, F> {
    /// Chunks followed by one terminal record
    pub stream: ChunkStream<C, F>,
    /// Final value, also carried by the stream's terminal record
    pub response: FinalResult<F>,
}

impl<C, F> StreamingResponse<C, F> {
    /// Split into stream and final future
    pub fn into_parts(self) -> (ChunkStream<C, F>, FinalResult<F>) {
        (self.stream, self.response)
    }
}

/// Adapts callback-driven producers into [`StreamingResponse`]s
pub struct StreamingBridge;

impl StreamingBridge {
    /// Run `producer` on a background task and bridge its chunks.
    ///
    /// Resolves once the producer has emitted its first chunk or settled.
    /// A producer that fails before emitting anything is reported here as
    /// `CoreError::StreamFailure`; a later failure arrives as the stream's
    /// `Error` record and as the final result.
    pub async fn start<C, F, E, P, Fut>(producer: P) -> Result<StreamingResponse<C, F>, CoreError>
    where
        C: Send + 'static,
        F: Clone + Send + 'static,
        E: Display + Send + 'static,
        P: FnOnce(ChunkSender<C>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<F, E>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Signal<C, F>>();
        let (final_tx, final_rx) = oneshot::channel();

        let chunk_tx = tx.clone();
        let sender = ChunkSender::new(move |chunk| chunk_tx.send(Signal::Chunk(chunk)).is_ok());

        tokio::spawn(async move {
            let outcome = producer(sender).await.map_err(|e| e.to_string());
            let terminal = match &outcome {
                Ok(value) => Signal::Final(value.clone()),
                Err(message) => {
                    debug!(error = %message, "Streaming producer failed");
                    Signal::Error(message.clone())
                }
            };
            if tx.send(terminal).is_err() {
                trace!("Stream reader dropped before the terminal record");
            }
            let _ = final_tx.send(outcome.map_err(CoreError::StreamFailure));
        });

        match rx.recv().await {
            Some(Signal::Error(message)) => Err(CoreError::StreamFailure(message)),
            Some(first) => Ok(StreamingResponse {
                stream: ChunkStream {
                    first: Some(first),
                    rx,
                    finished: false,
                },
                response: FinalResult { rx: final_rx },
            }),
            None => Err(CoreError::StreamFailure(
                "producer stopped without a result".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn test_chunks_then_final() {
        let response = StreamingBridge::start(|sink: ChunkSender<String>| async move {
            sink.send("a".to_string());
            sink.send("b".to_string());
            Ok::<_, CoreError>("ab".to_string())
        })
        .await
        .unwrap();

        let (stream, final_result) = response.into_parts();
        let records: Vec<_> = stream.collect().await;
        assert_eq!(
            records,
            vec![
                StreamRecord::Chunk("a".to_string()),
                StreamRecord::Chunk("b".to_string()),
                StreamRecord::Final("ab".to_string()),
            ]
        );
        assert_eq!(final_result.await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_failure_after_chunk_arrives_in_stream() {
        let response = StreamingBridge::start(|sink: ChunkSender<&'static str>| async move {
            sink.send("a");
            tokio::task::yield_now().await;
            Err::<String, _>("model overloaded")
        })
        .await
        .unwrap();

        let (stream, final_result) = response.into_parts();
        let records: Vec<_> = stream.collect().await;
        assert_eq!(
            records,
            vec![
                StreamRecord::Chunk("a"),
                StreamRecord::Error("model overloaded".to_string()),
            ]
        );
        assert_eq!(
            final_result.await.unwrap_err(),
            CoreError::StreamFailure("model overloaded".to_string())
        );
    }

    #[tokio::test]
    async fn test_failure_before_any_chunk_rejects_directly() {
        let result = StreamingBridge::start(|_sink: ChunkSender<String>| async move {
            Err::<String, _>("bad request")
        })
        .await;

        match result {
            Err(CoreError::StreamFailure(message)) => assert_eq!(message, "bad request"),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected a direct rejection"),
        }
    }

    #[tokio::test]
    async fn test_no_chunks_yields_only_final() {
        let response = StreamingBridge::start(|_sink: ChunkSender<u32>| async move {
            Ok::<_, CoreError>(7u32)
        })
        .await
        .unwrap();

        let records: Vec<_> = response.stream.collect().await;
        assert_eq!(records, vec![StreamRecord::Final(7)]);
    }

    #[tokio::test]
    async fn test_producer_keeps_running_after_reader_drops() {
        let (done_tx, done_rx) = oneshot::channel();
        let response = StreamingBridge::start(move |sink: ChunkSender<u32>| async move {
            sink.send(1);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let delivered = sink.send(2);
            let _ = done_tx.send(delivered);
            Ok::<_, CoreError>(3u32)
        })
        .await
        .unwrap();

        let (mut stream, final_result) = response.into_parts();
        assert_eq!(stream.next().await, Some(StreamRecord::Chunk(1)));
        drop(stream);

        // The second send is discarded, but the producer still finishes
        assert!(!done_rx.await.unwrap());
        assert_eq!(final_result.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stream_is_unpin_and_fused_after_final() {
        fn assert_unpin<T: Unpin>(_: &T) {}

        let response = StreamingBridge::start(|sink: ChunkSender<Value>| async move {
            sink.send(Value::from(1));
            Ok::<_, CoreError>(Value::from("done"))
        })
        .await
        .unwrap();
        let mut stream = response.stream;
        assert_unpin(&stream);

        assert_eq!(stream.next().await, Some(StreamRecord::Chunk(Value::from(1))));
        assert_eq!(stream.next().await, Some(StreamRecord::Final(Value::from("done"))));
        assert_eq!(stream.next().await, None);
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn test_wire_records() {
        let chunk: StreamRecord<&str, &str> = StreamRecord::Chunk("a");
        assert_eq!(
            chunk.to_ndjson_line().unwrap(),
            "{\"type\":\"chunk\",\"data\":\"a\"}\n"
        );

        let error: StreamRecord<&str, &str> = StreamRecord::Error("boom".to_string());
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            serde_json::json!({"type": "error", "data": "boom"})
        );
        assert!(error.is_terminal());
    }

    #[test]
    fn test_mapped_sender() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = ChunkSender::new(move |s: String| tx.send(s).is_ok());
        let lengths = sender.map(|n: usize| "x".repeat(n));
        assert!(lengths.send(3));
        assert_eq!(rx.try_recv().unwrap(), "xxx");
    }
}
