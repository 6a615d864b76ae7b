use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use stitch::prelude::*;
use stitch::runtime::{generate_stream, EchoModel, MemoryOperationStore};
use stitch::monitoring::LogExt;

/// Expense approval: price the claim, ask a human, then book it
struct ExpenseApproval {
    model: Arc<dyn Model>,
}

#[async_trait]
impl Flow for ExpenseApproval {
    fn name(&self) -> &str {
        "expense-approval"
    }

    async fn run(&self, ctx: &mut FlowContext, input: Value) -> FlowResult<Value> {
        let amount = input["amount"].as_f64().unwrap_or(0.0);
        let with_tax: f64 = ctx
            .run_step("apply-tax", move || async move {
                Ok::<_, String>((amount * 1.2 * 100.0).round() / 100.0)
            })
            .await?;

        let summary = ctx
            .generate(
                "summarize",
                self.model.clone(),
                ModelRequest::new(format!("expense claim of {} pending review", with_tax)),
            )
            .await?;

        let approved: bool = ctx
            .wait_for_input("manager-approval", json!({"type": "boolean"}))
            .await?;

        Ok(json!({
            "total": with_tax,
            "summary": summary.text,
            "approved": approved,
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let monitoring = Monitoring::new(MonitoringConfig::from_env());
    monitoring.start()?;

    let config = EngineConfig::from_env().context("Invalid engine configuration")?;
    let store = Arc::new(MemoryOperationStore::new());
    let engine = FlowEngine::builder(store)
        .config(config)
        .event_handler(monitoring.event_handler())
        .build()?;
    engine.register(ExpenseApproval {
        model: Arc::new(EchoModel),
    });
    info!(flows = ?engine.flow_names(), "Flows registered");

    let started = engine
        .start("expense-approval", json!({"amount": 41.5}))
        .await?;
    info!(
        operation_id = %started.id,
        status = %started.status,
        "Expense claim submitted"
    );

    // Wrong input type is rejected and leaves the operation waiting
    let rejected = engine
        .resume(&started.id, "manager-approval", json!("sure"))
        .await
        .log_err("Approval rejected");
    if rejected.is_ok() {
        warn!("Invalid approval input was accepted");
    }

    let finished = engine
        .resume(&started.id, "manager-approval", json!(true))
        .await?;
    println!("{}", serde_json::to_string_pretty(&finished)?);

    let response = generate_stream(Arc::new(EchoModel), ModelRequest::new("stream this reply"))
        .await?;
    let mut records = response.stream;
    while let Some(record) = records.next().await {
        println!("{}", record.to_ndjson_line()?);
    }

    info!(metrics = ?monitoring.snapshot(), "Demo finished");
    monitoring.stop();
    Ok(())
}
