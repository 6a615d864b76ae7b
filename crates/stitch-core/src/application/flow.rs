use async_trait::async_trait;
use serde_json::Value;

use super::context::{FlowContext, FlowResult};

/// A named, resumable computation.
///
/// `run` is re-executed from the top on every resume. For a fixed sequence
/// of external inputs it must make the same step and suspension calls in the
/// same order; step bodies themselves may have arbitrary side effects.
///
/// ```ignore
/// struct Greeting;
///
/// #[async_trait]
/// impl Flow for Greeting {
///     fn name(&self) -> &str {
///         "greeting"
///     }
///
///     async fn run(&self, ctx: &mut FlowContext, input: Value) -> FlowResult<Value> {
///         let name: String = ctx
///             .run_step("lookup", || async { Ok::<_, String>("world".to_string()) })
///             .await?;
///         Ok(json!(format!("hello {}", name)))
///     }
/// }
/// ```
#[async_trait]
pub trait Flow: Send + Sync {
    /// Name the flow is registered and started under
    fn name(&self) -> &str;

    /// Flow body
    async fn run(&self, ctx: &mut FlowContext, input: Value) -> FlowResult<Value>;
}
