//! Bounded, order-preserving fan-out
//!
//! Items are launched in index order with at most `limit` in flight. After
//! the first failure nothing new is launched, but invocations already in
//! flight run to completion. The launched items therefore always form a
//! prefix of the input.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt::{self, Display};
use std::future::Future;
use tracing::debug;

use super::context::{decode, outcome_of, step_failure, FlowContext, FlowResult};
use crate::domain::operation::{StepKey, StepOutcome};

/// First failing item of a fan-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutFailure<E> {
    /// Input index of the failed item
    pub index: usize,
    /// Its error
    pub error: E,
}

impl<E: Display> Display for FanOutFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item {} failed: {}", self.index, self.error)
    }
}

impl<E: fmt::Debug + Display> std::error::Error for FanOutFailure<E> {}

/// Run `f` over `items` and return every slot's outcome.
///
/// `None` marks items that were never launched because an earlier
/// invocation failed.
pub async fn map_settled<I, T, E, F, Fut>(
    items: Vec<I>,
    limit: usize,
    f: F,
) -> Vec<Option<Result<T, E>>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let limit = limit.max(1);
    let mut slots: Vec<Option<Result<T, E>>> = (0..items.len()).map(|_| None).collect();
    let mut queued = items.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();
    let mut failed = false;

    loop {
        while !failed && in_flight.len() < limit {
            match queued.next() {
                Some((index, item)) => {
                    let invocation = f(item);
                    in_flight.push(async move { (index, invocation.await) });
                }
                None => break,
            }
        }

        match in_flight.next().await {
            Some((index, result)) => {
                if result.is_err() && !failed {
                    debug!(index, "Fan-out item failed; launching no further items");
                    failed = true;
                }
                slots[index] = Some(result);
            }
            None => break,
        }
    }

    slots
}

/// Run `f` over `items`, at most `limit` at a time, returning results in
/// input order regardless of completion order.
///
/// Fails with the lowest-index error once every launched item has settled;
/// the other results are discarded.
pub async fn map<I, T, E, F, Fut>(items: Vec<I>, limit: usize, f: F) -> Result<Vec<T>, FanOutFailure<E>>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let settled = map_settled(items, limit, f).await;
    let mut values = Vec::with_capacity(settled.len());
    for (index, slot) in settled.into_iter().enumerate() {
        match slot {
            Some(Ok(value)) => values.push(value),
            Some(Err(error)) => return Err(FanOutFailure { index, error }),
            // Unlaunched slots only follow a failure, which comes first
            None => break,
        }
    }
    Ok(values)
}

impl FlowContext {
    /// Memoized fan-out. Item `i` is recorded as step `(name, base + i)`,
    /// where `base` is the number of earlier reaches of `name` in this run.
    ///
    /// On replay recorded items are served from the tape and only missing
    /// ones are launched. A recorded failure surfaces without launching
    /// anything. `concurrency` 0 uses the configured default.
    ///
    /// When an item fails, records stop at the lowest failing index, so
    /// the next reach of `name` takes the index right after it.
    pub async fn map<I, T, E, F, Fut>(
        &mut self,
        name: &str,
        items: Vec<I>,
        concurrency: usize,
        f: F,
    ) -> FlowResult<Vec<T>>
    where
        I: Send,
        T: Serialize + DeserializeOwned + Send,
        E: Display + Send,
        F: Fn(I) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.check_halted()?;
        let base = self.peek_occurrence(name);
        let key_of = move |index: usize| StepKey::new(name, base + index as u32);
        let total = items.len();

        let mut values: Vec<Option<Value>> = Vec::with_capacity(total);
        let mut missing = Vec::new();
        for (index, item) in items.into_iter().enumerate() {
            let key = key_of(index);
            match self.take_recorded(&key) {
                Some(StepOutcome::Ok(value)) => values.push(Some(value)),
                Some(StepOutcome::Err(message)) => {
                    self.reserve_keys(name, index as u32 + 1);
                    return Err(step_failure(&key, message));
                }
                None => {
                    values.push(None);
                    missing.push((index, item));
                }
            }
        }

        if let Some((first, _)) = missing.first() {
            self.enter_fresh(&key_of(*first))?;

            let limit = match concurrency {
                0 => self.engine().config().default_concurrency,
                n => n,
            };
            debug!(
                operation_id = %self.operation_id(),
                step = name,
                items = missing.len(),
                limit,
                "Fanning out"
            );

            let (indexes, fresh): (Vec<usize>, Vec<I>) = missing.into_iter().unzip();
            let settled = map_settled(fresh, limit, &f).await;

            for (index, slot) in indexes.into_iter().zip(settled) {
                let Some(result) = slot else { break };
                let key = key_of(index);
                let outcome = outcome_of(result);
                self.record(key.clone(), outcome.clone());
                match outcome {
                    StepOutcome::Ok(value) => values[index] = Some(value),
                    StepOutcome::Err(message) => {
                        // Later siblings are discarded unrecorded
                        self.reserve_keys(name, index as u32 + 1);
                        return Err(step_failure(&key, message));
                    }
                }
            }
        }

        self.reserve_keys(name, total as u32);
        values
            .into_iter()
            .enumerate()
            .map(|(index, value)| decode(&key_of(index), value.unwrap_or(Value::Null)))
            .collect()
    }
}
