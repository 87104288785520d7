//! Concurrent tool fan-out with per-call timeouts.
//!
//! Every call is raced against its own timeout, and the whole join is raced
//! against the Run's cancel signal. Partial failure never blocks the join:
//! each call resolves to a [`ToolCall`] carrying either a value or the
//! [`ToolError`] that replaced it.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::cancellation::CancelSignal;
use crate::collaborators::ToolError;
use crate::domain::{AfterburnerError, Result};
use crate::metrics::METRICS;
use crate::obs;

/// Outcome of one external call.
#[derive(Debug, Clone)]
pub struct ToolCall<T> {
    pub tool: String,
    pub result: std::result::Result<T, ToolError>,
    pub elapsed_ms: u64,
}

/// Run `calls` concurrently; results come back in input order.
///
/// Returns `AfterburnerError::Cancelled` if `cancel` fires first. Dropping
/// the pending futures is how in-flight calls are asked to stop.
pub async fn fan_out<T, Fut>(
    run_id: &str,
    calls: Vec<(String, Fut)>,
    timeout: Duration,
    cancel: &CancelSignal,
) -> Result<Vec<ToolCall<T>>>
where
    Fut: Future<Output = std::result::Result<T, ToolError>>,
{
    if cancel.is_cancelled() {
        return Err(AfterburnerError::Cancelled);
    }

    let guarded = calls.into_iter().map(|(tool, fut)| async move {
        obs::emit_tool_called(run_id, &tool);
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(ToolError::TimedOut {
                tool: tool.clone(),
                secs: timeout.as_secs(),
            }),
        };
        if let Err(e) = &result {
            METRICS.inc_tool_failures();
            obs::emit_tool_failed(run_id, &tool, e);
        }
        ToolCall {
            tool,
            result,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    });

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AfterburnerError::Cancelled),
        calls = futures::future::join_all(guarded) => Ok(calls),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::cancel_pair;
    use futures::future::BoxFuture;
    use futures::FutureExt;

    fn call(
        name: &str,
        delay_ms: u64,
        outcome: std::result::Result<u32, ToolError>,
    ) -> (String, BoxFuture<'static, std::result::Result<u32, ToolError>>) {
        (
            name.to_string(),
            async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                outcome
            }
            .boxed(),
        )
    }

    #[tokio::test]
    async fn partial_failure_and_timeout_do_not_block_join() {
        let calls = vec![
            call("fast", 1, Ok(1)),
            call("broken", 1, Err(ToolError::failed("broken", "exit 2"))),
            call("slow", 5_000, Ok(3)),
        ];
        let out = fan_out("run", calls, Duration::from_millis(50), &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].tool, "fast");
        assert_eq!(out[0].result, Ok(1));
        assert!(matches!(out[1].result, Err(ToolError::Failed { .. })));
        assert!(matches!(out[2].result, Err(ToolError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_calls() {
        let (handle, signal) = cancel_pair();
        let calls = vec![call("slow", 5_000, Ok(1))];
        let cancel_soon = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        };
        let (res, _) = tokio::join!(
            fan_out("run", calls, Duration::from_secs(30), &signal),
            cancel_soon
        );
        assert!(matches!(res, Err(AfterburnerError::Cancelled)));
    }
}
