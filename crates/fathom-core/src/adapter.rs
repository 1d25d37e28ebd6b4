//! The uniform operation set every debug adapter implements, plus the stop
//! synchronization helper both adapters share.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LaunchConfig;
use crate::error::{DebugError, DebugResult};
use crate::{BreakpointResult, EvaluateResult, SourceBreakpoint, StackFrame, StopResult, Variable};

/// Bound on every wait for the debuggee to come to rest after a resume.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// One wire protocol + one runtime family behind the uniform operation set.
///
/// Adapters are created idle and armed by [`start`](Self::start). All state
/// lives behind interior mutability so a started adapter can be shared.
#[async_trait]
pub trait DebugAdapter: Send + Sync {
    /// Spawn the debuggee, establish the transport, perform the protocol
    /// handshake, and arm the initial entry-point pause.
    async fn start(&self, config: &LaunchConfig) -> DebugResult<()>;

    /// Wait for the entry-point pause armed by `start`. Idempotent: once the
    /// armed pause has been consumed, returns a bare "entry" result.
    async fn wait_for_initial_pause(&self) -> DebugResult<StopResult>;

    /// Replace the breakpoint set for `file`. Returns one result per
    /// requested breakpoint, in request order.
    async fn set_breakpoints(
        &self,
        file: &Path,
        breakpoints: &[SourceBreakpoint],
    ) -> DebugResult<Vec<BreakpointResult>>;

    /// Continue execution and wait for the next pause or termination.
    async fn resume(&self, thread_id: Option<i64>) -> DebugResult<StopResult>;
    async fn step_over(&self, thread_id: Option<i64>) -> DebugResult<StopResult>;
    async fn step_in(&self, thread_id: Option<i64>) -> DebugResult<StopResult>;
    async fn step_out(&self, thread_id: Option<i64>) -> DebugResult<StopResult>;

    async fn call_stack(&self, thread_id: Option<i64>) -> DebugResult<Vec<StackFrame>>;

    /// Variables of one frame, filtered by scope name (adapter default when
    /// `scope` is `None`). `max_depth` bounds the expandability hint only; no
    /// recursive expansion is performed.
    async fn variables(
        &self,
        frame_id: Option<i64>,
        scope: Option<&str>,
        max_depth: u32,
    ) -> DebugResult<Vec<Variable>>;

    async fn evaluate(&self, expression: &str, frame_id: Option<i64>)
        -> DebugResult<EvaluateResult>;

    /// Tear everything down: protocol goodbye where the protocol has one,
    /// transport close, child kill. Idempotent, best-effort, never errors on
    /// already-dead resources.
    async fn disconnect(&self);

    /// Subscribe to debuggee-pause events. Every pause and the final
    /// termination are delivered to all receivers subscribed at that moment.
    fn subscribe_stops(&self) -> broadcast::Receiver<StopResult>;
}

/// Wait on an already-subscribed stop receiver.
///
/// The receiver MUST be subscribed before the resume command is written to
/// the wire; a pause event arriving before subscription is gone for good.
/// Resolves on the next stop event, on `terminated` (debuggee or transport
/// gone: a terminated stop result), or on `timeout`.
pub async fn await_stop(
    mut stops: broadcast::Receiver<StopResult>,
    terminated: &CancellationToken,
    timeout: Duration,
) -> DebugResult<StopResult> {
    let deadline = Instant::now() + timeout;
    loop {
        tokio::select! {
            _ = terminated.cancelled() => return Ok(StopResult::terminated()),
            received = tokio::time::timeout_at(deadline, stops.recv()) => match received {
                Ok(Ok(stop)) => return Ok(stop),
                // Missed intermediate events; the next one is still a stop.
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Ok(StopResult::terminated());
                }
                Err(_) => {
                    return Err(DebugError::Timeout(
                        "Timed out waiting for debugger to stop".to_string(),
                    ));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn await_stop_returns_the_next_event() {
        let (tx, _) = broadcast::channel(8);
        let token = CancellationToken::new();
        let rx = tx.subscribe();

        let mut stop = StopResult::entry();
        stop.thread_id = Some(7);
        tx.send(stop.clone()).unwrap();

        let got = await_stop(rx, &token, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, stop);
    }

    #[tokio::test]
    async fn await_stop_resolves_terminated_on_cancel() {
        let (tx, _) = broadcast::channel::<StopResult>(8);
        let token = CancellationToken::new();
        let rx = tx.subscribe();
        token.cancel();

        let got = await_stop(rx, &token, Duration::from_secs(1)).await.unwrap();
        assert!(got.terminated);
    }

    #[tokio::test]
    async fn await_stop_times_out() {
        let (tx, _) = broadcast::channel::<StopResult>(8);
        let token = CancellationToken::new();
        let rx = tx.subscribe();

        let err = await_stop(rx, &token, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Timed out waiting for debugger to stop"
        );
        drop(tx);
    }
}
