//! Child-process plumbing shared by the adapters: output forwarding and exit
//! monitoring for the spawned debuggee.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::StopResult;

/// Drain the child's stdout/stderr into the log so debuggee output is never
/// lost and the pipes never fill up.
pub fn forward_output(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(stream = "stdout", "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(stream = "stderr", "{line}");
            }
        });
    }
}

/// Own the child until it exits or `kill` fires, then publish a terminated
/// stop result and cancel `gone` so in-flight stop waits resolve.
pub fn monitor_exit(
    mut child: Child,
    stops: broadcast::Sender<StopResult>,
    gone: CancellationToken,
    kill: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = kill.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            status = child.wait() => {
                tracing::debug!(?status, "debuggee exited");
            }
        }
        let _ = stops.send(StopResult::terminated());
        gone.cancel();
    });
}
