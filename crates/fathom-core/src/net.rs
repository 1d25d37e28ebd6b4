//! Loopback port helpers used when spawning debuggees.

use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::{DebugError, DebugResult};

pub const PORT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ask the OS for a currently-unused loopback port.
///
/// The listener is closed before returning, so the port can be handed to a
/// child process. Racy by design; callers reattempt on bind failure.
pub fn find_free_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Poll until something accepts TCP connections on `127.0.0.1:port`.
pub async fn wait_for_port(port: u16, timeout: Duration) -> DebugResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(DebugError::Timeout(format!(
                "timed out waiting for port {port} to accept connections"
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
