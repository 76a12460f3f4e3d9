use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

use crate::errors::{ContainerError, ContainerResult};

/// Per-attempt connect budget while probing a listener.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Find a free host port by bind-probing upward from `start_port`. The
/// listener is closed before returning, so the caller can lose the race to
/// another process; callers that do will fail later and come back here.
pub async fn allocate(start_port: u16) -> ContainerResult<u16> {
    let mut port = start_port;
    loop {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                drop(listener);
                return Ok(bound);
            }
            Err(_) => {
                port = port
                    .checked_add(1)
                    .ok_or(ContainerError::PortsExhausted(start_port))?;
            }
        }
    }
}

/// Poll `host:port` with TCP connects until something accepts or the budget
/// runs out.
pub async fn await_listener(
    host: &str,
    port: u16,
    total: Duration,
    interval: Duration,
) -> ContainerResult<()> {
    let deadline = Instant::now() + total;
    loop {
        if let Ok(Ok(_)) = timeout(PROBE_TIMEOUT, TcpStream::connect((host, port))).await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ContainerError::ReadyTimeout {
                host: host.to_string(),
                port,
                waited_secs: total.as_secs(),
            });
        }
        sleep(interval).await;
    }
}
