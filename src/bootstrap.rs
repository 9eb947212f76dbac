use std::io;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("no free port in {host}:{first}..={last} after {attempts} attempts: {source}")]
    Exhausted {
        host: String,
        first: u16,
        last: u16,
        attempts: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Bind a listener on `host:port`, moving to the next port while the address is in use.
///
/// Only `AddrInUse` triggers a retry; any other bind error fails immediately.
pub async fn bind_with_retry(host: &str, port: u16, attempts: u16) -> Result<TcpListener, BootstrapError> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    let mut last_port = port;

    for offset in 0..attempts {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        last_port = candidate;
        let addr = format!("{}:{}", host, candidate);

        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                if offset > 0 {
                    info!("Bound {} after {} port conflict(s)", addr, offset);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!("Port {} already in use, trying next port", candidate);
                last_err = Some(e);
            }
            Err(e) => return Err(BootstrapError::Bind { addr, source: e }),
        }
    }

    Err(BootstrapError::Exhausted {
        host: host.to_string(),
        first: port,
        last: last_port,
        attempts,
        source: last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "port range exhausted")),
    })
}
