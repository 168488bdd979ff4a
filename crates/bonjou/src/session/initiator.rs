//! Outbound session dialer.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use super::connection::{handshake, PendingSession};
use super::{SessionContext, SessionError};

/// Connect timeout for outbound sessions.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to `addr` and exchange PRESENCE. Failure is reported, never retried.
pub async fn dial(addr: SocketAddr, ctx: &SessionContext) -> Result<PendingSession, SessionError> {
    tracing::debug!(%addr, "dialing");
    let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(SessionError::PeerUnreachable {
                addr,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(SessionError::PeerUnreachable {
                addr,
                reason: "connect timed out".into(),
            })
        }
    };
    handshake(stream, ctx, true).await
}
