// src/dispatcher_client.rs
//
// Reconnecting client to the upstream dispatcher bus. The wire protocol for
// that bus (login, service registration, RPC framing) is out of scope here
// — only the reconnect/resume behavior matters, so the bus itself is a
// trait, `DispatcherTransport`, generalizing `communication.rs`'s envelope
// (`GeneralMessage`'s `msg_type`/`payload`) into a connect/login/resume-
// services surface a real transport would implement. `NullDispatcherTransport`
// always fails to connect, so the daemon is fully runnable and testable
// without a real bus.

use crate::log;
use crate::logger::LogLevel;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// What `serviced` needs from an upstream control bus connection. A real
/// implementation would log in as the `serviced` principal and register
/// `serviced.management`/`serviced.control` as callable services there.
///
/// Methods return boxed futures rather than using `async fn` directly so
/// the trait stays object-safe for `Arc<dyn DispatcherTransport>` without
/// pulling in an extra proc-macro dependency for a four-method trait.
pub trait DispatcherTransport: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<(), String>>;
    fn login(&self) -> BoxFuture<'_, Result<(), String>>;
    fn resume_services(&self) -> BoxFuture<'_, Result<(), String>>;
    /// Awaits disconnect (`CONNECTION_CLOSED` or `LOGOUT`); returns once the
    /// connection has dropped so the caller can reconnect.
    fn run_until_disconnected(&self) -> BoxFuture<'_, String>;
}

pub struct NullDispatcherTransport;

impl DispatcherTransport for NullDispatcherTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async { Err("no dispatcher bus configured".to_string()) })
    }

    fn login(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async { Err("no dispatcher bus configured".to_string()) })
    }

    fn resume_services(&self) -> BoxFuture<'_, Result<(), String>> {
        Box::pin(async { Err("no dispatcher bus configured".to_string()) })
    }

    fn run_until_disconnected(&self) -> BoxFuture<'_, String> {
        Box::pin(async {
            std::future::pending::<()>().await;
            unreachable!()
        })
    }
}

/// Runs the reconnect loop forever on its own task: connect, log in, resume
/// services, then wait for disconnect and retry after a 1-second sleep.
/// Failures here never block the supervisor's event loop — `state` is how
/// the rest of the daemon observes connectivity without awaiting this loop
/// directly.
pub async fn run(transport: Arc<dyn DispatcherTransport>, state: watch::Sender<ConnectionState>) {
    loop {
        if let Err(err) = transport.connect().await {
            log!(LogLevel::Warn, "dispatcher connect failed: {}", err);
            let _ = state.send(ConnectionState::Disconnected);
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        if let Err(err) = transport.login().await {
            log!(LogLevel::Warn, "dispatcher login failed: {}", err);
            let _ = state.send(ConnectionState::Disconnected);
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        if let Err(err) = transport.resume_services().await {
            log!(LogLevel::Warn, "dispatcher resume_services failed: {}", err);
        }

        let _ = state.send(ConnectionState::Connected);
        log!(LogLevel::Info, "dispatcher bus connected");

        let reason = transport.run_until_disconnected().await;
        log!(LogLevel::Warn, "dispatcher bus disconnected: {}", reason);
        let _ = state.send(ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_transport_never_connects() {
        let transport = NullDispatcherTransport;
        assert!(transport.connect().await.is_err());
        assert!(transport.login().await.is_err());
        assert!(transport.resume_services().await.is_err());
    }

    #[tokio::test]
    async fn run_reports_disconnected_when_transport_cannot_connect() {
        let (tx, mut rx) = watch::channel(ConnectionState::Disconnected);
        let transport: Arc<dyn DispatcherTransport> = Arc::new(NullDispatcherTransport);

        let handle = tokio::spawn(run(transport, tx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert_eq!(*rx.borrow_and_update(), ConnectionState::Disconnected);
    }
}
