//! Stop handling for streaming sessions.
//!
//! A UI surface cancels a stream by posting `{stop: true}` or by going away.
//! [`AbortScope`] turns either signal into a cancelled token that adapters
//! select against while doing I/O.

use std::sync::{Arc, OnceLock};

use chatbridge_protocol::{PortRequest, StreamEvent};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::port::{Port, PortEvent};

/// Why a stream was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Stopped,
    Disconnected,
}

/// Watches a session port for stop requests and disconnects.
///
/// The watcher owns its port listener, so dropping the scope removes it.
pub struct AbortScope {
    token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
    watcher: JoinHandle<()>,
}

impl AbortScope {
    pub fn attach(port: &Port) -> Self {
        let token = CancellationToken::new();
        let reason = Arc::new(OnceLock::new());
        let mut listener = port.subscribe();
        let reply = port.clone();
        let cancel = token.clone();
        let record = reason.clone();

        let watcher = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = listener.recv() => event,
                };
                match event {
                    PortEvent::Message(value) if PortRequest::is_stop(&value) => {
                        debug!(
                            component = "abort",
                            event = "stream.stop_requested",
                            port_id = reply.id(),
                            "Stop generating"
                        );
                        let _ = record.set(AbortReason::Stopped);
                        let _ = reply.post_message(&StreamEvent::done());
                        cancel.cancel();
                        return;
                    }
                    PortEvent::Message(_) => {}
                    PortEvent::Disconnected => {
                        debug!(
                            component = "abort",
                            event = "stream.port_disconnected",
                            port_id = reply.id(),
                            "Port disconnected, aborting stream"
                        );
                        let _ = record.set(AbortReason::Disconnected);
                        cancel.cancel();
                        return;
                    }
                }
            }
        });

        Self {
            token,
            reason,
            watcher,
        }
    }

    /// Token cancelled on stop or disconnect
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Why the stream was cancelled, if it was
    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.get().copied()
    }
}

impl Drop for AbortScope {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
