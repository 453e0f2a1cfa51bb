//! Tab relay: forwards a UI port to a content script in another tab.
//!
//! Each primary (UI) port that talks to a hosted web session gets one relay
//! actor. The actor owns every listener it installs, the proxy port opened to
//! the tab, the reconnect counter and the retry deadline, so tearing it down
//! (primary disconnect or registry removal) cancels all of them at once.
//!
//! When the tab's content script goes away (reload, navigation) the relay
//! reconnects with exponential backoff: 1s, 2s, 4s, 8s, 16s. After the fifth
//! failed attempt it gives up and tells the UI once.

use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use arc_swap::ArcSwap;
use chatbridge_connector_core::{Port, PortError, PortEvent, PortId, PortListener};
use chatbridge_protocol::{StreamEvent, TabId};
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::browser::{Browser, PlatformError};

pub const PROXY_PORT_NAME: &str = "background-to-content-script-proxy";
pub const MAX_ATTEMPTS: u32 = 5;
pub const BASE_DELAY_MS: u64 = 1000;
pub const BACKOFF_MULTIPLIER: u64 = 2;

pub const TAB_LOST_ERROR: &str =
    "Connection to ChatGPT tab lost after 5 attempts. Please refresh the page.";
pub const FORWARD_FAILED_ERROR: &str =
    "Failed to forward message to target tab. Tab might be closed or an extension error occurred.";
pub const BIND_FAILED_ERROR: &str =
    "Failed to communicate with ChatGPT tab. Try refreshing the page.";

/// Delay before reconnect attempt `attempt` (1-based)
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let factor = BACKOFF_MULTIPLIER.saturating_pow(exponent);
    Duration::from_millis(BASE_DELAY_MS.saturating_mul(factor))
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to connect to tab {tab_id}: {source}")]
    Connect {
        tab_id: TabId,
        #[source]
        source: PlatformError,
    },

    #[error("Failed to post to tab {tab_id}: {source}")]
    Forward {
        tab_id: TabId,
        #[source]
        source: PortError,
    },

    #[error("Relay has shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Unbound,
    Bound { tab_id: TabId },
    Retrying { tab_id: TabId, attempt: u32 },
    Exhausted { tab_id: TabId },
    TornDown,
}

/// Lock-free view of a relay's state
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub phase: RelayPhase,
    pub attempts: u32,
    pub proxy_port: Option<PortId>,
    pub forwarding: bool,
}

enum RelayCommand {
    Bind {
        tab_id: TabId,
        message: Value,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
}

/// Handle to a running relay actor (cheap to Clone).
#[derive(Clone)]
pub struct RelayHandle {
    #[cfg(test)]
    primary_id: PortId,
    command_tx: mpsc::Sender<RelayCommand>,
    #[cfg(test)]
    snapshot: Arc<ArcSwap<RelaySnapshot>>,
}

impl RelayHandle {
    pub fn spawn(primary: Port, browser: Arc<dyn Browser>) -> RelayHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        #[cfg(test)]
        let snapshot = Arc::new(ArcSwap::from_pointee(RelaySnapshot {
            phase: RelayPhase::Unbound,
            attempts: 0,
            proxy_port: None,
            forwarding: true,
        }));
        #[cfg(test)]
        let primary_id = primary.id();
        let relay = TabRelay {
            primary_listener: Some(primary.subscribe()),
            primary,
            proxy: None,
            phase: RelayPhase::Unbound,
            attempts: 0,
            retry_at: None,
            browser,
            #[cfg(test)]
            snapshot: snapshot.clone(),
        };
        tokio::spawn(relay.run(command_rx));

        RelayHandle {
            #[cfg(test)]
            primary_id,
            command_tx,
            #[cfg(test)]
            snapshot,
        }
    }

    #[cfg(test)]
    pub fn primary_id(&self) -> PortId {
        self.primary_id
    }

    /// Point the relay at `tab_id` and deliver `message` there.
    ///
    /// Already bound to that tab: the relay forwarded `message` itself when
    /// the UI posted it, so nothing more happens. Failures are reported to
    /// the UI by the relay before this returns.
    pub async fn bind(&self, tab_id: TabId, message: Value) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(RelayCommand::Bind {
                tab_id,
                message,
                reply,
            })
            .await
            .map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)?
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> Arc<RelaySnapshot> {
        self.snapshot.load_full()
    }
}

struct Proxy {
    tab_id: TabId,
    port: Port,
    listener: PortListener,
}

impl Proxy {
    fn close(self) {
        drop(self.listener);
        self.port.disconnect();
    }
}

struct TabRelay {
    primary: Port,
    primary_listener: Option<PortListener>,
    proxy: Option<Proxy>,
    phase: RelayPhase,
    attempts: u32,
    retry_at: Option<Instant>,
    browser: Arc<dyn Browser>,
    #[cfg(test)]
    snapshot: Arc<ArcSwap<RelaySnapshot>>,
}

enum Step {
    Primary(PortEvent),
    Proxy(PortEvent),
    Command(Option<RelayCommand>),
    Retry,
}

async fn next_event(listener: &mut Option<PortListener>) -> PortEvent {
    match listener {
        Some(listener) => listener.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_proxy_event(proxy: &mut Option<Proxy>) -> PortEvent {
    match proxy {
        Some(proxy) => proxy.listener.recv().await,
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl TabRelay {
    async fn run(mut self, mut command_rx: mpsc::Receiver<RelayCommand>) {
        debug!(
            component = "relay",
            event = "relay.started",
            primary_port = self.primary.id(),
            "Relay started"
        );
        while self.phase != RelayPhase::TornDown {
            // Primary traffic goes first: a bind triggered by a UI message
            // must never overtake the forward of that same message.
            let step = tokio::select! {
                biased;
                event = next_event(&mut self.primary_listener) => Step::Primary(event),
                event = next_proxy_event(&mut self.proxy) => Step::Proxy(event),
                command = command_rx.recv() => Step::Command(command),
                _ = deadline(self.retry_at) => Step::Retry,
            };

            match step {
                Step::Primary(PortEvent::Message(message)) => self.forward_to_tab(message),
                Step::Primary(PortEvent::Disconnected) => {
                    info!(
                        component = "relay",
                        event = "relay.primary_disconnected",
                        primary_port = self.primary.id(),
                        "Main port disconnected, cleaning up proxy"
                    );
                    self.tear_down();
                }
                Step::Proxy(PortEvent::Message(message)) => self.forward_to_primary(message),
                Step::Proxy(PortEvent::Disconnected) => self.on_proxy_lost(),
                Step::Command(Some(RelayCommand::Bind {
                    tab_id,
                    message,
                    reply,
                })) => {
                    let result = self.bind(tab_id, message).await;
                    let _ = reply.send(result);
                }
                Step::Command(None) => self.tear_down(),
                Step::Retry => self.retry().await,
            }
            #[cfg(test)]
            self.publish();
        }
    }

    #[cfg(test)]
    fn publish(&self) {
        self.snapshot.store(Arc::new(RelaySnapshot {
            phase: self.phase,
            attempts: self.attempts,
            proxy_port: self.proxy.as_ref().map(|p| p.port.id()),
            forwarding: self.primary_listener.is_some(),
        }));
    }

    fn forward_to_tab(&mut self, message: Value) {
        let Some(proxy) = &self.proxy else {
            warn!(
                component = "relay",
                event = "relay.forward.no_proxy",
                primary_port = self.primary.id(),
                phase = ?self.phase,
                "Port proxy not available, message dropped"
            );
            return;
        };
        if let Err(e) = proxy.port.post_value(message) {
            error!(
                component = "relay",
                event = "relay.forward.failed",
                primary_port = self.primary.id(),
                tab_id = proxy.tab_id,
                error = %e,
                "Error posting message to proxy tab"
            );
            if let Err(e) = self.primary.post_message(&StreamEvent::error(FORWARD_FAILED_ERROR)) {
                warn!(
                    component = "relay",
                    event = "relay.notify.failed",
                    error = %e,
                    "Could not report forwarding failure"
                );
            }
        }
    }

    fn forward_to_primary(&mut self, message: Value) {
        // A live proxy answering proves the connection recovered.
        if self.attempts > 0 {
            debug!(
                component = "relay",
                event = "relay.recovered",
                primary_port = self.primary.id(),
                attempts = self.attempts,
                "Proxy answered, resetting reconnect attempts"
            );
            self.attempts = 0;
        }
        if let Err(e) = self.primary.post_value(message) {
            debug!(
                component = "relay",
                event = "relay.primary.post_failed",
                primary_port = self.primary.id(),
                error = %e,
                "Dropping proxy message for closed primary"
            );
        }
    }

    fn on_proxy_lost(&mut self) {
        let tab_id = match (self.proxy.take(), self.phase) {
            (Some(proxy), _) => {
                let tab_id = proxy.tab_id;
                proxy.close();
                tab_id
            }
            (None, RelayPhase::Retrying { tab_id, .. }) => tab_id,
            (None, _) => return,
        };
        warn!(
            component = "relay",
            event = "relay.proxy_disconnected",
            primary_port = self.primary.id(),
            tab_id,
            "Proxy tab disconnected"
        );

        self.attempts += 1;
        if self.attempts > MAX_ATTEMPTS {
            error!(
                component = "relay",
                event = "relay.exhausted",
                primary_port = self.primary.id(),
                tab_id,
                max_attempts = MAX_ATTEMPTS,
                "Max reconnect attempts reached, giving up"
            );
            self.retry_at = None;
            self.primary_listener = None;
            self.phase = RelayPhase::Exhausted { tab_id };
            let _ = self.primary.post_message(&StreamEvent::error(TAB_LOST_ERROR));
            return;
        }

        let delay = backoff_delay(self.attempts);
        info!(
            component = "relay",
            event = "relay.reconnect.scheduled",
            primary_port = self.primary.id(),
            tab_id,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.retry_at = Some(Instant::now() + delay);
        self.phase = RelayPhase::Retrying {
            tab_id,
            attempt: self.attempts,
        };
    }

    async fn retry(&mut self) {
        self.retry_at = None;
        let RelayPhase::Retrying { tab_id, attempt } = self.phase else {
            return;
        };
        debug!(
            component = "relay",
            event = "relay.reconnect.attempt",
            primary_port = self.primary.id(),
            tab_id,
            attempt,
            "Retrying connection to tab"
        );
        match self.connect(tab_id).await {
            Ok(()) => {
                info!(
                    component = "relay",
                    event = "relay.reconnected",
                    primary_port = self.primary.id(),
                    tab_id,
                    attempt,
                    "Reconnected to proxy tab"
                );
            }
            Err(e) => {
                warn!(
                    component = "relay",
                    event = "relay.reconnect.failed",
                    primary_port = self.primary.id(),
                    tab_id,
                    attempt,
                    error = %e,
                    "Reconnect failed"
                );
                self.on_proxy_lost();
            }
        }
    }

    async fn bind(&mut self, tab_id: TabId, message: Value) -> Result<(), RelayError> {
        if self.phase == (RelayPhase::Bound { tab_id }) && self.proxy.is_some() {
            return Ok(());
        }

        if let Some(old) = self.proxy.take() {
            debug!(
                component = "relay",
                event = "relay.rebind",
                primary_port = self.primary.id(),
                old_tab_id = old.tab_id,
                tab_id,
                "Replacing previous proxy"
            );
            old.close();
        }
        if self.primary_listener.is_none() {
            self.primary_listener = Some(self.primary.subscribe());
        }
        self.retry_at = None;
        self.attempts = 0;

        if let Err(e) = self.connect(tab_id).await {
            error!(
                component = "relay",
                event = "relay.bind.failed",
                primary_port = self.primary.id(),
                tab_id,
                error = %e,
                "Failed to connect to ChatGPT tab"
            );
            self.phase = RelayPhase::Unbound;
            let _ = self.primary.post_message(&StreamEvent::error(BIND_FAILED_ERROR));
            return Err(e);
        }

        let posted = match &self.proxy {
            Some(proxy) => proxy.port.post_value(message),
            None => Err(PortError::Disconnected),
        };
        posted.map_err(|source| {
            error!(
                component = "relay",
                event = "relay.bind.post_failed",
                primary_port = self.primary.id(),
                tab_id,
                error = %source,
                "Error posting session to proxy tab"
            );
            let _ = self.primary.post_message(&StreamEvent::error(BIND_FAILED_ERROR));
            RelayError::Forward { tab_id, source }
        })
    }

    async fn connect(&mut self, tab_id: TabId) -> Result<(), RelayError> {
        let port = self
            .browser
            .connect_tab(tab_id, PROXY_PORT_NAME)
            .await
            .map_err(|source| RelayError::Connect { tab_id, source })?;
        let listener = port.subscribe();
        debug!(
            component = "relay",
            event = "relay.connected",
            primary_port = self.primary.id(),
            proxy_port = port.id(),
            tab_id,
            "Connected to proxy tab"
        );
        self.proxy = Some(Proxy {
            tab_id,
            port,
            listener,
        });
        self.phase = RelayPhase::Bound { tab_id };
        Ok(())
    }

    fn tear_down(&mut self) {
        self.primary_listener = None;
        if let Some(proxy) = self.proxy.take() {
            proxy.close();
        }
        self.retry_at = None;
        self.phase = RelayPhase::TornDown;
        debug!(
            component = "relay",
            event = "relay.torn_down",
            primary_port = self.primary.id(),
            "Relay torn down"
        );
    }
}

/// Relays keyed by the primary port they serve
pub struct RelayRegistry {
    relays: DashMap<PortId, RelayHandle>,
    browser: Arc<dyn Browser>,
}

impl RelayRegistry {
    pub fn new(browser: Arc<dyn Browser>) -> Self {
        Self {
            relays: DashMap::new(),
            browser,
        }
    }

    pub fn get_or_spawn(&self, primary: &Port) -> RelayHandle {
        self.relays
            .entry(primary.id())
            .or_insert_with(|| RelayHandle::spawn(primary.clone(), self.browser.clone()))
            .clone()
    }

    #[cfg(test)]
    pub fn get(&self, primary_id: PortId) -> Option<RelayHandle> {
        self.relays.get(&primary_id).map(|r| r.clone())
    }

    /// Forget a relay. Once the last handle is gone the actor tears down.
    pub fn remove(&self, primary_id: PortId) -> bool {
        self.relays.remove(&primary_id).is_some()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.relays.len()
    }
}
