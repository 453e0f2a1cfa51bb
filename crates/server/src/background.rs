//! The background context: owns the dispatcher, the relays, the router and
//! the tab observer, and serves every session port that connects.

use std::sync::Arc;

use chatbridge_connector_core::{Port, PortEvent};
use chatbridge_protocol::{PortRequest, StreamEvent, TabId};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::browser::Browser;
use crate::config::ConfigStore;
use crate::credentials::CredentialSource;
use crate::dispatch::{AdapterSet, DispatchError, Dispatcher};
use crate::lifecycle::TabLifecycle;
use crate::relay::RelayRegistry;
use crate::router::{MessageSender, Router};

pub struct Background {
    dispatcher: Dispatcher,
    router: Router,
    lifecycle: TabLifecycle,
    relays: Arc<RelayRegistry>,
}

impl Background {
    pub fn new(
        config: ConfigStore,
        browser: Arc<dyn Browser>,
        credentials: Arc<dyn CredentialSource>,
        adapters: AdapterSet,
        http: reqwest::Client,
    ) -> Arc<Self> {
        let relays = Arc::new(RelayRegistry::new(browser.clone()));
        Arc::new(Self {
            dispatcher: Dispatcher::new(
                config.clone(),
                browser.clone(),
                credentials.clone(),
                adapters,
                relays.clone(),
            ),
            router: Router::new(config, browser.clone(), credentials, http),
            lifecycle: TabLifecycle::new(browser),
            relays,
        })
    }

    #[cfg(test)]
    pub fn relays(&self) -> &RelayRegistry {
        &self.relays
    }

    /// Start serving a newly connected session port.
    ///
    /// Each `{session}` posted on it is dispatched on its own task. When the
    /// port disconnects, its relay (if any) is released.
    pub fn on_port_connected(self: &Arc<Self>, port: Port) -> JoinHandle<()> {
        let background = self.clone();
        let mut listener = port.subscribe();
        info!(
            component = "background",
            event = "background.port.connected",
            port_id = port.id(),
            port_name = %port.name(),
            "Session port connected"
        );

        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    PortEvent::Message(value) => background.on_port_message(&port, &value),
                    PortEvent::Disconnected => break,
                }
            }
            drop(listener);
            let released = background.relays.remove(port.id());
            info!(
                component = "background",
                event = "background.port.disconnected",
                port_id = port.id(),
                relay_released = released,
                "Session port disconnected"
            );
        })
    }

    fn on_port_message(self: &Arc<Self>, port: &Port, value: &Value) {
        let request = PortRequest::from_value(value);
        if request.is_none() && value.get("session").is_some_and(|s| !s.is_null()) {
            warn!(
                component = "background",
                event = "background.port.bad_session",
                port_id = port.id(),
                "Session could not be decoded"
            );
            let reply = StreamEvent::error(DispatchError::UnknownModel.to_string());
            if let Err(e) = port.post_message(&reply) {
                debug!(
                    component = "background",
                    event = "background.port.report_failed",
                    port_id = port.id(),
                    error = %e,
                    "Port closed before the error could be reported"
                );
            }
            return;
        }
        let Some(session) = request.and_then(|r| r.session) else {
            // Stop requests are handled by whoever is generating.
            debug!(
                component = "background",
                event = "background.port.ignored",
                port_id = port.id(),
                stop = PortRequest::is_stop(value),
                "Port message without a session"
            );
            return;
        };
        let background = self.clone();
        let port = port.clone();
        tokio::spawn(async move {
            background.dispatcher.dispatch(&port, session).await;
        });
    }

    pub async fn on_runtime_message(&self, raw: Value, sender_tab: Option<TabId>) -> Value {
        self.router
            .handle(raw, MessageSender { tab_id: sender_tab })
            .await
    }

    pub async fn on_tab_updated(&self, tab_id: TabId, status: Option<&str>, url: Option<&str>) -> bool {
        self.lifecycle.on_tab_updated(tab_id, status, url).await
    }
}
