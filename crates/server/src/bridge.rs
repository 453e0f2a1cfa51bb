//! HTTP and WebSocket surface of the host.
//!
//! UI surfaces attach session ports over `/ws/port`, content scripts attach
//! their tab endpoint over `/ws/tab/{tab_id}`, and one-shot control messages
//! arrive on `/runtime/message`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chatbridge_connector_core::{Port, PortEvent, PortId, PortListener};
use chatbridge_protocol::TabId;
use futures::stream::{self, AbortHandle, Abortable, BoxStream, SelectAll};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::background::Background;
use crate::host::{ContentPort, HostBrowser};

pub const TAB_ID_HEADER: &str = "x-chatbridge-tab-id";
const DEFAULT_PORT_NAME: &str = "background";

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct HostState {
    pub background: Arc<Background>,
    pub browser: Arc<HostBrowser>,
}

/// Frames exchanged with a content script over its tab socket.
///
/// Any number of proxy ports share the socket; `port` is the id of the
/// content-script end a frame belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TabFrame {
    /// A proxy port was opened towards the tab
    Connect { port: PortId, name: String },
    Message { port: PortId, data: Value },
    Disconnect { port: PortId },
    /// Cookies of the page, reported by the content script
    Cookies { cookies: BTreeMap<String, String> },
}

#[derive(Debug, Deserialize)]
pub struct PortParams {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TabParams {
    url: Option<String>,
}

pub fn router(state: HostState) -> Router {
    Router::new()
        .route("/ws/port", get(port_ws_handler))
        .route("/ws/tab/{tab_id}", get(tab_ws_handler))
        .route("/runtime/message", post(runtime_message_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

fn sender_tab(headers: &HeaderMap) -> Option<TabId> {
    headers
        .get(TAB_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn runtime_message_handler(
    State(state): State<HostState>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Json<Value> {
    Json(
        state
            .background
            .on_runtime_message(raw, sender_tab(&headers))
            .await,
    )
}

async fn port_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<PortParams>,
    State(state): State<HostState>,
) -> impl IntoResponse {
    let name = params
        .name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_PORT_NAME.to_string());
    ws.on_upgrade(move |socket| handle_port_socket(socket, state, name))
}

/// Bridge a UI socket to one end of a fresh port; the background gets the other.
async fn handle_port_socket(socket: WebSocket, state: HostState, name: String) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    let (ui, background) = Port::pair(name);
    let mut listener = ui.subscribe();
    state.background.on_port_connected(background);
    info!(
        component = "bridge",
        event = "bridge.port.opened",
        connection_id = conn_id,
        port_id = ui.id(),
        port_name = %ui.name(),
        "Port socket opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            event = listener.recv() => match event {
                PortEvent::Message(value) => {
                    if ws_tx.send(Message::Text(value.to_string().into())).await.is_err() {
                        break;
                    }
                }
                PortEvent::Disconnected => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => {
                        if ui.post_value(value).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(
                        component = "bridge",
                        event = "bridge.port.parse_failed",
                        connection_id = conn_id,
                        error = %e,
                        "Dropping non-JSON port frame"
                    ),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(
                        component = "bridge",
                        event = "bridge.port.error",
                        connection_id = conn_id,
                        error = %e,
                        "Port socket error"
                    );
                    break;
                }
            },
        }
    }

    drop(listener);
    ui.disconnect();
    info!(
        component = "bridge",
        event = "bridge.port.closed",
        connection_id = conn_id,
        "Port socket closed"
    );
}

async fn tab_ws_handler(
    ws: WebSocketUpgrade,
    Path(tab_id): Path<TabId>,
    Query(params): Query<TabParams>,
    State(state): State<HostState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_tab_socket(socket, state, tab_id, params.url))
}

async fn send_frame<S>(ws_tx: &mut S, frame: &TabFrame) -> bool
where
    S: futures::Sink<Message> + Unpin,
{
    match serde_json::to_string(frame) {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => true,
    }
}

fn port_events(port: PortId, listener: PortListener) -> BoxStream<'static, (PortId, PortEvent)> {
    stream::unfold(Some(listener), move |listener| async move {
        let mut listener = listener?;
        let event = listener.recv().await;
        let next = (event != PortEvent::Disconnected).then_some(listener);
        Some(((port, event), next))
    })
    .boxed()
}

/// Proxy ports bridged over one tab socket, keyed by their content-side id
struct ProxyMux {
    ports: HashMap<PortId, (Port, AbortHandle)>,
    events: SelectAll<Abortable<BoxStream<'static, (PortId, PortEvent)>>>,
}

impl ProxyMux {
    fn new() -> Self {
        Self {
            ports: HashMap::new(),
            events: SelectAll::new(),
        }
    }

    /// Start bridging a proxy port; returns the frame announcing it to the tab.
    fn open(&mut self, content: ContentPort) -> TabFrame {
        let ContentPort { port, listener } = content;
        let id = port.id();
        let (events, handle) = stream::abortable(port_events(id, listener));
        self.events.push(events);
        let frame = TabFrame::Connect {
            port: id,
            name: port.name().to_string(),
        };
        self.ports.insert(id, (port, handle));
        frame
    }

    /// Next frame for the tab from whichever proxy has something to say.
    /// Pends while nothing is bridged.
    async fn next_frame(&mut self) -> TabFrame {
        match self.events.next().await {
            Some((port, PortEvent::Message(data))) => TabFrame::Message { port, data },
            Some((port, PortEvent::Disconnected)) => {
                self.ports.remove(&port);
                TabFrame::Disconnect { port }
            }
            None => std::future::pending().await,
        }
    }

    /// Deliver a message from the tab. False when no such port is bridged.
    fn post(&self, port: PortId, data: Value) -> bool {
        let Some((proxy, _)) = self.ports.get(&port) else {
            return false;
        };
        // A closed proxy reports its own disconnect through `next_frame`.
        let _ = proxy.post_value(data);
        true
    }

    /// The tab closed one proxy.
    fn close(&mut self, port: PortId) -> bool {
        match self.ports.remove(&port) {
            Some((proxy, handle)) => {
                handle.abort();
                proxy.disconnect();
                true
            }
            None => false,
        }
    }

    /// The tab went away: every proxy is lost at once.
    fn close_all(&mut self) -> usize {
        let closed = self.ports.len();
        for (_, (proxy, handle)) in self.ports.drain() {
            handle.abort();
            proxy.disconnect();
        }
        closed
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ports.len()
    }
}

/// Serve one content script: every proxy port opened towards this tab is
/// bridged over the socket until either side closes it.
async fn handle_tab_socket(socket: WebSocket, state: HostState, tab_id: TabId, url: Option<String>) {
    let mut endpoint = state.browser.attach_tab(tab_id, url.clone());
    // An attaching content script means the page finished loading.
    state
        .background
        .on_tab_updated(tab_id, Some("complete"), url.as_deref())
        .await;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut proxies = ProxyMux::new();

    loop {
        let outgoing = tokio::select! {
            content = endpoint.ports.recv() => match content {
                Some(content) => proxies.open(content),
                // A newer attach for this tab took over.
                None => break,
            },
            frame = proxies.next_frame() => frame,
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<TabFrame>(&text) {
                        Ok(TabFrame::Message { port, data }) => {
                            if !proxies.post(port, data) {
                                debug!(
                                    component = "bridge",
                                    event = "bridge.tab.unknown_port",
                                    tab_id,
                                    port_id = port,
                                    "Dropping message for a port that is not bridged"
                                );
                            }
                        }
                        Ok(TabFrame::Disconnect { port }) => {
                            proxies.close(port);
                        }
                        Ok(TabFrame::Cookies { cookies }) => state.browser.store_cookies(tab_id, cookies),
                        Ok(TabFrame::Connect { .. }) => {}
                        Err(e) => warn!(
                            component = "bridge",
                            event = "bridge.tab.parse_failed",
                            tab_id,
                            error = %e,
                            "Dropping malformed tab frame"
                        ),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(
                            component = "bridge",
                            event = "bridge.tab.error",
                            tab_id,
                            error = %e,
                            "Tab socket error"
                        );
                        break;
                    }
                }
                continue;
            },
        };
        if !send_frame(&mut ws_tx, &outgoing).await {
            break;
        }
    }

    // Closing the socket is a reload as far as the relays are concerned.
    let closed = proxies.close_all();
    state.browser.detach_tab(&endpoint);
    info!(
        component = "bridge",
        event = "bridge.tab.closed",
        tab_id,
        proxies_closed = closed,
        "Tab socket closed"
    );
}
