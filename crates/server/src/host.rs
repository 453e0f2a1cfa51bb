//! The browser as this host models it.
//!
//! Tabs and windows live in in-memory registries. A tab becomes reachable for
//! `connect_tab` once its content script attaches an endpoint; proxy ports are
//! then handed to that endpoint, which bridges them over its socket.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chatbridge_connector_core::{Port, PortListener};
use chatbridge_protocol::{TabId, WindowId};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::browser::{
    Browser, CreateTab, CreateWindow, PlatformError, TabInfo, TabUpdate, WindowType,
};

/// Window that tabs without an explicit window land in
pub const MAIN_WINDOW_ID: WindowId = 1;

/// Content-script end of a proxy port, already listening when the background
/// end is handed out
pub struct ContentPort {
    pub port: Port,
    pub listener: PortListener,
}

/// Proxy ports waiting to be bridged to one attached content script
pub struct TabEndpoint {
    pub tab_id: TabId,
    generation: u64,
    pub ports: mpsc::UnboundedReceiver<ContentPort>,
}

struct Attachment {
    generation: u64,
    ports: mpsc::UnboundedSender<ContentPort>,
}

pub struct HostBrowser {
    extension_base: String,
    tabs: DashMap<TabId, TabInfo>,
    windows: DashMap<WindowId, WindowType>,
    endpoints: DashMap<TabId, Attachment>,
    /// Keyed by (origin, cookie name)
    cookies: DashMap<(String, String), String>,
    side_panels: DashMap<TabId, String>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

fn origin_of(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    if authority.is_empty() {
        return None;
    }
    Some(format!("{}://{}", scheme.to_ascii_lowercase(), authority.to_ascii_lowercase()))
}

impl HostBrowser {
    pub fn new(extension_base: impl Into<String>) -> Self {
        let windows = DashMap::new();
        windows.insert(MAIN_WINDOW_ID, WindowType::Normal);
        Self {
            extension_base: extension_base.into().trim_end_matches('/').to_string(),
            tabs: DashMap::new(),
            windows,
            endpoints: DashMap::new(),
            cookies: DashMap::new(),
            side_panels: DashMap::new(),
            next_id: AtomicU64::new(1000),
            next_generation: AtomicU64::new(1),
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn insert_tab(&self, window_id: WindowId, url: String, pinned: bool) -> TabInfo {
        let tab = TabInfo {
            id: self.allocate_id(),
            window_id,
            url: Some(url),
            active: true,
            pinned,
        };
        for mut other in self.tabs.iter_mut() {
            if other.window_id == window_id {
                other.active = false;
            }
        }
        self.tabs.insert(tab.id, tab.clone());
        tab
    }

    /// Register the content script of `tab_id`. A later attach for the same
    /// tab replaces this one.
    pub fn attach_tab(&self, tab_id: TabId, url: Option<String>) -> TabEndpoint {
        self.tabs
            .entry(tab_id)
            .and_modify(|tab| {
                if url.is_some() {
                    tab.url = url.clone();
                }
            })
            .or_insert_with(|| TabInfo {
                id: tab_id,
                window_id: MAIN_WINDOW_ID,
                url: url.clone(),
                active: false,
                pinned: false,
            });

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let replaced = self
            .endpoints
            .insert(tab_id, Attachment { generation, ports: tx })
            .is_some();
        info!(
            component = "host",
            event = "host.tab.attached",
            tab_id,
            replaced,
            "Content script attached"
        );
        TabEndpoint {
            tab_id,
            generation,
            ports: rx,
        }
    }

    /// Unregister an endpoint, unless a newer attach already replaced it.
    pub fn detach_tab(&self, endpoint: &TabEndpoint) {
        let removed = self
            .endpoints
            .remove_if(&endpoint.tab_id, |_, a| a.generation == endpoint.generation)
            .is_some();
        debug!(
            component = "host",
            event = "host.tab.detached",
            tab_id = endpoint.tab_id,
            removed,
            "Content script detached"
        );
    }

    /// Remember cookies a content script reported for its page.
    pub fn store_cookies(&self, tab_id: TabId, cookies: BTreeMap<String, String>) {
        let Some(origin) = self
            .tabs
            .get(&tab_id)
            .and_then(|tab| tab.url.as_deref().and_then(origin_of))
        else {
            debug!(
                component = "host",
                event = "host.cookies.no_origin",
                tab_id,
                "Dropping cookies for a tab without a URL"
            );
            return;
        };
        for (name, value) in cookies {
            self.cookies.insert((origin.clone(), name), value);
        }
    }

    #[cfg(test)]
    pub fn side_panel(&self, tab_id: TabId) -> Option<String> {
        self.side_panels.get(&tab_id).map(|p| p.clone())
    }
}

#[async_trait]
impl Browser for HostBrowser {
    async fn get_tab(&self, tab_id: TabId) -> Result<TabInfo, PlatformError> {
        self.tabs
            .get(&tab_id)
            .map(|t| t.clone())
            .ok_or(PlatformError::TabNotFound(tab_id))
    }

    async fn connect_tab(&self, tab_id: TabId, name: &str) -> Result<Port, PlatformError> {
        if !self.tabs.contains_key(&tab_id) {
            return Err(PlatformError::TabNotFound(tab_id));
        }
        let attachment = self
            .endpoints
            .get(&tab_id)
            .ok_or(PlatformError::NoReceiver(tab_id))?;
        let (background, content) = Port::pair(name);
        let listener = content.subscribe();
        attachment
            .ports
            .send(ContentPort {
                port: content,
                listener,
            })
            .map_err(|_| PlatformError::NoReceiver(tab_id))?;
        debug!(
            component = "host",
            event = "host.tab.connected",
            tab_id,
            port_id = background.id(),
            port_name = %name,
            "Opened port to content script"
        );
        Ok(background)
    }

    async fn create_tab(&self, options: CreateTab) -> Result<TabInfo, PlatformError> {
        Ok(self.insert_tab(MAIN_WINDOW_ID, options.url, options.pinned))
    }

    async fn update_tab(&self, tab_id: TabId, update: TabUpdate) -> Result<TabInfo, PlatformError> {
        let window_id = self
            .tabs
            .get(&tab_id)
            .map(|t| t.window_id)
            .ok_or(PlatformError::TabNotFound(tab_id))?;
        if update.active == Some(true) {
            for mut other in self.tabs.iter_mut() {
                if other.window_id == window_id && other.id != tab_id {
                    other.active = false;
                }
            }
        }
        let mut tab = self
            .tabs
            .get_mut(&tab_id)
            .ok_or(PlatformError::TabNotFound(tab_id))?;
        if let Some(active) = update.active {
            tab.active = active;
        }
        if let Some(pinned) = update.pinned {
            tab.pinned = pinned;
        }
        Ok(tab.clone())
    }

    async fn query_tabs(&self, url: &str, window_type: WindowType) -> Vec<TabInfo> {
        let mut tabs: Vec<_> = self
            .tabs
            .iter()
            .filter(|t| t.url.as_deref() == Some(url))
            .filter(|t| self.windows.get(&t.window_id).is_some_and(|w| *w == window_type))
            .map(|t| t.clone())
            .collect();
        tabs.sort_by_key(|t| t.id);
        tabs
    }

    async fn focus_window(&self, window_id: WindowId) -> Result<(), PlatformError> {
        if !self.windows.contains_key(&window_id) {
            return Err(PlatformError::WindowNotFound(window_id));
        }
        info!(
            component = "host",
            event = "host.window.focused",
            window_id,
            "Window focused"
        );
        Ok(())
    }

    async fn create_window(&self, options: CreateWindow) -> Result<WindowId, PlatformError> {
        let window_id = self.allocate_id();
        self.windows.insert(window_id, options.window_type);
        let tab = self.insert_tab(window_id, options.url, false);
        info!(
            component = "host",
            event = "host.window.created",
            window_id,
            tab_id = tab.id,
            window_type = ?options.window_type,
            width = options.width,
            height = options.height,
            "Window created"
        );
        Ok(window_id)
    }

    async fn get_cookie(&self, url: &str, name: &str) -> Result<Option<String>, PlatformError> {
        Ok(origin_of(url).and_then(|origin| {
            self.cookies
                .get(&(origin, name.to_string()))
                .map(|v| v.clone())
        }))
    }

    async fn open_url(&self, url: &str) -> Result<(), PlatformError> {
        self.insert_tab(MAIN_WINDOW_ID, url.to_string(), false);
        Ok(())
    }

    async fn refresh_menu(&self) -> Result<(), PlatformError> {
        info!(
            component = "host",
            event = "host.menu.refreshed",
            "Context menu refreshed"
        );
        Ok(())
    }

    async fn set_side_panel(&self, tab_id: TabId, path: &str) -> Result<(), PlatformError> {
        if !self.tabs.contains_key(&tab_id) {
            return Err(PlatformError::TabNotFound(tab_id));
        }
        self.side_panels.insert(tab_id, path.to_string());
        Ok(())
    }

    fn extension_url(&self, path: &str) -> String {
        format!("{}/{}", self.extension_base, path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatbridge_connector_core::PortEvent;
    use serde_json::json;

    fn host() -> HostBrowser {
        HostBrowser::new("http://127.0.0.1:4747/extension/")
    }

    #[tokio::test]
    async fn connect_requires_an_attached_content_script() {
        let host = host();
        assert!(matches!(
            host.connect_tab(5, "proxy").await,
            Err(PlatformError::TabNotFound(5))
        ));

        let endpoint = host.attach_tab(5, Some("https://chatgpt.com/".into()));
        host.detach_tab(&endpoint);
        assert!(matches!(
            host.connect_tab(5, "proxy").await,
            Err(PlatformError::NoReceiver(5))
        ));
    }

    #[tokio::test]
    async fn proxy_ports_reach_the_latest_endpoint() {
        let host = host();
        let stale = host.attach_tab(5, Some("https://chatgpt.com/".into()));
        let mut endpoint = host.attach_tab(5, None);
        // The stale endpoint must not unregister its replacement.
        host.detach_tab(&stale);

        let background = host.connect_tab(5, "proxy").await.unwrap();
        background.post_value(json!({ "ping": 1 })).unwrap();
        let mut content = endpoint.ports.recv().await.expect("content end");
        assert_eq!(content.port.name(), "proxy");
        assert_eq!(
            content.listener.recv().await,
            PortEvent::Message(json!({ "ping": 1 }))
        );
        assert_eq!(
            host.get_tab(5).await.unwrap().url.as_deref(),
            Some("https://chatgpt.com/")
        );
    }

    #[tokio::test]
    async fn windows_tabs_and_queries() {
        let host = host();
        let url = host.extension_url("IndependentPanel.html");
        assert_eq!(url, "http://127.0.0.1:4747/extension/IndependentPanel.html");

        let window_id = host
            .create_window(CreateWindow {
                url: url.clone(),
                window_type: WindowType::Popup,
                width: 500,
                height: 650,
            })
            .await
            .unwrap();
        host.create_tab(CreateTab {
            url: url.clone(),
            pinned: false,
        })
        .await
        .unwrap();

        let popups = host.query_tabs(&url, WindowType::Popup).await;
        assert_eq!(popups.len(), 1);
        assert_eq!(popups[0].window_id, window_id);
        assert!(host.focus_window(window_id).await.is_ok());
        assert!(matches!(
            host.focus_window(9).await,
            Err(PlatformError::WindowNotFound(9))
        ));

        let first = host.create_tab(CreateTab::default()).await.unwrap();
        let second = host.create_tab(CreateTab::default()).await.unwrap();
        assert!(!host.get_tab(first.id).await.unwrap().active);
        let updated = host.update_tab(first.id, TabUpdate::activate()).await.unwrap();
        assert!(updated.active);
        assert!(!host.get_tab(second.id).await.unwrap().active);
        assert!(host.update_tab(first.id, TabUpdate::pin()).await.unwrap().pinned);

        host.set_side_panel(first.id, "IndependentPanel.html").await.unwrap();
        assert_eq!(host.side_panel(first.id).as_deref(), Some("IndependentPanel.html"));
        assert_eq!(host.side_panel(second.id), None);
        assert!(matches!(
            host.set_side_panel(77, "IndependentPanel.html").await,
            Err(PlatformError::TabNotFound(77))
        ));
    }

    #[tokio::test]
    async fn cookies_are_scoped_to_the_origin() {
        let host = host();
        let _endpoint = host.attach_tab(3, Some("https://claude.ai/chats".into()));
        host.store_cookies(3, BTreeMap::from([("sessionKey".to_string(), "sk".to_string())]));

        assert_eq!(
            host.get_cookie("https://claude.ai", "sessionKey").await.unwrap(),
            Some("sk".to_string())
        );
        assert_eq!(host.get_cookie("https://claude.ai/x", "other").await.unwrap(), None);
        assert_eq!(host.get_cookie("https://bard.google.com", "sessionKey").await.unwrap(), None);
    }
}
