//! The browser platform the background process runs against.
//!
//! Everything the background needs from the browser (tabs, windows, cookies,
//! menus, side panel) goes through [`Browser`], so the relay, dispatcher and
//! router never depend on a concrete host.

use async_trait::async_trait;
use chatbridge_connector_core::Port;
use chatbridge_protocol::{TabId, WindowId};
use serde::Serialize;
use thiserror::Error;

/// Page the side panel and chat window load
pub const INDEPENDENT_PANEL_PAGE: &str = "IndependentPanel.html";

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("No tab with id: {0}")]
    TabNotFound(TabId),

    #[error("Could not establish connection to tab {0}. Receiving end does not exist.")]
    NoReceiver(TabId),

    #[error("No window with id: {0}")]
    WindowNotFound(WindowId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    Normal,
    Popup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: TabId,
    pub window_id: WindowId,
    pub url: Option<String>,
    pub active: bool,
    pub pinned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateTab {
    pub url: String,
    pub pinned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabUpdate {
    pub active: Option<bool>,
    pub pinned: Option<bool>,
}

impl TabUpdate {
    pub fn activate() -> Self {
        Self {
            active: Some(true),
            ..Default::default()
        }
    }

    pub fn pin() -> Self {
        Self {
            pinned: Some(true),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateWindow {
    pub url: String,
    pub window_type: WindowType,
    pub width: u32,
    pub height: u32,
}

/// Browser APIs used by the background process
#[async_trait]
pub trait Browser: Send + Sync {
    /// Look up a tab; fails when the tab no longer exists.
    async fn get_tab(&self, tab_id: TabId) -> Result<TabInfo, PlatformError>;

    /// Open a port to the content script of a tab.
    async fn connect_tab(&self, tab_id: TabId, name: &str) -> Result<Port, PlatformError>;

    async fn create_tab(&self, options: CreateTab) -> Result<TabInfo, PlatformError>;

    async fn update_tab(&self, tab_id: TabId, update: TabUpdate) -> Result<TabInfo, PlatformError>;

    async fn query_tabs(&self, url: &str, window_type: WindowType) -> Vec<TabInfo>;

    async fn focus_window(&self, window_id: WindowId) -> Result<(), PlatformError>;

    async fn create_window(&self, options: CreateWindow) -> Result<WindowId, PlatformError>;

    async fn get_cookie(&self, url: &str, name: &str) -> Result<Option<String>, PlatformError>;

    /// Open a URL the way the current platform prefers (new tab by default).
    async fn open_url(&self, url: &str) -> Result<(), PlatformError>;

    async fn refresh_menu(&self) -> Result<(), PlatformError>;

    async fn set_side_panel(&self, tab_id: TabId, path: &str) -> Result<(), PlatformError>;

    /// Absolute URL of an extension page
    fn extension_url(&self, path: &str) -> String;
}
