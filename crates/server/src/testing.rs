//! In-memory stand-ins for the browser, credential helpers and adapters.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chatbridge_connector_core::{
    Adapter, ConnectorError, GenerateRequest, Port, PortListener,
};
use chatbridge_protocol::{StreamEvent, TabId, WindowId};
use tokio::time::Instant;

use crate::browser::{
    Browser, CreateTab, CreateWindow, PlatformError, TabInfo, TabUpdate, WindowType,
};
use crate::credentials::{CredentialError, CredentialSource};

/// The content-script side of a proxy port the relay opened
pub struct ContentEnd {
    /// End handed to the background
    pub background: Port,
    pub content: Port,
    /// Subscribed before the background could post anything
    pub listener: PortListener,
}

#[derive(Default)]
struct FakeState {
    tabs: BTreeMap<TabId, TabInfo>,
    window_types: BTreeMap<WindowId, WindowType>,
    unreachable: HashSet<TabId>,
    content: BTreeMap<TabId, Vec<ContentEnd>>,
    connects: Vec<(TabId, Instant)>,
    calls: Vec<String>,
    cookies: BTreeMap<(String, String), String>,
    side_panels: Vec<(TabId, String)>,
    side_panel_failing: bool,
    next_id: u64,
}

pub struct FakeBrowser {
    state: Mutex<FakeState>,
}

impl FakeBrowser {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                next_id: 100,
                ..Default::default()
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn add_tab(&self, tab_id: TabId, url: &str) {
        let mut state = self.state();
        state.window_types.entry(1).or_insert(WindowType::Normal);
        state.tabs.insert(
            tab_id,
            TabInfo {
                id: tab_id,
                window_id: 1,
                url: Some(url.to_string()),
                active: false,
                pinned: false,
            },
        );
    }

    pub fn add_popup(&self, tab_id: TabId, window_id: WindowId, url: &str) {
        let mut state = self.state();
        state.window_types.insert(window_id, WindowType::Popup);
        state.tabs.insert(
            tab_id,
            TabInfo {
                id: tab_id,
                window_id,
                url: Some(url.to_string()),
                active: true,
                pinned: false,
            },
        );
    }

    /// Make `connect_tab` fail for a tab that still exists (content script gone)
    pub fn set_unreachable(&self, tab_id: TabId, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(tab_id);
        } else {
            state.unreachable.remove(&tab_id);
        }
    }

    /// Newest proxy opened to a tab
    pub fn take_content(&self, tab_id: TabId) -> Option<ContentEnd> {
        self.state().content.get_mut(&tab_id)?.pop()
    }

    pub fn connect_times(&self, tab_id: TabId) -> Vec<Instant> {
        self.state()
            .connects
            .iter()
            .filter(|(id, _)| *id == tab_id)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn tab(&self, tab_id: TabId) -> Option<TabInfo> {
        self.state().tabs.get(&tab_id).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn set_cookie(&self, url: &str, name: &str, value: &str) {
        self.state()
            .cookies
            .insert((url.to_string(), name.to_string()), value.to_string());
    }

    pub fn side_panels(&self) -> Vec<(TabId, String)> {
        self.state().side_panels.clone()
    }

    pub fn fail_side_panel(&self) {
        self.state().side_panel_failing = true;
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn get_tab(&self, tab_id: TabId) -> Result<TabInfo, PlatformError> {
        self.tab(tab_id).ok_or(PlatformError::TabNotFound(tab_id))
    }

    async fn connect_tab(&self, tab_id: TabId, name: &str) -> Result<Port, PlatformError> {
        let mut state = self.state();
        state.connects.push((tab_id, Instant::now()));
        if !state.tabs.contains_key(&tab_id) {
            return Err(PlatformError::TabNotFound(tab_id));
        }
        if state.unreachable.contains(&tab_id) {
            return Err(PlatformError::NoReceiver(tab_id));
        }
        let (background, content) = Port::pair(name);
        let listener = content.subscribe();
        state.content.entry(tab_id).or_default().push(ContentEnd {
            background: background.clone(),
            content,
            listener,
        });
        Ok(background)
    }

    async fn create_tab(&self, options: CreateTab) -> Result<TabInfo, PlatformError> {
        self.record(format!("create_tab {} pinned={}", options.url, options.pinned));
        let mut state = self.state();
        state.next_id += 1;
        let tab = TabInfo {
            id: state.next_id,
            window_id: 1,
            url: Some(options.url),
            active: true,
            pinned: options.pinned,
        };
        state.tabs.insert(tab.id, tab.clone());
        Ok(tab)
    }

    async fn update_tab(&self, tab_id: TabId, update: TabUpdate) -> Result<TabInfo, PlatformError> {
        self.record(format!(
            "update_tab {tab_id} active={:?} pinned={:?}",
            update.active, update.pinned
        ));
        let mut state = self.state();
        let tab = state
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
        let state = self.state();
        state
            .tabs
            .values()
            .filter(|tab| tab.url.as_deref().is_some_and(|u| u.starts_with(url)))
            .filter(|tab| state.window_types.get(&tab.window_id) == Some(&window_type))
            .cloned()
            .collect()
    }

    async fn focus_window(&self, window_id: WindowId) -> Result<(), PlatformError> {
        self.record(format!("focus_window {window_id}"));
        if self.state().window_types.contains_key(&window_id) {
            Ok(())
        } else {
            Err(PlatformError::WindowNotFound(window_id))
        }
    }

    async fn create_window(&self, options: CreateWindow) -> Result<WindowId, PlatformError> {
        self.record(format!(
            "create_window {} {:?} {}x{}",
            options.url, options.window_type, options.width, options.height
        ));
        let window_id = {
            let mut state = self.state();
            state.next_id += 1;
            state.next_id
        };
        let tab_id = window_id + 1000;
        if options.window_type == WindowType::Popup {
            self.add_popup(tab_id, window_id, &options.url);
        } else {
            self.state().window_types.insert(window_id, options.window_type);
        }
        Ok(window_id)
    }

    async fn get_cookie(&self, url: &str, name: &str) -> Result<Option<String>, PlatformError> {
        Ok(self
            .state()
            .cookies
            .get(&(url.to_string(), name.to_string()))
            .cloned())
    }

    async fn open_url(&self, url: &str) -> Result<(), PlatformError> {
        self.record(format!("open_url {url}"));
        Ok(())
    }

    async fn refresh_menu(&self) -> Result<(), PlatformError> {
        self.record("refresh_menu".to_string());
        Ok(())
    }

    async fn set_side_panel(&self, tab_id: TabId, path: &str) -> Result<(), PlatformError> {
        let mut state = self.state();
        if state.side_panel_failing {
            return Err(PlatformError::TabNotFound(tab_id));
        }
        state.side_panels.push((tab_id, path.to_string()));
        Ok(())
    }

    fn extension_url(&self, path: &str) -> String {
        format!("chrome-extension://test/{path}")
    }
}

#[derive(Default)]
pub struct FakeCredentials {
    pub chatgpt: Option<String>,
    pub bing: Option<String>,
    pub claude: Option<String>,
    pub bard: Option<BTreeMap<String, String>>,
}

#[async_trait]
impl CredentialSource for FakeCredentials {
    async fn chatgpt_access_token(&self) -> Result<String, CredentialError> {
        self.chatgpt
            .clone()
            .ok_or(CredentialError::Missing("ChatGPT access token"))
    }

    async fn bing_access_token(&self) -> Result<String, CredentialError> {
        self.bing
            .clone()
            .ok_or(CredentialError::Missing("Bing access token"))
    }

    async fn claude_session_key(&self) -> Result<String, CredentialError> {
        self.claude
            .clone()
            .ok_or(CredentialError::Missing("Claude session key"))
    }

    async fn bard_cookies(&self) -> Result<BTreeMap<String, String>, CredentialError> {
        self.bard
            .clone()
            .ok_or(CredentialError::Missing("Gemini cookies"))
    }
}

/// Adapter that answers with a fixed text, or fails
pub struct FakeAdapter {
    reply: Result<String, String>,
    pub requests: Mutex<Vec<GenerateRequest>>,
}

impl FakeAdapter {
    pub fn answering(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(message.to_string()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Adapter for FakeAdapter {
    async fn generate(&self, port: &Port, request: GenerateRequest) -> Result<(), ConnectorError> {
        self.requests.lock().unwrap().push(request.clone());
        let text = self.reply.clone().map_err(ConnectorError::Provider)?;
        let mut session = request.session;
        let question = session.question.clone();
        port.post_message(&StreamEvent::answer(text.clone()))?;
        session.push_record(&question, &text);
        port.post_message(&StreamEvent::finished(session))?;
        Ok(())
    }
}
