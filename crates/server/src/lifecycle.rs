//! Side panel upkeep for tabs that finish loading.

use std::sync::Arc;

use chatbridge_protocol::TabId;
use tracing::{debug, warn};

use crate::browser::{Browser, INDEPENDENT_PANEL_PAGE};

/// Keeps the side panel attached to tabs as they (re)load.
pub struct TabLifecycle {
    browser: Arc<dyn Browser>,
}

impl TabLifecycle {
    pub fn new(browser: Arc<dyn Browser>) -> Self {
        Self { browser }
    }

    /// Returns whether the side panel was set. Never fails: browsers without
    /// a side panel simply don't get one.
    pub async fn on_tab_updated(&self, tab_id: TabId, status: Option<&str>, url: Option<&str>) -> bool {
        if url.is_none() || status.is_some_and(|s| s != "complete") {
            debug!(
                component = "lifecycle",
                event = "lifecycle.skip",
                tab_id,
                status = ?status,
                "Skipping side panel update"
            );
            return false;
        }
        match self.browser.set_side_panel(tab_id, INDEPENDENT_PANEL_PAGE).await {
            Ok(()) => {
                debug!(
                    component = "lifecycle",
                    event = "lifecycle.side_panel_set",
                    tab_id,
                    "Side panel options set"
                );
                true
            }
            Err(e) => {
                warn!(
                    component = "lifecycle",
                    event = "lifecycle.side_panel_failed",
                    tab_id,
                    error = %e,
                    "Side panel options not set"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBrowser;

    #[tokio::test]
    async fn completed_loads_get_the_side_panel() {
        let browser = FakeBrowser::new();
        let lifecycle = TabLifecycle::new(browser.clone());

        assert!(lifecycle.on_tab_updated(3, Some("complete"), Some("https://a.test")).await);
        assert!(lifecycle.on_tab_updated(4, None, Some("https://b.test")).await);
        assert!(!lifecycle.on_tab_updated(5, Some("loading"), Some("https://c.test")).await);
        assert!(!lifecycle.on_tab_updated(6, Some("complete"), None).await);

        assert_eq!(
            browser.side_panels(),
            vec![
                (3, INDEPENDENT_PANEL_PAGE.to_string()),
                (4, INDEPENDENT_PANEL_PAGE.to_string())
            ]
        );
    }

    #[tokio::test]
    async fn side_panel_failures_are_swallowed() {
        let browser = FakeBrowser::new();
        browser.fail_side_panel();
        let lifecycle = TabLifecycle::new(browser.clone());
        assert!(!lifecycle.on_tab_updated(3, Some("complete"), Some("https://a.test")).await);
        assert!(browser.side_panels().is_empty());
    }
}
