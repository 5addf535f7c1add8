use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thirtyfour::prelude::*;
use thirtyfour::WindowHandle;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::error::{RelayError, RelayResult};
use crate::protocol::Envelope;
use crate::tabs::{Tab, TabHost};

/// Name of the hook an application page exposes to accept relayed envelopes.
pub const INGRESS_HOOK: &str = "__applicationIngress";

const DIRECT_SCRIPT: &str = r#"
    const hook = window[arguments[0]];
    if (typeof hook !== 'function') { return false; }
    hook(JSON.parse(arguments[1]));
    return true;
"#;

const INJECT_SCRIPT: &str = r#"
    window.localStorage.setItem(arguments[0], arguments[1]);
    window.dispatchEvent(new StorageEvent('storage', {
        key: arguments[0],
        newValue: arguments[1],
        storageArea: window.localStorage,
    }));
    return true;
"#;

fn transport(e: WebDriverError) -> RelayError {
    RelayError::Transport(format!("webdriver: {}", e))
}

/// Tabs of a browser session driven over WebDriver.
///
/// WebDriver addresses one window at a time, so every operation switches to
/// its window while holding `focus`. Tabs hand `focus` out as their drive
/// lock, which serializes relay attempts across windows.
pub struct WebDriverTabHost {
    driver: WebDriver,
    focus: Arc<Mutex<()>>,
}

impl WebDriverTabHost {
    pub async fn connect(server_url: &str) -> Result<Self> {
        let caps = DesiredCapabilities::chrome();
        let driver = WebDriver::new(server_url, caps)
            .await
            .with_context(|| format!("Failed to connect to WebDriver at {}", server_url))?;
        Ok(Self {
            driver,
            focus: Arc::new(Mutex::new(())),
        })
    }

    /// Open `url` in the session's current window.
    pub async fn navigate(&self, url: &str) -> Result<()> {
        let _focus = self.focus.lock().await;
        self.driver
            .goto(url)
            .await
            .with_context(|| format!("Failed to navigate to {}", url))
    }

    pub async fn quit(self) -> Result<()> {
        self.driver.quit().await.context("Failed to end WebDriver session")
    }
}

#[async_trait]
impl TabHost for WebDriverTabHost {
    async fn tabs(&self) -> RelayResult<Vec<Arc<dyn Tab>>> {
        let _focus = self.focus.lock().await;
        let handles = self.driver.windows().await.map_err(transport)?;

        let mut tabs: Vec<Arc<dyn Tab>> = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Err(e) = self.driver.switch_to_window(handle.clone()).await {
                warn!(error = %e, "window vanished while listing tabs");
                continue;
            }
            let url = match self.driver.current_url().await {
                Ok(url) => url,
                Err(e) => {
                    warn!(error = %e, "could not read window url");
                    continue;
                }
            };
            debug!(window = %handle, %url, "found window");
            tabs.push(Arc::new(WebDriverTab {
                id: handle.to_string(),
                handle,
                url,
                driver: self.driver.clone(),
                focus: self.focus.clone(),
            }));
        }
        Ok(tabs)
    }
}

struct WebDriverTab {
    id: String,
    handle: WindowHandle,
    url: Url,
    driver: WebDriver,
    focus: Arc<Mutex<()>>,
}

impl WebDriverTab {
    /// Caller holds `focus`.
    async fn run(&self, script: &str, args: Vec<Value>) -> RelayResult<Value> {
        self.driver
            .switch_to_window(self.handle.clone())
            .await
            .map_err(transport)?;
        let ret = self.driver.execute(script, args).await.map_err(transport)?;
        Ok(ret.json().clone())
    }
}

#[async_trait]
impl Tab for WebDriverTab {
    fn id(&self) -> &str {
        &self.id
    }

    fn url(&self) -> &Url {
        &self.url
    }

    async fn send_message(&self, envelope: &Envelope) -> RelayResult<()> {
        let payload =
            serde_json::to_string(envelope).map_err(|e| RelayError::Validation(e.to_string()))?;
        let accepted = self
            .run(
                DIRECT_SCRIPT,
                vec![Value::from(INGRESS_HOOK), Value::from(payload)],
            )
            .await?;
        if accepted.as_bool() == Some(true) {
            Ok(())
        } else {
            Err(RelayError::Transport(format!(
                "tab {}: receiving end does not exist",
                self.id
            )))
        }
    }

    async fn inject_deposit(&self, key: &str, value: &str) -> RelayResult<()> {
        self.run(INJECT_SCRIPT, vec![Value::from(key), Value::from(value)])
            .await?;
        Ok(())
    }

    fn drive_lock(&self) -> Option<Arc<Mutex<()>>> {
        Some(self.focus.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Needs a chromedriver listening on localhost:9515
    async fn test_lists_session_windows() {
        let host = WebDriverTabHost::connect("http://localhost:9515")
            .await
            .expect("Failed to connect");
        host.navigate("about:blank").await.unwrap();
        let tabs = host.tabs().await.unwrap();
        assert!(!tabs.is_empty());
        host.quit().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Needs a chromedriver listening on localhost:9515
    async fn test_page_without_hook_rejects_direct_message() {
        use crate::models::CapturedRecord;

        let host = WebDriverTabHost::connect("http://localhost:9515")
            .await
            .expect("Failed to connect");
        host.navigate("data:text/html,<p>plain</p>").await.unwrap();
        let tab = host.tabs().await.unwrap().remove(0);
        let envelope = Envelope::job_application(CapturedRecord::new("Acme", "Engineer"));
        assert!(tab.send_message(&envelope).await.is_err());
        host.quit().await.unwrap();
    }
}
