use async_trait::async_trait;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::channel::StorageChannel;
use crate::error::{RelayError, RelayResult};
use crate::protocol::Envelope;
use crate::store::LocalStore;

/// An open browser tab the relay can reach.
#[async_trait]
pub trait Tab: Send + Sync {
    fn id(&self) -> &str;
    fn url(&self) -> &Url;

    /// Deliver the envelope to a listener running in the tab. Fails when the
    /// tab has no listener registered.
    async fn send_message(&self, envelope: &Envelope) -> RelayResult<()>;

    /// Write `value` under `key` into the tab's local store and raise a
    /// storage-change signal for it inside the tab.
    async fn inject_deposit(&self, key: &str, value: &str) -> RelayResult<()>;

    /// Lock shared by tabs that can only be driven one at a time. Callers
    /// hold it for a whole attempt; the tab itself does not take it.
    fn drive_lock(&self) -> Option<Arc<tokio::sync::Mutex<()>>> {
        None
    }
}

#[async_trait]
pub trait TabHost: Send + Sync {
    async fn tabs(&self) -> RelayResult<Vec<Arc<dyn Tab>>>;
}

/// An application instance living in this process: its own local store,
/// its own storage channel, and an optional message listener.
pub struct AppContext {
    id: String,
    url: Url,
    store: Arc<dyn LocalStore>,
    storage: StorageChannel,
    inbox: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
}

impl AppContext {
    pub fn new(id: &str, url: Url, store: Arc<dyn LocalStore>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            url,
            store,
            storage: StorageChannel::default(),
            inbox: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn storage(&self) -> &StorageChannel {
        &self.storage
    }

    /// Register the tab's message listener, replacing any previous one.
    pub fn register_listener(&self) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inbox) = self.inbox.lock() {
            *inbox = Some(tx);
        }
        rx
    }

    pub fn unregister_listener(&self) {
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.take();
        }
    }
}

#[async_trait]
impl Tab for AppContext {
    fn id(&self) -> &str {
        &self.id
    }

    fn url(&self) -> &Url {
        &self.url
    }

    async fn send_message(&self, envelope: &Envelope) -> RelayResult<()> {
        let inbox = self
            .inbox
            .lock()
            .map_err(|_| RelayError::Transport("tab inbox lock poisoned".to_string()))?;
        let Some(tx) = inbox.as_ref() else {
            return Err(RelayError::Transport(format!(
                "tab {}: receiving end does not exist",
                self.id
            )));
        };
        tx.send(envelope.clone()).map_err(|_| {
            RelayError::Transport(format!("tab {}: listener went away", self.id))
        })
    }

    async fn inject_deposit(&self, key: &str, value: &str) -> RelayResult<()> {
        self.store.set(key, value)?;
        let seen = self.storage.publish(key, Some(value));
        debug!(tab = %self.id, key, subscribers = seen, "deposited payload");
        Ok(())
    }
}

/// Tabs opened in this process.
#[derive(Default)]
pub struct InProcessTabHost {
    tabs: RwLock<Vec<Arc<dyn Tab>>>,
}

impl InProcessTabHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, tab: Arc<dyn Tab>) {
        if let Ok(mut tabs) = self.tabs.write() {
            tabs.push(tab);
        }
    }

    pub fn close(&self, id: &str) {
        if let Ok(mut tabs) = self.tabs.write() {
            tabs.retain(|tab| tab.id() != id);
        }
    }
}

#[async_trait]
impl TabHost for InProcessTabHost {
    async fn tabs(&self) -> RelayResult<Vec<Arc<dyn Tab>>> {
        let tabs = self
            .tabs
            .read()
            .map_err(|_| RelayError::Transport("tab list lock poisoned".to_string()))?;
        Ok(tabs.clone())
    }
}
