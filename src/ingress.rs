use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::Backend;
use crate::channel::StorageChange;
use crate::error::{RelayError, RelayResult};
use crate::models::{CapturedRecord, RecordIdentity};
use crate::protocol::{APPLICATIONS_ROUTE, SENTINEL_KEY};
use crate::reconcile::CacheReconciler;
use crate::store::LocalStore;
use crate::tabs::AppContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressChannel {
    Message,
    Storage,
    Loopback,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngressOutcome {
    /// Accepted by the backend.
    Forwarded(Value),
    /// The backend already had it.
    AlreadyStored,
    /// Seen earlier on this or another channel.
    Suppressed,
    Rejected(RelayError),
    ForwardFailed(RelayError),
}

/// Application-side sink for every inbound delivery channel.
pub struct IngressListener {
    backend: Arc<dyn Backend>,
    cache: Arc<CacheReconciler>,
    forward_timeout: Duration,
    seen: Mutex<HashSet<RecordIdentity>>,
}

impl IngressListener {
    pub fn new(
        backend: Arc<dyn Backend>,
        cache: Arc<CacheReconciler>,
        forward_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            cache,
            forward_timeout,
            seen: Mutex::new(HashSet::new()),
        })
    }

    /// Forward one record to the backend. Failures are logged and reported
    /// to the caller of this method only.
    pub async fn on_incoming(&self, record: CapturedRecord, via: IngressChannel) -> IngressOutcome {
        if let Err(e) = record.validate() {
            warn!(?via, error = %e, "dropping malformed record");
            return IngressOutcome::Rejected(e);
        }

        let identity = record.identity();
        if !self.claim(&identity) {
            debug!(?via, %identity, "suppressed duplicate delivery");
            return IngressOutcome::Suppressed;
        }

        let forwarded = match timeout(self.forward_timeout, self.backend.submit_application(&record)).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        match forwarded {
            Ok(data) => {
                info!(?via, company = %record.company, position = %record.position, "forwarded record");
                self.remember(&record).await;
                IngressOutcome::Forwarded(data)
            }
            Err(RelayError::Duplicate(detail)) => {
                info!(?via, %detail, "record already stored");
                self.remember(&record).await;
                IngressOutcome::AlreadyStored
            }
            Err(e) => {
                warn!(?via, error = %e, "forwarding failed");
                self.release(&identity);
                IngressOutcome::ForwardFailed(e)
            }
        }
    }

    fn claim(&self, identity: &RecordIdentity) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(identity.clone()),
            Err(_) => true,
        }
    }

    fn release(&self, identity: &RecordIdentity) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.remove(identity);
        }
    }

    async fn remember(&self, record: &CapturedRecord) {
        if let Err(e) = self.cache.record_application(record).await {
            warn!(error = %e, "failed to cache application");
        }
    }

    /// Decode a storage change carrying a relay payload.
    pub fn decode_change(change: &StorageChange) -> Option<CapturedRecord> {
        if change.key != SENTINEL_KEY {
            return None;
        }
        let value = change.new_value.as_deref()?;
        match serde_json::from_str(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "undecodable relay payload");
                None
            }
        }
    }

    async fn consume_deposit(&self, store: &dyn LocalStore, change: &StorageChange) {
        let Some(record) = Self::decode_change(change) else {
            return;
        };
        self.on_incoming(record, IngressChannel::Storage).await;

        // Clear the sentinel unless a newer deposit replaced it.
        match store.get(SENTINEL_KEY) {
            Ok(current) if current == change.new_value => {
                if let Err(e) = store.remove(SENTINEL_KEY) {
                    warn!(error = %e, "failed to clear relay payload");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to read relay payload"),
        }
    }

    /// Process a payload sitting under the sentinel key, if any. Covers
    /// deposits made before attaching and change signals lost to lag.
    async fn consume_pending(&self, store: &dyn LocalStore) {
        match store.get(SENTINEL_KEY) {
            Ok(Some(value)) => {
                let pending = StorageChange {
                    key: SENTINEL_KEY.to_string(),
                    new_value: Some(value),
                };
                self.consume_deposit(store, &pending).await;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to check for pending relay payload"),
        }
    }

    /// Register on the context's message inbox and storage channel. A payload
    /// deposited before attaching is picked up first. The task ends once the
    /// context's listener is unregistered.
    pub fn attach(self: &Arc<Self>, ctx: Arc<AppContext>) -> JoinHandle<()> {
        let mut inbox = ctx.register_listener();
        let mut changes = ctx.storage().subscribe();
        let listener = Arc::clone(self);

        tokio::spawn(async move {
            listener.consume_pending(ctx.store().as_ref()).await;

            loop {
                tokio::select! {
                    envelope = inbox.recv() => {
                        let Some(envelope) = envelope else { break };
                        listener
                            .on_incoming(envelope.into_record(), IngressChannel::Message)
                            .await;
                    }
                    change = changes.recv() => match change {
                        Ok(change) => listener.consume_deposit(ctx.store().as_ref(), &change).await,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "storage listener lagged, rechecking sentinel");
                            listener.consume_pending(ctx.store().as_ref()).await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("ingress listener detached");
        })
    }
}

// --- Loopback route ---

#[derive(Debug, Clone, PartialEq)]
pub struct LoopbackResponse {
    pub status: u16,
    pub body: Value,
}

/// Dispatches calls aimed at the application's own ingestion route to the
/// ingress listener in-process; everything else goes over the network.
pub struct LoopbackRouter {
    listener: Arc<IngressListener>,
    ingest: Url,
    client: reqwest::Client,
}

impl LoopbackRouter {
    pub fn new(listener: Arc<IngressListener>, app_url: &Url, client: reqwest::Client) -> RelayResult<Self> {
        let ingest = app_url
            .join(APPLICATIONS_ROUTE)
            .map_err(|e| RelayError::Validation(format!("bad application url {}: {}", app_url, e)))?;
        Ok(Self {
            listener,
            ingest,
            client,
        })
    }

    pub fn ingest_url(&self) -> &Url {
        &self.ingest
    }

    pub fn routes_locally(&self, method: &str, url: &Url) -> bool {
        method.eq_ignore_ascii_case("POST")
            && url.origin() == self.ingest.origin()
            && url.path().trim_end_matches('/') == self.ingest.path()
    }

    pub async fn send(&self, method: &str, url: &str, body: &str) -> RelayResult<LoopbackResponse> {
        let url = Url::parse(url)
            .map_err(|e| RelayError::Validation(format!("bad url '{}': {}", url, e)))?;

        if self.routes_locally(method, &url) {
            debug!(%url, "dispatching ingestion call in-process");
            return Ok(self.dispatch(body).await);
        }

        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|e| RelayError::Validation(format!("bad method '{}': {}", method, e)))?;
        let response = self
            .client
            .request(method, url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(LoopbackResponse { status, body })
    }

    async fn dispatch(&self, body: &str) -> LoopbackResponse {
        let record = match serde_json::from_str::<CapturedRecord>(body) {
            Ok(record) => record,
            Err(e) => {
                return LoopbackResponse {
                    status: 400,
                    body: json!({ "success": false, "error": format!("invalid record: {}", e) }),
                };
            }
        };

        match self.listener.on_incoming(record, IngressChannel::Loopback).await {
            IngressOutcome::Forwarded(data) => LoopbackResponse {
                status: 201,
                body: json!({ "success": true, "data": data }),
            },
            IngressOutcome::Suppressed => LoopbackResponse {
                status: 200,
                body: json!({ "success": true, "message": "already received" }),
            },
            IngressOutcome::AlreadyStored => LoopbackResponse {
                status: 409,
                body: json!({ "success": false, "error": "Application already exists" }),
            },
            IngressOutcome::Rejected(e) => LoopbackResponse {
                status: 400,
                body: json!({ "success": false, "error": e.to_string() }),
            },
            IngressOutcome::ForwardFailed(e) => LoopbackResponse {
                status: 502,
                body: json!({ "success": false, "error": e.to_string() }),
            },
        }
    }
}
