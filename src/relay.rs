use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::{Origin, Url};

use crate::error::{RelayError, RelayResult};
use crate::models::CapturedRecord;
use crate::protocol::{Envelope, SENTINEL_KEY};
use crate::tabs::{Tab, TabHost};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMethod {
    DirectMessage,
    Injection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayReport {
    pub candidates: usize,
    /// The first tab that acknowledged, and how it was reached.
    pub notified: Option<(String, NotifyMethod)>,
    pub last_error: Option<RelayError>,
}

impl RelayReport {
    pub fn delivered(&self) -> bool {
        self.notified.is_some()
    }

    fn nothing(candidates: usize, error: RelayError) -> Self {
        Self {
            candidates,
            notified: None,
            last_error: Some(error),
        }
    }
}

/// Fallback transport that reaches open application tabs directly.
pub struct TabRelay {
    host: Arc<dyn TabHost>,
    origins: Vec<Origin>,
    attempt_timeout: Duration,
}

impl TabRelay {
    pub fn new(host: Arc<dyn TabHost>, origins: Vec<Origin>, attempt_timeout: Duration) -> Self {
        Self {
            host,
            origins,
            attempt_timeout,
        }
    }

    pub fn is_app_url(&self, url: &Url) -> bool {
        let origin = url.origin();
        self.origins.iter().any(|known| *known == origin)
    }

    /// Notify every matching tab concurrently and return on the first
    /// acknowledgement. Attempts still in flight keep running to completion.
    pub async fn relay(&self, record: &CapturedRecord) -> RelayReport {
        let tabs = match self.host.tabs().await {
            Ok(tabs) => tabs,
            Err(e) => {
                warn!(error = %e, "could not enumerate tabs");
                return RelayReport::nothing(0, e);
            }
        };

        let candidates: Vec<Arc<dyn Tab>> = tabs
            .into_iter()
            .filter(|tab| self.is_app_url(tab.url()))
            .collect();

        if candidates.is_empty() {
            info!("no application tabs open");
            return RelayReport::nothing(
                0,
                RelayError::NoCandidateTargets("no application tabs are open".to_string()),
            );
        }

        let payload = match serde_json::to_string(record) {
            Ok(payload) => payload,
            Err(e) => {
                return RelayReport::nothing(
                    candidates.len(),
                    RelayError::Validation(e.to_string()),
                );
            }
        };
        let envelope = Envelope::job_application(record.clone());

        let count = candidates.len();
        let (tx, mut rx) = mpsc::channel(count);
        for tab in candidates {
            let tx = tx.clone();
            let envelope = envelope.clone();
            let payload = payload.clone();
            let limit = self.attempt_timeout;
            tokio::spawn(async move {
                let outcome = notify_tab(tab.as_ref(), &envelope, &payload, limit).await;
                let id = tab.id().to_string();
                // The receiver is gone once another tab has won.
                let _ = tx.send((id, outcome)).await;
            });
        }
        drop(tx);

        let mut last_error = None;
        while let Some((id, outcome)) = rx.recv().await {
            match outcome {
                Ok(method) => {
                    info!(tab = %id, ?method, "relay delivered to tab");
                    return RelayReport {
                        candidates: count,
                        notified: Some((id, method)),
                        last_error,
                    };
                }
                Err(e) => {
                    warn!(tab = %id, error = %e, "relay attempt failed");
                    last_error = Some(e);
                }
            }
        }

        RelayReport {
            candidates: count,
            notified: None,
            last_error,
        }
    }
}

async fn notify_tab(
    tab: &dyn Tab,
    envelope: &Envelope,
    payload: &str,
    limit: Duration,
) -> RelayResult<NotifyMethod> {
    // Waiting for a shared driver is not part of the attempt's budget.
    let _turn = match tab.drive_lock() {
        Some(lock) => Some(lock.lock_owned().await),
        None => None,
    };

    let direct = match timeout(limit, tab.send_message(envelope)).await {
        Ok(result) => result,
        Err(elapsed) => Err(elapsed.into()),
    };
    match direct {
        Ok(()) => return Ok(NotifyMethod::DirectMessage),
        Err(e) => debug!(tab = %tab.id(), error = %e, "direct message rejected, injecting"),
    }

    match timeout(limit, tab.inject_deposit(SENTINEL_KEY, payload)).await {
        Ok(Ok(())) => Ok(NotifyMethod::Injection),
        Ok(Err(e)) => Err(e),
        Err(elapsed) => Err(elapsed.into()),
    }
}

/// Parse configured application addresses into origins, skipping bad ones.
pub fn parse_origins(addresses: &[String]) -> Vec<Origin> {
    addresses
        .iter()
        .filter_map(|address| match Url::parse(address) {
            Ok(url) => Some(url.origin()),
            Err(e) => {
                warn!(address = %address, error = %e, "ignoring invalid application origin");
                None
            }
        })
        .collect()
}
