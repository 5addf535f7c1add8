use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::RelayError;
use crate::models::CapturedRecord;
use crate::protocol::{CaptureRequest, CaptureResponse};
use crate::relay::TabRelay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Init,
    PrimaryAttempt,
    RelayAttempt,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Primary,
    Relay,
}

/// Progress of one capture through the delivery tiers.
#[derive(Debug)]
pub struct DeliveryAttempt {
    state: DeliveryState,
    tier: Option<Tier>,
    accepted: bool,
}

impl DeliveryAttempt {
    fn new() -> Self {
        Self {
            state: DeliveryState::Init,
            tier: None,
            accepted: false,
        }
    }

    fn transition(&mut self, next: DeliveryState) {
        debug!(from = ?self.state, to = ?next, "delivery state");
        self.state = next;
        self.tier = match next {
            DeliveryState::PrimaryAttempt => Some(Tier::Primary),
            DeliveryState::RelayAttempt => Some(Tier::Relay),
            _ => self.tier,
        };
    }

    fn accept(&mut self) {
        self.accepted = true;
        self.transition(DeliveryState::Delivered);
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub fn tier(&self) -> Option<Tier> {
        self.tier
    }

    pub fn accepted(&self) -> bool {
        self.accepted
    }
}

/// Owns the delivery state machine: primary backend first, then the tab
/// relay. Exactly one result is reported per capture.
pub struct CaptureAgent {
    backend: Arc<dyn Backend>,
    relay: TabRelay,
    primary_timeout: Duration,
}

impl CaptureAgent {
    pub fn new(backend: Arc<dyn Backend>, relay: TabRelay, primary_timeout: Duration) -> Self {
        Self {
            backend,
            relay,
            primary_timeout,
        }
    }

    /// Run one capture. `on_result` fires once, before the best-effort tab
    /// notification that follows a primary success. Returns the final
    /// attempt state.
    pub async fn capture<F>(&self, record: CapturedRecord, on_result: F) -> DeliveryAttempt
    where
        F: FnOnce(CaptureResponse) + Send,
    {
        let mut attempt = DeliveryAttempt::new();

        if let Err(e) = record.validate() {
            warn!(error = %e, "refusing to deliver invalid record");
            attempt.transition(DeliveryState::Failed);
            on_result(CaptureResponse::failed(e.to_string()));
            return attempt;
        }

        attempt.transition(DeliveryState::PrimaryAttempt);
        let primary = match timeout(self.primary_timeout, self.backend.submit_application(&record)).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        let primary_error = match primary {
            Ok(data) => {
                attempt.accept();
                info!(company = %record.company, position = %record.position, "delivered to backend");
                on_result(CaptureResponse::delivered(data));

                // Let open app tabs refresh; the result is already final.
                let report = self.relay.relay(&record).await;
                if !report.delivered() {
                    debug!(candidates = report.candidates, "no tab took the post-delivery notification");
                }
                return attempt;
            }
            Err(RelayError::Duplicate(detail)) => {
                info!(%detail, "backend already has this application");
                attempt.transition(DeliveryState::Failed);
                on_result(CaptureResponse::duplicate(detail));
                return attempt;
            }
            Err(e) => e,
        };

        warn!(error = %primary_error, "primary delivery failed, relaying to app tabs");
        attempt.transition(DeliveryState::RelayAttempt);
        let report = self.relay.relay(&record).await;

        if report.delivered() {
            attempt.accept();
            on_result(CaptureResponse::delivered_via_app());
        } else {
            attempt.transition(DeliveryState::Failed);
            let mut error = primary_error.to_string();
            if let Some(relay_error) = &report.last_error {
                error = format!("{}; {}", error, relay_error);
            }
            on_result(CaptureResponse::failed(error));
        }
        attempt
    }

    /// Handle a `saveJobData` request and return its response.
    pub async fn handle(&self, request: CaptureRequest) -> CaptureResponse {
        let CaptureRequest::SaveJobData { job_data } = request;
        let mut response = None;
        self.capture(job_data, |result| response = Some(result)).await;
        response.unwrap_or_else(|| CaptureResponse::failed("capture produced no result"))
    }
}
