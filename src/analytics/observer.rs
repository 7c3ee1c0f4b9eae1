use tracing::{error, info, warn};

use crate::http::outcome::{DispatchReport, Outcome};

/// Receives one event per completed dispatch.
pub trait OutcomeObserver: Send + Sync {
    fn on_outcome(&self, report: &DispatchReport);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl OutcomeObserver for LoggingObserver {
    fn on_outcome(&self, report: &DispatchReport) {
        match &report.outcome {
            Outcome::Success { status, body } if (200..300).contains(status) => {
                info!(id = %report.id, status, latency_ms = report.latency_ms, "Response received: {}", body);
            }
            Outcome::Success { status, body } => {
                warn!(id = %report.id, status, latency_ms = report.latency_ms, "Registry rejected submission: {}", body);
            }
            Outcome::Failure { error: e } => {
                error!(id = %report.id, latency_ms = report.latency_ms, "Request failed: {}", e);
            }
        }
    }
}
