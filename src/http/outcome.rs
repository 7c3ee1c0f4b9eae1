use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Result of one dispatched submission.
#[derive(Debug)]
pub enum Outcome {
    /// The registry answered. `status` may still be a non-2xx code.
    Success { status: u16, body: String },
    /// No response was obtained.
    Failure { error: AppError },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { status, .. } if (200..300).contains(status))
    }
}

#[derive(Debug)]
pub struct DispatchReport {
    pub id: Uuid,
    pub outcome: Outcome,
    pub latency_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Resolves once the dispatch for an admitted submission completes.
#[derive(Debug)]
pub struct OutcomeHandle {
    id: Uuid,
    rx: oneshot::Receiver<DispatchReport>,
}

impl OutcomeHandle {
    pub(crate) fn new(id: Uuid, rx: oneshot::Receiver<DispatchReport>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `Cancelled` only if the dispatch task was torn down before finishing,
    /// e.g. the runtime shut down.
    pub async fn wait(self) -> Result<DispatchReport> {
        self.rx.await.map_err(|_| AppError::Cancelled)
    }
}
