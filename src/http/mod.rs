pub mod gate;
pub mod outcome;
pub mod pool;
pub mod rate_limiter;

pub use gate::SubmissionGate;
pub use outcome::{DispatchReport, Outcome, OutcomeHandle};
pub use rate_limiter::PermitPool;
