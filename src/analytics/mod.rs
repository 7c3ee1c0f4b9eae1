pub mod observer;
pub mod stats;

pub use observer::{LoggingObserver, OutcomeObserver};
pub use stats::Stats;
