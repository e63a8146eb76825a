pub mod machine;
pub mod processor;
pub mod progress;
pub mod store;
pub mod transfer;

pub use machine::{BatchManager, BatchReporter, CancelOutcome, StartOutcome, SubmitError};
pub use processor::RelayProcessor;
pub use store::{ActiveTaskStore, TaskStatus};
pub use transfer::TransferExecutor;
