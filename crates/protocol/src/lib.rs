pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use types::{FailureReason, TransferState};
