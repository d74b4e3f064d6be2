//! Transfer jobs: one per file moving in or out of this node.
//!
//! An [`IncomingTransfer`] owns the destination file and its chunk list and
//! runs one downloader session per connection. An [`OutgoingTransfer`]
//! serves a source file to whoever asks. The [`TransferRegistry`] routes
//! inbound sessions to jobs by token and reaps jobs that went quiet.

pub mod config;
pub mod error;
pub mod incoming;
pub mod outgoing;
pub mod pool;
pub mod registry;
pub mod state;

pub use config::TransferConfig;
pub use error::JobError;
pub use incoming::IncomingTransfer;
pub use outgoing::OutgoingTransfer;
pub use pool::{SessionPool, SessionSlot};
pub use registry::{TransferJob, TransferRegistry};
pub use state::{JobState, TransferProgress};
