// crates/git/src/lib.rs
//! Git side of the capture pipeline: repository discovery, HEAD polling,
//! commit extraction, commit–session correlation, and the service that
//! strings them together.

pub mod correlate;
pub mod discovery;
pub mod exec;
pub mod extract;
pub mod poller;
pub mod service;

pub use correlate::CorrelationEngine;
pub use discovery::discover_repositories;
pub use exec::GitError;
pub use extract::{extract_commit, extract_diff, extract_metadata};
pub use poller::{GitPoller, PollResult};
pub use service::GitCaptureService;
