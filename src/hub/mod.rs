//! The hub: the operations the network layer calls.
//!
//! This module provides the six external operations (create branch, branch
//! history, list branches, upload, download, list databases) on top of the
//! storage layer, plus input validation.

mod api;
mod ingest;

pub use api::{Download, Hub, HubError, HubResult, Revision};
pub use ingest::{parse_client_time, UploadReceipt, UploadRequest};
