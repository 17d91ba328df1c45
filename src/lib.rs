//! dbhub - versioned storage for uploaded database files
//!
//! Every upload of a database file becomes a commit on a branch. File
//! contents, directory listings (trees) and commits are content-addressed by
//! SHA-256, so identical uploads share storage and history can be verified
//! byte for byte.
//!
//! # Example
//!
//! ```no_run
//! use dbhub::config::HubConfig;
//! use dbhub::hub::{Hub, Revision, UploadRequest};
//!
//! let hub = Hub::open(HubConfig::new("./dbhub-data")).unwrap();
//! hub.upload(UploadRequest::new("a.db", std::fs::read("a.db").unwrap(), "first version")).unwrap();
//! let latest = hub.download("a.db", &Revision::DefaultBranch).unwrap();
//! ```

pub mod config;
pub mod hub;
pub mod storage;
