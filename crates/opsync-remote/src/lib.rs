//! # opsync Remote
//!
//! HTTP client for the remote durable store used for bulk load/save and as
//! the acknowledgement point for queued operations.
//!
//! ## Encoding Rules
//!
//! - **Field keys**: base64url-encoded WITHOUT padding
//! - **Collection names**: percent-encoded path segments

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod encoding;

pub use client::{decode_operation_log, ClientError, RemoteStore, RemoteStoreConfig};
pub use encoding::{decode_key, encode_key, snapshot_key, EncodingError};
