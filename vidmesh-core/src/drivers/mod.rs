//! Object storage drivers.
//!
//! A driver mints sessions scoped to a key prefix; a session can save data
//! and can describe itself (`OsInfo`) so that other nodes can upload into
//! the same bucket using a time-limited POST policy.

pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageType {
    S3,
}

/// Portable description of a storage session, shareable with other nodes.
#[derive(Clone, Debug)]
pub struct OsInfo {
    pub storage_type: StorageType,
    pub s3_info: Option<S3OsInfo>,
}

#[derive(Clone, Debug)]
pub struct S3OsInfo {
    pub host: String,
    pub key: String,
    pub policy: String,
    pub signature: String,
    pub credential: String,
    pub x_amz_date: String,
    pub is_google: bool,
}

#[async_trait]
pub trait OsSession: Send + Sync {
    /// Save a named blob; returns the absolute URL of the stored object.
    async fn save_data(&self, name: &str, data: Bytes) -> Result<String>;

    fn get_info(&self) -> OsInfo;

    /// External sessions live outside the node; their URLs are directly
    /// fetchable by peers.
    fn is_external(&self) -> bool;
}

pub trait OsDriver: Send + Sync {
    fn new_session(&self, path: &str) -> Box<dyn OsSession>;
}

pub use s3::{GsSigner, S3Driver};
