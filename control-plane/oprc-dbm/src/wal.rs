//! Access to archived write-ahead log data in object storage.

use std::sync::Mutex;

use tracing::warn;

use crate::crd::postgres::BackendSpec;

#[derive(thiserror::Error, Debug)]
pub enum WalError {
    #[error("storage backend error for bucket {bucket}: {message}")]
    Backend { bucket: String, message: String },
}

#[async_trait::async_trait]
pub trait WalArchive: Send + Sync {
    /// Remove every archived object under `prefix`. An empty prefix is a
    /// no-op.
    async fn purge(
        &self,
        storage: &BackendSpec,
        prefix: &str,
    ) -> Result<(), WalError>;

    /// False when purges are accepted but nothing is actually removed.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Archive used when no storage backend is wired in. Purges leave the data
/// in place and warn.
#[derive(Default)]
pub struct NoopWalArchive;

#[async_trait::async_trait]
impl WalArchive for NoopWalArchive {
    async fn purge(
        &self,
        storage: &BackendSpec,
        prefix: &str,
    ) -> Result<(), WalError> {
        warn!(
            bucket = %storage.bucket,
            %prefix,
            "wal data NOT purged: no storage backend configured"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// Records purged `bucket/prefix` paths; can be told to fail.
#[derive(Default)]
pub struct MemoryWalArchive {
    purged: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl MemoryWalArchive {
    pub fn purged(&self) -> Vec<String> {
        self.purged.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn set_failing(&self, fail: bool) {
        if let Ok(mut f) = self.fail.lock() {
            *f = fail;
        }
    }
}

#[async_trait::async_trait]
impl WalArchive for MemoryWalArchive {
    async fn purge(
        &self,
        storage: &BackendSpec,
        prefix: &str,
    ) -> Result<(), WalError> {
        if self.fail.lock().map(|f| *f).unwrap_or(false) {
            return Err(WalError::Backend {
                bucket: storage.bucket.clone(),
                message: "injected failure".into(),
            });
        }
        if !prefix.is_empty() {
            if let Ok(mut p) = self.purged.lock() {
                p.push(format!("{}/{}", storage.bucket, prefix));
            }
        }
        Ok(())
    }
}
