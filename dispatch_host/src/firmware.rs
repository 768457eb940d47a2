//! Process-wide firmware upload bookkeeping.
//!
//! A device disappears while its firmware is flashed and re-appears as a new
//! attachment. The pending job is parked here under the device serial number
//! until the attach path for that serial completes it.

use async_trait::async_trait;
use dispatch_shared::device::LinkError;
use dispatch_shared::job::Job;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Flashes a firmware image onto the device at `port`.
#[async_trait]
pub trait FirmwareUploader: Send + Sync {
    async fn upload(&self, port: &str, image: &Path) -> Result<(), LinkError>;
}

#[derive(Debug, Default)]
pub struct FirmwareUploadStore {
    pending: Mutex<HashMap<String, Arc<Job>>>,
}

impl FirmwareUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, serial: impl Into<String>, job: Arc<Job>) -> Option<Arc<Job>> {
        self.pending.lock().insert(serial.into(), job)
    }

    pub fn get(&self, serial: &str) -> Option<Arc<Job>> {
        self.pending.lock().get(serial).cloned()
    }

    pub fn remove(&self, serial: &str) -> Option<Arc<Job>> {
        self.pending.lock().remove(serial)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
