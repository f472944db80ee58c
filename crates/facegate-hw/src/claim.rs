//! Process-wide exclusive claims on capture devices.
//!
//! Two frame sources asking for the same device key in one process is a
//! bug in the caller; the second `open()` fails with `DeviceBusy` instead
//! of sharing the stream.

use crate::camera::CameraError;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

static CLAIMS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn claims() -> MutexGuard<'static, HashSet<String>> {
    CLAIMS
        .get_or_init(|| Mutex::new(HashSet::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive hold on a device key. Released on drop.
#[derive(Debug)]
pub struct DeviceClaim {
    key: String,
}

impl DeviceClaim {
    pub fn acquire(key: &str) -> Result<Self, CameraError> {
        if !claims().insert(key.to_string()) {
            tracing::warn!(device = key, "device already claimed in this process");
            return Err(CameraError::DeviceBusy(key.to_string()));
        }
        Ok(Self {
            key: key.to_string(),
        })
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        claims().remove(&self.key);
        tracing::trace!(device = %self.key, "device claim released");
    }
}

/// Whether `key` is currently held by some frame source.
pub fn is_claimed(key: &str) -> bool {
    claims().contains(key)
}
