//! Cooperative cancellation and progress reporting.
//!
//! Long-running encode/decode calls check a [`CancelToken`] at chunk and
//! block boundaries. Cancellation is non-destructive: everything written to
//! the sink before the check remains a valid stream prefix.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{FerrozError, Result};

/// A cloneable cancellation flag shared between a driver and its workers.
///
/// Cloning is cheap; all clones observe the same flag. The flag is sticky:
/// once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every holder of this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Return `Err(Cancelled)` if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FerrozError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Progress callback invoked at block boundaries with
/// `(bytes_consumed, bytes_produced)`.
pub type Progress<'a> = &'a mut dyn FnMut(u64, u64);
