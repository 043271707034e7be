use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// A cancellation token shared between a caller and the packing or
/// extracting engines.
///
/// Cloning yields another handle to the same flag. Once [`abort`] has been
/// called, the next suspension point of any engine holding a handle fails
/// with [`Error::Aborted`]. Work completed before that point is kept.
///
/// [`abort`]: AbortSignal::abort
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    /// Create a signal that has not been raised.
    pub fn new() -> AbortSignal {
        AbortSignal(Arc::new(AtomicBool::new(false)))
    }

    /// Raise the signal.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the signal has been raised.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(Error::Aborted);
        }
        Ok(())
    }
}
