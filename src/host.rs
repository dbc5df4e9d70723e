//! Host platform services consumed by the lock core.
//!
//! Radio power, scan permission and user-facing notifications belong to the
//! embedding application. The core only queries them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Platform hooks queried before scanning and used to report rejections.
#[cfg_attr(test, mockall::automock)]
pub trait HostServices: Send + Sync {
    /// Whether the Bluetooth radio is powered on.
    fn is_radio_enabled(&self) -> bool;

    /// Whether the app may scan (location/nearby-devices permission).
    fn has_scan_permission(&self) -> bool;

    /// Show a short non-fatal message to the user.
    fn notify(&self, message: &str);
}

/// Desktop host: radio state comes from the adapter, notifications go to the log.
#[derive(Debug, Clone)]
pub struct LoggingHost {
    radio_enabled: Arc<AtomicBool>,
}

impl LoggingHost {
    /// Create a host reading radio state from a shared flag.
    pub fn new(radio_enabled: Arc<AtomicBool>) -> Self {
        Self { radio_enabled }
    }
}

impl HostServices for LoggingHost {
    fn is_radio_enabled(&self) -> bool {
        self.radio_enabled.load(Ordering::SeqCst)
    }

    // Desktop stacks prompt for Bluetooth access on first use.
    fn has_scan_permission(&self) -> bool {
        true
    }

    fn notify(&self, message: &str) {
        warn!("{}", message);
    }
}
