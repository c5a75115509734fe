//! Pending-transaction bits shared between client threads and the event loop.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransactionFlags: u32 {
        /// Some global state changed
        const TRANSACTION = 1 << 0;
        /// At least one surface changed and the surface list must be walked
        const TRAVERSAL = 1 << 1;
        /// Displays were added, removed or reconfigured
        const DISPLAY_TOPOLOGY = 1 << 2;
    }
}

#[derive(Debug, Default)]
pub struct AtomicTransactionFlags(AtomicU32);

impl AtomicTransactionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek(&self) -> TransactionFlags {
        TransactionFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    /// Clear `flags` and return which of them were set
    pub fn take(&self, flags: TransactionFlags) -> TransactionFlags {
        let old = self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
        TransactionFlags::from_bits_truncate(old) & flags
    }

    /// Set `flags` and return the previous value
    pub fn set(&self, flags: TransactionFlags) -> TransactionFlags {
        TransactionFlags::from_bits_truncate(self.0.fetch_or(flags.bits(), Ordering::AcqRel))
    }
}
