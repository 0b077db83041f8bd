//! Cooperative transfer control
//!
//! A transfer checks its control between page operations. Cancel always wins
//! over pause; once a transfer is told to stop it never goes back to running.

use std::sync::atomic::{AtomicU8, Ordering};

const RUN: u8 = 0;
const PAUSE: u8 = 1;
const CANCEL: u8 = 2;

/// What a running transfer has been asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSignal {
    Run,
    Pause,
    Cancel,
}

/// Shared stop flag of one transfer
#[derive(Debug, Default)]
pub struct TransferControl {
    signal: AtomicU8,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the transfer to pause; returns false if it is already stopping
    pub fn request_pause(&self) -> bool {
        self.signal
            .compare_exchange(RUN, PAUSE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Ask the transfer to cancel, overriding a pending pause
    pub fn request_cancel(&self) {
        self.signal.store(CANCEL, Ordering::SeqCst);
    }

    pub fn signal(&self) -> TransferSignal {
        match self.signal.load(Ordering::SeqCst) {
            RUN => TransferSignal::Run,
            PAUSE => TransferSignal::Pause,
            _ => TransferSignal::Cancel,
        }
    }

    pub fn should_stop(&self) -> bool {
        self.signal() != TransferSignal::Run
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal() == TransferSignal::Cancel
    }
}
