//! Scanner capability interface — §9 design notes.
//!
//! The malware scanner itself is an external collaborator (out of scope,
//! §1); what this crate owns is the shape of the call: bounded plaintext in,
//! a three-way verdict out, on a deadline. `NullScanner` is the only
//! implementation shipped here — it models "no scanner configured", which
//! scan_finalize (C10) must treat as `Unavailable` per §4.6.

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Dirty,
    Unavailable,
}

#[async_trait]
pub trait Scanner: Send + Sync + 'static {
    async fn scan(&self, deadline: Duration, plaintext: &[u8]) -> ScanVerdict;
}

/// Stands in for "no scanner configured" — always `Unavailable`.
pub struct NullScanner;

#[async_trait]
impl Scanner for NullScanner {
    async fn scan(&self, _deadline: Duration, _plaintext: &[u8]) -> ScanVerdict {
        ScanVerdict::Unavailable
    }
}
