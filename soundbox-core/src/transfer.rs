//! One file queued for chunked delivery to a device.
//!
//! The payload is sliced into fixed-size packages, each carrying a
//! trailing checksum byte (sum of the package's data bytes mod 256).
//! The enqueuing caller holds a completion handle that resolves once
//! the delivery loop finishes or the connection dies.

use std::collections::VecDeque;

use tokio::sync::oneshot;

/// Data bytes per package; one checksum byte is appended on top.
/// Tunable in principle, but fixed by the device firmware in practice.
pub const PACKAGE_DATA_SIZE: usize = 1023;

/// Terminal outcome of a transfer job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failed,
}

/// Completion handle held by the caller that enqueued the job.
pub type TransferCompletion = oneshot::Receiver<TransferStatus>;

/// A file sliced into checksummed packages, ready for the delivery
/// loop.
#[derive(Debug)]
pub struct TransferJob {
    packages: VecDeque<Vec<u8>>,
    package_count: u16,
    done: Option<oneshot::Sender<TransferStatus>>,
}

impl TransferJob {
    /// Slice `content` into `ceil(len / PACKAGE_DATA_SIZE)` packages
    /// (an empty file still produces one empty package so the device
    /// sees a well-formed transfer). Returns the job and the caller's
    /// completion handle.
    pub fn new(content: &[u8]) -> (Self, TransferCompletion) {
        let count = content.len().div_ceil(PACKAGE_DATA_SIZE).max(1);
        let mut packages = VecDeque::with_capacity(count);
        for chunk in content.chunks(PACKAGE_DATA_SIZE) {
            packages.push_back(Self::package(chunk));
        }
        if packages.is_empty() {
            packages.push_back(Self::package(&[]));
        }
        let (tx, rx) = oneshot::channel();
        (
            Self {
                packages,
                package_count: count as u16,
                done: Some(tx),
            },
            rx,
        )
    }

    fn package(data: &[u8]) -> Vec<u8> {
        let mut package = Vec::with_capacity(data.len() + 1);
        package.extend_from_slice(data);
        package.push(checksum(data));
        package
    }

    pub fn package_count(&self) -> u16 {
        self.package_count
    }

    /// Next package in FIFO order.
    pub fn pop_package(&mut self) -> Option<Vec<u8>> {
        self.packages.pop_front()
    }

    /// Release the completion handle with `Success`.
    pub fn succeed(&mut self) {
        self.finish(TransferStatus::Success);
    }

    /// Release the completion handle with `Failed` and drop any
    /// unsent packages.
    pub fn fail(&mut self) {
        self.packages.clear();
        self.finish(TransferStatus::Failed);
    }

    fn finish(&mut self, status: TransferStatus) {
        if let Some(done) = self.done.take() {
            // The caller may have given up waiting; that is fine.
            let _ = done.send(status);
        }
    }
}

impl Drop for TransferJob {
    /// A job dropped before completing (queue drained on close, channel
    /// torn down) unblocks its waiter with `Failed`.
    fn drop(&mut self) {
        self.finish(TransferStatus::Failed);
    }
}

/// Trailing checksum byte: sum of the data bytes, modulo 256.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}
