//! Per-recipient outbound transfer records

use shared::{FileCategory, TransferStatus};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Destination of an outbound transfer.
///
/// `LocalOwner` is the degenerate peer living in the same process as the
/// server (a hosted listen-server). Transfers to it never stream bytes; the
/// send step short-circuits to a `SameMachine` message instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    Remote(SocketAddr),
    LocalOwner,
}

impl Recipient {
    pub fn is_local_owner(&self) -> bool {
        matches!(self, Recipient::LocalOwner)
    }
}

/// State of one file being pushed to one recipient.
///
/// The payload is loaded once at creation and never mutated afterwards, so
/// the send step may slice it freely. All progress bookkeeping lives in the
/// public fields; invariants are `acked_offset <= sent_offset <= len()`,
/// maintained by the sender's tick and ack paths.
#[derive(Debug)]
pub struct FileTransferOut {
    /// Unique among this recipient's active transfers, not globally.
    pub id: u8,
    pub recipient: Recipient,
    pub category: FileCategory,
    pub status: TransferStatus,
    /// Highest byte offset handed to the transport so far. Rewound to
    /// `acked_offset` when the sender outruns the unacknowledged window.
    pub sent_offset: usize,
    /// Highest byte offset the peer has confirmed. Never decreases.
    pub acked_offset: usize,
    /// Whether the peer has confirmed the initiation message. Data only
    /// flows once this is set.
    pub acknowledged: bool,
    /// Seconds until the next send attempt for this record.
    pub retransmit_timer: f32,
    data: Vec<u8>,
    file_path: PathBuf,
    file_name: String,
    started_at: Instant,
}

impl FileTransferOut {
    pub fn new(
        id: u8,
        recipient: Recipient,
        category: FileCategory,
        file_path: PathBuf,
        data: Vec<u8>,
    ) -> Self {
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            id,
            recipient,
            category,
            status: TransferStatus::NotStarted,
            sent_offset: 0,
            acked_offset: 0,
            acknowledged: false,
            // zero so the first tick sends immediately
            retransmit_timer: 0.0,
            data,
            file_path,
            file_name,
            started_at: Instant::now(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Wall-clock time since the transfer was created. The host uses this
    /// to cancel transfers that exceed its maximum allowed duration.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Fraction of the payload the peer has confirmed, in `0.0..=1.0`.
    pub fn progress(&self) -> f32 {
        if self.data.is_empty() {
            return 1.0;
        }
        self.acked_offset as f32 / self.data.len() as f32
    }
}
