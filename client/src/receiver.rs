//! Client-side reassembly of chunked file transfers
//!
//! Chunks arrive over the unreliable path and may be duplicated, stale or
//! ahead of what we have. The receiver only ever appends in-order data:
//! a stale chunk triggers a re-ack so the server can advance, a chunk past
//! the current offset is dropped and left for the server's rewind to
//! resend. Every accepted chunk is acknowledged with the new offset.

use log::{debug, error, info, warn};
use shared::{
    readable_bytes, FileCategory, FileRequestMessage, FileTransferMessage, TransferStatus,
    MAX_FILE_SIZE,
};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// How long a finished transfer id keeps absorbing trailing data packets
/// the server sent before it saw our final ack.
const FINISHED_GRACE: Duration = Duration::from_secs(5);
/// Extra attempts when writing a completed download to disk.
const WRITE_RETRIES: u32 = 4;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// One inbound transfer being reassembled.
#[derive(Debug)]
pub struct FileTransferIn {
    pub id: u8,
    pub category: FileCategory,
    pub file_name: String,
    pub file_size: u32,
    /// Contiguous bytes received so far.
    pub received: u32,
    pub status: TransferStatus,
    buffer: Vec<u8>,
}

impl FileTransferIn {
    pub fn progress(&self) -> f32 {
        if self.file_size == 0 {
            return 1.0;
        }
        self.received as f32 / self.file_size as f32
    }
}

/// A transfer that reached the disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTransfer {
    pub category: FileCategory,
    pub path: PathBuf,
}

/// Reassembles inbound transfers and produces the acks and cancellations
/// to send back. The caller owns the socket; every handled message
/// returns the replies it provoked.
pub struct FileReceiver {
    download_dir: PathBuf,
    active_transfers: Vec<FileTransferIn>,
    finished_recently: Vec<(u8, Instant)>,
    completed: Vec<CompletedTransfer>,
}

impl FileReceiver {
    pub fn new(download_dir: PathBuf) -> Self {
        Self {
            download_dir,
            active_transfers: Vec::new(),
            finished_recently: Vec::new(),
            completed: Vec::new(),
        }
    }

    pub fn active_transfers(&self) -> &[FileTransferIn] {
        &self.active_transfers
    }

    /// Drains the transfers that finished since the last call.
    pub fn take_completed(&mut self) -> Vec<CompletedTransfer> {
        std::mem::take(&mut self.completed)
    }

    pub fn handle_message(&mut self, msg: &FileTransferMessage) -> Vec<FileRequestMessage> {
        match msg {
            FileTransferMessage::Initiate {
                transfer_id,
                category,
                file_size,
                file_name,
            } => self.handle_initiate(*transfer_id, *category, *file_size, file_name),
            FileTransferMessage::SameMachine {
                transfer_id,
                category,
                file_path,
            } => self.handle_same_machine(*transfer_id, *category, file_path),
            FileTransferMessage::Data {
                transfer_id,
                offset,
                bytes,
            } => self.handle_data(*transfer_id, *offset, bytes),
            FileTransferMessage::Cancel { transfer_id } => {
                self.handle_server_cancel(*transfer_id);
                Vec::new()
            }
        }
    }

    fn handle_initiate(
        &mut self,
        id: u8,
        category: FileCategory,
        file_size: u32,
        file_name: &str,
    ) -> Vec<FileRequestMessage> {
        self.finished_recently.retain(|(fid, _)| *fid != id);

        if let Some(existing) = self.active_transfers.iter().find(|t| t.id == id) {
            if existing.category != category
                || existing.file_size != file_size
                || existing.file_name != file_name
            {
                error!("transfer initiated with an id that is already in use");
                return vec![FileRequestMessage::Cancel { transfer_id: id }];
            }
            // the server did not see our first ack, repeat it
            return vec![FileRequestMessage::DataAck {
                transfer_id: id,
                received: existing.received,
            }];
        }

        if file_size as u64 > MAX_FILE_SIZE {
            error!(
                "refusing transfer of {}: too large ({})",
                file_name,
                readable_bytes(file_size as u64)
            );
            return vec![FileRequestMessage::Cancel { transfer_id: id }];
        }
        if !is_valid_file_name(file_name, category) {
            error!("refusing transfer with illegal file name '{}'", file_name);
            return vec![FileRequestMessage::Cancel { transfer_id: id }];
        }

        info!(
            "receiving {} ({}) as transfer {}",
            file_name,
            readable_bytes(file_size as u64),
            id
        );
        self.active_transfers.push(FileTransferIn {
            id,
            category,
            file_name: file_name.to_string(),
            file_size,
            received: 0,
            status: TransferStatus::Receiving,
            buffer: Vec::with_capacity(file_size as usize),
        });

        vec![FileRequestMessage::DataAck {
            transfer_id: id,
            received: 0,
        }]
    }

    fn handle_same_machine(
        &mut self,
        id: u8,
        category: FileCategory,
        file_path: &str,
    ) -> Vec<FileRequestMessage> {
        let path = Path::new(file_path);
        if !path.exists() {
            error!(
                "same-machine transfer failed, file '{}' not found",
                file_path
            );
            return vec![FileRequestMessage::Cancel { transfer_id: id }];
        }

        info!("file available on this machine: {}", file_path);
        self.completed.push(CompletedTransfer {
            category,
            path: path.to_path_buf(),
        });
        Vec::new()
    }

    fn handle_data(&mut self, id: u8, offset: u32, bytes: &[u8]) -> Vec<FileRequestMessage> {
        let Some(index) = self.active_transfers.iter().position(|t| t.id == id) else {
            // the server keeps sending briefly after a transfer completes;
            // only unknown ids outside that window are an error
            let now = Instant::now();
            self.finished_recently
                .retain(|(_, at)| now.duration_since(*at) < FINISHED_GRACE);
            if self.finished_recently.iter().any(|(fid, _)| *fid == id) {
                return Vec::new();
            }
            error!("received data without a transfer initiation message");
            return vec![FileRequestMessage::Cancel { transfer_id: id }];
        };

        let transfer = &mut self.active_transfers[index];

        if offset != transfer.received {
            if offset < transfer.received {
                // stale resend; remind the server how far we are
                return vec![FileRequestMessage::DataAck {
                    transfer_id: id,
                    received: transfer.received,
                }];
            }
            // a gap; the server's rewind will bring these bytes back
            debug!(
                "dropping chunk at offset {} (expected {})",
                offset, transfer.received
            );
            return Vec::new();
        }

        if transfer.received as u64 + bytes.len() as u64 > transfer.file_size as u64 {
            error!(
                "received more data than expected for {} ({} + {} > {})",
                transfer.file_name,
                transfer.received,
                bytes.len(),
                transfer.file_size
            );
            transfer.status = TransferStatus::Error;
            self.active_transfers.remove(index);
            return vec![FileRequestMessage::Cancel { transfer_id: id }];
        }

        transfer.buffer.extend_from_slice(bytes);
        transfer.received += bytes.len() as u32;

        let mut replies = vec![FileRequestMessage::DataAck {
            transfer_id: id,
            received: transfer.received,
        }];

        if transfer.received >= transfer.file_size {
            replies = self.finish_transfer(index, replies);
        }
        replies
    }

    fn finish_transfer(
        &mut self,
        index: usize,
        replies: Vec<FileRequestMessage>,
    ) -> Vec<FileRequestMessage> {
        let mut transfer = self.active_transfers.remove(index);
        let dir = self.download_dir.join(category_dir(transfer.category));
        let dest = dir.join(&transfer.file_name);

        let write_result = std::fs::create_dir_all(&dir)
            .and_then(|_| write_with_retry(&dest, &transfer.buffer));

        match write_result {
            Ok(()) => {
                transfer.status = TransferStatus::Finished;
                info!("download finished: {}", dest.display());
                self.finished_recently.push((transfer.id, Instant::now()));
                self.completed.push(CompletedTransfer {
                    category: transfer.category,
                    path: dest,
                });
                replies
            }
            Err(e) => {
                error!("failed to write {}: {}", dest.display(), e);
                transfer.status = TransferStatus::Error;
                vec![FileRequestMessage::Cancel {
                    transfer_id: transfer.id,
                }]
            }
        }
    }

    fn handle_server_cancel(&mut self, id: u8) {
        if let Some(index) = self.active_transfers.iter().position(|t| t.id == id) {
            let transfer = &mut self.active_transfers[index];
            transfer.status = TransferStatus::Canceled;
            warn!(
                "the server canceled the transfer of '{}'",
                transfer.file_name
            );
            self.active_transfers.remove(index);
        }
    }
}

fn category_dir(category: FileCategory) -> &'static str {
    match category {
        FileCategory::Submarine => "Submarines",
        FileCategory::Mod => "Mods",
        FileCategory::CampaignSave => "Saves",
    }
}

fn is_valid_file_name(name: &str, category: FileCategory) -> bool {
    !name.is_empty()
        && !name.contains(['/', '\\'])
        && !name.contains("..")
        && name.ends_with(category.extension())
}

fn write_with_retry(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut attempt = 0;
    loop {
        match std::fs::write(path, bytes) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < WRITE_RETRIES => {
                attempt += 1;
                warn!(
                    "failed to write {} ({}), retry {}/{} in {:?}",
                    path.display(),
                    e,
                    attempt,
                    WRITE_RETRIES,
                    WRITE_RETRY_DELAY
                );
                thread::sleep(WRITE_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initiate(id: u8, size: u32, name: &str) -> FileTransferMessage {
        FileTransferMessage::Initiate {
            transfer_id: id,
            category: FileCategory::Submarine,
            file_size: size,
            file_name: name.to_string(),
        }
    }

    fn data(id: u8, offset: u32, bytes: Vec<u8>) -> FileTransferMessage {
        FileTransferMessage::Data {
            transfer_id: id,
            offset,
            bytes,
        }
    }

    fn ack(id: u8, received: u32) -> FileRequestMessage {
        FileRequestMessage::DataAck {
            transfer_id: id,
            received,
        }
    }

    fn cancel(id: u8) -> FileRequestMessage {
        FileRequestMessage::Cancel { transfer_id: id }
    }

    #[test]
    fn test_full_download_flow() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());
        let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();

        let replies = receiver.handle_message(&initiate(1, 2500, "Aurora.sub"));
        assert_eq!(replies, vec![ack(1, 0)]);

        let replies = receiver.handle_message(&data(1, 0, payload[0..1000].to_vec()));
        assert_eq!(replies, vec![ack(1, 1000)]);
        let replies = receiver.handle_message(&data(1, 1000, payload[1000..2000].to_vec()));
        assert_eq!(replies, vec![ack(1, 2000)]);
        let replies = receiver.handle_message(&data(1, 2000, payload[2000..2500].to_vec()));
        assert_eq!(replies, vec![ack(1, 2500)]);

        let completed = receiver.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].category, FileCategory::Submarine);
        let written = std::fs::read(&completed[0].path).unwrap();
        assert_eq!(written, payload);
        assert!(receiver.active_transfers().is_empty());
        // drained exactly once
        assert!(receiver.take_completed().is_empty());
    }

    #[test]
    fn test_duplicate_initiate_reacks() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        receiver.handle_message(&initiate(1, 2500, "Aurora.sub"));
        receiver.handle_message(&data(1, 0, vec![0u8; 1000]));

        let replies = receiver.handle_message(&initiate(1, 2500, "Aurora.sub"));
        assert_eq!(replies, vec![ack(1, 1000)]);
        assert_eq!(receiver.active_transfers().len(), 1);
    }

    #[test]
    fn test_duplicate_initiate_with_different_metadata_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        receiver.handle_message(&initiate(1, 2500, "Aurora.sub"));
        let replies = receiver.handle_message(&initiate(1, 9999, "Typhon.sub"));
        assert_eq!(replies, vec![cancel(1)]);
    }

    #[test]
    fn test_oversized_initiate_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        let msg = FileTransferMessage::Initiate {
            transfer_id: 1,
            category: FileCategory::Mod,
            file_size: u32::MAX,
            file_name: "huge.zip".to_string(),
        };
        let replies = receiver.handle_message(&msg);
        assert_eq!(replies, vec![cancel(1)]);
        assert!(receiver.active_transfers().is_empty());
    }

    #[test]
    fn test_illegal_file_names_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        for name in ["", "../escape.sub", "dir/Aurora.sub", "Aurora.zip"] {
            let replies = receiver.handle_message(&initiate(1, 100, name));
            assert_eq!(replies, vec![cancel(1)], "name: {:?}", name);
        }
        assert!(receiver.active_transfers().is_empty());
    }

    #[test]
    fn test_stale_chunk_triggers_reack() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        receiver.handle_message(&initiate(1, 2500, "Aurora.sub"));
        receiver.handle_message(&data(1, 0, vec![7u8; 1000]));

        // the same chunk again: no append, just a reminder ack
        let replies = receiver.handle_message(&data(1, 0, vec![7u8; 1000]));
        assert_eq!(replies, vec![ack(1, 1000)]);
        assert_eq!(receiver.active_transfers()[0].received, 1000);
    }

    #[test]
    fn test_gap_chunk_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        receiver.handle_message(&initiate(1, 2500, "Aurora.sub"));
        let replies = receiver.handle_message(&data(1, 1000, vec![7u8; 1000]));
        assert!(replies.is_empty());
        assert_eq!(receiver.active_transfers()[0].received, 0);
    }

    #[test]
    fn test_overflowing_chunk_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        receiver.handle_message(&initiate(1, 500, "Aurora.sub"));
        let replies = receiver.handle_message(&data(1, 0, vec![7u8; 1000]));
        assert_eq!(replies, vec![cancel(1)]);
        assert!(receiver.active_transfers().is_empty());
    }

    #[test]
    fn test_data_without_initiate_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        let replies = receiver.handle_message(&data(9, 0, vec![1, 2, 3]));
        assert_eq!(replies, vec![cancel(9)]);
    }

    #[test]
    fn test_trailing_data_after_finish_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        receiver.handle_message(&initiate(1, 100, "Aurora.sub"));
        receiver.handle_message(&data(1, 0, vec![7u8; 100]));
        assert_eq!(receiver.take_completed().len(), 1);

        // retransmitted tail arrives after completion: not an error
        let replies = receiver.handle_message(&data(1, 0, vec![7u8; 100]));
        assert!(replies.is_empty());
    }

    #[test]
    fn test_server_cancel_removes_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        receiver.handle_message(&initiate(1, 2500, "Aurora.sub"));
        let replies =
            receiver.handle_message(&FileTransferMessage::Cancel { transfer_id: 1 });
        assert!(replies.is_empty());
        assert!(receiver.active_transfers().is_empty());
        assert!(receiver.take_completed().is_empty());
    }

    #[test]
    fn test_same_machine_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let save = dir.path().join("campaign.save");
        std::fs::write(&save, b"depth 412").unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        let msg = FileTransferMessage::SameMachine {
            transfer_id: 1,
            category: FileCategory::CampaignSave,
            file_path: save.to_string_lossy().into_owned(),
        };
        let replies = receiver.handle_message(&msg);
        assert!(replies.is_empty());

        let completed = receiver.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].path, save);
    }

    #[test]
    fn test_same_machine_missing_file_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        let msg = FileTransferMessage::SameMachine {
            transfer_id: 1,
            category: FileCategory::CampaignSave,
            file_path: dir
                .path()
                .join("gone.save")
                .to_string_lossy()
                .into_owned(),
        };
        let replies = receiver.handle_message(&msg);
        assert_eq!(replies, vec![cancel(1)]);
    }

    #[test]
    fn test_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = FileReceiver::new(dir.path().to_path_buf());

        receiver.handle_message(&initiate(1, 1000, "Aurora.sub"));
        receiver.handle_message(&data(1, 0, vec![7u8; 250]));

        use assert_approx_eq::assert_approx_eq;
        assert_approx_eq!(receiver.active_transfers()[0].progress(), 0.25);
    }
}
