//! Chunked file distribution over the unreliable datagram path
//!
//! The server pushes submarines, mod archives and campaign saves to peers
//! in bounded chunks, reconstructing reliability with its own ack and
//! retransmit logic instead of using the transport's ordered channel. All
//! progress is driven by the host's fixed-rate tick; nothing here blocks
//! on the network.
//!
//! Lifecycle of a transfer: created through [`FileSender::start_transfer`]
//! (or an inbound peer request), advanced once per tick by
//! [`FileSender::update`], mutated by inbound acks, and finalized exactly
//! once when it reaches a terminal status or its recipient disconnects.

use crate::catalog::FileCatalog;
use crate::loader::{self, LoadError};
use crate::peer_manager::PeerManager;
use crate::transfer::{FileTransferOut, Recipient};
use log::{debug, info, warn};
use shared::{
    FileCategory, FileRequestMessage, FileTransferMessage, TransferStatus, MAX_CHUNK_BYTES,
    MAX_FILE_SIZE,
};
use std::io;
use std::path::Path;
use thiserror::Error;

/// Seam to the unreliable transport. One call writes one protocol message
/// to one recipient and must not block; a returned error marks the
/// transfer as failed.
pub trait PacketSink {
    fn send(&mut self, to: &Recipient, msg: &FileTransferMessage) -> io::Result<()>;
}

/// Invoked when a transfer is admitted to the live set and when it leaves
/// it. The record's `status` distinguishes the cause on the way out.
pub type TransferCallback = Box<dyn FnMut(&FileTransferOut) + Send + Sync>;

/// Tunables for the send loop.
#[derive(Debug, Clone)]
pub struct FileSenderConfig {
    /// Hard cap on concurrently active transfers across all recipients.
    pub max_global_transfers: usize,
    /// Hard cap on concurrently active transfers to one recipient.
    pub max_transfers_per_recipient: usize,
    /// Seconds between send attempts for one transfer.
    pub send_interval: f32,
    /// How many unacknowledged chunks the sender may run ahead before
    /// rewinding to the last acknowledged offset.
    pub rewind_window_chunks: usize,
    /// Payload bytes per data message.
    pub max_chunk_bytes: usize,
    /// Largest file the server will load for sending.
    pub max_file_size: u64,
}

impl Default for FileSenderConfig {
    fn default() -> Self {
        Self {
            max_global_transfers: 16,
            max_transfers_per_recipient: 5,
            send_interval: 0.05,
            rewind_window_chunks: 5,
            max_chunk_bytes: MAX_CHUNK_BYTES,
            max_file_size: MAX_FILE_SIZE,
        }
    }
}

/// Reasons a transfer never starts. Failures after a transfer has started
/// are reported through the `OnEnded` callback instead.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer limit reached ({active} active, limit {limit})")]
    GlobalQuota { active: usize, limit: usize },

    #[error("recipient transfer limit reached ({active} active, limit {limit})")]
    RecipientQuota { active: usize, limit: usize },

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Owns the live set of outbound transfers and drives them.
pub struct FileSender<S: PacketSink> {
    sink: S,
    config: FileSenderConfig,
    active_transfers: Vec<FileTransferOut>,
    started_callbacks: Vec<TransferCallback>,
    ended_callbacks: Vec<TransferCallback>,
}

impl<S: PacketSink> FileSender<S> {
    pub fn new(sink: S) -> Self {
        Self::with_config(sink, FileSenderConfig::default())
    }

    pub fn with_config(sink: S, config: FileSenderConfig) -> Self {
        Self {
            sink,
            config,
            active_transfers: Vec::new(),
            started_callbacks: Vec::new(),
            ended_callbacks: Vec::new(),
        }
    }

    pub fn on_started<F>(&mut self, callback: F)
    where
        F: FnMut(&FileTransferOut) + Send + Sync + 'static,
    {
        self.started_callbacks.push(Box::new(callback));
    }

    pub fn on_ended<F>(&mut self, callback: F)
    where
        F: FnMut(&FileTransferOut) + Send + Sync + 'static,
    {
        self.ended_callbacks.push(Box::new(callback));
    }

    pub fn active_transfers(&self) -> &[FileTransferOut] {
        &self.active_transfers
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn find_transfer(&self, recipient: Recipient, id: u8) -> Option<&FileTransferOut> {
        self.active_transfers
            .iter()
            .find(|t| t.recipient == recipient && t.id == id)
    }

    /// Starts pushing a file to a recipient.
    ///
    /// Quota checks run before anything is loaded from disk; loading
    /// retries transient failures a bounded number of times. On success
    /// the transfer is in the live set, `OnStarted` has fired, and the
    /// first chunk goes out on the next tick.
    pub fn start_transfer(
        &mut self,
        recipient: Recipient,
        category: FileCategory,
        path: &Path,
    ) -> Result<u8, TransferError> {
        let active = self.active_transfers.len();
        if active >= self.config.max_global_transfers {
            return Err(TransferError::GlobalQuota {
                active,
                limit: self.config.max_global_transfers,
            });
        }
        let for_recipient = self
            .active_transfers
            .iter()
            .filter(|t| t.recipient == recipient)
            .count();
        if for_recipient >= self.config.max_transfers_per_recipient {
            return Err(TransferError::RecipientQuota {
                active: for_recipient,
                limit: self.config.max_transfers_per_recipient,
            });
        }

        let data = loader::load_payload(path, self.config.max_file_size)?;
        let id = self.next_free_id(recipient);
        let transfer =
            FileTransferOut::new(id, recipient, category, path.to_path_buf(), data);
        info!(
            "starting transfer {} of {} ({}) to {:?}",
            id,
            transfer.file_name(),
            shared::readable_bytes(transfer.len() as u64),
            recipient
        );
        self.active_transfers.push(transfer);
        self.fire_started(self.active_transfers.len() - 1);
        Ok(id)
    }

    /// Cancels a live transfer and notifies the peer. A no-op returning
    /// false when the transfer is unknown or already terminal, so calling
    /// it twice never fires `OnEnded` twice.
    pub fn cancel_transfer(&mut self, recipient: Recipient, id: u8) -> bool {
        let Some(index) = self
            .active_transfers
            .iter()
            .position(|t| t.recipient == recipient && t.id == id)
        else {
            return false;
        };
        if self.active_transfers[index].status.is_terminal() {
            // already on its way out; the next sweep finalizes it
            return false;
        }

        self.active_transfers[index].status = TransferStatus::Canceled;
        let notice = FileTransferMessage::Cancel { transfer_id: id };
        if let Err(e) = self.sink.send(&recipient, &notice) {
            debug!("cancel notice to {:?} not sent: {}", recipient, e);
        }
        info!("canceled transfer {} to {:?}", id, recipient);
        self.finalize_transfer(index);
        true
    }

    /// Per-tick sweep and send step, called once per simulation step.
    ///
    /// First finalizes every transfer whose recipient dropped off the
    /// roster and every transfer that reached a terminal status since the
    /// last tick, then gives each surviving transfer at most one send
    /// attempt.
    pub fn update(&mut self, delta_time: f32, peers: &PeerManager) {
        let mut index = 0;
        while index < self.active_transfers.len() {
            let transfer = &mut self.active_transfers[index];
            if !peers.is_connected(&transfer.recipient) {
                info!(
                    "recipient {:?} of transfer {} disconnected",
                    transfer.recipient, transfer.id
                );
                if !transfer.status.is_terminal() {
                    transfer.status = TransferStatus::Canceled;
                }
                self.finalize_transfer(index);
                continue;
            }
            if transfer.status.is_terminal() {
                self.finalize_transfer(index);
                continue;
            }
            index += 1;
        }

        for index in 0..self.active_transfers.len() {
            self.send_step(index, delta_time);
        }
    }

    /// Applies one peer-originated control message.
    ///
    /// Unsatisfiable requests are dropped without any reply; a probing
    /// peer learns nothing about what exists on this server.
    pub fn handle_request(
        &mut self,
        msg: &FileRequestMessage,
        from: Recipient,
        catalog: &FileCatalog,
    ) {
        match msg {
            FileRequestMessage::Cancel { transfer_id } => {
                if !self.cancel_transfer(from, *transfer_id) {
                    debug!(
                        "cancel for unknown transfer {} from {:?}",
                        transfer_id, from
                    );
                }
            }
            FileRequestMessage::DataAck {
                transfer_id,
                received,
            } => {
                self.apply_ack(from, *transfer_id, *received);
            }
            FileRequestMessage::Request { category, selector } => {
                if category.is_singleton()
                    && self
                        .active_transfers
                        .iter()
                        .any(|t| t.recipient == from && t.category == *category)
                {
                    debug!(
                        "{:?} already streaming to {:?}, duplicate request ignored",
                        category, from
                    );
                    return;
                }
                let Some(path) = catalog.resolve(*category, selector) else {
                    debug!("unresolvable {:?} request from {:?} dropped", category, from);
                    return;
                };
                if let Err(e) = self.start_transfer(from, *category, &path) {
                    warn!("file request from {:?} not started: {}", from, e);
                }
            }
        }
    }

    fn apply_ack(&mut self, from: Recipient, id: u8, received: u32) {
        let Some(transfer) = self
            .active_transfers
            .iter_mut()
            .find(|t| t.recipient == from && t.id == id)
        else {
            debug!("ack for unknown transfer {} from {:?}", id, from);
            return;
        };
        if transfer.status.is_terminal() {
            return;
        }

        transfer.acknowledged = true;
        let received = (received as usize).min(transfer.len());
        if received > transfer.acked_offset {
            transfer.acked_offset = received;
        }
        // the peer may have received more than we think we sent
        if transfer.sent_offset < transfer.acked_offset {
            transfer.sent_offset = transfer.acked_offset;
        }
        if transfer.acked_offset >= transfer.len() {
            transfer.status = TransferStatus::Finished;
            info!(
                "finished sending {} to {:?}",
                transfer.file_name(),
                transfer.recipient
            );
        }
    }

    /// One send attempt for one transfer. Pacing comes from the
    /// retransmit timer, not from transport backpressure.
    fn send_step(&mut self, index: usize, delta_time: f32) {
        let max_chunk = self.config.max_chunk_bytes;
        let window = self.config.rewind_window_chunks;
        let interval = self.config.send_interval;

        let transfer = &mut self.active_transfers[index];
        transfer.retransmit_timer -= delta_time;
        if transfer.retransmit_timer > 0.0 {
            return;
        }
        transfer.retransmit_timer = interval;

        let recipient = transfer.recipient;

        if recipient.is_local_owner() {
            // same process: hand over the path, skip the byte stream
            let msg = FileTransferMessage::SameMachine {
                transfer_id: transfer.id,
                category: transfer.category,
                file_path: transfer.file_path().to_string_lossy().into_owned(),
            };
            match self.sink.send(&recipient, &msg) {
                Ok(()) => transfer.status = TransferStatus::Finished,
                Err(e) => {
                    warn!("local transfer {} failed: {}", transfer.id, e);
                    transfer.status = TransferStatus::Error;
                }
            }
            return;
        }

        if !transfer.acknowledged {
            // keep offering until the peer confirms it wants the data
            let msg = FileTransferMessage::Initiate {
                transfer_id: transfer.id,
                category: transfer.category,
                file_size: transfer.len() as u32,
                file_name: transfer.file_name().to_string(),
            };
            match self.sink.send(&recipient, &msg) {
                Ok(()) => transfer.status = TransferStatus::Sending,
                Err(e) => {
                    warn!("initiate for transfer {} failed: {}", transfer.id, e);
                    transfer.status = TransferStatus::Error;
                }
            }
            return;
        }

        let remaining = transfer.len() - transfer.sent_offset;
        let chunk_len = remaining.min(max_chunk);
        let offset = transfer.sent_offset;
        let msg = FileTransferMessage::Data {
            transfer_id: transfer.id,
            offset: offset as u32,
            bytes: transfer.data()[offset..offset + chunk_len].to_vec(),
        };
        if let Err(e) = self.sink.send(&recipient, &msg) {
            warn!("data send for transfer {} failed: {}", transfer.id, e);
            transfer.status = TransferStatus::Error;
            return;
        }
        debug!(
            "sent chunk [{}, {}) of transfer {} to {:?}",
            offset,
            offset + chunk_len,
            transfer.id,
            recipient
        );
        transfer.sent_offset += chunk_len;

        // go-back-N: past the lookahead window, or past the end without a
        // full ack, resume from the last acknowledged offset
        if transfer.sent_offset > transfer.acked_offset + window * max_chunk
            || transfer.sent_offset >= transfer.len()
        {
            transfer.sent_offset = transfer.acked_offset;
        }
    }

    /// Lowest id not in use for this recipient, probing upward from 1.
    fn next_free_id(&self, recipient: Recipient) -> u8 {
        let mut id = 1u8;
        while self
            .active_transfers
            .iter()
            .any(|t| t.recipient == recipient && t.id == id)
        {
            id += 1;
        }
        id
    }

    fn fire_started(&mut self, index: usize) {
        let mut callbacks = std::mem::take(&mut self.started_callbacks);
        for callback in callbacks.iter_mut() {
            callback(&self.active_transfers[index]);
        }
        self.started_callbacks = callbacks;
    }

    /// Removes the transfer from the live set and fires `OnEnded` exactly
    /// once, whatever the final status.
    fn finalize_transfer(&mut self, index: usize) {
        let transfer = self.active_transfers.remove(index);
        debug!(
            "transfer {} to {:?} ended with {:?}",
            transfer.id, transfer.recipient, transfer.status
        );
        let mut callbacks = std::mem::take(&mut self.ended_callbacks);
        for callback in callbacks.iter_mut() {
            callback(&transfer);
        }
        self.ended_callbacks = callbacks;
    }
}
