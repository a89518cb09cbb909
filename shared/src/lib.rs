use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram the transport is expected to carry in one piece.
pub const DATAGRAM_MTU: usize = 1400;
/// Bytes reserved for packet framing and chunk metadata inside one datagram.
pub const CHUNK_HEADER_ALLOWANCE: usize = 100;
/// Payload bytes carried by a single `Data` message.
pub const MAX_CHUNK_BYTES: usize = DATAGRAM_MTU - CHUNK_HEADER_ALLOWANCE;
/// Receive buffer size, larger than any datagram we ever emit.
pub const RECV_BUFFER_BYTES: usize = 2048;
/// Upper bound on the size of a file offered for transfer.
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

// Packet types for client-server communication
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Connect { client_version: u32, name: String },
    Heartbeat,
    Disconnect,

    Connected,
    Disconnected { reason: String },

    /// Server-to-peer file transfer traffic.
    FileTransfer(FileTransferMessage),
    /// Peer-to-server file transfer control traffic.
    FileRequest(FileRequestMessage),
}

/// Messages the server sends while streaming a file to a peer.
///
/// All of these travel over the unreliable delivery path; the sender's own
/// ack/retransmit logic reconstructs reliability on top.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum FileTransferMessage {
    Initiate {
        transfer_id: u8,
        category: FileCategory,
        file_size: u32,
        file_name: String,
    },
    /// Shortcut when sender and receiver share a process: no bytes are
    /// streamed, the receiver reads the file straight from disk.
    SameMachine {
        transfer_id: u8,
        category: FileCategory,
        file_path: String,
    },
    Data {
        transfer_id: u8,
        offset: u32,
        bytes: Vec<u8>,
    },
    Cancel {
        transfer_id: u8,
    },
}

/// Messages a peer sends back about transfers addressed to it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum FileRequestMessage {
    Request {
        category: FileCategory,
        selector: FileSelector,
    },
    DataAck {
        transfer_id: u8,
        received: u32,
    },
    Cancel {
        transfer_id: u8,
    },
}

/// Kinds of files the server distributes.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileCategory {
    Submarine,
    Mod,
    CampaignSave,
}

impl FileCategory {
    /// Categories backed by a single live resource that may mutate between
    /// requests. Only one transfer of such a category per peer at a time.
    pub fn is_singleton(&self) -> bool {
        matches!(self, FileCategory::CampaignSave)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileCategory::Submarine => ".sub",
            FileCategory::Mod => ".zip",
            FileCategory::CampaignSave => ".save",
        }
    }
}

/// Identifies which file of a category a peer wants.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum FileSelector {
    /// A specific file, pinned by name and content hash so the peer gets
    /// exactly the version it saw advertised.
    Named { name: String, hash: String },
    /// Whatever the category's single live resource currently is.
    Current,
}

/// Lifecycle of one transfer, shared between the sending and receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    NotStarted,
    Sending,
    Receiving,
    Finished,
    Canceled,
    Error,
}

impl TransferStatus {
    /// Terminal transfers are never advanced again and get reaped on the
    /// next sweep.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Finished | TransferStatus::Canceled | TransferStatus::Error
        )
    }
}

// Human-readable byte count for log messages
pub fn readable_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_size_fits_datagram() {
        assert!(MAX_CHUNK_BYTES > 0);
        assert!(MAX_CHUNK_BYTES + CHUNK_HEADER_ALLOWANCE <= DATAGRAM_MTU);
        assert!(DATAGRAM_MTU <= RECV_BUFFER_BYTES);
    }

    #[test]
    fn test_packet_serialization_connect() {
        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            name: "tester".to_string(),
        };
        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::Connect {
                client_version,
                name,
            } => {
                assert_eq!(client_version, PROTOCOL_VERSION);
                assert_eq!(name, "tester");
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_initiate() {
        let packet = Packet::FileTransfer(FileTransferMessage::Initiate {
            transfer_id: 3,
            category: FileCategory::Submarine,
            file_size: 2500,
            file_name: "Aurora.sub".to_string(),
        });

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::FileTransfer(FileTransferMessage::Initiate {
                transfer_id,
                category,
                file_size,
                file_name,
            }) => {
                assert_eq!(transfer_id, 3);
                assert_eq!(category, FileCategory::Submarine);
                assert_eq!(file_size, 2500);
                assert_eq!(file_name, "Aurora.sub");
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_data_chunk() {
        let bytes: Vec<u8> = (0..=254).collect();
        let packet = Packet::FileTransfer(FileTransferMessage::Data {
            transfer_id: 1,
            offset: 1300,
            bytes: bytes.clone(),
        });

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            Packet::FileTransfer(FileTransferMessage::Data {
                transfer_id,
                offset,
                bytes: received,
            }) => {
                assert_eq!(transfer_id, 1);
                assert_eq!(offset, 1300);
                assert_eq!(received, bytes);
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_packet_serialization_request() {
        let packet = Packet::FileRequest(FileRequestMessage::Request {
            category: FileCategory::Submarine,
            selector: FileSelector::Named {
                name: "Aurora".to_string(),
                hash: "deadbeef".to_string(),
            },
        });

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: Packet = bincode::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, packet);
    }

    #[test]
    fn test_packet_serialization_ack_and_cancel() {
        let ack = Packet::FileRequest(FileRequestMessage::DataAck {
            transfer_id: 7,
            received: 4096,
        });
        let cancel = Packet::FileTransfer(FileTransferMessage::Cancel { transfer_id: 7 });

        for packet in [ack, cancel] {
            let serialized = bincode::serialize(&packet).unwrap();
            let deserialized: Packet = bincode::deserialize(&serialized).unwrap();
            assert_eq!(deserialized, packet);
        }
    }

    #[test]
    fn test_full_data_chunk_fits_recv_buffer() {
        let packet = Packet::FileTransfer(FileTransferMessage::Data {
            transfer_id: u8::MAX,
            offset: u32::MAX,
            bytes: vec![0xAB; MAX_CHUNK_BYTES],
        });

        let serialized = bincode::serialize(&packet).unwrap();
        assert!(serialized.len() <= RECV_BUFFER_BYTES);
    }

    #[test]
    fn test_singleton_categories() {
        assert!(FileCategory::CampaignSave.is_singleton());
        assert!(!FileCategory::Submarine.is_singleton());
        assert!(!FileCategory::Mod.is_singleton());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TransferStatus::Finished.is_terminal());
        assert!(TransferStatus::Canceled.is_terminal());
        assert!(TransferStatus::Error.is_terminal());
        assert!(!TransferStatus::NotStarted.is_terminal());
        assert!(!TransferStatus::Sending.is_terminal());
        assert!(!TransferStatus::Receiving.is_terminal());
    }

    #[test]
    fn test_readable_bytes() {
        assert_eq!(readable_bytes(512), "512 B");
        assert_eq!(readable_bytes(2048), "2.0 KB");
        assert_eq!(readable_bytes(50 * 1024 * 1024), "50.0 MB");
    }
}
