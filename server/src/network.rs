//! Server network layer handling UDP communications and the tick loop
//!
//! The socket receiver runs on its own task and funnels decoded packets
//! into the main loop through a channel; everything that mutates the peer
//! roster or the transfer set happens on the single main loop, so neither
//! needs locking.

use crate::catalog::FileCatalog;
use crate::file_sender::{FileSender, FileSenderConfig, PacketSink};
use crate::peer_manager::PeerManager;
use crate::transfer::Recipient;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    FileCategory, FileTransferMessage, Packet, PROTOCOL_VERSION, RECV_BUFFER_BYTES,
};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Transport sink for the file sender: datagrams for remote peers, an
/// in-process channel for the local owner.
///
/// Sends must not block the tick, so remote sends use the socket's
/// non-blocking path and report failure instead of waiting.
pub struct UdpSink {
    socket: Arc<UdpSocket>,
    local_owner: Option<mpsc::UnboundedSender<FileTransferMessage>>,
}

impl UdpSink {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            local_owner: None,
        }
    }

    /// Registers the hosting process as the local owner and returns the
    /// receiving end of its loopback channel.
    pub fn attach_local_owner(&mut self) -> mpsc::UnboundedReceiver<FileTransferMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.local_owner = Some(tx);
        rx
    }
}

impl PacketSink for UdpSink {
    fn send(&mut self, to: &Recipient, msg: &FileTransferMessage) -> io::Result<()> {
        match to {
            Recipient::Remote(addr) => {
                let packet = Packet::FileTransfer(msg.clone());
                let data = serialize(&packet)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                self.socket.try_send_to(&data, *addr)?;
                Ok(())
            }
            Recipient::LocalOwner => match &self.local_owner {
                Some(tx) => tx.send(msg.clone()).map_err(|_| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "local owner channel closed")
                }),
                None => Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "no local owner attached",
                )),
            },
        }
    }
}

/// Main server coordinating the socket, the peer roster and file
/// distribution.
pub struct Server {
    socket: Arc<UdpSocket>,
    peers: PeerManager,
    catalog: FileCatalog,
    file_sender: FileSender<UdpSink>,
    tick_duration: Duration,
    /// Transfers older than this are canceled by the host; the sender
    /// itself never aborts a slow transfer.
    max_transfer_duration: Duration,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        tick_duration: Duration,
        max_peers: usize,
        catalog: FileCatalog,
        config: FileSenderConfig,
        max_transfer_duration: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", addr);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        let mut file_sender = FileSender::with_config(UdpSink::new(Arc::clone(&socket)), config);
        file_sender.on_started(|transfer| {
            info!(
                "transfer {} of {} to {:?} started",
                transfer.id,
                transfer.file_name(),
                transfer.recipient
            );
        });
        file_sender.on_ended(|transfer| {
            info!(
                "transfer {} of {} to {:?} ended: {:?}",
                transfer.id,
                transfer.file_name(),
                transfer.recipient,
                transfer.status
            );
        });

        Ok(Server {
            socket,
            peers: PeerManager::new(max_peers),
            catalog,
            file_sender,
            tick_duration,
            max_transfer_duration,
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Access to the transfer registry, e.g. for host-initiated pushes.
    pub fn file_sender_mut(&mut self) -> &mut FileSender<UdpSink> {
        &mut self.file_sender
    }

    /// Registers the hosting process as the local owner so transfers to
    /// [`Recipient::LocalOwner`] have somewhere to land.
    pub fn attach_local_owner(&mut self) -> mpsc::UnboundedReceiver<FileTransferMessage> {
        self.file_sender.sink_mut().attach_local_owner()
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; RECV_BUFFER_BYTES];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    async fn send_packet(&self, packet: &Packet, addr: SocketAddr) {
        match serialize(packet) {
            Ok(data) => {
                if let Err(e) = self.socket.send_to(&data, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
            Err(e) => error!("Failed to serialize packet: {}", e),
        }
    }

    /// Processes one inbound packet on the main loop
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                client_version,
                name,
            } => {
                if client_version != PROTOCOL_VERSION {
                    let response = Packet::Disconnected {
                        reason: "Protocol version mismatch".to_string(),
                    };
                    self.send_packet(&response, addr).await;
                    return;
                }

                if self.peers.add_peer(addr, name) {
                    self.send_packet(&Packet::Connected, addr).await;
                    self.offer_campaign_save(addr);
                } else {
                    let response = Packet::Disconnected {
                        reason: "Server full".to_string(),
                    };
                    self.send_packet(&response, addr).await;
                }
            }

            Packet::Heartbeat => {
                self.peers.touch(&addr);
            }

            Packet::Disconnect => {
                // transfers to this peer are finalized on the next sweep
                self.peers.remove_peer(&addr);
            }

            Packet::FileRequest(msg) => {
                if !self.peers.contains(&addr) {
                    debug!("file request from unknown peer {}", addr);
                    return;
                }
                self.peers.touch(&addr);
                self.file_sender
                    .handle_request(&msg, Recipient::Remote(addr), &self.catalog);
            }

            _ => {
                warn!("Unexpected packet type from peer at {}", addr);
            }
        }
    }

    /// A freshly connected peer gets the current campaign save pushed
    /// without asking, unless one is already streaming to it.
    fn offer_campaign_save(&mut self, addr: SocketAddr) {
        let Some(save) = self.catalog.campaign_save().map(Path::to_path_buf) else {
            return;
        };
        let recipient = Recipient::Remote(addr);
        let already_streaming = self
            .file_sender
            .active_transfers()
            .iter()
            .any(|t| t.recipient == recipient && t.category == FileCategory::CampaignSave);
        if already_streaming {
            return;
        }
        if let Err(e) =
            self.file_sender
                .start_transfer(recipient, FileCategory::CampaignSave, &save)
        {
            warn!("could not push campaign save to {}: {}", addr, e);
        }
    }

    /// One simulation step: timeout sweep, stale-transfer cancellation,
    /// then the file sender's own sweep and send step.
    fn tick(&mut self, delta_time: f32) {
        self.peers.check_timeouts();
        self.cancel_stale_transfers();
        self.file_sender.update(delta_time, &self.peers);
    }

    fn cancel_stale_transfers(&mut self) {
        let max = self.max_transfer_duration;
        let stale: Vec<(Recipient, u8)> = self
            .file_sender
            .active_transfers()
            .iter()
            .filter(|t| t.elapsed() > max)
            .map(|t| (t.recipient, t.id))
            .collect();

        for (recipient, id) in stale {
            warn!(
                "transfer {} to {:?} exceeded {:?}, canceling",
                id, recipient, max
            );
            self.file_sender.cancel_transfer(recipient, id);
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver().await;

        let mut tick_interval = interval(self.tick_duration);
        let mut last_tick = Instant::now();

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;
                    self.tick(dt);
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_creation() {
        let packet = Packet::Heartbeat;
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        let msg = ServerMessage::PacketReceived {
            packet: packet.clone(),
            addr,
        };

        match msg {
            ServerMessage::PacketReceived { packet: p, addr: a } => {
                assert_eq!(a, addr);
                assert_eq!(p, packet);
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[tokio::test]
    async fn test_udp_sink_delivers_datagram() {
        let sender_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let receiver_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver_socket.local_addr().unwrap();

        let mut sink = UdpSink::new(Arc::clone(&sender_socket));
        let msg = FileTransferMessage::Data {
            transfer_id: 1,
            offset: 0,
            bytes: vec![1, 2, 3],
        };
        sink.send(&Recipient::Remote(target), &msg).unwrap();

        let mut buffer = [0u8; RECV_BUFFER_BYTES];
        let (len, _) = receiver_socket.recv_from(&mut buffer).await.unwrap();
        let packet: Packet = deserialize(&buffer[0..len]).unwrap();
        assert_eq!(packet, Packet::FileTransfer(msg));
    }

    #[tokio::test]
    async fn test_udp_sink_local_owner_channel() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut sink = UdpSink::new(socket);

        let msg = FileTransferMessage::SameMachine {
            transfer_id: 2,
            category: FileCategory::CampaignSave,
            file_path: "/srv/campaign.save".to_string(),
        };

        // without an attached local owner the send fails
        let err = sink.send(&Recipient::LocalOwner, &msg).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let mut rx = sink.attach_local_owner();
        sink.send(&Recipient::LocalOwner, &msg).unwrap();
        assert_eq!(rx.try_recv().unwrap(), msg);
    }
}
