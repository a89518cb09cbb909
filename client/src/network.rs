//! Client network loop: connect, request files, drive the receiver

use crate::receiver::{CompletedTransfer, FileReceiver};
use bincode::{deserialize, serialize};
use log::{info, warn};
use shared::{
    FileCategory, FileRequestMessage, FileSelector, Packet, PROTOCOL_VERSION, RECV_BUFFER_BYTES,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, timeout};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    connected: bool,
    receiver: FileReceiver,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        download_dir: PathBuf,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(Client {
            socket,
            server_addr,
            connected: false,
            receiver: FileReceiver::new(download_dir),
        })
    }

    pub async fn connect(&mut self, name: &str) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server...");

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            name: name.to_string(),
        };
        self.send_packet(&packet).await?;

        let mut buffer = [0u8; RECV_BUFFER_BYTES];
        let (len, _) = timeout(CONNECT_TIMEOUT, self.socket.recv_from(&mut buffer)).await??;

        match deserialize::<Packet>(&buffer[0..len])? {
            Packet::Connected => {
                info!("Connected!");
                self.connected = true;
                Ok(())
            }
            Packet::Disconnected { reason } => {
                Err(format!("connection refused: {}", reason).into())
            }
            _ => Err("unexpected response to connect".into()),
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        if self.connected {
            self.send_packet(&Packet::Disconnect).await?;
            self.connected = false;
        }
        Ok(())
    }

    pub async fn request_file(
        &mut self,
        category: FileCategory,
        selector: FileSelector,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send_packet(&Packet::FileRequest(FileRequestMessage::Request {
            category,
            selector,
        }))
        .await
    }

    /// Runs the receive loop until a transfer of the wanted category
    /// lands on disk, sending heartbeats so the server keeps us listed.
    /// Completed transfers of other categories are kept on disk too.
    pub async fn download(
        &mut self,
        category: FileCategory,
        deadline: Duration,
    ) -> Result<CompletedTransfer, Box<dyn std::error::Error>> {
        let start = Instant::now();
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        let mut buffer = [0u8; RECV_BUFFER_BYTES];

        loop {
            if start.elapsed() > deadline {
                return Err("download timed out".into());
            }

            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    let (len, addr) = result?;
                    if addr != self.server_addr {
                        continue;
                    }
                    match deserialize::<Packet>(&buffer[0..len]) {
                        Ok(packet) => self.handle_packet(packet).await?,
                        Err(_) => warn!("Failed to deserialize packet from server"),
                    }

                    for completed in self.receiver.take_completed() {
                        if completed.category == category {
                            return Ok(completed);
                        }
                        info!(
                            "also received {:?}: {}",
                            completed.category,
                            completed.path.display()
                        );
                    }
                },

                _ = heartbeat.tick() => {
                    self.send_packet(&Packet::Heartbeat).await?;
                },
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), Box<dyn std::error::Error>> {
        match packet {
            Packet::FileTransfer(msg) => {
                for reply in self.receiver.handle_message(&msg) {
                    self.send_packet(&Packet::FileRequest(reply)).await?;
                }
                Ok(())
            }
            Packet::Disconnected { reason } => {
                self.connected = false;
                Err(format!("disconnected by server: {}", reason).into())
            }
            Packet::Connected => Ok(()),
            _ => {
                warn!("Unexpected packet type");
                Ok(())
            }
        }
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }
}
