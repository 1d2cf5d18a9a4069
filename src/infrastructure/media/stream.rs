//! RTP endpoint management
//!
//! Binds the local RTP socket for a call and records where the remote side
//! listens. Packet I/O belongs to the audio engine that picks the socket up.

use super::{AudioResource, MediaError};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    SendRecv,
    Inactive,
}

/// Audio resource backed by a UDP socket from a port range
pub struct RtpAudioResource {
    port_start: u16,
    port_end: u16,
    /// Local RTP socket
    rtp_socket: RwLock<Option<Arc<UdpSocket>>>,
    /// Remote RTP address
    remote_rtp: RwLock<Option<SocketAddr>>,
    direction: RwLock<StreamDirection>,
}

impl RtpAudioResource {
    /// Ports are tried from `port_start` upwards, even ports only.
    pub fn new(port_start: u16, port_end: u16) -> Self {
        Self {
            port_start,
            port_end,
            rtp_socket: RwLock::new(None),
            remote_rtp: RwLock::new(None),
            direction: RwLock::new(StreamDirection::Inactive),
        }
    }

    async fn bind_in_range(&self, local_ip: IpAddr) -> Result<UdpSocket, MediaError> {
        let start = self.port_start + (self.port_start % 2);
        let mut port = start;

        while port <= self.port_end {
            match UdpSocket::bind(SocketAddr::new(local_ip, port)).await {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    debug!("RTP port {} unavailable: {}", port, e);
                }
            }
            port = match port.checked_add(2) {
                Some(next) => next,
                None => break,
            };
        }

        Err(MediaError::PortsExhausted {
            start: self.port_start,
            end: self.port_end,
        })
    }

    /// Local socket, once `setup_audio_stream` succeeded
    pub async fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.rtp_socket.read().await.clone()
    }

    pub async fn remote(&self) -> Option<SocketAddr> {
        *self.remote_rtp.read().await
    }

    pub async fn direction(&self) -> StreamDirection {
        *self.direction.read().await
    }
}

#[async_trait::async_trait]
impl AudioResource for RtpAudioResource {
    async fn setup_audio_stream(&self, local_ip: IpAddr) -> Result<u16, MediaError> {
        let mut slot = self.rtp_socket.write().await;
        if let Some(socket) = slot.as_ref() {
            let port = socket.local_addr()?.port();
            debug!("Reusing RTP socket on port {}", port);
            return Ok(port);
        }

        let socket = self.bind_in_range(local_ip).await?;
        let port = socket.local_addr()?.port();
        info!("RTP socket bound to {}:{}", local_ip, port);
        *slot = Some(Arc::new(socket));
        Ok(port)
    }

    async fn setup_audio(&self, remote_rtp_port: u16, remote_ip: IpAddr) -> Result<(), MediaError> {
        if self.rtp_socket.read().await.is_none() {
            return Err(MediaError::NotPrepared);
        }
        if remote_rtp_port == 0 {
            return Err(MediaError::InvalidRemote(format!("{}:0", remote_ip)));
        }

        let remote = SocketAddr::new(remote_ip, remote_rtp_port);
        *self.remote_rtp.write().await = Some(remote);
        *self.direction.write().await = StreamDirection::SendRecv;
        info!("Remote RTP: {}", remote);
        Ok(())
    }

    async fn release_audio_resources(&self) {
        let socket = self.rtp_socket.write().await.take();
        self.remote_rtp.write().await.take();
        *self.direction.write().await = StreamDirection::Inactive;

        match socket {
            Some(socket) => match socket.local_addr() {
                Ok(addr) => info!("Released RTP socket {}", addr),
                Err(e) => warn!("Released RTP socket with unknown address: {}", e),
            },
            None => debug!("No audio resources to release"),
        }
    }
}
