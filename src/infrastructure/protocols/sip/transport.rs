//! SIP transport layer - UDP datagrams and TCP connect-on-send

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    /// Token used on the Via line
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }

    /// Value of the `transport=` URI parameter
    pub fn param(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportProtocol::Udp),
            "tcp" => Some(TransportProtocol::Tcp),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        5060
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Local address the user agent advertises in Via and Contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListeningPoint {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: TransportProtocol,
}

impl ListeningPoint {
    pub fn new(ip: IpAddr, port: u16, protocol: TransportProtocol) -> Self {
        Self { ip, port, protocol }
    }

    /// Via value for one hop with the given branch
    pub fn via(&self, branch: &str) -> String {
        format!(
            "SIP/2.0/{} {}:{};rport;branch={}",
            self.protocol.as_str(),
            self.ip,
            self.port,
            branch
        )
    }

    /// Contact URI for `user` at this listening point
    pub fn contact_uri(&self, user: &str) -> String {
        format!(
            "sip:{}@{}:{};transport={}",
            user,
            self.ip,
            self.port,
            self.protocol.param()
        )
    }

    pub fn contact(&self, user: &str) -> String {
        format!("<{}>", self.contact_uri(user))
    }
}

/// Transport layer trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Bind the socket and start the receive loop
    async fn start(&mut self) -> Result<(), SipError>;

    /// Stop the receive loop
    async fn stop(&self) -> Result<(), SipError>;

    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Hand out the receiver for incoming messages (once)
    fn take_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>>;

    /// Bound local address, available after `start`
    fn local_addr(&self) -> Option<SocketAddr>;

    fn protocol(&self) -> TransportProtocol;
}

/// UDP transport implementation
pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<IncomingMessage>,
    rx: Option<mpsc::Receiver<IncomingMessage>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            socket: None,
            tx,
            rx: Some(rx),
            task: Mutex::new(None),
        }
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    // Keep-alive CRLFs
                    if buf[..size].iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage {
                                message,
                                source,
                                protocol: TransportProtocol::Udp,
                            };

                            if let Err(e) = tx.send(incoming).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn start(&mut self) -> Result<(), SipError> {
        info!("Starting UDP transport on {}", self.bind_addr);

        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;

        if let Ok(addr) = socket.local_addr() {
            info!("UDP transport listening on {}", addr);
        }

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            Self::receive_loop(socket, tx).await;
        });
        *self.task.lock().await = Some(handle);

        Ok(())
    }

    async fn stop(&self) -> Result<(), SipError> {
        info!("Stopping UDP transport");
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SipError::TransportError("Socket not initialized".to_string()))?;

        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.rx.take()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }
}

/// TCP transport implementation
///
/// Outbound messages open a fresh connection per send; replies arriving on
/// that connection are read by a spawned task.
pub struct TcpTransport {
    bind_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    tx: mpsc::Sender<IncomingMessage>,
    rx: Option<mpsc::Receiver<IncomingMessage>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(bind_addr: SocketAddr) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        Self {
            bind_addr,
            local_addr: None,
            tx,
            rx: Some(rx),
            task: Mutex::new(None),
        }
    }

    async fn handle_connection<R>(mut stream: R, source: SocketAddr, tx: mpsc::Sender<IncomingMessage>)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        use tokio::io::AsyncReadExt;

        let mut buf = vec![0u8; 65535];

        loop {
            match stream.read(&mut buf).await {
                Ok(0) => {
                    debug!("TCP connection closed by {}", source);
                    break;
                }
                Ok(size) => {
                    debug!("Received {} bytes from {} via TCP", size, source);

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage {
                                message,
                                source,
                                protocol: TransportProtocol::Tcp,
                            };

                            if let Err(e) = tx.send(incoming).await {
                                error!("Failed to send incoming message to channel: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to read from TCP connection: {}", e);
                    break;
                }
            }
        }
    }

    async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<IncomingMessage>) {
        loop {
            match listener.accept().await {
                Ok((stream, source)) => {
                    info!("Accepted TCP connection from {}", source);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        Self::handle_connection(stream, source, tx).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn start(&mut self) -> Result<(), SipError> {
        info!("Starting TCP transport on {}", self.bind_addr);

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind TCP socket: {}", e)))?;

        self.local_addr = listener.local_addr().ok();
        if let Some(addr) = self.local_addr {
            info!("TCP transport listening on {}", addr);
        }

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            Self::accept_loop(listener, tx).await;
        });
        *self.task.lock().await = Some(handle);

        Ok(())
    }

    async fn stop(&self) -> Result<(), SipError> {
        info!("Stopping TCP transport");
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        use tokio::io::AsyncWriteExt;

        debug!(
            "Sending {} bytes to {} via TCP",
            message.data.len(),
            message.destination
        );

        let stream = TcpStream::connect(message.destination)
            .await
            .map_err(|e| {
                SipError::TransportError(format!("Failed to connect to {}: {}", message.destination, e))
            })?;

        let (reader, mut writer) = stream.into_split();

        writer
            .write_all(&message.data)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send TCP data: {}", e)))?;

        writer
            .flush()
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to flush TCP stream: {}", e)))?;

        let tx = self.tx.clone();
        let source = message.destination;
        tokio::spawn(async move {
            // Hold the write half so the peer does not see a half-close.
            let _writer = writer;
            Self::handle_connection(reader, source, tx).await;
        });

        Ok(())
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<IncomingMessage>> {
        self.rx.take()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }
}
