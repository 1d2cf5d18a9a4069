use restcomm_sip::application::{Device, LoggingNotifier};
use restcomm_sip::config::Config;
use restcomm_sip::infrastructure::media::RtpAudioResource;
use restcomm_sip::infrastructure::metrics::describe_metrics;
use restcomm_sip::infrastructure::protocols::sip::{
    TcpTransport, Transport, TransportProtocol, UdpTransport,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting restcomm-sip device");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = Config::load(path.as_deref())?;
    if config.sip.local_ip.is_empty() {
        config.sip.local_ip = detect_local_ip(&config).await?.to_string();
        info!("Using local address {}", config.sip.local_ip);
    }
    describe_metrics();

    let profile = config.profile();
    let bind_addr = SocketAddr::new(profile.local_ip_addr()?, profile.local_port());
    let transport: Box<dyn Transport> = match profile.transport_protocol()? {
        TransportProtocol::Udp => Box::new(UdpTransport::new(bind_addr)),
        TransportProtocol::Tcp => Box::new(TcpTransport::new(bind_addr)),
    };

    let audio = Arc::new(RtpAudioResource::new(
        config.media.rtp_port_start,
        config.media.rtp_port_end,
    ));
    let device = Device::new(audio, Arc::new(LoggingNotifier));

    device
        .initialize(profile, config.custom_headers(), transport)
        .await?;
    device.run().await?;

    if config.device.register_on_start {
        device.register().await?;
    }

    info!("Device ready on {}", bind_addr);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if device.sip_manager().is_registered().await {
        if let Err(e) = device.unregister().await {
            warn!("Unregister failed: {}", e);
        }
    }
    device.shutdown().await;

    Ok(())
}

/// Address of the interface that routes to the registrar
async fn detect_local_ip(config: &Config) -> anyhow::Result<IpAddr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .connect((config.sip.registrar_ip.as_str(), config.sip.registrar_port))
        .await?;
    Ok(socket.local_addr()?.ip())
}
