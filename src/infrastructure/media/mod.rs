//! Media layer
//!
//! The signaling core only prepares and tears down the audio path; the
//! `AudioResource` trait is the seam to whatever plays and records audio.

pub mod stream;

pub use stream::{RtpAudioResource, StreamDirection};

use crate::infrastructure::protocols::sip::SipError;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No free RTP port in {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("Audio stream not prepared")]
    NotPrepared,

    #[error("Invalid remote endpoint: {0}")]
    InvalidRemote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<MediaError> for SipError {
    fn from(err: MediaError) -> Self {
        SipError::Media(err.to_string())
    }
}

/// Audio path owned by the device
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AudioResource: Send + Sync {
    /// Bind the local RTP endpoint and return its port
    async fn setup_audio_stream(&self, local_ip: IpAddr) -> Result<u16, MediaError>;

    /// Point the stream at the remote RTP endpoint
    async fn setup_audio(&self, remote_rtp_port: u16, remote_ip: IpAddr) -> Result<(), MediaError>;

    /// Tear everything down; calling it again is a no-op
    async fn release_audio_resources(&self);
}
