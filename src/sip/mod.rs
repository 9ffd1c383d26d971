//! Pure Rust SIP/RTP stack for outbound AI calls
//!
//! This module speaks directly to a SIP trunk without an external service.
//! Features:
//! - Outbound INVITE dialogs with digest authentication
//! - RTP media bridge with a drift-compensated 20ms pacer
//! - G.711 μ-law codec with 8kHz/16kHz resampling for the AI pipeline
//! - Call registry with single-call admission control

mod auth;
mod call;
mod codec;
mod config;
mod coordinator;
mod dialog;
mod message;
mod rtp;
mod sdp;
mod session;
mod user_agent;

#[cfg(test)]
mod call_flow_tests;

pub use call::{AudioFrame, CallEvent, CallState};
pub use codec::AudioCodec;
pub use config::{MediaConfig, SipConfig};
pub use coordinator::CallCoordinator;
pub use session::CallSession;

// Public API re-exports for external use
#[allow(unused_imports)]
pub use auth::{ChallengeKind, DigestCredentials};
#[allow(unused_imports)]
pub use dialog::{Call, DialogAction, DialogParams};
#[allow(unused_imports)]
pub use rtp::{MediaStats, PacketSequencer, RtpHeader, RtpMediaBridge, RtpPacket};
#[allow(unused_imports)]
pub use user_agent::SipSignalingClient;

use thiserror::Error;

/// SIP-related errors
#[derive(Error, Debug)]
pub enum SipError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
