//! VoIP Dialer
//!
//! Places outbound calls by speaking SIP and RTP directly to a carrier and
//! bridges the call audio to a real-time AI conversation pipeline.
//!
//! The speech collaborators (STT/TTS/LLM) live outside this crate. They consume
//! [`sip::CallEvent::AudioReceived`] frames and push synthesized PCM16 back
//! through [`sip::CallSession::send_audio`].

pub mod logging;
pub mod sip;

pub use sip::{
    AudioCodec, CallCoordinator, CallEvent, CallSession, CallState, MediaConfig, SipConfig,
    SipError,
};
