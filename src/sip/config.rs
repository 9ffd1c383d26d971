//! SIP Configuration
//!
//! Configuration for dialing out through a SIP trunk provider.

use serde::{Deserialize, Serialize};

use super::SipError;

/// One G.711 frame: 20ms at 8kHz, one byte per sample
pub const FRAME_BYTES: usize = 160;

/// Frame duration in milliseconds
pub const FRAME_MS: u64 = 20;

/// Media bridge tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Local IP the RTP socket binds to
    pub bind_ip: String,

    /// μ-law bytes that must be queued before the first packet goes out (~60ms)
    pub jitter_prime_bytes: usize,

    /// Gain applied after 16kHz -> 8kHz averaging
    pub encode_gain: f32,

    /// Delay between sending BYE and stopping the media bridge
    pub bye_grace_ms: u64,

    /// Starvation ticks between two starvation log lines
    pub starvation_log_interval: u64,

    /// Capacity of the inbound audio frame queue
    pub inbound_queue: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            jitter_prime_bytes: 480,
            encode_gain: 0.8,
            bye_grace_ms: 200,
            starvation_log_interval: 50,
            inbound_queue: 100,
        }
    }
}

/// SIP trunk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    /// SIP trunk hostname (e.g., "sip.telnyx.com")
    pub trunk_host: String,

    /// SIP trunk port
    pub trunk_port: u16,

    /// SIP username for authentication
    pub username: String,

    /// SIP password for authentication
    pub password: String,

    /// Caller ID / DID number (e.g., "+15551234567")
    pub caller_id: String,

    /// SIP domain (usually same as trunk_host)
    pub domain: String,

    /// Local IP advertised in Via/Contact/SDP (auto-detected if None)
    pub local_ip: Option<String>,

    /// Local SIP signaling port (0 = ephemeral)
    pub sip_port: u16,

    /// User agent string
    pub user_agent: String,

    /// Media settings
    pub media: MediaConfig,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            trunk_host: String::new(),
            trunk_port: 5060,
            username: String::new(),
            password: String::new(),
            caller_id: String::new(),
            domain: String::new(),
            local_ip: None,
            sip_port: 0,
            user_agent: "VoIP-Dialer/1.0 (Rust)".to_string(),
            media: MediaConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl SipConfig {
    /// Create config from environment variables (a `.env` file is loaded first)
    pub fn from_env() -> Option<Self> {
        dotenvy::dotenv().ok();

        let trunk_host = std::env::var("SIP_TRUNK_HOST").ok()?;
        let username = std::env::var("SIP_USERNAME").ok()?;
        let password = std::env::var("SIP_PASSWORD").ok()?;
        let caller_id = std::env::var("SIP_CALLER_ID").ok()?;

        let domain = std::env::var("SIP_DOMAIN").unwrap_or_else(|_| trunk_host.clone());
        let defaults = MediaConfig::default();

        let media = MediaConfig {
            bind_ip: std::env::var("RTP_BIND_IP").unwrap_or(defaults.bind_ip),
            jitter_prime_bytes: env_parse("RTP_JITTER_PRIME_BYTES")
                .unwrap_or(defaults.jitter_prime_bytes),
            encode_gain: env_parse("RTP_ENCODE_GAIN").unwrap_or(defaults.encode_gain),
            bye_grace_ms: env_parse("SIP_BYE_GRACE_MS").unwrap_or(defaults.bye_grace_ms),
            ..defaults
        };

        Some(Self {
            trunk_host,
            trunk_port: env_parse("SIP_TRUNK_PORT").unwrap_or(5060),
            username,
            password,
            caller_id,
            domain,
            local_ip: std::env::var("SIP_LOCAL_IP").ok(),
            sip_port: env_parse("SIP_LOCAL_PORT").unwrap_or(0),
            user_agent: "VoIP-Dialer/1.0 (Rust)".to_string(),
            media,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), SipError> {
        if self.trunk_host.is_empty() {
            return Err(SipError::Config("SIP trunk host is required".to_string()));
        }
        if self.username.is_empty() {
            return Err(SipError::Config("SIP username is required".to_string()));
        }
        if self.caller_id.is_empty() {
            return Err(SipError::Config("SIP caller ID is required".to_string()));
        }
        if !(self.media.encode_gain > 0.0 && self.media.encode_gain <= 1.0) {
            return Err(SipError::Config(format!(
                "Encode gain must be in (0, 1], got {}",
                self.media.encode_gain
            )));
        }
        if self.media.jitter_prime_bytes < FRAME_BYTES {
            return Err(SipError::Config(format!(
                "Jitter priming must hold at least one frame ({} bytes)",
                FRAME_BYTES
            )));
        }
        Ok(())
    }

    /// Domain used in SIP URIs, falling back to the trunk host
    pub fn sip_domain(&self) -> &str {
        if self.domain.is_empty() {
            &self.trunk_host
        } else {
            &self.domain
        }
    }

    /// Get the From URI for outgoing requests
    pub fn caller_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.sip_domain())
    }

    /// Get the Request-URI for a dialled number
    pub fn callee_uri(&self, number: &str) -> String {
        format!("sip:{}@{}", number.trim_start_matches('+'), self.sip_domain())
    }

    /// Get the Contact URI
    pub fn contact_uri(&self, local_ip: &str, local_port: u16) -> String {
        format!("sip:{}@{}:{}", self.username, local_ip, local_port)
    }
}
