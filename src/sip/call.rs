//! Call state and events shared by the signaling and session layers

use bytes::Bytes;

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Created, no INVITE sent yet
    Idle,
    /// INVITE sent, no ringing indication yet
    Inviting,
    /// 180 received
    Ringing,
    /// 183 received, remote may already be sending audio
    EarlyMedia,
    /// 200 OK received and ACKed
    Connected,
    /// BYE being sent
    Terminating,
    /// Call ended normally
    Terminated,
    /// Call rejected or authentication failed
    Failed,
}

impl CallState {
    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Terminated | CallState::Failed)
    }

    /// INVITE outstanding, no final response yet
    pub fn is_early(&self) -> bool {
        matches!(self, CallState::Inviting | CallState::Ringing | CallState::EarlyMedia)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Idle => write!(f, "Idle"),
            CallState::Inviting => write!(f, "Inviting"),
            CallState::Ringing => write!(f, "Ringing"),
            CallState::EarlyMedia => write!(f, "EarlyMedia"),
            CallState::Connected => write!(f, "Connected"),
            CallState::Terminating => write!(f, "Terminating"),
            CallState::Terminated => write!(f, "Terminated"),
            CallState::Failed => write!(f, "Failed"),
        }
    }
}

/// Audio frame received from remote party
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// 16kHz mono PCM16, little-endian
    pub pcm: Bytes,
    /// RTP timestamp (8kHz clock)
    pub timestamp: u32,
    /// RTP sequence number
    pub sequence: u16,
}

/// Events exposed to the orchestration layer, tagged with the call id
#[derive(Debug, Clone)]
pub enum CallEvent {
    Ringing { call_id: String },
    Connected { call_id: String },
    Failed { call_id: String, reason: String },
    Ended { call_id: String },
    AudioReceived { call_id: String, frame: AudioFrame },
}

impl CallEvent {
    pub fn call_id(&self) -> &str {
        match self {
            CallEvent::Ringing { call_id }
            | CallEvent::Connected { call_id }
            | CallEvent::Failed { call_id, .. }
            | CallEvent::Ended { call_id }
            | CallEvent::AudioReceived { call_id, .. } => call_id,
        }
    }

    /// `true` for the last event a call emits
    pub fn is_final(&self) -> bool {
        matches!(self, CallEvent::Failed { .. } | CallEvent::Ended { .. })
    }
}
