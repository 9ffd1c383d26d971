//! Call session
//!
//! Owns the signaling client and media bridge of one call and exposes the
//! lifecycle events and audio ports to the orchestration layer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::call::{AudioFrame, CallEvent, CallState};
use super::config::SipConfig;
use super::rtp::{MediaStats, RtpMediaBridge};
use super::user_agent::SipSignalingClient;
use super::SipError;

/// Capacity of the per-call event queue between the client and the session
const EVENT_QUEUE: usize = 50;

/// One outbound call from dial to teardown
pub struct CallSession {
    /// Unique call ID
    call_id: String,
    /// Dialled number as requested
    number: String,
    client: SipSignalingClient,
    media: Arc<RtpMediaBridge>,
    /// Events from the signaling client, taken when the session starts
    client_rx: Mutex<Option<mpsc::Receiver<CallEvent>>>,
    /// Outward event channel
    event_tx: mpsc::Sender<CallEvent>,
    /// Call start time
    started_at: DateTime<Utc>,
    /// Call connect time (when answered)
    connected_at: Arc<RwLock<Option<DateTime<Utc>>>>,
    /// Call end time
    ended_at: Arc<RwLock<Option<DateTime<Utc>>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Held for the whole teardown; `true` once it has completed
    released: Mutex<bool>,
}

impl CallSession {
    /// Create a session for `number`. Nothing is sent until [`CallSession::start`].
    pub fn new(config: Arc<SipConfig>, number: &str, event_tx: mpsc::Sender<CallEvent>) -> Self {
        let call_id = Uuid::new_v4().to_string();
        let media = Arc::new(RtpMediaBridge::new(config.media.clone()));
        let (client_tx, client_rx) = mpsc::channel(EVENT_QUEUE);
        let client = SipSignalingClient::new(config, call_id.clone(), media.clone(), client_tx);

        Self {
            call_id,
            number: number.to_string(),
            client,
            media,
            client_rx: Mutex::new(Some(client_rx)),
            event_tx,
            started_at: Utc::now(),
            connected_at: Arc::new(RwLock::new(None)),
            ended_at: Arc::new(RwLock::new(None)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            released: Mutex::new(false),
        }
    }

    /// Create and start a session in one step
    pub async fn dial(
        config: Arc<SipConfig>,
        number: &str,
        event_tx: mpsc::Sender<CallEvent>,
    ) -> Result<Self, SipError> {
        let session = Self::new(config, number, event_tx);
        session.start().await?;
        Ok(session)
    }

    /// Wire the event and audio forwarders, then send the INVITE
    pub async fn start(&self) -> Result<(), SipError> {
        let client_rx = self
            .client_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| SipError::InvalidState(format!("Call {} already started", self.call_id)))?;
        let audio_rx = self
            .media
            .take_audio_receiver()
            .await
            .ok_or_else(|| SipError::InvalidState("Audio receiver already taken".to_string()))?;

        let events = tokio::spawn(forward_events(
            client_rx,
            self.event_tx.clone(),
            self.connected_at.clone(),
            self.ended_at.clone(),
            self.cancel.clone(),
        ));
        let audio = tokio::spawn(forward_audio(
            self.call_id.clone(),
            audio_rx,
            self.event_tx.clone(),
            self.cancel.child_token(),
        ));
        self.tasks.lock().await.extend([events, audio]);

        if let Err(e) = self.client.dial(&self.number).await {
            tracing::error!("Call {} could not be placed: {}", self.call_id, e);
            self.media.stop().await;
            self.cancel.cancel();
            return Err(e);
        }

        tracing::info!("SIP call initiated: {} (call_id: {})", self.number, self.call_id);
        Ok(())
    }

    /// Get call ID
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    /// Get current state
    pub async fn state(&self) -> CallState {
        self.client.state().await
    }

    /// Queue 16kHz PCM16 audio for the remote party
    pub async fn send_audio(&self, pcm: &[u8]) {
        self.media.send_audio(pcm).await;
    }

    /// Barge-in: drop everything still queued for playback
    pub async fn stop_audio(&self) {
        self.media.clear_audio_buffer().await;
    }

    pub fn media_stats(&self) -> MediaStats {
        self.media.stats()
    }

    /// Hang up and release every socket and task owned by the call.
    ///
    /// Concurrent callers wait for the first teardown to finish; only one
    /// of them drives the dialog.
    pub async fn hangup(&self) {
        let mut released = self.released.lock().await;
        if *released {
            return;
        }

        self.client.hangup().await;
        self.media.stop().await;
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Call {} forwarder ended abnormally: {}", self.call_id, e);
            }
        }

        let mut ended_at = self.ended_at.write().await;
        if ended_at.is_none() {
            *ended_at = Some(Utc::now());
        }
        *released = true;
    }

    /// Whether [`CallSession::hangup`] has completed
    pub async fn is_released(&self) -> bool {
        *self.released.lock().await
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub async fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.read().await
    }

    pub async fn ended_at(&self) -> Option<DateTime<Utc>> {
        *self.ended_at.read().await
    }

    /// Get call duration in seconds (since connect, or since start if not connected)
    pub async fn duration(&self) -> u64 {
        let start = self.connected_at.read().await.unwrap_or(self.started_at);
        let end = self.ended_at.read().await.unwrap_or_else(Utc::now);

        (end - start).num_seconds().max(0) as u64
    }
}

/// Relay signaling events outward, stamping connect/end times on the way
async fn forward_events(
    mut client_rx: mpsc::Receiver<CallEvent>,
    event_tx: mpsc::Sender<CallEvent>,
    connected_at: Arc<RwLock<Option<DateTime<Utc>>>>,
    ended_at: Arc<RwLock<Option<DateTime<Utc>>>>,
    cancel: CancellationToken,
) {
    loop {
        // Queued events are drained before a cancellation is observed
        let event = tokio::select! {
            biased;
            event = client_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        match &event {
            CallEvent::Connected { .. } => *connected_at.write().await = Some(Utc::now()),
            CallEvent::Failed { .. } | CallEvent::Ended { .. } => {
                *ended_at.write().await = Some(Utc::now());
            }
            _ => {}
        }

        let is_final = event.is_final();
        if event_tx.send(event).await.is_err() {
            tracing::debug!("Session event receiver dropped");
        }
        if is_final {
            // No audio is delivered after the last lifecycle event
            cancel.cancel();
            break;
        }
    }
}

/// Relay decoded inbound audio as `AudioReceived` events
async fn forward_audio(
    call_id: String,
    mut audio_rx: mpsc::Receiver<AudioFrame>,
    event_tx: mpsc::Sender<CallEvent>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = audio_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let event = CallEvent::AudioReceived {
            call_id: call_id.clone(),
            frame,
        };
        if event_tx.send(event).await.is_err() {
            break;
        }
    }
}
