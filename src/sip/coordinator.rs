//! Call coordinator
//!
//! Registry of live calls keyed by call id. Admission is explicit: a new call
//! is rejected while any call is registered.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::call::CallEvent;
use super::config::SipConfig;
use super::session::CallSession;
use super::SipError;

/// Capacity of the outward event channel
const EVENT_QUEUE: usize = 100;

type Registry = Arc<RwLock<HashMap<String, Arc<CallSession>>>>;

/// Teardowns started by the router for calls that ended on their own
type Releases = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Owns every [`CallSession`] and their lifecycle
pub struct CallCoordinator {
    config: Arc<SipConfig>,
    /// Active calls by call ID
    calls: Registry,
    releases: Releases,
    /// Sessions report here; the router relays outward
    session_tx: mpsc::Sender<CallEvent>,
    /// Serializes admission checks
    admission: Mutex<()>,
}

impl CallCoordinator {
    /// Create a coordinator and the channel its call events are delivered on.
    ///
    /// Must be called inside a Tokio runtime. The receiver has to be drained;
    /// a full channel back-pressures every call's signaling loop.
    pub fn new(config: SipConfig) -> (Self, mpsc::Receiver<CallEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (session_tx, session_rx) = mpsc::channel(EVENT_QUEUE);
        let calls: Registry = Arc::new(RwLock::new(HashMap::new()));
        let releases: Releases = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(route_events(session_rx, event_tx, calls.clone(), releases.clone()));

        let coordinator = Self {
            config: Arc::new(config),
            calls,
            releases,
            session_tx,
            admission: Mutex::new(()),
        };
        (coordinator, event_rx)
    }

    /// Create from environment variables
    pub fn from_env() -> Option<(Self, mpsc::Receiver<CallEvent>)> {
        let config = SipConfig::from_env()?;
        Some(Self::new(config))
    }

    /// Get the configuration
    pub fn config(&self) -> &SipConfig {
        &self.config
    }

    /// Place an outbound call and return its call id
    pub async fn place_call(&self, number: &str) -> Result<String, SipError> {
        let _admission = self.admission.lock().await;

        if let Some(active) = self.calls.read().await.keys().next() {
            tracing::warn!("Rejecting call to {}: call {} in progress", number, active);
            return Err(SipError::Busy(format!("Call {} is already in progress", active)));
        }

        let session = Arc::new(CallSession::new(
            self.config.clone(),
            number,
            self.session_tx.clone(),
        ));
        let call_id = session.call_id().to_string();

        // Registered before dialing so an instant failure still finds it
        self.calls.write().await.insert(call_id.clone(), session.clone());

        if let Err(e) = session.start().await {
            self.calls.write().await.remove(&call_id);
            return Err(e);
        }

        Ok(call_id)
    }

    /// Get a call by ID
    pub async fn get_call(&self, call_id: &str) -> Option<Arc<CallSession>> {
        self.calls.read().await.get(call_id).cloned()
    }

    /// Get all active calls
    pub async fn active_calls(&self) -> Vec<String> {
        self.calls.read().await.keys().cloned().collect()
    }

    /// Send 16kHz PCM16 audio to a call
    pub async fn send_audio(&self, call_id: &str, pcm: &[u8]) -> Result<(), SipError> {
        self.require(call_id).await?.send_audio(pcm).await;
        Ok(())
    }

    /// Barge-in on a call
    pub async fn stop_audio(&self, call_id: &str) -> Result<(), SipError> {
        self.require(call_id).await?.stop_audio().await;
        Ok(())
    }

    /// Hang up a call
    pub async fn hangup(&self, call_id: &str) -> Result<(), SipError> {
        let session = self.require(call_id).await?;
        session.hangup().await;
        self.calls.write().await.remove(call_id);

        tracing::info!("SIP call ended: {}", call_id);
        Ok(())
    }

    /// Hang up every call and wait for pending releases
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<CallSession>> = self.calls.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.hangup().await;
        }

        let releases: Vec<JoinHandle<()>> = self.releases.lock().await.drain(..).collect();
        for release in releases {
            if let Err(e) = release.await {
                tracing::warn!("Call release ended abnormally: {}", e);
            }
        }
        tracing::info!("Call coordinator shut down");
    }

    async fn require(&self, call_id: &str) -> Result<Arc<CallSession>, SipError> {
        self.get_call(call_id)
            .await
            .ok_or_else(|| SipError::CallNotFound(call_id.to_string()))
    }
}

/// Relay session events outward; unregister and release a call on its last event
async fn route_events(
    mut session_rx: mpsc::Receiver<CallEvent>,
    event_tx: mpsc::Sender<CallEvent>,
    calls: Registry,
    releases: Releases,
) {
    while let Some(event) = session_rx.recv().await {
        if event.is_final() {
            let removed = calls.write().await.remove(event.call_id());
            if let Some(session) = removed {
                tracing::debug!("Call {} unregistered", session.call_id());
                // Released off the router so events keep flowing during the BYE grace
                let release = tokio::spawn(async move { session.hangup().await });
                let mut releases = releases.lock().await;
                releases.retain(|handle| !handle.is_finished());
                releases.push(release);
            }
        }

        if event_tx.send(event).await.is_err() {
            tracing::debug!("Coordinator event receiver dropped");
        }
    }
}
