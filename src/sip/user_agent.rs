//! SIP signaling client
//!
//! Drives one [`Call`] dialog over a UDP socket to the SIP trunk. The dialog
//! itself is a pure state machine; this module owns the socket, the receive
//! loop and the media bridge wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ftth_rsip as rsip;
use rsip::{SipMessage, Uri};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::auth::DigestCredentials;
use super::call::{CallEvent, CallState};
use super::config::SipConfig;
use super::dialog::{Call, DialogAction, DialogParams};
use super::message;
use super::rtp::RtpMediaBridge;
use super::sdp;
use super::SipError;

/// Largest datagram accepted on the signaling socket
const MAX_DATAGRAM: usize = 65_535;

/// Pause after a failed receive before polling the socket again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// State shared between the client and its receive loop
struct DialogContext {
    call: Mutex<Call>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    trunk_addr: SocketAddr,
    media: Arc<RtpMediaBridge>,
    event_tx: mpsc::Sender<CallEvent>,
}

impl DialogContext {
    /// Carry out dialog actions in order. Sends go to `target`.
    async fn execute(&self, actions: Vec<DialogAction>, target: SocketAddr) {
        for action in actions {
            match action {
                DialogAction::Send(text) => self.send(&text, target).await,
                DialogAction::SetRemoteMedia(addr) => {
                    if let Err(e) = self.media.set_remote_destination(addr).await {
                        tracing::warn!("Failed to set RTP destination {}: {}", addr, e);
                    }
                }
                DialogAction::StopMedia => self.media.stop().await,
                DialogAction::Emit(event) => {
                    if self.event_tx.send(event).await.is_err() {
                        tracing::debug!("Call event receiver dropped");
                    }
                }
            }
        }
    }

    async fn send(&self, text: &str, target: SocketAddr) {
        let socket = self.socket.read().await.clone();
        let Some(socket) = socket else {
            tracing::debug!("Signaling socket closed, dropping outbound message");
            return;
        };

        match socket.send_to(text.as_bytes(), target).await {
            Ok(_) => tracing::trace!("SIP >> {}\n{}", target, text),
            Err(e) => tracing::warn!("SIP send to {} failed: {}", target, e),
        }
    }

    async fn state(&self) -> CallState {
        self.call.lock().await.state()
    }

    async fn close_socket(&self) {
        if self.socket.write().await.take().is_some() {
            tracing::debug!("Signaling socket closed");
        }
    }
}

/// SIP signaling client for exactly one outbound call
pub struct SipSignalingClient {
    config: Arc<SipConfig>,
    call_id: String,
    media: Arc<RtpMediaBridge>,
    event_tx: mpsc::Sender<CallEvent>,
    context: RwLock<Option<Arc<DialogContext>>>,
    cancel: CancellationToken,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl SipSignalingClient {
    /// Create a client for `call_id`; the media bridge is owned by the caller
    pub fn new(
        config: Arc<SipConfig>,
        call_id: String,
        media: Arc<RtpMediaBridge>,
        event_tx: mpsc::Sender<CallEvent>,
    ) -> Self {
        Self {
            config,
            call_id,
            media,
            event_tx,
            context: RwLock::new(None),
            cancel: CancellationToken::new(),
            recv_task: Mutex::new(None),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Current dialog state (`Idle` before [`SipSignalingClient::dial`])
    pub async fn state(&self) -> CallState {
        match self.context.read().await.clone() {
            Some(ctx) => ctx.state().await,
            None => CallState::Idle,
        }
    }

    /// Local address of the signaling socket while it is open
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let ctx = self.context.read().await.clone()?;
        let socket = ctx.socket.read().await.clone()?;
        socket.local_addr().ok()
    }

    /// Start the media bridge and send the INVITE for `number`
    pub async fn dial(&self, number: &str) -> Result<(), SipError> {
        self.config.validate()?;
        let request_uri = parse_uri(&self.config.callee_uri(number))?;
        let from_uri = parse_uri(&self.config.caller_uri())?;

        let mut slot = self.context.write().await;
        if slot.is_some() || self.cancel.is_cancelled() {
            return Err(SipError::InvalidState(format!(
                "Call {} has already been dialed",
                self.call_id
            )));
        }

        let trunk_addr = resolve_trunk(&self.config).await?;
        let local_ip = detect_local_ip(&self.config, trunk_addr).await?;

        let socket = UdpSocket::bind(("0.0.0.0", self.config.sip_port))
            .await
            .map_err(|e| SipError::Transport(format!("Failed to bind SIP socket: {}", e)))?;
        let local_port = socket.local_addr()?.port();
        let contact_uri = parse_uri(&self.config.contact_uri(&local_ip, local_port))?;
        let socket = Arc::new(socket);

        let rtp_port = self.media.start().await?;
        let offer = sdp::create_offer(&local_ip, rtp_port, u64::from(rand::random::<u32>()));

        let params = DialogParams {
            call_id: self.call_id.clone(),
            local_ip: local_ip.clone(),
            local_port,
            request_uri,
            from_uri,
            display_name: (!self.config.caller_id.is_empty()).then(|| self.config.caller_id.clone()),
            contact_uri,
            user_agent: self.config.user_agent.clone(),
            credentials: DigestCredentials {
                username: self.config.username.clone(),
                password: self.config.password.clone(),
            },
        };

        tracing::info!(
            "Dialing {} via {} (call_id: {}, SIP {}:{}, RTP {})",
            number,
            trunk_addr,
            self.call_id,
            local_ip,
            local_port,
            rtp_port
        );

        let mut call = Call::new(params);
        let actions = call.invite(offer);

        let ctx = Arc::new(DialogContext {
            call: Mutex::new(call),
            socket: RwLock::new(Some(socket.clone())),
            trunk_addr,
            media: self.media.clone(),
            event_tx: self.event_tx.clone(),
        });
        *slot = Some(ctx.clone());
        drop(slot);

        let task = tokio::spawn(run_signaling(ctx.clone(), socket, self.cancel.child_token()));
        *self.recv_task.lock().await = Some(task);

        ctx.execute(actions, trunk_addr).await;
        Ok(())
    }

    /// Tear the call down.
    ///
    /// A connected call gets a BYE; media is stopped after the configured grace
    /// delay so the BYE can leave first. An unanswered call is ended locally.
    /// Failures along the way are logged and never stop the teardown.
    pub async fn hangup(&self) {
        let Some(ctx) = self.context.read().await.clone() else {
            self.cancel.cancel();
            return;
        };

        let before = ctx.state().await;
        let actions = ctx.call.lock().await.hangup();
        ctx.execute(actions, ctx.trunk_addr).await;

        if before == CallState::Connected || before.is_early() {
            tokio::time::sleep(Duration::from_millis(self.config.media.bye_grace_ms)).await;
        }

        let actions = ctx.call.lock().await.complete_termination();
        ctx.execute(actions, ctx.trunk_addr).await;

        self.close().await;
        tracing::info!("Call {} torn down ({})", self.call_id, ctx.state().await);
    }

    /// Stop the receive loop and release the signaling socket
    async fn close(&self) {
        self.cancel.cancel();

        if let Some(task) = self.recv_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("Signaling task ended abnormally: {}", e);
            }
        }

        if let Some(ctx) = self.context.read().await.clone() {
            ctx.close_socket().await;
        }
    }
}

impl Drop for SipSignalingClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Receive loop: parse each datagram and feed it to the dialog
async fn run_signaling(ctx: Arc<DialogContext>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, src) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("SIP receive error: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECV_ERROR_BACKOFF) => continue,
                    }
                }
            },
        };

        let incoming = match message::parse(&buf[..len]) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::debug!("Dropping unparsable datagram from {}: {}", src, e);
                continue;
            }
        };
        tracing::trace!("SIP << {}\n{}", src, String::from_utf8_lossy(&buf[..len]));

        // Replies to carrier requests go back to where the request came from
        let target = match incoming {
            SipMessage::Request(_) => src,
            SipMessage::Response(_) => ctx.trunk_addr,
        };

        let (actions, failed) = {
            let mut call = ctx.call.lock().await;
            let actions = call.handle_message(incoming);
            (actions, call.state() == CallState::Failed)
        };
        ctx.execute(actions, target).await;

        // A failed dialog has nothing left to say
        if failed {
            break;
        }
    }

    ctx.close_socket().await;
    tracing::debug!("Signaling loop finished");
}

fn parse_uri(value: &str) -> Result<Uri, SipError> {
    Uri::try_from(value).map_err(|e| SipError::Config(format!("Invalid SIP URI {}: {}", value, e)))
}

/// Resolve the trunk host to its first address
async fn resolve_trunk(config: &SipConfig) -> Result<SocketAddr, SipError> {
    let target = format!("{}:{}", config.trunk_host, config.trunk_port);
    let addr = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| SipError::Transport(format!("DNS resolution failed for {}: {}", target, e)))?
        .next()
        .ok_or_else(|| SipError::Transport(format!("No addresses found for {}", target)))?;

    tracing::debug!("SIP trunk {} resolved to {}", config.trunk_host, addr);
    Ok(addr)
}

/// Local IP to advertise: the configured one, or the source address the OS
/// would pick to reach the trunk
async fn detect_local_ip(config: &SipConfig, trunk_addr: SocketAddr) -> Result<String, SipError> {
    if let Some(ip) = config.local_ip.as_ref().filter(|ip| !ip.is_empty()) {
        return Ok(ip.clone());
    }

    let probe = UdpSocket::bind("0.0.0.0:0").await?;
    probe.connect(trunk_addr).await?;
    let ip = probe.local_addr()?.ip().to_string();

    tracing::debug!("Detected local IP {}", ip);
    Ok(ip)
}
