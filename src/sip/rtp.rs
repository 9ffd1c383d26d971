//! RTP (Real-time Transport Protocol) Media Bridge
//!
//! Handles RTP audio streaming for SIP calls.
//! Implements the RFC 3550 packet format for PCMU only; no RTCP.
//!
//! Outbound audio is queued as μ-law and drained by a single pacer task in
//! 160-byte frames every 20ms. The pacer is the only writer of sequence
//! number and timestamp state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::call::AudioFrame;
use super::codec::AudioCodec;
use super::config::{MediaConfig, FRAME_BYTES, FRAME_MS};
use super::SipError;

/// RTP payload type for G.711 μ-law
pub const PAYLOAD_TYPE_PCMU: u8 = 0;

/// Fixed RTP header length without CSRCs
pub const RTP_HEADER_LEN: usize = 12;

/// RTP packet header (12 bytes minimum)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// RTP version (always 2)
    pub version: u8,
    /// Padding flag
    pub padding: bool,
    /// Extension flag
    pub extension: bool,
    /// CSRC count
    pub csrc_count: u8,
    /// Marker bit
    pub marker: bool,
    /// Payload type (0 = PCMU)
    pub payload_type: u8,
    /// Sequence number
    pub sequence: u16,
    /// Timestamp
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + FRAME_BYTES);

        // First byte: V(2) P(1) X(1) CC(4)
        let first_byte = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrc_count & 0x0F);
        buf.put_u8(first_byte);

        // Second byte: M(1) PT(7)
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));

        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        buf
    }

    /// Parse header from bytes, returning the header and the offset of the payload
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), SipError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(SipError::Rtp("RTP packet too short".to_string()));
        }

        let first_byte = data[0];
        let version = first_byte >> 6;
        if version != 2 {
            return Err(SipError::Rtp(format!("Invalid RTP version: {}", version)));
        }

        let padding = (first_byte >> 5) & 1 == 1;
        let extension = (first_byte >> 4) & 1 == 1;
        let csrc_count = first_byte & 0x0F;

        let second_byte = data[1];
        let marker = (second_byte >> 7) & 1 == 1;
        let payload_type = second_byte & 0x7F;

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut header_len = RTP_HEADER_LEN + csrc_count as usize * 4;
        if extension {
            // 16-bit profile id, 16-bit length in 32-bit words
            if data.len() < header_len + 4 {
                return Err(SipError::Rtp("Truncated RTP header extension".to_string()));
            }
            let words = u16::from_be_bytes([data[header_len + 2], data[header_len + 3]]) as usize;
            header_len += 4 + words * 4;
        }
        if data.len() < header_len {
            return Err(SipError::Rtp("Truncated RTP header".to_string()));
        }

        Ok((
            Self {
                version,
                padding,
                extension,
                csrc_count,
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
            },
            header_len,
        ))
    }
}

/// RTP packet with header and payload
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Serialize packet to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = self.header.to_bytes();
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse packet from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, SipError> {
        let (header, header_len) = RtpHeader::from_bytes(data)?;

        let mut payload_end = data.len();
        if header.padding {
            let pad = data[data.len() - 1] as usize;
            if pad == 0 || header_len + pad > data.len() {
                return Err(SipError::Rtp("Invalid RTP padding".to_string()));
            }
            payload_end -= pad;
        }

        let payload = Bytes::copy_from_slice(&data[header_len..payload_end]);
        Ok(Self { header, payload })
    }
}

/// Sequence/timestamp generator for one outbound stream
#[derive(Debug, Clone)]
pub struct PacketSequencer {
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
}

impl PacketSequencer {
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Random starting sequence, timestamp and SSRC
    pub fn random() -> Self {
        Self::new(rand::random(), rand::random(), rand::random())
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Wrap `payload` in a PCMU packet and advance the stream position
    pub fn next_packet(&mut self, payload: Bytes) -> RtpPacket {
        let header = RtpHeader::new(PAYLOAD_TYPE_PCMU, self.sequence, self.timestamp, self.ssrc);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(payload.len() as u32);
        RtpPacket::new(header, payload)
    }
}

/// Delay before the next pacer tick.
///
/// `drift = elapsed - 20ms`, `delay = max(0, 20ms - drift)`.
pub fn next_tick_delay(elapsed: Duration) -> Duration {
    (Duration::from_millis(FRAME_MS) * 2).saturating_sub(elapsed)
}

/// Whether the starved tick numbered `starved` (from 0) is logged: the first,
/// then one every `interval`
fn starvation_log_due(starved: u64, interval: u64) -> bool {
    starved % interval.max(1) == 0
}

/// Decode one inbound datagram into 16kHz PCM16, or `None` if it must be dropped
pub fn decode_inbound(data: &[u8]) -> Option<AudioFrame> {
    let packet = match RtpPacket::from_bytes(data) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::trace!("Dropping inbound RTP: {}", e);
            return None;
        }
    };

    if packet.header.payload_type != PAYLOAD_TYPE_PCMU {
        tracing::trace!("Dropping inbound RTP with payload type {}", packet.header.payload_type);
        return None;
    }
    if packet.payload.is_empty() {
        return None;
    }

    Some(AudioFrame {
        pcm: Bytes::from(AudioCodec::decode_mulaw(&packet.payload)),
        timestamp: packet.header.timestamp,
        sequence: packet.header.sequence,
    })
}

/// Snapshot of media counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub send_errors: u64,
    pub starvation_ticks: u64,
}

#[derive(Default)]
struct MediaCounters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    send_errors: AtomicU64,
    starvation_ticks: AtomicU64,
}

impl MediaCounters {
    fn snapshot(&self) -> MediaStats {
        MediaStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            starvation_ticks: self.starvation_ticks.load(Ordering::Relaxed),
        }
    }
}

/// RTP media bridge for one call
pub struct RtpMediaBridge {
    config: MediaConfig,
    /// Local UDP socket for RTP, present between start and stop
    socket: RwLock<Option<Arc<UdpSocket>>>,
    /// Remote RTP endpoint, fixed once set
    remote_addr: RwLock<Option<SocketAddr>>,
    /// Pending outbound μ-law bytes
    send_buffer: Arc<Mutex<BytesMut>>,
    /// Stream state handed to the pacer when it starts
    sequencer: Mutex<Option<PacketSequencer>>,
    /// Channel for received audio frames
    audio_tx: mpsc::Sender<AudioFrame>,
    /// Receiver for audio frames
    audio_rx: RwLock<Option<mpsc::Receiver<AudioFrame>>>,
    counters: Arc<MediaCounters>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RtpMediaBridge {
    pub fn new(config: MediaConfig) -> Self {
        Self::with_sequencer(config, PacketSequencer::random())
    }

    /// Create a bridge whose outbound stream starts at a known position
    pub fn with_sequencer(config: MediaConfig, sequencer: PacketSequencer) -> Self {
        let (audio_tx, audio_rx) = mpsc::channel(config.inbound_queue.max(1));

        Self {
            config,
            socket: RwLock::new(None),
            remote_addr: RwLock::new(None),
            send_buffer: Arc::new(Mutex::new(BytesMut::new())),
            sequencer: Mutex::new(Some(sequencer)),
            audio_tx,
            audio_rx: RwLock::new(Some(audio_rx)),
            counters: Arc::new(MediaCounters::default()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the RTP socket on an ephemeral port and start receiving
    pub async fn start(&self) -> Result<u16, SipError> {
        if self.cancel.is_cancelled() {
            return Err(SipError::InvalidState("RTP bridge already stopped".to_string()));
        }

        let mut slot = self.socket.write().await;
        if slot.is_some() {
            return Err(SipError::InvalidState("RTP bridge already started".to_string()));
        }

        let socket = UdpSocket::bind(format!("{}:0", self.config.bind_ip))
            .await
            .map_err(|e| SipError::Rtp(format!("Failed to bind RTP socket: {}", e)))?;
        let socket = Arc::new(socket);
        let port = socket.local_addr()?.port();

        let receiver = tokio::spawn(run_receiver(
            socket.clone(),
            self.audio_tx.clone(),
            self.counters.clone(),
            self.cancel.child_token(),
        ));
        self.tasks.lock().await.push(receiver);
        *slot = Some(socket);

        tracing::debug!("RTP bridge listening on port {}", port);
        Ok(port)
    }

    /// Get the local port, if started
    pub async fn local_port(&self) -> Option<u16> {
        let socket = self.socket.read().await;
        socket.as_ref().and_then(|s| s.local_addr().ok()).map(|a| a.port())
    }

    /// Fix the send target and start the pacer.
    ///
    /// Only the first destination is used; the stream is never renegotiated.
    pub async fn set_remote_destination(&self, addr: SocketAddr) -> Result<(), SipError> {
        let socket = self
            .socket
            .read()
            .await
            .clone()
            .ok_or_else(|| SipError::InvalidState("RTP bridge not started".to_string()))?;

        let mut remote = self.remote_addr.write().await;
        match *remote {
            Some(current) if current == addr => return Ok(()),
            Some(current) => {
                tracing::warn!("Ignoring RTP re-target {} (fixed at {})", addr, current);
                return Ok(());
            }
            None => *remote = Some(addr),
        }

        let sequencer = self
            .sequencer
            .lock()
            .await
            .take()
            .ok_or_else(|| SipError::InvalidState("RTP pacer already started".to_string()))?;

        let pacer = tokio::spawn(run_pacer(
            socket,
            addr,
            self.send_buffer.clone(),
            sequencer,
            self.config.clone(),
            self.counters.clone(),
            self.cancel.child_token(),
        ));
        self.tasks.lock().await.push(pacer);

        tracing::info!("RTP remote destination set to {}", addr);
        Ok(())
    }

    pub async fn remote_destination(&self) -> Option<SocketAddr> {
        *self.remote_addr.read().await
    }

    /// Take the audio receiver (can only be called once)
    pub async fn take_audio_receiver(&self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.audio_rx.write().await.take()
    }

    /// Queue 16kHz PCM16 audio for transmission. Never sends directly.
    pub async fn send_audio(&self, pcm: &[u8]) {
        if self.cancel.is_cancelled() {
            return;
        }
        let encoded = AudioCodec::encode_mulaw_with_gain(pcm, self.config.encode_gain);
        self.send_buffer.lock().await.extend_from_slice(&encoded);
    }

    /// Drop all queued outbound audio (barge-in)
    pub async fn clear_audio_buffer(&self) {
        let discarded = std::mem::take(&mut *self.send_buffer.lock().await);
        if !discarded.is_empty() {
            tracing::debug!("Cleared {} bytes of queued audio", discarded.len());
        }
    }

    /// Number of μ-law bytes waiting to be sent
    pub async fn buffered_bytes(&self) -> usize {
        self.send_buffer.lock().await.len()
    }

    pub fn stats(&self) -> MediaStats {
        self.counters.snapshot()
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the pacer and receiver, close the socket and clear buffers
    pub async fn stop(&self) {
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("RTP task ended abnormally: {}", e);
            }
        }

        if self.socket.write().await.take().is_some() {
            tracing::debug!("RTP socket closed");
        }
        self.clear_audio_buffer().await;
    }
}

async fn run_receiver(
    socket: Arc<UdpSocket>,
    audio_tx: mpsc::Sender<AudioFrame>,
    counters: Arc<MediaCounters>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 2048];

    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, _addr)) => len,
                Err(e) => {
                    tracing::warn!("RTP receive error: {}", e);
                    continue;
                }
            },
        };

        let Some(frame) = decode_inbound(&buf[..len]) else {
            counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        counters.packets_received.fetch_add(1, Ordering::Relaxed);

        match audio_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Inbound audio queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

async fn run_pacer(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    send_buffer: Arc<Mutex<BytesMut>>,
    mut sequencer: PacketSequencer,
    config: MediaConfig,
    counters: Arc<MediaCounters>,
    cancel: CancellationToken,
) {
    let mut primed = false;
    let mut delay = Duration::from_millis(FRAME_MS);
    let mut last_tick = Instant::now();
    let log_interval = config.starvation_log_interval.max(1);

    tracing::debug!("RTP pacer started (ssrc {:08x})", sequencer.ssrc());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let now = Instant::now();
        let elapsed = now.duration_since(last_tick);
        last_tick = now;

        let payload = {
            let mut buffer = send_buffer.lock().await;
            if !primed && buffer.len() < config.jitter_prime_bytes {
                None
            } else if buffer.len() >= FRAME_BYTES {
                primed = true;
                Some(buffer.split_to(FRAME_BYTES).freeze())
            } else {
                if !buffer.is_empty() {
                    let starved = counters.starvation_ticks.fetch_add(1, Ordering::Relaxed);
                    if starvation_log_due(starved, log_interval) {
                        tracing::debug!(
                            "RTP send buffer starved ({} bytes queued, {} starved ticks)",
                            buffer.len(),
                            starved + 1
                        );
                    }
                }
                None
            }
        };

        if let Some(payload) = payload {
            let packet = sequencer.next_packet(payload);
            match socket.send_to(&packet.to_bytes(), remote).await {
                Ok(_) => {
                    counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("RTP send to {} failed: {}", remote, e);
                }
            }
        }

        delay = next_tick_delay(elapsed);
    }

    tracing::debug!("RTP pacer stopped");
}
