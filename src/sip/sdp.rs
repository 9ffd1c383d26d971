//! Minimal SDP offer/answer for a single PCMU audio stream

use std::net::{IpAddr, SocketAddr};

/// Create the SDP offer for an outbound call
pub fn create_offer(local_ip: &str, rtp_port: u16, session_id: u64) -> String {
    format!(
        "v=0\r\n\
         o=- {} {} IN IP4 {}\r\n\
         s=VoIP Dialer Call\r\n\
         c=IN IP4 {}\r\n\
         t=0 0\r\n\
         m=audio {} RTP/AVP 0\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=sendrecv\r\n",
        session_id, session_id, local_ip, local_ip, rtp_port
    )
}

/// Extract the remote RTP endpoint from an SDP body.
///
/// A media-level `c=` line overrides the session-level one. Returns `None`
/// when no audio stream or connection address can be found, or the port is 0.
pub fn parse_remote_media(body: &str) -> Option<SocketAddr> {
    let mut session_addr: Option<IpAddr> = None;
    let mut media_addr: Option<IpAddr> = None;
    let mut audio_port: Option<u16> = None;
    let mut in_audio = false;
    let mut in_media = false;

    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("m=") {
            in_media = true;
            in_audio = false;
            let mut fields = rest.split_whitespace();
            if fields.next() == Some("audio") && audio_port.is_none() {
                audio_port = fields.next().and_then(|p| p.parse().ok());
                in_audio = true;
            }
        } else if let Some(rest) = line.strip_prefix("c=") {
            let addr = parse_connection(rest);
            if in_audio {
                media_addr = addr.or(media_addr);
            } else if !in_media {
                session_addr = addr.or(session_addr);
            }
        }
    }

    let port = audio_port.filter(|&p| p != 0)?;
    let ip = media_addr.or(session_addr)?;
    Some(SocketAddr::new(ip, port))
}

/// Parse `IN IP4 <addr>` (IPv6 is accepted as well)
fn parse_connection(rest: &str) -> Option<IpAddr> {
    let mut fields = rest.split_whitespace();
    if fields.next()? != "IN" {
        return None;
    }
    let _addr_type = fields.next()?;
    // Strip an optional multicast TTL suffix ("/127")
    fields.next()?.split('/').next()?.parse().ok()
}
