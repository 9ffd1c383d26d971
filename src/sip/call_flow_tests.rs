//! Call flow tests against a fake carrier
//!
//! A UDP socket on 127.0.0.1 plays the SIP trunk and a second one plays the
//! carrier's media endpoint. These tests verify:
//! - Dial, ringing and answer with ACK
//! - Paced RTP output after jitter priming
//! - Digest authentication retries and their limit
//! - Rejection, remote hangup and local hangup
//! - Single-call admission control
//! - Serialized teardown when hangups race

#[cfg(test)]
mod tests {
    use super::super::{
        auth::{self, ChallengeKind, DigestCredentials},
        message, sdp, CallCoordinator, CallEvent, CallSession, MediaConfig, SipConfig, SipError,
    };
    use ftth_rsip as rsip;
    use rsip::headers::auth::AuthQop;
    use rsip::headers::ToTypedHeader;
    use rsip::{Header, Method, Request, Response, SipMessage};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    // ============================================================================
    // Helper Functions
    // ============================================================================

    /// Fake SIP trunk
    struct FakeCarrier {
        socket: UdpSocket,
    }

    impl FakeCarrier {
        async fn bind() -> Self {
            Self {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        fn port(&self) -> u16 {
            self.socket.local_addr().unwrap().port()
        }

        /// Next request from the client, skipping responses
        async fn recv_request(&self) -> (Request, SocketAddr) {
            let mut buf = vec![0u8; 65535];
            loop {
                let (len, from) = timeout(WAIT, self.socket.recv_from(&mut buf))
                    .await
                    .expect("timed out waiting for a SIP request")
                    .unwrap();
                if let SipMessage::Request(request) = message::parse(&buf[..len]).unwrap() {
                    return (request, from);
                }
            }
        }

        /// Next response from the client, skipping requests
        async fn recv_response(&self) -> Response {
            let mut buf = vec![0u8; 65535];
            loop {
                let (len, _) = timeout(WAIT, self.socket.recv_from(&mut buf))
                    .await
                    .expect("timed out waiting for a SIP response")
                    .unwrap();
                if let SipMessage::Response(response) = message::parse(&buf[..len]).unwrap() {
                    return response;
                }
            }
        }

        /// `true` if nothing arrives within `window`
        async fn is_quiet(&self, window: Duration) -> bool {
            let mut buf = vec![0u8; 65535];
            timeout(window, self.socket.recv_from(&mut buf)).await.is_err()
        }

        async fn send(&self, text: String, to: SocketAddr) {
            self.socket.send_to(text.as_bytes(), to).await.unwrap();
        }

        async fn respond(&self, request: &Request, code: u16, to: SocketAddr) {
            self.send(response_to(request, code, &[], ""), to).await;
        }
    }

    /// Carrier media endpoint, on port 40000 when it is free
    async fn bind_media_peer() -> UdpSocket {
        match UdpSocket::bind("127.0.0.1:40000").await {
            Ok(socket) => socket,
            Err(_) => UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn test_config(trunk_port: u16) -> SipConfig {
        SipConfig {
            trunk_host: "127.0.0.1".to_string(),
            trunk_port,
            username: "alice".to_string(),
            password: "secret".to_string(),
            caller_id: "+15550001111".to_string(),
            domain: "sip.example.com".to_string(),
            local_ip: Some("127.0.0.1".to_string()),
            media: MediaConfig {
                bind_ip: "127.0.0.1".to_string(),
                bye_grace_ms: 20,
                ..MediaConfig::default()
            },
            ..SipConfig::default()
        }
    }

    /// Wire text of the response a carrier would send, tagging the To header
    fn response_to(request: &Request, code: u16, extra: &[(&str, &str)], body: &str) -> String {
        SipMessage::Response(message::response_to(request, code, extra, body)).to_string()
    }

    fn get(request: &Request, name: &str) -> Option<String> {
        message::header_value(&request.headers, name)
    }

    fn body(request: &Request) -> String {
        String::from_utf8_lossy(&request.body).into_owned()
    }

    fn sdp_answer(media: &UdpSocket) -> String {
        let port = media.local_addr().unwrap().port();
        format!(
            "v=0\r\no=- 7 7 IN IP4 127.0.0.1\r\ns=carrier\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio {} RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n",
            port
        )
    }

    /// Next lifecycle event, skipping inbound audio
    async fn next_event(events: &mut mpsc::Receiver<CallEvent>) -> CallEvent {
        loop {
            let event = timeout(WAIT, events.recv())
                .await
                .expect("timed out waiting for a call event")
                .expect("event channel closed");
            if !matches!(event, CallEvent::AudioReceived { .. }) {
                return event;
            }
        }
    }

    /// Answer `invite` with 200 OK + SDP and consume the ACK
    async fn answer(carrier: &FakeCarrier, invite: &Request, ua: SocketAddr, media: &UdpSocket) -> Request {
        let body = sdp_answer(media);
        carrier
            .send(
                response_to(invite, 200, &[("Contact", "<sip:gw@127.0.0.1>")], &body),
                ua,
            )
            .await;
        let (ack, _) = carrier.recv_request().await;
        ack
    }

    // ============================================================================
    // End-to-End Integration Tests
    // ============================================================================

    #[tokio::test]
    async fn test_outbound_call_ringing_answer_and_media() {
        let carrier = FakeCarrier::bind().await;
        let media_peer = bind_media_peer().await;
        let (coordinator, mut events) = CallCoordinator::new(test_config(carrier.port()));

        let call_id = coordinator.place_call("+15551234567").await.unwrap();
        assert_eq!(coordinator.active_calls().await, vec![call_id.clone()]);

        let (invite, ua) = carrier.recv_request().await;
        assert_eq!(invite.method, Method::Invite);
        assert_eq!(invite.uri.to_string(), "sip:15551234567@sip.example.com");
        assert_eq!(get(&invite, "CSeq").as_deref(), Some("1 INVITE"));
        assert!(get(&invite, "Call-ID").unwrap().starts_with(&call_id));
        assert!(body(&invite).contains("m=audio "));
        assert!(body(&invite).contains("a=rtpmap:0 PCMU/8000"));

        carrier.respond(&invite, 100, ua).await;
        carrier.respond(&invite, 180, ua).await;
        match next_event(&mut events).await {
            CallEvent::Ringing { call_id: id } => assert_eq!(id, call_id),
            other => panic!("expected ringing, got {:?}", other),
        }

        let ack = answer(&carrier, &invite, ua, &media_peer).await;
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(get(&ack, "CSeq").as_deref(), Some("1 ACK"));
        assert!(get(&ack, "To").unwrap().ends_with(";tag=carrier-1"));
        assert_eq!(get(&ack, "Call-ID"), get(&invite, "Call-ID"));
        match next_event(&mut events).await {
            CallEvent::Connected { call_id: id } => assert_eq!(id, call_id),
            other => panic!("expected connected, got {:?}", other),
        }

        // 10ms of 16kHz audio is 80 μ-law bytes: buffered but below priming
        coordinator.send_audio(&call_id, &[0u8; 320]).await.unwrap();
        let mut buf = [0u8; 2048];
        assert!(timeout(Duration::from_millis(80), media_peer.recv_from(&mut buf)).await.is_err());

        // Top up to the 480-byte priming threshold
        coordinator.send_audio(&call_id, &vec![0u8; 1600]).await.unwrap();
        let (len, _) = timeout(Duration::from_millis(500), media_peer.recv_from(&mut buf))
            .await
            .expect("no RTP packet after priming")
            .unwrap();
        assert_eq!(len, 172);
        assert_eq!(buf[0], 0x80);
        assert_eq!(buf[1], 0);

        coordinator.hangup(&call_id).await.unwrap();
        let (bye, _) = carrier.recv_request().await;
        assert_eq!(bye.method, Method::Bye);
        assert_eq!(get(&bye, "CSeq").as_deref(), Some("2 BYE"));
        assert_eq!(bye.uri.to_string(), "sip:gw@127.0.0.1");
        assert!(matches!(next_event(&mut events).await, CallEvent::Ended { .. }));
        assert!(coordinator.active_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_digest_challenge_is_answered() {
        let carrier = FakeCarrier::bind().await;
        let media_peer = bind_media_peer().await;
        let (tx, mut events) = mpsc::channel(32);
        let session = CallSession::dial(Arc::new(test_config(carrier.port())), "+15551234567", tx)
            .await
            .unwrap();

        let (invite, ua) = carrier.recv_request().await;
        carrier
            .send(
                response_to(
                    &invite,
                    401,
                    &[("WWW-Authenticate", r#"Digest realm="x", nonce="y", qop="auth""#)],
                    "",
                ),
                ua,
            )
            .await;

        let (ack, _) = carrier.recv_request().await;
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(get(&ack, "CSeq").as_deref(), Some("1 ACK"));
        assert_eq!(get(&ack, "Via"), get(&invite, "Via"));

        let (retry, _) = carrier.recv_request().await;
        assert_eq!(retry.method, Method::Invite);
        assert_eq!(get(&retry, "CSeq").as_deref(), Some("2 INVITE"));
        assert_eq!(get(&retry, "Call-ID"), get(&invite, "Call-ID"));
        assert_ne!(get(&retry, "Via"), get(&invite, "Via"));

        let authorization = retry
            .headers
            .iter()
            .find_map(|header| match header {
                Header::Authorization(value) => value.typed().ok(),
                _ => None,
            })
            .expect("Authorization missing");
        assert_eq!(authorization.realm, "x");
        assert_eq!(authorization.nonce, "y");
        let qop = authorization.qop.as_ref().expect("qop missing");
        let AuthQop::Auth { cnonce, nc } = qop else {
            panic!("expected qop=auth, got {:?}", qop);
        };
        assert!(!cnonce.is_empty());
        assert_eq!(*nc, 1);

        let challenged = format!(
            "SIP/2.0 401 Unauthorized\r\nCall-ID: a\r\nCSeq: 1 INVITE\r\nWWW-Authenticate: {}\r\nContent-Length: 0\r\n\r\n",
            r#"Digest realm="x", nonce="y", qop="auth""#
        );
        let SipMessage::Response(challenged) = message::parse(challenged.as_bytes()).unwrap() else {
            panic!("expected response");
        };
        let challenge = auth::select_challenge(&challenged, ChallengeKind::Www).unwrap();
        let credentials = DigestCredentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
        };
        let expected =
            auth::compute_response(&credentials, &challenge, &Method::Invite, &invite.uri, Some(qop)).unwrap();
        assert_eq!(authorization.response, expected);

        answer(&carrier, &retry, ua, &media_peer).await;
        assert!(matches!(next_event(&mut events).await, CallEvent::Connected { .. }));

        session.hangup().await;
        assert!(matches!(next_event(&mut events).await, CallEvent::Ended { .. }));
    }

    #[tokio::test]
    async fn test_challenge_loop_is_bounded() {
        let carrier = FakeCarrier::bind().await;
        let (tx, mut events) = mpsc::channel(32);
        let session = CallSession::dial(Arc::new(test_config(carrier.port())), "100", tx)
            .await
            .unwrap();

        let mut invites = 0;
        let (mut invite, ua) = carrier.recv_request().await;
        loop {
            assert_eq!(invite.method, Method::Invite);
            invites += 1;
            carrier
                .send(
                    response_to(
                        &invite,
                        407,
                        &[("Proxy-Authenticate", r#"Digest realm="x", nonce="y""#)],
                        "",
                    ),
                    ua,
                )
                .await;

            let (ack, _) = carrier.recv_request().await;
            assert_eq!(ack.method, Method::Ack);

            if invites == 4 {
                break;
            }
            invite = carrier.recv_request().await.0;
            assert!(invite
                .headers
                .iter()
                .any(|header| matches!(header, Header::ProxyAuthorization(_))));
        }

        match next_event(&mut events).await {
            CallEvent::Failed { reason, .. } => assert!(reason.contains("Authentication")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(carrier.is_quiet(Duration::from_millis(100)).await);
        session.hangup().await;
    }

    #[tokio::test]
    async fn test_rejected_call_fails_and_unregisters() {
        let carrier = FakeCarrier::bind().await;
        let (coordinator, mut events) = CallCoordinator::new(test_config(carrier.port()));
        let call_id = coordinator.place_call("100").await.unwrap();
        let session = coordinator.get_call(&call_id).await.unwrap();

        let (invite, ua) = carrier.recv_request().await;
        carrier.respond(&invite, 486, ua).await;

        let (ack, _) = carrier.recv_request().await;
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(get(&ack, "CSeq").as_deref(), Some("1 ACK"));

        match next_event(&mut events).await {
            CallEvent::Failed { call_id: id, reason } => {
                assert_eq!(id, call_id);
                assert!(reason.starts_with("486"), "unexpected reason {}", reason);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(coordinator.active_calls().await.is_empty());

        // The release started by the router is awaited on shutdown
        coordinator.shutdown().await;
        assert!(session.is_released().await);
    }

    #[tokio::test]
    async fn test_remote_hangup_is_confirmed() {
        let carrier = FakeCarrier::bind().await;
        let media_peer = bind_media_peer().await;
        let (coordinator, mut events) = CallCoordinator::new(test_config(carrier.port()));
        let call_id = coordinator.place_call("100").await.unwrap();

        let (invite, ua) = carrier.recv_request().await;
        let ack = answer(&carrier, &invite, ua, &media_peer).await;
        assert!(matches!(next_event(&mut events).await, CallEvent::Connected { .. }));

        let bye = format!(
            "BYE {} SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1:{};branch=z9hG4bKcarrierbye\r\nFrom: {}\r\nTo: {}\r\nCall-ID: {}\r\nCSeq: 20 BYE\r\nContent-Length: 0\r\n\r\n",
            get(&invite, "Contact").unwrap().trim_matches(|c: char| c == '<' || c == '>'),
            carrier.port(),
            get(&ack, "To").unwrap(),
            get(&invite, "From").unwrap(),
            get(&invite, "Call-ID").unwrap(),
        );
        carrier.send(bye, ua).await;

        let ok = carrier.recv_response().await;
        assert_eq!(message::status_code(&ok), 200);
        assert_eq!(message::header_value(&ok.headers, "CSeq").as_deref(), Some("20 BYE"));

        match next_event(&mut events).await {
            CallEvent::Ended { call_id: id } => assert_eq!(id, call_id),
            other => panic!("expected ended, got {:?}", other),
        }
        assert!(coordinator.active_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_audio_flows_both_ways_and_barge_in_flushes() {
        let carrier = FakeCarrier::bind().await;
        let media_peer = bind_media_peer().await;
        let (coordinator, mut events) = CallCoordinator::new(test_config(carrier.port()));
        let call_id = coordinator.place_call("100").await.unwrap();

        let (invite, ua) = carrier.recv_request().await;
        let client_media = sdp::parse_remote_media(&body(&invite)).unwrap();
        answer(&carrier, &invite, ua, &media_peer).await;
        assert!(matches!(next_event(&mut events).await, CallEvent::Connected { .. }));

        // Inbound: one PCMU packet becomes 640 bytes of 16kHz PCM
        let mut packet = vec![0x80, 0x00, 0x00, 0x01, 0, 0, 0, 160, 1, 2, 3, 4];
        packet.extend_from_slice(&[0xFFu8; 160]);
        media_peer.send_to(&packet, client_media).await.unwrap();

        let frame = loop {
            let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let CallEvent::AudioReceived { call_id: id, frame } = event {
                assert_eq!(id, call_id);
                break frame;
            }
        };
        assert_eq!(frame.pcm.len(), 640);
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.timestamp, 160);

        // Outbound: half a second of audio, interrupted after the first packet
        coordinator.send_audio(&call_id, &vec![0u8; 16_000]).await.unwrap();
        let mut buf = [0u8; 2048];
        timeout(Duration::from_millis(500), media_peer.recv_from(&mut buf))
            .await
            .expect("no RTP packet")
            .unwrap();
        coordinator.stop_audio(&call_id).await.unwrap();

        let mut after_flush = 0;
        while timeout(Duration::from_millis(100), media_peer.recv_from(&mut buf)).await.is_ok() {
            after_flush += 1;
        }
        assert!(after_flush <= 2, "{} packets sent after barge-in", after_flush);

        coordinator.hangup(&call_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_call_is_rejected_while_busy() {
        let carrier = FakeCarrier::bind().await;
        let (coordinator, mut events) = CallCoordinator::new(test_config(carrier.port()));

        let first = coordinator.place_call("100").await.unwrap();
        let (invite, _) = carrier.recv_request().await;
        assert_eq!(invite.method, Method::Invite);

        assert!(matches!(coordinator.place_call("200").await, Err(SipError::Busy(_))));
        assert!(carrier.is_quiet(Duration::from_millis(50)).await);

        // Hanging up before an answer ends the call locally
        coordinator.hangup(&first).await.unwrap();
        assert!(matches!(next_event(&mut events).await, CallEvent::Ended { .. }));
        assert!(carrier.is_quiet(Duration::from_millis(50)).await);

        let second = coordinator.place_call("200").await.unwrap();
        assert_ne!(first, second);
        let (invite, _) = carrier.recv_request().await;
        assert_eq!(invite.uri.to_string(), "sip:200@sip.example.com");
        coordinator.shutdown().await;
        assert!(coordinator.active_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_racing_hangups_send_one_bye() {
        let carrier = FakeCarrier::bind().await;
        let media_peer = bind_media_peer().await;
        let (coordinator, mut events) = CallCoordinator::new(test_config(carrier.port()));
        let call_id = coordinator.place_call("100").await.unwrap();
        let session = coordinator.get_call(&call_id).await.unwrap();

        let (invite, ua) = carrier.recv_request().await;
        answer(&carrier, &invite, ua, &media_peer).await;
        assert!(matches!(next_event(&mut events).await, CallEvent::Connected { .. }));

        let (_, hung_up) = tokio::join!(session.hangup(), coordinator.hangup(&call_id));
        hung_up.unwrap();
        assert!(session.is_released().await);

        let (bye, _) = carrier.recv_request().await;
        assert_eq!(bye.method, Method::Bye);
        assert!(carrier.is_quiet(Duration::from_millis(100)).await);

        assert!(matches!(next_event(&mut events).await, CallEvent::Ended { .. }));
        assert!(timeout(Duration::from_millis(100), next_event(&mut events)).await.is_err());
        assert!(coordinator.active_calls().await.is_empty());
        coordinator.shutdown().await;
    }
}
