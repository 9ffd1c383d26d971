//! SIP dialog state machine for one outbound call
//!
//! `Call` holds no sockets. Every input (a received message, a hangup request)
//! returns the list of [`DialogAction`]s the transport driver must carry out,
//! in order.

use std::net::SocketAddr;

use ftth_rsip as rsip;
use rsip::message::headers_ext::HeadersExt;
use rsip::{typed, Header, Method, Request, Response, SipMessage, StatusCode, Uri, Version};

use super::auth::{self, ChallengeKind, DigestCredentials};
use super::call::{CallEvent, CallState};
use super::message;
use super::sdp;

/// Challenges answered before giving up
pub const MAX_AUTH_ATTEMPTS: u8 = 3;

const ALLOW: &str = "INVITE, ACK, BYE";

/// Side effect requested by the dialog
#[derive(Debug, Clone)]
pub enum DialogAction {
    /// Send a message to the carrier's signaling address
    Send(String),
    /// Point the media bridge at the negotiated remote RTP endpoint
    SetRemoteMedia(SocketAddr),
    /// Tear the media bridge down
    StopMedia,
    /// Forward a lifecycle event to the orchestration layer
    Emit(CallEvent),
}

/// Static dialog parameters, fixed when the call is created
#[derive(Debug, Clone)]
pub struct DialogParams {
    /// Application call id used to tag events
    pub call_id: String,
    /// Address advertised in Via and Contact
    pub local_ip: String,
    pub local_port: u16,
    /// `sip:<number>@<domain>`
    pub request_uri: Uri,
    /// `sip:<user>@<domain>`
    pub from_uri: Uri,
    /// Display name for the From header (caller id)
    pub display_name: Option<String>,
    pub contact_uri: Uri,
    pub user_agent: String,
    pub credentials: DigestCredentials,
}

/// One outbound telephony dialog
#[derive(Debug)]
pub struct Call {
    params: DialogParams,
    sip_call_id: String,
    from_tag: String,
    to_tag: Option<String>,
    remote_target: Option<Uri>,
    state: CallState,
    cseq: u32,
    invite_cseq: u32,
    sdp_offer: String,
    auth_attempts: u8,
    last_auth_cseq: Option<u32>,
    remote_media: Option<SocketAddr>,
    ringing_emitted: bool,
    cancelled_early: bool,
}

impl Call {
    pub fn new(params: DialogParams) -> Self {
        let sip_call_id = format!("{}@{}", params.call_id, params.local_ip);
        Self {
            params,
            sip_call_id,
            from_tag: message::new_tag(),
            to_tag: None,
            remote_target: None,
            state: CallState::Idle,
            cseq: 0,
            invite_cseq: 0,
            sdp_offer: String::new(),
            auth_attempts: 0,
            last_auth_cseq: None,
            remote_media: None,
            ringing_emitted: false,
            cancelled_early: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.params.call_id
    }

    pub fn sip_call_id(&self) -> &str {
        &self.sip_call_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    pub fn auth_attempts(&self) -> u8 {
        self.auth_attempts
    }

    pub fn from_tag(&self) -> &str {
        &self.from_tag
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to_tag.as_deref()
    }

    pub fn remote_media(&self) -> Option<SocketAddr> {
        self.remote_media
    }

    /// `Idle -> Inviting`: build the initial INVITE carrying `sdp_offer`
    pub fn invite(&mut self, sdp_offer: String) -> Vec<DialogAction> {
        if self.state != CallState::Idle {
            tracing::warn!("Call {} - INVITE requested in state {}", self.id(), self.state);
            return Vec::new();
        }

        self.sdp_offer = sdp_offer;
        self.cseq += 1;
        self.invite_cseq = self.cseq;
        self.state = CallState::Inviting;

        tracing::info!("Call {} - INVITE {} (CSeq {})", self.id(), self.params.request_uri, self.cseq);
        vec![send_request(self.build_invite(None))]
    }

    /// Feed a message received on the signaling socket
    pub fn handle_message(&mut self, message: SipMessage) -> Vec<DialogAction> {
        if message::call_id(&message) != Some(self.sip_call_id.as_str()) {
            tracing::debug!("Call {} - ignoring message for another Call-ID", self.id());
            return Vec::new();
        }

        match message {
            SipMessage::Response(response) => self.handle_response(response),
            SipMessage::Request(request) => self.handle_request(request),
        }
    }

    /// Local teardown. From `Connected` this sends BYE and leaves the call in
    /// `Terminating` until [`Call::complete_termination`] is called.
    pub fn hangup(&mut self) -> Vec<DialogAction> {
        match self.state {
            CallState::Connected => {
                self.cseq += 1;
                self.state = CallState::Terminating;
                tracing::info!("Call {} - sending BYE (CSeq {})", self.id(), self.cseq);
                vec![send_request(self.build_bye())]
            }
            CallState::Idle | CallState::Inviting | CallState::Ringing | CallState::EarlyMedia => {
                tracing::info!("Call {} - cancelled locally in state {}", self.id(), self.state);
                self.cancelled_early = self.state.is_early();
                self.state = CallState::Terminated;
                self.ended()
            }
            CallState::Terminating | CallState::Terminated | CallState::Failed => Vec::new(),
        }
    }

    /// `Terminating -> Terminated` once the BYE has had time to flush
    pub fn complete_termination(&mut self) -> Vec<DialogAction> {
        if self.state != CallState::Terminating {
            return Vec::new();
        }
        self.state = CallState::Terminated;
        self.ended()
    }

    fn handle_response(&mut self, response: Response) -> Vec<DialogAction> {
        let Some(cseq) = message::cseq(&response) else {
            tracing::debug!("Call {} - response without CSeq dropped", self.id());
            return Vec::new();
        };

        if cseq.method != Method::Invite {
            tracing::debug!(
                "Call {} - {} for {} (CSeq {})",
                self.id(),
                response.status_code,
                cseq.method,
                cseq.seq
            );
            return Vec::new();
        }

        match message::status_code(&response) {
            100..=199 => self.handle_provisional(&response),
            200..=299 => self.handle_success(&response),
            code @ (401 | 407) => {
                let mut actions = vec![self.ack_non_success(&response)];
                if self.state.is_early() {
                    let kind = if code == 407 {
                        ChallengeKind::Proxy
                    } else {
                        ChallengeKind::Www
                    };
                    actions.extend(self.handle_challenge(&response, kind, cseq.seq));
                }
                actions
            }
            _ => {
                let mut actions = vec![self.ack_non_success(&response)];
                if self.state.is_early() {
                    let reason = response.status_code.to_string();
                    tracing::warn!("Call {} rejected: {}", self.id(), reason);
                    actions.extend(self.fail(reason));
                }
                actions
            }
        }
    }

    fn handle_provisional(&mut self, response: &Response) -> Vec<DialogAction> {
        if !self.state.is_early() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        match response.status_code {
            StatusCode::Ringing => {
                tracing::info!("Call {} - Ringing (180)", self.id());
                if self.state == CallState::Inviting {
                    self.state = CallState::Ringing;
                }
            }
            StatusCode::SessionProgress => {
                tracing::info!("Call {} - Session Progress (183)", self.id());
                self.state = CallState::EarlyMedia;
            }
            ref other => {
                tracing::debug!("Call {} - provisional {}", self.id(), other);
                return actions;
            }
        }

        actions.extend(self.apply_remote_sdp(response));
        if !self.ringing_emitted {
            self.ringing_emitted = true;
            actions.push(DialogAction::Emit(CallEvent::Ringing {
                call_id: self.id().to_string(),
            }));
        }
        actions
    }

    fn handle_success(&mut self, response: &Response) -> Vec<DialogAction> {
        if self.state == CallState::Connected || self.state == CallState::Terminating {
            tracing::debug!("Call {} - 2xx retransmission, re-sending ACK", self.id());
            return vec![send_request(self.build_ack())];
        }

        if self.state.is_terminal() {
            if self.state == CallState::Terminated && self.cancelled_early && self.to_tag.is_none() {
                // Answered after a local cancel: confirm and immediately end the dialog
                self.learn_dialog(response);
                let ack = send_request(self.build_ack());
                self.cseq += 1;
                let bye = send_request(self.build_bye());
                tracing::info!("Call {} - answered after cancel, sending BYE", self.id());
                return vec![ack, bye];
            }
            return Vec::new();
        }

        if !self.state.is_early() {
            return Vec::new();
        }

        self.learn_dialog(response);

        let mut actions = self.apply_remote_sdp(response);
        if self.remote_media.is_none() {
            tracing::warn!("Call {} - 200 OK without usable SDP", self.id());
        }

        actions.push(send_request(self.build_ack()));
        self.state = CallState::Connected;
        tracing::info!("Call {} connected", self.id());
        actions.push(DialogAction::Emit(CallEvent::Connected {
            call_id: self.id().to_string(),
        }));
        actions
    }

    fn handle_challenge(&mut self, response: &Response, kind: ChallengeKind, response_cseq: u32) -> Vec<DialogAction> {
        if self.last_auth_cseq.is_some_and(|last| response_cseq <= last) {
            tracing::warn!(
                "Call {} - challenge for already answered CSeq {}",
                self.id(),
                response_cseq
            );
            return self.fail("Authentication failed: repeated challenge".to_string());
        }
        if self.auth_attempts >= MAX_AUTH_ATTEMPTS {
            return self.fail(format!(
                "Authentication failed after {} attempts",
                self.auth_attempts
            ));
        }

        let credentials = auth::select_challenge(response, kind)
            .and_then(|challenge| {
                auth::authorize(
                    &self.params.credentials,
                    &challenge,
                    &Method::Invite,
                    &self.params.request_uri,
                )
            })
            .map(|authorization| auth::credentials_header(kind, authorization));

        let credentials = match credentials {
            Ok(header) => header,
            Err(e) => return self.fail(e.to_string()),
        };

        self.auth_attempts += 1;
        self.last_auth_cseq = Some(response_cseq);
        self.cseq += 1;
        self.invite_cseq = self.cseq;

        tracing::info!(
            "Call {} - {} challenge, retrying INVITE (attempt {}, CSeq {})",
            self.id(),
            response.status_code,
            self.auth_attempts,
            self.cseq
        );

        vec![send_request(self.build_invite(Some(credentials)))]
    }

    fn handle_request(&mut self, request: Request) -> Vec<DialogAction> {
        match request.method {
            Method::Bye => {
                let mut actions = vec![send_response(self.reply(&request, StatusCode::OK))];
                if !self.state.is_terminal() {
                    tracing::info!("Call {} - remote hangup", self.id());
                    self.state = CallState::Terminated;
                    actions.extend(self.ended());
                }
                actions
            }
            Method::Ack => Vec::new(),
            ref other => {
                tracing::debug!("Call {} - unsupported request {}", self.id(), other);
                vec![send_response(self.reply(&request, StatusCode::NotImplemented))]
            }
        }
    }

    fn learn_dialog(&mut self, response: &Response) {
        if self.to_tag.is_none() {
            self.to_tag = message::to_tag(response);
        }
        if self.remote_target.is_none() {
            self.remote_target = message::contact_uri(response);
        }
    }

    fn apply_remote_sdp(&mut self, response: &Response) -> Vec<DialogAction> {
        let Some(body) = message::sdp_body(response) else {
            return Vec::new();
        };

        match sdp::parse_remote_media(body) {
            Some(addr) if self.remote_media.is_none() => {
                tracing::info!("Call {} - remote media {}", self.id(), addr);
                self.remote_media = Some(addr);
                vec![DialogAction::SetRemoteMedia(addr)]
            }
            Some(addr) => {
                if self.remote_media != Some(addr) {
                    tracing::debug!("Call {} - ignoring media change to {}", self.id(), addr);
                }
                Vec::new()
            }
            None => {
                tracing::debug!("Call {} - unparsable SDP ignored", self.id());
                Vec::new()
            }
        }
    }

    fn fail(&mut self, reason: String) -> Vec<DialogAction> {
        self.state = CallState::Failed;
        vec![
            DialogAction::StopMedia,
            DialogAction::Emit(CallEvent::Failed {
                call_id: self.id().to_string(),
                reason,
            }),
        ]
    }

    fn ended(&self) -> Vec<DialogAction> {
        vec![
            DialogAction::StopMedia,
            DialogAction::Emit(CallEvent::Ended {
                call_id: self.id().to_string(),
            }),
        ]
    }

    fn via(&self) -> Header {
        Header::Via(
            format!(
                "SIP/2.0/UDP {}:{};branch={};rport",
                self.params.local_ip,
                self.params.local_port,
                message::new_branch()
            )
            .into(),
        )
    }

    fn from_header(&self) -> Header {
        let value = match &self.params.display_name {
            Some(name) => format!("\"{}\" <{}>;tag={}", name, self.params.from_uri, self.from_tag),
            None => format!("<{}>;tag={}", self.params.from_uri, self.from_tag),
        };
        Header::From(value.into())
    }

    fn to_header(&self) -> Header {
        let value = match &self.to_tag {
            Some(tag) => format!("<{}>;tag={}", self.params.request_uri, tag),
            None => format!("<{}>", self.params.request_uri),
        };
        Header::To(value.into())
    }

    /// Via, Max-Forwards, From, To, Call-ID and CSeq in that order
    fn base_headers(&self, via: Header, to: Header, seq: u32, method: Method) -> Vec<Header> {
        vec![
            via,
            Header::MaxForwards(70.into()),
            self.from_header(),
            to,
            Header::CallId(self.sip_call_id.clone().into()),
            Header::CSeq(typed::CSeq { seq, method }.into()),
        ]
    }

    fn build_invite(&self, credentials: Option<Header>) -> Request {
        let mut headers = self.base_headers(self.via(), self.to_header(), self.invite_cseq, Method::Invite);
        headers.push(Header::Contact(format!("<{}>", self.params.contact_uri).into()));
        headers.push(Header::UserAgent(self.params.user_agent.clone().into()));
        headers.push(Header::Other("Allow".into(), ALLOW.into()));
        headers.extend(credentials);
        headers.push(Header::ContentType("application/sdp".to_string().into()));

        build_request(
            Method::Invite,
            self.params.request_uri.clone(),
            headers,
            self.sdp_offer.clone().into_bytes(),
        )
    }

    /// ACK for a 2xx: new transaction, dialog To tag
    fn build_ack(&self) -> Request {
        let mut headers = self.base_headers(self.via(), self.to_header(), self.invite_cseq, Method::Ack);
        headers.push(Header::UserAgent(self.params.user_agent.clone().into()));
        build_request(Method::Ack, self.dialog_target(), headers, Vec::new())
    }

    /// ACK for a non-2xx final: same transaction as the INVITE it answers
    fn ack_non_success(&self, response: &Response) -> DialogAction {
        let seq = message::cseq(response).map_or(self.invite_cseq, |cseq| cseq.seq);
        let via = response
            .via_header()
            .ok()
            .cloned()
            .map(Header::Via)
            .unwrap_or_else(|| self.via());
        let to = response
            .to_header()
            .ok()
            .cloned()
            .map(Header::To)
            .unwrap_or_else(|| self.to_header());

        let mut headers = self.base_headers(via, to, seq, Method::Ack);
        headers.push(Header::UserAgent(self.params.user_agent.clone().into()));
        send_request(build_request(
            Method::Ack,
            self.params.request_uri.clone(),
            headers,
            Vec::new(),
        ))
    }

    fn build_bye(&self) -> Request {
        let mut headers = self.base_headers(self.via(), self.to_header(), self.cseq, Method::Bye);
        headers.push(Header::UserAgent(self.params.user_agent.clone().into()));
        build_request(Method::Bye, self.dialog_target(), headers, Vec::new())
    }

    /// Remote Contact once known, the Request-URI before that
    fn dialog_target(&self) -> Uri {
        self.remote_target
            .clone()
            .unwrap_or_else(|| self.params.request_uri.clone())
    }

    fn reply(&self, request: &Request, status_code: StatusCode) -> Response {
        let mut headers: Vec<Header> = request
            .headers
            .iter()
            .filter(|header| {
                matches!(
                    header,
                    Header::Via(_) | Header::From(_) | Header::To(_) | Header::CallId(_) | Header::CSeq(_)
                )
            })
            .cloned()
            .collect();
        headers.push(Header::UserAgent(self.params.user_agent.clone().into()));
        headers.push(Header::ContentLength(0u32.into()));

        Response {
            status_code,
            version: Version::V2,
            headers: headers.into(),
            body: Vec::new(),
        }
    }
}

fn build_request(method: Method, uri: Uri, mut headers: Vec<Header>, body: Vec<u8>) -> Request {
    headers.push(Header::ContentLength((body.len() as u32).into()));
    Request {
        method,
        uri,
        version: Version::V2,
        headers: headers.into(),
        body,
    }
}

fn send_request(request: Request) -> DialogAction {
    DialogAction::Send(SipMessage::Request(request).to_string())
}

fn send_response(response: Response) -> DialogAction {
    DialogAction::Send(SipMessage::Response(response).to_string())
}
