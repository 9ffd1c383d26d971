//! SIP wire format on top of `rsip`
//!
//! Parsing and serialization are delegated to `rsip`; this module adds the
//! pieces a single UDP dialog needs on top: compact header expansion, branch
//! and tag generation, and typed lookups that tolerate missing headers.

use ftth_rsip as rsip;
use rsip::headers::{
    CallId, Contact, ContentLength, ContentType, From as HeaderFrom, To as HeaderTo, ToTypedHeader,
    UntypedHeader, Via,
};
use rsip::message::headers_ext::HeadersExt;
use rsip::{typed, Header, Headers, Response, SipMessage};

use super::SipError;

/// Magic cookie prefix for RFC 3261 branch ids
pub const BRANCH_PREFIX: &str = "z9hG4bK";

/// A new branch id for a Via header
pub fn new_branch() -> String {
    format!("{}{}", BRANCH_PREFIX, uuid::Uuid::new_v4().simple())
}

/// A new dialog tag
pub fn new_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Parse one datagram received on the signaling socket
pub fn parse(data: &[u8]) -> Result<SipMessage, SipError> {
    let text = std::str::from_utf8(data)
        .map_err(|e| SipError::Parse(format!("SIP message is not UTF-8: {}", e)))?;
    let mut message =
        SipMessage::try_from(text).map_err(|e| SipError::Parse(format!("Invalid SIP message: {}", e)))?;

    let headers = match &mut message {
        SipMessage::Request(request) => &mut request.headers,
        SipMessage::Response(response) => &mut response.headers,
    };
    expand_compact_headers(headers);

    Ok(message)
}

/// Rewrite RFC 3261 compact header names (`i`, `f`, `t`, ...) to typed headers
fn expand_compact_headers(headers: &mut Headers) {
    let mut collected: Vec<Header> = std::mem::take(headers).into();
    for header in collected.iter_mut() {
        if let Header::Other(name, value) = header {
            if let Some(expanded) = expand_compact_header(name, value) {
                *header = expanded;
            }
        }
    }
    *headers = collected.into();
}

fn expand_compact_header(name: &str, value: &str) -> Option<Header> {
    let value = value.to_string();
    match name.to_ascii_lowercase().as_str() {
        "i" => Some(Header::CallId(CallId::new(value))),
        "f" => Some(Header::From(HeaderFrom::new(value))),
        "t" => Some(Header::To(HeaderTo::new(value))),
        "v" => Some(Header::Via(Via::new(value))),
        "m" => Some(Header::Contact(Contact::new(value))),
        "l" => Some(Header::ContentLength(ContentLength::new(value))),
        "c" => Some(Header::ContentType(ContentType::new(value))),
        _ => None,
    }
}

/// Call-ID of any message
pub fn call_id(message: &SipMessage) -> Option<&str> {
    let headers = match message {
        SipMessage::Request(request) => &request.headers,
        SipMessage::Response(response) => &response.headers,
    };
    headers.iter().find_map(|header| match header {
        Header::CallId(call_id) => Some(call_id.value()),
        _ => None,
    })
}

/// Typed CSeq of a message, `None` when absent or malformed
pub fn cseq(message: &impl HeadersExt) -> Option<typed::CSeq> {
    message.cseq_header().ok()?.clone().typed().ok()
}

/// `tag` parameter of the To header
pub fn to_tag(response: &Response) -> Option<String> {
    response
        .to_header()
        .ok()
        .and_then(|to| to.tag().ok().flatten())
        .map(|tag| tag.value().to_string())
}

/// URI of the Contact header
pub fn contact_uri(response: &Response) -> Option<rsip::Uri> {
    response
        .contact_header()
        .ok()
        .and_then(|contact| contact.clone().typed().ok())
        .map(|contact| contact.uri)
}

/// Body text when the response carries SDP
pub fn sdp_body(response: &Response) -> Option<&str> {
    let is_sdp = response
        .headers
        .iter()
        .find_map(|header| match header {
            Header::ContentType(content_type) => Some(content_type.value()),
            _ => None,
        })
        .map_or(true, |ct| ct.to_ascii_lowercase().starts_with("application/sdp"));

    let body = std::str::from_utf8(&response.body).ok()?;
    if is_sdp && !body.trim().is_empty() {
        Some(body)
    } else {
        None
    }
}

/// Status code as a number
pub fn status_code(response: &Response) -> u16 {
    response.status_code.clone().into()
}

/// Value of the first header called `name`, as written on the wire
#[cfg(test)]
pub fn header_value(headers: &Headers, name: &str) -> Option<String> {
    headers.iter().map(|header| header.to_string()).find_map(|line| {
        let (header_name, value) = line.split_once(':')?;
        header_name
            .trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

/// Response a carrier would send to `request`, tagging the To header
#[cfg(test)]
pub fn response_to(request: &rsip::Request, code: u16, extra: &[(&str, &str)], body: &str) -> Response {
    let mut headers: Vec<Header> = request
        .headers
        .iter()
        .filter(|header| {
            matches!(
                header,
                Header::Via(_) | Header::From(_) | Header::CallId(_) | Header::CSeq(_)
            )
        })
        .cloned()
        .collect();

    let to = header_value(&request.headers, "To").unwrap_or_default();
    let to = if to.contains(";tag=") {
        to
    } else {
        format!("{};tag=carrier-1", to)
    };
    headers.push(Header::To(to.into()));

    for (name, value) in extra {
        headers.push(Header::Other(name.to_string(), value.to_string()));
    }
    if !body.is_empty() {
        headers.push(Header::ContentType("application/sdp".to_string().into()));
    }
    headers.push(Header::ContentLength((body.len() as u32).into()));

    Response {
        status_code: rsip::StatusCode::from(code),
        version: rsip::Version::V2,
        headers: headers.into(),
        body: body.as_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_response(raw: &str) -> Response {
        match parse(raw.as_bytes()).unwrap() {
            SipMessage::Response(response) => response,
            SipMessage::Request(_) => panic!("expected response"),
        }
    }

    #[test]
    fn test_parse_response_with_compact_headers() {
        let raw = "SIP/2.0 180 Ringing\r\n\
                   v: SIP/2.0/UDP 10.0.0.5:5070;branch=z9hG4bKabc\r\n\
                   f: <sip:alice@example.com>;tag=1234\r\n\
                   t: <sip:bob@example.com>;tag=remote-9\r\n\
                   i: call-1@10.0.0.5\r\n\
                   CSeq: 1 INVITE\r\n\
                   l: 0\r\n\r\n";

        let response = parse_response(raw);
        assert_eq!(status_code(&response), 180);
        assert_eq!(call_id(&SipMessage::Response(response.clone())), Some("call-1@10.0.0.5"));
        assert_eq!(to_tag(&response).as_deref(), Some("remote-9"));
        assert!(response.via_header().is_ok());

        let cseq = cseq(&response).unwrap();
        assert_eq!(cseq.seq, 1);
        assert_eq!(cseq.method, rsip::Method::Invite);
        assert!(sdp_body(&response).is_none());
    }

    #[test]
    fn test_sdp_body_and_contact() {
        let raw = "SIP/2.0 200 OK\r\n\
                   Call-ID: abc\r\n\
                   CSeq: 1 INVITE\r\n\
                   Contact: <sip:gw@203.0.113.9:5060>\r\n\
                   Content-Type: application/sdp\r\n\
                   Content-Length: 5\r\n\r\n\
                   v=0\r\n";

        let response = parse_response(raw);
        assert_eq!(sdp_body(&response), Some("v=0\r\n"));
        assert_eq!(
            contact_uri(&response).map(|uri| uri.to_string()).as_deref(),
            Some("sip:gw@203.0.113.9:5060")
        );
        assert_eq!(to_tag(&response), None);
    }

    #[test]
    fn test_parse_request() {
        let raw = "BYE sip:alice@10.0.0.5:5070 SIP/2.0\r\nCall-ID: abc\r\nCSeq: 7 BYE\r\nContent-Length: 0\r\n\r\n";
        let SipMessage::Request(request) = parse(raw.as_bytes()).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(request.method, rsip::Method::Bye);
        assert_eq!(cseq(&request).map(|c| c.seq), Some(7));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse(b"").is_err());
        assert!(parse(b"hello world").is_err());
        assert!(parse(&[0xFF, 0xFE, 0x00]).is_err());
    }

    #[test]
    fn test_new_branch_has_magic_cookie() {
        let a = new_branch();
        let b = new_branch();
        assert!(a.starts_with(BRANCH_PREFIX));
        assert_ne!(a, b);
        assert_eq!(new_tag().len(), 16);
    }
}
