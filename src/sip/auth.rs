//! SIP digest authentication (RFC 2617, MD5 with `qop=auth` or legacy mode)
//!
//! Challenges and credentials travel as `rsip` typed headers; only the MD5
//! response itself is computed here.

use ftth_rsip as rsip;
use rsip::headers::auth::{self, Algorithm, AuthQop, Qop};
use rsip::headers::ToTypedHeader;
use rsip::{typed, Header, Method, Response, Uri};

use super::SipError;

/// Fixed nonce count: every challenge is answered exactly once
const NONCE_COUNT: u8 = 1;

/// Username/password pair used to answer challenges
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: String,
    pub password: String,
}

/// Which challenge a response carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// `401` with `WWW-Authenticate`, answered with `Authorization`
    Www,
    /// `407` with `Proxy-Authenticate`, answered with `Proxy-Authorization`
    Proxy,
}

impl ChallengeKind {
    pub fn challenge_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "WWW-Authenticate",
            ChallengeKind::Proxy => "Proxy-Authenticate",
        }
    }
}

/// First challenge of `kind` in `response` this client can answer.
///
/// Carriers may offer several digest variants; anything that is not MD5
/// (with `qop=auth` or without qop) is skipped.
pub fn select_challenge(response: &Response, kind: ChallengeKind) -> Result<typed::WwwAuthenticate, SipError> {
    let mut offered = 0;

    let challenge = response
        .headers
        .iter()
        .filter_map(|header| match (kind, header) {
            (ChallengeKind::Www, Header::WwwAuthenticate(value)) => Some(value.typed()),
            (ChallengeKind::Proxy, Header::ProxyAuthenticate(value)) => {
                Some(value.typed().map(|proxy| proxy.0))
            }
            _ => None,
        })
        .inspect(|_| offered += 1)
        .filter_map(|parsed| match parsed {
            Ok(challenge) => Some(challenge),
            Err(e) => {
                tracing::debug!("Skipping malformed {}: {}", kind.challenge_header(), e);
                None
            }
        })
        .find(is_supported);

    match challenge {
        Some(challenge) => Ok(challenge),
        None if offered == 0 => Err(SipError::AuthFailed(format!(
            "{} header missing",
            kind.challenge_header()
        ))),
        None => Err(SipError::AuthFailed(format!(
            "No supported digest challenge among {} offered",
            offered
        ))),
    }
}

fn is_supported(challenge: &typed::WwwAuthenticate) -> bool {
    challenge.scheme == auth::Scheme::Digest
        && challenge.algorithm.map_or(true, |algorithm| algorithm == Algorithm::Md5)
        && !matches!(challenge.qop, Some(Qop::AuthInt))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Compute the digest `response` value for `method uri`.
///
/// `qop` carries the client nonce and nonce count for `qop=auth`; `None`
/// selects the legacy form.
pub fn compute_response(
    credentials: &DigestCredentials,
    challenge: &typed::WwwAuthenticate,
    method: &Method,
    uri: &Uri,
    qop: Option<&AuthQop>,
) -> Result<String, SipError> {
    let ha1 = md5_hex(&format!(
        "{}:{}:{}",
        credentials.username, challenge.realm, credentials.password
    ));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    match qop {
        Some(AuthQop::Auth { cnonce, nc }) => Ok(md5_hex(&format!(
            "{}:{}:{:08x}:{}:auth:{}",
            ha1, challenge.nonce, nc, cnonce, ha2
        ))),
        Some(AuthQop::AuthInt { .. }) => Err(SipError::AuthFailed("qop auth-int not supported".to_string())),
        None => Ok(md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))),
    }
}

/// Answer `challenge` for `method uri`
pub fn authorize(
    credentials: &DigestCredentials,
    challenge: &typed::WwwAuthenticate,
    method: &Method,
    uri: &Uri,
) -> Result<typed::Authorization, SipError> {
    if !is_supported(challenge) {
        return Err(SipError::AuthFailed(format!(
            "Unsupported digest challenge (algorithm {:?}, qop {:?})",
            challenge.algorithm, challenge.qop
        )));
    }

    let qop = match challenge.qop {
        Some(Qop::Auth) => Some(AuthQop::Auth {
            cnonce: format!("{:016x}", rand::random::<u64>()),
            nc: NONCE_COUNT,
        }),
        _ => None,
    };
    let response = compute_response(credentials, challenge, method, uri, qop.as_ref())?;

    Ok(typed::Authorization {
        scheme: auth::Scheme::Digest,
        username: credentials.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: uri.clone(),
        response,
        algorithm: Some(Algorithm::Md5),
        opaque: challenge.opaque.clone(),
        qop,
    })
}

/// Header carrying `authorization` as the answer to a challenge of `kind`
pub fn credentials_header(kind: ChallengeKind, authorization: typed::Authorization) -> Header {
    match kind {
        ChallengeKind::Www => Header::Authorization(authorization.into()),
        ChallengeKind::Proxy => Header::ProxyAuthorization(typed::ProxyAuthorization(authorization).into()),
    }
}
