//! SIP Digest Authentication, client side (RFC 2617, RFC 3261)

use super::message::{SipError, SipResponse};
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// Which header carried the challenge, and so which header answers it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// 401 with WWW-Authenticate, answered by Authorization
    Www,
    /// 407 with Proxy-Authenticate, answered by Proxy-Authorization
    Proxy,
}

impl ChallengeKind {
    pub fn answer_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "Authorization",
            ChallengeKind::Proxy => "Proxy-Authorization",
        }
    }
}

/// Parsed Digest challenge
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub kind: ChallengeKind,
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
}

impl DigestChallenge {
    /// Extract the challenge from a 401 or 407 response
    pub fn from_response(response: &SipResponse) -> Result<Self, SipError> {
        let (kind, value) = match response.status_code() {
            401 => (ChallengeKind::Www, response.header("WWW-Authenticate")),
            407 => (ChallengeKind::Proxy, response.header("Proxy-Authenticate")),
            other => {
                return Err(SipError::Authentication(format!(
                    "status {} carries no challenge",
                    other
                )))
            }
        };

        let value = value.ok_or_else(|| {
            SipError::Authentication("challenge response without authenticate header".to_string())
        })?;

        Self::parse(kind, &value)
    }

    pub fn parse(kind: ChallengeKind, value: &str) -> Result<Self, SipError> {
        debug!("Parsing digest challenge: {}", value);

        let value = value.trim();
        let scheme_end = value.find(char::is_whitespace).unwrap_or(value.len());
        if !value[..scheme_end].eq_ignore_ascii_case("Digest") {
            return Err(SipError::Authentication(format!(
                "unsupported auth scheme: {}",
                &value[..scheme_end]
            )));
        }

        let params = parse_digest_params(&value[scheme_end..]);

        let realm = params
            .get("realm")
            .cloned()
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?;
        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?;

        if let Some(alg) = params.get("algorithm") {
            if !alg.eq_ignore_ascii_case("MD5") {
                return Err(SipError::Authentication(format!(
                    "unsupported digest algorithm: {}",
                    alg
                )));
            }
        }

        Ok(Self {
            kind,
            realm,
            nonce,
            opaque: params.get("opaque").cloned(),
            algorithm: params.get("algorithm").cloned(),
            qop: params.get("qop").cloned(),
        })
    }

    fn supports_qop_auth(&self) -> bool {
        self.qop
            .as_deref()
            .map(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }

    /// Build the Authorization (or Proxy-Authorization) value for one request
    pub fn authorize(&self, method: &str, uri: &str, username: &str, password: &str) -> String {
        if self.supports_qop_auth() {
            let cnonce = generate_cnonce();
            let nc = "00000001";
            let response = calculate_response_with_qop(
                username,
                &self.realm,
                password,
                method,
                uri,
                &self.nonce,
                nc,
                &cnonce,
                "auth",
            );
            let mut value = format!(
                r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5, qop=auth, nc={}, cnonce="{}""#,
                username, self.realm, self.nonce, uri, response, nc, cnonce
            );
            if let Some(opaque) = &self.opaque {
                value.push_str(&format!(r#", opaque="{}""#, opaque));
            }
            value
        } else {
            let response = calculate_response(username, &self.realm, password, method, uri, &self.nonce);
            let mut value = format!(
                r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
                username, self.realm, self.nonce, uri, response
            );
            if let Some(opaque) = &self.opaque {
                value.push_str(&format!(r#", opaque="{}""#, opaque));
            }
            value
        }
    }
}

/// Split `key=value, key="quoted, value"` pairs.
fn parse_digest_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }

    params
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}", rng.gen::<u64>())
}

/// HA1 = MD5(username:realm:password), HA2 = MD5(method:uri),
/// response = MD5(HA1:nonce:HA2)
pub fn calculate_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
    format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)))
}

/// response = MD5(HA1:nonce:nc:cnonce:qop:HA2)
#[allow(clippy::too_many_arguments)]
pub fn calculate_response_with_qop(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: &str,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
    format!(
        "{:x}",
        md5::compute(format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
    )
}
