//! SASL DIGEST-MD5 (RFC 2831) for `AUTHENTICATE DIGEST-MD5`.
//!
//! ```text
//! S: + realm="..",nonce="..",qop="auth",algorithm=md5-sess,charset=utf-8
//! C: charset=utf-8,username="..",realm="..",nonce="..",nc=00000001,
//!    cnonce="..",digest-uri="imap/<host>",response=<hex>,qop=auth
//! S: + rspauth=<hex>
//! C: (empty)
//! S: A0003 OK
//! ```
//!
//! A challenge that cannot be answered gets `*`, which cancels the exchange.

use std::collections::HashMap;
use tracing::{debug, warn};

/// Answer that cancels an AUTHENTICATE exchange.
const CANCEL: &str = "*";

/// Nonce count; every session authenticates exactly once.
const NONCE_COUNT: &str = "00000001";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Challenge,
    Verify,
    Done,
}

/// Client side of one DIGEST-MD5 exchange.
pub struct DigestMd5 {
    username: String,
    password: String,
    host: String,
    cnonce: String,
    step: Step,
    expected_rspauth: Option<String>,
}

impl DigestMd5 {
    pub fn new(username: &str, password: &str, host: &str) -> Self {
        Self::with_cnonce(username, password, host, &uuid::Uuid::new_v4().simple().to_string())
    }

    fn with_cnonce(username: &str, password: &str, host: &str, cnonce: &str) -> Self {
        DigestMd5 {
            username: username.to_string(),
            password: password.to_string(),
            host: host.to_string(),
            cnonce: cnonce.to_string(),
            step: Step::Challenge,
            expected_rspauth: None,
        }
    }

    fn digest_uri(&self) -> String {
        format!("imap/{}", self.host)
    }

    /// Answers one server challenge. `None` cancels the exchange.
    pub fn respond(&mut self, challenge: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(challenge);
        let fields = parse_challenge(&text);

        match self.step {
            Step::Challenge => {
                let nonce = fields.get("nonce")?;
                let realm = fields.get("realm").map(String::as_str).unwrap_or_default();

                let response = self.response_value(realm, nonce, "AUTHENTICATE:");
                self.expected_rspauth = Some(self.response_value(realm, nonce, ":"));
                self.step = Step::Verify;

                Some(format!(
                    "charset=utf-8,username=\"{}\",realm=\"{}\",nonce=\"{}\",nc={},cnonce=\"{}\",digest-uri=\"{}\",response={},qop=auth",
                    self.username,
                    realm,
                    nonce,
                    NONCE_COUNT,
                    self.cnonce,
                    self.digest_uri(),
                    response
                ))
            }
            Step::Verify => {
                self.step = Step::Done;
                match fields.get("rspauth") {
                    Some(rspauth) if Some(rspauth) == self.expected_rspauth.as_ref() => {
                        debug!("Server proved knowledge of the password");
                        Some(String::new())
                    }
                    _ => {
                        warn!("DIGEST-MD5 rspauth mismatch");
                        None
                    }
                }
            }
            Step::Done => None,
        }
    }

    /// `response` (A2 prefix `AUTHENTICATE:`) or `rspauth` (A2 prefix `:`).
    fn response_value(&self, realm: &str, nonce: &str, a2_prefix: &str) -> String {
        let secret = md5::compute(format!("{}:{}:{}", self.username, realm, self.password));
        let mut a1 = secret.0.to_vec();
        a1.extend_from_slice(format!(":{}:{}", nonce, self.cnonce).as_bytes());

        let a2 = format!("{}{}", a2_prefix, self.digest_uri());

        let kd = format!(
            "{:x}:{}:{}:{}:auth:{:x}",
            md5::compute(&a1),
            nonce,
            NONCE_COUNT,
            self.cnonce,
            md5::compute(a2.as_bytes())
        );
        format!("{:x}", md5::compute(kd.as_bytes()))
    }
}

impl async_imap::Authenticator for DigestMd5 {
    type Response = String;

    fn process(&mut self, challenge: &[u8]) -> Self::Response {
        self.respond(challenge).unwrap_or_else(|| CANCEL.to_string())
    }
}

/// Splits `key=value,key="quoted, value"` pairs. Keys are lower-cased.
fn parse_challenge(text: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut chars = text.trim().chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }

        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next()),
                    '"' => break,
                    other => value.push(other),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
        }

        fields.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHALLENGE: &str = "realm=\"elwood.innosoft.com\",nonce=\"OA6MG9tEQGm2hh\",qop=\"auth\",algorithm=md5-sess,charset=utf-8";

    fn rfc_client() -> DigestMd5 {
        DigestMd5::with_cnonce("chris", "secret", "elwood.innosoft.com", "OA6MHXh6VqTrRk")
    }

    #[test]
    fn test_rfc2831_exchange() {
        let mut auth = rfc_client();

        let answer = auth.respond(CHALLENGE.as_bytes()).unwrap();
        assert!(answer.contains("response=d388dad90d4bbd760a152321f2143af7"));
        assert!(answer.contains("digest-uri=\"imap/elwood.innosoft.com\""));
        assert!(answer.contains("nc=00000001"));
        assert!(answer.contains("cnonce=\"OA6MHXh6VqTrRk\""));

        let last = auth
            .respond(b"rspauth=ea40f60335c427b5527b84dbabcdfffd")
            .unwrap();
        assert!(last.is_empty());
    }

    #[test]
    fn test_wrong_rspauth_cancels() {
        let mut auth = rfc_client();
        auth.respond(CHALLENGE.as_bytes()).unwrap();

        let answer = async_imap::Authenticator::process(&mut auth, b"rspauth=0000");
        assert_eq!(answer, "*");
    }

    #[test]
    fn test_challenge_without_nonce_cancels() {
        let mut auth = rfc_client();
        assert_eq!(auth.respond(b"realm=\"x\",qop=\"auth\""), None);
    }

    #[test]
    fn test_parse_challenge() {
        let fields = parse_challenge(CHALLENGE);
        assert_eq!(fields["realm"], "elwood.innosoft.com");
        assert_eq!(fields["algorithm"], "md5-sess");
        assert_eq!(fields["charset"], "utf-8");

        let fields = parse_challenge("Realm=\"a, b\", nonce=\"q\\\"x\"");
        assert_eq!(fields["realm"], "a, b");
        assert_eq!(fields["nonce"], "q\"x");
    }
}
