//! SharedAccessSignature tokens derived from a device symmetric key.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::prelude::*;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Characters left unescaped in SAS resource URIs and signatures.
pub const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn url_encode(value: &str) -> String {
    utf8_percent_encode(value, URI_ENCODE_SET).to_string()
}

/// A base64 encoded device key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey(String);

impl SymmetricKey {
    pub fn new(key: impl Into<String>) -> Self {
        SymmetricKey(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(self.0.trim())
    }
}

impl From<String> for SymmetricKey {
    fn from(key: String) -> Self {
        SymmetricKey(key)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SymmetricKey(***)")
    }
}

/// Sign `resource_uri` with `key`, valid until `expiry` (seconds since epoch).
pub fn sas_token(
    resource_uri: &str,
    key: &SymmetricKey,
    key_name: Option<&str>,
    expiry: u64,
) -> Result<String, base64::DecodeError> {
    let encoded_uri = url_encode(resource_uri);
    let string_to_sign = format!("{}\n{}", encoded_uri, expiry);

    let mut mac = HmacSha256::new_from_slice(&key.decode()?)
        .expect("HMAC can take key of any size");
    mac.update(string_to_sign.as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        encoded_uri,
        url_encode(&signature),
        expiry
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(name);
    }
    Ok(token)
}

/// Expiry timestamp `ttl` from now.
pub fn expiry_from_now(ttl: Duration) -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .saturating_add(ttl)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SymmetricKey {
        SymmetricKey::new(BASE64_STANDARD.encode(b"0123456789abcdef0123456789abcdef"))
    }

    fn query_param<'a>(token: &'a str, name: &str) -> Option<&'a str> {
        token
            .trim_start_matches("SharedAccessSignature ")
            .split('&')
            .find_map(|pair| pair.strip_prefix(&format!("{}=", name)))
    }

    #[test]
    fn test_url_encode() {
        assert_eq!(url_encode("0ne00ABC/registrations/dev-1"), "0ne00ABC%2Fregistrations%2Fdev-1");
        assert_eq!(url_encode("a+b=c"), "a%2Bb%3Dc");
        assert_eq!(url_encode("dtmi:com:example;1"), "dtmi%3Acom%3Aexample%3B1");
    }

    #[test]
    fn test_token_layout() {
        let token = sas_token("0ne00ABC/registrations/dev-1", &key(), Some("registration"), 1700000000)
            .unwrap();

        assert!(token.starts_with("SharedAccessSignature sr=0ne00ABC%2Fregistrations%2Fdev-1&sig="));
        assert_eq!(query_param(&token, "se"), Some("1700000000"));
        assert_eq!(query_param(&token, "skn"), Some("registration"));

        let hub_token = sas_token("hub.azure-devices.net/devices/dev-1", &key(), None, 1).unwrap();
        assert_eq!(query_param(&hub_token, "skn"), None);
    }

    #[test]
    fn test_signature_verifies() {
        let expiry = 1700000000;
        let token = sas_token("myhub.azure-devices.net/devices/dev-1", &key(), None, expiry).unwrap();
        let sig = query_param(&token, "sig").unwrap();
        let sig = percent_encoding::percent_decode_str(sig).decode_utf8().unwrap();
        let sig = BASE64_STANDARD.decode(sig.as_bytes()).unwrap();
        assert_eq!(sig.len(), 32);

        let mut mac = HmacSha256::new_from_slice(b"0123456789abcdef0123456789abcdef").unwrap();
        mac.update(format!("myhub.azure-devices.net%2Fdevices%2Fdev-1\n{}", expiry).as_bytes());
        mac.verify_slice(&sig).unwrap();
    }

    #[test]
    fn test_token_is_deterministic() {
        let a = sas_token("r", &key(), None, 42).unwrap();
        let b = sas_token("r", &key(), None, 42).unwrap();
        let c = sas_token("r", &key(), None, 43).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        let bad = SymmetricKey::new("not base64!");
        assert!(sas_token("r", &bad, None, 1).is_err());
    }

    #[test]
    fn test_key_is_redacted() {
        assert_eq!(format!("{:?}", key()), "SymmetricKey(***)");
    }

    #[test]
    fn test_expiry_from_now() {
        let now = expiry_from_now(Duration::ZERO);
        let later = expiry_from_now(Duration::from_secs(3600));
        assert!(later >= now + 3600);
    }
}
