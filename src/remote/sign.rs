//! Request signing for the remote job API and the object stores.
//!
//! - ACS3-HMAC-SHA256 for the Alibaba Cloud OpenAPI (Tingwu)
//! - OSS V1 (HMAC-SHA1, base64) for header-signed PUT and query-signed GET URLs
//! - COS q-sign (HMAC-SHA1, hex) for Tencent Cloud Object Storage

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// RFC 3986 unreserved characters stay as-is, everything else is escaped.
const RFC3986: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub const ACS3_ALGORITHM: &str = "ACS3-HMAC-SHA256";

pub fn uri_encode(value: &str) -> String {
    utf8_percent_encode(value, RFC3986).to_string()
}

/// Encode every path segment, keeping the `/` separators.
pub fn encode_path(path: &str) -> String {
    path.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Access key pair, optionally with an STS token.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub access_key_secret: String,
    pub security_token: Option<String>,
}

/// Everything ACS3 signs for one request.
#[derive(Debug, Clone)]
pub struct AcsRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: &'a [(&'a str, &'a str)],
    pub body: &'a [u8],
    pub action: &'a str,
    pub version: &'a str,
    pub timestamp: DateTime<Utc>,
    pub nonce: String,
}

impl AcsRequest<'_> {
    /// Headers that take part in the signature, lowercase names, sorted.
    fn signed_header_pairs(&self, credentials: &Credentials) -> Vec<(String, String)> {
        let mut headers = vec![
            ("host".to_string(), self.host.to_string()),
            ("x-acs-action".to_string(), self.action.to_string()),
            ("x-acs-content-sha256".to_string(), sha256_hex(self.body)),
            (
                "x-acs-date".to_string(),
                self.timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
            ("x-acs-signature-nonce".to_string(), self.nonce.clone()),
            ("x-acs-version".to_string(), self.version.to_string()),
        ];
        if !self.body.is_empty() {
            headers.push(("content-type".to_string(), "application/json".to_string()));
        }
        if let Some(token) = credentials.security_token.as_deref().filter(|t| !t.is_empty()) {
            headers.push(("x-acs-security-token".to_string(), token.to_string()));
        }
        headers.sort();
        headers
    }

    pub fn canonical_query(&self) -> String {
        let mut pairs: Vec<(String, String)> = self
            .query
            .iter()
            .map(|(k, v)| (uri_encode(k), uri_encode(v)))
            .collect();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn canonical_request(&self, headers: &[(String, String)]) -> String {
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            encode_path(self.path),
            self.canonical_query(),
            canonical_headers,
            signed_headers,
            sha256_hex(self.body)
        )
    }

    /// Headers to send, including `Authorization`.
    pub fn sign(&self, credentials: &Credentials) -> Vec<(String, String)> {
        let mut headers = self.signed_header_pairs(credentials);
        let canonical = self.canonical_request(&headers);
        let string_to_sign = format!("{}\n{}", ACS3_ALGORITHM, sha256_hex(canonical.as_bytes()));
        let signature = hex::encode(hmac_sha256(
            credentials.access_key_secret.as_bytes(),
            string_to_sign.as_bytes(),
        ));
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        headers.push((
            "authorization".to_string(),
            format!(
                "{} Credential={},SignedHeaders={},Signature={}",
                ACS3_ALGORITHM, credentials.access_key_id, signed_headers, signature
            ),
        ));
        headers
    }
}

/// OSS V1 string-to-sign. `oss_headers` must already be lowercase `x-oss-*` pairs.
pub fn oss_string_to_sign(
    verb: &str,
    content_md5: &str,
    content_type: &str,
    date_or_expires: &str,
    oss_headers: &[(&str, &str)],
    resource: &str,
) -> String {
    let mut sorted: Vec<&(&str, &str)> = oss_headers.iter().collect();
    sorted.sort();
    let canonical_headers: String = sorted
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();

    format!(
        "{}\n{}\n{}\n{}\n{}{}",
        verb, content_md5, content_type, date_or_expires, canonical_headers, resource
    )
}

pub fn oss_signature(secret: &str, string_to_sign: &str) -> String {
    BASE64.encode(hmac_sha1(secret.as_bytes(), string_to_sign.as_bytes()))
}

/// COS q-sign authorization for a request valid between `start` and `end` (unix seconds).
///
/// `headers` are the request headers to sign; names are lowercased and values
/// URI-encoded as COS expects.
pub fn cos_authorization(
    secret_id: &str,
    secret_key: &str,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    start: i64,
    end: i64,
) -> String {
    let key_time = format!("{};{}", start, end);
    let sign_key = hex::encode(hmac_sha1(secret_key.as_bytes(), key_time.as_bytes()));

    let mut pairs: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| (k.to_lowercase(), uri_encode(v)))
        .collect();
    pairs.sort();
    let header_list = pairs
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let header_string = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let http_string = format!(
        "{}\n{}\n{}\n{}\n",
        method.to_lowercase(),
        path,
        "",
        header_string
    );
    let string_to_sign = format!("sha1\n{}\n{}\n", key_time, sha1_hex(http_string.as_bytes()));
    let signature = hex::encode(hmac_sha1(sign_key.as_bytes(), string_to_sign.as_bytes()));

    format!(
        "q-sign-algorithm=sha1&q-ak={}&q-sign-time={}&q-key-time={}&q-header-list={}&q-url-param-list=&q-signature={}",
        secret_id, key_time, key_time, header_list, signature
    )
}
