//! Object storage used to hand local audio to the remote service.
//!
//! Two stores are supported behind [`ObjectStorage`]: Aliyun OSS and Tencent COS.
//! Both upload with a signed PUT and hand out a presigned GET URL.

use super::sign::{self, Credentials};
use super::RemoteError;
use crate::config::{AppConfig, ObjectStorageConfig};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Characters that may not appear in an object key segment.
const ILLEGAL_KEY_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload `path` under `key`.
    async fn put_object(&self, key: &str, path: &Path, content_type: &str) -> Result<(), RemoteError>;

    /// Presigned GET URL for `key`, valid for `ttl`.
    fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, RemoteError>;
}

/// Make a file name safe for an object key.
///
/// Whitespace runs become a single `_`; `/ \ : * ? " < > |` and control characters
/// become `-`. Everything else, including CJK text, is kept.
pub fn sanitize_filename(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());
    let mut in_whitespace = false;

    for ch in name.chars() {
        if ch.is_whitespace() {
            if !in_whitespace {
                sanitized.push('_');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;

        if ILLEGAL_KEY_CHARS.contains(&ch) || ch.is_control() {
            sanitized.push('-');
        } else {
            sanitized.push(ch);
        }
    }

    if sanitized.is_empty() {
        "audio".to_string()
    } else {
        sanitized
    }
}

/// `<prefix>/<sanitized name>`, or just the name when the prefix is blank.
pub fn object_key(prefix: &str, file_name: &str) -> String {
    let prefix = prefix.trim().trim_matches('/');
    let name = sanitize_filename(file_name);
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Build the store named by `object_storage.provider`.
pub fn from_config(config: &AppConfig, client: reqwest::Client) -> Option<Box<dyn ObjectStorage>> {
    let storage = &config.object_storage;
    let bucket = storage.bucket.clone()?;
    let region = storage.region.clone()?;

    match storage.provider.as_deref().map(str::to_lowercase).as_deref() {
        Some("oss") => Some(Box::new(OssStorage {
            client,
            bucket,
            host: oss_host(storage, &region),
            credentials: Credentials {
                access_key_id: config.remote.access_key_id.clone()?,
                access_key_secret: config.remote.access_key_secret.clone()?,
                security_token: config.remote.security_token.clone(),
            },
        })),
        Some("cos") => Some(Box::new(CosStorage {
            client,
            host: cos_host(storage, &bucket, &region),
            secret_id: storage.secret_id.clone()?,
            secret_key: storage.secret_key.clone()?,
        })),
        _ => None,
    }
}

fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
}

fn oss_host(storage: &ObjectStorageConfig, region: &str) -> String {
    match storage.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
        Some(endpoint) => strip_scheme(endpoint).to_string(),
        None if region.starts_with("oss-") => format!("{}.aliyuncs.com", region),
        None => format!("oss-{}.aliyuncs.com", region),
    }
}

fn cos_host(storage: &ObjectStorageConfig, bucket: &str, region: &str) -> String {
    match storage.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
        Some(endpoint) => format!("{}.{}", bucket, strip_scheme(endpoint)),
        None => format!("{}.cos.{}.myqcloud.com", bucket, region),
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>, RemoteError> {
    tokio::fs::read(path).await.map_err(|source| RemoteError::LocalFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Turn a non-success storage response into an error carrying the XML `<Code>`.
async fn check_response(response: reqwest::Response) -> Result<(), RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Http {
        status: status.as_u16(),
        code: xml_tag(&body, "Code").unwrap_or_default(),
        message: xml_tag(&body, "Message").unwrap_or(body),
    })
}

fn xml_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

/// Aliyun OSS with V1 signatures.
pub struct OssStorage {
    client: reqwest::Client,
    bucket: String,
    host: String,
    credentials: Credentials,
}

impl OssStorage {
    fn security_token(&self) -> Option<&str> {
        self.credentials
            .security_token
            .as_deref()
            .filter(|t| !t.is_empty())
    }

    fn object_url(&self, key: &str) -> String {
        format!("https://{}.{}/{}", self.bucket, self.host, sign::encode_path(key))
    }

    /// Presign with an absolute expiry (unix seconds).
    fn presign_until(&self, key: &str, expires: i64) -> String {
        let mut resource = format!("/{}/{}", self.bucket, key);
        if let Some(token) = self.security_token() {
            resource.push_str(&format!("?security-token={}", token));
        }
        let string_to_sign = sign::oss_string_to_sign("GET", "", "", &expires.to_string(), &[], &resource);
        let signature = sign::oss_signature(&self.credentials.access_key_secret, &string_to_sign);

        let mut url = format!(
            "{}?OSSAccessKeyId={}&Expires={}&Signature={}",
            self.object_url(key),
            sign::uri_encode(&self.credentials.access_key_id),
            expires,
            sign::uri_encode(&signature)
        );
        if let Some(token) = self.security_token() {
            url.push_str(&format!("&security-token={}", sign::uri_encode(token)));
        }
        url
    }
}

#[async_trait]
impl ObjectStorage for OssStorage {
    async fn put_object(&self, key: &str, path: &Path, content_type: &str) -> Result<(), RemoteError> {
        let body = read_file(path).await?;
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let mut oss_headers = Vec::new();
        if let Some(token) = self.security_token() {
            oss_headers.push(("x-oss-security-token", token));
        }
        let resource = format!("/{}/{}", self.bucket, key);
        let string_to_sign = sign::oss_string_to_sign("PUT", "", content_type, &date, &oss_headers, &resource);
        let signature = sign::oss_signature(&self.credentials.access_key_secret, &string_to_sign);

        info!(bucket = %self.bucket, key, size = body.len(), "Uploading object to OSS");
        let mut request = self
            .client
            .put(self.object_url(key))
            .header("Date", &date)
            .header("Content-Type", content_type)
            .header(
                "Authorization",
                format!("OSS {}:{}", self.credentials.access_key_id, signature),
            )
            .body(body);
        for (name, value) in &oss_headers {
            request = request.header(*name, *value);
        }

        check_response(request.send().await?).await
    }

    fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, RemoteError> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        debug!(key, expires, "Presigning OSS object");
        Ok(self.presign_until(key, expires))
    }
}

/// Tencent COS with q-sign signatures.
pub struct CosStorage {
    client: reqwest::Client,
    host: String,
    secret_id: String,
    secret_key: String,
}

impl CosStorage {
    fn authorization(&self, method: &str, key: &str, start: i64, end: i64) -> String {
        sign::cos_authorization(
            &self.secret_id,
            &self.secret_key,
            method,
            &format!("/{}", key),
            &[("host", self.host.as_str())],
            start,
            end,
        )
    }

    fn object_url(&self, key: &str) -> String {
        format!("https://{}/{}", self.host, sign::encode_path(key))
    }
}

#[async_trait]
impl ObjectStorage for CosStorage {
    async fn put_object(&self, key: &str, path: &Path, content_type: &str) -> Result<(), RemoteError> {
        let body = read_file(path).await?;
        let now = Utc::now().timestamp();

        info!(host = %self.host, key, size = body.len(), "Uploading object to COS");
        let response = self
            .client
            .put(self.object_url(key))
            .header("Content-Type", content_type)
            .header("Authorization", self.authorization("PUT", key, now, now + 3600))
            .body(body)
            .send()
            .await?;

        check_response(response).await
    }

    fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, RemoteError> {
        let now = Utc::now().timestamp();
        let auth = self.authorization("GET", key, now, now + ttl.as_secs() as i64);
        Ok(format!("{}?{}", self.object_url(key), auth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_cjk_and_collapses_whitespace() {
        assert_eq!(sanitize_filename("我的 播客   第1期.mp3"), "我的_播客_第1期.mp3");
        assert_eq!(sanitize_filename("a\t \nb.wav"), "a_b.wav");
    }

    #[test]
    fn test_sanitize_replaces_illegal_characters() {
        assert_eq!(sanitize_filename(r#"a/b\c:d*e?f"g<h>i|j.mp3"#), "a-b-c-d-e-f-g-h-i-j.mp3");
        assert_eq!(sanitize_filename("x\u{0}y"), "x-y");
        assert_eq!(sanitize_filename(""), "audio");
    }

    #[test]
    fn test_object_key_is_deterministic() {
        assert_eq!(object_key("/tingwu-audio/", "ep 1.mp3"), "tingwu-audio/ep_1.mp3");
        assert_eq!(object_key("tingwu-audio", "ep 1.mp3"), object_key("tingwu-audio", "ep 1.mp3"));
        assert_eq!(object_key("  ", "ep.mp3"), "ep.mp3");
    }

    #[test]
    fn test_hosts() {
        let mut storage = AppConfig::default().object_storage;
        assert_eq!(oss_host(&storage, "cn-beijing"), "oss-cn-beijing.aliyuncs.com");
        assert_eq!(cos_host(&storage, "b-123", "ap-beijing"), "b-123.cos.ap-beijing.myqcloud.com");

        storage.endpoint = Some("https://oss-cn-hangzhou-internal.aliyuncs.com/".to_string());
        assert_eq!(oss_host(&storage, "cn-beijing"), "oss-cn-hangzhou-internal.aliyuncs.com");
    }

    #[test]
    fn test_oss_presigned_url_shape() {
        let storage = OssStorage {
            client: reqwest::Client::new(),
            bucket: "bucket".to_string(),
            host: "oss-cn-beijing.aliyuncs.com".to_string(),
            credentials: Credentials {
                access_key_id: "ak".to_string(),
                access_key_secret: "sk".to_string(),
                security_token: Some("sts token".to_string()),
            },
        };

        let url = storage.presign_until("tingwu-audio/播客.mp3", 1_700_010_800);
        assert!(url.starts_with(
            "https://bucket.oss-cn-beijing.aliyuncs.com/tingwu-audio/%E6%92%AD%E5%AE%A2.mp3?OSSAccessKeyId=ak&Expires=1700010800&Signature="
        ));
        assert!(url.ends_with("&security-token=sts%20token"));
    }

    #[test]
    fn test_presign_ttl_is_honoured() {
        let storage = CosStorage {
            client: reqwest::Client::new(),
            host: "b.cos.ap-beijing.myqcloud.com".to_string(),
            secret_id: "sid".to_string(),
            secret_key: "skey".to_string(),
        };

        let url = storage.presign_get("k.mp3", Duration::from_secs(10_800)).unwrap();
        let sign_time = url
            .split('&')
            .find_map(|p| p.strip_prefix("q-sign-time="))
            .unwrap();
        let (start, end) = sign_time.split_once(';').unwrap();
        let span = end.parse::<i64>().unwrap() - start.parse::<i64>().unwrap();
        assert_eq!(span, 10_800);
    }

    #[test]
    fn test_xml_error_code() {
        let body = "<Error><Code>SignatureDoesNotMatch</Code><Message>bad</Message></Error>";
        assert_eq!(xml_tag(body, "Code").as_deref(), Some("SignatureDoesNotMatch"));
        assert_eq!(xml_tag(body, "Missing"), None);
    }
}
