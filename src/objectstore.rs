//! S3-compatible object storage client for the MinIO data lake.
//!
//! The raw bucket holds uploaded source documents; the images bucket holds
//! pictures extracted from them. Requests are signed with AWS Signature V4
//! using pure-Rust crypto (`hmac` + `sha2`), so MinIO and real S3 both
//! work. Path-style addressing is used because MinIO does not serve
//! virtual-hosted buckets by default.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::ObjectStoreConfig;

type HmacSha256 = Hmac<Sha256>;

/// Metadata for one stored object, from `ListObjectsV2`.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
    pub last_modified: i64,
    pub etag: String,
}

pub struct ObjectStore {
    scheme: String,
    host: String,
    region: String,
    access_key: String,
    secret_key: String,
    client: reqwest::Client,
}

impl ObjectStore {
    /// Build a client from configuration, reading credentials from the
    /// environment variables the config names.
    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self> {
        let access_key = std::env::var(&config.access_key_env)
            .with_context(|| format!("{} environment variable not set", config.access_key_env))?;
        let secret_key = std::env::var(&config.secret_key_env)
            .with_context(|| format!("{} environment variable not set", config.secret_key_env))?;

        let endpoint = config.endpoint.trim_end_matches('/');
        let (scheme, host) = match endpoint.split_once("://") {
            Some((s, h)) => (s.to_string(), h.to_string()),
            None => ("http".to_string(), endpoint.to_string()),
        };

        Ok(Self {
            scheme,
            host,
            region: config.region.clone(),
            access_key,
            secret_key,
            client: reqwest::Client::new(),
        })
    }

    /// List every object under `prefix`, following continuation tokens.
    pub async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let xml = self
                .send(reqwest::Method::GET, bucket, "", &query, None, None)
                .await
                .with_context(|| format!("listing bucket '{}'", bucket))?;
            let xml = String::from_utf8_lossy(&xml).to_string();

            let (batch, is_truncated, next_token) = parse_list_response(&xml);
            objects.extend(batch);

            if is_truncated {
                continuation_token = next_token;
            } else {
                break;
            }
        }

        Ok(objects)
    }

    /// Fetch an object's bytes.
    pub async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.send(reqwest::Method::GET, bucket, key, &[], None, None)
            .await
            .with_context(|| format!("getting s3://{}/{}", bucket, key))
    }

    /// Store an object, replacing any existing one at the same key.
    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        self.send(
            reqwest::Method::PUT,
            bucket,
            key,
            &[],
            Some(body),
            Some(content_type),
        )
        .await
        .with_context(|| format!("putting s3://{}/{}", bucket, key))?;
        Ok(())
    }

    /// Sign and send one request. All S3 operations go through here so the
    /// SigV4 dance lives in a single place.
    async fn send(
        &self,
        method: reqwest::Method,
        bucket: &str,
        key: &str,
        query: &[(String, String)],
        body: Option<Vec<u8>>,
        content_type: Option<&str>,
    ) -> Result<Vec<u8>> {
        let encoded_key: String = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = if key.is_empty() {
            format!("/{}/", bucket)
        } else {
            format!("/{}/{}", bucket, encoded_key)
        };

        let mut sorted_query = query.to_vec();
        sorted_query.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_querystring: String = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(body.as_deref().unwrap_or(b""));

        let headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(&self.secret_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", self.scheme, self.host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ct) = content_type {
            req = req.header("Content-Type", ct);
        }
        if let Some(b) = body {
            req = req.body(b);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "object store request failed (HTTP {}): {}",
                status,
                body.chars().take(500).collect::<String>()
            );
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

// ============ AWS SigV4 helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the SigV4 signing key.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving only unreserved characters.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML parsing (minimal, string based) ============

fn parse_list_response(xml: &str) -> (Vec<ObjectInfo>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut objects = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key").unwrap_or_default();
        // Directory placeholders have trailing slashes.
        if key.is_empty() || key.ends_with('/') {
            continue;
        }

        objects.push(ObjectInfo {
            key,
            size: extract_xml_value(block, "Size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            last_modified: extract_xml_value(block, "LastModified")
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.timestamp())
                .unwrap_or(0),
            etag: extract_xml_value(block, "ETag")
                .unwrap_or_default()
                .trim_matches('"')
                .to_string(),
        });
    }

    (objects, is_truncated, next_token)
}

fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(xml[start..start + end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_encode_leaves_unreserved() {
        assert_eq!(uri_encode("abc-123_X.~"), "abc-123_X.~");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
        assert_eq!(uri_encode("tài liệu"), "t%C3%A0i%20li%E1%BB%87u");
    }

    #[test]
    fn signing_key_matches_aws_test_vector() {
        // Known vector from the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn parses_list_objects_xml() {
        let xml = r#"<?xml version="1.0"?>
        <ListBucketResult>
          <IsTruncated>false</IsTruncated>
          <Contents>
            <Key>huong-dan-tai-game.docx</Key>
            <LastModified>2024-05-01T10:00:00.000Z</LastModified>
            <ETag>"abc123"</ETag>
            <Size>2048</Size>
          </Contents>
          <Contents>
            <Key>folder/</Key>
            <Size>0</Size>
          </Contents>
        </ListBucketResult>"#;

        let (objects, truncated, token) = parse_list_response(xml);
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, "huong-dan-tai-game.docx");
        assert_eq!(objects[0].size, 2048);
        assert_eq!(objects[0].etag, "abc123");
        assert!(!truncated);
        assert!(token.is_none());
    }

    #[test]
    fn parses_continuation_token() {
        let xml = "<ListBucketResult><IsTruncated>true</IsTruncated>\
                   <NextContinuationToken>tok123</NextContinuationToken></ListBucketResult>";
        let (_, truncated, token) = parse_list_response(xml);
        assert!(truncated);
        assert_eq!(token.as_deref(), Some("tok123"));
    }
}
