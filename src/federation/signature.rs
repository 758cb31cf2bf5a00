//! HTTP Signatures
//!
//! Implements signing and verification per the draft-cavage scheme used by
//! ActivityPub servers (https://docs.joinmastodon.org/spec/security/).
//! GET requests sign `(request-target) date`; POST requests additionally
//! sign `digest`, which binds the body to the signature.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

/// Signed header set for dereferencing GETs.
pub const GET_SIGNED_HEADERS: &[&str] = &["(request-target)", "date"];

/// Signed header set for deliveries.
pub const POST_SIGNED_HEADERS: &[&str] = &["(request-target)", "date", "digest"];

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// A parsed private key bound to a key id and one signed header set.
pub struct HttpSigner {
    key_id: String,
    signing_key: SigningKey<Sha256>,
    headers: &'static [&'static str],
}

impl HttpSigner {
    pub fn new(
        private_key_pem: &str,
        key_id: impl Into<String>,
        headers: &'static [&'static str],
    ) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
            .map_err(|e| AppError::Validation(format!("Invalid private key: {}", e)))?;

        Ok(Self {
            key_id: key_id.into(),
            signing_key: SigningKey::<Sha256>::new_unprefixed(private_key),
            headers,
        })
    }

    pub fn for_get(private_key_pem: &str, key_id: impl Into<String>) -> Result<Self, AppError> {
        Self::new(private_key_pem, key_id, GET_SIGNED_HEADERS)
    }

    pub fn for_post(private_key_pem: &str, key_id: impl Into<String>) -> Result<Self, AppError> {
        Self::new(private_key_pem, key_id, POST_SIGNED_HEADERS)
    }

    /// Sign a request to `url`.
    ///
    /// A body is required exactly when the header set includes `digest`.
    pub fn sign(
        &self,
        method: &str,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<SignatureHeaders, AppError> {
        let parsed_url =
            url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

        let host = parsed_url
            .host_str()
            .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
        let host = match parsed_url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let path_and_query = match parsed_url.query() {
            Some(q) => format!("{}?{}", parsed_url.path(), q),
            None => parsed_url.path().to_string(),
        };

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let digest = body.map(generate_digest);

        let mut signing_parts = Vec::with_capacity(self.headers.len());
        for header in self.headers {
            let value = match *header {
                "(request-target)" => format!("{} {}", method.to_lowercase(), path_and_query),
                "host" => host.clone(),
                "date" => date.clone(),
                "digest" => digest.clone().ok_or_else(|| {
                    AppError::Validation("digest must be signed over a body".to_string())
                })?,
                other => {
                    return Err(AppError::Validation(format!(
                        "Cannot sign header: {}",
                        other
                    )));
                }
            };
            signing_parts.push(format!("{}: {}", header, value));
        }
        let signing_string = signing_parts.join("\n");

        let mut rng = rand::thread_rng();
        let signature = self
            .signing_key
            .sign_with_rng(&mut rng, signing_string.as_bytes());
        let signature_b64 = BASE64.encode(signature.to_bytes());

        let signature_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            self.headers.join(" "),
            signature_b64
        );

        Ok(SignatureHeaders {
            signature: signature_header,
            date,
            digest,
        })
    }
}

/// Verify an HTTP request signature
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path including query
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - RSA public key in PEM format
/// * `max_skew_seconds` - Accepted distance between Date and now
///
/// # Errors
/// - `Validation` for malformed or incomplete signatures
/// - `InvalidSignature` when the cryptographic check fails
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
    max_skew_seconds: i64,
) -> Result<(), AppError> {
    let signature_header = header_str(headers, "signature", "Signature")?;
    let parsed = parse_signature_header(signature_header)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Validation(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Validation(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Validation(
            "Signed headers must include: digest".to_string(),
        ));
    }

    let date_str = header_str(headers, "date", "Date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::Validation("Invalid Date format".to_string()))?;
    let skew = (Utc::now().timestamp() - date.timestamp()).abs();
    if skew > max_skew_seconds {
        return Err(AppError::Validation(
            "Date header too old or in future".to_string(),
        ));
    }

    if let Some(body_data) = body {
        let digest_str = header_str(headers, "digest", "Digest")?;
        if digest_str != generate_digest(body_data) {
            return Err(AppError::Validation("Digest mismatch".to_string()));
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" | "date" | "digest" | "content-type" => {
                header_str(headers, header_name, header_name)?.to_string()
            }
            _ => {
                return Err(AppError::Validation(format!(
                    "Unsupported header in signature: {}",
                    header_name
                )));
            }
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid public key: {}", e)))?;
    let verifier = VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Validation(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature)
}

fn header_str<'a>(
    headers: &'a http::HeaderMap,
    name: &str,
    label: &str,
) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", label)))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {} header", label)))
}

/// Extract keyId from Signature header.
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, AppError> {
    let signature_header = header_str(headers, "signature", "Signature")?;
    Ok(parse_signature_header(signature_header)?.key_id)
}

/// Actor IRI a key id belongs to: the key id without its fragment.
pub fn key_owner(key_id: &str) -> &str {
    key_id.split('#').next().unwrap_or(key_id)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Algorithm (usually rsa-sha256)
    pub algorithm: String,
    /// Signed header names
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"');

            match key.trim() {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_string()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        // hs2019 peers may omit the algorithm; the key type decides.
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::Validation("Missing signature".to_string()))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key_pair;
    use http::{HeaderMap, HeaderValue};

    const KEY_ID: &str = "https://a.example/u/alice#main-key";

    /// One-off signature; the header set follows from whether a body is present.
    fn sign_request(
        method: &str,
        url: &str,
        body: Option<&[u8]>,
        private_key_pem: &str,
        key_id: &str,
    ) -> Result<SignatureHeaders, AppError> {
        let headers = if body.is_some() {
            POST_SIGNED_HEADERS
        } else {
            GET_SIGNED_HEADERS
        };
        HttpSigner::new(private_key_pem, key_id, headers)?.sign(method, url, body)
    }

    fn build_signed_header_map(
        signed: SignatureHeaders,
        url: &str,
    ) -> (HeaderMap, String) {
        let parsed_url = url::Url::parse(url).expect("valid test url");
        let path_and_query = match parsed_url.query() {
            Some(query) => format!("{}?{}", parsed_url.path(), query),
            None => parsed_url.path().to_string(),
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            "host",
            HeaderValue::from_str(parsed_url.host_str().expect("host")).expect("host header"),
        );
        headers.insert("date", HeaderValue::from_str(&signed.date).expect("date header"));
        if let Some(digest) = signed.digest {
            headers.insert("digest", HeaderValue::from_str(&digest).expect("digest header"));
        }
        headers.insert(
            "signature",
            HeaderValue::from_str(&signed.signature).expect("signature header"),
        );

        (headers, path_and_query)
    }

    #[test]
    fn post_signature_round_trips() {
        let keys = generate_key_pair(1024).unwrap();
        let body = br#"{"type":"Follow"}"#;
        let url = "https://b.example/inbox?foo=bar";
        let signer = HttpSigner::for_post(&keys.private_pem, KEY_ID).unwrap();
        let (headers, path) =
            build_signed_header_map(signer.sign("POST", url, Some(body)).unwrap(), url);

        let result = verify_signature("POST", &path, &headers, Some(body), &keys.public_pem, 300);
        assert!(result.is_ok(), "valid signature should verify: {result:?}");
    }

    #[test]
    fn get_signature_round_trips_without_digest() {
        let keys = generate_key_pair(1024).unwrap();
        let url = "https://b.example/u/bob";
        let signer = HttpSigner::for_get(&keys.private_pem, KEY_ID).unwrap();
        let signed = signer.sign("GET", url, None).unwrap();
        assert!(signed.digest.is_none());
        assert!(signed.signature.contains("headers=\"(request-target) date\""));

        let (headers, path) = build_signed_header_map(signed, url);
        assert!(verify_signature("GET", &path, &headers, None, &keys.public_pem, 300).is_ok());
    }

    #[test]
    fn altered_body_fails_digest_check() {
        let keys = generate_key_pair(1024).unwrap();
        let url = "https://b.example/inbox";
        let signed = sign_request("POST", url, Some(b"original"), &keys.private_pem, KEY_ID).unwrap();
        let (headers, path) = build_signed_header_map(signed, url);

        match verify_signature("POST", &path, &headers, Some(b"tampered"), &keys.public_pem, 300) {
            Err(AppError::Validation(msg)) => assert!(msg.contains("Digest mismatch")),
            other => panic!("expected digest mismatch, got: {other:?}"),
        }
    }

    #[test]
    fn altered_signed_header_fails_verification() {
        let keys = generate_key_pair(1024).unwrap();
        let url = "https://b.example/inbox";
        let body = br#"{"type":"Accept"}"#;
        let signed = sign_request("POST", url, Some(body), &keys.private_pem, KEY_ID).unwrap();
        let (headers, _) = build_signed_header_map(signed, url);

        // Same body and headers, different request target.
        let result = verify_signature("POST", "/other-inbox", &headers, Some(body), &keys.public_pem, 300);
        assert!(matches!(result, Err(AppError::InvalidSignature)));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let signer_keys = generate_key_pair(1024).unwrap();
        let other_keys = generate_key_pair(1024).unwrap();
        let url = "https://b.example/u/bob";
        let signed = sign_request("GET", url, None, &signer_keys.private_pem, KEY_ID).unwrap();
        let (headers, path) = build_signed_header_map(signed, url);

        let result = verify_signature("GET", &path, &headers, None, &other_keys.public_pem, 300);
        assert!(matches!(result, Err(AppError::InvalidSignature)));
    }

    #[test]
    fn verify_signature_rejects_missing_date_header() {
        let keys = generate_key_pair(1024).unwrap();
        let url = "https://b.example/inbox";
        let body = br#"{"type":"Follow"}"#;
        let signed = sign_request("POST", url, Some(body), &keys.private_pem, KEY_ID).unwrap();
        let (mut headers, path) = build_signed_header_map(signed, url);
        headers.remove("date");

        match verify_signature("POST", &path, &headers, Some(body), &keys.public_pem, 300) {
            Err(AppError::Validation(msg)) => assert!(msg.contains("Missing Date header")),
            other => panic!("expected missing Date header error, got: {other:?}"),
        }
    }

    #[test]
    fn verify_signature_rejects_unsigned_digest_for_body() {
        let keys = generate_key_pair(1024).unwrap();
        let url = "https://b.example/inbox";
        // Signed as a GET, then replayed with a body.
        let signed = sign_request("POST", url, None, &keys.private_pem, KEY_ID).unwrap();
        let (headers, path) = build_signed_header_map(signed, url);

        match verify_signature("POST", &path, &headers, Some(b"{}"), &keys.public_pem, 300) {
            Err(AppError::Validation(msg)) => {
                assert!(msg.contains("Signed headers must include: digest"))
            }
            other => panic!("expected missing signed digest error, got: {other:?}"),
        }
    }

    #[test]
    fn parse_signature_header_reads_fields() {
        let parsed = parse_signature_header(
            "keyId=\"https://a.example/u/alice#main-key\",algorithm=\"rsa-sha256\",headers=\"(request-target) Date\",signature=\"Zm9v\"",
        )
        .unwrap();
        assert_eq!(parsed.key_id, KEY_ID);
        assert_eq!(parsed.headers, vec!["(request-target)", "date"]);
        assert_eq!(parsed.signature, "Zm9v");
    }

    #[test]
    fn key_owner_strips_fragment() {
        assert_eq!(key_owner(KEY_ID), "https://a.example/u/alice");
        assert_eq!(key_owner("https://a.example/u/alice"), "https://a.example/u/alice");
    }
}
