//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Outgoing requests sign `(request-target) host date` plus `digest` when a
//! body is present. The `host` value carries the port whenever it is not the
//! scheme default, matching what HTTP clients put on the wire.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};

use super::guard::authority_of;
use super::resolver::ActorResolver;
use crate::error::AppError;

/// Maximum accepted distance between the `Date` header and now
const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Sign an HTTP request
///
/// Creates HTTP Signature header for outgoing requests.
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body (for digest)
/// * `private_key_pem` - RSA private key in PKCS#8 PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Returns
/// Header values to add: Signature, Date, Digest (if body present)
///
/// # Example
/// ```ignore
/// let headers = sign_request(
///     "POST",
///     "https://remote.server/inbox",
///     Some(&body),
///     &private_key,
///     "https://my.server/users/me#main-key",
/// )?;
/// ```
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    // 1. Parse URL to get host and path
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = authority_of(&parsed_url)
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };

    // 2. Generate Date header (RFC 7231 IMF-fixdate)
    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    // 3. Generate Digest if body present
    let digest = body.map(generate_digest);

    // 4. Build signing string
    let mut signed = vec![
        ("(request-target)", format!("{} {}", method.to_lowercase(), path_and_query)),
        ("host", host.clone()),
        ("date", date.clone()),
    ];
    if let Some(ref digest_value) = digest {
        signed.push(("digest", digest_value.clone()));
    }

    let signing_string = signed
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect::<Vec<_>>()
        .join("\n");
    let headers_list = signed
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(" ");

    // 5. Sign with RSA-SHA256 (PKCS#1 v1.5)
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Encryption(format!("Invalid private key: {}", e)))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    // 6. Build Signature header
    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id, headers_list, signature_b64
    );

    Ok(SignatureHeaders {
        signature: signature_header,
        date,
        host,
        digest,
    })
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 7231)
    pub date: String,
    /// Host value that was signed
    pub host: String,
    /// Digest header value (if body present)
    pub digest: Option<String>,
}

/// Verify an HTTP request signature against a known public key
///
/// # Arguments
/// * `method` - HTTP method
/// * `path` - Request path including query
/// * `headers` - All request headers
/// * `body` - Request body (for digest verification)
/// * `public_key_pem` - RSA public key in SPKI PEM format
///
/// # Errors
/// `Validation` describing the first check that failed. Callers facing the
/// network collapse this into `InvalidSignature`.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), AppError> {
    // 1. Parse Signature header
    let signature_header = header_str(headers, "signature")?;
    let parsed = parse_signature_header(signature_header)?;

    // 2. Validate algorithm and required signed headers.
    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(AppError::Validation(format!(
            "Unsupported signature algorithm: {}",
            parsed.algorithm
        )));
    }

    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::Validation(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    let has_body = body.is_some_and(|b| !b.is_empty());
    if has_body && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::Validation(
            "Signed headers must include: digest".to_string(),
        ));
    }

    // 3. Verify Date is recent.
    let date_str = header_str(headers, "date")?;
    let date = DateTime::parse_from_rfc2822(date_str)
        .map_err(|_| AppError::Validation("Invalid Date format".to_string()))?;

    let skew = (Utc::now().timestamp() - date.timestamp()).abs();
    if skew > MAX_CLOCK_SKEW_SECS {
        return Err(AppError::Validation(
            "Date header too old or in future".to_string(),
        ));
    }

    // 4. If body present, verify Digest.
    if let Some(body_data) = body.filter(|_| has_body) {
        let digest_str = header_str(headers, "digest")?;
        if digest_str != generate_digest(body_data) {
            return Err(AppError::Validation("Digest mismatch".to_string()));
        }
    }

    // 5. Reconstruct signing string.
    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = if header_name == "(request-target)" {
            format!("{} {}", method.to_lowercase(), path)
        } else {
            header_str(headers, header_name)?.to_string()
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }
    let signing_string = signing_parts.join("\n");

    // 6. Verify RSA signature.
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::Validation("Invalid signature encoding".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Validation(format!("Invalid public key: {}", e)))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::Validation(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::Validation("Signature verification failed".to_string()))?;

    Ok(())
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::Validation(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::Validation(format!("Invalid {} header", name)))
}

/// Verify an inbound request end to end
///
/// Parses the Signature header, resolves the signing actor from `keyId`
/// (bounded by `fetch_timeout`), and checks the signature. Returns the
/// signer's canonical actor URL.
///
/// Every failure becomes `InvalidSignature`; the specific cause is only
/// logged at debug level.
pub async fn verify_request(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    resolver: &ActorResolver,
    fetch_timeout: Duration,
) -> Result<String, AppError> {
    let outcome = async {
        let signature_header = header_str(headers, "signature")?;
        let parsed = parse_signature_header(signature_header)?;
        let actor_url = key_id_actor_url(&parsed.key_id).to_string();

        let actor = tokio::time::timeout(fetch_timeout, resolver.resolve_url(&actor_url))
            .await
            .map_err(|_| AppError::Federation(format!("Timed out resolving {}", actor_url)))??;

        if parsed.key_id.contains('#') && actor.key_id() != parsed.key_id {
            return Err(AppError::Validation(
                "Signature keyId does not match actor public key id".to_string(),
            ));
        }

        verify_signature(method, path, headers, Some(body), actor.public_key_pem())?;
        Ok::<_, AppError>(actor.url().to_string())
    }
    .await;

    outcome.map_err(|cause| {
        tracing::debug!(error = %cause, path, "Rejecting inbound signature");
        crate::metrics::SIGNATURE_FAILURES_TOTAL
            .with_label_values(&[cause.kind()])
            .inc();
        AppError::InvalidSignature
    })
}

/// Actor URL a keyId belongs to (fragment stripped)
pub fn key_id_actor_url(key_id: &str) -> &str {
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
                "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect::<Vec<_>>(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Ok(ParsedSignature {
        key_id: key_id
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::Validation("Missing keyId".to_string()))?,
        algorithm: algorithm
            .ok_or_else(|| AppError::Validation("Missing algorithm".to_string()))?,
        headers: headers
            .filter(|h| !h.is_empty())
            .ok_or_else(|| AppError::Validation("Missing headers".to_string()))?,
        signature: signature
            .filter(|s| !s.is_empty())
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
