//! Key & signature engine (§4.2): RSA keypair generation, HTTP signature manufacture, and
//! verification with clock-skew and digest checks.
//!
//! Implemented by hand against the `rsa`/`sha2` crates directly instead of
//! `http-signature-normalization-reqwest` so that the exact signing-string format pinned by
//! spec.md §4.2 and §8 is fully owned here rather than delegated to that crate's defaults.

use crate::error::Error;
use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey},
    Pkcs1v15Sign,
    RsaPrivateKey,
    RsaPublicKey,
};
use sha2::{Digest, Sha256, Sha512};
use std::{collections::BTreeMap, time::Duration};

/// Bits used for newly generated actor keypairs (§4.2: "4096-bit RSA").
const KEY_BITS: usize = 4096;

/// Maximum allowed clock skew between the `Date` header and local time (§4.2, §8 scenario 2).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Default header list used when signing, in order (§4.2).
pub const DEFAULT_HEADERS_WITH_DIGEST: &[&str] = &["(request-target)", "host", "date", "digest"];
/// Header list used when there is no request body to digest.
pub const DEFAULT_HEADERS_NO_BODY: &[&str] = &["(request-target)", "host", "date"];

/// A PEM-encoded RSA keypair used for HTTP signatures.
#[derive(Debug, Clone)]
pub struct Keypair {
    /// PKCS#8 PEM private key.
    pub private_key: String,
    /// PKCS#1/SPKI PEM public key.
    pub public_key: String,
}

/// Generates a fresh 4096-bit RSA keypair for a newly synthesized local fed actor.
pub fn generate_actor_keypair() -> Result<Keypair, Error> {
    let mut rng = OsRng;
    let private = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(Error::other)?;
    let public = RsaPublicKey::from(&private);
    let private_key = private
        .to_pkcs8_pem(Default::default())
        .map_err(Error::other)?
        .to_string();
    let public_key = public.to_public_key_pem(Default::default()).map_err(Error::other)?;
    Ok(Keypair {
        private_key,
        public_key,
    })
}

fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, Error> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(Error::other)
}

fn parse_public_key(pem: &str) -> Result<RsaPublicKey, Error> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(Error::other)
}

/// `keyId` value for an actor's main signing key (`<actor>#main-key`).
pub fn main_key_id(actor_id: &url::Url) -> String {
    format!("{actor_id}#main-key")
}

/// Computes the `Digest` header value for a request body (§4.2).
pub fn digest_header(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", Base64.encode(hasher.finalize()))
}

/// Inputs required to build a signed request, independent of any particular HTTP client.
pub struct SignRequestInput<'a> {
    pub method: &'a str,
    pub path_and_query: &'a str,
    pub host: &'a str,
    pub body: Option<&'a [u8]>,
    pub key_id: &'a str,
    pub private_key_pem: &'a str,
}

/// The headers produced by [`sign_request`], ready to attach to an outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub date: String,
    pub digest: Option<String>,
    pub signature: String,
}

/// Builds the signing string for `headers` over the given pseudo/real header values, then signs
/// it with `private_key`, producing the `Signature` header value. Implements the algorithm of
/// §4.2 / the testable property in §8 ("the signing string includes `(request-target)`, `host`,
/// `date`, and `digest`... in exactly the order declared by the headers field").
pub fn sign_request(input: SignRequestInput<'_>, now: DateTime<Utc>) -> Result<SignedHeaders, Error> {
    let date = httpdate::fmt_http_date(now.into());
    let digest = input.body.map(digest_header);

    let mut values: BTreeMap<&str, String> = BTreeMap::new();
    values.insert("host", input.host.to_string());
    values.insert("date", date.clone());
    if let Some(d) = &digest {
        values.insert("digest", d.clone());
    }

    let headers: Vec<&str> = if digest.is_some() {
        DEFAULT_HEADERS_WITH_DIGEST.to_vec()
    } else {
        DEFAULT_HEADERS_NO_BODY.to_vec()
    };

    let signing_string = build_signing_string(&headers, input.method, input.path_and_query, &values);

    let private_key = parse_private_key(input.private_key_pem)?;
    let mut hasher = Sha256::new();
    hasher.update(signing_string.as_bytes());
    let hashed = hasher.finalize();
    let signature_bytes = private_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &hashed)
        .map_err(Error::other)?;
    let signature_b64 = Base64.encode(signature_bytes);

    let signature = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        input.key_id,
        headers.join(" "),
        signature_b64
    );

    Ok(SignedHeaders {
        date,
        digest,
        signature,
    })
}

fn build_signing_string(
    headers: &[&str],
    method: &str,
    path_and_query: &str,
    values: &BTreeMap<&str, String>,
) -> String {
    headers
        .iter()
        .map(|h| {
            if *h == "(request-target)" {
                format!("(request-target): {} {}", method.to_lowercase(), path_and_query)
            } else {
                let value = values.get(h).map(String::as_str).unwrap_or("");
                format!("{}: {}", h.to_lowercase(), value)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The four fields parsed out of an inbound `Signature` header.
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    pub headers: Vec<String>,
    pub signature: Vec<u8>,
}

/// Parses a `Signature` header value into its component fields. Rejects malformed headers.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, Error> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        let (name, value) = part
            .split_once('=')
            .ok_or(Error::SignatureInvalid)?;
        let value = value.trim_matches('"');
        match name {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_string()),
            "headers" => headers = Some(value.split(' ').map(str::to_string).collect()),
            "signature" => {
                signature = Some(Base64.decode(value).map_err(|_| Error::SignatureInvalid)?)
            }
            _ => {}
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or(Error::SignatureInvalid)?,
        algorithm: algorithm.unwrap_or_else(|| "rsa-sha256".to_string()),
        headers: headers.ok_or(Error::SignatureInvalid)?,
        signature: signature.ok_or(Error::SignatureInvalid)?,
    })
}

/// Inputs for verifying an inbound signed request.
pub struct VerifyRequestInput<'a> {
    pub method: &'a str,
    pub path_and_query: &'a str,
    pub header_values: &'a BTreeMap<String, String>,
}

/// Verifies that `parsed.signature` is a valid signature over the signing string built from
/// `parsed.headers`, using `public_key_pem`. Accepts `rsa-sha256` and `rsa-sha512` (§4.2).
pub fn verify_signature(
    parsed: &ParsedSignature,
    input: &VerifyRequestInput<'_>,
    public_key_pem: &str,
) -> Result<(), Error> {
    let headers: Vec<&str> = parsed.headers.iter().map(String::as_str).collect();
    let values: BTreeMap<&str, String> = input
        .header_values
        .iter()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect();
    let signing_string = build_signing_string(&headers, input.method, input.path_and_query, &values);

    let public_key = parse_public_key(public_key_pem)?;

    let ok = match parsed.algorithm.as_str() {
        "rsa-sha512" => {
            let mut hasher = Sha512::new();
            hasher.update(signing_string.as_bytes());
            public_key
                .verify(Pkcs1v15Sign::new::<Sha512>(), &hasher.finalize(), &parsed.signature)
                .is_ok()
        }
        _ => {
            let mut hasher = Sha256::new();
            hasher.update(signing_string.as_bytes());
            public_key
                .verify(Pkcs1v15Sign::new::<Sha256>(), &hasher.finalize(), &parsed.signature)
                .is_ok()
        }
    };

    if ok {
        Ok(())
    } else {
        Err(Error::SignatureInvalid)
    }
}

/// Checks that `date` is within [`MAX_CLOCK_SKEW`] of `now`. The boundary itself (exactly 30s)
/// is rejected — a strict inequality check (§8 boundary behavior).
pub fn check_clock_skew(date: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), Error> {
    let diff = (now - date).num_milliseconds().unsigned_abs();
    if diff < MAX_CLOCK_SKEW.as_millis() as u64 {
        Ok(())
    } else {
        Err(Error::ClockSkew)
    }
}

/// Verifies a `Digest` header against the actual request body, if either is present. An absent
/// body and absent header is accepted (§8 boundary behavior); a present header with no matching
/// digest algorithm, or a mismatched hash, is rejected.
pub fn verify_body_digest(digest_header_value: Option<&str>, body: &[u8]) -> Result<(), Error> {
    match digest_header_value {
        None => {
            if body.is_empty() {
                Ok(())
            } else {
                Err(Error::DigestInvalid)
            }
        }
        Some(header) => {
            let expected = digest_header(body);
            // Header may carry algorithm case differently; compare case-insensitively on the
            // algorithm tag, exactly on the base64 payload.
            if header.eq_ignore_ascii_case(&expected) {
                Ok(())
            } else {
                Err(Error::DigestInvalid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_keypair() -> Keypair {
        generate_actor_keypair().expect("keygen")
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let keypair = test_keypair();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let body = br#"{"id":"x"}"#;
        let signed = sign_request(
            SignRequestInput {
                method: "POST",
                path_and_query: "/inbox",
                host: "example.com",
                body: Some(body),
                key_id: "https://example.com/u/alice#main-key",
                private_key_pem: &keypair.private_key,
            },
            now,
        )
        .expect("sign");

        let parsed = parse_signature_header(&signed.signature).expect("parse");
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date", "digest"]);

        let mut header_values = BTreeMap::new();
        header_values.insert("host".to_string(), "example.com".to_string());
        header_values.insert("date".to_string(), signed.date.clone());
        header_values.insert("digest".to_string(), signed.digest.clone().unwrap());

        verify_signature(
            &parsed,
            &VerifyRequestInput {
                method: "POST",
                path_and_query: "/inbox",
                header_values: &header_values,
            },
            &keypair.public_key,
        )
        .expect("verify");
    }

    #[test]
    fn sign_without_body_omits_digest() {
        let keypair = test_keypair();
        let now = Utc::now();
        let signed = sign_request(
            SignRequestInput {
                method: "GET",
                path_and_query: "/users/alice",
                host: "example.com",
                body: None,
                key_id: "https://example.com/u/alice#main-key",
                private_key_pem: &keypair.private_key,
            },
            now,
        )
        .expect("sign");
        assert!(signed.digest.is_none());
        let parsed = parse_signature_header(&signed.signature).unwrap();
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date"]);
    }

    #[test]
    fn clock_skew_boundary_is_rejected() {
        let now = Utc::now();
        let exactly_30s_ago = now - chrono::Duration::seconds(30);
        assert_eq!(check_clock_skew(exactly_30s_ago, now), Err(Error::ClockSkew));
        let within = now - chrono::Duration::seconds(29);
        assert!(check_clock_skew(within, now).is_ok());
    }

    #[test]
    fn empty_body_without_digest_header_is_accepted() {
        assert!(verify_body_digest(None, b"").is_ok());
    }

    #[test]
    fn digest_mismatch_is_rejected() {
        let wrong = "SHA-256=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
        assert_eq!(
            verify_body_digest(Some(wrong), b"hello world"),
            Err(Error::DigestInvalid)
        );
    }
}
