//! Job access tokens
//!
//! The main server proves itself with a compact JWS signed with Ed25519
//! (`alg = "EdDSA"`). Format: `base64url(header).base64url(claims).base64url(sig)`,
//! unpadded, with the signature over the first two segments.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use tether_utils::{Result, TetherError};

/// Environment variable carrying the base64 verifying key
pub const PUBLIC_KEY_ENV_VAR: &str = "TETHER_PUBLICKEY";

const ALG: &str = "EdDSA";

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Claims carried by a job access token
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    /// Set only in tokens minted for a main server
    #[serde(default)]
    pub mainserver: bool,
    #[serde(default)]
    pub jobid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Expiry, unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Not-before, unix seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
}

impl AccessClaims {
    /// Claims for a main server allowed to drive `job_id`
    pub fn main_server(job_id: impl Into<String>) -> Self {
        Self {
            mainserver: true,
            jobid: job_id.into(),
            ..Self::default()
        }
    }
}

/// Verifies tokens against the main server's public key
#[derive(Debug, Clone)]
pub struct AccessVerifier {
    key: VerifyingKey,
}

impl AccessVerifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Build from a standard-base64 encoded 32-byte Ed25519 public key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| TetherError::auth(format!("invalid public key encoding: {}", e)))?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            TetherError::auth(format!("public key must be 32 bytes, got {}", bytes.len()))
        })?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| TetherError::auth(format!("invalid public key: {}", e)))?;
        Ok(Self::new(key))
    }

    /// Check the signature and time bounds, returning the claims
    pub fn verify(&self, token: &str) -> Result<AccessClaims> {
        let mut parts = token.split('.');
        let (header64, claims64, sig64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(c), Some(s), None) => (h, c, s),
                _ => return Err(TetherError::auth("malformed token")),
            };

        let header: Header = decode_segment(header64)?;
        if header.alg != ALG {
            return Err(TetherError::auth(format!("unsupported alg: {}", header.alg)));
        }

        let sig_bytes = URL_SAFE_NO_PAD
            .decode(sig64)
            .map_err(|_| TetherError::auth("malformed signature"))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| TetherError::auth("malformed signature"))?;
        let signature = Signature::from_bytes(&sig_bytes);

        let signed = &token[..header64.len() + 1 + claims64.len()];
        self.key
            .verify_strict(signed.as_bytes(), &signature)
            .map_err(|_| TetherError::auth("invalid signature"))?;

        let claims: AccessClaims = decode_segment(claims64)?;
        let now = chrono::Utc::now().timestamp();
        if matches!(claims.exp, Some(exp) if now >= exp) {
            return Err(TetherError::auth("token expired"));
        }
        if matches!(claims.nbf, Some(nbf) if now < nbf) {
            return Err(TetherError::auth("token not yet valid"));
        }
        Ok(claims)
    }

    /// Verify a token presented by a main server for `job_id`
    pub fn verify_job_access(&self, token: &str, job_id: &str) -> Result<AccessClaims> {
        let claims = self.verify(token)?;
        if !claims.mainserver {
            return Err(TetherError::auth("token is not for a main server"));
        }
        if claims.jobid != job_id {
            return Err(TetherError::auth(format!(
                "token is for job {:?}, not {:?}",
                claims.jobid, job_id
            )));
        }
        Ok(claims)
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TetherError::auth("malformed token segment"))?;
    serde_json::from_slice(&bytes).map_err(|e| TetherError::auth(format!("malformed token: {}", e)))
}

/// Sign `claims` into a token (used by main servers and tests)
pub fn sign_token(key: &SigningKey, claims: &AccessClaims) -> Result<String> {
    let header = Header {
        alg: ALG.into(),
        typ: Some("JWT".into()),
    };
    let header = serde_json::to_vec(&header)
        .map_err(|e| TetherError::internal(format!("failed to encode header: {}", e)))?;
    let claims = serde_json::to_vec(claims)
        .map_err(|e| TetherError::internal(format!("failed to encode claims: {}", e)))?;

    let signed = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header),
        URL_SAFE_NO_PAD.encode(claims)
    );
    let signature = key.sign(signed.as_bytes());
    Ok(format!(
        "{}.{}",
        signed,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn verifier(key: &SigningKey) -> AccessVerifier {
        AccessVerifier::new(key.verifying_key())
    }

    // ==================== Verification Tests ====================

    #[test]
    fn test_valid_main_server_token() {
        let key = signing_key(1);
        let token = sign_token(&key, &AccessClaims::main_server("job-1")).unwrap();

        let claims = verifier(&key).verify_job_access(&token, "job-1").unwrap();
        assert!(claims.mainserver);
        assert_eq!(claims.jobid, "job-1");
    }

    #[test]
    fn test_not_main_server_rejected() {
        let key = signing_key(1);
        let claims = AccessClaims {
            mainserver: false,
            jobid: "job-1".into(),
            ..AccessClaims::default()
        };
        let token = sign_token(&key, &claims).unwrap();

        let err = verifier(&key).verify_job_access(&token, "job-1").unwrap_err();
        assert!(err.to_string().contains("main server"));
    }

    #[test]
    fn test_wrong_job_rejected() {
        let key = signing_key(1);
        let token = sign_token(&key, &AccessClaims::main_server("job-1")).unwrap();
        assert!(verifier(&key).verify_job_access(&token, "job-2").is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let token = sign_token(&signing_key(1), &AccessClaims::main_server("j")).unwrap();
        let err = verifier(&signing_key(2)).verify(&token).unwrap_err();
        assert!(err.to_string().contains("invalid signature"));
    }

    #[test]
    fn test_tampered_claims_rejected() {
        let key = signing_key(1);
        let token = sign_token(&key, &AccessClaims::main_server("job-1")).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged_claims =
            URL_SAFE_NO_PAD.encode(br#"{"mainserver":true,"jobid":"job-2"}"#);
        let forged = format!("{}.{}.{}", parts[0], forged_claims, parts[2]);

        assert!(verifier(&key).verify(&forged).is_err());
    }

    #[test]
    fn test_malformed_tokens() {
        let v = verifier(&signing_key(1));
        assert!(v.verify("").is_err());
        assert!(v.verify("a.b").is_err());
        assert!(v.verify("a.b.c.d").is_err());
        assert!(v.verify("!!.@@.##").is_err());
    }

    #[test]
    fn test_wrong_alg_rejected() {
        let key = signing_key(1);
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let claims = URL_SAFE_NO_PAD.encode(br#"{"mainserver":true,"jobid":"j"}"#);
        let signed = format!("{}.{}", header, claims);
        let sig = URL_SAFE_NO_PAD.encode(key.sign(signed.as_bytes()).to_bytes());
        let token = format!("{}.{}", signed, sig);

        let err = verifier(&key).verify(&token).unwrap_err();
        assert!(err.to_string().contains("unsupported alg"));
    }

    // ==================== Time Bound Tests ====================

    #[test]
    fn test_expired_token() {
        let key = signing_key(3);
        let claims = AccessClaims {
            exp: Some(chrono::Utc::now().timestamp() - 10),
            ..AccessClaims::main_server("j")
        };
        let token = sign_token(&key, &claims).unwrap();
        let err = verifier(&key).verify(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_not_yet_valid_token() {
        let key = signing_key(3);
        let claims = AccessClaims {
            nbf: Some(chrono::Utc::now().timestamp() + 3600),
            exp: Some(chrono::Utc::now().timestamp() + 7200),
            ..AccessClaims::main_server("j")
        };
        let token = sign_token(&key, &claims).unwrap();
        assert!(verifier(&key).verify(&token).is_err());
    }

    // ==================== Key Loading Tests ====================

    #[test]
    fn test_from_base64() {
        let key = signing_key(5);
        let encoded = STANDARD.encode(key.verifying_key().to_bytes());
        let v = AccessVerifier::from_base64(&encoded).unwrap();

        let token = sign_token(&key, &AccessClaims::main_server("j")).unwrap();
        assert!(v.verify(&token).is_ok());
    }

    #[test]
    fn test_from_base64_wrong_length() {
        let err = AccessVerifier::from_base64(&STANDARD.encode([0u8; 16])).unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
        assert!(AccessVerifier::from_base64("not base64!").is_err());
    }
}
