//! ES256 signing keys, JWKS and JWT signing

use std::path::Path;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

pub const ALGORITHM: &str = "ES256";

/// Public half of the signing key in JWK form
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: &'static str,
    pub crv: &'static str,
    pub x: String,
    pub y: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub use_: &'static str,
    pub alg: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// The provider's token signing key
pub struct SigningKeys {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    jwk: Jwk,
}

impl SigningKeys {
    /// Generate an ephemeral key, tokens do not survive a restart
    pub fn generate() -> anyhow::Result<Self> {
        Self::from_signing_key(&SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// Load a P-256 key from a PKCS#8 PEM file
    pub fn from_pem_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read signing key: {}", path.display()))?;
        let signing_key = SigningKey::from_pkcs8_pem(&pem).map_err(|e| {
            anyhow::anyhow!("Invalid P-256 PKCS#8 key in {}: {}", path.display(), e)
        })?;
        Self::from_signing_key(&signing_key)
    }

    fn from_signing_key(signing_key: &SigningKey) -> anyhow::Result<Self> {
        let der = signing_key
            .to_pkcs8_der()
            .map_err(|e| anyhow::anyhow!("Failed to encode signing key: {}", e))?;
        let encoding_key = EncodingKey::from_ec_der(der.as_bytes());

        let point = VerifyingKey::from(signing_key).to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            anyhow::bail!("Signing key has no affine public point");
        };
        let x = URL_SAFE_NO_PAD.encode(x);
        let y = URL_SAFE_NO_PAD.encode(y);
        let decoding_key =
            DecodingKey::from_ec_components(&x, &y).context("Failed to build verification key")?;

        // RFC 7638 thumbprint, members in lexicographic order
        let thumbprint = format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#);
        let kid = URL_SAFE_NO_PAD.encode(Sha256::digest(thumbprint.as_bytes()));

        Ok(Self {
            encoding_key,
            decoding_key,
            jwk: Jwk {
                kty: "EC",
                crv: "P-256",
                x,
                y,
                kid,
                use_: "sig",
                alg: ALGORITHM,
            },
        })
    }

    pub fn kid(&self) -> &str {
        &self.jwk.kid
    }

    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![self.jwk.clone()],
        }
    }

    /// ES256 validation for tokens issued by `issuer`
    ///
    /// Audiences differ between access and ID tokens and are not checked.
    /// Expiry is enforced without leeway when `check_exp` is set.
    pub fn validation(issuer: &str, check_exp: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::ES256);
        validation.set_issuer(&[issuer]);
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.validate_exp = check_exp;
        if !check_exp {
            validation.required_spec_claims.clear();
        }
        validation
    }

    /// Sign `claims` as a JWT carrying this key's `kid`
    pub fn sign<T: Serialize>(&self, claims: &T) -> jsonwebtoken::errors::Result<String> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.jwk.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key)
    }

    /// Check signature and registered claims of a JWT and decode its payload
    pub fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        validation: &Validation,
    ) -> jsonwebtoken::errors::Result<T> {
        let header = jsonwebtoken::decode_header(token)?;
        if header.kid.as_deref().is_some_and(|kid| kid != self.jwk.kid) {
            return Err(jsonwebtoken::errors::ErrorKind::InvalidSignature.into());
        }
        jsonwebtoken::decode::<T>(token, &self.decoding_key, validation).map(|data| data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::errors::ErrorKind;
    use p256::pkcs8::LineEnding;
    use serde_json::{Value, json};

    const ISSUER: &str = "http://localhost:8082";

    fn claims(sub: &str) -> Value {
        let now = chrono::Utc::now().timestamp();
        json!({"iss": ISSUER, "sub": sub, "iat": now, "exp": now + 60})
    }

    fn validation() -> Validation {
        SigningKeys::validation(ISSUER, true)
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = SigningKeys::generate().unwrap();
        let token = keys.sign(&claims("alice")).unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims: Value = keys.verify(&token, &validation()).unwrap();
        assert_eq!(claims["sub"], "alice");
    }

    #[test]
    fn test_header_carries_kid_and_alg() {
        let keys = SigningKeys::generate().unwrap();
        let token = keys.sign(&claims("alice")).unwrap();
        let header = jsonwebtoken::decode_header(&token).unwrap();
        assert_eq!(header.alg, Algorithm::ES256);
        assert_eq!(header.typ.as_deref(), Some("JWT"));
        assert_eq!(header.kid.as_deref(), Some(keys.kid()));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let keys = SigningKeys::generate().unwrap();
        let token = keys.sign(&claims("alice")).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims("mallory")).unwrap());
        let tampered = format!("{}.{}.{}", parts[0], forged, parts[2]);

        let err = keys.verify::<Value>(&tampered, &validation()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidSignature));
    }

    #[test]
    fn test_token_from_other_key_is_rejected() {
        let keys = SigningKeys::generate().unwrap();
        let other = SigningKeys::generate().unwrap();
        let token = other.sign(&claims("alice")).unwrap();
        assert!(keys.verify::<Value>(&token, &validation()).is_err());
    }

    #[test]
    fn test_registered_claims_are_validated() {
        let keys = SigningKeys::generate().unwrap();
        let now = chrono::Utc::now().timestamp();

        let expired = keys
            .sign(&json!({"iss": ISSUER, "sub": "alice", "exp": now - 1}))
            .unwrap();
        let err = keys.verify::<Value>(&expired, &validation()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ExpiredSignature));
        let lenient = SigningKeys::validation(ISSUER, false);
        assert!(keys.verify::<Value>(&expired, &lenient).is_ok());

        let foreign = keys
            .sign(&json!({"iss": "http://elsewhere", "sub": "alice", "exp": now + 60}))
            .unwrap();
        let err = keys.verify::<Value>(&foreign, &validation()).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidIssuer));
    }

    #[test]
    fn test_malformed_tokens() {
        let keys = SigningKeys::generate().unwrap();
        assert!(keys.verify::<Value>("abc", &validation()).is_err());
        assert!(keys.verify::<Value>("a.b.c.d", &validation()).is_err());
    }

    #[test]
    fn test_jwks_shape() {
        let keys = SigningKeys::generate().unwrap();
        let jwks = serde_json::to_value(keys.jwks()).unwrap();
        let key = &jwks["keys"][0];
        assert_eq!(key["kty"], "EC");
        assert_eq!(key["crv"], "P-256");
        assert_eq!(key["use"], "sig");
        assert_eq!(key["alg"], "ES256");
        assert_eq!(key["kid"], keys.kid());
        // 32 byte coordinates
        assert_eq!(key["x"].as_str().unwrap().len(), 43);
        assert_eq!(key["y"].as_str().unwrap().len(), 43);
    }

    #[test]
    fn test_from_pem_file_is_stable() {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let pem = signing_key.to_pkcs8_pem(LineEnding::LF).unwrap();

        let dir = std::env::temp_dir().join(format!("cognito-local-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("key.pem");
        std::fs::write(&path, pem.as_bytes()).unwrap();

        let first = SigningKeys::from_pem_file(&path).unwrap();
        let second = SigningKeys::from_pem_file(&path).unwrap();
        assert_eq!(first.kid(), second.kid());

        let token = first.sign(&claims("bob")).unwrap();
        assert!(second.verify::<Value>(&token, &validation()).is_ok());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_from_pem_file_rejects_garbage() {
        let dir = std::env::temp_dir().join(format!("cognito-local-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("key.pem");
        std::fs::write(&path, "not a key").unwrap();

        assert!(SigningKeys::from_pem_file(&path).is_err());
        assert!(SigningKeys::from_pem_file(dir.join("missing.pem")).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
