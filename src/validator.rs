use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::remote::KeyCache;
use crate::Error;

/// Claims with a registered meaning; everything else is a private claim.
const REGISTERED_CLAIMS: [&str; 7] = ["iss", "sub", "aud", "exp", "nbf", "iat", "jti"];

/// The private claims of a verified token.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ValidatedClaims(Map<String, Value>);

impl ValidatedClaims {
    fn from_claims(mut claims: Map<String, Value>) -> Self {
        for claim in REGISTERED_CLAIMS {
            claims.remove(claim);
        }
        Self(claims)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Borrows the claims as a JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// The claims serialized as a JSON object.
    pub fn to_bytes(&self) -> Vec<u8> {
        Value::Object(self.0.clone()).to_string().into_bytes()
    }
}

/// Verifies tokens against the keys of a [`KeyCache`].
pub struct TokenValidator {
    keys: Arc<KeyCache>,
    issuer: Option<String>,
    audience: Option<String>,
}

impl TokenValidator {
    /// Empty `issuer` or `audience` values disable the corresponding check.
    pub fn new(keys: Arc<KeyCache>, issuer: Option<String>, audience: Option<String>) -> Self {
        Self {
            keys,
            issuer: issuer.filter(|issuer| !issuer.is_empty()),
            audience: audience.filter(|audience| !audience.is_empty()),
        }
    }

    /// Verifies `token` and returns its private claims.
    ///
    /// # Errors
    ///
    /// - [`Error::KeyFetchFailed`] if the key set is due for a refresh and the refresh fails.
    ///   The previous key set is not used as a fallback.
    /// - [`Error::Malformed`] if the token cannot be parsed.
    /// - [`Error::KeyNotFound`] or [`Error::SignatureInvalid`] if no key verifies the signature.
    /// - [`Error::ClaimMismatch`] if expiry, not-before, issuer or audience validation fails.
    pub async fn validate(&self, token: &str) -> Result<ValidatedClaims, Error> {
        self.keys.ensure_fresh().await?;

        let header = parse_unverified(token)?;
        let validation = self.validation(header.alg);
        let key_set = self.keys.current_snapshot();

        let mut last_error = None;
        for key in key_set.candidates(header.kid.as_deref()) {
            match jsonwebtoken::decode::<Map<String, Value>>(
                token,
                key.decoding_key(),
                &validation,
            ) {
                Ok(token_data) => return Ok(ValidatedClaims::from_claims(token_data.claims)),
                Err(err) => match classify(err) {
                    // Wrong key, try the next one
                    Error::SignatureInvalid(err) => last_error = Some(err),
                    // The signature verified, the claims did not
                    err => return Err(err),
                },
            }
        }

        match last_error {
            Some(err) => Err(Error::SignatureInvalid(err)),
            None => Err(Error::KeyNotFound(header.kid)),
        }
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.leeway = 0;
        validation.validate_exp = true;
        // Rejects `exp == now`: a token is only valid strictly before its expiry.
        validation.reject_tokens_expiring_in_less_than = 1;
        validation.validate_nbf = true;

        match &self.issuer {
            Some(issuer) => {
                validation.set_issuer(&[issuer]);
                validation.required_spec_claims.insert("iss".to_string());
            }
            None => validation.iss = None,
        }

        match &self.audience {
            Some(audience) => {
                validation.set_audience(&[audience]);
                validation.required_spec_claims.insert("aud".to_string());
            }
            None => validation.validate_aud = false,
        }

        validation
    }
}

/// Parses the envelope without verifying it, so that garbage is reported as malformed
/// whatever keys are loaded.
fn parse_unverified(token: &str) -> Result<Header, Error> {
    let mut envelope = Validation::default();
    envelope.insecure_disable_signature_validation();
    envelope.validate_exp = false;
    envelope.validate_nbf = false;
    envelope.validate_aud = false;
    envelope.required_spec_claims.clear();

    jsonwebtoken::decode::<Map<String, Value>>(token, &DecodingKey::from_secret(&[]), &envelope)
        .map(|token_data| token_data.header)
        .map_err(Error::Malformed)
}

/// Sorts a `jsonwebtoken` failure into the error kinds reported to the host.
fn classify(err: jsonwebtoken::errors::Error) -> Error {
    match err.kind() {
        JwtErrorKind::InvalidToken
        | JwtErrorKind::Base64(_)
        | JwtErrorKind::Json(_)
        | JwtErrorKind::Utf8(_) => Error::Malformed(err),
        JwtErrorKind::ExpiredSignature
        | JwtErrorKind::ImmatureSignature
        | JwtErrorKind::InvalidIssuer
        | JwtErrorKind::InvalidAudience
        | JwtErrorKind::InvalidSubject
        | JwtErrorKind::MissingRequiredClaim(_) => Error::ClaimMismatch(err),
        _ => Error::SignatureInvalid(err),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    use super::*;
    use crate::remote::tests::{oct_jwks, MockFetcher};
    use crate::ErrorKind;

    const SECRET: &[u8] = b"gateway-jwt-auth-test-secret-0123456789abcdefghi";
    const SECRET_B64: &str = "Z2F0ZXdheS1qd3QtYXV0aC10ZXN0LXNlY3JldC0wMTIzNDU2Nzg5YWJjZGVmZ2hp";
    const KID: &str = "test-key";
    const ISSUER: &str = "https://issuer.example.com";
    const AUDIENCE: &str = "my-api";

    fn sign(kid: Option<&str>, claims: &Value, secret: &[u8]) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = kid.map(str::to_owned);
        jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    fn claims() -> Value {
        json!({
            "iss": ISSUER,
            "aud": AUDIENCE,
            "sub": "user-1",
            "iat": Utc::now().timestamp(),
            "exp": Utc::now().timestamp() + 3600,
            "role": "admin",
            "tenant": {"id": 42},
        })
    }

    async fn validator(issuer: Option<&str>, audience: Option<&str>) -> TokenValidator {
        let fetcher = MockFetcher::new(oct_jwks(KID, SECRET_B64));
        let keys = KeyCache::new(fetcher, Duration::from_secs(60)).await.unwrap();
        TokenValidator::new(
            Arc::new(keys),
            issuer.map(str::to_owned),
            audience.map(str::to_owned),
        )
    }

    async fn kind_of(validator: &TokenValidator, token: &str) -> ErrorKind {
        validator.validate(token).await.unwrap_err().kind()
    }

    #[tokio::test]
    async fn test_valid_token_yields_private_claims() {
        let validator = validator(Some(ISSUER), Some(AUDIENCE)).await;
        let token = sign(Some(KID), &claims(), SECRET);

        let validated = validator.validate(&token).await.unwrap();

        let expected = json!({"role": "admin", "tenant": {"id": 42}});
        assert_eq!(Value::Object(validated.clone().into_map()), expected);
        assert_eq!(validated.get("role"), Some(&json!("admin")));
        assert!(validated.get("exp").is_none());
        assert!(validated.get("iss").is_none());
    }

    #[tokio::test]
    async fn test_to_bytes() {
        let validator = validator(None, None).await;
        let token = sign(Some(KID), &claims(), SECRET);

        let bytes = validator.validate(&token).await.unwrap().to_bytes();

        let payload: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload, json!({"role": "admin", "tenant": {"id": 42}}));
    }

    #[tokio::test]
    async fn test_token_without_kid_tries_all_keys() {
        let validator = validator(Some(ISSUER), Some(AUDIENCE)).await;
        let token = sign(None, &claims(), SECRET);

        assert!(validator.validate(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_token() {
        let validator = validator(None, None).await;

        assert_eq!(kind_of(&validator, "not-a-jwt").await, ErrorKind::Malformed);
        assert_eq!(kind_of(&validator, "").await, ErrorKind::Malformed);
        assert_eq!(kind_of(&validator, "a.b.c").await, ErrorKind::Malformed);
    }

    #[tokio::test]
    async fn test_garbage_payload_is_malformed() {
        let validator = validator(None, None).await;
        let token = sign(Some(KID), &claims(), SECRET);
        let parts: Vec<&str> = token.split('.').collect();

        let not_base64 = format!("{}.@@@not-base64@@@.{}", parts[0], parts[2]);
        assert_eq!(kind_of(&validator, &not_base64).await, ErrorKind::Malformed);

        // "not-json"
        let not_json = format!("{}.bm90LWpzb24.{}", parts[0], parts[2]);
        assert_eq!(kind_of(&validator, &not_json).await, ErrorKind::Malformed);

        // A JSON array is not a claims object
        let not_object = format!("{}.WzEsMl0.{}", parts[0], parts[2]);
        assert_eq!(kind_of(&validator, &not_object).await, ErrorKind::Malformed);
    }

    #[tokio::test]
    async fn test_garbage_payload_with_unknown_kid_is_malformed() {
        let validator = validator(None, None).await;
        let token = sign(Some("unknown-key"), &claims(), SECRET);
        let parts: Vec<&str> = token.split('.').collect();

        let garbage = format!("{}.bm90LWpzb24.{}", parts[0], parts[2]);
        let err = validator.validate(&garbage).await.unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{err}");
    }

    #[tokio::test]
    async fn test_wrong_signature() {
        let validator = validator(Some(ISSUER), Some(AUDIENCE)).await;
        let secret: [u8; 32] = rand::random();
        let token = sign(Some(KID), &claims(), &secret);

        assert_eq!(
            kind_of(&validator, &token).await,
            ErrorKind::SignatureInvalid
        );
    }

    #[tokio::test]
    async fn test_tampered_payload() {
        let validator = validator(None, None).await;
        let token = sign(Some(KID), &claims(), SECRET);
        let other = sign(
            Some(KID),
            &json!({"exp": Utc::now().timestamp() + 3600, "role": "root"}),
            b"some-other-secret",
        );

        let mut parts: Vec<&str> = token.split('.').collect();
        let other_parts: Vec<&str> = other.split('.').collect();
        parts[1] = other_parts[1];
        let tampered = parts.join(".");

        assert_eq!(
            kind_of(&validator, &tampered).await,
            ErrorKind::SignatureInvalid
        );
    }

    #[tokio::test]
    async fn test_unknown_kid() {
        let validator = validator(None, None).await;
        let token = sign(Some("unknown-key"), &claims(), SECRET);

        let err = validator.validate(&token).await.unwrap_err();
        assert!(matches!(err, Error::KeyNotFound(Some(ref kid)) if kid == "unknown-key"));
        assert_eq!(err.kind(), ErrorKind::SignatureInvalid);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let validator = validator(Some(ISSUER), Some(AUDIENCE)).await;
        let mut claims = claims();
        claims["exp"] = json!(Utc::now().timestamp() - 10);
        let token = sign(Some(KID), &claims, SECRET);

        assert_eq!(kind_of(&validator, &token).await, ErrorKind::ClaimMismatch);
    }

    #[tokio::test]
    async fn test_token_expiring_now_is_rejected() {
        let validator = validator(None, None).await;
        let token = sign(
            Some(KID),
            &json!({"exp": Utc::now().timestamp(), "role": "x"}),
            SECRET,
        );

        let err = validator.validate(&token).await.unwrap_err();
        assert!(matches!(err, Error::ClaimMismatch(_)), "{err}");
    }

    #[tokio::test]
    async fn test_missing_expiry() {
        let validator = validator(None, None).await;
        let token = sign(Some(KID), &json!({"role": "admin"}), SECRET);

        assert_eq!(kind_of(&validator, &token).await, ErrorKind::ClaimMismatch);
    }

    #[tokio::test]
    async fn test_not_yet_valid_token() {
        let validator = validator(None, None).await;
        let mut claims = claims();
        claims["nbf"] = json!(Utc::now().timestamp() + 600);
        let token = sign(Some(KID), &claims, SECRET);

        assert_eq!(kind_of(&validator, &token).await, ErrorKind::ClaimMismatch);
    }

    #[tokio::test]
    async fn test_issuer_mismatch() {
        let validator = validator(Some(ISSUER), Some(AUDIENCE)).await;
        let mut claims = claims();
        claims["iss"] = json!("https://evil.example.com");
        let token = sign(Some(KID), &claims, SECRET);

        assert_eq!(kind_of(&validator, &token).await, ErrorKind::ClaimMismatch);
    }

    #[tokio::test]
    async fn test_missing_issuer_when_configured() {
        let validator = validator(Some(ISSUER), None).await;
        let mut claims = claims();
        claims.as_object_mut().unwrap().remove("iss");
        let token = sign(Some(KID), &claims, SECRET);

        assert_eq!(kind_of(&validator, &token).await, ErrorKind::ClaimMismatch);
    }

    #[tokio::test]
    async fn test_audience_mismatch() {
        let validator = validator(Some(ISSUER), Some(AUDIENCE)).await;
        let mut claims = claims();
        claims["aud"] = json!("other-api");
        let token = sign(Some(KID), &claims, SECRET);

        assert_eq!(kind_of(&validator, &token).await, ErrorKind::ClaimMismatch);
    }

    #[tokio::test]
    async fn test_audience_array() {
        let validator = validator(None, Some(AUDIENCE)).await;
        let mut claims = claims();
        claims["aud"] = json!(["other-api", AUDIENCE]);
        let token = sign(Some(KID), &claims, SECRET);

        assert!(validator.validate(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_unconfigured_checks_are_skipped() {
        let validator = validator(None, None).await;
        let mut claims = claims();
        claims["iss"] = json!("anyone");
        claims["aud"] = json!("anything");
        let token = sign(Some(KID), &claims, SECRET);

        assert!(validator.validate(&token).await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_configuration_values_skip_checks() {
        let validator = validator(Some(""), Some("")).await;
        let mut claims = claims();
        claims["iss"] = json!("anyone");
        claims["aud"] = json!("anything");
        let token = sign(Some(KID), &claims, SECRET);

        assert!(validator.validate(&token).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_rejects_without_fallback() {
        let fetcher = MockFetcher::sequence(vec![Some(oct_jwks(KID, SECRET_B64)), None]);
        let calls = fetcher.calls();
        let keys = Arc::new(KeyCache::new(fetcher, Duration::from_secs(60)).await.unwrap());
        let validator = TokenValidator::new(keys, None, None);
        let token = sign(Some(KID), &claims(), SECRET);

        assert!(validator.validate(&token).await.is_ok());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(kind_of(&validator, &token).await, ErrorKind::KeyFetchFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotated_key_is_picked_up() {
        const ROTATED_SECRET: &[u8] = b"gateway-jwt-auth-rotated-secret-9876543210zyxwvu";
        const ROTATED_SECRET_B64: &str =
            "Z2F0ZXdheS1qd3QtYXV0aC1yb3RhdGVkLXNlY3JldC05ODc2NTQzMjEwenl4d3Z1";

        let fetcher = MockFetcher::sequence(vec![
            Some(oct_jwks(KID, SECRET_B64)),
            Some(oct_jwks("rotated", ROTATED_SECRET_B64)),
        ]);
        let keys = Arc::new(KeyCache::new(fetcher, Duration::from_secs(60)).await.unwrap());
        let validator = TokenValidator::new(keys, None, None);
        let token = sign(Some("rotated"), &claims(), ROTATED_SECRET);

        assert_eq!(
            kind_of(&validator, &token).await,
            ErrorKind::SignatureInvalid
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(validator.validate(&token).await.is_ok());
    }

    #[test]
    fn test_classify() {
        let kind = |err: JwtErrorKind| classify(err.into()).kind();

        assert_eq!(kind(JwtErrorKind::InvalidToken), ErrorKind::Malformed);
        assert_eq!(kind(JwtErrorKind::ExpiredSignature), ErrorKind::ClaimMismatch);
        assert_eq!(kind(JwtErrorKind::ImmatureSignature), ErrorKind::ClaimMismatch);
        assert_eq!(kind(JwtErrorKind::InvalidIssuer), ErrorKind::ClaimMismatch);
        assert_eq!(kind(JwtErrorKind::InvalidAudience), ErrorKind::ClaimMismatch);
        assert_eq!(
            kind(JwtErrorKind::MissingRequiredClaim("exp".to_string())),
            ErrorKind::ClaimMismatch
        );
        assert_eq!(kind(JwtErrorKind::InvalidSignature), ErrorKind::SignatureInvalid);
        assert_eq!(kind(JwtErrorKind::InvalidAlgorithm), ErrorKind::SignatureInvalid);
        assert_eq!(kind(JwtErrorKind::InvalidKeyFormat), ErrorKind::SignatureInvalid);
    }
}
