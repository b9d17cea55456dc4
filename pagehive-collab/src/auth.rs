//! Connection authentication.
//!
//! A connection presents a signed token during the WebSocket upgrade (query
//! `?token=` or `Authorization: Bearer`). The token is verified against the
//! shared HS256 secret and the identity it names is looked up once; the
//! result is bound to the connection for its whole lifetime.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::handshake::server::Request;

use crate::protocol::{Identity, IdentityId};
use crate::storage::IdentityStore;

/// Connection rejection reasons. Each maps to a distinct wire reason and
/// close code so clients can tell them apart.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("identity not found: {0}")]
    IdentityNotFound(IdentityId),
}

impl AuthError {
    /// Reason string sent in the `connect-error` frame.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::AuthenticationRequired => "authentication-required",
            Self::InvalidCredential(_) => "invalid-credential",
            Self::IdentityNotFound(_) => "identity-not-found",
        }
    }

    /// WebSocket close code (private-use range).
    pub fn close_code(&self) -> u16 {
        match self {
            Self::AuthenticationRequired => 4401,
            Self::InvalidCredential(_) => 4403,
            Self::IdentityNotFound(_) => 4404,
        }
    }
}

/// JWT claims. `userId` is accepted for tokens minted by the legacy API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "userId")]
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
}

/// Verifies (and, for the HTTP layer, issues) HS256 tokens.
#[derive(Clone)]
pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify a token and return the identity id it names.
    pub fn verify(&self, token: &str) -> Result<IdentityId, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            let detail = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired".to_string(),
                ErrorKind::InvalidSignature => "signature mismatch".to_string(),
                _ => e.to_string(),
            };
            AuthError::InvalidCredential(detail)
        })?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::InvalidCredential("empty subject".into()));
        }
        Ok(IdentityId::new(data.claims.sub))
    }

    /// Mint a token for `identity` valid for `ttl`.
    pub fn issue(&self, identity: &IdentityId, ttl: Duration) -> Result<String, AuthError> {
        let now = unix_now();
        self.issue_with_expiry(identity, now, now + ttl.as_secs())
    }

    /// Mint a token with explicit timestamps (seconds since epoch).
    pub fn issue_with_expiry(
        &self,
        identity: &IdentityId,
        iat: u64,
        exp: u64,
    ) -> Result<String, AuthError> {
        let claims = Claims {
            sub: identity.as_str().to_string(),
            exp,
            iat,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidCredential(e.to_string()))
    }
}

/// Resolves a connection credential to an identity.
pub struct Authenticator {
    verifier: JwtVerifier,
    identities: Arc<dyn IdentityStore>,
}

impl Authenticator {
    pub fn new(verifier: JwtVerifier, identities: Arc<dyn IdentityStore>) -> Self {
        Self { verifier, identities }
    }

    pub fn verifier(&self) -> &JwtVerifier {
        &self.verifier
    }

    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let token = match token.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(AuthError::AuthenticationRequired),
        };
        let id = self.verifier.verify(token)?;
        match self.identities.lookup_identity(&id).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => Err(AuthError::IdentityNotFound(id)),
            Err(e) => {
                log::error!("Identity lookup for {id} failed: {e}");
                Err(AuthError::InvalidCredential("identity lookup failed".into()))
            }
        }
    }
}

/// Pull the credential from an upgrade request: `?token=` first, then
/// `Authorization: Bearer`.
pub fn credential_from_request(request: &Request) -> Option<String> {
    let from_query = request.uri().query().and_then(|q| {
        q.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == "token" && !value.is_empty()).then(|| value.to_string())
        })
    });
    from_query.or_else(|| {
        request
            .headers()
            .get("authorization")
            .and_then(|h| h.to_str().ok())
            .and_then(bearer_token)
    })
}

/// The auth scheme name is case-insensitive.
fn bearer_token(header: &str) -> Option<String> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
