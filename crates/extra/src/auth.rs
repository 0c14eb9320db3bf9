//! Authentication interceptor with pluggable strategies.
//!
//! Strategies inspect the envelope metadata for credentials and produce an
//! [`AuthInfo`] the rest of the pipeline reads from the context. Streaming
//! transports that cannot set headers fold query parameters into the
//! metadata, so the stock strategies also look at the query-derived slots
//! (`access_token`, `api_key`).
//!
//! # Example
//!
//! ```
//! use raffel_extra::auth::{Auth, BearerAuth};
//! use raffel_core::AuthInfo;
//!
//! let auth = Auth::new()
//!     .strategy(BearerAuth::new(|token| async move {
//!         if token == "sesame" {
//!             Ok(Some(AuthInfo::principal("ali-baba")))
//!         } else {
//!             Ok(None)
//!         }
//!     }))
//!     .public("health.*");
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::future::BoxFuture;
use raffel_core::hooks::pattern_matches;
use raffel_core::metadata_keys;
use raffel_core::{AuthInfo, Context, Envelope, ErrorKind, Interceptor, Next, Reply, RpcError};

/// Metadata slot adapters fill from the `access_token` query parameter.
pub const QUERY_TOKEN_KEY: &str = "access_token";
/// Metadata slot adapters fill from the `api_key` query parameter.
pub const QUERY_API_KEY: &str = "api_key";

/// One way of turning credentials into an identity.
#[async_trait]
pub trait AuthStrategy: Send + Sync + 'static {
    /// Inspect the envelope; `Ok(None)` means "no credentials for me",
    /// letting the next strategy try. Errors reject the request outright.
    async fn authenticate(
        &self,
        envelope: &Envelope,
        ctx: &Context,
    ) -> Result<Option<AuthInfo>, RpcError>;
}

type ValidateTokenFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Option<AuthInfo>, RpcError>> + Send + Sync>;

/// Bearer-token strategy: `authorization: Bearer <token>` or the
/// `access_token` query slot.
#[derive(Clone)]
pub struct BearerAuth {
    validate: ValidateTokenFn,
}

impl BearerAuth {
    /// Validate tokens with `f`.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<AuthInfo>, RpcError>> + Send + 'static,
    {
        Self {
            validate: Arc::new(move |token| Box::pin(f(token))),
        }
    }
}

impl std::fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerAuth")
    }
}

#[async_trait]
impl AuthStrategy for BearerAuth {
    async fn authenticate(
        &self,
        envelope: &Envelope,
        _ctx: &Context,
    ) -> Result<Option<AuthInfo>, RpcError> {
        let token = envelope
            .metadata
            .get(metadata_keys::AUTHORIZATION)
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_owned)
            .or_else(|| envelope.metadata.get(QUERY_TOKEN_KEY).cloned());
        match token {
            Some(token) => (self.validate)(token).await,
            None => Ok(None),
        }
    }
}

/// API-key strategy: `x-api-key` metadata or the `api_key` query slot.
#[derive(Clone)]
pub struct ApiKeyAuth {
    validate: ValidateTokenFn,
}

impl ApiKeyAuth {
    /// Validate keys with `f`.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<AuthInfo>, RpcError>> + Send + 'static,
    {
        Self {
            validate: Arc::new(move |key| Box::pin(f(key))),
        }
    }
}

impl std::fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKeyAuth")
    }
}

#[async_trait]
impl AuthStrategy for ApiKeyAuth {
    async fn authenticate(
        &self,
        envelope: &Envelope,
        _ctx: &Context,
    ) -> Result<Option<AuthInfo>, RpcError> {
        let key = envelope
            .metadata
            .get(metadata_keys::API_KEY)
            .or_else(|| envelope.metadata.get(QUERY_API_KEY))
            .cloned();
        match key {
            Some(key) => (self.validate)(key).await,
            None => Ok(None),
        }
    }
}

type ValidateBasicFn = Arc<
    dyn Fn(String, String) -> BoxFuture<'static, Result<Option<AuthInfo>, RpcError>> + Send + Sync,
>;

/// HTTP basic-credentials strategy: `authorization: Basic <base64>`.
#[derive(Clone)]
pub struct BasicAuth {
    validate: ValidateBasicFn,
}

impl BasicAuth {
    /// Validate username/password pairs with `f`.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<AuthInfo>, RpcError>> + Send + 'static,
    {
        Self {
            validate: Arc::new(move |user, pass| Box::pin(f(user, pass))),
        }
    }

    fn parse(header: &str) -> Option<(String, String)> {
        let encoded = header.strip_prefix("Basic ")?;
        let decoded = BASE64.decode(encoded).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_owned(), pass.to_owned()))
    }
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BasicAuth")
    }
}

#[async_trait]
impl AuthStrategy for BasicAuth {
    async fn authenticate(
        &self,
        envelope: &Envelope,
        _ctx: &Context,
    ) -> Result<Option<AuthInfo>, RpcError> {
        let credentials = envelope
            .metadata
            .get(metadata_keys::AUTHORIZATION)
            .and_then(|v| Self::parse(v));
        match credentials {
            Some((user, pass)) => (self.validate)(user, pass).await,
            None => Ok(None),
        }
    }
}

/// The interceptor: tries strategies in order, attaches the first identity.
///
/// Procedures matching a `public` pattern bypass authentication entirely.
/// When no strategy produces an identity the request fails with
/// `UNAUTHENTICATED`.
pub struct Auth {
    strategies: Vec<Box<dyn AuthStrategy>>,
    public: Vec<String>,
}

impl Default for Auth {
    fn default() -> Self {
        Self::new()
    }
}

impl Auth {
    /// An interceptor with no strategies (everything non-public rejected).
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            public: Vec::new(),
        }
    }

    /// Append a strategy; earlier strategies win.
    #[must_use]
    pub fn strategy(mut self, strategy: impl AuthStrategy) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Let procedures matching the pattern through without credentials.
    #[must_use]
    pub fn public(mut self, pattern: impl Into<String>) -> Self {
        self.public.push(pattern.into());
        self
    }

    fn is_public(&self, procedure: &str) -> bool {
        self.public.iter().any(|p| pattern_matches(p, procedure))
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("strategies", &self.strategies.len())
            .field("public", &self.public)
            .finish()
    }
}

#[async_trait]
impl Interceptor for Auth {
    async fn handle(
        &self,
        envelope: &mut Envelope,
        ctx: &Context,
        next: Next<'_>,
    ) -> Result<Reply, RpcError> {
        if self.is_public(&envelope.procedure) {
            return next.run(envelope, ctx).await;
        }
        for strategy in &self.strategies {
            if let Some(auth) = strategy.authenticate(envelope, ctx).await? {
                ctx.set_auth(auth);
                return next.run(envelope, ctx).await;
            }
        }
        Err(RpcError::new(
            ErrorKind::Unauthenticated,
            "no usable credentials",
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use raffel_core::{Envelope, EnvelopeKind, HandlerDef, Outcome, Registry, Router};
    use serde_json::Value;

    use super::*;

    fn router(auth: Auth) -> Router {
        let mut registry = Registry::new();
        registry
            .register(HandlerDef::procedure("whoami", |_payload, ctx| async move {
                Ok(Value::String(
                    ctx.auth().and_then(|a| a.principal).unwrap_or_default(),
                ))
            }))
            .unwrap();
        registry
            .register(HandlerDef::procedure("health.ping", |_payload, _ctx| async move {
                Ok(Value::Bool(true))
            }))
            .unwrap();
        Router::new(Arc::new(registry)).use_interceptor(auth)
    }

    fn bearer() -> BearerAuth {
        BearerAuth::new(|token| async move {
            if token == "sesame" {
                Ok(Some(AuthInfo::principal("ali-baba")))
            } else {
                Err(RpcError::new(ErrorKind::Unauthenticated, "bad token"))
            }
        })
    }

    async fn unary(router: &Router, envelope: Envelope) -> Envelope {
        match router.handle(envelope, Context::background()).await {
            Outcome::Unary(response) => response,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bearer_attaches_principal() {
        let router = router(Auth::new().strategy(bearer()));
        let envelope = Envelope::request("1", "whoami", Value::Null)
            .with_metadata(metadata_keys::AUTHORIZATION, "Bearer sesame");
        let response = unary(&router, envelope).await;
        assert_eq!(response.payload, "ali-baba");
    }

    #[tokio::test]
    async fn test_query_token_fallback() {
        let router = router(Auth::new().strategy(bearer()));
        let envelope =
            Envelope::request("1", "whoami", Value::Null).with_metadata(QUERY_TOKEN_KEY, "sesame");
        let response = unary(&router, envelope).await;
        assert_eq!(response.payload, "ali-baba");
    }

    #[tokio::test]
    async fn test_missing_credentials_rejected() {
        let router = router(Auth::new().strategy(bearer()));
        let response = unary(&router, Envelope::request("1", "whoami", Value::Null)).await;
        assert_eq!(response.kind, EnvelopeKind::Error);
        assert_eq!(response.error().unwrap().kind, ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn test_bad_token_rejected() {
        let router = router(Auth::new().strategy(bearer()));
        let envelope = Envelope::request("1", "whoami", Value::Null)
            .with_metadata(metadata_keys::AUTHORIZATION, "Bearer wrong");
        let response = unary(&router, envelope).await;
        assert_eq!(response.error().unwrap().kind, ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn test_public_bypass() {
        let router = router(Auth::new().strategy(bearer()).public("health.*"));
        let response = unary(&router, Envelope::request("1", "health.ping", Value::Null)).await;
        assert_eq!(response.kind, EnvelopeKind::Response);
    }

    #[tokio::test]
    async fn test_api_key_strategy() {
        let auth = Auth::new().strategy(ApiKeyAuth::new(|key| async move {
            Ok((key == "k1").then(|| AuthInfo::principal("svc")))
        }));
        let router = router(auth);
        let envelope = Envelope::request("1", "whoami", Value::Null)
            .with_metadata(metadata_keys::API_KEY, "k1");
        let response = unary(&router, envelope).await;
        assert_eq!(response.payload, "svc");
    }

    #[tokio::test]
    async fn test_basic_strategy() {
        let auth = Auth::new().strategy(BasicAuth::new(|user, pass| async move {
            Ok((user == "root" && pass == "pwd").then(|| AuthInfo::principal("root")))
        }));
        let router = router(auth);
        let header = format!("Basic {}", BASE64.encode("root:pwd"));
        let envelope = Envelope::request("1", "whoami", Value::Null)
            .with_metadata(metadata_keys::AUTHORIZATION, header);
        let response = unary(&router, envelope).await;
        assert_eq!(response.payload, "root");
    }
}
