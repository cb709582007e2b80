//! The credential capability: the broker's only window into identity.
//!
//! Tether doesn't define a token format, validate signatures, or hold keys.
//! Whatever does (an identity SDK, an HSM, a remote signing service)
//! implements [`CredentialCapability`], and the broker calls it at three
//! points:
//!
//! 1. session creation → [`issue_challenge`](CredentialCapability::issue_challenge)
//! 2. agent authentication → [`validate_response`](CredentialCapability::validate_response)
//! 3. correlated relay → [`transform`](CredentialCapability::transform)
//!
//! Each call is a suspension point. The broker never holds a session lock
//! across one.

use std::fmt;
use std::future::Future;

use crate::SessionError;

/// Opaque authentication challenge issued at session creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeToken(String);

impl ChallengeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Reference to the key material a successful validation bound to the
/// session (typically the agent's public key or DID). Transforms are keyed
/// by it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRef(String);

impl KeyRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The out-of-band operation applied to a correlated request's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOp {
    Encrypt,
    Decrypt,
}

/// What a capability can report back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// The input was understood and refused (bad signature, wrong
    /// challenge, expired token). Counts against the agent's attempts.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The capability itself failed or could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<CredentialError> for SessionError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Rejected(reason) => {
                SessionError::InvalidToken(reason)
            }
            CredentialError::Unavailable(reason) => {
                SessionError::Capability(reason)
            }
        }
    }
}

/// Issues challenges, validates responses, and transforms payloads.
///
/// `Send + Sync + 'static` because one instance is shared by every
/// connection task for the lifetime of the broker.
///
/// # Example
///
/// ```rust
/// use tether_session::{
///     ChallengeToken, CredentialCapability, CredentialError, KeyRef,
///     TransformOp,
/// };
///
/// /// Accepts a response that echoes the challenge. Tests only.
/// struct EchoCredentials;
///
/// impl CredentialCapability for EchoCredentials {
///     async fn issue_challenge(
///         &self,
///         callback: &str,
///     ) -> Result<ChallengeToken, CredentialError> {
///         Ok(ChallengeToken::new(format!("challenge-for:{callback}")))
///     }
///
///     async fn validate_response(
///         &self,
///         response: &str,
///         challenge: &ChallengeToken,
///     ) -> Result<KeyRef, CredentialError> {
///         if response == challenge.as_str() {
///             Ok(KeyRef::new("echo-key"))
///         } else {
///             Err(CredentialError::Rejected("mismatch".into()))
///         }
///     }
///
///     async fn transform(
///         &self,
///         _op: TransformOp,
///         payload: &str,
///         _key: &KeyRef,
///     ) -> Result<String, CredentialError> {
///         Ok(payload.to_string())
///     }
/// }
/// ```
pub trait CredentialCapability: Send + Sync + 'static {
    /// Issues a challenge bound to `callback`, the address the agent will
    /// answer on. The address encodes the session's nonce.
    fn issue_challenge(
        &self,
        callback: &str,
    ) -> impl Future<Output = Result<ChallengeToken, CredentialError>> + Send;

    /// Checks the agent's `response` against the session's `challenge`.
    /// On success returns the key the session's transforms will use.
    fn validate_response(
        &self,
        response: &str,
        challenge: &ChallengeToken,
    ) -> impl Future<Output = Result<KeyRef, CredentialError>> + Send;

    /// Encrypts or decrypts `payload` with `key`.
    fn transform(
        &self,
        op: TransformOp,
        payload: &str,
        key: &KeyRef,
    ) -> impl Future<Output = Result<String, CredentialError>> + Send;
}
