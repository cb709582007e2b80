//! Shared test doubles for this crate's unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{ChallengeToken, CredentialCapability, CredentialError, KeyRef, TransformOp};

/// Issues `challenge:<callback>` and accepts exactly `signed:<challenge>`.
#[derive(Debug, Default)]
pub(crate) struct MockCredentials {
    fail_issuance: bool,
    unavailable: bool,
    pub(crate) validations: AtomicUsize,
}

impl MockCredentials {
    pub(crate) fn failing_issuance() -> Self {
        Self {
            fail_issuance: true,
            ..Self::default()
        }
    }

    pub(crate) fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub(crate) fn sign(challenge: &ChallengeToken) -> String {
        format!("signed:{}", challenge.as_str())
    }

    pub(crate) fn validation_count(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }
}

impl CredentialCapability for MockCredentials {
    async fn issue_challenge(&self, callback: &str) -> Result<ChallengeToken, CredentialError> {
        if self.fail_issuance {
            return Err(CredentialError::Unavailable("issuer offline".into()));
        }
        Ok(ChallengeToken::new(format!("challenge:{callback}")))
    }

    async fn validate_response(
        &self,
        response: &str,
        challenge: &ChallengeToken,
    ) -> Result<KeyRef, CredentialError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(CredentialError::Unavailable("validator offline".into()));
        }
        if response == Self::sign(challenge) {
            Ok(KeyRef::new("agent-key"))
        } else {
            Err(CredentialError::Rejected("signature mismatch".into()))
        }
    }

    async fn transform(
        &self,
        op: TransformOp,
        payload: &str,
        key: &KeyRef,
    ) -> Result<String, CredentialError> {
        Ok(format!("{op:?}[{key}]({payload})"))
    }
}
