use rand::Rng;
use tether::prelude::*;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Development credentials
// ---------------------------------------------------------------------------

/// Credentials for local development only. Nothing here is secret:
///
/// - the challenge is random hex bound to the callback address
/// - the agent proves itself by answering `signed:<challenge>`
/// - "encryption" is hex encoding
#[derive(Default)]
struct DevCredentials;

impl CredentialCapability for DevCredentials {
    async fn issue_challenge(&self, callback: &str) -> Result<ChallengeToken, CredentialError> {
        let salt: [u8; 16] = rand::rng().random();
        Ok(ChallengeToken::new(format!("{}@{callback}", hex::encode(salt))))
    }

    async fn validate_response(
        &self,
        response: &str,
        challenge: &ChallengeToken,
    ) -> Result<KeyRef, CredentialError> {
        match response.strip_prefix("signed:") {
            Some(signed) if signed == challenge.as_str() => Ok(KeyRef::new("dev-agent")),
            _ => Err(CredentialError::Rejected("expected signed:<challenge>".into())),
        }
    }

    async fn transform(
        &self,
        op: TransformOp,
        payload: &str,
        _key: &KeyRef,
    ) -> Result<String, CredentialError> {
        match op {
            TransformOp::Encrypt => Ok(hex::encode(payload)),
            TransformOp::Decrypt => hex::decode(payload)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or_else(|| {
                    CredentialError::Rejected("payload is not hex-encoded UTF-8".into())
                }),
        }
    }
}

// ---------------------------------------------------------------------------
// Server bootstrap
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = BrokerConfig::from_env()?;
    tracing::info!(bind = %config.bind, public_url = %config.public_url, "starting dev broker");

    let server = TetherServerBuilder::new()
        .config(&config)
        .build(DevCredentials)
        .await?;

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
