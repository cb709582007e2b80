//! # Tether
//!
//! Nonce-based rendezvous broker that pairs a browser frontend with a
//! remote agent.
//!
//! A creator asks for a session over `/rendezvous` and gets a ticket: a
//! nonce, a challenge, and a join address for each peer. The agent joins,
//! answers the challenge through your [`CredentialCapability`], and from
//! then on the broker relays frames between the two peers, with
//! `encrypt`/`decrypt` requests transformed on the way through.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::prelude::*;
//!
//! // Implement CredentialCapability for your identity backend, then:
//! // let server = TetherServerBuilder::new()
//! //     .config(&BrokerConfig::from_env()?)
//! //     .build(MyCredentials)
//! //     .await?;
//! // server.run().await
//! ```

mod config;
mod error;
mod handler;
mod route;
mod server;

pub use config::{BrokerConfig, ConfigError};
pub use error::TetherError;
pub use route::Route;
pub use server::{TetherServer, TetherServerBuilder};

/// Everything needed to run a broker and write a credential capability.
pub mod prelude {
    pub use crate::{BrokerConfig, ConfigError, TetherError, TetherServer, TetherServerBuilder};
    pub use tether_protocol::{CorrelationId, Envelope, MessageKind, Role, SessionTicket};
    pub use tether_relay::{Broker, Dispatch, RelayError};
    pub use tether_session::{
        ChallengeToken, CloseReason, CredentialCapability, CredentialError,
        KeyRef, Nonce, SessionConfig, SessionError, SessionState,
        TransformOp,
    };
}
