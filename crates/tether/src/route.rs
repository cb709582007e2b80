//! Upgrade-path routing.
//!
//! ```text
//! /rendezvous        → create a session, send its ticket, close
//! /frontend/{nonce}  → join as the frontend
//! /agent/{nonce}     → join as the agent
//! ```
//!
//! A query string or trailing slash is ignored. Anything else is rejected
//! with a 404 `error` envelope.

use tether_protocol::Role;
use tether_session::Nonce;

/// Where an incoming connection wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Rendezvous,
    Join { role: Role, nonce: Nonce },
}

impl Route {
    /// Parses a request path. Returns `None` for unknown paths.
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let mut segments = path.trim_matches('/').split('/');

        let route = match (segments.next(), segments.next()) {
            (Some("rendezvous"), None) => Route::Rendezvous,
            (Some("frontend"), Some(nonce)) if !nonce.is_empty() => Route::Join {
                role: Role::Frontend,
                nonce: Nonce::from_raw(nonce),
            },
            (Some("agent"), Some(nonce)) if !nonce.is_empty() => Route::Join {
                role: Role::Agent,
                nonce: Nonce::from_raw(nonce),
            },
            _ => return None,
        };

        if segments.next().is_some() {
            return None;
        }
        Some(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rendezvous() {
        assert_eq!(Route::parse("/rendezvous"), Some(Route::Rendezvous));
        assert_eq!(Route::parse("/rendezvous/"), Some(Route::Rendezvous));
    }

    #[test]
    fn test_parse_join_routes() {
        assert_eq!(
            Route::parse("/agent/abc123"),
            Some(Route::Join {
                role: Role::Agent,
                nonce: Nonce::from_raw("abc123"),
            })
        );
        assert_eq!(
            Route::parse("/frontend/abc123?v=1"),
            Some(Route::Join {
                role: Role::Frontend,
                nonce: Nonce::from_raw("abc123"),
            })
        );
    }

    #[test]
    fn test_parse_rejects_unknown_paths() {
        for path in ["/", "", "/agent", "/agent/", "/agent/a/b", "/admin/x", "/rendezvous/x"] {
            assert_eq!(Route::parse(path), None, "{path:?} should not route");
        }
    }
}
