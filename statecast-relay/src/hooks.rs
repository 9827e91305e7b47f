//! Injectable policy hooks
//!
//! Three optional capabilities shape the relay's behavior:
//! - [`EventScorer`] may drop an event or give it a priority before batching
//! - [`Authorizer`] decides whether a connection may see a key
//! - [`TokenVerifier`] validates `auth` tokens
//!
//! Every hook is fallible. The relay maps failures to a safe default rather
//! than propagating them: scorer errors keep the event at priority 0,
//! authorizer errors withhold the message, verifier errors reject the token.

#[cfg(test)]
use mockall::automock;

use async_trait::async_trait;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::connection::ConnectionContext;
use statecast_core::models::Event;

/// Error type returned by hook implementations
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Scoring decision for one event
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Score {
    /// Probability in [0, 1] that the event is discarded
    pub drop_probability: Option<f64>,
    /// Flush ordering priority, higher first
    pub priority: Option<i32>,
}

impl Score {
    #[must_use]
    pub const fn keep() -> Self {
        Self {
            drop_probability: None,
            priority: None,
        }
    }

    #[must_use]
    pub const fn with_priority(priority: i32) -> Self {
        Self {
            drop_probability: None,
            priority: Some(priority),
        }
    }

    #[must_use]
    pub const fn drop_with(probability: f64) -> Self {
        Self {
            drop_probability: Some(probability),
            priority: None,
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventScorer: Send + Sync {
    async fn score(&self, event: &Event) -> Result<Score, HookError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Ok(true)` allows. Anything else withholds.
    async fn authorize(&self, conn: &ConnectionContext, key: &str) -> Result<bool, HookError>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<bool, HookError>;
}

/// The set of hooks a relay runs with. Absent hooks are no-ops.
#[derive(Clone, Default)]
pub struct Hooks {
    pub scorer: Option<Arc<dyn EventScorer>>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub verifier: Option<Arc<dyn TokenVerifier>>,
}

impl Hooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn EventScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Verify a token, treating a missing verifier or an error as rejection
    pub async fn verify_token(&self, token: &str) -> bool {
        let Some(verifier) = &self.verifier else {
            return false;
        };
        match verifier.verify(token).await {
            Ok(valid) => valid,
            Err(e) => {
                tracing::warn!(error = %e, "Token verifier failed, rejecting");
                false
            }
        }
    }

    /// Authorize, failing closed. Allowed when no authorizer is installed.
    pub async fn is_authorized(&self, conn: &ConnectionContext, key: &str) -> bool {
        let Some(authorizer) = &self.authorizer else {
            return true;
        };
        match authorizer.authorize(conn, key).await {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::debug!(connection_id = %conn.id, key, error = %e, "Authorizer failed, denying");
                false
            }
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("scorer", &self.scorer.is_some())
            .field("authorizer", &self.authorizer.is_some())
            .field("verifier", &self.verifier.is_some())
            .finish()
    }
}

/// Accepts any token from a fixed list, compared in constant time
#[derive(Clone)]
pub struct StaticTokenVerifier {
    tokens: Vec<String>,
}

impl StaticTokenVerifier {
    #[must_use]
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens: tokens.into_iter().filter(|t| !t.is_empty()).collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        // Check all tokens so timing does not reveal which one matched
        self.tokens.iter().fold(false, |found, expected| {
            found | bool::from(expected.as_bytes().ct_eq(token.as_bytes()))
        })
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<bool, HookError> {
        Ok(self.contains(token))
    }
}
