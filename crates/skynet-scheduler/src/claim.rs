use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::BoxError;

/// Fleet-wide "claim if absent" primitive arbitrating occurrence ownership.
///
/// Implementations are supplied by the caller, typically backed by a shared
/// store such as Redis (`SET key owner NX EX 3600`) or a SQL table.
#[async_trait]
pub trait Claim: Send + Sync {
    /// Reserve `key` for `owner` and return `true` if no live reservation
    /// exists, otherwise return `false`.
    ///
    /// A granted reservation must stay live for at least one minute so a
    /// lagging instance cannot claim the same occurrence again.
    async fn claim(&self, key: &str, owner: &str) -> Result<bool, BoxError>;
}

/// How a cron decides whether it owns an occurrence.
#[derive(Clone)]
pub(crate) enum ClaimMode {
    Distributed(Arc<dyn Claim>),
    /// Explicit single-instance mode: every claim is granted locally.
    Standalone,
}

impl ClaimMode {
    /// Claim errors count as "not claimed" so an unreachable backend can
    /// never lead to duplicate execution.
    pub(crate) async fn acquire(&self, key: &str, owner: &str) -> bool {
        match self {
            ClaimMode::Standalone => true,
            ClaimMode::Distributed(claim) => match claim.claim(key, owner).await {
                Ok(granted) => granted,
                Err(e) => {
                    warn!(task = %key, error = %e, "claim failed; occurrence treated as missed");
                    false
                }
            },
        }
    }
}

impl std::fmt::Debug for ClaimMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimMode::Distributed(_) => f.write_str("Distributed"),
            ClaimMode::Standalone => f.write_str("Standalone"),
        }
    }
}
