use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use skynet_scheduler::{BoxError, Claim};
use tracing::debug;

use crate::error::Result;
use crate::reservation_ttl;

struct Reservation {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// Claims held in this process only.
///
/// Every cron sharing one `MemoryClaims` (through an `Arc`) behaves as a fleet.
pub struct MemoryClaims {
    ttl: chrono::Duration,
    entries: DashMap<String, Reservation>,
}

impl MemoryClaims {
    pub fn new(ttl: Duration) -> Result<Self> {
        Ok(Self {
            ttl: reservation_ttl(ttl)?,
            entries: DashMap::new(),
        })
    }

    /// Reserve `key` for `owner` unless someone holds a live reservation.
    pub fn try_claim(&self, key: &str, owner: &str) -> bool {
        self.claim_at(key, owner, Utc::now())
    }

    fn claim_at(&self, key: &str, owner: &str, now: DateTime<Utc>) -> bool {
        let fresh = Reservation {
            owner: owner.to_string(),
            expires_at: now + self.ttl,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                true
            }
            Entry::Occupied(mut slot) if slot.get().expires_at <= now => {
                slot.insert(fresh);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Owner of the live reservation on `key`.
    pub fn owner_of(&self, key: &str) -> Option<String> {
        self.owner_at(key, Utc::now())
    }

    fn owner_at(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        self.entries
            .get(key)
            .filter(|r| r.expires_at > now)
            .map(|r| r.owner.clone())
    }

    /// Drop expired reservations, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_at(Utc::now())
    }

    fn purge_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, r| r.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of tracked reservations, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Claim for MemoryClaims {
    async fn claim(&self, key: &str, owner: &str) -> std::result::Result<bool, BoxError> {
        let claimed = self.try_claim(key, owner);
        debug!(key, owner, claimed, "memory claim");
        Ok(claimed)
    }
}
