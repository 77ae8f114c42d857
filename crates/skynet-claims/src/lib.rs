//! Claim backends for `skynet-scheduler`.
//!
//! Both backends grant a key to the first owner asking for it and keep the
//! reservation for a fixed TTL (at least [`MIN_TTL`]); once it has expired the
//! key may be claimed again.
//!
//! - [`MemoryClaims`]: process-local, for a single host and for tests.
//! - [`SqliteClaims`]: a shared SQLite file; every process opening the same
//!   file takes part in the same fleet.

use std::time::Duration;

pub mod db;
pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::{ClaimsError, Result};
pub use memory::MemoryClaims;
pub use sqlite::SqliteClaims;

/// Shortest reservation a backend accepts. A fleet only agrees on an
/// occurrence while its reservation is live.
pub const MIN_TTL: Duration = Duration::from_secs(60);

pub(crate) fn reservation_ttl(ttl: Duration) -> Result<chrono::Duration> {
    if ttl < MIN_TTL {
        return Err(ClaimsError::InvalidTtl { secs: ttl.as_secs() });
    }
    chrono::Duration::from_std(ttl).map_err(|_| ClaimsError::InvalidTtl { secs: ttl.as_secs() })
}
