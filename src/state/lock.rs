//! Per-stack leases serializing provisioning runs.
//!
//! A lease is a small JSON object stored next to the stack's bundle and
//! created with a conditional write, so at most one run holds it at a time.
//! Leases expire so a crashed run cannot block its stack forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lease lifetime in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 3600; // 1 hour

/// Information about a held lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lease identifier.
    pub lock_id: String,
    /// Bundle key the lease protects.
    pub key: String,
    /// Who holds the lease.
    pub holder: String,
    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a fresh lease for the given key and holder.
    #[must_use]
    pub fn new(key: &str, holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            key: key.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_creation() {
        let lease = LockInfo::new("s1-rg", "runner-a");
        assert_eq!(lease.key, "s1-rg");
        assert_eq!(lease.holder, "runner-a");
        assert!(!lease.is_expired());
        assert!(lease.remaining_secs() > 0);
    }

    #[test]
    fn test_expired_lease() {
        let mut lease = LockInfo::new("s1-rg", "runner-a");
        lease.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(lease.is_expired());
        assert_eq!(lease.remaining_secs(), 0);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}
