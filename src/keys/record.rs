//! The public-key record shape the gateway consumes from the forge.

use chrono::{DateTime, Duration, Utc};

/// A stored SSH public key, owned by the forge database.
///
/// The gateway only ever reads these: the fingerprint is the indexed lookup
/// key for authentication, and `content` is the canonical base-64 body
/// emitted into the authorized_keys file.  `updated` is stamped after every
/// successful authenticated Git session.
#[derive(Debug, Clone)]
pub struct PublicKeyRecord {
    pub id: i64,
    pub owner_id: i64,
    /// Human name, unique per owner.
    pub name: String,
    /// Lowercase colon-free hex MD5 of the raw key blob.
    pub fingerprint: String,
    /// Canonical base-64 key body.
    pub content: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl PublicKeyRecord {
    /// The key has authenticated at least one session since creation.
    pub fn has_used(&self) -> bool {
        self.updated > self.created
    }

    /// The key authenticated a session within the last seven days.
    pub fn has_recent_activity(&self) -> bool {
        self.updated + Duration::days(7) > Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(created: DateTime<Utc>, updated: DateTime<Utc>) -> PublicKeyRecord {
        PublicKeyRecord {
            id: 1,
            owner_id: 1,
            name: "laptop".into(),
            fingerprint: "bec0957f854e8153e28b80840f2efec5".into(),
            content: "AAAA".into(),
            created,
            updated,
        }
    }

    #[test]
    fn unused_key_has_no_activity() {
        let t = Utc::now() - Duration::days(30);
        let r = record(t, t);
        assert!(!r.has_used());
        assert!(!r.has_recent_activity());
    }

    #[test]
    fn recently_used_key() {
        let r = record(Utc::now() - Duration::days(30), Utc::now() - Duration::days(1));
        assert!(r.has_used());
        assert!(r.has_recent_activity());
    }

    #[test]
    fn stale_key_is_used_but_not_recent() {
        let r = record(Utc::now() - Duration::days(30), Utc::now() - Duration::days(8));
        assert!(r.has_used());
        assert!(!r.has_recent_activity());
    }
}
