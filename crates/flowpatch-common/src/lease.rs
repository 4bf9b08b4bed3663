use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time-bounded exclusive ownership of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: String,
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// An expired lease is treated exactly like no lease at all.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lease_expiry_boundary() {
        let now = Utc::now();
        let lease = Lease {
            job_id: "job".into(),
            owner_id: "owner".into(),
            expires_at: now + Duration::seconds(300),
        };
        assert!(lease.is_valid_at(now));
        assert!(!lease.is_valid_at(now + Duration::seconds(300)));
        assert!(!lease.is_valid_at(now + Duration::seconds(301)));
    }
}
