use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// A routing rule resolved for a [`RouteKey`](crate::RouteKey).
///
/// The rule carries the redirect target and an optional expiry. The
/// `rule_id` references the row in the backing store that access-log
/// entries and click increments are attributed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Identifier of the rule in the backing store.
    pub rule_id: i64,
    /// The URL the request should be redirected to.
    pub target_url: String,
    /// When the rule expires, if ever.
    pub expire_at: Option<Timestamp>,
}

impl RouteRule {
    /// Returns `true` if the rule has passed its expiry time.
    pub fn is_expired(&self) -> bool {
        self.expire_at
            .is_some_and(|expire_at| Timestamp::now() >= expire_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jiff::SignedDuration;

    fn rule(expire_at: Option<Timestamp>) -> RouteRule {
        RouteRule {
            rule_id: 1,
            target_url: "https://example.com".to_string(),
            expire_at,
        }
    }

    #[test]
    fn no_expiry_never_expires() {
        assert!(!rule(None).is_expired());
    }

    #[test]
    fn past_expiry_is_expired() {
        let past = Timestamp::now() - SignedDuration::from_secs(1);
        assert!(rule(Some(past)).is_expired());
    }

    #[test]
    fn future_expiry_is_live() {
        let future = Timestamp::now() + SignedDuration::from_hours(1);
        assert!(!rule(Some(future)).is_expired());
    }
}
