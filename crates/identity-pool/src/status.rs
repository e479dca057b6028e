//! Health status of an identity
//!
//! Stored as a raw HTTP-style integer. Only two values carry meaning for the
//! pool: 200 makes an identity selectable and 429 makes it eligible for the
//! cooldown reset. Every other code is kept verbatim and is simply not
//! selectable.

use serde::{Deserialize, Serialize};

/// Raw code for a healthy identity.
pub const HEALTHY: i32 = 200;

/// Raw code for a rate-limited identity.
pub const RATE_LIMITED: i32 = 429;

/// Tagged view of the raw status integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum HealthStatus {
    #[default]
    Healthy,
    RateLimited,
    Other(i32),
}

impl HealthStatus {
    pub fn code(self) -> i32 {
        match self {
            HealthStatus::Healthy => HEALTHY,
            HealthStatus::RateLimited => RATE_LIMITED,
            HealthStatus::Other(code) => code,
        }
    }

    pub fn is_selectable(self) -> bool {
        self == HealthStatus::Healthy
    }

    /// Status label for health/logging.
    pub fn label(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::RateLimited => "rate_limited",
            HealthStatus::Other(_) => "other",
        }
    }
}

impl From<i32> for HealthStatus {
    fn from(code: i32) -> Self {
        match code {
            HEALTHY => HealthStatus::Healthy,
            RATE_LIMITED => HealthStatus::RateLimited,
            other => HealthStatus::Other(other),
        }
    }
}

impl From<HealthStatus> for i32 {
    fn from(status: HealthStatus) -> Self {
        status.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_codes_map_to_named_variants() {
        assert_eq!(HealthStatus::from(200), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from(429), HealthStatus::RateLimited);
    }

    #[test]
    fn other_codes_are_preserved_verbatim() {
        for code in [0, 403, 409, 503, -1, i32::MAX] {
            let status = HealthStatus::from(code);
            assert_eq!(status, HealthStatus::Other(code));
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn only_healthy_is_selectable() {
        assert!(HealthStatus::Healthy.is_selectable());
        assert!(!HealthStatus::RateLimited.is_selectable());
        assert!(!HealthStatus::Other(500).is_selectable());
    }

    #[test]
    fn default_is_healthy() {
        assert_eq!(HealthStatus::default().code(), 200);
    }

    #[test]
    fn serializes_as_raw_integer() {
        assert_eq!(serde_json::to_string(&HealthStatus::RateLimited).unwrap(), "429");
        assert_eq!(serde_json::to_string(&HealthStatus::Other(409)).unwrap(), "409");
        let parsed: HealthStatus = serde_json::from_str("200").unwrap();
        assert_eq!(parsed, HealthStatus::Healthy);
    }
}
