use serde::{Deserialize, Serialize};
use strum::{AsRefStr, EnumIter, EnumString, IntoEnumIterator};

/// Caller service tier, as asserted by the upstream auth gateway.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ServiceTier {
    Premium,
    Standard,
    #[default]
    Free,
}

/// Queue priority per tier. Lower is served first.
const TIER_PRIORITIES: &[(ServiceTier, i32)] = &[
    (ServiceTier::Premium, 1),
    (ServiceTier::Standard, 5),
    (ServiceTier::Free, 10),
];

impl ServiceTier {
    pub fn priority(self) -> i32 {
        TIER_PRIORITIES
            .iter()
            .find(|(tier, _)| *tier == self)
            .map(|(_, priority)| *priority)
            .unwrap_or(i32::MAX)
    }

    /// Parse a tier header value, falling back to the default tier.
    pub fn from_header(value: Option<&str>) -> Self {
        value
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_default()
    }
}

/// Every tier, ordered from highest to lowest priority.
pub fn tiers_by_priority() -> Vec<ServiceTier> {
    let mut tiers: Vec<ServiceTier> = ServiceTier::iter().collect();
    tiers.sort_by_key(|t| t.priority());
    tiers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_order() {
        assert!(ServiceTier::Premium.priority() < ServiceTier::Standard.priority());
        assert!(ServiceTier::Standard.priority() < ServiceTier::Free.priority());
        assert_eq!(
            tiers_by_priority(),
            vec![ServiceTier::Premium, ServiceTier::Standard, ServiceTier::Free]
        );
    }

    #[test]
    fn test_every_tier_has_priority() {
        for tier in ServiceTier::iter() {
            assert_ne!(tier.priority(), i32::MAX, "{:?} missing from table", tier);
        }
    }

    #[test]
    fn test_header_parsing() {
        assert_eq!(ServiceTier::from_header(Some("Premium")), ServiceTier::Premium);
        assert_eq!(ServiceTier::from_header(Some(" standard ")), ServiceTier::Standard);
        assert_eq!(ServiceTier::from_header(Some("gold")), ServiceTier::Free);
        assert_eq!(ServiceTier::from_header(None), ServiceTier::Free);
    }
}
