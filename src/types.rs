// =============================================================================
// Shared types used across the Kestrel trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a position or target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The side of an order that closes a position on this side.
    pub fn closing(self) -> Side {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// +1.0 for long, -1.0 for short. Used in PnL arithmetic.
    pub fn direction(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    /// True when `price` is on the favourable side of `reference`.
    pub fn is_favourable(self, price: f64, reference: f64) -> bool {
        match self {
            Self::Long => price > reference,
            Self::Short => price < reference,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_side_flips() {
        assert_eq!(Side::Long.closing(), Side::Short);
        assert_eq!(Side::Short.closing(), Side::Long);
    }

    #[test]
    fn favourable_is_directional() {
        assert!(Side::Long.is_favourable(101.0, 100.0));
        assert!(!Side::Long.is_favourable(99.0, 100.0));
        assert!(Side::Short.is_favourable(99.0, 100.0));
        assert!(!Side::Short.is_favourable(101.0, 100.0));
    }

    #[test]
    fn serde_uses_screaming_case() {
        let json = serde_json::to_string(&Side::Long).unwrap();
        assert_eq!(json, "\"LONG\"");
        let side: Side = serde_json::from_str("\"SHORT\"").unwrap();
        assert_eq!(side, Side::Short);
    }
}
