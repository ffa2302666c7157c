//! Exact-precision USDC amounts using integer arithmetic.
//!
//! All financial values in the gateway are carried as [`MicroUsdc`]
//! (1 = 0.000001 USDC, so $1.00 = 1_000_000). Floats only appear at the
//! human-readable edges; everything that touches a balance or a payment is
//! integer math.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of atomic units per whole USDC (10^6).
pub const SCALE: i64 = 1_000_000;

/// A USDC amount in atomic units (1 = 0.000001 USDC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MicroUsdc(pub i64);

impl MicroUsdc {
    pub const ZERO: MicroUsdc = MicroUsdc(0);

    /// Convert a human-readable amount (e.g. 0.001) to MicroUsdc,
    /// rounding half away from zero to avoid float truncation.
    pub fn from_float(f: f64) -> Self {
        MicroUsdc((f * SCALE as f64).round() as i64)
    }

    /// The human-readable float value.
    pub fn to_float(self) -> f64 {
        self.0 as f64 / SCALE as f64
    }

    /// Raw atomic units.
    pub fn raw(self) -> i64 {
        self.0
    }

    /// Scale to on-chain atomic units for the given chain:
    /// `on_chain = micro * 10^(chain_decimals - 6)`.
    pub fn to_chain_units(self, chain: &str) -> i128 {
        let decimals = chain_decimals(chain);
        let v = self.0 as i128;
        if decimals > 6 {
            v * 10i128.pow(decimals - 6)
        } else if decimals < 6 {
            v / 10i128.pow(6 - decimals)
        } else {
            v
        }
    }

    /// Convert on-chain atomic units back to MicroUsdc. Reverse of
    /// [`to_chain_units`](Self::to_chain_units).
    pub fn from_chain_units(units: i128, chain: &str) -> Self {
        let decimals = chain_decimals(chain);
        let v = if decimals > 6 {
            units / 10i128.pow(decimals - 6)
        } else if decimals < 6 {
            units * 10i128.pow(6 - decimals)
        } else {
            units
        };
        MicroUsdc(v as i64)
    }

    pub fn saturating_add(self, other: MicroUsdc) -> MicroUsdc {
        MicroUsdc(self.0.saturating_add(other.0))
    }
}

impl std::fmt::Display for MicroUsdc {
    /// Human-readable string with at least 2 and at most 6 fraction digits,
    /// trailing zeros trimmed beyond 2.
    /// 1_000_000 → "1.00", 1_000 → "0.001", 1_250_000 → "1.25".
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let negative = self.0 < 0;
        let v = self.0.unsigned_abs();
        let whole = v / SCALE as u64;
        let frac = v % SCALE as u64;

        let mut s = format!("{whole}.{frac:06}");
        let dot = s.find('.').unwrap_or(0);
        let min_len = dot + 3; // keep at least ".XX"
        while s.len() > min_len && s.ends_with('0') {
            s.pop();
        }

        if negative {
            write!(f, "-{s}")
        } else {
            write!(f, "{s}")
        }
    }
}

impl Serialize for MicroUsdc {
    /// Serializes as a JSON string of the raw integer: `"1250000"`.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for MicroUsdc {
    /// Accepts either a quoted string (`"1250000"`) or a bare integer.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(i64),
            Str(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Int(v) => Ok(MicroUsdc(v)),
            Repr::Str(s) => s
                .parse::<i64>()
                .map(MicroUsdc)
                .map_err(|e| D::Error::custom(format!("cannot parse {s:?} as MicroUsdc: {e}"))),
        }
    }
}

/// USDC token decimal places per chain. This is the single source of truth;
/// decimals are never hardcoded elsewhere.
pub fn chain_decimals(chain: &str) -> u32 {
    match chain {
        "base" | "base-sepolia" | "solana" | "solana-devnet" => 6,
        _ => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_float_rounds() {
        assert_eq!(MicroUsdc::from_float(0.001), MicroUsdc(1_000));
        assert_eq!(MicroUsdc::from_float(1.0), MicroUsdc(1_000_000));
        // 0.1 is not exactly representable; rounding must absorb the error
        assert_eq!(MicroUsdc::from_float(0.1), MicroUsdc(100_000));
        assert_eq!(MicroUsdc::from_float(29.99), MicroUsdc(29_990_000));
    }

    #[test]
    fn test_float_round_trip() {
        for raw in [0i64, 1, 100, 1_000, 999_999, 1_000_000, 1_250_000] {
            let m = MicroUsdc(raw);
            assert_eq!(MicroUsdc::from_float(m.to_float()), m);
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(MicroUsdc(1_000_000).to_string(), "1.00");
        assert_eq!(MicroUsdc(1_000).to_string(), "0.001");
        assert_eq!(MicroUsdc(1_250_000).to_string(), "1.25");
        assert_eq!(MicroUsdc(100).to_string(), "0.0001");
        assert_eq!(MicroUsdc(-1_500_000).to_string(), "-1.50");
        assert_eq!(MicroUsdc(0).to_string(), "0.00");
    }

    #[test]
    fn test_json_round_trip() {
        let m = MicroUsdc(1_250_000);
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, "\"1250000\"");
        let back: MicroUsdc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);

        // Bare integers are accepted on input
        let from_int: MicroUsdc = serde_json::from_str("42").unwrap();
        assert_eq!(from_int, MicroUsdc(42));
    }

    #[test]
    fn test_json_rejects_garbage() {
        assert!(serde_json::from_str::<MicroUsdc>("\"not-a-number\"").is_err());
    }

    #[test]
    fn test_chain_units_round_trip() {
        for chain in ["base", "base-sepolia", "solana", "solana-devnet"] {
            for raw in [0i64, 1, 1_000, 1_000_000, 123_456_789] {
                let m = MicroUsdc(raw);
                assert_eq!(MicroUsdc::from_chain_units(m.to_chain_units(chain), chain), m);
            }
        }
    }

    #[test]
    fn test_chain_units_identity_for_six_decimals() {
        // Every supported chain carries USDC at 6 decimals today
        assert_eq!(MicroUsdc(1_000).to_chain_units("base"), 1_000);
        assert_eq!(MicroUsdc(1_000).to_chain_units("solana"), 1_000);
    }
}
