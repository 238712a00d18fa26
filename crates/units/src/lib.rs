//! Branded monetary scalars and their wire codec.
//!
//! Every monetary quantity crossing a process boundary is one of the branded
//! types in this crate. The canonical wire form is a decimal string matching
//! `^-?(0|[1-9][0-9]*)$`. Construction from the wire goes through the strict
//! parser; the lenient parser exists for persistence read paths only and
//! reports whether it had to normalize.

mod codec;
mod convert;

pub use {
    codec::{DEFAULT_MAX_WIRE_LEN, Lenient, ParseError, assert_canonical},
    convert::{ConvertError, CreditRate, Rounding},
};

macro_rules! monetary {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(i64);

        impl $name {
            pub const ZERO: Self = Self(0);

            /// Constructs a value from raw atoms. In-process use only; wire
            /// ingress must go through [`std::str::FromStr`].
            pub const fn from_atoms(atoms: i64) -> Self {
                Self(atoms)
            }

            pub const fn atoms(self) -> i64 {
                self.0
            }

            pub const fn is_negative(self) -> bool {
                self.0 < 0
            }

            pub fn checked_add(self, other: Self) -> Option<Self> {
                self.0.checked_add(other.0).map(Self)
            }

            pub fn checked_sub(self, other: Self) -> Option<Self> {
                self.0.checked_sub(other.0).map(Self)
            }

            pub fn saturating_add(self, other: Self) -> Self {
                Self(self.0.saturating_add(other.0))
            }

            /// Parses the persistence read-path form. Accepts everything the
            /// strict parser accepts plus surrounding whitespace, a single
            /// leading plus, redundant leading zeros and `-0`. The returned
            /// flag tells the caller whether normalization happened so it can
            /// emit a metric.
            pub fn parse_lenient(input: &str) -> Result<Lenient<Self>, ParseError> {
                let lenient = codec::parse_lenient(input, codec::DEFAULT_MAX_WIRE_LEN)?;
                Ok(Lenient {
                    value: Self(i64::try_from(lenient.value).map_err(|_| ParseError::Overflow)?),
                    normalized: lenient.normalized,
                })
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                // i64's Display is already canonical: no leading zeros and
                // no negative zero.
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseError;

            fn from_str(input: &str) -> Result<Self, Self::Err> {
                let value = codec::parse_canonical(input, codec::DEFAULT_MAX_WIRE_LEN)?;
                Ok(Self(i64::try_from(value).map_err(|_| ParseError::Overflow)?))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = <std::borrow::Cow<str>>::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

monetary! {
    /// US dollars in units of 10⁻⁶ USD.
    MicroUsd
}

monetary! {
    /// Platform credit units. The exchange rate to USD is explicit at every
    /// conversion site.
    CreditUnit
}

monetary! {
    /// USDC in units of 10⁻⁶ USDC (the token's native decimals).
    MicroUsdc
}

impl MicroUsd {
    /// Token-count pricing: `tokens × rate / 1_000_000` rounded down.
    /// Committed costs always round in the tenant's favour.
    pub fn from_tokens(tokens: u64, rate_per_million_tokens: MicroUsd) -> Option<MicroUsd> {
        let product = i128::from(tokens).checked_mul(i128::from(rate_per_million_tokens.0))?;
        i64::try_from(product.div_euclid(1_000_000)).ok().map(Self)
    }
}

/// An integer fraction of a whole, in [0, 10000].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BasisPoints(u16);

impl BasisPoints {
    pub const MAX: Self = Self(10_000);

    pub fn new(value: u16) -> Result<Self, ParseError> {
        if value > 10_000 {
            return Err(ParseError::OutOfRange);
        }
        Ok(Self(value))
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    /// `value × bps / 10000`, rounded toward negative infinity.
    pub fn of(self, value: MicroUsd) -> MicroUsd {
        let product = i128::from(value.atoms()) * i128::from(self.0);
        MicroUsd(product.div_euclid(10_000) as i64)
    }
}

impl std::str::FromStr for BasisPoints {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let value = codec::parse_canonical(input, codec::DEFAULT_MAX_WIRE_LEN)?;
        let value = u16::try_from(value).map_err(|_| ParseError::OutOfRange)?;
        Self::new(value)
    }
}

impl serde::Serialize for BasisPoints {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for BasisPoints {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u16::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

/// A non-empty, whitespace-free account identifier.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ParseError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ParseError::Empty);
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(ParseError::Whitespace);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for AccountId {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::new(input)
    }
}

impl serde::Serialize for AccountId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for AccountId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_values_roundtrip() {
        for raw in ["0", "1", "-1", "42", "1000000", "-987654321"] {
            let parsed: MicroUsd = raw.parse().unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn strict_parser_rejections() {
        assert_eq!("".parse::<MicroUsd>().unwrap_err(), ParseError::Empty);
        assert_eq!("+1".parse::<MicroUsd>().unwrap_err(), ParseError::PlusSign);
        assert_eq!("-".parse::<MicroUsd>().unwrap_err(), ParseError::InvalidDigit);
        assert_eq!("007".parse::<MicroUsd>().unwrap_err(), ParseError::LeadingZero);
        assert_eq!("-0".parse::<MicroUsd>().unwrap_err(), ParseError::NegativeZero);
        assert_eq!("12a".parse::<MicroUsd>().unwrap_err(), ParseError::InvalidDigit);
        let too_long = "1".repeat(31);
        assert!(matches!(
            too_long.parse::<MicroUsd>().unwrap_err(),
            ParseError::TooLong { .. }
        ));
    }

    #[test]
    fn lenient_parser_normalizes() {
        let ok = MicroUsd::parse_lenient("42").unwrap();
        assert_eq!(ok.value.atoms(), 42);
        assert!(!ok.normalized);

        let padded = MicroUsd::parse_lenient("  +007 ").unwrap();
        assert_eq!(padded.value.atoms(), 7);
        assert!(padded.normalized);

        let negative_zero = MicroUsd::parse_lenient("-0").unwrap();
        assert_eq!(negative_zero.value.atoms(), 0);
        assert!(negative_zero.normalized);

        let too_long = format!(" {} ", "1".repeat(40));
        assert!(MicroUsd::parse_lenient(&too_long).is_err());
    }

    #[test]
    fn serde_uses_canonical_strings() {
        let value = MicroUsd::from_atoms(-250);
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"-250\"");
        let back: MicroUsd = serde_json::from_str("\"-250\"").unwrap();
        assert_eq!(back, value);
        assert!(serde_json::from_str::<MicroUsd>("\"+250\"").is_err());
    }

    #[test]
    fn basis_points_bounds() {
        assert!(BasisPoints::new(10_000).is_ok());
        assert_eq!(BasisPoints::new(10_001).unwrap_err(), ParseError::OutOfRange);
        let half = BasisPoints::new(5_000).unwrap();
        assert_eq!(half.of(MicroUsd::from_atoms(101)).atoms(), 50);
        assert_eq!(half.of(MicroUsd::from_atoms(-101)).atoms(), -51);
    }

    #[test]
    fn account_id_shape() {
        assert!(AccountId::new("tenant-1").is_ok());
        assert_eq!(AccountId::new("").unwrap_err(), ParseError::Empty);
        assert_eq!(AccountId::new("a b").unwrap_err(), ParseError::Whitespace);
    }

    #[test]
    fn token_pricing_rounds_down() {
        let rate = MicroUsd::from_atoms(1_500_000);
        assert_eq!(MicroUsd::from_tokens(1, rate).unwrap().atoms(), 1);
        assert_eq!(MicroUsd::from_tokens(1_000, rate).unwrap().atoms(), 1_500);
        assert_eq!(MicroUsd::from_tokens(0, rate).unwrap().atoms(), 0);
    }
}
