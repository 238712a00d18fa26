//! Cross-brand conversions. Every conversion takes an explicit rate and an
//! explicit rounding mode; there is no ambient exchange rate.

use crate::{CreditUnit, MicroUsd, MicroUsdc};

/// Reserve paths round up so the hold can never undershoot the commit;
/// commit paths round down so the tenant is never overcharged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rounding {
    Ceil,
    Floor,
}

/// Credit units granted per whole USD. Frozen at reserve time; commits must
/// present the same rate, which the billing invariants cross-check.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CreditRate {
    pub credit_units_per_usd: i64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ConvertError {
    #[error("rate must be positive")]
    NonPositiveRate,
    #[error("conversion overflowed the target type")]
    Overflow,
}

const MICRO_PER_UNIT: i128 = 1_000_000;

fn scale(atoms: i64, rate: i64, rounding: Rounding) -> Result<i64, ConvertError> {
    if rate <= 0 {
        return Err(ConvertError::NonPositiveRate);
    }
    let product = i128::from(atoms)
        .checked_mul(i128::from(rate))
        .ok_or(ConvertError::Overflow)?;
    let scaled = match rounding {
        Rounding::Floor => product.div_euclid(MICRO_PER_UNIT),
        // ceil(p / d) == -floor(-p / d); for negative products this yields
        // -floor(|p| / d) as the wire contract requires.
        Rounding::Ceil => -((-product).div_euclid(MICRO_PER_UNIT)),
    };
    i64::try_from(scaled).map_err(|_| ConvertError::Overflow)
}

impl MicroUsd {
    /// `micro_usd × credit_units_per_usd / 1_000_000` under the given
    /// rounding mode.
    pub fn to_credit_units(
        self,
        rate: CreditRate,
        rounding: Rounding,
    ) -> Result<CreditUnit, ConvertError> {
        scale(self.atoms(), rate.credit_units_per_usd, rounding).map(CreditUnit::from_atoms)
    }
}

impl MicroUsdc {
    /// Converts at an explicit USD price for one whole USDC, expressed in
    /// MicroUSD (1_000_000 = parity).
    pub fn to_micro_usd(
        self,
        micro_usd_per_usdc: MicroUsd,
        rounding: Rounding,
    ) -> Result<MicroUsd, ConvertError> {
        scale(self.atoms(), micro_usd_per_usdc.atoms(), rounding).map(MicroUsd::from_atoms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: CreditRate = CreditRate {
        credit_units_per_usd: 100,
    };

    #[test]
    fn floor_and_ceil_on_positive_values() {
        // $1.50 at 100 credits/USD with a remainder digit.
        let value = MicroUsd::from_atoms(1_505_000);
        assert_eq!(
            value.to_credit_units(RATE, Rounding::Floor).unwrap().atoms(),
            150
        );
        assert_eq!(
            value.to_credit_units(RATE, Rounding::Ceil).unwrap().atoms(),
            151
        );
    }

    #[test]
    fn negative_ceil_is_minus_floor_of_magnitude() {
        let value = MicroUsd::from_atoms(-1_505_000);
        // |product| / divisor floors to 150, so ceil of the negative is -150.
        assert_eq!(
            value.to_credit_units(RATE, Rounding::Ceil).unwrap().atoms(),
            -150
        );
        assert_eq!(
            value.to_credit_units(RATE, Rounding::Floor).unwrap().atoms(),
            -151
        );
    }

    #[test]
    fn exact_multiples_ignore_rounding() {
        let value = MicroUsd::from_atoms(2_000_000);
        for rounding in [Rounding::Floor, Rounding::Ceil] {
            assert_eq!(value.to_credit_units(RATE, rounding).unwrap().atoms(), 200);
        }
    }

    #[test]
    fn rejects_non_positive_rates() {
        let bad = CreditRate {
            credit_units_per_usd: 0,
        };
        assert_eq!(
            MicroUsd::from_atoms(1).to_credit_units(bad, Rounding::Floor),
            Err(ConvertError::NonPositiveRate)
        );
    }

    #[test]
    fn usdc_peg_conversion() {
        let parity = MicroUsd::from_atoms(1_000_000);
        let value = MicroUsdc::from_atoms(2_500_000);
        assert_eq!(
            value.to_micro_usd(parity, Rounding::Floor).unwrap().atoms(),
            2_500_000
        );
    }
}
