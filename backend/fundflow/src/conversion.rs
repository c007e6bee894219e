//! Fixed-point conversion between the human-facing decimal unit and the
//! ledger's smallest integer unit.
//!
//! The contract denominates everything in the smallest unit (10^18 per
//! whole token); the projection and the API speak in decimal amounts.

use rust_decimal::Decimal;

use crate::errors::{Result, ServiceError};

/// Number of decimal digits between the two denominations.
pub const SCALE: u32 = 18;

/// Convert a decimal amount to the ledger's smallest unit.
///
/// Rejects negative amounts, amounts with more than [`SCALE`] fractional
/// digits, and amounts that overflow `u128`.
pub fn to_smallest(amount: Decimal) -> Result<u128> {
    if amount.is_sign_negative() {
        return Err(ServiceError::Validation(format!(
            "Amount must not be negative: {amount}"
        )));
    }
    if amount.scale() > SCALE {
        return Err(ServiceError::Validation(format!(
            "Amount {amount} has more than {SCALE} fractional digits"
        )));
    }

    // Shift the fractional digits out, then apply the remaining powers of
    // ten on integer arithmetic so the result is exact.
    let fractional_digits = amount.scale();
    let mut mantissa = amount.mantissa() as u128;
    for _ in 0..(SCALE - fractional_digits) {
        mantissa = mantissa.checked_mul(10).ok_or_else(|| {
            ServiceError::Validation(format!("Amount {amount} overflows the smallest unit"))
        })?;
    }
    Ok(mantissa)
}

/// Convert an amount in the ledger's smallest unit back to a decimal.
///
/// Values above `Decimal`'s 96-bit mantissa lose precision on the wire and
/// are reported as an error rather than silently truncated.
pub fn from_smallest(value: u128) -> Result<Decimal> {
    let mantissa = i128::try_from(value).map_err(|_| {
        ServiceError::Unknown(format!("Ledger value {value} exceeds representable range"))
    })?;
    let as_decimal = Decimal::try_from_i128_with_scale(mantissa, SCALE).map_err(|_| {
        ServiceError::Unknown(format!("Ledger value {value} exceeds representable range"))
    })?;
    Ok(as_decimal.normalize())
}

/// Parse a decimal string from the wire (RPC balances arrive as strings).
pub fn parse_smallest(raw: &str) -> Result<u128> {
    raw.parse::<u128>()
        .map_err(|_| ServiceError::Unknown(format!("Unparseable ledger amount: {raw}")))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
