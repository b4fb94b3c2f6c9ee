// src/fees.rs
// Privacy premium computation. All money is rust_decimal; floats never touch it.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Round a monetary value to 2 decimal places, half away from zero.
///
/// Deliberately not the banker's rounding `round_dp` defaults to: 2.345
/// must bill as 2.35, not 2.34.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Privacy premium owed on `amount` at `percent` (whole percent).
pub fn privacy_fee(amount: Decimal, percent: u32) -> Decimal {
    round_money(amount * Decimal::from(percent) / dec!(100))
}

/// Amount plus fee, as billed to the agent.
pub fn total_cost(amount: Decimal, fee: Decimal) -> Decimal {
    round_money(amount + fee)
}
