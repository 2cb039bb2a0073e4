//! Order sizing and price-target arithmetic

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Whole shares buyable at `price` with `ratio` of `cash`
///
/// `floor(floor(cash * ratio) / price)`; zero for non-positive inputs.
pub fn affordable_quantity(cash: i64, ratio: Decimal, price: i64) -> i64 {
    if cash <= 0 || price <= 0 || ratio <= Decimal::ZERO {
        return 0;
    }
    let budget = (Decimal::from(cash) * ratio).floor();
    (budget / Decimal::from(price))
        .floor()
        .to_i64()
        .unwrap_or(0)
}

/// Take-profit price: `ceil(avg_buy * (1 + pct / 100))`
pub fn target_price(avg_buy: Decimal, take_profit_pct: Decimal) -> i64 {
    let factor = Decimal::ONE + take_profit_pct / Decimal::ONE_HUNDRED;
    (avg_buy * factor).ceil().to_i64().unwrap_or(i64::MAX)
}

/// Realised return in percent, `(avg_sell / avg_buy - 1) * 100`
pub fn pnl_pct(avg_buy: Decimal, avg_sell: Decimal) -> Option<Decimal> {
    if avg_buy <= Decimal::ZERO {
        return None;
    }
    Some(((avg_sell / avg_buy) - Decimal::ONE) * Decimal::ONE_HUNDRED)
}
