use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::MarginMode;

/// Per-account balance aggregates. `frozen_margin` always equals the sum of
/// margin across building/open positions; `equity` adds unrealized pnl on
/// top of balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub margin_mode: MarginMode,
    pub balance: Decimal,
    pub frozen_margin: Decimal,
    pub realized_pnl_cum: Decimal,
}

impl Account {
    pub fn new(id: i64, margin_mode: MarginMode, balance: Decimal) -> Self {
        Self {
            id,
            margin_mode,
            balance,
            frozen_margin: Decimal::ZERO,
            realized_pnl_cum: Decimal::ZERO,
        }
    }

    pub fn equity(&self, total_unrealized: Decimal) -> Decimal {
        self.balance + total_unrealized
    }

    pub fn available(&self) -> Decimal {
        self.balance - self.frozen_margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn available_excludes_frozen() {
        let mut a = Account::new(1, MarginMode::Linear, dec!(1000));
        a.frozen_margin = dec!(250);
        assert_eq!(a.available(), dec!(750));
        assert_eq!(a.equity(dec!(30)), dec!(1030));
    }
}
