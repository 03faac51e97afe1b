//! Usage waterfall.
//!
//! Consumption is drawn from the plan allowance first, then rollover, then
//! purchased credits. Whatever is left becomes overage. The function is
//! pure so every ledger backend applies exactly the same rules.

use serde::{Deserialize, Serialize};

/// Remaining balances for one user, in resource units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePools {
    pub plan_remaining: u64,
    pub rollover_remaining: u64,
    pub purchased_remaining: u64,
    /// Units consumed beyond every pool in the current period.
    pub overage_used: u64,
}

/// How a quantity was split across the pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deduction {
    pub from_plan: u64,
    pub from_rollover: u64,
    pub from_purchased: u64,
    pub to_overage: u64,
}

impl Deduction {
    pub fn total(&self) -> u64 {
        self.from_plan + self.from_rollover + self.from_purchased + self.to_overage
    }

    pub fn merge(self, other: Deduction) -> Deduction {
        Deduction {
            from_plan: self.from_plan + other.from_plan,
            from_rollover: self.from_rollover + other.from_rollover,
            from_purchased: self.from_purchased + other.from_purchased,
            to_overage: self.to_overage + other.to_overage,
        }
    }
}

impl UsagePools {
    /// Deduct `quantity` through the waterfall, mutating the balances.
    pub fn apply(&mut self, quantity: u64) -> Deduction {
        let mut left = quantity;

        let from_plan = left.min(self.plan_remaining);
        self.plan_remaining -= from_plan;
        left -= from_plan;

        let from_rollover = left.min(self.rollover_remaining);
        self.rollover_remaining -= from_rollover;
        left -= from_rollover;

        let from_purchased = left.min(self.purchased_remaining);
        self.purchased_remaining -= from_purchased;
        left -= from_purchased;

        self.overage_used += left;

        Deduction {
            from_plan,
            from_rollover,
            from_purchased,
            to_overage: left,
        }
    }

    pub fn total_remaining(&self) -> u64 {
        self.plan_remaining + self.rollover_remaining + self.purchased_remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plan_first() {
        let mut pools = UsagePools {
            plan_remaining: 100,
            rollover_remaining: 50,
            purchased_remaining: 10,
            overage_used: 0,
        };
        let d = pools.apply(30);
        assert_eq!(d.from_plan, 30);
        assert_eq!(d.from_rollover, 0);
        assert_eq!(pools.plan_remaining, 70);
    }

    #[test]
    fn test_spills_in_order_then_overage() {
        let mut pools = UsagePools {
            plan_remaining: 10,
            rollover_remaining: 5,
            purchased_remaining: 3,
            overage_used: 0,
        };
        let d = pools.apply(25);
        assert_eq!(
            d,
            Deduction {
                from_plan: 10,
                from_rollover: 5,
                from_purchased: 3,
                to_overage: 7,
            }
        );
        assert_eq!(pools.total_remaining(), 0);
        assert_eq!(pools.overage_used, 7);
    }

    proptest! {
        #[test]
        fn prop_waterfall_conserves_quantity(
            plan in 0u64..10_000,
            rollover in 0u64..10_000,
            purchased in 0u64..10_000,
            quantity in 0u64..50_000,
        ) {
            let mut pools = UsagePools {
                plan_remaining: plan,
                rollover_remaining: rollover,
                purchased_remaining: purchased,
                overage_used: 0,
            };
            let before = pools.total_remaining();
            let d = pools.apply(quantity);
            prop_assert_eq!(d.total(), quantity);
            prop_assert_eq!(before - pools.total_remaining() + pools.overage_used, quantity);
            // Later pools are only touched once earlier ones are empty.
            if d.from_rollover > 0 { prop_assert_eq!(pools.plan_remaining, 0); }
            if d.from_purchased > 0 { prop_assert_eq!(pools.rollover_remaining, 0); }
            if d.to_overage > 0 { prop_assert_eq!(pools.purchased_remaining, 0); }
        }
    }
}
