//! Maker/taker fee schedule
//!
//! Fees are basis points of the amount an order receives and are charged
//! in that coin. Per-user tiers override the default rates.

use std::collections::HashMap;

use common::decimal;
use config::FeesConfig;

use crate::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeRates {
    pub maker_bps: u64,
    pub taker_bps: u64,
}

#[derive(Debug, Clone, Default)]
pub struct FeeSchedule {
    default: FeeRates,
    tiers: HashMap<u64, FeeRates>,
}

impl FeeSchedule {
    pub fn new(default: FeeRates) -> Self {
        Self {
            default,
            tiers: HashMap::new(),
        }
    }

    pub fn from_config(config: &FeesConfig) -> Self {
        let mut schedule = Self::new(FeeRates {
            maker_bps: config.maker_bps,
            taker_bps: config.taker_bps,
        });
        for tier in &config.tiers {
            schedule.tiers.insert(
                tier.user_id,
                FeeRates {
                    maker_bps: tier.maker_bps,
                    taker_bps: tier.taker_bps,
                },
            );
        }
        schedule
    }

    pub fn rates(&self, user_id: u64) -> FeeRates {
        self.tiers.get(&user_id).copied().unwrap_or(self.default)
    }

    /// Fee on `received` for `user_id` acting as maker or taker
    pub fn fee(&self, user_id: u64, is_maker: bool, received: u64) -> Result<u64> {
        let rates = self.rates(user_id);
        let bps = if is_maker {
            rates.maker_bps
        } else {
            rates.taker_bps
        };
        Ok(decimal::apply_bps(received, bps)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FeeTierConfig;

    #[test]
    fn test_tiers_override_defaults() {
        let schedule = FeeSchedule::from_config(&FeesConfig {
            maker_bps: 10,
            taker_bps: 20,
            tiers: vec![FeeTierConfig {
                user_id: 42,
                maker_bps: 0,
                taker_bps: 5,
            }],
        });

        assert_eq!(schedule.fee(1, true, 1_000_000).unwrap(), 1_000);
        assert_eq!(schedule.fee(1, false, 1_000_000).unwrap(), 2_000);
        assert_eq!(schedule.fee(42, true, 1_000_000).unwrap(), 0);
        assert_eq!(schedule.fee(42, false, 1_000_000).unwrap(), 500);
    }

    #[test]
    fn test_fee_floors() {
        let schedule = FeeSchedule::new(FeeRates {
            maker_bps: 10,
            taker_bps: 10,
        });
        assert_eq!(schedule.fee(1, false, 999).unwrap(), 0);
    }
}
