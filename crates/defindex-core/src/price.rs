//! USD normalisation of token amounts.

use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::error::AggregationError;
use crate::event::TokenAmount;

/// Source of USD prices for token symbols.
///
/// Implementations must be deterministic for the lifetime of an engine:
/// replaying the same events must value them identically.
pub trait PriceOracle: Send + Sync {
    /// USD price of one whole token, if known.
    fn price_usd(&self, token: &str) -> Option<Decimal>;

    /// USD value of `amount`, using its absolute value.
    fn value_usd(&self, amount: &TokenAmount) -> Result<Decimal, AggregationError> {
        let price = self
            .price_usd(&amount.token)
            .ok_or_else(|| AggregationError::MissingPrice {
                token: amount.token.clone(),
            })?;
        amount
            .amount
            .abs()
            .checked_mul(price)
            .ok_or_else(|| AggregationError::Overflow {
                field: format!("usd value of {}", amount.token),
            })
    }

    /// Summed USD value of several amounts.
    fn total_usd(&self, amounts: &[TokenAmount]) -> Result<Decimal, AggregationError> {
        amounts.iter().try_fold(Decimal::ZERO, |acc, a| {
            acc.checked_add(self.value_usd(a)?)
                .ok_or_else(|| AggregationError::Overflow {
                    field: "usd total".into(),
                })
        })
    }
}

/// Fixed price table, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceOracle {
    prices: BTreeMap<String, Decimal>,
}

impl StaticPriceOracle {
    pub fn new(prices: BTreeMap<String, Decimal>) -> Self {
        Self {
            prices: prices
                .into_iter()
                .map(|(token, price)| (token.to_ascii_uppercase(), price))
                .collect(),
        }
    }

    /// Add or replace the price of one token.
    pub fn with_price(mut self, token: &str, price: Decimal) -> Self {
        self.prices.insert(token.to_ascii_uppercase(), price);
        self
    }
}

impl PriceOracle for StaticPriceOracle {
    fn price_usd(&self, token: &str) -> Option<Decimal> {
        self.prices.get(&token.to_ascii_uppercase()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn values_amounts_case_insensitively() {
        let oracle = StaticPriceOracle::default().with_price("weth", dec!(3000));
        let v = oracle.value_usd(&TokenAmount::new("WETH", dec!(-2))).unwrap();
        assert_eq!(v, dec!(6000));
    }

    #[test]
    fn missing_price_is_an_error() {
        let oracle = StaticPriceOracle::default();
        let err = oracle.value_usd(&TokenAmount::new("PEPE", dec!(1))).unwrap_err();
        assert_eq!(err, AggregationError::MissingPrice { token: "PEPE".into() });
    }

    #[test]
    fn totals_multiple_legs() {
        let oracle = StaticPriceOracle::default()
            .with_price("USDC", dec!(1))
            .with_price("DAI", dec!(1));
        let total = oracle
            .total_usd(&[
                TokenAmount::new("USDC", dec!(100)),
                TokenAmount::new("DAI", dec!(50.5)),
            ])
            .unwrap();
        assert_eq!(total, dec!(150.5));
    }
}
