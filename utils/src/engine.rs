use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use alloy::primitives::{utils::format_units, Address, U256};

use crate::{
    planner::PlanUnit,
    registry::{Token, TokenRegistry},
    retry::RetryPolicy,
};

/// Balance value as delivered by an upstream, before decoding.
#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    Integer(U256),
    /// Hex string such as `0x4c4b40`, as returned by JSON APIs.
    Hex(String),
    /// The upstream answered but could not produce a value for this pair.
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawBalance {
    pub wallet: Address,
    /// Contract address, or the native sentinel for ETH.
    pub token: Address,
    pub value: RawValue,
}

/// Anything that can answer a plan unit with raw balances.
pub trait BalanceSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn fetch(
        &self,
        unit: &PlanUnit,
    ) -> impl Future<Output = crate::Result<Vec<RawBalance>>> + Send;
}

/// A decoded, non-zero balance of one token in one wallet.
#[derive(Clone, Debug, PartialEq)]
pub struct BalanceTriple {
    pub wallet: Address,
    pub token: Arc<Token>,
    pub raw: U256,
    pub amount: f64,
}

#[derive(Debug, Default)]
pub struct UnitBalances {
    pub balances: Vec<BalanceTriple>,
    /// Values that could not be decoded. They are skipped, the unit still counts.
    pub decode_errors: usize,
}

#[derive(Debug)]
pub struct UnitOutcome {
    pub index: usize,
    pub wallets: Vec<Address>,
    pub result: crate::Result<UnitBalances>,
}

pub struct AggregationEngine<S> {
    source: S,
    registry: Arc<TokenRegistry>,
    retry: RetryPolicy,
    call_delay: Duration,
}

impl<S: BalanceSource> AggregationEngine<S> {
    pub fn new(source: S, registry: Arc<TokenRegistry>, retry: RetryPolicy) -> Self {
        Self {
            source,
            registry,
            retry,
            call_delay: Duration::ZERO,
        }
    }

    /// Pause after every unit, to stay under upstream request rates.
    pub fn with_call_delay(mut self, call_delay: Duration) -> Self {
        self.call_delay = call_delay;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn execute_unit(&self, unit: &PlanUnit) -> UnitOutcome {
        let label = format!("{} unit {}", self.source.name(), unit.index);
        let fetched = self.retry.run(&label, || self.source.fetch(unit)).await;

        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }

        let result = fetched.map(|raw| self.decode(unit, raw));
        if let Err(err) = &result {
            log::error!("{label} failed: {err}");
        }

        UnitOutcome {
            index: unit.index,
            wallets: unit.wallets.clone(),
            result,
        }
    }

    fn decode(&self, unit: &PlanUnit, raw: Vec<RawBalance>) -> UnitBalances {
        let wallets: HashSet<&Address> = unit.wallets.iter().collect();
        let mut seen = HashSet::new();
        let mut out = UnitBalances::default();

        for entry in raw {
            let Some(token) = self.registry.by_address(&entry.token) else {
                log::debug!("ignoring untracked token {}", entry.token);
                continue;
            };
            if !wallets.contains(&entry.wallet)
                || !unit.tokens.iter().any(|t| t.symbol == token.symbol)
            {
                log::debug!(
                    "ignoring {} for {} outside unit {}",
                    token.symbol,
                    entry.wallet,
                    unit.index
                );
                continue;
            }
            if !seen.insert((entry.wallet, token.symbol.clone())) {
                continue;
            }

            let raw = match decode_value(&entry.value) {
                Some(raw) => raw,
                None => {
                    log::warn!(
                        "could not decode {} balance of {}: {:?}",
                        token.symbol,
                        entry.wallet,
                        entry.value
                    );
                    out.decode_errors += 1;
                    continue;
                }
            };
            if raw.is_zero() {
                continue;
            }

            match to_amount(raw, token.decimals) {
                Some(amount) => out.balances.push(BalanceTriple {
                    wallet: entry.wallet,
                    token: Arc::clone(token),
                    raw,
                    amount,
                }),
                None => out.decode_errors += 1,
            }
        }

        out
    }
}

fn decode_value(value: &RawValue) -> Option<U256> {
    match value {
        RawValue::Integer(value) => Some(*value),
        RawValue::Hex(hex) => {
            let digits = hex
                .trim()
                .strip_prefix("0x")
                .or_else(|| hex.trim().strip_prefix("0X"))
                .unwrap_or(hex.trim());
            if digits.is_empty() {
                return Some(U256::ZERO);
            }
            U256::from_str_radix(digits, 16).ok()
        }
        RawValue::Failed => None,
    }
}

/// Human amount of `raw` base units.
pub fn to_amount(raw: U256, decimals: u8) -> Option<f64> {
    format_units(raw, decimals).ok()?.parse().ok()
}
