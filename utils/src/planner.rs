//! Splits a (wallets x tokens) matrix into units of remote work.
//!
//! Two shapes are supported, matching the two kinds of upstream services:
//!
//! - token broadcast: one call asks a single token about many wallets, which
//!   is how a multicall batch of `balanceOf` reads is built.
//! - wallet grouped: one call asks about a few wallets and returns every
//!   token they hold, which is how the balances-by-address API works.

use std::{collections::HashSet, sync::Arc};

use alloy::primitives::{keccak256, Address, B256};

use crate::registry::{Token, TokenRegistry};

/// Hard limit of addresses per balances-by-address request.
pub const MAX_ADDRESSES_PER_REQUEST: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    TokenBroadcast { wallets_per_call: usize },
    WalletGrouped { wallets_per_call: usize },
}

impl Strategy {
    pub fn wallets_per_call(&self) -> usize {
        match self {
            Strategy::TokenBroadcast { wallets_per_call } => *wallets_per_call,
            Strategy::WalletGrouped { wallets_per_call } => {
                (*wallets_per_call).min(MAX_ADDRESSES_PER_REQUEST)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct PlanUnit {
    /// Position in the plan, used to resume and to report progress.
    pub index: usize,
    pub wallets: Vec<Address>,
    pub tokens: Vec<Arc<Token>>,
}

impl PlanUnit {
    pub fn pairs(&self) -> usize {
        self.wallets.len() * self.tokens.len()
    }
}

#[derive(Clone, Debug)]
pub struct Plan {
    pub strategy: Strategy,
    pub wallets: Vec<Address>,
    pub units: Vec<PlanUnit>,
}

impl Plan {
    pub fn build(
        wallets: &[Address],
        registry: &TokenRegistry,
        strategy: Strategy,
    ) -> crate::Result<Self> {
        if registry.is_empty() {
            return Err(crate::Error::EmptyRegistry);
        }
        let width = strategy.wallets_per_call();
        if width == 0 {
            return Err(crate::Error::InvalidBatchWidth);
        }

        let mut seen = HashSet::with_capacity(wallets.len());
        let wallets: Vec<Address> = wallets
            .iter()
            .copied()
            .filter(|wallet| seen.insert(*wallet))
            .collect();

        let tokens = registry.tokens_with_native();
        let mut units = Vec::new();
        match strategy {
            Strategy::TokenBroadcast { .. } => {
                for token in &tokens {
                    for chunk in wallets.chunks(width) {
                        units.push(PlanUnit {
                            index: units.len(),
                            wallets: chunk.to_vec(),
                            tokens: vec![Arc::clone(token)],
                        });
                    }
                }
            }
            Strategy::WalletGrouped { .. } => {
                for chunk in wallets.chunks(width) {
                    units.push(PlanUnit {
                        index: units.len(),
                        wallets: chunk.to_vec(),
                        tokens: tokens.clone(),
                    });
                }
            }
        }

        Ok(Self {
            strategy,
            wallets,
            units,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Number of (wallet, token) pairs the plan asks about.
    pub fn covered_pairs(&self) -> usize {
        self.units.iter().map(PlanUnit::pairs).sum()
    }

    /// Units starting at `index`, for resuming an interrupted pass.
    pub fn units_from(&self, index: usize) -> &[PlanUnit] {
        &self.units[index.min(self.units.len())..]
    }

    /// Hash of everything that decides unit indexes: strategy, width, token
    /// order and wallet order. Plans with equal fingerprints split the work
    /// identically.
    pub fn fingerprint(&self) -> B256 {
        let tokens: Vec<&Arc<Token>> = match self.strategy {
            Strategy::TokenBroadcast { .. } => {
                self.units.iter().flat_map(|unit| &unit.tokens).collect()
            }
            Strategy::WalletGrouped { .. } => self
                .units
                .first()
                .map(|unit| unit.tokens.iter().collect())
                .unwrap_or_default(),
        };

        let mut bytes = Vec::with_capacity(9 + 20 * (tokens.len() + self.wallets.len()));
        bytes.push(match self.strategy {
            Strategy::TokenBroadcast { .. } => 0u8,
            Strategy::WalletGrouped { .. } => 1u8,
        });
        bytes.extend_from_slice(&(self.strategy.wallets_per_call() as u64).to_be_bytes());
        for token in tokens {
            bytes.extend_from_slice(token.address.as_slice());
        }
        for wallet in &self.wallets {
            bytes.extend_from_slice(wallet.as_slice());
        }
        keccak256(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallets(n: usize) -> Vec<Address> {
        (0..n)
            .map(|i| {
                let mut bytes = [0u8; 20];
                bytes[12..].copy_from_slice(&(i as u64 + 1).to_be_bytes());
                Address::from(bytes)
            })
            .collect()
    }

    #[test]
    fn test_token_broadcast_unit_count() {
        let registry = TokenRegistry::builtin().unwrap();
        let tokens = registry.tokens_with_native().len();
        let plan = Plan::build(
            &wallets(9000),
            &registry,
            Strategy::TokenBroadcast {
                wallets_per_call: 3000,
            },
        )
        .unwrap();

        assert_eq!(plan.len(), tokens * 3);
        assert_eq!(plan.covered_pairs(), 9000 * tokens);
        assert!(plan.units.iter().all(|unit| unit.tokens.len() == 1));

        // tokens are the outer loop
        assert_eq!(plan.units[0].tokens[0].symbol, plan.units[2].tokens[0].symbol);
        assert_ne!(plan.units[0].tokens[0].symbol, plan.units[3].tokens[0].symbol);
    }

    #[test]
    fn test_uneven_last_chunk() {
        let registry = TokenRegistry::builtin().unwrap();
        let plan = Plan::build(
            &wallets(7),
            &registry,
            Strategy::TokenBroadcast {
                wallets_per_call: 3,
            },
        )
        .unwrap();
        assert_eq!(plan.len(), registry.tokens_with_native().len() * 3);
        assert_eq!(plan.units[2].wallets.len(), 1);
        let last = wallets(7)[6];
        assert_eq!(
            plan.units
                .iter()
                .filter(|unit| unit.wallets.contains(&last))
                .count(),
            registry.tokens_with_native().len()
        );
    }

    #[test]
    fn test_wallet_grouped_is_clamped() {
        let registry = TokenRegistry::builtin().unwrap();
        let strategy = Strategy::WalletGrouped {
            wallets_per_call: 50,
        };
        assert_eq!(strategy.wallets_per_call(), MAX_ADDRESSES_PER_REQUEST);

        let plan = Plan::build(&wallets(10), &registry, strategy).unwrap();
        assert_eq!(plan.len(), 4);
        assert!(plan.units.iter().all(|unit| unit.wallets.len() <= 3));
        assert_eq!(plan.covered_pairs(), 10 * registry.tokens_with_native().len());
        assert!(plan
            .units
            .iter()
            .enumerate()
            .all(|(i, unit)| unit.index == i));
    }

    #[test]
    fn test_empty_inputs() {
        let registry = TokenRegistry::builtin().unwrap();
        let plan = Plan::build(
            &[],
            &registry,
            Strategy::TokenBroadcast {
                wallets_per_call: 3000,
            },
        )
        .unwrap();
        assert!(plan.is_empty());

        assert!(matches!(
            Plan::build(
                &wallets(1),
                &registry,
                Strategy::TokenBroadcast {
                    wallets_per_call: 0
                }
            ),
            Err(crate::Error::InvalidBatchWidth)
        ));
    }

    #[test]
    fn test_duplicates_are_collapsed() {
        let registry = TokenRegistry::builtin().unwrap();
        let mut input = wallets(3);
        input.extend(wallets(3));
        let plan = Plan::build(
            &input,
            &registry,
            Strategy::WalletGrouped {
                wallets_per_call: 3,
            },
        )
        .unwrap();
        assert_eq!(plan.wallets.len(), 3);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_resume_from_index() {
        let registry = TokenRegistry::builtin().unwrap();
        let plan = Plan::build(
            &wallets(6),
            &registry,
            Strategy::WalletGrouped {
                wallets_per_call: 3,
            },
        )
        .unwrap();
        assert_eq!(plan.units_from(1).len(), 1);
        assert_eq!(plan.units_from(1)[0].index, 1);
        assert!(plan.units_from(10).is_empty());
    }

    #[test]
    fn test_fingerprint() {
        let registry = TokenRegistry::builtin().unwrap();
        let broadcast = |wallets: &[Address], width| {
            Plan::build(
                wallets,
                &registry,
                Strategy::TokenBroadcast {
                    wallets_per_call: width,
                },
            )
            .unwrap()
            .fingerprint()
        };

        assert_eq!(broadcast(&wallets(5), 2), broadcast(&wallets(5), 2));
        assert_ne!(broadcast(&wallets(5), 2), broadcast(&wallets(5), 3));
        assert_ne!(broadcast(&wallets(5), 2), broadcast(&wallets(6), 2));

        let mut reversed = wallets(5);
        reversed.reverse();
        assert_ne!(broadcast(&wallets(5), 2), broadcast(&reversed, 2));

        let grouped = Plan::build(
            &wallets(5),
            &registry,
            Strategy::WalletGrouped {
                wallets_per_call: 2,
            },
        )
        .unwrap();
        assert_ne!(grouped.fingerprint(), broadcast(&wallets(5), 2));
    }
}
