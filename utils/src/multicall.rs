use std::time::Duration;

use alloy::{
    primitives::{Address, Bytes},
    providers::DynProvider,
    sol_types::SolCall,
};
use holdscan_common::{
    erc20::IERC20,
    multicall::{
        IMulticall3::{self, Call3, Call3Result},
        MULTICALL3_ADDRESS,
    },
};

use crate::{
    alloy::StringExt,
    engine::{BalanceSource, RawBalance, RawValue},
    planner::PlanUnit,
};

/// Reads balances with one Multicall3 `aggregate3` per unit.
///
/// Every sub-call allows failure, so a reverting token contract only costs
/// its own pair.
pub struct MulticallSource {
    provider: DynProvider,
    timeout: Duration,
}

impl MulticallSource {
    pub fn new(provider: DynProvider, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn from_rpc_url(rpc_url: &str, timeout: Duration) -> crate::Result<Self> {
        Ok(Self::new(rpc_url.to_alloy_provider()?, timeout))
    }
}

/// Sub-calls of a unit with the (wallet, token) pair each one answers.
fn build_calls(unit: &PlanUnit) -> Vec<((Address, Address), Call3)> {
    let mut calls = Vec::with_capacity(unit.pairs());
    for token in &unit.tokens {
        for wallet in &unit.wallets {
            let call = if token.is_native() {
                Call3 {
                    target: MULTICALL3_ADDRESS,
                    allowFailure: true,
                    callData: IMulticall3::getEthBalanceCall { addr: *wallet }
                        .abi_encode()
                        .into(),
                }
            } else {
                Call3 {
                    target: token.address,
                    allowFailure: true,
                    callData: IERC20::balanceOfCall { owner: *wallet }.abi_encode().into(),
                }
            };
            calls.push(((*wallet, token.address), call));
        }
    }
    calls
}

fn decode_return(data: &Bytes) -> RawValue {
    // getEthBalance and balanceOf both return a single uint256
    match IERC20::balanceOfCall::abi_decode_returns(data) {
        Ok(value) => RawValue::Integer(value),
        Err(_) => RawValue::Failed,
    }
}

fn decode_results(
    pairs: Vec<(Address, Address)>,
    results: Vec<Call3Result>,
) -> crate::Result<Vec<RawBalance>> {
    if pairs.len() != results.len() {
        return Err(crate::Error::MulticallResultMismatch {
            expected: pairs.len(),
            got: results.len(),
        });
    }

    Ok(pairs
        .into_iter()
        .zip(results)
        .map(|((wallet, token), result)| RawBalance {
            wallet,
            token,
            value: if result.success {
                decode_return(&result.returnData)
            } else {
                RawValue::Failed
            },
        })
        .collect())
}

impl BalanceSource for MulticallSource {
    fn name(&self) -> &'static str {
        "multicall"
    }

    async fn fetch(&self, unit: &PlanUnit) -> crate::Result<Vec<RawBalance>> {
        let (pairs, calls): (Vec<_>, Vec<_>) = build_calls(unit).into_iter().unzip();
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let multicall = IMulticall3::new(MULTICALL3_ADDRESS, self.provider.clone());
        let results = tokio::time::timeout(self.timeout, multicall.aggregate3(calls).call())
            .await
            .map_err(|_| crate::Error::Timeout(self.timeout))?
            .map_err(|err| crate::Error::MulticallFailed(Box::new(err)))?;

        decode_results(pairs, results)
    }
}
