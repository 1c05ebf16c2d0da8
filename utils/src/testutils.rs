//! Scripted balance source for exercising the engine and pipeline offline.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use alloy::primitives::Address;
use url::Url;

use crate::{
    engine::{BalanceSource, RawBalance, RawValue},
    planner::PlanUnit,
};

#[derive(Clone, Copy, Debug)]
pub enum Fault {
    /// Answer 429 this many times, then succeed.
    RateLimited(usize),
    /// Time out this many times, then succeed.
    Transient(usize),
    /// Fail every call with a non retryable error.
    Permanent,
    /// Never answer, like a connection that hangs.
    Stall,
    /// Panic inside the call.
    Panic,
}

#[derive(Default)]
pub struct ScriptedSource {
    balances: Vec<RawBalance>,
    strays: Vec<RawBalance>,
    all_tokens: bool,
    faults: Mutex<HashMap<usize, Fault>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn with_balance(mut self, wallet: Address, token: Address, value: RawValue) -> Self {
        self.balances.push(RawBalance {
            wallet,
            token,
            value,
        });
        self
    }

    /// A result about a wallet the unit never asked for.
    pub fn with_stray(mut self, wallet: Address, token: Address, value: RawValue) -> Self {
        self.strays.push(RawBalance {
            wallet,
            token,
            value,
        });
        self
    }

    /// Answer with every configured token of the unit's wallets, asked or not.
    pub fn answering_all_tokens(mut self) -> Self {
        self.all_tokens = true;
        self
    }

    pub fn with_fault(self, unit_index: usize, fault: Fault) -> Self {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(unit_index, fault);
        }
        self
    }

    pub fn failing_permanently(self, unit_index: usize) -> Self {
        self.with_fault(unit_index, Fault::Permanent)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fault_kind(&self, unit_index: usize) -> Option<Fault> {
        self.faults.lock().ok()?.get(&unit_index).copied()
    }

    fn take_fault(&self, unit_index: usize) -> Option<crate::Error> {
        let mut faults = self.faults.lock().ok()?;
        let fault = faults.get_mut(&unit_index)?;
        match fault {
            Fault::Stall | Fault::Panic => None,
            Fault::Permanent => Some(crate::Error::AlchemyResponse("scripted failure")),
            Fault::RateLimited(0) | Fault::Transient(0) => None,
            Fault::RateLimited(remaining) => {
                *remaining -= 1;
                Some(crate::Error::RateLimited {
                    url: Url::parse("http://scripted.invalid").ok()?,
                    retry_after: Some(Duration::ZERO),
                })
            }
            Fault::Transient(remaining) => {
                *remaining -= 1;
                Some(crate::Error::Timeout(Duration::from_secs(1)))
            }
        }
    }
}

impl BalanceSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch(&self, unit: &PlanUnit) -> crate::Result<Vec<RawBalance>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fault_kind(unit.index) {
            Some(Fault::Stall) => std::future::pending::<()>().await,
            Some(Fault::Panic) => panic!("scripted panic in unit {}", unit.index),
            _ => {}
        }
        if let Some(err) = self.take_fault(unit.index) {
            return Err(err);
        }

        let mut out: Vec<RawBalance> = self
            .balances
            .iter()
            .filter(|balance| unit.wallets.contains(&balance.wallet))
            .filter(|balance| {
                self.all_tokens || unit.tokens.iter().any(|t| t.address == balance.token)
            })
            .cloned()
            .collect();
        out.extend(self.strays.iter().cloned());
        Ok(out)
    }
}
