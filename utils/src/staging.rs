//! Durable staging for sequential passes.
//!
//! A token-broadcast pass only knows the full balance set of a wallet after
//! its last unit. Each finished unit is therefore committed to the staging
//! tables in its own transaction, and the per-wallet wipe-and-replace reads
//! the staged rows back once every unit is in. A crash loses at most the unit
//! in flight; the next run picks the pass up again.

use std::collections::{BTreeSet, HashMap};

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use holdscan_common::token::{parse_address, AddressExt};
use rusqlite::{params, OptionalExtension};

use crate::{engine::UnitOutcome, planner::Plan, reconcile::NewBalance, store::HolderStore};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedPass {
    pub id: i64,
    pub units: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct StagedResults {
    /// Units with a recorded outcome, failed ones included.
    pub completed: BTreeSet<usize>,
    pub failed: BTreeSet<usize>,
    pub decode_errors: usize,
    pub balances: HashMap<Address, Vec<NewBalance>>,
}

impl StagedResults {
    /// The unit landed and does not need to be fetched again.
    pub fn is_done(&self, index: usize) -> bool {
        self.completed.contains(&index) && !self.failed.contains(&index)
    }
}

impl HolderStore {
    /// Starts a new staged pass over `plan`. Unfinished passes are abandoned.
    pub fn begin_pass(&mut self, plan: &Plan) -> crate::Result<StagedPass> {
        let started_at = Utc::now();
        let tx = self.conn_mut().transaction()?;
        tx.execute("DELETE FROM analysis_passes WHERE finished_at IS NULL", [])?;
        tx.execute(
            "INSERT INTO analysis_passes (fingerprint, units, started_at) VALUES (?1, ?2, ?3)",
            params![plan.fingerprint().to_string(), plan.len(), started_at],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(StagedPass {
            id,
            units: plan.len(),
            started_at,
        })
    }

    /// Latest unfinished pass that was started over an identical plan.
    pub fn unfinished_pass(&self, plan: &Plan) -> crate::Result<Option<StagedPass>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, units, started_at FROM analysis_passes
                 WHERE fingerprint = ?1 AND finished_at IS NULL
                 ORDER BY id DESC LIMIT 1",
                [plan.fingerprint().to_string()],
                |row| {
                    Ok(StagedPass {
                        id: row.get(0)?,
                        units: row.get(1)?,
                        started_at: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// Commits the outcome of one unit. Staging the same unit again replaces
    /// what the earlier attempt left.
    pub fn stage_unit(&mut self, pass: &StagedPass, outcome: &UnitOutcome) -> crate::Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "DELETE FROM staged_balances WHERE pass_id = ?1 AND unit_index = ?2",
            params![pass.id, outcome.index],
        )?;

        let (failed, decode_errors) = match &outcome.result {
            Ok(balances) => {
                let mut insert = tx.prepare(
                    "INSERT INTO staged_balances
                        (pass_id, unit_index, wallet, token_symbol, amount, raw_balance, decimals)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(pass_id, wallet, token_symbol) DO UPDATE SET
                        unit_index = excluded.unit_index,
                        amount = excluded.amount,
                        raw_balance = excluded.raw_balance,
                        decimals = excluded.decimals",
                )?;
                for triple in &balances.balances {
                    insert.execute(params![
                        pass.id,
                        outcome.index,
                        triple.wallet.to_canonical(),
                        triple.token.symbol,
                        triple.amount,
                        triple.raw.to_string(),
                        triple.token.decimals
                    ])?;
                }
                (false, balances.decode_errors)
            }
            Err(_) => (true, 0),
        };

        tx.execute(
            "INSERT INTO staged_units (pass_id, unit_index, failed, decode_errors)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(pass_id, unit_index) DO UPDATE SET
                failed = excluded.failed,
                decode_errors = excluded.decode_errors",
            params![pass.id, outcome.index, failed, decode_errors],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn staged_results(&self, pass: &StagedPass) -> crate::Result<StagedResults> {
        let mut results = StagedResults::default();

        let mut stmt = self.conn().prepare(
            "SELECT unit_index, failed, decode_errors FROM staged_units WHERE pass_id = ?1",
        )?;
        let units = stmt
            .query_map([pass.id], |row| {
                Ok((
                    row.get::<_, usize>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, usize>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (index, failed, decode_errors) in units {
            results.completed.insert(index);
            if failed {
                results.failed.insert(index);
            }
            results.decode_errors += decode_errors;
        }

        let mut stmt = self.conn().prepare(
            "SELECT wallet, token_symbol, amount, raw_balance, decimals
             FROM staged_balances WHERE pass_id = ?1
             ORDER BY unit_index, wallet",
        )?;
        let rows = stmt
            .query_map([pass.id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u8>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (wallet, symbol, amount, raw, decimals) in rows {
            let raw = raw
                .parse::<U256>()
                .map_err(|_| crate::Error::CorruptStagedBalance(raw.clone()))?;
            results
                .balances
                .entry(parse_address(&wallet)?)
                .or_default()
                .push(NewBalance {
                    symbol,
                    amount,
                    raw,
                    decimals,
                });
        }

        Ok(results)
    }

    /// Drops the staged rows of a pass whose wallets were reconciled.
    pub fn finish_pass(&mut self, pass: &StagedPass) -> crate::Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute("DELETE FROM staged_balances WHERE pass_id = ?1", [pass.id])?;
        tx.execute("DELETE FROM staged_units WHERE pass_id = ?1", [pass.id])?;
        tx.execute(
            "UPDATE analysis_passes SET finished_at = ?2 WHERE id = ?1",
            params![pass.id, Utc::now()],
        )?;
        tx.commit()?;
        Ok(())
    }
}
