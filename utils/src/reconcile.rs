use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use holdscan_common::token::{AddressExt, NATIVE_SYMBOL};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{engine::BalanceTriple, store::HolderStore};

#[derive(Clone, Debug, PartialEq)]
pub struct NewBalance {
    pub symbol: String,
    pub amount: f64,
    pub raw: U256,
    pub decimals: u8,
}

impl From<&BalanceTriple> for NewBalance {
    fn from(triple: &BalanceTriple) -> Self {
        Self {
            symbol: triple.token.symbol.clone(),
            amount: triple.amount,
            raw: triple.raw,
            decimals: triple.token.decimals,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WalletTotals {
    /// Sum of every non-native balance record.
    pub total_stablecoins: f64,
    pub total_eth: f64,
    pub records: usize,
}

/// Replaces all balance records of `wallet` with `balances` and rewrites the
/// wallet totals, in one transaction. Either everything lands or nothing does.
pub fn reconcile_wallet(
    conn: &mut Connection,
    wallet: &Address,
    balances: &[NewBalance],
    now: DateTime<Utc>,
) -> crate::Result<WalletTotals> {
    let address = wallet.to_canonical();
    let tx = conn.transaction()?;

    let holder_id: i64 = tx
        .query_row(
            "SELECT id FROM holders WHERE address = ?1",
            [&address],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| crate::Error::WalletNotFound(wallet.to_canonical()))?;

    tx.execute("DELETE FROM balances WHERE holder_id = ?1", [holder_id])?;

    {
        let mut insert = tx.prepare(
            "INSERT INTO balances (holder_id, token_symbol, amount, raw_balance, decimals, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(holder_id, token_symbol) DO UPDATE SET
                amount = excluded.amount,
                raw_balance = excluded.raw_balance,
                decimals = excluded.decimals,
                last_updated = excluded.last_updated",
        )?;
        for balance in balances.iter().filter(|b| b.amount > 0.0) {
            insert.execute(params![
                holder_id,
                balance.symbol,
                balance.amount,
                balance.raw.to_string(),
                balance.decimals,
                now
            ])?;
        }
    }

    let (total_stablecoins, total_eth, records): (f64, f64, usize) = tx.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN token_symbol != ?2 THEN amount END), 0.0),
            COALESCE(SUM(CASE WHEN token_symbol = ?2 THEN amount END), 0.0),
            COUNT(*)
         FROM balances WHERE holder_id = ?1",
        params![holder_id, NATIVE_SYMBOL],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    tx.execute(
        "UPDATE holders
         SET total_stablecoins = ?2, total_eth = ?3, last_updated = ?4, last_analyzed = ?4
         WHERE id = ?1",
        params![holder_id, total_stablecoins, total_eth, now],
    )?;
    tx.commit()?;

    Ok(WalletTotals {
        total_stablecoins,
        total_eth,
        records,
    })
}

impl HolderStore {
    pub fn reconcile(
        &mut self,
        wallet: &Address,
        balances: &[NewBalance],
    ) -> crate::Result<WalletTotals> {
        reconcile_wallet(self.conn_mut(), wallet, balances, Utc::now())
    }
}
