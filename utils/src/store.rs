//! SQLite backed holder store.
//!
//! Four tables: `nft_collections`, `holders`, `nft_holdings` and `balances`,
//! plus the staging tables of sequential passes (see [`crate::staging`]).
//! Every connection runs in WAL mode with a generous busy timeout so that the
//! analyzer workers, each holding its own connection, can write concurrently
//! while readers (summary, export) keep working.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use alloy::primitives::Address;
use chrono::{DateTime, Utc};
use holdscan_common::token::{parse_address, AddressExt};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::serde::serde_response_parse;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nft_collections (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    contract_address TEXT NOT NULL,
    total_holders INTEGER NOT NULL DEFAULT 0,
    last_fetched TEXT
);

CREATE TABLE IF NOT EXISTS holders (
    id INTEGER PRIMARY KEY,
    address TEXT NOT NULL UNIQUE,
    total_nfts INTEGER NOT NULL DEFAULT 0,
    total_stablecoins REAL NOT NULL DEFAULT 0,
    total_eth REAL NOT NULL DEFAULT 0,
    last_updated TEXT,
    last_analyzed TEXT
);

CREATE TABLE IF NOT EXISTS nft_holdings (
    id INTEGER PRIMARY KEY,
    holder_id INTEGER NOT NULL REFERENCES holders(id) ON DELETE CASCADE,
    collection_id INTEGER NOT NULL REFERENCES nft_collections(id) ON DELETE CASCADE,
    token_count INTEGER NOT NULL DEFAULT 1,
    token_ids TEXT NOT NULL DEFAULT '[]',
    UNIQUE (holder_id, collection_id)
);

CREATE TABLE IF NOT EXISTS balances (
    id INTEGER PRIMARY KEY,
    holder_id INTEGER NOT NULL REFERENCES holders(id) ON DELETE CASCADE,
    token_symbol TEXT NOT NULL,
    amount REAL NOT NULL,
    raw_balance TEXT NOT NULL,
    decimals INTEGER NOT NULL,
    last_updated TEXT NOT NULL,
    UNIQUE (holder_id, token_symbol)
);

CREATE TABLE IF NOT EXISTS analysis_passes (
    id INTEGER PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    units INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS staged_units (
    pass_id INTEGER NOT NULL REFERENCES analysis_passes(id) ON DELETE CASCADE,
    unit_index INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    decode_errors INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (pass_id, unit_index)
);

CREATE TABLE IF NOT EXISTS staged_balances (
    pass_id INTEGER NOT NULL REFERENCES analysis_passes(id) ON DELETE CASCADE,
    unit_index INTEGER NOT NULL,
    wallet TEXT NOT NULL,
    token_symbol TEXT NOT NULL,
    amount REAL NOT NULL,
    raw_balance TEXT NOT NULL,
    decimals INTEGER NOT NULL,
    PRIMARY KEY (pass_id, wallet, token_symbol)
);

CREATE INDEX IF NOT EXISTS idx_balances_holder ON balances(holder_id);
CREATE INDEX IF NOT EXISTS idx_holdings_collection ON nft_holdings(collection_id);
CREATE INDEX IF NOT EXISTS idx_staged_unit ON staged_balances(pass_id, unit_index);
"#;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Wallet {
    pub id: i64,
    pub address: String,
    pub total_nfts: u64,
    pub total_stablecoins: f64,
    pub total_eth: f64,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_analyzed: Option<DateTime<Utc>>,
}

impl Wallet {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            address: row.get(1)?,
            total_nfts: row.get(2)?,
            total_stablecoins: row.get(3)?,
            total_eth: row.get(4)?,
            last_updated: row.get(5)?,
            last_analyzed: row.get(6)?,
        })
    }
}

const WALLET_COLUMNS: &str =
    "id, address, total_nfts, total_stablecoins, total_eth, last_updated, last_analyzed";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BalanceRecord {
    pub token_symbol: String,
    pub amount: f64,
    pub raw_balance: String,
    pub decimals: u8,
    pub last_updated: DateTime<Utc>,
}

impl BalanceRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            token_symbol: row.get(0)?,
            amount: row.get(1)?,
            raw_balance: row.get(2)?,
            decimals: row.get(3)?,
            last_updated: row.get(4)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Collection {
    pub id: i64,
    pub name: String,
    pub contract_address: String,
    pub total_holders: u64,
    pub last_fetched: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Holding {
    pub holder_id: i64,
    pub collection_id: i64,
    pub token_count: u64,
    pub token_ids: Vec<String>,
}

/// One owner of a collection as reported by the ownership index.
#[derive(Clone, Debug, PartialEq)]
pub struct OwnerHolding {
    pub address: Address,
    pub token_ids: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CollectionSaveStats {
    pub total_holders: usize,
    pub new_holders: usize,
    pub new_holdings: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WalletFilter {
    pub limit: Option<usize>,
    /// Only wallets that never completed a reconciliation.
    pub only_unanalyzed: bool,
}

pub const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HolderStore {
    conn: Connection,
}

impl HolderStore {
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::Error::CreateDirAllFailed(parent.to_path_buf(), e))?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| crate::Error::DatabaseOpenFailed(path.clone(), e))?;
        // must come first, switching to WAL takes a lock other workers may hold
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::init(conn)
    }

    pub fn open_in_memory() -> crate::Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| crate::Error::DatabaseOpenFailed(PathBuf::from(":memory:"), e))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> crate::Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Inserts the wallet if unknown and returns its row id.
    pub fn insert_holder(&self, address: &Address) -> crate::Result<i64> {
        insert_holder(&self.conn, address).map(|(id, _)| id)
    }

    pub fn save_collection_holders(
        &mut self,
        name: &str,
        contract_address: &Address,
        owners: &[OwnerHolding],
    ) -> crate::Result<CollectionSaveStats> {
        let tx = self.conn.transaction()?;
        let now = Utc::now();

        tx.execute(
            "INSERT INTO nft_collections (name, contract_address, total_holders, last_fetched)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                contract_address = excluded.contract_address,
                total_holders = excluded.total_holders,
                last_fetched = excluded.last_fetched",
            params![name, contract_address.to_canonical(), owners.len(), now],
        )?;
        let collection_id: i64 = tx.query_row(
            "SELECT id FROM nft_collections WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?;

        let mut stats = CollectionSaveStats {
            total_holders: owners.len(),
            ..Default::default()
        };

        for owner in owners {
            if owner.address == Address::ZERO {
                continue;
            }
            let (holder_id, created) = insert_holder(&tx, &owner.address)?;
            if created {
                stats.new_holders += 1;
            }

            let token_ids = serde_json::to_string(&owner.token_ids)
                .map_err(crate::Error::JsonFormattingFailed)?;
            let existed = tx
                .query_row(
                    "SELECT 1 FROM nft_holdings WHERE holder_id = ?1 AND collection_id = ?2",
                    params![holder_id, collection_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            tx.execute(
                "INSERT INTO nft_holdings (holder_id, collection_id, token_count, token_ids)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(holder_id, collection_id) DO UPDATE SET
                    token_count = excluded.token_count,
                    token_ids = excluded.token_ids",
                params![
                    holder_id,
                    collection_id,
                    owner.token_ids.len().max(1),
                    token_ids
                ],
            )?;
            if !existed {
                stats.new_holdings += 1;
            }
        }

        tx.execute(
            "UPDATE holders SET total_nfts = (
                SELECT COALESCE(SUM(token_count), 0) FROM nft_holdings
                WHERE nft_holdings.holder_id = holders.id
             )",
            [],
        )?;
        tx.commit()?;

        Ok(stats)
    }

    /// Wallet addresses in insertion order.
    pub fn wallets(&self, filter: WalletFilter) -> crate::Result<Vec<Address>> {
        // a negative LIMIT means no limit in SQLite
        let limit = filter
            .limit
            .and_then(|limit| i64::try_from(limit).ok())
            .unwrap_or(-1);

        let mut stmt = self.conn.prepare(
            "SELECT address FROM holders
             WHERE ?1 = 0 OR last_analyzed IS NULL
             ORDER BY id
             LIMIT ?2",
        )?;
        let addresses = stmt
            .query_map(params![filter.only_unanalyzed, limit], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        addresses
            .iter()
            .map(|address| Ok(parse_address(address)?))
            .collect()
    }

    pub fn wallet(&self, address: &Address) -> crate::Result<Option<Wallet>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {WALLET_COLUMNS} FROM holders WHERE address = ?1"),
                [address.to_canonical()],
                Wallet::from_row,
            )
            .optional()?)
    }

    /// All wallets, richest first.
    pub fn all_wallets(&self) -> crate::Result<Vec<Wallet>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WALLET_COLUMNS} FROM holders ORDER BY total_stablecoins DESC, id"
        ))?;
        let wallets = stmt
            .query_map([], Wallet::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(wallets)
    }

    pub fn balances(&self, address: &Address) -> crate::Result<Vec<BalanceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT b.token_symbol, b.amount, b.raw_balance, b.decimals, b.last_updated
             FROM balances b JOIN holders h ON h.id = b.holder_id
             WHERE h.address = ?1
             ORDER BY b.token_symbol",
        )?;
        let records = stmt
            .query_map([address.to_canonical()], BalanceRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Balance records of every wallet keyed by holder id.
    pub fn all_balances(&self) -> crate::Result<HashMap<i64, Vec<BalanceRecord>>> {
        let mut stmt = self.conn.prepare(
            "SELECT holder_id, token_symbol, amount, raw_balance, decimals, last_updated
             FROM balances ORDER BY holder_id, token_symbol",
        )?;
        let mut rows = stmt.query([])?;

        let mut map: HashMap<i64, Vec<BalanceRecord>> = HashMap::new();
        while let Some(row) = rows.next()? {
            let holder_id: i64 = row.get(0)?;
            map.entry(holder_id).or_default().push(BalanceRecord {
                token_symbol: row.get(1)?,
                amount: row.get(2)?,
                raw_balance: row.get(3)?,
                decimals: row.get(4)?,
                last_updated: row.get(5)?,
            });
        }
        Ok(map)
    }

    pub fn collections(&self) -> crate::Result<Vec<Collection>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, contract_address, total_holders, last_fetched
             FROM nft_collections ORDER BY id",
        )?;
        let collections = stmt
            .query_map([], |row| {
                Ok(Collection {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    contract_address: row.get(2)?,
                    total_holders: row.get(3)?,
                    last_fetched: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(collections)
    }

    pub fn holdings(&self) -> crate::Result<Vec<Holding>> {
        let mut stmt = self.conn.prepare(
            "SELECT holder_id, collection_id, token_count, token_ids FROM nft_holdings ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, u64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(holder_id, collection_id, token_count, token_ids)| -> crate::Result<Holding> {
                Ok(Holding {
                    holder_id,
                    collection_id,
                    token_count,
                    token_ids: serde_response_parse(&token_ids)?,
                })
            })
            .collect()
    }

    pub fn count_wallets(&self) -> crate::Result<usize> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM holders", [], |row| row.get(0))?)
    }

    pub fn count_balance_records(&self) -> crate::Result<usize> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM balances", [], |row| row.get(0))?)
    }

    /// Deletes every row, keeping the schema.
    pub fn wipe_all(&mut self) -> crate::Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM staged_balances;
             DELETE FROM staged_units;
             DELETE FROM analysis_passes;
             DELETE FROM balances;
             DELETE FROM nft_holdings;
             DELETE FROM holders;
             DELETE FROM nft_collections;",
        )?;
        tx.commit()?;
        Ok(())
    }
}

/// Returns the holder id and whether the row was created by this call.
fn insert_holder(conn: &Connection, address: &Address) -> crate::Result<(i64, bool)> {
    let address = address.to_canonical();
    let created = conn.execute(
        "INSERT OR IGNORE INTO holders (address) VALUES (?1)",
        [&address],
    )? == 1;
    let id = conn.query_row(
        "SELECT id FROM holders WHERE address = ?1",
        [&address],
        |row| row.get(0),
    )?;
    Ok((id, created))
}
