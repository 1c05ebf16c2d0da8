//! Analytics over the holder store and JSON export.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt::{Display, Formatter},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use holdscan_common::token::{Protocol, NATIVE_SYMBOL};
use serde::Serialize;

use crate::{
    registry::TokenRegistry,
    store::{BalanceRecord, Collection, HolderStore, Holding, Wallet},
};

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum WealthTier {
    Whale,
    Dolphin,
    Regular,
    Small,
    Dust,
}

impl WealthTier {
    pub const ALL: [WealthTier; 5] = [
        WealthTier::Whale,
        WealthTier::Dolphin,
        WealthTier::Regular,
        WealthTier::Small,
        WealthTier::Dust,
    ];

    pub fn of(total_stablecoins: f64) -> Self {
        match total_stablecoins {
            x if x >= 1_000_000.0 => WealthTier::Whale,
            x if x >= 100_000.0 => WealthTier::Dolphin,
            x if x >= 10_000.0 => WealthTier::Regular,
            x if x >= 1_000.0 => WealthTier::Small,
            _ => WealthTier::Dust,
        }
    }
}

impl Display for WealthTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            WealthTier::Whale => "Whale (>$1M)",
            WealthTier::Dolphin => "Dolphin ($100K-$1M)",
            WealthTier::Regular => "Regular ($10K-$100K)",
            WealthTier::Small => "Small ($1K-$10K)",
            WealthTier::Dust => "Dust (<$1K)",
        };
        write!(f, "{label}")
    }
}

/// Gini coefficient of `values`: 0 is perfect equality, values near 1 mean
/// a few wallets hold nearly everything.
pub fn gini(values: &[f64]) -> f64 {
    let n = values.len();
    let sum: f64 = values.iter().sum();
    if n < 2 || sum <= 0.0 {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let weighted: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, x)| (i + 1) as f64 * x)
        .sum();
    let n = n as f64;
    (2.0 * weighted) / (n * sum) - (n + 1.0) / n
}

/// DeFi protocols a wallet's balance records touch, via the registry tags.
pub fn protocols_used(records: &[BalanceRecord], registry: &TokenRegistry) -> BTreeSet<Protocol> {
    records
        .iter()
        .filter_map(|record| registry.protocol_of(&record.token_symbol))
        .filter(Protocol::is_defi)
        .collect()
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TierStats {
    pub tier: WealthTier,
    pub holders: usize,
    pub total: f64,
    /// Share of all stablecoin value, in percent.
    pub share: f64,
    pub average: f64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CollectionStats {
    pub name: String,
    pub contract_address: String,
    pub holders: usize,
    pub total_stablecoins: f64,
    pub total_eth: f64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ProtocolStats {
    pub protocol: Protocol,
    pub holders: usize,
    pub value: f64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TokenStats {
    pub symbol: String,
    pub holders: usize,
    pub total: f64,
    pub average: f64,
    /// Receipt of a lending, vault or LP position rather than a plain coin.
    pub yield_bearing: bool,
}

/// Holders of one slice of the collection overlap.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct HolderGroup {
    pub label: String,
    pub holders: usize,
    pub total: f64,
    /// Average over the members with a positive balance.
    pub average_non_zero: f64,
}

impl HolderGroup {
    fn of<'a>(label: String, members: impl Iterator<Item = &'a Wallet>) -> Self {
        let mut group = HolderGroup {
            label,
            holders: 0,
            total: 0.0,
            average_non_zero: 0.0,
        };
        let mut with_balance = 0;
        for wallet in members {
            group.holders += 1;
            if wallet.total_stablecoins > 0.0 {
                group.total += wallet.total_stablecoins;
                with_balance += 1;
            }
        }
        if with_balance > 0 {
            group.average_non_zero = group.total / with_balance as f64;
        }
        group
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CrossoverStats {
    /// Holders of two or more collections.
    pub multi_collection: HolderGroup,
    /// One group per collection, holding nothing from the others.
    pub single_collection: Vec<HolderGroup>,
    /// How many times richer, on average, multi collection holders are than
    /// the mean single collection group.
    pub richness_multiple: Option<f64>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct TopHolder {
    pub address: String,
    pub total_stablecoins: f64,
    pub total_eth: f64,
    pub total_nfts: u64,
    pub tier: WealthTier,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Summary {
    pub generated_at: DateTime<Utc>,
    pub total_holders: usize,
    pub analyzed_holders: usize,
    pub holders_with_assets: usize,
    pub total_stablecoins: f64,
    pub total_eth: f64,
    pub balance_records: usize,
    pub gini: f64,
    pub tiers: Vec<TierStats>,
    pub collections: Vec<CollectionStats>,
    pub protocols: Vec<ProtocolStats>,
    /// Stablecoin tokens by total value, ETH excluded.
    pub tokens: Vec<TokenStats>,
    pub plain_value: f64,
    pub yield_value: f64,
    /// Yield bearing share of the token value, in percent.
    pub yield_share: f64,
    /// Present once at least two collections are stored.
    pub crossover: Option<CrossoverStats>,
    pub top_holders: Vec<TopHolder>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct HolderExport {
    pub address: String,
    pub total_nfts: u64,
    pub total_stablecoins: f64,
    pub total_eth: f64,
    pub tier: WealthTier,
    pub protocols: usize,
    pub last_analyzed: Option<DateTime<Utc>>,
    pub collections: BTreeMap<String, u64>,
    pub balances: BTreeMap<String, f64>,
}

struct Snapshot {
    /// Richest first.
    wallets: Vec<Wallet>,
    balances: HashMap<i64, Vec<BalanceRecord>>,
    collections: Vec<Collection>,
    raw_holdings: Vec<Holding>,
    /// holder id -> (collection name, token count)
    holdings: HashMap<i64, Vec<(String, u64)>>,
}

impl Snapshot {
    fn load(store: &HolderStore) -> crate::Result<Self> {
        let collections = store.collections()?;
        let names: HashMap<i64, &str> = collections
            .iter()
            .map(|collection| (collection.id, collection.name.as_str()))
            .collect();

        let raw_holdings = store.holdings()?;
        let mut holdings: HashMap<i64, Vec<(String, u64)>> = HashMap::new();
        for holding in &raw_holdings {
            if let Some(name) = names.get(&holding.collection_id) {
                holdings
                    .entry(holding.holder_id)
                    .or_default()
                    .push((name.to_string(), holding.token_count));
            }
        }

        Ok(Self {
            wallets: store.all_wallets()?,
            balances: store.all_balances()?,
            collections,
            raw_holdings,
            holdings,
        })
    }

    fn holder_ids_of(&self, collection_id: i64) -> BTreeSet<i64> {
        self.raw_holdings
            .iter()
            .filter(|holding| holding.collection_id == collection_id)
            .map(|holding| holding.holder_id)
            .collect()
    }

    fn records(&self, wallet: &Wallet) -> &[BalanceRecord] {
        self.balances
            .get(&wallet.id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Per token value and holder counts over every stored balance, richest
/// token first. Native ETH is left out.
fn token_stats(snapshot: &Snapshot, registry: &TokenRegistry) -> Vec<TokenStats> {
    let mut by_symbol: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
    for records in snapshot.balances.values() {
        for record in records.iter().filter(|r| r.token_symbol != NATIVE_SYMBOL) {
            let entry = by_symbol.entry(record.token_symbol.as_str()).or_default();
            entry.0 += record.amount;
            entry.1 += 1;
        }
    }

    let mut tokens: Vec<TokenStats> = by_symbol
        .into_iter()
        .filter(|(_, (total, _))| *total > 0.0)
        .map(|(symbol, (total, holders))| TokenStats {
            symbol: symbol.to_string(),
            holders,
            total,
            average: total / holders as f64,
            yield_bearing: registry
                .by_symbol(symbol)
                .is_some_and(|token| token.is_receipt()),
        })
        .collect();
    tokens.sort_by(|a, b| b.total.total_cmp(&a.total));
    tokens
}

fn crossover(snapshot: &Snapshot) -> Option<CrossoverStats> {
    if snapshot.collections.len() < 2 {
        return None;
    }

    let members: Vec<(&Collection, BTreeSet<i64>)> = snapshot
        .collections
        .iter()
        .map(|collection| (collection, snapshot.holder_ids_of(collection.id)))
        .collect();
    let memberships = |id: i64| members.iter().filter(|(_, ids)| ids.contains(&id)).count();

    let multi_collection = HolderGroup::of(
        "multiple collections".to_string(),
        snapshot.wallets.iter().filter(|w| memberships(w.id) >= 2),
    );
    let single_collection: Vec<HolderGroup> = members
        .iter()
        .map(|(collection, ids)| {
            HolderGroup::of(
                format!("{} only", collection.name),
                snapshot
                    .wallets
                    .iter()
                    .filter(|w| ids.contains(&w.id) && memberships(w.id) == 1),
            )
        })
        .collect();

    let single_average = single_collection
        .iter()
        .map(|group| group.average_non_zero)
        .sum::<f64>()
        / single_collection.len() as f64;
    let richness_multiple = (multi_collection.average_non_zero > 0.0 && single_average > 0.0)
        .then(|| multi_collection.average_non_zero / single_average);

    Some(CrossoverStats {
        multi_collection,
        single_collection,
        richness_multiple,
    })
}

pub fn summarize(
    store: &HolderStore,
    registry: &TokenRegistry,
    top_n: usize,
) -> crate::Result<Summary> {
    let snapshot = Snapshot::load(store)?;
    let wallets = &snapshot.wallets;

    let total_stablecoins: f64 = wallets.iter().map(|w| w.total_stablecoins).sum();
    let total_eth: f64 = wallets.iter().map(|w| w.total_eth).sum();

    let tiers = WealthTier::ALL
        .iter()
        .map(|tier| {
            let members: Vec<f64> = wallets
                .iter()
                .filter(|w| w.last_analyzed.is_some() && WealthTier::of(w.total_stablecoins) == *tier)
                .map(|w| w.total_stablecoins)
                .collect();
            let total: f64 = members.iter().sum();
            TierStats {
                tier: *tier,
                holders: members.len(),
                total,
                share: if total_stablecoins > 0.0 {
                    total / total_stablecoins * 100.0
                } else {
                    0.0
                },
                average: if members.is_empty() {
                    0.0
                } else {
                    total / members.len() as f64
                },
            }
        })
        .collect();

    let mut collections: Vec<CollectionStats> = snapshot
        .collections
        .iter()
        .map(|collection| CollectionStats {
            name: collection.name.clone(),
            contract_address: collection.contract_address.clone(),
            holders: 0,
            total_stablecoins: 0.0,
            total_eth: 0.0,
        })
        .collect();
    for wallet in wallets {
        for (name, _) in snapshot.holdings.get(&wallet.id).into_iter().flatten() {
            if let Some(stats) = collections.iter_mut().find(|c| &c.name == name) {
                stats.holders += 1;
                stats.total_stablecoins += wallet.total_stablecoins;
                stats.total_eth += wallet.total_eth;
            }
        }
    }

    let mut by_protocol: BTreeMap<Protocol, ProtocolStats> = BTreeMap::new();
    for wallet in wallets {
        let mut seen = BTreeSet::new();
        for record in snapshot.records(wallet) {
            let Some(protocol) = registry.protocol_of(&record.token_symbol) else {
                continue;
            };
            if !protocol.is_defi() {
                continue;
            }
            let stats = by_protocol.entry(protocol).or_insert(ProtocolStats {
                protocol,
                holders: 0,
                value: 0.0,
            });
            stats.value += record.amount;
            if seen.insert(protocol) {
                stats.holders += 1;
            }
        }
    }
    let mut protocols: Vec<ProtocolStats> = by_protocol.into_values().collect();
    protocols.sort_by(|a, b| b.value.total_cmp(&a.value));

    let positive: Vec<f64> = wallets
        .iter()
        .map(|w| w.total_stablecoins)
        .filter(|total| *total > 0.0)
        .collect();

    let tokens = token_stats(&snapshot, registry);
    let yield_value: f64 = tokens
        .iter()
        .filter(|t| t.yield_bearing)
        .map(|t| t.total)
        .sum();
    let plain_value: f64 = tokens
        .iter()
        .filter(|t| !t.yield_bearing)
        .map(|t| t.total)
        .sum();
    let yield_share = if plain_value + yield_value > 0.0 {
        yield_value / (plain_value + yield_value) * 100.0
    } else {
        0.0
    };

    Ok(Summary {
        generated_at: Utc::now(),
        total_holders: wallets.len(),
        analyzed_holders: wallets.iter().filter(|w| w.last_analyzed.is_some()).count(),
        holders_with_assets: wallets
            .iter()
            .filter(|w| w.total_stablecoins > 0.0 || w.total_eth > 0.0)
            .count(),
        total_stablecoins,
        total_eth,
        balance_records: store.count_balance_records()?,
        gini: gini(&positive),
        tiers,
        collections,
        protocols,
        tokens,
        plain_value,
        yield_value,
        yield_share,
        crossover: crossover(&snapshot),
        // all_wallets is ordered richest first
        top_holders: wallets
            .iter()
            .take(top_n)
            .map(|w| TopHolder {
                address: w.address.clone(),
                total_stablecoins: w.total_stablecoins,
                total_eth: w.total_eth,
                total_nfts: w.total_nfts,
                tier: WealthTier::of(w.total_stablecoins),
            })
            .collect(),
    })
}

fn holder_export(snapshot: &Snapshot, registry: &TokenRegistry, wallet: &Wallet) -> HolderExport {
    let records = snapshot.records(wallet);
    HolderExport {
        address: wallet.address.clone(),
        total_nfts: wallet.total_nfts,
        total_stablecoins: wallet.total_stablecoins,
        total_eth: wallet.total_eth,
        tier: WealthTier::of(wallet.total_stablecoins),
        protocols: protocols_used(records, registry).len(),
        last_analyzed: wallet.last_analyzed,
        collections: snapshot
            .holdings
            .get(&wallet.id)
            .into_iter()
            .flatten()
            .cloned()
            .collect(),
        balances: records
            .iter()
            .map(|record| (record.token_symbol.clone(), record.amount))
            .collect(),
    }
}

/// One holder of a single collection.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CollectionHolderExport {
    pub address: String,
    pub token_count: u64,
    pub token_ids: Vec<String>,
    pub total_stablecoins: f64,
    pub balances: BTreeMap<String, f64>,
}

/// Holders of the named collection, richest first. `None` if the collection
/// is unknown.
fn collection_rows(snapshot: &Snapshot, name: &str) -> Option<Vec<CollectionHolderExport>> {
    let collection = snapshot.collections.iter().find(|c| c.name == name)?;
    let by_holder: HashMap<i64, &Holding> = snapshot
        .raw_holdings
        .iter()
        .filter(|holding| holding.collection_id == collection.id)
        .map(|holding| (holding.holder_id, holding))
        .collect();

    Some(
        snapshot
            .wallets
            .iter()
            .filter_map(|wallet| {
                let holding = by_holder.get(&wallet.id)?;
                Some(CollectionHolderExport {
                    address: wallet.address.clone(),
                    token_count: holding.token_count,
                    token_ids: holding.token_ids.clone(),
                    total_stablecoins: wallet.total_stablecoins,
                    balances: snapshot
                        .records(wallet)
                        .iter()
                        .map(|record| (record.token_symbol.clone(), record.amount))
                        .collect(),
                })
            })
            .collect(),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportPaths {
    pub holders: PathBuf,
    pub top_holders: PathBuf,
    pub collections: Vec<PathBuf>,
    pub summary: PathBuf,
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> crate::Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(crate::Error::JsonFormattingFailed)?;
    std::fs::write(path, json).map_err(|e| crate::Error::FileWriteFailed(path.to_path_buf(), e))
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Writes into `dir`, all stamped with the same `<ts>`:
///
/// - `holders_<ts>.json`: every holder
/// - `top_<n>_holders_<ts>.json`: the `top_n` richest holders
/// - `<collection>_holders_<ts>.json`: one file per collection
/// - `summary_<ts>.json`
pub fn export_json(
    store: &HolderStore,
    registry: &TokenRegistry,
    dir: &Path,
    top_n: usize,
) -> crate::Result<ExportPaths> {
    std::fs::create_dir_all(dir).map_err(|e| crate::Error::CreateDirAllFailed(dir.to_path_buf(), e))?;

    let snapshot = Snapshot::load(store)?;
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let mut paths = ExportPaths {
        holders: dir.join(format!("holders_{timestamp}.json")),
        top_holders: dir.join(format!("top_{top_n}_holders_{timestamp}.json")),
        collections: Vec::with_capacity(snapshot.collections.len()),
        summary: dir.join(format!("summary_{timestamp}.json")),
    };

    let holders: Vec<HolderExport> = snapshot
        .wallets
        .iter()
        .map(|wallet| holder_export(&snapshot, registry, wallet))
        .collect();
    write_json(&paths.holders, &holders)?;
    write_json(&paths.top_holders, &holders[..top_n.min(holders.len())])?;

    for collection in &snapshot.collections {
        let rows = collection_rows(&snapshot, &collection.name).unwrap_or_default();
        let path = dir.join(format!(
            "{}_holders_{timestamp}.json",
            file_stem(&collection.name)
        ));
        write_json(&path, &rows)?;
        log::info!("exported {} holders of {}", rows.len(), collection.name);
        paths.collections.push(path);
    }

    write_json(&paths.summary, &summarize(store, registry, top_n)?)?;

    log::info!(
        "exported {} holders to {}",
        holders.len(),
        paths.holders.display()
    );
    Ok(paths)
}
