//! One aggregation pass: execute a plan and reconcile the results.
//!
//! The sequential pass runs a token-broadcast plan, where a wallet's balances
//! are spread over many units. Every finished unit is staged durably and the
//! wallets are reconciled from the staged rows once all units are in, so an
//! interrupted pass can be resumed without refetching. The concurrent pass
//! only accepts wallet-grouped plans, where each unit carries the full token
//! set of its wallets and can be reconciled as soon as it lands.

use std::{
    collections::{HashMap, HashSet},
    fmt::{Display, Formatter},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use alloy::primitives::Address;

use crate::{
    engine::{AggregationEngine, BalanceSource, BalanceTriple},
    planner::{Plan, Strategy},
    reconcile::NewBalance,
    store::HolderStore,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Distinct wallets in the plan.
    pub considered: usize,
    pub analyzed: usize,
    pub errored: usize,
    pub units: usize,
    pub failed_units: usize,
    pub decode_errors: usize,
    pub records_written: usize,
}

impl Display for PassSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} wallets considered, {} analyzed, {} errored; {} units ({} failed), {} decode errors, {} balance records",
            self.considered,
            self.analyzed,
            self.errored,
            self.units,
            self.failed_units,
            self.decode_errors,
            self.records_written
        )
    }
}

/// Snapshot handed to progress callbacks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassProgress {
    pub units_done: usize,
    pub units_total: usize,
    pub analyzed: usize,
    pub errored: usize,
}

#[derive(Debug, Default)]
struct PassStats {
    units_done: AtomicUsize,
    failed_units: AtomicUsize,
    analyzed: AtomicUsize,
    errored: AtomicUsize,
    decode_errors: AtomicUsize,
    records_written: AtomicUsize,
}

impl PassStats {
    fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn progress(&self, units_total: usize) -> PassProgress {
        PassProgress {
            units_done: self.units_done.load(Ordering::Relaxed),
            units_total,
            analyzed: self.analyzed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
        }
    }

    fn summary(&self, considered: usize) -> PassSummary {
        PassSummary {
            considered,
            analyzed: self.analyzed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            units: self.units_done.load(Ordering::Relaxed),
            failed_units: self.failed_units.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
        }
    }
}

fn group_by_wallet(balances: &[BalanceTriple]) -> HashMap<Address, Vec<NewBalance>> {
    let mut grouped: HashMap<Address, Vec<NewBalance>> = HashMap::new();
    for triple in balances {
        grouped
            .entry(triple.wallet)
            .or_default()
            .push(NewBalance::from(triple));
    }
    grouped
}

fn reconcile_into(
    store: &mut HolderStore,
    stats: &PassStats,
    wallet: &Address,
    balances: &[NewBalance],
) {
    match store.reconcile(wallet, balances) {
        Ok(totals) => {
            PassStats::add(&stats.analyzed, 1);
            PassStats::add(&stats.records_written, totals.records);
        }
        Err(err) => {
            log::error!("reconciling {wallet} failed: {err}");
            PassStats::add(&stats.errored, 1);
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SequentialOptions {
    /// Continue the latest unfinished pass over the same plan instead of
    /// starting over. Units it already staged are not fetched again.
    pub resume: bool,
    /// Skip units before this index.
    pub start_unit: usize,
}

/// Runs the units in order, staging each one as it lands, then reconciles
/// every wallet whose units all landed. Wallets touched by a failed or
/// skipped unit keep their previous state and count as errored.
pub async fn run_sequential<S: BalanceSource>(
    engine: &AggregationEngine<S>,
    store: &mut HolderStore,
    plan: &Plan,
    options: SequentialOptions,
    mut on_progress: impl FnMut(PassProgress),
) -> crate::Result<PassSummary> {
    let resumed = if options.resume {
        store.unfinished_pass(plan)?
    } else {
        None
    };
    let pass = match resumed {
        Some(pass) => {
            log::info!("resuming pass {} started at {}", pass.id, pass.started_at);
            pass
        }
        None => store.begin_pass(plan)?,
    };

    let staged = store.staged_results(&pass)?;
    let stats = PassStats::default();
    PassStats::add(&stats.units_done, staged.completed.len());

    for unit in plan.units_from(options.start_unit) {
        if staged.is_done(unit.index) {
            continue;
        }
        let outcome = engine.execute_unit(unit).await;
        store.stage_unit(&pass, &outcome)?;
        if !staged.completed.contains(&unit.index) {
            PassStats::add(&stats.units_done, 1);
        }
        on_progress(stats.progress(plan.len()));
    }

    let mut staged = store.staged_results(&pass)?;
    PassStats::add(&stats.failed_units, staged.failed.len());
    PassStats::add(&stats.decode_errors, staged.decode_errors);

    let incomplete: HashSet<Address> = plan
        .units
        .iter()
        .filter(|unit| !staged.is_done(unit.index))
        .flat_map(|unit| unit.wallets.iter().copied())
        .collect();

    for wallet in &plan.wallets {
        if incomplete.contains(wallet) {
            PassStats::add(&stats.errored, 1);
            continue;
        }
        let balances = staged.balances.remove(wallet).unwrap_or_default();
        reconcile_into(store, &stats, wallet, &balances);
    }
    store.finish_pass(&pass)?;

    let summary = stats.summary(plan.wallets.len());
    log::info!("sequential pass done: {summary}");
    Ok(summary)
}

pub struct ConcurrentOptions {
    pub workers: usize,
    pub db_path: PathBuf,
    /// Skip units before this index, e.g. when resuming an interrupted pass.
    pub start_unit: usize,
}

/// Fans a wallet-grouped plan out over a fixed pool of tokio workers. Each
/// worker owns its own store connection and reconciles the wallets of a unit
/// right after fetching it. All workers are joined before returning, even
/// when one of them fails.
pub async fn run_concurrent<S>(
    engine: Arc<AggregationEngine<S>>,
    plan: Arc<Plan>,
    options: ConcurrentOptions,
    on_progress: impl Fn(PassProgress) + Send + Sync + 'static,
) -> crate::Result<PassSummary>
where
    S: BalanceSource + 'static,
{
    if !matches!(plan.strategy, Strategy::WalletGrouped { .. }) {
        return Err(crate::Error::PlanNotWalletGrouped);
    }

    let workers = options.workers.max(1);
    let stores = (0..workers)
        .map(|_| HolderStore::open(&options.db_path))
        .collect::<crate::Result<Vec<_>>>()?;

    let cursor = Arc::new(AtomicUsize::new(options.start_unit));
    let stats = Arc::new(PassStats::default());
    let on_progress = Arc::new(on_progress);

    let mut handles = Vec::with_capacity(workers);
    for (worker, mut store) in stores.into_iter().enumerate() {
        let engine = Arc::clone(&engine);
        let plan = Arc::clone(&plan);
        let cursor = Arc::clone(&cursor);
        let stats = Arc::clone(&stats);
        let on_progress = Arc::clone(&on_progress);

        handles.push(tokio::spawn(async move {
            loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(unit) = plan.units.get(index) else {
                    break;
                };

                let outcome = engine.execute_unit(unit).await;
                match outcome.result {
                    Ok(balances) => {
                        PassStats::add(&stats.decode_errors, balances.decode_errors);
                        let mut grouped = group_by_wallet(&balances.balances);
                        for wallet in &unit.wallets {
                            let records = grouped.remove(wallet).unwrap_or_default();
                            reconcile_into(&mut store, &stats, wallet, &records);
                        }
                    }
                    Err(_) => {
                        PassStats::add(&stats.failed_units, 1);
                        PassStats::add(&stats.errored, unit.wallets.len());
                    }
                }
                PassStats::add(&stats.units_done, 1);
                on_progress(stats.progress(plan.len()));
            }
            log::debug!("worker {worker} finished");
        }));
    }

    let mut first_error = None;
    for handle in handles {
        if let Err(err) = handle.await {
            log::error!("worker failed: {err}");
            if first_error.is_none() {
                first_error = Some(crate::Error::WorkerFailed(err));
            }
        }
    }

    let summary = stats.summary(plan.wallets.len());
    if let Some(err) = first_error {
        log::error!("concurrent pass aborted after: {summary}");
        return Err(err);
    }
    log::info!("concurrent pass done: {summary}");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use alloy::primitives::U256;
    use holdscan_common::token::NATIVE_SENTINEL;

    use super::*;
    use crate::{
        engine::RawValue,
        registry::TokenRegistry,
        retry::RetryPolicy,
        testutils::{Fault, ScriptedSource},
    };

    fn wallet(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn setup(wallets: &[Address]) -> (Arc<TokenRegistry>, HolderStore) {
        let registry = Arc::new(TokenRegistry::builtin().unwrap());
        let store = HolderStore::open_in_memory().unwrap();
        for w in wallets {
            store.insert_holder(w).unwrap();
        }
        (registry, store)
    }

    fn address_of(registry: &TokenRegistry, symbol: &str) -> Address {
        registry.by_symbol(symbol).unwrap().address
    }

    fn broadcast(width: usize) -> Strategy {
        Strategy::TokenBroadcast {
            wallets_per_call: width,
        }
    }

    fn grouped(width: usize) -> Strategy {
        Strategy::WalletGrouped {
            wallets_per_call: width,
        }
    }

    async fn run_fresh<S: BalanceSource>(
        engine: &AggregationEngine<S>,
        store: &mut HolderStore,
        plan: &Plan,
    ) -> PassSummary {
        run_sequential(engine, store, plan, SequentialOptions::default(), |_| {})
            .await
            .unwrap()
    }

    /// File backed store holding `wallets`, for passes that open their own
    /// connections.
    fn file_store(dir: &tempfile::TempDir, wallets: &[Address]) -> PathBuf {
        let db_path = dir.path().join("holders.db");
        let store = HolderStore::open(&db_path).unwrap();
        for w in wallets {
            store.insert_holder(w).unwrap();
        }
        db_path
    }

    fn options(db_path: &std::path::Path, workers: usize, start_unit: usize) -> ConcurrentOptions {
        ConcurrentOptions {
            workers,
            db_path: db_path.to_path_buf(),
            start_unit,
        }
    }

    #[tokio::test]
    async fn test_sequential_pass_is_idempotent() {
        let wallets = [wallet(1), wallet(2), wallet(3)];
        let (registry, mut store) = setup(&wallets);
        let source = ScriptedSource::default()
            .with_balance(
                wallet(1),
                address_of(&registry, "USDC"),
                RawValue::Integer(U256::from(5_000_000)),
            )
            .with_balance(
                wallet(1),
                address_of(&registry, "DAI"),
                RawValue::Integer(U256::from(2_500_000_000_000_000_000u128)),
            )
            .with_balance(
                wallet(1),
                NATIVE_SENTINEL,
                RawValue::Integer(U256::from(1_000_000_000_000_000_000u128)),
            )
            .with_balance(
                wallet(3),
                address_of(&registry, "USDT"),
                RawValue::Integer(U256::from(1_000_000)),
            );
        let engine = AggregationEngine::new(source, registry.clone(), RetryPolicy::immediate(3));
        let plan = Plan::build(&wallets, &registry, broadcast(2)).unwrap();

        let mut ticks = 0;
        let first = run_sequential(
            &engine,
            &mut store,
            &plan,
            SequentialOptions::default(),
            |_| ticks += 1,
        )
        .await
        .unwrap();
        assert_eq!(ticks, plan.len());
        assert_eq!(first.considered, 3);
        assert_eq!(first.analyzed, 3);
        assert_eq!(first.errored, 0);
        assert_eq!(first.records_written, 4);

        let w1 = store.wallet(&wallet(1)).unwrap().unwrap();
        assert_eq!(w1.total_stablecoins, 7.5);
        assert_eq!(w1.total_eth, 1.0);

        // all-zero wallet: analyzed, no records
        let w2 = store.wallet(&wallet(2)).unwrap().unwrap();
        assert_eq!(w2.total_stablecoins, 0.0);
        assert!(w2.last_analyzed.is_some());
        assert!(store.balances(&wallet(2)).unwrap().is_empty());

        let records_before = store.balances(&wallet(1)).unwrap();
        let second = run_fresh(&engine, &mut store, &plan).await;
        assert_eq!(second, first);

        let records_after = store.balances(&wallet(1)).unwrap();
        assert_eq!(records_before.len(), records_after.len());
        for (before, after) in records_before.iter().zip(&records_after) {
            assert_eq!(before.token_symbol, after.token_symbol);
            assert_eq!(before.amount, after.amount);
            assert_eq!(before.raw_balance, after.raw_balance);
        }
        assert_eq!(store.count_balance_records().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_failed_unit_leaves_its_wallets_untouched() {
        let wallets = [wallet(1), wallet(2), wallet(3)];
        let (registry, mut store) = setup(&wallets);

        // previous state of wallet 3
        store
            .reconcile(
                &wallet(3),
                &[NewBalance {
                    symbol: "USDC".to_string(),
                    amount: 42.0,
                    raw: U256::from(42_000_000),
                    decimals: 6,
                }],
            )
            .unwrap();

        // units: [w1, w2] and [w3] per token; unit 1 is the first token's [w3]
        let source = ScriptedSource::default()
            .with_balance(
                wallet(1),
                address_of(&registry, "USDC"),
                RawValue::Integer(U256::from(5_000_000)),
            )
            .with_balance(
                wallet(3),
                address_of(&registry, "USDT"),
                RawValue::Integer(U256::from(9_000_000)),
            )
            .failing_permanently(1);
        let engine = AggregationEngine::new(source, registry.clone(), RetryPolicy::immediate(3));
        let plan = Plan::build(&wallets, &registry, broadcast(2)).unwrap();
        assert_eq!(plan.units[1].wallets, vec![wallet(3)]);

        let summary = run_fresh(&engine, &mut store, &plan).await;
        assert_eq!(summary.failed_units, 1);
        assert_eq!(summary.analyzed, 2);
        assert_eq!(summary.errored, 1);

        let w3 = store.wallet(&wallet(3)).unwrap().unwrap();
        assert_eq!(w3.total_stablecoins, 42.0);
        assert_eq!(store.balances(&wallet(3)).unwrap()[0].token_symbol, "USDC");

        let w1 = store.wallet(&wallet(1)).unwrap().unwrap();
        assert_eq!(w1.total_stablecoins, 5.0);
    }

    #[tokio::test]
    async fn test_rate_limited_unit_counts_once() {
        let wallets = [wallet(1)];
        let (registry, mut store) = setup(&wallets);
        let source = ScriptedSource::default()
            .with_balance(
                wallet(1),
                address_of(&registry, "USDC"),
                RawValue::Hex("0x4c4b40".to_string()),
            )
            .with_fault(0, Fault::RateLimited(2))
            .with_fault(1, Fault::Transient(1));
        let engine = AggregationEngine::new(source, registry.clone(), RetryPolicy::immediate(3));
        let plan = Plan::build(&wallets, &registry, broadcast(10)).unwrap();

        let summary = run_fresh(&engine, &mut store, &plan).await;
        assert_eq!(summary.failed_units, 0);
        assert_eq!(engine.source().calls(), plan.len() + 3);

        let records = store.balances(&wallet(1)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].amount, 5.0);
        assert_eq!(records[0].raw_balance, "5000000");
        assert_eq!(
            store.wallet(&wallet(1)).unwrap().unwrap().total_stablecoins,
            5.0
        );
    }

    #[tokio::test]
    async fn test_concurrent_pass() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TokenRegistry::builtin().unwrap());
        let wallets: Vec<Address> = (1..=7).map(wallet).collect();
        let db_path = file_store(&dir, &wallets);

        let mut source = ScriptedSource::default();
        for w in &wallets {
            source = source.with_balance(
                *w,
                address_of(&registry, "USDC"),
                RawValue::Integer(U256::from(1_000_000)),
            );
        }
        // units: [1,2,3] [4,5,6] [7]
        let source = source.failing_permanently(1);
        let engine = Arc::new(AggregationEngine::new(
            source,
            registry.clone(),
            RetryPolicy::immediate(3),
        ));
        let plan = Arc::new(Plan::build(&wallets, &registry, grouped(3)).unwrap());

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let summary = run_concurrent(
            engine,
            plan,
            options(&db_path, 2, 0),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await
        .unwrap();

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(summary.units, 3);
        assert_eq!(summary.failed_units, 1);
        assert_eq!(summary.analyzed, 4);
        assert_eq!(summary.errored, 3);

        let store = HolderStore::open(&db_path).unwrap();
        assert_eq!(store.count_balance_records().unwrap(), 4);
        assert!(store
            .wallet(&wallet(5))
            .unwrap()
            .unwrap()
            .last_analyzed
            .is_none());
        assert_eq!(
            store.wallet(&wallet(7)).unwrap().unwrap().total_stablecoins,
            1.0
        );
    }

    #[tokio::test]
    async fn test_concurrent_rejects_token_broadcast() {
        let registry = Arc::new(TokenRegistry::builtin().unwrap());
        let engine = Arc::new(AggregationEngine::new(
            ScriptedSource::default(),
            registry.clone(),
            RetryPolicy::immediate(3),
        ));
        let plan = Arc::new(Plan::build(&[wallet(1)], &registry, broadcast(10)).unwrap());
        let result = run_concurrent(
            engine,
            plan,
            options(std::path::Path::new("unused.db"), 2, 0),
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(crate::Error::PlanNotWalletGrouped)));
    }

    #[tokio::test]
    async fn test_interrupted_pass_resumes_from_staged_units() {
        let wallets = [wallet(1)];
        let (registry, mut store) = setup(&wallets);
        let plan = Plan::build(&wallets, &registry, broadcast(10)).unwrap();

        // one token per unit, each balance worth exactly 1.0
        let one_of_each = || {
            plan.units
                .iter()
                .fold(ScriptedSource::default(), |source, unit| {
                    let token = &unit.tokens[0];
                    let raw = U256::from(10u128.pow(u32::from(token.decimals)));
                    source.with_balance(wallet(1), token.address, RawValue::Integer(raw))
                })
        };

        let engine = AggregationEngine::new(
            one_of_each().with_fault(10, Fault::Stall),
            registry.clone(),
            RetryPolicy::immediate(3),
        );
        let interrupted = tokio::time::timeout(
            Duration::from_millis(300),
            run_sequential(
                &engine,
                &mut store,
                &plan,
                SequentialOptions::default(),
                |_| {},
            ),
        )
        .await;
        assert!(interrupted.is_err());
        assert_eq!(engine.source().calls(), 11);

        let pass = store.unfinished_pass(&plan).unwrap().unwrap();
        let staged = store.staged_results(&pass).unwrap();
        assert_eq!(staged.completed.len(), 10);
        assert_eq!(staged.balances[&wallet(1)].len(), 10);

        // no partial token set is visible as the wallet's total
        let w1 = store.wallet(&wallet(1)).unwrap().unwrap();
        assert!(w1.last_analyzed.is_none());
        assert_eq!(w1.total_stablecoins, 0.0);
        assert_eq!(store.count_balance_records().unwrap(), 0);

        let engine =
            AggregationEngine::new(one_of_each(), registry.clone(), RetryPolicy::immediate(3));
        let summary = run_sequential(
            &engine,
            &mut store,
            &plan,
            SequentialOptions {
                resume: true,
                start_unit: 0,
            },
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(engine.source().calls(), plan.len() - 10);
        assert_eq!(summary.units, plan.len());
        assert_eq!(summary.analyzed, 1);
        assert_eq!(summary.errored, 0);

        let w1 = store.wallet(&wallet(1)).unwrap().unwrap();
        assert_eq!(w1.total_stablecoins, (plan.len() - 1) as f64);
        assert_eq!(w1.total_eth, 1.0);
        assert_eq!(store.count_balance_records().unwrap(), plan.len());
        assert!(store.unfinished_pass(&plan).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sequential_start_unit_skips_earlier_units() {
        let wallets = [wallet(1), wallet(2), wallet(3)];
        let (registry, mut store) = setup(&wallets);
        let source = ScriptedSource::default().with_balance(
            wallet(3),
            address_of(&registry, "USDC"),
            RawValue::Integer(U256::from(3_000_000)),
        );
        let engine = AggregationEngine::new(source, registry.clone(), RetryPolicy::immediate(3));
        // units: [w1, w2] and [w3] per token
        let plan = Plan::build(&wallets, &registry, broadcast(2)).unwrap();

        let summary = run_sequential(
            &engine,
            &mut store,
            &plan,
            SequentialOptions {
                resume: false,
                start_unit: 1,
            },
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(engine.source().calls(), plan.len() - 1);
        assert_eq!(summary.units, plan.len() - 1);
        assert_eq!(summary.analyzed, 1);
        assert_eq!(summary.errored, 2);
        assert!(store.wallet(&wallet(1)).unwrap().unwrap().last_analyzed.is_none());
        assert_eq!(
            store.wallet(&wallet(3)).unwrap().unwrap().total_stablecoins,
            3.0
        );
    }

    #[tokio::test]
    async fn test_sequential_reconcile_failure_is_counted() {
        // wallet 2 is planned but missing from the store
        let (registry, mut store) = setup(&[wallet(1), wallet(3)]);
        let wallets = [wallet(1), wallet(2), wallet(3)];
        let usdc = address_of(&registry, "USDC");
        let source = ScriptedSource::default()
            .with_balance(wallet(1), usdc, RawValue::Integer(U256::from(5_000_000)))
            .with_balance(wallet(2), usdc, RawValue::Integer(U256::from(1_000_000)))
            .with_balance(wallet(3), usdc, RawValue::Integer(U256::from(9_000_000)));
        let engine = AggregationEngine::new(source, registry.clone(), RetryPolicy::immediate(3));
        let plan = Plan::build(&wallets, &registry, broadcast(2)).unwrap();

        let summary = run_fresh(&engine, &mut store, &plan).await;
        assert_eq!(summary.failed_units, 0);
        assert_eq!(summary.analyzed, 2);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.records_written, 2);

        assert!(store.wallet(&wallet(2)).unwrap().is_none());
        assert_eq!(store.wallet(&wallet(1)).unwrap().unwrap().total_stablecoins, 5.0);
        assert_eq!(store.wallet(&wallet(3)).unwrap().unwrap().total_stablecoins, 9.0);
    }

    #[tokio::test]
    async fn test_concurrent_reconcile_failure_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TokenRegistry::builtin().unwrap());
        let db_path = file_store(&dir, &[wallet(1), wallet(3)]);
        let wallets = [wallet(1), wallet(2), wallet(3)];

        let usdc = address_of(&registry, "USDC");
        let source = ScriptedSource::default()
            .with_balance(wallet(1), usdc, RawValue::Integer(U256::from(5_000_000)))
            .with_balance(wallet(2), usdc, RawValue::Integer(U256::from(1_000_000)))
            .with_balance(wallet(3), usdc, RawValue::Integer(U256::from(9_000_000)));
        let engine = Arc::new(AggregationEngine::new(
            source,
            registry.clone(),
            RetryPolicy::immediate(3),
        ));
        let plan = Arc::new(Plan::build(&wallets, &registry, grouped(3)).unwrap());

        let summary = run_concurrent(engine, plan, options(&db_path, 2, 0), |_| {})
            .await
            .unwrap();
        assert_eq!(summary.failed_units, 0);
        assert_eq!(summary.analyzed, 2);
        assert_eq!(summary.errored, 1);

        let store = HolderStore::open(&db_path).unwrap();
        assert!(store.wallet(&wallet(2)).unwrap().is_none());
        assert_eq!(store.wallet(&wallet(1)).unwrap().unwrap().total_stablecoins, 5.0);
        assert_eq!(store.wallet(&wallet(3)).unwrap().unwrap().total_stablecoins, 9.0);
    }

    #[tokio::test]
    async fn test_concurrent_joins_every_worker_when_one_panics() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TokenRegistry::builtin().unwrap());
        let wallets: Vec<Address> = (1..=7).map(wallet).collect();
        let db_path = file_store(&dir, &wallets);

        let usdc = address_of(&registry, "USDC");
        let source = wallets
            .iter()
            .fold(ScriptedSource::default(), |source, w| {
                source.with_balance(*w, usdc, RawValue::Integer(U256::from(1_000_000)))
            })
            .with_fault(0, Fault::Panic);
        // the delay keeps the healthy worker busy after its sibling died
        let engine = Arc::new(
            AggregationEngine::new(source, registry.clone(), RetryPolicy::immediate(3))
                .with_call_delay(Duration::from_millis(10)),
        );
        let plan = Arc::new(Plan::build(&wallets, &registry, grouped(1)).unwrap());

        let result = run_concurrent(engine, plan, options(&db_path, 2, 0), |_| {}).await;
        assert!(matches!(result, Err(crate::Error::WorkerFailed(_))));

        let store = HolderStore::open(&db_path).unwrap();
        assert!(store.wallet(&wallet(1)).unwrap().unwrap().last_analyzed.is_none());
        for n in 2..=7 {
            let w = store.wallet(&wallet(n)).unwrap().unwrap();
            assert_eq!(w.total_stablecoins, 1.0, "wallet {n}");
        }
    }

    #[tokio::test]
    async fn test_concurrent_start_unit() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(TokenRegistry::builtin().unwrap());
        let wallets: Vec<Address> = (1..=7).map(wallet).collect();
        let db_path = file_store(&dir, &wallets);

        let engine = Arc::new(AggregationEngine::new(
            ScriptedSource::default(),
            registry.clone(),
            RetryPolicy::immediate(3),
        ));
        // units: [1,2,3] [4,5,6] [7]
        let plan = Arc::new(Plan::build(&wallets, &registry, grouped(3)).unwrap());

        let summary = run_concurrent(Arc::clone(&engine), plan, options(&db_path, 3, 1), |_| {})
            .await
            .unwrap();
        assert_eq!(engine.source().calls(), 2);
        assert_eq!(summary.units, 2);
        assert_eq!(summary.analyzed, 4);

        let store = HolderStore::open(&db_path).unwrap();
        assert!(store.wallet(&wallet(3)).unwrap().unwrap().last_analyzed.is_none());
        assert!(store.wallet(&wallet(4)).unwrap().unwrap().last_analyzed.is_some());
    }
}
