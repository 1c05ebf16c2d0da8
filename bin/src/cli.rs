use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Parser, Subcommand, ValueEnum};
use console::{style, Term};
use holdscan_common::token::AddressExt;
use holdscan_utils::{
    alchemy::{AlchemyBalanceSource, AlchemyClient},
    alloy::StringExt,
    config::Config,
    disk_storage::DiskStorageInterface,
    engine::AggregationEngine,
    fetcher::CollectionFetcher,
    multicall::MulticallSource,
    pipeline::{
        run_concurrent, run_sequential, ConcurrentOptions, PassProgress, PassSummary,
        SequentialOptions,
    },
    planner::{Plan, Strategy},
    registry::TokenRegistry,
    report::{export_json, summarize},
    retry::RetryPolicy,
    store::{HolderStore, WalletFilter},
};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser, Debug)]
#[command(name = "holdscan", bin_name = "holdscan", version)]
#[command(about = "Stablecoin balances of NFT holders")]
pub struct Cli {
    /// SQLite database, defaults to `db_path` from the config
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SourceArg {
    /// Multicall3 over JSON-RPC, one token across many wallets per call
    Multicall,
    /// Alchemy balances API, all tokens of up to 3 wallets per call
    Alchemy,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch the holders of every configured collection
    Fetch {
        /// Only fetch the collection with this name
        #[arg(long)]
        collection: Option<String>,
    },

    /// Run one balance aggregation pass over stored wallets
    Analyze {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum, default_value_t = SourceArg::Multicall)]
        strategy: SourceArg,
        /// Skip wallets that were analyzed before
        #[arg(long)]
        only_new: bool,
        #[arg(long)]
        workers: Option<usize>,
        /// Wallets per remote call
        #[arg(long)]
        batch_width: Option<usize>,
        /// Continue the last interrupted multicall pass, skipping units it
        /// already stored
        #[arg(long)]
        resume: bool,
        /// Skip every unit before this index
        #[arg(long, value_name = "UNIT")]
        resume_from: Option<usize>,
    },

    /// Print analytics over the store
    Summary {
        #[arg(long, default_value_t = 10)]
        top: usize,
    },

    /// Export holders, per collection holders and summary stats as JSON
    Export {
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Size of the top holders export
        #[arg(long, default_value_t = 100)]
        top: usize,
    },

    /// List tracked tokens
    Tokens,

    /// Delete every row from the store, keeping the schema
    Wipe {
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Store the Alchemy API key in ~/.holdscan/config.toml
    SetAlchemyKey { key: String },
}

impl Cli {
    pub async fn run(self) -> holdscan_utils::Result<()> {
        let config = Config::load()?;
        let db_path = self.db.clone().unwrap_or_else(|| config.db_path.clone());

        match self.cmd {
            Commands::Fetch { collection } => fetch(&config, &db_path, collection).await,
            Commands::Analyze {
                limit,
                strategy,
                only_new,
                workers,
                batch_width,
                resume,
                resume_from,
            } => {
                let filter = WalletFilter {
                    limit,
                    only_unanalyzed: only_new,
                };
                let run = RunArgs {
                    workers,
                    batch_width,
                    resume: resume || resume_from.is_some(),
                    start_unit: resume_from.unwrap_or(0),
                };
                analyze(&config, &db_path, filter, strategy, run).await
            }
            Commands::Summary { top } => summary(&config, &db_path, top),
            Commands::Export { dir, top } => {
                let dir = dir.unwrap_or_else(|| config.export_dir.clone());
                let store = HolderStore::open(&db_path)?;
                let paths = export_json(&store, &registry(&config)?, &dir, top)?;
                println!("{} {}", style("holders:").green(), paths.holders.display());
                println!("{} {}", style("top holders:").green(), paths.top_holders.display());
                for path in &paths.collections {
                    println!("{} {}", style("collection:").green(), path.display());
                }
                println!("{} {}", style("summary:").green(), paths.summary.display());
                Ok(())
            }
            Commands::Tokens => tokens(&config),
            Commands::Wipe { yes } => wipe(&db_path, yes),
            Commands::Config {
                cmd: ConfigCommands::SetAlchemyKey { key },
            } => {
                Config::set_alchemy_api_key(key)?;
                println!("Alchemy API key saved to {}", Config::path()?.display());
                Ok(())
            }
        }
    }
}

fn registry(config: &Config) -> holdscan_utils::Result<TokenRegistry> {
    TokenRegistry::with_extra(config.extra_tokens.clone())
}

fn retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.analyzer.max_attempts,
        ..Default::default()
    }
}

fn progress_bar(len: usize) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} units {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn report_progress(bar: &ProgressBar, progress: PassProgress) {
    bar.set_position(progress.units_done as u64);
    bar.set_message(format!(
        "{} analyzed, {} errored",
        progress.analyzed, progress.errored
    ));
}

async fn fetch(
    config: &Config,
    db_path: &Path,
    only: Option<String>,
) -> holdscan_utils::Result<()> {
    let client = AlchemyClient::new(config.alchemy_api_key()?, config.analyzer.rpc_timeout())?;
    let fetcher = CollectionFetcher::new(client, retry_policy(config));
    let mut store = HolderStore::open(db_path)?;

    for collection in &config.collections {
        if only.as_ref().is_some_and(|name| name != &collection.name) {
            continue;
        }
        let contract = collection.contract_address.parse_as_address()?;

        let spinner = ProgressBar::new_spinner();
        spinner.set_message(format!("Fetching holders of {}...", collection.name));
        spinner.enable_steady_tick(Duration::from_millis(80));

        match fetcher.fetch_into(&mut store, &collection.name, &contract).await {
            Ok((fetched, stats)) => {
                let note = if fetched.complete {
                    String::new()
                } else {
                    format!(" {}", style("(incomplete, a page failed)").yellow())
                };
                spinner.finish_with_message(format!(
                    "{} {}: {} holders, {} new{note}",
                    style("✓").green(),
                    collection.name,
                    stats.total_holders,
                    stats.new_holders
                ));
            }
            Err(err) => {
                spinner.abandon_with_message(format!(
                    "{} {}: {err}",
                    style("✗").red(),
                    collection.name
                ));
            }
        }
    }

    Ok(())
}

struct RunArgs {
    workers: Option<usize>,
    batch_width: Option<usize>,
    resume: bool,
    start_unit: usize,
}

async fn analyze(
    config: &Config,
    db_path: &Path,
    filter: WalletFilter,
    source: SourceArg,
    run: RunArgs,
) -> holdscan_utils::Result<()> {
    let registry = Arc::new(registry(config)?);
    let mut store = HolderStore::open(db_path)?;
    let wallets = store.wallets(filter)?;
    if wallets.is_empty() {
        println!("No wallets to analyze, run `holdscan fetch` first.");
        return Ok(());
    }

    let analyzer = &config.analyzer;
    println!(
        "Analyzing {} wallets against {} tokens via {source:?}",
        wallets.len(),
        registry.tokens_with_native().len()
    );

    let summary = match source {
        SourceArg::Multicall => {
            let source = MulticallSource::from_rpc_url(&config.get_rpc_url()?, analyzer.rpc_timeout())?;
            let plan = Plan::build(
                &wallets,
                &registry,
                Strategy::TokenBroadcast {
                    wallets_per_call: run.batch_width.unwrap_or(analyzer.wallets_per_batch),
                },
            )?;
            let engine = AggregationEngine::new(source, Arc::clone(&registry), retry_policy(config))
                .with_call_delay(analyzer.call_delay());

            let bar = progress_bar(plan.len());
            let options = SequentialOptions {
                resume: run.resume,
                start_unit: run.start_unit,
            };
            let summary = run_sequential(&engine, &mut store, &plan, options, |p| {
                report_progress(&bar, p)
            })
            .await?;
            bar.finish_and_clear();
            summary
        }
        SourceArg::Alchemy => {
            let client = AlchemyClient::new(config.alchemy_api_key()?, analyzer.request_timeout())?;
            let plan = Arc::new(Plan::build(
                &wallets,
                &registry,
                Strategy::WalletGrouped {
                    wallets_per_call: run.batch_width.unwrap_or(analyzer.addresses_per_call),
                },
            )?);
            let engine = Arc::new(
                AggregationEngine::new(
                    AlchemyBalanceSource::new(client),
                    Arc::clone(&registry),
                    retry_policy(config),
                )
                .with_call_delay(analyzer.call_delay()),
            );

            let bar = progress_bar(plan.len());
            let callback_bar = bar.clone();
            let summary = run_concurrent(
                engine,
                plan,
                ConcurrentOptions {
                    workers: run.workers.unwrap_or(analyzer.workers),
                    db_path: db_path.to_path_buf(),
                    start_unit: run.start_unit,
                },
                move |p| report_progress(&callback_bar, p),
            )
            .await?;
            bar.finish_and_clear();
            summary
        }
    };

    print_pass_summary(&summary);
    Ok(())
}

fn print_pass_summary(summary: &PassSummary) {
    println!("\n{}", style("Pass complete").bold().green());
    println!("  wallets considered: {}", summary.considered);
    println!("  analyzed:           {}", style(summary.analyzed).green());
    let errored = if summary.errored > 0 {
        style(summary.errored).red()
    } else {
        style(summary.errored)
    };
    println!("  errored:            {errored}");
    println!(
        "  units:              {} ({} failed)",
        summary.units, summary.failed_units
    );
    println!("  decode errors:      {}", summary.decode_errors);
    println!("  balance records:    {}", summary.records_written);
}

fn summary(config: &Config, db_path: &Path, top: usize) -> holdscan_utils::Result<()> {
    let store = HolderStore::open(db_path)?;
    let summary = summarize(&store, &registry(config)?, top)?;

    let share = |n: usize| {
        if summary.total_holders == 0 {
            0.0
        } else {
            n as f64 / summary.total_holders as f64 * 100.0
        }
    };

    println!("\n{}", style("NFT holder analysis").bold());
    println!("\nTotal holders: {}", summary.total_holders);
    println!(
        "  analyzed:    {} ({:.1}%)",
        summary.analyzed_holders,
        share(summary.analyzed_holders)
    );
    println!(
        "  with assets: {} ({:.1}%)",
        summary.holders_with_assets,
        share(summary.holders_with_assets)
    );

    println!("\n{}", style("Total value").bold());
    println!("  stablecoins: ${:.2}", summary.total_stablecoins);
    println!("  ETH:         {:.4}", summary.total_eth);
    println!("  gini:        {:.3}", summary.gini);

    println!("\n{}", style("Wealth tiers").bold());
    for tier in summary.tiers.iter().filter(|t| t.holders > 0) {
        println!(
            "  {:<22} {:>6} holders  ${:>16.2}  {:>5.1}%  avg ${:.2}",
            tier.tier.to_string(),
            tier.holders,
            tier.total,
            tier.share,
            tier.average
        );
    }

    println!("\n{}", style("By collection").bold());
    for collection in &summary.collections {
        println!(
            "  {:<14} {:>6} holders  ${:.2}  {:.4} ETH",
            collection.name, collection.holders, collection.total_stablecoins, collection.total_eth
        );
    }

    if let Some(crossover) = &summary.crossover {
        println!("\n{}", style("Collection overlap").bold());
        let groups =
            std::iter::once(&crossover.multi_collection).chain(&crossover.single_collection);
        for group in groups {
            println!(
                "  {:<24} {:>6} holders  ${:>16.2}  avg ${:.2}",
                group.label, group.holders, group.total, group.average_non_zero
            );
        }
        if let Some(multiple) = crossover.richness_multiple {
            println!("  multi collection holders are {multiple:.1}x richer on average");
        }
    }

    if !summary.tokens.is_empty() {
        println!("\n{}", style("Top tokens").bold());
        for token in summary.tokens.iter().take(15) {
            let kind = if token.yield_bearing { "yield" } else { "plain" };
            println!(
                "  {:<10} {:<6} {:>6} holders  ${:>16.2}  avg ${:.2}",
                token.symbol, kind, token.holders, token.total, token.average
            );
        }
        println!(
            "  plain ${:.2}  yield ${:.2} ({:.1}%)",
            summary.plain_value, summary.yield_value, summary.yield_share
        );
    }

    if !summary.protocols.is_empty() {
        println!("\n{}", style("DeFi protocols").bold());
        for protocol in &summary.protocols {
            println!(
                "  {:<12} {:>6} holders  ${:.2}",
                protocol.protocol.to_string(),
                protocol.holders,
                protocol.value
            );
        }
    }

    if !summary.top_holders.is_empty() {
        println!("\n{}", style("Top holders").bold());
        for (i, holder) in summary.top_holders.iter().enumerate() {
            println!(
                "  {:>3}. {}  ${:.2}  {:.4} ETH  {} NFTs",
                i + 1,
                style(&holder.address).cyan(),
                holder.total_stablecoins,
                holder.total_eth,
                holder.total_nfts
            );
        }
    }

    println!("\nBalance records: {}", summary.balance_records);
    Ok(())
}

fn tokens(config: &Config) -> holdscan_utils::Result<()> {
    let registry = registry(config)?;
    for token in registry.tokens_with_native() {
        let underlying = token
            .underlying
            .as_deref()
            .map(|u| format!(" -> {u}"))
            .unwrap_or_default();
        println!(
            "{:<10} {:<44} {:>2}  {:<10} {}{underlying}",
            style(&token.symbol).bold(),
            token.address.to_canonical(),
            token.decimals,
            token.protocol.to_string(),
            token.name
        );
    }
    println!("\n{} tokens tracked plus native ETH", registry.len());
    Ok(())
}

fn wipe(db_path: &Path, yes: bool) -> holdscan_utils::Result<()> {
    if !yes {
        println!(
            "{} this deletes every holder, holding and balance in {}",
            style("warning:").yellow(),
            db_path.display()
        );
        let term = Term::stdout();
        term.write_str("Type 'yes' to continue: ")
            .map_err(holdscan_utils::Error::TerminalIo)?;
        let answer = term.read_line().map_err(holdscan_utils::Error::TerminalIo)?;
        if answer.trim() != "yes" {
            println!("Aborted.");
            return Ok(());
        }
    }

    let mut store = HolderStore::open(db_path)?;
    store.wipe_all()?;
    println!("{} store wiped", style("✓").green());
    Ok(())
}
