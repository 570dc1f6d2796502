use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use trace_analysis::{
    AnalysisRequest, AnalysisResult, Analyzer, Phase, ProgressEvent, ProgressReporter, TraceConfig, MAX_HOPS,
};
use trace_data::trongrid::{TRONGRID_BASE_URL, TRONSCAN_BASE_URL};
use trace_data::{
    Address, Amount, BlacklistClient, BlacklistStatus, ExchangeRegistry, LedgerClient, LedgerFixture,
    MemoryBlacklist, MemoryLedger, RetryingLedger, RiskRegistry, TronGridClient, TronScanClient,
};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "trace")]
#[command(about = "Trace and risk-score USDT transfer paths between Tron addresses")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find and score transfer paths from one address to another.
    Analyze(AnalyzeArgs),
    /// Look up an address on the blacklist.
    CheckBlacklist(LookupArgs),
    /// Show basic account metadata.
    AddressInfo(LookupArgs),
}

/// Where ledger and blacklist data come from.
#[derive(Args, Debug)]
struct SourceArgs {
    /// Replay a JSON ledger fixture instead of querying TronGrid.
    #[arg(long)]
    fixture: Option<PathBuf>,

    #[arg(long, env = "TRONGRID_API_KEY", hide_env_values = true)]
    trongrid_api_key: Option<String>,

    #[arg(long, env = "TRONSCAN_API_KEY", hide_env_values = true)]
    tronscan_api_key: Option<String>,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    #[arg(long)]
    source: String,

    #[arg(long)]
    target: String,

    #[arg(long, default_value_t = 2)]
    max_hops: usize,

    /// Output format: table (default) or json.
    #[arg(long, default_value = "table")]
    output: String,

    /// Exchange registry file of `ADDRESS[,Name]` lines.
    #[arg(long)]
    exchanges: Option<PathBuf>,

    /// Directory holding sanctioned.txt, mixers.txt, scams.txt and unregulated.txt.
    #[arg(long)]
    risk_lists: Option<PathBuf>,

    /// JSON file overriding any configuration field.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    max_addresses: Option<usize>,

    /// Minimum transfer amount in whole USDT.
    #[arg(long)]
    min_amount: Option<u64>,

    #[command(flatten)]
    sources: SourceArgs,
}

#[derive(Args, Debug)]
struct LookupArgs {
    #[arg(long)]
    address: String,

    #[command(flatten)]
    sources: SourceArgs,
}

struct DataSources {
    ledger: Arc<dyn LedgerClient>,
    blacklist: Arc<dyn BlacklistClient>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    // A missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Analyze(args) => handle_analyze(args).await,
        Commands::CheckBlacklist(args) => handle_check_blacklist(args).await,
        Commands::AddressInfo(args) => handle_address_info(args).await,
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Defaults, then `TRACE_*` environment variables, then the JSON file, then flags.
fn load_config(args: &AnalyzeArgs) -> Result<TraceConfig> {
    let mut config = TraceConfig::default();
    apply_env(&mut config)?;

    if let Some(path) = &args.config {
        config = merge_config_file(&config, path)?;
    }
    if let Some(max_addresses) = args.max_addresses {
        config.max_addresses_to_explore = max_addresses;
    }
    if let Some(min_amount) = args.min_amount {
        config.min_transaction_amount = Amount::from_usdt(min_amount);
    }

    config.validate().wrap_err("invalid configuration")?;
    Ok(config)
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| eyre!("{name} must be a number, got '{raw}'")),
        Err(_) => Ok(None),
    }
}

fn apply_env(config: &mut TraceConfig) -> Result<()> {
    if let Some(v) = env_number("TRACE_MAX_ADDRESSES")? {
        config.max_addresses_to_explore = v;
    }
    if let Some(v) = env_number("TRACE_MAX_CONNECTIONS")? {
        config.max_connections_per_address = v;
    }
    if let Some(v) = env_number("TRACE_MAX_NODE_CONNECTIONS")? {
        config.max_node_connections = v;
    }
    if let Some(v) = env_number("TRACE_MIN_AMOUNT")? {
        config.min_transaction_amount = Amount::from_usdt(v);
    }
    if let Some(v) = env_number("TRACE_MAX_PATHS")? {
        config.max_paths = v;
    }
    if let Some(v) = env_number("TRACE_FETCH_CONCURRENCY")? {
        config.fetch_concurrency = v;
    }
    if let Some(v) = env_number("TRACE_DEADLINE_PER_HOP_SECS")? {
        config.deadline_per_hop_secs = v;
    }
    Ok(())
}

/// Overlays the fields present in a JSON file onto `base`.
fn merge_config_file(base: &TraceConfig, path: &Path) -> Result<TraceConfig> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
    let overrides: serde_json::Value =
        serde_json::from_str(&raw).wrap_err_with(|| format!("failed to parse config {}", path.display()))?;

    let mut merged = serde_json::to_value(base).wrap_err("failed to serialize configuration")?;
    merge_json(&mut merged, overrides);
    serde_json::from_value(merged).wrap_err_with(|| format!("invalid config {}", path.display()))
}

fn merge_json(base: &mut serde_json::Value, overrides: serde_json::Value) {
    match (base, overrides) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(slot) => merge_json(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn open_sources(args: &SourceArgs, config: &TraceConfig) -> Result<DataSources> {
    if let Some(path) = &args.fixture {
        let fixture = LedgerFixture::load(path)?;
        info!(
            fixture = %path.display(),
            transfers = fixture.transfers.len(),
            blacklisted = fixture.blacklisted.len(),
            "replaying ledger fixture"
        );
        return Ok(DataSources {
            ledger: Arc::new(MemoryLedger::from_fixture(&fixture)),
            blacklist: Arc::new(MemoryBlacklist::from_fixture(&fixture)),
        });
    }

    let trongrid = TronGridClient::new(TRONGRID_BASE_URL, args.trongrid_api_key.clone())
        .wrap_err("failed to create TronGrid client")?
        .with_page_size(config.max_transactions_per_address);
    let tronscan = TronScanClient::new(TRONSCAN_BASE_URL, args.tronscan_api_key.clone())
        .wrap_err("failed to create TronScan client")?;
    if args.trongrid_api_key.is_none() {
        tracing::warn!("TRONGRID_API_KEY not set; public rate limits apply");
    }
    Ok(DataSources {
        ledger: Arc::new(RetryingLedger::new(trongrid, config.fetch_concurrency)),
        blacklist: Arc::new(tronscan),
    })
}

async fn handle_analyze(args: AnalyzeArgs) -> Result<()> {
    if !(1..=MAX_HOPS).contains(&args.max_hops) {
        return Err(eyre!("--max-hops must be between 1 and {MAX_HOPS}, got {}", args.max_hops));
    }
    let format = args.output.to_lowercase();
    if format != "table" && format != "json" {
        return Err(eyre!("unknown output format '{}'; use 'table' or 'json'", args.output));
    }

    let config = load_config(&args)?;
    let request = AnalysisRequest::new(&args.source, &args.target, args.max_hops)
        .wrap_err("invalid analysis request")?;
    let sources = open_sources(&args.sources, &config)?;

    let mut analyzer = Analyzer::new(sources.ledger, sources.blacklist, config);
    if let Some(path) = &args.exchanges {
        let exchanges = ExchangeRegistry::load(path)?;
        info!(exchanges = exchanges.len(), "loaded exchange registry");
        analyzer = analyzer.with_exchanges(exchanges);
    }
    if let Some(dir) = &args.risk_lists {
        analyzer = analyzer.with_registry(RiskRegistry::load_dir(dir)?);
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed}] {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message("resolving endpoints");
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let (mut reporter, mut events) = ProgressReporter::channel(64);
    let spinner = pb.clone();
    let feed = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            spinner.set_message(progress_message(&event));
        }
    });

    let outcome = analyzer.run(&request, &mut reporter).await;
    drop(reporter);
    feed.await.wrap_err("progress task panicked")?;
    let result = match outcome {
        Ok(result) => {
            pb.finish_and_clear();
            result
        }
        Err(e) => {
            pb.abandon_with_message("analysis failed");
            return Err(e).wrap_err("analysis failed");
        }
    };

    match format.as_str() {
        "json" => {
            let json = serde_json::to_string_pretty(&result).wrap_err("failed to serialize JSON")?;
            println!("{json}");
        }
        _ => print_analysis(&result),
    }

    info!(
        paths = result.paths.len(),
        partial = result.partial,
        elapsed_ms = result.elapsed_ms,
        "analyze command completed"
    );
    Ok(())
}

fn progress_message(event: &ProgressEvent) -> String {
    let phase = match event.phase {
        Phase::Resolving => "resolving endpoints",
        Phase::Searching => "searching",
        Phase::Scoring => "scoring nodes",
        Phase::Assessing => "assessing risk",
        Phase::Finished => "finished",
    };
    format!(
        "{phase}: {} addresses, depth {}, {} path(s)",
        event.nodes_explored, event.current_hop, event.paths_found
    )
}

fn route(addresses: &[Address]) -> String {
    addresses.iter().map(Address::short).collect::<Vec<_>>().join(" -> ")
}

fn print_analysis(result: &AnalysisResult) {
    println!("Source: {}", result.source);
    println!("Target: {}", result.target);
    println!("Max hops: {}\n", result.max_hops);

    if result.paths.is_empty() {
        if result.partial {
            println!("No path found, but the search was cut short (see below).\n");
        } else {
            println!("No path found within {} hop(s).\n", result.max_hops);
        }
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["#", "Hops", "Route", "Total", "Risk", "Level"]);
        for (i, analyzed) in result.paths.iter().enumerate() {
            table.add_row(vec![
                (i + 1).to_string(),
                analyzed.path.hop_count().to_string(),
                route(&analyzed.path.addresses),
                analyzed.path.total_amount.to_string(),
                format!("{:.2}", analyzed.risk.score),
                format!("{:?}", analyzed.risk.level),
            ]);
        }
        println!("{table}\n");

        for (i, analyzed) in result.paths.iter().enumerate() {
            println!("Path {} risk factors:", i + 1);
            if analyzed.risk.factors.is_empty() {
                println!("  (none)");
            }
            for factor in &analyzed.risk.factors {
                println!("  {:<22} {:>6.2}", factor.factor.name(), factor.points);
                for evidence in &factor.evidence {
                    println!("      {evidence}");
                }
            }
            if !analyzed.risk.unverified.is_empty() {
                println!("  blacklist unverified for {} address(es)", analyzed.risk.unverified.len());
            }
            println!("  {}\n", analyzed.risk.recommendation);
        }
    }

    if !result.key_addresses.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Key address", "PageRank", "Wallet", "Blacklist", "Exchange"]);
        for key in &result.key_addresses {
            table.add_row(vec![
                key.address.to_string(),
                format!("{:.4}", key.page_rank),
                key.classification
                    .map(|c| format!("{:?} ({:.0}%)", c.label, c.confidence * 100.0))
                    .unwrap_or_else(|| "-".to_string()),
                key.blacklist.map_or_else(|| "-".to_string(), |s| format!("{s:?}")),
                key.exchange.clone().unwrap_or_else(|| "-".to_string()),
            ]);
        }
        println!("{table}\n");
    }

    if !result.communities.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["Community", "Members", "Risk", "Characteristics"]);
        for community in &result.communities {
            table.add_row(vec![
                community.name.clone(),
                community.member_count().to_string(),
                format!("{:?}", community.risk),
                community.characteristics.join(", "),
            ]);
        }
        println!("{table}\n");
    }

    let stats = &result.graph_statistics;
    println!("Graph:");
    println!("  Addresses explored:  {}", stats.nodes_explored);
    println!("  Addresses expanded:  {}", stats.nodes_expanded);
    println!("  Transfers:           {}", stats.edges_explored);
    println!("  Pruned:              {}", stats.pruned_count);
    println!("  Exchanges:           {}", stats.exchange_count);
    println!("  Elapsed:             {} ms\n", result.elapsed_ms);

    if !result.degradations.is_empty() {
        println!("Result is partial:");
        for degradation in &result.degradations {
            println!("  - {degradation}");
        }
    }
}

async fn handle_check_blacklist(args: LookupArgs) -> Result<()> {
    let address = Address::parse(&args.address)?;
    let sources = open_sources(&args.sources, &TraceConfig::default())?;

    let status = sources.blacklist.status(&address).await;
    let verdict = match status {
        BlacklistStatus::Listed => "BLACKLISTED",
        BlacklistStatus::Clear => "not blacklisted",
        BlacklistStatus::Unknown => "unknown (lookup failed)",
    };
    println!("{address}: {verdict}");
    info!(address = %address, status = ?status, "check-blacklist command completed");
    Ok(())
}

async fn handle_address_info(args: LookupArgs) -> Result<()> {
    let address = Address::parse(&args.address)?;
    let sources = open_sources(&args.sources, &TraceConfig::default())?;

    let account = sources
        .ledger
        .fetch_account_info(&address)
        .await
        .wrap_err_with(|| format!("failed to fetch account info for {address}"))?;

    let format_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
    };
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["Address".to_string(), account.address.to_string()]);
    table.add_row(vec![
        "TRX balance".to_string(),
        format!("{:.6}", account.balance_sun as f64 / 1_000_000.0),
    ]);
    table.add_row(vec!["Created".to_string(), format_time(account.created_at)]);
    table.add_row(vec!["Last operation".to_string(), format_time(account.latest_operation_at)]);
    println!("{table}");
    Ok(())
}
