use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use wikigraph::cache;
use wikigraph::config::{self, LanguageConfig};
use wikigraph::export;
use wikigraph::extract::{self, ExtractOptions};
use wikigraph::identity::{self, IdentityResolver};
use wikigraph::loader::{BulkLoader, LoaderConfig};
use wikigraph::neo4j::Neo4jConnector;
use wikigraph::plan::{LoadPlan, PlanSource};
use wikigraph::resolve::{self, ResolveStrategy};
use wikigraph::staging::StagedPlan;
use wikigraph::stats::{LoadStats, ResolutionStats};
use wikigraph::store::{InMemoryStore, StoreCounts};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "wikigraph")]
#[command(about = "Build a cross-lingual concept graph from Wikipedia dumps")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv); RUST_LOG overrides it
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract one language's dump into article, link and redirect shards
    Extract(ExtractArgs),
    /// Resolve extracted shards into concepts and edges and load them
    Load(LoadArgs),
}

#[derive(Args)]
struct ExtractArgs {
    /// Language code, e.g. en
    #[arg(short, long)]
    lang: String,

    /// Path to the pages-articles dump (.xml, .xml.bz2 or .xml.gz)
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory for shards and the checkpoint
    #[arg(short, long)]
    output: PathBuf,

    /// Byte offset to seek the dump handle to before scanning
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Stop after this many pages (for testing)
    #[arg(long)]
    limit: Option<u64>,

    /// Pages per batch
    #[arg(long, default_value_t = config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Extraction threads (0 = one per core)
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// JSON language config; defaults to the built-in settings for --lang
    #[arg(long)]
    lang_config: Option<PathBuf>,

    /// Resume from the last checkpoint if it matches this input
    #[arg(long)]
    resume: bool,

    /// Ignore any checkpoint and start over from the first page
    #[arg(long)]
    clean: bool,

    /// Parse everything but write nothing
    #[arg(long)]
    dry_run: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Memory,
    Sqlite,
}

#[derive(Args)]
struct LoadArgs {
    /// Language code; repeat together with --data-dir for several languages
    #[arg(short, long = "lang", required = true)]
    langs: Vec<String>,

    /// Extraction output directory, one per --lang
    #[arg(short, long = "data-dir", required = true)]
    data_dirs: Vec<PathBuf>,

    /// Property dump (page_props SQL or CSV), one per --lang
    #[arg(long = "props")]
    props: Vec<PathBuf>,

    /// Property holding the external concept id
    #[arg(long, default_value = config::DEFAULT_ID_PROPERTY)]
    property: String,

    /// Link resolution strategy
    #[arg(long, value_enum, default_value_t = StrategyArg::Memory)]
    strategy: StrategyArg,

    /// SQLite staging database file (in memory when omitted)
    #[arg(long)]
    sqlite_db: Option<PathBuf>,

    /// Redirect hops followed before a link counts as a redlink
    #[arg(long, default_value_t = config::REDIRECT_MAX_HOPS)]
    max_hops: u32,

    /// Neo4j Bolt URI
    #[arg(long, default_value = config::DEFAULT_BOLT_URI)]
    bolt_uri: String,

    #[arg(long, default_value = config::DEFAULT_BOLT_USER)]
    user: String,

    #[arg(long, default_value = "")]
    password: String,

    /// Concurrent loader workers, each with its own connection
    #[arg(long, default_value_t = config::LOADER_WORKERS)]
    workers: usize,

    /// Records per store write
    #[arg(long, default_value_t = config::LOADER_BATCH_SIZE)]
    batch_size: usize,

    /// Write neo4j-admin import CSVs to this directory instead of loading
    #[arg(long)]
    export_csv: Option<PathBuf>,

    /// With --export-csv, also write article-to-article link edges
    #[arg(long, requires = "export_csv")]
    article_links: bool,

    /// Load into an in-process store instead of Neo4j
    #[arg(long)]
    memory_store: bool,
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let language = match &args.lang_config {
        Some(path) => LanguageConfig::from_file(path)?,
        None => match LanguageConfig::builtin(&args.lang) {
            Some(config) => config,
            None => bail!(
                "No built-in settings for language '{}'; pass --lang-config",
                args.lang
            ),
        },
    };
    if language.code != args.lang {
        bail!(
            "Language config is for '{}' but --lang is '{}'",
            language.code,
            args.lang
        );
    }
    let rules = Arc::new(language.compile()?);

    let options = ExtractOptions {
        input: args.input,
        output_dir: args.output,
        offset: args.offset,
        limit: args.limit,
        batch_size: args.batch_size,
        threads: args.threads,
        resume: args.resume,
        clean: args.clean,
        dry_run: args.dry_run,
    };

    let start = Instant::now();
    let stats = extract::run_extraction(&options, rules)?;
    let elapsed = start.elapsed();
    info!(duration_secs = elapsed.as_secs_f64(), "Extraction complete");

    println!();
    println!("=== Summary ===");
    println!("Extraction time:    {:.2}s", elapsed.as_secs_f64());
    println!();
    println!("Pages processed:    {}", stats.pages());
    println!("Articles:           {}", stats.articles());
    println!("Redirects:          {}", stats.redirects());
    println!("Skipped:            {}", stats.skipped());
    println!("Malformed:          {}", stats.malformed());
    println!("Oversized dropped:  {}", stats.oversized());
    println!("Raw links:          {}", stats.links());
    println!("Categories found:   {}", stats.categories());
    println!("Infoboxes found:    {}", stats.infoboxes());
    println!("Batches flushed:    {}", stats.batches());

    Ok(())
}

fn build_identity(args: &LoadArgs) -> Result<IdentityResolver> {
    let mut identity = IdentityResolver::new();
    for (i, (lang, dir)) in args.langs.iter().zip(&args.data_dirs).enumerate() {
        let props = args.props.get(i).map(PathBuf::as_path);
        let cache_file = cache::cache_path(dir, lang);
        let map = identity::load_concept_map(props, &args.property, Some(&cache_file))
            .with_context(|| format!("Failed to build concept map for '{}'", lang))?;
        info!(lang = %lang, mapped = map.len(), "Concept map ready");
        identity = identity.with_map(lang, map);
    }
    Ok(identity)
}

async fn load_into<C>(
    connector: C,
    config: LoaderConfig,
    plan: &dyn PlanSource,
    stats: Arc<LoadStats>,
) -> Result<StoreCounts>
where
    C: wikigraph::store::StoreConnector + 'static,
{
    BulkLoader::new(connector, config).load(plan, stats).await
}

fn run_load(args: LoadArgs) -> Result<()> {
    if args.langs.len() != args.data_dirs.len() {
        bail!(
            "Got {} --lang values but {} --data-dir values",
            args.langs.len(),
            args.data_dirs.len()
        );
    }
    if !args.props.is_empty() && args.props.len() != args.langs.len() {
        bail!("Pass one --props per --lang, or none at all");
    }
    for dir in &args.data_dirs {
        if !dir.is_dir() {
            bail!("Data directory does not exist: {:?}", dir);
        }
    }

    let start = Instant::now();
    let identity = build_identity(&args)?;

    let strategy = match args.strategy {
        StrategyArg::Memory => ResolveStrategy::Memory,
        StrategyArg::Sqlite => ResolveStrategy::Sqlite {
            db_path: args.sqlite_db.clone(),
        },
    };
    let mut resolver = resolve::resolver_for(&strategy, args.max_hops)?;
    let resolution = ResolutionStats::new();
    let dirs: Vec<&Path> = args.data_dirs.iter().map(PathBuf::as_path).collect();
    // the sqlite strategy keeps the plan on disk next to its title tables
    let plan: Box<dyn PlanSource> = match &strategy {
        ResolveStrategy::Memory => Box::new(LoadPlan::from_dirs(
            &dirs,
            &identity,
            resolver.as_mut(),
            &resolution,
        )?),
        ResolveStrategy::Sqlite { db_path } => Box::new(StagedPlan::from_dirs(
            db_path.as_deref(),
            &dirs,
            &identity,
            resolver.as_mut(),
            &resolution,
        )?),
    };
    let resolve_duration = start.elapsed();

    let load_stats = Arc::new(LoadStats::new());
    let load_start = Instant::now();
    let mut article_links = None;
    let counts = if let Some(dir) = &args.export_csv {
        let report = export::export_csv(plan.as_ref(), dir)?;
        if args.article_links {
            let page_stats = ResolutionStats::new();
            article_links = Some(export::export_article_links(
                &dirs,
                args.max_hops,
                dir,
                &page_stats,
            )?);
        }
        StoreCounts {
            concepts: report.concepts,
            articles: report.articles,
            edges: report.links,
        }
    } else {
        let config = LoaderConfig {
            workers: args.workers,
            batch_size: args.batch_size,
            ..LoaderConfig::default()
        };
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(args.workers.max(1))
            .thread_name("wikigraph-loader")
            .enable_all()
            .build()?;
        if args.memory_store {
            let store = InMemoryStore::new();
            rt.block_on(load_into(store, config, plan.as_ref(), Arc::clone(&load_stats)))?
        } else {
            let connector = Neo4jConnector::new(&args.bolt_uri, &args.user, &args.password);
            rt.block_on(load_into(connector, config, plan.as_ref(), Arc::clone(&load_stats)))?
        }
    };
    let load_duration = load_start.elapsed();

    let report = plan.report();
    println!();
    println!("=== Summary ===");
    println!("Resolution time:    {:.2}s", resolve_duration.as_secs_f64());
    println!("Load time:          {:.2}s", load_duration.as_secs_f64());
    println!("Strategy:           {}", resolver.name());
    println!();
    println!("Articles read:      {}", report.articles_read);
    println!("Duplicate articles: {}", report.duplicate_articles);
    println!("Redirects read:     {}", report.redirects_read);
    println!("Malformed lines:    {}", report.malformed_lines);
    println!("Raw links:          {}", report.links_read);
    println!("Resolved edges:     {}", resolution.resolved());
    println!("  via redirect:     {}", resolution.via_redirect());
    println!("Redlinks:           {}", resolution.redlinks());
    println!("Self edges:         {}", resolution.self_edges());
    println!("Unknown source:     {}", resolution.unknown_source());
    println!("Duplicate edges:    {}", report.duplicate_edges);
    println!("Dangling edges:     {}", report.dangling_edges);
    println!();
    if args.export_csv.is_none() {
        println!("Batches written:    {}", load_stats.batches());
        println!("Retries:            {}", load_stats.retries());
        println!("Edges rejected:     {}", load_stats.rejected());
    }
    println!("Concepts:           {}", counts.concepts);
    println!("Articles:           {}", counts.articles);
    println!("Edges:              {}", counts.edges);
    if let Some(n) = article_links {
        println!("Article links:      {}", n);
    }

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let builder = FmtSubscriber::builder().with_target(false);
    let installed = match EnvFilter::try_from_default_env() {
        Ok(filter) => {
            tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())
        }
        Err(_) => {
            tracing::subscriber::set_global_default(builder.with_max_level(level).finish())
        }
    };
    installed.expect("Failed to set tracing subscriber");

    let result = match cli.command {
        Commands::Extract(args) => run_extract(args),
        Commands::Load(args) => run_load(args),
    };

    match result {
        Ok(()) => {
            info!("Completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
