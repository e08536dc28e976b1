//! Pooldex CLI - index pools and query the index from the command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pooldex::{
    resolve_path, CollectingSink, ItemQuery, ObjectType, PoolIndex, PoolRegistry, PoolWatcher, StatusEvent,
    UpdateOptions, UpdateReport, Updater,
};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{info, Level};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "pooldex")]
#[command(about = "Pool indexing and dependency tracking for EDA part libraries", long_about = None)]
#[command(version)]
struct Cli {
    /// Pool registry file
    #[arg(short, long, global = true, default_value = "pools.json")]
    config: PathBuf,

    /// Index database file
    #[arg(short, long, global = true, default_value = "pool.db")]
    index: PathBuf,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fully re-index all pools, or one pool
    Update {
        /// Only update the pool with this uuid
        #[arg(long)]
        pool: Option<Uuid>,

        /// Also delete items depending on deleted items
        #[arg(long)]
        cascade: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Re-index one changed, added or removed item file
    UpdateFile {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Also delete items depending on a deleted item
        #[arg(long)]
        cascade: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Show which pool provides an item
    Resolve {
        #[arg(value_name = "UUID")]
        uuid: Uuid,

        /// Item type; any type when omitted
        #[arg(short = 't', long = "type", value_parser = parse_type)]
        object_type: Option<ObjectType>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Search indexed items
    Search {
        #[arg(value_name = "TYPE", value_parser = parse_type)]
        object_type: ObjectType,

        /// Name prefix (case-insensitive)
        #[arg(short, long, default_value = "")]
        name: String,

        /// Required tag; repeat for several
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Restrict to one pool
        #[arg(long)]
        pool: Option<Uuid>,

        /// Hide rows shadowed by a higher-precedence pool
        #[arg(long)]
        hide_overridden: bool,

        #[arg(long)]
        limit: Option<usize>,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// List the tags used by items of one type
    Tags {
        #[arg(value_name = "TYPE", value_parser = parse_type)]
        object_type: ObjectType,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// List dependencies of an item, or its dependents with --reverse
    Deps {
        #[arg(value_name = "TYPE", value_parser = parse_type)]
        object_type: ObjectType,

        #[arg(value_name = "UUID")]
        uuid: Uuid,

        /// Pool of the item; the highest-precedence pool holding it when omitted
        #[arg(long)]
        pool: Option<Uuid>,

        /// List items depending on this one instead
        #[arg(short, long)]
        reverse: bool,

        /// Output format
        #[arg(short, long, value_enum, default_value = "human")]
        format: OutputFormat,
    },

    /// Watch all pools and update the index as files change
    Watch {
        /// Debounce delay in milliseconds
        #[arg(long, default_value_t = 500)]
        debounce_ms: u64,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output for scripts
    Json,
}

fn parse_type(s: &str) -> Result<ObjectType, String> {
    s.parse().map_err(|e: pooldex::ParseError| e.to_string())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Update { pool, cascade, format } => handle_update(&cli.config, &cli.index, pool, cascade, format),
        Commands::UpdateFile { file, cascade, format } => {
            handle_update_file(&cli.config, &cli.index, &file, cascade, format)
        }
        Commands::Resolve {
            uuid,
            object_type,
            format,
        } => handle_resolve(&cli.config, &cli.index, &uuid, object_type, format),
        Commands::Search {
            object_type,
            name,
            tags,
            pool,
            hide_overridden,
            limit,
            offset,
            format,
        } => {
            let mut query = ItemQuery::new(object_type).name_prefix(name).tags(tags).offset(offset);
            if let Some(pool) = pool {
                query = query.pool(pool);
            }
            if hide_overridden {
                query = query.hide_overridden();
            }
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            handle_search(&cli.index, &query, format)
        }
        Commands::Tags { object_type, format } => handle_tags(&cli.index, object_type, format),
        Commands::Deps {
            object_type,
            uuid,
            pool,
            reverse,
            format,
        } => handle_deps(&cli.config, &cli.index, object_type, &uuid, pool, reverse, format),
        Commands::Watch { debounce_ms } => handle_watch(&cli.config, &cli.index, debounce_ms),
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    process::exit(exit_code);
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::WARN,
        (false, 1) => Level::INFO,
        (false, _) => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_registry(config: &Path) -> Result<PoolRegistry> {
    PoolRegistry::load(config).with_context(|| format!("Failed to load pool registry {}", config.display()))
}

fn open_index(path: &Path) -> Result<PoolIndex> {
    PoolIndex::open(path).with_context(|| format!("Failed to open index {}", path.display()))
}

fn options(cascade: bool) -> UpdateOptions {
    UpdateOptions {
        cascade_delete: cascade,
        ..UpdateOptions::default()
    }
}

fn handle_update(config: &Path, index: &Path, pool: Option<Uuid>, cascade: bool, format: OutputFormat) -> Result<i32> {
    let registry = load_registry(config)?;
    let mut index = open_index(index)?;
    let mut sink = CollectingSink::new();
    let mut updater = Updater::new(&mut index, &registry).with_options(options(cascade));
    let result = match pool {
        Some(pool) => updater.update_pool(&pool, &mut sink),
        None => updater.update_all(&mut sink),
    };
    output_run(result, &sink, &format)
}

fn handle_update_file(config: &Path, index: &Path, file: &Path, cascade: bool, format: OutputFormat) -> Result<i32> {
    let registry = load_registry(config)?;
    let mut index = open_index(index)?;
    let mut sink = CollectingSink::new();
    let result = Updater::new(&mut index, &registry)
        .with_options(options(cascade))
        .update_file(file, &mut sink);
    output_run(result, &sink, &format)
}

fn output_run(result: pooldex::Result<UpdateReport>, sink: &CollectingSink, format: &OutputFormat) -> Result<i32> {
    match format {
        OutputFormat::Human => {
            for event in sink.errors() {
                println!("  FAILED {}: {}", event.path().display(), event.message());
            }
            if let Some(StatusEvent::Done { message, .. }) = sink.done() {
                println!("{}", message);
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "report": result.as_ref().ok(),
                "error": result.as_ref().err().map(|e| e.to_string()),
                "events": sink.events,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    let report = result?;
    Ok(if report.error_count() > 0 { 1 } else { 0 })
}

fn handle_resolve(
    config: &Path,
    index: &Path,
    uuid: &Uuid,
    object_type: Option<ObjectType>,
    format: OutputFormat,
) -> Result<i32> {
    let registry = load_registry(config)?;
    let index = PoolIndex::open_read_only(index).with_context(|| format!("Failed to open index {}", index.display()))?;
    let resolved = resolve_path(&index, &registry, object_type, uuid)?;
    match format {
        OutputFormat::Human => {
            let pool_name = registry
                .get(&resolved.row.pool_uuid)
                .map(|p| p.name.as_str())
                .unwrap_or("?");
            println!("{} {} \"{}\"", resolved.row.object_type, resolved.row.uuid, resolved.row.name);
            match registry.precedence(&resolved.row.pool_uuid) {
                Some(rank) => println!("  Pool: {} ({}), precedence {}", pool_name, resolved.row.pool_uuid, rank),
                None => println!("  Pool: {} ({})", pool_name, resolved.row.pool_uuid),
            }
            match &resolved.path {
                Some(path) => println!("  File: {}", path.display()),
                None => println!("  File: {}", resolved.row.filename),
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resolved)?),
    }
    Ok(0)
}

fn handle_search(index: &Path, query: &ItemQuery, format: OutputFormat) -> Result<i32> {
    let index = PoolIndex::open_read_only(index).with_context(|| format!("Failed to open index {}", index.display()))?;
    let hits = index.search(query)?;
    match format {
        OutputFormat::Human => {
            if hits.is_empty() {
                println!("No items found");
            }
            for hit in &hits {
                let marker = if hit.row.overridden { " (overridden)" } else { "" };
                println!("{}  {}{}", hit.row.uuid, hit.row.name, marker);
                if !hit.tags.is_empty() {
                    println!("    tags: {}", hit.tags.join(", "));
                }
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&hits)?),
    }
    Ok(0)
}

fn handle_tags(index: &Path, object_type: ObjectType, format: OutputFormat) -> Result<i32> {
    let index = PoolIndex::open_read_only(index).with_context(|| format!("Failed to open index {}", index.display()))?;
    let tags = index.all_tags(object_type)?;
    match format {
        OutputFormat::Human => {
            if tags.is_empty() {
                println!("No tags found");
            }
            for (tag, count) in &tags {
                println!("{:>5}  {}", count, tag);
            }
        }
        OutputFormat::Json => {
            let output: Vec<_> = tags
                .iter()
                .map(|(tag, count)| serde_json::json!({ "tag": tag, "count": count }))
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(0)
}

fn handle_deps(
    config: &Path,
    index: &Path,
    object_type: ObjectType,
    uuid: &Uuid,
    pool: Option<Uuid>,
    reverse: bool,
    format: OutputFormat,
) -> Result<i32> {
    let index = PoolIndex::open_read_only(index).with_context(|| format!("Failed to open index {}", index.display()))?;
    let output = if reverse {
        let dependents = index.dependents_of(object_type, uuid)?;
        match format {
            OutputFormat::Human => dependents
                .iter()
                .map(|k| format!("{} {} (pool {})", k.object_type, k.uuid, k.pool_uuid))
                .collect::<Vec<_>>()
                .join("\n"),
            OutputFormat::Json => serde_json::to_string_pretty(&dependents)?,
        }
    } else {
        let pool = match pool {
            Some(pool) => pool,
            None => {
                let registry = load_registry(config)?;
                pooldex::resolve(&index, object_type, uuid, &registry.stack())?.pool_uuid
            }
        };
        let deps = index.dependencies_of(&pool, object_type, uuid)?;
        match format {
            OutputFormat::Human => deps
                .iter()
                .map(|d| {
                    let state = if index.exists_in_any_pool(d.object_type, &d.uuid).unwrap_or(false) {
                        ""
                    } else {
                        " (missing)"
                    };
                    format!("{} {}{}", d.object_type, d.uuid, state)
                })
                .collect::<Vec<_>>()
                .join("\n"),
            OutputFormat::Json => serde_json::to_string_pretty(&deps)?,
        }
    };
    if !output.is_empty() {
        println!("{}", output);
    }
    Ok(0)
}

fn handle_watch(config: &Path, index: &Path, debounce_ms: u64) -> Result<i32> {
    let registry = load_registry(config)?;
    registry.validate()?;
    let mut index = open_index(index)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async {
        let mut watcher = PoolWatcher::with_debounce(std::time::Duration::from_millis(debounce_ms));
        watcher.watch_registry(&registry).await?;
        let mut events = watcher.subscribe();
        info!("Watching {} pools, press Ctrl-C to stop", registry.pools().len());

        let mut report_status = |event: &StatusEvent| match event {
            StatusEvent::FileError { path, message } => println!("FAILED {}: {}", path.display(), message),
            StatusEvent::File { path, .. } => println!("updated {}", path.display()),
            StatusEvent::Done { .. } => {}
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        let result = Updater::new(&mut index, &registry).update_file(event.path(), &mut report_status);
                        if let Err(e) = result {
                            eprintln!("Error: {}", e);
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        eprintln!("Missed {} file events, run `pooldex update` to catch up", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        watcher.unwatch().await?;
        Ok::<_, anyhow::Error>(())
    })?;
    Ok(0)
}
