use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use stash::{
    catalog::{group_by_folder, CatalogStore},
    config::Config,
    db,
    engine::{delivery::DeliveryService, reconciler::Reconciler, scheduler::Daemon},
    http::{self, AppState},
};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "stash", version, about = "Catalog a directory tree and serve its files to their owners")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the watched root
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Keep the catalog in sync and serve downloads over HTTP
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run one reconciliation pass and print what changed
    Scan,
    /// Print the catalog grouped by folder
    Tree,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("loading config")?;
    if let Some(root) = cli.root {
        config.root = root;
    }
    config.root = config.resolved_root();

    init_logging(&config)?;

    let db = db::init(&config.db_path)
        .await
        .with_context(|| format!("opening catalog at {}", config.db_path.display()))?;
    let store: Arc<dyn CatalogStore> = Arc::new(db);

    match cli.command {
        Command::Serve { bind } => serve(config, store, bind).await,
        Command::Scan => scan(config, store).await,
        Command::Tree => tree(store).await,
    }
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
            let file_appender = tracing_appender::rolling::never(dir, "stash.log");
            Some(fmt::layer().with_ansi(false).with_writer(file_appender))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn reconciler_for(config: &Config, store: Arc<dyn CatalogStore>) -> Arc<Reconciler> {
    Arc::new(Reconciler::new(
        store,
        config.root.clone(),
        config.scan_options(),
        config.default_owner.clone(),
    ))
}

async fn serve(config: Config, store: Arc<dyn CatalogStore>, bind: Option<String>) -> anyhow::Result<()> {
    let catalogued = store.list_all().await.map(|keys| keys.len()).unwrap_or_default();
    info!(root = %config.root.display(), catalogued, "starting");

    let daemon = Daemon::start(reconciler_for(&config, store.clone()), config.daemon_settings());

    let state = AppState {
        delivery: DeliveryService::new(store.clone(), config.root.clone()),
        store,
        rescan: Some(daemon.rescan_handle()),
        identity_header: config.identity_header.clone(),
    };
    let bind = bind.unwrap_or(config.bind);
    let served = http::serve(state, &bind).await;

    daemon.shutdown().await;
    served.with_context(|| format!("http server on {bind}"))
}

async fn scan(config: Config, store: Arc<dyn CatalogStore>) -> anyhow::Result<()> {
    let report = reconciler_for(&config, store)
        .reconcile()
        .await
        .context("reconciliation failed")?;

    for key in &report.added {
        println!("+ {key}");
    }
    for key in &report.removed {
        println!("- {key}");
    }
    println!(
        "{} added, {} removed{}",
        report.added.len(),
        report.removed.len(),
        if report.partial { format!(", {} left unknown (partial walk)", report.unknown) } else { String::new() }
    );
    Ok(())
}

async fn tree(store: Arc<dyn CatalogStore>) -> anyhow::Result<()> {
    let records = store.list_records().await.context("listing catalog")?;
    if records.is_empty() {
        println!("No files in catalog.");
        return Ok(());
    }

    for (folder, names) in group_by_folder(&records) {
        println!("{folder}");
        for name in names {
            println!("   └─ {name}");
        }
    }
    Ok(())
}
