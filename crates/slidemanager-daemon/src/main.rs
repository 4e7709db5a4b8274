use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;

use slidemanager_daemon::cli::{Cli, Commands, ServeArgs};
use slidemanager_daemon::config;
use slidemanager_daemon::paths::{LibraryPaths, PathError};
use slidemanager_daemon::server::{self, AppState, ServerError};
use slidemanager_daemon::services::{
    EmbedApiError, EventBus, JobManager, LibreOfficeConverter, OpenAiEmbedClient,
    PdfiumThumbRenderer,
};
use slidemanager_daemon::store::{Store, StoreError};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    });

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] config::AppConfigError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Embed(#[from] EmbedApiError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("failed to resolve current working directory: {0}")]
    WorkingDir(#[source] std::io::Error),
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Commands::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<(), AppError> {
    let mut app_config = config::load()?;
    if let Some(listen) = args.listen {
        app_config.server.listen_addr = listen;
    }
    let root: PathBuf = match args.root {
        Some(root) => root,
        None => std::env::current_dir().map_err(AppError::WorkingDir)?,
    };

    let paths = LibraryPaths::new(&root)?;
    let store = Arc::new(Store::open(&paths)?);
    let bus = Arc::new(EventBus::new(app_config.events.buffer_capacity));
    let embed_client = Arc::new(OpenAiEmbedClient::from_env()?);
    let manager = JobManager::new(
        store,
        Arc::clone(&bus),
        Arc::new(LibreOfficeConverter::default()),
        Arc::new(PdfiumThumbRenderer),
        embed_client.clone(),
        embed_client,
    );
    manager.spawn_watchdog();

    tracing::info!(root = %root.display(), "indexing daemon starting");
    server::serve(&app_config, AppState { manager, bus }).await?;
    Ok(())
}
