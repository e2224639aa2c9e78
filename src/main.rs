use crate::catalog::HttpCatalog;
use crate::config::Config;
use crate::expander::Expander;
use crate::handlers::HTTPHandlerState;
use crate::queue::QueueManager;
use crate::reporter::ProgressReporter;
use crate::tagger::{FfmpegTagger, NoopTagger, Tagger};
use crate::worker::WorkerState;
use clap::Parser;
use tracing::{Level, event};
use tracing_subscriber::prelude::*;

mod catalog;
mod config;
mod db;
mod errors;
mod expander;
mod handlers;
mod jobs;
mod queue;
mod reporter;
mod tagger;
mod worker;

#[derive(Debug, Parser)]
#[command(about, author, version, next_line_help = true)]
struct Args {
    #[arg(long, env, default_value = "127.0.0.1")]
    /// The IP address the HTTP listener will bind to.
    listen_ip: String,

    #[arg(long, env, default_value = "22409")]
    /// The port number the HTTP listener will bind to.
    listen_port: String,

    #[arg(long, env)]
    /// Base URL of the music catalog API tracks are resolved against and
    /// streamed from.
    catalog_url: String,

    #[arg(long, env, hide_env_values = true)]
    /// Bearer token sent along with every catalog request.
    catalog_token: Option<String>,

    #[arg(long, env, default_value = "trackdl.db")]
    /// File system path to the SQLite database the queue is persisted in
    /// across restarts.
    database: std::path::PathBuf,

    #[arg(long, env, default_value_t = 5)]
    /// Seconds between two progress log lines and queue checkpoints.
    report_interval_secs: u64,

    #[command(flatten)]
    config: Config,
}

// Resolve on ctrl+c. Dropping the only sender closes the broadcast channel,
// which every background task takes as its cue to stop.
async fn shutdown_upon_signal(send_shutdown: tokio::sync::broadcast::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "Received signal to shut down gracefully");
    drop(send_shutdown);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Compact lines with source locations, filtered via RUST_LOG.
    let format_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .compact();
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(format_layer)
        .init();
    event!(Level::DEBUG, "Launching...");

    // Invalid configuration is fatal and reported before any job exists.
    args.config.validate()?;
    config::check_catalog_url(&args.catalog_url)?;
    if args.report_interval_secs == 0 {
        return Err(errors::ConfigError::TooSmall("report-interval-secs").into());
    }
    let report_interval = std::time::Duration::from_secs(args.report_interval_secs);
    let config = std::sync::Arc::new(args.config);

    // Tagging needs `ffmpeg`. Without it downloads still work, files just
    // keep whatever tags the catalog delivered.
    let tagger: std::sync::Arc<dyn Tagger> = if tagger::ffmpeg_available() {
        std::sync::Arc::new(FfmpegTagger)
    } else {
        event!(
            Level::WARN,
            "No 'ffmpeg' executable found, downloaded files will not be tagged"
        );
        std::sync::Arc::new(NoopTagger)
    };

    let catalog: std::sync::Arc<dyn catalog::Catalog> = std::sync::Arc::new(HttpCatalog::new(
        &args.catalog_url,
        args.catalog_token,
    )?);

    // Jobs left over from the last run are picked up again.
    let db_pool = db::init_db(&args.database).await?;

    let queue = QueueManager::new(Expander::new(catalog.clone(), config.clone()), &config);
    let restored = queue.restore(db::load_jobs(&db_pool).await?).await;
    if restored > 0 {
        event!(Level::INFO, "Restored {restored} job(s) from previous run");
    }
    let reporter = ProgressReporter::new(&queue);

    // Workers, reporter and checkpointer each subscribe here and exit once the
    // sender is gone.
    let (send_shutdown, _) = tokio::sync::broadcast::channel::<()>(1);

    let worker_state = WorkerState::new(&queue, catalog, tagger, config.clone());
    let worker_shutdown = send_shutdown.subscribe();
    let worker_handle = tokio::task::spawn(worker_state.run(worker_shutdown));

    let reporter_shutdown = send_shutdown.subscribe();
    let reporter_handle =
        tokio::task::spawn(reporter.clone().run(report_interval, reporter_shutdown));

    let checkpoint_shutdown = send_shutdown.subscribe();
    let checkpoint_handle = tokio::task::spawn(db::checkpoint(
        queue.clone(),
        db_pool.clone(),
        report_interval,
        checkpoint_shutdown,
    ));

    // No authentication on the API. Bind it to an address only trusted clients
    // can reach.
    let handler_state = HTTPHandlerState::new(&queue, &reporter)?;
    let router = handlers::router(handler_state);

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", args.listen_ip, args.listen_port)).await?;
    event!(
        Level::INFO,
        "Listening for HTTP requests on {}:{}...",
        args.listen_ip,
        args.listen_port
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_upon_signal(send_shutdown))
        .await?;

    // Workers hand interrupted jobs back to the queue before exiting, so the last
    // checkpoint is only taken after all of them are gone.
    worker_handle.await?;
    reporter_handle.await?;
    checkpoint_handle.await?;

    match db::save_jobs(&db_pool, &queue.export().await).await {
        Ok(()) => event!(Level::DEBUG, "Saved queue for next run"),
        Err(e) => event!(Level::WARN, "Failed to save queue on shutdown: {e}"),
    }
    event!(Level::INFO, "{}", reporter.summary().await);
    db_pool.close().await;

    Ok(())
}
