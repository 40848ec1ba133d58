mod cli;

use bulkfetch::config::Config;
use bulkfetch::connectors::{
    ArchiveDownloader, ArchiveJob, RunReport, SearchJob, SearchRunner, SourceRecord,
};
use bulkfetch::error::RunError;
use bulkfetch::observability;
use bulkfetch::transport::{HttpTransport, TransportProfile};
use clap::Parser;
use cli::{Cli, Commands, DownloadArgs, SearchArgs};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status of an interrupted run (128 + SIGINT)
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    observability::init_tracing(None);

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            if let RunError::Pagination {
                output: Some(path), ..
            } = &e
            {
                warn!(output = %path.display(), "Partial results were kept");
            }
            error!(error = %e, "Run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, RunError> {
    let config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    let interrupt = CancellationToken::new();
    tokio::spawn(interrupt_on_signal(interrupt.clone()));

    let report = match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Download(args) => download(config, args, interrupt).await?,
        Commands::Search(args) => search(config, args, interrupt).await?,
    };

    let json = serde_json::to_string_pretty(&report).map_err(|source| RunError::Serialize {
        what: "run report",
        source,
    })?;
    println!("{}", json);

    if report.is_cancelled() {
        Ok(ExitCode::from(EXIT_INTERRUPTED))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn download(
    config: Config,
    args: DownloadArgs,
    interrupt: CancellationToken,
) -> Result<RunReport, RunError> {
    let archive = args
        .archive
        .unwrap_or_else(|| config.downloads.default_archive.clone());
    let profile = config.archive(&archive)?.profile;
    let transport = Arc::new(HttpTransport::new(&config.engine.user_agent, profile)?);

    let records = SourceRecord::read_ndjson(&args.records).await?;
    let source_id = args.source_id.unwrap_or_else(|| {
        args.records
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let job = ArchiveJob::builder()
        .archive(archive)
        .amount(args.amount)
        .source_id(source_id)
        .maybe_staging(args.staging)
        .build();

    let downloader = ArchiveDownloader::new(config, transport, interrupt);
    tokio::spawn(observability::log_progress(downloader.subscribe()));

    downloader.run(&job, &records).await
}

async fn search(
    config: Config,
    args: SearchArgs,
    interrupt: CancellationToken,
) -> Result<RunReport, RunError> {
    let transport = Arc::new(HttpTransport::new(
        &config.engine.user_agent,
        TransportProfile::Standard,
    )?);

    let job = SearchJob::builder()
        .collection(args.collection)
        .query(args.query)
        .board(args.board)
        .confirm(args.confirm)
        .max_records(args.max_records)
        .maybe_output(args.output)
        .build();

    SearchRunner::new(config, transport, interrupt).run(&job).await
}

/// Raise the interrupt on Ctrl+C or SIGTERM
async fn interrupt_on_signal(interrupt: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, interrupting run");
    interrupt.cancel();
}
