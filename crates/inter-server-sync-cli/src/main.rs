//! inter-server-sync CLI - export and import server entities between databases.

use clap::{Parser, Subcommand};
use inter_server_sync::export::load_table_set;
use inter_server_sync::{Config, Exporter, Importer, PgRowSource, SyncError, TableSet};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "inter-server-sync")]
#[command(about = "Export and import channels between servers, preserving foreign keys")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export channels into a bundle directory
    Export {
        /// Software channel labels to export
        #[arg(long, value_delimiter = ',')]
        channels: Vec<String>,

        /// Parent channel labels to export together with their children
        #[arg(long, value_delimiter = ',')]
        channel_with_children: Vec<String>,

        /// Configuration channel labels to export
        #[arg(long, value_delimiter = ',')]
        config_channels: Vec<String>,

        /// Bundle directory to write
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Export OS images and their metadata
        #[arg(long)]
        images: bool,

        /// Export container image metadata
        #[arg(long)]
        containers: bool,

        /// Limit image export to these organization ids
        #[arg(long, value_delimiter = ',')]
        org_limit: Vec<i64>,

        /// Export metadata only, without package files
        #[arg(long)]
        metadata_only: bool,

        /// Only export packages modified after this date (YYYY-MM-DD [HH:MM:SS])
        #[arg(long)]
        packages_only_after: Option<String>,
    },

    /// Import a bundle into the local server
    Import {
        /// Bundle directory to read
        #[arg(long)]
        import_dir: Option<PathBuf>,

        /// Skip checking the script digest
        #[arg(long)]
        skip_verify: bool,
    },

    /// Print the discovered metadata of a table set as JSON
    Schema {
        /// Table set: channels, products, configs or images
        #[arg(long, default_value = "channels")]
        tables: String,
    },

    /// Test the database connection
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), SyncError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| SyncError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let cancel_token = setup_signal_handler()?;

    match cli.command {
        Commands::Export {
            channels,
            channel_with_children,
            config_channels,
            images,
            containers,
            org_limit,
            output_dir,
            metadata_only,
            packages_only_after,
        } => {
            let export = &mut config.export;
            if !channels.is_empty() {
                export.channels = channels;
            }
            if !channel_with_children.is_empty() {
                export.channel_with_children = channel_with_children;
            }
            if !config_channels.is_empty() {
                export.config_channels = config_channels;
            }
            if images {
                export.images = true;
            }
            if containers {
                export.containers = true;
            }
            if !org_limit.is_empty() {
                export.org_limit = org_limit;
            }
            if output_dir.is_some() {
                export.output_dir = output_dir;
            }
            if metadata_only {
                export.metadata_only = true;
            }
            if packages_only_after.is_some() {
                export.packages_only_after = packages_only_after;
            }

            let exporter = Exporter::new(config)?;
            let result = until_cancelled(&cancel_token, exporter.run()).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nExport completed!");
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Bundle: {}", result.output_dir.display());
                if !result.channels.is_empty() {
                    println!("  Channels: {}", result.channels.join(", "));
                }
                if !result.config_channels.is_empty() {
                    println!("  Config channels: {}", result.config_channels.join(", "));
                }
                if result.images > 0 || result.image_profiles > 0 {
                    println!("  Images: {} ({} profiles)", result.images, result.image_profiles);
                }
                println!("  Tables: {}", result.tables.len());
                println!("  Rows: {}", result.rows_written);
                println!("  Statements: {}", result.statements);
                println!("  Package files: {}", result.package_files);
                println!("  Digest: {}", result.digest);
            }
        }

        Commands::Import {
            import_dir,
            skip_verify,
        } => {
            if import_dir.is_some() {
                config.import.import_dir = import_dir;
            }
            if skip_verify {
                config.import.skip_verify = true;
            }

            let importer = Importer::new(config)?;
            let result = until_cancelled(&cancel_token, importer.run()).await?;

            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                println!("\nImport completed!");
                println!("  Run ID: {}", result.run_id);
                println!("  Duration: {:.2}s", result.duration_seconds);
                println!("  Script: {} ({} pieces)", result.script.display(), result.script_pieces);
                println!("  Verified: {}", if result.verified { "yes" } else { "no" });
                println!("  Package files: {}", if result.packages_synced { "synced" } else { "none" });
                println!("  Images: {}", if result.images_synced { "synced" } else { "none" });
                if !result.failed_config_channels.is_empty() {
                    println!(
                        "  Config channels not synced on disk: {}",
                        result.failed_config_channels.join(", ")
                    );
                }
            }
        }

        Commands::Schema { tables } => {
            let set: TableSet = tables.parse()?;
            let source = PgRowSource::connect(&config.source).await?;
            let schema = until_cancelled(&cancel_token, load_table_set(&source, set)).await?;
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }

        Commands::HealthCheck => {
            let start = std::time::Instant::now();
            let outcome = match PgRowSource::connect(&config.source).await {
                Ok(source) => source.test_connection().await,
                Err(e) => Err(e),
            };
            let latency_ms = start.elapsed().as_millis() as u64;

            if cli.output_json {
                let report = serde_json::json!({
                    "connected": outcome.is_ok(),
                    "latency_ms": latency_ms,
                    "error": outcome.as_ref().err().map(|e| e.to_string()),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Database ({}:{}/{}): {} ({}ms)",
                    config.source.host,
                    config.source.port,
                    config.source.database,
                    if outcome.is_ok() { "OK" } else { "FAILED" },
                    latency_ms
                );
                if let Err(ref err) = outcome {
                    println!("    Error: {}", err);
                }
            }

            outcome?;
        }
    }

    Ok(())
}

/// Run `work`, giving up when a shutdown signal arrives.
async fn until_cancelled<T>(
    token: &CancellationToken,
    work: impl Future<Output = Result<T, SyncError>>,
) -> Result<T, SyncError> {
    tokio::select! {
        result = work => result,
        _ = token.cancelled() => Err(SyncError::Cancelled),
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM.
///
/// An interrupted run never reaches COMMIT, so the target is left untouched.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => eprintln!("\nReceived SIGINT. Shutting down..."),
            _ = sigterm.recv() => eprintln!("\nReceived SIGTERM. Shutting down..."),
        }
        token.cancel();
    });

    Ok(cancel_token)
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, SyncError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Shutting down...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
