use clap::Parser;
use pg_selective_replica::capture::PgReceiveWal;
use pg_selective_replica::config::{default_drain_secs, default_parallel_copies, default_warmup_secs};
use pg_selective_replica::copy::RsyncCopier;
use pg_selective_replica::postgres::{Catalog, PgCatalog};
use pg_selective_replica::preconditions;
use pg_selective_replica::{Config, Replicator, Result, RunOptions};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-selective-replica")]
#[command(about = "Creates a selective PostgreSQL replica based on a walbouncer config", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", help = "walbouncer YAML config file")]
    config: PathBuf,

    #[arg(short, long, help = "Replica to build (configuration name from the config file)")]
    replica_name: String,

    #[arg(short = 'D', long, value_name = "DIR", help = "Destination data directory")]
    pgdata: PathBuf,

    #[arg(short, long, env = "USER", help = "User for the rsync copy from the master")]
    user: String,

    #[arg(short = 'n', long, help = "Just show what would be executed")]
    dry_run: bool,

    #[arg(short, long, help = "Only log errors")]
    quiet: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(long, value_name = "DIR", help = "WAL staging directory [default: <pgdata>.wal_staging]")]
    staging_dir: Option<PathBuf>,

    #[arg(long, default_value_t = default_warmup_secs(), help = "Max seconds to wait for WAL streaming to start")]
    warmup_secs: u64,

    #[arg(long, default_value_t = default_drain_secs(), help = "Max seconds to wait for the last WAL to arrive")]
    drain_secs: u64,

    #[arg(long, default_value_t = default_parallel_copies(), help = "Tablespace copies to run at once")]
    parallel_copies: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose, args.quiet);

    info!("Loading configuration from {:?}", args.config);
    let config = match Config::from_file(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };
    let profile = config.profile(&args.replica_name).inspect_err(|e| error!("{}", e))?;
    let connection = config.connection(&args.user);

    let mut options = RunOptions::new(&args.pgdata, args.user.clone());
    options.dry_run = args.dry_run;
    options.warmup = Duration::from_secs(args.warmup_secs);
    options.drain = Duration::from_secs(args.drain_secs);
    options.max_parallel_copies = args.parallel_copies;
    if let Some(staging_dir) = args.staging_dir {
        options.staging_dir = staging_dir;
    }

    info!(
        master_host = %connection.host,
        master_port = connection.port,
        replica = %profile.name,
        destination = %options.destination.display(),
        staging_dir = %options.staging_dir.display(),
        dry_run = options.dry_run,
        "Configuration summary"
    );

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = interrupt.recv() => error!("User interrupt, cleaning up before exit"),
            _ = terminate.recv() => error!("Termination requested, cleaning up before exit"),
        }
    };

    // Directory checks come before the first contact with the master.
    preconditions::check_targets(&options)
        .await
        .inspect_err(|e| error!("Refusing to start: {}", e))?;

    let catalog = PgCatalog::connect(&connection)
        .await
        .inspect_err(|e| error!("Cannot connect to the master: {}", e))?;
    let version = catalog.server_version().await?;

    let capture = PgReceiveWal::new(
        connection.clone(),
        version,
        options.capture_application_name.clone(),
        options.dry_run,
        options.stop_timeout,
    );
    let copier = RsyncCopier::new(options.dry_run);

    let mut replicator = Replicator::new(
        catalog,
        capture,
        copier,
        profile,
        connection.host.clone(),
        options,
    );
    let report = replicator.run(shutdown).await;

    for warning in report.cleanup.warnings() {
        error!("{}", warning);
    }

    let secs = report.elapsed.as_secs();
    match report.outcome {
        Ok(()) => {
            info!("Finished in {} s", secs);
            Ok(())
        }
        Err(e) if e.is_setup_error() => {
            error!("Refusing to start: {}", e);
            Err(e)
        }
        Err(e) => {
            error!("Failed after {} s: {}", secs, e);
            Err(e)
        }
    }
}

fn init_logging(json: bool, verbose: bool, quiet: bool) {
    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("pg_selective_replica=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_selective_replica=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
