use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use tikka::alarm::calculator::{next_fire_time, upcoming};
use tikka::api::{ApiServer, ApiServerConfig};
use tikka::app::{App, AppOptions};
use tikka::clock::{Clock, SystemClock};
use tikka::config::{AppSettings, load_settings};
use tikka::format::format_next_fire;
use tikka::logging;
use tikka::store::{AlarmStore, SqliteStore, migrate};

#[derive(Parser, Debug)]
#[command(
    name = "tikka",
    version,
    about = "Alarm, timer and stopwatch engine with a local command API"
)]
struct Cli {
    #[arg(long, global = true, default_value = "tikka.db")]
    db: PathBuf,

    #[arg(long, global = true, default_value = "tikka.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine, boot recovery and the local command API.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        api_bind: String,

        #[arg(long, default_value_t = 8099)]
        api_port: u16,

        /// Write the widget mirror JSON here.
        #[arg(long)]
        mirror: Option<PathBuf>,

        #[arg(long)]
        allow_destructive_migration: bool,

        /// Stop after this many seconds instead of running until killed.
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Print every enabled alarm with its next fire time.
    Next,
    /// Dry run of boot recovery: registers every enabled alarm against a
    /// throwaway wake scheduler and reports the outcome per alarm.
    RestoreCheck,
    /// Apply pending schema migrations and print the schema version.
    Migrate,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init("info");
    let settings = load_settings(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Serve {
            api_bind,
            api_port,
            mirror,
            allow_destructive_migration,
            duration_secs,
        } => serve(
            &cli.db,
            settings,
            ServeArgs {
                api_bind,
                api_port,
                mirror,
                allow_destructive_migration,
                duration_secs,
            },
        ),
        Command::Next => print_next(&cli.db, &settings),
        Command::RestoreCheck => restore_check(&cli.db, settings),
        Command::Migrate => run_migrate(&cli.db),
    }
}

struct ServeArgs {
    api_bind: String,
    api_port: u16,
    mirror: Option<PathBuf>,
    allow_destructive_migration: bool,
    duration_secs: Option<u64>,
}

fn serve(db: &Path, settings: AppSettings, args: ServeArgs) -> Result<()> {
    if args.duration_secs == Some(0) {
        bail!("--duration-secs must be greater than zero");
    }
    let options = AppOptions {
        db_path: db.to_path_buf(),
        allow_destructive_migration: args.allow_destructive_migration,
        mirror_path: args.mirror,
    };
    let app = Arc::new(App::start(&options, settings, SystemClock::shared())?);
    let report = app.restore().context("boot recovery failed")?;
    println!(
        "restored {} of {} enabled alarms",
        report.registered(),
        report.outcomes.len()
    );

    let api_server = ApiServer::start(
        ApiServerConfig {
            bind_addr: args.api_bind.clone(),
            port: args.api_port,
        },
        Arc::clone(&app),
    )
    .with_context(|| {
        format!(
            "failed to start local API at {}:{}",
            args.api_bind, args.api_port
        )
    })?;
    let addr = api_server
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| format!("{}:{}", args.api_bind, args.api_port));
    println!("listening on http://{addr}");
    info!(%addr, "local API ready");

    match args.duration_secs {
        Some(secs) => thread::sleep(Duration::from_secs(secs)),
        None => loop {
            thread::park();
        },
    }

    drop(api_server);
    Ok(())
}

fn print_next(db: &Path, settings: &AppSettings) -> Result<()> {
    let store = SqliteStore::open(db, false)
        .with_context(|| format!("failed to open database {}", db.display()))?;
    let alarms = store.get_enabled().context("failed to read alarms")?;
    let now = SystemClock::new().now_local().naive_local();

    if alarms.is_empty() {
        println!("no enabled alarms");
    }
    for alarm in &alarms {
        let next = next_fire_time(alarm, now);
        println!(
            "{:>4}  {:>8}  {:<20}  {}  {}",
            alarm.id,
            alarm.time_text(settings.time_format),
            alarm.repeat_days.summary(),
            format_next_fire(Some(next), settings.time_format),
            alarm.label
        );
    }

    let summary = upcoming(&alarms, now);
    match summary.time_until_text(now) {
        Some(until) => println!(
            "next alarm in {until} ({} active)",
            summary.active_count
        ),
        None => println!("next alarm: {}", format_next_fire(None, settings.time_format)),
    }
    Ok(())
}

fn restore_check(db: &Path, settings: AppSettings) -> Result<()> {
    let options = AppOptions {
        db_path: db.to_path_buf(),
        ..AppOptions::default()
    };
    let app = App::start(&options, settings, SystemClock::shared())?;
    let report = app.restore().context("boot recovery failed")?;
    for (alarm_id, outcome) in &report.outcomes {
        println!("{alarm_id:>4}  {}", serde_json::to_string(outcome)?);
    }
    println!(
        "dry run: {} of {} enabled alarms would be restored; `serve` keeps them armed",
        report.registered(),
        report.outcomes.len()
    );
    Ok(())
}

fn run_migrate(db: &Path) -> Result<()> {
    let mut conn = rusqlite::Connection::open(db)
        .with_context(|| format!("failed to open database {}", db.display()))?;
    let version = migrate(&mut conn)
        .with_context(|| format!("failed to migrate {}", db.display()))?;
    println!("schema version {version}");
    Ok(())
}
