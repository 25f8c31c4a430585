use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use glasirsync::{
    AccountFile, CredentialSource, Database, EnvCredentials, GlasirParser, GlasirSync, HttpPortal,
    JsonDirSink, MultiSink, PersistenceSink, ScheduleSlot, SlotKey, SlotOutcome, SlotReport,
    SyncReport, WeekSelection,
};

#[derive(Parser)]
#[command(name = "glasirsync", about = "Glasir timetable and homework sync")]
struct Cli {
    /// Database path (default: ~/.glasirsync/glasirsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Cookie file loaded at startup and rewritten after a login
    #[arg(long, global = true)]
    cookies: Option<PathBuf>,

    /// JSON account file with username and password (default: GLASIR_USERNAME / GLASIR_PASSWORD)
    #[arg(long, global = true)]
    account_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl glasirsync::SyncProgress for StderrProgress {
    fn on_run_start(&self, slots_total: usize) {
        eprintln!("Syncing {slots_total} weeks...");
    }

    fn on_slot_skipped(&self, slot_key: &SlotKey) {
        eprintln!("  {slot_key}: already synced");
    }

    fn on_week_fetched(&self, slot: &ScheduleSlot, lessons: usize) {
        eprintln!(
            "  Week {} ({} - {}): {} lessons",
            slot.week_number, slot.start_date, slot.end_date, lessons
        );
    }

    fn on_homework_progress(&self, slot_key: &SlotKey, done: usize, total: usize) {
        if done == total {
            eprint!("\r  {slot_key}: homework {done}/{total}   \n");
        } else {
            eprint!("\r  {slot_key}: homework {done}/{total}   ");
        }
    }

    fn on_slot_complete(&self, report: &SlotReport) {
        match report.outcome {
            SlotOutcome::Complete => {}
            SlotOutcome::Partial => eprintln!(
                "  {}: {} homework notes could not be fetched",
                report.slot_key, report.homework_failed
            ),
            SlotOutcome::Failed => eprintln!(
                "  {}: failed: {}",
                report.slot_key,
                report.error.as_deref().unwrap_or("unknown error")
            ),
            SlotOutcome::Skipped => {}
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync timetable weeks and homework from the portal
    Sync {
        /// Every week the week selector offers
        #[arg(long, conflicts_with_all = ["forward", "back", "ahead"])]
        all: bool,
        /// The current week and every later one
        #[arg(long, conflicts_with_all = ["back", "ahead"])]
        forward: bool,
        /// Weeks before the current one (at most 520)
        #[arg(long, default_value = "0", value_parser = clap::value_parser!(u32).range(..=520))]
        back: u32,
        /// Weeks after the current one (at most 520)
        #[arg(long, default_value = "0", value_parser = clap::value_parser!(u32).range(..=520))]
        ahead: u32,
        /// Refetch weeks already synced by earlier runs
        #[arg(long)]
        full: bool,
        /// Refetch the teacher directory
        #[arg(long)]
        teacher_update: bool,
        /// Also write one JSON file per week into this directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Concurrent homework requests per week
        #[arg(long)]
        homework_concurrency: Option<usize>,
        /// Concurrent weeks
        #[arg(long)]
        week_concurrency: Option<usize>,
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show what has been synced
    Status,
    /// Inspect or reset processed weeks
    Processed {
        #[command(subcommand)]
        action: ProcessedAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ProcessedAction {
    /// List weeks recorded as fully synced
    List,
    /// Forget every processed week so the next sync refetches them
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => Database::open_at(path).await?,
        None => Database::open().await?,
    };

    let cookie_file = match cli.cookies {
        Some(path) => Some(path),
        None => default_cookie_path(),
    };
    let portal = HttpPortal::new(glasirsync::portal_config(&db, cookie_file).await?)?;
    let credentials: Arc<dyn CredentialSource> = match cli.account_file {
        Some(path) => Arc::new(AccountFile::new(path)),
        None => Arc::new(EnvCredentials),
    };
    let app = GlasirSync::new(
        db,
        Arc::new(portal),
        Arc::new(GlasirParser::new()),
        credentials,
    );

    match cli.command {
        Commands::Sync {
            all,
            forward,
            back,
            ahead,
            full,
            teacher_update,
            output_dir,
            homework_concurrency,
            week_concurrency,
            json,
        } => {
            let mut options = app.sync_options().await?;
            options.selection = if all {
                WeekSelection::All
            } else if forward {
                WeekSelection::Forward
            } else if back > 0 || ahead > 0 {
                WeekSelection::Range {
                    backward: back,
                    forward: ahead,
                }
            } else {
                WeekSelection::Current
            };
            options.full = full;
            options.update_teachers = teacher_update;
            if let Some(n) = homework_concurrency {
                options.homework_concurrency = n;
            }
            if let Some(n) = week_concurrency {
                options.week_concurrency = n;
            }

            let output_dir = match output_dir {
                Some(dir) => Some(dir),
                None => app.config_get("output_dir").await?.map(PathBuf::from),
            };
            let mut sinks: Vec<Arc<dyn PersistenceSink>> = vec![Arc::new(app.db().clone())];
            if let Some(dir) = output_dir {
                sinks.push(Arc::new(JsonDirSink::new(dir)));
            }
            let sink = MultiSink::new(sinks);

            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("\nInterrupted; finishing weeks in flight...");
                        cancel.cancel();
                    }
                }
            });

            let report = app.sync(&options, &sink, &cancel, &StderrProgress).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            if report.status == glasirsync::SyncStatus::Failed {
                std::process::exit(1);
            }
        }
        Commands::Status => {
            print_status(&app).await?;
        }
        Commands::Processed { action } => match action {
            ProcessedAction::List => {
                let slots = app.processed_list().await?;
                if slots.is_empty() {
                    println!("No weeks processed yet.");
                }
                for s in slots {
                    println!(
                        "{:<10} week {:>2}  {} - {}  (processed {})",
                        s.slot_key, s.week_number, s.start_date, s.end_date, s.processed_at
                    );
                }
            }
            ProcessedAction::Clear => {
                let n = app.processed_clear().await?;
                println!("Cleared {n} processed weeks.");
            }
        },
        Commands::Config { action } => {
            handle_config(&app, action).await?;
        }
    }

    Ok(())
}

fn default_cookie_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".glasirsync").join("cookies.json"))
}

fn print_report(report: &SyncReport) {
    println!("Sync {}", report.status.as_str());
    println!(
        "  Weeks:     {} complete, {} partial, {} skipped, {} failed",
        report.slots_complete, report.slots_partial, report.slots_skipped, report.slots_failed
    );
    println!("  Lessons:   {}", report.lessons_synced);
    println!(
        "  Homework:  {} fetched, {} failed",
        report.homework_fetched, report.homework_failed
    );
    if report.reauthentications > 0 {
        println!("  Re-logins: {}", report.reauthentications);
    }
    if let Some(err) = &report.error {
        println!("  {err}");
    }
}

async fn print_status(app: &GlasirSync) -> anyhow::Result<()> {
    let (status, last_job) = app.status().await?;
    println!("Warehouse Status");
    println!("  Processed weeks: {}", status.processed_slots);
    println!("  Weeks:           {}", status.weeks);
    println!(
        "  Lessons:         {} ({} with homework)",
        status.lessons, status.lessons_with_homework
    );
    println!("  Teachers:        {}", status.teachers);
    match last_job {
        Some(job) => println!(
            "  Last sync:       {} ({}, {}) {}",
            job.completed_at.as_deref().unwrap_or(&job.started_at),
            job.selection,
            job.status,
            job.error_message.unwrap_or_default()
        ),
        None => println!("  Last sync:       never"),
    }
    Ok(())
}

async fn handle_config(app: &GlasirSync, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match app.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            app.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = app.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}
