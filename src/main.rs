// ============================================================================
// delivery-tracker: live order tracking and driver fulfillment from a shell
// ============================================================================
// Usage:
//   delivery-tracker track ORDER...                 Follow orders until Ctrl-C
//   delivery-tracker track ORDER... --once          Print the seeded snapshot
//   delivery-tracker deliveries [--date D]          List the day's deliveries
//   delivery-tracker set-status ID STATUS           Change one delivery
//   delivery-tracker complete ID... | --all-eligible  Bulk transition
//   delivery-tracker ping                           Check the API is reachable
//   delivery-tracker about                          Build information
//
// Settings come from DELIVERY_* environment variables or a .env file.
// ============================================================================

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{info, warn};

use delivery_tracker::confirmation::ConfirmationRequest;
use delivery_tracker::logging::{self, LogOptions};
use delivery_tracker::{
    config, BulkOutcome, Config, ConsoleStep, DailyDeliveriesQuery, DeliveryRecord,
    DeliveryStatus, DriverConsole, Intent, Resolution, Services, Shift, TrackingSnapshot,
};

/// Live delivery tracking and driver fulfillment console
#[derive(Parser)]
#[command(
    name = "delivery-tracker",
    version = logging::LONG_VERSION,
    about = "Track orders and fulfil deliveries"
)]
struct Cli {
    /// Log to the console only, no rolling log file
    #[arg(long, global = true)]
    no_log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow one or more orders on the live channel
    Track {
        #[arg(required = true)]
        order_ids: Vec<String>,

        /// Print each order's first snapshot and exit
        #[arg(long)]
        once: bool,

        /// Print snapshots as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// List the driver's deliveries for a day
    Deliveries {
        #[command(flatten)]
        day: DayArgs,

        /// Filter by status: pending, delivered, skipped, replaced, customized
        #[arg(long)]
        status: Option<DeliveryStatus>,

        /// Free-text search (customer, address)
        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value_t = 1)]
        page: u32,

        #[arg(long, default_value_t = 100)]
        limit: u32,

        #[arg(long)]
        json: bool,
    },

    /// Change the status of one delivery
    SetStatus {
        id: String,

        /// Target status: delivered, skipped, replaced, customized
        status: DeliveryStatus,

        #[arg(long)]
        notes: Option<String>,

        #[command(flatten)]
        day: DayArgs,

        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Transition several deliveries at once (completes them by default)
    Complete {
        #[arg(required_unless_present = "all_eligible", conflicts_with = "all_eligible")]
        ids: Vec<String>,

        /// Select every delivery still open for completion
        #[arg(long)]
        all_eligible: bool,

        /// Target status for the selection
        #[arg(long = "as", default_value = "delivered")]
        target: DeliveryStatus,

        #[command(flatten)]
        day: DayArgs,

        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Check that the delivery API is reachable
    Ping,

    /// Show version and build information
    About,
}

#[derive(Args)]
struct DayArgs {
    /// Day in YYYY-MM-DD (default: today)
    #[arg(long)]
    date: Option<NaiveDate>,

    /// morning or evening
    #[arg(long)]
    shift: Option<Shift>,
}

impl DayArgs {
    fn query(&self) -> DailyDeliveriesQuery {
        let mut query =
            DailyDeliveriesQuery::for_date(self.date.unwrap_or_else(|| Local::now().date_naive()));
        query.shift = self.shift;
        query
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    config::load_dotenv();
    let cli = Cli::parse();

    if let Commands::About = cli.command {
        println!("{}", serde_json::to_string_pretty(&logging::about_info())?);
        return Ok(());
    }

    let config = Config::from_env().context("Invalid configuration")?;
    let _log_guard = logging::init(&LogOptions {
        dir: config.log_dir.clone(),
        json: config.log_json,
        console_only: cli.no_log_file,
    })
    .map_err(anyhow::Error::msg)?;
    info!(version = logging::LONG_VERSION, "delivery-tracker starting");

    let services = Services::from_config(config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Track {
            order_ids,
            once,
            json,
        } => cmd_track(&services, order_ids, once, json).await,
        Commands::Deliveries {
            day,
            status,
            search,
            page,
            limit,
            json,
        } => {
            let mut query = day.query();
            query.status = status;
            query.search = search;
            query.page = page;
            query.limit = limit;
            cmd_deliveries(&services, &query, json).await
        }
        Commands::SetStatus {
            id,
            status,
            notes,
            day,
            yes,
        } => {
            let mut console = load_console(&services, &day).await?;
            let step = console
                .submit(Intent::SetStatus {
                    id,
                    target: status,
                    notes,
                })
                .await?;
            finish_step(&mut console, step, yes).await
        }
        Commands::Complete {
            ids,
            all_eligible,
            target,
            day,
            yes,
        } => {
            let mut console = load_console(&services, &day).await?;
            if all_eligible {
                let count = console.engine_mut().select_all_eligible();
                println!("Selected {count} eligible deliveries");
            } else {
                for id in &ids {
                    if !console.engine_mut().set_selected(id, true) {
                        println!("Skipping {id}: not in the list for this day");
                    }
                }
            }
            let step = console.submit(Intent::SetSelected { target }).await?;
            finish_step(&mut console, step, yes).await
        }
        Commands::Ping => {
            let result = services.api().check_connectivity().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                anyhow::bail!("Delivery API is not reachable");
            }
            Ok(())
        }
        Commands::About => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tracking
// ---------------------------------------------------------------------------

async fn cmd_track(services: &Services, order_ids: Vec<String>, once: bool, json: bool) -> Result<()> {
    let client = services.start_tracking()?;
    let mut watches = Vec::with_capacity(order_ids.len());
    for id in &order_ids {
        watches.push(client.watch(id)?);
    }

    if once {
        let deadline = services.config().request_timeout + Duration::from_secs(5);
        for watch in &mut watches {
            let seeded = tokio::time::timeout(
                deadline,
                watch.wait_for(|s| s.status.is_some() || s.last_error.is_some()),
            )
            .await;
            match seeded {
                Ok(Ok(snapshot)) => print_snapshot(&snapshot, json)?,
                Ok(Err(e)) => println!("{}: {e}", watch.order_id()),
                Err(_) => println!("{}: no snapshot within {}s", watch.order_id(), deadline.as_secs()),
            }
        }
        drop(watches);
        client.dispose().await;
        return Ok(());
    }

    let mut printers = JoinSet::new();
    for mut watch in watches {
        printers.spawn(async move {
            while let Ok(snapshot) = watch.changed().await {
                if let Err(e) = print_snapshot(&snapshot, json) {
                    warn!(order_id = %watch.order_id(), error = %e, "Failed to print snapshot");
                }
            }
        });
    }

    let mut notifications = client.notifications();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = notifications.recv() => match received {
                Ok(n) => println!(
                    "[{}] {}: {}",
                    n.order_id.as_deref().unwrap_or("-"),
                    n.kind,
                    n.description
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Notification output lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    info!("Stopping tracking");
    client.dispose().await;
    while printers.join_next().await.is_some() {}
    Ok(())
}

fn print_snapshot(snapshot: &TrackingSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }
    let location = snapshot
        .driver_location
        .map(|p| format!("{:.5},{:.5}", p.lat, p.lng))
        .unwrap_or_else(|| "-".into());
    let mut line = format!(
        "{}  status={}  eta={}  driver={}  {}",
        snapshot.order_id,
        snapshot.status.as_deref().unwrap_or("-"),
        snapshot.estimated_time_text.as_deref().unwrap_or("-"),
        location,
        if snapshot.connection_state.connected { "live" } else { "offline" },
    );
    if let Some(error) = &snapshot.last_error {
        line.push_str(&format!("  error: {error}"));
    }
    println!("{line}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

async fn cmd_deliveries(services: &Services, query: &DailyDeliveriesQuery, json: bool) -> Result<()> {
    let mut console = services.driver_console()?;
    let stats = console.load(query).await?;
    let records: Vec<&DeliveryRecord> = console.engine().records().collect();

    if json {
        let out = serde_json::json!({ "data": records, "stats": stats });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No deliveries for {}.", query.date);
        return Ok(());
    }

    println!(
        "{:<24}  {:<8}  {:<11}  {:<24}  {}",
        "ID", "SHIFT", "STATUS", "CUSTOMER", "ADDRESS"
    );
    println!("{}", "-".repeat(100));
    for r in &records {
        println!(
            "{:<24}  {:<8}  {:<11}  {:<24}  {}",
            r.id,
            r.shift.as_str(),
            r.delivery_status.as_str(),
            detail(r, "customerName"),
            detail(r, "address"),
        );
    }
    println!(
        "\nTotal: {}  pending: {}  delivered: {}  skipped: {}  replaced: {}",
        stats.total, stats.pending, stats.delivered, stats.skipped, stats.replaced
    );
    Ok(())
}

fn detail(record: &DeliveryRecord, key: &str) -> String {
    record
        .details
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("-")
        .chars()
        .take(40)
        .collect()
}

async fn load_console(services: &Services, day: &DayArgs) -> Result<DriverConsole> {
    let mut console = services.driver_console()?;
    console.load(&day.query()).await?;
    Ok(console)
}

async fn finish_step(console: &mut DriverConsole, step: ConsoleStep, yes: bool) -> Result<()> {
    match step {
        ConsoleStep::Applied(record) => print_applied(&record),
        ConsoleStep::BulkApplied(outcome) => print_outcome(&outcome),
        ConsoleStep::NeedsConfirmation(request) => {
            let confirmed = yes || ask(&request).await?;
            match console.confirm(confirmed).await? {
                Resolution::Completed(record) => print_applied(&record),
                Resolution::BulkCompleted(outcome) => print_outcome(&outcome),
                Resolution::Cancelled => println!("Cancelled."),
                Resolution::NothingPending => println!("Nothing to confirm."),
            }
        }
    }
    Ok(())
}

async fn ask(request: &ConfirmationRequest) -> Result<bool> {
    for rejected in &request.rejected {
        println!("  {} left out: {}", rejected.id, rejected.reason);
    }
    let prompt = request.prompt();
    let answer = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
        print!("{prompt} [y/N] ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
    })
    .await??;
    Ok(answer)
}

fn print_applied(record: &DeliveryRecord) {
    println!("{} is now {}", record.id, record.delivery_status);
}

fn print_outcome(outcome: &BulkOutcome) {
    println!("Applied {} of {} deliveries", outcome.applied, outcome.requested);
    if outcome.is_partial() {
        println!("Some deliveries were not updated by the server; reload before retrying.");
    }
    for rejected in &outcome.rejected {
        println!("  {} left out: {}", rejected.id, rejected.reason);
    }
}
