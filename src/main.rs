use anyhow::{Context, Result, anyhow};
use budgetsync::scheduler::{NoHostWakeup, TracingNotifier, check_budgets};
use budgetsync::{
    AppConfig, Budget, BudgetSync, Expense, SyncOutcome, TcpProbe, TriggerReason, YearMonth,
    spawn_probe_loop,
};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const DEFAULT_DATA_DIR: &str = "budgetsync-data";

#[derive(Parser)]
#[command(name = "budgetsync")]
#[command(about = "Offline-first expense store with background sync")]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Start with the network marked offline
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Expense {
        #[command(subcommand)]
        action: ExpenseCommand,
    },
    Budget {
        #[command(subcommand)]
        action: BudgetCommand,
    },
    /// Show pending outbox entries
    Outbox,
    /// Drain the outbox once
    Sync {
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Evaluate this month's budgets and print alerts
    CheckBudgets {
        #[arg(long)]
        month: Option<YearMonth>,
    },
    /// Run the background tasks until Ctrl-C
    Run {
        /// host:port probed to detect connectivity
        #[arg(long)]
        probe: Option<String>,
        #[arg(long, default_value_t = 30)]
        probe_interval_secs: u64,
    },
}

#[derive(Subcommand)]
enum ExpenseCommand {
    Add {
        #[arg(long)]
        amount: f64,
        #[arg(long)]
        category: String,
        /// YYYY-MM-DD, defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value = "")]
        notes: String,
    },
    List {
        #[arg(long)]
        category: Option<String>,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum BudgetCommand {
    Set {
        #[arg(long)]
        category: String,
        #[arg(long)]
        limit: f64,
        /// YYYY-MM, defaults to the current month
        #[arg(long)]
        month: Option<YearMonth>,
    },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("budgetsync=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => AppConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => AppConfig::default(),
    };
    if let Some(dir) = cli.data_dir.clone() {
        config.store.data_dir = Some(dir);
    } else if config.store.data_dir.is_none() {
        config.store.data_dir = Some(PathBuf::from(DEFAULT_DATA_DIR));
    }
    if let Command::Sync {
        endpoint: Some(endpoint),
    } = &cli.command
    {
        config.sync.endpoint = Some(endpoint.clone());
    }

    let app = BudgetSync::open(config, !cli.offline)
        .await
        .context("Failed to open store")?;
    let outcome = dispatch(&app, cli.command).await;
    app.close().await.context("Failed to close store")?;
    outcome
}

async fn dispatch(app: &BudgetSync, command: Command) -> Result<()> {
    match command {
        Command::Expense { action } => expense(app, action).await,
        Command::Budget { action } => budget(app, action).await,
        Command::Outbox => {
            let entries = app.coordinator().outbox().peek().await?;
            for entry in &entries {
                println!(
                    "{}  {:<7} {:<6} {}",
                    entry.id, entry.entity_type, entry.action, entry.enqueued_at
                );
            }
            println!("{} pending", entries.len());
            Ok(())
        }
        Command::Sync { .. } => match app.coordinator().trigger(TriggerReason::Manual).await {
            SyncOutcome::Drained(report) => {
                println!("Synced {} entries", report.dispatched);
                Ok(())
            }
            SyncOutcome::Failed(err) => Err(anyhow!(err).context("Sync failed; entries kept")),
            SyncOutcome::SkippedOffline => {
                println!("Offline; nothing sent");
                Ok(())
            }
            SyncOutcome::SkippedBusy => {
                println!("A sync is already running");
                Ok(())
            }
        },
        Command::CheckBudgets { month } => {
            let month = month.unwrap_or_else(YearMonth::current);
            let alerts =
                check_budgets(app.book().as_ref(), &TracingNotifier, month).await?;
            if alerts.is_empty() {
                println!("No budget alerts for {}", month);
            }
            for alert in alerts {
                println!("{:<16} {:>6.1}%", alert.category(), alert.percentage());
            }
            Ok(())
        }
        Command::Run {
            probe,
            probe_interval_secs,
        } => run(app, probe, Duration::from_secs(probe_interval_secs)).await,
    }
}

async fn expense(app: &BudgetSync, action: ExpenseCommand) -> Result<()> {
    let book = app.book();
    match action {
        ExpenseCommand::Add {
            amount,
            category,
            date,
            notes,
        } => {
            let date = date.unwrap_or_else(|| Utc::now().date_naive());
            let saved = book
                .save_expense(Expense::new(amount, category, date, notes))
                .await?;
            println!("Saved expense {}", saved.id);
        }
        ExpenseCommand::List { category, from, to } => {
            let expenses = match (category, from, to) {
                (_, Some(from), Some(to)) => book.expenses_between(from, to).await?,
                (Some(category), _, _) => book.expenses_by_category(&category).await?,
                _ => book.expenses().await?,
            };
            for e in &expenses {
                println!(
                    "{}  {}  {:<16} {:>10.2}  {}",
                    e.id, e.date, e.category, e.amount, e.notes
                );
            }
            println!("{} expenses", expenses.len());
        }
        ExpenseCommand::Delete { id } => {
            if book.delete_expense(&id).await? {
                println!("Deleted {}", id);
            } else {
                return Err(anyhow!("No expense with id '{}'", id));
            }
        }
    }
    Ok(())
}

async fn budget(app: &BudgetSync, action: BudgetCommand) -> Result<()> {
    let book = app.book();
    match action {
        BudgetCommand::Set {
            category,
            limit,
            month,
        } => {
            let month = month.unwrap_or_else(YearMonth::current);
            let budget = match book.budget_for(&category, month).await? {
                Some(existing) => Budget {
                    monthly_limit: limit,
                    ..existing
                },
                None => Budget::new(category, limit, month),
            };
            let saved = book.save_budget(budget).await?;
            println!(
                "{} {}: {:.2} of {:.2}",
                saved.category, saved.month, saved.spent, saved.monthly_limit
            );
        }
        BudgetCommand::List => {
            book.refresh_budget_spent().await?;
            for b in book.budgets().await? {
                println!(
                    "{}  {:<16} {:>10.2} / {:>10.2}",
                    b.month, b.category, b.spent, b.monthly_limit
                );
            }
        }
    }
    Ok(())
}

async fn run(app: &BudgetSync, probe: Option<String>, probe_interval: Duration) -> Result<()> {
    let tasks = app.start_background(Arc::new(TracingNotifier), Arc::new(NoHostWakeup));
    let cancel = CancellationToken::new();
    let probe_loop = probe.map(|addr| {
        info!(%addr, "probing connectivity");
        spawn_probe_loop(
            app.connectivity().clone(),
            Arc::new(TcpProbe::new(addr, Duration::from_secs(3))),
            probe_interval,
            cancel.clone(),
        )
    });

    info!("background tasks running; press Ctrl-C to stop");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "unable to install ctrl+c handler");
    }

    cancel.cancel();
    if let Some(handle) = probe_loop {
        let _ = handle.await;
    }
    tasks.shutdown().await;
    Ok(())
}
