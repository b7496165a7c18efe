//! `flexmem-migrate`: inspect and move the SQLite memory schema between
//! versions.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use flexmem::migrations::{
    Migration, MigrationManager, MigrationPlan, backup_database, builtin_migrations,
    rotate_backups,
};
use rusqlite::Connection;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Schema migrations for the flexmem SQLite backend.
#[derive(Parser)]
#[command(name = "flexmem-migrate", version, about)]
struct Cli {
    /// SQLite database file.
    #[arg(long, env = "FLEXMEM_DB")]
    db: PathBuf,

    /// Load `NNN_name.up.sql` / `NNN_name.down.sql` pairs from this
    /// directory instead of the embedded catalog.
    #[arg(long)]
    migrations_dir: Option<PathBuf>,

    /// Print plans and history as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the current and latest version.
    Status {
        /// Also list applied migrations.
        #[arg(long)]
        history: bool,
    },

    /// List every known migration and whether it is applied.
    List,

    /// List applied migrations from the ledger.
    History,

    /// Apply pending migrations.
    Up(UpArgs),

    /// Roll back to an earlier version.
    Down {
        /// Version to end at; `0` removes every migration.
        #[arg(long)]
        target: u32,

        /// Show what would run without touching the database.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Args)]
struct UpArgs {
    /// Stop after this version instead of the latest.
    #[arg(long)]
    target: Option<u32>,

    /// Show what would run without touching the database.
    #[arg(long)]
    dry_run: bool,

    /// Snapshot the database here before applying anything.
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Backups to keep in `--backup-dir`.
    #[arg(long, default_value_t = 5, requires = "backup_dir")]
    keep_backups: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flexmem=info")),
        )
        .init();

    let cli = Cli::parse();
    let conn = Connection::open(&cli.db)
        .with_context(|| format!("failed to open {}", cli.db.display()))?;
    let migrations = load_migrations(cli.migrations_dir.as_deref())?;
    let manager = MigrationManager::with_migrations(&conn, migrations)?;

    match cli.command {
        Command::Status { history } => status(&manager, history, cli.json),
        Command::List => list(&manager),
        Command::History => print_history(&manager, cli.json),
        Command::Up(args) => up(&conn, &manager, &args, cli.json),
        Command::Down { target, dry_run } => {
            let plan = manager.rollback(target, dry_run)?;
            print_plan(&plan, cli.json)
        }
    }
}

fn load_migrations(dir: Option<&Path>) -> anyhow::Result<Vec<Migration>> {
    match dir {
        Some(dir) => Migration::load_dir(dir)
            .with_context(|| format!("failed to load migrations from {}", dir.display())),
        None => Ok(builtin_migrations()),
    }
}

fn status(manager: &MigrationManager<'_>, history: bool, json: bool) -> anyhow::Result<()> {
    let current = manager.get_current_version()?;
    let pending = manager.get_pending_migrations()?;
    if json {
        let report = serde_json::json!({
            "current_version": current,
            "latest_version": manager.latest_version(),
            "pending": pending.iter().map(|m| m.id()).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("current version: {current}");
        println!("latest version:  {}", manager.latest_version());
        println!("pending:         {}", pending.len());
    }
    if history {
        print_history(manager, json)?;
    }
    Ok(())
}

fn list(manager: &MigrationManager<'_>) -> anyhow::Result<()> {
    let current = manager.get_current_version()?;
    for migration in manager.migrations() {
        let mark = if migration.version <= current { "x" } else { " " };
        println!("[{mark}] {}", migration.id());
    }
    Ok(())
}

fn print_history(manager: &MigrationManager<'_>, json: bool) -> anyhow::Result<()> {
    let history = manager.get_migration_history()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }
    if history.is_empty() {
        println!("no migrations applied");
    }
    for applied in history {
        println!(
            "{:03}_{}  {}",
            applied.version,
            applied.name,
            applied.applied_at.to_rfc3339()
        );
    }
    Ok(())
}

fn up(
    conn: &Connection,
    manager: &MigrationManager<'_>,
    args: &UpArgs,
    json: bool,
) -> anyhow::Result<()> {
    if !args.dry_run
        && let Some(dir) = &args.backup_dir
        && !manager.get_pending_migrations()?.is_empty()
    {
        let path = backup_database(conn, dir)?;
        let removed = rotate_backups(dir, args.keep_backups)?;
        info!(path = %path.display(), removed, "pre-migration backup written");
    }
    let plan = manager.migrate(args.dry_run, args.target)?;
    print_plan(&plan, json)
}

fn print_plan(plan: &MigrationPlan, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
        return Ok(());
    }
    if plan.is_noop() {
        println!("already at version {}", plan.from_version);
        return Ok(());
    }
    let verb = if plan.dry_run { "would run" } else { "ran" };
    for step in &plan.steps {
        println!(
            "{verb} {:03}_{} ({:?})",
            step.version, step.name, step.direction
        );
        if plan.dry_run {
            for statement in &step.statements {
                println!("    {statement};");
            }
        }
    }
    println!("version {} -> {}", plan.from_version, plan.to_version);
    Ok(())
}
