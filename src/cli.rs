//! CLI command definitions and handlers

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::{style, Emoji};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use research_clerk::catalog::Catalog;
use research_clerk::engine::{MoveOutcome, RecordOutcome, StructureEngine};
use research_clerk::error::ValidationError;
use research_clerk::models::{format_timestamp, RecordKey};
use research_clerk::owner::ZoteroProcess;
use research_clerk::provider::DecisionProvider;
use research_clerk::suggestions::{
    revalidate, revalidate_plan, SuggestionStore, REORGANIZATION_FILE, SUGGESTIONS_FILE,
};
use research_clerk::watch::{CycleOutcome, WatchLoop};
use research_clerk::{BackupManager, Config};

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "* ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");
static ARROW: Emoji<'_, '_> = Emoji("→ ", "-> ");
static INFO: Emoji<'_, '_> = Emoji("ℹ ", "i ");
static WARN: Emoji<'_, '_> = Emoji("⚠ ", "! ");

#[derive(Parser)]
#[command(name = "research-clerk")]
#[command(author, version, about = "Categorize a Zotero library safely")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: ~/.config/research-clerk/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for suggestion files
    #[arg(long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Model passed to the agent command (haiku, sonnet or a full name)
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Suggest collections and tags for unfiled items (read-only)
    Categorize {
        /// Only consider the first N unfiled items
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Apply a reviewed suggestions file
    Apply {
        /// Suggestions file written by `categorize`
        file: PathBuf,
    },

    /// Suggest moves for items that are already filed (read-only)
    Reorganize {
        /// Only consider the first N filed items
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Apply a reviewed reorganization file
    ApplyReorganization {
        /// Reorganization file written by `reorganize`
        file: PathBuf,
    },

    /// Merge sibling collections whose names differ only in case
    CleanupDuplicates,

    /// Show the collection tree (safe while Zotero runs)
    Collections,

    /// List unfiled items (safe while Zotero runs)
    Unfiled,

    /// Create a verified backup of the database
    Backup,

    /// Watch for new items and file them automatically
    Watch {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
}

/// Config file plus command-line overrides.
pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(dir) = &cli.output_dir {
        config.output_dir = Some(dir.clone());
    }
    if let Some(model) = &cli.model {
        config.provider.model = Some(model.clone());
    }
    Ok(config)
}

fn open_catalog(config: &Config) -> Result<Catalog> {
    let path = config.locate_database()?;
    println!("{} Database: {}", INFO, style(path.display()).dim());
    Ok(Catalog::new(path))
}

fn print_issues(issues: &[(RecordKey, ValidationError)]) {
    if issues.is_empty() {
        return;
    }
    println!("{} {} issue(s) found against the library:", WARN, issues.len());
    for (key, issue) in issues {
        println!("  {} {}", style(key).yellow(), issue);
    }
}

pub fn categorize(config: &Config, batch_size: Option<usize>) -> Result<()> {
    let catalog = open_catalog(config)?;
    let conn = catalog.open_read_only()?;

    let mut records = conn.list_unfiled()?;
    let total = records.len();
    if let Some(n) = batch_size {
        records.truncate(n);
    }
    if records.is_empty() {
        println!("{} No unfiled items", CHECK);
        return Ok(());
    }

    let hierarchy = conn.collections()?;
    drop(conn);
    println!(
        "{} Asking the agent about {} of {} unfiled item(s)...",
        ARROW,
        style(records.len()).cyan(),
        total
    );

    let proposal = config.command_provider().propose(&records, &hierarchy)?;
    let store = SuggestionStore::new(config.output_dir());
    let path = store.save_proposal(SUGGESTIONS_FILE, &proposal)?;

    for (key, placement) in proposal.iter() {
        println!(
            "  {} {} {}",
            style(key).dim(),
            style(&placement.path).cyan(),
            style(placement.tags.join(", ")).dim()
        );
    }
    println!("{} Saved {} suggestion(s) to {}", CHECK, proposal.len(), path.display());
    println!(
        "  Review it, then run: {} research-clerk apply {}",
        style("$").dim(),
        path.display()
    );
    Ok(())
}

pub fn apply(config: &Config, file: &Path) -> Result<()> {
    let catalog = open_catalog(config)?;
    let store = SuggestionStore::new(config.output_dir());
    let proposal = store
        .load_proposal(file)
        .with_context(|| format!("Failed to load {}", file.display()))?;

    print_issues(&revalidate(&catalog.open_read_only()?, &proposal)?);

    let engine = StructureEngine::new(config.policy);
    let backups = BackupManager::new(config.backup_dir_for(catalog.path()));
    let report = engine.apply_session(&catalog, &backups, &proposal)?;

    if let Some(backup) = &report.backup {
        println!("{} Backup: {}", CHECK, style(backup.display()).dim());
    }
    for path in &report.created_collections {
        println!("{} Created collection {}", CHECK, style(path).green());
    }
    for (key, outcome) in &report.outcomes {
        match outcome {
            RecordOutcome::Applied { path, tags, .. } => println!(
                "  {} {} {} {}",
                CHECK,
                style(key).dim(),
                style(path).cyan(),
                style(tags.join(", ")).dim()
            ),
            RecordOutcome::Rejected(reason) => {
                println!("  {} {} {}", CROSS, style(key).dim(), style(reason).red())
            }
        }
    }
    println!(
        "{} Applied {} of {} suggestion(s)",
        CHECK,
        style(report.applied()).green(),
        proposal.len()
    );

    if !proposal.is_empty() {
        let archived = store.archive(file)?;
        println!("  Archived as {}", style(archived.display()).dim());
    }
    Ok(())
}

pub fn reorganize(config: &Config, batch_size: Option<usize>) -> Result<()> {
    let catalog = open_catalog(config)?;
    let conn = catalog.open_read_only()?;

    let mut filed = conn.list_filed()?;
    if let Some(n) = batch_size {
        filed.truncate(n);
    }
    if filed.is_empty() {
        println!("{} No filed items to review", CHECK);
        return Ok(());
    }

    let hierarchy = conn.collections()?;
    drop(conn);
    println!("{} Asking the agent to review {} filed item(s)...", ARROW, filed.len());

    let plan = config.command_provider().propose_moves(&filed, &hierarchy)?;
    let store = SuggestionStore::new(config.output_dir());
    let path = store.save_plan(REORGANIZATION_FILE, &plan)?;

    for mv in &plan.moves {
        println!(
            "  {} {} {} {}",
            style(&mv.key).dim(),
            mv.current,
            ARROW,
            style(&mv.target).cyan()
        );
    }
    println!("{} Saved {} move(s) to {}", CHECK, plan.len(), path.display());
    Ok(())
}

pub fn apply_reorganization(config: &Config, file: &Path) -> Result<()> {
    let catalog = open_catalog(config)?;
    let store = SuggestionStore::new(config.output_dir());
    let plan = store
        .load_plan(file)
        .with_context(|| format!("Failed to load {}", file.display()))?;

    print_issues(&revalidate_plan(&catalog.open_read_only()?, &plan)?);

    let engine = StructureEngine::new(config.policy);
    let backups = BackupManager::new(config.backup_dir_for(catalog.path()));
    let report = engine.reorganize_session(&catalog, &backups, &plan)?;

    for (key, outcome) in &report.outcomes {
        match outcome {
            MoveOutcome::Moved { from, to } => println!(
                "  {} {} {} {} {}",
                CHECK,
                style(key).dim(),
                from,
                ARROW,
                style(to).cyan()
            ),
            MoveOutcome::Rejected(reason) => {
                println!("  {} {} {}", CROSS, style(key).dim(), style(reason).red())
            }
        }
    }
    println!("{} Moved {} of {} item(s)", CHECK, report.moved(), plan.len());

    if !plan.is_empty() {
        let archived = store.archive(file)?;
        println!("  Archived as {}", style(archived.display()).dim());
    }
    Ok(())
}

pub fn cleanup_duplicates(config: &Config) -> Result<()> {
    let catalog = open_catalog(config)?;
    let engine = StructureEngine::new(config.policy);
    let backups = BackupManager::new(config.backup_dir_for(catalog.path()));
    let report = engine.merge_duplicates_session(&catalog, &backups)?;

    if report.groups.is_empty() {
        println!("{} No duplicate collections found", CHECK);
        return Ok(());
    }
    for group in &report.groups {
        println!(
            "{} {}: kept {}, removed {:?}, moved {} item(s)",
            CHECK,
            style(&group.path).cyan(),
            group.kept_id,
            group.removed_ids,
            group.moved_items
        );
    }
    Ok(())
}

pub fn collections(config: &Config) -> Result<()> {
    let catalog = open_catalog(config)?;
    let tree = catalog.open_read_only()?.collections()?;

    if tree.is_empty() {
        println!("No collections yet");
        return Ok(());
    }
    println!("{}", style("Collections:").bold());
    for (path, collection) in tree.paths() {
        let indent = "  ".repeat(path.depth());
        println!("{}{} {}", indent, collection.name, style(&collection.key).dim());
    }
    println!(
        "{} {} collection(s), max depth {}",
        INFO,
        tree.len(),
        tree.max_depth()
    );
    Ok(())
}

pub fn unfiled(config: &Config) -> Result<()> {
    let catalog = open_catalog(config)?;
    let records = catalog.open_read_only()?.list_unfiled()?;

    if records.is_empty() {
        println!("{} No unfiled items", CHECK);
        return Ok(());
    }
    println!("{}", style("Unfiled items:").bold());
    for record in &records {
        println!(
            "  {} {} {}",
            style(&record.key).dim(),
            record.title,
            style(format_timestamp(&record.date_added)).dim()
        );
    }
    println!("{} {} unfiled item(s)", INFO, records.len());
    Ok(())
}

pub fn backup(config: &Config) -> Result<()> {
    let catalog = open_catalog(config)?;
    if research_clerk::is_database_locked(catalog.path()) {
        bail!("Zotero is using the database; close it before taking a backup");
    }
    catalog.reconcile_wal()?;

    let backups = BackupManager::new(config.backup_dir_for(catalog.path()));
    let path = backups.create_backup(catalog.path())?;
    println!("{} Backup created: {}", CHECK, style(path.display()).green());
    Ok(())
}

pub async fn watch(config: &Config, once: bool) -> Result<()> {
    let catalog = open_catalog(config)?;
    let settings = config.watch_settings(catalog.path());
    let owner = ZoteroProcess::new(&config.owner.binary, &config.owner.process_name);
    let mut watch = WatchLoop::new(catalog, config.command_provider(), owner, settings);

    let stop = watch.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n{} Stopping after the current step...", INFO);
            stop.store(true, Ordering::SeqCst);
        }
    });

    if once {
        let outcome = tokio::task::spawn_blocking(move || watch.run_once()).await??;
        match outcome {
            CycleOutcome::Applied {
                detected,
                applied,
                rejected,
                watermark,
                skipped,
            } => {
                println!(
                    "{} {} new item(s): {} filed, {} rejected; watermark {}",
                    CHECK,
                    detected,
                    style(applied).green(),
                    rejected,
                    format_timestamp(&watermark)
                );
                for key in skipped {
                    println!("  {} {} left unfiled", CROSS, style(key).yellow());
                }
            }
            other => println!("{} {:?}", INFO, other),
        }
        return Ok(());
    }

    let stats = tokio::task::spawn_blocking(move || watch.run()).await??;
    println!(
        "{} {} cycle(s), {} item(s) filed, {} failure(s)",
        CHECK, stats.cycles, stats.records_categorized, stats.failures
    );
    if let Some(err) = stats.last_error {
        println!("  Last error: {}", style(err).red());
    }
    Ok(())
}
