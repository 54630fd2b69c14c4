use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chatsync_core::SourceEntity;
use chatsync_sync::{
    reconciler_from_config, DedupeRunSummary, RestoreOutcome, SyncConfig, SyncRunSummary,
};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chatsync")]
#[command(about = "Sync messaging chats into a document-store database and clean up duplicates")]
struct Cli {
    /// Archive journal location (overrides CHATSYNC_JOURNAL).
    #[arg(long, global = true)]
    journal: Option<PathBuf>,
    /// Dialog export to read chats from (overrides TELEGRAM_EXPORT_PATH).
    #[arg(long, global = true)]
    export: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print every record name in the store.
    List,
    /// Show source chats matching PATTERN that the store does not have yet.
    FindNew { pattern: String },
    /// Add source chats matching PATTERN that the store does not have yet.
    #[command(alias = "update-notion")]
    Sync { pattern: String },
    /// Archive less complete records that share a name with another record.
    Dedupe {
        #[arg(long)]
        dry_run: bool,
    },
    /// Un-archive every record listed in the archive journal.
    Restore,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env()?;
    if let Some(journal) = cli.journal {
        config.journal_path = journal;
    }
    if let Some(export) = cli.export {
        config.export_path = Some(export);
    }
    debug!(
        journal = %config.journal_path.display(),
        properties = %config.properties_path.display(),
        "configuration loaded"
    );

    match cli.command {
        Commands::List => {
            let reconciler = reconciler_from_config(&config)?;
            let records = reconciler.list_records().await?;
            for record in &records {
                println!("{}", record.name);
            }
            println!("\n{} records", records.len());
        }
        Commands::FindNew { pattern } => {
            let source = config.export_source()?;
            let reconciler = reconciler_from_config(&config)?;
            let summary = reconciler.find_new(&source, &pattern).await?;
            print_match_summary(&summary);
            for entity in &summary.new_entities {
                print_entity(entity);
            }
        }
        Commands::Sync { pattern } => {
            let source = config.export_source()?;
            let reconciler = reconciler_from_config(&config)?;
            let summary = reconciler.sync_new(&source, &pattern).await?;
            print_match_summary(&summary);
            match summary.created {
                Some(created) if created.total() > 0 => {
                    println!("   • Successfully added: {} chats", created.succeeded);
                    if created.failed > 0 {
                        println!("   • Failed to add: {} chats", created.failed);
                    }
                }
                _ => println!("No new chats found - everything is up to date."),
            }
            println!("sync complete: run_id={}", summary.run_id);
        }
        Commands::Dedupe { dry_run } => {
            let reconciler = reconciler_from_config(&config)?;
            let summary = reconciler.dedupe(dry_run).await?;
            print_dedupe_summary(&summary);
        }
        Commands::Restore => {
            let reconciler = reconciler_from_config(&config)?;
            let summary = reconciler.restore().await?;
            for line in restore_report(&summary.outcome, &summary.journal_path) {
                println!("{line}");
            }
            println!("restore complete: run_id={}", summary.run_id);
        }
    }

    Ok(())
}

fn restore_report(outcome: &RestoreOutcome, journal_path: &str) -> Vec<String> {
    if outcome.restored_count == 0 && outcome.failed_count == 0 {
        return vec![if outcome.journal_removed {
            format!("Journal at {journal_path} was empty; removed it")
        } else {
            format!("Nothing to restore: no journal at {journal_path}")
        }];
    }
    let mut lines = vec![format!("   • Restored: {}", outcome.restored_count)];
    if outcome.failed_count > 0 {
        lines.push(format!(
            "   • Failed: {} (kept in {journal_path} for the next restore)",
            outcome.failed_count
        ));
    }
    lines
}

fn print_match_summary(summary: &SyncRunSummary) {
    println!(
        "Matched {} source chats for {:?} against {} store records",
        summary.source_entities, summary.pattern, summary.store_records
    );
    println!("   • Existing chats: {}", summary.existing);
    println!("   • New chats: {}", summary.new_entities.len());
}

fn print_entity(entity: &SourceEntity) {
    let or_na = |value: Option<String>| value.unwrap_or_else(|| "N/A".to_string());
    println!(
        "   ➕ {} [{} {}] @{} members={} about={}",
        entity.title,
        entity.kind.as_str(),
        entity.id,
        or_na(entity.username.clone()),
        or_na(entity.member_count.map(|c| c.to_string())),
        or_na(entity.description.clone()),
    );
}

fn print_dedupe_summary(summary: &DedupeRunSummary) {
    println!(
        "Scanned {} records, found {} duplicates in {} names",
        summary.scanned,
        summary.duplicates,
        summary.groups.len()
    );
    for group in &summary.groups {
        println!("   • keep {} ({})", group.kept.name, group.kept.id);
        for superseded in &group.superseded {
            println!("       - archive {} ({})", superseded.name, superseded.id);
        }
    }

    if summary.dry_run {
        println!("Dry run: nothing archived.");
        return;
    }
    if let Some(archive) = &summary.archive {
        println!("   • Archived: {}", archive.archived_count);
        if archive.failed_count > 0 {
            println!("   • Failed to archive: {}", archive.failed_count);
        }
        if archive.archived_count > 0 {
            println!("Undo journal written to {}", summary.journal_path);
        }
    }
    println!("dedupe complete: run_id={}", summary.run_id);
}
