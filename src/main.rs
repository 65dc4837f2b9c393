use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dedupr::core::duplicate::{ClusterPolicy, GroupKind};
use dedupr::core::history::{OperationLog, UndoEntry};
use dedupr::core::merge::{ActionOutcome, ConflictPolicy, DuplicateAction, MergeActionKind, TransferMode};
use dedupr::core::scanner::{ScanMode, ScanPhase, ScanProgress};
use dedupr::{Engine, ScanSummary, Settings};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "dedupr", version, about = "Find, review and safely remove duplicate files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find and list duplicate groups
    Scan {
        #[command(flatten)]
        scan: ScanArgs,
        /// Print the groups as JSON
        #[arg(long)]
        json: bool,
    },

    /// Keep the best copy in every group and quarantine (or move) the rest
    Cull {
        #[command(flatten)]
        scan: ScanArgs,
        /// Only show what would happen
        #[arg(long)]
        dry_run: bool,
        /// Move duplicates here instead of quarantining them
        #[arg(long, value_name = "DIR")]
        target_dir: Option<PathBuf>,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// List files similar to one file
    Similar {
        #[command(flatten)]
        scan: ScanArgs,
        /// File to compare against
        #[arg(short, long, value_name = "FILE")]
        file: PathBuf,
    },

    /// Merge an incoming folder into a master folder
    Merge {
        #[arg(long, value_name = "DIR")]
        master: PathBuf,
        #[arg(long, value_name = "DIR")]
        incoming: PathBuf,
        /// Only show the plan
        #[arg(long)]
        dry_run: bool,
        /// Move new files instead of copying them
        #[arg(long = "move")]
        move_files: bool,
        /// Quarantine incoming files that already exist in master
        #[arg(long)]
        quarantine_duplicates: bool,
        /// Flag name conflicts instead of renaming
        #[arg(long)]
        flag_conflicts: bool,
        #[arg(short, long)]
        yes: bool,
    },

    /// Work with the undo history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },

    /// Show or reset persisted settings
    Settings {
        #[command(subcommand)]
        command: SettingsCmd,
    },
}

#[derive(clap::Args, Debug)]
struct ScanArgs {
    /// Directory to scan
    #[arg(short, long, value_name = "DIR")]
    path: PathBuf,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    /// Maximum Hamming distance for visual matches
    #[arg(long)]
    threshold: Option<u32>,
    #[arg(long)]
    workers: Option<usize>,
    /// Every visual match must be close to the group's first file
    #[arg(long)]
    strict: bool,
    /// Extra extensions to ignore
    #[arg(long = "ignore-ext", value_name = "EXT")]
    ignore_extensions: Vec<String>,
    /// Extra folder names to ignore
    #[arg(long = "ignore-folder", value_name = "NAME")]
    ignore_folders: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Exact,
    Visual,
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List recorded operations, newest last
    List,
    /// Reverse the most recent operations
    Undo {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Drop the most recent entry without touching files
    Discard,
    /// Permanently delete quarantined files
    Purge {
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsCmd {
    Show,
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let mut settings = Settings::load();

    match cli.command {
        Commands::Scan { scan, json } => {
            let effective = with_scan_args(&settings, &scan);
            let (_, summary) = scan_with_progress(&effective, &scan.path).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary.groups)?);
            } else {
                print_groups(&summary);
            }
            settings.last_scan_root = Some(scan.path.clone());
            save_settings(&settings);
        }

        Commands::Cull {
            scan,
            dry_run,
            target_dir,
            yes,
        } => {
            let effective = with_scan_args(&settings, &scan);
            let (engine, summary) = scan_with_progress(&effective, &scan.path).await?;
            if summary.groups.is_empty() {
                println!("No duplicates found.");
                return Ok(());
            }

            let mut selections = Vec::new();
            for (i, group) in summary.groups.iter().enumerate() {
                let selection = engine.apply_smart_select(i).await?;
                println!("\n✨ Group {} ({}):", i + 1, kind_label(group.kind));
                println!("   🏆 Keeping → {}", selection.keep.display());
                for path in &selection.discard {
                    println!("   📦 Discard → {}", path.display());
                }
                selections.push(selection);
            }

            let count: usize = selections.iter().map(|s| s.discard.len()).sum();
            if dry_run {
                println!("\n⚠️  Dry-run only; {} files would be culled.", count);
                return Ok(());
            }
            if !confirm(yes, &format!("Cull {} files?", count))? {
                return Ok(());
            }

            for path in selections.iter().flat_map(|s| &s.discard) {
                let result = match &target_dir {
                    Some(dir) => engine.move_file(path, dir).await,
                    None => engine.delete_file(path).await,
                };
                match result {
                    Ok(entry) => println!("   📦 {} → {}", path.display(), entry.new_path.display()),
                    Err(e) => eprintln!("⚠️  {}: {}", path.display(), e),
                }
            }

            if let Some(dir) = &target_dir {
                settings.remember_move_target(dir);
            }
            save_journal(&settings.journal_path(), &engine.history().await)?;
            println!("\n✅ Recorded history in {}", settings.journal_path().display());
            save_settings(&settings);
        }

        Commands::Similar { scan, file } => {
            let effective = with_scan_args(&settings, &scan);
            let (engine, _) = scan_with_progress(&effective, &scan.path).await?;

            let matches = engine.find_similar(&file).await?;
            if matches.is_empty() {
                println!("No similar files within distance {}.", effective.threshold);
            }
            for m in matches {
                println!("   [{:>2}] {}", m.distance, m.record.path.display());
            }
        }

        Commands::Merge {
            master,
            incoming,
            dry_run,
            move_files,
            quarantine_duplicates,
            flag_conflicts,
            yes,
        } => {
            let mut effective = settings.clone();
            if move_files {
                effective.transfer_mode = TransferMode::Move;
            }
            if quarantine_duplicates {
                effective.duplicate_action = DuplicateAction::Quarantine;
            }
            if flag_conflicts {
                effective.conflict_policy = ConflictPolicy::Flag;
            }
            let engine = build_engine(&effective)?;

            println!("▶ Planning merge {} → {}", incoming.display(), master.display());
            let plan = engine.start_merge(&master, &incoming, dry_run).await?;
            for action in &plan.actions {
                println!(
                    "   {} {} → {}",
                    action_label(action.kind),
                    action.source.display(),
                    action.target.display()
                );
            }

            if dry_run {
                println!("\n⚠️  Dry-run only; no files were changed.");
                return Ok(());
            }
            if !confirm(yes, &format!("Apply {} merge actions?", plan.actions.len()))? {
                return Ok(());
            }

            let report = engine.execute_merge(plan).await?;
            for entry in &report.actions {
                if let ActionOutcome::Failed(message) = &entry.outcome {
                    eprintln!("⚠️  {}: {}", entry.action.source.display(), message);
                }
            }
            println!(
                "\n✅ Merge done: {} succeeded, {} skipped, {} flagged, {} failed, {} not attempted",
                report.count(|o| *o == ActionOutcome::Succeeded),
                report.count(|o| *o == ActionOutcome::Skipped),
                report.count(|o| *o == ActionOutcome::Flagged),
                report.failures(),
                report.count(|o| *o == ActionOutcome::NotAttempted)
            );

            save_journal(&settings.journal_path(), &engine.history().await)?;
            settings.last_merge_master = Some(master);
            settings.last_merge_incoming = Some(incoming);
            save_settings(&settings);
        }

        Commands::History { command } => {
            let engine = build_engine(&settings)?;
            let journal = settings.journal_path();

            match command {
                HistoryCmd::List => {
                    let entries = engine.history().await;
                    if entries.is_empty() {
                        println!("History is empty.");
                    }
                    println!("🗂️  History:");
                    for (i, entry) in entries.iter().enumerate() {
                        println!(
                            "[{}] {} {:?}\n     from: {}\n     to:   {}",
                            i,
                            entry.timestamp.to_rfc3339(),
                            entry.kind,
                            entry.original_path.display(),
                            entry.new_path.display()
                        );
                    }
                }

                HistoryCmd::Undo { count } => {
                    for _ in 0..count {
                        match engine.undo().await {
                            Ok(entry) => println!("🔄 Restored {}", entry.original_path.display()),
                            Err(e) => {
                                eprintln!("⚠️  {}", e);
                                break;
                            }
                        }
                    }
                    save_journal(&journal, &engine.history().await)?;
                }

                HistoryCmd::Discard => {
                    if let Some(entry) = engine.discard_last().await {
                        println!("🧹 Dropped entry for {}", entry.original_path.display());
                    }
                    save_journal(&journal, &engine.history().await)?;
                }

                HistoryCmd::Purge { yes } => {
                    if !confirm(yes, "Permanently delete every quarantined file?")? {
                        return Ok(());
                    }
                    let report = engine.purge().await;
                    for (path, message) in &report.failed {
                        eprintln!("⚠️  {}: {}", path.display(), message);
                    }
                    println!("🗑️  Purged {} files ({} bytes)", report.removed, report.bytes);
                    save_journal(&journal, &engine.history().await)?;
                }
            }
        }

        Commands::Settings { command } => match command {
            SettingsCmd::Show => {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            }
            SettingsCmd::Reset => {
                let path = Settings::default().save()?;
                println!("🧹 Settings reset at {}", path.display());
            }
        },
    }

    Ok(())
}

/// Settings for this run only; command-line overrides are not persisted.
fn with_scan_args(settings: &Settings, args: &ScanArgs) -> Settings {
    let mut settings = settings.clone();
    if let Some(mode) = args.mode {
        settings.scan_mode = match mode {
            ModeArg::Exact => ScanMode::Exact,
            ModeArg::Visual => ScanMode::Visual,
        };
    }
    if let Some(threshold) = args.threshold {
        settings.threshold = threshold;
    }
    if let Some(workers) = args.workers {
        settings.workers = workers;
    }
    if args.strict {
        settings.cluster_policy = ClusterPolicy::Strict;
    }
    settings.ignore_extensions.extend(args.ignore_extensions.iter().cloned());
    settings.ignore_folders.extend(args.ignore_folders.iter().cloned());
    settings
}

fn build_engine(settings: &Settings) -> Result<Engine> {
    let entries = load_journal(&settings.journal_path())?;
    let log = OperationLog::from_entries(settings.quarantine_dir.clone(), entries);
    Ok(Engine::new(settings.scan_options(), settings.merge_options(), log).with_scoring(settings.scoring()))
}

/// Build an engine wired to a progress bar and scan `path`; Ctrl-C cancels
/// cooperatively.
async fn scan_with_progress(settings: &Settings, path: &Path) -> Result<(Engine, ScanSummary)> {
    println!("▶ Scanning for duplicates in: {}", path.display());

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ScanProgress>();
    let engine = build_engine(settings)?.with_progress_sender(progress_tx);

    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
    )?);
    bar.enable_steady_tick(Duration::from_millis(100));

    let progress_bar = bar.clone();
    let progress_task = tokio::spawn(async move {
        while let Some(progress) = progress_rx.recv().await {
            progress_bar.set_length(progress.total_discovered as u64);
            progress_bar.set_position(progress.files_processed as u64);
            match progress.phase {
                ScanPhase::Fingerprinting => progress_bar.set_message(progress.current_file),
                ScanPhase::Grouping => progress_bar.set_message("Grouping…"),
                ScanPhase::Complete | ScanPhase::Cancelled => break,
            }
        }
    });

    let cancel = engine.cancellation_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let start = Instant::now();
    let summary = engine
        .start_scan(path)
        .await
        .with_context(|| format!("Failed to scan {}", path.display()))?;

    ctrl_c.abort();
    let _ = progress_task.await;
    bar.finish_and_clear();

    println!(
        "⏱ Scanned {} of {} files in {:.2?}",
        summary.processed,
        summary.discovered,
        start.elapsed()
    );
    if summary.cancelled {
        println!("⚠️  Scan cancelled; results are partial.");
    }
    for warning in &summary.warnings {
        eprintln!("⚠️  {}: {}", warning.path.display(), warning.message);
    }
    Ok((engine, summary))
}

fn print_groups(summary: &ScanSummary) {
    if summary.groups.is_empty() {
        println!("No duplicates found.");
        return;
    }

    println!("Found {} duplicate group(s):", summary.groups.len());
    for (i, group) in summary.groups.iter().enumerate() {
        println!(
            " Group {} ({}, {} bytes reclaimable):",
            i + 1,
            kind_label(group.kind),
            group.reclaimable_bytes()
        );
        for member in &group.members {
            println!("   ▶ {} ({} bytes)", member.path.display(), member.size);
        }
    }
}

fn kind_label(kind: GroupKind) -> &'static str {
    match kind {
        GroupKind::Exact => "exact",
        GroupKind::Visual => "visual",
    }
}

fn action_label(kind: MergeActionKind) -> &'static str {
    match kind {
        MergeActionKind::CopyNew => "➕ new      ",
        MergeActionKind::SkipDuplicate => "♻️  duplicate",
        MergeActionKind::RenameOnConflict => "✏️  rename   ",
        MergeActionKind::FlagManual => "🚩 flagged  ",
    }
}

fn confirm(skip: bool, prompt: &str) -> Result<bool> {
    if skip {
        return Ok(true);
    }
    Ok(Confirm::new().with_prompt(prompt).default(false).interact()?)
}

fn save_settings(settings: &Settings) {
    if let Err(e) = settings.save() {
        log::warn!("Could not save settings: {}", e);
    }
}

fn load_journal(path: &Path) -> Result<Vec<UndoEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let f = File::open(path).with_context(|| format!("Could not open history file {:?}", path))?;

    let mut entries = Vec::new();
    for (i, line) in BufReader::new(f).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<UndoEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => eprintln!("⚠️  Skipping malformed history entry {}: {}", i, err),
        }
    }
    Ok(entries)
}

fn save_journal(path: &Path, entries: &[UndoEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let mut content = String::new();
    for entry in entries {
        content.push_str(&serde_json::to_string(entry)?);
        content.push('\n');
    }
    fs::write(path, content).with_context(|| format!("Failed to update history file {:?}", path))
}
