use anyhow::{Context, Result};
use catalog_resolution::{
    find_group, import_csv, scan, CatalogStore, EngineConfig, GroupingStrategy, MergeExecutor,
    MergeRequest, ScanParams, SqliteStore,
};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ── CLI Definition ──

#[derive(Parser)]
#[command(
    name = "catalog-resolution",
    version,
    about = "Find and merge duplicate catalog records"
)]
struct Cli {
    /// Database file (overrides the config file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import records from a CSV file (re-importing the same file is a no-op)
    Import { csv: PathBuf },

    /// List all records
    List,

    /// Scan for duplicate groups
    Scan {
        /// Print groups as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        scan: ScanArgs,
    },

    /// Show what a merge would do, without writing
    Preview(MergeArgs),

    /// Merge selected members into a representative
    Merge(MergeArgs),

    /// Show the audit events of a record
    History { id: String },
}

/// How groups are built. Preview and merge must repeat the flags the
/// scan was run with.
#[derive(Args)]
struct ScanArgs {
    /// Group by connected components instead of leaders
    #[arg(long)]
    transitive: bool,

    #[arg(long)]
    name_threshold: Option<f64>,

    /// Pair marked as not duplicates, as ID1:ID2 (repeatable)
    #[arg(long = "dismiss", value_parser = parse_pair)]
    dismissed: Vec<(String, String)>,
}

fn parse_pair(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once(':') {
        Some((a, b)) if !a.is_empty() && !b.is_empty() => Ok((a.to_string(), b.to_string())),
        _ => Err(format!("expected ID1:ID2, got {value}")),
    }
}

impl ScanArgs {
    fn params(&self) -> ScanParams {
        ScanParams {
            strategy: self.transitive.then_some(GroupingStrategy::Transitive),
            name_similarity_threshold: self.name_threshold,
            dismissed: self.dismissed.clone(),
        }
    }
}

#[derive(Args)]
struct MergeArgs {
    #[arg(long)]
    representative: String,

    /// Member to merge (repeatable)
    #[arg(long = "member", required = true)]
    members: Vec<String>,

    #[arg(long)]
    quantity: Option<f64>,

    #[arg(long)]
    value: Option<f64>,

    #[arg(long, default_value = "operator")]
    actor: String,

    #[command(flatten)]
    scan: ScanArgs,
}

impl MergeArgs {
    fn to_request(&self) -> MergeRequest {
        let mut request = MergeRequest::new(self.representative.clone(), self.members.clone())
            .with_actor(self.actor.clone());
        request.quantity_override = self.quantity;
        request.value_override = self.value;
        request
    }
}

// ── Main ──

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load().context("Failed to load config")?;
    if let Some(db) = cli.db {
        config.store.database_path = db;
    }

    let store = Arc::new(
        SqliteStore::open(&config.store.database_path).with_context(|| {
            format!("Failed to open database {}", config.store.database_path.display())
        })?,
    );

    match cli.command {
        Commands::Import { csv } => run_import(&store, &csv),
        Commands::List => run_list(&store),
        Commands::Scan { json, scan } => run_scan(&store, &config, &scan.params(), json),
        Commands::Preview(args) => run_preview(store, &config, &args),
        Commands::Merge(args) => run_merge(store, &config, &args),
        Commands::History { id } => run_history(&store, &id),
    }
}

fn run_import(store: &SqliteStore, csv: &Path) -> Result<()> {
    println!("📂 Importing {}...", csv.display());
    let summary = import_csv(store, csv).context("Failed to import CSV")?;
    println!("✓ Inserted: {} records", summary.inserted);
    println!("✓ Skipped (already imported): {}", summary.skipped);
    if !summary.id_conflicts.is_empty() {
        println!(
            "⚠ Not imported, id already in use: {}",
            summary.id_conflicts.join(", ")
        );
    }
    println!("✓ Catalog now holds {} records", store.count()?);
    Ok(())
}

fn run_list(store: &SqliteStore) -> Result<()> {
    let records = store.snapshot()?;
    for r in &records {
        println!(
            "{:<38} {:<32} {:<14} {:>10.2} {:<6} @ {:>8.2}  {}",
            r.id,
            r.name,
            r.category,
            r.quantity,
            r.unit,
            r.unit_price,
            r.supplier.as_deref().unwrap_or("-")
        );
    }
    println!("\n{} records", records.len());
    Ok(())
}

fn run_scan(store: &SqliteStore, config: &EngineConfig, params: &ScanParams, json: bool) -> Result<()> {
    let options = config.scan_options_with(params)?;
    let records = store.snapshot()?;
    let groups = scan(&records, &options).context("Scan failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    if groups.is_empty() {
        println!("✓ No duplicates among {} records", records.len());
        return Ok(());
    }

    println!("🔍 {} duplicate group(s) among {} records\n", groups.len(), records.len());
    for (i, group) in groups.iter().enumerate() {
        println!("Group {} [{}] {}", i + 1, group.badge(), group.reason);
        println!(
            "  ★ {} {} ({} {})",
            group.representative.id,
            group.representative.name,
            group.representative.quantity,
            group.representative.unit
        );
        for member in &group.members {
            println!(
                "  · {} {} ({} {})",
                member.id, member.name, member.quantity, member.unit
            );
        }
        println!();
    }
    Ok(())
}

fn group_for(
    store: &SqliteStore,
    config: &EngineConfig,
    args: &MergeArgs,
) -> Result<catalog_resolution::DuplicateGroup> {
    let options = config.scan_options_with(&args.scan.params())?;
    let records = store.snapshot()?;
    let group = find_group(
        &records,
        &options,
        &args.representative,
        &args.members,
    )?;
    Ok(group)
}

fn run_preview(store: Arc<SqliteStore>, config: &EngineConfig, args: &MergeArgs) -> Result<()> {
    let group = group_for(&store, config, args)?;
    let executor = MergeExecutor::new(store);
    let preview = executor.preview(&args.to_request(), &group)?;

    println!("Representative: {} {}", preview.representative.id, preview.representative.name);
    for member in &preview.members {
        println!("  merges {} {}", member.id, member.name);
    }
    println!(
        "Quantity: {:.2} → {:.2}",
        preview.computed_quantity, preview.final_quantity
    );
    println!("Value:    {:.2} → {:.2}", preview.computed_value, preview.final_value);
    for conflict in &preview.conflicts {
        println!("⚠ {} differs: {}", conflict.field, conflict.values.join(" | "));
    }
    Ok(())
}

fn run_merge(store: Arc<SqliteStore>, config: &EngineConfig, args: &MergeArgs) -> Result<()> {
    let group = group_for(&store, config, args)?;
    let executor = MergeExecutor::new(store);
    let result = executor
        .merge(&args.to_request(), &group)
        .context("Merge failed")?;

    println!("✅ {}", result.summary());
    println!("   deleted: {}", result.deleted_ids.join(", "));
    println!("   audit event: {}", result.event_id);
    Ok(())
}

fn run_history(store: &SqliteStore, id: &str) -> Result<()> {
    let events = store.events_for(id)?;
    if events.is_empty() {
        println!("No events for {}", id);
    }
    for event in events {
        println!(
            "{} {} by {}: {}",
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.actor,
            event.data
        );
    }
    Ok(())
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_merge_args_parse() {
        let cli = Cli::try_parse_from([
            "catalog-resolution",
            "merge",
            "--representative",
            "a",
            "--member",
            "b",
            "--member",
            "c",
            "--quantity",
            "30",
        ])
        .unwrap();

        match cli.command {
            Commands::Merge(args) => {
                let request = args.to_request();
                assert_eq!(request.representative_id, "a");
                assert_eq!(request.selected_ids, vec!["b", "c"]);
                assert_eq!(request.quantity_override, Some(30.0));
                assert_eq!(request.actor, "operator");
            }
            _ => panic!("expected merge"),
        }
    }

    #[test]
    fn test_merge_args_carry_scan_flags() {
        let cli = Cli::try_parse_from([
            "catalog-resolution",
            "preview",
            "--representative",
            "A",
            "--member",
            "C",
            "--transitive",
            "--dismiss",
            "A:B",
        ])
        .unwrap();

        match cli.command {
            Commands::Preview(args) => {
                let params = args.scan.params();
                assert_eq!(params.strategy, Some(GroupingStrategy::Transitive));
                assert_eq!(params.name_similarity_threshold, None);
                assert_eq!(params.dismissed, vec![("A".to_string(), "B".to_string())]);
            }
            _ => panic!("expected preview"),
        }

        assert!(Cli::try_parse_from(["catalog-resolution", "scan", "--dismiss", "A"]).is_err());
    }

    #[test]
    fn test_merge_requires_member() {
        assert!(Cli::try_parse_from(["catalog-resolution", "merge", "--representative", "a"]).is_err());
    }
}
