use std::path::PathBuf;

use anyhow::Result;
use aris_core::{FieldResolution, LogicalField, MatchSource};
use aris_sync::{database_path, read_status, ImportConfig, ImportPipeline};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "aris")]
#[command(about = "Municipal address roll import and reconciliation")]
struct Cli {
    /// Log at debug level, including every rejected row.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import a roll file and replace the city's address table.
    Import(ImportArgs),
    /// Show which columns of a file map to which address fields.
    Detect {
        file: PathBuf,
        #[arg(long)]
        rules: Option<PathBuf>,
        #[arg(long)]
        sheet: Option<String>,
    },
    /// Summarize the current address table and the last import.
    Status {
        city: String,
        #[arg(long)]
        database_url: Option<String>,
    },
}

#[derive(Debug, Args)]
struct ImportArgs {
    city: String,
    file: PathBuf,
    /// Prepare and report without touching the database.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(long)]
    sheet: Option<String>,
    #[arg(long)]
    street_column: Option<String>,
    #[arg(long)]
    number_column: Option<String>,
    #[arg(long)]
    postal_column: Option<String>,
    #[arg(long)]
    sector_column: Option<String>,
}

impl ImportArgs {
    fn into_config(self) -> (ImportConfig, PathBuf) {
        let mut config = ImportConfig::from_env(self.city);
        if let Some(url) = self.database_url {
            config.database_url = url;
        }
        if self.reports_dir.is_some() {
            config.reports_dir = self.reports_dir;
        }
        if self.rules.is_some() {
            config.rules_file = self.rules;
        }
        config.read_options.sheet = self.sheet;
        config.overrides.street = self.street_column;
        config.overrides.number = self.number_column;
        config.overrides.postal = self.postal_column;
        config.overrides.sector = self.sector_column;
        config.dry_run = self.dry_run;
        (config, self.file)
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Import(args) => {
            let (config, file) = args.into_config();
            let summary = ImportPipeline::new(config)?.run(&file).await?;
            info!(run_id = %summary.run_id, dry_run = summary.dry_run, "import finished");
            for warning in &summary.warnings {
                warn!("{warning}");
            }
            match summary.stats {
                Some(stats) => println!(
                    "import complete: run_id={} imported={} preserved={} new_unassigned={}",
                    summary.run_id,
                    stats.total_imported,
                    stats.preserved_assignments,
                    stats.new_unassigned
                ),
                None => println!(
                    "dry run complete: run_id={} prepared={} (database untouched)",
                    summary.run_id, summary.prepared_records
                ),
            }
            println!(
                "rows: input={} filtered_empty={} duplicates_removed={}",
                summary.rejections.input_rows,
                summary.rejections.filtered_empty,
                summary.rejections.duplicates_removed
            );
            if let Some(dir) = summary.report_dir {
                println!("reports: {dir}");
            }
        }
        Commands::Detect { file, rules, sheet } => {
            let mut config = ImportConfig::from_env(String::new());
            if rules.is_some() {
                config.rules_file = rules;
            }
            config.read_options.sheet = sheet;
            let report = ImportPipeline::new(config)?.detect_file(&file).await?;

            println!("headers: {}", report.headers.join(", "));
            for field in LogicalField::ALL {
                let line = match report.resolution(field) {
                    FieldResolution::Resolved {
                        column,
                        matched_by: MatchSource::Pattern { pattern },
                    } => format!("{column} (pattern `{pattern}`)"),
                    FieldResolution::Resolved { column, .. } => format!("{column} (override)"),
                    FieldResolution::Unresolved if field.is_mandatory() => {
                        "UNRESOLVED (required)".to_string()
                    }
                    FieldResolution::Unresolved => "not detected".to_string(),
                };
                println!("{:>7}: {line}", field.as_str());
            }
            report.into_mapping()?;
        }
        Commands::Status { city, database_url } => {
            let mut config = ImportConfig::from_env(city);
            if let Some(url) = database_url {
                config.database_url = url;
            }
            let Some(status) = read_status(&config).await? else {
                let location = database_path(&config.database_url)
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| config.database_url.clone());
                println!("{}: no database at {location}", config.city);
                return Ok(());
            };
            println!(
                "{}: addresses={} assigned={} geocoded={}",
                config.city, status.addresses, status.assigned, status.geocoded
            );
            match status.last_run {
                Some(run) => println!(
                    "last import: run_id={} file={} finished={} imported={} preserved={}",
                    run.run_id,
                    run.source_file,
                    run.finished_at,
                    run.stats.total_imported,
                    run.stats.preserved_assignments
                ),
                None => println!("last import: none"),
            }
        }
    }

    Ok(())
}
