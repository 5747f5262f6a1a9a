//! Import pipeline orchestration: read, detect, prepare, reconcile, report.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use aris_core::{
    prepare, ColumnOverrides, DetectionReport, FieldMapping, ImportStats, RejectionSummary,
    SchemaDetector, SchemaRules, Table,
};
use aris_sources::{parse_table, ReadOptions};
use aris_storage::{AddressStore, RunContext, StoreStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aris-sync";

/// Everything one import run needs, passed in explicitly.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub city: String,
    pub database_url: String,
    pub reports_dir: Option<PathBuf>,
    pub rules_file: Option<PathBuf>,
    pub overrides: ColumnOverrides,
    pub read_options: ReadOptions,
    pub dry_run: bool,
}

impl ImportConfig {
    pub fn new(city: impl Into<String>) -> Self {
        let city = city.into();
        Self {
            database_url: default_database_url(&city),
            city,
            reports_dir: None,
            rules_file: None,
            overrides: ColumnOverrides::default(),
            read_options: ReadOptions::default(),
            dry_run: false,
        }
    }

    pub fn from_env(city: impl Into<String>) -> Self {
        let mut config = Self::new(city);
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        config.reports_dir = std::env::var("ARIS_REPORTS_DIR").ok().map(PathBuf::from);
        config.rules_file = std::env::var("ARIS_RULES_FILE").ok().map(PathBuf::from);
        config
    }
}

/// Lower-case ASCII slug of a city label, used for default file names.
pub fn city_slug(city: &str) -> String {
    let slug = aris_core::normalize(city)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();
    let slug = slug
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "default".to_string()
    } else {
        slug
    }
}

pub fn default_database_url(city: &str) -> String {
    format!("sqlite://data/{}.db", city_slug(city))
}

/// File path behind a SQLite url, `None` for in-memory or non-SQLite urls.
pub fn database_path(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path.contains(":memory:") {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Create the parent directory of a file-backed SQLite url.
pub fn ensure_database_dir(database_url: &str) -> Result<()> {
    let Some(path) = database_path(database_url) else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Summarize the configured store. `Ok(None)` when its database file does not exist yet;
/// nothing is created in that case.
pub async fn read_status(config: &ImportConfig) -> Result<Option<StoreStatus>> {
    if let Some(path) = database_path(&config.database_url) {
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
    }
    let store = AddressStore::connect(&config.database_url).await?;
    Ok(Some(store.status().await?))
}

pub fn load_rules(path: &Path) -> Result<SchemaRules> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    SchemaRules::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportRunSummary {
    pub run_id: Uuid,
    pub city: String,
    pub source_file: String,
    pub source_sha256: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub mapping: FieldMapping,
    pub prepared_records: usize,
    pub rejections: RejectionSummary,
    pub stats: Option<ImportStats>,
    pub warnings: Vec<String>,
    pub report_dir: Option<String>,
}

pub struct ImportPipeline {
    config: ImportConfig,
    detector: SchemaDetector,
}

impl ImportPipeline {
    pub fn new(config: ImportConfig) -> Result<Self> {
        let rules = match &config.rules_file {
            Some(path) => load_rules(path)?,
            None => SchemaRules::default(),
        };
        let detector = SchemaDetector::new(rules).with_overrides(config.overrides.clone());
        Ok(Self { config, detector })
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Report how each logical field resolves against `file`'s headers.
    pub async fn detect_file(&self, file: &Path) -> Result<DetectionReport> {
        let (table, _) = self.load(file).await?;
        self.detector
            .scan(&table.columns)
            .with_context(|| format!("detecting columns of {}", file.display()))
    }

    /// Run an import against the configured database.
    pub async fn run(&self, file: &Path) -> Result<ImportRunSummary> {
        if self.config.dry_run {
            return self.run_inner(None, file).await;
        }
        ensure_database_dir(&self.config.database_url)?;
        let store = AddressStore::connect(&self.config.database_url).await?;
        self.run_inner(Some(&store), file).await
    }

    /// Run an import against an already opened store.
    pub async fn run_with_store(&self, store: &AddressStore, file: &Path) -> Result<ImportRunSummary> {
        let store = (!self.config.dry_run).then_some(store);
        self.run_inner(store, file).await
    }

    async fn run_inner(&self, store: Option<&AddressStore>, file: &Path) -> Result<ImportRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("import_run", %run_id, city = %self.config.city);

        async move {
            let (table, source_sha256) = self.load(file).await?;
            let mapping = self
                .detector
                .detect(&table.columns)
                .with_context(|| format!("detecting columns of {}", file.display()))?;
            info!(
                street = %mapping.street,
                number = %mapping.number,
                postal = ?mapping.postal,
                sector = ?mapping.sector,
                "columns resolved"
            );

            let prepared = prepare(&table.rows, &mapping);
            let summary = &prepared.summary;
            if summary.total_rejected() > 0 {
                warn!(
                    filtered_empty = summary.filtered_empty,
                    duplicates_removed = summary.duplicates_removed,
                    "rows rejected during preparation"
                );
            }
            for rejection in &summary.rejections {
                debug!(row = rejection.row_number, reason = ?rejection.reason, "rejected row");
            }

            let mut warnings = Vec::new();
            let stats = match store {
                Some(store) => {
                    if prepared.records.is_empty() {
                        let live = store.count_addresses().await?;
                        if live > 0 {
                            warn!(live, "no usable rows; the address table will be emptied");
                            warnings.push(format!(
                                "no usable rows in {}; {live} existing addresses and their assignments were removed",
                                file.display()
                            ));
                        }
                    }
                    let run = RunContext {
                        run_id,
                        city: self.config.city.clone(),
                        source_file: file.display().to_string(),
                        source_sha256: source_sha256.clone(),
                        started_at,
                    };
                    let stats = store
                        .reconcile_with_audit(&prepared.records, &run)
                        .await
                        .with_context(|| format!("reconciling {} into the store", file.display()))?;
                    Some(stats)
                }
                None => {
                    info!(records = prepared.records.len(), "dry run; store left untouched");
                    None
                }
            };

            let mut run_summary = ImportRunSummary {
                run_id,
                city: self.config.city.clone(),
                source_file: file.display().to_string(),
                source_sha256,
                started_at,
                finished_at: Utc::now(),
                dry_run: store.is_none(),
                mapping,
                prepared_records: prepared.records.len(),
                rejections: prepared.summary,
                stats,
                warnings,
                report_dir: None,
            };

            if let Some(reports_dir) = &self.config.reports_dir {
                let dir = write_reports(reports_dir, &run_summary).await?;
                run_summary.report_dir = Some(dir.display().to_string());
            }

            Ok(run_summary)
        }
        .instrument(span)
        .await
    }

    /// Read `file` once, returning the parsed table and the sha256 of exactly those bytes.
    async fn load(&self, file: &Path) -> Result<(Table, String)> {
        let bytes = fs::read(file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;
        let source_sha256 = sha256_hex(&bytes);
        let path = file.to_path_buf();
        let options = self.config.read_options.clone();
        let table = tokio::task::spawn_blocking(move || parse_table(&path, bytes, &options))
            .await
            .context("joining tabular reader task")?
            .with_context(|| format!("loading {}", file.display()))?;
        Ok((table, source_sha256))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

async fn write_reports(reports_root: &Path, summary: &ImportRunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing import report")?;
    fs::write(dir.join("import_report.json"), json)
        .await
        .context("writing import_report.json")?;
    fs::write(dir.join("import_brief.md"), render_brief(summary))
        .await
        .context("writing import_brief.md")?;

    Ok(dir)
}

pub fn render_brief(summary: &ImportRunSummary) -> String {
    let optional = |column: &Option<String>| {
        column
            .as_deref()
            .map(|c| format!("`{c}`"))
            .unwrap_or_else(|| "not detected".to_string())
    };
    let outcome = match &summary.stats {
        Some(stats) => format!(
            "- Imported: {}\n- Preserved assignments: {}\n- New unassigned: {}",
            stats.total_imported, stats.preserved_assignments, stats.new_unassigned
        ),
        None => format!(
            "- Dry run: {} records prepared, store untouched",
            summary.prepared_records
        ),
    };

    let warnings = if summary.warnings.is_empty() {
        String::new()
    } else {
        let lines = summary
            .warnings
            .iter()
            .map(|w| format!("- {w}"))
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n## Warnings\n{lines}\n")
    };

    format!(
        "# Address Import Brief\n\n- Run ID: `{}`\n- City: {}\n- Source: `{}` (sha256 `{}`)\n- Started: {}\n- Finished: {}\n\n## Columns\n- street: `{}`\n- number: `{}`\n- postal: {}\n- sector: {}\n\n## Rows\n- Input rows: {}\n- Filtered (empty): {}\n- Duplicates removed: {}\n\n## Outcome\n{}\n{}",
        summary.run_id,
        summary.city,
        summary.source_file,
        summary.source_sha256,
        summary.started_at,
        summary.finished_at,
        summary.mapping.street,
        summary.mapping.number,
        optional(&summary.mapping.postal),
        optional(&summary.mapping.sector),
        summary.rejections.input_rows,
        summary.rejections.filtered_empty,
        summary.rejections.duplicates_removed,
        outcome,
        warnings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn city_labels_become_file_safe_slugs() {
        assert_eq!(city_slug("Trois-Rivières"), "trois-rivieres");
        assert_eq!(city_slug("  Saint-Jean-sur-Richelieu "), "saint-jean-sur-richelieu");
        assert_eq!(city_slug("L'Île-Perrot"), "l-ile-perrot");
        assert_eq!(city_slug("***"), "default");
        assert_eq!(default_database_url("Laval"), "sqlite://data/laval.db");
    }

    #[test]
    fn database_directory_is_created_for_file_urls() {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("city.db");
        ensure_database_dir(&format!("sqlite://{}?mode=rwc", db_path.display()))
            .expect("create dir");
        assert!(dir.path().join("nested").is_dir());
        ensure_database_dir("sqlite::memory:").expect("memory url");
    }

    #[test]
    fn database_paths_come_from_file_urls_only() {
        assert_eq!(
            database_path("sqlite://data/laval.db?mode=rwc"),
            Some(PathBuf::from("data/laval.db"))
        );
        assert_eq!(database_path("sqlite:roll.db"), Some(PathBuf::from("roll.db")));
        assert_eq!(database_path("sqlite::memory:"), None);
        assert_eq!(database_path("postgres://localhost/roll"), None);
    }

    #[tokio::test]
    async fn status_of_a_missing_database_creates_nothing() {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("data").join("nowhere.db");
        let mut config = ImportConfig::new("Nowhere");
        config.database_url = format!("sqlite://{}", db_path.display());

        assert!(read_status(&config).await.expect("status").is_none());
        assert!(!db_path.exists());
        assert!(!dir.path().join("data").exists());
    }

    #[tokio::test]
    async fn loaded_hash_matches_the_parsed_bytes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("roll.csv");
        let contents = "nomrue,nociv\nRue A,1\n";
        std::fs::write(&path, contents).expect("write");
        let pipeline = ImportPipeline::new(ImportConfig::new("Laval")).expect("pipeline");

        let (table, sha) = pipeline.load(&path).await.expect("load");
        assert_eq!(sha, sha256_hex(contents.as_bytes()));
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn rules_file_feeds_the_detector() {
        let dir = tempdir().expect("tempdir");
        let rules_path = dir.path().join("columns.yaml");
        std::fs::write(&rules_path, "version: 1\nfields:\n  number: [\"adr_no\"]\n").expect("write");
        let mut config = ImportConfig::new("Laval");
        config.rules_file = Some(rules_path);
        let pipeline = ImportPipeline::new(config).expect("pipeline");
        let mapping = pipeline
            .detector
            .detect(&["adr_no".to_string(), "nomrue".to_string()])
            .expect("mapping");
        assert_eq!(mapping.number, "adr_no");
    }

    #[test]
    fn brief_mentions_dry_runs() {
        let summary = ImportRunSummary {
            run_id: Uuid::nil(),
            city: "Laval".into(),
            source_file: "roll.csv".into(),
            source_sha256: "abc".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dry_run: true,
            mapping: FieldMapping {
                street: "nomrue".into(),
                number: "nociv".into(),
                postal: None,
                sector: Some("secteur".into()),
            },
            prepared_records: 3,
            rejections: RejectionSummary::default(),
            stats: None,
            warnings: Vec::new(),
            report_dir: None,
        };
        let brief = render_brief(&summary);
        assert!(!brief.contains("## Warnings"));
        assert!(brief.contains("- postal: not detected"));
        assert!(brief.contains("- sector: `secteur`"));
        assert!(brief.contains("Dry run: 3 records prepared"));
    }
}
