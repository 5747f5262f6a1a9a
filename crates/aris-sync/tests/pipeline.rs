use std::path::{Path, PathBuf};

use aris_storage::{AddressStore, SwapHook};
use aris_sync::{ImportConfig, ImportPipeline};
use async_trait::async_trait;
use tempfile::{tempdir, TempDir};

const ROLL_CSV: &str = "\
NoCiv;nomrue;CodePostal;secteur
123;Rue Émile;;Nord
123;Rue Test;H1A 1A1;Nord
123;Rue Test;;Nord
8;Boulevard des Pins;H2X 1Y4;Sud
10;Avenue du Parc;;Sud
;Rue Sans Numéro;;Sud
45;;;Sud
123;RUE ÉMILE;;Est
77;Chemin d'Oka;J0N 1P0;Ouest
3;Place Ville-Marie;H3B 2E3;Centre
";

fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("write fixture");
    path
}

fn config(dir: &TempDir) -> ImportConfig {
    let mut config = ImportConfig::new("Laval");
    config.database_url = format!("sqlite://{}", dir.path().join("db").join("laval.db").display());
    config
}

struct FailingHook;

#[async_trait]
impl SwapHook for FailingHook {
    async fn before_swap(&self, _staged_rows: usize) -> anyhow::Result<()> {
        anyhow::bail!("disk went away")
    }
}

#[tokio::test]
async fn csv_roll_is_imported_with_expected_counters() {
    let dir = tempdir().expect("tempdir");
    let roll = write_file(&dir, "roll.csv", ROLL_CSV);
    let config = config(&dir);
    let url = config.database_url.clone();

    let summary = ImportPipeline::new(config)
        .expect("pipeline")
        .run(&roll)
        .await
        .expect("import");

    let stats = summary.stats.expect("stats");
    assert_eq!(stats.total_imported, 7);
    assert_eq!(stats.preserved_assignments, 0);
    assert_eq!(stats.new_unassigned, 7);
    assert_eq!(summary.rejections.input_rows, 10);
    assert_eq!(summary.rejections.filtered_empty, 2);
    assert_eq!(summary.rejections.duplicates_removed, 1);
    assert_eq!(summary.mapping.street, "nomrue");
    assert_eq!(summary.mapping.number, "NoCiv");
    assert_eq!(summary.mapping.postal.as_deref(), Some("CodePostal"));
    assert_eq!(summary.source_sha256.len(), 64);

    let store = AddressStore::connect(&url).await.expect("store");
    let rows = store.list_addresses().await.expect("list");
    assert_eq!(rows.len(), 7);
    assert!(rows.iter().any(|row| row.addr_key == "rue emile|123|"));
    assert!(rows.iter().any(|row| row.addr_key == "chemin d oka|77|j0n1p0"));
    let status = store.status().await.expect("status");
    let last_run = status.last_run.expect("audit row");
    assert_eq!(last_run.run_id, summary.run_id);
    assert_eq!(last_run.city, "Laval");
}

#[tokio::test]
async fn assignments_carry_over_between_imports() {
    let dir = tempdir().expect("tempdir");
    let roll = write_file(&dir, "roll.csv", ROLL_CSV);
    let store = AddressStore::connect("sqlite::memory:").await.expect("store");
    let pipeline = ImportPipeline::new(config(&dir)).expect("pipeline");

    pipeline.run_with_store(&store, &roll).await.expect("first");
    assert!(store
        .assign("rue test|123|h1a1a1", Some("TEAM2"))
        .await
        .expect("assign"));

    let second = pipeline.run_with_store(&store, &roll).await.expect("second");
    let stats = second.stats.expect("stats");
    assert_eq!(stats.total_imported, 7);
    assert_eq!(stats.preserved_assignments, 1);
    assert_eq!(stats.new_unassigned, 6);
}

#[tokio::test]
async fn dry_run_leaves_the_database_alone() {
    let dir = tempdir().expect("tempdir");
    let roll = write_file(&dir, "roll.csv", ROLL_CSV);
    let mut config = config(&dir);
    config.dry_run = true;

    let summary = ImportPipeline::new(config)
        .expect("pipeline")
        .run(&roll)
        .await
        .expect("dry run");

    assert!(summary.dry_run);
    assert!(summary.stats.is_none());
    assert_eq!(summary.prepared_records, 7);
    assert!(!dir.path().join("db").exists());
}

#[tokio::test]
async fn undetectable_headers_fail_without_touching_the_store() {
    let dir = tempdir().expect("tempdir");
    let good = write_file(&dir, "roll.csv", ROLL_CSV);
    let bad = write_file(&dir, "bad.csv", "foo,bar\n1,2\n");
    let store = AddressStore::connect("sqlite::memory:").await.expect("store");
    let pipeline = ImportPipeline::new(config(&dir)).expect("pipeline");
    pipeline.run_with_store(&store, &good).await.expect("seed");
    let before = store.list_addresses().await.expect("before");

    let err = pipeline
        .run_with_store(&store, &bad)
        .await
        .expect_err("detection must fail");
    let message = format!("{err:#}");
    assert!(message.contains("street"), "{message}");
    assert!(message.contains("foo"), "{message}");
    assert!(message.contains("bar"), "{message}");

    assert_eq!(store.list_addresses().await.expect("after"), before);
}

#[tokio::test]
async fn column_overrides_win_over_detection() {
    let dir = tempdir().expect("tempdir");
    let roll = write_file(&dir, "roll.csv", "lieu,porte\nRue A,1\nRue B,2\n");
    let mut config = config(&dir);
    config.dry_run = true;
    config.overrides.street = Some("lieu".into());
    config.overrides.number = Some("porte".into());

    let summary = ImportPipeline::new(config)
        .expect("pipeline")
        .run(&roll)
        .await
        .expect("dry run");
    assert_eq!(summary.mapping.street, "lieu");
    assert_eq!(summary.mapping.number, "porte");
    assert_eq!(summary.prepared_records, 2);
}

#[tokio::test]
async fn reports_are_written_per_run() {
    let dir = tempdir().expect("tempdir");
    let roll = write_file(&dir, "roll.csv", ROLL_CSV);
    let reports = dir.path().join("reports");
    let mut config = config(&dir);
    config.reports_dir = Some(reports.clone());

    let summary = ImportPipeline::new(config)
        .expect("pipeline")
        .run(&roll)
        .await
        .expect("import");

    let run_dir = reports.join(summary.run_id.to_string());
    assert_eq!(summary.report_dir.as_deref().map(Path::new), Some(run_dir.as_path()));
    let json: serde_json::Value = serde_json::from_slice(
        &std::fs::read(run_dir.join("import_report.json")).expect("json report"),
    )
    .expect("parse json");
    assert_eq!(json["stats"]["total_imported"], 7);
    assert_eq!(json["rejections"]["duplicates_removed"], 1);
    let brief = std::fs::read_to_string(run_dir.join("import_brief.md")).expect("brief");
    assert!(brief.contains("# Address Import Brief"));
    assert!(brief.contains("- Imported: 7"));
}

#[tokio::test]
async fn failed_swap_keeps_previous_roll() {
    let dir = tempdir().expect("tempdir");
    let roll = write_file(&dir, "roll.csv", ROLL_CSV);
    let replacement = write_file(&dir, "next.csv", "nomrue,nociv\nRue Nouvelle,1\n");
    let config = config(&dir);
    let url = config.database_url.clone();
    let pipeline = ImportPipeline::new(config).expect("pipeline");
    pipeline.run(&roll).await.expect("seed");

    let failing = AddressStore::connect(&url)
        .await
        .expect("store")
        .with_swap_hook(Box::new(FailingHook));
    let err = pipeline
        .run_with_store(&failing, &replacement)
        .await
        .expect_err("swap must abort");
    assert!(format!("{err:#}").contains("disk went away"));
    assert_eq!(failing.count_addresses().await.expect("count"), 7);
}

#[tokio::test]
async fn emptying_a_populated_store_is_flagged() {
    let dir = tempdir().expect("tempdir");
    let roll = write_file(&dir, "roll.csv", ROLL_CSV);
    let unusable = write_file(&dir, "blank.csv", "nomrue,nociv\nRue A,\n,5\n");
    let store = AddressStore::connect("sqlite::memory:").await.expect("store");
    let pipeline = ImportPipeline::new(config(&dir)).expect("pipeline");

    let first = pipeline.run_with_store(&store, &roll).await.expect("seed");
    assert!(first.warnings.is_empty());

    let summary = pipeline
        .run_with_store(&store, &unusable)
        .await
        .expect("import");
    assert_eq!(summary.rejections.filtered_empty, 2);
    assert_eq!(summary.stats.map(|s| s.total_imported), Some(0));
    assert_eq!(summary.warnings.len(), 1);
    assert!(summary.warnings[0].contains("7 existing addresses"));
    assert_eq!(store.count_addresses().await.expect("count"), 0);
}
