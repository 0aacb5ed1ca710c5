//! End-to-end pipeline runs against an on-disk SQLite store.
//!
//! Mirrors the catalog refresh exercise: load a catalog, modify 20 products
//! (raise prices, retitle some, touch bookkeeping columns), re-run, and check
//! that exactly those products were versioned and a backup was written.

use chrono::{DateTime, TimeZone, Utc};
use std::fs;
use std::path::Path;

use scd_dimension::{
    db, CheckCode, CsvSnapshot, EntityId, MissingPolicy, Pipeline, PipelineConfig, ScdError,
};

const CATALOG_SIZE: usize = 120;

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 5, d, 3, 15, 0).unwrap()
}

struct Product {
    id: usize,
    title: String,
    price: f64,
    updated_at: String,
}

fn catalog() -> Vec<Product> {
    (1..=CATALOG_SIZE)
        .map(|id| Product {
            id,
            title: format!("Product {}", id),
            price: 5.0 + id as f64,
            updated_at: "2025-05-01".to_string(),
        })
        .collect()
}

fn write_snapshot(path: &Path, products: &[Product], scraped_at: &str) {
    let mut csv = String::from("product_id,title,price,currency,updated_at,scraped_at\n");
    for p in products {
        csv.push_str(&format!(
            "{},{},{},USD,{},{}\n",
            p.id, p.title, p.price, p.updated_at, scraped_at
        ));
    }
    fs::write(path, csv).unwrap();
}

fn modified_ids() -> Vec<usize> {
    (1..=20).map(|i| i * 6).collect()
}

fn modify(products: &mut [Product]) {
    for id in modified_ids() {
        let p = &mut products[id - 1];
        p.price = (p.price * 1.2 * 100.0).round() / 100.0;
        if id % 4 == 0 {
            p.title = format!("Updated - {}", p.title);
        }
        p.updated_at = "2025-05-02".to_string();
    }
}

fn config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.storage.db_path = dir.join("dimension.db");
    config.storage.backup_dir = Some(dir.join("backups"));
    config
}

#[test]
fn test_modify_twenty_products_versions_exactly_those() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let snapshot_path = dir.path().join("products.csv");
    let mut conn = db::open_database(&config.storage.db_path).unwrap();
    let pipeline = Pipeline::new(config.clone());
    let source = CsvSnapshot::new(&snapshot_path, "product_id", config.attributes.clone());

    let mut products = catalog();
    write_snapshot(&snapshot_path, &products, "2025-05-01T00:00:00");
    let initial = pipeline.run_source(&mut conn, &source, day(1)).unwrap();

    assert_eq!(initial.inserted, CATALOG_SIZE);
    assert_eq!(initial.closed, 0);
    assert!(initial.report.passed());
    assert!(initial.report.findings.is_empty());
    let first_backup = initial.backup_path.clone().unwrap();
    assert!(first_backup.ends_with("product_catalog_backup_post_run_20250501.db"));
    assert!(first_backup.exists());

    modify(&mut products);
    // Every row gets a new scrape time; that alone must not version anything
    write_snapshot(&snapshot_path, &products, "2025-05-02T00:00:00");
    let refresh = pipeline.run_source(&mut conn, &source, day(2)).unwrap();

    assert_eq!(refresh.closed, 20);
    assert_eq!(refresh.inserted, 20);
    assert_eq!(refresh.stats.changed_entities, 20);
    assert_eq!(refresh.stats.unchanged_entities, CATALOG_SIZE - 20);
    assert!(refresh.report.passed());
    assert_eq!(refresh.report.stats.total_rows, CATALOG_SIZE + 20);
    assert_eq!(refresh.report.stats.historical_rows, 20);
    assert!(refresh
        .backup_path
        .as_ref()
        .unwrap()
        .ends_with("product_catalog_backup_post_run_20250502.db"));

    for id in modified_ids() {
        let history = db::load_entity_history(&conn, &EntityId::from(id as i64)).unwrap();
        assert_eq!(history.len(), 2, "product {} should have two versions", id);
        assert_eq!(history[0].valid_to, Some(day(2)));
        assert_eq!(history[1].valid_from, Some(day(2)));
        assert!(history[1].is_current);
        assert_eq!(
            history[0].attribute("price").and_then(|v| v.as_f64()),
            Some(5.0 + id as f64)
        );
    }

    let untouched = db::load_entity_history(&conn, &EntityId::new("1")).unwrap();
    assert_eq!(untouched.len(), 1);
    assert_eq!(untouched[0].valid_from, Some(day(1)));

    // Same snapshot again: nothing to do
    let rerun = pipeline.run_source(&mut conn, &source, day(3)).unwrap();
    assert_eq!(rerun.inserted, 0);
    assert_eq!(rerun.closed, 0);
    assert_eq!(db::verify_count(&conn).unwrap(), (CATALOG_SIZE + 20) as i64);
}

#[test]
fn test_as_of_reconstructs_previous_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let snapshot_path = dir.path().join("products.csv");
    let mut conn = db::open_database(&config.storage.db_path).unwrap();
    let pipeline = Pipeline::new(config.clone());
    let source = CsvSnapshot::new(&snapshot_path, "product_id", config.attributes.clone());

    let mut products = catalog();
    write_snapshot(&snapshot_path, &products, "t1");
    pipeline.run_source(&mut conn, &source, day(1)).unwrap();
    modify(&mut products);
    write_snapshot(&snapshot_path, &products, "t2");
    pipeline.run_source(&mut conn, &source, day(2)).unwrap();

    let before = db::load_versions_as_of(&conn, day(1) + chrono::Duration::hours(12)).unwrap();
    let after = db::load_versions_as_of(&conn, day(2)).unwrap();

    assert_eq!(before.len(), CATALOG_SIZE);
    assert_eq!(after.len(), CATALOG_SIZE);
    let price_of = |versions: &[scd_dimension::VersionRecord], id: &str| {
        versions
            .iter()
            .find(|v| v.entity_id.as_str() == id)
            .and_then(|v| v.attribute("price"))
            .and_then(|v| v.as_f64())
    };
    assert_eq!(price_of(&before, "6"), Some(11.0));
    assert_eq!(price_of(&after, "6"), Some(13.2));
}

#[test]
fn test_small_catalog_warns_but_publishes() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let snapshot_path = dir.path().join("products.csv");
    let mut conn = db::open_database(&config.storage.db_path).unwrap();
    let pipeline = Pipeline::new(config.clone());
    let source = CsvSnapshot::new(&snapshot_path, "product_id", config.attributes.clone());

    let products: Vec<Product> = catalog().into_iter().take(10).collect();
    write_snapshot(&snapshot_path, &products, "t1");
    let run = pipeline.run_source(&mut conn, &source, day(1)).unwrap();

    assert!(run.report.passed());
    assert!(run.report.has_code(CheckCode::LowVolume));
    assert!(run.backup_path.is_some());
}

#[test]
fn test_bad_snapshot_is_rejected_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let snapshot_path = dir.path().join("products.csv");
    let mut conn = db::open_database(&config.storage.db_path).unwrap();
    let pipeline = Pipeline::new(config.clone());
    let source = CsvSnapshot::new(&snapshot_path, "product_id", config.attributes.clone());

    fs::write(
        &snapshot_path,
        "product_id,title,price\n1,Mug,10\n2,Teapot,0\n",
    )
    .unwrap();
    let err = pipeline.run_source(&mut conn, &source, day(1)).unwrap_err();

    let scd = err.downcast_ref::<ScdError>().unwrap();
    assert_eq!(scd.kind(), "InputIntegrityError");
    assert_eq!(scd.entity_id(), Some(&EntityId::new("2")));
    assert_eq!(db::verify_count(&conn).unwrap(), 0);
    assert!(!dir.path().join("backups").exists());
}

#[test]
fn test_close_policy_retires_and_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.merge.on_missing = MissingPolicy::Close;
    config.gate.min_row_floor = 1;
    let snapshot_path = dir.path().join("products.csv");
    let mut conn = db::open_database(&config.storage.db_path).unwrap();
    let pipeline = Pipeline::new(config.clone());
    let source = CsvSnapshot::new(&snapshot_path, "product_id", config.attributes.clone());

    let products = catalog();
    write_snapshot(&snapshot_path, &products[..3], "t1");
    pipeline.run_source(&mut conn, &source, day(1)).unwrap();

    write_snapshot(&snapshot_path, &products[..2], "t2");
    let retire = pipeline.run_source(&mut conn, &source, day(2)).unwrap();
    assert_eq!(retire.closed, 1);
    assert_eq!(retire.inserted, 0);
    assert_eq!(db::count_current(&conn).unwrap(), 2);

    write_snapshot(&snapshot_path, &products[..3], "t3");
    let reopen = pipeline.run_source(&mut conn, &source, day(3)).unwrap();
    assert_eq!(reopen.inserted, 1);
    assert_eq!(reopen.stats.new_entities, 1);

    let history = db::load_entity_history(&conn, &EntityId::new("3")).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].valid_to, Some(day(2)));
    assert_eq!(history[1].valid_from, Some(day(3)));
    assert_ne!(history[0].surrogate_version_id, history[1].surrogate_version_id);
}
