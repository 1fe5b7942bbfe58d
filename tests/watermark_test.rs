// ABOUTME: Integration tests for per-table change-tracking watermarks
// ABOUTME: Checks file naming per dialect, persistence, and tolerance of bad files

use incremental_extractor::tracking::watermark::WatermarkStore;
use incremental_extractor::{Dialect, TableRef};
use tempfile::tempdir;

#[tokio::test]
async fn missing_watermark_means_first_run() {
    let dir = tempdir().unwrap();
    let store = WatermarkStore::new(dir.path().join("watermarks"));
    let table = TableRef::parse("VENTAS");

    assert_eq!(store.load(Dialect::Oracle, &table).await, None);
    assert_eq!(store.load_or_zero(Dialect::Oracle, &table).await, 0);
}

#[tokio::test]
async fn save_then_load_per_dialect() {
    let dir = tempdir().unwrap();
    let store = WatermarkStore::new(dir.path().join("watermarks"));
    let table = TableRef::parse("dbo.VENTAS");

    store.save(Dialect::SqlServer, &table, 1050).await.unwrap();
    store.save(Dialect::Oracle, &table, 88_000_000).await.unwrap();

    assert_eq!(store.load(Dialect::SqlServer, &table).await, Some(1050));
    assert_eq!(store.load(Dialect::Oracle, &table).await, Some(88_000_000));

    let ct_path = store.path_for(Dialect::SqlServer, &table);
    assert_eq!(
        ct_path.file_name().unwrap().to_str().unwrap(),
        "ctversion_dbo_VENTAS.txt"
    );
    assert_eq!(std::fs::read_to_string(&ct_path).unwrap(), "1050");
    assert_eq!(
        store
            .path_for(Dialect::Oracle, &table)
            .file_name()
            .unwrap()
            .to_str()
            .unwrap(),
        "scn_dbo_VENTAS.txt"
    );
}

#[tokio::test]
async fn later_save_overwrites() {
    let dir = tempdir().unwrap();
    let store = WatermarkStore::new(dir.path());
    let table = TableRef::parse("CLIENTES");

    store.save(Dialect::SqlServer, &table, 1000).await.unwrap();
    store.save(Dialect::SqlServer, &table, 1050).await.unwrap();
    assert_eq!(store.load(Dialect::SqlServer, &table).await, Some(1050));
    assert!(!store
        .path_for(Dialect::SqlServer, &table)
        .with_extension("txt.tmp")
        .exists());
}

#[tokio::test]
async fn unparsable_watermark_is_ignored() {
    let dir = tempdir().unwrap();
    let store = WatermarkStore::new(dir.path());
    let table = TableRef::parse("VENTAS");
    std::fs::write(store.path_for(Dialect::Oracle, &table), "not-a-number\n").unwrap();

    assert_eq!(store.load(Dialect::Oracle, &table).await, None);

    std::fs::write(store.path_for(Dialect::Oracle, &table), " 42 \n").unwrap();
    assert_eq!(store.load(Dialect::Oracle, &table).await, Some(42));
}
