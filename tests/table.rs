mod common;

use std::fs;

use serde_json::json;

use common::utf8_tempdir;
use img_dataset_harvester::record::MetadataRecord;
use img_dataset_harvester::table::MetadataTable;

fn record(pairs: &[(&str, serde_json::Value)]) -> MetadataRecord {
    let mut record = MetadataRecord::new();
    for (key, value) in pairs {
        record.insert(*key, value.clone());
    }
    record
}

#[test]
fn columns_are_the_union_with_file_path_last() {
    let records = vec![
        record(&[
            ("dataset_id", json!("a")),
            ("format", json!("TIFF")),
            ("file_path", json!("/data/a.tif")),
            ("compression", json!(1)),
        ]),
        record(&[
            ("dataset_id", json!("s0")),
            ("format", json!("ZARR")),
            ("chunks", json!([64, 64])),
            ("file_path", json!("/data/store.zarr/s0")),
        ]),
    ];
    let table = MetadataTable::from_records(&records);
    assert_eq!(
        table.columns(),
        ["dataset_id", "format", "compression", "chunks", "file_path"]
    );
    assert_eq!(table.rows()[0], vec!["a", "TIFF", "1", "", "/data/a.tif"]);
    assert_eq!(
        table.rows()[1],
        vec!["s0", "ZARR", "", "[64,64]", "/data/store.zarr/s0"]
    );
}

#[test]
fn csv_output_quotes_json_cells() {
    let table = MetadataTable::from_records(&[record(&[
        ("dataset_id", json!("x")),
        ("shape", json!([2, 3])),
        ("resolution", json!(null)),
    ])]);
    let mut out = Vec::new();
    table.write_csv(&mut out).unwrap();
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "dataset_id,shape,resolution\nx,\"[2,3]\",\n"
    );
}

#[test]
fn writing_overwrites_previous_table() {
    let (_temp, root) = utf8_tempdir();
    let path = root.join("metadata_table.csv");
    fs::write(path.as_std_path(), "old,content\n1,2\n3,4\n").unwrap();

    let table = MetadataTable::from_records(&[record(&[("dataset_id", json!("only"))])]);
    table.write_to_path(&path).unwrap();
    assert_eq!(
        fs::read_to_string(path.as_std_path()).unwrap(),
        "dataset_id\nonly\n"
    );
}

#[test]
fn no_records_gives_empty_table() {
    let table = MetadataTable::from_records(&[]);
    assert!(table.is_empty());
    assert!(table.columns().is_empty());
}
