use luma_mvcc::tablet::PartialRowWriter;
use luma_mvcc::{Config, MemTablet, ScanSpec, Schema, Value, Version};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const NUM_ROWS: usize = 1_000_000;
const NUM_UPDATES: usize = 10_000;
const UPDATE_VERSIONS: Version = 5;

fn schema() -> Schema {
    "int32 id,int32 uv,int32 pv,int8 city null".parse().unwrap()
}

/// Scan `pv` at `version` and compare it row by row
fn check_pv(tablet: &MemTablet, version: Version, expected: &[i32]) {
    let mut scan = tablet
        .scan(ScanSpec::parse(version, "pv", false).unwrap())
        .unwrap();
    assert_eq!(scan.num_rows(), expected.len());
    let mut offset = 0;
    while let Some(block) = scan.next_scan_block().unwrap() {
        let pv = block.column(0).unwrap().typed::<i32>().unwrap();
        assert_eq!(pv, &expected[offset..offset + pv.len()], "version {} at row {}", version, offset);
        offset += pv.len();
    }
    assert_eq!(offset, expected.len());
}

#[test]
fn test_upsert_million_rows() {
    let tablet = MemTablet::create("/tmp/upsert", schema(), Config::default()).unwrap();
    let schema: Arc<Schema> = tablet.latest_schema();
    let sub = tablet.sub_tablet();

    // version 1: every row inserted once
    let mut expected: Vec<i32> = (0..NUM_ROWS as i32).map(|id| id % 1000).collect();
    let mut row = PartialRowWriter::new(schema.clone());
    let mut writer = sub.begin_write(&schema).unwrap();
    for id in 0..NUM_ROWS as i32 {
        row.set("id", Some(Value::Int32(id))).unwrap();
        row.set("uv", Some(Value::Int32(id * 2))).unwrap();
        row.set("pv", Some(Value::Int32(expected[id as usize]))).unwrap();
        if id % 3 != 0 {
            row.set("city", Some(Value::Int8((id % 100) as i8))).unwrap();
        }
        writer.apply_row(&row.build().unwrap()).unwrap();
    }
    let summary = writer.commit(1).unwrap();
    assert_eq!(summary.inserted, NUM_ROWS);
    assert_eq!(summary.num_rows, NUM_ROWS);

    let mut history = vec![expected.clone()];

    // versions 2..=6: random pv updates
    let mut rng = StdRng::seed_from_u64(42);
    let per_version = NUM_UPDATES / UPDATE_VERSIONS as usize;
    for version in 2..=UPDATE_VERSIONS + 1 {
        let mut writer = sub.begin_write(&schema).unwrap();
        for _ in 0..per_version {
            let id = rng.gen_range(0..NUM_ROWS as i32);
            let pv: i32 = rng.gen_range(-1_000_000..1_000_000);
            row.set("id", Some(Value::Int32(id))).unwrap();
            row.set("pv", Some(Value::Int32(pv))).unwrap();
            writer.apply_row(&row.build().unwrap()).unwrap();
            expected[id as usize] = pv;
        }
        let summary = writer.commit(version).unwrap();
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.updated, per_version);
        assert_eq!(summary.num_rows, NUM_ROWS);
        history.push(expected.clone());
    }

    // every version still reads as it was committed
    for (i, pv) in history.iter().enumerate() {
        check_pv(&tablet, i as Version + 1, pv);
    }

    // columns the updates never touched
    let uv = sub.read_column(UPDATE_VERSIONS + 1, 2).unwrap();
    let city = sub.read_column(UPDATE_VERSIONS + 1, 4).unwrap();
    for rid in (0..NUM_ROWS as u32).step_by(997) {
        assert_eq!(uv.get(rid), Some(Value::Int32(rid as i32 * 2)));
        if rid % 3 == 0 {
            assert!(city.is_null(rid));
        } else {
            assert_eq!(city.get(rid), Some(Value::Int8((rid % 100) as i8)));
        }
    }

    let index = sub.read_index();
    assert_eq!(index.size(), NUM_ROWS);
    assert!(!index.need_rehash());
}

#[test]
fn test_point_gets_follow_versions() {
    let tablet = MemTablet::create("/tmp/upsert-get", schema(), Config::small()).unwrap();

    let mut tx = tablet.create_writetx();
    for id in 0..5000 {
        tx.insert_row([
            ("id", Some(Value::Int32(id))),
            ("uv", Some(Value::Int32(0))),
            ("pv", Some(Value::Int32(id))),
        ])
        .unwrap();
    }
    tablet.commit(tx, 1).unwrap();

    let mut tx = tablet.create_writetx();
    for id in (0..5000).step_by(2) {
        tx.insert_row([("id", Some(Value::Int32(id))), ("pv", Some(Value::Int32(-id)))])
            .unwrap();
    }
    for id in 5000..5010 {
        tx.insert_row([
            ("id", Some(Value::Int32(id))),
            ("uv", Some(Value::Int32(1))),
            ("pv", Some(Value::Int32(id))),
        ])
        .unwrap();
    }
    let summary = tablet.commit(tx, 2).unwrap();
    assert_eq!((summary.inserted, summary.updated), (10, 2500));

    let keys: Vec<Value> = [10, 11, 5005, 9999].iter().map(|&k| Value::Int32(k)).collect();

    let mut v1 = tablet.scan(ScanSpec::parse(1, "pv", true).unwrap()).unwrap();
    let got = v1.get(&keys).unwrap();
    assert_eq!(got.get(0, 0), Some(Value::Int32(10)));
    assert_eq!(got.get(1, 0), Some(Value::Int32(11)));
    // inserted after version 1
    assert_eq!(got.offsets[2], None);
    assert_eq!(got.offsets[3], None);
    assert_eq!(got.num_found(), 2);

    let mut v2 = tablet.scan(ScanSpec::parse(2, "pv", true).unwrap()).unwrap();
    let got = v2.get(&keys).unwrap();
    assert_eq!(got.get(0, 0), Some(Value::Int32(-10)));
    assert_eq!(got.get(1, 0), Some(Value::Int32(11)));
    assert_eq!(got.get(2, 0), Some(Value::Int32(5005)));
    assert_eq!(got.offsets[3], None);
}
