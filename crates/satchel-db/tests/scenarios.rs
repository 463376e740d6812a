//! End-to-end behavior over a real database directory.

mod common;

use common::{arr, doc, i, obj, open_db, s};
use satchel_db::{ExecFlags, IndexKind, IndexOp, Query, Value};

#[test]
fn basic_put_get_update() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);

    let oid = db
        .save("users", &doc(&[("name", s("alice")), ("age", i(30))]))
        .unwrap();

    let loaded = db.load("users", oid).unwrap().unwrap();
    assert_eq!(loaded.oid(), Some(oid));
    assert_eq!(loaded.get("name"), Some(&s("alice")));
    assert_eq!(loaded.get("age"), Some(&i(30)));

    let update = Query::from_document(&doc(&[
        ("name", s("alice")),
        ("$set", obj(&[("age", i(31))])),
    ]))
    .unwrap();
    assert_eq!(db.update("users", &update).unwrap(), 1);

    let loaded = db.load("users", oid).unwrap().unwrap();
    assert_eq!(loaded.get("age"), Some(&i(31)));
}

#[test]
fn number_index_drives_range_queries() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    db.get_or_create("nums", Default::default()).unwrap();
    for k in 0..10_000 {
        db.save("nums", &doc(&[("k", Value::Int32(k))])).unwrap();
    }
    db.set_index("nums", "k", &[IndexKind::Num], IndexOp::Ensure)
        .unwrap();

    let query = Query::from_document(&doc(&[("k", obj(&[("$gte", i(9995))]))])).unwrap();
    let mut found = Vec::new();
    let result = db
        .execute("nums", &query, ExecFlags::default(), None, &mut |d| {
            found.push(d.clone());
            true
        })
        .unwrap();

    assert_eq!(found.len(), 5);
    let mut ks: Vec<i32> = found
        .iter()
        .map(|d| match d.get("k") {
            Some(Value::Int32(n)) => *n,
            other => panic!("missing k: {other:?}"),
        })
        .collect();
    ks.sort();
    assert_eq!(ks, vec![9995, 9996, 9997, 9998, 9999]);
    assert!(
        result.explain.contains("index scan: k"),
        "planner should pick the number index, got: {}",
        result.explain
    );
}

#[test]
fn elem_match_positional_update() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);

    let oid = db
        .save(
            "orders",
            &doc(&[(
                "items",
                arr(&[
                    obj(&[("sku", s("a")), ("qty", i(1))]),
                    obj(&[("sku", s("b")), ("qty", i(2))]),
                    obj(&[("sku", s("c")), ("qty", i(3))]),
                ]),
            )]),
        )
        .unwrap();

    let update = Query::from_document(&doc(&[
        ("items", obj(&[("$elemMatch", obj(&[("sku", s("b"))]))])),
        ("$set", obj(&[("items.$.qty", i(20))])),
    ]))
    .unwrap();
    assert_eq!(db.update("orders", &update).unwrap(), 1);

    let loaded = db.load("orders", oid).unwrap().unwrap();
    let items = loaded.get("items").unwrap().as_array().unwrap();
    let qty = |idx: usize| items[idx].as_object().unwrap().get("qty").cloned();
    assert_eq!(qty(0), Some(i(1)));
    assert_eq!(qty(1), Some(i(20)));
    assert_eq!(qty(2), Some(i(3)));
}

#[test]
fn or_branches_dedup_by_oid() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    for color in ["red", "green", "blue"] {
        db.save("paints", &doc(&[("color", s(color))])).unwrap();
    }

    let query = satchel_query_parse(
        &doc(&[]),
        &[doc(&[("color", s("red"))]), doc(&[("color", s("blue"))])],
    );
    let found = db.find("paints", &query).unwrap();
    assert_eq!(found.len(), 2);
    let mut colors: Vec<&str> = found
        .iter()
        .map(|d| d.get("color").unwrap().as_str().unwrap())
        .collect();
    colors.sort();
    assert_eq!(colors, ["blue", "red"]);

    // a candidate matching several branches still appears once
    let query = satchel_query_parse(
        &doc(&[]),
        &[doc(&[("color", s("red"))]), doc(&[("color", s("red"))])],
    );
    assert_eq!(db.find("paints", &query).unwrap().len(), 1);
}

fn satchel_query_parse(main: &satchel_db::Document, or: &[satchel_db::Document]) -> Query {
    satchel_query::parse_query(main, or, &[], None).unwrap()
}

#[test]
fn add_to_set_only_grows_with_new_members() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let oid = db
        .save("docs", &doc(&[("tags", arr(&[s("a"), s("b")]))]))
        .unwrap();

    let again = Query::from_document(&doc(&[
        ("_id", Value::ObjectId(oid)),
        ("$addToSet", obj(&[("tags", s("b"))])),
    ]))
    .unwrap();
    db.update("docs", &again).unwrap();
    let loaded = db.load("docs", oid).unwrap().unwrap();
    assert_eq!(loaded.get("tags").unwrap().as_array().unwrap().len(), 2);

    let fresh = Query::from_document(&doc(&[
        ("_id", Value::ObjectId(oid)),
        ("$addToSet", obj(&[("tags", s("c"))])),
    ]))
    .unwrap();
    assert_eq!(db.update("docs", &fresh).unwrap(), 1);
    let loaded = db.load("docs", oid).unwrap().unwrap();
    let tags = loaded.get("tags").unwrap().as_array().unwrap();
    assert_eq!(tags, &[s("a"), s("b"), s("c")]);
}

#[test]
fn transaction_abort_restores_collection() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let col = db.get_or_create("txc", Default::default()).unwrap();

    let d1 = col.save(&doc(&[("n", i(1))]), false).unwrap();
    col.begin_tx().unwrap();
    assert!(col.tx_active());
    let d2 = col.save(&doc(&[("n", i(2))]), false).unwrap();
    let d3 = col.save(&doc(&[("n", i(3))]), false).unwrap();
    col.abort_tx().unwrap();

    assert_eq!(col.count().unwrap(), 1);
    assert!(col.load(d1).unwrap().is_some());
    assert!(col.load(d2).unwrap().is_none());
    assert!(col.load(d3).unwrap().is_none());
}

#[test]
fn transaction_commit_keeps_documents() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let col = db.get_or_create("txc", Default::default()).unwrap();

    col.begin_tx().unwrap();
    let oid = col.save(&doc(&[("n", i(7))]), false).unwrap();
    col.commit_tx().unwrap();
    assert!(!col.tx_active());
    assert_eq!(col.count().unwrap(), 1);
    assert_eq!(col.load(oid).unwrap().unwrap().get("n"), Some(&i(7)));
}

#[test]
fn count_matches_find_length() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    for n in 0..50 {
        db.save("c", &doc(&[("n", i(n)), ("even", Value::Bool(n % 2 == 0))]))
            .unwrap();
    }
    let query = Query::from_document(&doc(&[("even", Value::Bool(true))])).unwrap();
    let found = db.find("c", &query).unwrap();
    let count = db.count("c", &query).unwrap();
    assert_eq!(found.len() as u64, count);
    assert_eq!(count, 25);
}

#[test]
fn save_then_load_roundtrips_structure() {
    let dir = tempfile::tempdir().unwrap();
    let db = open_db(&dir);
    let original = doc(&[
        ("name", s("nested")),
        ("meta", obj(&[("depth", i(2)), ("tags", arr(&[s("x"), s("y")]))])),
        ("score", Value::Double(9.75)),
        ("active", Value::Bool(true)),
        ("missing", Value::Null),
    ]);
    let oid = db.save("round", &original).unwrap();
    let loaded = db.load("round", oid).unwrap().unwrap();
    for (key, value) in original.iter() {
        assert_eq!(loaded.get(key), Some(value), "field {key} must survive");
    }
    assert_eq!(loaded.oid(), Some(oid));
}
