use satchel_db::{Database, DatabaseOptions, Document, Value};

pub fn open_db(dir: &tempfile::TempDir) -> Database {
    Database::open(dir.path().join("db"), DatabaseOptions::default()).unwrap()
}

pub fn doc(pairs: &[(&str, Value)]) -> Document {
    let mut d = Document::new();
    for (k, v) in pairs {
        d.push(*k, v.clone());
    }
    d
}

pub fn s(v: &str) -> Value {
    Value::String(v.to_string())
}

pub fn i(n: i32) -> Value {
    Value::Int32(n)
}

pub fn obj(pairs: &[(&str, Value)]) -> Value {
    Value::Object(doc(pairs))
}

pub fn arr(items: &[Value]) -> Value {
    Value::Array(items.to_vec())
}
