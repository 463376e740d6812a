use std::collections::BTreeMap;

use crate::document::Document;
use crate::path::{remove_path, set_path};
use crate::value::Value;

/// Field selection applied by [`strip`].
///
/// `paths` is interpreted as an include-set or an exclude-set; a listed
/// path covers its whole subtree. `rename` moves matched values to new
/// dotted paths after selection; with `collect` the renamed values are
/// routed into a second "collector" document instead of the stripped
/// output.
#[derive(Debug, Clone, Default)]
pub struct StripSpec {
    pub include: bool,
    pub paths: Vec<String>,
    pub rename: Vec<(String, String)>,
    pub collect: bool,
}

#[derive(Default)]
struct Trie {
    children: BTreeMap<String, Trie>,
    terminal: bool,
}

impl Trie {
    fn build(paths: &[String]) -> Trie {
        let mut root = Trie::default();
        for path in paths {
            let mut node = &mut root;
            for segment in path.split('.') {
                node = node.children.entry(segment.to_string()).or_default();
            }
            node.terminal = true;
        }
        root
    }
}

/// Produce a new document keeping or omitting exactly the listed
/// paths, then apply renames. Returns `(stripped, collector)`; the
/// collector is present only when `collect` renames matched something.
pub fn strip(doc: &Document, spec: &StripSpec) -> (Document, Option<Document>) {
    let trie = Trie::build(&spec.paths);
    let mut out = if spec.include {
        project_include(doc, &trie)
    } else {
        project_exclude(doc, &trie)
    };

    let mut collector: Option<Document> = None;
    for (src, dst) in &spec.rename {
        let Some(value) = remove_path(&mut out, src) else {
            continue;
        };
        if spec.collect {
            let target = collector.get_or_insert_with(Document::new);
            let _ = set_path(target, dst, value);
        } else {
            let _ = set_path(&mut out, dst, value);
        }
    }
    (out, collector)
}

fn project_include(doc: &Document, node: &Trie) -> Document {
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        let Some(child) = node.children.get(key) else {
            continue;
        };
        if child.terminal {
            out.push(key, value.clone());
            continue;
        }
        match include_value(value, child) {
            Some(kept) => out.push(key, kept),
            None => {}
        }
    }
    out
}

fn include_value(value: &Value, node: &Trie) -> Option<Value> {
    match value {
        Value::Object(sub) => {
            let projected = project_include(sub, node);
            if projected.is_empty() {
                None
            } else {
                Some(Value::Object(projected))
            }
        }
        Value::Array(items) => {
            let mut kept = Vec::new();
            for (i, item) in items.iter().enumerate() {
                // a numeric trie segment addresses one element; otherwise
                // the remainder applies across object elements
                if let Some(child) = node.children.get(&i.to_string()) {
                    if child.terminal {
                        kept.push(item.clone());
                    } else if let Some(v) = include_value(item, child) {
                        kept.push(v);
                    }
                } else if let Value::Object(sub) = item {
                    let projected = project_include(sub, node);
                    if !projected.is_empty() {
                        kept.push(Value::Object(projected));
                    }
                }
            }
            if kept.is_empty() { None } else { Some(Value::Array(kept)) }
        }
        _ => None,
    }
}

fn project_exclude(doc: &Document, node: &Trie) -> Document {
    let mut out = Document::new();
    for (key, value) in doc.iter() {
        match node.children.get(key) {
            None => out.push(key, value.clone()),
            Some(child) if child.terminal => {}
            Some(child) => out.push(key, exclude_value(value, child)),
        }
    }
    out
}

fn exclude_value(value: &Value, node: &Trie) -> Value {
    match value {
        Value::Object(sub) => Value::Object(project_exclude(sub, node)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| match node.children.get(&i.to_string()) {
                    Some(child) if child.terminal => None,
                    Some(child) => Some(exclude_value(item, child)),
                    None => match item {
                        Value::Object(sub) => Some(Value::Object(project_exclude(sub, node))),
                        other => Some(other.clone()),
                    },
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        let mut addr = Document::new();
        addr.set("city", Value::String("Austin".into()));
        addr.set("zip", Value::String("78701".into()));
        let mut i0 = Document::new();
        i0.set("sku", Value::String("a".into()));
        i0.set("qty", Value::Int32(1));
        let mut i1 = Document::new();
        i1.set("sku", Value::String("b".into()));
        i1.set("qty", Value::Int32(2));
        let mut doc = Document::new();
        doc.set("name", Value::String("alice".into()));
        doc.set("addr", Value::Object(addr));
        doc.set(
            "items",
            Value::Array(vec![Value::Object(i0), Value::Object(i1)]),
        );
        doc
    }

    fn spec(include: bool, paths: &[&str]) -> StripSpec {
        StripSpec {
            include,
            paths: paths.iter().map(|s| s.to_string()).collect(),
            rename: Vec::new(),
            collect: false,
        }
    }

    #[test]
    fn include_keeps_exactly_listed_paths() {
        let (out, _) = strip(&sample(), &spec(true, &["name", "addr.city"]));
        assert_eq!(out.get("name"), Some(&Value::String("alice".into())));
        let addr = out.get("addr").unwrap().as_object().unwrap();
        assert!(addr.get("city").is_some());
        assert!(addr.get("zip").is_none());
        assert!(out.get("items").is_none());
    }

    #[test]
    fn include_descends_into_array_elements() {
        let (out, _) = strip(&sample(), &spec(true, &["items.sku"]));
        let items = out.get("items").unwrap().as_array().unwrap();
        assert_eq!(items.len(), 2);
        let first = items[0].as_object().unwrap();
        assert!(first.get("sku").is_some());
        assert!(first.get("qty").is_none());
    }

    #[test]
    fn include_numeric_segment_selects_one_element() {
        let (out, _) = strip(&sample(), &spec(true, &["items.1"]));
        let items = out.get("items").unwrap().as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_object().unwrap().get("sku"),
            Some(&Value::String("b".into()))
        );
    }

    #[test]
    fn exclude_drops_exactly_listed_paths() {
        let (out, _) = strip(&sample(), &spec(false, &["addr.zip", "items"]));
        assert!(out.get("name").is_some());
        let addr = out.get("addr").unwrap().as_object().unwrap();
        assert!(addr.get("city").is_some());
        assert!(addr.get("zip").is_none());
        assert!(out.get("items").is_none());
    }

    #[test]
    fn rename_moves_value_in_place() {
        let mut s = spec(true, &["name"]);
        s.rename = vec![("name".into(), "title".into())];
        let (out, collector) = strip(&sample(), &s);
        assert!(collector.is_none());
        assert!(out.get("name").is_none());
        assert_eq!(out.get("title"), Some(&Value::String("alice".into())));
    }

    #[test]
    fn rename_with_collect_splits_output() {
        let mut s = spec(false, &[]);
        s.rename = vec![("addr.city".into(), "city".into())];
        s.collect = true;
        let (out, collector) = strip(&sample(), &s);
        let collector = collector.unwrap();
        assert_eq!(collector.get("city"), Some(&Value::String("Austin".into())));
        let addr = out.get("addr").unwrap().as_object().unwrap();
        assert!(addr.get("city").is_none());
    }
}
