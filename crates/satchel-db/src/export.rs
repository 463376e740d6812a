//! Export and import: per collection, a file of concatenated encoded
//! documents plus a JSON manifest describing options and indexes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use satchel_document::{decode, encode};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::DbError;
use crate::index::{IndexKind, IndexOp};
use crate::options::CollectionOptions;

/// Single documents above this size are rejected on import.
const MAX_IMPORT_DOC: usize = 64 << 20;

#[derive(Debug, Serialize, Deserialize)]
struct ExportManifest {
    name: String,
    options: CollectionOptions,
    indexes: Vec<ExportIndex>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportIndex {
    path: String,
    /// Kind letters, e.g. `"ns"` for number + string.
    kinds: String,
}

fn io_err(e: std::io::Error) -> DbError {
    DbError::ImportExportIo(e.to_string())
}

impl Database {
    /// Write every collection into `target`: `<name>.bson` holding the
    /// concatenated encoded documents, `<name>.json` the manifest.
    pub fn export_to(&self, target: impl AsRef<Path>) -> Result<(), DbError> {
        let target = target.as_ref();
        std::fs::create_dir_all(target).map_err(io_err)?;
        for name in self.collection_names() {
            let Some(collection) = self.collection(&name) else {
                continue;
            };
            let data_path = target.join(format!("{name}.bson"));
            let mut writer =
                BufWriter::new(File::create(&data_path).map_err(io_err)?);
            let mut write_error: Option<DbError> = None;
            collection.for_each(|_oid, doc| {
                let bytes = encode(&doc).map_err(|e| DbError::InvalidDocument(e.to_string()))?;
                if let Err(e) = writer.write_all(&bytes) {
                    write_error = Some(io_err(e));
                    return Ok(false);
                }
                Ok(true)
            })?;
            if let Some(e) = write_error {
                return Err(e);
            }
            writer.flush().map_err(io_err)?;

            let mut kinds_by_path: BTreeMap<String, String> = BTreeMap::new();
            for index in collection.indexes() {
                kinds_by_path
                    .entry(index.path.clone())
                    .or_default()
                    .push(index.kind.letter());
            }
            let manifest = ExportManifest {
                name: name.clone(),
                options: collection.options().clone(),
                indexes: kinds_by_path
                    .into_iter()
                    .map(|(path, kinds)| ExportIndex { path, kinds })
                    .collect(),
            };
            let json = serde_json::to_string_pretty(&manifest)?;
            std::fs::write(target.join(format!("{name}.json")), json).map_err(io_err)?;
        }
        Ok(())
    }

    /// Read exported pairs from `source`. With `recreate` existing
    /// collections are dropped and rebuilt from the dump; otherwise
    /// documents merge into what is already there.
    pub fn import_from(&self, source: impl AsRef<Path>, recreate: bool) -> Result<(), DbError> {
        let source = source.as_ref();
        for entry in std::fs::read_dir(source).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let json = std::fs::read_to_string(&path).map_err(io_err)?;
            let manifest: ExportManifest = serde_json::from_str(&json)?;

            if recreate && self.collection(&manifest.name).is_some() {
                self.remove_collection(&manifest.name, true)?;
            }
            let collection = self.get_or_create(&manifest.name, manifest.options.clone())?;

            let data_path = source.join(format!("{}.bson", manifest.name));
            if data_path.exists() {
                let mut reader = BufReader::new(File::open(&data_path).map_err(io_err)?);
                loop {
                    let mut len_bytes = [0u8; 4];
                    match reader.read_exact(&mut len_bytes) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(io_err(e)),
                    }
                    let total = i32::from_le_bytes(len_bytes);
                    if total < 5 {
                        return Err(DbError::InvalidDocument(
                            "import frame length is corrupt".into(),
                        ));
                    }
                    let total = total as usize;
                    if total > MAX_IMPORT_DOC {
                        return Err(DbError::DocumentTooLarge);
                    }
                    let mut frame = vec![0u8; total];
                    frame[..4].copy_from_slice(&len_bytes);
                    reader.read_exact(&mut frame[4..]).map_err(io_err)?;
                    let doc =
                        decode(&frame).map_err(|e| DbError::InvalidDocument(e.to_string()))?;
                    collection.save(&doc, !recreate)?;
                }
            }

            for index in &manifest.indexes {
                let kinds: Vec<IndexKind> =
                    index.kinds.chars().filter_map(IndexKind::from_letter).collect();
                if !kinds.is_empty() {
                    self.set_index(&manifest.name, &index.path, &kinds, IndexOp::Ensure)?;
                }
            }
        }
        Ok(())
    }
}
