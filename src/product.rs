//! Persisted artifacts and their build records.
//!
//! Every artifact owns a small CBOR sidecar (`.<name>.record`) holding the
//! fingerprints it was last built from. Comparing those against the current
//! fingerprints yields the two staleness signals used by the scheduler:
//!
//! * **code staleness**, the task's own source changed;
//! * **data staleness**, some upstream artifact changed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};
use crate::error::{ConfigError, RecordError};

/// Fingerprints a product was last successfully built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Fingerprint of the task source.
    pub code: Hash32,
    /// Fingerprints of every upstream product. Order is irrelevant.
    pub upstream: BTreeSet<Hash32>,
}

/// A single artifact on disk.
#[derive(Debug, Clone)]
pub struct FileProduct {
    path: Utf8PathBuf,
    record: Option<BuildRecord>,
}

impl FileProduct {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        let mut product = Self {
            path: path.into(),
            record: None,
        };
        product.refresh();
        product
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Location of the sidecar build record.
    pub fn record_path(&self) -> Utf8PathBuf {
        let name = self.path.file_name().unwrap_or("product");
        self.path.with_file_name(format!(".{name}.record"))
    }

    pub fn record(&self) -> Option<&BuildRecord> {
        self.record.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Hash of the artifact bytes, [`Hash32::MISSING`] if there is none.
    pub fn fingerprint(&self) -> std::io::Result<Hash32> {
        match Hash32::hash_file(&self.path) {
            Ok(hash) => Ok(hash),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Hash32::MISSING),
            Err(e) => Err(e),
        }
    }

    pub fn is_code_stale(&self, code: Hash32) -> bool {
        self.record.as_ref().is_none_or(|record| record.code != code)
    }

    pub fn is_data_stale(&self, upstream: &BTreeSet<Hash32>) -> bool {
        self.record
            .as_ref()
            .is_none_or(|record| &record.upstream != upstream)
    }

    /// Re-reads the build record from disk.
    pub fn refresh(&mut self) {
        let path = self.record_path();

        self.record = match File::open(&path) {
            Ok(file) => match ciborium::from_reader(BufReader::new(file)) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable build record {path}: {e}");
                    None
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!("Ignoring unreadable build record {path}: {e}");
                None
            }
        };
    }

    /// Atomically replaces the build record.
    pub fn record_build(
        &mut self,
        code: Hash32,
        upstream: BTreeSet<Hash32>,
    ) -> Result<(), RecordError> {
        let record = BuildRecord { code, upstream };
        let path = self.record_path();

        let dir = match path.parent() {
            Some(dir) if !dir.as_str().is_empty() => dir,
            _ => Utf8Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        ciborium::into_writer(&record, &mut temp)?;
        temp.persist(&path)?;

        tracing::debug!(product = %self.path, code = %code.short(), "recorded build");
        self.record = Some(record);
        Ok(())
    }
}

/// Several correlated artifacts produced by one task, addressed by key.
#[derive(Debug, Clone)]
pub struct MetaProduct {
    members: BTreeMap<String, FileProduct>,
}

impl MetaProduct {
    pub fn new<K, P>(members: impl IntoIterator<Item = (K, P)>) -> Result<Self, ConfigError>
    where
        K: Into<String>,
        P: Into<Utf8PathBuf>,
    {
        let members: BTreeMap<_, _> = members
            .into_iter()
            .map(|(key, path)| (key.into(), FileProduct::new(path)))
            .collect();

        if members.is_empty() {
            return Err(ConfigError::EmptyMetaProduct);
        }

        Ok(Self { members })
    }

    /// Looks up a member, failing with the list of valid keys.
    pub fn get(&self, key: &str) -> Result<&FileProduct, ConfigError> {
        self.members
            .get(key)
            .ok_or_else(|| ConfigError::MissingProductKey {
                key: key.to_string(),
                valid: self.valid_keys(),
            })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &FileProduct)> {
        self.members.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn valid_keys(&self) -> String {
        self.members
            .keys()
            .map(|key| format!("\"{key}\""))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// What a task persists: one artifact, or a keyed set of them.
#[derive(Debug, Clone)]
pub enum Product {
    File(FileProduct),
    Meta(MetaProduct),
}

impl Product {
    pub fn file(path: impl Into<Utf8PathBuf>) -> Self {
        Product::File(FileProduct::new(path))
    }

    pub fn meta<K, P>(members: impl IntoIterator<Item = (K, P)>) -> Result<Self, ConfigError>
    where
        K: Into<String>,
        P: Into<Utf8PathBuf>,
    {
        Ok(Product::Meta(MetaProduct::new(members)?))
    }

    fn files(&self) -> Box<dyn Iterator<Item = &FileProduct> + '_> {
        match self {
            Product::File(file) => Box::new(std::iter::once(file)),
            Product::Meta(meta) => Box::new(meta.members.values()),
        }
    }

    /// Whether every backing artifact is present.
    pub fn exists(&self) -> bool {
        self.files().all(FileProduct::exists)
    }

    pub fn is_code_stale(&self, code: Hash32) -> bool {
        self.files().any(|file| file.is_code_stale(code))
    }

    pub fn is_data_stale(&self, upstream: &BTreeSet<Hash32>) -> bool {
        self.files().any(|file| file.is_data_stale(upstream))
    }

    /// Fingerprint of the artifact contents. Meta products combine their
    /// members' fingerprints together with their keys.
    pub fn fingerprint(&self) -> std::io::Result<Hash32> {
        match self {
            Product::File(file) => file.fingerprint(),
            Product::Meta(meta) => {
                let mut hasher = Blake3Hasher::default();
                for (key, file) in &meta.members {
                    hasher.update(key).update(file.fingerprint()?.to_hex());
                }
                Ok(hasher.finish())
            }
        }
    }

    pub fn refresh(&mut self) {
        match self {
            Product::File(file) => file.refresh(),
            Product::Meta(meta) => meta.members.values_mut().for_each(FileProduct::refresh),
        }
    }

    pub fn record_build(
        &mut self,
        code: Hash32,
        upstream: BTreeSet<Hash32>,
    ) -> Result<(), RecordError> {
        match self {
            Product::File(file) => file.record_build(code, upstream),
            Product::Meta(meta) => {
                for file in meta.members.values_mut() {
                    file.record_build(code, upstream.clone())?;
                }
                Ok(())
            }
        }
    }

    /// Looks up a keyed member. A plain product has no keys.
    pub fn get(&self, key: &str) -> Result<&FileProduct, ConfigError> {
        match self {
            Product::Meta(meta) => meta.get(key),
            Product::File(_) => Err(ConfigError::MissingProductKey {
                key: key.to_string(),
                valid: String::new(),
            }),
        }
    }

    pub fn paths(&self) -> ProductPaths {
        match self {
            Product::File(file) => ProductPaths::Single(file.path.clone()),
            Product::Meta(meta) => ProductPaths::Keyed(
                meta.members
                    .iter()
                    .map(|(key, file)| (key.clone(), file.path.clone()))
                    .collect(),
            ),
        }
    }
}

impl From<FileProduct> for Product {
    fn from(value: FileProduct) -> Self {
        Product::File(value)
    }
}

impl From<MetaProduct> for Product {
    fn from(value: MetaProduct) -> Self {
        Product::Meta(value)
    }
}

/// Plain locations of a product, as handed to running code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProductPaths {
    Single(Utf8PathBuf),
    Keyed(BTreeMap<String, Utf8PathBuf>),
}

impl ProductPaths {
    /// The path stored under `key`, never set for a single path.
    pub fn get(&self, key: &str) -> Option<&Utf8Path> {
        match self {
            ProductPaths::Single(_) => None,
            ProductPaths::Keyed(map) => map.get(key).map(Utf8PathBuf::as_path),
        }
    }

    pub fn single(&self) -> Option<&Utf8Path> {
        match self {
            ProductPaths::Single(path) => Some(path),
            ProductPaths::Keyed(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Option<&str>, &Utf8Path)> {
        let items: Vec<_> = match self {
            ProductPaths::Single(path) => vec![(None, path.as_path())],
            ProductPaths::Keyed(map) => map
                .iter()
                .map(|(key, path)| (Some(key.as_str()), path.as_path()))
                .collect(),
        };
        items.into_iter()
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            ProductPaths::Single(path) => serde_json::Value::String(path.to_string()),
            ProductPaths::Keyed(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(key, path)| (key.clone(), serde_json::Value::String(path.to_string())))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for ProductPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductPaths::Single(path) => write!(f, "{path}"),
            ProductPaths::Keyed(map) => {
                let items: Vec<_> = map.iter().map(|(k, v)| format!("{k}: {v}")).collect();
                write!(f, "{{{}}}", items.join(", "))
            }
        }
    }
}
