//! Vector memory for NPCs.
//!
//! A [`MemoryStore`] is a flat inner-product index over unit vectors, keyed by
//! an opaque string. It is loaded from a single file on construction and
//! written back as one blob by [`MemoryStore::save`]. Stores are shared between
//! the router and the worker pool through a [`MemoryRegistry`], one store per
//! backing file.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("vector has {actual} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("memory store io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode memory store: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("memory store file {} is unreadable: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: rmp_serde::decode::Error,
    },
    #[error("memory store file {} has unsupported version {version}", path.display())]
    Version { path: PathBuf, version: u32 },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MemoryRecord {
    pub key: String,
    pub vector: Vec<f32>,
    pub source_text: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Snapshot {
    version: u32,
    dim: usize,
    records: Vec<MemoryRecord>,
}

/// SHA-256 hex digest of `text`, used as the key of a remembered sentence.
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

pub struct MemoryStore {
    path: PathBuf,
    dim: usize,
    records: Vec<MemoryRecord>,
    by_key: HashMap<String, usize>,
}

impl MemoryStore {
    /// Loads the store at `path` if the file exists, otherwise starts empty.
    ///
    /// An existing file that cannot be decoded, or that was written with a
    /// different dimensionality, is an error. The file is left untouched.
    pub fn open(path: impl Into<PathBuf>, dim: usize) -> Result<Self, MemoryError> {
        let path = path.into();
        let mut store = Self {
            path,
            dim,
            records: vec![],
            by_key: HashMap::new(),
        };

        let bytes = match std::fs::read(&store.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(source) => {
                return Err(MemoryError::Io {
                    path: store.path,
                    source,
                })
            }
        };

        let snapshot: Snapshot =
            rmp_serde::from_slice(&bytes).map_err(|source| MemoryError::Decode {
                path: store.path.clone(),
                source,
            })?;
        if snapshot.version != FORMAT_VERSION {
            return Err(MemoryError::Version {
                path: store.path,
                version: snapshot.version,
            });
        }
        if snapshot.dim != dim {
            return Err(MemoryError::DimensionMismatch {
                expected: dim,
                actual: snapshot.dim,
            });
        }

        for record in snapshot.records {
            store.check_dim(&record.vector)?;
            store.insert(record);
        }
        log::debug!(
            "loaded {} memories from {}",
            store.records.len(),
            store.path.display()
        );
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_dim(&self, vector: &[f32]) -> Result<(), MemoryError> {
        if vector.len() != self.dim {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn insert(&mut self, record: MemoryRecord) {
        match self.by_key.get(&record.key) {
            Some(&i) => self.records[i] = record,
            None => {
                self.by_key.insert(record.key.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    /// Inserts or replaces the vector stored under `key`.
    pub fn put(&mut self, key: impl Into<String>, vector: Vec<f32>) -> Result<(), MemoryError> {
        self.check_dim(&vector)?;
        let key = key.into();
        let source_text = self
            .by_key
            .get(&key)
            .and_then(|&i| self.records[i].source_text.clone());
        self.insert(MemoryRecord {
            key,
            vector,
            source_text,
        });
        Ok(())
    }

    /// Stores `text` under its fingerprint and returns the key.
    pub fn remember(&mut self, text: &str, vector: Vec<f32>) -> Result<String, MemoryError> {
        let key = fingerprint(text);
        self.put(key.clone(), vector)?;
        if let Some(&i) = self.by_key.get(&key) {
            self.records[i].source_text = Some(text.to_string());
        }
        Ok(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.by_key
            .get(key)
            .and_then(|&i| self.records[i].source_text.as_deref())
    }

    /// Up to `k` keys whose inner product with `vector` exceeds `threshold`,
    /// best first, with their scores.
    pub fn search(
        &self,
        vector: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<(Vec<String>, Vec<f32>), MemoryError> {
        self.check_dim(vector)?;

        let mut hits: Vec<(usize, f32)> = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (i, dot(&r.vector, vector)))
            .filter(|(_, score)| *score > threshold)
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1));
        hits.truncate(k);

        Ok(hits
            .into_iter()
            .map(|(i, score)| (self.records[i].key.clone(), score))
            .unzip())
    }

    /// Source texts of the best matches, skipping records stored without text.
    pub fn recall(
        &self,
        vector: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<String>, MemoryError> {
        let (keys, _) = self.search(vector, k, threshold)?;
        Ok(keys
            .iter()
            .filter_map(|key| self.text(key).map(str::to_string))
            .collect())
    }

    /// Writes the whole store to its file, replacing it atomically.
    pub fn save(&self) -> Result<(), MemoryError> {
        let io_err = |source| MemoryError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let snapshot = Snapshot {
            version: FORMAT_VERSION,
            dim: self.dim,
            records: self.records.clone(),
        };
        let bytes = rmp_serde::to_vec(&snapshot)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Deletes the backing file and forgets every record. Irreversible.
    pub fn remove(&mut self) -> Result<(), MemoryError> {
        self.records.clear();
        self.by_key.clear();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(MemoryError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub type SharedStore = Arc<Mutex<MemoryStore>>;

/// One open store per file path, shared by everyone who asks for that path.
pub struct MemoryRegistry {
    dim: usize,
    stores: HashMap<PathBuf, SharedStore>,
}

impl MemoryRegistry {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            stores: HashMap::new(),
        }
    }

    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<SharedStore, MemoryError> {
        let path = path.as_ref();
        if let Some(store) = self.stores.get(path) {
            return Ok(store.clone());
        }
        let store = Arc::new(Mutex::new(MemoryStore::open(path, self.dim)?));
        self.stores.insert(path.to_path_buf(), store.clone());
        Ok(store)
    }

    /// Saves every open store. Failures are logged, not returned.
    pub fn save_all(&self) -> usize {
        let mut saved = 0;
        for (path, store) in &self.stores {
            match store.lock().save() {
                Ok(()) => saved += 1,
                Err(e) => log::error!("failed to save memory store {}: {e}", path.display()),
            }
        }
        saved
    }
}
