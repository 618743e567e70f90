// Object Store - cold storage for partition artifacts
//
// Layout: <root>/<module>/FY<year>/<table>_<year>.<chunk>.csv
//
// Keys are '/'-separated regardless of platform. Deletes are idempotent and
// listings come back sorted by path.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{ArchiveError, ArchiveResult};
use crate::fiscal::{FiscalYearTag, Partition};

pub const ARTIFACT_EXTENSION: &str = "csv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub path: String,
    pub size: u64,
    /// Hex SHA-256 of the object body
    pub checksum: String,
}

pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Object name of one chunk of a table inside a partition
pub fn artifact_path(root: &str, partition: &Partition, table: &str, chunk: usize) -> String {
    format!(
        "{}{}",
        partition.prefix(root),
        artifact_name(table, partition.tag, chunk)
    )
}

pub fn artifact_name(table: &str, tag: FiscalYearTag, chunk: usize) -> String {
    format!("{}_{}.{:05}.{}", table, tag.value(), chunk, ARTIFACT_EXTENSION)
}

/// Split `<table>_<year>.<chunk>.csv` (final path segment) into its parts
pub fn parse_artifact_name(path: &str) -> Option<(String, i32, usize)> {
    let name = path.rsplit('/').next()?;
    let stem = name.strip_suffix(&format!(".{}", ARTIFACT_EXTENSION))?;
    let (stem, chunk) = stem.rsplit_once('.')?;
    let (table, year) = stem.rsplit_once('_')?;
    if table.is_empty() || chunk.len() != 5 {
        return None;
    }
    Some((table.to_string(), year.parse().ok()?, chunk.parse().ok()?))
}

pub trait ObjectStore: Send + Sync {
    fn put(&self, path: &str, data: &[u8]) -> ArchiveResult<ObjectMeta>;

    fn get(&self, path: &str) -> ArchiveResult<Vec<u8>>;

    /// Metadata without the body; None when absent
    fn head(&self, path: &str) -> ArchiveResult<Option<ObjectMeta>>;

    fn list(&self, prefix: &str) -> ArchiveResult<Vec<ObjectMeta>>;

    /// Succeeds when the object is already gone
    fn delete(&self, path: &str) -> ArchiveResult<()>;

    /// Remove everything under a prefix, returning how many objects went
    fn delete_prefix(&self, prefix: &str) -> ArchiveResult<usize> {
        let objects = self.list(prefix)?;
        for object in &objects {
            self.delete(&object.path)?;
        }
        Ok(objects.len())
    }
}

// ============================================================================
// LOCAL FILESYSTEM STORE
// ============================================================================

pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> ArchiveResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(LocalObjectStore { root })
    }

    fn resolve(&self, key: &str) -> ArchiveResult<PathBuf> {
        if key.split('/').any(|part| part == ".." || part == ".") {
            return Err(ArchiveError::Config(format!("object key {:?} escapes the root", key)));
        }
        Ok(self.root.join(key.trim_start_matches('/')))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<PathBuf>) -> ArchiveResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.walk(&path, out)?;
            } else if !is_temp_file(&path) {
                out.push(path);
            }
        }
        Ok(())
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "partial")
}

impl ObjectStore for LocalObjectStore {
    fn put(&self, path: &str, data: &[u8]) -> ArchiveResult<ObjectMeta> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write aside then rename so readers never observe half a chunk
        let staging = target.with_extension("partial");
        fs::write(&staging, data)?;
        fs::rename(&staging, &target)?;
        Ok(ObjectMeta {
            path: path.to_string(),
            size: data.len() as u64,
            checksum: checksum(data),
        })
    }

    fn get(&self, path: &str) -> ArchiveResult<Vec<u8>> {
        let target = self.resolve(path)?;
        fs::read(&target).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ArchiveError::NotFound(path.to_string()),
            _ => e.into(),
        })
    }

    fn head(&self, path: &str) -> ArchiveResult<Option<ObjectMeta>> {
        match self.get(path) {
            Ok(body) => Ok(Some(ObjectMeta {
                path: path.to_string(),
                size: body.len() as u64,
                checksum: checksum(&body),
            })),
            Err(ArchiveError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&self, prefix: &str) -> ArchiveResult<Vec<ObjectMeta>> {
        // Walk from the deepest directory fully named by the prefix
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = self.resolve(dir_part)?;

        let mut files = Vec::new();
        self.walk(&start, &mut files)?;

        let mut out = Vec::new();
        for file in files {
            let Some(key) = self.key_of(&file) else { continue };
            if key.starts_with(prefix) {
                if let Some(meta) = self.head(&key)? {
                    out.push(meta);
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn delete(&self, path: &str) -> ArchiveResult<()> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Thread-safe in-memory store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> ArchiveError {
        ArchiveError::transient("memory store", "lock poisoned")
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, path: &str, data: &[u8]) -> ArchiveResult<ObjectMeta> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.insert(path.to_string(), data.to_vec());
        Ok(ObjectMeta {
            path: path.to_string(),
            size: data.len() as u64,
            checksum: checksum(data),
        })
    }

    fn get(&self, path: &str) -> ArchiveResult<Vec<u8>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(path)
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound(path.to_string()))
    }

    fn head(&self, path: &str) -> ArchiveResult<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects.get(path).map(|body| ObjectMeta {
            path: path.to_string(),
            size: body.len() as u64,
            checksum: checksum(body),
        }))
    }

    fn list(&self, prefix: &str) -> ArchiveResult<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, body)| ObjectMeta {
                path: path.clone(),
                size: body.len() as u64,
                checksum: checksum(body),
            })
            .collect())
    }

    fn delete(&self, path: &str) -> ArchiveResult<()> {
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.remove(path);
        Ok(())
    }
}
