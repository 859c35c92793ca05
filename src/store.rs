//! Local Store
//!
//! JSON tables in a data directory. Whole tables are rewritten atomically (temp file +
//! rename); logs are append-only JSON lines. An in-memory backend serves tests and
//! ephemeral relays.

use crate::error::{RelayError, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Files managed by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Vault header: unlock mode, salt, verification token
    Header,
    Keys,
    Models,
    Usage,
    Errors,
}

impl Table {
    fn file_name(&self) -> &'static str {
        match self {
            Table::Header => "vault.json",
            Table::Keys => "keys.json",
            Table::Models => "models.json",
            Table::Usage => "usage.jsonl",
            Table::Errors => "errors.jsonl",
        }
    }
}

const MASTER_KEY_FILE: &str = "master.key";

#[derive(Debug)]
enum Backend {
    Disk { root: PathBuf },
    Memory(MemoryTables),
}

#[derive(Debug, Default)]
struct MemoryTables {
    documents: HashMap<Table, String>,
    logs: HashMap<Table, Vec<String>>,
    master_key: Option<Vec<u8>>,
}

/// Persistent backing for vault, model metadata and history tables
#[derive(Debug)]
pub struct Store {
    backend: Mutex<Backend>,
}

impl Store {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            RelayError::Storage(format!("Failed to create {}: {}", root.display(), e))
        })?;

        Ok(Self {
            backend: Mutex::new(Backend::Disk { root }),
        })
    }

    /// A store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            backend: Mutex::new(Backend::Memory(MemoryTables::default())),
        }
    }

    pub fn root(&self) -> Option<PathBuf> {
        match &*self.backend.lock() {
            Backend::Disk { root } => Some(root.clone()),
            Backend::Memory(_) => None,
        }
    }

    /// Read a whole table; `None` when it was never written
    pub fn load<T: DeserializeOwned>(&self, table: Table) -> Result<Option<T>> {
        let raw = match &*self.backend.lock() {
            Backend::Disk { root } => {
                let path = root.join(table.file_name());
                match fs::read_to_string(&path) {
                    Ok(content) => Some(content),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => {
                        return Err(RelayError::Storage(format!(
                            "Failed to read {}: {}",
                            path.display(),
                            e
                        )))
                    }
                }
            }
            Backend::Memory(tables) => tables.documents.get(&table).cloned(),
        };

        raw.map(|content| serde_json::from_str(&content).map_err(RelayError::from))
            .transpose()
    }

    /// Replace a whole table
    pub fn save<T: Serialize>(&self, table: Table, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;

        match &mut *self.backend.lock() {
            Backend::Disk { root } => write_atomic(&root.join(table.file_name()), content.as_bytes()),
            Backend::Memory(tables) => {
                tables.documents.insert(table, content);
                Ok(())
            }
        }
    }

    /// Append one entry to a log table
    pub fn append<T: Serialize>(&self, table: Table, entry: &T) -> Result<()> {
        let line = serde_json::to_string(entry)?;

        match &mut *self.backend.lock() {
            Backend::Disk { root } => {
                let path = root.join(table.file_name());
                let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
                Ok(())
            }
            Backend::Memory(tables) => {
                tables.logs.entry(table).or_default().push(line);
                Ok(())
            }
        }
    }

    /// Read every entry of a log table, skipping lines that fail to parse
    pub fn read_log<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>> {
        let lines: Vec<String> = match &*self.backend.lock() {
            Backend::Disk { root } => {
                let path = root.join(table.file_name());
                let file = match fs::File::open(&path) {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                };
                BufReader::new(file).lines().collect::<std::io::Result<_>>()?
            }
            Backend::Memory(tables) => tables.logs.get(&table).cloned().unwrap_or_default(),
        };

        let mut entries = Vec::with_capacity(lines.len());
        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    table = table.file_name(),
                    line = idx + 1,
                    error = %e,
                    "skipping unreadable log line"
                ),
            }
        }

        Ok(entries)
    }

    /// Platform-mode master key bytes
    pub fn load_master_key(&self) -> Result<Option<Vec<u8>>> {
        match &*self.backend.lock() {
            Backend::Disk { root } => match fs::read(root.join(MASTER_KEY_FILE)) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
            Backend::Memory(tables) => Ok(tables.master_key.clone()),
        }
    }

    pub fn save_master_key(&self, bytes: &[u8]) -> Result<()> {
        match &mut *self.backend.lock() {
            Backend::Disk { root } => write_private(&root.join(MASTER_KEY_FILE), bytes),
            Backend::Memory(tables) => {
                tables.master_key = Some(bytes.to_vec());
                Ok(())
            }
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        RelayError::Storage(format!("Failed to replace {}: {}", path.display(), e))
    })
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|e| {
        RelayError::Storage(format!("Failed to create {}: {}", path.display(), e))
    })?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u32,
    }

    #[test]
    fn test_disk_tables_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.save(Table::Keys, &vec![Row { id: 1 }]).unwrap();
            store.append(Table::Usage, &Row { id: 2 }).unwrap();
            store.append(Table::Usage, &Row { id: 3 }).unwrap();
        }

        let store = Store::open(dir.path()).unwrap();
        let keys: Vec<Row> = store.load(Table::Keys).unwrap().unwrap();
        assert_eq!(keys, vec![Row { id: 1 }]);

        let usage: Vec<Row> = store.read_log(Table::Usage).unwrap();
        assert_eq!(usage, vec![Row { id: 2 }, Row { id: 3 }]);
        assert!(store.load::<Vec<Row>>(Table::Models).unwrap().is_none());
    }

    #[test]
    fn test_unreadable_log_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.append(Table::Errors, &Row { id: 1 }).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("errors.jsonl"))
            .unwrap()
            .write_all(b"{broken\n")
            .unwrap();

        let rows: Vec<Row> = store.read_log(Table::Errors).unwrap();
        assert_eq!(rows, vec![Row { id: 1 }]);
    }

    #[test]
    fn test_master_key_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.save_master_key(&[7u8; 32]).unwrap();
        assert!(store.save_master_key(&[8u8; 32]).is_err());
        assert_eq!(store.load_master_key().unwrap(), Some(vec![7u8; 32]));
    }

    #[test]
    fn test_memory_backend() {
        let store = Store::in_memory();
        assert!(store.root().is_none());
        store.save(Table::Models, &vec![Row { id: 9 }]).unwrap();
        let rows: Vec<Row> = store.load(Table::Models).unwrap().unwrap();
        assert_eq!(rows, vec![Row { id: 9 }]);
    }
}
