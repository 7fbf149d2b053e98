/*!
Persistence of readout data.

Each readout cycle opens a new registration (one directory per cycle for the
file backend). Items are stored under keys mirroring the frame layout of the
readout cycle, e.g. `/2/timecode` or `/1/data/17`. The [`MemoryStorage`]
backend keeps everything in memory for the test suite.
*/

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use shared::packet::DataPacket;
use shared::{Result, SharedError};
use tracing::{debug, info};

/// One item to persist
#[derive(Debug, Clone)]
pub enum StorageItem {
    Timecode {
        frame: i8,
        timecode: u8,
        timestamp: DateTime<Utc>,
    },
    HousekeepingPacket {
        frame: i8,
        packet: DataPacket,
    },
    DataPacket {
        frame: i8,
        index: u32,
        packet: DataPacket,
    },
    HousekeepingData {
        frame: i8,
        data: Vec<u8>,
        timestamp: DateTime<Utc>,
    },
    RegisterMap {
        snapshot: Vec<u8>,
    },
    Command {
        frame: i8,
        rendered: String,
    },
    NumCycles {
        value: i32,
    },
    SlicingParameter {
        value: i32,
    },
}

impl StorageItem {
    /// The key this item is stored under within a registration
    pub fn key(&self) -> String {
        match self {
            StorageItem::Timecode { frame, .. } => format!("/{frame}/timecode"),
            StorageItem::HousekeepingPacket { frame, .. } => format!("/{frame}/hk"),
            StorageItem::DataPacket { frame, index, .. } => format!("/{frame}/data/{index}"),
            StorageItem::HousekeepingData { frame, .. } => format!("/{frame}/hk_data"),
            StorageItem::RegisterMap { .. } => "/register".to_string(),
            StorageItem::Command { frame, .. } => format!("/{frame}/command"),
            StorageItem::NumCycles { .. } => "/dpu/num_cycles".to_string(),
            StorageItem::SlicingParameter { .. } => "/dpu/slicing_num_cycles".to_string(),
        }
    }

    /// Serialized form written to disk
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            StorageItem::Timecode {
                timecode,
                timestamp,
                ..
            } => json!({"timecode": timecode, "timestamp": timestamp.to_rfc3339()})
                .to_string()
                .into_bytes(),
            StorageItem::HousekeepingPacket { packet, .. } => packet.to_bytes(),
            StorageItem::DataPacket { packet, .. } => packet.to_bytes(),
            StorageItem::HousekeepingData {
                data, timestamp, ..
            } => json!({"data": hex::encode(data), "timestamp": timestamp.to_rfc3339()})
                .to_string()
                .into_bytes(),
            StorageItem::RegisterMap { snapshot } => snapshot.clone(),
            StorageItem::Command { rendered, .. } => rendered.clone().into_bytes(),
            StorageItem::NumCycles { value } => json!({"num_cycles": value}).to_string().into_bytes(),
            StorageItem::SlicingParameter { value } => {
                json!({"slicing_num_cycles": value}).to_string().into_bytes()
            }
        }
    }
}

/// Where readout data ends up
pub trait Storage: Send {
    /// Open a new registration; subsequent saves go there
    fn new_registration(&mut self) -> Result<()>;

    /// Persist one item in the current registration
    fn save(&mut self, item: StorageItem) -> Result<()>;

    /// Filenames written so far for the current registration
    fn filenames(&self) -> Vec<PathBuf>;

    /// Close the current registration
    fn unregister(&mut self) -> Result<()>;
}

/// File backend: one timestamped directory per registration, one file per
/// item
pub struct FileStorage {
    base_dir: PathBuf,
    origin: String,
    counter: u32,
    current_dir: Option<PathBuf>,
    current_files: Vec<PathBuf>,
    item_seq: u32,
}

impl FileStorage {
    pub fn new(base_dir: impl AsRef<Path>, origin: impl Into<String>) -> Self {
        FileStorage {
            base_dir: base_dir.as_ref().to_path_buf(),
            origin: origin.into(),
            counter: 0,
            current_dir: None,
            current_files: Vec::new(),
            item_seq: 0,
        }
    }
}

impl Storage for FileStorage {
    fn new_registration(&mut self) -> Result<()> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let dir = self
            .base_dir
            .join(format!("{}_{timestamp}_{:05}", self.origin, self.counter));
        std::fs::create_dir_all(&dir)?;
        info!("📁 New storage registration: {}", dir.display());
        self.counter += 1;
        self.item_seq = 0;
        self.current_files.clear();
        self.current_dir = Some(dir);
        Ok(())
    }

    fn save(&mut self, item: StorageItem) -> Result<()> {
        let dir = self
            .current_dir
            .as_ref()
            .ok_or_else(|| SharedError::new("no open storage registration"))?;
        // keys contain '/' which is not valid in a file name
        let key = item.key().trim_start_matches('/').replace('/', "_");
        let path = dir.join(format!("{:05}_{key}", self.item_seq));
        let bytes = item.to_bytes();
        std::fs::write(&path, &bytes)?;
        debug!("Saved {} ({} bytes)", path.display(), bytes.len());
        self.item_seq += 1;
        self.current_files.push(path);
        Ok(())
    }

    fn filenames(&self) -> Vec<PathBuf> {
        self.current_files.clone()
    }

    fn unregister(&mut self) -> Result<()> {
        if let Some(dir) = self.current_dir.take() {
            info!("Closed storage registration: {}", dir.display());
        }
        self.current_files.clear();
        Ok(())
    }
}

/// One closed or open registration held in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryRegistration {
    pub items: Vec<StorageItem>,
}

#[derive(Debug, Default)]
struct MemoryStorageInner {
    registrations: Vec<MemoryRegistration>,
    registered: bool,
}

/// In-memory backend for tests; cloneable so the test can keep a handle
/// while the processor owns the storage
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registrations opened so far
    pub fn registration_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .registrations
            .len()
    }

    /// Snapshot of one registration's items
    pub fn registration(&self, index: usize) -> Option<MemoryRegistration> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .registrations
            .get(index)
            .cloned()
    }

    /// All saved items across all registrations
    pub fn all_items(&self) -> Vec<StorageItem> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .registrations
            .iter()
            .flat_map(|r| r.items.iter().cloned())
            .collect()
    }
}

impl Storage for MemoryStorage {
    fn new_registration(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.registrations.push(MemoryRegistration::default());
        inner.registered = true;
        Ok(())
    }

    fn save(&mut self, item: StorageItem) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.registered {
            return Err(SharedError::new("no open storage registration"));
        }
        inner
            .registrations
            .last_mut()
            .ok_or_else(|| SharedError::new("no open storage registration"))?
            .items
            .push(item);
        Ok(())
    }

    fn filenames(&self) -> Vec<PathBuf> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.registrations.last() {
            Some(reg) => reg
                .items
                .iter()
                .map(|item| PathBuf::from(item.key()))
                .collect(),
            None => Vec::new(),
        }
    }

    fn unregister(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.registered = false;
        Ok(())
    }
}
