//! Filesystem collaborator used by the sync engine.
//!
//! Implementations:
//! - `MemoryFs` - For testing
//! - `NativeFs` (in bitsync-daemon) - Uses tokio::fs under a share root
//!
//! All paths are share-relative with `/` separators. Implementations must
//! refuse any path rejected by [`is_safe_path_name`].

use crate::descriptor::{FileDescriptor, FileMetadata};
use crate::events::FileEvent;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use thiserror::Error;

/// Directory under the share root reserved for daemon state (partial files).
pub const RESERVED_DIR: &str = ".bitsync";

#[derive(Debug, Error)]
pub enum FsError {
    #[error("Unsafe pathname: {0}")]
    UnsafePath(String),

    #[error("Pathname does not exist: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("File transfer already in progress: {0}")]
    TransferInProgress(String),

    #[error("Local version is newer: {0}")]
    LocalNewer(String),

    #[error("Content does not match descriptor: {0}")]
    ContentMismatch(String),

    #[error("No file loader open for {0}")]
    NoLoader(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// True when `path_name` stays inside the share and outside the reserved
/// directory. A leading `/` means the share root.
pub fn is_safe_path_name(path_name: &str) -> bool {
    let trimmed = path_name.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains('\0') || trimmed.contains('\\') {
        return false;
    }
    let mut components = trimmed.split('/').filter(|c| !c.is_empty() && *c != ".");
    match components.next() {
        None => return false,
        Some(first) if first == RESERVED_DIR || first == ".." => return false,
        Some(_) => {}
    }
    components.all(|c| c != "..")
}

/// Canonical form of a safe path: no leading, trailing or repeated `/`,
/// no `.` components.
pub fn normalize_path(path_name: &str) -> String {
    path_name
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent of a normalized path, `None` for top-level entries.
pub fn parent_path(path_name: &str) -> Option<&str> {
    path_name.rsplit_once('/').map(|(parent, _)| parent)
}

/// Filesystem operations the sync engine needs.
///
/// A file loader is an incremental writer for one incoming transfer: it is
/// opened with the announced descriptor, fed with `write_file`, and either
/// committed by `check_write_complete`/`check_shortcut` or discarded by
/// `cancel_file_loader`. At most one loader exists per path.
#[async_trait]
pub trait FileSystemManager: Send + Sync {
    fn is_safe_path_name(&self, path_name: &str) -> bool {
        is_safe_path_name(path_name)
    }

    async fn dir_name_exists(&self, path_name: &str) -> bool;

    /// With `hash`, the file must also have that content.
    async fn file_name_exists(&self, path_name: &str, hash: Option<&str>) -> bool;

    async fn file_descriptor(&self, path_name: &str) -> Result<FileDescriptor>;

    async fn make_directory(&self, path_name: &str) -> Result<()>;

    /// Remove an empty directory.
    async fn delete_directory(&self, path_name: &str) -> Result<()>;

    /// Open a loader for a path with no local file.
    async fn create_file_loader(&self, descriptor: &FileDescriptor) -> Result<()>;

    /// Open a loader that will replace an existing, not newer, local file.
    async fn modify_file_loader(&self, descriptor: &FileDescriptor) -> Result<()>;

    async fn write_file(&self, path_name: &str, content: &[u8], position: u64) -> Result<()>;

    /// Commit the loader if every byte has arrived.
    ///
    /// Returns `Ok(false)` while bytes are missing. A complete loader whose
    /// content does not hash to the descriptor is discarded with
    /// `ContentMismatch`.
    async fn check_write_complete(&self, path_name: &str) -> Result<bool>;

    /// Commit the loader by copying a local file with the same content.
    async fn check_shortcut(&self, path_name: &str) -> Result<bool>;

    /// Discard the loader and its partial data. `Ok(false)` if none was open.
    async fn cancel_file_loader(&self, path_name: &str) -> Result<bool>;

    /// Read a range of the local file, which must match `descriptor`.
    async fn read_file(
        &self,
        descriptor: &FileDescriptor,
        position: u64,
        length: u64,
    ) -> Result<Vec<u8>>;

    /// Delete the local file only if it matches `descriptor`.
    async fn delete_file(&self, descriptor: &FileDescriptor) -> Result<()>;

    /// Snapshot of the tree: directories (parents first), then files.
    async fn generate_sync_events(&self) -> Result<Vec<FileEvent>>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

struct MemoryFile {
    content: Vec<u8>,
    metadata: FileMetadata,
}

struct MemoryLoader {
    metadata: FileMetadata,
    buffer: Vec<u8>,
    filled: u64,
}

#[derive(Default)]
struct MemoryState {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, MemoryFile>,
    loaders: HashMap<String, MemoryLoader>,
}

impl MemoryState {
    fn add_parents(&mut self, path: &str) {
        let mut parent = parent_path(path);
        while let Some(dir) = parent {
            self.dirs.insert(dir.to_string());
            parent = parent_path(dir);
        }
    }

    fn commit(&mut self, path: &str, loader: MemoryLoader) {
        self.add_parents(path);
        self.files.insert(
            path.to_string(),
            MemoryFile {
                content: loader.buffer,
                metadata: loader.metadata,
            },
        );
    }
}

/// In-memory filesystem for testing
#[derive(Default)]
pub struct MemoryFs {
    state: Mutex<MemoryState>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a file directly, creating parent directories.
    pub fn insert_file(&self, path_name: &str, content: &[u8], last_modified: u64) {
        let path = normalize_path(path_name);
        let mut state = self.state.lock().unwrap();
        state.add_parents(&path);
        state.files.insert(
            path,
            MemoryFile {
                content: content.to_vec(),
                metadata: FileMetadata::of_bytes(content, last_modified),
            },
        );
    }

    pub fn insert_dir(&self, path_name: &str) {
        let path = normalize_path(path_name);
        let mut state = self.state.lock().unwrap();
        state.add_parents(&path);
        state.dirs.insert(path);
    }

    /// Committed content of a file.
    pub fn read(&self, path_name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(&normalize_path(path_name))
            .map(|f| f.content.clone())
    }

    pub fn has_loader(&self, path_name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.loaders.contains_key(&normalize_path(path_name))
    }

    fn checked(&self, path_name: &str) -> Result<String> {
        if !is_safe_path_name(path_name) {
            return Err(FsError::UnsafePath(path_name.to_string()));
        }
        Ok(normalize_path(path_name))
    }

    fn open_loader(&self, state: &mut MemoryState, path: String, metadata: FileMetadata) {
        state.loaders.insert(
            path,
            MemoryLoader {
                metadata,
                buffer: Vec::new(),
                filled: 0,
            },
        );
    }
}

#[async_trait]
impl FileSystemManager for MemoryFs {
    async fn dir_name_exists(&self, path_name: &str) -> bool {
        let Ok(path) = self.checked(path_name) else {
            return false;
        };
        self.state.lock().unwrap().dirs.contains(&path)
    }

    async fn file_name_exists(&self, path_name: &str, hash: Option<&str>) -> bool {
        let Ok(path) = self.checked(path_name) else {
            return false;
        };
        let state = self.state.lock().unwrap();
        match (state.files.get(&path), hash) {
            (Some(file), Some(hash)) => file.metadata.hash == hash,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    async fn file_descriptor(&self, path_name: &str) -> Result<FileDescriptor> {
        let path = self.checked(path_name)?;
        let state = self.state.lock().unwrap();
        if let Some(file) = state.files.get(&path) {
            return Ok(FileDescriptor::file(path, file.metadata.clone()));
        }
        if state.dirs.contains(&path) {
            return Ok(FileDescriptor::directory(path));
        }
        Err(FsError::NotFound(path))
    }

    async fn make_directory(&self, path_name: &str) -> Result<()> {
        let path = self.checked(path_name)?;
        let mut state = self.state.lock().unwrap();
        if state.files.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        state.add_parents(&path);
        state.dirs.insert(path);
        Ok(())
    }

    async fn delete_directory(&self, path_name: &str) -> Result<()> {
        let path = self.checked(path_name)?;
        let mut state = self.state.lock().unwrap();
        if !state.dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }
        let prefix = format!("{}/", path);
        let occupied = state.dirs.iter().any(|d| d.starts_with(&prefix))
            || state.files.keys().any(|f| f.starts_with(&prefix));
        if occupied {
            return Err(FsError::DirectoryNotEmpty(path));
        }
        state.dirs.remove(&path);
        Ok(())
    }

    async fn create_file_loader(&self, descriptor: &FileDescriptor) -> Result<()> {
        let path = self.checked(&descriptor.path_name)?;
        let metadata = descriptor
            .metadata
            .clone()
            .ok_or_else(|| FsError::IsDirectory(path.clone()))?;
        let mut state = self.state.lock().unwrap();
        if state.loaders.contains_key(&path) {
            return Err(FsError::TransferInProgress(path));
        }
        if state.files.contains_key(&path) || state.dirs.contains(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        self.open_loader(&mut state, path, metadata);
        Ok(())
    }

    async fn modify_file_loader(&self, descriptor: &FileDescriptor) -> Result<()> {
        let path = self.checked(&descriptor.path_name)?;
        let metadata = descriptor
            .metadata
            .clone()
            .ok_or_else(|| FsError::IsDirectory(path.clone()))?;
        let mut state = self.state.lock().unwrap();
        if state.loaders.contains_key(&path) {
            return Err(FsError::TransferInProgress(path));
        }
        let local = state
            .files
            .get(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if local.metadata.last_modified > metadata.last_modified {
            return Err(FsError::LocalNewer(path));
        }
        self.open_loader(&mut state, path, metadata);
        Ok(())
    }

    async fn write_file(&self, path_name: &str, content: &[u8], position: u64) -> Result<()> {
        let path = self.checked(path_name)?;
        let mut state = self.state.lock().unwrap();
        let loader = state
            .loaders
            .get_mut(&path)
            .ok_or_else(|| FsError::NoLoader(path.clone()))?;
        let end = position + content.len() as u64;
        if end > loader.metadata.file_size {
            return Err(FsError::Io(format!(
                "write past end of {} ({} > {})",
                path, end, loader.metadata.file_size
            )));
        }
        if loader.buffer.len() < end as usize {
            loader.buffer.resize(end as usize, 0);
        }
        loader.buffer[position as usize..end as usize].copy_from_slice(content);
        loader.filled = loader.filled.max(end);
        Ok(())
    }

    async fn check_write_complete(&self, path_name: &str) -> Result<bool> {
        let path = self.checked(path_name)?;
        let mut state = self.state.lock().unwrap();
        let loader = state
            .loaders
            .get(&path)
            .ok_or_else(|| FsError::NoLoader(path.clone()))?;
        if loader.filled < loader.metadata.file_size {
            return Ok(false);
        }
        let Some(loader) = state.loaders.remove(&path) else {
            return Err(FsError::NoLoader(path));
        };
        if FileMetadata::of_bytes(&loader.buffer, 0).hash != loader.metadata.hash {
            return Err(FsError::ContentMismatch(path));
        }
        state.commit(&path, loader);
        Ok(true)
    }

    async fn check_shortcut(&self, path_name: &str) -> Result<bool> {
        let path = self.checked(path_name)?;
        let mut state = self.state.lock().unwrap();
        let loader = state
            .loaders
            .get(&path)
            .ok_or_else(|| FsError::NoLoader(path.clone()))?;
        let source = state
            .files
            .iter()
            .find(|(other, file)| **other != path && file.metadata.same_content(&loader.metadata))
            .map(|(_, file)| file.content.clone());
        let Some(content) = source else {
            return Ok(false);
        };
        let Some(mut loader) = state.loaders.remove(&path) else {
            return Err(FsError::NoLoader(path));
        };
        loader.filled = content.len() as u64;
        loader.buffer = content;
        state.commit(&path, loader);
        Ok(true)
    }

    async fn cancel_file_loader(&self, path_name: &str) -> Result<bool> {
        let path = self.checked(path_name)?;
        Ok(self.state.lock().unwrap().loaders.remove(&path).is_some())
    }

    async fn read_file(
        &self,
        descriptor: &FileDescriptor,
        position: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let path = self.checked(&descriptor.path_name)?;
        let state = self.state.lock().unwrap();
        let file = state
            .files
            .get(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        match &descriptor.metadata {
            Some(wanted) if file.metadata.same_content(wanted) => {}
            _ => return Err(FsError::ContentMismatch(path)),
        }
        let start = (position as usize).min(file.content.len());
        let end = (position.saturating_add(length) as usize).min(file.content.len());
        Ok(file.content[start..end].to_vec())
    }

    async fn delete_file(&self, descriptor: &FileDescriptor) -> Result<()> {
        let path = self.checked(&descriptor.path_name)?;
        let mut state = self.state.lock().unwrap();
        let file = state
            .files
            .get(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        match &descriptor.metadata {
            Some(wanted) if file.metadata.same_content(wanted) => {}
            _ => return Err(FsError::ContentMismatch(path)),
        }
        state.files.remove(&path);
        Ok(())
    }

    async fn generate_sync_events(&self) -> Result<Vec<FileEvent>> {
        let state = self.state.lock().unwrap();
        // BTreeSet order puts "a" before "a/b"
        let dirs = state.dirs.iter().map(|d| FileEvent::DirectoryCreate {
            path_name: d.clone(),
        });
        let files = state.files.iter().map(|(path, file)| FileEvent::FileCreate {
            path_name: path.clone(),
            metadata: file.metadata.clone(),
        });
        Ok(dirs.chain(files).collect())
    }
}
