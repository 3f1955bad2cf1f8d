//! Native filesystem implementation using tokio::fs.
//!
//! Everything lives under one share root. Incoming transfers are written to
//! partial files in `.bitsync/partial/` and renamed into place once their
//! content hash checks out. An index of known entries caches descriptors
//! (validated by size and mtime) and is the baseline `refresh` diffs against,
//! so changes applied on behalf of peers never echo back as local events.

use async_trait::async_trait;
use bitsync_core::fs::{is_safe_path_name, normalize_path, parent_path, FsError, Result, RESERVED_DIR};
use bitsync_core::{content_hash, FileDescriptor, FileEvent, FileMetadata, FileSystemManager};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct IndexEntry {
    descriptor: FileDescriptor,
    disk_size: u64,
    disk_mtime: Option<SystemTime>,
}

impl IndexEntry {
    fn directory(path_name: &str) -> Self {
        Self {
            descriptor: FileDescriptor::directory(path_name),
            disk_size: 0,
            disk_mtime: None,
        }
    }

    /// Cached file descriptor is still valid for what is on disk.
    fn matches(&self, meta: &std::fs::Metadata) -> bool {
        !self.descriptor.is_directory()
            && self.disk_size == meta.len()
            && self.disk_mtime.is_some()
            && self.disk_mtime == meta.modified().ok()
    }
}

#[derive(Debug, Clone)]
struct Loader {
    metadata: FileMetadata,
    partial: PathBuf,
    filled: u64,
}

#[derive(Default)]
struct State {
    index: BTreeMap<String, IndexEntry>,
    loaders: HashMap<String, Loader>,
}

impl State {
    fn index_directory(&mut self, path_name: &str) {
        let mut dir = Some(path_name);
        while let Some(path) = dir {
            self.index
                .entry(path.to_string())
                .or_insert_with(|| IndexEntry::directory(path));
            dir = parent_path(path);
        }
    }

    /// Index entries strictly below `path_name`.
    fn known_under(&self, path_name: &str) -> BTreeMap<String, FileDescriptor> {
        let prefix = format!("{}/", path_name);
        self.index
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .map(|(path, entry)| (path.clone(), entry.descriptor.clone()))
            .collect()
    }

    /// Drop everything below `path_name`, deepest first.
    fn forget_below(&mut self, path_name: &str) -> Vec<FileDescriptor> {
        let known = self.known_under(path_name);
        for path in known.keys() {
            self.index.remove(path);
        }
        let mut removed: Vec<FileDescriptor> = known.into_values().collect();
        // A child path always sorts after its parent
        removed.sort_by(|a, b| b.path_name.cmp(&a.path_name));
        removed
    }

    /// Drop `path_name` and everything below it, deepest first.
    fn forget_tree(&mut self, path_name: &str) -> Vec<FileDescriptor> {
        let mut removed = self.forget_below(path_name);
        removed.extend(self.index.remove(path_name).map(|entry| entry.descriptor));
        removed
    }
}

/// Native filesystem rooted at a share directory
pub struct NativeFs {
    root: PathBuf,
    partial_dir: PathBuf,
    state: Mutex<State>,
}

impl NativeFs {
    pub fn new(root: PathBuf) -> Self {
        let partial_dir = root.join(RESERVED_DIR).join("partial");
        Self {
            root,
            partial_dir,
            state: Mutex::new(State::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the whole share, indexing every directory and regular file.
    ///
    /// Directories come first (parents before children), then files.
    pub async fn scan(&self) -> Result<Vec<FileDescriptor>> {
        self.scan_from("").await
    }

    /// Resolve changed paths reported by the watcher into change events.
    ///
    /// Paths are share-relative. Deleted directory trees are reported
    /// deepest-first. Paths whose index entry already matches the disk (for
    /// example because a peer's change was just applied) produce nothing.
    pub async fn refresh<I>(&self, paths: I) -> Vec<FileEvent>
    where
        I: IntoIterator<Item = String>,
    {
        let mut paths: Vec<String> = paths
            .into_iter()
            .filter(|p| is_safe_path_name(p))
            .map(|p| normalize_path(&p))
            .collect();
        paths.sort();
        paths.dedup();

        let mut events = Vec::new();
        for path in paths {
            if let Err(e) = self.refresh_path(&path, &mut events).await {
                warn!("Failed to refresh {}: {}", path, e);
            }
        }
        events
    }

    async fn refresh_path(&self, path: &str, events: &mut Vec<FileEvent>) -> Result<()> {
        let previous = {
            let state = self.state();
            if state.loaders.contains_key(path) {
                return Ok(());
            }
            state.index.get(path).map(|e| e.descriptor.clone())
        };
        let current = self.describe(path).await?;

        match (previous, current) {
            (None, None) => {}
            (Some(_), None) => {
                let removed = self.state().forget_tree(path);
                events.extend(removed.iter().map(FileEvent::deleted));
            }
            (previous, Some(current)) if current.is_directory() => {
                match previous {
                    Some(prev) if prev.is_directory() => {}
                    Some(prev) => {
                        events.push(FileEvent::deleted(&prev));
                        events.push(FileEvent::created(&current));
                    }
                    None => events.push(FileEvent::created(&current)),
                }
                self.refresh_tree(path, events).await?;
            }
            (previous, Some(current)) => match previous {
                None => events.push(FileEvent::created(&current)),
                Some(prev) if prev.is_directory() => {
                    let removed = self.state().forget_below(path);
                    events.extend(removed.iter().map(FileEvent::deleted));
                    events.push(FileEvent::deleted(&prev));
                    events.push(FileEvent::created(&current));
                }
                Some(prev) if prev.same_content(&current) => {}
                Some(_) => {
                    if let Some(metadata) = current.metadata {
                        events.push(FileEvent::FileModify {
                            path_name: current.path_name,
                            metadata,
                        });
                    }
                }
            },
        }
        Ok(())
    }

    /// Diff the subtree below a directory against the index.
    async fn refresh_tree(&self, path: &str, events: &mut Vec<FileEvent>) -> Result<()> {
        let known = self.state().known_under(path);
        let found = self.scan_from(path).await?;
        let found_paths: HashSet<&str> = found.iter().map(|d| d.path_name.as_str()).collect();

        let mut gone: Vec<&FileDescriptor> = known
            .values()
            .filter(|d| !found_paths.contains(d.path_name.as_str()))
            .collect();
        gone.sort_by(|a, b| b.path_name.cmp(&a.path_name));
        {
            let mut state = self.state();
            for descriptor in &gone {
                state.index.remove(&descriptor.path_name);
            }
        }
        events.extend(gone.into_iter().map(FileEvent::deleted));

        for descriptor in &found {
            match known.get(&descriptor.path_name) {
                None => events.push(FileEvent::created(descriptor)),
                Some(old) if old.is_directory() != descriptor.is_directory() => {
                    events.push(FileEvent::deleted(old));
                    events.push(FileEvent::created(descriptor));
                }
                Some(old) if old.is_directory() || old.same_content(descriptor) => {}
                Some(_) => {
                    if let Some(metadata) = descriptor.metadata.clone() {
                        events.push(FileEvent::FileModify {
                            path_name: descriptor.path_name.clone(),
                            metadata,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn scan_from(&self, base: &str) -> Result<Vec<FileDescriptor>> {
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        let mut stack = vec![base.to_string()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(self.full_path(&dir)).await {
                Ok(entries) => entries,
                // Raced with a delete; the watcher will report it
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let Ok(name) = entry.file_name().into_string() else {
                    debug!("Skipping non UTF-8 name in {:?}", dir);
                    continue;
                };
                let path = if dir.is_empty() {
                    name
                } else {
                    format!("{}/{}", dir, name)
                };
                if !is_safe_path_name(&path) {
                    continue;
                }
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    dirs.push(path.clone());
                    stack.push(path);
                } else if file_type.is_file() {
                    files.push(path);
                }
            }
        }

        dirs.sort();
        files.sort();

        let mut descriptors = Vec::with_capacity(dirs.len() + files.len());
        {
            let mut state = self.state();
            for dir in dirs {
                state.index_directory(&dir);
                descriptors.push(FileDescriptor::directory(dir));
            }
        }
        for file in files {
            match self.describe(&file).await {
                Ok(Some(descriptor)) => descriptors.push(descriptor),
                Ok(None) => {}
                Err(e) => warn!("Failed to describe {}: {}", file, e),
            }
        }
        Ok(descriptors)
    }

    /// Current descriptor of a path, hashing only when the cache is stale.
    ///
    /// `None` if the path is missing or neither a file nor a directory.
    async fn describe(&self, path: &str) -> Result<Option<FileDescriptor>> {
        let full = self.full_path(path);
        let meta = match fs::symlink_metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            self.state().index_directory(path);
            return Ok(Some(FileDescriptor::directory(path)));
        }
        if !meta.is_file() {
            return Ok(None);
        }

        let cached = self
            .state()
            .index
            .get(path)
            .filter(|entry| entry.matches(&meta))
            .map(|entry| entry.descriptor.clone());
        if let Some(descriptor) = cached {
            return Ok(Some(descriptor));
        }

        let hash = hash_file(&full).await?;
        let metadata = FileMetadata::new(hash, mtime_ms(&meta), meta.len());
        let descriptor = FileDescriptor::file(path, metadata);
        self.state().index.insert(
            path.to_string(),
            IndexEntry {
                descriptor: descriptor.clone(),
                disk_size: meta.len(),
                disk_mtime: meta.modified().ok(),
            },
        );
        Ok(Some(descriptor))
    }

    /// Rename a verified partial into place and index it.
    ///
    /// The file takes the sender's modification time, so a later scan
    /// reports the same `lastModified` the index holds now.
    async fn commit(&self, path: &str, loader: &Loader) -> Result<()> {
        let target = self.full_path(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let modified = UNIX_EPOCH + Duration::from_millis(loader.metadata.last_modified);
        if let Err(e) = set_mtime(&loader.partial, modified).await {
            warn!("Failed to set modification time of {}: {}", path, e);
        }
        fs::rename(&loader.partial, &target).await?;
        let meta = fs::metadata(&target).await?;

        let mut state = self.state();
        if let Some(parent) = parent_path(path) {
            state.index_directory(parent);
        }
        state.index.insert(
            path.to_string(),
            IndexEntry {
                descriptor: FileDescriptor::file(path, loader.metadata.clone()),
                disk_size: meta.len(),
                disk_mtime: meta.modified().ok(),
            },
        );
        debug!("Committed {}", path);
        Ok(())
    }

    async fn open_loader(&self, path: String, metadata: FileMetadata) -> Result<()> {
        let partial = self.partial_dir.join(content_hash(path.as_bytes()));
        {
            let mut state = self.state();
            if state.loaders.contains_key(&path) {
                return Err(FsError::TransferInProgress(path));
            }
            state.loaders.insert(
                path.clone(),
                Loader {
                    metadata,
                    partial: partial.clone(),
                    filled: 0,
                },
            );
        }

        let created = async {
            fs::create_dir_all(&self.partial_dir).await?;
            fs::File::create(&partial).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = created {
            self.state().loaders.remove(&path);
            return Err(e.into());
        }
        Ok(())
    }

    fn loader(&self, path: &str) -> Result<Loader> {
        self.state()
            .loaders
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NoLoader(path.to_string()))
    }

    /// Descriptor of an existing local file that must match `wanted`.
    async fn matching_file(&self, wanted: &FileDescriptor) -> Result<String> {
        let path = checked(&wanted.path_name)?;
        match self.describe(&path).await? {
            None => Err(FsError::NotFound(path)),
            Some(local) if local.is_directory() => Err(FsError::IsDirectory(path)),
            Some(local) if local.same_content(wanted) => Ok(path),
            Some(_) => Err(FsError::ContentMismatch(path)),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|c| !c.is_empty())
            .fold(self.root.clone(), |full, component| full.join(component))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn checked(path_name: &str) -> Result<String> {
    if !is_safe_path_name(path_name) {
        return Err(FsError::UnsafePath(path_name.to_string()));
    }
    Ok(normalize_path(path_name))
}

async fn set_mtime(path: &Path, modified: SystemTime) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path).await?;
    file.into_std().await.set_modified(modified)
}

fn mtime_ms(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[async_trait]
impl FileSystemManager for NativeFs {
    async fn dir_name_exists(&self, path_name: &str) -> bool {
        let Ok(path) = checked(path_name) else {
            return false;
        };
        matches!(self.describe(&path).await, Ok(Some(d)) if d.is_directory())
    }

    async fn file_name_exists(&self, path_name: &str, hash: Option<&str>) -> bool {
        let Ok(path) = checked(path_name) else {
            return false;
        };
        match self.describe(&path).await {
            Ok(Some(local)) if !local.is_directory() => {
                hash.map_or(true, |hash| local.hash() == Some(hash))
            }
            _ => false,
        }
    }

    async fn file_descriptor(&self, path_name: &str) -> Result<FileDescriptor> {
        let path = checked(path_name)?;
        self.describe(&path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.clone()))
    }

    async fn make_directory(&self, path_name: &str) -> Result<()> {
        let path = checked(path_name)?;
        if let Some(local) = self.describe(&path).await? {
            if !local.is_directory() {
                return Err(FsError::AlreadyExists(path));
            }
        }
        fs::create_dir_all(self.full_path(&path)).await?;
        self.state().index_directory(&path);
        Ok(())
    }

    async fn delete_directory(&self, path_name: &str) -> Result<()> {
        let path = checked(path_name)?;
        let full = self.full_path(&path);
        match self.describe(&path).await? {
            Some(local) if local.is_directory() => {}
            _ => return Err(FsError::NotFound(path)),
        }
        let mut entries = fs::read_dir(&full).await?;
        if entries.next_entry().await?.is_some() {
            return Err(FsError::DirectoryNotEmpty(path));
        }
        fs::remove_dir(&full).await?;
        self.state().index.remove(&path);
        Ok(())
    }

    async fn create_file_loader(&self, descriptor: &FileDescriptor) -> Result<()> {
        let path = checked(&descriptor.path_name)?;
        let metadata = descriptor
            .metadata
            .clone()
            .ok_or_else(|| FsError::IsDirectory(path.clone()))?;
        if self.state().loaders.contains_key(&path) {
            return Err(FsError::TransferInProgress(path));
        }
        if self.describe(&path).await?.is_some() {
            return Err(FsError::AlreadyExists(path));
        }
        self.open_loader(path, metadata).await
    }

    async fn modify_file_loader(&self, descriptor: &FileDescriptor) -> Result<()> {
        let path = checked(&descriptor.path_name)?;
        let metadata = descriptor
            .metadata
            .clone()
            .ok_or_else(|| FsError::IsDirectory(path.clone()))?;
        if self.state().loaders.contains_key(&path) {
            return Err(FsError::TransferInProgress(path));
        }
        let local = self
            .describe(&path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if local.is_directory() {
            return Err(FsError::IsDirectory(path));
        }
        if local.last_modified() > metadata.last_modified {
            return Err(FsError::LocalNewer(path));
        }
        self.open_loader(path, metadata).await
    }

    async fn write_file(&self, path_name: &str, content: &[u8], position: u64) -> Result<()> {
        let path = checked(path_name)?;
        let loader = self.loader(&path)?;
        let end = position.saturating_add(content.len() as u64);
        if end > loader.metadata.file_size {
            return Err(FsError::Io(format!(
                "write past end of {} ({} > {})",
                path, end, loader.metadata.file_size
            )));
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&loader.partial)
            .await?;
        file.seek(SeekFrom::Start(position)).await?;
        file.write_all(content).await?;
        file.flush().await?;

        let mut state = self.state();
        let loader = state
            .loaders
            .get_mut(&path)
            .ok_or_else(|| FsError::NoLoader(path.clone()))?;
        loader.filled = loader.filled.max(end);
        Ok(())
    }

    async fn check_write_complete(&self, path_name: &str) -> Result<bool> {
        let path = checked(path_name)?;
        let loader = {
            let mut state = self.state();
            let loader = state
                .loaders
                .get(&path)
                .ok_or_else(|| FsError::NoLoader(path.clone()))?;
            if loader.filled < loader.metadata.file_size {
                return Ok(false);
            }
            state
                .loaders
                .remove(&path)
                .ok_or_else(|| FsError::NoLoader(path.clone()))?
        };

        let hash = hash_file(&loader.partial).await?;
        if hash != loader.metadata.hash {
            let _ = fs::remove_file(&loader.partial).await;
            return Err(FsError::ContentMismatch(path));
        }
        if let Err(e) = self.commit(&path, &loader).await {
            let _ = fs::remove_file(&loader.partial).await;
            return Err(e);
        }
        Ok(true)
    }

    async fn check_shortcut(&self, path_name: &str) -> Result<bool> {
        let path = checked(path_name)?;
        let loader = self.loader(&path)?;
        let candidates: Vec<String> = self
            .state()
            .index
            .iter()
            .filter(|(other, entry)| {
                **other != path
                    && entry
                        .descriptor
                        .metadata
                        .as_ref()
                        .is_some_and(|m| m.same_content(&loader.metadata))
            })
            .map(|(other, _)| other.clone())
            .collect();

        for candidate in candidates {
            let still_matches = matches!(
                self.describe(&candidate).await,
                Ok(Some(ref local)) if local.metadata.as_ref().is_some_and(|m| m.same_content(&loader.metadata))
            );
            if !still_matches {
                continue;
            }
            if let Err(e) = fs::copy(self.full_path(&candidate), &loader.partial).await {
                debug!("Shortcut copy from {} failed: {}", candidate, e);
                continue;
            }
            if let Some(open) = self.state().loaders.get_mut(&path) {
                open.filled = open.metadata.file_size;
            }
            debug!("Shortcut {} from {}", path, candidate);
            return self.check_write_complete(&path).await;
        }
        Ok(false)
    }

    async fn cancel_file_loader(&self, path_name: &str) -> Result<bool> {
        let path = checked(path_name)?;
        let Some(loader) = self.state().loaders.remove(&path) else {
            return Ok(false);
        };
        if let Err(e) = fs::remove_file(&loader.partial).await {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove partial for {}: {}", path, e);
            }
        }
        Ok(true)
    }

    async fn read_file(
        &self,
        descriptor: &FileDescriptor,
        position: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let path = self.matching_file(descriptor).await?;
        let mut file = fs::File::open(self.full_path(&path)).await?;
        file.seek(SeekFrom::Start(position)).await?;
        let mut content = Vec::new();
        file.take(length).read_to_end(&mut content).await?;
        Ok(content)
    }

    async fn delete_file(&self, descriptor: &FileDescriptor) -> Result<()> {
        let path = self.matching_file(descriptor).await?;
        fs::remove_file(self.full_path(&path)).await?;
        self.state().index.remove(&path);
        Ok(())
    }

    async fn generate_sync_events(&self) -> Result<Vec<FileEvent>> {
        let descriptors = self.scan().await?;
        Ok(descriptors.iter().map(FileEvent::created).collect())
    }
}
