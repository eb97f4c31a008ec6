//! Chain Store
//!
//! Owns the layer files of one replica and their catalog. Every mutation
//! writes and fsyncs new layer files first, then commits the catalog in a
//! single transaction, then deletes files that fell out of the chain. A
//! crash therefore leaves either the old or the new chain; unreferenced
//! files are swept on the next open.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;

use super::{
    block_digest, BlockChecksum, BlockRange, ChainPaths, Layer, LayerInfo, LayerView,
    PrepareRemoveAction, HEADER_SIZE, HEAD_NAME,
};
use crate::error::{Error, Result};
use crate::revision::PersistedRevision;
use crate::state::{CatalogUpdate, DiskRecord, ReplicaMode, StateTracker, DB_FILE};

/// Largest record written when folding a layer into the head
const MAX_FOLD_BLOCKS: usize = 256;

/// Chain store options
#[derive(Debug, Clone, Copy)]
pub struct ChainOptions {
    /// Flush every record and commit to stable storage
    pub fsync: bool,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self { fsync: true }
    }
}

/// Snapshot chain of one replica
pub struct ChainStore {
    paths: ChainPaths,
    tracker: StateTracker,
    /// Catalog rows, base first, head last
    disks: Vec<DiskRecord>,
    /// Open layers, parallel to `disks`
    layers: Vec<Layer>,
    size: u64,
    block_size: u32,
    rebuilding: bool,
    options: ChainOptions,
}

enum Slot {
    Existing(usize),
    Fresh(Layer),
}

impl ChainStore {
    /// Check whether a chain exists in `dir`
    pub fn exists(dir: &Path) -> Result<bool> {
        if !dir.join(DB_FILE).exists() {
            return Ok(false);
        }
        StateTracker::new(dir.to_path_buf())?.is_initialized()
    }

    /// Create a fresh chain holding a single empty head
    pub fn create(dir: PathBuf, size: u64, block_size: u32, options: ChainOptions) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::InvalidState(format!("Invalid block size {}", block_size)));
        }
        if size == 0 || size % block_size as u64 != 0 {
            return Err(Error::InvalidState(format!(
                "Size {} is not a multiple of block size {}",
                size, block_size
            )));
        }

        let paths = ChainPaths::new(dir);
        paths.ensure_dirs()?;
        let mut tracker = StateTracker::new(paths.base_dir.clone())?;
        if tracker.is_initialized()? {
            return Err(Error::InvalidState(format!(
                "Replica already exists in {:?}",
                paths.base_dir
            )));
        }

        let file = ChainPaths::new_disk_file();
        let head = Layer::create(paths.disk_path(&file), block_size, options.fsync)?;
        paths.sync_dir()?;

        let disks = vec![DiskRecord::new(HEAD_NAME, file, None, 0)];
        tracker.initialize(size, block_size, &disks)?;

        tracing::info!(
            "Created chain in {:?} (size {}, block size {})",
            paths.base_dir,
            size,
            block_size
        );

        Ok(Self {
            paths,
            tracker,
            disks,
            layers: vec![head],
            size,
            block_size,
            rebuilding: false,
            options,
        })
    }

    /// Open an existing chain, verifying its linkage and sweeping orphans
    pub fn open(dir: PathBuf, options: ChainOptions) -> Result<Self> {
        let paths = ChainPaths::new(dir);
        if !Self::exists(&paths.base_dir)? {
            return Err(Error::NotFound(format!("No replica in {:?}", paths.base_dir)));
        }

        let tracker = StateTracker::new(paths.base_dir.clone())?;
        let size = tracker.size()?;
        let block_size = tracker.block_size()?;
        let disks = tracker.load_chain()?;
        verify_links(&disks)?;

        let mut layers = Vec::with_capacity(disks.len());
        for disk in &disks {
            let layer = Layer::open(paths.disk_path(&disk.file), options.fsync).map_err(|e| {
                match e {
                    Error::Io(io) => Error::ChainCorruption(format!(
                        "Layer {} ({}) unreadable: {}",
                        disk.name, disk.file, io
                    )),
                    other => other,
                }
            })?;
            if layer.block_size() != block_size {
                return Err(Error::ChainCorruption(format!(
                    "Layer {} has block size {}, chain uses {}",
                    disk.name,
                    layer.block_size(),
                    block_size
                )));
            }
            layers.push(layer);
        }

        let store = Self {
            rebuilding: tracker.rebuilding()?,
            paths,
            tracker,
            disks,
            layers,
            size,
            block_size,
            options,
        };
        store.remove_orphans()?;

        tracing::info!(
            "Opened chain in {:?} with {} layers",
            store.paths.base_dir,
            store.layers.len()
        );
        Ok(store)
    }

    fn remove_orphans(&self) -> Result<()> {
        let mut removed = false;
        for entry in std::fs::read_dir(&self.paths.base_dir)? {
            let entry = entry?;
            let file = entry.file_name().to_string_lossy().into_owned();
            if ChainPaths::is_disk_file(&file) && !self.disks.iter().any(|d| d.file == file) {
                tracing::warn!("Removing orphaned layer file {}", file);
                std::fs::remove_file(entry.path())?;
                removed = true;
            }
        }
        if removed {
            self.paths.sync_dir()?;
        }
        Ok(())
    }

    /// Volume size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Block size in bytes
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Whether a rebuild is reconciling this chain
    pub fn rebuilding(&self) -> bool {
        self.rebuilding
    }

    /// Replica directory
    pub fn dir(&self) -> &Path {
        &self.paths.base_dir
    }

    fn head(&self) -> &Layer {
        &self.layers[self.layers.len() - 1]
    }

    fn head_mut(&mut self) -> &mut Layer {
        let top = self.layers.len() - 1;
        &mut self.layers[top]
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.disks.iter().position(|d| d.name == name)
    }

    fn require(&self, name: &str) -> Result<usize> {
        self.position(name)
            .ok_or_else(|| Error::NotFound(format!("Layer {} is not in the chain", name)))
    }

    fn require_inactive(&self, name: &str) -> Result<usize> {
        if name == HEAD_NAME {
            return Err(Error::InvalidState("The live head cannot be written by a transfer".into()));
        }
        self.require(name)
    }

    /// Counter recovered from the catalog anchor and the head records
    pub fn recovered_revision(&self) -> Result<u64> {
        let anchor = self.tracker.revision()?;
        Ok(anchor.recover(self.head().len(), self.head().last_revision()))
    }

    /// Last persisted replica mode
    pub fn persisted_mode(&self) -> Result<ReplicaMode> {
        self.tracker.mode()
    }

    /// Persist the replica mode
    pub fn persist_mode(&mut self, mode: ReplicaMode) -> Result<()> {
        self.tracker.commit(CatalogUpdate {
            mode: Some(mode),
            ..Default::default()
        })
    }

    /// Anchor the revision counter at the current head length
    pub fn persist_revision(&mut self, counter: u64) -> Result<()> {
        let head_offset = self.head().len();
        self.tracker.commit(CatalogUpdate {
            revision: Some(PersistedRevision { counter, head_offset }),
            ..Default::default()
        })
    }

    fn commit_chain(&mut self, disks: Vec<DiskRecord>, revision: Option<PersistedRevision>) -> Result<()> {
        self.tracker.commit(CatalogUpdate {
            chain: Some(&disks),
            revision,
            ..Default::default()
        })?;
        self.disks = disks;
        Ok(())
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::InvalidState(format!(
                "I/O at offset {} length {} is beyond volume size {}",
                offset, len, self.size
            ))),
        }
    }

    fn visible_block(&self, top: usize, block: u64) -> Result<Option<Vec<u8>>> {
        for layer in self.layers[..top].iter().rev() {
            if let Some(data) = layer.read_block(block)? {
                return Ok(Some(data));
            }
        }
        Ok(None)
    }

    /// Read through the chain; blocks no layer holds read as zeros
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.check_range(offset, len as u64)?;

        let bs = self.block_size as u64;
        let end = offset + len as u64;
        let mut out = Vec::with_capacity(len);
        let mut pos = offset;

        while pos < end {
            let block = pos / bs;
            let within = (pos % bs) as usize;
            let take = (bs - within as u64).min(end - pos) as usize;
            match self.visible_block(self.layers.len(), block)? {
                Some(data) => out.extend_from_slice(&data[within..within + take]),
                None => out.resize(out.len() + take, 0),
            }
            pos += take as u64;
        }

        Ok(out)
    }

    /// Write into the head as a single record stamped with `revision`
    pub fn write_at(&mut self, offset: u64, data: &[u8], revision: u64) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidState("Empty write".into()));
        }
        self.check_range(offset, data.len() as u64)?;

        let bs = self.block_size as u64;
        let end = offset + data.len() as u64;
        let first = offset / bs;
        let last = (end - 1) / bs;
        let partial_start = offset % bs != 0;
        let partial_end = end % bs != 0;

        let mut buf = vec![0u8; ((last - first + 1) * bs) as usize];
        if partial_start || (first == last && partial_end) {
            if let Some(existing) = self.visible_block(self.layers.len(), first)? {
                buf[..bs as usize].copy_from_slice(&existing);
            }
        }
        if partial_end && last != first {
            if let Some(existing) = self.visible_block(self.layers.len(), last)? {
                let at = ((last - first) * bs) as usize;
                buf[at..].copy_from_slice(&existing);
            }
        }

        let at = (offset - first * bs) as usize;
        buf[at..at + data.len()].copy_from_slice(data);
        self.head_mut().append_blocks(revision, first, &buf)
    }

    fn validate_new_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name == HEAD_NAME || name.contains('/') {
            return Err(Error::InvalidState(format!("Invalid snapshot name '{}'", name)));
        }
        if self.position(name).is_some() {
            return Err(Error::InvalidState(format!("Snapshot {} already exists", name)));
        }
        Ok(())
    }

    fn create_layer(&self) -> Result<(String, Layer)> {
        let file = ChainPaths::new_disk_file();
        let layer = Layer::create(self.paths.disk_path(&file), self.block_size, self.options.fsync)?;
        Ok((file, layer))
    }

    fn discard_file(&self, path: &Path) {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to delete layer file {:?}: {}", path, e);
        }
    }

    /// Freeze the head as snapshot `name` and open a new empty head on top
    pub fn snapshot(&mut self, name: &str, revision: u64) -> Result<()> {
        if self.rebuilding {
            return Err(Error::ChainBusy(format!("Cannot snapshot {} during a rebuild", name)));
        }
        self.validate_new_name(name)?;

        self.head().sync()?;
        let (file, head) = self.create_layer()?;
        self.paths.sync_dir()?;

        let mut disks = self.disks.clone();
        let top = disks.len() - 1;
        disks[top].name = name.to_string();
        disks[top].created_revision = revision;
        disks[top].created_at = Utc::now();
        disks.push(DiskRecord::new(HEAD_NAME, file, Some(name.to_string()), 0));

        let anchor = PersistedRevision {
            counter: revision,
            head_offset: HEADER_SIZE as u64,
        };
        if let Err(e) = self.commit_chain(disks, Some(anchor)) {
            self.discard_file(head.path());
            return Err(e);
        }
        self.layers.push(head);

        tracing::info!("Created snapshot {} at revision {}", name, revision);
        Ok(())
    }

    /// Mark `name` as the single current checkpoint
    pub fn set_checkpoint(&mut self, name: &str) -> Result<()> {
        if name == HEAD_NAME {
            return Err(Error::InvalidState("The live head cannot be a checkpoint".into()));
        }
        let idx = self.require(name)?;

        let mut disks = self.disks.clone();
        for (i, disk) in disks.iter_mut().enumerate() {
            disk.checkpoint = i == idx;
        }
        self.commit_chain(disks, None)?;

        tracing::info!("Checkpoint set to {}", name);
        Ok(())
    }

    /// Discard every layer above `name` and put a fresh head on it
    pub fn revert(&mut self, name: &str, revision: u64) -> Result<()> {
        if self.rebuilding {
            return Err(Error::InvalidState(format!("Cannot revert to {} during a rebuild", name)));
        }
        if name == HEAD_NAME {
            return Err(Error::InvalidState("Cannot revert to the live head".into()));
        }
        let idx = self.require(name)?;

        let (file, head) = self.create_layer()?;
        self.paths.sync_dir()?;

        let mut disks = self.disks[..=idx].to_vec();
        disks.push(DiskRecord::new(HEAD_NAME, file, Some(name.to_string()), 0));

        let anchor = PersistedRevision {
            counter: revision,
            head_offset: HEADER_SIZE as u64,
        };
        if let Err(e) = self.commit_chain(disks, Some(anchor)) {
            self.discard_file(head.path());
            return Err(e);
        }

        let dropped = self.layers.split_off(idx + 1);
        self.layers.push(head);
        for layer in dropped {
            self.discard_file(layer.path());
        }
        self.paths.sync_dir()?;

        tracing::info!("Reverted to snapshot {}", name);
        Ok(())
    }

    fn validate_removal(&self, name: &str) -> Result<usize> {
        if name == HEAD_NAME {
            return Err(Error::InvalidState("Cannot remove the live head".into()));
        }
        let idx = self.require(name)?;

        if self.disks[idx].checkpoint {
            return Err(Error::Dependency(format!("{} is the current checkpoint", name)));
        }

        let child = &self.disks[idx + 1];
        if child.name != HEAD_NAME {
            return Err(Error::Dependency(format!(
                "Snapshot {} depends on {}",
                child.name, name
            )));
        }

        Ok(idx)
    }

    /// Validate removal of `name` without touching the chain
    pub fn prepare_remove_disk(&self, name: &str) -> Result<Vec<PrepareRemoveAction>> {
        if self.rebuilding {
            return Err(Error::ChainBusy(format!("Cannot remove {} during a rebuild", name)));
        }
        self.validate_removal(name)?;

        Ok(vec![
            PrepareRemoveAction::Coalesce {
                from: name.to_string(),
                into: HEAD_NAME.to_string(),
            },
            PrepareRemoveAction::Remove {
                name: name.to_string(),
            },
        ])
    }

    /// Fold `name` into the head and unlink it
    pub fn remove_disk(&mut self, name: &str, revision: u64) -> Result<()> {
        if self.rebuilding {
            return Err(Error::ChainBusy(format!("Cannot remove {} during a rebuild", name)));
        }
        let idx = self.validate_removal(name)?;
        let head_idx = self.layers.len() - 1;

        let blocks: Vec<u64> = self.layers[idx]
            .allocated_blocks()
            .filter(|block| !self.layers[head_idx].contains(*block))
            .collect();
        let ranges = BlockRange::coalesce(blocks, MAX_FOLD_BLOCKS);

        for range in &ranges {
            let data = self.own_range(idx, *range)?;
            self.layers[head_idx].append_blocks(revision, range.first, &data)?;
        }
        self.layers[head_idx].sync()?;

        let mut disks = self.disks.clone();
        let removed = disks.remove(idx);
        let top = disks.len() - 1;
        disks[top].parent = removed.parent.clone();

        let anchor = PersistedRevision {
            counter: revision,
            head_offset: self.layers[head_idx].len(),
        };
        self.commit_chain(disks, Some(anchor))?;

        let layer = self.layers.remove(idx);
        self.discard_file(layer.path());
        self.paths.sync_dir()?;

        tracing::info!(
            "Removed layer {} ({} ranges folded into head)",
            name,
            ranges.len()
        );
        Ok(())
    }

    /// Swap the file backing `old` for the staged layer file `staged`
    pub fn replace_disk(&mut self, old: &str, staged: &str) -> Result<()> {
        if old == HEAD_NAME {
            return Err(Error::InvalidState("Cannot replace the live head".into()));
        }
        let idx = self.require(old)?;

        if staged.is_empty() || staged.contains('/') || staged == ".." {
            return Err(Error::ChainCorruption(format!("Invalid staged file name '{}'", staged)));
        }
        if self.disks.iter().any(|d| d.file == staged) {
            return Err(Error::ChainCorruption(format!("{} is already linked in the chain", staged)));
        }

        let staged_path = self.paths.disk_path(staged);
        if !staged_path.is_file() {
            return Err(Error::ChainCorruption(format!("Staged file {} does not exist", staged)));
        }
        let staged_layer = Layer::open(staged_path.clone(), self.options.fsync).map_err(|e| {
            Error::ChainCorruption(format!("Staged file {} is not a valid layer: {}", staged, e))
        })?;
        if staged_layer.block_size() != self.block_size {
            return Err(Error::ChainCorruption(format!(
                "Staged file {} has block size {}, chain uses {}",
                staged,
                staged_layer.block_size(),
                self.block_size
            )));
        }
        staged_layer.sync()?;
        drop(staged_layer);

        let file = ChainPaths::new_disk_file();
        let new_path = self.paths.disk_path(&file);
        std::fs::rename(&staged_path, &new_path)?;
        self.paths.sync_dir()?;
        let layer = Layer::open(new_path, self.options.fsync)?;

        let mut disks = self.disks.clone();
        disks[idx].file = file;
        if let Err(e) = self.commit_chain(disks, None) {
            self.discard_file(layer.path());
            return Err(e);
        }

        let previous = std::mem::replace(&mut self.layers[idx], layer);
        self.discard_file(previous.path());
        self.paths.sync_dir()?;

        tracing::info!("Replaced layer {} with staged file {}", old, staged);
        Ok(())
    }

    /// Grow the volume
    pub fn resize(&mut self, size: u64) -> Result<()> {
        if self.rebuilding {
            return Err(Error::ChainBusy("Cannot resize during a rebuild".into()));
        }
        if size % self.block_size as u64 != 0 {
            return Err(Error::InvalidState(format!(
                "Size {} is not a multiple of block size {}",
                size, self.block_size
            )));
        }
        if size < self.size {
            return Err(Error::InvalidState(format!(
                "Cannot shrink volume from {} to {}",
                self.size, size
            )));
        }
        if size == self.size {
            return Ok(());
        }

        self.tracker.commit(CatalogUpdate {
            size: Some(size),
            ..Default::default()
        })?;
        tracing::info!("Resized volume from {} to {}", self.size, size);
        self.size = size;
        Ok(())
    }

    /// Chain layers, head first
    pub fn layers(&self) -> Vec<LayerInfo> {
        let top = self.disks.len() - 1;
        self.disks
            .iter()
            .zip(&self.layers)
            .enumerate()
            .rev()
            .map(|(i, (disk, layer))| LayerInfo {
                name: disk.name.clone(),
                parent: disk.parent.clone(),
                created_revision: disk.created_revision,
                checkpoint: disk.checkpoint,
                head: i == top,
                allocated_blocks: layer.allocated_count(),
                created_at: disk.created_at,
            })
            .collect()
    }

    /// Reconcile this chain to a source chain (head first, as `layers()`
    /// returns it), grow to `size` and start a fresh head at counter
    /// `revision`.
    ///
    /// Same-named layers are kept, the old head becomes the newest source
    /// snapshot when that name is missing locally, other missing layers
    /// are created empty and everything else is dropped.
    pub fn prepare_rebuild(&mut self, source: &[LayerInfo], size: u64, revision: u64) -> Result<()> {
        if size < self.size || size % self.block_size as u64 != 0 {
            return Err(Error::InvalidState(format!(
                "Rebuild size {} does not fit a chain of size {} and block size {}",
                size, self.size, self.block_size
            )));
        }

        let wanted: Vec<&LayerInfo> = source.iter().rev().filter(|l| !l.head).collect();
        for (i, info) in wanted.iter().enumerate() {
            let expected = if i == 0 { None } else { Some(wanted[i - 1].name.as_str()) };
            if info.parent.as_deref() != expected || info.name == HEAD_NAME {
                return Err(Error::ChainCorruption(format!(
                    "Source chain is not linked at layer {}",
                    info.name
                )));
            }
        }

        let old_head = self.disks.len() - 1;
        let newest = wanted.last().map(|l| l.name.clone());
        let mut slots = Vec::with_capacity(wanted.len() + 1);
        let mut disks = Vec::with_capacity(wanted.len() + 1);
        let mut created = Vec::new();

        for info in &wanted {
            let existing = match self.position(&info.name) {
                Some(i) if i != old_head => Some(i),
                _ if newest.as_deref() == Some(info.name.as_str()) => Some(old_head),
                _ => None,
            };
            let file = match existing {
                Some(i) => {
                    slots.push(Slot::Existing(i));
                    self.disks[i].file.clone()
                }
                None => {
                    let (file, layer) = self.create_layer()?;
                    created.push(layer.path().to_path_buf());
                    slots.push(Slot::Fresh(layer));
                    file
                }
            };
            disks.push(DiskRecord {
                name: info.name.clone(),
                file,
                parent: info.parent.clone(),
                created_revision: info.created_revision,
                checkpoint: info.checkpoint,
                created_at: info.created_at,
            });
        }

        let (file, head) = self.create_layer()?;
        created.push(head.path().to_path_buf());
        slots.push(Slot::Fresh(head));
        disks.push(DiskRecord::new(HEAD_NAME, file, newest, 0));
        self.paths.sync_dir()?;

        let committed = self.tracker.commit(CatalogUpdate {
            chain: Some(&disks),
            revision: Some(PersistedRevision {
                counter: revision,
                head_offset: HEADER_SIZE as u64,
            }),
            rebuilding: Some(true),
            size: Some(size),
            ..Default::default()
        });
        if let Err(e) = committed {
            for path in &created {
                self.discard_file(path);
            }
            return Err(e);
        }

        let mut previous: Vec<Option<Layer>> =
            std::mem::take(&mut self.layers).into_iter().map(Some).collect();
        let mut layers = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                Slot::Existing(i) => match previous[i].take() {
                    Some(layer) => layers.push(layer),
                    None => {
                        return Err(Error::Internal(format!("Layer slot {} reused twice", i)));
                    }
                },
                Slot::Fresh(layer) => layers.push(layer),
            }
        }
        for layer in previous.into_iter().flatten() {
            self.discard_file(layer.path());
        }
        self.paths.sync_dir()?;

        self.disks = disks;
        self.layers = layers;
        self.rebuilding = true;
        self.size = size;

        tracing::info!(
            "Prepared rebuild: {} layers reconciled, counter reset to {}",
            wanted.len(),
            revision
        );
        Ok(())
    }

    /// Clear the rebuild flag once the chain is caught up
    pub fn finish_rebuild(&mut self) -> Result<()> {
        for layer in &self.layers {
            layer.sync()?;
        }
        self.tracker.commit(CatalogUpdate {
            rebuilding: Some(false),
            ..Default::default()
        })?;
        self.rebuilding = false;
        Ok(())
    }

    fn own_range(&self, idx: usize, range: BlockRange) -> Result<Vec<u8>> {
        let layer = &self.layers[idx];
        let mut data = Vec::with_capacity(range.count as usize * self.block_size as usize);
        for block in range.first..range.end() {
            let bytes = layer.read_block(block)?.ok_or_else(|| {
                Error::NotFound(format!(
                    "Block {} is not allocated in layer {}",
                    block, self.disks[idx].name
                ))
            })?;
            data.extend_from_slice(&bytes);
        }
        Ok(data)
    }

    /// Per-block digests of a layer within `range`
    pub fn digests(&self, name: &str, view: LayerView, range: BlockRange) -> Result<Vec<BlockChecksum>> {
        let idx = self.require(name)?;
        let count = range.count as u64;
        let mut checksums = Vec::new();

        match view {
            LayerView::Own => {
                let layer = &self.layers[idx];
                for block in layer.allocated_in(range.first, count) {
                    if let Some(data) = layer.read_block(block)? {
                        checksums.push(BlockChecksum { block, digest: block_digest(&data) });
                    }
                }
            }
            LayerView::Flattened => {
                let blocks: BTreeSet<u64> = self.layers[..=idx]
                    .iter()
                    .flat_map(|layer| layer.allocated_in(range.first, count))
                    .collect();
                for block in blocks {
                    if let Some(data) = self.visible_block(idx + 1, block)? {
                        checksums.push(BlockChecksum { block, digest: block_digest(&data) });
                    }
                }
            }
        }

        Ok(checksums)
    }

    /// Read a range of blocks of a layer
    pub fn read_range(&self, name: &str, range: BlockRange, view: LayerView) -> Result<Vec<u8>> {
        let idx = self.require(name)?;
        match view {
            LayerView::Own => self.own_range(idx, range),
            LayerView::Flattened => {
                let bs = self.block_size as usize;
                let mut data = Vec::with_capacity(range.count as usize * bs);
                for block in range.first..range.end() {
                    match self.visible_block(idx + 1, block)? {
                        Some(bytes) => data.extend_from_slice(&bytes),
                        None => data.resize(data.len() + bs, 0),
                    }
                }
                Ok(data)
            }
        }
    }

    /// Write transferred blocks into an inactive layer
    pub fn apply_range(&mut self, name: &str, first: u64, data: &[u8]) -> Result<()> {
        let idx = self.require_inactive(name)?;
        self.check_range(first * self.block_size as u64, data.len() as u64)?;
        self.layers[idx].append_blocks(0, first, data)
    }

    /// Un-allocate blocks of an inactive layer
    pub fn trim_range(&mut self, name: &str, range: BlockRange) -> Result<()> {
        let idx = self.require_inactive(name)?;
        self.layers[idx].trim_blocks(range.first, range.count)
    }

    /// Flush the live head to stable storage
    pub fn flush_head(&self) -> Result<()> {
        self.head().sync()
    }

    /// Flush an inactive layer after a transfer
    pub fn flush_layer(&self, name: &str) -> Result<()> {
        let idx = self.require_inactive(name)?;
        self.layers[idx].sync()
    }
}

fn verify_links(disks: &[DiskRecord]) -> Result<()> {
    let head = disks
        .last()
        .ok_or_else(|| Error::ChainCorruption("Chain has no layers".into()))?;
    if head.name != HEAD_NAME {
        return Err(Error::ChainCorruption(format!(
            "Top of chain is {}, expected {}",
            head.name, HEAD_NAME
        )));
    }

    let mut seen = HashSet::new();
    for (i, disk) in disks.iter().enumerate() {
        let expected = if i == 0 { None } else { Some(disks[i - 1].name.as_str()) };
        if disk.parent.as_deref() != expected {
            return Err(Error::ChainCorruption(format!(
                "Layer {} links to {:?}, expected {:?}",
                disk.name, disk.parent, expected
            )));
        }
        if !seen.insert(disk.name.as_str()) {
            return Err(Error::ChainCorruption(format!("Layer {} appears twice", disk.name)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BS: u32 = 512;
    const SIZE: u64 = 64 * BS as u64;

    fn options() -> ChainOptions {
        ChainOptions { fsync: false }
    }

    fn block(fill: u8) -> Vec<u8> {
        vec![fill; BS as usize]
    }

    fn names(store: &ChainStore) -> Vec<String> {
        store.layers().into_iter().map(|l| l.name).collect()
    }

    #[test]
    fn test_partial_writes_read_modify_write() {
        let dir = tempdir().unwrap();
        let mut store = ChainStore::create(dir.path().to_path_buf(), SIZE, BS, options()).unwrap();

        store.write_at(0, &[block(1), block(1)].concat(), 1).unwrap();
        store.write_at(500, &[9u8; 20], 2).unwrap();

        let data = store.read_at(0, 2 * BS as usize).unwrap();
        assert_eq!(&data[..500], &[1u8; 500][..]);
        assert_eq!(&data[500..520], &[9u8; 20][..]);
        assert_eq!(&data[520..], &vec![1u8; 2 * BS as usize - 520][..]);

        // Never-written blocks read as zeros
        assert_eq!(store.read_at(10 * BS as u64, 4).unwrap(), vec![0u8; 4]);
        assert!(matches!(store.read_at(SIZE - 1, 2), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_snapshot_and_revert_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = ChainStore::create(dir.path().to_path_buf(), SIZE, BS, options()).unwrap();

        store.write_at(0, &block(1), 1).unwrap();
        store.snapshot("snap-1", 1).unwrap();
        store.write_at(0, &block(2), 2).unwrap();
        store.write_at(BS as u64, &block(3), 3).unwrap();

        store.revert("snap-1", 3).unwrap();
        assert_eq!(store.read_at(0, BS as usize).unwrap(), block(1));
        assert_eq!(store.read_at(BS as u64, BS as usize).unwrap(), block(0));

        store.revert("snap-1", 3).unwrap();
        assert_eq!(store.read_at(0, BS as usize).unwrap(), block(1));
        assert_eq!(names(&store), vec![HEAD_NAME, "snap-1"]);

        assert!(matches!(store.revert("missing", 3), Err(Error::NotFound(_))));
        assert!(matches!(store.snapshot("snap-1", 3), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_remove_disk_dependency_leaves_chain_untouched() {
        let dir = tempdir().unwrap();
        let mut store = ChainStore::create(dir.path().to_path_buf(), SIZE, BS, options()).unwrap();

        store.write_at(0, &block(1), 1).unwrap();
        store.snapshot("snap-1", 1).unwrap();
        store.write_at(0, &block(2), 2).unwrap();
        store.snapshot("snap-2", 2).unwrap();

        let before = store.layers();
        assert!(matches!(store.prepare_remove_disk("snap-1"), Err(Error::Dependency(_))));
        assert_eq!(store.layers(), before);

        store.set_checkpoint("snap-2").unwrap();
        assert!(matches!(store.prepare_remove_disk("snap-2"), Err(Error::Dependency(_))));
        assert!(matches!(store.prepare_remove_disk(HEAD_NAME), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_remove_disk_folds_into_head() {
        let dir = tempdir().unwrap();
        let mut store = ChainStore::create(dir.path().to_path_buf(), SIZE, BS, options()).unwrap();

        store.write_at(0, &[block(1), block(2)].concat(), 1).unwrap();
        store.snapshot("snap-1", 1).unwrap();
        store.write_at(0, &block(7), 2).unwrap();

        let actions = store.prepare_remove_disk("snap-1").unwrap();
        assert_eq!(actions.len(), 2);
        store.remove_disk("snap-1", 2).unwrap();

        assert_eq!(names(&store), vec![HEAD_NAME]);
        assert_eq!(store.read_at(0, BS as usize).unwrap(), block(7));
        assert_eq!(store.read_at(BS as u64, BS as usize).unwrap(), block(2));
        assert_eq!(store.recovered_revision().unwrap(), 2);

        drop(store);
        let store = ChainStore::open(dir.path().to_path_buf(), options()).unwrap();
        assert_eq!(store.read_at(BS as u64, BS as usize).unwrap(), block(2));
    }

    #[test]
    fn test_reopen_recovers_revision_and_sweeps_orphans() {
        let dir = tempdir().unwrap();
        let mut store = ChainStore::create(dir.path().to_path_buf(), SIZE, BS, options()).unwrap();
        store.write_at(0, &block(1), 1).unwrap();
        store.snapshot("snap-1", 1).unwrap();
        store.write_at(0, &block(2), 2).unwrap();
        store.write_at(0, &block(3), 3).unwrap();
        drop(store);

        let orphan = dir.path().join(ChainPaths::new_disk_file());
        std::fs::write(&orphan, b"left over").unwrap();
        let staged = dir.path().join("repair-staged.img");
        std::fs::write(&staged, b"kept").unwrap();

        let store = ChainStore::open(dir.path().to_path_buf(), options()).unwrap();
        assert_eq!(store.recovered_revision().unwrap(), 3);
        assert!(!orphan.exists());
        assert!(staged.exists());
    }

    #[test]
    fn test_replace_disk_validation() {
        let dir = tempdir().unwrap();
        let mut store = ChainStore::create(dir.path().to_path_buf(), SIZE, BS, options()).unwrap();
        store.write_at(0, &block(1), 1).unwrap();
        store.snapshot("snap-1", 1).unwrap();

        assert!(matches!(
            store.replace_disk("snap-1", "missing.img"),
            Err(Error::ChainCorruption(_))
        ));
        assert!(matches!(
            store.replace_disk(HEAD_NAME, "missing.img"),
            Err(Error::InvalidState(_))
        ));

        let wrong = dir.path().join("wrong-bs.img");
        Layer::create(wrong, BS * 2, false).unwrap();
        assert!(matches!(
            store.replace_disk("snap-1", "wrong-bs.img"),
            Err(Error::ChainCorruption(_))
        ));

        let mut repaired = Layer::create(dir.path().join("repaired.img"), BS, false).unwrap();
        repaired.append_blocks(0, 0, &block(5)).unwrap();
        drop(repaired);
        store.replace_disk("snap-1", "repaired.img").unwrap();
        assert_eq!(store.read_at(0, BS as usize).unwrap(), block(5));
        assert!(!dir.path().join("repaired.img").exists());
    }

    #[test]
    fn test_resize_grow_only() {
        let dir = tempdir().unwrap();
        let mut store = ChainStore::create(dir.path().to_path_buf(), SIZE, BS, options()).unwrap();

        assert!(matches!(store.resize(SIZE - BS as u64), Err(Error::InvalidState(_))));
        assert!(matches!(store.resize(SIZE + 1), Err(Error::InvalidState(_))));
        store.resize(SIZE * 2).unwrap();
        store.write_at(SIZE, &block(4), 1).unwrap();
        assert_eq!(store.size(), SIZE * 2);
    }

    #[test]
    fn test_prepare_rebuild_reconciles_layers() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let mut source = ChainStore::create(src_dir.path().to_path_buf(), SIZE, BS, options()).unwrap();
        let mut target = ChainStore::create(dst_dir.path().to_path_buf(), SIZE, BS, options()).unwrap();

        source.write_at(0, &block(1), 1).unwrap();
        source.snapshot("snap-1", 1).unwrap();
        source.write_at(0, &block(2), 2).unwrap();
        source.snapshot("rebuild-x", 2).unwrap();

        target.write_at(0, &block(1), 1).unwrap();
        target.snapshot("stale", 1).unwrap();

        assert!(matches!(
            target.prepare_rebuild(&source.layers(), SIZE / 2, 2),
            Err(Error::InvalidState(_))
        ));
        target.prepare_rebuild(&source.layers(), SIZE, 2).unwrap();
        assert!(target.rebuilding());
        assert_eq!(names(&target), vec![HEAD_NAME, "rebuild-x", "snap-1"]);
        assert_eq!(target.recovered_revision().unwrap(), 2);
        assert!(matches!(target.snapshot("s", 2), Err(Error::ChainBusy(_))));
        assert!(matches!(
            target.apply_range(HEAD_NAME, 0, &block(1)),
            Err(Error::InvalidState(_))
        ));

        let all = BlockRange::new(0, (SIZE / BS as u64) as u32);
        for name in ["snap-1", "rebuild-x"] {
            for checksum in source.digests(name, LayerView::Own, all).unwrap() {
                let range = BlockRange::new(checksum.block, 1);
                let data = source.read_range(name, range, LayerView::Own).unwrap();
                target.apply_range(name, checksum.block, &data).unwrap();
            }
        }
        target.finish_rebuild().unwrap();

        assert_eq!(target.read_at(0, BS as usize).unwrap(), block(2));
        assert_eq!(
            target.digests("rebuild-x", LayerView::Flattened, all).unwrap(),
            source.digests("rebuild-x", LayerView::Flattened, all).unwrap()
        );
        assert!(source
            .digests("snap-1", LayerView::Own, BlockRange::new(1, 8))
            .unwrap()
            .is_empty());
    }
}
