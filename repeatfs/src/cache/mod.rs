//! Block Cache Engine, mirroring `cache_entry.py`.

pub mod block;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::descriptor::{DescriptorId, DescriptorTable};
use crate::error::{Error, Result};
use crate::identity::FileIdentity;
use crate::mediator::Mediator;

use block::{disk_overflow_path, get_disk_block, init_disk_overflow, set_disk_block, Block};

/// The four cache-entry operations (`CacheEntry.IO_READ` et al).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Truncate,
    Reset,
}

/// Result of a completed [`CacheEntry::io`] call.
pub enum IoOutcome {
    Read(Vec<u8>),
    Written(usize),
}

struct Inner {
    blocks: HashMap<u64, Block>,
    blocks_block_pos: u64,
    size: u64,
    mtime: f64,
    finalized: bool,
    waiting: HashMap<DescriptorId, (u64, Instant)>,
    cache_path: PathBuf,
}

/// One cached virtual derived file: its memory block map, disk overflow
/// location, and the process mediator feeding it.
pub struct CacheEntry {
    inner: Mutex<Inner>,
    cvar: Condvar,
    mediator: Mediator,
    descriptors: Mutex<HashSet<DescriptorId>>,
    identity: FileIdentity,
    config: Arc<Config>,
    /// Per-entry options the control endpoint's `config_vdf` command can
    /// update at runtime (`CacheEntry.config`, `CacheEntry.update_config`).
    entry_config: Mutex<HashMap<String, serde_json::Value>>,
}

impl CacheEntry {
    /// Construct a fresh entry for `identity`, initializing its disk overflow
    /// file (`CacheEntry.__init__` + `reset_cache`).
    pub fn new(identity: FileIdentity, config: Arc<Config>) -> Result<Arc<Self>> {
        let cache_path = disk_overflow_path(&config.cache_path, &identity.paths.abs_real);
        init_disk_overflow(&cache_path)?;

        Ok(Arc::new(CacheEntry {
            inner: Mutex::new(Inner {
                blocks: HashMap::new(),
                blocks_block_pos: 0,
                size: 0,
                mtime: 0.0,
                finalized: false,
                waiting: HashMap::new(),
                cache_path,
            }),
            cvar: Condvar::new(),
            mediator: Mediator::new(),
            descriptors: Mutex::new(HashSet::new()),
            identity,
            config,
            entry_config: Mutex::new(HashMap::new()),
        }))
    }

    /// Merge `options` into this entry's runtime configuration, matching
    /// `CacheEntry.update_config` (invoked by the control endpoint's
    /// `config_vdf` command).
    pub fn update_config(&self, options: HashMap<String, serde_json::Value>) {
        self.entry_config.lock().extend(options);
    }

    /// Fetch one runtime-configured option, if set.
    pub fn config_value(&self, key: &str) -> Option<serde_json::Value> {
        self.entry_config.lock().get(key).cloned()
    }

    /// The resolved file identity this entry caches.
    pub fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    /// Current known file size.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Whether the producing process has finished and no more bytes will arrive.
    pub fn is_finalized(&self) -> bool {
        self.inner.lock().finalized
    }

    /// mtime to report to the kernel: the finalized VDF's own mtime once
    /// known, or the entry's initial mtime before that.
    pub fn mtime(&self) -> f64 {
        self.inner.lock().mtime
    }

    fn io_read_locked(inner: &Inner, block_idx: u64, block_pos: u64, size: u64, ret_data: &mut [u8], ret_size: u64) -> u64 {
        let block = match inner.blocks.get(&block_idx) {
            Some(b) => b,
            None => return ret_size,
        };

        let consume_size = (size - ret_size) as usize;
        let pos = block_pos as usize;
        let avail = block.data.len().saturating_sub(pos);
        let consume_size = consume_size.min(avail);

        if consume_size > 0 {
            ret_data[ret_size as usize..ret_size as usize + consume_size]
                .copy_from_slice(&block.data[pos..pos + consume_size]);
        }

        ret_size + consume_size as u64
    }

    fn io_write_locked(
        self: &Arc<Self>,
        inner: &mut Inner,
        history: &BlockHistory,
        block_idx: u64,
        block_pos: u64,
        new_data: &[u8],
        new_dirty: bool,
        ret_size: u64,
    ) -> u64 {
        let block_size = self.config.block_size;
        let block = inner.blocks.entry(block_idx).or_insert_with(Block::new);

        let consume_size = (new_data.len() as u64 - ret_size).min(block_size - block_pos);
        let start = block_pos as usize;
        let consume = consume_size as usize;

        if block.data.len() < start + consume {
            block.data.resize(start + consume, 0);
        }
        block.data[start..start + consume].copy_from_slice(&new_data[ret_size as usize..ret_size as usize + consume]);
        block.dirty = new_dirty;

        history.push(self, block_idx);

        if block_idx + 1 > inner.blocks_block_pos {
            inner.blocks_block_pos = block_idx + 1;
        }
        if block_idx + 1 == inner.blocks_block_pos {
            let len = inner.blocks.get(&block_idx).map(|b| b.data.len()).unwrap_or(0);
            inner.size = block_idx * block_size + len as u64;
        }

        ret_size + consume_size
    }

    fn io_truncate_locked(&self, inner: &mut Inner, block_idx: u64, block_pos: u64) {
        let block_size = self.config.block_size;

        let stale: Vec<u64> = ((block_idx + 1)..inner.blocks_block_pos).collect();
        for idx in stale {
            inner.blocks.remove(&idx);
        }

        if let Some(block) = inner.blocks.get_mut(&block_idx) {
            block.data.truncate(block_pos as usize);
            block.dirty = true;
        }

        inner.blocks_block_pos = block_idx + 1;
        inner.size = block_idx * block_size + block_pos;
    }

    fn io_fill_locked(&self, inner: &mut Inner, block_idx: u64, block_pos: u64) {
        let block_size = self.config.block_size as usize;

        if inner.blocks_block_pos > 0 {
            for fill_idx in (inner.blocks_block_pos - 1)..block_idx {
                let block = inner.blocks.entry(fill_idx).or_insert_with(Block::new);
                let target = block_size;
                block.data.resize(target, 0);
                block.dirty = true;
            }
        }

        let block = inner.blocks.entry(block_idx).or_insert_with(Block::new);
        block.data.resize(block_pos as usize, 0);
        block.dirty = true;

        inner.blocks_block_pos = block_idx + 1;
        inner.size = block_idx * self.config.block_size + block_pos;
    }

    /// Wait until this (block, descriptor, operation) has IO priority,
    /// matching `CacheEntry.priority_wait`. Reads of already-cached blocks,
    /// or the earliest-pending read, proceed immediately; other reads block
    /// up to `read_timeout` seconds to avoid starving early-file readers.
    fn priority_wait(&self, inner: &mut parking_lot::MutexGuard<'_, Inner>, block: u64, descriptor: DescriptorId, operation: Operation) {
        if operation != Operation::Read {
            return;
        }

        let timeout = Duration::from_secs_f64(self.config.read_timeout.max(0.0));

        loop {
            inner.waiting.insert(descriptor, (block, Instant::now()));

            if inner.blocks.contains_key(&block) {
                return;
            }

            let mut min_block = block;
            for (other_block, started) in inner.waiting.values() {
                if started.elapsed() < timeout && *other_block < min_block {
                    min_block = *other_block;
                }
            }

            if block == min_block {
                return;
            }

            self.cvar.wait_for(inner, timeout);
        }
    }

    fn reset_cache_locked(&self, inner: &mut Inner) -> Result<()> {
        inner.blocks.clear();
        inner.blocks_block_pos = 0;
        inner.size = 0;
        inner.mtime = 0.0;
        inner.finalized = false;
        init_disk_overflow(&inner.cache_path)?;
        Ok(())
    }

    fn flush_block(&self, inner: &mut Inner, block_idx: u64) -> Result<()> {
        let block = match inner.blocks.get(&block_idx) {
            Some(b) => b,
            None => return Ok(()),
        };
        if !block.dirty {
            return Ok(());
        }

        let is_last = block_idx * self.config.block_size + block.data.len() as u64 == inner.size;
        set_disk_block(&inner.cache_path, block_idx, &block.data, self.config.block_size, is_last)
    }

    /// Run the three-phase (priority-wait, fetch, IO) read/write/truncate/
    /// reset loop, matching `CacheEntry.io`.
    pub fn io(
        self: &Arc<Self>,
        operation: Operation,
        pos: u64,
        data: Option<&[u8]>,
        size: u64,
        descriptor: DescriptorId,
        table: &DescriptorTable,
        history: &BlockHistory,
        internal_producer: Option<&dyn Fn(&std::path::Path) -> Result<()>>,
    ) -> Result<IoOutcome> {
        let block_size = self.config.block_size;
        let mut ret_data = vec![0u8; size as usize];
        let mut ret_size: u64 = 0;

        loop {
            if ret_size >= size {
                break;
            }

            let block = (pos + ret_size) / block_size;
            let start = (pos + ret_size) % block_size;

            let req_block;
            {
                let mut inner = self.inner.lock();
                self.priority_wait(&mut inner, block, descriptor, operation);

                if operation == Operation::Reset {
                    self.reset_cache_locked(&mut inner)?;
                    self.cvar.notify_all();
                    return Ok(IoOutcome::Written(size as usize));
                }

                req_block = match inner.blocks.get(&block) {
                    Some(b) => b.data.len() < block_size as usize,
                    None => true,
                };
                self.cvar.notify_all();
            }

            if req_block {
                history.check_expired(&self.config);
                self.req_mem_block(table, block, descriptor, operation, internal_producer)?;
            }

            {
                let mut inner = self.inner.lock();
                self.priority_wait(&mut inner, block, descriptor, operation);

                if operation == Operation::Read && inner.finalized && (pos + ret_size) >= inner.size {
                    ret_data.truncate(ret_size as usize);
                    self.cvar.notify_all();
                    return Ok(IoOutcome::Read(ret_data));
                }

                if matches!(operation, Operation::Write | Operation::Truncate) && pos > inner.size {
                    self.io_fill_locked(&mut inner, block, start);
                }

                // Reads only proceed once the block has actually arrived (from
                // disk or the producing process); otherwise this iteration
                // makes no progress and the loop re-enters Phase 1/2. Writes
                // and truncates create their target block on demand, so they
                // are never gated on prior availability.
                match operation {
                    Operation::Read => {
                        if inner.blocks.contains_key(&block) {
                            ret_size = Self::io_read_locked(&inner, block, start, size, &mut ret_data, ret_size);
                        }
                    }
                    Operation::Write => {
                        let payload = data.ok_or_else(|| Error::Invalid("write requires data".to_string()))?;
                        ret_size = self.io_write_locked(&mut inner, history, block, start, payload, true, ret_size);
                    }
                    Operation::Truncate => {
                        self.io_truncate_locked(&mut inner, block, start);
                        ret_size = size;
                    }
                    Operation::Reset => unreachable!(),
                }

                self.cvar.notify_all();
            }
        }

        match operation {
            Operation::Read => Ok(IoOutcome::Read(ret_data)),
            _ => Ok(IoOutcome::Written(ret_size as usize)),
        }
    }

    /// Fetch a block from disk overflow or the producing process into the
    /// memory cache (`CacheEntry.req_mem_block`).
    fn req_mem_block(
        self: &Arc<Self>,
        table: &DescriptorTable,
        req_block: u64,
        descriptor: DescriptorId,
        operation: Operation,
        internal_producer: Option<&dyn Fn(&std::path::Path) -> Result<()>>,
    ) -> Result<()> {
        let block_size = self.config.block_size;

        if let (Some(action), Some(source)) = (&self.identity.virt_action, &self.identity.derived_source) {
            let rule = self
                .config
                .actions
                .get(&action.key)
                .ok_or_else(|| Error::Invalid(format!("unknown action for {:?}", action.key)))?;

            let temp_path = {
                let inner = self.inner.lock();
                PathBuf::from(format!("{}.temp", inner.cache_path.display()))
            };

            self.mediator.req_init(
                rule,
                &source.paths.abs_mount,
                &self.identity.paths.abs_mount,
                &action.groups,
                &temp_path,
                internal_producer,
            )?;
        }

        let mut got_full_from_disk = false;
        {
            let mut inner = self.inner.lock();
            let need_disk = !inner.blocks.contains_key(&req_block) && req_block < inner.blocks_block_pos;
            if need_disk {
                let (disk_data, _end) = get_disk_block(&inner.cache_path, req_block, block_size)?;
                let full = disk_data.len() as u64 == block_size;
                self.io_write_locked_no_history(&mut inner, req_block, 0, &disk_data, false);
                if full {
                    got_full_from_disk = true;
                }
            }
        }
        if got_full_from_disk {
            return Ok(());
        }

        let descriptor_record = table.get(descriptor);
        let is_owner = descriptor_record
            .map(|d| self.mediator.context_owner(d.open_pid))
            .unwrap_or(false);

        if !is_owner && operation == Operation::Read {
            let read = self.mediator.read(req_block, block_size)?;

            if read.process_exited {
                let mut inner = self.inner.lock();
                inner.finalized = true;
                inner.mtime = self.identity.mtime;
            }

            if let Some(bytes) = read.data {
                if !bytes.is_empty() {
                    let mut inner = self.inner.lock();
                    self.io_write_locked_no_history(&mut inner, read.block, read.start, &bytes, true);
                }
            }
        }

        Ok(())
    }

    /// Like [`Self::io_write_locked`] but doesn't register the write in the
    /// global eviction history; used for fetches that merely repopulate the
    /// memory cache from disk or from a non-owner read rather than producing
    /// new bytes (`CacheEntry._io_write` called from `req_mem_block`, which
    /// the original never routes through `block_history` either, since that
    /// queue keys off the *producing* process's writes).
    fn io_write_locked_no_history(&self, inner: &mut Inner, block_idx: u64, block_pos: u64, new_data: &[u8], new_dirty: bool) {
        let block_size = self.config.block_size;
        let block = inner.blocks.entry(block_idx).or_insert_with(Block::new);

        let consume = (new_data.len()).min((block_size - block_pos) as usize);
        let start = block_pos as usize;

        if block.data.len() < start + consume {
            block.data.resize(start + consume, 0);
        }
        block.data[start..start + consume].copy_from_slice(&new_data[..consume]);
        block.dirty = new_dirty;

        if block_idx + 1 > inner.blocks_block_pos {
            inner.blocks_block_pos = block_idx + 1;
        }
        if block_idx + 1 == inner.blocks_block_pos {
            inner.size = block_idx * block_size + block.data.len() as u64;
        }
    }

    /// Route an owner write: first offer bytes to the mediator's stream
    /// buffer (absorbed in the order the producing process expects), then
    /// drive whatever the mediator didn't consume through the ordinary
    /// memory-cache write path (`Core.write`'s VDF branch).
    pub fn write_owner(
        self: &Arc<Self>,
        data: &[u8],
        pos: u64,
        descriptor: DescriptorId,
        open_pid: u32,
        table: &DescriptorTable,
        history: &BlockHistory,
        internal_producer: Option<&dyn Fn(&std::path::Path) -> Result<()>>,
    ) -> Result<usize> {
        // The mediator reports how many leading bytes of `data` lie before its
        // current stream position and so can't be absorbed into the stream;
        // those go straight to the memory cache at their original offset.
        let direct_size = self.mediator.write(data, pos, open_pid, self.config.block_size)?;

        if direct_size > 0 {
            self.io(
                Operation::Write,
                pos,
                Some(data),
                direct_size as u64,
                descriptor,
                table,
                history,
                internal_producer,
            )?;
        }

        Ok(data.len())
    }

    /// Route an owner truncate: try the mediator's stream buffer first, then
    /// fall back to the ordinary memory-cache truncate path (`Core.truncate`'s
    /// VDF branch).
    pub fn truncate_owner(
        self: &Arc<Self>,
        length: u64,
        descriptor: DescriptorId,
        open_pid: u32,
        table: &DescriptorTable,
        history: &BlockHistory,
        internal_producer: Option<&dyn Fn(&std::path::Path) -> Result<()>>,
    ) -> Result<()> {
        if self.mediator.truncate(length, open_pid, self.config.block_size) {
            return Ok(());
        }

        self.io(Operation::Truncate, length, None, 1, descriptor, table, history, internal_producer)?;
        Ok(())
    }

    /// Register an open descriptor, re-arming the mediator's write-open flag
    /// if this is a new owner writer (`CacheEntry.register_descriptor`).
    pub fn register_descriptor(&self, table: &DescriptorTable, descriptor: DescriptorId) {
        self.descriptors.lock().insert(descriptor);

        if let Some(entry) = table.get(descriptor) {
            if entry.is_write() && self.mediator.context_owner(entry.open_pid) {
                self.mediator.reopen_writes();
            }
        }
    }

    /// Unregister a closed descriptor, closing the producing process's read
    /// and/or write ends if no descriptor needs them anymore
    /// (`CacheEntry.unregister_descriptor`).
    pub fn unregister_descriptor(&self, table: &DescriptorTable, descriptor: DescriptorId) -> Result<()> {
        let mut descriptors = self.descriptors.lock();
        descriptors.remove(&descriptor);

        let mut any_reads = false;
        let mut any_writes = false;
        for remaining in descriptors.iter() {
            if let Some(entry) = table.get(*remaining) {
                any_reads |= entry.is_read();
                any_writes |= entry.is_write() && self.mediator.context_owner(entry.open_pid);
            }
        }
        drop(descriptors);

        {
            let mut inner = self.inner.lock();
            inner.waiting.remove(&descriptor);
        }

        self.mediator.close(!any_reads, !any_writes)?;
        self.cvar.notify_all();
        Ok(())
    }
}

/// The global write-history eviction queue, shared across every cache entry
/// (`CacheEntry.block_history`, a Python class variable).
pub struct BlockHistory {
    queue: Mutex<VecDeque<(Weak<CacheEntry>, u64)>>,
}

impl BlockHistory {
    pub fn new() -> Self {
        BlockHistory {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, entry: &Arc<CacheEntry>, block_idx: u64) {
        self.queue.lock().push_back((Arc::downgrade(entry), block_idx));
    }

    /// Number of pending write-history entries (diagnostic / test use).
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush half the history's dirty blocks to disk overflow once the
    /// queue reaches the configured memory budget (`CacheEntry.check_expired`).
    pub fn check_expired(&self, config: &Config) {
        let max_blocks = config.store_size / config.block_size;
        let mut queue = self.queue.lock();

        if (queue.len() as u64) < max_blocks {
            return;
        }

        while queue.len() as u64 > max_blocks / 2 {
            let (weak, block_idx) = match queue.pop_front() {
                Some(pair) => pair,
                None => break,
            };

            if let Some(entry) = weak.upgrade() {
                let mut inner = entry.inner.lock();
                if inner.blocks.contains_key(&block_idx) {
                    let _ = entry.flush_block(&mut inner, block_idx);
                    inner.blocks.remove(&block_idx);
                }
            }
        }
    }
}

impl Default for BlockHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::descriptor::DescriptorTable;
    use crate::identity::{Kind, OrigType, Paths};
    use std::fs;
    use std::path::PathBuf;

    fn test_config(dir: &std::path::Path) -> Arc<Config> {
        fs::write(dir.join("repeatfs.conf"), "cache_path={}\n".replace("{}", &dir.to_string_lossy())).unwrap();
        Arc::new(Config::load(dir).unwrap())
    }

    fn real_identity(path: PathBuf) -> FileIdentity {
        FileIdentity {
            paths: Paths {
                relative: path.to_string_lossy().to_string(),
                abs_real: path.clone(),
                abs_mount: path.clone(),
                abs_virt: path,
                orig_type: OrigType::Relative,
            },
            kind: Kind::Real,
            valid: true,
            is_dir: false,
            mtime: 0.0,
            init_size: 0,
            derived_source: None,
            virt_action: None,
            derived_actions: Default::default(),
        }
    }

    #[test]
    fn write_then_read_roundtrips_through_memory_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let backing = dir.path().join("plain.txt");
        fs::write(&backing, b"").unwrap();

        let entry = CacheEntry::new(real_identity(backing), config).unwrap();
        let table = DescriptorTable::new();
        let history = BlockHistory::new();
        let descriptor = table.open(entry.identity().clone(), Some(libc::O_RDWR), 1, None);

        let outcome = entry
            .io(Operation::Write, 0, Some(b"hello world"), 11, descriptor, &table, &history, None)
            .unwrap();
        assert!(matches!(outcome, IoOutcome::Written(11)));

        let outcome = entry
            .io(Operation::Read, 0, None, 11, descriptor, &table, &history, None)
            .unwrap();
        match outcome {
            IoOutcome::Read(data) => assert_eq!(data, b"hello world"),
            _ => panic!("expected read outcome"),
        }
    }

    #[test]
    fn truncate_shrinks_size_and_drops_trailing_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let backing = dir.path().join("plain.txt");
        fs::write(&backing, b"").unwrap();

        let entry = CacheEntry::new(real_identity(backing), config).unwrap();
        let table = DescriptorTable::new();
        let history = BlockHistory::new();
        let descriptor = table.open(entry.identity().clone(), Some(libc::O_RDWR), 1, None);

        entry
            .io(Operation::Write, 0, Some(b"0123456789"), 10, descriptor, &table, &history, None)
            .unwrap();
        entry.io(Operation::Truncate, 4, None, 1, descriptor, &table, &history, None).unwrap();

        assert_eq!(entry.size(), 4);
    }
}
