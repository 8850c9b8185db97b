//! Virtual derived file overlay with process-level provenance capture and
//! replay.

pub mod cache;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod error;
pub mod fs;
pub mod identity;
pub mod mediator;
pub mod provenance;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use cache::{BlockHistory, CacheEntry};
use config::Config;
use control::ControlSessions;
use descriptor::DescriptorTable;
use error::Result;
use identity::Resolver;
use provenance::{LinuxProcfs, Store};

/// Everything the `Filesystem` glue and the control endpoint share: the
/// resolved root/mount pair, the loaded configuration, and the three
/// subsystems (descriptor table, cache entries, provenance store) that would
/// otherwise be process-wide singletons (`Core.__init__`).
pub struct Service {
    /// Real backing directory this overlay is derived from.
    pub root: PathBuf,
    /// Where the overlay is (or will be) mounted.
    pub mount: PathBuf,
    /// Parsed `repeatfs.conf`.
    pub config: Arc<Config>,
    /// Path resolver bound to this root/mount/config triple.
    pub resolver: Resolver,
    /// Process-wide open-handle registry.
    pub descriptors: DescriptorTable,
    /// Global write-history eviction queue shared by every cache entry.
    pub history: BlockHistory,
    /// Embedded provenance store.
    pub store: Store,
    /// Control endpoint session registry.
    pub control: ControlSessions,
    entries: Mutex<HashMap<PathBuf, Arc<CacheEntry>>>,
}

impl Service {
    /// Build a service rooted at `root`, destined to be mounted at `mount`,
    /// configured from `config_dir/repeatfs.conf` (`Core.__init__` +
    /// `Management.__init__`).
    pub fn new(root: PathBuf, mount: PathBuf, config_dir: &Path) -> Result<Arc<Self>> {
        let config = Arc::new(Config::load(config_dir)?);
        config.ensure_cache_dir()?;

        let resolver = Resolver::new(root.clone(), mount.clone(), Arc::clone(&config));
        let store = Store::open(config_dir, &root, &mount, Arc::new(LinuxProcfs))?;

        Ok(Arc::new(Service {
            root,
            mount,
            config,
            resolver,
            descriptors: DescriptorTable::new(),
            history: BlockHistory::new(),
            store,
            control: ControlSessions::new(),
            entries: Mutex::new(HashMap::new()),
        }))
    }

    /// Fetch or lazily create the cache entry for a resolved VDF identity,
    /// keyed by its own virtual path (`Core._get_cache_entry`).
    pub fn cache_entry(&self, identity: &identity::FileIdentity) -> Result<Arc<CacheEntry>> {
        let key = identity.paths.abs_virt.clone();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            return Ok(Arc::clone(existing));
        }

        let entry = CacheEntry::new(identity.clone(), Arc::clone(&self.config))?;
        entries.insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    /// Drop a cache entry once every descriptor pointing at it has closed, so
    /// the next open re-derives it from scratch (`Core.unregister_descriptor`'s
    /// entry-eviction branch).
    pub fn forget_cache_entry(&self, identity: &identity::FileIdentity) {
        self.entries.lock().remove(&identity.paths.abs_virt);
    }

    /// The `internal=<name>` dispatch table consulted by [`CacheEntry::io`]'s
    /// `req_mem_block` before the configured command runs. Only
    /// `provenance_json` is registered today, rendering a VDF's causal
    /// provenance graph as JSON. Borrows `self` for the duration of the
    /// returned closure, since it ends up calling back into the store.
    pub fn internal_producer<'a>(
        &'a self,
        identity: &identity::FileIdentity,
    ) -> Option<Box<dyn Fn(&Path) -> Result<()> + 'a>> {
        let names = identity.virt_action.as_ref().and_then(|action| {
            self.config.actions.get(&action.key).map(|rule| rule.internal.clone())
        })?;
        if !names.iter().any(|n| n == "provenance_json") {
            return None;
        }

        let source = identity.derived_source.clone()?;
        let store_path = source.paths.abs_real.clone();
        let io_epsilon = self.config.io_epsilon;

        Some(Box::new(move |temp_path: &Path| -> Result<()> {
            self.render_provenance_json(&store_path, io_epsilon, temp_path)
        }))
    }

    fn render_provenance_json(&self, source_path: &Path, io_epsilon: f64, temp_path: &Path) -> Result<()> {
        let target = self.store.file_key(source_path)?;
        let graph = provenance::graph::build_graph(&self.store, &target, io_epsilon, provenance::OpKind::all())?;
        let bytes = serde_json::to_vec_pretty(&graph)?;
        std::fs::write(temp_path, bytes)?;
        Ok(())
    }
}
