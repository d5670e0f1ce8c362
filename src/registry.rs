//! Store Registry
//!
//! Owns the table of live stores and the hook table they share. Resolving an
//! identity that is already open returns the same [`Store`]; otherwise the
//! store is opened and registered while the table lock is held, so two
//! concurrent resolutions never open the same files twice.
//!
//! The table lock is reentrant: hooks fired while a store opens run on the
//! resolving thread and may call back into the registry. Resolving the
//! identity that is currently being opened from such a hook is an error.
//!
//! Crypt configuration follows the first resolution: resolving an open
//! identity with a different key returns the existing store unchanged.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::config::{normalize_page_size, Config, LogLevel, StoreMode, SyncMode};
use crate::crypt::Crypter;
use crate::error::{MapKvError, Result};
use crate::notify::{ContentChangeListener, ErrorReporter, Handlers, LogHandler};
use crate::storage::{OpenOptions, PageStore, StorePaths};
use crate::store::Store;

/// Where a store's bytes live
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Backing {
    /// Named files under a (canonicalized) root directory
    Dir(PathBuf),

    /// Caller-supplied descriptors
    Fd,
}

/// Identifies one on-disk file set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreIdentity {
    pub mmap_id: String,
    pub mode: StoreMode,
    pub backing: Backing,
}

#[derive(Default)]
struct Table {
    live: HashMap<StoreIdentity, Arc<Store>>,
    /// Identities whose files are being opened on the lock-holding thread
    opening: HashSet<StoreIdentity>,
}

/// State shared between a registry and the stores it opened
pub(crate) struct RegistryShared {
    config: Config,
    handlers: Arc<Handlers>,
    /// Borrows never span a call into storage or a hook
    table: ReentrantMutex<RefCell<Table>>,
}

impl RegistryShared {
    /// Drop `store` from the table if it is still the registered instance
    pub(crate) fn forget(&self, store: &Store) {
        let guard = self.table.lock();
        let mut table = guard.borrow_mut();
        let registered = table
            .live
            .get(store.identity())
            .is_some_and(|live| std::ptr::eq(Arc::as_ptr(live), store));
        if registered {
            table.live.remove(store.identity());
        }
    }
}

/// Process-level entry point: configuration, hooks and live stores
pub struct Registry {
    shared: Arc<RegistryShared>,
}

impl Registry {
    /// `config.page_size` is rounded the same way the builder rounds it
    pub fn new(mut config: Config) -> Self {
        config.page_size = normalize_page_size(config.page_size);
        let handlers = Arc::new(Handlers::new(config.log_level));
        kv_log!(
            handlers,
            Info,
            "registry initialized (root {}, page size {})",
            config.root_dir.display(),
            config.page_size
        );

        Self {
            shared: Arc::new(RegistryShared {
                config,
                handlers,
                table: ReentrantMutex::new(RefCell::new(Table::default())),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn page_size(&self) -> usize {
        self.shared.config.page_size
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Return the live store for `(mmap_id, mode, root)`, opening it on first
    /// use. `root` defaults to the configured root directory; an empty
    /// `crypt_key` means plaintext.
    pub fn resolve(
        &self,
        mmap_id: &str,
        mode: StoreMode,
        crypt_key: Option<&str>,
        root: Option<&Path>,
    ) -> Result<Arc<Store>> {
        if mmap_id.is_empty() {
            return Err(MapKvError::InvalidKey);
        }

        let root = self.canonical_root(root)?;
        let identity = StoreIdentity {
            mmap_id: mmap_id.to_string(),
            mode,
            backing: Backing::Dir(root.clone()),
        };

        let opts = self.open_options(mmap_id, mode, crypt_key);
        self.open_once(identity, || PageStore::open_in_dir(&root, opts))
    }

    /// The configured default store
    pub fn default_store(&self, mode: StoreMode, crypt_key: Option<&str>) -> Result<Arc<Store>> {
        let id = self.shared.config.default_mmap_id.clone();
        self.resolve(&id, mode, crypt_key, None)
    }

    /// Open a store over caller-supplied data and meta descriptors. Always
    /// multi-process.
    pub fn resolve_with_fd(
        &self,
        mmap_id: &str,
        data: File,
        meta: File,
        crypt_key: Option<&str>,
    ) -> Result<Arc<Store>> {
        if mmap_id.is_empty() {
            return Err(MapKvError::InvalidKey);
        }

        let identity = StoreIdentity {
            mmap_id: mmap_id.to_string(),
            mode: StoreMode::MultiProcess,
            backing: Backing::Fd,
        };

        let opts = self.open_options(mmap_id, StoreMode::MultiProcess, crypt_key);
        self.open_once(identity, || PageStore::open_with_files(data, meta, opts))
    }

    /// Check a store's files without opening it. Missing files are valid.
    pub fn is_file_valid(&self, mmap_id: &str, root: Option<&Path>) -> bool {
        if mmap_id.is_empty() {
            return false;
        }
        let root = root.unwrap_or(&self.shared.config.root_dir);
        match PageStore::is_file_valid(&StorePaths::new(root, mmap_id)) {
            Ok(valid) => valid,
            Err(e) => {
                kv_log!(
                    self.shared.handlers,
                    Warning,
                    "validating '{}' failed: {}",
                    mmap_id,
                    e
                );
                false
            }
        }
    }

    /// Number of live stores
    pub fn live_count(&self) -> usize {
        self.shared.table.lock().borrow().live.len()
    }

    /// Sync and close every live store and empty the table
    pub fn shutdown(&self) {
        // Drain first: Store::close takes the table lock itself
        let stores: Vec<Arc<Store>> = {
            let guard = self.shared.table.lock();
            let mut table = guard.borrow_mut();
            table.live.drain().map(|(_, store)| store).collect()
        };
        if stores.is_empty() {
            return;
        }

        kv_log!(
            self.shared.handlers,
            Info,
            "shutting down {} store(s)",
            stores.len()
        );
        for store in stores {
            store.sync(SyncMode::Sync);
            store.close();
        }
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    pub fn register_error_reporter(&self, reporter: impl ErrorReporter + 'static) {
        self.shared
            .handlers
            .set_error_reporter(Some(Arc::new(reporter)));
    }

    pub fn unregister_error_reporter(&self) {
        self.shared.handlers.set_error_reporter(None);
    }

    pub fn register_content_change_listener(&self, listener: impl ContentChangeListener + 'static) {
        self.shared
            .handlers
            .set_content_listener(Some(Arc::new(listener)));
    }

    pub fn unregister_content_change_listener(&self) {
        self.shared.handlers.set_content_listener(None);
    }

    /// Redirect engine log lines to `handler` instead of `tracing`
    pub fn register_log_handler(&self, handler: impl LogHandler + 'static) {
        self.shared.handlers.set_log_handler(Some(Arc::new(handler)));
    }

    pub fn unregister_log_handler(&self) {
        self.shared.handlers.set_log_handler(None);
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.shared.handlers.set_log_level(level);
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn canonical_root(&self, root: Option<&Path>) -> Result<PathBuf> {
        let root = root.unwrap_or(&self.shared.config.root_dir);
        fs::create_dir_all(root)?;
        Ok(fs::canonicalize(root)?)
    }

    fn open_options(&self, mmap_id: &str, mode: StoreMode, crypt_key: Option<&str>) -> OpenOptions {
        OpenOptions {
            mmap_id: mmap_id.to_string(),
            mode,
            page_size: self.shared.config.page_size,
            crypter: crypt_key.and_then(Crypter::new),
            handlers: Arc::clone(&self.shared.handlers),
        }
    }

    /// Look `identity` up or open it with `open`, holding the table lock
    /// throughout. Hooks fired by `open` may re-enter the registry.
    fn open_once(
        &self,
        identity: StoreIdentity,
        open: impl FnOnce() -> Result<PageStore>,
    ) -> Result<Arc<Store>> {
        let guard = self.shared.table.lock();
        {
            let mut table = guard.borrow_mut();
            if let Some(store) = table.live.get(&identity) {
                return Ok(Arc::clone(store));
            }
            if !table.opening.insert(identity.clone()) {
                return Err(MapKvError::Storage(format!(
                    "'{}' resolved from a hook while it is being opened",
                    identity.mmap_id
                )));
            }
        }

        let opened = open();
        guard.borrow_mut().opening.remove(&identity);
        let page = opened?;

        let store = Arc::new(Store::new(
            page,
            identity.clone(),
            Arc::clone(&self.shared.handlers),
            Arc::downgrade(&self.shared),
        ));
        guard
            .borrow_mut()
            .live
            .insert(identity.clone(), Arc::clone(&store));

        match &identity.backing {
            Backing::Dir(root) => kv_log!(
                self.shared.handlers,
                Info,
                "opened '{}' ({:?}) in {}",
                identity.mmap_id,
                identity.mode,
                root.display()
            ),
            Backing::Fd => kv_log!(
                self.shared.handlers,
                Info,
                "opened '{}' over descriptors",
                identity.mmap_id
            ),
        }
        Ok(store)
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.shared.config)
            .field("live", &self.live_count())
            .finish()
    }
}
