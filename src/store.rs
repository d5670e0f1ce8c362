//! Store Instance API
//!
//! The public handle for one open store. Every accessor is infallible from
//! the caller's side: failures are logged through the registry's handlers
//! and surface as the caller's default, `false`, `0` or an empty result.
//!
//! ## Locking
//! Each store owns a reentrant in-process mutex. Every call takes it for its
//! duration; [`Store::lock`] hands it to the caller for multi-step sequences
//! (the same thread may keep calling the API while holding it). Other
//! processes are excluded separately by the page store's file lock.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::codec::{Decode, Encode};
use crate::config::{StoreMode, SyncMode};
use crate::crypt::Crypter;
use crate::error::{MapKvError, Result};
use crate::notify::Handlers;
use crate::registry::{RegistryShared, StoreIdentity};
use crate::storage::PageStore;

type Slot = RefCell<Option<PageStore>>;

/// A live store, shared by everyone who resolved its identity
pub struct Store {
    identity: StoreIdentity,
    handlers: Arc<Handlers>,
    registry: Weak<RegistryShared>,

    /// `None` once closed
    state: ReentrantMutex<Slot>,
}

/// Holds a store's in-process lock; released on drop or [`unlock`](Self::unlock)
pub struct StoreLockGuard<'a> {
    _guard: ReentrantMutexGuard<'a, Slot>,
}

impl StoreLockGuard<'_> {
    pub fn unlock(self) {}
}

impl Store {
    pub(crate) fn new(
        page: PageStore,
        identity: StoreIdentity,
        handlers: Arc<Handlers>,
        registry: Weak<RegistryShared>,
    ) -> Self {
        Self {
            identity,
            handlers,
            registry,
            state: ReentrantMutex::new(RefCell::new(Some(page))),
        }
    }

    pub fn mmap_id(&self) -> &str {
        &self.identity.mmap_id
    }

    pub fn mode(&self) -> StoreMode {
        self.identity.mode
    }

    pub(crate) fn identity(&self) -> &StoreIdentity {
        &self.identity
    }

    // =========================================================================
    // Typed Values
    // =========================================================================

    /// Store any encodable value; false on failure or an empty key
    pub fn set<V: Encode + ?Sized>(&self, key: &str, value: &V) -> bool {
        if key.is_empty() {
            return false;
        }
        let encoded = value.encode();
        self.with_page("set", false, |page| {
            page.set(key, &encoded)?;
            Ok(true)
        })
    }

    /// Read and decode a value; `None` when absent or undecodable
    pub fn get<V: Decode>(&self, key: &str) -> Option<V> {
        if key.is_empty() {
            return None;
        }
        self.with_page("get", None, |page| match page.get(key)? {
            Some(raw) => V::decode(raw).map(Some),
            None => Ok(None),
        })
    }

    /// Read a value, falling back to `default`
    pub fn get_or<V: Decode>(&self, key: &str, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    pub fn set_bool(&self, key: &str, value: bool) -> bool {
        self.set(key, &value)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_or(key, default)
    }

    pub fn set_i64(&self, key: &str, value: i64) -> bool {
        self.set(key, &value)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get_or(key, default)
    }

    pub fn set_f64(&self, key: &str, value: f64) -> bool {
        self.set(key, &value)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get_or(key, default)
    }

    pub fn set_string(&self, key: &str, value: &str) -> bool {
        self.set(key, value)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn set_bytes(&self, key: &str, value: &[u8]) -> bool {
        self.set(key, value)
    }

    pub fn get_bytes(&self, key: &str, default: &[u8]) -> Vec<u8> {
        self.get(key).unwrap_or_else(|| default.to_vec())
    }

    pub fn set_string_list(&self, key: &str, value: &[String]) -> bool {
        self.set(key, value)
    }

    pub fn get_string_list(&self, key: &str, default: Vec<String>) -> Vec<String> {
        self.get_or(key, default)
    }

    // =========================================================================
    // Keys
    // =========================================================================

    pub fn contains_key(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        self.with_page("contains_key", false, |page| page.contains(key))
    }

    /// Stored size of a value, or its decoded payload size when `actual`.
    ///
    /// The payload size is inferred from the stored bytes (see
    /// [`logical_size`](crate::codec::logical_size)); a fixed-width number
    /// that looks like a length prefix over the rest is reported as such.
    pub fn value_size(&self, key: &str, actual: bool) -> usize {
        if key.is_empty() {
            return 0;
        }
        self.with_page("value_size", 0, |page| page.value_size(key, actual))
    }

    /// Every live key, in no particular order
    pub fn all_keys(&self) -> Vec<String> {
        self.with_page("all_keys", Vec::new(), PageStore::keys)
    }

    pub fn count(&self) -> usize {
        self.with_page("count", 0, PageStore::count)
    }

    /// Size of the backing data file in bytes
    pub fn total_size(&self) -> u64 {
        self.with_page("total_size", 0, PageStore::total_size)
    }

    /// Remove a key; removing an absent key succeeds
    pub fn remove(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        self.with_page("remove", false, |page| {
            page.remove(key)?;
            Ok(true)
        })
    }

    pub fn remove_many<K: AsRef<str>>(&self, keys: &[K]) -> bool {
        if keys.is_empty() {
            return true;
        }
        self.with_page("remove_many", false, |page| {
            page.remove_many(keys)?;
            Ok(true)
        })
    }

    pub fn clear_all(&self) -> bool {
        self.with_page("clear_all", false, |page| {
            page.clear_all()?;
            Ok(true)
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Compact and release unused file space
    pub fn trim(&self) -> bool {
        self.with_page("trim", false, |page| {
            page.trim()?;
            Ok(true)
        })
    }

    pub fn sync(&self, mode: SyncMode) -> bool {
        self.with_page("sync", false, |page| {
            page.sync(mode)?;
            Ok(true)
        })
    }

    /// Drop decoded values and the mapping; persisted data is untouched
    pub fn clear_memory_cache(&self) {
        self.with_page("clear_memory_cache", (), |page| {
            page.clear_memory_cache();
            Ok(())
        })
    }

    /// Release the mapping and files and leave the registry. Later calls on
    /// this handle return defaults.
    pub fn close(&self) {
        let page = {
            let guard = self.state.lock();
            let taken = match guard.try_borrow_mut() {
                Ok(mut slot) => slot.take(),
                Err(_) => {
                    kv_log!(
                        self.handlers,
                        Error,
                        "close of '{}' re-entered from a callback",
                        self.identity.mmap_id
                    );
                    return;
                }
            };
            taken
        };

        let Some(page) = page else {
            return;
        };
        if let Err(e) = page.close() {
            kv_log!(
                self.handlers,
                Warning,
                "closing '{}' failed: {}",
                self.identity.mmap_id,
                e
            );
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.forget(self);
        }
    }

    pub fn is_closed(&self) -> bool {
        let guard = self.state.lock();
        let closed = match guard.try_borrow() {
            Ok(slot) => slot.is_none(),
            Err(_) => false,
        };
        closed
    }

    // =========================================================================
    // Integrity / Crypt
    // =========================================================================

    /// Whether this handle's mode agrees with how the files are held by
    /// other handles and processes
    pub fn check_process_mode(&self) -> bool {
        self.with_page("check_process_mode", false, |page| {
            Ok(page.check_process_mode())
        })
    }

    pub fn crypt_key(&self) -> Option<String> {
        self.with_page("crypt_key", None, |page| {
            Ok(page.crypt_key().map(str::to_string))
        })
    }

    /// Re-encrypt everything under `new_key` (empty = plaintext),
    /// all-or-nothing
    pub fn re_key(&self, new_key: &str) -> bool {
        let crypter = Crypter::new(new_key);
        self.with_page("re_key", false, |page| {
            page.re_key(crypter)?;
            Ok(true)
        })
    }

    /// Adopt `key` as the key the files are already encrypted with and
    /// reload; nothing is re-encrypted
    pub fn check_reset_crypt_key(&self, key: Option<&str>) {
        let crypter = key.and_then(Crypter::new);
        self.with_page("check_reset_crypt_key", (), |page| {
            page.reset_crypter(crypter)
        })
    }

    /// Reconcile with changes made by other processes now. Fires the
    /// content-change listener when something changed.
    pub fn check_content_changed(&self) -> bool {
        self.with_page("check_content_changed", false, PageStore::check_content_changed)
    }

    /// Data file descriptor of a descriptor-backed store
    #[cfg(unix)]
    pub fn ashmem_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.with_page("ashmem_fd", None, |page| {
            Ok(page.is_fd_backed().then(|| page.data_fd()))
        })
    }

    /// Meta file descriptor of a descriptor-backed store
    #[cfg(unix)]
    pub fn ashmem_meta_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.with_page("ashmem_meta_fd", None, |page| {
            Ok(page.is_fd_backed().then(|| page.meta_fd()))
        })
    }

    // =========================================================================
    // In-Process Lock
    // =========================================================================

    /// Block until this thread holds the store's lock
    pub fn lock(&self) -> StoreLockGuard<'_> {
        StoreLockGuard {
            _guard: self.state.lock(),
        }
    }

    /// Take the store's lock if nobody else holds it
    pub fn try_lock(&self) -> Option<StoreLockGuard<'_>> {
        self.state
            .try_lock()
            .map(|guard| StoreLockGuard { _guard: guard })
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Run `f` on the open page store under the instance lock, mapping
    /// errors and a closed store to `default`
    fn with_page<T>(
        &self,
        op: &str,
        default: T,
        f: impl FnOnce(&mut PageStore) -> Result<T>,
    ) -> T {
        let guard = self.state.lock();

        let (result, changed) = {
            let mut slot = match guard.try_borrow_mut() {
                Ok(slot) => slot,
                Err(_) => {
                    kv_log!(
                        self.handlers,
                        Error,
                        "{} on '{}' re-entered from a callback",
                        op,
                        self.identity.mmap_id
                    );
                    return default;
                }
            };
            let page = match slot.as_mut() {
                Some(page) => page,
                None => {
                    kv_log!(
                        self.handlers,
                        Debug,
                        "{} on closed store '{}'",
                        op,
                        self.identity.mmap_id
                    );
                    return default;
                }
            };
            let result = f(page);
            (result, page.take_content_changed())
        };

        // Borrow released; the listener may call back into this store
        if changed {
            self.handlers.notify_content_changed(&self.identity.mmap_id);
        }

        match result {
            Ok(value) => value,
            Err(MapKvError::InvalidKey) => default,
            Err(e) => {
                kv_log!(
                    self.handlers,
                    Error,
                    "{} on '{}' failed: {}",
                    op,
                    self.identity.mmap_id,
                    e
                );
                default
            }
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("mmap_id", &self.identity.mmap_id)
            .field("mode", &self.identity.mode)
            .field("backing", &self.identity.backing)
            .finish()
    }
}
