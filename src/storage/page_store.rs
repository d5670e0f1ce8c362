//! Page Store
//!
//! One store's durable state: a mapped data file of appended records, its
//! meta file, and the in-memory dictionary decoded from them.
//!
//! ## Write Path
//! - Small writes append a record in place (encrypted at its content offset)
//!   and extend the CRC incrementally.
//! - When a record does not fit, the live dictionary is written back in full
//!   (compaction). If that still does not fit, the file doubles until it does.
//! - Full write-backs go through a staging file when the store is path-backed,
//!   so they are all-or-nothing across crashes.
//!
//! ## Multi-Process Mode
//! Every operation holds the advisory lock (shared for reads, exclusive for
//! writes) and first reconciles with the meta file: an appended tail is
//! decoded incrementally, anything else triggers a full reload.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{encode_record, encode_removal, logical_size, RecordIter};
use crate::config::{normalize_page_size, StoreMode, SyncMode};
use crate::crypt::{transform, Crypter};
use crate::error::{MapKvError, Result};
use crate::notify::{ErrorType, Handlers, RecoverStrategy};

use super::lock::{try_hold, FileLock, FileLockGuard};
use super::meta::read_meta;
use super::{
    round_to_pages, MappedFile, MetaFile, MetaInfo, StagedWrite, StorePaths, HEADER_SIZE,
    META_VERSION,
};

/// Parameters for opening a page store
#[derive(Clone)]
pub struct OpenOptions {
    pub mmap_id: String,
    pub mode: StoreMode,
    pub page_size: usize,
    pub crypter: Option<Crypter>,
    pub handlers: Arc<Handlers>,
}

/// Outcome of checking content against meta
enum Validation {
    Accepted { size: usize, crc: u32 },
    Failed(ErrorType),
}

/// Durable record storage for one store
pub struct PageStore {
    mmap_id: String,
    mode: StoreMode,
    page_size: usize,
    handlers: Arc<Handlers>,
    crypter: Option<Crypter>,

    data: MappedFile,
    meta_file: MetaFile,

    /// Inter-process lock; present in multi-process mode
    ipc: Option<FileLock>,

    /// Staging file for full write-backs; absent for descriptor-backed stores
    stage_path: Option<PathBuf>,

    /// Whether the process-mode lock on the data file is held
    mode_held: bool,
    fd_backed: bool,

    /// Meta as of our last load or write
    meta: MetaInfo,
    dict: HashMap<String, Vec<u8>>,
    loaded: bool,

    /// Set when reconciling picked up another process's writes
    content_changed: bool,
}

impl PageStore {
    // =========================================================================
    // Open / Close
    // =========================================================================

    /// Open or create the store's files under `root` and load them
    pub fn open_in_dir(root: &Path, mut opts: OpenOptions) -> Result<Self> {
        opts.page_size = normalize_page_size(opts.page_size);
        fs::create_dir_all(root)?;
        let paths = StorePaths::new(root, &opts.mmap_id);

        let ipc = match opts.mode {
            StoreMode::MultiProcess => Some(FileLock::open(&paths.lock)?),
            StoreMode::SingleProcess => None,
        };
        let _guard = ipc.as_ref().map(FileLock::exclusive).transpose()?;

        let data = MappedFile::open(&paths.data, opts.page_size)?;
        let mode_held = try_hold(data.file(), opts.mode == StoreMode::MultiProcess)?;
        if !mode_held {
            kv_log!(
                opts.handlers,
                Warning,
                "'{}' is already open in a conflicting process mode",
                opts.mmap_id
            );
        }
        let meta_file = MetaFile::open(&paths.meta)?;

        let mut store = Self::assemble(opts, data, meta_file, ipc, Some(paths.stage), mode_held);
        store.load()?;
        Ok(store)
    }

    /// Open over already-open descriptors (shared-memory style backing).
    ///
    /// Always multi-process; the meta descriptor doubles as the lock.
    pub fn open_with_files(data: File, meta: File, mut opts: OpenOptions) -> Result<Self> {
        opts.mode = StoreMode::MultiProcess;
        opts.page_size = normalize_page_size(opts.page_size);

        let ipc = Some(FileLock::from_file(meta.try_clone()?));
        let _guard = ipc.as_ref().map(FileLock::exclusive).transpose()?;

        let data = MappedFile::from_file(data, opts.page_size)?;
        let meta_file = MetaFile::from_file(meta);

        let mut store = Self::assemble(opts, data, meta_file, ipc, None, true);
        store.fd_backed = true;
        store.load()?;
        Ok(store)
    }

    fn assemble(
        opts: OpenOptions,
        data: MappedFile,
        meta_file: MetaFile,
        ipc: Option<FileLock>,
        stage_path: Option<PathBuf>,
        mode_held: bool,
    ) -> Self {
        Self {
            mmap_id: opts.mmap_id,
            mode: opts.mode,
            page_size: opts.page_size,
            handlers: opts.handlers,
            crypter: opts.crypter,
            data,
            meta_file,
            ipc,
            stage_path,
            mode_held,
            fd_backed: false,
            meta: MetaInfo::default(),
            dict: HashMap::new(),
            loaded: false,
            content_changed: false,
        }
    }

    /// Flush asynchronously and release the mapping, descriptors and locks
    pub fn close(self) -> Result<()> {
        if self.loaded {
            self.data.flush(SyncMode::Async)?;
        }
        kv_log!(self.handlers, Info, "closed '{}'", self.mmap_id);
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get(&mut self, key: &str) -> Result<Option<&[u8]>> {
        let _ipc = self.prepare_read()?;
        Ok(self.dict.get(key).map(Vec::as_slice))
    }

    pub fn contains(&mut self, key: &str) -> Result<bool> {
        let _ipc = self.prepare_read()?;
        Ok(self.dict.contains_key(key))
    }

    pub fn keys(&mut self) -> Result<Vec<String>> {
        let _ipc = self.prepare_read()?;
        Ok(self.dict.keys().cloned().collect())
    }

    pub fn count(&mut self) -> Result<usize> {
        let _ipc = self.prepare_read()?;
        Ok(self.dict.len())
    }

    /// Size of the data file in bytes
    pub fn total_size(&mut self) -> Result<u64> {
        let _ipc = self.prepare_read()?;
        Ok(self.data.len() as u64)
    }

    /// Stored size of a value (`actual == false`) or its payload size
    pub fn value_size(&mut self, key: &str, actual: bool) -> Result<usize> {
        let _ipc = self.prepare_read()?;
        Ok(match self.dict.get(key) {
            Some(raw) if actual => logical_size(raw),
            Some(raw) => raw.len(),
            None => 0,
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(MapKvError::InvalidKey);
        }
        if value.is_empty() {
            return Err(MapKvError::Storage("empty values are reserved for removals".to_string()));
        }
        let _ipc = self.prepare_write()?;

        let record = encode_record(key, value);
        if self.fits(record.len()) {
            self.append(record.to_vec())?;
            self.dict.insert(key.to_string(), value.to_vec());
            return Ok(());
        }

        let previous = self.dict.insert(key.to_string(), value.to_vec());
        let crypter = self.crypter.clone();
        if let Err(e) = self.full_writeback(crypter, true) {
            match previous {
                Some(v) => self.dict.insert(key.to_string(), v),
                None => self.dict.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove one key; an absent key is a no-op
    pub fn remove(&mut self, key: &str) -> Result<()> {
        let _ipc = self.prepare_write()?;
        if !self.dict.contains_key(key) {
            return Ok(());
        }

        let record = encode_removal(key);
        if self.fits(record.len()) {
            self.append(record.to_vec())?;
            self.dict.remove(key);
            return Ok(());
        }

        let previous = self.dict.remove(key);
        let crypter = self.crypter.clone();
        if let Err(e) = self.full_writeback(crypter, false) {
            if let Some(v) = previous {
                self.dict.insert(key.to_string(), v);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove several keys with a single write-back
    pub fn remove_many<K: AsRef<str>>(&mut self, keys: &[K]) -> Result<()> {
        let _ipc = self.prepare_write()?;

        let mut removed = Vec::new();
        for key in keys {
            let key = key.as_ref();
            if let Some(v) = self.dict.remove(key) {
                removed.push((key.to_string(), v));
            }
        }
        if removed.is_empty() {
            return Ok(());
        }

        let crypter = self.crypter.clone();
        if let Err(e) = self.full_writeback(crypter, false) {
            self.dict.extend(removed);
            return Err(e);
        }
        Ok(())
    }

    /// Drop every record and shrink the file to one page
    pub fn clear_all(&mut self) -> Result<()> {
        let _ipc = self.prepare_write()?;
        self.reset_content()?;
        kv_log!(self.handlers, Info, "cleared '{}'", self.mmap_id);
        Ok(())
    }

    /// Compact and give back unused pages
    pub fn trim(&mut self) -> Result<()> {
        let _ipc = self.prepare_write()?;

        if self.dict.is_empty() {
            if self.data.len() > self.page_size {
                self.reset_content()?;
            }
            return Ok(());
        }

        let crypter = self.crypter.clone();
        self.full_writeback(crypter, false)?;

        let before = self.data.len();
        let target = round_to_pages(HEADER_SIZE + self.meta.actual_size as usize, self.page_size);
        if target < before {
            self.data.resize(target)?;
            kv_log!(
                self.handlers,
                Info,
                "trimmed '{}' from {} to {} bytes",
                self.mmap_id,
                before,
                target
            );
        }
        Ok(())
    }

    pub fn sync(&mut self, mode: SyncMode) -> Result<()> {
        if !self.loaded {
            return Ok(());
        }
        self.data.flush(mode)?;
        if mode == SyncMode::Sync {
            self.meta_file.sync()?;
        }
        Ok(())
    }

    /// Forget decoded values and the mapping; the next access reloads
    pub fn clear_memory_cache(&mut self) {
        if !self.loaded {
            return;
        }
        self.dict = HashMap::new();
        self.data.unmap();
        self.loaded = false;
        kv_log!(self.handlers, Info, "cleared memory cache of '{}'", self.mmap_id);
    }

    // =========================================================================
    // Crypt
    // =========================================================================

    pub fn crypt_key(&self) -> Option<&str> {
        self.crypter.as_ref().map(Crypter::key)
    }

    /// Re-encrypt all content under `new` (plaintext when `None`)
    pub fn re_key(&mut self, new: Option<Crypter>) -> Result<()> {
        let _ipc = self.prepare_write()?;
        if same_key(self.crypter.as_ref(), new.as_ref()) {
            return Ok(());
        }

        self.full_writeback(new, false)?;
        kv_log!(
            self.handlers,
            Info,
            "re-keyed '{}' (encrypted: {})",
            self.mmap_id,
            self.crypter.is_some()
        );
        Ok(())
    }

    /// Adopt `new` as the key the content is already encrypted with and
    /// reload. Nothing is re-encrypted.
    pub fn reset_crypter(&mut self, new: Option<Crypter>) -> Result<()> {
        if same_key(self.crypter.as_ref(), new.as_ref()) {
            return Ok(());
        }

        let _ipc = self.ipc.as_ref().map(FileLock::shared).transpose()?;
        self.crypter = new;
        self.dict.clear();
        self.loaded = false;
        self.load()
    }

    // =========================================================================
    // Process Coordination
    // =========================================================================

    /// Whether this handle holds the process-mode lock matching its mode.
    /// Retries the lock if it was not obtained at open.
    pub fn check_process_mode(&mut self) -> bool {
        if self.fd_backed || self.mode_held {
            return true;
        }
        self.mode_held = try_hold(self.data.file(), self.mode == StoreMode::MultiProcess)
            .unwrap_or(false);
        self.mode_held
    }

    /// Reconcile with the files now; returns whether another process had
    /// changed them
    pub fn check_content_changed(&mut self) -> Result<bool> {
        let _ipc = self.ipc.as_ref().map(FileLock::shared).transpose()?;
        if !self.loaded {
            self.load()?;
            return Ok(false);
        }
        self.reconcile()?;
        Ok(self.content_changed)
    }

    /// Take (and reset) the content-changed flag
    pub fn take_content_changed(&mut self) -> bool {
        std::mem::take(&mut self.content_changed)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn mmap_id(&self) -> &str {
        &self.mmap_id
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_fd_backed(&self) -> bool {
        self.fd_backed
    }

    /// Sequence of the current content generation
    pub fn sequence(&self) -> u32 {
        self.meta.sequence
    }

    /// Bytes of content currently in use
    pub fn actual_size(&self) -> u64 {
        self.meta.actual_size
    }

    #[cfg(unix)]
    pub fn data_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.data.file().as_raw_fd()
    }

    #[cfg(unix)]
    pub fn meta_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.meta_file.file().as_raw_fd()
    }

    /// Check a store's files without opening it. Missing files are valid.
    pub fn is_file_valid(paths: &StorePaths) -> Result<bool> {
        if !paths.data.exists() {
            return Ok(true);
        }

        let data = fs::read(&paths.data)?;
        if data.len() < HEADER_SIZE {
            return Ok(data.is_empty());
        }
        let header = read_u32(&data[..HEADER_SIZE]) as usize;

        let meta = if paths.meta.exists() {
            read_meta(&File::open(&paths.meta)?)?
        } else {
            MetaInfo::default()
        };
        if !meta.is_initialized() {
            return Ok(header == 0);
        }

        Ok(matches!(
            validate_content(&data[HEADER_SIZE..], &meta, header),
            Validation::Accepted { .. }
        ))
    }

    // =========================================================================
    // Loading
    // =========================================================================

    fn prepare_read(&mut self) -> Result<Option<FileLockGuard>> {
        let guard = self.ipc.as_ref().map(FileLock::shared).transpose()?;
        self.catch_up()?;
        Ok(guard)
    }

    fn prepare_write(&mut self) -> Result<Option<FileLockGuard>> {
        let guard = self.ipc.as_ref().map(FileLock::exclusive).transpose()?;
        self.catch_up()?;
        Ok(guard)
    }

    fn catch_up(&mut self) -> Result<()> {
        if !self.loaded {
            return self.load();
        }
        if self.mode != StoreMode::MultiProcess {
            return Ok(());
        }
        // A stage visible under the ipc lock belongs to a writer that died
        // mid-commit; apply it before anything is appended on top
        if self.stage_pending() {
            self.content_changed = true;
            return self.load();
        }
        self.reconcile()
    }

    /// Called with the ipc lock held; may need to write, so it upgrades
    /// before any repair.
    fn upgrade_ipc(&self) -> Result<()> {
        if let Some(lock) = &self.ipc {
            lock.upgrade()?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        self.dict.clear();
        self.loaded = false;

        self.roll_forward_staging()?;

        self.data.map()?;
        self.data.remap_if_resized()?;
        let meta = self.meta_file.read()?;
        let header = self.read_header()?;

        if !meta.is_initialized() && header == 0 {
            self.upgrade_ipc()?;
            let fresh = MetaInfo::fresh(0, Crypter::random_iv());
            self.meta_file.write(&fresh)?;
            self.meta = fresh;
            self.loaded = true;
            kv_log!(self.handlers, Debug, "created '{}'", self.mmap_id);
            return Ok(());
        }

        let validation = if meta.is_initialized() {
            let bytes = self.data.bytes()?;
            validate_content(&bytes[HEADER_SIZE..], &meta, header)
        } else {
            // Content without meta cannot be trusted
            Validation::Failed(ErrorType::CrcCheckFail)
        };

        match validation {
            Validation::Accepted { size, crc } => {
                let accepted = MetaInfo {
                    actual_size: size as u64,
                    crc_digest: crc,
                    ..meta
                };
                if accepted != meta || size != header {
                    self.upgrade_ipc()?;
                    kv_log!(
                        self.handlers,
                        Warning,
                        "'{}': rolled back a torn write (header {}, meta {}, using {})",
                        self.mmap_id,
                        header,
                        meta.actual_size,
                        size
                    );
                    self.meta_file.write(&accepted)?;
                    self.write_header(size)?;
                }
                self.meta = accepted;
                self.decode_content()?;
            }
            Validation::Failed(kind) => {
                kv_log!(
                    self.handlers,
                    Error,
                    "'{}': integrity check failed ({:?}), header size {}, file size {}",
                    self.mmap_id,
                    kind,
                    header,
                    self.data.len()
                );
                let strategy = self.handlers.report_error(&self.mmap_id, kind);
                self.upgrade_ipc()?;
                self.meta = MetaInfo {
                    version: META_VERSION,
                    ..meta
                };
                match strategy {
                    RecoverStrategy::Discard => self.reset_content()?,
                    RecoverStrategy::Recover => self.recover(header)?,
                }
            }
        }

        self.loaded = true;
        Ok(())
    }

    fn stage_pending(&self) -> bool {
        self.stage_path.as_ref().is_some_and(|path| path.exists())
    }

    fn roll_forward_staging(&mut self) -> Result<()> {
        let stage = match &self.stage_path {
            Some(path) => path.clone(),
            None => return Ok(()),
        };

        match StagedWrite::load(&stage) {
            Ok(None) => Ok(()),
            Ok(Some(staged)) => {
                self.upgrade_ipc()?;
                let disk = self.meta_file.read()?;
                // Staged from the current generation, or its meta already landed
                let current = !disk.is_initialized()
                    || staged.meta.sequence == disk.sequence.wrapping_add(1)
                    || staged.meta.sequence == disk.sequence;
                if !current {
                    kv_log!(
                        self.handlers,
                        Warning,
                        "'{}': dropping stale staging file (sequence {}, file at {})",
                        self.mmap_id,
                        staged.meta.sequence,
                        disk.sequence
                    );
                    return StagedWrite::discard(&stage);
                }

                kv_log!(
                    self.handlers,
                    Warning,
                    "'{}': completing an interrupted write-back",
                    self.mmap_id
                );
                self.data.map()?;
                self.data.remap_if_resized()?;
                let header = self.read_header()?;
                self.meta = MetaInfo {
                    actual_size: disk.actual_size.max(header as u64),
                    ..disk
                };
                self.apply_generation(&staged.meta, &staged.content, false)?;
                self.data.flush(SyncMode::Sync)?;
                self.meta_file.sync()?;
                StagedWrite::discard(&stage)
            }
            Err(e) => {
                self.upgrade_ipc()?;
                kv_log!(
                    self.handlers,
                    Warning,
                    "'{}': dropping incomplete staging file: {}",
                    self.mmap_id,
                    e
                );
                StagedWrite::discard(&stage)
            }
        }
    }

    fn decode_content(&mut self) -> Result<()> {
        let size = self.meta.actual_size as usize;
        let mut content = self.data.bytes()?[HEADER_SIZE..HEADER_SIZE + size].to_vec();
        transform(self.crypter.as_ref(), &self.meta.iv, 0, &mut content);

        let mut dict = HashMap::new();
        let (parsed, err) = apply_records(&mut dict, &content);
        if let Some(e) = err {
            kv_log!(
                self.handlers,
                Error,
                "'{}': decoded only {} of {} bytes: {}",
                self.mmap_id,
                parsed,
                size,
                e
            );
        }
        self.dict = dict;

        kv_log!(
            self.handlers,
            Debug,
            "loaded '{}': {} keys, {} bytes, sequence {}",
            self.mmap_id,
            self.dict.len(),
            size,
            self.meta.sequence
        );
        Ok(())
    }

    /// Keep the longest well-formed prefix and write it back cleanly
    fn recover(&mut self, header: usize) -> Result<()> {
        let capacity = self.data.len() - HEADER_SIZE;
        let size = header.min(capacity);

        let mut content = self.data.bytes()?[HEADER_SIZE..HEADER_SIZE + size].to_vec();
        transform(self.crypter.as_ref(), &self.meta.iv, 0, &mut content);

        let mut dict = HashMap::new();
        let (parsed, _) = apply_records(&mut dict, &content);
        self.dict = dict;

        kv_log!(
            self.handlers,
            Warning,
            "'{}': recovered {} keys from {} of {} bytes",
            self.mmap_id,
            self.dict.len(),
            parsed,
            size
        );

        let crypter = self.crypter.clone();
        self.full_writeback(crypter, false)
    }

    /// Pick up another process's writes
    fn reconcile(&mut self) -> Result<()> {
        let disk = self.meta_file.read()?;
        if disk == self.meta {
            return Ok(());
        }

        self.content_changed = true;
        kv_log!(
            self.handlers,
            Info,
            "'{}' changed by another process (sequence {} -> {}, size {} -> {})",
            self.mmap_id,
            self.meta.sequence,
            disk.sequence,
            self.meta.actual_size,
            disk.actual_size
        );

        let appended = disk.sequence == self.meta.sequence
            && disk.iv == self.meta.iv
            && disk.actual_size > self.meta.actual_size;

        if appended && self.apply_appended_tail(&disk)? {
            return Ok(());
        }
        self.load()
    }

    /// Decode only the records appended since our meta. Returns false when
    /// the tail does not line up and a full reload is needed.
    fn apply_appended_tail(&mut self, disk: &MetaInfo) -> Result<bool> {
        self.data.remap_if_resized()?;

        let old = self.meta.actual_size as usize;
        let new = disk.actual_size as usize;
        if HEADER_SIZE + new > self.data.len() {
            return Ok(false);
        }

        let mut tail = self.data.bytes()?[HEADER_SIZE + old..HEADER_SIZE + new].to_vec();

        let mut hasher = crc32fast::Hasher::new_with_initial(self.meta.crc_digest);
        hasher.update(&tail);
        if hasher.finalize() != disk.crc_digest {
            return Ok(false);
        }

        transform(self.crypter.as_ref(), &disk.iv, old as u64, &mut tail);
        let mut dict = self.dict.clone();
        let (_, err) = apply_records(&mut dict, &tail);
        if err.is_some() {
            return Ok(false);
        }

        self.dict = dict;
        self.meta = *disk;
        Ok(true)
    }

    // =========================================================================
    // Writing
    // =========================================================================

    fn fits(&self, extra: usize) -> bool {
        HEADER_SIZE + self.meta.actual_size as usize + extra <= self.data.len()
    }

    /// Append one plaintext record at the end of the content
    fn append(&mut self, mut record: Vec<u8>) -> Result<()> {
        let offset = self.meta.actual_size as usize;
        transform(self.crypter.as_ref(), &self.meta.iv, offset as u64, &mut record);

        let start = HEADER_SIZE + offset;
        self.data.bytes_mut()?[start..start + record.len()].copy_from_slice(&record);

        let mut hasher = crc32fast::Hasher::new_with_initial(self.meta.crc_digest);
        hasher.update(&record);

        let next = MetaInfo {
            crc_digest: hasher.finalize(),
            actual_size: (offset + record.len()) as u64,
            last_confirmed_size: self.meta.actual_size,
            last_confirmed_crc: self.meta.crc_digest,
            ..self.meta
        };
        self.meta_file.write(&next)?;
        self.write_header(next.actual_size as usize)?;
        self.meta = next;
        Ok(())
    }

    /// Rewrite the whole dictionary as a new content generation, encrypted
    /// with `crypter`. `reserve` leaves headroom for further appends.
    fn full_writeback(&mut self, crypter: Option<Crypter>, reserve: bool) -> Result<()> {
        let iv = Crypter::random_iv();

        let mut content = Vec::new();
        for (key, value) in &self.dict {
            content.extend_from_slice(&encode_record(key, value));
        }
        transform(crypter.as_ref(), &iv, 0, &mut content);

        let crc = crc32fast::hash(&content);
        let size = content.len() as u64;
        let staged = StagedWrite {
            meta: MetaInfo {
                version: META_VERSION,
                crc_digest: crc,
                sequence: self.meta.sequence.wrapping_add(1),
                actual_size: size,
                iv,
                last_confirmed_size: size,
                last_confirmed_crc: crc,
            },
            content,
        };

        match self.stage_path.clone() {
            Some(stage) => {
                staged.persist(&stage)?;
                // Committed: a crash from here on rolls forward on open
                self.crypter = crypter;
                if let Err(e) = self.commit_staged(&staged, &stage, reserve) {
                    self.loaded = false;
                    return Err(e);
                }
            }
            None => {
                self.apply_generation(&staged.meta, &staged.content, reserve)?;
                self.crypter = crypter;
            }
        }

        self.meta = staged.meta;
        kv_log!(
            self.handlers,
            Debug,
            "wrote back '{}': {} keys, {} bytes, sequence {}",
            self.mmap_id,
            self.dict.len(),
            size,
            self.meta.sequence
        );
        Ok(())
    }

    fn commit_staged(&mut self, staged: &StagedWrite, stage: &Path, reserve: bool) -> Result<()> {
        self.apply_generation(&staged.meta, &staged.content, reserve)?;
        self.data.flush(SyncMode::Sync)?;
        self.meta_file.sync()?;
        StagedWrite::discard(stage)
    }

    /// Write `content` as the whole content, growing the file if needed
    fn apply_generation(&mut self, meta: &MetaInfo, content: &[u8], reserve: bool) -> Result<()> {
        if content.len() > u32::MAX as usize {
            return Err(MapKvError::Storage(format!(
                "content of {} bytes exceeds the 4 GiB limit",
                content.len()
            )));
        }

        let required = HEADER_SIZE + content.len();
        let wanted = if reserve { required + required / 2 } else { required };

        let current = self.data.len();
        if current < wanted {
            let mut len = current.max(self.page_size);
            while len < wanted {
                len *= 2;
            }
            kv_log!(
                self.handlers,
                Info,
                "growing '{}' from {} to {} bytes",
                self.mmap_id,
                current,
                len
            );
            self.data.resize(len)?;
        }

        // Nothing of the previous generation may survive past the new end
        let previous_end = (HEADER_SIZE + self.meta.actual_size as usize).min(self.data.len());
        let bytes = self.data.bytes_mut()?;
        bytes[HEADER_SIZE..required].copy_from_slice(content);
        if previous_end > required {
            bytes[required..previous_end].fill(0);
        }
        self.meta_file.write(meta)?;
        self.write_header(content.len())?;
        Ok(())
    }

    /// Empty content, one page, new sequence and IV
    fn reset_content(&mut self) -> Result<()> {
        self.dict.clear();

        if self.data.len() != self.page_size {
            self.data.resize(self.page_size)?;
        }
        self.data.bytes_mut()?.fill(0);

        let fresh = MetaInfo::fresh(self.meta.sequence.wrapping_add(1), Crypter::random_iv());
        self.meta_file.write(&fresh)?;
        self.meta = fresh;

        if let Some(stage) = &self.stage_path {
            StagedWrite::discard(stage)?;
        }
        Ok(())
    }

    fn read_header(&self) -> Result<usize> {
        Ok(read_u32(&self.data.bytes()?[..HEADER_SIZE]) as usize)
    }

    fn write_header(&mut self, size: usize) -> Result<()> {
        self.data.bytes_mut()?[..HEADER_SIZE].copy_from_slice(&(size as u32).to_le_bytes());
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn same_key(a: Option<&Crypter>, b: Option<&Crypter>) -> bool {
    a.map(Crypter::key) == b.map(Crypter::key)
}

/// Decide which content size (if any) matches the meta checksums
fn validate_content(content: &[u8], meta: &MetaInfo, header: usize) -> Validation {
    let matches = |size: usize, crc: u32| size <= content.len() && crc32fast::hash(&content[..size]) == crc;

    let mut candidates = vec![
        (header, meta.crc_digest),
        (meta.actual_size as usize, meta.crc_digest),
    ];
    // An empty confirmed prefix always matches; it would hide real damage
    if meta.last_confirmed_size > 0 {
        candidates.push((meta.last_confirmed_size as usize, meta.last_confirmed_crc));
    }
    for (size, crc) in candidates {
        if matches(size, crc) {
            return Validation::Accepted { size, crc };
        }
    }

    if header > content.len() {
        Validation::Failed(ErrorType::FileLength)
    } else {
        Validation::Failed(ErrorType::CrcCheckFail)
    }
}

/// Apply records to `dict` in order; returns bytes consumed and the error
/// that stopped decoding, if any
fn apply_records(dict: &mut HashMap<String, Vec<u8>>, content: &[u8]) -> (usize, Option<MapKvError>) {
    let mut iter = RecordIter::new(content);
    let mut error = None;

    for record in iter.by_ref() {
        match record {
            Ok(r) if r.is_removal() => {
                dict.remove(r.key);
            }
            Ok(r) => {
                dict.insert(r.key.to_string(), r.value.to_vec());
            }
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    (iter.position(), error)
}
