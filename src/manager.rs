//! Manager kernel: lifecycle, named construction, and durability.
//!
//! The kernel owns one open datastore: the reserved VM region, the segment
//! header chunk, the file-backed segment storage, the offset allocator, and
//! the named-object directory. User calls land here; named operations
//! consult the directory, memory operations consult the allocator, and both
//! produce offsets the kernel translates against the segment base.
//!
//! # VM region layout
//!
//! ```text
//! ┌───────────────┬──────────────────────────────────────────────┐
//! │ header chunk  │ data segment (file-backed, grows by chunks)  │
//! └───────────────┴──────────────────────────────────────────────┘
//! ^ region base    ^ region base + HEADER_SIZE
//! ```
//!
//! # Concurrency
//!
//! A single directory gate (mutex) serializes named lookups and mutations;
//! allocation within named construction happens while the gate is held, so
//! named construct/destroy are atomic with respect to each other. Anonymous
//! `allocate`/`deallocate` serialize on the allocator's own lock and hand
//! out disjoint offsets across threads. A panic inside a user initializer
//! poisons the directory gate; subsequent named operations observe a
//! sanity-check failure, matching the teardown policy for unrecoverable
//! internal state.

use crate::allocator::SegmentAllocator;
use crate::directory::{ObjectDirectory, ObjectEntry, ObjectKind};
use crate::error::{Error, Result};
use crate::header::SegmentHeader;
use crate::platform;
use crate::segment::SegmentStorage;
use crate::version;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Mutex;
use std::thread::JoinHandle;

/// Unit of segment growth and large-allocation bookkeeping: 2 MiB.
pub const CHUNK_SIZE: usize = 1 << 21;

/// Header chunk size: `size_of::<SegmentHeader>()` rounded up to a chunk.
const HEADER_SIZE: usize = CHUNK_SIZE;

/// Hard cap on the VM reservation a datastore may request.
const MAX_VM_RESERVE: usize = 1 << 46;

/// Address-space reservation used when reopening an existing datastore.
/// Claims no memory; only PROT_NONE address space.
const DEFAULT_OPEN_RESERVE: usize = 1 << 40;

/// Initial backed size of a fresh data segment.
const INITIAL_SEGMENT_SIZE: usize = CHUNK_SIZE;

const DATASTORE_DIR: &str = "datastore";
const SEGMENT_DIR: &str = "segment";
const SEGMENT_FILE: &str = "data";
const UUID_FILE: &str = "uuid";
const VERSION_FILE: &str = "version";
const DESCRIPTION_FILE: &str = "description";
const MARK_FILE: &str = "properly_closed_mark";
const DIRECTORY_FILE: &str = "named_object_directory.json";
const ALLOCATOR_FILE: &str = "segment_memory_allocator.json";

#[inline]
fn round_up_chunk(n: usize) -> usize {
    (n + CHUNK_SIZE - 1) & !(CHUNK_SIZE - 1)
}

fn datastore_dir(base: &Path) -> PathBuf {
    base.join(DATASTORE_DIR)
}

fn segment_file(base: &Path) -> PathBuf {
    datastore_dir(base).join(SEGMENT_DIR).join(SEGMENT_FILE)
}

fn meta_file(base: &Path, name: &str) -> PathBuf {
    datastore_dir(base).join(name)
}

/// Reserved VM range released on drop.
struct VmRegion {
    base: *mut u8,
    size: usize,
}

impl Drop for VmRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = platform::release_vm(self.base, self.size);
        }
    }
}

// SAFETY: the region is an address range, not data; ownership is unique.
unsafe impl Send for VmRegion {}
unsafe impl Sync for VmRegion {}

/// Allocator and storage move together: every allocation path may need to
/// grow the segment, so they share one lock.
struct Heap {
    allocator: SegmentAllocator,
    storage: SegmentStorage,
}

struct ManagerKernel {
    base_path: PathBuf,
    header: *mut SegmentHeader,
    heap: Mutex<Heap>,
    directory: Mutex<ObjectDirectory>,
    uuid: String,
    version_num: u32,
    read_only: bool,
    // Declared last: the reservation must outlive the storage mapping that
    // lives inside it, and field drop order follows declaration order.
    region: VmRegion,
}

// SAFETY: the raw header pointer targets a mapping owned by `region` and is
// only written during init and teardown; all shared mutation goes through
// the heap and directory mutexes.
unsafe impl Send for ManagerKernel {}
unsafe impl Sync for ManagerKernel {}

/// Deallocates (and drops already-constructed elements) if a user
/// initializer fails mid-construction, so no orphaned memory and no
/// directory entry survive the failure.
struct InitGuard<'a, T> {
    heap: &'a Mutex<Heap>,
    ptr: *mut T,
    offset: u64,
    constructed: usize,
    armed: bool,
}

impl<T> Drop for InitGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        unsafe {
            for i in 0..self.constructed {
                std::ptr::drop_in_place(self.ptr.add(i));
            }
        }
        if let Ok(mut heap) = self.heap.lock() {
            heap.allocator.deallocate(self.offset);
        }
    }
}

impl ManagerKernel {
    // ---------- lifecycle ---------- //

    fn create(base_path: &Path, capacity: usize) -> Result<Box<Self>> {
        Self::validate_system_config()?;

        if capacity == 0 || capacity > MAX_VM_RESERVE {
            return Err(Error::Config(format!(
                "capacity {capacity} out of range (max {MAX_VM_RESERVE})"
            )));
        }
        let region_size = round_up_chunk(capacity);
        if region_size < HEADER_SIZE + CHUNK_SIZE {
            return Err(Error::Config(format!(
                "capacity {capacity} leaves no room for the data segment"
            )));
        }

        // A pre-existing datastore at this path is discarded.
        let store = datastore_dir(base_path);
        if store.exists() {
            platform::remove_directory(&store);
        }
        platform::create_directory(&store.join(SEGMENT_DIR))?;

        let region = VmRegion {
            base: platform::reserve_aligned_vm(region_size, CHUNK_SIZE)?,
            size: region_size,
        };
        unsafe { platform::map_anonymous_fixed(region.base, HEADER_SIZE)? };

        let storage = SegmentStorage::create(
            &segment_file(base_path),
            region_size - HEADER_SIZE,
            unsafe { region.base.add(HEADER_SIZE) },
            INITIAL_SEGMENT_SIZE,
        )?;
        Self::validate_storage_config(&storage)?;

        let uuid = uuid::Uuid::new_v4().to_string();
        std::fs::write(meta_file(base_path, UUID_FILE), &uuid)?;
        let version_num = version::crate_version();
        std::fs::write(meta_file(base_path, VERSION_FILE), version_num.to_string())?;

        let allocator = SegmentAllocator::new(CHUNK_SIZE, storage.size());
        Self::finish_init(
            base_path, region, storage, allocator,
            ObjectDirectory::new(), uuid, version_num, false,
        )
    }

    fn open(base_path: &Path, read_only: bool) -> Result<Box<Self>> {
        Self::validate_system_config()?;

        let seg = segment_file(base_path);
        if !SegmentStorage::openable(&seg) {
            return Err(Error::NotFound(base_path.display().to_string()));
        }
        if !platform::file_exists(&meta_file(base_path, MARK_FILE)) {
            tracing::error!(
                "datastore at {} was not closed properly; refusing to open",
                base_path.display()
            );
            return Err(Error::Inconsistent(base_path.display().to_string()));
        }

        let region_size = DEFAULT_OPEN_RESERVE;
        let region = VmRegion {
            base: platform::reserve_aligned_vm(region_size, CHUNK_SIZE)?,
            size: region_size,
        };
        unsafe { platform::map_anonymous_fixed(region.base, HEADER_SIZE)? };

        let storage = SegmentStorage::open(
            &seg,
            region_size - HEADER_SIZE,
            unsafe { region.base.add(HEADER_SIZE) },
            read_only,
        )?;
        Self::validate_storage_config(&storage)?;

        let directory = ObjectDirectory::deserialize(&meta_file(base_path, DIRECTORY_FILE))?;
        let allocator =
            SegmentAllocator::deserialize(&meta_file(base_path, ALLOCATOR_FILE), CHUNK_SIZE)?;
        if allocator.backed_chunks() * CHUNK_SIZE != storage.size() {
            return Err(Error::Inconsistent(format!(
                "allocator tracks {} chunks but the segment backs {} bytes",
                allocator.backed_chunks(),
                storage.size()
            )));
        }

        let uuid = std::fs::read_to_string(meta_file(base_path, UUID_FILE))?
            .trim()
            .to_string();
        let version_num = std::fs::read_to_string(meta_file(base_path, VERSION_FILE))?
            .trim()
            .parse()
            .unwrap_or(0);

        // A writable session clears the marker; it returns at close.
        if !read_only {
            std::fs::remove_file(meta_file(base_path, MARK_FILE))?;
        }

        Self::finish_init(
            base_path, region, storage, allocator, directory, uuid, version_num, read_only,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_init(
        base_path: &Path,
        region: VmRegion,
        storage: SegmentStorage,
        allocator: SegmentAllocator,
        directory: ObjectDirectory,
        uuid: String,
        version_num: u32,
        read_only: bool,
    ) -> Result<Box<Self>> {
        let mut kernel = Box::new(ManagerKernel {
            base_path: base_path.to_path_buf(),
            header: std::ptr::null_mut(),
            heap: Mutex::new(Heap { allocator, storage }),
            directory: Mutex::new(directory),
            uuid,
            version_num,
            read_only,
            region,
        });

        let kernel_addr = &*kernel as *const ManagerKernel as usize;
        let segment_base = kernel.region.base as usize + HEADER_SIZE;
        let capacity = kernel.region.size - HEADER_SIZE;
        kernel.header = unsafe {
            SegmentHeader::install(kernel.region.base, kernel_addr, segment_base, capacity)
        };
        Ok(kernel)
    }

    fn validate_system_config() -> Result<()> {
        let page = platform::page_size();
        if page == 0 || CHUNK_SIZE % page != 0 {
            return Err(Error::Config(format!(
                "chunk size {CHUNK_SIZE} incompatible with system page size {page}"
            )));
        }
        Ok(())
    }

    fn validate_storage_config(storage: &SegmentStorage) -> Result<()> {
        let seg_page = storage.page_size();
        let sys_page = platform::page_size();
        if seg_page > CHUNK_SIZE || seg_page % sys_page != 0 {
            return Err(Error::Config(format!(
                "segment page size {seg_page} incompatible with chunk size {CHUNK_SIZE}"
            )));
        }
        Ok(())
    }

    /// Serialize management data and flush the segment. Called by close.
    fn persist_metadata(&self) -> Result<()> {
        let directory = self
            .directory
            .lock()
            .map_err(|_| Error::InvalidSegment("directory gate poisoned".into()))?;
        let heap = self
            .heap
            .lock()
            .map_err(|_| Error::InvalidSegment("heap lock poisoned".into()))?;

        directory.serialize(&meta_file(&self.base_path, DIRECTORY_FILE))?;
        heap.allocator
            .serialize(&meta_file(&self.base_path, ALLOCATOR_FILE))?;
        heap.storage.sync(true)?;
        Ok(())
    }

    // ---------- raw memory ---------- //

    #[inline]
    fn segment_base(&self) -> *mut u8 {
        unsafe { self.region.base.add(HEADER_SIZE) }
    }

    #[inline]
    fn segment_capacity(&self) -> usize {
        self.region.size - HEADER_SIZE
    }

    fn allocate(&self, nbytes: usize) -> Option<NonNull<u8>> {
        if self.read_only {
            return None;
        }
        let mut heap = self.heap.lock().ok()?;
        let heap = &mut *heap;
        let offset = heap.allocator.allocate(nbytes, &mut heap.storage)?;
        debug_assert!(offset as usize + nbytes <= heap.storage.size());
        NonNull::new(unsafe { self.segment_base().add(offset as usize) })
    }

    fn allocate_aligned(&self, nbytes: usize, alignment: usize) -> Option<NonNull<u8>> {
        if self.read_only {
            return None;
        }
        let mut heap = self.heap.lock().ok()?;
        let heap = &mut *heap;
        let offset = heap
            .allocator
            .allocate_aligned(nbytes, alignment, &mut heap.storage)?;
        debug_assert!(offset as usize + nbytes <= heap.storage.size());
        NonNull::new(unsafe { self.segment_base().add(offset as usize) })
    }

    fn deallocate(&self, addr: *mut u8) {
        if self.read_only || addr.is_null() {
            return;
        }
        let Some(offset) = self.offset_of(addr.cast_const()) else {
            tracing::warn!("deallocate: address {addr:p} is outside the segment");
            return;
        };
        if let Ok(mut heap) = self.heap.lock() {
            heap.allocator.deallocate(offset);
        }
    }

    /// Translate a process-local address back to a segment offset.
    fn offset_of<T>(&self, addr: *const T) -> Option<u64> {
        let base = self.segment_base() as usize;
        let addr = addr as usize;
        if addr < base || addr >= base + self.segment_capacity() {
            return None;
        }
        Some((addr - base) as u64)
    }

    #[inline]
    fn resolve<T>(&self, offset: u64) -> NonNull<T> {
        // Directory invariant: offsets stay within the backed segment.
        unsafe { NonNull::new_unchecked(self.segment_base().add(offset as usize).cast()) }
    }

    // ---------- named construction ---------- //

    fn generic_construct<T: 'static>(
        &self,
        name: &str,
        kind: ObjectKind,
        len: usize,
        try_find: bool,
        init: &mut dyn FnMut(usize) -> T,
    ) -> Option<NonNull<T>> {
        if self.read_only {
            return None;
        }

        let nbytes = std::mem::size_of::<T>().checked_mul(len)?;
        let mut directory = self.directory.lock().ok()?;

        if let Some(existing) = directory.find(name) {
            if try_find
                && existing.kind == kind
                && existing.type_name == std::any::type_name::<T>()
            {
                return Some(self.resolve(existing.offset));
            }
            return None;
        }

        // Allocation happens under the directory gate so a named construct
        // is atomic with respect to concurrent named destroys.
        let offset = {
            let mut heap = self.heap.lock().ok()?;
            let heap = &mut *heap;
            heap.allocator
                .allocate_aligned(nbytes, std::mem::align_of::<T>(), &mut heap.storage)?
        };

        let ptr: NonNull<T> = self.resolve(offset);
        let mut guard = InitGuard {
            heap: &self.heap,
            ptr: ptr.as_ptr(),
            offset,
            constructed: 0,
            armed: true,
        };
        for i in 0..len {
            unsafe { guard.ptr.add(i).write(init(i)) };
            guard.constructed += 1;
        }

        let inserted = directory.insert(ObjectEntry {
            name: name.to_string(),
            offset,
            length: len,
            type_name: std::any::type_name::<T>().to_string(),
            kind,
            description: String::new(),
        });
        if !inserted {
            // Unreachable while the gate is held, but never leak: the guard
            // drops the elements and returns the memory.
            return None;
        }

        guard.armed = false;
        Some(ptr)
    }

    fn construct_anonymous<T: 'static>(
        &self,
        len: usize,
        init: &mut dyn FnMut(usize) -> T,
    ) -> Option<NonNull<T>> {
        if self.read_only {
            return None;
        }
        let nbytes = std::mem::size_of::<T>().checked_mul(len)?;

        let offset = {
            let mut heap = self.heap.lock().ok()?;
            let heap = &mut *heap;
            heap.allocator
                .allocate_aligned(nbytes, std::mem::align_of::<T>(), &mut heap.storage)?
        };

        let ptr: NonNull<T> = self.resolve(offset);
        let mut guard = InitGuard {
            heap: &self.heap,
            ptr: ptr.as_ptr(),
            offset,
            constructed: 0,
            armed: true,
        };
        for i in 0..len {
            unsafe { guard.ptr.add(i).write(init(i)) };
            guard.constructed += 1;
        }
        guard.armed = false;
        Some(ptr)
    }

    fn find<T: 'static>(&self, name: &str, kind: ObjectKind) -> Option<(NonNull<T>, usize)> {
        let directory = self.directory.lock().ok()?;
        let entry = directory.find(name)?;
        if entry.kind != kind || entry.type_name != std::any::type_name::<T>() {
            return None;
        }
        Some((self.resolve(entry.offset), entry.length))
    }

    /// Erase the entry under the gate, then run destructors and free.
    ///
    /// The erase-first order keeps a concurrent construct under the same
    /// name from observing a half-destroyed object; destructors run after
    /// the gate is released since the name can no longer reach the memory.
    fn generic_destroy<T: 'static>(&self, name: &str, kind: ObjectKind) -> bool {
        if self.read_only {
            return false;
        }

        let entry = {
            let Ok(mut directory) = self.directory.lock() else {
                return false;
            };
            match directory.find(name) {
                Some(e) if e.kind == kind && e.type_name == std::any::type_name::<T>() => {}
                _ => return false,
            }
            directory.erase(name).expect("entry found under the gate")
        };

        let ptr: NonNull<T> = self.resolve(entry.offset);
        unsafe {
            for i in 0..entry.length {
                std::ptr::drop_in_place(ptr.as_ptr().add(i));
            }
        }

        if let Ok(mut heap) = self.heap.lock() {
            heap.allocator.deallocate(entry.offset);
        }
        true
    }

    fn destroy_ptr<T: 'static>(&self, ptr: NonNull<T>) -> bool {
        let Some(offset) = self.offset_of(ptr.as_ptr().cast_const()) else {
            return false;
        };
        let (name, kind) = {
            let Ok(directory) = self.directory.lock() else {
                return false;
            };
            match directory.find_by_offset(offset) {
                Some(e) => (e.name.clone(), e.kind),
                // Anonymous allocations carry no entry; they are released
                // with deallocate and their teardown is the caller's.
                None => return false,
            }
        };
        self.generic_destroy::<T>(&name, kind)
    }

    fn entry_for_ptr<T>(&self, ptr: NonNull<T>) -> Option<ObjectEntry> {
        let offset = self.offset_of(ptr.as_ptr().cast_const())?;
        let directory = self.directory.lock().ok()?;
        directory.find_by_offset(offset).cloned()
    }

    // ---------- durability, copy, snapshot ---------- //

    fn flush(&self, synchronous: bool) {
        if self.read_only {
            return;
        }
        if let Ok(heap) = self.heap.lock() {
            if let Err(e) = heap.storage.sync(synchronous) {
                tracing::error!("segment flush failed: {e}");
            }
        }
    }

    fn snapshot(&self, dst_base: &Path) -> bool {
        let dst_store = datastore_dir(dst_base);
        if dst_store.exists() {
            tracing::error!("snapshot target {} already exists", dst_store.display());
            return false;
        }

        if !self.read_only {
            if let Err(e) = self.persist_metadata() {
                tracing::error!("snapshot: failed to persist management data: {e}");
                return false;
            }
        }

        let src_store = datastore_dir(&self.base_path);
        if let Err(e) = platform::clone_directory(&src_store, &dst_store) {
            tracing::error!("snapshot: clone failed: {e}");
            platform::remove_directory(&dst_store);
            return false;
        }

        // The snapshot is its own datastore: fresh identity, clean close.
        let fresh = uuid::Uuid::new_v4().to_string();
        if std::fs::write(meta_file(dst_base, UUID_FILE), &fresh).is_err()
            || std::fs::write(meta_file(dst_base, MARK_FILE), b"").is_err()
        {
            tracing::error!("snapshot: failed to stamp {}", dst_store.display());
            platform::remove_directory(&dst_store);
            return false;
        }
        true
    }
}

impl Drop for ManagerKernel {
    fn drop(&mut self) {
        // Tear the back-pointer down before the mappings go away.
        if !self.header.is_null() {
            unsafe { SegmentHeader::clear(self.header) };
        }
        // Release the storage (unmap + close, files kept) before the region
        // drop returns the whole reservation.
        match self.heap.get_mut() {
            Ok(heap) => heap.storage.release(),
            Err(poisoned) => poisoned.into_inner().storage.release(),
        }
    }
}

/// A persistent heap manager bound to one datastore directory.
///
/// Created with [`create`], reopened with [`open`] / [`open_read_only`],
/// and closed with [`close`] (or by drop, which performs the same clean
/// shutdown and writes the properly-closed marker).
///
/// All methods take `&self`; the manager is `Send + Sync` and may be shared
/// across threads.
///
/// [`create`]: Manager::create
/// [`open`]: Manager::open
/// [`open_read_only`]: Manager::open_read_only
/// [`close`]: Manager::close
pub struct Manager {
    kernel: Option<Box<ManagerKernel>>,
}

impl Manager {
    // ---------- lifecycle ---------- //

    /// Create a new datastore at `base_path` with the given capacity hint.
    ///
    /// A pre-existing datastore at the same path is discarded. The capacity
    /// is rounded up to the chunk size and bounds the VM region backing the
    /// data segment; the usable segment is one header chunk smaller.
    pub fn create(base_path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        Ok(Self {
            kernel: Some(ManagerKernel::create(base_path.as_ref(), capacity)?),
        })
    }

    /// Open an existing datastore read-write.
    ///
    /// Fails with [`Error::NotFound`] when no datastore exists at the path
    /// and [`Error::Inconsistent`] when the previous session did not close
    /// properly.
    pub fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            kernel: Some(ManagerKernel::open(base_path.as_ref(), false)?),
        })
    }

    /// Open an existing datastore read-only. Every mutating operation on
    /// the returned manager is rejected at the public surface.
    pub fn open_read_only(base_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            kernel: Some(ManagerKernel::open(base_path.as_ref(), true)?),
        })
    }

    /// Close the datastore: serialize management data, flush synchronously,
    /// release the mappings, and write the properly-closed marker.
    pub fn close(mut self) -> Result<()> {
        let kernel = self.kernel.take().expect("kernel present until close");
        let read_only = kernel.read_only;
        let base_path = kernel.base_path.clone();

        if !read_only {
            kernel.persist_metadata()?;
        }
        drop(kernel);

        if !read_only {
            std::fs::write(meta_file(&base_path, MARK_FILE), b"")?;
        }
        Ok(())
    }

    #[inline]
    fn kernel(&self) -> &ManagerKernel {
        self.kernel.as_ref().expect("kernel present until close")
    }

    /// Flush segment data to the backing file. Synchronous mode blocks
    /// until the data is stable; asynchronous mode returns after issuing
    /// the write-back. A no-op on read-only managers.
    pub fn flush(&self, synchronous: bool) {
        self.kernel().flush(synchronous);
    }

    // ---------- raw memory ---------- //

    /// Allocate `nbytes` from the segment.
    ///
    /// Returns `None` when the manager is read-only or the segment (and its
    /// growth budget) is exhausted.
    pub fn allocate(&self, nbytes: usize) -> Option<NonNull<u8>> {
        self.kernel().allocate(nbytes)
    }

    /// Allocate `nbytes` aligned to `alignment`.
    ///
    /// `alignment` must be a power of two no larger than [`chunk_size`];
    /// anything else is rejected with `None`.
    ///
    /// [`chunk_size`]: Manager::chunk_size
    pub fn allocate_aligned(&self, nbytes: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.kernel().allocate_aligned(nbytes, alignment)
    }

    /// Return an allocation obtained from `allocate*` or anonymous
    /// construction. Null pointers, foreign addresses, and read-only
    /// managers make this a no-op. Element destructors are not run.
    pub fn deallocate(&self, addr: *mut u8) {
        self.kernel().deallocate(addr);
    }

    // ---------- named objects ---------- //

    /// Construct a named object holding `value`.
    ///
    /// Returns `None` on a name collision, on allocation failure, or on a
    /// read-only manager.
    pub fn construct<T: 'static>(&self, name: &str, value: T) -> Option<NonNull<T>> {
        let mut value = Some(value);
        self.kernel().generic_construct(
            name,
            ObjectKind::Named,
            1,
            false,
            &mut |_| value.take().expect("single-element initializer"),
        )
    }

    /// Construct a named array of `len` elements, each produced by
    /// `init(index)`.
    ///
    /// If `init` panics, already-constructed elements are dropped, the
    /// memory is returned, and no directory entry is left behind.
    pub fn construct_array_with<T: 'static>(
        &self,
        name: &str,
        len: usize,
        mut init: impl FnMut(usize) -> T,
    ) -> Option<NonNull<T>> {
        self.kernel()
            .generic_construct(name, ObjectKind::Named, len, false, &mut init)
    }

    /// Return the named object, constructing it from `make` if absent.
    pub fn find_or_construct<T: 'static>(
        &self,
        name: &str,
        make: impl FnOnce() -> T,
    ) -> Option<NonNull<T>> {
        let mut make = Some(make);
        self.kernel().generic_construct(
            name,
            ObjectKind::Named,
            1,
            true,
            &mut |_| (make.take().expect("single-element initializer"))(),
        )
    }

    /// Construct the unique object of type `T` (one per type per region).
    pub fn construct_unique<T: 'static>(&self, value: T) -> Option<NonNull<T>> {
        let mut value = Some(value);
        self.kernel().generic_construct(
            std::any::type_name::<T>(),
            ObjectKind::Unique,
            1,
            false,
            &mut |_| value.take().expect("single-element initializer"),
        )
    }

    /// Return the unique object of type `T`, constructing it if absent.
    pub fn find_or_construct_unique<T: 'static>(
        &self,
        make: impl FnOnce() -> T,
    ) -> Option<NonNull<T>> {
        let mut make = Some(make);
        self.kernel().generic_construct(
            std::any::type_name::<T>(),
            ObjectKind::Unique,
            1,
            true,
            &mut |_| (make.take().expect("single-element initializer"))(),
        )
    }

    /// Construct an anonymous object. It never enters the directory and is
    /// reachable only through the returned pointer; release it with
    /// [`deallocate`] (element teardown is the caller's responsibility).
    ///
    /// [`deallocate`]: Manager::deallocate
    pub fn construct_anonymous<T: 'static>(&self, value: T) -> Option<NonNull<T>> {
        let mut value = Some(value);
        self.kernel()
            .construct_anonymous(1, &mut |_| value.take().expect("single-element initializer"))
    }

    /// Construct an anonymous array of `len` elements.
    pub fn construct_anonymous_array_with<T: 'static>(
        &self,
        len: usize,
        mut init: impl FnMut(usize) -> T,
    ) -> Option<NonNull<T>> {
        self.kernel().construct_anonymous(len, &mut init)
    }

    /// Find a named object. Returns its address and element count, or
    /// `None` on a miss or when the recorded type differs from `T`.
    pub fn find<T: 'static>(&self, name: &str) -> Option<(NonNull<T>, usize)> {
        self.kernel().find(name, ObjectKind::Named)
    }

    /// Find the unique object of type `T`.
    pub fn find_unique<T: 'static>(&self) -> Option<(NonNull<T>, usize)> {
        self.kernel()
            .find(std::any::type_name::<T>(), ObjectKind::Unique)
    }

    /// Destroy a named object: erase its entry, run element destructors,
    /// free the memory. Returns false on a miss, a type mismatch, or a
    /// read-only manager.
    pub fn destroy<T: 'static>(&self, name: &str) -> bool {
        self.kernel().generic_destroy::<T>(name, ObjectKind::Named)
    }

    /// Destroy the unique object of type `T`.
    pub fn destroy_unique<T: 'static>(&self) -> bool {
        self.kernel()
            .generic_destroy::<T>(std::any::type_name::<T>(), ObjectKind::Unique)
    }

    /// Destroy the named or unique object that `ptr` points at, resolved
    /// through the directory. Returns false for anonymous allocations and
    /// foreign pointers.
    pub fn destroy_ptr<T: 'static>(&self, ptr: NonNull<T>) -> bool {
        self.kernel().destroy_ptr(ptr)
    }

    // ---------- object attributes ---------- //

    /// Number of named objects in the directory.
    pub fn num_named_objects(&self) -> usize {
        self.kernel()
            .directory
            .lock()
            .map(|d| d.count(ObjectKind::Named))
            .unwrap_or(0)
    }

    /// Number of unique objects in the directory.
    pub fn num_unique_objects(&self) -> usize {
        self.kernel()
            .directory
            .lock()
            .map(|d| d.count(ObjectKind::Unique))
            .unwrap_or(0)
    }

    /// Number of tracked anonymous objects. Anonymous allocations never
    /// enter the directory, so this is always zero.
    pub fn num_anonymous_objects(&self) -> usize {
        0
    }

    /// Snapshot of the named-object entries, in name order.
    pub fn named_objects(&self) -> Vec<ObjectEntry> {
        self.kernel()
            .directory
            .lock()
            .map(|d| d.iter_kind(ObjectKind::Named).cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the unique-object entries, in name order.
    pub fn unique_objects(&self) -> Vec<ObjectEntry> {
        self.kernel()
            .directory
            .lock()
            .map(|d| d.iter_kind(ObjectKind::Unique).cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the tracked anonymous entries. Anonymous allocations
    /// never enter the directory, so this is always empty.
    pub fn anonymous_objects(&self) -> Vec<ObjectEntry> {
        Vec::new()
    }

    /// Whether `ptr` points at an object whose recorded type is `T`.
    pub fn is_instance_type<T: 'static>(&self, ptr: NonNull<T>) -> bool {
        self.kernel()
            .entry_for_ptr(ptr)
            .is_some_and(|e| e.type_name == std::any::type_name::<T>())
    }

    /// Registration kind of the object at `ptr`, if it has an entry.
    pub fn instance_kind<T>(&self, ptr: NonNull<T>) -> Option<ObjectKind> {
        self.kernel().entry_for_ptr(ptr).map(|e| e.kind)
    }

    /// Name of the object at `ptr`, if it has an entry.
    pub fn instance_name<T>(&self, ptr: NonNull<T>) -> Option<String> {
        self.kernel().entry_for_ptr(ptr).map(|e| e.name)
    }

    /// Element count of the object at `ptr`, if it has an entry.
    pub fn instance_length<T>(&self, ptr: NonNull<T>) -> Option<usize> {
        self.kernel().entry_for_ptr(ptr).map(|e| e.length)
    }

    /// Description recorded for the object at `ptr`.
    pub fn instance_description<T>(&self, ptr: NonNull<T>) -> Option<String> {
        self.kernel().entry_for_ptr(ptr).map(|e| e.description)
    }

    /// Set the description of the object at `ptr`. Returns false on a
    /// read-only manager or when `ptr` has no entry.
    pub fn set_instance_description<T>(&self, ptr: NonNull<T>, description: &str) -> bool {
        let kernel = self.kernel();
        if kernel.read_only {
            return false;
        }
        let Some(offset) = kernel.offset_of(ptr.as_ptr().cast_const()) else {
            return false;
        };
        let Ok(mut directory) = kernel.directory.lock() else {
            return false;
        };
        match directory.find_by_offset_mut(offset) {
            Some(entry) => {
                entry.description = description.to_string();
                true
            }
            None => false,
        }
    }

    // ---------- datastore description ---------- //

    /// Set the datastore description (one per datastore, overwritten).
    pub fn set_description(&self, description: &str) -> bool {
        let kernel = self.kernel();
        if kernel.read_only {
            return false;
        }
        Self::set_description_at(&kernel.base_path, description)
    }

    /// Read the datastore description, if one was ever set.
    pub fn description(&self) -> Option<String> {
        Self::description_at(&self.kernel().base_path)
    }

    /// Set the description of a datastore on disk.
    pub fn set_description_at(base_path: impl AsRef<Path>, description: &str) -> bool {
        std::fs::write(
            meta_file(base_path.as_ref(), DESCRIPTION_FILE),
            description,
        )
        .is_ok()
    }

    /// Read the description of a datastore on disk.
    pub fn description_at(base_path: impl AsRef<Path>) -> Option<String> {
        std::fs::read_to_string(meta_file(base_path.as_ref(), DESCRIPTION_FILE)).ok()
    }

    // ---------- snapshot, copy, data store management ---------- //

    /// Take a snapshot of the current state into `dst_base`.
    ///
    /// The source stays open. The snapshot receives a fresh UUID and a
    /// properly-closed marker, so it opens as a consistent datastore.
    pub fn snapshot(&self, dst_base: impl AsRef<Path>) -> bool {
        self.kernel().snapshot(dst_base.as_ref())
    }

    /// Copy a closed datastore, reflinking when the filesystem supports it.
    ///
    /// The copy carries the source's UUID and state verbatim. Copying a
    /// datastore that is open writable is undefined; an inconsistent source
    /// is refused.
    pub fn copy(src_base: impl AsRef<Path>, dst_base: impl AsRef<Path>) -> bool {
        let (src, dst) = (src_base.as_ref(), dst_base.as_ref());
        if !Self::consistent(src) {
            tracing::error!("copy: source {} is not consistent", src.display());
            return false;
        }
        let dst_store = datastore_dir(dst);
        if dst_store.exists() {
            tracing::error!("copy: target {} already exists", dst_store.display());
            return false;
        }
        match platform::clone_directory(&datastore_dir(src), &dst_store) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("copy failed: {e}");
                platform::remove_directory(&dst_store);
                false
            }
        }
    }

    /// [`copy`] on a worker thread. Await the handle for the result;
    /// cancellation is not supported.
    ///
    /// [`copy`]: Manager::copy
    pub fn copy_async(
        src_base: impl AsRef<Path>,
        dst_base: impl AsRef<Path>,
    ) -> JoinHandle<bool> {
        let src = src_base.as_ref().to_path_buf();
        let dst = dst_base.as_ref().to_path_buf();
        std::thread::spawn(move || Self::copy(src, dst))
    }

    /// Remove the datastore under `base_path`. Removing a path that holds
    /// no datastore succeeds.
    pub fn remove(base_path: impl AsRef<Path>) -> bool {
        let base = base_path.as_ref();
        let store = datastore_dir(base);
        if !store.exists() {
            return true;
        }
        if !SegmentStorage::destroy_files(&segment_file(base)) {
            return false;
        }
        platform::remove_directory(&store)
    }

    /// [`remove`] on a worker thread.
    ///
    /// [`remove`]: Manager::remove
    pub fn remove_async(base_path: impl AsRef<Path>) -> JoinHandle<bool> {
        let base = base_path.as_ref().to_path_buf();
        std::thread::spawn(move || Self::remove(base))
    }

    /// Whether a datastore exists at `base_path` and was closed properly.
    pub fn consistent(base_path: impl AsRef<Path>) -> bool {
        let base = base_path.as_ref();
        SegmentStorage::openable(&segment_file(base))
            && platform::file_exists(&meta_file(base, MARK_FILE))
    }

    /// UUID of a datastore on disk.
    pub fn uuid_at(base_path: impl AsRef<Path>) -> Result<String> {
        Ok(
            std::fs::read_to_string(meta_file(base_path.as_ref(), UUID_FILE))?
                .trim()
                .to_string(),
        )
    }

    /// Version stamp of a datastore on disk (see [`version::decode`]).
    pub fn version_at(base_path: impl AsRef<Path>) -> Result<u32> {
        let text = std::fs::read_to_string(meta_file(base_path.as_ref(), VERSION_FILE))?;
        text.trim()
            .parse()
            .map_err(|_| Error::Config(format!("malformed version stamp {text:?}")))
    }

    // ---------- introspection ---------- //

    /// Address of the data segment in this session.
    pub fn address(&self) -> *const u8 {
        self.kernel().segment_base()
    }

    /// Maximum size of the data segment in bytes. The backed prefix grows
    /// toward this on demand.
    pub fn size(&self) -> usize {
        self.kernel().segment_capacity()
    }

    /// Whether this manager was opened read-only.
    pub fn read_only(&self) -> bool {
        self.kernel().read_only
    }

    /// The compile-time chunk size.
    pub const fn chunk_size() -> usize {
        CHUNK_SIZE
    }

    /// UUID of the open datastore.
    pub fn uuid(&self) -> &str {
        &self.kernel().uuid
    }

    /// Version stamp the open datastore was created with.
    pub fn version(&self) -> u32 {
        self.kernel().version_num
    }

    /// Whether every allocation has been returned to the allocator.
    pub fn all_memory_deallocated(&self) -> bool {
        self.kernel()
            .heap
            .lock()
            .map(|h| h.allocator.all_deallocated())
            .unwrap_or(false)
    }

    /// Whether the kernel is in a usable state: mappings live, segment
    /// non-empty, and no gate poisoned by a failed user initializer.
    pub fn check_sanity(&self) -> bool {
        let Some(kernel) = self.kernel.as_ref() else {
            return false;
        };
        !kernel.region.base.is_null()
            && !kernel.header.is_null()
            && kernel.segment_capacity() > 0
            && !kernel.directory.is_poisoned()
            && !kernel.heap.is_poisoned()
    }

    /// The in-region segment header for this session.
    pub fn segment_header(&self) -> *const SegmentHeader {
        self.kernel().header
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let Some(kernel) = self.kernel.take() else {
            return;
        };
        let read_only = kernel.read_only;
        let base_path = kernel.base_path.clone();

        if !read_only {
            if let Err(e) = kernel.persist_metadata() {
                tracing::error!("close: failed to persist management data: {e}");
                return;
            }
        }
        drop(kernel);

        if !read_only {
            if let Err(e) = std::fs::write(meta_file(&base_path, MARK_FILE), b"") {
                tracing::error!("close: failed to write properly-closed mark: {e}");
            }
        }
    }
}
