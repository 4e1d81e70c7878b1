//! Chunk-based segment memory allocator.
//!
//! The allocator carves the data segment into fixed-size chunks and speaks
//! *offsets*, never pointers, so its state stays valid when the segment is
//! remapped at a different address in a later session.
//!
//! # Design
//!
//! Each chunk is in exactly one state:
//!
//! ```text
//! ┌────────┬──────────────────┬─────────────────────────┐
//! │  Free  │ Slab (class s)   │ LargeHead .. LargeBody  │
//! └────────┴──────────────────┴─────────────────────────┘
//! ```
//!
//! Requests up to half a chunk round up to a power-of-two size class and are
//! served from slab chunks subdivided into equal slots; a per-class free
//! list (vector of offsets) feeds allocation. Larger requests take a
//! contiguous first-fit run of whole chunks. When no free chunk remains the
//! allocator grows the segment storage by whole chunks, and fails only when
//! that growth fails.
//!
//! The whole state serializes verbatim: chunk-state table plus per-class
//! free lists. A deserialized allocator owns the same byte partition it had
//! at serialize time.

use crate::error::{Error, Result};
use crate::segment::SegmentStorage;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest slab slot size in bytes. Also the minimum request granularity.
pub const MIN_OBJECT_SIZE: usize = 8;

/// State of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    /// Not backing any allocation.
    Free,
    /// Subdivided into equal slots of size class `class`.
    Slab {
        /// Index into the size-class table.
        class: u8,
    },
    /// First chunk of a large allocation spanning `nchunks` chunks.
    LargeHead {
        /// Run length in chunks, including this one.
        nchunks: u32,
    },
    /// Interior chunk of a large allocation.
    LargeBody,
}

/// Offset-producing allocator over the data segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentAllocator {
    /// Chunk size in bytes. Persisted so an incompatible region is rejected
    /// at deserialize time.
    chunk_size: usize,
    /// Per-chunk state, indexed by chunk number.
    chunks: Vec<ChunkState>,
    /// Per-class free slot offsets.
    bins: Vec<Vec<u64>>,
}

impl SegmentAllocator {
    /// Create an allocator over `backed_bytes` of already-backed segment.
    ///
    /// `chunk_size` must be a power of two and `backed_bytes` a multiple of
    /// it.
    pub fn new(chunk_size: usize, backed_bytes: usize) -> Self {
        debug_assert!(chunk_size.is_power_of_two());
        debug_assert_eq!(backed_bytes % chunk_size, 0);

        let num_classes = Self::num_classes(chunk_size);
        Self {
            chunk_size,
            chunks: vec![ChunkState::Free; backed_bytes / chunk_size],
            bins: vec![Vec::new(); num_classes],
        }
    }

    fn num_classes(chunk_size: usize) -> usize {
        // MIN_OBJECT_SIZE, 2*MIN, ..., chunk_size / 2.
        ((chunk_size / 2).trailing_zeros() - MIN_OBJECT_SIZE.trailing_zeros() + 1) as usize
    }

    /// Slot size of a class.
    #[inline]
    fn class_size(class: usize) -> usize {
        MIN_OBJECT_SIZE << class
    }

    /// Size class covering `nbytes`, or `None` for the large path.
    #[inline]
    fn size_class(&self, nbytes: usize) -> Option<usize> {
        let rounded = nbytes.max(MIN_OBJECT_SIZE).next_power_of_two();
        if rounded > self.chunk_size / 2 {
            return None;
        }
        Some((rounded.trailing_zeros() - MIN_OBJECT_SIZE.trailing_zeros()) as usize)
    }

    /// Allocate `nbytes`, growing `storage` if the free-chunk pool is empty.
    ///
    /// Returns the offset of the allocation, aligned to at least the natural
    /// alignment of its size class (chunk-aligned on the large path). A
    /// zero-byte request is served from the smallest class so the returned
    /// offset is always a distinct live allocation.
    pub fn allocate(&mut self, nbytes: usize, storage: &mut SegmentStorage) -> Option<u64> {
        match self.size_class(nbytes) {
            Some(class) => self.slab_allocate(class, storage),
            None => self.large_allocate(nbytes, storage),
        }
    }

    /// Allocate `nbytes` aligned to `alignment`.
    ///
    /// `alignment` must be a power of two no larger than the chunk size;
    /// otherwise the request is rejected. Slab requests are rounded up to
    /// the first class whose natural alignment satisfies the request.
    pub fn allocate_aligned(
        &mut self,
        nbytes: usize,
        alignment: usize,
        storage: &mut SegmentStorage,
    ) -> Option<u64> {
        if !alignment.is_power_of_two() || alignment > self.chunk_size {
            return None;
        }
        // A class slot of size >= alignment sits at an offset that is a
        // multiple of its own size, so rounding the request up suffices.
        // Anything past the slab classes is chunk-aligned already.
        self.allocate(nbytes.max(alignment), storage)
    }

    fn slab_allocate(&mut self, class: usize, storage: &mut SegmentStorage) -> Option<u64> {
        if self.bins[class].is_empty() {
            self.refill_class(class, storage)?;
        }
        self.bins[class].pop()
    }

    /// Claim a free chunk for `class` and seed its slots into the bin.
    fn refill_class(&mut self, class: usize, storage: &mut SegmentStorage) -> Option<()> {
        let chunk_no = self.claim_free_chunk(storage)?;
        self.chunks[chunk_no] = ChunkState::Slab { class: class as u8 };

        let slot_size = Self::class_size(class);
        let base = (chunk_no * self.chunk_size) as u64;
        let slots = self.chunk_size / slot_size;
        // Seed in reverse so the lowest offset pops first.
        for i in (0..slots).rev() {
            self.bins[class].push(base + (i * slot_size) as u64);
        }
        Some(())
    }

    fn large_allocate(&mut self, nbytes: usize, storage: &mut SegmentStorage) -> Option<u64> {
        let nchunks = nbytes.div_ceil(self.chunk_size).max(1);

        let start = match self.find_free_run(nchunks) {
            Some(start) => start,
            None => self.grow_for_run(nchunks, storage)?,
        };

        self.chunks[start] = ChunkState::LargeHead {
            nchunks: nchunks as u32,
        };
        for i in 1..nchunks {
            self.chunks[start + i] = ChunkState::LargeBody;
        }
        Some((start * self.chunk_size) as u64)
    }

    /// First-fit scan for a run of `nchunks` free chunks.
    fn find_free_run(&self, nchunks: usize) -> Option<usize> {
        let mut run = 0;
        for (i, state) in self.chunks.iter().enumerate() {
            if *state == ChunkState::Free {
                run += 1;
                if run == nchunks {
                    return Some(i + 1 - nchunks);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Extend the segment so a run of `nchunks` free chunks exists at the
    /// tail, reusing any trailing free chunks already present.
    fn grow_for_run(&mut self, nchunks: usize, storage: &mut SegmentStorage) -> Option<usize> {
        let trailing = self
            .chunks
            .iter()
            .rev()
            .take_while(|s| **s == ChunkState::Free)
            .count();
        let start = self.chunks.len() - trailing;
        let target_chunks = start + nchunks;

        self.extend_to(target_chunks, storage)?;
        Some(start)
    }

    /// Claim one free chunk, extending the segment if none remains.
    fn claim_free_chunk(&mut self, storage: &mut SegmentStorage) -> Option<usize> {
        if let Some(i) = self.chunks.iter().position(|s| *s == ChunkState::Free) {
            return Some(i);
        }
        let chunk_no = self.chunks.len();
        self.extend_to(chunk_no + 1, storage)?;
        Some(chunk_no)
    }

    fn extend_to(&mut self, target_chunks: usize, storage: &mut SegmentStorage) -> Option<()> {
        if target_chunks <= self.chunks.len() {
            return Some(());
        }
        if let Err(e) = storage.extend(target_chunks * self.chunk_size) {
            tracing::debug!("segment extension to {target_chunks} chunks refused: {e}");
            return None;
        }
        self.chunks.resize(target_chunks, ChunkState::Free);
        Some(())
    }

    /// Return an allocation to the allocator.
    ///
    /// `offset` must be a value previously returned by `allocate*` and not
    /// yet deallocated. Invalid offsets are rejected with a warning rather
    /// than corrupting the partition. Empty slab chunks are not returned to
    /// the free-chunk pool eagerly; their slots stay on the class free list.
    pub fn deallocate(&mut self, offset: u64) -> bool {
        let chunk_no = (offset as usize) / self.chunk_size;
        let Some(state) = self.chunks.get(chunk_no).copied() else {
            tracing::warn!("deallocate: offset {offset} past backed segment");
            return false;
        };

        match state {
            ChunkState::Slab { class } => {
                let class = class as usize;
                let slot_size = Self::class_size(class);
                if (offset as usize) % slot_size != 0 {
                    tracing::warn!("deallocate: offset {offset} not a class-{class} slot");
                    return false;
                }
                debug_assert!(
                    !self.bins[class].contains(&offset),
                    "double free of offset {offset}"
                );
                self.bins[class].push(offset);
                true
            }
            ChunkState::LargeHead { nchunks } => {
                if offset as usize != chunk_no * self.chunk_size {
                    tracing::warn!("deallocate: offset {offset} is not a large-run head");
                    return false;
                }
                for i in 0..nchunks as usize {
                    self.chunks[chunk_no + i] = ChunkState::Free;
                }
                true
            }
            ChunkState::LargeBody | ChunkState::Free => {
                tracing::warn!("deallocate: offset {offset} does not head an allocation");
                false
            }
        }
    }

    /// Whether every byte of the segment is free.
    pub fn all_deallocated(&self) -> bool {
        self.chunks.iter().enumerate().all(|(chunk_no, state)| {
            match *state {
                ChunkState::Free => true,
                ChunkState::LargeHead { .. } | ChunkState::LargeBody => false,
                ChunkState::Slab { class } => {
                    // A slab chunk counts as free when every slot is back on
                    // the class free list.
                    let class = class as usize;
                    let slots = self.chunk_size / Self::class_size(class);
                    let lo = (chunk_no * self.chunk_size) as u64;
                    let hi = ((chunk_no + 1) * self.chunk_size) as u64;
                    let free = self.bins[class]
                        .iter()
                        .filter(|&&o| (lo..hi).contains(&o))
                        .count();
                    free == slots
                }
            }
        })
    }

    /// Number of chunks currently tracked (backed by the segment).
    #[inline]
    pub fn backed_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Write the chunk-state table and free lists to `path`.
    pub fn serialize(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    /// Reconstruct an allocator persisted with [`serialize`].
    ///
    /// Fails if the recorded chunk size differs from `chunk_size`; regions
    /// are not portable between incompatible chunk sizes.
    ///
    /// [`serialize`]: SegmentAllocator::serialize
    pub fn deserialize(path: &Path, chunk_size: usize) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let alloc: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        if alloc.chunk_size != chunk_size {
            return Err(Error::Config(format!(
                "allocator metadata built with chunk size {}, expected {chunk_size}",
                alloc.chunk_size
            )));
        }
        if alloc.bins.len() != Self::num_classes(chunk_size) {
            return Err(Error::Config("allocator metadata bin table malformed".into()));
        }
        Ok(alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform;
    use std::path::PathBuf;

    const CHUNK: usize = 2 * 1024 * 1024;
    const REGION: usize = 32 * CHUNK;

    struct Fixture {
        storage: SegmentStorage,
        base: *mut u8,
        file: PathBuf,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let file = std::env::temp_dir().join(format!(
                "duraheap-alloc-{}-{}",
                name,
                std::process::id()
            ));
            let base = platform::reserve_aligned_vm(REGION, CHUNK).unwrap();
            let storage = SegmentStorage::create(&file, REGION, base, CHUNK).unwrap();
            Self {
                storage,
                base,
                file,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unsafe {
                let _ = platform::release_vm(self.base, REGION);
            }
            let _ = std::fs::remove_file(&self.file);
        }
    }

    #[test]
    fn test_small_allocations_are_distinct_and_aligned() {
        let mut fx = Fixture::new("small");
        let mut alloc = SegmentAllocator::new(CHUNK, fx.storage.size());

        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let off = alloc.allocate(24, &mut fx.storage).unwrap();
            // 24 rounds up to the 32-byte class.
            assert_eq!(off % 32, 0);
            assert!(seen.insert(off), "offset {off} returned twice");
        }
    }

    #[test]
    fn test_zero_byte_allocation() {
        let mut fx = Fixture::new("zero");
        let mut alloc = SegmentAllocator::new(CHUNK, fx.storage.size());

        let a = alloc.allocate(0, &mut fx.storage).unwrap();
        let b = alloc.allocate(0, &mut fx.storage).unwrap();
        assert_ne!(a, b);
        assert!(alloc.deallocate(a));
        assert!(alloc.deallocate(b));
    }

    #[test]
    fn test_slab_reuse_after_free() {
        let mut fx = Fixture::new("reuse");
        let mut alloc = SegmentAllocator::new(CHUNK, fx.storage.size());

        let off = alloc.allocate(64, &mut fx.storage).unwrap();
        assert!(alloc.deallocate(off));
        let again = alloc.allocate(64, &mut fx.storage).unwrap();
        assert_eq!(off, again);
    }

    #[test]
    fn test_large_allocation_spans_chunks() {
        let mut fx = Fixture::new("large");
        let mut alloc = SegmentAllocator::new(CHUNK, fx.storage.size());

        let off = alloc.allocate(3 * CHUNK + 1, &mut fx.storage).unwrap();
        assert_eq!(off as usize % CHUNK, 0);
        // Four chunks claimed; a following large request lands after them.
        let next = alloc.allocate(CHUNK, &mut fx.storage).unwrap();
        assert_eq!(next, off + 4 * CHUNK as u64);

        assert!(alloc.deallocate(off));
        let refill = alloc.allocate(2 * CHUNK, &mut fx.storage).unwrap();
        assert_eq!(refill, off, "freed run is reused first-fit");
    }

    #[test]
    fn test_half_chunk_boundary_routes_large() {
        let mut fx = Fixture::new("boundary");
        let mut alloc = SegmentAllocator::new(CHUNK, fx.storage.size());

        // Exactly half a chunk stays on the slab path.
        let slab = alloc.allocate(CHUNK / 2, &mut fx.storage).unwrap();
        assert_eq!(slab as usize % (CHUNK / 2), 0);

        // One byte over takes a whole chunk.
        let large = alloc.allocate(CHUNK / 2 + 1, &mut fx.storage).unwrap();
        assert_eq!(large as usize % CHUNK, 0);
    }

    #[test]
    fn test_aligned_allocation() {
        let mut fx = Fixture::new("aligned");
        let mut alloc = SegmentAllocator::new(CHUNK, fx.storage.size());

        let off = alloc.allocate_aligned(10, 4096, &mut fx.storage).unwrap();
        assert_eq!(off % 4096, 0);

        let off = alloc
            .allocate_aligned(10, CHUNK, &mut fx.storage)
            .unwrap();
        assert_eq!(off as usize % CHUNK, 0);

        assert!(alloc.allocate_aligned(10, 2 * CHUNK, &mut fx.storage).is_none());
        assert!(alloc.allocate_aligned(10, 48, &mut fx.storage).is_none());
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut fx = Fixture::new("exhaust");
        let mut alloc = SegmentAllocator::new(CHUNK, fx.storage.size());

        let mut got = Vec::new();
        while let Some(off) = alloc.allocate(CHUNK, &mut fx.storage) {
            got.push(off);
            assert!(got.len() <= REGION / CHUNK, "allocated past the cap");
        }
        assert_eq!(got.len(), REGION / CHUNK);

        // Freeing one run makes exactly one more allocation possible.
        assert!(alloc.deallocate(got[3]));
        assert!(alloc.allocate(CHUNK, &mut fx.storage).is_some());
        assert!(alloc.allocate(CHUNK, &mut fx.storage).is_none());
    }

    #[test]
    fn test_invalid_deallocate_rejected() {
        let mut fx = Fixture::new("badfree");
        let mut alloc = SegmentAllocator::new(CHUNK, fx.storage.size());

        // Free chunk, interior of a large run, and out-of-range offsets.
        assert!(!alloc.deallocate(0));
        let off = alloc.allocate(2 * CHUNK, &mut fx.storage).unwrap();
        assert!(!alloc.deallocate(off + CHUNK as u64));
        assert!(!alloc.deallocate((REGION * 2) as u64));
        assert!(alloc.deallocate(off));
    }

    #[test]
    fn test_all_deallocated() {
        let mut fx = Fixture::new("empty");
        let mut alloc = SegmentAllocator::new(CHUNK, fx.storage.size());
        assert!(alloc.all_deallocated());

        let a = alloc.allocate(64, &mut fx.storage).unwrap();
        let b = alloc.allocate(3 * CHUNK, &mut fx.storage).unwrap();
        assert!(!alloc.all_deallocated());

        alloc.deallocate(a);
        assert!(!alloc.all_deallocated());
        alloc.deallocate(b);
        assert!(alloc.all_deallocated());
    }

    #[test]
    fn test_serialize_roundtrip_identity() {
        let mut fx = Fixture::new("serde");
        let mut alloc = SegmentAllocator::new(CHUNK, fx.storage.size());

        let keep = alloc.allocate(100, &mut fx.storage).unwrap();
        let gone = alloc.allocate(100, &mut fx.storage).unwrap();
        alloc.allocate(5 * CHUNK, &mut fx.storage).unwrap();
        alloc.deallocate(gone);

        let path = fx.file.with_extension("meta");
        alloc.serialize(&path).unwrap();
        let restored = SegmentAllocator::deserialize(&path, CHUNK).unwrap();
        assert_eq!(alloc, restored);

        // The restored allocator owns the same partition: the freed slot
        // comes back before any fresh one.
        let mut restored = restored;
        let next = restored.allocate(100, &mut fx.storage).unwrap();
        assert_eq!(next, gone);
        assert_ne!(next, keep);

        assert!(SegmentAllocator::deserialize(&path, CHUNK / 2).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
