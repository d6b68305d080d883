//! A high-performance hash table using SIMD-probed control bytes.
//!
//! The table is open-addressing with a flat, power-of-two slot array. Each
//! slot has a one-byte control word: `EMPTY` (0x80) for never-occupied,
//! `TOMBSTONE` (0xFE) for erased, or the top 7 bits of the entry's hash
//! (the "fingerprint") with the sign bit clear for occupied. Probing scans
//! control bytes 16 at a time ([`GROUP_WIDTH`]) with a single SSE2
//! compare/movemask pair, so a group of candidates is filtered down to
//! fingerprint matches before any key comparison runs.
//!
//! [`HashTable<V>`] stores values of type `V` and provides fast insertion,
//! lookup, and removal. This is a low-level structure that requires you to
//! provide the hash value and an equality predicate for each operation
//! (and a re-hash function for operations that may move entries). Prefer
//! the [`HashMap<K, V>`] wrapper for a keyed interface.
//!
//! ## Design
//!
//! A probe starts at the byte index given by the low bits of the hash and
//! walks forward one 16-byte group at a time, wrapping by mask. Because
//! starts are unaligned, the control array carries a 16-byte tail
//! mirroring its first 16 bytes; a group loaded near the end runs into the
//! mirror instead of needing wrap branches, and match positions are
//! brought back in range with a single mask. Within a group, fingerprint
//! matches are verified with the caller's equality predicate; an `EMPTY`
//! byte anywhere in the group proves the key is absent, because insertion
//! never skips over an empty slot.
//!
//! Erasure writes `TOMBSTONE`, never `EMPTY`: converting the slot directly
//! to empty would terminate probe chains that pass through it for other
//! keys. Tombstones are still valid insertion targets, and an insertion
//! remembers the first tombstone it crossed so the new entry lands as
//! close to its home as possible.
//!
//! Fingerprints come from the top bits of the hash, with the sign bit
//! reserved so empty and deleted slots can be found with a bare movemask.
//! Deriving them from the low bits would correlate them with the home
//! index and inflate the false-match rate.
//!
//! All storage lives in one cache-line-aligned allocation:
//! `[ control bytes | slots | group bitmap ]`. The alignment keeps a
//! control group from straddling two cache lines. The trailing bitmap has
//! one bit per 16-slot group, set while the group holds at least one
//! occupied slot; iteration uses it to skip runs of empty groups with a
//! trailing-zeros scan per 64 groups instead of touching their control
//! bytes.
//!
//! The table resizes at 7/8 load, doubling its capacity from a floor of
//! 16. Rehashing moves entries into a fresh tombstone-free block, so the
//! migration probe degenerates to "first empty byte". Erase-heavy
//! workloads can accumulate tombstones without raising `len`; when dead
//! slots would exhaust the free space the table rebuilds at its current
//! capacity instead of growing, which keeps every probe terminating on an
//! empty byte without inflating memory.
//!
//! Concurrency: there is none. The table is a plain data structure owned
//! by whoever holds it; concurrent reads are safe exactly while no
//! mutation is in progress, and any external synchronization is the
//! caller's business.
//!
//! [`HashMap<K, V>`]: crate::hash_map::HashMap

use alloc::alloc::handle_alloc_error;
use core::alloc::Layout;
use core::fmt::Debug;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

#[cfg(target_arch = "x86")]
use core::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;

use cfg_if::cfg_if;

/// Slots scanned per probe step; the width of one SSE2 register.
pub const GROUP_WIDTH: usize = 16;

/// Control bytes are aligned to this so a group never splits across two
/// cache lines.
const CACHE_LINE: usize = 64;

/// Control byte for a never-occupied slot.
///
/// Chosen as 0x80 (sign bit set, low bits clear) so a movemask finds
/// empty-or-deleted slots and a byte compare distinguishes the two.
const EMPTY: u8 = 0x80;

/// Control byte for an erased slot. Does not terminate probes.
const TOMBSTONE: u8 = 0xFE;

#[inline(always)]
fn fingerprint(hash: u64) -> u8 {
    (hash >> 57) as u8
}

#[inline(always)]
fn is_full_byte(ctrl: u8) -> bool {
    ctrl & 0x80 == 0
}

/// Largest `len + tombstones` a capacity supports before a rebuild.
#[inline(always)]
fn max_load(capacity: usize) -> usize {
    // Exact for the power-of-two capacities the table uses.
    capacity / 8 * 7
}

#[inline(always)]
fn bitmap_words(capacity: usize) -> usize {
    (capacity / GROUP_WIDTH).div_ceil(64)
}

cfg_if! {
    if #[cfg(all(
        any(target_arch = "x86", target_arch = "x86_64"),
        target_feature = "sse2"
    ))] {
        /// Bitmask of bytes equal to `byte` in the 16-byte group at `ctrl`.
        ///
        /// # Safety
        ///
        /// `ctrl` must be valid for reads of 16 bytes.
        #[inline(always)]
        unsafe fn match_byte(ctrl: *const u8, byte: u8) -> u16 {
            // SAFETY: The caller guarantees 16 readable bytes; the load
            // tolerates any alignment.
            unsafe {
                let data = _mm_loadu_si128(ctrl as *const __m128i);
                let cmp = _mm_cmpeq_epi8(data, _mm_set1_epi8(byte as i8));
                _mm_movemask_epi8(cmp) as u16
            }
        }

        /// Bitmask of bytes with the sign bit set (empty or deleted) in the
        /// 16-byte group at `ctrl`.
        ///
        /// # Safety
        ///
        /// `ctrl` must be valid for reads of 16 bytes.
        #[inline(always)]
        unsafe fn match_msb(ctrl: *const u8) -> u16 {
            // SAFETY: The caller guarantees 16 readable bytes.
            unsafe {
                let data = _mm_loadu_si128(ctrl as *const __m128i);
                _mm_movemask_epi8(data) as u16
            }
        }
    } else {
        /// Bitmask of bytes equal to `byte` in the 16-byte group at `ctrl`.
        ///
        /// # Safety
        ///
        /// `ctrl` must be valid for reads of 16 bytes.
        #[inline(always)]
        unsafe fn match_byte(ctrl: *const u8, byte: u8) -> u16 {
            let mut mask = 0u16;
            for i in 0..GROUP_WIDTH {
                // SAFETY: The caller guarantees 16 readable bytes.
                if unsafe { *ctrl.add(i) } == byte {
                    mask |= 1 << i;
                }
            }
            mask
        }

        /// Bitmask of bytes with the sign bit set (empty or deleted) in the
        /// 16-byte group at `ctrl`.
        ///
        /// # Safety
        ///
        /// `ctrl` must be valid for reads of 16 bytes.
        #[inline(always)]
        unsafe fn match_msb(ctrl: *const u8) -> u16 {
            let mut mask = 0u16;
            for i in 0..GROUP_WIDTH {
                // SAFETY: The caller guarantees 16 readable bytes.
                if unsafe { *ctrl.add(i) } & 0x80 != 0 {
                    mask |= 1 << i;
                }
            }
            mask
        }
    }
}

/// The error returned by [`HashTable::try_reserve`] when the table cannot
/// grow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TryReserveError {
    /// The computed storage size exceeded the allocator's limits.
    CapacityOverflow,
    /// The allocator refused the request. The table is unchanged.
    AllocError {
        /// The layout that could not be allocated.
        layout: Layout,
    },
}

impl core::fmt::Display for TryReserveError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TryReserveError::CapacityOverflow => {
                write!(f, "requested capacity exceeds maximum storage size")
            }
            TryReserveError::AllocError { layout } => {
                write!(f, "allocation of {} bytes failed", layout.size())
            }
        }
    }
}

impl core::error::Error for TryReserveError {}

#[derive(Debug, Clone, Copy)]
struct DataLayout {
    layout: Layout,
    slots_offset: usize,
    bitmap_offset: usize,
}

impl DataLayout {
    fn try_new<V>(capacity: usize) -> Result<Self, TryReserveError> {
        debug_assert!(capacity == 0 || (capacity.is_power_of_two() && capacity >= GROUP_WIDTH));

        if capacity == 0 {
            return Ok(DataLayout {
                layout: Layout::from_size_align(0, CACHE_LINE)
                    .map_err(|_| TryReserveError::CapacityOverflow)?,
                slots_offset: 0,
                bitmap_offset: 0,
            });
        }

        let ctrl_layout = Layout::from_size_align(capacity + GROUP_WIDTH, CACHE_LINE)
            .map_err(|_| TryReserveError::CapacityOverflow)?;
        let slots_layout = Layout::array::<MaybeUninit<V>>(capacity)
            .map_err(|_| TryReserveError::CapacityOverflow)?;
        let bitmap_layout = Layout::array::<u64>(bitmap_words(capacity))
            .map_err(|_| TryReserveError::CapacityOverflow)?;

        let (layout, slots_offset) = ctrl_layout
            .extend(slots_layout)
            .map_err(|_| TryReserveError::CapacityOverflow)?;
        let (layout, bitmap_offset) = layout
            .extend(bitmap_layout)
            .map_err(|_| TryReserveError::CapacityOverflow)?;

        Ok(DataLayout {
            layout,
            slots_offset,
            bitmap_offset,
        })
    }

    fn new<V>(capacity: usize) -> Self {
        Self::try_new::<V>(capacity).expect("allocation size overflow")
    }
}

/// Outcome of a full probe: either the slot holding a matching entry, or
/// the slot a new entry for this hash should be written to.
enum Probe {
    Found(usize),
    Vacant(usize),
}

/// A high-performance hash table using SIMD-probed control bytes.
///
/// `HashTable<V>` stores values of type `V`. Every operation takes the
/// entry's hash and an equality predicate; operations that may move
/// entries additionally take a function recomputing the hash of a stored
/// value.
///
/// ## Performance characteristics
///
/// - **Memory**: slightly over 1 byte per slot of overhead, plus the size
///   of `V`, at a maximum load factor of 7/8.
pub struct HashTable<V> {
    layout: DataLayout,
    alloc: NonNull<u8>,

    populated: usize,
    tombstones: usize,
    capacity: usize,

    _phantom: core::marker::PhantomData<V>,
}

// SAFETY: The table exclusively owns its allocation and the values inside
// it; there is no interior mutability and no thread affinity, so moving it
// or sharing `&HashTable<V>` across threads is exactly as safe as for `V`
// itself. Shared references only permit reads, which are safe while no
// mutation is in progress.
unsafe impl<V: Send> Send for HashTable<V> {}
// SAFETY: See above.
unsafe impl<V: Sync> Sync for HashTable<V> {}

impl<V> Debug for HashTable<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use alloc::format;
        use alloc::string::String;
        use alloc::vec::Vec;

        if self.capacity == 0 {
            return f
                .debug_struct("HashTable")
                .field("ctrl", &"unallocated")
                .field("populated", &self.populated)
                .field("capacity", &self.capacity)
                .finish();
        }

        // SAFETY: A non-zero capacity guarantees `alloc` points to a live
        // block matching `layout`, so the control slice is readable.
        let ctrl = unsafe { &self.ctrl_ptr().as_ref()[..self.capacity] };
        let groups = ctrl
            .chunks(GROUP_WIDTH)
            .map(|group| {
                group
                    .iter()
                    .map(|&byte| {
                        if byte == EMPTY {
                            String::from("..")
                        } else if byte == TOMBSTONE {
                            String::from("xx")
                        } else {
                            format!("{byte:02x}")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect::<Vec<_>>();

        f.debug_struct("HashTable")
            .field("ctrl", &groups)
            .field("populated", &self.populated)
            .field("tombstones", &self.tombstones)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<V> Clone for HashTable<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        if self.layout.layout.size() == 0 {
            return Self {
                layout: self.layout,
                alloc: NonNull::dangling(),
                populated: 0,
                tombstones: 0,
                capacity: 0,
                _phantom: core::marker::PhantomData,
            };
        }

        // SAFETY: The source table is allocated (size checked above). The
        // raw block is fully populated before a `HashTable` is constructed
        // from it, so a panicking `V::clone` leaks the block rather than
        // letting `Drop` see control bytes for slots that were never
        // written.
        unsafe {
            let raw = alloc::alloc::alloc(self.layout.layout);
            if raw.is_null() {
                handle_alloc_error(self.layout.layout);
            }

            // Control bytes (with mirror tail) and group bitmap are plain
            // bytes; slots need per-value clones.
            core::ptr::copy_nonoverlapping(self.alloc.as_ptr(), raw, self.capacity + GROUP_WIDTH);
            core::ptr::copy_nonoverlapping(
                self.alloc.as_ptr().add(self.layout.bitmap_offset),
                raw.add(self.layout.bitmap_offset),
                self.layout.layout.size() - self.layout.bitmap_offset,
            );

            let src_ctrl = self.ctrl_ptr().as_ref();
            let src_slots = self.slots_ptr().as_ref();
            let dst_slots = raw.add(self.layout.slots_offset) as *mut MaybeUninit<V>;

            for index in 0..self.capacity {
                if is_full_byte(*src_ctrl.get_unchecked(index)) {
                    dst_slots.add(index).write(MaybeUninit::new(
                        src_slots.get_unchecked(index).assume_init_ref().clone(),
                    ));
                }
            }

            Self {
                layout: self.layout,
                alloc: NonNull::new_unchecked(raw),
                populated: self.populated,
                tombstones: self.tombstones,
                capacity: self.capacity,
                _phantom: core::marker::PhantomData,
            }
        }
    }
}

impl<V> Drop for HashTable<V> {
    fn drop(&mut self) {
        // SAFETY: Only slots whose control byte marks them FULL are
        // dropped, and those are initialized by construction. The
        // allocation is only freed when one exists.
        unsafe {
            if core::mem::needs_drop::<V>() && self.populated > 0 {
                for index in 0..self.capacity {
                    if is_full_byte(*self.ctrl_ptr().as_ref().get_unchecked(index)) {
                        self.slots_ptr()
                            .as_mut()
                            .get_unchecked_mut(index)
                            .assume_init_drop();
                    }
                }
            }

            if self.layout.layout.size() != 0 {
                alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout);
            }
        }
    }
}

impl<V> HashTable<V> {
    /// Creates a new hash table with the requested capacity.
    ///
    /// A non-zero request is rounded up to a power of two of at least 16
    /// slots. A request of zero allocates nothing; the first insertion
    /// allocates 16 slots.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            0
        } else {
            capacity.max(GROUP_WIDTH).next_power_of_two()
        };

        let layout = DataLayout::new::<V>(capacity);
        let alloc = match Self::try_allocate_block(&layout, capacity) {
            Ok(alloc) => alloc,
            Err(_) => handle_alloc_error(layout.layout),
        };

        Self {
            layout,
            alloc,
            populated: 0,
            tombstones: 0,
            capacity,
            _phantom: core::marker::PhantomData,
        }
    }

    /// Allocates a block for `layout` and initializes its control bytes to
    /// `EMPTY` and its group bitmap to zero. Slots are left uninitialized.
    fn try_allocate_block(
        layout: &DataLayout,
        capacity: usize,
    ) -> Result<NonNull<u8>, TryReserveError> {
        if layout.layout.size() == 0 {
            return Ok(NonNull::dangling());
        }

        // SAFETY: The layout has non-zero size; a null return is reported
        // as an error without touching any existing state.
        unsafe {
            let raw = alloc::alloc::alloc(layout.layout);
            if raw.is_null() {
                return Err(TryReserveError::AllocError {
                    layout: layout.layout,
                });
            }

            core::ptr::write_bytes(raw, EMPTY, capacity + GROUP_WIDTH);
            core::ptr::write_bytes(
                raw.add(layout.bitmap_offset),
                0x0,
                layout.layout.size() - layout.bitmap_offset,
            );

            Ok(NonNull::new_unchecked(raw))
        }
    }

    fn ctrl_ptr(&self) -> NonNull<[u8]> {
        // SAFETY: `alloc` points to a block matching `layout` whenever the
        // capacity is non-zero; the control array occupies the first
        // `capacity + GROUP_WIDTH` bytes. For a zero capacity this is an
        // empty slice over a dangling (never dereferenced) pointer.
        unsafe {
            NonNull::slice_from_raw_parts(
                self.alloc,
                if self.capacity == 0 {
                    0
                } else {
                    self.capacity + GROUP_WIDTH
                },
            )
        }
    }

    fn slots_ptr(&self) -> NonNull<[MaybeUninit<V>]> {
        // SAFETY: As for `ctrl_ptr`; the slot array begins at
        // `slots_offset` and has `capacity` elements.
        unsafe {
            NonNull::slice_from_raw_parts(
                self.alloc.add(self.layout.slots_offset).cast(),
                self.capacity,
            )
        }
    }

    fn bitmap_ptr(&self) -> NonNull<[u64]> {
        // SAFETY: As for `ctrl_ptr`; the bitmap begins at `bitmap_offset`
        // with one word per 64 groups.
        unsafe {
            NonNull::slice_from_raw_parts(
                self.alloc.add(self.layout.bitmap_offset).cast(),
                bitmap_words(self.capacity),
            )
        }
    }

    /// Returns the number of elements in the table.
    pub fn len(&self) -> usize {
        self.populated
    }

    /// Returns `true` if the table contains no elements.
    pub fn is_empty(&self) -> bool {
        self.populated == 0
    }

    /// Returns the number of allocated slots.
    ///
    /// This is zero or a power of two of at least 16. The table rebuilds
    /// when `len` would exceed 7/8 of it.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Removes all elements from the table, retaining its capacity.
    pub fn clear(&mut self) {
        // SAFETY: Slots are dropped exactly where a FULL control byte
        // guarantees initialization, then all metadata is reset.
        unsafe {
            if core::mem::needs_drop::<V>() && self.populated > 0 {
                for index in 0..self.capacity {
                    if is_full_byte(*self.ctrl_ptr().as_ref().get_unchecked(index)) {
                        self.slots_ptr()
                            .as_mut()
                            .get_unchecked_mut(index)
                            .assume_init_drop();
                    }
                }
            }

            if self.layout.layout.size() != 0 {
                core::ptr::write_bytes(self.alloc.as_ptr(), EMPTY, self.capacity + GROUP_WIDTH);
                core::ptr::write_bytes(
                    self.alloc.as_ptr().add(self.layout.bitmap_offset),
                    0x0,
                    self.layout.layout.size() - self.layout.bitmap_offset,
                );
            }
        }

        self.populated = 0;
        self.tombstones = 0;
    }

    /// Finds a value in the table by hash and equality predicate.
    ///
    /// Returns a reference to the value if found, or `None` if no matching
    /// value exists.
    #[inline]
    pub fn find(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&V> {
        if self.populated == 0 {
            return None;
        }

        // SAFETY: A populated table is allocated with initialized control
        // bytes, and the load invariant guarantees an EMPTY byte exists,
        // so the probe terminates.
        let index = unsafe { self.probe_find(hash, &eq)? };

        // SAFETY: `probe_find` only returns FULL, in-bounds slots.
        Some(unsafe { self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref() })
    }

    /// Finds a value in the table, returning a mutable reference.
    #[inline]
    pub fn find_mut(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&mut V> {
        if self.populated == 0 {
            return None;
        }

        // SAFETY: As in `find`.
        let index = unsafe { self.probe_find(hash, &eq)? };

        // SAFETY: `probe_find` only returns FULL, in-bounds slots.
        Some(unsafe {
            self.slots_ptr()
                .as_mut()
                .get_unchecked_mut(index)
                .assume_init_mut()
        })
    }

    /// Removes and returns a value from the table.
    ///
    /// The erased slot becomes a tombstone rather than an empty slot, so
    /// probe chains running through it stay intact. Erase-heavy workloads
    /// therefore degrade probing gradually until the table rebuilds itself
    /// on a later insertion.
    pub fn remove(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<V> {
        if self.populated == 0 {
            return None;
        }

        // SAFETY: As in `find`.
        let index = unsafe { self.probe_find(hash, &eq)? };

        // SAFETY: `probe_find` only returns FULL, in-bounds slots.
        Some(unsafe { self.remove_at(index) })
    }

    /// Gets an entry for the given hash and equality predicate.
    ///
    /// May rebuild the table before probing (to grow, or to clear
    /// accumulated tombstones), which is why it takes `rehash`. References
    /// into the table obtained before this call are invalidated.
    #[inline]
    pub fn entry(
        &mut self,
        hash: u64,
        eq: impl Fn(&V) -> bool,
        rehash: impl Fn(&V) -> u64,
    ) -> Entry<'_, V> {
        self.maybe_resize_rehash(&rehash);

        // SAFETY: `maybe_resize_rehash` guarantees an allocated table with
        // at least one EMPTY byte remaining.
        match unsafe { self.probe_insert(hash, &eq) } {
            Probe::Found(index) => Entry::Occupied(OccupiedEntry { table: self, index }),
            Probe::Vacant(index) => Entry::Vacant(VacantEntry {
                table: self,
                hash,
                index,
            }),
        }
    }

    /// Retains only the values for which the predicate returns `true`.
    ///
    /// Visits every live value exactly once in slot order; rejected values
    /// are erased as if by [`remove`].
    ///
    /// [`remove`]: HashTable::remove
    pub fn retain(&mut self, mut f: impl FnMut(&mut V) -> bool) {
        for index in 0..self.capacity {
            // SAFETY: `index` is in bounds and a FULL control byte
            // guarantees the slot is initialized. `remove_at` does not
            // shift other entries, so the scan order stays valid.
            unsafe {
                if is_full_byte(*self.ctrl_ptr().as_ref().get_unchecked(index)) {
                    let keep = f(self
                        .slots_ptr()
                        .as_mut()
                        .get_unchecked_mut(index)
                        .assume_init_mut());
                    if !keep {
                        drop(self.remove_at(index));
                    }
                }
            }
        }
    }

    /// Reserves capacity for at least `additional` more elements.
    ///
    /// Rebuilds immediately if the current capacity cannot hold
    /// `len + additional` entries under the 7/8 load bound.
    pub fn reserve(&mut self, additional: usize, rehash: impl Fn(&V) -> u64) {
        if let Err(err) = self.try_reserve(additional, rehash) {
            match err {
                TryReserveError::CapacityOverflow => panic!("capacity overflow"),
                TryReserveError::AllocError { layout } => handle_alloc_error(layout),
            }
        }
    }

    /// Fallible [`reserve`]: reports allocation failure instead of
    /// aborting. On error the table is unchanged.
    ///
    /// [`reserve`]: HashTable::reserve
    pub fn try_reserve(
        &mut self,
        additional: usize,
        rehash: impl Fn(&V) -> u64,
    ) -> Result<(), TryReserveError> {
        let required = self
            .populated
            .checked_add(additional)
            .ok_or(TryReserveError::CapacityOverflow)?;
        let needed = Self::capacity_for(required)?;
        if needed > self.capacity {
            self.try_resize_rehash(needed, &rehash)?;
        }
        Ok(())
    }

    /// Shrinks the table to the smallest capacity that holds its current
    /// contents, deallocating entirely when empty.
    pub fn shrink_to_fit(&mut self, rehash: impl Fn(&V) -> u64) {
        if self.populated == 0 {
            if self.layout.layout.size() != 0 {
                // SAFETY: The allocation matches `layout` and no live
                // values remain in it.
                unsafe {
                    alloc::alloc::dealloc(self.alloc.as_ptr(), self.layout.layout);
                }
                self.layout = DataLayout::new::<V>(0);
                self.alloc = NonNull::dangling();
                self.capacity = 0;
                self.tombstones = 0;
            }
            return;
        }

        let needed = Self::capacity_for(self.populated).expect("allocation size overflow");
        if needed < self.capacity {
            self.do_resize_rehash(needed, &rehash);
        }
    }

    /// Smallest valid capacity whose 7/8 load bound admits `required`
    /// entries.
    fn capacity_for(required: usize) -> Result<usize, TryReserveError> {
        if required == 0 {
            return Ok(0);
        }

        required
            .div_ceil(7)
            .checked_mul(8)
            .and_then(usize::checked_next_power_of_two)
            .map(|capacity| capacity.max(GROUP_WIDTH))
            .ok_or(TryReserveError::CapacityOverflow)
    }

    /// Walks control groups from the hash's home index looking for a
    /// matching value.
    ///
    /// # Safety
    ///
    /// The capacity must be non-zero and at least one control byte must be
    /// EMPTY (the load invariant), or the walk will not terminate.
    #[inline]
    unsafe fn probe_find(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<usize> {
        let mask = self.capacity - 1;
        let fp = fingerprint(hash);
        let mut group_base = (hash as usize) & mask;

        // SAFETY: `group_base <= mask` always, and the control array
        // extends GROUP_WIDTH mirror bytes past `capacity`, so each
        // 16-byte group load is in bounds. Candidate indices are wrapped
        // by `mask` before slot access, and a fingerprint byte (sign bit
        // clear) guarantees the slot is initialized.
        unsafe {
            let ctrl = self.ctrl_ptr().as_ref().as_ptr();
            loop {
                let group = ctrl.add(group_base);

                let mut candidates = match_byte(group, fp);
                while candidates != 0 {
                    let index = (group_base + candidates.trailing_zeros() as usize) & mask;
                    candidates &= candidates - 1;

                    if eq(self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref()) {
                        return Some(index);
                    }
                }

                if match_byte(group, EMPTY) != 0 {
                    return None;
                }

                group_base = (group_base + GROUP_WIDTH) & mask;
            }
        }
    }

    /// Full probe for insertion: finds the matching slot, or the slot a
    /// new entry should occupy (the first tombstone crossed, if any,
    /// otherwise the first empty byte).
    ///
    /// # Safety
    ///
    /// As for [`probe_find`](Self::probe_find).
    #[inline]
    unsafe fn probe_insert(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Probe {
        let mask = self.capacity - 1;
        let fp = fingerprint(hash);
        let mut group_base = (hash as usize) & mask;
        let mut first_tombstone: Option<usize> = None;

        // SAFETY: As in `probe_find`.
        unsafe {
            let ctrl = self.ctrl_ptr().as_ref().as_ptr();
            loop {
                let group = ctrl.add(group_base);

                let mut candidates = match_byte(group, fp);
                while candidates != 0 {
                    let index = (group_base + candidates.trailing_zeros() as usize) & mask;
                    candidates &= candidates - 1;

                    if eq(self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref()) {
                        return Probe::Found(index);
                    }
                }

                let empties = match_byte(group, EMPTY);
                if empties != 0 {
                    let empty_index = (group_base + empties.trailing_zeros() as usize) & mask;
                    return Probe::Vacant(first_tombstone.unwrap_or(empty_index));
                }

                if first_tombstone.is_none() {
                    let tombs = match_byte(group, TOMBSTONE);
                    if tombs != 0 {
                        first_tombstone =
                            Some((group_base + tombs.trailing_zeros() as usize) & mask);
                    }
                }

                group_base = (group_base + GROUP_WIDTH) & mask;
            }
        }
    }

    /// First EMPTY byte on the probe path. Only valid on a tombstone-free
    /// table (rehash destinations), where it is the whole insertion probe.
    ///
    /// # Safety
    ///
    /// As for [`probe_find`](Self::probe_find); additionally the table
    /// must contain no tombstones.
    #[inline]
    unsafe fn find_insert_slot(&self, hash: u64) -> usize {
        debug_assert_eq!(self.tombstones, 0);
        let mask = self.capacity - 1;
        let mut group_base = (hash as usize) & mask;

        // SAFETY: As in `probe_find`.
        unsafe {
            let ctrl = self.ctrl_ptr().as_ref().as_ptr();
            loop {
                let empties = match_byte(ctrl.add(group_base), EMPTY);
                if empties != 0 {
                    return (group_base + empties.trailing_zeros() as usize) & mask;
                }
                group_base = (group_base + GROUP_WIDTH) & mask;
            }
        }
    }

    /// Writes a control byte, mirroring writes to the first group into the
    /// sentinel tail.
    ///
    /// # Safety
    ///
    /// `index` must be less than the capacity.
    #[inline(always)]
    unsafe fn set_ctrl(&mut self, index: usize, byte: u8) {
        // SAFETY: The caller bounds `index`; the mirror index is inside
        // the `capacity + GROUP_WIDTH` control array by construction.
        unsafe {
            let ctrl = self.ctrl_ptr().as_mut();
            *ctrl.get_unchecked_mut(index) = byte;
            if index < GROUP_WIDTH {
                *ctrl.get_unchecked_mut(index + self.capacity) = byte;
            }
        }
    }

    /// Marks a group as holding at least one occupied slot.
    ///
    /// # Safety
    ///
    /// `group` must be less than `capacity / GROUP_WIDTH`.
    #[inline(always)]
    unsafe fn mark_group(&mut self, group: usize) {
        // SAFETY: The caller bounds `group`, so the word index is within
        // the bitmap.
        unsafe {
            *self.bitmap_ptr().as_mut().get_unchecked_mut(group / 64) |= 1u64 << (group % 64);
        }
    }

    /// Clears a group's occupancy bit if the group no longer holds any
    /// occupied slot.
    ///
    /// # Safety
    ///
    /// `group` must be less than `capacity / GROUP_WIDTH`.
    #[inline(always)]
    unsafe fn maybe_clear_group(&mut self, group: usize) {
        // SAFETY: Aligned group loads never cross `capacity` because the
        // capacity is a multiple of GROUP_WIDTH; the bitmap word index is
        // bounded as in `mark_group`.
        unsafe {
            let base = self.ctrl_ptr().as_ref().as_ptr().add(group * GROUP_WIDTH);
            if match_msb(base) == u16::MAX {
                *self.bitmap_ptr().as_mut().get_unchecked_mut(group / 64) &=
                    !(1u64 << (group % 64));
            }
        }
    }

    /// Erases the entry at `index` and returns its value.
    ///
    /// # Safety
    ///
    /// The slot at `index` must be FULL.
    unsafe fn remove_at(&mut self, index: usize) -> V {
        // SAFETY: The caller guarantees a FULL, in-bounds slot, so the
        // read is of an initialized value and the control/bitmap updates
        // are in range.
        unsafe {
            let value = self.slots_ptr().as_ref().get_unchecked(index).assume_init_read();

            self.set_ctrl(index, TOMBSTONE);
            self.populated -= 1;
            self.tombstones += 1;
            self.maybe_clear_group(index / GROUP_WIDTH);

            value
        }
    }

    /// Ensures the table can absorb one more insertion: allocates on first
    /// use, grows at 7/8 load, and rebuilds in place when tombstones would
    /// otherwise exhaust the free slots (which would break probe
    /// termination).
    #[inline]
    fn maybe_resize_rehash(&mut self, rehash: &dyn Fn(&V) -> u64) {
        if self.capacity == 0 {
            self.do_resize_rehash(GROUP_WIDTH, rehash);
        } else if self.populated + self.tombstones >= max_load(self.capacity) {
            self.grow_or_compact(rehash);
        }
    }

    #[cold]
    #[inline(never)]
    fn grow_or_compact(&mut self, rehash: &dyn Fn(&V) -> u64) {
        let new_capacity = if self.populated >= max_load(self.capacity) {
            self.capacity * 2
        } else {
            // Live entries alone fit comfortably; the space is eaten by
            // tombstones. Rebuilding at the same size discards them.
            self.capacity
        };
        self.do_resize_rehash(new_capacity, rehash);
    }

    #[cold]
    #[inline(never)]
    fn do_resize_rehash(&mut self, new_capacity: usize, rehash: &dyn Fn(&V) -> u64) {
        if let Err(err) = self.try_resize_rehash(new_capacity, rehash) {
            match err {
                TryReserveError::CapacityOverflow => panic!("capacity overflow"),
                TryReserveError::AllocError { layout } => handle_alloc_error(layout),
            }
        }
    }

    /// Moves every live entry into a freshly allocated block of
    /// `new_capacity` slots. Tombstones are not carried over.
    ///
    /// On allocation failure the table is untouched. If `rehash` panics
    /// mid-migration the already-moved entries are owned by the new block
    /// and the rest leak with the old one; the table stays valid and
    /// safely droppable either way.
    fn try_resize_rehash(
        &mut self,
        new_capacity: usize,
        rehash: &dyn Fn(&V) -> u64,
    ) -> Result<(), TryReserveError> {
        debug_assert!(
            new_capacity >= GROUP_WIDTH && new_capacity.is_power_of_two(),
            "invalid capacity {new_capacity}"
        );
        debug_assert!(self.populated <= max_load(new_capacity));

        let new_layout = DataLayout::try_new::<V>(new_capacity)?;
        let new_alloc = Self::try_allocate_block(&new_layout, new_capacity)?;

        let old_layout = core::mem::replace(&mut self.layout, new_layout);
        let old_alloc = core::mem::replace(&mut self.alloc, new_alloc);
        let old_capacity = core::mem::replace(&mut self.capacity, new_capacity);
        self.tombstones = 0;

        if old_capacity == 0 {
            return Ok(());
        }

        // SAFETY: The old block stays alive until every FULL slot has been
        // moved out of it. Values are moved (read then re-written), never
        // duplicated: the old block is deallocated without running drops,
        // because ownership transferred to the new block. Destination
        // probing terminates since the fresh control bytes are all EMPTY
        // and `populated < new_capacity`.
        unsafe {
            let old_ctrl = old_alloc.as_ptr() as *const u8;
            let old_slots = old_alloc.as_ptr().add(old_layout.slots_offset) as *const V;

            for index in 0..old_capacity {
                if !is_full_byte(*old_ctrl.add(index)) {
                    continue;
                }

                let value = old_slots.add(index).read();
                let hash = rehash(&value);

                let dest = self.find_insert_slot(hash);
                self.slots_ptr()
                    .as_mut()
                    .get_unchecked_mut(dest)
                    .write(value);
                self.set_ctrl(dest, fingerprint(hash));
                self.mark_group(dest / GROUP_WIDTH);
            }

            if old_layout.layout.size() != 0 {
                alloc::alloc::dealloc(old_alloc.as_ptr(), old_layout.layout);
            }
        }

        Ok(())
    }

    /// Next FULL slot at or after `from`, in ascending index order.
    ///
    /// The group the cursor is inside is scanned directly; beyond it the
    /// group-occupancy bitmap collapses runs of empty groups into one
    /// trailing-zeros scan per 64 groups.
    fn next_occupied(&self, from: usize) -> Option<usize> {
        if from >= self.capacity {
            return None;
        }

        // SAFETY: Group indices stay below `capacity / GROUP_WIDTH`, so
        // every aligned 16-byte control load is in bounds, as is each
        // bitmap word access.
        unsafe {
            let ctrl = self.ctrl_ptr().as_ref().as_ptr();
            let mut group = from / GROUP_WIDTH;

            let full =
                !match_msb(ctrl.add(group * GROUP_WIDTH)) & (u16::MAX << (from % GROUP_WIDTH));
            if full != 0 {
                return Some(group * GROUP_WIDTH + full.trailing_zeros() as usize);
            }

            group += 1;
            if group >= self.capacity / GROUP_WIDTH {
                return None;
            }

            let bitmap = self.bitmap_ptr().as_ref();
            let mut word_index = group / 64;
            let mut word = *bitmap.get_unchecked(word_index) & (u64::MAX << (group % 64));

            loop {
                if word != 0 {
                    let group = word_index * 64 + word.trailing_zeros() as usize;
                    let full = !match_msb(ctrl.add(group * GROUP_WIDTH));
                    // An occupancy bit is only set while the group holds a
                    // FULL slot.
                    debug_assert!(full != 0);
                    return Some(group * GROUP_WIDTH + full.trailing_zeros() as usize);
                }

                word_index += 1;
                if word_index >= bitmap.len() {
                    return None;
                }
                word = *bitmap.get_unchecked(word_index);
            }
        }
    }

    /// Returns an iterator over all values in the table.
    ///
    /// Values are yielded in slot order, which is unspecified and may
    /// change after any mutation.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            table: self,
            index: 0,
        }
    }
}

/// A view into a single slot of the table, which may be vacant or
/// occupied.
///
/// Constructed by the [`entry`] method on [`HashTable`].
///
/// [`entry`]: HashTable::entry
pub enum Entry<'a, V> {
    /// No matching value is present.
    Vacant(VacantEntry<'a, V>),
    /// A matching value is present.
    Occupied(OccupiedEntry<'a, V>),
}

impl<'a, V> Entry<'a, V> {
    /// Inserts `default` if the entry is vacant; returns a mutable
    /// reference to the value either way.
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Inserts the closure's value if the entry is vacant; returns a
    /// mutable reference to the value either way.
    pub fn or_insert_with(self, default: impl FnOnce() -> V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Applies `f` to the value if the entry is occupied, returning a
    /// mutable reference to it, or `None` if vacant.
    pub fn and_modify(self, f: impl FnOnce(&mut V)) -> Option<&'a mut V> {
        match self {
            Entry::Occupied(entry) => {
                let value = entry.into_mut();
                f(value);
                Some(value)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Inserts `V::default()` if the entry is vacant; returns a mutable
    /// reference to the value either way.
    pub fn or_default(self) -> &'a mut V
    where
        V: Default,
    {
        self.or_insert_with(Default::default)
    }
}

/// A view into a vacant slot, created by [`HashTable::entry`].
pub struct VacantEntry<'a, V> {
    table: &'a mut HashTable<V>,
    hash: u64,
    index: usize,
}

impl<'a, V> VacantEntry<'a, V> {
    /// Inserts a value and returns a mutable reference to it.
    ///
    /// The slot was chosen by the probe: the first tombstone on the path
    /// from the hash's home group, or the first empty byte if the path
    /// crossed none.
    pub fn insert(self, value: V) -> &'a mut V {
        let index = self.index;

        // SAFETY: `probe_insert` produced `index` as an in-bounds EMPTY or
        // TOMBSTONE slot; writing the value and fingerprint makes it FULL,
        // and the occupancy/tombstone bookkeeping matches that transition.
        unsafe {
            if *self.table.ctrl_ptr().as_ref().get_unchecked(index) == TOMBSTONE {
                self.table.tombstones -= 1;
            }

            self.table.set_ctrl(index, fingerprint(self.hash));
            self.table.mark_group(index / GROUP_WIDTH);
            self.table.populated += 1;

            self.table
                .slots_ptr()
                .as_mut()
                .get_unchecked_mut(index)
                .write(value)
        }
    }
}

/// A view into an occupied slot, created by [`HashTable::entry`].
pub struct OccupiedEntry<'a, V> {
    table: &'a mut HashTable<V>,
    index: usize,
}

// Safety invariant for OccupiedEntry methods: an `OccupiedEntry` is only
// created from a probe that found a FULL slot, so `index` is in bounds and
// the slot holds an initialized value for the entry's whole lifetime (the
// `&mut` borrow of the table prevents interleaved mutation).
impl<'a, V> OccupiedEntry<'a, V> {
    /// Gets a reference to the value in the entry.
    pub fn get(&self) -> &V {
        // SAFETY: See the invariant comment above this impl block.
        unsafe {
            self.table
                .slots_ptr()
                .as_ref()
                .get_unchecked(self.index)
                .assume_init_ref()
        }
    }

    /// Gets a mutable reference to the value in the entry.
    pub fn get_mut(&mut self) -> &mut V {
        // SAFETY: See the invariant comment above this impl block.
        unsafe {
            self.table
                .slots_ptr()
                .as_mut()
                .get_unchecked_mut(self.index)
                .assume_init_mut()
        }
    }

    /// Converts the entry into a mutable reference tied to the table's
    /// borrow.
    pub fn into_mut(self) -> &'a mut V {
        // SAFETY: See the invariant comment above this impl block.
        unsafe {
            self.table
                .slots_ptr()
                .as_mut()
                .get_unchecked_mut(self.index)
                .assume_init_mut()
        }
    }

    /// Removes the entry from the table and returns its value.
    pub fn remove(self) -> V {
        // SAFETY: See the invariant comment above this impl block.
        unsafe { self.table.remove_at(self.index) }
    }
}

/// An iterator over the values in a [`HashTable`], created by
/// [`HashTable::iter`].
pub struct Iter<'a, V> {
    table: &'a HashTable<V>,
    index: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.table.next_occupied(self.index)?;
        self.index = index + 1;

        // SAFETY: `next_occupied` only returns FULL, in-bounds slots.
        Some(unsafe {
            self.table
                .slots_ptr()
                .as_ref()
                .get_unchecked(index)
                .assume_init_ref()
        })
    }
}

/// Point-in-time table diagnostics.
#[cfg(feature = "stats")]
#[derive(Debug, Clone)]
pub struct DebugStats {
    /// Number of live entries.
    pub populated: usize,
    /// Allocated slots.
    pub capacity: usize,
    /// Entries the current capacity admits before a rebuild.
    pub max_load: usize,
    /// Erased slots awaiting reuse or the next rebuild.
    pub tombstones: usize,
    /// `populated / max_load`.
    pub load_factor: f64,
    /// Size of the storage block in bytes.
    pub total_bytes: usize,
}

#[cfg(feature = "stats")]
impl DebugStats {
    /// Pretty-print the statistics.
    #[cfg(feature = "std")]
    pub fn print(&self) {
        println!("=== Hash Table Debug Statistics ===");
        println!(
            "Population: {}/{} ({:.2}% load factor)",
            self.populated,
            self.max_load,
            self.load_factor * 100.0
        );
        println!(
            "Slots: {} ({} tombstoned, {} empty)",
            self.capacity,
            self.tombstones,
            self.capacity - self.populated - self.tombstones
        );
        println!("Total Allocated: {} bytes", self.total_bytes);
    }
}

/// Distribution of probe lengths, in groups scanned per present entry.
#[cfg(feature = "stats")]
pub struct ProbeHistogram {
    #[cfg_attr(not(feature = "std"), allow(dead_code))]
    populated: usize,
    /// `groups_probed[n]` counts entries found after scanning `n + 1`
    /// groups from their home index.
    pub groups_probed: [usize; GROUP_WIDTH],
    /// Entries whose probe runs longer than the histogram tracks.
    pub long_probes: usize,
}

#[cfg(feature = "stats")]
impl ProbeHistogram {
    /// Pretty-print the histogram.
    #[cfg(feature = "std")]
    pub fn print(&self) {
        let max = self.groups_probed.iter().copied().max().unwrap_or(0);
        if max == 0 {
            println!("probe histogram: empty");
            return;
        }

        println!("groups probed per lookup ({} entries):", self.populated);
        for (i, &count) in self.groups_probed.iter().enumerate() {
            let bar_len = (count * 60).div_ceil(max);
            println!("{:>2} | {} ({})", i + 1, "█".repeat(bar_len), count);
        }
        println!(" > | {}", self.long_probes);
    }
}

#[cfg(feature = "stats")]
impl<V> HashTable<V> {
    /// Returns point-in-time diagnostics for debugging and tuning.
    pub fn debug_stats(&self) -> DebugStats {
        let max_load = max_load(self.capacity);
        DebugStats {
            populated: self.populated,
            capacity: self.capacity,
            max_load,
            tombstones: self.tombstones,
            load_factor: if max_load == 0 {
                0.0
            } else {
                self.populated as f64 / max_load as f64
            },
            total_bytes: self.layout.layout.size(),
        }
    }

    /// Computes how many groups a lookup scans to reach each present
    /// entry.
    pub fn probe_histogram(&self, rehash: impl Fn(&V) -> u64) -> ProbeHistogram {
        let mut histogram = ProbeHistogram {
            populated: self.populated,
            groups_probed: [0; GROUP_WIDTH],
            long_probes: 0,
        };

        if self.populated == 0 {
            return histogram;
        }

        let mask = self.capacity - 1;
        for index in 0..self.capacity {
            // SAFETY: `index` is in bounds; a FULL byte guarantees the
            // slot is initialized.
            unsafe {
                if !is_full_byte(*self.ctrl_ptr().as_ref().get_unchecked(index)) {
                    continue;
                }
                let hash =
                    rehash(self.slots_ptr().as_ref().get_unchecked(index).assume_init_ref());
                let offset = index.wrapping_sub((hash as usize) & mask) & mask;
                let probes = offset / GROUP_WIDTH + 1;
                if probes <= GROUP_WIDTH {
                    histogram.groups_probed[probes - 1] += 1;
                } else {
                    histogram.long_probes += 1;
                }
            }
        }

        histogram
    }
}

#[cfg(test)]
mod tests {
    use core::hash::Hasher;
    use core::sync::atomic::AtomicUsize;
    use core::sync::atomic::Ordering;

    use rand::TryRngCore;
    use rand::rngs::OsRng;
    use siphasher::sip::SipHasher;

    use super::*;

    struct HashState {
        k0: u64,
        k1: u64,
    }

    impl HashState {
        fn default() -> Self {
            let mut rng = OsRng;
            Self {
                k0: rng.try_next_u64().unwrap(),
                k1: rng.try_next_u64().unwrap(),
            }
        }
    }

    #[derive(Debug, PartialEq, Eq, Clone)]
    struct Item {
        key: u64,
        value: i32,
    }

    fn hash_key(state: &HashState, key: u64) -> u64 {
        let mut h = SipHasher::new_with_keys(state.k0, state.k1);
        h.write_u64(key);
        h.finish()
    }

    fn insert_item(table: &mut HashTable<Item>, state: &HashState, key: u64, value: i32) {
        let hash = hash_key(state, key);
        match table.entry(hash, |v| v.key == key, |v| hash_key(state, v.key)) {
            Entry::Vacant(entry) => {
                entry.insert(Item { key, value });
            }
            Entry::Occupied(_) => panic!("unexpected occupied entry: {:#?}", table),
        }
    }

    #[test]
    fn insert_and_find() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(0);

        for k in 0..32u64 {
            insert_item(&mut table, &state, k, (k as i32) * 2);
        }
        assert_eq!(table.len(), 32);

        for k in 0..32u64 {
            let hash = hash_key(&state, k);
            assert_eq!(
                table.find(hash, |v| v.key == k),
                Some(&Item {
                    key: k,
                    value: (k as i32) * 2
                }),
                "{:#?}",
                table
            );
        }

        let miss_hash = hash_key(&state, 999);
        assert!(table.find(miss_hash, |v| v.key == 999).is_none());
    }

    #[test]
    fn duplicate_entry_is_occupied() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        let k = 42u64;
        let hash = hash_key(&state, k);

        insert_item(&mut table, &state, k, 7);

        match table.entry(hash, |v| v.key == k, |v| hash_key(&state, v.key)) {
            Entry::Occupied(mut occ) => {
                assert_eq!(occ.get().value, 7);
                occ.get_mut().value = 11;
            }
            Entry::Vacant(_) => panic!("should be occupied: {:#?}", table),
        }

        assert_eq!(table.len(), 1);
        assert_eq!(table.find(hash, |v| v.key == k).unwrap().value, 11);
    }

    #[test]
    fn find_mut_and_modify() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        for k in 0..5u64 {
            insert_item(&mut table, &state, k, 1);
        }

        for k in 0..5u64 {
            let hash = hash_key(&state, k);
            if let Some(v) = table.find_mut(hash, |v| v.key == k) {
                v.value += 9;
            }
        }
        for k in 0..5u64 {
            let hash = hash_key(&state, k);
            assert_eq!(table.find(hash, |v| v.key == k).unwrap().value, 10);
        }
    }

    #[test]
    fn remove_items() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        for k in 0..8u64 {
            insert_item(&mut table, &state, k, k as i32);
        }
        assert_eq!(table.len(), 8);

        for k in [0u64, 3, 7] {
            let hash = hash_key(&state, k);
            let removed = table.remove(hash, |v| v.key == k).expect("should remove");
            assert_eq!(removed.key, k);
        }
        assert_eq!(table.len(), 5);

        // Erase is idempotent: a second attempt reports absence.
        let hash = hash_key(&state, 3);
        assert!(table.remove(hash, |v| v.key == 3).is_none());
        assert_eq!(table.len(), 5);

        let hash = hash_key(&state, 1000);
        assert!(table.remove(hash, |v| v.key == 1000).is_none());
    }

    #[test]
    fn capacity_rounding() {
        assert_eq!(HashTable::<Item>::with_capacity(0).capacity(), 0);
        assert_eq!(HashTable::<Item>::with_capacity(1).capacity(), 16);
        assert_eq!(HashTable::<Item>::with_capacity(16).capacity(), 16);
        assert_eq!(HashTable::<Item>::with_capacity(17).capacity(), 32);
        assert_eq!(HashTable::<Item>::with_capacity(100).capacity(), 128);
    }

    #[test]
    fn grows_at_seven_eighths() {
        // Slot-index hash: keys 0..15 land in distinct home slots.
        let mut table: HashTable<Item> = HashTable::with_capacity(16);
        assert_eq!(table.capacity(), 16);

        for k in 0..15u64 {
            match table.entry(k, |v| v.key == k, |v| v.key) {
                Entry::Vacant(entry) => {
                    entry.insert(Item {
                        key: k,
                        value: (k as i32) * 10,
                    });
                }
                Entry::Occupied(_) => unreachable!(),
            }
        }

        // The fifteenth insertion crossed the 7/8 bound and doubled the
        // table.
        assert_eq!(table.len(), 15);
        assert_eq!(table.capacity(), 32);
        for k in 0..15u64 {
            assert_eq!(
                table.find(k, |v| v.key == k).map(|v| v.value),
                Some((k as i32) * 10),
                "{:#?}",
                table
            );
        }
    }

    #[test]
    fn tombstone_preserves_probe_chain() {
        // All three keys hash to home index 1 in a 16-slot table.
        let hash = |k: u64| k & 0xF;
        let mut table: HashTable<Item> = HashTable::with_capacity(16);

        for k in [1u64, 17, 33] {
            match table.entry(hash(k), |v| v.key == k, |v| hash(v.key)) {
                Entry::Vacant(entry) => {
                    entry.insert(Item {
                        key: k,
                        value: k as i32,
                    });
                }
                Entry::Occupied(_) => unreachable!(),
            }
        }

        assert!(table.remove(hash(17), |v| v.key == 17).is_some());
        assert_eq!(table.len(), 2);

        // Erasing the middle of the chain must not hide the later entry.
        assert!(table.find(hash(1), |v| v.key == 1).is_some(), "{:#?}", table);
        assert!(table.find(hash(33), |v| v.key == 33).is_some(), "{:#?}", table);
    }

    #[test]
    fn colliding_homes_with_distinct_fingerprints() {
        // Low hash bits constant, top 7 bits varying: every key probes
        // from slot 0 but carries its own fingerprint.
        let hash = |k: u64| k << 57;
        let mut table: HashTable<Item> = HashTable::with_capacity(16);

        for k in 0..=16u64 {
            match table.entry(hash(k), |v| v.key == k, |v| hash(v.key)) {
                Entry::Vacant(entry) => {
                    entry.insert(Item {
                        key: k,
                        value: k as i32,
                    });
                }
                Entry::Occupied(_) => unreachable!(),
            }
        }

        assert_eq!(table.len(), 17);
        assert!(table.capacity() >= 32);
        for k in 0..=16u64 {
            assert!(
                table.find(hash(k), |v| v.key == k).is_some(),
                "key {k} lost: {:#?}",
                table
            );
        }
    }

    #[test]
    fn degenerate_constant_hash() {
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        for k in 0..65u64 {
            match table.entry(0, |v| v.key == k, |_| 0) {
                Entry::Vacant(entry) => {
                    entry.insert(Item {
                        key: k,
                        value: k as i32,
                    });
                }
                Entry::Occupied(_) => unreachable!(),
            }
        }

        assert_eq!(table.len(), 65);
        for k in 0..65u64 {
            assert!(table.find(0, |v| v.key == k).is_some());
        }
        assert!(table.find(0, |v| v.key == 65).is_none());
    }

    #[test]
    fn iteration_yields_each_entry_once() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        for k in 0..10u64 {
            insert_item(&mut table, &state, k, k as i32);
        }
        for k in [3u64, 7] {
            let hash = hash_key(&state, k);
            table.remove(hash, |v| v.key == k).unwrap();
        }

        let mut seen: std::collections::HashSet<u64> = table.iter().map(|item| item.key).collect();
        assert_eq!(seen.len(), 8);
        for k in [0u64, 1, 2, 4, 5, 6, 8, 9] {
            assert!(seen.remove(&k), "missing key {k}");
        }
        assert!(seen.is_empty());
    }

    #[test]
    fn iteration_skips_empty_groups() {
        // A sparse table with entries thousands of slots apart; the group
        // bitmap has to carry the iterator across the gaps.
        let hash = |k: u64| k;
        let mut table: HashTable<Item> = HashTable::with_capacity(1 << 14);
        for k in [17u64, 9000, 16300] {
            match table.entry(hash(k), |v| v.key == k, |v| hash(v.key)) {
                Entry::Vacant(entry) => {
                    entry.insert(Item { key: k, value: 0 });
                }
                Entry::Occupied(_) => unreachable!(),
            }
        }

        let keys: Vec<u64> = table.iter().map(|item| item.key).collect();
        assert_eq!(keys, vec![17, 9000, 16300]);
    }

    #[test]
    fn iteration_on_empty_table() {
        let table: HashTable<Item> = HashTable::with_capacity(0);
        assert!(table.iter().next().is_none());

        let table: HashTable<Item> = HashTable::with_capacity(64);
        assert!(table.iter().next().is_none());
    }

    #[test]
    fn clear_retains_capacity() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        for k in 0..20u64 {
            insert_item(&mut table, &state, k, 0);
        }
        let capacity = table.capacity();

        table.clear();
        assert_eq!(table.len(), 0);
        assert_eq!(table.capacity(), capacity);
        assert!(table.iter().next().is_none());

        insert_item(&mut table, &state, 3, 30);
        assert_eq!(
            table.find(hash_key(&state, 3), |v| v.key == 3).unwrap().value,
            30
        );
    }

    #[test]
    fn retain_keeps_matching() {
        let hash = |k: u64| k;
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        for k in 0..100u64 {
            match table.entry(hash(k), |v| v.key == k, |v| hash(v.key)) {
                Entry::Vacant(entry) => {
                    entry.insert(Item {
                        key: k,
                        value: k as i32,
                    });
                }
                Entry::Occupied(_) => unreachable!(),
            }
        }

        table.retain(|item| item.key % 2 == 0);

        assert_eq!(table.len(), 50);
        for k in 0..100u64 {
            assert_eq!(table.find(hash(k), |v| v.key == k).is_some(), k % 2 == 0);
        }
    }

    #[test]
    fn reserve_and_shrink() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        table.reserve(1000, |v| hash_key(&state, v.key));
        let reserved = table.capacity();
        assert!(max_load(reserved) >= 1000);

        for k in 0..8u64 {
            insert_item(&mut table, &state, k, 0);
        }
        assert_eq!(table.capacity(), reserved);

        table.shrink_to_fit(|v| hash_key(&state, v.key));
        assert_eq!(table.capacity(), 16);
        assert_eq!(table.len(), 8);
        for k in 0..8u64 {
            assert!(table.find(hash_key(&state, k), |v| v.key == k).is_some());
        }

        table.clear();
        table.shrink_to_fit(|v| hash_key(&state, v.key));
        assert_eq!(table.capacity(), 0);
    }

    #[test]
    fn try_reserve_overflow() {
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        assert_eq!(
            table.try_reserve(usize::MAX, |v| v.key),
            Err(TryReserveError::CapacityOverflow)
        );
        assert_eq!(table.capacity(), 0);
    }

    #[test]
    fn insert_erase_cycles_stay_bounded() {
        // Churn that leaves tombstones behind must neither grow the table
        // nor break probe termination for absent keys.
        let hash = |k: u64| k;
        let mut table: HashTable<Item> = HashTable::with_capacity(16);

        for round in 0..100u64 {
            for k in 0..10u64 {
                let key = round * 10 + k;
                match table.entry(hash(key), |v| v.key == key, |v| hash(v.key)) {
                    Entry::Vacant(entry) => {
                        entry.insert(Item { key, value: 0 });
                    }
                    Entry::Occupied(_) => unreachable!(),
                }
            }

            // A miss must terminate even with tombstones piling up.
            assert!(table.find(hash(u64::MAX), |v| v.key == u64::MAX).is_none());

            for k in 0..10u64 {
                let key = round * 10 + k;
                assert!(table.remove(hash(key), |v| v.key == key).is_some());
            }
        }

        assert_eq!(table.len(), 0);
        assert!(table.capacity() <= 32, "{:#?}", table);
    }

    #[test]
    fn entry_api_combinators() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        let hash = hash_key(&state, 5);

        let value = table
            .entry(hash, |v| v.key == 5, |v| hash_key(&state, v.key))
            .or_insert(Item { key: 5, value: 1 });
        assert_eq!(value.value, 1);

        let value = table
            .entry(hash, |v| v.key == 5, |v| hash_key(&state, v.key))
            .or_insert(Item { key: 5, value: 99 });
        assert_eq!(value.value, 1, "or_insert must not replace");

        let modified = table
            .entry(hash, |v| v.key == 5, |v| hash_key(&state, v.key))
            .and_modify(|v| v.value += 10);
        assert_eq!(modified.unwrap().value, 11);

        let missing_hash = hash_key(&state, 6);
        assert!(
            table
                .entry(missing_hash, |v| v.key == 6, |v| hash_key(&state, v.key))
                .and_modify(|v| v.value += 1)
                .is_none()
        );
    }

    #[test]
    fn occupied_entry_remove() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        insert_item(&mut table, &state, 9, 90);

        let hash = hash_key(&state, 9);
        match table.entry(hash, |v| v.key == 9, |v| hash_key(&state, v.key)) {
            Entry::Occupied(entry) => {
                let removed = entry.remove();
                assert_eq!(removed, Item { key: 9, value: 90 });
            }
            Entry::Vacant(_) => panic!("expected occupied"),
        }

        assert!(table.is_empty());
        assert!(table.find(hash, |v| v.key == 9).is_none());
    }

    #[test]
    fn clone_preserves_entries() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        for k in 0..40u64 {
            insert_item(&mut table, &state, k, k as i32);
        }
        table.remove(hash_key(&state, 11), |v| v.key == 11).unwrap();

        let copy = table.clone();
        assert_eq!(copy.len(), 39);
        for k in 0..40u64 {
            let hash = hash_key(&state, k);
            assert_eq!(copy.find(hash, |v| v.key == k).is_some(), k != 11);
        }

        drop(table);
        assert!(copy.find(hash_key(&state, 0), |v| v.key == 0).is_some());
    }

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone)]
    struct DropItem {
        key: u64,
    }

    impl Drop for DropItem {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn values_dropped_exactly_once() {
        let hash = |k: u64| k;
        DROPS.store(0, Ordering::Relaxed);

        let mut table: HashTable<DropItem> = HashTable::with_capacity(0);
        for k in 0..64u64 {
            match table.entry(hash(k), |v| v.key == k, |v| hash(v.key)) {
                Entry::Vacant(entry) => {
                    entry.insert(DropItem { key: k });
                }
                Entry::Occupied(_) => unreachable!(),
            }
        }
        // Resizes moved values without dropping them.
        assert_eq!(DROPS.load(Ordering::Relaxed), 0);

        for k in 0..16u64 {
            drop(table.remove(hash(k), |v| v.key == k).unwrap());
        }
        assert_eq!(DROPS.load(Ordering::Relaxed), 16);

        table.clear();
        assert_eq!(DROPS.load(Ordering::Relaxed), 64);

        for k in 0..8u64 {
            match table.entry(hash(k), |v| v.key == k, |v| hash(v.key)) {
                Entry::Vacant(entry) => {
                    entry.insert(DropItem { key: k });
                }
                Entry::Occupied(_) => unreachable!(),
            }
        }
        drop(table);
        assert_eq!(DROPS.load(Ordering::Relaxed), 72);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn insert_many() {
        let state = HashState::default();
        let mut table: HashTable<Item> = HashTable::with_capacity(0);
        for k in 0..100000u64 {
            insert_item(&mut table, &state, k, k as i32);
        }

        assert_eq!(table.len(), 100000);
        assert!(table.len() <= max_load(table.capacity()));
        for k in 0..100000u64 {
            let hash = hash_key(&state, k);
            assert_eq!(
                table.find(hash, |v| v.key == k).map(|v| v.value),
                Some(k as i32)
            );
        }
    }

    #[cfg(feature = "stats")]
    #[test]
    fn stats_reflect_contents() {
        let hash = |k: u64| k;
        let mut table: HashTable<Item> = HashTable::with_capacity(16);
        for k in 0..10u64 {
            match table.entry(hash(k), |v| v.key == k, |v| hash(v.key)) {
                Entry::Vacant(entry) => {
                    entry.insert(Item { key: k, value: 0 });
                }
                Entry::Occupied(_) => unreachable!(),
            }
        }
        table.remove(hash(4), |v| v.key == 4).unwrap();

        let stats = table.debug_stats();
        assert_eq!(stats.populated, 9);
        assert_eq!(stats.tombstones, 1);
        assert_eq!(stats.capacity, 16);
        assert_eq!(stats.max_load, 14);

        let histogram = table.probe_histogram(|v| hash(v.key));
        assert_eq!(histogram.groups_probed.iter().sum::<usize>(), 9);
        assert_eq!(histogram.groups_probed[0], 9);
    }
}
