//! A 64-bit block hash with a hardware-accelerated path.
//!
//! [`hash_bytes`] digests an arbitrary byte slice with a seed. On x86_64
//! CPUs with AES-NI the input is consumed in 16-byte blocks mixed by AES
//! rounds; everywhere else a scalar multiply/rotate path is used. The two
//! paths do not produce identical digests, but both are deterministic for a
//! given `(bytes, seed)` on a given machine and both avalanche well.
//!
//! [`BlockHasher`] adapts the digest to `core::hash::Hasher` so any
//! `Hash` key type can feed the table: byte slices go through
//! [`hash_bytes`], while integer writes use a multiply-xor-shift finalizer
//! that avoids the block machinery for keys that fit in 64 bits.
//!
//! This hash is not cryptographic and makes no DoS-resistance claims; the
//! default builder uses a fixed seed.

use core::hash::BuildHasher;
use core::hash::Hash;
use core::hash::Hasher;

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;

use cfg_if::cfg_if;

/// 2^64 / phi. Seeds the accumulator and salts several mixing steps.
const GOLDEN: u64 = 0x9e3779b97f4a7c15;

const ACC_HI: u64 = 0x9e3779b97f4a7c15;
const ACC_LO: u64 = 0xc6a4a7935bd1e995;

#[inline(always)]
fn final_avalanche(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

#[inline(always)]
fn mix64(a: u64, b: u64) -> u64 {
    let mut z = a ^ b;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

cfg_if! {
    if #[cfg(all(target_arch = "x86_64", feature = "std"))] {
        /// Whether the AES block path may be used on this machine.
        ///
        /// Probed once per process and cached; subsequent calls are a
        /// relaxed atomic load.
        #[inline]
        fn aes_available() -> bool {
            use core::sync::atomic::AtomicU8;
            use core::sync::atomic::Ordering;

            // 0 = unprobed, 1 = unavailable, 2 = available
            static AES_SUPPORT: AtomicU8 = AtomicU8::new(0);

            match AES_SUPPORT.load(Ordering::Relaxed) {
                2 => true,
                1 => false,
                _ => {
                    let detected = std::arch::is_x86_feature_detected!("aes");
                    AES_SUPPORT.store(if detected { 2 } else { 1 }, Ordering::Relaxed);
                    detected
                }
            }
        }
    } else if #[cfg(target_arch = "x86_64")] {
        /// Without `std` there is no runtime CPUID access; the decision
        /// falls back to compile-time target features.
        #[inline]
        fn aes_available() -> bool {
            cfg!(target_feature = "aes")
        }
    }
}

/// Hashes `data` with `seed` into a 64-bit digest.
///
/// Deterministic for a given `(data, seed)` within a process. An empty
/// slice yields a seed-derived constant. Runs in `O(data.len())` with no
/// allocation.
#[inline]
pub fn hash_bytes(data: &[u8], seed: u64) -> u64 {
    #[cfg(target_arch = "x86_64")]
    if aes_available() {
        // SAFETY: `aes_available` confirmed AES-NI support (SSE2 is baseline
        // for the load/store intrinsics used alongside it).
        return unsafe { hash_bytes_aes(data, seed) };
    }

    hash_bytes_portable(data, seed)
}

/// AES-round block path.
///
/// A 128-bit accumulator is seeded from `(seed ^ ACC_HI, !seed ^ ACC_LO)`.
/// Each 16-byte block is XORed in and diffused by three AES rounds with
/// fixed round keys; the zero-padded tail gets two rounds. The two 64-bit
/// lanes are folded with the seed and bit length, then avalanched.
///
/// # Safety
///
/// The caller must ensure the CPU supports AES-NI.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "aes,sse2")]
unsafe fn hash_bytes_aes(data: &[u8], seed: u64) -> u64 {
    // SAFETY: `_mm_loadu_si128`/`_mm_storeu_si128` perform unaligned loads
    // and stores, and every pointer passed to them covers 16 valid bytes:
    // full blocks come from `chunks_exact(16)` and the tail is staged
    // through a zero-filled local buffer.
    unsafe {
        let mut acc = _mm_set_epi64x((seed ^ ACC_HI) as i64, (!seed ^ ACC_LO) as i64);

        let rk1 = _mm_set_epi64x(0x243f6a8885a308d3u64 as i64, 0x13198a2e03707344u64 as i64);
        let rk2 = _mm_set_epi64x(0xa4093822299f31d0u64 as i64, 0x082efa98ec4e6c89u64 as i64);
        let rk3 = _mm_set_epi64x(0x452821e638d01377u64 as i64, 0xbe5466cf34e90c6cu64 as i64);

        let mut blocks = data.chunks_exact(16);
        for block in &mut blocks {
            let lanes = _mm_loadu_si128(block.as_ptr() as *const __m128i);
            acc = _mm_xor_si128(acc, lanes);
            acc = _mm_aesenc_si128(acc, rk1);
            acc = _mm_aesenc_si128(acc, rk2);
            acc = _mm_aesenc_si128(acc, rk3);
        }

        let rem = blocks.remainder();
        if !rem.is_empty() {
            let mut tail = [0u8; 16];
            tail[..rem.len()].copy_from_slice(rem);

            let lanes = _mm_loadu_si128(tail.as_ptr() as *const __m128i);
            acc = _mm_xor_si128(acc, lanes);
            acc = _mm_aesenc_si128(acc, rk2);
            acc = _mm_aesenc_si128(acc, rk3);
        }

        let mut acc_bytes = [0u8; 16];
        _mm_storeu_si128(acc_bytes.as_mut_ptr() as *mut __m128i, acc);
        let lo = u64::from_le_bytes(acc_bytes[..8].try_into().unwrap());
        let hi = u64::from_le_bytes(acc_bytes[8..].try_into().unwrap());

        final_avalanche(hi ^ lo ^ seed ^ ((data.len() as u64) << 3))
    }
}

/// Scalar fallback: 16-byte stride of two 64-bit lanes folded through
/// multiplies and a rotate, with 8-/4-/trailing-byte finalization.
///
/// Byte fetches are little-endian, so the digest is stable across
/// little-endian targets.
fn hash_bytes_portable(data: &[u8], seed: u64) -> u64 {
    const MUL1: u64 = 0x9ddfea08eb382d69;

    let mut state = seed ^ GOLDEN;
    let mut rest = data;

    while rest.len() >= 16 {
        let a = u64::from_le_bytes(rest[..8].try_into().unwrap());
        let b = u64::from_le_bytes(rest[8..16].try_into().unwrap());

        state = state.wrapping_add(a.wrapping_mul(MUL1));
        let m = mix64(
            a ^ b.rotate_left(23).wrapping_add(state ^ (state >> 41)),
            b ^ state.wrapping_add(GOLDEN),
        );
        state ^= m;
        state = state.rotate_left(27).wrapping_mul(0x3c79ac492ba7b653);

        rest = &rest[16..];
    }

    if rest.len() >= 8 {
        let a = u64::from_le_bytes(rest[..8].try_into().unwrap());
        state = state.wrapping_add(a ^ GOLDEN);
        state = mix64(state, a);
        rest = &rest[8..];
    }

    if rest.len() >= 4 {
        let a = u32::from_le_bytes(rest[..4].try_into().unwrap()) as u64;
        state = state.wrapping_add(a.wrapping_mul(0x85ebca6b));
        state = mix64(state, a);
        rest = &rest[4..];
    }

    if !rest.is_empty() {
        let mut tail = 0u64;
        for (i, &byte) in rest.iter().enumerate() {
            tail |= (byte as u64) << (i * 8);
        }
        state = state.wrapping_add(tail.wrapping_mul(0x27d4eb2f165667c5));
        state = mix64(state, tail);
    }

    state ^= seed << 7;
    state = state.wrapping_add((data.len() as u64) << 3);
    final_avalanche(state)
}

/// A streaming [`Hasher`] over [`hash_bytes`].
///
/// Byte-slice writes reseed the block hash with the current state, so
/// multiple writes chain without buffering. Integer writes skip the block
/// machinery entirely and run a multiply-xor-shift mix, which is both
/// faster and sufficient for keys that fit in 64 bits.
#[derive(Clone, Debug)]
pub struct BlockHasher {
    state: u64,
}

impl BlockHasher {
    /// Creates a hasher with the given initial state.
    #[inline]
    pub fn with_seed(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl Hasher for BlockHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.state
    }

    #[inline]
    fn write(&mut self, bytes: &[u8]) {
        self.state = hash_bytes(bytes, self.state);
    }

    #[inline]
    fn write_u8(&mut self, i: u8) {
        self.write_u64(i as u64);
    }

    #[inline]
    fn write_u16(&mut self, i: u16) {
        self.write_u64(i as u64);
    }

    #[inline]
    fn write_u32(&mut self, i: u32) {
        self.write_u64(i as u64);
    }

    #[inline]
    fn write_u64(&mut self, i: u64) {
        self.state = mix64(self.state, i);
    }

    #[inline]
    fn write_u128(&mut self, i: u128) {
        self.write_u64(i as u64);
        self.write_u64((i >> 64) as u64);
    }

    #[inline]
    fn write_usize(&mut self, i: usize) {
        self.write_u64(i as u64);
    }
}

/// The default [`BuildHasher`] for this crate's maps.
///
/// Carries a 64-bit seed; [`Default`] uses a fixed seed, so digests are
/// stable within and across processes. Use [`with_seed`] for keyed hashing.
///
/// [`with_seed`]: DefaultHashBuilder::with_seed
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHashBuilder {
    seed: u64,
}

impl DefaultHashBuilder {
    /// Creates a builder whose hashers start from `seed`.
    #[inline]
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

impl BuildHasher for DefaultHashBuilder {
    type Hasher = BlockHasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        BlockHasher::with_seed(self.seed)
    }
}

/// An `f64` map key.
///
/// `std` floats do not implement `Hash`; this wrapper hashes and compares
/// the raw bits after collapsing `-0.0` into `+0.0`, so both zeroes land on
/// the same entry. NaN payloads compare bit-for-bit; NaN keys are the
/// caller's responsibility.
#[derive(Clone, Copy, Debug)]
pub struct F64Key(pub f64);

impl F64Key {
    #[inline]
    fn canonical_bits(self) -> u64 {
        if self.0 == 0.0 { 0f64.to_bits() } else { self.0.to_bits() }
    }
}

impl PartialEq for F64Key {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.canonical_bits() == other.canonical_bits()
    }
}

impl Eq for F64Key {}

impl Hash for F64Key {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.canonical_bits());
    }
}

/// An `f32` map key. See [`F64Key`].
#[derive(Clone, Copy, Debug)]
pub struct F32Key(pub f32);

impl F32Key {
    #[inline]
    fn canonical_bits(self) -> u32 {
        if self.0 == 0.0 { 0f32.to_bits() } else { self.0.to_bits() }
    }
}

impl PartialEq for F32Key {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.canonical_bits() == other.canonical_bits()
    }
}

impl Eq for F32Key {}

impl Hash for F32Key {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.canonical_bits());
    }
}
