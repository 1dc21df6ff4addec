//! Coverage bitmaps.
//!
//! A [`Bitmap`] holds one byte per instrumented edge. The same type is used for
//! the per-execution trace (hit counters written by the target) and for the
//! "virgin" accumulators, which start as all `0xFF` and only ever lose bits as
//! edges and hit-count buckets are observed.

use crate::constants::MAP_SIZE;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 16_777_619;

/// Result of comparing a trace against a virgin accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NewBits {
    /// Nothing new.
    None,
    /// Only the hit-count bucket of an already known edge changed.
    HitCount,
    /// At least one edge was seen for the first time.
    NewTuple,
}

/// Hit counts are bucketed before comparison so that loops iterating a few more
/// times do not count as new behavior.
static COUNT_CLASS_LOOKUP: [u8; 256] = build_count_class_lookup();

const fn build_count_class_lookup() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = match i {
            0 => 0,
            1 => 1,
            2 => 2,
            3 => 4,
            4..=7 => 8,
            8..=15 => 16,
            16..=31 => 32,
            32..=127 => 64,
            _ => 128,
        };
        i += 1;
    }
    table
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bytes: Vec<u8>,
}

impl Bitmap {
    /// A zeroed trace map of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    /// A virgin accumulator of `size` bytes with every bit set.
    pub fn virgin(size: usize) -> Self {
        Self {
            bytes: vec![0xFF; size],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    /// Copies `other` into this map. Both maps must have the same size.
    pub fn copy_from(&mut self, other: &Bitmap) {
        self.bytes.copy_from_slice(&other.bytes);
    }

    /// FNV-1a over the whole map. Two executions took the same path iff their
    /// classified traces hash to the same value.
    pub fn hash32(&self) -> u32 {
        hash32(&self.bytes)
    }

    pub fn count_nonzero(&self) -> usize {
        self.bytes.iter().filter(|&&b| b != 0).count()
    }

    /// Number of bytes that are not `0xFF`. On a virgin map this is the number
    /// of edges touched so far.
    pub fn count_non_255_bytes(&self) -> usize {
        self.bytes.iter().filter(|&&b| b != 0xFF).count()
    }

    /// Clears from `virgin` every bit set in this trace and reports what kind of
    /// novelty that represented.
    ///
    /// The scan works on 8-byte words and only drops to per-byte inspection for
    /// words that actually intersect the virgin map.
    pub fn has_new_bits(&self, virgin: &mut Bitmap) -> NewBits {
        let mut ret = NewBits::None;

        let cur_chunks = self.bytes.chunks_exact(8);
        let cur_tail = cur_chunks.remainder();
        let mut vir_chunks = virgin.bytes.chunks_exact_mut(8);

        for (cur, vir) in cur_chunks.zip(&mut vir_chunks) {
            let c = u64::from_ne_bytes([
                cur[0], cur[1], cur[2], cur[3], cur[4], cur[5], cur[6], cur[7],
            ]);
            if c == 0 {
                continue;
            }
            let v = u64::from_ne_bytes([
                vir[0], vir[1], vir[2], vir[3], vir[4], vir[5], vir[6], vir[7],
            ]);
            if c & v == 0 {
                continue;
            }
            if ret < NewBits::NewTuple {
                ret = classify_word(cur, vir, ret);
            }
            vir.copy_from_slice(&(v & !c).to_ne_bytes());
        }

        let vir_tail = vir_chunks.into_remainder();
        for (&c, v) in cur_tail.iter().zip(vir_tail.iter_mut()) {
            if c != 0 && c & *v != 0 {
                if ret < NewBits::NewTuple {
                    ret = if *v == 0xFF {
                        NewBits::NewTuple
                    } else {
                        NewBits::HitCount
                    };
                }
                *v &= !c;
            }
        }

        ret
    }

    /// Collapses every byte to `0x01` (not hit) or `0x80` (hit).
    pub fn simplify_in_place(&mut self) {
        for b in self.bytes.iter_mut() {
            *b = if *b == 0 { 0x01 } else { 0x80 };
        }
    }

    /// Replaces raw hit counts with their bucket value.
    pub fn classify_counts_in_place(&mut self) {
        let mut chunks = self.bytes.chunks_exact_mut(8);
        for chunk in &mut chunks {
            if chunk.iter().all(|&b| b == 0) {
                continue;
            }
            for b in chunk.iter_mut() {
                *b = COUNT_CLASS_LOOKUP[*b as usize];
            }
        }
        for b in chunks.into_remainder() {
            *b = COUNT_CLASS_LOOKUP[*b as usize];
        }
    }

    /// Compacts the trace to one bit per edge (set when the edge was hit).
    pub fn minimize_bits(&self) -> Vec<u8> {
        let mut mini = vec![0u8; self.bytes.len().div_ceil(8)];
        for (i, &b) in self.bytes.iter().enumerate() {
            if b != 0 {
                mini[i >> 3] |= 1 << (i & 7);
            }
        }
        mini
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new(MAP_SIZE)
    }
}

fn classify_word(cur: &[u8], vir: &[u8], current: NewBits) -> NewBits {
    let mut ret = current;
    for (&c, &v) in cur.iter().zip(vir.iter()) {
        if c != 0 && v == 0xFF {
            return NewBits::NewTuple;
        }
        if c & v != 0 {
            ret = NewBits::HitCount;
        }
    }
    ret
}

/// 32-bit FNV-1a.
pub fn hash32(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
