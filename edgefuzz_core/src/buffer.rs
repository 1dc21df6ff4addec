//! The byte buffer every mutation stage writes into.
//!
//! Multi-byte values are read and written through explicit little/big-endian
//! encode/decode at a byte offset; nothing is reinterpreted in place.

/// Byte order used when a stage treats a window of the buffer as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// A resizable byte sequence with a cursor.
///
/// The positioned operations (`read_*`, `write_*`, `xor_*`, `add_*`, `sub_*`)
/// act at the cursor set by [`MutationBuffer::seek`] and never move it. Accesses
/// past the end of the buffer panic, like slice indexing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl MutationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn seek(&mut self, pos: usize) -> &mut Self {
        self.pos = pos;
        self
    }

    /// Replaces the whole content (and length) with `src`.
    pub fn restore_from(&mut self, src: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(src);
    }

    /// Truncates or zero-extends the buffer.
    pub fn set_len(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// Toggles one bit. Bit `n` is bit `7 - (n & 7)` of byte `n >> 3`, so bits
    /// are walked from the most significant end of each byte.
    pub fn flip_bit(&mut self, bit: usize) {
        self.data[bit >> 3] ^= 128 >> (bit & 7);
    }

    pub fn read_u8(&self) -> u8 {
        self.data[self.pos]
    }

    pub fn read_u16(&self, endian: Endian) -> u16 {
        let raw = [self.data[self.pos], self.data[self.pos + 1]];
        match endian {
            Endian::Little => u16::from_le_bytes(raw),
            Endian::Big => u16::from_be_bytes(raw),
        }
    }

    pub fn read_u32(&self, endian: Endian) -> u32 {
        let p = self.pos;
        let raw = [
            self.data[p],
            self.data[p + 1],
            self.data[p + 2],
            self.data[p + 3],
        ];
        match endian {
            Endian::Little => u32::from_le_bytes(raw),
            Endian::Big => u32::from_be_bytes(raw),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data[self.pos] = value;
    }

    pub fn write_u16(&mut self, value: u16, endian: Endian) {
        let raw = match endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.data[self.pos..self.pos + 2].copy_from_slice(&raw);
    }

    pub fn write_u32(&mut self, value: u32, endian: Endian) {
        let raw = match endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.data[self.pos..self.pos + 4].copy_from_slice(&raw);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
    }

    pub fn xor_u8(&mut self, mask: u8) {
        self.data[self.pos] ^= mask;
    }

    pub fn xor_u16(&mut self, mask: u16) {
        // XOR is byte-order agnostic when the mask is applied in the same order.
        let v = self.read_u16(Endian::Little) ^ mask;
        self.write_u16(v, Endian::Little);
    }

    pub fn xor_u32(&mut self, mask: u32) {
        let v = self.read_u32(Endian::Little) ^ mask;
        self.write_u32(v, Endian::Little);
    }

    pub fn add_u8(&mut self, delta: u8) {
        self.data[self.pos] = self.data[self.pos].wrapping_add(delta);
    }

    pub fn sub_u8(&mut self, delta: u8) {
        self.data[self.pos] = self.data[self.pos].wrapping_sub(delta);
    }

    pub fn add_u16(&mut self, delta: u16, endian: Endian) {
        let v = self.read_u16(endian).wrapping_add(delta);
        self.write_u16(v, endian);
    }

    pub fn sub_u16(&mut self, delta: u16, endian: Endian) {
        let v = self.read_u16(endian).wrapping_sub(delta);
        self.write_u16(v, endian);
    }

    pub fn add_u32(&mut self, delta: u32, endian: Endian) {
        let v = self.read_u32(endian).wrapping_add(delta);
        self.write_u32(v, endian);
    }

    pub fn sub_u32(&mut self, delta: u32, endian: Endian) {
        let v = self.read_u32(endian).wrapping_sub(delta);
        self.write_u32(v, endian);
    }

    /// Copies `len` bytes from `src` to `dst` inside this buffer. The ranges
    /// may overlap.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) {
        self.data.copy_within(src..src + len, dst);
    }

    /// Copies `len` bytes of `other` starting at `src` into this buffer at `dst`.
    pub fn copy_from(&mut self, other: &[u8], src: usize, dst: usize, len: usize) {
        self.data[dst..dst + len].copy_from_slice(&other[src..src + len]);
    }

    pub fn fill(&mut self, start: usize, len: usize, value: u8) {
        self.data[start..start + len].fill(value);
    }

    /// Inserts `bytes` before position `at`, shifting the tail right.
    pub fn insert(&mut self, at: usize, bytes: &[u8]) {
        self.data.splice(at..at, bytes.iter().copied());
    }

    /// Removes `len` bytes starting at `at`, shifting the tail left.
    pub fn remove(&mut self, at: usize, len: usize) {
        self.data.drain(at..at + len);
    }
}

impl From<Vec<u8>> for MutationBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl AsRef<[u8]> for MutationBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
