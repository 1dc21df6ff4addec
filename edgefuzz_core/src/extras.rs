//! Dictionary tokens ("extras").
//!
//! User extras come from a dictionary file or directory and stay fixed for the
//! whole session. Auto extras are harvested during the walking bit-flip stage
//! and ranked by how often they are rediscovered.

use crate::constants::{
    INTERESTING_16, INTERESTING_32, MAX_AUTO_EXTRA, MAX_AUTO_EXTRAS, MAX_DICT_FILE,
    MIN_AUTO_EXTRA, USE_AUTO_EXTRAS,
};
use crate::error::{FuzzError, io_error};
use crate::fs::FileSystem;
use log::{debug, info};
use rand::Rng;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraData {
    pub data: Vec<u8>,
    pub hit_count: u32,
}

impl ExtraData {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, hit_count: 0 }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ExtrasStore {
    user: Vec<ExtraData>,
    auto: Vec<ExtraData>,
    auto_capacity: usize,
}

impl Default for ExtrasStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtrasStore {
    pub fn new() -> Self {
        Self::with_auto_capacity(MAX_AUTO_EXTRAS)
    }

    pub fn with_auto_capacity(auto_capacity: usize) -> Self {
        Self {
            user: Vec::new(),
            auto: Vec::new(),
            auto_capacity: auto_capacity.max(1),
        }
    }

    /// User tokens, shortest first.
    pub fn user(&self) -> &[ExtraData] {
        &self.user
    }

    /// Auto tokens; the first `USE_AUTO_EXTRAS` are ordered by length.
    pub fn auto(&self) -> &[ExtraData] {
        &self.auto
    }

    pub fn has_any(&self) -> bool {
        !self.user.is_empty() || !self.auto.is_empty()
    }

    /// Adds user tokens and keeps the list sorted by length.
    pub fn add_user<I>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.user
            .extend(tokens.into_iter().filter(|t| !t.is_empty()).map(ExtraData::new));
        self.user.sort_by_key(|e| e.len());
    }

    /// Offers a harvested token to the auto dictionary.
    ///
    /// Returns `true` when the dictionary changed (a token was inserted or an
    /// existing one gained a hit).
    pub fn maybe_add_auto<R: Rng + ?Sized>(&mut self, candidate: &[u8], rng: &mut R) -> bool {
        if candidate.is_empty() || candidate.len() > MAX_AUTO_EXTRA {
            return false;
        }

        if candidate.iter().all(|&b| b == candidate[0]) {
            return false;
        }

        if is_interesting_constant(candidate) {
            return false;
        }

        if self
            .user
            .iter()
            .filter(|e| e.len() == candidate.len())
            .any(|e| e.data == candidate)
        {
            return false;
        }

        if let Some(existing) = self.auto.iter_mut().find(|e| e.data == candidate) {
            existing.hit_count += 1;
        } else if self.auto.len() < self.auto_capacity {
            self.auto.push(ExtraData::new(candidate.to_vec()));
        } else {
            // Evict from the lower half; the upper half holds the most useful tokens.
            let half = self.auto_capacity / 2;
            let victim = half + rng.random_range(0..(self.auto_capacity + 1) / 2);
            self.auto[victim] = ExtraData::new(candidate.to_vec());
        }

        self.sort_auto();
        true
    }

    fn sort_auto(&mut self) {
        self.auto.sort_by(|a, b| b.hit_count.cmp(&a.hit_count));
        let top = self.auto.len().min(USE_AUTO_EXTRAS);
        self.auto[..top].sort_by_key(|e| e.len());
    }

    /// Loads user tokens from a dictionary file or a directory of token files.
    ///
    /// # Returns
    /// The number of tokens loaded.
    pub fn load_user(&mut self, fs: &dyn FileSystem, path: &Path) -> Result<usize, FuzzError> {
        let tokens = if fs.is_dir(path) {
            load_token_dir(fs, path)?
        } else {
            let raw = fs.read_file(path).map_err(|e| io_error(path, e))?;
            parse_dictionary(&String::from_utf8_lossy(&raw))
                .map_err(|e| FuzzError::Dictionary(format!("{}: {e}", path.display())))?
        };

        if tokens.is_empty() {
            return Err(FuzzError::Dictionary(format!(
                "no usable tokens in {}",
                path.display()
            )));
        }

        let count = tokens.len();
        self.add_user(tokens);
        let (min, max) = (
            self.user.first().map_or(0, |e| e.len()),
            self.user.last().map_or(0, |e| e.len()),
        );
        info!("Loaded {count} extra tokens, size range {min} to {max} bytes.");
        Ok(count)
    }

    /// Re-reads tokens written by [`ExtrasStore::save_auto`] in a previous session.
    pub fn load_auto<R: Rng + ?Sized>(
        &mut self,
        fs: &dyn FileSystem,
        dir: &Path,
        rng: &mut R,
    ) -> usize {
        let mut loaded = 0;
        for i in 0..USE_AUTO_EXTRAS {
            let path = dir.join(format!("auto_{i:06}"));
            let Ok(data) = fs.read_prefix(&path, MAX_AUTO_EXTRA + 1) else {
                break;
            };
            if (MIN_AUTO_EXTRA..=MAX_AUTO_EXTRA).contains(&data.len()) {
                self.maybe_add_auto(&data, rng);
            }
            loaded += 1;
        }
        if loaded > 0 {
            info!("Loaded {loaded} auto-discovered dictionary tokens.");
        } else {
            debug!("No auto-generated dictionary tokens to reuse.");
        }
        loaded
    }

    /// Writes the top auto tokens as `auto_NNNNNN` files under `dir`.
    pub fn save_auto(&self, fs: &dyn FileSystem, dir: &Path) -> Result<(), FuzzError> {
        for (i, extra) in self.auto.iter().take(USE_AUTO_EXTRAS).enumerate() {
            let path = dir.join(format!("auto_{i:06}"));
            fs.replace_file(&path, &extra.data)
                .map_err(|e| io_error(&path, e))?;
        }
        Ok(())
    }
}

/// True when a 2- or 4-byte token equals a built-in interesting value in either byte order.
fn is_interesting_constant(candidate: &[u8]) -> bool {
    match candidate.len() {
        2 => {
            let v = u16::from_le_bytes([candidate[0], candidate[1]]);
            INTERESTING_16
                .iter()
                .any(|&x| v == x as u16 || v == (x as u16).swap_bytes())
        }
        4 => {
            let v = u32::from_le_bytes([candidate[0], candidate[1], candidate[2], candidate[3]]);
            INTERESTING_32
                .iter()
                .any(|&x| v == x as u32 || v == (x as u32).swap_bytes())
        }
        _ => false,
    }
}

fn load_token_dir(fs: &dyn FileSystem, dir: &Path) -> Result<Vec<Vec<u8>>, FuzzError> {
    let mut tokens = Vec::new();
    for path in fs.list_dir(dir).map_err(|e| io_error(dir, e))? {
        let info = fs.stat(&path).map_err(|e| io_error(&path, e))?;
        if info.is_dir || info.len == 0 {
            continue;
        }
        if info.len > MAX_DICT_FILE as u64 {
            return Err(FuzzError::Dictionary(format!(
                "token {} is too big ({} bytes, limit is {MAX_DICT_FILE})",
                path.display(),
                info.len
            )));
        }
        tokens.push(fs.read_file(&path).map_err(|e| io_error(&path, e))?);
    }
    Ok(tokens)
}

/// Parses dictionary text: one `name="value"` entry per line.
///
/// The name (with an optional `@level` suffix) may be omitted. Values accept
/// `\\`, `\"` and `\xNN` escapes; other bytes must be printable ASCII.
pub fn parse_dictionary(text: &str) -> Result<Vec<Vec<u8>>, String> {
    let mut tokens = Vec::new();

    for (line_no, raw_line) in text.lines().enumerate() {
        let line_no = line_no + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let bytes = line.as_bytes();
        if bytes[bytes.len() - 1] != b'"' {
            return Err(format!("malformed name=\"value\" pair in line {line_no}"));
        }

        let mut pos = 0;
        while pos < bytes.len()
            && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_' || bytes[pos] == b'-')
        {
            pos += 1;
        }
        if pos < bytes.len() && bytes[pos] == b'@' {
            pos += 1;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
        }
        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b'=') {
            pos += 1;
        }
        if pos >= bytes.len() - 1 || bytes[pos] != b'"' {
            return Err(format!("malformed name=\"value\" pair in line {line_no}"));
        }

        let value = &bytes[pos + 1..bytes.len() - 1];
        let token = unescape_value(value).map_err(|e| format!("{e} in line {line_no}"))?;
        if token.len() > MAX_DICT_FILE {
            return Err(format!(
                "keyword too big in line {line_no} ({} bytes, limit is {MAX_DICT_FILE})",
                token.len()
            ));
        }
        if !token.is_empty() {
            tokens.push(token);
        }
    }

    Ok(tokens)
}

fn unescape_value(value: &[u8]) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(value.len());
    let mut i = 0;
    while i < value.len() {
        let c = value[i];
        if !(32..=127).contains(&c) {
            return Err("non-printable characters".to_string());
        }
        if c != b'\\' {
            out.push(c);
            i += 1;
            continue;
        }
        match value.get(i + 1) {
            Some(b'\\') | Some(b'"') => {
                out.push(value[i + 1]);
                i += 2;
            }
            Some(b'x') => {
                let hex = value
                    .get(i + 2..i + 4)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| "invalid escaping (not \\xNN)".to_string())?;
                out.push(hex);
                i += 4;
            }
            _ => return Err("invalid escaping".to_string()),
        }
    }
    Ok(out)
}
