//! The corpus of retained test cases, the top-rated table and culling.
//!
//! Entries live in an append-only arena and are addressed by [`EntryId`], their
//! position in discovery order. Nothing is ever removed during a session; culling
//! only toggles the `favored` flag and the on-disk redundancy marker.

use crate::bitmap::Bitmap;
use crate::error::{FuzzError, io_error};
use crate::fs::FileSystem;
use log::debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Stable index of a queue entry.
pub type EntryId = usize;

/// Marker directories under `queue/.state/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sidecar {
    DeterministicDone,
    RedundantEdges,
    VariableBehavior,
}

impl Sidecar {
    pub fn dir_name(self) -> &'static str {
        match self {
            Sidecar::DeterministicDone => "deterministic_done",
            Sidecar::RedundantEdges => "redundant_edges",
            Sidecar::VariableBehavior => "variable_behavior",
        }
    }
}

pub const STATE_DIR: &str = ".state";
pub const AUTO_EXTRAS_DIR: &str = "auto_extras";

/// One retained test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub path: PathBuf,
    pub len: usize,
    /// Average execution time measured during calibration, in microseconds.
    pub exec_us: u64,
    /// Number of edges hit.
    pub bitmap_size: usize,
    /// Checksum of the classified trace; 0 until first calibrated.
    pub exec_cksum: u32,
    pub depth: u32,
    /// Queue cycles that passed before this entry was found.
    pub handicap: u64,
    pub cal_failed: u8,
    pub trim_done: bool,
    pub was_fuzzed: bool,
    pub passed_det: bool,
    pub has_new_cov: bool,
    pub var_behavior: bool,
    pub favored: bool,
    pub fs_redundant: bool,
    /// One bit per edge; present while the entry holds a top-rated slot.
    pub trace_mini: Option<Vec<u8>>,
    /// Number of top-rated slots held.
    pub tc_ref: u32,
}

impl QueueEntry {
    fn new(path: PathBuf, len: usize, depth: u32, passed_det: bool) -> Self {
        Self {
            path,
            len,
            exec_us: 0,
            bitmap_size: 0,
            exec_cksum: 0,
            depth,
            handicap: 0,
            cal_failed: 0,
            trim_done: false,
            was_fuzzed: false,
            passed_det,
            has_new_cov: false,
            var_behavior: false,
            favored: false,
            fs_redundant: false,
            trace_mini: None,
            tc_ref: 0,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Favor factor used by the top-rated table; smaller wins.
    pub fn fav_factor(&self) -> u64 {
        self.exec_us * self.len as u64
    }
}

#[derive(Debug, Default)]
pub struct Queue {
    entries: Vec<QueueEntry>,
    /// Depth of the entry being fuzzed; new entries get `cur_depth + 1`.
    pub cur_depth: u32,
    pub max_depth: u32,
    pub pending_not_fuzzed: usize,
    pub pending_favored: usize,
    pub favored: usize,
    pub queued_variable: usize,
    pub queued_with_cov: usize,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry and returns its id.
    pub fn add(&mut self, path: PathBuf, len: usize, passed_det: bool) -> EntryId {
        let depth = self.cur_depth + 1;
        self.max_depth = self.max_depth.max(depth);
        self.pending_not_fuzzed += 1;
        self.entries.push(QueueEntry::new(path, len, depth, passed_det));
        self.entries.len() - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: EntryId) -> Option<&QueueEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut QueueEntry> {
        self.entries.get_mut(id)
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Records that an entry went through a full fuzzing round.
    pub fn mark_fuzzed(&mut self, id: EntryId) {
        let entry = &mut self.entries[id];
        if entry.was_fuzzed {
            return;
        }
        entry.was_fuzzed = true;
        self.pending_not_fuzzed = self.pending_not_fuzzed.saturating_sub(1);
        if entry.favored {
            self.pending_favored = self.pending_favored.saturating_sub(1);
        }
    }

    /// Recomputes the favored set from the top-rated table.
    ///
    /// Greedy set cover: walk the edges in order and, for every edge not yet
    /// covered, favor its top-rated entry and remove all edges in that entry's
    /// trace mini from the work set. Does nothing in dumb mode or when no slot
    /// changed since the last cull.
    pub fn cull(
        &mut self,
        top_rated: &mut TopRated,
        dumb_mode: bool,
        fs: &dyn FileSystem,
    ) -> Result<(), FuzzError> {
        if dumb_mode || !top_rated.score_changed {
            return Ok(());
        }
        top_rated.score_changed = false;

        let mut temp_v = vec![0xFFu8; top_rated.slots.len().div_ceil(8)];
        self.favored = 0;
        self.pending_favored = 0;
        for entry in self.entries.iter_mut() {
            entry.favored = false;
        }

        for (edge, slot) in top_rated.slots.iter().enumerate() {
            let Some(id) = *slot else {
                continue;
            };
            if temp_v[edge >> 3] & (1 << (edge & 7)) == 0 {
                continue;
            }
            let entry = &mut self.entries[id];
            if let Some(mini) = &entry.trace_mini {
                for (w, &m) in temp_v.iter_mut().zip(mini.iter()) {
                    *w &= !m;
                }
            }
            if !entry.favored {
                entry.favored = true;
                self.favored += 1;
                if !entry.was_fuzzed {
                    self.pending_favored += 1;
                }
            }
        }

        for id in 0..self.entries.len() {
            let redundant = !self.entries[id].favored;
            self.mark_sidecar(fs, id, Sidecar::RedundantEdges, redundant)?;
        }

        debug!(
            "Culled queue: {} favored, {} pending favored",
            self.favored, self.pending_favored
        );
        Ok(())
    }

    /// Creates or removes a sidecar marker for an entry.
    ///
    /// The marker lives at `queue/.state/<kind>/<name>` and contains the relative
    /// path back to the entry. Redundancy markers are only touched when the
    /// recorded state changes; removal is best effort.
    pub fn mark_sidecar(
        &mut self,
        fs: &dyn FileSystem,
        id: EntryId,
        kind: Sidecar,
        present: bool,
    ) -> Result<(), FuzzError> {
        let entry = &mut self.entries[id];
        match kind {
            Sidecar::RedundantEdges => {
                if entry.fs_redundant == present {
                    return Ok(());
                }
                entry.fs_redundant = present;
            }
            Sidecar::DeterministicDone => entry.passed_det = present,
            Sidecar::VariableBehavior => entry.var_behavior = present,
        }

        let marker = sidecar_path(&entry.path, kind);
        if present {
            let target = format!("../../{}", entry.file_name());
            match fs.create_new(&marker, target.as_bytes()) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
                Err(e) => Err(io_error(&marker, e)),
            }
        } else {
            let _ = fs.delete_file(&marker);
            Ok(())
        }
    }
}

/// `<queue dir>/.state/<kind>/<entry file name>`.
pub fn sidecar_path(entry_path: &Path, kind: Sidecar) -> PathBuf {
    let queue_dir = entry_path.parent().unwrap_or_else(|| Path::new("."));
    let name = entry_path.file_name().unwrap_or_default();
    queue_dir.join(STATE_DIR).join(kind.dir_name()).join(name)
}

/// For every edge, the entry that exercises it most cheaply.
#[derive(Debug)]
pub struct TopRated {
    slots: Vec<Option<EntryId>>,
    /// Set whenever a slot changes; cleared by [`Queue::cull`].
    pub score_changed: bool,
}

impl TopRated {
    pub fn new(map_size: usize) -> Self {
        Self {
            slots: vec![None; map_size],
            score_changed: false,
        }
    }

    pub fn get(&self, edge: usize) -> Option<EntryId> {
        self.slots.get(edge).copied().flatten()
    }

    /// Offers entry `id`, whose classified trace is `trace`, for every edge it hits.
    ///
    /// The entry takes a slot when the slot is empty or its favor factor
    /// (execution time times length) is no worse than the holder's. A displaced
    /// holder loses a reference and drops its trace mini when none remain.
    ///
    /// # Returns
    /// `true` if any slot changed.
    pub fn update_bitmap_score(&mut self, queue: &mut Queue, id: EntryId, trace: &Bitmap) -> bool {
        let fav_factor = queue.entries[id].fav_factor();
        let mut changed = false;

        for (edge, &hits) in trace.as_slice().iter().enumerate().take(self.slots.len()) {
            if hits == 0 {
                continue;
            }

            if let Some(holder) = self.slots[edge] {
                let holder_entry = &mut queue.entries[holder];
                if fav_factor > holder_entry.fav_factor() {
                    continue;
                }
                holder_entry.tc_ref = holder_entry.tc_ref.saturating_sub(1);
                if holder_entry.tc_ref == 0 {
                    holder_entry.trace_mini = None;
                }
            }

            self.slots[edge] = Some(id);
            let entry = &mut queue.entries[id];
            entry.tc_ref += 1;
            if entry.trace_mini.is_none() {
                entry.trace_mini = Some(trace.minimize_bits());
            }
            changed = true;
        }

        if changed {
            self.score_changed = true;
        }
        changed
    }

    #[cfg(test)]
    pub(crate) fn set_slot(&mut self, edge: usize, id: Option<EntryId>) {
        self.slots[edge] = id;
        self.score_changed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFileSystem;
    use tempfile::tempdir;

    const TEST_MAP: usize = 32;

    fn prepare_queue_dir(root: &Path) -> PathBuf {
        let fs = StdFileSystem;
        let queue_dir = root.join("queue");
        for kind in [
            Sidecar::DeterministicDone,
            Sidecar::RedundantEdges,
            Sidecar::VariableBehavior,
        ] {
            fs.ensure_dir(&queue_dir.join(STATE_DIR).join(kind.dir_name()))
                .unwrap();
        }
        queue_dir
    }

    fn trace_covering(edges: std::ops::Range<usize>) -> Bitmap {
        let mut trace = Bitmap::new(TEST_MAP);
        for e in edges {
            trace.as_mut_slice()[e] = 1;
        }
        trace
    }

    fn add_calibrated(queue: &mut Queue, dir: &Path, name: &str, exec_us: u64, len: usize) -> EntryId {
        let id = queue.add(dir.join(name), len, false);
        queue.get_mut(id).unwrap().exec_us = exec_us;
        id
    }

    #[test]
    fn add_tracks_depth_and_pending() {
        let mut queue = Queue::new();
        let a = queue.add(PathBuf::from("q/a"), 4, false);
        queue.cur_depth = queue.get(a).unwrap().depth;
        let b = queue.add(PathBuf::from("q/b"), 4, false);

        assert_eq!(queue.get(a).unwrap().depth, 1);
        assert_eq!(queue.get(b).unwrap().depth, 2);
        assert_eq!(queue.max_depth, 2);
        assert_eq!(queue.pending_not_fuzzed, 2);
    }

    #[test]
    fn cheaper_entry_takes_over_slots() {
        let mut queue = Queue::new();
        let mut top = TopRated::new(TEST_MAP);
        let slow = add_calibrated(&mut queue, Path::new("q"), "slow", 100, 10);
        let fast = add_calibrated(&mut queue, Path::new("q"), "fast", 10, 10);

        assert!(top.update_bitmap_score(&mut queue, slow, &trace_covering(0..4)));
        assert_eq!(queue.get(slow).unwrap().tc_ref, 4);

        assert!(top.update_bitmap_score(&mut queue, fast, &trace_covering(0..4)));
        assert_eq!(top.get(2), Some(fast));
        assert_eq!(queue.get(slow).unwrap().tc_ref, 0);
        assert!(queue.get(slow).unwrap().trace_mini.is_none());

        assert!(!top.update_bitmap_score(&mut queue, slow, &trace_covering(0..4)));
    }

    #[test]
    fn cull_picks_minimal_cover() {
        let dir = tempdir().unwrap();
        let fs = StdFileSystem;
        let queue_dir = prepare_queue_dir(dir.path());

        let mut queue = Queue::new();
        let mut top = TopRated::new(TEST_MAP);
        let a = add_calibrated(&mut queue, &queue_dir, "a", 10, 10);
        let b = add_calibrated(&mut queue, &queue_dir, "b", 10, 10);
        let c = add_calibrated(&mut queue, &queue_dir, "c", 10, 10);
        let d = add_calibrated(&mut queue, &queue_dir, "d", 50, 50);

        top.update_bitmap_score(&mut queue, d, &trace_covering(0..30));
        top.update_bitmap_score(&mut queue, a, &trace_covering(0..10));
        top.update_bitmap_score(&mut queue, b, &trace_covering(10..20));
        top.update_bitmap_score(&mut queue, c, &trace_covering(20..30));
        for &id in &[a, b, c, d] {
            let name = queue.get(id).unwrap().file_name();
            fs.replace_file(&queue_dir.join(name), b"x").unwrap();
        }

        queue.cull(&mut top, false, &fs).unwrap();

        let favored: Vec<_> = queue.iter().map(|e| e.favored).collect();
        assert_eq!(favored, vec![true, true, true, false]);
        assert_eq!(queue.favored, 3);
        assert_eq!(queue.pending_favored, 3);
        assert!(!top.score_changed);

        let marker = sidecar_path(&queue.get(d).unwrap().path, Sidecar::RedundantEdges);
        assert_eq!(fs.read_file(&marker).unwrap(), b"../../d");
        assert!(!fs.exists(&sidecar_path(&queue.get(a).unwrap().path, Sidecar::RedundantEdges)));
    }

    #[test]
    fn cull_counts_each_contender_once() {
        let dir = tempdir().unwrap();
        let fs = StdFileSystem;
        let queue_dir = prepare_queue_dir(dir.path());

        let mut queue = Queue::new();
        let mut top = TopRated::new(TEST_MAP);
        let a = add_calibrated(&mut queue, &queue_dir, "a", 10, 10);
        top.update_bitmap_score(&mut queue, a, &trace_covering(0..8));
        queue.get_mut(a).unwrap().was_fuzzed = true;

        // Slot 31 points at `a` but its trace mini does not cover it.
        top.set_slot(31, Some(a));
        queue.cull(&mut top, false, &fs).unwrap();

        assert_eq!(queue.favored, 1);
        assert_eq!(queue.pending_favored, 0);
    }

    #[test]
    fn cull_is_skipped_without_score_change_or_in_dumb_mode() {
        let fs = StdFileSystem;
        let mut queue = Queue::new();
        let mut top = TopRated::new(TEST_MAP);
        let a = queue.add(PathBuf::from("nowhere/a"), 1, false);
        queue.get_mut(a).unwrap().favored = true;

        queue.cull(&mut top, false, &fs).unwrap();
        assert!(queue.get(a).unwrap().favored);

        top.set_slot(0, Some(a));
        queue.cull(&mut top, true, &fs).unwrap();
        assert!(top.score_changed);
    }

    #[test]
    fn sidecar_markers_round_trip() {
        let dir = tempdir().unwrap();
        let fs = StdFileSystem;
        let queue_dir = prepare_queue_dir(dir.path());
        let mut queue = Queue::new();
        let a = queue.add(queue_dir.join("id=000000,orig=seed"), 3, false);

        queue.mark_sidecar(&fs, a, Sidecar::DeterministicDone, true).unwrap();
        let marker = queue_dir.join(".state/deterministic_done/id=000000,orig=seed");
        assert_eq!(fs.read_file(&marker).unwrap(), b"../../id=000000,orig=seed");
        assert!(queue.get(a).unwrap().passed_det);

        queue.mark_sidecar(&fs, a, Sidecar::DeterministicDone, true).unwrap();
    }
}
