//! Run statistics: the in-memory counters and the `fuzzer_stats` snapshot.

use crate::error::{FuzzError, io_error};
use crate::fs::FileSystem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Mutation stages with their own find and cycle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Flip1,
    Flip2,
    Flip4,
    Flip8,
    Flip16,
    Flip32,
    Arith8,
    Arith16,
    Arith32,
    Interest8,
    Interest16,
    Interest32,
    ExtrasUserOver,
    ExtrasUserInsert,
    ExtrasAutoOver,
    Havoc,
    Splice,
}

impl Stage {
    pub const ALL: [Stage; 17] = [
        Stage::Flip1,
        Stage::Flip2,
        Stage::Flip4,
        Stage::Flip8,
        Stage::Flip16,
        Stage::Flip32,
        Stage::Arith8,
        Stage::Arith16,
        Stage::Arith32,
        Stage::Interest8,
        Stage::Interest16,
        Stage::Interest32,
        Stage::ExtrasUserOver,
        Stage::ExtrasUserInsert,
        Stage::ExtrasAutoOver,
        Stage::Havoc,
        Stage::Splice,
    ];

    /// Short name used in artifact file names.
    pub fn short_name(self) -> &'static str {
        match self {
            Stage::Flip1 => "flip1",
            Stage::Flip2 => "flip2",
            Stage::Flip4 => "flip4",
            Stage::Flip8 => "flip8",
            Stage::Flip16 => "flip16",
            Stage::Flip32 => "flip32",
            Stage::Arith8 => "arith8",
            Stage::Arith16 => "arith16",
            Stage::Arith32 => "arith32",
            Stage::Interest8 => "int8",
            Stage::Interest16 => "int16",
            Stage::Interest32 => "int32",
            Stage::ExtrasUserOver => "ext_UO",
            Stage::ExtrasUserInsert => "ext_UI",
            Stage::ExtrasAutoOver => "ext_AO",
            Stage::Havoc => "havoc",
            Stage::Splice => "splice",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Stage::Flip1 => "bitflip 1/1",
            Stage::Flip2 => "bitflip 2/1",
            Stage::Flip4 => "bitflip 4/1",
            Stage::Flip8 => "bitflip 8/8",
            Stage::Flip16 => "bitflip 16/8",
            Stage::Flip32 => "bitflip 32/8",
            Stage::Arith8 => "arith 8/8",
            Stage::Arith16 => "arith 16/8",
            Stage::Arith32 => "arith 32/8",
            Stage::Interest8 => "interest 8/8",
            Stage::Interest16 => "interest 16/8",
            Stage::Interest32 => "interest 32/8",
            Stage::ExtrasUserOver => "user extras (over)",
            Stage::ExtrasUserInsert => "user extras (insert)",
            Stage::ExtrasAutoOver => "auto extras (over)",
            Stage::Havoc => "havoc",
            Stage::Splice => "splice",
        }
    }
}

/// Finds and executions attributed to each stage.
#[derive(Debug, Clone, Default)]
pub struct StageStats {
    finds: [u64; Stage::ALL.len()],
    cycles: [u64; Stage::ALL.len()],
}

impl StageStats {
    pub fn record(&mut self, stage: Stage, finds: u64, cycles: u64) {
        self.finds[stage as usize] += finds;
        self.cycles[stage as usize] += cycles;
    }

    pub fn finds(&self, stage: Stage) -> u64 {
        self.finds[stage as usize]
    }

    pub fn cycles(&self, stage: Stage) -> u64 {
        self.cycles[stage as usize]
    }
}

/// Counters the engine accumulates during a session.
#[derive(Debug, Clone, Default)]
pub struct RunCounters {
    pub execs_done: u64,
    pub total_cal_us: u64,
    pub total_cal_cycles: u64,
    pub total_bitmap_size: u64,
    pub total_bitmap_entries: u64,
    pub total_crashes: u64,
    pub total_tmouts: u64,
    pub unique_crashes: u64,
    pub unique_hangs: u64,
    pub unique_tmouts: u64,
    pub subseq_tmouts: u32,
    pub queued_discovered: u64,
    pub queued_at_start: u64,
    pub cur_skipped_paths: u64,
    pub cal_failures: u64,
    pub useless_at_start: u64,
    pub trim_execs: u64,
    pub bytes_trim_in: u64,
    pub bytes_trim_out: u64,
    pub blocks_eff_total: u64,
    pub blocks_eff_select: u64,
    pub last_path_time: u64,
    pub last_crash_time: u64,
    pub last_hang_time: u64,
    pub last_crash_execs: u64,
}

impl RunCounters {
    /// Average calibrated execution time in microseconds.
    pub fn avg_exec_us(&self) -> u64 {
        self.total_cal_us / self.total_cal_cycles.max(1)
    }

    /// Average number of edges hit per calibrated entry.
    pub fn avg_bitmap_size(&self) -> u64 {
        self.total_bitmap_size / self.total_bitmap_entries.max(1)
    }
}

/// Seconds since the Unix epoch.
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The persisted `fuzzer_stats` record.
///
/// Every field has a default so that snapshots written by older sessions still
/// load on resume.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct FuzzerStats {
    pub start_time: u64,
    pub last_update: u64,
    pub fuzzer_pid: u32,
    pub cycles_done: u64,
    pub execs_done: u64,
    pub execs_per_sec: f64,
    pub paths_total: u64,
    pub paths_favored: u64,
    pub paths_found: u64,
    pub max_depth: u32,
    pub cur_path: u64,
    pub pending_favs: u64,
    pub pending_total: u64,
    pub variable_paths: u64,
    pub stability: f64,
    pub bitmap_cvg: f64,
    pub unique_crashes: u64,
    pub unique_hangs: u64,
    pub last_path: u64,
    pub last_crash: u64,
    pub last_hang: u64,
    pub execs_since_crash: u64,
    pub exec_timeout: u64,
    pub afl_banner: String,
    pub command_line: String,
    pub total_crashes: u64,
    pub total_tmouts: u64,
    pub unique_tmouts: u64,
    pub trim_execs: u64,
    pub bytes_trim_in: u64,
    pub bytes_trim_out: u64,
    pub stage_finds: BTreeMap<String, u64>,
    pub stage_cycles: BTreeMap<String, u64>,
}

impl FuzzerStats {
    pub fn fill_stage_stats(&mut self, stages: &StageStats) {
        for stage in Stage::ALL {
            self.stage_finds
                .insert(stage.short_name().to_string(), stages.finds(stage));
            self.stage_cycles
                .insert(stage.short_name().to_string(), stages.cycles(stage));
        }
    }

    /// Seconds of work the snapshot covers.
    pub fn run_time_secs(&self) -> u64 {
        self.last_update.saturating_sub(self.start_time)
    }

    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<(), FuzzError> {
        let json = serde_json::to_vec_pretty(self)?;
        fs.replace_file(path, &json).map_err(|e| io_error(path, e))
    }

    /// Loads a snapshot; `Ok(None)` when the file does not exist.
    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Option<Self>, FuzzError> {
        if !fs.exists(path) {
            return Ok(None);
        }
        let raw = fs.read_file(path).map_err(|e| io_error(path, e))?;
        let stats = serde_json::from_slice(&raw)?;
        Ok(Some(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::StdFileSystem;
    use tempfile::tempdir;

    #[test]
    fn snapshot_round_trips_through_file() {
        let dir = tempdir().unwrap();
        let fs = StdFileSystem;
        let path = dir.path().join("fuzzer_stats");

        let mut stages = StageStats::default();
        stages.record(Stage::Havoc, 3, 1024);
        let mut stats = FuzzerStats {
            start_time: 100,
            last_update: 400,
            cur_path: 7,
            exec_timeout: 40,
            ..Default::default()
        };
        stats.fill_stage_stats(&stages);
        stats.save(&fs, &path).unwrap();

        let loaded = FuzzerStats::load(&fs, &path).unwrap().unwrap();
        assert_eq!(loaded, stats);
        assert_eq!(loaded.run_time_secs(), 300);
        assert_eq!(loaded.stage_finds["havoc"], 3);
    }

    #[test]
    fn older_snapshots_fill_missing_fields() {
        let dir = tempdir().unwrap();
        let fs = StdFileSystem;
        let path = dir.path().join("fuzzer_stats");
        fs.replace_file(&path, br#"{"cur_path": 4, "exec_timeout": 60}"#)
            .unwrap();

        let loaded = FuzzerStats::load(&fs, &path).unwrap().unwrap();
        assert_eq!(loaded.cur_path, 4);
        assert_eq!(loaded.exec_timeout, 60);
        assert_eq!(loaded.unique_crashes, 0);
        assert!(FuzzerStats::load(&fs, &dir.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn averages_tolerate_empty_totals() {
        let counters = RunCounters::default();
        assert_eq!(counters.avg_exec_us(), 0);
        assert_eq!(counters.avg_bitmap_size(), 0);
    }
}
