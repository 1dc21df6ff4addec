//! Per-entry driver: selection gate, calibration retry, trimming, scoring and
//! the stage sequence.

use super::{Engine, RunOutcome};
use crate::buffer::MutationBuffer;
use crate::constants::{
    CAL_CHANCES, HAVOC_MAX_MULT, SKIP_NFAV_NEW_PROB, SKIP_NFAV_OLD_PROB, SKIP_TO_NEW_PROB,
};
use crate::effector::EffectorMap;
use crate::error::{FuzzError, io_error};
use crate::queue::{EntryId, QueueEntry, Sidecar};
use crate::stats::Stage;
use log::{debug, error};
use rand::Rng;
use std::fmt::Write;

/// Runs one mutated buffer through the save pipeline and leaves the calling
/// stage when the entry has to be abandoned.
macro_rules! fuzz_or_abandon {
    ($engine:expr, $data:expr, $ctx:expr) => {
        if $engine.common_fuzz_stuff($data, $ctx)?
            == $crate::engine::stage::StageResult::AbandonEntry
        {
            return Ok($crate::engine::stage::StageResult::AbandonEntry);
        }
    };
}
pub(super) use fuzz_or_abandon;

/// How the value in a file name is to be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ValueType {
    None,
    Le,
    Be,
}

/// Where a stage is, for progress reporting and for naming what it finds.
#[derive(Debug, Clone)]
pub(super) struct StageContext {
    pub source: EntryId,
    pub splicing_with: Option<EntryId>,
    pub name: String,
    pub short: &'static str,
    pub cur: usize,
    pub max: usize,
    pub cur_byte: Option<usize>,
    pub cur_val: i32,
    pub val_type: ValueType,
}

impl StageContext {
    pub fn new(source: EntryId) -> Self {
        Self {
            source,
            splicing_with: None,
            name: String::new(),
            short: "",
            cur: 0,
            max: 0,
            cur_byte: None,
            cur_val: 0,
            val_type: ValueType::None,
        }
    }

    /// Resets the context for the start of `stage`.
    pub fn enter(&mut self, stage: Stage, max: usize) {
        self.name = stage.display_name().to_string();
        self.short = stage.short_name();
        self.cur = 0;
        self.max = max;
        self.cur_byte = None;
        self.cur_val = 0;
        self.val_type = ValueType::None;
    }

    /// Provenance part of an artifact name.
    pub fn describe(&self, new_cov: bool) -> String {
        let mut out = format!("src={:06}", self.source);
        if let Some(partner) = self.splicing_with {
            let _ = write!(out, "+{partner:06}");
        }
        let _ = write!(out, ",op={}", self.short);
        match self.cur_byte {
            Some(pos) => {
                let _ = write!(out, ",pos={pos}");
                match self.val_type {
                    ValueType::None => {}
                    ValueType::Le => {
                        let _ = write!(out, ",val={:+}", self.cur_val);
                    }
                    ValueType::Be => {
                        let _ = write!(out, ",val=be:{:+}", self.cur_val);
                    }
                }
            }
            None => {
                let _ = write!(out, ",rep={}", self.cur_val);
            }
        }
        if new_cov {
            out.push_str(",+cov");
        }
        out
    }
}

/// Result of a stage: keep going, drop the entry, or jump straight to havoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StageResult {
    Continue,
    AbandonEntry,
    SkipToHavoc,
}

/// What happened to a queue entry in [`Engine::fuzz_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// All scheduled stages ran.
    Fuzzed,
    /// The selection gate passed over the entry.
    Skipped,
    /// Calibration failed, a stop or skip was requested, or timeouts piled up.
    Abandoned,
}

/// Working buffers for the entry being fuzzed.
pub(super) struct EntryState {
    pub id: EntryId,
    /// Base input of the current stage; replaced by the spliced buffer when splicing.
    pub in_buf: Vec<u8>,
    /// The entry's own (trimmed) bytes.
    pub orig_in: Vec<u8>,
    pub out_buf: MutationBuffer,
    pub eff_map: EffectorMap,
    pub perf_score: u32,
    pub orig_perf: u32,
    pub doing_det: bool,
    pub splice_cycle: u32,
    pub ctx: StageContext,
}

impl EntryState {
    pub fn new(id: EntryId, data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            id,
            out_buf: MutationBuffer::from_bytes(&data),
            orig_in: data.clone(),
            in_buf: data,
            eff_map: EffectorMap::new(len),
            perf_score: 100,
            orig_perf: 100,
            doing_det: false,
            splice_cycle: 0,
            ctx: StageContext::new(id),
        }
    }
}

/// Energy assigned to an entry for the havoc stage, in percent of the base cycle count.
///
/// Fast entries, entries with large traces, late finds and deep entries all get
/// more time. Consumes up to 4 points of handicap per call.
pub fn performance_score(entry: &mut QueueEntry, avg_exec_us: u64, avg_bitmap_size: u64) -> u32 {
    let exec = entry.exec_us as f64;
    let avg_exec = avg_exec_us as f64;
    let mut perf: u32 = if exec * 0.1 > avg_exec {
        10
    } else if exec * 0.25 > avg_exec {
        25
    } else if exec * 0.5 > avg_exec {
        50
    } else if exec * 0.75 > avg_exec {
        75
    } else if exec * 4.0 < avg_exec {
        300
    } else if exec * 3.0 < avg_exec {
        200
    } else if exec * 2.0 < avg_exec {
        150
    } else {
        100
    };

    let size = entry.bitmap_size as f64;
    let avg_size = avg_bitmap_size as f64;
    if size * 0.3 > avg_size {
        perf *= 3;
    } else if size * 0.5 > avg_size {
        perf *= 2;
    } else if size * 0.75 > avg_size {
        perf = perf * 3 / 2;
    } else if size * 3.0 < avg_size {
        perf /= 4;
    } else if size * 2.0 < avg_size {
        perf /= 2;
    } else if size * 1.5 < avg_size {
        perf = perf * 3 / 4;
    }

    if entry.handicap >= 4 {
        perf *= 4;
        entry.handicap -= 4;
    } else if entry.handicap > 0 {
        perf *= 2;
        entry.handicap -= 1;
    }

    perf *= match entry.depth {
        0..=3 => 1,
        4..=7 => 2,
        8..=13 => 3,
        14..=25 => 4,
        _ => 5,
    };

    perf.min(HAVOC_MAX_MULT as u32 * 100)
}

impl Engine {
    /// Fuzzes one queue entry through every scheduled stage.
    ///
    /// # Returns
    /// Whether the entry was fuzzed, passed over by the selection gate, or
    /// abandoned part way. Only fatal conditions are errors.
    pub fn fuzz_one(&mut self, id: EntryId) -> Result<EntryOutcome, FuzzError> {
        if id >= self.queue.len() {
            return Err(FuzzError::InvalidSetting(format!(
                "queue entry #{id} does not exist"
            )));
        }
        if self.should_skip(id) {
            return Ok(EntryOutcome::Skipped);
        }

        let path = self.queue.entries()[id].path.clone();
        debug!(
            "Fuzzing test case #{id} ({} total, {} uniq crashes found)...",
            self.queue.len(),
            self.counters.unique_crashes
        );
        let data = self.fs.read_file(&path).map_err(|e| io_error(&path, e))?;
        self.queue.cur_depth = self.queue.entries()[id].depth;

        let mut st = EntryState::new(id, data);
        let result = self.fuzz_entry(&mut st)?;

        if !self.stop_requested() && self.queue.entries()[id].cal_failed == 0 {
            self.queue.mark_fuzzed(id);
        }

        Ok(match result {
            StageResult::AbandonEntry => EntryOutcome::Abandoned,
            _ => EntryOutcome::Fuzzed,
        })
    }

    /// Probabilistic admission control favoring favored, unfuzzed entries.
    fn should_skip(&mut self, id: EntryId) -> bool {
        let entry = &self.queue.entries()[id];
        if self.settings.ignore_finds {
            return entry.depth > 1;
        }

        let (was_fuzzed, favored) = (entry.was_fuzzed, entry.favored);
        if self.queue.pending_favored > 0 {
            (was_fuzzed || !favored) && self.rng.random_range(0..100) < SKIP_TO_NEW_PROB
        } else if !self.settings.dumb_mode && !favored && self.queue.len() > 10 {
            let prob = if self.queue_cycle > 1 && !was_fuzzed {
                SKIP_NFAV_NEW_PROB
            } else {
                SKIP_NFAV_OLD_PROB
            };
            self.rng.random_range(0..100) < prob
        } else {
            false
        }
    }

    fn fuzz_entry(&mut self, st: &mut EntryState) -> Result<StageResult, FuzzError> {
        let id = st.id;

        if self.queue.entries()[id].cal_failed > 0 {
            let mut res = RunOutcome::Timeout;
            if self.queue.entries()[id].cal_failed < CAL_CHANCES {
                // The current trace belongs to some other input.
                if let Some(entry) = self.queue.get_mut(id) {
                    entry.exec_cksum = 0;
                }
                let handicap = self.queue_cycle.saturating_sub(1);
                res = self.calibrate(id, &st.in_buf, handicap, false)?;
                if let RunOutcome::Error(msg) = res {
                    error!("Unable to execute target application ({msg})");
                    return Err(FuzzError::TargetExecution(msg));
                }
            }
            let usable = res == RunOutcome::NoNewBits || self.is_expected_fault(&res);
            if self.stop_requested() || !usable {
                self.counters.cur_skipped_paths += 1;
                return Ok(StageResult::AbandonEntry);
            }
        }

        if !self.settings.dumb_mode && !self.queue.entries()[id].trim_done {
            let res = self.trim(id, &mut st.in_buf)?;
            if let RunOutcome::Error(msg) = res {
                error!("Unable to execute target application ({msg})");
                return Err(FuzzError::TargetExecution(msg));
            }
            if self.stop_requested() {
                self.counters.cur_skipped_paths += 1;
                return Ok(StageResult::AbandonEntry);
            }
            if let Some(entry) = self.queue.get_mut(id) {
                entry.trim_done = true;
            }
        }
        st.orig_in = st.in_buf.clone();
        st.out_buf.restore_from(&st.in_buf);
        st.eff_map = EffectorMap::new(st.in_buf.len());

        let (avg_exec, avg_size) = (
            self.counters.avg_exec_us(),
            self.counters.avg_bitmap_size(),
        );
        st.perf_score = match self.queue.get_mut(id) {
            Some(entry) => performance_score(entry, avg_exec, avg_size),
            None => 100,
        };
        st.orig_perf = st.perf_score;

        match self.run_deterministic(st)? {
            StageResult::AbandonEntry => return Ok(StageResult::AbandonEntry),
            StageResult::Continue => {
                if !self.queue.entries()[id].passed_det {
                    self.queue
                        .mark_sidecar(self.fs.as_ref(), id, Sidecar::DeterministicDone, true)?;
                }
            }
            StageResult::SkipToHavoc => {}
        }

        loop {
            if self.havoc_stage(st)? == StageResult::AbandonEntry {
                return Ok(StageResult::AbandonEntry);
            }
            if !self.prepare_splice(st)? {
                break;
            }
        }
        Ok(StageResult::Continue)
    }

    /// Whether the deterministic stages run for this entry.
    pub(super) fn wants_deterministic(&self, id: EntryId) -> bool {
        let entry = &self.queue.entries()[id];
        if self.settings.skip_deterministic || entry.was_fuzzed || entry.passed_det {
            return false;
        }
        match self.settings.det_shard {
            Some(shard) => entry.exec_cksum % shard.count == shard.index - 1,
            None => true,
        }
    }

    /// Attributes finds and executions to a finished stage.
    pub(super) fn finish_stage(&mut self, stage: Stage, orig_hits: u64, cycles: usize) {
        let finds = self.find_count() - orig_hits;
        self.stage_stats.record(stage, finds, cycles as u64);
        debug!("{}: {cycles} execs, {finds} finds", stage.display_name());
    }
}
