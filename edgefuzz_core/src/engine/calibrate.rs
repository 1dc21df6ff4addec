//! Calibration and trimming.

use super::{Engine, RunOutcome};
use crate::bitmap::{Bitmap, NewBits};
use crate::constants::{
    CAL_CYCLES, CAL_CYCLES_FAST, CAL_CYCLES_LONG, CAL_TMOUT_ADD, CAL_TMOUT_PERC, TRIM_END_STEPS,
    TRIM_MIN_BYTES, TRIM_START_STEPS,
};
use crate::error::{FuzzError, io_error};
use crate::queue::{EntryId, Sidecar};
use log::debug;
use std::time::Instant;

impl Engine {
    /// Runs an entry several times to measure its speed, its trace size and the
    /// stability of its path.
    ///
    /// # Arguments
    /// * `id`: The queue entry being calibrated.
    /// * `data`: The entry's bytes.
    /// * `handicap`: Queue cycles that passed before the entry was found.
    /// * `from_queue`: `true` for seeds and resumed entries; anything else gets a
    ///   more generous timeout.
    ///
    /// # Returns
    /// The outcome of the last run, `NoInstrumentation` when the very first run
    /// produced an empty trace, or `NoNewBits` for a first calibration that saw
    /// nothing new.
    pub(super) fn calibrate(
        &mut self,
        id: EntryId,
        data: &[u8],
        handicap: u64,
        from_queue: bool,
    ) -> Result<RunOutcome, FuzzError> {
        let first_run = self.queue.entries()[id].exec_cksum == 0;
        let use_tmout = if !from_queue || self.resuming_fuzz {
            (self.exec_timeout + CAL_TMOUT_ADD).max(self.exec_timeout * CAL_TMOUT_PERC / 100)
        } else {
            self.exec_timeout
        };
        if let Some(entry) = self.queue.get_mut(id) {
            entry.cal_failed = entry.cal_failed.saturating_add(1);
        }

        let mut stage_max = if self.settings.fast_cal {
            CAL_CYCLES_FAST
        } else {
            CAL_CYCLES
        };
        // A known checksum means the trace still holds the run that found the entry.
        let mut first_trace: Option<Bitmap> = (!first_run).then(|| self.trace.clone());

        let mut fault = RunOutcome::Ok;
        let mut new_bits = NewBits::None;
        let mut var_detected = false;
        let mut aborted = false;
        let mut completed = 0usize;
        let start = Instant::now();

        while completed < stage_max {
            self.write_to_testcase(data)?;
            fault = self.run_target(data, use_tmout);

            if self.stop_requested() || !self.is_expected_fault(&fault) {
                aborted = true;
                break;
            }
            if !self.settings.dumb_mode && completed == 0 && self.trace.count_nonzero() == 0 {
                fault = RunOutcome::NoInstrumentation;
                aborted = true;
                break;
            }

            let cksum = self.trace.hash32();
            let exec_cksum = self.queue.entries()[id].exec_cksum;
            if exec_cksum != cksum {
                new_bits = new_bits.max(self.check_new_bits());

                if exec_cksum != 0 {
                    if let Some(first) = &first_trace {
                        let current = self.trace.as_slice();
                        let var = self.var_bytes.as_mut_slice();
                        for (i, (&a, &b)) in first.as_slice().iter().zip(current).enumerate() {
                            if var[i] == 0 && a != b {
                                var[i] = 1;
                                stage_max = CAL_CYCLES_LONG;
                            }
                        }
                    }
                    var_detected = true;
                } else {
                    if let Some(entry) = self.queue.get_mut(id) {
                        entry.exec_cksum = cksum;
                    }
                    first_trace = Some(self.trace.clone());
                }
            }
            completed += 1;
        }

        if completed > 0 {
            let elapsed_us = start.elapsed().as_micros() as u64;
            let cycles = completed as u64;
            self.counters.total_cal_us += elapsed_us;
            self.counters.total_cal_cycles += cycles;

            // After an abort the trace belongs to the failed run.
            let scored: &Bitmap = match &first_trace {
                Some(first) if aborted => first,
                _ => &self.trace,
            };
            let bitmap_size = scored.count_nonzero();
            if let Some(entry) = self.queue.get_mut(id) {
                entry.exec_us = elapsed_us / cycles;
                entry.bitmap_size = bitmap_size;
                entry.handicap = handicap;
                if !aborted {
                    entry.cal_failed = 0;
                }
            }
            self.counters.total_bitmap_size += bitmap_size as u64;
            self.counters.total_bitmap_entries += 1;
            self.top_rated
                .update_bitmap_score(&mut self.queue, id, scored);
        }

        if !aborted
            && !self.settings.dumb_mode
            && first_run
            && fault == RunOutcome::Ok
            && new_bits == NewBits::None
        {
            fault = RunOutcome::NoNewBits;
        }

        if new_bits == NewBits::NewTuple && !self.queue.entries()[id].has_new_cov {
            if let Some(entry) = self.queue.get_mut(id) {
                entry.has_new_cov = true;
            }
            self.queue.queued_with_cov += 1;
        }

        if var_detected && !self.queue.entries()[id].var_behavior {
            self.queue
                .mark_sidecar(self.fs.as_ref(), id, Sidecar::VariableBehavior, true)?;
            self.queue.queued_variable += 1;
        }

        Ok(fault)
    }

    /// Removes blocks from `in_buf` as long as the trace checksum stays the same.
    ///
    /// Block sizes start at a sixteenth of the length (rounded up to a power of
    /// two) and halve down to a 1024th, never below `TRIM_MIN_BYTES`. Committed
    /// removals are written back to the entry's file, also when a stop request
    /// cuts the pass short.
    pub(super) fn trim(&mut self, id: EntryId, in_buf: &mut Vec<u8>) -> Result<RunOutcome, FuzzError> {
        if in_buf.len() < 5 {
            return Ok(RunOutcome::Ok);
        }

        let exec_cksum = self.queue.entries()[id].exec_cksum;
        self.counters.bytes_trim_in += in_buf.len() as u64;

        let mut len_p2 = in_buf.len().next_power_of_two();
        let mut remove_len = (len_p2 / TRIM_START_STEPS).max(TRIM_MIN_BYTES);
        let mut fault = RunOutcome::Ok;
        let mut clean_trace: Option<Bitmap> = None;
        let mut candidate = Vec::with_capacity(in_buf.len());

        'passes: while remove_len >= (len_p2 / TRIM_END_STEPS).max(TRIM_MIN_BYTES) {
            let mut remove_pos = remove_len;
            debug!("Trimming entry #{id} in steps of {remove_len} bytes");

            while remove_pos < in_buf.len() {
                let trim_avail = remove_len.min(in_buf.len() - remove_pos);

                candidate.clear();
                candidate.extend_from_slice(&in_buf[..remove_pos]);
                candidate.extend_from_slice(&in_buf[remove_pos + trim_avail..]);
                self.write_to_testcase(&candidate)?;
                fault = self.run_target(&candidate, self.exec_timeout);
                self.counters.trim_execs += 1;

                if self.stop_requested() || matches!(fault, RunOutcome::Error(_)) {
                    break 'passes;
                }

                if self.trace.hash32() == exec_cksum {
                    in_buf.drain(remove_pos..remove_pos + trim_avail);
                    len_p2 = in_buf.len().next_power_of_two();
                    if clean_trace.is_none() {
                        clean_trace = Some(self.trace.clone());
                    }
                } else {
                    remove_pos += remove_len;
                }
            }
            remove_len >>= 1;
        }

        if let Some(clean) = clean_trace {
            let path = self.queue.entries()[id].path.clone();
            // The entry may be a hard link to a seed; never write through it.
            let _ = self.fs.delete_file(&path);
            self.fs
                .create_new(&path, in_buf)
                .map_err(|e| io_error(&path, e))?;
            if let Some(entry) = self.queue.get_mut(id) {
                entry.len = in_buf.len();
            }
            self.trace.copy_from(&clean);
            self.top_rated
                .update_bitmap_score(&mut self.queue, id, &self.trace);
        }

        self.counters.bytes_trim_out += in_buf.len() as u64;
        Ok(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{FnExecutor, engine_with, prefix_trace};
    use super::*;
    use crate::executor::ExecStatus;
    use crate::queue::sidecar_path;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::tempdir;

    #[test]
    fn calibration_records_timing_and_score() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"ABCDEFGH")],
            |_| {},
            FnExecutor(|input: &[u8], trace: &mut [u8]| {
                prefix_trace(input, trace);
                ExecStatus::Ok
            }),
        );
        engine.prepare().unwrap();

        let entry = &engine.queue().entries()[0];
        assert_eq!(entry.cal_failed, 0);
        assert_eq!(entry.bitmap_size, 6);
        assert!(!entry.var_behavior);
        assert!(entry.has_new_cov);
        assert_eq!(engine.counters().total_cal_cycles, 8);
        assert_eq!(engine.top_rated.get(0), Some(0));
        assert_eq!(engine.counters().execs_done, 8);
    }

    #[test]
    fn fast_cal_runs_fewer_cycles() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"ABCDEFGH")],
            |s| s.fast_cal = true,
            FnExecutor(|input: &[u8], trace: &mut [u8]| {
                prefix_trace(input, trace);
                ExecStatus::Ok
            }),
        );
        engine.prepare().unwrap();
        assert_eq!(engine.counters().total_cal_cycles, 3);
    }

    #[test]
    fn flaky_edges_mark_variable_behavior() {
        let dir = tempdir().unwrap();
        let runs = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&runs);
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"ABCDEFGH")],
            |_| {},
            FnExecutor(move |_: &[u8], trace: &mut [u8]| {
                counter.set(counter.get() + 1);
                trace[0] = 1;
                if counter.get() % 2 == 0 {
                    trace[100] = 1;
                }
                ExecStatus::Ok
            }),
        );
        engine.prepare().unwrap();

        let entry = &engine.queue().entries()[0];
        assert!(entry.var_behavior);
        assert_eq!(engine.queue().queued_variable, 1);
        assert_eq!(engine.var_bytes.as_slice()[100], 1);
        assert_eq!(engine.var_bytes.as_slice()[0], 0);
        assert_eq!(runs.get(), 40);
        assert!(sidecar_path(&entry.path, Sidecar::VariableBehavior).exists());
    }

    #[test]
    fn abort_keeps_partial_bookkeeping() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"ABCDEFGH")],
            |s| s.skip_crashes = true,
            FnExecutor(|input: &[u8], trace: &mut [u8]| {
                prefix_trace(input, trace);
                if input == b"crash now" {
                    ExecStatus::Crash(11)
                } else {
                    ExecStatus::Ok
                }
            }),
        );
        engine.prepare().unwrap();
        let before = engine.counters().total_cal_cycles;

        let res = engine.calibrate(0, b"crash now", 0, false).unwrap();
        assert_eq!(res, RunOutcome::Crash { reason: 11 });
        assert_eq!(engine.queue().entries()[0].cal_failed, 1);
        assert_eq!(engine.counters().total_cal_cycles, before);
    }

    #[test]
    fn trim_preserves_checksum_and_never_grows() {
        let dir = tempdir().unwrap();
        let seed: Vec<u8> = (0u8..64).collect();
        let mut engine = engine_with(
            dir.path(),
            &[("a", seed.as_slice())],
            |_| {},
            FnExecutor(|input: &[u8], trace: &mut [u8]| {
                prefix_trace(input, trace);
                if input.len() < 5 {
                    trace[2000] = 1;
                }
                ExecStatus::Ok
            }),
        );
        engine.prepare().unwrap();
        let cksum = engine.queue().entries()[0].exec_cksum;

        let mut buf = seed.clone();
        let res = engine.trim(0, &mut buf).unwrap();
        assert_eq!(res, RunOutcome::Ok);
        assert!(buf.len() < seed.len());
        assert_eq!(&buf[..5], &seed[..5]);

        let entry = &engine.queue().entries()[0];
        assert_eq!(entry.len, buf.len());
        assert_eq!(std::fs::read(&entry.path).unwrap(), buf);
        assert_eq!(engine.trace.hash32(), cksum);
        // The seed the entry was linked from is untouched.
        assert_eq!(std::fs::read(dir.path().join("in").join("a")).unwrap(), seed);
        assert_eq!(engine.counters().bytes_trim_in, 64);
        assert_eq!(engine.counters().bytes_trim_out, buf.len() as u64);
    }

    #[test]
    fn short_inputs_are_not_trimmed() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"ABCD")],
            |_| {},
            FnExecutor(|input: &[u8], trace: &mut [u8]| {
                prefix_trace(input, trace);
                ExecStatus::Ok
            }),
        );
        engine.prepare().unwrap();
        let execs = engine.counters().execs_done;
        let mut buf = b"ABCD".to_vec();
        assert_eq!(engine.trim(0, &mut buf).unwrap(), RunOutcome::Ok);
        assert_eq!(buf, b"ABCD");
        assert_eq!(engine.counters().execs_done, execs);
    }
}
