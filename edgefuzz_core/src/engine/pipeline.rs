//! Run+save pipeline shared by every mutation stage.

use super::stage::{StageContext, StageResult};
use super::{Engine, RunOutcome};
use crate::bitmap::NewBits;
use crate::constants::{KEEP_UNIQUE_CRASH, KEEP_UNIQUE_HANG, TMOUT_LIMIT};
use crate::error::{FuzzError, io_error};
use crate::stats::unix_time;
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;

impl Engine {
    /// Runs one mutated input and keeps it if it is interesting.
    ///
    /// # Returns
    /// `AbandonEntry` when a stop or skip was requested or the timeout streak
    /// ran past `TMOUT_LIMIT`, `Continue` otherwise.
    pub(super) fn common_fuzz_stuff(
        &mut self,
        data: &[u8],
        ctx: &StageContext,
    ) -> Result<StageResult, FuzzError> {
        self.write_to_testcase(data)?;
        let fault = self.run_target(data, self.exec_timeout);
        if self.stop_requested() {
            return Ok(StageResult::AbandonEntry);
        }

        if fault == RunOutcome::Timeout {
            let streak = self.counters.subseq_tmouts;
            self.counters.subseq_tmouts += 1;
            if streak > TMOUT_LIMIT {
                debug!("Too many timeouts in a row, abandoning entry #{}", ctx.source);
                self.counters.cur_skipped_paths += 1;
                return Ok(StageResult::AbandonEntry);
            }
        } else {
            self.counters.subseq_tmouts = 0;
        }

        if self.skip.swap(false, Ordering::Relaxed) {
            self.counters.cur_skipped_paths += 1;
            return Ok(StageResult::AbandonEntry);
        }

        if self.save_if_interesting(data, fault, ctx)? {
            self.counters.queued_discovered += 1;
        }
        self.maybe_report()?;
        Ok(StageResult::Continue)
    }

    /// Decides whether an execution is worth keeping and writes it out.
    ///
    /// # Returns
    /// `true` if the input was added to the queue. Crashes and hangs are saved
    /// as a side effect but do not count.
    pub(super) fn save_if_interesting(
        &mut self,
        data: &[u8],
        fault: RunOutcome,
        ctx: &StageContext,
    ) -> Result<bool, FuzzError> {
        let mut keeping = false;

        if self.is_expected_fault(&fault) {
            let new_bits = self.check_new_bits();
            if new_bits == NewBits::None {
                if self.settings.crash_mode {
                    self.counters.total_crashes += 1;
                }
                return Ok(false);
            }
            self.add_to_queue(data, new_bits == NewBits::NewTuple, ctx)?;
            keeping = true;
        }

        let reason = match fault {
            RunOutcome::Timeout => match self.keep_as_hang(data, ctx)? {
                Some(reason) => reason,
                None => return Ok(keeping),
            },
            RunOutcome::Crash { reason } => reason,
            RunOutcome::Error(msg) => {
                error!("Unable to execute target application ({msg})");
                return Err(FuzzError::TargetExecution(msg));
            }
            _ => return Ok(keeping),
        };
        self.keep_as_crash(data, reason, ctx)?;
        Ok(keeping)
    }

    fn add_to_queue(
        &mut self,
        data: &[u8],
        new_cov: bool,
        ctx: &StageContext,
    ) -> Result<(), FuzzError> {
        let id = self.queue.len();
        let name = if self.settings.simple_files {
            format!("id_{id:06}")
        } else {
            format!("id={id:06},{}", ctx.describe(new_cov))
        };
        let path = self.layout.queue_dir.join(&name);

        let new_id = self.queue.add(path.clone(), data.len(), false);
        let cksum = self.trace.hash32();
        if let Some(entry) = self.queue.get_mut(new_id) {
            entry.exec_cksum = cksum;
            if new_cov {
                entry.has_new_cov = true;
            }
        }
        if new_cov {
            self.queue.queued_with_cov += 1;
        }

        let handicap = self.queue_cycle.saturating_sub(1);
        if let RunOutcome::Error(msg) = self.calibrate(new_id, data, handicap, false)? {
            error!("Unable to execute target application ({msg})");
            return Err(FuzzError::TargetExecution(msg));
        }

        self.fs
            .create_new(&path, data)
            .map_err(|e| io_error(&path, e))?;
        self.counters.last_path_time = unix_time();
        debug!("New path: {name}");
        Ok(())
    }

    /// Handles a timeout. A hang is saved only if its simplified trace is new
    /// and, when the hang timeout is longer, it still times out on a rerun.
    ///
    /// # Returns
    /// The crash reason when the rerun crashed instead.
    fn keep_as_hang(
        &mut self,
        data: &[u8],
        ctx: &StageContext,
    ) -> Result<Option<i32>, FuzzError> {
        self.counters.total_tmouts += 1;
        if self.counters.unique_hangs >= KEEP_UNIQUE_HANG {
            return Ok(None);
        }
        if !self.settings.dumb_mode {
            self.trace.simplify_in_place();
            if self.trace.has_new_bits(&mut self.virgin_tmout) == NewBits::None {
                return Ok(None);
            }
        }
        self.counters.unique_tmouts += 1;

        if self.exec_timeout < self.hang_timeout {
            self.write_to_testcase(data)?;
            match self.run_target(data, self.hang_timeout) {
                RunOutcome::Timeout => {}
                RunOutcome::Crash { reason } => return Ok(Some(reason)),
                RunOutcome::Error(msg) => {
                    warn!("Hang rerun failed to execute ({msg}), not saved");
                    return Ok(None);
                }
                _ => {
                    debug!(
                        "Timeout did not reproduce at {} ms, not saved",
                        self.hang_timeout
                    );
                    return Ok(None);
                }
            }
        }

        let n = self.counters.unique_hangs;
        let name = if self.settings.simple_files {
            format!("id_{n:06}")
        } else {
            format!("id={n:06},{}", ctx.describe(false))
        };
        let path = self.layout.hangs_dir.join(&name);
        self.fs
            .create_new(&path, data)
            .map_err(|e| io_error(&path, e))?;
        self.counters.unique_hangs += 1;
        self.counters.last_hang_time = unix_time();
        info!("New hang: {name}");
        Ok(None)
    }

    fn keep_as_crash(
        &mut self,
        data: &[u8],
        reason: i32,
        ctx: &StageContext,
    ) -> Result<(), FuzzError> {
        self.counters.total_crashes += 1;
        if self.counters.unique_crashes >= KEEP_UNIQUE_CRASH {
            return Ok(());
        }
        if !self.settings.dumb_mode {
            self.trace.simplify_in_place();
            if self.trace.has_new_bits(&mut self.virgin_crash) == NewBits::None {
                return Ok(());
            }
        }
        if self.counters.unique_crashes == 0 {
            self.write_crash_readme();
        }

        let n = self.counters.unique_crashes;
        let name = if self.settings.simple_files {
            format!("id_{n:06}_{reason:02}")
        } else {
            format!("id={n:06},sig={reason:02},{}", ctx.describe(false))
        };
        let path = self.layout.crashes_dir.join(&name);
        self.fs
            .create_new(&path, data)
            .map_err(|e| io_error(&path, e))?;
        self.counters.unique_crashes += 1;
        self.counters.last_crash_time = unix_time();
        self.counters.last_crash_execs = self.counters.execs_done;
        info!("New crash: {name}");
        Ok(())
    }

    /// Best effort; a missing README never stops the session.
    fn write_crash_readme(&self) {
        let path = self.layout.crashes_dir.join("README.txt");
        let command = if self.command_line.is_empty() {
            self.executor.describe()
        } else {
            self.command_line.clone()
        };
        let text = format!(
            "Command line used to find this crash:\n\n{command}\n\n\
             If you can't reproduce a bug outside of the fuzzer, be sure to deliver the\n\
             input the same way and to allow the same execution timeout ({} ms).\n\n\
             Files are named id=<crash number>,sig=<signal or exit code>,<provenance>.\n\
             The provenance names the queue entry and stage that produced the input.\n",
            self.exec_timeout
        );
        if let Err(e) = self.fs.create_new(&path, text.as_bytes()) {
            debug!("Could not write {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{FnExecutor, engine_with, prefix_trace};
    use super::*;
    use crate::constants::TMOUT_LIMIT;
    use crate::executor::{ExecStatus, Executor};
    use crate::stats::Stage;
    use std::time::Duration;
    use tempfile::tempdir;

    fn crash_on_x(input: &[u8], trace: &mut [u8]) -> ExecStatus {
        prefix_trace(input, trace);
        match input.first() {
            Some(b'X') => ExecStatus::Crash(11),
            Some(b'T') => ExecStatus::Timeout,
            Some(b'E') => ExecStatus::Error("spawn failed".to_string()),
            _ => ExecStatus::Ok,
        }
    }

    /// Times out on `H` inputs at any timeout, on `F` inputs only under 500 ms,
    /// and crashes on `C` inputs once given 500 ms or more. `R` inputs time out
    /// under 500 ms and fail to execute beyond that.
    struct TimeoutTarget;

    impl Executor for TimeoutTarget {
        fn execute(&mut self, input: &[u8], timeout: Duration, trace: &mut [u8]) -> ExecStatus {
            prefix_trace(input, trace);
            let short = timeout < Duration::from_millis(500);
            match input.first() {
                Some(b'H') => ExecStatus::Timeout,
                Some(b'F') if short => ExecStatus::Timeout,
                Some(b'C') if short => ExecStatus::Timeout,
                Some(b'C') => ExecStatus::Crash(6),
                Some(b'R') if short => ExecStatus::Timeout,
                Some(b'R') => ExecStatus::Error("target vanished".to_string()),
                _ => ExecStatus::Ok,
            }
        }
    }

    fn havoc_ctx(rep: i32) -> StageContext {
        let mut ctx = StageContext::new(0);
        ctx.enter(Stage::Havoc, 100);
        ctx.cur_val = rep;
        ctx
    }

    fn file_names(dir: &std::path::Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn new_path_is_queued_with_provenance() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(dir.path(), &[("a", b"AAAA")], |_| {}, FnExecutor(crash_on_x));
        engine.prepare().unwrap();

        let ctx = havoc_ctx(3);
        assert_eq!(
            engine.common_fuzz_stuff(b"BAAA", &ctx).unwrap(),
            StageResult::Continue
        );
        assert_eq!(engine.queue().len(), 2);
        let entry = &engine.queue().entries()[1];
        assert_eq!(entry.file_name(), "id=000001,src=000000,op=havoc,rep=3,+cov");
        assert_eq!(std::fs::read(&entry.path).unwrap(), b"BAAA");
        assert!(entry.has_new_cov);
        assert_ne!(entry.exec_cksum, 0);
        assert_eq!(engine.counters().queued_discovered, 1);
        assert_ne!(engine.counters().last_path_time, 0);

        engine.common_fuzz_stuff(b"BAAA", &ctx).unwrap();
        assert_eq!(engine.queue().len(), 2);
        assert_eq!(engine.counters().queued_discovered, 1);
    }

    #[test]
    fn unique_crashes_are_saved_with_readme() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(dir.path(), &[("a", b"AAAA")], |_| {}, FnExecutor(crash_on_x));
        engine.set_command_line("edgefuzz -c fuzz.toml");
        engine.prepare().unwrap();

        let mut ctx = StageContext::new(0);
        ctx.enter(Stage::Flip1, 32);
        ctx.cur_byte = Some(0);
        engine.common_fuzz_stuff(b"XAAA", &ctx).unwrap();
        engine.common_fuzz_stuff(b"XAAA", &ctx).unwrap();
        engine.common_fuzz_stuff(b"XBAA", &ctx).unwrap();

        let crashes = engine.layout().crashes_dir.clone();
        assert_eq!(
            file_names(&crashes),
            vec![
                "README.txt",
                "id=000000,sig=11,src=000000,op=flip1,pos=0",
                "id=000001,sig=11,src=000000,op=flip1,pos=0",
            ]
        );
        let readme = std::fs::read_to_string(crashes.join("README.txt")).unwrap();
        assert!(readme.contains("edgefuzz -c fuzz.toml"));
        assert_eq!(engine.counters().total_crashes, 3);
        assert_eq!(engine.counters().unique_crashes, 2);
        assert_eq!(engine.counters().last_crash_execs, engine.counters().execs_done);
        assert_eq!(engine.queue().len(), 1);
    }

    #[test]
    fn hangs_are_confirmed_with_the_hang_timeout() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"AAAA")],
            |s| {
                s.timeout_ms = Some(100);
                s.hang_timeout_ms = Some(1000);
            },
            TimeoutTarget,
        );
        engine.prepare().unwrap();

        engine.common_fuzz_stuff(b"HAAA", &havoc_ctx(1)).unwrap();
        engine.common_fuzz_stuff(b"FAAA", &havoc_ctx(2)).unwrap();
        engine.common_fuzz_stuff(b"CAAA", &havoc_ctx(3)).unwrap();

        assert_eq!(
            file_names(&engine.layout().hangs_dir),
            vec!["id=000000,src=000000,op=havoc,rep=1"]
        );
        assert_eq!(engine.counters().total_tmouts, 3);
        assert_eq!(engine.counters().unique_tmouts, 3);
        assert_eq!(engine.counters().unique_hangs, 1);
        assert_ne!(engine.counters().last_hang_time, 0);

        let crashes = file_names(&engine.layout().crashes_dir);
        assert!(crashes.contains(&"id=000000,sig=06,src=000000,op=havoc,rep=3".to_string()));
        assert_eq!(engine.counters().unique_crashes, 1);
    }

    #[test]
    fn failed_hang_rerun_is_dropped() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"AAAA")],
            |s| {
                s.timeout_ms = Some(100);
                s.hang_timeout_ms = Some(1000);
            },
            TimeoutTarget,
        );
        engine.prepare().unwrap();

        assert_eq!(
            engine.common_fuzz_stuff(b"RAAA", &havoc_ctx(1)).unwrap(),
            StageResult::Continue
        );
        assert!(file_names(&engine.layout().hangs_dir).is_empty());
        assert!(file_names(&engine.layout().crashes_dir).is_empty());
        assert_eq!(engine.counters().unique_hangs, 0);
        assert_eq!(engine.counters().total_tmouts, 1);

        engine.common_fuzz_stuff(b"HAAA", &havoc_ctx(2)).unwrap();
        assert_eq!(engine.counters().unique_hangs, 1);
    }

    #[test]
    fn timeout_streak_abandons_entry() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"AAAA")],
            |s| s.hang_timeout_ms = Some(1000),
            FnExecutor(crash_on_x),
        );
        engine.prepare().unwrap();

        let ctx = havoc_ctx(0);
        for _ in 0..=TMOUT_LIMIT {
            assert_eq!(
                engine.common_fuzz_stuff(b"TAAA", &ctx).unwrap(),
                StageResult::Continue
            );
        }
        assert_eq!(
            engine.common_fuzz_stuff(b"TAAA", &ctx).unwrap(),
            StageResult::AbandonEntry
        );
        assert_eq!(engine.counters().cur_skipped_paths, 1);
        assert_eq!(engine.counters().unique_hangs, 1);

        engine.common_fuzz_stuff(b"AAAA", &ctx).unwrap();
        assert_eq!(engine.counters().subseq_tmouts, 0);
    }

    #[test]
    fn simple_file_names() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"AAAA")],
            |s| {
                s.simple_files = true;
                s.hang_timeout_ms = Some(1000);
            },
            FnExecutor(crash_on_x),
        );
        engine.prepare().unwrap();
        assert_eq!(engine.queue().entries()[0].file_name(), "id_000000");

        let ctx = havoc_ctx(0);
        engine.common_fuzz_stuff(b"BAAA", &ctx).unwrap();
        engine.common_fuzz_stuff(b"XAAA", &ctx).unwrap();
        engine.common_fuzz_stuff(b"TAAA", &ctx).unwrap();

        assert_eq!(engine.queue().entries()[1].file_name(), "id_000001");
        let crashes = file_names(&engine.layout().crashes_dir);
        assert!(crashes.contains(&"id_000000_11".to_string()));
        assert_eq!(file_names(&engine.layout().hangs_dir), vec!["id_000000"]);
    }

    #[test]
    fn execution_error_is_fatal() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(dir.path(), &[("a", b"AAAA")], |_| {}, FnExecutor(crash_on_x));
        engine.prepare().unwrap();
        assert!(matches!(
            engine.common_fuzz_stuff(b"EAAA", &havoc_ctx(0)),
            Err(FuzzError::TargetExecution(_))
        ));
    }
}
