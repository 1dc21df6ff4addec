//! The fuzzing engine: session setup, the queue cycle loop and persistence.
//!
//! The mutation stages, calibration and the save pipeline live in the
//! submodules; they all operate on the single [`Engine`] value, which owns every
//! piece of mutable fuzzing state.

mod calibrate;
mod deterministic;
mod havoc;
mod pipeline;
mod stage;

pub use stage::EntryOutcome;

use crate::bitmap::{Bitmap, NewBits};
use crate::config::FuzzerSettings;
use crate::constants::{
    CAL_CHANCES, CUR_INPUT_FILENAME, EXEC_TIMEOUT, EXEC_TM_ROUND, FUZZ_BITMAP_FILENAME,
    FUZZER_STATS_FILENAME, MAP_SIZE, MAX_FILE, OUTPUT_GRACE,
};
use crate::error::{FuzzError, io_error};
use crate::executor::{ExecStatus, Executor};
use crate::extras::ExtrasStore;
use crate::fs::FileSystem;
use crate::queue::{AUTO_EXTRAS_DIR, EntryId, Queue, STATE_DIR, Sidecar, TopRated};
use crate::stats::{FuzzerStats, RunCounters, StageStats, unix_time};
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Outcome of one engine-level target run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Ok,
    Timeout,
    Crash { reason: i32 },
    Error(String),
    /// The first calibration run produced an empty trace.
    NoInstrumentation,
    /// A first calibration saw nothing the virgin map had not already seen.
    NoNewBits,
    Stopping,
}

/// Where the execution timeout came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeoutSource {
    Auto,
    Fixed,
    Resumed,
}

/// Paths inside the output directory.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub out_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub crashes_dir: PathBuf,
    pub hangs_dir: PathBuf,
}

impl OutputLayout {
    pub fn new(out_dir: &Path) -> Self {
        Self {
            out_dir: out_dir.to_path_buf(),
            queue_dir: out_dir.join("queue"),
            crashes_dir: out_dir.join("crashes"),
            hangs_dir: out_dir.join("hangs"),
        }
    }

    pub fn state_dir(&self, kind: Sidecar) -> PathBuf {
        self.queue_dir.join(STATE_DIR).join(kind.dir_name())
    }

    pub fn auto_extras_dir(&self) -> PathBuf {
        self.queue_dir.join(STATE_DIR).join(AUTO_EXTRAS_DIR)
    }

    pub fn stats_file(&self) -> PathBuf {
        self.out_dir.join(FUZZER_STATS_FILENAME)
    }

    pub fn bitmap_file(&self) -> PathBuf {
        self.out_dir.join(FUZZ_BITMAP_FILENAME)
    }

    pub fn resume_dir(&self) -> PathBuf {
        self.out_dir.join("_resume")
    }
}

pub struct Engine {
    settings: FuzzerSettings,
    executor: Box<dyn Executor>,
    fs: Box<dyn FileSystem>,
    rng: ChaCha8Rng,
    layout: OutputLayout,
    /// Directory the seeds are read from.
    seed_dir: PathBuf,

    queue: Queue,
    top_rated: TopRated,
    extras: ExtrasStore,

    trace: Bitmap,
    virgin_bits: Bitmap,
    virgin_tmout: Bitmap,
    virgin_crash: Bitmap,
    var_bytes: Bitmap,

    exec_timeout: u64,
    hang_timeout: u64,
    timeout_source: TimeoutSource,
    havoc_div: u32,

    queue_cycle: u64,
    cycles_wo_finds: u64,
    prev_queued: usize,
    use_splicing: bool,
    current_entry: EntryId,
    seek_to: usize,
    resuming_fuzz: bool,
    bitmap_changed: bool,
    auto_changed: bool,
    prepared: bool,

    counters: RunCounters,
    stage_stats: StageStats,

    stop: Arc<AtomicBool>,
    skip: Arc<AtomicBool>,
    start_time: u64,
    started: Instant,
    last_stats_write: Instant,
    command_line: String,
}

impl Engine {
    /// Builds an engine over the given collaborators.
    ///
    /// Only validates the settings; nothing touches the file system until
    /// [`Engine::prepare`].
    pub fn new(
        settings: FuzzerSettings,
        executor: Box<dyn Executor>,
        fs: Box<dyn FileSystem>,
        rng: ChaCha8Rng,
    ) -> Result<Self, FuzzError> {
        if let Err(e) = settings.validate() {
            error!("{e}");
            return Err(e);
        }

        let layout = OutputLayout::new(&settings.output_dir);
        let (exec_timeout, timeout_source) = match settings.timeout_ms {
            Some(t) => (t, TimeoutSource::Fixed),
            None => (EXEC_TIMEOUT, TimeoutSource::Auto),
        };
        let hang_timeout = settings.hang_timeout();
        let seed_dir = settings.input_dir.clone();

        Ok(Self {
            settings,
            executor,
            fs,
            rng,
            layout,
            seed_dir,
            queue: Queue::new(),
            top_rated: TopRated::new(MAP_SIZE),
            extras: ExtrasStore::new(),
            trace: Bitmap::new(MAP_SIZE),
            virgin_bits: Bitmap::virgin(MAP_SIZE),
            virgin_tmout: Bitmap::virgin(MAP_SIZE),
            virgin_crash: Bitmap::virgin(MAP_SIZE),
            var_bytes: Bitmap::new(MAP_SIZE),
            exec_timeout,
            hang_timeout,
            timeout_source,
            havoc_div: 1,
            queue_cycle: 0,
            cycles_wo_finds: 0,
            prev_queued: 0,
            use_splicing: false,
            current_entry: 0,
            seek_to: 0,
            resuming_fuzz: false,
            bitmap_changed: true,
            auto_changed: false,
            prepared: false,
            counters: RunCounters::default(),
            stage_stats: StageStats::default(),
            stop: Arc::new(AtomicBool::new(false)),
            skip: Arc::new(AtomicBool::new(false)),
            start_time: unix_time(),
            started: Instant::now(),
            last_stats_write: Instant::now(),
            command_line: String::new(),
        })
    }

    /// Flag that ends the session after the current execution.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Flag that abandons the current queue entry after the current execution.
    pub fn skip_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.skip)
    }

    /// Command line recorded in `fuzzer_stats`.
    pub fn set_command_line(&mut self, command_line: impl Into<String>) {
        self.command_line = command_line.into();
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn counters(&self) -> &RunCounters {
        &self.counters
    }

    pub fn stage_stats(&self) -> &StageStats {
        &self.stage_stats
    }

    pub fn extras(&self) -> &ExtrasStore {
        &self.extras
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn exec_timeout(&self) -> u64 {
        self.exec_timeout
    }

    pub fn queue_cycle(&self) -> u64 {
        self.queue_cycle
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn is_expected_fault(&self, fault: &RunOutcome) -> bool {
        if self.settings.crash_mode {
            matches!(fault, RunOutcome::Crash { .. })
        } else {
            *fault == RunOutcome::Ok
        }
    }

    fn case_prefix(&self) -> &'static str {
        if self.settings.simple_files { "id_" } else { "id=" }
    }

    /// Number of finds so far; stages report the delta.
    fn find_count(&self) -> u64 {
        self.queue.len() as u64 + self.counters.unique_crashes
    }

    fn run_over_10m(&self) -> bool {
        self.started.elapsed() > Duration::from_secs(10 * 60)
    }

    /// Tests the current trace against the normal virgin map.
    fn check_new_bits(&mut self) -> NewBits {
        let found = self.trace.has_new_bits(&mut self.virgin_bits);
        if found != NewBits::None {
            self.bitmap_changed = true;
        }
        found
    }

    /// Runs the target once and classifies the fresh trace.
    fn run_target(&mut self, input: &[u8], timeout_ms: u64) -> RunOutcome {
        self.trace.clear();
        let status = self.executor.execute(
            input,
            Duration::from_millis(timeout_ms),
            self.trace.as_mut_slice(),
        );
        self.counters.execs_done += 1;
        if let Some(max) = self.settings.max_execs {
            if self.counters.execs_done >= max {
                self.stop.store(true, Ordering::Relaxed);
            }
        }
        self.trace.classify_counts_in_place();

        if self.stop_requested() {
            return RunOutcome::Stopping;
        }
        match status {
            ExecStatus::Ok => RunOutcome::Ok,
            ExecStatus::Timeout => RunOutcome::Timeout,
            ExecStatus::Crash(reason) => RunOutcome::Crash { reason },
            ExecStatus::Error(msg) => RunOutcome::Error(msg),
        }
    }

    /// Mirrors the input into the scratch file the target may read.
    fn write_to_testcase(&self, data: &[u8]) -> Result<(), FuzzError> {
        let path = match &self.settings.target_file {
            Some(path) => path.clone(),
            None => self.layout.out_dir.join(CUR_INPUT_FILENAME),
        };
        self.fs
            .replace_file(&path, data)
            .map_err(|e| io_error(&path, e))
    }

    /// Runs session setup: output directory, seeds, extras, timeouts and the
    /// dry run. Must succeed before [`Engine::fuzz_loop`] does anything.
    pub fn prepare(&mut self) -> Result<(), FuzzError> {
        info!(
            "Preparing session: {} -> {}",
            self.settings.input_dir.display(),
            self.settings.output_dir.display()
        );
        self.setup_dirs()?;
        self.read_testcases()?;
        self.load_auto_extras();
        self.pivot_inputs()?;
        if let Some(path) = self.settings.extras.clone() {
            self.extras.load_user(self.fs.as_ref(), &path)?;
        }
        if self.timeout_source == TimeoutSource::Auto {
            self.find_timeout();
        }
        if let Some(path) = self.settings.fuzz_bitmap.clone() {
            self.read_bitmap(&path)?;
        }

        self.start_time = unix_time();
        self.started = Instant::now();
        self.perform_dry_run()?;
        self.queue
            .cull(&mut self.top_rated, self.settings.dumb_mode, self.fs.as_ref())?;
        self.init_timing();
        self.seek_to = self.find_start_position();
        self.write_stats()?;
        self.save_auto()?;
        self.prepared = true;
        Ok(())
    }

    /// Prepares the session if needed, then fuzzes until stopped.
    pub fn run(&mut self) -> Result<(), FuzzError> {
        if !self.prepared {
            self.prepare()?;
        }
        self.fuzz_loop()
    }

    /// Cycles through the queue until a stop request or a configured limit.
    pub fn fuzz_loop(&mut self) -> Result<(), FuzzError> {
        if !self.prepared {
            self.prepare()?;
        }

        let mut next: Option<EntryId> = None;
        while !self.stop_requested() {
            self.queue
                .cull(&mut self.top_rated, self.settings.dumb_mode, self.fs.as_ref())?;

            let id = match next {
                Some(id) => id,
                None => {
                    if let Some(max) = self.settings.max_cycles {
                        if self.queue_cycle >= max {
                            info!("Completed {max} queue cycles, stopping.");
                            break;
                        }
                    }
                    self.start_cycle()
                }
            };

            self.current_entry = id;
            let outcome = self.fuzz_one(id)?;
            debug!("Entry #{id}: {outcome:?}");
            self.maybe_report()?;

            next = (id + 1 < self.queue.len()).then_some(id + 1);
        }

        self.write_stats()?;
        self.write_bitmap()?;
        self.save_auto()?;
        self.log_status();
        info!(
            "Session finished after {} execs, {} unique crashes, {} unique hangs.",
            self.counters.execs_done, self.counters.unique_crashes, self.counters.unique_hangs
        );
        Ok(())
    }

    /// Bookkeeping at the top of a queue cycle; returns the first entry to fuzz.
    fn start_cycle(&mut self) -> EntryId {
        self.queue_cycle += 1;
        self.counters.cur_skipped_paths = 0;

        let first = std::mem::take(&mut self.seek_to);
        let first = if first < self.queue.len() { first } else { 0 };

        if self.queue.len() == self.prev_queued {
            if self.use_splicing {
                self.cycles_wo_finds += 1;
            } else {
                self.use_splicing = !self.settings.ignore_finds;
            }
        } else {
            self.cycles_wo_finds = 0;
        }
        self.prev_queued = self.queue.len();

        info!(
            "Entering queue cycle {} ({} paths, {} favored, {} pending, {} cycles without finds).",
            self.queue_cycle,
            self.queue.len(),
            self.queue.favored,
            self.queue.pending_not_fuzzed,
            self.cycles_wo_finds
        );
        first
    }

    fn setup_dirs(&mut self) -> Result<(), FuzzError> {
        let out_dir = self.layout.out_dir.clone();
        if self.fs.exists(&out_dir) {
            self.maybe_delete_out_dir()?;
        } else if self.settings.resume {
            error!(
                "Resume attempted but old output directory {} not found",
                out_dir.display()
            );
            return Err(FuzzError::ResumeWithoutOutput(out_dir));
        }

        if self.settings.resume {
            self.seed_dir = self.layout.resume_dir();
        }

        let mut dirs = vec![
            out_dir,
            self.layout.queue_dir.clone(),
            self.layout.auto_extras_dir(),
        ];
        for kind in [
            Sidecar::DeterministicDone,
            Sidecar::RedundantEdges,
            Sidecar::VariableBehavior,
        ] {
            dirs.push(self.layout.state_dir(kind));
        }
        dirs.push(self.layout.crashes_dir.clone());
        dirs.push(self.layout.hangs_dir.clone());
        for dir in dirs {
            self.fs.ensure_dir(&dir).map_err(|e| io_error(&dir, e))?;
        }
        Ok(())
    }

    /// Clears a previous session out of the output directory.
    ///
    /// Refuses when the old session ran long enough to be worth keeping, unless
    /// this is an in-place resume.
    fn maybe_delete_out_dir(&mut self) -> Result<(), FuzzError> {
        let resume = self.settings.resume;
        let stats_path = self.layout.stats_file();
        if !resume {
            if let Ok(Some(stats)) = FuzzerStats::load(self.fs.as_ref(), &stats_path) {
                if stats.run_time_secs() > OUTPUT_GRACE * 60 {
                    error!(
                        "The job output directory {} already exists and contains the results \
                         of more than {OUTPUT_GRACE} minutes worth of fuzzing. To avoid data \
                         loss, remove it manually or point output-dir somewhere else. To resume \
                         the old session, set resume = true.",
                        self.layout.out_dir.display()
                    );
                    return Err(FuzzError::AtRiskOutput(self.layout.out_dir.clone()));
                }
            }
        }

        if resume {
            let _ = self
                .fs
                .rename(&self.layout.queue_dir, &self.layout.resume_dir());
            info!("Output directory exists, will attempt session resume.");
        } else {
            info!("Output directory exists but deemed OK to reuse.");
        }
        info!("Deleting old session data...");

        let prefix = self.case_prefix();
        for kind in [
            Sidecar::DeterministicDone,
            Sidecar::RedundantEdges,
            Sidecar::VariableBehavior,
        ] {
            self.delete_files(&self.layout.state_dir(kind), prefix)?;
        }
        self.delete_files(&self.layout.auto_extras_dir(), "auto_")?;
        self.remove_dir(&self.layout.queue_dir.join(STATE_DIR))?;
        self.delete_files(&self.layout.queue_dir, prefix)?;

        if !resume {
            let _ = self.fs.delete_file(&self.layout.crashes_dir.join("README.txt"));
        }
        for dir in [self.layout.crashes_dir.clone(), self.layout.hangs_dir.clone()] {
            if resume && self.fs.is_dir(&dir) && self.fs.delete_dir(&dir, false).is_err() {
                let name = dir.file_name().unwrap_or_default().to_string_lossy();
                let backup = dir.with_file_name(format!("{name}_{}", unix_time()));
                self.fs.rename(&dir, &backup).map_err(|e| {
                    error!("Unable to back up {}: {e}", dir.display());
                    FuzzError::OutputCleanup(dir.clone())
                })?;
            }
            self.delete_files(&dir, prefix)?;
        }

        let out_dir = &self.layout.out_dir;
        let mut leftovers = vec![out_dir.join(CUR_INPUT_FILENAME), self.layout.bitmap_file()];
        if !resume {
            leftovers.push(stats_path);
        }
        for path in leftovers {
            match self.fs.delete_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    error!("Unable to remove {}: {e}", path.display());
                    return Err(FuzzError::OutputCleanup(path));
                }
            }
        }
        Ok(())
    }

    /// Deletes files whose names start with `prefix`, then the directory itself.
    ///
    /// Anything else left in the directory makes the removal fail, which is how
    /// unexpected files in an old output directory are detected.
    fn delete_files(&self, dir: &Path, prefix: &str) -> Result<(), FuzzError> {
        if !self.fs.exists(dir) {
            return Ok(());
        }
        let entries = self.fs.list_dir(dir).map_err(|e| io_error(dir, e))?;
        for path in entries {
            let matches = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with(prefix))
                .unwrap_or(false);
            if matches && !self.fs.is_dir(&path) {
                self.fs.delete_file(&path).map_err(|e| {
                    error!("Unable to remove {}: {e}", path.display());
                    FuzzError::OutputCleanup(path.clone())
                })?;
            }
        }
        self.remove_dir(dir)
    }

    fn remove_dir(&self, dir: &Path) -> Result<(), FuzzError> {
        match self.fs.delete_dir(dir, false) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!(
                    "Output directory cleanup failed at {}: {e}. It contains files this fuzzer \
                     did not create; remove them manually or use a different output-dir.",
                    dir.display()
                );
                Err(FuzzError::OutputCleanup(dir.to_path_buf()))
            }
        }
    }

    fn read_testcases(&mut self) -> Result<(), FuzzError> {
        let nested = self.seed_dir.join("queue");
        if self.fs.is_dir(&nested) {
            self.seed_dir = nested;
        }
        let dir = self.seed_dir.clone();
        info!("Scanning '{}'...", dir.display());

        let mut entries = self.fs.list_dir(&dir).map_err(|e| {
            error!("Unable to open input directory {}: {e}", dir.display());
            io_error(&dir, e)
        })?;
        if self.settings.shuffle_queue && entries.len() > 1 {
            entries.shuffle(&mut self.rng);
            info!("Shuffled the input queue.");
        }

        let det_done_dir = dir.join(STATE_DIR).join(Sidecar::DeterministicDone.dir_name());
        for path in entries {
            let info = self.fs.stat(&path).map_err(|e| io_error(&path, e))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if info.is_dir || info.len == 0 || name == "README.txt" {
                continue;
            }
            if info.len > MAX_FILE as u64 {
                error!(
                    "Test case '{}' is too big ({} bytes, limit is {MAX_FILE})",
                    path.display(),
                    info.len
                );
                return Err(FuzzError::SeedTooBig {
                    path,
                    len: info.len,
                    limit: MAX_FILE,
                });
            }
            let passed_det = self.fs.exists(&det_done_dir.join(&name));
            self.queue.add(path, info.len as usize, passed_det);
        }

        if self.queue.is_empty() {
            error!(
                "Looks like there are no valid test cases in the input directory {}. \
                 Seeds must be regular, non-empty files.",
                dir.display()
            );
            return Err(FuzzError::NoSeeds(dir));
        }
        self.counters.queued_at_start = self.queue.len() as u64;
        self.counters.last_path_time = 0;
        Ok(())
    }

    fn load_auto_extras(&mut self) {
        let dir = self.seed_dir.join(STATE_DIR).join(AUTO_EXTRAS_DIR);
        self.extras.load_auto(self.fs.as_ref(), &dir, &mut self.rng);
    }

    /// Links every seed into `out/queue/` under its session name.
    fn pivot_inputs(&mut self) -> Result<(), FuzzError> {
        info!("Creating hard links for all input files...");
        let prefix = self.case_prefix();

        for id in 0..self.queue.len() {
            let entry = &self.queue.entries()[id];
            let name = entry.file_name();
            let old_path = entry.path.clone();

            let new_name = if parse_case_id(&name, prefix) == Some(id) {
                self.resuming_fuzz = true;
                if let Some(parent_depth) = parse_src_id(&name)
                    .and_then(|src| self.queue.get(src))
                    .map(|parent| parent.depth)
                {
                    let depth = parent_depth + 1;
                    if let Some(entry) = self.queue.get_mut(id) {
                        entry.depth = depth;
                    }
                    self.queue.max_depth = self.queue.max_depth.max(depth);
                }
                name
            } else if self.settings.simple_files {
                format!("id_{id:06}")
            } else {
                let orig = name
                    .find(",orig=")
                    .map(|pos| &name[pos + 6..])
                    .unwrap_or(&name);
                format!("id={id:06},orig={orig}")
            };

            let new_path = self.layout.queue_dir.join(new_name);
            self.fs
                .link_or_copy(&old_path, &new_path)
                .map_err(|e| io_error(&new_path, e))?;

            let passed_det = match self.queue.get_mut(id) {
                Some(entry) => {
                    entry.path = new_path;
                    entry.passed_det
                }
                None => false,
            };
            if passed_det {
                self.queue
                    .mark_sidecar(self.fs.as_ref(), id, Sidecar::DeterministicDone, true)?;
            }
        }

        if self.settings.resume {
            let resume_dir = self.layout.resume_dir();
            if self.fs.delete_dir(&resume_dir, true).is_ok() {
                debug!("Removed {}", resume_dir.display());
            }
        }
        Ok(())
    }

    /// Location of the previous session's `fuzzer_stats` when resuming.
    fn resumed_stats_path(&self) -> PathBuf {
        if self.settings.resume {
            self.layout.stats_file()
        } else {
            self.seed_dir
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(FUZZER_STATS_FILENAME)
        }
    }

    /// Reuses the timeout of a resumed session.
    fn find_timeout(&mut self) {
        if !self.resuming_fuzz {
            return;
        }
        let path = self.resumed_stats_path();
        if let Ok(Some(stats)) = FuzzerStats::load(self.fs.as_ref(), &path) {
            if stats.exec_timeout > 4 {
                self.exec_timeout = stats.exec_timeout;
                self.timeout_source = TimeoutSource::Resumed;
            }
        }
    }

    fn find_start_position(&self) -> usize {
        if !self.resuming_fuzz {
            return 0;
        }
        let path = self.resumed_stats_path();
        match FuzzerStats::load(self.fs.as_ref(), &path) {
            Ok(Some(stats)) if (stats.cur_path as usize) < self.queue.len() => {
                stats.cur_path as usize
            }
            _ => 0,
        }
    }

    fn read_bitmap(&mut self, path: &Path) -> Result<(), FuzzError> {
        let bytes = self.fs.read_file(path).map_err(|e| io_error(path, e))?;
        if bytes.len() != MAP_SIZE {
            error!(
                "Bitmap {} has {} bytes, expected {MAP_SIZE}",
                path.display(),
                bytes.len()
            );
            return Err(FuzzError::InvalidSetting(format!(
                "fuzz-bitmap {} must be exactly {MAP_SIZE} bytes",
                path.display()
            )));
        }
        self.virgin_bits = Bitmap::from_bytes(bytes);
        Ok(())
    }

    /// Calibrates every seed and applies the seed failure policy.
    fn perform_dry_run(&mut self) -> Result<(), FuzzError> {
        for id in 0..self.queue.len() {
            let path = self.queue.entries()[id].path.clone();
            let name = self.queue.entries()[id].file_name();
            info!("Attempting dry run with '{name}'...");

            let data = self.fs.read_file(&path).map_err(|e| io_error(&path, e))?;
            let res = self.calibrate(id, &data, 0, true)?;
            if self.stop_requested() {
                return Ok(());
            }

            if res == RunOutcome::NoNewBits || self.is_expected_fault(&res) {
                let entry = &self.queue.entries()[id];
                debug!(
                    "len = {}, map size = {}, exec speed = {} us",
                    entry.len, entry.bitmap_size, entry.exec_us
                );
            }

            match res {
                RunOutcome::Ok => {
                    if self.settings.crash_mode {
                        error!(
                            "Test case '{name}' does *NOT* crash, but crash mode requires every \
                             seed to crash."
                        );
                        return Err(FuzzError::SeedDoesNotCrash(name));
                    }
                    info!("All right - new instrumentation output.");
                }
                RunOutcome::Timeout => {
                    if self.settings.skip_timeouts {
                        warn!("Test case '{name}' results in a timeout (skipping)");
                        self.reject_seed(id);
                    } else {
                        error!(
                            "Test case '{name}' results in a timeout ({} ms). The program may be \
                             stuck on this input or the timeout is too tight; raise timeout-ms, \
                             or set skip-timeouts to keep going.",
                            self.exec_timeout
                        );
                        return Err(FuzzError::SeedTimesOut {
                            name,
                            timeout_ms: self.exec_timeout,
                        });
                    }
                }
                RunOutcome::Crash { reason } => {
                    if self.settings.crash_mode {
                        info!("Seed crashes as expected (reason {reason}).");
                    } else if self.settings.skip_crashes {
                        warn!("Test case '{name}' results in a crash (skipping)");
                        self.reject_seed(id);
                    } else {
                        error!(
                            "Test case '{name}' results in a crash (reason {reason}). The target \
                             must handle the seeds cleanly before fuzzing can start; remove this \
                             input or set skip-crashes."
                        );
                        return Err(FuzzError::SeedCrashes(name));
                    }
                }
                RunOutcome::Error(msg) => {
                    error!("Unable to execute target application ({msg})");
                    return Err(FuzzError::TargetExecution(msg));
                }
                RunOutcome::NoInstrumentation => {
                    error!(
                        "No instrumentation detected while running '{name}'. The target did \
                         not report any coverage; check that it writes its trace map."
                    );
                    return Err(FuzzError::NoInstrumentation(name));
                }
                RunOutcome::NoNewBits => {
                    self.counters.useless_at_start += 1;
                    if self.settings.fuzz_bitmap.is_none() && !self.settings.shuffle_queue {
                        warn!("No new instrumentation output, test case '{name}' may be useless.");
                    }
                }
                RunOutcome::Stopping => return Ok(()),
            }

            if self.queue.entries()[id].var_behavior {
                warn!("Instrumentation output varies across runs of '{name}'.");
            }
        }

        let failures = self.counters.cal_failures as usize;
        if failures > 0 {
            if failures == self.queue.len() {
                error!("All test cases time out or crash, giving up!");
                return Err(FuzzError::AllSeedsRejected);
            }
            warn!("Skipped {failures} test cases that time out or crash.");
            if failures * 5 > self.queue.len() {
                warn!("High percentage of rejected test cases, check settings!");
            }
        }
        info!("All test cases processed.");
        Ok(())
    }

    fn reject_seed(&mut self, id: EntryId) {
        if let Some(entry) = self.queue.get_mut(id) {
            entry.cal_failed = CAL_CHANCES;
        }
        self.counters.cal_failures += 1;
    }

    /// Derives the havoc divisor and, when needed, the execution timeout from
    /// the dry run timings.
    fn init_timing(&mut self) {
        let avg_us = self.counters.avg_exec_us();
        let max_us = self.queue.iter().map(|e| e.exec_us).max().unwrap_or(0);
        let max_len = self.queue.iter().map(|e| e.len).max().unwrap_or(0);

        if avg_us > 10_000 {
            warn!("The target is slow ({} ms per exec).", avg_us / 1000);
        }
        self.havoc_div = match avg_us {
            us if us > 50_000 => 10,
            us if us > 20_000 => 5,
            us if us > 10_000 => 2,
            _ => 1,
        };

        if !self.resuming_fuzz {
            if max_len > 50 * 1024 {
                warn!("Some test cases are huge ({max_len} bytes).");
            } else if max_len > 10 * 1024 {
                warn!("Some test cases are big ({max_len} bytes).");
            }
            if self.counters.useless_at_start > 0 && self.settings.fuzz_bitmap.is_none() {
                warn!(
                    "{} test cases produced no new instrumentation output.",
                    self.counters.useless_at_start
                );
            }
            if self.queue.len() > 100 {
                warn!("You probably have far too many input files.");
            } else if self.queue.len() > 20 {
                warn!("You have lots of input files; try starting small.");
            }
        }

        info!(
            "Here are some useful stats: {} paths, {} favored, avg exec {} us, avg bitmap {} \
             edges, max depth {}.",
            self.queue.len(),
            self.queue.favored,
            avg_us,
            self.counters.avg_bitmap_size(),
            self.queue.max_depth
        );

        match self.timeout_source {
            TimeoutSource::Auto => {
                let scaled = if avg_us > 50_000 {
                    avg_us * 2 / 1000
                } else if avg_us > 10_000 {
                    avg_us * 3 / 1000
                } else {
                    avg_us * 5 / 1000
                };
                let t = scaled.max(max_us / 1000);
                let t = (t + EXEC_TM_ROUND) / EXEC_TM_ROUND * EXEC_TM_ROUND;
                self.exec_timeout = t.min(EXEC_TIMEOUT);
                self.timeout_source = TimeoutSource::Fixed;
                info!(
                    "No timeout specified, using exec timeout of {} ms.",
                    self.exec_timeout
                );
            }
            TimeoutSource::Resumed => {
                info!(
                    "Applying timeout settings from resumed session ({} ms).",
                    self.exec_timeout
                );
            }
            TimeoutSource::Fixed => {}
        }

        if self.settings.dumb_mode && self.settings.hang_timeout_ms.is_none() {
            self.hang_timeout = EXEC_TIMEOUT.min(self.exec_timeout * 2 + 100);
        }
        info!("All set and ready to roll!");
    }

    /// Writes stats, bitmap and auto extras when the update interval has passed.
    fn maybe_report(&mut self) -> Result<(), FuzzError> {
        let interval = Duration::from_secs(self.settings.stats_update_secs);
        if self.last_stats_write.elapsed() < interval {
            return Ok(());
        }
        self.write_stats()?;
        self.write_bitmap()?;
        self.save_auto()?;
        self.log_status();
        Ok(())
    }

    fn log_status(&self) {
        let secs = self.started.elapsed().as_secs_f64().max(0.001);
        let coverage =
            self.virgin_bits.count_non_255_bytes() as f64 * 100.0 / MAP_SIZE as f64;
        info!(
            "cycle {} | paths {} (fav {}, pending {}) | crashes {} | hangs {} | execs {} ({:.0}/s) | map {:.2}%",
            self.queue_cycle.saturating_sub(1),
            self.queue.len(),
            self.queue.favored,
            self.queue.pending_not_fuzzed,
            self.counters.unique_crashes,
            self.counters.unique_hangs,
            self.counters.execs_done,
            self.counters.execs_done as f64 / secs,
            coverage
        );
    }

    /// Builds the current `fuzzer_stats` snapshot.
    pub fn snapshot(&self) -> FuzzerStats {
        let secs = self.started.elapsed().as_secs_f64();
        let execs_per_sec = if secs > 0.0 {
            self.counters.execs_done as f64 / secs
        } else {
            0.0
        };
        let t_bytes = self.virgin_bits.count_non_255_bytes();
        let var_bytes = self.var_bytes.count_nonzero();
        let stability = if t_bytes > 0 {
            100.0 - var_bytes as f64 * 100.0 / t_bytes as f64
        } else {
            100.0
        };

        let mut stats = FuzzerStats {
            start_time: self.start_time,
            last_update: unix_time(),
            fuzzer_pid: std::process::id(),
            cycles_done: self.queue_cycle.saturating_sub(1),
            execs_done: self.counters.execs_done,
            execs_per_sec,
            paths_total: self.queue.len() as u64,
            paths_favored: self.queue.favored as u64,
            paths_found: self.counters.queued_discovered,
            max_depth: self.queue.max_depth,
            cur_path: self.current_entry as u64,
            pending_favs: self.queue.pending_favored as u64,
            pending_total: self.queue.pending_not_fuzzed as u64,
            variable_paths: self.queue.queued_variable as u64,
            stability,
            bitmap_cvg: t_bytes as f64 * 100.0 / MAP_SIZE as f64,
            unique_crashes: self.counters.unique_crashes,
            unique_hangs: self.counters.unique_hangs,
            last_path: self.counters.last_path_time,
            last_crash: self.counters.last_crash_time,
            last_hang: self.counters.last_hang_time,
            execs_since_crash: self.counters.execs_done - self.counters.last_crash_execs,
            exec_timeout: self.exec_timeout,
            afl_banner: self.settings.banner.clone().unwrap_or_else(|| {
                self.executor.describe()
            }),
            command_line: self.command_line.clone(),
            total_crashes: self.counters.total_crashes,
            total_tmouts: self.counters.total_tmouts,
            unique_tmouts: self.counters.unique_tmouts,
            trim_execs: self.counters.trim_execs,
            bytes_trim_in: self.counters.bytes_trim_in,
            bytes_trim_out: self.counters.bytes_trim_out,
            ..Default::default()
        };
        stats.fill_stage_stats(&self.stage_stats);
        stats
    }

    fn write_stats(&mut self) -> Result<(), FuzzError> {
        let path = self.layout.stats_file();
        self.snapshot().save(self.fs.as_ref(), &path).map_err(|e| {
            error!("Unable to write {}: {e}", path.display());
            FuzzError::Stats(e.to_string())
        })?;
        self.last_stats_write = Instant::now();
        Ok(())
    }

    fn write_bitmap(&mut self) -> Result<(), FuzzError> {
        if !self.bitmap_changed {
            return Ok(());
        }
        self.bitmap_changed = false;
        let path = self.layout.bitmap_file();
        self.fs
            .replace_file(&path, self.virgin_bits.as_slice())
            .map_err(|e| io_error(&path, e))
    }

    fn save_auto(&mut self) -> Result<(), FuzzError> {
        if !self.auto_changed {
            return Ok(());
        }
        self.auto_changed = false;
        self.extras
            .save_auto(self.fs.as_ref(), &self.layout.auto_extras_dir())
    }
}

/// Id encoded in an artifact name such as `id=000012,src=...`.
fn parse_case_id(name: &str, prefix: &str) -> Option<usize> {
    let rest = name.strip_prefix(prefix)?;
    let digits = rest.get(..6)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Parent id from the `src=NNNNNN` provenance field.
fn parse_src_id(name: &str) -> Option<usize> {
    let pos = name.find(",src=")?;
    let digits = name.get(pos + 5..pos + 11)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::fs::StdFileSystem;
    use rand_core::SeedableRng;

    /// Executor driven by a closure that returns the status directly.
    pub(crate) struct FnExecutor<F>(pub F);

    impl<F> Executor for FnExecutor<F>
    where
        F: FnMut(&[u8], &mut [u8]) -> ExecStatus,
    {
        fn execute(&mut self, input: &[u8], _timeout: Duration, trace: &mut [u8]) -> ExecStatus {
            (self.0)(input, trace)
        }
    }

    /// Writes the seeds into `<root>/in` and builds an engine over `<root>/out`.
    pub(crate) fn engine_with<E>(
        root: &Path,
        seeds: &[(&str, &[u8])],
        tweak: impl FnOnce(&mut FuzzerSettings),
        executor: E,
    ) -> Engine
    where
        E: Executor + 'static,
    {
        let in_dir = root.join("in");
        std::fs::create_dir_all(&in_dir).unwrap();
        for (name, data) in seeds {
            std::fs::write(in_dir.join(name), data).unwrap();
        }
        let mut settings = FuzzerSettings {
            input_dir: in_dir,
            output_dir: root.join("out"),
            timeout_ms: Some(1000),
            stats_update_secs: 3600,
            ..Default::default()
        };
        tweak(&mut settings);
        Engine::new(
            settings,
            Box::new(executor),
            Box::new(StdFileSystem),
            ChaCha8Rng::from_seed([42; 32]),
        )
        .unwrap()
    }

    /// Trace that depends only on the first five input bytes.
    pub(crate) fn prefix_trace(input: &[u8], trace: &mut [u8]) {
        trace[0] = 1;
        for (k, &b) in input.iter().take(5).enumerate() {
            trace[1 + k * 8 + (b as usize % 7)] += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::fs::StdFileSystem;
    use crate::queue::sidecar_path;
    use tempfile::tempdir;

    fn always_ok(input: &[u8], trace: &mut [u8]) -> ExecStatus {
        prefix_trace(input, trace);
        ExecStatus::Ok
    }

    #[test]
    fn artifact_names_parse() {
        assert_eq!(parse_case_id("id=000012,src=000003,op=havoc", "id="), Some(12));
        assert_eq!(parse_case_id("id_000004", "id_"), Some(4));
        assert_eq!(parse_case_id("id=12", "id="), None);
        assert_eq!(parse_case_id("seed.bin", "id="), None);
        assert_eq!(parse_src_id("id=000012,src=000003,op=havoc"), Some(3));
        assert_eq!(parse_src_id("id=000000,orig=seed"), None);
    }

    #[test]
    fn prepare_pivots_seeds_and_writes_stats() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("b.bin", b"BBBBBBBB"), ("a.bin", b"AAAAAAAA"), ("empty", b"")],
            |_| {},
            FnExecutor(always_ok),
        );
        engine.prepare().unwrap();

        assert_eq!(engine.queue().len(), 2);
        let names: Vec<String> = engine.queue().iter().map(|e| e.file_name()).collect();
        assert_eq!(names, vec!["id=000000,orig=a.bin", "id=000001,orig=b.bin"]);
        for entry in engine.queue().iter() {
            assert!(entry.path.exists());
            assert_eq!(entry.depth, 1);
            assert_ne!(entry.exec_cksum, 0);
        }
        assert_eq!(engine.counters().queued_at_start, 2);
        assert!(engine.layout().stats_file().exists());
        assert!(engine.layout().crashes_dir.is_dir());
        assert!(engine.layout().state_dir(Sidecar::VariableBehavior).is_dir());
        assert_eq!(engine.exec_timeout(), 1000);
    }

    #[test]
    fn auto_timeout_is_rounded() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"AAAA")],
            |s| s.timeout_ms = None,
            FnExecutor(always_ok),
        );
        engine.prepare().unwrap();
        assert_eq!(engine.exec_timeout() % EXEC_TM_ROUND, 0);
        assert!(engine.exec_timeout() >= EXEC_TM_ROUND);
    }

    #[test]
    fn missing_seeds_are_fatal() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(dir.path(), &[], |_| {}, FnExecutor(always_ok));
        assert!(matches!(engine.prepare(), Err(FuzzError::NoSeeds(_))));
    }

    #[test]
    fn crashing_seed_is_fatal_unless_skipped() {
        let dir = tempdir().unwrap();
        let crashy = |input: &[u8], trace: &mut [u8]| {
            prefix_trace(input, trace);
            if input.starts_with(b"CRASH") {
                ExecStatus::Crash(11)
            } else {
                ExecStatus::Ok
            }
        };
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"CRASH!"), ("b", b"fine.")],
            |_| {},
            FnExecutor(crashy),
        );
        assert!(matches!(engine.prepare(), Err(FuzzError::SeedCrashes(_))));

        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"CRASH!"), ("b", b"fine.")],
            |s| s.skip_crashes = true,
            FnExecutor(crashy),
        );
        engine.prepare().unwrap();
        assert_eq!(engine.queue().entries()[0].cal_failed, CAL_CHANCES);
        assert_eq!(engine.counters().cal_failures, 1);
    }

    #[test]
    fn all_rejected_seeds_are_fatal() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"slow")],
            |s| s.skip_timeouts = true,
            FnExecutor(|_: &[u8], trace: &mut [u8]| {
                trace[0] = 1;
                ExecStatus::Timeout
            }),
        );
        assert!(matches!(engine.prepare(), Err(FuzzError::AllSeedsRejected)));
    }

    #[test]
    fn empty_trace_means_no_instrumentation() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"data")],
            |_| {},
            FnExecutor(|_: &[u8], _: &mut [u8]| ExecStatus::Ok),
        );
        assert!(matches!(
            engine.prepare(),
            Err(FuzzError::NoInstrumentation(_))
        ));
    }

    #[test]
    fn long_running_output_is_protected() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let stats = FuzzerStats {
            start_time: 1_000,
            last_update: 1_000 + OUTPUT_GRACE * 60 + 1,
            ..Default::default()
        };
        stats
            .save(&StdFileSystem, &out.join(FUZZER_STATS_FILENAME))
            .unwrap();

        let mut engine = engine_with(dir.path(), &[("a", b"AAAA")], |_| {}, FnExecutor(always_ok));
        assert!(matches!(engine.prepare(), Err(FuzzError::AtRiskOutput(_))));
    }

    #[test]
    fn unexpected_files_block_cleanup() {
        let dir = tempdir().unwrap();
        let queue = dir.path().join("out").join("queue");
        std::fs::create_dir_all(&queue).unwrap();
        std::fs::write(queue.join("id=000000,orig=x"), b"old").unwrap();
        std::fs::write(queue.join("notes.txt"), b"mine").unwrap();

        let mut engine = engine_with(dir.path(), &[("a", b"AAAA")], |_| {}, FnExecutor(always_ok));
        assert!(matches!(engine.prepare(), Err(FuzzError::OutputCleanup(_))));
        assert!(!queue.join("id=000000,orig=x").exists());
        assert!(queue.join("notes.txt").exists());
    }

    #[test]
    fn resume_requires_output_dir() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"AAAA")],
            |s| s.resume = true,
            FnExecutor(always_ok),
        );
        assert!(matches!(
            engine.prepare(),
            Err(FuzzError::ResumeWithoutOutput(_))
        ));
    }

    #[test]
    fn in_place_resume_keeps_names_and_position() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"AAAAAA"), ("b", b"BBBBBB"), ("c", b"CCCCCC")],
            |s| s.skip_deterministic = true,
            FnExecutor(always_ok),
        );
        engine.prepare().unwrap();
        engine.current_entry = 2;
        engine.write_stats().unwrap();
        let names: Vec<String> = engine.queue().iter().map(|e| e.file_name()).collect();
        let det_marker = sidecar_path(&engine.queue().entries()[1].path, Sidecar::DeterministicDone);
        engine
            .queue
            .mark_sidecar(&StdFileSystem, 1, Sidecar::DeterministicDone, true)
            .unwrap();
        assert!(det_marker.exists());
        drop(engine);

        let mut resumed = engine_with(
            dir.path(),
            &[],
            |s| {
                s.resume = true;
                s.timeout_ms = None;
            },
            FnExecutor(always_ok),
        );
        resumed.prepare().unwrap();

        let resumed_names: Vec<String> = resumed.queue().iter().map(|e| e.file_name()).collect();
        assert_eq!(resumed_names, names);
        assert!(resumed.resuming_fuzz);
        assert!(resumed.queue().entries()[1].passed_det);
        assert!(!resumed.queue().entries()[0].passed_det);
        assert_eq!(resumed.seek_to, 2);
        assert!(!resumed.layout().resume_dir().exists());
    }

    #[test]
    fn fuzz_loop_honors_max_execs() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"hello world")],
            |s| s.max_execs = Some(500),
            FnExecutor(always_ok),
        );
        engine.run().unwrap();
        assert!(engine.counters().execs_done >= 500);
        assert!(engine.counters().execs_done <= 501);
        let stats = FuzzerStats::load(&StdFileSystem, &engine.layout().stats_file())
            .unwrap()
            .unwrap();
        assert_eq!(stats.execs_done, engine.counters().execs_done);
        assert!(engine.layout().bitmap_file().exists());
    }

    #[test]
    fn fuzz_loop_honors_max_cycles() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("a", b"AB")],
            |s| {
                s.max_cycles = Some(2);
                s.skip_deterministic = true;
            },
            FnExecutor(|_: &[u8], trace: &mut [u8]| {
                trace[0] = 1;
                ExecStatus::Ok
            }),
        );
        engine.run().unwrap();
        assert_eq!(engine.queue_cycle(), 2);
        assert!(engine.use_splicing);
    }
}
