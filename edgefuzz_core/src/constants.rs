//! Tuning constants for the engine.
//!
//! The values mirror the classic AFL defaults; changing any of them changes which
//! executions are considered interesting and how long each stage runs.

/// Log2 of the coverage bitmap size.
pub const MAP_SIZE_POW2: usize = 16;
/// Number of edges (bytes) in the coverage bitmap.
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

/// Default execution timeout in milliseconds, also the cap for auto-scaled timeouts.
pub const EXEC_TIMEOUT: u64 = 1000;
/// Granularity used when rounding an auto-scaled timeout.
pub const EXEC_TM_ROUND: u64 = 20;

/// Calibration runs per input.
pub const CAL_CYCLES: usize = 8;
/// Calibration runs once variable behavior has been seen.
pub const CAL_CYCLES_LONG: usize = 40;
/// Calibration runs in fast-cal mode.
pub const CAL_CYCLES_FAST: usize = 3;
/// Calibration attempts before an entry is given up on.
pub const CAL_CHANCES: u8 = 3;
/// Timeout percentage granted to calibration of resumed or freshly found inputs.
pub const CAL_TMOUT_PERC: u64 = 125;
/// Additive timeout slack granted to calibration, in milliseconds.
pub const CAL_TMOUT_ADD: u64 = 50;

/// Consecutive timeouts tolerated before the current entry is abandoned.
pub const TMOUT_LIMIT: u32 = 250;
/// Cap on retained unique hangs.
pub const KEEP_UNIQUE_HANG: u64 = 500;
/// Cap on retained unique crashes.
pub const KEEP_UNIQUE_CRASH: u64 = 5000;

/// Largest input the engine will create or accept.
pub const MAX_FILE: usize = 1024 * 1024;

pub const TRIM_START_STEPS: usize = 16;
pub const TRIM_END_STEPS: usize = 1024;
pub const TRIM_MIN_BYTES: usize = 4;

/// Log2 of the number of input bytes covered by one effector map unit.
pub const EFF_MAP_SCALE2: usize = 3;
/// Inputs shorter than this get a fully significant effector map.
pub const EFF_MIN_LEN: usize = 128;
/// Density (percent) above which the effector map is treated as fully set.
pub const EFF_MAX_PERC: usize = 90;

pub const HAVOC_CYCLES: usize = 256;
pub const HAVOC_CYCLES_INIT: usize = 1024;
pub const HAVOC_MAX_MULT: usize = 16;
pub const HAVOC_MIN: usize = 16;
pub const HAVOC_STACK_POW2: u32 = 7;

pub const HAVOC_BLK_SMALL: usize = 32;
pub const HAVOC_BLK_MEDIUM: usize = 128;
pub const HAVOC_BLK_LARGE: usize = 1500;
pub const HAVOC_BLK_XL: usize = 32768;

pub const SPLICE_CYCLES: u32 = 15;
pub const SPLICE_HAVOC: usize = 32;

/// Largest delta tried by the arithmetic stages.
pub const ARITH_MAX: u32 = 35;

pub const SKIP_TO_NEW_PROB: u32 = 99;
pub const SKIP_NFAV_OLD_PROB: u32 = 95;
pub const SKIP_NFAV_NEW_PROB: u32 = 75;

pub const MIN_AUTO_EXTRA: usize = 3;
pub const MAX_AUTO_EXTRA: usize = 32;
pub const MAX_DET_EXTRAS: usize = 200;
pub const USE_AUTO_EXTRAS: usize = 50;
pub const MAX_AUTO_EXTRAS: usize = USE_AUTO_EXTRAS * 10;
pub const MAX_DICT_FILE: usize = 128;

/// Minutes of prior work above which an existing output directory is not wiped.
pub const OUTPUT_GRACE: u64 = 25;

pub const FUZZER_STATS_FILENAME: &str = "fuzzer_stats";
pub const FUZZ_BITMAP_FILENAME: &str = "fuzz_bitmap";
pub const CUR_INPUT_FILENAME: &str = ".cur_input";

/// Environment variable through which `CommandExecutor` hands the trace file path to the target.
pub const TRACE_FILE_ENV_VAR: &str = "EDGEFUZZ_TRACE_FILE";

pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];

pub const INTERESTING_16: [i16; 10] = [-32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767];

pub const INTERESTING_32: [i32; 8] = [
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];
