//! Random stacked mutations and splicing.

use super::stage::{EntryState, StageResult, fuzz_or_abandon};
use super::Engine;
use crate::buffer::{Endian, MutationBuffer};
use crate::constants::{
    ARITH_MAX, HAVOC_BLK_LARGE, HAVOC_BLK_MEDIUM, HAVOC_BLK_SMALL, HAVOC_BLK_XL, HAVOC_CYCLES,
    HAVOC_CYCLES_INIT, HAVOC_MAX_MULT, HAVOC_MIN, HAVOC_STACK_POW2, INTERESTING_8, INTERESTING_16,
    INTERESTING_32, MAX_FILE, SPLICE_CYCLES, SPLICE_HAVOC,
};
use crate::error::{FuzzError, io_error};
use crate::extras::ExtrasStore;
use crate::stats::Stage;
use log::debug;
use rand::Rng;

impl Engine {
    /// Runs one havoc round over `st.in_buf`, or a splice round when
    /// `st.splice_cycle` is non-zero.
    ///
    /// Every iteration stacks a random number of mutations on a fresh copy of
    /// the input. A round that grows the queue doubles its own budget, up to
    /// the energy cap.
    pub(super) fn havoc_stage(&mut self, st: &mut EntryState) -> Result<StageResult, FuzzError> {
        let (stage, base) = if st.splice_cycle == 0 {
            let base = if st.doing_det {
                HAVOC_CYCLES_INIT
            } else {
                HAVOC_CYCLES
            };
            (Stage::Havoc, base)
        } else {
            st.perf_score = st.orig_perf;
            (Stage::Splice, SPLICE_HAVOC)
        };

        let mut max =
            (base * st.perf_score as usize / self.havoc_div.max(1) as usize / 100).max(HAVOC_MIN);
        st.ctx.enter(stage, max);
        if st.splice_cycle > 0 {
            st.ctx.name = format!("splice {}", st.splice_cycle);
        }

        let orig_hits = self.find_count();
        let mut havoc_queued = self.queue.len();
        let over_10m = self.run_over_10m();

        let mut cur = 0;
        while cur < max {
            let stacking = 1usize << (1 + self.rng.random_range(0..HAVOC_STACK_POW2));
            st.ctx.cur = cur;
            st.ctx.cur_val = stacking as i32;

            for _ in 0..stacking {
                havoc_mutate(
                    &mut st.out_buf,
                    &mut self.rng,
                    &self.extras,
                    self.queue_cycle,
                    over_10m,
                );
            }
            fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
            st.out_buf.restore_from(&st.in_buf);

            if self.queue.len() != havoc_queued {
                if st.perf_score as usize <= HAVOC_MAX_MULT * 100 {
                    max *= 2;
                    st.perf_score *= 2;
                    st.ctx.max = max;
                }
                havoc_queued = self.queue.len();
            }
            cur += 1;
        }

        self.finish_stage(stage, orig_hits, max);
        Ok(StageResult::Continue)
    }

    /// Sets up the next splice round.
    ///
    /// Crosses the entry with another queue entry at a random point between the
    /// first and last byte where they differ, and leaves the result in both
    /// `st.in_buf` and `st.out_buf`.
    ///
    /// # Returns
    /// `false` once splicing is off, the splice rounds are used up, or there is
    /// nothing to splice with.
    pub(super) fn prepare_splice(&mut self, st: &mut EntryState) -> Result<bool, FuzzError> {
        let queued = self.queue.len();
        loop {
            if !self.use_splicing
                || st.splice_cycle >= SPLICE_CYCLES
                || queued < 2
                || self.queue.entries()[st.id].len < 2
            {
                return Ok(false);
            }
            st.splice_cycle += 1;
            st.in_buf.clone_from(&st.orig_in);

            let mut tid = self.rng.random_range(0..queued - 1);
            if tid >= st.id {
                tid += 1;
            }
            while tid < queued && (self.queue.entries()[tid].len < 2 || tid == st.id) {
                tid += 1;
            }
            if tid >= queued {
                continue;
            }

            let path = self.queue.entries()[tid].path.clone();
            let target = self.fs.read_file(&path).map_err(|e| io_error(&path, e))?;
            let (first, last) = match locate_diffs(&st.in_buf, &target) {
                Some((f, l)) if l >= 2 && f != l => (f, l),
                _ => continue,
            };

            let split = first + self.rng.random_range(0..last - first);
            let mut spliced = st.in_buf[..split].to_vec();
            spliced.extend_from_slice(&target[split..]);
            debug!(
                "Splicing #{} with #{tid} at {split} (round {})",
                st.id, st.splice_cycle
            );

            st.ctx.splicing_with = Some(tid);
            st.in_buf = spliced;
            st.out_buf.restore_from(&st.in_buf);
            return Ok(true);
        }
    }
}

/// First and last offsets at which `a` and `b` differ, over their common length.
pub(crate) fn locate_diffs(a: &[u8], b: &[u8]) -> Option<(usize, usize)> {
    let mut diffs = a
        .iter()
        .zip(b)
        .enumerate()
        .filter(|(_, (x, y))| x != y)
        .map(|(pos, _)| pos);
    let first = diffs.next()?;
    Some((first, diffs.last().unwrap_or(first)))
}

/// Picks a block length no larger than `limit` for the cloning and deleting
/// operators. Larger bands open up in later queue cycles once the session has
/// run for a while.
pub(crate) fn choose_block_len<R: Rng + ?Sized>(
    rng: &mut R,
    limit: usize,
    queue_cycle: u64,
    over_10m: bool,
) -> usize {
    let rlim = if over_10m { queue_cycle.clamp(1, 3) } else { 1 };
    let (mut min, max) = match rng.random_range(0..rlim) {
        0 => (1, HAVOC_BLK_SMALL),
        1 => (HAVOC_BLK_SMALL, HAVOC_BLK_MEDIUM),
        _ => {
            if rng.random_range(0..10) != 0 {
                (HAVOC_BLK_MEDIUM, HAVOC_BLK_LARGE)
            } else {
                (HAVOC_BLK_LARGE, HAVOC_BLK_XL)
            }
        }
    };
    if min >= limit {
        min = 1;
    }
    min + rng.random_range(0..max.min(limit) - min + 1)
}

fn random_endian<R: Rng + ?Sized>(rng: &mut R) -> Endian {
    if rng.random_bool(0.5) {
        Endian::Little
    } else {
        Endian::Big
    }
}

/// A random byte value, or a copy of a random byte already in the buffer.
fn fill_byte<R: Rng + ?Sized>(rng: &mut R, buf: &MutationBuffer) -> u8 {
    if rng.random_bool(0.5) {
        rng.random()
    } else {
        buf.as_slice()[rng.random_range(0..buf.len())]
    }
}

/// Applies one randomly chosen mutation to `buf`.
///
/// Operators that need more bytes than the buffer holds, or that would grow it
/// to `MAX_FILE`, leave it untouched. The buffer is never shrunk below one byte.
pub(crate) fn havoc_mutate<R: Rng + ?Sized>(
    buf: &mut MutationBuffer,
    rng: &mut R,
    extras: &ExtrasStore,
    queue_cycle: u64,
    over_10m: bool,
) {
    let len = buf.len();
    if len == 0 {
        return;
    }
    let ops = if extras.has_any() { 17 } else { 15 };

    match rng.random_range(0..ops) {
        0 => buf.flip_bit(rng.random_range(0..len << 3)),
        1 => {
            let v = INTERESTING_8[rng.random_range(0..INTERESTING_8.len())];
            buf.seek(rng.random_range(0..len)).write_u8(v as u8);
        }
        2 if len >= 2 => {
            let v = INTERESTING_16[rng.random_range(0..INTERESTING_16.len())];
            let endian = random_endian(rng);
            buf.seek(rng.random_range(0..len - 1))
                .write_u16(v as u16, endian);
        }
        3 if len >= 4 => {
            let v = INTERESTING_32[rng.random_range(0..INTERESTING_32.len())];
            let endian = random_endian(rng);
            buf.seek(rng.random_range(0..len - 3))
                .write_u32(v as u32, endian);
        }
        4 => {
            let delta = 1 + rng.random_range(0..ARITH_MAX) as u8;
            buf.seek(rng.random_range(0..len)).sub_u8(delta);
        }
        5 => {
            let delta = 1 + rng.random_range(0..ARITH_MAX) as u8;
            buf.seek(rng.random_range(0..len)).add_u8(delta);
        }
        6 if len >= 2 => {
            let delta = 1 + rng.random_range(0..ARITH_MAX) as u16;
            let endian = random_endian(rng);
            buf.seek(rng.random_range(0..len - 1)).sub_u16(delta, endian);
        }
        7 if len >= 2 => {
            let delta = 1 + rng.random_range(0..ARITH_MAX) as u16;
            let endian = random_endian(rng);
            buf.seek(rng.random_range(0..len - 1)).add_u16(delta, endian);
        }
        8 if len >= 4 => {
            let delta = 1 + rng.random_range(0..ARITH_MAX);
            let endian = random_endian(rng);
            buf.seek(rng.random_range(0..len - 3)).sub_u32(delta, endian);
        }
        9 if len >= 4 => {
            let delta = 1 + rng.random_range(0..ARITH_MAX);
            let endian = random_endian(rng);
            buf.seek(rng.random_range(0..len - 3)).add_u32(delta, endian);
        }
        10 => {
            let mask = 1 + rng.random_range(0..255u32) as u8;
            buf.seek(rng.random_range(0..len)).xor_u8(mask);
        }
        // Deletion is twice as likely as the other operators to keep files small.
        11 | 12 if len >= 2 => {
            let del_len = choose_block_len(rng, len - 1, queue_cycle, over_10m);
            let del_from = rng.random_range(0..len - del_len + 1);
            buf.remove(del_from, del_len);
        }
        13 if len + HAVOC_BLK_XL < MAX_FILE => {
            let block = if rng.random_range(0..4) != 0 {
                let clone_len = choose_block_len(rng, len, queue_cycle, over_10m);
                let clone_from = rng.random_range(0..len - clone_len + 1);
                buf.as_slice()[clone_from..clone_from + clone_len].to_vec()
            } else {
                let clone_len = choose_block_len(rng, HAVOC_BLK_XL, queue_cycle, over_10m);
                vec![fill_byte(rng, buf); clone_len]
            };
            let clone_to = rng.random_range(0..len);
            buf.insert(clone_to, &block);
        }
        14 if len >= 2 => {
            let copy_len = choose_block_len(rng, len - 1, queue_cycle, over_10m);
            let copy_from = rng.random_range(0..len - copy_len + 1);
            let copy_to = rng.random_range(0..len - copy_len + 1);
            if rng.random_range(0..4) != 0 {
                if copy_from != copy_to {
                    buf.copy_within(copy_from, copy_to, copy_len);
                }
            } else {
                let value = fill_byte(rng, buf);
                buf.fill(copy_to, copy_len, value);
            }
        }
        15 => {
            let token = pick_token(rng, extras);
            if token.len() <= len {
                let at = rng.random_range(0..len - token.len() + 1);
                buf.seek(at).write_bytes(token);
            }
        }
        16 => {
            let token = pick_token(rng, extras);
            if len + token.len() < MAX_FILE {
                let at = rng.random_range(0..len + 1);
                buf.insert(at, token);
            }
        }
        _ => {}
    }
}

/// A random dictionary token; auto tokens win half the time when both kinds exist.
fn pick_token<'a, R: Rng + ?Sized>(rng: &mut R, extras: &'a ExtrasStore) -> &'a [u8] {
    let (user, auto) = (extras.user(), extras.auto());
    let use_auto = user.is_empty() || (!auto.is_empty() && rng.random_bool(0.5));
    let list = if use_auto { auto } else { user };
    &list[rng.random_range(0..list.len())].data
}
