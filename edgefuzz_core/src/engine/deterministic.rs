//! Deterministic stages: walking bit flips, arithmetic, interesting values and
//! dictionary tokens.
//!
//! Every stage mutates `out_buf` in place and restores it before returning, so
//! the next stage starts from the entry's own bytes. Mutations a cheaper stage
//! already produced are skipped with the `could_be_*` helpers.

use super::stage::{EntryState, StageResult, ValueType, fuzz_or_abandon};
use super::Engine;
use crate::buffer::Endian;
use crate::constants::{
    ARITH_MAX, EFF_MIN_LEN, INTERESTING_8, INTERESTING_16, INTERESTING_32, MAX_AUTO_EXTRA,
    MAX_DET_EXTRAS, MAX_FILE, MIN_AUTO_EXTRA, USE_AUTO_EXTRAS,
};
use crate::effector::EffectorMap;
use crate::error::FuzzError;
use crate::stats::Stage;
use rand::Rng;

type StageFn = fn(&mut Engine, &mut EntryState) -> Result<StageResult, FuzzError>;

impl Engine {
    /// Runs the deterministic stages in order.
    ///
    /// # Returns
    /// `SkipToHavoc` when the entry is not scheduled for deterministic fuzzing,
    /// `AbandonEntry` if any stage gave up on the entry, `Continue` once all
    /// stages completed.
    pub(super) fn run_deterministic(
        &mut self,
        st: &mut EntryState,
    ) -> Result<StageResult, FuzzError> {
        if !self.wants_deterministic(st.id) {
            return Ok(StageResult::SkipToHavoc);
        }
        st.doing_det = true;

        let stages: [StageFn; 6] = [
            Engine::bitflip_stages,
            Engine::byteflip_stages,
            Engine::arith_stages,
            Engine::interest_stages,
            Engine::user_extras_stages,
            Engine::auto_extras_stage,
        ];
        for stage in stages {
            if stage(self, st)? == StageResult::AbandonEntry {
                return Ok(StageResult::AbandonEntry);
            }
        }
        Ok(StageResult::Continue)
    }

    /// Walking 1, 2 and 4 bit flips. The single-bit pass also harvests auto
    /// dictionary tokens.
    fn bitflip_stages(&mut self, st: &mut EntryState) -> Result<StageResult, FuzzError> {
        let bits = st.out_buf.len() << 3;
        let exec_cksum = self.queue.entries()[st.id].exec_cksum;
        let collect_tokens = !self.settings.dumb_mode;

        st.ctx.enter(Stage::Flip1, bits);
        let orig_hits = self.find_count();
        let mut prev_cksum = exec_cksum;
        let mut token: Vec<u8> = Vec::new();

        for cur in 0..bits {
            st.ctx.cur = cur;
            st.ctx.cur_byte = Some(cur >> 3);
            st.out_buf.flip_bit(cur);
            fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
            st.out_buf.flip_bit(cur);

            // A run of bytes whose last-bit flips all lead to the same new path
            // is likely a magic value checked as a whole.
            if collect_tokens && cur & 7 == 7 {
                let cksum = self.trace.hash32();
                let byte = st.out_buf.as_slice()[cur >> 3];
                if cur == bits - 1 && cksum == prev_cksum {
                    token.push(byte);
                    self.offer_auto_token(&token);
                } else if cksum != prev_cksum {
                    self.offer_auto_token(&token);
                    token.clear();
                    prev_cksum = cksum;
                }
                if cksum != exec_cksum {
                    token.push(byte);
                }
            }
        }
        self.finish_stage(Stage::Flip1, orig_hits, bits);

        for (stage, width) in [(Stage::Flip2, 2), (Stage::Flip4, 4)] {
            let max = (bits + 1).saturating_sub(width);
            st.ctx.enter(stage, max);
            let orig_hits = self.find_count();
            for cur in 0..max {
                st.ctx.cur = cur;
                st.ctx.cur_byte = Some(cur >> 3);
                for bit in cur..cur + width {
                    st.out_buf.flip_bit(bit);
                }
                fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
                for bit in cur..cur + width {
                    st.out_buf.flip_bit(bit);
                }
            }
            self.finish_stage(stage, orig_hits, max);
        }
        Ok(StageResult::Continue)
    }

    /// Walking 8, 16 and 32 bit XOR sweeps. The 8-bit pass builds the
    /// effector map the later stages consult.
    fn byteflip_stages(&mut self, st: &mut EntryState) -> Result<StageResult, FuzzError> {
        let len = st.out_buf.len();
        let exec_cksum = self.queue.entries()[st.id].exec_cksum;
        let mark_everything = self.settings.dumb_mode || len < EFF_MIN_LEN;

        st.eff_map = EffectorMap::new(len);
        st.ctx.enter(Stage::Flip8, len);
        let orig_hits = self.find_count();
        for i in 0..len {
            st.ctx.cur = i;
            st.ctx.cur_byte = Some(i);
            st.out_buf.seek(i).xor_u8(0xFF);
            fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);

            if st.eff_map.has_no_effect(i) && (mark_everything || self.trace.hash32() != exec_cksum)
            {
                st.eff_map.mark(i);
            }
            st.out_buf.seek(i).xor_u8(0xFF);
        }
        if st.eff_map.is_dense() {
            st.eff_map.mark_all();
        }
        self.counters.blocks_eff_select += st.eff_map.marked_count() as u64;
        self.counters.blocks_eff_total += st.eff_map.unit_count() as u64;
        self.finish_stage(Stage::Flip8, orig_hits, len);

        if len < 2 {
            return Ok(StageResult::Continue);
        }
        st.ctx.enter(Stage::Flip16, len - 1);
        let orig_hits = self.find_count();
        let mut execs = 0;
        for i in 0..len - 1 {
            if st.eff_map.has_no_effect_range(i, 2) {
                continue;
            }
            st.ctx.cur = execs;
            st.ctx.cur_byte = Some(i);
            st.out_buf.seek(i).xor_u16(0xFFFF);
            fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
            st.out_buf.seek(i).xor_u16(0xFFFF);
            execs += 1;
        }
        self.finish_stage(Stage::Flip16, orig_hits, execs);

        if len < 4 {
            return Ok(StageResult::Continue);
        }
        st.ctx.enter(Stage::Flip32, len - 3);
        let orig_hits = self.find_count();
        let mut execs = 0;
        for i in 0..len - 3 {
            if st.eff_map.has_no_effect_range(i, 4) {
                continue;
            }
            st.ctx.cur = execs;
            st.ctx.cur_byte = Some(i);
            st.out_buf.seek(i).xor_u32(0xFFFF_FFFF);
            fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
            st.out_buf.seek(i).xor_u32(0xFFFF_FFFF);
            execs += 1;
        }
        self.finish_stage(Stage::Flip32, orig_hits, execs);
        Ok(StageResult::Continue)
    }

    /// Adds and subtracts 1..=ARITH_MAX on 8, 16 and 32 bit windows, in both
    /// byte orders for the wider ones. Only results a bit flip cannot reach
    /// are run; 16 and 32 bit windows also require a carry into the next byte.
    fn arith_stages(&mut self, st: &mut EntryState) -> Result<StageResult, FuzzError> {
        if self.settings.no_arith {
            return Ok(StageResult::Continue);
        }
        let len = st.out_buf.len();

        st.ctx.enter(Stage::Arith8, 2 * len * ARITH_MAX as usize);
        st.ctx.val_type = ValueType::Le;
        let orig_hits = self.find_count();
        let mut execs = 0;
        for i in 0..len {
            if st.eff_map.has_no_effect(i) {
                continue;
            }
            let orig = st.out_buf.seek(i).read_u8();
            st.ctx.cur_byte = Some(i);
            for j in 1..=ARITH_MAX {
                let delta = j as u8;
                for (value, signed) in [
                    (orig.wrapping_add(delta), j as i32),
                    (orig.wrapping_sub(delta), -(j as i32)),
                ] {
                    if could_be_bitflip((orig ^ value) as u32) {
                        continue;
                    }
                    st.ctx.cur = execs;
                    st.ctx.cur_val = signed;
                    st.out_buf.seek(i).write_u8(value);
                    fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
                    execs += 1;
                }
                st.out_buf.seek(i).write_u8(orig);
            }
        }
        self.finish_stage(Stage::Arith8, orig_hits, execs);

        if len < 2 {
            return Ok(StageResult::Continue);
        }
        st.ctx.enter(Stage::Arith16, 4 * (len - 1) * ARITH_MAX as usize);
        let orig_hits = self.find_count();
        let mut execs = 0;
        for i in 0..len - 1 {
            if st.eff_map.has_no_effect_range(i, 2) {
                continue;
            }
            let orig = st.out_buf.seek(i).read_u16(Endian::Little);
            let orig_be = orig.swap_bytes();
            st.ctx.cur_byte = Some(i);
            for j in 1..=ARITH_MAX {
                let delta = j as u16;
                // (value as read back in little-endian, carries, byte order, signed delta)
                let candidates = [
                    (orig.wrapping_add(delta), (orig & 0xff) + delta > 0xff, ValueType::Le, j as i32),
                    (orig.wrapping_sub(delta), (orig & 0xff) < delta, ValueType::Le, -(j as i32)),
                    (
                        orig_be.wrapping_add(delta).swap_bytes(),
                        (orig_be & 0xff) + delta > 0xff,
                        ValueType::Be,
                        j as i32,
                    ),
                    (
                        orig_be.wrapping_sub(delta).swap_bytes(),
                        (orig_be & 0xff) < delta,
                        ValueType::Be,
                        -(j as i32),
                    ),
                ];
                for (value, carries, val_type, signed) in candidates {
                    if !carries || could_be_bitflip((orig ^ value) as u32) {
                        continue;
                    }
                    st.ctx.cur = execs;
                    st.ctx.val_type = val_type;
                    st.ctx.cur_val = signed;
                    st.out_buf.seek(i).write_u16(value, Endian::Little);
                    fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
                    execs += 1;
                }
                st.out_buf.seek(i).write_u16(orig, Endian::Little);
            }
        }
        self.finish_stage(Stage::Arith16, orig_hits, execs);

        if len < 4 {
            return Ok(StageResult::Continue);
        }
        st.ctx.enter(Stage::Arith32, 4 * (len - 3) * ARITH_MAX as usize);
        let orig_hits = self.find_count();
        let mut execs = 0;
        for i in 0..len - 3 {
            if st.eff_map.has_no_effect_range(i, 4) {
                continue;
            }
            let orig = st.out_buf.seek(i).read_u32(Endian::Little);
            let orig_be = orig.swap_bytes();
            st.ctx.cur_byte = Some(i);
            for j in 1..=ARITH_MAX {
                let candidates = [
                    (orig.wrapping_add(j), (orig & 0xffff) + j > 0xffff, ValueType::Le, j as i32),
                    (orig.wrapping_sub(j), (orig & 0xffff) < j, ValueType::Le, -(j as i32)),
                    (
                        orig_be.wrapping_add(j).swap_bytes(),
                        (orig_be & 0xffff) + j > 0xffff,
                        ValueType::Be,
                        j as i32,
                    ),
                    (
                        orig_be.wrapping_sub(j).swap_bytes(),
                        (orig_be & 0xffff) < j,
                        ValueType::Be,
                        -(j as i32),
                    ),
                ];
                for (value, carries, val_type, signed) in candidates {
                    if !carries || could_be_bitflip(orig ^ value) {
                        continue;
                    }
                    st.ctx.cur = execs;
                    st.ctx.val_type = val_type;
                    st.ctx.cur_val = signed;
                    st.out_buf.seek(i).write_u32(value, Endian::Little);
                    fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
                    execs += 1;
                }
                st.out_buf.seek(i).write_u32(orig, Endian::Little);
            }
        }
        self.finish_stage(Stage::Arith32, orig_hits, execs);
        Ok(StageResult::Continue)
    }

    /// Overwrites 8, 16 and 32 bit windows with the interesting-value tables.
    fn interest_stages(&mut self, st: &mut EntryState) -> Result<StageResult, FuzzError> {
        let len = st.out_buf.len();

        st.ctx.enter(Stage::Interest8, len * INTERESTING_8.len());
        st.ctx.val_type = ValueType::Le;
        let orig_hits = self.find_count();
        let mut execs = 0;
        for i in 0..len {
            if st.eff_map.has_no_effect(i) {
                continue;
            }
            let orig = st.out_buf.seek(i).read_u8();
            st.ctx.cur_byte = Some(i);
            for &v in INTERESTING_8.iter() {
                let value = v as u8;
                if could_be_bitflip((orig ^ value) as u32)
                    || could_be_arith(orig as u32, value as u32, 1)
                {
                    continue;
                }
                st.ctx.cur = execs;
                st.ctx.cur_val = v as i32;
                st.out_buf.seek(i).write_u8(value);
                fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
                st.out_buf.seek(i).write_u8(orig);
                execs += 1;
            }
        }
        self.finish_stage(Stage::Interest8, orig_hits, execs);

        if self.settings.no_arith || len < 2 {
            return Ok(StageResult::Continue);
        }
        st.ctx.enter(Stage::Interest16, 2 * (len - 1) * INTERESTING_16.len());
        let orig_hits = self.find_count();
        let mut execs = 0;
        for i in 0..len - 1 {
            if st.eff_map.has_no_effect_range(i, 2) {
                continue;
            }
            let orig = st.out_buf.seek(i).read_u16(Endian::Little);
            st.ctx.cur_byte = Some(i);
            for &v in INTERESTING_16.iter() {
                let value = v as u16;
                st.ctx.cur_val = v as i32;
                let redundant = |new: u16, check_le: bool| {
                    could_be_bitflip((orig ^ new) as u32)
                        || could_be_arith(orig as u32, new as u32, 2)
                        || could_be_interest(orig as u32, new as u32, 2, check_le)
                };

                if !redundant(value, false) {
                    st.ctx.cur = execs;
                    st.ctx.val_type = ValueType::Le;
                    st.out_buf.seek(i).write_u16(value, Endian::Little);
                    fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
                    execs += 1;
                }
                if value != value.swap_bytes() && !redundant(value.swap_bytes(), true) {
                    st.ctx.cur = execs;
                    st.ctx.val_type = ValueType::Be;
                    st.out_buf.seek(i).write_u16(value, Endian::Big);
                    fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
                    execs += 1;
                }
            }
            st.out_buf.seek(i).write_u16(orig, Endian::Little);
        }
        self.finish_stage(Stage::Interest16, orig_hits, execs);

        if len < 4 {
            return Ok(StageResult::Continue);
        }
        st.ctx.enter(Stage::Interest32, 2 * (len - 3) * INTERESTING_32.len());
        let orig_hits = self.find_count();
        let mut execs = 0;
        for i in 0..len - 3 {
            if st.eff_map.has_no_effect_range(i, 4) {
                continue;
            }
            let orig = st.out_buf.seek(i).read_u32(Endian::Little);
            st.ctx.cur_byte = Some(i);
            for &v in INTERESTING_32.iter() {
                let value = v as u32;
                st.ctx.cur_val = v;
                let redundant = |new: u32, check_le: bool| {
                    could_be_bitflip(orig ^ new)
                        || could_be_arith(orig, new, 4)
                        || could_be_interest(orig, new, 4, check_le)
                };

                if !redundant(value, false) {
                    st.ctx.cur = execs;
                    st.ctx.val_type = ValueType::Le;
                    st.out_buf.seek(i).write_u32(value, Endian::Little);
                    fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
                    execs += 1;
                }
                if value != value.swap_bytes() && !redundant(value.swap_bytes(), true) {
                    st.ctx.cur = execs;
                    st.ctx.val_type = ValueType::Be;
                    st.out_buf.seek(i).write_u32(value, Endian::Big);
                    fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
                    execs += 1;
                }
            }
            st.out_buf.seek(i).write_u32(orig, Endian::Little);
        }
        self.finish_stage(Stage::Interest32, orig_hits, execs);
        Ok(StageResult::Continue)
    }

    /// Overwrites with, then inserts, every user token at every position.
    fn user_extras_stages(&mut self, st: &mut EntryState) -> Result<StageResult, FuzzError> {
        let tokens: Vec<Vec<u8>> = self.extras.user().iter().map(|e| e.data.clone()).collect();
        if tokens.is_empty() {
            return Ok(StageResult::Continue);
        }
        let len = st.out_buf.len();

        // Tokens are sorted by length, so each write covers the previous one
        // and only the longest span needs restoring.
        st.ctx.enter(Stage::ExtrasUserOver, tokens.len() * len);
        let orig_hits = self.find_count();
        let mut execs = 0;
        for i in 0..len {
            st.ctx.cur_byte = Some(i);
            let mut last_len = 0;
            for token in &tokens {
                let thinned = tokens.len() > MAX_DET_EXTRAS
                    && self.rng.random_range(0..tokens.len()) >= MAX_DET_EXTRAS;
                if thinned || !self.worth_overwriting(st, i, token) {
                    continue;
                }
                last_len = token.len();
                st.ctx.cur = execs;
                st.out_buf.seek(i).write_bytes(token);
                fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
                execs += 1;
            }
            st.out_buf.copy_from(&st.in_buf, i, i, last_len);
        }
        self.finish_stage(Stage::ExtrasUserOver, orig_hits, execs);

        st.ctx.enter(Stage::ExtrasUserInsert, tokens.len() * (len + 1));
        let orig_hits = self.find_count();
        let mut execs = 0;
        let mut spliced = Vec::with_capacity(len + tokens.iter().map(Vec::len).max().unwrap_or(0));
        for i in 0..=len {
            st.ctx.cur_byte = Some(i);
            for token in &tokens {
                if len + token.len() > MAX_FILE {
                    continue;
                }
                let base = st.out_buf.as_slice();
                spliced.clear();
                spliced.extend_from_slice(&base[..i]);
                spliced.extend_from_slice(token);
                spliced.extend_from_slice(&base[i..]);
                st.ctx.cur = execs;
                fuzz_or_abandon!(self, &spliced, &st.ctx);
                execs += 1;
            }
        }
        self.finish_stage(Stage::ExtrasUserInsert, orig_hits, execs);
        Ok(StageResult::Continue)
    }

    /// Overwrites with the best `USE_AUTO_EXTRAS` auto tokens at every position.
    fn auto_extras_stage(&mut self, st: &mut EntryState) -> Result<StageResult, FuzzError> {
        let tokens: Vec<Vec<u8>> = self
            .extras
            .auto()
            .iter()
            .take(USE_AUTO_EXTRAS)
            .map(|e| e.data.clone())
            .collect();
        if tokens.is_empty() {
            return Ok(StageResult::Continue);
        }
        let len = st.out_buf.len();

        st.ctx.enter(Stage::ExtrasAutoOver, tokens.len() * len);
        let orig_hits = self.find_count();
        let mut execs = 0;
        for i in 0..len {
            st.ctx.cur_byte = Some(i);
            let mut last_len = 0;
            for token in &tokens {
                if !self.worth_overwriting(st, i, token) {
                    continue;
                }
                last_len = token.len();
                st.ctx.cur = execs;
                st.out_buf.seek(i).write_bytes(token);
                fuzz_or_abandon!(self, st.out_buf.as_slice(), &st.ctx);
                execs += 1;
            }
            st.out_buf.copy_from(&st.in_buf, i, i, last_len);
        }
        self.finish_stage(Stage::ExtrasAutoOver, orig_hits, execs);
        Ok(StageResult::Continue)
    }

    /// The token fits at `pos`, is not already there, and covers at least one
    /// significant effector unit.
    fn worth_overwriting(&self, st: &EntryState, pos: usize, token: &[u8]) -> bool {
        let len = st.out_buf.len();
        token.len() <= len - pos
            && &st.out_buf.as_slice()[pos..pos + token.len()] != token
            && !st.eff_map.has_no_effect_range(pos, token.len())
    }

    fn offer_auto_token(&mut self, token: &[u8]) {
        if (MIN_AUTO_EXTRA..=MAX_AUTO_EXTRA).contains(&token.len())
            && self.extras.maybe_add_auto(token, &mut self.rng)
        {
            self.auto_changed = true;
        }
    }
}

/// True if XOR-ing with `xor` is something the walking bit or byte flips
/// already tried: a run of 1, 2 or 4 bits anywhere, or 8, 16 or 32 bits at a
/// byte boundary.
pub(crate) fn could_be_bitflip(xor: u32) -> bool {
    if xor == 0 {
        return true;
    }
    let shift = xor.trailing_zeros();
    let run = xor >> shift;
    if matches!(run, 1 | 3 | 15) {
        return true;
    }
    if shift & 7 != 0 {
        return false;
    }
    matches!(run, 0xff | 0xffff | 0xffff_ffff)
}

/// True if `new` is reachable from `old` by the arithmetic stages on a window
/// of `blen` bytes.
pub(crate) fn could_be_arith(old: u32, new: u32, blen: usize) -> bool {
    let max = ARITH_MAX;
    if old == new {
        return true;
    }

    let mut diffs = 0;
    let (mut ov, mut nv) = (0u8, 0u8);
    for i in 0..blen {
        let a = (old >> (8 * i)) as u8;
        let b = (new >> (8 * i)) as u8;
        if a != b {
            diffs += 1;
            ov = a;
            nv = b;
        }
    }
    if diffs == 1 && (ov.wrapping_sub(nv) as u32 <= max || nv.wrapping_sub(ov) as u32 <= max) {
        return true;
    }
    if blen == 1 {
        return false;
    }

    let mut diffs = 0;
    let (mut ov, mut nv) = (0u16, 0u16);
    for i in 0..blen / 2 {
        let a = (old >> (16 * i)) as u16;
        let b = (new >> (16 * i)) as u16;
        if a != b {
            diffs += 1;
            ov = a;
            nv = b;
        }
    }
    if diffs == 1 {
        if ov.wrapping_sub(nv) as u32 <= max || nv.wrapping_sub(ov) as u32 <= max {
            return true;
        }
        let (ov, nv) = (ov.swap_bytes(), nv.swap_bytes());
        if ov.wrapping_sub(nv) as u32 <= max || nv.wrapping_sub(ov) as u32 <= max {
            return true;
        }
    }

    if blen == 4 {
        if old.wrapping_sub(new) <= max || new.wrapping_sub(old) <= max {
            return true;
        }
        let (old, new) = (old.swap_bytes(), new.swap_bytes());
        if old.wrapping_sub(new) <= max || new.wrapping_sub(old) <= max {
            return true;
        }
    }
    false
}

/// True if writing `new` over a `blen`-byte window holding `old` repeats an
/// insertion of a narrower interesting value. `check_le` asks whether the
/// little-endian pass of the same width already produced it too.
pub(crate) fn could_be_interest(old: u32, new: u32, blen: usize, check_le: bool) -> bool {
    if old == new {
        return true;
    }

    for i in 0..blen {
        let mask = !(0xffu32 << (i * 8));
        for &v in INTERESTING_8.iter() {
            if new == (old & mask) | ((v as u8 as u32) << (i * 8)) {
                return true;
            }
        }
    }

    if blen == 2 && !check_le {
        return false;
    }

    for i in 0..blen - 1 {
        let mask = !(0xffffu32 << (i * 8));
        for &v in INTERESTING_16.iter() {
            let value = v as u16;
            if new == (old & mask) | ((value as u32) << (i * 8)) {
                return true;
            }
            if blen > 2 && new == (old & mask) | ((value.swap_bytes() as u32) << (i * 8)) {
                return true;
            }
        }
    }

    if blen == 4 && check_le {
        return INTERESTING_32.iter().any(|&v| new == v as u32);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{FnExecutor, engine_with, prefix_trace};
    use super::*;
    use crate::executor::ExecStatus;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::tempdir;

    type Seen = Rc<RefCell<Vec<Vec<u8>>>>;

    /// Prefix-trace target that records every input it is given.
    fn recording() -> (Seen, FnExecutor<impl FnMut(&[u8], &mut [u8]) -> ExecStatus>) {
        let seen: Seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        let exec = FnExecutor(move |input: &[u8], trace: &mut [u8]| {
            log.borrow_mut().push(input.to_vec());
            prefix_trace(input, trace);
            ExecStatus::Ok
        });
        (seen, exec)
    }

    #[test]
    fn bitflip_detection() {
        assert!(could_be_bitflip(0));
        assert!(could_be_bitflip(0b1));
        assert!(could_be_bitflip(0b11 << 5));
        assert!(could_be_bitflip(0b1111 << 3));
        assert!(could_be_bitflip(0xff));
        assert!(could_be_bitflip(0xff00));
        assert!(could_be_bitflip(0xffff_0000));
        assert!(could_be_bitflip(0xffff_ffff));
        assert!(!could_be_bitflip(0xff << 4));
        assert!(!could_be_bitflip(0b101));
        assert!(!could_be_bitflip(0b111));
    }

    #[test]
    fn arith_detection() {
        assert!(could_be_arith(0x10, 0x20, 1));
        assert!(!could_be_arith(0x00, 0x80, 1));
        // 0x00ff + 1 carries into the high byte.
        assert!(could_be_arith(0x00ff, 0x0100, 2));
        // Big-endian +1 on bytes [00 ff].
        assert!(could_be_arith(0xff00, 0x0001, 2));
        assert!(!could_be_arith(0x1234, 0x5678, 2));
        assert!(could_be_arith(0x0000_ffff, 0x0001_0000, 4));
        assert!(!could_be_arith(0x1234_5678, 0x8765_4321, 4));
    }

    #[test]
    fn interest_detection() {
        // -1 written over the low byte.
        assert!(could_be_interest(0x1200, 0x12ff, 2, false));
        // A 16-bit value only counts once the little-endian pass is included.
        assert!(!could_be_interest(0x1234, 0x8000, 2, false));
        assert!(could_be_interest(0x1234, 0x8000, 2, true));
        assert!(!could_be_interest(0x1234_5678, 0x7fff_ffff, 4, false));
        assert!(could_be_interest(0x1234_5678, 0x7fff_ffff, 4, true));
    }

    #[test]
    fn stages_restore_the_buffer() {
        let dir = tempdir().unwrap();
        let seed = b"ABCDEFGH".to_vec();
        let (seen, exec) = recording();
        let mut engine = engine_with(dir.path(), &[("s", seed.as_slice())], |_| {}, exec);
        engine.prepare().unwrap();
        seen.borrow_mut().clear();

        let mut st = EntryState::new(0, seed.clone());
        assert_eq!(engine.run_deterministic(&mut st).unwrap(), StageResult::Continue);
        assert!(st.doing_det);
        assert_eq!(st.out_buf.as_slice(), seed.as_slice());

        let seen = seen.borrow();
        let mut first = seed.clone();
        first[0] ^= 0x80;
        assert_eq!(seen[0], first);
        assert!(seen.iter().all(|input| input.len() == seed.len()));
        assert_eq!(engine.stage_stats().cycles(Stage::Flip1), 64);
        assert_eq!(engine.stage_stats().cycles(Stage::Flip2), 63);
        assert_eq!(engine.stage_stats().cycles(Stage::Flip4), 61);
        assert_eq!(engine.stage_stats().cycles(Stage::Flip8), 8);
        assert!(engine.stage_stats().cycles(Stage::Arith8) > 0);
        assert!(engine.stage_stats().cycles(Stage::Interest32) > 0);
    }

    #[test]
    fn effector_map_limits_later_stages() {
        let dir = tempdir().unwrap();
        let seed = vec![b'A'; 160];
        let mut engine = engine_with(
            dir.path(),
            &[("s", seed.as_slice())],
            |_| {},
            FnExecutor(|input: &[u8], trace: &mut [u8]| {
                prefix_trace(input, trace);
                ExecStatus::Ok
            }),
        );
        engine.prepare().unwrap();

        let mut st = EntryState::new(0, seed.clone());
        engine.run_deterministic(&mut st).unwrap();

        // Only the unit holding the traced prefix and the always-marked last unit.
        assert_eq!(st.eff_map.marked_count(), 2);
        assert_eq!(st.eff_map.unit_count(), 20);
        assert_eq!(engine.counters().blocks_eff_select, 2);
        assert_eq!(engine.counters().blocks_eff_total, 20);

        let per_byte = (1..=ARITH_MAX as u8)
            .flat_map(|j| [b'A'.wrapping_add(j), b'A'.wrapping_sub(j)])
            .filter(|&v| !could_be_bitflip((b'A' ^ v) as u32))
            .count() as u64;
        assert_eq!(engine.stage_stats().cycles(Stage::Arith8), 16 * per_byte);
    }

    #[test]
    fn magic_values_become_auto_extras() {
        let magic_target = |input: &[u8], trace: &mut [u8]| {
            trace[0] = 1;
            if input.get(4..8) == Some(b"MAGC".as_slice()) {
                trace[1] = 1;
            } else {
                trace[2] = 1;
            }
            ExecStatus::Ok
        };

        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("s", b"xxxxMAGCyyyy")],
            |_| {},
            FnExecutor(magic_target),
        );
        engine.prepare().unwrap();
        let mut st = EntryState::new(0, b"xxxxMAGCyyyy".to_vec());
        engine.run_deterministic(&mut st).unwrap();
        assert_eq!(engine.extras().auto().len(), 1);
        assert_eq!(engine.extras().auto()[0].data, b"MAGC");
        assert!(engine.auto_changed);
        assert!(engine.stage_stats().cycles(Stage::ExtrasAutoOver) > 0);

        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("s", b"xxxxMAGCyyyy")],
            |s| s.dumb_mode = true,
            FnExecutor(magic_target),
        );
        engine.prepare().unwrap();
        let mut st = EntryState::new(0, b"xxxxMAGCyyyy".to_vec());
        engine.run_deterministic(&mut st).unwrap();
        assert!(engine.extras().auto().is_empty());
    }

    #[test]
    fn user_tokens_are_written_and_inserted() {
        let dir = tempdir().unwrap();
        let dict = dir.path().join("tokens.dict");
        std::fs::write(&dict, "kw=\"KEY\"\n").unwrap();
        let (seen, exec) = recording();
        let mut engine = engine_with(
            dir.path(),
            &[("s", b"aaaaaaaa")],
            |s| s.extras = Some(dict.clone()),
            exec,
        );
        engine.prepare().unwrap();

        let mut st = EntryState::new(0, b"aaaaaaaa".to_vec());
        engine.run_deterministic(&mut st).unwrap();
        let seen = seen.borrow();
        assert!(seen.contains(&b"KEYaaaaa".to_vec()));
        assert!(seen.contains(&b"aaaaaKEY".to_vec()));
        assert!(seen.contains(&b"KEYaaaaaaaa".to_vec()));
        assert!(seen.contains(&b"aaaaaaaaKEY".to_vec()));
        assert_eq!(engine.stage_stats().cycles(Stage::ExtrasUserOver), 6);
        assert_eq!(engine.stage_stats().cycles(Stage::ExtrasUserInsert), 9);
    }

    #[test]
    fn no_arith_skips_arithmetic() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("s", b"ABCDEFGH")],
            |s| s.no_arith = true,
            FnExecutor(|input: &[u8], trace: &mut [u8]| {
                prefix_trace(input, trace);
                ExecStatus::Ok
            }),
        );
        engine.prepare().unwrap();
        let mut st = EntryState::new(0, b"ABCDEFGH".to_vec());
        engine.run_deterministic(&mut st).unwrap();
        assert_eq!(engine.stage_stats().cycles(Stage::Arith8), 0);
        assert_eq!(engine.stage_stats().cycles(Stage::Interest16), 0);
        assert!(engine.stage_stats().cycles(Stage::Interest8) > 0);
    }

    #[test]
    fn skipped_entries_go_straight_to_havoc() {
        let dir = tempdir().unwrap();
        let mut engine = engine_with(
            dir.path(),
            &[("s", b"ABCD")],
            |s| s.skip_deterministic = true,
            FnExecutor(|input: &[u8], trace: &mut [u8]| {
                prefix_trace(input, trace);
                ExecStatus::Ok
            }),
        );
        engine.prepare().unwrap();
        let mut st = EntryState::new(0, b"ABCD".to_vec());
        assert_eq!(
            engine.run_deterministic(&mut st).unwrap(),
            StageResult::SkipToHavoc
        );
        assert!(!st.doing_det);
    }
}
