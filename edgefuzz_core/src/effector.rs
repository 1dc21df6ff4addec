use crate::constants::{EFF_MAP_SCALE2, EFF_MAX_PERC};

/// Map unit covering input byte `pos`.
pub fn eff_apos(pos: usize) -> usize {
    pos >> EFF_MAP_SCALE2
}

/// Number of map units needed for an input of `len` bytes.
pub fn eff_alen(len: usize) -> usize {
    len.div_ceil(1 << EFF_MAP_SCALE2)
}

/// Number of map units spanned by `len` bytes starting at `pos`.
pub fn eff_span_alen(pos: usize, len: usize) -> usize {
    eff_apos(pos + len - 1) - eff_apos(pos) + 1
}

/// Coarse record of which regions of an input change the execution path when
/// their bytes are flipped. One unit covers `2^EFF_MAP_SCALE2` input bytes.
///
/// The first and last units always start out marked.
#[derive(Debug, Clone)]
pub struct EffectorMap {
    units: Vec<u8>,
    marked: usize,
}

impl EffectorMap {
    pub fn new(input_len: usize) -> Self {
        let alen = eff_alen(input_len);
        let mut map = Self {
            units: vec![0; alen],
            marked: 0,
        };
        if alen > 0 {
            map.mark(0);
            map.mark(input_len - 1);
        }
        map
    }

    /// Marks the unit containing input byte `index` as significant.
    pub fn mark(&mut self, index: usize) {
        let unit = &mut self.units[eff_apos(index)];
        if *unit == 0 {
            *unit = 1;
            self.marked += 1;
        }
    }

    pub fn mark_all(&mut self) {
        self.units.fill(1);
        self.marked = self.units.len();
    }

    pub fn has_no_effect(&self, index: usize) -> bool {
        self.units[eff_apos(index)] == 0
    }

    /// True iff no unit overlapping bytes `start..start + len` is marked.
    pub fn has_no_effect_range(&self, start: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let first = eff_apos(start);
        let span = eff_span_alen(start, len);
        self.units[first..first + span].iter().all(|&u| u == 0)
    }

    /// More than `EFF_MAX_PERC` percent of the units are marked.
    pub fn is_dense(&self) -> bool {
        !self.units.is_empty() && self.marked * 100 / self.units.len() > EFF_MAX_PERC
    }

    pub fn marked_count(&self) -> usize {
        self.marked
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::EFF_MIN_LEN;

    #[test]
    fn short_input_is_fully_significant() {
        let len = 10;
        assert!(len < EFF_MIN_LEN);
        let mut map = EffectorMap::new(len);
        assert_eq!(map.unit_count(), 2);
        assert!(!map.has_no_effect_range(0, len));
        map.mark_all();
        assert!(map.is_dense());
    }

    #[test]
    fn first_and_last_units_are_seeded() {
        let map = EffectorMap::new(64);
        assert_eq!(map.unit_count(), 8);
        assert_eq!(map.marked_count(), 2);
        assert!(!map.has_no_effect(0));
        assert!(!map.has_no_effect(63));
        assert!(map.has_no_effect(8));
        assert!(map.has_no_effect_range(8, 48));
        assert!(!map.has_no_effect_range(8, 49));
    }

    #[test]
    fn single_unit_input_seeds_once() {
        let map = EffectorMap::new(5);
        assert_eq!(map.unit_count(), 1);
        assert_eq!(map.marked_count(), 1);
    }

    #[test]
    fn density_threshold() {
        let mut map = EffectorMap::new(80);
        for i in (0..80).step_by(8).take(9) {
            map.mark(i);
        }
        assert_eq!(map.marked_count(), 10);
        assert!(map.is_dense());

        let mut sparse = EffectorMap::new(80);
        for i in (0..80).step_by(8).take(8) {
            sparse.mark(i);
        }
        assert_eq!(sparse.marked_count(), 9);
        assert!(!sparse.is_dense());
    }

    #[test]
    fn span_helpers() {
        assert_eq!(eff_alen(0), 0);
        assert_eq!(eff_alen(8), 1);
        assert_eq!(eff_alen(9), 2);
        assert_eq!(eff_span_alen(7, 2), 2);
        assert_eq!(eff_span_alen(8, 8), 1);
    }
}
