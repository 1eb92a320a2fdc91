//! Fixed-size bit arrays supporting constant-time bit scan, used for
//! the task ready bitmap.
use core::fmt;

use super::Init;

type Word = usize;
const WORD_LEN: usize = Word::BITS as usize;

/// A bit array indexed by priority. Bit `i` is set iff the ready queue
/// for priority `i` is non-empty; [`find_set`] returns the smallest set
/// index, i.e. the most urgent ready priority.
///
/// All methods panic when the given bit position is out of range.
///
/// [`find_set`]: Self::find_set
pub trait PrioBitmap: Init + Send + Sync + Clone + Copy + fmt::Debug + 'static {
    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the position of the first (lowest-numbered) set bit.
    fn find_set(&self) -> Option<usize>;
}

/// Stores `LEN` (≤ `usize::BITS`) entries in a single word. Suitable
/// for the typical kernel configuration of up to 32 or 64 priority
/// levels.
#[derive(Clone, Copy)]
pub struct OneLevelPrioBitmap<const LEN: usize> {
    bits: Word,
}

impl<const LEN: usize> Init for OneLevelPrioBitmap<LEN> {
    const INIT: Self = {
        assert!(LEN <= WORD_LEN, "too many levels");
        Self { bits: 0 }
    };
}

impl<const LEN: usize> fmt::Debug for OneLevelPrioBitmap<LEN> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl<const LEN: usize> PrioBitmap for OneLevelPrioBitmap<LEN> {
    fn get(&self, i: usize) -> bool {
        assert!(i < LEN);
        self.bits & (1 << i) != 0
    }

    fn clear(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits &= !(1 << i);
    }

    fn set(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits |= 1 << i;
    }

    fn find_set(&self) -> Option<usize> {
        let i = self.bits.trailing_zeros() as usize;
        (i != WORD_LEN).then_some(i)
    }
}

/// Stores `WORDS * usize::BITS` entries in a two-level structure: the
/// first level tracks which second-level words are non-zero, keeping
/// `find_set` at two bit scans.
#[derive(Clone, Copy)]
pub struct TwoLevelPrioBitmap<const WORDS: usize> {
    // Invariant: `first & (1 << i) != 0` iff `second[i] != 0`
    first: Word,
    second: [Word; WORDS],
}

impl<const WORDS: usize> Init for TwoLevelPrioBitmap<WORDS> {
    const INIT: Self = {
        assert!(WORDS <= WORD_LEN, "too many levels");
        Self {
            first: 0,
            second: [0; WORDS],
        }
    };
}

impl<const WORDS: usize> fmt::Debug for TwoLevelPrioBitmap<WORDS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..WORDS * WORD_LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl<const WORDS: usize> PrioBitmap for TwoLevelPrioBitmap<WORDS> {
    fn get(&self, i: usize) -> bool {
        self.second[i / WORD_LEN] & (1 << (i % WORD_LEN)) != 0
    }

    fn clear(&mut self, i: usize) {
        let group = &mut self.second[i / WORD_LEN];
        *group &= !(1 << (i % WORD_LEN));
        if *group == 0 {
            self.first &= !(1 << (i / WORD_LEN));
        }
    }

    fn set(&mut self, i: usize) {
        self.second[i / WORD_LEN] |= 1 << (i % WORD_LEN);
        self.first |= 1 << (i / WORD_LEN);
    }

    fn find_set(&self) -> Option<usize> {
        let group_i = self.first.trailing_zeros() as usize;
        if group_i == WORD_LEN {
            return None;
        }
        let subgroup_i = self.second[group_i].trailing_zeros() as usize;
        debug_assert_ne!(subgroup_i, WORD_LEN);
        Some(group_i * WORD_LEN + subgroup_i)
    }
}
