//! Provides `DynPrioBitmap`, a bit array structure supporting
//! logarithmic-time bit scan operations.
use alloc::{vec, vec::Vec};
use core::fmt;

type Word = usize;
const WORD_LEN: usize = Word::BITS as usize;

/// The maximum bit count supported by [`DynPrioBitmap`].
pub const PRIO_BITMAP_MAX_LEN: usize = WORD_LEN * WORD_LEN * WORD_LEN;

/// A bit array supporting a fast lookup of the highest set bit.
///
/// All methods panic when the given bit position is out of range.
pub trait PrioBitmap: fmt::Debug {
    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the position of the last (most significant) set bit.
    fn find_set(&self) -> Option<usize>;
}

/// Stores up to `WORD_LEN` entries.
#[derive(Clone)]
pub struct OneLevelPrioBitmap {
    bits: Word,
    len: usize,
}

impl OneLevelPrioBitmap {
    fn new(len: usize) -> Self {
        assert!(len <= WORD_LEN);
        Self { bits: 0, len }
    }
}

impl fmt::Debug for OneLevelPrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..self.len).filter(|&i| self.get(i)))
            .finish()
    }
}

impl PrioBitmap for OneLevelPrioBitmap {
    fn get(&self, i: usize) -> bool {
        assert!(i < self.len);
        self.bits & (1 << i) != 0
    }

    fn clear(&mut self, i: usize) {
        assert!(i < self.len);
        self.bits &= !(1 << i);
    }

    fn set(&mut self, i: usize) {
        assert!(i < self.len);
        self.bits |= 1 << i;
    }

    #[inline]
    fn find_set(&self) -> Option<usize> {
        if self.bits == 0 {
            None
        } else {
            Some(WORD_LEN - 1 - self.bits.leading_zeros() as usize)
        }
    }
}

/// Stores `WORD_LEN * second.len()` entries. `T` must be able to store
/// `second.len()` entries.
#[derive(Clone)]
pub struct TwoLevelPrioBitmap<T> {
    // Invariant: `first.get(i) == (second[i] != 0)`
    first: T,
    second: Vec<Word>,
}

impl<T: PrioBitmap> fmt::Debug for TwoLevelPrioBitmap<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries(self.second.iter().enumerate().flat_map(|(group_i, &group)| {
                (0..WORD_LEN)
                    .filter(move |&bit| group & (1 << bit) != 0)
                    .map(move |bit| bit + group_i * WORD_LEN)
            }))
            .finish()
    }
}

impl<T: PrioBitmap> PrioBitmap for TwoLevelPrioBitmap<T> {
    fn get(&self, i: usize) -> bool {
        self.second[i / WORD_LEN] & (1 << (i % WORD_LEN)) != 0
    }

    fn clear(&mut self, i: usize) {
        let group = &mut self.second[i / WORD_LEN];
        *group &= !(1 << (i % WORD_LEN));
        if *group == 0 {
            self.first.clear(i / WORD_LEN);
        }
    }

    fn set(&mut self, i: usize) {
        let group = &mut self.second[i / WORD_LEN];
        *group |= 1 << (i % WORD_LEN);
        self.first.set(i / WORD_LEN);
    }

    fn find_set(&self) -> Option<usize> {
        self.first.find_set().map(|group_i| {
            let group = self.second[group_i];
            debug_assert_ne!(group, 0);
            let subgroup_i = WORD_LEN - 1 - group.leading_zeros() as usize;
            subgroup_i + group_i * WORD_LEN
        })
    }
}

/// A [`PrioBitmap`] whose depth is chosen at runtime by the number of
/// entries.
#[derive(Clone)]
pub enum DynPrioBitmap {
    OneLevel(OneLevelPrioBitmap),
    TwoLevel(TwoLevelPrioBitmap<OneLevelPrioBitmap>),
    ThreeLevel(TwoLevelPrioBitmap<TwoLevelPrioBitmap<OneLevelPrioBitmap>>),
}

impl DynPrioBitmap {
    /// Construct an empty bitmap capable of storing `len` entries.
    ///
    /// # Panics
    ///
    /// Panics if `len` exceeds [`PRIO_BITMAP_MAX_LEN`].
    pub fn new(len: usize) -> Self {
        let groups = |len: usize, group_len: usize| (len + group_len - 1) / group_len;

        if len <= WORD_LEN {
            Self::OneLevel(OneLevelPrioBitmap::new(len))
        } else if len <= WORD_LEN * WORD_LEN {
            let n = groups(len, WORD_LEN);
            Self::TwoLevel(TwoLevelPrioBitmap {
                first: OneLevelPrioBitmap::new(n),
                second: vec![0; n],
            })
        } else if len <= PRIO_BITMAP_MAX_LEN {
            let n1 = groups(len, WORD_LEN * WORD_LEN);
            let n2 = groups(len, WORD_LEN);
            Self::ThreeLevel(TwoLevelPrioBitmap {
                first: TwoLevelPrioBitmap {
                    first: OneLevelPrioBitmap::new(n1),
                    second: vec![0; n1],
                },
                second: vec![0; n2],
            })
        } else {
            panic!("too many priority levels");
        }
    }
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $e:expr) => {
        match $self {
            DynPrioBitmap::OneLevel($inner) => $e,
            DynPrioBitmap::TwoLevel($inner) => $e,
            DynPrioBitmap::ThreeLevel($inner) => $e,
        }
    };
}

impl fmt::Debug for DynPrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        delegate!(self, x => x.fmt(f))
    }
}

impl PrioBitmap for DynPrioBitmap {
    #[inline]
    fn get(&self, i: usize) -> bool {
        delegate!(self, x => x.get(i))
    }

    #[inline]
    fn clear(&mut self, i: usize) {
        delegate!(self, x => x.clear(i))
    }

    #[inline]
    fn set(&mut self, i: usize) {
        delegate!(self, x => x.set(i))
    }

    #[inline]
    fn find_set(&self) -> Option<usize> {
        delegate!(self, x => x.find_set())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    struct BTreePrioBitmap(BTreeSet<usize>);

    impl BTreePrioBitmap {
        fn new() -> Self {
            Self(BTreeSet::new())
        }

        fn enum_set_bits(&self) -> Vec<usize> {
            self.0.iter().cloned().collect()
        }

        fn clear(&mut self, i: usize) {
            self.0.remove(&i);
        }

        fn set(&mut self, i: usize) {
            self.0.insert(i);
        }

        fn find_set(&self) -> Option<usize> {
            self.0.iter().next_back().cloned()
        }
    }

    /// A modifying operation on `PrioBitmap`.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations on `PrioBitmap`.
    fn interpret(bytecode: &[u8], bitmap_len: usize) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if bitmap_len == 0 {
                None
            } else if let Some(instr) = bytecode.get(i..i + 5) {
                i += 5;

                let value = u32::from_le_bytes([instr[1], instr[2], instr[3], instr[4]]) as usize;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = value % bitmap_len;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let i = value % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(i);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    fn enum_set_bits(bitmap: &impl PrioBitmap, bitmap_len: usize) -> Vec<usize> {
        (0..bitmap_len).filter(|&i| bitmap.get(i)).collect()
    }

    fn test_inner(bytecode: Vec<u8>, size: usize) {
        let mut subject = DynPrioBitmap::new(size);
        let mut reference = BTreePrioBitmap::new();

        log::info!("size = {size}");

        for cmd in interpret(&bytecode, size) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.set(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.clear(bit);
                }
            }

            assert_eq!(subject.find_set(), reference.find_set());
        }

        assert_eq!(subject.find_set(), reference.find_set());
        assert_eq!(enum_set_bits(&subject, size), reference.enum_set_bits());
    }

    macro_rules! gen_test {
        ($(#[$m:meta])* mod $name:ident, $size:literal) => {
            $(#[$m])*
            mod $name {
                use super::*;

                #[quickcheck]
                fn test(bytecode: Vec<u8>) {
                    let _ = env_logger::builder().is_test(true).try_init();
                    test_inner(bytecode, $size);
                }
            }
        };
    }

    gen_test!(mod size_0, 0);
    gen_test!(mod size_1, 1);
    gen_test!(mod size_10, 10);
    gen_test!(mod size_100, 100);
    gen_test!(mod size_1000, 1000);
    gen_test!(
        #[cfg(any(target_pointer_width = "32", target_pointer_width = "64"))]
        mod size_10000, 10000
    );

    #[test]
    fn highest_wins() {
        let mut bitmap = DynPrioBitmap::new(300);
        bitmap.set(3);
        bitmap.set(299);
        bitmap.set(64);
        assert_eq!(bitmap.find_set(), Some(299));
        bitmap.clear(299);
        assert_eq!(bitmap.find_set(), Some(64));
        assert_eq!(format!("{bitmap:?}"), "[3, 64]");
    }
}
