//! Compact bitset representation for leaf sets.
//!
//! # Overview
//! A bitset is an efficient way to represent which taxa lie on one side of a
//! split, or below a node. Each bit position corresponds to a taxon index.
//!
//! # Example
//! For taxa [A, B, C, D] mapped to indices [0, 1, 2, 3]:
//! - Cluster {A, C} → bitset `0b0101` (bits 0 and 2 set)
//! - Cluster {B, C, D} → bitset `0b1110` (bits 1, 2, 3 set)

/// Set of taxon indices, 64 per `u64` word.
///
/// Ordering and hashing follow the words, so bitsets work as keys of the
/// cluster and split tables.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bitset(pub Vec<u64>);

impl Bitset {
    /// Empty set over `words` words; see [`Bitset::words_for`].
    pub fn zeros(words: usize) -> Self {
        Bitset(vec![0u64; words])
    }

    /// Number of words needed to hold `bits` indices.
    ///
    /// ```
    /// # use rust_python_superfine::bitset::Bitset;
    /// assert_eq!(Bitset::words_for(64), 1);
    /// assert_eq!(Bitset::words_for(65), 2);
    /// assert_eq!(Bitset::zeros(Bitset::words_for(0)).0.len(), 1);
    /// ```
    pub fn words_for(bits: usize) -> usize {
        bits.div_ceil(64).max(1)
    }

    #[inline]
    pub fn set(&mut self, idx: usize) {
        self.0[idx >> 6] |= 1u64 << (idx & 63);
    }

    /// Out-of-range indices are simply absent.
    #[inline]
    pub fn contains(&self, idx: usize) -> bool {
        self.0
            .get(idx >> 6)
            .is_some_and(|word| word & (1u64 << (idx & 63)) != 0)
    }

    /// Union in place: the cluster of a node is the union of its children's.
    ///
    /// ```
    /// # use rust_python_superfine::bitset::Bitset;
    /// let mut node = Bitset::zeros(1);
    /// node.set(0);
    /// let mut child = Bitset::zeros(1);
    /// child.set(3);
    /// node.or_assign(&child);
    /// assert_eq!(node.ones().collect::<Vec<_>>(), vec![0, 3]);
    /// ```
    #[inline]
    pub fn or_assign(&mut self, other: &Bitset) {
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a |= *b;
        }
    }

    #[inline]
    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// `true` when every bit of `self` is also set in `other`.
    #[inline]
    pub fn is_subset(&self, other: &Bitset) -> bool {
        self.0.iter().zip(&other.0).all(|(a, b)| a & !b == 0)
    }

    /// Indices of the set bits, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(w, &word)| {
            (0..64).filter(move |b| word & (1u64 << b) != 0).map(move |b| (w << 6) | b)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn of(indices: &[usize], words: usize) -> Bitset {
        let mut bs = Bitset::zeros(words);
        for &i in indices {
            bs.set(i);
        }
        bs
    }

    #[test]
    fn test_membership() {
        let bs = of(&[0, 2], 1);
        assert_eq!(bs.0[0], 0b0101);
        assert!(bs.contains(2));
        assert!(!bs.contains(1));
        assert!(!bs.contains(640));
    }

    #[test]
    fn test_clusters_nest() {
        // ((A,(B,C)),D) with A=0 B=1 C=2 D=3
        let bc = of(&[1, 2], 1);
        let mut abc = of(&[0], 1);
        abc.or_assign(&bc);
        assert_eq!(abc, of(&[0, 1, 2], 1));
        assert!(bc.is_subset(&abc));
        assert!(!abc.is_subset(&bc));
        assert!(Bitset::zeros(1).is_empty());
    }

    #[test]
    fn test_multiple_words() {
        let bs = of(&[0, 63, 64, 127], Bitset::words_for(128));
        assert_eq!(bs.count_ones(), 4);
        assert_eq!(bs.ones().collect::<Vec<_>>(), vec![0, 63, 64, 127]);
    }
}
