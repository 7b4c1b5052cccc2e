use rand::seq::SliceRandom;
use rand::Rng;

/// Play order of track indices for one shuffle epoch.
///
/// Positions up to the play cursor are history and are never reordered;
/// only the part after it is shuffled again when tracks are added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShuffleTable {
    order: Vec<usize>,
}

impl ShuffleTable {
    /// One full-range shuffle of `count` tracks
    pub fn new<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Self {
        let mut order: Vec<usize> = (0..count).collect();
        order.shuffle(rng);
        Self { order }
    }

    /// Shuffle enabled while `current` is playing.
    ///
    /// Tracks `[0, current)` are shuffled among positions `[0, current)`,
    /// `current` stays at its own position, and the rest is shuffled
    /// independently after it.
    pub fn split_at<R: Rng + ?Sized>(count: usize, current: usize, rng: &mut R) -> Self {
        if current == 0 || current >= count {
            let mut table = Self::new(count, rng);
            if let Some(pos) = table.position_of(current) {
                table.order.swap(0, pos);
            }
            return table;
        }

        let mut order: Vec<usize> = (0..count).collect();
        order[..current].shuffle(rng);
        order[current + 1..].shuffle(rng);
        Self { order }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn track_at(&self, position: usize) -> Option<usize> {
        self.order.get(position).copied()
    }

    pub fn position_of(&self, track: usize) -> Option<usize> {
        self.order.iter().position(|&t| t == track)
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Add tracks up to `count`, reshuffling only positions after `played`
    pub fn grow<R: Rng + ?Sized>(&mut self, count: usize, played: Option<usize>, rng: &mut R) {
        let first_new = self.order.len();
        if count <= first_new {
            return;
        }
        self.order.extend(first_new..count);

        let start = played.map_or(0, |p| p + 1).min(self.order.len());
        self.order[start..].shuffle(rng);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn is_permutation(table: &ShuffleTable, count: usize) -> bool {
        let mut sorted = table.order().to_vec();
        sorted.sort_unstable();
        sorted == (0..count).collect::<Vec<_>>()
    }

    #[test]
    fn test_full_shuffle_is_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let table = ShuffleTable::new(50, &mut rng);
        assert_eq!(table.len(), 50);
        assert!(is_permutation(&table, 50));
    }

    #[test]
    fn test_split_keeps_history_before_current() {
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let table = ShuffleTable::split_at(10, 4, &mut rng);
            assert!(is_permutation(&table, 10));
            assert_eq!(table.track_at(4), Some(4));
            for position in 5..10 {
                assert!(table.track_at(position).unwrap() > 4);
            }
        }
    }

    #[test]
    fn test_split_at_zero_puts_current_first() {
        let mut rng = StdRng::seed_from_u64(3);
        let table = ShuffleTable::split_at(8, 0, &mut rng);
        assert!(is_permutation(&table, 8));
        assert_eq!(table.track_at(0), Some(0));
    }

    #[test]
    fn test_grow_preserves_played_prefix() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut table = ShuffleTable::new(6, &mut rng);
        let played: Vec<usize> = table.order()[..=2].to_vec();

        table.grow(12, Some(2), &mut rng);
        assert!(is_permutation(&table, 12));
        assert_eq!(&table.order()[..=2], played.as_slice());
    }

    #[test]
    fn test_grow_never_shrinks() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut table = ShuffleTable::new(4, &mut rng);
        let before = table.clone();
        table.grow(3, None, &mut rng);
        assert_eq!(table, before);
    }
}
