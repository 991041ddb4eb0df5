//! Name accumulation and external-key index sorting.

use slicesync_primitives::{Accession, Name};

/// An append-ordered sequence of `(name, accession)` pairs.
///
/// The accumulator preserves arrival order; sorting happens externally via
/// [`IndexSorter`] so name buffers never move.
#[derive(Debug, Default, Clone)]
pub struct NameAccum {
    ents: Vec<(Name, Option<Accession>)>,
}

impl NameAccum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: Name, item: Option<Accession>) {
        self.ents.push((name, item));
    }

    pub fn len(&self) -> usize {
        self.ents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ents.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&Name> {
        self.ents.get(index).map(|(name, _)| name)
    }

    pub fn get(&self, index: usize) -> Option<&(Name, Option<Accession>)> {
        self.ents.get(index)
    }

    /// Name most recently appended.
    pub fn last_name(&self) -> Option<&Name> {
        self.ents.last().map(|(name, _)| name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Name, Option<Accession>)> {
        self.ents.iter()
    }

    pub fn clear(&mut self) {
        self.ents.clear();
    }

    /// Takes the contents, leaving the accumulator empty.
    pub fn take(&mut self) -> NameAccum {
        NameAccum {
            ents: core::mem::take(&mut self.ents),
        }
    }

    /// Keeps only the first `len` entries.
    pub fn truncate(&mut self, len: usize) {
        self.ents.truncate(len);
    }

    /// Removes the first `count` entries, shifting the rest down.
    pub fn drain_front(&mut self, count: usize) {
        self.ents.drain(..count.min(self.ents.len()));
    }
}

/// A binary min-heap of indices into a [`NameAccum`], ordered by the names
/// the indices point at (ties broken by index, so equal names come out in
/// arrival order).
///
/// The heap stores only indices; every comparison consults the accumulator
/// passed to the operation, which must be the same one throughout.
#[derive(Debug, Default)]
pub struct IndexSorter {
    heap: Vec<usize>,
}

impl IndexSorter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn less(accum: &NameAccum, a: usize, b: usize) -> bool {
        match (accum.name(a), accum.name(b)) {
            (Some(na), Some(nb)) => (na, a) < (nb, b),
            _ => false,
        }
    }

    /// Inserts `index` into the heap.
    pub fn add(&mut self, accum: &NameAccum, index: usize) {
        self.heap.push(index);
        let mut child = self.heap.len() - 1;
        while child > 0 {
            let parent = (child - 1) / 2;
            if Self::less(accum, self.heap[child], self.heap[parent]) {
                self.heap.swap(child, parent);
                child = parent;
            } else {
                break;
            }
        }
    }

    /// Index of the smallest name, without removing it.
    pub fn best(&self) -> Option<usize> {
        self.heap.first().copied()
    }

    /// Removes and returns the index of the smallest name.
    pub fn remove_best(&mut self, accum: &NameAccum) -> Option<usize> {
        if self.heap.is_empty() {
            return None;
        }
        let best = self.heap.swap_remove(0);
        let len = self.heap.len();
        let mut parent = 0;
        loop {
            let left = 2 * parent + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && Self::less(accum, self.heap[right], self.heap[left]) {
                smallest = right;
            }
            if Self::less(accum, self.heap[smallest], self.heap[parent]) {
                self.heap.swap(parent, smallest);
                parent = smallest;
            } else {
                break;
            }
        }
        Some(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accum_of(uris: &[&str]) -> NameAccum {
        let mut accum = NameAccum::new();
        for uri in uris {
            accum.append(Name::parse_uri(uri), None);
        }
        accum
    }

    fn drain_sorted(accum: &NameAccum) -> Vec<String> {
        let mut sorter = IndexSorter::with_capacity(accum.len());
        for ix in 0..accum.len() {
            sorter.add(accum, ix);
        }
        let mut out = Vec::new();
        while let Some(ix) = sorter.remove_best(accum) {
            out.push(accum.name(ix).unwrap().to_string());
        }
        out
    }

    #[test]
    fn sorts_without_moving_names() {
        let accum = accum_of(&["/z", "/a/2", "/m", "/a/1"]);
        assert_eq!(drain_sorted(&accum), vec!["/a/1", "/a/2", "/m", "/z"]);
        // accumulator order untouched
        assert_eq!(accum.name(0).unwrap().to_string(), "/z");
    }

    #[test]
    fn equal_names_come_out_in_arrival_order() {
        let accum = accum_of(&["/dup", "/a", "/dup", "/dup"]);
        let mut sorter = IndexSorter::new();
        for ix in 0..accum.len() {
            sorter.add(&accum, ix);
        }
        assert_eq!(sorter.remove_best(&accum), Some(1)); // "/a"
        assert_eq!(sorter.remove_best(&accum), Some(0));
        assert_eq!(sorter.remove_best(&accum), Some(2));
        assert_eq!(sorter.remove_best(&accum), Some(3));
        assert_eq!(sorter.remove_best(&accum), None);
    }

    #[test]
    fn best_peeks_without_removal() {
        let accum = accum_of(&["/b", "/a"]);
        let mut sorter = IndexSorter::new();
        sorter.add(&accum, 0);
        sorter.add(&accum, 1);
        assert_eq!(sorter.best(), Some(1));
        assert_eq!(sorter.len(), 2);
    }

    #[test]
    fn large_random_permutation_sorts() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut uris: Vec<String> = (0..500).map(|i| format!("/n/{i:04}")).collect();
        let sorted = uris.clone();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        uris.shuffle(&mut rng);

        let mut accum = NameAccum::new();
        for uri in &uris {
            accum.append(Name::parse_uri(uri), None);
        }
        assert_eq!(
            drain_sorted(&accum),
            sorted.iter().map(|s| s.to_string()).collect::<Vec<_>>()
        );
    }
}
