//! A circular doubly linked list over descriptor indices.

/// The free list: a ring threading every descriptor of the pool exactly once.
///
/// Scans start at the anchor (`head`) and follow `next` links. Entries pushed with
/// [Ring::push_back] land just behind the anchor, so a full scan visits the least recently
/// (re)bound descriptors first.
pub(crate) struct Ring {
    head: Option<usize>,
    next: Vec<Option<usize>>,
    prev: Vec<Option<usize>>,
}

impl Ring {
    /// Link `len` entries into a ring in index order, anchored at entry 0.
    pub fn new(len: usize) -> Self {
        Self {
            head: (len > 0).then_some(0),
            next: (0..len).map(|i| Some((i + 1) % len)).collect(),
            prev: (0..len).map(|i| Some((i + len - 1) % len)).collect(),
        }
    }

    /// Unlink `index` from the ring.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not linked.
    pub fn remove(&mut self, index: usize) {
        let (Some(prev), Some(next)) = (self.prev[index], self.next[index]) else {
            panic!("free list corrupted");
        };
        self.prev[index] = None;
        self.next[index] = None;
        if next == index {
            self.head = None;
            return;
        }
        self.next[prev] = Some(next);
        self.prev[next] = Some(prev);
        if self.head == Some(index) {
            self.head = Some(next);
        }
    }

    /// Link `index` just behind the anchor (the last position a scan reaches).
    ///
    /// # Panics
    ///
    /// Panics if `index` is already linked.
    pub fn push_back(&mut self, index: usize) {
        if self.next[index].is_some() || self.prev[index].is_some() {
            panic!("free list corrupted");
        }
        let Some(head) = self.head else {
            self.head = Some(index);
            self.next[index] = Some(index);
            self.prev[index] = Some(index);
            return;
        };
        let Some(tail) = self.prev[head] else {
            panic!("free list corrupted");
        };
        self.next[index] = Some(head);
        self.prev[index] = Some(tail);
        self.next[tail] = Some(index);
        self.prev[head] = Some(index);
    }

    /// Move `index` to the back of the ring.
    pub fn move_to_back(&mut self, index: usize) {
        self.remove(index);
        self.push_back(index);
    }

    /// Iterate over every linked entry, starting at the anchor.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            ring: self,
            cursor: self.head,
        }
    }

    /// Assert that the ring is closed, consistently linked in both directions, and visits each of
    /// its `len` entries exactly once.
    #[cfg(test)]
    pub fn check(&self) {
        let len = self.next.len();
        let mut seen = vec![false; len];
        let mut count = 0;
        for index in self.iter() {
            assert!(!seen[index], "entry {index} visited twice");
            seen[index] = true;
            count += 1;
            let next = self.next[index].unwrap();
            assert_eq!(self.prev[next], Some(index));
        }
        assert_eq!(count, len);
    }
}

/// Iterator over a [Ring], starting at its anchor.
pub(crate) struct Iter<'a> {
    ring: &'a Ring,
    cursor: Option<usize>,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.cursor?;
        let Some(next) = self.ring.next[current] else {
            panic!("free list corrupted");
        };
        self.cursor = (Some(next) != self.ring.head).then_some(next);
        Some(current)
    }
}
