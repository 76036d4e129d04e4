use rustc_hash::FxHashSet;
use std::hash::Hash;

/// A fixed-capacity set that evicts in insertion order (not LRU): when it is full, adding an
///  entry removes the oldest one.
pub struct DuplicateCache<T> {
    capacity: usize,
    members: FxHashSet<T>,
    entries: Entries<T>,
}

impl<T: Hash + Eq + Clone> DuplicateCache<T> {
    pub fn new(capacity: usize) -> DuplicateCache<T> {
        assert!(capacity > 0, "duplicate cache capacity must be positive");

        DuplicateCache {
            capacity,
            members: FxHashSet::default(),
            entries: Entries::Growing(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn seen(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    /// Adds an entry if it is not present, evicting the oldest entry if the cache is full.
    ///  Re-adding an entry that is already present does not change its position.
    pub fn remember(&mut self, value: T) {
        if self.members.contains(&value) {
            return;
        }

        if let Some(evicted) = self.entries.add(value.clone(), self.capacity) {
            self.members.remove(&evicted);
        }
        self.members.insert(value);
    }
}

enum Entries<T> {
    Growing(Vec<T>),
    Ring {
        buf: Vec<T>,
        next: usize,
    },
}
impl<T> Entries<T> {
    /// adds a new value, returning the value that was evicted in its place (if any)
    #[must_use]
    fn add(&mut self, value: T, capacity: usize) -> Option<T> {
        match self {
            Entries::Growing(buf) => {
                buf.push(value);
                if buf.len() == capacity {
                    let buf = std::mem::take(buf);
                    *self = Entries::Ring { buf, next: 0 };
                }
                None
            }
            Entries::Ring { buf, next } => {
                let evicted = std::mem::replace(&mut buf[*next], value);
                *next = (*next + 1) % capacity;
                Some(evicted)
            }
        }
    }
}
