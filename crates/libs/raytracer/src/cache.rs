use std::{collections::HashMap, fmt::Debug, hash::Hash};

struct Entry<V> {
    value: V,
    last_used_frame: u64,
    last_used_tick: u64,
}

/// What a call changed, so a failed call can be undone.
struct Journal<K> {
    frame: u64,
    tick: u64,
    generation: u64,
    inserted: Vec<K>,
    touched: Vec<(K, u64, u64)>,
    evicted_from: usize,
}

/// Capacity bounded map from a value key to an owned GPU object.
///
/// Entries are stamped with the frame they were last used in. An entry is
/// *retired* once `retire_after` frames have passed without a use; only
/// retired entries are ever evicted, so an object a frame still in flight
/// may reference is never destroyed. When nothing is retired the cache grows
/// past its capacity instead.
///
/// Between [`ObjectCache::begin`] and [`ObjectCache::commit`] evictions are
/// held back and every insertion and use is recorded, so
/// [`ObjectCache::rollback`] can restore the cache as it was.
///
/// Returned references borrow the cache and are therefore only valid until
/// its next mutation. Callers that copy raw handles out can compare
/// [`ObjectCache::generation`] to detect that entries have left the cache.
pub struct ObjectCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    evicted: Vec<(K, Entry<V>)>,
    journal: Option<Journal<K>>,
    capacity: usize,
    retire_after: u64,
    frame: u64,
    tick: u64,
    generation: u64,
}

impl<K, V> ObjectCache<K, V>
where
    K: Hash + Eq + Clone + Debug,
{
    pub fn new(capacity: usize, retire_after: u64) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            evicted: vec![],
            journal: None,
            capacity,
            retire_after,
            frame: 0,
            tick: 0,
            generation: 0,
        }
    }

    /// Returns the value cached under `key`, building it with `factory` on a
    /// miss. A failing factory leaves the cache untouched.
    pub fn get_or_create<E, F>(&mut self, key: K, factory: F) -> Result<&V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        self.tick += 1;

        if self.entries.contains_key(&key) {
            log::trace!("Cache hit for {:?}", key);
            self.record_touch(&key);
        } else {
            let value = factory()?;
            log::debug!("Cache miss for {:?}, created new entry", key);
            self.make_room();
            if let Some(journal) = &mut self.journal {
                journal.inserted.push(key.clone());
            }
            self.entries.insert(
                key.clone(),
                Entry {
                    value,
                    last_used_frame: self.frame,
                    last_used_tick: self.tick,
                },
            );
        }

        let entry = self
            .entries
            .get_mut(&key)
            .expect("entry was present or just inserted");
        entry.last_used_frame = self.frame;
        entry.last_used_tick = self.tick;

        Ok(&entry.value)
    }

    /// Looks `key` up and marks it used in the current frame.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.tick += 1;
        self.record_touch(key);
        let (frame, tick) = (self.frame, self.tick);

        self.entries.get_mut(key).map(|entry| {
            entry.last_used_frame = frame;
            entry.last_used_tick = tick;
            &entry.value
        })
    }

    /// Looks `key` up without touching its use stamp.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Explicitly invalidates `key`. The caller takes over the value and with
    /// it the responsibility for the device no longer using it. Not undone by
    /// a rollback.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.bump_generation(1);

        Some(entry.value)
    }

    /// Removes every entry `keep` rejects. Not undone by a rollback.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|key, entry| keep(key, &entry.value));
        if self.entries.len() != before {
            self.bump_generation(1);
        }
    }

    /// Removes every retired entry right away, including evictions still
    /// held back by an open call. Used to reclaim space in a bounded backing
    /// store. Not undone by a rollback.
    pub fn evict_retired(&mut self) -> Vec<(K, V)> {
        let retired = self
            .entries
            .iter()
            .filter(|(_, entry)| self.frame - entry.last_used_frame >= self.retire_after)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        let mut released = self.take_evicted();
        for key in retired {
            if let Some(entry) = self.entries.remove(&key) {
                log::debug!("Releasing retired {:?}", key);
                self.bump_generation(1);
                released.push((key, entry.value));
            }
        }

        released
    }

    /// Moves the cache to `frame`. Frames never go backwards.
    pub fn set_frame(&mut self, frame: u64) {
        debug_assert!(frame >= self.frame, "cache frames must be monotonic");
        self.frame = self.frame.max(frame);
    }

    /// Starts recording a call. Evictions are held until [`Self::commit`].
    pub fn begin(&mut self) {
        debug_assert!(self.journal.is_none(), "cache call already open");
        self.journal = Some(Journal {
            frame: self.frame,
            tick: self.tick,
            generation: self.generation,
            inserted: vec![],
            touched: vec![],
            evicted_from: self.evicted.len(),
        });
    }

    /// Ends the open call and hands over everything evicted so far.
    pub fn commit(&mut self) -> Vec<(K, V)> {
        self.journal = None;
        self.take_evicted()
    }

    /// Undoes the open call: entries it inserted are dropped, entries it
    /// evicted come back and use stamps, frame and tick are restored.
    pub fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };

        for key in journal.inserted.iter().rev() {
            self.entries.remove(key);
        }
        let evicted_from = journal.evicted_from.min(self.evicted.len());
        for (key, entry) in self.evicted.drain(evicted_from..) {
            self.entries.insert(key, entry);
        }
        for (key, frame, tick) in journal.touched.into_iter().rev() {
            if let Some(entry) = self.entries.get_mut(&key) {
                entry.last_used_frame = frame;
                entry.last_used_tick = tick;
            }
        }

        self.frame = journal.frame;
        self.tick = journal.tick;
        self.generation = journal.generation;
        log::debug!("Rolled back cache to frame {}", self.frame);
    }

    /// Hands evicted entries to the owner so dependents can be invalidated
    /// before the objects are dropped.
    pub fn take_evicted(&mut self) -> Vec<(K, V)> {
        // Evictions were counted when they happened, but a rollback would
        // have put the held back ones back
        if let Some(journal) = &mut self.journal {
            journal.generation += self.evicted.len().saturating_sub(journal.evicted_from) as u64;
            journal.evicted_from = 0;
        }

        std::mem::take(&mut self.evicted)
            .into_iter()
            .map(|(key, entry)| (key, entry.value))
            .collect()
    }

    pub fn is_retired(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .map_or(false, |entry| self.frame - entry.last_used_frame >= self.retire_after)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn record_touch(&mut self, key: &K) {
        let (Some(journal), Some(entry)) = (&mut self.journal, self.entries.get(key)) else {
            return;
        };
        journal
            .touched
            .push((key.clone(), entry.last_used_frame, entry.last_used_tick));
    }

    fn bump_generation(&mut self, count: u64) {
        self.generation += count;
        if let Some(journal) = &mut self.journal {
            journal.generation += count;
        }
    }

    fn make_room(&mut self) {
        while self.entries.len() >= self.capacity {
            let victim = self
                .entries
                .iter()
                .filter(|(_, entry)| self.frame - entry.last_used_frame >= self.retire_after)
                .min_by_key(|(_, entry)| entry.last_used_tick)
                .map(|(key, _)| key.clone());

            let Some(victim) = victim else {
                log::warn!(
                    "Cache over capacity ({} >= {}), no entry retired yet",
                    self.entries.len(),
                    self.capacity
                );
                return;
            };

            if let Some(entry) = self.entries.remove(&victim) {
                log::debug!("Evicting {:?}", victim);
                self.generation += 1;
                self.evicted.push((victim, entry));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn contents(cache: &ObjectCache<&'static str, u32>) -> Vec<(&'static str, u32, u64, u64)> {
        let mut contents = cache
            .entries
            .iter()
            .map(|(key, entry)| (*key, entry.value, entry.last_used_frame, entry.last_used_tick))
            .collect::<Vec<_>>();
        contents.sort();
        contents
    }

    #[test]
    fn hit_skips_factory() {
        let mut cache = ObjectCache::new(4, 2);
        let calls = Cell::new(0);
        let factory = || {
            calls.set(calls.get() + 1);
            Ok::<_, ()>(calls.get())
        };

        assert_eq!(*cache.get_or_create("a", factory).unwrap(), 1);
        assert_eq!(*cache.get_or_create("a", factory).unwrap(), 1);
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_factory_leaves_cache_unchanged() {
        let mut cache = ObjectCache::<&str, u32>::new(1, 1);
        cache.get_or_create("a", || Ok::<_, ()>(1)).unwrap();
        cache.set_frame(5);
        let generation = cache.generation();

        assert_eq!(cache.get_or_create("b", || Err("boom")), Err("boom"));
        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
        assert_eq!(cache.generation(), generation);
        assert!(cache.take_evicted().is_empty());
    }

    #[test]
    fn in_flight_entries_are_never_evicted() {
        let mut cache = ObjectCache::new(2, 2);
        cache.get_or_create(0, || Ok::<_, ()>("a")).unwrap();
        cache.get_or_create(1, || Ok::<_, ()>("b")).unwrap();

        // Frame 1: both entries are younger than two frames
        cache.set_frame(1);
        cache.get_or_create(2, || Ok::<_, ()>("c")).unwrap();
        assert_eq!(cache.len(), 3);
        assert!(cache.take_evicted().is_empty());

        // Frame 2: entries from frame 0 are retired, the oldest goes first
        cache.set_frame(2);
        cache.get_or_create(3, || Ok::<_, ()>("d")).unwrap();
        let evicted = cache.take_evicted();
        assert_eq!(evicted.len(), 2);
        assert_eq!(evicted[0].0, 0);
        assert_eq!(evicted[1].0, 1);
        assert!(cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[test]
    fn capacity_plus_one_respects_frames_in_flight() {
        let frames_in_flight = 3;
        let capacity = 4;
        let mut cache = ObjectCache::new(capacity, frames_in_flight);

        for key in 0..=capacity {
            cache.set_frame(key as u64);
            cache.get_or_create(key, || Ok::<_, ()>(key)).unwrap();
        }

        for (key, _) in cache.take_evicted() {
            assert!(cache.frame() - key as u64 >= frames_in_flight);
        }
        for key in capacity + 1 - frames_in_flight as usize..=capacity {
            assert!(cache.contains(&key));
        }
        assert!(cache.len() <= capacity);
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let mut cache = ObjectCache::new(2, 1);
        cache.get_or_create("a", || Ok::<_, ()>(1)).unwrap();
        cache.get_or_create("b", || Ok::<_, ()>(2)).unwrap();
        cache.set_frame(1);
        assert_eq!(cache.get(&"a"), Some(&1));

        cache.set_frame(2);
        cache.get_or_create("c", || Ok::<_, ()>(3)).unwrap();

        let evicted = cache.take_evicted();
        assert_eq!(evicted, vec![("b", 2)]);
        assert!(cache.contains(&"a"));
    }

    #[test]
    fn peek_does_not_refresh() {
        let mut cache = ObjectCache::new(4, 1);
        cache.get_or_create("a", || Ok::<_, ()>(1)).unwrap();
        cache.set_frame(1);

        assert_eq!(cache.peek(&"a"), Some(&1));
        assert!(cache.is_retired(&"a"));

        cache.get(&"a");
        assert!(!cache.is_retired(&"a"));
    }

    #[test]
    fn removal_bumps_generation() {
        let mut cache = ObjectCache::new(4, 1);
        cache.get_or_create(1, || Ok::<_, ()>("one")).unwrap();
        cache.get_or_create(2, || Ok::<_, ()>("two")).unwrap();
        let generation = cache.generation();

        assert_eq!(cache.remove(&1), Some("one"));
        assert_eq!(cache.remove(&1), None);
        assert_eq!(cache.generation(), generation + 1);

        cache.retain(|_, value| *value != "two");
        assert!(cache.is_empty());
        assert_eq!(cache.generation(), generation + 2);
    }

    #[test]
    fn rollback_restores_contents_after_mid_call_failure() {
        let mut cache = ObjectCache::new(3, 1);
        for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
            cache.get_or_create(key, || Ok::<_, ()>(value)).unwrap();
        }
        cache.set_frame(1);
        cache.get(&"c");
        let before = contents(&cache);
        let generation = cache.generation();

        cache.begin();
        cache.set_frame(4);
        cache.get_or_create("c", || Ok::<_, ()>(30)).unwrap();
        // Evicts retired "a" and "b" on the way
        cache.get_or_create("d", || Ok::<_, ()>(4)).unwrap();
        cache.get_or_create("e", || Ok::<_, ()>(5)).unwrap();
        assert!(!cache.contains(&"a"));
        assert_eq!(cache.get_or_create("f", || Err("allocation failed")), Err("allocation failed"));
        cache.rollback();

        assert_eq!(contents(&cache), before);
        assert_eq!(cache.generation(), generation);
        assert_eq!(cache.frame(), 1);
        assert!(cache.take_evicted().is_empty());
    }

    #[test]
    fn commit_hands_over_held_back_evictions() {
        let mut cache = ObjectCache::new(1, 1);
        cache.get_or_create("a", || Ok::<_, ()>(1)).unwrap();

        cache.begin();
        cache.set_frame(1);
        cache.get_or_create("b", || Ok::<_, ()>(2)).unwrap();

        assert_eq!(cache.commit(), vec![("a", 1)]);
        cache.rollback();
        assert!(cache.contains(&"b"));
        assert!(!cache.contains(&"a"));
    }

    #[test]
    fn evict_retired_keeps_in_flight_entries() {
        let mut cache = ObjectCache::new(8, 2);
        cache.get_or_create("old", || Ok::<_, ()>(1)).unwrap();
        cache.set_frame(1);
        cache.get_or_create("recent", || Ok::<_, ()>(2)).unwrap();
        cache.set_frame(2);

        cache.begin();
        let released = cache.evict_retired();
        cache.rollback();

        assert_eq!(released, vec![("old", 1)]);
        assert!(!cache.contains(&"old"));
        assert!(cache.contains(&"recent"));
        assert_eq!(cache.generation(), 1);
    }
}
