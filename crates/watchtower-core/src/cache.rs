use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Entry<V> {
    commit: String,
    value: V,
}

/// Per-branch values tied to the commit they were computed for. A lookup
/// with a different commit is a miss, so data for a branch that has moved
/// is never served.
#[derive(Debug, Clone)]
pub struct CommitCache<V> {
    entries: HashMap<String, Entry<V>>,
}

impl<V> Default for CommitCache<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V: Clone> CommitCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, branch: &str, commit: &str) -> Option<V> {
        self.entries
            .get(branch)
            .filter(|entry| entry.commit == commit)
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&mut self, branch: impl Into<String>, commit: impl Into<String>, value: V) {
        self.entries.insert(
            branch.into(),
            Entry {
                commit: commit.into(),
                value,
            },
        );
    }

    pub fn remove(&mut self, branch: &str) -> Option<V> {
        self.entries.remove(branch).map(|entry| entry.value)
    }

    /// Drops entries whose branch moved or disappeared. `tips` yields the
    /// current `(name, commit)` of every live branch. Returns how many
    /// entries were dropped.
    pub fn invalidate_moved<'a>(&mut self, tips: impl IntoIterator<Item = (&'a str, &'a str)>) -> usize {
        let live: HashMap<&str, &str> = tips.into_iter().collect();
        let before = self.entries.len();
        self.entries
            .retain(|name, entry| live.get(name.as_str()).is_some_and(|commit| *commit == entry.commit));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
