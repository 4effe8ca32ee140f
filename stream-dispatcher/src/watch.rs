use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent<T> {
    pub key: String,
    pub kind: WatchEventKind,
    pub data: T,
}

/// Turns successive full snapshots into per-key change events.
///
/// Feed every record of a snapshot through [`IndexHelper::update`], then
/// call [`IndexHelper::rotate`] once to collect the keys that disappeared.
#[derive(Debug)]
pub struct IndexHelper<T> {
    previous: HashMap<String, (i64, T)>,
    current: HashMap<String, (i64, T)>,
}

impl<T> Default for IndexHelper<T> {
    fn default() -> Self {
        Self {
            previous: HashMap::new(),
            current: HashMap::new(),
        }
    }
}

impl<T: Clone> IndexHelper<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` at `version`. Returns an event unless the key was seen
    /// in the previous snapshot with the same version.
    pub fn update(&mut self, key: &str, version: i64, data: T) -> Option<WatchEvent<T>> {
        self.current
            .insert(key.to_string(), (version, data.clone()));

        let kind = match self.previous.remove(key) {
            None => WatchEventKind::Added,
            Some((last, _)) if last == version => return None,
            Some(_) => WatchEventKind::Modified,
        };
        Some(WatchEvent {
            key: key.to_string(),
            kind,
            data,
        })
    }

    /// Close the current snapshot. Keys of the previous snapshot that were
    /// not updated come back as `Deleted`, carrying their last data.
    pub fn rotate(&mut self) -> Vec<WatchEvent<T>> {
        let gone = std::mem::replace(&mut self.previous, std::mem::take(&mut self.current));
        let mut events: Vec<WatchEvent<T>> = gone
            .into_iter()
            .map(|(key, (_, data))| WatchEvent {
                key,
                kind: WatchEventKind::Deleted,
                data,
            })
            .collect();
        events.sort_by(|a, b| a.key.cmp(&b.key));
        events
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}
