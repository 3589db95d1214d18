//! Durable storage for feed items, deduplicated by item id.
//!
//! Merging is first-write-wins: an incoming item whose id is already stored
//! is dropped, so re-fetching a feed never resets the stored `read` flag.
//! The only way to change a stored item is [`ItemStore::update_one`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use super::persist;
use super::types::{FeedItem, StoreError};

/// Capability interface for item storage backends.
pub trait ItemStore {
    /// All stored items in insertion order.
    fn get_stored(&self) -> Result<Vec<FeedItem>, StoreError>;

    /// Stores a single item unless its id is already present.
    fn store_one(&self, item: FeedItem) -> Result<usize, StoreError> {
        self.store_many(vec![item])
    }

    /// Appends every item whose id is not stored yet, in order.
    ///
    /// Duplicates within `items` collapse to their first occurrence.
    /// Returns the number of items added.
    fn store_many(&self, items: Vec<FeedItem>) -> Result<usize, StoreError>;

    /// Replaces the stored item with the same id via [`FeedItem::update`],
    /// or appends it when the id is unknown.
    fn update_one(&self, item: FeedItem) -> Result<(), StoreError>;
}

/// Appends the items of `incoming` whose ids are new. Returns how many were added.
fn merge(stored: &mut Vec<FeedItem>, incoming: Vec<FeedItem>) -> usize {
    let mut known: HashSet<String> = stored.iter().map(|i| i.id.clone()).collect();
    let before = stored.len();
    for item in incoming {
        if known.insert(item.id.clone()) {
            stored.push(item);
        }
    }
    stored.len() - before
}

fn upsert(stored: &mut Vec<FeedItem>, item: FeedItem) {
    match stored.iter_mut().find(|i| i.id == item.id) {
        Some(existing) => existing.update(&item),
        None => stored.push(item),
    }
}

// ============================================================================
// JSON file backend
// ============================================================================

struct JsonState {
    path: PathBuf,
    cache: Vec<FeedItem>,
    /// Modification time of the file when it was last loaded or saved.
    loaded_at: Option<SystemTime>,
}

/// Item store persisted as a JSON array of camelCase records.
pub struct JsonItemStore {
    state: Mutex<JsonState>,
}

impl JsonItemStore {
    /// Opens the store at `path`, creating an empty `[]` file if it is missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let store = Self {
            state: Mutex::new(JsonState {
                path,
                cache: Vec::new(),
                loaded_at: None,
            }),
        };

        {
            let mut state = store.lock();
            if persist::modified_time(&state.path)?.is_none() {
                tracing::debug!(path = %state.path.display(), "Creating empty item storage");
                save(&mut state, &[])?;
            }
        }
        store.refreshed()?;
        Ok(store)
    }

    /// Path of the file currently backing the store.
    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    /// Applies `change` to a copy of the cache and saves it.
    ///
    /// The cache is only replaced once the save went through, so a failed
    /// write leaves it matching the file.
    fn mutate<T>(&self, change: impl FnOnce(&mut Vec<FeedItem>) -> T) -> Result<T, StoreError> {
        let mut state = self.refreshed()?;
        let mut items = state.cache.clone();
        let result = change(&mut items);
        save(&mut state, &items)?;
        state.cache = items;
        Ok(result)
    }

    /// Locks the state, reloading the file first if it is newer than the cache.
    fn refreshed(&self) -> Result<MutexGuard<'_, JsonState>, StoreError> {
        let mut state = self.lock();
        match persist::modified_time(&state.path)? {
            None => {
                // Removed behind our back: behave as an empty store
                state.cache.clear();
                state.loaded_at = None;
            }
            Some(current) if state.loaded_at.map_or(true, |loaded| current > loaded) => {
                let bytes = std::fs::read(&state.path)?;
                state.cache = serde_json::from_slice(&bytes)?;
                state.loaded_at = Some(current);
                tracing::debug!(
                    path = %state.path.display(),
                    items = state.cache.len(),
                    "Loaded item storage"
                );
            }
            Some(_) => {}
        }
        Ok(state)
    }

    fn lock(&self) -> MutexGuard<'_, JsonState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Writes `items` and points `state` at the file that was written.
fn save(state: &mut JsonState, items: &[FeedItem]) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(items)?;
    let written = persist::save_with_fallback(&state.path, &content)?;
    state.loaded_at = persist::modified_time(&written)?;
    state.path = written;
    Ok(())
}

impl ItemStore for JsonItemStore {
    fn get_stored(&self) -> Result<Vec<FeedItem>, StoreError> {
        Ok(self.refreshed()?.cache.clone())
    }

    fn store_many(&self, items: Vec<FeedItem>) -> Result<usize, StoreError> {
        let added = self.mutate(|cache| merge(cache, items))?;
        tracing::debug!(added, "Stored feed items");
        Ok(added)
    }

    fn update_one(&self, item: FeedItem) -> Result<(), StoreError> {
        self.mutate(|cache| upsert(cache, item))
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Item store kept entirely in memory. Nothing is persisted.
#[derive(Default)]
pub struct MemoryItemStore {
    items: Mutex<Vec<FeedItem>>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<FeedItem>) -> Self {
        let store = Self::new();
        merge(&mut store.lock(), items);
        store
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FeedItem>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ItemStore for MemoryItemStore {
    fn get_stored(&self) -> Result<Vec<FeedItem>, StoreError> {
        Ok(self.lock().clone())
    }

    fn store_many(&self, items: Vec<FeedItem>) -> Result<usize, StoreError> {
        Ok(merge(&mut self.lock(), items))
    }

    fn update_one(&self, item: FeedItem) -> Result<(), StoreError> {
        upsert(&mut self.lock(), item);
        Ok(())
    }
}
