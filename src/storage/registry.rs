//! The feed registry: the durable list of subscribed feeds.
//!
//! Feeds live in a single OPML document. Each feed is either active or
//! disabled (`isComment="true"`), never both, and is identified by its url.
//! Every mutating operation runs against a copy of the document and saves it
//! before the copy replaces the in-memory state, so a failed mutation never
//! persists partial changes.
//!
//! Reads re-check the file modification time and reload the document when
//! another process has rewritten it. This is a best-effort single-writer
//! cache: two processes writing at once race, and the last writer wins.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use super::persist;
use super::types::{Feed, RegistryError};
use crate::feed::{category_from_stored, category_to_stored, OpmlDocument, Outline};
use crate::util::validate_feed_url;

/// Title given to a freshly created feed document.
const DEFAULT_DOCUMENT_TITLE: &str = "RSS Feeds";

struct RegistryState {
    path: PathBuf,
    document: OpmlDocument,
    /// Modification time of the file when it was last loaded or saved.
    loaded_at: Option<SystemTime>,
}

/// OPML-backed feed registry.
pub struct FeedRegistry {
    state: Mutex<RegistryState>,
}

impl FeedRegistry {
    /// Opens the registry stored at `path`.
    ///
    /// A missing file yields an empty registry; the file is created on the
    /// first mutation.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let (document, loaded_at) = match persist::modified_time(&path)? {
            Some(mtime) => (OpmlDocument::read_file(&path)?, Some(mtime)),
            None => {
                tracing::debug!(path = %path.display(), "No feed document found, starting empty");
                let now = Utc::now().to_rfc2822();
                (OpmlDocument::empty(DEFAULT_DOCUMENT_TITLE, &now), None)
            }
        };
        tracing::debug!(
            path = %path.display(),
            feeds = document.outlines.len(),
            "Opened feed registry"
        );

        Ok(Self {
            state: Mutex::new(RegistryState {
                path,
                document,
                loaded_at,
            }),
        })
    }

    /// Path of the document currently backing the registry.
    ///
    /// Differs from the path given to [`open`](Self::open) after a save had
    /// to fall back to the temp directory.
    pub fn path(&self) -> PathBuf {
        self.lock().path.clone()
    }

    /// Active feeds in document order.
    pub fn list_active(&self) -> Result<Vec<Feed>, RegistryError> {
        self.list(false)
    }

    /// Disabled feeds in document order.
    pub fn list_disabled(&self) -> Result<Vec<Feed>, RegistryError> {
        self.list(true)
    }

    /// Looks up a feed in either partition.
    pub fn get(&self, url: &str) -> Result<Feed, RegistryError> {
        let state = self.refreshed()?;
        state
            .document
            .outlines
            .iter()
            .find(|o| o.xml_url == url)
            .map(outline_to_feed)
            .ok_or_else(|| RegistryError::FeedNotFound(url.to_string()))
    }

    pub fn exists_active(&self, url: &str) -> Result<bool, RegistryError> {
        self.exists(url, false)
    }

    pub fn exists_disabled(&self, url: &str) -> Result<bool, RegistryError> {
        self.exists(url, true)
    }

    /// Distinct non-empty categories across both partitions, in document order.
    pub fn categories(&self) -> Result<Vec<String>, RegistryError> {
        let state = self.refreshed()?;
        let mut categories: Vec<String> = Vec::new();
        for outline in &state.document.outlines {
            let category = category_from_stored(&outline.category);
            if !category.is_empty() && !categories.contains(&category) {
                categories.push(category);
            }
        }
        Ok(categories)
    }

    /// Adds a feed to the active partition.
    ///
    /// Re-adding a disabled feed re-enables it and applies the incoming
    /// title, category and html url instead of failing.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateFeed`] if the url is already active
    /// - [`RegistryError::InvalidUrl`] if the url is not an absolute http(s) url
    pub fn add(&self, feed: &Feed) -> Result<(), RegistryError> {
        validate_feed_url(&feed.url).map_err(|e| RegistryError::InvalidUrl {
            url: feed.url.clone(),
            reason: e.to_string(),
        })?;

        self.mutate(|doc| {
            match doc.outlines.iter_mut().find(|o| o.xml_url == feed.url) {
                Some(existing) if !existing.disabled => {
                    Err(RegistryError::DuplicateFeed(feed.url.clone()))
                }
                Some(existing) => {
                    tracing::info!(feed = %feed.url, "Re-enabling previously disabled feed");
                    apply_metadata(existing, feed);
                    existing.disabled = false;
                    Ok(())
                }
                None => {
                    let mut outline = feed_to_outline(feed, false);
                    if outline.created.is_none() {
                        outline.created = Some(Utc::now().to_rfc3339());
                    }
                    tracing::info!(feed = %feed.url, "Added feed");
                    doc.outlines.push(outline);
                    Ok(())
                }
            }
        })
    }

    /// Overwrites the title, category and html url of an existing feed.
    ///
    /// Fetch tokens, timestamps and partition membership are preserved.
    pub fn update(&self, feed: &Feed) -> Result<(), RegistryError> {
        self.mutate(|doc| {
            let outline = find_mut(doc, &feed.url)?;
            apply_metadata(outline, feed);
            Ok(())
        })
    }

    /// Moves a feed to the active partition. No-op (still saved) if already active.
    pub fn enable(&self, url: &str) -> Result<(), RegistryError> {
        self.set_disabled(url, false)
    }

    /// Moves a feed to the disabled partition. No-op (still saved) if already disabled.
    pub fn disable(&self, url: &str) -> Result<(), RegistryError> {
        self.set_disabled(url, true)
    }

    /// Persists the conditional fetch tokens and last read time of `feed`.
    pub fn record_fetch(&self, feed: &Feed) -> Result<(), RegistryError> {
        self.mutate(|doc| {
            let outline = find_mut(doc, &feed.url)?;
            outline.etag = feed.etag.clone();
            outline.last_modified = feed.last_modified.clone();
            outline.last_read = feed.last_read.map(|t| t.to_rfc3339());
            Ok(())
        })
    }

    /// Imports every feed of an external OPML file.
    ///
    /// Feeds already active are left untouched, disabled ones are re-enabled
    /// with the imported metadata, and outlines with unusable urls are skipped.
    /// Returns the number of feeds added or re-enabled.
    pub fn import_opml(&self, path: &Path) -> Result<usize, RegistryError> {
        let imported = OpmlDocument::read_file(path)?;
        let mut added = 0;

        for outline in &imported.outlines {
            let feed = outline_to_feed(outline);
            match self.add(&feed) {
                Ok(()) => added += 1,
                Err(RegistryError::DuplicateFeed(_)) => {
                    tracing::debug!(feed = %feed.url, "Feed already active, skipping");
                }
                Err(RegistryError::InvalidUrl { url, reason }) => {
                    tracing::warn!(url = %url, error = %reason, "Skipping invalid feed URL");
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(path = %path.display(), added, "Imported OPML");
        Ok(added)
    }

    /// Writes the whole document (both partitions) to `path`.
    pub fn export_opml(&self, path: &Path) -> Result<(), RegistryError> {
        let state = self.refreshed()?;
        let content = state.document.render()?;
        persist::write_atomic(path, content.as_bytes())?;
        Ok(())
    }

    fn list(&self, disabled: bool) -> Result<Vec<Feed>, RegistryError> {
        let state = self.refreshed()?;
        Ok(state
            .document
            .outlines
            .iter()
            .filter(|o| o.disabled == disabled)
            .map(outline_to_feed)
            .collect())
    }

    fn exists(&self, url: &str, disabled: bool) -> Result<bool, RegistryError> {
        let state = self.refreshed()?;
        Ok(state
            .document
            .outlines
            .iter()
            .any(|o| o.xml_url == url && o.disabled == disabled))
    }

    fn set_disabled(&self, url: &str, disabled: bool) -> Result<(), RegistryError> {
        self.mutate(|doc| {
            let outline = find_mut(doc, url)?;
            if outline.disabled != disabled {
                tracing::info!(feed = %url, disabled, "Changed feed state");
            }
            outline.disabled = disabled;
            Ok(())
        })
    }

    /// Applies `change` to a copy of the document and saves it on success.
    ///
    /// The in-memory document is only replaced once the save went through,
    /// so an error from `change` (or from saving) leaves the registry as it was.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut OpmlDocument) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut state = self.refreshed()?;
        let mut document = state.document.clone();
        let result = change(&mut document)?;

        document.date_modified = Utc::now().to_rfc2822();
        let content = document.render()?;
        let written = persist::save_with_fallback(&state.path, content.as_bytes())?;

        state.loaded_at = persist::modified_time(&written)?;
        state.path = written;
        state.document = document;
        Ok(result)
    }

    /// Locks the state, reloading the document first if the file changed on disk.
    fn refreshed(&self) -> Result<MutexGuard<'_, RegistryState>, RegistryError> {
        let mut state = self.lock();
        let current = persist::modified_time(&state.path)?;
        let stale = match (current, state.loaded_at) {
            (Some(current), Some(loaded)) => current > loaded,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if stale {
            tracing::debug!(path = %state.path.display(), "Feed document changed on disk, reloading");
            state.document = OpmlDocument::read_file(&state.path)?;
            state.loaded_at = current;
        }
        Ok(state)
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn find_mut<'a>(doc: &'a mut OpmlDocument, url: &str) -> Result<&'a mut Outline, RegistryError> {
    doc.outlines
        .iter_mut()
        .find(|o| o.xml_url == url)
        .ok_or_else(|| RegistryError::FeedNotFound(url.to_string()))
}

fn apply_metadata(outline: &mut Outline, feed: &Feed) {
    outline.title = feed.title.clone();
    outline.html_url = feed.html_url.clone();
    outline.category = category_to_stored(&feed.category);
}

fn feed_to_outline(feed: &Feed, disabled: bool) -> Outline {
    Outline {
        title: feed.title.clone(),
        xml_url: feed.url.clone(),
        html_url: feed.html_url.clone(),
        category: category_to_stored(&feed.category),
        disabled,
        etag: feed.etag.clone(),
        last_modified: feed.last_modified.clone(),
        last_read: feed.last_read.map(|t| t.to_rfc3339()),
        created: feed.created.map(|t| t.to_rfc3339()),
    }
}

fn outline_to_feed(outline: &Outline) -> Feed {
    Feed {
        url: outline.xml_url.clone(),
        title: outline.title.clone(),
        html_url: outline.html_url.clone(),
        category: category_from_stored(&outline.category),
        etag: outline.etag.clone(),
        last_modified: outline.last_modified.clone(),
        last_read: outline.last_read.as_deref().and_then(parse_timestamp),
        created: outline.created.as_deref().and_then(parse_timestamp),
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value).or_else(|_| DateTime::parse_from_rfc2822(value)) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(value = %value, error = %e, "Ignoring unparseable timestamp in feed document");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::persist::test_support::scratch_dir;
    use pretty_assertions::assert_eq;

    fn open_in(dir: &Path) -> FeedRegistry {
        FeedRegistry::open(dir.join("feeds.opml")).unwrap()
    }

    fn news_feed() -> Feed {
        Feed::new("https://a.test/feed")
            .with_title("A")
            .with_category("news")
            .with_html_url("https://a.test")
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = scratch_dir("registry_empty");
        let registry = open_in(&dir);
        assert!(registry.list_active().unwrap().is_empty());
        assert!(registry.list_disabled().unwrap().is_empty());
        // Nothing written until the first mutation
        assert!(!dir.join("feeds.opml").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_add_and_get() {
        let dir = scratch_dir("registry_add");
        let registry = open_in(&dir);
        registry.add(&news_feed()).unwrap();

        let feed = registry.get("https://a.test/feed").unwrap();
        assert_eq!(feed.title, "A");
        assert_eq!(feed.category, "news");
        assert!(feed.created.is_some());
        assert!(registry.exists_active("https://a.test/feed").unwrap());
        assert!(!registry.exists_disabled("https://a.test/feed").unwrap());

        let stored = std::fs::read_to_string(dir.join("feeds.opml")).unwrap();
        assert!(stored.contains("category=\"/news\""));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_add_duplicate_active_fails() {
        let dir = scratch_dir("registry_dup");
        let registry = open_in(&dir);
        registry.add(&news_feed()).unwrap();

        let err = registry.add(&news_feed().with_title("Other")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateFeed(ref url) if url == "https://a.test/feed"));
        assert_eq!(registry.get("https://a.test/feed").unwrap().title, "A");
        assert_eq!(registry.list_active().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_add_invalid_url_rejected() {
        let dir = scratch_dir("registry_invalid");
        let registry = open_in(&dir);
        let err = registry.add(&Feed::new("ftp://a.test/feed")).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidUrl { .. }));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_disable_then_readd_reactivates_with_new_metadata() {
        let dir = scratch_dir("registry_readd");
        let registry = open_in(&dir);
        registry.add(&news_feed()).unwrap();

        registry.disable("https://a.test/feed").unwrap();
        assert!(!registry.exists_active("https://a.test/feed").unwrap());
        assert_eq!(registry.list_disabled().unwrap().len(), 1);

        registry
            .add(&Feed::new("https://a.test/feed").with_category("tech"))
            .unwrap();

        let active = registry.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].category, "tech");
        assert!(registry.list_disabled().unwrap().is_empty());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_disable_enable_round_trip_preserves_feed() {
        let dir = scratch_dir("registry_roundtrip");
        let registry = open_in(&dir);
        registry.add(&news_feed()).unwrap();
        let mut fetched = registry.get("https://a.test/feed").unwrap();
        fetched.etag = Some("\"v1\"".to_string());
        fetched.last_modified = Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string());
        fetched.last_read = Some(Utc::now());
        registry.record_fetch(&fetched).unwrap();
        let before = registry.get("https://a.test/feed").unwrap();

        registry.disable("https://a.test/feed").unwrap();
        registry.enable("https://a.test/feed").unwrap();

        assert_eq!(registry.get("https://a.test/feed").unwrap(), before);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_enable_disable_idempotent() {
        let dir = scratch_dir("registry_idempotent");
        let registry = open_in(&dir);
        registry.add(&news_feed()).unwrap();

        registry.disable("https://a.test/feed").unwrap();
        registry.disable("https://a.test/feed").unwrap();
        assert_eq!(registry.list_disabled().unwrap().len(), 1);

        registry.enable("https://a.test/feed").unwrap();
        registry.enable("https://a.test/feed").unwrap();
        assert_eq!(registry.list_active().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_url_not_found() {
        let dir = scratch_dir("registry_notfound");
        let registry = open_in(&dir);
        let missing = "https://missing.test/feed";

        assert!(matches!(registry.get(missing), Err(RegistryError::FeedNotFound(_))));
        assert!(matches!(registry.enable(missing), Err(RegistryError::FeedNotFound(_))));
        assert!(matches!(registry.disable(missing), Err(RegistryError::FeedNotFound(_))));
        assert!(matches!(
            registry.update(&Feed::new(missing)),
            Err(RegistryError::FeedNotFound(_))
        ));
        // Failed mutations never create the document
        assert!(!dir.join("feeds.opml").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_update_preserves_fetch_state_and_partition() {
        let dir = scratch_dir("registry_update");
        let registry = open_in(&dir);
        registry.add(&news_feed()).unwrap();
        let mut fetched = registry.get("https://a.test/feed").unwrap();
        fetched.etag = Some("\"v1\"".to_string());
        registry.record_fetch(&fetched).unwrap();
        registry.disable("https://a.test/feed").unwrap();

        let mut changed = news_feed().with_title("Renamed").with_category("tech");
        changed.etag = Some("ignored".to_string());
        registry.update(&changed).unwrap();

        let feed = registry.get("https://a.test/feed").unwrap();
        assert_eq!(feed.title, "Renamed");
        assert_eq!(feed.category, "tech");
        assert_eq!(feed.etag.as_deref(), Some("\"v1\""));
        assert!(registry.exists_disabled("https://a.test/feed").unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_reopen_reads_persisted_state() {
        let dir = scratch_dir("registry_reopen");
        {
            let registry = open_in(&dir);
            registry.add(&news_feed()).unwrap();
            registry
                .add(&Feed::new("https://b.test/rss").with_title("B"))
                .unwrap();
            registry.disable("https://b.test/rss").unwrap();
        }

        let registry = open_in(&dir);
        let active: Vec<String> = registry.list_active().unwrap().into_iter().map(|f| f.url).collect();
        assert_eq!(active, vec!["https://a.test/feed".to_string()]);
        assert!(registry.exists_disabled("https://b.test/rss").unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_external_change_is_reloaded() {
        let dir = scratch_dir("registry_external");
        let path = dir.join("feeds.opml");
        let registry = FeedRegistry::open(&path).unwrap();
        registry.add(&news_feed()).unwrap();

        // Another process adds a feed behind our back
        let other = FeedRegistry::open(&path).unwrap();
        other.add(&Feed::new("https://b.test/rss")).unwrap();
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert!(registry.exists_active("https://b.test/rss").unwrap());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_categories_distinct_in_order() {
        let dir = scratch_dir("registry_categories");
        let registry = open_in(&dir);
        registry.add(&news_feed()).unwrap();
        registry
            .add(&Feed::new("https://b.test/rss").with_category("tech"))
            .unwrap();
        registry
            .add(&Feed::new("https://c.test/rss").with_category("news"))
            .unwrap();
        registry.add(&Feed::new("https://d.test/rss")).unwrap();
        registry.disable("https://b.test/rss").unwrap();

        assert_eq!(registry.categories().unwrap(), vec!["news", "tech"]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_import_and_export_opml() {
        let dir = scratch_dir("registry_import");
        let import_path = dir.join("import.opml");
        std::fs::write(
            &import_path,
            r#"<?xml version="1.0"?>
<opml version="2.0"><body>
    <outline text="Tech">
        <outline type="rss" text="B" xmlUrl="https://b.test/rss"/>
    </outline>
    <outline type="rss" text="A again" xmlUrl="https://a.test/feed"/>
    <outline type="rss" text="Bad" xmlUrl="file:///etc/passwd"/>
</body></opml>"#,
        )
        .unwrap();

        let registry = open_in(&dir);
        registry.add(&news_feed()).unwrap();
        let added = registry.import_opml(&import_path).unwrap();

        assert_eq!(added, 1);
        let b = registry.get("https://b.test/rss").unwrap();
        assert_eq!(b.category, "Tech");
        assert_eq!(registry.get("https://a.test/feed").unwrap().title, "A");

        let export_path = dir.join("export.opml");
        registry.export_opml(&export_path).unwrap();
        let exported = OpmlDocument::read_file(&export_path).unwrap();
        assert_eq!(exported.outlines.len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }
}
