use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::feed::OpmlError;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by the feed registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The url is in neither the active nor the disabled partition.
    #[error("'{0}' was not found!")]
    FeedNotFound(String),

    /// `add` was called with a url that is already active.
    #[error("'{0}' already exists!")]
    DuplicateFeed(String),

    /// The feed url is not an absolute http(s) url.
    #[error("Invalid feed URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The OPML document could not be parsed or rendered.
    #[error("Feed document error: {0}")]
    Document(#[from] OpmlError),

    /// Reading the document failed, or both the primary and fallback writes failed.
    #[error("Feed document I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by item storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Item storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Item storage is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Data Structures
// ============================================================================

/// A subscribed feed, identified by its `url`.
///
/// `title`, `html_url` and `category` are user metadata changed through
/// [`FeedRegistry::update`](crate::storage::FeedRegistry::update). The
/// conditional fetch tokens and `last_read` only change after a successful
/// fetch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Feed {
    pub url: String,
    pub title: String,
    pub html_url: String,
    /// Category without the leading `/` used in the stored document.
    pub category: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_read: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

impl Feed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_html_url(mut self, html_url: impl Into<String>) -> Self {
        self.html_url = html_url.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

/// A single entry seen in a feed.
///
/// Identity is `id`. Items are serialized in camelCase to keep the storage
/// file readable by other tools working on the same data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
    pub feed_url: String,
    #[serde(default)]
    pub read: bool,
    pub created: DateTime<Utc>,
}

impl FeedItem {
    /// Overwrite this item with a newer observation of the same identity.
    ///
    /// Copies every field except `id`, including `read`. Reconciliation never
    /// calls this; it is the explicit path used by
    /// [`ItemStore::update_one`](crate::storage::ItemStore::update_one).
    pub fn update(&mut self, other: &FeedItem) {
        self.title = other.title.clone();
        self.summary = other.summary.clone();
        self.link = other.link.clone();
        self.published = other.published;
        self.feed_url = other.feed_url.clone();
        self.read = other.read;
        self.created = other.created;
    }
}
