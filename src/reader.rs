//! Reconciliation of fetched feeds against stored items.
//!
//! The [`Reconciler`] ties together the feed registry, a fetch client and an
//! item store. For every feed it fetches with the cached validators, merges
//! newly discovered entries into the store without touching existing ones, and
//! persists the refreshed validators back into the registry.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::feed::{FeedFetcher, FetchError, FetchOutcome, FetchedFeed, ParsedEntry};
use crate::storage::{Feed, FeedItem, FeedRegistry, ItemStore, RegistryError, StoreError};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Category '{0}' does not exist")]
    CategoryDoesNotExist(String),
    #[error("Item '{0}' was not found!")]
    ItemNotFound(String),
}

/// Produces the item list of one or more feeds.
///
/// Items already in the store keep their stored state (notably `read`);
/// only entries with unseen ids are added. Results list the stored items
/// of a feed first, followed by the newly discovered ones in feed order.
pub struct Reconciler<'a, F, S: ?Sized> {
    registry: &'a FeedRegistry,
    store: &'a S,
    fetcher: &'a F,
}

impl<'a, F, S> Reconciler<'a, F, S>
where
    F: FeedFetcher,
    S: ItemStore + ?Sized,
{
    pub fn new(registry: &'a FeedRegistry, store: &'a S, fetcher: &'a F) -> Self {
        Self {
            registry,
            store,
            fetcher,
        }
    }

    /// Fetches `feed` and returns its items.
    ///
    /// On `304 Not Modified` the stored items are returned and nothing is
    /// written. Otherwise new items are stored, then the feed's validators
    /// and `last_read` are replaced with the response's and recorded in the
    /// registry. If storing fails, `feed` and the registry are left as they
    /// were. Read items are dropped from the result unless `include_read`.
    pub async fn get_feed_items(
        &self,
        feed: &mut Feed,
        include_read: bool,
    ) -> Result<Vec<FeedItem>, ReaderError> {
        let stored = self.store.get_stored()?;
        let outcome = self.fetcher.fetch(feed).await?;

        let fetched = match outcome {
            FetchOutcome::NotModified => {
                tracing::debug!(url = %feed.url, "Feed not modified");
                let items = stored
                    .into_iter()
                    .filter(|item| item.feed_url == feed.url)
                    .collect();
                return Ok(filter_read(items, include_read));
            }
            FetchOutcome::Parsed(fetched) => fetched,
        };

        let FetchedFeed {
            etag,
            last_modified,
            feed: parsed,
        } = fetched;
        let now = Utc::now();

        let mut new_items: Vec<FeedItem> = Vec::new();
        for entry in parsed.entries {
            let known = stored.iter().any(|item| item.id == entry.id)
                || new_items.iter().any(|item| item.id == entry.id);
            if !known {
                new_items.push(entry_to_item(entry, &feed.url, now));
            }
        }

        // Validators are only recorded once the items are stored
        let added = self.store.store_many(new_items.clone())?;

        feed.etag = etag;
        feed.last_modified = last_modified;
        feed.last_read = Some(now);
        self.registry.record_fetch(feed)?;
        tracing::info!(url = %feed.url, new_items = added, "Feed refreshed");

        let items = stored
            .into_iter()
            .filter(|item| item.feed_url == feed.url)
            .chain(new_items)
            .collect();
        Ok(filter_read(items, include_read))
    }

    /// Items of every active feed, in registry order.
    ///
    /// The first feed that fails aborts the whole call; feeds processed
    /// before it keep whatever they persisted.
    pub async fn get_items(&self, include_read: bool) -> Result<Vec<FeedItem>, ReaderError> {
        let feeds = self.registry.list_active()?;
        self.collect(feeds, include_read).await
    }

    /// Items of the active feeds in `category`.
    ///
    /// # Errors
    ///
    /// [`ReaderError::CategoryDoesNotExist`] if no feed, active or disabled,
    /// carries the category.
    pub async fn get_category_items(
        &self,
        category: &str,
        include_read: bool,
    ) -> Result<Vec<FeedItem>, ReaderError> {
        if !self.registry.categories()?.iter().any(|c| c == category) {
            return Err(ReaderError::CategoryDoesNotExist(category.to_string()));
        }

        let feeds = self
            .registry
            .list_active()?
            .into_iter()
            .filter(|feed| feed.category == category)
            .collect();
        self.collect(feeds, include_read).await
    }

    /// Sets the read flag of a stored item.
    pub fn mark_read(&self, id: &str, read: bool) -> Result<FeedItem, ReaderError> {
        let mut item = self
            .store
            .get_stored()?
            .into_iter()
            .find(|item| item.id == id)
            .ok_or_else(|| ReaderError::ItemNotFound(id.to_string()))?;

        item.read = read;
        self.store.update_one(item.clone())?;
        Ok(item)
    }

    /// Fetches `url` without validators and describes it as a [`Feed`].
    ///
    /// The title and html url come from the channel; nothing is stored.
    pub async fn resolve_feed(&self, url: &str) -> Result<Feed, ReaderError> {
        let mut feed = Feed::new(url);
        if let FetchOutcome::Parsed(fetched) = self.fetcher.fetch(&feed).await? {
            feed.title = fetched.feed.title.unwrap_or_default();
            feed.html_url = fetched.feed.link.unwrap_or_default();
        }
        feed.created = Some(Utc::now());
        Ok(feed)
    }

    async fn collect(
        &self,
        feeds: Vec<Feed>,
        include_read: bool,
    ) -> Result<Vec<FeedItem>, ReaderError> {
        let mut items = Vec::new();
        for mut feed in feeds {
            items.extend(self.get_feed_items(&mut feed, include_read).await?);
        }
        Ok(items)
    }
}

fn entry_to_item(entry: ParsedEntry, feed_url: &str, created: DateTime<Utc>) -> FeedItem {
    FeedItem {
        id: entry.id,
        title: entry.title,
        summary: entry.summary,
        link: entry.link,
        published: entry.published,
        feed_url: feed_url.to_string(),
        read: false,
        created,
    }
}

fn filter_read(items: Vec<FeedItem>, include_read: bool) -> Vec<FeedItem> {
    items
        .into_iter()
        .filter(|item| include_read || !item.read)
        .collect()
}
