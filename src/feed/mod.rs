//! Feed formats and retrieval.
//!
//! - [`opml`] - reading and writing the OPML feed document
//! - [`parser`] - RSS/Atom parsing on top of `feed-rs`
//! - [`fetcher`] - conditional HTTP fetching with cached validators

mod fetcher;
mod opml;
mod parser;

pub use fetcher::{FeedFetcher, FetchError, FetchOutcome, FetchedFeed, HttpFetcher};
pub use opml::{
    category_from_stored, category_to_stored, OpmlDocument, OpmlError, Outline, MAX_OPML_DEPTH,
};
pub use parser::{parse_feed, ParsedEntry, ParsedFeed};
