//! Feed registry and reader: an OPML-backed list of subscriptions, conditional
//! fetching, and a deduplicating item store that remembers what was read.

pub mod config;
pub mod feed;
pub mod reader;
pub mod storage;
pub mod util;
