//! Utility functions shared across the crate.
//!
//! ```
//! use feedkeep::util::validate_feed_url;
//!
//! let url = validate_feed_url("https://example.com/feed.xml").unwrap();
//! assert_eq!(url.host_str(), Some("example.com"));
//! ```

mod url_validator;

pub use url_validator::{validate_feed_url, UrlValidationError};
