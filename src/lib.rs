pub mod config;
pub mod dedup;
pub mod error;
pub mod fetcher;
pub mod ingestor;
pub mod parser;
pub mod store;
pub mod traits;
pub mod types;

pub use config::{FetchConfig, IngestConfig};
pub use error::{FailureKind, FetchError, IngestError, ParseError, PersistenceError, Result};
pub use fetcher::HttpFetcher;
pub use ingestor::Ingestor;
pub use store::PgStore;
pub use traits::{FeedRegistry, FetchDocument, ItemStore};
pub use types::*;
