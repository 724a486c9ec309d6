pub mod messages;
pub mod repository;

pub use messages::{CrawlResult, DiscoveryMessage, EmbedRequest, SimilarityEntry};
pub use repository::{License, Owner, Repository, RepositoryData, RepositoryStat};
