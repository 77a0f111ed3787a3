//! GitHub records and the cached client the dashboard reads and writes through.

mod cached_client;
mod types;

pub use cached_client::CachedGithubClient;
pub use types::{Account, ContentEntry, PullBranch, PullRequest, RepoRef, Repository, UserProfile};
