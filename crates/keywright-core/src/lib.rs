pub mod context;
pub mod documents;
pub mod error;
mod fsio;
pub mod host_config;
pub mod lifecycle;
pub mod permissions;
pub mod registry;
pub mod repos;
pub mod snapshot;
pub mod state;
pub mod store;

pub use context::{ContextPaths, KeyContext};
pub use documents::{
    ConfigDocument, ExpirationRecord, ProviderConfig, RepoLink, UsageDocument, UsageRecord,
};
pub use error::CoreError;
pub use host_config::{HostConfig, HostEntry, HostUpdate};
pub use lifecycle::{Collaborators, Lifecycle, Outcome};
pub use permissions::PermissionGuard;
pub use registry::{KeyInfo, KeyRecord, KeyRegistry, StrengthVerdict};
pub use repos::{expand_repo_url, CloneRequest};
pub use snapshot::{Manifest, ManifestEntry, SnapshotReport};
pub use state::KeyState;
pub use store::{validate_repo_url, Store};
