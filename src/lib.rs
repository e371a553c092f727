// Website document model and split/merge codec
pub mod document;

// Session-scoped token storage
pub mod session;

// Connector traits and shared connector types
pub mod connector;

// Publish job model and job board
pub mod job;

// Re-export the types connectors and callers touch most
pub use connector::{
    Connector, HostingConnector, RemoteUser, StorageConnector, WebsiteId, WebsiteMeta,
};
pub use document::{AssetFile, FileContent, WebsiteDocument};
pub use job::{JobBoard, JobHandle, JobStatus, PublishJob, PublishResult};
pub use session::{Session, SessionRegistry, TokenSet};
