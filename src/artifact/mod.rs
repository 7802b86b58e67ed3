//! Artifact store: versioned task outputs with capability-based read access.

pub mod blob;
pub mod store;

pub use blob::{content_ref, BlobStore, FsBlobStore, MemoryBlobStore};
pub use store::{
    Artifact, ArtifactContent, ArtifactDraft, ArtifactFilter, ArtifactRef, ArtifactStore, Requester,
};
