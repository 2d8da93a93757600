/*!
 * Chunked, resumable upload subsystem
 *
 * - `state`: persisted session record and chunk bookkeeping
 * - `store`: one JSON document per session on disk
 * - `checksum`: SHA-256 helpers
 * - `sink`: the destination abstraction chunks are delivered through
 * - `staging`: local part-file sink plus final reassembly
 * - `orchestrator`: planning, the worker pool, resume and cleanup
 * - `progress`: progress callbacks and derived progress snapshots
 */

pub mod checksum;
pub mod orchestrator;
pub mod progress;
pub mod sink;
pub mod staging;
pub mod state;
pub mod store;

pub use orchestrator::{ChunkedUploader, UploadOptions};
pub use progress::{ProgressCallback, ProgressUpdate, UploadProgress};
pub use sink::{ChunkSink, FnSink, SinkError};
pub use staging::StagingSink;
pub use state::{ChunkInfo, SessionHeader, UploadState};
pub use store::StateStore;
