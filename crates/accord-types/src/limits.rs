//! Fixed system constants.
//!
//! These values are part of the wire format: changing any of them changes
//! which cells are embedded and therefore which hashes peers compute.

/// Largest encoding (in bytes) that is inlined into a parent instead of being
/// referenced by hash. A cell whose encoding is at most this long is embedded.
pub const MAX_EMBEDDED_LENGTH: usize = 140;

/// Size of a full blob chunk. Blobs longer than this are split into chunks.
pub const CHUNK_LENGTH: usize = 4096;

/// Maximum number of chunks in a single chunked blob.
pub const MAX_BLOB_CHILDREN: usize = 1024;

/// Maximum size of a single message's data (all cells it carries).
pub const MAX_MESSAGE_LENGTH: usize = 20_000_000;
