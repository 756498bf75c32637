//! # depot-core
//!
//! Shared library for the b2depot fleet: the container codec, slice algebra,
//! publisher-root capabilities, change watching, and the protocol types the
//! broker, publisher, and subscriber services exchange.

/// Error taxonomy shared by every service
pub mod error;

/// Wire-level protocol types
pub mod models;

/// Root-relative path validation
pub mod relpath;

/// Chunked container codec (`.b2nd` / `.b2frame` files)
pub mod container;

/// Slice parsing, chunk resolution, and N-dimensional gather/scatter
pub mod slicing;

/// Publisher root capability trait and the directory backend
pub mod pubroot;

/// Debounced recursive filesystem watching
pub mod watch;

/// Service configuration: defaults, TOML file model, CLI arguments
pub mod config;

/// HTTP client helpers: cookie forwarding, retries, SSE consumption
pub mod client;

pub use error::{DepotError, Result};
pub use models::{BusEvent, ChangeBatch, DatasetKind, DatasetMeta, RootEntry};
pub use pubroot::{DirectoryRoot, PubRoot};
