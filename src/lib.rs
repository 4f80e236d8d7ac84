//! Hop: a distributed, versioned key-value store.
//!
//! Every entry carries a monotonically increasing version, and readers may
//! block until a requested version exists. One small operation interface
//! (create, remove, get, set, test-and-set and a family of atomic
//! read-modify-write operations) is implemented by several layers that
//! compose by delegation.
//!
//! ## Architecture Modules
//!
//! - **`ops`**: the six-operation [`ops::Hop`] trait and version sentinels
//!   shared by every layer.
//! - **`store`**: the in-memory leaf, a versioned map with waiters,
//!   placeholders and local `#/...` meta entries.
//! - **`wire`** / **`transport`**: the length-prefixed binary protocol and
//!   the pluggable stream transports carrying it.
//! - **`client`** / **`server`**: the RPC stubs: a tag-multiplexing
//!   client and a per-request-task server.
//! - **`mux`**: longest-prefix dispatch of keys to different sub-stores.
//! - **`range`**: the master-administered static-range router over a
//!   32-bit hash space.
//! - **`chord`**: the Chord ring over a 64-bit hash space with strong
//!   stabilization.
//! - **`cache`**: a write-through LRU layer, distributable via the range
//!   router.

pub mod cache;
pub mod chord;
pub mod client;
pub mod error;
pub mod mux;
pub mod ops;
pub mod range;
pub mod server;
pub mod store;
pub mod transport;
pub mod wire;

pub use error::{Error, Result};
pub use ops::{version, Hop};
