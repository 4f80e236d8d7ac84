//! Wire protocol: message model and the pack/unpack codec.
//!
//! All integers are little-endian. Every message starts with the common
//! prelude `size[4] type[2] tag[2]` where `size` includes the prelude
//! itself. Strings are framed as `len[2] bytes[len]`, blobs as
//! `len[4] bytes[len]` with `len = 0xFFFFFFFF` denoting a nil blob.
//!
//! Request types are odd, responses even, and `response = request + 1`;
//! `Rerror` answers any failed request.

pub mod codec;
pub mod types;

pub use types::{Message, NOTAG};
