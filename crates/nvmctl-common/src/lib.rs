//! Common types and algorithms shared by the nvmctl crates.
//!
//! Everything that ends up on media goes through the little-endian wrapper
//! types in [`types::endian`]; the checksum and bitmap helpers live in
//! [`alg`].

pub mod alg;
pub mod size;
pub mod types;

pub use types::endian::{Le16, Le32, Le64};
pub use types::guid::Guid;
