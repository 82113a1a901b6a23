pub mod index;
pub mod label;

/// Signature at the head of every namespace index block.
pub const INDEX_SIGNATURE: [u8; 16] = *b"NAMESPACE_INDEX\0";

/// Fixed index-block header length, before the free bitmap.
pub const INDEX_HEADER_SIZE: usize = 72;

/// Index blocks are sized in multiples of this.
pub const INDEX_ALIGN: usize = 256;

/// Smallest index block the format permits.
pub const INDEX_MIN_SIZE: usize = 512;

/// Label size for the v1.1 label layout.
pub const LABEL_SIZE_V1_1: usize = 128;

/// Label size for the v1.2 label layout.
pub const LABEL_SIZE_V1_2: usize = 256;

pub use nvmctl_common::alg::seq::{SEQ_MASK, best_seq, inc_seq};
