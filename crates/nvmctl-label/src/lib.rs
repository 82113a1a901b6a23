//! The per-dimm namespace label store.
//!
//! A dimm's config area holds two namespace index blocks followed by an
//! array of label slots. Nothing is ever updated in place: a new index
//! generation is written to the non-current block and becomes current by
//! virtue of its sequence number. This crate implements the on-media
//! formats and the pure (buffer-backed) store engine; issuing the actual
//! config-area transfers is the caller's business.

pub mod store;
pub mod structures;

pub use store::{InitPlan, LabelArea, LabelVersion, Validated, WriteExtent};
pub use structures::index::RawIndexBlock;
pub use structures::label::{Label, RawLabel, RawLabelExt};

/// Errors produced while parsing or updating a label area.
#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    /// Neither index block validates at any known label size.
    #[error("label area is unformatted or corrupt")]
    Unformatted,

    /// The config area cannot host two index blocks plus at least one slot.
    #[error("config area of {0} bytes is too small to host labels")]
    AreaTooSmall(usize),

    /// A buffer shorter than the advertised config size was supplied.
    #[error("config snapshot truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// A slot index beyond `nslot`.
    #[error("slot {slot} out of range (nslot {nslot})")]
    SlotOutOfRange { slot: u32, nslot: u32 },
}
