#![forbid(unsafe_code)]
//! Umbrella crate for the Riffle block-store subsystem.

pub use riffle_error as error;
pub use riffle_memstore as memstore;
pub use riffle_types as types;
