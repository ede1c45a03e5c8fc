//! Link-time partial arrays.
//!
//! Independently compiled modules each contribute a fragment of elements to a
//! named array; the linker concatenates the fragments into one contiguous block
//! and the program recovers the element count at run time from the block's
//! boundary symbols.
//!
//! The crate is organized into several modules:
//! - `runtime`, `macros`: the consumer-facing `PartialArray` handle and the
//!   `partial_array!` / `fragment!` declaration macros.
//! - `descriptor`: records describing each contribution to the linker.
//! - `merge`: group resolution shared by the linker and the manifest path.
//! - `linker`, `layout`, `symbol`, `writer`, `arch`: the `partlink` linker.
//! - `manifest`, `codegen`: the `partgen` generator for targets without
//!   section merging.
//! - `config`: CLI configuration.

pub mod arch;
pub mod codegen;
pub mod config;
pub mod descriptor;
pub mod layout;
pub mod linker;
mod macros;
pub mod manifest;
pub mod merge;
pub mod runtime;
pub mod symbol;
pub mod writer;

pub use descriptor::GroupDescriptor;
pub use merge::{BoundaryMetadata, MergeError};
pub use runtime::{element_count, partial_array_size, PartialArray};
