#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![doc = include_str!("../README.md")]

mod computation;
pub mod gc;
mod marked;
mod modifiable;
mod node;
mod readers;
mod scope;

pub use computation::{run, Computation};
pub use modifiable::{Mod, ModArray, ModPtr, ModRange};
pub use scope::{DynamicReads, ModTuple, ReaderToken, Scope};
