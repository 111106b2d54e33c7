//! Demand-paged virtual memory for user processes: supplemental page tables,
//! a global frame table with clock eviction, swap, and memory-mapped files.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod block;
mod clock;
pub mod error;
pub mod fault;
pub mod frame;
pub mod fs;
pub mod mmap;
pub mod page;
pub mod pagedir;
pub mod palloc;
pub mod space;
pub mod swap;
pub mod sync;
pub mod user;
mod vm;

#[cfg(test)]
mod tests;

pub use error::{IoError, Result, VmError};
pub use fault::FaultOutcome;
pub use mmap::MapId;
pub use space::AddressSpace;
pub use vm::Vm;
