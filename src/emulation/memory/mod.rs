//! Memory model of the stub interpreter.
//!
//! - [`ManagedHeap`] - reference-type objects the stub reads and creates
//! - [`UnmanagedMemory`] - native byte regions: `CoTaskMem` buffers and pinned mirrors

mod heap;
mod unmanaged;

pub use heap::{HeapObject, ManagedHeap};
pub use unmanaged::{UnmanagedMemory, UnmanagedRef};
