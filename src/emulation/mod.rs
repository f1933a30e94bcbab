//! Stub emulation.
//!
//! Generated stubs are plain instruction lists; this module executes them so their behavior can
//! be observed without a CLR. A [`StubRuntime`] holds everything a stub touches: the managed
//! heap (strings, arrays, string builders, handles, delegates, class instances), a simulated
//! native heap ([`UnmanagedMemory`]) and the implementations of every
//! [`RuntimeHelper`](crate::interop::RuntimeHelper). A [`StubInterpreter`] runs one linked
//! [`StubBody`](crate::assembly::StubBody) against a runtime and hands the wrapped call to a
//! closure standing in for the native function (or, for reverse stubs, the managed target).
//!
//! # Key Components
//!
//! - [`StubInterpreter`] - fetch/dispatch loop over a linked stub
//! - [`StubRuntime`] - heaps, frames, pinning and helper implementations
//! - [`StubValue`] - values on the evaluation stack, in locals, fields and array elements
//! - [`HelperStats`] - allocation and free accounting used for leak checks
//! - [`EmulationLimits`] - instruction and memory ceilings
//!
//! # Pinning
//!
//! Converting a managed pointer or a string/array reference to a native integer (`conv.i`) pins
//! the target: its contents are mirrored into native memory and the mirror's address is pushed.
//! Mirrors are refreshed before and written back after the wrapped call, and freed when the stub
//! returns. Mirrors do not count as allocations in [`HelperStats`].
//!
//! # Examples
//!
//! ```rust
//! use dotmarshal::prelude::*;
//! use dotmarshal::emulation::{StubInterpreter, StubRuntime, StubValue};
//!
//! // void fill(int[] values)
//! let builder = PInvokeStubBuilder::new(&DefaultHelperResolver)?;
//! let method = PInvokeMethod::new("fill", MarshalType::Void).parameter(
//!     PInvokeParameter::new(MarshalType::sz_array(MarshalType::I4)).in_out(),
//! );
//! let stub = builder.build(&method)?;
//!
//! let mut runtime = StubRuntime::new();
//! let values = runtime.new_array(MarshalType::I4, vec![StubValue::I4(0); 3]);
//!
//! StubInterpreter::new(&stub).run(&mut runtime, vec![values.clone()], |rt, args| {
//!     let base = args[0].as_i64("fill")?;
//!     for index in 0..3 {
//!         rt.write_native(base + index * 4, &MarshalType::I4, &StubValue::I4(7))?;
//!     }
//!     Ok(None)
//! })?;
//!
//! let items = runtime.array_items(&values)?.unwrap_or_default();
//! assert_eq!(items, vec![StubValue::I4(7); 3]);
//! assert!(runtime.stats().is_balanced());
//! # Ok::<(), dotmarshal::Error>(())
//! ```

mod config;
pub mod encoding;
mod error;
mod interpreter;
mod memory;
mod runtime;
mod value;

pub use config::EmulationLimits;
pub use error::EmulationError;
pub use interpreter::StubInterpreter;
pub use memory::{HeapObject, ManagedHeap, UnmanagedMemory, UnmanagedRef};
pub use runtime::{HelperStats, StubRuntime, OFFSET_TO_STRING_DATA};
pub use value::{handle_ref_layout, HeapRef, ManagedPtr, StructValue, StubValue};
