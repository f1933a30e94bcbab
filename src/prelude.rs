//! # dotmarshal Prelude
//!
//! The types most callers need to describe a platform invoke, generate its stub and run it
//! under emulation.
//!
//! ```rust
//! use dotmarshal::prelude::*;
//!
//! let builder = PInvokeStubBuilder::new(&DefaultHelperResolver)?;
//! let stub = builder.build(&PInvokeMethod::new("GetTickCount", MarshalType::U4))?;
//! assert!(!builder.requires_stub(&PInvokeMethod::new("GetTickCount", MarshalType::U4)));
//! assert_eq!(stub.arg_count(), 0);
//! # Ok::<(), dotmarshal::Error>(())
//! ```

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotmarshal operations
pub use crate::Error;

/// The result type used throughout dotmarshal
pub use crate::Result;

// ================================================================================================
// Method Description
// ================================================================================================

/// Platform invoke declarations
pub use crate::interop::{MarshalDirection, PInvokeFlags, PInvokeMethod, PInvokeParameter};

/// Managed type descriptors
pub use crate::metadata::typesystem::{MarshalType, StructDesc};

/// `MarshalAs` directives
pub use crate::metadata::marshalling::{MarshalAsDescriptor, NativeType, NATIVE_TYPE};

/// Metadata token of a managed target
pub use crate::metadata::token::Token;

// ================================================================================================
// Stub Generation
// ================================================================================================

/// Stub builder and helper resolution
pub use crate::interop::{
    DefaultHelperResolver, HelperResolver, PInvokeStubBuilder, RuntimeHelper,
};

/// Classification and per-parameter marshallers
pub use crate::interop::{classify, Marshaller, MarshallerKind, MarshallerRole};

/// Generated code
pub use crate::assembly::{Instruction, Opcode, StubBody};

// ================================================================================================
// Emulation
// ================================================================================================

/// Stub execution
pub use crate::emulation::{EmulationLimits, StubInterpreter, StubRuntime, StubValue};
