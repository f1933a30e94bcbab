// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # dotmarshal
//!
//! P/Invoke marshalling stub generation for .NET CIL.
//!
//! `dotmarshal` decides how every parameter and return value of a platform invoke crosses the
//! managed/native boundary and emits the CIL that performs the transfer. It covers both call
//! directions (managed code calling native code, and native code calling back into managed code
//! through a reverse P/Invoke) and composes recursively for arrays of strings, arrays of structs
//! and structs with string fields.
//!
//! ## Architecture
//!
//! - [`metadata`] - `MarshalAs` descriptors (ECMA-335 II.23.2.9) and the [`MarshalType`] type
//!   descriptor consumed by the marshallers
//! - [`assembly`] - the instruction model, code streams, locals/labels and stub linking
//! - [`interop`] - kind classification, the [`Marshaller`] protocol, and the
//!   [`PInvokeStubBuilder`] that assembles whole stubs
//! - [`emulation`] - a small interpreter able to execute generated stubs against a simulated
//!   native heap, used to verify marshalling end to end
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dotmarshal::prelude::*;
//!
//! let builder = PInvokeStubBuilder::new(&DefaultHelperResolver)?;
//!
//! // int Sum([In, Out] int[] values, int count)
//! let method = PInvokeMethod::new("Sum", MarshalType::I4)
//!     .parameter(PInvokeParameter::new(MarshalType::sz_array(MarshalType::I4)).in_out())
//!     .parameter(PInvokeParameter::new(MarshalType::I4));
//!
//! let stub = builder.build(&method)?;
//! println!("{stub}");
//! # Ok::<(), dotmarshal::Error>(())
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`Result`]. Metadata and configuration problems (an
//! unsupported marshalling combination, an invalid `SizeParamIndex`) surface while the stub is
//! generated; data-dependent failures (an unmappable character under a throwing policy, an
//! overflowing allocation size) surface when a stub executes.

#[macro_use]
pub(crate) mod error;

pub mod assembly;
pub mod emulation;
pub mod file;
pub mod interop;
pub mod metadata;
pub mod prelude;

pub use error::Error;

/// The generic Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

pub use assembly::{Instruction, Opcode, Operand, StubBody};
pub use interop::{
    classify, DefaultHelperResolver, HelperResolver, MarshalDirection, Marshaller,
    MarshallerKind, MarshallerRole, PInvokeFlags, PInvokeMethod, PInvokeParameter,
    PInvokeStubBuilder, RuntimeHelper,
};
pub use metadata::{marshalling::MarshalAsDescriptor, typesystem::MarshalType};
