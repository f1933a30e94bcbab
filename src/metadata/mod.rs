//! Interop-relevant .NET metadata.
//!
//! - [`marshalling`] - decoding of `[MarshalAs]` native type descriptors (ECMA-335 II.23.2.9)
//! - [`typesystem`] - the managed type descriptors the marshallers classify and lay out
//! - [`token`] - metadata tokens used to reference call targets and runtime helpers

pub mod marshalling;
pub mod token;
pub mod typesystem;
