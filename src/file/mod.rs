//! Binary blob access.
//!
//! `MarshalAs` descriptors reach this crate as raw ECMA-335 blobs (the `FieldMarshal` table's
//! `NativeType` column). The [`parser::Parser`] cursor decodes them with the compressed integer
//! and string encodings the format uses.

pub mod parser;

pub use parser::Parser;
