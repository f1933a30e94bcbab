//! P/Invoke marshalling.
//!
//! This module decides how each value of a platform invoke crosses the managed/native boundary
//! and emits the CIL performing the transfer.
//!
//! - [`classify`] - pure kind classification from type, `[MarshalAs]`, role and character set
//! - [`Marshaller`] - one per value; immutable [`MarshallerConfig`] plus the emission protocol
//! - [`Home`] - uniform load/store access to where a value lives during emission
//! - [`RuntimeHelper`] / [`HelperResolver`] - the runtime routines stubs call, resolved once
//! - [`PInvokeStubBuilder`] - assembles and links whole stubs from a [`PInvokeMethod`]
//!
//! Kind-specific emission lives in the private `array`, `string`, `handle` and `layout` modules
//! as further `impl Marshaller` blocks.
//!
//! # Examples
//!
//! ```rust
//! use dotmarshal::interop::{MarshalDirection, Marshaller, MarshallerKind, MarshallerRole, PInvokeFlags};
//! use dotmarshal::MarshalType;
//!
//! let strings = Marshaller::create(
//!     &MarshalType::sz_array(MarshalType::String),
//!     MarshallerRole::Argument,
//!     None,
//!     MarshalDirection::Forward,
//!     1,
//!     PInvokeFlags::default(),
//!     true,
//!     true,
//!     false,
//! );
//! assert_eq!(strings.kind(), MarshallerKind::Array);
//! assert_eq!(strings.element_kind(), Some(MarshallerKind::UnicodeString));
//! assert!(strings.is_in() && strings.is_out());
//! ```

mod array;
mod flags;
mod handle;
mod helpers;
mod home;
mod kind;
mod layout;
mod marshaller;
mod string;
mod stub;

pub use flags::{CharSet, PInvokeFlags};
pub use handle::{HANDLE_REF_HANDLE, HANDLE_REF_TYPE, HANDLE_REF_WRAPPER};
pub use helpers::{DefaultHelperResolver, HelperRef, HelperResolver, HelperTable, RuntimeHelper};
pub use home::{Home, Slot};
pub use kind::{classify, Classification, MarshalDirection, MarshallerKind, MarshallerRole};
pub use layout::native_layout_of;
pub use marshaller::{EmitContext, Marshaller, MarshallerConfig, Stage};
pub use stub::{PInvokeMethod, PInvokeParameter, PInvokeStubBuilder};
