//! Managed type descriptors for interop code generation.
//!
//! The marshallers never need the full .NET type system: they ask whether a type is a value
//! type, blittable, integral, a string, an array (and of what), and how a struct's fields are
//! laid out. [`MarshalType`] answers exactly those questions, and [`StructDesc`] describes user
//! structs and layout classes field by field.
//!
//! # Examples
//!
//! ```rust
//! use dotmarshal::metadata::typesystem::{MarshalType, StructDesc};
//!
//! let ints = MarshalType::sz_array(MarshalType::I4);
//! assert_eq!(ints.element_type(), Some(&MarshalType::I4));
//! assert!(ints.element_type().unwrap().is_blittable());
//!
//! let by_ref = MarshalType::by_ref(MarshalType::String);
//! assert!(by_ref.is_by_ref());
//! assert_eq!(by_ref.strip_by_ref(), &MarshalType::String);
//!
//! let named = MarshalType::ValueType(
//!     StructDesc::sequential("Named").field("Name", MarshalType::String).build(),
//! );
//! assert!(named.has_layout());
//! assert!(!named.is_blittable());
//! ```

mod base;
mod layout;

pub use base::MarshalType;
pub use layout::{FieldDesc, StructDesc, TypeLayout, POINTER_SIZE};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blittability() {
        assert!(MarshalType::I4.is_blittable());
        assert!(MarshalType::pointer(MarshalType::Void).is_blittable());
        assert!(MarshalType::enumeration("Color", MarshalType::I4).is_blittable());
        assert!(!MarshalType::Boolean.is_blittable());
        assert!(!MarshalType::Char.is_blittable());
        assert!(!MarshalType::String.is_blittable());
        assert!(!MarshalType::sz_array(MarshalType::I4).is_blittable());
    }

    #[test]
    fn integral_types() {
        for ty in [
            MarshalType::I1,
            MarshalType::U1,
            MarshalType::I2,
            MarshalType::U2,
            MarshalType::I4,
            MarshalType::U4,
            MarshalType::I8,
            MarshalType::U8,
            MarshalType::I,
            MarshalType::U,
        ] {
            assert!(ty.is_integral(), "{ty} should be integral");
        }
        assert!(!MarshalType::Boolean.is_integral());
        assert!(!MarshalType::Char.is_integral());
        assert!(!MarshalType::R8.is_integral());
        assert!(!MarshalType::String.is_integral());
    }

    #[test]
    fn value_types() {
        assert!(MarshalType::Guid.is_value_type());
        assert!(MarshalType::HandleRef.is_value_type());
        assert!(!MarshalType::String.is_value_type());
        assert!(!MarshalType::pointer(MarshalType::I4).is_value_type());
        assert!(!MarshalType::SafeHandle("MyHandle".into()).is_value_type());
    }

    #[test]
    fn native_sizes() {
        assert_eq!(MarshalType::Boolean.native_size(), 1);
        assert_eq!(MarshalType::Char.native_size(), 2);
        assert_eq!(MarshalType::R4.native_size(), 4);
        assert_eq!(MarshalType::String.native_size(), POINTER_SIZE);
        assert_eq!(
            MarshalType::enumeration("Small", MarshalType::U1).native_size(),
            1
        );
    }

    #[test]
    fn display_names() {
        assert_eq!(MarshalType::sz_array(MarshalType::I4).to_string(), "int[]");
        assert_eq!(
            MarshalType::by_ref(MarshalType::String).to_string(),
            "ref string"
        );
        assert_eq!(MarshalType::pointer(MarshalType::U1).to_string(), "byte*");
    }
}
