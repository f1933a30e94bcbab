use std::{fmt, sync::Arc};

use crate::metadata::typesystem::{StructDesc, POINTER_SIZE};

/// Managed type descriptor consumed by the marshallers.
///
/// `MarshalType` is the narrow view of the .NET type system that interop code generation
/// needs: the primitive flavors, the well-known runtime types that get special marshalling
/// (`string`, `StringBuilder`, `SafeHandle`, `HandleRef`, ...), composite shapes (single
/// dimensional arrays, pointers, by-ref) and user structs and classes with their field layout.
///
/// The flavor names follow ECMA-335 element types (`I4`, `U`, `R8`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MarshalType {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    /// `System.IntPtr` / `nint`
    I,
    /// `System.UIntPtr` / `nuint`
    U,
    String,
    Object,
    StringBuilder,
    Decimal,
    Guid,
    DateTime,
    HandleRef,
    /// A single dimensional, zero based array (`T[]`)
    SzArray(Box<MarshalType>),
    /// A managed reference (`ref T`, `out T`)
    ByRef(Box<MarshalType>),
    /// An unmanaged pointer (`T*`)
    Pointer(Box<MarshalType>),
    /// An unmanaged function pointer (`delegate* unmanaged<...>`)
    FnPtr,
    Enum {
        name: String,
        underlying: Box<MarshalType>,
    },
    ValueType(Arc<StructDesc>),
    Class(Arc<StructDesc>),
    Delegate(String),
    /// A type deriving from `System.Runtime.InteropServices.SafeHandle`
    SafeHandle(String),
    /// A type deriving from `System.Runtime.InteropServices.CriticalHandle`
    CriticalHandle(String),
    Interface(String),
}

impl MarshalType {
    /// `T[]`
    #[must_use]
    pub fn sz_array(element: MarshalType) -> Self {
        MarshalType::SzArray(Box::new(element))
    }

    /// `ref T`
    #[must_use]
    pub fn by_ref(inner: MarshalType) -> Self {
        MarshalType::ByRef(Box::new(inner))
    }

    /// `T*`
    #[must_use]
    pub fn pointer(inner: MarshalType) -> Self {
        MarshalType::Pointer(Box::new(inner))
    }

    /// An enum with the given underlying integral type.
    #[must_use]
    pub fn enumeration(name: &str, underlying: MarshalType) -> Self {
        MarshalType::Enum {
            name: name.to_string(),
            underlying: Box::new(underlying),
        }
    }

    /// Returns `true` for `ref T`.
    #[must_use]
    pub fn is_by_ref(&self) -> bool {
        matches!(self, MarshalType::ByRef(_))
    }

    /// The type with one level of by-ref removed. Non by-ref types are returned unchanged.
    #[must_use]
    pub fn strip_by_ref(&self) -> &MarshalType {
        match self {
            MarshalType::ByRef(inner) => inner,
            other => other,
        }
    }

    /// Element type of an array or target type of a pointer.
    #[must_use]
    pub fn element_type(&self) -> Option<&MarshalType> {
        match self {
            MarshalType::SzArray(element) | MarshalType::Pointer(element) => Some(element),
            _ => None,
        }
    }

    /// Field layout of a user struct or class.
    #[must_use]
    pub fn struct_desc(&self) -> Option<&Arc<StructDesc>> {
        match self {
            MarshalType::ValueType(desc) | MarshalType::Class(desc) => Some(desc),
            _ => None,
        }
    }

    /// Returns `true` for the CLI primitive types.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            MarshalType::Boolean
                | MarshalType::Char
                | MarshalType::I1
                | MarshalType::U1
                | MarshalType::I2
                | MarshalType::U2
                | MarshalType::I4
                | MarshalType::U4
                | MarshalType::I8
                | MarshalType::U8
                | MarshalType::R4
                | MarshalType::R8
                | MarshalType::I
                | MarshalType::U
        )
    }

    /// Returns `true` for the integer types a `SizeParamIndex` may name.
    #[must_use]
    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            MarshalType::I1
                | MarshalType::U1
                | MarshalType::I2
                | MarshalType::U2
                | MarshalType::I4
                | MarshalType::U4
                | MarshalType::I8
                | MarshalType::U8
                | MarshalType::I
                | MarshalType::U
        )
    }

    /// Returns `true` if values of this type live inline rather than on the managed heap.
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        self.is_primitive()
            || matches!(
                self,
                MarshalType::Decimal
                    | MarshalType::Guid
                    | MarshalType::DateTime
                    | MarshalType::HandleRef
                    | MarshalType::Enum { .. }
                    | MarshalType::ValueType(_)
            )
    }

    /// Returns `true` for `System.String`.
    #[must_use]
    pub fn is_string(&self) -> bool {
        matches!(self, MarshalType::String)
    }

    /// Returns `true` for unmanaged pointers.
    #[must_use]
    pub fn is_pointer(&self) -> bool {
        matches!(self, MarshalType::Pointer(_))
    }

    /// Returns `true` for unmanaged function pointers.
    #[must_use]
    pub fn is_function_pointer(&self) -> bool {
        matches!(self, MarshalType::FnPtr)
    }

    /// Returns `true` if a struct or class declares sequential or explicit layout.
    #[must_use]
    pub fn has_layout(&self) -> bool {
        self.struct_desc().is_some_and(|desc| desc.has_layout())
    }

    /// Returns `true` if the managed and native representations are bit-identical.
    ///
    /// `bool` and `char` are excluded because their native width depends on the marshalling
    /// directive. Structs are blittable when they have layout and every field is blittable.
    #[must_use]
    pub fn is_blittable(&self) -> bool {
        match self {
            MarshalType::I1
            | MarshalType::U1
            | MarshalType::I2
            | MarshalType::U2
            | MarshalType::I4
            | MarshalType::U4
            | MarshalType::I8
            | MarshalType::U8
            | MarshalType::R4
            | MarshalType::R8
            | MarshalType::I
            | MarshalType::U
            | MarshalType::Pointer(_)
            | MarshalType::FnPtr
            | MarshalType::Enum { .. }
            | MarshalType::Decimal
            | MarshalType::Guid => true,
            MarshalType::ValueType(desc) => desc.is_blittable(),
            _ => false,
        }
    }

    /// Size in bytes of the type when stored in native memory.
    ///
    /// Reference types report the pointer size: that is what a field or element holding one
    /// occupies.
    #[must_use]
    pub fn native_size(&self) -> usize {
        match self {
            MarshalType::Void => 0,
            MarshalType::Boolean | MarshalType::I1 | MarshalType::U1 => 1,
            MarshalType::Char | MarshalType::I2 | MarshalType::U2 => 2,
            MarshalType::I4 | MarshalType::U4 | MarshalType::R4 => 4,
            MarshalType::I8 | MarshalType::U8 | MarshalType::R8 | MarshalType::DateTime => 8,
            MarshalType::Decimal | MarshalType::Guid => 16,
            MarshalType::HandleRef => 2 * POINTER_SIZE,
            MarshalType::Enum { underlying, .. } => underlying.native_size(),
            MarshalType::ValueType(desc) => desc.size(),
            _ => POINTER_SIZE,
        }
    }

    /// Natural alignment of the type in native memory.
    #[must_use]
    pub fn native_alignment(&self) -> usize {
        match self {
            MarshalType::Decimal | MarshalType::Guid | MarshalType::HandleRef => 8,
            MarshalType::Enum { underlying, .. } => underlying.native_alignment(),
            MarshalType::ValueType(desc) => desc.alignment(),
            other => other.native_size().clamp(1, POINTER_SIZE),
        }
    }

    /// Short display name, used in diagnostics.
    #[must_use]
    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MarshalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalType::Void => write!(f, "void"),
            MarshalType::Boolean => write!(f, "bool"),
            MarshalType::Char => write!(f, "char"),
            MarshalType::I1 => write!(f, "sbyte"),
            MarshalType::U1 => write!(f, "byte"),
            MarshalType::I2 => write!(f, "short"),
            MarshalType::U2 => write!(f, "ushort"),
            MarshalType::I4 => write!(f, "int"),
            MarshalType::U4 => write!(f, "uint"),
            MarshalType::I8 => write!(f, "long"),
            MarshalType::U8 => write!(f, "ulong"),
            MarshalType::R4 => write!(f, "float"),
            MarshalType::R8 => write!(f, "double"),
            MarshalType::I => write!(f, "nint"),
            MarshalType::U => write!(f, "nuint"),
            MarshalType::String => write!(f, "string"),
            MarshalType::Object => write!(f, "object"),
            MarshalType::StringBuilder => write!(f, "System.Text.StringBuilder"),
            MarshalType::Decimal => write!(f, "decimal"),
            MarshalType::Guid => write!(f, "System.Guid"),
            MarshalType::DateTime => write!(f, "System.DateTime"),
            MarshalType::HandleRef => write!(f, "System.Runtime.InteropServices.HandleRef"),
            MarshalType::SzArray(element) => write!(f, "{element}[]"),
            MarshalType::ByRef(inner) => write!(f, "ref {inner}"),
            MarshalType::Pointer(inner) => write!(f, "{inner}*"),
            MarshalType::FnPtr => write!(f, "delegate* unmanaged"),
            MarshalType::Enum { name, .. } => write!(f, "{name}"),
            MarshalType::ValueType(desc) | MarshalType::Class(desc) => write!(f, "{}", desc.name),
            MarshalType::Delegate(name)
            | MarshalType::SafeHandle(name)
            | MarshalType::CriticalHandle(name)
            | MarshalType::Interface(name) => write!(f, "{name}"),
        }
    }
}
