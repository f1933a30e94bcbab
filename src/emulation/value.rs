//! Runtime values of the stub interpreter.
//!
//! The evaluation stack, arguments, locals, array elements and fields all hold [`StubValue`]s.
//! Integers narrower than 32 bits live widened in `I4` the way the CIL evaluation stack keeps
//! them; native-sized integers and native addresses share `NativeInt`.

use std::{fmt, sync::Arc};

use crate::{
    emulation::EmulationError,
    metadata::typesystem::{MarshalType, StructDesc},
    Result,
};

/// Reference to an object on the managed heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef(u64);

impl HeapRef {
    pub(crate) fn new(id: u64) -> Self {
        HeapRef(id)
    }

    /// The opaque object id.
    #[must_use]
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HeapRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// A managed pointer (`&T`): the address of a storage location the interpreter owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagedPtr {
    /// Stub argument
    Arg(u16),
    /// Stub local
    Local(u16),
    /// Element of a managed array
    Element(HeapRef, usize),
    /// Field of the value type stored at the inner location
    Field(Box<ManagedPtr>, String),
    /// Field of a class instance
    ObjField(HeapRef, String),
    /// A caller-owned cell, used to pass `ref`/`out` arguments into a stub
    Cell(usize),
}

/// An instance of a value type.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    /// Layout of the struct
    pub desc: Arc<StructDesc>,
    /// Field values in declaration order
    pub fields: Vec<StubValue>,
}

impl StructValue {
    /// A struct with every field at its default value.
    #[must_use]
    pub fn zeroed(desc: &Arc<StructDesc>) -> Self {
        StructValue {
            desc: Arc::clone(desc),
            fields: desc
                .fields
                .iter()
                .map(|field| StubValue::default_for(&field.ty))
                .collect(),
        }
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.desc
            .fields
            .iter()
            .position(|field| field.name == name)
            .ok_or_else(|| {
                EmulationError::FieldNotFound {
                    owner: self.desc.name.clone(),
                    field: name.to_string(),
                }
                .into()
            })
    }

    /// Value of field `name`.
    ///
    /// # Errors
    /// [`EmulationError::FieldNotFound`] if the struct has no such field.
    pub fn field(&self, name: &str) -> Result<&StubValue> {
        let position = self.position(name)?;
        Ok(&self.fields[position])
    }

    /// Replace field `name`, coercing the value to the field type.
    ///
    /// # Errors
    /// [`EmulationError::FieldNotFound`] if the struct has no such field.
    pub fn set_field(&mut self, name: &str, value: StubValue) -> Result<()> {
        let position = self.position(name)?;
        let ty = &self.desc.fields[position].ty;
        self.fields[position] = value.coerce(ty);
        Ok(())
    }
}

/// A value on the interpreter's stack or in one of its storage locations.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StubValue {
    /// Null object reference, null managed pointer, or an unset by-ref slot
    #[default]
    Null,
    /// `bool`, `char` and integers up to 32 bits
    I4(i32),
    /// 64-bit integers
    I8(i64),
    /// `nint`/`nuint`, unmanaged pointers and function pointers
    NativeInt(i64),
    /// Floating point
    F(f64),
    /// Reference to a managed heap object
    Ref(HeapRef),
    /// Managed pointer
    Ptr(ManagedPtr),
    /// Value type instance
    Struct(StructValue),
    /// Opaque 16-byte value (`decimal`, `Guid`)
    Blob(Vec<u8>),
    /// `RuntimeTypeHandle` pushed by `ldtoken`
    TypeHandle(MarshalType),
}

impl StubValue {
    /// The zero value a local, element or field of type `ty` starts with.
    #[must_use]
    pub fn default_for(ty: &MarshalType) -> Self {
        match ty {
            MarshalType::Boolean
            | MarshalType::Char
            | MarshalType::I1
            | MarshalType::U1
            | MarshalType::I2
            | MarshalType::U2
            | MarshalType::I4
            | MarshalType::U4 => StubValue::I4(0),
            MarshalType::I8 | MarshalType::U8 | MarshalType::DateTime => StubValue::I8(0),
            MarshalType::R4 | MarshalType::R8 => StubValue::F(0.0),
            MarshalType::I | MarshalType::U | MarshalType::Pointer(_) | MarshalType::FnPtr => {
                StubValue::NativeInt(0)
            }
            MarshalType::Decimal | MarshalType::Guid => StubValue::Blob(vec![0; 16]),
            MarshalType::Enum { underlying, .. } => StubValue::default_for(underlying),
            MarshalType::ValueType(desc) => StubValue::Struct(StructValue::zeroed(desc)),
            MarshalType::HandleRef => {
                StubValue::Struct(StructValue::zeroed(&handle_ref_layout()))
            }
            _ => StubValue::Null,
        }
    }

    /// Short name of the variant, used in diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            StubValue::Null => "null",
            StubValue::I4(_) => "int32",
            StubValue::I8(_) => "int64",
            StubValue::NativeInt(_) => "native int",
            StubValue::F(_) => "float",
            StubValue::Ref(_) => "object reference",
            StubValue::Ptr(_) => "managed pointer",
            StubValue::Struct(_) => "value type",
            StubValue::Blob(_) => "blob",
            StubValue::TypeHandle(_) => "type handle",
        }
    }

    /// Integer view of the value. Null counts as zero.
    ///
    /// # Errors
    /// [`EmulationError::TypeMismatch`] for non-integral values.
    pub fn as_i64(&self, operation: &'static str) -> Result<i64> {
        match self {
            StubValue::Null => Ok(0),
            StubValue::I4(value) => Ok(i64::from(*value)),
            StubValue::I8(value) | StubValue::NativeInt(value) => Ok(*value),
            other => Err(EmulationError::TypeMismatch {
                operation,
                expected: "integer",
                found: other.kind_name(),
            }
            .into()),
        }
    }

    /// Returns `true` for values `brtrue` branches on.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            StubValue::Null => false,
            StubValue::I4(value) => *value != 0,
            StubValue::I8(value) | StubValue::NativeInt(value) => *value != 0,
            StubValue::F(value) => *value != 0.0,
            _ => true,
        }
    }

    /// The heap reference, if this is a non-null object reference.
    #[must_use]
    pub fn heap_ref(&self) -> Option<HeapRef> {
        match self {
            StubValue::Ref(reference) => Some(*reference),
            _ => None,
        }
    }

    /// Convert a value being stored into a location of type `ty`: narrow integers are truncated
    /// and re-extended, native-sized locations widen 32-bit values.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn coerce(self, ty: &MarshalType) -> StubValue {
        let integer = match &self {
            StubValue::I4(value) => Some(i64::from(*value)),
            StubValue::I8(value) | StubValue::NativeInt(value) => Some(*value),
            _ => None,
        };
        let Some(value) = integer else {
            return self;
        };

        match ty {
            MarshalType::Boolean | MarshalType::U1 => StubValue::I4(i32::from(value as u8)),
            MarshalType::I1 => StubValue::I4(i32::from(value as i8)),
            MarshalType::I2 => StubValue::I4(i32::from(value as i16)),
            MarshalType::Char | MarshalType::U2 => StubValue::I4(i32::from(value as u16)),
            MarshalType::I4 | MarshalType::U4 => StubValue::I4(value as i32),
            MarshalType::I8 | MarshalType::U8 | MarshalType::DateTime => StubValue::I8(value),
            MarshalType::I | MarshalType::U | MarshalType::Pointer(_) | MarshalType::FnPtr => {
                StubValue::NativeInt(value)
            }
            MarshalType::Enum { underlying, .. } => self.coerce(underlying),
            _ => self,
        }
    }
}

impl From<i32> for StubValue {
    fn from(value: i32) -> Self {
        StubValue::I4(value)
    }
}

impl From<bool> for StubValue {
    fn from(value: bool) -> Self {
        StubValue::I4(i32::from(value))
    }
}

impl From<i64> for StubValue {
    fn from(value: i64) -> Self {
        StubValue::I8(value)
    }
}

impl From<StructValue> for StubValue {
    fn from(value: StructValue) -> Self {
        StubValue::Struct(value)
    }
}

impl fmt::Display for StubValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StubValue::Null => write!(f, "null"),
            StubValue::I4(value) => write!(f, "{value}"),
            StubValue::I8(value) => write!(f, "{value}L"),
            StubValue::NativeInt(value) => write!(f, "0x{value:X}"),
            StubValue::F(value) => write!(f, "{value}"),
            StubValue::Ref(reference) => write!(f, "{reference}"),
            StubValue::Ptr(ptr) => write!(f, "&{ptr:?}"),
            StubValue::Struct(value) => write!(f, "{} {{..}}", value.desc.name),
            StubValue::Blob(bytes) => write!(f, "blob[{}]", bytes.len()),
            StubValue::TypeHandle(ty) => write!(f, "typeof({ty})"),
        }
    }
}

/// Field layout of `System.Runtime.InteropServices.HandleRef`.
#[must_use]
pub fn handle_ref_layout() -> Arc<StructDesc> {
    StructDesc::sequential(crate::interop::HANDLE_REF_TYPE)
        .field(crate::interop::HANDLE_REF_WRAPPER, MarshalType::Object)
        .field(crate::interop::HANDLE_REF_HANDLE, MarshalType::I)
        .build()
}
