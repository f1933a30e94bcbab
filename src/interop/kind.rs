//! Marshaller kind classification.
//!
//! [`classify`] decides how a value crosses the native boundary from its managed type, the
//! optional `[MarshalAs]` directive, whether it is a return value, the method's character set
//! and the role it plays (parameter, array element or struct field). The result is a
//! [`MarshallerKind`] and, for arrays, the kind of the element marshaller.
//!
//! Classification is a pure function. It recurses into array element types and struct fields,
//! so nested shapes (arrays of structs with string fields) classify deterministically, and a
//! shape that cannot be marshalled at any level classifies as [`MarshallerKind::Invalid`]
//! instead of failing part way through stub emission.

use crate::{
    interop::flags::CharSet,
    metadata::{
        marshalling::{MarshalAsDescriptor, NativeType},
        typesystem::{MarshalType, StructDesc},
    },
};

/// Nesting limit for struct fields and array elements.
const MAX_CLASSIFICATION_DEPTH: usize = 16;

/// How a value crosses the managed/native boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[allow(missing_docs)]
pub enum MarshallerKind {
    /// Primitive, pointer or function pointer with identical layout on both sides
    BlittableValue,
    /// Array with a marshalled element type
    Array,
    /// Array whose elements are blittable; passed pinned
    BlittableArray,
    /// `bool` as 4-byte `BOOL`
    Bool,
    /// `bool` as 1-byte `BOOLEAN`
    CBool,
    Enum,
    /// `char` as a single ANSI byte
    AnsiChar,
    /// `char` as a UTF-16 code unit
    UnicodeChar,
    /// `char[]` as ANSI bytes
    AnsiCharArray,
    ByValArray,
    ByValAnsiCharArray,
    /// `string` as `LPSTR`
    AnsiString,
    /// `string` as `LPWSTR`
    UnicodeString,
    /// `string` as `LPUTF8STR`
    Utf8String,
    ByValAnsiString,
    ByValUnicodeString,
    AnsiStringBuilder,
    UnicodeStringBuilder,
    /// Delegate as a native function pointer
    FunctionPointer,
    SafeHandle,
    CriticalHandle,
    HandleRef,
    VoidReturn,
    Variant,
    Object,
    OleDateTime,
    Decimal,
    Guid,
    /// Value type with non-blittable fields
    Struct,
    /// Value type with blittable layout
    BlittableStruct,
    /// Blittable value type passed by pointer (`LPStruct`)
    BlittableStructPtr,
    /// Reference type with sequential layout
    LayoutClass,
    LayoutClassPtr,
    AsAnyA,
    AsAnyW,
    /// No marshalling exists for this shape
    Invalid,
}

impl MarshallerKind {
    /// Returns `true` if stubs can be emitted for this kind.
    #[must_use]
    pub fn is_supported(self) -> bool {
        !matches!(
            self,
            MarshallerKind::Invalid
                | MarshallerKind::Variant
                | MarshallerKind::Object
                | MarshallerKind::OleDateTime
                | MarshallerKind::ByValArray
                | MarshallerKind::ByValAnsiCharArray
                | MarshallerKind::ByValAnsiString
                | MarshallerKind::ByValUnicodeString
                | MarshallerKind::AsAnyA
                | MarshallerKind::AsAnyW
                | MarshallerKind::LayoutClassPtr
        )
    }

    /// Returns `true` for the kinds whose managed and native layouts are identical.
    #[must_use]
    pub fn is_blittable(self) -> bool {
        matches!(
            self,
            MarshallerKind::BlittableValue
                | MarshallerKind::BlittableStruct
                | MarshallerKind::UnicodeChar
                | MarshallerKind::Enum
                | MarshallerKind::Decimal
                | MarshallerKind::Guid
        )
    }
}

/// Which side originates the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum MarshalDirection {
    /// Managed code calls native code
    Forward,
    /// Native code calls managed code
    Reverse,
}

impl MarshalDirection {
    /// The opposite direction.
    #[must_use]
    pub fn reverse(self) -> Self {
        match self {
            MarshalDirection::Forward => MarshalDirection::Reverse,
            MarshalDirection::Reverse => MarshalDirection::Forward,
        }
    }
}

/// What a marshaller is marshalling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum MarshallerRole {
    /// A parameter or return value of the stub
    Argument,
    /// One element inside an array copy loop
    Element,
    /// One field of a struct or layout class
    Field,
}

/// Result of [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Classification {
    /// The primary kind
    pub kind: MarshallerKind,
    /// Kind of the element marshaller, for arrays
    pub element_kind: Option<MarshallerKind>,
}

impl Classification {
    fn of(kind: MarshallerKind) -> Self {
        Classification {
            kind,
            element_kind: None,
        }
    }
}

/// Classify a managed type for marshalling.
///
/// `ty` may be a by-ref type; one level of by-ref is looked through. `marshal_as` is the
/// `[MarshalAs]` directive, `None` meaning the default for the type.
///
/// # Examples
///
/// ```rust
/// use dotmarshal::interop::{classify, CharSet, MarshallerKind, MarshallerRole};
/// use dotmarshal::MarshalType;
///
/// let ints = classify(
///     &MarshalType::sz_array(MarshalType::I4),
///     None,
///     false,
///     CharSet::Unicode,
///     MarshallerRole::Argument,
/// );
/// assert_eq!(ints.kind, MarshallerKind::BlittableArray);
/// assert_eq!(ints.element_kind, Some(MarshallerKind::BlittableValue));
///
/// let text = classify(&MarshalType::String, None, false, CharSet::Ansi, MarshallerRole::Argument);
/// assert_eq!(text.kind, MarshallerKind::AnsiString);
/// ```
#[must_use]
pub fn classify(
    ty: &MarshalType,
    marshal_as: Option<&MarshalAsDescriptor>,
    is_return: bool,
    char_set: CharSet,
    role: MarshallerRole,
) -> Classification {
    classify_at(ty, marshal_as, is_return, char_set, role, 0)
}

fn classify_at(
    ty: &MarshalType,
    marshal_as: Option<&MarshalAsDescriptor>,
    is_return: bool,
    char_set: CharSet,
    role: MarshallerRole,
    depth: usize,
) -> Classification {
    if depth > MAX_CLASSIFICATION_DEPTH {
        return Classification::of(MarshallerKind::Invalid);
    }

    let ty = ty.strip_by_ref();
    let native = marshal_as
        .map(MarshalAsDescriptor::native_type)
        .filter(|native| **native != NativeType::End);
    let ansi = char_set == CharSet::Ansi;
    let by_char_set = |ansi_kind, unicode_kind| if ansi { ansi_kind } else { unicode_kind };

    let kind = match ty {
        MarshalType::Void if is_return => MarshallerKind::VoidReturn,
        MarshalType::Void => MarshallerKind::Invalid,

        MarshalType::Boolean => match native {
            None | Some(NativeType::Boolean) => MarshallerKind::Bool,
            Some(NativeType::I1 | NativeType::U1) => MarshallerKind::CBool,
            Some(_) => MarshallerKind::Invalid,
        },

        MarshalType::Char => match native {
            None => by_char_set(MarshallerKind::AnsiChar, MarshallerKind::UnicodeChar),
            Some(NativeType::I1 | NativeType::U1) => MarshallerKind::AnsiChar,
            Some(NativeType::I2 | NativeType::U2) => MarshallerKind::UnicodeChar,
            Some(_) => MarshallerKind::Invalid,
        },

        primitive if primitive.is_primitive() => match native {
            None => MarshallerKind::BlittableValue,
            Some(native) if native_matches_primitive(primitive, native) => {
                MarshallerKind::BlittableValue
            }
            Some(_) => MarshallerKind::Invalid,
        },

        MarshalType::Pointer(_) | MarshalType::FnPtr => match native {
            None => MarshallerKind::BlittableValue,
            Some(_) => MarshallerKind::Invalid,
        },

        MarshalType::Enum { .. } => MarshallerKind::Enum,

        MarshalType::Decimal => match native {
            None | Some(NativeType::Struct { .. }) => MarshallerKind::Decimal,
            Some(NativeType::LPStruct) => MarshallerKind::BlittableStructPtr,
            Some(_) => MarshallerKind::Invalid,
        },

        MarshalType::Guid => match native {
            None | Some(NativeType::Struct { .. }) => MarshallerKind::Guid,
            Some(NativeType::LPStruct) => MarshallerKind::BlittableStructPtr,
            Some(_) => MarshallerKind::Invalid,
        },

        MarshalType::DateTime => MarshallerKind::OleDateTime,

        MarshalType::HandleRef if is_return || role != MarshallerRole::Argument => {
            MarshallerKind::Invalid
        }
        MarshalType::HandleRef => MarshallerKind::HandleRef,

        MarshalType::ValueType(desc) => {
            classify_value_type(desc, native, char_set, depth)
        }

        MarshalType::Class(desc) => {
            if !desc.has_layout() || is_return || role == MarshallerRole::Element {
                MarshallerKind::Invalid
            } else {
                match native {
                    None | Some(NativeType::Struct { .. })
                        if fields_marshallable(desc, char_set, depth) =>
                    {
                        MarshallerKind::LayoutClass
                    }
                    Some(NativeType::LPStruct) => MarshallerKind::LayoutClassPtr,
                    _ => MarshallerKind::Invalid,
                }
            }
        }

        MarshalType::SzArray(element) => {
            return classify_array(element, marshal_as, native, is_return, char_set, role, depth);
        }

        MarshalType::String => match native {
            Some(NativeType::LPWStr { .. }) => MarshallerKind::UnicodeString,
            Some(NativeType::LPStr { .. }) => MarshallerKind::AnsiString,
            Some(NativeType::LPUtf8Str { .. }) => MarshallerKind::Utf8String,
            None | Some(NativeType::LPTStr { .. }) => {
                by_char_set(MarshallerKind::AnsiString, MarshallerKind::UnicodeString)
            }
            Some(NativeType::ByValStr { .. } | NativeType::FixedSysString { .. })
                if role == MarshallerRole::Field =>
            {
                by_char_set(
                    MarshallerKind::ByValAnsiString,
                    MarshallerKind::ByValUnicodeString,
                )
            }
            Some(_) => MarshallerKind::Invalid,
        },

        MarshalType::StringBuilder if role != MarshallerRole::Argument || is_return => {
            MarshallerKind::Invalid
        }
        MarshalType::StringBuilder => match native {
            None | Some(NativeType::LPTStr { .. }) => by_char_set(
                MarshallerKind::AnsiStringBuilder,
                MarshallerKind::UnicodeStringBuilder,
            ),
            Some(NativeType::LPStr { .. }) => MarshallerKind::AnsiStringBuilder,
            Some(NativeType::LPWStr { .. }) => MarshallerKind::UnicodeStringBuilder,
            Some(_) => MarshallerKind::Invalid,
        },

        MarshalType::Delegate(_) => match native {
            None | Some(NativeType::Func) => MarshallerKind::FunctionPointer,
            Some(_) => MarshallerKind::Invalid,
        },

        MarshalType::SafeHandle(_) | MarshalType::CriticalHandle(_)
            if role != MarshallerRole::Argument || native.is_some() =>
        {
            MarshallerKind::Invalid
        }
        MarshalType::SafeHandle(_) => MarshallerKind::SafeHandle,
        MarshalType::CriticalHandle(_) => MarshallerKind::CriticalHandle,

        MarshalType::Object => match native {
            None | Some(NativeType::Variant) => MarshallerKind::Variant,
            Some(NativeType::AsAny) => by_char_set(MarshallerKind::AsAnyA, MarshallerKind::AsAnyW),
            Some(_) => MarshallerKind::Invalid,
        },

        _ => MarshallerKind::Invalid,
    };

    Classification::of(kind)
}

fn classify_value_type(
    desc: &StructDesc,
    native: Option<&NativeType>,
    char_set: CharSet,
    depth: usize,
) -> MarshallerKind {
    if !desc.has_layout() {
        return MarshallerKind::Invalid;
    }

    match native {
        None | Some(NativeType::Struct { .. }) if desc.is_blittable() => {
            MarshallerKind::BlittableStruct
        }
        Some(NativeType::LPStruct) if desc.is_blittable() => MarshallerKind::BlittableStructPtr,
        None | Some(NativeType::Struct { .. }) if fields_marshallable(desc, char_set, depth) => {
            MarshallerKind::Struct
        }
        _ => MarshallerKind::Invalid,
    }
}

fn classify_array(
    element: &MarshalType,
    marshal_as: Option<&MarshalAsDescriptor>,
    native: Option<&NativeType>,
    is_return: bool,
    char_set: CharSet,
    role: MarshallerRole,
    depth: usize,
) -> Classification {
    let sub_type = marshal_as
        .and_then(MarshalAsDescriptor::array_sub_type)
        .map(|sub| MarshalAsDescriptor::new(sub.clone()));
    let element_kind = classify_at(
        element,
        sub_type.as_ref(),
        false,
        char_set,
        MarshallerRole::Element,
        depth + 1,
    )
    .kind;

    let kind = match (role, native) {
        (MarshallerRole::Field, Some(NativeType::FixedArray { .. })) => {
            if element_kind == MarshallerKind::AnsiChar {
                MarshallerKind::ByValAnsiCharArray
            } else {
                MarshallerKind::ByValArray
            }
        }
        (MarshallerRole::Argument, None | Some(NativeType::Array { .. })) if !is_return => {
            match element_kind {
                MarshallerKind::Invalid => MarshallerKind::Invalid,
                MarshallerKind::AnsiChar => MarshallerKind::AnsiCharArray,
                kind if kind.is_blittable() => MarshallerKind::BlittableArray,
                _ => MarshallerKind::Array,
            }
        }
        _ => MarshallerKind::Invalid,
    };

    Classification {
        kind,
        element_kind: Some(element_kind),
    }
}

fn fields_marshallable(desc: &StructDesc, char_set: CharSet, depth: usize) -> bool {
    desc.fields.iter().all(|field| {
        let kind = classify_at(
            &field.ty,
            field.marshal_as.as_ref(),
            false,
            char_set,
            MarshallerRole::Field,
            depth + 1,
        )
        .kind;
        kind.is_supported()
    })
}

fn native_matches_primitive(ty: &MarshalType, native: &NativeType) -> bool {
    matches!(
        (ty, native),
        (MarshalType::I1, NativeType::I1)
            | (MarshalType::U1, NativeType::U1)
            | (MarshalType::I2, NativeType::I2)
            | (MarshalType::U2, NativeType::U2)
            | (MarshalType::I4, NativeType::I4 | NativeType::Error)
            | (MarshalType::U4, NativeType::U4 | NativeType::Error)
            | (MarshalType::I8, NativeType::I8)
            | (MarshalType::U8, NativeType::U8)
            | (MarshalType::R4, NativeType::R4)
            | (MarshalType::R8, NativeType::R8)
            | (MarshalType::I, NativeType::Int)
            | (MarshalType::U, NativeType::UInt)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(ty: &MarshalType, native: Option<NativeType>) -> MarshallerKind {
        let descriptor = native.map(MarshalAsDescriptor::new);
        classify(
            ty,
            descriptor.as_ref(),
            false,
            CharSet::Unicode,
            MarshallerRole::Argument,
        )
        .kind
    }

    #[test]
    fn primitives() {
        assert_eq!(arg(&MarshalType::I4, None), MarshallerKind::BlittableValue);
        assert_eq!(
            arg(&MarshalType::I4, Some(NativeType::I4)),
            MarshallerKind::BlittableValue
        );
        assert_eq!(
            arg(&MarshalType::I4, Some(NativeType::I8)),
            MarshallerKind::Invalid
        );
        assert_eq!(
            arg(&MarshalType::by_ref(MarshalType::R8), None),
            MarshallerKind::BlittableValue
        );
        assert_eq!(
            arg(&MarshalType::pointer(MarshalType::Void), None),
            MarshallerKind::BlittableValue
        );
    }

    #[test]
    fn booleans_and_chars() {
        assert_eq!(arg(&MarshalType::Boolean, None), MarshallerKind::Bool);
        assert_eq!(
            arg(&MarshalType::Boolean, Some(NativeType::U1)),
            MarshallerKind::CBool
        );
        assert_eq!(arg(&MarshalType::Char, None), MarshallerKind::UnicodeChar);
        assert_eq!(
            classify(
                &MarshalType::Char,
                None,
                false,
                CharSet::Ansi,
                MarshallerRole::Argument
            )
            .kind,
            MarshallerKind::AnsiChar
        );
    }

    #[test]
    fn strings() {
        assert_eq!(arg(&MarshalType::String, None), MarshallerKind::UnicodeString);
        assert_eq!(
            arg(
                &MarshalType::String,
                Some(NativeType::LPStr {
                    size_param_index: None
                })
            ),
            MarshallerKind::AnsiString
        );
        assert_eq!(
            arg(
                &MarshalType::String,
                Some(NativeType::LPUtf8Str {
                    size_param_index: None
                })
            ),
            MarshallerKind::Utf8String
        );
        assert_eq!(
            arg(&MarshalType::String, Some(NativeType::ByValStr { size: 8 })),
            MarshallerKind::Invalid
        );
        assert_eq!(
            arg(&MarshalType::StringBuilder, None),
            MarshallerKind::UnicodeStringBuilder
        );
    }

    #[test]
    fn arrays() {
        let ints = MarshalType::sz_array(MarshalType::I4);
        let result = classify(
            &ints,
            None,
            false,
            CharSet::Unicode,
            MarshallerRole::Argument,
        );
        assert_eq!(result.kind, MarshallerKind::BlittableArray);
        assert_eq!(result.element_kind, Some(MarshallerKind::BlittableValue));

        let strings = MarshalType::sz_array(MarshalType::String);
        let result = classify(
            &strings,
            None,
            false,
            CharSet::Unicode,
            MarshallerRole::Argument,
        );
        assert_eq!(result.kind, MarshallerKind::Array);
        assert_eq!(result.element_kind, Some(MarshallerKind::UnicodeString));

        let bools = MarshalType::sz_array(MarshalType::Boolean);
        assert_eq!(arg(&bools, None), MarshallerKind::Array);

        let jagged = MarshalType::sz_array(MarshalType::sz_array(MarshalType::I4));
        assert_eq!(arg(&jagged, None), MarshallerKind::Invalid);

        let returned = classify(&ints, None, true, CharSet::Unicode, MarshallerRole::Argument);
        assert_eq!(returned.kind, MarshallerKind::Invalid);
    }

    #[test]
    fn array_sub_type_selects_element_encoding() {
        let strings = MarshalType::sz_array(MarshalType::String);
        let descriptor = MarshalAsDescriptor::array(
            Some(NativeType::LPStr {
                size_param_index: None,
            }),
            None,
            None,
        );
        let result = classify(
            &strings,
            Some(&descriptor),
            false,
            CharSet::Unicode,
            MarshallerRole::Argument,
        );
        assert_eq!(result.kind, MarshallerKind::Array);
        assert_eq!(result.element_kind, Some(MarshallerKind::AnsiString));
    }

    #[test]
    fn structs() {
        let point = MarshalType::ValueType(
            StructDesc::sequential("Point")
                .field("X", MarshalType::I4)
                .field("Y", MarshalType::I4)
                .build(),
        );
        assert_eq!(arg(&point, None), MarshallerKind::BlittableStruct);
        assert_eq!(
            arg(&point, Some(NativeType::LPStruct)),
            MarshallerKind::BlittableStructPtr
        );

        let named = MarshalType::ValueType(
            StructDesc::sequential("Named")
                .field("Name", MarshalType::String)
                .build(),
        );
        assert_eq!(arg(&named, None), MarshallerKind::Struct);

        let holds_builder = MarshalType::ValueType(
            StructDesc::sequential("Bad")
                .field("Text", MarshalType::StringBuilder)
                .build(),
        );
        assert_eq!(arg(&holds_builder, None), MarshallerKind::Invalid);

        let auto = MarshalType::ValueType(StructDesc::auto("Auto").field("x", MarshalType::I4).build());
        assert_eq!(arg(&auto, None), MarshallerKind::Invalid);

        let class = MarshalType::Class(
            StructDesc::sequential("Rect")
                .field("Left", MarshalType::I4)
                .build(),
        );
        assert_eq!(arg(&class, None), MarshallerKind::LayoutClass);
    }

    #[test]
    fn handles_and_delegates() {
        assert_eq!(
            arg(&MarshalType::SafeHandle("FileHandle".into()), None),
            MarshallerKind::SafeHandle
        );
        assert_eq!(
            arg(&MarshalType::CriticalHandle("Crit".into()), None),
            MarshallerKind::CriticalHandle
        );
        assert_eq!(arg(&MarshalType::HandleRef, None), MarshallerKind::HandleRef);
        assert_eq!(
            arg(&MarshalType::Delegate("Callback".into()), None),
            MarshallerKind::FunctionPointer
        );
    }

    #[test]
    fn unsupported_shapes_still_classify() {
        assert_eq!(arg(&MarshalType::Object, None), MarshallerKind::Variant);
        assert!(!MarshallerKind::Variant.is_supported());
        assert_eq!(arg(&MarshalType::DateTime, None), MarshallerKind::OleDateTime);
        assert_eq!(arg(&MarshalType::Void, None), MarshallerKind::Invalid);
        assert_eq!(
            classify(
                &MarshalType::Void,
                None,
                true,
                CharSet::Unicode,
                MarshallerRole::Argument
            )
            .kind,
            MarshallerKind::VoidReturn
        );
    }

    #[test]
    fn field_role() {
        let field = |ty: &MarshalType, native: Option<NativeType>| {
            let descriptor = native.map(MarshalAsDescriptor::new);
            classify(
                ty,
                descriptor.as_ref(),
                false,
                CharSet::Ansi,
                MarshallerRole::Field,
            )
            .kind
        };

        assert_eq!(field(&MarshalType::String, None), MarshallerKind::AnsiString);
        assert_eq!(
            field(&MarshalType::String, Some(NativeType::ByValStr { size: 16 })),
            MarshallerKind::ByValAnsiString
        );
        assert_eq!(
            field(
                &MarshalType::sz_array(MarshalType::I4),
                Some(NativeType::FixedArray {
                    size: 4,
                    element_type: None
                })
            ),
            MarshallerKind::ByValArray
        );
        assert_eq!(
            field(&MarshalType::sz_array(MarshalType::I4), None),
            MarshallerKind::Invalid
        );
    }
}
