//! `MarshalAs` descriptors for P/Invoke parameters, return values and fields.
//!
//! This module provides the constants, the [`NativeType`] model and the parser for native type
//! descriptors as defined in ECMA-335 II.23.2.9 (extended by CoreCLR with `LPUTF8STR` and the
//! WinRT types). A descriptor is the decoded form of a `[MarshalAs(...)]` attribute: it tells
//! the marshaller factory which native representation the author asked for, and for arrays it
//! carries the element sub-type, `SizeParamIndex` and `SizeConst` directives.
//!
//! # Descriptor Layout
//!
//! ```text
//! NativeType := NATIVE_TYPE byte, then type-specific payload
//! LPARRAY    := 0x2A ElementType [ParamNum [NumElem]]
//! BYVALARRAY := 0x1E NumElem [ElementType]
//! LPSTR etc. := 0x14 [SizeParamIndex]
//! ```
//!
//! Optional trailing integers are omitted when absent, and an `END` byte may terminate a
//! descriptor early.
//!
//! # Examples
//!
//! ```rust
//! use dotmarshal::metadata::marshalling::{MarshalAsDescriptor, NativeType, NATIVE_TYPE};
//!
//! // [MarshalAs(UnmanagedType.LPArray, ArraySubType = UnmanagedType.I4, SizeParamIndex = 1)]
//! let descriptor = MarshalAsDescriptor::parse(&[NATIVE_TYPE::ARRAY, NATIVE_TYPE::I4, 0x01])?;
//!
//! assert_eq!(descriptor.array_sub_type(), Some(&NativeType::I4));
//! assert_eq!(descriptor.size_param_index(), Some(1));
//! assert_eq!(descriptor.size_const(), None);
//! # Ok::<(), dotmarshal::Error>(())
//! ```

use crate::{file::parser::Parser, Error::RecursionLimit, Result};

/// Maximum nesting depth accepted while parsing a descriptor.
pub const MAX_RECURSION_DEPTH: usize = 50;

/// Native type constants as defined in ECMA-335 II.23.2.9 and CoreCLR.
///
/// These are the first byte of every native type descriptor. `MAX` doubles as the
/// "unspecified" element type of an `ARRAY` descriptor.
#[allow(non_snake_case, missing_docs)]
pub mod NATIVE_TYPE {
    pub const END: u8 = 0x00;
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const I1: u8 = 0x03;
    pub const U1: u8 = 0x04;
    pub const I2: u8 = 0x05;
    pub const U2: u8 = 0x06;
    pub const I4: u8 = 0x07;
    pub const U4: u8 = 0x08;
    pub const I8: u8 = 0x09;
    pub const U8: u8 = 0x0a;
    pub const R4: u8 = 0x0b;
    pub const R8: u8 = 0x0c;
    pub const SYSCHAR: u8 = 0x0d;
    pub const VARIANT: u8 = 0x0e;
    pub const CURRENCY: u8 = 0x0f;
    pub const PTR: u8 = 0x10;
    pub const DECIMAL: u8 = 0x11;
    pub const DATE: u8 = 0x12;
    pub const BSTR: u8 = 0x13;
    pub const LPSTR: u8 = 0x14;
    pub const LPWSTR: u8 = 0x15;
    pub const LPTSTR: u8 = 0x16;
    pub const FIXEDSYSSTRING: u8 = 0x17;
    pub const OBJECTREF: u8 = 0x18;
    pub const IUNKNOWN: u8 = 0x19;
    pub const IDISPATCH: u8 = 0x1a;
    pub const STRUCT: u8 = 0x1b;
    pub const INTERFACE: u8 = 0x1c;
    pub const SAFEARRAY: u8 = 0x1d;
    pub const FIXEDARRAY: u8 = 0x1e;
    pub const INT: u8 = 0x1f;
    pub const UINT: u8 = 0x20;
    pub const NESTEDSTRUCT: u8 = 0x21;
    pub const BYVALSTR: u8 = 0x22;
    pub const ANSIBSTR: u8 = 0x23;
    pub const TBSTR: u8 = 0x24;
    pub const VARIANTBOOL: u8 = 0x25;
    pub const FUNC: u8 = 0x26;
    pub const ASANY: u8 = 0x28;
    pub const ARRAY: u8 = 0x2a;
    pub const LPSTRUCT: u8 = 0x2b;
    pub const CUSTOMMARSHALER: u8 = 0x2c;
    pub const ERROR: u8 = 0x2d;
    pub const IINSPECTABLE: u8 = 0x2e;
    pub const HSTRING: u8 = 0x2f;
    pub const LPUTF8STR: u8 = 0x30;
    pub const MAX: u8 = 0x50;
}

/// Mask selecting the VARTYPE bits of a `SAFEARRAY` element type.
pub const VT_TYPEMASK: u16 = 0x0fff;

/// A decoded native type.
///
/// Variants carrying data mirror the optional payload of their descriptor byte. `End` is
/// produced for the `END` and `MAX` bytes and means "no native type specified".
#[derive(Debug, PartialEq, Eq, Clone)]
#[allow(missing_docs)]
pub enum NativeType {
    Void,
    Boolean,
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
    SysChar,
    Variant,
    Currency,
    Decimal,
    Date,
    Int,
    UInt,
    Error,

    BStr,
    LPStr { size_param_index: Option<u32> },
    LPWStr { size_param_index: Option<u32> },
    LPTStr { size_param_index: Option<u32> },
    LPUtf8Str { size_param_index: Option<u32> },
    FixedSysString { size: u32 },
    AnsiBStr,
    TBStr,
    ByValStr { size: u32 },
    VariantBool,

    /// `UnmanagedType.ByValArray`: an inline buffer of `size` elements.
    FixedArray {
        size: u32,
        element_type: Option<Box<NativeType>>,
    },
    /// `UnmanagedType.LPArray`: a pointer to a separately allocated buffer.
    Array {
        element_type: Box<NativeType>,
        /// `SizeParamIndex`: zero-based index of the parameter holding the element count
        num_param: Option<u32>,
        /// `SizeConst`: a constant element count, added to the parameter value if both exist
        num_element: Option<u32>,
    },
    SafeArray {
        variant_type: u16,
        user_defined_name: Option<String>,
    },

    Ptr { ref_type: Option<Box<NativeType>> },

    IUnknown,
    IDispatch,
    IInspectable,
    Interface { iid_param_index: Option<u32> },

    Struct {
        packing_size: Option<u8>,
        class_size: Option<u32>,
    },
    NestedStruct,
    /// A pointer to a struct (`UnmanagedType.LPStruct`).
    LPStruct,

    CustomMarshaler {
        guid: String,
        native_type_name: String,
        cookie: String,
        type_reference: String,
    },

    ObjectRef,
    /// A function pointer (`UnmanagedType.FunctionPtr`).
    Func,
    AsAny,
    HString,

    End,
}

impl NativeType {
    /// Returns `true` for the string native types that denote a pointer to a null-terminated
    /// buffer.
    #[must_use]
    pub fn is_string_pointer(&self) -> bool {
        matches!(
            self,
            NativeType::LPStr { .. }
                | NativeType::LPWStr { .. }
                | NativeType::LPTStr { .. }
                | NativeType::LPUtf8Str { .. }
        )
    }
}

/// A top-level native type plus any trailing types found in the blob.
#[derive(Debug, PartialEq, Clone)]
pub struct MarshallingInfo {
    /// The primary native type for this marshalling descriptor
    pub primary_type: NativeType,
    /// Additional type information for complex marshalling scenarios
    pub additional_types: Vec<NativeType>,
}

/// Parses a complete marshalling descriptor blob.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] for truncated data, [`crate::Error::Malformed`] for an
/// unknown type byte and [`crate::Error::RecursionLimit`] for excessive nesting.
pub fn parse_marshalling_descriptor(data: &[u8]) -> Result<MarshallingInfo> {
    let mut parser = MarshallingParser::new(data);
    parser.parse_descriptor()
}

/// Recursive descent parser for native type descriptors.
pub struct MarshallingParser<'a> {
    parser: Parser<'a>,
    depth: usize,
}

impl<'a> MarshallingParser<'a> {
    /// Creates a new parser over `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        MarshallingParser {
            parser: Parser::new(data),
            depth: 0,
        }
    }

    /// Reads a compressed integer if one follows before the end of the blob or an `END` byte.
    fn optional_uint(&mut self) -> Result<Option<u32>> {
        if self.parser.has_more_data() && self.parser.peek_byte()? != NATIVE_TYPE::END {
            Ok(Some(self.parser.read_compressed_uint()?))
        } else {
            Ok(None)
        }
    }

    /// Parses a nested native type if one follows.
    fn optional_native_type(&mut self) -> Result<Option<Box<NativeType>>> {
        if self.parser.has_more_data() && self.parser.peek_byte()? != NATIVE_TYPE::END {
            Ok(Some(Box::new(self.parse_native_type()?)))
        } else {
            Ok(None)
        }
    }

    /// Parses a single native type from the current position.
    ///
    /// # Errors
    /// Returns an error if the native type cannot be parsed or recursion limit is exceeded
    pub fn parse_native_type(&mut self) -> Result<NativeType> {
        self.depth += 1;
        if self.depth >= MAX_RECURSION_DEPTH {
            return Err(RecursionLimit(MAX_RECURSION_DEPTH));
        }

        let head_byte = self.parser.read_u8()?;
        let native_type = match head_byte {
            NATIVE_TYPE::END | NATIVE_TYPE::MAX => NativeType::End,
            NATIVE_TYPE::VOID => NativeType::Void,
            NATIVE_TYPE::BOOLEAN => NativeType::Boolean,
            NATIVE_TYPE::I1 => NativeType::I1,
            NATIVE_TYPE::U1 => NativeType::U1,
            NATIVE_TYPE::I2 => NativeType::I2,
            NATIVE_TYPE::U2 => NativeType::U2,
            NATIVE_TYPE::I4 => NativeType::I4,
            NATIVE_TYPE::U4 => NativeType::U4,
            NATIVE_TYPE::I8 => NativeType::I8,
            NATIVE_TYPE::U8 => NativeType::U8,
            NATIVE_TYPE::R4 => NativeType::R4,
            NATIVE_TYPE::R8 => NativeType::R8,
            NATIVE_TYPE::SYSCHAR => NativeType::SysChar,
            NATIVE_TYPE::VARIANT => NativeType::Variant,
            NATIVE_TYPE::CURRENCY => NativeType::Currency,
            NATIVE_TYPE::DECIMAL => NativeType::Decimal,
            NATIVE_TYPE::DATE => NativeType::Date,
            NATIVE_TYPE::INT => NativeType::Int,
            NATIVE_TYPE::UINT => NativeType::UInt,
            NATIVE_TYPE::ERROR => NativeType::Error,
            NATIVE_TYPE::BSTR => NativeType::BStr,
            NATIVE_TYPE::LPSTR => NativeType::LPStr {
                size_param_index: self.optional_uint()?,
            },
            NATIVE_TYPE::LPWSTR => NativeType::LPWStr {
                size_param_index: self.optional_uint()?,
            },
            NATIVE_TYPE::LPTSTR => NativeType::LPTStr {
                size_param_index: self.optional_uint()?,
            },
            NATIVE_TYPE::LPUTF8STR => NativeType::LPUtf8Str {
                size_param_index: self.optional_uint()?,
            },
            NATIVE_TYPE::FIXEDSYSSTRING => NativeType::FixedSysString {
                size: self.parser.read_compressed_uint()?,
            },
            NATIVE_TYPE::OBJECTREF => NativeType::ObjectRef,
            NATIVE_TYPE::IUNKNOWN => NativeType::IUnknown,
            NATIVE_TYPE::IDISPATCH => NativeType::IDispatch,
            NATIVE_TYPE::IINSPECTABLE => NativeType::IInspectable,
            NATIVE_TYPE::STRUCT => {
                let packing_size = if self.parser.has_more_data()
                    && self.parser.peek_byte()? != NATIVE_TYPE::END
                {
                    Some(self.parser.read_u8()?)
                } else {
                    None
                };
                NativeType::Struct {
                    packing_size,
                    class_size: self.optional_uint()?,
                }
            }
            NATIVE_TYPE::INTERFACE => NativeType::Interface {
                iid_param_index: self.optional_uint()?,
            },
            NATIVE_TYPE::SAFEARRAY => {
                let variant_type = if self.parser.has_more_data() {
                    u16::from(self.parser.read_u8()?) & VT_TYPEMASK
                } else {
                    0
                };
                let user_defined_name = if self.parser.has_more_data() {
                    Some(self.parser.read_compressed_string_utf8()?)
                } else {
                    None
                };
                NativeType::SafeArray {
                    variant_type,
                    user_defined_name,
                }
            }
            NATIVE_TYPE::FIXEDARRAY => {
                let size = self.parser.read_compressed_uint()?;
                NativeType::FixedArray {
                    size,
                    element_type: self.optional_native_type()?,
                }
            }
            NATIVE_TYPE::ARRAY => {
                // ARRAY Type Opt<ParamNumber> Opt<NumElement>
                let element_type = Box::new(self.parse_native_type()?);
                let num_param = self.optional_uint()?;
                let num_element = self.optional_uint()?;
                NativeType::Array {
                    element_type,
                    num_param,
                    num_element,
                }
            }
            NATIVE_TYPE::NESTEDSTRUCT => NativeType::NestedStruct,
            NATIVE_TYPE::BYVALSTR => NativeType::ByValStr {
                size: self.parser.read_compressed_uint()?,
            },
            NATIVE_TYPE::ANSIBSTR => NativeType::AnsiBStr,
            NATIVE_TYPE::TBSTR => NativeType::TBStr,
            NATIVE_TYPE::VARIANTBOOL => NativeType::VariantBool,
            NATIVE_TYPE::FUNC => NativeType::Func,
            NATIVE_TYPE::ASANY => NativeType::AsAny,
            NATIVE_TYPE::LPSTRUCT => NativeType::LPStruct,
            NATIVE_TYPE::CUSTOMMARSHALER => NativeType::CustomMarshaler {
                guid: self.parser.read_compressed_string_utf8()?,
                native_type_name: self.parser.read_compressed_string_utf8()?,
                cookie: self.parser.read_compressed_string_utf8()?,
                type_reference: self.parser.read_compressed_string_utf8()?,
            },
            NATIVE_TYPE::HSTRING => NativeType::HString,
            NATIVE_TYPE::PTR => NativeType::Ptr {
                ref_type: self.optional_native_type()?,
            },
            _ => return Err(malformed_error!("Invalid NATIVE_TYPE byte - {}", head_byte)),
        };

        self.depth -= 1;
        Ok(native_type)
    }

    /// Parses a complete marshalling descriptor.
    ///
    /// # Errors
    /// Returns an error if the marshalling descriptor is malformed or cannot be parsed
    pub fn parse_descriptor(&mut self) -> Result<MarshallingInfo> {
        let mut descriptor = MarshallingInfo {
            primary_type: self.parse_native_type()?,
            additional_types: Vec::new(),
        };

        while self.parser.has_more_data() {
            if self.parser.peek_byte()? == NATIVE_TYPE::END {
                self.parser.read_u8()?;
                break;
            }

            let additional_type = self.parse_native_type()?;
            descriptor.additional_types.push(additional_type);
        }

        Ok(descriptor)
    }
}

/// The marshalling directive attached to one parameter, return value or field.
///
/// Wraps the primary [`NativeType`] and exposes the pieces the marshallers query: the native
/// type itself, the array element sub-type, `SizeParamIndex` and `SizeConst`. Absence of a
/// descriptor (`Option::None` at the call sites) means "use the default for the managed type".
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MarshalAsDescriptor {
    native_type: NativeType,
}

impl MarshalAsDescriptor {
    /// Wrap an already decoded native type.
    #[must_use]
    pub fn new(native_type: NativeType) -> Self {
        MarshalAsDescriptor { native_type }
    }

    /// Decode a descriptor from a `FieldMarshal` blob.
    ///
    /// # Errors
    /// See [`parse_marshalling_descriptor`].
    pub fn parse(data: &[u8]) -> Result<Self> {
        let info = parse_marshalling_descriptor(data)?;
        Ok(MarshalAsDescriptor::new(info.primary_type))
    }

    /// `[MarshalAs(UnmanagedType.LPArray, ...)]` with the given directives.
    #[must_use]
    pub fn array(
        element_type: Option<NativeType>,
        size_param_index: Option<u32>,
        size_const: Option<u32>,
    ) -> Self {
        MarshalAsDescriptor::new(NativeType::Array {
            element_type: Box::new(element_type.unwrap_or(NativeType::End)),
            num_param: size_param_index,
            num_element: size_const,
        })
    }

    /// The requested native type. [`NativeType::End`] means none was requested.
    #[must_use]
    pub fn native_type(&self) -> &NativeType {
        &self.native_type
    }

    /// Element type of an `LPArray` or `ByValArray`, if one was specified.
    #[must_use]
    pub fn array_sub_type(&self) -> Option<&NativeType> {
        match &self.native_type {
            NativeType::Array { element_type, .. } if **element_type != NativeType::End => {
                Some(element_type)
            }
            NativeType::FixedArray {
                element_type: Some(element_type),
                ..
            } => Some(element_type),
            _ => None,
        }
    }

    /// Zero-based index of the parameter carrying the element count.
    #[must_use]
    pub fn size_param_index(&self) -> Option<u32> {
        match &self.native_type {
            NativeType::Array { num_param, .. } => *num_param,
            _ => None,
        }
    }

    /// Constant element (or character) count.
    #[must_use]
    pub fn size_const(&self) -> Option<u32> {
        match &self.native_type {
            NativeType::Array { num_element, .. } => *num_element,
            NativeType::FixedArray { size, .. }
            | NativeType::ByValStr { size }
            | NativeType::FixedSysString { size } => Some(*size),
            _ => None,
        }
    }
}

impl From<NativeType> for MarshalAsDescriptor {
    fn from(native_type: NativeType) -> Self {
        MarshalAsDescriptor::new(native_type)
    }
}
