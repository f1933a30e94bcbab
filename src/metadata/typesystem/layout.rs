use std::sync::Arc;

use crate::metadata::{marshalling::MarshalAsDescriptor, typesystem::MarshalType};

/// Size of a native pointer on the targets stubs are generated for.
pub const POINTER_SIZE: usize = 8;

/// How the runtime arranges the fields of a struct or class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeLayout {
    /// Field order is chosen by the runtime; the type cannot cross the native boundary.
    Auto,
    /// Fields are laid out in declaration order with natural alignment.
    Sequential,
}

/// A single instance field of a struct or class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    /// Field name
    pub name: String,
    /// Declared managed type
    pub ty: MarshalType,
    /// `[MarshalAs]` directive on the field, if any
    pub marshal_as: Option<MarshalAsDescriptor>,
}

/// Shape of a user-defined struct or class: its name, layout kind and instance fields.
///
/// # Examples
///
/// ```rust
/// use dotmarshal::metadata::typesystem::{MarshalType, StructDesc};
///
/// let point = StructDesc::sequential("Point")
///     .field("X", MarshalType::I4)
///     .field("Y", MarshalType::I4)
///     .build();
///
/// assert!(point.is_blittable());
/// assert_eq!(point.size(), 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDesc {
    /// Fully qualified type name
    pub name: String,
    /// Layout kind
    pub layout: TypeLayout,
    /// Instance fields in declaration order
    pub fields: Vec<FieldDesc>,
}

impl StructDesc {
    /// Start describing a sequential-layout type.
    #[must_use]
    pub fn sequential(name: &str) -> Self {
        StructDesc {
            name: name.to_string(),
            layout: TypeLayout::Sequential,
            fields: Vec::new(),
        }
    }

    /// Start describing an auto-layout type.
    #[must_use]
    pub fn auto(name: &str) -> Self {
        StructDesc {
            layout: TypeLayout::Auto,
            ..StructDesc::sequential(name)
        }
    }

    /// Append a field with default marshalling.
    #[must_use]
    pub fn field(mut self, name: &str, ty: MarshalType) -> Self {
        self.fields.push(FieldDesc {
            name: name.to_string(),
            ty,
            marshal_as: None,
        });
        self
    }

    /// Append a field carrying a `[MarshalAs]` directive.
    #[must_use]
    pub fn field_with(mut self, name: &str, ty: MarshalType, marshal_as: MarshalAsDescriptor) -> Self {
        self.fields.push(FieldDesc {
            name: name.to_string(),
            ty,
            marshal_as: Some(marshal_as),
        });
        self
    }

    /// Finish the description, ready to be wrapped in [`MarshalType::ValueType`] or
    /// [`MarshalType::Class`].
    #[must_use]
    pub fn build(self) -> Arc<StructDesc> {
        Arc::new(self)
    }

    /// Returns `true` unless the layout is [`TypeLayout::Auto`].
    #[must_use]
    pub fn has_layout(&self) -> bool {
        self.layout != TypeLayout::Auto
    }

    /// Returns `true` if the type has layout and every field is blittable.
    #[must_use]
    pub fn is_blittable(&self) -> bool {
        self.has_layout()
            && self
                .fields
                .iter()
                .all(|field| field.marshal_as.is_none() && field.ty.is_blittable())
    }

    /// Looks up a field by name.
    #[must_use]
    pub fn field_by_name(&self, name: &str) -> Option<&FieldDesc> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Byte offsets of each field, in declaration order.
    #[must_use]
    pub fn offsets(&self) -> Vec<usize> {
        let mut offset: usize = 0;
        self.fields
            .iter()
            .map(|field| {
                let align = field.ty.native_alignment();
                offset = offset.next_multiple_of(align);
                let field_offset = offset;
                offset += field.ty.native_size();
                field_offset
            })
            .collect()
    }

    /// Largest field alignment, at least 1.
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.fields
            .iter()
            .map(|field| field.ty.native_alignment())
            .max()
            .unwrap_or(1)
    }

    /// Total native size including tail padding. Empty structs occupy one byte.
    #[must_use]
    pub fn size(&self) -> usize {
        let end = self
            .offsets()
            .iter()
            .zip(&self.fields)
            .map(|(offset, field)| offset + field.ty.native_size())
            .max()
            .unwrap_or(0);
        end.next_multiple_of(self.alignment()).max(1)
    }
}
