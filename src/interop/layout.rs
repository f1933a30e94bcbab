//! Structs and layout classes with non-blittable fields.
//!
//! The native side of such a type is a synthesized struct, `__Native_<Name>`, with one field per
//! managed field holding that field's native representation. Conversion runs a field marshaller
//! per field in declaration order.

use std::sync::Arc;

use crate::{
    assembly::{CodeStream, FieldRef, Opcode},
    interop::{
        home::Home,
        kind::{classify, MarshallerKind, MarshallerRole},
        marshaller::{EmitContext, Marshaller, MarshallerConfig, Stage},
    },
    metadata::typesystem::{FieldDesc, MarshalType, StructDesc},
    Error, Result,
};

impl Marshaller {
    /// The marshaller converting `field` of this struct or class.
    pub(super) fn field_marshaller(&self, field: &FieldDesc, to_native: bool) -> Marshaller {
        let config = self.config();
        let classification = classify(
            &field.ty,
            field.marshal_as.as_ref(),
            false,
            config.flags.char_set(),
            MarshallerRole::Field,
        );

        Marshaller::from_config(MarshallerConfig {
            kind: classification.kind,
            element_kind: classification.element_kind,
            role: MarshallerRole::Field,
            direction: config.direction,
            managed_type: field.ty.clone(),
            managed_parameter_type: field.ty.clone(),
            marshal_as: field.marshal_as.clone(),
            flags: config.flags,
            index: config.index,
            is_in: to_native,
            is_out: !to_native,
            is_return: false,
            managed_by_ref: false,
            native_by_ref: false,
        })
    }

    fn managed_layout(&self) -> Result<&Arc<StructDesc>> {
        self.managed_type().struct_desc().ok_or_else(|| {
            Error::InvalidConfiguration(format!("'{}' has no field layout", self.managed_type()))
        })
    }

    fn native_layout(&self) -> Result<&Arc<StructDesc>> {
        self.native_type().struct_desc().ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "'{}' has no native field layout",
                self.managed_type()
            ))
        })
    }

    /// Push the object whose fields `ldfld`/`stfld` address: the struct's address, or the class
    /// reference.
    fn load_managed_object(&self, stage: &Stage, stream: &mut CodeStream) {
        if self.kind() == MarshallerKind::LayoutClass {
            stage.managed.load_value(stream);
        } else {
            stage.managed.load_address(stream);
        }
    }

    pub(super) fn fields_need_cleanup(&self) -> bool {
        self.managed_type().struct_desc().is_some_and(|desc| {
            desc.fields
                .iter()
                .any(|field| self.field_marshaller(field, true).cleanup_required())
        })
    }

    pub(super) fn struct_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let managed = self.managed_layout()?;
        let native = self.native_layout()?;

        for (field, native_field) in managed.fields.iter().zip(&native.fields) {
            let marshaller = self.field_marshaller(field, true);
            stage.native.load_address(stream);
            self.load_managed_object(stage, stream);
            stream.emit_field(
                Opcode::Ldfld,
                FieldRef::new(&managed.name, &field.name, field.ty.clone()),
            );
            marshaller.emit_element_marshalling(cx, stream)?;
            stream.emit_field(
                Opcode::Stfld,
                FieldRef::new(&native.name, &native_field.name, native_field.ty.clone()),
            );
        }
        Ok(())
    }

    pub(super) fn struct_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let managed = self.managed_layout()?;
        let native = self.native_layout()?;

        for (field, native_field) in managed.fields.iter().zip(&native.fields) {
            let marshaller = self.field_marshaller(field, false);
            self.load_managed_object(stage, stream);
            stage.native.load_address(stream);
            stream.emit_field(
                Opcode::Ldfld,
                FieldRef::new(&native.name, &native_field.name, native_field.ty.clone()),
            );
            marshaller.emit_element_marshalling(cx, stream)?;
            stream.emit_field(
                Opcode::Stfld,
                FieldRef::new(&managed.name, &field.name, field.ty.clone()),
            );
        }
        Ok(())
    }

    /// Convert a non-null instance and, for arguments, point the native argument at the
    /// converted struct. A null instance is passed as a null pointer.
    pub(super) fn layout_class_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let null = cx.new_label();

        if let Some(pointer) = stage.aux {
            stream.emit_ldc(0);
            stream.emit(Opcode::ConvI);
            stream.emit_stloc(pointer);
        }

        stage.managed.load_value(stream);
        stream.emit_branch(Opcode::Brfalse, null);
        self.struct_to_native(cx, stage, stream)?;

        if let Some(pointer) = stage.aux {
            stage.native.load_address(stream);
            stream.emit(Opcode::ConvI);
            stream.emit_stloc(pointer);
        }
        stream.emit_label(null);
        Ok(())
    }

    pub(super) fn layout_class_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let null = cx.new_label();
        stage.managed.load_value(stream);
        stream.emit_branch(Opcode::Brfalse, null);
        self.struct_to_managed(cx, stage, stream)?;
        stream.emit_label(null);
        Ok(())
    }

    /// Release what the field conversions allocated in the struct at `native`.
    fn emit_fields_cleanup(
        &self,
        cx: &mut EmitContext<'_>,
        native: &Home,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let managed = self.managed_layout()?;
        let native_desc = self.native_layout()?;

        for (field, native_field) in managed.fields.iter().zip(&native_desc.fields) {
            let marshaller = self.field_marshaller(field, true);
            if !marshaller.cleanup_required() {
                continue;
            }
            native.load_address(stream);
            stream.emit_field(
                Opcode::Ldfld,
                FieldRef::new(&native_desc.name, &native_field.name, native_field.ty.clone()),
            );
            marshaller.emit_element_cleanup(cx, stream)?;
        }
        Ok(())
    }

    pub(super) fn struct_cleanup(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        if !self.fields_need_cleanup() {
            return Ok(());
        }
        self.emit_fields_cleanup(cx, &stage.native, stream)
    }

    /// Element variant of `struct_cleanup`: the native struct is on the stack.
    pub(super) fn struct_element_cleanup(
        &self,
        cx: &mut EmitContext<'_>,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let native_type = self.native_type().clone();
        let temp = Home::local(cx.new_local(native_type.clone()), native_type, false);
        temp.store_value(stream)?;
        self.emit_fields_cleanup(cx, &temp, stream)
    }
}

/// The native struct synthesized for a managed struct or layout class, if the type has one.
#[must_use]
pub fn native_layout_of(marshaller: &Marshaller) -> Option<Arc<StructDesc>> {
    match marshaller.native_type() {
        MarshalType::ValueType(desc) => Some(Arc::clone(desc)),
        _ => None,
    }
}
