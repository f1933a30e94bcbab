//! Array marshalling.
//!
//! Arrays cross the boundary as a pointer to a `CoTaskMem` buffer of converted elements. Each
//! element is converted by an element marshaller inside an emitted loop. Blittable arrays skip
//! the copy on the way in: the managed array is pinned and its first element's address passed.
//!
//! The element count is taken from the managed array when it exists (forward in), otherwise from
//! the `SizeConst` and `SizeParamIndex` directives.

use crate::{
    assembly::{CodeStream, Opcode},
    interop::{
        helpers::RuntimeHelper,
        kind::{MarshalDirection, MarshallerKind, MarshallerRole},
        marshaller::{EmitContext, Marshaller, MarshallerConfig, Stage},
    },
    metadata::{marshalling::MarshalAsDescriptor, typesystem::MarshalType},
    Error, Result,
};

/// Locals of one emitted copy loop.
struct CopyLoop {
    cursor: crate::assembly::LocalId,
    index: crate::assembly::LocalId,
    stride: crate::assembly::LocalId,
    length: crate::assembly::LocalId,
}

impl Marshaller {
    /// The marshaller converting one element of this array.
    pub(super) fn element_marshaller(&self, to_native: bool) -> Marshaller {
        let config = self.config();
        let element = config
            .managed_type
            .element_type()
            .cloned()
            .unwrap_or(MarshalType::Void);
        let marshal_as = config
            .marshal_as
            .as_ref()
            .and_then(MarshalAsDescriptor::array_sub_type)
            .map(|sub| MarshalAsDescriptor::new(sub.clone()));

        Marshaller::from_config(MarshallerConfig {
            kind: config.element_kind.unwrap_or(MarshallerKind::Invalid),
            element_kind: None,
            role: MarshallerRole::Element,
            direction: config.direction,
            managed_type: element.clone(),
            managed_parameter_type: element,
            marshal_as,
            flags: config.flags,
            index: config.index,
            is_in: to_native,
            is_out: !to_native,
            is_return: false,
            managed_by_ref: false,
            native_by_ref: false,
        })
    }

    fn managed_element_type(&self) -> MarshalType {
        self.managed_type()
            .element_type()
            .cloned()
            .unwrap_or(MarshalType::Void)
    }

    fn native_element_type(&self) -> MarshalType {
        self.native_type()
            .element_type()
            .cloned()
            .unwrap_or(MarshalType::Void)
    }

    /// Push the element count as `int32`.
    ///
    /// Managed-to-native conversions, and by-value forward arguments in either direction, count
    /// the managed array. Everything else relies on `SizeConst + arg[SizeParamIndex]`, with a
    /// count of one when neither directive is present.
    pub(super) fn emit_element_count(
        &self,
        cx: &EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
        direction: MarshalDirection,
    ) -> Result<()> {
        let config = self.config();
        let has_managed_array = direction == MarshalDirection::Forward
            || (config.direction == MarshalDirection::Forward
                && config.role == MarshallerRole::Argument
                && !config.is_return
                && !config.managed_by_ref);

        if has_managed_array {
            stage.managed.load_value(stream);
            stream.emit(Opcode::Ldlen);
            stream.emit(Opcode::ConvI4);
            return Ok(());
        }

        let size_const = config
            .marshal_as
            .as_ref()
            .and_then(MarshalAsDescriptor::size_const);
        let size_param = config
            .marshal_as
            .as_ref()
            .and_then(MarshalAsDescriptor::size_param_index);

        if let Some(size) = size_const {
            let size = i32::try_from(size).map_err(|_| {
                Error::InvalidConfiguration(format!("SizeConst {size} does not fit an int32"))
            })?;
            stream.emit_ldc(size);
        }

        if let Some(param) = size_param {
            let sibling = self.size_parameter(cx, param)?;
            stream.emit_ldarg(sibling.index().saturating_sub(1));
            if sibling.is_managed_by_ref() {
                stream.emit_ldind(sibling.managed_type());
            }
            stream.emit(Opcode::ConvI4);
            if size_const.is_some() {
                stream.emit(Opcode::Add);
            }
        }

        if size_const.is_none() && size_param.is_none() {
            stream.emit_ldc(1);
        }
        Ok(())
    }

    fn size_parameter<'m>(&self, cx: &EmitContext<'m>, param: u32) -> Result<&'m Marshaller> {
        let marshallers = cx.marshallers();
        let parameters = marshallers.len().saturating_sub(1);
        let sibling = usize::try_from(param)
            .ok()
            .filter(|param| *param < parameters)
            .map(|param| &marshallers[param + 1])
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "SizeParamIndex {param} is out of range for {parameters} parameters"
                ))
            })?;

        if !sibling.managed_type().is_integral() {
            return Err(Error::InvalidConfiguration(format!(
                "SizeParamIndex {param} names a parameter of type '{}', which is not an integer",
                sibling.managed_type()
            )));
        }
        Ok(sibling)
    }

    /// `native = managed == null ? null : CoTaskMemAllocAndZeroMemory(count * sizeof(elem))`
    pub(super) fn array_alloc_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let null = cx.new_label();

        stage.native.load_address(stream);
        stream.emit_type(Opcode::Initobj, self.native_type());

        stage.managed.load_value(stream);
        stream.emit_branch(Opcode::Brfalse, null);

        self.emit_element_count(cx, stage, stream, MarshalDirection::Forward)?;
        stream.emit_type(Opcode::Sizeof, &self.native_element_type());
        stream.emit(Opcode::MulOvf);
        cx.call(stream, RuntimeHelper::CoTaskMemAllocAndZeroMemory);
        stage.native.store_value(stream)?;

        stream.emit_label(null);
        Ok(())
    }

    fn begin_copy_loop(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
        direction: MarshalDirection,
    ) -> Result<CopyLoop> {
        let copy = CopyLoop {
            cursor: cx.new_local(self.native_type().clone()),
            index: cx.new_local(MarshalType::I4),
            stride: cx.new_local(MarshalType::I),
            length: cx.new_local(MarshalType::I4),
        };

        self.emit_element_count(cx, stage, stream, direction)?;
        stream.emit_stloc(copy.length);
        stream.emit_type(Opcode::Sizeof, &self.native_element_type());
        stream.emit_stloc(copy.stride);
        stage.native.load_value(stream);
        stream.emit_stloc(copy.cursor);
        stream.emit_ldc(0);
        stream.emit_stloc(copy.index);
        Ok(copy)
    }

    /// Advance index and cursor, then loop while `index < length`.
    fn end_copy_loop(
        copy: &CopyLoop,
        stream: &mut CodeStream,
        header: crate::assembly::Label,
        condition: crate::assembly::Label,
    ) {
        stream.emit_ldloc(copy.index);
        stream.emit_ldc(1);
        stream.emit(Opcode::Add);
        stream.emit_stloc(copy.index);

        stream.emit_ldloc(copy.cursor);
        stream.emit_ldloc(copy.stride);
        stream.emit(Opcode::Add);
        stream.emit_stloc(copy.cursor);

        stream.emit_label(condition);
        stream.emit_ldloc(copy.index);
        stream.emit_ldloc(copy.length);
        stream.emit_branch(Opcode::Blt, header);
    }

    pub(super) fn array_transform_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let null = cx.new_label();
        let header = cx.new_label();
        let condition = cx.new_label();
        let element = self.element_marshaller(true);
        let managed_element = self.managed_element_type();
        let native_element = self.native_element_type();

        stage.managed.load_value(stream);
        stream.emit_branch(Opcode::Brfalse, null);

        let copy = self.begin_copy_loop(cx, stage, stream, MarshalDirection::Forward)?;
        stream.emit_branch(Opcode::Br, condition);

        stream.emit_label(header);
        stream.emit_ldloc(copy.cursor);
        stage.managed.load_value(stream);
        stream.emit_ldloc(copy.index);
        stream.emit_type(Opcode::Ldelem, &managed_element);
        element.emit_element_marshalling(cx, stream)?;
        stream.emit_type(Opcode::Stobj, &native_element);

        Self::end_copy_loop(&copy, stream, header, condition);
        stream.emit_label(null);
        Ok(())
    }

    /// `managed = native == null ? null : new T[count]`
    pub(super) fn array_alloc_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let null = cx.new_label();
        let done = cx.new_label();

        stage.native.load_value(stream);
        stream.emit_branch(Opcode::Brfalse, null);
        self.emit_element_count(cx, stage, stream, MarshalDirection::Reverse)?;
        stream.emit_type(Opcode::Newarr, &self.managed_element_type());
        stage.managed.store_value(stream)?;
        stream.emit_branch(Opcode::Br, done);

        stream.emit_label(null);
        stream.emit(Opcode::Ldnull);
        stage.managed.store_value(stream)?;
        stream.emit_label(done);
        Ok(())
    }

    pub(super) fn array_transform_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let null = cx.new_label();
        let header = cx.new_label();
        let condition = cx.new_label();
        let element = self.element_marshaller(false);
        let managed_element = self.managed_element_type();
        let native_element = self.native_element_type();

        stage.managed.load_value(stream);
        stream.emit_branch(Opcode::Brfalse, null);

        let copy = self.begin_copy_loop(cx, stage, stream, MarshalDirection::Reverse)?;
        stream.emit_branch(Opcode::Br, condition);

        stream.emit_label(header);
        stage.managed.load_value(stream);
        stream.emit_ldloc(copy.index);
        stream.emit_ldloc(copy.cursor);
        stream.emit_type(Opcode::Ldobj, &native_element);
        element.emit_element_marshalling(cx, stream)?;
        stream.emit_type(Opcode::Stelem, &managed_element);

        Self::end_copy_loop(&copy, stream, header, condition);
        stream.emit_label(null);
        Ok(())
    }

    /// Release element resources, then the buffer itself.
    pub(super) fn array_cleanup(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let null = cx.new_label();
        let element = self.element_marshaller(true);

        stage.managed.load_value(stream);
        stream.emit_branch(Opcode::Brfalse, null);

        if element.cleanup_required() {
            let header = cx.new_label();
            let condition = cx.new_label();
            let native_element = self.native_element_type();

            let copy = self.begin_copy_loop(cx, stage, stream, MarshalDirection::Forward)?;
            stream.emit_branch(Opcode::Br, condition);

            stream.emit_label(header);
            stream.emit_ldloc(copy.cursor);
            stream.emit_type(Opcode::Ldobj, &native_element);
            element.emit_element_cleanup(cx, stream)?;

            Self::end_copy_loop(&copy, stream, header, condition);
        }

        stage.native.load_value(stream);
        cx.call(stream, RuntimeHelper::CoTaskMemFree);
        stream.emit_label(null);
        Ok(())
    }

    /// Pin the managed array and pass the address of its first element, or null for a null or
    /// empty array.
    pub(super) fn blittable_array_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let managed_element = self.managed_element_type();
        let pinned = cx.new_pinned_local(MarshalType::by_ref(managed_element.clone()));
        let empty = cx.new_label();

        stage.managed.load_value(stream);
        stream.emit_branch(Opcode::Brfalse, empty);
        stage.managed.load_value(stream);
        stream.emit(Opcode::Ldlen);
        stream.emit(Opcode::ConvI4);
        stream.emit_branch(Opcode::Brfalse, empty);

        stage.managed.load_value(stream);
        stream.emit_ldc(0);
        stream.emit_type(Opcode::Ldelema, &managed_element);
        stream.emit_stloc(pinned);

        stream.emit_label(empty);
        stream.emit_ldloc(pinned);
        stream.emit(Opcode::ConvI);
        stage.native.store_value(stream)
    }
}
