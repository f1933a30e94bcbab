//! Handles and delegates.

use crate::{
    assembly::{CodeStream, FieldRef, Opcode},
    interop::{
        helpers::RuntimeHelper,
        kind::MarshalDirection,
        marshaller::{EmitContext, Marshaller, Stage},
    },
    metadata::typesystem::MarshalType,
    Error, Result,
};

/// Declaring type of [`HANDLE_REF_HANDLE`].
pub const HANDLE_REF_TYPE: &str = "System.Runtime.InteropServices.HandleRef";
/// The native handle field of `HandleRef`.
pub const HANDLE_REF_HANDLE: &str = "_handle";
/// The wrapper field of `HandleRef`, kept alive across the call.
pub const HANDLE_REF_WRAPPER: &str = "_wrapper";

impl Marshaller {
    /// Take a reference on the handle for the duration of the call, then pass its raw value.
    pub(super) fn safe_handle_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        match stage.aux {
            Some(handle) => {
                stage.managed.load_value(stream);
                stream.emit_stloc(handle);
                stream.emit_ldloc(handle);
                cx.call(stream, RuntimeHelper::SafeHandleAddRef);
                stream.emit_ldloc(handle);
                cx.call(stream, RuntimeHelper::SafeHandleGetHandle);
            }
            None => {
                stage.managed.load_value(stream);
                cx.call(stream, RuntimeHelper::SafeHandleGetHandle);
            }
        }
        stage.native.store_value(stream)
    }

    /// Wrap a handle produced by the callee in a fresh `SafeHandle`.
    pub(super) fn safe_handle_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        if !self.is_managed_by_ref() && !self.is_return() {
            return Ok(());
        }
        self.emit_new_handle(cx, stage, stream, RuntimeHelper::SafeHandleSetHandle)
    }

    pub(super) fn safe_handle_cleanup(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) {
        let Some(handle) = stage.aux else {
            return;
        };
        let null = cx.new_label();
        stream.emit_ldloc(handle);
        stream.emit_branch(Opcode::Brfalse, null);
        stream.emit_ldloc(handle);
        cx.call(stream, RuntimeHelper::SafeHandleRelease);
        stream.emit_label(null);
    }

    pub(super) fn critical_handle_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        stage.managed.load_value(stream);
        cx.call(stream, RuntimeHelper::CriticalHandleGetHandle);
        stage.native.store_value(stream)
    }

    pub(super) fn critical_handle_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        if !self.is_managed_by_ref()
            && !self.is_return()
            && self.direction() == MarshalDirection::Forward
        {
            return Ok(());
        }
        self.emit_new_handle(cx, stage, stream, RuntimeHelper::CriticalHandleSetHandle)
    }

    /// `managed = new T(); set_handle(managed, native)`
    fn emit_new_handle(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
        setter: RuntimeHelper,
    ) -> Result<()> {
        stream.emit_type(Opcode::Newobj, self.managed_type());
        stage.managed.store_value(stream)?;
        stage.managed.load_value(stream);
        stage.native.load_value(stream);
        cx.call(stream, setter);
        Ok(())
    }

    pub(super) fn handle_ref_to_native(&self, stage: &Stage, stream: &mut CodeStream) -> Result<()> {
        if self.is_out() {
            return Err(self.not_supported("HandleRef cannot be marshalled out"));
        }
        stage.managed.load_address(stream);
        stream.emit_field(
            Opcode::Ldfld,
            FieldRef::new(HANDLE_REF_TYPE, HANDLE_REF_HANDLE, MarshalType::I),
        );
        stage.native.store_value(stream)
    }

    pub(super) fn delegate_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        stage.managed.load_value(stream);
        cx.call(stream, RuntimeHelper::GetFunctionPointerForDelegate);
        stage.native.store_value(stream)
    }

    pub(super) fn delegate_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        if !matches!(self.managed_type(), MarshalType::Delegate(_)) {
            return Err(Error::InvalidConfiguration(format!(
                "function pointer marshaller over non-delegate '{}'",
                self.managed_type()
            )));
        }
        stage.native.load_value(stream);
        stream.emit_type(Opcode::Ldtoken, self.managed_type());
        cx.call(stream, RuntimeHelper::GetDelegateForFunctionPointer);
        stage.managed.store_value(stream)
    }
}
