//! Strings, characters and string builders.
//!
//! All transcoding goes through runtime helpers. The stub only decides which helper to call,
//! passes the ANSI best-fit and throw-on-unmappable policy, and frees the native buffers it owns.
//! A by-value In-only `string` argument of a forward stub is not copied at all: the string is
//! pinned and the native side receives a pointer to its characters.

use crate::{
    assembly::{CodeStream, Opcode},
    interop::{
        helpers::RuntimeHelper,
        kind::{MarshalDirection, MarshallerKind, MarshallerRole},
        marshaller::{EmitContext, Marshaller, Stage},
    },
    metadata::typesystem::MarshalType,
    Result,
};

impl Marshaller {
    /// Returns `true` if a UTF-16 string argument is passed pinned instead of copied.
    #[must_use]
    pub fn should_pin_string(&self) -> bool {
        let config = self.config();
        config.kind == MarshallerKind::UnicodeString
            && config.direction == MarshalDirection::Forward
            && config.role == MarshallerRole::Argument
            && !config.is_return
            && !config.managed_by_ref
            && config.is_in
            && !config.is_out
    }

    /// `ldc bestFit; ldc throwOnUnmappable`
    fn emit_ansi_policy(&self, stream: &mut CodeStream) {
        let flags = self.config().flags;
        stream.emit_ldc(i32::from(flags.best_fit_mapping()));
        stream.emit_ldc(i32::from(flags.throw_on_unmappable_char()));
    }

    pub(super) fn unicode_string_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        if !self.should_pin_string() {
            stage.managed.load_value(stream);
            cx.call(stream, RuntimeHelper::StringToUnicodeBuffer);
            return stage.native.store_value(stream);
        }

        let pinned = cx.new_pinned_local(MarshalType::String);
        let null = cx.new_label();

        stage.managed.load_value(stream);
        stream.emit_stloc(pinned);
        stream.emit_ldloc(pinned);
        stream.emit(Opcode::ConvI);
        stream.emit(Opcode::Dup);
        stream.emit_branch(Opcode::Brfalse, null);
        cx.call(stream, RuntimeHelper::OffsetToStringData);
        stream.emit(Opcode::Add);
        stream.emit_label(null);
        stage.native.store_value(stream)
    }

    pub(super) fn narrow_string_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        stage.managed.load_value(stream);
        if self.kind() == MarshallerKind::AnsiString {
            self.emit_ansi_policy(stream);
            cx.call(stream, RuntimeHelper::StringToAnsiString);
        } else {
            cx.call(stream, RuntimeHelper::StringToUtf8String);
        }
        stage.native.store_value(stream)
    }

    pub(super) fn string_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let helper = match self.kind() {
            MarshallerKind::AnsiString => RuntimeHelper::AnsiStringToString,
            MarshallerKind::Utf8String => RuntimeHelper::Utf8StringToString,
            _ => RuntimeHelper::UnicodeBufferToString,
        };
        stage.native.load_value(stream);
        cx.call(stream, helper);
        stage.managed.store_value(stream)
    }

    pub(super) fn ansi_char_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        stage.managed.load_value(stream);
        self.emit_ansi_policy(stream);
        cx.call(stream, RuntimeHelper::WideCharToAnsiChar);
        stage.native.store_value(stream)
    }

    pub(super) fn ansi_char_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        stage.native.load_value(stream);
        cx.call(stream, RuntimeHelper::AnsiCharToWideChar);
        stage.managed.store_value(stream)
    }

    /// Allocate the native buffer at the builder's capacity, copying its contents only for In.
    pub(super) fn string_builder_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        let null = cx.new_label();

        stage.managed.load_value(stream);
        stream.emit_branch(Opcode::Brfalse, null);

        stage.managed.load_value(stream);
        stream.emit_ldc(i32::from(self.is_in()));
        if self.kind() == MarshallerKind::AnsiStringBuilder {
            self.emit_ansi_policy(stream);
            cx.call(stream, RuntimeHelper::StringBuilderToAnsiString);
        } else {
            cx.call(stream, RuntimeHelper::StringBuilderToUnicodeBuffer);
        }
        stage.native.store_value(stream)?;

        stream.emit_label(null);
        Ok(())
    }

    pub(super) fn string_builder_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) {
        let null = cx.new_label();
        let helper = if self.kind() == MarshallerKind::AnsiStringBuilder {
            RuntimeHelper::AnsiStringToStringBuilder
        } else {
            RuntimeHelper::UnicodeBufferToStringBuilder
        };

        stage.managed.load_value(stream);
        stream.emit_branch(Opcode::Brfalse, null);
        stage.native.load_value(stream);
        stage.managed.load_value(stream);
        cx.call(stream, helper);
        stream.emit_label(null);
    }

    /// Free the native string on top of the stack, ignoring null.
    pub(super) fn emit_free_element(&self, cx: &mut EmitContext<'_>, stream: &mut CodeStream) {
        let temp = cx.new_local(self.native_type().clone());
        let null = cx.new_label();

        stream.emit_stloc(temp);
        stream.emit_ldloc(temp);
        stream.emit_branch(Opcode::Brfalse, null);
        stream.emit_ldloc(temp);
        cx.call(stream, RuntimeHelper::CoTaskMemFree);
        stream.emit_label(null);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assembly::{Immediate, Opcode, Operand, PInvokeCodeStreams, StubEmitter},
        interop::{
            flags::PInvokeFlags,
            helpers::{DefaultHelperResolver, HelperTable, RuntimeHelper},
            kind::{MarshalDirection, MarshallerKind, MarshallerRole},
            marshaller::{EmitContext, Marshaller},
        },
        metadata::typesystem::MarshalType,
    };

    fn argument(ty: MarshalType, flags: PInvokeFlags, is_in: bool, is_out: bool) -> Marshaller {
        Marshaller::create(
            &ty,
            MarshallerRole::Argument,
            None,
            MarshalDirection::Forward,
            1,
            flags,
            is_in,
            is_out,
            false,
        )
    }

    fn emit(marshaller: &Marshaller) -> (PInvokeCodeStreams, StubEmitter) {
        let helpers = HelperTable::resolve_all(&DefaultHelperResolver).unwrap();
        let mut emitter = StubEmitter::new();
        let mut streams = PInvokeCodeStreams::new();
        let mut cx = EmitContext::new(&mut emitter, &helpers, &[]);
        marshaller.emit_marshalling(&mut cx, &mut streams).unwrap();
        (streams, emitter)
    }

    fn helpers_in(stream: &crate::assembly::CodeStream) -> Vec<RuntimeHelper> {
        stream
            .instructions()
            .filter_map(|ins| ins.helper().map(|helper| helper.helper))
            .collect()
    }

    #[test]
    fn in_string_is_pinned() {
        let marshaller = argument(MarshalType::String, PInvokeFlags::default(), false, false);
        assert!(marshaller.should_pin_string());
        assert!(!marshaller.cleanup_required());

        let (streams, emitter) = emit(&marshaller);
        assert_eq!(
            helpers_in(&streams.marshalling),
            vec![RuntimeHelper::OffsetToStringData]
        );
        assert!(emitter.locals().iter().any(|local| local.pinned));
        assert!(streams.unmarshalling.is_empty());
    }

    #[test]
    fn by_ref_string_is_copied_and_freed() {
        let marshaller = argument(
            MarshalType::by_ref(MarshalType::String),
            PInvokeFlags::default(),
            false,
            false,
        );
        assert!(!marshaller.should_pin_string());

        let (streams, _) = emit(&marshaller);
        assert_eq!(
            helpers_in(&streams.marshalling),
            vec![RuntimeHelper::StringToUnicodeBuffer]
        );
        assert_eq!(
            helpers_in(&streams.unmarshalling),
            vec![
                RuntimeHelper::UnicodeBufferToString,
                RuntimeHelper::CoTaskMemFree
            ]
        );
    }

    #[test]
    fn ansi_string_passes_conversion_policy() {
        let flags = PInvokeFlags::CHARSET_ANSI | PInvokeFlags::THROW_ON_UNMAPPABLE_CHAR;
        let marshaller = argument(MarshalType::String, flags, false, false);
        assert_eq!(marshaller.kind(), MarshallerKind::AnsiString);

        let (streams, _) = emit(&marshaller);
        let constants: Vec<_> = streams
            .marshalling
            .instructions()
            .filter_map(|ins| match ins.operand {
                Operand::Immediate(Immediate::Int32(value)) => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(constants, vec![0, 1]);
        assert_eq!(
            helpers_in(&streams.unmarshalling),
            vec![RuntimeHelper::CoTaskMemFree]
        );
    }

    #[test]
    fn out_string_builder_skips_copy() {
        let marshaller = argument(MarshalType::StringBuilder, PInvokeFlags::default(), false, true);
        assert!(!marshaller.is_in());
        assert!(marshaller.is_out());

        let (streams, _) = emit(&marshaller);
        let copy_flag = streams
            .marshalling
            .instructions()
            .find(|ins| ins.opcode == Opcode::LdcI4)
            .map(|ins| ins.operand.clone());
        assert_eq!(copy_flag, Some(Operand::Immediate(Immediate::Int32(0))));
        assert_eq!(
            helpers_in(&streams.unmarshalling),
            vec![
                RuntimeHelper::UnicodeBufferToStringBuilder,
                RuntimeHelper::CoTaskMemFree
            ]
        );
    }

    #[test]
    fn ansi_char_round_trip_helpers() {
        let marshaller = argument(
            MarshalType::by_ref(MarshalType::Char),
            PInvokeFlags::CHARSET_ANSI,
            false,
            false,
        );
        assert_eq!(marshaller.kind(), MarshallerKind::AnsiChar);
        assert_eq!(marshaller.native_type(), &MarshalType::U1);

        let (streams, _) = emit(&marshaller);
        assert_eq!(
            helpers_in(&streams.marshalling),
            vec![RuntimeHelper::WideCharToAnsiChar]
        );
        assert_eq!(
            helpers_in(&streams.unmarshalling),
            vec![RuntimeHelper::AnsiCharToWideChar]
        );
    }
}
