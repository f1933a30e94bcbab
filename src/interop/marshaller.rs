//! The marshaller: immutable configuration, the factory, and the emission protocol.
//!
//! A [`Marshaller`] is created once per parameter, return value, array element or struct field
//! of a stub. Its [`MarshallerConfig`] is fixed at creation: the kind, direction, role and the
//! inferred In/Out/by-ref flags. Emission never mutates the marshaller. Each emission pass
//! instead creates a [`Stage`] holding the two [`Home`]s (where the managed and the native value
//! live) and threads it through the phases:
//!
//! ```text
//! forward argument  setup homes
//!                   [by-ref + In]  copy caller value into the managed local
//!                   allocate native (+ transform when In)
//!                   push native argument                         (call-site stream)
//!                   [Out]          allocate managed if needed,
//!                                  transform native -> managed,
//!                                  [by-ref] copy back to caller  (unmarshalling stream)
//!                   cleanup                                      (unmarshalling stream)
//! ```
//!
//! Reverse arguments mirror this with native and managed swapped. Return values, array elements
//! and struct fields use straight-line variants of the same phases. The phases themselves are
//! dispatched on [`MarshallerKind`]; the kind-specific bodies live in the `array`, `string` and
//! `handle` modules.

use std::sync::OnceLock;

use crate::{
    assembly::{CodeStream, Label, LocalId, Opcode, PInvokeCodeStreams, StubEmitter},
    interop::{
        flags::PInvokeFlags,
        helpers::{HelperTable, RuntimeHelper},
        home::Home,
        kind::{classify, MarshalDirection, MarshallerKind, MarshallerRole},
    },
    metadata::{
        marshalling::MarshalAsDescriptor,
        typesystem::{MarshalType, StructDesc},
    },
    Error, Result,
};

/// Everything the factory decided about one marshalled value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshallerConfig {
    /// Primary kind
    pub kind: MarshallerKind,
    /// Element kind for arrays
    pub element_kind: Option<MarshallerKind>,
    /// Argument, element or field
    pub role: MarshallerRole,
    /// Direction of the stub
    pub direction: MarshalDirection,
    /// Declared type with one level of by-ref removed
    pub managed_type: MarshalType,
    /// Declared type as written
    pub managed_parameter_type: MarshalType,
    /// `[MarshalAs]` directive
    pub marshal_as: Option<MarshalAsDescriptor>,
    /// Flags of the enclosing P/Invoke
    pub flags: PInvokeFlags,
    /// 1-based parameter index, 0 for the return value
    pub index: u16,
    /// Value flows into the call
    pub is_in: bool,
    /// Value flows back out of the call
    pub is_out: bool,
    /// This is the return value
    pub is_return: bool,
    /// The managed signature passes the value by reference
    pub managed_by_ref: bool,
    /// The native signature passes the value by reference
    pub native_by_ref: bool,
}

/// One marshalled value of a stub.
#[derive(Debug)]
pub struct Marshaller {
    config: MarshallerConfig,
    native_type: OnceLock<MarshalType>,
}

/// The homes set up by one emission pass.
///
/// `aux` is an extra local some kinds need across phases: the `SafeHandle` whose reference was
/// taken on entry, or the native pointer passed for a layout class.
#[derive(Debug, Clone)]
pub struct Stage {
    pub(crate) managed: Home,
    pub(crate) native: Home,
    pub(crate) aux: Option<LocalId>,
}

impl Stage {
    /// Where the managed value lives.
    #[must_use]
    pub fn managed(&self) -> &Home {
        &self.managed
    }

    /// Where the native value lives.
    #[must_use]
    pub fn native(&self) -> &Home {
        &self.native
    }
}

/// Shared state of one stub emission.
///
/// `marshallers` is the full ordered marshaller list of the stub, return value first. Array
/// marshallers resolve `SizeParamIndex` against it.
pub struct EmitContext<'a> {
    emitter: &'a mut StubEmitter,
    helpers: &'a HelperTable,
    marshallers: &'a [Marshaller],
}

impl<'a> EmitContext<'a> {
    /// Create a context over a stub's emitter, resolved helpers and marshaller list.
    pub fn new(
        emitter: &'a mut StubEmitter,
        helpers: &'a HelperTable,
        marshallers: &'a [Marshaller],
    ) -> Self {
        EmitContext {
            emitter,
            helpers,
            marshallers,
        }
    }

    /// Marshallers of the stub, index 0 being the return value.
    #[must_use]
    pub fn marshallers(&self) -> &'a [Marshaller] {
        self.marshallers
    }

    pub(crate) fn call(&self, stream: &mut CodeStream, helper: RuntimeHelper) {
        stream.emit_call(self.helpers.get(helper));
    }

    pub(crate) fn new_local(&mut self, ty: MarshalType) -> LocalId {
        self.emitter.new_local(ty)
    }

    pub(crate) fn new_pinned_local(&mut self, ty: MarshalType) -> LocalId {
        self.emitter.new_pinned_local(ty)
    }

    pub(crate) fn new_label(&mut self) -> Label {
        self.emitter.new_label()
    }
}

impl Marshaller {
    /// Create the marshaller for a parameter or return value.
    ///
    /// `ty` is the declared type, possibly by-ref. `is_in` and `is_out` are the explicit
    /// `[In]`/`[Out]` attributes; when neither is given, by-ref parameters and string builders
    /// default to In/Out and everything else to In. An explicit Out is dropped for by-value
    /// value types, strings, pointers and function pointers, and for by-value In strings.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dotmarshal::interop::{MarshalDirection, Marshaller, MarshallerRole, PInvokeFlags};
    /// use dotmarshal::MarshalType;
    ///
    /// let m = Marshaller::create(
    ///     &MarshalType::by_ref(MarshalType::I4),
    ///     MarshallerRole::Argument,
    ///     None,
    ///     MarshalDirection::Forward,
    ///     1,
    ///     PInvokeFlags::default(),
    ///     false,
    ///     false,
    ///     false,
    /// );
    /// assert!(m.is_in() && m.is_out());
    /// assert!(m.is_managed_by_ref());
    /// ```
    #[must_use]
    pub fn create(
        ty: &MarshalType,
        role: MarshallerRole,
        marshal_as: Option<&MarshalAsDescriptor>,
        direction: MarshalDirection,
        index: u16,
        flags: PInvokeFlags,
        is_in: bool,
        is_out: bool,
        is_return: bool,
    ) -> Self {
        let classification = classify(ty, marshal_as, is_return, flags.char_set(), role);
        let kind = classification.kind;
        let managed_by_ref = ty.is_by_ref();
        let managed_type = ty.strip_by_ref().clone();

        let mut is_in = is_in;
        let mut is_out = is_out;

        if is_out
            && !managed_by_ref
            && (managed_type.is_value_type()
                || managed_type.is_string()
                || managed_type.is_pointer()
                || managed_type.is_function_pointer())
        {
            is_out = false;
        }

        if !is_in && !is_out {
            is_in = true;
            is_out = managed_by_ref
                || matches!(
                    kind,
                    MarshallerKind::AnsiStringBuilder | MarshallerKind::UnicodeStringBuilder
                );
        }

        if !managed_by_ref
            && is_in
            && matches!(
                kind,
                MarshallerKind::AnsiString | MarshallerKind::UnicodeString
            )
        {
            is_out = false;
        }

        let native_by_ref = managed_by_ref
            || (kind == MarshallerKind::LayoutClass
                && role == MarshallerRole::Argument
                && !is_return);

        log::debug!(
            "marshaller #{index} '{ty}' -> {kind} ({direction}, in={is_in}, out={is_out}, byref={managed_by_ref})"
        );

        Marshaller::from_config(MarshallerConfig {
            kind,
            element_kind: classification.element_kind,
            role,
            direction,
            managed_type,
            managed_parameter_type: ty.clone(),
            marshal_as: marshal_as.cloned(),
            flags,
            index,
            is_in,
            is_out,
            is_return,
            managed_by_ref,
            native_by_ref,
        })
    }

    /// Create a marshaller from an already decided configuration.
    #[must_use]
    pub fn from_config(config: MarshallerConfig) -> Self {
        Marshaller {
            config,
            native_type: OnceLock::new(),
        }
    }

    /// The factory's decisions.
    #[must_use]
    pub fn config(&self) -> &MarshallerConfig {
        &self.config
    }

    /// Marshaller kind.
    #[must_use]
    pub fn kind(&self) -> MarshallerKind {
        self.config.kind
    }

    /// Element kind, for arrays.
    #[must_use]
    pub fn element_kind(&self) -> Option<MarshallerKind> {
        self.config.element_kind
    }

    /// Role.
    #[must_use]
    pub fn role(&self) -> MarshallerRole {
        self.config.role
    }

    /// Direction.
    #[must_use]
    pub fn direction(&self) -> MarshalDirection {
        self.config.direction
    }

    /// Managed type without by-ref.
    #[must_use]
    pub fn managed_type(&self) -> &MarshalType {
        &self.config.managed_type
    }

    /// 1-based parameter index, 0 for the return value.
    #[must_use]
    pub fn index(&self) -> u16 {
        self.config.index
    }

    /// In flag after inference.
    #[must_use]
    pub fn is_in(&self) -> bool {
        self.config.is_in
    }

    /// Out flag after inference.
    #[must_use]
    pub fn is_out(&self) -> bool {
        self.config.is_out
    }

    /// Returns `true` for the return value marshaller.
    #[must_use]
    pub fn is_return(&self) -> bool {
        self.config.is_return
    }

    /// Returns `true` if the managed signature passes the value by reference.
    #[must_use]
    pub fn is_managed_by_ref(&self) -> bool {
        self.config.managed_by_ref
    }

    /// Returns `true` if the native signature passes the value by reference.
    #[must_use]
    pub fn is_native_by_ref(&self) -> bool {
        self.config.native_by_ref
    }

    /// The native representation of the value.
    pub fn native_type(&self) -> &MarshalType {
        self.native_type.get_or_init(|| self.derive_native_type())
    }

    /// The native type as it appears in the native signature: a pointer when the native side is
    /// by-ref.
    #[must_use]
    pub fn native_parameter_type(&self) -> MarshalType {
        if self.config.native_by_ref {
            MarshalType::pointer(self.native_type().clone())
        } else {
            self.native_type().clone()
        }
    }

    /// Returns `false` when the value can cross the boundary unchanged.
    #[must_use]
    pub fn is_marshalling_required(&self) -> bool {
        if self.config.is_out {
            return true;
        }

        !matches!(
            self.config.kind,
            MarshallerKind::Enum
                | MarshallerKind::BlittableValue
                | MarshallerKind::BlittableStruct
                | MarshallerKind::UnicodeChar
                | MarshallerKind::VoidReturn
        )
    }

    fn derive_native_type(&self) -> MarshalType {
        let managed = &self.config.managed_type;
        match self.config.kind {
            MarshallerKind::BlittableValue
            | MarshallerKind::BlittableStruct
            | MarshallerKind::Decimal
            | MarshallerKind::Guid => managed.clone(),
            MarshallerKind::Enum => match managed {
                MarshalType::Enum { underlying, .. } => (**underlying).clone(),
                other => other.clone(),
            },
            MarshallerKind::UnicodeChar => MarshalType::Char,
            MarshallerKind::Bool => MarshalType::I4,
            MarshallerKind::CBool | MarshallerKind::AnsiChar => MarshalType::U1,
            MarshallerKind::AnsiString
            | MarshallerKind::Utf8String
            | MarshallerKind::AnsiStringBuilder => MarshalType::pointer(MarshalType::U1),
            MarshallerKind::UnicodeString | MarshallerKind::UnicodeStringBuilder => {
                MarshalType::pointer(MarshalType::Char)
            }
            MarshallerKind::Array | MarshallerKind::BlittableArray | MarshallerKind::AnsiCharArray => {
                MarshalType::pointer(self.element_marshaller(true).native_type().clone())
            }
            MarshallerKind::BlittableStructPtr => MarshalType::pointer(managed.clone()),
            MarshallerKind::Struct | MarshallerKind::LayoutClass => managed
                .struct_desc()
                .map(|desc| MarshalType::ValueType(self.native_struct(desc)))
                .unwrap_or(MarshalType::I),
            MarshallerKind::VoidReturn => MarshalType::Void,
            _ => MarshalType::I,
        }
    }

    pub(crate) fn not_supported(&self, reason: &'static str) -> Error {
        Error::NotSupported {
            kind: self.config.kind,
            managed_type: self.config.managed_type.name(),
            direction: self.config.direction,
            reason,
        }
    }

    fn check_supported(&self) -> Result<()> {
        let kind = self.config.kind;
        if !kind.is_supported() {
            return Err(self.not_supported("no marshaller exists for this kind"));
        }

        if self.config.direction == MarshalDirection::Reverse
            && self.config.role == MarshallerRole::Argument
            && matches!(
                kind,
                MarshallerKind::SafeHandle
                    | MarshallerKind::HandleRef
                    | MarshallerKind::LayoutClass
                    | MarshallerKind::AnsiStringBuilder
                    | MarshallerKind::UnicodeStringBuilder
            )
        {
            return Err(self.not_supported("reverse marshalling is not implemented for this kind"));
        }

        Ok(())
    }

    /// Emit a parameter or return value into the stub streams.
    ///
    /// Returns the staging record when homes were set up. The return value's stage is needed
    /// later by [`Marshaller::load_return_value`].
    ///
    /// # Errors
    /// [`crate::Error::NotSupported`] if the kind cannot be emitted in this direction,
    /// [`crate::Error::InvalidConfiguration`] for inconsistent size directives or when called
    /// on an element or field marshaller.
    pub fn emit_marshalling(
        &self,
        cx: &mut EmitContext<'_>,
        streams: &mut PInvokeCodeStreams,
    ) -> Result<Option<Stage>> {
        self.check_supported()?;
        if self.config.role != MarshallerRole::Argument {
            return Err(Error::InvalidConfiguration(format!(
                "{} marshaller for '{}' cannot emit stub streams",
                self.config.role, self.config.managed_type
            )));
        }

        log::trace!(
            "emit #{} {} ({})",
            self.config.index,
            self.config.kind,
            self.config.direction
        );

        if self.config.is_return {
            if self.config.kind == MarshallerKind::VoidReturn {
                return Ok(None);
            }
            let stage = match self.config.direction {
                MarshalDirection::Forward => self.emit_forward_return(cx, streams)?,
                MarshalDirection::Reverse => self.emit_reverse_return(cx, streams)?,
            };
            return Ok(Some(stage));
        }

        match self.config.direction {
            MarshalDirection::Forward => self.emit_forward_argument(cx, streams),
            MarshalDirection::Reverse => self.emit_reverse_argument(cx, streams),
        }
    }

    /// Emit an element or field conversion into a single stream.
    ///
    /// The source value is on the stack on entry and the converted value is on the stack on
    /// exit. `is_in` selects managed-to-native; otherwise the conversion is native-to-managed.
    ///
    /// # Errors
    /// [`crate::Error::NotSupported`] if the kind cannot be emitted.
    pub fn emit_element_marshalling(
        &self,
        cx: &mut EmitContext<'_>,
        stream: &mut CodeStream,
    ) -> Result<()> {
        self.check_supported()?;
        let stage = self.setup_local_homes(cx);

        if self.config.is_in {
            stage.managed.store_value(stream)?;
            self.alloc_and_transform_to_native(cx, &stage, stream, true)?;
            stage.native.load_value(stream);
        } else {
            stage.native.store_value(stream)?;
            self.alloc_native_to_managed(cx, &stage, stream)?;
            self.transform_native_to_managed(cx, &stage, stream)?;
            stage.managed.load_value(stream);
        }
        Ok(())
    }

    /// Push the stub's return value: the managed value in forward stubs, the native value in
    /// reverse stubs. Nothing is pushed for `void`.
    ///
    /// # Errors
    /// [`crate::Error::InvalidConfiguration`] if a non-void return value was never staged.
    pub fn load_return_value(&self, stage: Option<&Stage>, stream: &mut CodeStream) -> Result<()> {
        if self.config.kind == MarshallerKind::VoidReturn {
            return Ok(());
        }

        let stage = stage.ok_or_else(|| {
            Error::InvalidConfiguration("return value was not staged".to_string())
        })?;
        match self.config.direction {
            MarshalDirection::Forward => stage.managed.load_value(stream),
            MarshalDirection::Reverse => stage.native.load_value(stream),
        }
        Ok(())
    }

    fn argument_slot(&self) -> u16 {
        self.config.index.saturating_sub(1)
    }

    fn setup_argument_homes(&self, cx: &mut EmitContext<'_>) -> Stage {
        let managed_type = self.config.managed_type.clone();
        let native_type = self.native_type().clone();
        let slot = self.argument_slot();

        let (managed, native) = match self.config.direction {
            MarshalDirection::Forward => {
                let managed = if self.config.managed_by_ref {
                    Home::local(cx.new_local(managed_type.clone()), managed_type, false)
                } else {
                    Home::argument(slot, managed_type, false)
                };
                let native = Home::local(cx.new_local(native_type.clone()), native_type, false);
                (managed, native)
            }
            MarshalDirection::Reverse => {
                let managed = Home::local(cx.new_local(managed_type.clone()), managed_type, false);
                let native = if self.config.native_by_ref {
                    Home::local(cx.new_local(native_type.clone()), native_type, false)
                } else {
                    Home::argument(slot, native_type, false)
                };
                (managed, native)
            }
        };

        Stage {
            managed,
            native,
            aux: self.aux_local(cx),
        }
    }

    fn setup_local_homes(&self, cx: &mut EmitContext<'_>) -> Stage {
        let managed_type = self.config.managed_type.clone();
        let native_type = self.native_type().clone();
        Stage {
            managed: Home::local(cx.new_local(managed_type.clone()), managed_type, false),
            native: Home::local(cx.new_local(native_type.clone()), native_type, false),
            aux: self.aux_local(cx),
        }
    }

    fn aux_local(&self, cx: &mut EmitContext<'_>) -> Option<LocalId> {
        let argument = self.config.role == MarshallerRole::Argument && !self.config.is_return;
        match self.config.kind {
            MarshallerKind::SafeHandle if argument && self.config.is_in => {
                Some(cx.new_local(self.config.managed_type.clone()))
            }
            MarshallerKind::LayoutClass if argument => Some(cx.new_local(MarshalType::I)),
            _ => None,
        }
    }

    /// The caller's by-ref parameter, viewed as a home of the staged value's type.
    fn by_ref_arg_home(&self, staged: &Home) -> Home {
        Home::argument(self.argument_slot(), staged.ty().clone(), true)
    }

    fn propagate_from_by_ref_arg(&self, stream: &mut CodeStream, home: &Home) -> Result<()> {
        self.by_ref_arg_home(home).load_value(stream);
        home.store_value(stream)
    }

    fn propagate_to_by_ref_arg(&self, stream: &mut CodeStream, home: &Home) {
        self.by_ref_arg_home(home).load_address(stream);
        home.load_value(stream);
        stream.emit_stind(home.ty());
    }

    fn emit_forward_argument(
        &self,
        cx: &mut EmitContext<'_>,
        streams: &mut PInvokeCodeStreams,
    ) -> Result<Option<Stage>> {
        if self.passes_through() {
            self.emit_forward_pass_through(cx, streams);
            return Ok(None);
        }

        let stage = self.setup_argument_homes(cx);
        let by_ref = self.config.managed_by_ref;

        if by_ref && self.config.is_in {
            self.propagate_from_by_ref_arg(&mut streams.marshalling, &stage.managed)?;
        }

        if by_ref && !self.config.is_in {
            self.reinit_native_transform(cx, &stage, &mut streams.marshalling)?;
        } else {
            self.alloc_and_transform_to_native(
                cx,
                &stage,
                &mut streams.marshalling,
                self.config.is_in,
            )?;
        }

        self.load_native_arg(&stage, &mut streams.callsite_setup);

        if self.config.is_out {
            if by_ref && !self.config.is_in {
                self.alloc_native_to_managed(cx, &stage, &mut streams.unmarshalling)?;
            }
            self.transform_native_to_managed(cx, &stage, &mut streams.unmarshalling)?;
            if by_ref {
                self.propagate_to_by_ref_arg(&mut streams.unmarshalling, &stage.managed);
            }
        }

        self.emit_cleanup(cx, &stage, &mut streams.unmarshalling)?;
        Ok(Some(stage))
    }

    fn emit_reverse_argument(
        &self,
        cx: &mut EmitContext<'_>,
        streams: &mut PInvokeCodeStreams,
    ) -> Result<Option<Stage>> {
        if self.passes_through() && !self.config.is_out {
            streams.callsite_setup.emit_ldarg(self.argument_slot());
            return Ok(None);
        }

        let stage = self.setup_argument_homes(cx);
        let by_ref = self.config.native_by_ref;

        if by_ref && self.config.is_in {
            self.propagate_from_by_ref_arg(&mut streams.marshalling, &stage.native)?;
        }

        if !by_ref || self.config.is_in {
            self.alloc_native_to_managed(cx, &stage, &mut streams.marshalling)?;
            self.transform_native_to_managed(cx, &stage, &mut streams.marshalling)?;
        }

        if self.config.managed_by_ref {
            stage.managed.load_address(&mut streams.callsite_setup);
        } else {
            stage.managed.load_value(&mut streams.callsite_setup);
        }

        if self.config.is_out {
            if by_ref {
                self.alloc_managed_to_native(cx, &stage, &mut streams.unmarshalling)?;
            }
            self.transform_managed_to_native(cx, &stage, &mut streams.unmarshalling)?;
            if by_ref {
                self.propagate_to_by_ref_arg(&mut streams.unmarshalling, &stage.native);
            }
        }

        Ok(Some(stage))
    }

    fn emit_forward_return(
        &self,
        cx: &mut EmitContext<'_>,
        streams: &mut PInvokeCodeStreams,
    ) -> Result<Stage> {
        let stage = self.setup_local_homes(cx);
        let stream = &mut streams.return_value;

        stage.native.store_value(stream)?;
        self.alloc_native_to_managed(cx, &stage, stream)?;
        self.transform_native_to_managed(cx, &stage, stream)?;

        if matches!(
            self.config.kind,
            MarshallerKind::AnsiString | MarshallerKind::UnicodeString | MarshallerKind::Utf8String
        ) {
            self.emit_free_native(cx, &stage, stream);
        }
        Ok(stage)
    }

    fn emit_reverse_return(
        &self,
        cx: &mut EmitContext<'_>,
        streams: &mut PInvokeCodeStreams,
    ) -> Result<Stage> {
        let stage = self.setup_local_homes(cx);
        let stream = &mut streams.return_value;

        stage.managed.store_value(stream)?;
        self.alloc_and_transform_to_native(cx, &stage, stream, true)?;
        Ok(stage)
    }

    /// Kinds whose by-value arguments are passed without any conversion.
    fn passes_through(&self) -> bool {
        matches!(
            self.config.kind,
            MarshallerKind::BlittableValue
                | MarshallerKind::BlittableStruct
                | MarshallerKind::Enum
                | MarshallerKind::UnicodeChar
                | MarshallerKind::Decimal
                | MarshallerKind::Guid
        )
    }

    /// By-value blittable arguments are loaded as is; by-ref ones pin the caller's location and
    /// pass its address.
    fn emit_forward_pass_through(&self, cx: &mut EmitContext<'_>, streams: &mut PInvokeCodeStreams) {
        let slot = self.argument_slot();
        if !self.config.native_by_ref {
            streams.callsite_setup.emit_ldarg(slot);
            return;
        }

        let native = cx.new_local(MarshalType::I);
        let pinned = cx.new_pinned_local(self.config.managed_parameter_type.clone());
        let stream = &mut streams.marshalling;
        stream.emit_ldarg(slot);
        stream.emit_stloc(pinned);
        stream.emit_ldloc(pinned);
        stream.emit(Opcode::ConvI);
        stream.emit_stloc(native);
        streams.callsite_setup.emit_ldloc(native);
    }

    fn load_native_arg(&self, stage: &Stage, stream: &mut CodeStream) {
        match (self.config.kind, stage.aux) {
            (MarshallerKind::LayoutClass, Some(pointer)) => stream.emit_ldloc(pointer),
            _ if self.config.native_by_ref => stage.native.load_address(stream),
            _ => stage.native.load_value(stream),
        }
    }

    pub(crate) fn alloc_and_transform_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
        copy: bool,
    ) -> Result<()> {
        if self.config.kind == MarshallerKind::BlittableArray {
            return self.blittable_array_to_native(cx, stage, stream);
        }

        self.alloc_managed_to_native(cx, stage, stream)?;
        if copy {
            self.transform_managed_to_native(cx, stage, stream)?;
        }
        Ok(())
    }

    fn alloc_managed_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        match self.config.kind {
            MarshallerKind::Array | MarshallerKind::BlittableArray | MarshallerKind::AnsiCharArray => {
                self.array_alloc_to_native(cx, stage, stream)
            }
            MarshallerKind::AnsiStringBuilder | MarshallerKind::UnicodeStringBuilder => {
                self.string_builder_to_native(cx, stage, stream)
            }
            _ => Ok(()),
        }
    }

    fn transform_managed_to_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        match self.config.kind {
            MarshallerKind::Array | MarshallerKind::BlittableArray | MarshallerKind::AnsiCharArray => {
                self.array_transform_to_native(cx, stage, stream)
            }
            MarshallerKind::Bool | MarshallerKind::CBool => {
                stage.managed.load_value(stream);
                emit_normalize_bool(stream);
                stage.native.store_value(stream)
            }
            MarshallerKind::AnsiChar => self.ansi_char_to_native(cx, stage, stream),
            MarshallerKind::UnicodeString => self.unicode_string_to_native(cx, stage, stream),
            MarshallerKind::AnsiString | MarshallerKind::Utf8String => {
                self.narrow_string_to_native(cx, stage, stream)
            }
            MarshallerKind::AnsiStringBuilder | MarshallerKind::UnicodeStringBuilder => Ok(()),
            MarshallerKind::BlittableStructPtr => {
                if self.config.is_out {
                    return Err(self.not_supported("LPStruct out marshalling"));
                }
                stage.managed.load_address(stream);
                stream.emit(Opcode::ConvI);
                stage.native.store_value(stream)
            }
            MarshallerKind::SafeHandle => self.safe_handle_to_native(cx, stage, stream),
            MarshallerKind::CriticalHandle => self.critical_handle_to_native(cx, stage, stream),
            MarshallerKind::HandleRef => self.handle_ref_to_native(stage, stream),
            MarshallerKind::FunctionPointer => self.delegate_to_native(cx, stage, stream),
            MarshallerKind::Struct => self.struct_to_native(cx, stage, stream),
            MarshallerKind::LayoutClass => self.layout_class_to_native(cx, stage, stream),
            _ => {
                stage.managed.load_value(stream);
                stage.native.store_value(stream)
            }
        }
    }

    fn reinit_native_transform(
        &self,
        _cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        match self.config.kind {
            MarshallerKind::BlittableArray => {
                stream.emit_ldc(0);
                stream.emit(Opcode::ConvU);
                stage.native.store_value(stream)
            }
            MarshallerKind::LayoutClass => {
                if let Some(pointer) = stage.aux {
                    stage.native.load_address(stream);
                    stream.emit(Opcode::ConvI);
                    stream.emit_stloc(pointer);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn alloc_native_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        match self.config.kind {
            MarshallerKind::Array | MarshallerKind::BlittableArray | MarshallerKind::AnsiCharArray => {
                self.array_alloc_to_managed(cx, stage, stream)
            }
            MarshallerKind::LayoutClass => {
                stream.emit_type(Opcode::Newobj, &self.config.managed_type);
                stage.managed.store_value(stream)
            }
            _ => Ok(()),
        }
    }

    fn transform_native_to_managed(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        match self.config.kind {
            MarshallerKind::Array | MarshallerKind::AnsiCharArray => {
                self.array_transform_to_managed(cx, stage, stream)
            }
            MarshallerKind::BlittableArray => {
                let reverse_argument = self.config.direction == MarshalDirection::Reverse
                    && self.config.role == MarshallerRole::Argument;
                if (self.config.managed_by_ref && !self.config.is_in) || reverse_argument {
                    self.array_transform_to_managed(cx, stage, stream)?;
                }
                Ok(())
            }
            MarshallerKind::Bool | MarshallerKind::CBool => {
                stage.native.load_value(stream);
                emit_normalize_bool(stream);
                stage.managed.store_value(stream)
            }
            MarshallerKind::AnsiChar => self.ansi_char_to_managed(cx, stage, stream),
            MarshallerKind::UnicodeString
            | MarshallerKind::AnsiString
            | MarshallerKind::Utf8String => self.string_to_managed(cx, stage, stream),
            MarshallerKind::AnsiStringBuilder | MarshallerKind::UnicodeStringBuilder => {
                self.string_builder_to_managed(cx, stage, stream);
                Ok(())
            }
            MarshallerKind::BlittableStructPtr => {
                Err(self.not_supported("LPStruct out marshalling"))
            }
            MarshallerKind::SafeHandle => self.safe_handle_to_managed(cx, stage, stream),
            MarshallerKind::CriticalHandle => self.critical_handle_to_managed(cx, stage, stream),
            MarshallerKind::HandleRef => Ok(()),
            MarshallerKind::FunctionPointer => self.delegate_to_managed(cx, stage, stream),
            MarshallerKind::Struct => self.struct_to_managed(cx, stage, stream),
            MarshallerKind::LayoutClass => self.layout_class_to_managed(cx, stage, stream),
            _ => {
                stage.native.load_value(stream);
                stage.managed.store_value(stream)
            }
        }
    }

    fn emit_cleanup(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) -> Result<()> {
        match self.config.kind {
            MarshallerKind::Array | MarshallerKind::AnsiCharArray => {
                self.array_cleanup(cx, stage, stream)
            }
            MarshallerKind::BlittableArray if self.config.managed_by_ref && !self.config.is_in => {
                self.array_cleanup(cx, stage, stream)
            }
            MarshallerKind::UnicodeString if self.should_pin_string() => Ok(()),
            MarshallerKind::UnicodeString
            | MarshallerKind::AnsiString
            | MarshallerKind::Utf8String
            | MarshallerKind::AnsiStringBuilder
            | MarshallerKind::UnicodeStringBuilder => {
                self.emit_free_native(cx, stage, stream);
                Ok(())
            }
            MarshallerKind::SafeHandle => {
                self.safe_handle_cleanup(cx, stage, stream);
                Ok(())
            }
            MarshallerKind::Struct | MarshallerKind::LayoutClass => {
                self.struct_cleanup(cx, stage, stream)
            }
            _ => Ok(()),
        }
    }

    /// Returns `true` if a converted element or field owns native memory that must be released
    /// after the call.
    #[must_use]
    pub fn cleanup_required(&self) -> bool {
        match self.config.kind {
            MarshallerKind::UnicodeString => !self.should_pin_string(),
            MarshallerKind::AnsiString | MarshallerKind::Utf8String => true,
            MarshallerKind::Struct | MarshallerKind::LayoutClass => self.fields_need_cleanup(),
            _ => false,
        }
    }

    /// Release the native element value on top of the stack.
    ///
    /// # Errors
    /// Propagates errors from nested field marshallers.
    pub fn emit_element_cleanup(
        &self,
        cx: &mut EmitContext<'_>,
        stream: &mut CodeStream,
    ) -> Result<()> {
        match self.config.kind {
            MarshallerKind::UnicodeString
            | MarshallerKind::AnsiString
            | MarshallerKind::Utf8String => {
                self.emit_free_element(cx, stream);
                Ok(())
            }
            MarshallerKind::Struct | MarshallerKind::LayoutClass => {
                self.struct_element_cleanup(cx, stream)
            }
            _ => {
                stream.emit(Opcode::Pop);
                Ok(())
            }
        }
    }

    /// `if (native != null) CoTaskMemFree(native)`
    pub(crate) fn emit_free_native(
        &self,
        cx: &mut EmitContext<'_>,
        stage: &Stage,
        stream: &mut CodeStream,
    ) {
        let skip = cx.new_label();
        stage.native.load_value(stream);
        stream.emit_branch(Opcode::Brfalse, skip);
        stage.native.load_value(stream);
        cx.call(stream, RuntimeHelper::CoTaskMemFree);
        stream.emit_label(skip);
    }

    pub(crate) fn native_struct(&self, desc: &StructDesc) -> std::sync::Arc<StructDesc> {
        let mut native = StructDesc::sequential(&format!("__Native_{}", desc.name));
        for field in &desc.fields {
            let marshaller = self.field_marshaller(field, true);
            native = native.field(&field.name, marshaller.native_type().clone());
        }
        native.build()
    }
}

/// `value == 0 == 0`: collapse any non-zero value to 1.
fn emit_normalize_bool(stream: &mut CodeStream) {
    stream.emit_ldc(0);
    stream.emit(Opcode::Ceq);
    stream.emit_ldc(0);
    stream.emit(Opcode::Ceq);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Operand,
        interop::{helpers::DefaultHelperResolver, MarshalDirection::*},
        metadata::marshalling::NativeType,
    };

    fn argument(ty: MarshalType, is_in: bool, is_out: bool) -> Marshaller {
        Marshaller::create(
            &ty,
            MarshallerRole::Argument,
            None,
            Forward,
            1,
            PInvokeFlags::default(),
            is_in,
            is_out,
            false,
        )
    }

    fn emit(marshaller: &Marshaller) -> Result<PInvokeCodeStreams> {
        let helpers = HelperTable::resolve_all(&DefaultHelperResolver)?;
        let mut emitter = StubEmitter::new();
        let mut streams = PInvokeCodeStreams::new();
        let mut cx = EmitContext::new(&mut emitter, &helpers, &[]);
        marshaller.emit_marshalling(&mut cx, &mut streams)?;
        Ok(streams)
    }

    fn opcodes(stream: &CodeStream) -> Vec<Opcode> {
        stream.instructions().map(|ins| ins.opcode).collect()
    }

    #[test]
    fn default_in_out_inference() {
        let plain = argument(MarshalType::I4, false, false);
        assert!(plain.is_in());
        assert!(!plain.is_out());

        let by_ref = argument(MarshalType::by_ref(MarshalType::I4), false, false);
        assert!(by_ref.is_in());
        assert!(by_ref.is_out());

        let builder = argument(MarshalType::StringBuilder, false, false);
        assert!(builder.is_in() && builder.is_out());

        let array = argument(MarshalType::sz_array(MarshalType::I4), false, false);
        assert!(array.is_in() && !array.is_out());
    }

    #[test]
    fn meaningless_out_is_dropped() {
        let value = argument(MarshalType::I4, false, true);
        assert!(!value.is_out());
        assert!(value.is_in());

        let text = argument(MarshalType::String, true, true);
        assert!(!text.is_out());

        let array = argument(MarshalType::sz_array(MarshalType::I4), true, true);
        assert!(array.is_out());

        let by_ref_text = argument(MarshalType::by_ref(MarshalType::String), false, true);
        assert!(by_ref_text.is_out());
        assert!(!by_ref_text.is_in());
    }

    #[test]
    fn native_types() {
        assert_eq!(
            argument(MarshalType::Boolean, false, false).native_type(),
            &MarshalType::I4
        );
        assert_eq!(
            argument(MarshalType::String, false, false).native_type(),
            &MarshalType::pointer(MarshalType::Char)
        );
        assert_eq!(
            argument(MarshalType::sz_array(MarshalType::Boolean), false, false).native_type(),
            &MarshalType::pointer(MarshalType::I4)
        );
        assert_eq!(
            argument(MarshalType::enumeration("Color", MarshalType::U2), false, false)
                .native_type(),
            &MarshalType::U2
        );

        let by_ref = argument(MarshalType::by_ref(MarshalType::I8), false, false);
        assert_eq!(
            by_ref.native_parameter_type(),
            MarshalType::pointer(MarshalType::I8)
        );
    }

    #[test]
    fn native_struct_replaces_field_types() {
        let desc = StructDesc::sequential("Person")
            .field("Name", MarshalType::String)
            .field("Alive", MarshalType::Boolean)
            .field("Age", MarshalType::I4)
            .build();
        let marshaller = argument(MarshalType::ValueType(desc), false, false);
        assert_eq!(marshaller.kind(), MarshallerKind::Struct);

        let native = marshaller.native_type();
        let native_desc = native.struct_desc().unwrap();
        assert_eq!(native_desc.name, "__Native_Person");
        assert_eq!(
            native_desc.fields[0].ty,
            MarshalType::pointer(MarshalType::Char)
        );
        assert_eq!(native_desc.fields[1].ty, MarshalType::I4);
        assert_eq!(native_desc.fields[2].ty, MarshalType::I4);
        assert!(marshaller.cleanup_required());
    }

    #[test]
    fn marshalling_required() {
        assert!(!argument(MarshalType::I4, false, false).is_marshalling_required());
        assert!(argument(MarshalType::by_ref(MarshalType::I4), false, false).is_marshalling_required());
        assert!(argument(MarshalType::String, false, false).is_marshalling_required());
    }

    #[test]
    fn invalid_kind_fails_emission() {
        let marshaller = argument(MarshalType::Object, false, false);
        let err = emit(&marshaller).unwrap_err();
        match err {
            Error::NotSupported {
                kind,
                managed_type,
                direction,
                ..
            } => {
                assert_eq!(kind, MarshallerKind::Variant);
                assert_eq!(managed_type, "object");
                assert_eq!(direction, Forward);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn blittable_value_passes_straight_through() {
        let streams = emit(&argument(MarshalType::I4, false, false)).unwrap();
        assert!(streams.marshalling.is_empty());
        assert!(streams.unmarshalling.is_empty());
        assert_eq!(opcodes(&streams.callsite_setup), vec![Opcode::Ldarg]);
    }

    #[test]
    fn blittable_by_ref_pins_caller_location() {
        let streams = emit(&argument(MarshalType::by_ref(MarshalType::I4), false, false)).unwrap();
        assert_eq!(
            opcodes(&streams.marshalling),
            vec![
                Opcode::Ldarg,
                Opcode::Stloc,
                Opcode::Ldloc,
                Opcode::ConvI,
                Opcode::Stloc
            ]
        );
        assert_eq!(opcodes(&streams.callsite_setup), vec![Opcode::Ldloc]);
    }

    #[test]
    fn by_ref_values_are_staged_through_a_local() {
        let streams =
            emit(&argument(MarshalType::by_ref(MarshalType::Boolean), false, false)).unwrap();

        let marshalling = opcodes(&streams.marshalling);
        assert_eq!(&marshalling[..3], &[Opcode::Ldarg, Opcode::Ldobj, Opcode::Stloc]);

        assert_eq!(opcodes(&streams.callsite_setup), vec![Opcode::Ldloca]);

        let unmarshalling = opcodes(&streams.unmarshalling);
        let tail = &unmarshalling[unmarshalling.len() - 3..];
        assert_eq!(tail, &[Opcode::Ldarg, Opcode::Ldloc, Opcode::Stobj]);
    }

    #[test]
    fn reverse_by_ref_values_are_staged_through_a_local() {
        let marshaller = Marshaller::create(
            &MarshalType::by_ref(MarshalType::Boolean),
            MarshallerRole::Argument,
            None,
            Reverse,
            1,
            PInvokeFlags::default(),
            false,
            false,
            false,
        );
        let streams = emit(&marshaller).unwrap();

        let marshalling: Vec<_> = streams.marshalling.instructions().collect();
        assert_eq!(marshalling[0].opcode, Opcode::Ldarg);
        assert_eq!(marshalling[0].operand, Operand::Argument(0));
        assert_eq!(marshalling[1].opcode, Opcode::Ldobj);
        assert_eq!(marshalling[2].opcode, Opcode::Stloc);

        assert_eq!(opcodes(&streams.callsite_setup), vec![Opcode::Ldloca]);

        let unmarshalling = opcodes(&streams.unmarshalling);
        let tail = &unmarshalling[unmarshalling.len() - 3..];
        assert_eq!(tail, &[Opcode::Ldarg, Opcode::Ldloc, Opcode::Stobj]);
    }

    #[test]
    fn bool_is_normalized() {
        let streams = emit(&argument(MarshalType::Boolean, false, false)).unwrap();
        assert_eq!(
            opcodes(&streams.marshalling),
            vec![
                Opcode::Ldarg,
                Opcode::LdcI4,
                Opcode::Ceq,
                Opcode::LdcI4,
                Opcode::Ceq,
                Opcode::Stloc
            ]
        );
    }

    #[test]
    fn void_return_emits_nothing() {
        let marshaller = Marshaller::create(
            &MarshalType::Void,
            MarshallerRole::Argument,
            None,
            Forward,
            0,
            PInvokeFlags::default(),
            false,
            false,
            true,
        );
        assert_eq!(marshaller.kind(), MarshallerKind::VoidReturn);

        let helpers = HelperTable::resolve_all(&DefaultHelperResolver).unwrap();
        let mut emitter = StubEmitter::new();
        let mut streams = PInvokeCodeStreams::new();
        let mut cx = EmitContext::new(&mut emitter, &helpers, &[]);
        let stage = marshaller.emit_marshalling(&mut cx, &mut streams).unwrap();
        assert!(stage.is_none());
        assert!(streams.return_value.is_empty());

        let mut stream = CodeStream::new();
        marshaller.load_return_value(None, &mut stream).unwrap();
        assert!(stream.is_empty());
    }

    #[test]
    fn lpstruct_out_is_not_supported() {
        let point = StructDesc::sequential("Point")
            .field("X", MarshalType::I4)
            .build();
        let descriptor = MarshalAsDescriptor::new(NativeType::LPStruct);
        let marshaller = Marshaller::create(
            &MarshalType::by_ref(MarshalType::ValueType(point)),
            MarshallerRole::Argument,
            Some(&descriptor),
            Forward,
            1,
            PInvokeFlags::default(),
            false,
            false,
            false,
        );
        assert_eq!(marshaller.kind(), MarshallerKind::BlittableStructPtr);
        assert!(matches!(emit(&marshaller), Err(Error::NotSupported { .. })));
    }

    #[test]
    fn reverse_safe_handle_is_not_supported() {
        let marshaller = Marshaller::create(
            &MarshalType::SafeHandle("FileHandle".into()),
            MarshallerRole::Argument,
            None,
            Reverse,
            1,
            PInvokeFlags::default(),
            false,
            false,
            false,
        );
        assert!(matches!(emit(&marshaller), Err(Error::NotSupported { .. })));
    }

    #[test]
    fn string_return_frees_native_buffer() {
        let marshaller = Marshaller::create(
            &MarshalType::String,
            MarshallerRole::Argument,
            None,
            Forward,
            0,
            PInvokeFlags::default(),
            false,
            false,
            true,
        );
        let streams = emit(&marshaller).unwrap();
        let helpers: Vec<_> = streams
            .return_value
            .instructions()
            .filter_map(|ins| match &ins.operand {
                Operand::Helper(helper) => Some(helper.helper),
                _ => None,
            })
            .collect();
        assert_eq!(
            helpers,
            vec![
                RuntimeHelper::UnicodeBufferToString,
                RuntimeHelper::CoTaskMemFree
            ]
        );
    }
}
