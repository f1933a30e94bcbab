//! Whole-stub assembly.
//!
//! [`PInvokeStubBuilder`] turns a [`PInvokeMethod`] description into a linked [`StubBody`].
//! One marshaller is created per value (the return value at index 0, parameters from 1), each
//! emits into the shared [`PInvokeCodeStreams`] in declaration order, and the streams are
//! concatenated around the wrapped call:
//!
//! ```text
//! marshalling
//! callsite_setup
//! call target
//! return_value
//! unmarshalling
//! load return value; ret
//! ```
//!
//! # Examples
//!
//! ```rust
//! use dotmarshal::prelude::*;
//!
//! let builder = PInvokeStubBuilder::new(&DefaultHelperResolver)?;
//!
//! // int puts(string text), CharSet.Ansi
//! let method = PInvokeMethod::new("puts", MarshalType::I4)
//!     .flags(PInvokeFlags::CHARSET_ANSI)
//!     .parameter(PInvokeParameter::new(MarshalType::String));
//!
//! let stub = builder.build(&method)?;
//! assert!(stub.calls_helper(RuntimeHelper::StringToAnsiString));
//! assert!(stub.calls_helper(RuntimeHelper::CoTaskMemFree));
//! # Ok::<(), dotmarshal::Error>(())
//! ```

use rayon::prelude::*;

use crate::{
    assembly::{CallSite, CodeStream, Opcode, PInvokeCodeStreams, StubBody, StubEmitter},
    interop::{
        flags::PInvokeFlags,
        helpers::{HelperResolver, HelperTable},
        kind::{MarshalDirection, MarshallerRole},
        marshaller::{EmitContext, Marshaller},
    },
    metadata::{marshalling::MarshalAsDescriptor, token::Token, typesystem::MarshalType},
    Error, Result,
};

/// Default call target when none is given: the first `MethodDef`.
const DEFAULT_TARGET: u32 = 0x0600_0001;

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PInvokeParameter {
    /// Declared type, `ByRef` for `ref`/`out` parameters
    pub ty: MarshalType,
    /// `[MarshalAs]` directive
    pub marshal_as: Option<MarshalAsDescriptor>,
    /// Explicit `[In]`
    pub is_in: bool,
    /// Explicit `[Out]`
    pub is_out: bool,
}

impl PInvokeParameter {
    /// A parameter without attributes.
    #[must_use]
    pub fn new(ty: MarshalType) -> Self {
        PInvokeParameter {
            ty,
            marshal_as: None,
            is_in: false,
            is_out: false,
        }
    }

    /// `[In, Out]`
    #[must_use]
    pub fn in_out(mut self) -> Self {
        self.is_in = true;
        self.is_out = true;
        self
    }

    /// `[In]`
    #[must_use]
    pub fn input(mut self) -> Self {
        self.is_in = true;
        self
    }

    /// `[Out]`
    #[must_use]
    pub fn out(mut self) -> Self {
        self.is_out = true;
        self
    }

    /// Attach a `[MarshalAs]` directive.
    #[must_use]
    pub fn with_marshal_as(mut self, marshal_as: MarshalAsDescriptor) -> Self {
        self.marshal_as = Some(marshal_as);
        self
    }
}

/// A platform invoke (or reverse platform invoke) signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PInvokeMethod {
    /// Method name, used for the stub and diagnostics
    pub name: String,
    /// Declared return type
    pub return_type: MarshalType,
    /// `[return: MarshalAs]` directive
    pub return_marshal_as: Option<MarshalAsDescriptor>,
    /// Parameters in declaration order
    pub parameters: Vec<PInvokeParameter>,
    /// `ImplMap` flags
    pub flags: PInvokeFlags,
    /// Forward for P/Invoke, reverse for callbacks into managed code
    pub direction: MarshalDirection,
    /// The wrapped call
    pub target: Token,
}

impl PInvokeMethod {
    /// A forward method with default flags and no parameters.
    #[must_use]
    pub fn new(name: &str, return_type: MarshalType) -> Self {
        PInvokeMethod {
            name: name.to_string(),
            return_type,
            return_marshal_as: None,
            parameters: Vec::new(),
            flags: PInvokeFlags::default(),
            direction: MarshalDirection::Forward,
            target: Token::new(DEFAULT_TARGET),
        }
    }

    /// Append a parameter.
    #[must_use]
    pub fn parameter(mut self, parameter: PInvokeParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    /// Replace the flags.
    #[must_use]
    pub fn flags(mut self, flags: PInvokeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the direction.
    #[must_use]
    pub fn direction(mut self, direction: MarshalDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Set the token of the wrapped call.
    #[must_use]
    pub fn target(mut self, target: Token) -> Self {
        self.target = target;
        self
    }

    /// Attach a `[return: MarshalAs]` directive.
    #[must_use]
    pub fn returns_marshal_as(mut self, marshal_as: MarshalAsDescriptor) -> Self {
        self.return_marshal_as = Some(marshal_as);
        self
    }

    /// Create the marshallers of this method, return value first.
    ///
    /// # Errors
    /// [`crate::Error::InvalidConfiguration`] if the method has more parameters than a stub
    /// can address.
    pub fn marshallers(&self) -> Result<Vec<Marshaller>> {
        let mut marshallers = Vec::with_capacity(self.parameters.len() + 1);
        marshallers.push(Marshaller::create(
            &self.return_type,
            MarshallerRole::Argument,
            self.return_marshal_as.as_ref(),
            self.direction,
            0,
            self.flags,
            false,
            false,
            true,
        ));

        for (position, parameter) in self.parameters.iter().enumerate() {
            let index = u16::try_from(position + 1).map_err(|_| {
                Error::InvalidConfiguration(format!("'{}' has too many parameters", self.name))
            })?;
            marshallers.push(Marshaller::create(
                &parameter.ty,
                MarshallerRole::Argument,
                parameter.marshal_as.as_ref(),
                self.direction,
                index,
                self.flags,
                parameter.is_in,
                parameter.is_out,
                false,
            ));
        }
        Ok(marshallers)
    }
}

/// Builds linked stubs for [`PInvokeMethod`]s.
#[derive(Debug, Clone)]
pub struct PInvokeStubBuilder {
    helpers: HelperTable,
}

impl PInvokeStubBuilder {
    /// Create a builder, resolving every runtime helper through `resolver`.
    ///
    /// # Errors
    /// [`crate::Error::HelperNotFound`] if the resolver cannot map a helper.
    pub fn new(resolver: &dyn HelperResolver) -> Result<Self> {
        Ok(PInvokeStubBuilder {
            helpers: HelperTable::resolve_all(resolver)?,
        })
    }

    /// The resolved helpers.
    #[must_use]
    pub fn helpers(&self) -> &HelperTable {
        &self.helpers
    }

    /// Returns `false` when every value crosses the boundary unchanged, so the target can be
    /// called directly.
    #[must_use]
    pub fn requires_stub(&self, method: &PInvokeMethod) -> bool {
        method.marshallers().map_or(true, |marshallers| {
            marshallers.iter().any(Marshaller::is_marshalling_required)
        })
    }

    /// Generate and link the stub for `method`.
    ///
    /// # Errors
    /// Any emission error of the method's marshallers, see [`Marshaller::emit_marshalling`].
    pub fn build(&self, method: &PInvokeMethod) -> Result<StubBody> {
        let marshallers = method.marshallers()?;
        let mut emitter = StubEmitter::new();
        let mut streams = PInvokeCodeStreams::new();
        let mut tail = CodeStream::new();

        {
            let mut cx = EmitContext::new(&mut emitter, &self.helpers, &marshallers);
            let mut return_stage = None;
            for marshaller in &marshallers {
                let stage = marshaller.emit_marshalling(&mut cx, &mut streams)?;
                if marshaller.is_return() {
                    return_stage = stage;
                }
            }
            marshallers[0].load_return_value(return_stage.as_ref(), &mut tail)?;
        }
        tail.emit(Opcode::Ret);

        let arg_count = u16::try_from(method.parameters.len()).map_err(|_| {
            Error::InvalidConfiguration(format!("'{}' has too many parameters", method.name))
        })?;

        let mut call = CodeStream::new();
        call.emit_call_site(CallSite {
            target: method.target,
            arg_count,
            returns_value: method.return_type != MarshalType::Void,
        });

        let PInvokeCodeStreams {
            marshalling,
            callsite_setup,
            return_value,
            unmarshalling,
        } = streams;

        let body = StubBody::link(
            &method.name,
            vec![
                marshalling,
                callsite_setup,
                call,
                return_value,
                unmarshalling,
                tail,
            ],
            emitter.into_locals(),
            arg_count,
        )?;

        log::debug!(
            "built {} stub '{}': {} instructions, {} locals",
            method.direction,
            method.name,
            body.instructions().len(),
            body.locals().len()
        );
        Ok(body)
    }

    /// Build stubs for independent methods in parallel. Results are in input order.
    pub fn compile_all(&self, methods: &[PInvokeMethod]) -> Vec<Result<StubBody>> {
        methods.par_iter().map(|method| self.build(method)).collect()
    }
}
