//! Stub instruction interpreter.
//!
//! [`StubInterpreter`] executes a linked [`StubBody`] against a [`StubRuntime`]. The wrapped
//! call is delegated to a caller-supplied closure: it receives the runtime and the arguments
//! the stub pushed for the call site, and returns the call's result. For a forward stub the
//! closure plays the native function, for a reverse stub the managed target.
//!
//! Execution is a plain fetch/dispatch loop over instruction indices. Every step counts against
//! [`EmulationLimits::max_instructions`](crate::emulation::EmulationLimits::max_instructions).

mod handlers;
#[cfg(test)]
mod tests;

use crate::{
    assembly::{Immediate, Instruction, Opcode, Operand, StubBody},
    emulation::{EmulationError, ManagedPtr, StubRuntime, StubValue},
    metadata::typesystem::MarshalType,
    Result,
};

use handlers::{BinaryOp, CompareOp, ConversionType};

/// What the dispatch loop does after an instruction.
#[derive(Debug, Clone, PartialEq)]
enum StepResult {
    /// Fall through to the next instruction
    Continue,
    /// Jump to an instruction index
    Branch(usize),
    /// Leave the stub with an optional value
    Return(Option<StubValue>),
}

/// The evaluation stack.
#[derive(Debug, Default)]
struct EvalStack {
    values: Vec<StubValue>,
}

impl EvalStack {
    fn push(&mut self, value: StubValue) {
        self.values.push(value);
    }

    fn pop(&mut self) -> Result<StubValue> {
        self.values
            .pop()
            .ok_or_else(|| EmulationError::StackUnderflow.into())
    }

    /// Pop `count` values, returned in push order.
    fn pop_n(&mut self, count: usize) -> Result<Vec<StubValue>> {
        if self.values.len() < count {
            return Err(EmulationError::StackUnderflow.into());
        }
        Ok(self.values.split_off(self.values.len() - count))
    }

    fn peek(&self) -> Result<&StubValue> {
        self.values
            .last()
            .ok_or_else(|| EmulationError::StackUnderflow.into())
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

/// The wrapped call: runtime and call-site arguments in, optional result out.
type Callee<'c> = dyn FnMut(&mut StubRuntime, &[StubValue]) -> Result<Option<StubValue>> + 'c;

/// Interpreter for one linked stub.
///
/// # Examples
///
/// ```rust
/// use dotmarshal::prelude::*;
/// use dotmarshal::emulation::{StubInterpreter, StubRuntime, StubValue};
///
/// // int strlen_w(string text)
/// let builder = PInvokeStubBuilder::new(&DefaultHelperResolver)?;
/// let method = PInvokeMethod::new("strlen_w", MarshalType::I4)
///     .parameter(PInvokeParameter::new(MarshalType::String));
/// let stub = builder.build(&method)?;
///
/// let mut runtime = StubRuntime::new();
/// let text = runtime.new_string("hello");
///
/// let result = StubInterpreter::new(&stub).run(&mut runtime, vec![text], |rt, args| {
///     let address = args[0].as_i64("strlen_w")?;
///     let length = rt.read_utf16(address)?.chars().count();
///     Ok(Some(StubValue::I4(length as i32)))
/// })?;
/// assert_eq!(result, Some(StubValue::I4(5)));
/// # Ok::<(), dotmarshal::Error>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct StubInterpreter<'a> {
    body: &'a StubBody,
}

impl<'a> StubInterpreter<'a> {
    /// Create an interpreter for `body`.
    #[must_use]
    pub fn new(body: &'a StubBody) -> Self {
        StubInterpreter { body }
    }

    /// The stub being executed.
    #[must_use]
    pub fn body(&self) -> &'a StubBody {
        self.body
    }

    /// Execute the stub once.
    ///
    /// `args` are the stub's own arguments: managed values for a forward stub, native values
    /// for a reverse one. `ref`/`out` parameters take a managed pointer, usually a cell from
    /// [`StubRuntime::new_cell`].
    ///
    /// # Errors
    /// [`EmulationError::ArgumentCountMismatch`] if `args` does not match the stub, any fault
    /// raised while executing, or an error returned by `callee`.
    pub fn run<F>(
        &self,
        runtime: &mut StubRuntime,
        args: Vec<StubValue>,
        mut callee: F,
    ) -> Result<Option<StubValue>>
    where
        F: FnMut(&mut StubRuntime, &[StubValue]) -> Result<Option<StubValue>>,
    {
        let expected = usize::from(self.body.arg_count());
        if args.len() != expected {
            return Err(EmulationError::ArgumentCountMismatch {
                expected,
                found: args.len(),
            }
            .into());
        }

        log::debug!(
            "running stub '{}' ({} instructions)",
            self.body.name(),
            self.body.instructions().len()
        );

        let local_types = self
            .body
            .locals()
            .iter()
            .map(|local| local.ty.clone())
            .collect();
        let saved = runtime.enter_frame(args, local_types);
        let result = self.execute(runtime, &mut callee);
        runtime.leave_frame(saved);

        if let Err(error) = &result {
            log::debug!("stub '{}' failed: {error}", self.body.name());
        }
        result
    }

    fn execute(&self, runtime: &mut StubRuntime, callee: &mut Callee<'_>) -> Result<Option<StubValue>> {
        let instructions = self.body.instructions();
        let limit = runtime.limits().max_instructions;
        let mut stack = EvalStack::default();
        let mut executed: u64 = 0;
        let mut ip = 0;

        loop {
            let instruction = instructions
                .get(ip)
                .ok_or(EmulationError::InvalidInstructionPointer { offset: ip })?;

            executed += 1;
            if limit != 0 && executed > limit {
                return Err(EmulationError::InstructionLimitExceeded { executed, limit }.into());
            }

            match Self::step(runtime, &mut stack, instruction, callee)? {
                StepResult::Continue => ip += 1,
                StepResult::Branch(target) => {
                    if target >= instructions.len() {
                        return Err(EmulationError::InvalidBranchTarget { target }.into());
                    }
                    ip = target;
                }
                StepResult::Return(value) => {
                    log::trace!("stub '{}' returned after {executed} instructions", self.body.name());
                    return Ok(value);
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn step(
        runtime: &mut StubRuntime,
        stack: &mut EvalStack,
        instruction: &Instruction,
        callee: &mut Callee<'_>,
    ) -> Result<StepResult> {
        let opcode = instruction.opcode;
        let operand = &instruction.operand;

        match opcode {
            Opcode::Nop => {}

            Opcode::Ldarg => stack.push(runtime.load_arg(Self::argument(instruction)?)?),
            Opcode::Ldarga => stack.push(StubValue::Ptr(ManagedPtr::Arg(
                Self::argument(instruction)?,
            ))),
            Opcode::Starg => {
                let value = stack.pop()?;
                let pointer = ManagedPtr::Arg(Self::argument(instruction)?);
                runtime.write_location(&pointer, value)?;
            }
            Opcode::Ldloc => stack.push(runtime.load_local(Self::local(instruction)?)?),
            Opcode::Ldloca => stack.push(StubValue::Ptr(ManagedPtr::Local(
                Self::local(instruction)?,
            ))),
            Opcode::Stloc => {
                let value = stack.pop()?;
                let pointer = ManagedPtr::Local(Self::local(instruction)?);
                runtime.write_location(&pointer, value)?;
            }

            Opcode::LdcI4 | Opcode::LdcI8 => match operand {
                Operand::Immediate(Immediate::Int32(value)) => stack.push(StubValue::I4(*value)),
                Operand::Immediate(Immediate::Int64(value)) => stack.push(StubValue::I8(*value)),
                _ => return Err(Self::invalid_operand(instruction)),
            },
            Opcode::Ldnull => stack.push(StubValue::Null),
            Opcode::Dup => {
                let top = stack.peek()?.clone();
                stack.push(top);
            }
            Opcode::Pop => {
                stack.pop()?;
            }

            Opcode::Add => Self::binary_op(stack, BinaryOp::Add)?,
            Opcode::Sub => Self::binary_op(stack, BinaryOp::Sub)?,
            Opcode::Mul => Self::binary_op(stack, BinaryOp::Mul)?,
            Opcode::MulOvf => Self::binary_op(stack, BinaryOp::MulOvf)?,
            Opcode::Ceq => Self::compare(stack, CompareOp::Eq)?,
            Opcode::Cgt => Self::compare(stack, CompareOp::Gt)?,
            Opcode::Clt => Self::compare(stack, CompareOp::Lt)?,

            Opcode::ConvI => Self::convert(runtime, stack, ConversionType::NativeInt)?,
            Opcode::ConvU => Self::convert(runtime, stack, ConversionType::NativeUInt)?,
            Opcode::ConvI4 => Self::convert(runtime, stack, ConversionType::I4)?,
            Opcode::ConvI8 => Self::convert(runtime, stack, ConversionType::I8)?,

            Opcode::Br => return Ok(StepResult::Branch(Self::target(instruction)?)),
            Opcode::Brfalse | Opcode::Brtrue => {
                let target = Self::target(instruction)?;
                let taken = stack.pop()?.is_true() == (opcode == Opcode::Brtrue);
                if taken {
                    return Ok(StepResult::Branch(target));
                }
            }
            Opcode::Blt => {
                let target = Self::target(instruction)?;
                let right = stack.pop()?;
                let left = stack.pop()?;
                if handlers::less_than(&left, &right)? {
                    return Ok(StepResult::Branch(target));
                }
            }

            Opcode::Ldlen => Self::load_array_length(runtime, stack)?,
            Opcode::Ldelem => Self::load_element(runtime, stack)?,
            Opcode::Ldelema => Self::load_element_address(runtime, stack)?,
            Opcode::Stelem => Self::store_element(runtime, stack)?,
            Opcode::Newarr => {
                let element = Self::type_operand(instruction)?;
                let count = stack.pop()?.as_i64("newarr")?;
                stack.push(runtime.new_zeroed_array(element, count)?);
            }

            Opcode::Ldobj => {
                let ty = Self::type_operand(instruction)?;
                let address = stack.pop()?;
                stack.push(runtime.load_indirect(&address, ty)?);
            }
            Opcode::Stobj => {
                let ty = Self::type_operand(instruction)?;
                let value = stack.pop()?;
                let address = stack.pop()?;
                runtime.store_indirect(&address, ty, value)?;
            }
            Opcode::Initobj => {
                let ty = Self::type_operand(instruction)?;
                let address = stack.pop()?;
                runtime.init_indirect(&address, ty)?;
            }
            Opcode::Sizeof => {
                let size = Self::type_operand(instruction)?.native_size();
                stack.push(StubValue::I4(
                    i32::try_from(size).map_err(|_| EmulationError::ArithmeticOverflow)?,
                ));
            }

            Opcode::Ldfld => {
                let name = Self::field_name(instruction)?;
                let object = stack.pop()?;
                stack.push(runtime.load_field(&object, name)?);
            }
            Opcode::Ldflda => {
                let name = Self::field_name(instruction)?;
                let object = stack.pop()?;
                stack.push(runtime.field_address(&object, name)?);
            }
            Opcode::Stfld => {
                let name = Self::field_name(instruction)?;
                let value = stack.pop()?;
                let object = stack.pop()?;
                runtime.store_field(&object, name, value)?;
            }

            Opcode::Call => match operand {
                Operand::Helper(helper) => {
                    let args = stack.pop_n(helper.helper.arity())?;
                    if let Some(result) = runtime.invoke_helper(helper.helper, &args)? {
                        stack.push(result);
                    }
                }
                Operand::Call(site) => {
                    let args = stack.pop_n(usize::from(site.arg_count))?;
                    runtime.refresh_pins()?;
                    log::trace!("call {} with {} args", site.target, args.len());
                    let result = callee(runtime, &args)?;
                    runtime.sync_pins()?;
                    match (site.returns_value, result) {
                        (true, Some(value)) => stack.push(value),
                        (true, None) => return Err(EmulationError::MissingReturnValue.into()),
                        (false, _) => {}
                    }
                }
                _ => return Err(Self::invalid_operand(instruction)),
            },
            Opcode::Newobj => {
                let ty = Self::type_operand(instruction)?;
                stack.push(runtime.new_default_object(ty)?);
            }
            Opcode::Ldtoken => {
                let ty = Self::type_operand(instruction)?;
                stack.push(StubValue::TypeHandle(ty.clone()));
            }
            Opcode::Ret => {
                return match stack.len() {
                    0 => Ok(StepResult::Return(None)),
                    1 => Ok(StepResult::Return(Some(stack.pop()?))),
                    depth => Err(EmulationError::UnbalancedStack { depth }.into()),
                };
            }
        }

        Ok(StepResult::Continue)
    }

    fn invalid_operand(instruction: &Instruction) -> crate::Error {
        let operand = match &instruction.operand {
            Operand::None => "no",
            Operand::Immediate(_) => "immediate",
            Operand::Argument(_) => "argument",
            Operand::Local(_) => "local",
            Operand::Label(_) => "unresolved label",
            Operand::Target(_) => "branch target",
            Operand::Type(_) => "type",
            Operand::Field(_) => "field",
            Operand::Helper(_) => "helper",
            Operand::Call(_) => "call site",
        };
        EmulationError::UnsupportedInstruction {
            opcode: instruction.opcode,
            operand,
        }
        .into()
    }

    fn argument(instruction: &Instruction) -> Result<u16> {
        match instruction.operand {
            Operand::Argument(index) => Ok(index),
            _ => Err(Self::invalid_operand(instruction)),
        }
    }

    fn local(instruction: &Instruction) -> Result<u16> {
        match instruction.operand {
            Operand::Local(local) => Ok(local.0),
            _ => Err(Self::invalid_operand(instruction)),
        }
    }

    fn target(instruction: &Instruction) -> Result<usize> {
        match instruction.operand {
            Operand::Target(target) => Ok(target),
            _ => Err(Self::invalid_operand(instruction)),
        }
    }

    fn type_operand(instruction: &Instruction) -> Result<&MarshalType> {
        match &instruction.operand {
            Operand::Type(ty) => Ok(ty),
            _ => Err(Self::invalid_operand(instruction)),
        }
    }

    fn field_name(instruction: &Instruction) -> Result<&str> {
        match &instruction.operand {
            Operand::Field(field) => Ok(&field.name),
            _ => Err(Self::invalid_operand(instruction)),
        }
    }
}
