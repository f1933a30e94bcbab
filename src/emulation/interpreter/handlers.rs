//! Instruction handlers.
//!
//! Arithmetic follows the CIL stack typing rules reduced to what stubs need: `int32` operands
//! stay `int32`, anything involving a native integer or a null pointer is native sized, and
//! `int64` wins over `int32`.

use crate::{
    emulation::{
        interpreter::{EvalStack, StubInterpreter},
        EmulationError, HeapRef, ManagedPtr, StubRuntime, StubValue,
    },
    Error, Result,
};

/// Binary arithmetic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Multiplication raising on overflow, used for buffer size computations
    MulOvf,
}

impl BinaryOp {
    fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::MulOvf => "mul.ovf",
        }
    }
}

/// Comparison operations pushing `0` or `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CompareOp {
    Eq,
    Gt,
    Lt,
}

/// Integer conversions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ConversionType {
    NativeInt,
    NativeUInt,
    I4,
    I8,
}

/// Result width of an integer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    I4,
    I8,
    Native,
}

fn width(left: &StubValue, right: &StubValue) -> Width {
    let native = |value: &StubValue| matches!(value, StubValue::NativeInt(_) | StubValue::Null);
    if native(left) || native(right) {
        Width::Native
    } else if matches!(left, StubValue::I8(_)) || matches!(right, StubValue::I8(_)) {
        Width::I8
    } else {
        Width::I4
    }
}

fn widen(width: Width, value: i64) -> StubValue {
    match width {
        #[allow(clippy::cast_possible_truncation)]
        Width::I4 => StubValue::I4(value as i32),
        Width::I8 => StubValue::I8(value),
        Width::Native => StubValue::NativeInt(value),
    }
}

/// Apply `op` to two stack values.
///
/// # Errors
/// [`EmulationError::TypeMismatch`] for operands that are not numbers, and for `mul.ovf`
/// [`Error::AllocationOverflow`] when the product does not fit.
pub(super) fn arithmetic(op: BinaryOp, left: &StubValue, right: &StubValue) -> Result<StubValue> {
    if let (StubValue::F(a), StubValue::F(b)) = (left, right) {
        return Ok(StubValue::F(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul | BinaryOp::MulOvf => a * b,
        }));
    }

    let width = width(left, right);
    let a = left.as_i64(op.name())?;
    let b = right.as_i64(op.name())?;

    #[allow(clippy::cast_possible_truncation)]
    let value = match (op, width) {
        (BinaryOp::MulOvf, Width::I4) => (a as i32)
            .checked_mul(b as i32)
            .map(i64::from)
            .ok_or(Error::AllocationOverflow {
                count: a,
                element_size: b,
            })?,
        (BinaryOp::MulOvf, _) => a.checked_mul(b).ok_or(Error::AllocationOverflow {
            count: a,
            element_size: b,
        })?,
        (BinaryOp::Add, Width::I4) => i64::from((a as i32).wrapping_add(b as i32)),
        (BinaryOp::Sub, Width::I4) => i64::from((a as i32).wrapping_sub(b as i32)),
        (BinaryOp::Mul, Width::I4) => i64::from((a as i32).wrapping_mul(b as i32)),
        (BinaryOp::Add, _) => a.wrapping_add(b),
        (BinaryOp::Sub, _) => a.wrapping_sub(b),
        (BinaryOp::Mul, _) => a.wrapping_mul(b),
    };
    Ok(widen(width, value))
}

/// `ceq` semantics. References and managed pointers compare by identity, null equals zero.
///
/// # Errors
/// [`EmulationError::TypeMismatch`] when an operand has no integer view.
pub(super) fn equals(left: &StubValue, right: &StubValue) -> Result<bool> {
    match (left, right) {
        (StubValue::Ref(a), StubValue::Ref(b)) => Ok(a == b),
        (StubValue::Ptr(a), StubValue::Ptr(b)) => Ok(a == b),
        (StubValue::Null, StubValue::Ref(_) | StubValue::Ptr(_))
        | (StubValue::Ref(_) | StubValue::Ptr(_), StubValue::Null)
        | (StubValue::Ref(_), StubValue::Ptr(_))
        | (StubValue::Ptr(_), StubValue::Ref(_)) => Ok(false),
        (StubValue::F(a), StubValue::F(b)) => Ok(a == b),
        _ => Ok(left.as_i64("ceq")? == right.as_i64("ceq")?),
    }
}

/// Signed `left < right`.
///
/// # Errors
/// [`EmulationError::TypeMismatch`] for non-numeric operands.
pub(super) fn less_than(left: &StubValue, right: &StubValue) -> Result<bool> {
    match (left, right) {
        (StubValue::F(a), StubValue::F(b)) => Ok(a < b),
        _ => Ok(left.as_i64("clt")? < right.as_i64("clt")?),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn float_to_integer(value: f64) -> i64 {
    value as i64
}

/// Convert a non-pointer value.
///
/// # Errors
/// [`EmulationError::TypeMismatch`] for values without a numeric view.
pub(super) fn conversion(kind: ConversionType, value: &StubValue) -> Result<StubValue> {
    let integer = match value {
        StubValue::F(float) => float_to_integer(*float),
        #[allow(clippy::cast_sign_loss)]
        StubValue::I4(narrow) if kind == ConversionType::NativeUInt => i64::from(*narrow as u32),
        other => other.as_i64("conv")?,
    };

    #[allow(clippy::cast_possible_truncation)]
    Ok(match kind {
        ConversionType::NativeInt | ConversionType::NativeUInt => StubValue::NativeInt(integer),
        ConversionType::I4 => StubValue::I4(integer as i32),
        ConversionType::I8 => StubValue::I8(integer),
    })
}

/// Array reference and in-bounds index of an element access.
fn element_location(
    runtime: &StubRuntime,
    array: &StubValue,
    index: &StubValue,
) -> Result<(HeapRef, usize)> {
    let reference = match array {
        StubValue::Ref(reference) => *reference,
        StubValue::Null => return Err(EmulationError::NullReference.into()),
        other => {
            return Err(EmulationError::TypeMismatch {
                operation: "array access",
                expected: "array reference",
                found: other.kind_name(),
            }
            .into())
        }
    };
    let index = index.as_i64("array index")?;
    let length = runtime.heap().array(reference)?.1.len();
    match usize::try_from(index) {
        Ok(position) if position < length => Ok((reference, position)),
        _ => Err(EmulationError::ArrayIndexOutOfBounds { index, length }.into()),
    }
}

impl StubInterpreter<'_> {
    pub(super) fn binary_op(stack: &mut EvalStack, op: BinaryOp) -> Result<()> {
        let right = stack.pop()?;
        let left = stack.pop()?;
        stack.push(arithmetic(op, &left, &right)?);
        Ok(())
    }

    pub(super) fn compare(stack: &mut EvalStack, op: CompareOp) -> Result<()> {
        let right = stack.pop()?;
        let left = stack.pop()?;
        let result = match op {
            CompareOp::Eq => equals(&left, &right)?,
            CompareOp::Gt => less_than(&right, &left)?,
            CompareOp::Lt => less_than(&left, &right)?,
        };
        stack.push(StubValue::from(result));
        Ok(())
    }

    /// `conv.*`. Converting a managed pointer or a string/array reference to a native integer
    /// pins its target.
    pub(super) fn convert(
        runtime: &mut StubRuntime,
        stack: &mut EvalStack,
        kind: ConversionType,
    ) -> Result<()> {
        let value = stack.pop()?;
        let converted = match (&value, kind) {
            (
                StubValue::Ptr(_) | StubValue::Ref(_),
                ConversionType::NativeInt | ConversionType::NativeUInt,
            ) => StubValue::NativeInt(runtime.pin(&value)?),
            _ => conversion(kind, &value)?,
        };
        stack.push(converted);
        Ok(())
    }

    pub(super) fn load_array_length(runtime: &StubRuntime, stack: &mut EvalStack) -> Result<()> {
        let array = stack.pop()?;
        let reference = match array {
            StubValue::Ref(reference) => reference,
            StubValue::Null => return Err(EmulationError::NullReference.into()),
            other => {
                return Err(EmulationError::TypeMismatch {
                    operation: "ldlen",
                    expected: "array reference",
                    found: other.kind_name(),
                }
                .into())
            }
        };
        let length = runtime.heap().array(reference)?.1.len();
        stack.push(StubValue::NativeInt(
            i64::try_from(length).map_err(|_| EmulationError::ArithmeticOverflow)?,
        ));
        Ok(())
    }

    pub(super) fn load_element(runtime: &StubRuntime, stack: &mut EvalStack) -> Result<()> {
        let index = stack.pop()?;
        let array = stack.pop()?;
        let (reference, position) = element_location(runtime, &array, &index)?;
        stack.push(runtime.read_location(&ManagedPtr::Element(reference, position))?);
        Ok(())
    }

    pub(super) fn load_element_address(runtime: &StubRuntime, stack: &mut EvalStack) -> Result<()> {
        let index = stack.pop()?;
        let array = stack.pop()?;
        let (reference, position) = element_location(runtime, &array, &index)?;
        stack.push(StubValue::Ptr(ManagedPtr::Element(reference, position)));
        Ok(())
    }

    pub(super) fn store_element(runtime: &mut StubRuntime, stack: &mut EvalStack) -> Result<()> {
        let value = stack.pop()?;
        let index = stack.pop()?;
        let array = stack.pop()?;
        let (reference, position) = element_location(runtime, &array, &index)?;
        runtime.write_location(&ManagedPtr::Element(reference, position), value)
    }
}
