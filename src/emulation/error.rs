//! Emulation error types.
//!
//! Faults raised by the stub interpreter while it executes a linked stub: malformed stack
//! states, bad pointers, exhausted limits. Data-dependent marshalling failures that a real
//! runtime would surface as exceptions (an unmappable character, an overflowing allocation size)
//! are reported through the crate-level [`crate::Error`] instead.

use std::fmt;

use crate::assembly::Opcode;

/// Errors that can occur while a stub executes.
#[derive(Debug, Clone, PartialEq)]
pub enum EmulationError {
    /// Evaluation stack underflow (pop from empty stack).
    StackUnderflow,
    /// The stub ended with values left on the stack, or `ret` found more than one.
    UnbalancedStack {
        /// Number of values on the stack.
        depth: usize,
    },
    /// Local variable index out of bounds.
    LocalIndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Number of locals available.
        count: usize,
    },
    /// Argument index out of bounds.
    ArgumentIndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Number of arguments available.
        count: usize,
    },
    /// The caller passed the wrong number of arguments.
    ArgumentCountMismatch {
        /// Arguments the stub declares.
        expected: usize,
        /// Arguments supplied.
        found: usize,
    },
    /// Invalid heap reference.
    InvalidHeapReference {
        /// The invalid reference ID.
        reference_id: u64,
    },
    /// Heap memory limit exceeded.
    HeapMemoryLimitExceeded {
        /// Current heap size.
        current: usize,
        /// Maximum allowed size.
        limit: usize,
    },
    /// Invalid pointer access (unmanaged memory).
    InvalidPointer {
        /// The invalid address.
        address: u64,
        /// Reason for invalidity.
        reason: &'static str,
    },
    /// Null reference access.
    NullReference,
    /// Arithmetic overflow outside an allocation size computation.
    ArithmeticOverflow,
    /// Type mismatch in operation.
    TypeMismatch {
        /// Operation being performed.
        operation: &'static str,
        /// Expected type.
        expected: &'static str,
        /// Actual type found.
        found: &'static str,
    },
    /// Heap object type mismatch.
    HeapTypeMismatch {
        /// Expected object kind.
        expected: &'static str,
        /// Actual object kind.
        found: &'static str,
    },
    /// A type that has no native representation was read from or written to native memory.
    NoNativeLayout {
        /// Display name of the type.
        ty: String,
    },
    /// Field not found on a struct or object.
    FieldNotFound {
        /// Declaring type.
        owner: String,
        /// Field name.
        field: String,
    },
    /// Array index out of bounds.
    ArrayIndexOutOfBounds {
        /// The invalid index.
        index: i64,
        /// Array length.
        length: usize,
    },
    /// Invalid branch target.
    InvalidBranchTarget {
        /// The invalid instruction index.
        target: usize,
    },
    /// Execution ran past the last instruction.
    InvalidInstructionPointer {
        /// The invalid instruction index.
        offset: usize,
    },
    /// Instruction count limit exceeded.
    InstructionLimitExceeded {
        /// Number of instructions executed.
        executed: u64,
        /// Maximum allowed.
        limit: u64,
    },
    /// The interpreter has no semantics for the opcode/operand combination.
    UnsupportedInstruction {
        /// The opcode.
        opcode: Opcode,
        /// Description of the operand.
        operand: &'static str,
    },
    /// The callee returned nothing for a call site that expects a value.
    MissingReturnValue,
}

impl fmt::Display for EmulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulationError::StackUnderflow => write!(f, "evaluation stack underflow"),
            EmulationError::UnbalancedStack { depth } => {
                write!(f, "unbalanced evaluation stack at return (depth {depth})")
            }
            EmulationError::LocalIndexOutOfBounds { index, count } => {
                write!(
                    f,
                    "local variable index {index} out of bounds (count: {count})"
                )
            }
            EmulationError::ArgumentIndexOutOfBounds { index, count } => {
                write!(f, "argument index {index} out of bounds (count: {count})")
            }
            EmulationError::ArgumentCountMismatch { expected, found } => {
                write!(f, "stub expects {expected} arguments, {found} supplied")
            }
            EmulationError::InvalidHeapReference { reference_id } => {
                write!(f, "invalid heap reference: {reference_id}")
            }
            EmulationError::HeapMemoryLimitExceeded { current, limit } => {
                write!(
                    f,
                    "heap memory limit exceeded: {current} bytes (limit: {limit})"
                )
            }
            EmulationError::InvalidPointer { address, reason } => {
                write!(f, "invalid pointer 0x{address:016X}: {reason}")
            }
            EmulationError::NullReference => write!(f, "null reference"),
            EmulationError::ArithmeticOverflow => write!(f, "arithmetic overflow"),
            EmulationError::TypeMismatch {
                operation,
                expected,
                found,
            } => {
                write!(
                    f,
                    "type mismatch in {operation}: expected {expected}, found {found}"
                )
            }
            EmulationError::HeapTypeMismatch { expected, found } => {
                write!(f, "heap type mismatch: expected {expected}, found {found}")
            }
            EmulationError::NoNativeLayout { ty } => {
                write!(f, "'{ty}' has no native memory representation")
            }
            EmulationError::FieldNotFound { owner, field } => {
                write!(f, "field not found: {owner}::{field}")
            }
            EmulationError::ArrayIndexOutOfBounds { index, length } => {
                write!(f, "array index {index} out of bounds (length: {length})")
            }
            EmulationError::InvalidBranchTarget { target } => {
                write!(f, "invalid branch target: IL_{target:04}")
            }
            EmulationError::InvalidInstructionPointer { offset } => {
                write!(f, "invalid instruction pointer: IL_{offset:04}")
            }
            EmulationError::InstructionLimitExceeded { executed, limit } => {
                write!(f, "instruction limit exceeded: {executed} (limit: {limit})")
            }
            EmulationError::UnsupportedInstruction { opcode, operand } => {
                write!(f, "unsupported instruction: {opcode} with {operand} operand")
            }
            EmulationError::MissingReturnValue => {
                write!(f, "callee returned no value for a value-returning call site")
            }
        }
    }
}

impl std::error::Error for EmulationError {}
