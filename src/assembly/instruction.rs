//! Instruction and operand representation for generated stubs.
//!
//! Unlike a decoded method body, a stub under construction references locals, labels and
//! runtime helpers symbolically. [`Operand`] therefore carries typed references
//! ([`LocalId`], [`Label`], [`MarshalType`], [`FieldRef`], [`HelperRef`]) rather than encoded
//! tokens and offsets. Linking a stub ([`crate::assembly::StubBody::link`]) turns every
//! [`Operand::Label`] into an [`Operand::Target`] instruction index.

use std::fmt;

use crate::{
    assembly::Opcode,
    interop::HelperRef,
    metadata::{token::Token, typesystem::MarshalType},
};

/// Index of a local variable declared through [`crate::assembly::StubEmitter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u16);

/// A branch target, placed into a code stream with [`crate::assembly::CodeStream::emit_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

/// Immediate constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Immediate {
    /// `ldc.i4` payload
    Int32(i32),
    /// `ldc.i8` payload
    Int64(i64),
}

/// Reference to an instance field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    /// Declaring type name
    pub owner: String,
    /// Field name
    pub name: String,
    /// Field type as seen by this access
    pub ty: MarshalType,
}

impl FieldRef {
    /// Create a field reference.
    #[must_use]
    pub fn new(owner: &str, name: &str, ty: MarshalType) -> Self {
        FieldRef {
            owner: owner.to_string(),
            name: name.to_string(),
            ty,
        }
    }
}

/// The call the stub wraps: the native export in forward stubs, the managed target in reverse
/// stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Token of the call target
    pub target: Token,
    /// Number of values the call pops
    pub arg_count: u16,
    /// Whether the call pushes a result
    pub returns_value: bool,
}

/// Instruction operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// Constant value
    Immediate(Immediate),
    /// Argument index (zero based)
    Argument(u16),
    /// Local variable
    Local(LocalId),
    /// Unresolved branch target
    Label(Label),
    /// Resolved branch target (instruction index), produced by linking
    Target(usize),
    /// Type operand of `newarr`, `ldobj`, `sizeof`, ...
    Type(MarshalType),
    /// Field operand of `ldfld`, `stfld`, `ldflda`
    Field(FieldRef),
    /// Runtime helper method
    Helper(HelperRef),
    /// The wrapped call
    Call(CallSite),
}

/// A single stub instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Operation
    pub opcode: Opcode,
    /// Operand, [`Operand::None`] for operand-less opcodes
    pub operand: Operand,
}

impl Instruction {
    /// An instruction without operand.
    #[must_use]
    pub fn simple(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            operand: Operand::None,
        }
    }

    /// An instruction with operand.
    #[must_use]
    pub fn with(opcode: Opcode, operand: Operand) -> Self {
        Instruction { opcode, operand }
    }

    /// The runtime helper this instruction calls, if any.
    #[must_use]
    pub fn helper(&self) -> Option<&HelperRef> {
        match &self.operand {
            Operand::Helper(helper) if self.opcode == Opcode::Call => Some(helper),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Immediate(Immediate::Int32(value)) => write!(f, "{value}"),
            Operand::Immediate(Immediate::Int64(value)) => write!(f, "{value}"),
            Operand::Argument(index) => write!(f, "{index}"),
            Operand::Local(local) => write!(f, "V_{}", local.0),
            Operand::Label(label) => write!(f, "L_{}", label.0),
            Operand::Target(index) => write!(f, "IL_{index:04}"),
            Operand::Type(ty) => write!(f, "{ty}"),
            Operand::Field(field) => write!(f, "{} {}::{}", field.ty, field.owner, field.name),
            Operand::Helper(helper) => write!(f, "{}", helper.helper.qualified_name()),
            Operand::Call(site) => write!(f, "target {}", site.target),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Operand::None => write!(f, "{}", self.opcode),
            _ => write!(f, "{} {}", self.opcode, self.operand),
        }
    }
}
