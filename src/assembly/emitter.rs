//! Code streams, locals and labels.
//!
//! A P/Invoke stub is assembled from several independent [`CodeStream`]s that each marshaller
//! appends to as it walks through its phases. The streams share one [`StubEmitter`], which owns
//! the local variable table and hands out unique labels, so a label created while emitting the
//! marshalling stream may be placed in the unmarshalling stream and still resolve.

use crate::{
    assembly::{
        instruction::{CallSite, FieldRef, Immediate, Instruction, Label, LocalId, Operand},
        Opcode,
    },
    interop::HelperRef,
    metadata::typesystem::MarshalType,
};

/// A declared local variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSlot {
    /// Declared type
    pub ty: MarshalType,
    /// Whether the local pins the object it references for the lifetime of the stub
    pub pinned: bool,
}

/// Owner of the local table and label counter for one stub.
#[derive(Debug, Default)]
pub struct StubEmitter {
    locals: Vec<LocalSlot>,
    next_label: u32,
}

impl StubEmitter {
    /// Create an empty emitter.
    #[must_use]
    pub fn new() -> Self {
        StubEmitter::default()
    }

    /// Declare a new local of type `ty`.
    pub fn new_local(&mut self, ty: MarshalType) -> LocalId {
        self.declare(ty, false)
    }

    /// Declare a pinned local. Storing a reference into it pins the referenced object.
    pub fn new_pinned_local(&mut self, ty: MarshalType) -> LocalId {
        self.declare(ty, true)
    }

    fn declare(&mut self, ty: MarshalType, pinned: bool) -> LocalId {
        let id = LocalId(self.locals.len() as u16);
        self.locals.push(LocalSlot { ty, pinned });
        id
    }

    /// Allocate a fresh label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Declared locals, indexed by [`LocalId`].
    #[must_use]
    pub fn locals(&self) -> &[LocalSlot] {
        &self.locals
    }

    /// Consume the emitter, returning the local table.
    #[must_use]
    pub fn into_locals(self) -> Vec<LocalSlot> {
        self.locals
    }
}

/// An entry of a [`CodeStream`]: an instruction or the position of a label.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// An instruction
    Instruction(Instruction),
    /// A label placed before the next instruction
    Label(Label),
}

/// An append-only sequence of instructions and label placements.
#[derive(Debug, Clone, Default)]
pub struct CodeStream {
    items: Vec<StreamItem>,
}

impl CodeStream {
    /// Create an empty stream.
    #[must_use]
    pub fn new() -> Self {
        CodeStream::default()
    }

    /// Append an instruction without operand.
    pub fn emit(&mut self, opcode: Opcode) {
        self.push(Instruction::simple(opcode));
    }

    /// Append an instruction with operand.
    pub fn emit_with(&mut self, opcode: Opcode, operand: Operand) {
        self.push(Instruction::with(opcode, operand));
    }

    /// Append a prebuilt instruction.
    pub fn push(&mut self, instruction: Instruction) {
        self.items.push(StreamItem::Instruction(instruction));
    }

    /// `ldarg index`
    pub fn emit_ldarg(&mut self, index: u16) {
        self.emit_with(Opcode::Ldarg, Operand::Argument(index));
    }

    /// `ldarga index`
    pub fn emit_ldarga(&mut self, index: u16) {
        self.emit_with(Opcode::Ldarga, Operand::Argument(index));
    }

    /// `starg index`
    pub fn emit_starg(&mut self, index: u16) {
        self.emit_with(Opcode::Starg, Operand::Argument(index));
    }

    /// `ldloc local`
    pub fn emit_ldloc(&mut self, local: LocalId) {
        self.emit_with(Opcode::Ldloc, Operand::Local(local));
    }

    /// `ldloca local`
    pub fn emit_ldloca(&mut self, local: LocalId) {
        self.emit_with(Opcode::Ldloca, Operand::Local(local));
    }

    /// `stloc local`
    pub fn emit_stloc(&mut self, local: LocalId) {
        self.emit_with(Opcode::Stloc, Operand::Local(local));
    }

    /// `ldc.i4 value`
    pub fn emit_ldc(&mut self, value: i32) {
        self.emit_with(Opcode::LdcI4, Operand::Immediate(Immediate::Int32(value)));
    }

    /// An opcode taking a type operand (`ldobj`, `stobj`, `newarr`, `sizeof`, ...).
    pub fn emit_type(&mut self, opcode: Opcode, ty: &MarshalType) {
        self.emit_with(opcode, Operand::Type(ty.clone()));
    }

    /// Load a value of type `ty` through the address on the stack.
    pub fn emit_ldind(&mut self, ty: &MarshalType) {
        self.emit_type(Opcode::Ldobj, ty);
    }

    /// Store a value of type `ty` through an address: `[addr, value] -> []`.
    pub fn emit_stind(&mut self, ty: &MarshalType) {
        self.emit_type(Opcode::Stobj, ty);
    }

    /// An opcode taking a field operand (`ldfld`, `stfld`, `ldflda`).
    pub fn emit_field(&mut self, opcode: Opcode, field: FieldRef) {
        self.emit_with(opcode, Operand::Field(field));
    }

    /// A branch to `label`.
    pub fn emit_branch(&mut self, opcode: Opcode, label: Label) {
        debug_assert!(opcode.is_branch());
        self.emit_with(opcode, Operand::Label(label));
    }

    /// Place `label` before the next instruction of this stream.
    pub fn emit_label(&mut self, label: Label) {
        self.items.push(StreamItem::Label(label));
    }

    /// `call helper`
    pub fn emit_call(&mut self, helper: HelperRef) {
        self.emit_with(Opcode::Call, Operand::Helper(helper));
    }

    /// The wrapped native or managed call.
    pub fn emit_call_site(&mut self, site: CallSite) {
        self.emit_with(Opcode::Call, Operand::Call(site));
    }

    /// All items in order.
    #[must_use]
    pub fn items(&self) -> &[StreamItem] {
        &self.items
    }

    /// Instructions in order, skipping label placements.
    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.items.iter().filter_map(|item| match item {
            StreamItem::Instruction(instruction) => Some(instruction),
            StreamItem::Label(_) => None,
        })
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions().count()
    }

    /// Returns `true` if no instruction was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the stream.
    #[must_use]
    pub fn into_items(self) -> Vec<StreamItem> {
        self.items
    }
}

/// The four streams a P/Invoke stub is assembled from.
///
/// In the final body they appear in this order, with the wrapped call between `callsite_setup`
/// and `return_value`:
///
/// ```text
/// marshalling      convert and allocate the inputs
/// callsite_setup   push the arguments of the wrapped call
/// <call>
/// return_value     convert the result of the call
/// unmarshalling    write back outputs, release temporaries
/// ```
#[derive(Debug, Default)]
pub struct PInvokeCodeStreams {
    /// Input conversion
    pub marshalling: CodeStream,
    /// Argument pushes for the wrapped call
    pub callsite_setup: CodeStream,
    /// Result conversion
    pub return_value: CodeStream,
    /// Output propagation and cleanup
    pub unmarshalling: CodeStream,
}

impl PInvokeCodeStreams {
    /// Create four empty streams.
    #[must_use]
    pub fn new() -> Self {
        PInvokeCodeStreams::default()
    }
}
