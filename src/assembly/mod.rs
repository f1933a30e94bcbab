//! CIL assembly for marshalling stubs.
//!
//! This module provides the instruction model and the plumbing the marshallers emit through:
//!
//! - [`Opcode`], [`Instruction`], [`Operand`] - the instruction representation
//! - [`StubEmitter`] - local variable table and label allocation shared by all streams of a stub
//! - [`CodeStream`] / [`PInvokeCodeStreams`] - the append-only streams each marshalling phase
//!   writes to
//! - [`StubBody`] - the linked result, with labels resolved to instruction indices
//!
//! # Examples
//!
//! ```rust
//! use dotmarshal::assembly::{CodeStream, Opcode, StubBody, StubEmitter};
//!
//! let mut emitter = StubEmitter::new();
//! let skip = emitter.new_label();
//!
//! let mut stream = CodeStream::new();
//! stream.emit_ldarg(0);
//! stream.emit_branch(Opcode::Brfalse, skip);
//! stream.emit(Opcode::Nop);
//! stream.emit_label(skip);
//! stream.emit(Opcode::Ret);
//!
//! let body = StubBody::link("Example", vec![stream], emitter.into_locals(), 1)?;
//! assert_eq!(body.instructions().len(), 4);
//! # Ok::<(), dotmarshal::Error>(())
//! ```

mod body;
mod emitter;
mod instruction;
mod opcodes;

pub use body::StubBody;
pub use emitter::{CodeStream, LocalSlot, PInvokeCodeStreams, StreamItem, StubEmitter};
pub use instruction::{CallSite, FieldRef, Immediate, Instruction, Label, LocalId, Operand};
pub use opcodes::Opcode;
