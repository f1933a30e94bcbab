//! Linked stub bodies.

use std::{collections::HashMap, fmt};

use crate::{
    assembly::{
        emitter::{CodeStream, LocalSlot, StreamItem},
        instruction::{Instruction, Operand},
        Opcode,
    },
    interop::RuntimeHelper,
    Error, Result,
};

/// A finished stub: the concatenated streams with every label resolved to an instruction index.
#[derive(Debug, Clone)]
pub struct StubBody {
    name: String,
    instructions: Vec<Instruction>,
    locals: Vec<LocalSlot>,
    arg_count: u16,
}

impl StubBody {
    /// Concatenate `streams` in order and resolve labels.
    ///
    /// # Errors
    /// Returns [`crate::Error::UndefinedLabel`] if a branch references a label no stream placed,
    /// or [`crate::Error::Malformed`] if a label is placed twice.
    pub fn link(
        name: &str,
        streams: Vec<CodeStream>,
        locals: Vec<LocalSlot>,
        arg_count: u16,
    ) -> Result<Self> {
        let mut positions = HashMap::new();
        let mut instructions = Vec::new();

        for item in streams.into_iter().flat_map(CodeStream::into_items) {
            match item {
                StreamItem::Label(label) => {
                    if positions.insert(label, instructions.len()).is_some() {
                        return Err(malformed_error!("Label {} placed twice", label.0));
                    }
                }
                StreamItem::Instruction(instruction) => instructions.push(instruction),
            }
        }

        for instruction in &mut instructions {
            if let Operand::Label(label) = instruction.operand {
                let target = positions
                    .get(&label)
                    .ok_or(Error::UndefinedLabel(label.0))?;
                instruction.operand = Operand::Target(*target);
            }
        }

        Ok(StubBody {
            name: name.to_string(),
            instructions,
            locals,
            arg_count,
        })
    }

    /// Name of the method the stub was generated for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Linked instructions.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Local variable table.
    #[must_use]
    pub fn locals(&self) -> &[LocalSlot] {
        &self.locals
    }

    /// Number of stub parameters.
    #[must_use]
    pub fn arg_count(&self) -> u16 {
        self.arg_count
    }

    /// Number of instructions using `opcode`.
    #[must_use]
    pub fn count(&self, opcode: Opcode) -> usize {
        self.instructions
            .iter()
            .filter(|instruction| instruction.opcode == opcode)
            .count()
    }

    /// Runtime helpers called by the stub, in instruction order.
    #[must_use]
    pub fn helper_calls(&self) -> Vec<RuntimeHelper> {
        self.instructions
            .iter()
            .filter_map(|instruction| instruction.helper().map(|helper| helper.helper))
            .collect()
    }

    /// Returns `true` if any instruction calls `helper`.
    #[must_use]
    pub fn calls_helper(&self, helper: RuntimeHelper) -> bool {
        self.helper_calls().contains(&helper)
    }

    /// Returns `true` if any local is pinned.
    #[must_use]
    pub fn has_pinned_locals(&self) -> bool {
        self.locals.iter().any(|local| local.pinned)
    }
}

impl fmt::Display for StubBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, ".method {} ({} args)", self.name, self.arg_count)?;
        for (index, local) in self.locals.iter().enumerate() {
            let pinned = if local.pinned { " pinned" } else { "" };
            writeln!(f, "  .local V_{index}: {}{pinned}", local.ty)?;
        }
        for (index, instruction) in self.instructions.iter().enumerate() {
            writeln!(f, "  IL_{index:04}: {instruction}")?;
        }
        Ok(())
    }
}
