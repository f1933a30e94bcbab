//! The CIL opcode subset used by marshalling stubs.
//!
//! Stubs only need loads and stores of arguments, locals, fields, array elements and
//! indirections, integer arithmetic, comparisons and branches, calls and a handful of type
//! operations. Typed memory access uses the generic `ldobj`/`stobj`/`ldelem`/`stelem` forms
//! with a type operand instead of the width-suffixed variants.

use strum::{EnumIter, IntoStaticStr};

/// A CIL opcode. The `Display` form is the ECMA-335 mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, IntoStaticStr, EnumIter)]
#[allow(missing_docs)]
pub enum Opcode {
    #[strum(serialize = "nop")]
    Nop,
    #[strum(serialize = "ldarg")]
    Ldarg,
    #[strum(serialize = "ldarga")]
    Ldarga,
    #[strum(serialize = "starg")]
    Starg,
    #[strum(serialize = "ldloc")]
    Ldloc,
    #[strum(serialize = "ldloca")]
    Ldloca,
    #[strum(serialize = "stloc")]
    Stloc,
    #[strum(serialize = "ldc.i4")]
    LdcI4,
    #[strum(serialize = "ldc.i8")]
    LdcI8,
    #[strum(serialize = "ldnull")]
    Ldnull,
    #[strum(serialize = "dup")]
    Dup,
    #[strum(serialize = "pop")]
    Pop,
    #[strum(serialize = "add")]
    Add,
    #[strum(serialize = "sub")]
    Sub,
    #[strum(serialize = "mul")]
    Mul,
    #[strum(serialize = "mul.ovf")]
    MulOvf,
    #[strum(serialize = "ceq")]
    Ceq,
    #[strum(serialize = "cgt")]
    Cgt,
    #[strum(serialize = "clt")]
    Clt,
    #[strum(serialize = "conv.i")]
    ConvI,
    #[strum(serialize = "conv.u")]
    ConvU,
    #[strum(serialize = "conv.i4")]
    ConvI4,
    #[strum(serialize = "conv.i8")]
    ConvI8,
    #[strum(serialize = "br")]
    Br,
    #[strum(serialize = "brfalse")]
    Brfalse,
    #[strum(serialize = "brtrue")]
    Brtrue,
    #[strum(serialize = "blt")]
    Blt,
    #[strum(serialize = "ldlen")]
    Ldlen,
    #[strum(serialize = "ldelem")]
    Ldelem,
    #[strum(serialize = "ldelema")]
    Ldelema,
    #[strum(serialize = "stelem")]
    Stelem,
    #[strum(serialize = "newarr")]
    Newarr,
    #[strum(serialize = "ldobj")]
    Ldobj,
    #[strum(serialize = "stobj")]
    Stobj,
    #[strum(serialize = "initobj")]
    Initobj,
    #[strum(serialize = "sizeof")]
    Sizeof,
    #[strum(serialize = "ldfld")]
    Ldfld,
    #[strum(serialize = "ldflda")]
    Ldflda,
    #[strum(serialize = "stfld")]
    Stfld,
    #[strum(serialize = "call")]
    Call,
    #[strum(serialize = "newobj")]
    Newobj,
    #[strum(serialize = "ldtoken")]
    Ldtoken,
    #[strum(serialize = "ret")]
    Ret,
}

impl Opcode {
    /// ECMA-335 encoding. Two-byte opcodes carry the `0xFE` prefix in the high byte.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Opcode::Nop => 0x00,
            Opcode::Ldnull => 0x14,
            Opcode::LdcI4 => 0x20,
            Opcode::LdcI8 => 0x21,
            Opcode::Dup => 0x25,
            Opcode::Pop => 0x26,
            Opcode::Call => 0x28,
            Opcode::Ret => 0x2A,
            Opcode::Br => 0x38,
            Opcode::Brfalse => 0x39,
            Opcode::Brtrue => 0x3A,
            Opcode::Blt => 0x3F,
            Opcode::Add => 0x58,
            Opcode::Sub => 0x59,
            Opcode::Mul => 0x5A,
            Opcode::ConvI4 => 0x69,
            Opcode::ConvI8 => 0x6A,
            Opcode::Ldobj => 0x71,
            Opcode::Newobj => 0x73,
            Opcode::Ldfld => 0x7B,
            Opcode::Ldflda => 0x7C,
            Opcode::Stfld => 0x7D,
            Opcode::Stobj => 0x81,
            Opcode::Newarr => 0x8D,
            Opcode::Ldlen => 0x8E,
            Opcode::Ldelema => 0x8F,
            Opcode::Ldelem => 0xA3,
            Opcode::Stelem => 0xA4,
            Opcode::Ldtoken => 0xD0,
            Opcode::ConvI => 0xD3,
            Opcode::MulOvf => 0xD8,
            Opcode::ConvU => 0xE0,
            Opcode::Ceq => 0xFE01,
            Opcode::Cgt => 0xFE02,
            Opcode::Clt => 0xFE04,
            Opcode::Ldarg => 0xFE09,
            Opcode::Ldarga => 0xFE0A,
            Opcode::Starg => 0xFE0B,
            Opcode::Ldloc => 0xFE0C,
            Opcode::Ldloca => 0xFE0D,
            Opcode::Stloc => 0xFE0E,
            Opcode::Initobj => 0xFE15,
            Opcode::Sizeof => 0xFE1C,
        }
    }

    /// Returns `true` for the opcodes that transfer control to a label.
    #[must_use]
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Br | Opcode::Brfalse | Opcode::Brtrue | Opcode::Blt
        )
    }

    /// Returns `true` for branches that pop a condition.
    #[must_use]
    pub fn is_conditional_branch(self) -> bool {
        self.is_branch() && self != Opcode::Br
    }

    /// The mnemonic as a static string.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn codes_are_unique() {
        let mut seen = HashSet::new();
        for opcode in Opcode::iter() {
            assert!(seen.insert(opcode.code()), "duplicate code for {opcode}");
        }
    }

    #[test]
    fn mnemonics() {
        assert_eq!(Opcode::MulOvf.to_string(), "mul.ovf");
        assert_eq!(Opcode::LdcI4.mnemonic(), "ldc.i4");
        assert_eq!(Opcode::Ldobj.mnemonic(), "ldobj");
    }

    #[test]
    fn branches() {
        assert!(Opcode::Br.is_branch());
        assert!(!Opcode::Br.is_conditional_branch());
        assert!(Opcode::Brfalse.is_conditional_branch());
        assert!(!Opcode::Call.is_branch());
    }
}
