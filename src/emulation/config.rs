//! Execution limits of the stub interpreter.

/// Bounds a single [`StubRuntime`](crate::emulation::StubRuntime) enforces.
///
/// Generated stubs are straight-line code plus one copy loop per array, so the defaults are far
/// above anything a well-formed stub needs. They exist to stop a malformed stub, or a callee
/// handing back a bogus element count, from running away.
///
/// # Examples
///
/// ```rust
/// use dotmarshal::emulation::EmulationLimits;
///
/// let limits = EmulationLimits::default().with_max_instructions(10_000);
/// assert_eq!(limits.max_instructions, 10_000);
/// assert_eq!(limits.max_memory, 16 * 1024 * 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulationLimits {
    /// Maximum instructions one stub invocation may execute.
    ///
    /// Set to 0 for unlimited execution.
    pub max_instructions: u64,

    /// Maximum bytes of simulated native memory, mirrors of pinned objects included.
    pub max_memory: usize,
}

impl EmulationLimits {
    /// Replace the instruction limit.
    #[must_use]
    pub fn with_max_instructions(mut self, max_instructions: u64) -> Self {
        self.max_instructions = max_instructions;
        self
    }

    /// Replace the native memory ceiling.
    #[must_use]
    pub fn with_max_memory(mut self, max_memory: usize) -> Self {
        self.max_memory = max_memory;
        self
    }
}

impl Default for EmulationLimits {
    fn default() -> Self {
        EmulationLimits {
            max_instructions: 1_000_000,
            max_memory: 16 * 1024 * 1024,
        }
    }
}
