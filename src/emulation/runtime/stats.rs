//! Helper call accounting.

use std::collections::{HashMap, HashSet};

use crate::interop::RuntimeHelper;

/// What the runtime helpers did during the lifetime of a [`StubRuntime`].
///
/// Allocations are the buffers handed out by `CoTaskMemAllocAndZeroMemory` and the copying
/// string helpers, plus buffers a callee allocates through
/// [`StubRuntime::co_task_mem_alloc`]. Mirrors of pinned objects are not allocations.
///
/// [`StubRuntime`]: crate::emulation::StubRuntime
/// [`StubRuntime::co_task_mem_alloc`]: crate::emulation::StubRuntime::co_task_mem_alloc
#[derive(Debug, Clone, Default)]
pub struct HelperStats {
    allocations: usize,
    frees: usize,
    calls: HashMap<RuntimeHelper, usize>,
    live: HashSet<u64>,
}

impl HelperStats {
    /// Number of `CoTaskMem` buffers allocated.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Number of `CoTaskMemFree` calls, null frees included.
    #[must_use]
    pub fn frees(&self) -> usize {
        self.frees
    }

    /// Number of times `helper` was called.
    #[must_use]
    pub fn calls(&self, helper: RuntimeHelper) -> usize {
        self.calls.get(&helper).copied().unwrap_or(0)
    }

    /// Number of helper calls of any kind.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.values().sum()
    }

    /// Buffers allocated and not yet freed.
    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// Returns `true` if every allocated buffer was freed.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.live.is_empty()
    }

    pub(crate) fn record_call(&mut self, helper: RuntimeHelper) {
        *self.calls.entry(helper).or_insert(0) += 1;
    }

    pub(crate) fn record_allocation(&mut self, address: u64) {
        self.allocations += 1;
        self.live.insert(address);
    }

    pub(crate) fn record_free_call(&mut self) {
        self.frees += 1;
    }

    /// Forget a live allocation. Returns `false` if `address` is not one.
    pub(crate) fn release(&mut self, address: u64) -> bool {
        self.live.remove(&address)
    }
}
