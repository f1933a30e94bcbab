//! Simulated native memory.
//!
//! [`UnmanagedMemory`] tracks the raw byte regions a stub works with: `CoTaskMem` buffers
//! allocated by the runtime helpers, buffers handed over by the native side, and the mirrors of
//! pinned managed objects.
//!
//! # Address Space
//!
//! Each allocation gets a unique base address in a simulated address space
//! (starting at `0x7FFF_0000_0000`). These addresses don't correspond to real
//! process memory but provide consistent addressing for the emulated code. Zero is never
//! handed out, so it stays available as the null pointer.
//!
//! # Memory Limits
//!
//! The unmanaged memory has a configurable maximum size (default 16MB) to
//! prevent runaway allocations. Exceeding this limit returns
//! [`EmulationError::HeapMemoryLimitExceeded`](crate::emulation::EmulationError::HeapMemoryLimitExceeded).

use std::collections::HashMap;

use crate::{emulation::EmulationError, Result};

/// First address handed out.
const BASE_ADDRESS: u64 = 0x7FFF_0000_0000;

/// A handle to an unmanaged memory region.
///
/// `UnmanagedRef` is an opaque reference to an allocated region of unmanaged
/// memory. It contains the base address of the allocation and can be used
/// with [`UnmanagedMemory`] methods to read, write, or free the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnmanagedRef(u64);

impl UnmanagedRef {
    /// Creates a new unmanaged reference from a raw address.
    #[must_use]
    pub fn new(address: u64) -> Self {
        UnmanagedRef(address)
    }

    /// Returns the raw address of this reference.
    #[must_use]
    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn address(&self) -> u64 {
        self.0
    }
}

/// An allocated region of unmanaged memory.
///
/// Freed regions stay in the map with `valid` cleared, so a second free or a use after free is
/// reported instead of silently touching a recycled region.
#[derive(Clone, Debug)]
struct InternalRegion {
    data: Vec<u8>,
    valid: bool,
}

impl InternalRegion {
    fn new(size: usize) -> Self {
        InternalRegion {
            data: vec![0; size],
            valid: true,
        }
    }

    #[inline]
    fn size(&self) -> usize {
        self.data.len()
    }
}

/// Simulated unmanaged memory for tracking raw byte allocations.
///
/// Allocations are zero-initialized and aligned to 16-byte boundaries.
///
/// # Example
///
/// ```rust
/// use dotmarshal::emulation::UnmanagedMemory;
///
/// let mut mem = UnmanagedMemory::new(1024 * 1024);
/// let ptr = mem.alloc(16)?;
/// mem.write(ptr.address() + 4, &[1, 2, 3, 4])?;
/// assert_eq!(mem.read(ptr.address(), 8)?, [0, 0, 0, 0, 1, 2, 3, 4]);
/// mem.free(ptr)?;
/// assert!(!mem.is_valid(ptr.address()));
/// # Ok::<(), dotmarshal::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct UnmanagedMemory {
    regions: HashMap<u64, InternalRegion>,
    next_address: u64,
    current_size: usize,
    max_size: usize,
}

impl UnmanagedMemory {
    /// Creates a new unmanaged memory with the specified size limit in bytes.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        UnmanagedMemory {
            regions: HashMap::new(),
            next_address: BASE_ADDRESS,
            current_size: 0,
            max_size,
        }
    }

    /// Allocates a new zeroed memory region.
    ///
    /// A zero-byte request still receives a unique address.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::HeapMemoryLimitExceeded`] if allocation would
    /// exceed the memory limit.
    pub fn alloc(&mut self, size: usize) -> Result<UnmanagedRef> {
        if self.current_size.saturating_add(size) > self.max_size {
            return Err(EmulationError::HeapMemoryLimitExceeded {
                current: self.current_size,
                limit: self.max_size,
            }
            .into());
        }

        let address = self.next_address;
        self.next_address += size.max(1) as u64;
        self.next_address = (self.next_address + 15) & !15;

        self.regions.insert(address, InternalRegion::new(size));
        self.current_size += size;

        Ok(UnmanagedRef::new(address))
    }

    /// Allocates a region holding a copy of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`EmulationError::HeapMemoryLimitExceeded`] if allocation would
    /// exceed the memory limit.
    pub fn alloc_with_data(&mut self, data: &[u8]) -> Result<UnmanagedRef> {
        let ptr = self.alloc(data.len())?;
        self.write(ptr.address(), data)?;
        Ok(ptr)
    }

    /// Frees a previously allocated memory region.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not the base of a live allocation.
    pub fn free(&mut self, ptr: UnmanagedRef) -> Result<()> {
        if let Some(region) = self.regions.get_mut(&ptr.address()) {
            if region.valid {
                region.valid = false;
                self.current_size = self.current_size.saturating_sub(region.size());
                return Ok(());
            }
        }
        Err(EmulationError::InvalidPointer {
            address: ptr.address(),
            reason: "not a valid allocation or already freed",
        }
        .into())
    }

    /// The live region containing `address` and the offset into it.
    ///
    /// Exact base addresses are found directly; interior addresses need a scan.
    fn find_region(&self, address: u64) -> Option<(u64, usize)> {
        if self.regions.get(&address).is_some_and(|region| region.valid) {
            return Some((address, 0));
        }

        self.regions.iter().find_map(|(&base, region)| {
            let end = base + region.size() as u64;
            #[allow(clippy::cast_possible_truncation)]
            (region.valid && address >= base && address < end)
                .then(|| (base, (address - base) as usize))
        })
    }

    fn locate(&self, address: u64, size: usize, operation: &'static str) -> Result<(u64, usize)> {
        let (base, offset) = self
            .find_region(address)
            .ok_or(EmulationError::InvalidPointer {
                address,
                reason: "address not in any allocated region",
            })?;

        let region_size = self.regions.get(&base).map_or(0, InternalRegion::size);
        if offset + size > region_size {
            return Err(EmulationError::InvalidPointer {
                address,
                reason: operation,
            }
            .into());
        }
        Ok((base, offset))
    }

    /// Reads `size` bytes starting at `address`, which may lie inside an allocation.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the read would exceed
    /// the region bounds.
    pub fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let (base, offset) = self.locate(address, size, "read would exceed region bounds")?;
        Ok(self
            .regions
            .get(&base)
            .map(|region| region.data[offset..offset + size].to_vec())
            .unwrap_or_default())
    }

    /// Writes `data` starting at `address`, which may lie inside an allocation.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or the write would exceed
    /// the region bounds.
    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let (base, offset) = self.locate(address, data.len(), "write would exceed region bounds")?;
        if let Some(region) = self.regions.get_mut(&base) {
            region.data[offset..offset + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    /// Copies memory from one location to another. Overlapping ranges are handled.
    ///
    /// # Errors
    ///
    /// Returns an error if either range is invalid.
    pub fn memcpy(&mut self, dest: u64, src: u64, size: usize) -> Result<()> {
        let data = self.read(src, size)?;
        self.write(dest, &data)
    }

    /// Fills `size` bytes at `address` with `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is invalid.
    pub fn memset(&mut self, address: u64, value: u8, size: usize) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let (base, offset) = self.locate(address, size, "memset would exceed region bounds")?;
        if let Some(region) = self.regions.get_mut(&base) {
            region.data[offset..offset + size].fill(value);
        }
        Ok(())
    }

    /// Bytes from `address` up to, not including, the first zero element of `unit` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if no terminator is found before the end of the region.
    pub fn read_terminated(&self, address: u64, unit: usize) -> Result<Vec<u8>> {
        let (base, offset) = self.locate(address, 0, "terminator search out of bounds")?;
        let data = self
            .regions
            .get(&base)
            .map(|region| &region.data[offset..])
            .unwrap_or_default();

        data.chunks_exact(unit)
            .position(|chunk| chunk.iter().all(|&b| b == 0))
            .map(|end| data[..end * unit].to_vec())
            .ok_or_else(|| {
                EmulationError::InvalidPointer {
                    address,
                    reason: "string is not terminated inside its region",
                }
                .into()
            })
    }

    /// Returns `true` if the address is within an allocated, valid region.
    #[must_use]
    pub fn is_valid(&self, address: u64) -> bool {
        self.find_region(address).is_some()
    }

    /// Returns the current total allocation size in bytes.
    #[must_use]
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    /// Returns the maximum allowed allocation size in bytes.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Size of the live region starting at `base_address`.
    #[must_use]
    pub fn region_size(&self, base_address: u64) -> Option<usize> {
        self.regions
            .get(&base_address)
            .filter(|region| region.valid)
            .map(InternalRegion::size)
    }
}

impl Default for UnmanagedMemory {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}
