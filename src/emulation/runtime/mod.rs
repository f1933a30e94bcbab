//! State a running stub works against.
//!
//! [`StubRuntime`] owns the managed heap, the simulated native memory, the caller-owned cells
//! used to pass `ref`/`out` arguments, and the frame (arguments and locals) of the stub being
//! executed. Native callees receive the same runtime, so they can dereference the pointers a
//! stub hands them, write results through them, and allocate buffers the stub later frees.
//!
//! # Native representation
//!
//! Values stored in native memory use the little-endian layout of a 64-bit target: integers at
//! their declared width, `nint` and pointers as 8 bytes, `float`/`double` in IEEE format,
//! `decimal` and `Guid` as 16 opaque bytes, and structs field by field at the offsets of
//! [`StructDesc::offsets`].
//!
//! # Pinning
//!
//! Converting a managed pointer or a string/array reference to a native integer (`conv.i`) pins
//! the target: its contents are mirrored into a native region and the address of the mirror is
//! returned. Before every native call the mirrors of arrays and locations are refreshed from the
//! managed side, and after the call they are copied back, which is what makes writes through a
//! pinned pointer visible to managed code. Pinned strings are read-only and never copied back.
//! Mirrors live until the stub returns.

mod helpers;
mod stats;

pub use helpers::OFFSET_TO_STRING_DATA;
pub use stats::HelperStats;

use std::sync::Arc;

use widestring::U16String;

use crate::{
    assembly::Opcode,
    emulation::{
        encoding, handle_ref_layout, EmulationError, EmulationLimits, HeapObject, HeapRef,
        ManagedHeap, ManagedPtr, StructValue, StubValue, UnmanagedMemory, UnmanagedRef,
    },
    metadata::typesystem::{MarshalType, StructDesc},
    Result,
};

/// First synthetic function pointer handed out for a delegate.
const DELEGATE_THUNK_BASE: i64 = 0x7FFE_0000_0000;

/// A pinned object or location and the base address of its native mirror.
#[derive(Debug, Clone)]
struct Pin {
    target: PinTarget,
    base: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum PinTarget {
    Array(HeapRef),
    String(HeapRef),
    Location(ManagedPtr, MarshalType),
}

/// Arguments, locals and pins of the stub currently executing.
#[derive(Debug, Default)]
pub(crate) struct Frame {
    args: Vec<StubValue>,
    locals: Vec<StubValue>,
    local_types: Vec<MarshalType>,
    pins: Vec<Pin>,
}

/// Heap, native memory and helper implementations shared by a stub and its callee.
///
/// # Examples
///
/// ```rust
/// use dotmarshal::emulation::{StubRuntime, StubValue};
/// use dotmarshal::MarshalType;
///
/// let mut runtime = StubRuntime::new();
/// let text = runtime.new_string("hello");
/// assert_eq!(runtime.string_value(&text)?.as_deref(), Some("hello"));
///
/// let buffer = runtime.co_task_mem_alloc(8)?;
/// runtime.write_native(buffer, &MarshalType::I4, &StubValue::I4(7))?;
/// assert_eq!(runtime.read_native(buffer, &MarshalType::I4)?, StubValue::I4(7));
/// # Ok::<(), dotmarshal::Error>(())
/// ```
#[derive(Debug)]
pub struct StubRuntime {
    heap: ManagedHeap,
    memory: UnmanagedMemory,
    cells: Vec<(StubValue, MarshalType)>,
    frame: Frame,
    stats: HelperStats,
    limits: EmulationLimits,
    delegates: Vec<(i64, HeapRef)>,
}

impl Default for StubRuntime {
    fn default() -> Self {
        StubRuntime::new()
    }
}

fn type_mismatch(operation: &'static str, expected: &'static str, found: &StubValue) -> crate::Error {
    EmulationError::TypeMismatch {
        operation,
        expected,
        found: found.kind_name(),
    }
    .into()
}

/// The heap reference of a non-null object reference.
fn object_ref(value: &StubValue, operation: &'static str) -> Result<HeapRef> {
    match value {
        StubValue::Ref(reference) => Ok(*reference),
        StubValue::Null => Err(EmulationError::NullReference.into()),
        other => Err(type_mismatch(operation, "object reference", other)),
    }
}

/// A non-null native address.
#[allow(clippy::cast_sign_loss)]
fn native_address(value: &StubValue, operation: &'static str) -> Result<u64> {
    match value.as_i64(operation)? {
        0 => Err(EmulationError::NullReference.into()),
        address => Ok(address as u64),
    }
}

/// Width in bytes of the integer-like types stored as plain little-endian integers.
fn scalar_size(ty: &MarshalType) -> Option<usize> {
    match ty {
        MarshalType::Boolean | MarshalType::I1 | MarshalType::U1 => Some(1),
        MarshalType::Char | MarshalType::I2 | MarshalType::U2 => Some(2),
        MarshalType::I4 | MarshalType::U4 => Some(4),
        MarshalType::I8
        | MarshalType::U8
        | MarshalType::DateTime
        | MarshalType::I
        | MarshalType::U
        | MarshalType::Pointer(_)
        | MarshalType::FnPtr => Some(8),
        _ => None,
    }
}

fn no_native_layout(ty: &MarshalType) -> crate::Error {
    EmulationError::NoNativeLayout { ty: ty.to_string() }.into()
}

impl StubRuntime {
    /// A runtime with default limits.
    #[must_use]
    pub fn new() -> Self {
        StubRuntime::with_limits(EmulationLimits::default())
    }

    /// A runtime with explicit limits.
    #[must_use]
    pub fn with_limits(limits: EmulationLimits) -> Self {
        StubRuntime {
            heap: ManagedHeap::new(),
            memory: UnmanagedMemory::new(limits.max_memory),
            cells: Vec::new(),
            frame: Frame::default(),
            stats: HelperStats::default(),
            limits,
            delegates: Vec::new(),
        }
    }

    /// The configured limits.
    #[must_use]
    pub fn limits(&self) -> &EmulationLimits {
        &self.limits
    }

    /// The managed heap.
    #[must_use]
    pub fn heap(&self) -> &ManagedHeap {
        &self.heap
    }

    /// The simulated native memory.
    #[must_use]
    pub fn memory(&self) -> &UnmanagedMemory {
        &self.memory
    }

    /// Mutable access to the simulated native memory.
    pub fn memory_mut(&mut self) -> &mut UnmanagedMemory {
        &mut self.memory
    }

    /// Allocation and helper call counters.
    #[must_use]
    pub fn stats(&self) -> &HelperStats {
        &self.stats
    }

    // Managed objects

    /// Allocate a string.
    pub fn new_string(&mut self, text: &str) -> StubValue {
        StubValue::Ref(self.heap.alloc(HeapObject::String(U16String::from_str(text))))
    }

    /// Contents of a string reference; `None` for null.
    ///
    /// # Errors
    /// Fails if `value` references something other than a string.
    pub fn string_value(&self, value: &StubValue) -> Result<Option<String>> {
        match value {
            StubValue::Null => Ok(None),
            other => {
                let reference = object_ref(other, "string")?;
                Ok(Some(self.heap.string(reference)?.to_string_lossy()))
            }
        }
    }

    /// Allocate an array. Items are coerced to the element type.
    pub fn new_array(&mut self, element: MarshalType, items: Vec<StubValue>) -> StubValue {
        let items = items.into_iter().map(|item| item.coerce(&element)).collect();
        StubValue::Ref(self.heap.alloc(HeapObject::Array { element, items }))
    }

    /// Allocate an array of `count` default elements, as `newarr` does.
    ///
    /// # Errors
    /// [`EmulationError::ArithmeticOverflow`] for a negative count,
    /// [`EmulationError::HeapMemoryLimitExceeded`] for a count beyond the memory limit.
    pub fn new_zeroed_array(&mut self, element: &MarshalType, count: i64) -> Result<StubValue> {
        let count = usize::try_from(count).map_err(|_| EmulationError::ArithmeticOverflow)?;
        let bytes = count.saturating_mul(std::mem::size_of::<StubValue>());
        if bytes > self.limits.max_memory {
            return Err(EmulationError::HeapMemoryLimitExceeded {
                current: self.memory.current_size(),
                limit: self.limits.max_memory,
            }
            .into());
        }
        let items = vec![StubValue::default_for(element); count];
        Ok(StubValue::Ref(self.heap.alloc(HeapObject::Array {
            element: element.clone(),
            items,
        })))
    }

    /// Elements of an array reference; `None` for null.
    ///
    /// # Errors
    /// Fails if `value` references something other than an array.
    pub fn array_items(&self, value: &StubValue) -> Result<Option<Vec<StubValue>>> {
        match value {
            StubValue::Null => Ok(None),
            other => {
                let reference = object_ref(other, "array")?;
                Ok(Some(self.heap.array(reference)?.1.to_vec()))
            }
        }
    }

    /// Allocate a `StringBuilder`. The capacity grows to fit `contents`.
    pub fn new_string_builder(&mut self, contents: &str, capacity: usize) -> StubValue {
        let contents = U16String::from_str(contents);
        let capacity = capacity.max(contents.len());
        StubValue::Ref(
            self.heap
                .alloc(HeapObject::StringBuilder { contents, capacity }),
        )
    }

    /// Current contents of a `StringBuilder`.
    ///
    /// # Errors
    /// Fails for null or for anything other than a string builder.
    pub fn string_builder_contents(&self, value: &StubValue) -> Result<String> {
        let reference = object_ref(value, "StringBuilder")?;
        Ok(self.heap.string_builder(reference)?.0.to_string_lossy())
    }

    /// Allocate a `SafeHandle` subclass instance wrapping `handle`.
    pub fn new_safe_handle(&mut self, type_name: &str, handle: i64) -> StubValue {
        StubValue::Ref(self.heap.alloc(HeapObject::SafeHandle {
            type_name: type_name.to_string(),
            handle,
            ref_count: 0,
        }))
    }

    /// Allocate a `CriticalHandle` subclass instance wrapping `handle`.
    pub fn new_critical_handle(&mut self, type_name: &str, handle: i64) -> StubValue {
        StubValue::Ref(self.heap.alloc(HeapObject::CriticalHandle {
            type_name: type_name.to_string(),
            handle,
        }))
    }

    /// The native handle wrapped by a `SafeHandle` or `CriticalHandle`.
    ///
    /// # Errors
    /// Fails for null or for any other object kind.
    pub fn handle_value(&self, value: &StubValue) -> Result<i64> {
        match self.heap.get(object_ref(value, "handle")?)? {
            HeapObject::SafeHandle { handle, .. } | HeapObject::CriticalHandle { handle, .. } => {
                Ok(*handle)
            }
            other => Err(EmulationError::HeapTypeMismatch {
                expected: "SafeHandle or CriticalHandle",
                found: other.kind_name(),
            }
            .into()),
        }
    }

    /// Outstanding `DangerousAddRef` calls on a `SafeHandle`.
    ///
    /// # Errors
    /// Fails for null or for anything other than a `SafeHandle`.
    pub fn safe_handle_ref_count(&self, value: &StubValue) -> Result<i32> {
        match self.heap.get(object_ref(value, "SafeHandle")?)? {
            HeapObject::SafeHandle { ref_count, .. } => Ok(*ref_count),
            other => Err(EmulationError::HeapTypeMismatch {
                expected: "SafeHandle",
                found: other.kind_name(),
            }
            .into()),
        }
    }

    /// Allocate a delegate with a fresh native entry point.
    pub fn new_delegate(&mut self, type_name: &str) -> StubValue {
        let offset = i64::try_from(self.delegates.len()).unwrap_or(i64::MAX / 32);
        let function = DELEGATE_THUNK_BASE + offset * 16;
        self.register_delegate(type_name, function)
    }

    fn register_delegate(&mut self, type_name: &str, function: i64) -> StubValue {
        let reference = self.heap.alloc(HeapObject::Delegate {
            type_name: type_name.to_string(),
            function,
        });
        self.delegates.push((function, reference));
        StubValue::Ref(reference)
    }

    /// Native entry point of a delegate.
    ///
    /// # Errors
    /// Fails for null or for anything other than a delegate.
    pub fn delegate_function(&self, value: &StubValue) -> Result<i64> {
        match self.heap.get(object_ref(value, "delegate")?)? {
            HeapObject::Delegate { function, .. } => Ok(*function),
            other => Err(EmulationError::HeapTypeMismatch {
                expected: "delegate",
                found: other.kind_name(),
            }
            .into()),
        }
    }

    /// Allocate an instance of a layout class with default field values.
    pub fn new_object(&mut self, desc: &Arc<StructDesc>) -> StubValue {
        let StructValue { desc, fields } = StructValue::zeroed(desc);
        StubValue::Ref(self.heap.alloc(HeapObject::Object { desc, fields }))
    }

    /// Field `name` of a class instance.
    ///
    /// # Errors
    /// Fails for null, for non-class objects and for unknown fields.
    pub fn object_field(&self, value: &StubValue, name: &str) -> Result<StubValue> {
        self.read_location(&ManagedPtr::ObjField(object_ref(value, "ldfld")?, name.to_string()))
    }

    /// Set field `name` of a class instance.
    ///
    /// # Errors
    /// Fails for null, for non-class objects and for unknown fields.
    pub fn set_object_field(&mut self, value: &StubValue, name: &str, field: StubValue) -> Result<()> {
        let reference = object_ref(value, "stfld")?;
        self.write_location(&ManagedPtr::ObjField(reference, name.to_string()), field)
    }

    /// A `HandleRef` value.
    #[must_use]
    pub fn handle_ref(&self, wrapper: StubValue, handle: i64) -> StubValue {
        StubValue::Struct(StructValue {
            desc: handle_ref_layout(),
            fields: vec![wrapper, StubValue::NativeInt(handle)],
        })
    }

    /// Create a storage cell and return a managed pointer to it, for `ref`/`out` arguments.
    pub fn new_cell(&mut self, value: StubValue, ty: MarshalType) -> StubValue {
        let value = value.coerce(&ty);
        self.cells.push((value, ty));
        StubValue::Ptr(ManagedPtr::Cell(self.cells.len() - 1))
    }

    /// Current contents of a cell created by [`StubRuntime::new_cell`].
    ///
    /// # Errors
    /// Fails if `cell` is not a pointer to a cell.
    pub fn cell_value(&self, cell: &StubValue) -> Result<StubValue> {
        match cell {
            StubValue::Ptr(pointer @ ManagedPtr::Cell(_)) => self.read_location(pointer),
            other => Err(type_mismatch("cell", "cell pointer", other)),
        }
    }

    // Native memory

    /// Copy `data` into a fresh native region that is not tracked as a `CoTaskMem` allocation.
    ///
    /// # Errors
    /// [`EmulationError::HeapMemoryLimitExceeded`] past the memory limit.
    #[allow(clippy::cast_possible_wrap)]
    pub fn alloc_native(&mut self, data: &[u8]) -> Result<i64> {
        Ok(self.memory.alloc_with_data(data)?.address() as i64)
    }

    /// Allocate a zeroed `CoTaskMem` buffer, as native code returning memory to managed code
    /// does. The stub is expected to free it.
    ///
    /// # Errors
    /// [`EmulationError::HeapMemoryLimitExceeded`] past the memory limit.
    #[allow(clippy::cast_possible_wrap)]
    pub fn co_task_mem_alloc(&mut self, size: usize) -> Result<i64> {
        let region = self.memory.alloc(size)?;
        self.stats.record_allocation(region.address());
        Ok(region.address() as i64)
    }

    fn co_task_mem_alloc_with_data(&mut self, data: &[u8]) -> Result<i64> {
        let address = self.co_task_mem_alloc(data.len())?;
        #[allow(clippy::cast_sign_loss)]
        self.memory.write(address as u64, data)?;
        Ok(address)
    }

    /// Allocate a NUL-terminated UTF-16 copy of `text` as a `CoTaskMem` buffer.
    ///
    /// # Errors
    /// [`EmulationError::HeapMemoryLimitExceeded`] past the memory limit.
    pub fn alloc_unicode_string(&mut self, text: &str) -> Result<i64> {
        let mut bytes = encoding::utf16_bytes(&U16String::from_str(text));
        bytes.extend_from_slice(&[0, 0]);
        self.co_task_mem_alloc_with_data(&bytes)
    }

    /// Allocate a NUL-terminated ANSI copy of `text` as a `CoTaskMem` buffer. Characters outside
    /// the code page become `?`.
    ///
    /// # Errors
    /// [`EmulationError::HeapMemoryLimitExceeded`] past the memory limit.
    pub fn alloc_ansi_string(&mut self, text: &str) -> Result<i64> {
        let mut bytes = encoding::encode_ansi(&U16String::from_str(text), false, false)?;
        bytes.push(0);
        self.co_task_mem_alloc_with_data(&bytes)
    }

    /// Read a NUL-terminated UTF-16 string.
    ///
    /// # Errors
    /// Fails for null, invalid or unterminated buffers.
    pub fn read_utf16(&self, address: i64) -> Result<String> {
        let address = native_address(&StubValue::NativeInt(address), "read_utf16")?;
        let bytes = self.memory.read_terminated(address, 2)?;
        Ok(encoding::utf16_from_bytes(&bytes).to_string_lossy())
    }

    /// Read a NUL-terminated ANSI string.
    ///
    /// # Errors
    /// Fails for null, invalid or unterminated buffers.
    pub fn read_ansi(&self, address: i64) -> Result<String> {
        let address = native_address(&StubValue::NativeInt(address), "read_ansi")?;
        let bytes = self.memory.read_terminated(address, 1)?;
        Ok(encoding::decode_ansi(&bytes).to_string_lossy())
    }

    /// Read a value of type `ty` from native memory.
    ///
    /// # Errors
    /// Fails for null or invalid addresses and for types without a native layout.
    pub fn read_native(&self, address: i64, ty: &MarshalType) -> Result<StubValue> {
        let address = native_address(&StubValue::NativeInt(address), "read_native")?;
        self.read_native_at(address, ty)
    }

    /// Write a value of type `ty` to native memory.
    ///
    /// # Errors
    /// Fails for null or invalid addresses and for types without a native layout.
    pub fn write_native(&mut self, address: i64, ty: &MarshalType, value: &StubValue) -> Result<()> {
        let address = native_address(&StubValue::NativeInt(address), "write_native")?;
        self.write_native_at(address, ty, value)
    }

    fn read_native_at(&self, address: u64, ty: &MarshalType) -> Result<StubValue> {
        match ty {
            MarshalType::Enum { underlying, .. } => self.read_native_at(address, underlying),
            MarshalType::ValueType(desc) => {
                let mut fields = Vec::with_capacity(desc.fields.len());
                for (field, offset) in desc.fields.iter().zip(desc.offsets()) {
                    fields.push(self.read_native_at(address + offset as u64, &field.ty)?);
                }
                Ok(StubValue::Struct(StructValue {
                    desc: Arc::clone(desc),
                    fields,
                }))
            }
            MarshalType::Decimal | MarshalType::Guid => {
                Ok(StubValue::Blob(self.memory.read(address, 16)?))
            }
            MarshalType::R4 => {
                let bytes = self.memory.read(address, 4)?;
                let bits = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Ok(StubValue::F(f64::from(f32::from_bits(bits))))
            }
            MarshalType::R8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.memory.read(address, 8)?);
                Ok(StubValue::F(f64::from_le_bytes(raw)))
            }
            other => {
                let size = scalar_size(other).ok_or_else(|| no_native_layout(other))?;
                let mut raw = [0u8; 8];
                raw[..size].copy_from_slice(&self.memory.read(address, size)?);
                let bits = u64::from_le_bytes(raw);
                Ok(decode_scalar(other, bits))
            }
        }
    }

    fn write_native_at(&mut self, address: u64, ty: &MarshalType, value: &StubValue) -> Result<()> {
        match ty {
            MarshalType::Enum { underlying, .. } => self.write_native_at(address, underlying, value),
            MarshalType::ValueType(desc) => {
                let fields = match value {
                    StubValue::Struct(structure) => structure.fields.clone(),
                    StubValue::Null => StructValue::zeroed(desc).fields,
                    other => return Err(type_mismatch("stobj", "value type", other)),
                };
                for ((field, offset), field_value) in
                    desc.fields.iter().zip(desc.offsets()).zip(&fields)
                {
                    self.write_native_at(address + offset as u64, &field.ty, field_value)?;
                }
                Ok(())
            }
            MarshalType::Decimal | MarshalType::Guid => {
                let mut bytes = match value {
                    StubValue::Blob(bytes) => bytes.clone(),
                    StubValue::Null => Vec::new(),
                    other => return Err(type_mismatch("stobj", "16-byte value", other)),
                };
                bytes.resize(16, 0);
                self.memory.write(address, &bytes)
            }
            MarshalType::R4 => {
                #[allow(clippy::cast_possible_truncation)]
                let single = float_value(value)? as f32;
                self.memory.write(address, &single.to_le_bytes())
            }
            MarshalType::R8 => self.memory.write(address, &float_value(value)?.to_le_bytes()),
            other => {
                let size = scalar_size(other).ok_or_else(|| no_native_layout(other))?;
                let bits = value.as_i64("stobj")?.to_le_bytes();
                self.memory.write(address, &bits[..size])
            }
        }
    }

    /// Load a value of type `ty` through a managed pointer or native address.
    ///
    /// # Errors
    /// Fails for null or dangling addresses and for types without a native layout.
    pub fn load_indirect(&self, address: &StubValue, ty: &MarshalType) -> Result<StubValue> {
        match address {
            StubValue::Ptr(pointer) => self.read_location(pointer),
            StubValue::Null | StubValue::I4(_) | StubValue::I8(_) | StubValue::NativeInt(_) => {
                self.read_native_at(native_address(address, "ldobj")?, ty)
            }
            other => Err(type_mismatch("ldobj", "address", other)),
        }
    }

    /// Store a value of type `ty` through a managed pointer or native address.
    ///
    /// # Errors
    /// Fails for null or dangling addresses and for types without a native layout.
    pub fn store_indirect(
        &mut self,
        address: &StubValue,
        ty: &MarshalType,
        value: StubValue,
    ) -> Result<()> {
        match address {
            StubValue::Ptr(pointer) => self.write_location(pointer, value.coerce(ty)),
            StubValue::Null | StubValue::I4(_) | StubValue::I8(_) | StubValue::NativeInt(_) => {
                self.write_native_at(native_address(address, "stobj")?, ty, &value)
            }
            other => Err(type_mismatch("stobj", "address", other)),
        }
    }

    /// Reset the value at `address` to the default of `ty`, as `initobj` does.
    ///
    /// # Errors
    /// Fails for null or dangling addresses.
    pub fn init_indirect(&mut self, address: &StubValue, ty: &MarshalType) -> Result<()> {
        match address {
            StubValue::Ptr(pointer) => self.write_location(pointer, StubValue::default_for(ty)),
            other => {
                let address = native_address(other, "initobj")?;
                self.memory.memset(address, 0, ty.native_size())
            }
        }
    }

    // Managed locations

    fn frame_slot<'v>(
        values: &'v [StubValue],
        index: u16,
        local: bool,
    ) -> Result<&'v StubValue> {
        values.get(usize::from(index)).ok_or_else(|| {
            let (index, count) = (usize::from(index), values.len());
            if local {
                EmulationError::LocalIndexOutOfBounds { index, count }.into()
            } else {
                EmulationError::ArgumentIndexOutOfBounds { index, count }.into()
            }
        })
    }

    fn frame_slot_mut(
        values: &mut [StubValue],
        index: u16,
        local: bool,
    ) -> Result<&mut StubValue> {
        let count = values.len();
        values.get_mut(usize::from(index)).ok_or_else(|| {
            let index = usize::from(index);
            if local {
                EmulationError::LocalIndexOutOfBounds { index, count }.into()
            } else {
                EmulationError::ArgumentIndexOutOfBounds { index, count }.into()
            }
        })
    }

    fn invalid_cell(index: usize) -> crate::Error {
        EmulationError::InvalidPointer {
            address: index as u64,
            reason: "unknown cell",
        }
        .into()
    }

    /// Read the value a managed pointer designates.
    ///
    /// # Errors
    /// Fails for dangling pointers.
    pub fn read_location(&self, pointer: &ManagedPtr) -> Result<StubValue> {
        match pointer {
            ManagedPtr::Arg(index) => Self::frame_slot(&self.frame.args, *index, false).cloned(),
            ManagedPtr::Local(index) => Self::frame_slot(&self.frame.locals, *index, true).cloned(),
            ManagedPtr::Cell(index) => self
                .cells
                .get(*index)
                .map(|(value, _)| value.clone())
                .ok_or_else(|| Self::invalid_cell(*index)),
            ManagedPtr::Element(array, index) => {
                let (_, items) = self.heap.array(*array)?;
                items.get(*index).cloned().ok_or_else(|| {
                    EmulationError::ArrayIndexOutOfBounds {
                        index: i64::try_from(*index).unwrap_or(i64::MAX),
                        length: items.len(),
                    }
                    .into()
                })
            }
            ManagedPtr::ObjField(object, name) => match self.heap.get(*object)? {
                HeapObject::Object { desc, fields } => desc
                    .fields
                    .iter()
                    .position(|field| field.name == *name)
                    .map(|position| fields[position].clone())
                    .ok_or_else(|| {
                        EmulationError::FieldNotFound {
                            owner: desc.name.clone(),
                            field: name.clone(),
                        }
                        .into()
                    }),
                other => Err(EmulationError::HeapTypeMismatch {
                    expected: "object",
                    found: other.kind_name(),
                }
                .into()),
            },
            ManagedPtr::Field(inner, name) => match self.read_location(inner)? {
                StubValue::Struct(structure) => structure.field(name).cloned(),
                other => Err(type_mismatch("ldfld", "value type", &other)),
            },
        }
    }

    /// Store into the location a managed pointer designates, coercing to the location's type
    /// where it has one.
    ///
    /// # Errors
    /// Fails for dangling pointers.
    pub fn write_location(&mut self, pointer: &ManagedPtr, value: StubValue) -> Result<()> {
        match pointer {
            ManagedPtr::Arg(index) => {
                *Self::frame_slot_mut(&mut self.frame.args, *index, false)? = value;
            }
            ManagedPtr::Local(index) => {
                let value = match self.frame.local_types.get(usize::from(*index)) {
                    Some(ty) => value.coerce(ty),
                    None => value,
                };
                *Self::frame_slot_mut(&mut self.frame.locals, *index, true)? = value;
            }
            ManagedPtr::Cell(index) => {
                let (slot, ty) = self
                    .cells
                    .get_mut(*index)
                    .ok_or_else(|| Self::invalid_cell(*index))?;
                *slot = value.coerce(ty);
            }
            ManagedPtr::Element(array, index) => {
                let (element, items) = self.heap.array_mut(*array)?;
                let length = items.len();
                let slot = items.get_mut(*index).ok_or(EmulationError::ArrayIndexOutOfBounds {
                    index: i64::try_from(*index).unwrap_or(i64::MAX),
                    length,
                })?;
                *slot = value.coerce(element);
            }
            ManagedPtr::ObjField(object, name) => {
                let (desc, fields) = self.heap.object_mut(*object)?;
                let position = desc
                    .fields
                    .iter()
                    .position(|field| field.name == *name)
                    .ok_or_else(|| EmulationError::FieldNotFound {
                        owner: desc.name.clone(),
                        field: name.clone(),
                    })?;
                fields[position] = value.coerce(&desc.fields[position].ty);
            }
            ManagedPtr::Field(inner, name) => {
                let mut current = self.read_location(inner)?;
                match &mut current {
                    StubValue::Struct(structure) => structure.set_field(name, value)?,
                    other => return Err(type_mismatch("stfld", "value type", other)),
                }
                self.write_location(inner, current)?;
            }
        }
        Ok(())
    }

    /// Declared or inferred type of the value a managed pointer designates.
    fn location_type(&self, pointer: &ManagedPtr) -> Result<MarshalType> {
        match pointer {
            ManagedPtr::Local(index) => self
                .frame
                .local_types
                .get(usize::from(*index))
                .cloned()
                .ok_or_else(|| {
                    EmulationError::LocalIndexOutOfBounds {
                        index: usize::from(*index),
                        count: self.frame.local_types.len(),
                    }
                    .into()
                }),
            ManagedPtr::Cell(index) => self
                .cells
                .get(*index)
                .map(|(_, ty)| ty.clone())
                .ok_or_else(|| Self::invalid_cell(*index)),
            ManagedPtr::Element(array, _) => Ok(self.heap.array(*array)?.0.clone()),
            ManagedPtr::ObjField(object, name) => match self.heap.get(*object)? {
                HeapObject::Object { desc, .. } => field_type(desc, name),
                other => Err(EmulationError::HeapTypeMismatch {
                    expected: "object",
                    found: other.kind_name(),
                }
                .into()),
            },
            ManagedPtr::Field(inner, name) => match self.read_location(inner)? {
                StubValue::Struct(structure) => field_type(&structure.desc, name),
                other => Err(type_mismatch("ldflda", "value type", &other)),
            },
            ManagedPtr::Arg(_) => match self.read_location(pointer)? {
                StubValue::I4(_) => Ok(MarshalType::I4),
                StubValue::I8(_) => Ok(MarshalType::I8),
                StubValue::NativeInt(_) => Ok(MarshalType::I),
                StubValue::F(_) => Ok(MarshalType::R8),
                StubValue::Blob(_) => Ok(MarshalType::Guid),
                StubValue::Struct(structure) => Ok(MarshalType::ValueType(structure.desc)),
                other => Err(EmulationError::NoNativeLayout {
                    ty: other.kind_name().to_string(),
                }
                .into()),
            },
        }
    }

    /// `ldfld`: read a field of a struct value, of the struct a pointer designates, or of a
    /// class instance.
    ///
    /// # Errors
    /// Fails for null and for unknown fields.
    pub fn load_field(&self, object: &StubValue, name: &str) -> Result<StubValue> {
        match object {
            StubValue::Struct(structure) => structure.field(name).cloned(),
            StubValue::Ptr(pointer) => {
                self.read_location(&ManagedPtr::Field(Box::new(pointer.clone()), name.to_string()))
            }
            StubValue::Ref(reference) => {
                self.read_location(&ManagedPtr::ObjField(*reference, name.to_string()))
            }
            StubValue::Null => Err(EmulationError::NullReference.into()),
            other => Err(type_mismatch("ldfld", "object or value type", other)),
        }
    }

    /// `ldflda`: the address of a field.
    ///
    /// # Errors
    /// Fails for null and for values without addressable fields.
    pub fn field_address(&self, object: &StubValue, name: &str) -> Result<StubValue> {
        match object {
            StubValue::Ptr(pointer) => Ok(StubValue::Ptr(ManagedPtr::Field(
                Box::new(pointer.clone()),
                name.to_string(),
            ))),
            StubValue::Ref(reference) => Ok(StubValue::Ptr(ManagedPtr::ObjField(
                *reference,
                name.to_string(),
            ))),
            StubValue::Null => Err(EmulationError::NullReference.into()),
            other => Err(type_mismatch("ldflda", "object or managed pointer", other)),
        }
    }

    /// `stfld`: write a field through a pointer to a struct or of a class instance.
    ///
    /// # Errors
    /// Fails for null and for unknown fields.
    pub fn store_field(&mut self, object: &StubValue, name: &str, value: StubValue) -> Result<()> {
        let pointer = match object {
            StubValue::Ptr(pointer) => ManagedPtr::Field(Box::new(pointer.clone()), name.to_string()),
            StubValue::Ref(reference) => ManagedPtr::ObjField(*reference, name.to_string()),
            StubValue::Null => return Err(EmulationError::NullReference.into()),
            other => return Err(type_mismatch("stfld", "object or managed pointer", other)),
        };
        self.write_location(&pointer, value)
    }

    /// `newobj` for the types a stub constructs: handle wrappers and layout classes.
    ///
    /// # Errors
    /// [`EmulationError::UnsupportedInstruction`] for any other type.
    pub fn new_default_object(&mut self, ty: &MarshalType) -> Result<StubValue> {
        match ty {
            MarshalType::SafeHandle(name) => Ok(self.new_safe_handle(name, 0)),
            MarshalType::CriticalHandle(name) => Ok(self.new_critical_handle(name, 0)),
            MarshalType::Class(desc) => Ok(self.new_object(desc)),
            _ => Err(EmulationError::UnsupportedInstruction {
                opcode: Opcode::Newobj,
                operand: "type without a default constructor",
            }
            .into()),
        }
    }

    // Frames

    pub(crate) fn enter_frame(&mut self, args: Vec<StubValue>, local_types: Vec<MarshalType>) -> Frame {
        let locals = local_types.iter().map(StubValue::default_for).collect();
        std::mem::replace(
            &mut self.frame,
            Frame {
                args,
                locals,
                local_types,
                pins: Vec::new(),
            },
        )
    }

    pub(crate) fn leave_frame(&mut self, saved: Frame) {
        let frame = std::mem::replace(&mut self.frame, saved);
        for pin in frame.pins {
            if let Err(error) = self.memory.free(UnmanagedRef::new(pin.base)) {
                log::warn!("releasing pinned mirror 0x{:X} failed: {error}", pin.base);
            }
        }
    }

    /// Argument `index` of the executing stub.
    pub(crate) fn load_arg(&self, index: u16) -> Result<StubValue> {
        Self::frame_slot(&self.frame.args, index, false).cloned()
    }

    /// Local `index` of the executing stub.
    pub(crate) fn load_local(&self, index: u16) -> Result<StubValue> {
        Self::frame_slot(&self.frame.locals, index, true).cloned()
    }

    // Pinning

    /// Pin the target of a managed pointer or object reference and return its native address.
    pub(crate) fn pin(&mut self, value: &StubValue) -> Result<i64> {
        let address = match value {
            StubValue::Ref(reference) => match self.heap.get(*reference)? {
                HeapObject::String(_) => self.pin_string(*reference)?,
                HeapObject::Array { .. } => self.pin_array(*reference)?,
                other => {
                    return Err(EmulationError::HeapTypeMismatch {
                        expected: "string or array",
                        found: other.kind_name(),
                    }
                    .into())
                }
            },
            StubValue::Ptr(ManagedPtr::Element(array, index)) => {
                let base = self.pin_array(*array)?;
                let stride = self.heap.array(*array)?.0.native_size();
                base + (*index * stride) as u64
            }
            StubValue::Ptr(pointer) => self.pin_location(pointer)?,
            other => return Err(type_mismatch("conv.i", "managed pointer", other)),
        };
        #[allow(clippy::cast_possible_wrap)]
        let address = address as i64;
        Ok(address)
    }

    fn existing_pin(&self, target: &PinTarget) -> Option<u64> {
        self.frame
            .pins
            .iter()
            .find(|pin| pin.target == *target)
            .map(|pin| pin.base)
    }

    fn pin_string(&mut self, reference: HeapRef) -> Result<u64> {
        let target = PinTarget::String(reference);
        if let Some(base) = self.existing_pin(&target) {
            return Ok(base);
        }

        let text = self.heap.string(reference)?;
        let length = u32::try_from(text.len()).unwrap_or(u32::MAX);
        let mut image = vec![0u8; OFFSET_TO_STRING_DATA];
        image[OFFSET_TO_STRING_DATA - 4..].copy_from_slice(&length.to_le_bytes());
        image.extend(encoding::utf16_bytes(text));
        image.extend_from_slice(&[0, 0]);

        let base = self.memory.alloc_with_data(&image)?.address();
        log::trace!("pinned string {reference} at 0x{base:X}");
        self.frame.pins.push(Pin { target, base });
        Ok(base)
    }

    fn pin_array(&mut self, reference: HeapRef) -> Result<u64> {
        let target = PinTarget::Array(reference);
        if let Some(base) = self.existing_pin(&target) {
            return Ok(base);
        }

        let (element, items) = self.heap.array(reference)?;
        let element = element.clone();
        let count = items.len();
        let stride = element.native_size();
        let base = self.memory.alloc(count * stride)?.address();
        self.frame.pins.push(Pin { target, base });
        self.write_array_mirror(reference, base)?;
        log::trace!("pinned array {reference} ({count} x {element}) at 0x{base:X}");
        Ok(base)
    }

    fn pin_location(&mut self, pointer: &ManagedPtr) -> Result<u64> {
        let ty = self.location_type(pointer)?;
        let target = PinTarget::Location(pointer.clone(), ty.clone());
        if let Some(base) = self.existing_pin(&target) {
            return Ok(base);
        }

        let base = self.memory.alloc(ty.native_size())?.address();
        self.frame.pins.push(Pin { target, base });
        let value = self.read_location(pointer)?;
        self.write_native_at(base, &ty, &value)?;
        log::trace!("pinned {pointer:?} as {ty} at 0x{base:X}");
        Ok(base)
    }

    fn write_array_mirror(&mut self, reference: HeapRef, base: u64) -> Result<()> {
        let (element, items) = self.heap.array(reference)?;
        let element = element.clone();
        let items = items.to_vec();
        let stride = element.native_size() as u64;
        for (index, item) in items.iter().enumerate() {
            self.write_native_at(base + index as u64 * stride, &element, item)?;
        }
        Ok(())
    }

    /// Copy managed contents into the mirrors, ahead of a native call.
    pub(crate) fn refresh_pins(&mut self) -> Result<()> {
        for pin in self.frame.pins.clone() {
            match &pin.target {
                PinTarget::Array(reference) => self.write_array_mirror(*reference, pin.base)?,
                PinTarget::Location(pointer, ty) => {
                    let value = self.read_location(pointer)?;
                    self.write_native_at(pin.base, ty, &value)?;
                }
                PinTarget::String(_) => {}
            }
        }
        Ok(())
    }

    /// Copy mirror contents back into managed storage, after a native call.
    pub(crate) fn sync_pins(&mut self) -> Result<()> {
        for pin in self.frame.pins.clone() {
            match &pin.target {
                PinTarget::Array(reference) => {
                    let (element, items) = self.heap.array(*reference)?;
                    let element = element.clone();
                    let count = items.len();
                    let stride = element.native_size() as u64;
                    for index in 0..count {
                        let value = self.read_native_at(pin.base + index as u64 * stride, &element)?;
                        self.write_location(&ManagedPtr::Element(*reference, index), value)?;
                    }
                }
                PinTarget::Location(pointer, ty) => {
                    let value = self.read_native_at(pin.base, ty)?;
                    self.write_location(pointer, value)?;
                }
                PinTarget::String(_) => {}
            }
        }
        Ok(())
    }
}

fn field_type(desc: &StructDesc, name: &str) -> Result<MarshalType> {
    desc.field_by_name(name)
        .map(|field| field.ty.clone())
        .ok_or_else(|| {
            EmulationError::FieldNotFound {
                owner: desc.name.clone(),
                field: name.to_string(),
            }
            .into()
        })
}

fn float_value(value: &StubValue) -> Result<f64> {
    match value {
        StubValue::F(float) => Ok(*float),
        #[allow(clippy::cast_precision_loss)]
        other => Ok(other.as_i64("stobj")? as f64),
    }
}

/// Widen raw little-endian bits of a scalar to its stack representation.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn decode_scalar(ty: &MarshalType, bits: u64) -> StubValue {
    match ty {
        MarshalType::I1 => StubValue::I4(i32::from(bits as u8 as i8)),
        MarshalType::Boolean | MarshalType::U1 => StubValue::I4(i32::from(bits as u8)),
        MarshalType::I2 => StubValue::I4(i32::from(bits as u16 as i16)),
        MarshalType::Char | MarshalType::U2 => StubValue::I4(i32::from(bits as u16)),
        MarshalType::I4 | MarshalType::U4 => StubValue::I4(bits as u32 as i32),
        MarshalType::I8 | MarshalType::U8 | MarshalType::DateTime => StubValue::I8(bits as i64),
        _ => StubValue::NativeInt(bits as i64),
    }
}
