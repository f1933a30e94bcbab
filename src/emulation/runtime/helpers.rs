//! Implementations of the runtime helpers generated stubs call.

use widestring::U16String;

use crate::{
    emulation::{encoding, EmulationError, HeapObject, StubRuntime, StubValue, UnmanagedRef},
    interop::RuntimeHelper,
    metadata::typesystem::MarshalType,
    Error, Result,
};

/// Bytes between the start of a pinned string and its first character: an 8-byte object header
/// followed by the 4-byte length.
pub const OFFSET_TO_STRING_DATA: usize = 12;

fn flag(value: &StubValue) -> Result<bool> {
    Ok(value.as_i64("helper flag")? != 0)
}

impl StubRuntime {
    /// Run `helper` with `args` in push order.
    ///
    /// # Errors
    /// [`EmulationError::ArgumentCountMismatch`] if `args` does not match the helper's arity,
    /// otherwise whatever the helper raises.
    pub fn invoke_helper(
        &mut self,
        helper: RuntimeHelper,
        args: &[StubValue],
    ) -> Result<Option<StubValue>> {
        if args.len() != helper.arity() {
            return Err(EmulationError::ArgumentCountMismatch {
                expected: helper.arity(),
                found: args.len(),
            }
            .into());
        }
        log::trace!("{} ({} args)", helper.qualified_name(), args.len());
        self.stats.record_call(helper);

        let result = match helper {
            RuntimeHelper::CoTaskMemAllocAndZeroMemory => {
                let size = args[0].as_i64("CoTaskMemAllocAndZeroMemory")?;
                let size = usize::try_from(size).map_err(|_| Error::AllocationOverflow {
                    count: size,
                    element_size: 1,
                })?;
                StubValue::NativeInt(self.co_task_mem_alloc(size)?)
            }
            RuntimeHelper::CoTaskMemFree => {
                self.co_task_mem_free(&args[0])?;
                return Ok(None);
            }
            RuntimeHelper::OffsetToStringData => {
                StubValue::I4(i32::try_from(OFFSET_TO_STRING_DATA).unwrap_or(i32::MAX))
            }
            RuntimeHelper::StringToUnicodeBuffer => match self.string_value(&args[0])? {
                Some(text) => StubValue::NativeInt(self.alloc_unicode_string(&text)?),
                None => StubValue::NativeInt(0),
            },
            RuntimeHelper::StringToAnsiString => {
                let (best_fit, throw) = (flag(&args[1])?, flag(&args[2])?);
                match self.string_value(&args[0])? {
                    Some(text) => {
                        let mut bytes =
                            encoding::encode_ansi(&U16String::from_str(&text), best_fit, throw)?;
                        bytes.push(0);
                        StubValue::NativeInt(self.counted_buffer(&bytes)?)
                    }
                    None => StubValue::NativeInt(0),
                }
            }
            RuntimeHelper::StringToUtf8String => match self.string_value(&args[0])? {
                Some(text) => {
                    let mut bytes = text.into_bytes();
                    bytes.push(0);
                    StubValue::NativeInt(self.counted_buffer(&bytes)?)
                }
                None => StubValue::NativeInt(0),
            },
            RuntimeHelper::UnicodeBufferToString => match args[0].as_i64("UnicodeBufferToString")? {
                0 => StubValue::Null,
                address => {
                    let text = self.read_utf16(address)?;
                    self.new_string(&text)
                }
            },
            RuntimeHelper::AnsiStringToString => match args[0].as_i64("AnsiStringToString")? {
                0 => StubValue::Null,
                address => {
                    let text = self.read_ansi(address)?;
                    self.new_string(&text)
                }
            },
            RuntimeHelper::Utf8StringToString => match args[0].as_i64("Utf8StringToString")? {
                0 => StubValue::Null,
                address => {
                    #[allow(clippy::cast_sign_loss)]
                    let bytes = self.memory.read_terminated(address as u64, 1)?;
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    self.new_string(&text)
                }
            },
            RuntimeHelper::WideCharToAnsiChar => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let unit = args[0].as_i64("WideCharToAnsiChar")? as u16;
                let byte = encoding::encode_ansi_char(unit, flag(&args[1])?, flag(&args[2])?)?;
                StubValue::I4(i32::from(byte))
            }
            RuntimeHelper::AnsiCharToWideChar => args[0].clone().coerce(&MarshalType::U1),
            RuntimeHelper::StringBuilderToUnicodeBuffer => {
                self.string_builder_to_native(&args[0], flag(&args[1])?, None)?
            }
            RuntimeHelper::StringBuilderToAnsiString => self.string_builder_to_native(
                &args[0],
                flag(&args[1])?,
                Some((flag(&args[2])?, flag(&args[3])?)),
            )?,
            RuntimeHelper::UnicodeBufferToStringBuilder => {
                let text = match args[0].as_i64("UnicodeBufferToStringBuilder")? {
                    0 => String::new(),
                    address => self.read_utf16(address)?,
                };
                self.set_string_builder(&args[1], &text)?;
                return Ok(None);
            }
            RuntimeHelper::AnsiStringToStringBuilder => {
                let text = match args[0].as_i64("AnsiStringToStringBuilder")? {
                    0 => String::new(),
                    address => self.read_ansi(address)?,
                };
                self.set_string_builder(&args[1], &text)?;
                return Ok(None);
            }
            RuntimeHelper::SafeHandleAddRef | RuntimeHelper::SafeHandleRelease => {
                let delta = if helper == RuntimeHelper::SafeHandleAddRef { 1 } else { -1 };
                match self.handle_object(&args[0])? {
                    HeapObject::SafeHandle { ref_count, .. } => *ref_count += delta,
                    other => return Err(heap_mismatch("SafeHandle", other)),
                }
                return Ok(None);
            }
            RuntimeHelper::SafeHandleGetHandle | RuntimeHelper::CriticalHandleGetHandle => {
                StubValue::NativeInt(self.handle_value(&args[0])?)
            }
            RuntimeHelper::SafeHandleSetHandle | RuntimeHelper::CriticalHandleSetHandle => {
                let value = args[1].as_i64("SetHandle")?;
                match self.handle_object(&args[0])? {
                    HeapObject::SafeHandle { handle, .. }
                    | HeapObject::CriticalHandle { handle, .. } => *handle = value,
                    other => return Err(heap_mismatch("SafeHandle or CriticalHandle", other)),
                }
                return Ok(None);
            }
            RuntimeHelper::GetFunctionPointerForDelegate => match &args[0] {
                StubValue::Null => StubValue::NativeInt(0),
                delegate => StubValue::NativeInt(self.delegate_function(delegate)?),
            },
            RuntimeHelper::GetDelegateForFunctionPointer => {
                let function = args[0].as_i64("GetDelegateForFunctionPointer")?;
                let type_name = match &args[1] {
                    StubValue::TypeHandle(ty) => ty.to_string(),
                    other => {
                        return Err(EmulationError::TypeMismatch {
                            operation: "GetDelegateForFunctionPointer",
                            expected: "type handle",
                            found: other.kind_name(),
                        }
                        .into())
                    }
                };
                match function {
                    0 => StubValue::Null,
                    function => match self.delegates.iter().find(|(f, _)| *f == function) {
                        Some((_, reference)) => StubValue::Ref(*reference),
                        None => self.register_delegate(&type_name, function),
                    },
                }
            }
        };
        Ok(Some(result))
    }

    /// `CoTaskMemFree`: every call is counted, null is ignored, anything else must be a live
    /// allocation.
    #[allow(clippy::cast_sign_loss)]
    fn co_task_mem_free(&mut self, pointer: &StubValue) -> Result<()> {
        self.stats.record_free_call();
        let address = pointer.as_i64("CoTaskMemFree")? as u64;
        if address == 0 {
            return Ok(());
        }
        if !self.stats.release(address) {
            return Err(EmulationError::InvalidPointer {
                address,
                reason: "not a CoTaskMem allocation or already freed",
            }
            .into());
        }
        self.memory.free(UnmanagedRef::new(address))
    }

    #[allow(clippy::cast_sign_loss)]
    fn counted_buffer(&mut self, data: &[u8]) -> Result<i64> {
        let address = self.co_task_mem_alloc(data.len())?;
        self.memory.write(address as u64, data)?;
        Ok(address)
    }

    fn handle_object(&mut self, value: &StubValue) -> Result<&mut HeapObject> {
        match value {
            StubValue::Ref(reference) => self.heap.get_mut(*reference),
            StubValue::Null => Err(EmulationError::NullReference.into()),
            other => Err(EmulationError::TypeMismatch {
                operation: "handle helper",
                expected: "object reference",
                found: other.kind_name(),
            }
            .into()),
        }
    }

    /// Allocate a native buffer of the builder's capacity plus terminator. `ansi` carries the
    /// best-fit and throw policy for narrow buffers.
    fn string_builder_to_native(
        &mut self,
        builder: &StubValue,
        copy_contents: bool,
        ansi: Option<(bool, bool)>,
    ) -> Result<StubValue> {
        let reference = match builder {
            StubValue::Null => return Ok(StubValue::NativeInt(0)),
            StubValue::Ref(reference) => *reference,
            other => {
                return Err(EmulationError::TypeMismatch {
                    operation: "StringBuilder helper",
                    expected: "object reference",
                    found: other.kind_name(),
                }
                .into())
            }
        };
        let (contents, capacity) = self.heap.string_builder(reference)?;
        let contents = contents.to_ustring();

        let (unit, data) = match ansi {
            Some((best_fit, throw)) => {
                let data = if copy_contents {
                    encoding::encode_ansi(&contents, best_fit, throw)?
                } else {
                    Vec::new()
                };
                (1, data)
            }
            None => {
                let data = if copy_contents {
                    encoding::utf16_bytes(&contents)
                } else {
                    Vec::new()
                };
                (2, data)
            }
        };

        let address = self.co_task_mem_alloc((capacity + 1) * unit)?;
        #[allow(clippy::cast_sign_loss)]
        self.memory.write(address as u64, &data)?;
        Ok(StubValue::NativeInt(address))
    }

    fn set_string_builder(&mut self, builder: &StubValue, text: &str) -> Result<()> {
        let StubValue::Ref(reference) = builder else {
            return Err(EmulationError::NullReference.into());
        };
        match self.heap.get_mut(*reference)? {
            HeapObject::StringBuilder { contents, capacity } => {
                *contents = U16String::from_str(text);
                *capacity = (*capacity).max(contents.len());
                Ok(())
            }
            other => Err(heap_mismatch("StringBuilder", other)),
        }
    }
}

fn heap_mismatch(expected: &'static str, found: &HeapObject) -> Error {
    EmulationError::HeapTypeMismatch {
        expected,
        found: found.kind_name(),
    }
    .into()
}
