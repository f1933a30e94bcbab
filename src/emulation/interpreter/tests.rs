//! Interpreter tests.
//!
//! Most cases build a real stub with [`PInvokeStubBuilder`] and run it with a closure standing in
//! for the native function, checking both what the native side received and what the managed
//! side sees afterwards. A few hand-assembled bodies cover faults generated stubs never produce.

use std::sync::Arc;

use super::*;
use crate::{
    assembly::{CodeStream, StubEmitter},
    emulation::{EmulationLimits, StructValue},
    interop::{
        DefaultHelperResolver, MarshalDirection, PInvokeFlags, PInvokeMethod, PInvokeParameter,
        PInvokeStubBuilder, RuntimeHelper,
    },
    metadata::typesystem::StructDesc,
    Error, MarshalAsDescriptor,
};

fn builder() -> PInvokeStubBuilder {
    PInvokeStubBuilder::new(&DefaultHelperResolver).unwrap()
}

fn build(method: &PInvokeMethod) -> StubBody {
    builder().build(method).unwrap()
}

fn person() -> Arc<StructDesc> {
    StructDesc::sequential("Person")
        .field("Name", MarshalType::String)
        .field("Age", MarshalType::I4)
        .build()
}

fn utf16_with_terminator(text: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    bytes.extend_from_slice(&[0, 0]);
    bytes
}

#[test]
fn blittable_arguments_pass_through() {
    let stub = build(
        &PInvokeMethod::new("add", MarshalType::I4)
            .parameter(PInvokeParameter::new(MarshalType::I4))
            .parameter(PInvokeParameter::new(MarshalType::I8)),
    );

    let mut runtime = StubRuntime::new();
    let mut seen = Vec::new();
    let result = StubInterpreter::new(&stub)
        .run(
            &mut runtime,
            vec![StubValue::I4(2), StubValue::I8(40)],
            |_, args| {
                seen = args.to_vec();
                Ok(Some(StubValue::I4(42)))
            },
        )
        .unwrap();

    assert_eq!(result, Some(StubValue::I4(42)));
    assert_eq!(seen, vec![StubValue::I4(2), StubValue::I8(40)]);
    assert_eq!(runtime.stats().total_calls(), 0);
}

#[test]
fn booleans_are_normalized_both_ways() {
    let stub = build(
        &PInvokeMethod::new("flip", MarshalType::Boolean)
            .parameter(PInvokeParameter::new(MarshalType::Boolean)),
    );

    let mut runtime = StubRuntime::new();
    let mut passed = StubValue::Null;
    let result = StubInterpreter::new(&stub)
        .run(&mut runtime, vec![StubValue::I4(1)], |_, args| {
            passed = args[0].clone();
            Ok(Some(StubValue::I4(-7)))
        })
        .unwrap();

    assert_eq!(passed, StubValue::I4(1));
    assert_eq!(result, Some(StubValue::I4(1)));
}

#[test]
fn in_string_is_pinned_not_copied() {
    let stub = build(
        &PInvokeMethod::new("strlen_w", MarshalType::I4)
            .parameter(PInvokeParameter::new(MarshalType::String)),
    );

    let mut runtime = StubRuntime::new();
    let text = runtime.new_string("pinned");
    let result = StubInterpreter::new(&stub)
        .run(&mut runtime, vec![text], |rt, args| {
            let address = args[0].as_i64("strlen_w")?;
            let contents = rt.read_utf16(address)?;
            assert_eq!(contents, "pinned");
            #[allow(clippy::cast_sign_loss)]
            let header = rt.memory().read(address as u64 - 4, 4)?;
            assert_eq!(header, 6u32.to_le_bytes().to_vec());
            Ok(Some(StubValue::I4(i32::try_from(contents.len()).unwrap())))
        })
        .unwrap();

    assert_eq!(result, Some(StubValue::I4(6)));
    assert_eq!(runtime.stats().allocations(), 0);
    assert_eq!(runtime.stats().frees(), 0);
    assert_eq!(runtime.memory().current_size(), 0);
}

#[test]
fn null_string_passes_null_pointer() {
    let stub = build(
        &PInvokeMethod::new("puts", MarshalType::Void)
            .parameter(PInvokeParameter::new(MarshalType::String)),
    );

    let mut runtime = StubRuntime::new();
    let mut passed = StubValue::Null;
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![StubValue::Null], |_, args| {
            passed = args[0].clone();
            Ok(None)
        })
        .unwrap();
    assert_eq!(passed, StubValue::NativeInt(0));
}

#[test]
fn ansi_string_is_copied_and_freed() {
    let stub = build(
        &PInvokeMethod::new("puts", MarshalType::I4)
            .flags(PInvokeFlags::CHARSET_ANSI)
            .parameter(PInvokeParameter::new(MarshalType::String)),
    );

    let mut runtime = StubRuntime::new();
    let text = runtime.new_string("caf\u{e9}");
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![text], |rt, args| {
            let address = args[0].as_i64("puts")?;
            #[allow(clippy::cast_sign_loss)]
            let bytes = rt.memory().read_terminated(address as u64, 1)?;
            assert_eq!(bytes, b"caf\xE9".to_vec());
            Ok(Some(StubValue::I4(0)))
        })
        .unwrap();

    assert_eq!(runtime.stats().allocations(), 1);
    assert_eq!(runtime.stats().frees(), 1);
    assert!(runtime.stats().is_balanced());
}

#[test]
fn unmappable_character_raises_under_throwing_policy() {
    let stub = build(
        &PInvokeMethod::new("puts", MarshalType::Void)
            .flags(PInvokeFlags::CHARSET_ANSI | PInvokeFlags::THROW_ON_UNMAPPABLE_CHAR)
            .parameter(PInvokeParameter::new(MarshalType::String)),
    );

    let mut runtime = StubRuntime::new();
    let text = runtime.new_string("\u{4e2d}");
    let result = StubInterpreter::new(&stub).run(&mut runtime, vec![text], |_, _| {
        panic!("the native function must not be reached")
    });
    assert!(matches!(
        result,
        Err(Error::UnmappableChar {
            code_point: 0x4E2D,
            ..
        })
    ));
}

#[test]
fn blittable_array_is_pinned_and_written_back() {
    let stub = build(
        &PInvokeMethod::new("fill", MarshalType::Void)
            .parameter(PInvokeParameter::new(MarshalType::sz_array(MarshalType::I4)).in_out()),
    );
    assert!(stub.has_pinned_locals());

    let mut runtime = StubRuntime::new();
    let values = runtime.new_array(
        MarshalType::I4,
        vec![StubValue::I4(10), StubValue::I4(20), StubValue::I4(30)],
    );
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![values.clone()], |rt, args| {
            let base = args[0].as_i64("fill")?;
            for (index, value) in [1, 2, 3].into_iter().enumerate() {
                let address = base + i64::try_from(index).unwrap() * 4;
                assert_eq!(
                    rt.read_native(address, &MarshalType::I4)?,
                    StubValue::I4((i32::try_from(index).unwrap() + 1) * 10)
                );
                rt.write_native(address, &MarshalType::I4, &StubValue::I4(value))?;
            }
            Ok(None)
        })
        .unwrap();

    assert_eq!(
        runtime.array_items(&values).unwrap().unwrap(),
        vec![StubValue::I4(1), StubValue::I4(2), StubValue::I4(3)]
    );
    assert_eq!(runtime.stats().allocations(), 0);
    assert_eq!(runtime.memory().current_size(), 0);
}

#[test]
fn string_array_elements_are_converted_and_released() {
    let stub = build(
        &PInvokeMethod::new("join", MarshalType::I4)
            .parameter(PInvokeParameter::new(MarshalType::sz_array(MarshalType::String))),
    );

    let mut runtime = StubRuntime::new();
    let first = runtime.new_string("alpha");
    let third = runtime.new_string("gamma");
    let names = runtime.new_array(MarshalType::String, vec![first, StubValue::Null, third]);

    let mut received = Vec::new();
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![names], |rt, args| {
            let base = args[0].as_i64("join")?;
            for index in 0..3 {
                let element = rt
                    .read_native(base + index * 8, &MarshalType::pointer(MarshalType::Char))?
                    .as_i64("join")?;
                received.push(if element == 0 {
                    None
                } else {
                    Some(rt.read_utf16(element)?)
                });
            }
            Ok(Some(StubValue::I4(0)))
        })
        .unwrap();

    assert_eq!(
        received,
        vec![Some("alpha".to_string()), None, Some("gamma".to_string())]
    );
    let stats = runtime.stats();
    assert_eq!(stats.allocations(), 3);
    assert_eq!(stats.frees(), 3);
    assert!(stats.is_balanced());
}

#[test]
fn out_string_array_uses_size_parameter() {
    let stub = build(
        &PInvokeMethod::new("fill", MarshalType::Void)
            .parameter(
                PInvokeParameter::new(MarshalType::sz_array(MarshalType::String))
                    .out()
                    .with_marshal_as(MarshalAsDescriptor::array(None, Some(1), None)),
            )
            .parameter(PInvokeParameter::new(MarshalType::I4)),
    );

    let mut runtime = StubRuntime::new();
    let names = runtime.new_array(MarshalType::String, vec![StubValue::Null; 2]);
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![names.clone(), StubValue::I4(2)], |rt, args| {
            let base = args[0].as_i64("fill")?;
            for (index, text) in ["one", "two"].into_iter().enumerate() {
                let element = rt.alloc_unicode_string(text)?;
                let slot = base + i64::try_from(index).unwrap() * 8;
                rt.write_native(slot, &MarshalType::I, &StubValue::NativeInt(element))?;
            }
            Ok(None)
        })
        .unwrap();

    let items = runtime.array_items(&names).unwrap().unwrap();
    let texts: Vec<_> = items
        .iter()
        .map(|item| runtime.string_value(item).unwrap())
        .collect();
    assert_eq!(texts, vec![Some("one".to_string()), Some("two".to_string())]);
    assert!(runtime.stats().is_balanced());
}

#[test]
fn by_ref_int_is_pinned_in_place() {
    let stub = build(
        &PInvokeMethod::new("increment", MarshalType::Void)
            .parameter(PInvokeParameter::new(MarshalType::by_ref(MarshalType::I4))),
    );

    let mut runtime = StubRuntime::new();
    let cell = runtime.new_cell(StubValue::I4(41), MarshalType::I4);
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![cell.clone()], |rt, args| {
            let address = args[0].as_i64("increment")?;
            let current = rt.read_native(address, &MarshalType::I4)?.as_i64("increment")?;
            rt.write_native(address, &MarshalType::I4, &StubValue::from(current + 1))
                .map(|()| None)
        })
        .unwrap();

    assert_eq!(runtime.cell_value(&cell).unwrap(), StubValue::I4(42));
}

#[test]
fn by_ref_bool_is_staged_and_copied_back() {
    let stub = build(
        &PInvokeMethod::new("toggle", MarshalType::Void)
            .parameter(PInvokeParameter::new(MarshalType::by_ref(MarshalType::Boolean))),
    );

    let mut runtime = StubRuntime::new();
    let cell = runtime.new_cell(StubValue::I4(1), MarshalType::Boolean);
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![cell.clone()], |rt, args| {
            assert_eq!(rt.load_indirect(&args[0], &MarshalType::I4)?, StubValue::I4(1));
            rt.store_indirect(&args[0], &MarshalType::I4, StubValue::I4(0))?;
            Ok(None)
        })
        .unwrap();

    assert_eq!(runtime.cell_value(&cell).unwrap(), StubValue::I4(0));
}

#[test]
fn out_string_is_allocated_by_callee_and_freed() {
    let stub = build(
        &PInvokeMethod::new("get_name", MarshalType::Void)
            .parameter(PInvokeParameter::new(MarshalType::by_ref(MarshalType::String)).out()),
    );

    let mut runtime = StubRuntime::new();
    let cell = runtime.new_cell(StubValue::Null, MarshalType::String);
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![cell.clone()], |rt, args| {
            let text = rt.alloc_unicode_string("result")?;
            rt.store_indirect(
                &args[0],
                &MarshalType::pointer(MarshalType::Char),
                StubValue::NativeInt(text),
            )?;
            Ok(None)
        })
        .unwrap();

    let value = runtime.cell_value(&cell).unwrap();
    assert_eq!(
        runtime.string_value(&value).unwrap().as_deref(),
        Some("result")
    );
    assert_eq!(runtime.stats().frees(), 1);
    assert!(runtime.stats().is_balanced());
}

#[test]
fn struct_fields_are_marshalled_individually() {
    let desc = person();
    let stub = build(
        &PInvokeMethod::new("greet", MarshalType::I4)
            .parameter(PInvokeParameter::new(MarshalType::ValueType(Arc::clone(&desc)))),
    );

    let mut runtime = StubRuntime::new();
    let name = runtime.new_string("Ada");
    let value = StubValue::Struct(StructValue {
        desc,
        fields: vec![name, StubValue::I4(36)],
    });

    let result = StubInterpreter::new(&stub)
        .run(&mut runtime, vec![value], |rt, args| {
            let StubValue::Struct(native) = &args[0] else {
                panic!("expected a native struct, got {}", args[0]);
            };
            assert_eq!(native.desc.name, "__Native_Person");
            let name = rt.read_utf16(native.field("Name")?.as_i64("greet")?)?;
            assert_eq!(name, "Ada");
            Ok(Some(native.field("Age")?.clone()))
        })
        .unwrap();

    assert_eq!(result, Some(StubValue::I4(36)));
    assert!(runtime.stats().is_balanced());
    assert_eq!(runtime.stats().frees(), 1);
}

#[test]
fn layout_class_is_passed_by_pointer_and_copied_back() {
    let desc = person();
    let stub = build(
        &PInvokeMethod::new("birthday", MarshalType::Void)
            .parameter(PInvokeParameter::new(MarshalType::Class(Arc::clone(&desc))).in_out()),
    );

    let mut runtime = StubRuntime::new();
    let instance = runtime.new_object(&desc);
    let name = runtime.new_string("Grace");
    runtime.set_object_field(&instance, "Name", name).unwrap();
    runtime
        .set_object_field(&instance, "Age", StubValue::I4(85))
        .unwrap();

    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![instance.clone()], |rt, args| {
            let base = args[0].as_i64("birthday")?;
            let name = rt.read_native(base, &MarshalType::I)?.as_i64("birthday")?;
            assert_eq!(rt.read_utf16(name)?, "Grace");
            let age = rt.read_native(base + 8, &MarshalType::I4)?.as_i64("birthday")?;
            rt.write_native(base + 8, &MarshalType::I4, &StubValue::from(age + 1))
                .map(|()| None)
        })
        .unwrap();

    assert_eq!(
        runtime.object_field(&instance, "Age").unwrap(),
        StubValue::I4(86)
    );
    let name = runtime.object_field(&instance, "Name").unwrap();
    assert_eq!(runtime.string_value(&name).unwrap().as_deref(), Some("Grace"));
    assert!(runtime.stats().is_balanced());
}

#[test]
fn null_layout_class_frees_nothing() {
    let stub = build(
        &PInvokeMethod::new("birthday", MarshalType::Void)
            .parameter(PInvokeParameter::new(MarshalType::Class(person()))),
    );

    let mut runtime = StubRuntime::new();
    let mut passed = StubValue::Null;
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![StubValue::Null], |_, args| {
            passed = args[0].clone();
            Ok(None)
        })
        .unwrap();

    assert_eq!(passed, StubValue::NativeInt(0));
    assert_eq!(runtime.stats().frees(), 0);
    assert_eq!(runtime.stats().total_calls(), 0);
}

#[test]
fn safe_handle_reference_is_held_across_the_call() {
    let stub = build(
        &PInvokeMethod::new("read", MarshalType::I4)
            .parameter(PInvokeParameter::new(MarshalType::SafeHandle("FileHandle".into()))),
    );

    let mut runtime = StubRuntime::new();
    let handle = runtime.new_safe_handle("FileHandle", 0x1234);
    let inner = handle.clone();
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![handle.clone()], move |rt, args| {
            assert_eq!(args[0], StubValue::NativeInt(0x1234));
            assert_eq!(rt.safe_handle_ref_count(&inner)?, 1);
            Ok(Some(StubValue::I4(0)))
        })
        .unwrap();

    assert_eq!(runtime.safe_handle_ref_count(&handle).unwrap(), 0);
}

#[test]
fn returned_safe_handle_wraps_native_value() {
    let stub = build(&PInvokeMethod::new(
        "open",
        MarshalType::SafeHandle("FileHandle".into()),
    ));

    let mut runtime = StubRuntime::new();
    let result = StubInterpreter::new(&stub)
        .run(&mut runtime, Vec::new(), |_, _| {
            Ok(Some(StubValue::NativeInt(0xBEEF)))
        })
        .unwrap()
        .unwrap();

    assert_eq!(runtime.handle_value(&result).unwrap(), 0xBEEF);
    assert_eq!(runtime.safe_handle_ref_count(&result).unwrap(), 0);
}

#[test]
fn handle_ref_passes_its_handle_field() {
    let stub = build(
        &PInvokeMethod::new("close", MarshalType::Void)
            .parameter(PInvokeParameter::new(MarshalType::HandleRef)),
    );

    let mut runtime = StubRuntime::new();
    let owner = runtime.new_string("owner");
    let value = runtime.handle_ref(owner, 0x77);
    let mut passed = StubValue::Null;
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![value], |_, args| {
            passed = args[0].clone();
            Ok(None)
        })
        .unwrap();
    assert_eq!(passed, StubValue::NativeInt(0x77));
}

#[test]
fn delegates_round_trip_through_function_pointers() {
    let callback = MarshalType::Delegate("Callback".into());
    let forward = build(
        &PInvokeMethod::new("register", MarshalType::Void)
            .parameter(PInvokeParameter::new(callback.clone())),
    );
    let reverse = build(
        &PInvokeMethod::new("invoke", MarshalType::Void)
            .direction(MarshalDirection::Reverse)
            .parameter(PInvokeParameter::new(callback)),
    );

    let mut runtime = StubRuntime::new();
    let delegate = runtime.new_delegate("Callback");
    let mut function = 0;
    StubInterpreter::new(&forward)
        .run(&mut runtime, vec![delegate.clone()], |_, args| {
            function = args[0].as_i64("register")?;
            Ok(None)
        })
        .unwrap();
    assert_eq!(function, runtime.delegate_function(&delegate).unwrap());

    let mut target = StubValue::Null;
    StubInterpreter::new(&reverse)
        .run(
            &mut runtime,
            vec![StubValue::NativeInt(function)],
            |_, args| {
                target = args[0].clone();
                Ok(None)
            },
        )
        .unwrap();
    assert_eq!(target, delegate);
}

#[test]
fn string_builder_receives_native_output() {
    let stub = build(
        &PInvokeMethod::new("get_user", MarshalType::Void)
            .parameter(PInvokeParameter::new(MarshalType::StringBuilder)),
    );

    let mut runtime = StubRuntime::new();
    let buffer = runtime.new_string_builder("", 16);
    StubInterpreter::new(&stub)
        .run(&mut runtime, vec![buffer.clone()], |rt, args| {
            let address = args[0].as_i64("get_user")?;
            #[allow(clippy::cast_sign_loss)]
            let base = address as u64;
            assert_eq!(rt.memory().region_size(base), Some(34));
            rt.memory_mut()
                .write(base, &utf16_with_terminator("operator"))?;
            Ok(None)
        })
        .unwrap();

    assert_eq!(runtime.string_builder_contents(&buffer).unwrap(), "operator");
    assert!(runtime.stats().is_balanced());
}

#[test]
fn reverse_stub_builds_managed_string() {
    let stub = build(
        &PInvokeMethod::new("on_message", MarshalType::I4)
            .direction(MarshalDirection::Reverse)
            .parameter(PInvokeParameter::new(MarshalType::String)),
    );

    let mut runtime = StubRuntime::new();
    let native = runtime.alloc_native(&utf16_with_terminator("ping")).unwrap();
    let result = StubInterpreter::new(&stub)
        .run(&mut runtime, vec![StubValue::NativeInt(native)], |rt, args| {
            let text = rt.string_value(&args[0])?.unwrap_or_default();
            Ok(Some(StubValue::I4(i32::try_from(text.len()).unwrap())))
        })
        .unwrap();

    assert_eq!(result, Some(StubValue::I4(4)));
    assert_eq!(runtime.stats().allocations(), 0);
}

#[test]
fn argument_count_is_checked() {
    let stub = build(
        &PInvokeMethod::new("one", MarshalType::Void)
            .parameter(PInvokeParameter::new(MarshalType::I4)),
    );
    let mut runtime = StubRuntime::new();
    let result = StubInterpreter::new(&stub).run(&mut runtime, Vec::new(), |_, _| Ok(None));
    assert!(matches!(
        result,
        Err(Error::Emulation(EmulationError::ArgumentCountMismatch {
            expected: 1,
            found: 0
        }))
    ));
}

#[test]
fn callee_must_produce_declared_return_value() {
    let stub = build(&PInvokeMethod::new("value", MarshalType::I4));
    let mut runtime = StubRuntime::new();
    let result = StubInterpreter::new(&stub).run(&mut runtime, Vec::new(), |_, _| Ok(None));
    assert!(matches!(
        result,
        Err(Error::Emulation(EmulationError::MissingReturnValue))
    ));
}

#[test]
fn callee_errors_propagate() {
    let stub = build(&PInvokeMethod::new("fail", MarshalType::Void));
    let mut runtime = StubRuntime::new();
    let result = StubInterpreter::new(&stub).run(&mut runtime, Vec::new(), |_, _| {
        Err(Error::InvalidConfiguration("native failure".to_string()))
    });
    assert!(matches!(result, Err(Error::InvalidConfiguration(_))));
}

#[test]
fn instruction_limit_stops_runaway_stub() {
    let mut emitter = StubEmitter::new();
    let top = emitter.new_label();
    let mut stream = CodeStream::new();
    stream.emit_label(top);
    stream.emit(Opcode::Nop);
    stream.emit_branch(Opcode::Br, top);
    let body = StubBody::link("spin", vec![stream], emitter.into_locals(), 0).unwrap();

    let mut runtime =
        StubRuntime::with_limits(EmulationLimits::default().with_max_instructions(100));
    let result = StubInterpreter::new(&body).run(&mut runtime, Vec::new(), |_, _| Ok(None));
    assert!(matches!(
        result,
        Err(Error::Emulation(EmulationError::InstructionLimitExceeded {
            executed: 101,
            limit: 100
        }))
    ));
}

#[test]
fn overflowing_buffer_size_fails() {
    let helpers = builder();
    let mut stream = CodeStream::new();
    stream.emit_ldc(0x4000_0000);
    stream.emit_type(Opcode::Sizeof, &MarshalType::I8);
    stream.emit(Opcode::MulOvf);
    stream.emit_call(
        helpers
            .helpers()
            .get(RuntimeHelper::CoTaskMemAllocAndZeroMemory),
    );
    stream.emit(Opcode::Ret);
    let body = StubBody::link("alloc", vec![stream], Vec::new(), 0).unwrap();

    let mut runtime = StubRuntime::new();
    let result = StubInterpreter::new(&body).run(&mut runtime, Vec::new(), |_, _| Ok(None));
    assert!(matches!(
        result,
        Err(Error::AllocationOverflow {
            count: 0x4000_0000,
            element_size: 8
        })
    ));
    assert_eq!(runtime.stats().allocations(), 0);
}

#[test]
fn unbalanced_return_is_reported() {
    let mut stream = CodeStream::new();
    stream.emit_ldc(1);
    stream.emit_ldc(2);
    stream.emit(Opcode::Ret);
    let body = StubBody::link("two", vec![stream], Vec::new(), 0).unwrap();

    let mut runtime = StubRuntime::new();
    let result = StubInterpreter::new(&body).run(&mut runtime, Vec::new(), |_, _| Ok(None));
    assert!(matches!(
        result,
        Err(Error::Emulation(EmulationError::UnbalancedStack { depth: 2 }))
    ));
}

#[test]
fn falling_off_the_end_is_reported() {
    let mut stream = CodeStream::new();
    stream.emit(Opcode::Nop);
    let body = StubBody::link("open", vec![stream], Vec::new(), 0).unwrap();

    let mut runtime = StubRuntime::new();
    let result = StubInterpreter::new(&body).run(&mut runtime, Vec::new(), |_, _| Ok(None));
    assert!(matches!(
        result,
        Err(Error::Emulation(
            EmulationError::InvalidInstructionPointer { offset: 1 }
        ))
    ));
}

#[test]
fn frames_are_restored_and_pins_released() {
    let stub = build(
        &PInvokeMethod::new("strlen_w", MarshalType::I4)
            .parameter(PInvokeParameter::new(MarshalType::String)),
    );

    let mut runtime = StubRuntime::new();
    for text in ["a", "bb", "ccc"] {
        let value = runtime.new_string(text);
        StubInterpreter::new(&stub)
            .run(&mut runtime, vec![value], |_, _| Ok(Some(StubValue::I4(0))))
            .unwrap();
        assert_eq!(runtime.memory().current_size(), 0);
    }
}
