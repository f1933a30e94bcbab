//! End-to-end marshalling tests.
//!
//! Each test declares a platform invoke the way a binding author would, generates the stub and
//! executes it under emulation with a closure standing in for the native side. Assertions cover
//! what crossed the boundary, what came back, and whether every native allocation was released.

use std::sync::Arc;

use dotmarshal::{
    emulation::{ManagedPtr, StructValue, StubInterpreter, StubRuntime, StubValue},
    interop::CharSet,
    prelude::*,
};
use proptest::prelude::*;

fn builder() -> PInvokeStubBuilder {
    PInvokeStubBuilder::new(&DefaultHelperResolver).unwrap()
}

fn person() -> Arc<StructDesc> {
    StructDesc::sequential("Person")
        .field("Name", MarshalType::String)
        .field("Age", MarshalType::I4)
        .build()
}

fn int_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

/// `void scale([In, Out] int[] values, int count)`: every element is replaced by `f(element)`.
fn scale(values: &[i32], f: impl Fn(i32) -> i32) -> Result<(Vec<StubValue>, StubRuntime)> {
    let method = PInvokeMethod::new("scale", MarshalType::Void)
        .parameter(PInvokeParameter::new(MarshalType::sz_array(MarshalType::I4)).in_out())
        .parameter(PInvokeParameter::new(MarshalType::I4));
    let stub = builder().build(&method)?;

    let mut runtime = StubRuntime::new();
    let items = values.iter().copied().map(StubValue::I4).collect();
    let array = runtime.new_array(MarshalType::I4, items);
    let count = i32::try_from(values.len()).unwrap();

    StubInterpreter::new(&stub).run(
        &mut runtime,
        vec![array.clone(), StubValue::I4(count)],
        |rt, args| {
            let base = args[0].as_i64("scale")?;
            let count = args[1].as_i64("scale")?;
            if count == 0 {
                assert_eq!(base, 0);
            }
            for index in 0..count {
                let address = base + index * 4;
                let current = rt.read_native(address, &MarshalType::I4)?.as_i64("scale")?;
                let next = f(i32::try_from(current).unwrap());
                rt.write_native(address, &MarshalType::I4, &StubValue::I4(next))?;
            }
            Ok(None)
        },
    )?;

    let items = runtime.array_items(&array)?.unwrap_or_default();
    Ok((items, runtime))
}

#[test]
fn blittable_array_round_trips() -> Result<()> {
    for count in [0usize, 1, 1000] {
        let values: Vec<i32> = (0..i32::try_from(count).unwrap()).collect();
        let (items, runtime) = scale(&values, |value| value * 2)?;

        let expected: Vec<_> = values.iter().map(|value| StubValue::I4(value * 2)).collect();
        assert_eq!(items, expected, "round trip of {count} elements");
        assert!(runtime.stats().is_balanced());
        assert_eq!(runtime.memory().current_size(), 0);
    }
    Ok(())
}

#[test]
fn native_writes_replace_array_contents() -> Result<()> {
    let (items, _) = scale(&[10, 20, 30], |value| value / 10)?;
    assert_eq!(
        items,
        vec![StubValue::I4(1), StubValue::I4(2), StubValue::I4(3)]
    );
    Ok(())
}

#[test]
fn reverse_array_is_sized_by_sibling_parameter() -> Result<()> {
    let method = PInvokeMethod::new("on_samples", MarshalType::I4)
        .direction(MarshalDirection::Reverse)
        .parameter(
            PInvokeParameter::new(MarshalType::sz_array(MarshalType::I4))
                .input()
                .with_marshal_as(MarshalAsDescriptor::array(None, Some(1), None)),
        )
        .parameter(PInvokeParameter::new(MarshalType::I4));
    let stub = builder().build(&method)?;

    let mut runtime = StubRuntime::new();
    let samples = runtime.alloc_native(&int_bytes(&[1, 2, 3, 4, 5, 6, 7]))?;
    let result = StubInterpreter::new(&stub).run(
        &mut runtime,
        vec![StubValue::NativeInt(samples), StubValue::I4(7)],
        |rt, args| {
            let items = rt.array_items(&args[0])?.unwrap_or_default();
            assert_eq!(items.len(), 7);
            let mut sum = 0;
            for item in &items {
                sum += item.as_i64("on_samples")?;
            }
            Ok(Some(StubValue::from(sum)))
        },
    )?;

    assert_eq!(result, Some(StubValue::I4(28)));
    Ok(())
}

#[test]
fn size_parameter_out_of_range_is_rejected() {
    let method = PInvokeMethod::new("on_samples", MarshalType::Void)
        .direction(MarshalDirection::Reverse)
        .parameter(
            PInvokeParameter::new(MarshalType::sz_array(MarshalType::I4))
                .with_marshal_as(MarshalAsDescriptor::array(None, Some(4), None)),
        )
        .parameter(PInvokeParameter::new(MarshalType::I4));

    assert!(matches!(
        builder().build(&method),
        Err(Error::InvalidConfiguration(_))
    ));
}

#[test]
fn size_parameter_must_be_integral() {
    let method = PInvokeMethod::new("on_samples", MarshalType::Void)
        .direction(MarshalDirection::Reverse)
        .parameter(
            PInvokeParameter::new(MarshalType::sz_array(MarshalType::I4))
                .with_marshal_as(MarshalAsDescriptor::array(None, Some(1), None)),
        )
        .parameter(PInvokeParameter::new(MarshalType::String));

    assert!(matches!(
        builder().build(&method),
        Err(Error::InvalidConfiguration(_))
    ));
}

#[test]
fn in_string_is_pinned_and_out_string_is_freed() -> Result<()> {
    let builder = builder();
    let pinned = builder.build(
        &PInvokeMethod::new("measure", MarshalType::I4)
            .parameter(PInvokeParameter::new(MarshalType::String)),
    )?;
    let out = builder.build(
        &PInvokeMethod::new("describe", MarshalType::Void)
            .parameter(PInvokeParameter::new(MarshalType::by_ref(MarshalType::String)).out()),
    )?;

    let mut runtime = StubRuntime::new();
    let text = runtime.new_string("boundary");
    StubInterpreter::new(&pinned).run(&mut runtime, vec![text], |rt, args| {
        let text = rt.read_utf16(args[0].as_i64("measure")?)?;
        Ok(Some(StubValue::I4(i32::try_from(text.len()).unwrap())))
    })?;
    assert_eq!(runtime.stats().allocations(), 0);
    assert_eq!(runtime.stats().frees(), 0);

    let cell = runtime.new_cell(StubValue::Null, MarshalType::String);
    StubInterpreter::new(&out).run(&mut runtime, vec![cell.clone()], |rt, args| {
        let native = rt.alloc_unicode_string("described")?;
        rt.store_indirect(
            &args[0],
            &MarshalType::pointer(MarshalType::Char),
            StubValue::NativeInt(native),
        )?;
        Ok(None)
    })?;

    let value = runtime.cell_value(&cell)?;
    assert_eq!(runtime.string_value(&value)?.as_deref(), Some("described"));
    assert_eq!(runtime.stats().allocations(), 1);
    assert_eq!(runtime.stats().frees(), 1);
    Ok(())
}

#[test]
fn null_arguments_release_nothing() -> Result<()> {
    let method = PInvokeMethod::new("consume", MarshalType::Void)
        .parameter(PInvokeParameter::new(MarshalType::sz_array(MarshalType::String)))
        .parameter(PInvokeParameter::new(MarshalType::Class(person())))
        .parameter(PInvokeParameter::new(MarshalType::String))
        .flags(PInvokeFlags::CHARSET_ANSI);
    let stub = builder().build(&method)?;

    let mut runtime = StubRuntime::new();
    let mut received = Vec::new();
    StubInterpreter::new(&stub).run(
        &mut runtime,
        vec![StubValue::Null, StubValue::Null, StubValue::Null],
        |_, args| {
            received = args.to_vec();
            Ok(None)
        },
    )?;

    assert_eq!(received, vec![StubValue::NativeInt(0); 3]);
    assert_eq!(runtime.stats().allocations(), 0);
    assert_eq!(runtime.stats().frees(), 0);
    Ok(())
}

#[test]
fn null_values_release_nothing_in_any_direction() -> Result<()> {
    let method = PInvokeMethod::new("consume", MarshalType::Void)
        .parameter(PInvokeParameter::new(MarshalType::sz_array(MarshalType::String)).in_out())
        .parameter(PInvokeParameter::new(MarshalType::StringBuilder).out())
        .parameter(PInvokeParameter::new(MarshalType::by_ref(MarshalType::String)))
        .parameter(PInvokeParameter::new(MarshalType::by_ref(MarshalType::String)).out());
    let stub = builder().build(&method)?;

    let mut runtime = StubRuntime::new();
    let in_out = runtime.new_cell(StubValue::Null, MarshalType::String);
    let out = runtime.new_cell(StubValue::Null, MarshalType::String);
    StubInterpreter::new(&stub).run(
        &mut runtime,
        vec![StubValue::Null, StubValue::Null, in_out.clone(), out.clone()],
        |rt, args| {
            assert_eq!(args[0].as_i64("consume")?, 0);
            assert_eq!(args[1].as_i64("consume")?, 0);
            for by_ref in &args[2..] {
                let native = rt.load_indirect(by_ref, &MarshalType::pointer(MarshalType::Char))?;
                assert_eq!(native.as_i64("consume")?, 0);
            }
            Ok(None)
        },
    )?;

    assert_eq!(runtime.cell_value(&in_out)?, StubValue::Null);
    assert_eq!(runtime.cell_value(&out)?, StubValue::Null);
    let stats = runtime.stats();
    assert_eq!(stats.allocations(), 0);
    assert_eq!(stats.frees(), 0);
    assert_eq!(stats.calls(RuntimeHelper::CoTaskMemFree), 0);
    assert_eq!(stats.calls(RuntimeHelper::CoTaskMemAllocAndZeroMemory), 0);
    Ok(())
}

#[test]
fn reverse_by_ref_and_in_out_array_are_copied_back() -> Result<()> {
    let method = PInvokeMethod::new("on_update", MarshalType::Void)
        .direction(MarshalDirection::Reverse)
        .parameter(PInvokeParameter::new(MarshalType::by_ref(MarshalType::Boolean)))
        .parameter(
            PInvokeParameter::new(MarshalType::sz_array(MarshalType::I4))
                .in_out()
                .with_marshal_as(MarshalAsDescriptor::array(None, None, Some(3))),
        );
    let stub = builder().build(&method)?;

    let mut runtime = StubRuntime::new();
    let flag = runtime.alloc_native(&7i32.to_le_bytes())?;
    let values = runtime.alloc_native(&int_bytes(&[1, 2, 3]))?;
    StubInterpreter::new(&stub).run(
        &mut runtime,
        vec![StubValue::NativeInt(flag), StubValue::NativeInt(values)],
        |rt, args| {
            assert_eq!(rt.load_indirect(&args[0], &MarshalType::Boolean)?, StubValue::I4(1));
            rt.store_indirect(&args[0], &MarshalType::Boolean, StubValue::I4(0))?;

            let items = rt.array_items(&args[1])?.unwrap_or_default();
            assert_eq!(items, vec![StubValue::I4(1), StubValue::I4(2), StubValue::I4(3)]);
            let array = args[1].heap_ref().unwrap();
            for (index, item) in items.iter().enumerate() {
                let doubled = StubValue::I4(i32::try_from(item.as_i64("on_update")? * 2).unwrap());
                rt.write_location(&ManagedPtr::Element(array, index), doubled)?;
            }
            Ok(None)
        },
    )?;

    assert_eq!(runtime.read_native(flag, &MarshalType::I4)?, StubValue::I4(0));
    let written: Vec<_> = (0..3)
        .map(|index| runtime.read_native(values + index * 4, &MarshalType::I4))
        .collect::<Result<_>>()?;
    assert_eq!(written, vec![StubValue::I4(2), StubValue::I4(4), StubValue::I4(6)]);
    Ok(())
}

#[test]
fn reverse_ref_string_is_replaced() -> Result<()> {
    let method = PInvokeMethod::new("on_rename", MarshalType::Void)
        .direction(MarshalDirection::Reverse)
        .parameter(PInvokeParameter::new(MarshalType::by_ref(MarshalType::String)));
    let stub = builder().build(&method)?;

    let mut runtime = StubRuntime::new();
    let original = runtime.alloc_unicode_string("hi")?;
    let slot = runtime.alloc_native(&original.to_le_bytes())?;
    StubInterpreter::new(&stub).run(&mut runtime, vec![StubValue::NativeInt(slot)], |rt, args| {
        let current = rt.load_indirect(&args[0], &MarshalType::String)?;
        assert_eq!(rt.string_value(&current)?.as_deref(), Some("hi"));
        let replacement = rt.new_string("bye");
        rt.store_indirect(&args[0], &MarshalType::String, replacement)?;
        Ok(None)
    })?;

    let native = runtime.read_native(slot, &MarshalType::I)?.as_i64("on_rename")?;
    assert_ne!(native, original);
    assert_eq!(runtime.read_utf16(native)?, "bye");
    Ok(())
}

#[test]
fn array_of_structs_with_strings() -> Result<()> {
    let desc = person();
    let method = PInvokeMethod::new("census", MarshalType::I4).parameter(PInvokeParameter::new(
        MarshalType::sz_array(MarshalType::ValueType(Arc::clone(&desc))),
    ));
    let stub = builder().build(&method)?;

    let mut runtime = StubRuntime::new();
    let mut people = Vec::new();
    for (name, age) in [(Some("Ada"), 36), (None, 0), (Some("Alan"), 41)] {
        let name = name.map_or(StubValue::Null, |name| runtime.new_string(name));
        people.push(StubValue::Struct(StructValue {
            desc: Arc::clone(&desc),
            fields: vec![name, StubValue::I4(age)],
        }));
    }
    let array = runtime.new_array(MarshalType::ValueType(Arc::clone(&desc)), people);

    let mut names = Vec::new();
    let total = StubInterpreter::new(&stub).run(&mut runtime, vec![array], |rt, args| {
        let base = args[0].as_i64("census")?;
        let mut total = 0;
        for index in 0..3 {
            let element = base + index * 16;
            let name = rt.read_native(element, &MarshalType::I)?.as_i64("census")?;
            names.push((name != 0).then(|| rt.read_utf16(name)).transpose()?);
            total += rt.read_native(element + 8, &MarshalType::I4)?.as_i64("census")?;
        }
        Ok(Some(StubValue::from(total)))
    })?;

    assert_eq!(total, Some(StubValue::I4(77)));
    assert_eq!(
        names,
        vec![Some("Ada".to_string()), None, Some("Alan".to_string())]
    );
    let stats = runtime.stats();
    assert_eq!(stats.allocations(), 3);
    assert!(stats.is_balanced());
    Ok(())
}

/// Run `void puts(string)` under ANSI with `flags` and return the bytes the native side saw.
fn ansi_bytes(text: &str, flags: PInvokeFlags) -> Result<Vec<u8>> {
    let method = PInvokeMethod::new("puts", MarshalType::Void)
        .flags(PInvokeFlags::CHARSET_ANSI | flags)
        .parameter(PInvokeParameter::new(MarshalType::String));
    let stub = builder().build(&method)?;

    let mut runtime = StubRuntime::new();
    let value = runtime.new_string(text);
    let mut seen = Vec::new();
    StubInterpreter::new(&stub).run(&mut runtime, vec![value], |rt, args| {
        let address = u64::try_from(args[0].as_i64("puts")?).unwrap();
        seen = rt.memory().read_terminated(address, 1)?;
        Ok(None)
    })?;
    assert!(runtime.stats().is_balanced());
    Ok(seen)
}

#[test]
fn unmappable_characters_follow_policy() -> Result<()> {
    assert_eq!(ansi_bytes("A\u{0100}z", PInvokeFlags::empty())?, b"A?z".to_vec());
    assert_eq!(
        ansi_bytes("A\u{0100}z", PInvokeFlags::BEST_FIT_MAPPING)?,
        b"AAz".to_vec()
    );
    assert_eq!(
        ansi_bytes(
            "it\u{2019}s",
            PInvokeFlags::BEST_FIT_MAPPING | PInvokeFlags::THROW_ON_UNMAPPABLE_CHAR
        )?,
        b"it's".to_vec()
    );
    assert!(matches!(
        ansi_bytes("A\u{0100}z", PInvokeFlags::THROW_ON_UNMAPPABLE_CHAR),
        Err(Error::UnmappableChar {
            code_point: 0x0100,
            ..
        })
    ));
    Ok(())
}

#[test]
fn parameter_attribute_defaults() -> Result<()> {
    let method = PInvokeMethod::new("defaults", MarshalType::Void)
        .parameter(PInvokeParameter::new(MarshalType::sz_array(MarshalType::I4)))
        .parameter(PInvokeParameter::new(MarshalType::by_ref(MarshalType::I4)))
        .parameter(PInvokeParameter::new(MarshalType::StringBuilder))
        .parameter(PInvokeParameter::new(MarshalType::String).out())
        .parameter(PInvokeParameter::new(MarshalType::by_ref(MarshalType::String)).out());
    let marshallers = method.marshallers()?;
    let modes: Vec<_> = marshallers[1..]
        .iter()
        .map(|marshaller| (marshaller.is_in(), marshaller.is_out()))
        .collect();

    assert_eq!(
        modes,
        vec![
            (true, false),
            (true, true),
            (true, true),
            (true, false),
            (false, true),
        ]
    );
    Ok(())
}

#[test]
fn blittable_signatures_need_no_stub() {
    let builder = builder();
    let blittable = PInvokeMethod::new("add", MarshalType::I4)
        .parameter(PInvokeParameter::new(MarshalType::I4))
        .parameter(PInvokeParameter::new(MarshalType::R8));
    let with_string = PInvokeMethod::new("puts", MarshalType::I4)
        .parameter(PInvokeParameter::new(MarshalType::String))
        .flags(PInvokeFlags::CHARSET_ANSI);

    assert!(!builder.requires_stub(&blittable));
    assert!(builder.requires_stub(&with_string));
}

#[test]
fn unsupported_shapes_fail_at_generation() {
    let method = PInvokeMethod::new("variant", MarshalType::Void)
        .parameter(PInvokeParameter::new(MarshalType::Object));
    assert!(matches!(
        builder().build(&method),
        Err(Error::NotSupported { .. })
    ));
}

#[test]
fn compile_all_keeps_input_order() {
    let methods: Vec<_> = (0..16)
        .map(|index| {
            PInvokeMethod::new(&format!("m{index}"), MarshalType::Void)
                .parameter(PInvokeParameter::new(MarshalType::String))
        })
        .collect();

    let stubs = builder().compile_all(&methods);
    assert_eq!(stubs.len(), 16);
    for (index, stub) in stubs.into_iter().enumerate() {
        let stub = stub.unwrap();
        assert_eq!(stub.name(), format!("m{index}"));
        assert_eq!(stub.instructions().last().map(|ins| ins.opcode), Some(Opcode::Ret));
    }
}

fn managed_type() -> impl Strategy<Value = MarshalType> {
    let leaf = prop_oneof![
        Just(MarshalType::Boolean),
        Just(MarshalType::Char),
        Just(MarshalType::I1),
        Just(MarshalType::U2),
        Just(MarshalType::I4),
        Just(MarshalType::I8),
        Just(MarshalType::R8),
        Just(MarshalType::I),
        Just(MarshalType::String),
        Just(MarshalType::StringBuilder),
        Just(MarshalType::Decimal),
        Just(MarshalType::Guid),
        Just(MarshalType::HandleRef),
        Just(MarshalType::SafeHandle("Handle".to_string())),
        Just(MarshalType::Delegate("Callback".to_string())),
        Just(MarshalType::ValueType(person())),
        Just(MarshalType::Class(person())),
    ];
    leaf.prop_recursive(2, 8, 1, |inner| {
        prop_oneof![
            inner.clone().prop_map(MarshalType::sz_array),
            inner.prop_map(MarshalType::pointer),
        ]
    })
}

proptest! {
    #[test]
    fn classification_is_deterministic(
        ty in managed_type(),
        ansi in any::<bool>(),
        is_return in any::<bool>(),
    ) {
        let char_set = if ansi { CharSet::Ansi } else { CharSet::Unicode };
        let first = classify(&ty, None, is_return, char_set, MarshallerRole::Argument);
        let second = classify(&ty, None, is_return, char_set, MarshallerRole::Argument);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn by_ref_does_not_change_classification(ty in managed_type(), ansi in any::<bool>()) {
        let char_set = if ansi { CharSet::Ansi } else { CharSet::Unicode };
        let by_value = classify(&ty, None, false, char_set, MarshallerRole::Argument);
        let by_ref = classify(&MarshalType::by_ref(ty), None, false, char_set, MarshallerRole::Argument);
        prop_assert_eq!(by_value, by_ref);
    }
}
