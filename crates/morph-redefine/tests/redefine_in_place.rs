//! In-place redefinition through the public API
//!
//! Covers method body replacement, obsolete methods for live frames, code
//! cache notifications and the compatibility checks that reject a batch.

mod common;

use common::{code, encode, Harness, OBJECT};
use morph_classfile::{access, ClassDef, FieldDef, MethodDef};
use morph_redefine::{
    AgentEnv, ClassDefinition, ErrorCode, RedefineError, Redefiner, RedefinitionConfig,
    RedefinitionMode,
};
use morph_runtime::instrumentation::Breakpoint;
use morph_runtime::jit::{CodeCacheEvent, CompiledMethod};
use morph_runtime::{
    method_flags, EntryPoint, Frame, GlobalRef, MethodId, ObjectRef, OriginalDexFile,
    RuntimeOptions, RuntimeState,
};

const RETURN_ONE: &[u8] = &[0x01, 1, 0, 0, 0, 0x50];
const RETURN_TWO: &[u8] = &[0x01, 2, 0, 0, 0, 0x50];

fn counter(body: &[u8]) -> ClassDef {
    ClassDef::new("LCounter;", Some(OBJECT))
        .with_field(FieldDef::new("count", "I", access::ACC_PRIVATE))
        .with_method(MethodDef::new("value", "()I", access::ACC_PUBLIC, code(body)))
        .with_method(MethodDef::new("reset", "()V", access::ACC_PUBLIC, code(&[0x51])))
}

fn instructions(state: &RuntimeState, method: MethodId) -> Vec<u8> {
    state.code_item_of(method).map(|c| c.instructions.clone()).unwrap_or_default()
}

#[test]
fn test_identical_bytes_change_nothing() {
    let h = Harness::new();
    let (class, handle) = h.define(counter(RETURN_ONE));

    h.redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_ONE))])
        .unwrap();

    assert_eq!(h.class_of(handle), class);
    let state = h.rt.lock_state();
    assert!(state.class(class).unwrap().ext.is_none());
    assert!(state.code_cache.events().is_empty());
}

#[test]
fn test_method_body_replaced() {
    let h = Harness::new();
    let (class, handle) = h.define(counter(RETURN_ONE));
    let value = h.rt.lock_state().find_declared_method(class, "value", "()I").unwrap();

    h.redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_TWO))])
        .unwrap();

    assert_eq!(h.class_of(handle), class);
    let state = h.rt.lock_state();
    assert_eq!(state.find_declared_method(class, "value", "()I"), Some(value));
    assert_eq!(instructions(&state, value), RETURN_TWO);
    assert_eq!(state.class_def_of(class), Some(&counter(RETURN_TWO)));
    assert!(state
        .code_cache
        .events()
        .contains(&CodeCacheEvent::MethodRedefined(value)));

    let ext = state.class(class).unwrap().ext.as_ref().unwrap();
    assert_eq!(ext.obsolete_method_count(), 0);
    assert!(matches!(ext.original_dex_file, Some(OriginalDexFile::MetadataSource(_))));
    assert!(ext.pre_redefine.is_some());
}

#[test]
fn test_live_frame_runs_obsolete_copy() {
    let h = Harness::new();
    let (class, handle) = h.define(counter(RETURN_ONE));
    let worker = h.rt.attach_thread("worker");
    let value = {
        let mut state = h.rt.lock_state();
        let value = state.find_declared_method(class, "value", "()I").unwrap();
        state.threads.get_mut(worker).unwrap().push_frame(Frame::new(value, vec![]));
        value
    };

    h.redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_TWO))])
        .unwrap();

    let state = h.rt.lock_state();
    let frame = state.threads.get(worker).unwrap().top_frame().unwrap().clone();
    assert_ne!(frame.method, value);
    let obsolete = state.methods.get(frame.method).unwrap();
    assert!(obsolete.is_obsolete());
    assert!(obsolete.has_flag(method_flags::DONT_COMPILE));
    assert_eq!(obsolete.name, "value");

    assert_eq!(instructions(&state, frame.method), RETURN_ONE);
    assert_eq!(instructions(&state, value), RETURN_TWO);
    assert!(state.code_cache.events().contains(&CodeCacheEvent::MethodMoved {
        from: value,
        to: frame.method,
    }));
    let ext = state.class(class).unwrap().ext.as_ref().unwrap();
    assert_eq!(ext.obsolete_method_count(), 1);
    assert!(ext.obsolete_slot_of(frame.method).is_some());
}

#[test]
fn test_threads_share_one_obsolete_copy() {
    let h = Harness::new();
    let (class, handle) = h.define(counter(RETURN_ONE));
    let a = h.rt.attach_thread("a");
    let b = h.rt.attach_thread("b");
    {
        let mut state = h.rt.lock_state();
        let value = state.find_declared_method(class, "value", "()I").unwrap();
        let reset = state.find_declared_method(class, "reset", "()V").unwrap();
        state.threads.get_mut(a).unwrap().push_frame(Frame::new(value, vec![]));
        state.threads.get_mut(b).unwrap().push_frame(Frame::new(reset, vec![]));
        state.threads.get_mut(b).unwrap().push_frame(Frame::new(value, vec![]));
    }

    h.redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_TWO))])
        .unwrap();

    let state = h.rt.lock_state();
    let on_a = state.threads.get(a).unwrap().frames()[0].method;
    let on_b = state.threads.get(b).unwrap().frames();
    assert_eq!(on_b[1].method, on_a);
    assert_ne!(on_b[0].method, on_a);
    assert!(state.methods.get(on_b[0].method).unwrap().is_obsolete());
    assert_eq!(
        state.class(class).unwrap().ext.as_ref().unwrap().obsolete_method_count(),
        2
    );
}

#[test]
fn test_second_redefinition_keeps_earlier_obsolete_methods() {
    let h = Harness::new();
    let (class, handle) = h.define(counter(RETURN_ONE));
    let worker = h.rt.attach_thread("worker");
    {
        let mut state = h.rt.lock_state();
        let value = state.find_declared_method(class, "value", "()I").unwrap();
        state.threads.get_mut(worker).unwrap().push_frame(Frame::new(value, vec![]));
    }
    h.redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_TWO))])
        .unwrap();
    let first = h.rt.lock_state().threads.get(worker).unwrap().frames()[0].method;

    h.redefine(RedefinitionMode::InPlace, vec![(handle, counter(&[0x01, 3, 0, 0, 0, 0x50]))])
        .unwrap();

    let state = h.rt.lock_state();
    assert_eq!(state.threads.get(worker).unwrap().frames()[0].method, first);
    assert_eq!(instructions(&state, first), RETURN_ONE);
    let ext = state.class(class).unwrap().ext.as_ref().unwrap();
    assert!(ext.obsolete_slot_of(first).is_some());
}

#[test]
fn test_compiled_code_dropped() {
    let h = Harness::new();
    let (class, handle) = h.define(counter(RETURN_ONE));
    let value = {
        let mut state = h.rt.lock_state();
        let value = state.find_declared_method(class, "value", "()I").unwrap();
        let RuntimeState {
            code_cache, methods, ..
        } = &mut *state;
        assert!(code_cache.compile(methods, value, CompiledMethod::default()));
        value
    };

    h.redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_TWO))])
        .unwrap();

    let state = h.rt.lock_state();
    assert!(state.code_cache.compiled(value).is_none());
    assert_eq!(state.methods.get(value).unwrap().entry_point, EntryPoint::Interpreter);
}

#[test]
fn test_breakpoints_removed() {
    let h = Harness::new();
    let (class, handle) = h.define(counter(RETURN_ONE));
    let other = h
        .define(ClassDef::new("LOther;", Some(OBJECT)).with_method(MethodDef::new(
            "run",
            "()V",
            access::ACC_PUBLIC,
            code(&[0x51]),
        )))
        .0;
    {
        let mut state = h.rt.lock_state();
        let value = state.find_declared_method(class, "value", "()I").unwrap();
        let run = state.find_declared_method(other, "run", "()V").unwrap();
        state.instrumentation.breakpoints.set(Breakpoint { method: value, dex_pc: 0 });
        state.instrumentation.breakpoints.set(Breakpoint { method: run, dex_pc: 0 });
    }

    h.redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_TWO))])
        .unwrap();

    let state = h.rt.lock_state();
    let remaining: Vec<_> = state.instrumentation.breakpoints.iter().copied().collect();
    assert_eq!(remaining.len(), 1);
    assert_eq!(state.methods.get(remaining[0].method).unwrap().name, "run");
}

#[test]
fn test_native_binding_survives() {
    let h = Harness::new();
    let def = |body: &[u8]| {
        counter(body).with_method(MethodDef::new(
            "hash",
            "()I",
            access::ACC_PUBLIC | access::ACC_NATIVE,
            None,
        ))
    };
    let (class, handle) = h.define(def(RETURN_ONE));
    let hash = {
        let mut state = h.rt.lock_state();
        let hash = state.find_declared_method(class, "hash", "()I").unwrap();
        assert!(state.register_native(hash, 0xbeef));
        hash
    };

    h.redefine(RedefinitionMode::InPlace, vec![(handle, def(RETURN_TWO))])
        .unwrap();

    let state = h.rt.lock_state();
    let method = state.methods.get(hash).unwrap();
    assert_eq!(method.entry_point, EntryPoint::Native);
    assert_eq!(method.native_entry, Some(0xbeef));
}

#[test]
fn test_original_bytes_override() {
    let h = Harness::new();
    let (class, handle) = h.define(counter(RETURN_ONE));
    let pinned = encode(counter(&[0x01, 9, 0, 0, 0, 0x50]));

    let definition =
        ClassDefinition::new(handle, encode(counter(RETURN_TWO))).with_original(pinned.clone());
    h.redefiner()
        .redefine_classes(RedefinitionMode::InPlace, &[definition])
        .unwrap();

    {
        let state = h.rt.lock_state();
        let ext = state.class(class).unwrap().ext.as_ref().unwrap();
        assert_eq!(ext.original_dex_file, Some(OriginalDexFile::Bytes(pinned.clone().into())));
    }

    // Without an override the pinned bytes stay
    h.redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_ONE))])
        .unwrap();
    let state = h.rt.lock_state();
    let ext = state.class(class).unwrap().ext.as_ref().unwrap();
    assert_eq!(ext.original_dex_file, Some(OriginalDexFile::Bytes(pinned.into())));
}

#[test]
fn test_override_with_identical_bytes_still_commits() {
    let h = Harness::new();
    let (class, handle) = h.define(counter(RETURN_ONE));
    let definition =
        ClassDefinition::new(handle, encode(counter(RETURN_ONE))).with_original(vec![1, 2, 3]);

    h.redefiner()
        .redefine_classes(RedefinitionMode::InPlace, &[definition])
        .unwrap();

    let state = h.rt.lock_state();
    let ext = state.class(class).unwrap().ext.as_ref().unwrap();
    assert_eq!(ext.original_dex_file, Some(OriginalDexFile::Bytes(vec![1u8, 2, 3].into())));
}

#[test]
fn test_soft_failure_keeps_access_checks() {
    let h = Harness::new();
    let (class, handle) = h.define(counter(RETURN_ONE));
    let value = h.rt.lock_state().find_declared_method(class, "value", "()I").unwrap();
    let checked = |h: &Harness| {
        let state = h.rt.lock_state();
        !state.methods.get(value).unwrap().has_flag(method_flags::SKIP_ACCESS_CHECKS)
    };
    assert!(!checked(&h));

    let mut replacement = counter(RETURN_TWO).with_type_ref("LMissing;");
    replacement.methods[1].code = code(&[0x30, 0, 0, 0x51]);
    h.redefine(RedefinitionMode::InPlace, vec![(handle, replacement)])
        .unwrap();

    assert!(checked(&h));
}

// ===== Rejected batches =====

fn assert_rejected(
    h: &Harness,
    class: ObjectRef,
    before: &ClassDef,
    code: ErrorCode,
    result: Result<(), RedefineError>,
) {
    let err = result.unwrap_err();
    assert_eq!(err.code, code, "{err}");
    let state = h.rt.lock_state();
    assert_eq!(state.class_def_of(class), Some(before));
    assert!(state.class(class).unwrap().ext.is_none());
}

#[test]
fn test_schema_changes_rejected() {
    let h = Harness::new();
    let before = counter(RETURN_ONE);
    let (class, handle) = h.define(before.clone());

    let added = counter(RETURN_TWO).with_field(FieldDef::new("extra", "J", access::ACC_PRIVATE));
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, added)]);
    assert_rejected(&h, class, &before, ErrorCode::UnsupportedSchemaChanged, result);

    let mut removed = counter(RETURN_TWO);
    removed.fields.clear();
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, removed)]);
    assert_rejected(&h, class, &before, ErrorCode::UnsupportedSchemaChanged, result);

    let mut retyped = counter(RETURN_TWO);
    retyped.fields[0].access_flags = access::ACC_PUBLIC;
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, retyped)]);
    assert_rejected(&h, class, &before, ErrorCode::UnsupportedSchemaChanged, result);
}

#[test]
fn test_method_changes_rejected() {
    let h = Harness::new();
    let before = counter(RETURN_ONE);
    let (class, handle) = h.define(before.clone());

    let added = counter(RETURN_TWO).with_method(MethodDef::new(
        "extra",
        "()V",
        access::ACC_PUBLIC,
        code(&[0x51]),
    ));
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, added)]);
    assert_rejected(&h, class, &before, ErrorCode::UnsupportedMethodAdded, result);

    let mut deleted = counter(RETURN_TWO);
    deleted.methods.pop();
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, deleted)]);
    assert_rejected(&h, class, &before, ErrorCode::UnsupportedMethodDeleted, result);

    let mut renamed = counter(RETURN_TWO);
    renamed.methods[1].name = "clear".to_string();
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, renamed)]);
    assert_rejected(&h, class, &before, ErrorCode::UnsupportedMethodAdded, result);

    let mut modifiers = counter(RETURN_TWO);
    modifiers.methods[1].access_flags |= access::ACC_FINAL;
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, modifiers)]);
    assert_rejected(&h, class, &before, ErrorCode::UnsupportedMethodModifiersChanged, result);
}

#[test]
fn test_hierarchy_changes_rejected() {
    let h = Harness::new();
    let iface = |d: &str| {
        ClassDef::new(d, Some(OBJECT))
            .with_access_flags(access::ACC_PUBLIC | access::ACC_INTERFACE | access::ACC_ABSTRACT)
    };
    h.define(iface("LFirst;"));
    h.define(iface("LSecond;"));
    h.define(ClassDef::new("LBase;", Some(OBJECT)));
    let before = counter(RETURN_ONE).with_interface("LFirst;").with_interface("LSecond;");
    let (class, handle) = h.define(before.clone());

    let reordered = counter(RETURN_ONE).with_interface("LSecond;").with_interface("LFirst;");
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, reordered)]);
    assert_rejected(&h, class, &before, ErrorCode::UnsupportedHierarchyChanged, result);

    let dropped = counter(RETURN_ONE).with_interface("LFirst;");
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, dropped)]);
    assert_rejected(&h, class, &before, ErrorCode::UnsupportedHierarchyChanged, result);

    let mut rebased = before.clone();
    rebased.superclass = Some("LBase;".to_string());
    let result = h.redefine(RedefinitionMode::Structural, vec![(handle, rebased)]);
    assert_rejected(&h, class, &before, ErrorCode::UnsupportedHierarchyChanged, result);
}

#[test]
fn test_class_level_mismatches_rejected() {
    let h = Harness::new();
    let before = counter(RETURN_ONE);
    let (class, handle) = h.define(before.clone());

    let renamed = ClassDef { descriptor: "LTally;".to_string(), ..counter(RETURN_TWO) };
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, renamed)]);
    assert_rejected(&h, class, &before, ErrorCode::NamesDontMatch, result);

    let sealed = counter(RETURN_TWO).with_access_flags(access::ACC_PUBLIC | access::ACC_FINAL);
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, sealed)]);
    assert_rejected(&h, class, &before, ErrorCode::UnsupportedClassModifiersChanged, result);

    let broken = counter(&[0xee]);
    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, broken)]);
    assert_rejected(&h, class, &before, ErrorCode::FailsVerification, result);

    let garbage = ClassDefinition::new(handle, b"not a class".to_vec());
    let result = h.redefiner().redefine_classes(RedefinitionMode::InPlace, &[garbage]);
    assert_rejected(&h, class, &before, ErrorCode::InvalidClassFormat, result);
}

#[test]
fn test_batch_is_all_or_nothing() {
    let h = Harness::new();
    let good_before = counter(RETURN_ONE);
    let (good, good_handle) = h.define(good_before.clone());
    let other = ClassDef::new("LOther;", Some(OBJECT));
    let (_, other_handle) = h.define(other.clone());

    let result = h.redefine(
        RedefinitionMode::InPlace,
        vec![
            (good_handle, counter(RETURN_TWO)),
            (other_handle, other.with_field(FieldDef::new("extra", "I", 0))),
        ],
    );

    assert_rejected(&h, good, &good_before, ErrorCode::UnsupportedSchemaChanged, result);
    let state = h.rt.lock_state();
    assert!(state.code_cache.events().is_empty());
}

#[test]
fn test_out_of_memory_leaves_class_untouched() {
    let h = Harness::new();
    let before = counter(RETURN_ONE);
    let (class, handle) = h.define(before.clone());
    let used = {
        let mut state = h.rt.lock_state();
        let used = state.heap.allocated_bytes();
        state.heap.set_max_heap_size(used + 8);
        used
    };

    let result = h.redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_TWO))]);
    assert_rejected(&h, class, &before, ErrorCode::OutOfMemory, result);
    assert_eq!(h.rt.lock_state().heap.allocated_bytes(), used);
}

#[test]
fn test_failed_batches_return_native_charges() {
    let h = Harness::new();
    let gauge = |body: &[u8]| {
        ClassDef::new("LGauge;", Some(OBJECT))
            .with_method(MethodDef::new("read", "()I", access::ACC_PUBLIC, code(body)))
    };
    let (counter_class, counter_handle) = h.define(counter(RETURN_ONE));
    let (gauge_class, gauge_handle) = h.define(gauge(RETURN_ONE));
    let (used, caches) = {
        let state = h.rt.lock_state();
        (state.heap.allocated_bytes(), state.dex_caches.len())
    };

    // Every budget short of the full batch fails somewhere in allocation,
    // including after the first class got everything it needed
    let mut failures = 0;
    let mut budget = used;
    loop {
        h.rt.lock_state().heap.set_max_heap_size(budget);
        let batch = vec![
            (counter_handle, counter(RETURN_TWO)),
            (gauge_handle, gauge(RETURN_TWO)),
        ];
        match h.redefine(RedefinitionMode::InPlace, batch) {
            Ok(()) => break,
            Err(err) => assert_eq!(err.code, ErrorCode::OutOfMemory, "{err}"),
        }
        failures += 1;
        let state = h.rt.lock_state();
        assert_eq!(state.heap.allocated_bytes(), used, "budget {budget}");
        assert_eq!(state.dex_caches.len(), caches);
        for class in [counter_class, gauge_class] {
            assert!(state.class(class).unwrap().ext.is_none());
        }
        drop(state);
        budget += 4;
        assert!(budget < used + (1 << 20), "batch never fit");
    }
    assert!(failures > 1);

    let state = h.rt.lock_state();
    let read = state.find_declared_method(gauge_class, "read", "()I").unwrap();
    assert_eq!(instructions(&state, read), RETURN_TWO);
    assert_eq!(state.dex_caches.len(), caches + 2);
}

// ===== Request validation =====

#[test]
fn test_request_validation() {
    let h = Harness::new();
    let (_, handle) = h.define(counter(RETURN_ONE));
    let redefine = |definitions: &[ClassDefinition]| {
        h.redefiner()
            .redefine_classes(RedefinitionMode::InPlace, definitions)
            .unwrap_err()
            .code
    };

    assert_eq!(
        redefine(&[ClassDefinition::new(GlobalRef::NULL, encode(counter(RETURN_TWO)))]),
        ErrorCode::NullPointer
    );
    assert_eq!(redefine(&[ClassDefinition::new(handle, Vec::new())]), ErrorCode::NullPointer);
    assert_eq!(
        redefine(&[
            ClassDefinition::new(handle, encode(counter(RETURN_TWO))),
            ClassDefinition::new(handle, encode(counter(RETURN_TWO))),
        ]),
        ErrorCode::IllegalArgument
    );

    let instance = {
        let object = h.rt.lock_state().class_linker.well_known().object;
        h.rt.alloc_object(h.thread, object).unwrap()
    };
    let not_a_class = h.rt.new_global_ref(instance);
    assert_eq!(
        redefine(&[ClassDefinition::new(not_a_class, encode(counter(RETURN_TWO)))]),
        ErrorCode::InvalidClass
    );
}

#[test]
fn test_environment_rules() {
    let h = Harness::with(RuntimeOptions::default(), RedefinitionConfig::default());
    let (_, handle) = h.define(counter(RETURN_ONE));

    let err = h
        .redefine(RedefinitionMode::Structural, vec![(handle, counter(RETURN_TWO))])
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::MustPossessCapability);
    h.redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_TWO))])
        .unwrap();

    h.env.dispose();
    let err = h
        .redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_ONE))])
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidEnvironment);
}

#[test]
fn test_never_obsolete_policy() {
    let config = RedefinitionConfig::from_str(
        r#"
        [classes]
        never_obsolete = ["LCounter;"]
        "#,
    )
    .unwrap();
    let h = Harness::with(RuntimeOptions::default(), config);
    let (_, handle) = h.define(counter(RETURN_ONE));

    assert!(!h.redefiner().is_modifiable_class(handle).unwrap());
    let err = h
        .redefine(RedefinitionMode::InPlace, vec![(handle, counter(RETURN_TWO))])
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::UnmodifiableClass);
}

#[test]
fn test_unmodifiable_runtime_classes() {
    let h = Harness::new();
    let (object, string) = {
        let state = h.rt.lock_state();
        let known = state.class_linker.well_known();
        (known.object, known.string)
    };
    let object = h.rt.new_global_ref(object);
    let string = h.rt.new_global_ref(string);
    let env = AgentEnv::new(common::structural_config());
    let redefiner = Redefiner::new(&h.rt, &env, h.thread);

    assert!(!redefiner.is_modifiable_class(object).unwrap());
    assert!(!redefiner.is_modifiable_class(string).unwrap());
    let replacement = encode(ClassDef::new("Ljava/lang/String;", Some(OBJECT)));
    let err = redefiner
        .redefine_classes(RedefinitionMode::InPlace, &[ClassDefinition::new(string, replacement)])
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::UnmodifiableClass);
}
