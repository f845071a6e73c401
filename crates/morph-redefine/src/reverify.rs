//! Verification after commit
//!
//! A class whose replacement soft-failed verification runs with access
//! checks on. Once the batch is committed, and every class it references
//! may have become resolvable, it is verified again.

use morph_classfile::VerifyOutcome;
use morph_runtime::verifier::LoaderResolver;
use morph_runtime::{ObjectRef, RuntimeState};

/// Verify `class` against the committed runtime and record the outcome
///
/// # Panics
///
/// Panics on a hard failure. The definition soft-failed at most before the
/// commit, so a hard failure now means the runtime is inconsistent.
pub fn reverify_class(state: &mut RuntimeState, class: ObjectRef) -> Option<VerifyOutcome> {
    let def = state.class_def_of(class)?.clone();
    let loader = state.class(class)?.loader;
    let outcome = state
        .verifier
        .verify_class(&def, &LoaderResolver::new(&state.class_linker, loader));
    if let VerifyOutcome::HardFailure(e) = &outcome {
        panic!("{} failed verification after redefinition: {e}", def.descriptor);
    }
    state.apply_verification_result(class, &outcome);
    log::debug!(
        "reverified {}: {}",
        def.descriptor,
        if outcome == VerifyOutcome::NoFailure { "clean" } else { "soft failure" }
    );
    Some(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_classfile::{access, ClassDef, ClassFile, CodeItem, MethodDef, TypeResolver};
    use morph_runtime::{method_flags, ClassVerifier, LoaderId, ThreadId};
    use std::sync::Arc;

    fn define(state: &mut RuntimeState, def: ClassDef) -> ObjectRef {
        let bytes: Arc<[u8]> = ClassFile::single(def).encode().into();
        let dex = state.open_dex_file("t.mdef", bytes, LoaderId::BOOT).unwrap();
        state.define_class(ThreadId::from_raw(1), LoaderId::BOOT, dex, 0).unwrap()
    }

    fn soft_failing_class(state: &mut RuntimeState) -> ObjectRef {
        define(
            state,
            ClassDef::new("LUser;", Some("Ljava/lang/Object;"))
                .with_type_ref("LLater;")
                .with_method(MethodDef::new(
                    "make",
                    "()V",
                    access::ACC_PUBLIC,
                    Some(CodeItem::new(0, vec![0x30, 0, 0, 0x51])),
                )),
        )
    }

    #[test]
    fn test_reverify_after_dependency_appears() {
        let mut state = RuntimeState::new();
        state.bootstrap().unwrap();
        let class = soft_failing_class(&mut state);
        let make = state.find_declared_method(class, "make", "()V").unwrap();
        assert!(!state.methods.get(make).unwrap().has_flag(method_flags::SKIP_ACCESS_CHECKS));

        assert!(matches!(
            reverify_class(&mut state, class),
            Some(VerifyOutcome::SoftFailure(_))
        ));
        define(&mut state, ClassDef::new("LLater;", Some("Ljava/lang/Object;")));
        assert_eq!(reverify_class(&mut state, class), Some(VerifyOutcome::NoFailure));
        assert!(state.methods.get(make).unwrap().has_flag(method_flags::SKIP_ACCESS_CHECKS));
    }

    struct Rejecting;

    impl ClassVerifier for Rejecting {
        fn verify_class(&self, def: &ClassDef, _: &dyn TypeResolver) -> VerifyOutcome {
            VerifyOutcome::HardFailure(morph_classfile::VerifyError::InvalidOpcode {
                method: format!("{}.make()V", def.descriptor),
                opcode: 0xee,
                offset: 0,
            })
        }
    }

    #[test]
    #[should_panic(expected = "failed verification after redefinition")]
    fn test_hard_failure_is_fatal() {
        let mut state = RuntimeState::new();
        state.bootstrap().unwrap();
        let class = soft_failing_class(&mut state);
        state.verifier = Box::new(Rejecting);
        reverify_class(&mut state, class);
    }
}
