//! Compatibility checking
//!
//! Decides whether a replacement may take the place of a loaded class and
//! classifies the change as [`Kind::InPlace`] or [`Kind::Structural`]. The
//! checks run in order: eligibility, class shape, fields, methods,
//! structural eligibility (structural changes only) and verification.
//!
//! Nothing here mutates the class being checked. The one side effect is
//! that structural eligibility initializes the class, as a structural swap
//! must never run a static initializer twice.

use crate::config::RedefinitionConfig;
use crate::error::{ErrorCode, StepResult};
use morph_classfile::{access, ClassDef, VerifyOutcome};
use morph_runtime::class::ClassStatus;
use morph_runtime::verifier::LoaderResolver;
use morph_runtime::{ClassData, ObjectRef, RuntimeState, ThreadId};

/// What kind of redefinition a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedefinitionMode {
    /// Bodies may change; the shape of the class may not
    InPlace,
    /// Fields and methods may be added
    Structural,
}

/// How an accepted replacement is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// The class is updated in place
    InPlace,
    /// A new class object replaces the old one and instances are migrated
    Structural,
}

/// Result of checking one replacement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// How the replacement is committed
    pub kind: Kind,
    /// The replacement declares instance fields or virtual methods
    pub has_virtual_members: bool,
    /// Verification soft-failed; verify again once the batch is committed
    pub needs_reverify: bool,
    /// Outcome of verifying the replacement
    pub verification: VerifyOutcome,
}

/// Member differences found by the shape checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ShapeReport {
    added_fields: bool,
    added_methods: bool,
}

impl ShapeReport {
    fn kind(&self) -> Kind {
        if self.added_fields || self.added_methods {
            Kind::Structural
        } else {
            Kind::InPlace
        }
    }
}

/// Whether `def` declares an instance field or a virtual method
///
/// Instances of a class that declares neither keep their layout across a
/// structural rebuild.
pub fn declares_virtual_members(def: &ClassDef) -> bool {
    def.fields.iter().any(|f| !f.is_static()) || def.methods.iter().any(|m| !m.is_direct())
}

/// Runs the compatibility checks for one requesting thread
pub struct Checker<'a> {
    config: &'a RedefinitionConfig,
    thread: ThreadId,
}

fn class_data(state: &RuntimeState, class: ObjectRef) -> StepResult<&ClassData> {
    state
        .class(class)
        .ok_or_else(|| (ErrorCode::InvalidClass, format!("{class} is not a class")))
}

impl<'a> Checker<'a> {
    /// Create a checker for requests made by `thread`
    pub fn new(config: &'a RedefinitionConfig, thread: ThreadId) -> Self {
        Self { config, thread }
    }

    /// Run every check for replacing `class` with `def`
    pub fn check(
        &self,
        state: &mut RuntimeState,
        class: ObjectRef,
        def: &ClassDef,
        mode: RedefinitionMode,
    ) -> StepResult<CheckOutcome> {
        self.check_redefinable(state, class)?;
        self.check_class(state, class, def)?;
        let mut report = ShapeReport::default();
        self.check_fields(state, class, def, mode, &mut report)?;
        self.check_methods(state, class, def, mode, &mut report)?;
        let kind = report.kind();
        if kind == Kind::Structural {
            self.check_structurally_redefinable(state, class)?;
        }
        let verification = self.check_verification(state, class, def)?;
        Ok(CheckOutcome {
            kind,
            has_virtual_members: declares_virtual_members(def),
            needs_reverify: matches!(verification, VerifyOutcome::SoftFailure(_)),
            verification,
        })
    }

    // ===== Eligibility =====

    /// Whether `class` may be redefined at all
    pub fn check_redefinable(&self, state: &RuntimeState, class: ObjectRef) -> StepResult<()> {
        let data = class_data(state, class)?;
        if data.is_erroneous() {
            return Err((
                ErrorCode::InvalidClass,
                format!("Class {} is in an erroneous state", data.descriptor),
            ));
        }
        if !data.is_resolved() {
            if data.clinit_thread == Some(self.thread) {
                return Err((
                    ErrorCode::Internal,
                    format!(
                        "Modification of class {} while it is being linked on the same thread \
                         is not supported to prevent deadlocks",
                        data.descriptor
                    ),
                ));
            }
            log::warn!(
                "{} is not yet resolved. Redefining it could cause arbitrary length waits \
                 while it is resolved.",
                data.descriptor
            );
        }

        let unmodifiable = |reason: &str| Err((ErrorCode::UnmodifiableClass, reason.to_string()));
        if data.is_primitive() {
            return unmodifiable("Modification of primitive classes is not supported");
        }
        if data.is_interface() {
            return unmodifiable("Modification of Interface classes is currently not supported");
        }
        if class == state.class_linker.well_known().string {
            return unmodifiable("Modification of String class is not supported");
        }
        if data.is_array() {
            return unmodifiable("Modification of Array classes is not supported");
        }
        if data.is_proxy() {
            return unmodifiable("Modification of proxy classes is not supported");
        }
        if data.is_root() {
            return unmodifiable("Modification of the root class is not supported");
        }
        if data.is_retired() {
            return unmodifiable("Class has been superseded by a structural redefinition");
        }
        if self.config.is_never_obsolete(&data.descriptor) {
            return unmodifiable("Class might have stack frames that cannot be made obsolete");
        }
        Ok(())
    }

    /// Additional rules for classes that get a new class object
    ///
    /// Initializes the class if it is not initialized yet.
    pub fn check_structurally_redefinable(
        &self,
        state: &mut RuntimeState,
        class: ObjectRef,
    ) -> StepResult<()> {
        let data = class_data(state, class)?;
        let descriptor = data.descriptor.clone();
        if data.status == ClassStatus::Initializing && data.clinit_thread == Some(self.thread) {
            return Err((
                ErrorCode::Internal,
                format!("Modification of class {descriptor} during class initialization is not allowed."),
            ));
        }
        if let Err(e) = state.initialize_class(self.thread, class) {
            return Err((
                ErrorCode::InvalidClass,
                format!(
                    "Class {descriptor} failed initialization. Structural redefinition of \
                     erroneous classes is not allowed. Failure was: {e}"
                ),
            ));
        }

        let data = class_data(state, class)?;
        if data.has_flag(morph_runtime::class_flags::MIRRORED) {
            return Err((
                ErrorCode::UnmodifiableClass,
                format!("Class {descriptor} is a mirror class and cannot be structurally redefined."),
            ));
        }
        let thread_class = state.class_linker.well_known().thread;
        if state.is_subclass_of(thread_class, class) {
            return Err((
                ErrorCode::UnmodifiableClass,
                "The thread class has fields accessed directly by the runtime. It is not safe to \
                 structurally redefine it."
                    .to_string(),
            ));
        }

        let has_pointer_marker = |c: ObjectRef| {
            state
                .class(c)
                .and_then(|d| d.ext.as_ref())
                .is_some_and(|ext| ext.pointer_ids.any())
        };
        if has_pointer_marker(class) {
            return Err((
                ErrorCode::UnmodifiableClass,
                format!("{descriptor} has active pointer jni-ids and cannot be redefined structurally"),
            ));
        }
        if let Some(sub) = state
            .loaded_subclasses(class)
            .into_iter()
            .find(|c| has_pointer_marker(*c))
        {
            let sub_descriptor = state.descriptor_of(sub).unwrap_or("?");
            return Err((
                ErrorCode::UnmodifiableClass,
                format!(
                    "{descriptor} has active pointer jni-ids from subtype {sub_descriptor} and \
                     cannot be redefined structurally"
                ),
            ));
        }
        Ok(())
    }

    // ===== Shape =====

    /// Class-level shape: modifiers, name, superclass and interfaces
    pub fn check_class(&self, state: &RuntimeState, class: ObjectRef, def: &ClassDef) -> StepResult<()> {
        let data = class_data(state, class)?;
        if def.access_flags & access::CLASS_FLAGS_MASK != data.access_flags & access::CLASS_FLAGS_MASK {
            return Err((
                ErrorCode::UnsupportedClassModifiersChanged,
                "Cannot change modifiers of class by redefinition".to_string(),
            ));
        }
        if def.descriptor != data.descriptor {
            return Err((
                ErrorCode::NamesDontMatch,
                format!(
                    "expected file to contain class called '{}' but found '{}'!",
                    data.descriptor, def.descriptor
                ),
            ));
        }

        let current_super = data.super_class.and_then(|s| state.descriptor_of(s));
        match (current_super, def.superclass.as_deref()) {
            (None, Some(_)) => {
                return Err((ErrorCode::UnsupportedHierarchyChanged, "Superclass added!".to_string()))
            }
            (Some(old), Some(new)) if old == new => {}
            (Some(_), _) => {
                return Err((ErrorCode::UnsupportedHierarchyChanged, "Superclass changed".to_string()))
            }
            (None, None) => {}
        }

        if data.interfaces.len() != def.interfaces.len() {
            let reason = if data.interfaces.is_empty() {
                "Interfaces added"
            } else {
                "Interfaces added or removed"
            };
            return Err((ErrorCode::UnsupportedHierarchyChanged, reason.to_string()));
        }
        let reordered = data
            .interfaces
            .iter()
            .zip(&def.interfaces)
            .any(|(old, new)| state.descriptor_of(*old) != Some(new.as_str()));
        if reordered {
            return Err((
                ErrorCode::UnsupportedHierarchyChanged,
                "Interfaces changed or re-ordered".to_string(),
            ));
        }
        Ok(())
    }

    fn check_fields(
        &self,
        state: &RuntimeState,
        class: ObjectRef,
        def: &ClassDef,
        mode: RedefinitionMode,
        report: &mut ShapeReport,
    ) -> StepResult<()> {
        let data = class_data(state, class)?;
        let old_fields: Vec<_> = data
            .instance_fields
            .iter()
            .chain(&data.static_fields)
            .filter_map(|id| state.fields.get(*id))
            .collect();
        let mut seen = vec![false; old_fields.len()];

        for new_field in &def.fields {
            let old = old_fields
                .iter()
                .position(|f| f.name == new_field.name && f.descriptor == new_field.descriptor);
            match old {
                None if mode == RedefinitionMode::Structural => report.added_fields = true,
                None => {
                    return Err((
                        ErrorCode::UnsupportedSchemaChanged,
                        format!("Unknown field {}:{} added!", new_field.name, new_field.descriptor),
                    ))
                }
                Some(off) if old_fields[off].access_flags != new_field.access_flags => {
                    return Err((
                        ErrorCode::UnsupportedSchemaChanged,
                        format!(
                            "Field {}:{} had different access flags",
                            new_field.name, new_field.descriptor
                        ),
                    ))
                }
                Some(off) if seen[off] => {
                    return Err((
                        ErrorCode::FailsVerification,
                        format!("Duplicate field {}:{}", new_field.name, new_field.descriptor),
                    ))
                }
                Some(off) => seen[off] = true,
            }
        }
        if let Some(off) = seen.iter().position(|s| !s) {
            return Err((
                ErrorCode::UnsupportedSchemaChanged,
                format!(
                    "Field {}:{} is missing!",
                    old_fields[off].name, old_fields[off].descriptor
                ),
            ));
        }
        Ok(())
    }

    fn check_methods(
        &self,
        state: &RuntimeState,
        class: ObjectRef,
        def: &ClassDef,
        mode: RedefinitionMode,
        report: &mut ShapeReport,
    ) -> StepResult<()> {
        let data = class_data(state, class)?;
        let old_methods: Vec<_> = data
            .methods
            .iter()
            .filter_map(|id| state.methods.get(*id))
            .collect();
        let structural = mode == RedefinitionMode::Structural;
        if !structural && def.methods.len() != old_methods.len() {
            let code = if def.methods.len() > old_methods.len() {
                ErrorCode::UnsupportedMethodAdded
            } else {
                ErrorCode::UnsupportedMethodDeleted
            };
            return Err((
                code,
                format!(
                    "Total number of declared methods changed from {} to {}",
                    old_methods.len(),
                    def.methods.len()
                ),
            ));
        }

        let track_seen = structural || self.config.checks.verify_members_matched_once;
        let mut seen = vec![false; if track_seen { old_methods.len() } else { 0 }];
        for new_method in &def.methods {
            let old = old_methods
                .iter()
                .position(|m| m.name == new_method.name && m.signature == new_method.signature);
            match old {
                None if structural => report.added_methods = true,
                None => {
                    return Err((
                        ErrorCode::UnsupportedMethodAdded,
                        format!(
                            "Unknown virtual method {}{} was added!",
                            new_method.name, new_method.signature
                        ),
                    ))
                }
                Some(off) if old_methods[off].access_flags != new_method.access_flags => {
                    return Err((
                        ErrorCode::UnsupportedMethodModifiersChanged,
                        format!(
                            "method {}{} had different access flags",
                            new_method.name, new_method.signature
                        ),
                    ))
                }
                Some(off) if track_seen && seen[off] => {
                    return Err((
                        ErrorCode::FailsVerification,
                        format!("Duplicate method {}{}", new_method.name, new_method.signature),
                    ))
                }
                Some(off) if track_seen => seen[off] = true,
                Some(_) => {}
            }
        }
        if let Some(off) = seen.iter().position(|s| !s) {
            debug_assert!(structural, "a missing method should have failed earlier");
            return Err((
                ErrorCode::UnsupportedMethodDeleted,
                format!("Method {} missing!", old_methods[off].pretty_name()),
            ));
        }
        Ok(())
    }

    // ===== Verification =====

    /// Verify the replacement in the class's loader context
    pub fn check_verification(
        &self,
        state: &RuntimeState,
        class: ObjectRef,
        def: &ClassDef,
    ) -> StepResult<VerifyOutcome> {
        let loader = class_data(state, class)?.loader;
        let outcome = state
            .verifier
            .verify_class(def, &LoaderResolver::new(&state.class_linker, loader));
        match &outcome {
            VerifyOutcome::HardFailure(e) => Err((
                ErrorCode::FailsVerification,
                format!("Failed to verify class. Error was: {e}"),
            )),
            VerifyOutcome::SoftFailure(unresolved) => {
                log::debug!(
                    "{} soft-failed verification ({} unresolved references); reverifying after commit",
                    def.descriptor,
                    unresolved.len()
                );
                Ok(outcome)
            }
            VerifyOutcome::NoFailure => Ok(outcome),
        }
    }
}
