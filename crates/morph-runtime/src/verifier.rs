//! Bytecode verifier oracle
//!
//! The runtime consults a pluggable [`ClassVerifier`] when it defines a class
//! and when redefinition checks a replacement. [`DefaultVerifier`] runs the
//! structural verifier from `morph-classfile`.

use crate::class_linker::{ClassLinker, LoaderId};
use morph_classfile::{verify_class, ClassDef, TypeResolver, VerifyOutcome};

/// Pass/fail oracle for class definitions
pub trait ClassVerifier: Send + Sync {
    /// Verify `def` in the loader context described by `resolver`
    fn verify_class(&self, def: &ClassDef, resolver: &dyn TypeResolver) -> VerifyOutcome;
}

/// Structural verifier from the class-file crate
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultVerifier;

impl ClassVerifier for DefaultVerifier {
    fn verify_class(&self, def: &ClassDef, resolver: &dyn TypeResolver) -> VerifyOutcome {
        verify_class(def, resolver)
    }
}

/// Resolves type descriptors against the classes visible to one loader
pub struct LoaderResolver<'a> {
    linker: &'a ClassLinker,
    loader: LoaderId,
}

impl<'a> LoaderResolver<'a> {
    /// Resolver for `loader`
    pub fn new(linker: &'a ClassLinker, loader: LoaderId) -> Self {
        Self { linker, loader }
    }
}

impl TypeResolver for LoaderResolver<'_> {
    fn is_resolvable(&self, descriptor: &str) -> bool {
        let element = descriptor.trim_start_matches('[');
        self.linker.find(self.loader, element).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeState;

    #[test]
    fn test_loader_resolver() {
        let mut state = RuntimeState::new();
        state.bootstrap().unwrap();
        let loader = state.class_linker.create_loader();
        let resolver = LoaderResolver::new(&state.class_linker, loader);
        assert!(resolver.is_resolvable("Ljava/lang/Object;"));
        assert!(resolver.is_resolvable("[[I"));
        assert!(!resolver.is_resolvable("LNowhere;"));
    }
}
