//! Shared fixtures for the redefinition integration tests

#![allow(dead_code)]

use morph_classfile::{ClassDef, ClassFile, CodeItem};
use morph_redefine::{
    AgentEnv, Capabilities, ClassDefinition, RedefineError, Redefiner, RedefinitionConfig,
    RedefinitionMode,
};
use morph_runtime::{GlobalRef, LoaderId, ObjectRef, Runtime, RuntimeOptions, ThreadId};

pub const OBJECT: &str = "Ljava/lang/Object;";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Code item of `bytes` with no registers
pub fn code(bytes: &[u8]) -> Option<CodeItem> {
    Some(CodeItem::new(0, bytes.to_vec()))
}

/// Encoded single-class file
pub fn encode(def: ClassDef) -> Vec<u8> {
    ClassFile::single(def).encode()
}

/// Configuration granting both redefinition capabilities
pub fn structural_config() -> RedefinitionConfig {
    RedefinitionConfig {
        capabilities: Capabilities {
            can_redefine_classes: true,
            can_structurally_redefine_classes: true,
        },
        ..RedefinitionConfig::default()
    }
}

/// A runtime, an agent environment and the agent's thread
pub struct Harness {
    pub rt: Runtime,
    pub env: AgentEnv,
    pub thread: ThreadId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(RuntimeOptions::default(), structural_config())
    }

    pub fn with(options: RuntimeOptions, config: RedefinitionConfig) -> Self {
        init_logging();
        let rt = Runtime::new(options).unwrap();
        let thread = rt.attach_thread("agent");
        Self {
            rt,
            env: AgentEnv::new(config),
            thread,
        }
    }

    /// Define a class in the boot loader and hold a global reference to it
    pub fn define(&self, def: ClassDef) -> (ObjectRef, GlobalRef) {
        let name = def.descriptor.trim_start_matches('L').trim_end_matches(';');
        let location = format!("{name}.mdef");
        let class = self
            .rt
            .define_classes(self.thread, LoaderId::BOOT, &location, &encode(def))
            .unwrap()[0];
        (class, self.rt.new_global_ref(class))
    }

    pub fn redefiner(&self) -> Redefiner<'_> {
        Redefiner::new(&self.rt, &self.env, self.thread)
    }

    /// Redefine each (class, replacement) pair in one batch
    pub fn redefine(
        &self,
        mode: RedefinitionMode,
        batch: Vec<(GlobalRef, ClassDef)>,
    ) -> Result<(), RedefineError> {
        let definitions: Vec<ClassDefinition> = batch
            .into_iter()
            .map(|(class, def)| ClassDefinition::new(class, encode(def)))
            .collect();
        self.redefiner().redefine_classes(mode, &definitions)
    }

    /// Current class object behind a global reference
    pub fn class_of(&self, handle: GlobalRef) -> ObjectRef {
        self.rt.decode_global_ref(handle).unwrap()
    }
}
