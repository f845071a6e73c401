//! Morph Class Redefinition
//!
//! Replaces the definition of loaded classes while the runtime keeps
//! running. A batch is all-or-nothing and goes through:
//!
//! - loading each replacement ([`loader`]) and checking it against the
//!   class it replaces ([`checker`])
//! - staging obsolete-method tables ([`obsolete`]) and, for changes that add
//!   members, rebuilding class objects and instances ([`structural`])
//! - a stop-the-world commit that moves live frames onto obsolete methods
//!   ([`stack_walker`]) and rewrites every affected reference ([`rewriter`])
//! - re-verification of classes that soft-failed verification ([`reverify`])
//!
//! [`Redefiner`] drives the phases; [`barrier`] holds the runtime pauses
//! around them.
//!
//! # Example
//!
//! ```no_run
//! use morph_redefine::{AgentEnv, ClassDefinition, Redefiner, RedefinitionMode};
//! use morph_runtime::{GlobalRef, Runtime, RuntimeOptions};
//!
//! fn swap(rt: &Runtime, class: GlobalRef, bytes: Vec<u8>) -> Result<(), morph_redefine::RedefineError> {
//!     let env = AgentEnv::default();
//!     let thread = rt.attach_thread("agent");
//!     Redefiner::new(rt, &env, thread)
//!         .redefine_classes(RedefinitionMode::InPlace, &[ClassDefinition::new(class, bytes)])
//! }
//! # let _ = swap;
//! # let _ = Runtime::new(RuntimeOptions::default());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod barrier;
pub mod checker;
pub mod config;
pub mod driver;
pub mod error;
pub mod loader;
pub mod obsolete;
pub mod reverify;
pub mod rewriter;
pub mod stack_walker;
pub mod structural;

pub use checker::{Kind, RedefinitionMode};
pub use config::{AgentEnv, Capabilities, ConfigError, RedefinitionConfig};
pub use driver::{ClassDefinition, Redefiner};
pub use error::{ErrorCode, RedefineError};
pub use loader::{LoadError, ReplacementUnit};
pub use structural::CorrespondenceTable;
