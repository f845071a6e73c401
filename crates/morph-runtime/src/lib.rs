//! Morph VM Runtime
//!
//! The object model and runtime services class redefinition rides on:
//!
//! - a budgeted object heap with headers and lock words ([`heap`], [`header`])
//! - class objects with extension records and a retired lifecycle ([`class`])
//! - method and field arenas ([`method`]) and metadata sources ([`dex_cache`])
//! - the class linker ([`class_linker`]) and a pluggable verifier ([`verifier`])
//! - threads and stack walking ([`thread`]), safepoints ([`safepoint`]) and
//!   thread gates ([`gate`])
//! - the JIT code cache ([`jit`]), instrumentation ([`instrumentation`]) and
//!   reflective id tables ([`reflective`])
//! - a mark-sweep collector with global reference replacement ([`gc`])
//!
//! [`Runtime`] ties them together behind the mutator lock and state mutex.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod class;
pub mod class_linker;
pub mod dex_cache;
pub mod gate;
pub mod gc;
pub mod globals;
pub mod header;
pub mod heap;
pub mod instrumentation;
pub mod jit;
pub mod method;
pub mod reflective;
pub mod runtime;
pub mod safepoint;
pub mod thread;
pub mod value;
pub mod verifier;

pub use class::{class_flags, ClassData, ClassExt, ClassLifecycle, ClassStatus, OriginalDexFile};
pub use class_linker::{LinkError, LoaderId, WellKnownClasses};
pub use dex_cache::{DexCache, DexCacheId, DexFile};
pub use globals::GlobalRef;
pub use header::LockWord;
pub use heap::{AllocError, ObjectBody, ObjectRef};
pub use method::{method_flags, EntryPoint, Field, FieldId, Method, MethodId};
pub use runtime::{Runtime, RuntimeOptions, RuntimeState, ScopedObjectAccess, ScopedSuspendAll};
pub use safepoint::StopReason;
pub use thread::{Frame, ThreadId};
pub use value::Value;
pub use verifier::{ClassVerifier, DefaultVerifier};
