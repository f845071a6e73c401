//! Stack migration
//!
//! Rewrites every frame executing a method that is about to be redefined so
//! that it runs the method's obsolete copy instead. Runs with every other
//! thread suspended.

use crate::obsolete::ObsoleteMap;
use morph_runtime::jit::CodeCache;
use morph_runtime::method::MethodArena;
use morph_runtime::thread::ThreadList;
use morph_runtime::{Frame, ThreadId};
use std::ops::ControlFlow;

/// Move frames running methods covered by `maps` onto obsolete copies
///
/// Each original method gets at most one obsolete copy; later frames reuse
/// it. The code cache learns about every (original, obsolete) pair once all
/// stacks have been walked. Returns the number of frames rewritten.
///
/// # Panics
///
/// Panics if an inlined frame runs a covered method: the body it was
/// inlined into cannot be tied to a metadata source.
pub fn migrate_obsolete_frames(
    threads: &mut ThreadList,
    methods: &mut MethodArena,
    code_cache: &mut CodeCache,
    maps: &mut [ObsoleteMap],
) -> usize {
    let mut migrated = 0;
    threads.walk_all_stacks(&mut |thread: ThreadId, frame: &mut Frame| {
        let original = frame.method;
        let Some(map) = maps.iter_mut().find(|m| m.covers(original)) else {
            return ControlFlow::Continue(());
        };
        if frame.inlined {
            let name = methods
                .get(original)
                .map_or_else(|| format!("{original:?}"), |m| m.pretty_name());
            panic!("inlined frame of {name} on thread {thread} cannot be made obsolete");
        }
        let obsolete = match map.find_existing(original) {
            Some(existing) => Some(existing),
            None => map.record_new(methods, original),
        };
        if let Some(obsolete) = obsolete {
            log::trace!("thread {thread}: frame at pc {} moved to {obsolete:?}", frame.dex_pc);
            frame.method = obsolete;
            migrated += 1;
        }
        ControlFlow::Continue(())
    });

    for map in maps.iter() {
        for (from, to) in map.moved() {
            code_cache.move_obsolete_method(*from, *to);
        }
    }
    migrated
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_classfile::{access, ClassDef, ClassFile, CodeItem, MethodDef};
    use morph_runtime::jit::CodeCacheEvent;
    use morph_runtime::{LoaderId, ObjectRef, RuntimeState};
    use std::sync::Arc;

    fn setup() -> (RuntimeState, ObjectRef, ThreadId, ThreadId) {
        let mut state = RuntimeState::new();
        state.bootstrap().unwrap();
        let def = ClassDef::new("LFoo;", Some("Ljava/lang/Object;"))
            .with_method(MethodDef::new("run", "()V", access::ACC_PUBLIC, Some(CodeItem::new(0, vec![0x51]))))
            .with_method(MethodDef::new("idle", "()V", access::ACC_PUBLIC, Some(CodeItem::new(0, vec![0x51]))));
        let bytes: Arc<[u8]> = ClassFile::single(def).encode().into();
        let dex = state.open_dex_file("foo.mdef", bytes, LoaderId::BOOT).unwrap();
        let class = state.define_class(ThreadId::from_raw(1), LoaderId::BOOT, dex, 0).unwrap();
        let a = state.threads.attach("a");
        let b = state.threads.attach("b");
        (state, class, a, b)
    }

    fn walk(state: &mut RuntimeState, maps: &mut [ObsoleteMap]) -> usize {
        let RuntimeState {
            threads,
            methods,
            code_cache,
            ..
        } = state;
        migrate_obsolete_frames(threads, methods, code_cache, maps)
    }

    #[test]
    fn test_frames_share_one_obsolete_copy() {
        let (mut state, class, a, b) = setup();
        let run = state.find_declared_method(class, "run", "()V").unwrap();
        let idle = state.find_declared_method(class, "idle", "()V").unwrap();
        state.threads.get_mut(a).unwrap().push_frame(Frame::new(run, vec![]));
        state.threads.get_mut(a).unwrap().push_frame(Frame::new(run, vec![]));
        state.threads.get_mut(b).unwrap().push_frame(Frame::new(run, vec![]));

        let mut maps = vec![ObsoleteMap::allocate(&mut state, class).unwrap()];
        assert_eq!(walk(&mut state, &mut maps), 3);

        let obsolete = maps[0].find_existing(run).unwrap();
        assert_eq!(maps[0].recorded(), 1);
        assert_eq!(maps[0].find_existing(idle), None);
        for t in [a, b] {
            assert!(state.threads.get(t).unwrap().frames().iter().all(|f| f.method == obsolete));
        }
        assert_eq!(
            state.code_cache.events().last(),
            Some(&CodeCacheEvent::MethodMoved { from: run, to: obsolete })
        );
    }

    #[test]
    fn test_unrelated_frames_untouched() {
        let (mut state, class, a, _) = setup();
        state
            .threads
            .get_mut(a)
            .unwrap()
            .push_frame(Frame::new(morph_runtime::MethodId::from_raw(4242), vec![]));
        let mut maps = vec![ObsoleteMap::allocate(&mut state, class).unwrap()];
        assert_eq!(walk(&mut state, &mut maps), 0);
        assert!(!maps[0].is_used());
        assert!(state.code_cache.events().is_empty());
    }

    #[test]
    #[should_panic(expected = "cannot be made obsolete")]
    fn test_inlined_frame_is_fatal() {
        let (mut state, class, a, _) = setup();
        let run = state.find_declared_method(class, "run", "()V").unwrap();
        state.threads.get_mut(a).unwrap().push_frame(Frame::inlined(run));
        let mut maps = vec![ObsoleteMap::allocate(&mut state, class).unwrap()];
        walk(&mut state, &mut maps);
    }
}
