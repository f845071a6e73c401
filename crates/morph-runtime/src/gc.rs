//! Mark-sweep garbage collection and global reference replacement
//!
//! The collector is stop-the-world and non-moving. Roots are the class
//! table, global references, thread stacks, dex cache type slots and the
//! declaring classes of methods still referenced from native structures.
//!
//! A retired class is reached only through the extension record of the
//! class that replaced it; its `superseded_by` link is never traced.

use crate::heap::{ObjectBody, ObjectRef};
use crate::method::MethodId;
use crate::runtime::RuntimeState;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

/// Garbage collection statistics
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Total number of collections
    pub collections: usize,

    /// Total objects freed
    pub objects_freed: usize,

    /// Total bytes freed
    pub bytes_freed: usize,

    /// Total pause time across all collections
    pub total_pause_time: Duration,

    /// Last collection duration
    pub last_pause_time: Duration,

    /// Objects marked in last collection
    pub last_marked_count: usize,

    /// Objects freed in last collection
    pub last_freed_count: usize,

    /// Live objects after last collection
    pub live_objects: usize,

    /// Live bytes after last collection
    pub live_bytes: usize,
}

impl GcStats {
    fn update(
        &mut self,
        pause_time: Duration,
        marked: usize,
        freed: usize,
        freed_bytes: usize,
        live_objects: usize,
        live_bytes: usize,
    ) {
        self.collections += 1;
        self.objects_freed += freed;
        self.bytes_freed += freed_bytes;
        self.total_pause_time += pause_time;
        self.last_pause_time = pause_time;
        self.last_marked_count = marked;
        self.last_freed_count = freed;
        self.live_objects = live_objects;
        self.live_bytes = live_bytes;
    }

    /// Get survival rate (0.0 to 1.0)
    pub fn survival_rate(&self) -> f64 {
        let total = self.last_marked_count + self.last_freed_count;
        if total == 0 {
            return 0.0;
        }
        self.last_marked_count as f64 / total as f64
    }
}

/// Collector state
#[derive(Debug, Default)]
pub struct GarbageCollector {
    stats: GcStats,
    disable_count: u32,
}

impl GarbageCollector {
    /// Statistics
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Prevent collections (nests)
    pub fn disable(&mut self) {
        self.disable_count += 1;
    }

    /// Undo one [`disable`](Self::disable)
    pub fn enable(&mut self) {
        self.disable_count = self.disable_count.saturating_sub(1);
    }

    /// Whether collections are currently prevented
    pub fn is_disabled(&self) -> bool {
        self.disable_count > 0
    }
}

impl RuntimeState {
    fn gather_roots(&self) -> Vec<ObjectRef> {
        let mut roots: Vec<ObjectRef> = self.class_linker.classes().collect();
        let wk = self.class_linker.well_known();
        roots.extend([wk.class_class, wk.object, wk.string, wk.thread]);
        roots.extend(self.globals.iter());

        let declaring = |id: MethodId| self.methods.get(id).map(|m| m.declaring_class);
        for thread in self.threads.iter() {
            for frame in thread.frames() {
                roots.extend(frame.registers.iter().filter_map(|v| v.as_object()));
                roots.extend(declaring(frame.method));
            }
        }
        for (_, cache) in self.dex_caches.iter() {
            for slots in &cache.slots {
                roots.extend(slots.types.iter().flatten().copied());
            }
        }
        roots.extend(self.code_cache.methods_with_code().filter_map(declaring));
        roots.extend(self.jni_ids.methods().filter_map(declaring));
        roots
    }

    /// Run a full collection; returns `false` if collection is disabled
    pub fn collect_garbage(&mut self) -> bool {
        if self.gc.is_disabled() {
            log::debug!("collection skipped: disabled");
            return false;
        }
        let start = Instant::now();

        let mut worklist = self.gather_roots();
        let mut marked = 0;
        while let Some(r) = worklist.pop() {
            let Some(obj) = self.heap.get_mut(r) else {
                continue;
            };
            if obj.header.is_marked() {
                continue;
            }
            obj.header.mark();
            marked += 1;
            worklist.push(obj.header.class);
            obj.for_each_reference(|child| worklist.push(child));
        }

        let dead: Vec<ObjectRef> = self
            .heap
            .objects()
            .filter(|(_, o)| !o.header.is_marked())
            .map(|(r, _)| r)
            .collect();
        let mut freed_bytes = 0;
        for r in &dead {
            freed_bytes += self.heap.free(*r);
        }
        for (_, obj) in self.heap.objects_mut() {
            obj.header.unmark();
        }

        let live_objects = self.heap.live_objects();
        let live_bytes = self.heap.allocated_bytes();
        self.gc.stats.update(
            start.elapsed(),
            marked,
            dead.len(),
            freed_bytes,
            live_objects,
            live_bytes,
        );
        log::debug!(
            "gc: marked {marked}, freed {} objects ({freed_bytes} bytes)",
            dead.len()
        );
        true
    }

    /// Replace every reference to a key of `map` with its value
    ///
    /// Covers object fields, array elements, class bodies, header class
    /// pointers and every root. The replaced objects themselves are left
    /// untouched, as are method and field metadata.
    pub fn replace_references(&mut self, map: &FxHashMap<ObjectRef, ObjectRef>) {
        if map.is_empty() {
            return;
        }
        let f = |r: ObjectRef| map.get(&r).copied();

        for (r, obj) in self.heap.objects_mut() {
            if map.contains_key(&r) {
                continue;
            }
            if let Some(new) = f(obj.header.class) {
                obj.header.class = new;
            }
            match &mut obj.body {
                ObjectBody::Instance(values) | ObjectBody::Array(values) => {
                    for value in values {
                        value.remap_ref(f);
                    }
                }
                ObjectBody::Class(class) => class.remap_references(&f),
            }
        }

        self.class_linker.remap_roots(&f);
        self.globals.remap(&f);
        for thread in self.threads.iter_mut() {
            for frame in thread.frames_mut() {
                for value in &mut frame.registers {
                    value.remap_ref(f);
                }
            }
        }
        for (_, cache) in self.dex_caches.iter_mut() {
            for slots in &mut cache.slots {
                for slot in slots.types.iter_mut().flatten() {
                    if let Some(new) = f(*slot) {
                        *slot = new;
                    }
                }
            }
        }
        log::debug!("replaced references to {} objects", map.len());
    }
}
