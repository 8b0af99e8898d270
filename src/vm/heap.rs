//! Object heap with reference counting.
//!
//! Objects live in a generational slab. A handle ([`ObjectRef`]) stays valid
//! until the object is destroyed; afterwards the slot's generation moves on
//! and stale handles no longer resolve.
//!
//! There is no cycle collector. Objects that reference each other through
//! handle fields keep each other alive until the heap itself is dropped.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::types::{ObjectType, TypeId};

/// Handle to a heap object. Encoded on the stack as two words; 0 is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    index: u32,
    generation: u32,
}

impl ObjectRef {
    pub fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64 + 1)
    }

    pub fn from_bits(bits: u64) -> Option<ObjectRef> {
        let low = bits as u32;
        if low == 0 {
            return None;
        }
        Some(ObjectRef {
            index: low - 1,
            generation: (bits >> 32) as u32,
        })
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Encodes an optional handle the way it is stored in memory.
pub fn handle_bits(object: Option<ObjectRef>) -> u64 {
    object.map_or(0, ObjectRef::to_bits)
}

/// One heap object: its type, reference count and word-sized fields.
pub struct ScriptObject {
    ty: Arc<ObjectType>,
    ref_count: u32,
    pub fields: Vec<u32>,
    /// Host payload for application-registered types.
    pub user_data: Option<Box<dyn Any + Send>>,
}

impl ScriptObject {
    pub fn type_id(&self) -> TypeId {
        self.ty.id
    }

    pub fn object_type(&self) -> &Arc<ObjectType> {
        &self.ty
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    fn handle_at(&self, offset: u32) -> Option<ObjectRef> {
        let lo = *self.fields.get(offset as usize)? as u64;
        let hi = *self.fields.get(offset as usize + 1)? as u64;
        ObjectRef::from_bits(lo | (hi << 32))
    }
}

impl fmt::Debug for ScriptObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptObject")
            .field("type", &self.ty.name)
            .field("ref_count", &self.ref_count)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Allocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub allocations: u64,
    pub frees: u64,
    pub add_refs: u64,
    pub releases: u64,
}

struct Slot {
    generation: u32,
    object: Option<ScriptObject>,
}

/// The engine-wide object heap.
#[derive(Default)]
pub struct ObjectHeap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    stats: HeapStats,
}

impl ObjectHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an object with a reference count of one and runs the
    /// type's construct hook.
    pub fn alloc(&mut self, ty: &Arc<ObjectType>) -> ObjectRef {
        let mut object = ScriptObject {
            ty: Arc::clone(ty),
            ref_count: 1,
            fields: vec![0; ty.field_words as usize],
            user_data: None,
        };
        ty.behaviour.construct(&mut object);
        self.stats.allocations += 1;
        self.insert(object)
    }

    fn insert(&mut self, object: ScriptObject) -> ObjectRef {
        match self.free_list.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.object = Some(object);
                ObjectRef {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    object: Some(object),
                });
                ObjectRef {
                    index,
                    generation: 0,
                }
            }
        }
    }

    pub fn get(&self, r: ObjectRef) -> Option<&ScriptObject> {
        let slot = self.slots.get(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.object.as_ref()
    }

    pub fn get_mut(&mut self, r: ObjectRef) -> Option<&mut ScriptObject> {
        let slot = self.slots.get_mut(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.object.as_mut()
    }

    pub fn is_live(&self, r: ObjectRef) -> bool {
        self.get(r).is_some()
    }

    /// Resolves a field address, which only carries the low 16 bits of the
    /// generation.
    pub fn field_mut(&mut self, index: u32, generation: u16, offset: u32) -> Option<&mut u32> {
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation as u16 != generation {
            return None;
        }
        slot.object.as_mut()?.fields.get_mut(offset as usize)
    }

    pub fn add_ref(&mut self, r: ObjectRef) -> bool {
        let Some(object) = self.get_mut(r) else {
            return false;
        };
        object.ref_count += 1;
        let ty = Arc::clone(&object.ty);
        ty.behaviour.add_ref(object);
        self.stats.add_refs += 1;
        true
    }

    /// Drops one reference; destroys the object when none remain.
    /// Returns true if the object was destroyed.
    pub fn release(&mut self, r: ObjectRef) -> bool {
        let Some(object) = self.get_mut(r) else {
            return false;
        };
        object.ref_count = object.ref_count.saturating_sub(1);
        let ty = Arc::clone(&object.ty);
        ty.behaviour.release(object);
        let remaining = object.ref_count;
        self.stats.releases += 1;
        if remaining == 0 {
            self.destroy(r);
            true
        } else {
            false
        }
    }

    /// Release for reference-counted types, otherwise destruct and free.
    pub fn free(&mut self, r: ObjectRef) {
        let ref_counted = match self.get(r) {
            Some(object) => object.ty.flags.ref_counted,
            None => return,
        };
        if ref_counted {
            self.release(r);
        } else {
            self.destroy(r);
        }
    }

    /// Runs the destruct hook and frees the slot, then drops the object's
    /// owned handle fields.
    fn destroy(&mut self, r: ObjectRef) {
        let mut pending = vec![r];
        while let Some(r) = pending.pop() {
            let Some(slot) = self.slots.get_mut(r.index as usize) else {
                continue;
            };
            if slot.generation != r.generation {
                continue;
            }
            let Some(mut object) = slot.object.take() else {
                continue;
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free_list.push(r.index);
            self.stats.frees += 1;

            let ty = Arc::clone(&object.ty);
            ty.behaviour.destruct(&mut object);
            for &offset in &ty.handle_fields {
                let Some(child) = object.handle_at(offset) else {
                    continue;
                };
                let Some(child_obj) = self.get_mut(child) else {
                    continue;
                };
                if child_obj.ty.flags.ref_counted && child_obj.ref_count > 1 {
                    child_obj.ref_count -= 1;
                    let child_ty = Arc::clone(&child_obj.ty);
                    child_ty.behaviour.release(child_obj);
                    self.stats.releases += 1;
                } else {
                    if child_obj.ty.flags.ref_counted {
                        child_obj.ref_count = 0;
                        let child_ty = Arc::clone(&child_obj.ty);
                        child_ty.behaviour.release(child_obj);
                        self.stats.releases += 1;
                    }
                    pending.push(child);
                }
            }
        }
    }

    /// Creates a copy of an object for by-value passing. Owned handle fields
    /// gain a reference.
    pub fn duplicate(&mut self, r: ObjectRef) -> Option<ObjectRef> {
        let source = self.get(r)?;
        let ty = Arc::clone(&source.ty);
        let fields = source.fields.clone();
        let children: Vec<ObjectRef> = ty
            .handle_fields
            .iter()
            .filter_map(|&offset| source.handle_at(offset))
            .collect();

        let copy = self.alloc(&ty);
        if let Some(object) = self.get_mut(copy) {
            object.fields = fields;
        }
        for child in children {
            self.add_ref(child);
        }
        Some(copy)
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::types::TypeBehaviour;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        constructed: AtomicUsize,
        destructed: AtomicUsize,
    }

    impl TypeBehaviour for Counting {
        fn construct(&self, _object: &mut ScriptObject) {
            self.constructed.fetch_add(1, Ordering::SeqCst);
        }
        fn destruct(&self, _object: &mut ScriptObject) {
            self.destructed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ty(ref_counted: bool, behaviour: Arc<Counting>) -> Arc<ObjectType> {
        let mut t = ObjectType::new("T").fields(2).behaviour(behaviour);
        t.flags.ref_counted = ref_counted;
        t.id = TypeId(1);
        Arc::new(t)
    }

    #[test]
    fn test_handle_bits() {
        let r = ObjectRef {
            index: 4,
            generation: 7,
        };
        assert_eq!(ObjectRef::from_bits(r.to_bits()), Some(r));
        assert_eq!(ObjectRef::from_bits(0), None);
        assert_eq!(handle_bits(None), 0);
    }

    #[test]
    fn test_refcount_lifecycle() {
        let hooks = Arc::new(Counting::default());
        let t = ty(true, hooks.clone());
        let mut heap = ObjectHeap::new();
        let r = heap.alloc(&t);
        assert_eq!(hooks.constructed.load(Ordering::SeqCst), 1);

        assert!(heap.add_ref(r));
        assert!(!heap.release(r));
        assert!(heap.is_live(r));
        assert!(heap.release(r));
        assert!(!heap.is_live(r));
        assert_eq!(hooks.destructed.load(Ordering::SeqCst), 1);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_free_value_type_destroys() {
        let hooks = Arc::new(Counting::default());
        let t = ty(false, hooks.clone());
        let mut heap = ObjectHeap::new();
        let r = heap.alloc(&t);
        heap.add_ref(r);
        heap.free(r);
        assert!(!heap.is_live(r));
        assert_eq!(hooks.destructed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let t = ty(true, Arc::new(Counting::default()));
        let mut heap = ObjectHeap::new();
        let a = heap.alloc(&t);
        heap.release(a);
        let b = heap.alloc(&t);
        assert_eq!(a.index(), b.index());
        assert!(heap.get(a).is_none());
        assert!(heap.get(b).is_some());
        assert!(!heap.release(a));
    }

    #[test]
    fn test_owned_fields_released() {
        let leaf = ty(true, Arc::new(Counting::default()));
        let mut parent = ObjectType::new("P").handle_field(0);
        parent.flags.ref_counted = true;
        parent.id = TypeId(2);
        let parent = Arc::new(parent);

        let mut heap = ObjectHeap::new();
        let child = heap.alloc(&leaf);
        let p = heap.alloc(&parent);
        let bits = child.to_bits();
        let fields = &mut heap.get_mut(p).unwrap().fields;
        fields[0] = bits as u32;
        fields[1] = (bits >> 32) as u32;

        heap.release(p);
        assert!(!heap.is_live(child));
        assert_eq!(heap.stats().frees, 2);
    }

    #[test]
    fn test_cycle_is_not_collected() {
        let mut node = ObjectType::new("Node").handle_field(0);
        node.flags.ref_counted = true;
        node.id = TypeId(1);
        let node = Arc::new(node);

        let mut heap = ObjectHeap::new();
        let a = heap.alloc(&node);
        let b = heap.alloc(&node);
        for (from, to) in [(a, b), (b, a)] {
            heap.add_ref(to);
            let bits = to.to_bits();
            let fields = &mut heap.get_mut(from).unwrap().fields;
            fields[0] = bits as u32;
            fields[1] = (bits >> 32) as u32;
        }
        heap.release(a);
        heap.release(b);
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn test_duplicate_copies_fields() {
        let t = ty(true, Arc::new(Counting::default()));
        let mut heap = ObjectHeap::new();
        let r = heap.alloc(&t);
        heap.get_mut(r).unwrap().fields[1] = 99;
        let copy = heap.duplicate(r).unwrap();
        assert_ne!(copy, r);
        assert_eq!(heap.get(copy).unwrap().fields, vec![0, 99]);
    }
}
