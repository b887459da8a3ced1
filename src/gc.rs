//! Script heap and mark-sweep collector
//!
//! Entries live in one growable vector addressed by `u32` index. Unused
//! entries form a free list threaded through the vector itself. The heap
//! never collects on its own: the VM checks `is_full`, gathers roots and
//! calls `collect` at an allocation point, then `grow`s if too little came
//! back.

use crate::error::{ErrorKind, FerruleError, Result};
use crate::value::Slot;
use std::rc::Rc;

/// A callable value; wrappers unwrap outside-in at call time
#[derive(Debug, Clone, PartialEq)]
pub enum Callable {
    Plain(u32),
    /// `bind(func, arg)`
    Curried { func: u32, arg: Slot },
    /// Drops the wrapped function's result
    Discard(u32),
    /// Fails unless the wrapped function returns true
    Assert(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorValue {
    Success(Slot),
    Failure(String),
}

/// Heap objects
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Str(Rc<str>),
    /// Lazy concatenation of two string entries; `len` in chars
    Concat { left: u32, right: u32, len: usize },
    List(Vec<Slot>),
    /// Struct fields or tuple items
    Struct(Vec<Slot>),
    Func(Callable),
    Boxed { type_id: u32, value: Slot },
    Error(ErrorValue),
}

impl Object {
    /// Push the heap indices this object refers to
    fn trace(&self, out: &mut Vec<u32>) {
        let slots = |slots: &[Slot], out: &mut Vec<u32>| out.extend(slots.iter().filter_map(|s| s.heap_index()));
        match self {
            Object::Str(_) => {}
            Object::Concat { left, right, .. } => out.extend([*left, *right]),
            Object::List(items) | Object::Struct(items) => slots(items, out),
            Object::Func(callable) => match callable {
                Callable::Plain(_) => {}
                Callable::Curried { func, arg } => {
                    out.push(*func);
                    out.extend(arg.heap_index());
                }
                Callable::Discard(inner) | Callable::Assert(inner) => out.push(*inner),
            },
            Object::Boxed { value, .. } | Object::Error(ErrorValue::Success(value)) => out.extend(value.heap_index()),
            Object::Error(ErrorValue::Failure(_)) => {}
        }
    }
}

#[derive(Debug)]
struct Entry {
    object: Object,
    marked: bool,
    pins: u32,
}

#[derive(Debug)]
enum HeapSlot {
    Free { next: Option<u32> },
    Live(Entry),
}

/// Outcome of one collection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectStats {
    pub before: usize,
    pub after: usize,
    pub capacity: usize,
}

impl CollectStats {
    pub fn freed(&self) -> usize {
        self.before - self.after
    }
}

pub struct Heap {
    slots: Vec<HeapSlot>,
    free: Option<u32>,
    live: usize,
    max_entries: usize,
    pub collections: u64,
}

impl Heap {
    pub fn new(initial_entries: usize, max_entries: usize) -> Self {
        let mut heap = Self {
            slots: Vec::new(),
            free: None,
            live: 0,
            max_entries: max_entries.max(1),
            collections: 0,
        };
        heap.extend_to(initial_entries.clamp(1, heap.max_entries));
        heap
    }

    fn extend_to(&mut self, capacity: usize) {
        let start = self.slots.len();
        for index in start..capacity {
            let next = if index + 1 < capacity { Some(index as u32 + 1) } else { self.free };
            self.slots.push(HeapSlot::Free { next });
        }
        if capacity > start {
            self.free = Some(start as u32);
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// No free entry left: the next allocation needs a collection or growth
    pub fn is_full(&self) -> bool {
        self.free.is_none()
    }

    /// Double the entry count, capped at the configured maximum
    pub fn grow(&mut self) -> Result<()> {
        let current = self.slots.len();
        if current >= self.max_entries {
            return Err(FerruleError::new(ErrorKind::HeapExhausted(current), None));
        }
        let target = (current * 2).min(self.max_entries);
        tracing::debug!(from = current, to = target, "growing heap");
        self.extend_to(target);
        Ok(())
    }

    /// Place `object` in a free entry. The caller must have made room.
    pub fn insert(&mut self, object: Object) -> Result<u32> {
        let index = match self.free {
            Some(index) => index,
            None => {
                self.grow()?;
                self.free.ok_or_else(|| FerruleError::defect("heap grew without free entries"))?
            }
        };
        let next = match &self.slots[index as usize] {
            HeapSlot::Free { next } => *next,
            HeapSlot::Live(_) => return Err(FerruleError::defect(format!("free list points at live entry {}", index))),
        };
        self.free = next;
        self.slots[index as usize] = HeapSlot::Live(Entry { object, marked: false, pins: 0 });
        self.live += 1;
        Ok(index)
    }

    pub fn get(&self, index: u32) -> Result<&Object> {
        match self.slots.get(index as usize) {
            Some(HeapSlot::Live(entry)) => Ok(&entry.object),
            _ => Err(FerruleError::defect(format!("dangling heap index {}", index))),
        }
    }

    pub fn get_mut(&mut self, index: u32) -> Result<&mut Object> {
        match self.slots.get_mut(index as usize) {
            Some(HeapSlot::Live(entry)) => Ok(&mut entry.object),
            _ => Err(FerruleError::defect(format!("dangling heap index {}", index))),
        }
    }

    pub fn is_live(&self, index: u32) -> bool {
        matches!(self.slots.get(index as usize), Some(HeapSlot::Live(_)))
    }

    /// Keep `index` alive regardless of reachability until a matching `unpin`
    pub fn pin(&mut self, index: u32) -> Result<()> {
        match self.slots.get_mut(index as usize) {
            Some(HeapSlot::Live(entry)) => {
                entry.pins += 1;
                Ok(())
            }
            _ => Err(FerruleError::defect(format!("pinning dead heap index {}", index))),
        }
    }

    pub fn unpin(&mut self, index: u32) -> Result<()> {
        match self.slots.get_mut(index as usize) {
            Some(HeapSlot::Live(entry)) if entry.pins > 0 => {
                entry.pins -= 1;
                Ok(())
            }
            _ => Err(FerruleError::defect(format!("unbalanced unpin of heap index {}", index))),
        }
    }

    /// Mark everything reachable from `roots` and pinned entries, then free
    /// the rest and rebuild the free list
    pub fn collect<'a>(&mut self, roots: impl IntoIterator<Item = &'a Slot>) -> CollectStats {
        let before = self.live;
        let mut pending: Vec<u32> = roots.into_iter().filter_map(|slot| slot.heap_index()).collect();
        for (index, slot) in self.slots.iter().enumerate() {
            if let HeapSlot::Live(entry) = slot {
                if entry.pins > 0 {
                    pending.push(index as u32);
                }
            }
        }

        while let Some(index) = pending.pop() {
            if let Some(HeapSlot::Live(entry)) = self.slots.get_mut(index as usize) {
                if entry.marked {
                    continue;
                }
                entry.marked = true;
                entry.object.trace(&mut pending);
            }
        }

        // Sweep from the top so the rebuilt free list hands out low indices first
        self.free = None;
        self.live = 0;
        for index in (0..self.slots.len()).rev() {
            let keep = match &mut self.slots[index] {
                HeapSlot::Live(entry) if entry.marked => {
                    entry.marked = false;
                    true
                }
                _ => false,
            };
            if keep {
                self.live += 1;
            } else {
                self.slots[index] = HeapSlot::Free { next: self.free };
                self.free = Some(index as u32);
            }
        }

        self.collections += 1;
        let stats = CollectStats { before, after: self.live, capacity: self.slots.len() };
        tracing::debug!(before, after = stats.after, capacity = stats.capacity, "garbage collected");
        stats
    }

    // ==================== Strings ====================

    /// Character count of a string entry
    pub fn string_len(&self, index: u32) -> Result<usize> {
        match self.get(index)? {
            Object::Str(text) => Ok(text.chars().count()),
            Object::Concat { len, .. } => Ok(*len),
            other => Err(FerruleError::defect(format!("expected string, found {:?}", other))),
        }
    }

    /// Read a string entry without changing the heap
    pub fn read_string(&self, index: u32) -> Result<String> {
        let mut out = String::new();
        let mut pending = vec![index];
        while let Some(index) = pending.pop() {
            match self.get(index)? {
                Object::Str(text) => out.push_str(text),
                Object::Concat { left, right, .. } => {
                    pending.push(*right);
                    pending.push(*left);
                }
                other => return Err(FerruleError::defect(format!("expected string, found {:?}", other))),
            }
        }
        Ok(out)
    }

    /// Materialize a string entry, replacing a concatenation tree with one buffer
    pub fn flatten(&mut self, index: u32) -> Result<Rc<str>> {
        if let Object::Str(text) = self.get(index)? {
            return Ok(text.clone());
        }
        let text: Rc<str> = self.read_string(index)?.into();
        *self.get_mut(index)? = Object::Str(text.clone());
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string(heap: &mut Heap, text: &str) -> u32 {
        heap.insert(Object::Str(text.into())).unwrap()
    }

    #[test]
    fn test_unreachable_entries_are_reclaimed() {
        let mut heap = Heap::new(8, 64);
        let kept = string(&mut heap, "kept");
        let _dropped = string(&mut heap, "dropped");
        let list = heap.insert(Object::List(vec![Slot::Managed(kept)])).unwrap();

        let roots = [Slot::Managed(list)];
        let stats = heap.collect(roots.iter());
        assert_eq!(stats.before, 3);
        assert_eq!(stats.after, 2);
        assert!(heap.is_live(kept));
        assert!(heap.is_live(list));
    }

    #[test]
    fn test_pinned_entries_survive() {
        let mut heap = Heap::new(4, 4);
        let pinned = string(&mut heap, "pinned");
        heap.pin(pinned).unwrap();
        heap.collect(std::iter::empty());
        assert!(heap.is_live(pinned));
        heap.unpin(pinned).unwrap();
        heap.collect(std::iter::empty());
        assert!(!heap.is_live(pinned));
        assert!(heap.unpin(pinned).is_err());
    }

    #[test]
    fn test_growth_and_exhaustion() {
        let mut heap = Heap::new(2, 4);
        for i in 0..4 {
            string(&mut heap, &i.to_string());
        }
        assert_eq!(heap.capacity(), 4);
        assert!(heap.is_full());
        let err = heap.insert(Object::Str("x".into())).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::HeapExhausted(4)));
    }

    #[test]
    fn test_concat_flattens() {
        let mut heap = Heap::new(8, 8);
        let a = string(&mut heap, "ab");
        let b = string(&mut heap, "c");
        let ab_c = heap.insert(Object::Concat { left: a, right: b, len: 3 }).unwrap();
        let all = heap.insert(Object::Concat { left: ab_c, right: a, len: 5 }).unwrap();

        assert_eq!(heap.string_len(all).unwrap(), 5);
        assert_eq!(&*heap.flatten(all).unwrap(), "abcab");
        assert!(matches!(heap.get(all).unwrap(), Object::Str(_)));

        // The flattened entry no longer keeps its parts alive
        let roots = [Slot::Managed(all)];
        heap.collect(roots.iter());
        assert!(!heap.is_live(a));
    }
}
