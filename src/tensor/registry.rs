//! Arena of tensor records addressed by generation-checked ids
//!
//! Every record is owned here; tensors, backends and invocations refer to it
//! only by [`TensorId`]. Release is deferred while the record is pinned as the
//! parent of a pending operation.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::device::Device;
use crate::dtype::{ByteBuffer, DType};
use crate::error::{Result, TensorError};

/// Arena slot plus generation. Ids of erased records never resolve again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId {
    index: u32,
    generation: u32,
}

impl TensorId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}.{}", self.index, self.generation)
    }
}

/// Where a tensor's host bytes stand relative to its device computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RealizationState {
    /// Recorded by an operator, not yet submitted
    Unrealized,
    /// Submitted, host bytes not yet fetched
    Scheduled,
    /// Host bytes are valid
    Realized,
    /// Execution failed permanently
    Failed,
}

/// Contiguous row-major strides, in elements
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

#[derive(Debug, Clone)]
pub struct TensorRecord {
    pub id: TensorId,
    pub data: ByteBuffer,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
    pub parents: Vec<TensorId>,
    pub device: Arc<Device>,
    pub requires_grad: bool,
    /// Reserved for autodiff; never populated
    pub grad: Option<ByteBuffer>,
    pub state: RealizationState,
}

impl TensorRecord {
    /// Record for host data that is already valid
    pub fn realized(data: ByteBuffer, shape: Vec<usize>, device: Arc<Device>) -> Self {
        Self {
            id: TensorId::new(0, 0),
            dtype: data.dtype(),
            data,
            strides: row_major_strides(&shape),
            shape,
            parents: Vec::new(),
            device,
            requires_grad: false,
            grad: None,
            state: RealizationState::Realized,
        }
    }

    /// Record for the output of an operation that has not run yet
    pub fn pending(
        dtype: DType,
        shape: Vec<usize>,
        parents: Vec<TensorId>,
        device: Arc<Device>,
        requires_grad: bool,
    ) -> Self {
        Self {
            id: TensorId::new(0, 0),
            data: ByteBuffer::empty(dtype),
            dtype,
            strides: row_major_strides(&shape),
            shape,
            parents,
            device,
            requires_grad,
            grad: None,
            state: RealizationState::Unrealized,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the realized data in bytes
    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.bytes
    }
}

struct Entry {
    record: TensorRecord,
    pins: usize,
    released: bool,
    /// Whether this record currently holds a pin on each parent
    pins_parents: bool,
    /// Devices the record moved off while dependents still read its storage
    stale: Vec<Arc<Device>>,
}

impl Entry {
    fn release_stale(&mut self) {
        for device in self.stale.drain(..) {
            trace!(tensor = %self.record.id, device = device.name(), "releasing stale storage");
            device.backend().release(self.record.id);
        }
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Arena {
    fn entry(&self, id: TensorId) -> Option<&Entry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, id: TensorId) -> Option<&mut Entry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    fn insert(&mut self, mut record: TensorRecord) -> TensorId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = TensorId::new(index, slot.generation);
        record.id = id;
        slot.entry = Some(Entry {
            record,
            pins: 0,
            released: false,
            pins_parents: false,
            stale: Vec::new(),
        });
        self.live += 1;
        id
    }

    /// Drop one pin from each id, erasing released records that reach zero.
    fn unpin_all(&mut self, ids: Vec<TensorId>) {
        let mut work = ids;
        while let Some(id) = work.pop() {
            let Some(entry) = self.entry_mut(id) else {
                continue;
            };
            entry.pins = entry.pins.saturating_sub(1);
            if entry.pins != 0 {
                continue;
            }
            entry.release_stale();
            if entry.released {
                work.extend(self.erase(id));
            }
        }
    }

    /// Remove the record for `id`, returning the parents it held pins on.
    fn erase(&mut self, id: TensorId) -> Vec<TensorId> {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return Vec::new();
        };
        if slot.generation != id.generation {
            return Vec::new();
        }
        let Some(mut entry) = slot.entry.take() else {
            return Vec::new();
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;

        trace!(tensor = %id, device = entry.record.device.name(), "erasing record");
        entry.release_stale();
        entry.record.device.backend().release(id);
        if entry.pins_parents {
            entry.record.parents
        } else {
            Vec::new()
        }
    }
}

/// Exclusive owner of every tensor record in a runtime
#[derive(Default)]
pub struct TensorRegistry {
    arena: Mutex<Arena>,
}

impl TensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take ownership of `record` and assign it a fresh id.
    pub fn register(&self, record: TensorRecord) -> TensorId {
        self.lock().insert(record)
    }

    /// Snapshot of the record for `id`
    pub fn lookup(&self, id: TensorId) -> Result<TensorRecord> {
        self.with_record(id, TensorRecord::clone)
    }

    pub fn with_record<R>(&self, id: TensorId, f: impl FnOnce(&TensorRecord) -> R) -> Result<R> {
        let arena = self.lock();
        let entry = arena.entry(id).ok_or(TensorError::UnknownTensor(id))?;
        Ok(f(&entry.record))
    }

    pub fn with_record_mut<R>(
        &self,
        id: TensorId,
        f: impl FnOnce(&mut TensorRecord) -> R,
    ) -> Result<R> {
        let mut arena = self.lock();
        let entry = arena.entry_mut(id).ok_or(TensorError::UnknownTensor(id))?;
        Ok(f(&mut entry.record))
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.lock().entry(id).is_some()
    }

    pub fn pin(&self, id: TensorId) -> Result<()> {
        let mut arena = self.lock();
        let entry = arena.entry_mut(id).ok_or(TensorError::UnknownTensor(id))?;
        entry.pins += 1;
        Ok(())
    }

    pub fn unpin(&self, id: TensorId) {
        self.lock().unpin_all(vec![id]);
    }

    pub fn pins(&self, id: TensorId) -> usize {
        self.lock().entry(id).map_or(0, |entry| entry.pins)
    }

    /// Pin every parent of `id` until [`TensorRegistry::unpin_parents`].
    pub fn pin_parents(&self, id: TensorId) -> Result<()> {
        let mut arena = self.lock();
        let parents = match arena.entry(id) {
            Some(entry) if !entry.pins_parents => entry.record.parents.clone(),
            Some(_) => return Ok(()),
            None => return Err(TensorError::UnknownTensor(id)),
        };
        if let Some(missing) = parents.iter().find(|p| arena.entry(**p).is_none()) {
            return Err(TensorError::UnknownTensor(*missing));
        }
        for parent in &parents {
            if let Some(entry) = arena.entry_mut(*parent) {
                entry.pins += 1;
            }
        }
        if let Some(entry) = arena.entry_mut(id) {
            entry.pins_parents = true;
        }
        Ok(())
    }

    /// Drop the pins `id` holds on its parents. No-op if it holds none.
    pub fn unpin_parents(&self, id: TensorId) {
        let mut arena = self.lock();
        let parents = match arena.entry_mut(id) {
            Some(entry) if entry.pins_parents => {
                entry.pins_parents = false;
                entry.record.parents.clone()
            }
            _ => return,
        };
        arena.unpin_all(parents);
    }

    /// Point `id` at `target`. Storage on the old device is released now, or
    /// once the last pending dependent reading it drops its pin.
    pub fn move_to(&self, id: TensorId, target: Arc<Device>) -> Result<()> {
        let mut arena = self.lock();
        let entry = arena.entry_mut(id).ok_or(TensorError::UnknownTensor(id))?;
        if entry.record.device.name() == target.name() {
            return Ok(());
        }
        entry.stale.retain(|device| device.name() != target.name());
        let previous = std::mem::replace(&mut entry.record.device, target);
        if entry.pins == 0 {
            previous.backend().release(id);
        } else {
            entry.stale.push(previous);
        }
        Ok(())
    }

    /// Give up ownership of `id`. Erased now, or when its last pin drops.
    pub fn release(&self, id: TensorId) {
        let mut arena = self.lock();
        let Some(entry) = arena.entry_mut(id) else {
            return;
        };
        entry.released = true;
        if entry.pins == 0 {
            let parents = arena.erase(id);
            arena.unpin_all(parents);
        }
    }

    /// Live records, including released ones kept alive by pins
    pub fn len(&self) -> usize {
        self.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Erase every record and its device storage.
    pub fn clear(&self) {
        let mut arena = self.lock();
        for slot in &mut arena.slots {
            if let Some(mut entry) = slot.entry.take() {
                entry.release_stale();
                entry.record.device.backend().release(entry.record.id);
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        arena.free = (0..arena.slots.len() as u32).rev().collect();
        arena.live = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::device::DeviceRegistry;

    fn cpu() -> Arc<Device> {
        DeviceRegistry::new(RuntimeConfig::software())
            .get_or_create("cpu")
            .unwrap()
    }

    fn leaf(device: &Arc<Device>) -> TensorRecord {
        TensorRecord::realized(
            ByteBuffer::from_slice(&[1.0f32, 2.0]),
            vec![2],
            Arc::clone(device),
        )
    }

    #[test]
    fn test_row_major_strides() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(row_major_strides(&[5]), vec![1]);
        assert!(row_major_strides(&[]).is_empty());
    }

    #[test]
    fn test_register_and_lookup() {
        let device = cpu();
        let registry = TensorRegistry::new();
        let id = registry.register(leaf(&device));
        let record = registry.lookup(id).unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.state, RealizationState::Realized);
        assert_eq!(record.dtype, DType::F32);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_id_never_resolves() {
        let device = cpu();
        let registry = TensorRegistry::new();
        let first = registry.register(leaf(&device));
        registry.release(first);
        let second = registry.register(leaf(&device));

        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert_eq!(
            registry.lookup(first).unwrap_err(),
            TensorError::UnknownTensor(first)
        );
        assert!(registry.contains(second));
    }

    #[test]
    fn test_release_deferred_while_pinned() {
        let device = cpu();
        let registry = TensorRegistry::new();
        let parent = registry.register(leaf(&device));
        let child = registry.register(TensorRecord::pending(
            DType::F32,
            vec![2],
            vec![parent],
            Arc::clone(&device),
            false,
        ));
        registry.pin_parents(child).unwrap();
        assert_eq!(registry.pins(parent), 1);

        registry.release(parent);
        assert!(registry.contains(parent));

        registry.unpin_parents(child);
        assert!(!registry.contains(parent));
        // A second call must not unpin again.
        registry.unpin_parents(child);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_release_cascades_to_parents() {
        let device = cpu();
        let registry = TensorRegistry::new();
        let a = registry.register(leaf(&device));
        let b = registry.register(TensorRecord::pending(
            DType::F32,
            vec![2],
            vec![a],
            Arc::clone(&device),
            false,
        ));
        let c = registry.register(TensorRecord::pending(
            DType::F32,
            vec![2],
            vec![b],
            Arc::clone(&device),
            false,
        ));
        registry.pin_parents(b).unwrap();
        registry.pin_parents(c).unwrap();

        registry.release(a);
        registry.release(b);
        assert_eq!(registry.len(), 3);

        registry.release(c);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_move_keeps_old_storage_until_unpinned() {
        let devices = DeviceRegistry::new(RuntimeConfig::software());
        let cpu = devices.get_or_create("cpu").unwrap();
        let gpu = devices.get_or_create("gpu").unwrap();
        let registry = TensorRegistry::new();

        let a = registry.register(leaf(&gpu));
        gpu.backend().assign(a, &[0u8; 8]).unwrap();
        let child = registry.register(TensorRecord::pending(
            DType::F32,
            vec![2],
            vec![a],
            Arc::clone(&gpu),
            false,
        ));
        registry.pin_parents(child).unwrap();

        cpu.backend().assign(a, &[0u8; 8]).unwrap();
        registry.move_to(a, Arc::clone(&cpu)).unwrap();
        assert_eq!(
            registry.with_record(a, |r| r.device.name().to_string()).unwrap(),
            "cpu"
        );
        assert!(gpu.backend().has_buffer(a));

        registry.unpin_parents(child);
        assert!(!gpu.backend().has_buffer(a));
        assert!(cpu.backend().has_buffer(a));
    }

    #[test]
    fn test_erase_releases_stale_storage() {
        let devices = DeviceRegistry::new(RuntimeConfig::software());
        let cpu = devices.get_or_create("cpu").unwrap();
        let gpu = devices.get_or_create("gpu").unwrap();
        let registry = TensorRegistry::new();

        let a = registry.register(leaf(&gpu));
        gpu.backend().assign(a, &[0u8; 8]).unwrap();
        registry.pin(a).unwrap();
        registry.move_to(a, Arc::clone(&cpu)).unwrap();
        assert!(gpu.backend().has_buffer(a));

        registry.clear();
        assert!(!gpu.backend().has_buffer(a));
    }

    #[test]
    fn test_with_record_mut() {
        let device = cpu();
        let registry = TensorRegistry::new();
        let id = registry.register(leaf(&device));
        registry
            .with_record_mut(id, |r| r.state = RealizationState::Failed)
            .unwrap();
        assert_eq!(
            registry.with_record(id, |r| r.state).unwrap(),
            RealizationState::Failed
        );
    }

    #[test]
    fn test_clear() {
        let device = cpu();
        let registry = TensorRegistry::new();
        let id = registry.register(leaf(&device));
        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.contains(id));
        let next = registry.register(leaf(&device));
        assert_ne!(next, id);
    }
}
