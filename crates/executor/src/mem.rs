use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use symex_expr::Expr;
use tracing::debug;

use crate::region::{self, RegionId, RegionMode, RegionRegistry};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Region(#[from] region::Error),

    #[error("access size {0} is not between 1 and 8 bytes")]
    InvalidAccessSize(usize),

    #[error("state has no copy of {0}")]
    MissingStore(RegionId),
}

/// Bytes of one region owned by a state. Concrete bytes are held in reference counted chunks
/// that are copied on the first write after a fork, so siblings never observe each other's
/// writes. Symbolic bytes are held in an overlay that takes precedence over the concrete bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionStore {
    chunk_size: usize,
    size: usize,
    chunks: Vec<Arc<Vec<u8>>>,
    symbolic: BTreeMap<usize, Expr>,
}

impl RegionStore {
    pub fn from_bytes(bytes: &[u8], chunk_size: usize) -> Self {
        Self {
            chunk_size,
            size: bytes.len(),
            chunks: bytes
                .chunks(chunk_size)
                .map(|chunk| Arc::new(chunk.to_vec()))
                .collect(),
            symbolic: BTreeMap::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn concrete_byte(&self, offset: usize) -> u8 {
        self.chunks[offset / self.chunk_size][offset % self.chunk_size]
    }

    pub fn set_concrete_byte(&mut self, offset: usize, value: u8) {
        Arc::make_mut(&mut self.chunks[offset / self.chunk_size])[offset % self.chunk_size] = value;
    }

    pub fn concrete_bytes(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|chunk| chunk.iter().copied()).collect()
    }

    pub fn symbolic(&self) -> &BTreeMap<usize, Expr> {
        &self.symbolic
    }

    pub fn has_symbolic(&self) -> bool {
        !self.symbolic.is_empty()
    }

    /// Read the byte, preferring a symbolic value if one was written.
    pub fn byte(&self, offset: usize) -> Expr {
        self.symbolic
            .get(&offset)
            .cloned()
            .unwrap_or_else(|| Expr::from(self.concrete_byte(offset)))
    }

    pub fn set_byte(&mut self, offset: usize, value: Expr) {
        match u8::try_from(&value) {
            Ok(byte) => {
                self.symbolic.remove(&offset);
                self.set_concrete_byte(offset, byte);
            }
            Err(_) => {
                self.symbolic.insert(offset, value);
            }
        }
    }

    pub(crate) fn set_symbolic(&mut self, offset: usize, value: Expr) {
        self.symbolic.insert(offset, value);
    }

    pub(crate) fn clear_symbolic(&mut self, offset: usize) {
        self.symbolic.remove(&offset);
    }

    pub(crate) fn chunk(&self, index: usize) -> &[u8] {
        &self.chunks[index]
    }

    pub(crate) fn replace_chunk(&mut self, index: usize, bytes: &[u8]) {
        if self.chunks[index].as_slice() != bytes {
            self.chunks[index] = Arc::new(bytes.to_vec());
        }
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks whose backing bytes are shared with `other`.
    pub fn shared_chunks(&self, other: &RegionStore) -> usize {
        self.chunks
            .iter()
            .zip(other.chunks.iter())
            .filter(|(a, b)| Arc::ptr_eq(a, b))
            .count()
    }

    pub(crate) fn map_symbolic(&mut self, f: impl Fn(&Expr) -> Expr) {
        let symbolic = std::mem::take(&mut self.symbolic);
        for (offset, value) in symbolic {
            self.set_byte(offset, f(&value));
        }
    }
}

/// The memory of a single state: private copies of per-state regions, private copies of shared
/// regions the state has written to, and the set of regions that may currently be accessed by
/// native code without symbolic checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateMemory {
    stores: BTreeMap<RegionId, RegionStore>,
    fast_path: BTreeSet<RegionId>,
}

impl StateMemory {
    pub fn store(&self, id: RegionId) -> Option<&RegionStore> {
        self.stores.get(&id)
    }

    pub fn store_mut(&mut self, id: RegionId) -> Option<&mut RegionStore> {
        self.stores.get_mut(&id)
    }

    pub fn stores(&self) -> impl Iterator<Item = (RegionId, &RegionStore)> {
        self.stores.iter().map(|(&id, store)| (id, store))
    }

    pub(crate) fn stores_mut(&mut self) -> impl Iterator<Item = (RegionId, &mut RegionStore)> {
        self.stores.iter_mut().map(|(&id, store)| (id, store))
    }

    pub fn insert_store(&mut self, id: RegionId, store: RegionStore) {
        self.fast_path.remove(&id);
        self.stores.insert(id, store);
    }

    pub fn remove_store(&mut self, id: RegionId) -> Option<RegionStore> {
        self.fast_path.remove(&id);
        self.stores.remove(&id)
    }

    pub fn region_ids(&self) -> BTreeSet<RegionId> {
        self.stores.keys().copied().collect()
    }

    pub fn is_fast(&self, id: RegionId) -> bool {
        self.fast_path.contains(&id)
    }

    pub fn fast_path(&self) -> &BTreeSet<RegionId> {
        &self.fast_path
    }

    pub(crate) fn invalidate_fast_path(&mut self, id: RegionId) {
        self.fast_path.remove(&id);
    }

    pub fn has_symbolic(&self) -> bool {
        self.stores.values().any(RegionStore::has_symbolic)
    }
}

impl RegionRegistry {
    /// Recompute the regions native code may access directly for this state. The result is only a
    /// performance hint; regions outside of the set are handled by the instrumented path.
    pub fn update_fast_path(&self, memory: &mut StateMemory) {
        let fast_path = self
            .regions()
            .filter(|entry| {
                entry.lifecycle() == region::RegionLifecycle::Active
                    && entry.region().kind != region::RegionKind::Mmio
                    && entry.is_host_backed()
            })
            .filter(|entry| match memory.stores.get(&entry.id()) {
                // Shared regions that have been demoted are served from the state's copy
                None => entry.mode() == RegionMode::SharedConcrete,
                Some(store) => entry.mode().is_per_state() && !store.has_symbolic(),
            })
            .map(|entry| entry.id())
            .collect();
        memory.fast_path = fast_path;
    }

    /// Create the initial copies of every per-state region from the host buffers.
    pub fn initial_memory(&self) -> StateMemory {
        let mut memory = StateMemory::default();
        for entry in self.per_state_regions() {
            memory.insert_store(
                entry.id(),
                RegionStore::from_bytes(self.host(entry.id()), self.chunk_size()),
            );
        }

        self.update_fast_path(&mut memory);
        memory
    }

    /// Save the concrete bytes of the current state held in host buffers into the state's
    /// stores. Dirty tracked regions only copy chunks written since the last copy.
    pub fn copy_out(&mut self, memory: &mut StateMemory) {
        let ids = self
            .per_state_regions()
            .filter(|entry| entry.save_on_switch())
            .map(|entry| (entry.id(), entry.mode()))
            .collect::<Vec<_>>();

        for (id, mode) in ids {
            let Some(store) = memory.stores.get_mut(&id) else {
                continue;
            };

            let chunk_size = store.chunk_size();
            let chunks = match mode {
                RegionMode::DirtyTracked => self.take_dirty_chunks(id).unwrap_or_default(),
                _ => (0..store.chunk_count()).collect(),
            };

            let host = self.host(id);
            for chunk in chunks {
                let start = chunk * chunk_size;
                let end = (start + chunk_size).min(host.len());
                store.replace_chunk(chunk, &host[start..end]);
            }
        }
    }

    /// Load the concrete bytes of the incoming state into the host buffers.
    pub fn copy_in(&mut self, memory: &mut StateMemory) {
        let ids = self
            .per_state_regions()
            .filter(|entry| entry.save_on_switch())
            .map(|entry| (entry.id(), entry.region().guest_address))
            .collect::<Vec<_>>();

        for (id, guest_address) in ids {
            let Some(store) = memory.stores.get(&id) else {
                continue;
            };

            for chunk in 0..store.chunk_count() {
                let bytes = store.chunk(chunk);
                let offset = chunk * store.chunk_size();
                if self.host(id)[offset..offset + bytes.len()] != *bytes {
                    // Translated code from the previous state may no longer match
                    let start = guest_address + offset as u64;
                    self.note_write(start..start + bytes.len() as u64);
                    self.copy_into_host(id, offset, bytes);
                }
            }

            self.clear_dirty(id);
        }

        self.update_fast_path(memory);
    }
}

/// Memory of a state combining the registry and the state's stores. For the current state, host
/// buffers hold the concrete bytes of save-on-switch regions; for any other state every per-state
/// byte lives in the state's stores.
pub struct MemoryView<'a> {
    registry: &'a mut RegionRegistry,
    memory: &'a mut StateMemory,
    current: bool,
}

impl<'a> MemoryView<'a> {
    /// View of the state whose bytes are loaded into the host buffers.
    pub fn current(registry: &'a mut RegionRegistry, memory: &'a mut StateMemory) -> Self {
        Self {
            registry,
            memory,
            current: true,
        }
    }

    /// View of a state that is not current.
    pub fn stored(registry: &'a mut RegionRegistry, memory: &'a mut StateMemory) -> Self {
        Self {
            registry,
            memory,
            current: false,
        }
    }

    pub fn registry(&self) -> &RegionRegistry {
        self.registry
    }

    fn host_backed(&self, entry: &region::RegisteredRegion) -> bool {
        self.current && entry.is_host_backed() && entry.mode().is_per_state()
    }

    pub fn read_byte(&self, address: u64) -> Result<Expr> {
        let (id, offset) = self.registry.resolve(address, 1)?;
        let entry = self.registry.get(id)?;
        match self.memory.stores.get(&id) {
            Some(store) if self.host_backed(entry) => Ok(store
                .symbolic()
                .get(&offset)
                .cloned()
                .unwrap_or_else(|| Expr::from(self.registry.host(id)[offset]))),
            Some(store) => Ok(store.byte(offset)),
            None if entry.mode().is_per_state() => Err(Error::MissingStore(id)),
            None => Ok(Expr::from(self.registry.host(id)[offset])),
        }
    }

    pub fn write_byte(&mut self, address: u64, value: Expr) -> Result<()> {
        let (id, offset) = self.registry.resolve(address, 1)?;
        let entry = self.registry.get(id)?;
        let host_backed = self.host_backed(entry);
        let per_state = entry.mode().is_per_state();

        if !self.memory.stores.contains_key(&id) {
            if per_state {
                return Err(Error::MissingStore(id));
            }

            debug!(region = %entry.region().name, "demoting shared region to a private copy");
            let store = RegionStore::from_bytes(self.registry.host(id), self.registry.chunk_size());
            self.memory.insert_store(id, store);
        }

        let store = self
            .memory
            .stores
            .get_mut(&id)
            .ok_or(Error::MissingStore(id))?;

        match (host_backed, u8::try_from(&value)) {
            (true, Ok(byte)) => {
                store.clear_symbolic(offset);
                self.registry.write_host(id, offset, &[byte]);
            }
            (true, Err(_)) => {
                store.set_symbolic(offset, value);
                self.memory.invalidate_fast_path(id);
                self.registry.note_write(address..address + 1);
            }
            (false, _) => {
                let symbolic = value.is_symbolic();
                store.set_byte(offset, value);
                if symbolic {
                    self.memory.invalidate_fast_path(id);
                }
                self.registry.note_write(address..address + 1);
            }
        }

        Ok(())
    }

    /// Read a little endian value of `size` bytes.
    pub fn read(&self, address: u64, size: usize) -> Result<Expr> {
        if !(1..=8).contains(&size) {
            return Err(Error::InvalidAccessSize(size));
        }

        self.registry.resolve(address, size)?;
        let mut value = self.read_byte(address)?;
        for i in 1..size {
            value = Expr::concat(self.read_byte(address + i as u64)?, value);
        }

        Ok(value)
    }

    /// Write the low `size` bytes of the value in little endian order.
    pub fn write(&mut self, address: u64, value: Expr, size: usize) -> Result<()> {
        if !(1..=8).contains(&size) {
            return Err(Error::InvalidAccessSize(size));
        }

        self.registry.resolve(address, size)?;
        let value = value.resize(8 * size as u32);
        for i in 0..size {
            self.write_byte(address + i as u64, value.clone().extract(8 * i as u32, 8))?;
        }

        Ok(())
    }

    pub fn read_u64(&self, address: u64, size: usize) -> Result<Option<u64>> {
        Ok(self.read(address, size)?.as_constant())
    }
}
