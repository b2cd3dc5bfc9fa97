use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Region registry result type
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The guest range overlaps a region that cannot coexist with it. This is a configuration
    /// error and is fatal at startup.
    #[error("region {name} [{start:#x}, {end:#x}) overlaps region {existing} with incompatible mode")]
    DuplicateRegion {
        name: String,
        existing: String,
        start: u64,
        end: u64,
    },

    #[error("region {0} has an invalid size")]
    InvalidSize(String),

    /// No single active region covers the requested range.
    #[error("guest range {address:#x} + {size} is not mapped")]
    Unmapped { address: u64, size: usize },

    /// The region is quarantined pending release and may not be accessed.
    #[error("access to quarantined region {name} at {address:#x}")]
    Quarantined { name: String, address: u64 },

    #[error("unknown region {0}")]
    UnknownRegion(RegionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(usize);

impl RegionId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    Ram,
    Mmio,
    DirtyMask,
}

/// How the bytes of a region relate to execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionMode {
    /// One concrete copy shared by every state. A state that writes to the region is demoted to a
    /// private copy first.
    SharedConcrete,

    /// Every state owns a copy of the region.
    CopyPerState,

    /// Every state owns a copy of the region. Writes are tracked per chunk so that saving the
    /// region on a state switch only copies chunks written since the last switch.
    DirtyTracked,
}

impl RegionMode {
    pub fn is_per_state(&self) -> bool {
        !matches!(self, RegionMode::SharedConcrete)
    }
}

/// Two-phase release of regions. A quarantined region stays allocated but rejects accesses; it is
/// released once it has gone unreferenced for the configured number of epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionLifecycle {
    Active,
    Quarantined { since_epoch: u64 },
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub name: String,
    pub kind: RegionKind,
    pub guest_address: u64,
    pub host_address: u64,
    pub size: usize,
}

impl Region {
    pub fn ram(name: impl Into<String>, guest_address: u64, size: usize) -> Self {
        Self {
            name: name.into(),
            kind: RegionKind::Ram,
            guest_address,
            host_address: 0,
            size,
        }
    }

    pub fn guest_range(&self) -> Range<u64> {
        self.guest_address..self.guest_address + self.size as u64
    }

    fn overlaps(&self, other: &Region) -> bool {
        let a = self.guest_range();
        let b = other.guest_range();
        a.start < b.end && b.start < a.end
    }
}

/// Per-chunk write tracking since the last checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyMask {
    chunk_size: usize,
    bits: Vec<u64>,
    num_chunks: usize,
}

impl DirtyMask {
    pub fn new(size: usize, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "dirty chunk size must be positive");
        let num_chunks = size.div_ceil(chunk_size);
        Self {
            chunk_size,
            bits: vec![0; num_chunks.div_ceil(64)],
            num_chunks,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn mark(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }

        let first = offset / self.chunk_size;
        let last = ((offset + len - 1) / self.chunk_size).min(self.num_chunks.saturating_sub(1));
        for chunk in first..=last {
            self.bits[chunk / 64] |= 1 << (chunk % 64);
        }
    }

    pub fn is_dirty(&self, chunk: usize) -> bool {
        chunk < self.num_chunks && self.bits[chunk / 64] & (1 << (chunk % 64)) != 0
    }

    pub fn dirty_chunks(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_chunks).filter(|&chunk| self.is_dirty(chunk))
    }

    pub fn dirty_count(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|word| *word = 0);
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredRegion {
    id: RegionId,
    region: Region,
    mode: RegionMode,
    save_on_switch: bool,
    lifecycle: RegionLifecycle,
}

impl RegisteredRegion {
    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn mode(&self) -> RegionMode {
        self.mode
    }

    pub fn save_on_switch(&self) -> bool {
        self.save_on_switch
    }

    pub fn lifecycle(&self) -> RegionLifecycle {
        self.lifecycle
    }

    /// True when the current state's concrete bytes live in the host buffer rather than in the
    /// state's own store.
    pub fn is_host_backed(&self) -> bool {
        !self.mode.is_per_state() || self.save_on_switch
    }
}

const CODE_PAGE_BITS: u32 = 12;

/// Generation counters for guest pages that hold translated code.
#[derive(Debug, Clone, Default)]
struct CodePages {
    generations: BTreeMap<u64, u64>,
    counter: u64,
}

impl CodePages {
    fn pages(range: Range<u64>) -> impl Iterator<Item = u64> {
        let first = range.start >> CODE_PAGE_BITS;
        let last = range.end.saturating_sub(1).max(range.start) >> CODE_PAGE_BITS;
        first..=last
    }

    fn track(&mut self, range: Range<u64>) {
        for page in Self::pages(range) {
            self.generations.entry(page).or_insert(0);
        }
    }

    fn generation(&self, range: Range<u64>) -> u64 {
        Self::pages(range)
            .filter_map(|page| self.generations.get(&page))
            .copied()
            .max()
            .unwrap_or(0)
    }

    fn written(&mut self, range: Range<u64>) -> bool {
        let mut bumped = false;
        for page in Self::pages(range) {
            if let Some(generation) = self.generations.get_mut(&page) {
                self.counter += 1;
                *generation = self.counter;
                bumped = true;
            }
        }

        bumped
    }
}

/// Registry of the guest memory regions known to the engine along with the host buffers that
/// back shared regions and the save-on-switch regions of the current state.
#[derive(Debug, Clone)]
pub struct RegionRegistry {
    regions: Vec<RegisteredRegion>,
    by_address: BTreeMap<u64, RegionId>,
    host: Vec<Vec<u8>>,
    dirty: Vec<Option<DirtyMask>>,
    chunk_size: usize,
    code: CodePages,
}

impl RegionRegistry {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            regions: Vec::new(),
            by_address: BTreeMap::new(),
            host: Vec::new(),
            dirty: Vec::new(),
            chunk_size: chunk_size.max(1),
            code: CodePages::default(),
        }
    }

    /// Granularity of dirty tracking and of the copy-on-write chunks in state memory.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Register a region. Registering an identical range with the same mode again returns the
    /// existing identifier; any other overlap fails with [Error::DuplicateRegion].
    pub fn register_region(
        &mut self,
        region: Region,
        mode: RegionMode,
        save_on_switch: bool,
    ) -> Result<RegionId> {
        if region.size == 0 || region.guest_address.checked_add(region.size as u64).is_none() {
            return Err(Error::InvalidSize(region.name));
        }

        for existing in self.regions.iter() {
            if existing.lifecycle == RegionLifecycle::Released || !existing.region.overlaps(&region)
            {
                continue;
            }

            let identical = existing.mode == mode
                && existing.region.guest_address == region.guest_address
                && existing.region.size == region.size;
            if identical {
                debug!(name = %region.name, id = %existing.id, "region already registered");
                return Ok(existing.id);
            }

            let range = region.guest_range();
            return Err(Error::DuplicateRegion {
                name: region.name,
                existing: existing.region.name.clone(),
                start: range.start,
                end: range.end,
            });
        }

        let id = RegionId(self.regions.len());
        info!(
            name = %region.name,
            %id,
            guest = format_args!("{:#x}", region.guest_address),
            size = region.size,
            ?mode,
            save_on_switch,
            "registered region"
        );

        self.by_address.insert(region.guest_address, id);
        self.host.push(vec![0; region.size]);
        self.dirty.push(
            (mode == RegionMode::DirtyTracked).then(|| DirtyMask::new(region.size, self.chunk_size)),
        );
        self.regions.push(RegisteredRegion {
            id,
            region,
            mode,
            save_on_switch,
            lifecycle: RegionLifecycle::Active,
        });

        Ok(id)
    }

    /// Register a concrete buffer shared by all states, such as a device window.
    pub fn register_shared_external(
        &mut self,
        name: impl Into<String>,
        guest_address: u64,
        size: usize,
    ) -> Result<RegionId> {
        let region = Region {
            name: name.into(),
            kind: RegionKind::Mmio,
            guest_address,
            host_address: 0,
            size,
        };
        self.register_region(region, RegionMode::SharedConcrete, false)
    }

    pub fn get(&self, id: RegionId) -> Result<&RegisteredRegion> {
        self.regions.get(id.0).ok_or(Error::UnknownRegion(id))
    }

    pub fn regions(&self) -> impl Iterator<Item = &RegisteredRegion> {
        self.regions.iter()
    }

    /// Regions with an active lifecycle that every state holds a private copy of.
    pub fn per_state_regions(&self) -> impl Iterator<Item = &RegisteredRegion> {
        self.regions
            .iter()
            .filter(|r| r.mode.is_per_state() && r.lifecycle != RegionLifecycle::Released)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&RegisteredRegion> {
        self.regions.iter().find(|r| r.region.name == name)
    }

    /// Locate the region containing the whole guest range. Accesses may not straddle regions.
    pub fn resolve(&self, address: u64, size: usize) -> Result<(RegionId, usize)> {
        let unmapped = Error::Unmapped { address, size };
        let (_, &id) = self
            .by_address
            .range(..=address)
            .next_back()
            .ok_or_else(|| unmapped.clone())?;

        let entry = &self.regions[id.0];
        let end = address.checked_add(size as u64).ok_or_else(|| unmapped.clone())?;
        if end > entry.region.guest_range().end {
            return Err(unmapped);
        }

        match entry.lifecycle {
            RegionLifecycle::Active => Ok((id, (address - entry.region.guest_address) as usize)),
            RegionLifecycle::Quarantined { .. } => Err(Error::Quarantined {
                name: entry.region.name.clone(),
                address,
            }),
            RegionLifecycle::Released => Err(unmapped),
        }
    }

    pub fn host(&self, id: RegionId) -> &[u8] {
        &self.host[id.0]
    }

    /// Write to the host buffer of a region, recording dirty chunks and code modifications.
    pub fn write_host(&mut self, id: RegionId, offset: usize, bytes: &[u8]) {
        self.host[id.0][offset..offset + bytes.len()].copy_from_slice(bytes);
        if let Some(mask) = &mut self.dirty[id.0] {
            mask.mark(offset, bytes.len());
        }

        let base = self.regions[id.0].region.guest_address + offset as u64;
        self.note_write(base..base + bytes.len() as u64);
    }

    pub(crate) fn copy_into_host(&mut self, id: RegionId, offset: usize, bytes: &[u8]) {
        self.host[id.0][offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Load initial contents into a region's host buffer. Intended to be used before the initial
    /// state is created.
    pub fn load(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        let (id, offset) = self.resolve(address, bytes.len())?;
        self.write_host(id, offset, bytes);
        Ok(())
    }

    pub fn dirty_mask(&self, id: RegionId) -> Option<&DirtyMask> {
        self.dirty.get(id.0).and_then(Option::as_ref)
    }

    pub(crate) fn take_dirty_chunks(&mut self, id: RegionId) -> Option<Vec<usize>> {
        let mask = self.dirty.get_mut(id.0)?.as_mut()?;
        let chunks = mask.dirty_chunks().collect();
        mask.clear();
        Some(chunks)
    }

    pub(crate) fn clear_dirty(&mut self, id: RegionId) {
        if let Some(Some(mask)) = self.dirty.get_mut(id.0) {
            mask.clear();
        }
    }

    /// Start tracking code translated from the guest range.
    pub fn track_code(&mut self, range: Range<u64>) {
        self.code.track(range);
    }

    /// Generation of the code in the guest range. Any write to a tracked page moves the
    /// generation forward.
    pub fn code_generation(&self, range: Range<u64>) -> u64 {
        self.code.generation(range)
    }

    pub(crate) fn note_write(&mut self, range: Range<u64>) {
        if self.code.written(range.clone()) {
            debug!(
                start = format_args!("{:#x}", range.start),
                end = format_args!("{:#x}", range.end),
                "write to translated code"
            );
        }
    }

    /// Stop accepting accesses to a region. It is released by [Self::release_unreferenced].
    pub fn quarantine(&mut self, id: RegionId, epoch: u64) -> Result<()> {
        let entry = self.regions.get_mut(id.0).ok_or(Error::UnknownRegion(id))?;
        if entry.lifecycle == RegionLifecycle::Active {
            info!(name = %entry.region.name, %id, epoch, "quarantined region");
            entry.lifecycle = RegionLifecycle::Quarantined { since_epoch: epoch };
        }

        Ok(())
    }

    /// Release quarantined regions that have been quarantined for at least `min_epochs` and are
    /// not in `referenced`. Returns the released regions.
    pub fn release_unreferenced(
        &mut self,
        epoch: u64,
        min_epochs: u64,
        referenced: &BTreeSet<RegionId>,
    ) -> Vec<RegionId> {
        let mut released = Vec::new();
        for entry in self.regions.iter_mut() {
            if let RegionLifecycle::Quarantined { since_epoch } = entry.lifecycle {
                if epoch.saturating_sub(since_epoch) >= min_epochs && !referenced.contains(&entry.id)
                {
                    info!(name = %entry.region.name, id = %entry.id, epoch, "released region");
                    entry.lifecycle = RegionLifecycle::Released;
                    self.host[entry.id.0] = Vec::new();
                    self.dirty[entry.id.0] = None;
                    self.by_address.remove(&entry.region.guest_address);
                    released.push(entry.id);
                }
            }
        }

        released
    }
}
