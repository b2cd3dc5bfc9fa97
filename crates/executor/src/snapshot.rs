use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use symex_expr::Expr;

use crate::interrupt::Interrupt;
use crate::mem::{RegionStore, StateMemory};
use crate::region::RegionRegistry;
use crate::state::{ExecutionState, StateId, StateParts, REGISTER_COUNT};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("state {0} is inside a translation unit")]
    MidUnit(StateId),

    #[error("region {0} is not registered")]
    UnknownRegion(String),

    #[error("snapshot has no copy of region {0}")]
    MissingRegion(String),

    #[error("region {name} has size {expected} but snapshot holds {actual} bytes")]
    RegionSize {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("snapshot holds {0} registers")]
    RegisterCount(usize),

    #[error("failed to encode snapshot: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Contents of one region owned by a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSnapshot {
    pub name: String,
    pub bytes: Vec<u8>,
    pub symbolic: Vec<(usize, Expr)>,
}

/// Everything needed to resume a state on another worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: StateId,
    pub parent: Option<StateId>,
    pub registers: Vec<Expr>,
    pub pc: u64,
    pub path_condition: Vec<Expr>,
    pub regions: Vec<RegionSnapshot>,
    pub depth: u64,
    pub pending_interrupts: Vec<Interrupt>,
    pub seen_events: Vec<u64>,
}

impl StateSnapshot {
    /// Capture the state. The stores of the state must be up to date with the host buffers.
    pub fn capture(state: &ExecutionState, registry: &RegionRegistry) -> Result<Self> {
        if state.is_mid_unit() {
            return Err(Error::MidUnit(state.id()));
        }

        let regions = state
            .memory()
            .stores()
            .map(|(id, store)| {
                let entry = registry
                    .get(id)
                    .map_err(|_| Error::UnknownRegion(id.to_string()))?;
                Ok(RegionSnapshot {
                    name: entry.region().name.clone(),
                    bytes: store.concrete_bytes(),
                    symbolic: store
                        .symbolic()
                        .iter()
                        .map(|(&offset, value)| (offset, value.clone()))
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: state.id(),
            parent: state.parent(),
            registers: state.registers().to_vec(),
            pc: state.pc(),
            path_condition: state.path_condition().to_vec(),
            regions,
            depth: state.depth(),
            pending_interrupts: state.pending_interrupts().cloned().collect(),
            seen_events: state.seen_events.iter().copied().collect(),
        })
    }

    /// Rebuild the state. Regions are matched by name and every per-state region of the registry
    /// must be present.
    pub fn restore(self, registry: &RegionRegistry) -> Result<ExecutionState> {
        if self.registers.len() != REGISTER_COUNT {
            return Err(Error::RegisterCount(self.registers.len()));
        }

        let mut memory = StateMemory::default();
        for snapshot in self.regions {
            let entry = registry
                .find_by_name(&snapshot.name)
                .ok_or_else(|| Error::UnknownRegion(snapshot.name.clone()))?;
            if entry.region().size != snapshot.bytes.len() {
                return Err(Error::RegionSize {
                    name: snapshot.name,
                    expected: entry.region().size,
                    actual: snapshot.bytes.len(),
                });
            }

            let mut store = RegionStore::from_bytes(&snapshot.bytes, registry.chunk_size());
            for (offset, value) in snapshot.symbolic {
                store.set_byte(offset, value);
            }
            memory.insert_store(entry.id(), store);
        }

        if let Some(entry) = registry
            .per_state_regions()
            .find(|entry| memory.store(entry.id()).is_none())
        {
            return Err(Error::MissingRegion(entry.region().name.clone()));
        }

        Ok(ExecutionState::from_parts(StateParts {
            id: self.id,
            parent: self.parent,
            registers: self.registers,
            pc: self.pc,
            memory,
            path_condition: self.path_condition,
            depth: self.depth,
            pending_interrupts: self.pending_interrupts,
            seen_events: self.seen_events.into_iter().collect::<BTreeSet<_>>(),
        }))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
