use std::fmt;

use serde::{Deserialize, Serialize};

use crate::expr::{Expr, Width};

/// Bits reserved for the per-namespace sequence number of a variable identifier.
const SEQUENCE_BITS: u32 = 40;

/// Identifier for a symbolic variable. Two variables with the same identifier are equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableId(u64);

impl VariableId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    /// The namespace the variable was allocated in. See [VariableAllocator::new].
    pub const fn namespace(&self) -> u64 {
        self.0 >> SEQUENCE_BITS
    }
}

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{ns}_{seq}",
            ns = self.namespace(),
            seq = self.0 & ((1 << SEQUENCE_BITS) - 1)
        )
    }
}

/// Allocates fresh symbolic variables. Allocators constructed with distinct namespaces never
/// produce the same identifier, which allows expressions to move between allocators (for example
/// between cooperating workers) without variables being conflated.
#[derive(Debug, Clone)]
pub struct VariableAllocator {
    namespace: u64,
    next: u64,
    names: Vec<(VariableId, String)>,
}

impl VariableAllocator {
    pub fn new(namespace: u16) -> Self {
        Self {
            namespace: u64::from(namespace) << SEQUENCE_BITS,
            next: 0,
            names: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> VariableId {
        let id = VariableId(self.namespace | self.next);
        self.next += 1;
        id
    }

    /// Create a fresh variable expression with the given width. The name is kept for diagnostics
    /// only.
    pub fn fresh(&mut self, name: impl Into<String>, width: Width) -> Expr {
        let id = self.allocate();
        self.names.push((id, name.into()));
        Expr::variable(id, width)
    }

    pub fn name(&self, id: VariableId) -> Option<&str> {
        self.names
            .iter()
            .find(|(var, _)| *var == id)
            .map(|(_, name)| name.as_str())
    }

    pub fn allocated(&self) -> u64 {
        self.next
    }
}

impl Default for VariableAllocator {
    fn default() -> Self {
        Self::new(0)
    }
}
