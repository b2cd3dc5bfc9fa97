use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use symex_expr::{BinaryOp, CompareOp, Expr, MAX_WIDTH};
use tracing::{debug, trace};

use crate::mem::StateMemory;
use crate::region::RegionRegistry;
use crate::state::{REGISTER_COUNT, REGISTER_WIDTH};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The translator could not produce a unit for the address.
    #[error("failed to translate code at {pc:#x}: {reason}")]
    Untranslatable { pc: u64, reason: String },

    #[error("translation at {pc:#x} has no operations")]
    EmptyUnit { pc: u64 },

    /// The guest code was modified after the unit was translated. Handled internally by evicting
    /// the unit and translating the code again.
    #[error("stale translation unit at {pc:#x}: generation {cached} != {current}")]
    StaleTranslationUnit { pc: u64, cached: u64, current: u64 },
}

/// Destination of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Reg(usize),
    Temp(u32),
}

/// Source of an operation. All values are 64 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(usize),
    Temp(u32),
    Imm(u64),
}

impl From<Place> for Operand {
    fn from(place: Place) -> Self {
        match place {
            Place::Reg(r) => Operand::Reg(r),
            Place::Temp(t) => Operand::Temp(t),
        }
    }
}

/// Operations of a translation unit as seen by the instrumented path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOp {
    Copy {
        dst: Place,
        src: Operand,
    },
    Binary {
        op: BinaryOp,
        dst: Place,
        lhs: Operand,
        rhs: Operand,
    },

    /// Stores 1 in the destination if the comparison holds and 0 otherwise.
    Compare {
        op: CompareOp,
        dst: Place,
        lhs: Operand,
        rhs: Operand,
    },

    /// Little endian load of `size` bytes, zero extended.
    Load {
        dst: Place,
        address: Operand,
        size: usize,
    },
    Store {
        address: Operand,
        value: Operand,
        size: usize,
    },

    /// Continue at `target` if the condition is nonzero and at the end of the unit otherwise.
    /// Ends the unit.
    Branch {
        condition: Operand,
        target: u64,
    },

    /// Indirect jump. Ends the unit.
    Jump {
        target: Operand,
    },

    Halt,

    /// Replace the destination with a fresh symbolic variable of the given width.
    MakeSymbolic {
        dst: Place,
        name: String,
        width: u32,
    },
}

impl UnitOp {
    fn operands(&self) -> Vec<Operand> {
        match self {
            UnitOp::Copy { dst, src } => vec![(*dst).into(), *src],
            UnitOp::Binary { dst, lhs, rhs, .. } | UnitOp::Compare { dst, lhs, rhs, .. } => {
                vec![(*dst).into(), *lhs, *rhs]
            }
            UnitOp::Load { dst, address, .. } => vec![(*dst).into(), *address],
            UnitOp::Store { address, value, .. } => vec![*address, *value],
            UnitOp::Branch { condition, .. } => vec![*condition],
            UnitOp::Jump { target } => vec![*target],
            UnitOp::Halt => Vec::new(),
            UnitOp::MakeSymbolic { dst, .. } => vec![(*dst).into()],
        }
    }

    /// Reject operations the engine cannot execute.
    fn validate(&self) -> std::result::Result<(), String> {
        for operand in self.operands() {
            if let Operand::Reg(r) = operand {
                if r >= REGISTER_COUNT {
                    return Err(format!("register {r} out of range"));
                }
            }
        }

        match self {
            UnitOp::MakeSymbolic { width, .. } if *width == 0 || *width > MAX_WIDTH => {
                Err(format!("invalid symbolic width {width}"))
            }
            _ => Ok(()),
        }
    }
}

/// Where native code transferred control to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeExit {
    Next(u64),
    Halt,

    /// The unit needs the instrumented path. Nothing executed so far is committed.
    Fallback,
}

/// Concrete processor state handed to native code. Writes are buffered so that nothing is
/// visible until the engine commits them, which allows a unit to abandon the fast path at any
/// point.
pub struct ConcreteCpu<'a> {
    pub registers: [u64; REGISTER_COUNT],
    pub pc: u64,
    registry: &'a RegionRegistry,
    memory: &'a StateMemory,
    writes: BTreeMap<u64, u8>,
}

impl<'a> ConcreteCpu<'a> {
    pub fn new(
        registers: [u64; REGISTER_COUNT],
        pc: u64,
        registry: &'a RegionRegistry,
        memory: &'a StateMemory,
    ) -> Self {
        Self {
            registers,
            pc,
            registry,
            memory,
            writes: BTreeMap::new(),
        }
    }

    fn fast_region(&self, address: u64, size: usize) -> Option<(crate::region::RegionId, usize)> {
        let (id, offset) = self.registry.resolve(address, size).ok()?;
        self.memory.is_fast(id).then_some((id, offset))
    }

    /// Read a little endian value. Returns `None` if the memory is not accessible natively.
    pub fn read(&self, address: u64, size: usize) -> Option<u64> {
        if !(1..=8).contains(&size) {
            return None;
        }

        let (id, offset) = self.fast_region(address, size)?;
        let host = self.registry.host(id);
        let value = (0..size).rev().fold(0u64, |value, i| {
            let byte = self
                .writes
                .get(&(address + i as u64))
                .copied()
                .unwrap_or(host[offset + i]);
            (value << 8) | u64::from(byte)
        });

        Some(value)
    }

    /// Buffer a little endian write. Returns `None` if the memory is not accessible natively.
    pub fn write(&mut self, address: u64, value: u64, size: usize) -> Option<()> {
        if !(1..=8).contains(&size) {
            return None;
        }

        self.fast_region(address, size)?;
        for (i, byte) in value.to_le_bytes().into_iter().take(size).enumerate() {
            self.writes.insert(address + i as u64, byte);
        }

        Some(())
    }

    pub(crate) fn into_writes(self) -> BTreeMap<u64, u8> {
        self.writes
    }
}

/// Directly executable form of a translation unit.
pub trait NativeCode: fmt::Debug {
    fn execute(&self, cpu: &mut ConcreteCpu<'_>) -> NativeExit;
}

/// Native backend that executes the unit's operations over concrete values.
#[derive(Debug, Clone)]
pub struct InterpretedNative {
    ops: Vec<UnitOp>,
    fallthrough: u64,
}

impl InterpretedNative {
    pub fn new(ops: Vec<UnitOp>, fallthrough: u64) -> Self {
        Self { ops, fallthrough }
    }

    fn value(cpu: &ConcreteCpu<'_>, temps: &HashMap<u32, u64>, operand: Operand) -> u64 {
        match operand {
            Operand::Reg(r) => cpu.registers[r],
            Operand::Temp(t) => temps.get(&t).copied().unwrap_or_default(),
            Operand::Imm(value) => value,
        }
    }

    fn assign(cpu: &mut ConcreteCpu<'_>, temps: &mut HashMap<u32, u64>, place: Place, value: u64) {
        match place {
            Place::Reg(r) => cpu.registers[r] = value,
            Place::Temp(t) => {
                temps.insert(t, value);
            }
        }
    }

    fn fold(value: Expr) -> Option<u64> {
        value.as_constant()
    }
}

impl NativeCode for InterpretedNative {
    fn execute(&self, cpu: &mut ConcreteCpu<'_>) -> NativeExit {
        let mut temps = HashMap::new();
        let constant = |value| Expr::constant(value, REGISTER_WIDTH);
        for op in self.ops.iter() {
            match op {
                UnitOp::Copy { dst, src } => {
                    let value = Self::value(cpu, &temps, *src);
                    Self::assign(cpu, &mut temps, *dst, value);
                }
                UnitOp::Binary { op, dst, lhs, rhs } => {
                    let lhs = constant(Self::value(cpu, &temps, *lhs));
                    let rhs = constant(Self::value(cpu, &temps, *rhs));
                    let Some(value) = Self::fold(Expr::binary(*op, lhs, rhs)) else {
                        return NativeExit::Fallback;
                    };
                    Self::assign(cpu, &mut temps, *dst, value);
                }
                UnitOp::Compare { op, dst, lhs, rhs } => {
                    let lhs = constant(Self::value(cpu, &temps, *lhs));
                    let rhs = constant(Self::value(cpu, &temps, *rhs));
                    let Some(value) = Self::fold(Expr::compare(*op, lhs, rhs)) else {
                        return NativeExit::Fallback;
                    };
                    Self::assign(cpu, &mut temps, *dst, value);
                }
                UnitOp::Load { dst, address, size } => {
                    let address = Self::value(cpu, &temps, *address);
                    let Some(value) = cpu.read(address, *size) else {
                        return NativeExit::Fallback;
                    };
                    Self::assign(cpu, &mut temps, *dst, value);
                }
                UnitOp::Store {
                    address,
                    value,
                    size,
                } => {
                    let address = Self::value(cpu, &temps, *address);
                    let value = Self::value(cpu, &temps, *value);
                    if cpu.write(address, value, *size).is_none() {
                        return NativeExit::Fallback;
                    }
                }
                UnitOp::Branch { condition, target } => {
                    return if Self::value(cpu, &temps, *condition) != 0 {
                        NativeExit::Next(*target)
                    } else {
                        NativeExit::Next(self.fallthrough)
                    };
                }
                UnitOp::Jump { target } => {
                    return NativeExit::Next(Self::value(cpu, &temps, *target));
                }
                UnitOp::Halt => return NativeExit::Halt,
                UnitOp::MakeSymbolic { .. } => return NativeExit::Fallback,
            }
        }

        NativeExit::Next(self.fallthrough)
    }
}

/// Output of the translator for one guest code range.
#[derive(Debug, Clone)]
pub struct Translation {
    pub size: u64,
    pub ops: Vec<UnitOp>,
    pub native: Option<Arc<dyn NativeCode>>,
}

impl Translation {
    /// A translation with an [InterpretedNative] entry for the fast path.
    pub fn interpreted(pc: u64, size: u64, ops: Vec<UnitOp>) -> Self {
        let native = InterpretedNative::new(ops.clone(), pc.wrapping_add(size));
        Self {
            size,
            ops,
            native: Some(Arc::new(native)),
        }
    }

    /// A translation that can only run on the instrumented path.
    pub fn instrumented_only(size: u64, ops: Vec<UnitOp>) -> Self {
        Self {
            size,
            ops,
            native: None,
        }
    }
}

/// The translator collaborator. Turns guest code at a program counter into a [Translation].
pub trait Translator {
    fn translate(&mut self, pc: u64) -> Result<Translation>;
}

/// A translated unit of guest code.
#[derive(Debug)]
pub struct TranslationUnit {
    pub pc: u64,
    pub size: u64,
    pub ops: Vec<UnitOp>,
    pub native: Option<Arc<dyn NativeCode>>,

    /// Generation of the guest code this unit was translated from.
    pub generation: u64,
}

impl TranslationUnit {
    pub fn guest_range(&self) -> Range<u64> {
        self.pc..self.pc + self.size
    }

    pub fn fallthrough(&self) -> u64 {
        self.pc + self.size
    }
}

#[derive(Debug)]
struct CachedUnit {
    unit: Arc<TranslationUnit>,
    exec_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslationStats {
    pub hits: u64,
    pub translations: u64,
    pub evictions: u64,
}

/// Engine side cache of translated units. Owns unit lifetime independently of the translator
/// and attaches the per-engine metadata of each unit.
#[derive(Debug, Default)]
pub struct TranslationCache {
    units: HashMap<u64, CachedUnit>,
    instrumented: BTreeSet<u64>,
    executions: BTreeMap<u64, u64>,
    stats: TranslationStats,
}

impl TranslationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the unit at `pc` without translating. Fails with
    /// [Error::StaleTranslationUnit] when the guest code changed since translation.
    pub fn lookup(&self, pc: u64, registry: &RegionRegistry) -> Option<Result<Arc<TranslationUnit>>> {
        let cached = self.units.get(&pc)?;
        let current = registry.code_generation(cached.unit.guest_range());
        if current != cached.unit.generation {
            return Some(Err(Error::StaleTranslationUnit {
                pc,
                cached: cached.unit.generation,
                current,
            }));
        }

        Some(Ok(cached.unit.clone()))
    }

    /// Get the unit at `pc`, translating it if it is not cached or stale.
    pub fn get_or_translate(
        &mut self,
        pc: u64,
        translator: &mut dyn Translator,
        registry: &mut RegionRegistry,
    ) -> Result<Arc<TranslationUnit>> {
        match self.lookup(pc, registry) {
            Some(Ok(unit)) => {
                self.stats.hits += 1;
                return Ok(unit);
            }
            Some(Err(err @ Error::StaleTranslationUnit { .. })) => {
                debug!(%err, "evicting translation unit");
                self.evict(pc);
            }
            Some(Err(err)) => return Err(err),
            None => (),
        }

        let translation = translator.translate(pc)?;
        if translation.ops.is_empty() {
            return Err(Error::EmptyUnit { pc });
        }

        let untranslatable = |reason: String| Error::Untranslatable { pc, reason };
        let end = pc
            .checked_add(translation.size.max(1))
            .ok_or_else(|| untranslatable(format!("size {:#x} overflows", translation.size)))?;
        for op in translation.ops.iter() {
            op.validate().map_err(untranslatable)?;
        }

        let range = pc..end;
        registry.track_code(range.clone());
        let unit = Arc::new(TranslationUnit {
            pc,
            size: translation.size,
            ops: translation.ops,
            native: translation.native,
            generation: registry.code_generation(range),
        });

        trace!(pc = format_args!("{pc:#x}"), generation = unit.generation, "translated unit");
        self.stats.translations += 1;
        self.units.insert(
            pc,
            CachedUnit {
                unit: unit.clone(),
                exec_count: 0,
            },
        );

        Ok(unit)
    }

    /// True if the unit at `pc` is still current with respect to the guest code.
    pub fn is_current(&self, unit: &TranslationUnit, registry: &RegionRegistry) -> bool {
        registry.code_generation(unit.guest_range()) == unit.generation
    }

    pub fn evict(&mut self, pc: u64) -> bool {
        let evicted = self.units.remove(&pc).is_some();
        if evicted {
            self.stats.evictions += 1;
        }

        evicted
    }

    /// Evict every unit overlapping the guest range.
    pub fn invalidate_range(&mut self, range: Range<u64>) -> usize {
        let stale = self
            .units
            .values()
            .filter(|cached| {
                let unit = cached.unit.guest_range();
                unit.start < range.end && range.start < unit.end
            })
            .map(|cached| cached.unit.pc)
            .collect::<Vec<_>>();

        stale.iter().filter(|&&pc| self.evict(pc)).count()
    }

    pub fn flush(&mut self) {
        self.stats.evictions += self.units.len() as u64;
        self.units.clear();
    }

    /// Force the unit at `pc` through the instrumented path.
    pub fn set_instrumented(&mut self, pc: u64, instrumented: bool) {
        if instrumented {
            self.instrumented.insert(pc);
        } else {
            self.instrumented.remove(&pc);
        }
    }

    pub fn is_instrumented(&self, pc: u64) -> bool {
        self.instrumented.contains(&pc)
    }

    pub fn record_execution(&mut self, pc: u64) {
        if let Some(cached) = self.units.get_mut(&pc) {
            cached.exec_count += 1;
        }

        *self.executions.entry(pc).or_default() += 1;
    }

    /// Number of times code at `pc` was executed, across translations.
    pub fn execution_count(&self, pc: u64) -> u64 {
        self.executions.get(&pc).copied().unwrap_or_default()
    }

    /// Number of times the currently cached unit at `pc` was executed.
    pub fn unit_execution_count(&self, pc: u64) -> Option<u64> {
        self.units.get(&pc).map(|cached| cached.exec_count)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn stats(&self) -> TranslationStats {
        self.stats
    }
}
