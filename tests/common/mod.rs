#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Once;

use symex_executor::config::EngineConfig;
use symex_executor::interrupt::X86InterruptModel;
use symex_executor::region::{Region, RegionMode};
use symex_executor::solver::EnumeratingSolver;
use symex_executor::translation::{self, Operand, Place, Translation, Translator, UnitOp};
use symex_executor::EngineContext;
use symex_expr::BinaryOp;
use tracing_subscriber::EnvFilter;

pub const RAM_BASE: u64 = 0x1000;
pub const RAM_SIZE: usize = 0x1000;
pub const IDT_BASE: u64 = 0x1000;
pub const STACK_TOP: u64 = 0x1f00;
pub const STACK_POINTER: usize = 4;

/// Install a subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Guest program made of hand written translation units.
#[derive(Debug, Clone, Default)]
pub struct Program {
    units: BTreeMap<u64, Translation>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(mut self, pc: u64, ops: Vec<UnitOp>) -> Self {
        self.units.insert(pc, Translation::interpreted(pc, 4, ops));
        self
    }

    /// A chain of `levels` decisions on fresh symbolic bits. Taking the branch at level `n` adds
    /// `1 << n` to register 1. Every path halts at the returned address.
    pub fn decision_tree(mut self, base: u64, levels: u32) -> (Self, u64) {
        for level in 0..levels {
            let pc = base + 0x100 * u64::from(level);
            let next = pc + 0x100;
            self = self
                .unit(
                    pc,
                    vec![make_symbolic(0, &format!("bit{level}"), 1), branch(reg(0), pc + 0x10)],
                )
                .unit(pc + 4, vec![jump(imm(next))])
                .unit(pc + 0x10, vec![add(1, reg(1), imm(1 << level)), jump(imm(next))]);
        }

        let end = base + 0x100 * u64::from(levels);
        (self.unit(end, vec![UnitOp::Halt]), end)
    }
}

impl Translator for Program {
    fn translate(&mut self, pc: u64) -> translation::Result<Translation> {
        self.units
            .get(&pc)
            .cloned()
            .ok_or_else(|| translation::Error::Untranslatable {
                pc,
                reason: "no code".into(),
            })
    }
}

pub fn engine(config: EngineConfig, program: Program) -> EngineContext {
    init_tracing();
    let mut engine = EngineContext::new(
        config,
        program,
        EnumeratingSolver::default(),
        X86InterruptModel::new(IDT_BASE),
    )
    .expect("valid configuration");

    engine
        .register_region(
            Region::ram("ram", RAM_BASE, RAM_SIZE),
            RegionMode::DirtyTracked,
            true,
        )
        .expect("failed to register ram");
    engine
}

pub fn imm(value: u64) -> Operand {
    Operand::Imm(value)
}

pub fn reg(index: usize) -> Operand {
    Operand::Reg(index)
}

pub fn copy(dst: usize, src: Operand) -> UnitOp {
    UnitOp::Copy {
        dst: Place::Reg(dst),
        src,
    }
}

pub fn add(dst: usize, lhs: Operand, rhs: Operand) -> UnitOp {
    UnitOp::Binary {
        op: BinaryOp::Add,
        dst: Place::Reg(dst),
        lhs,
        rhs,
    }
}

pub fn load(dst: usize, address: Operand, size: usize) -> UnitOp {
    UnitOp::Load {
        dst: Place::Reg(dst),
        address,
        size,
    }
}

pub fn branch(condition: Operand, target: u64) -> UnitOp {
    UnitOp::Branch { condition, target }
}

pub fn jump(target: Operand) -> UnitOp {
    UnitOp::Jump { target }
}

pub fn make_symbolic(dst: usize, name: &str, width: u32) -> UnitOp {
    UnitOp::MakeSymbolic {
        dst: Place::Reg(dst),
        name: name.into(),
        width,
    }
}
