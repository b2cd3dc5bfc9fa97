use serde::{Deserialize, Serialize};
use symex_expr::Expr;

use crate::mem::{self, MemoryView};
use crate::state::REGISTER_WIDTH;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Memory(#[from] mem::Error),

    #[error("handler for vector {0} is symbolic")]
    SymbolicHandler(u32),

    #[error("stack pointer is symbolic")]
    SymbolicStackPointer,
}

/// An asynchronous event delivered to a state. Events broadcast to every state carry an event
/// identifier so that each state observes the event at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interrupt {
    pub vector: u32,
    pub error_code: Option<u64>,
    pub event: Option<u64>,
}

impl Interrupt {
    pub fn new(vector: u32) -> Self {
        Self {
            vector,
            error_code: None,
            event: None,
        }
    }

    pub fn with_error_code(mut self, error_code: u64) -> Self {
        self.error_code = Some(error_code);
        self
    }

    pub fn with_event(mut self, event: u64) -> Self {
        self.event = Some(event);
        self
    }
}

/// The processor state an interrupt may modify.
pub struct InterruptContext<'a> {
    pub registers: &'a mut [Expr],
    pub pc: &'a mut u64,
    pub memory: MemoryView<'a>,
}

impl InterruptContext<'_> {
    fn concrete_register(&self, index: usize) -> Option<u64> {
        self.registers[index].as_constant()
    }
}

/// Architecture specific semantics of entering an interrupt handler. Interrupts are only ever
/// delivered between translation units.
pub trait InterruptModel {
    fn name(&self) -> &'static str;

    fn deliver(&self, context: &mut InterruptContext<'_>, interrupt: &Interrupt) -> Result<()>;
}

/// Interrupt descriptor table style delivery. The return address and optional error code are
/// pushed on the stack and control transfers to the handler address stored in the table.
#[derive(Debug, Clone)]
pub struct X86InterruptModel {
    pub table_base: u64,
    pub stack_pointer: usize,
}

impl X86InterruptModel {
    const ENTRY_SIZE: u64 = 8;

    pub fn new(table_base: u64) -> Self {
        Self {
            table_base,
            stack_pointer: 4,
        }
    }

    fn push(context: &mut InterruptContext<'_>, stack_pointer: usize, value: u64) -> Result<()> {
        let sp = context
            .concrete_register(stack_pointer)
            .ok_or(Error::SymbolicStackPointer)?
            .wrapping_sub(8);
        context.memory.write(sp, value.into(), 8)?;
        context.registers[stack_pointer] = Expr::constant(sp, REGISTER_WIDTH);
        Ok(())
    }
}

impl InterruptModel for X86InterruptModel {
    fn name(&self) -> &'static str {
        "x86"
    }

    fn deliver(&self, context: &mut InterruptContext<'_>, interrupt: &Interrupt) -> Result<()> {
        let entry = self.table_base + Self::ENTRY_SIZE * u64::from(interrupt.vector);
        let handler = context
            .memory
            .read_u64(entry, Self::ENTRY_SIZE as usize)?
            .ok_or(Error::SymbolicHandler(interrupt.vector))?;

        Self::push(context, self.stack_pointer, *context.pc)?;
        if let Some(error_code) = interrupt.error_code {
            Self::push(context, self.stack_pointer, error_code)?;
        }

        *context.pc = handler;
        Ok(())
    }
}

/// Vector table style delivery. The return address is placed in the link register and control
/// transfers to the handler address stored in the table.
#[derive(Debug, Clone)]
pub struct ArmInterruptModel {
    pub vector_base: u64,
    pub link_register: usize,
}

impl ArmInterruptModel {
    const ENTRY_SIZE: u64 = 4;

    pub fn new(vector_base: u64) -> Self {
        Self {
            vector_base,
            link_register: 14,
        }
    }
}

impl InterruptModel for ArmInterruptModel {
    fn name(&self) -> &'static str {
        "arm"
    }

    fn deliver(&self, context: &mut InterruptContext<'_>, interrupt: &Interrupt) -> Result<()> {
        let entry = self.vector_base + Self::ENTRY_SIZE * u64::from(interrupt.vector);
        let handler = context
            .memory
            .read_u64(entry, Self::ENTRY_SIZE as usize)?
            .ok_or(Error::SymbolicHandler(interrupt.vector))?;

        context.registers[self.link_register] = Expr::constant(*context.pc, REGISTER_WIDTH);
        *context.pc = handler;
        Ok(())
    }
}
