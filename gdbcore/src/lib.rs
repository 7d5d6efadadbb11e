/// Debugger-control core
///
/// Drives GDB through its machine interface over a pseudo-terminal and turns
/// the text protocol into typed operations: process lifecycle, breakpoints and
/// watchpoints, memory access, pointer chains, instruction tracing and
/// cross-reference indexing.

use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub mod breakpoints;
pub mod companion;
pub mod config;
pub mod dissect;
pub mod engine;
pub mod events;
pub mod inspect;
pub mod memory;
mod observer;
pub mod parser;
pub mod procfs;
pub mod session;
pub mod tracer;
pub mod transport;
pub mod types;

pub use breakpoints::{
    Breakpoint, BreakpointKind, BreakpointModification, BreakpointTrack, ChainedWatchpointGroup,
    Disposition, HitAction, OnHit, WatchpointHit, WatchpointTrack, WatchpointType, HARDWARE_SLOTS,
};
pub use config::CoreConfig;
pub use dissect::{
    CapstoneDisassembler, Disassembler, DissectStatus, Instruction, ReferencedString, XrefIndex,
};
pub use engine::{CancelSignal, Response};
pub use inspect::{FunctionSymbol, InstructionLocation, StackEntry, StackTraceEntry};
pub use memory::{
    Endianness, MemoryValue, PointerBase, PointerChainRequest, PointerChainResult, ValueIndex,
    ValueRepr, ValueType,
};
pub use parser::{mi_quote, parse_gdb_output};
pub use procfs::{MemoryRegion, RegionAttribute};
pub use session::{DebugSession, DisassembledInstruction, SignalHandling};
pub use tracer::{StepMode, TraceHandle, TraceNode, TraceOptions, TraceStatus, TraceTree};
pub use types::*;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Debugger is not initialized")]
    NotInitialized,
    #[error("No process is attached")]
    NoProcess,
    #[error("A trace session is already active")]
    TraceActive,
    #[error("A dissection scan is already running")]
    DissectActive,
    #[error("Debugger process terminated")]
    ProcessTerminated,
    #[error("GDB command failed: {0}")]
    CommandError(String),
    #[error(transparent)]
    Transport(#[from] transport::TransportError),
    #[error(transparent)]
    Companion(#[from] companion::CompanionError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<engine::EngineError> for CoreError {
    fn from(e: engine::EngineError) -> Self {
        match e {
            engine::EngineError::NotInitialized => CoreError::NotInitialized,
            engine::EngineError::ProcessTerminated => CoreError::ProcessTerminated,
            engine::EngineError::WriteError(e) => CoreError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Lock a std mutex; a panic elsewhere does not invalidate the guarded state
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
