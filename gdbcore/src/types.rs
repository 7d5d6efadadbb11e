/// GDB/MI record types and session-level enums
///
/// Records are what the parser produces from a single line of debugger output.
/// The session enums describe the state the observer maintains for the inferior.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// One classified line of debugger output
#[derive(Debug, Clone, PartialEq)]
pub enum GdbOutput {
    Result(GdbResult),
    Async(AsyncRecord),
    Stream(StreamRecord),
    /// The idle prompt `(gdb)`
    Prompt,
}

/// A `^class` result record, optionally prefixed by the command token
#[derive(Debug, Clone, PartialEq)]
pub struct GdbResult {
    pub token: Option<u32>,
    pub class: ResultClass,
    pub results: HashMap<String, Value>,
}

impl GdbResult {
    /// `msg` field of an `^error` record
    pub fn error_message(&self) -> Option<&str> {
        if self.class != ResultClass::Error {
            return None;
        }
        self.results.get("msg").and_then(|v| v.as_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

/// Which sigil introduced an async record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    /// `*` execution state changes
    Exec,
    /// `+` progress output
    Status,
    /// `=` notifications
    Notify,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsyncRecord {
    pub token: Option<u32>,
    pub kind: AsyncKind,
    pub class: AsyncClass,
    pub results: HashMap<String, Value>,
}

impl AsyncRecord {
    /// `reason` of a `*stopped` record
    pub fn stop_reason(&self) -> Option<ExecStopReason> {
        self.results
            .get("reason")
            .and_then(|v| v.as_string())
            .and_then(|s| s.parse().ok())
    }

    /// Breakpoint number reported by a `*stopped` record, watchpoints included
    pub fn breakpoint_number(&self) -> Option<&str> {
        if let Some(number) = self.results.get("bkptno").and_then(|v| v.as_string()) {
            return Some(number);
        }
        ["wpt", "hw-rwpt", "hw-awpt"]
            .iter()
            .find_map(|key| self.results.get(*key)?.field("number"))
    }

    /// Whether this record ends the inferior's life
    pub fn is_exit(&self) -> bool {
        self.class == AsyncClass::Stopped
            && matches!(
                self.stop_reason(),
                Some(ExecStopReason::Exited)
                    | Some(ExecStopReason::ExitedNormally)
                    | Some(ExecStopReason::ExitedSignalled)
            )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AsyncClass {
    Running,
    Stopped,
    ThreadGroupAdded,
    ThreadGroupStarted,
    ThreadGroupExited,
    ThreadCreated,
    ThreadExited,
    ThreadSelected,
    LibraryLoaded,
    LibraryUnloaded,
    BreakpointCreated,
    BreakpointModified,
    BreakpointDeleted,
    CmdParamChanged,
    MemoryChanged,
    /// Anything this crate does not act on
    Other(String),
}

impl AsyncClass {
    pub(crate) fn from_name(name: &str) -> Self {
        match name {
            "running" => AsyncClass::Running,
            "stopped" => AsyncClass::Stopped,
            "thread-group-added" => AsyncClass::ThreadGroupAdded,
            "thread-group-started" => AsyncClass::ThreadGroupStarted,
            "thread-group-exited" => AsyncClass::ThreadGroupExited,
            "thread-created" => AsyncClass::ThreadCreated,
            "thread-exited" => AsyncClass::ThreadExited,
            "thread-selected" => AsyncClass::ThreadSelected,
            "library-loaded" => AsyncClass::LibraryLoaded,
            "library-unloaded" => AsyncClass::LibraryUnloaded,
            "breakpoint-created" => AsyncClass::BreakpointCreated,
            "breakpoint-modified" => AsyncClass::BreakpointModified,
            "breakpoint-deleted" => AsyncClass::BreakpointDeleted,
            "cmd-param-changed" => AsyncClass::CmdParamChanged,
            "memory-changed" => AsyncClass::MemoryChanged,
            other => AsyncClass::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub stream_type: StreamType,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Console, // ~ prefix
    Target,  // @ prefix
    Log,     // & prefix
}

/// Values in GDB/MI output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    List(Vec<Value>),
    Tuple(HashMap<String, Value>),
}

impl Value {
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Tuple(tuple) => Some(tuple),
            _ => None,
        }
    }

    /// Look up a string field of a tuple value
    pub fn field(&self, key: &str) -> Option<&str> {
        self.as_tuple()?.get(key)?.as_string()
    }
}

/// `reason` field of `*stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStopReason {
    BreakpointHit,
    WatchpointTrigger,
    ReadWatchpointTrigger,
    AccessWatchpointTrigger,
    FunctionFinished,
    LocationReached,
    WatchpointScope,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
    SolibEvent,
    Fork,
    Vfork,
    SyscallEntry,
    SyscallReturn,
    Exec,
    NoHistory,
}

impl FromStr for ExecStopReason {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "breakpoint-hit" => ExecStopReason::BreakpointHit,
            "watchpoint-trigger" => ExecStopReason::WatchpointTrigger,
            "read-watchpoint-trigger" => ExecStopReason::ReadWatchpointTrigger,
            "access-watchpoint-trigger" => ExecStopReason::AccessWatchpointTrigger,
            "function-finished" => ExecStopReason::FunctionFinished,
            "location-reached" => ExecStopReason::LocationReached,
            "watchpoint-scope" => ExecStopReason::WatchpointScope,
            "end-stepping-range" => ExecStopReason::EndSteppingRange,
            "exited-signalled" => ExecStopReason::ExitedSignalled,
            "exited" => ExecStopReason::Exited,
            "exited-normally" => ExecStopReason::ExitedNormally,
            "signal-received" => ExecStopReason::SignalReceived,
            "solib-event" => ExecStopReason::SolibEvent,
            "fork" => ExecStopReason::Fork,
            "vfork" => ExecStopReason::Vfork,
            "syscall-entry" => ExecStopReason::SyscallEntry,
            "syscall-return" => ExecStopReason::SyscallReturn,
            "exec" => ExecStopReason::Exec,
            "no-history" => ExecStopReason::NoHistory,
            _ => return Err(()),
        })
    }
}

/// Execution state of the inferior as seen by the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferiorStatus {
    Uninitialized,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferiorArch {
    X86,
    X64,
}

impl InferiorArch {
    /// Width of a pointer, also the widest hardware watchpoint slot
    pub fn pointer_size(self) -> u64 {
        match self {
            InferiorArch::X86 => 4,
            InferiorArch::X64 => 8,
        }
    }
}

/// Why the inferior was last stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Stopped by a debug event (breakpoint, step, signal)
    Debug,
    /// Paused on request
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachResult {
    Successful,
    AttachSelf,
    ProcessNotValid,
    AlreadyDebugging,
    AlreadyTraced,
    PermDenied,
}

impl fmt::Display for AttachResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttachResult::Successful => "attached successfully",
            AttachResult::AttachSelf => "can't attach to the debugger itself",
            AttachResult::ProcessNotValid => "process is not valid",
            AttachResult::AlreadyDebugging => "already debugging this process",
            AttachResult::AlreadyTraced => "process is already being traced",
            AttachResult::PermDenied => "permission denied, ptrace scope may restrict attaching",
        })
    }
}

/// Snapshot of the session state handed to consumers
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub initialized: bool,
    pub status: InferiorStatus,
    pub pid: i32,
    pub arch: InferiorArch,
    pub stop_reason: StopReason,
}

/// Result of `examine_expression`; fields the debugger could not produce are `None`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionInfo {
    pub all: Option<String>,
    pub address: Option<u64>,
    pub symbol: Option<String>,
}
