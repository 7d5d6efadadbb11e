/// Instruction tracer
///
/// A trace plants an internal breakpoint carrying the trigger condition. Once
/// it is hit the breakpoint is removed and the inferior is stepped up to
/// `max_steps` times, recording every instruction into a tree that follows
/// calls and returns.

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};

use crate::breakpoints::{BreakpointKind, BreakpointModification, OnHit};
use crate::engine::CancelSignal;
use crate::session::{DebugSession, Inner};
use crate::{lock, CoreError, Result};

static RET_INSTRUCTION: Lazy<Regex> = Lazy::new(|| Regex::new(r":\s+ret").expect("valid regex"));
static CALL_INSTRUCTION: Lazy<Regex> = Lazy::new(|| Regex::new(r":\s+call").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepMode {
    SingleStep,
    StepOver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceOptions {
    pub max_steps: usize,
    /// Debugger expression; tracing starts once it holds at the breakpoint
    pub trigger_condition: String,
    /// Debugger expression; tracing stops as soon as it evaluates to 1
    pub stop_condition: String,
    pub step_mode: StepMode,
    /// Leave the inferior stopped when the trace ends
    pub stop_after: bool,
    pub collect_registers: bool,
}

impl Default for TraceOptions {
    fn default() -> Self {
        TraceOptions {
            max_steps: 1000,
            trigger_condition: String::new(),
            stop_condition: String::new(),
            step_mode: StepMode::SingleStep,
            stop_after: false,
            collect_registers: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceStatus {
    /// Waiting for the trigger breakpoint
    Idle,
    Tracing,
    Canceled,
    Processing,
    Finished,
}

impl TraceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TraceStatus::Canceled | TraceStatus::Finished)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceNode {
    /// Disassembled instruction; empty for scaffold nodes
    pub instruction: String,
    pub registers: Option<BTreeMap<String, String>>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl TraceNode {
    fn scaffold(parent: Option<usize>, children: Vec<usize>) -> Self {
        TraceNode {
            instruction: String::new(),
            registers: None,
            parent,
            children,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceTree {
    pub nodes: Vec<TraceNode>,
    /// Index of the outermost scope
    pub root: usize,
}

impl TraceTree {
    /// Nodes recorded by a step, scaffolding excluded
    pub fn step_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.instruction.is_empty()).count()
    }
}

/// Places steps into the call tree
#[derive(Debug)]
pub(crate) struct TraceTreeBuilder {
    nodes: Vec<TraceNode>,
    current: usize,
    root: usize,
    step_mode: StepMode,
}

impl TraceTreeBuilder {
    pub fn new(step_mode: StepMode) -> Self {
        TraceTreeBuilder {
            nodes: vec![TraceNode::scaffold(None, Vec::new())],
            current: 0,
            root: 0,
            step_mode,
        }
    }

    pub fn push(&mut self, instruction: String, registers: Option<BTreeMap<String, String>>) {
        let index = self.nodes.len();
        let is_ret = RET_INSTRUCTION.is_match(&instruction);
        let is_call = CALL_INSTRUCTION.is_match(&instruction);
        self.nodes.push(TraceNode {
            instruction,
            registers,
            parent: Some(self.current),
            children: Vec::new(),
        });
        self.nodes[self.current].children.push(index);

        if is_ret {
            match self.nodes[self.current].parent {
                Some(parent) => self.current = parent,
                None => {
                    // Returned past where the trace began
                    let scope = self.nodes.len();
                    self.nodes.push(TraceNode::scaffold(None, vec![self.current]));
                    self.nodes[self.current].parent = Some(scope);
                    self.current = scope;
                    self.root = scope;
                }
            }
        } else if is_call && self.step_mode == StepMode::SingleStep {
            self.current = index;
        }
    }

    pub fn finish(self) -> TraceTree {
        TraceTree {
            nodes: self.nodes,
            root: self.root,
        }
    }
}

struct TraceShared {
    id: OnceCell<String>,
    status: watch::Sender<TraceStatus>,
    steps: AtomicUsize,
    cancel: CancelSignal,
    /// Signalled when the trigger breakpoint is hit
    trigger: Notify,
    tree: Mutex<Option<TraceTree>>,
}

/// Handle to a running or finished trace
#[derive(Clone)]
pub struct TraceHandle {
    shared: Arc<TraceShared>,
}

impl TraceHandle {
    fn new() -> Self {
        TraceHandle {
            shared: Arc::new(TraceShared {
                id: OnceCell::new(),
                status: watch::channel(TraceStatus::Idle).0,
                steps: AtomicUsize::new(0),
                cancel: CancelSignal::new(),
                trigger: Notify::new(),
                tree: Mutex::new(None),
            }),
        }
    }

    /// Number of the trigger breakpoint; empty while it is being planted
    pub fn id(&self) -> &str {
        self.shared.id.get().map_or("", String::as_str)
    }

    /// A hit before the tracer task waits is kept for it
    pub(crate) fn trigger(&self) {
        self.shared.trigger.notify_one();
    }

    pub fn status(&self) -> TraceStatus {
        *self.shared.status.borrow()
    }

    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    pub fn step_count(&self) -> usize {
        self.shared.steps.load(Ordering::SeqCst)
    }

    /// End the trace early; what was recorded so far is kept
    pub fn cancel(&self) {
        self.shared.cancel.request();
    }

    /// The recorded tree once the trace is over
    pub fn tree(&self) -> Option<TraceTree> {
        lock(&self.shared.tree).clone()
    }

    /// Wait for the trace to end and return its final status
    pub async fn wait(&self) -> TraceStatus {
        let mut status = self.shared.status.subscribe();
        let last = match status.wait_for(|s| s.is_terminal()).await {
            Ok(s) => *s,
            Err(_) => self.status(),
        };
        last
    }

    fn set_status(&self, status: TraceStatus) {
        log::debug!("trace {}: {:?}", self.id(), status);
        self.shared.status.send_replace(status);
    }
}

/// The session's trace, plus the one being armed
#[derive(Default)]
pub(crate) struct TraceSlot {
    pub current: Option<TraceHandle>,
    pub arming: Option<TraceHandle>,
}

impl TraceSlot {
    pub fn is_active(&self) -> bool {
        self.current.as_ref().is_some_and(TraceHandle::is_active)
    }

    /// Trace that receives trigger hits
    pub fn triggered(&self) -> Option<TraceHandle> {
        self.arming.clone().or_else(|| self.current.clone())
    }
}

/// Keeps other traces out while one is being armed
struct Arming<'a> {
    inner: &'a Inner,
}

impl<'a> Arming<'a> {
    fn reserve(inner: &'a Inner, handle: &TraceHandle) -> Result<Self> {
        let mut slot = lock(&inner.trace);
        if slot.arming.is_some() || slot.is_active() {
            return Err(CoreError::TraceActive);
        }
        slot.arming = Some(handle.clone());
        Ok(Arming { inner })
    }

    fn commit(self, handle: TraceHandle) {
        {
            let mut slot = lock(&self.inner.trace);
            slot.arming = None;
            slot.current = Some(handle);
        }
        drop(self);
    }
}

impl Drop for Arming<'_> {
    fn drop(&mut self) {
        lock(&self.inner.trace).arming = None;
    }
}

impl DebugSession {
    /// Trace instructions starting at the address `expression` evaluates to.
    ///
    /// Returns `None` if `max_steps` is zero or the trigger breakpoint can't be set.
    pub async fn start_trace(
        &self,
        expression: &str,
        options: TraceOptions,
    ) -> Result<Option<TraceHandle>> {
        self.require_process()?;
        let handle = TraceHandle::new();
        let arming = Arming::reserve(&self.inner, &handle)?;
        if options.max_steps < 1 {
            log::warn!("max_steps must be at least 1");
            return Ok(None);
        }

        let resume = self.begin_temporary_interruption().await?;
        let number = self.plant_trigger(expression, &options.trigger_condition).await;
        self.end_temporary_interruption(resume).await?;
        let Some(number) = number? else {
            return Ok(None);
        };

        let _ = handle.shared.id.set(number);
        arming.commit(handle.clone());
        tokio::spawn(run_trace(
            self.clone(),
            handle.clone(),
            expression.to_string(),
            options,
        ));
        log::info!("trace {} armed at {}", handle.id(), expression);
        Ok(Some(handle))
    }

    async fn plant_trigger(&self, expression: &str, condition: &str) -> Result<Option<String>> {
        let number = self
            .add_breakpoint(expression, BreakpointKind::Hardware, OnHit::Trace)
            .await?;
        if number.is_some() && !condition.is_empty() {
            self.modify_breakpoint(
                expression,
                &BreakpointModification::Condition(condition.to_string()),
            )
            .await?;
        }
        Ok(number)
    }

    /// The active or last trace
    pub fn trace(&self) -> Option<TraceHandle> {
        lock(&self.inner.trace).current.clone()
    }

    pub fn cancel_trace(&self) {
        if let Some(handle) = self.trace() {
            handle.cancel();
        }
    }
}

async fn run_trace(session: DebugSession, handle: TraceHandle, expression: String, options: TraceOptions) {
    let exited = session.process_exit();
    let triggered = tokio::select! {
        _ = handle.shared.trigger.notified() => true,
        _ = handle.shared.cancel.requested() => false,
        _ = exited.wait() => false,
    };
    if session.is_attached() {
        if let Err(e) = session.delete_breakpoint(&expression).await {
            log::warn!("failed to remove trace breakpoint: {}", e);
        }
    }
    if !triggered {
        *lock(&handle.shared.tree) = Some(TraceTreeBuilder::new(options.step_mode).finish());
        handle.set_status(TraceStatus::Canceled);
        return;
    }

    handle.set_status(TraceStatus::Tracing);
    let mut builder = TraceTreeBuilder::new(options.step_mode);
    let mut canceled = false;
    for _ in 0..options.max_steps {
        if handle.shared.cancel.is_requested() {
            canceled = true;
            break;
        }
        if !session.is_attached() {
            break;
        }
        match trace_step(&session, &options, &mut builder).await {
            Ok(stepped) => {
                handle.shared.steps.fetch_add(1, Ordering::SeqCst);
                if !stepped {
                    break;
                }
            }
            Err(e) => {
                log::warn!("trace {} stopped: {}", handle.id(), e);
                break;
            }
        }
    }
    // A cancel during the last step still counts
    canceled |= handle.shared.cancel.is_requested();

    handle.set_status(TraceStatus::Processing);
    *lock(&handle.shared.tree) = Some(builder.finish());
    handle.set_status(if canceled {
        TraceStatus::Canceled
    } else {
        TraceStatus::Finished
    });
    log::info!("trace {} recorded {} steps", handle.id(), handle.step_count());

    if !options.stop_after && session.is_attached() {
        if let Err(e) = session.continue_inferior().await {
            log::warn!("failed to resume after trace: {}", e);
        }
    }
}

/// Record the current instruction and step; false once the stop condition holds
async fn trace_step(
    session: &DebugSession,
    options: &TraceOptions,
    builder: &mut TraceTreeBuilder,
) -> Result<bool> {
    let response = session.execute("x/i $pc").await?;
    let instruction = response
        .console
        .lines()
        .next()
        .unwrap_or_default()
        .trim_start()
        .trim_start_matches("=>")
        .trim()
        .to_string();
    let registers = if options.collect_registers {
        let mut registers = session.read_registers().await?;
        registers.extend(session.read_float_registers().await?);
        Some(registers)
    } else {
        None
    };
    builder.push(instruction, registers);

    if !options.stop_condition.is_empty()
        && session.parse_and_eval(&options.stop_condition).await?.as_deref() == Some("1")
    {
        return Ok(false);
    }
    match options.step_mode {
        StepMode::SingleStep => session.step_instruction().await?,
        StepMode::StepOver => session.step_over_instruction().await?,
    }
    session.wait_for_stop(None).await;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn build(mode: StepMode, instructions: &[&str]) -> TraceTree {
        let mut builder = TraceTreeBuilder::new(mode);
        for instruction in instructions {
            builder.push(instruction.to_string(), None);
        }
        builder.finish()
    }

    #[test]
    fn test_call_opens_scope_and_ret_closes_it() {
        let tree = build(
            StepMode::SingleStep,
            &[
                "0x1000 <main>:\tcall   0x2000 <f>",
                "0x2000 <f>:\tpush   rbp",
                "0x2001 <f+1>:\tret",
                "0x1005 <main+5>:\tnop",
            ],
        );
        assert_eq!(tree.root, 0);
        assert_eq!(tree.nodes[0].children, vec![1, 4]);
        assert_eq!(tree.nodes[1].children, vec![2, 3]);
        assert_eq!(tree.nodes[3].parent, Some(1));
        assert_eq!(tree.step_count(), 4);
    }

    #[test]
    fn test_ret_past_start_synthesizes_root() {
        let tree = build(
            StepMode::SingleStep,
            &["0x2001 <f+1>:\tret", "0x1005 <main+5>:\tnop"],
        );
        assert_eq!(tree.nodes.len(), 4);
        assert_eq!(tree.root, 2);
        assert_eq!(tree.nodes[2].children, vec![0, 3]);
        assert_eq!(tree.nodes[0].parent, Some(2));
        assert_eq!(tree.step_count(), 2);
    }

    #[test]
    fn test_step_over_keeps_calls_flat() {
        let tree = build(
            StepMode::StepOver,
            &["0x1000 <main>:\tcall   0x2000 <f>", "0x1005 <main+5>:\tnop"],
        );
        assert_eq!(tree.nodes[0].children, vec![1, 2]);
        assert!(tree.nodes[1].children.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_stays_with_its_trace() {
        let old = TraceHandle::new();
        old.trigger();
        let new = TraceHandle::new();
        assert!(tokio::time::timeout(Duration::from_millis(50), new.shared.trigger.notified())
            .await
            .is_err());
        assert!(tokio::time::timeout(Duration::from_millis(50), old.shared.trigger.notified())
            .await
            .is_ok());
    }

    #[test]
    fn test_slot_routes_hits_to_the_trace_being_armed() {
        let finished = TraceHandle::new();
        finished.set_status(TraceStatus::Finished);
        let arming = TraceHandle::new();
        let slot = TraceSlot {
            current: Some(finished),
            arming: Some(arming.clone()),
        };
        assert!(!slot.is_active());
        assert!(slot.triggered().is_some_and(|t| Arc::ptr_eq(&t.shared, &arming.shared)));
    }

    #[tokio::test]
    async fn test_handle_wait_and_cancel() {
        let handle = TraceHandle::new();
        assert!(handle.is_active());
        handle.cancel();
        assert!(handle.shared.cancel.is_requested());

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };
        handle.set_status(TraceStatus::Canceled);
        assert_eq!(waiter.await.unwrap(), TraceStatus::Canceled);
        assert!(!handle.is_active());
    }
}
