/// Debug session
///
/// `DebugSession` is the handle every consumer holds. It owns one debugger
/// instance at a time together with the state the observer maintains for the
/// inferior, and exposes lifecycle, inferior control and expression helpers.
/// Breakpoints, memory, tracing and dissection add their operations in their
/// own modules.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::breakpoints::{ChainedWatchpointGroup, HitAction, TrackingTable};
use crate::companion::{
    install_extension, CompanionChannel, CompanionListener, CompanionRequest, SOCKET_ENV,
};
use crate::config::CoreConfig;
use crate::dissect::Dissector;
use crate::engine::{CommandEngine, Response};
use crate::events::{EventBus, StatusNotifier, SubscriptionId, Waiter};
use crate::inspect;
use crate::observer;
use crate::parser::mi_quote;
use crate::procfs;
use crate::tracer::TraceSlot;
use crate::transport::{GdbProcess, Transport};
use crate::types::*;
use crate::{lock, CoreError, Result};

static ADDRESS_WITH_SYMBOL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"((0x[0-9a-fA-F]+)\s*(<.+>)?)").expect("valid regex"));
static INFERIOR_PID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"process\s+(\d+)").expect("valid regex"));
static ENTRY_POINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Entry\s+point:\s+(0x[0-9a-fA-F]+)").expect("valid regex"));
static CONVENIENCE_VARIABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\$\d+)\s+=\s+(.*)").expect("valid regex"));
static DISASSEMBLE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([0-9a-fA-F]+.*)\t(.*?[0-9a-fA-F]{2})\s*\t(.+)").expect("valid regex")
});
static OFFSET_EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[/*+\-][0-9a-fA-FxX/*+\-\[\]]+$").expect("valid regex"));
static REGION_INDEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]$").expect("valid regex"));

const GENERAL_64: &[&str] = &[
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip",
];
const GENERAL_32: &[&str] = &["eax", "ebx", "ecx", "edx", "esi", "edi", "ebp", "esp", "eip"];
const SEGMENT: &[&str] = &["cs", "ss", "ds", "es", "fs", "gs"];

/// State of the inferior, shared by the lifecycle code and the observer
pub(crate) struct SessionState {
    pub pid: i32,
    pub status: InferiorStatus,
    pub arch: InferiorArch,
    pub stop_reason: StopReason,
    /// Reason to record at the next stop, set by pause requests
    pub pending_stop_reason: Option<StopReason>,
    pub interrupt_signal: String,
    pub hit_actions: HashMap<String, HitAction>,
    pub chains: Vec<ChainedWatchpointGroup>,
    pub tracking: TrackingTable,
    pub modified_instructions: BTreeMap<u64, Vec<u8>>,
    /// Whether the last stop was internal bookkeeping
    pub last_stop_internal: bool,
}

impl SessionState {
    fn new(interrupt_signal: String) -> Self {
        SessionState {
            pid: -1,
            status: InferiorStatus::Uninitialized,
            arch: InferiorArch::X64,
            stop_reason: StopReason::Debug,
            pending_stop_reason: None,
            interrupt_signal,
            hit_actions: HashMap::new(),
            chains: Vec::new(),
            tracking: TrackingTable::default(),
            modified_instructions: BTreeMap::new(),
            last_stop_internal: false,
        }
    }

    fn reset(&mut self) {
        self.pid = -1;
        self.status = InferiorStatus::Uninitialized;
        self.stop_reason = StopReason::Debug;
        self.pending_stop_reason = None;
        self.hit_actions.clear();
        self.chains.clear();
        self.tracking.clear();
        self.modified_instructions.clear();
        self.last_stop_internal = false;
    }
}

pub(crate) struct Inner {
    pub config: CoreConfig,
    pub engine: CommandEngine,
    pub state: Mutex<SessionState>,
    pub notifier: StatusNotifier,
    pub bus: EventBus,
    pub trace: Mutex<TraceSlot>,
    pub dissector: Dissector,
    /// Extension channel and the debugger generation it belongs to
    pub companion: tokio::sync::Mutex<Option<(u64, CompanionChannel)>>,
    /// Held across a breakpoint table check and the insertion relying on it
    pub breakpoint_lock: tokio::sync::Mutex<()>,
    process: Mutex<Option<GdbProcess>>,
    generation: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Inner {
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.state)
    }

    pub fn set_status(&self, status: InferiorStatus) {
        self.state().status = status;
        self.notifier.set_status(status);
    }

    pub fn trace_active(&self) -> bool {
        lock(&self.trace).is_active()
    }

    /// Drop the debugger instance `generation`; stale calls are ignored
    pub fn teardown(&self, generation: u64) -> bool {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.engine.mark_dead();
        if let Some(mut process) = lock(&self.process).take() {
            process.start_kill();
        }
        if let Ok(mut companion) = self.companion.try_lock() {
            companion.take();
        }
        let old_pid = {
            let mut state = self.state();
            let pid = state.pid;
            state.reset();
            pid
        };
        self.notifier.set_status(InferiorStatus::Uninitialized);
        self.dissector.close_index();
        if old_pid != -1 {
            let _ = std::fs::remove_file(self.config.process_dir(old_pid).join("companion.sock"));
        }
        log::debug!("debugger instance {} torn down (pid {})", generation, old_pid);
        true
    }
}

/// How a signal is handled by the debugger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalHandling {
    pub name: String,
    pub stop: bool,
    pub pass_to_program: bool,
}

/// One line of `disas /r` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisassembledInstruction {
    /// Address with optional symbol, e.g. `0x401136 <main+4>`
    pub address: String,
    pub bytes: String,
    pub opcode: String,
}

impl DisassembledInstruction {
    pub fn address_value(&self) -> Option<u64> {
        self.address.split_whitespace().next().and_then(parse_hex)
    }
}

/// Cloneable handle to a debugging session
#[derive(Clone)]
pub struct DebugSession {
    pub(crate) inner: Arc<Inner>,
}

impl DebugSession {
    pub fn new(config: CoreConfig) -> Self {
        let interrupt_signal = config.interrupt_signal.clone();
        let inner = Inner {
            engine: CommandEngine::new(config.prompt_timeout()),
            state: Mutex::new(SessionState::new(interrupt_signal)),
            notifier: StatusNotifier::new(),
            bus: EventBus::new(config.event_queue_capacity),
            trace: Mutex::new(TraceSlot::default()),
            dissector: Dissector::new(),
            companion: tokio::sync::Mutex::new(None),
            breakpoint_lock: tokio::sync::Mutex::new(()),
            process: Mutex::new(None),
            generation: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(()),
            config,
        };
        DebugSession {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        DebugSession { inner }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state()
    }

    // Lifecycle

    /// Start a fresh debugger, discarding any current session
    pub async fn init_gdb(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.init_gdb_locked().await
    }

    async fn init_gdb_locked(&self) -> Result<()> {
        self.inner.teardown(self.inner.generation());

        let config = &self.inner.config;
        let script = match (&config.extension_script, config.companion) {
            (_, false) => None,
            (Some(script), true) => Some(script.clone()),
            (None, true) => match install_extension(&config.runtime_dir) {
                Ok(script) => Some(script),
                Err(e) => {
                    log::warn!("can't install debugger extension: {}", e);
                    None
                }
            },
        };
        let mut env = Vec::new();
        let listener = match &script {
            Some(_) => {
                let path = config
                    .process_dir(std::process::id() as i32)
                    .join("companion.sock");
                match CompanionListener::bind(&path) {
                    Ok(listener) => {
                        env.push((SOCKET_ENV.to_string(), path.to_string_lossy().into_owned()));
                        Some(listener)
                    }
                    Err(e) => {
                        log::warn!("companion channel unavailable: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let (process, transport) = GdbProcess::spawn(&config.gdb_path, &config.gdb_args, &env)?;
        *lock(&self.inner.process) = Some(process);
        self.start(transport).await?;

        if let (Some(listener), Some(script)) = (listener, &script) {
            self.source_extension(listener, script).await;
        }
        Ok(())
    }

    /// Run a session over an already connected debugger transport
    pub async fn connect(&self, transport: Transport) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.teardown(self.inner.generation());
        self.start(transport).await
    }

    async fn start(&self, transport: Transport) -> Result<()> {
        let Transport { reader, writer } = transport;
        let generation = self.inner.generation();
        let prompts_before = self.inner.engine.prompt_count();

        self.inner.engine.install(writer).await;
        tokio::spawn(observer::run(reader, self.inner.clone(), generation));

        if !self
            .inner
            .engine
            .wait_for_prompts(prompts_before + 1, self.inner.config.prompt_timeout())
            .await
        {
            log::warn!("debugger did not show a prompt in time");
        }

        self.execute("-gdb-set mi-async on").await?;
        self.execute("set pagination off").await?;
        self.execute("set confirm off").await?;
        for command in &self.inner.config.init_commands {
            let response = self.execute(command).await?;
            if let Some(msg) = response.error_message() {
                log::warn!("init command {:?} failed: {}", command, msg);
            }
        }
        log::info!("debugger initialized");
        Ok(())
    }

    async fn source_extension(&self, listener: CompanionListener, script: &Path) {
        let command = format!("source {}", script.display());
        match self.execute(&command).await {
            Ok(response) if !response.is_error() => {}
            Ok(response) => {
                log::warn!(
                    "failed to source {}: {}",
                    script.display(),
                    response.error_message().unwrap_or_default()
                );
                return;
            }
            Err(e) => {
                log::warn!("failed to source {}: {}", script.display(), e);
                return;
            }
        }
        match listener.accept(self.inner.config.companion_timeout()).await {
            Ok(channel) => self.set_companion(channel).await,
            Err(e) => log::warn!("extension did not connect: {}", e),
        }
    }

    /// Use `channel` for structured requests until the debugger goes away
    pub async fn set_companion(&self, channel: CompanionChannel) {
        *self.inner.companion.lock().await = Some((self.inner.generation(), channel));
    }

    pub async fn has_companion(&self) -> bool {
        let mut guard = self.inner.companion.lock().await;
        let connected = self.current_companion(&mut guard).is_some();
        connected
    }

    /// Drops a channel left over from an earlier debugger
    fn current_companion<'a>(
        &self,
        slot: &'a mut Option<(u64, CompanionChannel)>,
    ) -> Option<&'a mut CompanionChannel> {
        if slot.as_ref().is_some_and(|(generation, _)| *generation != self.inner.generation()) {
            log::debug!("discarding companion channel of a previous debugger");
            slot.take();
        }
        slot.as_mut().map(|(_, channel)| channel)
    }

    /// Attach to a running process
    pub async fn attach(&self, pid: i32) -> Result<AttachResult> {
        let _guard = self.inner.lifecycle.lock().await;
        if pid == std::process::id() as i32 {
            return Ok(AttachResult::AttachSelf);
        }
        if !procfs::process_exists(pid) {
            return Ok(AttachResult::ProcessNotValid);
        }
        if pid == self.pid() {
            return Ok(AttachResult::AlreadyDebugging);
        }
        if procfs::tracer_pid(pid).is_some_and(|tracer| tracer != 0) {
            return Ok(AttachResult::AlreadyTraced);
        }
        if !procfs::can_ptrace(pid) {
            return Ok(AttachResult::PermDenied);
        }

        self.init_gdb_locked().await?;
        let response = self.execute(&format!("-target-attach {pid}")).await?;
        if let Some(msg) = response.error_message() {
            log::error!("attach to {} failed: {}", pid, msg);
            return Ok(AttachResult::PermDenied);
        }
        self.adopt_inferior(pid).await?;
        log::info!("attached to process {}", pid);
        Ok(AttachResult::Successful)
    }

    /// Attach to a remote gdbserver at `host:port`
    pub async fn attach_remote(&self, host_port: &str) -> Result<bool> {
        let _guard = self.inner.lifecycle.lock().await;
        self.init_gdb_locked().await?;
        let response = self
            .execute(&format!("-target-select remote {host_port}"))
            .await?;
        if let Some(msg) = response.error_message() {
            log::error!("remote attach to {} failed: {}", host_port, msg);
            return Ok(false);
        }
        let pid = self.get_inferior_pid().await?.unwrap_or(0);
        self.adopt_inferior(pid).await?;
        Ok(true)
    }

    /// Start `path` under the debugger and stop at its entry point
    pub async fn create_process(
        &self,
        path: &Path,
        args: &str,
        ld_preload: Option<&Path>,
    ) -> Result<bool> {
        let _guard = self.inner.lifecycle.lock().await;
        self.init_gdb_locked().await?;

        let response = self
            .execute(&format!("-file-exec-and-symbols {}", mi_quote(&path.to_string_lossy())))
            .await?;
        if let Some(msg) = response.error_message() {
            log::error!("can't create process from {}: {}", path.display(), msg);
            self.inner.teardown(self.inner.generation());
            return Ok(false);
        }

        self.execute("starti").await?;
        self.wait_for_stop(Some(self.inner.config.prompt_timeout())).await;
        match self.find_entry_point().await? {
            Some(entry) => self.execute(&format!("tbreak *{entry:#x}")).await?,
            None => self.execute("tbreak _start").await?,
        };
        self.execute(&format!("set args {args}")).await?;
        if let Some(preload) = ld_preload {
            self.execute(&format!(
                "set exec-wrapper env 'LD_PRELOAD={}'",
                preload.display()
            ))
            .await?;
        }
        self.execute("run&").await?;
        self.wait_for_stop(None).await;
        if !self.is_initialized() {
            log::error!("process from {} exited before reaching its entry point", path.display());
            return Ok(false);
        }

        let Some(pid) = self.get_inferior_pid().await? else {
            log::error!("process from {} did not start", path.display());
            return Ok(false);
        };
        self.adopt_inferior(pid).await?;
        Ok(true)
    }

    /// Record `pid` as the inferior and prepare its per-process state.
    ///
    /// Used after attaching, and directly when the debugger on a `connect`ed
    /// transport already controls the process.
    pub async fn adopt_inferior(&self, pid: i32) -> Result<()> {
        {
            let mut state = self.state();
            state.pid = pid;
        }
        self.inner.set_status(InferiorStatus::Stopped);

        let dir = self.inner.config.process_dir(pid);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            log::warn!("can't create {}: {}", dir.display(), e);
        } else if let Err(e) = self.inner.dissector.open_index(&dir) {
            log::warn!("can't open cross-reference index: {}", e);
        }

        let arch = self.get_inferior_arch().await?;
        self.state().arch = arch;
        self.inner.notifier.notify_status_change();
        Ok(())
    }

    /// Detach from the inferior and shut the debugger down
    pub async fn detach(&self) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        let old_pid = self.pid();
        if self.inner.engine.is_alive() && old_pid != -1 {
            if self.status() == InferiorStatus::Running {
                self.interrupt_inferior(StopReason::Debug).await?;
            }
            if let Err(e) = self.execute("-target-detach").await {
                log::warn!("detach command failed: {}", e);
            }
        }
        if self.inner.teardown(self.inner.generation()) {
            self.inner.notifier.notify_status_change();
        }
        log::info!("detached from process {}", old_pid);
        Ok(())
    }

    // State

    pub fn is_initialized(&self) -> bool {
        self.inner.engine.is_alive()
    }

    pub fn is_attached(&self) -> bool {
        self.pid() != -1
    }

    pub fn pid(&self) -> i32 {
        self.state().pid
    }

    pub(crate) fn require_process(&self) -> Result<i32> {
        if !self.is_initialized() {
            return Err(CoreError::NotInitialized);
        }
        match self.pid() {
            -1 => Err(CoreError::NoProcess),
            pid => Ok(pid),
        }
    }

    pub fn status(&self) -> InferiorStatus {
        self.state().status
    }

    pub fn arch(&self) -> InferiorArch {
        self.state().arch
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state();
        SessionInfo {
            initialized: self.inner.engine.is_alive(),
            status: state.status,
            pid: state.pid,
            arch: state.arch,
            stop_reason: state.stop_reason,
        }
    }

    // Commands

    /// Run a debugger command; console commands are accepted as well as MI
    pub async fn execute(&self, command: &str) -> Result<Response> {
        Ok(self.inner.engine.execute(command).await?)
    }

    /// Send a control keystroke, e.g. `'c'` to interrupt the debugger
    pub async fn execute_control(&self, key: char) -> Result<Response> {
        Ok(self.inner.engine.execute_control(key).await?)
    }

    /// Interrupt the command waiting for its response, if any
    pub fn cancel_last_command(&self) {
        self.inner.engine.cancel_last_command();
    }

    /// Exchange a structured request with the extension
    pub(crate) async fn companion_call(
        &self,
        command: &str,
        args: serde_json::Value,
        debugger_command: &str,
    ) -> Result<Option<serde_json::Value>> {
        let mut guard = self.inner.companion.lock().await;
        let Some(channel) = self.current_companion(&mut guard) else {
            return Ok(None);
        };
        let request = CompanionRequest {
            command: command.to_string(),
            args,
        };
        if let Err(e) = channel.send(&request).await {
            log::warn!("companion channel dropped: {}", e);
            guard.take();
            return Ok(None);
        }
        self.execute(debugger_command).await?;
        match channel.receive().await {
            Ok(reply) => Ok(Some(reply.into_payload()?)),
            Err(e) => {
                log::warn!("companion channel dropped: {}", e);
                guard.take();
                Err(e.into())
            }
        }
    }

    // Events

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<String>) {
        self.inner.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Resolves on the next externally visible status change
    pub fn status_change(&self) -> Waiter {
        self.inner.notifier.status_change()
    }

    /// Resolves when the inferior exits or the debugger goes away
    pub fn process_exit(&self) -> Waiter {
        self.inner.notifier.process_exit()
    }

    /// Block until the inferior is no longer running; false on timeout
    pub async fn wait_for_stop(&self, timeout: Option<Duration>) -> bool {
        let mut status = self.inner.notifier.status_receiver();
        let stopped = status.wait_for(|s| *s != InferiorStatus::Running);
        let done = match timeout {
            Some(timeout) => matches!(tokio::time::timeout(timeout, stopped).await, Ok(Ok(_))),
            None => stopped.await.is_ok(),
        };
        done
    }

    // Inferior control

    /// Stop the inferior and record why
    pub async fn interrupt_inferior(&self, reason: StopReason) -> Result<()> {
        let pid = self.pid();
        if pid == -1 {
            return Ok(());
        }
        let signal = self.state().interrupt_signal.clone();
        self.state().pending_stop_reason = Some(reason);
        if signal == "SIGINT" {
            self.execute("interrupt").await?;
        } else if self.status() == InferiorStatus::Running {
            match nix::sys::signal::Signal::from_str(&signal) {
                Ok(sig) => {
                    if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig) {
                        log::error!("can't send {} to {}: {}", signal, pid, e);
                    }
                }
                Err(_) => log::error!("unknown interrupt signal {}", signal),
            }
        }
        self.wait_for_stop(Some(self.inner.config.prompt_timeout())).await;
        self.state().stop_reason = reason;
        Ok(())
    }

    pub async fn continue_inferior(&self) -> Result<()> {
        if self.pid() == -1 {
            return Ok(());
        }
        self.execute("c&").await?;
        Ok(())
    }

    pub async fn step_instruction(&self) -> Result<()> {
        self.execute("stepi&").await?;
        Ok(())
    }

    pub async fn step_over_instruction(&self) -> Result<()> {
        self.execute("nexti&").await?;
        Ok(())
    }

    pub async fn execute_till_return(&self) -> Result<()> {
        self.execute("finish&").await?;
        Ok(())
    }

    /// Stop the inferior if it runs; returns whether it has to be resumed
    pub(crate) async fn begin_temporary_interruption(&self) -> Result<bool> {
        if self.status() != InferiorStatus::Running {
            return Ok(false);
        }
        self.interrupt_inferior(StopReason::Debug).await?;
        Ok(true)
    }

    pub(crate) async fn end_temporary_interruption(&self, resume: bool) -> Result<()> {
        if resume {
            self.continue_inferior().await?;
        }
        Ok(())
    }

    /// Use `signal_name` for pause requests
    pub async fn set_interrupt_signal(&self, signal_name: &str) -> Result<()> {
        self.handle_signals(&[SignalHandling {
            name: signal_name.to_string(),
            stop: true,
            pass_to_program: false,
        }])
        .await?;
        self.state().interrupt_signal = signal_name.to_string();
        Ok(())
    }

    pub async fn handle_signals(&self, signals: &[SignalHandling]) -> Result<()> {
        let args = serde_json::to_value(signals).map_err(crate::companion::CompanionError::from)?;
        if self
            .companion_call("handle_signals", args, "tracehound-handle-signals")
            .await?
            .is_some()
        {
            return Ok(());
        }
        for signal in signals {
            let command = format!(
                "handle {} {} {}",
                signal.name,
                if signal.stop { "stop" } else { "nostop" },
                if signal.pass_to_program { "pass" } else { "nopass" }
            );
            self.execute(&command).await?;
        }
        Ok(())
    }

    // Expressions

    /// Evaluate `expression` to its value, address and symbol
    pub async fn examine_expression(&self, expression: &str) -> Result<ExpressionInfo> {
        Ok(self
            .examine_expressions(&[expression.to_string()])
            .await?
            .pop()
            .unwrap_or_default())
    }

    pub async fn examine_expressions(&self, expressions: &[String]) -> Result<Vec<ExpressionInfo>> {
        if expressions.is_empty() {
            return Ok(Vec::new());
        }
        if !self.is_initialized() {
            return Err(CoreError::NotInitialized);
        }
        if self.pid() == -1 {
            return Ok(vec![ExpressionInfo::default(); expressions.len()]);
        }

        if let Some(payload) = self
            .companion_call(
                "examine_expressions",
                json!(expressions),
                "tracehound-examine-expressions",
            )
            .await?
        {
            match serde_json::from_value::<Vec<ExpressionInfo>>(payload) {
                Ok(infos) if infos.len() == expressions.len() => return Ok(infos),
                Ok(_) => log::warn!("companion returned a short expression list"),
                Err(e) => log::warn!("bad examine reply: {}", e),
            }
        }

        let mut infos = Vec::with_capacity(expressions.len());
        for expression in expressions {
            infos.push(self.examine_with_mi(expression).await?);
        }
        Ok(infos)
    }

    async fn examine_with_mi(&self, expression: &str) -> Result<ExpressionInfo> {
        let command = format!(
            "-data-evaluate-expression {}",
            mi_quote(&format!("(void*)({expression})"))
        );
        let response = self.execute(&command).await?;
        if let Some(value) = response.field("value").and_then(Value::as_string) {
            return Ok(parse_address_with_symbol(value));
        }
        Ok(self.examine_region_expression(expression))
    }

    /// Resolve `libfoo.so+0x10` or `libfoo.so[1]` against the memory map
    fn examine_region_expression(&self, expression: &str) -> ExpressionInfo {
        let Ok(regions) = procfs::regions(self.pid()) else {
            return ExpressionInfo::default();
        };
        let (name, offset) = match OFFSET_EXPRESSION.find(expression) {
            Some(m) => (&expression[..m.start()], Some(m.as_str())),
            None => (expression, None),
        };
        let (name, index) = match REGION_INDEX.captures(name) {
            Some(caps) => (
                &name[..caps.get(0).map_or(name.len(), |m| m.start())],
                caps[1].parse::<usize>().unwrap_or(0),
            ),
            None => (name, 0),
        };
        let Some(start) = regions
            .iter()
            .filter(|r| {
                r.path
                    .as_deref()
                    .and_then(Path::file_name)
                    .is_some_and(|file| file.to_string_lossy() == name)
            })
            .map(|r| r.start)
            .nth(index)
        else {
            return ExpressionInfo::default();
        };
        let address = match offset.map(parse_offset) {
            Some(Some(delta)) => start.wrapping_add_signed(delta),
            Some(None) => return ExpressionInfo::default(),
            None => start,
        };
        ExpressionInfo {
            all: Some(format!("{address:#x} {name}")),
            address: Some(address),
            symbol: Some(name.to_string()),
        }
    }

    /// Evaluate an expression to its printed value
    pub async fn parse_and_eval(&self, expression: &str) -> Result<Option<String>> {
        if let Some(payload) = self
            .companion_call("parse_and_eval", json!(expression), "tracehound-parse-and-eval")
            .await?
        {
            return Ok(payload.as_str().map(str::to_string));
        }
        let response = self
            .execute(&format!("-data-evaluate-expression {}", mi_quote(expression)))
            .await?;
        Ok(response
            .field("value")
            .and_then(Value::as_string)
            .map(str::to_string))
    }

    /// General, flag and segment registers of the selected thread
    pub async fn read_registers(&self) -> Result<BTreeMap<String, String>> {
        if let Some(payload) = self
            .companion_call("read_registers", json!(null), "tracehound-read-registers")
            .await?
        {
            if let Ok(registers) = serde_json::from_value(payload) {
                return Ok(registers);
            }
            log::warn!("bad register reply from companion");
        }

        let names = self.execute("-data-list-register-names").await?;
        let values = self.execute("-data-list-register-values x").await?;
        let names: Vec<&str> = names
            .field("register-names")
            .and_then(Value::as_list)
            .map(|list| list.iter().map(|v| v.as_string().unwrap_or_default()).collect())
            .unwrap_or_default();

        let general = match self.arch() {
            InferiorArch::X64 => GENERAL_64,
            InferiorArch::X86 => GENERAL_32,
        };
        let mut registers = BTreeMap::new();
        for entry in values
            .field("register-values")
            .and_then(Value::as_list)
            .into_iter()
            .flatten()
        {
            let (Some(number), Some(value)) = (entry.field("number"), entry.field("value")) else {
                continue;
            };
            let Some(name) = number.parse::<usize>().ok().and_then(|n| names.get(n)) else {
                continue;
            };
            if general.contains(name) || SEGMENT.contains(name) || *name == "eflags" {
                registers.insert(name.to_string(), value.to_string());
            }
        }
        if let Some(eflags) = registers.get("eflags").and_then(|v| parse_hex(v)) {
            registers.extend(inspect::flag_registers(eflags));
        }
        Ok(registers)
    }

    /// Disassemble from `expression` to an address or `+offset`
    pub async fn disassemble(
        &self,
        expression: &str,
        offset_or_address: &str,
    ) -> Result<Vec<DisassembledInstruction>> {
        let response = self
            .execute(&format!("disas /r {expression},{offset_or_address}"))
            .await?;
        Ok(response
            .console
            .lines()
            .filter_map(|line| {
                let caps = DISASSEMBLE_LINE.captures(line)?;
                Some(DisassembledInstruction {
                    address: caps[1].trim_end_matches(':').trim().to_string(),
                    bytes: caps[2].trim().to_string(),
                    opcode: caps[3].trim().to_string(),
                })
            })
            .collect())
    }

    /// Disassembled instructions whose opcode matches `text`; `None` for a bad regex
    pub async fn search_opcode(
        &self,
        text: &str,
        start: &str,
        end_or_offset: &str,
        case_sensitive: bool,
        use_regex: bool,
    ) -> Result<Option<Vec<(String, String)>>> {
        let Some(matcher) = text_matcher(text, case_sensitive, use_regex) else {
            return Ok(None);
        };
        Ok(Some(
            self.disassemble(start, end_or_offset)
                .await?
                .into_iter()
                .filter(|instr| matcher.is_match(&instr.opcode))
                .map(|instr| (instr.address, instr.opcode))
                .collect(),
        ))
    }

    pub async fn get_inferior_pid(&self) -> Result<Option<i32>> {
        let response = self.execute("info inferior").await?;
        Ok(INFERIOR_PID
            .captures(&response.console)
            .and_then(|caps| caps[1].parse().ok()))
    }

    pub async fn get_inferior_arch(&self) -> Result<InferiorArch> {
        Ok(match self.parse_and_eval("$rax").await?.as_deref() {
            Some("void") => InferiorArch::X86,
            _ => InferiorArch::X64,
        })
    }

    pub async fn find_entry_point(&self) -> Result<Option<u64>> {
        let response = self.execute("info file").await?;
        Ok(ENTRY_POINT
            .captures(&response.console)
            .and_then(|caps| parse_hex(&caps[1])))
    }

    /// Call a function in the inferior; yields the convenience variable and the value
    pub async fn call_function_from_inferior(
        &self,
        expression: &str,
    ) -> Result<Option<(String, String)>> {
        let resume = self.begin_temporary_interruption().await?;
        let response = self
            .execute(&format!("call (void*(*)(char*, int)) {expression}"))
            .await;
        self.end_temporary_interruption(resume).await?;
        let response = response?;
        Ok(CONVENIENCE_VARIABLE
            .captures(&response.console)
            .map(|caps| (caps[1].to_string(), caps[2].trim().to_string())))
    }

    /// Completion candidates for a partial console command
    pub async fn complete_command(&self, partial: &str) -> Result<Vec<String>> {
        let response = self
            .execute(&format!("-complete {}", mi_quote(partial)))
            .await?;
        Ok(response
            .field("matches")
            .and_then(Value::as_list)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_string)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Substring or regex search; `None` for an invalid regex
pub(crate) fn text_matcher(text: &str, case_sensitive: bool, use_regex: bool) -> Option<Regex> {
    let pattern = if use_regex {
        text.to_string()
    } else {
        regex::escape(text)
    };
    match RegexBuilder::new(&pattern)
        .case_insensitive(!case_sensitive)
        .build()
    {
        Ok(matcher) => Some(matcher),
        Err(e) => {
            log::warn!("invalid search pattern {:?}: {}", text, e);
            None
        }
    }
}

pub(crate) fn parse_hex(text: &str) -> Option<u64> {
    let digits = text.trim().trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).ok()
}

/// `0x401136 <main+4>` style output to an `ExpressionInfo`
pub(crate) fn parse_address_with_symbol(text: &str) -> ExpressionInfo {
    match ADDRESS_WITH_SYMBOL.captures(text) {
        Some(caps) => ExpressionInfo {
            all: caps.get(1).map(|m| m.as_str().trim().to_string()),
            address: caps.get(2).and_then(|m| parse_hex(m.as_str())),
            symbol: caps.get(3).map(|m| m.as_str().to_string()),
        },
        None => ExpressionInfo::default(),
    }
}

/// `+0x10`, `-16` style offsets
fn parse_offset(text: &str) -> Option<i64> {
    let (sign, digits) = match text.split_at(1) {
        ("+", rest) => (1, rest),
        ("-", rest) => (-1, rest),
        _ => return None,
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(sign * value)
}
