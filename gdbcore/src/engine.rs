/// Command/response engine
///
/// Commands are serialized through one lock so at most one is in flight. Each
/// command carries a numeric token; the observer collects the records for that
/// token into the shared response slot and completes it at the next idle
/// prompt, after any state transitions the command caused have been applied.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify};

use crate::lock;
use crate::parser::mi_quote;
use crate::transport::TransportWriter;
use crate::types::{GdbResult, ResultClass, StreamRecord, StreamType, Value};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Debugger is not initialized")]
    NotInitialized,
    #[error("Debugger process terminated")]
    ProcessTerminated,
    #[error("Failed to write command: {0}")]
    WriteError(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Everything the debugger produced for one command
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub result: Option<GdbResult>,
    /// Concatenated console stream output
    pub console: String,
    /// Raw lines attributed to the command
    pub lines: Vec<String>,
}

impl Response {
    pub fn is_empty(&self) -> bool {
        self.result.is_none() && self.lines.is_empty()
    }

    pub fn is_error(&self) -> bool {
        matches!(&self.result, Some(r) if r.class == ResultClass::Error)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.result.as_ref()?.error_message()
    }

    /// Field of the result record
    pub fn field(&self, key: &str) -> Option<&Value> {
        if self.is_error() {
            return None;
        }
        self.result.as_ref()?.results.get(key)
    }
}

/// Cooperative cancellation flag with a wake-up
#[derive(Debug, Default)]
pub struct CancelSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    /// Resolves once cancellation has been requested
    pub async fn requested(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

struct InFlight {
    token: u32,
    result: Option<GdbResult>,
    console: String,
    lines: Vec<String>,
    sender: oneshot::Sender<Response>,
}

/// State shared between the engine and the observer
pub(crate) struct ResponseSlot {
    in_flight: Mutex<Option<InFlight>>,
    prompts: watch::Sender<u64>,
}

impl ResponseSlot {
    fn new() -> Self {
        ResponseSlot {
            in_flight: Mutex::new(None),
            prompts: watch::channel(0).0,
        }
    }

    fn begin(&self, token: u32, sender: oneshot::Sender<Response>) {
        *lock(&self.in_flight) = Some(InFlight {
            token,
            result: None,
            console: String::new(),
            lines: Vec::new(),
            sender,
        });
    }

    fn clear(&self) {
        lock(&self.in_flight).take();
    }

    /// Claim a result record; false if it does not belong to the in-flight command
    pub(crate) fn on_result(&self, result: GdbResult, line: &str) -> bool {
        let mut guard = lock(&self.in_flight);
        match guard.as_mut() {
            Some(cmd) if result.token == Some(cmd.token) && cmd.result.is_none() => {
                log::debug!("RECV[{}]: class={:?}", cmd.token, result.class);
                cmd.lines.push(line.to_string());
                cmd.result = Some(result);
                true
            }
            _ => false,
        }
    }

    /// Claim console/log output emitted while a command runs
    pub(crate) fn on_stream(&self, stream: &StreamRecord, line: &str) -> bool {
        let mut guard = lock(&self.in_flight);
        match guard.as_mut() {
            Some(cmd) if cmd.result.is_none() && stream.stream_type != StreamType::Target => {
                if stream.stream_type == StreamType::Console {
                    cmd.console.push_str(&stream.content);
                }
                cmd.lines.push(line.to_string());
                true
            }
            _ => false,
        }
    }

    /// Deliver the in-flight response if its result record has arrived
    pub(crate) fn on_prompt(&self) {
        {
            let mut guard = lock(&self.in_flight);
            if guard.as_ref().is_some_and(|cmd| cmd.result.is_some()) {
                if let Some(cmd) = guard.take() {
                    let response = Response {
                        result: cmd.result,
                        console: cmd.console,
                        lines: cmd.lines,
                    };
                    if cmd.sender.send(response).is_err() {
                        log::debug!("RECV[{}]: caller went away", cmd.token);
                    }
                }
            }
        }
        self.prompts.send_modify(|count| *count += 1);
    }

    /// Drop the waiter so the caller sees the transport as gone
    pub(crate) fn fail(&self) {
        if let Some(cmd) = lock(&self.in_flight).take() {
            log::warn!("RECV[{}]: dropped, debugger went away", cmd.token);
        }
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        lock(&self.in_flight).is_some()
    }
}

/// Serializes commands and correlates their responses
pub struct CommandEngine {
    writer: tokio::sync::Mutex<Option<TransportWriter>>,
    slot: ResponseSlot,
    tokens: AtomicU32,
    alive: AtomicBool,
    cancel: CancelSignal,
    prompt_timeout: Duration,
}

impl CommandEngine {
    pub fn new(prompt_timeout: Duration) -> Self {
        CommandEngine {
            writer: tokio::sync::Mutex::new(None),
            slot: ResponseSlot::new(),
            tokens: AtomicU32::new(1),
            alive: AtomicBool::new(false),
            cancel: CancelSignal::new(),
            prompt_timeout,
        }
    }

    pub(crate) fn slot(&self) -> &ResponseSlot {
        &self.slot
    }

    /// Attach a freshly started debugger
    pub(crate) async fn install(&self, writer: TransportWriter) {
        let mut guard = self.writer.lock().await;
        self.slot.clear();
        *guard = Some(writer);
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Mark the debugger as gone and release any waiting caller
    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.slot.fail();
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Whether a command is waiting for its response
    pub fn is_busy(&self) -> bool {
        self.slot.has_in_flight()
    }

    /// Number of idle prompts seen so far
    pub(crate) fn prompt_count(&self) -> u64 {
        *self.slot.prompts.borrow()
    }

    /// Wait until at least `count` prompts have been seen
    pub(crate) async fn wait_for_prompts(&self, count: u64, timeout: Duration) -> bool {
        let mut prompts = self.slot.prompts.subscribe();
        let seen = tokio::time::timeout(timeout, prompts.wait_for(|seen| *seen >= count))
            .await
            .is_ok_and(|r| r.is_ok());
        seen
    }

    /// Run one command and wait for its response.
    ///
    /// Commands starting with `-` go out as MI commands, anything else runs
    /// through the console interpreter. A cancelled command interrupts the
    /// debugger, waits for the idle prompt and yields an empty response.
    pub async fn execute(&self, command: &str) -> Result<Response> {
        let mut guard = self.writer.lock().await;
        if !self.is_alive() {
            return Err(EngineError::NotInitialized);
        }
        let writer = guard.as_mut().ok_or(EngineError::NotInitialized)?;

        self.cancel.clear();
        let token = self.tokens.fetch_add(1, Ordering::SeqCst);
        let line = format_command(token, command);

        let (sender, receiver) = oneshot::channel();
        self.slot.begin(token, sender);

        log::debug!("SEND[{}]: {}", token, command);
        if let Err(e) = writer.send_line(&line).await {
            self.slot.clear();
            return Err(e.into());
        }

        let cancelled = self.cancel.requested();
        tokio::pin!(cancelled);

        tokio::select! {
            response = receiver => {
                response.map_err(|_| EngineError::ProcessTerminated)
            }
            _ = &mut cancelled => {
                log::info!("CANCEL[{}]: interrupting {}", token, command);
                let mut prompts = self.slot.prompts.subscribe();
                prompts.borrow_and_update();
                let sent = writer.send_control('c').await;
                if sent.is_ok()
                    && tokio::time::timeout(self.prompt_timeout, prompts.changed())
                        .await
                        .is_err()
                {
                    log::warn!("CANCEL[{}]: no prompt after interrupt", token);
                }
                self.slot.clear();
                self.cancel.clear();
                sent?;
                Ok(Response::default())
            }
        }
    }

    /// Send `key` as a control keystroke; no response is correlated
    pub async fn execute_control(&self, key: char) -> Result<Response> {
        let mut guard = self.writer.lock().await;
        if !self.is_alive() {
            return Err(EngineError::NotInitialized);
        }
        let writer = guard.as_mut().ok_or(EngineError::NotInitialized)?;
        log::debug!("SEND[ctrl]: ^{}", key.to_ascii_uppercase());
        writer.send_control(key).await?;
        Ok(Response::default())
    }

    /// Ask the in-flight command to give up; a no-op when nothing is running
    pub fn cancel_last_command(&self) {
        if self.is_busy() {
            self.cancel.request();
        }
    }
}

fn format_command(token: u32, command: &str) -> String {
    if command.starts_with('-') {
        format!("{token}{command}")
    } else {
        format!("{token}-interpreter-exec console {}", mi_quote(command))
    }
}
