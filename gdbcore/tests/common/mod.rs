#![allow(dead_code)]
//! Scripted stand-in for a GDB/MI process
//!
//! Speaks enough of the machine interface over an in-memory stream for a
//! `DebugSession` to run real operations: a breakpoint table, expression
//! evaluation, stepping with `*running`/`*stopped` records and Ctrl+C.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gdbcore::transport::Transport;
use gdbcore::{CoreConfig, DebugSession};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

pub const PID: i32 = 4242;
pub const ENTRY: u64 = 0x401000;

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

/// Returns the output lines for a command; `Some(vec![])` swallows it
pub type Handler = Box<dyn FnMut(&str) -> Option<Vec<String>> + Send>;

struct Row {
    number: String,
    breakpoint_type: String,
    addr: Option<String>,
    what: Option<String>,
    condition: Option<String>,
}

/// What the fake knows about the debugged program
pub struct FakeState {
    pub commands: Vec<String>,
    rows: Vec<Row>,
    next_number: u32,
    pc: u64,
    /// Instructions returned by `x/i $pc`, cycled
    pub program: Vec<String>,
    /// Results of non-address expressions
    pub values: HashMap<String, String>,
    handler: Option<Handler>,
}

impl FakeState {
    fn new() -> Self {
        FakeState {
            commands: Vec::new(),
            rows: Vec::new(),
            next_number: 1,
            pc: ENTRY,
            program: vec!["mov    eax, 0x1".to_string(), "nop".to_string()],
            values: HashMap::new(),
            handler: None,
        }
    }

    fn respond(&mut self, token: &str, command: &str) -> Vec<String> {
        self.commands.push(command.to_string());

        let lines = match self.handler.as_mut().and_then(|handler| handler(command)) {
            Some(lines) => lines,
            None => self.default_reply(command),
        };
        if lines.is_empty() {
            return lines;
        }
        let mut lines: Vec<String> = lines
            .into_iter()
            .map(|line| if line.starts_with('^') { format!("{token}{line}") } else { line })
            .collect();
        if !lines.iter().any(|line| line == "(gdb)") {
            lines.push("(gdb)".to_string());
        }
        lines
    }

    fn default_reply(&mut self, command: &str) -> Vec<String> {
        if let Some(expression) = command.strip_prefix("-data-evaluate-expression ") {
            return self.evaluate(&unquote(expression));
        }
        if command == "-break-list" {
            return vec![self.breakpoint_table()];
        }
        if let Some(location) = command.strip_prefix("-break-insert ") {
            let (hardware, location) = match location.strip_prefix("-h ") {
                Some(rest) => (true, rest),
                None => (false, location),
            };
            let addr = location.trim_start_matches('*').to_string();
            let number = self.add_row(
                if hardware { "hw breakpoint" } else { "breakpoint" },
                Some(addr.clone()),
                None,
            );
            return vec![format!("^done,bkpt={{number=\"{number}\",type=\"breakpoint\",addr=\"{addr}\"}}")];
        }
        if let Some(args) = command.strip_prefix("-break-watch ") {
            let (breakpoint_type, key, location) = if let Some(rest) = args.strip_prefix("-r ") {
                ("read watchpoint", "hw-rwpt", rest)
            } else if let Some(rest) = args.strip_prefix("-a ") {
                ("acc watchpoint", "hw-awpt", rest)
            } else {
                ("hw watchpoint", "wpt", args)
            };
            let what = unquote(location);
            let number = self.add_row(breakpoint_type, None, Some(what.clone()));
            return vec![format!("^done,{key}={{number=\"{number}\",exp=\"{what}\"}}")];
        }
        if let Some(number) = command.strip_prefix("-break-delete ") {
            let before = self.rows.len();
            self.rows.retain(|row| row.number != number);
            if self.rows.len() == before {
                return vec![format!("^error,msg=\"No breakpoint number {number}.\"")];
            }
            return vec!["^done".to_string()];
        }
        if let Some(args) = command.strip_prefix("-break-condition ") {
            let (number, condition) = args.split_once(' ').unwrap_or((args, ""));
            if let Some(row) = self.rows.iter_mut().find(|row| row.number == number) {
                row.condition = Some(condition.to_string());
            }
            return vec!["^done".to_string()];
        }
        match command {
            "c&" | "continue&" => running(),
            "stepi&" | "nexti&" => {
                self.pc += 2;
                let mut lines = running();
                lines.push("(gdb)".to_string());
                lines.push(format!(
                    "*stopped,reason=\"end-stepping-range\",frame={{addr=\"{:#x}\"}},thread-id=\"1\"",
                    self.pc
                ));
                lines
            }
            "interrupt" => vec![
                "^done".to_string(),
                "(gdb)".to_string(),
                sigint_stop(),
            ],
            "x/i $pc" => {
                let step = ((self.pc - ENTRY) / 2) as usize;
                let text = &self.program[step % self.program.len()];
                vec![
                    console(&format!("=> {:#x} <main+{}>:\t{}\n", self.pc, self.pc - ENTRY, text)),
                    "^done".to_string(),
                ]
            }
            "-data-list-register-names" => {
                vec!["^done,register-names=[\"rax\",\"rbx\",\"rip\"]".to_string()]
            }
            "-data-list-register-values x" => vec![format!(
                "^done,register-values=[{{number=\"0\",value=\"0x1\"}},{{number=\"1\",value=\"0x2\"}},{{number=\"2\",value=\"{:#x}\"}}]",
                self.pc
            )],
            _ => vec!["^done".to_string()],
        }
    }

    fn evaluate(&self, expression: &str) -> Vec<String> {
        let inner = expression
            .strip_prefix("(void*)(")
            .and_then(|rest| rest.strip_suffix(')'));
        match inner {
            Some("$pc") => vec![format!("^done,value=\"{:#x} <main+{}>\"", self.pc, self.pc - ENTRY)],
            Some("main") => vec![format!("^done,value=\"{ENTRY:#x} <main>\"")],
            Some(inner) if inner.starts_with("0x") => vec![format!("^done,value=\"{inner}\"")],
            Some(inner) => vec![format!("^error,msg=\"No symbol \\\"{inner}\\\" in current context.\"")],
            None => {
                let value = self.values.get(expression).map_or("0", String::as_str);
                vec![format!("^done,value=\"{value}\"")]
            }
        }
    }

    fn add_row(&mut self, breakpoint_type: &str, addr: Option<String>, what: Option<String>) -> String {
        let number = self.next_number.to_string();
        self.next_number += 1;
        self.rows.push(Row {
            number: number.clone(),
            breakpoint_type: breakpoint_type.to_string(),
            addr,
            what,
            condition: None,
        });
        number
    }

    fn breakpoint_table(&self) -> String {
        let body: Vec<String> = self
            .rows
            .iter()
            .map(|row| {
                let mut fields = vec![
                    format!("number=\"{}\"", row.number),
                    format!("type=\"{}\"", row.breakpoint_type),
                    "disp=\"keep\"".to_string(),
                    "enabled=\"y\"".to_string(),
                ];
                if let Some(addr) = &row.addr {
                    fields.push(format!("addr=\"{addr}\""));
                }
                if let Some(what) = &row.what {
                    fields.push(format!("what=\"{what}\""));
                }
                if let Some(condition) = &row.condition {
                    fields.push(format!("cond=\"{condition}\""));
                }
                fields.push("times=\"0\"".to_string());
                format!("bkpt={{{}}}", fields.join(","))
            })
            .collect();
        format!(
            "^done,BreakpointTable={{nr_rows=\"{}\",nr_cols=\"6\",hdr=[],body=[{}]}}",
            self.rows.len(),
            body.join(",")
        )
    }

    /// Breakpoint types in table order
    pub fn breakpoint_types(&self) -> Vec<String> {
        self.rows.iter().map(|row| row.breakpoint_type.clone()).collect()
    }

    pub fn breakpoint_conditions(&self) -> Vec<Option<String>> {
        self.rows.iter().map(|row| row.condition.clone()).collect()
    }
}

fn running() -> Vec<String> {
    vec!["^running".to_string(), "*running,thread-id=\"all\"".to_string()]
}

pub fn sigint_stop() -> String {
    "*stopped,reason=\"signal-received\",signal-name=\"SIGINT\",thread-id=\"1\"".to_string()
}

pub fn console(text: &str) -> String {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\t', "\\t");
    format!("~\"{escaped}\"")
}

/// Strip MI quoting from a single argument
pub fn unquote(text: &str) -> String {
    let Some(inner) = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) else {
        return text.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Token and command text of one line the session wrote
fn split_command(line: &str) -> (String, String) {
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    let (token, rest) = line.split_at(digits);
    let command = match rest.strip_prefix("-interpreter-exec console ") {
        Some(quoted) => unquote(quoted),
        None => rest.to_string(),
    };
    (token.to_string(), command)
}

pub struct FakeGdb {
    pub session: DebugSession,
    pub state: Arc<Mutex<FakeState>>,
    inject: mpsc::UnboundedSender<String>,
    pub runtime_dir: PathBuf,
}

impl FakeGdb {
    /// Connected session without an inferior
    pub async fn connect() -> FakeGdb {
        let runtime_dir = std::env::temp_dir().join(format!(
            "gdbcore-it-{}-{}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::SeqCst)
        ));
        let config = CoreConfig {
            runtime_dir: runtime_dir.clone(),
            prompt_timeout_ms: 2_000,
            ..CoreConfig::default()
        };
        let session = DebugSession::new(config);

        let (ours, theirs) = tokio::io::duplex(1 << 16);
        let (session_read, session_write) = tokio::io::split(theirs);
        let transport = Transport::from_streams(session_read, session_write);

        let state = Arc::new(Mutex::new(FakeState::new()));
        let (inject, injected) = mpsc::unbounded_channel();
        tokio::spawn(serve(ours, state.clone(), injected));

        session.connect(transport).await.unwrap();
        FakeGdb {
            session,
            state,
            inject,
            runtime_dir,
        }
    }

    /// Connected session controlling the fake inferior
    pub async fn attached() -> FakeGdb {
        let fake = FakeGdb::connect().await;
        fake.session.adopt_inferior(PID).await.unwrap();
        fake
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: FnMut(&str) -> Option<Vec<String>> + Send + 'static,
    {
        self.state.lock().unwrap().handler = Some(Box::new(handler));
    }

    /// Write raw output lines as if the debugger printed them
    pub fn emit(&self, line: &str) {
        self.inject.send(line.to_string()).unwrap();
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Wait until the fake has received a command starting with `prefix`
    pub async fn wait_for_command(&self, prefix: &str) {
        for _ in 0..200 {
            if self.commands().iter().any(|c| c.starts_with(prefix)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("command {prefix:?} never arrived");
    }
}

impl Drop for FakeGdb {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.runtime_dir);
    }
}

async fn serve(
    stream: tokio::io::DuplexStream,
    state: Arc<Mutex<FakeState>>,
    mut injected: mpsc::UnboundedReceiver<String>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    if writer.write_all(b"(gdb)\n").await.is_err() {
        return;
    }

    let mut pending = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let output = tokio::select! {
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let mut output = Vec::new();
                for byte in &buf[..n] {
                    match byte {
                        0x03 => {
                            state.lock().unwrap().commands.push("<ctrl-c>".to_string());
                            output.push(sigint_stop());
                            output.push("(gdb)".to_string());
                        }
                        b'\n' => {
                            let line = String::from_utf8_lossy(&pending).into_owned();
                            pending.clear();
                            let (token, command) = split_command(&line);
                            output.extend(state.lock().unwrap().respond(&token, &command));
                        }
                        other => pending.push(*other),
                    }
                }
                output
            }
            Some(line) = injected.recv() => vec![line],
        };
        for line in output {
            if writer.write_all(format!("{line}\n").as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
