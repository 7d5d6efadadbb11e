/// Inferior inspection
///
/// Floating point registers, register flags, stack frames, threads and symbol
/// lookups. Most of these read console output of the debugger; the raw stack
/// words come straight from the inferior's memory file.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::procfs;
use crate::session::{parse_hex, DebugSession, DisassembledInstruction};
use crate::types::InferiorArch;
use crate::{CoreError, Result};

static FRAME_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"#(\d+)\s+").expect("valid regex"));
static FRAME_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"frame\s+at\s+(0x[0-9a-fA-F]+)").expect("valid regex"));
static SAVED_RETURN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"saved.*=\s+(0x[0-9a-fA-F]+)").expect("valid regex"));
static CURRENT_THREAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\s+\d+\s+(.*)").expect("valid regex"));
static NON_DEBUGGING_FUNCTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(0x[0-9a-fA-F]+)\s+(.*)").expect("valid regex"));

/// Bit of each flag in `eflags`
pub const FLAGS: [(&str, u32); 9] = [
    ("cf", 0),
    ("pf", 2),
    ("af", 4),
    ("zf", 6),
    ("sf", 7),
    ("tf", 8),
    ("if", 9),
    ("df", 10),
    ("of", 11),
];

const FLOAT_REGISTER_COUNT: usize = 8;
const STACK_DUMP_SIZE: u64 = 4096;
/// Bytes shown for a stack word that points at readable memory
const POINTED_TEXT_SIZE: usize = 20;
/// Upper bound on the size of one instruction when disassembling around an address
const MAX_INSTRUCTION_SIZE: u64 = 30;

/// Flag registers as `"0"`/`"1"` strings
pub fn flag_registers(eflags: u64) -> BTreeMap<String, String> {
    FLAGS
        .iter()
        .map(|(name, bit)| (name.to_string(), ((eflags >> bit) & 1).to_string()))
        .collect()
}

/// `eflags` with one flag changed; `None` for an unknown flag
pub fn with_flag(eflags: u64, flag: &str, set: bool) -> Option<u64> {
    let (_, bit) = FLAGS.iter().find(|(name, _)| *name == flag)?;
    Some(if set {
        eflags | (1 << bit)
    } else {
        eflags & !(1 << bit)
    })
}

/// One frame of the backtrace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTraceEntry {
    /// Return address with symbol, `<>` when the frame has none
    pub return_address: String,
    /// Frame start and its distance from the stack pointer, e.g. `0x7ffe1e989a40(rsp+0x100)`
    pub frame_address: String,
}

/// One pointer-sized word of the stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEntry {
    /// Address and offset from the stack pointer, e.g. `0x7ffd0d232f88(rsp+0xff8)`
    pub location: String,
    pub value: String,
    /// `(ptr)<symbol>`, `(str)text` or empty if the word is not a valid pointer
    pub pointer_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSymbol {
    /// Missing for functions with debug information
    pub address: Option<u64>,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionLocation {
    Next,
    Previous,
}

/// Highest frame number in `bt` output
fn max_frame(backtrace: &str) -> Option<usize> {
    FRAME_NUMBER
        .captures_iter(backtrace)
        .last()
        .and_then(|caps| caps[1].parse().ok())
}

fn frame_address(frame_info: &str) -> Option<u64> {
    FRAME_ADDRESS
        .captures(frame_info)
        .and_then(|caps| parse_hex(&caps[1]))
}

fn saved_return_address(frame_info: &str) -> Option<String> {
    SAVED_RETURN
        .captures(frame_info)
        .map(|caps| caps[1].to_string())
}

fn parse_function_list(output: &str) -> Vec<FunctionSymbol> {
    output
        .lines()
        .filter_map(|line| {
            if let Some(caps) = NON_DEBUGGING_FUNCTION.captures(line) {
                return Some(FunctionSymbol {
                    address: parse_hex(&caps[1]),
                    name: caps[2].to_string(),
                });
            }
            line.strip_suffix(';').map(|defined| FunctionSymbol {
                address: None,
                name: defined.to_string(),
            })
        })
        .collect()
}

/// Instruction `count` steps away from the start or end of a disassembly
fn pick_instruction(
    instructions: &[DisassembledInstruction],
    location: InstructionLocation,
    count: usize,
) -> Option<u64> {
    let instruction = match location {
        InstructionLocation::Next => instructions.get(count),
        InstructionLocation::Previous => instructions
            .len()
            .checked_sub(count)
            .and_then(|index| instructions.get(index)),
    };
    instruction.and_then(DisassembledInstruction::address_value)
}

fn stack_pointer_name(arch: InferiorArch) -> &'static str {
    match arch {
        InferiorArch::X64 => "rsp",
        InferiorArch::X86 => "esp",
    }
}

impl DebugSession {
    /// `st0`-`st7` and `xmm0`-`xmm7`, the latter as `v4_float`
    pub async fn read_float_registers(&self) -> Result<BTreeMap<String, String>> {
        if let Some(payload) = self
            .companion_call(
                "read_float_registers",
                json!(null),
                "tracehound-read-float-registers",
            )
            .await?
        {
            if let Ok(registers) = serde_json::from_value(payload) {
                return Ok(registers);
            }
            log::warn!("bad float register reply from companion");
        }

        let mut registers = BTreeMap::new();
        for index in 0..FLOAT_REGISTER_COUNT {
            let name = format!("st{index}");
            if let Some(value) = self.parse_and_eval(&format!("${name}")).await? {
                registers.insert(name, value);
            }
        }
        for index in 0..FLOAT_REGISTER_COUNT {
            let name = format!("xmm{index}");
            if let Some(value) = self.parse_and_eval(&format!("${name}.v4_float")).await? {
                registers.insert(name, value);
            }
        }
        Ok(registers)
    }

    /// Assign `value` to the convenience variable or register `$variable`
    pub async fn set_convenience_variable(&self, variable: &str, value: &str) -> Result<()> {
        let response = self.execute(&format!("set ${variable}={value}")).await?;
        match response.error_message() {
            Some(msg) => Err(CoreError::CommandError(msg.to_string())),
            None => Ok(()),
        }
    }

    /// Set or clear one flag of `eflags`; false for an unknown flag
    pub async fn set_register_flag(&self, flag: &str, set: bool) -> Result<bool> {
        let registers = self.read_registers().await?;
        let eflags = match registers.get("eflags").and_then(|v| parse_hex(v)) {
            Some(eflags) => eflags,
            None => FLAGS
                .iter()
                .filter(|(name, _)| registers.get(*name).is_some_and(|v| v == "1"))
                .fold(0, |acc, (_, bit)| acc | (1 << bit)),
        };
        let Some(eflags) = with_flag(eflags, flag, set) else {
            log::warn!("{} is not a register flag", flag);
            return Ok(false);
        };
        self.set_convenience_variable("eflags", &format!("{eflags:#x}"))
            .await?;
        Ok(true)
    }

    async fn stack_pointer(&self) -> Result<Option<u64>> {
        let name = stack_pointer_name(self.arch());
        Ok(self.examine_expression(&format!("${name}")).await?.address)
    }

    /// `info frame` output of every frame in the backtrace
    async fn frame_infos(&self) -> Result<Vec<String>> {
        let backtrace = self.execute("bt").await?;
        let Some(max) = max_frame(&backtrace.console) else {
            return Ok(Vec::new());
        };
        let mut frames = Vec::with_capacity(max + 1);
        for index in 0..=max {
            let response = self.execute(&format!("info frame {index}")).await?;
            if response.is_error() {
                break;
            }
            frames.push(response.console);
        }
        Ok(frames)
    }

    async fn return_address_info(&self, frame_info: &str) -> Result<String> {
        let Some(address) = saved_return_address(frame_info) else {
            return Ok("<>".to_string());
        };
        let info = self.examine_expression(&address).await?;
        Ok(info.all.unwrap_or(address))
    }

    pub async fn get_stacktrace_info(&self) -> Result<Vec<StackTraceEntry>> {
        self.require_process()?;
        let sp_name = stack_pointer_name(self.arch());
        let Some(sp) = self.stack_pointer().await? else {
            log::warn!("can't read ${}", sp_name);
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for frame_info in self.frame_infos().await? {
            let Some(frame) = frame_address(&frame_info) else {
                break;
            };
            entries.push(StackTraceEntry {
                return_address: self.return_address_info(&frame_info).await?,
                frame_address: format!("{frame:#x}({sp_name}+{:#x})", frame.wrapping_sub(sp)),
            });
        }
        Ok(entries)
    }

    pub async fn get_stack_frame_return_addresses(&self) -> Result<Vec<String>> {
        self.require_process()?;
        let mut addresses = Vec::new();
        for frame_info in self.frame_infos().await? {
            addresses.push(self.return_address_info(&frame_info).await?);
        }
        Ok(addresses)
    }

    /// `info frame` output for frame `index`; `None` if there is no such frame
    pub async fn get_stack_frame_info(&self, index: usize) -> Result<Option<String>> {
        self.require_process()?;
        let backtrace = self.execute("bt").await?;
        match max_frame(&backtrace.console) {
            Some(max) if index <= max => {
                Ok(Some(self.execute(&format!("info frame {index}")).await?.console))
            }
            _ => {
                log::warn!("frame {} doesn't exist", index);
                Ok(None)
            }
        }
    }

    /// The first page of the stack, one entry per pointer-sized word
    pub async fn get_stack_info(&self) -> Result<Vec<StackEntry>> {
        self.require_process()?;
        let arch = self.arch();
        let sp_name = stack_pointer_name(arch);
        let Some(sp) = self.stack_pointer().await? else {
            log::warn!("can't read ${}", sp_name);
            return Ok(Vec::new());
        };
        let handle = match self.memory_handle() {
            Ok(handle) => handle,
            Err(CoreError::Io(e)) => {
                log::warn!("can't open memory of {}: {}", self.pid(), e);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let chunk = arch.pointer_size();
        let mut words = Vec::new();
        for offset in (0..STACK_DUMP_SIZE).step_by(chunk as usize) {
            let Some(value) = handle.read_pointer(sp.wrapping_add(offset), arch) else {
                log::debug!("stack unreadable after {:#x}", sp.wrapping_add(offset));
                break;
            };
            let text = handle.read_bytes(value, POINTED_TEXT_SIZE);
            words.push((offset, value, text));
        }

        let pointers: Vec<String> = words
            .iter()
            .filter(|(_, _, text)| text.is_some())
            .map(|(_, value, _)| format!("{value:#x}"))
            .collect();
        let mut symbols = self.examine_expressions(&pointers).await?.into_iter();

        Ok(words
            .into_iter()
            .map(|(offset, value, text)| {
                let pointer_info = match text {
                    None => String::new(),
                    Some(text) => match symbols.next().and_then(|info| info.symbol) {
                        Some(symbol) => format!("(ptr){symbol}"),
                        None => format!("(str){}", String::from_utf8_lossy(&text)),
                    },
                };
                StackEntry {
                    location: format!("{:#x}({sp_name}+{offset:#x})", sp.wrapping_add(offset)),
                    value: format!("{value:#x}"),
                    pointer_info,
                }
            })
            .collect())
    }

    /// The `info threads` line of the selected thread
    pub async fn get_thread_info(&self) -> Result<Option<String>> {
        let response = self.execute("info threads").await?;
        Ok(CURRENT_THREAD
            .captures(&response.console)
            .map(|caps| caps[1].trim_end().to_string()))
    }

    /// Functions matching `expression`, as listed by `info functions`
    pub async fn search_functions(
        &self,
        expression: &str,
        case_sensitive: bool,
    ) -> Result<Vec<FunctionSymbol>> {
        let sensitivity = if case_sensitive { "on" } else { "off" };
        self.execute(&format!("set case-sensitive {sensitivity}"))
            .await?;
        let response = self.execute(&format!("info functions {expression}")).await;
        self.execute("set case-sensitive auto").await?;
        let response = response?;
        if let Some(msg) = response.error_message() {
            log::warn!("function search for {:?} failed: {}", expression, msg);
            return Ok(Vec::new());
        }
        Ok(parse_function_list(&response.console))
    }

    /// Output of `info symbol`
    pub async fn get_address_info(&self, expression: &str) -> Result<String> {
        Ok(self
            .execute(&format!("info symbol {expression}"))
            .await?
            .console)
    }

    /// Output of `info address`
    pub async fn get_symbol_info(&self, expression: &str) -> Result<String> {
        Ok(self
            .execute(&format!("info address {expression}"))
            .await?
            .console)
    }

    /// Address of the instruction `count` instructions before or after `address`.
    /// Falls back to the boundary of the enclosing region when the disassembly
    /// runs out; `None` if `address` is not mapped.
    pub async fn find_closest_instruction_address(
        &self,
        address: u64,
        location: InstructionLocation,
        count: usize,
    ) -> Result<Option<u64>> {
        let pid = self.require_process()?;
        let span = MAX_INSTRUCTION_SIZE.saturating_mul(count as u64);
        let instructions = match location {
            InstructionLocation::Next => {
                self.disassemble(&format!("{address:#x}"), &format!("+{span}"))
                    .await?
            }
            InstructionLocation::Previous => {
                self.disassemble(
                    &format!("{:#x}", address.saturating_sub(span)),
                    &format!("{address:#x}"),
                )
                .await?
            }
        };
        if let Some(found) = pick_instruction(&instructions, location, count) {
            return Ok(Some(found));
        }

        let region = procfs::regions(pid)
            .ok()
            .and_then(|regions| regions.into_iter().find(|r| r.contains(address)));
        let Some(region) = region else {
            log::warn!("{:#x} is not mapped", address);
            return Ok(None);
        };
        match location {
            InstructionLocation::Next => Ok(Some(region.end)),
            InstructionLocation::Previous if instructions.is_empty() => {
                let from_start = self
                    .disassemble(&format!("{:#x}", region.start), &format!("{address:#x}"))
                    .await?;
                Ok(Some(
                    pick_instruction(&from_start, location, count).unwrap_or(region.start),
                ))
            }
            InstructionLocation::Previous => Ok(Some(region.start)),
        }
    }
}
