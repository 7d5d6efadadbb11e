/// Code dissection
///
/// Disassembles memory regions and indexes which addresses are referenced by
/// jumps, calls and other instructions. Results are staged per region and
/// merged into the persistent index only once a region is fully scanned, so a
/// cancelled scan never leaves half a region behind.

use capstone::prelude::*;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::memory::{MemoryHandle, ValueIndex, ValueType};
use crate::procfs;
use crate::session::{parse_hex, text_matcher, DebugSession};
use crate::types::InferiorArch;
use crate::{lock, CoreError, Result};

/// Bytes disassembled at once
const BUFFER_SIZE: u64 = 0x10000;
/// Instructions dropped at a buffer end, they may be cut
const OVERLAP_INSTRUCTIONS: usize = 4;

const STRINGS_FILE: &str = "referenced_strings.json";
const JUMPS_FILE: &str = "referenced_jumps.json";
const CALLS_FILE: &str = "referenced_calls.json";

static VALID_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\s+|\[|,)0x[0-9a-fA-F]+(\s+|\]|,|$)").expect("valid regex"));
static HEX_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("valid regex"));
static RIP_RELATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"rip\s*([+-])\s*(0x[0-9a-fA-F]+)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub size: usize,
    pub mnemonic: String,
    pub operands: String,
}

impl Instruction {
    fn text(&self) -> String {
        format!("{} {}", self.mnemonic, self.operands)
    }
}

/// Turns machine code into instructions
pub trait Disassembler {
    fn disassemble(&self, code: &[u8], address: u64) -> Vec<Instruction>;
}

/// x86 disassembler on capstone with RIP-relative operands made absolute
pub struct CapstoneDisassembler {
    cs: Capstone,
}

impl CapstoneDisassembler {
    pub fn new(target: InferiorArch) -> std::result::Result<Self, capstone::Error> {
        let mode = match target {
            InferiorArch::X64 => arch::x86::ArchMode::Mode64,
            InferiorArch::X86 => arch::x86::ArchMode::Mode32,
        };
        Ok(CapstoneDisassembler {
            cs: Capstone::new()
                .x86()
                .mode(mode)
                .syntax(arch::x86::ArchSyntax::Intel)
                .build()?,
        })
    }
}

impl Disassembler for CapstoneDisassembler {
    fn disassemble(&self, code: &[u8], address: u64) -> Vec<Instruction> {
        let mut instructions = Vec::new();
        let mut offset = 0usize;
        // Capstone stops at undecodable bytes; skip them one at a time
        while offset < code.len() {
            let decoded = match self.cs.disasm_all(&code[offset..], address + offset as u64) {
                Ok(decoded) => decoded,
                Err(_) => break,
            };
            let before = instructions.len();
            for insn in decoded.iter() {
                let size = insn.bytes().len();
                let next = insn.address() + size as u64;
                let operands = insn.op_str().unwrap_or_default();
                instructions.push(Instruction {
                    address: insn.address(),
                    size,
                    mnemonic: insn.mnemonic().unwrap_or_default().to_string(),
                    operands: absolute_rip_operands(operands, next),
                });
            }
            offset = match instructions[before..].last() {
                Some(last) => (last.address - address) as usize + last.size,
                None => offset + 1,
            };
        }
        instructions
    }
}

fn absolute_rip_operands(operands: &str, next_address: u64) -> String {
    RIP_RELATIVE
        .replace_all(operands, |caps: &regex::Captures| {
            let displacement = parse_hex(&caps[2]).unwrap_or(0);
            let target = if &caps[1] == "+" {
                next_address.wrapping_add(displacement)
            } else {
                next_address.wrapping_sub(displacement)
            };
            format!("{target:#x}")
        })
        .into_owned()
}

/// The three cross-reference stores
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XrefIndex {
    /// Referenced address to the referring instruction addresses
    pub strings: BTreeMap<u64, BTreeSet<u64>>,
    /// Jump target to its referrers and their mnemonics
    pub jumps: BTreeMap<u64, BTreeMap<u64, String>>,
    pub calls: BTreeMap<u64, BTreeSet<u64>>,
}

impl XrefIndex {
    pub fn load(dir: &Path) -> io::Result<Self> {
        Ok(XrefIndex {
            strings: load_store(&dir.join(STRINGS_FILE))?,
            jumps: load_store(&dir.join(JUMPS_FILE))?,
            calls: load_store(&dir.join(CALLS_FILE))?,
        })
    }

    pub fn save(&self, dir: &Path) -> io::Result<()> {
        save_store(&dir.join(STRINGS_FILE), &self.strings)?;
        save_store(&dir.join(JUMPS_FILE), &self.jumps)?;
        save_store(&dir.join(CALLS_FILE), &self.calls)
    }

    fn merge(&mut self, other: XrefIndex) {
        for (target, referrers) in other.strings {
            self.strings.entry(target).or_default().extend(referrers);
        }
        for (target, referrers) in other.jumps {
            self.jumps.entry(target).or_default().extend(referrers);
        }
        for (target, referrers) in other.calls {
            self.calls.entry(target).or_default().extend(referrers);
        }
    }

    fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.jumps.is_empty() && self.calls.is_empty()
    }
}

fn load_store<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> io::Result<T> {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e),
    }
}

/// Replace `path` atomically so readers never see a partial store
fn save_store<T: Serialize>(path: &Path, store: &T) -> io::Result<()> {
    let data = serde_json::to_vec(store).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, data)?;
    fs::rename(staging, path)
}

/// Progress of the running or last scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DissectStatus {
    pub running: bool,
    /// `start-end` of the region being scanned
    pub current_region: String,
    /// `N / M`
    pub region_progress: String,
    /// `start-end` of the buffer being scanned
    pub current_range: String,
    pub string_count: usize,
    pub jump_count: usize,
    pub call_count: usize,
}

/// A referenced string found by `search_referenced_strings`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencedString {
    pub address: u64,
    pub reference_count: usize,
    pub value: String,
}

/// State of the indexer for one inferior
pub(crate) struct Dissector {
    dir: Mutex<Option<PathBuf>>,
    index: Arc<Mutex<XrefIndex>>,
    status: Arc<Mutex<DissectStatus>>,
    cancel: Arc<AtomicBool>,
}

impl Dissector {
    pub fn new() -> Self {
        Dissector {
            dir: Mutex::new(None),
            index: Arc::new(Mutex::new(XrefIndex::default())),
            status: Arc::new(Mutex::new(DissectStatus::default())),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load the index kept in `dir`, empty if there is none yet
    pub fn open_index(&self, dir: &Path) -> io::Result<()> {
        let index = XrefIndex::load(dir)?;
        *lock(&self.status) = DissectStatus {
            string_count: index.strings.len(),
            jump_count: index.jumps.len(),
            call_count: index.calls.len(),
            ..DissectStatus::default()
        };
        *lock(&self.index) = index;
        *lock(&self.dir) = Some(dir.to_path_buf());
        Ok(())
    }

    pub fn close_index(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        *lock(&self.dir) = None;
        *lock(&self.index) = XrefIndex::default();
    }

    fn is_running(&self) -> bool {
        lock(&self.status).running
    }
}

/// How a scan ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanOutcome {
    Completed,
    Canceled,
}

/// Scan `regions` and merge every fully scanned region into `index`.
///
/// `commit` runs after each merge, with the index still locked.
#[allow(clippy::too_many_arguments)]
pub(crate) fn scan_regions(
    memory: &MemoryHandle,
    disassembler: &dyn Disassembler,
    regions: &[(u64, u64)],
    discard_invalid_strings: bool,
    index: &Mutex<XrefIndex>,
    status: &Mutex<DissectStatus>,
    cancel: &AtomicBool,
    commit: &dyn Fn(&XrefIndex),
) -> ScanOutcome {
    for (region_number, (start, end)) in regions.iter().enumerate() {
        {
            let mut status = lock(status);
            status.current_region = format!("{start:x}-{end:x}");
            status.region_progress = format!("{} / {}", region_number + 1, regions.len());
        }
        let Some(staged) = scan_region(memory, disassembler, *start, *end, discard_invalid_strings, index, status, cancel)
        else {
            let index = lock(index);
            update_counts(status, &index, None);
            return ScanOutcome::Canceled;
        };
        let mut index = lock(index);
        if !staged.is_empty() {
            index.merge(staged);
            commit(&index);
        }
        update_counts(status, &index, None);
    }
    ScanOutcome::Completed
}

fn update_counts(status: &Mutex<DissectStatus>, index: &XrefIndex, staged: Option<&XrefIndex>) {
    let (strings, jumps, calls) = match staged {
        Some(staged) => (
            staged.strings.keys().filter(|k| !index.strings.contains_key(k)).count(),
            staged.jumps.keys().filter(|k| !index.jumps.contains_key(k)).count(),
            staged.calls.keys().filter(|k| !index.calls.contains_key(k)).count(),
        ),
        None => (0, 0, 0),
    };
    let mut status = lock(status);
    status.string_count = index.strings.len() + strings;
    status.jump_count = index.jumps.len() + jumps;
    status.call_count = index.calls.len() + calls;
}

/// References of one region; `None` when cancelled
#[allow(clippy::too_many_arguments)]
fn scan_region(
    memory: &MemoryHandle,
    disassembler: &dyn Disassembler,
    mut start: u64,
    end: u64,
    discard_invalid_strings: bool,
    index: &Mutex<XrefIndex>,
    status: &Mutex<DissectStatus>,
    cancel: &AtomicBool,
) -> Option<XrefIndex> {
    let mut staged = XrefIndex::default();
    while start < end {
        if cancel.load(Ordering::SeqCst) {
            return None;
        }
        let remaining = end - start;
        let last_buffer = remaining <= BUFFER_SIZE;
        let length = remaining.min(BUFFER_SIZE);
        lock(status).current_range = format!("{:x}-{:x}", start, start + length);

        let Some(code) = memory.read_bytes(start, length as usize) else {
            log::debug!("region at {:#x} became unreadable", start);
            break;
        };
        let mut instructions = disassembler.disassemble(&code, start);
        let mut next = start + length;
        if !last_buffer && instructions.len() > OVERLAP_INSTRUCTIONS {
            let resume = instructions[instructions.len() - OVERLAP_INSTRUCTIONS].address;
            if resume > start {
                next = resume;
                instructions.truncate(instructions.len() - OVERLAP_INSTRUCTIONS);
            }
        }

        for instruction in &instructions {
            record_reference(memory, instruction, discard_invalid_strings, &mut staged);
        }
        update_counts(status, &lock(index), Some(&staged));
        start = next;
    }
    Some(staged)
}

fn record_reference(
    memory: &MemoryHandle,
    instruction: &Instruction,
    discard_invalid_strings: bool,
    staged: &mut XrefIndex,
) {
    let text = instruction.text();
    let Some(found) = VALID_ADDRESS.find(&text) else {
        return;
    };
    let Some(target) = HEX_NUMBER.find(found.as_str()).and_then(|m| parse_hex(m.as_str())) else {
        return;
    };
    let mnemonic = instruction.mnemonic.to_lowercase();

    if mnemonic.starts_with('j') || mnemonic.starts_with("loop") {
        if is_memory_valid(memory, target, false) {
            staged
                .jumps
                .entry(target)
                .or_default()
                .insert(instruction.address, mnemonic);
        }
    } else if mnemonic.starts_with("call") {
        if is_memory_valid(memory, target, false) {
            staged.calls.entry(target).or_default().insert(instruction.address);
        }
    } else if is_memory_valid(memory, target, discard_invalid_strings) {
        staged.strings.entry(target).or_default().insert(instruction.address);
    }
}

/// Whether `address` is readable and, when asked, starts a UTF-8 string
fn is_memory_valid(memory: &MemoryHandle, address: u64, require_text: bool) -> bool {
    if !require_text {
        return memory.read_bytes(address, 1).is_some();
    }
    let Some(data) = memory.read_bytes(address, 32) else {
        return false;
    };
    if data.first() == Some(&0) {
        return false;
    }
    let text = data.split(|b| *b == 0).next().unwrap_or_default();
    match std::str::from_utf8(text) {
        Ok(_) => true,
        // Cut at the read boundary, not invalid
        Err(e) => e.error_len().is_none(),
    }
}

impl DebugSession {
    /// Index jumps, calls and data references in `regions` (`(start, end)` pairs).
    ///
    /// Blocks until the scan finishes or `cancel_dissect_code` is called;
    /// returns false when cancelled.
    pub async fn dissect_code(&self, regions: &[(u64, u64)], discard_invalid_strings: bool) -> Result<bool> {
        let pid = self.require_process()?;
        let dissector = &self.inner.dissector;
        let Some(dir) = lock(&dissector.dir).clone() else {
            return Err(CoreError::NoProcess);
        };
        {
            let mut status = lock(&dissector.status);
            if status.running {
                return Err(CoreError::DissectActive);
            }
            status.running = true;
        }
        dissector.cancel.store(false, Ordering::SeqCst);

        let arch = self.arch();
        let regions = regions.to_vec();
        let index = dissector.index.clone();
        let status = dissector.status.clone();
        let cancel = dissector.cancel.clone();
        let task = tokio::task::spawn_blocking(move || -> io::Result<ScanOutcome> {
            let memory = MemoryHandle::open(&procfs::mem_path(pid))?;
            let disassembler = CapstoneDisassembler::new(arch)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            let commit = |index: &XrefIndex| {
                if let Err(e) = index.save(&dir) {
                    log::error!("failed to persist cross-reference index: {}", e);
                }
            };
            Ok(scan_regions(
                &memory,
                &disassembler,
                &regions,
                discard_invalid_strings,
                &index,
                &status,
                &cancel,
                &commit,
            ))
        });
        let outcome = task.await;
        lock(&dissector.status).running = false;

        match outcome {
            Ok(Ok(outcome)) => {
                log::info!("dissect code: {:?}", outcome);
                Ok(outcome == ScanOutcome::Completed)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string()).into()),
        }
    }

    pub fn dissect_code_status(&self) -> DissectStatus {
        lock(&self.inner.dissector.status).clone()
    }

    /// Stop the running scan after the current buffer
    pub fn cancel_dissect_code(&self) {
        if self.inner.dissector.is_running() {
            self.inner.dissector.cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Snapshot of the cross-reference index
    pub fn dissect_code_data(&self) -> XrefIndex {
        lock(&self.inner.dissector.index).clone()
    }

    /// Referenced strings matching `text`; `None` for an invalid regex
    pub fn search_referenced_strings(
        &self,
        text: &str,
        value_index: ValueIndex,
        case_sensitive: bool,
        use_regex: bool,
    ) -> Result<Option<Vec<ReferencedString>>> {
        let pid = self.require_process()?;
        let Some(matcher) = text_matcher(text, case_sensitive, use_regex) else {
            return Ok(None);
        };
        let references: Vec<(u64, usize)> = lock(&self.inner.dissector.index)
            .strings
            .iter()
            .map(|(address, referrers)| (*address, referrers.len()))
            .collect();
        let Ok(memory) = MemoryHandle::open(&procfs::mem_path(pid)) else {
            return Ok(Some(Vec::new()));
        };
        let value_type = ValueType::new(value_index).with_length(100);
        Ok(Some(
            references
                .into_iter()
                .filter_map(|(address, reference_count)| {
                    let value = memory.read_value(address, &value_type)?.to_string();
                    (!value.is_empty() && matcher.is_match(&value)).then_some(ReferencedString {
                        address,
                        reference_count,
                        value,
                    })
                })
                .collect(),
        ))
    }

    /// Referenced call targets whose symbol matches `text`, with their reference counts
    pub async fn search_referenced_calls(
        &self,
        text: &str,
        case_sensitive: bool,
        use_regex: bool,
    ) -> Result<Option<Vec<(String, usize)>>> {
        let Some(matcher) = text_matcher(text, case_sensitive, use_regex) else {
            return Ok(None);
        };
        let calls: Vec<(u64, usize)> = lock(&self.inner.dissector.index)
            .calls
            .iter()
            .map(|(address, referrers)| (*address, referrers.len()))
            .collect();
        let expressions: Vec<String> = calls.iter().map(|(address, _)| format!("{address:#x}")).collect();
        let infos = self.examine_expressions(&expressions).await?;
        Ok(Some(
            calls
                .into_iter()
                .zip(infos)
                .filter_map(|((_, count), info)| {
                    let symbol = info.all?;
                    matcher.is_match(&symbol).then_some((symbol, count))
                })
                .collect(),
        ))
    }
}
