/// Breakpoint and watchpoint manager
///
/// The debugger's breakpoint table is the source of truth; it is parsed on
/// every query so breakpoints the inferior set through its own debug registers
/// are seen too. What the table cannot carry lives in the session state: the
/// on-hit action of every breakpoint we created, the chained watchpoint groups
/// and the data collected by tracked breakpoints.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::parser::mi_quote;
use crate::session::{parse_hex, DebugSession, DisassembledInstruction};
use crate::types::Value;
use crate::Result;

/// Concurrent hardware breakpoints on x86 and x86-64
pub const HARDWARE_SLOTS: usize = 4;

static HARDWARE_TYPE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(hw|read|acc)").expect("valid regex"));
static WATCH_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"char\[(\d+)\]").expect("valid regex"));
static HEX_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointKind {
    Software,
    Hardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchpointType {
    WriteOnly,
    ReadOnly,
    Both,
}

impl WatchpointType {
    fn mi_flag(self) -> &'static str {
        match self {
            WatchpointType::WriteOnly => "",
            WatchpointType::ReadOnly => "-r ",
            WatchpointType::Both => "-a ",
        }
    }
}

/// What happens when a breakpoint is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnHit {
    /// Stop and report
    Break,
    /// Record the instruction that accessed a watched address, then continue
    FindCode,
    /// Record the values of register expressions, then continue
    FindAddr,
    /// Start an instruction trace
    Trace,
}

/// On-hit behaviour of one breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitAction {
    pub on_hit: OnHit,
    /// Stops at internal breakpoints are not reported to status subscribers
    pub internal: bool,
}

impl HitAction {
    pub fn new(on_hit: OnHit) -> Self {
        HitAction {
            on_hit,
            internal: on_hit != OnHit::Break,
        }
    }
}

impl Default for HitAction {
    fn default() -> Self {
        HitAction::new(OnHit::Break)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    Keep,
    /// Disabled after the next hit
    Once,
    /// Disabled after `enable_count` hits
    Count,
    DeleteOnHit,
}

impl Disposition {
    fn from_mi(disp: &str, enable_count: Option<u32>) -> Self {
        match disp {
            "del" => Disposition::DeleteOnHit,
            "dis" if enable_count.is_some() => Disposition::Count,
            "dis" => Disposition::Once,
            _ => Disposition::Keep,
        }
    }
}

/// One row of the debugger's breakpoint table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    /// Debugger breakpoint number, `N.M` for a location of a multi-location breakpoint
    pub number: String,
    pub kind: BreakpointKind,
    /// Type as reported by the debugger, e.g. `hw watchpoint`
    pub breakpoint_type: String,
    pub disposition: Disposition,
    pub enabled: bool,
    pub address: u64,
    pub size: u64,
    pub on_hit: OnHit,
    pub hit_count: u32,
    pub enable_count: Option<u32>,
    pub condition: Option<String>,
}

impl Breakpoint {
    /// Number of the breakpoint owning this row
    pub fn base_number(&self) -> &str {
        self.number.split('.').next().unwrap_or(&self.number)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.size.max(1)
    }

    /// Last byte covered
    fn last_address(&self) -> u64 {
        self.address.saturating_add(self.size.max(1) - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakpointModification {
    /// Empty string clears the condition
    Condition(String),
    Enable,
    Disable,
    EnableOnce,
    EnableCount(u32),
    EnableDelete,
}

/// Watchpoint wider than one hardware slot, split into slot-sized chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedWatchpointGroup {
    /// `(address, size)` of every chunk in address order
    pub chunks: Vec<(u64, u64)>,
}

impl ChainedWatchpointGroup {
    pub fn contains(&self, address: u64) -> bool {
        self.chunks
            .iter()
            .any(|(start, size)| address >= *start && address - start < *size)
    }
}

/// Collected when a tracked watchpoint fires at one program counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchpointHit {
    pub count: u64,
    /// The instruction that accessed the watched memory
    pub previous_pc: u64,
    pub registers: BTreeMap<String, String>,
    pub disassembly: Vec<DisassembledInstruction>,
}

/// Hits per program counter
pub type WatchpointTrack = BTreeMap<u64, WatchpointHit>;

/// Per register expression, how often each value was seen
pub type BreakpointTrack = BTreeMap<String, BTreeMap<u64, u64>>;

/// Tracked breakpoints and what they collected
#[derive(Debug, Default)]
pub(crate) struct TrackingTable {
    /// Watchpoint number to the key of its group
    watchpoint_groups: HashMap<String, String>,
    watchpoints: HashMap<String, WatchpointTrack>,
    /// Breakpoint number to the register expressions it samples
    register_expressions: HashMap<String, Vec<String>>,
    breakpoints: HashMap<String, BreakpointTrack>,
}

impl TrackingTable {
    pub fn clear(&mut self) {
        *self = TrackingTable::default();
    }

    fn forget(&mut self, number: &str) {
        if let Some(group) = self.watchpoint_groups.remove(number) {
            if !self.watchpoint_groups.values().any(|g| *g == group) {
                self.watchpoints.remove(&group);
            }
        }
        self.register_expressions.remove(number);
        self.breakpoints.remove(number);
    }
}

fn group_key(numbers: &[String]) -> String {
    numbers.join(",")
}

fn string_field<'a>(tuple: &'a HashMap<String, Value>, key: &str) -> Option<&'a str> {
    tuple.get(key).and_then(Value::as_string)
}

/// Parsed table row before addresses are resolved
struct RawRow {
    number: String,
    breakpoint_type: String,
    disposition: Disposition,
    enabled: bool,
    addr: String,
    what: String,
    hit_count: u32,
    enable_count: Option<u32>,
    condition: Option<String>,
}

impl RawRow {
    fn from_tuple(tuple: &HashMap<String, Value>) -> Option<Self> {
        let enable_count = string_field(tuple, "enable").and_then(|s| s.parse().ok());
        Some(RawRow {
            number: string_field(tuple, "number")?.to_string(),
            breakpoint_type: string_field(tuple, "type").unwrap_or_default().to_string(),
            disposition: Disposition::from_mi(string_field(tuple, "disp").unwrap_or_default(), enable_count),
            enabled: string_field(tuple, "enabled") == Some("y"),
            addr: string_field(tuple, "addr").unwrap_or_default().to_string(),
            what: string_field(tuple, "what").unwrap_or_default().to_string(),
            hit_count: string_field(tuple, "times").and_then(|s| s.parse().ok()).unwrap_or(0),
            enable_count,
            condition: string_field(tuple, "cond").map(str::to_string),
        })
    }

    /// Location row of a multi-location parent
    fn location_of(parent: &RawRow, tuple: &HashMap<String, Value>) -> Option<Self> {
        Some(RawRow {
            number: string_field(tuple, "number")?.to_string(),
            breakpoint_type: parent.breakpoint_type.clone(),
            disposition: parent.disposition,
            enabled: string_field(tuple, "enabled") == Some("y"),
            addr: string_field(tuple, "addr").unwrap_or_default().to_string(),
            what: string_field(tuple, "what").unwrap_or_default().to_string(),
            hit_count: parent.hit_count,
            enable_count: parent.enable_count,
            condition: parent.condition.clone(),
        })
    }

    fn size(&self) -> u64 {
        if self.breakpoint_type.contains("breakpoint") {
            return 1;
        }
        WATCH_SIZE
            .captures(&self.what)
            .and_then(|caps| caps[1].parse().ok())
            .unwrap_or(1)
    }
}

/// Flatten `-break-list` output; multi-location breakpoints become one row per location
fn parse_breakpoint_table(body: &[Value]) -> Vec<RawRow> {
    let mut rows = Vec::new();
    let mut parents: HashMap<String, RawRow> = HashMap::new();
    for entry in body {
        let Some(tuple) = entry.as_tuple() else {
            continue;
        };
        let Some(row) = RawRow::from_tuple(tuple) else {
            continue;
        };
        if row.addr == "<MULTIPLE>" {
            // MI3 nests the locations, MI2 lists them as following rows
            if let Some(locations) = tuple.get("locations").and_then(Value::as_list) {
                rows.extend(
                    locations
                        .iter()
                        .filter_map(Value::as_tuple)
                        .filter_map(|location| RawRow::location_of(&row, location)),
                );
            } else {
                parents.insert(row.number.clone(), row);
            }
            continue;
        }
        if row.breakpoint_type.is_empty() {
            let parent_number = row.number.split('.').next().unwrap_or_default();
            match parents.get(parent_number) {
                Some(parent) => {
                    if let Some(location) = RawRow::location_of(parent, tuple) {
                        rows.push(location);
                    }
                }
                None => log::debug!("breakpoint location {} has no parent", row.number),
            }
            continue;
        }
        rows.push(row);
    }
    rows
}

impl DebugSession {
    /// Current breakpoint table of the debugger
    pub async fn list_breakpoints(&self) -> Result<Vec<Breakpoint>> {
        let response = self.execute("-break-list").await?;
        let Some(body) = response
            .field("BreakpointTable")
            .and_then(Value::as_tuple)
            .and_then(|table| table.get("body"))
            .and_then(Value::as_list)
        else {
            return Ok(Vec::new());
        };

        let mut breakpoints = Vec::new();
        for row in parse_breakpoint_table(body) {
            let address = match parse_hex(&row.addr) {
                Some(address) => Some(address),
                None => match HEX_NUMBER.find(&row.what) {
                    Some(m) => parse_hex(m.as_str()),
                    None if !row.what.is_empty() => self.examine_expression(&row.what).await?.address,
                    None => None,
                },
            };
            let Some(address) = address else {
                log::debug!("breakpoint {} has no address", row.number);
                continue;
            };
            let base_number = row.number.split('.').next().unwrap_or_default();
            let on_hit = self
                .state()
                .hit_actions
                .get(base_number)
                .map_or(OnHit::Break, |action| action.on_hit);
            let kind = if HARDWARE_TYPE.is_match(&row.breakpoint_type) {
                BreakpointKind::Hardware
            } else {
                BreakpointKind::Software
            };
            breakpoints.push(Breakpoint {
                size: row.size(),
                number: row.number,
                kind,
                breakpoint_type: row.breakpoint_type,
                disposition: row.disposition,
                enabled: row.enabled,
                address,
                on_hit,
                hit_count: row.hit_count,
                enable_count: row.enable_count,
                condition: row.condition,
            });
        }
        Ok(breakpoints)
    }

    /// Breakpoints overlapping `address..address + length`
    pub async fn breakpoints_in_range(&self, address: u64, length: u64) -> Result<Vec<Breakpoint>> {
        let last = address.saturating_add(length.max(1) - 1);
        Ok(self
            .list_breakpoints()
            .await?
            .into_iter()
            .filter(|bp| !(last < bp.address || address > bp.last_address()))
            .collect())
    }

    /// Whether one of the hardware slots is free
    pub async fn hardware_breakpoint_available(&self) -> Result<bool> {
        let used = self
            .list_breakpoints()
            .await?
            .iter()
            .filter(|bp| bp.kind == BreakpointKind::Hardware)
            .count();
        Ok(used < HARDWARE_SLOTS)
    }

    /// Set a breakpoint at the address `expression` evaluates to.
    ///
    /// A hardware request falls back to a software breakpoint once every slot
    /// is taken. Returns the breakpoint number, `None` if the expression does
    /// not resolve or the address is already covered.
    pub async fn add_breakpoint(
        &self,
        expression: &str,
        kind: BreakpointKind,
        on_hit: OnHit,
    ) -> Result<Option<String>> {
        let Some(address) = self.examine_expression(expression).await?.address else {
            log::warn!("breakpoint expression {:?} is not valid", expression);
            return Ok(None);
        };
        // Slot accounting and insertion happen as one step
        let _guard = self.inner.breakpoint_lock.lock().await;
        if !self.breakpoints_in_range(address, 1).await?.is_empty() {
            log::warn!("breakpoint/watchpoint for address {:#x} is already set", address);
            return Ok(None);
        }
        let hardware = match kind {
            BreakpointKind::Hardware if self.hardware_breakpoint_available().await? => true,
            BreakpointKind::Hardware => {
                log::warn!("all hardware breakpoint slots are in use, using a software breakpoint for {:#x}", address);
                false
            }
            BreakpointKind::Software => false,
        };

        let command = format!(
            "-break-insert {}*{:#x}",
            if hardware { "-h " } else { "" },
            address
        );
        let response = self.execute(&command).await?;
        let Some(number) = response.field("bkpt").and_then(|bkpt| bkpt.field("number")) else {
            log::error!(
                "failed to set breakpoint at {:#x}: {}",
                address,
                response.error_message().unwrap_or("no breakpoint reported")
            );
            return Ok(None);
        };
        let number = number.to_string();
        self.state().hit_actions.insert(number.clone(), HitAction::new(on_hit));
        log::info!("breakpoint {} set at {:#x} ({:?})", number, address, on_hit);
        Ok(Some(number))
    }

    /// Watch `length` bytes starting at `expression`.
    ///
    /// The range is split into slot-sized chunks, one hardware slot each.
    /// Stops at the first chunk that can't be set and returns the numbers of
    /// the chunks set so far; these form one chained group. A range running
    /// past the end of the address space is refused.
    pub async fn add_watchpoint(
        &self,
        expression: &str,
        length: u64,
        watchpoint_type: WatchpointType,
        on_hit: OnHit,
    ) -> Result<Vec<String>> {
        let Some(address) = self.examine_expression(expression).await?.address else {
            log::warn!("watchpoint expression {:?} is not valid", expression);
            return Ok(Vec::new());
        };
        if address.checked_add(length).is_none() {
            log::warn!("watch range {:#x}+{} wraps the address space", address, length);
            return Ok(Vec::new());
        }
        let resume = self.begin_temporary_interruption().await?;
        let result = {
            let _guard = self.inner.breakpoint_lock.lock().await;
            self.insert_watchpoint_chunks(address, length, watchpoint_type, on_hit)
                .await
        };
        self.end_temporary_interruption(resume).await?;
        result
    }

    async fn insert_watchpoint_chunks(
        &self,
        mut address: u64,
        length: u64,
        watchpoint_type: WatchpointType,
        on_hit: OnHit,
    ) -> Result<Vec<String>> {
        let max_length = self.arch().pointer_size();
        let mut remaining = length;
        let mut numbers = Vec::new();
        let mut chunks = Vec::new();

        while remaining > 0 {
            let chunk = remaining.min(max_length);
            if !self.breakpoints_in_range(address, chunk).await?.is_empty() {
                log::warn!("breakpoint/watchpoint for address {:#x} is already set, bailing out", address);
                break;
            }
            if !self.hardware_breakpoint_available().await? {
                log::warn!("all hardware breakpoint slots are in use, unable to watch {:#x}", address);
                break;
            }
            let location = format!("*(char[{chunk}] *) {address:#x}");
            let command = format!("-break-watch {}{}", watchpoint_type.mi_flag(), mi_quote(&location));
            let response = self.execute(&command).await?;
            let number = ["wpt", "hw-rwpt", "hw-awpt"]
                .iter()
                .find_map(|key| response.field(key)?.field("number"));
            let Some(number) = number else {
                log::error!(
                    "failed to create a watchpoint at {:#x}: {}",
                    address,
                    response.error_message().unwrap_or("no watchpoint reported")
                );
                break;
            };
            self.state()
                .hit_actions
                .insert(number.to_string(), HitAction::new(on_hit));
            numbers.push(number.to_string());
            chunks.push((address, chunk));
            remaining -= chunk;
            address += chunk;
        }

        if chunks.len() > 1 {
            self.state().chains.push(ChainedWatchpointGroup { chunks });
        }
        Ok(numbers)
    }

    /// Addresses of every breakpoint the operation on `address` applies to
    fn chain_targets(&self, address: u64, remove: bool) -> Vec<u64> {
        let mut state = self.state();
        match state.chains.iter().position(|group| group.contains(address)) {
            Some(index) => {
                let targets = state.chains[index].chunks.iter().map(|(start, _)| *start).collect();
                if remove {
                    state.chains.remove(index);
                }
                targets
            }
            None => vec![address],
        }
    }

    /// Apply `modification` to the breakpoint at `expression`, or to its whole chained group
    pub async fn modify_breakpoint(
        &self,
        expression: &str,
        modification: &BreakpointModification,
    ) -> Result<bool> {
        if let BreakpointModification::EnableCount(0) = modification {
            log::warn!("enable count can't be lower than 1");
            return Ok(false);
        }
        let Some(address) = self.examine_expression(expression).await?.address else {
            log::warn!("breakpoint expression {:?} is not valid", expression);
            return Ok(false);
        };

        let mut modified = false;
        for target in self.chain_targets(address, false) {
            let Some(found) = self.breakpoints_in_range(target, 1).await?.into_iter().next() else {
                log::warn!("no breakpoint exists for address {:#x}", target);
                continue;
            };
            let number = found.base_number();
            let command = match modification {
                BreakpointModification::Condition(condition) => {
                    format!("-break-condition {number} {condition}")
                }
                BreakpointModification::Enable => format!("-break-enable {number}"),
                BreakpointModification::Disable => format!("-break-disable {number}"),
                BreakpointModification::EnableOnce => format!("enable once {number}"),
                BreakpointModification::EnableCount(count) => format!("enable count {count} {number}"),
                BreakpointModification::EnableDelete => format!("enable delete {number}"),
            };
            let response = self.execute(&command).await?;
            match response.error_message() {
                Some(msg) => log::error!("failed to modify breakpoint {}: {}", number, msg),
                None => modified = true,
            }
        }
        Ok(modified)
    }

    /// Delete the breakpoint at `expression`, or its whole chained group
    pub async fn delete_breakpoint(&self, expression: &str) -> Result<bool> {
        let Some(address) = self.examine_expression(expression).await?.address else {
            log::warn!("breakpoint expression {:?} is not valid", expression);
            return Ok(false);
        };

        let _guard = self.inner.breakpoint_lock.lock().await;
        let mut deleted = false;
        for target in self.chain_targets(address, true) {
            let Some(found) = self.breakpoints_in_range(target, 1).await?.into_iter().next() else {
                log::warn!("no breakpoint exists for address {:#x}", target);
                continue;
            };
            let number = found.base_number().to_string();
            {
                let mut state = self.state();
                state.hit_actions.remove(&number);
                state.tracking.forget(&number);
            }
            let response = self.execute(&format!("-break-delete {number}")).await?;
            match response.error_message() {
                Some(msg) => log::error!("failed to delete breakpoint {}: {}", number, msg),
                None => deleted = true,
            }
        }
        Ok(deleted)
    }

    /// Watch a value and record every instruction that touches it
    pub async fn track_watchpoint(
        &self,
        expression: &str,
        length: u64,
        watchpoint_type: WatchpointType,
    ) -> Result<Option<Vec<String>>> {
        let numbers = self
            .add_watchpoint(expression, length, watchpoint_type, OnHit::FindCode)
            .await?;
        if numbers.is_empty() {
            return Ok(None);
        }
        let key = group_key(&numbers);
        let mut state = self.state();
        for number in &numbers {
            state.tracking.watchpoint_groups.insert(number.clone(), key.clone());
        }
        state.tracking.watchpoints.insert(key, WatchpointTrack::new());
        Ok(Some(numbers))
    }

    /// What a tracked watchpoint group collected so far
    pub fn track_watchpoint_info(&self, numbers: &[String]) -> Option<WatchpointTrack> {
        self.state().tracking.watchpoints.get(&group_key(numbers)).cloned()
    }

    /// Break at `expression` and sample `register_expressions` on every hit
    pub async fn track_breakpoint(
        &self,
        expression: &str,
        register_expressions: &[String],
    ) -> Result<Option<String>> {
        let Some(number) = self
            .add_breakpoint(expression, BreakpointKind::Hardware, OnHit::FindAddr)
            .await?
        else {
            return Ok(None);
        };
        let expressions = register_expressions
            .iter()
            .map(|e| e.replace(' ', ""))
            .filter(|e| !e.is_empty())
            .collect();
        let mut state = self.state();
        state.tracking.register_expressions.insert(number.clone(), expressions);
        state.tracking.breakpoints.insert(number.clone(), BreakpointTrack::new());
        Ok(Some(number))
    }

    pub fn track_breakpoint_info(&self, number: &str) -> Option<BreakpointTrack> {
        self.state().tracking.breakpoints.get(number).cloned()
    }

    /// Collect data for a tracked breakpoint that just stopped the inferior, then resume
    pub(crate) async fn record_tracking_hit(&self, number: &str, on_hit: OnHit) -> Result<()> {
        match on_hit {
            OnHit::FindCode => self.record_watchpoint_hit(number).await?,
            OnHit::FindAddr => self.record_breakpoint_hit(number).await?,
            OnHit::Break | OnHit::Trace => return Ok(()),
        }
        self.continue_inferior().await
    }

    async fn record_watchpoint_hit(&self, number: &str) -> Result<()> {
        let Some(group) = self.state().tracking.watchpoint_groups.get(number).cloned() else {
            return Ok(());
        };
        let Some(pc) = self.examine_expression("$pc").await?.address else {
            return Ok(());
        };
        let previous_pc = self
            .disassemble("$pc-30", "$pc")
            .await?
            .last()
            .and_then(DisassembledInstruction::address_value)
            .unwrap_or(pc);
        let registers = self.read_registers().await?;
        let disassembly = self.disassemble(&format!("{previous_pc:#x}"), "+40").await?;

        let mut state = self.state();
        let Some(track) = state.tracking.watchpoints.get_mut(&group) else {
            return Ok(());
        };
        let count = track.get(&pc).map_or(1, |hit| hit.count + 1);
        track.insert(
            pc,
            WatchpointHit {
                count,
                previous_pc,
                registers,
                disassembly,
            },
        );
        Ok(())
    }

    async fn record_breakpoint_hit(&self, number: &str) -> Result<()> {
        let Some(expressions) = self.state().tracking.register_expressions.get(number).cloned() else {
            return Ok(());
        };
        let infos = self.examine_expressions(&expressions).await?;
        let mut state = self.state();
        let Some(track) = state.tracking.breakpoints.get_mut(number) else {
            return Ok(());
        };
        for (expression, info) in expressions.into_iter().zip(infos) {
            let values = track.entry(expression).or_default();
            if let Some(address) = info.address {
                *values.entry(address).or_insert(0) += 1;
            }
        }
        Ok(())
    }
}
