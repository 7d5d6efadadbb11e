/// Typed memory access
///
/// Values are read and written through the raw memory file of the inferior.
/// Failures come back as `None`/`false` so bulk reads can report partial
/// results; writes open a fresh handle every time so one failed write never
/// affects the next.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::procfs;
use crate::session::DebugSession;
use crate::types::InferiorArch;
use crate::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueIndex {
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    StringAscii,
    StringUtf8,
    StringUtf16,
    StringUtf32,
    Aob,
}

impl ValueIndex {
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ValueIndex::Int8 | ValueIndex::Int16 | ValueIndex::Int32 | ValueIndex::Int64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, ValueIndex::Float32 | ValueIndex::Float64)
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            ValueIndex::StringAscii
                | ValueIndex::StringUtf8
                | ValueIndex::StringUtf16
                | ValueIndex::StringUtf32
        )
    }

    /// Size of fixed-width types
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            ValueIndex::Int8 => Some(1),
            ValueIndex::Int16 => Some(2),
            ValueIndex::Int32 | ValueIndex::Float32 => Some(4),
            ValueIndex::Int64 | ValueIndex::Float64 => Some(8),
            _ => None,
        }
    }

    /// Bytes read per requested character
    fn string_multiplier(self) -> usize {
        match self {
            ValueIndex::StringUtf8 => 2,
            ValueIndex::StringUtf16 => 4,
            ValueIndex::StringUtf32 => 8,
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueIndex::Int8 => "Int8",
            ValueIndex::Int16 => "Int16",
            ValueIndex::Int32 => "Int32",
            ValueIndex::Int64 => "Int64",
            ValueIndex::Float32 => "Float32",
            ValueIndex::Float64 => "Float64",
            ValueIndex::StringAscii => "String_ASCII",
            ValueIndex::StringUtf8 => "String_UTF8",
            ValueIndex::StringUtf16 => "String_UTF16",
            ValueIndex::StringUtf32 => "String_UTF32",
            ValueIndex::Aob => "ByteArray",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueRepr {
    #[default]
    Unsigned,
    Signed,
    Hex,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    #[default]
    Host,
    Little,
    Big,
}

impl Endianness {
    /// Whether data must be byte-reversed relative to host order
    fn needs_swap(self) -> bool {
        match self {
            Endianness::Host => false,
            Endianness::Little => cfg!(target_endian = "big"),
            Endianness::Big => cfg!(target_endian = "little"),
        }
    }
}

/// How to interpret memory at an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueType {
    pub index: ValueIndex,
    /// Characters for strings, bytes for byte arrays
    pub length: usize,
    pub zero_terminate: bool,
    pub repr: ValueRepr,
    pub endian: Endianness,
}

impl ValueType {
    pub fn new(index: ValueIndex) -> Self {
        ValueType {
            index,
            length: 10,
            zero_terminate: true,
            repr: ValueRepr::Unsigned,
            endian: Endianness::Host,
        }
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub fn with_repr(mut self, repr: ValueRepr) -> Self {
        self.repr = repr;
        self
    }

    pub fn with_endian(mut self, endian: Endianness) -> Self {
        self.endian = endian;
        self
    }

    pub fn zero_terminated(mut self, zero_terminate: bool) -> Self {
        self.zero_terminate = zero_terminate;
        self
    }

    /// Byte count a read of this type consumes
    pub fn byte_len(&self) -> Option<usize> {
        if let Some(size) = self.index.fixed_size() {
            return Some(size);
        }
        if self.length == 0 {
            return None;
        }
        Some(self.length * self.index.string_multiplier())
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.index.name())?;
        if self.index.is_string() {
            write!(f, "[{}]", self.length)?;
            if !self.zero_terminate {
                f.write_str(",NZT")?;
            }
        } else if self.index == ValueIndex::Aob {
            write!(f, "[{}]", self.length)?;
        }
        if self.index.is_integer() {
            match self.repr {
                ValueRepr::Signed => f.write_str("(s)")?,
                ValueRepr::Hex => f.write_str("(h)")?,
                ValueRepr::Unsigned => {}
            }
        }
        match self.endian {
            Endianness::Little => f.write_str("<L>"),
            Endianness::Big => f.write_str("<B>"),
            Endianness::Host => Ok(()),
        }
    }
}

/// A decoded value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemoryValue {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    /// Strings, byte arrays and hex-formatted integers
    Text(String),
}

impl fmt::Display for MemoryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryValue::Unsigned(v) => write!(f, "{v}"),
            MemoryValue::Signed(v) => write!(f, "{v}"),
            MemoryValue::Float(v) => write!(f, "{v}"),
            MemoryValue::Text(v) => f.write_str(v),
        }
    }
}

/// Decode raw bytes as `value_type`
pub fn decode(data: &[u8], value_type: &ValueType) -> Option<MemoryValue> {
    let mut data = data.to_vec();
    if value_type.endian.needs_swap() {
        data.reverse();
    }
    let index = value_type.index;

    if index.is_string() {
        let text = decode_string(&data, index);
        let text = if value_type.zero_terminate {
            if text.starts_with('\0') {
                "\0".to_string()
            } else {
                text.split('\0').next().unwrap_or_default().to_string()
            }
        } else {
            text
        };
        return Some(MemoryValue::Text(text.chars().take(value_type.length).collect()));
    }
    if index == ValueIndex::Aob {
        return Some(MemoryValue::Text(format_bytes(&data)));
    }

    let size = index.fixed_size()?;
    let bytes = data.get(..size)?;
    let value = match index {
        ValueIndex::Float32 => {
            return Some(MemoryValue::Float(f32::from_ne_bytes(bytes.try_into().ok()?) as f64))
        }
        ValueIndex::Float64 => {
            return Some(MemoryValue::Float(f64::from_ne_bytes(bytes.try_into().ok()?)))
        }
        _ => {
            let mut wide = [0u8; 8];
            if cfg!(target_endian = "little") {
                wide[..size].copy_from_slice(bytes);
            } else {
                wide[8 - size..].copy_from_slice(bytes);
            }
            u64::from_ne_bytes(wide)
        }
    };

    Some(match value_type.repr {
        ValueRepr::Unsigned => MemoryValue::Unsigned(value),
        ValueRepr::Hex => MemoryValue::Text(format!("{value:#x}")),
        ValueRepr::Signed => {
            let shift = 64 - size * 8;
            MemoryValue::Signed(((value << shift) as i64) >> shift)
        }
    })
}

fn decode_string(data: &[u8], index: ValueIndex) -> String {
    match index {
        ValueIndex::StringAscii => data
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
            .collect(),
        ValueIndex::StringUtf16 => {
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        ValueIndex::StringUtf32 => data
            .chunks_exact(4)
            .map(|c| {
                char::from_u32(u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .unwrap_or(char::REPLACEMENT_CHARACTER)
            })
            .collect(),
        _ => String::from_utf8_lossy(data).into_owned(),
    }
}

/// `de ad be ef` style formatting
pub fn format_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Encode user input as the bytes `value_type` stores.
///
/// Integers accept decimal, `0x` hex and floats, and wrap modulo their width.
/// Byte arrays are whitespace separated hex pairs. Strings get one terminator
/// unit when zero-terminated.
pub fn parse_input(text: &str, value_type: &ValueType) -> Option<Vec<u8>> {
    if text.is_empty() {
        return None;
    }
    let index = value_type.index;
    let mut data = if index.is_string() {
        encode_string(text, index, value_type.zero_terminate)
    } else {
        let text = text.trim();
        if index == ValueIndex::Aob {
            text.split_whitespace()
                .map(|pair| {
                    if pair.len() > 2 {
                        return None;
                    }
                    u8::from_str_radix(pair, 16).ok()
                })
                .collect::<Option<Vec<u8>>>()?
        } else if index == ValueIndex::Float32 {
            (parse_float(text)? as f32).to_ne_bytes().to_vec()
        } else if index == ValueIndex::Float64 {
            parse_float(text)?.to_ne_bytes().to_vec()
        } else {
            let size = index.fixed_size()?;
            let value = parse_integer(text)?;
            let wrapped = if size == 8 {
                value as u64
            } else {
                value.rem_euclid(1i128 << (size * 8)) as u64
            };
            let bytes = wrapped.to_ne_bytes();
            if cfg!(target_endian = "little") {
                bytes[..size].to_vec()
            } else {
                bytes[8 - size..].to_vec()
            }
        }
    };
    if value_type.endian.needs_swap() {
        data.reverse();
    }
    Some(data)
}

fn parse_integer(text: &str) -> Option<i128> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i128::from_str_radix(hex, 16).ok(),
        None => digits
            .parse::<i128>()
            .ok()
            .or_else(|| digits.parse::<f64>().ok().map(|f| f.trunc() as i128)),
    }?;
    Some(if negative { -magnitude } else { magnitude })
}

fn parse_float(text: &str) -> Option<f64> {
    text.parse::<f64>()
        .ok()
        .or_else(|| parse_integer(text).map(|i| i as f64))
}

fn encode_string(text: &str, index: ValueIndex, zero_terminate: bool) -> Vec<u8> {
    let mut data: Vec<u8> = match index {
        ValueIndex::StringAscii => text
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect(),
        ValueIndex::StringUtf16 => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
        ValueIndex::StringUtf32 => text.chars().flat_map(|c| (c as u32).to_le_bytes()).collect(),
        _ => text.as_bytes().to_vec(),
    };
    if zero_terminate {
        let unit = match index {
            ValueIndex::StringUtf16 => 2,
            ValueIndex::StringUtf32 => 4,
            _ => 1,
        };
        data.extend(std::iter::repeat(0).take(unit));
    }
    data
}

/// Handle on a raw memory file, reused across reads
pub struct MemoryHandle {
    file: File,
}

impl MemoryHandle {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(MemoryHandle {
            file: File::open(path)?,
        })
    }

    pub fn open_writable(path: &Path) -> io::Result<Self> {
        Ok(MemoryHandle {
            file: OpenOptions::new().read(true).write(true).open(path)?,
        })
    }

    pub fn read_bytes(&self, address: u64, count: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.file.read_exact_at(&mut buf, address).ok()?;
        Some(buf)
    }

    pub fn write_bytes(&self, address: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, address)
    }

    pub fn read_value(&self, address: u64, value_type: &ValueType) -> Option<MemoryValue> {
        let data = self.read_bytes(address, value_type.byte_len()?)?;
        decode(&data, value_type)
    }

    /// Read one pointer-sized value
    pub fn read_pointer(&self, address: u64, arch: InferiorArch) -> Option<u64> {
        match arch {
            InferiorArch::X64 => {
                let data = self.read_bytes(address, 8)?;
                Some(u64::from_ne_bytes(data.try_into().ok()?))
            }
            InferiorArch::X86 => {
                let data = self.read_bytes(address, 4)?;
                Some(u32::from_ne_bytes(data.try_into().ok()?) as u64)
            }
        }
    }

    /// Hex pairs for `count` bytes, `??` where memory is unreadable
    pub fn hex_dump(&self, address: u64, count: usize) -> Vec<String> {
        const PAGE: u64 = 0x1000;
        let mut dump = Vec::with_capacity(count);
        let mut current = address;
        let end = address.saturating_add(count as u64);
        while current < end {
            let chunk_end = ((current / PAGE) + 1).saturating_mul(PAGE).min(end);
            let len = (chunk_end - current) as usize;
            match self.read_bytes(current, len) {
                Some(bytes) => dump.extend(bytes.iter().map(|b| format!("{b:02x}"))),
                None => dump.extend((current..chunk_end).map(|byte_address| {
                    match self.read_bytes(byte_address, 1) {
                        Some(byte) => format!("{:02x}", byte[0]),
                        None => "??".to_string(),
                    }
                })),
            }
            current = chunk_end;
        }
        dump
    }
}

/// Open, write and close in one go
pub fn write_value(path: &Path, address: u64, value_type: &ValueType, text: &str) -> bool {
    let Some(data) = parse_input(text, value_type) else {
        log::warn!("can't parse {:?} as {}", text, value_type);
        return false;
    };
    write_raw(path, address, &data)
}

pub fn write_raw(path: &Path, address: u64, data: &[u8]) -> bool {
    let result = MemoryHandle::open_writable(path).and_then(|handle| handle.write_bytes(address, data));
    if let Err(e) = result {
        log::warn!("can't write {} bytes at {:#x}: {}", data.len(), address, e);
        return false;
    }
    true
}

/// Start of a pointer chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerBase {
    Address(u64),
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerChainRequest {
    pub base: PointerBase,
    pub offsets: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerChainResult {
    /// Base dereference followed by one entry per offset
    pub chain: Vec<u64>,
}

impl PointerChainResult {
    /// The address the chain points at
    pub fn final_address(&self) -> u64 {
        self.chain.last().copied().unwrap_or(0)
    }
}

/// Walk a pointer chain from a resolved base address.
///
/// Every offset but the last is added and dereferenced; the last is only
/// added. A zero or unreadable pointer zeroes the dereferencing steps after it.
pub fn resolve_pointer_chain(
    handle: &MemoryHandle,
    base: u64,
    offsets: &[i64],
    arch: InferiorArch,
) -> Option<PointerChainResult> {
    let mut chain = Vec::with_capacity(offsets.len() + 1);
    let mut current = handle.read_pointer(base, arch)?;
    chain.push(current);

    if let Some((last, rest)) = offsets.split_last() {
        for offset in rest {
            current = if current == 0 {
                0
            } else {
                handle
                    .read_pointer(current.wrapping_add_signed(*offset), arch)
                    .unwrap_or(0)
            };
            chain.push(current);
        }
        chain.push(current.wrapping_add_signed(*last));
    }

    Some(PointerChainResult { chain })
}

impl DebugSession {
    pub(crate) fn memory_handle(&self) -> Result<MemoryHandle> {
        let pid = self.require_process()?;
        Ok(MemoryHandle::open(&procfs::mem_path(pid))?)
    }

    /// Read one value, `None` if the memory is unreadable
    pub fn read_memory(&self, address: u64, value_type: &ValueType) -> Result<Option<MemoryValue>> {
        match self.memory_handle() {
            Ok(handle) => Ok(handle.read_value(address, value_type)),
            Err(CoreError::Io(e)) => {
                log::debug!("memory file unavailable: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Read many values through a single handle
    pub fn read_memory_many(
        &self,
        requests: &[(u64, ValueType)],
    ) -> Result<Vec<Option<MemoryValue>>> {
        let handle = match self.memory_handle() {
            Ok(handle) => handle,
            Err(CoreError::Io(_)) => return Ok(vec![None; requests.len()]),
            Err(e) => return Err(e),
        };
        Ok(requests
            .iter()
            .map(|(address, value_type)| handle.read_value(*address, value_type))
            .collect())
    }

    pub fn write_memory(&self, address: u64, value_type: &ValueType, text: &str) -> Result<bool> {
        let pid = self.require_process()?;
        Ok(write_value(&procfs::mem_path(pid), address, value_type, text))
    }

    pub fn hex_dump(&self, address: u64, count: usize) -> Result<Vec<String>> {
        match self.memory_handle() {
            Ok(handle) => Ok(handle.hex_dump(address, count)),
            Err(CoreError::Io(_)) => Ok(vec!["??".to_string(); count]),
            Err(e) => Err(e),
        }
    }

    /// Resolve a pointer chain; `None` if the base can't be evaluated or read
    pub async fn resolve_pointer_chain(
        &self,
        request: &PointerChainRequest,
    ) -> Result<Option<PointerChainResult>> {
        self.require_process()?;
        let base = match &request.base {
            PointerBase::Address(address) => *address,
            PointerBase::Expression(expression) => {
                match self.examine_expression(expression).await?.address {
                    Some(address) => address,
                    None => return Ok(None),
                }
            }
        };
        let arch = self.arch();
        let handle = match self.memory_handle() {
            Ok(handle) => handle,
            Err(CoreError::Io(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(resolve_pointer_chain(&handle, base, &request.offsets, arch))
    }

    /// Overwrite code at `address`, remembering the original bytes once
    pub fn modify_instruction(&self, address: u64, new_bytes: &[u8]) -> Result<bool> {
        let pid = self.require_process()?;
        let path = procfs::mem_path(pid);
        if !self.state().modified_instructions.contains_key(&address) {
            let original = MemoryHandle::open(&path)
                .ok()
                .and_then(|handle| handle.read_bytes(address, new_bytes.len()));
            let Some(original) = original else {
                log::warn!("can't read instruction at {:#x}", address);
                return Ok(false);
            };
            self.state().modified_instructions.insert(address, original);
        }
        Ok(write_raw(&path, address, new_bytes))
    }

    /// Replace `length` bytes of code with NOPs
    pub fn nop_instruction(&self, address: u64, length: usize) -> Result<bool> {
        self.modify_instruction(address, &vec![0x90; length])
    }

    /// Put back the bytes saved by `modify_instruction`
    pub fn restore_instruction(&self, address: u64) -> Result<bool> {
        let pid = self.require_process()?;
        let Some(original) = self.state().modified_instructions.remove(&address) else {
            log::warn!("no modified instruction at {:#x}", address);
            return Ok(false);
        };
        Ok(write_raw(&procfs::mem_path(pid), address, &original))
    }

    /// Addresses patched so far with their original bytes
    pub fn modified_instructions(&self) -> Vec<(u64, Vec<u8>)> {
        self.state()
            .modified_instructions
            .iter()
            .map(|(address, bytes)| (*address, bytes.clone()))
            .collect()
    }
}
