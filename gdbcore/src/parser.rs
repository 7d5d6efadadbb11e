/// GDB/MI output parser
///
/// Turns one line of machine-interface output into a [`GdbOutput`].

use crate::types::*;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::iter::Peekable;
use std::str::Chars;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("not a GDB/MI record: {0}")]
    NotMi(String),
    #[error("malformed record: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;

static RESULT_RECORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)?\^(done|running|connected|error|exit)(?:,(.*))?$").expect("valid regex")
});

static ASYNC_RECORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)?([*+=])([a-zA-Z][\w-]*)(?:,(.*))?$").expect("valid regex"));

/// Parse a line of GDB/MI output
pub fn parse_gdb_output(line: &str) -> Result<GdbOutput> {
    let line = line.trim();

    if line.is_empty() {
        return Err(ParseError::Empty);
    }
    if line == "(gdb)" {
        return Ok(GdbOutput::Prompt);
    }

    if let Some(stream) = parse_stream_record(line) {
        return Ok(GdbOutput::Stream(stream));
    }

    if let Some(caps) = RESULT_RECORD.captures(line) {
        return parse_result_record(&caps, line).map(GdbOutput::Result);
    }

    if let Some(caps) = ASYNC_RECORD.captures(line) {
        return parse_async_record(&caps).map(GdbOutput::Async);
    }

    Err(ParseError::NotMi(line.to_string()))
}

/// Parse a stream record (console, target, or log output)
fn parse_stream_record(line: &str) -> Option<StreamRecord> {
    let stream_type = match line.chars().next()? {
        '~' => StreamType::Console,
        '@' => StreamType::Target,
        '&' => StreamType::Log,
        _ => return None,
    };
    let content = &line[1..];
    let content = parse_c_string(content).unwrap_or_else(|| content.to_string());

    Some(StreamRecord {
        stream_type,
        content,
    })
}

fn parse_result_record(caps: &regex::Captures, line: &str) -> Result<GdbResult> {
    let token = caps.get(1).and_then(|m| m.as_str().parse().ok());

    let class = match caps.get(2).map(|m| m.as_str()) {
        Some("done") => ResultClass::Done,
        Some("running") => ResultClass::Running,
        Some("connected") => ResultClass::Connected,
        Some("error") => ResultClass::Error,
        Some("exit") => ResultClass::Exit,
        _ => return Err(ParseError::Malformed(line.to_string())),
    };

    let results = match caps.get(3) {
        Some(results) => parse_results(results.as_str())?,
        None => HashMap::new(),
    };

    Ok(GdbResult {
        token,
        class,
        results,
    })
}

fn parse_async_record(caps: &regex::Captures) -> Result<AsyncRecord> {
    let token = caps.get(1).and_then(|m| m.as_str().parse().ok());
    let kind = match caps.get(2).map(|m| m.as_str()) {
        Some("*") => AsyncKind::Exec,
        Some("+") => AsyncKind::Status,
        _ => AsyncKind::Notify,
    };
    let class = AsyncClass::from_name(caps.get(3).map(|m| m.as_str()).unwrap_or_default());
    let results = match caps.get(4) {
        Some(results) => parse_results(results.as_str())?,
        None => HashMap::new(),
    };

    Ok(AsyncRecord {
        token,
        kind,
        class,
        results,
    })
}

/// Parse the `name=value,...` tail of a record
pub(crate) fn parse_results(input: &str) -> Result<HashMap<String, Value>> {
    let mut cursor = Cursor::new(input);
    let mut results = HashMap::new();
    loop {
        cursor.skip_spaces();
        if cursor.peek().is_none() {
            break;
        }
        let (name, value) = cursor.result()?;
        results.insert(name, value);
        cursor.eat(',');
    }
    Ok(results)
}

/// Recursive-descent reader over MI values
struct Cursor<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Cursor {
            chars: input.chars().peekable(),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        self.chars.next_if_eq(&expected).is_some()
    }

    fn expect(&mut self, expected: char, context: &str) -> Result<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(ParseError::Malformed(format!("expected {expected:?} {context}")))
        }
    }

    fn skip_spaces(&mut self) {
        while self.eat(' ') {}
    }

    fn take_while(&mut self, accept: impl Fn(char) -> bool) -> String {
        let mut taken = String::new();
        while let Some(ch) = self.chars.next_if(|ch| accept(*ch)) {
            taken.push(ch);
        }
        taken
    }

    fn identifier(&mut self) -> Result<String> {
        let name = self.take_while(|ch| ch.is_alphanumeric() || ch == '_' || ch == '-');
        if name.is_empty() {
            return Err(ParseError::Malformed("empty identifier".into()));
        }
        Ok(name)
    }

    fn result(&mut self) -> Result<(String, Value)> {
        let name = self.identifier()?;
        self.expect('=', &format!("after {name}"))?;
        Ok((name, self.value()?))
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek() {
            Some('"') => Ok(self.quoted()),
            Some('[') => self.list(),
            Some('{') => self.tuple(),
            _ => self.bare(),
        }
    }

    /// Escapes are kept raw here and resolved by `unescape`
    fn quoted(&mut self) -> Value {
        self.chars.next();
        let mut raw = String::new();
        while let Some(ch) = self.chars.next() {
            match ch {
                '"' => break,
                '\\' => {
                    raw.push('\\');
                    if let Some(escaped) = self.chars.next() {
                        raw.push(escaped);
                    }
                }
                _ => raw.push(ch),
            }
        }
        Value::String(unescape(&raw))
    }

    /// A list holds either plain values or `name=value` results; names are dropped
    fn list(&mut self) -> Result<Value> {
        self.chars.next();
        let mut items = Vec::new();
        while !matches!(self.peek(), Some(']') | None) {
            let item = match self.peek() {
                Some('"' | '[' | '{') => self.value()?,
                _ => self.result()?.1,
            };
            items.push(item);
            self.eat(',');
        }
        self.expect(']', "to close list")?;
        Ok(Value::List(items))
    }

    fn tuple(&mut self) -> Result<Value> {
        self.chars.next();
        let mut fields = HashMap::new();
        while !matches!(self.peek(), Some('}') | None) {
            let (name, value) = self.result()?;
            fields.insert(name, value);
            self.eat(',');
        }
        self.expect('}', "to close tuple")?;
        Ok(Value::Tuple(fields))
    }

    /// Unquoted constant, as some debugger builds emit for numbers
    fn bare(&mut self) -> Result<Value> {
        let text = self.take_while(|ch| !matches!(ch, ',' | ']' | '}' | ' '));
        if text.is_empty() {
            return Err(ParseError::Malformed("empty value".into()));
        }
        Ok(Value::String(text))
    }
}

/// Parse a C-style quoted string
pub(crate) fn parse_c_string(input: &str) -> Option<String> {
    if input.len() < 2 || !input.starts_with('"') || !input.ends_with('"') {
        return None;
    }
    Some(unescape(&input[1..input.len() - 1]))
}

/// Resolve C escapes; gdb writes non-ASCII bytes as octal triples
fn unescape(content: &str) -> String {
    let mut bytes = Vec::with_capacity(content.len());
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('n') => bytes.push(b'\n'),
            Some('t') => bytes.push(b'\t'),
            Some('r') => bytes.push(b'\r'),
            Some('e') => bytes.push(0x1b),
            Some('\\') => bytes.push(b'\\'),
            Some('"') => bytes.push(b'"'),
            Some(d @ '0'..='7') => {
                let mut value = d.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(next) => {
                            value = value * 8 + next;
                            chars.next();
                        }
                        None => break,
                    }
                }
                bytes.push(value as u8);
            }
            Some(other) => {
                bytes.push(b'\\');
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => bytes.push(b'\\'),
        }
    }

    String::from_utf8_lossy(&bytes).into_owned()
}

/// Quote a string for use as a single MI argument
pub fn mi_quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}
