use std::fmt::{Display, Formatter, Write};
use std::str::FromStr;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::connection::reader::ConnectionReader;
use crate::connection::writer::BufferedConnectionWriter;
use crate::payload::{PortReader, PortWriter};
use crate::util::vocab::Vocab;


const LIST_TAG: i32 = 256;
const MAX_NESTING: usize = 64;

/// Element tags of the binary encoding. A list's tag is `256`, combined with an element tag if
///  all of the list's elements share that (non-list) tag; the elements are then written without
///  individual tags.
#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
enum Tag {
    Int32 = 1,
    String = 4,
    Vocab = 9,
    Float64 = 10,
    Blob = 12,
    Int64 = 17,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Vocab(Vocab),
    Blob(Bytes),
    List(Bottle),
}

impl Value {
    fn tag(&self) -> i32 {
        match self {
            Value::Int32(_) => Tag::Int32.into(),
            Value::Int64(_) => Tag::Int64.into(),
            Value::Float64(_) => Tag::Float64.into(),
            Value::String(_) => Tag::String.into(),
            Value::Vocab(_) => Tag::Vocab.into(),
            Value::Blob(_) => Tag::Blob.into(),
            Value::List(b) => LIST_TAG | b.subcode(),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            Value::Int64(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(v) => Some(*v),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vocab(&self) -> Option<Vocab> {
        match self {
            Value::Vocab(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Bottle> {
        match self {
            Value::List(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Bytes> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// strings, and the text of vocabs
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Vocab(v) => Some(v.as_string()),
            _ => None,
        }
    }

    fn write_content(&self, writer: &mut BufferedConnectionWriter) {
        match self {
            Value::Int32(v) => writer.append_int(*v),
            Value::Int64(v) => writer.append_int64(*v),
            Value::Float64(v) => writer.append_double(*v),
            Value::String(s) => writer.append_string(s),
            Value::Vocab(v) => writer.append_int(v.0),
            Value::Blob(b) => {
                writer.append_int(b.len() as i32);
                if b.len() > 256 {
                    writer.append_external_block(b.clone());
                }
                else {
                    writer.append_block_copy(b);
                }
            }
            Value::List(b) => b.write_list_content(writer),
        }
    }

    fn read_content(tag: i32, reader: &mut ConnectionReader, depth: usize) -> anyhow::Result<Value> {
        if tag & LIST_TAG != 0 {
            return Ok(Value::List(Bottle::read_list_content(tag & !LIST_TAG, reader, depth + 1)?));
        }

        let tag = Tag::try_from_primitive(tag)
            .map_err(|_| anyhow!("unknown bottle tag {}", tag))?;
        Ok(match tag {
            Tag::Int32 => Value::Int32(reader.expect_int()?),
            Tag::Int64 => Value::Int64(reader.expect_int64()?),
            Tag::Float64 => Value::Float64(reader.expect_double()?),
            Tag::String => Value::String(reader.expect_string()?),
            Tag::Vocab => Value::Vocab(Vocab(reader.expect_int()?)),
            Tag::Blob => {
                let len = reader.expect_int()?;
                if len < 0 {
                    bail!("negative blob length {}", len);
                }
                Value::Blob(reader.expect_block(len as usize)?)
            }
        })
    }

    fn write_text(&self, out: &mut String) {
        match self {
            Value::Int32(v) => { let _ = write!(out, "{}", v); }
            Value::Int64(v) => { let _ = write!(out, "{}", v); }
            Value::Float64(v) if v.is_nan() => out.push_str("nan"),
            Value::Float64(v) if v.is_infinite() => out.push_str(if *v > 0.0 { "inf" } else { "-inf" }),
            Value::Float64(v) => {
                let s = v.to_string();
                out.push_str(&s);
                if !s.contains(['.', 'e', 'E']) {
                    out.push_str(".0");
                }
            }
            Value::String(s) => write_text_string(s, out),
            Value::Vocab(v) => { let _ = write!(out, "{}", v); }
            Value::Blob(b) => {
                out.push('{');
                for (i, byte) in b.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    let _ = write!(out, "{}", byte);
                }
                out.push('}');
            }
            Value::List(b) => {
                out.push('(');
                b.write_text(out);
                out.push(')');
            }
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        self.write_text(&mut s);
        write!(f, "{}", s)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}
impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float64(value)
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}
impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}
impl From<Vocab> for Value {
    fn from(value: Vocab) -> Self {
        Value::Vocab(value)
    }
}
impl From<Bottle> for Value {
    fn from(value: Bottle) -> Self {
        Value::List(value)
    }
}

fn is_plain_string(s: &str) -> bool {
    if NON_FINITE_TOKENS.contains(&s) {
        return false;
    }
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '/' || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || "/_-.:+*@".contains(c))
}

fn write_text_string(s: &str, out: &mut String) {
    if is_plain_string(s) {
        out.push_str(s);
        return;
    }
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
}


/// A [Bottle] is a self-describing list of values, the default payload. It has a compact binary
///  encoding and a human readable text encoding, and is written in whichever mode a connection
///  uses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bottle {
    values: Vec<Value>,
}

impl Bottle {
    pub fn new() -> Bottle {
        Bottle::default()
    }

    pub fn from_values(values: Vec<Value>) -> Bottle {
        Bottle { values }
    }

    pub fn add(&mut self, value: impl Into<Value>) -> &mut Bottle {
        self.values.push(value.into());
        self
    }

    pub fn add_int32(&mut self, value: i32) -> &mut Bottle {
        self.add(value)
    }

    pub fn add_int64(&mut self, value: i64) -> &mut Bottle {
        self.add(value)
    }

    pub fn add_float64(&mut self, value: f64) -> &mut Bottle {
        self.add(value)
    }

    pub fn add_string(&mut self, value: &str) -> &mut Bottle {
        self.add(value)
    }

    pub fn add_vocab(&mut self, value: Vocab) -> &mut Bottle {
        self.add(value)
    }

    pub fn add_blob(&mut self, value: Bytes) -> &mut Bottle {
        self.values.push(Value::Blob(value));
        self
    }

    /// appends an empty nested list, returning it for filling
    pub fn add_list(&mut self) -> &mut Bottle {
        self.values.push(Value::List(Bottle::new()));
        match self.values.last_mut() {
            Some(Value::List(b)) => b,
            _ => unreachable!("a list was just pushed"),
        }
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item=&Value> {
        self.values.iter()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// the values after the first `skip` values, as a new bottle
    pub fn tail(&self, skip: usize) -> Bottle {
        Bottle::from_values(self.values.iter().skip(skip).cloned().collect())
    }

    /// Looks up a value by key: either `key value` adjacent in this bottle, or a nested list
    ///  `(key value)`.
    pub fn find(&self, key: &str) -> Option<&Value> {
        for (i, value) in self.values.iter().enumerate() {
            if value.as_text().as_deref() == Some(key) {
                return self.values.get(i + 1);
            }
            if let Some(nested) = value.as_list() {
                if nested.get(0).and_then(|v| v.as_text()).as_deref() == Some(key) {
                    return nested.get(1);
                }
            }
        }
        None
    }

    fn subcode(&self) -> i32 {
        let first = match self.values.first() {
            Some(v) => v.tag(),
            None => return 0,
        };
        if first & LIST_TAG != 0 {
            return 0;
        }
        if self.values.iter().all(|v| v.tag() == first) {
            first
        }
        else {
            0
        }
    }

    fn write_list_content(&self, writer: &mut BufferedConnectionWriter) {
        let subcode = self.subcode();
        writer.append_int(self.values.len() as i32);
        for value in &self.values {
            if subcode == 0 {
                writer.append_int(value.tag());
            }
            value.write_content(writer);
        }
    }

    fn read_list_content(subcode: i32, reader: &mut ConnectionReader, depth: usize) -> anyhow::Result<Bottle> {
        if depth > MAX_NESTING {
            bail!("bottle nesting exceeds {} levels", MAX_NESTING);
        }
        let len = reader.expect_int()?;
        if len < 0 || len as usize > reader.remaining() {
            bail!("invalid bottle length {}", len);
        }

        let mut values = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let tag = if subcode != 0 { subcode } else { reader.expect_int()? };
            values.push(Value::read_content(tag, reader, depth)?);
        }
        Ok(Bottle { values })
    }

    pub fn write_binary(&self, writer: &mut BufferedConnectionWriter) {
        writer.append_int(LIST_TAG | self.subcode());
        self.write_list_content(writer);
    }

    pub fn read_binary(reader: &mut ConnectionReader) -> anyhow::Result<Bottle> {
        if reader.remaining() == 0 {
            return Ok(Bottle::new());
        }
        let tag = reader.expect_int()?;
        if tag & LIST_TAG == 0 {
            bail!("expected a bottle, found tag {}", tag);
        }
        Bottle::read_list_content(tag & !LIST_TAG, reader, 0)
    }

    fn write_text(&self, out: &mut String) {
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            value.write_text(out);
        }
    }

    pub fn to_text(&self) -> String {
        let mut result = String::new();
        self.write_text(&mut result);
        result
    }

    pub fn from_text(text: &str) -> anyhow::Result<Bottle> {
        let mut parser = TextParser { chars: text.chars().collect(), pos: 0 };
        let result = parser.parse_list(None, 0)?;
        Ok(result)
    }
}

impl Display for Bottle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl FromStr for Bottle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Bottle::from_text(s)
    }
}

impl PortWriter for Bottle {
    fn write(&self, writer: &mut BufferedConnectionWriter) -> anyhow::Result<()> {
        if writer.is_text_mode() {
            writer.append_line(&self.to_text());
        }
        else {
            self.write_binary(writer);
        }
        Ok(())
    }
}

impl PortReader for Bottle {
    fn read(&mut self, reader: &mut ConnectionReader) -> anyhow::Result<bool> {
        *self = if reader.is_text_mode() {
            Bottle::from_text(&reader.expect_text()?)?
        }
        else {
            Bottle::read_binary(reader)?
        };
        Ok(true)
    }
}


struct TextParser {
    chars: Vec<char>,
    pos: usize,
}

impl TextParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_list(&mut self, terminator: Option<char>, depth: usize) -> anyhow::Result<Bottle> {
        if depth > MAX_NESTING {
            bail!("bottle nesting exceeds {} levels", MAX_NESTING);
        }

        let mut result = Bottle::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None => {
                    if terminator.is_some() {
                        bail!("unterminated list");
                    }
                    return Ok(result);
                }
                Some(c) if Some(c) == terminator => {
                    self.pos += 1;
                    return Ok(result);
                }
                Some(')') => bail!("unbalanced ')' at position {}", self.pos),
                Some('(') => {
                    self.pos += 1;
                    let nested = self.parse_list(Some(')'), depth + 1)?;
                    result.values.push(Value::List(nested));
                }
                Some('"') => {
                    self.pos += 1;
                    let s = self.parse_quoted()?;
                    result.values.push(Value::String(s));
                }
                Some('[') => {
                    self.pos += 1;
                    let word = self.take_until(']')?;
                    let vocab = Vocab::try_from_str(&word)
                        .ok_or_else(|| anyhow!("invalid vocab [{}]", word))?;
                    result.values.push(Value::Vocab(vocab));
                }
                Some('{') => {
                    self.pos += 1;
                    let raw = self.take_until('}')?;
                    let bytes = raw.split_whitespace()
                        .map(|b| b.parse::<u8>())
                        .collect::<Result<Vec<_>, _>>()?;
                    result.values.push(Value::Blob(Bytes::from(bytes)));
                }
                Some(_) => {
                    let token = self.take_token();
                    result.values.push(parse_token(&token));
                }
            }
        }
    }

    fn take_until(&mut self, end: char) -> anyhow::Result<String> {
        let mut result = String::new();
        loop {
            match self.peek() {
                None => bail!("missing '{}'", end),
                Some(c) if c == end => {
                    self.pos += 1;
                    return Ok(result);
                }
                Some(c) => {
                    result.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn take_token(&mut self) -> String {
        let mut result = String::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() || "()[]{}\"".contains(c) {
                break;
            }
            result.push(c);
            self.pos += 1;
        }
        result
    }

    fn parse_quoted(&mut self) -> anyhow::Result<String> {
        let mut result = String::new();
        loop {
            let c = self.peek().ok_or_else(|| anyhow!("unterminated string"))?;
            self.pos += 1;
            match c {
                '"' => return Ok(result),
                '\\' => {
                    let escaped = self.peek().ok_or_else(|| anyhow!("unterminated string"))?;
                    self.pos += 1;
                    result.push(match escaped {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        other => other,
                    });
                }
                c => result.push(c),
            }
        }
    }
}

/// how text mode spells floating point values that have no digits
const NON_FINITE_TOKENS: [&str; 4] = ["nan", "inf", "-inf", "+inf"];

fn parse_token(token: &str) -> Value {
    match token {
        "nan" => return Value::Float64(f64::NAN),
        "inf" | "+inf" => return Value::Float64(f64::INFINITY),
        "-inf" => return Value::Float64(f64::NEG_INFINITY),
        _ => {}
    }
    if let Ok(v) = token.parse::<i64>() {
        return match i32::try_from(v) {
            Ok(v) => Value::Int32(v),
            Err(_) => Value::Int64(v),
        };
    }
    let looks_numeric = token.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+' || c == '.');
    if looks_numeric {
        if let Ok(v) = token.parse::<f64>() {
            return Value::Float64(v);
        }
    }
    Value::String(token.to_string())
}
