//! Record deserializer: wire record content back into documents.
//!
//! Inverse of [`crate::serialize`]. The grammar is self-describing:
//! an optional `ClassName@` prefix, then `name:value` pairs joined by
//! commas. Malformed content is a protocol error carrying the byte
//! position of the failure.

use crate::error::ProtocolError;
use crate::rid::RecordId;
use crate::value::{Document, Value};

/// Parses serialized record content into a document.
///
/// Record metadata (id, version) travels outside the content and is
/// set by the wire layer; only the class name lives in the content.
pub fn parse_record(content: &str) -> Result<Document, ProtocolError> {
    let mut parser = Parser {
        src: content.as_bytes(),
        pos: 0,
    };
    let doc = parser.document(None)?;
    if parser.pos != parser.src.len() {
        return Err(parser.err("trailing content"));
    }
    Ok(doc)
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, reason: &str) -> ProtocolError {
        ProtocolError::MalformedRecord {
            position: self.pos,
            reason: reason.to_string(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn eat(&mut self, expected: u8) -> Result<(), ProtocolError> {
        match self.bump() {
            Some(b) if b == expected => Ok(()),
            _ => Err(ProtocolError::MalformedRecord {
                position: self.pos.saturating_sub(1),
                reason: format!("expected {:?}", expected as char),
            }),
        }
    }

    fn document(&mut self, closer: Option<u8>) -> Result<Document, ProtocolError> {
        let mut doc = Document::new();

        if let Some(class) = self.class_prefix() {
            doc.set_class(class);
        }

        loop {
            match self.peek() {
                None => break,
                Some(b) if Some(b) == closer => break,
                _ => {}
            }

            let name = self.field_name()?;
            self.eat(b':')?;
            let value = self.value(closer)?;
            doc.insert(name, value);

            if self.peek() == Some(b',') {
                self.pos += 1;
            } else {
                break;
            }
        }

        Ok(doc)
    }

    /// Consumes `ClassName@` when the next `@` precedes any field
    /// syntax; otherwise consumes nothing.
    fn class_prefix(&mut self) -> Option<String> {
        for i in self.pos..self.src.len() {
            match self.src[i] {
                b'@' => {
                    let class = String::from_utf8_lossy(&self.src[self.pos..i]).into_owned();
                    self.pos = i + 1;
                    return Some(class);
                }
                b':' | b',' | b'\'' | b'"' | b'(' | b')' | b'{' | b'}' | b'[' | b']' => {
                    return None
                }
                _ => {}
            }
        }
        None
    }

    fn field_name(&mut self) -> Result<String, ProtocolError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b':' => break,
                b',' | b')' | b'}' | b']' => return Err(self.err("field name without value")),
                _ => self.pos += 1,
            }
        }
        if self.pos == start {
            return Err(self.err("empty field name"));
        }
        str_slice(self.src, start, self.pos).map(str::to_string).ok_or_else(|| self.err("invalid UTF-8 in field name"))
    }

    fn value(&mut self, closer: Option<u8>) -> Result<Value, ProtocolError> {
        match self.peek() {
            None => Ok(Value::Null),
            Some(b',') => Ok(Value::Null),
            Some(b) if Some(b) == closer => Ok(Value::Null),
            Some(b'\'') => self.quoted_string(),
            Some(b'"') => self.hash_string(),
            Some(b'#') => self.record_id(),
            Some(b'[') => self.list(),
            Some(b'(') => {
                self.pos += 1;
                let doc = self.document(Some(b')'))?;
                self.eat(b')')?;
                Ok(Value::Embedded(doc))
            }
            Some(b'{') => self.map(),
            Some(b't') | Some(b'f') => self.keyword(),
            Some(b) if b == b'-' || b.is_ascii_digit() => self.number(),
            Some(_) => Err(self.err("unexpected character")),
        }
    }

    fn quoted_string(&mut self) -> Result<Value, ProtocolError> {
        self.eat(b'\'')?;
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string")),
                Some(b'\\') => match self.bump() {
                    None => return Err(self.err("dangling escape")),
                    Some(b) => out.push(b),
                },
                Some(b'\'') => break,
                Some(b) => out.push(b),
            }
        }
        String::from_utf8(out)
            .map(Value::String)
            .map_err(|_| self.err("invalid UTF-8 in string"))
    }

    /// Doubled-quote wrapped hash content: `""…""`.
    fn hash_string(&mut self) -> Result<Value, ProtocolError> {
        self.eat(b'"')?;
        self.eat(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated hash string")),
                Some(b'\\') => match self.bump() {
                    None => return Err(self.err("dangling escape")),
                    Some(b) => out.push(b),
                },
                Some(b'"') => {
                    self.eat(b'"')?;
                    break;
                }
                Some(b) => out.push(b),
            }
        }
        String::from_utf8(out)
            .map(Value::String)
            .map_err(|_| self.err("invalid UTF-8 in string"))
    }

    fn record_id(&mut self) -> Result<Value, ProtocolError> {
        let start = self.pos;
        self.pos += 1; // '#'
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() || b == b':' || b == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = str_slice(self.src, start, self.pos).ok_or_else(|| self.err("invalid UTF-8"))?;
        let rid: RecordId = text.parse()?;
        Ok(Value::Link(rid))
    }

    fn list(&mut self) -> Result<Value, ProtocolError> {
        self.eat(b'[')?;
        let mut items = Vec::new();
        if self.peek() == Some(b']') {
            self.pos += 1;
            return Ok(Value::List(items));
        }
        loop {
            items.push(self.value(Some(b']'))?);
            match self.bump() {
                Some(b',') => continue,
                Some(b']') => break,
                _ => return Err(self.err("expected ',' or ']'")),
            }
        }
        Ok(Value::List(items))
    }

    fn map(&mut self) -> Result<Value, ProtocolError> {
        self.eat(b'{')?;
        let mut entries = Vec::new();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(Value::Map(entries));
        }
        loop {
            self.eat(b'"')?;
            let start = self.pos;
            while let Some(b) = self.peek() {
                if b == b'"' {
                    break;
                }
                self.pos += 1;
            }
            let key = str_slice(self.src, start, self.pos)
                .map(str::to_string)
                .ok_or_else(|| self.err("invalid UTF-8 in key"))?;
            self.eat(b'"')?;
            self.eat(b':')?;
            entries.push((key, self.value(Some(b'}'))?));
            match self.bump() {
                Some(b',') => continue,
                Some(b'}') => break,
                _ => return Err(self.err("expected ',' or '}'")),
            }
        }
        Ok(Value::Map(entries))
    }

    fn keyword(&mut self) -> Result<Value, ProtocolError> {
        if self.src[self.pos..].starts_with(b"true") {
            self.pos += 4;
            Ok(Value::Bool(true))
        } else if self.src[self.pos..].starts_with(b"false") {
            self.pos += 5;
            Ok(Value::Bool(false))
        } else {
            Err(self.err("unexpected character"))
        }
    }

    fn number(&mut self) -> Result<Value, ProtocolError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let mut float = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' => {
                    float = true;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        let digits =
            str_slice(self.src, start, self.pos).ok_or_else(|| self.err("invalid UTF-8"))?;

        match self.peek() {
            Some(b'f') => {
                self.pos += 1;
                digits
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| self.err("invalid float literal"))
            }
            Some(b't') => {
                self.pos += 1;
                let millis: i64 = digits
                    .parse()
                    .map_err(|_| self.err("invalid datetime literal"))?;
                Document::datetime_from_millis(millis)
                    .map(Value::DateTime)
                    .ok_or_else(|| self.err("datetime out of range"))
            }
            _ if float => digits
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| self.err("invalid float literal")),
            _ => digits
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| self.err("invalid integer literal")),
        }
    }
}

fn str_slice(src: &[u8], start: usize, end: usize) -> Option<&str> {
    std::str::from_utf8(&src[start..end]).ok()
}
