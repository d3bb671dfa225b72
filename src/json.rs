// Copyright (c) 2024 The ltp-runtime Authors. Licensed under Apache License, Version 2.0.

//! A forward-only, allocation-light JSON reader for test configuration files.
//!
//! This is not a general-purpose JSON library: values are read exactly once, in
//! document order, and a parse error is sticky — once set, every further call returns
//! [`Value::Void`] until [`JsonReader::reset`] is called. That mirrors how the reader
//! is meant to be used: read the whole document in one pass through
//! [`JsonReader::obj_first`]/[`JsonReader::obj_next`] or their array equivalents, then
//! check [`JsonReader::is_err`] once at the end.
//!
//! One deliberate deviation: the reference parser accumulates integers without
//! checking for overflow (`//TODO: overflow?`). Here, [`JsonReader::get_number`]
//! reports [`JsonError::IntOverflow`] as a sticky error instead of silently wrapping,
//! since a silently-wrapped test limit is a worse failure mode than a loud one.

use std::fmt;
use std::io::Write as _;
use std::path::Path;

const ID_MAX: usize = 64;

/// Byte length of a UTF-8 sequence given its lead byte.
fn utf8_len(lead: u8) -> usize {
    if lead & 0b1110_0000 == 0b1100_0000 {
        2
    } else if lead & 0b1111_0000 == 0b1110_0000 {
        3
    } else if lead & 0b1111_1000 == 0b1111_0000 {
        4
    } else {
        1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Void,
    Int,
    Str,
    Obj,
    Arr,
}

/// One parsed value: its type, an optional object-key `id`, and the scalar payload
/// when the type is [`Type::Int`] or [`Type::Str`].
#[derive(Debug, Clone, Default)]
pub struct Value {
    pub ty_: Option<Type>,
    pub id: String,
    pub val_int: i64,
    pub val_str: String,
}

impl Value {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.ty_.is_some()
    }

    fn void() -> Self {
        Value { ty_: None, ..Default::default() }
    }
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum JsonError {
    #[error("unterminated string")]
    #[diagnostic(code(ltp_runtime::json::unterminated_string))]
    UnterminatedString,

    #[error("expected four hexadecimal digits")]
    #[diagnostic(code(ltp_runtime::json::bad_unicode_escape))]
    BadUnicodeEscape,

    #[error("string buffer too short")]
    #[diagnostic(code(ltp_runtime::json::buffer_too_short))]
    BufferTooShort,

    #[error("integer literal overflows i64")]
    #[diagnostic(code(ltp_runtime::json::int_overflow))]
    IntOverflow,

    #[error("expected {0}")]
    #[diagnostic(code(ltp_runtime::json::expected))]
    Expected(&'static str),

    #[error("object key longer than {ID_MAX} bytes")]
    #[diagnostic(code(ltp_runtime::json::id_too_long))]
    IdTooLong,

    #[error("failed to read JSON file")]
    #[diagnostic(code(ltp_runtime::json::io))]
    Io(#[source] std::io::Error),
}

/// What the cursor found between one entry and the next: another entry follows
/// (having consumed the separating comma), the closing bracket is next (not yet
/// consumed — the caller still has to eat it), or the document is malformed.
enum NextOutcome {
    More,
    AtEnd,
    Err,
}

/// A forward-only cursor over an in-memory JSON document.
///
/// The reference reader remembers a "sub-object start" offset when descending into a
/// nested value so a caller can come back and skip it later; `obj_skip`/`arr_skip` here
/// instead recurse immediately and consume the nested structure inline, so there is
/// never a second offset to keep in sync with `off`. That also resolves the open
/// question of what happens with two live iterators on one buffer: there is only ever
/// one cursor, and skipping a nested value is never deferred, so interleaved iterators
/// from two call sites cannot observe a half-skipped structure.
pub struct JsonReader {
    json: Vec<u8>,
    off: usize,
    err: Option<(JsonError, usize)>,
}

impl JsonReader {
    #[must_use]
    pub fn new(json: impl Into<Vec<u8>>) -> Self {
        JsonReader { json: json.into(), off: 0, err: None }
    }

    /// Read a whole file into a reader, the streaming equivalent of `tst_json_load`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, JsonError> {
        let bytes = std::fs::read(path).map_err(JsonError::Io)?;
        Ok(JsonReader::new(bytes))
    }

    pub fn reset(&mut self) {
        self.off = 0;
        self.err = None;
    }

    #[must_use]
    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }

    /// The sticky parse error, if any.
    #[must_use]
    pub fn error(&self) -> Option<&JsonError> {
        self.err.as_ref().map(|(e, _)| e)
    }

    /// Render the error with up to three lines of surrounding context and a caret at
    /// the offending column, the same shape as `tst_json_err_print`.
    pub fn print_error(&self, mut w: impl std::io::Write) -> std::io::Result<()> {
        let Some((err, pos)) = &self.err else { return Ok(()) };
        let pos = *pos;

        let line_start = self.json[..pos].iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        let line_end = self.json[pos..].iter().position(|&b| b == b'\n').map_or(self.json.len(), |i| pos + i);
        let line = String::from_utf8_lossy(&self.json[line_start..line_end]);
        let col = pos - line_start;

        writeln!(w, "{line}")?;
        writeln!(w, "{}^", " ".repeat(col))?;
        writeln!(w, "{err}")
    }

    fn set_err(&mut self, err: JsonError) {
        if self.err.is_none() {
            self.err = Some((err, self.off));
        }
    }

    fn empty(&self) -> bool {
        self.off >= self.json.len()
    }

    fn eatws(&mut self) -> bool {
        while !self.empty() {
            match self.json[self.off] {
                b' ' | b'\t' | b'\n' | 0x0c => self.off += 1,
                _ => break,
            }
        }
        self.empty()
    }

    fn getb(&mut self) -> u8 {
        if self.empty() {
            return 0;
        }
        let b = self.json[self.off];
        self.off += 1;
        b
    }

    fn peekb(&self) -> u8 {
        if self.empty() { 0 } else { self.json[self.off] }
    }

    fn eatb(&mut self, ch: u8) -> bool {
        if self.peekb() != ch {
            return false;
        }
        self.getb();
        true
    }

    fn hex2val(b: u8) -> Option<u32> {
        match b {
            b'0'..=b'9' => Some(u32::from(b - b'0')),
            b'a'..=b'f' => Some(u32::from(b - b'a') + 10),
            b'A'..=b'F' => Some(u32::from(b - b'A') + 10),
            _ => None,
        }
    }

    fn parse_ucode_cp(&mut self) -> Option<u32> {
        let mut cp = 0u32;
        for _ in 0..4 {
            let Some(v) = Self::hex2val(self.getb()) else {
                self.set_err(JsonError::BadUnicodeEscape);
                return None;
            };
            cp = cp * 16 + v;
        }
        Some(cp)
    }

    /// Parse a quoted JSON string. `cap` bounds the output length; exceeding it is a
    /// sticky [`JsonError::BufferTooShort`], matching the reference's fixed
    /// user-supplied buffer semantics without requiring the caller to pre-size one.
    fn copy_str(&mut self, cap: Option<usize>) -> Result<String, ()> {
        self.eatb(b'"');
        let mut out = String::new();
        let mut esc = false;

        loop {
            if self.empty() {
                self.set_err(JsonError::UnterminatedString);
                return Err(());
            }
            if !esc && self.eatb(b'"') {
                return Ok(out);
            }

            let mut b = self.getb();
            if !esc && b == b'\\' {
                esc = true;
                continue;
            }

            if esc {
                b = match b {
                    b'"' | b'\\' | b'/' => b,
                    b'b' => 0x08,
                    b'f' => 0x0c,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    b'u' => {
                        let Some(cp) = self.parse_ucode_cp() else { return Err(()) };
                        if let Some(ch) = char::from_u32(cp) {
                            out.push(ch);
                        }
                        esc = false;
                        continue;
                    }
                    other => other,
                };
                esc = false;
            }

            if b.is_ascii() {
                out.push(b as char);
            } else {
                // Raw (non-escaped) UTF-8 bytes pass through verbatim; `b` is the
                // lead byte of a multi-byte sequence already copied in by `getb`
                // one byte at a time, so push the bytes straight into the String's
                // buffer instead of widening each one to its own `char`.
                let start = self.off - 1;
                let len = utf8_len(b);
                let end = (start + len).min(self.json.len());
                match std::str::from_utf8(&self.json[start..end]) {
                    Ok(s) => {
                        out.push_str(s);
                        self.off = end;
                    }
                    Err(_) => {
                        self.set_err(JsonError::Expected("valid UTF-8"));
                        return Err(());
                    }
                }
            }
            if let Some(cap) = cap {
                if out.len() > cap {
                    self.set_err(JsonError::BufferTooShort);
                    return Err(());
                }
            }
        }
    }

    fn copy_id_str(&mut self) -> Result<String, ()> {
        self.copy_str(Some(ID_MAX))
    }

    fn get_number(&mut self) -> Result<i64, ()> {
        let mut neg = false;
        if self.eatb(b'-') {
            neg = true;
        }

        let mut digits = 0;
        let mut acc: i64 = 0;
        while self.peekb().is_ascii_digit() {
            let d = i64::from(self.getb() - b'0');
            digits += 1;
            acc = match acc.checked_mul(10).and_then(|a| a.checked_add(d)) {
                Some(v) => v,
                None => {
                    self.set_err(JsonError::IntOverflow);
                    return Err(());
                }
            };
        }

        if digits == 0 {
            self.set_err(JsonError::Expected("at least one digit"));
            return Err(());
        }

        Ok(if neg { -acc } else { acc })
    }

    /// The type of the next value in the buffer without consuming anything but
    /// leading whitespace.
    pub fn next_type(&mut self) -> Type {
        if self.is_err() || self.eatws() {
            return Type::Void;
        }
        match self.peekb() {
            b'{' => Type::Obj,
            b'[' => Type::Arr,
            b'"' => Type::Str,
            b'-' | b'0'..=b'9' => Type::Int,
            _ => Type::Void,
        }
    }

    /// Require the document's first value to be an object or array, per the
    /// reference's entry point.
    pub fn start(&mut self) -> Type {
        match self.next_type() {
            ty @ (Type::Obj | Type::Arr) => {
                self.getb();
                ty
            }
            _ => {
                self.set_err(JsonError::Expected("'{' or '['"));
                Type::Void
            }
        }
    }

    fn get_value(&mut self, res: &mut Value) {
        if self.is_err() {
            *res = Value::void();
            return;
        }
        match self.next_type() {
            Type::Int => match self.get_number() {
                Ok(n) => {
                    res.ty_ = Some(Type::Int);
                    res.val_int = n;
                }
                Err(()) => *res = Value::void(),
            },
            Type::Str => match self.copy_str(None) {
                Ok(s) => {
                    res.ty_ = Some(Type::Str);
                    res.val_str = s;
                }
                Err(()) => *res = Value::void(),
            },
            Type::Obj => {
                self.getb();
                res.ty_ = Some(Type::Obj);
            }
            Type::Arr => {
                self.getb();
                res.ty_ = Some(Type::Arr);
            }
            Type::Void => *res = Value::void(),
        }
    }

    fn pre_next(&mut self, closing: u8) -> NextOutcome {
        if self.eatws() {
            self.set_err(JsonError::UnterminatedString);
            return NextOutcome::Err;
        }
        if self.peekb() == closing {
            return NextOutcome::AtEnd;
        }
        if !self.eatb(b',') {
            self.set_err(JsonError::Expected("',' or closing bracket"));
            return NextOutcome::Err;
        }
        self.eatws();
        NextOutcome::More
    }

    fn check_end(&mut self, closing: u8, res: &mut Value) -> bool {
        if self.eatb(closing) {
            *res = Value::void();
            return true;
        }
        false
    }

    /// First entry of an object just opened by [`JsonReader::start`] or
    /// [`JsonReader::obj_next`]'s recursive descent into a nested object.
    pub fn obj_first(&mut self, res: &mut Value) {
        if self.is_err() {
            *res = Value::void();
            return;
        }
        self.eatws();
        if self.check_end(b'}', res) {
            return;
        }
        self.obj_entry(res);
    }

    pub fn obj_next(&mut self, res: &mut Value) {
        if self.is_err() {
            *res = Value::void();
            return;
        }
        match self.pre_next(b'}') {
            NextOutcome::Err => *res = Value::void(),
            NextOutcome::AtEnd => {
                self.check_end(b'}', res);
            }
            NextOutcome::More => {
                if self.peekb() == b'}' {
                    self.set_err(JsonError::Expected("member after ','"));
                    *res = Value::void();
                } else {
                    self.obj_entry(res);
                }
            }
        }
    }

    fn obj_entry(&mut self, res: &mut Value) {
        let Ok(id) = self.copy_id_str() else {
            *res = Value::void();
            return;
        };
        self.eatws();
        if !self.eatb(b':') {
            self.set_err(JsonError::Expected("':'"));
            *res = Value::void();
            return;
        }
        self.eatws();
        self.get_value(res);
        if res.is_valid() {
            res.id = id;
        }
    }

    pub fn arr_first(&mut self, res: &mut Value) {
        if self.is_err() {
            *res = Value::void();
            return;
        }
        self.eatws();
        if self.check_end(b']', res) {
            return;
        }
        self.get_value(res);
    }

    pub fn arr_next(&mut self, res: &mut Value) {
        if self.is_err() {
            *res = Value::void();
            return;
        }
        match self.pre_next(b']') {
            NextOutcome::Err => *res = Value::void(),
            NextOutcome::AtEnd => {
                self.check_end(b']', res);
            }
            NextOutcome::More => {
                if self.peekb() == b']' {
                    self.set_err(JsonError::Expected("value after ','"));
                    *res = Value::void();
                } else {
                    self.get_value(res);
                }
            }
        }
    }

    /// Skip the rest of the current object without materializing any values.
    pub fn obj_skip(&mut self) -> Result<(), ()> {
        let mut v = Value::default();
        self.obj_first(&mut v);
        while v.is_valid() {
            self.skip_nested(&v);
            self.obj_next(&mut v);
        }
        if self.is_err() { Err(()) } else { Ok(()) }
    }

    /// Skip the rest of the current array without materializing any values.
    pub fn arr_skip(&mut self) -> Result<(), ()> {
        let mut v = Value::default();
        self.arr_first(&mut v);
        while v.is_valid() {
            self.skip_nested(&v);
            self.arr_next(&mut v);
        }
        if self.is_err() { Err(()) } else { Ok(()) }
    }

    fn skip_nested(&mut self, v: &Value) {
        match v.ty_ {
            Some(Type::Obj) => {
                let _ = self.obj_skip();
            }
            Some(Type::Arr) => {
                let _ = self.arr_skip();
            }
            _ => {}
        }
    }
}

impl fmt::Debug for JsonReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonReader")
            .field("off", &self.off)
            .field("len", &self.json.len())
            .field("err", &self.err.as_ref().map(|(e, _)| e.to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_flat_object() {
        let mut r = JsonReader::new(r#"{"a": 1, "b": "two"}"#);
        assert_eq!(r.start(), Type::Obj);

        let mut v = Value::default();
        r.obj_first(&mut v);
        assert!(v.is_valid());
        assert_eq!(v.id, "a");
        assert_eq!(v.val_int, 1);

        r.obj_next(&mut v);
        assert!(v.is_valid());
        assert_eq!(v.id, "b");
        assert_eq!(v.val_str, "two");

        r.obj_next(&mut v);
        assert!(!v.is_valid());
        assert!(!r.is_err());
    }

    #[test]
    fn parses_array_of_ints() {
        let mut r = JsonReader::new("[1, 2, 3]");
        assert_eq!(r.start(), Type::Arr);

        let mut v = Value::default();
        let mut sum = 0;
        r.arr_first(&mut v);
        while v.is_valid() {
            sum += v.val_int;
            r.arr_next(&mut v);
        }
        assert_eq!(sum, 6);
    }

    #[test]
    fn unterminated_string_is_sticky() {
        let mut r = JsonReader::new(r#"{"a": "oops"#);
        r.start();
        let mut v = Value::default();
        r.obj_first(&mut v);
        assert!(r.is_err());
        assert!(matches!(r.error(), Some(JsonError::UnterminatedString)));
        let before = r.off;
        r.obj_next(&mut v);
        assert_eq!(r.off, before);
    }

    #[test]
    fn overflowing_integer_is_a_sticky_error() {
        let mut r = JsonReader::new("99999999999999999999999999");
        let mut v = Value::default();
        r.get_value(&mut v);
        assert!(r.is_err());
        assert!(matches!(r.error(), Some(JsonError::IntOverflow)));
    }

    #[test]
    fn trailing_comma_in_object_is_rejected() {
        let mut r = JsonReader::new(r#"{"a": 1,}"#);
        r.start();
        let mut v = Value::default();
        r.obj_first(&mut v);
        assert!(v.is_valid());
        r.obj_next(&mut v);
        assert!(!v.is_valid());
        assert!(r.is_err());
        assert!(matches!(r.error(), Some(JsonError::Expected(_))));
    }

    #[test]
    fn trailing_comma_in_array_is_rejected() {
        let mut r = JsonReader::new("[1, 2,]");
        r.start();
        let mut v = Value::default();
        r.arr_first(&mut v);
        assert!(v.is_valid());
        r.arr_next(&mut v);
        assert!(v.is_valid());
        r.arr_next(&mut v);
        assert!(!v.is_valid());
        assert!(r.is_err());
        assert!(matches!(r.error(), Some(JsonError::Expected(_))));
    }

    #[test]
    fn skips_nested_object() {
        let mut r = JsonReader::new(r#"{"a": {"x": 1, "y": [1,2,3]}, "b": 2}"#);
        r.start();
        let mut v = Value::default();
        r.obj_first(&mut v);
        assert_eq!(v.id, "a");
        r.obj_skip().unwrap();
        r.obj_next(&mut v);
        assert_eq!(v.id, "b");
        assert_eq!(v.val_int, 2);
    }

    #[test]
    fn parses_hwconfig_style_document() {
        let mut r =
            JsonReader::new(r#"{"reconfigure":"/bin/true","hwconfs":[{"uid":"a"},{"uid":"b"}]}"#);
        assert_eq!(r.start(), Type::Obj);

        let mut top = Value::default();
        r.obj_first(&mut top);
        assert_eq!(top.id, "reconfigure");
        assert_eq!(top.val_str, "/bin/true");

        r.obj_next(&mut top);
        assert_eq!(top.id, "hwconfs");
        assert_eq!(top.ty_, Some(Type::Arr));

        let mut entry = Value::default();
        r.arr_first(&mut entry);
        let mut uids = Vec::new();
        while entry.is_valid() {
            let mut field = Value::default();
            r.obj_first(&mut field);
            assert_eq!(field.id, "uid");
            uids.push(field.val_str.clone());
            r.obj_next(&mut field);
            assert!(!field.is_valid());
            r.arr_next(&mut entry);
        }

        assert_eq!(uids, vec!["a", "b"]);
        assert!(!r.is_err());
    }
}
