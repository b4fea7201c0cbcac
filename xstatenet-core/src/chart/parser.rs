//! Reader for the relaxed statechart JSON dialect: unquoted keys, single- or
//! double-quoted strings, trailing commas. Produces a `serde_json::Value`
//! with object keys in document order.

use crate::error::ChartError;
use serde_json::{Map, Number, Value};

/// Hard cap on chart source size.
const MAX_SOURCE_BYTES: usize = 10 * 1024 * 1024;

/// Hard cap on bracket nesting.
const MAX_DEPTH: u32 = 100;

pub fn parse_relaxed(src: &str) -> Result<Value, ChartError> {
    if src.len() > MAX_SOURCE_BYTES {
        return Err(ChartError::at(
            0,
            1,
            1,
            format!("chart source exceeds {} bytes", MAX_SOURCE_BYTES),
        ));
    }
    let mut r = Reader::new(src);
    r.skip_ws();
    let value = r.parse_value(0)?;
    r.skip_ws();
    if !r.at_end() {
        return Err(r.err("trailing characters after top-level value"));
    }
    Ok(value)
}

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

impl<'a> Reader<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(b)
    }

    fn err(&self, reason: impl Into<String>) -> ChartError {
        ChartError::at(self.pos, self.line, self.col, reason)
    }

    fn skip_ws(&mut self) {
        while let Some(b) = self.peek() {
            if b == b' ' || b == b'\t' || b == b'\r' || b == b'\n' {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn expect(&mut self, want: u8) -> Result<(), ChartError> {
        match self.peek() {
            Some(b) if b == want => {
                self.bump();
                Ok(())
            }
            Some(b) => Err(self.err(format!(
                "expected '{}', found '{}'",
                want as char, b as char
            ))),
            None => Err(self.err(format!("expected '{}', found end of input", want as char))),
        }
    }

    fn parse_value(&mut self, depth: u32) -> Result<Value, ChartError> {
        if depth > MAX_DEPTH {
            return Err(self.err(format!("nesting depth exceeds {MAX_DEPTH}")));
        }
        self.skip_ws();
        match self.peek() {
            Some(b'{') => self.parse_object(depth),
            Some(b'[') => self.parse_array(depth),
            Some(b'"') | Some(b'\'') => Ok(Value::String(self.parse_string()?)),
            Some(b) if b == b'-' || b.is_ascii_digit() => self.parse_number(),
            Some(b) if b.is_ascii_alphabetic() || b == b'_' => self.parse_word(),
            Some(b) => Err(self.err(format!("unexpected character '{}'", b as char))),
            None => Err(self.err("unexpected end of input")),
        }
    }

    fn parse_object(&mut self, depth: u32) -> Result<Value, ChartError> {
        self.expect(b'{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'}') => {
                    self.bump();
                    return Ok(Value::Object(map));
                }
                None => return Err(self.err("unclosed '{'")),
                _ => {}
            }
            let key = self.parse_key()?;
            self.skip_ws();
            self.expect(b':')?;
            let value = self.parse_value(depth + 1)?;
            map.insert(key, value);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.bump();
                }
                Some(b'}') => {
                    self.bump();
                    return Ok(Value::Object(map));
                }
                Some(b) => {
                    return Err(self.err(format!(
                        "expected ',' or '}}' in object, found '{}'",
                        b as char
                    )))
                }
                None => return Err(self.err("unclosed '{'")),
            }
        }
    }

    fn parse_array(&mut self, depth: u32) -> Result<Value, ChartError> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b']') => {
                    self.bump();
                    return Ok(Value::Array(items));
                }
                None => return Err(self.err("unclosed '['")),
                _ => {}
            }
            items.push(self.parse_value(depth + 1)?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.bump();
                }
                Some(b']') => {
                    self.bump();
                    return Ok(Value::Array(items));
                }
                Some(b) => {
                    return Err(self.err(format!(
                        "expected ',' or ']' in array, found '{}'",
                        b as char
                    )))
                }
                None => return Err(self.err("unclosed '['")),
            }
        }
    }

    /// Object keys: quoted strings, or bare words drawn from
    /// `[A-Za-z0-9_$.-]` (delay keys like `500` are bare numbers).
    fn parse_key(&mut self) -> Result<String, ChartError> {
        match self.peek() {
            Some(b'"') | Some(b'\'') => self.parse_string(),
            Some(b) if is_bare_key_byte(b) => {
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if is_bare_key_byte(b) {
                        self.bump();
                    } else {
                        break;
                    }
                }
                // Bare keys are ASCII by construction.
                Ok(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
            }
            Some(b) => Err(self.err(format!("invalid object key start '{}'", b as char))),
            None => Err(self.err("expected object key, found end of input")),
        }
    }

    fn parse_string(&mut self) -> Result<String, ChartError> {
        let quote = self
            .bump()
            .ok_or_else(|| self.err("expected string, found end of input"))?;
        let mut out = Vec::new();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string")),
                Some(b) if b == quote => break,
                Some(b'\\') => {
                    let esc = self.bump().ok_or_else(|| self.err("unterminated escape"))?;
                    match esc {
                        b'"' => out.push(b'"'),
                        b'\'' => out.push(b'\''),
                        b'\\' => out.push(b'\\'),
                        b'/' => out.push(b'/'),
                        b'n' => out.push(b'\n'),
                        b't' => out.push(b'\t'),
                        b'r' => out.push(b'\r'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'u' => {
                            let mut code = 0u32;
                            for _ in 0..4 {
                                let h = self
                                    .bump()
                                    .ok_or_else(|| self.err("unterminated \\u escape"))?;
                                let digit = (h as char)
                                    .to_digit(16)
                                    .ok_or_else(|| self.err("invalid \\u escape digit"))?;
                                code = code * 16 + digit;
                            }
                            let c = char::from_u32(code)
                                .ok_or_else(|| self.err("invalid \\u code point"))?;
                            let mut buf = [0u8; 4];
                            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                        }
                        other => {
                            return Err(self.err(format!("invalid escape '\\{}'", other as char)))
                        }
                    }
                }
                Some(b) => out.push(b),
            }
        }
        String::from_utf8(out).map_err(|_| self.err("string is not valid UTF-8"))
    }

    fn parse_number(&mut self) -> Result<Value, ChartError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.bump();
        }
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() || b == b'.' || b == b'e' || b == b'E' || b == b'+' || b == b'-' {
                self.bump();
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.err("invalid number"))?;
        if let Ok(n) = text.parse::<i64>() {
            return Ok(Value::Number(Number::from(n)));
        }
        if let Ok(n) = text.parse::<u64>() {
            return Ok(Value::Number(Number::from(n)));
        }
        let f: f64 = text
            .parse()
            .map_err(|_| self.err(format!("invalid number '{text}'")))?;
        Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| self.err(format!("non-finite number '{text}'")))
    }

    /// Bare words in value position: only the JSON literals.
    fn parse_word(&mut self) -> Result<Value, ChartError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        let word = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.err("invalid literal"))?;
        match word {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" => Ok(Value::Null),
            other => Err(self.err(format!(
                "bare word '{other}' is not a value; quote it if it is a string"
            ))),
        }
    }
}

fn is_bare_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'.' || b == b'-'
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_unquoted_keys_and_single_quotes() {
        let v = parse_relaxed("{ id: 'toggle', initial: 'off', count: 3 }").unwrap();
        assert_eq!(v, json!({ "id": "toggle", "initial": "off", "count": 3 }));
    }

    #[test]
    fn tolerates_trailing_commas() {
        let v = parse_relaxed("{ a: [1, 2, 3,], b: { c: 'd', }, }").unwrap();
        assert_eq!(v, json!({ "a": [1, 2, 3], "b": { "c": "d" } }));
    }

    #[test]
    fn numeric_delay_keys_stay_bare() {
        let v = parse_relaxed("{ after: { 500: 'next' } }").unwrap();
        assert_eq!(v["after"]["500"], json!("next"));
    }

    #[test]
    fn preserves_key_order() {
        let v = parse_relaxed("{ states: { zeta: {}, alpha: {}, mid: {} } }").unwrap();
        let keys: Vec<_> = v["states"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn rejects_unbalanced_brackets() {
        let err = parse_relaxed("{ a: { b: 1 }").unwrap_err();
        assert!(err.reason.contains("unclosed"), "{}", err.reason);
    }

    #[test]
    fn rejects_excess_depth() {
        let mut src = String::new();
        for _ in 0..120 {
            src.push_str("{ a: ");
        }
        src.push('1');
        for _ in 0..120 {
            src.push('}');
        }
        let err = parse_relaxed(&src).unwrap_err();
        assert!(err.reason.contains("depth"), "{}", err.reason);
    }

    #[test]
    fn rejects_bare_word_values() {
        let err = parse_relaxed("{ a: hello }").unwrap_err();
        assert!(err.reason.contains("bare word"), "{}", err.reason);
    }

    #[test]
    fn reports_position() {
        let err = parse_relaxed("{ a: 1,\n  b: ? }").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.column >= 5);
    }

    #[test]
    fn unicode_escapes_decode() {
        let v = parse_relaxed(r#"{ s: "é\n" }"#).unwrap();
        assert_eq!(v["s"], json!("é\n"));
    }
}
