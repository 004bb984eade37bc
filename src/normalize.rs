//! Repair of the device's relaxed JSON payloads.
//!
//! Verbose TTP responses look like JSON but are not: members and array
//! elements are separated by spaces instead of commas, enumerated values are
//! bare words, and the top level has no surrounding braces:
//!
//! ```text
//! "value":{"hostname":"TesiraServer91" "linkStatus":LINK_1_GB} "list":[1 2 3]
//! ```
//!
//! [`parse_payload`] reads this form (and strict JSON objects) into a
//! [`serde_json::Value`] object. Unquoted keys are accepted, bare words that
//! are not `true`, `false`, `null` or a JSON number become strings, and a run
//! of bare words in a member value becomes one space-joined string
//! (`label:Mic 1` → `"label":"Mic 1"`).

use crate::error::{Result, TesiraError};
use serde_json::{Map, Value};

const MAX_DEPTH: usize = 64;

/// Repair a payload and return it as strict JSON text
pub fn normalize(raw: &str) -> Result<String> {
    let value = parse_payload(raw)?;
    Ok(serde_json::to_string(&value)?)
}

/// Repair a payload into a JSON object
pub fn parse_payload(raw: &str) -> Result<Value> {
    let tokens = lex(raw)?;
    let mut parser = Parser { tokens, pos: 0 };

    if matches!(parser.tokens.first(), Some(Token::Open('{'))) {
        let value = parser.value(0, false)?;
        if parser.pos != parser.tokens.len() {
            return Err(TesiraError::Normalize(format!(
                "unexpected data after object in \"{}\"",
                raw
            )));
        }
        return Ok(value);
    }

    parser.members(0, false).map(Value::Object)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open(char),
    Close(char),
    Colon,
    Comma,
    Str(String),
    Atom(String),
}

fn lex(raw: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = raw.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '{' | '[' => {
                chars.next();
                tokens.push(Token::Open(c));
            }
            '}' | ']' => {
                chars.next();
                tokens.push(Token::Close(c));
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '"' => {
                chars.next();
                tokens.push(Token::Str(lex_string(&mut chars)?));
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | '[' | ']' | ':' | ',' | '"') {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }

    Ok(tokens)
}

fn lex_string(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<String> {
    let mut out = String::new();
    loop {
        match chars.next() {
            None => return Err(TesiraError::Normalize("unterminated string".to_string())),
            Some('"') => return Ok(out),
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('b') => out.push('\u{8}'),
                Some('f') => out.push('\u{c}'),
                Some('u') => {
                    let hex: String = chars.by_ref().take(4).collect();
                    let code = u32::from_str_radix(&hex, 16).map_err(|_| {
                        TesiraError::Normalize(format!("invalid unicode escape \\u{}", hex))
                    })?;
                    out.push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));
                }
                Some(other) => out.push(other),
                None => return Err(TesiraError::Normalize("unterminated string".to_string())),
            },
            Some(c) => out.push(c),
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn skip_commas(&mut self) {
        while self.peek() == Some(&Token::Comma) {
            self.pos += 1;
        }
    }

    /// Object members up to `}` (when `closed`) or end of input
    fn members(&mut self, depth: usize, closed: bool) -> Result<Map<String, Value>> {
        if depth > MAX_DEPTH {
            return Err(TesiraError::Normalize("nesting too deep".to_string()));
        }

        let mut map = Map::new();
        loop {
            self.skip_commas();
            let key = match self.next() {
                None if closed => {
                    return Err(TesiraError::Normalize("unterminated object".to_string()))
                }
                None => return Ok(map),
                Some(Token::Close('}')) if closed => return Ok(map),
                Some(Token::Str(key)) | Some(Token::Atom(key)) => key,
                Some(other) => {
                    return Err(TesiraError::Normalize(format!(
                        "expected key, found {:?}",
                        other
                    )))
                }
            };

            if self.next() != Some(Token::Colon) {
                return Err(TesiraError::Normalize(format!("missing ':' after key \"{}\"", key)));
            }

            let value = self.value(depth, true)?;
            map.insert(key, value);
        }
    }

    /// One value; in member position a run of bare words is joined
    fn value(&mut self, depth: usize, member: bool) -> Result<Value> {
        match self.next() {
            Some(Token::Open('{')) => self.members(depth + 1, true).map(Value::Object),
            Some(Token::Open('[')) => self.elements(depth + 1),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Atom(first)) => {
                if !member {
                    return Ok(literal(first));
                }
                let mut words = vec![first];
                while let Some(Token::Atom(word)) = self.peek() {
                    // a bare word followed by ':' starts the next member
                    if self.peek_at(1) == Some(&Token::Colon) {
                        break;
                    }
                    words.push(word.clone());
                    self.pos += 1;
                }
                if words.len() == 1 {
                    Ok(literal(words.remove(0)))
                } else {
                    Ok(Value::String(words.join(" ")))
                }
            }
            Some(other) => Err(TesiraError::Normalize(format!(
                "expected value, found {:?}",
                other
            ))),
            None => Err(TesiraError::Normalize("missing value".to_string())),
        }
    }

    fn elements(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(TesiraError::Normalize("nesting too deep".to_string()));
        }

        let mut items = Vec::new();
        loop {
            self.skip_commas();
            match self.peek() {
                Some(Token::Close(']')) => {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                None => return Err(TesiraError::Normalize("unterminated array".to_string())),
                _ => items.push(self.value(depth, false)?),
            }
        }
    }
}

fn literal(word: String) -> Value {
    match word.as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => match serde_json::from_str::<serde_json::Number>(&word) {
            Ok(n) => Value::Number(n),
            Err(_) => Value::String(word),
        },
    }
}
