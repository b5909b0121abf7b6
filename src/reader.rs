// Marlais Reader - S-Expression Parser
//
// Prefix surface syntax: lists, numbers, strings, characters, booleans,
// `#"sym"` and `key:` symbols, `#rest`/`#key` markers, `'x` quoting,
// `#(...)` vector literals, `;` and `#| |#` comments.

use crate::symbol::SymbolTable;
use crate::types::Value;
use thiserror::Error;

struct ReaderInput {
    chars: Vec<char>,
    index: usize,
}

impl ReaderInput {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            index: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.index += 1;
        Some(c)
    }

    fn position(&self) -> usize {
        self.index
    }
}

/// Reader error types
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReaderError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected '{0}' at position {1}")]
    UnexpectedChar(char, usize),
    #[error("invalid character name: #\\{0}")]
    InvalidChar(String),
    #[error("unknown # syntax: #{0}")]
    InvalidHash(String),
}

pub type ReaderResult = Result<Value, ReaderError>;

pub struct Reader<'a> {
    input: ReaderInput,
    symbols: &'a mut SymbolTable,
}

impl<'a> Reader<'a> {
    pub fn new(input: &str, symbols: &'a mut SymbolTable) -> Self {
        Self {
            input: ReaderInput::new(input),
            symbols,
        }
    }

    pub fn position(&self) -> usize {
        self.input.position()
    }

    /// True when only whitespace and comments remain
    pub fn at_eof(&mut self) -> Result<bool, ReaderError> {
        self.skip_whitespace()?;
        Ok(self.input.peek().is_none())
    }

    /// Read one datum
    pub fn read(&mut self) -> ReaderResult {
        // Nested lists recurse; grow the native stack for deep input
        stacker::maybe_grow(32 * 1024, 1024 * 1024, || self.read_datum())
    }

    fn read_datum(&mut self) -> ReaderResult {
        self.skip_whitespace()?;
        let c = self.input.peek().ok_or(ReaderError::UnexpectedEof)?;
        match c {
            '(' => {
                self.input.next();
                self.read_delimited_list(')')
            }
            ')' => Err(ReaderError::UnexpectedChar(')', self.position())),
            '\'' => {
                self.input.next();
                let datum = self.read()?;
                let quote = self.symbols.intern("quote");
                Ok(Value::list(vec![Value::Name(quote), datum]))
            }
            '"' => {
                self.input.next();
                let s = self.read_string_body()?;
                Ok(Value::string(&s))
            }
            '#' => {
                self.input.next();
                self.read_dispatch()
            }
            _ => {
                let token = self.read_token();
                Ok(self.interpret_token(&token))
            }
        }
    }

    /// Items up to the closing delimiter, which is consumed
    pub fn read_delimited_list(&mut self, delim: char) -> ReaderResult {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace()?;
            match self.input.peek() {
                None => return Err(ReaderError::UnexpectedEof),
                Some(c) if c == delim => {
                    self.input.next();
                    return Ok(Value::list(items));
                }
                Some(_) => items.push(self.read()?),
            }
        }
    }

    fn skip_whitespace(&mut self) -> Result<(), ReaderError> {
        while let Some(c) = self.input.peek() {
            if c.is_whitespace() {
                self.input.next();
            } else if c == ';' {
                while let Some(c) = self.input.next() {
                    if c == '\n' {
                        break;
                    }
                }
            } else if c == '#' && self.input.chars.get(self.input.index + 1) == Some(&'|') {
                self.input.index += 2;
                self.skip_block_comment()?;
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Nested `#| ... |#`
    fn skip_block_comment(&mut self) -> Result<(), ReaderError> {
        let mut depth = 1;
        while depth > 0 {
            match self.input.next() {
                None => return Err(ReaderError::UnexpectedEof),
                Some('|') if self.input.peek() == Some('#') => {
                    self.input.next();
                    depth -= 1;
                }
                Some('#') if self.input.peek() == Some('|') => {
                    self.input.next();
                    depth += 1;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn read_string_body(&mut self) -> Result<String, ReaderError> {
        let mut s = String::new();
        loop {
            match self.input.next().ok_or(ReaderError::UnexpectedEof)? {
                '"' => return Ok(s),
                '\\' => match self.input.next().ok_or(ReaderError::UnexpectedEof)? {
                    'n' => s.push('\n'),
                    't' => s.push('\t'),
                    other => s.push(other),
                },
                c => s.push(c),
            }
        }
    }

    fn read_dispatch(&mut self) -> ReaderResult {
        match self.input.peek() {
            Some('"') => {
                self.input.next();
                let name = self.read_string_body()?;
                Ok(Value::Symbol(self.symbols.intern(&name)))
            }
            Some('\\') => {
                self.input.next();
                self.read_character()
            }
            Some('(') => {
                self.input.next();
                let items = self.read_delimited_list(')')?;
                Ok(Value::vector(items.list_to_vec().unwrap_or_default()))
            }
            _ => {
                let token = self.read_token();
                match token.to_ascii_lowercase().as_str() {
                    "t" => Ok(Value::Boolean(true)),
                    "f" => Ok(Value::Boolean(false)),
                    "eof" => Ok(Value::Eof),
                    "rest" | "key" | "all-keys" => {
                        Ok(Value::Name(self.symbols.intern(&format!("#{}", token))))
                    }
                    _ => Err(ReaderError::InvalidHash(token)),
                }
            }
        }
    }

    fn read_character(&mut self) -> ReaderResult {
        let first = self.input.next().ok_or(ReaderError::UnexpectedEof)?;
        let mut name = String::from(first);
        while let Some(c) = self.input.peek() {
            if is_delimiter(c) {
                break;
            }
            name.push(c);
            self.input.next();
        }
        if name.chars().count() == 1 {
            return Ok(Value::Character(first));
        }
        match name.to_ascii_lowercase().as_str() {
            "space" => Ok(Value::Character(' ')),
            "newline" => Ok(Value::Character('\n')),
            "tab" => Ok(Value::Character('\t')),
            _ => Err(ReaderError::InvalidChar(name)),
        }
    }

    fn read_token(&mut self) -> String {
        let mut token = String::new();
        while let Some(c) = self.input.peek() {
            if is_delimiter(c) {
                break;
            }
            token.push(c);
            self.input.next();
        }
        token
    }

    fn interpret_token(&mut self, token: &str) -> Value {
        if let Some(n) = parse_number(token) {
            return n;
        }
        match token.strip_suffix(':') {
            Some(keyword) if !keyword.is_empty() && !keyword.ends_with(':') => {
                Value::Symbol(self.symbols.intern(keyword))
            }
            _ => Value::Name(self.symbols.intern(token)),
        }
    }
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '"' | ';' | '\'')
}

fn parse_number(token: &str) -> Option<Value> {
    let digits = token.strip_prefix(['-', '+']).unwrap_or(token);
    let starts_numeric = digits
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || (c == '.' && digits.len() > 1));
    if !starts_numeric {
        return None;
    }
    if let Ok(n) = token.parse::<i64>() {
        return Some(Value::Integer(n));
    }
    token.parse::<f64>().ok().map(Value::Float)
}

/// Read a single datum
pub fn read_from_string(input: &str, symbols: &mut SymbolTable) -> ReaderResult {
    Reader::new(input, symbols).read()
}

/// Read every datum in `input`
pub fn read_all(input: &str, symbols: &mut SymbolTable) -> Result<Vec<Value>, ReaderError> {
    let mut reader = Reader::new(input, symbols);
    let mut forms = Vec::new();
    while !reader.at_eof()? {
        forms.push(reader.read()?);
    }
    Ok(forms)
}
