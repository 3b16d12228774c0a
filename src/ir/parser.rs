//! Reader for the textual IR form.
//!
//! ```text
//! module demo
//!
//! global export mut counter = 0
//!
//! export func add(a, b) {
//!     arg a
//!     arg b
//!     add
//!     ret
//! }
//! ```
//!
//! One declaration or instruction per line; `;` starts a comment and
//! `NAME:` defines a label inside a function body.

use std::collections::HashMap;

use super::{Function, Global, Inst, Linkage, Module};

/// A syntax error with its 1-based position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{line}:{column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Token<'a> {
    pub(super) text: &'a str,
    pub(super) column: usize,
}

fn is_punct(c: char) -> bool {
    matches!(c, '(' | ')' | ',' | '{' | '}' | '=')
}

/// Split one line into tokens, dropping any comment.
pub(super) fn tokenize(line: &str) -> Vec<Token<'_>> {
    let code = match line.find(';') {
        Some(idx) => &line[..idx],
        None => line,
    };

    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (idx, c) in code.char_indices() {
        if c.is_whitespace() || is_punct(c) {
            if let Some(s) = start.take() {
                tokens.push(Token {
                    text: &code[s..idx],
                    column: code[..s].chars().count() + 1,
                });
            }
            if is_punct(c) {
                tokens.push(Token {
                    text: &code[idx..idx + c.len_utf8()],
                    column: code[..idx].chars().count() + 1,
                });
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        tokens.push(Token {
            text: &code[s..],
            column: code[..s].chars().count() + 1,
        });
    }
    tokens
}

/// Function being read, with name tables for its operands.
struct FunctionState {
    function: Function,
    labels: HashMap<String, u32>,
    defined_labels: HashMap<u32, usize>,
    open_line: usize,
}

impl FunctionState {
    fn label_id(&mut self, name: &str) -> u32 {
        let next = self.labels.len() as u32;
        *self.labels.entry(name.to_string()).or_insert(next)
    }
}

struct Parser<'a> {
    source: &'a str,
    module: Option<Module>,
    current: Option<FunctionState>,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            module: None,
            current: None,
            line: 0,
        }
    }

    fn error(&self, column: usize, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line,
            column,
            message: message.into(),
        }
    }

    fn parse(mut self) -> Result<Module, ParseError> {
        for (idx, line) in self.source.lines().enumerate() {
            self.line = idx + 1;
            let tokens = tokenize(line);
            if tokens.is_empty() {
                continue;
            }
            if self.current.is_some() {
                self.parse_body_line(&tokens)?;
            } else {
                self.parse_top_level(&tokens)?;
            }
        }

        if let Some(state) = &self.current {
            let open_line = state.open_line;
            return Err(ParseError {
                line: open_line,
                column: 1,
                message: format!("function `{}` is missing a closing `}}`", state.function.name),
            });
        }
        self.module.ok_or(ParseError {
            line: 1,
            column: 1,
            message: "expected `module NAME`".to_string(),
        })
    }

    fn module_mut(&mut self, column: usize) -> Result<&mut Module, ParseError> {
        let err = self.error(column, "expected `module NAME` before declarations");
        self.module.as_mut().ok_or(err)
    }

    fn parse_top_level(&mut self, tokens: &[Token<'_>]) -> Result<(), ParseError> {
        let first = tokens[0];
        match first.text {
            "module" => {
                if self.module.is_some() {
                    return Err(self.error(first.column, "duplicate `module` header"));
                }
                let name = self.expect_name(tokens, 1, first.column)?;
                self.expect_end(tokens, 2)?;
                self.module = Some(Module::new(name.text));
                Ok(())
            }
            "global" => self.parse_global(tokens),
            "export" | "func" => self.parse_function_header(tokens),
            other => Err(self.error(first.column, format!("unexpected `{}`", other))),
        }
    }

    fn parse_global(&mut self, tokens: &[Token<'_>]) -> Result<(), ParseError> {
        let mut idx = 1;
        let mut linkage = Linkage::Internal;
        let mut mutable = false;
        while let Some(tok) = tokens.get(idx) {
            match tok.text {
                "export" => linkage = Linkage::Export,
                "mut" => mutable = true,
                _ => break,
            }
            idx += 1;
        }
        let name = self.expect_name(tokens, idx, tokens[0].column)?;
        self.expect_punct(tokens, idx + 1, "=")?;

        let mut words = Vec::new();
        let mut pos = idx + 2;
        loop {
            let tok = tokens
                .get(pos)
                .ok_or_else(|| self.error(name.column, "expected a value"))?;
            words.push(self.parse_int(*tok)?);
            match tokens.get(pos + 1) {
                None => break,
                Some(t) if t.text == "," => pos += 2,
                Some(t) => return Err(self.error(t.column, format!("expected `,`, found `{}`", t.text))),
            }
        }

        let global = Global {
            name: name.text.to_string(),
            linkage,
            mutable,
            words,
        };
        self.module_mut(tokens[0].column)?.add_global(global);
        Ok(())
    }

    fn parse_function_header(&mut self, tokens: &[Token<'_>]) -> Result<(), ParseError> {
        let mut idx = 0;
        let linkage = if tokens[0].text == "export" {
            idx = 1;
            Linkage::Export
        } else {
            Linkage::Internal
        };
        match tokens.get(idx) {
            Some(t) if t.text == "func" => {}
            Some(t) => return Err(self.error(t.column, format!("expected `func`, found `{}`", t.text))),
            None => return Err(self.error(tokens[0].column, "expected `func`")),
        }
        let name = self.expect_name(tokens, idx + 1, tokens[idx].column)?;
        self.expect_punct(tokens, idx + 2, "(")?;

        let mut params = Vec::new();
        let mut pos = idx + 3;
        loop {
            let tok = tokens
                .get(pos)
                .ok_or_else(|| self.error(name.column, "unterminated parameter list"))?;
            match tok.text {
                ")" => break,
                "," if !params.is_empty() => pos += 1,
                text if !text.starts_with(is_punct) => {
                    params.push(text.to_string());
                    pos += 1;
                }
                other => return Err(self.error(tok.column, format!("unexpected `{}`", other))),
            }
        }
        self.expect_punct(tokens, pos + 1, "{")?;
        self.expect_end(tokens, pos + 2)?;
        self.module_mut(tokens[0].column)?;

        let mut function = Function::new(name.text, &[]);
        function.params = params;
        function.linkage = linkage;
        self.current = Some(FunctionState {
            function,
            labels: HashMap::new(),
            defined_labels: HashMap::new(),
            open_line: self.line,
        });
        Ok(())
    }

    fn parse_body_line(&mut self, tokens: &[Token<'_>]) -> Result<(), ParseError> {
        let first = tokens[0];

        if first.text == "}" {
            self.expect_end(tokens, 1)?;
            if let Some(state) = self.current.take() {
                if let Some((name, _)) = state
                    .labels
                    .iter()
                    .find(|(_, id)| !state.defined_labels.contains_key(*id))
                {
                    return Err(self.error(first.column, format!("undefined label `{}`", name)));
                }
                self.module_mut(first.column)?.add_function(state.function);
            }
            return Ok(());
        }

        if first.text == "local" {
            let names: Vec<String> = tokens[1..]
                .iter()
                .filter(|t| t.text != ",")
                .map(|t| t.text.to_string())
                .collect();
            if names.is_empty() {
                return Err(self.error(first.column, "expected local names"));
            }
            if let Some(state) = self.current.as_mut() {
                state.function.locals.extend(names);
            }
            return Ok(());
        }

        if tokens.len() == 1
            && let Some(label) = first.text.strip_suffix(':')
            && !label.is_empty()
            && !label.ends_with(':')
        {
            let line = self.line;
            let state = self.state()?;
            let id = state.label_id(label);
            if let Some(prev) = state.defined_labels.insert(id, line) {
                return Err(ParseError {
                    line,
                    column: first.column,
                    message: format!("label `{}` already defined on line {}", label, prev),
                });
            }
            state.function.body.push(Inst::Label(id));
            return Ok(());
        }

        let inst = self.parse_inst(tokens)?;
        self.state()?.function.body.push(inst);
        Ok(())
    }

    fn state(&mut self) -> Result<&mut FunctionState, ParseError> {
        let err = self.error(1, "instruction outside of a function");
        self.current.as_mut().ok_or(err)
    }

    fn parse_inst(&mut self, tokens: &[Token<'_>]) -> Result<Inst, ParseError> {
        let op = tokens[0];
        let simple = match op.text {
            "add" => Some(Inst::Add),
            "sub" => Some(Inst::Sub),
            "mul" => Some(Inst::Mul),
            "div" => Some(Inst::Div),
            "rem" => Some(Inst::Rem),
            "and" => Some(Inst::And),
            "or" => Some(Inst::Or),
            "xor" => Some(Inst::Xor),
            "shl" => Some(Inst::Shl),
            "shr" => Some(Inst::Shr),
            "neg" => Some(Inst::Neg),
            "eq" => Some(Inst::Eq),
            "ne" => Some(Inst::Ne),
            "lt" => Some(Inst::Lt),
            "le" => Some(Inst::Le),
            "gt" => Some(Inst::Gt),
            "ge" => Some(Inst::Ge),
            "dup" => Some(Inst::Dup),
            "drop" => Some(Inst::Drop),
            "load" => Some(Inst::Load),
            "store" => Some(Inst::Store),
            "ret" => Some(Inst::Ret),
            _ => None,
        };
        if let Some(inst) = simple {
            self.expect_end(tokens, 1)?;
            return Ok(inst);
        }

        if !matches!(
            op.text,
            "const" | "arg" | "local.get" | "local.set" | "jump" | "br_zero" | "br_nonzero" | "call" | "addr"
        ) {
            return Err(self.error(op.column, format!("unknown instruction `{}`", op.text)));
        }

        let operand = *tokens
            .get(1)
            .ok_or_else(|| self.error(op.column, format!("`{}` expects an operand", op.text)))?;

        let inst = match op.text {
            "const" => Inst::Const(self.parse_int(operand)?),
            "arg" => {
                let state = self.state()?;
                let index = resolve_index(&state.function.params, operand.text);
                Inst::Arg(index.ok_or_else(|| {
                    self.error(operand.column, format!("unknown parameter `{}`", operand.text))
                })?)
            }
            "local.get" | "local.set" => {
                let state = self.state()?;
                let index = resolve_index(&state.function.locals, operand.text).ok_or_else(|| {
                    self.error(operand.column, format!("unknown local `{}`", operand.text))
                })?;
                if op.text == "local.get" {
                    Inst::LocalGet(index)
                } else {
                    Inst::LocalSet(index)
                }
            }
            "jump" | "br_zero" | "br_nonzero" => {
                let id = self.state()?.label_id(operand.text);
                match op.text {
                    "jump" => Inst::Jump(id),
                    "br_zero" => Inst::BranchIfZero(id),
                    _ => Inst::BranchIfNonZero(id),
                }
            }
            "call" => {
                let argc = match tokens.get(2) {
                    Some(tok) => {
                        let value = self.parse_int(*tok)?;
                        u32::try_from(value)
                            .map_err(|_| self.error(tok.column, "argument count out of range"))?
                    }
                    None => 0,
                };
                if tokens.len() > 3 {
                    return Err(self.error(tokens[3].column, "unexpected trailing input"));
                }
                return Ok(Inst::Call {
                    callee: operand.text.to_string(),
                    argc,
                });
            }
            _ => Inst::SymbolAddr(operand.text.to_string()),
        };
        self.expect_end(tokens, 2)?;
        Ok(inst)
    }

    fn parse_int(&self, tok: Token<'_>) -> Result<i64, ParseError> {
        let (negative, digits) = match tok.text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, tok.text),
        };
        let magnitude = if let Some(hex) = digits.strip_prefix("0x") {
            u64::from_str_radix(hex, 16)
        } else {
            digits.parse::<u64>()
        }
        .map_err(|_| self.error(tok.column, format!("invalid integer `{}`", tok.text)))?;

        if negative {
            if magnitude > i64::MAX as u64 + 1 {
                return Err(self.error(tok.column, format!("integer `{}` out of range", tok.text)));
            }
            Ok((magnitude as i64).wrapping_neg())
        } else {
            // Hex literals may spell any 64-bit pattern
            if magnitude > i64::MAX as u64 && !digits.starts_with("0x") {
                return Err(self.error(tok.column, format!("integer `{}` out of range", tok.text)));
            }
            Ok(magnitude as i64)
        }
    }

    fn expect_name<'t>(
        &self,
        tokens: &[Token<'t>],
        idx: usize,
        column: usize,
    ) -> Result<Token<'t>, ParseError> {
        match tokens.get(idx) {
            Some(tok) if !tok.text.starts_with(is_punct) => Ok(*tok),
            Some(tok) => Err(self.error(tok.column, format!("expected a name, found `{}`", tok.text))),
            None => Err(self.error(column, "expected a name")),
        }
    }

    fn expect_punct(&self, tokens: &[Token<'_>], idx: usize, punct: &str) -> Result<(), ParseError> {
        match tokens.get(idx) {
            Some(tok) if tok.text == punct => Ok(()),
            Some(tok) => Err(self.error(tok.column, format!("expected `{}`, found `{}`", punct, tok.text))),
            None => {
                let column = tokens.last().map_or(1, |t| t.column + t.text.len());
                Err(self.error(column, format!("expected `{}`", punct)))
            }
        }
    }

    fn expect_end(&self, tokens: &[Token<'_>], idx: usize) -> Result<(), ParseError> {
        match tokens.get(idx) {
            None => Ok(()),
            Some(tok) => Err(self.error(tok.column, format!("unexpected `{}`", tok.text))),
        }
    }
}

/// Resolve an operand given by name or by index.
fn resolve_index(names: &[String], operand: &str) -> Option<u32> {
    if let Some(pos) = names.iter().position(|n| n == operand) {
        return Some(pos as u32);
    }
    operand.parse::<u32>().ok()
}

/// Parse a module from its textual form.
pub fn parse_module(source: &str) -> Result<Module, ParseError> {
    Parser::new(source).parse()
}
