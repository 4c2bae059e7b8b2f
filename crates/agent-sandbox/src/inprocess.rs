//! In-Process Restricted Evaluator
//!
//! The cheapest, weakest isolation boundary: a small statement interpreter
//! running inside the host process. Fragments get `let` bindings, arithmetic
//! and string expressions, bounded `repeat` blocks, `print`, and direct calls
//! to the capabilities exposed for the session. A deny-list blocks dangerous
//! operation names outright and every evaluation step counts against the
//! op-count ceiling, so unbounded loops terminate with a distinguishable
//! limit error instead of hanging the loop.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use agent_core::capability::{CallContext, CapabilityCall, CapabilityRegistry};
use agent_core::error::{ExecError, LimitKind};
use agent_core::sandbox::{ResourceLimits, Sandbox, SandboxCaps, SandboxOutput};

/// Operation names a fragment may never reference, regardless of allow-lists.
const DENY_LIST: &[&str] = &[
    "exec",
    "eval",
    "open",
    "spawn",
    "system",
    "shell",
    "env",
    "read_file",
    "write_file",
    "__import__",
];

/// How many repeat-loop iterations run between cooperative yields, so the
/// wall-clock timeout can fire on CPU-bound fragments.
const YIELD_EVERY: u64 = 256;

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Eq,
}

fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '#' => break, // comment to end of line
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '^' => {
                chars.next();
                tokens.push(Token::Caret);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some(other) => s.push(other),
                            None => return Err("unterminated escape".into()),
                        },
                        other => s.push(other),
                    }
                }
                if !closed {
                    return Err("unterminated string literal".into());
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let parsed = num.parse::<f64>().map_err(|_| format!("bad number `{num}`"))?;
                tokens.push(Token::Num(parsed));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Syntax tree
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Var(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Clone, Debug, PartialEq)]
enum Stmt {
    Import,
    Let { name: String, expr: Expr },
    Expr(Expr),
    Repeat { count: Expr, body: Vec<Stmt> },
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            other => Err(format!("expected {expected:?}, got {other:?}")),
        }
    }

    fn parse_full(mut self) -> Result<Expr, String> {
        let expr = self.parse_expr()?;
        if self.pos != self.tokens.len() {
            return Err("trailing tokens after expression".to_string());
        }
        Ok(expr)
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_add()
    }

    fn parse_add(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_pow()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.next();
            let rhs = self.parse_pow()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_pow(&mut self) -> Result<Expr, String> {
        let base = self.parse_unary()?;
        if matches!(self.peek(), Some(Token::Caret)) {
            self.next();
            // Right-associative.
            let exp = self.parse_pow()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exp),
            });
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => {
                if name == "true" {
                    return Ok(Expr::Bool(true));
                }
                if name == "false" {
                    return Ok(Expr::Bool(false));
                }
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.next();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        loop {
                            args.push(self.parse_expr()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    return Ok(Expr::Call { name, args });
                }
                Ok(Expr::Var(name))
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

fn parse_expr_tokens(tokens: Vec<Token>) -> Result<Expr, String> {
    ExprParser::new(tokens).parse_full()
}

/// Parse a whole fragment into statements, handling nested repeat blocks.
fn parse_program(fragment: &str) -> Result<Vec<Stmt>, String> {
    let lines: Vec<&str> = fragment.lines().collect();
    let mut pos = 0;
    let stmts = parse_block(&lines, &mut pos, false)?;
    if pos != lines.len() {
        return Err(format!("unmatched `}}` at line {}", pos + 1));
    }
    Ok(stmts)
}

fn parse_block(lines: &[&str], pos: &mut usize, nested: bool) -> Result<Vec<Stmt>, String> {
    let mut stmts = Vec::new();

    while *pos < lines.len() {
        let line_no = *pos + 1;
        let line = lines[*pos].trim();
        *pos += 1;

        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "}" {
            if nested {
                return Ok(stmts);
            }
            // Caller reports the error with the right position.
            *pos -= 1;
            return Ok(stmts);
        }

        let stmt = parse_line(line, lines, pos)
            .map_err(|e| format!("line {line_no}: {e}"))?;
        stmts.push(stmt);
    }

    if nested {
        return Err("unterminated `repeat` block".into());
    }
    Ok(stmts)
}

fn parse_line(line: &str, lines: &[&str], pos: &mut usize) -> Result<Stmt, String> {
    if line.starts_with("import ") || line.starts_with("from ") || line.starts_with("use ") {
        // Module references were already checked against the allow-list
        // before the fragment reached the sandbox.
        return Ok(Stmt::Import);
    }

    if let Some(rest) = line.strip_suffix('{') {
        let rest = rest.trim();
        let count_src = rest
            .strip_prefix("repeat ")
            .ok_or_else(|| "only `repeat <count> {` opens a block".to_string())?;
        let count = parse_expr_tokens(tokenize(count_src)?)?;
        let body = parse_block(lines, pos, true)?;
        return Ok(Stmt::Repeat { count, body });
    }

    if let Some(rest) = line.strip_prefix("let ") {
        let (name, expr_src) = rest
            .split_once('=')
            .ok_or_else(|| "`let` needs `= <expression>`".to_string())?;
        let name = name.trim();
        if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(format!("bad binding name `{name}`"));
        }
        let expr = parse_expr_tokens(tokenize(expr_src)?)?;
        return Ok(Stmt::Let {
            name: name.to_string(),
            expr,
        });
    }

    Ok(Stmt::Expr(parse_expr_tokens(tokenize(line)?)?))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn number_value(n: f64) -> Result<Value, ExecError> {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| ExecError::Sandbox("non-finite arithmetic result".to_string()))
}

fn as_number(value: &Value) -> Result<f64, ExecError> {
    value
        .as_f64()
        .ok_or_else(|| ExecError::Sandbox(format!("`{}` is not a number", render_value(value))))
}

struct Interp<'a> {
    vars: HashMap<String, Value>,
    stdout: String,
    last: Option<Value>,
    ops: u64,
    max_ops: u64,
    exposed: &'a CapabilityRegistry,
    ctx: &'a CallContext,
}

impl<'a> Interp<'a> {
    fn new(exposed: &'a CapabilityRegistry, limits: &ResourceLimits, ctx: &'a CallContext) -> Self {
        Self {
            vars: HashMap::new(),
            stdout: String::new(),
            last: None,
            ops: 0,
            max_ops: limits.max_ops,
            exposed,
            ctx,
        }
    }

    fn tick(&mut self) -> Result<(), ExecError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(ExecError::Interrupted);
        }
        self.ops += 1;
        if self.ops > self.max_ops {
            return Err(ExecError::ResourceLimitExceeded {
                kind: LimitKind::OpCount,
            });
        }
        Ok(())
    }

    fn exec_block<'b>(&'b mut self, stmts: &'b [Stmt]) -> BoxFuture<'b, Result<(), ExecError>> {
        Box::pin(async move {
            for stmt in stmts {
                self.tick()?;
                match stmt {
                    Stmt::Import => {}
                    Stmt::Let { name, expr } => {
                        let value = self.eval(expr).await?;
                        self.vars.insert(name.clone(), value);
                    }
                    Stmt::Expr(expr) => {
                        let value = self.eval(expr).await?;
                        self.last = Some(value);
                    }
                    Stmt::Repeat { count, body } => {
                        let count = as_number(&self.eval(count).await?)?;
                        if count < 0.0 {
                            return Err(ExecError::Sandbox("negative repeat count".into()));
                        }
                        let count = count as u64;
                        for i in 0..count {
                            if i % YIELD_EVERY == 0 {
                                tokio::task::yield_now().await;
                            }
                            self.exec_block(body).await?;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    fn eval<'b>(&'b mut self, expr: &'b Expr) -> BoxFuture<'b, Result<Value, ExecError>> {
        Box::pin(async move {
            self.tick()?;
            match expr {
                Expr::Num(n) => number_value(*n),
                Expr::Str(s) => Ok(Value::String(s.clone())),
                Expr::Bool(b) => Ok(Value::Bool(*b)),
                Expr::Var(name) => {
                    deny_check(name)?;
                    self.vars.get(name).cloned().ok_or_else(|| {
                        ExecError::Sandbox(format!("unknown variable `{name}`"))
                    })
                }
                Expr::Neg(inner) => {
                    let value = self.eval(inner).await?;
                    number_value(-as_number(&value)?)
                }
                Expr::Binary { op, lhs, rhs } => {
                    let lhs = self.eval(lhs).await?;
                    let rhs = self.eval(rhs).await?;
                    self.apply(*op, &lhs, &rhs)
                }
                Expr::Call { name, args } => {
                    deny_check(name)?;
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval(arg).await?);
                    }
                    self.call(name, values).await
                }
            }
        })
    }

    fn apply(&self, op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, ExecError> {
        // String concatenation piggybacks on `+`.
        if op == BinOp::Add {
            if let (Value::String(a), b) = (lhs, rhs) {
                return Ok(Value::String(format!("{a}{}", render_value(b))));
            }
        }

        let a = as_number(lhs)?;
        let b = as_number(rhs)?;
        let result = match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => {
                if b == 0.0 {
                    return Err(ExecError::Sandbox("division by zero".into()));
                }
                a / b
            }
            BinOp::Pow => a.powf(b),
        };
        number_value(result)
    }

    async fn call(&mut self, name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
        match name {
            "print" => {
                let line = args
                    .iter()
                    .map(render_value)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.stdout.push_str(&line);
                self.stdout.push('\n');
                Ok(Value::Null)
            }
            "len" => match args.as_slice() {
                [Value::String(s)] => number_value(s.chars().count() as f64),
                [Value::Array(items)] => number_value(items.len() as f64),
                _ => Err(ExecError::Sandbox("len() expects one string or array".into())),
            },
            "str" => match args.as_slice() {
                [value] => Ok(Value::String(render_value(value))),
                _ => Err(ExecError::Sandbox("str() expects one argument".into())),
            },
            _ => self.call_capability(name, args).await,
        }
    }

    /// Registered capabilities appear as directly callable functions;
    /// positional arguments map onto the schema's parameter order.
    async fn call_capability(&mut self, name: &str, args: Vec<Value>) -> Result<Value, ExecError> {
        let capability = self
            .exposed
            .get(name)
            .ok_or_else(|| ExecError::CapabilityNotFound(name.to_string()))?;

        let schema = capability.schema();
        if args.len() > schema.parameters.len() {
            return Err(ExecError::Validation(format!(
                "`{name}` takes at most {} arguments, got {}",
                schema.parameters.len(),
                args.len()
            )));
        }

        let arguments: Vec<(String, Value)> = schema
            .parameters
            .iter()
            .zip(args)
            .map(|(param, value)| (param.name.clone(), value))
            .collect();
        let call = CapabilityCall::new(name, arguments);

        let output = self.exposed.invoke(&call, self.ctx).await?;
        Ok(output.value)
    }
}

fn deny_check(name: &str) -> Result<(), ExecError> {
    if DENY_LIST.contains(&name) || name.starts_with("__") {
        return Err(ExecError::PermissionDenied(format!(
            "operation `{name}` is blocked in the in-process sandbox"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// In-process restricted evaluator session.
pub struct InProcessSandbox {
    torn_down: bool,
}

impl InProcessSandbox {
    pub fn new() -> Self {
        Self { torn_down: false }
    }
}

impl Default for InProcessSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for InProcessSandbox {
    fn capabilities(&self) -> SandboxCaps {
        SandboxCaps {
            isolate: false,
            limit_cpu: true,
            limit_memory: false,
            limit_network: true,
            persist_across_calls: false,
        }
    }

    async fn execute(
        &mut self,
        fragment: &str,
        exposed: &CapabilityRegistry,
        limits: &ResourceLimits,
        ctx: &CallContext,
    ) -> Result<SandboxOutput, ExecError> {
        if self.torn_down {
            return Err(ExecError::Sandbox("session already torn down".into()));
        }

        let program = parse_program(fragment)
            .map_err(|e| ExecError::Validation(format!("syntax error: {e}")))?;

        let mut interp = Interp::new(exposed, limits, ctx);
        let outcome = tokio::time::timeout(limits.wall_clock, interp.exec_block(&program)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(ExecError::ResourceLimitExceeded {
                    kind: LimitKind::WallClock,
                })
            }
        }

        let value = match interp.last {
            Some(Value::Null) | None => None,
            Some(value) => Some(render_value(&value)),
        };
        Ok(SandboxOutput {
            stdout: interp.stdout,
            value,
        })
    }

    async fn teardown(&mut self) {
        self.torn_down = true;
    }
}
