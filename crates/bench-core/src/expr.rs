//! Fixed arithmetic/comparison grammar used by expansion, `where` filters
//! and success-criteria formulas.
//!
//! The grammar is a small expression language: numeric and string literals,
//! the usual arithmetic, bitwise and comparison operators, `and`/`or`/`not`,
//! substring `in`, string slicing and a fixed function set. Names are only
//! valid when bound by the caller (e.g. `value` in a formula); any unbound
//! name makes the input "not an expression" rather than an error, which is
//! how plain strings fall through expansion untouched.

use std::collections::BTreeMap;
use std::fmt;

use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s.trim().parse().ok(),
        }
    }

    /// Parses a figure-of-merit or variable string into the narrowest
    /// numeric value, falling back to a string.
    pub fn from_text(text: &str) -> Value {
        let trimmed = text.trim();
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() {
                return Value::Float(f);
            }
        }
        Value::Str(text.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprError {
    /// The input does not match the grammar (or uses an unbound name).
    NotExpression(String),
    Arithmetic(String),
    Type(String),
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::NotExpression(m) => write!(f, "not an expression: {}", m),
            ExprError::Arithmetic(m) => write!(f, "{}", m),
            ExprError::Type(m) => write!(f, "{}", m),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
}

const OPERATORS: &[&str] = &[
    "**", "//", "<<", ">>", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "^", "&",
    "|", "~", "(", ")", "[", "]", ",", ":",
];

fn not_expr(msg: impl Into<String>) -> ExprError {
    ExprError::NotExpression(msg.into())
}

fn tokenize(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).map_or(false, |d| d.is_ascii_digit()))
        {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            if i < chars.len() && chars[i] == '.' {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    is_float = true;
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            if i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                return Err(not_expr("malformed number"));
            }
            let text: String = chars[start..i].iter().collect();
            if is_float {
                let value = text
                    .parse::<f64>()
                    .map_err(|_| not_expr(format!("malformed number '{}'", text)))?;
                tokens.push(Token::Float(value));
            } else {
                if text.len() > 1 && text.starts_with('0') {
                    return Err(not_expr("leading zeros in integer literal"));
                }
                let value = text
                    .parse::<i64>()
                    .map_err(|_| not_expr(format!("integer literal '{}' out of range", text)))?;
                tokens.push(Token::Int(value));
            }
            continue;
        }
        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut out = String::new();
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i];
                if ch == '\\' && i + 1 < chars.len() {
                    let next = chars[i + 1];
                    match next {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        '\\' | '\'' | '"' => out.push(next),
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                    i += 2;
                    continue;
                }
                if ch == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                out.push(ch);
                i += 1;
            }
            if !closed {
                return Err(not_expr("unterminated string literal"));
            }
            tokens.push(Token::Str(out));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token::Op(*op));
                i += op.chars().count();
            }
            None => return Err(not_expr(format!("unexpected character '{}'", c))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    BitXor,
    BitAnd,
    BitOr,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
    Pos,
    Invert,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr(Node);

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Value),
    Name(String),
    Unary(UnaryOp, Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    Compare(Box<Node>, Vec<(CmpOp, Node)>),
    Call(String, Vec<Node>),
    Index(Box<Node>, Box<Node>),
    Slice(Box<Node>, Option<Box<Node>>, Option<Box<Node>>),
}

const FUNCTIONS: &[&str] = &[
    "min", "max", "floor", "ceil", "abs", "int", "float", "str", "bool", "round", "len",
    "re_search",
];

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token::Op(o)) if *o == op)
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(i)) if i == kw)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ExprError> {
        if self.peek_op(op) {
            self.pos += 1;
            Ok(())
        } else {
            Err(not_expr(format!("expected '{}'", op)))
        }
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_not()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Node, ExprError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn comparison_op(&mut self) -> Option<CmpOp> {
        let op = match self.peek() {
            Some(Token::Op("==")) => CmpOp::Eq,
            Some(Token::Op("!=")) => CmpOp::Ne,
            Some(Token::Op("<")) => CmpOp::Lt,
            Some(Token::Op("<=")) => CmpOp::Le,
            Some(Token::Op(">")) => CmpOp::Gt,
            Some(Token::Op(">=")) => CmpOp::Ge,
            Some(Token::Ident(kw)) if kw == "in" => CmpOp::In,
            Some(Token::Ident(kw)) if kw == "not" => {
                match self.tokens.get(self.pos + 1) {
                    Some(Token::Ident(next)) if next == "in" => {
                        self.pos += 2;
                        return Some(CmpOp::NotIn);
                    }
                    _ => return None,
                }
            }
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn parse_comparison(&mut self) -> Result<Node, ExprError> {
        let first = self.parse_bitor()?;
        let mut rest = Vec::new();
        while let Some(op) = self.comparison_op() {
            rest.push((op, self.parse_bitor()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Node::Compare(Box::new(first), rest))
        }
    }

    fn parse_binary_level(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Parser) -> Result<Node, ExprError>,
    ) -> Result<Node, ExprError> {
        let mut left = next(self)?;
        'outer: loop {
            for (text, op) in ops {
                if self.peek_op(text) {
                    self.pos += 1;
                    let right = next(self)?;
                    left = Node::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_bitor(&mut self) -> Result<Node, ExprError> {
        self.parse_binary_level(&[("|", BinOp::BitOr)], Parser::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> Result<Node, ExprError> {
        self.parse_binary_level(&[("^", BinOp::BitXor)], Parser::parse_bitand)
    }

    fn parse_bitand(&mut self) -> Result<Node, ExprError> {
        self.parse_binary_level(&[("&", BinOp::BitAnd)], Parser::parse_shift)
    }

    fn parse_shift(&mut self) -> Result<Node, ExprError> {
        self.parse_binary_level(
            &[("<<", BinOp::Shl), (">>", BinOp::Shr)],
            Parser::parse_sum,
        )
    }

    fn parse_sum(&mut self) -> Result<Node, ExprError> {
        self.parse_binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Parser::parse_term)
    }

    fn parse_term(&mut self) -> Result<Node, ExprError> {
        self.parse_binary_level(
            &[
                ("*", BinOp::Mul),
                ("//", BinOp::FloorDiv),
                ("/", BinOp::Div),
                ("%", BinOp::Mod),
            ],
            Parser::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Node, ExprError> {
        let op = if self.peek_op("-") {
            Some(UnaryOp::Neg)
        } else if self.peek_op("+") {
            Some(UnaryOp::Pos)
        } else if self.peek_op("~") {
            Some(UnaryOp::Invert)
        } else {
            None
        };
        match op {
            Some(op) => {
                self.pos += 1;
                let inner = self.parse_unary()?;
                Ok(Node::Unary(op, Box::new(inner)))
            }
            None => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Node, ExprError> {
        let base = self.parse_postfix()?;
        if self.peek_op("**") {
            self.pos += 1;
            let exponent = self.parse_unary()?;
            return Ok(Node::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_primary()?;
        while self.peek_op("[") {
            self.pos += 1;
            let start = if self.peek_op(":") {
                None
            } else {
                Some(Box::new(self.parse_or()?))
            };
            if self.peek_op(":") {
                self.pos += 1;
                let end = if self.peek_op("]") {
                    None
                } else {
                    Some(Box::new(self.parse_or()?))
                };
                self.expect_op("]")?;
                node = Node::Slice(Box::new(node), start, end);
            } else {
                self.expect_op("]")?;
                let index = start.ok_or_else(|| not_expr("empty index"))?;
                node = Node::Index(Box::new(node), index);
            }
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Node::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Node::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Node::Literal(Value::Str(s))),
            Some(Token::Ident(name)) => match name.as_str() {
                "True" | "true" => Ok(Node::Literal(Value::Bool(true))),
                "False" | "false" => Ok(Node::Literal(Value::Bool(false))),
                "and" | "or" | "not" | "in" => Err(not_expr(format!("unexpected '{}'", name))),
                _ => {
                    if self.peek_op("(") {
                        if !FUNCTIONS.contains(&name.as_str()) {
                            return Err(not_expr(format!("unknown function '{}'", name)));
                        }
                        self.pos += 1;
                        let mut args = Vec::new();
                        if !self.peek_op(")") {
                            loop {
                                args.push(self.parse_or()?);
                                if self.peek_op(",") {
                                    self.pos += 1;
                                    continue;
                                }
                                break;
                            }
                        }
                        self.expect_op(")")?;
                        Ok(Node::Call(name, args))
                    } else {
                        Ok(Node::Name(name))
                    }
                }
            },
            Some(Token::Op("(")) => {
                let inner = self.parse_or()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Some(other) => Err(not_expr(format!("unexpected token {:?}", other))),
            None => Err(not_expr("unexpected end of input")),
        }
    }
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr, ExprError> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(not_expr("empty input"));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let node = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(not_expr("trailing input"));
        }
        Ok(Expr(node))
    }

    /// True when the expression is a single literal (optionally signed);
    /// such inputs are kept verbatim by expansion.
    pub fn is_literal(&self) -> bool {
        match &self.0 {
            Node::Literal(_) => true,
            Node::Unary(UnaryOp::Neg | UnaryOp::Pos, inner) => {
                matches!(**inner, Node::Literal(Value::Int(_) | Value::Float(_)))
            }
            _ => false,
        }
    }

    pub fn evaluate(&self, bindings: &BTreeMap<String, Value>) -> Result<Value, ExprError> {
        check_names(&self.0, bindings)?;
        eval(&self.0, bindings)
    }
}

/// Parses and evaluates `src` in one step.
pub fn evaluate(src: &str, bindings: &BTreeMap<String, Value>) -> Result<Value, ExprError> {
    Expr::parse(src)?.evaluate(bindings)
}

fn check_names(node: &Node, bindings: &BTreeMap<String, Value>) -> Result<(), ExprError> {
    match node {
        Node::Literal(_) => Ok(()),
        Node::Name(name) => {
            if bindings.contains_key(name) {
                Ok(())
            } else {
                Err(not_expr(format!("unbound name '{}'", name)))
            }
        }
        Node::Unary(_, inner) | Node::Not(inner) => check_names(inner, bindings),
        Node::Binary(_, l, r) | Node::And(l, r) | Node::Or(l, r) | Node::Index(l, r) => {
            check_names(l, bindings)?;
            check_names(r, bindings)
        }
        Node::Compare(first, rest) => {
            check_names(first, bindings)?;
            rest.iter().try_for_each(|(_, n)| check_names(n, bindings))
        }
        Node::Call(_, args) => args.iter().try_for_each(|a| check_names(a, bindings)),
        Node::Slice(target, start, end) => {
            check_names(target, bindings)?;
            if let Some(s) = start {
                check_names(s, bindings)?;
            }
            if let Some(e) = end {
                check_names(e, bindings)?;
            }
            Ok(())
        }
    }
}

fn type_err(msg: impl Into<String>) -> ExprError {
    ExprError::Type(msg.into())
}

fn arith_err(msg: impl Into<String>) -> ExprError {
    ExprError::Arithmetic(msg.into())
}

fn eval(node: &Node, bindings: &BTreeMap<String, Value>) -> Result<Value, ExprError> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Name(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| not_expr(format!("unbound name '{}'", name))),
        Node::Unary(op, inner) => {
            let v = eval(inner, bindings)?;
            match (op, numeric(&v)) {
                (UnaryOp::Neg, Some(Num::I(i))) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| arith_err("integer overflow")),
                (UnaryOp::Neg, Some(Num::F(f))) => Ok(Value::Float(-f)),
                (UnaryOp::Pos, Some(Num::I(i))) => Ok(Value::Int(i)),
                (UnaryOp::Pos, Some(Num::F(f))) => Ok(Value::Float(f)),
                (UnaryOp::Invert, Some(Num::I(i))) => Ok(Value::Int(!i)),
                _ => Err(type_err(format!(
                    "bad operand type for unary operator: '{}'",
                    v.type_name()
                ))),
            }
        }
        Node::Not(inner) => Ok(Value::Bool(!eval(inner, bindings)?.truthy())),
        Node::And(l, r) => {
            let left = eval(l, bindings)?;
            if !left.truthy() {
                Ok(left)
            } else {
                eval(r, bindings)
            }
        }
        Node::Or(l, r) => {
            let left = eval(l, bindings)?;
            if left.truthy() {
                Ok(left)
            } else {
                eval(r, bindings)
            }
        }
        Node::Binary(op, l, r) => {
            let left = eval(l, bindings)?;
            let right = eval(r, bindings)?;
            binary(*op, &left, &right)
        }
        Node::Compare(first, rest) => {
            let mut left = eval(first, bindings)?;
            for (op, node) in rest {
                let right = eval(node, bindings)?;
                if !compare(*op, &left, &right)? {
                    return Ok(Value::Bool(false));
                }
                left = right;
            }
            Ok(Value::Bool(true))
        }
        Node::Call(name, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, bindings))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &values)
        }
        Node::Index(target, index) => {
            let target = eval(target, bindings)?;
            let s = expect_str(&target, "indexing")?;
            let idx = expect_int(&eval(index, bindings)?, "index")?;
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let pos = if idx < 0 { idx + len } else { idx };
            if pos < 0 || pos >= len {
                return Err(type_err("string index out of range"));
            }
            Ok(Value::Str(chars[pos as usize].to_string()))
        }
        Node::Slice(target, start, end) => {
            let target = eval(target, bindings)?;
            let s = expect_str(&target, "slicing")?;
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let bound = |node: &Option<Box<Node>>, default: i64| -> Result<i64, ExprError> {
                match node {
                    None => Ok(default),
                    Some(n) => {
                        let raw = expect_int(&eval(n, bindings)?, "slice bound")?;
                        let adjusted = if raw < 0 { raw + len } else { raw };
                        Ok(adjusted.clamp(0, len))
                    }
                }
            };
            let from = bound(start, 0)?;
            let to = bound(end, len)?;
            if from >= to {
                return Ok(Value::Str(String::new()));
            }
            Ok(Value::Str(chars[from as usize..to as usize].iter().collect()))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    I(i64),
    F(f64),
}

fn numeric(v: &Value) -> Option<Num> {
    match v {
        Value::Int(i) => Some(Num::I(*i)),
        Value::Float(f) => Some(Num::F(*f)),
        Value::Bool(b) => Some(Num::I(*b as i64)),
        Value::Str(_) => None,
    }
}

fn expect_str<'a>(v: &'a Value, ctx: &str) -> Result<&'a str, ExprError> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(type_err(format!("{} requires a str, got {}", ctx, other.type_name()))),
    }
}

fn expect_int(v: &Value, ctx: &str) -> Result<i64, ExprError> {
    match numeric(v) {
        Some(Num::I(i)) => Ok(i),
        _ => Err(type_err(format!("{} must be an int, got {}", ctx, v.type_name()))),
    }
}

const MAX_REPEAT_BYTES: usize = 16 * 1024 * 1024;

fn py_mod_f(a: f64, b: f64) -> f64 {
    a - b * (a / b).floor()
}

fn binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    if let (Value::Str(a), Value::Str(b)) = (left, right) {
        return match op {
            BinOp::Add => Ok(Value::Str(format!("{}{}", a, b))),
            _ => Err(type_err(format!("unsupported operand types for {:?}: str and str", op))),
        };
    }
    if op == BinOp::Mul {
        match (left, right) {
            (Value::Str(s), other) | (other, Value::Str(s)) => {
                let n = expect_int(other, "string repetition count")?;
                let count = usize::try_from(n.max(0)).map_err(|_| arith_err("repetition count too large"))?;
                match s.len().checked_mul(count) {
                    Some(total) if total <= MAX_REPEAT_BYTES => {
                        return Ok(Value::Str(s.repeat(count)))
                    }
                    _ => return Err(arith_err("repeated string too large")),
                }
            }
            _ => {}
        }
    }
    let (a, b) = match (numeric(left), numeric(right)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(type_err(format!(
                "unsupported operand types for {:?}: {} and {}",
                op,
                left.type_name(),
                right.type_name()
            )))
        }
    };
    let overflow = || arith_err("integer overflow");
    match (a, b) {
        (Num::I(x), Num::I(y)) => match op {
            BinOp::Add => x.checked_add(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Sub => x.checked_sub(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Mul => x.checked_mul(y).map(Value::Int).ok_or_else(overflow),
            BinOp::Div => {
                if y == 0 {
                    Err(arith_err("division by zero"))
                } else {
                    Ok(Value::Float(x as f64 / y as f64))
                }
            }
            BinOp::FloorDiv => {
                if y == 0 {
                    Err(arith_err("integer division by zero"))
                } else {
                    let q = x.checked_div_euclid(y).ok_or_else(overflow)?;
                    let r = x.checked_rem_euclid(y).ok_or_else(overflow)?;
                    // div_euclid rounds toward -inf only for positive divisors
                    let q = if y < 0 && r != 0 { q - 1 } else { q };
                    Ok(Value::Int(q))
                }
            }
            BinOp::Mod => {
                if y == 0 {
                    Err(arith_err("integer modulo by zero"))
                } else {
                    let r = x.checked_rem(y).ok_or_else(overflow)?;
                    Ok(Value::Int(if r != 0 && ((r < 0) != (y < 0)) { r + y } else { r }))
                }
            }
            BinOp::Pow => {
                if y >= 0 {
                    let exp = u32::try_from(y).map_err(|_| overflow())?;
                    x.checked_pow(exp).map(Value::Int).ok_or_else(overflow)
                } else if x == 0 {
                    Err(arith_err("zero cannot be raised to a negative power"))
                } else {
                    Ok(Value::Float((x as f64).powf(y as f64)))
                }
            }
            BinOp::BitXor => Ok(Value::Int(x ^ y)),
            BinOp::BitAnd => Ok(Value::Int(x & y)),
            BinOp::BitOr => Ok(Value::Int(x | y)),
            BinOp::Shl => {
                let shift = u32::try_from(y).map_err(|_| arith_err("negative shift count"))?;
                x.checked_shl(shift).map(Value::Int).ok_or_else(overflow)
            }
            BinOp::Shr => {
                let shift = u32::try_from(y).map_err(|_| arith_err("negative shift count"))?;
                Ok(Value::Int(if shift >= 64 { if x < 0 { -1 } else { 0 } } else { x >> shift }))
            }
        },
        (a, b) => {
            let x = match a {
                Num::I(i) => i as f64,
                Num::F(f) => f,
            };
            let y = match b {
                Num::I(i) => i as f64,
                Num::F(f) => f,
            };
            let result = match op {
                BinOp::Add => x + y,
                BinOp::Sub => x - y,
                BinOp::Mul => x * y,
                BinOp::Div => {
                    if y == 0.0 {
                        return Err(arith_err("float division by zero"));
                    }
                    x / y
                }
                BinOp::FloorDiv => {
                    if y == 0.0 {
                        return Err(arith_err("float floor division by zero"));
                    }
                    (x / y).floor()
                }
                BinOp::Mod => {
                    if y == 0.0 {
                        return Err(arith_err("float modulo by zero"));
                    }
                    py_mod_f(x, y)
                }
                BinOp::Pow => x.powf(y),
                BinOp::BitXor | BinOp::BitAnd | BinOp::BitOr | BinOp::Shl | BinOp::Shr => {
                    return Err(type_err("bitwise operators require int operands"))
                }
            };
            if result.is_finite() {
                Ok(Value::Float(result))
            } else {
                Err(arith_err("result is not a finite number"))
            }
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ExprError> {
    use std::cmp::Ordering;
    if matches!(op, CmpOp::In | CmpOp::NotIn) {
        let haystack = expect_str(right, "'in'")?;
        let needle = expect_str(left, "'in'")?;
        let found = haystack.contains(needle);
        return Ok(if op == CmpOp::In { found } else { !found });
    }
    let ordering: Option<Ordering> = match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Str(_), _) | (_, Value::Str(_)) => None,
        _ => {
            let a = left.as_f64().unwrap_or(f64::NAN);
            let b = right.as_f64().unwrap_or(f64::NAN);
            match (numeric(left), numeric(right)) {
                (Some(Num::I(x)), Some(Num::I(y))) => Some(x.cmp(&y)),
                _ => a.partial_cmp(&b),
            }
        }
    };
    match op {
        CmpOp::Eq => Ok(ordering == Some(Ordering::Equal)),
        CmpOp::Ne => Ok(ordering != Some(Ordering::Equal)),
        _ => {
            let ord = match (left, right) {
                (Value::Str(_), Value::Str(_)) => ordering,
                (Value::Str(_), _) | (_, Value::Str(_)) => {
                    return Err(type_err(format!(
                        "cannot order {} and {}",
                        left.type_name(),
                        right.type_name()
                    )))
                }
                _ => ordering,
            };
            Ok(match (op, ord) {
                (_, None) => false,
                (CmpOp::Lt, Some(o)) => o == Ordering::Less,
                (CmpOp::Le, Some(o)) => o != Ordering::Greater,
                (CmpOp::Gt, Some(o)) => o == Ordering::Greater,
                (CmpOp::Ge, Some(o)) => o != Ordering::Less,
                _ => false,
            })
        }
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ExprError> {
    if args.len() < min || args.len() > max {
        Err(type_err(format!(
            "{}() takes {} to {} arguments ({} given)",
            name,
            min,
            max,
            args.len()
        )))
    } else {
        Ok(())
    }
}

fn round_half_even(x: f64) -> f64 {
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        r
    }
}

fn call(name: &str, args: &[Value]) -> Result<Value, ExprError> {
    match name {
        "min" | "max" => {
            arity(name, args, 1, usize::MAX)?;
            let mut best = args[0].clone();
            for candidate in &args[1..] {
                let better = if name == "min" {
                    compare(CmpOp::Lt, candidate, &best)?
                } else {
                    compare(CmpOp::Gt, candidate, &best)?
                };
                if better {
                    best = candidate.clone();
                }
            }
            Ok(best)
        }
        "floor" | "ceil" => {
            arity(name, args, 1, 1)?;
            match numeric(&args[0]) {
                Some(Num::I(i)) => Ok(Value::Int(i)),
                Some(Num::F(f)) => {
                    let r = if name == "floor" { f.floor() } else { f.ceil() };
                    float_to_int(r)
                }
                None => Err(type_err(format!("{}() requires a number", name))),
            }
        }
        "abs" => {
            arity(name, args, 1, 1)?;
            match numeric(&args[0]) {
                Some(Num::I(i)) => i
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| arith_err("integer overflow")),
                Some(Num::F(f)) => Ok(Value::Float(f.abs())),
                None => Err(type_err("abs() requires a number")),
            }
        }
        "int" => {
            arity(name, args, 1, 1)?;
            match &args[0] {
                Value::Str(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| type_err(format!("invalid literal for int(): '{}'", s))),
                other => match numeric(other) {
                    Some(Num::I(i)) => Ok(Value::Int(i)),
                    Some(Num::F(f)) => float_to_int(f.trunc()),
                    None => Err(type_err("int() requires a number or string")),
                },
            }
        }
        "float" => {
            arity(name, args, 1, 1)?;
            args[0]
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| type_err(format!("could not convert '{}' to float", args[0])))
        }
        "str" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Str(args[0].to_string()))
        }
        "bool" => {
            arity(name, args, 1, 1)?;
            Ok(Value::Bool(args[0].truthy()))
        }
        "len" => {
            arity(name, args, 1, 1)?;
            let s = expect_str(&args[0], "len()")?;
            Ok(Value::Int(s.chars().count() as i64))
        }
        "round" => {
            arity(name, args, 1, 2)?;
            let x = args[0]
                .as_f64()
                .filter(|_| !matches!(args[0], Value::Str(_)))
                .ok_or_else(|| type_err("round() requires a number"))?;
            if args.len() == 1 {
                return float_to_int(round_half_even(x));
            }
            let digits = expect_int(&args[1], "round() digits")?;
            let factor = 10f64.powi(digits as i32);
            Ok(Value::Float(round_half_even(x * factor) / factor))
        }
        "re_search" => {
            arity(name, args, 2, 2)?;
            let pattern = expect_str(&args[0], "re_search() pattern")?;
            let text = args[1].to_string();
            let re = Regex::new(pattern)
                .map_err(|e| type_err(format!("invalid regex '{}': {}", pattern, e)))?;
            Ok(Value::Bool(re.is_match(&text)))
        }
        other => Err(not_expr(format!("unknown function '{}'", other))),
    }
}

fn float_to_int(f: f64) -> Result<Value, ExprError> {
    if f.is_finite() && f.abs() < 9.2e18 {
        Ok(Value::Int(f as i64))
    } else {
        Err(arith_err("cannot convert non-finite float to int"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval_str(src: &str) -> Result<Value, ExprError> {
        evaluate(src, &BTreeMap::new())
    }

    #[test]
    fn arithmetic_follows_usual_precedence() {
        assert_eq!(eval_str("2+3*4").expect("eval"), Value::Int(14));
        assert_eq!(eval_str("(2+3)*4").expect("eval"), Value::Int(20));
        assert_eq!(eval_str("2**3**2").expect("eval"), Value::Int(512));
        assert_eq!(eval_str("-2**2").expect("eval"), Value::Int(-4));
        assert_eq!(eval_str("7//2").expect("eval"), Value::Int(3));
        assert_eq!(eval_str("-7//2").expect("eval"), Value::Int(-4));
        assert_eq!(eval_str("-7%3").expect("eval"), Value::Int(2));
        assert_eq!(eval_str("6^3").expect("eval"), Value::Int(5));
        assert_eq!(eval_str("7/2").expect("eval"), Value::Float(3.5));
    }

    #[test]
    fn division_renders_like_a_float() {
        assert_eq!(eval_str("6/3").expect("eval").to_string(), "2.0");
        assert_eq!(eval_str("ceil(5/2)").expect("eval").to_string(), "3");
    }

    #[test]
    fn comparisons_chain_and_short_circuit() {
        assert_eq!(eval_str("1 < 2 < 3").expect("eval"), Value::Bool(true));
        assert_eq!(eval_str("1 < 3 < 2").expect("eval"), Value::Bool(false));
        assert_eq!(eval_str("1 == 1.0").expect("eval"), Value::Bool(true));
        assert_eq!(eval_str("0 and 1/0").expect("eval"), Value::Int(0));
        assert_eq!(
            eval_str("'p1' == 'p1' and not 'x' in 'abc'").expect("eval"),
            Value::Bool(true)
        );
        assert_eq!(eval_str("'b' not in 'abc'").expect("eval"), Value::Bool(false));
    }

    #[test]
    fn functions_and_slicing() {
        assert_eq!(eval_str("min(4, 2, 9)").expect("eval"), Value::Int(2));
        assert_eq!(eval_str("max(1.5, 1)").expect("eval"), Value::Float(1.5));
        assert_eq!(eval_str("floor(2.7)").expect("eval"), Value::Int(2));
        assert_eq!(eval_str("int('42') + 1").expect("eval"), Value::Int(43));
        assert_eq!(eval_str("str(3) + 'x'").expect("eval"), Value::Str("3x".into()));
        assert_eq!(eval_str("'abcdef'[1:3]").expect("eval"), Value::Str("bc".into()));
        assert_eq!(eval_str("'abcdef'[-2:]").expect("eval"), Value::Str("ef".into()));
        assert_eq!(eval_str("'abc'[0]").expect("eval"), Value::Str("a".into()));
        assert_eq!(
            eval_str("re_search('^gpu[0-9]+$', 'gpu12')").expect("eval"),
            Value::Bool(true)
        );
        assert_eq!(eval_str("round(2.5)").expect("eval"), Value::Int(2));
    }

    #[test]
    fn plain_text_is_not_an_expression() {
        for text in ["hostname", "mpirun -n 4", "/usr/bin/time", "2023-10-01", "a.b.c", "50%", ""] {
            assert!(
                matches!(eval_str(text), Err(ExprError::NotExpression(_))),
                "{} should not parse",
                text
            );
        }
    }

    #[test]
    fn literals_are_detected() {
        assert!(Expr::parse("42").expect("parse").is_literal());
        assert!(Expr::parse("-1.5").expect("parse").is_literal());
        assert!(Expr::parse("'x'").expect("parse").is_literal());
        assert!(!Expr::parse("1+1").expect("parse").is_literal());
    }

    #[test]
    fn bound_names_are_usable() {
        let mut bindings = BTreeMap::new();
        bindings.insert("value".to_string(), Value::Float(12.5));
        assert_eq!(
            evaluate("value > 10 and value < 20", &bindings).expect("eval"),
            Value::Bool(true)
        );
    }

    #[test]
    fn evaluation_failures_are_typed() {
        assert!(matches!(eval_str("1/0"), Err(ExprError::Arithmetic(_))));
        assert!(matches!(eval_str("'a' - 'b'"), Err(ExprError::Type(_))));
        assert!(matches!(eval_str("'a' < 1"), Err(ExprError::Type(_))));
    }

    #[test]
    fn integer_edge_cases_are_errors_not_panics() {
        let min = "(-9223372036854775807-1)";
        assert!(matches!(eval_str(&format!("{}//-1", min)), Err(ExprError::Arithmetic(_))));
        assert!(matches!(eval_str(&format!("{}%-1", min)), Err(ExprError::Arithmetic(_))));
        assert_eq!(eval_str("7//-2").expect("eval"), Value::Int(-4));
        assert_eq!(eval_str("7%-2").expect("eval"), Value::Int(-1));
    }

    #[test]
    fn string_repetition_is_bounded() {
        assert_eq!(eval_str("'ab'*3").expect("eval"), Value::Str("ababab".into()));
        assert_eq!(eval_str("'ab'*-1").expect("eval"), Value::Str(String::new()));
        assert!(matches!(
            eval_str("'ab'*9223372036854775807"),
            Err(ExprError::Arithmetic(_))
        ));
    }
}
