//! Formula parsing and evaluation.
//!
//! Formulas combine numbers, `@path` variables, arithmetic, comparisons,
//! a handful of functions and dice terms:
//!
//! ```text
//! 1d8 + @abilities.str.mod
//! floor(@powerAttackBonus * @weaponHands) * @critMult
//! (min(@cl, 10))d6
//! 2d20kh1 + @bab
//! @bab >= 6 && @conditions.prone == 0
//! ```
//!
//! A formula is parsed once into an expression tree. [`Formula::roll`]
//! rolls every die exactly once and keeps the faces in the returned
//! [`Roll`], which can later be [`replayed`](Roll::replay) without touching
//! the dice again. [`Formula::compute`] is the dice-free form used for
//! derived values such as maximum charges.

use crate::context::{format_number, RollContext};
use crate::dice::{DiceError, DiceRoller, DiceTerm, Keep};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error type for formula parsing and evaluation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("Empty formula")]
    Empty,
    #[error("Unexpected character '{ch}' at position {pos} in \"{formula}\"")]
    UnexpectedChar {
        ch: char,
        pos: usize,
        formula: String,
    },
    #[error("Unexpected {found} in \"{formula}\"")]
    UnexpectedToken { found: String, formula: String },
    #[error("Unexpected end of formula \"{0}\"")]
    UnexpectedEnd(String),
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Function {name} expects {expected} argument(s), got {found}")]
    BadArity {
        name: String,
        expected: &'static str,
        found: usize,
    },
    #[error("Variable @{0} does not hold a number or formula")]
    NonNumericVariable(String),
    #[error("Formula nesting deeper than {depth} levels at @{variable}")]
    RecursionLimit { depth: usize, variable: String },
    #[error("Formula nests deeper than {0} levels")]
    TooDeep(usize),
    #[error("Formula longer than {0} tokens")]
    TooLong(usize),
    #[error("Dice are not allowed in derived value \"{0}\"")]
    DiceNotAllowed(String),
    #[error("Division by zero in \"{0}\"")]
    DivisionByZero(String),
    #[error("No stored dice left to replay \"{0}\"")]
    ReplayExhausted(String),
    #[error(transparent)]
    Dice(#[from] DiceError),
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Var(String),
    Ident(String),
    Dice,
    Keep(Keep),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    LParen,
    RParen,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Num(n) => write!(f, "number {}", format_number(*n)),
            Token::Var(v) => write!(f, "variable @{v}"),
            Token::Ident(i) => write!(f, "identifier '{i}'"),
            Token::Dice => write!(f, "'d'"),
            Token::Keep(_) => write!(f, "keep modifier"),
            other => write!(f, "operator {other:?}"),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let unexpected = |ch: char, pos: usize| FormulaError::UnexpectedChar {
        ch,
        pos,
        formula: src.to_string(),
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                let mut seen_dot = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || (chars[i] == '.' && !seen_dot)) {
                    seen_dot |= chars[i] == '.';
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| unexpected(c, start))?;
                tokens.push(Token::Num(value));
            }
            '@' => {
                let start = i + 1;
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let path: String = chars[start..i].iter().collect();
                let path = path.trim_end_matches('.').to_string();
                if path.is_empty() {
                    return Err(unexpected('@', start - 1));
                }
                tokens.push(Token::Var(path));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                split_word(&word, &mut tokens);
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += if next == Some('=') { 2 } else { 1 };
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            other => return Err(unexpected(other, i)),
        }
    }
    Ok(tokens)
}

/// Split an identifier-like word into dice, keep and identifier tokens.
///
/// `d8` becomes `Dice Num(8)`, `d20kh1` becomes `Dice Num(20) Keep`, and a
/// bare `d` (as in `(@cl)d6` written `(@cl)d(6)`) becomes `Dice`.
fn split_word(word: &str, tokens: &mut Vec<Token>) {
    match word {
        "true" => return tokens.push(Token::Num(1.0)),
        "false" => return tokens.push(Token::Num(0.0)),
        _ => {}
    }
    if let Some(keep) = parse_keep(word) {
        return tokens.push(Token::Keep(keep));
    }
    let lower = word.to_ascii_lowercase();
    if let Some(rest) = lower.strip_prefix('d') {
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        let tail = &rest[digits.len()..];
        let keep = if tail.is_empty() { None } else { parse_keep(tail) };
        if tail.is_empty() || keep.is_some() {
            tokens.push(Token::Dice);
            if let Ok(sides) = digits.parse::<f64>() {
                tokens.push(Token::Num(sides));
            }
            if let Some(keep) = keep {
                tokens.push(Token::Keep(keep));
            }
            return;
        }
    }
    tokens.push(Token::Ident(word.to_string()));
}

fn parse_keep(word: &str) -> Option<Keep> {
    let lower = word.to_ascii_lowercase();
    let (highest, digits) = if let Some(d) = lower.strip_prefix("kh") {
        (true, d)
    } else if let Some(d) = lower.strip_prefix("kl") {
        (false, d)
    } else {
        return None;
    };
    let n = if digits.is_empty() {
        1
    } else {
        digits.parse::<u32>().ok()?
    };
    Some(if highest { Keep::Highest(n) } else { Keep::Lowest(n) })
}

// ============================================================================
// Expression tree
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    fn precedence(self) -> u8 {
        match self {
            BinOp::Or => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 3,
            BinOp::Add | BinOp::Sub => 4,
            BinOp::Mul | BinOp::Div | BinOp::Rem => 5,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Floor,
    Ceil,
    Round,
    Abs,
    Min,
    Max,
}

impl Func {
    fn from_name(name: &str) -> Option<Func> {
        match name.to_ascii_lowercase().as_str() {
            "floor" => Some(Func::Floor),
            "ceil" => Some(Func::Ceil),
            "round" => Some(Func::Round),
            "abs" => Some(Func::Abs),
            "min" => Some(Func::Min),
            "max" => Some(Func::Max),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Func::Floor => "floor",
            Func::Ceil => "ceil",
            Func::Round => "round",
            Func::Abs => "abs",
            Func::Min => "min",
            Func::Max => "max",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Dice {
        count: Box<Expr>,
        sides: Box<Expr>,
        keep: Keep,
    },
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call { func: Func, args: Vec<Expr> },
}

const UNARY_PRECEDENCE: u8 = 6;
const PRIMARY_PRECEDENCE: u8 = 8;

impl Expr {
    fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn has_dice(&self) -> bool {
        match self {
            Expr::Num(_) | Expr::Var(_) => false,
            Expr::Dice { .. } => true,
            Expr::Neg(e) | Expr::Not(e) => e.has_dice(),
            Expr::Binary { lhs, rhs, .. } => lhs.has_dice() || rhs.has_dice(),
            Expr::Call { args, .. } => args.iter().any(Expr::has_dice),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Neg(_) | Expr::Not(_) => UNARY_PRECEDENCE,
            Expr::Dice { .. } => 7,
            _ => PRIMARY_PRECEDENCE,
        }
    }

    fn fmt_within(&self, parent: u8, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.precedence() < parent {
            write!(f, "(")?;
            self.fmt_bare(f)?;
            write!(f, ")")
        } else {
            self.fmt_bare(f)
        }
    }

    fn fmt_bare(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num(n) => write!(f, "{}", format_number(*n)),
            Expr::Var(path) => write!(f, "@{path}"),
            Expr::Dice { count, sides, keep } => {
                count.fmt_within(PRIMARY_PRECEDENCE, f)?;
                write!(f, "d")?;
                sides.fmt_within(PRIMARY_PRECEDENCE, f)?;
                match keep {
                    Keep::All => Ok(()),
                    Keep::Highest(k) => write!(f, "kh{k}"),
                    Keep::Lowest(k) => write!(f, "kl{k}"),
                }
            }
            Expr::Neg(e) => {
                write!(f, "-")?;
                e.fmt_within(UNARY_PRECEDENCE, f)
            }
            Expr::Not(e) => {
                write!(f, "!")?;
                e.fmt_within(UNARY_PRECEDENCE, f)
            }
            Expr::Binary { op, lhs, rhs } => {
                let p = op.precedence();
                lhs.fmt_within(p, f)?;
                write!(f, " {} ", op.symbol())?;
                rhs.fmt_within(p + 1, f)
            }
            Expr::Call { func, args } => {
                write!(f, "{}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    arg.fmt_bare(f)?;
                }
                write!(f, ")")
            }
        }
    }

    /// Multiply every dice count in the tree by `mult`.
    fn scale_dice(&self, mult: f64) -> Expr {
        match self {
            Expr::Dice { count, sides, keep } => Expr::Dice {
                count: Box::new(times(count.as_ref().clone(), mult)),
                sides: sides.clone(),
                keep: *keep,
            },
            Expr::Neg(e) => Expr::Neg(Box::new(e.scale_dice(mult))),
            Expr::Not(e) => Expr::Not(Box::new(e.scale_dice(mult))),
            Expr::Binary { op, lhs, rhs } => {
                Expr::binary(*op, lhs.scale_dice(mult), rhs.scale_dice(mult))
            }
            Expr::Call { func, args } => Expr::Call {
                func: *func,
                args: args.iter().map(|a| a.scale_dice(mult)).collect(),
            },
            other => other.clone(),
        }
    }

    /// Critical-hit scaling: additive terms are scaled one by one.
    /// Dice terms multiply their count, dice-free terms multiply their value,
    /// and anything else containing dice scales the dice inside it.
    fn scale_critical(&self, mult: f64) -> Expr {
        match self {
            Expr::Binary {
                op: op @ (BinOp::Add | BinOp::Sub),
                lhs,
                rhs,
            } => Expr::binary(*op, lhs.scale_critical(mult), rhs.scale_critical(mult)),
            Expr::Neg(e) => Expr::Neg(Box::new(e.scale_critical(mult))),
            e if e.has_dice() => e.scale_dice(mult),
            e => times(e.clone(), mult),
        }
    }
}

fn times(expr: Expr, mult: f64) -> Expr {
    match expr {
        Expr::Num(n) => Expr::Num(n * mult),
        other => Expr::binary(BinOp::Mul, other, Expr::Num(mult)),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_bare(f)
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Parenthesis/unary nesting allowed before parsing gives up.
const MAX_NESTING: usize = 64;
/// Bounds the height of flat operator chains, which the evaluator walks recursively.
const MAX_TOKENS: usize = 1024;

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self, token: Option<Token>) -> FormulaError {
        match token {
            Some(t) => FormulaError::UnexpectedToken {
                found: t.to_string(),
                formula: self.src.to_string(),
            },
            None => FormulaError::UnexpectedEnd(self.src.to_string()),
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), FormulaError> {
        match self.bump() {
            Some(t) if t == token => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::binary(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.parse_comparison()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_comparison()?;
            lhs = Expr::binary(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_additive()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::binary(op, lhs, rhs);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, FormulaError> {
        if self.depth >= MAX_NESTING {
            return Err(FormulaError::TooDeep(MAX_NESTING));
        }
        self.depth += 1;
        let expr = self.parse_unary_inner();
        self.depth -= 1;
        expr
    }

    fn parse_unary_inner(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_dice(),
        }
    }

    fn parse_dice(&mut self) -> Result<Expr, FormulaError> {
        let count = if self.peek() == Some(&Token::Dice) {
            Expr::Num(1.0)
        } else {
            self.parse_primary()?
        };
        if !self.eat(&Token::Dice) {
            return Ok(count);
        }
        let sides = self.parse_primary()?;
        let keep = match self.peek() {
            Some(Token::Keep(keep)) => {
                let keep = *keep;
                self.pos += 1;
                keep
            }
            _ => Keep::All,
        };
        Ok(Expr::Dice {
            count: Box::new(count),
            sides: Box::new(sides),
            keep,
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, FormulaError> {
        match self.bump() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Var(path)) => Ok(Expr::Var(path)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                let func = Func::from_name(&name).ok_or(FormulaError::UnknownFunction(name.clone()))?;
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if !self.eat(&Token::RParen) {
                    loop {
                        args.push(self.parse_or()?);
                        if self.eat(&Token::RParen) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                let ok = match func {
                    Func::Min | Func::Max => !args.is_empty(),
                    _ => args.len() == 1,
                };
                if !ok {
                    return Err(FormulaError::BadArity {
                        name,
                        expected: if matches!(func, Func::Min | Func::Max) { "1 or more" } else { "1" },
                        found: args.len(),
                    });
                }
                Ok(Expr::Call { func, args })
            }
            other => Err(self.unexpected(other)),
        }
    }
}

fn parse_expr(src: &str) -> Result<Expr, FormulaError> {
    if src.trim().is_empty() {
        return Err(FormulaError::Empty);
    }
    let tokens = tokenize(src)?;
    if tokens.len() > MAX_TOKENS {
        return Err(FormulaError::TooLong(MAX_TOKENS));
    }
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        depth: 0,
        src,
    };
    let expr = parser.parse_or()?;
    match parser.bump() {
        None => Ok(expr),
        Some(extra) => Err(parser.unexpected(Some(extra))),
    }
}

// ============================================================================
// Evaluation
// ============================================================================

enum DiceSource<'r> {
    Roll(&'r mut dyn DiceRoller),
    Replay { stored: &'r [DiceTerm], next: usize },
    Forbidden,
}

struct Evaluator<'c, 'r> {
    ctx: &'c RollContext,
    dice: DiceSource<'r>,
    terms: Vec<DiceTerm>,
    depth: usize,
    src: &'c str,
}

impl Evaluator<'_, '_> {
    fn eval(&mut self, expr: &Expr) -> Result<f64, FormulaError> {
        match expr {
            Expr::Num(n) => Ok(*n),
            Expr::Var(path) => self.variable(path),
            Expr::Dice { count, sides, keep } => {
                let count = self.eval(count)?.floor() as i64;
                let sides = self.eval(sides)?.floor() as i64;
                let (count, sides) = DiceTerm::check(count, sides, *keep)?;
                let term = match &mut self.dice {
                    DiceSource::Roll(roller) => DiceTerm::roll(count, sides, *keep, &mut **roller),
                    DiceSource::Replay { stored, next } => {
                        let term = stored
                            .get(*next)
                            .cloned()
                            .ok_or_else(|| FormulaError::ReplayExhausted(self.src.to_string()))?;
                        *next += 1;
                        term
                    }
                    DiceSource::Forbidden => {
                        return Err(FormulaError::DiceNotAllowed(self.src.to_string()))
                    }
                };
                let subtotal = term.subtotal() as f64;
                self.terms.push(term);
                Ok(subtotal)
            }
            Expr::Neg(e) => Ok(-self.eval(e)?),
            Expr::Not(e) => Ok(truth(self.eval(e)? == 0.0)),
            Expr::Binary { op, lhs, rhs } => {
                let l = self.eval(lhs)?;
                match op {
                    BinOp::And if l == 0.0 => return Ok(0.0),
                    BinOp::Or if l != 0.0 => return Ok(1.0),
                    _ => {}
                }
                let r = self.eval(rhs)?;
                Ok(match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div | BinOp::Rem if r == 0.0 => {
                        return Err(FormulaError::DivisionByZero(self.src.to_string()))
                    }
                    BinOp::Div => l / r,
                    BinOp::Rem => l % r,
                    BinOp::Eq => truth((l - r).abs() < f64::EPSILON),
                    BinOp::Ne => truth((l - r).abs() >= f64::EPSILON),
                    BinOp::Lt => truth(l < r),
                    BinOp::Le => truth(l <= r),
                    BinOp::Gt => truth(l > r),
                    BinOp::Ge => truth(l >= r),
                    BinOp::And | BinOp::Or => truth(r != 0.0),
                })
            }
            Expr::Call { func, args } => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<f64>, _>>()?;
                let first = values.first().copied().unwrap_or(0.0);
                Ok(match func {
                    Func::Floor => first.floor(),
                    Func::Ceil => first.ceil(),
                    Func::Round => (first + 0.5).floor(),
                    Func::Abs => first.abs(),
                    Func::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                    Func::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                })
            }
        }
    }

    fn variable(&mut self, path: &str) -> Result<f64, FormulaError> {
        use serde_json::Value;
        let ctx = self.ctx;
        match ctx.get(path) {
            None | Some(Value::Null) => Ok(0.0),
            Some(Value::Bool(b)) => Ok(truth(*b)),
            Some(Value::Number(n)) => Ok(n.as_f64().unwrap_or(0.0)),
            Some(Value::String(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(0.0);
                }
                if let Ok(value) = text.parse::<f64>() {
                    return Ok(value);
                }
                if self.depth >= ctx.max_depth() {
                    return Err(FormulaError::RecursionLimit {
                        depth: ctx.max_depth(),
                        variable: path.to_string(),
                    });
                }
                let nested = parse_expr(text)?;
                self.depth += 1;
                let value = self.eval(&nested);
                self.depth -= 1;
                value
            }
            Some(_) => Err(FormulaError::NonNumericVariable(path.to_string())),
        }
    }
}

fn truth(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Replace variables with their values for display. String variables
/// holding formulas are inlined up to the context's depth limit.
fn substitute(expr: &Expr, ctx: &RollContext, depth: usize) -> Expr {
    use serde_json::Value;
    match expr {
        Expr::Var(path) => match ctx.get(path) {
            None | Some(Value::Null) => Expr::Num(0.0),
            Some(Value::Bool(b)) => Expr::Num(truth(*b)),
            Some(Value::Number(n)) => Expr::Num(n.as_f64().unwrap_or(0.0)),
            Some(Value::String(text)) if depth < ctx.max_depth() => match parse_expr(text) {
                Ok(nested) => substitute(&nested, ctx, depth + 1),
                Err(_) => expr.clone(),
            },
            Some(_) => expr.clone(),
        },
        Expr::Num(_) => expr.clone(),
        Expr::Dice { count, sides, keep } => Expr::Dice {
            count: Box::new(substitute(count, ctx, depth)),
            sides: Box::new(substitute(sides, ctx, depth)),
            keep: *keep,
        },
        Expr::Neg(e) => Expr::Neg(Box::new(substitute(e, ctx, depth))),
        Expr::Not(e) => Expr::Not(Box::new(substitute(e, ctx, depth))),
        Expr::Binary { op, lhs, rhs } => {
            Expr::binary(*op, substitute(lhs, ctx, depth), substitute(rhs, ctx, depth))
        }
        Expr::Call { func, args } => Expr::Call {
            func: *func,
            args: args.iter().map(|a| substitute(a, ctx, depth)).collect(),
        },
    }
}

// ============================================================================
// Public API
// ============================================================================

/// A parsed formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        Ok(Self {
            source: source.trim().to_string(),
            expr: parse_expr(source)?,
        })
    }

    pub fn constant(value: i64) -> Self {
        Self {
            source: value.to_string(),
            expr: Expr::Num(value as f64),
        }
    }

    fn from_expr(expr: Expr) -> Self {
        Self {
            source: expr.to_string(),
            expr,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn has_dice(&self) -> bool {
        self.expr.has_dice()
    }

    /// Roll every die once and evaluate.
    pub fn roll(&self, ctx: &RollContext, roller: &mut dyn DiceRoller) -> Result<Roll, FormulaError> {
        let mut eval = Evaluator {
            ctx,
            dice: DiceSource::Roll(roller),
            terms: Vec::new(),
            depth: 0,
            src: &self.source,
        };
        let value = eval.eval(&self.expr)?;
        Ok(Roll {
            formula: self.source.clone(),
            resolved: substitute(&self.expr, ctx, 0).to_string(),
            dice: eval.terms,
            total: value.floor() as i64,
        })
    }

    /// Evaluate a dice-free formula to its floored value.
    pub fn compute(&self, ctx: &RollContext) -> Result<i64, FormulaError> {
        Ok(self.compute_exact(ctx)?.floor() as i64)
    }

    /// Evaluate a dice-free formula without flooring.
    pub fn compute_exact(&self, ctx: &RollContext) -> Result<f64, FormulaError> {
        let mut eval = Evaluator {
            ctx,
            dice: DiceSource::Forbidden,
            terms: Vec::new(),
            depth: 0,
            src: &self.source,
        };
        eval.eval(&self.expr)
    }

    pub fn evaluate_condition(&self, ctx: &RollContext) -> Result<bool, FormulaError> {
        Ok(self.compute_exact(ctx)? != 0.0)
    }

    /// The formula as rolled on a critical hit with multiplier `mult`.
    pub fn scaled_for_critical(&self, mult: u32) -> Formula {
        if mult <= 1 {
            return self.clone();
        }
        Formula::from_expr(self.expr.scale_critical(f64::from(mult)))
    }

    /// `factor * (formula)`, used for empowered effects.
    pub fn multiplied(&self, factor: f64) -> Formula {
        Formula::from_expr(Expr::binary(BinOp::Mul, Expr::Num(factor), self.expr.clone()))
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl Serialize for Formula {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Formula {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Formula::parse(&source).map_err(serde::de::Error::custom)
    }
}

/// The result of rolling a formula once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roll {
    pub formula: String,
    /// The formula with variables replaced by their values.
    pub resolved: String,
    pub dice: Vec<DiceTerm>,
    pub total: i64,
}

impl Roll {
    /// The kept face of the first d20 in the roll.
    pub fn d20_face(&self) -> Option<u32> {
        self.dice
            .iter()
            .find(|t| t.sides == 20)
            .and_then(|t| t.kept().next())
    }

    /// Re-evaluate against `ctx` using the stored faces instead of new dice.
    pub fn replay(&self, ctx: &RollContext) -> Result<Roll, FormulaError> {
        let expr = parse_expr(&self.formula)?;
        let mut eval = Evaluator {
            ctx,
            dice: DiceSource::Replay {
                stored: &self.dice,
                next: 0,
            },
            terms: Vec::new(),
            depth: 0,
            src: &self.formula,
        };
        let value = eval.eval(&expr)?;
        Ok(Roll {
            formula: self.formula.clone(),
            resolved: substitute(&expr, ctx, 0).to_string(),
            dice: eval.terms,
            total: value.floor() as i64,
        })
    }

    pub fn dice_display(&self) -> String {
        self.dice
            .iter()
            .map(|t| format!("{t} {}", t.dice_display()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Roll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dice.is_empty() {
            write!(f, "{} = {}", self.resolved, self.total)
        } else {
            write!(f, "{} {} = {}", self.resolved, self.dice_display(), self.total)
        }
    }
}

/// Parse and roll `source` in one step.
pub fn roll(source: &str, ctx: &RollContext, roller: &mut dyn DiceRoller) -> Result<Roll, FormulaError> {
    Formula::parse(source)?.roll(ctx, roller)
}

/// Parse and compute a dice-free `source` in one step.
pub fn compute(source: &str, ctx: &RollContext) -> Result<i64, FormulaError> {
    Formula::parse(source)?.compute(ctx)
}

pub fn evaluate_condition(source: &str, ctx: &RollContext) -> Result<bool, FormulaError> {
    Formula::parse(source)?.evaluate_condition(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dice::{MaximizedRoller, SeededRoller};
    use crate::testing::ScriptedRoller;
    use serde_json::json;

    fn ctx() -> RollContext {
        RollContext::from(json!({
            "abilities": {"str": {"mod": 3}, "dex": {"mod": -1}},
            "bab": 6,
            "cl": 7,
            "item": {"enh": 1, "name": "Longsword"},
            "featDamageBonus": "@abilities.str.mod + 1",
            "loop": "@loop + 1",
            "prone": true,
        }))
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        let c = ctx();
        assert_eq!(compute("1 + 2 * 3", &c).unwrap(), 7);
        assert_eq!(compute("(1 + 2) * 3", &c).unwrap(), 9);
        assert_eq!(compute("7 / 2", &c).unwrap(), 3);
        assert_eq!(compute("-7 / 2", &c).unwrap(), -4);
        assert_eq!(compute("10 % 4", &c).unwrap(), 2);
        assert_eq!(compute("-@abilities.dex.mod", &c).unwrap(), 1);
    }

    #[test]
    fn test_variables() {
        let c = ctx();
        assert_eq!(compute("@abilities.str.mod + @item.enh", &c).unwrap(), 4);
        assert_eq!(compute("@missing.path", &c).unwrap(), 0);
        assert_eq!(compute("@prone * 4", &c).unwrap(), 4);
        assert_eq!(compute("@featDamageBonus", &c).unwrap(), 4);
        assert_eq!(
            compute("@item.name", &c),
            Err(FormulaError::UnknownFunction("Longsword".to_string()))
        );
    }

    #[test]
    fn test_functions() {
        let c = ctx();
        assert_eq!(compute("floor(@cl / 2)", &c).unwrap(), 3);
        assert_eq!(compute("ceil(@cl / 2)", &c).unwrap(), 4);
        assert_eq!(compute("round(2.5)", &c).unwrap(), 3);
        assert_eq!(compute("abs(-4)", &c).unwrap(), 4);
        assert_eq!(compute("min(@cl, 5, 9)", &c).unwrap(), 5);
        assert_eq!(compute("max(@cl, 10)", &c).unwrap(), 10);
        assert!(matches!(compute("sqrt(4)", &c), Err(FormulaError::UnknownFunction(_))));
        assert!(matches!(compute("floor(1, 2)", &c), Err(FormulaError::BadArity { .. })));
    }

    #[test]
    fn test_conditions() {
        let c = ctx();
        assert!(evaluate_condition("@bab >= 6", &c).unwrap());
        assert!(!evaluate_condition("@bab > 6", &c).unwrap());
        assert!(evaluate_condition("@bab == 6 && @prone", &c).unwrap());
        assert!(evaluate_condition("@bab < 2 || @cl = 7", &c).unwrap());
        assert!(evaluate_condition("!@missing", &c).unwrap());
        assert!(evaluate_condition("true", &c).unwrap());
    }

    #[test]
    fn test_errors() {
        let c = ctx();
        assert_eq!(Formula::parse("  "), Err(FormulaError::Empty));
        assert!(matches!(Formula::parse("1 + "), Err(FormulaError::UnexpectedEnd(_))));
        assert!(matches!(Formula::parse("1 $ 2"), Err(FormulaError::UnexpectedChar { ch: '$', .. })));
        assert!(matches!(Formula::parse("(1 + 2"), Err(FormulaError::UnexpectedEnd(_))));
        assert!(matches!(compute("1 / 0", &c), Err(FormulaError::DivisionByZero(_))));
        assert!(matches!(compute("@loop", &c), Err(FormulaError::RecursionLimit { .. })));
        assert!(matches!(compute("1d6", &c), Err(FormulaError::DiceNotAllowed(_))));
    }

    #[test]
    fn test_nesting_and_length_limits() {
        let c = ctx();
        let deep = format!("{}1{}", "(".repeat(300), ")".repeat(300));
        assert_eq!(Formula::parse(&deep), Err(FormulaError::TooDeep(MAX_NESTING)));
        assert_eq!(Formula::parse(&format!("{}1", "-".repeat(500))), Err(FormulaError::TooDeep(MAX_NESTING)));

        let huge = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        assert_eq!(Formula::parse(&huge), Err(FormulaError::TooLong(MAX_TOKENS)));

        let chain = vec!["1"; 10_000].join(" + ");
        assert_eq!(Formula::parse(&chain), Err(FormulaError::TooLong(MAX_TOKENS)));

        let nested = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert_eq!(compute(&nested, &c), Ok(1));
        assert_eq!(compute(&vec!["1"; 200].join(" + "), &c), Ok(200));
    }

    #[test]
    fn test_dice_roll_records_faces() {
        let c = ctx();
        let mut roller = ScriptedRoller::new(vec![5, 2]);
        let roll = roll("2d8 + @abilities.str.mod", &c, &mut roller).unwrap();
        assert_eq!(roll.total, 10);
        assert_eq!(roll.dice.len(), 1);
        assert_eq!(roll.dice[0].faces, vec![5, 2]);
        assert_eq!(roll.resolved, "2d8 + 3");
    }

    #[test]
    fn test_dice_with_expression_count() {
        let c = ctx();
        let roll = roll("(floor(@cl / 2))d6", &c, &mut MaximizedRoller).unwrap();
        assert_eq!(roll.total, 18);
        let roll = roll_formula_d20();
        assert_eq!(roll.d20_face(), Some(17));
    }

    fn roll_formula_d20() -> Roll {
        let mut roller = ScriptedRoller::new(vec![17]);
        roll("d20 + @bab", &ctx(), &mut roller).unwrap()
    }

    #[test]
    fn test_keep_highest_parse() {
        let mut roller = ScriptedRoller::new(vec![4, 15]);
        let roll = roll("2d20kh1", &ctx(), &mut roller).unwrap();
        assert_eq!(roll.total, 15);
        assert_eq!(roll.d20_face(), Some(15));
    }

    #[test]
    fn test_replay_reuses_dice() {
        let c = ctx();
        let mut roller = SeededRoller::new(99);
        let first = roll("3d6 + @bab", &c, &mut roller).unwrap();
        let again = first.replay(&c).unwrap();
        assert_eq!(first.total, again.total);
        assert_eq!(first.dice, again.dice);

        let mut changed = c.clone();
        changed.set("bab", 0);
        let replayed = first.replay(&changed).unwrap();
        assert_eq!(replayed.total, first.total - 6);
    }

    #[test]
    fn test_compute_is_idempotent() {
        let c = ctx();
        let f = Formula::parse("floor(@cl / 2) + @featDamageBonus").unwrap();
        assert_eq!(f.compute(&c).unwrap(), f.compute(&c).unwrap());
    }

    #[test]
    fn test_critical_scaling() {
        let f = Formula::parse("1d8 + @abilities.str.mod").unwrap();
        let crit = f.scaled_for_critical(2);
        assert_eq!(crit.source(), "2d8 + @abilities.str.mod * 2");
        let roll = crit.roll(&ctx(), &mut MaximizedRoller).unwrap();
        assert_eq!(roll.total, 22);

        let mixed = Formula::parse("max(1d6, 2) - 1").unwrap().scaled_for_critical(3);
        assert_eq!(mixed.source(), "max(3d6, 2) - 3");

        let same = Formula::parse("2d6").unwrap().scaled_for_critical(1);
        assert_eq!(same.source(), "2d6");
    }

    #[test]
    fn test_multiplied() {
        let f = Formula::parse("2d6 + 1").unwrap().multiplied(1.5);
        let roll = f.roll(&ctx(), &mut MaximizedRoller).unwrap();
        assert_eq!(roll.total, 19);
    }

    #[test]
    fn test_formula_serde() {
        let f: Formula = serde_json::from_value(json!("1d6 + 2")).unwrap();
        assert_eq!(serde_json::to_value(&f).unwrap(), json!("1d6 + 2"));
        assert!(serde_json::from_value::<Formula>(json!("1 +")).is_err());
    }
}
