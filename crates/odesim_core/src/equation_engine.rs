use crate::traits::Scalar;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while parsing or compiling a model expression.
/// Every variant carries the character offset of the offending token.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("{message} at position {position}")]
    Syntax { message: String, position: usize },
    #[error("unknown variable or parameter `{name}` at position {position}")]
    UnknownSymbol { name: String, position: usize },
    #[error("unknown function `{name}` taking {arity} argument(s) at position {position}")]
    UnknownFunction {
        name: String,
        arity: usize,
        position: usize,
    },
}

impl ExprError {
    pub fn position(&self) -> usize {
        match self {
            ExprError::Syntax { position, .. }
            | ExprError::UnknownSymbol { position, .. }
            | ExprError::UnknownFunction { position, .. } => *position,
        }
    }

    fn syntax(message: impl Into<String>, position: usize) -> Self {
        ExprError::Syntax {
            message: message.into(),
            position,
        }
    }
}

// --- Operators & Builtins ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Pow,
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Pow => "^",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    /// Binding strength; higher binds tighter. All binary operators are
    /// left-associative.
    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Pow => 9,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 8,
            BinaryOp::Add | BinaryOp::Sub => 7,
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => 6,
            BinaryOp::Eq | BinaryOp::Ne => 5,
            BinaryOp::And => 4,
            BinaryOp::Or => 3,
        }
    }
}

/// Built-in functions understood by both the VM and the C renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Ln,
    Log2,
    Log10,
    Sqrt,
    Abs,
    Floor,
    Ceil,
    Rint,
    Sign,
    Pow,
    Min,
    Max,
    Atan2,
}

impl Function {
    pub fn lookup(name: &str, arity: usize) -> Option<Function> {
        let function = match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "asin" => Function::Asin,
            "acos" => Function::Acos,
            "atan" => Function::Atan,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            "exp" => Function::Exp,
            "log" | "ln" => Function::Ln,
            "log2" => Function::Log2,
            "log10" => Function::Log10,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "floor" => Function::Floor,
            "ceil" => Function::Ceil,
            "rint" => Function::Rint,
            "sign" => Function::Sign,
            "pow" => Function::Pow,
            "min" => Function::Min,
            "max" => Function::Max,
            "atan2" => Function::Atan2,
            _ => return None,
        };
        (function.arity() == arity).then_some(function)
    }

    pub fn is_builtin_name(name: &str) -> bool {
        Function::lookup(name, 1).is_some() || Function::lookup(name, 2).is_some()
    }

    pub fn arity(self) -> usize {
        match self {
            Function::Pow | Function::Min | Function::Max | Function::Atan2 => 2,
            _ => 1,
        }
    }

    /// Name of the equivalent function in C's `<math.h>` (or the helper that
    /// generated sources define).
    pub fn c_name(self) -> &'static str {
        match self {
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Asin => "asin",
            Function::Acos => "acos",
            Function::Atan => "atan",
            Function::Sinh => "sinh",
            Function::Cosh => "cosh",
            Function::Tanh => "tanh",
            Function::Exp => "exp",
            Function::Ln => "log",
            Function::Log2 => "log2",
            Function::Log10 => "log10",
            Function::Sqrt => "sqrt",
            Function::Abs => "fabs",
            Function::Floor => "floor",
            Function::Ceil => "ceil",
            Function::Rint => "rint",
            Function::Sign => "odesim_sign",
            Function::Pow => "pow",
            Function::Min => "fmin",
            Function::Max => "fmax",
            Function::Atan2 => "atan2",
        }
    }

    fn apply1<T: Scalar>(self, a: T) -> T {
        match self {
            Function::Sin => a.sin(),
            Function::Cos => a.cos(),
            Function::Tan => a.tan(),
            Function::Asin => a.asin(),
            Function::Acos => a.acos(),
            Function::Atan => a.atan(),
            Function::Sinh => a.sinh(),
            Function::Cosh => a.cosh(),
            Function::Tanh => a.tanh(),
            Function::Exp => a.exp(),
            Function::Ln => a.ln(),
            Function::Log2 => a.log2(),
            Function::Log10 => a.log10(),
            Function::Sqrt => a.sqrt(),
            Function::Abs => a.abs(),
            Function::Floor => a.floor(),
            Function::Ceil => a.ceil(),
            Function::Rint => round_half_even(a),
            Function::Sign => {
                if a > T::zero() {
                    T::one()
                } else if a < T::zero() {
                    -T::one()
                } else {
                    T::zero()
                }
            }
            Function::Pow | Function::Min | Function::Max | Function::Atan2 => T::nan(),
        }
    }

    fn apply2<T: Scalar>(self, a: T, b: T) -> T {
        match self {
            Function::Pow => a.powf(b),
            Function::Min => a.min(b),
            Function::Max => a.max(b),
            Function::Atan2 => a.atan2(b),
            _ => T::nan(),
        }
    }
}

/// Matches C's `rint` under the default rounding mode.
fn round_half_even<T: Scalar>(a: T) -> T {
    let rounded = a.round();
    let two = T::one() + T::one();
    let half = T::one() / two;
    if (a - a.trunc()).abs() == half {
        two * (a / two).round()
    } else {
        rounded
    }
}

// --- AST ---

/// Expression tree produced by [`parse`].
///
/// Identifier nodes keep the character offset they were parsed at so that
/// compile errors can point back into the source text.
#[derive(Debug, Clone)]
pub enum Expr {
    Number(f64),
    Variable { name: String, offset: usize },
    Unary(UnaryOp, Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call {
        name: String,
        args: Vec<Expr>,
        offset: usize,
    },
    Assign {
        target: String,
        offset: usize,
        value: Box<Expr>,
    },
    Sequence(Vec<Expr>),
}

impl Expr {
    pub fn variable(name: impl Into<String>) -> Self {
        Expr::Variable {
            name: name.into(),
            offset: 0,
        }
    }

    /// Replaces every identifier equal to `name` with `replacement`.
    ///
    /// Assignment targets are left alone; only reads are substituted.
    pub fn substitute(&self, name: &str, replacement: &Expr) -> Expr {
        match self {
            Expr::Number(n) => Expr::Number(*n),
            Expr::Variable { name: ident, .. } if ident == name => replacement.clone(),
            Expr::Variable { .. } => self.clone(),
            Expr::Unary(op, operand) => {
                Expr::Unary(*op, Box::new(operand.substitute(name, replacement)))
            }
            Expr::Binary(left, op, right) => Expr::Binary(
                Box::new(left.substitute(name, replacement)),
                *op,
                Box::new(right.substitute(name, replacement)),
            ),
            Expr::Ternary(cond, a, b) => Expr::Ternary(
                Box::new(cond.substitute(name, replacement)),
                Box::new(a.substitute(name, replacement)),
                Box::new(b.substitute(name, replacement)),
            ),
            Expr::Call {
                name: func,
                args,
                offset,
            } => Expr::Call {
                name: func.clone(),
                args: args
                    .iter()
                    .map(|arg| arg.substitute(name, replacement))
                    .collect(),
                offset: *offset,
            },
            Expr::Assign {
                target,
                offset,
                value,
            } => Expr::Assign {
                target: target.clone(),
                offset: *offset,
                value: Box::new(value.substitute(name, replacement)),
            },
            Expr::Sequence(items) => Expr::Sequence(
                items
                    .iter()
                    .map(|item| item.substitute(name, replacement))
                    .collect(),
            ),
        }
    }

    /// Collects every identifier read or assigned by the expression, in
    /// first-occurrence order.
    pub fn identifiers(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers(&self, out: &mut Vec<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable { name, .. } => push_unique(out, name),
            Expr::Unary(_, operand) => operand.collect_identifiers(out),
            Expr::Binary(left, _, right) => {
                left.collect_identifiers(out);
                right.collect_identifiers(out);
            }
            Expr::Ternary(cond, a, b) => {
                cond.collect_identifiers(out);
                a.collect_identifiers(out);
                b.collect_identifiers(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_identifiers(out);
                }
            }
            Expr::Assign { target, value, .. } => {
                push_unique(out, target);
                value.collect_identifiers(out);
            }
            Expr::Sequence(items) => {
                for item in items {
                    item.collect_identifiers(out);
                }
            }
        }
    }

    /// Renders the expression back into the model grammar. The output parses
    /// to an equivalent tree; powers are always written in call form.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.write(&mut out, Dialect::Model, &|_| None);
        out
    }

    /// Renders the expression as a C expression. `resolve` may map an
    /// identifier to replacement text (for example an indexed array access);
    /// returning `None` keeps the identifier as written.
    pub fn render_c(&self, resolve: &dyn Fn(&str) -> Option<String>) -> String {
        let mut out = String::new();
        self.write(&mut out, Dialect::C, resolve);
        out
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Sequence(_) => 0,
            Expr::Assign { .. } => 1,
            Expr::Ternary(..) => 2,
            Expr::Binary(_, op, _) => op.precedence(),
            Expr::Unary(..) => 10,
            Expr::Number(_) | Expr::Variable { .. } | Expr::Call { .. } => 11,
        }
    }

    fn write(&self, out: &mut String, dialect: Dialect, resolve: &dyn Fn(&str) -> Option<String>) {
        match self {
            Expr::Number(n) => out.push_str(&format_number(*n)),
            Expr::Variable { name, .. } => match resolve(name) {
                Some(mapped) => out.push_str(&mapped),
                None => out.push_str(name),
            },
            Expr::Unary(op, operand) => {
                out.push_str(match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Plus => "+",
                    UnaryOp::Not => "!",
                });
                let atomic = matches!(
                    operand.as_ref(),
                    Expr::Variable { .. } | Expr::Call { .. }
                ) || matches!(operand.as_ref(), Expr::Number(n) if *n >= 0.0);
                write_grouped(out, operand, !atomic, dialect, resolve);
            }
            Expr::Binary(left, BinaryOp::Pow, right) => {
                write_call(out, "pow", &[left.as_ref(), right.as_ref()], dialect, resolve);
            }
            Expr::Binary(left, BinaryOp::Rem, right) if dialect == Dialect::C => {
                write_call(out, "fmod", &[left.as_ref(), right.as_ref()], dialect, resolve);
            }
            Expr::Binary(left, op, right) => {
                let prec = op.precedence();
                write_grouped(out, left, left.precedence() < prec, dialect, resolve);
                out.push_str(op.symbol());
                write_grouped(out, right, right.precedence() <= prec, dialect, resolve);
            }
            Expr::Ternary(cond, a, b) => {
                out.push('(');
                write_grouped(out, cond, cond.precedence() <= 2, dialect, resolve);
                out.push_str(" ? ");
                write_grouped(out, a, a.precedence() < 2, dialect, resolve);
                out.push_str(" : ");
                write_grouped(out, b, b.precedence() < 2, dialect, resolve);
                out.push(')');
            }
            Expr::Call { name, args, .. } => {
                let name = match dialect {
                    Dialect::Model => name.as_str(),
                    Dialect::C => Function::lookup(name, args.len())
                        .map(Function::c_name)
                        .unwrap_or(name.as_str()),
                };
                let refs: Vec<&Expr> = args.iter().collect();
                write_call(out, name, &refs, dialect, resolve);
            }
            Expr::Assign { target, value, .. } => {
                match resolve(target) {
                    Some(mapped) => out.push_str(&mapped),
                    None => out.push_str(target),
                }
                out.push_str(" = ");
                write_grouped(out, value, value.precedence() < 1, dialect, resolve);
            }
            Expr::Sequence(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write(out, dialect, resolve);
                }
            }
        }
    }
}

fn push_unique(out: &mut Vec<String>, name: &str) {
    if !out.iter().any(|seen| seen == name) {
        out.push(name.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Model,
    C,
}

fn write_grouped(
    out: &mut String,
    expr: &Expr,
    parens: bool,
    dialect: Dialect,
    resolve: &dyn Fn(&str) -> Option<String>,
) {
    if parens {
        out.push('(');
        expr.write(out, dialect, resolve);
        out.push(')');
    } else {
        expr.write(out, dialect, resolve);
    }
}

fn write_call(
    out: &mut String,
    name: &str,
    args: &[&Expr],
    dialect: Dialect,
    resolve: &dyn Fn(&str) -> Option<String>,
) {
    out.push_str(name);
    out.push('(');
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        // Arguments are comma separated, so a bare sequence must be grouped.
        write_grouped(out, arg, arg.precedence() == 0, dialect, resolve);
    }
    out.push(')');
}

/// Formats a number as the shortest text that reads back to the same `f64`.
/// The output is also a valid C double literal.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        return "(0.0/0.0)".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "(1.0/0.0)" } else { "(-1.0/0.0)" }.to_string();
    }
    format!("{value:?}")
}

// --- Tokenizer ---

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
    Bang,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
    Assign,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())) {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| ExprError::syntax(format!("invalid number `{text}`"), start))?;
            tokens.push(Token {
                kind: TokenKind::Number(value),
                offset: start,
            });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Identifier(chars[start..i].iter().collect()),
                offset: start,
            });
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (kind, width) = match (c, next) {
            ('<', Some('=')) => (TokenKind::Le, 2),
            ('>', Some('=')) => (TokenKind::Ge, 2),
            ('=', Some('=')) => (TokenKind::EqEq, 2),
            ('!', Some('=')) => (TokenKind::Ne, 2),
            ('&', Some('&')) => (TokenKind::AndAnd, 2),
            ('|', Some('|')) => (TokenKind::OrOr, 2),
            ('+', _) => (TokenKind::Plus, 1),
            ('-', _) => (TokenKind::Minus, 1),
            ('*', _) => (TokenKind::Star, 1),
            ('/', _) => (TokenKind::Slash, 1),
            ('%', _) => (TokenKind::Percent, 1),
            ('^', _) => (TokenKind::Caret, 1),
            ('(', _) => (TokenKind::LParen, 1),
            (')', _) => (TokenKind::RParen, 1),
            (',', _) => (TokenKind::Comma, 1),
            ('?', _) => (TokenKind::Question, 1),
            (':', _) => (TokenKind::Colon, 1),
            ('!', _) => (TokenKind::Bang, 1),
            ('<', _) => (TokenKind::Lt, 1),
            ('>', _) => (TokenKind::Gt, 1),
            ('=', _) => (TokenKind::Assign, 1),
            _ => return Err(ExprError::syntax(format!("unexpected character `{c}`"), start)),
        };
        tokens.push(Token { kind, offset: start });
        i += width;
    }
    Ok(tokens)
}

// --- Parser ---

/// Parses a string expression into an AST. Blank input parses as `0`.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    if input.trim().is_empty() {
        return Ok(Expr::Number(0.0));
    }
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.chars().count(),
    };
    let expr = parser.parse_sequence()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ExprError::syntax("unexpected trailing input", token.offset)),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|token| &token.kind)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.peek().map(|token| token.offset).unwrap_or(self.end)
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<(), ExprError> {
        if self.peek_kind() == Some(&kind) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ExprError::syntax(format!("expected {what}"), self.offset()))
        }
    }

    fn parse_sequence(&mut self) -> Result<Expr, ExprError> {
        let first = self.parse_assignment()?;
        if self.peek_kind() != Some(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.peek_kind() == Some(&TokenKind::Comma) {
            self.consume();
            items.push(self.parse_assignment()?);
        }
        Ok(Expr::Sequence(items))
    }

    fn parse_assignment(&mut self) -> Result<Expr, ExprError> {
        if let (Some(Token {
            kind: TokenKind::Identifier(name),
            offset,
        }), Some(Token {
            kind: TokenKind::Assign,
            ..
        })) = (self.tokens.get(self.pos), self.tokens.get(self.pos + 1))
        {
            let target = name.clone();
            let offset = *offset;
            self.pos += 2;
            let value = self.parse_assignment()?;
            return Ok(Expr::Assign {
                target,
                offset,
                value: Box::new(value),
            });
        }
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> Result<Expr, ExprError> {
        let cond = self.parse_binary(3)?;
        if self.peek_kind() != Some(&TokenKind::Question) {
            return Ok(cond);
        }
        self.consume();
        let a = self.parse_ternary()?;
        self.expect(TokenKind::Colon, "':' in conditional expression")?;
        let b = self.parse_ternary()?;
        Ok(Expr::Ternary(Box::new(cond), Box::new(a), Box::new(b)))
    }

    fn binary_op(&self) -> Option<BinaryOp> {
        let op = match self.peek_kind()? {
            TokenKind::Star => BinaryOp::Mul,
            TokenKind::Slash => BinaryOp::Div,
            TokenKind::Percent => BinaryOp::Rem,
            TokenKind::Plus => BinaryOp::Add,
            TokenKind::Minus => BinaryOp::Sub,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::Le => BinaryOp::Le,
            TokenKind::Ge => BinaryOp::Ge,
            TokenKind::EqEq => BinaryOp::Eq,
            TokenKind::Ne => BinaryOp::Ne,
            TokenKind::AndAnd => BinaryOp::And,
            TokenKind::OrOr => BinaryOp::Or,
            _ => return None,
        };
        Some(op)
    }

    /// Precedence climbing over the left-associative binary operators
    /// below `^` (which is handled in `parse_power`).
    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.binary_op() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.consume();
            let right = self.parse_binary(prec + 1)?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek_kind() {
            Some(TokenKind::Minus) => UnaryOp::Neg,
            Some(TokenKind::Plus) => UnaryOp::Plus,
            Some(TokenKind::Bang) => UnaryOp::Not,
            _ => return self.parse_power(),
        };
        self.consume();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn parse_power(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_primary()?;
        while self.peek_kind() == Some(&TokenKind::Caret) {
            self.consume();
            let right = self.parse_exponent()?;
            left = Expr::Binary(Box::new(left), BinaryOp::Pow, Box::new(right));
        }
        Ok(left)
    }

    /// A sign directly after `^` belongs to the exponent.
    fn parse_exponent(&mut self) -> Result<Expr, ExprError> {
        match self.peek_kind() {
            Some(TokenKind::Minus) => {
                self.consume();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_exponent()?)))
            }
            Some(TokenKind::Plus) => {
                self.consume();
                self.parse_exponent()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.consume().map(|token| token.kind) {
            Some(TokenKind::Number(n)) => Ok(Expr::Number(n)),
            Some(TokenKind::Identifier(name)) => {
                if self.peek_kind() != Some(&TokenKind::LParen) {
                    return Ok(Expr::Variable { name, offset });
                }
                self.consume(); // eat '('
                let mut args = Vec::new();
                if self.peek_kind() != Some(&TokenKind::RParen) {
                    loop {
                        args.push(self.parse_assignment()?);
                        if self.peek_kind() == Some(&TokenKind::Comma) {
                            self.consume();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RParen, "')'")?;
                Ok(Expr::Call { name, args, offset })
            }
            Some(TokenKind::LParen) => {
                let expr = self.parse_sequence()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            Some(_) => Err(ExprError::syntax("unexpected token", offset)),
            None => Err(ExprError::syntax("unexpected end of expression", offset)),
        }
    }
}

// --- Bytecode & Compiler ---

/// OpCodes for the stack-based virtual machine.
/// The VM operates on a stack of `Scalar` values and a flat slot array that
/// holds every named quantity of the model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant onto the stack.
    LoadConst(f64),
    /// Pushes the value of a slot.
    Load(usize),
    /// Writes the top of the stack into a slot, leaving it on the stack.
    Store(usize),
    /// Discards the top of the stack.
    Pop,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Neg,
    Not,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    /// Replaces the top of the stack with 1 if it is non-zero, else 0.
    Truthy,
    /// Pops; jumps to the target if the value was zero.
    JumpIfFalse(usize),
    /// Pops; jumps to the target if the value was non-zero.
    JumpIfTrue(usize),
    Jump(usize),
    Call1(Function),
    Call2(Function),
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }
}

/// Name → slot mapping shared by every compiled expression of a model.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    slots: HashMap<String, usize>,
    names: Vec<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for `name`, allocating one if needed.
    pub fn insert(&mut self, name: &str) -> usize {
        if let Some(&slot) = self.slots.get(name) {
            return slot;
        }
        let slot = self.names.len();
        self.slots.insert(name.to_string(), slot);
        self.names.push(name.to_string());
        slot
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.slots.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Compiles an AST (`Expr`) into `Bytecode`, resolving names to slots.
pub struct Compiler<'a> {
    pub symbols: &'a SymbolTable,
}

impl<'a> Compiler<'a> {
    pub fn new(symbols: &'a SymbolTable) -> Self {
        Self { symbols }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode, ExprError> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn slot(&self, name: &str, offset: usize) -> Result<usize, ExprError> {
        self.symbols.get(name).ok_or_else(|| ExprError::UnknownSymbol {
            name: name.to_string(),
            position: offset,
        })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), ExprError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable { name, offset } => ops.push(OpCode::Load(self.slot(name, *offset)?)),
            Expr::Unary(op, operand) => {
                self.compile_recursive(operand, ops)?;
                match op {
                    UnaryOp::Neg => ops.push(OpCode::Neg),
                    UnaryOp::Plus => {}
                    UnaryOp::Not => ops.push(OpCode::Not),
                }
            }
            Expr::Binary(left, BinaryOp::And, right) => {
                self.compile_recursive(left, ops)?;
                let short = ops.len();
                ops.push(OpCode::JumpIfFalse(0));
                self.compile_recursive(right, ops)?;
                ops.push(OpCode::Truthy);
                let done = ops.len();
                ops.push(OpCode::Jump(0));
                ops[short] = OpCode::JumpIfFalse(ops.len());
                ops.push(OpCode::LoadConst(0.0));
                ops[done] = OpCode::Jump(ops.len());
            }
            Expr::Binary(left, BinaryOp::Or, right) => {
                self.compile_recursive(left, ops)?;
                let short = ops.len();
                ops.push(OpCode::JumpIfTrue(0));
                self.compile_recursive(right, ops)?;
                ops.push(OpCode::Truthy);
                let done = ops.len();
                ops.push(OpCode::Jump(0));
                ops[short] = OpCode::JumpIfTrue(ops.len());
                ops.push(OpCode::LoadConst(1.0));
                ops[done] = OpCode::Jump(ops.len());
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Rem => OpCode::Rem,
                    BinaryOp::Pow => OpCode::Pow,
                    BinaryOp::Lt => OpCode::Lt,
                    BinaryOp::Gt => OpCode::Gt,
                    BinaryOp::Le => OpCode::Le,
                    BinaryOp::Ge => OpCode::Ge,
                    BinaryOp::Eq => OpCode::Eq,
                    BinaryOp::Ne => OpCode::Ne,
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                });
            }
            Expr::Ternary(cond, a, b) => {
                self.compile_recursive(cond, ops)?;
                let branch = ops.len();
                ops.push(OpCode::JumpIfFalse(0));
                self.compile_recursive(a, ops)?;
                let done = ops.len();
                ops.push(OpCode::Jump(0));
                ops[branch] = OpCode::JumpIfFalse(ops.len());
                self.compile_recursive(b, ops)?;
                ops[done] = OpCode::Jump(ops.len());
            }
            Expr::Call { name, args, offset } => {
                let function = Function::lookup(name, args.len()).ok_or_else(|| {
                    ExprError::UnknownFunction {
                        name: name.clone(),
                        arity: args.len(),
                        position: *offset,
                    }
                })?;
                for arg in args {
                    self.compile_recursive(arg, ops)?;
                }
                ops.push(if function.arity() == 2 {
                    OpCode::Call2(function)
                } else {
                    OpCode::Call1(function)
                });
            }
            Expr::Assign {
                target,
                offset,
                value,
            } => {
                let slot = self.slot(target, *offset)?;
                self.compile_recursive(value, ops)?;
                ops.push(OpCode::Store(slot));
            }
            Expr::Sequence(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        ops.push(OpCode::Pop);
                    }
                    self.compile_recursive(item, ops)?;
                }
            }
        }
        Ok(())
    }
}

/// Parses and compiles `text` in one go.
pub fn compile_text(text: &str, symbols: &SymbolTable) -> Result<Bytecode, ExprError> {
    let expr = parse(text)?;
    Compiler::new(symbols).compile(&expr)
}

// --- VM ---

/// Stack-based virtual machine for evaluating compiled expressions.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: instructions to run.
/// - `slots`: every named model quantity; `Store` writes here.
/// - `stack`: a scratch buffer reused between calls.
///
/// Returns the value left on the stack.
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, slots: &mut [T], stack: &mut Vec<T>) -> T {
        stack.clear();
        let truth = |b: bool| if b { T::one() } else { T::zero() };
        let ops = &bytecode.ops;
        let mut pc = 0;

        while pc < ops.len() {
            let op = ops[pc];
            pc += 1;
            match op {
                OpCode::LoadConst(val) => stack.push(T::from_f64(val).unwrap_or_else(T::nan)),
                OpCode::Load(slot) => stack.push(slots[slot]),
                OpCode::Store(slot) => slots[slot] = top(stack),
                OpCode::Pop => {
                    stack.pop();
                }
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
                OpCode::Not => {
                    let a = pop(stack);
                    stack.push(truth(a == T::zero()));
                }
                OpCode::Truthy => {
                    let a = pop(stack);
                    stack.push(truth(a != T::zero()));
                }
                OpCode::JumpIfFalse(target) => {
                    if pop(stack) == T::zero() {
                        pc = target;
                    }
                }
                OpCode::JumpIfTrue(target) => {
                    if pop(stack) != T::zero() {
                        pc = target;
                    }
                }
                OpCode::Jump(target) => pc = target,
                OpCode::Call1(function) => {
                    let a = pop(stack);
                    stack.push(function.apply1(a));
                }
                OpCode::Call2(function) => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(function.apply2(a, b));
                }
                binary => {
                    let b = pop(stack);
                    let a = pop(stack);
                    stack.push(match binary {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        OpCode::Rem => a % b,
                        OpCode::Pow => a.powf(b),
                        OpCode::Lt => truth(a < b),
                        OpCode::Gt => truth(a > b),
                        OpCode::Le => truth(a <= b),
                        OpCode::Ge => truth(a >= b),
                        OpCode::Eq => truth(a == b),
                        OpCode::Ne => truth(a != b),
                        _ => T::nan(),
                    });
                }
            }
        }

        // Compiled code always leaves exactly one value.
        stack.pop().unwrap_or_else(T::zero)
    }
}

fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
    stack.pop().unwrap_or_else(T::nan)
}

fn top<T: Scalar>(stack: &[T]) -> T {
    stack.last().copied().unwrap_or_else(T::nan)
}
