//! Expression grammar and evaluator for custom blocks
//!
//! A closed language: literals, input references (dotted paths), arithmetic,
//! comparison, boolean logic, and calls into a fixed function table. No
//! loops, no user-defined functions, no host objects: evaluation always
//! terminates and is additionally guarded by a fuel budget.

use crate::error::{EngineError, EngineResult};
use crate::model::LogLevel;
use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, tag, take_while1},
    character::complete::{char, digit1, multispace0, none_of},
    combinator::{map, not, opt, peek, value as nom_value, verify},
    multi::{many0, separated_list0},
    number::complete::double,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    /// Dotted input reference, split into segments
    Var(Vec<String>),
    Call(String, Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// One statement of the `script` kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let(String, Expr),
    Return(Expr),
    Expr(Expr),
}

// ---- parsing ----

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn ident(input: &str) -> IResult<&str, &str> {
    verify(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        |s: &str| !s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true),
    )(input)
}

fn path_segments(input: &str) -> IResult<&str, Vec<String>> {
    map(
        pair(
            ident,
            many0(preceded(char('.'), alt((ident, digit1)))),
        ),
        |(head, rest)| {
            let mut segments = vec![head.to_string()];
            segments.extend(rest.into_iter().map(|s| s.to_string()));
            segments
        },
    )(input)
}

fn string_lit(input: &str) -> IResult<&str, String> {
    let double_quoted = delimited(
        char('"'),
        opt(escaped_transform(
            none_of("\"\\"),
            '\\',
            alt((
                nom_value('"', char('"')),
                nom_value('\\', char('\\')),
                nom_value('\n', char('n')),
                nom_value('\t', char('t')),
            )),
        )),
        char('"'),
    );
    let single_quoted = delimited(
        char('\''),
        opt(escaped_transform(
            none_of("'\\"),
            '\\',
            alt((
                nom_value('\'', char('\'')),
                nom_value('\\', char('\\')),
                nom_value('\n', char('n')),
                nom_value('\t', char('t')),
            )),
        )),
        char('\''),
    );
    map(alt((double_quoted, single_quoted)), |s| {
        s.unwrap_or_default()
    })(input)
}

fn call(input: &str) -> IResult<&str, Expr> {
    map(
        tuple((
            path_segments,
            ws(char('(')),
            separated_list0(ws(char(',')), expr),
            char(')'),
        )),
        |(name, _, args, _)| Expr::Call(name.join("."), args),
    )(input)
}

fn var_or_keyword(input: &str) -> IResult<&str, Expr> {
    map(path_segments, |segments| {
        if segments.len() == 1 {
            match segments[0].as_str() {
                "true" => return Expr::Bool(true),
                "false" => return Expr::Bool(false),
                "null" => return Expr::Null,
                _ => {}
            }
        }
        Expr::Var(segments)
    })(input)
}

fn primary(input: &str) -> IResult<&str, Expr> {
    ws(alt((
        map(string_lit, Expr::Str),
        call,
        var_or_keyword,
        map(double, Expr::Num),
        delimited(char('('), expr, char(')')),
    )))(input)
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('!')), unary), |e| {
            Expr::Unary(UnOp::Not, Box::new(e))
        }),
        map(preceded(ws(char('-')), unary), |e| {
            Expr::Unary(UnOp::Neg, Box::new(e))
        }),
        primary,
    ))(input)
}

fn fold_binary(init: Expr, rest: Vec<(BinOp, Expr)>) -> Expr {
    rest.into_iter().fold(init, |acc, (op, rhs)| {
        Expr::Binary(op, Box::new(acc), Box::new(rhs))
    })
}

fn product(input: &str) -> IResult<&str, Expr> {
    let (input, init) = unary(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            nom_value(BinOp::Mul, char('*')),
            nom_value(BinOp::Div, char('/')),
            nom_value(BinOp::Mod, char('%')),
        ))),
        unary,
    ))(input)?;
    Ok((input, fold_binary(init, rest)))
}

fn sum(input: &str) -> IResult<&str, Expr> {
    let (input, init) = product(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            nom_value(BinOp::Add, char('+')),
            nom_value(BinOp::Sub, char('-')),
        ))),
        product,
    ))(input)?;
    Ok((input, fold_binary(init, rest)))
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    let (input, init) = sum(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            nom_value(BinOp::Eq, tag("==")),
            nom_value(BinOp::Ne, tag("!=")),
            nom_value(BinOp::Le, tag("<=")),
            nom_value(BinOp::Ge, tag(">=")),
            nom_value(BinOp::Lt, tag("<")),
            nom_value(BinOp::Gt, tag(">")),
        ))),
        sum,
    ))(input)?;
    Ok((input, fold_binary(init, rest)))
}

fn conjunction(input: &str) -> IResult<&str, Expr> {
    let (input, init) = comparison(input)?;
    let (input, rest) = many0(pair(ws(nom_value(BinOp::And, tag("&&"))), comparison))(input)?;
    Ok((input, fold_binary(init, rest)))
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (input, init) = conjunction(input)?;
    let (input, rest) = many0(pair(ws(nom_value(BinOp::Or, tag("||"))), conjunction))(input)?;
    Ok((input, fold_binary(init, rest)))
}

/// Parse a single expression; the whole input must be consumed.
pub fn parse_expression(source: &str) -> EngineResult<Expr> {
    match ws(expr)(source) {
        Ok(("", parsed)) => Ok(parsed),
        Ok((rest, _)) => Err(EngineError::Config(format!(
            "unexpected trailing input in expression: {:?}",
            rest
        ))),
        Err(e) => Err(EngineError::Config(format!("invalid expression: {}", e))),
    }
}

/// Match a keyword without swallowing identifiers it prefixes
/// (`returned` is a variable, not `return ed`).
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(
        tag(kw),
        peek(not(take_while1(|c: char| {
            c.is_ascii_alphanumeric() || c == '_'
        }))),
    )
}

fn statement(input: &str) -> IResult<&str, Stmt> {
    alt((
        map(
            tuple((ws(keyword("let")), ident, ws(char('=')), expr)),
            |(_, name, _, value)| Stmt::Let(name.to_string(), value),
        ),
        map(preceded(ws(keyword("return")), expr), Stmt::Return),
        map(expr, Stmt::Expr),
    ))(input)
}

/// Parse a `script` program: statements separated by `;`.
pub fn parse_script(source: &str) -> EngineResult<Vec<Stmt>> {
    let parser = terminated(
        separated_list0(ws(char(';')), statement),
        opt(ws(char(';'))),
    );
    match ws(parser)(source) {
        Ok(("", statements)) => Ok(statements),
        Ok((rest, _)) => Err(EngineError::Config(format!(
            "unexpected trailing input in script: {:?}",
            rest
        ))),
        Err(e) => Err(EngineError::Config(format!("invalid script: {}", e))),
    }
}

// ---- evaluation ----

/// Evaluation budget: every visited node costs one unit.
const FUEL: u32 = 100_000;

/// Evaluator over declared inputs plus script locals. Side effects are
/// limited to collected log lines, emitted by the caller afterwards.
pub struct Evaluator<'a> {
    inputs: &'a Map<String, Value>,
    locals: HashMap<String, Value>,
    fuel: u32,
    pub logs: Vec<(LogLevel, String)>,
}

impl<'a> Evaluator<'a> {
    pub fn new(inputs: &'a Map<String, Value>) -> Self {
        Self {
            inputs,
            locals: HashMap::new(),
            fuel: FUEL,
            logs: Vec::new(),
        }
    }

    fn burn(&mut self) -> EngineResult<()> {
        self.fuel = self.fuel.checked_sub(1).ok_or_else(|| {
            EngineError::Execution("sandbox evaluation budget exceeded".to_string())
        })?;
        Ok(())
    }

    fn resolve(&self, segments: &[String]) -> EngineResult<Value> {
        let head = &segments[0];
        let root = self
            .locals
            .get(head)
            .or_else(|| self.inputs.get(head))
            .ok_or_else(|| EngineError::Config(format!("unknown identifier {:?}", head)))?;
        let mut current = root;
        for segment in &segments[1..] {
            current = match current {
                Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
                Value::Array(items) => segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i))
                    .unwrap_or(&Value::Null),
                _ => &Value::Null,
            };
        }
        Ok(current.clone())
    }

    pub fn eval(&mut self, expr: &Expr) -> EngineResult<Value> {
        self.burn()?;
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Num(n) => Ok(number(*n)),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Var(segments) => self.resolve(segments),
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                match op {
                    UnOp::Neg => Ok(number(-as_number(&value)?)),
                    UnOp::Not => Ok(Value::Bool(!truthy(&value))),
                }
            }
            Expr::Binary(op, lhs, rhs) => self.eval_binary(*op, lhs, rhs),
            Expr::Call(name, args) => {
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(self.eval(arg)?);
                }
                self.call(name, evaluated)
            }
        }
    }

    fn eval_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> EngineResult<Value> {
        // Short-circuit forms first
        match op {
            BinOp::And => {
                let left = self.eval(lhs)?;
                if !truthy(&left) {
                    return Ok(Value::Bool(false));
                }
                let right = self.eval(rhs)?;
                return Ok(Value::Bool(truthy(&right)));
            }
            BinOp::Or => {
                let left = self.eval(lhs)?;
                if truthy(&left) {
                    return Ok(Value::Bool(true));
                }
                let right = self.eval(rhs)?;
                return Ok(Value::Bool(truthy(&right)));
            }
            _ => {}
        }

        let left = self.eval(lhs)?;
        let right = self.eval(rhs)?;
        match op {
            BinOp::Add => {
                // string concatenation when either side is a string
                if left.is_string() || right.is_string() {
                    Ok(Value::String(format!(
                        "{}{}",
                        display(&left),
                        display(&right)
                    )))
                } else {
                    Ok(number(as_number(&left)? + as_number(&right)?))
                }
            }
            BinOp::Sub => Ok(number(as_number(&left)? - as_number(&right)?)),
            BinOp::Mul => Ok(number(as_number(&left)? * as_number(&right)?)),
            BinOp::Div => {
                let divisor = as_number(&right)?;
                if divisor == 0.0 {
                    return Err(EngineError::Execution("division by zero".to_string()));
                }
                Ok(number(as_number(&left)? / divisor))
            }
            BinOp::Mod => {
                let divisor = as_number(&right)?;
                if divisor == 0.0 {
                    return Err(EngineError::Execution("division by zero".to_string()));
                }
                Ok(number(as_number(&left)? % divisor))
            }
            BinOp::Eq => Ok(Value::Bool(loose_eq(&left, &right))),
            BinOp::Ne => Ok(Value::Bool(!loose_eq(&left, &right))),
            BinOp::Lt => Ok(Value::Bool(compare(&left, &right)? == std::cmp::Ordering::Less)),
            BinOp::Le => Ok(Value::Bool(compare(&left, &right)? != std::cmp::Ordering::Greater)),
            BinOp::Gt => Ok(Value::Bool(compare(&left, &right)? == std::cmp::Ordering::Greater)),
            BinOp::Ge => Ok(Value::Bool(compare(&left, &right)? != std::cmp::Ordering::Less)),
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }

    /// Fixed capability table. Anything outside it is a config error.
    fn call(&mut self, name: &str, args: Vec<Value>) -> EngineResult<Value> {
        let arity = |n: usize| -> EngineResult<()> {
            if args.len() == n {
                Ok(())
            } else {
                Err(EngineError::Config(format!(
                    "{} expects {} argument(s), got {}",
                    name,
                    n,
                    args.len()
                )))
            }
        };
        match name {
            "abs" | "Math.abs" => {
                arity(1)?;
                Ok(number(as_number(&args[0])?.abs()))
            }
            "floor" | "Math.floor" => {
                arity(1)?;
                Ok(number(as_number(&args[0])?.floor()))
            }
            "ceil" | "Math.ceil" => {
                arity(1)?;
                Ok(number(as_number(&args[0])?.ceil()))
            }
            "round" | "Math.round" => {
                arity(1)?;
                Ok(number(as_number(&args[0])?.round()))
            }
            "sqrt" | "Math.sqrt" => {
                arity(1)?;
                Ok(number(as_number(&args[0])?.sqrt()))
            }
            "pow" | "Math.pow" => {
                arity(2)?;
                Ok(number(as_number(&args[0])?.powf(as_number(&args[1])?)))
            }
            "min" | "Math.min" => {
                arity(2)?;
                Ok(number(as_number(&args[0])?.min(as_number(&args[1])?)))
            }
            "max" | "Math.max" => {
                arity(2)?;
                Ok(number(as_number(&args[0])?.max(as_number(&args[1])?)))
            }
            "len" => {
                arity(1)?;
                let n = match &args[0] {
                    Value::String(s) => s.chars().count(),
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    _ => {
                        return Err(EngineError::Execution(
                            "len expects a string, array, or object".to_string(),
                        ))
                    }
                };
                Ok(json!(n))
            }
            "upper" => {
                arity(1)?;
                Ok(Value::String(display(&args[0]).to_uppercase()))
            }
            "lower" => {
                arity(1)?;
                Ok(Value::String(display(&args[0]).to_lowercase()))
            }
            "trim" => {
                arity(1)?;
                Ok(Value::String(display(&args[0]).trim().to_string()))
            }
            "contains" => {
                arity(2)?;
                Ok(Value::Bool(
                    display(&args[0]).contains(&display(&args[1])),
                ))
            }
            "JSON.parse" => {
                arity(1)?;
                let text = display(&args[0]);
                serde_json::from_str(&text)
                    .map_err(|e| EngineError::Execution(format!("JSON.parse: {}", e)))
            }
            "JSON.stringify" => {
                arity(1)?;
                Ok(Value::String(args[0].to_string()))
            }
            "Date.now" => {
                arity(0)?;
                Ok(json!(chrono::Utc::now().timestamp_millis()))
            }
            "Date.iso" => {
                arity(0)?;
                Ok(Value::String(chrono::Utc::now().to_rfc3339()))
            }
            "log" | "console.log" => {
                let line = args.iter().map(display).collect::<Vec<_>>().join(" ");
                self.logs.push((LogLevel::Info, line));
                Ok(Value::Null)
            }
            "logError" | "console.error" => {
                let line = args.iter().map(display).collect::<Vec<_>>().join(" ");
                self.logs.push((LogLevel::Error, line));
                Ok(Value::Null)
            }
            other => Err(EngineError::Config(format!(
                "unknown function {:?}",
                other
            ))),
        }
    }

    /// Run a script: `let` bindings and a `return` (or final expression).
    pub fn run_script(&mut self, statements: &[Stmt]) -> EngineResult<Value> {
        let mut last = Value::Null;
        for statement in statements {
            match statement {
                Stmt::Let(name, value) => {
                    let evaluated = self.eval(value)?;
                    self.locals.insert(name.clone(), evaluated);
                }
                Stmt::Return(value) => return self.eval(value),
                Stmt::Expr(value) => last = self.eval(value)?,
            }
        }
        Ok(last)
    }
}

/// Collect the root identifiers an expression references.
pub fn referenced_roots(expr: &Expr, out: &mut std::collections::HashSet<String>) {
    match expr {
        Expr::Var(segments) => {
            out.insert(segments[0].clone());
        }
        Expr::Unary(_, inner) => referenced_roots(inner, out),
        Expr::Binary(_, lhs, rhs) => {
            referenced_roots(lhs, out);
            referenced_roots(rhs, out);
        }
        Expr::Call(_, args) => {
            for arg in args {
                referenced_roots(arg, out);
            }
        }
        _ => {}
    }
}

/// Emit integers without a trailing `.0` so templated output reads naturally.
pub fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.0e15 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

fn as_number(value: &Value) -> EngineResult<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EngineError::Execution("non-finite number".to_string())),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| EngineError::Execution(format!("{:?} is not a number", s))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(EngineError::Execution(format!(
            "{} is not a number",
            other
        ))),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Ok(l), Ok(r)) = (as_number(left), as_number(right)) {
        if left.is_number() || right.is_number() {
            return l == r;
        }
    }
    left == right
}

fn compare(left: &Value, right: &Value) -> EngineResult<std::cmp::Ordering> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        _ => {
            let l = as_number(left)?;
            let r = as_number(right)?;
            l.partial_cmp(&r)
                .ok_or_else(|| EngineError::Execution("incomparable values".to_string()))
        }
    }
}
