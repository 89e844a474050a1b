//! Purpose: Compile jq-style expressions into query predicates over field values.
//! Exports: `FieldExpr`, `compile_expr`.
//! Role: The only way predicates arrive from outside the process (CLI args, HTTP queries).
//! Invariants: Expressions are pure filters: no I/O, no environment, no host code execution.
//! Invariants: Row input is `[v1, v2, ...]` in queried-field order, `null` where a value is absent.
//! Invariants: Group input is `[[v1...], [v2...], ...]`, one list per queried field.
//! Invariants: Compile failures and non-boolean outputs are usage errors; runtime failures are
//!   predicate errors that abort the query.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use jaq_core::load::{Arena, File, Loader};
use jaq_core::ops::Math;
use jaq_core::path::Opt;
use jaq_core::val::Range;
use jaq_core::{Compiler, Ctx, Error as JaqError, Native, RcIter, ValX};

use crate::core::error::{Error, ErrorKind};
use crate::core::value::Value;

#[derive(Clone)]
pub struct FieldExpr {
    source: String,
    filter: jaq_core::Filter<Native<Operand>>,
}

impl fmt::Debug for FieldExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldExpr")
            .field("source", &self.source)
            .finish()
    }
}

impl FieldExpr {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against one key's per-field values.
    pub fn matches_row(&self, values: &[Option<&Value>]) -> Result<bool, Error> {
        self.evaluate(Operand(slots(values)))
    }

    /// Evaluate against one group's per-field value lists.
    pub fn matches_group(&self, lists: &[Vec<Option<&Value>>]) -> Result<bool, Error> {
        let input = Value::List(lists.iter().map(|list| slots(list)).collect());
        self.evaluate(Operand(input))
    }

    fn evaluate(&self, input: Operand) -> Result<bool, Error> {
        let inputs = RcIter::new(core::iter::empty::<Result<Operand, String>>());
        let out = self.filter.run((Ctx::new([], &inputs), input));

        let mut any_true = false;
        for item in out {
            match item {
                Ok(Operand(Value::Bool(true))) => any_true = true,
                Ok(Operand(Value::Bool(false))) => {}
                Ok(other) => {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("query expression must yield booleans")
                        .with_hint(format!(
                            "Expression `{}` yielded non-boolean value: {other}",
                            self.source
                        )));
                }
                Err(_) => {
                    return Err(Error::new(ErrorKind::Predicate)
                        .with_message("query expression failed during evaluation")
                        .with_hint(format!(
                            "Expression `{}` raised an error; guard absent values with `!= null`.",
                            self.source
                        )));
                }
            }
        }

        Ok(any_true)
    }
}

pub fn compile_expr(source: &str) -> Result<FieldExpr, Error> {
    let arena = Arena::default();
    let loader = Loader::new(std::iter::empty());

    let program = File {
        code: source,
        path: (),
    };
    let modules = loader
        .load(&arena, program)
        .map_err(|errs| compile_error(source, errs))?;

    let filter = Compiler::default()
        .with_funs(jaq_std::base_funs::<Operand>())
        .compile(modules)
        .map_err(|errs| compile_error(source, errs))?;

    Ok(FieldExpr {
        source: source.to_string(),
        filter,
    })
}

fn compile_error<E: fmt::Debug>(source: &str, err: E) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message("invalid query expression")
        .with_hint(format!(
            "Failed to parse/compile `{source}`.\nDetails: {err:?}\nExample: --where '.[0] != null and .[1] == null'"
        ))
}

/// Absent slots read as `null`.
fn slots(values: &[Option<&Value>]) -> Value {
    Value::List(
        values
            .iter()
            .map(|slot| slot.cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

/// A field value as the expression engine sees it.
///
/// Integer arithmetic stays exact and falls back to floats only on overflow
/// or an inexact quotient. Comparison puts both number kinds in one domain,
/// so `1 == 1.0` holds here even though they are distinct group keys.
#[derive(Clone, Debug)]
pub struct Operand(Value);

type OpResult = Result<Operand, JaqError<Operand>>;

fn kind_order(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::Str(_) => 3,
        Value::List(_) => 4,
        Value::Map(_) => 5,
    }
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::List(x), Value::List(y)) => compare_seq(x.iter(), y.iter(), compare),
        (Value::Map(x), Value::Map(y)) => compare_seq(x.iter(), y.iter(), |(ka, va), (kb, vb)| {
            ka.cmp(kb).then_with(|| compare(va, vb))
        }),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or_else(|| x.total_cmp(&y)),
            _ => kind_order(a).cmp(&kind_order(b)),
        },
    }
}

fn compare_seq<T>(
    mut a: impl Iterator<Item = T>,
    mut b: impl Iterator<Item = T>,
    cmp: impl Fn(T, T) -> Ordering,
) -> Ordering {
    loop {
        match (a.next(), b.next()) {
            (Some(x), Some(y)) => match cmp(x, y) {
                Ordering::Equal => {}
                other => return other,
            },
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn arith(op: Math, lhs: Value, rhs: Value) -> OpResult {
    let out = match (op, lhs, rhs) {
        (Math::Add, Value::Null, other) | (Math::Add, other, Value::Null) => other,
        (Math::Add, Value::Str(a), Value::Str(b)) => Value::Str(a + &b),
        (Math::Add, Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Value::List(a)
        }
        (Math::Add, Value::Map(mut a), Value::Map(b)) => {
            a.extend(b);
            Value::Map(a)
        }
        (op, Value::Int(a), Value::Int(b)) => return int_arith(op, a, b),
        (op, lhs, rhs) => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Value::Float(float_arith(&op, a, b)),
            _ => return Err(JaqError::math(Operand(lhs), op, Operand(rhs))),
        },
    };
    Ok(Operand(out))
}

fn int_arith(op: Math, a: i64, b: i64) -> OpResult {
    let widened = || float_arith(&op, a as f64, b as f64);
    let out = match op {
        Math::Add => a.checked_add(b).map_or_else(|| Value::Float(widened()), Value::Int),
        Math::Sub => a.checked_sub(b).map_or_else(|| Value::Float(widened()), Value::Int),
        Math::Mul => a.checked_mul(b).map_or_else(|| Value::Float(widened()), Value::Int),
        Math::Div => match (a.checked_rem(b), a.checked_div(b)) {
            (Some(0), Some(q)) => Value::Int(q),
            _ if b == 0 => return Err(zero_divisor(Math::Div, a)),
            _ => Value::Float(widened()),
        },
        Math::Rem => match a.checked_rem(b) {
            Some(r) => Value::Int(r),
            None if b == 0 => return Err(zero_divisor(Math::Rem, a)),
            None => Value::Int(0),
        },
    };
    Ok(Operand(out))
}

fn zero_divisor(op: Math, a: i64) -> JaqError<Operand> {
    JaqError::math(Operand(Value::Int(a)), op, Operand(Value::Int(0)))
}

fn float_arith(op: &Math, a: f64, b: f64) -> f64 {
    match op {
        Math::Add => a + b,
        Math::Sub => a - b,
        Math::Mul => a * b,
        Math::Div => a / b,
        Math::Rem => a % b,
    }
}

/// Resolve a possibly negative position against `len`.
fn position(index: isize, len: usize) -> Option<usize> {
    let index = if index < 0 { len as isize + index } else { index };
    usize::try_from(index).ok().filter(|pos| *pos < len)
}

fn slice_bounds(len: usize, range: &Range<&Operand>) -> Result<(usize, usize), JaqError<Operand>> {
    let len = len as isize;
    let bound = |slot: Option<&Operand>, default: isize| -> Result<usize, JaqError<Operand>> {
        let index = match slot {
            None => default,
            Some(operand) => operand
                .0
                .as_index()
                .ok_or_else(|| JaqError::typ(operand.clone(), "integer"))?,
        };
        let index = if index < 0 { len + index } else { index };
        Ok(index.clamp(0, len) as usize)
    };
    let start = bound(range.start, 0)?;
    let end = bound(range.end, len)?;
    Ok((start, end.max(start)))
}

fn unmapped<'a>(
    opt: Opt,
    value: Operand,
    err: impl FnOnce(Operand) -> JaqError<Operand>,
) -> ValX<'a, Operand> {
    match opt {
        Opt::Optional => Ok(value),
        Opt::Essential => Err(err(value).into()),
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<bool> for Operand {
    fn from(value: bool) -> Self {
        Self(Value::Bool(value))
    }
}

impl From<isize> for Operand {
    fn from(value: isize) -> Self {
        Self(Value::Int(value as i64))
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Self(Value::Float(value))
    }
}

impl From<String> for Operand {
    fn from(value: String) -> Self {
        Self(Value::Str(value))
    }
}

impl FromIterator<Self> for Operand {
    fn from_iter<T: IntoIterator<Item = Self>>(iter: T) -> Self {
        Self(Value::List(iter.into_iter().map(|operand| operand.0).collect()))
    }
}

impl PartialEq for Operand {
    fn eq(&self, other: &Self) -> bool {
        compare(&self.0, &other.0) == Ordering::Equal
    }
}

impl Eq for Operand {}

impl PartialOrd for Operand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Operand {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.0, &other.0)
    }
}

macro_rules! arith_ops {
    ($($op:ident :: $method:ident),* $(,)?) => {$(
        impl std::ops::$op for Operand {
            type Output = OpResult;

            fn $method(self, rhs: Self) -> OpResult {
                arith(Math::$op, self.0, rhs.0)
            }
        }
    )*};
}

arith_ops!(Add::add, Sub::sub, Mul::mul, Div::div, Rem::rem);

impl std::ops::Neg for Operand {
    type Output = OpResult;

    fn neg(self) -> OpResult {
        match self.0 {
            Value::Int(n) => Ok(Self(
                n.checked_neg().map_or_else(|| Value::Float(-(n as f64)), Value::Int),
            )),
            Value::Float(n) => Ok(Self(Value::Float(-n))),
            other => Err(JaqError::typ(Self(other), "number")),
        }
    }
}

impl jaq_core::ValT for Operand {
    fn from_num(n: &str) -> OpResult {
        match n.parse::<i64>() {
            Ok(int) => Ok(Self(Value::Int(int))),
            Err(_) => n
                .parse::<f64>()
                .map(|float| Self(Value::Float(float)))
                .map_err(JaqError::str),
        }
    }

    fn from_map<I: IntoIterator<Item = (Self, Self)>>(iter: I) -> OpResult {
        let mut map = BTreeMap::new();
        for (key, value) in iter {
            match key.0 {
                Value::Str(key) => {
                    map.insert(key, value.0);
                }
                other => return Err(JaqError::typ(Self(other), "string")),
            }
        }
        Ok(Self(Value::Map(map)))
    }

    fn values(self) -> Box<dyn Iterator<Item = OpResult>> {
        match self.0 {
            Value::List(items) => Box::new(items.into_iter().map(|item| Ok(Self(item)))),
            Value::Map(map) => Box::new(map.into_values().map(|item| Ok(Self(item)))),
            other => Box::new(std::iter::once(Err(JaqError::typ(Self(other), "iterable")))),
        }
    }

    fn index(self, index: &Self) -> OpResult {
        match (self.0, &index.0) {
            (Value::Null, _) => Ok(Self(Value::Null)),
            (Value::Map(mut map), Value::Str(key)) => {
                Ok(Self(map.remove(key).unwrap_or(Value::Null)))
            }
            (Value::List(mut items), at) => match at.as_index() {
                Some(at) => Ok(Self(
                    position(at, items.len()).map_or(Value::Null, |pos| items.swap_remove(pos)),
                )),
                None => Err(JaqError::index(Self(Value::List(items)), index.clone())),
            },
            (other, _) => Err(JaqError::index(Self(other), index.clone())),
        }
    }

    fn range(self, range: Range<&Self>) -> OpResult {
        match self.0 {
            Value::Null => Ok(Self(Value::Null)),
            Value::List(items) => {
                let (start, end) = slice_bounds(items.len(), &range)?;
                Ok(Self(Value::List(
                    items.into_iter().skip(start).take(end - start).collect(),
                )))
            }
            Value::Str(text) => {
                let chars: Vec<char> = text.chars().collect();
                let (start, end) = slice_bounds(chars.len(), &range)?;
                Ok(Self(Value::Str(chars[start..end].iter().collect())))
            }
            other => Err(JaqError::typ(Self(other), "array")),
        }
    }

    fn map_values<'a, I: Iterator<Item = ValX<'a, Self>>>(
        self,
        opt: Opt,
        f: impl Fn(Self) -> I,
    ) -> ValX<'a, Self> {
        match self.0 {
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(next) = f(Self(item)).next() {
                        out.push(next?.0);
                    }
                }
                Ok(Self(Value::List(out)))
            }
            Value::Map(map) => {
                let mut out = BTreeMap::new();
                for (key, item) in map {
                    if let Some(next) = f(Self(item)).next() {
                        out.insert(key, next?.0);
                    }
                }
                Ok(Self(Value::Map(out)))
            }
            other => unmapped(opt, Self(other), |value| JaqError::typ(value, "iterable")),
        }
    }

    fn map_index<'a, I: Iterator<Item = ValX<'a, Self>>>(
        self,
        index: &Self,
        opt: Opt,
        f: impl Fn(Self) -> I,
    ) -> ValX<'a, Self> {
        match (self.0, &index.0) {
            (target @ (Value::Map(_) | Value::Null), Value::Str(key)) => {
                let mut map = match target {
                    Value::Map(map) => map,
                    _ => BTreeMap::new(),
                };
                let current = map.remove(key).unwrap_or(Value::Null);
                if let Some(next) = f(Self(current)).next() {
                    map.insert(key.clone(), next?.0);
                }
                Ok(Self(Value::Map(map)))
            }
            (Value::List(mut items), at) => {
                let Some(pos) = at.as_index().and_then(|at| position(at, items.len())) else {
                    return unmapped(opt, Self(Value::List(items)), |value| {
                        JaqError::index(value, index.clone())
                    });
                };
                let current = std::mem::replace(&mut items[pos], Value::Null);
                match f(Self(current)).next() {
                    Some(next) => items[pos] = next?.0,
                    None => {
                        items.remove(pos);
                    }
                }
                Ok(Self(Value::List(items)))
            }
            (other, _) => unmapped(opt, Self(other), |value| JaqError::index(value, index.clone())),
        }
    }

    fn map_range<'a, I: Iterator<Item = ValX<'a, Self>>>(
        self,
        range: Range<&Self>,
        opt: Opt,
        f: impl Fn(Self) -> I,
    ) -> ValX<'a, Self> {
        match self.0 {
            Value::List(mut items) => {
                let (start, end) = slice_bounds(items.len(), &range)?;
                let slice = Value::List(items[start..end].to_vec());
                let replacement = match f(Self(slice)).next() {
                    None => Vec::new(),
                    Some(next) => match next?.0 {
                        Value::List(replacement) => replacement,
                        other => return Err(JaqError::typ(Self(other), "array").into()),
                    },
                };
                items.splice(start..end, replacement);
                Ok(Self(Value::List(items)))
            }
            other => unmapped(opt, Self(other), |value| JaqError::typ(value, "array")),
        }
    }

    fn as_bool(&self) -> bool {
        !matches!(self.0, Value::Null | Value::Bool(false))
    }

    fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }
}

impl jaq_std::ValT for Operand {
    fn into_seq<S: FromIterator<Self>>(self) -> Result<S, Self> {
        match self.0 {
            Value::List(items) => Ok(items.into_iter().map(Self).collect()),
            other => Err(Self(other)),
        }
    }

    fn as_isize(&self) -> Option<isize> {
        self.0.as_index()
    }

    fn as_f64(&self) -> Result<f64, JaqError<Self>> {
        self.0
            .as_f64()
            .ok_or_else(|| JaqError::typ(self.clone(), "number"))
    }
}
