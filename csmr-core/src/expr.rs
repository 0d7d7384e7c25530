//! Guard and action expressions.
//!
//! Expressions are evaluated against a [`Scope`]: the instance context plus
//! the payload of the event being processed. The interpreter only talks to
//! the [`Expression`] and [`ExpressionLanguage`] traits, so the language can
//! be swapped without touching it.
//!
//! The native language supports:
//!
//! - `count`, `order` - context variables
//! - `$`, `$.amount`, `$[0]` - event payload
//! - `a.b`, `a[i]`, `a["key"]` - member access and indexing
//! - `42`, `1.5`, `"text"`, `'text'`, `true`, `false`, `null`, `[1, 2]` - literals
//! - `+ - * / %` - arithmetic (ints stay ints, overflow and division by zero fail)
//! - `== != < <= > >=` - comparison
//! - `!expr`, `expr && expr`, `expr || expr` - logic on booleans
//! - `len(x)`, `min(a, b)`, `max(a, b)`, `abs(x)`, `str(x)` - builtins
//! - `name := expr` - assignment (assign actions only)
//!
//! Examples:
//! - `count < 3`
//! - `count := count + 1`
//! - `$.status == "paid" && attempts <= max_attempts`

use crate::error::EvaluationError;
use crate::parser::Parser;
use crate::value::{values_equal, Context, Num, ValueType, VariableSchema};
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Bindings visible to an expression.
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub context: &'a Context,
    pub payload: Option<&'a Value>,
}

impl<'a> Scope<'a> {
    pub fn new(context: &'a Context, payload: Option<&'a Value>) -> Self {
        Self { context, payload }
    }
}

/// A compiled expression.
pub trait Expression: fmt::Debug + Send + Sync {
    /// Source text, used in error messages.
    fn source(&self) -> &str;

    fn evaluate(&self, scope: &Scope<'_>) -> Result<Value, EvaluationError>;

    /// Context variables read by the expression.
    fn references(&self) -> BTreeSet<String>;

    /// Static result type, `Any` when unknown.
    fn result_type(&self, _schema: &VariableSchema) -> ValueType {
        ValueType::Any
    }

    /// Operand types that can never work, if known statically.
    fn type_error(&self, _schema: &VariableSchema) -> Option<String> {
        None
    }

    /// True if the expression is the literal `true`.
    fn is_always_true(&self) -> bool {
        false
    }
}

/// Shared handle to a compiled expression.
pub type ExprRef = Arc<dyn Expression>;

/// Compiles expression source text.
pub trait ExpressionLanguage: Send + Sync {
    fn compile(&self, source: &str) -> Result<ExprRef, ParseError>;

    /// Compiles `name := expr`, returning the target variable and the value expression.
    fn compile_assignment(&self, source: &str) -> Result<(String, ExprRef), ParseError>;
}

/// Expression source text could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid expression '{source_text}' at {position}: {reason}")]
pub struct ParseError {
    pub source_text: String,
    pub position: usize,
    pub reason: String,
}

/// The built-in expression language.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLanguage;

impl ExpressionLanguage for NativeLanguage {
    fn compile(&self, source: &str) -> Result<ExprRef, ParseError> {
        Ok(Arc::new(CompiledExpr::parse(source)?))
    }

    fn compile_assignment(&self, source: &str) -> Result<(String, ExprRef), ParseError> {
        let (name, expr) = CompiledExpr::parse_assignment(source)?;
        Ok((name, Arc::new(expr)))
    }
}

/// Builtin functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Min,
    Max,
    Abs,
    Str,
}

impl Builtin {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "len" => Some(Builtin::Len),
            "min" => Some(Builtin::Min),
            "max" => Some(Builtin::Max),
            "abs" => Some(Builtin::Abs),
            "str" => Some(Builtin::Str),
            _ => None,
        }
    }

    pub(crate) fn arity(&self) -> usize {
        match self {
            Builtin::Len | Builtin::Abs | Builtin::Str => 1,
            Builtin::Min | Builtin::Max => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Var(String),
    /// The event payload, `$`.
    Payload,
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
}

/// An expression of the native language.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    ast: Expr,
}

impl CompiledExpr {
    /// Parses an expression.
    pub fn parse(source: &str) -> Result<Self, ParseError> {
        let ast = Parser::new(source).parse_complete()?;
        Ok(Self {
            source: source.trim().to_string(),
            ast,
        })
    }

    /// Parses `name := expr`.
    pub fn parse_assignment(source: &str) -> Result<(String, Self), ParseError> {
        let (name, ast) = Parser::new(source).parse_assignment()?;
        Ok((
            name,
            Self {
                source: source.trim().to_string(),
                ast,
            },
        ))
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }
}

impl Expression for CompiledExpr {
    fn source(&self) -> &str {
        &self.source
    }

    fn evaluate(&self, scope: &Scope<'_>) -> Result<Value, EvaluationError> {
        eval(&self.ast, scope).map_err(|fault| fault.into_error(&self.source))
    }

    fn references(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        collect_vars(&self.ast, &mut out);
        out
    }

    fn result_type(&self, schema: &VariableSchema) -> ValueType {
        infer(&self.ast, schema)
    }

    fn type_error(&self, schema: &VariableSchema) -> Option<String> {
        static_type_error(&self.ast, schema)
    }

    fn is_always_true(&self) -> bool {
        matches!(self.ast, Expr::Literal(Value::Bool(true)))
    }
}

// =========================================================================
// Evaluation
// =========================================================================

enum Fault {
    Undefined(String),
    Type(String),
    Arith(String),
}

impl Fault {
    fn into_error(self, expression: &str) -> EvaluationError {
        let expression = expression.to_string();
        match self {
            Fault::Undefined(name) => EvaluationError::UndefinedVariable { expression, name },
            Fault::Type(message) => EvaluationError::TypeMismatch { expression, message },
            Fault::Arith(message) => EvaluationError::Arithmetic { expression, message },
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn eval(expr: &Expr, scope: &Scope<'_>) -> Result<Value, Fault> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::List(items) => items
            .iter()
            .map(|e| eval(e, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Var(name) => scope
            .context
            .get(name)
            .cloned()
            .ok_or_else(|| Fault::Undefined(name.clone())),
        Expr::Payload => Ok(scope.payload.cloned().unwrap_or(Value::Null)),
        Expr::Member(base, field) => match eval(base, scope)? {
            Value::Object(mut map) => Ok(map.remove(field).unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => Err(Fault::Type(format!(
                "cannot access field '{}' of {}",
                field,
                type_name(&other)
            ))),
        },
        Expr::Index(base, index) => {
            let base = eval(base, scope)?;
            let index = eval(index, scope)?;
            match (base, &index) {
                (Value::Array(items), Value::Number(n)) => {
                    let i = n
                        .as_i64()
                        .ok_or_else(|| Fault::Type("list index must be an int".to_string()))?;
                    if i < 0 {
                        return Err(Fault::Arith(format!("negative list index {}", i)));
                    }
                    Ok(items.into_iter().nth(i as usize).unwrap_or(Value::Null))
                }
                (Value::Object(mut map), Value::String(key)) => {
                    Ok(map.remove(key).unwrap_or(Value::Null))
                }
                (Value::Null, _) => Ok(Value::Null),
                (other, _) => Err(Fault::Type(format!(
                    "cannot index {} with {}",
                    type_name(&other),
                    type_name(&index)
                ))),
            }
        }
        Expr::Unary(UnaryOp::Not, inner) => match eval(inner, scope)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(Fault::Type(format!("'!' expects bool, got {}", type_name(&other)))),
        },
        Expr::Unary(UnaryOp::Neg, inner) => {
            let v = eval(inner, scope)?;
            match Num::from_value(&v) {
                Some(Num::Int(i)) => i
                    .checked_neg()
                    .map(Value::from)
                    .ok_or_else(|| Fault::Arith("integer overflow".to_string())),
                Some(Num::Float(f)) => float_value(-f),
                None => Err(Fault::Type(format!("'-' expects a number, got {}", type_name(&v)))),
            }
        }
        Expr::Binary(BinaryOp::And, l, r) => {
            if !expect_bool(eval(l, scope)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            expect_bool(eval(r, scope)?, "&&").map(Value::Bool)
        }
        Expr::Binary(BinaryOp::Or, l, r) => {
            if expect_bool(eval(l, scope)?, "||")? {
                return Ok(Value::Bool(true));
            }
            expect_bool(eval(r, scope)?, "||").map(Value::Bool)
        }
        Expr::Binary(op, l, r) => {
            let l = eval(l, scope)?;
            let r = eval(r, scope)?;
            binary(*op, &l, &r)
        }
        Expr::Call(builtin, args) => {
            let args = args
                .iter()
                .map(|a| eval(a, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call(*builtin, &args)
        }
    }
}

fn expect_bool(value: Value, op: &str) -> Result<bool, Fault> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(Fault::Type(format!(
            "'{}' expects bool operands, got {}",
            op,
            type_name(&other)
        ))),
    }
}

fn float_value(f: f64) -> Result<Value, Fault> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| Fault::Arith("non-finite result".to_string()))
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, Fault> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(values_equal(l, r))),
        BinaryOp::Ne => return Ok(Value::Bool(!values_equal(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (l, r) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => match (Num::from_value(l), Num::from_value(r)) {
                    (Some(a), Some(b)) => a.compare(b),
                    _ => {
                        return Err(Fault::Type(format!(
                            "cannot compare {} {} {}",
                            type_name(l),
                            op.symbol(),
                            type_name(r)
                        )))
                    }
                },
            };
            let result = match ordering {
                Some(ord) => match op {
                    BinaryOp::Lt => ord == Ordering::Less,
                    BinaryOp::Le => ord != Ordering::Greater,
                    BinaryOp::Gt => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                },
                None => false,
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    if op == BinaryOp::Add {
        match (l, r) {
            (Value::String(a), Value::String(b)) => return Ok(Value::String(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => {
                return Ok(Value::Array(a.iter().chain(b).cloned().collect()))
            }
            _ => {}
        }
    }

    let (a, b) = match (Num::from_value(l), Num::from_value(r)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(Fault::Type(format!(
                "cannot apply '{}' to {} and {}",
                op.symbol(),
                type_name(l),
                type_name(r)
            )))
        }
    };

    match (a, b) {
        (Num::Int(x), Num::Int(y)) => {
            let result = match op {
                BinaryOp::Add => x.checked_add(y),
                BinaryOp::Sub => x.checked_sub(y),
                BinaryOp::Mul => x.checked_mul(y),
                BinaryOp::Div | BinaryOp::Rem if y == 0 => {
                    return Err(Fault::Arith("division by zero".to_string()))
                }
                BinaryOp::Div => x.checked_div(y),
                BinaryOp::Rem => x.checked_rem(y),
                _ => None,
            };
            result
                .map(Value::from)
                .ok_or_else(|| Fault::Arith("integer overflow".to_string()))
        }
        (a, b) => {
            let (x, y) = (a.as_f64(), b.as_f64());
            let result = match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div | BinaryOp::Rem if y == 0.0 => {
                    return Err(Fault::Arith("division by zero".to_string()))
                }
                BinaryOp::Div => x / y,
                _ => x % y,
            };
            float_value(result)
        }
    }
}

fn call(builtin: Builtin, args: &[Value]) -> Result<Value, Fault> {
    match builtin {
        Builtin::Len => match &args[0] {
            Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
            Value::Array(a) => Ok(Value::from(a.len() as i64)),
            Value::Object(o) => Ok(Value::from(o.len() as i64)),
            other => Err(Fault::Type(format!("len() of {}", type_name(other)))),
        },
        Builtin::Abs => match Num::from_value(&args[0]) {
            Some(Num::Int(i)) => i
                .checked_abs()
                .map(Value::from)
                .ok_or_else(|| Fault::Arith("integer overflow".to_string())),
            Some(Num::Float(f)) => float_value(f.abs()),
            None => Err(Fault::Type(format!("abs() of {}", type_name(&args[0])))),
        },
        Builtin::Min | Builtin::Max => {
            let (a, b) = match (Num::from_value(&args[0]), Num::from_value(&args[1])) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(Fault::Type(format!(
                        "min()/max() of {} and {}",
                        type_name(&args[0]),
                        type_name(&args[1])
                    )))
                }
            };
            let pick_first = match a.compare(b) {
                Some(Ordering::Greater) => builtin == Builtin::Max,
                Some(_) => builtin == Builtin::Min,
                None => true,
            };
            Ok(if pick_first { args[0].clone() } else { args[1].clone() })
        }
        Builtin::Str => match &args[0] {
            Value::String(s) => Ok(Value::String(s.clone())),
            other => Ok(Value::String(other.to_string())),
        },
    }
}

// =========================================================================
// Static analysis
// =========================================================================

fn collect_vars(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Var(name) => {
            out.insert(name.clone());
        }
        Expr::Literal(_) | Expr::Payload => {}
        Expr::List(items) | Expr::Call(_, items) => {
            items.iter().for_each(|e| collect_vars(e, out));
        }
        Expr::Member(base, _) | Expr::Unary(_, base) => collect_vars(base, out),
        Expr::Index(a, b) | Expr::Binary(_, a, b) => {
            collect_vars(a, out);
            collect_vars(b, out);
        }
    }
}

fn numeric(ty: ValueType) -> bool {
    matches!(ty, ValueType::Int | ValueType::Float)
}

fn infer(expr: &Expr, schema: &VariableSchema) -> ValueType {
    match expr {
        Expr::Literal(v) => ValueType::of(v),
        Expr::List(_) => ValueType::List,
        Expr::Var(name) => schema.type_of(name).unwrap_or(ValueType::Any),
        Expr::Payload | Expr::Member(..) | Expr::Index(..) => ValueType::Any,
        Expr::Unary(UnaryOp::Not, _) => ValueType::Bool,
        Expr::Unary(UnaryOp::Neg, inner) => match infer(inner, schema) {
            ty @ (ValueType::Int | ValueType::Float) => ty,
            _ => ValueType::Any,
        },
        Expr::Binary(op, l, r) => match op {
            BinaryOp::Or
            | BinaryOp::And
            | BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => ValueType::Bool,
            _ => {
                let (lt, rt) = (infer(l, schema), infer(r, schema));
                match (lt, rt) {
                    (ValueType::Int, ValueType::Int) => ValueType::Int,
                    (a, b) if numeric(a) && numeric(b) => ValueType::Float,
                    (ValueType::String, ValueType::String) if *op == BinaryOp::Add => {
                        ValueType::String
                    }
                    (ValueType::List, ValueType::List) if *op == BinaryOp::Add => ValueType::List,
                    _ => ValueType::Any,
                }
            }
        },
        Expr::Call(builtin, args) => match builtin {
            Builtin::Len => ValueType::Int,
            Builtin::Str => ValueType::String,
            Builtin::Abs => match infer(&args[0], schema) {
                ty if numeric(ty) => ty,
                _ => ValueType::Any,
            },
            Builtin::Min | Builtin::Max => {
                match (infer(&args[0], schema), infer(&args[1], schema)) {
                    (ValueType::Int, ValueType::Int) => ValueType::Int,
                    (ValueType::Float, ValueType::Float) => ValueType::Float,
                    _ => ValueType::Any,
                }
            }
        },
    }
}

/// Operand types that can never work for the given operator, if known statically.
fn static_type_error(expr: &Expr, schema: &VariableSchema) -> Option<String> {
    match expr {
        Expr::Binary(op, l, r) => {
            if let Some(err) =
                static_type_error(l, schema).or_else(|| static_type_error(r, schema))
            {
                return Some(err);
            }
            let (lt, rt) = (infer(l, schema), infer(r, schema));
            if lt == ValueType::Any || rt == ValueType::Any {
                return None;
            }
            let ok = match op {
                BinaryOp::And | BinaryOp::Or => lt == ValueType::Bool && rt == ValueType::Bool,
                BinaryOp::Eq | BinaryOp::Ne => true,
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                    (numeric(lt) && numeric(rt)) || (lt == ValueType::String && rt == lt)
                }
                BinaryOp::Add => {
                    (numeric(lt) && numeric(rt))
                        || (lt == rt && matches!(lt, ValueType::String | ValueType::List))
                }
                _ => numeric(lt) && numeric(rt),
            };
            (!ok).then(|| format!("cannot apply '{}' to {} and {}", op.symbol(), lt, rt))
        }
        Expr::Unary(op, inner) => {
            if let Some(err) = static_type_error(inner, schema) {
                return Some(err);
            }
            let ty = infer(inner, schema);
            let ok = match op {
                UnaryOp::Not => matches!(ty, ValueType::Bool | ValueType::Any),
                UnaryOp::Neg => numeric(ty) || ty == ValueType::Any,
            };
            (!ok).then(|| format!("invalid operand type {} for unary operator", ty))
        }
        Expr::List(items) | Expr::Call(_, items) => {
            items.iter().find_map(|e| static_type_error(e, schema))
        }
        Expr::Member(base, _) => static_type_error(base, schema),
        Expr::Index(a, b) => static_type_error(a, schema).or_else(|| static_type_error(b, schema)),
        Expr::Literal(_) | Expr::Var(_) | Expr::Payload => None,
    }
}

/// Evaluates a guard, requiring a boolean result.
pub fn evaluate_guard(expr: &dyn Expression, scope: &Scope<'_>) -> Result<bool, EvaluationError> {
    match expr.evaluate(scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvaluationError::TypeMismatch {
            expression: expr.source().to_string(),
            message: format!("guard evaluated to {} instead of bool", type_name(&other)),
        }),
    }
}
