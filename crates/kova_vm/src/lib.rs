use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use indexmap::IndexMap;
use kova_parser::parse_module;
use kova_syntax::{BinaryOp, Expr, Ident, Module, Span, Stmt, UnaryOp};
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Pow, Signed, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

// -------------------------- object model --------------------------

/// Host-callable thunk signature: `(vm, self, args) -> value`. The receiver
/// is passed both as `self` and as the first positional argument so native
/// thunks and user-defined magic methods observe the same call shape.
pub type NativeFn = fn(&mut Vm, Value, Vec<Value>) -> Result<Value, String>;

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(Rc<BigInt>),
    Rational(Rc<RationalValue>),
    Str(Rc<String>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<IndexMap<String, Value>>>),
    Code(Rc<CodeObject>),
    Function(Rc<FunctionValue>),
    Native(Rc<NativeFunction>),
    Module(Rc<ModuleValue>),
}

/// Reduced fraction: gcd(numer, denom) == 1 and denom > 0. Construct only
/// through [`reduced_rational`], which also normalizes denominator 1 to Int.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RationalValue {
    pub numer: BigInt,
    pub denom: BigInt,
}

#[derive(Debug)]
pub struct FunctionValue {
    pub name: String,
    pub arity: usize,
    pub code: Rc<CodeObject>,
}

pub struct NativeFunction {
    pub name: String,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug)]
pub struct ModuleValue {
    pub name: String,
    pub attrs: RefCell<IndexMap<String, Value>>,
    pub code: Option<Rc<CodeObject>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Nil,
    Bool,
    Int,
    Rational,
    Str,
    List,
    Dict,
    Code,
    Function,
    Native,
    Module,
}

const TYPE_TAG_COUNT: usize = 11;

impl TypeTag {
    pub fn of(value: &Value) -> TypeTag {
        match value {
            Value::Nil => TypeTag::Nil,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Rational(_) => TypeTag::Rational,
            Value::Str(_) => TypeTag::Str,
            Value::List(_) => TypeTag::List,
            Value::Dict(_) => TypeTag::Dict,
            Value::Code(_) => TypeTag::Code,
            Value::Function(_) => TypeTag::Function,
            Value::Native(_) => TypeTag::Native,
            Value::Module(_) => TypeTag::Module,
        }
    }

    fn index(self) -> usize {
        match self {
            TypeTag::Nil => 0,
            TypeTag::Bool => 1,
            TypeTag::Int => 2,
            TypeTag::Rational => 3,
            TypeTag::Str => 4,
            TypeTag::List => 5,
            TypeTag::Dict => 6,
            TypeTag::Code => 7,
            TypeTag::Function => 8,
            TypeTag::Native => 9,
            TypeTag::Module => 10,
        }
    }
}

pub fn type_name_of_value(value: &Value) -> &'static str {
    match TypeTag::of(value) {
        TypeTag::Nil => "Nil",
        TypeTag::Bool => "Bool",
        TypeTag::Int => "Int",
        TypeTag::Rational => "Rational",
        TypeTag::Str => "String",
        TypeTag::List => "List",
        TypeTag::Dict => "Dict",
        TypeTag::Code => "CodeObject",
        TypeTag::Function => "Function",
        TypeTag::Native => "NativeFunction",
        TypeTag::Module => "Module",
    }
}

pub fn format_value(value: &Value) -> String {
    match value {
        Value::Nil => "Nil".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Int(value) => value.to_string(),
        Value::Rational(value) => format!("{}/{}", value.numer, value.denom),
        Value::Str(value) => format!("\"{}\"", value),
        Value::List(items) => format!(
            "[{}]",
            items
                .borrow()
                .iter()
                .map(format_value)
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Value::Dict(entries) => {
            let items = entries
                .borrow()
                .iter()
                .map(|(key, value)| format!("{key}: {}", format_value(value)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{{{items}}}")
        }
        Value::Code(code) => format!(
            "<CodeObject: consts={}, names={}>",
            code.consts.len(),
            code.names.len()
        ),
        Value::Function(func) => {
            format!("<Function: name=\"{}\", argc={}>", func.name, func.arity)
        }
        Value::Native(func) => format!("<NativeFunction: name=\"{}\">", func.name),
        Value::Module(module) => format!("<Module: name=\"{}\">", module.name),
    }
}

/// Structural equality used by `OP_EQ` natives and container membership.
/// Numeric kinds compare after promotion; containers compare elementwise;
/// function-like kinds fall back to identity.
pub fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let x = x.borrow();
            let y = y.borrow();
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| value_eq(a, b))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let x = x.borrow();
            let y = y.borrow();
            x.len() == y.len()
                && x.iter()
                    .all(|(key, value)| y.get(key).is_some_and(|other| value_eq(value, other)))
        }
        _ => {
            if let (Some((an, ad)), Some((bn, bd))) = (numeric_parts(a), numeric_parts(b)) {
                return an * bd == bn * ad;
            }
            value_is(a, b)
        }
    }
}

/// Pure identity (`is`): handle equality for heap values, structural for
/// the immediate kinds. No magic-method dispatch.
pub fn value_is(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => Rc::ptr_eq(x, y),
        (Value::Rational(x), Value::Rational(y)) => Rc::ptr_eq(x, y),
        (Value::Str(x), Value::Str(y)) => Rc::ptr_eq(x, y),
        (Value::List(x), Value::List(y)) => Rc::ptr_eq(x, y),
        (Value::Dict(x), Value::Dict(y)) => Rc::ptr_eq(x, y),
        (Value::Code(x), Value::Code(y)) => Rc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        (Value::Native(x), Value::Native(y)) => Rc::ptr_eq(x, y),
        (Value::Module(x), Value::Module(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Numerator/denominator view of a numeric value (integers as n/1).
fn numeric_parts(value: &Value) -> Option<(BigInt, BigInt)> {
    match value {
        Value::Int(value) => Some(((**value).clone(), BigInt::one())),
        Value::Rational(value) => Some((value.numer.clone(), value.denom.clone())),
        _ => None,
    }
}

/// Builds the reduced normal form of numer/denom: gcd 1, denominator
/// positive, and denominator 1 collapsing to Int.
pub fn reduced_rational(numer: BigInt, denom: BigInt) -> Result<Value, String> {
    if denom.is_zero() {
        return Err("division by zero".to_string());
    }
    let (mut numer, mut denom) = if denom.is_negative() {
        (-numer, -denom)
    } else {
        (numer, denom)
    };
    let g = numer.gcd(&denom);
    if !g.is_zero() {
        numer /= &g;
        denom /= &g;
    }
    if denom.is_one() {
        Ok(Value::Int(Rc::new(numer)))
    } else {
        Ok(Value::Rational(Rc::new(RationalValue { numer, denom })))
    }
}

fn int_value(value: BigInt) -> Value {
    Value::Int(Rc::new(value))
}

fn str_value(value: String) -> Value {
    Value::Str(Rc::new(value))
}

fn list_value(items: Vec<Value>) -> Value {
    Value::List(Rc::new(RefCell::new(items)))
}

fn dict_value(entries: IndexMap<String, Value>) -> Value {
    Value::Dict(Rc::new(RefCell::new(entries)))
}

// -------------------------- magic-method table --------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    Eq,
    Lt,
    Gt,
    In,
    Bool,
}

const MAGIC_OP_COUNT: usize = 12;

impl MagicOp {
    fn index(self) -> usize {
        match self {
            MagicOp::Add => 0,
            MagicOp::Sub => 1,
            MagicOp::Mul => 2,
            MagicOp::Div => 3,
            MagicOp::Mod => 4,
            MagicOp::Pow => 5,
            MagicOp::Neg => 6,
            MagicOp::Eq => 7,
            MagicOp::Lt => 8,
            MagicOp::Gt => 9,
            MagicOp::In => 10,
            MagicOp::Bool => 11,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            MagicOp::Add => "+",
            MagicOp::Sub => "-",
            MagicOp::Mul => "*",
            MagicOp::Div => "/",
            MagicOp::Mod => "%",
            MagicOp::Pow => "^",
            MagicOp::Neg => "unary -",
            MagicOp::Eq => "==",
            MagicOp::Lt => "<",
            MagicOp::Gt => ">",
            MagicOp::In => "in",
            MagicOp::Bool => "bool",
        }
    }
}

/// Per-kind operator slots, shared by every instance of a kind. An empty
/// slot means the operator is unsupported for that kind.
pub struct MagicTable {
    slots: [[Option<Value>; MAGIC_OP_COUNT]; TYPE_TAG_COUNT],
}

impl MagicTable {
    fn empty() -> Self {
        Self {
            slots: std::array::from_fn(|_| std::array::from_fn(|_| None)),
        }
    }

    pub fn get(&self, tag: TypeTag, op: MagicOp) -> Option<&Value> {
        self.slots[tag.index()][op.index()].as_ref()
    }

    pub fn set(&mut self, tag: TypeTag, op: MagicOp, value: Value) {
        self.slots[tag.index()][op.index()] = Some(value);
    }
}

fn native_value(name: &str, func: NativeFn) -> Value {
    Value::Native(Rc::new(NativeFunction {
        name: name.to_string(),
        func,
    }))
}

/// Installs the out-of-the-box operator set. Every (kind, operator) pair
/// listed here must be present; every other pair stays empty.
fn default_magic_table() -> MagicTable {
    let mut table = MagicTable::empty();

    table.set(TypeTag::Int, MagicOp::Add, native_value("Int.add", num_add));
    table.set(TypeTag::Int, MagicOp::Sub, native_value("Int.sub", num_sub));
    table.set(TypeTag::Int, MagicOp::Mul, native_value("Int.mul", num_mul));
    table.set(TypeTag::Int, MagicOp::Div, native_value("Int.div", num_div));
    table.set(TypeTag::Int, MagicOp::Mod, native_value("Int.mod", int_mod));
    table.set(TypeTag::Int, MagicOp::Pow, native_value("Int.pow", int_pow));
    table.set(TypeTag::Int, MagicOp::Neg, native_value("Int.neg", int_neg));
    table.set(TypeTag::Int, MagicOp::Eq, native_value("Int.eq", num_eq));
    table.set(TypeTag::Int, MagicOp::Lt, native_value("Int.lt", num_lt));
    table.set(TypeTag::Int, MagicOp::Gt, native_value("Int.gt", num_gt));

    table.set(
        TypeTag::Rational,
        MagicOp::Add,
        native_value("Rational.add", num_add),
    );
    table.set(
        TypeTag::Rational,
        MagicOp::Sub,
        native_value("Rational.sub", num_sub),
    );
    table.set(
        TypeTag::Rational,
        MagicOp::Mul,
        native_value("Rational.mul", num_mul),
    );
    table.set(
        TypeTag::Rational,
        MagicOp::Div,
        native_value("Rational.div", num_div),
    );
    table.set(
        TypeTag::Rational,
        MagicOp::Eq,
        native_value("Rational.eq", num_eq),
    );
    table.set(
        TypeTag::Rational,
        MagicOp::Lt,
        native_value("Rational.lt", num_lt),
    );
    table.set(
        TypeTag::Rational,
        MagicOp::Gt,
        native_value("Rational.gt", num_gt),
    );

    table.set(TypeTag::Str, MagicOp::Add, native_value("String.add", str_add));
    table.set(TypeTag::Str, MagicOp::Mul, native_value("String.mul", str_mul));
    table.set(TypeTag::Str, MagicOp::Eq, native_value("String.eq", str_eq));
    table.set(TypeTag::Str, MagicOp::In, native_value("String.in", str_in));

    table.set(TypeTag::List, MagicOp::Add, native_value("List.add", list_add));
    table.set(TypeTag::List, MagicOp::Mul, native_value("List.mul", list_mul));
    table.set(TypeTag::List, MagicOp::Eq, native_value("List.eq", list_eq));
    table.set(TypeTag::List, MagicOp::In, native_value("List.in", list_in));

    table.set(TypeTag::Dict, MagicOp::Add, native_value("Dict.add", dict_add));
    table.set(TypeTag::Dict, MagicOp::In, native_value("Dict.in", dict_in));

    table.set(TypeTag::Bool, MagicOp::Eq, native_value("Bool.eq", bool_eq));

    table.set(TypeTag::Nil, MagicOp::Eq, native_value("Nil.eq", nil_eq));

    table
}

fn magic_arg2(args: &[Value], op: &str) -> Result<(Value, Value), String> {
    match args {
        [a, b] => Ok((a.clone(), b.clone())),
        _ => Err(format!("`{op}` expects two operands, got {}", args.len())),
    }
}

fn unsupported_operands(op: &str, a: &Value, b: &Value) -> String {
    format!(
        "unsupported operand types for `{op}`: {} and {}",
        type_name_of_value(a),
        type_name_of_value(b)
    )
}

fn num_add(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "+")?;
    let ((an, ad), (bn, bd)) = match (numeric_parts(&a), numeric_parts(&b)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(unsupported_operands("+", &a, &b)),
    };
    reduced_rational(&an * &bd + &bn * &ad, ad * bd)
}

fn num_sub(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "-")?;
    let ((an, ad), (bn, bd)) = match (numeric_parts(&a), numeric_parts(&b)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(unsupported_operands("-", &a, &b)),
    };
    reduced_rational(&an * &bd - &bn * &ad, ad * bd)
}

fn num_mul(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "*")?;
    let ((an, ad), (bn, bd)) = match (numeric_parts(&a), numeric_parts(&b)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(unsupported_operands("*", &a, &b)),
    };
    reduced_rational(an * bn, ad * bd)
}

fn num_div(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "/")?;
    let ((an, ad), (bn, bd)) = match (numeric_parts(&a), numeric_parts(&b)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(unsupported_operands("/", &a, &b)),
    };
    reduced_rational(an * bd, ad * bn)
}

fn int_mod(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "%")?;
    match (&a, &b) {
        (Value::Int(a), Value::Int(b)) => {
            if b.is_zero() {
                return Err("modulus by zero".to_string());
            }
            Ok(int_value((**a).clone() % (**b).clone()))
        }
        _ => Err(unsupported_operands("%", &a, &b)),
    }
}

fn int_pow(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "^")?;
    match (&a, &b) {
        (Value::Int(base), Value::Int(exponent)) => {
            if exponent.is_negative() {
                let magnitude = exponent
                    .magnitude()
                    .to_u32()
                    .ok_or_else(|| "exponent too large".to_string())?;
                let power = Pow::pow(&**base, magnitude);
                return reduced_rational(BigInt::one(), power);
            }
            let exponent = exponent
                .to_u32()
                .ok_or_else(|| "exponent too large".to_string())?;
            Ok(int_value(Pow::pow(&**base, exponent)))
        }
        _ => Err(unsupported_operands("^", &a, &b)),
    }
}

fn int_neg(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    match args.first() {
        Some(Value::Int(value)) => Ok(int_value(-(**value).clone())),
        Some(other) => Err(format!(
            "unsupported operand type for unary `-`: {}",
            type_name_of_value(other)
        )),
        None => Err("unary `-` expects one operand".to_string()),
    }
}

fn num_eq(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "==")?;
    match (numeric_parts(&a), numeric_parts(&b)) {
        (Some((an, ad)), Some((bn, bd))) => Ok(Value::Bool(an * bd == bn * ad)),
        _ => Ok(Value::Bool(false)),
    }
}

fn num_lt(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "<")?;
    match (numeric_parts(&a), numeric_parts(&b)) {
        (Some((an, ad)), Some((bn, bd))) => Ok(Value::Bool(an * bd < bn * ad)),
        _ => Err(unsupported_operands("<", &a, &b)),
    }
}

fn num_gt(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, ">")?;
    match (numeric_parts(&a), numeric_parts(&b)) {
        (Some((an, ad)), Some((bn, bd))) => Ok(Value::Bool(an * bd > bn * ad)),
        _ => Err(unsupported_operands(">", &a, &b)),
    }
}

fn str_add(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "+")?;
    match (&a, &b) {
        (Value::Str(a), Value::Str(b)) => {
            let mut combined = String::with_capacity(a.len() + b.len());
            combined.push_str(a);
            combined.push_str(b);
            Ok(str_value(combined))
        }
        _ => Err(unsupported_operands("+", &a, &b)),
    }
}

fn repeat_count(value: &Value) -> Result<usize, String> {
    match value {
        Value::Int(count) => count
            .to_usize()
            .ok_or_else(|| "repeat count must be a non-negative integer".to_string()),
        other => Err(format!(
            "repeat count must be Int, got {}",
            type_name_of_value(other)
        )),
    }
}

fn str_mul(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "*")?;
    match &a {
        Value::Str(text) => {
            let count = repeat_count(&b)?;
            Ok(str_value(text.repeat(count)))
        }
        _ => Err(unsupported_operands("*", &a, &b)),
    }
}

fn str_eq(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "==")?;
    match (&a, &b) {
        (Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a == b)),
        _ => Ok(Value::Bool(false)),
    }
}

fn str_in(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (container, needle) = magic_arg2(&args, "in")?;
    match (&container, &needle) {
        (Value::Str(container), Value::Str(needle)) => {
            Ok(Value::Bool(container.contains(needle.as_str())))
        }
        _ => Err(format!(
            "string membership test requires a string, got {}",
            type_name_of_value(&needle)
        )),
    }
}

fn list_add(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "+")?;
    match (&a, &b) {
        (Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(list_value(items))
        }
        _ => Err(unsupported_operands("+", &a, &b)),
    }
}

fn list_mul(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "*")?;
    match &a {
        Value::List(source) => {
            let count = repeat_count(&b)?;
            let source = source.borrow();
            let mut items = Vec::with_capacity(source.len() * count);
            for _ in 0..count {
                items.extend(source.iter().cloned());
            }
            Ok(list_value(items))
        }
        _ => Err(unsupported_operands("*", &a, &b)),
    }
}

fn list_eq(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "==")?;
    match (&a, &b) {
        (Value::List(_), Value::List(_)) => Ok(Value::Bool(value_eq(&a, &b))),
        _ => Ok(Value::Bool(false)),
    }
}

fn list_in(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (container, needle) = magic_arg2(&args, "in")?;
    match &container {
        Value::List(items) => Ok(Value::Bool(
            items.borrow().iter().any(|item| value_eq(item, &needle)),
        )),
        _ => Err(unsupported_operands("in", &container, &needle)),
    }
}

fn dict_add(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "+")?;
    match (&a, &b) {
        (Value::Dict(a), Value::Dict(b)) => {
            let mut entries = a.borrow().clone();
            for (key, value) in b.borrow().iter() {
                entries.insert(key.clone(), value.clone());
            }
            Ok(dict_value(entries))
        }
        _ => Err(unsupported_operands("+", &a, &b)),
    }
}

fn dict_in(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (container, needle) = magic_arg2(&args, "in")?;
    match (&container, &needle) {
        (Value::Dict(entries), Value::Str(key)) => {
            Ok(Value::Bool(entries.borrow().contains_key(key.as_str())))
        }
        (Value::Dict(_), other) => Err(format!(
            "dict membership test requires a string key, got {}",
            type_name_of_value(other)
        )),
        _ => Err(unsupported_operands("in", &container, &needle)),
    }
}

fn bool_eq(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "==")?;
    match (&a, &b) {
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(a == b)),
        _ => Ok(Value::Bool(false)),
    }
}

fn nil_eq(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let (a, b) = magic_arg2(&args, "==")?;
    Ok(Value::Bool(matches!(
        (&a, &b),
        (Value::Nil, Value::Nil)
    )))
}

// -------------------------- code objects --------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    Eq,
    Gt,
    Lt,
    And,
    Or,
    Not,
    Is,
    In,
    MakeList,
    MakeDict,
    Call,
    Ret,
    GetAttr,
    SetAttr,
    GetItem,
    SetItem,
    LoadVar,
    LoadConst,
    SetGlobal,
    SetLocal,
    SetNonlocal,
    Jump,
    JumpIfFalse,
    PopTop,
    Swap,
    CopyTop,
    Import,
    /// Reserved for a future recoverable-error design.
    Throw,
}

pub fn opcode_name(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::Add => "OP_ADD",
        Opcode::Sub => "OP_SUB",
        Opcode::Mul => "OP_MUL",
        Opcode::Div => "OP_DIV",
        Opcode::Mod => "OP_MOD",
        Opcode::Pow => "OP_POW",
        Opcode::Neg => "OP_NEG",
        Opcode::Eq => "OP_EQ",
        Opcode::Gt => "OP_GT",
        Opcode::Lt => "OP_LT",
        Opcode::And => "OP_AND",
        Opcode::Or => "OP_OR",
        Opcode::Not => "OP_NOT",
        Opcode::Is => "OP_IS",
        Opcode::In => "OP_IN",
        Opcode::MakeList => "MAKE_LIST",
        Opcode::MakeDict => "MAKE_DICT",
        Opcode::Call => "CALL",
        Opcode::Ret => "RET",
        Opcode::GetAttr => "GET_ATTR",
        Opcode::SetAttr => "SET_ATTR",
        Opcode::GetItem => "GET_ITEM",
        Opcode::SetItem => "SET_ITEM",
        Opcode::LoadVar => "LOAD_VAR",
        Opcode::LoadConst => "LOAD_CONST",
        Opcode::SetGlobal => "SET_GLOBAL",
        Opcode::SetLocal => "SET_LOCAL",
        Opcode::SetNonlocal => "SET_NONLOCAL",
        Opcode::Jump => "JUMP",
        Opcode::JumpIfFalse => "JUMP_IF_FALSE",
        Opcode::PopTop => "POP_TOP",
        Opcode::Swap => "SWAP",
        Opcode::CopyTop => "COPY_TOP",
        Opcode::Import => "IMPORT",
        Opcode::Throw => "THROW",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<usize>,
    pub line_start: usize,
    pub line_end: usize,
}

/// Immutable once compiled; the REPL grows the module code object through
/// [`Vm::extend`], never through in-place mutation of a shared one.
#[derive(Debug, Default)]
pub struct CodeObject {
    pub code: Vec<Instruction>,
    pub consts: Vec<Value>,
    pub names: Vec<String>,
    pub lineno_map: Vec<(usize, usize)>,
}

/// Human-readable listing of a code object, function constants included.
pub fn disassemble(code: &CodeObject) -> String {
    let mut output = String::new();
    disassemble_into(code, "<module>", &mut output);
    output
}

fn disassemble_into(code: &CodeObject, label: &str, output: &mut String) {
    output.push_str(&format!(
        "{label}: {} instructions, {} consts, {} names\n",
        code.code.len(),
        code.consts.len(),
        code.names.len()
    ));
    for (ip, instruction) in code.code.iter().enumerate() {
        let name = opcode_name(instruction.opcode);
        let note = match instruction.opcode {
            Opcode::LoadConst => instruction
                .operands
                .first()
                .and_then(|index| code.consts.get(*index))
                .map(|value| format!("  ; {}", format_value(value))),
            Opcode::LoadVar
            | Opcode::SetLocal
            | Opcode::SetNonlocal
            | Opcode::SetGlobal
            | Opcode::GetAttr
            | Opcode::SetAttr
            | Opcode::Import => instruction
                .operands
                .first()
                .and_then(|index| code.names.get(*index))
                .map(|name| format!("  ; {name}")),
            _ => None,
        };
        let operands = instruction
            .operands
            .iter()
            .map(|operand| operand.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        output.push_str(&format!(
            "  {ip:04} {name:<14} {operands}{}\n",
            note.unwrap_or_default()
        ));
    }
    for value in &code.consts {
        if let Value::Function(function) = value {
            output.push('\n');
            disassemble_into(
                &function.code,
                &format!("{}/{}", function.name, function.arity),
                output,
            );
        }
    }
}

// -------------------------- errors --------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub name: String,
    pub line: Option<usize>,
}

#[derive(Debug)]
pub enum VmError {
    StackUnderflow,
    Compile {
        message: String,
        span: Option<Span>,
    },
    Runtime {
        message: String,
        line: Option<usize>,
        stack: Option<Vec<TraceFrame>>,
    },
    ExecutionLimit {
        message: String,
    },
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::StackUnderflow => write!(f, "stack underflow"),
            VmError::Compile { message, span } => {
                if let Some(span) = span {
                    write!(
                        f,
                        "compile error: {message} at {}:{}",
                        span.start_line, span.start_col
                    )
                } else {
                    write!(f, "compile error: {message}")
                }
            }
            VmError::Runtime { message, line, .. } => {
                if let Some(line) = line {
                    write!(f, "runtime error: {message} at line {line}")
                } else {
                    write!(f, "runtime error: {message}")
                }
            }
            VmError::ExecutionLimit { message } => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for VmError {}

fn compile_error(message: String, span: Option<Span>) -> VmError {
    VmError::Compile { message, span }
}

/// Runtime error with a line but no stack trace; the trace is attached by
/// the run loop when it catches the error with the frame state still live.
fn runtime_error_at(message: String, line: Option<usize>) -> VmError {
    VmError::Runtime {
        message,
        line,
        stack: None,
    }
}

// -------------------------- compiler --------------------------

#[derive(Debug, Default)]
struct LoopContext {
    entry: usize,
    breaks: Vec<usize>,
}

#[derive(Debug, Default)]
struct Context {
    code: Vec<Instruction>,
    consts: Vec<Value>,
    names: Vec<String>,
    lineno_map: Vec<(usize, usize)>,
    loops: Vec<LoopContext>,
    declared: std::collections::HashSet<String>,
}

impl Context {
    fn emit(&mut self, opcode: Opcode, operands: Vec<usize>, span: Span) {
        let index = self.code.len();
        if self
            .lineno_map
            .last()
            .map_or(true, |(_, line)| *line != span.start_line)
        {
            self.lineno_map.push((index, span.start_line));
        }
        self.code.push(Instruction {
            opcode,
            operands,
            line_start: span.start_line,
            line_end: span.end_line,
        });
    }

    fn add_name(&mut self, name: &str) -> usize {
        if let Some(index) = self.names.iter().position(|existing| existing == name) {
            return index;
        }
        self.names.push(name.to_string());
        self.names.len() - 1
    }

    fn add_const(&mut self, value: Value) -> usize {
        if const_is_dedupable(&value) {
            if let Some(index) = self
                .consts
                .iter()
                .position(|existing| const_matches(existing, &value))
            {
                return index;
            }
        }
        self.consts.push(value);
        self.consts.len() - 1
    }

    fn patch_jump(&mut self, index: usize, target: usize) {
        if let Some(instruction) = self.code.get_mut(index) {
            if matches!(instruction.opcode, Opcode::Jump | Opcode::JumpIfFalse) {
                if let Some(operand) = instruction.operands.first_mut() {
                    *operand = target;
                }
            }
        }
    }

    fn finalize(self) -> CodeObject {
        CodeObject {
            code: self.code,
            consts: self.consts,
            names: self.names,
            lineno_map: self.lineno_map,
        }
    }
}

/// Equal constants are merged by kind plus displayed value. Only scalar
/// kinds participate: two distinct lambdas can share a display string.
fn const_is_dedupable(value: &Value) -> bool {
    matches!(
        value,
        Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Rational(_) | Value::Str(_)
    )
}

fn const_matches(existing: &Value, candidate: &Value) -> bool {
    const_is_dedupable(existing)
        && TypeTag::of(existing) == TypeTag::of(candidate)
        && format_value(existing) == format_value(candidate)
}

pub struct Compiler {
    contexts: Vec<Context>,
    source_dir: Option<PathBuf>,
    loading: Vec<String>,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            contexts: Vec::new(),
            source_dir: None,
            loading: Vec::new(),
        }
    }

    /// Sets the directory `import` resolves module files against.
    pub fn with_source_dir(mut self, dir: PathBuf) -> Self {
        self.source_dir = Some(dir);
        self
    }

    pub fn compile_module(&mut self, module: &Module) -> Result<CodeObject, VmError> {
        self.compile_toplevel(module, false)
    }

    /// Like [`Compiler::compile_module`], but a trailing expression
    /// statement keeps its value on the stack so the REPL can display it.
    pub fn compile_repl_fragment(&mut self, module: &Module) -> Result<CodeObject, VmError> {
        self.compile_toplevel(module, true)
    }

    fn compile_toplevel(
        &mut self,
        module: &Module,
        keep_last_expr: bool,
    ) -> Result<CodeObject, VmError> {
        self.contexts.clear();
        self.contexts.push(Context::default());
        let result = self.compile_stmts(&module.stmts, keep_last_expr);
        let context = self
            .contexts
            .pop()
            .expect("compiler context stack is never empty");
        result?;
        Ok(context.finalize())
    }

    fn compile_stmts(&mut self, stmts: &[Stmt], keep_last_expr: bool) -> Result<(), VmError> {
        for (index, stmt) in stmts.iter().enumerate() {
            let keep = keep_last_expr && index == stmts.len() - 1;
            match stmt {
                Stmt::Expr { expr } if keep => self.compile_expr(expr)?,
                other => self.compile_stmt(other)?,
            }
        }
        Ok(())
    }

    fn ctx(&mut self) -> &mut Context {
        self.contexts
            .last_mut()
            .expect("compiler context stack is never empty")
    }

    fn at_module_level(&self) -> bool {
        self.contexts.len() == 1
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), VmError> {
        match stmt {
            Stmt::VarDecl { name, value } => {
                self.compile_expr(value)?;
                let index = self.ctx().add_name(&name.name);
                self.ctx().declared.insert(name.name.clone());
                self.ctx().emit(Opcode::SetLocal, vec![index], name.span);
                Ok(())
            }
            Stmt::Assign { name, value } => {
                self.compile_expr(value)?;
                let index = self.ctx().add_name(&name.name);
                // Declaration is always local; plain assignment rebinds the
                // nearest scope that defines the name.
                let opcode = if self.at_module_level() || self.ctx().declared.contains(&name.name) {
                    Opcode::SetLocal
                } else {
                    Opcode::SetNonlocal
                };
                self.ctx().emit(opcode, vec![index], name.span);
                Ok(())
            }
            Stmt::AssignAttr {
                object,
                name,
                value,
            } => {
                self.compile_expr(object)?;
                self.compile_expr(value)?;
                let index = self.ctx().add_name(&name.name);
                self.ctx().emit(Opcode::SetAttr, vec![index], name.span);
                Ok(())
            }
            Stmt::AssignIndex {
                object,
                index,
                value,
            } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                let span = stmt.span();
                self.ctx().emit(Opcode::SetItem, Vec::new(), span);
                Ok(())
            }
            Stmt::Expr { expr } => {
                self.compile_expr(expr)?;
                self.ctx().emit(Opcode::PopTop, Vec::new(), expr.span());
                Ok(())
            }
            Stmt::If {
                condition,
                then_block,
                else_block,
                span,
            } => {
                self.compile_expr(condition)?;
                let jump_if_false = self.ctx().code.len();
                self.ctx()
                    .emit(Opcode::JumpIfFalse, vec![0], condition.span());
                self.compile_stmts(then_block, false)?;
                let jump_over_else = self.ctx().code.len();
                self.ctx().emit(Opcode::Jump, vec![0], *span);
                let else_start = self.ctx().code.len();
                self.ctx().patch_jump(jump_if_false, else_start);
                if let Some(else_block) = else_block {
                    self.compile_stmts(else_block, false)?;
                }
                let after = self.ctx().code.len();
                self.ctx().patch_jump(jump_over_else, after);
                Ok(())
            }
            Stmt::While {
                condition,
                body,
                span,
            } => {
                let entry = self.ctx().code.len();
                self.ctx().loops.push(LoopContext {
                    entry,
                    breaks: Vec::new(),
                });
                self.compile_expr(condition)?;
                let exit_jump = self.ctx().code.len();
                self.ctx()
                    .emit(Opcode::JumpIfFalse, vec![0], condition.span());
                self.compile_stmts(body, false)?;
                self.ctx().emit(Opcode::Jump, vec![entry], *span);
                let after = self.ctx().code.len();
                self.ctx().patch_jump(exit_jump, after);
                let finished = self
                    .ctx()
                    .loops
                    .pop()
                    .expect("loop stack entry pushed above");
                for break_index in finished.breaks {
                    self.ctx().patch_jump(break_index, after);
                }
                Ok(())
            }
            Stmt::Break { span } => {
                let index = self.ctx().code.len();
                self.ctx().emit(Opcode::Jump, vec![0], *span);
                match self.ctx().loops.last_mut() {
                    Some(active) => {
                        active.breaks.push(index);
                        Ok(())
                    }
                    None => Err(compile_error(
                        "break used outside of loop".to_string(),
                        Some(*span),
                    )),
                }
            }
            Stmt::Continue { span } => match self.ctx().loops.last() {
                Some(active) => {
                    let entry = active.entry;
                    self.ctx().emit(Opcode::Jump, vec![entry], *span);
                    Ok(())
                }
                None => Err(compile_error(
                    "continue used outside of loop".to_string(),
                    Some(*span),
                )),
            },
            Stmt::Return { value, span } => {
                if self.at_module_level() {
                    return Err(compile_error(
                        "return used outside of function".to_string(),
                        Some(*span),
                    ));
                }
                match value {
                    Some(expr) => self.compile_expr(expr)?,
                    None => {
                        let index = self.ctx().add_const(Value::Nil);
                        self.ctx().emit(Opcode::LoadConst, vec![index], *span);
                    }
                }
                self.ctx().emit(Opcode::Ret, Vec::new(), *span);
                Ok(())
            }
            Stmt::Import { name, span } => {
                let name_index = self.ctx().add_name(&name.name);
                match self.compile_import(name)? {
                    Some(code) => {
                        let const_index = self.ctx().add_const(Value::Code(Rc::new(code)));
                        self.ctx()
                            .emit(Opcode::Import, vec![name_index, const_index], *span);
                    }
                    None => {
                        self.ctx().emit(Opcode::Import, vec![name_index], *span);
                    }
                }
                let opcode = if self.at_module_level() {
                    Opcode::SetGlobal
                } else {
                    self.ctx().declared.insert(name.name.clone());
                    Opcode::SetLocal
                };
                self.ctx().emit(opcode, vec![name_index], *span);
                Ok(())
            }
            Stmt::FuncDef {
                name,
                params,
                body,
                span,
            } => {
                let code = self.compile_function(params, body, *span)?;
                let function = Value::Function(Rc::new(FunctionValue {
                    name: name.name.clone(),
                    arity: params.len(),
                    code: Rc::new(code),
                }));
                let const_index = self.ctx().add_const(function);
                let name_index = self.ctx().add_name(&name.name);
                self.ctx().emit(Opcode::LoadConst, vec![const_index], *span);
                let opcode = if self.at_module_level() {
                    Opcode::SetGlobal
                } else {
                    self.ctx().declared.insert(name.name.clone());
                    Opcode::SetLocal
                };
                self.ctx().emit(opcode, vec![name_index], name.span);
                Ok(())
            }
        }
    }

    /// Compiles a function body in its own context. The parameter names are
    /// seeded first so the leading name-table entries line up with the
    /// calling convention (arguments are bound by position).
    fn compile_function(
        &mut self,
        params: &[Ident],
        body: &[Stmt],
        span: Span,
    ) -> Result<CodeObject, VmError> {
        let mut context = Context::default();
        for param in params {
            if context.names.contains(&param.name) {
                return Err(compile_error(
                    format!("duplicate parameter: {}", param.name),
                    Some(param.span),
                ));
            }
            context.names.push(param.name.clone());
            context.declared.insert(param.name.clone());
        }
        self.contexts.push(context);
        let result = self.compile_stmts(body, false);
        let mut context = self
            .contexts
            .pop()
            .expect("function context pushed above");
        result?;
        let needs_ret = context
            .code
            .last()
            .map_or(true, |instruction| instruction.opcode != Opcode::Ret);
        if needs_ret {
            let nil_index = context.add_const(Value::Nil);
            context.emit(Opcode::LoadConst, vec![nil_index], span);
            context.emit(Opcode::Ret, Vec::new(), span);
        }
        Ok(context.finalize())
    }

    /// Resolves `import name` at compile time: `name.kv` next to the
    /// importing source compiles to a code-object constant, a missing file
    /// defers to the VM's pre-seeded native modules, and a name already on
    /// the loading stack is an import cycle.
    fn compile_import(&mut self, name: &Ident) -> Result<Option<CodeObject>, VmError> {
        let dir = self
            .source_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let path = dir.join(format!("{}.kv", name.name));
        if !path.exists() {
            return Ok(None);
        }
        if self.loading.iter().any(|loading| *loading == name.name) {
            return Err(compile_error(
                format!("circular import: {}", name.name),
                Some(name.span),
            ));
        }
        let source = std::fs::read_to_string(&path).map_err(|err| {
            compile_error(
                format!("cannot read module {}: {err}", path.display()),
                Some(name.span),
            )
        })?;
        let module = parse_module(&source)
            .map_err(|err| compile_error(err.to_string(), Some(err.span())))?;
        self.loading.push(name.name.clone());
        let saved = std::mem::take(&mut self.contexts);
        self.contexts.push(Context::default());
        let result = self.compile_stmts(&module.stmts, false);
        let context = self
            .contexts
            .pop()
            .expect("submodule context pushed above");
        self.contexts = saved;
        self.loading.pop();
        result?;
        Ok(Some(context.finalize()))
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), VmError> {
        match expr {
            Expr::Int { text, span } => {
                let value = parse_big_int(text, *span)?;
                let index = self.ctx().add_const(int_value(value));
                self.ctx().emit(Opcode::LoadConst, vec![index], *span);
                Ok(())
            }
            Expr::Rational { whole, frac, span } => {
                let value = rational_literal(whole, frac, *span, false)?;
                let index = self.ctx().add_const(value);
                self.ctx().emit(Opcode::LoadConst, vec![index], *span);
                Ok(())
            }
            Expr::Str { value, span } => {
                let index = self.ctx().add_const(str_value(value.clone()));
                self.ctx().emit(Opcode::LoadConst, vec![index], *span);
                Ok(())
            }
            Expr::Bool { value, span } => {
                let index = self.ctx().add_const(Value::Bool(*value));
                self.ctx().emit(Opcode::LoadConst, vec![index], *span);
                Ok(())
            }
            Expr::Nil { span } => {
                let index = self.ctx().add_const(Value::Nil);
                self.ctx().emit(Opcode::LoadConst, vec![index], *span);
                Ok(())
            }
            Expr::Ident(ident) => {
                let index = self.ctx().add_name(&ident.name);
                self.ctx().emit(Opcode::LoadVar, vec![index], ident.span);
                Ok(())
            }
            Expr::Unary { op, operand, span } => {
                // Numeric literals fold so negative constants never rely on
                // a `neg` magic slot (Rational leaves it empty).
                if *op == UnaryOp::Neg {
                    match operand.as_ref() {
                        Expr::Int { text, span: _ } => {
                            let value = parse_big_int(text, *span)?;
                            let index = self.ctx().add_const(int_value(-value));
                            self.ctx().emit(Opcode::LoadConst, vec![index], *span);
                            return Ok(());
                        }
                        Expr::Rational { whole, frac, .. } => {
                            let value = rational_literal(whole, frac, *span, true)?;
                            let index = self.ctx().add_const(value);
                            self.ctx().emit(Opcode::LoadConst, vec![index], *span);
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                self.compile_expr(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                };
                self.ctx().emit(opcode, Vec::new(), *span);
                Ok(())
            }
            Expr::Binary {
                op,
                left,
                right,
                span,
            } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let span = *span;
                match op {
                    BinaryOp::Add => self.ctx().emit(Opcode::Add, Vec::new(), span),
                    BinaryOp::Sub => self.ctx().emit(Opcode::Sub, Vec::new(), span),
                    BinaryOp::Mul => self.ctx().emit(Opcode::Mul, Vec::new(), span),
                    BinaryOp::Div => self.ctx().emit(Opcode::Div, Vec::new(), span),
                    BinaryOp::Mod => self.ctx().emit(Opcode::Mod, Vec::new(), span),
                    BinaryOp::Pow => self.ctx().emit(Opcode::Pow, Vec::new(), span),
                    BinaryOp::And => self.ctx().emit(Opcode::And, Vec::new(), span),
                    BinaryOp::Or => self.ctx().emit(Opcode::Or, Vec::new(), span),
                    BinaryOp::Eq => self.ctx().emit(Opcode::Eq, Vec::new(), span),
                    BinaryOp::Lt => self.ctx().emit(Opcode::Lt, Vec::new(), span),
                    BinaryOp::Gt => self.ctx().emit(Opcode::Gt, Vec::new(), span),
                    BinaryOp::Is => self.ctx().emit(Opcode::Is, Vec::new(), span),
                    BinaryOp::Neq => {
                        self.ctx().emit(Opcode::Eq, Vec::new(), span);
                        self.ctx().emit(Opcode::Not, Vec::new(), span);
                    }
                    // a <= b lowers as not (b < a): reversed comparison.
                    BinaryOp::Lte => {
                        self.ctx().emit(Opcode::Swap, Vec::new(), span);
                        self.ctx().emit(Opcode::Lt, Vec::new(), span);
                        self.ctx().emit(Opcode::Not, Vec::new(), span);
                    }
                    BinaryOp::Gte => {
                        self.ctx().emit(Opcode::Swap, Vec::new(), span);
                        self.ctx().emit(Opcode::Gt, Vec::new(), span);
                        self.ctx().emit(Opcode::Not, Vec::new(), span);
                    }
                    // Membership dispatches on the container, which must be
                    // the left operand at OP_IN.
                    BinaryOp::In => {
                        self.ctx().emit(Opcode::Swap, Vec::new(), span);
                        self.ctx().emit(Opcode::In, Vec::new(), span);
                    }
                    BinaryOp::NotIn => {
                        self.ctx().emit(Opcode::Swap, Vec::new(), span);
                        self.ctx().emit(Opcode::In, Vec::new(), span);
                        self.ctx().emit(Opcode::Not, Vec::new(), span);
                    }
                }
                Ok(())
            }
            Expr::Call { callee, args, span } => {
                // Fixed-arity builtins are checked against the shared
                // registry unless the name is shadowed by a declaration.
                if let Expr::Ident(ident) = callee.as_ref() {
                    let shadowed = self
                        .contexts
                        .last()
                        .is_some_and(|context| context.declared.contains(&ident.name));
                    if !shadowed {
                        if let Some(meta) = kova_syntax::lookup_builtin(&ident.name) {
                            if let Some(arity) = meta.arity {
                                if args.len() != arity {
                                    return Err(compile_error(
                                        format!(
                                            "{} expects {arity} args, got {}",
                                            ident.name,
                                            args.len()
                                        ),
                                        Some(*span),
                                    ));
                                }
                            }
                        }
                    }
                }
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.ctx().emit(Opcode::MakeList, vec![args.len()], *span);
                self.compile_expr(callee)?;
                self.ctx().emit(Opcode::Call, Vec::new(), *span);
                Ok(())
            }
            Expr::GetAttr { object, name } => {
                self.compile_expr(object)?;
                let index = self.ctx().add_name(&name.name);
                self.ctx().emit(Opcode::GetAttr, vec![index], name.span);
                Ok(())
            }
            Expr::Index {
                object,
                index,
                span,
            } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.ctx().emit(Opcode::GetItem, Vec::new(), *span);
                Ok(())
            }
            Expr::List { items, span } => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.ctx().emit(Opcode::MakeList, vec![items.len()], *span);
                Ok(())
            }
            Expr::Dict { entries, span } => {
                for entry in entries {
                    self.compile_expr(&entry.value)?;
                    let key_index = self.ctx().add_const(str_value(entry.key.clone()));
                    self.ctx()
                        .emit(Opcode::LoadConst, vec![key_index], entry.key_span);
                }
                self.ctx()
                    .emit(Opcode::MakeDict, vec![entries.len()], *span);
                Ok(())
            }
            Expr::Lambda { params, body, span } => {
                let code = self.compile_function(params, body, *span)?;
                let function = Value::Function(Rc::new(FunctionValue {
                    name: "<lambda>".to_string(),
                    arity: params.len(),
                    code: Rc::new(code),
                }));
                let index = self.ctx().add_const(function);
                self.ctx().emit(Opcode::LoadConst, vec![index], *span);
                Ok(())
            }
        }
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_big_int(text: &str, span: Span) -> Result<BigInt, VmError> {
    text.parse::<BigInt>()
        .map_err(|_| compile_error(format!("invalid integer literal: {text}"), Some(span)))
}

/// `whole.frac` denotes (whole*10^k + frac) / 10^k in reduced form.
fn rational_literal(whole: &str, frac: &str, span: Span, negative: bool) -> Result<Value, VmError> {
    let whole = parse_big_int(whole, span)?;
    let frac_digits = parse_big_int(frac, span)?;
    let scale = Pow::pow(&BigInt::from(10u32), frac.len());
    let mut numer = whole * &scale + frac_digits;
    if negative {
        numer = -numer;
    }
    reduced_rational(numer, scale).map_err(|message| compile_error(message, Some(span)))
}

// -------------------------- virtual machine --------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    /// Bottom of the call stack; persists across REPL extensions.
    Module,
    Call,
    /// Executing an imported module's top level; its locals become the
    /// module's attribute map when the frame finishes.
    Import,
}

#[derive(Debug, Clone)]
enum FrameCode {
    /// The VM-owned module code object (it can grow via `extend`).
    Module,
    Function(Rc<CodeObject>),
}

#[derive(Debug)]
struct Frame {
    kind: FrameKind,
    locals: IndexMap<String, Value>,
    pc: usize,
    return_to: usize,
    name: String,
    code: FrameCode,
    /// Reserved: a weak-scope frame is transparent to non-local writes.
    /// Every frame the current compiler produces is strong-scope.
    weak_scope: bool,
}

/// Snapshot returned by [`Vm::load`] / [`Vm::extend`] / [`Vm::get_state`].
#[derive(Debug, Clone)]
pub struct VmState {
    pub stack_top: Option<Value>,
    pub locals: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct Profiler {
    pub total_instructions: usize,
    pub op_counts: HashMap<String, usize>,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<Frame>,
    module_code: CodeObject,
    module_name: String,
    builtins: IndexMap<String, Value>,
    loaded_modules: IndexMap<String, Value>,
    magic: MagicTable,
    running: bool,
    instruction_count: usize,
    max_instructions: Option<usize>,
    max_frames: Option<usize>,
    output_buffer: Option<Rc<RefCell<Vec<String>>>>,
    profiler: Option<Profiler>,
}

impl Vm {
    pub fn new() -> Self {
        let mut builtins = IndexMap::new();
        builtins.insert("print".to_string(), native_value("print", builtin_print));
        builtins.insert("input".to_string(), native_value("input", builtin_input));
        builtins.insert(
            "isinstance".to_string(),
            native_value("isinstance", builtin_isinstance),
        );
        let mut loaded_modules = IndexMap::new();
        loaded_modules.insert("math".to_string(), math_module());
        Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            module_code: CodeObject::default(),
            module_name: "main".to_string(),
            builtins,
            loaded_modules,
            magic: default_magic_table(),
            running: false,
            instruction_count: 0,
            max_instructions: None,
            max_frames: Some(1024),
            output_buffer: None,
            profiler: None,
        }
    }

    pub fn with_execution_limit(max_instructions: usize) -> Self {
        let mut vm = Self::new();
        vm.max_instructions = Some(max_instructions);
        vm
    }

    pub fn with_output_capture() -> Self {
        let mut vm = Self::new();
        vm.output_buffer = Some(Rc::new(RefCell::new(Vec::new())));
        vm
    }

    pub fn with_profiler() -> Self {
        let mut vm = Self::new();
        vm.profiler = Some(Profiler::default());
        vm
    }

    pub fn get_output(&self) -> Option<Vec<String>> {
        self.output_buffer
            .as_ref()
            .map(|buffer| buffer.borrow().clone())
    }

    pub fn take_profiler(&mut self) -> Option<Profiler> {
        self.profiler.take()
    }

    /// Replaces a magic slot. The value must be callable: a native function
    /// or a user-defined function of the operator's arity.
    pub fn register_magic(&mut self, tag: TypeTag, op: MagicOp, value: Value) {
        self.magic.set(tag, op, value);
    }

    /// Executes a module's top level to completion and returns the
    /// resulting state snapshot.
    pub fn load(&mut self, name: &str, code: CodeObject) -> Result<VmState, VmError> {
        self.stack.clear();
        self.frames.clear();
        self.instruction_count = 0;
        self.module_code = code;
        self.module_name = name.to_string();
        self.frames.push(Frame {
            kind: FrameKind::Module,
            locals: IndexMap::new(),
            pc: 0,
            return_to: 0,
            name: self.module_name.clone(),
            code: FrameCode::Module,
            weak_scope: false,
        });
        self.run_traced()?;
        Ok(self.get_state())
    }

    /// Appends a freshly compiled fragment to the module code object and
    /// runs the appended range in the persistent module frame: constants
    /// and names are deduplicated into the module tables with every
    /// index-carrying operand rewritten, and jump targets shift by the
    /// append base.
    pub fn extend(&mut self, fragment: CodeObject) -> Result<VmState, VmError> {
        let base = self.module_code.code.len();
        let const_map: Vec<usize> = fragment
            .consts
            .into_iter()
            .map(|value| {
                if const_is_dedupable(&value) {
                    if let Some(index) = self
                        .module_code
                        .consts
                        .iter()
                        .position(|existing| const_matches(existing, &value))
                    {
                        return index;
                    }
                }
                self.module_code.consts.push(value);
                self.module_code.consts.len() - 1
            })
            .collect();
        let name_map: Vec<usize> = fragment
            .names
            .into_iter()
            .map(|name| {
                if let Some(index) = self
                    .module_code
                    .names
                    .iter()
                    .position(|existing| *existing == name)
                {
                    return index;
                }
                self.module_code.names.push(name);
                self.module_code.names.len() - 1
            })
            .collect();
        for mut instruction in fragment.code {
            let remap = |map: &[usize], operand: &mut usize| {
                if let Some(mapped) = map.get(*operand) {
                    *operand = *mapped;
                }
            };
            match instruction.opcode {
                Opcode::LoadConst => {
                    if let Some(operand) = instruction.operands.first_mut() {
                        remap(&const_map, operand);
                    }
                }
                Opcode::LoadVar
                | Opcode::SetLocal
                | Opcode::SetNonlocal
                | Opcode::SetGlobal
                | Opcode::GetAttr
                | Opcode::SetAttr => {
                    if let Some(operand) = instruction.operands.first_mut() {
                        remap(&name_map, operand);
                    }
                }
                Opcode::Import => {
                    if let Some(operand) = instruction.operands.first_mut() {
                        remap(&name_map, operand);
                    }
                    if let Some(operand) = instruction.operands.get_mut(1) {
                        remap(&const_map, operand);
                    }
                }
                Opcode::Jump | Opcode::JumpIfFalse => {
                    if let Some(operand) = instruction.operands.first_mut() {
                        *operand += base;
                    }
                }
                _ => {}
            }
            self.module_code.code.push(instruction);
        }
        for (index, line) in fragment.lineno_map {
            self.module_code.lineno_map.push((index + base, line));
        }

        // A failed earlier turn may have left nested frames or stack
        // residue behind; the module frame alone carries state worth
        // keeping across REPL turns.
        if self.frames.is_empty() {
            self.frames.push(Frame {
                kind: FrameKind::Module,
                locals: IndexMap::new(),
                pc: base,
                return_to: 0,
                name: self.module_name.clone(),
                code: FrameCode::Module,
                weak_scope: false,
            });
        } else {
            self.frames.truncate(1);
            self.frames[0].pc = base;
        }
        self.stack.clear();
        self.run_traced()?;
        Ok(self.get_state())
    }

    /// State snapshot without executing anything.
    pub fn get_state(&self) -> VmState {
        VmState {
            stack_top: self.stack.last().cloned(),
            locals: self
                .frames
                .last()
                .map(|frame| frame.locals.clone())
                .unwrap_or_default(),
        }
    }

    /// Pops and returns the operand-stack top; the REPL uses this to
    /// display a fragment's trailing expression value.
    pub fn take_stack_top(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    fn run_traced(&mut self) -> Result<(), VmError> {
        // Traces attach here, where the frame state is still live, instead
        // of being rebuilt on every instruction.
        match self.run() {
            Err(VmError::Runtime {
                message,
                line,
                stack: None,
            }) => Err(VmError::Runtime {
                message,
                line,
                stack: Some(self.build_stack_trace()),
            }),
            other => other,
        }
    }

    fn run(&mut self) -> Result<(), VmError> {
        self.running = true;
        while self.running {
            if self.frames.is_empty() {
                break;
            }
            self.step()?;
        }
        self.running = false;
        Ok(())
    }

    fn build_stack_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let code = match &frame.code {
                    FrameCode::Module => &self.module_code,
                    FrameCode::Function(code) => code,
                };
                let line = code
                    .code
                    .get(frame.pc.saturating_sub(1))
                    .map(|instruction| instruction.line_start);
                TraceFrame {
                    name: frame.name.clone(),
                    line,
                }
            })
            .collect()
    }

    fn frame_code(&self, frame_index: usize) -> &CodeObject {
        match &self.frames[frame_index].code {
            FrameCode::Module => &self.module_code,
            FrameCode::Function(code) => code,
        }
    }

    /// One fetch–decode–dispatch step, or one frame teardown when the
    /// active frame's program counter has run off the end of its code.
    fn step(&mut self) -> Result<(), VmError> {
        if let Some(max) = self.max_instructions {
            if self.instruction_count >= max {
                return Err(VmError::ExecutionLimit {
                    message: format!("execution limit exceeded: {max} instructions"),
                });
            }
        }
        self.instruction_count += 1;

        let frame_index = self.frames.len() - 1;
        let pc = self.frames[frame_index].pc;
        let instruction = self.frame_code(frame_index).code.get(pc).cloned();
        let Some(instruction) = instruction else {
            return self.finish_frame();
        };
        self.frames[frame_index].pc = pc + 1;

        if let Some(profiler) = self.profiler.as_mut() {
            profiler.total_instructions += 1;
            *profiler
                .op_counts
                .entry(opcode_name(instruction.opcode).to_string())
                .or_insert(0) += 1;
        }

        self.exec(instruction)
    }

    /// Tears down the active frame after it ran off the end of its code.
    /// The module frame never pops: running just stops so `extend` can
    /// continue it later.
    fn finish_frame(&mut self) -> Result<(), VmError> {
        if self.frames.len() == 1 {
            self.running = false;
            return Ok(());
        }
        let frame = self
            .frames
            .pop()
            .expect("finish_frame called with frames present");
        let caller = self
            .frames
            .last_mut()
            .expect("caller frame present below the popped frame");
        caller.pc = frame.return_to;
        match frame.kind {
            FrameKind::Call => {
                // Function bodies normally end in RET; falling off the end
                // still yields Nil to the caller.
                self.stack.push(Value::Nil);
            }
            FrameKind::Import => {
                let code = match frame.code {
                    FrameCode::Function(code) => Some(code),
                    FrameCode::Module => None,
                };
                let module = Value::Module(Rc::new(ModuleValue {
                    name: frame.name.clone(),
                    attrs: RefCell::new(frame.locals),
                    code,
                }));
                self.loaded_modules.insert(frame.name, module.clone());
                self.stack.push(module);
            }
            FrameKind::Module => {}
        }
        Ok(())
    }

    fn pop(&mut self, line: Option<usize>) -> Result<Value, VmError> {
        self.stack
            .pop()
            .ok_or_else(|| runtime_error_at("stack underflow".to_string(), line))
    }

    fn operand(instruction: &Instruction, index: usize) -> Result<usize, VmError> {
        instruction.operands.get(index).copied().ok_or_else(|| {
            runtime_error_at(
                format!(
                    "{} is missing operand {index}",
                    opcode_name(instruction.opcode)
                ),
                Some(instruction.line_start),
            )
        })
    }

    fn frame_name(&self, frame_index: usize, name_index: usize, line: Option<usize>) -> Result<String, VmError> {
        self.frame_code(frame_index)
            .names
            .get(name_index)
            .cloned()
            .ok_or_else(|| runtime_error_at(format!("invalid name index: {name_index}"), line))
    }

    fn exec(&mut self, instruction: Instruction) -> Result<(), VmError> {
        let line = Some(instruction.line_start);
        let frame_index = self.frames.len() - 1;
        match instruction.opcode {
            Opcode::LoadConst => {
                let index = Self::operand(&instruction, 0)?;
                let value = self
                    .frame_code(frame_index)
                    .consts
                    .get(index)
                    .cloned()
                    .ok_or_else(|| {
                        runtime_error_at(format!("invalid constant index: {index}"), line)
                    })?;
                self.stack.push(value);
            }
            Opcode::LoadVar => {
                let index = Self::operand(&instruction, 0)?;
                let name = self.frame_name(frame_index, index, line)?;
                let value = self
                    .frames
                    .iter()
                    .rev()
                    .find_map(|frame| frame.locals.get(&name).cloned())
                    .or_else(|| self.builtins.get(&name).cloned())
                    .ok_or_else(|| {
                        runtime_error_at(format!("undefined variable: {name}"), line)
                    })?;
                self.stack.push(value);
            }
            Opcode::SetLocal => {
                let index = Self::operand(&instruction, 0)?;
                let name = self.frame_name(frame_index, index, line)?;
                let value = self.pop(line)?;
                self.frames[frame_index].locals.insert(name, value);
            }
            Opcode::SetNonlocal => {
                let index = Self::operand(&instruction, 0)?;
                let name = self.frame_name(frame_index, index, line)?;
                let value = self.pop(line)?;
                let target = self.frames[..frame_index]
                    .iter_mut()
                    .rev()
                    .filter(|frame| !frame.weak_scope)
                    .find(|frame| frame.locals.contains_key(&name));
                match target {
                    Some(frame) => {
                        frame.locals.insert(name, value);
                    }
                    None => {
                        return Err(runtime_error_at(
                            format!("no enclosing binding for: {name}"),
                            line,
                        ))
                    }
                }
            }
            Opcode::SetGlobal => {
                let index = Self::operand(&instruction, 0)?;
                let name = self.frame_name(frame_index, index, line)?;
                let value = self.pop(line)?;
                // "Global" is the executing module's top level: the nearest
                // import frame when inside one, the bottom frame otherwise.
                let target = self
                    .frames
                    .iter_mut()
                    .rev()
                    .find(|frame| !matches!(frame.kind, FrameKind::Call))
                    .expect("module frame at the bottom of the call stack");
                target.locals.insert(name, value);
            }
            Opcode::GetAttr => {
                let index = Self::operand(&instruction, 0)?;
                let name = self.frame_name(frame_index, index, line)?;
                let object = self.pop(line)?;
                let value = match &object {
                    Value::Dict(entries) => entries.borrow().get(&name).cloned(),
                    Value::Module(module) => module.attrs.borrow().get(&name).cloned(),
                    _ => None,
                };
                match value {
                    Some(value) => self.stack.push(value),
                    None => {
                        return Err(runtime_error_at(
                            format!(
                                "{} has no attribute: {name}",
                                type_name_of_value(&object)
                            ),
                            line,
                        ))
                    }
                }
            }
            Opcode::SetAttr => {
                let index = Self::operand(&instruction, 0)?;
                let name = self.frame_name(frame_index, index, line)?;
                let value = self.pop(line)?;
                let object = self.pop(line)?;
                match &object {
                    Value::Dict(entries) => {
                        entries.borrow_mut().insert(name, value);
                    }
                    Value::Module(module) => {
                        module.attrs.borrow_mut().insert(name, value);
                    }
                    other => {
                        return Err(runtime_error_at(
                            format!("cannot set attribute on {}", type_name_of_value(other)),
                            line,
                        ))
                    }
                }
            }
            Opcode::GetItem => {
                let index = self.pop(line)?;
                let object = self.pop(line)?;
                let value = self.get_item(&object, &index, line)?;
                self.stack.push(value);
            }
            Opcode::SetItem => {
                let value = self.pop(line)?;
                let index = self.pop(line)?;
                let object = self.pop(line)?;
                self.set_item(&object, &index, value, line)?;
            }
            Opcode::MakeList => {
                let count = Self::operand(&instruction, 0)?;
                if self.stack.len() < count {
                    return Err(runtime_error_at("stack underflow".to_string(), line));
                }
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.pop(line)?);
                }
                items.reverse();
                self.stack.push(list_value(items));
            }
            Opcode::MakeDict => {
                let count = Self::operand(&instruction, 0)?;
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = self.pop(line)?;
                    let value = self.pop(line)?;
                    let key = match key {
                        Value::Str(key) => (*key).clone(),
                        other => {
                            return Err(runtime_error_at(
                                format!(
                                    "dict keys must be strings, got {}",
                                    type_name_of_value(&other)
                                ),
                                line,
                            ))
                        }
                    };
                    pairs.push((key, value));
                }
                pairs.reverse();
                let mut entries = IndexMap::with_capacity(count);
                for (key, value) in pairs {
                    entries.insert(key, value);
                }
                self.stack.push(dict_value(entries));
            }
            Opcode::Call => {
                let callee = self.pop(line)?;
                let args_value = self.pop(line)?;
                let args = match &args_value {
                    Value::List(items) => items.borrow().clone(),
                    other => {
                        return Err(runtime_error_at(
                            format!(
                                "CALL expects an argument list, got {}",
                                type_name_of_value(other)
                            ),
                            line,
                        ))
                    }
                };
                match callee {
                    Value::Native(native) => {
                        let func = native.func;
                        let result = func(self, Value::Nil, args)
                            .map_err(|message| runtime_error_at(message, line))?;
                        self.stack.push(result);
                    }
                    Value::Function(function) => {
                        self.push_function_frame(&function, args, line)?;
                    }
                    other => {
                        return Err(runtime_error_at(
                            format!("{} is not callable", type_name_of_value(&other)),
                            line,
                        ))
                    }
                }
            }
            Opcode::Ret => {
                if self.frames.len() < 2 {
                    return Err(runtime_error_at(
                        "return outside of function".to_string(),
                        line,
                    ));
                }
                let result = self.stack.pop().unwrap_or(Value::Nil);
                let frame = self
                    .frames
                    .pop()
                    .expect("RET checked for a callee frame above");
                let caller = self
                    .frames
                    .last_mut()
                    .expect("caller frame present below the popped frame");
                caller.pc = frame.return_to;
                self.stack.push(result);
            }
            Opcode::Jump => {
                let target = Self::operand(&instruction, 0)?;
                self.jump_to(frame_index, target, line)?;
            }
            Opcode::JumpIfFalse => {
                let target = Self::operand(&instruction, 0)?;
                let condition = self.pop(line)?;
                if !self.truthy(condition, line)? {
                    self.jump_to(frame_index, target, line)?;
                }
            }
            Opcode::PopTop => {
                self.pop(line)?;
            }
            Opcode::Swap => {
                let a = self.pop(line)?;
                let b = self.pop(line)?;
                self.stack.push(a);
                self.stack.push(b);
            }
            Opcode::CopyTop => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| runtime_error_at("stack underflow".to_string(), line))?;
                self.stack.push(top);
            }
            Opcode::Add => self.exec_binary_magic(MagicOp::Add, line)?,
            Opcode::Sub => self.exec_binary_magic(MagicOp::Sub, line)?,
            Opcode::Mul => self.exec_binary_magic(MagicOp::Mul, line)?,
            Opcode::Div => self.exec_binary_magic(MagicOp::Div, line)?,
            Opcode::Mod => self.exec_binary_magic(MagicOp::Mod, line)?,
            Opcode::Pow => self.exec_binary_magic(MagicOp::Pow, line)?,
            Opcode::Eq => self.exec_binary_magic(MagicOp::Eq, line)?,
            Opcode::Lt => self.exec_binary_magic(MagicOp::Lt, line)?,
            Opcode::Gt => self.exec_binary_magic(MagicOp::Gt, line)?,
            Opcode::In => self.exec_binary_magic(MagicOp::In, line)?,
            Opcode::Neg => self.exec_unary_magic(MagicOp::Neg, line)?,
            Opcode::And => {
                let b = self.pop(line)?;
                let a = self.pop(line)?;
                let a = self.truthy(a, line)?;
                let b = self.truthy(b, line)?;
                self.stack.push(Value::Bool(a && b));
            }
            Opcode::Or => {
                let b = self.pop(line)?;
                let a = self.pop(line)?;
                let a = self.truthy(a, line)?;
                let b = self.truthy(b, line)?;
                self.stack.push(Value::Bool(a || b));
            }
            Opcode::Not => {
                let value = self.pop(line)?;
                let value = self.truthy(value, line)?;
                self.stack.push(Value::Bool(!value));
            }
            Opcode::Is => {
                let b = self.pop(line)?;
                let a = self.pop(line)?;
                self.stack.push(Value::Bool(value_is(&a, &b)));
            }
            Opcode::Import => {
                let name_index = Self::operand(&instruction, 0)?;
                let name = self.frame_name(frame_index, name_index, line)?;
                if let Some(module) = self.loaded_modules.get(&name).cloned() {
                    self.stack.push(module);
                } else if instruction.operands.len() > 1 {
                    let const_index = Self::operand(&instruction, 1)?;
                    let code = match self.frame_code(frame_index).consts.get(const_index) {
                        Some(Value::Code(code)) => code.clone(),
                        _ => {
                            return Err(runtime_error_at(
                                format!("invalid module code for import: {name}"),
                                line,
                            ))
                        }
                    };
                    let return_to = self.frames[frame_index].pc;
                    self.frames.push(Frame {
                        kind: FrameKind::Import,
                        locals: IndexMap::new(),
                        pc: 0,
                        return_to,
                        name,
                        code: FrameCode::Function(code),
                        weak_scope: false,
                    });
                } else {
                    return Err(runtime_error_at(format!("unknown module: {name}"), line));
                }
            }
            Opcode::Throw => {
                return Err(runtime_error_at(
                    "throw is reserved and not implemented".to_string(),
                    line,
                ))
            }
        }
        Ok(())
    }

    fn jump_to(&mut self, frame_index: usize, target: usize, line: Option<usize>) -> Result<(), VmError> {
        // Jumping exactly to code length is the fall-off-the-end position.
        if target > self.frame_code(frame_index).code.len() {
            return Err(runtime_error_at(
                format!("jump target out of range: {target}"),
                line,
            ));
        }
        self.frames[frame_index].pc = target;
        Ok(())
    }

    fn push_function_frame(
        &mut self,
        function: &FunctionValue,
        args: Vec<Value>,
        line: Option<usize>,
    ) -> Result<(), VmError> {
        if args.len() != function.arity {
            return Err(runtime_error_at(
                format!(
                    "wrong arity: {} expects {} args, got {}",
                    function.name,
                    function.arity,
                    args.len()
                ),
                line,
            ));
        }
        if let Some(max) = self.max_frames {
            if self.frames.len() >= max {
                return Err(runtime_error_at(
                    format!("stack overflow: maximum call depth {max} exceeded"),
                    line,
                ));
            }
        }
        let params = function.code.names.get(..function.arity).ok_or_else(|| {
            runtime_error_at(
                format!("parameter names missing for: {}", function.name),
                line,
            )
        })?;
        let mut locals = IndexMap::with_capacity(function.arity);
        for (param, value) in params.iter().zip(args) {
            locals.insert(param.clone(), value);
        }
        let return_to = self
            .frames
            .last()
            .map(|frame| frame.pc)
            .unwrap_or_default();
        self.frames.push(Frame {
            kind: FrameKind::Call,
            locals,
            pc: 0,
            return_to,
            name: function.name.clone(),
            code: FrameCode::Function(function.code.clone()),
            weak_scope: false,
        });
        Ok(())
    }

    /// Binary operator dispatch: look up the left operand's magic slot and
    /// call it as `f(self=a, args=[a, b])`. A user-defined slot runs in a
    /// new frame; its RET value lands on the stack as the operator result.
    fn exec_binary_magic(&mut self, op: MagicOp, line: Option<usize>) -> Result<(), VmError> {
        let b = self.pop(line)?;
        let a = self.pop(line)?;
        let slot = self.magic.get(TypeTag::of(&a), op).cloned();
        let args = vec![a.clone(), b];
        self.dispatch_magic(op, slot, a, args, line)
    }

    fn exec_unary_magic(&mut self, op: MagicOp, line: Option<usize>) -> Result<(), VmError> {
        let a = self.pop(line)?;
        let slot = self.magic.get(TypeTag::of(&a), op).cloned();
        let args = vec![a.clone()];
        self.dispatch_magic(op, slot, a, args, line)
    }

    fn dispatch_magic(
        &mut self,
        op: MagicOp,
        slot: Option<Value>,
        receiver: Value,
        args: Vec<Value>,
        line: Option<usize>,
    ) -> Result<(), VmError> {
        match slot {
            None => Err(runtime_error_at(
                format!(
                    "unsupported operator `{}` for {}",
                    op.symbol(),
                    type_name_of_value(&receiver)
                ),
                line,
            )),
            Some(Value::Native(native)) => {
                let func = native.func;
                let result =
                    func(self, receiver, args).map_err(|message| runtime_error_at(message, line))?;
                self.stack.push(result);
                Ok(())
            }
            Some(Value::Function(function)) => self.push_function_frame(&function, args, line),
            Some(other) => Err(runtime_error_at(
                format!(
                    "magic method for `{}` is not callable: {}",
                    op.symbol(),
                    type_name_of_value(&other)
                ),
                line,
            )),
        }
    }

    /// Runs a callable to completion and returns its result, even when it
    /// is a user function (the dispatch loop nests until the new frame
    /// unwinds). Used where an instruction needs a value mid-execution.
    fn call_sync(
        &mut self,
        callee: Value,
        receiver: Value,
        args: Vec<Value>,
        line: Option<usize>,
    ) -> Result<Value, VmError> {
        match callee {
            Value::Native(native) => {
                let func = native.func;
                func(self, receiver, args).map_err(|message| runtime_error_at(message, line))
            }
            Value::Function(function) => {
                let depth = self.frames.len();
                self.push_function_frame(&function, args, line)?;
                while self.frames.len() > depth {
                    self.step()?;
                }
                Ok(self.stack.pop().unwrap_or(Value::Nil))
            }
            other => Err(runtime_error_at(
                format!("{} is not callable", type_name_of_value(&other)),
                line,
            )),
        }
    }

    /// Boolean coercion: Bool is used directly, Nil is false, anything
    /// else consults its `bool` magic slot.
    fn truthy(&mut self, value: Value, line: Option<usize>) -> Result<bool, VmError> {
        match value {
            Value::Bool(value) => Ok(value),
            Value::Nil => Ok(false),
            other => {
                let slot = self.magic.get(TypeTag::of(&other), MagicOp::Bool).cloned();
                match slot {
                    Some(slot) => {
                        let args = vec![other.clone()];
                        let result = self.call_sync(slot, other, args, line)?;
                        match result {
                            Value::Bool(value) => Ok(value),
                            unexpected => Err(runtime_error_at(
                                format!(
                                    "bool magic method must return Bool, got {}",
                                    type_name_of_value(&unexpected)
                                ),
                                line,
                            )),
                        }
                    }
                    None => Err(runtime_error_at(
                        format!("cannot use {} as a condition", type_name_of_value(&other)),
                        line,
                    )),
                }
            }
        }
    }

    fn get_item(
        &mut self,
        object: &Value,
        index: &Value,
        line: Option<usize>,
    ) -> Result<Value, VmError> {
        match (object, index) {
            (Value::List(items), Value::Int(position)) => {
                let items = items.borrow();
                let position = position.to_usize().filter(|p| *p < items.len());
                match position {
                    Some(position) => Ok(items[position].clone()),
                    None => Err(runtime_error_at(
                        format!("list index out of range: {}", format_value(index)),
                        line,
                    )),
                }
            }
            (Value::Str(text), Value::Int(position)) => {
                let bytes = text.as_bytes();
                let position = position.to_usize().filter(|p| *p < bytes.len());
                match position {
                    Some(position) => Ok(str_value(
                        String::from_utf8_lossy(&bytes[position..position + 1]).into_owned(),
                    )),
                    None => Err(runtime_error_at(
                        format!("string index out of range: {}", format_value(index)),
                        line,
                    )),
                }
            }
            (Value::Dict(entries), Value::Str(key)) => entries
                .borrow()
                .get(key.as_str())
                .cloned()
                .ok_or_else(|| runtime_error_at(format!("missing dict key: {key}"), line)),
            (object, index) => Err(runtime_error_at(
                format!(
                    "cannot index {} with {}",
                    type_name_of_value(object),
                    type_name_of_value(index)
                ),
                line,
            )),
        }
    }

    fn set_item(
        &mut self,
        object: &Value,
        index: &Value,
        value: Value,
        line: Option<usize>,
    ) -> Result<(), VmError> {
        match (object, index) {
            (Value::List(items), Value::Int(position)) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                let position = position.to_usize().filter(|p| *p < len);
                match position {
                    Some(position) => {
                        items[position] = value;
                        Ok(())
                    }
                    None => Err(runtime_error_at(
                        format!("list index out of range: {}", format_value(index)),
                        line,
                    )),
                }
            }
            (Value::Dict(entries), Value::Str(key)) => {
                entries.borrow_mut().insert((**key).clone(), value);
                Ok(())
            }
            (object, index) => Err(runtime_error_at(
                format!(
                    "cannot index {} with {}",
                    type_name_of_value(object),
                    type_name_of_value(index)
                ),
                line,
            )),
        }
    }

    fn write_line(&mut self, text: String) {
        match &self.output_buffer {
            Some(buffer) => buffer.borrow_mut().push(text),
            None => println!("{text}"),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

// -------------------------- builtins --------------------------

fn builtin_print(vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let text = args.iter().map(format_value).collect::<Vec<_>>().join("");
    vm.write_line(text);
    Ok(Value::Nil)
}

fn builtin_input(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    let prompt = match args.first() {
        Some(Value::Str(prompt)) => (**prompt).clone(),
        Some(other) => format_value(other),
        None => String::new(),
    };
    print!("{prompt}");
    std::io::stdout()
        .flush()
        .map_err(|err| format!("input: {err}"))?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|err| format!("input: {err}"))?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(str_value(line))
}

fn builtin_isinstance(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    match args.as_slice() {
        [value, Value::Str(kind)] => Ok(Value::Bool(type_name_of_value(value) == kind.as_str())),
        [_, other] => Err(format!(
            "isinstance expects a type name string, got {}",
            type_name_of_value(other)
        )),
        _ => Err(format!("isinstance expects 2 args, got {}", args.len())),
    }
}

fn math_abs(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    match args.first() {
        Some(Value::Int(value)) => Ok(int_value(value.abs())),
        Some(Value::Rational(value)) => Ok(Value::Rational(Rc::new(RationalValue {
            numer: value.numer.abs(),
            denom: value.denom.clone(),
        }))),
        Some(other) => Err(format!(
            "math.abs expects a number, got {}",
            type_name_of_value(other)
        )),
        None => Err("math.abs expects 1 arg, got 0".to_string()),
    }
}

fn math_gcd(_vm: &mut Vm, _self: Value, args: Vec<Value>) -> Result<Value, String> {
    match args.as_slice() {
        [Value::Int(a), Value::Int(b)] => Ok(int_value(a.gcd(b))),
        _ => Err("math.gcd expects two integers".to_string()),
    }
}

/// The native `math` module pre-seeded into `loaded_modules`.
fn math_module() -> Value {
    let mut attrs = IndexMap::new();
    attrs.insert(
        "pi".to_string(),
        Value::Rational(Rc::new(RationalValue {
            numer: BigInt::from(314_159u32),
            denom: BigInt::from(100_000u32),
        })),
    );
    attrs.insert("abs".to_string(), native_value("math.abs", math_abs));
    attrs.insert("gcd".to_string(), native_value("math.gcd", math_gcd));
    Value::Module(Rc::new(ModuleValue {
        name: "math".to_string(),
        attrs: RefCell::new(attrs),
        code: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kova_parser::parse_module;
    use std::path::PathBuf;

    fn compile(source: &str) -> CodeObject {
        let module = parse_module(source).expect("parse module");
        Compiler::new()
            .compile_module(&module)
            .expect("compile module")
    }

    fn compile_err(source: &str) -> VmError {
        let module = parse_module(source).expect("parse module");
        Compiler::new()
            .compile_module(&module)
            .expect_err("expected compile error")
    }

    fn run_capture(source: &str) -> Vec<String> {
        let mut vm = Vm::with_output_capture();
        vm.load("main", compile(source)).expect("run program");
        vm.get_output().expect("output capture enabled")
    }

    fn run_err(source: &str) -> VmError {
        let mut vm = Vm::with_output_capture();
        vm.load("main", compile(source))
            .expect_err("expected runtime error")
    }

    #[test]
    fn prints_integer_addition() {
        assert_eq!(run_capture("print(1 + 2)"), vec!["3"]);
    }

    #[test]
    fn division_is_exact_and_modulus_is_integral() {
        let output = run_capture("var x = 10; var y = 3; print(x / y); print(x % y)");
        assert_eq!(output, vec!["10/3", "1"]);
    }

    #[test]
    fn recursive_factorial() {
        let source =
            "func fact(n) if n == 0 return 1 end; return n * fact(n - 1) end; print(fact(10))";
        assert_eq!(run_capture(source), vec!["3628800"]);
    }

    #[test]
    fn while_loop_builds_string() {
        let source = "var s = \"\"; var i = 0; while i < 3 s = s + \"a\"; i = i + 1 end; print(s)";
        assert_eq!(run_capture(source), vec!["\"aaa\""]);
    }

    #[test]
    fn list_repetition() {
        assert_eq!(
            run_capture("var xs = [1, 2, 3]; print(xs * 2)"),
            vec!["[1, 2, 3, 1, 2, 3]"]
        );
    }

    #[test]
    fn big_integer_power() {
        assert_eq!(
            run_capture("print(2 ^ 100)"),
            vec!["1267650600228229401496703205376"]
        );
    }

    #[test]
    fn compiles_var_decl_as_const_then_store() {
        let code = compile("var i = 0");
        assert!(matches!(
            code.code.first().map(|i| i.opcode),
            Some(Opcode::LoadConst)
        ));
        assert!(matches!(
            code.code.get(1).map(|i| i.opcode),
            Some(Opcode::SetLocal)
        ));
    }

    #[test]
    fn expression_statement_pops_its_value() {
        let code = compile("1 + 2");
        assert_eq!(code.code.last().map(|i| i.opcode), Some(Opcode::PopTop));
    }

    #[test]
    fn call_packages_arguments_before_the_callee() {
        let code = compile("print(1, 2)");
        let opcodes: Vec<_> = code.code.iter().map(|i| i.opcode).collect();
        let make_list = opcodes
            .iter()
            .position(|op| *op == Opcode::MakeList)
            .expect("MAKE_LIST emitted");
        let load_callee = opcodes[make_list..]
            .iter()
            .position(|op| *op == Opcode::LoadVar)
            .expect("callee loaded after MAKE_LIST");
        assert!(matches!(opcodes.last(), Some(Opcode::PopTop)));
        assert_eq!(opcodes[make_list + load_callee + 1], Opcode::Call);
    }

    #[test]
    fn equal_scalar_constants_are_deduplicated() {
        let code = compile("print(7); print(7); print(\"x\"); print(\"x\")");
        let ints = code
            .consts
            .iter()
            .filter(|value| matches!(value, Value::Int(_)))
            .count();
        let strings = code
            .consts
            .iter()
            .filter(|value| matches!(value, Value::Str(_)))
            .count();
        assert_eq!(ints, 1);
        assert_eq!(strings, 1);
    }

    #[test]
    fn jump_targets_stay_in_range() {
        let code = compile(
            "var i = 0\nwhile i < 10\n  if i % 2 == 0\n    i = i + 1\n  else\n    break\n  end\nend",
        );
        for instruction in &code.code {
            if matches!(instruction.opcode, Opcode::Jump | Opcode::JumpIfFalse) {
                assert!(instruction.operands[0] <= code.code.len());
            }
        }
    }

    #[test]
    fn compile_error_on_break_outside_loop() {
        let err = compile_err("break");
        match err {
            VmError::Compile { message, .. } => {
                assert!(message.contains("break used outside of loop"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn compile_error_on_continue_outside_loop() {
        let err = compile_err("continue");
        match err {
            VmError::Compile { message, .. } => {
                assert!(message.contains("continue used outside of loop"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn compile_error_on_builtin_arity_mismatch() {
        let err = compile_err("isinstance(1)");
        match err {
            VmError::Compile { message, .. } => {
                assert!(message.contains("isinstance expects 2 args, got 1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // A shadowing declaration turns the check off.
        let source = "var isinstance = func (a) return a end\nprint(isinstance(1))";
        assert_eq!(run_capture(source), vec!["1"]);
    }

    #[test]
    fn compile_error_on_return_at_module_level() {
        let err = compile_err("return 1");
        match err {
            VmError::Compile { message, .. } => {
                assert!(message.contains("return used outside of function"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn function_bodies_always_end_in_ret() {
        let code = compile("func f(a) a + 1 end");
        let function = code
            .consts
            .iter()
            .find_map(|value| match value {
                Value::Function(function) => Some(function.clone()),
                _ => None,
            })
            .expect("function constant");
        assert_eq!(
            function.code.code.last().map(|i| i.opcode),
            Some(Opcode::Ret)
        );
        // Parameters occupy the leading name-table entries.
        assert_eq!(function.code.names.first().map(String::as_str), Some("a"));
    }

    #[test]
    fn runtime_error_on_undefined_variable() {
        let err = run_err("print(missing)");
        match err {
            VmError::Runtime { message, stack, .. } => {
                assert!(message.contains("undefined variable: missing"));
                assert!(stack.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn runtime_error_on_wrong_arity() {
        let err = run_err("func f(a) return a end; f(1, 2)");
        match err {
            VmError::Runtime { message, .. } => {
                assert!(message.contains("wrong arity"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn runtime_error_on_division_by_zero() {
        let err = run_err("print(1 / 0)");
        match err {
            VmError::Runtime { message, .. } => {
                assert!(message.contains("division by zero"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn runtime_error_on_missing_attribute() {
        let err = run_err("var d = {a: 1}; print(d.b)");
        match err {
            VmError::Runtime { message, .. } => {
                assert!(message.contains("no attribute: b"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn runtime_error_on_unsupported_operator() {
        let err = run_err("print(nil + 1)");
        match err {
            VmError::Runtime { message, .. } => {
                assert!(message.contains("unsupported operator `+` for Nil"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn runtime_error_on_non_bool_condition() {
        let err = run_err("if 1 print(1) end");
        match err {
            VmError::Runtime { message, .. } => {
                assert!(message.contains("cannot use Int as a condition"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn throw_is_reserved() {
        let mut vm = Vm::new();
        let code = CodeObject {
            code: vec![Instruction {
                opcode: Opcode::Throw,
                operands: Vec::new(),
                line_start: 1,
                line_end: 1,
            }],
            consts: Vec::new(),
            names: Vec::new(),
            lineno_map: Vec::new(),
        };
        let err = vm.load("main", code).expect_err("throw is unimplemented");
        match err {
            VmError::Runtime { message, .. } => {
                assert!(message.contains("reserved"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn swap_and_copy_top_rearrange_the_stack() {
        // Hand-built: push 1, push 2, SWAP, COPY_TOP -> stack [2, 1, 1].
        let instruction = |opcode, operands: Vec<usize>| Instruction {
            opcode,
            operands,
            line_start: 1,
            line_end: 1,
        };
        let code = CodeObject {
            code: vec![
                instruction(Opcode::LoadConst, vec![0]),
                instruction(Opcode::LoadConst, vec![1]),
                instruction(Opcode::Swap, Vec::new()),
                instruction(Opcode::CopyTop, Vec::new()),
            ],
            consts: vec![int_value(BigInt::from(1)), int_value(BigInt::from(2))],
            names: Vec::new(),
            lineno_map: Vec::new(),
        };
        let mut vm = Vm::new();
        let state = vm.load("main", code).expect("run");
        assert_eq!(state.stack_top.map(|v| format_value(&v)), Some("1".to_string()));
        assert_eq!(vm.take_stack_top().map(|v| format_value(&v)), Some("1".to_string()));
        assert_eq!(vm.take_stack_top().map(|v| format_value(&v)), Some("1".to_string()));
        assert_eq!(vm.take_stack_top().map(|v| format_value(&v)), Some("2".to_string()));
        assert!(vm.take_stack_top().is_none());
    }

    #[test]
    fn disassembly_lists_functions_and_annotations() {
        let code = compile("func double(n) return n * 2 end\nprint(double(4))");
        let listing = disassemble(&code);
        assert!(listing.starts_with("<module>:"));
        assert!(listing.contains("LOAD_CONST"));
        assert!(listing.contains("; print"));
        assert!(listing.contains("double/1:"));
        assert!(listing.contains("RET"));
    }

    #[test]
    fn runtime_errors_carry_a_stack_trace() {
        let err = run_err("func inner() return 1 / 0 end\nfunc outer() return inner() end\nouter()");
        match err {
            VmError::Runtime { stack, .. } => {
                let stack = stack.expect("stack trace attached");
                let names: Vec<_> = stack.iter().map(|frame| frame.name.as_str()).collect();
                assert_eq!(names, vec!["inner", "outer", "main"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn attribute_assignment_on_dicts() {
        let output = run_capture("var d = {a: 1}; d.b = 2; print(d.a + d.b); print(d)");
        assert_eq!(output, vec!["3", "{a: 1, b: 2}"]);
    }

    #[test]
    fn index_get_and_set() {
        let output = run_capture(
            "var xs = [1, 2, 3]; xs[1] = 20; print(xs[1]); var d = {k: 1}; d[\"k\"] = 5; print(d[\"k\"]); print(\"abc\"[1])",
        );
        assert_eq!(output, vec!["20", "5", "\"b\""]);
    }

    #[test]
    fn equality_and_identity_are_independent() {
        let output = run_capture(
            "var a = [1, 2]; var b = a; var c = [1, 2]\nprint(a is b)\nprint(a is c)\nprint(a == c)\nprint(a is a)",
        );
        assert_eq!(output, vec!["True", "False", "True", "True"]);
    }

    #[test]
    fn eq_is_reflexive_on_every_supported_kind() {
        let output = run_capture(
            "print(nil == nil)\nprint(true == true)\nprint(1 == 1)\nprint(0.5 == 0.5)\nprint(\"s\" == \"s\")\nprint([1] == [1])",
        );
        assert_eq!(
            output,
            vec!["True", "True", "True", "True", "True", "True"]
        );
    }

    #[test]
    fn comparisons_lower_through_reversed_forms() {
        let output = run_capture(
            "print(1 <= 1)\nprint(2 <= 1)\nprint(1 >= 1)\nprint(1 >= 2)\nprint(1 != 2)",
        );
        assert_eq!(output, vec!["True", "False", "True", "False", "True"]);
    }

    #[test]
    fn membership_and_negated_membership() {
        let output = run_capture(
            "print(2 in [1, 2])\nprint(5 in [1, 2])\nprint(\"b\" in \"abc\")\nprint(\"x\" not in \"abc\")\nprint(\"k\" in {k: 1})",
        );
        assert_eq!(output, vec!["True", "False", "True", "True", "True"]);
    }

    #[test]
    fn integer_and_rational_coercion() {
        let output = run_capture(
            "print(1 + 0.5)\nprint(0.5 + 0.5)\nprint(6 / 3)\nprint(4 / 6)\nprint(0.5 < 1)\nprint(2 ^ -2)",
        );
        assert_eq!(output, vec!["3/2", "1", "2", "2/3", "True", "1/4"]);
    }

    #[test]
    fn negative_rational_literals_fold() {
        assert_eq!(run_capture("print(-1.5)"), vec!["-3/2"]);
    }

    #[test]
    fn rational_results_are_reduced() {
        for (numer, denom, expected) in [
            (6, 4, "3/2"),
            (-6, 4, "-3/2"),
            (6, -4, "-3/2"),
            (0, 5, "0"),
            (10, 5, "2"),
        ] {
            let value = reduced_rational(BigInt::from(numer), BigInt::from(denom))
                .expect("non-zero denominator");
            assert_eq!(format_value(&value), expected);
            if let Value::Rational(rational) = &value {
                assert!(rational.denom.is_positive());
                assert!(rational.numer.gcd(&rational.denom).is_one());
            }
        }
    }

    #[test]
    fn string_and_dict_operators() {
        let output = run_capture(
            "print(\"ab\" * 3)\nprint(\"a\" + \"b\")\nprint({a: 1} + {b: 2})\nprint([1] + [2])",
        );
        assert_eq!(
            output,
            vec!["\"ababab\"", "\"ab\"", "{a: 1, b: 2}", "[1, 2]"]
        );
    }

    #[test]
    fn logical_operators_coerce_nil() {
        let output = run_capture("print(true and false)\nprint(nil or true)\nprint(not nil)");
        assert_eq!(output, vec!["False", "True", "True"]);
    }

    #[test]
    fn lambdas_are_first_class() {
        let output = run_capture("var add = func (a, b) return a + b end; print(add(2, 3))");
        assert_eq!(output, vec!["5"]);
    }

    #[test]
    fn nonlocal_assignment_rebinds_the_caller() {
        let source = "var total = 0\nfunc bump() total = total + 1 end\nbump()\nbump()\nprint(total)";
        assert_eq!(run_capture(source), vec!["2"]);
    }

    #[test]
    fn var_declaration_shadows_instead_of_rebinding() {
        let source = "var x = 1\nfunc f() var x = 99\nreturn x end\nf()\nprint(x)";
        assert_eq!(run_capture(source), vec!["1"]);
    }

    #[test]
    fn isinstance_builtin() {
        let output = run_capture(
            "print(isinstance(1, \"Int\"))\nprint(isinstance(0.5, \"Rational\"))\nprint(isinstance(1, \"String\"))",
        );
        assert_eq!(output, vec!["True", "True", "False"]);
    }

    #[test]
    fn operand_stack_is_empty_after_module_execution() {
        let mut vm = Vm::with_output_capture();
        let state = vm
            .load("main", compile("var x = 1; print(x + 1)"))
            .expect("run program");
        assert!(state.stack_top.is_none());
        assert_eq!(format_value(&state.locals["x"]), "1");
    }

    #[test]
    fn execution_limit_is_a_dedicated_error() {
        let mut vm = Vm::with_execution_limit(500);
        let err = vm
            .load("main", compile("while true\nend"))
            .expect_err("expected execution limit");
        assert!(matches!(err, VmError::ExecutionLimit { .. }));
    }

    #[test]
    fn profiler_counts_opcodes() {
        let mut vm = Vm::with_profiler();
        vm.load("main", compile("var x = 1 + 2")).expect("run");
        let profiler = vm.take_profiler().expect("profiler enabled");
        assert!(profiler.total_instructions >= 4);
        assert!(profiler.op_counts.contains_key("OP_ADD"));
    }

    #[test]
    fn extend_preserves_module_bindings_across_turns() {
        let mut vm = Vm::with_output_capture();
        vm.extend(compile("var x = 41")).expect("first turn");
        vm.extend(compile("x = x + 1")).expect("second turn");
        vm.extend(compile("print(x)")).expect("third turn");
        assert_eq!(vm.get_output().expect("capture"), vec!["42"]);
    }

    #[test]
    fn extend_remaps_constants_and_names() {
        let mut vm = Vm::with_output_capture();
        vm.extend(compile("var x = 7")).expect("first turn");
        // The fragment's local const/name indices all start at zero and
        // must be rewritten into the grown module tables.
        vm.extend(compile("var y = 7; print(x + y)"))
            .expect("second turn");
        assert_eq!(vm.get_output().expect("capture"), vec!["14"]);
        let sevens = vm
            .module_code
            .consts
            .iter()
            .filter(|value| format_value(value) == "7")
            .count();
        assert_eq!(sevens, 1);
    }

    #[test]
    fn extend_shifts_jump_targets() {
        let mut vm = Vm::with_output_capture();
        vm.extend(compile("var i = 0")).expect("first turn");
        vm.extend(compile("while i < 3 i = i + 1 end; print(i)"))
            .expect("second turn");
        assert_eq!(vm.get_output().expect("capture"), vec!["3"]);
    }

    #[test]
    fn repl_fragment_keeps_trailing_expression_value() {
        let module = parse_module("1 + 2").expect("parse");
        let fragment = Compiler::new()
            .compile_repl_fragment(&module)
            .expect("compile");
        let mut vm = Vm::new();
        vm.extend(fragment).expect("run fragment");
        let top = vm.take_stack_top().expect("expression value kept");
        assert_eq!(format_value(&top), "3");
        assert!(vm.take_stack_top().is_none());
    }

    #[test]
    fn functions_survive_repl_turns() {
        let mut vm = Vm::with_output_capture();
        vm.extend(compile("func double(n) return n * 2 end"))
            .expect("first turn");
        vm.extend(compile("print(double(21))")).expect("second turn");
        assert_eq!(vm.get_output().expect("capture"), vec!["42"]);
    }

    #[test]
    fn native_math_module_is_preloaded() {
        let output = run_capture("import math; print(math.pi); print(math.gcd(12, 18))");
        assert_eq!(output, vec!["314159/100000", "6"]);
    }

    #[test]
    fn unknown_module_is_a_runtime_error() {
        let err = run_err("import nonexistent");
        match err {
            VmError::Runtime { message, .. } => {
                assert!(message.contains("unknown module: nonexistent"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn temp_module_dir(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut path = std::env::temp_dir();
        path.push(format!("kova_vm_modules_{name}_{nanos}"));
        std::fs::create_dir_all(&path).expect("create temp dir");
        path
    }

    #[test]
    fn imports_a_module_file_and_deduplicates_loads() {
        let dir = temp_module_dir("file_import");
        std::fs::write(dir.join("geometry.kv"), "var sides = 4\nvar loads = 1")
            .expect("write module");
        let source = "import geometry\nimport geometry\nprint(geometry.sides)";
        let module = parse_module(source).expect("parse");
        let code = Compiler::new()
            .with_source_dir(dir.clone())
            .compile_module(&module)
            .expect("compile");
        let mut vm = Vm::with_output_capture();
        vm.load("main", code).expect("run");
        assert_eq!(vm.get_output().expect("capture"), vec!["4"]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn circular_imports_are_a_compile_error() {
        let dir = temp_module_dir("cycle");
        std::fs::write(dir.join("alpha.kv"), "import beta").expect("write alpha");
        std::fs::write(dir.join("beta.kv"), "import alpha").expect("write beta");
        let module = parse_module("import alpha").expect("parse");
        let err = Compiler::new()
            .with_source_dir(dir.clone())
            .compile_module(&module)
            .expect_err("expected compile error");
        match err {
            VmError::Compile { message, .. } => {
                assert!(message.contains("circular import"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn user_function_can_replace_a_magic_slot() {
        let mut vm = Vm::with_output_capture();
        vm.extend(compile("func weird_add(a, b) return 42 end"))
            .expect("define");
        let function = vm.get_state().locals["weird_add"].clone();
        vm.register_magic(TypeTag::Int, MagicOp::Add, function);
        vm.extend(compile("print(1 + 1)")).expect("dispatch");
        assert_eq!(vm.get_output().expect("capture"), vec!["42"]);
    }

    #[test]
    fn user_function_can_fill_an_empty_bool_slot() {
        let mut vm = Vm::with_output_capture();
        vm.extend(compile("func int_truth(n) return n > 0 end"))
            .expect("define");
        let function = vm.get_state().locals["int_truth"].clone();
        vm.register_magic(TypeTag::Int, MagicOp::Bool, function);
        vm.extend(compile("if 5 print(\"positive\") end; if 0 print(\"zero\") end"))
            .expect("run");
        assert_eq!(vm.get_output().expect("capture"), vec!["\"positive\""]);
    }

    #[test]
    fn display_formats_match_the_object_model() {
        let code = compile("func f(a, b) return a end");
        let function = code
            .consts
            .iter()
            .find(|value| matches!(value, Value::Function(_)))
            .expect("function constant");
        assert_eq!(format_value(function), "<Function: name=\"f\", argc=2>");
        assert_eq!(format_value(&Value::Nil), "Nil");
        assert_eq!(format_value(&Value::Bool(true)), "True");
        assert_eq!(
            format_value(&native_value("print", builtin_print)),
            "<NativeFunction: name=\"print\">"
        );
        assert_eq!(format_value(&math_module()), "<Module: name=\"math\">");
    }

    // Seeded xorshift mixing; keeps the generated-program smoke test
    // deterministic without pulling in an rng crate.
    fn next_random(state: &mut u64) -> u64 {
        let mut value = *state ^ 0x9E37_79B9_7F4A_7C15;
        value ^= value >> 12;
        value ^= value << 25;
        value ^= value >> 27;
        *state = value;
        value.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn random_expr(state: &mut u64, depth: usize) -> String {
        if depth == 0 {
            return format!("{}", next_random(state) % 100);
        }
        // Numeric-only grammar: Int and Rational are closed under these
        // operators, so every generated program evaluates cleanly.
        match next_random(state) % 5 {
            0 => format!(
                "({} + {})",
                random_expr(state, depth - 1),
                random_expr(state, depth - 1)
            ),
            1 => format!(
                "({} * {})",
                random_expr(state, depth - 1),
                random_expr(state, depth - 1)
            ),
            2 => format!(
                "({} - {})",
                random_expr(state, depth - 1),
                random_expr(state, depth - 1)
            ),
            3 => format!("({} / 7)", random_expr(state, depth - 1)),
            _ => format!("{}", next_random(state) % 1000),
        }
    }

    #[test]
    fn random_programs_compile_and_run_within_bounds() {
        for seed in 1..30u64 {
            let mut state = seed;
            let mut source = String::new();
            for index in 0..(1 + next_random(&mut state) % 4) {
                source.push_str(&format!(
                    "var v{index} = {}\n",
                    random_expr(&mut state, 3)
                ));
            }
            source.push_str(&format!("print({})\n", random_expr(&mut state, 2)));
            let module = parse_module(&source).expect("generated source parses");
            let code = Compiler::new()
                .compile_module(&module)
                .expect("generated source compiles");
            for instruction in &code.code {
                if matches!(instruction.opcode, Opcode::Jump | Opcode::JumpIfFalse) {
                    assert!(instruction.operands[0] <= code.code.len());
                }
            }
            let mut vm = Vm::with_output_capture();
            vm.max_instructions = Some(200_000);
            vm.load("main", code).expect("generated program runs");
            assert!(vm.get_state().stack_top.is_none());
        }
    }
}
