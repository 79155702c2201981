use std::cmp::Ordering;

use crate::environment::Arity;
use crate::evaluator::{EvalError, EvalResult, apply_procedure, arity_error};
use crate::source::Span;
use crate::types::{Node, Procedure, Sexpr};

// Checks the number of arguments
macro_rules! check_arity {
    // Variant for minimum number of args
    ($args:expr, min $expected:expr, $span:expr, $name:expr) => {
        if $args.len() < $expected {
            return Err(arity_error($name, Arity::AtLeast($expected), $args.len(), $span));
        }
    };
    ($args:expr, $expected:expr, $span:expr, $name:expr) => {
        if $args.len() != $expected {
            return Err(arity_error($name, Arity::Exactly($expected), $args.len(), $span));
        }
    };
    // Variant for range of args (inclusive)
    ($args:expr, $min:expr, $max:expr, $span:expr, $name:expr) => {
        if !($min..=$max).contains(&$args.len()) {
            return Err(arity_error($name, Arity::Between($min, $max), $args.len(), $span));
        }
    };
}

// --- Argument helpers ---

/// The two numeric kinds. Integer arithmetic stays exact and falls back to
/// reals on overflow.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Integer(i64),
    Real(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Integer(n) => n as f64,
            Number::Real(n) => n,
        }
    }

    fn is_zero(self) -> bool {
        match self {
            Number::Integer(n) => n == 0,
            Number::Real(n) => n == 0.0,
        }
    }

    fn into_node(self, span: Span) -> Node {
        match self {
            Number::Integer(n) => Node::new_integer(n, span),
            Number::Real(n) => Node::new_real(n, span),
        }
    }

    fn compare(self, other: Number) -> Option<Ordering> {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => Some(a.cmp(&b)),
            (Number::Integer(a), Number::Real(b)) => compare_integer_real(a, b),
            (Number::Real(a), Number::Integer(b)) => compare_integer_real(b, a).map(Ordering::reverse),
            (Number::Real(a), Number::Real(b)) => a.partial_cmp(&b),
        }
    }
}

// Exact, without rounding the integer through f64.
fn compare_integer_real(int: i64, real: f64) -> Option<Ordering> {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if real.is_nan() {
        None
    } else if real >= TWO_POW_63 {
        Some(Ordering::Less)
    } else if real < -TWO_POW_63 {
        Some(Ordering::Greater)
    } else {
        // In range, so the truncated real is an exact i64.
        match int.cmp(&(real.trunc() as i64)) {
            Ordering::Equal => 0.0_f64.partial_cmp(&real.fract()),
            unequal => Some(unequal),
        }
    }
}

fn type_mismatch(name: &str, expected: &'static str, node: &Node, span: Span) -> EvalError {
    EvalError::TypeMismatch {
        name: name.to_string(),
        expected,
        found: node.kind.type_name(),
        span, // Use call span for arg type errors
    }
}

fn expect_number(node: &Node, name: &str, span: Span) -> EvalResult<Number> {
    match node.kind {
        Sexpr::Integer(n) => Ok(Number::Integer(n)),
        Sexpr::Real(n) => Ok(Number::Real(n)),
        _ => Err(type_mismatch(name, "a number", node, span)),
    }
}

fn expect_real(node: &Node, name: &str, span: Span) -> EvalResult<f64> {
    expect_number(node, name, span).map(Number::as_f64)
}

fn expect_integer(node: &Node, name: &str, span: Span) -> EvalResult<i64> {
    match node.kind {
        Sexpr::Integer(n) => Ok(n),
        _ => Err(type_mismatch(name, "an integer", node, span)),
    }
}

fn expect_list<'a>(node: &'a Node, name: &str, span: Span) -> EvalResult<&'a [Node]> {
    match &node.kind {
        Sexpr::List(elements) => Ok(elements),
        _ => Err(type_mismatch(name, "a list", node, span)),
    }
}

fn expect_procedure<'a>(node: &'a Node, name: &str, span: Span) -> EvalResult<&'a Procedure> {
    match &node.kind {
        Sexpr::Procedure(procedure) => Ok(procedure),
        _ => Err(type_mismatch(name, "a procedure", node, span)),
    }
}

fn bool_node(b: bool, span: Span) -> EvalResult {
    Ok(Node::new_bool(b, span))
}

// --- Arithmetic ---

fn combine(
    a: Number,
    b: Number,
    int_op: fn(i64, i64) -> Option<i64>,
    real_op: fn(f64, f64) -> f64,
) -> Number {
    match (a, b) {
        (Number::Integer(x), Number::Integer(y)) => int_op(x, y)
            .map_or_else(|| Number::Real(real_op(x as f64, y as f64)), Number::Integer),
        _ => Number::Real(real_op(a.as_f64(), b.as_f64())),
    }
}

fn fold_numbers(
    args: &[Node],
    span: Span,
    start: Number,
    int_op: fn(i64, i64) -> Option<i64>,
    real_op: fn(f64, f64) -> f64,
    operator: &str,
) -> EvalResult {
    let mut acc = start;
    for node in args {
        let num = expect_number(node, operator, span)?;
        acc = combine(acc, num, int_op, real_op);
    }
    Ok(acc.into_node(span))
}

pub fn prim_add(args: Vec<Node>, span: Span) -> EvalResult {
    // (+) -> 0
    // (+ 1 2 3) -> 6
    fold_numbers(&args, span, Number::Integer(0), i64::checked_add, |a, b| a + b, "+")
}

pub fn prim_sub(args: Vec<Node>, span: Span) -> EvalResult {
    // (- x) -> -x
    // (- x y z) -> x - y - z
    check_arity!(args, min 1, span, "-");
    let first = expect_number(&args[0], "-", span)?;
    if args.len() == 1 {
        Ok(combine(Number::Integer(0), first, i64::checked_sub, |a, b| a - b).into_node(span))
    } else {
        fold_numbers(&args[1..], span, first, i64::checked_sub, |a, b| a - b, "-")
    }
}

pub fn prim_mul(args: Vec<Node>, span: Span) -> EvalResult {
    // (*) -> 1
    // (* 1 2 3) -> 6
    fold_numbers(&args, span, Number::Integer(1), i64::checked_mul, |a, b| a * b, "*")
}

pub fn prim_div(args: Vec<Node>, span: Span) -> EvalResult {
    // (/ x) -> 1/x
    // (/ x y z) -> x / y / z, always a real
    check_arity!(args, min 1, span, "/");
    let numbers = args
        .iter()
        .map(|node| expect_number(node, "/", span))
        .collect::<EvalResult<Vec<Number>>>()?;
    let (mut result, divisors) = match numbers.split_first() {
        Some((first, [])) => (1.0, std::slice::from_ref(first)),
        Some((first, rest)) => (first.as_f64(), rest),
        None => return Err(arity_error("/", Arity::AtLeast(1), 0, span)),
    };
    for divisor in divisors {
        if divisor.is_zero() {
            return Err(EvalError::DivisionByZero(span));
        }
        result /= divisor.as_f64();
    }
    Ok(Node::new_real(result, span))
}

fn compare_numbers(
    args: Vec<Node>,
    span: Span,
    accept: fn(Ordering) -> bool,
    operator: &str,
) -> EvalResult {
    // (< n1 n2 ...) -> boolean, checked pairwise
    check_arity!(args, min 2, span, operator);
    let numbers = args
        .iter()
        .map(|node| expect_number(node, operator, span))
        .collect::<EvalResult<Vec<Number>>>()?;
    let result = numbers
        .windows(2)
        .all(|pair| pair[0].compare(pair[1]).is_some_and(accept));
    bool_node(result, span)
}

pub fn prim_equals(args: Vec<Node>, span: Span) -> EvalResult {
    check_arity!(args, min 2, span, "=");
    let result = args
        .windows(2)
        .all(|pair| values_equal(&pair[0].kind, &pair[1].kind));
    bool_node(result, span)
}

pub fn prim_less_than(args: Vec<Node>, span: Span) -> EvalResult {
    compare_numbers(args, span, Ordering::is_lt, "<")
}

pub fn prim_less_than_or_equals(args: Vec<Node>, span: Span) -> EvalResult {
    compare_numbers(args, span, Ordering::is_le, "<=")
}

pub fn prim_greater_than(args: Vec<Node>, span: Span) -> EvalResult {
    compare_numbers(args, span, Ordering::is_gt, ">")
}

pub fn prim_greater_than_or_equals(args: Vec<Node>, span: Span) -> EvalResult {
    compare_numbers(args, span, Ordering::is_ge, ">=")
}

pub fn prim_abs(args: Vec<Node>, span: Span) -> EvalResult {
    check_arity!(args, 1, span, "abs");
    let result = match expect_number(&args[0], "abs", span)? {
        Number::Integer(n) => n
            .checked_abs()
            .map_or_else(|| Number::Real((n as f64).abs()), Number::Integer),
        Number::Real(n) => Number::Real(n.abs()),
    };
    Ok(result.into_node(span))
}

// (min 3 1 2) or (min (list 3 1 2))
fn extreme(args: Vec<Node>, span: Span, wanted: Ordering, name: &str) -> EvalResult {
    check_arity!(args, min 1, span, name);
    let candidates = match &args[..] {
        [single] if matches!(single.kind, Sexpr::List(_)) => expect_list(single, name, span)?,
        _ => &args[..],
    };
    let mut best: Option<Number> = None;
    for node in candidates {
        let num = expect_number(node, name, span)?;
        best = match best {
            Some(current) if current.compare(num) != Some(wanted.reverse()) => Some(current),
            _ => Some(num),
        };
    }
    best.map(|num| num.into_node(span)).ok_or_else(|| {
        EvalError::IndexOutOfRange(format!("{} of an empty list", name), span)
    })
}

pub fn prim_min(args: Vec<Node>, span: Span) -> EvalResult {
    extreme(args, span, Ordering::Less, "min")
}

pub fn prim_max(args: Vec<Node>, span: Span) -> EvalResult {
    extreme(args, span, Ordering::Greater, "max")
}

// Converts an integral real back to an integer when it fits.
fn real_to_integer(name: &str, value: f64, span: Span) -> EvalResult<Number> {
    if !value.is_finite() {
        return Err(EvalError::DomainError(name.to_string(), span));
    }
    if value >= i64::MIN as f64 && value < i64::MAX as f64 {
        Ok(Number::Integer(value as i64))
    } else {
        Ok(Number::Real(value))
    }
}

pub fn prim_round(args: Vec<Node>, span: Span) -> EvalResult {
    // (round x) -> nearest integer, ties to even
    // (round x n) -> x rounded to n decimal digits
    check_arity!(args, 1, 2, span, "round");
    let value = expect_number(&args[0], "round", span)?;
    match (value, args.get(1)) {
        (Number::Integer(n), None) => Ok(Node::new_integer(n, span)),
        (Number::Real(x), None) => Ok(real_to_integer("round", x.round_ties_even(), span)?.into_node(span)),
        (Number::Integer(n), Some(digits)) => {
            let digits = expect_integer(digits, "round", span)?;
            Ok(round_integer(n, digits).into_node(span))
        }
        (Number::Real(x), Some(digits)) => {
            let digits = expect_integer(digits, "round", span)?;
            Ok(Node::new_real(round_real(x, digits), span))
        }
    }
}

// Rounds to a multiple of 10^-digits, ties to even, without leaving integers.
fn round_integer(n: i64, digits: i64) -> Number {
    if digits >= 0 {
        return Number::Integer(n);
    }
    // |n| < 10^19, so coarser rounding always gives zero.
    let step = digits
        .checked_neg()
        .and_then(|e| u32::try_from(e).ok())
        .and_then(|e| 10i64.checked_pow(e));
    let Some(step) = step else {
        return Number::Integer(0);
    };
    let (quotient, remainder) = (n.div_euclid(step), n.rem_euclid(step));
    let round_up = match (2 * remainder).cmp(&step) {
        Ordering::Greater => true,
        Ordering::Equal => quotient % 2 != 0,
        Ordering::Less => false,
    };
    let quotient = if round_up { quotient + 1 } else { quotient };
    quotient
        .checked_mul(step)
        .map_or_else(|| Number::Real(quotient as f64 * step as f64), Number::Integer)
}

fn round_real(x: f64, digits: i64) -> f64 {
    let scale = 10f64.powi(digits.clamp(-400, 400) as i32);
    if scale == 0.0 {
        return 0.0_f64.copysign(x);
    }
    let scaled = x * scale;
    if !scaled.is_finite() {
        // Already exact at this precision
        return x;
    }
    scaled.round_ties_even() / scale
}

pub fn prim_expt(args: Vec<Node>, span: Span) -> EvalResult {
    check_arity!(args, 2, span, "expt");
    let base = expect_number(&args[0], "expt", span)?;
    let exponent = expect_number(&args[1], "expt", span)?;
    if base.is_zero() && exponent.as_f64() < 0.0 {
        return Err(EvalError::DivisionByZero(span));
    }
    if let (Number::Integer(b), Number::Integer(e)) = (base, exponent) {
        if let Some(result) = u32::try_from(e).ok().and_then(|e| b.checked_pow(e)) {
            return Ok(Node::new_integer(result, span));
        }
    }
    let (b, e) = (base.as_f64(), exponent.as_f64());
    checked_real("expt", &[b, e], b.powf(e), span)
}

// --- List Primitives ---

pub fn prim_car(args: Vec<Node>, span: Span) -> EvalResult {
    // (car list) -> first item
    check_arity!(args, 1, span, "car");
    match expect_list(&args[0], "car", span)? {
        [first, ..] => Ok(first.clone()),
        [] => Err(EvalError::IndexOutOfRange(
            "car of an empty list".to_string(),
            span,
        )),
    }
}

pub fn prim_cdr(args: Vec<Node>, span: Span) -> EvalResult {
    // (cdr list) -> rest of list
    check_arity!(args, 1, span, "cdr");
    match expect_list(&args[0], "cdr", span)? {
        [_, rest @ ..] => Ok(Node::new_list(rest.to_vec(), span)),
        [] => Err(EvalError::IndexOutOfRange(
            "cdr of an empty list".to_string(),
            span,
        )),
    }
}

pub fn prim_cons(args: Vec<Node>, span: Span) -> EvalResult {
    // (cons item list) -> (item ..list)
    check_arity!(args, 2, span, "cons");
    let tail = expect_list(&args[1], "cons", span)?;
    let mut elements = Vec::with_capacity(tail.len() + 1);
    elements.push(args[0].clone());
    elements.extend_from_slice(tail);
    Ok(Node::new_list(elements, span))
}

pub fn prim_list(args: Vec<Node>, span: Span) -> EvalResult {
    // (list item1 item2 ...) -> new list containing items
    Ok(Node::new_list(args, span))
}

pub fn prim_length(args: Vec<Node>, span: Span) -> EvalResult {
    check_arity!(args, 1, span, "length");
    let length = expect_list(&args[0], "length", span)?.len();
    Ok(Node::new_integer(length as i64, span))
}

pub fn prim_append(args: Vec<Node>, span: Span) -> EvalResult {
    // (append list1 list2 ...) -> concatenation
    let mut elements = Vec::new();
    for arg in &args {
        elements.extend_from_slice(expect_list(arg, "append", span)?);
    }
    Ok(Node::new_list(elements, span))
}

// --- Predicates ---

/// Structural equality; integers and reals compare by value.
pub fn values_equal(left: &Sexpr, right: &Sexpr) -> bool {
    match (left, right) {
        (Sexpr::Integer(a), Sexpr::Real(b)) | (Sexpr::Real(b), Sexpr::Integer(a)) => {
            compare_integer_real(*a, *b) == Some(Ordering::Equal)
        }
        (Sexpr::List(a), Sexpr::List(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|(x, y)| values_equal(&x.kind, &y.kind))
        }
        _ => left == right,
    }
}

// Lists have no identity of their own, so only empty lists are eq?.
fn values_identical(left: &Sexpr, right: &Sexpr) -> bool {
    match (left, right) {
        (Sexpr::List(a), Sexpr::List(b)) => a.is_empty() && b.is_empty(),
        _ => left == right,
    }
}

macro_rules! is_type {
    ($args:expr, $type:pat, $name:expr, $span:expr) => {{
        check_arity!($args, 1, $span, $name);
        bool_node(matches!($args[0].kind, $type), $span)
    }};
}

pub fn prim_is_null(args: Vec<Node>, span: Span) -> EvalResult {
    // (null? obj) -> #t only for the empty list
    check_arity!(args, 1, span, "null?");
    bool_node(matches!(&args[0].kind, Sexpr::List(l) if l.is_empty()), span)
}

pub fn prim_is_number(args: Vec<Node>, span: Span) -> EvalResult {
    is_type!(args, Sexpr::Integer(_) | Sexpr::Real(_), "number?", span)
}

pub fn prim_is_symbol(args: Vec<Node>, span: Span) -> EvalResult {
    is_type!(args, Sexpr::Symbol(_), "symbol?", span)
}

pub fn prim_is_list(args: Vec<Node>, span: Span) -> EvalResult {
    is_type!(args, Sexpr::List(_), "list?", span)
}

pub fn prim_is_procedure(args: Vec<Node>, span: Span) -> EvalResult {
    is_type!(args, Sexpr::Procedure(_), "procedure?", span)
}

pub fn prim_is_eq(args: Vec<Node>, span: Span) -> EvalResult {
    check_arity!(args, 2, span, "eq?");
    bool_node(values_identical(&args[0].kind, &args[1].kind), span)
}

pub fn prim_is_equal(args: Vec<Node>, span: Span) -> EvalResult {
    check_arity!(args, 2, span, "equal?");
    bool_node(values_equal(&args[0].kind, &args[1].kind), span)
}

pub fn prim_not(args: Vec<Node>, span: Span) -> EvalResult {
    check_arity!(args, 1, span, "not");
    bool_node(!args[0].kind.is_truthy(), span)
}

// --- Control ---

pub fn prim_apply(args: Vec<Node>, span: Span) -> EvalResult {
    // (apply proc (list a b)) -> (proc a b)
    check_arity!(args, 2, span, "apply");
    let procedure = expect_procedure(&args[0], "apply", span)?;
    let call_args = expect_list(&args[1], "apply", span)?.to_vec();
    apply_procedure(procedure, call_args, span)
}

pub fn prim_map(args: Vec<Node>, span: Span) -> EvalResult {
    // (map proc list1 list2 ...) -> results, stopping at the shortest list
    check_arity!(args, min 2, span, "map");
    let procedure = expect_procedure(&args[0], "map", span)?;
    let lists = args[1..]
        .iter()
        .map(|node| expect_list(node, "map", span))
        .collect::<EvalResult<Vec<&[Node]>>>()?;
    let shortest = lists.iter().map(|l| l.len()).min().unwrap_or(0);
    let results = (0..shortest)
        .map(|i| {
            let call_args = lists.iter().map(|l| l[i].clone()).collect();
            apply_procedure(procedure, call_args, span)
        })
        .collect::<EvalResult<Vec<Node>>>()?;
    Ok(Node::new_list(results, span))
}

pub fn prim_begin(mut args: Vec<Node>, span: Span) -> EvalResult {
    // (begin a b c) -> c; arguments were already evaluated in order
    check_arity!(args, min 1, span, "begin");
    args.pop()
        .ok_or_else(|| arity_error("begin", Arity::AtLeast(1), 0, span))
}

pub fn prim_print(args: Vec<Node>, span: Span) -> EvalResult {
    let text: Vec<String> = args.iter().map(|node| node.to_string()).collect();
    println!("{}", text.join(" "));
    Ok(Node::new_void(span))
}

// --- Real-number library ---

// Rejects NaN or infinite results that did not come from NaN or infinite inputs.
fn check_real(name: &str, inputs: &[f64], result: f64, span: Span) -> EvalResult<f64> {
    let domain_failure = (result.is_nan() && !inputs.iter().any(|x| x.is_nan()))
        || (result.is_infinite() && inputs.iter().all(|x| x.is_finite()));
    if domain_failure {
        Err(EvalError::DomainError(name.to_string(), span))
    } else {
        Ok(result)
    }
}

fn checked_real(name: &str, inputs: &[f64], result: f64, span: Span) -> EvalResult {
    check_real(name, inputs, result, span).map(|r| Node::new_real(r, span))
}

macro_rules! real_function {
    ($fn_name:ident, $name:expr, $op:expr) => {
        pub fn $fn_name(args: Vec<Node>, span: Span) -> EvalResult {
            check_arity!(args, 1, span, $name);
            let x = expect_real(&args[0], $name, span)?;
            checked_real($name, &[x], ($op)(x), span)
        }
    };
}

macro_rules! real_function2 {
    ($fn_name:ident, $name:expr, $op:expr) => {
        pub fn $fn_name(args: Vec<Node>, span: Span) -> EvalResult {
            check_arity!(args, 2, span, $name);
            let x = expect_real(&args[0], $name, span)?;
            let y = expect_real(&args[1], $name, span)?;
            checked_real($name, &[x, y], ($op)(x, y), span)
        }
    };
}

real_function!(prim_sin, "sin", f64::sin);
real_function!(prim_cos, "cos", f64::cos);
real_function!(prim_tan, "tan", f64::tan);
real_function!(prim_asin, "asin", f64::asin);
real_function!(prim_acos, "acos", f64::acos);
real_function!(prim_atan, "atan", f64::atan);
real_function!(prim_sinh, "sinh", f64::sinh);
real_function!(prim_cosh, "cosh", f64::cosh);
real_function!(prim_tanh, "tanh", f64::tanh);
real_function!(prim_asinh, "asinh", f64::asinh);
real_function!(prim_acosh, "acosh", f64::acosh);
real_function!(prim_atanh, "atanh", f64::atanh);
real_function!(prim_exp, "exp", f64::exp);
real_function!(prim_expm1, "expm1", f64::exp_m1);
real_function!(prim_log10, "log10", f64::log10);
real_function!(prim_log2, "log2", f64::log2);
real_function!(prim_log1p, "log1p", f64::ln_1p);
real_function!(prim_sqrt, "sqrt", f64::sqrt);
real_function!(prim_cbrt, "cbrt", f64::cbrt);
real_function!(prim_fabs, "fabs", f64::abs);
real_function!(prim_degrees, "degrees", f64::to_degrees);
real_function!(prim_radians, "radians", f64::to_radians);

real_function2!(prim_atan2, "atan2", f64::atan2);
real_function2!(prim_pow, "pow", f64::powf);
real_function2!(prim_fmod, "fmod", |x: f64, y: f64| x % y);
real_function2!(prim_copysign, "copysign", f64::copysign);

pub fn prim_log(args: Vec<Node>, span: Span) -> EvalResult {
    // (log x) -> natural log, (log x base)
    check_arity!(args, 1, 2, span, "log");
    let x = expect_real(&args[0], "log", span)?;
    match args.get(1) {
        None => checked_real("log", &[x], x.ln(), span),
        Some(base) => {
            let base = expect_real(base, "log", span)?;
            if base == 1.0 {
                return Err(EvalError::DivisionByZero(span));
            }
            let numerator = check_real("log", &[x], x.ln(), span)?;
            let denominator = check_real("log", &[base], base.ln(), span)?;
            checked_real("log", &[numerator, denominator], numerator / denominator, span)
        }
    }
}

pub fn prim_hypot(args: Vec<Node>, span: Span) -> EvalResult {
    let values = args
        .iter()
        .map(|node| expect_real(node, "hypot", span))
        .collect::<EvalResult<Vec<f64>>>()?;
    let result = values.iter().fold(0.0, |acc: f64, x| acc.hypot(*x));
    checked_real("hypot", &values, result, span)
}

macro_rules! integral_function {
    ($fn_name:ident, $name:expr, $op:expr) => {
        pub fn $fn_name(args: Vec<Node>, span: Span) -> EvalResult {
            check_arity!(args, 1, span, $name);
            match expect_number(&args[0], $name, span)? {
                Number::Integer(n) => Ok(Node::new_integer(n, span)),
                Number::Real(x) => Ok(real_to_integer($name, ($op)(x), span)?.into_node(span)),
            }
        }
    };
}

integral_function!(prim_ceil, "ceil", f64::ceil);
integral_function!(prim_floor, "floor", f64::floor);
integral_function!(prim_trunc, "trunc", f64::trunc);

pub fn prim_factorial(args: Vec<Node>, span: Span) -> EvalResult {
    check_arity!(args, 1, span, "factorial");
    let n = expect_integer(&args[0], "factorial", span)?;
    if n < 0 {
        return Err(EvalError::DomainError("factorial".to_string(), span));
    }
    let mut acc = Number::Integer(1);
    for i in 2..=n {
        acc = combine(acc, Number::Integer(i), i64::checked_mul, |a, b| a * b);
        if matches!(acc, Number::Real(r) if r.is_infinite()) {
            break;
        }
    }
    Ok(acc.into_node(span))
}

fn gcd_u64(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn u64_to_number(value: u64) -> Number {
    i64::try_from(value).map_or(Number::Real(value as f64), Number::Integer)
}

pub fn prim_gcd(args: Vec<Node>, span: Span) -> EvalResult {
    // (gcd) -> 0
    let mut acc = 0u64;
    for arg in &args {
        acc = gcd_u64(acc, expect_integer(arg, "gcd", span)?.unsigned_abs());
    }
    Ok(u64_to_number(acc).into_node(span))
}

pub fn prim_lcm(args: Vec<Node>, span: Span) -> EvalResult {
    // (lcm) -> 1
    let mut acc = Number::Integer(1);
    for arg in &args {
        let n = expect_integer(arg, "lcm", span)?.unsigned_abs();
        acc = match acc {
            _ if n == 0 => Number::Integer(0),
            Number::Integer(0) => Number::Integer(0),
            Number::Integer(current) => {
                let current = current.unsigned_abs();
                (current / gcd_u64(current, n))
                    .checked_mul(n)
                    .map_or(Number::Real(current as f64 * n as f64), u64_to_number)
            }
            Number::Real(current) => Number::Real(current * n as f64),
        };
    }
    Ok(acc.into_node(span))
}

pub fn prim_isqrt(args: Vec<Node>, span: Span) -> EvalResult {
    check_arity!(args, 1, span, "isqrt");
    let n = expect_integer(&args[0], "isqrt", span)?;
    if n < 0 {
        return Err(EvalError::DomainError("isqrt".to_string(), span));
    }
    // Start from the float estimate and correct it.
    let mut root = (n as f64).sqrt() as i64;
    while root.checked_mul(root).is_none_or(|sq| sq > n) {
        root -= 1;
    }
    while (root + 1).checked_mul(root + 1).is_some_and(|sq| sq <= n) {
        root += 1;
    }
    Ok(Node::new_integer(root, span))
}

macro_rules! real_predicate {
    ($fn_name:ident, $name:expr, $op:expr) => {
        pub fn $fn_name(args: Vec<Node>, span: Span) -> EvalResult {
            check_arity!(args, 1, span, $name);
            let x = expect_real(&args[0], $name, span)?;
            bool_node(($op)(x), span)
        }
    };
}

real_predicate!(prim_isnan, "isnan", f64::is_nan);
real_predicate!(prim_isinf, "isinf", f64::is_infinite);
real_predicate!(prim_isfinite, "isfinite", f64::is_finite);

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{EnvError, Environment};
    use crate::evaluator::evaluate;
    use crate::parser::parse_str;

    fn eval(input: &str) -> EvalResult {
        let env = Environment::new_global_populated();
        let node = parse_str(input).unwrap_or_else(|e| panic!("Parsing '{}' failed: {}", input, e));
        evaluate(&node, &env)
    }

    // Helper to evaluate input string and check result kind (ignores span)
    fn assert_eval_kind(input: &str, expected_kind: Sexpr) {
        match eval(input) {
            Ok(result) => assert_eq!(result.kind, expected_kind, "Input: '{}'", input),
            Err(e) => panic!("Evaluation failed for input '{}': {}", input, e),
        }
    }

    fn assert_eval_prints(input: &str, expected: &str) {
        match eval(input) {
            Ok(result) => assert_eq!(result.to_string(), expected, "Input: '{}'", input),
            Err(e) => panic!("Evaluation failed for input '{}': {}", input, e),
        }
    }

    fn assert_eval_error(input: &str, expected_error_variant: &EvalError) {
        match eval(input) {
            Ok(result) => panic!(
                "Expected evaluation to fail for input '{}', but got: {:?}",
                input, result
            ),
            Err(e) => assert_eq!(
                std::mem::discriminant(&e),
                std::mem::discriminant(expected_error_variant),
                "Input: '{}', Expected error variant like {:?}, got: {:?}",
                input,
                expected_error_variant,
                e
            ),
        }
    }

    fn type_error() -> EvalError {
        EvalError::TypeMismatch {
            name: String::new(),
            expected: "",
            found: "",
            span: Span::default(),
        }
    }

    fn arity() -> EvalError {
        EvalError::EnvError(EnvError::ArityMismatch {
            name: String::new(),
            expected: Arity::Exactly(0),
            found: 0,
            span: Span::default(),
        })
    }

    fn domain() -> EvalError {
        EvalError::DomainError(String::new(), Span::default())
    }

    fn index() -> EvalError {
        EvalError::IndexOutOfRange(String::new(), Span::default())
    }

    #[test]
    fn test_arithmetic() {
        assert_eval_kind("(+ 1 2)", Sexpr::Integer(3));
        assert_eval_kind("(+ 10 20 30 40)", Sexpr::Integer(100));
        assert_eval_kind("(+)", Sexpr::Integer(0));
        assert_eval_kind("(+ 1 2.5)", Sexpr::Real(3.5));
        assert_eval_kind("(- 10 3)", Sexpr::Integer(7));
        assert_eval_kind("(- 5)", Sexpr::Integer(-5));
        assert_eval_kind("(- 10 3 2)", Sexpr::Integer(5));
        assert_eval_kind("(- 1.5)", Sexpr::Real(-1.5));
        assert_eval_kind("(* 2 3 4)", Sexpr::Integer(24));
        assert_eval_kind("(*)", Sexpr::Integer(1));
        assert_eval_kind("(/ 10 4)", Sexpr::Real(2.5));
        assert_eval_kind("(/ 6 3)", Sexpr::Real(2.0));
        assert_eval_kind("(/ 20 2 5)", Sexpr::Real(2.0));
        assert_eval_kind("(/ 5)", Sexpr::Real(0.2));
    }

    #[test]
    fn test_integer_overflow_promotes_to_real() {
        assert_eval_kind(
            "(+ 9223372036854775807 1)",
            Sexpr::Real(9223372036854775808.0),
        );
        assert_eval_kind("(* 4294967296 4294967296)", Sexpr::Real(18446744073709551616.0));
    }

    #[test]
    fn test_division_by_zero() {
        let div_zero = EvalError::DivisionByZero(Span::default());
        assert_eval_error("(/ 1 0)", &div_zero);
        assert_eval_error("(/ 1.5 0.0)", &div_zero);
        assert_eval_error("(/ 0)", &div_zero);
        assert_eval_error("(/ 10 2 0)", &div_zero);
        assert_eval_error("(expt 0 -1)", &div_zero);
    }

    #[test]
    fn test_arithmetic_errors() {
        assert_eval_error("(-)", &arity());
        assert_eval_error("(/)", &arity());
        assert_eval_error("(+ 1 (quote a))", &type_error());
        assert_eval_error("(* 2 (list 1))", &type_error());
    }

    #[test]
    fn test_comparison() {
        assert_eval_kind("(> 3 2)", Sexpr::Boolean(true));
        assert_eval_kind("(< 4 5 6)", Sexpr::Boolean(true));
        assert_eval_kind("(< 5 5 6)", Sexpr::Boolean(false));
        assert_eval_kind("(<= 5 5 6)", Sexpr::Boolean(true));
        assert_eval_kind("(>= 6 5 5)", Sexpr::Boolean(true));
        assert_eval_kind("(> 6 5 5)", Sexpr::Boolean(false));
        assert_eval_kind("(< 1 1.5)", Sexpr::Boolean(true));
        assert_eval_kind("(< 1 nan)", Sexpr::Boolean(false));
        assert_eval_kind("(= 5 5 5)", Sexpr::Boolean(true));
        assert_eval_kind("(= 1 1.0)", Sexpr::Boolean(true));
        assert_eval_kind("(= 5 6)", Sexpr::Boolean(false));
        // Integers are not rounded through f64 when compared with reals
        assert_eval_kind("(= 9007199254740993 9007199254740992.0)", Sexpr::Boolean(false));
        assert_eval_kind("(= 9007199254740992 9007199254740992.0)", Sexpr::Boolean(true));
        assert_eval_kind("(< 9007199254740992.0 9007199254740993)", Sexpr::Boolean(true));
        assert_eval_kind("(> 9223372036854775807 9223372036854775807.0)", Sexpr::Boolean(false));
        assert_eval_kind("(< -2 -1.5 -1)", Sexpr::Boolean(true));
        assert_eval_kind("(> -1 -1.5)", Sexpr::Boolean(true));
        assert_eval_kind("(equal? (list 9007199254740993) (list 9007199254740992.0))", Sexpr::Boolean(false));
        assert_eval_kind("(= (quote a) (quote a))", Sexpr::Boolean(true));

        assert_eval_error("(< 1)", &arity());
        assert_eval_error("(< 1 (quote b))", &type_error());
    }

    #[test]
    fn test_numeric_helpers() {
        assert_eval_kind("(abs -5)", Sexpr::Integer(5));
        assert_eval_kind("(abs -2.5)", Sexpr::Real(2.5));
        assert_eval_kind("(min 3 1 2)", Sexpr::Integer(1));
        assert_eval_kind("(max 3 1 2.5)", Sexpr::Integer(3));
        assert_eval_kind("(max (list 4 9 2))", Sexpr::Integer(9));
        assert_eval_error("(max (list))", &index());
        assert_eval_kind("(round 2.5)", Sexpr::Integer(2));
        assert_eval_kind("(round 3.5)", Sexpr::Integer(4));
        assert_eval_kind("(round -1.7)", Sexpr::Integer(-2));
        assert_eval_kind("(round 7)", Sexpr::Integer(7));
        assert_eval_kind("(round 3.14159 2)", Sexpr::Real(3.14));
        assert_eval_error("(round inf)", &domain());
    }

    #[test]
    fn test_round_to_digits_extremes() {
        // Values already exact at the requested precision come back unchanged
        assert_eval_kind("(round 1e300 20)", Sexpr::Real(1e300));
        assert_eval_kind("(round 3.14 400)", Sexpr::Real(3.14));
        assert_eval_kind("(round 2.5 308)", Sexpr::Real(2.5));
        assert_eval_kind("(round 1.5 309)", Sexpr::Real(1.5));
        assert_eval_kind("(round 1.5 -400)", Sexpr::Real(0.0));
        assert_eval_kind("(round 5 -400)", Sexpr::Integer(0));
        assert_eval_kind("(round 7 3)", Sexpr::Integer(7));
        assert_eval_kind("(round 1234 -2)", Sexpr::Integer(1200));
        assert_eval_kind("(round 1250 -2)", Sexpr::Integer(1200));
        assert_eval_kind("(round 1350 -2)", Sexpr::Integer(1400));
        assert_eval_kind("(round -1250 -2)", Sexpr::Integer(-1200));
        assert_eval_kind("(round -1251 -2)", Sexpr::Integer(-1300));
        assert_eval_kind(
            "(round 9223372036854775807 -1)",
            Sexpr::Real(9223372036854775810.0),
        );
        assert_eval_kind("(expt 2 10)", Sexpr::Integer(1024));
        assert_eval_kind("(expt 2 -1)", Sexpr::Real(0.5));
        assert_eval_kind("(expt 2.0 3)", Sexpr::Real(8.0));
        assert_eval_kind("(expt 2 100)", Sexpr::Real(2f64.powi(100)));
    }

    #[test]
    fn test_list_primitives() {
        assert_eval_kind("(car (list 1 2 3))", Sexpr::Integer(1));
        assert_eval_prints("(cdr (list 1 2 3))", "(2 3)");
        assert_eval_prints("(cdr (list 1))", "()");
        assert_eval_prints("(cons 0 (list 1 2))", "(0 1 2)");
        assert_eval_prints("(cons (list 1) (list))", "((1))");
        assert_eval_prints("(list)", "()");
        assert_eval_prints("(list 1 (list 2.5 (quote x)))", "(1 (2.5 x))");
        assert_eval_kind("(length (list 1 2 3))", Sexpr::Integer(3));
        assert_eval_kind("(length (list))", Sexpr::Integer(0));
        assert_eval_prints("(append (list 1 2) (list) (list 3))", "(1 2 3)");
        assert_eval_prints("(append)", "()");
    }

    #[test]
    fn test_list_primitive_errors() {
        assert_eval_error("(car (list))", &index());
        assert_eval_error("(cdr (list))", &index());
        assert_eval_error("(car 1)", &type_error());
        assert_eval_error("(cons 1 2)", &type_error());
        assert_eval_error("(length (quote a))", &type_error());
        assert_eval_error("(car (list 1) (list 2))", &arity());
    }

    #[test]
    fn test_predicates() {
        assert_eval_kind("(null? (list))", Sexpr::Boolean(true));
        assert_eval_kind("(null? (list 1))", Sexpr::Boolean(false));
        assert_eval_kind("(null? 0)", Sexpr::Boolean(false));
        assert_eval_kind("(number? 1)", Sexpr::Boolean(true));
        assert_eval_kind("(number? 1.5)", Sexpr::Boolean(true));
        assert_eval_kind("(number? (quote a))", Sexpr::Boolean(false));
        assert_eval_kind("(symbol? (quote a))", Sexpr::Boolean(true));
        assert_eval_kind("(symbol? 1)", Sexpr::Boolean(false));
        assert_eval_kind("(list? (list))", Sexpr::Boolean(true));
        assert_eval_kind("(list? 1)", Sexpr::Boolean(false));
        assert_eval_kind("(procedure? car)", Sexpr::Boolean(true));
        assert_eval_kind("(procedure? (lambda (x) x))", Sexpr::Boolean(true));
        assert_eval_kind("(procedure? (quote car))", Sexpr::Boolean(false));
        assert_eval_kind("(not (= 1 2))", Sexpr::Boolean(true));
        assert_eval_kind("(not 0)", Sexpr::Boolean(false));
    }

    #[test]
    fn test_equality_predicates() {
        assert_eval_kind("(eq? (quote a) (quote a))", Sexpr::Boolean(true));
        assert_eval_kind("(eq? 1 1)", Sexpr::Boolean(true));
        assert_eval_kind("(eq? 1 1.0)", Sexpr::Boolean(false));
        assert_eval_kind("(eq? (list) (list))", Sexpr::Boolean(true));
        assert_eval_kind("(eq? (list 1) (list 1))", Sexpr::Boolean(false));
        assert_eval_kind("(eq? car car)", Sexpr::Boolean(true));
        assert_eval_kind("(equal? (list 1 (list 2)) (list 1 (list 2)))", Sexpr::Boolean(true));
        assert_eval_kind("(equal? (list 1 2) (list 1 2.0))", Sexpr::Boolean(true));
        assert_eval_kind("(equal? (list 1 2) (list 1))", Sexpr::Boolean(false));
    }

    #[test]
    fn test_control_primitives() {
        assert_eval_kind("(apply + (list 1 2 3))", Sexpr::Integer(6));
        assert_eval_kind("(apply max (list 4 8 2))", Sexpr::Integer(8));
        assert_eval_prints("(map abs (list -1 2 -3))", "(1 2 3)");
        assert_eval_prints("(map + (list 1 2 3) (list 10 20))", "(11 22)");
        assert_eval_prints("(map car (list))", "()");
        assert_eval_kind("(begin 1 2 3)", Sexpr::Integer(3));
        assert_eval_kind("(print 1 (list 2 3))", Sexpr::Void);

        assert_eval_error("(apply 1 (list 1))", &type_error());
        assert_eval_error("(apply + 1)", &type_error());
        assert_eval_error("(map car)", &arity());
        assert_eval_error("(begin)", &arity());
        assert_eval_error("(map car (list (list)))", &index());
    }

    #[test]
    fn test_math_library() {
        assert_eval_kind("(sqrt 16)", Sexpr::Real(4.0));
        assert_eval_kind("(sin 0)", Sexpr::Real(0.0));
        assert_eval_kind("(cos 0)", Sexpr::Real(1.0));
        assert_eval_kind("(exp 0)", Sexpr::Real(1.0));
        assert_eval_kind("(log 1)", Sexpr::Real(0.0));
        assert_eval_kind("(log 8 2)", Sexpr::Real(3.0));
        assert_eval_kind("(log10 1000)", Sexpr::Real(3.0));
        assert_eval_kind("(pow 2 3)", Sexpr::Real(8.0));
        assert_eval_kind("(hypot 3 4)", Sexpr::Real(5.0));
        assert_eval_kind("(fmod 7 3)", Sexpr::Real(1.0));
        assert_eval_kind("(degrees pi)", Sexpr::Real(180.0));
        assert_eval_kind("(floor 2.7)", Sexpr::Integer(2));
        assert_eval_kind("(ceil 2.1)", Sexpr::Integer(3));
        assert_eval_kind("(trunc -2.7)", Sexpr::Integer(-2));
        assert_eval_kind("(floor 5)", Sexpr::Integer(5));
        assert_eval_kind("(factorial 5)", Sexpr::Integer(120));
        assert_eval_kind("(factorial 0)", Sexpr::Integer(1));
        // Stops multiplying once the product has overflowed every representation
        assert_eval_kind("(factorial 100000000000)", Sexpr::Real(f64::INFINITY));
        assert_eval_kind("(gcd 12 18)", Sexpr::Integer(6));
        assert_eval_kind("(gcd)", Sexpr::Integer(0));
        assert_eval_kind("(lcm 4 6)", Sexpr::Integer(12));
        assert_eval_kind("(isqrt 17)", Sexpr::Integer(4));
        assert_eval_kind("(isqrt 16)", Sexpr::Integer(4));
        assert_eval_kind("(isnan nan)", Sexpr::Boolean(true));
        assert_eval_kind("(isinf inf)", Sexpr::Boolean(true));
        assert_eval_kind("(isfinite 1)", Sexpr::Boolean(true));
        assert_eval_kind("(* 2 pi)", Sexpr::Real(std::f64::consts::TAU));
    }

    #[test]
    fn test_math_domain_errors() {
        assert_eval_error("(sqrt -1)", &domain());
        assert_eval_error("(log 0)", &domain());
        assert_eval_error("(log -1)", &domain());
        assert_eval_error("(asin 2)", &domain());
        assert_eval_error("(exp 1000)", &domain());
        assert_eval_error("(fmod 1 0)", &domain());
        assert_eval_error("(factorial -1)", &domain());
        assert_eval_error("(isqrt -4)", &domain());
        assert_eval_error("(floor inf)", &domain());
        assert_eval_error("(factorial 2.5)", &type_error());
        assert_eval_error("(sqrt (quote x))", &type_error());
        assert_eval_error("(log 10 1)", &EvalError::DivisionByZero(Span::default()));
        // NaN and infinities pass through when they were given
        assert_eval_kind("(sqrt inf)", Sexpr::Real(f64::INFINITY));
    }
}
