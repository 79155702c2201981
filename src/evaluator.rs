use crate::environment::{Arity, EnvError, Environment};
use crate::source::Span;
use crate::types::{Lambda, Node, Procedure, Sexpr};
use log::{debug, trace};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;
use thiserror::Error;

/// Default limit on nested `evaluate` calls, low enough for a 2 MiB thread stack.
pub const MAX_EVAL_DEPTH: usize = 400;

thread_local! {
    static EVAL_DEPTH: Cell<usize> = const { Cell::new(0) };
    static EVAL_DEPTH_LIMIT: Cell<usize> = const { Cell::new(MAX_EVAL_DEPTH) };
}

/// Overrides the evaluation depth limit for the current thread.
pub fn set_max_eval_depth(limit: usize) {
    EVAL_DEPTH_LIMIT.with(|l| l.set(limit));
}

pub fn max_eval_depth() -> usize {
    EVAL_DEPTH_LIMIT.with(|l| l.get())
}

// --- Evaluation Error ---
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error(transparent)]
    EnvError(#[from] EnvError), // Unbound symbols and arity mismatches
    #[error("Evaluation Error: Expected a procedure, but got: {0}")]
    NotCallable(Sexpr, Span),
    #[error("Evaluation Error: Malformed special form - {0}")]
    MalformedSpecialForm(String, Span),
    #[error("Evaluation Error: Division by zero")]
    DivisionByZero(Span),
    #[error("Evaluation Error: Index out of range - {0}")]
    IndexOutOfRange(String, Span),
    #[error("Evaluation Error: '{name}' expects {expected}, got {found}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
        span: Span,
    },
    #[error("Evaluation Error: '{0}': math domain error")]
    DomainError(String, Span),
    #[error("Evaluation Error: Maximum evaluation depth exceeded")]
    StackExhausted(Span),
}

impl EvalError {
    pub fn span(&self) -> Span {
        match self {
            EvalError::EnvError(env_err) => env_err.span(),
            EvalError::NotCallable(_, span)
            | EvalError::MalformedSpecialForm(_, span)
            | EvalError::DivisionByZero(span)
            | EvalError::IndexOutOfRange(_, span)
            | EvalError::TypeMismatch { span, .. }
            | EvalError::DomainError(_, span)
            | EvalError::StackExhausted(span) => *span,
        }
    }
}

// Result type alias for convenience
pub type EvalResult<T = Node> = Result<T, EvalError>;

/// Keywords handled by the evaluator rather than by procedure application.
pub fn special_form_identifiers() -> HashSet<String> {
    ["quote", "if", "define", "set", "set!", "lambda"]
        .into_iter()
        .map(String::from)
        .collect()
}

// Tracks nesting of `evaluate` on this thread; released on drop.
struct DepthGuard;

impl DepthGuard {
    fn enter(span: Span) -> EvalResult<DepthGuard> {
        let depth = EVAL_DEPTH.with(|d| d.get());
        if depth >= max_eval_depth() {
            return Err(EvalError::StackExhausted(span));
        }
        EVAL_DEPTH.with(|d| d.set(depth + 1));
        Ok(DepthGuard)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        EVAL_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

// --- Evaluate Function ---

/// Evaluates a given AST Node within the specified environment.
pub fn evaluate(node: &Node, env: &Rc<RefCell<Environment>>) -> EvalResult {
    let _guard = DepthGuard::enter(node.span)?;

    match &node.kind {
        // 1. Symbols: Look up in the environment
        Sexpr::Symbol(name) => Ok(env.borrow().get(name, node.span)?),

        // 2. Lists: special forms or procedure calls
        Sexpr::List(elements) => evaluate_list(elements, env, node.span),

        // 3. Everything else evaluates to itself
        Sexpr::Integer(_)
        | Sexpr::Real(_)
        | Sexpr::Boolean(_)
        | Sexpr::Procedure(_)
        | Sexpr::Void => Ok(node.clone()),
    }
}

fn evaluate_list(elements: &[Node], env: &Rc<RefCell<Environment>>, span: Span) -> EvalResult {
    let Some((first, rest)) = elements.split_first() else {
        return Err(EvalError::MalformedSpecialForm(
            "cannot evaluate the empty list".to_string(),
            span,
        ));
    };
    match &first.kind {
        Sexpr::Symbol(sym_name) => match sym_name.as_str() {
            "quote" => evaluate_quote(rest, span),
            "if" => evaluate_if(rest, env, span),
            "define" => evaluate_define(rest, env, span),
            "set" | "set!" => evaluate_set(rest, env, span),
            "lambda" => evaluate_lambda(rest, env, span),
            _ => evaluate_procedure(first, rest, env, span),
        },
        _ => evaluate_procedure(first, rest, env, span),
    }
}

fn evaluate_procedure(
    operator: &Node,
    operands: &[Node],
    env: &Rc<RefCell<Environment>>,
    span: Span,
) -> EvalResult {
    // 1. Evaluate the operator and check it is callable
    let operator_result = evaluate(operator, env)?;
    let procedure = match operator_result.kind {
        Sexpr::Procedure(proc) => proc,
        other => return Err(EvalError::NotCallable(other, operator.span)),
    };

    // 2. Evaluate the operands, left to right
    let evaluated_args = operands
        .iter()
        .map(|operand| evaluate(operand, env))
        .collect::<EvalResult<Vec<Node>>>()?;

    // 3. Apply the procedure
    apply_procedure(&procedure, evaluated_args, span)
}

/// Calls `procedure` with already evaluated arguments.
pub fn apply_procedure(procedure: &Procedure, args: Vec<Node>, span: Span) -> EvalResult {
    match procedure {
        Procedure::Primitive(func, name) => {
            trace!("calling primitive '{}' with {} argument(s)", name, args.len());
            func(args, span)
        }
        Procedure::Lambda(lambda) => {
            trace!("calling lambda ({})", lambda.params.join(" "));
            let frame = Environment::new_call_frame(
                &lambda.params,
                args,
                lambda.env.clone(),
                "lambda",
                span,
            )?;
            evaluate(&lambda.body, &frame)
        }
    }
}

fn evaluate_quote(operands: &[Node], span: Span) -> EvalResult {
    if let [node] = operands {
        // Quote returns the operand unevaluated.
        Ok(node.clone())
    } else {
        Err(EvalError::MalformedSpecialForm(
            "quote expects exactly one argument".to_string(),
            span, // Use the span of the whole (quote ...) form
        ))
    }
}

fn evaluate_if(operands: &[Node], env: &Rc<RefCell<Environment>>, span: Span) -> EvalResult {
    if let [condition, consequent, alternate] = operands {
        if evaluate(condition, env)?.kind.is_truthy() {
            evaluate(consequent, env)
        } else {
            evaluate(alternate, env)
        }
    } else {
        Err(EvalError::MalformedSpecialForm(
            "if expects a condition, a consequent and an alternate".to_string(),
            span,
        ))
    }
}

// Extracts the symbol name targeted by `define`/`set`.
fn expect_target<'a>(node: &'a Node, form: &str) -> EvalResult<&'a str> {
    match &node.kind {
        Sexpr::Symbol(name) => Ok(name),
        other => Err(EvalError::MalformedSpecialForm(
            format!("{} expects a symbol, got {}", form, other.type_name()),
            node.span,
        )),
    }
}

fn evaluate_define(operands: &[Node], env: &Rc<RefCell<Environment>>, span: Span) -> EvalResult {
    let [target, value_expr] = operands else {
        return Err(EvalError::MalformedSpecialForm(
            "define expects a symbol and a value".to_string(),
            span,
        ));
    };
    let name = expect_target(target, "define")?;
    let value = evaluate(value_expr, env)?;
    if env.borrow().binds_locally(name) {
        debug!("redefine '{}' = {}", name, value);
    } else {
        debug!("define '{}' = {}", name, value);
    }
    env.borrow_mut().define(name.to_string(), value);
    Ok(Node::new_void(span))
}

fn evaluate_set(operands: &[Node], env: &Rc<RefCell<Environment>>, span: Span) -> EvalResult {
    let [target, value_expr] = operands else {
        return Err(EvalError::MalformedSpecialForm(
            "set expects a symbol and a value".to_string(),
            span,
        ));
    };
    let name = expect_target(target, "set")?;
    let value = evaluate(value_expr, env)?;
    let owner = Environment::lookup(env, name, target.span)?;
    debug!("set '{}' = {}", name, value);
    owner.borrow_mut().set(name, value, target.span)?;
    Ok(Node::new_void(span))
}

fn evaluate_lambda(operands: &[Node], env: &Rc<RefCell<Environment>>, span: Span) -> EvalResult {
    let [params, body] = operands else {
        return Err(EvalError::MalformedSpecialForm(
            "lambda expects a parameter list and a body".to_string(),
            span,
        ));
    };
    let Sexpr::List(param_nodes) = &params.kind else {
        return Err(EvalError::MalformedSpecialForm(
            format!("lambda parameters must be a list, got {}", params.kind.type_name()),
            params.span,
        ));
    };
    let params = param_nodes
        .iter()
        .map(|param| match &param.kind {
            Sexpr::Symbol(name) => Ok(name.clone()),
            other => Err(EvalError::MalformedSpecialForm(
                format!("lambda parameter must be a symbol, got {}", other.type_name()),
                param.span,
            )),
        })
        .collect::<EvalResult<Vec<String>>>()?;
    debug!("lambda ({})", params.join(" "));

    let lambda = Lambda {
        params,
        body: body.clone(),
        env: env.clone(),
    };
    Ok(Node::new(Sexpr::Procedure(Procedure::Lambda(Rc::new(lambda))), span))
}

/// Used by primitives to report a wrong argument count.
pub fn arity_error(name: &str, expected: Arity, found: usize, span: Span) -> EvalError {
    EvalError::EnvError(EnvError::ArityMismatch {
        name: name.to_string(),
        expected,
        found,
        span,
    })
}
