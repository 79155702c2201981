use crate::environment::Environment;
use crate::{evaluator::EvalResult, source::Span};
use std::cell::RefCell;
use std::fmt; // For custom display formatting
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: Sexpr, // The actual S-expression data
    pub span: Span,  // The source span it covers
}

impl Node {
    pub fn new(kind: Sexpr, span: Span) -> Self {
        Node { kind, span }
    }

    pub fn new_integer(n: i64, span: Span) -> Self {
        Node::new(Sexpr::Integer(n), span)
    }

    pub fn new_real(n: f64, span: Span) -> Self {
        Node::new(Sexpr::Real(n), span)
    }

    pub fn new_symbol(name: impl Into<String>, span: Span) -> Self {
        Node::new(Sexpr::Symbol(name.into()), span)
    }

    pub fn new_bool(b: bool, span: Span) -> Self {
        Node::new(Sexpr::Boolean(b), span)
    }

    pub fn new_list(elements: Vec<Node>, span: Span) -> Self {
        Node::new(Sexpr::List(elements), span)
    }

    pub fn new_primitive(func: PrimitiveFunc, name: &str, span: Span) -> Self {
        Node::new(
            Sexpr::Procedure(Procedure::Primitive(func, name.to_string())),
            span,
        )
    }

    pub fn new_void(span: Span) -> Self {
        Node::new(Sexpr::Void, span)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Delegate to Sexpr's Display implementation
        write!(f, "{}", self.kind)
    }
}

/// A value of the language. The reader only ever produces `Integer`, `Real`,
/// `Symbol` and `List`; the remaining variants only arise during evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Sexpr {
    Integer(i64),    // e.g., 42, -7
    Real(f64),       // e.g., 2.5, 1e-3, inf
    Symbol(String),  // e.g., +, variable-name, quote
    List(Vec<Node>), // e.g., (+ 1 2), (define x 10), ()
    Boolean(bool),   // Results of comparisons and predicates
    Procedure(Procedure),
    Void, // Result of define, set and print
}

impl Sexpr {
    pub fn type_name(&self) -> &'static str {
        match self {
            Sexpr::Integer(_) => "integer",
            Sexpr::Real(_) => "real",
            Sexpr::Symbol(_) => "symbol",
            Sexpr::List(_) => "list",
            Sexpr::Boolean(_) => "boolean",
            Sexpr::Procedure(_) => "procedure",
            Sexpr::Void => "void",
        }
    }

    /// Only `#f` and the no-value sentinel are false. Zero and `()` are true.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Sexpr::Boolean(false) | Sexpr::Void)
    }
}

/// Reals always print with a decimal point or an exponent-free special
/// spelling, so they read back as reals rather than integers.
fn write_real(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.is_finite() && n.fract() == 0.0 {
        write!(f, "{}.0", n)
    } else {
        write!(f, "{}", n)
    }
}

// Implement Display trait for printing values back as source text
impl fmt::Display for Sexpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexpr::Integer(n) => write!(f, "{}", n),
            Sexpr::Real(n) => write_real(f, *n),
            Sexpr::Symbol(s) => write!(f, "{}", s),
            Sexpr::List(list) => {
                write!(f, "(")?;
                let mut first = true;
                for expr in list {
                    if !first {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", expr)?;
                    first = false;
                }
                write!(f, ")")
            }
            Sexpr::Boolean(b) => write!(f, "{}", if *b { "#t" } else { "#f" }),
            Sexpr::Procedure(procedure) => match procedure {
                Procedure::Primitive(_, name) => write!(f, "#<primitive:{}>", name),
                Procedure::Lambda(lambda) => {
                    write!(f, "#<lambda:({})>", lambda.params.join(" "))
                }
            },
            Sexpr::Void => Ok(()),
        }
    }
}

pub type PrimitiveFunc = fn(Vec<Node>, Span) -> EvalResult;

/// A closure created by `lambda`.
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Node,
    pub env: Rc<RefCell<Environment>>,
}

#[derive(Clone)] // Need Clone for Sexpr::Procedure
pub enum Procedure {
    Primitive(PrimitiveFunc, String), // The function pointer and its name (for display/debug)
    Lambda(Rc<Lambda>),
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The captured environment may contain this very procedure, so it is
        // never printed.
        match self {
            Procedure::Primitive(_, name) => write!(f, "Primitive({})", name),
            Procedure::Lambda(lambda) => write!(f, "Lambda({:?})", lambda.params),
        }
    }
}

// Primitives compare by name, closures by identity.
impl PartialEq for Procedure {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Procedure::Primitive(_, n1), Procedure::Primitive(_, n2)) => n1 == n2,
            (Procedure::Lambda(l1), Procedure::Lambda(l2)) => Rc::ptr_eq(l1, l2),
            _ => false,
        }
    }
}
