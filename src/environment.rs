use log::trace;
use thiserror::Error;

use crate::primitives;
use crate::source::Span;
use crate::types::{Node, PrimitiveFunc};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

/// How many arguments a procedure accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    pub fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exactly(n) => count == n,
            Arity::AtLeast(n) => count >= n,
            Arity::Between(min, max) => (min..=max).contains(&count),
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(n) => write!(f, "exactly {}", n),
            Arity::AtLeast(n) => write!(f, "at least {}", n),
            Arity::Between(min, max) => write!(f, "between {} and {}", min, max),
        }
    }
}

// --- Environment Error ---
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    #[error("Unbound symbol: '{0}'")]
    UnboundSymbol(String, Span), // Symbol name, span where lookup happened
    #[error("'{name}' expects {expected} arguments, got {found}")]
    ArityMismatch {
        name: String,
        expected: Arity,
        found: usize,
        span: Span,
    },
}

impl EnvError {
    pub fn span(&self) -> Span {
        match self {
            EnvError::UnboundSymbol(_, span) => *span,
            EnvError::ArityMismatch { span, .. } => *span,
        }
    }
}

// --- Environment Definition ---

#[derive(Debug)]
pub struct Environment {
    // Rc<RefCell<...>> gives shared ownership for closures and mutation for `set`.
    outer: Option<Rc<RefCell<Environment>>>,
    bindings: HashMap<String, Node>, // Maps symbol names to values
}

impl Environment {
    /// Creates a new, top-level (global) environment.
    pub fn new() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Environment {
            outer: None,
            bindings: HashMap::new(),
        }))
    }

    /// Creates the root environment holding every built-in procedure and constant.
    pub fn new_global_populated() -> Rc<RefCell<Environment>> {
        let env_ptr = Environment::new(); // Create empty global env
        {
            // Borrow mutably only inside this scope
            let mut env = env_ptr.borrow_mut();

            // --- Arithmetic & Comparison ---
            env.add_primitive("+", primitives::prim_add);
            env.add_primitive("-", primitives::prim_sub);
            env.add_primitive("*", primitives::prim_mul);
            env.add_primitive("/", primitives::prim_div);
            env.add_primitive("=", primitives::prim_equals);
            env.add_primitive("<", primitives::prim_less_than);
            env.add_primitive("<=", primitives::prim_less_than_or_equals);
            env.add_primitive(">", primitives::prim_greater_than);
            env.add_primitive(">=", primitives::prim_greater_than_or_equals);
            env.add_primitive("abs", primitives::prim_abs);
            env.add_primitive("min", primitives::prim_min);
            env.add_primitive("max", primitives::prim_max);
            env.add_primitive("round", primitives::prim_round);
            env.add_primitive("expt", primitives::prim_expt);

            // --- List Primitives ---
            env.add_primitive("car", primitives::prim_car);
            env.add_primitive("cdr", primitives::prim_cdr);
            env.add_primitive("cons", primitives::prim_cons);
            env.add_primitive("list", primitives::prim_list);
            env.add_primitive("length", primitives::prim_length);
            env.add_primitive("append", primitives::prim_append);

            // --- Predicates ---
            env.add_primitive("null?", primitives::prim_is_null);
            env.add_primitive("number?", primitives::prim_is_number);
            env.add_primitive("symbol?", primitives::prim_is_symbol);
            env.add_primitive("list?", primitives::prim_is_list);
            env.add_primitive("procedure?", primitives::prim_is_procedure);
            env.add_primitive("eq?", primitives::prim_is_eq);
            env.add_primitive("equal?", primitives::prim_is_equal);
            env.add_primitive("not", primitives::prim_not);

            // --- Control ---
            env.add_primitive("apply", primitives::prim_apply);
            env.add_primitive("map", primitives::prim_map);
            env.add_primitive("begin", primitives::prim_begin);
            env.add_primitive("print", primitives::prim_print);

            // --- Real-number library ---
            env.add_primitive("sin", primitives::prim_sin);
            env.add_primitive("cos", primitives::prim_cos);
            env.add_primitive("tan", primitives::prim_tan);
            env.add_primitive("asin", primitives::prim_asin);
            env.add_primitive("acos", primitives::prim_acos);
            env.add_primitive("atan", primitives::prim_atan);
            env.add_primitive("atan2", primitives::prim_atan2);
            env.add_primitive("sinh", primitives::prim_sinh);
            env.add_primitive("cosh", primitives::prim_cosh);
            env.add_primitive("tanh", primitives::prim_tanh);
            env.add_primitive("asinh", primitives::prim_asinh);
            env.add_primitive("acosh", primitives::prim_acosh);
            env.add_primitive("atanh", primitives::prim_atanh);
            env.add_primitive("exp", primitives::prim_exp);
            env.add_primitive("expm1", primitives::prim_expm1);
            env.add_primitive("log", primitives::prim_log);
            env.add_primitive("log10", primitives::prim_log10);
            env.add_primitive("log2", primitives::prim_log2);
            env.add_primitive("log1p", primitives::prim_log1p);
            env.add_primitive("sqrt", primitives::prim_sqrt);
            env.add_primitive("cbrt", primitives::prim_cbrt);
            env.add_primitive("pow", primitives::prim_pow);
            env.add_primitive("fabs", primitives::prim_fabs);
            env.add_primitive("fmod", primitives::prim_fmod);
            env.add_primitive("hypot", primitives::prim_hypot);
            env.add_primitive("copysign", primitives::prim_copysign);
            env.add_primitive("degrees", primitives::prim_degrees);
            env.add_primitive("radians", primitives::prim_radians);
            env.add_primitive("ceil", primitives::prim_ceil);
            env.add_primitive("floor", primitives::prim_floor);
            env.add_primitive("trunc", primitives::prim_trunc);
            env.add_primitive("factorial", primitives::prim_factorial);
            env.add_primitive("gcd", primitives::prim_gcd);
            env.add_primitive("lcm", primitives::prim_lcm);
            env.add_primitive("isqrt", primitives::prim_isqrt);
            env.add_primitive("isnan", primitives::prim_isnan);
            env.add_primitive("isinf", primitives::prim_isinf);
            env.add_primitive("isfinite", primitives::prim_isfinite);

            env.add_constant("pi", std::f64::consts::PI);
            env.add_constant("e", std::f64::consts::E);
            env.add_constant("tau", std::f64::consts::TAU);
            env.add_constant("inf", f64::INFINITY);
            env.add_constant("nan", f64::NAN);
        }
        env_ptr
    }

    /// Creates a new environment enclosed within an outer one.
    pub fn new_enclosed(outer_env: Rc<RefCell<Environment>>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Environment {
            outer: Some(outer_env),
            bindings: HashMap::new(),
        }))
    }

    /// Creates the frame for one procedure call, binding `params` to `args`
    /// positionally. `name` and `call_span` are only used for error reporting.
    pub fn new_call_frame(
        params: &[String],
        args: Vec<Node>,
        outer_env: Rc<RefCell<Environment>>,
        name: &str,
        call_span: Span,
    ) -> Result<Rc<RefCell<Self>>, EnvError> {
        if params.len() != args.len() {
            return Err(EnvError::ArityMismatch {
                name: name.to_string(),
                expected: Arity::Exactly(params.len()),
                found: args.len(),
                span: call_span,
            });
        }
        let bindings = params.iter().cloned().zip(args).collect();
        Ok(Rc::new(RefCell::new(Environment {
            outer: Some(outer_env),
            bindings,
        })))
    }

    /// Defines a variable in the *current* environment frame.
    /// Replaces the value if the variable already exists in this frame.
    pub fn define(&mut self, name: String, value_node: Node) {
        self.bindings.insert(name, value_node);
    }

    /// Looks up a variable's value.
    /// Checks the current environment first, then walks up the outer environment chain.
    /// `lookup_span` is the location where the variable was referenced, used for error reporting.
    pub fn get(&self, name: &str, lookup_span: Span) -> Result<Node, EnvError> {
        if let Some(value_node) = self.bindings.get(name) {
            Ok(value_node.clone())
        } else {
            match &self.outer {
                Some(outer_env_ptr) => outer_env_ptr.borrow().get(name, lookup_span),
                None => Err(EnvError::UnboundSymbol(name.to_string(), lookup_span)),
            }
        }
    }

    /// Finds the innermost frame in the chain starting at `env` that binds `name`.
    pub fn lookup(
        env: &Rc<RefCell<Environment>>,
        name: &str,
        lookup_span: Span,
    ) -> Result<Rc<RefCell<Environment>>, EnvError> {
        let mut current = env.clone();
        loop {
            let outer = {
                let frame = current.borrow();
                if frame.bindings.contains_key(name) {
                    None
                } else {
                    match &frame.outer {
                        Some(outer) => Some(outer.clone()),
                        None => {
                            return Err(EnvError::UnboundSymbol(name.to_string(), lookup_span));
                        }
                    }
                }
            };
            match outer {
                Some(outer) => current = outer,
                None => {
                    trace!("found binding for '{}'", name);
                    return Ok(current);
                }
            }
        }
    }

    /// Sets the value of an *existing* variable in the environment chain.
    /// Searches outward from the current environment and updates the first frame
    /// where the variable is found. Errors if the variable is not defined.
    /// `set_span` is the location of the `set` expression.
    pub fn set(&mut self, name: &str, value_node: Node, set_span: Span) -> Result<(), EnvError> {
        if let Some(value_mut) = self.bindings.get_mut(name) {
            *value_mut = value_node;
            Ok(())
        } else {
            match &self.outer {
                Some(outer_env_ptr) => outer_env_ptr.borrow_mut().set(name, value_node, set_span),
                None => Err(EnvError::UnboundSymbol(name.to_string(), set_span)),
            }
        }
    }

    /// Whether this frame (ignoring outer frames) binds `name`.
    pub fn binds_locally(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Helper to add a primitive procedure to the environment.
    fn add_primitive(&mut self, name: &str, func: PrimitiveFunc) {
        let node = Node::new_primitive(func, name, Span::default());
        self.define(name.to_string(), node);
    }

    fn add_constant(&mut self, name: &str, value: f64) {
        self.define(name.to_string(), Node::new_real(value, Span::default()));
    }

    /// Gets the set of all identifiers visible from this environment
    pub fn get_identifiers(&self) -> HashSet<String> {
        let mut identifiers: HashSet<String> = self.bindings.keys().cloned().collect();
        if let Some(ref outer_env_ptr) = self.outer {
            identifiers.extend(outer_env_ptr.borrow().get_identifiers());
        }
        identifiers
    }
}
