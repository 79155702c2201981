use std::borrow::Cow;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use env_logger::{Builder, Env};
use log::{LevelFilter, debug, info, warn};
use rustyline::error::ReadlineError;
use rustyline::highlight::{CmdKind, Highlighter};
use rustyline::validate::{ValidationContext, ValidationResult, Validator};
use rustyline::{Cmd, Completer, Context, Editor, EventHandler, KeyCode, KeyEvent, Modifiers};
use rustyline::{EditMode, Helper, Highlighter, Hinter, Validator};

use lispy::evaluator::{set_max_eval_depth, special_form_identifiers};
use lispy::{Environment, Error, Node, Sexpr, TokenKind, eval_str, tokenize};

const PROMPT: &str = "lispy> ";

struct SymbolCompleter {
    env: Rc<RefCell<Environment>>,
}

impl SymbolCompleter {
    fn new(env: Rc<RefCell<Environment>>) -> Self {
        SymbolCompleter { env }
    }

    // The symbol being typed, if the cursor sits at the end of one.
    fn prefix_at(line: &str, pos: usize) -> Option<String> {
        match tokenize(&line[..pos]).pop() {
            Some(token) if token.span.end == pos => match token.kind {
                TokenKind::Atom(text) => Some(text),
                _ => None,
            },
            _ => None,
        }
    }
}

impl rustyline::completion::Completer for SymbolCompleter {
    type Candidate = String;
    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let Some(prefix) = Self::prefix_at(line, pos) else {
            return Ok((pos, vec![]));
        };
        let mut candidates: Vec<String> = self
            .env
            .borrow()
            .get_identifiers()
            .union(&special_form_identifiers())
            .filter_map(|id| id.strip_prefix(prefix.as_str()).map(str::to_string))
            .filter(|suffix| !suffix.is_empty())
            .collect();
        candidates.sort();
        Ok((pos, candidates))
    }
}

#[derive(Completer, Helper, Highlighter, Hinter, Validator)]
struct ReplHelper {
    #[rustyline(Validator)]
    validator: ParenValidator,
    #[rustyline(Highlighter)]
    highlighter: ParenHighlighter,
    #[rustyline(Completer)]
    completer: SymbolCompleter,
}

/// Keeps reading lines while an opening paren is still unclosed.
struct ParenValidator;

impl Validator for ParenValidator {
    fn validate(&self, ctx: &mut ValidationContext) -> rustyline::Result<ValidationResult> {
        let mut depth = 0usize;
        for (i, c) in ctx.input().char_indices() {
            match c {
                '(' => depth += 1,
                ')' if depth == 0 => {
                    return Ok(ValidationResult::Invalid(Some(format!(
                        "  - Unmatched ')' at position {}",
                        i
                    ))));
                }
                ')' => depth -= 1,
                _ => {}
            }
        }
        if depth > 0 {
            Ok(ValidationResult::Incomplete)
        } else {
            Ok(ValidationResult::Valid(None))
        }
    }
}

struct ParenHighlighter;

impl ParenHighlighter {
    // Byte offsets of matched paren pairs, and of close parens with no partner.
    fn scan(line: &str) -> (Vec<(usize, usize)>, Vec<usize>) {
        let mut open = Vec::new();
        let mut pairs = Vec::new();
        let mut unmatched = Vec::new();
        for (i, c) in line.char_indices() {
            match c {
                '(' => open.push(i),
                ')' => match open.pop() {
                    Some(start) => pairs.push((start, i)),
                    None => unmatched.push(i),
                },
                _ => {}
            }
        }
        (pairs, unmatched)
    }
}

impl Highlighter for ParenHighlighter {
    fn highlight<'l>(&self, line: &'l str, pos: usize) -> Cow<'l, str> {
        let (pairs, unmatched) = Self::scan(line);
        let touches = |offset: Option<usize>| {
            pairs
                .iter()
                .copied()
                .find(|&(open, close)| offset == Some(open) || offset == Some(close))
        };
        // Prefer the paren just before the cursor, then the one under it.
        let active = touches(pos.checked_sub(1)).or_else(|| touches(Some(pos)));
        if active.is_none() && unmatched.is_empty() {
            return Cow::Borrowed(line);
        }

        let mut highlighted = String::with_capacity(line.len());
        for (i, c) in line.char_indices() {
            if active.is_some_and(|(open, close)| i == open || i == close) {
                highlighted.push_str(&format!("\x1b[1;34m{}\x1b[0m", c)); // Blue for the matching pair
            } else if unmatched.contains(&i) {
                highlighted.push_str(&format!("\x1b[31m{}\x1b[0m", c)); // Red for unmatched closing parens
            } else {
                highlighted.push(c);
            }
        }
        Cow::Owned(highlighted)
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _kind: CmdKind) -> bool {
        true
    }
}

fn cli() -> Command {
    Command::new("lispy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Interactive interpreter for a minimal Lisp")
        .arg(
            Arg::new("eval")
                .short('e')
                .long("eval")
                .value_name("EXPR")
                .help("Evaluate one expression, print the result and exit"),
        )
        .arg(
            Arg::new("edit-mode")
                .long("edit-mode")
                .value_parser(["vi", "emacs"])
                .default_value("vi")
                .help("Line editing key bindings"),
        )
        .arg(
            Arg::new("history")
                .long("history")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .default_value("lispy_history.txt")
                .help("File used to persist input history"),
        )
        .arg(
            Arg::new("no-history")
                .long("no-history")
                .action(ArgAction::SetTrue)
                .help("Neither load nor save input history"),
        )
        .arg(
            Arg::new("max-depth")
                .long("max-depth")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .default_value("2000")
                .help("Maximum evaluation depth before giving up"),
        )
}

fn report(err: &Error, input: &str) {
    if let Err(io_err) = err.pretty_print(input) {
        warn!("failed to render diagnostic: {}", io_err);
        eprintln!("{}", err);
    }
}

fn print_result(node: &Node) {
    if !matches!(node.kind, Sexpr::Void) {
        println!("{}", node);
    }
}

fn run_repl(matches: &ArgMatches, global_env: Rc<RefCell<Environment>>) -> rustyline::Result<()> {
    println!("lispy v{}", env!("CARGO_PKG_VERSION"));
    println!("Type 'exit' or press Ctrl-D to quit.");

    let edit_mode = match matches.get_one::<String>("edit-mode").map(String::as_str) {
        Some("emacs") => EditMode::Emacs,
        _ => EditMode::Vi,
    };
    let history = if matches.get_flag("no-history") {
        None
    } else {
        matches.get_one::<PathBuf>("history").cloned()
    };

    let h = ReplHelper {
        highlighter: ParenHighlighter,
        validator: ParenValidator,
        completer: SymbolCompleter::new(global_env.clone()),
    };
    let config = rustyline::config::Config::builder()
        .edit_mode(edit_mode)
        .build();
    let mut rl = Editor::with_config(config)?;
    rl.set_helper(Some(h));
    rl.bind_sequence(
        KeyEvent(KeyCode::Char('s'), Modifiers::CTRL),
        EventHandler::Simple(Cmd::Newline),
    );
    if let Some(path) = &history {
        if rl.load_history(path).is_err() {
            info!("no previous history at {}", path.display());
        }
    }

    loop {
        match rl.readline(PROMPT) {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let trimmed_input = line.trim();
                if trimmed_input.is_empty() {
                    continue;
                }
                if trimmed_input.eq_ignore_ascii_case("exit") {
                    break;
                }

                match eval_str(trimmed_input, &global_env) {
                    Ok(result_node) => print_result(&result_node),
                    Err(err) => report(&err, trimmed_input),
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl-C
                println!("Interrupted. Type 'exit' or Ctrl-D to quit.");
            }
            Err(ReadlineError::Eof) => {
                // Ctrl-D
                println!("\nExiting.");
                break;
            }
            Err(err) => {
                eprintln!("Readline Error: {:?}", err);
                break;
            }
        }
    }

    match &history {
        Some(path) => rl.save_history(path),
        None => Ok(()),
    }
}

fn main() -> rustyline::Result<()> {
    Builder::from_env(Env::default().default_filter_or("warn"))
        .filter_module("rustyline", LevelFilter::Warn)
        .init();

    let matches = cli().get_matches();

    if let Some(depth) = matches.get_one::<usize>("max-depth") {
        debug!("evaluation depth limit set to {}", depth);
        set_max_eval_depth(*depth);
    }

    let global_env = Environment::new_global_populated();

    if let Some(input) = matches.get_one::<String>("eval") {
        match eval_str(input, &global_env) {
            Ok(result_node) => print_result(&result_node),
            Err(err) => {
                report(&err, input);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    run_repl(&matches, global_env)
}
