// Marlais REPL
//
// Reads forms until parentheses balance, evaluates them in the current
// module and prints every returned value. Evaluation runs on a thread with
// the configured stack size.

use log::{error, info};
use marlais::context::{GlobalContext, RuntimeConfig};
use marlais::eval::{ControlSignal, Interpreter};
use marlais::printer::print_to_string;
use marlais::process::Process;
use marlais::types::Value;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::process::ExitCode;

const BACKTRACE_LINES: usize = 10;

struct Options {
    config: RuntimeConfig,
    load: Option<PathBuf>,
}

fn parse_options() -> Result<Options, String> {
    let mut args = pico_args::Arguments::from_env();

    if args.contains(["-h", "--help"]) {
        println!("Usage: marlais [options]");
        println!("Options:");
        println!("  -h, --help: Print this help message");
        println!("  --max-depth <n>: Non-tail nesting limit (default: 4096)");
        println!("  --linearization <clos|local>: Class precedence algorithm (default: clos)");
        println!("  --stack-size <bytes>: Evaluation thread stack size (default: 256m)");
        println!("  --load <file>: Evaluate a file before the prompt");
        std::process::exit(0);
    }

    let mut config = RuntimeConfig::from_env()?;
    if let Some(depth) = args
        .opt_value_from_str::<_, usize>("--max-depth")
        .map_err(|e| e.to_string())?
    {
        config.max_depth = depth;
    }
    if let Some(linearization) = args
        .opt_value_from_str::<_, String>("--linearization")
        .map_err(|e| e.to_string())?
    {
        config.linearization = linearization.parse()?;
    }
    if let Some(size) = args
        .opt_value_from_str::<_, usize>("--stack-size")
        .map_err(|e| e.to_string())?
    {
        config.stack_size = size;
    }
    let load = args
        .opt_value_from_str::<_, PathBuf>("--load")
        .map_err(|e| e.to_string())?;

    let rest = args.finish();
    if !rest.is_empty() {
        return Err(format!("unexpected arguments: {:?}", rest));
    }
    Ok(Options { config, load })
}

fn main() -> ExitCode {
    env_logger::init();

    let options = match parse_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("marlais: {}", e);
            return ExitCode::from(2);
        }
    };

    let stack_size = options.config.stack_size;
    let worker = std::thread::Builder::new()
        .name("marlais-repl".into())
        .stack_size(stack_size)
        .spawn(move || run(options));
    match worker.map(|handle| handle.join()) {
        Ok(Ok(code)) => code,
        Ok(Err(_)) => {
            error!("evaluation thread panicked");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("cannot start evaluation thread: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Outcome of evaluating one chunk of input
enum Outcome {
    Continue,
    Fatal,
}

fn run(options: Options) -> ExitCode {
    info!(
        "starting with max depth {}, {:?} linearization",
        options.config.max_depth, options.config.linearization
    );
    let mut globals = match GlobalContext::with_config(options.config) {
        Ok(globals) => globals,
        Err(e) => {
            error!("runtime boot failed: {}", e);
            eprintln!("marlais: runtime boot failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut process = Process::new(globals.user_module);
    let mut interp = Interpreter::new(&mut process, &mut globals);

    if let Some(path) = &options.load {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("marlais: cannot read {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        };
        info!("loading {}", path.display());
        if let Outcome::Fatal = evaluate(&mut interp, &source, false) {
            return ExitCode::FAILURE;
        }
    }

    println!("Marlais {} - Dylan-style object runtime", env!("CARGO_PKG_VERSION"));
    println!("Type (quit) or Ctrl-D to exit");
    println!();

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            error!("cannot start line editor: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut code_buffer = String::new();
    loop {
        let prompt = if code_buffer.is_empty() {
            format!("{}> ", module_name(&interp))
        } else {
            ".....> ".to_string()
        };

        match rl.readline(&prompt) {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                if code_buffer.is_empty() && line.trim() == "(quit)" {
                    println!("Goodbye!");
                    break;
                }
                if !line.trim().is_empty() {
                    code_buffer.push_str(&line);
                    code_buffer.push('\n');
                }
                if !is_balanced(&code_buffer) {
                    continue;
                }
                let source = std::mem::take(&mut code_buffer);
                if source.trim().is_empty() {
                    continue;
                }
                if let Outcome::Fatal = evaluate(&mut interp, &source, true) {
                    return ExitCode::FAILURE;
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Drop the pending input, keep the session
                code_buffer.clear();
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                error!("line editor: {}", err);
                break;
            }
        }
    }
    ExitCode::SUCCESS
}

fn module_name(interp: &Interpreter<'_>) -> String {
    interp
        .globals
        .modules
        .get(interp.process.current_module)
        .map(|m| interp.globals.name(m.name))
        .unwrap_or_default()
}

fn evaluate(interp: &mut Interpreter<'_>, source: &str, echo: bool) -> Outcome {
    match interp.eval_string(source) {
        Ok(value) => {
            if echo {
                print_values(interp, &value);
            }
            Outcome::Continue
        }
        Err(ControlSignal::Error(condition)) => {
            let class = interp.globals.mop.condition_class(&condition);
            println!(
                "Error: {} {}",
                interp.globals.mop.class_name(class),
                condition.message
            );
            for expr in interp.process.last_backtrace.iter().take(BACKTRACE_LINES) {
                println!("  in {}", print_to_string(interp.globals, expr));
            }
            if condition.is_fatal() {
                error!("fatal condition: {}", condition.message);
                return Outcome::Fatal;
            }
            Outcome::Continue
        }
        Err(ControlSignal::Exit { .. }) => {
            println!("Error: exit procedure called outside its block");
            Outcome::Continue
        }
    }
}

fn print_values(interp: &Interpreter<'_>, value: &Value) {
    match value {
        Value::Values(values) => {
            for value in values.iter() {
                println!("{}", print_to_string(interp.globals, value));
            }
        }
        other => println!("{}", print_to_string(interp.globals, other)),
    }
}

fn is_balanced(s: &str) -> bool {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut in_comment = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }

        if escape {
            escape = false;
            continue;
        }

        match c {
            '\\' if in_string => escape = true,
            // Character literal: `#\(` is not a paren
            '#' if !in_string && chars.peek() == Some(&'\\') => {
                chars.next();
                chars.next();
            }
            '"' => in_string = !in_string,
            ';' if !in_string => in_comment = true,
            '(' if !in_string => depth += 1,
            ')' if !in_string => depth -= 1,
            _ => {}
        }
    }

    depth <= 0 && !in_string
}
