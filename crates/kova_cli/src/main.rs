use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use kova_parser::{parse_module, Lexer, ParseError, TokenKind};
use kova_vm::{disassemble, format_value, CodeObject, Compiler, Value, Vm, VmError};

/// ANSI escape sequences for diagnostics; no color crate, just the codes.
mod color {
    pub const RED: &str = "\x1b[31m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const RESET: &str = "\x1b[0m";
}

fn print_usage() {
    eprintln!("kova - a small scripting language");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  kova                 Start interactive REPL");
    eprintln!("  kova repl            Start interactive REPL");
    eprintln!("  kova <file.kv>       Run a file");
    eprintln!("  kova run <file.kv>   Run a file");
    eprintln!("  kova dis <file.kv>   Show compiled bytecode");
    eprintln!("  kova version         Show version information");
    eprintln!("  kova help            Show this help message");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -h, --help     Show this help message");
    eprintln!("  -V, --version  Show version information");
}

fn print_version() {
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        run_repl();
        return;
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => {
            print_usage();
        }
        "version" | "--version" | "-V" | "-v" => {
            print_version();
        }
        "repl" => {
            run_repl();
        }
        "run" => {
            if args.len() < 3 {
                eprintln!("usage: kova run <file.kv>");
                std::process::exit(1);
            }
            run_file(&args[2]);
        }
        "dis" => {
            if args.len() < 3 {
                eprintln!("usage: kova dis <file.kv>");
                std::process::exit(1);
            }
            let code = compile_file(&args[2]);
            print!("{}", disassemble(&code));
        }
        path => {
            run_file(path);
        }
    }
}

fn compile_file(path: &str) -> CodeObject {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!(
                "{}error:{} cannot read {path}: {err}",
                color::BRIGHT_RED,
                color::RESET
            );
            std::process::exit(1);
        }
    };

    let module = match parse_module(&source) {
        Ok(module) => module,
        Err(err) => {
            eprintln!("{}", format_parse_error(&err, Some(path)));
            std::process::exit(1);
        }
    };

    let source_dir = Path::new(path)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    match Compiler::new()
        .with_source_dir(source_dir)
        .compile_module(&module)
    {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", format_compile_error(&err, Some(path)));
            std::process::exit(1);
        }
    }
}

fn run_file(path: &str) {
    let code = compile_file(path);
    let mut vm = Vm::new();
    if let Err(err) = vm.load(module_name(path), code) {
        eprintln!("{}", format_runtime_error(&err));
        std::process::exit(1);
    }
}

fn module_name(path: &str) -> &str {
    Path::new(path)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("main")
}

fn run_repl() {
    let mut rl = match rustyline::DefaultEditor::new() {
        Ok(editor) => editor,
        Err(_) => {
            eprintln!("failed to start line editor");
            return;
        }
    };
    let history_path = env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".kova_history"));
    if let Some(path) = history_path.as_ref() {
        let _ = rl.load_history(path);
    }

    print_version();
    let mut vm = Vm::new();
    let mut buffer = String::new();

    loop {
        let prompt = if buffer.is_empty() { ">>> " } else { "... " };
        let line = match rl.readline(prompt) {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
            | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(_) => break,
        };

        let trimmed = line.trim_end();
        if buffer.is_empty() {
            match trimmed {
                "" => continue,
                "exit" | ".exit" => break,
                "reset" | ".reset" => {
                    vm = Vm::new();
                    buffer.clear();
                    println!("ok");
                    continue;
                }
                _ => {}
            }
        }
        let _ = rl.add_history_entry(trimmed);
        buffer.push_str(trimmed);
        buffer.push('\n');

        if !is_input_complete(&buffer) {
            continue;
        }

        let input = std::mem::take(&mut buffer);
        match parse_module(&input) {
            Ok(module) => {
                let fragment = match Compiler::new()
                    .with_source_dir(PathBuf::from("."))
                    .compile_repl_fragment(&module)
                {
                    Ok(fragment) => fragment,
                    Err(err) => {
                        eprintln!("{}", format_compile_error(&err, None));
                        continue;
                    }
                };
                match vm.extend(fragment) {
                    Ok(_) => {
                        if let Some(value) = vm.take_stack_top() {
                            if !matches!(value, Value::Nil) {
                                println!("{}", format_value(&value));
                            }
                        }
                    }
                    Err(err) => eprintln!("{}", format_runtime_error(&err)),
                }
            }
            Err(err) => {
                eprintln!("{}", format_parse_error(&err, None));
            }
        }
    }

    if let Some(path) = history_path.as_ref() {
        let _ = rl.append_history(path);
    }
}

/// A buffer is complete once every `func`/`if`/`while` block has its `end`
/// and every bracket pair is closed. Lexing keeps string and comment
/// contents from being miscounted.
fn is_input_complete(buffer: &str) -> bool {
    let mut open_blocks: isize = 0;
    let mut open_brackets: isize = 0;
    for token in Lexer::new(buffer).tokenize() {
        match token.kind {
            TokenKind::Func | TokenKind::If | TokenKind::While => open_blocks += 1,
            TokenKind::End => open_blocks -= 1,
            TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => open_brackets += 1,
            TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => open_brackets -= 1,
            _ => {}
        }
    }
    open_blocks <= 0 && open_brackets <= 0
}

fn format_parse_error(err: &ParseError, path: Option<&str>) -> String {
    match path {
        Some(path) => format!("{}{err} (in {path}){}", color::BRIGHT_RED, color::RESET),
        None => format!("{}{err}{}", color::BRIGHT_RED, color::RESET),
    }
}

fn format_compile_error(err: &VmError, path: Option<&str>) -> String {
    match err {
        VmError::Compile { message, span } => {
            let location = match (span, path) {
                (Some(span), Some(path)) => {
                    format!(" at {path}:{}:{}", span.start_line, span.start_col)
                }
                (Some(span), None) => format!(" at {}:{}", span.start_line, span.start_col),
                _ => String::new(),
            };
            format!(
                "{}compile error:{} {message}{location}",
                color::BRIGHT_RED,
                color::RESET
            )
        }
        other => format!("{}compile error:{} {other}", color::BRIGHT_RED, color::RESET),
    }
}

fn format_runtime_error(err: &VmError) -> String {
    match err {
        VmError::Runtime {
            message,
            line,
            stack,
        } => {
            let mut output = match line {
                Some(line) => format!(
                    "{}runtime error:{} {message} at line {line}",
                    color::RED,
                    color::RESET
                ),
                None => format!("{}runtime error:{} {message}", color::RED, color::RESET),
            };
            if let Some(stack) = stack {
                if !stack.is_empty() {
                    output.push_str(&format!("\n{}stack trace:{}", color::YELLOW, color::RESET));
                    for frame in stack {
                        match frame.line {
                            Some(line) => {
                                output.push_str(&format!("\n  at {} (line {line})", frame.name))
                            }
                            None => output.push_str(&format!("\n  at {}", frame.name)),
                        }
                    }
                }
            }
            output
        }
        VmError::ExecutionLimit { message } => {
            format!("{}runtime error:{} {message}", color::RED, color::RESET)
        }
        other => format!("{}runtime error:{} {other}", color::RED, color::RESET),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_statements_are_complete() {
        assert!(is_input_complete("print(1)\n"));
        assert!(is_input_complete("var x = [1, 2]\n"));
    }

    #[test]
    fn open_blocks_are_incomplete() {
        assert!(!is_input_complete("while i < 3\n"));
        assert!(!is_input_complete("func f(a)\n"));
        assert!(!is_input_complete("if a\n  1\nelse\n"));
        assert!(is_input_complete("while i < 3\n  i = i + 1\nend\n"));
    }

    #[test]
    fn open_brackets_are_incomplete() {
        assert!(!is_input_complete("var xs = [1,\n"));
        assert!(is_input_complete("var xs = [1,\n2]\n"));
    }

    #[test]
    fn block_keywords_inside_strings_do_not_count() {
        assert!(is_input_complete("print(\"while\")\n"));
        assert!(is_input_complete("print(\"func (\")\n"));
    }

    #[test]
    fn block_keywords_inside_comments_do_not_count() {
        assert!(is_input_complete("print(1) # while waiting\n"));
    }

    #[test]
    fn runtime_error_formatting_includes_trace() {
        let err = VmError::Runtime {
            message: "division by zero".to_string(),
            line: Some(3),
            stack: Some(vec![kova_vm::TraceFrame {
                name: "inner".to_string(),
                line: Some(3),
            }]),
        };
        let text = format_runtime_error(&err);
        assert!(text.contains("division by zero"));
        assert!(text.contains("at line 3"));
        assert!(text.contains("at inner"));
    }

    #[test]
    fn module_name_strips_extension() {
        assert_eq!(module_name("scripts/tool.kv"), "tool");
        assert_eq!(module_name("bare"), "bare");
    }
}
