use std::{env, fs};

use log::{LevelFilter, Log, Metadata, Record};

use stencil::bytecode::disasm::{op_counts, print_environment};
use stencil::bytecode::stack_check::check_environment;
use stencil::frontend::printer::print_program;
use stencil::{compile_environment, CompileOptions, Stencil, TemplateSpec, Value};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() {
    let args: Vec<String> = env::args().collect();

    let verbose = args.contains(&"--verbose".to_string());
    let ast = args.contains(&"--ast".to_string());
    let opcodes = args.contains(&"--opcodes".to_string());
    let precompile = args.contains(&"--precompile".to_string());
    let bytes = args.contains(&"--bytes".to_string());

    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Warn };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    let options = CompileOptions {
        known_helpers_only: args.contains(&"--known-helpers-only".to_string()),
        strict: args.contains(&"--strict".to_string()),
        compat: args.contains(&"--compat".to_string()),
        no_escape: args.contains(&"--no-escape".to_string()),
        ..CompileOptions::default()
    };

    // first non-flag argument that is not the value of --data
    let data_file = args
        .iter()
        .position(|a| a == "--data")
        .and_then(|i| args.get(i + 1));
    let filename = args
        .iter()
        .skip(1)
        .find(|a| !a.starts_with('-') && Some(*a) != data_file);

    let Some(filename) = filename else {
        print_usage();
        std::process::exit(1);
    };

    let source = read(filename);
    if ast {
        dump_ast(&source, &options);
    } else if opcodes {
        dump_opcodes(&source, &options);
    } else if precompile || bytes {
        dump_precompiled(&source, &options, bytes);
    } else {
        render(&source, &options, data_file.map(String::as_str));
    }
}

fn print_usage() {
    println!("STENCIL - template compiler");
    println!();
    println!("Usage:");
    println!("  stencil <template> [--data file.json]   Render a template");
    println!("  stencil <template> --ast                Show the parsed template tree");
    println!("  stencil <template> --opcodes            Show lowered opcodes");
    println!("  stencil <template> --precompile         Print the precompiled template");
    println!("  stencil <template> --bytes              Write the binary manifest to stdout");
    println!();
    println!("Options:");
    println!("  --known-helpers-only   Reject helpers outside the known set");
    println!("  --strict               Fail on missing fields");
    println!("  --compat               Look names up through parent contexts");
    println!("  --no-escape            Do not HTML-escape {{{{x}}}}");
    println!("  --verbose              Log compiler decisions");
    println!("  --help, -h             Show this help");
}

fn read(path: &str) -> String {
    match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to read '{}': {}", path, e);
            std::process::exit(1);
        }
    }
}

fn dump_ast(source: &str, options: &CompileOptions) {
    match Stencil::new().parse(source, options) {
        Ok(program) => print_program(&program),
        Err(e) => fail(&e.to_string(), None),
    }
}

fn dump_opcodes(source: &str, options: &CompileOptions) {
    let stencil = Stencil::new();
    let program = match stencil.parse(source, options) {
        Ok(p) => p,
        Err(e) => fail(&e.to_string(), None),
    };
    let env = match compile_environment(&program, &options.resolve()) {
        Ok(env) => env,
        Err(e) => fail(&e.to_string(), e.hint()),
    };
    if let Err(e) = check_environment(&env) {
        eprintln!("stack check: {}", e.message);
    }
    print_environment(&env);
    if log::log_enabled!(log::Level::Debug) {
        for (name, count) in op_counts(&env) {
            eprintln!("{:>6}  {}", count, name);
        }
    }
}

fn dump_precompiled(source: &str, options: &CompileOptions, bytes: bool) {
    let stencil = Stencil::new();
    let spec: TemplateSpec = match stencil.precompile(source, options) {
        Ok(spec) => spec,
        Err(e) => fail(&e.to_string(), None),
    };
    if !bytes {
        println!("{}", spec.to_source());
        return;
    }
    match spec.to_bytes() {
        Ok(encoded) => {
            use std::io::Write;
            if let Err(e) = std::io::stdout().write_all(&encoded) {
                fail(&e.to_string(), None);
            }
        }
        Err(e) => fail(&e.to_string(), None),
    }
}

fn render(source: &str, options: &CompileOptions, data_file: Option<&str>) {
    let context = match data_file {
        Some(path) => match serde_json::from_str::<serde_json::Value>(&read(path)) {
            Ok(json) => Value::from(json),
            Err(e) => fail(&format!("invalid JSON in '{}': {}", path, e), None),
        },
        None => Value::object::<&str>([]),
    };

    let stencil = Stencil::new();
    let output = stencil
        .compile(source, options)
        .and_then(|template| template.render(&context));
    match output {
        Ok(text) => print!("{}", text),
        Err(e) => fail(&e.to_string(), None),
    }
}

fn fail(message: &str, hint: Option<&str>) -> ! {
    eprintln!("Error: {}", message);
    if let Some(hint) = hint {
        eprintln!("  hint: {}", hint);
    }
    std::process::exit(1);
}
