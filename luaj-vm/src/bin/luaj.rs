//! Command-line driver: `luaj <file>` compiles and runs a chunk;
//! `luaj -l <file>` lists the compiled bytecode instead of running it.
//!
//! Errors are printed to standard error with their `chunk:line[:col]`
//! prefix and the process exits with the status code. A file that cannot
//! be opened is a driver-local failure, outside the status range.

use std::fs::File;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use luaj_vm::prelude::*;

/// Exit code for file-open failures; deliberately outside the `Status`
/// range.
const EXIT_FILE_ERR: u8 = 6;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args();
    let prog = args.next().unwrap_or_else(|| "luaj".to_string());
    let (list, path) = match (args.next(), args.next(), args.next()) {
        (Some(path), None, None) => (false, path),
        (Some(flag), Some(path), None) if flag == "-l" => (true, path),
        _ => {
            eprintln!("usage: {prog} [-l] <file>");
            return ExitCode::from(EXIT_FILE_ERR);
        }
    };

    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{prog}: cannot open {path}: {e}");
            return ExitCode::from(EXIT_FILE_ERR);
        }
    };

    let mut state = State::new();
    let status = state.load(file, &path);
    if !status.is_ok() {
        report(&mut state);
        return ExitCode::from(status.code() as u8);
    }
    if list {
        if let Some(listing) = state.dump_function(state.top() - 1) {
            print!("{listing}");
        }
        return ExitCode::SUCCESS;
    }
    let status = state.pcall(0, 0, 0);
    if !status.is_ok() {
        report(&mut state);
        return ExitCode::from(status.code() as u8);
    }
    ExitCode::SUCCESS
}

/// Prints the error value a failed load or protected call left on the
/// stack.
fn report(state: &mut State) {
    if let Some(v) = state.pop() {
        let msg = state.display_value(v);
        eprintln!("{msg}");
    }
}
