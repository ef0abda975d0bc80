mod help;
mod tasks;
mod util;

use colored::Colorize;
use help::print_help;
use std::env;
use util::DynError;

fn main() {
    if let Err(e) = try_main() {
        eprintln!("{}", e.to_string().bright_red());
        std::process::exit(-1);
    }
}

fn try_main() -> Result<(), DynError> {
    let task = env::args().nth(1);
    match task.as_deref() {
        Some("all") => tasks::all()?,
        Some("check") => tasks::check()?,
        Some("clippy") => tasks::clippy()?,
        Some("coverage") => tasks::coverage()?,
        Some("docs") => tasks::docs()?,
        Some("fmt") => tasks::format()?,
        Some("test") => tasks::test()?,
        _ => print_help(),
    }
    Ok(())
}
