use crate::util::{project_target_dir, run_cargo, DynError};
use colored::Colorize;

const LIBRARY: &str = "patina_protocol_db";
const BOOTSTRAP: (&str, &str) = ("RUSTC_BOOTSTRAP", "1");

pub(crate) fn check() -> Result<(), DynError> {
    // the library is checked against a UEFI target to keep it honest about no_std.
    run_cargo(
        "cargo check (no_std)",
        &[
            "check",
            "--target",
            "x86_64-unknown-uefi",
            "-Zbuild-std=core,compiler_builtins,alloc",
            "-Zbuild-std-features=compiler-builtins-mem",
            "-p",
            LIBRARY,
        ],
        &[BOOTSTRAP],
    )?;
    run_cargo("cargo check (std)", &["check", "-p", LIBRARY, "--features", "std"], &[BOOTSTRAP])?;
    run_cargo("cargo check (xtask)", &["check", "-p", "xtask"], &[])
}

pub(crate) fn clippy() -> Result<(), DynError> {
    run_cargo("cargo clippy", &["clippy", "--all-targets", "--all-features", "--", "-D", "warnings"], &[BOOTSTRAP])
}

pub(crate) fn test() -> Result<(), DynError> {
    run_cargo("cargo test", &["test", "-p", LIBRARY], &[])
}

pub(crate) fn coverage() -> Result<(), DynError> {
    let target_dir = project_target_dir();
    let target_dir = target_dir.to_str().unwrap_or("./target");
    run_cargo(
        "cargo tarpaulin",
        &["tarpaulin", "-p", LIBRARY, "--out", "html", "--out", "xml", "--output-dir", target_dir],
        &[],
    )
}

pub(crate) fn docs() -> Result<(), DynError> {
    run_cargo(
        "cargo doc",
        &["doc", "--features", "doc", "--workspace", "--exclude", "xtask"],
        &[BOOTSTRAP, ("RUSTDOCFLAGS", "-D warnings")],
    )
}

pub(crate) fn format() -> Result<(), DynError> {
    run_cargo("cargo fmt", &["fmt", "--all"], &[])
}

pub(crate) fn all() -> Result<(), DynError> {
    println!("\n{}", "🚀 Running: all tasks".bright_green());

    format()?;
    check()?;
    clippy()?;
    test()?;
    coverage()?;
    docs()?;

    Ok(())
}
