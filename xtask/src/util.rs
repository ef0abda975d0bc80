use colored::Colorize;
use std::{
    env,
    error::Error,
    path::{Path, PathBuf},
    process::Command,
};

pub(crate) type DynError = Box<dyn Error>;

pub(crate) fn project_root() -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir.parent().unwrap_or(manifest_dir).to_path_buf()
}

pub(crate) fn project_target_dir() -> PathBuf {
    project_root().join("target")
}

/// Runs `cargo <args>` from the repository root, forwarding any extra arguments given after the task name.
pub(crate) fn run_cargo(label: &str, args: &[&str], envs: &[(&str, &str)]) -> Result<(), DynError> {
    println!("─────────────────────────────────");
    println!("{}", format!("🚀 Running: {label}").bright_green());

    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let status = Command::new(&cargo)
        .current_dir(project_root())
        .envs(envs.iter().copied())
        .args(args)
        .args(env::args().skip(2))
        .status()?;

    if !status.success() {
        Err(format!("❌ Failed: {label}"))?;
    }

    println!("{}", format!("✔️    Done: {label}").bright_green());
    Ok(())
}
