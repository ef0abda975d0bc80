use colored::Colorize;

pub(crate) fn print_help() {
    eprintln!(
        "\nUsage: {}
Tasks are run in the root of the repository.

Tasks:
all           Run every task below before drafting a PR
check         Run cargo check (no_std and std builds)
clippy        Run cargo clippy with warnings denied
coverage      Generate a code coverage report with cargo tarpaulin
docs          Generate documentation
fmt           Run cargo fmt
help          Print this help message
test          Run tests

Options:
Task specific cargo options can be passed after the task name, e.g.:
cargo xtask test -- --nocapture
cargo xtask docs --open
",
        "cargo xtask <task> [options]".bright_green()
    );
}
