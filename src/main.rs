use std::process::ExitCode;

fn main() -> ExitCode {
    whimsy::cli::main()
}
