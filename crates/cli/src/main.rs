use std::process::ExitCode;

fn main() -> ExitCode {
    opgate_cli::run()
}
