use std::process::ExitCode;

fn main() -> ExitCode {
    match eventmetrics::cli::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
