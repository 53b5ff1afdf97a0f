use overlay::cli::initialize_from_arguments;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    println!("Overlay v{}", env!("CARGO_PKG_VERSION"));
    match initialize_from_arguments().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
