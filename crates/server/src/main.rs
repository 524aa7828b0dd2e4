use std::process::ExitCode;

use bref_server::{Server, config};

const DEFAULT_CONFIG: &str = "bref.json";

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_CONFIG.to_owned());

    let conf = match config::load(&path) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("bref: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match Server::builder().config(conf).build() {
        Ok(server) => server.start().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("bref: {e}");
            ExitCode::FAILURE
        }
    }
}
