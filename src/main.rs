//! Coral - Main Entry Point
//!
//! With no arguments the engine speaks UCI on stdin/stdout. The `bench`
//! subcommand runs a fixed search sweep and exits.

use anyhow::Result;
use coral::uci::UciHandler;

const BENCH_DEPTH: i32 = 7;

fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "warn"),
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => {
            let mut uci = UciHandler::new();
            uci.run();
            Ok(())
        }
        Some("bench") => {
            let depth = args
                .get(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(BENCH_DEPTH);
            let mut uci = UciHandler::new();
            uci.bench(depth);
            Ok(())
        }
        Some(other) => {
            eprintln!("unknown argument '{}'", other);
            eprintln!("usage: coral [bench [depth]]");
            std::process::exit(1);
        }
    }
}
