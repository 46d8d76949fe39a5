//! slo-cli/src/main.rs
//!
//! Entry point for the `slo` binary. Sets up error reporting and logging,
//! then hands off to `slo_cli::run()`.

fn main() -> std::process::ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("warning: could not initialize error reporting: {e}");
    }
    env_logger::init();
    slo_cli::run()
}
