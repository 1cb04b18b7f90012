//! entrypoint for ramafwd

#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![cfg_attr(test, allow(clippy::float_cmp))]
#![cfg_attr(not(test), warn(clippy::print_stdout, clippy::dbg_macro))]

use clap::Parser;
use rama::error::BoxError;
use ramafwd::{error, proxy};

#[cfg(target_family = "unix")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[cfg(target_os = "windows")]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "ramafwd")]
#[command(bin_name = "ramafwd")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    cmd: proxy::CliCommandProxy,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    #[allow(clippy::exit)]
    match proxy::run(cli.cmd).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(err) = err.downcast_ref::<error::ErrorWithExitCode>() {
                eprintln!("exit with error ({}): {err}", err.exit_code());
                std::process::exit(err.exit_code());
            } else {
                eprintln!("exit with error: {err}");
                std::process::exit(1);
            }
        }
    }
}
