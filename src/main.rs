use clap::Parser;
use netcage::cli::NetcageOpts;

#[tokio::main]
async fn main() {
    // Parse cli and handle clap errors
    let options = NetcageOpts::parse();

    // Override the default log level if there is a greater verbosity flag
    netcage::init_logger(options.override_log_level());

    match netcage::daemon::run(options).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            log::error!("{e:#}");
            std::process::exit(1);
        }
    }
}
