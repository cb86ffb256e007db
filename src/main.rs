use hoff::{run_serve, Config, Error};
use log::info;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(StructOpt)]
struct Options {
    #[structopt(short, long, parse(from_os_str), default_value = "hoff.toml")]
    /// config file to use
    config: PathBuf,

    #[structopt(long)]
    /// handle events and run Git reads, but leave comments and pushes
    /// to the imagination
    read_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Options::from_args();

    // set up logging, allowing info level logging by default
    env_logger::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("hoff starting");

    let config = Config::from_file(&opts.config)?;
    info!("serving {} project(s) on port {}", config.projects.len(), config.port);

    run_serve(config, opts.read_only).await
}
