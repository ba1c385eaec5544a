use std::sync::Arc;

use color_eyre::{eyre::Result, Help};
use relive::{config::Config, pages::PagesApp, server, ReloadGateway, WatchTarget};
use tracing::{info, Level};
use tracing_subscriber::{filter::Targets, prelude::*};

use self::cli::{Cli, Command, ServeArgs};

mod cli;

fn main() -> Result<()> {
    let args = Cli::parse();

    color_eyre::install()?;
    init_logger(args.quiet, args.verbose);

    match args.cmd {
        Command::Serve(args) => serve(args),
        Command::Completions { shell } => cli::completions(shell),
        Command::Manpages { dir } => cli::manpages(&dir),
    }
}

/// Initialize the application logger.
fn init_logger(quiet: bool, verbose: u8) {
    if quiet {
        return;
    }

    tracing_subscriber::registry()
        .with(Targets::new().with_default(Level::WARN).with_target(
            env!("CARGO_CRATE_NAME"),
            match verbose {
                0 => Level::INFO,
                1 => Level::DEBUG,
                _ => Level::TRACE,
            },
        ))
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}

/// Serve the Markdown pages with live reloading, until interrupted.
fn serve(args: ServeArgs) -> Result<()> {
    let config = Config::load(args.config.as_deref())
        .suggestion("fix or remove the configuration file, all settings are optional")?;

    let pages = Arc::new(PagesApp::new(args.dir));
    let builder = ReloadGateway::builder(Arc::clone(&pages))
        .config(&config.gateway)
        .watch_options(config.watch.options())
        .watch(pages.watch_target());

    let gateway = config
        .watch
        .paths
        .into_iter()
        .fold(builder, |builder, path| builder.watch(WatchTarget::new(path)))
        .build()?;

    info!(
        dir = %pages.dir().display(),
        port = args.port,
        "serving pages at http://localhost:{}",
        args.port
    );

    server::run(gateway, args.port)
}
