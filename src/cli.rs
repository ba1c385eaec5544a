//! Command line arguments and the commands that only deal with the CLI itself.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
};

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use color_eyre::eyre::{ensure, Result, WrapErr};

#[derive(Debug, Parser)]
#[command(about, author, version)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Cli {
    /// Only show minimal output. Mutually exclusive with the --verbose flag
    #[arg(long, short, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
    /// Increase the verbosity of status messages. This argument can be set multiple times to
    /// further raise the verbosity level.
    #[arg(long, short, global = true, action = ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub cmd: Command,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[derive(Debug, Subcommand)]
#[cfg_attr(test, derive(PartialEq))]
pub enum Command {
    /// Serve a directory of Markdown pages, reloading the browser whenever any of them changes.
    Serve(ServeArgs),
    /// Generate auto-completion scripts for various shells.
    Completions {
        /// Shell to generate an auto-completion script for.
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Generate man pages into the given directory.
    Manpages {
        /// Target directory, that must already exist and be empty. If the any file with the same
        /// name as any of the man pages already exist, it'll not be overwritten, but instead an
        /// error be returned.
        #[arg(value_hint = ValueHint::DirPath)]
        dir: PathBuf,
    },
}

#[derive(Debug, Args)]
#[cfg_attr(test, derive(PartialEq))]
pub struct ServeArgs {
    /// Directory containing the Markdown pages.
    #[arg(default_value = "pages", value_hint = ValueHint::DirPath)]
    pub dir: PathBuf,
    /// The local TCP port to listen on.
    #[arg(long, short, default_value_t = 8080)]
    pub port: u16,
    /// Configuration file to use instead of the `relive.toml` in the current directory.
    #[arg(long, short, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("pages"),
            port: 8080,
            config: None,
        }
    }
}

/// Generate shell completions, written to the standard output.
pub fn completions(shell: Shell) -> Result<()> {
    clap_complete::generate(
        shell,
        &mut Cli::command(),
        env!("CARGO_PKG_NAME"),
        &mut io::stdout().lock(),
    );
    Ok(())
}

/// Generate man pages in the target directory. The directory must already exist and none of the
/// files exist, or an error is returned.
pub fn manpages(dir: &Path) -> Result<()> {
    fn print(dir: &Path, app: &clap::Command) -> Result<()> {
        let name = app.get_display_name().unwrap_or_else(|| app.get_name());
        let out = dir.join(format!("{name}.1"));
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&out)
            .wrap_err_with(|| format!("the file `{}` already exists", out.display()))?;

        clap_mangen::Man::new(app.clone()).render(&mut out)?;
        out.flush()?;

        for sub in app.get_subcommands() {
            print(dir, sub)?;
        }

        Ok(())
    }

    ensure!(dir.try_exists()?, "target directory doesn't exist");

    let mut app = Cli::command();
    app.build();

    print(dir, &app)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn default_serve_args() {
        let cli = Cli::parse_from(["app", "serve"]);
        let expect = Cli {
            quiet: false,
            verbose: 0,
            cmd: Command::Serve(ServeArgs::default()),
        };

        assert_eq!(expect, cli);
    }

    #[test]
    fn custom_serve_args() {
        let cli = Cli::parse_from([
            "app",
            "-vv",
            "serve",
            "docs",
            "--port",
            "3000",
            "--config",
            "dev.toml",
        ]);
        let expect = Cli {
            quiet: false,
            verbose: 2,
            cmd: Command::Serve(ServeArgs {
                dir: PathBuf::from("docs"),
                port: 3000,
                config: Some(PathBuf::from("dev.toml")),
            }),
        };

        assert_eq!(expect, cli);
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["app", "-q", "-v", "serve"]).is_err());
    }
}
