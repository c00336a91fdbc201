mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::output::{OutputFormat, print_error};

/// Build and install packages from formula descriptors.
#[derive(Parser)]
#[command(name = "cellar", author, version, about, long_about = None)]
struct Cli {
  /// Increase log verbosity (-v info, -vv debug, -vvv trace)
  #[arg(short, long, global = true, action = ArgAction::Count)]
  verbose: u8,

  /// Directory of `*.json` formula descriptors
  #[arg(long, global = true, default_value = "formulas")]
  formulas: PathBuf,

  /// Installation prefix (defaults to $CELLAR_PREFIX or the user data directory)
  #[arg(long, global = true)]
  prefix: Option<PathBuf>,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Resolve, build and install a formula with its dependencies
  Install {
    /// Formula name
    name: String,

    /// Build flags such as `--with-bar`, `--without-check`, `--HEAD`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    flags: Vec<String>,

    /// Never pour prebuilt bottles
    #[arg(short = 's', long)]
    build_from_source: bool,

    /// Run the formula self-test after installing
    #[arg(long)]
    test: bool,

    /// Parallel install tasks
    #[arg(short, long)]
    jobs: Option<usize>,
  },

  /// Show the resolved dependency graph of a formula
  Deps {
    /// Formula name
    name: String,

    /// Build flags, as for `install`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    flags: Vec<String>,
  },

  /// Show a formula, or the host platform when no name is given
  Info {
    /// Formula name
    name: Option<String>,
  },

  /// List installed kegs
  List {
    /// Only kegs of this formula
    name: Option<String>,

    /// Re-hash each keg and report modified ones
    #[arg(long)]
    verify: bool,
  },

  /// Run the self-test of an installed formula
  Test {
    /// Formula name
    name: String,
  },
}

fn main() {
  let cli = Cli::parse();

  let filter = match cli.verbose {
    0 => "warn",
    1 => "info",
    2 => "debug",
    _ => "trace",
  };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  if let Err(e) = run(cli) {
    print_error(&format!("{:#}", e));
    std::process::exit(1);
  }
}

fn run(cli: Cli) -> Result<()> {
  let ctx = cmd::Context {
    formulas: cli.formulas,
    prefix: cli.prefix,
    output: cli.output,
  };

  match cli.command {
    Commands::Install {
      name,
      flags,
      build_from_source,
      test,
      jobs,
    } => cmd::cmd_install(
      &ctx,
      &name,
      &flags,
      cmd::InstallArgs {
        build_from_source,
        run_tests: test,
        jobs,
      },
    ),
    Commands::Deps { name, flags } => cmd::cmd_deps(&ctx, &name, &flags),
    Commands::Info { name } => cmd::cmd_info(&ctx, name.as_deref()),
    Commands::List { name, verify } => cmd::cmd_list(&ctx, name.as_deref(), verify),
    Commands::Test { name } => cmd::cmd_test(&ctx, &name),
  }
}
