mod args;
mod live_run;
mod render;
mod settings;
mod static_run;
#[cfg(feature = "tui")]
mod tui;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

use crate::args::{Cli, Command};
use crate::settings::Settings;

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!(error = %e, "fatal");
        eprintln!("cidrwatch: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Static(args) => {
            let settings = Settings::build(&args.common, args.log_format.as_deref())?;
            static_run::run(&args, &settings)
        }
        Command::Live(args) => {
            let mut settings = Settings::build(&args.common, args.log_format.as_deref())?;
            settings.apply_live_flags(&args);
            live_run::run(&settings)
        }
    }
}

/// 1 for configuration problems, 2 for fatal I/O.
fn exit_code(error: &anyhow::Error) -> i32 {
    for cause in error.chain() {
        if cause.downcast_ref::<std::io::Error>().is_some() {
            return 2;
        }
        if let Some(cidrwatch_common::CidrwatchError::Io(_)) =
            cause.downcast_ref::<cidrwatch_common::CidrwatchError>()
        {
            return 2;
        }
    }
    1
}
