use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use unit_supervisor::{
    OsInfo, ShutdownOutcome, ShutdownSignals, SupervisorBuilder, SupervisorError,
};

/// Launches and babysits every process directory under <ROOT>.
///
/// Each process directory must contain an executable called `run`.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Directory containing one subdirectory per process
    root: PathBuf,

    /// Run only these processes (directory names inside ROOT)
    #[arg(short, long, value_delimiter = ',')]
    run: Option<Vec<String>>,

    /// Echo process output to the console
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "unit_supervisor=debug,unit_output=info"
    } else {
        "unit_supervisor=info,unit_output=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let os_info = OsInfo::detect();
    let mut builder = SupervisorBuilder::new(&cli.root)
        .with_verbose(cli.verbose)
        .with_os_info(os_info);
    if let Some(units) = cli.run {
        builder = builder.with_units(units);
    }

    let supervisor = match builder.build() {
        Ok(supervisor) => supervisor,
        Err(e @ (SupervisorError::RootNotFound(_) | SupervisorError::NoRunnableUnits(_))) => {
            anyhow::bail!("{e} (use --help for usage instructions)")
        }
        Err(e) => return Err(e.into()),
    };

    let mut signals = ShutdownSignals::install()?;
    let handle = supervisor.run();

    let listener = handle.clone();
    tokio::spawn(async move {
        loop {
            let name = signals.recv().await;
            info!(signal = name, "shutdown requested");
            if listener.shutdown().is_err() {
                break;
            }
        }
    });

    let report = handle.wait().await?;
    match report.outcome {
        ShutdownOutcome::Graceful => info!(polls = report.polls, "all units stopped, exiting"),
        ShutdownOutcome::Forced => warn!(
            remaining = ?report.remaining,
            "done waiting for units to stop, exiting"
        ),
    }
    Ok(())
}
