mod cli;
mod report;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context};
use cabletune::{
    converge, discover_connection, read_tension_file, write_tension_file, CivilClient,
    HostConfig, Outcome, Settings, SnapshotWriter, TargetTable,
};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{apply_overrides, Args, Command};
use report::{render_failure, render_summary};

/// Exit code of a run that ended without converging.
const NOT_CONVERGED: u8 = 2;

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match execute(args) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Log to stderr so stdout carries only the report.
fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "cabletune=info",
        1 => "cabletune=debug",
        _ => "cabletune=trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn execute(args: Args) -> anyhow::Result<ExitCode> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    match args.command {
        Command::Run {
            tensions,
            targets,
            tolerance,
            max_iterations,
            snapshot_dir,
            stage_step,
            output,
        } => {
            apply_overrides(
                &mut settings.tuning,
                tolerance,
                max_iterations,
                snapshot_dir,
                stage_step,
            );
            run(&settings, &tensions, &targets, output.as_deref())
        }
        Command::Fetch { output } => {
            let client = connect(settings.host)?;
            let tensions = client
                .fetch_tensions()
                .context("cannot read pretensions from the model")?;
            write_tension_file(&output, &tensions)?;
            info!(elements = tensions.len(), path = %output.display(), "saved pretensions");
            Ok(ExitCode::SUCCESS)
        }
        Command::StageStep { element } => {
            let mut client = connect(settings.host.clone())?;
            let element = match element {
                Some(element) => element,
                None => match client.fetch_tensions()?.element_ids().first() {
                    Some(&element) => element,
                    None => bail!("the model has no pretensioned elements"),
                },
            };
            let options = settings.tuning.to_options()?;
            let label = options.resolver.resolve(
                &mut client,
                element,
                &options.load_case,
                &options.force_unit,
            )?;
            println!("{label}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Tune the model, print the summary and save the final tensions.
fn run(
    settings: &Settings,
    tensions: &Path,
    targets: &Path,
    output: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    let initial = read_tension_file(tensions)
        .with_context(|| format!("cannot load trial tensions from {}", tensions.display()))?;
    let targets = TargetTable::from_tensions(
        &read_tension_file(targets)
            .with_context(|| format!("cannot load targets from {}", targets.display()))?,
    );
    let options = settings.tuning.to_options()?;

    let mut snapshots = SnapshotWriter::new(settings.tuning.snapshot_dir.clone());
    let removed = snapshots.clear_stale()?;
    if removed > 0 {
        info!(removed, "cleared snapshots of an earlier run");
    }

    let mut client = connect(settings.host.clone())?;
    let report = match converge(&mut client, &initial, &targets, &options, &mut snapshots) {
        Ok(report) => report,
        Err(err) => {
            eprint!("{}", render_failure(&err));
            return Err(err.into());
        }
    };
    if let Some(err) = snapshots.take_error() {
        return Err(err).context("snapshot could not be written");
    }

    print!("{}", render_summary(&report));
    if let Some(path) = output {
        write_tension_file(path, &report.final_tensions)?;
        info!(path = %path.display(), "saved final tensions");
    }

    Ok(match report.outcome {
        Outcome::Converged => ExitCode::SUCCESS,
        Outcome::Exhausted | Outcome::Cancelled => ExitCode::from(NOT_CONVERGED),
    })
}

/// Merge discovered connection details into `config` and open a client.
fn connect(config: HostConfig) -> anyhow::Result<CivilClient> {
    let config = config.or_discovered(discover_connection());
    let client = CivilClient::new(config).context("cannot connect to the analysis host")?;
    info!(url = %client.config().base_url, "connected to analysis host");
    Ok(client)
}
