use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;

use gitup::cli::Cli;
use gitup::session;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbosity);

    match session::run(&cli) {
        Ok(report) => {
            if let Err(e) = stamp_revision(&cli, &report) {
                log::warn!("failed to write .gituprevision: {e}");
            }
            for notice in &report.updating_notices {
                println!("note: {} was updated; please rerun gitup to apply it", notice.display());
            }
            if report.repair_ran && !report.updated {
                println!("please rerun gitup to verify the repair");
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("gitup: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new().filter_level(level).format_timestamp(None).init();
}

/// Writes `<branch-or-tag>:<first-9-of-want>\n` to `.gituprevision` in the
/// target directory, an external-collaborator concern kept out of the core.
fn stamp_revision(_cli: &Cli, report: &session::RunReport) -> anyhow::Result<()> {
    let path = report.target_directory.join(".gituprevision");
    let want_hex = report.want.to_hex();
    let short = &want_hex[..9.min(want_hex.len())];
    std::fs::write(&path, format!("{}:{short}\n", report.want_display))?;
    Ok(())
}
