use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use grader::config::{CliArgs, Config};
use grader::pipeline::Grader;
use grader::submission::decommission;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = match cli.to_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if cli.decommission {
        return remove_submission(&cli, &config);
    }

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Ctrl-c received, stopping...");
            token.cancel();
        }
    });

    let report = Grader::new(&config)
        .grade(&cli.user, &cli.files, &cancel)
        .await;

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                log::error!("Failed to serialize report: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print!("{}", report.render());
    }

    if report.is_system_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn remove_submission(cli: &CliArgs, config: &Config) -> ExitCode {
    if let Some(reason) = &cli.reason {
        println!("{reason}");
    }
    println!("\n>>>  REMOVING ALL SUBMITTED FILES.  <<<\n");

    match decommission(config, &cli.user, cli.confirm.as_deref()) {
        Ok(folder) => {
            log::info!("Submission folder {} removed", folder.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
