//! SIEM Deployer CLI

use clap::{Arg, ArgAction, Command};
use siem_deployer::aws;
use std::path::PathBuf;
use tracing::error;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Entrypoint for the SIEM Deployer CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("siem-deployer")
        .version(crate_version())
        .about("Provision an AWS network topology and an optional SIEM stack.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(aws::CMD)
                .about("Deploy a VPC network (and optionally a SIEM fleet behind a load balancer with TLS and DNS) to AWS from a YAML configuration keyed by environment.")
                .subcommand(
                    Command::new(aws::CREATE_CMD)
                        .about("Create the network and SIEM resources for the environment selected by DEPLOYMENT_ENVIRONMENT.")
                        .arg(
                            Arg::new("config")
                                .long("config")
                                .required(true)
                                .help("Path to YAML config file")
                                .value_parser(clap::value_parser!(PathBuf)),
                        ),
                )
                .subcommand(
                    Command::new(aws::DESTROY_CMD)
                        .about("Destroy all resources associated with a given deployment.")
                        .arg(
                            Arg::new("config")
                                .long("config")
                                .help("Path to YAML config file")
                                .value_parser(clap::value_parser!(PathBuf)),
                        )
                        .arg(
                            Arg::new("tag")
                                .long("tag")
                                .help("Deployment tag (uses persisted metadata)")
                                .value_parser(clap::value_parser!(String)),
                        )
                        .group(
                            clap::ArgGroup::new("target")
                                .args(["config", "tag"])
                                .required(true),
                        ),
                )
                .subcommand(
                    Command::new(aws::LIST_CMD)
                        .about("List all active deployments (created but not destroyed)."),
                ),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    if let Some(aws_matches) = matches.subcommand_matches(aws::CMD) {
        match aws_matches.subcommand() {
            Some((aws::CREATE_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                if let Err(e) = aws::create(config_path).await {
                    error!(error = %e, "failed to create deployment");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((aws::DESTROY_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config");
                let tag = matches.get_one::<String>("tag").map(|s| s.as_str());
                if let Err(e) = aws::destroy(config_path, tag).await {
                    error!(error = %e, "failed to destroy deployment");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((aws::LIST_CMD, _)) => {
                if let Err(e) = aws::list() {
                    error!(error = %e, "failed to list deployments");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((cmd, _)) => {
                error!(cmd, "invalid subcommand");
            }
            None => {
                error!("no subcommand provided");
            }
        }
    } else if let Some(cmd) = matches.subcommand_name() {
        error!(cmd, "invalid subcommand");
    } else {
        error!("no subcommand provided");
    }
    std::process::ExitCode::FAILURE
}
