mod admin;
mod runtime;
mod serve;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::core::config::Config;
use crate::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Service")
        .command("serve", "Run the API, the dispatcher and the job scheduler")
        .command("dispatch-once", "Deliver one batch of queued notifications and exit")
        .print();

    GuideSection::new("Setup")
        .command("init", "Create the system store and an admin user (--email EMAIL)")
        .print();

    GuideSection::new("Management")
        .command("jobs list", "List scheduled jobs across all tenants")
        .command("help", "Show this guide")
        .print();

    println!(
        "\n {} {} <command> [subcommand] [--config PATH]\n",
        style("Usage:").bold(),
        style("tenantd").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CliArgs {
    pub command: Vec<String>,
    pub config: Option<PathBuf>,
    pub email: Option<String>,
}

/// Splits `args` (without the binary name) into positional words and known flags.
pub(crate) fn parse_cli_args(args: &[String]) -> CliArgs {
    let mut parsed = CliArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    parsed.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--email" => {
                if i + 1 < args.len() {
                    parsed.email = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--help" | "-h" => {
                parsed.command = vec!["help".to_string()];
                return parsed;
            }
            word => {
                parsed.command.push(word.to_string());
                i += 1;
            }
        }
    }
    parsed
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let parsed = parse_cli_args(&args);
    let words: Vec<&str> = parsed.command.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["serve"] => {
            let config = Config::load(parsed.config.as_deref())?;
            serve::run_server(config).await
        }
        ["init"] => {
            let config = Config::load(parsed.config.as_deref())?;
            admin::run_init(&config, parsed.email.as_deref()).await
        }
        ["dispatch-once"] => {
            let config = Config::load(parsed.config.as_deref())?;
            admin::run_dispatch_once(&config).await
        }
        ["jobs", "list"] | ["jobs"] => {
            let config = Config::load(parsed.config.as_deref())?;
            admin::run_jobs_list(&config).await
        }
        [] | ["help"] => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command: {}", other.join(" ")));
            print_help();
            Ok(())
        }
    }
}
