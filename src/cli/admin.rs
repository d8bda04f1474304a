use anyhow::{Context, Result};

use super::runtime::open_store;
use crate::core::config::Config;
use crate::core::dispatcher::NotificationDispatcher;
use crate::core::terminal;

pub const DEFAULT_ADMIN_EMAIL: &str = "admin@localhost";

/// Creates the system schema and one administrative user, then prints its token.
pub async fn run_init(config: &Config, email: Option<&str>) -> Result<()> {
    let store = open_store(config).await?;
    let email = email.unwrap_or(DEFAULT_ADMIN_EMAIL);
    let user = store
        .create_user(email)
        .await
        .with_context(|| format!("Failed to create admin user {}", email))?;

    terminal::print_success("System store initialized");
    terminal::print_status("Store", &config.storage.system_db_path().display().to_string());
    terminal::print_status("Admin", &user.email);
    terminal::print_status("Token", &user.token_key);
    terminal::print_warn("Send app_id=default with this token for administrative calls. It is shown once.");
    Ok(())
}

/// One dispatcher round in the foreground.
pub async fn run_dispatch_once(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let dispatcher = NotificationDispatcher::new(store, config.dispatcher.clone())?;
    let report = dispatcher.run_round().await.context("Dispatch round failed")?;

    terminal::print_success("Dispatch round complete");
    terminal::print_status("Reaped", &report.reaped.to_string());
    terminal::print_status("Claimed", &report.claimed.to_string());
    terminal::print_status("Delivered", &report.delivered.to_string());
    terminal::print_status("Failed", &report.failed.to_string());
    Ok(())
}

pub async fn run_jobs_list(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let jobs = store.list_jobs(None).await?;
    if jobs.is_empty() {
        terminal::print_info("No jobs defined");
        return Ok(());
    }
    for job in jobs {
        terminal::print_status(
            &format!("{}/{}", job.project_id, job.name),
            &format!("{} [{}] {} ({})", job.id, job.status.as_str(), job.cron, job.mode),
        );
    }
    Ok(())
}
