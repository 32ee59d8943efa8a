//! Implementation of the `wait` subcommand.
//!
//! Waits for a workflow to complete. Usually used to wait for code
//! commits, since pylon already waits for workflows it starts itself.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use anyhow::bail;
use clap::Parser;
use tracing::info;

use crate::config::Config;
use crate::request::Client;
use crate::session::Session;
use crate::site;
use crate::workflow::poller::Poller;
use crate::workflow::poller::WaitOptions;

/// Arguments for the `wait` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The site and environment to wait on, as `site.env`.
    site_env: String,

    /// The workflow description to wait for; defaults to the environment's
    /// code sync.
    description: Option<String>,

    /// Ignore any workflows started prior to this start time (epoch
    /// seconds).
    #[arg(long, default_value_t = 0)]
    start: i64,

    /// Commit SHA to wait for (7-40 lowercase hex characters).
    #[arg(long)]
    commit: Option<String>,

    /// Maximum number of seconds to wait for the workflow to complete; 0
    /// waits forever.
    #[arg(long, default_value_t = 180)]
    max: u64,
}

/// Handles the `wait` subcommand.
pub async fn wait(args: Args, config: Config) -> anyhow::Result<()> {
    let Some((site_name, env_name)) = args.site_env.split_once('.') else {
        bail!(
            "`{site_env}` is not a valid site.env identifier",
            site_env = args.site_env
        );
    };

    let session = Session::load(&config)?;
    let client = Client::new(config, session);

    let site = site::find_site(&client, site_name).await?;
    let environment = site::get_environment(&client, &site, env_name).await?;
    info!(
        site = %site.name,
        env = %environment.id,
        "waiting for workflow"
    );

    let start_time = if args.start > 0 {
        args.start
    } else {
        // Default to a minute ago so a workflow kicked off just before us
        // still matches.
        now_epoch().context("system clock is before the epoch")? - 60
    };

    let options = WaitOptions {
        start_time,
        max_wait: args.max,
        max_not_found_attempts: None,
    };
    let poller = Poller::new(&client);

    match args.commit.as_deref() {
        Some(commit) if !commit.is_empty() => {
            poller
                .wait_for_commit(&site, env_name, commit, &options)
                .await?;
        }
        _ => {
            poller
                .wait_for_workflow(&site, env_name, args.description.as_deref(), &options)
                .await?;
        }
    }

    Ok(())
}

/// The current time in epoch seconds.
fn now_epoch() -> anyhow::Result<i64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64)
}
