//! Implementation of the `watch` subcommand.
//!
//! Streams new and finished workflows from a site to the console.

use clap::Parser;

use crate::config::Config;
use crate::request::Client;
use crate::session::Session;
use crate::site;
use crate::workflow::watcher::Watcher;

/// Arguments for the `watch` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The site to watch.
    site: String,

    /// Number of times to query before exiting; runs forever when omitted.
    #[arg(long)]
    checks: Option<i64>,
}

/// Handles the `watch` subcommand.
pub async fn watch(args: Args, config: Config) -> anyhow::Result<()> {
    let session = Session::load(&config)?;
    let client = Client::new(config, session);

    let site = site::find_site(&client, &args.site).await?;

    let mut watcher = Watcher::new(&client, site.id);
    watcher.watch(args.checks).await?;
    Ok(())
}
