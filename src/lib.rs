//! A command line client for the Pylon hosting platform API.
//!
//! The heart of the crate is the asynchronous workflow-completion core:
//! an authenticated, retrying HTTP transport ([`request::Client`]), a
//! paged collection fetcher, the [`workflow::Workflow`] model, and the
//! [`workflow::poller`] and [`workflow::watcher`] loops that reconcile
//! long-running server-side jobs until they terminate.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod commands;
pub mod config;
pub mod error;
pub mod request;
pub mod session;
pub mod site;
pub mod workflow;

pub use config::Config;
pub use error::Error;
pub use error::Result;
