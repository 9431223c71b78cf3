//! relaypad command-line front end.
//!
//! ```text
//! relaypad watch todo groceries --name ada
//! relaypad snapshot notes --kind replaceable
//! relaypad derive-key "team passphrase"
//! ```

mod commands;
mod profiles;
mod render;

use anyhow::Result;
use clap::Parser;

use crate::commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    Cli::parse().run().await
}
