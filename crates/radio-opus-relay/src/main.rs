//! radio-opus-relay: serves internet radio streams re-encoded to Opus over plain HTTP.
//!
//! ## Request flow
//! 1. **Parse**: `GET <output_path>?_radio=<url>&_bitrate=<kbps>` becomes a `StreamRequest`.
//! 2. **Metadata**: the upstream's ICY headers are fetched (redirects followed, body never read).
//! 3. **Transcode**: one encoder process per client writes Ogg/Opus to stdout, which is
//!    streamed into the response with backpressure until the client or the encoder goes away.

mod api;
mod cli;
mod config;
mod metadata;
mod models;
mod startup;
mod state;
mod transcode;

use anyhow::Result;
use clap::Parser;

#[actix_web::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    startup::run(args).await
}
