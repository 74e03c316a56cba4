//! lanecount CLI - replay sensor events through the lane counting engine
//!
//! # Usage
//!
//! ```bash
//! # Write a settings template, then describe lanes and lots in it
//! ./target/debug/lanecount-cli --init-settings
//!
//! # Replay a capture
//! ./target/debug/lanecount-cli events.ndjson
//!
//! # JSON lines for scripting, with a short debounce window
//! cat events.ndjson | ./target/debug/lanecount-cli --json -t 0.5 | jq .
//!
//! # Replay in real time
//! ./target/debug/lanecount-cli events.ndjson --pace
//! ```

use anyhow::Result;
use clap::Parser;

use lanecount::cli::{init_settings, initialize, run, Args};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init_settings {
        return init_settings(&args).await;
    }

    let ctx = initialize(&args).await?;
    run(ctx).await
}
