/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use clap::Parser;

use dropbox_launcher::daemon;

#[derive(Parser)]
struct Args {
    /// Log informational messages
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();
    daemon::run(args.debug).await
}
