/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

//! Stand-in for `xdg-open` that routes the target through the desktop
//! portal, picking between the OpenFile and OpenURI methods so that opening
//! the sync folder keeps working on both old and new runtimes.

use anyhow::Result;
use clap::Parser;
use tokio::sync::oneshot;
use tracing::subscriber::set_global_default;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use dropbox_launcher::portal::PortalLauncher;

#[derive(Parser)]
#[command(
    name = "xdg-open",
    about = "Open a file or URL through the desktop portal"
)]
struct Args {
    /// Log informational messages
    #[arg(long)]
    debug: bool,

    /// { file | URL }
    target: String,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("info")
    } else {
        EnvFilter::from_default_env()
    };
    let subscriber = Registry::default().with(fmt::layer()).with(filter);
    set_global_default(subscriber)?;

    let (tx, rx) = oneshot::channel();
    let launcher = PortalLauncher::with_callback(
        &args.target,
        |tx: oneshot::Sender<()>| {
            let _ = tx.send(());
        },
        tx,
    )
    .await?;
    launcher.run().await?;

    // Untracked requests never report back; the channel just closes and
    // there's nothing left to wait for.
    let _ = rx.await;
    Ok(())
}
