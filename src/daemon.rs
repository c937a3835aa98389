/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

//! Session daemon that launches and supervises the Dropbox sync daemon.
//!
//! The bus name doubles as the single-instance lock: whichever process owns
//! it runs the daemon, any other invocation just asks for the sync folder to
//! be opened and goes away. A stale owner without a configured sync folder
//! gets replaced.

use anyhow::{anyhow, bail, ensure, Result};
use nix::unistd::{access, AccessFlags};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, metadata, try_exists, DirBuilder};
use tokio::process::Command;
use tokio::select;
use tokio::sync::oneshot;
use tokio::task::spawn;
use tokio_stream::StreamExt;
use tracing::subscriber::set_global_default;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};
use zbus::fdo::{DBusProxy, RequestNameFlags, RequestNameReply};
use zbus::Connection;

use crate::config;
use crate::monitor::PathWatcher;
use crate::path;
use crate::portal::PortalLauncher;
use crate::process::{find_process_by_name, terminate, wait_for_exit};

const BUS_NAME: &str = "com.dropbox.Client";
// Shell script shipped by the vendor as the unified entry point; it re-execs
// itself and finally hands off to the real daemon.
const LAUNCHER_SCRIPT: &str = "/app/extra/.dropbox-dist/dropboxd";
const DAEMON_NAME: &str = "dropbox";
const AUTOUPDATE_DIR: &str = ".dropbox-dist";

pub async fn run(debug: bool) -> Result<()> {
    let stdout_log = fmt::layer();
    let filter = if debug {
        EnvFilter::new("info")
    } else {
        EnvFilter::from_default_env()
    };
    let subscriber = Registry::default().with(stdout_log).with(filter);
    set_global_default(subscriber)?;

    let session = match Connection::session().await {
        Ok(c) => c,
        Err(e) => {
            error!("Error connecting to DBus: {}", e);
            bail!(e);
        }
    };

    DropboxLauncher::new(session).run().await
}

struct DropboxLauncher {
    session: Connection,
}

impl DropboxLauncher {
    fn new(session: Connection) -> DropboxLauncher {
        DropboxLauncher { session }
    }

    async fn run(self) -> Result<()> {
        info!("Trying to own the sync daemon bus name...");
        if self.request_name(false).await? {
            info!("No instance of the sync daemon already running");
            return self.run_primary().await;
        }

        if config::sync_directory().await?.is_none() {
            info!(
                "Another instance is already running but no sync folder was found; \
                 launching the daemon again"
            );
            info!("Trying to own the sync daemon bus name (this time replacing existing ones)...");
            if self.request_name(true).await? {
                return self.run_primary().await;
            }
            bail!("could not replace the running instance");
        }

        info!("Another instance of the sync daemon is already running");
        open_when_created(&self.session).await
    }

    async fn request_name(&self, replace: bool) -> Result<bool> {
        let mut flags = RequestNameFlags::AllowReplacement | RequestNameFlags::DoNotQueue;
        if replace {
            flags |= RequestNameFlags::ReplaceExisting;
        }
        let reply = self.session.request_name_with_flags(BUS_NAME, flags).await?;
        Ok(matches!(
            reply,
            RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner
        ))
    }

    async fn run_primary(self) -> Result<()> {
        disable_auto_updates().await?;

        let dbus = DBusProxy::new(&self.session).await?;
        let mut name_lost = dbus.receive_name_lost().await?;

        let mut supervisor = spawn(supervise_daemon());

        let config_file = config::config_file()?;
        let config_dir = config_file
            .parent()
            .ok_or(anyhow!("configuration file has no parent directory"))?
            .to_path_buf();
        fs::create_dir_all(&config_dir).await?;
        let mut config_watcher = PathWatcher::new(&config_dir)?;
        let mut config_armed = true;

        enum Exit {
            DaemonExited,
            NameLost,
        }

        let exit = loop {
            select! {
                res = &mut supervisor => {
                    res??;
                    break Exit::DaemonExited;
                }
                signal = name_lost.next() => {
                    let Some(signal) = signal else {
                        bail!("lost connection to the session bus");
                    };
                    if signal.args()?.name().as_str() == BUS_NAME {
                        break Exit::NameLost;
                    }
                }
                res = config_watcher.wait_for(&config_file), if config_armed => {
                    res?;
                    if try_exists(&config_file).await? {
                        info!("Configuration for the sync daemon created; opening folder when created...");
                        config_armed = false;
                        let session = self.session.clone();
                        spawn(async move {
                            if let Err(err) = open_when_created(&session).await {
                                error!("Could not open the sync folder: {err}");
                            }
                        });
                    }
                }
            }
        };

        match exit {
            Exit::DaemonExited => {
                info!("Sync daemon background service terminated. Quitting the app...");
            }
            Exit::NameLost => {
                info!("Lost the bus name ownership; quitting...");
                supervisor.abort();
                if let Some(pid) = find_process_by_name(DAEMON_NAME) {
                    terminate(pid);
                }
            }
        }
        Ok(())
    }
}

async fn supervise_daemon() -> Result<()> {
    let launcher_script = path(LAUNCHER_SCRIPT);
    info!(
        "Running the sync daemon launcher at {}...",
        launcher_script.display()
    );
    let mut launcher = match Command::new(&launcher_script).kill_on_drop(true).spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            bail!(
                "Can't find launcher script at {}",
                launcher_script.display()
            );
        }
        Err(err) => return Err(err.into()),
    };
    if let Some(pid) = launcher.id() {
        info!("Monitoring launcher with PID {pid}...");
    }
    launcher.wait().await?;

    // The launcher hands off to the real daemon, which is the process that
    // decides when the app is done.
    match find_process_by_name(DAEMON_NAME) {
        Some(pid) => {
            info!("Monitoring daemon with PID {pid}...");
            wait_for_exit(pid).await;
        }
        None => warn!("Could not find the PID for the sync daemon binary. Ignoring..."),
    }
    Ok(())
}

/// We ship updates to the sync daemon ourselves, so its auto-update
/// directory is backed up and recreated unwritable to keep it from mixing
/// versions behind our back.
async fn disable_auto_updates() -> Result<()> {
    let orig_dir = config::home_dir()?.join(AUTOUPDATE_DIR);
    let exists = try_exists(&orig_dir).await?;
    if exists && access(&orig_dir, AccessFlags::W_OK).is_err() {
        info!(
            "{} is already unaccessible. Nothing to do",
            orig_dir.display()
        );
        return Ok(());
    }

    let backup_dir = PathBuf::from(format!("{}.backup", orig_dir.display()));
    if exists {
        info!(
            "Found auto-update directory in {}. Backing it up in {}",
            orig_dir.display(),
            backup_dir.display()
        );
        if try_exists(&backup_dir).await? {
            let _ = fs::remove_dir_all(&backup_dir).await;
        }
        fs::rename(&orig_dir, &backup_dir).await?;
    }

    info!(
        "Disabling auto-updates by making {} unwritable",
        orig_dir.display()
    );
    DirBuilder::new().mode(0).create(&orig_dir).await?;
    Ok(())
}

async fn open_when_created(session: &Connection) -> Result<()> {
    let Some(directory) = config::sync_directory().await? else {
        warn!("No sync folder configured yet. Cannot open or monitor it!");
        return Ok(());
    };

    if !try_exists(&directory).await? {
        info!("Setting up monitor for folder {}...", directory.display());
        let parent = directory
            .parent()
            .ok_or(anyhow!("sync folder has no parent directory"))?;
        let mut watcher = PathWatcher::new(parent)?;
        // It may have shown up between the check and the watch
        if !try_exists(&directory).await? {
            watcher.wait_for(&directory).await?;
        }
        info!("Sync folder created; opening now...");
    }

    open_directory(session, &directory).await
}

async fn open_directory(session: &Connection, directory: &Path) -> Result<()> {
    info!(
        "Attempting to open sync folder at {}...",
        directory.display()
    );
    ensure!(
        metadata(directory).await?.is_dir(),
        "{} is not a directory!",
        directory.display()
    );
    let target = directory
        .to_str()
        .ok_or(anyhow!("sync folder path is not valid UTF-8"))?;

    let (tx, rx) = oneshot::channel();
    let launcher = PortalLauncher::with_connection(
        session.clone(),
        target,
        Some((
            Box::new(|tx: oneshot::Sender<()>| {
                let _ = tx.send(());
            }),
            tx,
        )),
    )
    .await?;
    launcher.run().await?;

    // An untracked request never reports back; the channel just closes and
    // the request has still been handed off.
    let _ = rx.await;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing;

    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tokio::fs::{create_dir_all, read_to_string, set_permissions, write};
    use tokio::time::timeout;

    #[tokio::test]
    async fn bus_name_claim_and_replace() {
        let mut h = testing::start();
        let first = h.new_dbus().await.expect("dbus");
        let second = h.new_dbus().await.expect("dbus");

        let holder = DropboxLauncher::new(first.clone());
        assert!(holder.request_name(false).await.expect("request_name"));

        let dbus = DBusProxy::new(&first).await.expect("proxy");
        let mut name_lost = dbus.receive_name_lost().await.expect("receive_name_lost");

        let contender = DropboxLauncher::new(second.clone());
        assert!(!contender.request_name(false).await.expect("request_name"));
        assert!(contender.request_name(true).await.expect("request_name"));

        let signal = timeout(Duration::from_secs(5), name_lost.next())
            .await
            .expect("timeout")
            .expect("signal");
        assert_eq!(signal.args().expect("args").name().as_str(), BUS_NAME);
    }

    #[tokio::test]
    async fn auto_update_directory_is_neutralized() {
        let _h = testing::start();
        let home = config::home_dir().unwrap();
        let dist = home.join(AUTOUPDATE_DIR);
        create_dir_all(&dist).await.expect("create_dir_all");
        write(dist.join("VERSION"), "1").await.expect("write");

        disable_auto_updates().await.expect("disable_auto_updates");

        let backup = home.join(".dropbox-dist.backup");
        assert_eq!(
            read_to_string(backup.join("VERSION")).await.expect("read"),
            "1"
        );
        let meta = metadata(&dist).await.expect("metadata");
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0);
    }

    #[tokio::test]
    async fn auto_update_directory_created_fresh() {
        let _h = testing::start();
        let home = config::home_dir().unwrap();
        create_dir_all(&home).await.expect("create_dir_all");

        disable_auto_updates().await.expect("disable_auto_updates");

        let meta = metadata(home.join(AUTOUPDATE_DIR)).await.expect("metadata");
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0);
    }

    #[tokio::test]
    async fn missing_launcher_script_is_fatal() {
        let _h = testing::start();

        assert!(supervise_daemon().await.is_err());
    }

    #[tokio::test]
    async fn launcher_script_hand_off_without_daemon() {
        let _h = testing::start();
        let script = path(LAUNCHER_SCRIPT);
        create_dir_all(script.parent().unwrap())
            .await
            .expect("create_dir_all");
        write(&script, "#!/bin/sh\nexit 0\n").await.expect("write");
        set_permissions(&script, PermissionsExt::from_mode(0o755))
            .await
            .expect("set_permissions");

        // The script exits and no daemon shows up; that's a warning, not an
        // error.
        timeout(Duration::from_secs(5), supervise_daemon())
            .await
            .expect("timeout")
            .expect("supervise_daemon");
    }
}
