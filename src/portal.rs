/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

//! Compatibility shim for opening files and URIs through the
//! `org.freedesktop.portal.OpenURI` portal.
//!
//! Old runtimes only ship the `OpenURI` method while newer ones prefer the
//! fd-based `OpenFile` method, so the launcher has to pick the right call at
//! runtime and fall back when the portal predates `OpenFile`. Both methods
//! hand back a request object whose `Response` signal tells us when the user
//! interaction is over.

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use num_enum::TryFromPrimitive;
use std::collections::HashMap;
use std::os::fd::AsFd;
use std::path::PathBuf;
use strum::Display;
use thiserror::Error;
use tokio::task::spawn;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};
use zbus::message::Message;
use zbus::proxy;
use zbus::proxy::{Builder, CacheProperties};
use zbus::zvariant::{Fd, OwnedObjectPath, OwnedValue, Value};
use zbus::{fdo, Connection, Proxy};

const PORTAL_BUS_NAME: &str = "org.freedesktop.portal.Desktop";
const REQUEST_INTERFACE: &str = "org.freedesktop.portal.Request";

#[proxy(
    default_service = "org.freedesktop.portal.Desktop",
    default_path = "/org/freedesktop/portal/desktop",
    interface = "org.freedesktop.portal.OpenURI",
    gen_blocking = false
)]
trait OpenURI {
    fn open_file(
        &self,
        parent_window: &str,
        fd: Fd<'_>,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<OwnedObjectPath>;

    #[zbus(name = "OpenURI")]
    fn open_uri(
        &self,
        parent_window: &str,
        uri: &str,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<OwnedObjectPath>;
}

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("could not connect to the session bus")]
    Connection(#[source] zbus::Error),
    #[error("no such target path {path}")]
    TargetNotFound {
        path: PathBuf,
        #[source]
        source: Errno,
    },
    #[error("portal call failed")]
    RemoteCall(#[from] zbus::Error),
}

/// Final state of a portal request, as reported by its `Response` signal.
#[derive(Display, PartialEq, Debug, Copy, Clone, TryFromPrimitive)]
#[strum(serialize_all = "snake_case")]
#[repr(u32)]
pub enum ResponseOutcome {
    Success = 0,
    UserCancelled = 1,
    Error = 2,
}

#[derive(PartialEq, Debug, Clone)]
struct Target {
    is_local: bool,
    path: PathBuf,
    uri: String,
}

impl Target {
    fn parse(target: &str) -> Target {
        let (scheme, rest) = match split_scheme(target) {
            Some((scheme, rest)) => (Some(scheme), rest),
            None => (None, target),
        };
        let is_local = match scheme {
            Some(scheme) => scheme.eq_ignore_ascii_case("file"),
            None => true,
        };
        // Authority components (file://host/path) are not usable locally,
        // keep the path part only.
        let path = match rest.strip_prefix("//") {
            Some(rest) => match rest.find('/') {
                Some(index) => &rest[index..],
                None => "",
            },
            None => rest,
        };
        Target {
            is_local,
            path: PathBuf::from(path),
            uri: target.to_string(),
        }
    }

    fn canonical_uri(&self) -> String {
        if self.is_local {
            format!("file://{}", self.path.display())
        } else {
            self.uri.clone()
        }
    }
}

fn split_scheme(target: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = target.split_once(':')?;
    let mut chars = scheme.chars();
    if !chars.next()?.is_ascii_alphabetic() {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return None;
    }
    Some((scheme, rest))
}

fn is_unknown_method(err: &zbus::Error) -> bool {
    match err {
        zbus::Error::FDO(err) => matches!(**err, fdo::Error::UnknownMethod(_)),
        zbus::Error::MethodError(name, _, _) => {
            name.as_str() == "org.freedesktop.DBus.Error.UnknownMethod"
        }
        _ => false,
    }
}

type DoneCallback<T> = Box<dyn FnOnce(T) + Send + Sync + 'static>;

/// Opens a file or URI through the desktop portal and reports back through a
/// completion callback once the user interaction is over.
///
/// Each launcher handles exactly one target; `run()` consumes it.
pub struct PortalLauncher<T = ()> {
    target: Target,
    connection: Connection,
    proxy: OpenURIProxy<'static>,
    callback: Option<(DoneCallback<T>, T)>,
}

impl PortalLauncher<()> {
    pub async fn new(target: &str) -> Result<PortalLauncher<()>, PortalError> {
        let connection = Connection::session()
            .await
            .map_err(PortalError::Connection)?;
        PortalLauncher::with_connection(connection, target, None).await
    }
}

impl<T: Send + 'static> PortalLauncher<T> {
    pub async fn with_callback(
        target: &str,
        callback: impl FnOnce(T) + Send + Sync + 'static,
        data: T,
    ) -> Result<PortalLauncher<T>, PortalError> {
        let connection = Connection::session()
            .await
            .map_err(PortalError::Connection)?;
        PortalLauncher::with_connection(connection, target, Some((Box::new(callback), data))).await
    }

    pub(crate) async fn with_connection(
        connection: Connection,
        target: &str,
        callback: Option<(DoneCallback<T>, T)>,
    ) -> Result<PortalLauncher<T>, PortalError> {
        let proxy = OpenURIProxy::new(&connection)
            .await
            .map_err(PortalError::Connection)?;
        Ok(PortalLauncher {
            target: Target::parse(target),
            connection,
            proxy,
            callback,
        })
    }

    /// Issues the portal call and, if the portal tracks the request, arranges
    /// for the completion callback to fire once its `Response` arrives.
    pub async fn run(mut self) -> Result<(), PortalError> {
        let handle = if self.target.is_local {
            match self.run_open_file_method().await {
                Ok(handle) => Some(handle),
                Err(PortalError::RemoteCall(err)) if is_unknown_method(&err) => {
                    warn!("OpenFile method not available, falling back to OpenURI...");
                    None
                }
                Err(err) => return Err(err),
            }
        } else {
            None
        };

        // OpenURI covers non-file URIs as well as file:// targets on old
        // portals that predate the OpenFile method.
        let handle = match handle {
            Some(handle) => handle,
            None => self.run_open_uri_method().await?,
        };

        if handle.as_str() == "/" {
            warn!("Could not get a request handle from the OpenURI portal!");
            return Ok(());
        }

        // The request object stays alive for the duration of the user
        // interaction; its Response signal tells us when it's all over.
        let request = Builder::<Proxy>::new(&self.connection)
            .destination(PORTAL_BUS_NAME)?
            .path(handle.as_str())?
            .interface(REQUEST_INTERFACE)?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        let mut response = request.receive_signal("Response").await?;

        spawn(async move {
            let Some(message) = response.next().await else {
                return;
            };
            // At most one callback invocation, even if the portal misbehaves
            // and emits the signal again.
            drop(response);
            Self::handle_response(&message, self.callback.take());
        });

        Ok(())
    }

    fn handle_response(message: &Message, callback: Option<(DoneCallback<T>, T)>) {
        match message
            .body()
            .deserialize::<(u32, HashMap<String, OwnedValue>)>()
        {
            Ok((code, _results)) => match ResponseOutcome::try_from(code) {
                Ok(ResponseOutcome::Error) => warn!("OpenURI portal: an error happened"),
                Ok(outcome) => info!("OpenURI portal: {outcome}"),
                Err(_) => debug!("OpenURI portal: unspecified response code {code}"),
            },
            Err(err) => warn!("OpenURI portal: malformed response: {err}"),
        }

        if let Some((callback, data)) = callback {
            callback(data);
        }
    }

    async fn run_open_file_method(&self) -> Result<OwnedObjectPath, PortalError> {
        info!(
            "Opening path at {} (method: OpenURI.OpenFile)...",
            self.target.path.display()
        );
        // The portal wants a descriptor, not a path; O_PATH is enough since
        // the portal never reads through it.
        let fd = open(
            &self.target.path,
            OFlag::O_PATH | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|err| {
            error!(
                "Can't find path at {}: {err}",
                self.target.path.display()
            );
            PortalError::TargetNotFound {
                path: self.target.path.clone(),
                source: err,
            }
        })?;
        Ok(self
            .proxy
            .open_file("", Fd::from(fd.as_fd()), HashMap::new())
            .await?)
    }

    async fn run_open_uri_method(&self) -> Result<OwnedObjectPath, PortalError> {
        let uri = self.target.canonical_uri();
        info!("Opening URI at {uri} (method: OpenURI.OpenURI)...");
        Ok(self.proxy.open_uri("", &uri, HashMap::new()).await?)
    }
}
