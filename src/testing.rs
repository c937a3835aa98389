/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

//! Test scaffolding: a per-test scratch root backing `crate::path()` and a
//! private session bus for D-Bus tests.

use anyhow::{anyhow, Result};
use std::cell::RefCell;
use std::path::Path;
use std::process::Stdio;
use std::rc::{Rc, Weak};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use zbus::connection::{Builder, Connection};

thread_local! {
    static CONTEXT: RefCell<Option<Weak<TestContext>>> = const { RefCell::new(None) };
}

pub(crate) struct TestContext {
    base: TempDir,
    dbus: RefCell<Option<MockDBus>>,
}

pub(crate) struct TestHandle {
    pub test: Rc<TestContext>,
}

pub(crate) fn start() -> TestHandle {
    let context = Rc::new(TestContext {
        base: TempDir::new().expect("Couldn't create test directory"),
        dbus: RefCell::new(None),
    });
    CONTEXT.with(|ctx| *ctx.borrow_mut() = Some(Rc::downgrade(&context)));
    TestHandle { test: context }
}

pub(crate) fn current() -> Rc<TestContext> {
    CONTEXT
        .with(|ctx| ctx.borrow().as_ref().and_then(Weak::upgrade))
        .expect("testing context not started")
}

impl TestContext {
    pub(crate) fn base(&self) -> &Path {
        self.base.path()
    }
}

struct MockDBus {
    address: String,
    _process: Child,
}

impl MockDBus {
    async fn new() -> Result<MockDBus> {
        let mut process = Command::new("dbus-daemon")
            .args(["--session", "--nofork", "--print-address"])
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = process
            .stdout
            .take()
            .ok_or(anyhow!("no stdout from dbus-daemon"))?;
        let address = BufReader::new(stdout)
            .lines()
            .next_line()
            .await?
            .ok_or(anyhow!("dbus-daemon didn't print an address"))?;
        Ok(MockDBus {
            address: address.trim().to_string(),
            _process: process,
        })
    }
}

impl TestHandle {
    /// Hands out a fresh connection to this test's private session bus,
    /// spawning the bus on first use.
    pub async fn new_dbus(&mut self) -> Result<Connection> {
        if self.test.dbus.borrow().is_none() {
            let dbus = MockDBus::new().await?;
            *self.test.dbus.borrow_mut() = Some(dbus);
        }
        let address = self
            .test
            .dbus
            .borrow()
            .as_ref()
            .map(|dbus| dbus.address.clone())
            .expect("no bus running");
        Ok(Builder::address(address.as_str())?.build().await?)
    }
}
