/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use std::path::{Path, PathBuf};

pub mod daemon;
pub mod portal;

mod config;
mod monitor;
mod process;

#[cfg(test)]
mod testing;

#[cfg(not(test))]
pub(crate) fn path<P: AsRef<Path>>(path: P) -> PathBuf {
    path.as_ref().to_path_buf()
}

#[cfg(test)]
pub(crate) fn path<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    testing::current()
        .base()
        .join(path.strip_prefix("/").unwrap_or(path))
}
