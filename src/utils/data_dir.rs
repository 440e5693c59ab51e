//! Data directory for persisted transfer sessions.
//!
//! Defaults to `~/.lanshare/`; `--data-dir` / `LANSHARE_DATA_DIR` override it.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

const DEFAULT_DIR_NAME: &str = ".lanshare";

pub fn resolve(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => dirs::home_dir()
            .map(|home| home.join(DEFAULT_DIR_NAME))
            .ok_or_else(|| anyhow!("no home directory found; pass --data-dir")),
    }
}
