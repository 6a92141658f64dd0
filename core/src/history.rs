/*
 * history.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Postbridge, a POP3-to-SMTP mail forwarder.
 *
 * Postbridge is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Postbridge is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Postbridge.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Forwarded-message history: per mailbox address, the set of POP3 unique-ids already forwarded.
//!
//! The whole state is one JSON document, rewritten on every change: written to
//! `<path>.tmp` (mode 0o600), synced, then renamed over `<path>`. A crash at any
//! point leaves either the old or the new document under the canonical name.
//!
//! An unreadable document is logged and replaced by an empty history. Every
//! message still on a server is then forwarded once more.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encoding history: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryData {
    #[serde(default)]
    mailboxes: BTreeMap<String, BTreeSet<String>>,
}

/// Durable (mailbox, unique-id) membership. Entries are only ever added.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    data: Mutex<HistoryData>,
    saves: AtomicUsize,
}

impl HistoryStore {
    /// Load from `path`. A missing file is an empty history; so is an undecodable one (logged).
    /// Any other read failure is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let path = path.into();
        let data = match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<HistoryData>(&raw) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "history file is corrupt; starting empty, messages still on the servers will be forwarded again"
                    );
                    HistoryData::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => HistoryData::default(),
            Err(source) => {
                return Err(HistoryError::Io {
                    op: "reading",
                    path,
                    source,
                })
            }
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
            saves: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HistoryData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn contains(&self, mailbox: &str, uid: &str) -> bool {
        self.lock()
            .mailboxes
            .get(mailbox)
            .map_or(false, |uids| uids.contains(uid))
    }

    /// Insert one unique-id and persist before returning.
    pub fn add(&self, mailbox: &str, uid: &str) -> Result<(), HistoryError> {
        self.add_batch(mailbox, [uid])
    }

    /// Insert several unique-ids with a single write. On failure nothing is inserted.
    pub fn add_batch<I, S>(&self, mailbox: &str, uids: I) -> Result<(), HistoryError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut data = self.lock();
        let existed = data.mailboxes.contains_key(mailbox);
        let set = data.mailboxes.entry(mailbox.to_string()).or_default();
        let mut inserted = Vec::new();
        for uid in uids {
            let uid = uid.as_ref();
            if set.insert(uid.to_string()) {
                inserted.push(uid.to_string());
            }
        }
        if let Err(e) = write_snapshot(&self.path, &data) {
            // Keep memory equal to what is on disk.
            if !existed {
                data.mailboxes.remove(mailbox);
            } else if let Some(set) = data.mailboxes.get_mut(mailbox) {
                for uid in &inserted {
                    set.remove(uid);
                }
            }
            return Err(e);
        }
        let saves = self.saves.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(mailbox, added = inserted.len(), saves, "history saved");
        Ok(())
    }

    #[cfg(test)]
    fn saves(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    /// Number of recorded unique-ids per mailbox.
    pub fn snapshot(&self) -> BTreeMap<String, usize> {
        self.lock()
            .mailboxes
            .iter()
            .map(|(mailbox, uids)| (mailbox.clone(), uids.len()))
            .collect()
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> HistoryError + 'a {
    move |source| HistoryError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

fn write_snapshot(path: &Path, data: &HistoryData) -> Result<(), HistoryError> {
    let bytes = serde_json::to_vec_pretty(data)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(io_err("creating", dir))?;
            #[cfg(unix)]
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
        }
    }
    let tmp = temp_path(path);
    write_temp(&tmp, &bytes)?;
    fs::rename(&tmp, path).map_err(io_err("renaming", path))?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        sync_dir(dir);
    }
    Ok(())
}

/// Write and fsync the temporary document. Mode 0o600 on Unix.
fn write_temp(tmp: &Path, bytes: &[u8]) -> Result<(), HistoryError> {
    let mut f = open_for_write(tmp).map_err(io_err("creating", tmp))?;
    f.write_all(bytes).map_err(io_err("writing", tmp))?;
    f.sync_all().map_err(io_err("syncing", tmp))?;
    Ok(())
}

fn open_for_write(path: &Path) -> io::Result<File> {
    #[cfg(unix)]
    {
        fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .create(true)
            .mode(0o600)
            .open(path)
    }
    #[cfg(not(unix))]
    {
        File::create(path)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
