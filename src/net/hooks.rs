//! Decisions the host application makes for the transfer engine.
//!
//! Both hooks are synchronous; the engine calls them from a blocking task so
//! a presentation layer may show a dialog and wait for the user.

use std::fmt;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::session::TransferRequest;

/// Answer to an incoming transfer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject { reason: String },
}

impl Decision {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }
}

/// Decides whether an incoming transfer may proceed.
pub trait AcceptTransfer: Send + Sync + 'static {
    fn accept_transfer(&self, request: &TransferRequest) -> Decision;
}

impl<F> AcceptTransfer for F
where
    F: Fn(&TransferRequest) -> Decision + Send + Sync + 'static,
{
    fn accept_transfer(&self, request: &TransferRequest) -> Decision {
        self(request)
    }
}

/// Accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAccept;

impl AcceptTransfer for AutoAccept {
    fn accept_transfer(&self, _request: &TransferRequest) -> Decision {
        Decision::Accept
    }
}

/// Chooses where an accepted file is written.
pub trait ResolveSavePath: Send + Sync + 'static {
    fn resolve_save_path(&self, request: &TransferRequest) -> std::io::Result<PathBuf>;
}

impl<F> ResolveSavePath for F
where
    F: Fn(&TransferRequest) -> std::io::Result<PathBuf> + Send + Sync + 'static,
{
    fn resolve_save_path(&self, request: &TransferRequest) -> std::io::Result<PathBuf> {
        self(request)
    }
}

/// Saves into one directory without ever overwriting: `photo.jpg`,
/// `photo (1).jpg`, `photo (2).jpg`, ...
///
/// The chosen path is claimed by creating an empty file, so two concurrent
/// receptions of the same name cannot pick the same destination.
#[derive(Debug, Clone)]
pub struct DownloadDir {
    dir: PathBuf,
}

/// Upper bound on `name (n).ext` probes before giving up.
const MAX_NAME_PROBES: u32 = 10_000;

impl DownloadDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ResolveSavePath for DownloadDir {
    fn resolve_save_path(&self, request: &TransferRequest) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let name = sanitize_file_name(&request.offer.file_name);
        let (stem, ext) = split_extension(&name);

        for n in 0..MAX_NAME_PROBES {
            let candidate = match n {
                0 => self.dir.join(&name),
                n => self.dir.join(format!("{stem} ({n}){ext}")),
            };
            match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                Ok(_) => {
                    debug!(path = %candidate.display(), "Claimed save path");
                    return Ok(candidate);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free name for {name} in {}", self.dir.display()),
        ))
    }
}

/// Reduces a peer-supplied name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .unwrap_or("");
    let cleaned: String = last
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();
    match cleaned.trim() {
        "" | "." | ".." => "unnamed".to_owned(),
        trimmed => trimmed.to_owned(),
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(idx) => name.split_at(idx),
    }
}

/// The two hooks bundled for the transfer manager.
#[derive(Clone)]
pub struct Hooks {
    pub accept: Arc<dyn AcceptTransfer>,
    pub save_path: Arc<dyn ResolveSavePath>,
}

impl Hooks {
    pub fn new(accept: impl AcceptTransfer, save_path: impl ResolveSavePath) -> Self {
        Self {
            accept: Arc::new(accept),
            save_path: Arc::new(save_path),
        }
    }

    /// Auto-accept into `dir`.
    pub fn auto_accept(dir: impl Into<PathBuf>) -> Self {
        Self::new(AutoAccept, DownloadDir::new(dir))
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}
