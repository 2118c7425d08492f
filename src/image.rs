//! # Image Acquisition Pipeline
//!
//! Turns an image reference into a populated jail root plus the commands the
//! jail needs to run it.
//!
//! ## Pipeline
//!
//! ```text
//! token ──► manifest ──► dedup digests ──► per layer: fetch ─► verify ─► extract
//!                                                                        │
//!                   hooks ◄── derive start command ◄── config blob ◄─────┘
//! ```
//!
//! Every step is a hard stop: the first failure aborts the pull, nothing is
//! retried. Each network step races the caller's [`CancellationToken`].
//!
//! ## Scratch Files
//!
//! Layers are downloaded to `<scratch_dir>/<uuid>.layer`, verified against
//! their `sha256:` digest, extracted and deleted. A layer digest listed twice
//! in a manifest is fetched once.
//!
//! ## Cleanup
//!
//! If the pull created the target directory and then fails, the partially
//! populated directory is removed before the error is returned. A target
//! that existed beforehand is left alone.
//!
//! ## Start Command
//!
//! The image config's `Entrypoint`, `Env` and `Cmd` are flattened into
//! shell words and combined as `/usr/bin/env <env> <entrypoint> <cmd>`; the
//! jail runs `exec.start` through `/bin/sh -c`. Linux images additionally get
//! `exec.prestart`/`exec.stop` hooks mounting linsysfs and linprocfs.

use crate::constants::{IMAGE_START_PREFIX, LINUX_IMAGE_OS, MAX_LAYERS, MAX_ROOTFS_SIZE};
use crate::error::{Error, Result};
use crate::extract;
use crate::registry::{ImageManifest, ImageReference, RegistryTransport};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// Public Types
// =============================================================================

/// Commands derived from an image for the jail's exec hooks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageHooks {
    /// `exec.start` candidate; empty if the image defines no command.
    pub start: String,
    /// `exec.prestart` candidate.
    pub prestart: String,
    /// `exec.stop` candidate.
    pub stop: String,
}

/// Options of a single pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullOptions {
    /// Also write `<target>.tar.gz` of the assembled root.
    pub repackage: bool,
}

/// Result of a successful pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledImage {
    pub reference: ImageReference,
    pub rootfs: PathBuf,
    /// Unique layer digests, in the order they were applied.
    pub layers: Vec<String>,
    /// `os` field of the image config, if present.
    pub os: Option<String>,
    pub hooks: ImageHooks,
    /// Repackaged archive, if requested.
    pub archive: Option<PathBuf>,
}

// =============================================================================
// Image Config Document
// =============================================================================

/// The parts of an image configuration blob the driver reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub config: Option<ContainerConfig>,
    /// Config of the build step that produced the image; older images only
    /// carry the command here.
    #[serde(default)]
    pub container_config: Option<ContainerConfig>,
}

/// Runtime defaults recorded in an image config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
}

impl ImageConfig {
    /// Parses a config blob.
    pub fn from_slice(bytes: &[u8], digest: &str) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::BlobFetchFailed {
            digest: digest.to_string(),
            reason: format!("invalid image config: {}", e),
        })
    }

    /// Builds `/usr/bin/env <env> <entrypoint> <cmd>`.
    ///
    /// Returns an empty string if the image has neither entrypoint nor cmd.
    pub fn start_command(&self) -> String {
        let (entrypoint, env, cmd) = match (&self.config, &self.container_config) {
            (Some(runtime), _) => (
                shell_join(runtime.entrypoint.as_deref()),
                shell_join(runtime.env.as_deref()),
                shell_join(runtime.cmd.as_deref()),
            ),
            (None, Some(build)) => (
                shell_join(build.entrypoint.as_deref()),
                shell_join(build.env.as_deref()),
                build_step_cmd(build.cmd.as_deref()),
            ),
            (None, None) => return String::new(),
        };

        if entrypoint.is_empty() && cmd.is_empty() {
            return String::new();
        }

        [IMAGE_START_PREFIX, env.as_str(), entrypoint.as_str(), cmd.as_str()]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Returns true if the image needs the Linux emulation mounts.
    ///
    /// Images that do not record an OS are assumed to be Linux.
    pub fn is_linux(&self) -> bool {
        match self.os.as_deref() {
            None | Some("") => true,
            Some(os) => os == LINUX_IMAGE_OS,
        }
    }

    /// Derives the exec hooks for a jail rooted at `path`.
    pub fn hooks(&self, path: &Path) -> ImageHooks {
        let mut hooks = ImageHooks {
            start: self.start_command(),
            ..ImageHooks::default()
        };
        if self.is_linux() {
            let path = path.display();
            hooks.prestart = format!(
                "mount -t linsysfs linsysfs {path}/sys; mount -t linprocfs linprocfs {path}/proc"
            );
            hooks.stop = format!("umount {path}/sys; umount {path}/proc");
        }
        hooks
    }
}

/// Joins list items into shell words, quoting where needed.
fn shell_join(items: Option<&[String]>) -> String {
    items
        .unwrap_or_default()
        .iter()
        .map(|item| shell_quote(item))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Extracts the command from a build step like
/// `["/bin/sh", "-c", "#(nop) ", "CMD [\"nginx\" \"-g\" \"daemon off;\"]"]`.
fn build_step_cmd(items: Option<&[String]>) -> String {
    let items = items.unwrap_or_default();
    match items.iter().find_map(|item| item.split_once("CMD")) {
        Some((_, rest)) => rest.replace(['[', ']'], "").trim().to_string(),
        None => shell_join(Some(items)),
    }
}

// =============================================================================
// Puller
// =============================================================================

/// Pulls images into jail roots.
pub struct ImagePuller {
    transport: Arc<dyn RegistryTransport>,
    scratch_dir: PathBuf,
}

impl ImagePuller {
    pub fn new(transport: Arc<dyn RegistryTransport>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Pulls `reference` into `target`.
    ///
    /// # Errors
    ///
    /// - [`Error::TokenFetchFailed`], [`Error::ManifestFetchFailed`],
    ///   [`Error::ConfigBlobMissing`], [`Error::BlobFetchFailed`] from the
    ///   registry steps
    /// - [`Error::ExtractionFailed`] / [`Error::PathTraversal`] from layers
    /// - [`Error::Cancelled`] if `cancel` fires first
    pub async fn pull(
        &self,
        reference: &ImageReference,
        target: &Path,
        options: PullOptions,
        cancel: &CancellationToken,
    ) -> Result<PulledImage> {
        // Only a target this pull creates is removed on failure.
        let created = !tokio::fs::try_exists(target).await?;

        info!("Pulling image: {}", reference);
        match self.pull_into(reference, target, options, cancel).await {
            Ok(image) => {
                info!(
                    "Pulled {} into {} ({} layers)",
                    reference,
                    target.display(),
                    image.layers.len()
                );
                Ok(image)
            }
            Err(e) => {
                if created && let Err(cleanup) = tokio::fs::remove_dir_all(target).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            "failed to remove partial rootfs {}: {}",
                            target.display(),
                            cleanup
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn pull_into(
        &self,
        reference: &ImageReference,
        target: &Path,
        options: PullOptions,
        cancel: &CancellationToken,
    ) -> Result<PulledImage> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        tokio::fs::create_dir_all(target).await?;

        let token = cancellable(cancel, "token", self.transport.token(reference)).await?;
        let token = token.as_deref();

        let body = cancellable(cancel, "manifest", self.transport.manifest(reference, token)).await?;
        let manifest = ImageManifest::from_slice(&body, reference)?;
        let config_digest = manifest.config_digest(reference)?.to_string();

        if manifest.layers.len() > MAX_LAYERS {
            return Err(Error::ManifestFetchFailed {
                reference: reference.to_string(),
                reason: format!("too many layers: {} > {}", manifest.layers.len(), MAX_LAYERS),
            });
        }

        let mut seen = HashSet::new();
        let layers: Vec<String> = manifest
            .layer_digests()
            .filter(|d| seen.insert(*d))
            .map(str::to_string)
            .collect();
        debug!(
            "{}: {} layers, {} unique",
            reference,
            manifest.layers.len(),
            layers.len()
        );

        let mut budget = MAX_ROOTFS_SIZE;
        for digest in &layers {
            let scratch = self.fetch_verified(reference, digest, token, cancel).await?;

            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("extract {}", digest)));
            }
            let archive = scratch.path.clone();
            let rootfs = target.to_path_buf();
            let layer = digest.clone();
            let used = tokio::task::spawn_blocking(move || {
                extract::extract_layer(&archive, &layer, &rootfs, budget)
            })
            .await
            .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))??;
            budget -= used;
        }

        let config_file = self
            .fetch_verified(reference, &config_digest, token, cancel)
            .await?;
        let bytes = tokio::fs::read(&config_file.path).await?;
        let config = ImageConfig::from_slice(&bytes, &config_digest)?;

        if config.is_linux() {
            for dir in ["sys", "proc"] {
                tokio::fs::create_dir_all(target.join(dir)).await?;
            }
        }
        let hooks = config.hooks(target);

        let archive = if options.repackage {
            let dest = archive_path(target);
            let (rootfs, out) = (target.to_path_buf(), dest.clone());
            tokio::task::spawn_blocking(move || extract::repackage(&rootfs, &out))
                .await
                .map_err(|e| Error::Internal(format!("repackage task failed: {}", e)))??;
            Some(dest)
        } else {
            None
        };

        Ok(PulledImage {
            reference: reference.clone(),
            rootfs: target.to_path_buf(),
            layers,
            os: config.os.clone(),
            hooks,
            archive,
        })
    }

    /// Downloads a blob to a fresh scratch file and checks its digest.
    async fn fetch_verified(
        &self,
        reference: &ImageReference,
        digest: &str,
        token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ScratchFile> {
        let scratch = ScratchFile::new(
            self.scratch_dir
                .join(format!("{}.layer", uuid::Uuid::now_v7())),
        );

        let size = cancellable(
            cancel,
            "blob",
            self.transport.blob(reference, digest, token, &scratch.path),
        )
        .await?;
        debug!("fetched {} ({} bytes)", digest, size);

        let path = scratch.path.clone();
        let expected = digest.to_string();
        tokio::task::spawn_blocking(move || verify_digest(&path, &expected))
            .await
            .map_err(|e| Error::Internal(format!("digest task failed: {}", e)))??;

        Ok(scratch)
    }
}

/// Races `fut` against `cancel`.
async fn cancellable<T>(
    cancel: &CancellationToken,
    step: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled(step.to_string())),
        result = fut => result,
    }
}

/// Verifies a downloaded blob against a `sha256:` digest.
///
/// Digests using other algorithms are accepted unverified.
fn verify_digest(path: &Path, digest: &str) -> Result<()> {
    let Some(expected) = digest.strip_prefix("sha256:") else {
        debug!("not verifying {}: unsupported digest algorithm", digest);
        return Ok(());
    };

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let actual = hex::encode(hasher.finalize());
    if actual != expected {
        return Err(Error::BlobFetchFailed {
            digest: digest.to_string(),
            reason: format!("digest mismatch: got sha256:{}", actual),
        });
    }
    Ok(())
}

fn archive_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".tar.gz");
    PathBuf::from(name)
}

/// Scratch download removed when dropped.
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to remove scratch file {}: {}", self.path.display(), e);
        }
    }
}
