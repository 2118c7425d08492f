//! # Jail Driver Constants
//!
//! Defines the timeouts, tool names, registry endpoints and parameter names
//! used throughout the driver. These constants are the **single source of
//! truth** for defaults; [`DriverConfig`](crate::config::DriverConfig) starts
//! from them and lets operators override the ones that vary per host.
//!
//! ## Cross-References
//!
//! - [`crate::params`]: Uses the flag-only parameter names
//! - [`crate::monitor`]: Uses the monitor poll interval
//! - [`crate::registry`]: Uses registry endpoints and media types
//! - [`crate::driver`]: Uses grace periods and the task handle version

use std::time::Duration;

// =============================================================================
// Driver Identity
// =============================================================================

/// Name the driver reports to its host.
pub const PLUGIN_NAME: &str = "jail-task-driver";

/// Version of the persisted task handle this driver writes and understands.
///
/// Bump when [`DriverState`](crate::driver::DriverState) changes shape.
pub const TASK_HANDLE_VERSION: u32 = 1;

// =============================================================================
// Timeouts
// =============================================================================

/// Interval at which a monitor checks whether its jail is still listed.
///
/// **Rationale**: Exit detection latency is bounded below by this value.
/// `jls` is cheap, but polling faster than this gains nothing for
/// long-running services.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// Grace period used when a running task is force-destroyed.
///
/// The value is arbitrary; it is the delay before `jail -r` is issued.
pub const DESTROY_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Timeout applied to each invocation of `jail`, `jls` and `rctl`.
///
/// **Rationale**: `jail -c` runs `exec.prestart`/`exec.start` synchronously,
/// which may legitimately take a while; 5 minutes bounds a wedged hook.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for each registry request (token, manifest, blob).
pub const REGISTRY_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// External Tools
// =============================================================================

/// jail(8): create and remove jails.
pub const JAIL_BIN: &str = "jail";

/// jls(8): list active jails.
pub const JLS_BIN: &str = "jls";

/// rctl(8): apply resource limits.
pub const RCTL_BIN: &str = "rctl";

/// jexec(8): run a command inside a jail.
pub const JEXEC_BIN: &str = "jexec";

/// Flag set passed to `jail` on creation. `-c` creates, `-m` lets an
/// existing jail of the same name be modified instead of failing, and `-r`
/// (remove) combined with `-m` allows that jail to be restarted when a
/// parameter cannot be changed while it runs.
pub const JAIL_CREATE_FLAGS: &str = "-cmr";

/// Flag passed to `jail` to remove a jail.
pub const JAIL_REMOVE_FLAG: &str = "-r";

/// Flag passed to `rctl` to add a rule.
pub const RCTL_ADD_FLAG: &str = "-a";

/// Flag passed to `jls` to print parameters as `name=value` pairs.
pub const JLS_NAME_VALUE_FLAG: &str = "-n";

/// Maximum captured stdout/stderr per external command (1 MiB).
///
/// **Security**: A chatty `exec.start` would otherwise grow driver memory
/// without bound.
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// How long `jail -c` is watched for an early failure before it is left
/// running in the background.
///
/// `jail -c` stays in the foreground for as long as a non-daemonizing
/// `exec.start` runs, so creation cannot wait for it to exit.
pub const CREATE_SETTLE_PERIOD: Duration = Duration::from_secs(1);

// =============================================================================
// Registry Protocol
// =============================================================================

/// Default registry API base URL (Docker Hub).
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// Default token endpoint (Docker Hub).
pub const DEFAULT_AUTH_URL: &str = "https://auth.docker.io/token";

/// Service name passed to the token endpoint.
pub const DEFAULT_REGISTRY_SERVICE: &str = "registry.docker.io";

/// Registry host name that maps onto the Docker Hub endpoints.
pub const DOCKER_HUB_REGISTRY: &str = "docker.io";

/// Docker image manifest v2 media type requested from the registry.
pub const DOCKER_MANIFEST_V2_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

/// OCI image manifest media type, accepted alongside the Docker one.
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Tag used when an image reference carries none.
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Maximum image reference length in bytes.
///
/// **Security**: Bounds the strings that end up in URLs and directory names.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum number of layers accepted from a manifest.
///
/// **Security**: An image with thousands of layers would pin the start
/// operation for a very long time; 128 is generous for real images.
pub const MAX_LAYERS: usize = 128;

/// Maximum total unpacked size of an image rootfs (64 GiB).
///
/// **Security**: Bounds disk usage of a hostile image with a small
/// compressed size.
pub const MAX_ROOTFS_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Whiteout file prefix marking a deletion in an upper layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Whiteout marker hiding every lower-layer entry of its directory.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

// =============================================================================
// Linux Emulation Hooks
// =============================================================================

/// Interpreter prefix of the start command derived from an image config.
pub const IMAGE_START_PREFIX: &str = "/usr/bin/env";

/// Image OS that requires the linprocfs/linsysfs views inside the jail.
pub const LINUX_IMAGE_OS: &str = "linux";

// =============================================================================
// Jail Parameters
// =============================================================================

/// Default scratch subdirectory for layer downloads under the temp dir.
pub const SCRATCH_DIR_NAME: &str = "jailrun-scratch";

/// Jail names longer than this are rejected by the kernel.
pub const MAX_JAIL_NAME_LEN: usize = 255;

// =============================================================================
// Configuration Files
// =============================================================================

/// Maximum size of a driver config or workload file (1 MiB).
///
/// **Security**: Prevents YAML bombs from exhausting memory.
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Prefix of environment variables that override driver config values.
pub const ENV_PREFIX: &str = "JAILRUN_";
