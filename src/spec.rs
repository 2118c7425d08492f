//! Task and jail specification types.
//!
//! This module defines the inputs the driver receives from its scheduler:
//! - `TaskConfig`: scheduler-side identity of a task plus its raw driver config
//! - `JailConfig`: the decoded driver config (jail parameters, limits, image)
//! - `RctlResource` / `RctlOpts`: one resource-limit block per rctl category
//!
//! # Field Names
//!
//! `JailConfig` keeps the scheduler's field names (`Exec_start`, `Ip4_addr`,
//! `Rctl.Cputime.Amount`, ...) so a job file written for the scheduler
//! decodes unchanged. Misspellings that shipped in job files are accepted as
//! aliases.

use crate::constants::MAX_CONFIG_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// =============================================================================
// Task Configuration
// =============================================================================

/// Scheduler-provided task description.
///
/// Immutable once handed to the driver. The driver-specific part stays raw in
/// `driver_config` until [`TaskConfig::decode_driver_config`] is called, which
/// is where malformed job files surface as [`Error::Decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Unique task identifier (registry key).
    pub id: String,
    /// Task name within its allocation.
    pub name: String,
    /// Allocation identifier.
    pub alloc_id: String,
    /// Allocation working directory; default jail paths live below it.
    #[serde(default)]
    pub alloc_dir: PathBuf,
    /// Raw driver configuration block.
    #[serde(default)]
    pub driver_config: serde_json::Value,
}

impl TaskConfig {
    /// Returns the derived jail name `<task-name>-<alloc-id>`.
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.name, self.alloc_id)
    }

    /// Parses a workload file. The driver config block stays undecoded.
    pub fn from_yaml(yaml: &[u8]) -> Result<Self> {
        if yaml.len() > MAX_CONFIG_SIZE {
            return Err(Error::decode(
                "task config",
                format!("size {} exceeds limit of {}", yaml.len(), MAX_CONFIG_SIZE),
            ));
        }
        serde_yaml::from_slice(yaml).map_err(|e| Error::decode("task config", e))
    }

    /// Decodes the driver configuration block into a [`JailConfig`].
    pub fn decode_driver_config(&self) -> Result<JailConfig> {
        if self.driver_config.is_null() {
            return Ok(JailConfig::default());
        }
        serde_json::from_value(self.driver_config.clone())
            .map_err(|e| Error::decode("driver config", e))
    }
}

// =============================================================================
// Jail Configuration
// =============================================================================

/// Decoded driver configuration of a task.
///
/// Every field is optional. Strings are ignored when empty, booleans when
/// false and numbers when zero; see [`crate::params`] for how each field maps
/// onto a jail(8) parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JailConfig {
    #[serde(rename = "Path")]
    pub path: String,
    /// Image reference, `"repo tag"` or `"repo:tag"`.
    #[serde(rename = "Docker", alias = "Image")]
    pub image: String,
    #[serde(rename = "Jid")]
    pub jid: String,
    #[serde(rename = "Ip4_addr")]
    pub ip4_addr: String,
    #[serde(rename = "Ip4_saddrsel")]
    pub ip4_saddrsel: bool,
    #[serde(rename = "Ip4")]
    pub ip4: String,
    #[serde(rename = "Ip6_addr")]
    pub ip6_addr: String,
    #[serde(rename = "Ip6_saddrsel")]
    pub ip6_saddrsel: bool,
    #[serde(rename = "Ip6")]
    pub ip6: String,
    #[serde(rename = "Vnet")]
    pub vnet: String,
    #[serde(rename = "Host_hostname")]
    pub host_hostname: String,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Securelevel")]
    pub securelevel: String,
    #[serde(rename = "Devfs_ruleset")]
    pub devfs_ruleset: String,
    #[serde(rename = "Children_max")]
    pub children_max: u32,
    #[serde(rename = "Children_cur")]
    pub children_cur: u32,
    #[serde(rename = "Enforce_statfs")]
    pub enforce_statfs: u32,
    #[serde(rename = "Persist")]
    pub persist: bool,
    #[serde(rename = "Osrelease")]
    pub osrelease: String,
    #[serde(rename = "Osreldate")]
    pub osreldate: String,

    // -------------------------------------------------------------------------
    // allow.*
    // -------------------------------------------------------------------------
    #[serde(rename = "Allow_set_hostname")]
    pub allow_set_hostname: bool,
    #[serde(rename = "Allow_sysvipc")]
    pub allow_sysvipc: bool,
    #[serde(rename = "Allow_raw_sockets")]
    pub allow_raw_sockets: bool,
    #[serde(rename = "Allow_chflags")]
    pub allow_chflags: bool,
    #[serde(rename = "Allow_mount")]
    pub allow_mount: bool,
    #[serde(rename = "Allow_mount_devfs", alias = "Allow_mount.devfs")]
    pub allow_mount_devfs: bool,
    #[serde(rename = "Allow_quotas")]
    pub allow_quotas: bool,
    #[serde(rename = "Allow_read_msgbuf")]
    pub allow_read_msgbuf: bool,
    #[serde(rename = "Allow_socket_af")]
    pub allow_socket_af: bool,
    #[serde(rename = "Allow_reserved_ports")]
    pub allow_reserved_ports: bool,
    #[serde(rename = "Allow_mlock")]
    pub allow_mlock: bool,
    #[serde(rename = "Allow_mount_fdescfs")]
    pub allow_mount_fdescfs: bool,
    #[serde(rename = "Allow_mount_fusefs")]
    pub allow_mount_fusefs: bool,
    #[serde(rename = "Allow_mount_nullfs")]
    pub allow_mount_nullfs: bool,
    #[serde(rename = "Allow_mount_procfs")]
    pub allow_mount_procfs: bool,
    #[serde(rename = "Allow_mount_linprocfs")]
    pub allow_mount_linprocfs: bool,
    #[serde(rename = "Allow_mount_linsysfs")]
    pub allow_mount_linsysfs: bool,
    #[serde(rename = "Allow_mount_tmpfs")]
    pub allow_mount_tmpfs: bool,
    #[serde(rename = "Allow_mount_zfs")]
    pub allow_mount_zfs: bool,
    #[serde(rename = "Allow_vmm")]
    pub allow_vmm: bool,

    // -------------------------------------------------------------------------
    // Linux emulation and SysV IPC
    // -------------------------------------------------------------------------
    #[serde(rename = "Linux")]
    pub linux: String,
    #[serde(rename = "Linux_osname")]
    pub linux_osname: String,
    #[serde(rename = "Linux_osrelease")]
    pub linux_osrelease: String,
    #[serde(rename = "Linux_oss_version")]
    pub linux_oss_version: String,
    #[serde(rename = "Sysvmsg")]
    pub sysvmsg: String,
    #[serde(rename = "Sysvsem")]
    pub sysvsem: String,
    #[serde(rename = "Sysvshm")]
    pub sysvshm: String,

    // -------------------------------------------------------------------------
    // exec.*
    // -------------------------------------------------------------------------
    #[serde(rename = "Exec_prestart")]
    pub exec_prestart: String,
    #[serde(rename = "Exec_prestop")]
    pub exec_prestop: String,
    #[serde(rename = "Exec_created")]
    pub exec_created: String,
    #[serde(rename = "Exec_start")]
    pub exec_start: String,
    /// `command` pseudo-parameter; only used when `Exec_start` is empty.
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Exec_stop")]
    pub exec_stop: String,
    #[serde(rename = "Exec_poststart", alias = "Exec_postart")]
    pub exec_poststart: String,
    #[serde(rename = "Exec_poststop")]
    pub exec_poststop: String,
    #[serde(rename = "Exec_clean")]
    pub exec_clean: bool,
    #[serde(rename = "Exec_jail_user")]
    pub exec_jail_user: String,
    #[serde(rename = "Exec_system_jail_user")]
    pub exec_system_jail_user: String,
    #[serde(rename = "Exec_system_user")]
    pub exec_system_user: String,
    #[serde(rename = "Exec_timeout")]
    pub exec_timeout: u32,
    #[serde(rename = "Exec_consolelog")]
    pub exec_consolelog: String,
    #[serde(rename = "Exec_fib")]
    pub exec_fib: String,
    #[serde(rename = "Stop_timeout")]
    pub stop_timeout: u32,

    // -------------------------------------------------------------------------
    // Networking and mounts
    // -------------------------------------------------------------------------
    #[serde(rename = "Nic")]
    pub nic: String,
    #[serde(rename = "Vnet_nic")]
    pub vnet_nic: String,
    #[serde(rename = "Ip_hostname")]
    pub ip_hostname: String,
    #[serde(rename = "Mount")]
    pub mount: bool,
    #[serde(rename = "Mount_fstab")]
    pub mount_fstab: String,
    #[serde(rename = "Mount_devfs")]
    pub mount_devfs: bool,
    #[serde(rename = "Mount_fdescfs")]
    pub mount_fdescfs: bool,
    #[serde(rename = "Depend")]
    pub depend: String,

    /// Resource limits keyed by rctl category.
    #[serde(rename = "Rctl")]
    pub rctl: BTreeMap<RctlResource, RctlOpts>,
}

impl JailConfig {
    /// Returns true if an image reference is configured.
    pub fn has_image(&self) -> bool {
        !self.image.trim().is_empty()
    }
}

// =============================================================================
// Resource Limits
// =============================================================================

/// One `Rctl` block: action, human-readable amount and optional period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RctlOpts {
    /// rctl action (`deny`, `log`, `devctl`, `sigterm`, `throttle`, ...).
    #[serde(rename = "Action")]
    pub action: String,
    /// Amount in `expand_number(3)` notation (`512M`, `1G`, `0x10`, ...).
    #[serde(rename = "Amount")]
    pub amount: String,
    /// Optional period divisor (`s`, `m`, `h`, `d`, `process`, ...).
    #[serde(rename = "Per")]
    pub per: String,
}

/// rctl resource categories accepted in the `Rctl` block.
///
/// Ordering follows declaration order; compiled rules are emitted in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RctlResource {
    Cputime,
    Datasize,
    Stacksize,
    Coredumpsize,
    Memoryuse,
    Memorylocked,
    Maxproc,
    Openfiles,
    Vmemoryuse,
    Pseudoterminals,
    Swapuse,
    Nthr,
    Msgqqueued,
    Msgqsize,
    Nmsgq,
    Nsem,
    Nsemop,
    Nshm,
    Shmsize,
    Wallclock,
    Pcpu,
    Readbps,
    Writebps,
    Readiops,
    Writeiops,
}

impl RctlResource {
    /// Every category, in rule emission order.
    pub const ALL: [RctlResource; 25] = [
        Self::Cputime,
        Self::Datasize,
        Self::Stacksize,
        Self::Coredumpsize,
        Self::Memoryuse,
        Self::Memorylocked,
        Self::Maxproc,
        Self::Openfiles,
        Self::Vmemoryuse,
        Self::Pseudoterminals,
        Self::Swapuse,
        Self::Nthr,
        Self::Msgqqueued,
        Self::Msgqsize,
        Self::Nmsgq,
        Self::Nsem,
        Self::Nsemop,
        Self::Nshm,
        Self::Shmsize,
        Self::Wallclock,
        Self::Pcpu,
        Self::Readbps,
        Self::Writebps,
        Self::Readiops,
        Self::Writeiops,
    ];

    /// Returns the rctl(8) resource name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cputime => "cputime",
            Self::Datasize => "datasize",
            Self::Stacksize => "stacksize",
            Self::Coredumpsize => "coredumpsize",
            Self::Memoryuse => "memoryuse",
            Self::Memorylocked => "memorylocked",
            Self::Maxproc => "maxproc",
            Self::Openfiles => "openfiles",
            Self::Vmemoryuse => "vmemoryuse",
            Self::Pseudoterminals => "pseudoterminals",
            Self::Swapuse => "swapuse",
            Self::Nthr => "nthr",
            Self::Msgqqueued => "msgqqueued",
            Self::Msgqsize => "msgqsize",
            Self::Nmsgq => "nmsgq",
            Self::Nsem => "nsem",
            Self::Nsemop => "nsemop",
            Self::Nshm => "nshm",
            Self::Shmsize => "shmsize",
            Self::Wallclock => "wallclock",
            Self::Pcpu => "pcpu",
            Self::Readbps => "readbps",
            Self::Writebps => "writebps",
            Self::Readiops => "readiops",
            Self::Writeiops => "writeiops",
        }
    }
}

impl std::fmt::Display for RctlResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
