//! # Jail Parameter Translation
//!
//! Maps a decoded [`JailConfig`] onto the ordered `key=value` / bare-flag
//! arguments of `jail -c`.
//!
//! ## Field Table
//!
//! Most fields follow one of three rules, so they are described declaratively
//! in [`FIELD_TABLE`] instead of one `if` per field:
//!
//! | Kind      | Emitted when       | Form           |
//! |-----------|--------------------|----------------|
//! | `Text`    | non-empty          | `key=value`    |
//! | `Flag`    | `true`             | `key`          |
//! | `Count`   | strictly positive  | `key=<decimal>`|
//!
//! Identity (`name`, `host.hostname`, `path`) and the start command are
//! handled outside the table because they have defaults and precedence.
//!
//! ## Flag-Only Parameters
//!
//! Some jail(8) parameters take no value at all. [`JailParams::insert`]
//! special-cases them by name ([`FLAG_ONLY_PARAMS`]), so a text field such as
//! `Vnet` still comes out as a bare `vnet`.
//!
//! ## Start Command Precedence
//!
//! 1. `Exec_start`, or the image-derived start command when it is empty
//! 2. `Command`
//! 3. `Persist`
//!
//! Without any of them the jail would be created and immediately torn down,
//! so translation fails with [`Error::MissingStartCommand`].

use crate::error::{Error, Result};
use crate::image::ImageHooks;
use crate::spec::{JailConfig, TaskConfig};
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

/// Parameter names that never take a value.
pub const FLAG_ONLY_PARAMS: &[&str] = &[
    "ip4.saddrsel",
    "ip6.saddrsel",
    "nopersist",
    "exec.system_jail_user",
    "exec.clean",
    "vnet",
    "mount.devfs",
    "mount.fdescfs",
    "persist",
];

/// Returns true if `key` must be emitted as a bare flag.
pub fn is_flag_only(key: &str) -> bool {
    key.starts_with("allow.") || FLAG_ONLY_PARAMS.contains(&key)
}

// =============================================================================
// Parameter Set
// =============================================================================

/// Value of one jail parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    /// Emitted as the bare key.
    Flag,
    /// Emitted as `key=value`.
    Value(String),
}

/// Insertion-ordered jail parameters. Each key appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JailParams {
    entries: Vec<(String, ParamValue)>,
}

impl JailParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `key`, replacing an existing entry in place.
    ///
    /// Flag-only keys are stored as [`ParamValue::Flag`] whatever was passed.
    pub fn insert(&mut self, key: &str, value: ParamValue) {
        let value = if is_flag_only(key) {
            ParamValue::Flag
        } else {
            value
        };
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    /// Inserts `key=value`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.insert(key, ParamValue::Value(value.into()));
    }

    /// Inserts the bare flag `key`.
    pub fn flag(&mut self, key: &str) {
        self.insert(key, ParamValue::Flag);
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Returns the value of `key` if it is a valued parameter.
    pub fn value(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(ParamValue::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Renders the parameters as `jail(8)` arguments, in insertion order.
    pub fn to_args(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(key, value)| match value {
                ParamValue::Flag => key.clone(),
                ParamValue::Value(v) => format!("{}={}", key, v),
            })
            .collect()
    }
}

impl fmt::Display for JailParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_args().join(" "))
    }
}

// =============================================================================
// Field Table
// =============================================================================

/// How a config field turns into a parameter.
#[derive(Clone, Copy)]
pub enum FieldKind {
    Text(fn(&JailConfig) -> &str),
    Flag(fn(&JailConfig) -> bool),
    /// Boolean emitted as `key=true`, for parameters jail(8) reads a value for.
    Switch(fn(&JailConfig) -> bool),
    Count(fn(&JailConfig) -> u32),
}

/// One row of the field table.
#[derive(Clone, Copy)]
pub struct FieldRule {
    pub param: &'static str,
    pub kind: FieldKind,
}

const fn text(param: &'static str, get: fn(&JailConfig) -> &str) -> FieldRule {
    FieldRule {
        param,
        kind: FieldKind::Text(get),
    }
}

const fn flag(param: &'static str, get: fn(&JailConfig) -> bool) -> FieldRule {
    FieldRule {
        param,
        kind: FieldKind::Flag(get),
    }
}

const fn switch(param: &'static str, get: fn(&JailConfig) -> bool) -> FieldRule {
    FieldRule {
        param,
        kind: FieldKind::Switch(get),
    }
}

const fn count(param: &'static str, get: fn(&JailConfig) -> u32) -> FieldRule {
    FieldRule {
        param,
        kind: FieldKind::Count(get),
    }
}

/// Config fields in emission order.
pub static FIELD_TABLE: &[FieldRule] = &[
    text("jid", |c| c.jid.as_str()),
    text("ip4.addr", |c| c.ip4_addr.as_str()),
    flag("ip4.saddrsel", |c| c.ip4_saddrsel),
    text("ip4", |c| c.ip4.as_str()),
    text("ip6.addr", |c| c.ip6_addr.as_str()),
    flag("ip6.saddrsel", |c| c.ip6_saddrsel),
    text("ip6", |c| c.ip6.as_str()),
    text("vnet", |c| c.vnet.as_str()),
    text("host.hostname", |c| c.host_hostname.as_str()),
    text("host", |c| c.host.as_str()),
    text("securelevel", |c| c.securelevel.as_str()),
    text("devfs_ruleset", |c| c.devfs_ruleset.as_str()),
    count("children.max", |c| c.children_max),
    count("children.cur", |c| c.children_cur),
    count("enforce_statfs", |c| c.enforce_statfs),
    text("osrelease", |c| c.osrelease.as_str()),
    text("osreldate", |c| c.osreldate.as_str()),
    flag("allow.set_hostname", |c| c.allow_set_hostname),
    flag("allow.sysvipc", |c| c.allow_sysvipc),
    flag("allow.raw_sockets", |c| c.allow_raw_sockets),
    flag("allow.chflags", |c| c.allow_chflags),
    flag("allow.mount", |c| c.allow_mount),
    flag("allow.mount.devfs", |c| c.allow_mount_devfs),
    flag("allow.quotas", |c| c.allow_quotas),
    flag("allow.read_msgbuf", |c| c.allow_read_msgbuf),
    flag("allow.socket_af", |c| c.allow_socket_af),
    flag("allow.reserved_ports", |c| c.allow_reserved_ports),
    flag("allow.mlock", |c| c.allow_mlock),
    flag("allow.mount.fdescfs", |c| c.allow_mount_fdescfs),
    flag("allow.mount.fusefs", |c| c.allow_mount_fusefs),
    flag("allow.mount.nullfs", |c| c.allow_mount_nullfs),
    flag("allow.mount.procfs", |c| c.allow_mount_procfs),
    flag("allow.mount.linprocfs", |c| c.allow_mount_linprocfs),
    flag("allow.mount.linsysfs", |c| c.allow_mount_linsysfs),
    flag("allow.mount.tmpfs", |c| c.allow_mount_tmpfs),
    flag("allow.mount.zfs", |c| c.allow_mount_zfs),
    flag("allow.vmm", |c| c.allow_vmm),
    text("linux", |c| c.linux.as_str()),
    text("linux.osname", |c| c.linux_osname.as_str()),
    text("linux.osrelease", |c| c.linux_osrelease.as_str()),
    text("linux.oss_version", |c| c.linux_oss_version.as_str()),
    text("sysvmsg", |c| c.sysvmsg.as_str()),
    text("sysvsem", |c| c.sysvsem.as_str()),
    text("sysvshm", |c| c.sysvshm.as_str()),
    text("exec.prestart", |c| c.exec_prestart.as_str()),
    text("exec.prestop", |c| c.exec_prestop.as_str()),
    text("exec.created", |c| c.exec_created.as_str()),
    text("exec.poststart", |c| c.exec_poststart.as_str()),
    text("exec.stop", |c| c.exec_stop.as_str()),
    text("exec.poststop", |c| c.exec_poststop.as_str()),
    flag("exec.clean", |c| c.exec_clean),
    text("exec.jail_user", |c| c.exec_jail_user.as_str()),
    text("exec.system_jail_user", |c| c.exec_system_jail_user.as_str()),
    text("exec.system_user", |c| c.exec_system_user.as_str()),
    count("exec.timeout", |c| c.exec_timeout),
    text("exec.consolelog", |c| c.exec_consolelog.as_str()),
    text("exec.fib", |c| c.exec_fib.as_str()),
    count("stop.timeout", |c| c.stop_timeout),
    text("interface", |c| c.nic.as_str()),
    text("vnet.interface", |c| c.vnet_nic.as_str()),
    text("ip_hostname", |c| c.ip_hostname.as_str()),
    switch("mount", |c| c.mount),
    text("mount.fstab", |c| c.mount_fstab.as_str()),
    flag("mount.devfs", |c| c.mount_devfs),
    flag("mount.fdescfs", |c| c.mount_fdescfs),
    text("depend", |c| c.depend.as_str()),
];

// =============================================================================
// Translation
// =============================================================================

/// Returns the jail root: `Path` if set, else `<alloc_dir>/<task-name>`.
pub fn jail_path(task: &TaskConfig, config: &JailConfig) -> PathBuf {
    if config.path.is_empty() {
        task.alloc_dir.join(&task.name)
    } else {
        PathBuf::from(&config.path)
    }
}

/// Fails with [`Error::MissingStartCommand`] unless the jail has something
/// to keep it alive.
///
/// `has_image` counts as a start command since the image config supplies one.
pub fn check_start_command(name: &str, config: &JailConfig, has_image: bool) -> Result<()> {
    if !config.exec_start.is_empty() || has_image || !config.command.is_empty() || config.persist
    {
        return Ok(());
    }
    Err(Error::MissingStartCommand {
        name: name.to_string(),
    })
}

/// Translates a task into the parameters of `jail -c`.
///
/// `hooks` are the image-derived commands; they only fill fields the config
/// leaves empty.
pub fn translate(
    task: &TaskConfig,
    config: &JailConfig,
    hooks: Option<&ImageHooks>,
) -> Result<JailParams> {
    let name = task.container_name();
    let mut params = JailParams::new();

    params.set("name", &name);
    params.set("host.hostname", &name);
    params.set("path", jail_path(task, config).to_string_lossy());

    for rule in FIELD_TABLE {
        match rule.kind {
            FieldKind::Text(get) => {
                let value = get(config);
                if !value.is_empty() {
                    params.set(rule.param, value);
                }
            }
            FieldKind::Flag(get) => {
                if get(config) {
                    params.flag(rule.param);
                }
            }
            FieldKind::Switch(get) => {
                if get(config) {
                    params.set(rule.param, "true");
                }
            }
            FieldKind::Count(get) => {
                let value = get(config);
                if value > 0 {
                    params.set(rule.param, value.to_string());
                }
            }
        }
    }

    if let Some(hooks) = hooks {
        if config.exec_prestart.is_empty() && !hooks.prestart.is_empty() {
            params.set("exec.prestart", &hooks.prestart);
        }
        if config.exec_stop.is_empty() && !hooks.stop.is_empty() {
            params.set("exec.stop", &hooks.stop);
        }
    }

    let image_start = hooks.map(|h| h.start.as_str()).unwrap_or_default();
    let exec_start = if config.exec_start.is_empty() {
        image_start
    } else {
        config.exec_start.as_str()
    };

    if !exec_start.is_empty() {
        if !config.command.is_empty() {
            warn!(
                "jail {}: Command {:?} ignored in favour of exec.start",
                name, config.command
            );
        }
        params.set("exec.start", exec_start);
    } else if !config.command.is_empty() {
        params.set("command", &config.command);
    } else if !config.persist {
        return Err(Error::MissingStartCommand { name });
    }

    if config.persist {
        params.flag("persist");
    }

    Ok(params)
}
