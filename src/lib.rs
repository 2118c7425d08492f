//! # jailrun
//!
//! **FreeBSD Jail Task Driver**
//!
//! This crate runs scheduler tasks as FreeBSD jails. It translates a task's
//! driver configuration into jail(8) parameters, optionally pulls a Docker
//! image into the jail root, applies rctl(8) resource limits, and tracks each
//! jail until it disappears.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            jailrun                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                       JailDriver                            │    │
//! │  │  start → inspect / exec / wait → stop → destroy, recover   │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │          │                    │                     │               │
//! │  ┌───────┴───────┐   ┌────────┴────────┐   ┌────────┴────────┐      │
//! │  │  Translation  │   │ Image Pipeline  │   │    Monitor      │      │
//! │  │ params, rctl  │   │ token, manifest │   │  jls polling    │      │
//! │  │               │   │ layers, hooks   │   │                 │      │
//! │  └───────┬───────┘   └────────┬────────┘   └────────┬────────┘      │
//! ├──────────┴────────────────────┴─────────────────────┴───────────────┤
//! │                 ProcessRunner / RegistryTransport                   │
//! │        jail · jls · rctl · jexec      Docker Registry v2 (HTTP)     │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! - **Path Traversal Protection**: layer extraction rejects `..` components
//!   and absolute paths (see [`extract::extract_layer`]).
//! - **Size Limits**: `MAX_ROOTFS_SIZE` bounds an unpacked image,
//!   `MAX_LAYERS` bounds a manifest and `MAX_OUTPUT_SIZE` bounds captured
//!   tool output.
//! - **Digest Verification**: every blob is hashed with SHA-256 and compared
//!   to its digest before it is unpacked.
//! - **Timeouts**: external tools run under `COMMAND_TIMEOUT`, registry
//!   requests under `REGISTRY_REQUEST_TIMEOUT`.
//! - **No Shell**: jail parameters are passed as argument vectors, never
//!   through `sh -c`.
//!
//! # Example
//!
//! ```rust,ignore
//! use jailrun::{DriverConfig, JailDriver, TaskConfig};
//!
//! #[tokio::main]
//! async fn main() -> jailrun::Result<()> {
//!     let driver = JailDriver::from_config(DriverConfig::from_env())?;
//!     let task = TaskConfig {
//!         id: "t1".into(),
//!         name: "web".into(),
//!         alloc_id: "abc".into(),
//!         alloc_dir: "/var/alloc/abc".into(),
//!         driver_config: serde_json::json!({
//!             "Docker": "library/nginx latest",
//!             "Rctl": { "Memoryuse": { "Action": "deny", "Amount": "512m" } },
//!         }),
//!     };
//!     let state = driver.start_task(task).await?;
//!     println!("{}", state.container_name);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod extract;
pub mod image;
pub mod jail;
pub mod monitor;
pub mod params;
pub mod process;
pub mod rctl;
pub mod registry;
pub mod spec;

// Re-exports
pub use config::{DriverConfig, RegistryConfig, ToolPaths};
pub use constants::*;
pub use driver::{
    Capabilities, DriverState, ExitResult, FsIsolation, JailDriver, TaskHandle, TaskState,
    TaskStatus,
};
pub use error::{Error, Result};
pub use image::{ImageHooks, ImagePuller, PullOptions, PulledImage};
pub use jail::{ExecResult, JailControl};
pub use monitor::{Clock, ContainerMonitor, IntervalTicker, SystemClock, Ticker, TickerFactory};
pub use params::{JailParams, ParamValue};
pub use process::{CommandOutput, CommandSpec, Launch, ProcessRunner, SystemRunner};
pub use rctl::{LimitRules, ResourceLimit};
pub use registry::{HttpRegistry, ImageReference, RegistryTransport};
pub use spec::{JailConfig, RctlOpts, RctlResource, TaskConfig};
