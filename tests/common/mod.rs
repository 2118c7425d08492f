//! Shared fixtures for integration tests.
//!
//! - `FakeJailHost`: in-memory stand-in for jail/jls/rctl/jexec
//! - `FakeRegistry`: serves one image from memory and counts blob fetches
//! - `Ticks` / `FixedClock`: step monitors deterministically

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use jailrun::monitor::{Clock, Ticker, TickerFactory};
use jailrun::process::{CommandOutput, CommandSpec, Launch, ProcessRunner};
use jailrun::registry::{ImageReference, RegistryTransport};
use jailrun::{DriverConfig, Error, JailDriver, Result, TaskConfig};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// Fake Jail Host
// =============================================================================

#[derive(Default)]
struct HostState {
    active: BTreeSet<String>,
    calls: Vec<CommandSpec>,
    failing: HashMap<String, i32>,
}

/// Simulates the jail tools against an in-memory set of active jails.
///
/// `jail -cmr ... name=<x> ...` adds `x`, `jail -r x` removes it, and
/// `jls -n name` lists what is active. A program marked failing exits with
/// the given code and leaves the state untouched.
#[derive(Default)]
pub struct FakeJailHost {
    state: Mutex<HostState>,
}

impl FakeJailHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every call to `program` exit with `code` until cleared.
    pub fn fail(&self, program: &str, code: i32) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(program.to_string(), code);
    }

    pub fn clear_failure(&self, program: &str) {
        self.state.lock().unwrap().failing.remove(program);
    }

    /// Marks a jail as running without a `jail -c` call.
    pub fn add_jail(&self, name: &str) {
        self.state.lock().unwrap().active.insert(name.to_string());
    }

    /// Simulates the jail going away on its own.
    pub fn kill_jail(&self, name: &str) {
        self.state.lock().unwrap().active.remove(name);
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.state.lock().unwrap().active.contains(name)
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    /// Yields until `program` has been called at least `count` times.
    pub async fn wait_for_calls(&self, program: &str, count: usize) {
        for _ in 0..1000 {
            if self.calls_to(program).len() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("{} was not called {} times", program, count);
    }

    fn run(&self, command: &CommandSpec) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        state.calls.push(command.clone());

        if let Some(code) = state.failing.get(&command.program) {
            let mut output = CommandOutput::with_code(*code);
            output.stderr = format!("{}: simulated failure", command.program).into_bytes();
            return output;
        }

        let mut output = CommandOutput::with_code(0);
        match command.program.as_str() {
            "jail" if command.args.first().map(String::as_str) == Some("-cmr") => {
                if let Some(name) = command.args.iter().find_map(|a| a.strip_prefix("name=")) {
                    state.active.insert(name.to_string());
                }
            }
            "jail" if command.args.first().map(String::as_str) == Some("-r") => {
                let name = command.args.get(1).cloned().unwrap_or_default();
                if !state.active.remove(&name) {
                    output = CommandOutput::with_code(1);
                    output.stderr = format!("jail: \"{}\" not found", name).into_bytes();
                }
            }
            "jls" => {
                output.stdout = state
                    .active
                    .iter()
                    .map(|name| format!("name={}\n", name))
                    .collect::<String>()
                    .into_bytes();
            }
            "jexec" => {
                output.stdout = command.args[1..].join(" ").into_bytes();
            }
            _ => {}
        }
        output
    }
}

#[async_trait]
impl ProcessRunner for FakeJailHost {
    async fn output(&self, command: &CommandSpec, _timeout: Duration) -> Result<CommandOutput> {
        Ok(self.run(command))
    }

    async fn launch(&self, command: &CommandSpec, _settle: Duration) -> Result<Launch> {
        Ok(Launch::Exited(self.run(command)))
    }
}

// =============================================================================
// Fake Registry
// =============================================================================

/// Serves a single image for every reference.
#[derive(Default)]
pub struct FakeRegistry {
    manifest: Vec<u8>,
    blobs: HashMap<String, Vec<u8>>,
    fetches: Mutex<HashMap<String, usize>>,
    token_calls: Mutex<usize>,
    fail_token: bool,
}

impl FakeRegistry {
    /// Image made of `layers` (in manifest order) and config `config_json`.
    pub fn with_image(layers: &[Vec<u8>], config_json: &str) -> Self {
        let mut blobs = HashMap::new();
        let config_digest = digest(config_json.as_bytes());
        blobs.insert(config_digest.clone(), config_json.as_bytes().to_vec());

        let mut layer_descriptors = Vec::new();
        for layer in layers {
            let layer_digest = digest(layer);
            layer_descriptors.push(serde_json::json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": layer.len(),
                "digest": layer_digest,
            }));
            blobs.insert(layer_digest, layer.clone());
        }

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": config_json.len(),
                "digest": config_digest,
            },
            "layers": layer_descriptors,
        });

        Self {
            manifest: serde_json::to_vec(&manifest).unwrap(),
            blobs,
            ..Self::default()
        }
    }

    /// Raw manifest body served for every reference.
    pub fn with_manifest(manifest: &str) -> Self {
        Self {
            manifest: manifest.as_bytes().to_vec(),
            ..Self::default()
        }
    }

    pub fn failing_token(mut self) -> Self {
        self.fail_token = true;
        self
    }

    /// Replaces the content served for `digest`.
    pub fn corrupt_blob(mut self, digest: &str) -> Self {
        self.blobs.insert(digest.to_string(), b"corrupted".to_vec());
        self
    }

    pub fn fetch_count(&self, digest: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .get(digest)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }

    pub fn token_calls(&self) -> usize {
        *self.token_calls.lock().unwrap()
    }
}

#[async_trait]
impl RegistryTransport for FakeRegistry {
    async fn token(&self, reference: &ImageReference) -> Result<Option<String>> {
        *self.token_calls.lock().unwrap() += 1;
        if self.fail_token {
            return Err(Error::TokenFetchFailed {
                repository: reference.repository.clone(),
                reason: "HTTP 401".to_string(),
            });
        }
        Ok(Some("test-token".to_string()))
    }

    async fn manifest(&self, _reference: &ImageReference, token: Option<&str>) -> Result<Vec<u8>> {
        assert_eq!(token, Some("test-token"));
        Ok(self.manifest.clone())
    }

    async fn blob(
        &self,
        _reference: &ImageReference,
        digest: &str,
        _token: Option<&str>,
        dest: &Path,
    ) -> Result<u64> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(digest.to_string())
            .or_default() += 1;
        let body = self
            .blobs
            .get(digest)
            .ok_or_else(|| Error::BlobFetchFailed {
                digest: digest.to_string(),
                reason: "HTTP 404".to_string(),
            })?;
        std::fs::write(dest, body)?;
        Ok(body.len() as u64)
    }
}

// =============================================================================
// Layers
// =============================================================================

/// `sha256:<hex>` of `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Gzipped tar with the given regular files.
pub fn layer(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Config blob of a Linux image running `cmd`.
pub fn linux_config(cmd: &[&str]) -> String {
    serde_json::json!({
        "os": "linux",
        "config": { "Env": ["PATH=/usr/bin:/bin"], "Cmd": cmd },
    })
    .to_string()
}

// =============================================================================
// Time
// =============================================================================

/// Clock frozen at a settable instant.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn ts(hour: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, hour, min, 0).unwrap()
}

struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

/// Hands out manual tickers and fires them on demand.
#[derive(Clone, Default)]
pub struct Ticks {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<()>>>>,
}

impl Ticks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> TickerFactory {
        let senders = Arc::clone(&self.senders);
        Arc::new(move || {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.lock().unwrap().push(tx);
            Box::new(ManualTicker { rx }) as Box<dyn Ticker>
        })
    }

    /// One ticker outside any driver.
    pub fn ticker(&self) -> Box<dyn Ticker> {
        (self.factory())()
    }

    /// Fires every ticker handed out so far.
    pub fn tick(&self) {
        for tx in self.senders.lock().unwrap().iter() {
            let _ = tx.send(());
        }
    }

    pub fn count(&self) -> usize {
        self.senders.lock().unwrap().len()
    }
}

// =============================================================================
// Driver Harness
// =============================================================================

pub struct Harness {
    pub driver: JailDriver,
    pub host: Arc<FakeJailHost>,
    pub registry: Arc<FakeRegistry>,
    pub ticks: Ticks,
    pub clock: Arc<FixedClock>,
    pub tmp: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_registry(FakeRegistry::default())
    }

    pub fn with_registry(registry: FakeRegistry) -> Self {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = DriverConfig {
            scratch_dir: tmp.path().join("scratch"),
            ..DriverConfig::default()
        };
        let host = FakeJailHost::new();
        let registry = Arc::new(registry);
        let ticks = Ticks::new();
        let clock = FixedClock::at(ts(10, 0));

        let driver = JailDriver::new(
            config,
            Arc::clone(&host) as Arc<dyn ProcessRunner>,
            Arc::clone(&registry) as Arc<dyn RegistryTransport>,
        )
        .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .with_ticker_factory(ticks.factory());

        Self {
            driver,
            host,
            registry,
            ticks,
            clock,
            tmp,
        }
    }

    pub fn alloc_dir(&self) -> PathBuf {
        self.tmp.path().join("alloc")
    }

    /// Task `web` of allocation `abc` with the given driver config.
    pub fn task(&self, id: &str, driver_config: serde_json::Value) -> TaskConfig {
        TaskConfig {
            id: id.to_string(),
            name: "web".to_string(),
            alloc_id: "abc".to_string(),
            alloc_dir: self.alloc_dir(),
            driver_config,
        }
    }
}
