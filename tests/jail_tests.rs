//! Tests for the argument lists sent to the jail tools.

mod common;

use async_trait::async_trait;
use common::FakeJailHost;
use jailrun::process::{CommandOutput, CommandSpec, Launch, ProcessRunner};
use jailrun::rctl::compile_limits;
use jailrun::{DriverConfig, Error, JailControl, JailParams, RctlOpts, RctlResource, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn control(host: &Arc<FakeJailHost>, config: &DriverConfig) -> JailControl {
    JailControl::new(Arc::clone(host) as Arc<dyn ProcessRunner>, config)
}

fn params() -> JailParams {
    let mut params = JailParams::new();
    params.set("name", "web-abc");
    params.set("path", "/jails/web");
    params.set("exec.start", "/bin/sh /etc/rc");
    params.flag("allow.raw_sockets");
    params
}

#[tokio::test]
async fn test_create_passes_params_as_separate_args() {
    let host = FakeJailHost::new();
    control(&host, &DriverConfig::default())
        .create(&params())
        .await
        .unwrap();

    let calls = host.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program, "jail");
    assert_eq!(
        calls[0].args,
        vec![
            "-cmr",
            "name=web-abc",
            "path=/jails/web",
            "exec.start=/bin/sh /etc/rc",
            "allow.raw_sockets",
        ]
    );
    assert!(host.is_active("web-abc"));
}

#[tokio::test]
async fn test_tool_paths_from_config() {
    let host = FakeJailHost::new();
    let mut config = DriverConfig::default();
    config.tools.jls = "/usr/sbin/jls".to_string();

    let jail = control(&host, &config);
    // Unknown program to the fake host: succeeds with empty output.
    assert!(!jail.is_active("web-abc").await.unwrap());
    assert_eq!(host.calls()[0].program, "/usr/sbin/jls");
    assert_eq!(host.calls()[0].args, vec!["-n", "name"]);
}

#[tokio::test]
async fn test_remove_unknown_jail_fails() {
    let host = FakeJailHost::new();
    let err = control(&host, &DriverConfig::default())
        .remove("ghost")
        .await
        .unwrap_err();
    match err {
        Error::ExternalCommandFailed { status, stderr, .. } => {
            assert_eq!(status, "exit code 1");
            assert!(stderr.contains("ghost"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_limit_args_accumulate() {
    let host = FakeJailHost::new();
    let mut rctl = BTreeMap::new();
    for (resource, amount) in [
        (RctlResource::Memoryuse, "256m"),
        (RctlResource::Maxproc, "50"),
        (RctlResource::Pcpu, "25"),
    ] {
        rctl.insert(
            resource,
            RctlOpts {
                action: "deny".to_string(),
                amount: amount.to_string(),
                per: String::new(),
            },
        );
    }
    let rules = compile_limits(&rctl).unwrap();

    control(&host, &DriverConfig::default())
        .apply_limits("web-abc", &rules)
        .await
        .unwrap();

    let calls = host.calls_to("rctl");
    let arg_counts: Vec<_> = calls.iter().map(|c| c.args.len()).collect();
    assert_eq!(arg_counts, vec![2, 3, 4]);
    assert_eq!(
        calls[2].args,
        vec![
            "-a",
            "jail:web-abc:memoryuse:deny=268435456",
            "jail:web-abc:maxproc:deny=50",
            "jail:web-abc:pcpu:deny=25",
        ]
    );
}

#[tokio::test]
async fn test_exec_reports_nonzero_exit() {
    let host = FakeJailHost::new();
    host.fail("jexec", 3);
    let result = control(&host, &DriverConfig::default())
        .exec("web-abc", &["false".to_string()], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);
}

/// Runner whose `jail -c` stays in the foreground.
#[derive(Default)]
struct ForegroundRunner {
    launched: Mutex<Vec<CommandSpec>>,
}

#[async_trait]
impl ProcessRunner for ForegroundRunner {
    async fn output(&self, _command: &CommandSpec, _timeout: Duration) -> Result<CommandOutput> {
        Ok(CommandOutput::with_code(0))
    }

    async fn launch(&self, command: &CommandSpec, _settle: Duration) -> Result<Launch> {
        self.launched.lock().unwrap().push(command.clone());
        Ok(Launch::Detached)
    }
}

#[tokio::test]
async fn test_create_accepts_foreground_jail() {
    let runner = Arc::new(ForegroundRunner::default());
    let jail = JailControl::new(
        Arc::clone(&runner) as Arc<dyn ProcessRunner>,
        &DriverConfig::default(),
    );
    jail.create(&params()).await.unwrap();
    assert_eq!(runner.launched.lock().unwrap().len(), 1);
}
