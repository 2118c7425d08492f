//! Tests for error types.
//!
//! Validates display formatting and that each failure names what failed.

use jailrun::Error;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Task Lifecycle Error Tests
// =============================================================================

#[test]
fn test_already_started_display() {
    let err = Error::AlreadyStarted("t1".to_string());
    assert_eq!(err.to_string(), "task with ID \"t1\" already started");
}

#[test]
fn test_task_not_found_display() {
    let msg = Error::TaskNotFound("t9".to_string()).to_string();
    assert!(msg.contains("t9"), "should include task ID");
    assert!(msg.contains("not found"));
}

#[test]
fn test_still_running_display() {
    let msg = Error::TaskStillRunning("t1".to_string()).to_string();
    assert_eq!(msg, "cannot destroy running task t1");
}

#[test]
fn test_missing_start_command_names_jail() {
    let msg = Error::MissingStartCommand {
        name: "web-abc".to_string(),
    }
    .to_string();
    assert!(msg.contains("web-abc"));
    assert!(msg.contains("persist"));
}

#[test]
fn test_empty_command_display() {
    assert_eq!(Error::EmptyCommand.to_string(), "cmd is required, but was empty");
}

// =============================================================================
// Limit and Image Error Tests
// =============================================================================

#[test]
fn test_limit_errors_name_category() {
    assert_eq!(
        Error::InvalidLimitAmount("memoryuse".to_string()).to_string(),
        "amount for memoryuse is invalid"
    );
    assert!(
        Error::InvalidLimitAction("pcpu".to_string())
            .to_string()
            .contains("pcpu")
    );
}

#[test]
fn test_pipeline_errors_name_digest() {
    let digest = "sha256:abc123";
    let blob = Error::BlobFetchFailed {
        digest: digest.to_string(),
        reason: "HTTP 404".to_string(),
    };
    let extract = Error::ExtractionFailed {
        digest: digest.to_string(),
        reason: "unexpected EOF".to_string(),
    };
    assert!(blob.to_string().contains(digest));
    assert!(blob.to_string().contains("HTTP 404"));
    assert!(extract.to_string().contains(digest));
}

#[test]
fn test_token_and_manifest_errors() {
    let token = Error::TokenFetchFailed {
        repository: "library/nginx".to_string(),
        reason: "HTTP 401".to_string(),
    };
    assert!(token.to_string().contains("library/nginx"));

    let missing = Error::ConfigBlobMissing {
        reference: "docker.io/library/nginx:latest".to_string(),
    };
    assert!(missing.to_string().contains("no config digest"));
}

// =============================================================================
// External Command Error Tests
// =============================================================================

#[test]
fn test_external_command_keeps_output() {
    let err = Error::ExternalCommandFailed {
        program: "jail".to_string(),
        args: vec!["-r".to_string(), "web-abc".to_string()],
        status: "exit code 1".to_string(),
        stdout: String::new(),
        stderr: "jail: \"web-abc\" not found".to_string(),
    };
    let msg = err.to_string();
    assert!(msg.starts_with("jail"));
    assert!(msg.contains("exit code 1"));
    assert!(msg.contains("not found"));
}

#[test]
fn test_timeout_display() {
    let err = Error::Timeout {
        operation: "jls -n name".to_string(),
        duration: Duration::from_secs(300),
    };
    let msg = err.to_string();
    assert!(msg.contains("300"));
    assert!(msg.contains("jls"));
}

#[test]
fn test_config_error_names_path() {
    let err = Error::Config {
        path: PathBuf::from("/usr/local/etc/jailrun.yaml"),
        reason: "unknown field".to_string(),
    };
    assert!(err.to_string().contains("/usr/local/etc/jailrun.yaml"));
}

#[test]
fn test_io_error_conversion() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));
    assert!(err.to_string().contains("denied"));
}
