//! Tests for constants module.
//!
//! Validates that limits and intervals stay within sane bounds and that
//! the tool flags match what jail(8), jls(8) and rctl(8) expect.

use jailrun::*;
use std::time::Duration;

// =============================================================================
// Size Limit Tests
// =============================================================================

#[test]
fn test_image_ref_length_reasonable() {
    assert!(MAX_IMAGE_REF_LEN >= 256, "image ref limit too restrictive");
    assert!(MAX_IMAGE_REF_LEN <= 1024, "image ref limit too permissive");
}

#[test]
fn test_rootfs_size_fits_base_images() {
    assert!(
        MAX_ROOTFS_SIZE >= 1024 * 1024 * 1024,
        "rootfs limit too restrictive (< 1 GiB)"
    );
}

#[test]
fn test_layers_count_reasonable() {
    // Docker caps images at 127 layers.
    assert!(MAX_LAYERS >= 127);
}

#[test]
fn test_output_cap_bounded() {
    assert!(MAX_OUTPUT_SIZE >= 64 * 1024);
    assert!(MAX_OUTPUT_SIZE <= 16 * 1024 * 1024);
}

// =============================================================================
// Timing Tests
// =============================================================================

#[test]
fn test_monitor_interval_bounds() {
    assert!(MONITOR_INTERVAL >= Duration::from_millis(100), "would spin jls");
    assert!(MONITOR_INTERVAL <= Duration::from_secs(10), "exit detection too slow");
}

#[test]
fn test_settle_period_shorter_than_command_timeout() {
    assert!(CREATE_SETTLE_PERIOD < COMMAND_TIMEOUT);
    assert!(DESTROY_GRACE_PERIOD > Duration::ZERO);
}

// =============================================================================
// Tool Flag Tests
// =============================================================================

#[test]
fn test_tool_flags() {
    assert_eq!(JAIL_CREATE_FLAGS, "-cmr");
    assert_eq!(JAIL_REMOVE_FLAG, "-r");
    assert_eq!(JLS_NAME_VALUE_FLAG, "-n");
    assert_eq!(RCTL_ADD_FLAG, "-a");
}

#[test]
fn test_whiteout_markers() {
    assert!(OPAQUE_WHITEOUT.starts_with(WHITEOUT_PREFIX));
}
