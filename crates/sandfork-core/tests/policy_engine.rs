//! End-to-end policy evaluation tests for the sandbox module.

use serde_json::json;

use sandfork_core::sandbox::{PolicyConfig, PolicyEngine, ToolCallRequest};

fn engine() -> PolicyEngine {
    PolicyEngine::standard().unwrap()
}

fn read(path: &str) -> ToolCallRequest {
    ToolCallRequest::new("r", "Read", json!({ "file_path": path }))
}

fn bash(cmd: &str) -> ToolCallRequest {
    ToolCallRequest::new("b", "Bash", json!({ "command": cmd }))
}

// -------------------------------------------------------------------------
// Paths
// -------------------------------------------------------------------------

#[test]
fn test_allow_listed_paths_are_allowed() {
    let engine = engine();
    for path in [
        "src/main.rs",
        "/home/user/tests/it.rs",
        "~/docs/README.md",
        "workspace/./a/../b.txt",
    ] {
        let d = engine.evaluate(&read(path));
        assert!(d.is_allowed(), "{path}: {}", d.reason);
    }
}

#[test]
fn test_deny_listed_and_escaping_paths_are_denied() {
    let engine = engine();
    for (path, needle) in [
        ("/etc/shadow", "deny-list"),
        ("~/.ssh/id_rsa", "deny-list"),
        ("/proc/self/environ", "deny-list"),
        ("../../etc/passwd", "deny-list"),
        ("/opt/data.txt", "escapes the workspace root"),
        ("src/../../other/x", "escapes the workspace root"),
        ("notes.txt", "outside the allowed directories"),
    ] {
        let d = engine.evaluate(&read(path));
        assert!(!d.is_allowed(), "{path} should be denied");
        assert!(d.reason.contains(needle), "{path}: {}", d.reason);
    }
}

#[test]
fn test_permissive_mode_allows_any_in_root_path() {
    let engine = PolicyEngine::new(PolicyConfig {
        strict_paths: false,
        ..PolicyConfig::standard()
    })
    .unwrap();
    assert!(engine.evaluate(&read("notes.txt")).is_allowed());
    assert!(!engine.evaluate(&read("/etc/hosts")).is_allowed());
}

#[test]
fn test_write_to_etc_passwd_is_denied_by_deny_list() {
    let d = engine().evaluate(&ToolCallRequest::new(
        "w",
        "Write",
        json!({"file_path": "/etc/passwd", "content": "x"}),
    ));
    assert!(!d.allow);
    assert!(d.reason.contains("deny-list"));
}

// -------------------------------------------------------------------------
// Commands
// -------------------------------------------------------------------------

#[test]
fn test_dangerous_commands_are_denied() {
    let engine = engine();
    for cmd in [
        "rm -rf /",
        "rm -rf /*",
        "rm -r -f /",
        "rm --recursive --force /",
        "rm -rf -- /",
        "rm -fr //",
        "cd src && sudo rm -r build",
        "mkfs.ext4 /dev/sda1",
        "dd if=/dev/zero of=/dev/sda",
        ":(){ :|:& };:",
        "chmod 000 secrets",
        "chown root file",
        "echo hi > /dev/sda",
        "cat image | dd of=disk.img",
        "SHUTDOWN -h now",
    ] {
        assert!(!engine.evaluate(&bash(cmd)).is_allowed(), "{cmd} should be denied");
    }
}

#[test]
fn test_ordinary_commands_are_allowed() {
    let engine = engine();
    for cmd in [
        "ls -la",
        "cargo test 2>&1 | tail -n 20",
        "rm -rf /tmp/build",
        "rm --recursive --force target/debug",
        "grep -r TODO src > /dev/null",
        "echo done >&2",
    ] {
        let d = engine.evaluate(&bash(cmd));
        assert!(d.is_allowed(), "{cmd}: {}", d.reason);
    }
}

// -------------------------------------------------------------------------
// Search scope and malformed requests
// -------------------------------------------------------------------------

#[test]
fn test_search_scopes() {
    let engine = engine();
    let glob = |pattern: &str| ToolCallRequest::new("g", "Glob", json!({ "pattern": pattern }));
    assert!(engine.evaluate(&glob("**/*.rs")).is_allowed());
    assert!(engine.evaluate(&glob("src/**/*.rs")).is_allowed());
    assert!(!engine.evaluate(&glob("/etc/*.conf")).is_allowed());
    assert!(!engine.evaluate(&glob("src/*/../../../etc/*")).is_allowed());

    let grep = ToolCallRequest::new("g", "Grep", json!({"pattern": "key", "path": "~/.aws"}));
    assert!(!engine.evaluate(&grep).is_allowed());
}

#[test]
fn test_malformed_requests_are_denied() {
    let engine = engine();
    for req in [
        ToolCallRequest::new("x", "Delete", json!({"file_path": "src/a"})),
        ToolCallRequest::new("x", "Read", json!({})),
        ToolCallRequest::new("x", "Read", json!({"file_path": 7})),
        ToolCallRequest::new("x", "Bash", json!("ls")),
        ToolCallRequest::new("x", "Bash", json!({"command": "ls", "timeout_ms": -1})),
    ] {
        let d = engine.evaluate(&req);
        assert!(!d.is_allowed());
        assert!(d.reason.starts_with("malformed request"), "{}", d.reason);
    }
}

#[test]
fn test_decisions_are_deterministic() {
    let engine = engine();
    let req = read("../outside");
    assert_eq!(engine.evaluate(&req), engine.evaluate(&req));
}
