//! Policy evaluation engine: deny-list first, then root containment, then
//! the strict allow-list.
//!
//! Evaluation is pure. The same request against the same engine always
//! yields the same decision, and malformed input is a deny, never an error.

use std::path::{Component, Path, PathBuf};

use regex::{Regex, RegexBuilder};

use super::capability::ToolKind;
use super::error::PolicyError;
use super::policy::PolicyConfig;
use super::request::{PolicyDecision, ToolCallRequest};

/// Device targets a command may redirect into.
const SAFE_DEVICES: [&str; 4] = ["null", "stdout", "stderr", "tty"];

/// Characters that start a wildcard component in a glob pattern.
const GLOB_META: [char; 4] = ['*', '?', '[', '{'];

/// Compiled form of a [`PolicyConfig`].
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: PolicyConfig,
    root: PathBuf,
    home: PathBuf,
    blocked: Vec<(String, PathBuf)>,
    allowed: Vec<PathBuf>,
    patterns: Vec<Regex>,
    device_redirect: Regex,
    pipe_into_dd: Regex,
}

impl PolicyEngine {
    /// Compile the policy. Invalid patterns are rejected here so that
    /// evaluation itself can never fail.
    pub fn new(config: PolicyConfig) -> Result<Self, PolicyError> {
        if !config.workspace_root.is_absolute() {
            return Err(PolicyError::RelativeRoot(
                config.workspace_root.display().to_string(),
            ));
        }
        let root = normalize(&config.workspace_root);
        let home = if config.home_dir.is_absolute() {
            normalize(&config.home_dir)
        } else {
            normalize(&root.join(&config.home_dir))
        };

        let patterns = config
            .blocked_patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut engine = Self {
            root,
            home,
            blocked: Vec::new(),
            allowed: Vec::new(),
            patterns,
            device_redirect: compile(r#">>?\s*/dev/([^\s;&|)'"]+)"#)?,
            pipe_into_dd: compile(r"\|\s*dd\b")?,
            config,
        };
        engine.blocked = engine
            .config
            .blocked_paths
            .iter()
            .map(|b| (b.clone(), engine.resolve_path(b)))
            .collect();
        engine.allowed = engine
            .config
            .allowed_dirs
            .iter()
            .map(|d| normalize(&engine.root.join(d.trim_end_matches('/'))))
            .collect();
        Ok(engine)
    }

    /// Engine for [`PolicyConfig::standard`].
    pub fn standard() -> Result<Self, PolicyError> {
        Self::new(PolicyConfig::standard())
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn workspace_root(&self) -> &Path {
        &self.root
    }

    /// Evaluate one proposed tool call.
    pub fn evaluate(&self, request: &ToolCallRequest) -> PolicyDecision {
        let Some(kind) = request.kind() else {
            return PolicyDecision::deny(format!(
                "malformed request: unknown tool `{}`",
                request.name
            ));
        };
        if let Err(reason) = check_well_formed(kind, request) {
            return PolicyDecision::deny(format!("malformed request: {reason}"));
        }

        // Required args are present and string-typed past this point.
        let arg = |key: &str| request.str_arg(key).unwrap_or_default();
        let outcome = match kind {
            ToolKind::Bash => self.check_command(arg("command")),
            ToolKind::Read => self.check_path(arg("file_path")),
            ToolKind::Write => self
                .check_path(arg("file_path"))
                .and_then(|ok| self.check_size(arg("content")).map(|_| ok)),
            ToolKind::Edit => self
                .check_path(arg("file_path"))
                .and_then(|ok| self.check_size(arg("new_string")).map(|_| ok)),
            ToolKind::Glob => self.check_search(request.str_arg("path"), Some(arg("pattern"))),
            ToolKind::Grep => self.check_search(request.str_arg("path"), request.str_arg("glob")),
        };

        match outcome {
            Ok(reason) => PolicyDecision::allow(reason),
            Err(reason) => PolicyDecision::deny(reason),
        }
    }

    /// Evaluate a bare shell command.
    pub fn evaluate_command(&self, command: &str) -> PolicyDecision {
        match self.check_command(command) {
            Ok(reason) => PolicyDecision::allow(reason),
            Err(reason) => PolicyDecision::deny(reason),
        }
    }

    /// Lexically resolve a path the way the sandbox would see it.
    ///
    /// `~` expands to the configured home directory, relative paths are
    /// joined to the workspace root, and `.`/`..` are folded without
    /// touching the filesystem.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        self.resolve_against(&self.root, raw)
    }

    fn resolve_against(&self, base: &Path, raw: &str) -> PathBuf {
        let joined = if raw == "~" {
            self.home.clone()
        } else if let Some(rest) = raw.strip_prefix("~/") {
            self.home.join(rest)
        } else {
            let p = Path::new(raw);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };
        normalize(&joined)
    }

    fn blocked_hit(&self, path: &Path) -> Option<&str> {
        self.blocked
            .iter()
            .find(|(_, b)| path.starts_with(b))
            .map(|(label, _)| label.as_str())
    }

    fn is_allowed(&self, path: &Path) -> bool {
        self.allowed.iter().any(|a| path.starts_with(a))
    }

    fn allowed_list(&self) -> String {
        self.config.allowed_dirs.join(", ")
    }

    fn check_path(&self, raw: &str) -> Result<String, String> {
        let path = self.resolve_path(raw);
        if let Some(hit) = self.blocked_hit(&path) {
            return Err(format!(
                "path `{raw}` is on the blocked-path deny-list ({hit})"
            ));
        }
        if !path.starts_with(&self.root) {
            return Err(format!(
                "path `{raw}` escapes the workspace root {}",
                self.root.display()
            ));
        }
        if self.config.strict_paths && !self.is_allowed(&path) {
            return Err(format!(
                "path `{raw}` is outside the allowed directories: {}",
                self.allowed_list()
            ));
        }
        Ok(format!("path `{raw}` permitted"))
    }

    /// Read-only enumeration: the root itself is an acceptable scope.
    fn check_scope(&self, path: &Path, shown: &str) -> Result<(), String> {
        if let Some(hit) = self.blocked_hit(path) {
            return Err(format!(
                "search scope `{shown}` is on the blocked-path deny-list ({hit})"
            ));
        }
        if !path.starts_with(&self.root) {
            return Err(format!(
                "search scope `{shown}` escapes the workspace root {}",
                self.root.display()
            ));
        }
        if self.config.strict_paths && path != self.root && !self.is_allowed(path) {
            return Err(format!(
                "search scope `{shown}` is outside the allowed directories: {}",
                self.allowed_list()
            ));
        }
        Ok(())
    }

    fn check_search(&self, base: Option<&str>, pattern: Option<&str>) -> Result<String, String> {
        let base_path = match base {
            Some(raw) if !raw.is_empty() => self.resolve_path(raw),
            _ => self.root.clone(),
        };
        self.check_scope(&base_path, base.unwrap_or("."))?;

        if let Some(pattern) = pattern {
            let (prefix, tail) = split_glob(pattern);
            if tail.split('/').any(|c| c == "..") {
                return Err(format!(
                    "pattern `{pattern}` may not use `..` after a wildcard"
                ));
            }
            let scope = if prefix.is_empty() {
                base_path.clone()
            } else {
                self.resolve_against(&base_path, &prefix)
            };
            self.check_scope(&scope, pattern)?;
        }
        Ok("search scope permitted".to_string())
    }

    fn check_size(&self, content: &str) -> Result<(), String> {
        let size = content.len() as u64;
        if size > self.config.max_file_size_bytes {
            return Err(format!(
                "content size {size} bytes exceeds limit of {} bytes",
                self.config.max_file_size_bytes
            ));
        }
        Ok(())
    }

    fn check_command(&self, command: &str) -> Result<String, String> {
        if let Some(lit) = self
            .config
            .blocked_commands
            .iter()
            .find(|lit| command.contains(lit.as_str()))
        {
            return Err(format!("command contains blocked command `{lit}`"));
        }
        if let Some(re) = self.patterns.iter().find(|re| re.is_match(command)) {
            return Err(format!("command matches blocked pattern `{}`", re.as_str()));
        }
        for caps in self.device_redirect.captures_iter(command) {
            let target = &caps[1];
            if !is_safe_device(target) {
                return Err(format!("command redirects into device file /dev/{target}"));
            }
        }
        if self.pipe_into_dd.is_match(command) {
            return Err("command pipes into dd".to_string());
        }
        Ok("command passed blocklist checks".to_string())
    }
}

fn compile(pattern: &str) -> Result<Regex, PolicyError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| PolicyError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

fn is_safe_device(target: &str) -> bool {
    SAFE_DEVICES.contains(&target) || target.starts_with("fd/")
}

fn check_well_formed(kind: ToolKind, request: &ToolCallRequest) -> Result<(), String> {
    if !request.arguments.is_object() {
        return Err("arguments must be a JSON object".to_string());
    }
    for key in kind.required_args() {
        if request.has_non_string_arg(key) {
            return Err(format!("argument `{key}` must be a string"));
        }
        match request.str_arg(key) {
            None => return Err(format!("missing required argument `{key}`")),
            Some("") if matches!(*key, "file_path" | "command" | "pattern") => {
                return Err(format!("argument `{key}` must not be empty"));
            }
            Some(_) => {}
        }
    }
    for key in ["path", "glob"] {
        if request.has_non_string_arg(key) {
            return Err(format!("argument `{key}` must be a string"));
        }
    }
    if let Some(t) = request.arguments.get("timeout_ms") {
        if !t.is_u64() && !t.is_null() {
            return Err("argument `timeout_ms` must be a non-negative integer".to_string());
        }
    }
    Ok(())
}

/// Split a glob into its literal directory prefix and the wildcard tail.
fn split_glob(pattern: &str) -> (String, String) {
    let mut prefix = Vec::new();
    let mut parts = pattern.split('/').peekable();
    let absolute = pattern.starts_with('/');
    while let Some(part) = parts.peek() {
        if part.contains(GLOB_META) {
            break;
        }
        prefix.push(*part);
        parts.next();
    }
    let tail: Vec<&str> = parts.collect();
    // A pattern without wildcards names a file; its parent is the scope.
    if tail.is_empty() {
        prefix.pop();
    }
    let mut prefix = prefix.join("/");
    if absolute && prefix.is_empty() {
        prefix.push('/');
    }
    (prefix, tail.join("/"))
}

/// Fold `.` and `..` without consulting the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(c) => out.push(c),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> PolicyEngine {
        PolicyEngine::standard().unwrap()
    }

    fn req(name: &str, args: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest::new("call-1", name, args)
    }

    #[test]
    fn test_normalize_folds_dots() {
        assert_eq!(
            normalize(Path::new("/home/user/src/../../etc/./passwd")),
            PathBuf::from("/home/etc/passwd")
        );
        assert_eq!(normalize(Path::new("/../..")), PathBuf::from("/"));
    }

    #[test]
    fn test_resolve_path_expands_home_and_joins_root() {
        let e = engine();
        assert_eq!(e.resolve_path("src/main.rs"), PathBuf::from("/home/user/src/main.rs"));
        assert_eq!(e.resolve_path("~/.ssh/id_rsa"), PathBuf::from("/home/user/.ssh/id_rsa"));
        assert_eq!(e.resolve_path("/tmp/../etc"), PathBuf::from("/etc"));
    }

    #[test]
    fn test_deny_list_precedes_allow_list() {
        // ~/.ssh lies inside the root; the deny-list must still win.
        let cfg = PolicyConfig::permissive();
        let e = PolicyEngine::new(cfg).unwrap();
        let d = e.evaluate(&req("Read", json!({"file_path": "~/.ssh/id_rsa"})));
        assert!(!d.allow);
        assert!(d.reason.contains("deny-list"), "{}", d.reason);
    }

    #[test]
    fn test_escape_via_parent_dirs_denied() {
        let d = engine().evaluate(&req("Read", json!({"file_path": "src/../../other/x"})));
        assert!(!d.allow);
        assert!(d.reason.contains("escapes the workspace root"));
    }

    #[test]
    fn test_strict_mode_requires_allowed_dir() {
        let e = engine();
        assert!(e.evaluate(&req("Read", json!({"file_path": "src/lib.rs"}))).allow);
        assert!(e.evaluate(&req("Read", json!({"file_path": "/home/user/tests"}))).allow);
        let d = e.evaluate(&req("Read", json!({"file_path": ".bashrc"})));
        assert!(!d.allow);
        assert!(d.reason.contains("outside the allowed directories"));

        let loose = PolicyEngine::new(PolicyConfig::permissive()).unwrap();
        assert!(loose.evaluate(&req("Read", json!({"file_path": ".bashrc"}))).allow);
    }

    #[test]
    fn test_allowed_prefix_is_component_wise() {
        // "srcfoo" must not pass as "src".
        let d = engine().evaluate(&req("Read", json!({"file_path": "srcfoo/a"})));
        assert!(!d.allow);
    }

    #[test]
    fn test_write_size_ceiling() {
        let mut cfg = PolicyConfig::standard();
        cfg.max_file_size_bytes = 4;
        let e = PolicyEngine::new(cfg).unwrap();
        let ok = e.evaluate(&req("Write", json!({"file_path": "temp/a", "content": "abcd"})));
        assert!(ok.allow);
        let big = e.evaluate(&req("Write", json!({"file_path": "temp/a", "content": "abcde"})));
        assert!(!big.allow);
        assert!(big.reason.contains("exceeds limit"));
        let edit = e.evaluate(&req(
            "Edit",
            json!({"file_path": "temp/a", "old_string": "x", "new_string": "0123456789"}),
        ));
        assert!(!edit.allow);
    }

    #[test]
    fn test_commands() {
        let e = engine();
        for bad in [
            "rm -rf /",
            "rm -rf / --no-preserve-root",
            "cd src && rm -fr /*",
            "rm -r -f /",
            "rm --recursive --force /",
            "rm -rf -- /",
            "rm -fr //",
            "rm -v --force -R /*",
            "sudo rm -r build",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=x",
            ":(){ :|:& };:",
            "chmod 000 src",
            "chown root:root temp/x",
            "SHUTDOWN -h now",
            "sudo reboot",
            "echo x > /dev/sda",
            "cat img | dd of=out",
            "fdisk -l",
        ] {
            assert!(!e.evaluate_command(bad).allow, "expected deny: {bad}");
        }
        for good in [
            "ls -la",
            "rm -rf temp/build",
            "rm -r -f temp/build /tmp/x",
            "rm -f /tmp/x",
            "cargo test 2>/dev/null",
            "echo hi > /dev/stderr",
            "exec 3>/dev/fd/3",
            "grep -r halting src",
        ] {
            assert!(e.evaluate_command(good).allow, "expected allow: {good}");
        }
    }

    #[test]
    fn test_malformed_requests_denied() {
        let e = engine();
        for (name, args) in [
            ("Teleport", json!({})),
            ("Bash", json!({})),
            ("Bash", json!({"command": 42})),
            ("Read", json!({"file_path": ""})),
            ("Write", json!({"file_path": "temp/a"})),
            ("Grep", json!({"pattern": "x", "path": ["src"]})),
            ("Bash", json!({"command": "ls", "timeout_ms": "soon"})),
            ("Read", json!("src/a")),
        ] {
            let d = e.evaluate(&req(name, args));
            assert!(!d.allow);
            assert!(d.reason.starts_with("malformed request"), "{}", d.reason);
        }
    }

    #[test]
    fn test_glob_and_grep_scopes() {
        let e = engine();
        assert!(e.evaluate(&req("Glob", json!({"pattern": "**/*.rs"}))).allow);
        assert!(e.evaluate(&req("Glob", json!({"pattern": "src/**/*.rs"}))).allow);
        assert!(!e.evaluate(&req("Glob", json!({"pattern": "/etc/*"}))).allow);
        assert!(!e.evaluate(&req("Glob", json!({"pattern": "../../*"}))).allow);
        assert!(!e.evaluate(&req("Glob", json!({"pattern": "src/*/../../../*"}))).allow);
        assert!(!e.evaluate(&req("Glob", json!({"pattern": "*", "path": "/proc"}))).allow);
        assert!(e.evaluate(&req("Grep", json!({"pattern": "TODO", "path": "docs"}))).allow);
        assert!(!e.evaluate(&req("Grep", json!({"pattern": "key", "path": "~/.aws"}))).allow);
    }

    #[test]
    fn test_split_glob() {
        assert_eq!(split_glob("src/**/*.rs"), ("src".into(), "**/*.rs".into()));
        assert_eq!(split_glob("*.md"), ("".into(), "*.md".into()));
        assert_eq!(split_glob("/etc/passwd"), ("/etc".into(), "".into()));
        assert_eq!(split_glob("/*"), ("/".into(), "*".into()));
    }

    #[test]
    fn test_invalid_pattern_rejected_at_construction() {
        let mut cfg = PolicyConfig::standard();
        cfg.blocked_patterns.push("(unclosed".into());
        assert!(matches!(
            PolicyEngine::new(cfg),
            Err(PolicyError::InvalidPattern { .. })
        ));
        let relative = PolicyConfig::standard().with_workspace_root("box");
        assert!(matches!(
            PolicyEngine::new(relative),
            Err(PolicyError::RelativeRoot(_))
        ));
    }
}
