//! Policy configuration for the tool-call gate.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default sandbox working directory, also used as `~`.
pub const DEFAULT_WORKSPACE_ROOT: &str = "/home/user";

/// Default write-size ceiling (100 MiB).
pub const DEFAULT_MAX_FILE_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Declarative policy consumed by [`PolicyEngine`](super::engine::PolicyEngine).
///
/// Every field is defaulted so a partial `[policy]` table in the config file
/// only overrides what it names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Sandbox root; relative paths are joined to it.
    pub workspace_root: PathBuf,
    /// Directory that `~` expands to.
    pub home_dir: PathBuf,
    /// Subdirectories of the root an agent may touch in strict mode.
    pub allowed_dirs: Vec<String>,
    /// Locations that are always denied, checked before anything else.
    pub blocked_paths: Vec<String>,
    /// Literal substrings that deny a shell command.
    pub blocked_commands: Vec<String>,
    /// Case-insensitive regexes that deny a shell command.
    pub blocked_patterns: Vec<String>,
    /// Require paths to lie under `allowed_dirs`.
    pub strict_paths: bool,
    pub max_file_size_bytes: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::standard()
    }
}

/// `rm` with a recursive and a force flag, in any order or combined, aimed
/// at `/`, `//...` or `/*`. Other options and `--` may appear before the
/// target.
const RM_RECURSIVE_FORCE_ROOT: &str = concat!(
    r"\brm\s+(?:",
    // -rf, -fr, -Rfv ...
    r"(?:-{1,2}[a-zA-Z][\w-]*\s+)*-[a-zA-Z]*(?:[rR][a-zA-Z]*f|f[a-zA-Z]*[rR])[a-zA-Z]*",
    // recursive, then force
    r"|(?:-{1,2}[a-zA-Z][\w-]*\s+)*(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)",
    r"\s+(?:-{1,2}[a-zA-Z][\w-]*\s+)*(?:-[a-zA-Z]*f[a-zA-Z]*|--force)",
    // force, then recursive
    r"|(?:-{1,2}[a-zA-Z][\w-]*\s+)*(?:-[a-zA-Z]*f[a-zA-Z]*|--force)",
    r"\s+(?:-{1,2}[a-zA-Z][\w-]*\s+)*(?:-[a-zA-Z]*[rR][a-zA-Z]*|--recursive)",
    r")\s+(?:-{1,2}[a-zA-Z][\w-]*\s+)*(?:--\s+)?/+\*?(?:[\s;&|]|$)",
);

impl PolicyConfig {
    /// The stock policy: strict allow-list plus the system deny-list.
    pub fn standard() -> Self {
        Self {
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
            home_dir: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
            allowed_dirs: to_strings(&[
                "temp", "specs", "workspace", "src", "tests", "docs", "scripts", "config", "data",
            ]),
            blocked_paths: to_strings(&[
                "/etc",
                "/var",
                "/usr",
                "/bin",
                "/sbin",
                "/boot",
                "/sys",
                "/proc",
                "~/.ssh",
                "~/.aws",
                "~/.config",
            ]),
            blocked_commands: to_strings(&[
                "rm -rf /*",
                "sudo rm",
                "dd if=",
                ":(){ :|:& };:",
                "chmod 000",
                "chown root",
                "mkfs",
            ]),
            blocked_patterns: to_strings(&[
                RM_RECURSIVE_FORCE_ROOT,
                r"\bsudo\s+rm\b",
                r"\bmkfs(?:\.\w+)?\b",
                r"\b(?:fdisk|parted)\b",
                r"\bdd\s+if=",
                r"\bchmod\s+(?:-[a-z]+\s+)*0?000\b",
                r"\bchown\s+(?:-[a-z]+\s+)*root\b",
                r"\b(?:shutdown|reboot|halt|poweroff)\b",
                r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
            ]),
            strict_paths: true,
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE_BYTES,
        }
    }

    /// Same deny-lists, but any in-root path is accepted.
    pub fn permissive() -> Self {
        Self {
            strict_paths: false,
            ..Self::standard()
        }
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn with_home_dir(mut self, home: impl Into<PathBuf>) -> Self {
        self.home_dir = home.into();
        self
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
