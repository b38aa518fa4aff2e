//! Tool kinds: the closed set of actions an agent may propose.

use serde::{Deserialize, Serialize};

/// What a tool call does inside the sandbox.
///
/// Names match the tool names advertised to the model. Anything outside
/// this set is a malformed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolKind {
    Bash,
    Read,
    Write,
    Edit,
    Glob,
    Grep,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::Bash,
        ToolKind::Read,
        ToolKind::Write,
        ToolKind::Edit,
        ToolKind::Glob,
        ToolKind::Grep,
    ];

    /// Look up a tool by its advertised name. Case-sensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolKind::Bash => "Bash",
            ToolKind::Read => "Read",
            ToolKind::Write => "Write",
            ToolKind::Edit => "Edit",
            ToolKind::Glob => "Glob",
            ToolKind::Grep => "Grep",
        }
    }

    /// String arguments that must be present for the call to be well-formed.
    pub fn required_args(&self) -> &'static [&'static str] {
        match self {
            ToolKind::Bash => &["command"],
            ToolKind::Read => &["file_path"],
            ToolKind::Write => &["file_path", "content"],
            ToolKind::Edit => &["file_path", "old_string", "new_string"],
            ToolKind::Glob => &["pattern"],
            ToolKind::Grep => &["pattern"],
        }
    }

    /// Whether the call modifies sandbox state.
    pub fn is_mutating(&self) -> bool {
        matches!(self, ToolKind::Bash | ToolKind::Write | ToolKind::Edit)
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
