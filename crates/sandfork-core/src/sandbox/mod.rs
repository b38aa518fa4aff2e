//! Sandbox: the policy gate and tool execution for agent forks.
//!
//! Every side-effecting action an agent proposes goes through the
//! [`PolicyEngine`] first. Only an allowed call reaches the
//! [`ToolExecutor`], which dispatches it to the sandbox collaborator.
//!
//! # Modules
//!
//! - [`capability`]: `ToolKind` (Bash, Read, Write, Edit, Glob, Grep)
//! - [`request`]: `ToolCallRequest`, `PolicyDecision`, `ToolResult`
//! - [`policy`]: `PolicyConfig` with the stock deny/allow lists
//! - [`engine`]: `PolicyEngine::evaluate()`
//! - [`service`]: `SandboxService` / `SandboxProvisioner` collaborator traits
//! - [`execution`]: `ToolExecutor`, `ExecutorConfig`
//! - [`glob`]: glob-to-regex matching for search results
//! - [`error`]: `SandboxError`, `PolicyError`

pub mod capability;
pub mod engine;
pub mod error;
pub mod execution;
pub mod glob;
pub mod policy;
pub mod request;
pub mod service;

pub use capability::ToolKind;
pub use engine::PolicyEngine;
pub use error::{PolicyError, SandboxError, SandboxResult};
pub use execution::{ExecutorConfig, ToolExecutor};
pub use glob::{glob_to_regex, GlobFilter};
pub use policy::PolicyConfig;
pub use request::{PolicyDecision, ToolCallRequest, ToolResult};
pub use service::{ExecOutput, GrepMatch, GrepScope, SandboxProvisioner, SandboxService};
