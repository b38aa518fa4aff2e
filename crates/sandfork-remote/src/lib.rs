//! SandFork remote adapters
//!
//! HTTP implementations of the collaborator traits from `sandfork-core`:
//! - [`HttpSandboxClient`]: [`SandboxService`] and [`SandboxProvisioner`]
//!   over the sandbox REST service
//! - [`AnthropicClient`]: [`ModelService`] over the Messages API
//!
//! [`SandboxService`]: sandfork_core::SandboxService
//! [`SandboxProvisioner`]: sandfork_core::SandboxProvisioner
//! [`ModelService`]: sandfork_core::ModelService

pub mod anthropic;
pub mod error;
pub mod sandbox_client;

pub use anthropic::{AnthropicClient, AnthropicConfig};
pub use error::{RemoteError, Result};
pub use sandbox_client::{HttpSandboxClient, SandboxClientConfig};
