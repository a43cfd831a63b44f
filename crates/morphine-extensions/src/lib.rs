//! Morphine Extensions - load, sandbox and serve third-party extensions.
//!
//! An extension is a directory under the extensions root holding a
//! `manifest.json` and a JavaScript or TypeScript entry file. This crate:
//!
//! - Validates manifests ([`manifest`]) and orders directories by their
//!   declared dependencies ([`discovery`])
//! - Compiles entry files to plain JavaScript with a content-keyed cache
//!   ([`transpiler`])
//! - Derives a [`CapabilityGrant`] from the manifest permissions
//! - Runs each extension in its own `QuickJS` context on a dedicated thread,
//!   with bounded time and memory ([`sandbox`])
//! - Tracks lifecycle state ([`ExtensionRegistry`]) and exposes registered
//!   routes under `/extensions/<id>` ([`RouteMount`])
//!
//! [`ExtensionManager`] drives all of the above.
//!
//! # Example
//!
//! ```rust,no_run
//! use morphine_extensions::{ExtensionId, ExtensionManager};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ExtensionManager::builder("./extensions").build();
//! let report = manager.load_all().await?;
//! for (id, error) in &report.failed {
//!     eprintln!("{id}: {error}");
//! }
//!
//! let app = axum::Router::new().merge(manager.router());
//! # let _ = app;
//! manager.reload(&ExtensionId::new("Hello")?).await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod capabilities;
pub mod data;
pub mod discovery;
pub mod error;
pub mod extension;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod routes;
pub mod sandbox;
pub mod transpiler;

pub use capabilities::{CapabilityGrant, ConsoleGrant, FsScope};
pub use data::{DataAccess, DataAccessError, ExecuteResult, Row, UnavailableDataAccess};
pub use discovery::{DiscoveredExtension, discover};
pub use error::{ExtensionError, ExtensionResult};
pub use extension::{ExtensionId, ExtensionState, ExtensionSummary, LoadedExtension};
pub use manager::{DiscoveryReport, EnvLookup, ExtensionManager, ExtensionManagerBuilder};
pub use manifest::{ConsolePermission, Manifest, Permissions, load_manifest};
pub use registry::ExtensionRegistry;
pub use routes::{EXTENSIONS_PREFIX, RouteMount, prefix_for};
pub use sandbox::{SandboxConfig, SandboxExecutor};
pub use transpiler::{CacheStats, Compiled, SourceTranspiler};
