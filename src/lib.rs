//! # Windows Registry Shell
//!
//! Structured Windows registry access and reconciliation on top of the
//! `reg.exe` command-line tool.
//!
//! ## Features
//!
//! - **Streaming reads**: `reg query` output is parsed as it arrives, so large
//!   recursive reads can report progress and be stopped early with a partial
//!   result
//! - **Typed values**: all seven value kinds decode into [`RegistryValue`]
//! - **Reconciliation**: a desired state is diffed against the live registry
//!   and applied with the fewest `reg` invocations
//! - **Cancellation**: every operation is a [`Cancellable`] with stop and
//!   timeout control
//!
//! ## Architecture
//!
//! Reads and writes pass through several layers:
//!
//! 1. **Process backend** ([`RegBackend`]): spawns `reg query/add/delete/import/export`
//! 2. **Line reassembler**: splits the chunked output stream into logical lines
//! 3. **Record interpreter**: turns lines into a [`RegistryStruct`]
//! 4. **Query orchestrator** ([`RegClient`]): runs reads and classifies exits
//! 5. **Reconciliation**: [`build_plan`], [`select_mode`] and the document writer
//!
//! ## Output Format
//!
//! `reg query` prints one section per key:
//!
//! ```text
//! HKEY_CURRENT_USER\Software\Foo
//!     (Default)    REG_SZ    hello
//!     Count    REG_DWORD    0x5
//!
//! HKEY_CURRENT_USER\Software\Foo\Child
//! ```
//!
//! ## Examples
//!
//! ### Basic Usage
//!
//! ```no_run
//! use reg_shell::{RegClient, RegConfig};
//!
//! # async fn run() -> reg_shell::Result<()> {
//! let client = RegClient::new(RegConfig::default());
//!
//! // Read one key
//! let result = client.query("HKCU\\Software\\Foo").await?;
//! for (key, values) in &result.data {
//!     println!("{}", key);
//!     for (name, value) in values {
//!         println!("  {} = {}", name, value.to_display_string());
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Reconciling a Desired State
//!
//! ```no_run
//! use reg_shell::{DeletionPolicy, ReconcileOptions, RegClient, RegistryStruct, RegistryValue};
//!
//! # async fn run() -> reg_shell::Result<()> {
//! let client = RegClient::default();
//! let desired = RegistryStruct::new()
//!     .with_value("HKCU\\Software\\Foo", "Bar", RegistryValue::Dword(5));
//! let options = ReconcileOptions::default().delete_unspecified(DeletionPolicy::AllExceptDefault);
//!
//! let report = client.reconcile(desired, options).await?;
//! println!("applied {} step(s) via {:?}", report.applied, report.mode);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod apply;
pub mod cancel;
pub mod config;
pub mod document;
pub mod error;
pub mod interpreter;
pub mod key;
pub mod plan;
pub mod process;
pub mod query;
pub mod reassembler;
pub mod state;
pub mod utils;
pub mod value;

// Re-export main types for convenience
pub use apply::{check_completion, ApplyReport};
pub use cancel::{Cancellable, StopHandle, TaskGroup};
pub use config::{ParseMode, RegConfig};
pub use document::{parse_document, render_plan, render_struct, ParsedDocument};
pub use error::{RegistryError, Result};
pub use interpreter::{parse_query_output, RecordInterpreter};
pub use key::KeyPath;
pub use plan::{build_plan, select_mode, ApplyMode, DeletionPolicy, ExecutionPlan, ExecutionStep, ReconcileOptions};
pub use process::{RegBackend, RegExe, RegView, ToolProcess};
pub use query::{FindOptions, ProgressFn, QueryOptions, QueryTarget, RegClient};
pub use reassembler::LineReassembler;
pub use state::{QueryResult, RegistryStruct, ValueMap};
pub use value::{RegistryValue, ValueType};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
