//! External tool collaborators.
//!
//! The core never talks to the registry itself; it spawns the `reg` tool
//! through a [`RegBackend`]. [`RegExe`] is the default backend. It maps
//! option records onto `reg.exe` argument vectors and spawns them with
//! `tokio::process`. Tests substitute scripted backends.

use crate::config::RegConfig;
use crate::error::Result;
use crate::key::KeyPath;
use crate::query::QueryOptions;
use crate::value::{is_default_name, RegistryValue};
use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::debug;

/// Boxed output stream of a spawned tool.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Registry view to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegView {
    /// The tool's native view.
    #[default]
    Native,
    /// The 32-bit view (`/reg:32`).
    Reg32,
    /// The 64-bit view (`/reg:64`).
    Reg64,
}

impl RegView {
    fn flag(&self) -> Option<&'static str> {
        match self {
            RegView::Native => None,
            RegView::Reg32 => Some("/reg:32"),
            RegView::Reg64 => Some("/reg:64"),
        }
    }
}

/// A running tool process.
#[async_trait]
pub trait ToolProcess: Send {
    /// Takes the standard output stream.
    fn take_stdout(&mut self) -> Option<BoxedReader>;

    /// Takes the standard error stream.
    fn take_stderr(&mut self) -> Option<BoxedReader>;

    /// Waits for exit. `None` means the process ended without an exit code
    /// (it was killed).
    async fn wait(&mut self) -> io::Result<Option<i32>>;

    /// Requests termination without waiting.
    fn start_kill(&mut self) -> io::Result<()>;
}

#[async_trait]
impl ToolProcess for Child {
    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take().map(|s| Box::pin(s) as BoxedReader)
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take().map(|s| Box::pin(s) as BoxedReader)
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(Child::wait(self).await?.code())
    }

    fn start_kill(&mut self) -> io::Result<()> {
        Child::start_kill(self)
    }
}

/// Captured result of a mutating command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated.
    pub code: Option<i32>,
    /// Decoded standard output.
    pub stdout: String,
    /// Decoded standard error.
    pub stderr: String,
}

/// Arguments of a single `reg add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddCommand {
    /// Target key.
    pub key: KeyPath,
    /// Value to write; `None` creates the key only.
    pub value: Option<(String, RegistryValue)>,
    /// Multi-string separator for the data argument.
    pub separator: char,
    /// Registry view.
    pub view: RegView,
}

/// Arguments of a single `reg delete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteCommand {
    /// Target key.
    pub key: KeyPath,
    /// Value to delete; `None` deletes the whole key.
    pub value: Option<String>,
    /// Registry view.
    pub view: RegView,
}

/// The external tool, as seen by the core.
#[async_trait]
pub trait RegBackend: Send + Sync {
    /// Spawns a read (`reg query`) with piped output.
    fn spawn_query(&self, options: &QueryOptions) -> Result<Box<dyn ToolProcess>>;

    /// Spawns an export of `key` into the document at `path`.
    fn spawn_export(&self, key: &KeyPath, path: &Path, view: RegView) -> Result<Box<dyn ToolProcess>>;

    /// Runs `reg add` to completion.
    async fn add(&self, command: &AddCommand) -> Result<CommandOutput>;

    /// Runs `reg delete` to completion.
    async fn delete(&self, command: &DeleteCommand) -> Result<CommandOutput>;

    /// Runs `reg import` of the document at `path` to completion.
    async fn import(&self, path: &Path, view: RegView) -> Result<CommandOutput>;
}

/// Default backend driving `reg.exe`.
#[derive(Debug, Clone)]
pub struct RegExe {
    config: RegConfig,
}

impl RegExe {
    /// Creates a backend using the configured tool path and output encoding.
    pub fn new(config: RegConfig) -> Self {
        Self { config }
    }

    fn command(&self, args: Vec<OsString>) -> Command {
        debug!(tool = %self.config.reg_path.display(), ?args, "Spawning registry tool");
        let mut command = Command::new(&self.config.reg_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, args: Vec<OsString>) -> Result<CommandOutput> {
        let output = self.command(args).output().await?;
        let encoding = self.config.output_encoding;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: encoding.decode(&output.stdout).0.into_owned(),
            stderr: encoding.decode(&output.stderr).0.into_owned(),
        })
    }
}

#[async_trait]
impl RegBackend for RegExe {
    fn spawn_query(&self, options: &QueryOptions) -> Result<Box<dyn ToolProcess>> {
        let child = self.command(query_args(options)).spawn()?;
        Ok(Box::new(child))
    }

    fn spawn_export(&self, key: &KeyPath, path: &Path, view: RegView) -> Result<Box<dyn ToolProcess>> {
        let child = self.command(export_args(key, path, view)).spawn()?;
        Ok(Box::new(child))
    }

    async fn add(&self, command: &AddCommand) -> Result<CommandOutput> {
        self.run(add_args(command)).await
    }

    async fn delete(&self, command: &DeleteCommand) -> Result<CommandOutput> {
        self.run(delete_args(command)).await
    }

    async fn import(&self, path: &Path, view: RegView) -> Result<CommandOutput> {
        self.run(import_args(path, view)).await
    }
}

fn push_view(args: &mut Vec<OsString>, view: RegView) {
    if let Some(flag) = view.flag() {
        args.push(flag.into());
    }
}

fn push_value_selector(args: &mut Vec<OsString>, name: &str) {
    if is_default_name(name) {
        args.push("/ve".into());
    } else {
        args.push("/v".into());
        args.push(name.into());
    }
}

/// Builds the `reg query` argument vector.
pub fn query_args(options: &QueryOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["query".into(), options.key.as_str().into()];

    if let Some(name) = &options.value {
        push_value_selector(&mut args, name);
    } else if options.default_value {
        args.push("/ve".into());
    }
    if options.recursive {
        args.push("/s".into());
    }
    if let Some(separator) = options.separator.filter(|c| *c != '\0') {
        args.push("/se".into());
        args.push(separator.to_string().into());
    }
    if let Some(find) = &options.find {
        args.push("/f".into());
        args.push(find.pattern.as_str().into());
        if find.keys_only {
            args.push("/k".into());
        }
        if find.data_only {
            args.push("/d".into());
        }
        if find.case_sensitive {
            args.push("/c".into());
        }
        if find.exact {
            args.push("/e".into());
        }
    }
    if let Some(value_type) = options.value_type {
        args.push("/t".into());
        args.push(value_type.name().into());
    }
    push_view(&mut args, options.view);
    args
}

/// Builds the `reg export` argument vector.
pub fn export_args(key: &KeyPath, path: &Path, view: RegView) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "export".into(),
        key.as_str().into(),
        path.as_os_str().to_owned(),
        "/y".into(),
    ];
    push_view(&mut args, view);
    args
}

/// Builds the `reg add` argument vector.
pub fn add_args(command: &AddCommand) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["add".into(), command.key.as_str().into()];
    if let Some((name, value)) = &command.value {
        push_value_selector(&mut args, name);
        args.push("/t".into());
        args.push(value.value_type().name().into());
        if matches!(value, RegistryValue::MultiString(_)) && command.separator != '\0' {
            args.push("/s".into());
            args.push(command.separator.to_string().into());
        }
        if let Some(data) = value.reg_add_data(command.separator) {
            args.push("/d".into());
            args.push(data.into());
        }
    }
    args.push("/f".into());
    push_view(&mut args, command.view);
    args
}

/// Builds the `reg delete` argument vector.
pub fn delete_args(command: &DeleteCommand) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["delete".into(), command.key.as_str().into()];
    if let Some(name) = &command.value {
        push_value_selector(&mut args, name);
    }
    args.push("/f".into());
    push_view(&mut args, command.view);
    args
}

/// Builds the `reg import` argument vector.
pub fn import_args(path: &Path, view: RegView) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["import".into(), path.as_os_str().to_owned()];
    push_view(&mut args, view);
    args
}
