//! Simulated `reg` tool shared by the integration tests.
//!
//! [`FakeRegistry`] keeps an in-memory [`RegistryStruct`]: queries render it
//! in `reg query` text (a non-recursive query lists direct subkeys after the
//! key's values), exports write it as a document, and add / delete / import
//! mutate it. Individual keys can be overridden with a [`Script`].

#![allow(dead_code)]

use async_trait::async_trait;
use reg_shell::error::NOT_FOUND_TEXT;
use reg_shell::process::{AddCommand, BoxedReader, CommandOutput, DeleteCommand};
use reg_shell::utils::{decode_document, encode_utf16le_document};
use reg_shell::*;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

pub const ANCHOR: &str = "HKEY_CURRENT_USER\\Software\\Test";

/// Yields one queued chunk per read, then EOF (or nothing, when hanging).
pub struct ChunkedReader {
    chunks: VecDeque<Vec<u8>>,
    hang: bool,
}

impl ChunkedReader {
    pub fn new(chunks: Vec<Vec<u8>>, hang: bool) -> Self {
        Self {
            chunks: chunks.into_iter().filter(|c| !c.is_empty()).collect(),
            hang,
        }
    }
}

impl AsyncRead for ChunkedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let hang = self.hang;
        match self.chunks.front_mut() {
            Some(chunk) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                chunk.drain(..n);
                if chunk.is_empty() {
                    self.chunks.pop_front();
                }
                Poll::Ready(Ok(()))
            }
            None if hang => Poll::Pending,
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Scripted behaviour of one spawned process.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub chunks: Vec<Vec<u8>>,
    pub stderr: String,
    pub code: Option<i32>,
    pub hang: bool,
}

impl Script {
    pub fn output(text: &str) -> Self {
        Self {
            chunks: vec![text.as_bytes().to_vec()],
            code: Some(0),
            ..Self::default()
        }
    }

    pub fn failure(code: Option<i32>, stderr: &str) -> Self {
        Self {
            stderr: stderr.to_string(),
            code,
            ..Self::default()
        }
    }

    /// Re-chunks stdout into pieces of at most `size` bytes.
    pub fn split_every(mut self, size: usize) -> Self {
        let bytes: Vec<u8> = self.chunks.concat();
        self.chunks = bytes.chunks(size.max(1)).map(<[u8]>::to_vec).collect();
        self
    }

    /// Keeps stdout open after the last chunk.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

pub struct ScriptedProcess {
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    code: Option<i32>,
    killed: Arc<AtomicBool>,
}

impl ScriptedProcess {
    pub fn new(script: Script, killed: Arc<AtomicBool>) -> Self {
        let stderr = ChunkedReader::new(vec![script.stderr.into_bytes()], false);
        Self {
            stdout: Some(Box::pin(ChunkedReader::new(script.chunks, script.hang))),
            stderr: Some(Box::pin(stderr)),
            code: script.code,
            killed,
        }
    }
}

#[async_trait]
impl ToolProcess for ScriptedProcess {
    fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take()
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.code)
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A recorded tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Query(QueryOptions),
    Export { key: KeyPath, path: PathBuf },
    Add(AddCommand),
    Delete(DeleteCommand),
    Import { path: PathBuf, text: String },
}

#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<RegistryStruct>,
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<Call>>,
    import_failure: Mutex<Option<CommandOutput>>,
    pub killed: Arc<AtomicBool>,
}

impl FakeRegistry {
    pub fn new(state: RegistryStruct) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            ..Self::default()
        })
    }

    /// Overrides what a query of `key` prints.
    pub fn script(&self, key: &str, script: Script) {
        let key = KeyPath::new(key);
        self.scripts
            .lock()
            .unwrap()
            .insert(key.as_str().to_lowercase(), script);
    }

    pub fn fail_imports(&self, stderr: &str) {
        *self.import_failure.lock().unwrap() = Some(CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
    }

    pub fn state(&self) -> RegistryStruct {
        self.state.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Query(_) | Call::Export { .. }))
            .collect()
    }

    pub fn client(self: &Arc<Self>, config: RegConfig) -> RegClient {
        RegClient::with_backend(config, self.clone())
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    /// `key` and its descendants, or `None` when `key` does not exist.
    fn subtree(&self, key: &KeyPath) -> Option<RegistryStruct> {
        let state = self.state.lock().unwrap();
        if !state.contains_key(key) {
            return None;
        }
        let mut out = RegistryStruct::new();
        for (k, values) in state.iter() {
            if key.is_ancestor_of(k) {
                out.insert_key(k.clone()).extend(values.clone());
            }
        }
        Some(out)
    }

    /// What `reg query` prints for `options`, or `None` for a missing key.
    pub fn query_text(&self, options: &QueryOptions) -> Option<String> {
        let separator = options.separator.unwrap_or('\0');
        let tree = self.subtree(&options.key)?;
        if options.recursive {
            return Some(render_query_text_with(&tree, separator));
        }

        let own: RegistryStruct = tree
            .iter()
            .filter(|(k, _)| *k == &options.key)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut text = render_query_text_with(&own, separator);
        for child in direct_subkeys(&tree, &options.key) {
            text.push_str(&format!("{}\r\n", child));
        }
        Some(text)
    }
}

fn ok() -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: "The operation completed successfully.\r\n".into(),
        stderr: String::new(),
    }
}

fn not_found() -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: NOT_FOUND_TEXT.into(),
    }
}

#[async_trait]
impl RegBackend for FakeRegistry {
    fn spawn_query(&self, options: &QueryOptions) -> Result<Box<dyn ToolProcess>> {
        self.record(Call::Query(options.clone()));
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get(&options.key.as_str().to_lowercase())
            .cloned();
        let script = match scripted {
            Some(script) => script,
            None => match self.query_text(options) {
                Some(text) => Script::output(&text),
                None => Script::failure(Some(1), NOT_FOUND_TEXT),
            },
        };
        Ok(Box::new(ScriptedProcess::new(script, self.killed.clone())))
    }

    fn spawn_export(&self, key: &KeyPath, path: &Path, _view: RegView) -> Result<Box<dyn ToolProcess>> {
        self.record(Call::Export {
            key: key.clone(),
            path: path.to_path_buf(),
        });
        let script = match self.subtree(key) {
            Some(data) => {
                std::fs::write(path, encode_utf16le_document(&render_struct(&data)?))?;
                Script::output("The operation completed successfully.\r\n")
            }
            None => Script::failure(Some(1), NOT_FOUND_TEXT),
        };
        Ok(Box::new(ScriptedProcess::new(script, self.killed.clone())))
    }

    async fn add(&self, command: &AddCommand) -> Result<CommandOutput> {
        self.record(Call::Add(command.clone()));
        let mut state = self.state.lock().unwrap();
        match &command.value {
            Some((name, value)) => state.insert_value(command.key.clone(), name.clone(), value.clone()),
            None => {
                state.insert_key(command.key.clone());
            }
        }
        Ok(ok())
    }

    async fn delete(&self, command: &DeleteCommand) -> Result<CommandOutput> {
        self.record(Call::Delete(command.clone()));
        let mut state = self.state.lock().unwrap();
        let removed = match &command.value {
            Some(name) => state.remove_value(&command.key, name).is_some(),
            None => state.remove_tree(&command.key) > 0,
        };
        Ok(if removed { ok() } else { not_found() })
    }

    async fn import(&self, path: &Path, _view: RegView) -> Result<CommandOutput> {
        let bytes = tokio::fs::read(path).await?;
        let (text, _) = decode_document(&bytes);
        self.record(Call::Import {
            path: path.to_path_buf(),
            text: text.clone(),
        });
        if let Some(failure) = self.import_failure.lock().unwrap().clone() {
            return Ok(failure);
        }

        let document = parse_document(&text)?;
        let mut state = self.state.lock().unwrap();
        for key in &document.deleted_keys {
            state.remove_tree(key);
        }
        for (key, name) in &document.deleted_values {
            state.remove_value(key, name);
        }
        state.merge_from(document.data);
        // `reg import` reports success on stderr.
        Ok(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: "The operation completed successfully.\r\n".into(),
        })
    }
}

/// Direct children of `key`, including ones only implied by deeper keys.
fn direct_subkeys(tree: &RegistryStruct, key: &KeyPath) -> BTreeSet<KeyPath> {
    let prefix_len = key.as_str().len() + 1;
    tree.keys()
        .filter(|k| *k != key)
        .filter_map(|k| {
            let rest = k.as_str().get(prefix_len..)?;
            let name = rest.split('\\').next()?;
            Some(KeyPath::new(format!("{}\\{}", key.as_str(), name)))
        })
        .collect()
}

/// Formats `data` the way `reg query /s` prints it.
pub fn render_query_text(data: &RegistryStruct) -> String {
    render_query_text_with(data, '\0')
}

/// Like [`render_query_text`], printing multi-strings joined by `separator`
/// (`'\0'` prints the tool's `\0` token).
pub fn render_query_text_with(data: &RegistryStruct, separator: char) -> String {
    let mut out = String::from("\r\n");
    for (key, values) in data {
        out.push_str(key.as_str());
        out.push_str("\r\n");
        if !values.keys().any(|name| name.eq_ignore_ascii_case("(Default)")) {
            out.push_str("    (Default)    REG_SZ    (value not set)\r\n");
        }
        for (name, value) in values {
            out.push_str(&format!(
                "    {}    {}    {}\r\n",
                name,
                value.value_type().name(),
                query_payload(value, separator)
            ));
        }
        out.push_str("\r\n");
    }
    out
}

fn query_payload(value: &RegistryValue, separator: char) -> String {
    match value {
        RegistryValue::String(s) | RegistryValue::ExpandString(s) => s.clone(),
        RegistryValue::Dword(n) => format!("0x{:x}", n),
        RegistryValue::Qword(n) => format!("0x{:x}", n),
        RegistryValue::MultiString(items) if separator == '\0' => items.join("\\0"),
        RegistryValue::MultiString(items) => items.join(&separator.to_string()),
        RegistryValue::Binary(bytes) => bytes.iter().map(|b| format!("{:02X}", b)).collect(),
        RegistryValue::None(_) => String::new(),
    }
}

pub fn key(s: &str) -> KeyPath {
    KeyPath::new(s)
}
