//! Query orchestration.
//!
//! A single query moves through `Starting -> Streaming -> (Success | Empty |
//! Error | TimedOut)`: the tool is spawned, its stdout is decoded and fed
//! through the [`LineReassembler`] and [`RecordInterpreter`] as chunks
//! arrive, stderr is buffered verbatim, and the exit condition is classified
//! once the process ends. Several queries issued together run as a
//! [`TaskGroup`] and their results are merged.

use crate::cancel::{Cancellable, StopHandle, TaskGroup};
use crate::config::{ParseMode, RegConfig, DEFAULT_TIMEOUT};
use crate::document::{is_complete_document, parse_document};
use crate::error::{is_not_found, RegistryError, Result};
use crate::interpreter::RecordInterpreter;
use crate::key::KeyPath;
use crate::process::{BoxedReader, RegBackend, RegExe, RegView, ToolProcess};
use crate::reassembler::LineReassembler;
use crate::state::{QueryResult, RegistryStruct};
use crate::utils::decode_document;
use crate::value::ValueType;
use encoding_rs::Decoder;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Stdout text printed by a find-mode query that matched nothing.
pub const ZERO_MATCHES_TEXT: &str = "End of search: 0 match(es) found.";

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Progress callback: receives the structure parsed so far and the stop
/// handle of the running query. Returning `ControlFlow::Break` ends the
/// query early with the partial structure.
///
/// The callback runs after the read task yields, never from inside a read.
/// Under [`RegClient::query_many`] it sees the reporting query's own partial
/// structure, while its stop handle and a `Break` end the whole group.
pub type ProgressFn =
    Arc<dyn Fn(&RegistryStruct, &StopHandle) -> ControlFlow<()> + Send + Sync>;

/// Find-mode (`/f`) options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FindOptions {
    /// Search pattern.
    pub pattern: String,
    /// Search key names only (`/k`).
    pub keys_only: bool,
    /// Search data only (`/d`).
    pub data_only: bool,
    /// Case-sensitive search (`/c`).
    pub case_sensitive: bool,
    /// Exact matches only (`/e`).
    pub exact: bool,
}

/// Canonical options for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryOptions {
    /// Key to query; also the anchor for line reassembly.
    pub key: KeyPath,
    /// Query all subkeys (`/s`).
    pub recursive: bool,
    /// Query one named value (`/v`).
    pub value: Option<String>,
    /// Query the default value only (`/ve`).
    pub default_value: bool,
    /// Find mode.
    pub find: Option<FindOptions>,
    /// Restrict to one value type (`/t`).
    pub value_type: Option<ValueType>,
    /// Registry view.
    pub view: RegView,
    /// Multi-string separator override (`/se`).
    pub separator: Option<char>,
    /// Timeout override.
    pub timeout: Option<Duration>,
    /// Parse mode override.
    pub parse_mode: Option<ParseMode>,
}

impl QueryOptions {
    /// Options querying `key` with defaults for everything else.
    pub fn new(key: impl Into<KeyPath>) -> Self {
        Self {
            key: key.into(),
            recursive: false,
            value: None,
            default_value: false,
            find: None,
            value_type: None,
            view: RegView::Native,
            separator: None,
            timeout: None,
            parse_mode: None,
        }
    }

    /// Enables `/s`.
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    /// Sets the parse mode override.
    pub fn with_parse_mode(mut self, mode: ParseMode) -> Self {
        self.parse_mode = Some(mode);
        self
    }

    /// Sets the timeout override.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables find mode.
    pub fn with_find(mut self, find: FindOptions) -> Self {
        self.find = Some(find);
        self
    }
}

/// A query as accepted at the API boundary: a bare key path or full options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTarget {
    /// Shorthand for [`QueryOptions::new`].
    KeyPathOnly(String),
    /// Fully specified options.
    Full(QueryOptions),
}

impl QueryTarget {
    /// Normalizes into canonical options.
    pub fn into_options(self) -> QueryOptions {
        match self {
            QueryTarget::KeyPathOnly(path) => QueryOptions::new(path),
            QueryTarget::Full(options) => options,
        }
    }
}

impl From<&str> for QueryTarget {
    fn from(s: &str) -> Self {
        QueryTarget::KeyPathOnly(s.to_string())
    }
}

impl From<String> for QueryTarget {
    fn from(s: String) -> Self {
        QueryTarget::KeyPathOnly(s)
    }
}

impl From<&KeyPath> for QueryTarget {
    fn from(k: &KeyPath) -> Self {
        QueryTarget::KeyPathOnly(k.as_str().to_string())
    }
}

impl From<QueryOptions> for QueryTarget {
    fn from(options: QueryOptions) -> Self {
        QueryTarget::Full(options)
    }
}

/// How a finished read process ended.
#[derive(Debug)]
pub(crate) enum ExitOutcome {
    /// Output is valid; flush and return it.
    Parsed,
    /// Find mode matched nothing.
    Empty,
    /// The key or value does not exist.
    Missing,
    /// The tool failed.
    Failed(RegistryError),
}

/// Classifies a read's exit condition, highest priority first.
pub(crate) fn classify_exit(
    find_mode: bool,
    zero_matches: bool,
    code: Option<i32>,
    stderr: &str,
) -> ExitOutcome {
    if find_mode && zero_matches {
        return ExitOutcome::Empty;
    }
    if is_not_found(stderr) {
        return ExitOutcome::Missing;
    }
    if let Some(e) = RegistryError::from_stderr(stderr) {
        return ExitOutcome::Failed(e);
    }
    let stderr_empty = stderr.trim().is_empty();
    if code.is_none() && stderr_empty {
        return ExitOutcome::Failed(RegistryError::ReadTooWide);
    }
    if code != Some(0) || !stderr_empty {
        return ExitOutcome::Failed(RegistryError::unknown_failure(code, stderr));
    }
    ExitOutcome::Parsed
}

/// Entry point for reads against the registry tool.
#[derive(Clone)]
pub struct RegClient {
    config: RegConfig,
    backend: Arc<dyn RegBackend>,
}

impl fmt::Debug for RegClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for RegClient {
    fn default() -> Self {
        Self::new(RegConfig::default())
    }
}

impl RegClient {
    /// Creates a client driving `reg.exe` per `config`.
    pub fn new(config: RegConfig) -> Self {
        let backend = Arc::new(RegExe::new(config.clone()));
        Self { config, backend }
    }

    /// Creates a client over a custom backend.
    pub fn with_backend(config: RegConfig, backend: Arc<dyn RegBackend>) -> Self {
        Self { config, backend }
    }

    /// The client configuration.
    pub fn config(&self) -> &RegConfig {
        &self.config
    }

    /// The tool backend.
    pub fn backend(&self) -> &Arc<dyn RegBackend> {
        &self.backend
    }

    /// Queries one key.
    ///
    /// A missing key resolves successfully with the key in
    /// [`QueryResult::missing_keys`].
    pub fn query(&self, target: impl Into<QueryTarget>) -> Cancellable<QueryResult> {
        self.query_with_progress(target, None)
    }

    /// Queries one key, reporting partial structures to `progress`.
    pub fn query_with_progress(
        &self,
        target: impl Into<QueryTarget>,
        progress: Option<ProgressFn>,
    ) -> Cancellable<QueryResult> {
        self.query_with_stop(target.into().into_options(), progress, StopHandle::new())
    }

    /// Queries several keys concurrently and merges the results in issue
    /// order. A single target skips the merge.
    pub fn query_many<I, T>(&self, targets: I, progress: Option<ProgressFn>) -> Cancellable<QueryResult>
    where
        I: IntoIterator<Item = T>,
        T: Into<QueryTarget>,
    {
        let options = targets.into_iter().map(|t| t.into().into_options()).collect();
        self.query_many_with_stop(options, progress, StopHandle::new())
    }

    pub(crate) fn query_many_with_stop(
        &self,
        mut options: Vec<QueryOptions>,
        progress: Option<ProgressFn>,
        stop: StopHandle,
    ) -> Cancellable<QueryResult> {
        if options.len() == 1 {
            if let Some(single) = options.pop() {
                return self.query_with_stop(single, progress, stop);
            }
        }

        let mut group = TaskGroup::with_stop_handle(stop);
        let progress = progress.map(|callback| group_progress(callback, group.stop_handle()));
        for opts in options {
            let child = self.query_with_stop(opts, progress.clone(), group.stop_handle().child());
            group.push(child);
        }
        group.into_cancellable().map(QueryResult::merge)
    }

    /// Reads `key` through the export path: the tool writes a document to a
    /// temporary file which is polled until complete and then parsed.
    pub fn export(&self, key: impl Into<KeyPath>, view: RegView) -> Cancellable<QueryResult> {
        let key = key.into();
        let backend = self.backend.clone();
        let config = self.config.clone();
        let timeout = config.timeout;
        Cancellable::new(move |stop| run_export(backend, config, key, view, stop)).with_timeout(timeout)
    }

    fn query_with_stop(
        &self,
        mut options: QueryOptions,
        progress: Option<ProgressFn>,
        stop: StopHandle,
    ) -> Cancellable<QueryResult> {
        // The tool must print the separator the interpreter splits on.
        options.separator = options.separator.or(Some(self.config.separator));
        let backend = self.backend.clone();
        let config = self.config.clone();
        let timeout = options.timeout.or(config.timeout);
        Cancellable::with_stop_handle(stop, move |stop| {
            run_query(backend, config, options, progress, stop)
        })
        .with_timeout(timeout)
    }
}

/// Routes a child's progress stop and `Break` to the whole group.
fn group_progress(callback: ProgressFn, group: StopHandle) -> ProgressFn {
    Arc::new(move |data: &RegistryStruct, _child: &StopHandle| {
        let flow = callback(data, &group);
        if flow.is_break() {
            group.stop();
        }
        flow
    })
}

/// Streaming parse state of one read.
struct ReadPipeline {
    decoder: Decoder,
    reassembler: LineReassembler,
    interpreter: RecordInterpreter,
    zero_matches: bool,
}

impl ReadPipeline {
    fn push_text(&mut self, text: &str) -> Result<()> {
        let lines = self.reassembler.feed(text);
        self.push_lines(lines)
    }

    fn push_lines(&mut self, lines: Vec<String>) -> Result<()> {
        for line in lines {
            if line.trim() == ZERO_MATCHES_TEXT {
                self.zero_matches = true;
            }
            self.interpreter.push_line(&line)?;
        }
        Ok(())
    }

    fn decode(&mut self, bytes: &[u8], last: bool) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len() * 3 + 16);
        let mut text = String::with_capacity(capacity);
        let _ = self.decoder.decode_to_string(bytes, &mut text, last);
        text
    }
}

async fn read_some(reader: &mut Option<BoxedReader>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => Ok(0),
    }
}

fn kill_quietly(child: &mut Box<dyn ToolProcess>) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill request failed; process likely exited");
    }
}

#[instrument(skip_all, fields(key = %options.key))]
async fn run_query(
    backend: Arc<dyn RegBackend>,
    config: RegConfig,
    options: QueryOptions,
    progress: Option<ProgressFn>,
    stop: StopHandle,
) -> Result<QueryResult> {
    let mut pipeline = ReadPipeline {
        decoder: config.output_encoding.new_decoder(),
        reassembler: LineReassembler::new(&options.key)?,
        interpreter: RecordInterpreter::new(
            options.parse_mode.unwrap_or(config.parse_mode),
            options.separator.unwrap_or(config.separator),
        ),
        zero_matches: false,
    };

    debug!("Starting query");
    let mut child = backend.spawn_query(&options)?;
    let mut stdout = child.take_stdout();
    let mut stderr = child.take_stderr();
    let mut stdout_open = stdout.is_some();
    let mut stderr_open = stderr.is_some();
    let mut stderr_bytes = Vec::new();
    let mut out_buf = vec![0u8; READ_CHUNK_SIZE];
    let mut err_buf = vec![0u8; 1024];
    let mut total = 0usize;

    while stdout_open || stderr_open {
        tokio::select! {
            biased;
            _ = stop.stopped() => {
                info!("Query stopped mid-stream; returning partial result");
                kill_quietly(&mut child);
                return Ok(pipeline.interpreter.finish());
            }
            read = read_some(&mut stdout, &mut out_buf), if stdout_open => {
                let n = read?;
                if n == 0 {
                    stdout_open = false;
                    let text = pipeline.decode(&[], true);
                    pipeline.push_text(&text)?;
                    continue;
                }

                total += n;
                if total > config.max_output_bytes {
                    warn!(total, limit = config.max_output_bytes, "Read exceeded output bound; killing tool");
                    kill_quietly(&mut child);
                    return Err(RegistryError::ReadTooWide);
                }

                let text = pipeline.decode(&out_buf[..n], false);
                pipeline.push_text(&text)?;

                if let Some(progress) = &progress {
                    tokio::task::yield_now().await;
                    let data = pipeline.interpreter.data();
                    if !data.is_empty() && (progress(data, &stop).is_break() || stop.is_stopped()) {
                        info!("Progress callback ended the query early");
                        kill_quietly(&mut child);
                        return Ok(pipeline.interpreter.finish());
                    }
                }
            }
            read = read_some(&mut stderr, &mut err_buf), if stderr_open => {
                let n = read?;
                if n == 0 {
                    stderr_open = false;
                } else {
                    stderr_bytes.extend_from_slice(&err_buf[..n]);
                }
            }
        }
    }

    let code = tokio::select! {
        biased;
        _ = stop.stopped() => {
            kill_quietly(&mut child);
            return Ok(pipeline.interpreter.finish());
        }
        status = child.wait() => status?,
    };

    let stderr_text = config.output_encoding.decode(&stderr_bytes).0.into_owned();
    let tail = pipeline.reassembler.finish();
    if tail.iter().any(|line| line.trim() == ZERO_MATCHES_TEXT) {
        pipeline.zero_matches = true;
    }

    match classify_exit(options.find.is_some(), pipeline.zero_matches, code, &stderr_text) {
        ExitOutcome::Empty => {
            debug!("Find matched nothing");
            Ok(QueryResult::default())
        }
        ExitOutcome::Missing => {
            debug!("Key not found");
            Ok(QueryResult::missing(options.key))
        }
        ExitOutcome::Failed(e) => {
            debug!(?code, error = %e, "Query failed");
            Err(e)
        }
        ExitOutcome::Parsed => {
            pipeline.push_lines(tail)?;
            let result = pipeline.interpreter.finish();
            debug!(keys = result.data.len(), had_errors = result.had_errors, "Query finished");
            Ok(result)
        }
    }
}

#[instrument(skip_all, fields(key = %key))]
async fn run_export(
    backend: Arc<dyn RegBackend>,
    config: RegConfig,
    key: KeyPath,
    view: RegView,
    stop: StopHandle,
) -> Result<QueryResult> {
    // Removed when dropped, on every exit path.
    let document = tempfile::Builder::new()
        .prefix(&config.temp_prefix)
        .suffix(".reg")
        .tempfile()?;
    let path = document.path().to_path_buf();

    let mut child = backend.spawn_export(&key, &path, view)?;
    let mut stderr = child.take_stderr();
    let mut stderr_bytes = Vec::new();

    let code = tokio::select! {
        biased;
        _ = stop.stopped() => {
            kill_quietly(&mut child);
            return Ok(QueryResult::default());
        }
        status = async {
            if let Some(reader) = stderr.as_mut() {
                reader.read_to_end(&mut stderr_bytes).await?;
            }
            child.wait().await
        } => status?,
    };

    let stderr_text = config.output_encoding.decode(&stderr_bytes).0.into_owned();
    match classify_exit(false, false, code, &stderr_text) {
        ExitOutcome::Missing => return Ok(QueryResult::missing(key)),
        ExitOutcome::Failed(e) => return Err(e),
        ExitOutcome::Empty | ExitOutcome::Parsed => {}
    }

    let bound = config.timeout.unwrap_or(DEFAULT_TIMEOUT);
    let deadline = Instant::now() + bound;
    loop {
        let bytes = tokio::fs::read(&path).await?;
        let (text, had_errors) = decode_document(&bytes);
        if is_complete_document(&text) {
            let parsed = parse_document(&text)?;
            debug!(keys = parsed.data.len(), "Export parsed");
            return Ok(QueryResult::found(parsed.data, had_errors));
        }
        if Instant::now() >= deadline {
            return Err(RegistryError::Timeout(bound));
        }
        tokio::select! {
            biased;
            _ = stop.stopped() => return Ok(QueryResult::default()),
            _ = tokio::time::sleep(config.export_poll_interval) => {}
        }
    }
}
