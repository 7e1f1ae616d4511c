//! Spool directory watcher.
//!
//! A platform bridge appends one JSON line per notification to `*.jsonl` files
//! in the spool directory. The watcher tails those files with [`notify`] and
//! emits complete lines together with their byte ranges. The caller persists
//! the offset of the last handled line, and passes the saved offsets back in
//! on the next start so nothing written while the agent was stopped is
//! skipped. A caller that cannot handle a line rewinds the file to it with
//! [`SpoolWatcher::rewind`] and asks for it again with
//! [`SpoolWatcher::schedule_read`].
//!
//! Bytes that are not valid UTF-8 are replaced with U+FFFD, so a corrupt line
//! never blocks the lines after it.
//!
//! The notify callback only forwards raw events through an internal channel;
//! a dedicated task does all file I/O.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::path::PathBuf;
//! use tokio::sync::mpsc;
//! use notirelay_agent::watcher::{SpoolWatcher, WatchEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tx, mut rx) = mpsc::channel(100);
//!     let _watcher = SpoolWatcher::new(PathBuf::from("/var/spool/notirelay"), HashMap::new(), tx)?;
//!
//!     while let Some(event) = rx.recv().await {
//!         if let WatchEvent::LinesAdded { path, lines, offset } = event {
//!             for line in &lines {
//!                 println!("{}@{}: {}", path.display(), line.start, line.text);
//!             }
//!             println!("now at {offset}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{
    event::{CreateKind, ModifyKind, RemoveKind},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, trace, warn};

const SPOOL_EXTENSION: &str = "jsonl";

/// Capacity of the channel between the notify callback and the reader task.
const INTERNAL_CHANNEL_CAPACITY: usize = 1000;

type Positions = Arc<RwLock<HashMap<PathBuf, u64>>>;

/// One complete, non-blank line of a spool file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolLine {
    /// Line content without the line terminator.
    pub text: String,
    /// Byte offset of the first byte of the line.
    pub start: u64,
    /// Byte offset just past the line's newline.
    pub end: u64,
}

/// Events emitted by the spool watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Complete lines appended to a spool file.
    LinesAdded {
        path: PathBuf,
        lines: Vec<SpoolLine>,
        /// Byte offset just past the last consumed newline, blank lines included.
        offset: u64,
    },

    /// A spool file disappeared; its saved offset is obsolete.
    FileRemoved(PathBuf),
}

#[derive(Debug)]
enum InternalEvent {
    FileCreated(PathBuf),
    FileModified(PathBuf),
    FileRemoved(PathBuf),
}

/// Errors that can occur while watching the spool.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("failed to create watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("spool directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("failed to send event: channel closed")]
    ChannelClosed,
}

/// Result type for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Tails `*.jsonl` files in one spool directory.
///
/// Dropping the watcher stops the subscription; the reader task ends once the
/// internal channel closes.
#[derive(Debug)]
pub struct SpoolWatcher {
    // Held for its subscription.
    _watcher: RecommendedWatcher,
    positions: Positions,
    spool_dir: PathBuf,
    event_sender: mpsc::Sender<WatchEvent>,
    internal_tx: mpsc::Sender<InternalEvent>,
}

impl SpoolWatcher {
    /// Starts watching `spool_dir`.
    ///
    /// Every existing spool file is read from its entry in `saved_offsets`,
    /// or from the beginning if it has none, and the backlog is emitted before
    /// any live change.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory does not exist, cannot be listed, or
    /// the file system watcher cannot be initialized.
    pub fn new(
        spool_dir: PathBuf,
        saved_offsets: HashMap<PathBuf, u64>,
        event_sender: mpsc::Sender<WatchEvent>,
    ) -> Result<Self> {
        if !spool_dir.is_dir() {
            return Err(WatcherError::DirectoryNotFound(spool_dir));
        }

        let existing = scan_spool_files(&spool_dir)?;
        let initial: HashMap<PathBuf, u64> = existing
            .iter()
            .map(|path| (path.clone(), saved_offsets.get(path).copied().unwrap_or(0)))
            .collect();
        let positions = Arc::new(RwLock::new(initial));

        info!(
            spool_dir = %spool_dir.display(),
            file_count = existing.len(),
            "Initialized spool watcher"
        );

        let (internal_tx, internal_rx) = mpsc::channel::<InternalEvent>(INTERNAL_CHANNEL_CAPACITY);

        let positions_for_task = Arc::clone(&positions);
        let sender_for_task = event_sender.clone();
        tokio::spawn(async move {
            for path in existing {
                handle_file_modified(&path, &positions_for_task, &sender_for_task).await;
            }
            process_internal_events(internal_rx, positions_for_task, sender_for_task).await;
        });

        let watcher = create_watcher(internal_tx.clone(), &spool_dir)?;

        Ok(Self {
            _watcher: watcher,
            positions,
            spool_dir,
            event_sender,
            internal_tx,
        })
    }

    #[must_use]
    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    pub async fn tracked_file_count(&self) -> usize {
        self.positions.read().await.len()
    }

    /// Current read offset of `path`, if tracked.
    pub async fn file_position(&self, path: &Path) -> Option<u64> {
        self.positions.read().await.get(path).copied()
    }

    /// Moves the read position of `path` back to `offset`.
    ///
    /// Lines from `offset` on are emitted again by the next read of the file.
    pub async fn rewind(&self, path: &Path, offset: u64) {
        let mut positions = self.positions.write().await;
        if let Some(position) = positions.get_mut(path) {
            debug!(path = %path.display(), from = *position, to = offset, "Rewinding spool file");
            *position = (*position).min(offset);
        }
    }

    /// Asks the reader task to read `path` again.
    ///
    /// Never blocks; the request is dropped with a warning if the reader is
    /// backlogged, in which case a pending read will pick up the lines anyway.
    pub fn schedule_read(&self, path: &Path) {
        if let Err(e) = self
            .internal_tx
            .try_send(InternalEvent::FileModified(path.to_path_buf()))
        {
            warn!(path = %path.display(), error = %e, "Failed to schedule spool read");
        }
    }

    /// Reads any new lines in `path` without waiting for a file system event.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the event channel is closed.
    pub async fn check_file(&self, path: &Path) -> Result<()> {
        if !is_spool_file(path) {
            return Ok(());
        }

        let (lines, offset) = {
            let mut positions = self.positions.write().await;
            let lines = read_new_lines(path, &mut positions)?;
            (lines, positions.get(path).copied().unwrap_or(0))
        };

        if !lines.is_empty() {
            self.event_sender
                .send(WatchEvent::LinesAdded {
                    path: path.to_path_buf(),
                    lines,
                    offset,
                })
                .await
                .map_err(|_| WatcherError::ChannelClosed)?;
        }

        Ok(())
    }
}

fn is_spool_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == SPOOL_EXTENSION)
}

fn create_watcher(
    internal_tx: mpsc::Sender<InternalEvent>,
    spool_dir: &Path,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| {
            handle_notify_event(res, &internal_tx);
        },
        Config::default(),
    )?;

    watcher.watch(spool_dir, RecursiveMode::NonRecursive)?;
    debug!(spool_dir = %spool_dir.display(), "Started spool watch");

    Ok(watcher)
}

fn handle_notify_event(
    res: std::result::Result<Event, notify::Error>,
    internal_tx: &mpsc::Sender<InternalEvent>,
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "Spool watcher error");
            return;
        }
    };

    trace!(kind = ?event.kind, paths = ?event.paths, "Received notify event");

    for path in &event.paths {
        if !is_spool_file(path) {
            continue;
        }

        let internal_event = match event.kind {
            EventKind::Create(CreateKind::File | CreateKind::Any) => {
                InternalEvent::FileCreated(path.clone())
            }
            EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
                InternalEvent::FileModified(path.clone())
            }
            EventKind::Remove(RemoveKind::File | RemoveKind::Any) => {
                InternalEvent::FileRemoved(path.clone())
            }
            _ => continue,
        };

        // Never block the notify thread; a missed modify is caught by the next one.
        if let Err(e) = internal_tx.try_send(internal_event) {
            warn!(error = %e, "Failed to queue spool event, channel may be full");
        }
    }
}

async fn process_internal_events(
    mut rx: mpsc::Receiver<InternalEvent>,
    positions: Positions,
    sender: mpsc::Sender<WatchEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            InternalEvent::FileCreated(path) => {
                info!(path = %path.display(), "New spool file detected");
                positions.write().await.entry(path.clone()).or_insert(0);
                handle_file_modified(&path, &positions, &sender).await;
            }
            InternalEvent::FileModified(path) => {
                handle_file_modified(&path, &positions, &sender).await;
            }
            InternalEvent::FileRemoved(path) => {
                info!(path = %path.display(), "Spool file removed");
                positions.write().await.remove(&path);
                if sender.send(WatchEvent::FileRemoved(path)).await.is_err() {
                    debug!("Spool event receiver dropped");
                    break;
                }
            }
        }
    }

    debug!("Spool event processor shutting down");
}

async fn handle_file_modified(path: &Path, positions: &Positions, sender: &mpsc::Sender<WatchEvent>) {
    let (lines, offset) = {
        let mut guard = positions.write().await;
        match read_new_lines(path, &mut guard) {
            Ok(lines) => (lines, guard.get(path).copied().unwrap_or(0)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read spool file");
                return;
            }
        }
    };

    if lines.is_empty() {
        trace!(path = %path.display(), "No new lines to read");
        return;
    }

    debug!(path = %path.display(), line_count = lines.len(), offset, "Read new spool lines");

    if let Err(e) = sender
        .send(WatchEvent::LinesAdded {
            path: path.to_path_buf(),
            lines,
            offset,
        })
        .await
    {
        error!(error = %e, "Failed to send LinesAdded event");
    }
}

/// Lists the spool files directly inside `dir`.
fn scan_spool_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_spool_file(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Reads complete lines after the tracked position.
///
/// The position only advances past the last newline, so a line still being
/// written is picked up whole on a later read. A file shorter than the tracked
/// position was truncated or replaced and is read from the start.
fn read_new_lines(path: &Path, positions: &mut HashMap<PathBuf, u64>) -> Result<Vec<SpoolLine>> {
    let mut file = File::open(path)?;
    let file_size = file.metadata()?.len();
    let last_position = positions.get(path).copied().unwrap_or(0);

    let start = if file_size < last_position {
        info!(
            path = %path.display(),
            old_pos = last_position,
            new_size = file_size,
            "Spool file truncated, reading from start"
        );
        0
    } else {
        last_position
    };

    if start >= file_size {
        positions.insert(path.to_path_buf(), start);
        return Ok(Vec::new());
    }

    file.seek(SeekFrom::Start(start))?;
    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();
    let mut consumed = start;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 || buf.last() != Some(&b'\n') {
            break;
        }
        let line_start = consumed;
        consumed += read as u64;

        let text = String::from_utf8_lossy(&buf);
        if matches!(text, Cow::Owned(_)) {
            warn!(path = %path.display(), offset = line_start, "Spool line is not valid UTF-8");
        }
        let text = text.trim_end_matches(&['\n', '\r'][..]);
        if !text.trim().is_empty() {
            lines.push(SpoolLine {
                text: text.to_string(),
                start: line_start,
                end: consumed,
            });
        }
    }

    positions.insert(path.to_path_buf(), consumed);
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn texts(lines: &[SpoolLine]) -> Vec<&str> {
        lines.iter().map(|line| line.text.as_str()).collect()
    }

    fn append(path: &Path, content: &str) {
        let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn reads_only_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.jsonl", "{\"n\":1}\n");
        let mut positions = HashMap::new();

        assert_eq!(
            texts(&read_new_lines(&path, &mut positions).unwrap()),
            vec!["{\"n\":1}"]
        );

        append(&path, "{\"n\":2}\n{\"n\":3}\n");
        let lines = read_new_lines(&path, &mut positions).unwrap();
        assert_eq!(texts(&lines), vec!["{\"n\":2}", "{\"n\":3}"]);
        assert_eq!((lines[0].start, lines[0].end), (8, 16));
        assert_eq!((lines[1].start, lines[1].end), (16, 24));
        assert!(read_new_lines(&path, &mut positions).unwrap().is_empty());
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.jsonl", "{\"n\":1}\n{\"n\":");
        let mut positions = HashMap::new();

        assert_eq!(
            texts(&read_new_lines(&path, &mut positions).unwrap()),
            vec!["{\"n\":1}"]
        );
        assert_eq!(positions.get(&path), Some(&8));

        append(&path, "2}\n");
        assert_eq!(
            texts(&read_new_lines(&path, &mut positions).unwrap()),
            vec!["{\"n\":2}"]
        );
    }

    #[test]
    fn truncated_file_is_reread_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.jsonl", "{\"n\":1}\n{\"n\":2}\n");
        let mut positions = HashMap::new();
        read_new_lines(&path, &mut positions).unwrap();

        fs::write(&path, "{\"x\":1}\n").unwrap();
        assert_eq!(
            texts(&read_new_lines(&path, &mut positions).unwrap()),
            vec!["{\"x\":1}"]
        );
    }

    #[test]
    fn blank_lines_and_crlf_are_handled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.jsonl", "{\"n\":1}\r\n\n   \n{\"n\":2}\n");
        let mut positions = HashMap::new();

        assert_eq!(
            texts(&read_new_lines(&path, &mut positions).unwrap()),
            vec!["{\"n\":1}", "{\"n\":2}"]
        );
    }

    #[test]
    fn invalid_utf8_does_not_stall_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        let mut content = b"{\"package\":\"com.a\"}\n{\"title\":\"".to_vec();
        content.extend_from_slice(&[0xff, 0xfe]);
        content.extend_from_slice(b"\"}\n{\"package\":\"com.b\"}\n");
        fs::write(&path, &content).unwrap();
        let mut positions = HashMap::new();

        let lines = read_new_lines(&path, &mut positions).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].text, "{\"package\":\"com.a\"}");
        assert_eq!(lines[1].text, "{\"title\":\"\u{fffd}\u{fffd}\"}");
        assert_eq!(lines[2].text, "{\"package\":\"com.b\"}");
        assert_eq!(positions.get(&path), Some(&(content.len() as u64)));

        append(&path, "{\"package\":\"com.c\"}\n");
        assert_eq!(
            texts(&read_new_lines(&path, &mut positions).unwrap()),
            vec!["{\"package\":\"com.c\"}"]
        );
    }

    #[test]
    fn scan_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "b.jsonl", "");
        write_file(dir.path(), "a.jsonl", "");
        write_file(dir.path(), "notes.txt", "");
        fs::create_dir(dir.path().join("nested.jsonl")).unwrap();

        let files = scan_spool_files(dir.path()).unwrap();
        assert_eq!(
            files,
            vec![dir.path().join("a.jsonl"), dir.path().join("b.jsonl")]
        );
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let (tx, _rx) = mpsc::channel(10);
        let result = SpoolWatcher::new(PathBuf::from("/nonexistent/notirelay/spool"), HashMap::new(), tx);
        assert!(matches!(result, Err(WatcherError::DirectoryNotFound(_))));
    }

    #[tokio::test]
    async fn backlog_resumes_from_saved_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.jsonl", "{\"n\":1}\n{\"n\":2}\n");
        let saved = HashMap::from([(path.clone(), 8)]);
        let (tx, mut rx) = mpsc::channel(10);

        let _watcher = SpoolWatcher::new(dir.path().to_path_buf(), saved, tx).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            WatchEvent::LinesAdded {
                path,
                lines: vec![SpoolLine {
                    text: "{\"n\":2}".to_string(),
                    start: 8,
                    end: 16,
                }],
                offset: 16,
            }
        );
    }

    #[tokio::test]
    async fn rewind_then_schedule_read_emits_lines_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.jsonl", "{\"n\":1}\n{\"n\":2}\n");
        let (tx, mut rx) = mpsc::channel(10);
        let watcher = SpoolWatcher::new(dir.path().to_path_buf(), HashMap::new(), tx).unwrap();

        let backlog = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(backlog, WatchEvent::LinesAdded { offset: 16, .. }));

        watcher.rewind(&path, 8).await;
        assert_eq!(watcher.file_position(&path).await, Some(8));
        watcher.schedule_read(&path);

        let again = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let WatchEvent::LinesAdded { lines, offset, .. } = again else {
            panic!("expected lines, got {again:?}");
        };
        assert_eq!(texts(&lines), vec!["{\"n\":2}"]);
        assert_eq!(lines[0].start, 8);
        assert_eq!(offset, 16);
    }

    #[tokio::test]
    async fn check_file_emits_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a.jsonl", "");
        let (tx, mut rx) = mpsc::channel(10);
        let watcher = SpoolWatcher::new(dir.path().to_path_buf(), HashMap::new(), tx).unwrap();
        assert_eq!(watcher.tracked_file_count().await, 1);

        append(&path, "{\"n\":1}\n");
        watcher.check_file(&path).await.unwrap();

        // The live watch may report the same append; either way the first
        // event carries the line.
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, WatchEvent::LinesAdded { ref lines, offset: 8, .. } if texts(lines) == vec!["{\"n\":1}"]));
        assert_eq!(watcher.file_position(&path).await, Some(8));
    }
}
