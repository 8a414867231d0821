//! Console plumbing for one instance: drains the server's stdout/stderr
//! into the on-disk log, the telemetry observer and live subscribers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader,
};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{Error, IoContext, Result};

const LIVE_CAPACITY: usize = 1024;
const LINE_QUEUE: usize = 1024;
const MAX_LINE_BYTES: usize = 16 * 1024;
const TAIL_WINDOW_BYTES: u64 = 8 * 1024;
const NOTE_PREFIX: &str = "[craft-agent]";

/// Receives every line the server prints, in order.
pub trait ConsoleObserver: Send + Sync {
    fn on_line(&self, line: &str);
}

struct LogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl LogWriter {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    fn rotated(&self, n: usize) -> PathBuf {
        PathBuf::from(format!("{}.{n}", self.path.display()))
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        for i in (1..self.max_files).rev() {
            let from = self.rotated(i);
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(&from, self.rotated(i + 1)).await;
            }
        }
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, self.rotated(1)).await;
        }

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');

        let len = buf.len() as u64;
        if self.max_bytes > 0 && self.bytes > 0 && self.bytes.saturating_add(len) > self.max_bytes {
            if let Err(e) = self.rotate().await {
                tracing::warn!(path = %self.path.display(), error = %e, "console log rotation failed");
            }
        }

        self.file.write_all(buf.as_bytes()).await?;
        // Replay reads the file directly, so every line must be visible on disk.
        self.file.flush().await?;
        self.bytes = self.bytes.saturating_add(len);
        Ok(())
    }
}

#[derive(Default)]
struct BridgeState {
    writer: Option<LogWriter>,
    generation: u64,
    /// Generation of the drain that owns `live`.
    attached: Option<u64>,
    live: Option<broadcast::Sender<String>>,
}

/// One process's output drain.
#[derive(Debug)]
pub struct Attachment {
    pub generation: u64,
    pub drain: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ConsoleBridge {
    instance_id: String,
    log_path: PathBuf,
    replay_lines: usize,
    max_bytes: u64,
    max_files: usize,
    observer: Option<Arc<dyn ConsoleObserver>>,
    state: Arc<Mutex<BridgeState>>,
}

impl ConsoleBridge {
    pub fn new(
        instance_id: impl Into<String>,
        log_path: impl Into<PathBuf>,
        replay_lines: usize,
        max_bytes: u64,
        max_files: usize,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            log_path: log_path.into(),
            replay_lines,
            max_bytes,
            max_files: max_files.max(1),
            observer: None,
            state: Arc::new(Mutex::new(BridgeState::default())),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConsoleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Whether a drain is currently feeding live subscribers.
    pub async fn is_attached(&self) -> bool {
        self.state.lock().await.live.is_some()
    }

    /// Start draining a freshly spawned process. Any earlier drain loses the
    /// live side; its remaining output only reaches the log file.
    pub async fn attach<O, E>(&self, stdout: O, stderr: E) -> Attachment
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (live_tx, _) = broadcast::channel::<String>(LIVE_CAPACITY);
        let generation = {
            let mut st = self.state.lock().await;
            st.generation = st.generation.wrapping_add(1);
            st.attached = Some(st.generation);
            st.live = Some(live_tx);
            st.generation
        };

        // Both readers funnel into one queue so lines keep their arrival order.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_QUEUE);
        tokio::spawn(read_lines(stdout, line_tx.clone()));
        tokio::spawn(read_lines(stderr, line_tx));

        let bridge = self.clone();
        let drain = tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                bridge.publish(line, Some(generation)).await;
            }
            bridge.detach(generation).await;
            tracing::debug!(instance_id = %bridge.instance_id, generation, "console drain finished");
        });
        Attachment { generation, drain }
    }

    /// End the live tail of `generation`. Subscribers see end-of-stream; a
    /// newer attachment is left alone.
    pub async fn detach(&self, generation: u64) {
        let mut st = self.state.lock().await;
        if st.attached == Some(generation) {
            st.attached = None;
            st.live = None;
        }
    }

    /// Append an agent-authored line to the console log. Notes are replayed
    /// and broadcast like server output but never reach the observer.
    pub async fn emit_note(&self, text: impl AsRef<str>) {
        self.publish(format!("{NOTE_PREFIX} {}", text.as_ref()), None)
            .await;
    }

    /// `source` is the drain generation, `None` for notes. Lines from a
    /// detached drain are logged but neither observed nor broadcast.
    async fn publish(&self, line: String, source: Option<u64>) {
        let mut st = self.state.lock().await;

        if st.writer.is_none() {
            match LogWriter::open(self.log_path.clone(), self.max_bytes, self.max_files).await {
                Ok(w) => st.writer = Some(w),
                Err(e) => tracing::warn!(
                    instance_id = %self.instance_id,
                    path = %self.log_path.display(),
                    error = %e,
                    "failed to open console log"
                ),
            }
        }
        if let Some(w) = st.writer.as_mut()
            && let Err(e) = w.write_line(&line).await
        {
            tracing::warn!(instance_id = %self.instance_id, error = %e, "console log write failed");
        }

        if source.is_some() && source != st.attached {
            return;
        }
        if source.is_some()
            && let Some(observer) = &self.observer
        {
            observer.on_line(&line);
        }
        if let Some(tx) = &st.live {
            // No receivers is fine.
            let _ = tx.send(line);
        }
    }

    /// Replay the last lines on disk, then follow live output until the
    /// process exits. Replay-only when nothing is attached.
    pub async fn subscribe(&self) -> Result<BoxStream<'static, String>> {
        // Holding the state lock pins the seam between replay and live tail.
        let (replay, live_rx) = {
            let st = self.state.lock().await;
            let live_rx = st.live.as_ref().map(|tx| tx.subscribe());
            let replay = read_tail_lines(&self.log_path, self.replay_lines).await?;
            (replay, live_rx)
        };

        let replay = stream::iter(replay);
        let Some(rx) = live_rx else {
            return Ok(replay.boxed());
        };

        let instance_id = self.instance_id.clone();
        let live = BroadcastStream::new(rx).filter_map(move |item| {
            let line = match item {
                Ok(line) => Some(line),
                Err(e) => {
                    tracing::debug!(instance_id = %instance_id, error = %e, "console subscriber lagged");
                    None
                }
            };
            futures_util::future::ready(line)
        });
        Ok(replay.chain(live).boxed())
    }

    /// Point read of the last `n` lines in the current log file.
    pub async fn recent_lines(&self, n: usize) -> Result<Vec<String>> {
        // Serialize against the drain so a half-written line is never seen.
        let _st = self.state.lock().await;
        read_tail_lines(&self.log_path, n).await
    }
}

/// Read one line into `buf`, keeping at most `MAX_LINE_BYTES` of it. Returns
/// the bytes consumed, 0 at EOF.
async fn read_capped_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed);
        }
        let (used, done) = match available.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        let room = MAX_LINE_BYTES.saturating_sub(buf.len());
        buf.extend_from_slice(&available[..used.min(room)]);
        reader.consume(used);
        consumed += used;
        if done {
            return Ok(consumed);
        }
    }
}

async fn read_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::<u8>::new();
    loop {
        buf.clear();
        match read_capped_line(&mut reader, &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']).to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "console stream read failed");
                break;
            }
        }
    }
}

fn split_lines_from_tail(buf: &[u8], skip_partial_first: bool, max_lines: usize) -> Vec<String> {
    // Best-effort UTF-8: invalid sequences are replaced.
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    if skip_partial_first && !out.is_empty() {
        out.remove(0);
    }
    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

/// Last `max_lines` lines of `path`, reading backwards in growing windows.
async fn read_tail_lines(path: &Path, max_lines: usize) -> Result<Vec<String>> {
    if max_lines == 0 {
        return Ok(Vec::new());
    }
    let mut f = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(Error::Io {
                context: format!("open {}", path.display()),
                source,
            });
        }
    };
    let size = f
        .metadata()
        .await
        .io_context(|| format!("stat {}", path.display()))?
        .len();

    let mut window = TAIL_WINDOW_BYTES;
    loop {
        let start = size.saturating_sub(window);
        f.seek(std::io::SeekFrom::Start(start))
            .await
            .io_context(|| format!("seek {}", path.display()))?;
        let mut buf = Vec::with_capacity((size - start) as usize);
        f.read_to_end(&mut buf)
            .await
            .io_context(|| format!("read {}", path.display()))?;

        let newlines = buf.iter().filter(|b| **b == b'\n').count();
        if start == 0 || newlines > max_lines {
            return Ok(split_lines_from_tail(&buf, start > 0, max_lines));
        }
        window = window.saturating_mul(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<String>>);

    impl ConsoleObserver for Recorder {
        fn on_line(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    fn bridge(dir: &Path, replay: usize) -> ConsoleBridge {
        ConsoleBridge::new("test", dir.join("logs").join("server.log"), replay, 0, 3)
    }

    async fn wait_for_lines(b: &ConsoleBridge, n: usize) {
        for _ in 0..200 {
            if b.recent_lines(usize::MAX).await.unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("console never reached {n} lines");
    }

    #[tokio::test]
    async fn replay_only_when_detached() {
        let dir = tempfile::tempdir().unwrap();
        let b = bridge(dir.path(), 2);
        b.emit_note("one").await;
        b.emit_note("two").await;
        b.emit_note("three").await;

        let lines: Vec<String> = b.subscribe().await.unwrap().collect().await;
        assert_eq!(lines, vec!["[craft-agent] two", "[craft-agent] three"]);
    }

    #[tokio::test]
    async fn replay_then_live_tail_without_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Arc::new(Recorder::default());
        let b = bridge(dir.path(), 100).with_observer(observer.clone());

        let (mut out_w, out_r) = tokio::io::duplex(256);
        let (err_w, err_r) = tokio::io::duplex(256);
        let drain = b.attach(out_r, err_r).await.drain;

        out_w.write_all(b"a\nb\n").await.unwrap();
        wait_for_lines(&b, 2).await;

        let stream = b.subscribe().await.unwrap();
        out_w.write_all(b"c\r\n").await.unwrap();
        drop(out_w);
        drop(err_w);

        let lines: Vec<String> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .unwrap();
        assert_eq!(lines, vec!["a", "b", "c"]);
        drain.await.unwrap();
        assert!(!b.is_attached().await);

        assert_eq!(*observer.0.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn notes_bypass_observer() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Arc::new(Recorder::default());
        let b = bridge(dir.path(), 10).with_observer(observer.clone());
        b.emit_note("TPS: 5.0").await;
        assert!(observer.0.lock().unwrap().is_empty());
        assert_eq!(b.recent_lines(1).await.unwrap(), vec!["[craft-agent] TPS: 5.0"]);
    }

    #[tokio::test]
    async fn tail_read_spans_multiple_windows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let mut body = String::new();
        for i in 0..5000 {
            body.push_str(&format!("line {i:05} padding padding padding\n"));
        }
        std::fs::write(&path, body).unwrap();

        let lines = read_tail_lines(&path, 1000).await.unwrap();
        assert_eq!(lines.len(), 1000);
        assert_eq!(lines[0], "line 04000 padding padding padding");
        assert_eq!(lines[999], "line 04999 padding padding padding");
        assert!(read_tail_lines(&dir.path().join("missing.log"), 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_rotates_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let b = ConsoleBridge::new("test", &path, 10, 64, 2);
        for i in 0..20 {
            b.emit_note(format!("note number {i}")).await;
        }
        assert!(dir.path().join("server.log.1").exists());
        assert!(dir.path().join("server.log.2").exists());
        assert!(!dir.path().join("server.log.3").exists());
        assert!(std::fs::metadata(&path).unwrap().len() <= 64);
    }

    #[tokio::test]
    async fn stale_drain_leaves_newer_attachment_live() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Arc::new(Recorder::default());
        let b = bridge(dir.path(), 100).with_observer(observer.clone());

        let (mut old_out, old_out_r) = tokio::io::duplex(256);
        let (old_err, old_err_r) = tokio::io::duplex(256);
        let old = b.attach(old_out_r, old_err_r).await;
        let (mut new_out, new_out_r) = tokio::io::duplex(256);
        let (new_err, new_err_r) = tokio::io::duplex(256);
        let new = b.attach(new_out_r, new_err_r).await;
        assert_ne!(old.generation, new.generation);

        let stream = b.subscribe().await.unwrap();
        old_out.write_all(b"late\n").await.unwrap();
        drop(old_out);
        drop(old_err);
        old.drain.await.unwrap();
        assert!(b.is_attached().await);

        new_out.write_all(b"fresh\n").await.unwrap();
        drop(new_out);
        drop(new_err);
        let lines: Vec<String> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .unwrap();
        assert_eq!(lines, vec!["fresh"]);
        new.drain.await.unwrap();

        assert_eq!(*observer.0.lock().unwrap(), vec!["fresh"]);
        assert_eq!(b.recent_lines(10).await.unwrap(), vec!["late", "fresh"]);
    }

    #[tokio::test]
    async fn detach_ends_the_tail_while_pipes_stay_open() {
        let dir = tempfile::tempdir().unwrap();
        let b = bridge(dir.path(), 100);

        let (_out_w, out_r) = tokio::io::duplex(256);
        let (_err_w, err_r) = tokio::io::duplex(256);
        let first = b.attach(out_r, err_r).await;
        let stream = b.subscribe().await.unwrap();

        b.detach(first.generation).await;
        assert!(!b.is_attached().await);
        let lines: Vec<String> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .unwrap();
        assert!(lines.is_empty());

        let (_out_w2, out_r2) = tokio::io::duplex(256);
        let (_err_w2, err_r2) = tokio::io::duplex(256);
        let second = b.attach(out_r2, err_r2).await;
        b.detach(first.generation).await;
        assert!(b.is_attached().await);
        b.detach(second.generation).await;
        assert!(!b.is_attached().await);
    }

    #[tokio::test]
    async fn overlong_lines_are_capped() {
        let mut data = vec![b'x'; MAX_LINE_BYTES + 100];
        data.extend_from_slice(b"\nnext\n");
        let mut reader = BufReader::new(&data[..]);

        let mut buf = Vec::new();
        let n = read_capped_line(&mut reader, &mut buf).await.unwrap();
        assert_eq!(n, MAX_LINE_BYTES + 101);
        assert_eq!(buf.len(), MAX_LINE_BYTES);

        buf.clear();
        read_capped_line(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf, b"next\n");
        buf.clear();
        assert_eq!(read_capped_line(&mut reader, &mut buf).await.unwrap(), 0);
    }
}
