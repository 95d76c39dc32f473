use log_buffer::LogBuffer;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, warn, Instrument};

const LIVE_CAPACITY: usize = 1024;

/// Destination for a program's stdout and stderr.
///
/// Lines are appended to the log file, kept in a bounded in-memory buffer
/// for tails and broadcast to live followers.
pub struct LogSink {
    path: PathBuf,
    cache: Mutex<Cache>,
    live: broadcast::Sender<String>,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Cache {
    buffer: LogBuffer<Vec<u8>>,
    capacity: usize,
    written: usize,
}

impl Cache {
    /// Once older output was overwritten, the oldest line may be a fragment.
    fn wrapped(&self) -> bool {
        self.written > self.capacity
    }
}

/// Result of a tail request: recent lines plus, when following, the stream
/// of lines written afterwards.
pub struct LogTail {
    pub replay: Vec<String>,
    pub live: Option<broadcast::Receiver<String>>,
}

impl LogSink {
    pub async fn open(path: &Path, buffer_size: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        let task = tokio::spawn(
            async move {
                while let Some(line) = receiver.recv().await {
                    if let Err(err) = file.write_all(line.as_bytes()).await {
                        error!(?err, "Writing log file failed");
                    }
                }
                if let Err(err) = file.flush().await {
                    warn!(?err, "Flushing log file failed");
                }
                debug!("Log writer closed");
            }
            .instrument(info_span!("log_writer", path = %path.display())),
        );

        let (live, _) = broadcast::channel(LIVE_CAPACITY);
        Ok(Self {
            path: path.to_path_buf(),
            cache: Mutex::new(Cache {
                buffer: LogBuffer::new(vec![0; buffer_size]),
                capacity: buffer_size,
                written: 0,
            }),
            live,
            writer: Mutex::new(Some(sender)),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line. A trailing newline is added when missing.
    pub fn append(&self, line: &str) {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        {
            let mut cache = self.cache.lock();
            cache.written = cache.written.saturating_add(line.len());
            if let Err(err) = cache.buffer.write_str(&line) {
                error!(?err, "Cache error");
            }
        }
        if let Some(writer) = self.writer.lock().as_ref() {
            let _ = writer.send(line.clone());
        }
        // No followers is fine.
        let _ = self.live.send(line);
    }

    pub fn tail(&self, lines: usize, follow: bool) -> LogTail {
        // Subscribe before reading the cache so no line falls in between.
        let live = follow.then(|| self.live.subscribe());
        let replay = {
            let mut cache = self.cache.lock();
            let partial = usize::from(cache.wrapped());
            let all: Vec<String> = cache
                .buffer
                .extract_lines()
                .skip(partial)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();
            let skip = all.len().saturating_sub(lines);
            all.into_iter().skip(skip).collect()
        };
        LogTail { replay, live }
    }

    /// Flushes and closes the log file. Later appends only reach the
    /// in-memory buffer and followers.
    pub async fn close(&self) {
        drop(self.writer.lock().take());
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(?err, "Log writer task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(&dir.path().join("a.log"), 4096).await.unwrap();
        for i in 0..10 {
            sink.append(&format!("line {i}"));
        }
        let tail = sink.tail(3, false);
        assert_eq!(tail.replay, vec!["line 7", "line 8", "line 9"]);
        assert!(tail.live.is_none());
    }

    #[tokio::test]
    async fn follow_sees_new_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(&dir.path().join("a.log"), 4096).await.unwrap();
        sink.append("before");
        let mut tail = sink.tail(10, true);
        assert_eq!(tail.replay, vec!["before"]);
        sink.append("after\n");
        let line = tail.live.as_mut().unwrap().recv().await.unwrap();
        assert_eq!(line, "after\n");
    }

    #[tokio::test]
    async fn close_flushes_to_file_and_appends_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/a.log");

        let sink = LogSink::open(&path, 4096).await.unwrap();
        sink.append("first");
        sink.close().await;

        let sink = LogSink::open(&path, 4096).await.unwrap();
        sink.append("second");
        sink.close().await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn small_buffer_keeps_most_recent_output() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(&dir.path().join("a.log"), 16).await.unwrap();
        sink.append("aaaaaaaaaa");
        sink.append("bbbbbbbbbb");
        let tail = sink.tail(10, false);
        assert_eq!(tail.replay.last().map(String::as_str), Some("bbbbbbbbbb"));
    }

    #[tokio::test]
    async fn wrapped_buffer_drops_cut_off_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(&dir.path().join("a.log"), 16).await.unwrap();
        sink.append("aaaaaaaaaa");
        sink.append("bbbbbbbbbb");
        sink.append("cccccc");
        // The ring now holds "bbbbbbbb\ncccccc\n"; the b line is cut.
        assert_eq!(sink.tail(100, false).replay, vec!["cccccc"]);
    }

    #[tokio::test]
    async fn unwrapped_buffer_keeps_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(&dir.path().join("a.log"), 64).await.unwrap();
        sink.append("first");
        sink.append("second");
        assert_eq!(sink.tail(100, false).replay, vec!["first", "second"]);
    }
}
