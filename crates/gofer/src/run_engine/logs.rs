//! Task execution log capture and retrieval.
//!
//! Container output is streamed to one file per task execution. A sentinel
//! line marks the end of the stream so tailers can tell "finished" apart from
//! "no new output yet" without watching container state themselves.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::scheduler::LogStream;

/// Final line of every completed log file. Nothing is written after it.
pub const GOFER_EOF: &str = "<GOFER_EOF>";

/// Where a task execution's log file lives.
pub fn log_path(
    dir: &str,
    namespace_id: &str,
    pipeline_id: &str,
    run_id: u64,
    task_id: &str,
) -> PathBuf {
    PathBuf::from(dir)
        .join(namespace_id)
        .join(pipeline_id)
        .join(run_id.to_string())
        .join(format!("{task_id}.log"))
}

/// Drain a container log stream into `path`, ending with the sentinel. Runs
/// until the container closes its output; errors are logged and terminate
/// capture (the sentinel is still written so tailers finish).
pub async fn capture(mut stream: LogStream, path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            warn!(path = %path.display(), error = %e, "could not create log directory");
            return;
        }
    }

    let mut file = match fs::File::create(path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not create log file");
            return;
        }
    };

    while let Some(entry) = stream.next().await {
        match entry {
            Ok(bytes) => {
                if let Err(e) = file.write_all(&bytes).await {
                    warn!(path = %path.display(), error = %e, "could not write log line");
                    break;
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "log stream errored");
                break;
            }
        }
    }

    if let Err(e) = file.write_all(format!("\n{GOFER_EOF}\n").as_bytes()).await {
        warn!(path = %path.display(), error = %e, "could not write log sentinel");
    }

    debug!(path = %path.display(), "log capture finished");
}

/// Tail a log file line by line. The channel yields existing content, then
/// follows the file until the sentinel appears. The sentinel itself is not
/// delivered.
pub fn tail(path: PathBuf) -> mpsc::Receiver<Result<String, std::io::Error>> {
    let (tx, rx) = mpsc::channel(100);

    tokio::spawn(async move {
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        let mut reader = BufReader::new(file);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    // At end of file but no sentinel yet: the writer is still
                    // going. Poll for more.
                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                }
                Ok(_) => {
                    let trimmed = line.trim_end_matches('\n');
                    if trimmed == GOFER_EOF {
                        return;
                    }
                    if tx.send(Ok(trimmed.to_string())).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    });

    rx
}

/// Delete a task execution's log file if present.
pub async fn remove(path: &Path) -> Result<(), std::io::Error> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn path_layout_matches_hierarchy() {
        let path = log_path("/var/lib/gofer/logs", "default", "build", 4, "compile");
        assert_eq!(
            path,
            PathBuf::from("/var/lib/gofer/logs/default/build/4/compile.log")
        );
    }

    #[tokio::test]
    async fn capture_writes_content_and_single_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.log");

        let stream: LogStream = Box::pin(stream::iter(vec![
            Ok(bytes::Bytes::from("line one\n")),
            Ok(bytes::Bytes::from("line two\n")),
        ]));

        capture(stream, &path).await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("line one"));
        assert!(content.contains("line two"));
        assert_eq!(content.matches(GOFER_EOF).count(), 1);
        assert!(content.trim_end().ends_with(GOFER_EOF));
    }

    #[tokio::test]
    async fn tail_stops_at_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.log");
        std::fs::write(&path, format!("alpha\nbeta\n\n{GOFER_EOF}\n")).unwrap();

        let mut rx = tail(path);
        let mut lines = Vec::new();
        while let Some(entry) = rx.recv().await {
            lines.push(entry.unwrap());
        }

        assert_eq!(lines, vec!["alpha", "beta", ""]);
    }

    #[tokio::test]
    async fn tail_follows_a_live_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.log");
        std::fs::write(&path, "early\n").unwrap();

        let mut rx = tail(path.clone());
        assert_eq!(rx.recv().await.unwrap().unwrap(), "early");

        // Writer appends later; the tailer picks it up and then stops at the
        // sentinel.
        let writer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            use std::io::Write;
            writeln!(file, "late").unwrap();
            writeln!(file, "{GOFER_EOF}").unwrap();
        });

        assert_eq!(rx.recv().await.unwrap().unwrap(), "late");
        assert!(rx.recv().await.is_none());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.log");
        std::fs::write(&path, "data").unwrap();

        remove(&path).await.unwrap();
        remove(&path).await.unwrap();
        assert!(!path.exists());
    }
}
