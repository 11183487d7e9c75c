//! Append-only event journal.
//!
//! [`EventJournal`] subscribes to the [`EventBus`](crate::bus::EventBus)
//! broadcast channel and appends every received [`JobEvent`] to a
//! JSON-lines file, one event per line. It runs as a long-lived background
//! task and shuts down when the bus sender is dropped.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;

use crate::bus::JobEvent;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("Journal I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed journal line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Background service that journals lifecycle events to disk.
pub struct EventJournal;

impl EventJournal {
    /// Run the journal loop until the bus closes.
    ///
    /// The file is created if missing and always appended to. Events that
    /// fail to serialize or write are logged and skipped.
    pub async fn run(
        path: PathBuf,
        mut receiver: broadcast::Receiver<JobEvent>,
    ) -> Result<(), JournalError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| JournalError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::info!(path = %path.display(), "Event journal started");

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let mut line = match serde_json::to_vec(&event) {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                event_type = %event.event_type,
                                "Failed to serialize event for journal"
                            );
                            continue;
                        }
                    };
                    line.push(b'\n');
                    if let Err(e) = file.write_all(&line).await {
                        tracing::error!(
                            error = %e,
                            event_type = %event.event_type,
                            "Failed to append event to journal"
                        );
                        continue;
                    }
                    if let Err(e) = file.flush().await {
                        tracing::warn!(error = %e, "Failed to flush event journal");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event journal lagged, some events were not written");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, journal shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Read every event back from a journal file, in append order.
    pub async fn read_all(path: &Path) -> Result<Vec<JobEvent>, JournalError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| JournalError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();
        let mut line_no = 0;

        while let Some(line) = lines.next_line().await.map_err(|source| JournalError::Io {
            path: path.to_path_buf(),
            source,
        })? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let event = serde_json::from_str(&line).map_err(|source| JournalError::Malformed {
                line: line_no,
                source,
            })?;
            events.push(event);
        }

        Ok(events)
    }
}
