use super::{IoEvent, IoSender, TransferId, WriteCache};
use crate::network::socket;
use crate::{DccError, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const PART_SUFFIX: &str = ".part";

/// Makes an advertised name safe to use as a single path component.
pub fn sanitize_file_name(advertised: &str) -> String {
    let trimmed = advertised.trim().trim_matches('"').trim();
    let cleaned: String = trimmed
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "unnamed".to_string(),
        _ => cleaned,
    }
}

/// Candidate save path; does not touch the filesystem.
pub fn calculate_destination(folder: &Path, advertised: &str) -> PathBuf {
    folder.join(sanitize_file_name(advertised))
}

pub fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub final_path: PathBuf,
    pub part_path: PathBuf,
    /// Size of a `.part` left by an earlier attempt.
    pub existing_part: u64,
}

/// Makes sure `candidate` can be written without clobbering anything.
///
/// An existing `.part` for the candidate is kept for resuming. Otherwise an
/// existing final file causes the name to be bumped to `name (N).ext`.
pub async fn validate_destination(candidate: &Path, create_folder: bool) -> Result<Destination> {
    let folder = candidate
        .parent()
        .ok_or_else(|| DccError::FileOperation("destination has no folder".to_string()))?;

    match tokio::fs::metadata(folder).await {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(DccError::FileOperation(format!(
                "{} is not a folder",
                folder.display()
            )))
        }
        Err(_) if create_folder => {
            tokio::fs::create_dir_all(folder).await.map_err(|e| {
                DccError::FileOperation(format!("could not create {}: {}", folder.display(), e))
            })?;
            info!("Created download folder {}", folder.display());
        }
        Err(_) => {
            return Err(DccError::FileOperation(format!(
                "folder {} does not exist",
                folder.display()
            )))
        }
    }

    let part = part_path(candidate);
    if let Ok(metadata) = tokio::fs::metadata(&part).await {
        return Ok(Destination {
            final_path: candidate.to_path_buf(),
            part_path: part,
            existing_part: metadata.len(),
        });
    }

    let stem = candidate
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let extension = candidate
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| format!(".{}", s))
        .unwrap_or_default();

    let mut final_path = candidate.to_path_buf();
    let mut counter = 1;
    while exists(&final_path).await || exists(&part_path(&final_path)).await {
        final_path = folder.join(format!("{} ({}){}", stem, counter, extension));
        counter += 1;
    }
    if final_path != candidate {
        info!(
            "{} exists, saving as {}",
            candidate.display(),
            final_path.display()
        );
    }

    Ok(Destination {
        part_path: part_path(&final_path),
        final_path,
        existing_part: 0,
    })
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Checks the `.part` can be opened for writing, creating it if needed.
pub async fn check_part_file(path: &Path) -> Result<u64> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| DccError::FileOperation(format!("could not open {}: {}", path.display(), e)))?;
    Ok(file.metadata().await?.len())
}

pub async fn open_part_file(path: &Path, start: u64) -> Result<File> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await
        .map_err(|e| DccError::FileOperation(format!("could not open {}: {}", path.display(), e)))?;
    file.set_len(start).await?;
    file.seek(SeekFrom::Start(start)).await?;
    Ok(file)
}

pub enum ReceiveEndpoint {
    /// Active: connect to the sender's advertised address.
    Connect(SocketAddr),
    /// Passive: the sender connects to us.
    Listen(TcpListener),
}

#[derive(Debug, Clone)]
pub struct ReceiveJob {
    pub id: TransferId,
    pub part_path: PathBuf,
    pub final_path: PathBuf,
    pub start_position: u64,
    /// 0 when unknown.
    pub file_size: u64,
    pub chunk_size: usize,
    pub cache_ceiling: usize,
    pub connect_timeout: Duration,
    pub io: IoSender,
}

pub fn spawn(job: ReceiveJob, endpoint: ReceiveEndpoint) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = job.id;
        let io = job.io.clone();
        let event = match run(job, endpoint).await {
            Ok(position) => IoEvent::Completed { id, position },
            Err(e) => {
                warn!("Receive {} failed: {}", id, e);
                IoEvent::Failed {
                    id,
                    detail: e.to_string(),
                }
            }
        };
        let _ = io.send(event);
    })
}

async fn run(job: ReceiveJob, endpoint: ReceiveEndpoint) -> Result<u64> {
    let stream = match endpoint {
        ReceiveEndpoint::Connect(address) => socket::connect(address, job.connect_timeout).await?,
        ReceiveEndpoint::Listen(listener) => {
            debug!(
                "Receive {} waiting for sender on {}",
                job.id,
                listener.local_addr()?
            );
            let (stream, _) = socket::accept(&listener).await?;
            stream
        }
    };

    job.io
        .send(IoEvent::Connected {
            id: job.id,
            local: stream.local_addr()?,
            remote: stream.peer_addr()?,
            begin: None,
        })
        .map_err(|_| DccError::EngineStopped)?;

    let file = open_part_file(&job.part_path, job.start_position).await?;
    let position = receive_stream(&job, file, stream).await?;

    tokio::fs::rename(&job.part_path, &job.final_path)
        .await
        .map_err(|e| {
            DccError::FileOperation(format!(
                "could not rename {} to {}: {}",
                job.part_path.display(),
                job.final_path.display(),
                e
            ))
        })?;
    info!("Saved {}", job.final_path.display());

    Ok(position)
}

/// Pulls the file off `stream` through a write cache.
///
/// `position` only moves when the cache acknowledges a disk write, and the
/// socket is left unread while the cache is saturated.
pub async fn receive_stream<S>(job: &ReceiveJob, file: File, stream: S) -> Result<u64>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut cache = WriteCache::new(file, job.cache_ceiling);
    let mut buffer = BytesMut::with_capacity(job.chunk_size);

    let mut position = job.start_position;
    let mut received = job.start_position;
    let mut peer_closed = false;

    loop {
        if job.file_size > 0 && position >= job.file_size {
            break;
        }
        if peer_closed && !cache.has_pending() {
            if job.file_size == 0 && position > job.start_position {
                break;
            }
            return Err(DccError::Transfer(format!(
                "peer closed the connection at {} of {} bytes",
                position, job.file_size
            )));
        }

        let wants_data = !peer_closed
            && !cache.is_saturated()
            && (job.file_size == 0 || received < job.file_size);
        buffer.reserve(job.chunk_size);

        tokio::select! {
            ack = cache.next_ack(), if cache.has_pending() => {
                position += ack? as u64;
                let _ = job.io.send(IoEvent::Progress { id: job.id, position });
                // Legacy 32-bit acknowledgement; wraps past 4 GiB.
                if let Err(e) = writer.write_all(&(position as u32).to_be_bytes()).await {
                    debug!("Could not acknowledge {}: {}", position, e);
                }
            }
            read = reader.read_buf(&mut buffer), if wants_data => {
                let read = read?;
                if read == 0 {
                    debug!("Sender closed the connection at {} bytes", received);
                    peer_closed = true;
                    continue;
                }
                let mut chunk = buffer.split().freeze();
                if job.file_size > 0 && received + chunk.len() as u64 > job.file_size {
                    let keep = (job.file_size - received) as usize;
                    warn!(
                        "Sender overran {} bytes by {}, discarding the excess",
                        job.file_size,
                        chunk.len() - keep
                    );
                    chunk.truncate(keep);
                }
                received += chunk.len() as u64;
                cache.push(chunk)?;
            }
            else => {
                return Err(DccError::Transfer("receive loop stalled".to_string()));
            }
        }
    }

    cache.close().await?;
    let _ = writer.shutdown().await;
    Ok(position)
}
