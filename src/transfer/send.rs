use super::{IoEvent, IoSender, TransferId};
use crate::network::socket;
use crate::{DccError, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for the receiver to close after the last byte.
const CLOSE_LINGER: Duration = Duration::from_secs(10);

pub enum SendEndpoint {
    /// Active: we offered a port and wait for the peer.
    Listen(TcpListener),
    /// Passive: the peer listens and told us where.
    Connect(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct SendJob {
    pub id: TransferId,
    pub path: PathBuf,
    pub file_size: u64,
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    pub io: IoSender,
}

pub fn spawn(job: SendJob, endpoint: SendEndpoint) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = job.id;
        let io = job.io.clone();
        let event = match run(job, endpoint).await {
            Ok(position) => IoEvent::Completed { id, position },
            Err(e) => {
                warn!("Send {} failed: {}", id, e);
                IoEvent::Failed {
                    id,
                    detail: e.to_string(),
                }
            }
        };
        let _ = io.send(event);
    })
}

async fn run(job: SendJob, endpoint: SendEndpoint) -> Result<u64> {
    let stream = match endpoint {
        SendEndpoint::Listen(listener) => {
            debug!(
                "Send {} waiting for peer on {}",
                job.id,
                listener.local_addr()?
            );
            let (stream, _) = socket::accept(&listener).await?;
            stream
        }
        SendEndpoint::Connect(address) => socket::connect(address, job.connect_timeout).await?,
    };

    let (begin_tx, begin_rx) = oneshot::channel();
    job.io
        .send(IoEvent::Connected {
            id: job.id,
            local: stream.local_addr()?,
            remote: stream.peer_addr()?,
            begin: Some(begin_tx),
        })
        .map_err(|_| DccError::EngineStopped)?;

    let start = begin_rx
        .await
        .map_err(|_| DccError::Transfer("transfer was withdrawn".to_string()))?;

    stream_file(&job, stream, start).await
}

/// Writes the file from `start` to the end into `stream`, draining the
/// receiver's position acknowledgements alongside.
pub async fn stream_file<S>(job: &SendJob, stream: S, start: u64) -> Result<u64>
where
    S: AsyncRead + AsyncWrite,
{
    let mut file = File::open(&job.path).await.map_err(|e| {
        DccError::FileOperation(format!("could not open {}: {}", job.path.display(), e))
    })?;
    file.seek(SeekFrom::Start(start)).await?;

    info!(
        "Sending {} from offset {} ({} bytes total)",
        job.path.display(),
        start,
        job.file_size
    );

    let (reader, mut writer) = tokio::io::split(stream);
    let mut buffer = vec![0u8; job.chunk_size];

    let sending = async {
        let mut position = start;
        while position < job.file_size {
            let want = (job.file_size - position).min(job.chunk_size as u64) as usize;
            let read = file.read(&mut buffer[..want]).await?;
            if read == 0 {
                return Err(DccError::FileOperation(format!(
                    "{} ended at {} of {} bytes",
                    job.path.display(),
                    position,
                    job.file_size
                )));
            }
            writer.write_all(&buffer[..read]).await?;
            position += read as u64;
            let _ = job.io.send(IoEvent::Progress {
                id: job.id,
                position,
            });
        }
        writer.flush().await?;
        writer.shutdown().await?;
        Ok::<u64, DccError>(position)
    };
    tokio::pin!(sending);

    let draining = drain_acks(reader);
    tokio::pin!(draining);

    let mut peer_closed = false;
    let position = tokio::select! {
        result = &mut sending => result?,
        last = &mut draining => {
            peer_closed = true;
            debug!("Receiver closed early, last ack {:?}", last);
            (&mut sending).await?
        }
    };

    if !peer_closed {
        match tokio::time::timeout(CLOSE_LINGER, &mut draining).await {
            Ok(last) => debug!("Receiver closed, last ack {:?}", last),
            Err(_) => debug!("Receiver kept the connection open"),
        }
    }

    Ok(position)
}

/// Reads 32-bit big-endian positions until the peer closes.
async fn drain_acks<R: AsyncRead + Unpin>(mut reader: R) -> Option<u32> {
    let mut ack = [0u8; 4];
    let mut last = None;
    while reader.read_exact(&mut ack).await.is_ok() {
        last = Some(u32::from_be_bytes(ack));
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn job(path: PathBuf, size: u64) -> (SendJob, mpsc::UnboundedReceiver<IoEvent>) {
        let (io, rx) = mpsc::unbounded_channel();
        (
            SendJob {
                id: TransferId(9),
                path,
                file_size: size,
                chunk_size: 16,
                connect_timeout: Duration::from_secs(5),
                io,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_streams_from_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("source.bin");
        let content: Vec<u8> = (0..100u8).collect();
        tokio::fs::write(&path, &content).await.unwrap();

        let (job, mut rx) = job(path, 100);
        let (ours, mut theirs) = tokio::io::duplex(64);

        let peer = tokio::spawn(async move {
            let mut received = Vec::new();
            theirs.read_to_end(&mut received).await.unwrap();
            theirs.write_all(&100u32.to_be_bytes()).await.unwrap();
            theirs.shutdown().await.unwrap();
            received
        });

        let position = stream_file(&job, ours, 40).await.unwrap();
        assert_eq!(position, 100);
        assert_eq!(peer.await.unwrap(), content[40..].to_vec());

        let mut last = 40;
        while let Ok(event) = rx.try_recv() {
            if let IoEvent::Progress { position, .. } = event {
                assert!(position > last);
                last = position;
            }
        }
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn test_short_source_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.bin");
        tokio::fs::write(&path, b"only ten b").await.unwrap();

        let (job, _rx) = job(path, 50);
        let (ours, mut theirs) = tokio::io::duplex(256);
        let peer = tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = theirs.read_to_end(&mut sink).await;
        });

        let err = stream_file(&job, ours, 0).await.unwrap_err();
        assert!(matches!(err, DccError::FileOperation(_)));
        peer.abort();
    }

    #[tokio::test]
    async fn test_missing_source_fails() {
        let dir = tempdir().unwrap();
        let (job, _rx) = job(dir.path().join("gone.bin"), 10);
        let (ours, _theirs) = tokio::io::duplex(16);
        assert!(stream_file(&job, ours, 0).await.is_err());
    }
}
