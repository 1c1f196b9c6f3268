use crate::config::PortRange;
use crate::{DccError, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Hands out listening sockets, optionally restricted to a port range.
///
/// Owned by the transfer manager; the round-robin cursor lives here rather
/// than in process-wide state.
#[derive(Debug)]
pub struct PortAllocator {
    bind_address: Ipv4Addr,
    range: Option<PortRange>,
    next: u16,
}

impl PortAllocator {
    pub fn new(bind_address: Ipv4Addr, range: Option<PortRange>) -> Self {
        let next = range.map(|r| r.first).unwrap_or(0);
        Self {
            bind_address,
            range,
            next,
        }
    }

    /// Binds a listening socket. Must be called from within a tokio runtime.
    pub fn listen(&mut self) -> Result<TcpListener> {
        let listener = self.bind_std()?;
        listener.set_nonblocking(true)?;
        Ok(TcpListener::from_std(listener)?)
    }

    fn bind_std(&mut self) -> Result<std::net::TcpListener> {
        let Some(range) = self.range else {
            let listener =
                std::net::TcpListener::bind(SocketAddrV4::new(self.bind_address, 0))?;
            debug!("Bound ephemeral port {}", listener.local_addr()?.port());
            return Ok(listener);
        };

        let span = (range.last - range.first) as u32 + 1;
        let start = if (range.first..=range.last).contains(&self.next) {
            self.next
        } else {
            range.first
        };

        for offset in 0..span {
            let port = range.first + (((start - range.first) as u32 + offset) % span) as u16;
            match std::net::TcpListener::bind(SocketAddrV4::new(self.bind_address, port)) {
                Ok(listener) => {
                    self.next = if port == range.last {
                        range.first
                    } else {
                        port + 1
                    };
                    info!("Bound port {} from range {}-{}", port, range.first, range.last);
                    return Ok(listener);
                }
                Err(e) => debug!("Port {} unavailable: {}", port, e),
            }
        }

        Err(DccError::PortRangeExhausted {
            first: range.first,
            last: range.last,
        })
    }
}

pub async fn connect(address: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    debug!("Connecting to {}", address);
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| DccError::Timeout(format!("connecting to {}", address)))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub async fn accept(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    let (stream, remote) = listener.accept().await?;
    stream.set_nodelay(true)?;
    debug!("Accepted connection from {}", remote);
    Ok((stream, remote))
}
