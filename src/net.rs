// ABOUTME: Listening endpoint plumbing shared by the supplier and consumer sides
// ABOUTME: Parses scheme://address specs and folds TCP and unix sockets behind one stream type

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// Error raised while parsing an address spec such as `tcp://0.0.0.0:4096`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    /// The spec has no `scheme://` prefix.
    #[error("malformed address: {0}")]
    Malformed(String),

    /// The scheme is not one this relay can listen on.
    #[error("unsupported scheme '{scheme}' in address: {addr}")]
    UnsupportedScheme { scheme: String, addr: String },

    /// The part after the scheme is empty.
    #[error("empty address in: {0}")]
    Empty(String),
}

/// A parsed listening endpoint: `tcp://host:port` (v4 or v6 by address form)
/// or `unix:///path/to/socket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = AddrError;

    fn from_str(spec: &str) -> Result<Self, AddrError> {
        let (scheme, rest) = spec
            .split_once("://")
            .ok_or_else(|| AddrError::Malformed(spec.to_owned()))?;
        if rest.is_empty() {
            return Err(AddrError::Empty(spec.to_owned()));
        }
        match scheme {
            "tcp" => Ok(Self::Tcp(rest.to_owned())),
            "unix" => Ok(Self::Unix(PathBuf::from(rest))),
            _ => Err(AddrError::UnsupportedScheme {
                scheme: scheme.to_owned(),
                addr: spec.to_owned(),
            }),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A bound listening socket for either address family.
pub enum RelayListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl RelayListener {
    /// Bind the endpoint described by `addr`.
    ///
    /// A stale unix socket file left behind by a previous run is removed
    /// before binding.
    pub async fn bind(addr: &ListenAddr) -> io::Result<Self> {
        match addr {
            ListenAddr::Tcp(spec) => Ok(Self::Tcp(TcpListener::bind(spec.as_str()).await?)),
            ListenAddr::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Ok(Self::Unix(UnixListener::bind(path)?))
            }
        }
    }

    /// Accept one inbound connection, along with a printable peer label.
    pub async fn accept(&self) -> io::Result<(RelayStream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((RelayStream::Tcp(stream), peer.to_string()))
            }
            Self::Unix(listener) => {
                let (stream, peer) = listener.accept().await?;
                let label = peer
                    .as_pathname()
                    .map_or_else(|| "unix:@".to_owned(), |p| p.display().to_string());
                Ok((RelayStream::Unix(stream), label))
            }
        }
    }

    /// The address this listener actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        match self {
            Self::Tcp(listener) => Ok(ListenAddr::Tcp(listener.local_addr()?.to_string())),
            Self::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr.as_pathname().map_or_else(PathBuf::new, PathBuf::from);
                Ok(ListenAddr::Unix(path))
            }
        }
    }
}

/// One accepted byte-stream connection, TCP or unix.
///
/// The relay treats every connection as an opaque byte stream, so a single
/// enum implementing the async I/O traits keeps the supplier and consumer
/// code independent of the address family.
pub enum RelayStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_specs() {
        assert_eq!(
            "tcp://0.0.0.0:4096".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("0.0.0.0:4096".to_owned())
        );
        assert_eq!(
            "tcp://[::1]:4096".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("[::1]:4096".to_owned())
        );
    }

    #[test]
    fn parses_unix_specs() {
        assert_eq!(
            "unix:///tmp/bytehub.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/bytehub.sock"))
        );
    }

    #[test]
    fn rejects_missing_scheme() {
        assert_eq!(
            "0.0.0.0:4096".parse::<ListenAddr>().unwrap_err(),
            AddrError::Malformed("0.0.0.0:4096".to_owned())
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(
            "udp://0.0.0.0:4096".parse::<ListenAddr>(),
            Err(AddrError::UnsupportedScheme { scheme, .. }) if scheme == "udp"
        ));
        // The address form picks the family; there are no per-family schemes.
        assert!(matches!(
            "tcp4://0.0.0.0:4096".parse::<ListenAddr>(),
            Err(AddrError::UnsupportedScheme { scheme, .. }) if scheme == "tcp4"
        ));
        assert!(matches!(
            "tcp6://[::1]:4096".parse::<ListenAddr>(),
            Err(AddrError::UnsupportedScheme { scheme, .. }) if scheme == "tcp6"
        ));
    }

    #[test]
    fn rejects_empty_address() {
        assert_eq!(
            "tcp://".parse::<ListenAddr>().unwrap_err(),
            AddrError::Empty("tcp://".to_owned())
        );
    }

    #[test]
    fn display_round_trips() {
        for spec in ["tcp://127.0.0.1:9000", "unix:///run/bytehub.sock"] {
            let addr: ListenAddr = spec.parse().unwrap();
            assert_eq!(addr.to_string(), spec);
        }
    }
}
