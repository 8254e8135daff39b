use std::fmt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use super::ClientError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7000;
pub const DEFAULT_UNIX_PATH: &str = "/tmp/ndpid-distributor.sock";

/// Byte stream the client reads frames from.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased connected socket.
pub type Transport = Box<dyn AsyncStream>;

/// Distributor endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Address {
    /// Parse `host:port`, `[v6]:port`, `unix:<path>` or a bare path
    /// starting with `/` or `.`.
    pub fn parse(s: &str) -> Result<Self, ClientError> {
        let s = s.trim();

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ClientError::UnsupportedAddressType(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') || s.starts_with('.') {
            return Ok(Self::Unix(PathBuf::from(s)));
        }

        let split = if let Some(rest) = s.strip_prefix('[') {
            rest.split_once("]:")
        } else {
            s.rsplit_once(':').filter(|(host, _)| !host.contains(':'))
        };

        match split {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ClientError::UnsupportedAddressType(s.to_string()))?;
                Ok(Self::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            _ => Err(ClientError::UnsupportedAddressType(s.to_string())),
        }
    }

    /// Pick the endpoint: an explicit host means TCP; otherwise a Unix path
    /// that exists and is a socket; otherwise TCP on the default host.
    pub fn select(host: Option<&str>, port: u16, unix: Option<&Path>) -> Self {
        if let Some(host) = host.filter(|h| !h.is_empty()) {
            return Self::Tcp {
                host: host.to_string(),
                port,
            };
        }

        if let Some(path) = unix {
            if is_socket(path) {
                return Self::Unix(path.to_path_buf());
            }
            tracing::debug!(path = %path.display(), "unix path is not a socket, using tcp");
        }

        Self::Tcp {
            host: DEFAULT_HOST.to_string(),
            port,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Unix(_) => "unix",
        }
    }

    /// Open a stream to the endpoint.
    pub async fn connect(&self) -> Result<Transport, ClientError> {
        match self {
            Self::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Self::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

fn is_socket(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            Address::parse("127.0.0.1:7000").unwrap(),
            Address::Tcp {
                host: "127.0.0.1".into(),
                port: 7000
            }
        );
        assert_eq!(
            Address::parse("[::1]:7001").unwrap(),
            Address::Tcp {
                host: "::1".into(),
                port: 7001
            }
        );
    }

    #[test]
    fn test_parse_unix() {
        assert_eq!(
            Address::parse("unix:/run/ndpid.sock").unwrap(),
            Address::Unix("/run/ndpid.sock".into())
        );
        assert_eq!(
            Address::parse("./distributor.sock").unwrap(),
            Address::Unix("./distributor.sock".into())
        );
    }

    #[test]
    fn test_parse_unsupported() {
        for input in ["localhost", "host:notaport", ":7000", "::1:7000", "unix:", "host:70000"] {
            assert!(
                matches!(
                    Address::parse(input),
                    Err(ClientError::UnsupportedAddressType(_))
                ),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_display_roundtrip() {
        for input in ["10.0.0.1:7000", "[::1]:7000", "unix:/tmp/x.sock"] {
            let addr = Address::parse(input).unwrap();
            assert_eq!(addr.to_string(), input);
        }
    }

    #[test]
    fn test_select_explicit_host_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        assert_eq!(
            Address::select(Some("192.0.2.1"), 7000, Some(&path)),
            Address::Tcp {
                host: "192.0.2.1".into(),
                port: 7000
            }
        );
    }

    #[test]
    fn test_select_uses_real_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        assert_eq!(
            Address::select(None, 7000, Some(&path)),
            Address::Unix(path.clone())
        );
    }

    #[test]
    fn test_select_regular_file_falls_back_to_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-socket");
        std::fs::write(&path, b"").unwrap();

        let selected = Address::select(None, 7123, Some(&path));
        assert_eq!(
            selected,
            Address::Tcp {
                host: DEFAULT_HOST.into(),
                port: 7123
            }
        );
        assert_eq!(selected.kind(), "tcp");

        let missing = dir.path().join("missing.sock");
        assert_eq!(Address::select(None, 7000, Some(&missing)).kind(), "tcp");
    }

    #[tokio::test]
    async fn test_connect_unix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let mut transport = Address::Unix(path).connect().await.unwrap();
        let mut buf = [0u8; 2];
        transport.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        server.await.unwrap();
    }
}
