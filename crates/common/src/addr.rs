//! Address grammar and stream socket abstraction
//!
//! Bind and connect addresses accept three forms:
//!
//! - `tcp://HOST[:PORT]`: IPv4, IPv6 or DNS name; bracketed `[v6]:port`;
//! - `local://PATH`: filesystem unix-domain socket, or abstract-namespace
//!   on Linux when the path starts with `@`;
//! - bare `HOST[:PORT]`: equivalent to `tcp://`.
//!
//! Multiple addresses may be joined with `;`: a client tries them in order,
//! a server binds all of them in parallel. A filesystem socket created by a
//! listener is removed again when the listener is dropped.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::warn;

/// Default TCP port of the proxy server.
pub const DEFAULT_PORT: u16 = 5678;

/// Default address clients connect to and servers listen on.
pub const DEFAULT_ADDRESS: &str = "tcp://localhost:5678";

/// Address parsing errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("invalid address {0:?}")]
    Invalid(String),

    #[error("empty address list")]
    EmptyList,
}

/// One parsed bind/connect address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyAddr {
    Tcp { host: String, port: u16 },
    Local { path: String },
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyAddr::Tcp { host, port } => {
                if host.contains(':') {
                    write!(f, "tcp://[{host}]:{port}")
                } else {
                    write!(f, "tcp://{host}:{port}")
                }
            }
            ProxyAddr::Local { path } => write!(f, "local://{path}"),
        }
    }
}

/// Parse one address. `fallback_port` fills in a missing TCP port.
pub fn parse_addr(input: &str, fallback_port: u16) -> Result<ProxyAddr, AddrError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AddrError::Invalid(input.to_string()));
    }

    if let Some(path) = input.strip_prefix("local://") {
        if path.is_empty() {
            return Err(AddrError::Invalid(input.to_string()));
        }
        return Ok(ProxyAddr::Local {
            path: path.to_string(),
        });
    }

    let rest = input.strip_prefix("tcp://").unwrap_or(input);
    let rest = rest.strip_suffix('/').unwrap_or(rest);
    if rest.is_empty() {
        return Err(AddrError::Invalid(input.to_string()));
    }

    let invalid = || AddrError::Invalid(input.to_string());

    if let Some(bracketed) = rest.strip_prefix('[') {
        // [v6] or [v6]:port
        let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| invalid())?,
            None if tail.is_empty() => fallback_port,
            None => return Err(invalid()),
        };
        return Ok(ProxyAddr::Tcp {
            host: host.to_string(),
            port,
        });
    }

    match rest.rsplit_once(':') {
        // host:port, as long as the host part is not itself an IPv6 literal
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(invalid());
            }
            Ok(ProxyAddr::Tcp {
                host: host.to_string(),
                port: port.parse().map_err(|_| invalid())?,
            })
        }
        // bare IPv6 literal without brackets, or plain host
        _ => Ok(ProxyAddr::Tcp {
            host: rest.to_string(),
            port: fallback_port,
        }),
    }
}

/// Parse a `;`-separated address list, skipping empty entries.
pub fn parse_addr_list(input: &str, fallback_port: u16) -> Result<Vec<ProxyAddr>, AddrError> {
    let mut addrs = Vec::new();
    for part in input.split(';') {
        if part.trim().is_empty() {
            continue;
        }
        addrs.push(parse_addr(part, fallback_port)?);
    }
    if addrs.is_empty() {
        return Err(AddrError::EmptyList);
    }
    Ok(addrs)
}

/// A connected byte stream over either transport.
#[derive(Debug)]
pub enum ProxyStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ProxyStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            ProxyStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ProxyStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            ProxyStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ProxyStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            ProxyStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ProxyStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            ProxyStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Connect to one address.
pub async fn connect(addr: &ProxyAddr) -> std::io::Result<ProxyStream> {
    match addr {
        ProxyAddr::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            Ok(ProxyStream::Tcp(stream))
        }
        ProxyAddr::Local { path } => connect_local(path).await,
    }
}

/// Try every address in order and return the first successful connection.
pub async fn connect_any(addrs: &[ProxyAddr]) -> std::io::Result<ProxyStream> {
    let mut last_error = std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "no address to connect to",
    );
    for addr in addrs {
        match connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!("failed to connect to {addr}: {e}");
                last_error = e;
            }
        }
    }
    Err(last_error)
}

#[cfg(unix)]
async fn connect_local(path: &str) -> std::io::Result<ProxyStream> {
    if let Some(name) = path.strip_prefix('@') {
        return connect_abstract(name);
    }
    let stream = UnixStream::connect(path).await?;
    Ok(ProxyStream::Unix(stream))
}

#[cfg(not(unix))]
async fn connect_local(_path: &str) -> std::io::Result<ProxyStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "local:// addresses are not supported on this platform",
    ))
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> std::io::Result<ProxyStream> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    Ok(ProxyStream::Unix(UnixStream::from_std(stream)?))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn connect_abstract(_name: &str) -> std::io::Result<ProxyStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "abstract-namespace sockets are only supported on linux",
    ))
}

/// A bound listener over either transport.
///
/// Dropping a filesystem unix listener removes its socket file.
#[derive(Debug)]
pub enum ProxyListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: Option<PathBuf>,
    },
}

impl ProxyListener {
    /// Bind one address.
    pub async fn bind(addr: &ProxyAddr) -> std::io::Result<Self> {
        match addr {
            ProxyAddr::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(ProxyListener::Tcp(listener))
            }
            ProxyAddr::Local { path } => bind_local(path),
        }
    }

    /// Accept one connection.
    pub async fn accept(&self) -> std::io::Result<ProxyStream> {
        match self {
            ProxyListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ProxyStream::Tcp(stream))
            }
            #[cfg(unix)]
            ProxyListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(ProxyStream::Unix(stream))
            }
        }
    }
}

#[cfg(unix)]
fn bind_local(path: &str) -> std::io::Result<ProxyListener> {
    if let Some(name) = path.strip_prefix('@') {
        return bind_abstract(name);
    }
    let listener = UnixListener::bind(path)?;
    Ok(ProxyListener::Unix {
        listener,
        path: Some(PathBuf::from(path)),
    })
}

#[cfg(not(unix))]
fn bind_local(_path: &str) -> std::io::Result<ProxyListener> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "local:// addresses are not supported on this platform",
    ))
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> std::io::Result<ProxyListener> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
    listener.set_nonblocking(true)?;
    Ok(ProxyListener::Unix {
        listener: UnixListener::from_std(listener)?,
        path: None,
    })
}

#[cfg(all(unix, not(target_os = "linux")))]
fn bind_abstract(_name: &str) -> std::io::Result<ProxyListener> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "abstract-namespace sockets are only supported on linux",
    ))
}

#[cfg(unix)]
impl Drop for ProxyListener {
    fn drop(&mut self) {
        if let ProxyListener::Unix {
            path: Some(path), ..
        } = self
        {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp(host: &str, port: u16) -> ProxyAddr {
        ProxyAddr::Tcp {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_parse_tcp_with_port() {
        assert_eq!(
            parse_addr("tcp://example.com:1234", DEFAULT_PORT).unwrap(),
            tcp("example.com", 1234)
        );
    }

    #[test]
    fn test_parse_tcp_default_port() {
        assert_eq!(
            parse_addr("tcp://localhost", DEFAULT_PORT).unwrap(),
            tcp("localhost", DEFAULT_PORT)
        );
    }

    #[test]
    fn test_parse_bare_host_port() {
        assert_eq!(
            parse_addr("10.0.0.1:9000", DEFAULT_PORT).unwrap(),
            tcp("10.0.0.1", 9000)
        );
        assert_eq!(
            parse_addr("myhost", DEFAULT_PORT).unwrap(),
            tcp("myhost", DEFAULT_PORT)
        );
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        assert_eq!(
            parse_addr("tcp://[::1]:9000", DEFAULT_PORT).unwrap(),
            tcp("::1", 9000)
        );
        assert_eq!(
            parse_addr("[fe80::1]", DEFAULT_PORT).unwrap(),
            tcp("fe80::1", DEFAULT_PORT)
        );
    }

    #[test]
    fn test_parse_bare_ipv6() {
        assert_eq!(
            parse_addr("::1", DEFAULT_PORT).unwrap(),
            tcp("::1", DEFAULT_PORT)
        );
    }

    #[test]
    fn test_parse_local() {
        assert_eq!(
            parse_addr("local:///run/usb-proxy.sock", DEFAULT_PORT).unwrap(),
            ProxyAddr::Local {
                path: "/run/usb-proxy.sock".to_string()
            }
        );
        assert_eq!(
            parse_addr("local://@usb-proxy", DEFAULT_PORT).unwrap(),
            ProxyAddr::Local {
                path: "@usb-proxy".to_string()
            }
        );
    }

    #[test]
    fn test_parse_trailing_slash() {
        assert_eq!(
            parse_addr("tcp://localhost:5678/", DEFAULT_PORT).unwrap(),
            tcp("localhost", 5678)
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_addr("", DEFAULT_PORT).is_err());
        assert!(parse_addr("local://", DEFAULT_PORT).is_err());
        assert!(parse_addr("tcp://host:notaport", DEFAULT_PORT).is_err());
        assert!(parse_addr("tcp://[::1", DEFAULT_PORT).is_err());
        assert!(parse_addr("tcp://:1234", DEFAULT_PORT).is_err());
    }

    #[test]
    fn test_parse_list() {
        let addrs =
            parse_addr_list("tcp://a:1;local:///tmp/s.sock;b", DEFAULT_PORT).unwrap();
        assert_eq!(
            addrs,
            vec![
                tcp("a", 1),
                ProxyAddr::Local {
                    path: "/tmp/s.sock".to_string()
                },
                tcp("b", DEFAULT_PORT),
            ]
        );
    }

    #[test]
    fn test_parse_list_skips_empty_entries() {
        let addrs = parse_addr_list("tcp://a:1;;", DEFAULT_PORT).unwrap();
        assert_eq!(addrs.len(), 1);
        assert!(parse_addr_list(";;", DEFAULT_PORT).is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for input in ["tcp://example.com:1234", "tcp://[::1]:9000", "local:///tmp/x"] {
            let addr = parse_addr(input, DEFAULT_PORT).unwrap();
            assert_eq!(addr.to_string(), input);
        }
    }

    #[tokio::test]
    async fn test_tcp_bind_and_connect() {
        let listener = ProxyListener::bind(&tcp("127.0.0.1", 0)).await.unwrap();
        let port = match &listener {
            ProxyListener::Tcp(l) => l.local_addr().unwrap().port(),
            #[cfg(unix)]
            _ => unreachable!(),
        };

        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = connect(&tcp("127.0.0.1", port)).await;
        assert!(stream.is_ok());
        assert!(accept.await.unwrap().is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_removed_on_drop() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("usb-proxy-test-{}.sock", std::process::id()));
        let path_str = path.to_str().unwrap().to_string();
        let _ = std::fs::remove_file(&path);

        let addr = ProxyAddr::Local {
            path: path_str.clone(),
        };
        let listener = ProxyListener::bind(&addr).await.unwrap();
        assert!(path.exists());

        drop(listener);
        assert!(!path.exists());
    }
}
