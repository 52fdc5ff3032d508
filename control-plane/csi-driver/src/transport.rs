//! Unix domain socket plumbing for the gRPC servers and the mount proxy client.
use futures::{Stream, TryFutureExt};
use snafu::{ResultExt, Snafu};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UnixListener,
};
use tonic::transport::{server::Connected, Channel, Endpoint, Uri};
use tracing::{debug, error, info};

const UNIX_SCHEME: &str = "unix://";

#[derive(Clone, Debug)]
pub struct UdsConnectInfo {
    pub peer_addr: Option<Arc<tokio::net::unix::SocketAddr>>,
    pub peer_cred: Option<tokio::net::unix::UCred>,
}

/// A socket accepted by a gRPC server.
#[derive(Debug)]
pub struct UnixStream(tokio::net::UnixStream);

impl Connected for UnixStream {
    type ConnectInfo = UdsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        UdsConnectInfo {
            peer_addr: self.0.peer_addr().ok().map(Arc::new),
            peer_cred: self.0.peer_cred().ok(),
        }
    }
}

impl AsyncRead for UnixStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// Filesystem path of a `unix://` endpoint. Plain paths are returned as they are.
pub fn uds_path(endpoint: &str) -> &Path {
    Path::new(endpoint.strip_prefix(UNIX_SCHEME).unwrap_or(endpoint))
}

/// Bind a unix socket at `endpoint`, replacing any stale socket left by a previous run,
/// and return the stream of accepted connections.
pub fn bind_incoming(
    endpoint: &str,
) -> Result<impl Stream<Item = std::io::Result<UnixStream>>, String> {
    let socket = uds_path(endpoint).to_path_buf();
    match fs::remove_file(&socket) {
        Ok(_) => info!("Removed stale socket {}", socket.display()),
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                return Err(format!(
                    "Error removing stale socket {}: {err}",
                    socket.display()
                ));
            }
        }
    }
    if let Some(parent) = socket.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|error| format!("Failed to create {}: {error}", parent.display()))?;
        }
    }

    let uds = UnixListener::bind(&socket)
        .map_err(|error| format!("Failed to bind socket {}: {error}", socket.display()))?;
    debug!("gRPC server is listening on {}", socket.display());

    // Sidecars such as the registrar run as other users.
    if let Err(e) = fs::set_permissions(
        &socket,
        std::os::unix::fs::PermissionsExt::from_mode(0o777),
    ) {
        error!("Failed to change permissions for socket: {:?}", e);
    }

    Ok(async_stream::stream! {
        loop {
            let item = uds.accept().map_ok(|(st, _)| UnixStream(st)).await;
            yield item;
        }
    })
}

/// Connect a gRPC channel to the unix socket at `endpoint`, giving up after `timeout`.
pub async fn connect_uds(
    endpoint: &str,
    timeout: Duration,
) -> Result<Channel, ConnectError> {
    let socket: PathBuf = uds_path(endpoint).to_path_buf();
    // The authority is required by the endpoint but never resolved.
    let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(timeout);
    let connect = endpoint.connect_with_connector(tower::service_fn(move |_: Uri| {
        tokio::net::UnixStream::connect(socket.clone())
    }));
    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result.context(Transport),
        Err(_) => Timeout { timeout }.fail(),
    }
}

/// Failure to connect to a unix socket endpoint.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ConnectError {
    #[snafu(display("{}", source))]
    Transport { source: tonic::transport::Error },
    #[snafu(display("timed out after {:?}", timeout))]
    Timeout { timeout: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_paths() {
        assert_eq!(
            uds_path("unix:///tmp/fcfsfused-proxy.sock"),
            Path::new("/tmp/fcfsfused-proxy.sock")
        );
        assert_eq!(uds_path("/csi/csi.sock"), Path::new("/csi/csi.sock"));
    }

    #[tokio::test]
    async fn connect_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = format!("unix://{}", dir.path().join("missing.sock").display());
        let result = connect_uds(&endpoint, Duration::from_millis(200)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn stale_socket_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("csi.sock");
        fs::write(&socket, b"stale").unwrap();
        let endpoint = socket.to_string_lossy().into_owned();
        let _incoming = bind_incoming(&endpoint).unwrap();
        let metadata = fs::metadata(&socket).unwrap();
        use std::os::unix::fs::FileTypeExt;
        assert!(metadata.file_type().is_socket());
    }
}
