//! Local byte-stream transport: a Unix socket, or a named pipe on Windows.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

pub const ENDPOINT_ENV: &str = "MACROGUARD_ENDPOINT";

#[cfg(windows)]
pub const DEFAULT_PIPE_NAME: &str = r"\\.\pipe\macroguardPriv";

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default endpoint for this platform.
pub fn default_endpoint() -> String {
    #[cfg(windows)]
    {
        DEFAULT_PIPE_NAME.to_string()
    }
    #[cfg(not(windows))]
    {
        std::env::temp_dir()
            .join("macroguard-priv.sock")
            .to_string_lossy()
            .into_owned()
    }
}

#[cfg(unix)]
pub struct Listener {
    inner: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl Listener {
    pub fn bind(endpoint: &str) -> io::Result<Self> {
        use std::os::unix::fs::PermissionsExt;

        let path = std::path::PathBuf::from(endpoint);
        // Lock files are per working directory, so a socket left at the
        // endpoint may still belong to a live helper.
        if path.exists() {
            if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{endpoint} is served by another process"),
                ));
            }
            std::fs::remove_file(&path)?;
        }
        let listener = Self {
            inner: tokio::net::UnixListener::bind(&path)?,
            path,
        };
        std::fs::set_permissions(&listener.path, std::fs::Permissions::from_mode(0o600))?;
        Ok(listener)
    }

    pub async fn accept(&mut self) -> io::Result<(BoxedReader, BoxedWriter)> {
        let (stream, _) = self.inner.accept().await?;
        let (r, w) = stream.into_split();
        Ok((Box::new(r), Box::new(w)))
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
pub async fn connect(endpoint: &str) -> io::Result<(BoxedReader, BoxedWriter)> {
    let stream = tokio::net::UnixStream::connect(endpoint).await?;
    let (r, w) = stream.into_split();
    Ok((Box::new(r), Box::new(w)))
}

#[cfg(windows)]
pub struct Listener {
    name: String,
    next: tokio::net::windows::named_pipe::NamedPipeServer,
}

#[cfg(windows)]
impl Listener {
    pub fn bind(endpoint: &str) -> io::Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;
        let next = ServerOptions::new()
            .first_pipe_instance(true)
            .create(endpoint)?;
        Ok(Self {
            name: endpoint.to_string(),
            next,
        })
    }

    pub async fn accept(&mut self) -> io::Result<(BoxedReader, BoxedWriter)> {
        use tokio::net::windows::named_pipe::ServerOptions;
        self.next.connect().await?;
        let fresh = ServerOptions::new().create(&self.name)?;
        let conn = std::mem::replace(&mut self.next, fresh);
        let (r, w) = tokio::io::split(conn);
        Ok((Box::new(r), Box::new(w)))
    }
}

#[cfg(windows)]
pub async fn connect(endpoint: &str) -> io::Result<(BoxedReader, BoxedWriter)> {
    use tokio::net::windows::named_pipe::ClientOptions;
    const ERROR_PIPE_BUSY: i32 = 231;
    loop {
        match ClientOptions::new().open(endpoint) {
            Ok(client) => {
                let (r, w) = tokio::io::split(client);
                return Ok((Box::new(r), Box::new(w)));
            }
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
