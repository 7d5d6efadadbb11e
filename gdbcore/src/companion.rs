/// Companion RPC channel
///
/// Structured request/response exchange with the extension running inside the
/// debugger's scripting host. Frames are a big-endian `u32` length followed by
/// a JSON document. The core listens on a Unix socket, the extension connects
/// once when it is sourced, and every exchange is: send the request, run the
/// debugger command that makes the extension read it, read the reply.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

/// Upper bound on one frame
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Environment variable telling the extension where to connect
pub const SOCKET_ENV: &str = "TRACEHOUND_COMPANION";

/// Extension sourced when the configuration names no other script
pub const EXTENSION_SCRIPT: &str = include_str!("../extension/tracehound.py");

/// Write the bundled extension into `dir`
pub fn install_extension(dir: &Path) -> io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("tracehound.py");
    std::fs::write(&path, EXTENSION_SCRIPT)?;
    Ok(path)
}

#[derive(Error, Debug)]
pub enum CompanionError {
    #[error("Companion I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid companion payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Companion frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),
    #[error("Companion did not answer in time")]
    Timeout,
    #[error("Companion reported failure: {0}")]
    Remote(String),
}

pub type Result<T> = std::result::Result<T, CompanionError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionRequest {
    pub command: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanionReply {
    pub ok: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl CompanionReply {
    pub fn success(payload: serde_json::Value) -> Self {
        CompanionReply {
            ok: true,
            payload,
            error: None,
        }
    }

    pub fn into_payload(self) -> Result<serde_json::Value> {
        if self.ok {
            Ok(self.payload)
        } else {
            Err(CompanionError::Remote(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len()).map_err(|_| CompanionError::FrameTooLarge(u32::MAX))?;
    if len > MAX_FRAME_LEN {
        return Err(CompanionError::FrameTooLarge(len));
    }
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(CompanionError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Listening side, alive until the extension connects
pub struct CompanionListener {
    listener: UnixListener,
    path: PathBuf,
}

impl CompanionListener {
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        log::debug!("companion listening on {}", path.display());
        Ok(CompanionListener {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self, timeout: Duration) -> Result<CompanionChannel> {
        let (stream, _) = tokio::time::timeout(timeout, self.listener.accept())
            .await
            .map_err(|_| CompanionError::Timeout)??;
        log::info!("companion connected");
        Ok(CompanionChannel::new(stream, timeout))
    }
}

impl Drop for CompanionListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connected channel to the extension
pub struct CompanionChannel {
    stream: UnixStream,
    timeout: Duration,
}

impl CompanionChannel {
    pub fn new(stream: UnixStream, timeout: Duration) -> Self {
        CompanionChannel { stream, timeout }
    }

    pub async fn send(&mut self, request: &CompanionRequest) -> Result<()> {
        log::debug!("COMPANION SEND: {}", request.command);
        write_frame(&mut self.stream, request).await
    }

    pub async fn receive(&mut self) -> Result<CompanionReply> {
        let reply: CompanionReply = tokio::time::timeout(self.timeout, read_frame(&mut self.stream))
            .await
            .map_err(|_| CompanionError::Timeout)??;
        log::debug!("COMPANION RECV: ok={}", reply.ok);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_layout() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = CompanionRequest {
            command: "examine_expressions".into(),
            args: json!(["$pc"]),
        };
        write_frame(&mut client, &request).await.unwrap();

        let len = server.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        server.read_exact(&mut body).await.unwrap();
        let decoded: CompanionRequest = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(MAX_FRAME_LEN + 1).to_be_bytes()).await.unwrap();
        let result: Result<CompanionReply> = read_frame(&mut server).await;
        assert!(matches!(result, Err(CompanionError::FrameTooLarge(_))));
    }

    #[test]
    fn test_bundled_extension_is_installed() {
        let dir = std::env::temp_dir().join(format!("gdbcore-extension-{}", std::process::id()));
        let path = install_extension(&dir).unwrap();
        assert_eq!(path, dir.join("tracehound.py"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), EXTENSION_SCRIPT);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_bundled_extension_defines_every_command() {
        for command in [
            "tracehound-examine-expressions",
            "tracehound-parse-and-eval",
            "tracehound-read-registers",
            "tracehound-read-float-registers",
            "tracehound-handle-signals",
        ] {
            assert!(
                EXTENSION_SCRIPT.contains(&format!("CompanionCommand(\"{command}\"")),
                "{command} is not defined"
            );
        }
        assert!(EXTENSION_SCRIPT.contains(SOCKET_ENV));
    }

    #[test]
    fn test_reply_error() {
        let reply: CompanionReply =
            serde_json::from_str(r#"{"ok": false, "error": "No symbol \"foo\""}"#).unwrap();
        assert!(matches!(
            reply.into_payload(),
            Err(CompanionError::Remote(msg)) if msg.contains("foo")
        ));
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let dir = std::env::temp_dir().join(format!("gdbcore-companion-{}", std::process::id()));
        let listener = CompanionListener::bind(&dir.join("companion.sock")).unwrap();
        let path = listener.path().to_path_buf();

        let peer = tokio::spawn(async move {
            let mut stream = UnixStream::connect(&path).await.unwrap();
            let request: CompanionRequest = read_frame(&mut stream).await.unwrap();
            let reply = CompanionReply::success(json!({ "echo": request.command }));
            write_frame(&mut stream, &reply).await.unwrap();
        });

        let mut channel = listener.accept(Duration::from_secs(5)).await.unwrap();
        channel
            .send(&CompanionRequest {
                command: "ping".into(),
                args: json!(null),
            })
            .await
            .unwrap();
        let payload = channel.receive().await.unwrap().into_payload().unwrap();
        assert_eq!(payload, json!({ "echo": "ping" }));
        peer.await.unwrap();
        drop(listener);
        let _ = std::fs::remove_dir_all(dir);
    }
}
