/// Protocol transport for the debugger process
///
/// The debugger runs on the slave side of a pseudo-terminal. This module owns
/// the master side: a line reader for the observer and a raw writer for the
/// command engine. Control keys are written as their terminal control byte so
/// the line discipline turns them into signals for the debugger.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to start debugger process: {0}")]
    StartError(#[from] io::Error),
    #[error("Failed to allocate pseudo-terminal: {0}")]
    PtyError(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both halves of a debugger connection
pub struct Transport {
    pub reader: TransportReader,
    pub writer: TransportWriter,
}

impl Transport {
    /// Build a transport from arbitrary byte streams
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Transport {
            reader: TransportReader {
                inner: BufReader::new(Box::new(reader)),
                buf: Vec::new(),
            },
            writer: TransportWriter {
                inner: Box::new(writer),
            },
        }
    }
}

/// Line-delimited reading side
pub struct TransportReader {
    inner: BufReader<BoxedReader>,
    buf: Vec<u8>,
}

impl TransportReader {
    /// Next non-empty logical line without its terminator, `None` once the stream is gone.
    ///
    /// A pty master reports `EIO` after the slave side closes; that is treated
    /// as end of stream.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            self.buf.clear();
            match self.inner.read_until(b'\n', &mut self.buf).await {
                Ok(0) => return None,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&self.buf);
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if trimmed.trim().is_empty() {
                        continue;
                    }
                    return Some(trimmed.to_string());
                }
                Err(e) => {
                    log::debug!("transport read ended: {}", e);
                    return None;
                }
            }
        }
    }
}

/// Raw writing side
pub struct TransportWriter {
    inner: BoxedWriter,
}

impl TransportWriter {
    /// Write one command line
    pub async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await
    }

    /// Send `key` as a control keystroke, e.g. `'c'` for Ctrl+C
    pub async fn send_control(&mut self, key: char) -> io::Result<()> {
        let byte = control_byte(key).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("no control code for {key:?}"))
        })?;
        self.inner.write_all(&[byte]).await?;
        self.inner.flush().await
    }
}

pub(crate) fn control_byte(key: char) -> Option<u8> {
    match key.to_ascii_lowercase() {
        c @ 'a'..='z' => Some(c as u8 & 0x1f),
        '\\' => Some(0x1c),
        _ => None,
    }
}

/// The spawned debugger process
pub struct GdbProcess {
    child: Child,
}

impl GdbProcess {
    /// Spawn the debugger on a fresh pseudo-terminal
    pub fn spawn(
        gdb_path: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<(Self, Transport)> {
        log::debug!("Starting debugger process: {} {:?}", gdb_path.display(), args);

        let pty = nix::pty::openpty(None, None)?;
        disable_echo(&pty.slave)?;

        let stdin = pty.slave.try_clone()?;
        let stdout = pty.slave.try_clone()?;
        let stderr = pty.slave;

        let mut command = Command::new(gdb_path);
        command
            .args(args)
            .env("LC_NUMERIC", "C")
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        // New session with the pty as controlling terminal, so control
        // bytes reach the debugger as signals.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(io::Error::from)?;
                if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = command.spawn()?;
        log::debug!("Debugger started with PID: {:?}", child.id());

        let transport = master_transport(pty.master)?;
        Ok((GdbProcess { child }, transport))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill without waiting; safe to call from synchronous teardown paths
    pub fn start_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            log::debug!("debugger already gone: {}", e);
        }
    }
}

fn disable_echo(fd: &OwnedFd) -> Result<()> {
    use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};

    let mut termios = tcgetattr(fd.as_fd())?;
    termios.local_flags.remove(LocalFlags::ECHO);
    tcsetattr(fd.as_fd(), SetArg::TCSANOW, &termios)?;
    Ok(())
}

fn master_transport(master: OwnedFd) -> Result<Transport> {
    let read_half = std::fs::File::from(master);
    let write_half = read_half.try_clone()?;
    Ok(Transport::from_streams(
        tokio::fs::File::from_std(read_half),
        tokio::fs::File::from_std(write_half),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_control_byte() {
        assert_eq!(control_byte('c'), Some(0x03));
        assert_eq!(control_byte('C'), Some(0x03));
        assert_eq!(control_byte('z'), Some(0x1a));
        assert_eq!(control_byte('1'), None);
    }

    #[tokio::test]
    async fn test_reader_strips_crlf_and_blank_lines() {
        let (client, mut server) = tokio::io::duplex(256);
        let (read, write) = tokio::io::split(client);
        let mut transport = Transport::from_streams(read, write);

        server.write_all(b"^done\r\n\r\n(gdb) \r\n").await.unwrap();
        drop(server);

        assert_eq!(transport.reader.next_line().await.as_deref(), Some("^done"));
        assert_eq!(transport.reader.next_line().await.as_deref(), Some("(gdb) "));
        assert_eq!(transport.reader.next_line().await, None);
    }

    #[tokio::test]
    async fn test_writer_sends_lines_and_control() {
        let (client, mut server) = tokio::io::duplex(256);
        let (read, write) = tokio::io::split(client);
        let mut transport = Transport::from_streams(read, write);

        transport.writer.send_line("1-break-list").await.unwrap();
        transport.writer.send_control('c').await.unwrap();

        let mut buf = [0u8; 14];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"1-break-list\n\x03");
    }
}
