//! Supervisor ↔ worker message channel.
//!
//! The channel is one end of a Unix socket pair inherited by the worker
//! process. Messages are newline-delimited JSON [`WorkerMessage`]s; a message
//! that hands over a connection (`direct`) carries the socket descriptor as an
//! `SCM_RIGHTS` ancillary message attached to the first byte of its frame.
//! Descriptors are queued in arrival order and paired with the next message
//! that expects one, which keeps them aligned with their frames.

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags,
};
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::error::{CloudError, Result};
use crate::protocol::WorkerMessage;
use crate::transport::framing::{encode_frame, FrameDecoder};

/// Environment variable holding the inherited IPC descriptor number.
pub const IPC_FD_ENV: &str = "THINGCLOUD_IPC_FD";

const READ_CHUNK: usize = 8 * 1024;
const ANCILLARY_SPACE: usize = 128;

/// A message received over IPC together with its passed descriptor, if any.
#[derive(Debug)]
pub struct IpcMessage {
    pub message: WorkerMessage,
    pub fd: Option<OwnedFd>,
}

/// Bidirectional IPC channel over a Unix stream socket.
pub struct IpcChannel {
    stream: Arc<UnixStream>,
}

impl IpcChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream: Arc::new(stream),
        }
    }

    pub fn from_std(stream: std::os::unix::net::UnixStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?))
    }

    /// Takes ownership of an inherited descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be an open Unix stream socket not owned by anything else in
    /// this process.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        let owned = OwnedFd::from_raw_fd(fd);
        Self::from_std(std::os::unix::net::UnixStream::from(owned))
    }

    /// Opens the channel named by [`IPC_FD_ENV`].
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(IPC_FD_ENV)
            .map_err(|_| CloudError::Config(format!("{} is not set", IPC_FD_ENV)))?;
        let fd: RawFd = raw
            .parse()
            .map_err(|_| CloudError::Config(format!("{} is not a descriptor: {}", IPC_FD_ENV, raw)))?;
        // SAFETY: the parent passes the descriptor number of a socket it left
        // open for us, and the variable is read once at worker startup.
        unsafe { Self::from_raw_fd(fd) }
    }

    /// Creates a connected pair, used for in-process workers.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    pub fn split(self) -> (IpcSender, IpcReceiver) {
        let sender = IpcSender {
            stream: self.stream.clone(),
            write_lock: Arc::new(Mutex::new(())),
        };
        let receiver = IpcReceiver {
            stream: self.stream,
            decoder: FrameDecoder::new(),
            fds: VecDeque::new(),
            eof: false,
        };
        (sender, receiver)
    }
}

/// Sending half; cheap to clone, frames never interleave.
#[derive(Clone)]
pub struct IpcSender {
    stream: Arc<UnixStream>,
    write_lock: Arc<Mutex<()>>,
}

impl IpcSender {
    pub async fn send(&self, message: &WorkerMessage) -> Result<()> {
        let bytes = encode_frame(message)?;
        let _guard = self.write_lock.lock().await;
        self.write_all(&bytes).await
    }

    /// Sends `message` with `fd` attached to its first byte.
    pub async fn send_with_fd<Fd: AsFd>(&self, message: &WorkerMessage, fd: Fd) -> Result<()> {
        let bytes = encode_frame(message)?;
        let _guard = self.write_lock.lock().await;

        let sent = loop {
            self.stream.writable().await?;
            let result = self.stream.try_io(Interest::WRITABLE, || {
                let fds = [fd.as_fd()];
                let mut space = [MaybeUninit::<u8>::uninit(); ANCILLARY_SPACE];
                let mut ancillary = SendAncillaryBuffer::new(&mut space);
                if !ancillary.push(SendAncillaryMessage::ScmRights(&fds)) {
                    return Err(io::Error::other("descriptor does not fit ancillary buffer"));
                }
                let iov = [IoSlice::new(&bytes)];
                sendmsg(&*self.stream, &iov, &mut ancillary, SendFlags::empty()).map_err(io::Error::from)
            });
            match result {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        };

        self.write_all(&bytes[sent..]).await
    }

    async fn write_all(&self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(bytes) {
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Receiving half.
pub struct IpcReceiver {
    stream: Arc<UnixStream>,
    decoder: FrameDecoder,
    fds: VecDeque<OwnedFd>,
    eof: bool,
}

impl IpcReceiver {
    /// Receives the next message, or `None` when the peer has closed.
    pub async fn recv(&mut self) -> Result<Option<IpcMessage>> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                let message: WorkerMessage = match serde_json::from_value(frame) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!("Dropping unknown IPC message: {}", e);
                        continue;
                    }
                };
                let fd = if message.carries_fd() {
                    let fd = self.fds.pop_front();
                    if fd.is_none() {
                        tracing::warn!("IPC message expected a descriptor but none was received");
                    }
                    fd
                } else {
                    None
                };
                return Ok(Some(IpcMessage { message, fd }));
            }

            if self.eof {
                return Ok(None);
            }
            self.fill().await?;
        }
    }

    async fn fill(&mut self) -> Result<()> {
        let mut data = [0u8; READ_CHUNK];
        loop {
            self.stream.readable().await?;
            let stream = &self.stream;
            let result = stream.try_io(Interest::READABLE, || {
                let mut space = [MaybeUninit::<u8>::uninit(); ANCILLARY_SPACE];
                let mut ancillary = RecvAncillaryBuffer::new(&mut space);
                let mut iov = [IoSliceMut::new(&mut data)];
                let msg = recvmsg(&**stream, &mut iov, &mut ancillary, RecvFlags::CMSG_CLOEXEC)
                    .map_err(io::Error::from)?;
                let mut fds = Vec::new();
                for message in ancillary.drain() {
                    if let RecvAncillaryMessage::ScmRights(rights) = message {
                        fds.extend(rights);
                    }
                }
                Ok((msg.bytes, fds))
            });

            match result {
                Ok((n, fds)) => {
                    self.fds.extend(fds);
                    if n == 0 {
                        self.eof = true;
                    } else {
                        self.decoder.push(&data[..n]);
                    }
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    self.eof = true;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
