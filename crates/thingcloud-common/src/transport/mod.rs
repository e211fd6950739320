//! Byte-level transports.
//!
//! - [`framing`]: newline-delimited JSON over any async byte stream
//! - [`ipc`]: supervisor ↔ worker channel with descriptor passing
//! - [`tcp`]: outbound TCP connection helper used by front ends

pub mod framing;
pub mod ipc;
pub mod tcp;

pub use framing::{encode_frame, FrameDecoder, FramedReader, FramedWriter, MAX_FRAME_SIZE};
pub use ipc::{IpcChannel, IpcMessage, IpcReceiver, IpcSender, IPC_FD_ENV};
pub use tcp::{connect, DEFAULT_CONNECT_TIMEOUT};
