//! Byte-stream view of one session channel, as handed to the access gate.
//!
//! A session owns three forward-only streams: client stdin arriving as
//! channel data, and stdout/stderr leaving as data and extended data.  The
//! read half is the receiving end of the per-channel stdin pipe fed by the
//! connection handler (ownership guarantees the gate cannot keep it past
//! the session); the write half is a cheap clone around the connection
//! handle and may be shared across the copy tasks.

use std::io;

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::sync::mpsc;

/// Receiving half: client stdin.
///
/// Chunks are forwarded by the connection handler; the sender is dropped
/// when the client signals EOF or closes the channel.
pub struct ChannelStdin {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelStdin {
    pub(crate) fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next chunk of stdin data, or `None` once the client has sent EOF or
    /// closed the channel.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Sending half: stdout and stderr towards the client.
#[derive(Clone)]
pub struct ChannelOutput {
    handle: Handle,
    id: ChannelId,
}

impl ChannelOutput {
    pub(crate) fn new(handle: Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "session channel closed")
    }

    /// Write to the client's stdout.
    pub async fn data(&self, buf: &[u8]) -> io::Result<()> {
        self.handle
            .data(self.id, CryptoVec::from_slice(buf))
            .await
            .map_err(|_| Self::closed())
    }

    /// Write to the client's stderr (extended data type 1).
    pub async fn stderr(&self, buf: &[u8]) -> io::Result<()> {
        self.handle
            .extended_data(self.id, 1, CryptoVec::from_slice(buf))
            .await
            .map_err(|_| Self::closed())
    }

    /// Signal the command's exit status (4-byte big-endian, reply not
    /// wanted).
    pub(crate) async fn exit_status(&self, status: u32) -> io::Result<()> {
        self.handle
            .exit_status_request(self.id, status)
            .await
            .map_err(|_| Self::closed())
    }

    pub(crate) async fn eof(&self) -> io::Result<()> {
        self.handle.eof(self.id).await.map_err(|_| Self::closed())
    }

    pub(crate) async fn close(&self) -> io::Result<()> {
        self.handle.close(self.id).await.map_err(|_| Self::closed())
    }
}

/// Both halves of a session channel, as passed to
/// [`Gate::handle_session`](crate::gate::Gate::handle_session).
pub struct SessionChannel {
    stdin: ChannelStdin,
    output: ChannelOutput,
}

impl SessionChannel {
    pub(crate) fn from_parts(stdin: ChannelStdin, output: ChannelOutput) -> Self {
        Self { stdin, output }
    }

    /// Split into independently owned halves so stream copies can run as
    /// peer tasks.
    pub fn split(self) -> (ChannelStdin, ChannelOutput) {
        (self.stdin, self.output)
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.stdin.recv().await
    }

    pub async fn data(&self, buf: &[u8]) -> io::Result<()> {
        self.output.data(buf).await
    }

    pub async fn stderr(&self, buf: &[u8]) -> io::Result<()> {
        self.output.stderr(buf).await
    }
}
