//! Byte transports a peer connection can run over.
//!
//! Implementations:
//! - `TcpStream` - Real peer sockets
//! - `DuplexStream` - In-memory pipes for tests

use bitsync_core::HostPort;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A bidirectional byte stream that splits into independent halves, one
/// for the receive loop and one for the send loop.
pub trait Transport: Send + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// Address of the remote end, if the transport has one.
    fn remote_address(&self) -> Option<HostPort>;

    fn split(self) -> (Self::Reader, Self::Writer);
}

impl Transport for TcpStream {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn remote_address(&self) -> Option<HostPort> {
        self.peer_addr().ok().map(HostPort::from)
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        self.into_split()
    }
}

impl Transport for DuplexStream {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn remote_address(&self) -> Option<HostPort> {
        None
    }

    fn split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self)
    }
}
