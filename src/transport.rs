//! Transport adapters presenting a uniform byte port over TCP and USB.

use crate::TransportError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// The byte-oriented port that the projection link runs over. Both adapters
/// honor cooperative cancellation, any read or write in flight when
/// [Transport::stop] is called resolves with [TransportError::Aborted].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Read some bytes into the buffer, returning the count read
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;
    /// Write all of the given bytes
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;
    /// Cancel all pending io and refuse further io
    fn stop(&self);
}

/// Translate an io error into the transport error space
fn map_io(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe => TransportError::Closed,
        _ => TransportError::Io(e),
    }
}

/// A transport over any async byte stream, used for TCP sockets and for the
/// in-memory pipes the tests run on.
pub struct StreamTransport<T: AsyncRead + AsyncWrite + Send> {
    /// The reading half of the stream
    reader: tokio::sync::Mutex<tokio::io::ReadHalf<T>>,
    /// The writing half of the stream
    writer: tokio::sync::Mutex<tokio::io::WriteHalf<T>>,
    /// Cancelled when the transport is stopped
    cancel: CancellationToken,
}

impl<T: AsyncRead + AsyncWrite + Send> StreamTransport<T> {
    /// Construct a new self over the given stream
    pub fn new(stream: T) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: tokio::sync::Mutex::new(r),
            writer: tokio::sync::Mutex::new(w),
            cancel: CancellationToken::new(),
        }
    }
}

/// The transport for wireless projection sessions
pub type TcpTransport = StreamTransport<tokio::net::TcpStream>;

impl TcpTransport {
    /// Construct a transport over a freshly accepted socket
    pub fn from_tcp(stream: tokio::net::TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        Self::new(stream)
    }
}

#[async_trait::async_trait]
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for StreamTransport<T> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Aborted),
            r = reader.read(buf) => r.map_err(map_io),
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Aborted),
            r = writer.write_all(data) => r.map_err(map_io),
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// The transport over the bulk endpoints of a device in accessory mode
#[cfg(feature = "usb")]
pub struct UsbTransport {
    /// The claimed accessory interface
    interface: nusb::Interface,
    /// The bulk-in endpoint address
    in_ep: u8,
    /// The bulk-out endpoint address
    out_ep: u8,
    /// Bytes from the last bulk transfer not yet handed to a reader
    leftover: tokio::sync::Mutex<Vec<u8>>,
    /// Cancelled when the transport is stopped
    cancel: CancellationToken,
}

#[cfg(feature = "usb")]
impl UsbTransport {
    /// The request size for bulk-in transfers
    const BULK_READ_SIZE: usize = 16384;

    /// Construct a new self over the endpoints resolved by the accessory hub
    pub fn new(endpoints: crate::usb::AccessoryEndpoints) -> Self {
        Self {
            interface: endpoints.interface,
            in_ep: endpoints.in_ep,
            out_ep: endpoints.out_ep,
            leftover: tokio::sync::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Translate a transfer error into the transport error space
    fn map_transfer(e: nusb::transfer::TransferError) -> TransportError {
        match e {
            nusb::transfer::TransferError::Cancelled => TransportError::Aborted,
            nusb::transfer::TransferError::Disconnected => TransportError::Closed,
            other => TransportError::Io(std::io::Error::other(other)),
        }
    }
}

#[cfg(feature = "usb")]
#[async_trait::async_trait]
impl Transport for UsbTransport {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        let mut leftover = self.leftover.lock().await;
        if leftover.is_empty() {
            let req = nusb::transfer::RequestBuffer::new(Self::BULK_READ_SIZE);
            let data = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransportError::Aborted),
                c = self.interface.bulk_in(self.in_ep, req) => {
                    c.into_result().map_err(Self::map_transfer)?
                }
            };
            *leftover = data;
        }
        let n = leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&leftover[..n]);
        leftover.drain(..n);
        Ok(n)
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Aborted);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Aborted),
            c = self.interface.bulk_out(self.out_ep, data.to_vec()) => {
                c.into_result().map(|_| ()).map_err(Self::map_transfer)
            }
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_transport_round_trip() {
        let (a, b) = tokio::io::duplex(256);
        let ta = StreamTransport::new(a);
        let tb = StreamTransport::new(b);
        ta.write(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = tb.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn stop_aborts_pending_read() {
        let (a, _b) = tokio::io::duplex(256);
        let ta = std::sync::Arc::new(StreamTransport::new(a));
        let t2 = ta.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            t2.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        ta.stop();
        let r = reader.await.unwrap();
        assert!(matches!(r, Err(TransportError::Aborted)));
    }

    #[tokio::test]
    async fn stopped_transport_refuses_io() {
        let (a, _b) = tokio::io::duplex(16);
        let ta = StreamTransport::new(a);
        ta.stop();
        assert!(matches!(
            ta.write(b"x").await,
            Err(TransportError::Aborted)
        ));
        let mut buf = [0u8; 4];
        assert!(matches!(ta.read(&mut buf).await, Err(TransportError::Aborted)));
    }

    #[tokio::test]
    async fn peer_close_reports_closed() {
        let (a, b) = tokio::io::duplex(16);
        let ta = StreamTransport::new(a);
        drop(b);
        let mut buf = [0u8; 4];
        // a closed duplex reads zero bytes, the framing layer maps that to Closed
        assert_eq!(ta.read(&mut buf).await.unwrap(), 0);
    }
}
