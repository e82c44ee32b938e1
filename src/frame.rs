//! Wire framing for the projection link.

use crate::{ChannelId, FrameRxError, TransportError};
use crate::transport::Transport;

/// Specifies the type of frame header, whether the data of a packet is contained in a single frame, or if it was too large and broken up into multiple frames for transmission.
#[derive(Debug, PartialEq)]
#[repr(u8)]
pub enum FrameHeaderType {
    /// This frame is neither the first or the last of a multi-frame packet
    Middle = 0,
    /// This is the first frame of a multi-frame packet
    First = 1,
    /// This is the last frame of a multi-frame packet
    Last = 2,
    /// The packet is contained in a single frame
    Single = 3,
}

impl From<u8> for FrameHeaderType {
    fn from(value: u8) -> Self {
        match value & 3 {
            0 => FrameHeaderType::Middle,
            1 => FrameHeaderType::First,
            2 => FrameHeaderType::Last,
            _ => FrameHeaderType::Single,
        }
    }
}

impl From<FrameHeaderType> for u8 {
    fn from(value: FrameHeaderType) -> Self {
        value as u8
    }
}

#[allow(missing_docs)]
/// The frame header module, because bitfield new does not make documentation yet.
mod frame_header {
    bitfield::bitfield! {
        #[derive(Copy, Clone)]
        pub struct FrameHeaderContents(u8);
        impl Debug;
        impl new;
        u8;
        /// True indicates the frame is encrypted
        pub get_encryption, set_encryption: 3;
        /// The frame header type
        pub from into super::FrameHeaderType, get_frame_type, set_frame_type: 1, 0;
        /// True when frame carries channel control traffic
        pub get_control, set_control: 2;
    }
}
pub use frame_header::FrameHeaderContents;

/// Represents the header of a frame on the projection link
#[derive(Copy, Clone, Debug)]
pub struct FrameHeader {
    /// The channel that this frame belongs to
    pub channel_id: ChannelId,
    /// The contents of the frame header
    pub frame: FrameHeaderContents,
}

impl FrameHeader {
    /// Add self to the given buffer to build part of a complete frame
    pub fn add_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.channel_id);
        buf.push(self.frame.0);
    }
}

/// A frame of data on the projection link. Outgoing frames carry one complete
/// message each and are split by [LinkFrame::fragment] before transmission.
#[derive(Debug)]
pub struct LinkFrame {
    /// The header of the frame
    pub header: FrameHeader,
    /// The data relayed in the frame, before encryption
    pub data: Vec<u8>,
}

/// One fragment of a [LinkFrame], sized to fit a single wire frame.
#[derive(Debug)]
pub struct FrameFragment {
    /// The header of the fragment
    pub header: FrameHeader,
    /// The declared size of the whole message, present on the first fragment of a multi-frame message
    pub total: Option<u32>,
    /// The plaintext payload of this fragment
    pub data: Vec<u8>,
}

impl LinkFrame {
    /// The largest payload for a single frame
    pub const MAX_FRAME_DATA_SIZE: usize = 0x4000;

    /// Split self into wire-sized fragments with the given payload budget.
    pub fn fragment_at(self, mtu: usize) -> Vec<FrameFragment> {
        let mut m = Vec::new();
        if self.data.len() <= mtu {
            m.push(FrameFragment {
                header: self.header,
                total: None,
                data: self.data,
            });
        } else {
            let total = self.data.len() as u32;
            let packets = self.data.chunks(mtu);
            let max = packets.len();
            for (i, p) in packets.enumerate() {
                let first = i == 0;
                let last = i == (max - 1);
                let mut h = self.header;
                if first {
                    h.frame.set_frame_type(FrameHeaderType::First);
                } else if last {
                    h.frame.set_frame_type(FrameHeaderType::Last);
                } else {
                    h.frame.set_frame_type(FrameHeaderType::Middle);
                }
                m.push(FrameFragment {
                    header: h,
                    total: first.then_some(total),
                    data: p.to_vec(),
                });
            }
        }
        m
    }

    /// Split self into fragments at the standard payload budget.
    pub fn fragment(self) -> Vec<FrameFragment> {
        self.fragment_at(Self::MAX_FRAME_DATA_SIZE)
    }
}

impl FrameFragment {
    /// Build the bytes for the wire with the given payload, which may differ
    /// from [FrameFragment::data] when the payload has been encrypted.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(payload.len() + 8);
        self.header.add_to(&mut buf);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        if let Some(total) = self.total {
            buf.extend_from_slice(&total.to_be_bytes());
        }
        buf.extend_from_slice(payload);
        buf
    }
}

/// A frame as read from the wire, payload still in wire form.
#[derive(Debug)]
pub struct WireFrame {
    /// The header of the frame
    pub header: FrameHeader,
    /// The declared total message size, present when the frame type was First
    pub total: Option<u32>,
    /// The payload exactly as received
    pub payload: Vec<u8>,
}

/// Fill the buffer from the transport, mapping short reads to [TransportError::Closed].
async fn read_exact(transport: &dyn Transport, buf: &mut [u8]) -> Result<(), TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        filled += n;
    }
    Ok(())
}

/// Read a single frame from the transport.
pub async fn read_frame(transport: &dyn Transport) -> Result<WireFrame, FrameRxError> {
    let mut header = [0u8; 2];
    read_exact(transport, &mut header).await?;
    let mut contents = FrameHeaderContents::new(false, FrameHeaderType::Single, false);
    contents.0 = header[1];
    let header = FrameHeader {
        channel_id: header[0],
        frame: contents,
    };
    let mut len = [0u8; 2];
    read_exact(transport, &mut len).await?;
    let len = u16::from_be_bytes(len);
    let total = if header.frame.get_frame_type() == FrameHeaderType::First {
        let mut t = [0u8; 4];
        read_exact(transport, &mut t).await?;
        Some(u32::from_be_bytes(t))
    } else {
        None
    };
    let mut payload = vec![0u8; len as usize];
    read_exact(transport, &mut payload).await?;
    Ok(WireFrame {
        header,
        total,
        payload,
    })
}

/// Reassembles the fragments of one channel back into complete messages.
/// Fragments of a channel arrive strictly ordered, frames of other channels
/// may interleave freely, so the messenger keeps one of these per channel.
#[derive(Default)]
pub struct FrameReassembler {
    /// The declared size of the message being reassembled
    total: Option<u32>,
    /// The data received so far for a multi-frame message
    rx_sofar: Vec<u8>,
}

impl FrameReassembler {
    /// Construct a new reassembler with no partial message
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decrypted frame payload. Returns the complete message data
    /// once the final fragment arrives.
    pub fn push(
        &mut self,
        kind: FrameHeaderType,
        total: Option<u32>,
        data: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, FrameRxError> {
        match kind {
            FrameHeaderType::Single => {
                if !self.rx_sofar.is_empty() {
                    return Err(FrameRxError::ProtocolViolation(
                        "single frame while a multi-frame message is partial".to_string(),
                    ));
                }
                Ok(Some(data))
            }
            FrameHeaderType::First => {
                if !self.rx_sofar.is_empty() {
                    return Err(FrameRxError::ProtocolViolation(
                        "first frame while a multi-frame message is partial".to_string(),
                    ));
                }
                let total = total.ok_or_else(|| {
                    FrameRxError::ProtocolViolation("first frame without a total length".to_string())
                })?;
                self.total = Some(total);
                self.rx_sofar = Vec::with_capacity(total as usize);
                self.rx_sofar.extend_from_slice(&data);
                Ok(None)
            }
            FrameHeaderType::Middle => {
                if self.rx_sofar.is_empty() {
                    return Err(FrameRxError::ProtocolViolation(
                        "middle frame with no message in progress".to_string(),
                    ));
                }
                self.rx_sofar.extend_from_slice(&data);
                Ok(None)
            }
            FrameHeaderType::Last => {
                if self.rx_sofar.is_empty() {
                    return Err(FrameRxError::ProtocolViolation(
                        "last frame with no message in progress".to_string(),
                    ));
                }
                self.rx_sofar.extend_from_slice(&data);
                let complete = std::mem::take(&mut self.rx_sofar);
                let declared = self.total.take();
                if let Some(declared) = declared {
                    if declared as usize != complete.len() {
                        return Err(FrameRxError::ProtocolViolation(format!(
                            "message length {} does not match the declared {}",
                            complete.len(),
                            declared
                        )));
                    }
                }
                Ok(Some(complete))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(chan: ChannelId) -> FrameHeader {
        FrameHeader {
            channel_id: chan,
            frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
        }
    }

    #[test]
    fn header_contents_round_trip() {
        let c = FrameHeaderContents::new(true, FrameHeaderType::First, true);
        assert!(c.get_encryption());
        assert!(c.get_control());
        assert_eq!(c.get_frame_type(), FrameHeaderType::First);
        let mut c2 = FrameHeaderContents::new(false, FrameHeaderType::Single, false);
        c2.0 = c.0;
        assert_eq!(c2.get_frame_type(), FrameHeaderType::First);
        assert!(c2.get_encryption());
    }

    #[test]
    fn single_frame_passes_through() {
        let mut r = FrameReassembler::new();
        let out = r
            .push(FrameHeaderType::Single, None, vec![1, 2, 3])
            .unwrap();
        assert_eq!(out, Some(vec![1, 2, 3]));
    }

    #[test]
    fn fragment_reassemble_any_mtu() {
        let message: Vec<u8> = (0..1000u32).map(|v| v as u8).collect();
        for mtu in [1usize, 2, 3, 7, 100, 999, 1000, 1001, 5000] {
            let frame = LinkFrame {
                header: header(5),
                data: message.clone(),
            };
            let fragments = frame.fragment_at(mtu);
            let mut r = FrameReassembler::new();
            let mut result = None;
            for f in fragments {
                let out = r
                    .push(f.header.frame.get_frame_type(), f.total, f.data)
                    .unwrap();
                if let Some(out) = out {
                    assert!(result.is_none());
                    result = Some(out);
                }
            }
            assert_eq!(result.as_ref(), Some(&message), "mtu {}", mtu);
        }
    }

    #[test]
    fn first_fragment_declares_total() {
        let message = vec![0u8; 100];
        let frame = LinkFrame {
            header: header(1),
            data: message,
        };
        let fragments = frame.fragment_at(30);
        assert_eq!(fragments[0].total, Some(100));
        assert!(fragments[1..].iter().all(|f| f.total.is_none()));
        assert_eq!(
            fragments[0].header.frame.get_frame_type(),
            FrameHeaderType::First
        );
        assert_eq!(
            fragments.last().unwrap().header.frame.get_frame_type(),
            FrameHeaderType::Last
        );
    }

    #[test]
    fn orphan_middle_is_a_violation() {
        let mut r = FrameReassembler::new();
        assert!(matches!(
            r.push(FrameHeaderType::Middle, None, vec![1]),
            Err(FrameRxError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn declared_total_checked_on_last() {
        let mut r = FrameReassembler::new();
        assert!(
            r.push(FrameHeaderType::First, Some(10), vec![0u8; 4])
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            r.push(FrameHeaderType::Last, None, vec![0u8; 4]),
            Err(FrameRxError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn encode_places_lengths() {
        let f = FrameFragment {
            header: header(2),
            total: Some(0x01020304),
            data: vec![9, 9],
        };
        let wire = f.encode(&[9, 9]);
        assert_eq!(wire[0], 2);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]), 2);
        assert_eq!(&wire[4..8], &[1, 2, 3, 4]);
        assert_eq!(&wire[8..], &[9, 9]);
    }
}
