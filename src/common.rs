//! Messages and state common to all channels

use crate::frame::{FrameHeader, FrameHeaderContents, FrameHeaderType, LinkFrame};
use crate::{ChannelId, Wifi};
use protobuf::{Enum, Message};

/// Prefix a message id onto serialized message bytes
pub fn message_bytes(id: u16, mut body: Vec<u8>) -> Vec<u8> {
    let mut m = Vec::with_capacity(body.len() + 2);
    m.extend_from_slice(&id.to_be_bytes());
    m.append(&mut body);
    m
}

/// The message id carried at the front of a complete message
pub fn message_id(frame: &LinkFrame) -> u16 {
    let mut ty = [0u8; 2];
    ty.copy_from_slice(&frame.data[0..2]);
    u16::from_be_bytes(ty)
}

/// Messages common to all projection channels.
#[derive(Debug)]
pub enum CommonMessage {
    /// A request to open the channel from the phone
    ChannelOpenRequest(Wifi::ChannelOpenRequest),
    /// A response to a channel open request
    ChannelOpenResponse(ChannelId, Wifi::ChannelOpenResponse),
}

impl TryFrom<&LinkFrame> for CommonMessage {
    type Error = String;
    fn try_from(value: &LinkFrame) -> Result<Self, Self::Error> {
        let ty = message_id(value);
        if value.header.frame.get_control() {
            let w = Wifi::CommonMessageId::from_i32(ty as i32);
            if let Some(m) = w {
                match m {
                    Wifi::CommonMessageId::CHANNEL_OPEN_RESPONSE => unimplemented!(),
                    Wifi::CommonMessageId::CHANNEL_OPEN_REQUEST => {
                        let m = Wifi::ChannelOpenRequest::parse_from_bytes(&value.data[2..]);
                        match m {
                            Ok(m) => Ok(CommonMessage::ChannelOpenRequest(m)),
                            Err(e) => Err(format!("Invalid channel open request: {}", e)),
                        }
                    }
                    Wifi::CommonMessageId::COMMON_MESSAGE_NONE => {
                        Err("Empty common message".to_string())
                    }
                }
            } else {
                Err(format!("Unknown packet type 0x{:x}", ty))
            }
        } else {
            Err(format!(
                "Unhandled specific message for channel {:?} {:x?}",
                value.header.channel_id, value.data
            ))
        }
    }
}

impl From<CommonMessage> for LinkFrame {
    fn from(value: CommonMessage) -> Self {
        match value {
            CommonMessage::ChannelOpenResponse(chan, m) => {
                let data = message_bytes(
                    Wifi::CommonMessageId::CHANNEL_OPEN_RESPONSE as u16,
                    m.write_to_bytes().unwrap(),
                );
                LinkFrame {
                    header: FrameHeader {
                        channel_id: chan,
                        frame: FrameHeaderContents::new(true, FrameHeaderType::Single, true),
                    },
                    data,
                }
            }
            CommonMessage::ChannelOpenRequest(_) => unimplemented!(),
        }
    }
}

/// Build the standard response to an open request
pub fn open_response(chan: ChannelId, ok: bool) -> LinkFrame {
    let mut m = Wifi::ChannelOpenResponse::new();
    m.set_status(if ok {
        Wifi::status::Enum::OK
    } else {
        Wifi::status::Enum::FAIL
    });
    CommonMessage::ChannelOpenResponse(chan, m).into()
}
