//! Messages shared by the audio, video and microphone channels

use crate::common::{message_bytes, message_id};
use crate::frame::{FrameHeader, FrameHeaderContents, FrameHeaderType, LinkFrame};
use crate::{ChannelId, Wifi};
use protobuf::{Enum, Message};

/// A message for an av channel
pub enum AvMessage {
    /// A message to start setup of the av channel
    SetupRequest(ChannelId, Wifi::AVChannelSetupRequest),
    /// A message that responds to a setup request
    SetupResponse(ChannelId, Wifi::AVChannelSetupResponse),
    /// Message requesting the focus of the video channel to be set
    VideoFocusRequest(ChannelId, Wifi::VideoFocusRequest),
    /// Message requesting to open or close the microphone stream
    AvInputOpen(ChannelId, Wifi::AVInputOpenRequest),
    /// The response to a microphone open request
    AvInputOpenResponse(ChannelId, Wifi::AVInputOpenResponse),
    /// Message indicating the focus status of the video stream on the head unit
    VideoFocusIndication(ChannelId, Wifi::VideoFocusIndication),
    /// The stream is about to start
    StartIndication(ChannelId, Wifi::AVChannelStartIndication),
    /// The stream is about to stop
    StopIndication(ChannelId, Wifi::AVChannelStopIndication),
    /// A media indication message, optionally containing a timestamp in
    /// microseconds
    MediaIndication(ChannelId, Option<u64>, Vec<u8>),
    /// An acknowledgement for a media indication message
    MediaAck(ChannelId, Wifi::AVMediaAckIndication),
}

/// Build an encrypted service frame for the given channel
fn service_frame(chan: ChannelId, data: Vec<u8>) -> LinkFrame {
    LinkFrame {
        header: FrameHeader {
            channel_id: chan,
            frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
        },
        data,
    }
}

impl From<AvMessage> for LinkFrame {
    fn from(value: AvMessage) -> Self {
        match value {
            AvMessage::AvInputOpen(_, _) => unimplemented!(),
            AvMessage::AvInputOpenResponse(chan, m) => service_frame(
                chan,
                message_bytes(
                    Wifi::avchannel_message::Enum::AV_INPUT_OPEN_RESPONSE as u16,
                    m.write_to_bytes().unwrap(),
                ),
            ),
            AvMessage::MediaAck(chan, m) => service_frame(
                chan,
                message_bytes(
                    Wifi::avchannel_message::Enum::AV_MEDIA_ACK_INDICATION as u16,
                    m.write_to_bytes().unwrap(),
                ),
            ),
            AvMessage::SetupRequest(_, _) => unimplemented!(),
            AvMessage::SetupResponse(chan, m) => service_frame(
                chan,
                message_bytes(
                    Wifi::avchannel_message::Enum::SETUP_RESPONSE as u16,
                    m.write_to_bytes().unwrap(),
                ),
            ),
            AvMessage::MediaIndication(chan, timestamp, mut data) => {
                let (t, data) = if let Some(ts) = timestamp {
                    let mut m = ts.to_be_bytes().to_vec();
                    m.append(&mut data);
                    (
                        Wifi::avchannel_message::Enum::AV_MEDIA_WITH_TIMESTAMP_INDICATION as u16,
                        m,
                    )
                } else {
                    (Wifi::avchannel_message::Enum::AV_MEDIA_INDICATION as u16, data)
                };
                service_frame(chan, message_bytes(t, data))
            }
            AvMessage::VideoFocusRequest(_chan, _m) => unimplemented!(),
            AvMessage::VideoFocusIndication(chan, m) => service_frame(
                chan,
                message_bytes(
                    Wifi::avchannel_message::Enum::VIDEO_FOCUS_INDICATION as u16,
                    m.write_to_bytes().unwrap(),
                ),
            ),
            AvMessage::StartIndication(_, _) => unimplemented!(),
            AvMessage::StopIndication(_, _) => unimplemented!(),
        }
    }
}

impl TryFrom<&LinkFrame> for AvMessage {
    type Error = String;
    fn try_from(value: &LinkFrame) -> Result<Self, Self::Error> {
        let ty = message_id(value);
        if let Some(sys) = Wifi::avchannel_message::Enum::from_i32(ty as i32) {
            match sys {
                Wifi::avchannel_message::Enum::AV_MEDIA_WITH_TIMESTAMP_INDICATION => {
                    if value.data.len() < 10 {
                        return Err("Truncated timestamped media message".to_string());
                    }
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&value.data[2..10]);
                    let ts: u64 = u64::from_be_bytes(b);
                    Ok(Self::MediaIndication(
                        value.header.channel_id,
                        Some(ts),
                        value.data[10..].to_vec(),
                    ))
                }
                Wifi::avchannel_message::Enum::AV_MEDIA_INDICATION => Ok(Self::MediaIndication(
                    value.header.channel_id,
                    None,
                    value.data[2..].to_vec(),
                )),
                Wifi::avchannel_message::Enum::SETUP_REQUEST => {
                    let m = Wifi::AVChannelSetupRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::SetupRequest(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid channel setup request: {}", e)),
                    }
                }
                Wifi::avchannel_message::Enum::START_INDICATION => {
                    let m = Wifi::AVChannelStartIndication::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::StartIndication(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid channel start request: {}", e)),
                    }
                }
                Wifi::avchannel_message::Enum::STOP_INDICATION => {
                    let m = Wifi::AVChannelStopIndication::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::StopIndication(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid channel stop request: {}", e)),
                    }
                }
                Wifi::avchannel_message::Enum::AV_INPUT_OPEN_REQUEST => {
                    let m = Wifi::AVInputOpenRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::AvInputOpen(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid microphone open request: {}", e)),
                    }
                }
                Wifi::avchannel_message::Enum::VIDEO_FOCUS_REQUEST => {
                    let m = Wifi::VideoFocusRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::VideoFocusRequest(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid video focus request: {}", e)),
                    }
                }
                Wifi::avchannel_message::Enum::SETUP_RESPONSE
                | Wifi::avchannel_message::Enum::AV_MEDIA_ACK_INDICATION
                | Wifi::avchannel_message::Enum::AV_INPUT_OPEN_RESPONSE
                | Wifi::avchannel_message::Enum::VIDEO_FOCUS_INDICATION => {
                    Err(format!("Head unit to phone message from the phone: {:x}", ty))
                }
            }
        } else {
            Err(format!("Not converted message: {:x?}", value.data))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamped_media_round_trips() {
        let f: LinkFrame = AvMessage::MediaIndication(4, Some(777), vec![1, 2, 3]).into();
        assert_eq!(
            message_id(&f),
            Wifi::avchannel_message::Enum::AV_MEDIA_WITH_TIMESTAMP_INDICATION as u16
        );
        let parsed: AvMessage = (&f).try_into().unwrap();
        match parsed {
            AvMessage::MediaIndication(chan, ts, data) => {
                assert_eq!(chan, 4);
                assert_eq!(ts, Some(777));
                assert_eq!(data, vec![1, 2, 3]);
            }
            _ => panic!("wrong message"),
        }
    }

    #[test]
    fn truncated_timestamp_rejected() {
        let f = LinkFrame {
            header: FrameHeader {
                channel_id: 4,
                frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
            },
            data: vec![0x00, 0x00, 1, 2],
        };
        let parsed: Result<AvMessage, String> = (&f).try_into();
        assert!(parsed.is_err());
    }
}
