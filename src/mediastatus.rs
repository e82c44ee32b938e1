//! This is for the media status channel handler code

use crate::common::CommonMessage;
use crate::common::open_response;
use crate::frame::LinkFrame;
use crate::{ChannelContext, ChannelHandlerTrait, ChannelId, HeadUnitTrait, LinkError, Wifi};
use protobuf::Message;

/// A message about the media currently playing on the phone
#[derive(Debug)]
enum MediaStatusMessage {
    /// Basic information about changes to the currently playing media
    Playback(ChannelId, Wifi::MediaInfoChannelPlaybackData),
    /// The metadata of the media currently playing
    Metadata(ChannelId, Wifi::MediaInfoChannelMetadataData),
    /// The media status message was invalid for some reason
    Invalid,
}

impl TryFrom<&LinkFrame> for MediaStatusMessage {
    type Error = String;
    fn try_from(value: &LinkFrame) -> Result<Self, Self::Error> {
        use protobuf::Enum;
        let ty = crate::common::message_id(value);
        if let Some(sys) = Wifi::media_info_channel_message::Enum::from_i32(ty as i32) {
            match sys {
                Wifi::media_info_channel_message::Enum::PLAYBACK => {
                    let m = Wifi::MediaInfoChannelPlaybackData::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::Playback(value.header.channel_id, m)),
                        Err(_) => Ok(Self::Invalid),
                    }
                }
                Wifi::media_info_channel_message::Enum::METADATA => {
                    let m = Wifi::MediaInfoChannelMetadataData::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::Metadata(value.header.channel_id, m)),
                        Err(_) => Ok(Self::Invalid),
                    }
                }
                Wifi::media_info_channel_message::Enum::NONE => {
                    Err("Empty media status message".to_string())
                }
            }
        } else {
            Err(format!("Not converted message: {:x?}", value.data))
        }
    }
}

/// The handler for the media status channel. Updates flow one way, from the
/// phone to the dashboard port.
pub struct MediaStatusChannelHandler {}

impl ChannelHandlerTrait for MediaStatusChannelHandler {
    fn build_channel<T: HeadUnitTrait + ?Sized>(
        &self,
        _config: &crate::config::HeadUnitConfiguration,
        chanid: ChannelId,
        _main: &T,
    ) -> Option<Wifi::ChannelDescriptor> {
        let mut chan = Wifi::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mchan = Wifi::MediaInfoChannel::new();
        chan.media_info_channel.0.replace(Box::new(mchan));
        Some(chan)
    }

    async fn receive_data<T: HeadUnitTrait + ?Sized>(
        &self,
        msg: LinkFrame,
        ctx: &ChannelContext<'_, T>,
    ) -> Result<(), LinkError> {
        let channel = msg.header.channel_id;
        let msg2: Result<MediaStatusMessage, String> = (&msg).try_into();
        if let Ok(msg2) = msg2 {
            match msg2 {
                MediaStatusMessage::Metadata(_, m) => {
                    log::debug!("Metadata {:?}", m);
                    if let Some(d) = ctx.main.supports_dashboard() {
                        d.metadata_update(m).await;
                    }
                }
                MediaStatusMessage::Playback(_, m) => {
                    log::debug!("Playback {:?}", m);
                    if let Some(d) = ctx.main.supports_dashboard() {
                        d.playback_update(m).await;
                    }
                }
                MediaStatusMessage::Invalid => {
                    log::error!("Received invalid media info frame");
                }
            }
            return Ok(());
        }
        let msg2: CommonMessage = (&msg)
            .try_into()
            .map_err(|e: String| LinkError::UnknownMessage { channel, detail: e })?;
        match msg2 {
            CommonMessage::ChannelOpenResponse(_, _) => unimplemented!(),
            CommonMessage::ChannelOpenRequest(_m) => {
                ctx.messenger
                    .send(open_response(channel, true))?
                    .wait()
                    .await?;
            }
        }
        Ok(())
    }
}
