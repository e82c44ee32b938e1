//! This is for the navigation channel handler code

use crate::common::CommonMessage;
use crate::common::open_response;
use crate::frame::LinkFrame;
use crate::{ChannelContext, ChannelHandlerTrait, ChannelId, HeadUnitTrait, LinkError, Wifi};
use protobuf::Message;

/// A message about navigation progress on the phone
#[derive(Debug)]
enum NavigationMessage {
    /// A message indicating navigation status
    Status(ChannelId, Wifi::NavigationStatus),
    /// A message that conveys turn information
    TurnIndication(ChannelId, Wifi::NavigationTurnEvent),
    /// A message that conveys distance for navigation
    DistanceIndication(ChannelId, Wifi::NavigationDistanceEvent),
}

impl TryFrom<&LinkFrame> for NavigationMessage {
    type Error = String;
    fn try_from(value: &LinkFrame) -> Result<Self, Self::Error> {
        use protobuf::Enum;
        let ty = crate::common::message_id(value);
        if let Some(sys) = Wifi::navigation_channel_message::Enum::from_i32(ty as i32) {
            match sys {
                Wifi::navigation_channel_message::Enum::STATUS => {
                    let m = Wifi::NavigationStatus::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::Status(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid frame: {}", e)),
                    }
                }
                Wifi::navigation_channel_message::Enum::TURN_EVENT => {
                    let m = Wifi::NavigationTurnEvent::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::TurnIndication(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid frame: {}", e)),
                    }
                }
                Wifi::navigation_channel_message::Enum::DISTANCE_EVENT => {
                    let m = Wifi::NavigationDistanceEvent::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::DistanceIndication(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid frame: {}", e)),
                    }
                }
                Wifi::navigation_channel_message::Enum::NONE => {
                    Err("Empty navigation message".to_string())
                }
            }
        } else {
            Err(format!("Not converted message: {:x?}", value.data))
        }
    }
}

/// The handler for the navigation status channel
pub struct NavigationChannelHandler {}

impl ChannelHandlerTrait for NavigationChannelHandler {
    fn build_channel<T: HeadUnitTrait + ?Sized>(
        &self,
        _config: &crate::config::HeadUnitConfiguration,
        chanid: ChannelId,
        _main: &T,
    ) -> Option<Wifi::ChannelDescriptor> {
        let mut chan = Wifi::ChannelDescriptor::new();
        let mut navchan = Wifi::NavigationChannel::new();
        navchan.set_minimum_interval_ms(1000);
        navchan.set_turn_type(Wifi::navigation_turn_type::Enum::IMAGE);
        let mut io = Wifi::NavigationImageOptions::new();
        io.set_colour_depth_bits(16);
        io.set_height(256);
        io.set_width(256);
        navchan.image_options.0.replace(Box::new(io));
        chan.set_channel_id(chanid as u32);
        chan.navigation_channel.0.replace(Box::new(navchan));
        Some(chan)
    }

    async fn receive_data<T: HeadUnitTrait + ?Sized>(
        &self,
        msg: LinkFrame,
        ctx: &ChannelContext<'_, T>,
    ) -> Result<(), LinkError> {
        let channel = msg.header.channel_id;
        let msg1: Result<NavigationMessage, String> = (&msg).try_into();
        if let Ok(msg1) = msg1 {
            match msg1 {
                NavigationMessage::Status(_, status) => {
                    if let Some(d) = ctx.main.supports_dashboard() {
                        d.navigation_status(status).await;
                    }
                }
                NavigationMessage::TurnIndication(_, turn) => {
                    if let Some(d) = ctx.main.supports_dashboard() {
                        d.turn_event(turn).await;
                    }
                }
                NavigationMessage::DistanceIndication(_, distance) => {
                    if let Some(d) = ctx.main.supports_dashboard() {
                        d.distance_event(distance).await;
                    }
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
