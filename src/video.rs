//! Contains code for the video channel

use crate::av::AvMessage;
use crate::common::{CommonMessage, open_response};
use crate::frame::LinkFrame;
use crate::{ChannelContext, ChannelHandlerTrait, ChannelId, HeadUnitTrait, LinkError, Wifi};

/// The inner protected data for a video stream
struct InnerChannelHandler {
    /// The active session id for the video stream
    session: Option<i32>,
}

/// The handler for the video channel
pub struct VideoChannelHandler {
    /// The protected contents of a video stream
    inner: std::sync::Mutex<InnerChannelHandler>,
}

impl VideoChannelHandler {
    /// construct a new self
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(InnerChannelHandler { session: None }),
        }
    }

    /// Send the focus indication for the video stream
    async fn send_focus<T: HeadUnitTrait + ?Sized>(
        &self,
        channel: ChannelId,
        mode: Wifi::video_focus_mode::Enum,
        ctx: &ChannelContext<'_, T>,
    ) -> Result<(), LinkError> {
        let mut m = Wifi::VideoFocusIndication::new();
        m.set_focus_mode(mode);
        m.set_unrequested(false);
        ctx.messenger
            .send(AvMessage::VideoFocusIndication(channel, m).into())?
            .wait()
            .await
    }
}

impl ChannelHandlerTrait for VideoChannelHandler {
    fn build_channel<T: HeadUnitTrait + ?Sized>(
        &self,
        _config: &crate::config::HeadUnitConfiguration,
        chanid: ChannelId,
        main: &T,
    ) -> Option<Wifi::ChannelDescriptor> {
        let sink = main.supports_video()?;
        let profile = sink.profile();
        let mut chan = Wifi::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mut avchan = Wifi::AVChannel::new();
        avchan.set_stream_type(Wifi::avstream_type::Enum::VIDEO);
        avchan.set_available_while_in_call(true);
        let mut vc = Wifi::VideoConfig::new();
        vc.set_video_resolution(profile.resolution.to_wire());
        vc.set_video_fps(profile.fps.to_wire());
        vc.set_dpi(profile.dpi as u32);
        vc.set_margin_width(profile.margin_width as u32);
        vc.set_margin_height(profile.margin_height as u32);
        avchan.video_configs.push(vc);
        chan.av_channel.0.replace(Box::new(avchan));
        Some(chan)
    }

    async fn receive_data<T: HeadUnitTrait + ?Sized>(
        &self,
        msg: LinkFrame,
        ctx: &ChannelContext<'_, T>,
    ) -> Result<(), LinkError> {
        let channel = msg.header.channel_id;
        let msg2: Result<CommonMessage, String> = (&msg).try_into();
        if let Ok(msg2) = msg2 {
            match msg2 {
                CommonMessage::ChannelOpenResponse(_, _) => unimplemented!(),
                CommonMessage::ChannelOpenRequest(m) => {
                    log::info!("Channel open request for video: {:?}", m);
                    let ok = if let Some(v) = ctx.main.supports_video() {
                        v.open().await.is_ok()
                    } else {
                        false
                    };
                    ctx.messenger
                        .send(open_response(channel, ok))?
                        .wait()
                        .await?;
                }
            }
            return Ok(());
        }
        let msg2: AvMessage = (&msg)
            .try_into()
            .map_err(|e: String| LinkError::UnknownMessage { channel, detail: e })?;
        match msg2 {
            AvMessage::MediaIndication(_chan, time, data) => {
                if let Some(v) = ctx.main.supports_video() {
                    v.frame(time, data).await;
                    let session = {
                        let inner = self.inner.lock().unwrap();
                        inner.session.ok_or_else(|| {
                            LinkError::ProtocolViolation(
                                "video data before the stream started".to_string(),
                            )
                        })?
                    };
                    let mut m2 = Wifi::AVMediaAckIndication::new();
                    m2.set_session(session);
                    m2.set_value(1);
                    ctx.messenger
                        .send(AvMessage::MediaAck(channel, m2).into())?
                        .wait()
                        .await?;
                }
            }
            AvMessage::SetupRequest(_chan, _m) => {
                let ok = if let Some(v) = ctx.main.supports_video() {
                    v.init().await.is_ok()
                } else {
                    false
                };
                let mut m2 = Wifi::AVChannelSetupResponse::new();
                m2.set_max_unacked(1);
                m2.set_media_status(if ok {
                    Wifi::avchannel_setup_status::Enum::OK
                } else {
                    Wifi::avchannel_setup_status::Enum::FAIL
                });
                m2.configs.push(0);
                // the focus indication must trail the setup response on the
                // wire, so wait for the send to complete before queueing it
                ctx.messenger
                    .send(AvMessage::SetupResponse(channel, m2).into())?
                    .wait()
                    .await?;
                if ok {
                    self.send_focus(channel, Wifi::video_focus_mode::Enum::FOCUSED, ctx)
                        .await?;
                }
            }
            AvMessage::VideoFocusRequest(_chan, m) => {
                if let Some(v) = ctx.main.supports_video() {
                    v.set_focus(m.focus_mode() == Wifi::video_focus_mode::Enum::FOCUSED)
                        .await;
                    self.send_focus(channel, m.focus_mode(), ctx).await?;
                }
            }
            AvMessage::StartIndication(_chan, m) => {
                let mut inner = self.inner.lock().unwrap();
                inner.session = Some(m.session());
            }
            AvMessage::StopIndication(_chan, _m) => {
                let mut inner = self.inner.lock().unwrap();
                inner.session = None;
            }
            _ => {
                return Err(LinkError::UnknownMessage {
                    channel,
                    detail: "unexpected av message on the video channel".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn stop_channel<T: HeadUnitTrait + ?Sized>(&self, main: &T) {
        if let Some(v) = main.supports_video() {
            v.teardown().await;
        }
    }
}
