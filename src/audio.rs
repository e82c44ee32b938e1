//! The audio output channels. Media, speech and system audio share one
//! handler parameterized by the channel kind.

use crate::av::AvMessage;
use crate::common::{CommonMessage, open_response};
use crate::frame::LinkFrame;
use crate::{
    AudioChannelKind, ChannelContext, ChannelHandlerTrait, ChannelId, HeadUnitTrait, LinkError,
    Wifi,
};

/// The handler for one audio output channel
pub struct AudioChannelHandler {
    /// Which audio stream this channel carries
    kind: AudioChannelKind,
    /// The active session id for the stream
    session: std::sync::Mutex<Option<i32>>,
}

impl AudioChannelHandler {
    /// construct a new self for the given stream kind
    pub fn new(kind: AudioChannelKind) -> Self {
        Self {
            kind,
            session: std::sync::Mutex::new(None),
        }
    }
}

impl ChannelHandlerTrait for AudioChannelHandler {
    fn build_channel<T: HeadUnitTrait + ?Sized>(
        &self,
        _config: &crate::config::HeadUnitConfiguration,
        chanid: ChannelId,
        main: &T,
    ) -> Option<Wifi::ChannelDescriptor> {
        main.supports_audio_output()?;
        let mut chan = Wifi::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mut avchan = Wifi::AVChannel::new();
        avchan.set_audio_type(self.kind.audio_type());
        avchan.set_available_while_in_call(true);
        avchan.set_stream_type(Wifi::avstream_type::Enum::AUDIO);
        let (sample_rate, channel_count) = self.kind.sample_format();
        let mut ac = Wifi::AudioConfig::new();
        ac.set_bit_depth(16);
        ac.set_channel_count(channel_count);
        ac.set_sample_rate(sample_rate);
        avchan.audio_configs.push(ac);
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
                CommonMessage::ChannelOpenRequest(_m) => {
                    let ok = if let Some(a) = ctx.main.supports_audio_output() {
                        a.open_channel(self.kind).await.is_ok()
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
            AvMessage::MediaIndication(_chan, timestamp, data) => {
                if let Some(a) = ctx.main.supports_audio_output() {
                    a.receive_audio(self.kind, timestamp, data).await;
                    let session = { *self.session.lock().unwrap() };
                    if let Some(session) = session {
                        let mut m2 = Wifi::AVMediaAckIndication::new();
                        m2.set_session(session);
                        m2.set_value(1);
                        ctx.messenger
                            .send(AvMessage::MediaAck(channel, m2).into())?
                            .wait()
                            .await?;
                    }
                }
            }
            AvMessage::SetupRequest(_chan, _m) => {
                let mut m2 = Wifi::AVChannelSetupResponse::new();
                m2.set_max_unacked(10);
                m2.set_media_status(Wifi::avchannel_setup_status::Enum::OK);
                m2.configs.push(0);
                ctx.messenger
                    .send(AvMessage::SetupResponse(channel, m2).into())?
                    .wait()
                    .await?;
            }
            AvMessage::StartIndication(_chan, m) => {
                {
                    let mut session = self.session.lock().unwrap();
                    *session = Some(m.session());
                }
                if let Some(a) = ctx.main.supports_audio_output() {
                    a.start_audio(self.kind).await;
                }
            }
            AvMessage::StopIndication(_chan, _m) => {
                {
                    let mut session = self.session.lock().unwrap();
                    *session = None;
                }
                if let Some(a) = ctx.main.supports_audio_output() {
                    a.stop_audio(self.kind).await;
                }
            }
            _ => {
                return Err(LinkError::UnknownMessage {
                    channel,
                    detail: "unexpected av message on an audio channel".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn stop_channel<T: HeadUnitTrait + ?Sized>(&self, main: &T) {
        if let Some(a) = main.supports_audio_output() {
            a.stop_audio(self.kind).await;
            a.close_channel(self.kind).await;
        }
    }
}
