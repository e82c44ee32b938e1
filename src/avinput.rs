//! The microphone channel, streaming captured audio back to the phone

use crate::av::AvMessage;
use crate::common::{CommonMessage, open_response};
use crate::frame::LinkFrame;
use crate::{
    ChannelContext, ChannelHandlerTrait, ChannelId, HeadUnitTrait, LinkError, MicrophoneFrame,
    Wifi,
};
use tokio::sync::mpsc;

/// Handles the microphone channel. Captured samples are pushed by the
/// session's microphone pump, this handler only manages the stream state.
pub struct AvInputChannelHandler {
    /// Where the audio source should deliver captured samples
    samples: mpsc::Sender<MicrophoneFrame>,
    /// The session id from the start indication
    session: std::sync::Mutex<Option<i32>>,
}

impl AvInputChannelHandler {
    /// construct a new self delivering captured samples to the given queue
    pub fn new(samples: mpsc::Sender<MicrophoneFrame>) -> Self {
        Self {
            samples,
            session: std::sync::Mutex::new(None),
        }
    }
}

impl ChannelHandlerTrait for AvInputChannelHandler {
    fn build_channel<T: HeadUnitTrait + ?Sized>(
        &self,
        _config: &crate::config::HeadUnitConfiguration,
        chanid: ChannelId,
        main: &T,
    ) -> Option<Wifi::ChannelDescriptor> {
        main.supports_audio_input()?;
        let mut chan = Wifi::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mut avchan = Wifi::AVInputChannel::new();
        avchan.set_stream_type(Wifi::avstream_type::Enum::AUDIO);
        let mut ac = Wifi::AudioConfig::new();
        ac.set_bit_depth(16);
        ac.set_channel_count(1);
        ac.set_sample_rate(16000);
        avchan.audio_config.0.replace(Box::new(ac));
        chan.av_input_channel.0.replace(Box::new(avchan));
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
                    ctx.messenger
                        .send(open_response(channel, true))?
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
            AvMessage::AvInputOpen(_chan, m) => {
                let source = ctx.main.supports_audio_input();
                let ok = if m.open() {
                    if let Some(source) = source {
                        let r = source.open().await;
                        if r.is_ok() {
                            source.attach(self.samples.clone());
                        }
                        r.is_ok()
                    } else {
                        false
                    }
                } else {
                    if let Some(source) = source {
                        source.detach();
                        source.close().await;
                    }
                    true
                };
                if !ok {
                    return Err(LinkError::Unsupported);
                }
                let mut m2 = Wifi::AVInputOpenResponse::new();
                let session = { *self.session.lock().unwrap() };
                m2.set_session(session.unwrap_or(0));
                m2.set_value(0);
                ctx.messenger
                    .send(AvMessage::AvInputOpenResponse(channel, m2).into())?
                    .wait()
                    .await?;
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
                let mut session = self.session.lock().unwrap();
                *session = Some(m.session());
            }
            AvMessage::StopIndication(_chan, _m) => {
                let mut session = self.session.lock().unwrap();
                *session = None;
            }
            _ => {
                return Err(LinkError::UnknownMessage {
                    channel,
                    detail: "unexpected av message on the microphone channel".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn stop_channel<T: HeadUnitTrait + ?Sized>(&self, main: &T) {
        if let Some(source) = main.supports_audio_input() {
            source.detach();
            source.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AudioSource;
    use crate::common::{message_bytes, message_id};
    use crate::frame::{FrameHeader, FrameHeaderContents, FrameHeaderType};
    use crate::testutil;
    use protobuf::Message;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A head unit with only a microphone
    #[derive(Default)]
    struct MicHeadUnit {
        source: StubSource,
    }

    #[derive(Default)]
    struct StubSource {
        open: AtomicBool,
        attached: Mutex<Option<mpsc::Sender<MicrophoneFrame>>>,
    }

    #[async_trait::async_trait]
    impl AudioSource for StubSource {
        async fn open(&self) -> Result<(), ()> {
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }
        fn attach(&self, samples: mpsc::Sender<MicrophoneFrame>) {
            *self.attached.lock().unwrap() = Some(samples);
        }
        fn detach(&self) {
            *self.attached.lock().unwrap() = None;
        }
    }

    #[async_trait::async_trait]
    impl crate::HeadUnitTrait for MicHeadUnit {
        fn supports_audio_input(&self) -> Option<&dyn AudioSource> {
            Some(&self.source)
        }
    }

    fn open_frame(open: bool) -> LinkFrame {
        let mut m = Wifi::AVInputOpenRequest::new();
        m.set_open(open);
        LinkFrame {
            header: FrameHeader {
                channel_id: 8,
                frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
            },
            data: message_bytes(
                Wifi::avchannel_message::Enum::AV_INPUT_OPEN_REQUEST as u16,
                m.write_to_bytes().unwrap(),
            ),
        }
    }

    #[tokio::test]
    async fn open_request_starts_capture_and_attaches() {
        let (tx, _rx) = mpsc::channel(4);
        let h = AvInputChannelHandler::new(tx);
        let t = testutil::harness().await;
        t.authenticate().await;
        let main = MicHeadUnit::default();
        h.receive_data(open_frame(true), &t.ctx(&main)).await.unwrap();
        assert!(main.source.open.load(Ordering::SeqCst));
        assert!(main.source.attached.lock().unwrap().is_some());
        let sent = t.next_sent().await;
        assert_eq!(
            message_id(&sent),
            Wifi::avchannel_message::Enum::AV_INPUT_OPEN_RESPONSE as u16
        );
        let m = Wifi::AVInputOpenResponse::parse_from_bytes(&sent.data[2..]).unwrap();
        assert_eq!(m.value(), 0);
    }

    #[tokio::test]
    async fn close_request_detaches_the_source() {
        let (tx, _rx) = mpsc::channel(4);
        let h = AvInputChannelHandler::new(tx);
        let t = testutil::harness().await;
        t.authenticate().await;
        let main = MicHeadUnit::default();
        h.receive_data(open_frame(true), &t.ctx(&main)).await.unwrap();
        let _ = t.next_sent().await;
        h.receive_data(open_frame(false), &t.ctx(&main)).await.unwrap();
        assert!(!main.source.open.load(Ordering::SeqCst));
        assert!(main.source.attached.lock().unwrap().is_none());
    }

    #[test]
    fn descriptor_is_a_mono_16k_input() {
        let (tx, _rx) = mpsc::channel(4);
        let h = AvInputChannelHandler::new(tx);
        let main = MicHeadUnit::default();
        let config = crate::config::HeadUnitConfiguration::default();
        let chan = h.build_channel(&config, 8, &main).unwrap();
        let av = chan.av_input_channel.0.as_ref().unwrap();
        let ac = av.audio_config.0.as_ref().unwrap();
        assert_eq!(ac.sample_rate(), 16000);
        assert_eq!(ac.channel_count(), 1);
    }
}
