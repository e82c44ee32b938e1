//! One projection session, from transport-up to quit.

use crate::audio::AudioChannelHandler;
use crate::av::AvMessage;
use crate::avinput::AvInputChannelHandler;
use crate::bluetooth::BluetoothChannelHandler;
use crate::control::{ControlChannelHandler, ControlMessage};
use crate::cryptor::Cryptor;
use crate::input::{InputChannelHandler, InputTranslator};
use crate::mediastatus::MediaStatusChannelHandler;
use crate::messenger::Messenger;
use crate::navigation::NavigationChannelHandler;
use crate::pinger::Pinger;
use crate::sensor::SensorChannelHandler;
use crate::transport::Transport;
use crate::video::VideoChannelHandler;
use crate::{
    AudioChannelKind, CONTROL_CHANNEL, ChannelContext, ChannelHandlerTrait, ChannelId,
    HeadUnitTrait, LinkError, Wifi,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Time between ping requests
pub const PING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);
/// How long the phone may stay quiet before the session quits
pub const PING_DEADLINE: std::time::Duration = std::time::Duration::from_secs(15);

/// The lifecycle of a projection session
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
pub enum SessionState {
    /// Nothing has happened yet
    #[default]
    Idle,
    /// The version request has been sent
    VersionSent,
    /// The tls handshake is running
    HandshakeInProgress,
    /// The link is authenticated
    AuthComplete,
    /// Service discovery has completed
    Discovered,
    /// Service channels are exchanging traffic
    Active,
    /// The session is shutting down
    Shutdown,
}

/// The channel handler type that covers all possible channel handlers
#[enum_dispatch::enum_dispatch(ChannelHandlerTrait)]
pub(crate) enum ChannelHandler {
    /// The control channel
    Control(ControlChannelHandler),
    /// The input channel
    Input(InputChannelHandler),
    /// The sensor channel
    Sensor(SensorChannelHandler),
    /// The video channel
    Video(VideoChannelHandler),
    /// An audio output channel
    Audio(AudioChannelHandler),
    /// The microphone channel
    AvInput(AvInputChannelHandler),
    /// The bluetooth pairing channel
    Bluetooth(BluetoothChannelHandler),
    /// The navigation status channel
    Navigation(NavigationChannelHandler),
    /// The media status channel
    MediaStatus(MediaStatusChannelHandler),
}

/// Everything a spawned channel task needs to own
struct TaskServices<T: HeadUnitTrait + ?Sized> {
    /// The messenger of the session
    messenger: Arc<Messenger>,
    /// The session configuration
    config: Arc<crate::config::HeadUnitConfiguration>,
    /// The embedder
    main: Arc<T>,
    /// The session state
    state: Arc<watch::Sender<SessionState>>,
    /// The liveness monitor
    pinger: Arc<Pinger>,
}

impl<T: HeadUnitTrait + ?Sized> Clone for TaskServices<T> {
    fn clone(&self) -> Self {
        Self {
            messenger: self.messenger.clone(),
            config: self.config.clone(),
            main: self.main.clone(),
            state: self.state.clone(),
            pinger: self.pinger.clone(),
        }
    }
}

impl<T: HeadUnitTrait + ?Sized> TaskServices<T> {
    /// Borrow the services as a channel context
    fn ctx(&self) -> ChannelContext<'_, T> {
        ChannelContext {
            messenger: &self.messenger,
            config: &self.config,
            main: self.main.as_ref(),
            state: &self.state,
            pinger: &self.pinger,
        }
    }
}

/// The receive loop of one channel. Unknown messages on service channels
/// re-arm the receive, anything else ends the session.
async fn channel_task<T: HeadUnitTrait + ?Sized>(
    services: TaskServices<T>,
    handlers: Arc<Vec<ChannelHandler>>,
    chan: ChannelId,
) -> Result<(), LinkError> {
    let handler = &handlers[chan as usize];
    loop {
        let msg = services.messenger.receive(chan).await?;
        if chan != CONTROL_CHANNEL {
            let mut flip = false;
            services.state.send_if_modified(|s| {
                if *s == SessionState::Discovered {
                    *s = SessionState::Active;
                    flip = true;
                }
                flip
            });
        }
        match handler.receive_data(msg, &services.ctx()).await {
            Ok(()) => {}
            Err(LinkError::UnknownMessage { channel, detail }) if chan != CONTROL_CHANNEL => {
                log::warn!("Unknown message on channel {}: {}", channel, detail);
            }
            Err(e) => return Err(e),
        }
    }
}

/// The ping loop. Each resolve sends one ping request, a timeout ends the
/// session.
async fn ping_task<T: HeadUnitTrait + ?Sized>(
    services: TaskServices<T>,
) -> Result<(), LinkError> {
    loop {
        services.pinger.ping().await?;
        let mut m = Wifi::PingRequest::new();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        m.set_timestamp(now);
        services
            .messenger
            .send(ControlMessage::PingRequest(m).into())?
            .wait()
            .await?;
    }
}

/// Pump captured microphone samples to the phone
async fn microphone_task(
    mut samples: mpsc::Receiver<crate::MicrophoneFrame>,
    chan: ChannelId,
    messenger: Arc<Messenger>,
) -> Result<(), LinkError> {
    while let Some(frame) = samples.recv().await {
        messenger.send(
            AvMessage::MediaIndication(chan, Some(frame.timestamp), frame.data).into(),
        )?;
    }
    Ok(())
}

/// Run one projection session over the given transport until the phone
/// shuts it down, an error ends it, or `stop` is cancelled. Returns Ok for
/// an orderly stop, the ending error otherwise.
pub async fn run_session<T: HeadUnitTrait + ?Sized + 'static>(
    transport: Arc<dyn Transport>,
    config: crate::config::HeadUnitConfiguration,
    main: Arc<T>,
    stop: CancellationToken,
) -> Result<(), LinkError> {
    let cryptor = Cryptor::new(config.custom_certificate.as_ref())?;
    let messenger = Arc::new(Messenger::new(transport.clone(), cryptor));
    let (state_tx, _state_rx) = watch::channel(SessionState::Idle);
    let services = TaskServices {
        messenger: messenger.clone(),
        config: Arc::new(config),
        main,
        state: Arc::new(state_tx),
        pinger: Arc::new(Pinger::new(PING_INTERVAL, PING_DEADLINE)),
    };

    // assemble the channel list, the control channel is always channel zero
    let mut handlers: Vec<ChannelHandler> = Vec::new();
    handlers.push(ControlChannelHandler::new().into());
    let (input_tx, input_rx) = mpsc::channel(64);
    let mut input_chan = None;
    if services.main.supports_input().is_some() {
        input_chan = Some(handlers.len() as ChannelId);
        handlers.push(InputChannelHandler::new(input_tx).into());
    }
    let mut sensor_chan = None;
    let mut sensor_started = None;
    if services.main.supports_sensors().is_some() {
        let h = SensorChannelHandler::new();
        sensor_started = Some(h.started_handle());
        sensor_chan = Some(handlers.len() as ChannelId);
        handlers.push(h.into());
    }
    if services.main.supports_video().is_some() {
        handlers.push(VideoChannelHandler::new().into());
    }
    if services.main.supports_audio_output().is_some() {
        let audio = &services.config.settings.audio;
        if audio.media_enabled {
            handlers.push(AudioChannelHandler::new(AudioChannelKind::Media).into());
        }
        if audio.speech_enabled {
            handlers.push(AudioChannelHandler::new(AudioChannelKind::Speech).into());
        }
        handlers.push(AudioChannelHandler::new(AudioChannelKind::System).into());
    }
    let (mic_tx, mic_rx) = mpsc::channel(64);
    let mut mic_chan = None;
    if services.main.supports_audio_input().is_some() {
        mic_chan = Some(handlers.len() as ChannelId);
        handlers.push(AvInputChannelHandler::new(mic_tx).into());
    }
    if services.main.supports_bluetooth().is_some() {
        handlers.push(BluetoothChannelHandler {}.into());
    }
    handlers.push(NavigationChannelHandler {}.into());
    handlers.push(MediaStatusChannelHandler {}.into());

    let mut chans = Vec::new();
    for (index, handler) in handlers.iter().enumerate() {
        let chan: ChannelId = index as ChannelId;
        if let Some(chan) = handler.build_channel(&services.config, chan, services.main.as_ref()) {
            chans.push(chan);
        }
    }
    handlers[0].set_channels(chans);
    let handlers = Arc::new(handlers);

    services.main.connect().await;
    log::info!("Session starting with {} channels", handlers.len());

    let mut tasks: tokio::task::JoinSet<Result<(), LinkError>> = tokio::task::JoinSet::new();
    {
        let m = messenger.clone();
        tasks.spawn(async move { Err(m.run_pump().await) });
    }
    {
        let m = messenger.clone();
        tasks.spawn(async move { m.run_writer().await });
    }
    for chan in 0..handlers.len() as ChannelId {
        tasks.spawn(channel_task(services.clone(), handlers.clone(), chan));
    }
    tasks.spawn(ping_task(services.clone()));
    if let Some(chan) = input_chan {
        let translator = InputTranslator::new(
            services
                .main
                .supports_input()
                .map(|i| i.profile().touchscreen)
                .unwrap_or(None),
            services.config.settings.video.resolution.dimensions(),
        );
        let m = messenger.clone();
        tasks.spawn(async move {
            crate::input::run_input_pump(input_rx, translator, chan, m).await;
            Ok(())
        });
    } else {
        drop(input_rx);
    }
    if let (Some(chan), Some(started)) = (sensor_chan, sensor_started) {
        if let Some(sensors) = services.main.supports_sensors() {
            let m = messenger.clone();
            let night = sensors.night_mode();
            let started2 = started.clone();
            tasks.spawn(async move {
                crate::sensor::run_night_pump(started2, night, chan, m).await;
                Ok(())
            });
            if let Some(location) = sensors.location() {
                let m = messenger.clone();
                tasks.spawn(async move {
                    crate::sensor::run_location_pump(started, location, chan, m).await;
                    Ok(())
                });
            }
        }
    }
    if let Some(chan) = mic_chan {
        tasks.spawn(microphone_task(mic_rx, chan, messenger.clone()));
    } else {
        drop(mic_rx);
    }

    // kick the lifecycle off
    services.state.send_replace(SessionState::VersionSent);
    let start = async {
        messenger
            .send(ControlMessage::VersionRequest.into())?
            .wait()
            .await
    };

    let mut result = Ok(());
    tokio::select! {
        r = async {
            start.await?;
            loop {
                match tasks.join_next().await {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => break Err(e),
                    Some(Err(e)) => {
                        if e.is_panic() {
                            break Err(LinkError::ProtocolViolation(format!(
                                "session task panicked: {}",
                                e
                            )));
                        }
                    }
                    None => break Ok(()),
                }
            }
        } => {
            result = r;
        }
        _ = stop.cancelled() => {}
    }

    // orderly teardown, the pinger first so it cannot fire a spurious quit
    services.pinger.cancel();
    services.state.send_replace(SessionState::Shutdown);
    for handler in handlers.iter() {
        handler.stop_channel(services.main.as_ref()).await;
    }
    messenger.stop();
    transport.stop();
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
    services.main.disconnect().await;
    log::info!("Session ended: {:?}", result);
    match result {
        Err(LinkError::ShutdownRequested) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::message_id;
    use crate::frame::{FrameHeader, FrameHeaderContents, FrameHeaderType, LinkFrame};
    use crate::testutil::NullHeadUnit;
    use crate::transport::StreamTransport;
    use protobuf::Message;

    /// Read one frame from the peer side of the pipe
    async fn read_frame(
        peer: &StreamTransport<tokio::io::DuplexStream>,
    ) -> crate::frame::WireFrame {
        crate::frame::read_frame(peer).await.unwrap()
    }

    /// Write a plaintext control message to the session under test
    async fn write_control(
        peer: &StreamTransport<tokio::io::DuplexStream>,
        data: Vec<u8>,
    ) {
        let f = LinkFrame {
            header: FrameHeader {
                channel_id: CONTROL_CHANNEL,
                frame: FrameHeaderContents::new(false, FrameHeaderType::Single, false),
            },
            data,
        };
        for frag in f.fragment() {
            peer.write(&frag.encode(&frag.data)).await.unwrap();
        }
    }

    fn session_setup() -> (
        Arc<StreamTransport<tokio::io::DuplexStream>>,
        StreamTransport<tokio::io::DuplexStream>,
        CancellationToken,
    ) {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let (a, b) = tokio::io::duplex(65536);
        (
            Arc::new(StreamTransport::new(a)),
            StreamTransport::new(b),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn version_request_goes_out_first() {
        let (transport, peer, stop) = session_setup();
        let main = Arc::new(NullHeadUnit::default());
        let session = tokio::spawn(run_session(
            transport as Arc<dyn Transport>,
            crate::config::HeadUnitConfiguration::default(),
            main,
            stop.clone(),
        ));
        let f = read_frame(&peer).await;
        assert_eq!(f.header.channel_id, CONTROL_CHANNEL);
        let id = u16::from_be_bytes([f.payload[0], f.payload[1]]);
        assert_eq!(id, Wifi::ControlMessageId::VERSION_REQUEST as u16);
        assert_eq!(&f.payload[2..6], &[0, 1, 0, 1]);
        stop.cancel();
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn version_mismatch_quits_the_session() {
        let (transport, peer, stop) = session_setup();
        let main = Arc::new(NullHeadUnit::default());
        let session = tokio::spawn(run_session(
            transport as Arc<dyn Transport>,
            crate::config::HeadUnitConfiguration::default(),
            main,
            stop,
        ));
        let _version_request = read_frame(&peer).await;
        let mut data = (Wifi::ControlMessageId::VERSION_RESPONSE as u16)
            .to_be_bytes()
            .to_vec();
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0xFFFFu16.to_be_bytes());
        write_control(&peer, data).await;
        let r = session.await.unwrap();
        assert!(matches!(r, Err(LinkError::IncompatibleVersion(2, 0))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_phone_times_out_on_pings() {
        let (transport, peer, stop) = session_setup();
        let main = Arc::new(NullHeadUnit::default());
        let started = tokio::time::Instant::now();
        let session = tokio::spawn(run_session(
            transport as Arc<dyn Transport>,
            crate::config::HeadUnitConfiguration::default(),
            main,
            stop,
        ));
        let _version_request = read_frame(&peer).await;
        // a few ping requests go out unanswered
        let f = read_frame(&peer).await;
        let id = u16::from_be_bytes([f.payload[0], f.payload[1]]);
        assert_eq!(id, Wifi::ControlMessageId::PING_REQUEST as u16);
        let r = session.await.unwrap();
        assert!(matches!(r, Err(LinkError::PingTimeout)));
        assert!(started.elapsed() >= PING_DEADLINE);
    }

    #[tokio::test]
    async fn stop_token_ends_the_session_cleanly() {
        let (transport, peer, stop) = session_setup();
        let main = Arc::new(NullHeadUnit::default());
        let session = tokio::spawn(run_session(
            transport as Arc<dyn Transport>,
            crate::config::HeadUnitConfiguration::default(),
            main,
            stop.clone(),
        ));
        let _version_request = read_frame(&peer).await;
        stop.cancel();
        let r = session.await.unwrap();
        assert!(r.is_ok());
    }

    /// Act as the phone through version negotiation and the tls handshake,
    /// returning the phone-side tls machine once the head unit reports
    /// authentication complete.
    async fn phone_authenticate(
        peer: &StreamTransport<tokio::io::DuplexStream>,
    ) -> rustls::server::ServerConnection {
        let _version_request = read_frame(peer).await;
        let mut data = (Wifi::ControlMessageId::VERSION_RESPONSE as u16)
            .to_be_bytes()
            .to_vec();
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        write_control(peer, data).await;

        let mut server = crate::testutil::test_server();
        loop {
            let f = read_frame(peer).await;
            let id = u16::from_be_bytes([f.payload[0], f.payload[1]]);
            if id == Wifi::ControlMessageId::AUTH_COMPLETE as u16 {
                return server;
            }
            assert_eq!(id, Wifi::ControlMessageId::SSL_HANDSHAKE as u16);
            let _ = crate::testutil::phone_read(&mut server, &f.payload[2..]);
            if server.is_handshaking() && server.wants_write() {
                let mut blob = Vec::new();
                while server.wants_write() {
                    server.write_tls(&mut blob).unwrap();
                }
                let mut data = (Wifi::ControlMessageId::SSL_HANDSHAKE as u16)
                    .to_be_bytes()
                    .to_vec();
                data.append(&mut blob);
                write_control(peer, data).await;
            }
        }
    }

    #[tokio::test]
    async fn handshake_then_shutdown_is_clean() {
        let (transport, peer, stop) = session_setup();
        let main = Arc::new(NullHeadUnit::default());
        let session = tokio::spawn(run_session(
            transport as Arc<dyn Transport>,
            crate::config::HeadUnitConfiguration::default(),
            main,
            stop,
        ));
        let mut server = phone_authenticate(&peer).await;

        let mut m = Wifi::ShutdownRequest::new();
        m.set_reason(Wifi::shutdown_reason::Enum::QUIT);
        let mut data = (Wifi::ControlMessageId::SHUTDOWN_REQUEST as u16)
            .to_be_bytes()
            .to_vec();
        data.append(&mut m.write_to_bytes().unwrap());
        let sealed = crate::testutil::phone_write(&mut server, &data);
        let f = LinkFrame {
            header: FrameHeader {
                channel_id: CONTROL_CHANNEL,
                frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
            },
            data: sealed,
        };
        for frag in f.fragment() {
            peer.write(&frag.encode(&frag.data)).await.unwrap();
        }

        // the response comes back encrypted before the link goes down
        let resp = read_frame(&peer).await;
        assert!(resp.header.frame.get_encryption());
        let plain = crate::testutil::phone_read(&mut server, &resp.payload);
        let id = u16::from_be_bytes([plain[0], plain[1]]);
        assert_eq!(id, Wifi::ControlMessageId::SHUTDOWN_RESPONSE as u16);
        let r = session.await.unwrap();
        assert!(r.is_ok());
    }

    #[tokio::test]
    async fn service_discovery_lists_the_static_channels() {
        let (transport, peer, stop) = session_setup();
        let main = Arc::new(NullHeadUnit::default());
        let session = tokio::spawn(run_session(
            transport as Arc<dyn Transport>,
            crate::config::HeadUnitConfiguration::default(),
            main,
            stop.clone(),
        ));
        let mut server = phone_authenticate(&peer).await;

        let mut m = Wifi::ServiceDiscoveryRequest::new();
        m.set_device_name("Pixel".to_string());
        m.set_device_brand("Google".to_string());
        let mut data = (Wifi::ControlMessageId::SERVICE_DISCOVERY_REQUEST as u16)
            .to_be_bytes()
            .to_vec();
        data.append(&mut m.write_to_bytes().unwrap());
        let sealed = crate::testutil::phone_write(&mut server, &data);
        let f = LinkFrame {
            header: FrameHeader {
                channel_id: CONTROL_CHANNEL,
                frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
            },
            data: sealed,
        };
        for frag in f.fragment() {
            peer.write(&frag.encode(&frag.data)).await.unwrap();
        }

        let resp = read_frame(&peer).await;
        let plain = crate::testutil::phone_read(&mut server, &resp.payload);
        assert_eq!(
            u16::from_be_bytes([plain[0], plain[1]]),
            Wifi::ControlMessageId::SERVICE_DISCOVERY_RESPONSE as u16
        );
        let m = Wifi::ServiceDiscoveryResponse::parse_from_bytes(&plain[2..]).unwrap();
        // a head unit with no capabilities still announces the one-way
        // navigation and media status channels
        assert_eq!(m.channels.len(), 2);
        assert_eq!(m.head_unit_name(), "Headlink");
        stop.cancel();
        session.await.unwrap().unwrap();
    }
}
