//! This crate implements the head unit side of the android auto projection
//! protocol: the framed and encrypted channel-multiplexed link, the
//! per-service channel state machines, the session lifecycle, the device
//! wait loop over usb and tcp, and the bluetooth bootstrap used to start
//! wireless sessions. Platform concerns like video decode, audio output,
//! input hardware and the gui stay outside, behind the capability traits at
//! the bottom of this module.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]
#![cfg_attr(test, allow(clippy::missing_docs_in_private_items))]

#[cfg(feature = "wireless")]
use std::sync::Arc;

use audio::AudioChannelHandler;
use avinput::AvInputChannelHandler;
use bluetooth::BluetoothChannelHandler;
use control::ControlChannelHandler;
use input::InputChannelHandler;
use mediastatus::MediaStatusChannelHandler;
use navigation::NavigationChannelHandler;
use sensor::SensorChannelHandler;
use session::ChannelHandler;
use video::VideoChannelHandler;

mod cert;

pub mod app;
mod audio;
mod av;
mod avinput;
mod bluetooth;
#[cfg(feature = "wireless")]
pub mod btservice;
mod common;
pub mod config;
mod control;
mod cryptor;
mod frame;
mod input;
mod mediastatus;
mod messenger;
mod navigation;
mod pinger;
mod sensor;
pub mod session;
pub mod transport;
#[cfg(feature = "usb")]
pub mod usb;
mod video;

pub use protobuf;

#[allow(missing_docs)]
#[allow(clippy::missing_docs_in_private_items)]
mod protobufmod {
    include!(concat!(env!("OUT_DIR"), "/protobuf/mod.rs"));
}
pub use protobufmod::*;

/// The projection protocol version supported
const VERSION: (u16, u16) = (1, 1);

/// The channel identifier for channels on the projection link
pub type ChannelId = u8;

/// The channel carrying version, handshake, discovery, focus, ping and
/// shutdown traffic
pub const CONTROL_CHANNEL: ChannelId = 0;

/// Errors from the byte transports
#[derive(Debug)]
pub enum TransportError {
    /// The peer closed the connection
    Closed,
    /// The transport was stopped while the operation was in flight
    Aborted,
    /// An unexpected io error
    Io(std::io::Error),
}

/// Errors loading the embedded or configured keystore
#[derive(Debug)]
pub enum KeystoreError {
    /// The root certificate was invalid
    InvalidRootCert,
    /// The client certificate was invalid
    InvalidCertificate,
    /// The client private key was invalid
    InvalidPrivateKey,
    /// The tls configuration was rejected
    Setup(rustls::Error),
}

/// Errors from the handshake and record layer
#[derive(Debug)]
pub enum CryptorError {
    /// The peer broke the handshake
    HandshakeFailed(rustls::Error),
    /// An io error shuttling handshake bytes
    HandshakeIo(std::io::Error),
    /// A record failed to decrypt
    DecryptFailed(rustls::Error),
    /// An io error wrapping or unwrapping records
    RecordIo(std::io::Error),
}

/// Errors receiving frames from the wire
#[derive(Debug)]
pub enum FrameRxError {
    /// The transport failed
    Transport(TransportError),
    /// The record layer failed
    Cryptor(CryptorError),
    /// The peer violated the framing rules
    ProtocolViolation(String),
}

impl From<TransportError> for FrameRxError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

impl From<CryptorError> for FrameRxError {
    fn from(value: CryptorError) -> Self {
        Self::Cryptor(value)
    }
}

/// The error space of a projection session. Service channels survive
/// [LinkError::UnknownMessage], everything else ends the session.
#[derive(Debug)]
pub enum LinkError {
    /// An error receiving a frame
    Rx(FrameRxError),
    /// An error transmitting a frame
    Tx(TransportError),
    /// The record layer failed
    Cryptor(CryptorError),
    /// The keystore could not be loaded
    Keystore(KeystoreError),
    /// A rule of the protocol was broken
    ProtocolViolation(String),
    /// A message nobody understands arrived
    UnknownMessage {
        /// The channel the message arrived on
        channel: ChannelId,
        /// What the parser had to say about it
        detail: String,
    },
    /// The phone runs an incompatible protocol version
    IncompatibleVersion(u16, u16),
    /// The phone asked the session to shut down
    ShutdownRequested,
    /// The phone stopped answering pings
    PingTimeout,
    /// The request cannot be satisfied by this head unit
    Unsupported,
    /// The operation was cancelled by session teardown
    Aborted,
}

impl From<FrameRxError> for LinkError {
    fn from(value: FrameRxError) -> Self {
        Self::Rx(value)
    }
}

impl From<TransportError> for LinkError {
    fn from(value: TransportError) -> Self {
        Self::Tx(value)
    }
}

impl From<CryptorError> for LinkError {
    fn from(value: CryptorError) -> Self {
        Self::Cryptor(value)
    }
}

impl From<KeystoreError> for LinkError {
    fn from(value: KeystoreError) -> Self {
        Self::Keystore(value)
    }
}

/// The types of audio output channels
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum AudioChannelKind {
    /// Media audio, stereo 48 kHz
    Media,
    /// Speech audio, mono 16 kHz
    Speech,
    /// System audio, mono 16 kHz
    System,
}

impl AudioChannelKind {
    /// The wire audio type of the channel
    pub fn audio_type(self) -> Wifi::audio_type::Enum {
        match self {
            Self::Media => Wifi::audio_type::Enum::MEDIA,
            Self::Speech => Wifi::audio_type::Enum::SPEECH,
            Self::System => Wifi::audio_type::Enum::SYSTEM,
        }
    }

    /// The sample rate and channel count of the stream
    pub fn sample_format(self) -> (u32, u32) {
        match self {
            Self::Media => (48000, 2),
            Self::Speech => (16000, 1),
            Self::System => (16000, 1),
        }
    }
}

/// A touch action as reported by the input hardware
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TouchAction {
    /// The first finger landed
    Press,
    /// The last finger lifted
    Release,
    /// A finger moved
    Drag,
    /// An additional finger landed
    PointerDown,
    /// A finger lifted, others remain
    PointerUp,
}

/// A raw event from the input hardware, before translation
#[derive(Clone, Debug)]
pub enum InputEvent {
    /// A button changed state
    Button {
        /// The scan code of the button
        scan_code: u32,
        /// True when the button went down
        pressed: bool,
    },
    /// The scroll wheel turned
    Wheel {
        /// How far it turned, only the sign is relayed
        delta: i32,
    },
    /// A touch changed
    Touch {
        /// What kind of change
        action: TouchAction,
        /// The host pointer id, may be large and sparse
        pointer: u64,
        /// X in touchscreen coordinates
        x: u32,
        /// Y in touchscreen coordinates
        y: u32,
    },
}

/// A chunk of captured microphone audio
#[derive(Clone, Debug)]
pub struct MicrophoneFrame {
    /// Capture time in microseconds since the epoch
    pub timestamp: u64,
    /// Signed 16 bit mono samples at 16 kHz
    pub data: Vec<u8>,
}

/// One gps fix from the platform
#[derive(Clone, Debug)]
pub struct GpsFix {
    /// Fix time in milliseconds since the epoch
    pub timestamp: u64,
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Horizontal accuracy in meters
    pub accuracy: f64,
    /// Speed over ground in meters per second
    pub speed: Option<f64>,
    /// Course over ground in degrees
    pub bearing: Option<f64>,
}

/// The sensors a head unit may provide beyond the always-on set
#[derive(Clone, Copy, Debug, Default)]
pub struct SensorCatalog {
    /// Is a location source available?
    pub location: bool,
}

/// The kinds of sensors the crate can stream
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SensorKind {
    /// Driving restrictions, always reported as unrestricted
    DrivingStatus,
    /// Day and night transitions
    NightMode,
    /// Gps fixes
    Location,
}

/// The input capabilities of the head unit hardware
#[derive(Clone)]
pub struct InputProfile {
    /// The scan codes the hardware can produce
    pub keycodes: Vec<u32>,
    /// The touchscreen dimensions, if one is present
    pub touchscreen: Option<(u16, u16)>,
}

/// The wireless network information relayed during the bluetooth bootstrap
#[derive(Clone, Debug)]
pub struct NetworkInformation {
    /// The ssid of the wireless network
    pub ssid: String,
    /// The password for the wireless network
    pub psk: String,
    /// The mac address of the access point
    pub mac_addr: String,
    /// The ip address the projection listener is reachable on
    pub ip: String,
    /// The port the projection listener is bound to
    pub port: u16,
    /// The security mode for the wireless network
    pub security_mode: Bluetooth::SecurityMode,
    /// The access point type of the wireless network
    pub ap_type: Bluetooth::AccessPointType,
}

/// This trait is implemented by users wishing to display the video stream
#[async_trait::async_trait]
pub trait VideoSink: Send + Sync {
    /// The channel was opened by the phone
    async fn open(&self) -> Result<(), ()>;
    /// Prepare the decoder pipeline for the stream
    async fn init(&self) -> Result<(), ()>;
    /// Tear down the pipeline, may be called without init
    async fn teardown(&self);
    /// One compressed frame, timestamp in microseconds when present
    async fn frame(&self, timestamp: Option<u64>, data: Vec<u8>);
    /// The projection gained or lost the display
    async fn set_focus(&self, focused: bool);
    /// The stream parameters to advertise
    fn profile(&self) -> config::VideoSettings;
}

/// This trait is implemented by users that have audio output capabilities
#[async_trait::async_trait]
pub trait AudioSink: Send + Sync {
    /// Opens the specified channel
    async fn open_channel(&self, t: AudioChannelKind) -> Result<(), ()>;
    /// Closes the specified channel
    async fn close_channel(&self, t: AudioChannelKind);
    /// Receive a chunk of audio data for the specified channel
    async fn receive_audio(&self, t: AudioChannelKind, timestamp: Option<u64>, data: Vec<u8>);
    /// The specified audio channel will start
    async fn start_audio(&self, t: AudioChannelKind);
    /// The specified audio channel will stop
    async fn stop_audio(&self, t: AudioChannelKind);
}

/// This trait is implemented by users that can capture microphone audio
#[async_trait::async_trait]
pub trait AudioSource: Send + Sync {
    /// Start the capture hardware
    async fn open(&self) -> Result<(), ()>;
    /// Stop the capture hardware
    async fn close(&self);
    /// Deliver captured samples into the given queue from now on
    fn attach(&self, samples: tokio::sync::mpsc::Sender<MicrophoneFrame>);
    /// Stop delivering captured samples
    fn detach(&self);
}

/// This trait is implemented by users that have inputs for their head unit
#[async_trait::async_trait]
pub trait InputSource: Send + Sync {
    /// The input capabilities of the hardware
    fn profile(&self) -> InputProfile;
    /// A binding request for the specified scan code
    async fn binding_request(&self, code: u32) -> Result<(), ()>;
    /// Deliver raw input events into the given queue from now on
    fn attach(&self, events: tokio::sync::mpsc::Sender<InputEvent>);
    /// Stop delivering raw input events
    fn detach(&self);
}

/// This trait is implemented by users that provide sensors
#[async_trait::async_trait]
pub trait SensorSource: Send + Sync {
    /// Which optional sensors exist
    fn supported(&self) -> SensorCatalog;
    /// Watch day and night transitions
    fn night_mode(&self) -> tokio::sync::watch::Receiver<bool>;
    /// Watch location fixes, when the catalog says location exists
    fn location(&self) -> Option<tokio::sync::watch::Receiver<Option<GpsFix>>> {
        None
    }
    /// Start the indicated sensor
    async fn start(&self, sensor: SensorKind) -> Result<(), ()>;
}

/// This trait is implemented by users with a bluetooth adapter for the
/// in-session pairing channel
#[async_trait::async_trait]
pub trait BluetoothAdapter: Send + Sync {
    /// The mac address of the adapter
    fn address(&self) -> String;
    /// Is the given phone already paired with this adapter?
    async fn is_paired(&self, address: &str) -> bool;
}

/// Receives the phone-side media and navigation updates for the dashboard
/// or an ipc bridge
#[async_trait::async_trait]
pub trait DashboardListener: Send + Sync {
    /// Playback state changed
    async fn playback_update(&self, m: Wifi::MediaInfoChannelPlaybackData);
    /// Track metadata changed
    async fn metadata_update(&self, m: Wifi::MediaInfoChannelMetadataData);
    /// Navigation began or ended
    async fn navigation_status(&self, m: Wifi::NavigationStatus);
    /// An upcoming turn
    async fn turn_event(&self, m: Wifi::NavigationTurnEvent);
    /// Distance to the next turn
    async fn distance_event(&self, m: Wifi::NavigationDistanceEvent);
}

/// This trait is implemented by users that support wireless projection,
/// which needs both bluetooth and wifi
#[cfg(feature = "wireless")]
#[async_trait::async_trait]
pub trait WirelessPort: Send + Sync {
    /// Register the rfcomm profile for the bootstrap service
    async fn setup_bluetooth_profile(
        &self,
        suggestions: &bluetooth_rust::BluetoothRfcommProfileSettings,
    ) -> Result<bluetooth_rust::BluetoothRfcommProfile, String>;

    /// The wireless network the phone should join
    fn network_info(&self) -> NetworkInformation;
}

/// The base trait for crate users to implement. Every capability defaults
/// to absent, implementors opt in by overriding the matching method.
#[async_trait::async_trait]
pub trait HeadUnitTrait: Send + Sync {
    /// This allows the incoming video stream to be processed
    #[inline(always)]
    fn supports_video(&self) -> Option<&dyn VideoSink> {
        None
    }

    /// Implement this to support audio output
    #[inline(always)]
    fn supports_audio_output(&self) -> Option<&dyn AudioSink> {
        None
    }

    /// Implement this to support the microphone
    #[inline(always)]
    fn supports_audio_input(&self) -> Option<&dyn AudioSource> {
        None
    }

    /// Implement this to support input
    #[inline(always)]
    fn supports_input(&self) -> Option<&dyn InputSource> {
        None
    }

    /// Implement this to support sensors
    #[inline(always)]
    fn supports_sensors(&self) -> Option<&dyn SensorSource> {
        None
    }

    /// Implement this to indicate that bluetooth hardware is present
    #[inline(always)]
    fn supports_bluetooth(&self) -> Option<&dyn BluetoothAdapter> {
        None
    }

    /// Implement this to receive media and navigation updates
    #[inline(always)]
    fn supports_dashboard(&self) -> Option<&dyn DashboardListener> {
        None
    }

    /// Implement this to support wireless projection
    #[cfg(feature = "wireless")]
    #[inline(always)]
    fn supports_wireless(&self) -> Option<Arc<dyn WirelessPort>> {
        None
    }

    /// A phone connected
    async fn connect(&self) {}

    /// The phone disconnected
    async fn disconnect(&self) {}
}

/// The context handed to a channel handler with every message
pub(crate) struct ChannelContext<'a, T: HeadUnitTrait + ?Sized> {
    /// The messenger of the session
    pub messenger: &'a messenger::Messenger,
    /// The session configuration
    pub config: &'a config::HeadUnitConfiguration,
    /// The embedder
    pub main: &'a T,
    /// The session state
    pub state: &'a tokio::sync::watch::Sender<session::SessionState>,
    /// The liveness monitor
    pub pinger: &'a pinger::Pinger,
}

/// The trait that all channel handlers implement. The signatures are
/// written with absolute paths because the dispatch macro mirrors them at
/// the enum definition site.
#[enum_dispatch::enum_dispatch]
pub(crate) trait ChannelHandlerTrait {
    /// Handle one complete message addressed to this channel. Errors other
    /// than [LinkError::UnknownMessage] end the session.
    async fn receive_data<T: crate::HeadUnitTrait + ?Sized>(
        &self,
        msg: crate::frame::LinkFrame,
        ctx: &crate::ChannelContext<'_, T>,
    ) -> Result<(), crate::LinkError>;

    /// Construct the channel descriptor conveyed in service discovery, or
    /// None when the channel does not announce itself.
    fn build_channel<T: crate::HeadUnitTrait + ?Sized>(
        &self,
        config: &crate::config::HeadUnitConfiguration,
        chanid: crate::ChannelId,
        main: &T,
    ) -> Option<crate::Wifi::ChannelDescriptor>;

    /// Set the list of all channels. Only used by the control channel,
    /// which must exist before the others are described.
    fn set_channels(&self, _chans: Vec<crate::Wifi::ChannelDescriptor>) {}

    /// The session is shutting down, release sinks and sources.
    async fn stop_channel<T: crate::HeadUnitTrait + ?Sized>(&self, _main: &T) {}
}

/// Perform any setup required on startup of the library
pub fn setup() {
    let cp = rustls::crypto::ring::default_provider();
    cp.install_default().expect("Failed to set ssl provider");
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared scaffolding for the channel and session tests

    use crate::config::HeadUnitConfiguration;
    use crate::cryptor::Cryptor;
    use crate::frame::LinkFrame;
    use crate::messenger::Messenger;
    use crate::pinger::Pinger;
    use crate::session::SessionState;
    use crate::transport::StreamTransport;
    use crate::{ChannelContext, HeadUnitTrait, cert};
    use rustls::pki_types::{CertificateDer, pem::PemObject};
    use std::io::{Cursor, Read, Write};
    use std::sync::Arc;

    /// A head unit with no capabilities at all
    #[derive(Default)]
    pub struct NullHeadUnit {}

    #[async_trait::async_trait]
    impl HeadUnitTrait for NullHeadUnit {}

    /// A head unit that records dashboard updates as strings
    #[derive(Default)]
    pub struct DashboardHeadUnit {
        /// What arrived, in order
        pub events: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl crate::DashboardListener for DashboardHeadUnit {
        async fn playback_update(&self, m: crate::Wifi::MediaInfoChannelPlaybackData) {
            self.events
                .lock()
                .unwrap()
                .push(format!("playback {}", m.media_source()));
        }
        async fn metadata_update(&self, m: crate::Wifi::MediaInfoChannelMetadataData) {
            self.events
                .lock()
                .unwrap()
                .push(format!("metadata {}", m.track_name()));
        }
        async fn navigation_status(&self, m: crate::Wifi::NavigationStatus) {
            self.events
                .lock()
                .unwrap()
                .push(format!("navstatus {:?}", m.status()));
        }
        async fn turn_event(&self, m: crate::Wifi::NavigationTurnEvent) {
            self.events
                .lock()
                .unwrap()
                .push(format!("turn {}", m.street()));
        }
        async fn distance_event(&self, m: crate::Wifi::NavigationDistanceEvent) {
            self.events
                .lock()
                .unwrap()
                .push(format!("distance {}", m.distance()));
        }
    }

    #[async_trait::async_trait]
    impl HeadUnitTrait for DashboardHeadUnit {
        fn supports_dashboard(&self) -> Option<&dyn crate::DashboardListener> {
            Some(self)
        }
    }

    /// The tls server standing in for the mobile device
    pub fn test_server() -> rustls::server::ServerConnection {
        let cert = {
            let mut br = Cursor::new(cert::TEST_PEER_CERT.as_bytes());
            let pem = rustls::pki_types::pem::from_buf(&mut br).unwrap().unwrap();
            CertificateDer::from_pem(pem.0, pem.1).unwrap()
        };
        let key = {
            let mut br = Cursor::new(cert::TEST_PEER_KEY.as_bytes());
            let pem = rustls::pki_types::pem::from_buf(&mut br).unwrap().unwrap();
            rustls::pki_types::PrivateKeyDer::from_pem(pem.0, pem.1).unwrap()
        };
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
        rustls::ServerConnection::new(Arc::new(config)).unwrap()
    }

    /// Feed bytes from the head unit into the phone-side tls machine
    pub fn phone_read(server: &mut rustls::server::ServerConnection, data: &[u8]) -> Vec<u8> {
        let mut c = Cursor::new(data);
        while server.read_tls(&mut c).unwrap() != 0 {
            server.process_new_packets().unwrap();
        }
        let mut plain = vec![0u8; data.len()];
        let mut index = 0;
        while let Ok(n) = server.reader().read(&mut plain[index..]) {
            if n == 0 {
                break;
            }
            index += n;
        }
        plain.truncate(index);
        plain
    }

    /// Wrap bytes for the head unit with the phone-side tls machine
    pub fn phone_write(server: &mut rustls::server::ServerConnection, data: &[u8]) -> Vec<u8> {
        server.writer().write_all(data).unwrap();
        let mut out = Vec::new();
        while server.wants_write() {
            server.write_tls(&mut out).unwrap();
        }
        out
    }

    /// The scaffolding one channel test runs against: a messenger over an
    /// in-memory pipe with its writer task running, the peer end of the
    /// pipe, and the session services the handlers expect.
    pub struct Harness {
        /// The messenger under test
        pub messenger: Arc<Messenger>,
        /// The far end of the pipe
        pub peer: Arc<StreamTransport<tokio::io::DuplexStream>>,
        /// The session state observed by handlers
        pub state: tokio::sync::watch::Sender<SessionState>,
        /// The liveness monitor observed by handlers
        pub pinger: Pinger,
        /// The session configuration
        pub config: HeadUnitConfiguration,
        /// The phone-side tls machine once authenticate ran
        server: tokio::sync::Mutex<Option<rustls::server::ServerConnection>>,
    }

    /// Build a harness. The link starts unauthenticated, tests that need
    /// encrypted traffic call [Harness::authenticate] first.
    pub async fn harness() -> Harness {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let (a, b) = tokio::io::duplex(1 << 20);
        let transport = Arc::new(StreamTransport::new(a));
        let messenger = Arc::new(Messenger::new(transport, Cryptor::new(None).unwrap()));
        {
            let m = messenger.clone();
            tokio::spawn(async move { m.run_writer().await });
        }
        let (state, _) = tokio::sync::watch::channel(SessionState::Idle);
        Harness {
            messenger,
            peer: Arc::new(StreamTransport::new(b)),
            state,
            pinger: Pinger::new(
                std::time::Duration::from_secs(3),
                std::time::Duration::from_secs(15),
            ),
            config: HeadUnitConfiguration::default(),
            server: tokio::sync::Mutex::new(None),
        }
    }

    impl Harness {
        /// Borrow the harness as the context handlers expect
        pub fn ctx<'a, T: HeadUnitTrait + ?Sized>(&'a self, main: &'a T) -> ChannelContext<'a, T> {
            ChannelContext {
                messenger: &self.messenger,
                config: &self.config,
                main,
                state: &self.state,
                pinger: &self.pinger,
            }
        }

        /// Run the real handshake against an in-memory phone and open the
        /// encryption gate.
        pub async fn authenticate(&self) {
            let mut server = test_server();
            let mut inbound: Option<Vec<u8>> = None;
            for _ in 0..10 {
                if let Some(out) = self
                    .messenger
                    .handshake_step(inbound.take().as_deref())
                    .unwrap()
                {
                    let _ = phone_read(&mut server, &out);
                }
                if server.wants_write() {
                    let mut blob = Vec::new();
                    while server.wants_write() {
                        server.write_tls(&mut blob).unwrap();
                    }
                    inbound = Some(blob);
                }
                if !self.messenger.is_handshaking() {
                    if let Some(blob) = inbound.take() {
                        // post-handshake bookkeeping records
                        let _ = self.messenger.handshake_step(Some(&blob));
                    }
                    self.messenger.set_auth_complete();
                    *self.server.lock().await = Some(server);
                    return;
                }
            }
            panic!("handshake did not converge");
        }

        /// Read the next message the handlers sent, decrypting when needed
        pub async fn next_sent(&self) -> LinkFrame {
            let wire = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                crate::frame::read_frame(self.peer.as_ref()),
            )
            .await
            .expect("no frame arrived")
            .unwrap();
            let data = if wire.header.frame.get_encryption() {
                let mut server = self.server.lock().await;
                let server = server.as_mut().expect("encrypted frame before authenticate");
                phone_read(server, &wire.payload)
            } else {
                wire.payload
            };
            LinkFrame {
                header: wire.header,
                data,
            }
        }

        /// True when nothing got sent within a short grace period
        pub async fn no_traffic(&self) -> bool {
            tokio::time::timeout(
                std::time::Duration::from_millis(50),
                crate::frame::read_frame(self.peer.as_ref()),
            )
            .await
            .is_err()
        }
    }
}
