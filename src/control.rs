//! Code for the control channel

use super::VERSION;
use crate::frame::{FrameHeader, FrameHeaderContents, FrameHeaderType, LinkFrame};
use crate::common::message_bytes;
use crate::session::SessionState;
use crate::{
    ChannelContext, ChannelHandlerTrait, HeadUnitTrait, LinkError, Wifi, CONTROL_CHANNEL,
};
use protobuf::{Enum, Message};

/// A message on the control channel
#[derive(Debug)]
pub enum ControlMessage {
    /// A message requesting version information.
    VersionRequest,
    /// A message containing the phone version and compatibility status
    VersionResponse {
        /// The major version
        major: u16,
        /// The minor version
        minor: u16,
        /// The status of the version compatibility, 0xffff indicates incompatibility
        status: u16,
    },
    /// A message containing ssl handshake data
    SslHandshake(Vec<u8>),
    /// A message indicating that the ssl authentication is complete
    SslAuthComplete(bool),
    /// A request to discover all channels in operation on the head unit
    ServiceDiscoveryRequest(Wifi::ServiceDiscoveryRequest),
    /// A response to the service discovery request
    ServiceDiscoveryResponse(Wifi::ServiceDiscoveryResponse),
    /// A request to set the audio focus
    AudioFocusRequest(Wifi::AudioFocusRequest),
    /// A response to an audio focus request
    AudioFocusResponse(Wifi::AudioFocusResponse),
    /// A request for navigation focus
    NavigationFocusRequest(Wifi::NavigationFocusRequest),
    /// A response to a navigation focus request
    NavigationFocusResponse(Wifi::NavigationFocusResponse),
    /// A voice session start or stop notification
    VoiceSessionRequest(Wifi::VoiceSessionRequest),
    /// A request for ping
    PingRequest(Wifi::PingRequest),
    /// A response to a ping request
    PingResponse(Wifi::PingResponse),
    /// A shutdown request
    ShutdownRequest(Wifi::ShutdownRequest),
    /// A shutdown response
    ShutdownResponse,
}

impl TryFrom<&LinkFrame> for ControlMessage {
    type Error = String;
    fn try_from(value: &LinkFrame) -> Result<Self, Self::Error> {
        let ty = crate::common::message_id(value);
        if !value.header.frame.get_control() {
            let w = Wifi::ControlMessageId::from_i32(ty as i32);
            if let Some(m) = w {
                match m {
                    Wifi::ControlMessageId::VERSION_REQUEST => unimplemented!(),
                    Wifi::ControlMessageId::AUTH_COMPLETE => unimplemented!(),
                    Wifi::ControlMessageId::MESSAGE_NONE => unimplemented!(),
                    Wifi::ControlMessageId::SERVICE_DISCOVERY_RESPONSE => unimplemented!(),
                    Wifi::ControlMessageId::PING_REQUEST => {
                        let m = Wifi::PingRequest::parse_from_bytes(&value.data[2..]);
                        match m {
                            Ok(m) => Ok(ControlMessage::PingRequest(m)),
                            Err(e) => Err(format!("Invalid ping request: {}", e)),
                        }
                    }
                    Wifi::ControlMessageId::NAVIGATION_FOCUS_REQUEST => {
                        let m = Wifi::NavigationFocusRequest::parse_from_bytes(&value.data[2..]);
                        match m {
                            Ok(m) => Ok(ControlMessage::NavigationFocusRequest(m)),
                            Err(e) => Err(format!("Invalid navigation focus request: {}", e)),
                        }
                    }
                    Wifi::ControlMessageId::NAVIGATION_FOCUS_RESPONSE => unimplemented!(),
                    Wifi::ControlMessageId::SHUTDOWN_REQUEST => {
                        let m = Wifi::ShutdownRequest::parse_from_bytes(&value.data[2..]);
                        match m {
                            Ok(m) => Ok(ControlMessage::ShutdownRequest(m)),
                            Err(e) => Err(format!("Invalid shutdown request: {}", e)),
                        }
                    }
                    Wifi::ControlMessageId::SHUTDOWN_RESPONSE => Ok(ControlMessage::ShutdownResponse),
                    Wifi::ControlMessageId::VOICE_SESSION_REQUEST => {
                        let m = Wifi::VoiceSessionRequest::parse_from_bytes(&value.data[2..]);
                        match m {
                            Ok(m) => Ok(ControlMessage::VoiceSessionRequest(m)),
                            Err(e) => Err(format!("Invalid voice session request: {}", e)),
                        }
                    }
                    Wifi::ControlMessageId::AUDIO_FOCUS_RESPONSE => unimplemented!(),
                    Wifi::ControlMessageId::PING_RESPONSE => {
                        let m = Wifi::PingResponse::parse_from_bytes(&value.data[2..]);
                        match m {
                            Ok(m) => Ok(ControlMessage::PingResponse(m)),
                            Err(e) => Err(format!("Invalid ping response: {}", e)),
                        }
                    }
                    Wifi::ControlMessageId::AUDIO_FOCUS_REQUEST => {
                        let m = Wifi::AudioFocusRequest::parse_from_bytes(&value.data[2..]);
                        match m {
                            Ok(m) => Ok(ControlMessage::AudioFocusRequest(m)),
                            Err(e) => Err(format!("Invalid audio focus request: {}", e)),
                        }
                    }
                    Wifi::ControlMessageId::VERSION_RESPONSE => {
                        if value.data.len() == 8 {
                            let major = u16::from_be_bytes([value.data[2], value.data[3]]);
                            let minor = u16::from_be_bytes([value.data[4], value.data[5]]);
                            let status = u16::from_be_bytes([value.data[6], value.data[7]]);
                            Ok(ControlMessage::VersionResponse {
                                major,
                                minor,
                                status,
                            })
                        } else {
                            Err("Invalid version response packet".to_string())
                        }
                    }
                    Wifi::ControlMessageId::SSL_HANDSHAKE => {
                        Ok(ControlMessage::SslHandshake(value.data[2..].to_vec()))
                    }
                    Wifi::ControlMessageId::SERVICE_DISCOVERY_REQUEST => {
                        let m = Wifi::ServiceDiscoveryRequest::parse_from_bytes(&value.data[2..]);
                        match m {
                            Ok(m) => Ok(ControlMessage::ServiceDiscoveryRequest(m)),
                            Err(e) => Err(format!("Invalid service discovery request: {}", e)),
                        }
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

/// Build a plaintext control frame
fn control_frame(data: Vec<u8>) -> LinkFrame {
    LinkFrame {
        header: FrameHeader {
            channel_id: CONTROL_CHANNEL,
            frame: FrameHeaderContents::new(false, FrameHeaderType::Single, false),
        },
        data,
    }
}

/// Build an encrypted control frame
fn sealed_control_frame(data: Vec<u8>) -> LinkFrame {
    LinkFrame {
        header: FrameHeader {
            channel_id: CONTROL_CHANNEL,
            frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
        },
        data,
    }
}

impl From<ControlMessage> for LinkFrame {
    fn from(value: ControlMessage) -> Self {
        match value {
            ControlMessage::ShutdownRequest(_) => unimplemented!(),
            ControlMessage::ShutdownResponse => {
                let m = Wifi::ShutdownResponse::new();
                sealed_control_frame(message_bytes(
                    Wifi::ControlMessageId::SHUTDOWN_RESPONSE as u16,
                    m.write_to_bytes().unwrap(),
                ))
            }
            ControlMessage::PingResponse(m) => control_frame(message_bytes(
                Wifi::ControlMessageId::PING_RESPONSE as u16,
                m.write_to_bytes().unwrap(),
            )),
            ControlMessage::PingRequest(m) => control_frame(message_bytes(
                Wifi::ControlMessageId::PING_REQUEST as u16,
                m.write_to_bytes().unwrap(),
            )),
            ControlMessage::AudioFocusResponse(m) => sealed_control_frame(message_bytes(
                Wifi::ControlMessageId::AUDIO_FOCUS_RESPONSE as u16,
                m.write_to_bytes().unwrap(),
            )),
            ControlMessage::AudioFocusRequest(_) => unimplemented!(),
            ControlMessage::NavigationFocusResponse(m) => sealed_control_frame(message_bytes(
                Wifi::ControlMessageId::NAVIGATION_FOCUS_RESPONSE as u16,
                m.write_to_bytes().unwrap(),
            )),
            ControlMessage::NavigationFocusRequest(_) => unimplemented!(),
            ControlMessage::VoiceSessionRequest(_) => unimplemented!(),
            ControlMessage::ServiceDiscoveryResponse(m) => sealed_control_frame(message_bytes(
                Wifi::ControlMessageId::SERVICE_DISCOVERY_RESPONSE as u16,
                m.write_to_bytes().unwrap(),
            )),
            ControlMessage::ServiceDiscoveryRequest(_) => unimplemented!(),
            ControlMessage::VersionRequest => {
                let mut m = Vec::with_capacity(6);
                m.extend_from_slice(&(Wifi::ControlMessageId::VERSION_REQUEST as u16).to_be_bytes());
                m.extend_from_slice(&VERSION.0.to_be_bytes());
                m.extend_from_slice(&VERSION.1.to_be_bytes());
                control_frame(m)
            }
            ControlMessage::SslHandshake(data) => control_frame(message_bytes(
                Wifi::ControlMessageId::SSL_HANDSHAKE as u16,
                data,
            )),
            ControlMessage::SslAuthComplete(status) => {
                let mut m = Wifi::AuthCompleteIndication::new();
                let status = if status {
                    Wifi::AuthCompleteIndicationStatus::OK
                } else {
                    Wifi::AuthCompleteIndicationStatus::FAIL
                };
                m.set_status(status);
                control_frame(message_bytes(
                    Wifi::ControlMessageId::AUTH_COMPLETE as u16,
                    m.write_to_bytes().unwrap(),
                ))
            }
            ControlMessage::VersionResponse { .. } => unimplemented!(),
        }
    }
}

/// The inner data for the control channel handler
struct InnerChannelHandler {
    /// The list of all channels for the head unit, filled out once every
    /// channel has contributed its descriptor
    channels: Vec<Wifi::ChannelDescriptor>,
}

/// Handles the control channel of the projection link
pub struct ControlChannelHandler {
    /// The inner protected data
    inner: std::sync::Mutex<InnerChannelHandler>,
}

impl ControlChannelHandler {
    /// Construct a new self
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(InnerChannelHandler {
                channels: Vec::new(),
            }),
        }
    }

    /// Map a focus request onto the state the head unit grants
    fn focus_state(m: &Wifi::AudioFocusRequest) -> Wifi::audio_focus_state::Enum {
        if m.has_audio_focus_type() {
            match m.audio_focus_type() {
                Wifi::audio_focus_type::Enum::NONE => Wifi::audio_focus_state::Enum::NONE,
                Wifi::audio_focus_type::Enum::GAIN => Wifi::audio_focus_state::Enum::GAIN,
                Wifi::audio_focus_type::Enum::GAIN_TRANSIENT => {
                    Wifi::audio_focus_state::Enum::GAIN_TRANSIENT
                }
                Wifi::audio_focus_type::Enum::GAIN_NAVI => Wifi::audio_focus_state::Enum::GAIN,
                Wifi::audio_focus_type::Enum::RELEASE => Wifi::audio_focus_state::Enum::LOSS,
            }
        } else {
            Wifi::audio_focus_state::Enum::NONE
        }
    }
}

impl ChannelHandlerTrait for ControlChannelHandler {
    fn set_channels(&self, chans: Vec<Wifi::ChannelDescriptor>) {
        let mut inner = self.inner.lock().unwrap();
        inner.channels = chans;
    }

    fn build_channel<T: HeadUnitTrait + ?Sized>(
        &self,
        _config: &crate::config::HeadUnitConfiguration,
        _chanid: crate::ChannelId,
        _main: &T,
    ) -> Option<Wifi::ChannelDescriptor> {
        None
    }

    async fn receive_data<T: HeadUnitTrait + ?Sized>(
        &self,
        msg: LinkFrame,
        ctx: &ChannelContext<'_, T>,
    ) -> Result<(), LinkError> {
        let msg2: ControlMessage = (&msg)
            .try_into()
            .map_err(|e: String| LinkError::UnknownMessage {
                channel: CONTROL_CHANNEL,
                detail: e,
            })?;
        match msg2 {
            ControlMessage::ShutdownResponse => {}
            ControlMessage::ShutdownRequest(m) => {
                log::info!("Shutdown requested by the phone: {:?}", m.reason());
                ctx.messenger
                    .send(ControlMessage::ShutdownResponse.into())?
                    .wait()
                    .await?;
                return Err(LinkError::ShutdownRequested);
            }
            ControlMessage::PingResponse(_) => {
                ctx.pinger.pong();
            }
            ControlMessage::PingRequest(a) => {
                let mut m = Wifi::PingResponse::new();
                m.set_timestamp(a.timestamp());
                ctx.messenger
                    .send(ControlMessage::PingResponse(m).into())?
                    .wait()
                    .await?;
            }
            ControlMessage::AudioFocusResponse(_) => {
                return Err(LinkError::ProtocolViolation(
                    "audio focus response from the phone".to_string(),
                ));
            }
            ControlMessage::AudioFocusRequest(m) => {
                let mut m2 = Wifi::AudioFocusResponse::new();
                m2.set_audio_focus_state(Self::focus_state(&m));
                ctx.messenger
                    .send(ControlMessage::AudioFocusResponse(m2).into())?
                    .wait()
                    .await?;
            }
            ControlMessage::NavigationFocusResponse(_) => {
                return Err(LinkError::ProtocolViolation(
                    "navigation focus response from the phone".to_string(),
                ));
            }
            ControlMessage::NavigationFocusRequest(_m) => {
                let mut m2 = Wifi::NavigationFocusResponse::new();
                m2.set_focus_type(2);
                ctx.messenger
                    .send(ControlMessage::NavigationFocusResponse(m2).into())?
                    .wait()
                    .await?;
            }
            ControlMessage::VoiceSessionRequest(m) => {
                // consumed without a response
                log::debug!("Voice session request: {:?}", m.session_type());
            }
            ControlMessage::ServiceDiscoveryResponse(_) => {
                return Err(LinkError::ProtocolViolation(
                    "service discovery response from the phone".to_string(),
                ));
            }
            ControlMessage::ServiceDiscoveryRequest(m) => {
                log::info!(
                    "Service discovery from {} {}",
                    m.device_brand(),
                    m.device_name()
                );
                let unit = &ctx.config.settings.unit;
                let mut m2 = Wifi::ServiceDiscoveryResponse::new();
                m2.set_head_unit_name(unit.name.clone());
                m2.set_car_model(unit.car_model.clone());
                m2.set_car_year(unit.car_year.clone());
                m2.set_car_serial(unit.car_serial.clone());
                m2.set_left_hand_drive_vehicle(unit.left_hand);
                m2.set_headunit_manufacturer(unit.head_manufacturer.clone());
                m2.set_headunit_model(unit.head_model.clone());
                m2.set_sw_build(unit.sw_build.clone());
                m2.set_sw_version(unit.sw_version.clone());
                m2.set_can_play_native_media_during_vr(unit.native_media);
                if let Some(hide) = unit.hide_clock {
                    m2.set_hide_clock(hide);
                }
                {
                    let inner = self.inner.lock().unwrap();
                    for s in &inner.channels {
                        m2.channels.push(s.clone());
                    }
                }
                ctx.messenger
                    .send(ControlMessage::ServiceDiscoveryResponse(m2).into())?
                    .wait()
                    .await?;
                ctx.state.send_replace(SessionState::Discovered);
            }
            ControlMessage::SslAuthComplete(_) => {
                return Err(LinkError::ProtocolViolation(
                    "auth complete from the phone".to_string(),
                ));
            }
            ControlMessage::SslHandshake(data) => {
                if ctx.messenger.auth_complete() {
                    // stray post-handshake records, consume without a reply
                    ctx.messenger.handshake_step(Some(&data))?;
                    return Ok(());
                }
                let out = ctx.messenger.handshake_step(Some(&data))?;
                if let Some(out) = out {
                    ctx.messenger
                        .send(ControlMessage::SslHandshake(out).into())?
                        .wait()
                        .await?;
                }
                if !ctx.messenger.is_handshaking() {
                    ctx.messenger.set_auth_complete();
                    ctx.state.send_replace(SessionState::AuthComplete);
                    ctx.messenger
                        .send(ControlMessage::SslAuthComplete(true).into())?
                        .wait()
                        .await?;
                }
            }
            ControlMessage::VersionRequest => {
                return Err(LinkError::ProtocolViolation(
                    "version request from the phone".to_string(),
                ));
            }
            ControlMessage::VersionResponse {
                major,
                minor,
                status,
            } => {
                if status == 0xFFFF {
                    log::error!("Version mismatch: phone is {}.{}", major, minor);
                    return Err(LinkError::IncompatibleVersion(major, minor));
                }
                log::info!("Phone version: {}.{}", major, minor);
                ctx.state.send_replace(SessionState::HandshakeInProgress);
                if let Some(out) = ctx.messenger.handshake_step(None)? {
                    ctx.messenger
                        .send(ControlMessage::SslHandshake(out).into())?
                        .wait()
                        .await?;
                }
            }
        }
        Ok(())
    }
}
