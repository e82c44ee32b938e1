//! The rfcomm bootstrap service that starts wireless projection: it hands
//! the phone the projection socket and the wifi credentials over bluetooth,
//! then the phone connects over tcp.

use crate::{Bluetooth, NetworkInformation, WirelessPort};
use futures::{SinkExt, StreamExt};
use protobuf::{Enum, Message};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// The state of one bootstrap conversation. Transitions happen only on io
/// events.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BootstrapState {
    /// Waiting for a phone
    Idle,
    /// A phone connected
    DeviceConnected,
    /// The socket information request went out
    SentSocketInfo,
    /// The phone acknowledged the socket information
    PhoneAckedSocketInfo,
    /// The network credentials went out
    SentNetworkInfo,
    /// The phone acknowledged the credentials, the bootstrap is complete
    PhoneAckedNetworkInfo,
    /// The conversation failed
    Error,
}

/// Errors from a bootstrap conversation
#[derive(Debug)]
pub enum BootstrapError {
    /// The stream failed
    Io(std::io::Error),
    /// The phone hung up mid-conversation
    ClosedEarly(BootstrapState),
    /// The phone reported a failure status
    Refused(Bluetooth::Status),
}

/// A message received on the bootstrap channel, type still raw
#[derive(Debug)]
pub struct RawBootstrapMessage {
    /// The message type
    pub t: u16,
    /// The protobuf bytes of the message
    pub message: Vec<u8>,
}

/// A message the head unit sends on the bootstrap channel
pub enum BootstrapMessage {
    /// A request for the phone to connect to the given socket
    SocketInfoRequest(Bluetooth::SocketInfoRequest),
    /// The wifi credentials
    NetworkInfo(Bluetooth::NetworkInfo),
}

impl BootstrapMessage {
    /// The wire type and serialized bytes of the message
    fn as_raw(&self) -> RawBootstrapMessage {
        match self {
            BootstrapMessage::SocketInfoRequest(m) => RawBootstrapMessage {
                t: Bluetooth::MessageId::BLUETOOTH_SOCKET_INFO_REQUEST as u16,
                message: m.write_to_bytes().unwrap(),
            },
            BootstrapMessage::NetworkInfo(m) => RawBootstrapMessage {
                t: Bluetooth::MessageId::BLUETOOTH_NETWORK_INFO_MESSAGE as u16,
                message: m.write_to_bytes().unwrap(),
            },
        }
    }
}

/// The framing on the bootstrap channel: a big endian length, a big endian
/// type, then the message bytes.
pub struct BootstrapCodec;

impl Decoder for BootstrapCodec {
    type Item = RawBootstrapMessage;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        let t = u16::from_be_bytes([src[2], src[3]]);
        src.advance(4);
        let message = src.split_to(len).to_vec();
        Ok(Some(RawBootstrapMessage { t, message }))
    }
}

impl Encoder<BootstrapMessage> for BootstrapCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: BootstrapMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let raw = item.as_raw();
        dst.reserve(raw.message.len() + 4);
        dst.put_u16(raw.message.len() as u16);
        dst.put_u16(raw.t);
        dst.put_slice(&raw.message);
        Ok(())
    }
}

/// Drive one bootstrap conversation to completion. Returns the peer address
/// to remember for auto reconnect when the conversation completed and the
/// transport knows who called.
pub async fn handle_bootstrap_client<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    network: &NetworkInformation,
    peer_address: Option<&str>,
) -> Result<Option<String>, BootstrapError> {
    let mut framed = Framed::new(stream, BootstrapCodec);
    let mut state = BootstrapState::DeviceConnected;
    log::info!("Bootstrap client connected");

    let mut m = Bluetooth::SocketInfoRequest::new();
    m.set_ip_address(network.ip.clone());
    m.set_port(network.port as u32);
    framed
        .send(BootstrapMessage::SocketInfoRequest(m))
        .await
        .map_err(BootstrapError::Io)?;
    state = BootstrapState::SentSocketInfo;

    while let Some(raw) = framed.next().await {
        let raw = raw.map_err(BootstrapError::Io)?;
        match Bluetooth::MessageId::from_i32(raw.t as i32) {
            Some(
                Bluetooth::MessageId::BLUETOOTH_SOCKET_INFO_RESPONSE
                | Bluetooth::MessageId::BLUETOOTH_SOCKET_INFO_ACK,
            ) if state == BootstrapState::SentSocketInfo => {
                if let Ok(m) = Bluetooth::SocketInfoResponse::parse_from_bytes(&raw.message) {
                    log::debug!("Socket info response: {:?}", m);
                }
                state = BootstrapState::PhoneAckedSocketInfo;
                let mut m = Bluetooth::NetworkInfo::new();
                m.set_ssid(network.ssid.clone());
                m.set_psk(network.psk.clone());
                m.set_mac_addr(network.mac_addr.clone());
                m.set_security_mode(network.security_mode);
                m.set_ap_type(network.ap_type);
                framed
                    .send(BootstrapMessage::NetworkInfo(m))
                    .await
                    .map_err(BootstrapError::Io)?;
                state = BootstrapState::SentNetworkInfo;
            }
            Some(Bluetooth::MessageId::BLUETOOTH_NETWORK_ACK)
                if state == BootstrapState::SentNetworkInfo =>
            {
                let status = Bluetooth::NetworkAck::parse_from_bytes(&raw.message)
                    .map(|m| m.status())
                    .unwrap_or(Bluetooth::Status::STATUS_SUCCESS);
                if status != Bluetooth::Status::STATUS_SUCCESS {
                    log::error!("Phone refused the network credentials: {:?}", status);
                    return Err(BootstrapError::Refused(status));
                }
                log::info!("Bootstrap complete, the phone is joining the network");
                return Ok(peer_address.map(|a| a.to_string()));
            }
            _ => {
                log::warn!("Ignoring bootstrap message type {} in {:?}", raw.t, state);
            }
        }
    }
    Err(BootstrapError::ClosedEarly(state))
}

/// The rfcomm profile settings for the wireless projection service, which
/// listens on channel 22.
pub fn profile_settings() -> bluetooth_rust::BluetoothRfcommProfileSettings {
    bluetooth_rust::BluetoothRfcommProfileSettings {
        uuid: bluetooth_rust::BluetoothUuid::AndroidAuto.as_str().to_string(),
        name: Some("Android Auto Bluetooth Service".to_string()),
        service_uuid: Some(bluetooth_rust::BluetoothUuid::AndroidAuto.as_str().to_string()),
        channel: Some(22),
        psm: None,
        authenticate: Some(true),
        authorize: Some(true),
        auto_connect: Some(true),
        sdp_record: None,
        sdp_version: None,
        sdp_features: None,
    }
}

/// Run the bootstrap service against a registered rfcomm profile. Completed
/// conversations report the peer address on `paired` so the owner can
/// persist it for auto reconnect.
pub async fn bootstrap_service(
    mut profile: bluetooth_rust::BluetoothRfcommProfile,
    wireless: Arc<dyn WirelessPort>,
    paired: mpsc::Sender<String>,
) -> Result<(), String> {
    use bluetooth_rust::{BluetoothRfcommConnectableTrait, BluetoothRfcommProfileTrait};
    log::info!("Starting the bluetooth bootstrap service");
    loop {
        if let Ok(c) = profile.connectable().await {
            let network = wireless.network_info();
            match c.accept().await {
                Ok(mut stream) => {
                    match handle_bootstrap_client(&mut stream, &network, None).await {
                        Ok(Some(addr)) => {
                            let _ = paired.send(addr).await;
                        }
                        Ok(None) => {}
                        Err(e) => log::info!("Bootstrap client failed: {:?}", e),
                    }
                }
                Err(e) => log::error!("Failed to accept bootstrap client: {}", e),
            }
        }
    }
}
