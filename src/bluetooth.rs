//! Contains bluetooth channel code

use crate::common::{CommonMessage, message_bytes, open_response};
use crate::frame::{FrameHeader, FrameHeaderContents, FrameHeaderType, LinkFrame};
use crate::{ChannelContext, ChannelHandlerTrait, ChannelId, HeadUnitTrait, LinkError, Wifi};
use protobuf::{EnumOrUnknown, Message};

/// A message about bluetooth pairing
#[derive(Debug)]
pub enum BluetoothMessage {
    /// A request to pair with a specified bluetooth device
    PairingRequest(ChannelId, Wifi::BluetoothPairingRequest),
    /// A response to a pairing request
    PairingResponse(ChannelId, Wifi::BluetoothPairingResponse),
}

impl From<BluetoothMessage> for LinkFrame {
    fn from(value: BluetoothMessage) -> Self {
        match value {
            BluetoothMessage::PairingRequest(_, _) => unimplemented!(),
            BluetoothMessage::PairingResponse(chan, m) => LinkFrame {
                header: FrameHeader {
                    channel_id: chan,
                    frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
                },
                data: message_bytes(
                    Wifi::bluetooth_channel_message::Enum::PAIRING_RESPONSE as u16,
                    m.write_to_bytes().unwrap(),
                ),
            },
        }
    }
}

impl TryFrom<&LinkFrame> for BluetoothMessage {
    type Error = String;
    fn try_from(value: &LinkFrame) -> Result<Self, Self::Error> {
        use protobuf::Enum;
        let ty = crate::common::message_id(value);
        if let Some(sys) = Wifi::bluetooth_channel_message::Enum::from_i32(ty as i32) {
            match sys {
                Wifi::bluetooth_channel_message::Enum::PAIRING_REQUEST => {
                    let m = Wifi::BluetoothPairingRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::PairingRequest(value.header.channel_id, m)),
                        Err(e) => Err(e.to_string()),
                    }
                }
                Wifi::bluetooth_channel_message::Enum::PAIRING_RESPONSE => unimplemented!(),
                Wifi::bluetooth_channel_message::Enum::AUTH_DATA => {
                    Err("Unhandled bluetooth auth data".to_string())
                }
                Wifi::bluetooth_channel_message::Enum::NONE => {
                    Err("Empty bluetooth message".to_string())
                }
            }
        } else {
            Err(format!("Not converted message: {:x?}", value.data))
        }
    }
}

/// The handler for the in-session bluetooth channel. This is separate from
/// the rfcomm bootstrap service that starts wireless sessions.
pub struct BluetoothChannelHandler {}

impl ChannelHandlerTrait for BluetoothChannelHandler {
    fn build_channel<T: HeadUnitTrait + ?Sized>(
        &self,
        _config: &crate::config::HeadUnitConfiguration,
        chanid: ChannelId,
        main: &T,
    ) -> Option<Wifi::ChannelDescriptor> {
        let adapter = main.supports_bluetooth()?;
        let mut chan = Wifi::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mut bchan = Wifi::BluetoothChannel::new();
        bchan.set_adapter_address(adapter.address());
        let meth = Wifi::bluetooth_pairing_method::Enum::HFP;
        bchan
            .supported_pairing_methods
            .push(EnumOrUnknown::new(meth));
        chan.bluetooth_channel.0.replace(Box::new(bchan));
        Some(chan)
    }

    async fn receive_data<T: HeadUnitTrait + ?Sized>(
        &self,
        msg: LinkFrame,
        ctx: &ChannelContext<'_, T>,
    ) -> Result<(), LinkError> {
        let channel = msg.header.channel_id;
        let msg2: Result<BluetoothMessage, String> = (&msg).try_into();
        if let Ok(msg2) = msg2 {
            match msg2 {
                BluetoothMessage::PairingResponse(_, _) => unimplemented!(),
                BluetoothMessage::PairingRequest(_chan, m) => {
                    let paired = if let Some(adapter) = ctx.main.supports_bluetooth() {
                        adapter.is_paired(m.phone_address()).await
                    } else {
                        false
                    };
                    let mut m2 = Wifi::BluetoothPairingResponse::new();
                    m2.set_already_paired(paired);
                    m2.set_status(if paired {
                        Wifi::bluetooth_pairing_status::Enum::OK
                    } else {
                        Wifi::bluetooth_pairing_status::Enum::FAIL
                    });
                    ctx.messenger
                        .send(BluetoothMessage::PairingResponse(channel, m2).into())?
                        .wait()
                        .await?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BluetoothAdapter;
    use crate::testutil;

    /// A head unit with a bluetooth adapter that knows one phone
    struct BtHeadUnit {
        adapter: StubAdapter,
    }

    struct StubAdapter {}

    #[async_trait::async_trait]
    impl BluetoothAdapter for StubAdapter {
        fn address(&self) -> String {
            "00:11:22:33:44:55".to_string()
        }
        async fn is_paired(&self, address: &str) -> bool {
            address == "66:77:88:99:AA:BB"
        }
    }

    #[async_trait::async_trait]
    impl crate::HeadUnitTrait for BtHeadUnit {
        fn supports_bluetooth(&self) -> Option<&dyn BluetoothAdapter> {
            Some(&self.adapter)
        }
    }

    fn pairing_frame(address: &str) -> LinkFrame {
        let mut m = Wifi::BluetoothPairingRequest::new();
        m.set_phone_address(address.to_string());
        m.set_pairing_method(Wifi::bluetooth_pairing_method::Enum::HFP);
        LinkFrame {
            header: FrameHeader {
                channel_id: 9,
                frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
            },
            data: message_bytes(
                Wifi::bluetooth_channel_message::Enum::PAIRING_REQUEST as u16,
                m.write_to_bytes().unwrap(),
            ),
        }
    }

    #[tokio::test]
    async fn paired_phone_is_acknowledged() {
        let h = BluetoothChannelHandler {};
        let t = testutil::harness().await;
        t.authenticate().await;
        let main = BtHeadUnit {
            adapter: StubAdapter {},
        };
        h.receive_data(pairing_frame("66:77:88:99:AA:BB"), &t.ctx(&main))
            .await
            .unwrap();
        let sent = t.next_sent().await;
        let m = Wifi::BluetoothPairingResponse::parse_from_bytes(&sent.data[2..]).unwrap();
        assert!(m.already_paired());
        assert_eq!(m.status(), Wifi::bluetooth_pairing_status::Enum::OK);
    }

    #[tokio::test]
    async fn unpaired_phone_is_refused() {
        let h = BluetoothChannelHandler {};
        let t = testutil::harness().await;
        t.authenticate().await;
        let main = BtHeadUnit {
            adapter: StubAdapter {},
        };
        h.receive_data(pairing_frame("11:11:11:11:11:11"), &t.ctx(&main))
            .await
            .unwrap();
        let sent = t.next_sent().await;
        let m = Wifi::BluetoothPairingResponse::parse_from_bytes(&sent.data[2..]).unwrap();
        assert!(!m.already_paired());
        assert_eq!(m.status(), Wifi::bluetooth_pairing_status::Enum::FAIL);
    }

    #[test]
    fn descriptor_reports_adapter_and_hfp() {
        let h = BluetoothChannelHandler {};
        let config = crate::config::HeadUnitConfiguration::default();
        let main = BtHeadUnit {
            adapter: StubAdapter {},
        };
        let chan = h.build_channel(&config, 9, &main).unwrap();
        let b = chan.bluetooth_channel.0.as_ref().unwrap();
        assert_eq!(b.adapter_address(), "00:11:22:33:44:55");
        assert_eq!(
            b.supported_pairing_methods[0].enum_value().unwrap(),
            Wifi::bluetooth_pairing_method::Enum::HFP
        );
    }
}
