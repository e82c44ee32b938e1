//! Contains sensor channel code

use crate::common::{CommonMessage, message_bytes, open_response};
use crate::frame::{FrameHeader, FrameHeaderContents, FrameHeaderType, LinkFrame};
use crate::{
    ChannelContext, ChannelHandlerTrait, ChannelId, GpsFix, HeadUnitTrait, LinkError, SensorKind,
    Wifi,
};
use protobuf::Message;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// A message about sensors
#[derive(Debug)]
pub enum SensorMessage {
    /// A request to start a specific sensor
    SensorStartRequest(ChannelId, Wifi::SensorStartRequestMessage),
    /// A response to the sensor start request
    SensorStartResponse(ChannelId, Wifi::SensorStartResponseMessage),
    /// A message containing sensor data
    Event(ChannelId, Wifi::SensorEventIndication),
}

impl From<SensorMessage> for LinkFrame {
    fn from(value: SensorMessage) -> Self {
        match value {
            SensorMessage::SensorStartRequest(_, _) => unimplemented!(),
            SensorMessage::SensorStartResponse(chan, m) => LinkFrame {
                header: FrameHeader {
                    channel_id: chan,
                    frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
                },
                data: message_bytes(
                    Wifi::sensor_channel_message::Enum::SENSOR_START_RESPONSE as u16,
                    m.write_to_bytes().unwrap(),
                ),
            },
            SensorMessage::Event(chan, m) => LinkFrame {
                header: FrameHeader {
                    channel_id: chan,
                    frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
                },
                data: message_bytes(
                    Wifi::sensor_channel_message::Enum::SENSOR_EVENT_INDICATION as u16,
                    m.write_to_bytes().unwrap(),
                ),
            },
        }
    }
}

impl TryFrom<&LinkFrame> for SensorMessage {
    type Error = String;
    fn try_from(value: &LinkFrame) -> Result<Self, Self::Error> {
        use protobuf::Enum;
        let ty = crate::common::message_id(value);
        if let Some(sys) = Wifi::sensor_channel_message::Enum::from_i32(ty as i32) {
            match sys {
                Wifi::sensor_channel_message::Enum::SENSOR_START_REQUEST => {
                    let m = Wifi::SensorStartRequestMessage::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::SensorStartRequest(value.header.channel_id, m)),
                        Err(e) => Err(e.to_string()),
                    }
                }
                Wifi::sensor_channel_message::Enum::SENSOR_START_RESPONSE
                | Wifi::sensor_channel_message::Enum::SENSOR_EVENT_INDICATION => {
                    Err("Head unit to phone message from the phone".to_string())
                }
                Wifi::sensor_channel_message::Enum::NONE => Err("Empty sensor message".to_string()),
            }
        } else {
            Err(format!("Not converted message: {:x?}", value.data))
        }
    }
}

/// Build the driving status event, the head unit reports no restrictions
pub fn driving_event() -> Wifi::SensorEventIndication {
    let mut m = Wifi::SensorEventIndication::new();
    let mut ds = Wifi::DrivingStatus::new();
    ds.set_status(Wifi::DrivingStatusEnum::UNRESTRICTED as i32);
    m.driving_status.push(ds);
    m
}

/// Build a night mode event
pub fn night_event(is_night: bool) -> Wifi::SensorEventIndication {
    let mut m = Wifi::SensorEventIndication::new();
    let mut nm = Wifi::NightMode::new();
    nm.set_is_night(is_night);
    m.night_mode.push(nm);
    m
}

/// Build a location event from a fix
pub fn location_event(fix: &GpsFix) -> Wifi::SensorEventIndication {
    let mut m = Wifi::SensorEventIndication::new();
    let mut loc = Wifi::GPSLocation::new();
    loc.set_timestamp(fix.timestamp);
    loc.set_latitude((fix.latitude * 1e7) as i32);
    loc.set_longitude((fix.longitude * 1e7) as i32);
    loc.set_accuracy((fix.accuracy * 1e3) as u32);
    if let Some(speed) = fix.speed {
        loc.set_speed((speed * 1e3) as i32);
    }
    if let Some(bearing) = fix.bearing {
        loc.set_bearing((bearing * 1e6) as i32);
    }
    m.gps_location.push(loc);
    m
}

/// The handler for the sensor channel
pub struct SensorChannelHandler {
    /// Sensors the phone has started, shared with the sensor pumps
    started: Arc<Mutex<HashSet<SensorKind>>>,
}

impl SensorChannelHandler {
    /// construct a new self
    pub fn new() -> Self {
        Self {
            started: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// The started-sensor set for the session's sensor pumps
    pub fn started_handle(&self) -> Arc<Mutex<HashSet<SensorKind>>> {
        self.started.clone()
    }

    /// Map a wire sensor type to the kind the crate knows
    fn kind_of(t: Wifi::sensor_type::Enum) -> Option<SensorKind> {
        match t {
            Wifi::sensor_type::Enum::DRIVING_STATUS => Some(SensorKind::DrivingStatus),
            Wifi::sensor_type::Enum::NIGHT_DATA => Some(SensorKind::NightMode),
            Wifi::sensor_type::Enum::LOCATION => Some(SensorKind::Location),
            Wifi::sensor_type::Enum::NONE => None,
        }
    }
}

impl ChannelHandlerTrait for SensorChannelHandler {
    fn build_channel<T: HeadUnitTrait + ?Sized>(
        &self,
        _config: &crate::config::HeadUnitConfiguration,
        chanid: ChannelId,
        main: &T,
    ) -> Option<Wifi::ChannelDescriptor> {
        let source = main.supports_sensors()?;
        let mut chan = Wifi::ChannelDescriptor::new();
        let mut sensor = Wifi::SensorChannel::new();
        let mut types = vec![
            Wifi::sensor_type::Enum::DRIVING_STATUS,
            Wifi::sensor_type::Enum::NIGHT_DATA,
        ];
        if source.supported().location {
            types.push(Wifi::sensor_type::Enum::LOCATION);
        }
        for t in types {
            let mut s = Wifi::Sensor::new();
            s.set_sensor_type(t);
            sensor.sensors.push(s);
        }
        chan.sensor_channel.0.replace(Box::new(sensor));
        chan.set_channel_id(chanid as u32);
        Some(chan)
    }

    async fn receive_data<T: HeadUnitTrait + ?Sized>(
        &self,
        msg: LinkFrame,
        ctx: &ChannelContext<'_, T>,
    ) -> Result<(), LinkError> {
        let channel = msg.header.channel_id;
        let msg2: Result<SensorMessage, String> = (&msg).try_into();
        if let Ok(msg2) = msg2 {
            match msg2 {
                SensorMessage::Event(_, _) | SensorMessage::SensorStartResponse(_, _) => {
                    unimplemented!()
                }
                SensorMessage::SensorStartRequest(_chan, m) => {
                    let source = ctx.main.supports_sensors();
                    let kind = Self::kind_of(m.sensor_type());
                    let supported = match (kind, source) {
                        (Some(SensorKind::Location), Some(s)) => s.supported().location,
                        (Some(_), Some(_)) => true,
                        _ => false,
                    };
                    let started = if supported {
                        let source = source.unwrap();
                        source.start(kind.unwrap()).await.is_ok()
                    } else {
                        false
                    };
                    let mut m2 = Wifi::SensorStartResponseMessage::new();
                    m2.set_status(if started {
                        Wifi::status::Enum::OK
                    } else {
                        Wifi::status::Enum::FAIL
                    });
                    ctx.messenger
                        .send(SensorMessage::SensorStartResponse(channel, m2).into())?
                        .wait()
                        .await?;
                    if !started {
                        log::warn!("Refused sensor start for {:?}", m.sensor_type());
                        return Ok(());
                    }
                    let kind = kind.unwrap();
                    {
                        let mut set = self.started.lock().unwrap();
                        set.insert(kind);
                    }
                    // one event right away so the phone has a baseline
                    let source = ctx.main.supports_sensors().unwrap();
                    let event = match kind {
                        SensorKind::DrivingStatus => Some(driving_event()),
                        SensorKind::NightMode => Some(night_event(*source.night_mode().borrow())),
                        SensorKind::Location => source
                            .location()
                            .and_then(|rx| rx.borrow().clone().map(|fix| location_event(&fix))),
                    };
                    if let Some(event) = event {
                        ctx.messenger
                            .send(SensorMessage::Event(channel, event).into())?
                            .wait()
                            .await?;
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

/// Push night mode transitions to the phone as they happen
pub(crate) async fn run_night_pump(
    started: Arc<Mutex<HashSet<SensorKind>>>,
    mut night: tokio::sync::watch::Receiver<bool>,
    channel: ChannelId,
    messenger: Arc<crate::messenger::Messenger>,
) {
    while night.changed().await.is_ok() {
        let is_night = *night.borrow_and_update();
        let wanted = { started.lock().unwrap().contains(&SensorKind::NightMode) };
        if wanted
            && messenger
                .send(SensorMessage::Event(channel, night_event(is_night)).into())
                .is_err()
        {
            return;
        }
    }
}

/// Push location fixes to the phone as they arrive
pub(crate) async fn run_location_pump(
    started: Arc<Mutex<HashSet<SensorKind>>>,
    mut location: tokio::sync::watch::Receiver<Option<GpsFix>>,
    channel: ChannelId,
    messenger: Arc<crate::messenger::Messenger>,
) {
    while location.changed().await.is_ok() {
        let fix = location.borrow_and_update().clone();
        let wanted = { started.lock().unwrap().contains(&SensorKind::Location) };
        if let (true, Some(fix)) = (wanted, fix) {
            if messenger
                .send(SensorMessage::Event(channel, location_event(&fix)).into())
                .is_err()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::message_id;
    use crate::testutil;
    use crate::{SensorCatalog, SensorSource};
    use tokio::sync::watch;

    /// A head unit with a sensor source whose night flag can be flipped
    struct SensorHeadUnit {
        source: StubSensors,
    }

    struct StubSensors {
        night_tx: watch::Sender<bool>,
        location: bool,
    }

    impl StubSensors {
        fn new(location: bool) -> Self {
            let (night_tx, _) = watch::channel(false);
            Self { night_tx, location }
        }
    }

    #[async_trait::async_trait]
    impl SensorSource for StubSensors {
        fn supported(&self) -> SensorCatalog {
            SensorCatalog {
                location: self.location,
            }
        }
        fn night_mode(&self) -> watch::Receiver<bool> {
            self.night_tx.subscribe()
        }
        fn location(&self) -> Option<watch::Receiver<Option<GpsFix>>> {
            None
        }
        async fn start(&self, _sensor: SensorKind) -> Result<(), ()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl crate::HeadUnitTrait for SensorHeadUnit {
        fn supports_sensors(&self) -> Option<&dyn SensorSource> {
            Some(&self.source)
        }
    }

    fn start_frame(t: Wifi::sensor_type::Enum) -> LinkFrame {
        let mut m = Wifi::SensorStartRequestMessage::new();
        m.set_sensor_type(t);
        LinkFrame {
            header: FrameHeader {
                channel_id: 6,
                frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
            },
            data: message_bytes(
                Wifi::sensor_channel_message::Enum::SENSOR_START_REQUEST as u16,
                m.write_to_bytes().unwrap(),
            ),
        }
    }

    #[tokio::test]
    async fn driving_status_start_sends_unrestricted() {
        let h = SensorChannelHandler::new();
        let t = testutil::harness().await;
        t.authenticate().await;
        let main = SensorHeadUnit {
            source: StubSensors::new(false),
        };
        h.receive_data(
            start_frame(Wifi::sensor_type::Enum::DRIVING_STATUS),
            &t.ctx(&main),
        )
        .await
        .unwrap();
        let resp = t.next_sent().await;
        assert_eq!(
            message_id(&resp),
            Wifi::sensor_channel_message::Enum::SENSOR_START_RESPONSE as u16
        );
        let event = t.next_sent().await;
        let m = Wifi::SensorEventIndication::parse_from_bytes(&event.data[2..]).unwrap();
        assert_eq!(m.driving_status.len(), 1);
        assert_eq!(
            m.driving_status[0].status(),
            Wifi::DrivingStatusEnum::UNRESTRICTED as i32
        );
    }

    #[tokio::test]
    async fn night_start_reports_the_current_state() {
        let h = SensorChannelHandler::new();
        let t = testutil::harness().await;
        t.authenticate().await;
        let main = SensorHeadUnit {
            source: StubSensors::new(false),
        };
        main.source.night_tx.send_replace(true);
        h.receive_data(
            start_frame(Wifi::sensor_type::Enum::NIGHT_DATA),
            &t.ctx(&main),
        )
        .await
        .unwrap();
        let _resp = t.next_sent().await;
        let event = t.next_sent().await;
        let m = Wifi::SensorEventIndication::parse_from_bytes(&event.data[2..]).unwrap();
        assert!(m.night_mode[0].is_night());
    }

    #[tokio::test]
    async fn unknown_sensor_start_is_refused() {
        let h = SensorChannelHandler::new();
        let t = testutil::harness().await;
        t.authenticate().await;
        let main = SensorHeadUnit {
            source: StubSensors::new(false),
        };
        h.receive_data(
            start_frame(Wifi::sensor_type::Enum::LOCATION),
            &t.ctx(&main),
        )
        .await
        .unwrap();
        let resp = t.next_sent().await;
        let m = Wifi::SensorStartResponseMessage::parse_from_bytes(&resp.data[2..]).unwrap();
        assert_eq!(m.status(), Wifi::status::Enum::FAIL);
        assert!(t.no_traffic().await);
    }

    #[tokio::test]
    async fn night_transitions_are_pushed() {
        let h = SensorChannelHandler::new();
        let t = testutil::harness().await;
        t.authenticate().await;
        let main = SensorHeadUnit {
            source: StubSensors::new(false),
        };
        h.receive_data(
            start_frame(Wifi::sensor_type::Enum::NIGHT_DATA),
            &t.ctx(&main),
        )
        .await
        .unwrap();
        let _resp = t.next_sent().await;
        let _initial = t.next_sent().await;
        let pump = tokio::spawn(run_night_pump(
            h.started_handle(),
            main.source.night_tx.subscribe(),
            6,
            t.messenger.clone(),
        ));
        main.source.night_tx.send_replace(true);
        let event = t.next_sent().await;
        assert_eq!(
            message_id(&event),
            Wifi::sensor_channel_message::Enum::SENSOR_EVENT_INDICATION as u16
        );
        let m = Wifi::SensorEventIndication::parse_from_bytes(&event.data[2..]).unwrap();
        assert!(m.night_mode[0].is_night());
        pump.abort();
    }

    #[test]
    fn descriptor_lists_location_only_when_available() {
        let h = SensorChannelHandler::new();
        let config = crate::config::HeadUnitConfiguration::default();
        let main = SensorHeadUnit {
            source: StubSensors::new(false),
        };
        let chan = h.build_channel(&config, 6, &main).unwrap();
        let sensors = &chan.sensor_channel.0.as_ref().unwrap().sensors;
        assert_eq!(sensors.len(), 2);
        let main = SensorHeadUnit {
            source: StubSensors::new(true),
        };
        let chan = h.build_channel(&config, 6, &main).unwrap();
        let sensors = &chan.sensor_channel.0.as_ref().unwrap().sensors;
        assert_eq!(sensors.len(), 3);
    }
}
