//! The input channel, translating head unit input into projection events

use crate::common::{CommonMessage, message_bytes, open_response};
use crate::frame::{FrameHeader, FrameHeaderContents, FrameHeaderType, LinkFrame};
use crate::{
    ChannelContext, ChannelHandlerTrait, ChannelId, HeadUnitTrait, InputEvent, LinkError,
    TouchAction, Wifi,
};
use protobuf::Message;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::sync::mpsc;

/// The scan code of the rotary scroll wheel
pub const SCROLL_WHEEL_KEYCODE: u32 = 65536;

/// A message on the input channel
#[derive(Debug)]
enum InputMessage {
    /// A message requesting input buttons to be bound
    BindingRequest(ChannelId, Wifi::BindingRequest),
    /// A message that responds to a binding request
    BindingResponse(ChannelId, Wifi::BindingResponse),
    /// A message that conveys input data to the phone
    InputEvent(ChannelId, Wifi::InputEventIndication),
}

impl From<InputMessage> for LinkFrame {
    fn from(value: InputMessage) -> Self {
        match value {
            InputMessage::BindingRequest(_, _) => unimplemented!(),
            InputMessage::BindingResponse(chan, m) => LinkFrame {
                header: FrameHeader {
                    channel_id: chan,
                    frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
                },
                data: message_bytes(
                    Wifi::input_channel_message::Enum::BINDING_RESPONSE as u16,
                    m.write_to_bytes().unwrap(),
                ),
            },
            InputMessage::InputEvent(chan, m) => LinkFrame {
                header: FrameHeader {
                    channel_id: chan,
                    frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
                },
                data: message_bytes(
                    Wifi::input_channel_message::Enum::INPUT_EVENT_INDICATION as u16,
                    m.write_to_bytes().unwrap(),
                ),
            },
        }
    }
}

impl TryFrom<&LinkFrame> for InputMessage {
    type Error = String;
    fn try_from(value: &LinkFrame) -> Result<Self, Self::Error> {
        use protobuf::Enum;
        let ty = crate::common::message_id(value);
        if let Some(sys) = Wifi::input_channel_message::Enum::from_i32(ty as i32) {
            match sys {
                Wifi::input_channel_message::Enum::BINDING_REQUEST => {
                    let m = Wifi::BindingRequest::parse_from_bytes(&value.data[2..]);
                    match m {
                        Ok(m) => Ok(Self::BindingRequest(value.header.channel_id, m)),
                        Err(e) => Err(format!("Invalid input bind request: {}", e)),
                    }
                }
                Wifi::input_channel_message::Enum::BINDING_RESPONSE
                | Wifi::input_channel_message::Enum::INPUT_EVENT_INDICATION => {
                    Err("Head unit to phone message from the phone".to_string())
                }
                Wifi::input_channel_message::Enum::NONE => Err("Empty input message".to_string()),
            }
        } else {
            Err(format!("Not converted message: {:x?}", value.data))
        }
    }
}

/// Hands out small dense pointer ids. The phone side rejects the large
/// sparse ids hosts use, so every host pointer is mapped to the smallest
/// id that is currently free, and keeps it until it lifts.
#[derive(Default)]
struct PointerIdAllocator {
    /// The smallest id never handed out
    next: u32,
    /// Ids returned by lifted pointers, smallest first
    free: BinaryHeap<Reverse<u32>>,
}

impl PointerIdAllocator {
    /// Allocate the smallest free id
    fn allocate(&mut self) -> u32 {
        if let Some(Reverse(id)) = self.free.pop() {
            id
        } else {
            let id = self.next;
            self.next += 1;
            id
        }
    }

    /// Return an id to the free pool
    fn release(&mut self, id: u32) {
        self.free.push(Reverse(id));
    }
}

/// One pointer currently on the touchscreen
struct ActivePointer {
    /// The compact id reported to the phone
    id: u32,
    /// Last known x, already rescaled
    x: u32,
    /// Last known y, already rescaled
    y: u32,
}

/// Turns raw input events into wire indications: coordinates are rescaled
/// from the touchscreen rectangle to the video rectangle and host pointer
/// ids are compacted.
pub struct InputTranslator {
    /// The touchscreen dimensions, if one is present
    touchscreen: Option<(u16, u16)>,
    /// The projection video dimensions
    video: (u32, u32),
    /// The pointer id allocator
    ids: PointerIdAllocator,
    /// Pointers currently down, in the order they landed
    active: Vec<(u64, ActivePointer)>,
}

impl InputTranslator {
    /// construct a new self
    pub fn new(touchscreen: Option<(u16, u16)>, video: (u32, u32)) -> Self {
        Self {
            touchscreen,
            video,
            ids: PointerIdAllocator::default(),
            active: Vec::new(),
        }
    }

    /// Microseconds since the epoch for event timestamps
    fn timestamp() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    /// Linearly map a touchscreen coordinate into the video rectangle
    fn rescale(&self, x: u32, y: u32) -> (u32, u32) {
        match self.touchscreen {
            Some((tw, th)) if tw != 0 && th != 0 => {
                let sx = (x as u64 * self.video.0 as u64 / tw as u64) as u32;
                let sy = (y as u64 * self.video.1 as u64 / th as u64) as u32;
                (sx, sy)
            }
            _ => (x, y),
        }
    }

    /// The wire form of a touch action
    fn wire_action(action: TouchAction) -> Wifi::touch_action::Enum {
        match action {
            TouchAction::Press => Wifi::touch_action::Enum::PRESS,
            TouchAction::Release => Wifi::touch_action::Enum::RELEASE,
            TouchAction::Drag => Wifi::touch_action::Enum::DRAG,
            TouchAction::PointerDown => Wifi::touch_action::Enum::POINTER_DOWN,
            TouchAction::PointerUp => Wifi::touch_action::Enum::POINTER_UP,
        }
    }

    /// Translate one raw event into an indication, if it produces one
    pub fn translate(&mut self, event: InputEvent) -> Option<Wifi::InputEventIndication> {
        let mut m = Wifi::InputEventIndication::new();
        m.set_timestamp(Self::timestamp());
        match event {
            InputEvent::Button { scan_code, pressed } => {
                let mut b = Wifi::ButtonEvent::new();
                b.set_scan_code(scan_code);
                b.set_is_pressed(pressed);
                b.set_long_press(false);
                b.set_meta(0);
                let mut bs = Wifi::ButtonEvents::new();
                bs.button_events.push(b);
                m.button_events.0.replace(Box::new(bs));
            }
            InputEvent::Wheel { delta } => {
                let mut r = Wifi::RelativeEvent::new();
                r.set_scan_code(SCROLL_WHEEL_KEYCODE);
                r.set_delta(delta.signum());
                let mut rs = Wifi::RelativeEvents::new();
                rs.relative_events.push(r);
                m.relative_events.0.replace(Box::new(rs));
            }
            InputEvent::Touch {
                action,
                pointer,
                x,
                y,
            } => {
                self.touchscreen?;
                let (x, y) = self.rescale(x, y);
                let index = match action {
                    TouchAction::Press | TouchAction::PointerDown => {
                        if self.active.iter().any(|(host, _)| *host == pointer) {
                            log::warn!("Pointer {} landed twice", pointer);
                            return None;
                        }
                        let id = self.ids.allocate();
                        self.active.push((pointer, ActivePointer { id, x, y }));
                        self.active.len() - 1
                    }
                    TouchAction::Drag => {
                        let index = self.active.iter().position(|(host, _)| *host == pointer)?;
                        self.active[index].1.x = x;
                        self.active[index].1.y = y;
                        index
                    }
                    TouchAction::Release | TouchAction::PointerUp => {
                        let index = self.active.iter().position(|(host, _)| *host == pointer)?;
                        self.active[index].1.x = x;
                        self.active[index].1.y = y;
                        index
                    }
                };
                let mut t = Wifi::TouchEvent::new();
                t.set_touch_action(Self::wire_action(action));
                t.set_action_index(index as u32);
                for (_, p) in &self.active {
                    let mut loc = Wifi::TouchLocation::new();
                    loc.set_x(p.x);
                    loc.set_y(p.y);
                    loc.set_pointer_id(p.id);
                    t.touch_location.push(loc);
                }
                m.touch_event.0.replace(Box::new(t));
                if matches!(action, TouchAction::Release | TouchAction::PointerUp) {
                    let (_, gone) = self.active.remove(index);
                    self.ids.release(gone.id);
                }
            }
        }
        Some(m)
    }
}

/// Pump raw input events from the source into the messenger until the
/// source hangs up or the session stops.
pub(crate) async fn run_input_pump(
    mut events: mpsc::Receiver<InputEvent>,
    mut translator: InputTranslator,
    channel: ChannelId,
    messenger: std::sync::Arc<crate::messenger::Messenger>,
) {
    while let Some(event) = events.recv().await {
        if let Some(indication) = translator.translate(event) {
            match messenger.send(InputMessage::InputEvent(channel, indication).into()) {
                Ok(_promise) => {}
                Err(e) => {
                    log::debug!("Input event dropped: {:?}", e);
                    return;
                }
            }
        }
    }
}

/// The handler for the input channel
pub struct InputChannelHandler {
    /// Where the input source should deliver raw events once bound
    events: mpsc::Sender<InputEvent>,
}

impl InputChannelHandler {
    /// construct a new self delivering raw events to the given queue
    pub fn new(events: mpsc::Sender<InputEvent>) -> Self {
        Self { events }
    }
}

impl ChannelHandlerTrait for InputChannelHandler {
    fn build_channel<T: HeadUnitTrait + ?Sized>(
        &self,
        _config: &crate::config::HeadUnitConfiguration,
        chanid: ChannelId,
        main: &T,
    ) -> Option<Wifi::ChannelDescriptor> {
        let ic = main.supports_input()?;
        let mut chan = Wifi::ChannelDescriptor::new();
        chan.set_channel_id(chanid as u32);
        let mut ichan = Wifi::InputChannel::new();
        let profile = ic.profile();
        if let Some((w, h)) = profile.touchscreen {
            let mut tc = Wifi::TouchConfig::new();
            tc.set_width(w as u32);
            tc.set_height(h as u32);
            ichan.touch_screen_config.0.replace(Box::new(tc));
        }
        for c in &profile.keycodes {
            ichan.supported_keycodes.push(*c);
        }
        chan.input_channel.0.replace(Box::new(ichan));
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
        let msg2: InputMessage = (&msg)
            .try_into()
            .map_err(|e: String| LinkError::UnknownMessage { channel, detail: e })?;
        match msg2 {
            InputMessage::BindingRequest(chan, m) => {
                let mut status = false;
                if let Some(i) = ctx.main.supports_input() {
                    let profile = i.profile();
                    status = true;
                    for c in &m.scan_codes {
                        if !profile.keycodes.contains(&(*c as u32)) {
                            status = false;
                            break;
                        }
                        if i.binding_request(*c as u32).await.is_err() {
                            status = false;
                            break;
                        }
                    }
                    if status {
                        i.attach(self.events.clone());
                    }
                }
                let mut m2 = Wifi::BindingResponse::new();
                m2.set_status(if status {
                    Wifi::status::Enum::OK
                } else {
                    Wifi::status::Enum::FAIL
                });
                ctx.messenger
                    .send(InputMessage::BindingResponse(chan, m2).into())?
                    .wait()
                    .await?;
            }
            InputMessage::BindingResponse(_, _) | InputMessage::InputEvent(_, _) => {
                unimplemented!()
            }
        }
        Ok(())
    }

    async fn stop_channel<T: HeadUnitTrait + ?Sized>(&self, main: &T) {
        if let Some(i) = main.supports_input() {
            i.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::message_id;
    use crate::testutil;
    use crate::{InputProfile, InputSource};
    use std::sync::Mutex;

    fn touch(action: TouchAction, pointer: u64, x: u32, y: u32) -> InputEvent {
        InputEvent::Touch {
            action,
            pointer,
            x,
            y,
        }
    }

    fn translator() -> InputTranslator {
        InputTranslator::new(Some((1024, 600)), (1280, 720))
    }

    #[test]
    fn tap_rescales_into_the_video_rectangle() {
        let mut t = translator();
        let m = t
            .translate(touch(TouchAction::Press, 42, 512, 300))
            .unwrap();
        let te = m.touch_event.0.as_ref().unwrap();
        assert_eq!(te.touch_location.len(), 1);
        assert_eq!(te.touch_location[0].x(), 640);
        assert_eq!(te.touch_location[0].y(), 360);
        assert_eq!(te.touch_location[0].pointer_id(), 0);
        assert!(m.timestamp() > 0);
    }

    #[test]
    fn corners_map_to_corners() {
        let mut t = translator();
        let m = t.translate(touch(TouchAction::Press, 1, 0, 0)).unwrap();
        let te = m.touch_event.0.as_ref().unwrap();
        assert_eq!((te.touch_location[0].x(), te.touch_location[0].y()), (0, 0));
        let m = t
            .translate(touch(TouchAction::Drag, 1, 1024, 600))
            .unwrap();
        let te = m.touch_event.0.as_ref().unwrap();
        assert_eq!(
            (te.touch_location[0].x(), te.touch_location[0].y()),
            (1280, 720)
        );
    }

    #[test]
    fn pointer_ids_are_compact_and_stable() {
        let mut t = translator();
        let id_of = |m: &Wifi::InputEventIndication, i: usize| {
            m.touch_event.0.as_ref().unwrap().touch_location[i].pointer_id()
        };
        let m = t.translate(touch(TouchAction::Press, 100, 1, 1)).unwrap();
        assert_eq!(id_of(&m, 0), 0);
        let m = t
            .translate(touch(TouchAction::PointerDown, 2000, 2, 2))
            .unwrap();
        assert_eq!(id_of(&m, 1), 1);
        let m = t
            .translate(touch(TouchAction::PointerDown, 77777, 3, 3))
            .unwrap();
        assert_eq!(id_of(&m, 2), 2);
        // lift the first, its id must come back for the next pointer down
        let m = t
            .translate(touch(TouchAction::PointerUp, 100, 1, 1))
            .unwrap();
        assert_eq!(m.touch_event.0.as_ref().unwrap().action_index(), 0);
        let m = t
            .translate(touch(TouchAction::PointerDown, 500, 4, 4))
            .unwrap();
        let te = m.touch_event.0.as_ref().unwrap();
        let new_id = te.touch_location[te.action_index() as usize].pointer_id();
        assert_eq!(new_id, 0);
        // the surviving pointers kept their ids
        let m = t.translate(touch(TouchAction::Drag, 2000, 5, 5)).unwrap();
        let te = m.touch_event.0.as_ref().unwrap();
        assert_eq!(te.touch_location[te.action_index() as usize].pointer_id(), 1);
    }

    #[test]
    fn press_release_allocates_and_returns_zero() {
        let mut t = translator();
        let m = t.translate(touch(TouchAction::Press, 9, 10, 10)).unwrap();
        assert_eq!(
            m.touch_event.0.as_ref().unwrap().touch_location[0].pointer_id(),
            0
        );
        let m = t
            .translate(touch(TouchAction::Release, 9, 10, 10))
            .unwrap();
        assert_eq!(
            m.touch_event.0.as_ref().unwrap().touch_location[0].pointer_id(),
            0
        );
        // fully released, the next press starts from zero again
        let m = t.translate(touch(TouchAction::Press, 10, 10, 10)).unwrap();
        assert_eq!(
            m.touch_event.0.as_ref().unwrap().touch_location[0].pointer_id(),
            0
        );
    }

    #[test]
    fn wheel_event_reports_unit_deltas() {
        let mut t = translator();
        let m = t.translate(InputEvent::Wheel { delta: 3 }).unwrap();
        let re = &m.relative_events.0.as_ref().unwrap().relative_events[0];
        assert_eq!(re.scan_code(), SCROLL_WHEEL_KEYCODE);
        assert_eq!(re.delta(), 1);
        let m = t.translate(InputEvent::Wheel { delta: -2 }).unwrap();
        let re = &m.relative_events.0.as_ref().unwrap().relative_events[0];
        assert_eq!(re.delta(), -1);
    }

    #[test]
    fn button_event_carries_the_scan_code() {
        let mut t = translator();
        let m = t
            .translate(InputEvent::Button {
                scan_code: 84,
                pressed: true,
            })
            .unwrap();
        let be = &m.button_events.0.as_ref().unwrap().button_events[0];
        assert_eq!(be.scan_code(), 84);
        assert!(be.is_pressed());
        assert!(!be.long_press());
    }

    /// A head unit with a stub input source
    struct InputHeadUnit {
        source: StubSource,
    }

    struct StubSource {
        keycodes: Vec<u32>,
        attached: Mutex<bool>,
    }

    #[async_trait::async_trait]
    impl InputSource for StubSource {
        fn profile(&self) -> InputProfile {
            InputProfile {
                keycodes: self.keycodes.clone(),
                touchscreen: Some((1024, 600)),
            }
        }
        async fn binding_request(&self, _code: u32) -> Result<(), ()> {
            Ok(())
        }
        fn attach(&self, _events: mpsc::Sender<InputEvent>) {
            *self.attached.lock().unwrap() = true;
        }
        fn detach(&self) {
            *self.attached.lock().unwrap() = false;
        }
    }

    #[async_trait::async_trait]
    impl crate::HeadUnitTrait for InputHeadUnit {
        fn supports_input(&self) -> Option<&dyn InputSource> {
            Some(&self.source)
        }
    }

    fn binding_frame(codes: &[i32]) -> LinkFrame {
        let mut m = Wifi::BindingRequest::new();
        m.scan_codes.extend_from_slice(codes);
        LinkFrame {
            header: FrameHeader {
                channel_id: 2,
                frame: FrameHeaderContents::new(true, FrameHeaderType::Single, false),
            },
            data: message_bytes(
                Wifi::input_channel_message::Enum::BINDING_REQUEST as u16,
                m.write_to_bytes().unwrap(),
            ),
        }
    }

    #[tokio::test]
    async fn supported_binding_attaches_the_source() {
        let (tx, _rx) = mpsc::channel(4);
        let h = InputChannelHandler::new(tx);
        let t = testutil::harness().await;
        t.authenticate().await;
        let main = InputHeadUnit {
            source: StubSource {
                keycodes: vec![3, 84],
                attached: Mutex::new(false),
            },
        };
        h.receive_data(binding_frame(&[3, 84]), &t.ctx(&main))
            .await
            .unwrap();
        assert!(*main.source.attached.lock().unwrap());
        let sent = t.next_sent().await;
        assert_eq!(
            message_id(&sent),
            Wifi::input_channel_message::Enum::BINDING_RESPONSE as u16
        );
        let m = Wifi::BindingResponse::parse_from_bytes(&sent.data[2..]).unwrap();
        assert_eq!(m.status(), Wifi::status::Enum::OK);
    }

    #[tokio::test]
    async fn unsupported_binding_fails_without_attaching() {
        let (tx, _rx) = mpsc::channel(4);
        let h = InputChannelHandler::new(tx);
        let t = testutil::harness().await;
        t.authenticate().await;
        let main = InputHeadUnit {
            source: StubSource {
                keycodes: vec![3],
                attached: Mutex::new(false),
            },
        };
        h.receive_data(binding_frame(&[3, 999]), &t.ctx(&main))
            .await
            .unwrap();
        assert!(!*main.source.attached.lock().unwrap());
        let sent = t.next_sent().await;
        let m = Wifi::BindingResponse::parse_from_bytes(&sent.data[2..]).unwrap();
        assert_eq!(m.status(), Wifi::status::Enum::FAIL);
    }

    #[test]
    fn descriptor_lists_keycodes_and_touchscreen() {
        let (tx, _rx) = mpsc::channel(4);
        let h = InputChannelHandler::new(tx);
        let main = InputHeadUnit {
            source: StubSource {
                keycodes: vec![3, 84, SCROLL_WHEEL_KEYCODE],
                attached: Mutex::new(false),
            },
        };
        let config = crate::config::HeadUnitConfiguration::default();
        let chan = h.build_channel(&config, 2, &main).unwrap();
        let ic = chan.input_channel.0.as_ref().unwrap();
        assert_eq!(ic.supported_keycodes, vec![3, 84, SCROLL_WHEEL_KEYCODE]);
        let tc = ic.touch_screen_config.0.as_ref().unwrap();
        assert_eq!((tc.width(), tc.height()), (1024, 600));
    }
}
