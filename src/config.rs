//! Configuration for the head unit, both the persisted settings file and the
//! runtime configuration handed to a session.

use crate::Wifi;

/// Information about the head unit that is reported during service discovery
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct HeadUnitInfo {
    /// The name of the head unit
    pub name: String,
    /// The model of the vehicle
    pub car_model: String,
    /// The year of the vehicle
    pub car_year: String,
    /// The serial number of the vehicle
    pub car_serial: String,
    /// True when the vehicle is a left hand drive, false when a right hand drive
    pub left_hand: bool,
    /// The manufacturer of the head unit
    pub head_manufacturer: String,
    /// The model of the head unit
    pub head_model: String,
    /// The software build for the head unit
    pub sw_build: String,
    /// The software version for the head unit
    pub sw_version: String,
    /// Does the head unit support native media during vr
    pub native_media: bool,
    /// Should the clock be hidden?
    pub hide_clock: Option<bool>,
}

impl Default for HeadUnitInfo {
    fn default() -> Self {
        Self {
            name: "Headlink".to_string(),
            car_model: "Universal".to_string(),
            car_year: "2024".to_string(),
            car_serial: "00000000".to_string(),
            left_hand: true,
            head_manufacturer: "headlink".to_string(),
            head_model: "headlink".to_string(),
            sw_build: "1".to_string(),
            sw_version: "1.0".to_string(),
            native_media: false,
            hide_clock: None,
        }
    }
}

/// The resolutions the video channel can advertise
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum VideoResolutionSetting {
    /// 800x480
    Res480p,
    /// 1280x720
    Res720p,
    /// 1920x1080
    Res1080p,
}

impl VideoResolutionSetting {
    /// The wire form of the resolution
    pub fn to_wire(self) -> Wifi::video_resolution::Enum {
        match self {
            Self::Res480p => Wifi::video_resolution::Enum::_480p,
            Self::Res720p => Wifi::video_resolution::Enum::_720p,
            Self::Res1080p => Wifi::video_resolution::Enum::_1080p,
        }
    }

    /// The pixel dimensions of the resolution
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Res480p => (800, 480),
            Self::Res720p => (1280, 720),
            Self::Res1080p => (1920, 1080),
        }
    }
}

/// The frame rates the video channel can advertise
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum VideoFpsSetting {
    /// 30 frames per second
    Fps30,
    /// 60 frames per second
    Fps60,
}

impl VideoFpsSetting {
    /// The wire form of the frame rate
    pub fn to_wire(self) -> Wifi::video_fps::Enum {
        match self {
            Self::Fps30 => Wifi::video_fps::Enum::_30,
            Self::Fps60 => Wifi::video_fps::Enum::_60,
        }
    }
}

/// The persisted video settings
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct VideoSettings {
    /// The resolution advertised for the video stream
    pub resolution: VideoResolutionSetting,
    /// The frame rate advertised for the video stream
    pub fps: VideoFpsSetting,
    /// The dots per inch of the display
    pub dpi: u16,
    /// Pixels to leave unused horizontally
    pub margin_width: u16,
    /// Pixels to leave unused vertically
    pub margin_height: u16,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            resolution: VideoResolutionSetting::Res480p,
            fps: VideoFpsSetting::Fps30,
            dpi: 140,
            margin_width: 0,
            margin_height: 0,
        }
    }
}

/// The persisted audio output settings
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct AudioSettings {
    /// Register the media audio channel?
    pub media_enabled: bool,
    /// Register the speech audio channel?
    pub speech_enabled: bool,
    /// The audio output backend the embedder should use
    pub backend: String,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            media_enabled: true,
            speech_enabled: true,
            backend: "default".to_string(),
        }
    }
}

/// The persisted input settings
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct InputSettings {
    /// The button codes the head unit hardware can produce
    pub keycodes: Vec<u32>,
    /// Is a touchscreen present?
    pub touchscreen_enabled: bool,
    /// The width of the touchscreen in its own coordinates
    pub touchscreen_width: u16,
    /// The height of the touchscreen in its own coordinates
    pub touchscreen_height: u16,
}

impl InputSettings {
    /// The touchscreen dimensions when one is enabled
    pub fn touchscreen(&self) -> Option<(u16, u16)> {
        self.touchscreen_enabled
            .then_some((self.touchscreen_width, self.touchscreen_height))
    }
}

/// The persisted wireless settings
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct WifiSettings {
    /// The ssid of the network the phone should join
    pub ssid: String,
    /// The pre shared key of that network
    pub psk: String,
    /// Overrides the advertised access point mac address when set
    pub mac_override: Option<String>,
    /// The port the projection listener binds
    pub port: u16,
}

/// Which bluetooth adapter the head unit drives
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BluetoothAdapterKind {
    /// An adapter local to the head unit
    #[default]
    Local,
    /// An adapter reached over the network
    Remote,
    /// No bluetooth hardware
    None,
}

/// How many manually entered addresses are remembered
const RECENT_ADDRESSES: usize = 7;

/// The persisted settings of the head unit, an ini-like key/value tree
/// stored as toml.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Settings {
    /// Which bluetooth adapter to use
    pub bluetooth_adapter: BluetoothAdapterKind,
    /// The address of the last phone that completed the wireless bootstrap
    pub last_bluetooth_pair: Option<String>,
    /// Reconnect to the last paired phone automatically?
    pub auto_connect: bool,
    /// Addresses recently used for manual wireless connections, newest first
    pub recent_addresses: Vec<String>,
    /// The head unit metadata reported to the phone
    pub unit: HeadUnitInfo,
    /// The wireless settings
    pub wifi: WifiSettings,
    /// The video settings
    pub video: VideoSettings,
    /// The audio settings
    pub audio: AudioSettings,
    /// The input settings
    pub input: InputSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bluetooth_adapter: BluetoothAdapterKind::default(),
            last_bluetooth_pair: None,
            auto_connect: true,
            recent_addresses: Vec::new(),
            unit: HeadUnitInfo::default(),
            wifi: WifiSettings {
                port: 5000,
                ..Default::default()
            },
            video: VideoSettings::default(),
            audio: AudioSettings::default(),
            input: InputSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from the given path, falling back to defaults when the
    /// file does not exist yet.
    pub fn load(path: &std::path::Path) -> Result<Self, std::io::Error> {
        match std::fs::read_to_string(path) {
            Ok(data) => toml::from_str(&data).map_err(std::io::Error::other),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Persist settings to the given path
    pub fn save(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        let data = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, data)
    }

    /// Remember a manually entered address, newest first, dropping
    /// duplicates and trimming the list.
    pub fn add_recent_address(&mut self, address: &str) {
        self.recent_addresses.retain(|a| a != address);
        self.recent_addresses.insert(0, address.to_string());
        self.recent_addresses.truncate(RECENT_ADDRESSES);
    }
}

/// The runtime configuration for projection sessions
#[derive(Clone, Default)]
pub struct HeadUnitConfiguration {
    /// The persisted settings
    pub settings: Settings,
    /// Where the settings are stored, when they should be written back
    pub settings_path: Option<std::path::PathBuf>,
    /// A custom certificate and private key in pem format, when the
    /// embedded keystore is not desired
    pub custom_certificate: Option<(Vec<u8>, Vec<u8>)>,
}
