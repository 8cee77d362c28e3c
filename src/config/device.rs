//! Per-device configuration extracted from a raw device table.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::Serialize;

use super::{ConfigError, DeviceSection};

/// Which directions a device exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestType {
    /// Downlink only: remote client sends to the device.
    Dl,
    /// Uplink only: the device sends to the remote server.
    Ul,
    /// Downlink and uplink at the same time.
    Sim,
}

impl TestType {
    pub fn downlink(self) -> bool {
        matches!(self, TestType::Dl | TestType::Sim)
    }

    pub fn uplink(self) -> bool {
        matches!(self, TestType::Ul | TestType::Sim)
    }
}

impl FromStr for TestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DL" => Ok(TestType::Dl),
            "UL" => Ok(TestType::Ul),
            "SIM" => Ok(TestType::Sim),
            other => Err(format!("expected DL, UL or SIM, got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrafficType {
    Udp,
    Tcp,
}

impl TrafficType {
    /// Number of phases a device of this traffic type runs.
    pub fn phase_count(self) -> u8 {
        match self {
            TrafficType::Udp => 2,
            TrafficType::Tcp => 1,
        }
    }
}

impl FromStr for TrafficType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UDP" => Ok(TrafficType::Udp),
            "TCP" => Ok(TrafficType::Tcp),
            other => Err(format!("expected UDP or TCP, got '{}'", other)),
        }
    }
}

impl fmt::Display for TrafficType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficType::Udp => write!(f, "UDP"),
            TrafficType::Tcp => write!(f, "TCP"),
        }
    }
}

/// The peer host that runs the remote half of every process pair.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEndpoint {
    pub address: String,
    pub username: String,
    /// Password for the remote account. `None` means key-based auth.
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl RemoteEndpoint {
    /// `user@host` as understood by ssh.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.address)
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Throughput and payload length for one phase. Only the values for active
/// directions of a UDP device are required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseParams {
    pub dl_throughput: Option<String>,
    pub dl_len: Option<String>,
    pub ul_throughput: Option<String>,
    pub ul_len: Option<String>,
}

/// A validated device section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Name of the config table this device came from.
    pub section: String,
    /// Local adapter the traffic is bound to.
    pub adapter: String,
    /// Fixed local address; skips interface resolution when set.
    pub address: Option<Ipv4Addr>,
    pub test_type: TestType,
    pub traffic_type: TrafficType,
    pub remote: RemoteEndpoint,
    /// Unique per run; feeds port derivation.
    pub device_id: u32,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub phases: [PhaseParams; 2],
}

impl DeviceConfig {
    pub fn from_section(section: &DeviceSection) -> Result<Self, ConfigError> {
        let reader = SectionReader { section };

        let adapter = reader.required_text("adapter")?;
        let test_type = reader.parsed::<TestType>("test_type")?;
        let traffic_type = reader.parsed::<TrafficType>("traffic_type")?;
        let remote = reader.remote("remote")?;
        let device_id = u32::try_from(reader.number("device_id")?)
            .map_err(|_| reader.invalid("device_id", "does not fit in 32 bits"))?;
        let t0 = reader.number("t0")?;
        let t1 = reader.number("t1")?;
        let t2 = reader.number("t2")?;

        if traffic_type == TrafficType::Udp && t2 < t1 {
            return Err(reader.invalid("t2", format!("t2 ({}) is earlier than t1 ({})", t2, t1)));
        }

        let address = match reader.optional_text("address")? {
            Some(raw) => Some(
                raw.parse::<Ipv4Addr>()
                    .map_err(|e| reader.invalid("address", e.to_string()))?,
            ),
            None => None,
        };

        let phases = [reader.phase_params(0)?, reader.phase_params(1)?];

        Ok(Self {
            section: section.name.clone(),
            adapter,
            address,
            test_type,
            traffic_type,
            remote,
            device_id,
            t0,
            t1,
            t2,
            phases,
        })
    }

    /// How long this device's test runs end to end.
    pub fn total_duration_secs(&self) -> u64 {
        match self.traffic_type {
            TrafficType::Udp => self.t2,
            TrafficType::Tcp => self.t1,
        }
    }

    pub fn missing_key(&self, key: impl Into<String>) -> ConfigError {
        ConfigError::MissingKey {
            section: self.section.clone(),
            key: key.into(),
        }
    }

    pub fn invalid(&self, key: impl Into<String>, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            section: self.section.clone(),
            key: key.into(),
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// SectionReader
// ---------------------------------------------------------------------------

struct SectionReader<'a> {
    section: &'a DeviceSection,
}

impl SectionReader<'_> {
    fn missing(&self, key: &str) -> ConfigError {
        ConfigError::MissingKey {
            section: self.section.name.clone(),
            key: key.to_string(),
        }
    }

    fn invalid(&self, key: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            section: self.section.name.clone(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    /// String, integer or float values, rendered as text.
    fn optional_text(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.section.table.get(key) {
            None => Ok(None),
            Some(toml::Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(toml::Value::Integer(i)) => Ok(Some(i.to_string())),
            Some(toml::Value::Float(f)) => Ok(Some(f.to_string())),
            Some(other) => Err(self.invalid(
                key,
                format!("expected text, found {}", other.type_str()),
            )),
        }
    }

    fn required_text(&self, key: &str) -> Result<String, ConfigError> {
        self.optional_text(key)?.ok_or_else(|| self.missing(key))
    }

    fn parsed<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr<Err = String>,
    {
        self.required_text(key)?
            .parse()
            .map_err(|reason: String| self.invalid(key, reason))
    }

    /// Non-negative integer, given either as a TOML integer or numeric text.
    fn number(&self, key: &str) -> Result<u64, ConfigError> {
        let not_numeric = |value: String| ConfigError::NotNumeric {
            section: self.section.name.clone(),
            key: key.to_string(),
            value,
        };

        match self.section.table.get(key) {
            None => Err(self.missing(key)),
            Some(toml::Value::Integer(i)) => {
                u64::try_from(*i).map_err(|_| self.invalid(key, format!("{} is negative", i)))
            }
            Some(toml::Value::String(s)) => {
                s.trim().parse::<u64>().map_err(|_| not_numeric(s.clone()))
            }
            Some(other) => Err(not_numeric(other.to_string())),
        }
    }

    /// `[address, username, credential]`; an empty credential means key auth.
    fn remote(&self, key: &str) -> Result<RemoteEndpoint, ConfigError> {
        let items = match self.section.table.get(key) {
            None => return Err(self.missing(key)),
            Some(toml::Value::Array(items)) => items,
            Some(toml::Value::String(s)) => {
                let parts: Vec<toml::Value> = s
                    .split(',')
                    .map(|p| toml::Value::String(p.trim().to_string()))
                    .collect();
                return self.remote_from(key, &parts);
            }
            Some(other) => {
                return Err(self.invalid(
                    key,
                    format!("expected a list, found {}", other.type_str()),
                ))
            }
        };
        self.remote_from(key, items)
    }

    fn remote_from(
        &self,
        key: &str,
        items: &[toml::Value],
    ) -> Result<RemoteEndpoint, ConfigError> {
        let field = |idx: usize| -> Option<String> {
            items.get(idx).and_then(|v| v.as_str()).map(|s| s.trim().to_string())
        };

        let address = field(0)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.invalid(key, "first element must be the remote address"))?;
        let username = field(1)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.invalid(key, "second element must be the remote username"))?;
        let password = field(2).filter(|s| !s.is_empty());

        Ok(RemoteEndpoint {
            address,
            username,
            password,
        })
    }

    fn phase_params(&self, phase: u8) -> Result<PhaseParams, ConfigError> {
        let key = |name: &str| format!("t{}_{}", phase, name);
        Ok(PhaseParams {
            dl_throughput: self.optional_text(&key("dl_throughput"))?,
            dl_len: self.optional_text(&key("dl_len"))?,
            ul_throughput: self.optional_text(&key("ul_throughput"))?,
            ul_len: self.optional_text(&key("ul_len"))?,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn section(body: &str) -> DeviceSection {
        DeviceSection {
            name: "ue1".to_string(),
            table: body.parse().unwrap(),
        }
    }

    const UDP_DEVICE: &str = r#"
adapter = "eth1"
test_type = "dl"
traffic_type = "UDP"
remote = ["10.0.0.1", "tester", "secret"]
device_id = 3
t0 = 0
t1 = "5"
t2 = 15
t0_dl_throughput = "10M"
t0_dl_len = 1400
"#;

    #[test]
    fn test_parse_udp_device() {
        let dev = DeviceConfig::from_section(&section(UDP_DEVICE)).unwrap();

        assert_eq!(dev.section, "ue1");
        assert_eq!(dev.adapter, "eth1");
        assert_eq!(dev.test_type, TestType::Dl);
        assert_eq!(dev.traffic_type, TrafficType::Udp);
        assert_eq!(dev.device_id, 3);
        assert_eq!((dev.t0, dev.t1, dev.t2), (0, 5, 15));
        assert_eq!(dev.remote.destination(), "tester@10.0.0.1");
        assert_eq!(dev.remote.password.as_deref(), Some("secret"));
        assert_eq!(dev.phases[0].dl_throughput.as_deref(), Some("10M"));
        assert_eq!(dev.phases[0].dl_len.as_deref(), Some("1400"));
        assert_eq!(dev.phases[1], PhaseParams::default());
        assert_eq!(dev.total_duration_secs(), 15);
        assert!(dev.address.is_none());
    }

    #[test]
    fn test_missing_key_is_named() {
        let body = UDP_DEVICE.replace("traffic_type = \"UDP\"\n", "");
        let err = DeviceConfig::from_section(&section(&body)).unwrap_err();
        match err {
            ConfigError::MissingKey { section, key } => {
                assert_eq!(section, "ue1");
                assert_eq!(key, "traffic_type");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_non_numeric_duration_errors() {
        let body = UDP_DEVICE.replace("t1 = \"5\"", "t1 = \"five\"");
        let err = DeviceConfig::from_section(&section(&body)).unwrap_err();
        assert!(matches!(err, ConfigError::NotNumeric { ref key, .. } if key == "t1"));
        assert!(err.to_string().contains("five"));
    }

    #[test]
    fn test_udp_t2_before_t1_errors() {
        let body = UDP_DEVICE.replace("t2 = 15", "t2 = 2");
        let err = DeviceConfig::from_section(&section(&body)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "t2"));
    }

    #[test]
    fn test_unknown_test_type_errors() {
        let body = UDP_DEVICE.replace("test_type = \"dl\"", "test_type = \"BOTH\"");
        let err = DeviceConfig::from_section(&section(&body)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "test_type"));
    }

    #[test]
    fn test_empty_credential_means_key_auth() {
        let body = UDP_DEVICE.replace("\"secret\"", "\"\"");
        let dev = DeviceConfig::from_section(&section(&body)).unwrap();
        assert!(dev.remote.password.is_none());
    }

    #[test]
    fn test_comma_separated_remote_is_accepted() {
        let body = UDP_DEVICE.replace(
            "remote = [\"10.0.0.1\", \"tester\", \"secret\"]",
            "remote = \"10.0.0.1, tester, secret\"",
        );
        let dev = DeviceConfig::from_section(&section(&body)).unwrap();
        assert_eq!(dev.remote.address, "10.0.0.1");
        assert_eq!(dev.remote.username, "tester");
    }

    #[test]
    fn test_address_override() {
        let body = format!("{}address = \"192.168.8.20\"\n", UDP_DEVICE);
        let dev = DeviceConfig::from_section(&section(&body)).unwrap();
        assert_eq!(dev.address, Some(Ipv4Addr::new(192, 168, 8, 20)));
    }

    #[test]
    fn test_password_is_redacted_in_debug() {
        let dev = DeviceConfig::from_section(&section(UDP_DEVICE)).unwrap();
        let dbg = format!("{:?}", dev.remote);
        assert!(!dbg.contains("secret"));
        assert!(dbg.contains("redacted"));
    }

    #[test]
    fn test_direction_flags() {
        assert!(TestType::Dl.downlink() && !TestType::Dl.uplink());
        assert!(!TestType::Ul.downlink() && TestType::Ul.uplink());
        assert!(TestType::Sim.downlink() && TestType::Sim.uplink());
        assert_eq!(TrafficType::Udp.phase_count(), 2);
        assert_eq!(TrafficType::Tcp.phase_count(), 1);
    }
}
