//! Phase descriptor compiler.
//!
//! Turns one [`DeviceConfig`] into the concrete, immutable description of
//! each phase it runs: when it starts, how long it lasts, and the exact
//! command lines on both ends. Compilation is pure; the same device always
//! yields byte-identical descriptors.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::config::{ConfigError, DeviceConfig, RemoteEndpoint, TrafficType};
use crate::storage::sanitize;

use super::iperf::{self, UdpShape};
use super::{Direction, Role};

/// Commands for one active direction of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectionCommands {
    pub port: u16,
    pub client: String,
    pub server: String,
    /// Kills the remote-side process of this direction by pattern, since no
    /// handle to it exists locally.
    pub remote_kill: String,
}

/// Where the four log files of a phase live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseLogs {
    pub dir: PathBuf,
    /// `<prefix><device>_Phase<N>`
    pub stem: String,
}

impl PhaseLogs {
    pub fn path(&self, direction: Direction, role: Role) -> PathBuf {
        self.dir
            .join(format!("{}_{}_{}.log", self.stem, direction.tag(), role.tag()))
    }
}

/// One executable phase of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseDescriptor {
    pub device: String,
    pub device_id: u32,
    pub phase: u8,
    pub delay_secs: u64,
    pub duration_secs: u64,
    pub traffic_type: TrafficType,
    pub local_ip: Ipv4Addr,
    pub remote: RemoteEndpoint,
    /// Present when the downlink direction is active.
    pub downlink: Option<DirectionCommands>,
    /// Present when the uplink direction is active.
    pub uplink: Option<DirectionCommands>,
    pub logs: Option<PhaseLogs>,
}

impl PhaseDescriptor {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// `eth0-phase0`, used for task names and reports.
    pub fn label(&self) -> String {
        format!("{}-phase{}", self.device, self.phase)
    }

    /// Attach log file identifiers rooted at `dir`.
    pub fn with_logs(mut self, dir: &Path, prefix: &str) -> Self {
        self.logs = Some(PhaseLogs {
            dir: dir.to_path_buf(),
            stem: format!("{}{}_Phase{}", prefix, sanitize(&self.device), self.phase),
        });
        self
    }

    /// Downlink and uplink ports, for whichever directions are active.
    pub fn ports(&self) -> Vec<u16> {
        self.downlink
            .iter()
            .chain(self.uplink.iter())
            .map(|c| c.port)
            .collect()
    }
}

/// Compile a single phase of `device`.
pub fn compile(
    device: &DeviceConfig,
    local_ip: Ipv4Addr,
    phase: u8,
    tool: &str,
) -> Result<PhaseDescriptor, ConfigError> {
    if phase >= device.traffic_type.phase_count() {
        return Err(device.invalid(
            "traffic_type",
            format!("{} devices have no phase {}", device.traffic_type, phase),
        ));
    }

    let (delay_secs, duration_secs) = if phase == 0 {
        (device.t0, device.t1)
    } else {
        (device.t1, device.t2.saturating_sub(device.t1))
    };

    iperf::validate_token(&device.remote.address)
        .map_err(|reason| device.invalid("remote", reason))?;
    let remote_ip = device.remote.address.as_str();
    let params = &device.phases[usize::from(phase)];
    let udp = device.traffic_type == TrafficType::Udp;

    // Looks up a per-phase value that only UDP tests need.
    let phase_value = |name: &str, value: &Option<String>| -> Result<Option<String>, ConfigError> {
        if !udp {
            return Ok(None);
        }
        let key = format!("t{}_{}", phase, name);
        let value = value.as_deref().ok_or_else(|| device.missing_key(&key))?;
        iperf::validate_token(value).map_err(|reason| device.invalid(&key, reason))?;
        Ok(Some(value.to_string()))
    };

    let port = |direction| {
        iperf::port_for(direction, phase, device.device_id).ok_or_else(|| {
            device.invalid(
                "device_id",
                format!("{} port for phase {} overflows", direction, phase),
            )
        })
    };

    let downlink = if device.test_type.downlink() {
        let port = port(Direction::Downlink)?;
        let bandwidth = phase_value("dl_throughput", &params.dl_throughput)?;
        let len = phase_value("dl_len", &params.dl_len)?;
        let shape = bandwidth
            .as_deref()
            .zip(len.as_deref())
            .map(|(bandwidth, len)| UdpShape { bandwidth, len });
        Some(DirectionCommands {
            port,
            client: iperf::downlink_client(tool, port, local_ip, remote_ip, duration_secs, shape),
            server: iperf::downlink_server(tool, port, local_ip, len.as_deref()),
            remote_kill: iperf::remote_kill(tool, Direction::Downlink, port),
        })
    } else {
        None
    };

    let uplink = if device.test_type.uplink() {
        let port = port(Direction::Uplink)?;
        let bandwidth = phase_value("ul_throughput", &params.ul_throughput)?;
        let len = phase_value("ul_len", &params.ul_len)?;
        let shape = bandwidth
            .as_deref()
            .zip(len.as_deref())
            .map(|(bandwidth, len)| UdpShape { bandwidth, len });
        Some(DirectionCommands {
            port,
            client: iperf::uplink_client(tool, port, local_ip, remote_ip, duration_secs, shape),
            server: iperf::uplink_server(tool, port, len.as_deref()),
            remote_kill: iperf::remote_kill(tool, Direction::Uplink, port),
        })
    } else {
        None
    };

    Ok(PhaseDescriptor {
        device: device.adapter.clone(),
        device_id: device.device_id,
        phase,
        delay_secs,
        duration_secs,
        traffic_type: device.traffic_type,
        local_ip,
        remote: device.remote.clone(),
        downlink,
        uplink,
        logs: None,
    })
}

/// Compile every phase `device` runs: phase 0, plus phase 1 for UDP.
pub fn compile_device(
    device: &DeviceConfig,
    local_ip: Ipv4Addr,
    tool: &str,
) -> Result<Vec<PhaseDescriptor>, ConfigError> {
    (0..device.traffic_type.phase_count())
        .map(|phase| compile(device, local_ip, phase, tool))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::{DeviceSection, PhaseParams, TestType};

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    fn device(
        adapter: &str,
        test_type: TestType,
        traffic_type: TrafficType,
        times: (u64, u64, u64),
    ) -> DeviceConfig {
        let params = PhaseParams {
            dl_throughput: Some("10M".into()),
            dl_len: Some("1400".into()),
            ul_throughput: Some("2M".into()),
            ul_len: Some("1200".into()),
        };
        DeviceConfig {
            section: format!("{}-section", adapter),
            adapter: adapter.to_string(),
            address: None,
            test_type,
            traffic_type,
            remote: RemoteEndpoint {
                address: "10.0.0.1".into(),
                username: "tester".into(),
                password: Some("secret".into()),
            },
            device_id: 1,
            t0: times.0,
            t1: times.1,
            t2: times.2,
            phases: [params.clone(), params],
        }
    }

    #[test]
    fn test_scenario_sim_tcp_single_phase() {
        let dev = device("eth0", TestType::Sim, TrafficType::Tcp, (0, 10, 10));
        let phases = compile_device(&dev, LOCAL, "iperf").unwrap();

        assert_eq!(phases.len(), 1);
        let p0 = &phases[0];
        assert_eq!(p0.phase, 0);
        assert_eq!(p0.duration_secs, 10);
        assert_eq!(p0.delay_secs, 0);

        let dl = p0.downlink.as_ref().unwrap();
        let ul = p0.uplink.as_ref().unwrap();
        for cmd in [&dl.client, &dl.server, &ul.client, &ul.server] {
            assert!(!cmd.contains(" -b "), "TCP command has bandwidth flag: {cmd}");
            assert!(!cmd.contains(" -l "), "TCP command has length flag: {cmd}");
            assert!(!cmd.contains(" -u"), "TCP command has UDP flag: {cmd}");
        }
    }

    #[test]
    fn test_scenario_dl_udp_two_phases() {
        let dev = device("eth1", TestType::Dl, TrafficType::Udp, (0, 5, 15));
        let phases = compile_device(&dev, LOCAL, "iperf").unwrap();

        assert_eq!(phases.len(), 2);
        assert_eq!((phases[0].delay_secs, phases[0].duration_secs), (0, 5));
        assert_eq!((phases[1].delay_secs, phases[1].duration_secs), (5, 10));

        for p in &phases {
            assert!(p.uplink.is_none());
            let dl = p.downlink.as_ref().unwrap();
            assert!(dl.client.contains(" -b 10M "));
            assert!(dl.client.contains(" -l 1400 "));
            assert!(dl.server.contains(" -l 1400 "));
            assert!(dl.client.contains(&format!(" -t {} ", p.duration_secs)));
        }
    }

    #[test]
    fn test_compile_is_idempotent() {
        let dev = device("eth0", TestType::Sim, TrafficType::Udp, (2, 5, 15));
        let first = compile_device(&dev, LOCAL, "iperf").unwrap();
        let second = compile_device(&dev, LOCAL, "iperf").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ports_never_collide_across_devices_and_phases() {
        let mut seen = HashSet::new();
        for id in 0..30u32 {
            let mut dev = device("eth0", TestType::Sim, TrafficType::Udp, (0, 5, 15));
            dev.device_id = id;
            for p in compile_device(&dev, LOCAL, "iperf").unwrap() {
                for port in p.ports() {
                    assert!(
                        seen.insert(port),
                        "port {port} reused (device {id}, phase {})",
                        p.phase
                    );
                }
            }
        }
        assert_eq!(seen.len(), 30 * 2 * 2);
    }

    #[test]
    fn test_tcp_has_no_phase_one() {
        let dev = device("eth0", TestType::Dl, TrafficType::Tcp, (0, 10, 10));
        assert!(compile(&dev, LOCAL, 1, "iperf").is_err());
    }

    #[test]
    fn test_missing_udp_param_names_key() {
        let mut dev = device("eth0", TestType::Ul, TrafficType::Udp, (0, 5, 15));
        dev.phases[1].ul_len = None;

        assert!(compile(&dev, LOCAL, 0, "iperf").is_ok());
        let err = compile_device(&dev, LOCAL, "iperf").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { ref key, .. } if key == "t1_ul_len"));
    }

    #[test]
    fn test_tcp_does_not_need_udp_params() {
        let mut dev = device("eth0", TestType::Sim, TrafficType::Tcp, (0, 10, 10));
        dev.phases = [PhaseParams::default(), PhaseParams::default()];
        assert!(compile_device(&dev, LOCAL, "iperf").is_ok());
    }

    #[test]
    fn test_unsafe_remote_address_rejected() {
        let mut dev = device("eth0", TestType::Dl, TrafficType::Tcp, (0, 10, 10));
        dev.remote.address = "10.0.0.1;reboot".into();
        assert!(compile(&dev, LOCAL, 0, "iperf").is_err());
    }

    #[test]
    fn test_log_paths() {
        let dev = device("eth0", TestType::Dl, TrafficType::Tcp, (0, 10, 10));
        let p0 = compile(&dev, LOCAL, 0, "iperf")
            .unwrap()
            .with_logs(Path::new("/tmp/run/eth0_x"), "Lab-");
        let logs = p0.logs.as_ref().unwrap();
        assert_eq!(
            logs.path(Direction::Downlink, Role::Server),
            PathBuf::from("/tmp/run/eth0_x/Lab-eth0_Phase0_dl_server.log")
        );
        assert_eq!(p0.label(), "eth0-phase0");
    }

    #[test]
    fn test_log_stem_sanitizes_adapter() {
        let dev = device("usb/0:1", TestType::Dl, TrafficType::Tcp, (0, 10, 10));
        let p0 = compile(&dev, LOCAL, 0, "iperf")
            .unwrap()
            .with_logs(Path::new("/tmp/run/usb_0_1_x"), "Lab-");

        let logs = p0.logs.as_ref().unwrap();
        assert_eq!(logs.stem, "Lab-usb_0_1_Phase0");
        assert_eq!(
            logs.path(Direction::Downlink, Role::Client).parent(),
            Some(Path::new("/tmp/run/usb_0_1_x"))
        );
        // The report still names the adapter as configured.
        assert_eq!(p0.label(), "usb/0:1-phase0");
    }

    #[test]
    fn test_from_parsed_section() {
        let section = DeviceSection {
            name: "ue9".into(),
            table: r#"
adapter = "wwan0"
test_type = "UL"
traffic_type = "TCP"
remote = ["10.9.9.9", "root", ""]
device_id = 9
t0 = 1
t1 = 20
t2 = 20
"#
            .parse()
            .unwrap(),
        };
        let dev = section.to_device().unwrap();
        let phases = compile_device(&dev, LOCAL, "iperf").unwrap();
        assert_eq!(phases.len(), 1);
        let ul = phases[0].uplink.as_ref().unwrap();
        assert_eq!(ul.port, 5099);
        assert_eq!(
            ul.client,
            "iperf -p 5099 -c 10.9.9.9 -t 20 -B 192.168.1.10 -i 1 -P 1 -f k -w 8M"
        );
    }
}
