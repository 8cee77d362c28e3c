//! iperf (v2) command strings and the kill strings that stop them remotely.
//!
//! The flag layout here is what the far side of every test expects, so the
//! strings are built token by token and never reordered.

use std::net::Ipv4Addr;

use super::Direction;

pub const BASE_PORT: u32 = 5000;
pub const DOWNLINK_PORT_STRIDE: u32 = 30;
pub const UPLINK_PORT_STRIDE: u32 = 90;

/// Fixed tuning flags for a sending client: 1s reports, one stream, kbit
/// units, 8M window.
const CLIENT_TUNING: &[&str] = &["-i", "1", "-P", "1", "-f", "k", "-w", "8M"];
/// Same for a listening server; `-P 0` keeps it up until killed.
const SERVER_TUNING: &[&str] = &["-i", "1", "-P", "0", "-f", "k", "-w", "8M"];

/// Port for one direction of one phase of one device.
///
/// `None` when the result does not fit in a port number.
pub fn port_for(direction: Direction, phase: u8, device_id: u32) -> Option<u16> {
    let stride = match direction {
        Direction::Downlink => DOWNLINK_PORT_STRIDE,
        Direction::Uplink => UPLINK_PORT_STRIDE,
    };
    let port = BASE_PORT
        .checked_add((u32::from(phase) + 1) * stride)?
        .checked_add(device_id)?;
    u16::try_from(port).ok()
}

/// UDP-only parameters; `None` in the builders below means a TCP test.
#[derive(Debug, Clone, Copy)]
pub struct UdpShape<'a> {
    pub bandwidth: &'a str,
    pub len: &'a str,
}

/// Token-by-token command line builder.
#[derive(Debug, Default)]
struct Args(Vec<String>);

impl Args {
    fn new(tool: &str) -> Self {
        Self(vec![tool.to_string()])
    }

    fn flag(mut self, flag: &str) -> Self {
        self.0.push(flag.to_string());
        self
    }

    fn opt(mut self, flag: &str, value: impl ToString) -> Self {
        self.0.push(flag.to_string());
        self.0.push(value.to_string());
        self
    }

    fn tuning(mut self, tuning: &[&str]) -> Self {
        self.0.extend(tuning.iter().map(|t| t.to_string()));
        self
    }

    fn build(self) -> String {
        self.0.join(" ")
    }
}

/// Downlink client, run on the remote host, sending to the device.
pub fn downlink_client(
    tool: &str,
    port: u16,
    local_ip: Ipv4Addr,
    remote_ip: &str,
    duration_secs: u64,
    udp: Option<UdpShape<'_>>,
) -> String {
    let mut args = Args::new(tool)
        .opt("-p", port)
        .opt("-c", local_ip)
        .opt("-t", duration_secs);
    if let Some(udp) = udp {
        args = args.opt("-b", udp.bandwidth).opt("-l", udp.len);
    }
    args = args.opt("-B", remote_ip);
    if udp.is_some() {
        args = args.flag("-u");
    }
    args.tuning(CLIENT_TUNING).build()
}

/// Downlink server, run locally, bound to the device address.
pub fn downlink_server(tool: &str, port: u16, local_ip: Ipv4Addr, udp_len: Option<&str>) -> String {
    let mut args = Args::new(tool).flag("-s").opt("-p", port).opt("-B", local_ip);
    if let Some(len) = udp_len {
        args = args.opt("-l", len).flag("-u").flag("-U");
    }
    args.tuning(SERVER_TUNING).build()
}

/// Uplink server, run on the remote host.
pub fn uplink_server(tool: &str, port: u16, udp_len: Option<&str>) -> String {
    let mut args = Args::new(tool).flag("-s").opt("-p", port);
    if let Some(len) = udp_len {
        args = args.opt("-l", len).flag("-u").flag("-U");
    }
    args.tuning(SERVER_TUNING).build()
}

/// Uplink client, run locally from the device address to the remote host.
pub fn uplink_client(
    tool: &str,
    port: u16,
    local_ip: Ipv4Addr,
    remote_ip: &str,
    duration_secs: u64,
    udp: Option<UdpShape<'_>>,
) -> String {
    let args = match udp {
        Some(udp) => Args::new(tool)
            .opt("-B", local_ip)
            .opt("-c", remote_ip)
            .opt("-t", duration_secs)
            .opt("-b", udp.bandwidth)
            .opt("-p", port)
            .opt("-l", udp.len)
            .flag("-u"),
        None => Args::new(tool)
            .opt("-p", port)
            .opt("-c", remote_ip)
            .opt("-t", duration_secs)
            .opt("-B", local_ip),
    };
    args.tuning(CLIENT_TUNING).build()
}

/// Shell snippet killing every process whose command line contains `pattern`.
pub fn kill_matching(pattern: &str) -> String {
    format!(
        "kill -9 `ps -ef | grep '{}' | grep -v grep | awk '{{print $2}}'`",
        pattern
    )
}

/// Kill string for the remote-side process of `direction`: the downlink
/// client or the uplink server.
pub fn remote_kill(tool: &str, direction: Direction, port: u16) -> String {
    match direction {
        Direction::Downlink => kill_matching(&format!("{} -p {}", tool, port)),
        Direction::Uplink => kill_matching(&format!("{} -s -p {}", tool, port)),
    }
}

/// Reject values that would change the meaning of a shell command line.
pub fn validate_token(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("value cannot be empty".to_string());
    }
    if value.starts_with('-') {
        return Err("value cannot start with a hyphen".to_string());
    }
    // Allow alphanumeric, dot, hyphen, colon (IPv6)
    if value
        .chars()
        .any(|c| !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != ':')
    {
        return Err(format!("'{}' contains invalid characters", value));
    }
    Ok(())
}
