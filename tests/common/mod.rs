//! In-memory launcher and connector that record what a phase does.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io::Cursor;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use loadtest::config::{DeviceConfig, PhaseParams, RemoteEndpoint, TestType, TrafficType};
use loadtest::remote::{RemoteCommand, RemoteConnector, RemoteError, RemoteSession};
use loadtest::storage::LogSink;
use loadtest::throughput::{LocalProcess, ProcessLauncher, SpawnError};

pub const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

/// Ordered record of every action taken against the mocks.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.position(entry).is_some()
    }
}

#[derive(Clone, Default)]
pub struct MockLauncher {
    pub journal: Journal,
    /// Commands that fail to spawn.
    pub fail: HashSet<String>,
    /// When set, local clients keep running past their duration.
    pub lingering_clients: bool,
}

impl ProcessLauncher for MockLauncher {
    fn spawn(&self, command: &str, _sink: &LogSink) -> Result<Box<dyn LocalProcess>, SpawnError> {
        self.journal.push(format!("spawn {}", command));
        if self.fail.contains(command) {
            return Err(SpawnError::Spawn {
                command: command.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary"),
            });
        }
        let server = command.contains(" -s ");
        Ok(Box::new(MockProcess {
            command: command.to_string(),
            journal: self.journal.clone(),
            exited: !server && !self.lingering_clients,
        }))
    }
}

struct MockProcess {
    command: String,
    journal: Journal,
    exited: bool,
}

#[async_trait]
impl LocalProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn has_exited(&mut self) -> bool {
        self.exited
    }

    async fn kill(&mut self) {
        self.journal.push(format!("kill {}", self.command));
        self.exited = true;
    }

    async fn terminate(&mut self, _grace: Duration) {
        self.journal.push(format!("terminate {}", self.command));
        self.exited = true;
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    pub journal: Journal,
    /// Hosts that refuse connections.
    pub unreachable: HashSet<String>,
    /// How long a connect takes before it answers.
    pub connect_delay: Duration,
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn connect(
        &self,
        endpoint: &RemoteEndpoint,
    ) -> Result<Box<dyn RemoteSession>, RemoteError> {
        self.journal.push(format!("connect {}", endpoint.address));
        tokio::time::sleep(self.connect_delay).await;
        if self.unreachable.contains(&endpoint.address) {
            return Err(RemoteError::Connect {
                host: endpoint.address.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(Box::new(MockSession {
            host: endpoint.address.clone(),
            journal: self.journal.clone(),
        }))
    }
}

struct MockSession {
    host: String,
    journal: Journal,
}

#[async_trait]
impl RemoteSession for MockSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn exec(&mut self, command: &str) -> Result<RemoteCommand, RemoteError> {
        self.journal.push(format!("exec {}", command));
        let output = format!("remote output of {}\n", command);
        Ok(RemoteCommand::from_reader(command, Cursor::new(output.into_bytes())))
    }

    async fn run(&mut self, command: &str, _timeout: Duration) -> Result<(), RemoteError> {
        self.journal.push(format!("run {}", command));
        Ok(())
    }

    async fn close(&mut self) {
        self.journal.push(format!("close {}", self.host));
    }
}

pub fn device(
    adapter: &str,
    device_id: u32,
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
        section: adapter.to_string(),
        adapter: adapter.to_string(),
        address: Some(LOCAL_IP),
        test_type,
        traffic_type,
        remote: RemoteEndpoint {
            address: "10.0.0.1".into(),
            username: "tester".into(),
            password: None,
        },
        device_id,
        t0: times.0,
        t1: times.1,
        t2: times.2,
        phases: [params.clone(), params],
    }
}
