//! Packet size probe against a simulated network path.

mod common;

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Mutex;

use async_trait::async_trait;
use gev_device::{features, mtu, Genapi, GevError, IntegerBounds, NodeDefault};

/// Evaluator faking the stream-channel features: firing the test packet
/// sends a real datagram to the configured host port, but only when the
/// configured size fits through the simulated path.
struct FireGenapi {
    state: Mutex<FireState>,
    socket: UdpSocket,
    bounds: IntegerBounds,
    /// Largest packet size the path delivers.
    path_limit: u32,
    /// Model the feature as a command instead of a boolean toggle.
    as_command: bool,
}

struct FireState {
    integers: HashMap<&'static str, i64>,
    booleans: HashMap<&'static str, bool>,
    /// Sizes whose test packet was delivered.
    delivered: Vec<u32>,
    probes: u32,
}

impl FireGenapi {
    fn new(bounds: IntegerBounds, current: u32, path_limit: u32, as_command: bool) -> Self {
        let mut integers = HashMap::new();
        integers.insert(features::SCPS_PACKET_SIZE, i64::from(current));
        let mut booleans = HashMap::new();
        booleans.insert(features::SCPS_DO_NOT_FRAGMENT, false);
        booleans.insert(features::SCPS_FIRE_TEST_PACKET, false);
        Self {
            state: Mutex::new(FireState {
                integers,
                booleans,
                delivered: Vec::new(),
                probes: 0,
            }),
            socket: UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind fire socket"),
            bounds,
            path_limit,
            as_command,
        }
    }

    fn fire(&self) {
        let mut state = self.state.lock().expect("state lock");
        state.probes += 1;
        let size = state.integers[features::SCPS_PACKET_SIZE] as u32;
        let port = state.integers[features::SCP_HOST_PORT] as u16;
        if size > self.path_limit {
            return;
        }
        state.delivered.push(size);
        let datagram = vec![0u8; (size - 28) as usize];
        let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        self.socket.send_to(&datagram, dest).expect("send test packet");
    }

    fn delivered(&self) -> Vec<u32> {
        self.state.lock().expect("state lock").delivered.clone()
    }

    fn probes(&self) -> u32 {
        self.state.lock().expect("state lock").probes
    }

    fn integer_value(&self, name: &'static str) -> i64 {
        self.state.lock().expect("state lock").integers[name]
    }

    fn boolean_value(&self, name: &'static str) -> bool {
        self.state.lock().expect("state lock").booleans[name]
    }
}

#[async_trait]
impl Genapi for FireGenapi {
    fn is_defined(&self, _name: &str) -> bool {
        true
    }

    fn is_command(&self, name: &str) -> bool {
        self.as_command && name == features::SCPS_FIRE_TEST_PACKET
    }

    fn define_default(&self, _node: NodeDefault) {}

    async fn integer(&self, name: &str) -> Result<i64, GevError> {
        let state = self.state.lock().expect("state lock");
        state
            .integers
            .get(name)
            .copied()
            .ok_or_else(|| GevError::Schema(format!("no integer {name}")))
    }

    async fn set_integer(&self, name: &str, value: i64) -> Result<(), GevError> {
        let key = match name {
            n if n == features::SCPS_PACKET_SIZE => features::SCPS_PACKET_SIZE,
            n if n == features::SCP_HOST_PORT => features::SCP_HOST_PORT,
            n if n == features::SCDA => features::SCDA,
            other => return Err(GevError::Schema(format!("no integer {other}"))),
        };
        self.state
            .lock()
            .expect("state lock")
            .integers
            .insert(key, value);
        Ok(())
    }

    async fn integer_bounds(&self, name: &str) -> Result<IntegerBounds, GevError> {
        if name == features::SCPS_PACKET_SIZE {
            Ok(self.bounds)
        } else {
            Err(GevError::Schema(format!("no bounds for {name}")))
        }
    }

    async fn boolean(&self, name: &str) -> Result<bool, GevError> {
        let state = self.state.lock().expect("state lock");
        state
            .booleans
            .get(name)
            .copied()
            .ok_or_else(|| GevError::Schema(format!("no boolean {name}")))
    }

    async fn set_boolean(&self, name: &str, value: bool) -> Result<(), GevError> {
        let key = match name {
            n if n == features::SCPS_DO_NOT_FRAGMENT => features::SCPS_DO_NOT_FRAGMENT,
            n if n == features::SCPS_FIRE_TEST_PACKET => features::SCPS_FIRE_TEST_PACKET,
            other => return Err(GevError::Schema(format!("no boolean {other}"))),
        };
        let rising = {
            let mut state = self.state.lock().expect("state lock");
            let previous = state.booleans.insert(key, value).unwrap_or(false);
            key == features::SCPS_FIRE_TEST_PACKET && value && !previous
        };
        if rising {
            self.fire();
        }
        Ok(())
    }

    async fn execute(&self, name: &str) -> Result<(), GevError> {
        if self.as_command && name == features::SCPS_FIRE_TEST_PACKET {
            self.fire();
            Ok(())
        } else {
            Err(GevError::Schema(format!("{name} is not a command")))
        }
    }
}

fn wide_bounds() -> IntegerBounds {
    IntegerBounds {
        min: 576,
        max: 9000,
        inc: 4,
    }
}

#[tokio::test]
async fn bisection_finds_the_path_limit() {
    let genapi = FireGenapi::new(wide_bounds(), 8000, 1500, false);
    let chosen = mtu::auto_packet_size(&genapi, Ipv4Addr::LOCALHOST, false)
        .await
        .expect("probe");

    assert_eq!(chosen, 1500);
    assert_eq!(genapi.integer_value(features::SCPS_PACKET_SIZE), 1500);
    // Accepted sizes grow monotonically and respect bounds and increment.
    let delivered = genapi.delivered();
    assert!(!delivered.is_empty());
    assert!(delivered.windows(2).all(|w| w[0] <= w[1]));
    assert!(delivered.iter().all(|&s| (576..=9000).contains(&s)));
    assert_eq!((chosen - 576) % 4, 0);
    // Do-not-fragment was forced and restored.
    assert!(!genapi.boolean_value(features::SCPS_DO_NOT_FRAGMENT));
}

#[tokio::test]
async fn command_style_fire_feature_works_too() {
    let genapi = FireGenapi::new(wide_bounds(), 8000, 1500, true);
    let chosen = mtu::auto_packet_size(&genapi, Ipv4Addr::LOCALHOST, false)
        .await
        .expect("probe");
    assert_eq!(chosen, 1500);
}

#[tokio::test]
async fn exit_early_keeps_a_working_current_size() {
    let genapi = FireGenapi::new(wide_bounds(), 1400, 1500, false);
    let chosen = mtu::auto_packet_size(&genapi, Ipv4Addr::LOCALHOST, true)
        .await
        .expect("probe");

    assert_eq!(chosen, 1400);
    assert_eq!(genapi.delivered(), vec![1400]);
    assert_eq!(genapi.probes(), 1);
}

#[tokio::test]
async fn exit_early_falls_back_to_bisection_on_failure() {
    // Current size does not traverse the path.
    let genapi = FireGenapi::new(wide_bounds(), 8000, 1500, false);
    let chosen = mtu::auto_packet_size(&genapi, Ipv4Addr::LOCALHOST, true)
        .await
        .expect("probe");
    assert_eq!(chosen, 1500);
    assert!(genapi.probes() > 1);
}

#[tokio::test]
async fn unusable_range_keeps_the_current_size() {
    let genapi = FireGenapi::new(
        IntegerBounds {
            min: 2000,
            max: 1000,
            inc: 4,
        },
        1400,
        1500,
        false,
    );
    let chosen = mtu::auto_packet_size(&genapi, Ipv4Addr::LOCALHOST, false)
        .await
        .expect("probe");
    assert_eq!(chosen, 1400);
    assert_eq!(genapi.probes(), 0);
}
