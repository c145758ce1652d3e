//! Device constraints gating the participation in training cycles.
//!
//! The host feeds network and battery changes to a [`DeviceStateUpdater`]. The
//! [`ConstraintMonitor`] answers eligibility queries synchronously from the last known
//! state, so checks never wait on the device.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// Kind of the network the device is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    Wifi,
    Ethernet,
    Cellular,
}

impl Default for NetworkClass {
    fn default() -> Self {
        Self::Wifi
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkState {
    /// The active network, `None` when disconnected
    pub class: Option<NetworkClass>,
    /// Whether the network provides internet access
    pub internet: bool,
    pub metered: bool,
    /// Whether background data is restricted on this network
    pub restricted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatteryState {
    pub charging: bool,
    /// Charge level, in percent
    pub level: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub network: NetworkState,
    pub battery: BatteryState,
}

/// A change observed on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    NetworkChanged(NetworkState),
    NetworkLost,
    BatteryChanged(BatteryState),
    PowerConnected,
    PowerDisconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryPolicy {
    /// The battery is not checked
    Disabled,
    /// The device must be charging
    ChargingRequired,
    /// The device must be charging or above the given charge level, in percent
    MinimumCharge(u8),
}

impl Default for BatteryPolicy {
    fn default() -> Self {
        Self::ChargingRequired
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
/// The conditions under which the device takes part in training.
///
/// **Note**: with `transport_medium = "wifi"`, cellular networks are never eligible.
/// With `"cellular"`, any connected network is.
pub struct ConstraintPolicy {
    #[serde(default)]
    pub transport_medium: NetworkClass,
    /// Whether metered networks are eligible
    #[serde(default)]
    pub allow_metered: bool,
    #[serde(default)]
    pub battery: BatteryPolicy,
}

impl ConstraintPolicy {
    pub fn allows_network(&self, network: &NetworkState) -> bool {
        let medium = match (network.class, self.transport_medium) {
            (None, _) => false,
            (Some(NetworkClass::Cellular), NetworkClass::Cellular) => true,
            (Some(NetworkClass::Cellular), _) => false,
            (Some(_), _) => true,
        };
        medium && network.internet && !network.restricted && (self.allow_metered || !network.metered)
    }

    pub fn allows_battery(&self, battery: &BatteryState) -> bool {
        match self.battery {
            BatteryPolicy::Disabled => true,
            BatteryPolicy::ChargingRequired => battery.charging,
            BatteryPolicy::MinimumCharge(level) => battery.charging || battery.level >= level,
        }
    }
}

/// Answers eligibility queries from the last known device state.
#[derive(Debug, Clone)]
pub struct ConstraintMonitor {
    policy: ConstraintPolicy,
    state: watch::Receiver<DeviceState>,
}

/// Feeds device changes to the [`ConstraintMonitor`]s it was created with.
#[derive(Debug)]
pub struct DeviceStateUpdater(watch::Sender<DeviceState>);

impl ConstraintMonitor {
    pub fn new(policy: ConstraintPolicy, initial: DeviceState) -> (Self, DeviceStateUpdater) {
        let (tx, rx) = watch::channel(initial);
        (Self { policy, state: rx }, DeviceStateUpdater(tx))
    }

    pub fn policy(&self) -> &ConstraintPolicy {
        &self.policy
    }

    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    pub fn is_network_eligible(&self) -> bool {
        self.policy.allows_network(&self.state.borrow().network)
    }

    pub fn is_battery_eligible(&self) -> bool {
        self.policy.allows_battery(&self.state.borrow().battery)
    }
}

impl DeviceStateUpdater {
    pub fn apply(&self, event: DeviceEvent) {
        debug!("device event: {:?}", event);
        self.0.send_modify(|state| match event {
            DeviceEvent::NetworkChanged(network) => state.network = network,
            DeviceEvent::NetworkLost => state.network = NetworkState::default(),
            DeviceEvent::BatteryChanged(battery) => state.battery = battery,
            DeviceEvent::PowerConnected => state.battery.charging = true,
            DeviceEvent::PowerDisconnected => state.battery.charging = false,
        });
    }

    /// Apply every event of the stream until it ends.
    pub async fn follow<S>(self, mut events: S)
    where
        S: Stream<Item = DeviceEvent> + Unpin,
    {
        while let Some(event) = events.next().await {
            self.apply(event);
        }
        info!("device event stream ended, constraints are now frozen");
    }
}
