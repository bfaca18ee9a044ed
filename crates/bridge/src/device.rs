use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::BridgeError;

/// Device interfaces a protocol adapter can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// World clock and iteration counter. Not bound to a link.
    Simulation,
    /// Planar base: pose and velocity, accepts wrenches.
    Position2d,
    /// Free-floating body: pose and velocity, accepts wrenches.
    Position3d,
    /// Ground-truth pose. Read-only.
    Truth,
}

impl InterfaceKind {
    pub const ALL: [InterfaceKind; 4] = [
        InterfaceKind::Simulation,
        InterfaceKind::Position2d,
        InterfaceKind::Position3d,
        InterfaceKind::Truth,
    ];

    pub fn name(self) -> &'static str {
        match self {
            InterfaceKind::Simulation => "simulation",
            InterfaceKind::Position2d => "position2d",
            InterfaceKind::Position3d => "position3d",
            InterfaceKind::Truth => "truth",
        }
    }

    pub fn is_link_bound(self) -> bool {
        self != InterfaceKind::Simulation
    }

    pub fn accepts_commands(self) -> bool {
        matches!(self, InterfaceKind::Position2d | InterfaceKind::Position3d)
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InterfaceKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InterfaceKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| BridgeError::UnknownInterface(s.to_string()))
    }
}

/// `robot:interface:index` device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddr {
    pub robot: String,
    pub interface: InterfaceKind,
    pub index: u16,
}

impl DeviceAddr {
    pub fn new(robot: impl Into<String>, interface: InterfaceKind, index: u16) -> Self {
        Self {
            robot: robot.into(),
            interface,
            index,
        }
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.robot, self.interface, self.index)
    }
}

impl FromStr for DeviceAddr {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || BridgeError::BadAddress(s.to_string());
        let mut parts = s.split(':');
        let (Some(robot), Some(interface), Some(index), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(bad());
        };
        if robot.is_empty() {
            return Err(bad());
        }
        Ok(Self {
            robot: robot.to_string(),
            interface: interface.parse()?,
            index: index.parse().map_err(|_| bad())?,
        })
    }
}

impl TryFrom<String> for DeviceAddr {
    type Error = BridgeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DeviceAddr> for String {
    fn from(addr: DeviceAddr) -> Self {
        addr.to_string()
    }
}

/// What a device reads from and writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    /// `(scoped model name, link name)`; `None` for simulation devices.
    pub link: Option<(String, String)>,
    subscribers: u32,
}

impl DeviceBinding {
    pub fn subscribers(&self) -> u32 {
        self.subscribers
    }
}

/// Devices known to a bridge, ordered by address.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceTable {
    devices: BTreeMap<DeviceAddr, DeviceBinding>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one binding per line: `robot:interface:index [model link]`.
    /// Blank lines and `#` comments are skipped. Simulation devices take no
    /// link; every other interface requires one.
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        let mut table = Self::new();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let addr: DeviceAddr = fields[0].parse()?;
            match fields[1..] {
                [] => table.bind_simulation(addr)?,
                [model, link] => table.bind(addr, model, link)?,
                _ => return Err(BridgeError::BadAddress(line.to_string())),
            }
        }
        Ok(table)
    }

    /// Bind a link-backed device to `model`'s `link`.
    pub fn bind(&mut self, addr: DeviceAddr, model: &str, link: &str) -> Result<(), BridgeError> {
        if !addr.interface.is_link_bound() {
            return Err(BridgeError::BadAddress(format!(
                "{addr} cannot be bound to a link"
            )));
        }
        self.insert(addr, Some((model.to_string(), link.to_string())))
    }

    pub fn bind_simulation(&mut self, addr: DeviceAddr) -> Result<(), BridgeError> {
        if addr.interface.is_link_bound() {
            return Err(BridgeError::Unbound(addr));
        }
        self.insert(addr, None)
    }

    fn insert(
        &mut self,
        addr: DeviceAddr,
        link: Option<(String, String)>,
    ) -> Result<(), BridgeError> {
        if self.devices.contains_key(&addr) {
            return Err(BridgeError::DuplicateDevice(addr));
        }
        self.devices.insert(
            addr,
            DeviceBinding {
                link,
                subscribers: 0,
            },
        );
        Ok(())
    }

    pub fn get(&self, addr: &DeviceAddr) -> Result<&DeviceBinding, BridgeError> {
        self.devices
            .get(addr)
            .ok_or_else(|| BridgeError::UnknownDevice(addr.clone()))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceAddr, &DeviceBinding)> {
        self.devices.iter()
    }

    /// Devices with at least one subscriber, in address order.
    pub fn subscribed(&self) -> impl Iterator<Item = (&DeviceAddr, &DeviceBinding)> {
        self.devices.iter().filter(|(_, b)| b.subscribers > 0)
    }

    /// Returns the new subscriber count.
    pub fn subscribe(&mut self, addr: &DeviceAddr) -> Result<u32, BridgeError> {
        let binding = self
            .devices
            .get_mut(addr)
            .ok_or_else(|| BridgeError::UnknownDevice(addr.clone()))?;
        binding.subscribers += 1;
        Ok(binding.subscribers)
    }

    /// Returns the remaining subscriber count.
    pub fn unsubscribe(&mut self, addr: &DeviceAddr) -> Result<u32, BridgeError> {
        let binding = self
            .devices
            .get_mut(addr)
            .ok_or_else(|| BridgeError::UnknownDevice(addr.clone()))?;
        if binding.subscribers == 0 {
            return Err(BridgeError::NotSubscribed(addr.clone()));
        }
        binding.subscribers -= 1;
        Ok(binding.subscribers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parses_and_prints() {
        let addr: DeviceAddr = "pioneer:position2d:0".parse().unwrap();
        assert_eq!(addr, DeviceAddr::new("pioneer", InterfaceKind::Position2d, 0));
        assert_eq!(addr.to_string(), "pioneer:position2d:0");
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for bad in ["", "pioneer", "pioneer:truth", ":truth:0", "a:truth:x", "a:truth:0:1"] {
            assert!(
                matches!(bad.parse::<DeviceAddr>(), Err(BridgeError::BadAddress(_))),
                "{bad}"
            );
        }
        assert_eq!(
            "a:sonar:0".parse::<DeviceAddr>(),
            Err(BridgeError::UnknownInterface("sonar".into()))
        );
    }

    #[test]
    fn table_parses_bindings() {
        let table = DeviceTable::parse(
            "# devices\n\
             sim:simulation:0\n\
             pioneer:position2d:0  pioneer  chassis\n\
             pioneer:truth:0       pioneer  chassis  # ground truth\n",
        )
        .unwrap();
        assert_eq!(table.len(), 3);
        let truth = table.get(&"pioneer:truth:0".parse().unwrap()).unwrap();
        assert_eq!(truth.link, Some(("pioneer".into(), "chassis".into())));
        assert_eq!(
            table.get(&"sim:simulation:0".parse().unwrap()).unwrap().link,
            None
        );
    }

    #[test]
    fn table_rejects_inconsistent_bindings() {
        assert!(matches!(
            DeviceTable::parse("pioneer:truth:0"),
            Err(BridgeError::Unbound(_))
        ));
        assert!(matches!(
            DeviceTable::parse("sim:simulation:0 world ground"),
            Err(BridgeError::BadAddress(_))
        ));
        assert!(matches!(
            DeviceTable::parse("p:truth:0 p a\np:truth:0 p b"),
            Err(BridgeError::DuplicateDevice(_))
        ));
    }

    #[test]
    fn subscription_counts() {
        let mut table = DeviceTable::parse("sim:simulation:0").unwrap();
        let addr: DeviceAddr = "sim:simulation:0".parse().unwrap();
        assert_eq!(table.subscribe(&addr).unwrap(), 1);
        assert_eq!(table.subscribe(&addr).unwrap(), 2);
        assert_eq!(table.subscribed().count(), 1);
        assert_eq!(table.unsubscribe(&addr).unwrap(), 1);
        assert_eq!(table.unsubscribe(&addr).unwrap(), 0);
        assert_eq!(
            table.unsubscribe(&addr),
            Err(BridgeError::NotSubscribed(addr.clone()))
        );
        assert_eq!(table.subscribed().count(), 0);
    }
}
