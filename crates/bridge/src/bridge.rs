use parking_lot::RwLock;
use robosim_common::{LinkId, Pose, Twist, Wrench};
use robosim_kernel::World;
use std::sync::Arc;

use crate::BridgeError;
use crate::device::{DeviceAddr, DeviceTable};

/// A world shared between the stepping thread and adapters.
pub type SharedWorld = Arc<RwLock<World>>;

pub fn shared(world: World) -> SharedWorld {
    Arc::new(RwLock::new(world))
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadingData {
    Simulation { sim_time: f64, iterations: u64 },
    Body { pose: Pose, twist: Twist },
}

/// One polled device state.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub addr: DeviceAddr,
    pub sim_time: f64,
    pub data: ReadingData,
}

/// Serves device requests against a shared world.
#[derive(Debug)]
pub struct Bridge {
    world: SharedWorld,
    devices: DeviceTable,
}

impl Bridge {
    pub fn new(world: SharedWorld, devices: DeviceTable) -> Self {
        Self { world, devices }
    }

    pub fn world(&self) -> &SharedWorld {
        &self.world
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub fn sim_time(&self) -> f64 {
        self.world.read().sim_time()
    }

    pub fn pose(&self, addr: &DeviceAddr) -> Result<Pose, BridgeError> {
        let world = self.world.read();
        let id = self.link_of(&world, addr)?;
        Ok(world.link_sample(id)?.pose)
    }

    pub fn twist(&self, addr: &DeviceAddr) -> Result<Twist, BridgeError> {
        let world = self.world.read();
        let id = self.link_of(&world, addr)?;
        Ok(world.link_sample(id)?.twist)
    }

    /// Queue a wrench on the device's link for the next sub-step.
    pub fn apply_wrench(&self, addr: &DeviceAddr, wrench: Wrench) -> Result<(), BridgeError> {
        if !addr.interface.accepts_commands() {
            self.devices.get(addr)?;
            return Err(BridgeError::ReadOnly(addr.clone()));
        }
        let mut world = self.world.write();
        let id = self.link_of(&world, addr)?;
        world.apply_force(id, wrench.force, wrench.torque)?;
        Ok(())
    }

    pub fn subscribe(&mut self, addr: &DeviceAddr) -> Result<u32, BridgeError> {
        let count = self.devices.subscribe(addr)?;
        tracing::debug!(device = %addr, count, "subscribed");
        Ok(count)
    }

    pub fn unsubscribe(&mut self, addr: &DeviceAddr) -> Result<u32, BridgeError> {
        let count = self.devices.unsubscribe(addr)?;
        tracing::debug!(device = %addr, count, "unsubscribed");
        Ok(count)
    }

    /// Read every subscribed device under one lock, in address order.
    pub fn poll(&self) -> Result<Vec<Reading>, BridgeError> {
        let world = self.world.read();
        let sim_time = world.sim_time();
        self.devices
            .subscribed()
            .map(|(addr, binding)| -> Result<Reading, BridgeError> {
                let data = match binding.link {
                    None => ReadingData::Simulation {
                        sim_time,
                        iterations: world.iterations(),
                    },
                    Some(_) => {
                        let sample = world.link_sample(self.link_of(&world, addr)?)?;
                        ReadingData::Body {
                            pose: sample.pose,
                            twist: sample.twist,
                        }
                    }
                };
                Ok(Reading {
                    addr: addr.clone(),
                    sim_time,
                    data,
                })
            })
            .collect()
    }

    fn link_of(&self, world: &World, addr: &DeviceAddr) -> Result<LinkId, BridgeError> {
        let binding = self.devices.get(addr)?;
        let (model, link) = binding
            .link
            .as_ref()
            .ok_or_else(|| BridgeError::Unbound(addr.clone()))?;
        Ok(world.link(model, link)?.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InterfaceKind;
    use approx::assert_abs_diff_eq;
    use glam::DVec3;
    use robosim_kernel::{
        CollisionDescription, EntityKind, Inertial, LinkDescription, ModelDescription, SimError,
        WorldConfig,
    };
    use robosim_physics::Shape;
    use std::thread;

    const DEVICES: &str = "\
        sim:simulation:0\n\
        rover:position3d:0  rover  chassis\n\
        rover:truth:0       rover  chassis\n\
        ghost:truth:0       ghost  body\n";

    fn rover_world() -> World {
        let config = WorldConfig {
            gravity: DVec3::ZERO,
            ..WorldConfig::default()
        };
        let mut world = World::new(config).unwrap();
        let shape = Shape::Box {
            size: DVec3::new(0.4, 0.3, 0.2),
        };
        world
            .add_model(
                &ModelDescription::new("rover")
                    .with_pose(Pose::from_position(DVec3::new(1.0, 2.0, 0.5)))
                    .with_link(
                        LinkDescription::new("chassis")
                            .with_inertial(Inertial::of_shape(2.0, &shape))
                            .with_collision(CollisionDescription::new("hull", shape)),
                    ),
            )
            .unwrap();
        world
    }

    fn bridge() -> Bridge {
        Bridge::new(shared(rover_world()), DeviceTable::parse(DEVICES).unwrap())
    }

    fn addr(s: &str) -> DeviceAddr {
        s.parse().unwrap()
    }

    #[test]
    fn reads_link_state() {
        let b = bridge();
        let pose = b.pose(&addr("rover:truth:0")).unwrap();
        assert_eq!(pose.position, DVec3::new(1.0, 2.0, 0.5));
        assert_eq!(b.twist(&addr("rover:position3d:0")).unwrap(), Twist::ZERO);
        assert_eq!(b.sim_time(), 0.0);
    }

    #[test]
    fn errors_name_the_failing_device() {
        let b = bridge();
        assert_eq!(
            b.pose(&addr("rover:truth:1")),
            Err(BridgeError::UnknownDevice(addr("rover:truth:1")))
        );
        assert_eq!(
            b.pose(&addr("sim:simulation:0")),
            Err(BridgeError::Unbound(addr("sim:simulation:0")))
        );
        assert_eq!(
            b.pose(&addr("ghost:truth:0")),
            Err(BridgeError::World(SimError::NotFound {
                kind: EntityKind::Model,
                name: "ghost".into()
            }))
        );
        assert_eq!(
            b.apply_wrench(&addr("rover:truth:0"), Wrench::ZERO),
            Err(BridgeError::ReadOnly(addr("rover:truth:0")))
        );
    }

    #[test]
    fn wrench_accelerates_the_bound_link() {
        let b = bridge();
        let device = addr("rover:position3d:0");
        b.apply_wrench(&device, Wrench::new(DVec3::new(4.0, 0.0, 0.0), DVec3::ZERO))
            .unwrap();
        b.world().write().step(1).unwrap();

        // a = F / m for one sub-step; the force is cleared afterwards.
        let v = b.twist(&device).unwrap().linear;
        assert_abs_diff_eq!(v.x, 2.0 * 0.001, epsilon = 1e-9);
        b.world().write().step(10).unwrap();
        assert_abs_diff_eq!(b.twist(&device).unwrap().linear.x, v.x, epsilon = 1e-9);
    }

    #[test]
    fn poll_reports_subscribed_devices_only() {
        let mut b = bridge();
        assert!(b.poll().unwrap().is_empty());

        b.subscribe(&addr("sim:simulation:0")).unwrap();
        b.subscribe(&addr("rover:truth:0")).unwrap();
        b.world().write().step(5).unwrap();

        let readings = b.poll().unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].addr.interface, InterfaceKind::Truth);
        assert!(matches!(readings[0].data, ReadingData::Body { .. }));
        assert_eq!(
            readings[1].data,
            ReadingData::Simulation {
                sim_time: 5.0 * 0.001,
                iterations: 5
            }
        );

        b.unsubscribe(&addr("rover:truth:0")).unwrap();
        assert_eq!(b.poll().unwrap().len(), 1);
    }

    #[test]
    fn readers_see_whole_steps_while_another_thread_steps() {
        let b = bridge();
        let world = Arc::clone(b.world());
        let stepper = thread::spawn(move || {
            for _ in 0..50 {
                world.write().step(4).unwrap();
            }
        });
        for _ in 0..50 {
            let t = b.sim_time();
            let steps = (t / 0.004).round();
            assert_abs_diff_eq!(t, steps * 0.004, epsilon = 1e-12);
        }
        stepper.join().unwrap();
        assert_abs_diff_eq!(b.sim_time(), 0.2, epsilon = 1e-12);
    }
}
