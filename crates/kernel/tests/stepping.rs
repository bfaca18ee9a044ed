mod common;

use approx::assert_abs_diff_eq;
use glam::DVec3;
use robosim_common::Twist;
use robosim_kernel::SimError;

use common::{backends, ball, empty_world, load_scene, BALLS_SCENE, PENDULUM_SCENE};

#[test]
fn time_is_exact_regardless_of_batching() {
    for engine in backends() {
        let mut batched = empty_world(&engine);
        let mut single = empty_world(&engine);
        batched.add_model(&ball("ball", DVec3::Z)).unwrap();
        single.add_model(&ball("ball", DVec3::Z)).unwrap();

        batched.step(250).unwrap();
        for _ in 0..250 {
            single.step(1).unwrap();
        }
        assert_eq!(batched.iterations(), 250, "{engine}");
        assert_eq!(batched.sim_time(), 250.0 * 0.001, "{engine}");
        assert_eq!(single.sim_time(), batched.sim_time(), "{engine}");
        assert_eq!(single.state_hash(), batched.state_hash(), "{engine}");
    }
}

#[test]
fn free_fall_matches_ballistics() {
    for engine in backends() {
        let mut w = empty_world(&engine);
        let id = w.add_model(&ball("ball", DVec3::new(0.0, 0.0, 10.0))).unwrap();
        let link = w.model_by_id(id).unwrap().links()[0];

        w.step(1000).unwrap();
        let sample = w.link_sample(link).unwrap();
        let t = sample.time;
        assert_abs_diff_eq!(t, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(sample.pose.position.z, 10.0 - 0.5 * 9.81 * t * t, epsilon = 1e-2);
        assert_abs_diff_eq!(sample.twist.linear.z, -9.81 * t, epsilon = 1e-6);
        assert_abs_diff_eq!(sample.pose.position.x, 0.0, epsilon = 1e-12);
    }
}

#[test]
fn identical_runs_hash_identically() {
    for engine in backends() {
        let run = || {
            let mut w = load_scene(BALLS_SCENE, &engine);
            w.step(400).unwrap();
            w.state_hash()
        };
        assert_eq!(run(), run(), "{engine}");
    }
}

#[test]
fn pendulum_run_is_deterministic() {
    for engine in backends() {
        let mut a = load_scene(PENDULUM_SCENE, &engine);
        let mut b = load_scene(PENDULUM_SCENE, &engine);
        let start = a.state_hash();
        a.step(300).unwrap();
        b.step(300).unwrap();
        assert_ne!(a.state_hash(), start, "{engine}");
        assert_eq!(a.state_hash(), b.state_hash(), "{engine}");
    }
}

#[test]
fn divergence_is_reported_and_sticky() {
    for engine in backends() {
        let mut w = empty_world(&engine);
        let id = w.add_model(&ball("ball", DVec3::Z)).unwrap();
        let link = w.model_by_id(id).unwrap().links()[0];
        w.step(5).unwrap();
        let time = w.sim_time();

        w.set_link_velocity(link, Twist::new(DVec3::new(1.0e9, 0.0, 0.0), DVec3::ZERO))
            .unwrap();
        let err = w.step(10).unwrap_err();
        assert!(matches!(err, SimError::SimulationDiverged(_)), "{engine}: {err}");
        assert!(w.is_diverged());
        assert_eq!(w.sim_time(), time, "{engine}: diverged step must not commit");
        assert!(matches!(w.step(1), Err(SimError::SimulationDiverged(_))));

        w.reset().unwrap();
        assert!(!w.is_diverged());
        w.step(1).unwrap();
    }
}

#[test]
fn rebinding_mid_run_keeps_the_trajectory_continuous() {
    let mut w = empty_world("xpbd");
    let id = w.add_model(&ball("ball", DVec3::new(0.0, 0.0, 5.0))).unwrap();
    let link = w.model_by_id(id).unwrap().links()[0];
    w.step(200).unwrap();
    let before = w.link_sample(link).unwrap();

    w.rebind_engine("articulated").unwrap();
    assert_eq!(w.engine_kind(), "articulated");
    let after = w.link_sample(link).unwrap();
    assert_eq!(after.pose, before.pose);
    assert_eq!(after.twist, before.twist);
    assert_eq!(after.time, before.time);

    w.step(200).unwrap();
    let end = w.link_sample(link).unwrap();
    assert!(end.pose.position.z < before.pose.position.z);
    assert!(end.twist.linear.z < before.twist.linear.z);
}
