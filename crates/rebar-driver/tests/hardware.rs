//! Read-only checks against the live sysfs tree
//!
//! Run with `cargo test -- --ignored` on a machine carrying the configured
//! topology. Nothing here writes to the bus.

use rebar_driver::{diagnostics, BusPort, Config, SysfsBus};

#[test]
#[ignore] // Requires hardware
fn diagnose_live_topology() {
    let config = Config::load(None).expect("config");
    let bus = SysfsBus::from_paths(&config.paths);
    let snap = diagnostics::diagnose(&bus, &config);
    assert_eq!(snap.devices.len(), config.topology.gpu_devices().len());
    for device in &snap.devices {
        println!("{device}");
    }
    for bridge in &snap.bridges {
        println!("{bridge}");
    }
}

#[test]
#[ignore] // Requires hardware
fn driver_module_state_is_readable() {
    let config = Config::load(None).expect("config");
    let bus = SysfsBus::from_paths(&config.paths);
    println!(
        "{} loaded: {}",
        config.driver,
        bus.is_driver_loaded(&config.driver)
    );
    let tail = bus.kernel_log_tail(20).expect("dmesg");
    assert!(tail.len() <= 20);
}
