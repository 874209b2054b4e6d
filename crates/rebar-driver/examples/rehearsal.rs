//! Rehearse the procedure on a simulated bus
//!
//! Runs once cleanly, then again with one GPU that never comes back after
//! the rescan, to show the driver guard at work.

use rebar_chip::SizeIndex;
use rebar_driver::{diagnostics, BusOperator, BusPort, Config, MemoryBus, Result};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("rebar_driver=debug")
        .init();

    let config = Config::load(None)?;
    let start = SizeIndex::new(8).map_err(|e| rebar_driver::RebarError::config(e.to_string()))?;

    println!("Clean run\n");
    let mut bus = MemoryBus::from_config(&config, start);
    let before = diagnostics::snapshot(&bus, &config);
    let report = BusOperator::new(&mut bus, &config).run(&before)?;
    for phase in &report.phases {
        println!("  {phase}");
    }
    println!("  passed: {}\n", report.passed());

    println!("Lost GPU\n");
    let lost = &config.topology.gpu_devices()[0];
    let mut bus = MemoryBus::from_config(&config, start).with_lost_on_rescan(lost);
    let before = diagnostics::snapshot(&bus, &config);
    match BusOperator::new(&mut bus, &config).run(&before) {
        Ok(report) => println!("  unexpected success: {}", report.passed()),
        Err(e) => println!("  {e}"),
    }
    println!(
        "  driver loaded afterwards: {}",
        bus.is_driver_loaded(&config.driver)
    );

    Ok(())
}
