//! Resize procedure state machine
//!
//! The procedure runs in a fixed order:
//!
//! ```text
//! Idle → DriversUnbound → RegistersResized → SubtreeRemoved → Rescanned
//!      → DriverLoaded → Verified
//! ```
//!
//! A register write that does not latch aborts before anything is removed
//! (`AbortedNoRegisterWrite`). Once a subtree has been removed, a failure is
//! `AbortedPostRemoval` and the [`DriverGuard`] restores the driver on the
//! way out.

use crate::config::Config;
use crate::diagnostics::{self, Snapshot, VerificationReport};
use crate::error::{RebarError, Result};
use crate::guard::DriverGuard;
use crate::port::BusPort;
use crate::register::{ControlRegister, OperationResult};
use crate::topology::DeviceAddress;
use std::fmt;
use std::time::Duration;

/// Procedure phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing done yet
    Idle,
    /// Drivers detached from GPUs and companions
    DriversUnbound,
    /// Every control register holds the target index
    RegistersResized,
    /// Top-level bridges removed
    SubtreeRemoved,
    /// Every GPU rediscovered
    Rescanned,
    /// Driver module loaded and settled
    DriverLoaded,
    /// Verification ran
    Verified,
    /// A register write failed; topology untouched
    AbortedNoRegisterWrite,
    /// Failure after removal
    AbortedPostRemoval,
}

impl Phase {
    /// Terminal failure phase
    pub const fn is_aborted(self) -> bool {
        matches!(self, Self::AbortedNoRegisterWrite | Self::AbortedPostRemoval)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::DriversUnbound => "drivers unbound",
            Self::RegistersResized => "registers resized",
            Self::SubtreeRemoved => "subtree removed",
            Self::Rescanned => "rescanned",
            Self::DriverLoaded => "driver loaded",
            Self::Verified => "verified",
            Self::AbortedNoRegisterWrite => "aborted before removal",
            Self::AbortedPostRemoval => "aborted after removal",
        };
        f.write_str(name)
    }
}

/// Result of a completed procedure
#[derive(Debug, Clone)]
pub struct ProcedureReport {
    /// Phases entered, in order
    pub phases: Vec<Phase>,
    /// One entry per GPU register write
    pub writes: Vec<OperationResult>,
    /// Whether the unbind step found nothing bound
    pub unbind_skipped: bool,
    /// Bridges whose removal was rejected
    pub removal_failures: usize,
    /// Post-procedure verification
    pub verification: VerificationReport,
}

impl ProcedureReport {
    /// Verification passed
    pub fn passed(&self) -> bool {
        self.verification.passed()
    }
}

/// Drives one resize procedure over a bus port
#[derive(Debug)]
pub struct BusOperator<'a, P: BusPort + ?Sized> {
    guard: DriverGuard<'a, P>,
    config: &'a Config,
    register: ControlRegister,
    phase: Phase,
    history: Vec<Phase>,
    writes: Vec<OperationResult>,
    unbind_skipped: bool,
    removal_failures: usize,
}

impl<'a, P: BusPort + ?Sized> BusOperator<'a, P> {
    /// Operator in [`Phase::Idle`]
    pub fn new(port: &'a mut P, config: &'a Config) -> Self {
        let devices: Vec<DeviceAddress> = config
            .topology
            .gpu_devices()
            .iter()
            .chain(config.topology.companion_devices())
            .cloned()
            .collect();
        Self {
            guard: DriverGuard::new(port, config.driver.clone(), &devices),
            config,
            register: ControlRegister::new(config.register_offset),
            phase: Phase::Idle,
            history: vec![Phase::Idle],
            writes: Vec::new(),
            unbind_skipped: false,
            removal_failures: 0,
        }
    }

    /// Current phase
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Phases entered so far
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    /// Register write results so far
    pub fn writes(&self) -> &[OperationResult] {
        &self.writes
    }

    /// Whether the driver guard will run recovery on drop
    pub const fn recovery_pending(&self) -> bool {
        self.guard.is_armed()
    }

    /// Run every step and verify against `before`
    ///
    /// # Errors
    ///
    /// Returns the error of the first fatal step. The driver guard has run
    /// by the time this returns.
    pub fn run(mut self, before: &Snapshot) -> Result<ProcedureReport> {
        self.unbind_drivers()?;
        self.resize_registers()?;
        self.remove_subtrees()?;
        self.rescan()?;
        self.load_driver()?;
        let verification = self.verify(before)?;
        Ok(ProcedureReport {
            phases: std::mem::take(&mut self.history),
            writes: std::mem::take(&mut self.writes),
            unbind_skipped: self.unbind_skipped,
            removal_failures: self.removal_failures,
            verification,
        })
    }

    /// Step 1: detach drivers from companions, then GPUs
    ///
    /// Skipped when nothing is bound. Unbind failures are logged and do not
    /// stop the procedure.
    ///
    /// # Errors
    ///
    /// Returns error only if called out of order.
    pub fn unbind_drivers(&mut self) -> Result<()> {
        self.require_phase(Phase::Idle)?;
        let config = self.config;
        let topology = &config.topology;

        let bound: Vec<(DeviceAddress, String, bool)> = topology
            .companion_devices()
            .iter()
            .map(|a| (a, false))
            .chain(topology.gpu_devices().iter().map(|a| (a, true)))
            .filter_map(|(a, is_gpu)| {
                self.guard
                    .port()
                    .bound_driver(a)
                    .map(|driver| (a.clone(), driver, is_gpu))
            })
            .collect();

        if bound.is_empty() {
            tracing::info!("No drivers bound, skipping unbind");
            self.unbind_skipped = true;
            self.enter(Phase::DriversUnbound);
            return Ok(());
        }

        let mut detached = 0;
        for (address, driver, is_gpu) in &bound {
            tracing::info!("Unbinding {driver} from {address}");
            match self.guard.port_mut().unbind(address) {
                Ok(()) => detached += 1,
                Err(e) if *is_gpu => tracing::error!("Failed to unbind {address}: {e}"),
                Err(e) => tracing::warn!("Failed to unbind {address}: {e}"),
            }
        }
        if detached > 0 {
            self.guard.arm();
        }
        tracing::info!("Unbound {detached} of {} device(s)", bound.len());

        self.enter(Phase::DriversUnbound);
        Ok(())
    }

    /// Step 2: write the target size index to every GPU
    ///
    /// GPUs missing at this point are treated as not yet rediscovered: one
    /// rescan is requested before writing.
    ///
    /// # Errors
    ///
    /// Returns [`RebarError::RegisterWrite`] if any write did not latch. No
    /// subtree is removed in that case.
    pub fn resize_registers(&mut self) -> Result<()> {
        self.require_phase(Phase::DriversUnbound)?;
        let config = self.config;
        let gpus = config.topology.gpu_devices();

        if gpus.iter().any(|g| !self.guard.port().is_present(g)) {
            tracing::warn!("GPU(s) missing before resize, rescanning");
            self.guard.arm();
            if let Err(e) = self.guard.port_mut().rescan() {
                tracing::error!("Rescan failed: {e}");
            } else if let Err(e) = self.poll_present() {
                tracing::warn!("{e}");
            }
        }

        let target = config.target;
        let mut failed = 0;
        for gpu in gpus {
            let result = self
                .register
                .write_size_index(self.guard.port_mut(), gpu, target);
            if result.succeeded {
                tracing::info!(
                    "{gpu}: size index {}",
                    result.after.map_or_else(|| "?".to_string(), |i| i.to_string())
                );
            } else {
                failed += 1;
                tracing::error!(
                    "{gpu}: resize failed: {}",
                    result.reason.as_deref().unwrap_or("unknown")
                );
            }
            self.writes.push(result);
        }

        if failed > 0 {
            self.enter(Phase::AbortedNoRegisterWrite);
            return Err(RebarError::RegisterWrite {
                failed,
                total: gpus.len(),
            });
        }

        self.enter(Phase::RegistersResized);
        Ok(())
    }

    /// Step 3: remove every top-level bridge, taking its subtree with it
    ///
    /// Bridges already gone are skipped. Rejected removals are logged and
    /// counted; the rescan decides whether they mattered.
    ///
    /// # Errors
    ///
    /// Returns error only if called out of order.
    pub fn remove_subtrees(&mut self) -> Result<usize> {
        self.require_phase(Phase::RegistersResized)?;
        self.guard.arm();
        let config = self.config;

        let mut failures = 0;
        for bridge in config.topology.top_level_bridges() {
            if !self.guard.port().is_present(bridge) {
                tracing::info!("{bridge} already removed");
                continue;
            }
            tracing::info!("Removing {bridge}");
            if let Err(e) = self.guard.port_mut().remove(bridge) {
                tracing::error!("Failed to remove {bridge}: {e}");
                failures += 1;
                continue;
            }
            for below in config.topology.descendants_of(bridge) {
                if self.guard.port().is_present(below) {
                    tracing::warn!("{below} still present after removing {bridge}");
                }
            }
        }

        self.removal_failures = failures;
        self.enter(Phase::SubtreeRemoved);
        Ok(failures)
    }

    /// Step 4: rescan and wait for every GPU to come back
    ///
    /// # Errors
    ///
    /// Returns [`RebarError::RescanTimeout`] if GPUs are still missing after
    /// the configured number of polls.
    pub fn rescan(&mut self) -> Result<()> {
        self.require_phase(Phase::SubtreeRemoved)?;

        tracing::info!("Rescanning bus");
        if let Err(e) = self.guard.port_mut().rescan() {
            self.enter(Phase::AbortedPostRemoval);
            return Err(e);
        }

        match self.poll_present() {
            Ok(()) => {
                self.enter(Phase::Rescanned);
                Ok(())
            }
            Err(e) => {
                self.enter(Phase::AbortedPostRemoval);
                Err(e)
            }
        }
    }

    /// Step 5: load the driver, or let an already-loaded one bind
    ///
    /// # Errors
    ///
    /// Returns [`RebarError::DriverLoad`] if the module cannot be loaded. The
    /// guard stays armed and retries on drop.
    pub fn load_driver(&mut self) -> Result<()> {
        self.require_phase(Phase::Rescanned)?;
        let config = self.config;
        let driver = config.driver.as_str();

        let settle = if self.guard.port().is_driver_loaded(driver) {
            tracing::info!("Driver {driver} already loaded, waiting for devices to bind");
            config.timing.settle_loaded()
        } else {
            tracing::info!("Loading driver {driver}");
            if let Err(e) = self.guard.port_mut().load_driver(driver) {
                self.enter(Phase::AbortedPostRemoval);
                return Err(e);
            }
            config.timing.settle_fresh()
        };
        self.guard.port().sleep(settle);
        self.guard.disarm();

        self.enter(Phase::DriverLoaded);
        Ok(())
    }

    /// Step 6: re-observe everything and judge the result
    ///
    /// # Errors
    ///
    /// Returns error only if called out of order.
    pub fn verify(&mut self, before: &Snapshot) -> Result<VerificationReport> {
        self.require_phase(Phase::DriverLoaded)?;
        let report = diagnostics::verify(self.guard.port(), self.config, before);
        self.enter(Phase::Verified);
        Ok(report)
    }

    fn poll_present(&self) -> Result<()> {
        let gpus = self.config.topology.gpu_devices();
        let interval = self.config.timing.rescan_interval();
        let attempts = self.config.timing.rescan_attempts;

        let mut waited = Duration::ZERO;
        let mut present = 0;
        for attempt in 1..=attempts {
            self.guard.port().sleep(interval);
            waited += interval;
            present = gpus
                .iter()
                .filter(|g| self.guard.port().is_present(g))
                .count();
            if present == gpus.len() {
                tracing::info!("All {present} GPU(s) present after {attempt} poll(s)");
                return Ok(());
            }
            tracing::debug!("Poll {attempt}/{attempts}: {present} of {} GPU(s)", gpus.len());
        }

        tracing::error!("Only {present} of {} GPU(s) came back", gpus.len());
        Err(RebarError::RescanTimeout {
            present,
            expected: gpus.len(),
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        })
    }

    fn require_phase(&self, phase: Phase) -> Result<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(RebarError::InvalidState {
                state: format!("procedure is {}, expected {phase}", self.phase),
            })
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!("Phase: {} -> {phase}", self.phase);
        self.phase = phase;
        self.history.push(phase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBus;
    use rebar_chip::regs::SizeIndex;

    fn setup() -> (Config, MemoryBus) {
        let config = Config::from_toml("").unwrap();
        let bus = MemoryBus::from_config(&config, SizeIndex::new(8).unwrap());
        (config, bus)
    }

    #[test]
    fn steps_must_run_in_order() {
        let (config, mut bus) = setup();
        let mut op = BusOperator::new(&mut bus, &config);
        assert!(matches!(
            op.remove_subtrees(),
            Err(RebarError::InvalidState { .. })
        ));
        op.unbind_drivers().unwrap();
        assert!(matches!(op.rescan(), Err(RebarError::InvalidState { .. })));
        assert_eq!(op.phase(), Phase::DriversUnbound);
    }

    #[test]
    fn failed_write_blocks_removal() {
        let (config, bus) = setup();
        let gpu = config.topology.gpu_devices()[2].clone();
        let mut bus = bus.with_stuck_register(&gpu);
        {
            let mut op = BusOperator::new(&mut bus, &config);
            op.unbind_drivers().unwrap();
            let err = op.resize_registers().unwrap_err();
            assert!(matches!(err, RebarError::RegisterWrite { failed: 1, total: 4 }));
            assert_eq!(op.phase(), Phase::AbortedNoRegisterWrite);
            assert!(op.remove_subtrees().is_err());
        }
        assert!(bus.removals().is_empty());
        // guard re-probed the GPUs it had unbound
        assert_eq!(bus.bound_driver(&gpu).as_deref(), Some("amdgpu"));
    }

    #[test]
    fn history_records_every_phase() {
        let (config, mut bus) = setup();
        let before = diagnostics::snapshot(&bus, &config);
        let report = BusOperator::new(&mut bus, &config).run(&before).unwrap();
        assert_eq!(
            report.phases,
            vec![
                Phase::Idle,
                Phase::DriversUnbound,
                Phase::RegistersResized,
                Phase::SubtreeRemoved,
                Phase::Rescanned,
                Phase::DriverLoaded,
                Phase::Verified,
            ]
        );
        assert!(report.passed());
    }

    #[test]
    fn already_loaded_driver_uses_short_settle() {
        let (config, mut bus) = setup();
        let before = diagnostics::snapshot(&bus, &config);
        BusOperator::new(&mut bus, &config).run(&before).unwrap();
        assert_eq!(bus.loads(), 0);
        let polls = config.timing.rescan_interval();
        assert_eq!(bus.slept(), polls + config.timing.settle_loaded());
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::AbortedPostRemoval.to_string(), "aborted after removal");
        assert!(Phase::AbortedNoRegisterWrite.is_aborted());
        assert!(!Phase::Verified.is_aborted());
    }
}
