//! Shared fixtures for pim-host integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pim_driver::{ProgramBuilder, SimConfig, SimDriver};
use pim_host::{ResourceSet, Result};

/// Address of the `counter` symbol in WRAM.
pub const COUNTER_ADDRESS: u32 = 0x100;

pub fn driver(ranks: u32, units_per_rank: u32) -> Arc<SimDriver> {
    pim_tracing::init_from_env();
    Arc::new(SimDriver::new(SimConfig::small(ranks, units_per_rank)).expect("valid simulator config"))
}

pub fn binary(builder: ProgramBuilder) -> Vec<u8> {
    builder.build().to_bytes().expect("encodable image")
}

/// Program exposing `counter` (4 bytes at 0x100) that increments it once.
pub fn counter_program() -> Vec<u8> {
    binary(
        ProgramBuilder::new()
            .symbol("counter", COUNTER_ADDRESS, 4)
            .add(COUNTER_ADDRESS, 1),
    )
}

/// `units` units on a fresh pool of `ranks` ranks, with the counter program.
pub fn counter_set(ranks: u32, units_per_rank: u32, units: u32) -> Result<(Arc<SimDriver>, ResourceSet)> {
    let driver = driver(ranks, units_per_rank);
    let set = ResourceSet::builder()
        .units(units)
        .binary(counter_program())
        .allocate(driver.clone())?;
    Ok((driver, set))
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}
