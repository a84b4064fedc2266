//! End-to-end behaviour of the reference driver through the `Driver` trait

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pim_driver::{
    AllocRequest, CallbackFlags, CallbackTarget, Driver, DriverError, HostBuffer, LaunchPolicy, NativeCallback,
    ProgramBinary, ProgramBuilder, SimConfig, SimDriver, XferDirection, XferFlags, XferTarget, MRAM_BASE,
};

fn shared_driver(ranks: u32, units_per_rank: u32) -> Arc<SimDriver> {
    Arc::new(SimDriver::new(SimConfig::small(ranks, units_per_rank)).unwrap())
}

#[test]
fn load_from_file_path() {
    let driver = shared_driver(1, 2);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("main.dpu");
    ProgramBuilder::new()
        .symbol("value", 0x40, 4)
        .store_id(0x40)
        .build()
        .save_to_file(&path)
        .unwrap();

    let set = driver.allocate(AllocRequest::Units(2), "backend=simulator").unwrap();
    let program = driver.load(set, &ProgramBinary::Path(path)).unwrap();
    assert_eq!(driver.symbol_names(program).unwrap(), vec!["value".to_string()]);
    driver.launch(set, LaunchPolicy::Synchronous).unwrap();

    let outputs = vec![HostBuffer::new(4), HostBuffer::new(4)];
    driver
        .prepare_xfers(set, outputs.iter().cloned().map(Some).collect())
        .unwrap();
    driver
        .push_xfer(
            set,
            XferDirection::FromDevice,
            &XferTarget::Name("value".into()),
            0,
            4,
            XferFlags::DEFAULT,
        )
        .unwrap();
    assert_eq!(outputs[0].to_vec(), 0u32.to_le_bytes());
    assert_eq!(outputs[1].to_vec(), 1u32.to_le_bytes());
}

#[test]
fn async_operations_keep_program_order() {
    let driver = shared_driver(2, 2);
    let set = driver.allocate(AllocRequest::Ranks(2), "").unwrap();
    let image = ProgramBuilder::new().symbol("counter", 0x100, 4).add(0x100, 1).build();
    driver
        .load(set, &ProgramBinary::Bytes(image.to_bytes().unwrap()))
        .unwrap();

    let target = XferTarget::Name("counter".into());
    let zero = HostBuffer::from_vec(vec![0; 4]);
    driver.broadcast(set, &target, 0, &zero, 4, XferFlags::ASYNC).unwrap();
    for _ in 0..5 {
        driver.launch(set, LaunchPolicy::Asynchronous).unwrap();
    }

    let outputs: Vec<HostBuffer> = (0..4).map(|_| HostBuffer::new(4)).collect();
    driver
        .prepare_xfers(set, outputs.iter().cloned().map(Some).collect())
        .unwrap();
    driver
        .push_xfer(set, XferDirection::FromDevice, &target, 0, 4, XferFlags::ASYNC)
        .unwrap();
    driver.sync(set).unwrap();

    for output in &outputs {
        assert_eq!(output.to_vec(), 5u32.to_le_bytes());
    }
}

#[test]
fn callbacks_may_reenter_the_driver_on_their_rank() {
    let driver = shared_driver(2, 2);
    let set = driver.allocate(AllocRequest::Ranks(2), "").unwrap();
    let image = ProgramBuilder::new().store_id(MRAM_BASE).build();
    driver
        .load(set, &ProgramBinary::Bytes(image.to_bytes().unwrap()))
        .unwrap();

    let ranks = driver.ranks(set).unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let reentrant = Arc::clone(&driver);
    let counter = Arc::clone(&seen);
    let callback: NativeCallback = Arc::new(move |target, _| {
        let CallbackTarget::Rank(slot) = target else {
            return Err(DriverError::callback("expected a per-rank call"));
        };
        let rank = ranks[slot as usize];
        reentrant.launch(rank, LaunchPolicy::Synchronous)?;
        for unit in reentrant.units(rank)? {
            let mut word = [0u8; 4];
            reentrant.copy_from(unit, MRAM_BASE, &mut word)?;
            counter.fetch_add(u32::from_le_bytes(word) as usize, Ordering::SeqCst);
        }
        reentrant.sync(rank)
    });

    driver.register_callback(set, callback, CallbackFlags::ASYNC).unwrap();
    driver.sync(set).unwrap();
    // Unit indices 0..4 summed.
    assert_eq!(seen.load(Ordering::SeqCst), 6);
}

#[test]
fn freed_ranks_can_be_allocated_again() {
    let driver = shared_driver(1, 4);
    let first = driver.allocate(AllocRequest::all(), "").unwrap();
    let unit = driver.units(first).unwrap()[0];
    driver.copy_to(unit, MRAM_BASE, &[7; 4]).unwrap();
    assert!(matches!(
        driver.allocate(AllocRequest::Units(1), ""),
        Err(DriverError::Allocation(_))
    ));
    driver.free(first).unwrap();

    let second = driver.allocate(AllocRequest::Units(1), "").unwrap();
    let unit = driver.units(second).unwrap()[0];
    let mut out = [0u8; 4];
    driver.copy_from(unit, MRAM_BASE, &mut out).unwrap();
    assert_eq!(out, [0; 4]);
}
