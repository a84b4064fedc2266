//! Transfer protocol against the reference driver

mod common;

use pim_driver::{DriverError, HostBuffer, ProgramBuilder, MRAM_BASE};
use pim_host::{CopyOptions, Endpoint, Error, ResourceSet, Symbol};

fn device_endpoints() -> Vec<Endpoint> {
    vec![
        Endpoint::from("counter"),
        Endpoint::from(Symbol::new("counter", common::COUNTER_ADDRESS, 4)),
        Endpoint::Mram,
    ]
}

fn host_endpoints(units: usize) -> Vec<Endpoint> {
    vec![
        Endpoint::from(HostBuffer::new(4)),
        Endpoint::from((0..units).map(|_| HostBuffer::new(4)).collect::<Vec<_>>()),
    ]
}

#[test]
fn test_direction_inferred_for_every_endpoint_pair() -> pim_host::Result<()> {
    let (driver, set) = common::counter_set(1, 4, 4)?;

    for device in device_endpoints() {
        for host in host_endpoints(4) {
            set.copy(device.clone(), host.clone())?;
            set.copy(host, device.clone())?;
        }
    }

    let calls = driver.native_calls();
    for (dst, src) in device_endpoints().into_iter().zip(device_endpoints().into_iter().rev()) {
        assert!(matches!(set.copy(dst, src), Err(Error::InvalidTransfer(_))));
    }
    for (dst, src) in host_endpoints(4).into_iter().zip(host_endpoints(4).into_iter().rev()) {
        assert!(matches!(set.copy(dst, src), Err(Error::InvalidTransfer(_))));
    }
    assert_eq!(driver.native_calls(), calls);
    Ok(())
}

#[test]
fn test_buffer_list_must_match_unit_count() -> pim_host::Result<()> {
    let (driver, set) = common::counter_set(1, 4, 4)?;
    let calls = driver.native_calls();

    let three: Vec<HostBuffer> = (0..3).map(|_| HostBuffer::new(4)).collect();
    let err = set.copy("counter", three).unwrap_err();
    assert!(matches!(err, Error::BufferCountMismatch { expected: 4, actual: 3 }));
    assert_eq!(driver.native_calls(), calls);
    Ok(())
}

#[test]
fn test_explicit_size_larger_than_buffer() -> pim_host::Result<()> {
    let (_driver, set) = common::counter_set(1, 2, 2)?;
    let err = set
        .copy_with("counter", HostBuffer::new(2), CopyOptions::default().size(4))
        .unwrap_err();
    assert!(matches!(err, Error::BufferTooSmall { size: 4, len: 2 }));
    Ok(())
}

#[test]
fn test_scatter_then_gather_keeps_units_apart() -> pim_host::Result<()> {
    let (_driver, set) = common::counter_set(2, 2, 4)?;

    let outbound: Vec<HostBuffer> = (0..4u32)
        .map(|unit| HostBuffer::from_vec((unit * 10).to_le_bytes().to_vec()))
        .collect();
    set.copy("counter", outbound)?;

    let inbound: Vec<HostBuffer> = (0..4).map(|_| HostBuffer::new(4)).collect();
    set.copy(inbound.clone(), "counter")?;
    let values: Vec<Vec<u8>> = inbound.iter().map(HostBuffer::to_vec).collect();
    assert_eq!(
        values,
        vec![0u32.to_le_bytes(), 10u32.to_le_bytes(), 20u32.to_le_bytes(), 30u32.to_le_bytes()]
            .into_iter()
            .map(|bytes| bytes.to_vec())
            .collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn test_missing_buffers_skip_their_unit() -> pim_host::Result<()> {
    let (_driver, set) = common::counter_set(1, 3, 3)?;
    set.set("counter", &[9, 9, 9, 9])?;

    let buffers = vec![
        Some(HostBuffer::from_vec(vec![1, 0, 0, 0])),
        None,
        Some(HostBuffer::from_vec(vec![3, 0, 0, 0])),
    ];
    set.copy("counter", buffers)?;

    let values = set.get("counter")?.cast::<u32>();
    assert_eq!(values, vec![vec![1], vec![0x0909_0909], vec![3]]);
    Ok(())
}

#[test]
fn test_offset_and_size_inside_a_symbol() -> pim_host::Result<()> {
    let (_driver, set) = common::counter_set(1, 2, 2)?;
    set.set("counter", &[0; 4])?;
    set.copy_with(
        "counter",
        HostBuffer::from_vec(vec![0xaa, 0xbb, 0xcc]),
        CopyOptions::default().offset(2).size(2),
    )?;
    assert_eq!(set.get("counter")?.contents(), &[vec![0u8, 0, 0xaa, 0xbb], vec![0u8, 0, 0xaa, 0xbb]]);

    let err = set
        .copy_with("counter", HostBuffer::new(4), CopyOptions::default().offset(2))
        .unwrap_err();
    assert!(matches!(err, Error::Driver(DriverError::InvalidSymbolAccess { .. })));
    Ok(())
}

#[test]
fn test_raw_mram_round_trip() -> pim_host::Result<()> {
    let driver = common::driver(1, 2);
    let set = ResourceSet::builder()
        .units(2)
        .binary(common::binary(ProgramBuilder::new().symbol("input", MRAM_BASE, 64)))
        .allocate(driver)?;

    set.copy_with(Endpoint::Mram, HostBuffer::from_vec(vec![5; 8]), CopyOptions::default().offset(16))?;

    let unit = set.unit(1).expect("second unit");
    let mut out = [0u8; 8];
    unit.read_memory(MRAM_BASE + 16, &mut out)?;
    assert_eq!(out, [5; 8]);

    unit.write_memory(MRAM_BASE, &[7; 4])?;
    let readback = HostBuffer::new(4);
    unit.copy(readback.clone(), Endpoint::Mram)?;
    assert_eq!(readback.to_vec(), vec![7; 4]);
    Ok(())
}

#[test]
fn test_asynchronous_copies_complete_on_sync() -> pim_host::Result<()> {
    let driver = common::driver(2, 2);
    let set = ResourceSet::builder()
        .units(4)
        .async_mode(true)
        .binary(common::counter_program())
        .allocate(driver)?;

    set.copy("counter", HostBuffer::from_vec(42u32.to_le_bytes().to_vec()))?;
    let inbound: Vec<HostBuffer> = (0..4).map(|_| HostBuffer::new(4)).collect();
    set.copy(inbound.clone(), "counter")?;
    set.sync()?;

    for buffer in &inbound {
        assert_eq!(buffer.to_vec(), 42u32.to_le_bytes().to_vec());
    }
    Ok(())
}

#[test]
fn test_single_buffer_list_on_one_unit() -> pim_host::Result<()> {
    let (_driver, set) = common::counter_set(1, 2, 2)?;
    let unit = set.unit(0).expect("unit");

    unit.copy("counter", vec![HostBuffer::from_vec(vec![4, 3, 2, 1])])?;
    assert_eq!(unit.get("counter")?.unit(0), Some(&[4u8, 3, 2, 1][..]));
    assert_eq!(set.get("counter")?.unit(1), Some(&[0u8, 0, 0, 0][..]));
    Ok(())
}
