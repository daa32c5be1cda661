//! Full pipeline runs over synthetic Timepix3 packet streams.

use std::path::PathBuf;

use stemflow::prelude::*;


fn temp_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("stemflow-{}-{}", std::process::id(), name));
    path
}

fn header_word(chip: usize) -> u64 {
    u32::from_le_bytes(*b"TPX3") as u64 | ((chip as u64) << 32)
}

fn tdc_word(rise: bool, time_ticks: u64) -> u64 {
    let kind: u64 = if rise { 15 } else { 10 };
    (0x6 << 60) | (kind << 56) | ((time_ticks & 0x7FFFFFFFF) << 9)
}

/// An event word for chip 3, where the address transform is the identity.
/// The time of arrival must be a multiple of 16 ticks.
fn event_word(toa_ticks: u64, kx: u16, ky: u16) -> u64 {
    assert_eq!(toa_ticks % 16, 0);
    let value = toa_ticks >> 4;

    let address = (((kx as u64) >> 1) << 9)
        | (((kx as u64) & 1) << 2)
        | (((ky as u64) >> 2) << 3)
        | ((ky as u64) & 3);

    (0xb << 60) | (address << 44) | ((value & 0x3FFF) << 30) | ((value >> 14) & 0xFFFF)
}

/// A full synthetic acquisition: every chip triggers every line, chip 3
/// carries one event per probe column.
fn write_scan(path: &PathBuf, nx: u64, ny: u64, dwell_ticks: u64) {
    let mut words = Vec::new();

    for line in 0..ny {
        // rise times must keep event arrivals on the 16-tick grid
        let rise = line * nx * dwell_ticks;
        let fall = rise + nx * dwell_ticks / 2;

        for chip in 0..3 {
            words.push(header_word(chip));
            words.push(tdc_word(true, rise));
            words.push(tdc_word(false, fall));
        }

        words.push(header_word(3));
        words.push(tdc_word(true, rise));

        for column in 0..nx {
            words.push(event_word(2 * rise + column * dwell_ticks, 10, 10));
        }

        words.push(tdc_word(false, fall));
    }

    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    std::fs::write(path, bytes).unwrap();
}


#[test]
fn cheetah_file_run_places_every_event(){
    let path = temp_path("cheetah-scan.tpx3");
    let (nx, ny) = (16_u64, 16_u64);
    let dwell_ticks = 640; // 1000 ns

    write_scan(&path, nx, ny, dwell_ticks);

    let setup = CameraSetup::new(
        CameraKind::Cheetah,
        ScanGeometry {
            nx: nx as usize, ny: ny as usize, rep: 1,
            dwell_ns: 1000, detector: 512,
        },
        DataSource::File(path.clone()),
    );

    let mut analysis = PacbedRun::new(setup, RunOptions::default());
    let results = analysis.run().unwrap();

    let pattern = results.pattern.snapshot();
    assert_eq!(pattern[10 * 512 + 10], nx * ny);
    assert_eq!(pattern.iter().sum::<u64>(), nx * ny);

    assert_eq!(results.diagnostics.events_processed, nx * ny);

    std::fs::remove_file(&path).ok();
}

#[test]
fn cheetah_com_lands_on_the_event_column(){
    let path = temp_path("cheetah-com.tpx3");
    let (nx, ny) = (16_u64, 16_u64);

    write_scan(&path, nx, ny, 640);

    let setup = CameraSetup::new(
        CameraKind::Cheetah,
        ScanGeometry {
            nx: nx as usize, ny: ny as usize, rep: 1,
            dwell_ns: 1000, detector: 512,
        },
        DataSource::File(path.clone()),
    );

    let mut analysis = RicomRun::new(setup, RunOptions::default(), 1);
    let results = analysis.run().unwrap();

    // one event per probe position, all at detector (10, 10)
    assert_eq!(results.dose.slot(0).sum(), nx * ny);
    assert_eq!(results.sum_x.slot(0).sum(), 10 * nx * ny);
    assert_eq!(results.sum_y.slot(0).sum(), 10 * nx * ny);

    std::fs::remove_file(&path).ok();
}

#[test]
fn arbitrary_bytes_never_panic_the_decoder(){
    use rand::Rng;

    let path = temp_path("cheetah-fuzz.tpx3");
    let mut rng = rand::rng();

    // random words, plus a sprinkling of valid headers and triggers so
    // the decoder leaves its idle state
    let mut words = Vec::new();
    for index in 0..50_000_u64 {
        match index % 97 {
            0 => words.push(header_word(rng.random::<u64>() as usize % 8)),
            1 => words.push(tdc_word(true, rng.random::<u64>() & 0x7FFFFFFFF)),
            2 => words.push(tdc_word(false, rng.random::<u64>() & 0x7FFFFFFFF)),
            _ => words.push(rng.random::<u64>()),
        }
    }

    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    std::fs::write(&path, bytes).unwrap();

    let setup = CameraSetup::new(
        CameraKind::Cheetah,
        ScanGeometry { nx: 64, ny: 64, rep: 1, dwell_ns: 500, detector: 512 },
        DataSource::File(path.clone()),
    );

    // time over threshold exercises the wrapping fine-time arithmetic
    let window = RoiWindow { origin: Vec2(0, 0), size: Vec2(64, 64) };
    let mut analysis = RoiRun::new(
        setup,
        RunOptions::default(),
        RoiSelection::WindowOverThreshold(window),
    );

    // the run must terminate cleanly whatever the stream held
    analysis.run().unwrap();

    std::fs::remove_file(&path).ok();
}
