//! Chunked 4D capture and region-of-interest tensors over synthetic input.

use std::path::PathBuf;

use stemflow::event::{ElectronFile, ElectronRecord};
use stemflow::fourd::read_container;
use stemflow::prelude::*;


fn temp_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("stemflow-{}-{}", std::process::id(), name));
    path
}

fn one_event_per_probe(path: &PathBuf, nx: usize, ny: usize, kx: u16, ky: u16) {
    let mut file = ElectronFile::create(path, 1).unwrap();

    for ry in 0..ny as u16 {
        for rx in 0..nx as u16 {
            file.append(ElectronRecord { kx, ky, rx, ry, image_index: 0 }).unwrap();
        }
    }

    file.finish().unwrap();
}

fn simulated_setup(path: PathBuf, nx: usize, ny: usize, detector: usize) -> CameraSetup {
    CameraSetup::new(
        CameraKind::Simulated,
        ScanGeometry { nx, ny, rep: 1, dwell_ns: 0, detector },
        DataSource::File(path),
    )
}


#[test]
fn chunked_capture_roundtrips_through_the_container(){
    let input = temp_path("fourd-roundtrip.electron");
    let output = temp_path("fourd-roundtrip.4d");
    let (nx, ny, detector) = (32, 32, 64);

    one_event_per_probe(&input, nx, ny, 4, 6);

    let mut analysis: FourDRun<u8> = FourDRun::new(
        simulated_setup(input.clone(), nx, ny, detector),
        RunOptions::default(),
        FourDOutput {
            path: output.clone(),
            scan_bin: 1,
            det_bin: 2,
            chunksize: 8,
            deflate_level: 4,
        },
    );

    let results = analysis.run().unwrap();
    assert_eq!(results.dose.sum(), (nx * ny) as u64);

    let mut file = std::fs::File::open(&output).unwrap();
    let container = read_container(&mut file).unwrap();

    assert_eq!(container.layout.shape, [32, 32, 32, 32]);
    assert_eq!(container.layout.bit_depth, 8);
    assert_eq!(container.layout.deflate_level, 4);

    // detector (4, 6) bins to cell (2, 3) at every probe position
    for row in 0..ny {
        for column in 0..nx {
            assert_eq!(container.get(row, column, 2, 3), 1, "probe ({}, {})", row, column);
        }
    }

    let total: u64 = container.data.iter().sum();
    assert_eq!(total, (nx * ny) as u64);

    std::fs::remove_file(&input).ok();
    std::fs::remove_file(&output).ok();
}

#[test]
fn chunked_capture_respects_scan_binning(){
    let input = temp_path("fourd-binned.electron");
    let output = temp_path("fourd-binned.4d");
    let (nx, ny, detector) = (16, 16, 32);

    one_event_per_probe(&input, nx, ny, 0, 0);

    let mut analysis: FourDRun<u16> = FourDRun::new(
        simulated_setup(input.clone(), nx, ny, detector),
        RunOptions::default(),
        FourDOutput {
            path: output.clone(),
            scan_bin: 2,
            det_bin: 1,
            chunksize: 4,
            deflate_level: 1,
        },
    );

    analysis.run().unwrap();

    let mut file = std::fs::File::open(&output).unwrap();
    let container = read_container(&mut file).unwrap();

    assert_eq!(container.layout.shape, [8, 8, 32, 32]);
    assert_eq!(container.layout.bit_depth, 16);

    // four probe positions fold into every binned cell
    for row in 0..8 {
        for column in 0..8 {
            assert_eq!(container.get(row, column, 0, 0), 4);
        }
    }

    std::fs::remove_file(&input).ok();
    std::fs::remove_file(&output).ok();
}

#[test]
fn roi_fourd_tensor_matches_the_window(){
    let input = temp_path("roi-fourd.electron");
    let (nx, ny, detector) = (128, 128, 64);

    one_event_per_probe(&input, nx, ny, 10, 10);

    let window = RoiWindow { origin: Vec2(16, 16), size: Vec2(32, 32) };
    let mut analysis = RoiRun::new(
        simulated_setup(input.clone(), nx, ny, detector),
        RunOptions::default(),
        RoiSelection::FourD { window, det_bin: 2 },
    );

    let results = analysis.run().unwrap();
    let tensor = results.tensor.unwrap();

    assert_eq!(tensor.shape, [32, 32, 32, 32]);

    for row in 0..32 {
        for column in 0..32 {
            assert_eq!(tensor.get(row, column, 5, 5), 1, "cell ({}, {})", row, column);
        }
    }

    assert_eq!(tensor.cells.sum(), 32 * 32);
    assert_eq!(results.scan.sum(), 32 * 32);

    std::fs::remove_file(&input).ok();
}

#[test]
fn identity_roi_keeps_every_event(){
    let input = temp_path("roi-identity.electron");
    let (nx, ny, detector) = (32, 32, 64);

    one_event_per_probe(&input, nx, ny, 7, 9);

    let setup = simulated_setup(input.clone(), nx, ny, detector);
    let window = RoiWindow::full(setup.geometry);

    let mut analysis = RoiRun::new(
        setup, RunOptions::default(), RoiSelection::Window(window),
    );

    let results = analysis.run().unwrap();

    assert_eq!(results.scan.sum(), (nx * ny) as u64);
    assert_eq!(results.diffraction.snapshot()[7 * 64 + 9], (nx * ny) as u64);

    std::fs::remove_file(&input).ok();
}
