//! End-to-end runs over synthetic acquisition files.

use std::path::PathBuf;
use std::sync::Arc;

use stemflow::prelude::*;
use stemflow::event::{read_electron_file, ElectronFile, ElectronRecord};


fn temp_path(name: &str) -> PathBuf {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut path = std::env::temp_dir();
    path.push(format!("stemflow-{}-{}", std::process::id(), name));
    path
}

/// `{ index: u32, toa: u64, overflow: u8, ftoa: u8, tot: u16 }`, packed.
fn advapix_record(kx: u16, ky: u16, toa_ticks: u64, tot: u16) -> [u8; 16] {
    let index = ky as u32 * 256 + kx as u32;

    let mut bytes = [0_u8; 16];
    bytes[0..4].copy_from_slice(&index.to_le_bytes());
    bytes[4..12].copy_from_slice(&toa_ticks.to_le_bytes());
    bytes[14..16].copy_from_slice(&tot.to_le_bytes());
    bytes
}

fn advapix_setup(path: PathBuf, nx: usize, ny: usize, rep: usize) -> CameraSetup {
    CameraSetup::new(
        CameraKind::Advapix,
        ScanGeometry { nx, ny, rep, dwell_ns: 1000, detector: 256 },
        DataSource::File(path),
    )
}

fn write_simulated_file(path: &PathBuf, records: &[ElectronRecord], rep: usize) {
    let mut file = ElectronFile::create(path, rep).unwrap();
    for &record in records {
        file.append(record).unwrap();
    }
    file.finish().unwrap();
}


#[test]
fn advapix_virtual_stem_counts_every_event(){
    // one event per probe position per image, inside the annulus
    let path = temp_path("advapix-vstem.t3p");
    let (nx, ny, rep) = (64, 64, 100);
    let kx = 128 + (200_f32).sqrt() as u16; // 142

    let mut bytes = Vec::new();
    for total in 0..(nx * ny * rep) as u64 {
        // dwell 1000 ns is 40 ticks per probe position
        bytes.extend_from_slice(&advapix_record(kx, 128, total * 40, 0));
    }
    std::fs::write(&path, bytes).unwrap();

    let shape = DetectorShape::Rings(vec![(10.0, 40.0, Some(Vec2(128.0, 128.0)))]);
    let mut analysis = VirtualStemRun::new(
        advapix_setup(path.clone(), nx, ny, rep),
        RunOptions::default(),
        shape,
    );

    let results = analysis.run().unwrap();

    let total: u64 = results.stack.iter().map(|plane| plane.sum()).sum();
    assert_eq!(total, (nx * ny * rep) as u64);

    for image in 0..rep {
        let plane = results.stack[image].snapshot();
        assert!(plane.iter().all(|&count| count == 1), "image {} is not all ones", image);
    }

    // every line was folded cumulatively
    assert_eq!(results.image.iter().sum::<u64>(), (nx * ny * rep) as u64);

    std::fs::remove_file(&path).ok();
}

#[test]
fn simulated_pacbed_integrates_all_probes(){
    let path = temp_path("simulated-pacbed.electron");
    let (nx, ny) = (64, 64);

    let mut records = Vec::new();
    for ry in 0..ny as u16 {
        for rx in 0..nx as u16 {
            for _ in 0..10 {
                records.push(ElectronRecord { kx: 17, ky: 41, rx, ry, image_index: 0 });
            }
        }
    }
    write_simulated_file(&path, &records, 1);

    let setup = CameraSetup::new(
        CameraKind::Simulated,
        ScanGeometry { nx, ny, rep: 1, dwell_ns: 0, detector: 256 },
        DataSource::File(path.clone()),
    );

    let mut analysis = PacbedRun::new(setup, RunOptions::default());
    let results = analysis.run().unwrap();

    let pattern = results.pattern.snapshot();
    assert_eq!(pattern[17 * 256 + 41], 40960);
    assert_eq!(pattern.iter().sum::<u64>(), 40960);

    std::fs::remove_file(&path).ok();
}

#[test]
fn ricom_moments_match_the_event_sums(){
    let path = temp_path("ricom-identity.electron");
    let (nx, ny) = (32, 32);

    let mut records = Vec::new();
    let mut expected_sum_x = 0_u64;
    let mut expected_sum_y = 0_u64;

    for ry in 0..ny as u16 {
        for rx in 0..nx as u16 {
            let kx = 100 + (rx % 3);
            let ky = 120 + (ry % 2);
            expected_sum_x += kx as u64;
            expected_sum_y += ky as u64;
            records.push(ElectronRecord { kx, ky, rx, ry, image_index: 0 });
        }
    }
    write_simulated_file(&path, &records, 1);

    let setup = CameraSetup::new(
        CameraKind::Simulated,
        ScanGeometry { nx, ny, rep: 1, dwell_ns: 0, detector: 256 },
        DataSource::File(path.clone()),
    );

    let mut analysis = RicomRun::new(setup, RunOptions::default(), 2);
    let results = analysis.run().unwrap();

    assert_eq!(results.dose.slot(0).sum(), (nx * ny) as u64);
    assert_eq!(results.sum_x.slot(0).sum(), expected_sum_x);
    assert_eq!(results.sum_y.slot(0).sum(), expected_sum_y);

    // a probe position with a single event has its center of mass there
    assert_eq!(results.com_x[0], 100.0);
    assert_eq!(results.com_y[0], 120.0);

    std::fs::remove_file(&path).ok();
}

#[test]
fn ricom_pool_and_inline_reductions_agree(){
    let path = temp_path("ricom-pool.electron");
    let (nx, ny) = (32, 32);

    let mut records = Vec::new();
    for ry in 0..ny as u16 {
        for rx in 0..nx as u16 {
            // a gradient in the center of mass produces structure
            records.push(ElectronRecord {
                kx: 100 + rx / 4, ky: 100 + ry / 4, rx, ry, image_index: 0,
            });
        }
    }
    write_simulated_file(&path, &records, 1);

    let setup = CameraSetup::new(
        CameraKind::Simulated,
        ScanGeometry { nx, ny, rep: 1, dwell_ns: 0, detector: 256 },
        DataSource::File(path.clone()),
    );

    let inline_image = {
        let mut analysis = RicomRun::new(setup.clone(), RunOptions::default(), 2);
        analysis.run().unwrap().image
    };

    let pooled_image = {
        let options = RunOptions { n_threads: 3, ..RunOptions::default() };
        let mut analysis = RicomRun::new(setup, options, 2);
        analysis.run().unwrap().image
    };

    for (cell, (a, b)) in inline_image.iter().zip(&pooled_image).enumerate() {
        assert!((a - b).abs() < 1e-4, "cell {} differs: {} vs {}", cell, a, b);
    }

    // the interior of a uniform gradient integrates to a nonzero ramp
    assert!(inline_image.iter().any(|&value| value.abs() > 1e-3));

    std::fs::remove_file(&path).ok();
}

#[test]
fn electron_file_roundtrips_through_the_pipeline(){
    let input = temp_path("electron-roundtrip-in.electron");
    let output = temp_path("electron-roundtrip-out.electron");
    let (nx, ny) = (16, 16);

    let mut records = Vec::new();
    for ry in 0..ny as u16 {
        for rx in 0..nx as u16 {
            records.push(ElectronRecord {
                kx: rx * 3, ky: ry * 2, rx, ry, image_index: 0,
            });
        }
    }
    write_simulated_file(&input, &records, 1);

    let setup = CameraSetup::new(
        CameraKind::Simulated,
        ScanGeometry { nx, ny, rep: 1, dwell_ns: 0, detector: 256 },
        DataSource::File(input.clone()),
    );

    let reduction = ElectronReduction {
        scan_bin: 1, det_bin: 1,
        x_crop: nx as u16, y_crop: ny as u16,
    };

    let mut analysis = ElectronRun::new(
        setup, RunOptions::default(), output.clone(), reduction,
    );
    analysis.run().unwrap();

    let mut file = std::fs::File::open(&output).unwrap();
    let mut written = read_electron_file(&mut file, 1).unwrap();

    let mut expected = records;
    written.sort_by_key(|record| (record.ry, record.rx, record.kx));
    expected.sort_by_key(|record| (record.ry, record.rx, record.kx));
    assert_eq!(written, expected);

    std::fs::remove_file(&input).ok();
    std::fs::remove_file(&output).ok();
}

#[test]
fn declustering_keeps_cluster_heads_and_singletons(){
    let input = temp_path("decluster-in.t3p");
    let output = temp_path("decluster-out.electron");
    let (nx, ny) = (8, 8);

    // three events of one cluster, then a distant singleton;
    // arrival times in ticks of 25 ns
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&advapix_record(10, 10, 40, 5));
    bytes.extend_from_slice(&advapix_record(11, 11, 41, 6));
    bytes.extend_from_slice(&advapix_record(12, 12, 42, 7));
    bytes.extend_from_slice(&advapix_record(200, 200, 200, 8));
    std::fs::write(&input, bytes).unwrap();

    let reduction = ElectronReduction {
        scan_bin: 1, det_bin: 1,
        x_crop: nx as u16, y_crop: ny as u16,
    };

    let mut analysis = ElectronRun::new(
        advapix_setup(input.clone(), nx, ny, 1),
        RunOptions::default(),
        output.clone(),
        reduction,
    );
    analysis.decluster = Some(DeclusterParams { dtime: 100, dspace: 6, cluster_range: 256 });

    let results = analysis.run().unwrap();
    let outcome = results.decluster.unwrap();

    assert_eq!(outcome.electrons_kept, 2);
    assert_eq!(outcome.cluster_size_histogram[3], 1);
    assert_eq!(outcome.cluster_size_histogram[1], 1);

    let mut file = std::fs::File::open(&output).unwrap();
    let written = read_electron_file(&mut file, 1).unwrap();

    assert_eq!(written, vec![
        ElectronRecord { kx: 10, ky: 10, rx: 1, ry: 0, image_index: 0 },
        ElectronRecord { kx: 200, ky: 200, rx: 5, ry: 0, image_index: 0 },
    ]);

    std::fs::remove_file(&input).ok();
    std::fs::remove_file(&output).ok();
}

#[test]
fn information_map_highlights_unusual_scattering(){
    let path = temp_path("information.electron");
    let (nx, ny) = (16, 16);

    let mut records = Vec::new();
    for ry in 0..ny as u16 {
        for rx in 0..nx as u16 {
            // probe (0, 0) scatters to a rare cell, the rest to a common one
            let (kx, ky) = if rx == 0 && ry == 0 { (9, 9) } else { (1, 1) };
            records.push(ElectronRecord { kx, ky, rx, ry, image_index: 0 });
        }
    }
    write_simulated_file(&path, &records, 1);

    let setup = CameraSetup::new(
        CameraKind::Simulated,
        ScanGeometry { nx, ny, rep: 1, dwell_ns: 0, detector: 16 },
        DataSource::File(path.clone()),
    );

    let mut probability = vec![1.0_f32; 16 * 16];
    probability[9 * 16 + 9] = 0.125;
    probability[1 * 16 + 1] = 0.5;

    let mut analysis = InformationRun::new(
        setup, RunOptions::default(), Arc::new(probability),
    );
    let results = analysis.run().unwrap();

    assert!((results.information[0] - 3.0).abs() < 1e-9);
    assert!((results.information[1] - 1.0).abs() < 1e-9);
    assert_eq!(results.counts.sum(), (nx * ny) as u64);

    std::fs::remove_file(&path).ok();
}
