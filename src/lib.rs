
//! Turn raw event streams from direct-electron-counting cameras into live
//! scan images while the acquisition is still running.
//!
//! The pipeline reads raw bytes from a file or a socket into a bounded
//! ring, decodes detector packets into events, maps each event onto the
//! scan raster, and feeds it to the enabled aggregation kernel. A
//! line-granular handshake lets the downstream reducer, such as the
//! integrated center-of-mass reconstruction, consume scan lines the
//! moment they are complete.

#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused_extern_crates,
    unused,

    missing_copy_implementations,
    missing_debug_implementations,
)]

#![deny(
    unused_variables,
    unused_assignments,
    dead_code,
    unused_must_use,
    trivial_numeric_casts,
)]

#![forbid(unsafe_code)]

pub mod io;

pub mod math;
pub mod error;
pub mod meta;
pub mod transport;
pub mod ring;
pub mod progress;
pub mod event;
pub mod image;
pub mod kernel;
pub mod fourd;
pub mod decluster;
pub mod ricom;
pub mod detector;
pub mod analysis;

/// Re-exports of the types commonly required to configure and run an analysis.
pub mod prelude {

    pub use crate::meta::{
        CameraKind, CameraSetup, DataSource, RoiWindow,
        RunOptions, ScanGeometry, SocketRole,
    };

    pub use crate::analysis::{
        electron::ElectronRun,
        fourd::{FourDOutput, FourDRun},
        information::InformationRun,
        pacbed::PacbedRun,
        ricom::RicomRun,
        roi::{RoiRun, RoiSelection},
        variance::VarianceRun,
        vstem::{DetectorShape, VirtualStemRun},
        RunDiagnostics,
    };

    pub use crate::decluster::{DeclusterParams, ElectronReduction};
    pub use crate::kernel::AnnularRing;
    pub use crate::progress::Progress;

    // secondary data types
    pub use crate::error::{Error, Result, UnitResult};
    pub use crate::math::Vec2;
}
