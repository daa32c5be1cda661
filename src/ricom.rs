//! The integrated center of mass reconstruction kernel.
//!
//! Reconstruction by integration of the first moment convolves the
//! center-of-mass vector field with an antisymmetric 1/r kernel. The kernel
//! is precomputed once per run; the convolution runs line by line as scan
//! lines become visible, each line job reading a `2k+1` row window of the
//! COM fields and producing exactly one output line.

use crate::math::Vec2;


/// The precomputed convolution kernel, a pair of half kernels for the
/// x and y components of the field.
#[derive(Debug, Clone)]
pub struct RicomKernel {

    /// Half width `k`; the kernel spans `2k+1` rows and columns.
    pub size: usize,

    /// Rotation between scan and detector coordinates, in degrees.
    pub rotation_degrees: f32,

    /// Full width `2k+1`.
    pub width: usize,

    pub values_x: Vec<f32>,
    pub values_y: Vec<f32>,

    /// Low-pass and high-pass frequency bounds. Accepted for
    /// compatibility with acquisition presets, currently not applied.
    pub filter_frequencies: Option<(f32, f32)>,
}

impl RicomKernel {

    pub fn compute(size: usize, rotation_degrees: f32) -> Self {
        let rotation = rotation_degrees.to_radians();
        let (sin_rotation, cos_rotation) = rotation.sin_cos();

        let width = size * 2 + 1;
        let area = width * width;
        let mut values_x = vec![0.0; area];
        let mut values_y = vec![0.0; area];

        for iy in 0..width {
            // the kernel is stored vertically flipped relative to iteration
            let flipped_row = width - 1 - iy;

            for ix in 0..width {
                let x = ix as f32 - size as f32;
                let y = iy as f32 - size as f32;
                let d = x * x + y * y;

                if d > 0.0 {
                    let cell = flipped_row * width + ix;
                    values_x[cell] = cos_rotation * (x / d) - sin_rotation * (y / d);
                    values_y[cell] = sin_rotation * (x / d) + cos_rotation * (y / d);
                }
            }
        }

        Self {
            size, rotation_degrees, width,
            values_x, values_y,
            filter_frequencies: None,
        }
    }

    /// Remember the filter bounds a host configured. The frequency filter
    /// of the acquisition software is disabled upstream, so the bounds are
    /// recorded but the kernel values stay unfiltered.
    pub fn with_filter(mut self, low_pass: f32, high_pass: f32) -> Self {
        self.filter_frequencies = Some((low_pass, high_pass));
        self
    }

    /// Approximate transfer over spatial frequencies, normalized to the
    /// strongest response; used by hosts to judge the kernel size.
    pub fn approximate_frequencies(&self, nx: usize) -> Vec<f32> {
        let k = (self.size * 2) as f32;

        let mut response: Vec<f32> = (0..nx).map(|i| {
            let x = 2.0 * i as f32 * std::f32::consts::PI;
            if x == 0.0 { return 0.0 }
            (nx as f32 / x) * (1.0 - (k / 2.0 * (x / nx as f32)).cos())
        }).collect();

        let max = response.iter().cloned().fold(0.0_f32, f32::max);
        if max > 0.0 {
            for value in &mut response { *value /= max }
        }

        response
    }
}


/// The input of one line convolution job: the `2k+1` COM field rows
/// centered on the output line, copied so the job owns its data.
#[derive(Debug)]
pub struct LineWindow {
    pub com_x: Vec<f32>,
    pub com_y: Vec<f32>,
    pub nx: usize,
    pub offset: Vec2<f32>,
}

/// Convolve one scan line. The window holds `2k+1` rows of `nx` values;
/// the result is the integrated gradient contribution of the output line.
pub fn convolve_line(kernel: &RicomKernel, window: &LineWindow) -> Vec<f32> {
    let k = kernel.size as i64;
    let width = kernel.width;
    let nx = window.nx as i64;

    debug_assert_eq!(window.com_x.len(), width * window.nx);
    debug_assert_eq!(window.com_y.len(), width * window.nx);

    let mut line = vec![0.0_f32; window.nx];

    for iy in -k..=k {
        let window_row = ((iy + k) as usize) * window.nx;
        let kernel_row = ((iy + k) as usize) * width;

        for (column, out) in line.iter_mut().enumerate() {
            let column = column as i64;

            for ix in -k..=k {
                let source_column = column + ix;
                if source_column < 0 || source_column >= nx { continue }

                let source = window_row + source_column as usize;
                let kernel_cell = kernel_row + (ix + k) as usize;

                *out += (window.com_x[source] - window.offset.x()) * -kernel.values_x[kernel_cell]
                    + (window.com_y[source] - window.offset.y()) * -kernel.values_y[kernel_cell];
            }
        }
    }

    line
}
