//! Reference kernels of the host runtime.
//!
//! Every kernel receives its arguments in the order they were bound at
//! dispatch. Volumes are passed as a buffer plus `width, height, slices`
//! integers; only the first `width * height * slices` bytes of a buffer take
//! part, the remainder is untouched.
//!
//! | program      | kernel          | arguments |
//! |--------------|-----------------|-----------|
//! | `median`     | `median3d`      | src, dst, w, h, d |
//! | `bilateral`  | `bilateral3d`   | src, dst, weights, w, h, d, radius, range_sigma |
//! | `fft`        | `fft2d_forward` | src, dst, tmp, w, h, d |
//! | `fft`        | `fft2d_inverse` | src, dst, tmp, w, h, d |
//! | `mask`       | `apply_mask`    | src, mask, dst, w, h, d |
//! | `morphology` | `dilate3d`      | src, element, dst, w, h, d, ew, eh, ed |
//! | `morphology` | `erode3d`       | src, element, dst, w, h, d, ew, eh, ed |

use std::sync::Arc;

use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftDirection, FftPlanner};

use crate::backend::{KernelArg, WorkGroup};
use crate::{ComputeError, ComputeResult};

pub(super) type KernelFn = fn(&mut Invocation<'_>) -> ComputeResult<()>;

/// A named set of kernels.
pub(crate) struct Program {
    name: &'static str,
    kernels: &'static [(&'static str, KernelFn)],
}

impl Program {
    pub(super) fn kernel(&self, name: &str) -> Option<KernelFn> {
        self.kernels.iter().find(|(k, _)| *k == name).map(|(_, f)| *f)
    }
}

static PROGRAMS: &[Program] = &[
    Program {
        name: "median",
        kernels: &[("median3d", median3d as KernelFn)],
    },
    Program {
        name: "bilateral",
        kernels: &[("bilateral3d", bilateral3d as KernelFn)],
    },
    Program {
        name: "fft",
        kernels: &[
            ("fft2d_forward", fft2d_forward as KernelFn),
            ("fft2d_inverse", fft2d_inverse as KernelFn),
        ],
    },
    Program {
        name: "mask",
        kernels: &[("apply_mask", apply_mask as KernelFn)],
    },
    Program {
        name: "morphology",
        kernels: &[
            ("dilate3d", dilate3d as KernelFn),
            ("erode3d", erode3d as KernelFn),
        ],
    },
];

/// Looks up a program by name.
pub(super) fn find_program(name: &str) -> Option<&'static Program> {
    PROGRAMS.iter().find(|p| p.name == name)
}

/// Arguments of one kernel dispatch.
///
/// Buffer arguments are moved into `slots` for the duration of the call,
/// scalar arguments leave an empty slot.
pub(crate) struct Invocation<'a> {
    args: &'a [KernelArg],
    slots: Vec<Vec<u8>>,
    range: WorkGroup,
}

impl<'a> Invocation<'a> {
    pub(super) fn new(args: &'a [KernelArg], slots: Vec<Vec<u8>>, range: WorkGroup) -> Self {
        Self { args, slots, range }
    }

    pub(super) fn into_slots(self) -> Vec<Vec<u8>> {
        self.slots
    }

    fn arity(&self, expected: usize) -> ComputeResult<()> {
        if self.args.len() != expected {
            return Err(ComputeError::Dispatch(format!(
                "expected {expected} kernel arguments, got {}",
                self.args.len()
            )));
        }
        Ok(())
    }

    fn int(&self, index: usize) -> ComputeResult<i32> {
        match self.args.get(index) {
            Some(KernelArg::Int(v)) => Ok(*v),
            other => Err(bad_arg(index, "int", other)),
        }
    }

    fn float(&self, index: usize) -> ComputeResult<f32> {
        match self.args.get(index) {
            Some(KernelArg::Float(v)) => Ok(*v),
            other => Err(bad_arg(index, "float", other)),
        }
    }

    fn size(&self, index: usize) -> ComputeResult<usize> {
        let v = self.int(index)?;
        usize::try_from(v)
            .map_err(|_| ComputeError::Dispatch(format!("argument {index} must be non-negative, got {v}")))
    }

    /// Reads `width, height, slices` starting at `first`.
    fn extent(&self, first: usize) -> ComputeResult<(usize, usize, usize)> {
        let extent = (self.size(first)?, self.size(first + 1)?, self.size(first + 2)?);
        let (w, h, _) = extent;
        if self.range.global[0] * self.range.global[1] < w * h {
            return Err(ComputeError::Dispatch(format!(
                "work range {:?} does not cover a {w}x{h} slice",
                self.range.global
            )));
        }
        Ok(extent)
    }

    /// Borrows the first `len` bytes of buffer argument `index`.
    fn input(&self, index: usize, len: usize) -> ComputeResult<&[u8]> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(_)) => self.slots[index]
                .get(..len)
                .ok_or_else(|| too_small(index, len, self.slots[index].len())),
            other => Err(bad_arg(index, "buffer", other)),
        }
    }

    /// Runs `f` with exclusive access to buffer argument `index`.
    ///
    /// Other buffers stay readable through the invocation passed to `f`.
    fn write_to<R>(
        &mut self,
        index: usize,
        f: impl FnOnce(&Invocation<'a>, &mut [u8]) -> ComputeResult<R>,
    ) -> ComputeResult<R> {
        match self.args.get(index) {
            Some(KernelArg::Buffer(_)) => {}
            other => return Err(bad_arg(index, "buffer", other)),
        }
        let mut out = std::mem::take(&mut self.slots[index]);
        let result = f(self, &mut out);
        self.slots[index] = out;
        result
    }
}

fn bad_arg(index: usize, expected: &str, got: Option<&KernelArg>) -> ComputeError {
    ComputeError::Dispatch(format!("argument {index}: expected {expected}, got {got:?}"))
}

fn too_small(index: usize, needed: usize, len: usize) -> ComputeError {
    ComputeError::Dispatch(format!("buffer argument {index} holds {len} bytes, kernel needs {needed}"))
}

fn region(out: &mut [u8], index: usize, len: usize) -> ComputeResult<&mut [u8]> {
    let available = out.len();
    out.get_mut(..len).ok_or_else(|| too_small(index, len, available))
}

#[inline]
fn clamp_axis(v: usize, offset: isize, n: usize) -> usize {
    (v as isize + offset).clamp(0, n as isize - 1) as usize
}

#[inline]
fn offset_axis(v: usize, offset: isize, n: usize) -> Option<usize> {
    let p = v as isize + offset;
    (p >= 0 && (p as usize) < n).then_some(p as usize)
}

// =============================================================================
// Median
// =============================================================================

/// 3x3x3 median; the window collapses along singleton axes.
fn median3d(inv: &mut Invocation<'_>) -> ComputeResult<()> {
    inv.arity(5)?;
    let (w, h, d) = inv.extent(2)?;
    let plane = w * h;
    let n = plane * d;
    let rx = isize::from(w > 1);
    let ry = isize::from(h > 1);
    let rz = isize::from(d > 1);

    inv.write_to(1, |inv, out| {
        let src = inv.input(0, n)?;
        region(out, 1, n)?
            .par_chunks_mut(plane)
            .enumerate()
            .for_each(|(z, slice)| {
                let mut window = Vec::with_capacity(27);
                for y in 0..h {
                    for x in 0..w {
                        window.clear();
                        for dz in -rz..=rz {
                            let sz = clamp_axis(z, dz, d);
                            for dy in -ry..=ry {
                                let sy = clamp_axis(y, dy, h);
                                for dx in -rx..=rx {
                                    let sx = clamp_axis(x, dx, w);
                                    window.push(src[sz * plane + sy * w + sx]);
                                }
                            }
                        }
                        window.sort_unstable();
                        slice[y * w + x] = window[window.len() / 2];
                    }
                }
            });
        Ok(())
    })
}

// =============================================================================
// Bilateral
// =============================================================================

/// Edge-preserving smoothing with host-supplied spatial weights.
///
/// `weights` holds `(2r + 1)^3` little-endian `f32` values in z, y, x order.
fn bilateral3d(inv: &mut Invocation<'_>) -> ComputeResult<()> {
    inv.arity(8)?;
    let (w, h, d) = inv.extent(3)?;
    let radius = inv.size(6)?;
    let sigma = inv.float(7)?.max(f32::EPSILON);
    let plane = w * h;
    let n = plane * d;
    let side = 2 * radius + 1;

    let weights: Vec<f32> = inv
        .input(2, side * side * side * 4)?
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let r = radius as isize;
    let range_denom = 2.0 * sigma * sigma;

    inv.write_to(1, |inv, out| {
        let src = inv.input(0, n)?;
        region(out, 1, n)?
            .par_chunks_mut(plane)
            .enumerate()
            .for_each(|(z, slice)| {
                for y in 0..h {
                    for x in 0..w {
                        let center = f32::from(src[z * plane + y * w + x]);
                        let mut sum = 0.0f32;
                        let mut norm = 0.0f32;
                        let mut k = 0;
                        for dz in -r..=r {
                            for dy in -r..=r {
                                for dx in -r..=r {
                                    let spatial = weights[k];
                                    k += 1;
                                    let (Some(sz), Some(sy), Some(sx)) = (
                                        offset_axis(z, dz, d),
                                        offset_axis(y, dy, h),
                                        offset_axis(x, dx, w),
                                    ) else {
                                        continue;
                                    };
                                    let v = f32::from(src[sz * plane + sy * w + sx]);
                                    let diff = v - center;
                                    let weight = spatial * (-(diff * diff) / range_denom).exp();
                                    sum += weight * v;
                                    norm += weight;
                                }
                            }
                        }
                        let value = if norm > 0.0 { sum / norm } else { center };
                        slice[y * w + x] = value.round().clamp(0.0, 255.0) as u8;
                    }
                }
            });
        Ok(())
    })
}

// =============================================================================
// FFT
// =============================================================================

/// Row and column plans for a 2-D transform of a `w x h` slice.
struct Plan2d {
    rows: Arc<dyn Fft<f32>>,
    cols: Arc<dyn Fft<f32>>,
    w: usize,
    h: usize,
}

impl Plan2d {
    fn new(w: usize, h: usize, direction: FftDirection) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            rows: planner.plan_fft(w, direction),
            cols: planner.plan_fft(h, direction),
            w,
            h,
        }
    }

    fn transform(&self, mut data: Vec<Complex<f32>>) -> Vec<Complex<f32>> {
        self.rows.process(&mut data);
        let mut columns = transpose(&data, self.w, self.h);
        self.cols.process(&mut columns);
        transpose(&columns, self.h, self.w)
    }
}

/// Transposes a row-major `w x h` grid into `h x w`.
fn transpose(data: &[Complex<f32>], w: usize, h: usize) -> Vec<Complex<f32>> {
    let mut out = vec![Complex::new(0.0, 0.0); data.len()];
    for y in 0..h {
        for x in 0..w {
            out[x * h + y] = data[y * w + x];
        }
    }
    out
}

/// Cyclic shift of a `w x h` slice by `(ox, oy)`.
fn shift(src: &[u8], dst: &mut [u8], w: usize, h: usize, ox: usize, oy: usize) {
    for y in 0..h {
        for x in 0..w {
            dst[((y + oy) % h) * w + (x + ox) % w] = src[y * w + x];
        }
    }
}

/// Per-slice log-magnitude spectrum, centred and scaled to `0..=255`.
fn fft2d_forward(inv: &mut Invocation<'_>) -> ComputeResult<()> {
    inv.arity(6)?;
    let (w, h, d) = inv.extent(3)?;
    let plane = w * h;
    let n = plane * d;
    let plan = Plan2d::new(w, h, FftDirection::Forward);

    inv.write_to(2, |inv, tmp| {
        let src = inv.input(0, n)?;
        region(tmp, 2, n)?
            .par_chunks_mut(plane)
            .zip(src.par_chunks(plane))
            .for_each(|(out, slice)| {
                let data = slice.iter().map(|&v| Complex::new(f32::from(v), 0.0)).collect();
                let magnitude: Vec<f32> = plan.transform(data).iter().map(|c| c.norm().ln_1p()).collect();
                let max = magnitude.iter().copied().fold(0.0f32, f32::max);
                for (o, m) in out.iter_mut().zip(&magnitude) {
                    *o = if max > 0.0 { (m / max * 255.0).round() as u8 } else { 0 };
                }
            });
        Ok(())
    })?;

    inv.write_to(1, |inv, out| {
        let tmp = inv.input(2, n)?;
        region(out, 1, n)?
            .par_chunks_mut(plane)
            .zip(tmp.par_chunks(plane))
            .for_each(|(o, t)| shift(t, o, w, h, w / 2, h / 2));
        Ok(())
    })
}

/// Per-slice inverse transform of a centred real spectrum.
fn fft2d_inverse(inv: &mut Invocation<'_>) -> ComputeResult<()> {
    inv.arity(6)?;
    let (w, h, d) = inv.extent(3)?;
    let plane = w * h;
    let n = plane * d;
    let plan = Plan2d::new(w, h, FftDirection::Inverse);
    let scale = plane as f32;

    inv.write_to(2, |inv, tmp| {
        let src = inv.input(0, n)?;
        region(tmp, 2, n)?
            .par_chunks_mut(plane)
            .zip(src.par_chunks(plane))
            .for_each(|(t, s)| shift(s, t, w, h, w - w / 2, h - h / 2));
        Ok(())
    })?;

    inv.write_to(1, |inv, out| {
        let tmp = inv.input(2, n)?;
        region(out, 1, n)?
            .par_chunks_mut(plane)
            .zip(tmp.par_chunks(plane))
            .for_each(|(o, t)| {
                let data = t.iter().map(|&v| Complex::new(f32::from(v), 0.0)).collect();
                for (dst, c) in o.iter_mut().zip(plan.transform(data)) {
                    *dst = (c.norm() / scale).round().clamp(0.0, 255.0) as u8;
                }
            });
        Ok(())
    })
}

// =============================================================================
// Mask
// =============================================================================

/// Keeps samples where the mask is non-zero, zeroes the rest.
fn apply_mask(inv: &mut Invocation<'_>) -> ComputeResult<()> {
    inv.arity(6)?;
    let (w, h, d) = inv.extent(3)?;
    let n = w * h * d;

    inv.write_to(2, |inv, out| {
        let src = inv.input(0, n)?;
        let mask = inv.input(1, n)?;
        region(out, 2, n)?
            .par_iter_mut()
            .zip(src.par_iter().zip(mask.par_iter()))
            .for_each(|(o, (&s, &m))| *o = if m != 0 { s } else { 0 });
        Ok(())
    })
}

// =============================================================================
// Morphology
// =============================================================================

#[derive(Clone, Copy)]
enum MorphOp {
    Dilate,
    Erode,
}

fn dilate3d(inv: &mut Invocation<'_>) -> ComputeResult<()> {
    morph3d(inv, MorphOp::Dilate)
}

fn erode3d(inv: &mut Invocation<'_>) -> ComputeResult<()> {
    morph3d(inv, MorphOp::Erode)
}

/// Grey-level dilation (max) or erosion (min) under a binary element
/// centred at `(ed / 2, eh / 2, ew / 2)`. Neighbours outside the chunk are
/// ignored.
fn morph3d(inv: &mut Invocation<'_>, op: MorphOp) -> ComputeResult<()> {
    inv.arity(9)?;
    let (w, h, d) = inv.extent(3)?;
    let (ew, eh, ed) = (inv.size(6)?, inv.size(7)?, inv.size(8)?);
    let plane = w * h;
    let n = plane * d;

    let element = inv.input(1, ew * eh * ed)?;
    let (cx, cy, cz) = ((ew / 2) as isize, (eh / 2) as isize, (ed / 2) as isize);
    let mut offsets = Vec::new();
    for ez in 0..ed {
        for ey in 0..eh {
            for ex in 0..ew {
                if element[(ez * eh + ey) * ew + ex] != 0 {
                    offsets.push((ez as isize - cz, ey as isize - cy, ex as isize - cx));
                }
            }
        }
    }
    let (init, pick): (u8, fn(u8, u8) -> u8) = match op {
        MorphOp::Dilate => (u8::MIN, u8::max),
        MorphOp::Erode => (u8::MAX, u8::min),
    };

    inv.write_to(2, |inv, out| {
        let src = inv.input(0, n)?;
        region(out, 2, n)?
            .par_chunks_mut(plane)
            .enumerate()
            .for_each(|(z, slice)| {
                for y in 0..h {
                    for x in 0..w {
                        let mut acc = init;
                        for &(dz, dy, dx) in &offsets {
                            if let (Some(sz), Some(sy), Some(sx)) =
                                (offset_axis(z, dz, d), offset_axis(y, dy, h), offset_axis(x, dx, w))
                            {
                                acc = pick(acc, src[sz * plane + sy * w + sx]);
                            }
                        }
                        slice[y * w + x] = acc;
                    }
                }
            });
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferHandle, CommandQueue, ComputeDevice, CpuDevice};

    /// Runs `kernel` on a single-slab volume and returns the output buffer.
    fn run(
        program: &str,
        kernel: &str,
        src: &[u8],
        extra: Option<&[u8]>,
        extent: (usize, usize, usize),
        scalars: &[KernelArg],
    ) -> Vec<u8> {
        let device = CpuDevice::new();
        let mut queue = device.create_queue().unwrap();
        let program = queue.build_program(program).unwrap();
        let (w, h, d) = extent;

        let upload = |queue: &mut Box<dyn CommandQueue>, data: &[u8]| -> BufferHandle {
            let b = queue.allocate(data.len()).unwrap();
            queue.write(b, 0, data).unwrap();
            b
        };
        let a = upload(&mut queue, src);
        let out = queue.allocate(src.len()).unwrap();
        let mut args = vec![KernelArg::Buffer(a)];
        match extra {
            // Second input sits between src and dst (mask, element)
            Some(bytes) if program.name() != "bilateral" => {
                let e = upload(&mut queue, bytes);
                args.push(KernelArg::Buffer(e));
                args.push(KernelArg::Buffer(out));
            }
            Some(bytes) => {
                let e = upload(&mut queue, bytes);
                args.push(KernelArg::Buffer(out));
                args.push(KernelArg::Buffer(e));
            }
            None => args.push(KernelArg::Buffer(out)),
        }
        if program.name() == "fft" {
            let tmp = queue.allocate(src.len()).unwrap();
            args.push(KernelArg::Buffer(tmp));
        }
        args.extend([w, h, d].map(|v| KernelArg::Int(v as i32)));
        args.extend_from_slice(scalars);

        let range = WorkGroup::compute(queue.device_info(), &[w, h]).unwrap();
        queue.dispatch(&program, kernel, &args, &range).unwrap();
        let mut result = vec![0u8; src.len()];
        queue.read(out, 0, &mut result).unwrap();
        result
    }

    #[test]
    fn test_median_removes_outlier() {
        let mut src = vec![10u8; 27];
        src[13] = 255;
        let out = run("median", "median3d", &src, None, (3, 3, 3), &[]);
        assert!(out.iter().all(|&v| v == 10));
    }

    #[test]
    fn test_median_flat_slice() {
        // Single slice: 3x3 window, a lone spike disappears
        let mut src = vec![0u8; 25];
        src[12] = 200;
        let out = run("median", "median3d", &src, None, (5, 5, 1), &[]);
        assert!(out.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_mask_zeroes_background() {
        let src = [5u8, 6, 7, 8];
        let mask = [1u8, 0, 255, 0];
        let out = run("mask", "apply_mask", &src, Some(&mask), (2, 2, 1), &[]);
        assert_eq!(out, vec![5, 0, 7, 0]);
    }

    #[test]
    fn test_dilate_and_erode_single_voxel() {
        let mut src = vec![0u8; 27];
        src[13] = 255;
        let cube = [1u8; 27];
        let dims = [3, 3, 3].map(KernelArg::Int);

        let dilated = run("morphology", "dilate3d", &src, Some(&cube), (3, 3, 3), &dims);
        assert!(dilated.iter().all(|&v| v == 255));

        let eroded = run("morphology", "erode3d", &src, Some(&cube), (3, 3, 3), &dims);
        assert!(eroded.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_bilateral_constant_is_fixed_point() {
        let src = vec![77u8; 4 * 4 * 3];
        let weights: Vec<u8> = std::iter::repeat_n(1.0f32, 27).flat_map(f32::to_le_bytes).collect();
        let out = run(
            "bilateral",
            "bilateral3d",
            &src,
            Some(&weights),
            (4, 4, 3),
            &[KernelArg::Int(1), KernelArg::Float(30.0)],
        );
        assert!(out.iter().all(|&v| v == 77));
    }

    #[test]
    fn test_fft_forward_peaks_at_centre() {
        let src = vec![100u8; 8 * 8];
        let out = run("fft", "fft2d_forward", &src, None, (8, 8, 1), &[]);
        // Constant input: all energy in the DC term, shifted to (4, 4)
        assert_eq!(out[4 * 8 + 4], 255);
        assert_eq!(out.iter().filter(|&&v| v != 0).count(), 1);
    }

    #[test]
    fn test_fft_inverse_of_centred_dc() {
        let mut src = vec![0u8; 8 * 8];
        src[4 * 8 + 4] = 128;
        let out = run("fft", "fft2d_inverse", &src, None, (8, 8, 1), &[]);
        // DC of 128 spreads evenly: 128 / 64 = 2
        assert!(out.iter().all(|&v| v == 2));
    }

    #[test]
    fn test_shift_roundtrip_odd() {
        let src: Vec<u8> = (0..15).collect();
        let mut a = vec![0u8; 15];
        let mut b = vec![0u8; 15];
        shift(&src, &mut a, 5, 3, 5 / 2, 3 / 2);
        shift(&a, &mut b, 5, 3, 5 - 5 / 2, 3 - 3 / 2);
        assert_eq!(b, src);
    }
}
