//! Weak and strong augmentation on CHW float buffers.
//!
//! Weak: random horizontal flip and a reflect-padded random crop.
//! Strong: weak, then randomly chosen photometric ops and a cutout square.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::CHANNELS;

/// Flip + pad-and-crop
#[derive(Debug, Clone)]
pub struct WeakAugment {
    image_size: usize,
    padding: usize,
}

impl WeakAugment {
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size,
            padding: image_size / 8,
        }
    }

    pub fn apply<R: Rng>(&self, pixels: &[f32], rng: &mut R) -> Vec<f32> {
        let mut out = if rng.gen_bool(0.5) {
            flip_horizontal(pixels, self.image_size)
        } else {
            pixels.to_vec()
        };
        if self.padding > 0 {
            let dy = rng.gen_range(0..=2 * self.padding);
            let dx = rng.gen_range(0..=2 * self.padding);
            out = reflect_crop(&out, self.image_size, self.padding, dy, dx);
        }
        out
    }
}

/// Photometric operations sampled by [`StrongAugment`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotometricOp {
    Identity,
    Brightness,
    Contrast,
    Solarize,
    Posterize,
    AutoContrast,
}

const OPS: [PhotometricOp; 6] = [
    PhotometricOp::Identity,
    PhotometricOp::Brightness,
    PhotometricOp::Contrast,
    PhotometricOp::Solarize,
    PhotometricOp::Posterize,
    PhotometricOp::AutoContrast,
];

/// Weak augmentation followed by `num_ops` random ops and cutout
#[derive(Debug, Clone)]
pub struct StrongAugment {
    weak: WeakAugment,
    num_ops: usize,
    /// Max cutout side as a fraction of the image side
    cutout: f32,
}

impl StrongAugment {
    pub fn new(image_size: usize) -> Self {
        Self {
            weak: WeakAugment::new(image_size),
            num_ops: 2,
            cutout: 0.5,
        }
    }

    pub fn apply<R: Rng>(&self, pixels: &[f32], rng: &mut R) -> Vec<f32> {
        let mut out = self.weak.apply(pixels, rng);
        for _ in 0..self.num_ops {
            if let Some(op) = OPS.choose(rng) {
                apply_op(&mut out, *op, self.weak.image_size, rng);
            }
        }
        cutout(&mut out, self.weak.image_size, self.cutout, rng);
        out
    }
}

fn apply_op<R: Rng>(pixels: &mut [f32], op: PhotometricOp, size: usize, rng: &mut R) {
    match op {
        PhotometricOp::Identity => {}
        PhotometricOp::Brightness => {
            let factor = rng.gen_range(0.5..1.5);
            pixels.iter_mut().for_each(|p| *p = (*p * factor).clamp(0.0, 1.0));
        }
        PhotometricOp::Contrast => {
            let factor = rng.gen_range(0.5..1.5);
            let mean = pixels.iter().sum::<f32>() / pixels.len().max(1) as f32;
            pixels
                .iter_mut()
                .for_each(|p| *p = ((*p - mean) * factor + mean).clamp(0.0, 1.0));
        }
        PhotometricOp::Solarize => {
            let threshold = rng.gen_range(0.0..1.0);
            pixels.iter_mut().filter(|p| **p >= threshold).for_each(|p| *p = 1.0 - *p);
        }
        PhotometricOp::Posterize => {
            let bits: u32 = rng.gen_range(4..=8);
            let shift = 8 - bits;
            pixels.iter_mut().for_each(|p| {
                let v = ((*p * 255.0).round() as u32).min(255);
                *p = ((v >> shift) << shift) as f32 / 255.0;
            });
        }
        PhotometricOp::AutoContrast => {
            let plane = size * size;
            for channel in pixels.chunks_mut(plane) {
                let (lo, hi) = channel
                    .iter()
                    .fold((f32::MAX, f32::MIN), |(lo, hi), &p| (lo.min(p), hi.max(p)));
                if hi > lo {
                    channel.iter_mut().for_each(|p| *p = (*p - lo) / (hi - lo));
                }
            }
        }
    }
}

pub fn flip_horizontal(pixels: &[f32], size: usize) -> Vec<f32> {
    let mut out = pixels.to_vec();
    for row in out.chunks_mut(size) {
        row.reverse();
    }
    out
}

fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let r = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    r.clamp(0, n - 1) as usize
}

/// Crop at offset (dy, dx) of the image padded by `pad` reflected pixels
pub fn reflect_crop(pixels: &[f32], size: usize, pad: usize, dy: usize, dx: usize) -> Vec<f32> {
    let plane = size * size;
    let mut out = vec![0.0; pixels.len()];
    for c in 0..CHANNELS {
        for y in 0..size {
            let sy = reflect(y as isize + dy as isize - pad as isize, size);
            for x in 0..size {
                let sx = reflect(x as isize + dx as isize - pad as isize, size);
                out[c * plane + y * size + x] = pixels[c * plane + sy * size + sx];
            }
        }
    }
    out
}

/// Fill a random square with mid-gray
fn cutout<R: Rng>(pixels: &mut [f32], size: usize, max_ratio: f32, rng: &mut R) {
    let max_side = ((size as f32 * max_ratio) as usize).max(1);
    let side = rng.gen_range(1..=max_side);
    let cy = rng.gen_range(0..size);
    let cx = rng.gen_range(0..size);
    let y0 = cy.saturating_sub(side / 2);
    let x0 = cx.saturating_sub(side / 2);
    let y1 = (y0 + side).min(size);
    let x1 = (x0 + side).min(size);

    let plane = size * size;
    for c in 0..CHANNELS {
        for y in y0..y1 {
            for x in x0..x1 {
                pixels[c * plane + y * size + x] = 0.5;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn gradient_image(size: usize) -> Vec<f32> {
        (0..CHANNELS * size * size)
            .map(|i| (i % (size * size)) as f32 / (size * size) as f32)
            .collect()
    }

    #[test]
    fn test_flip_twice_is_identity() {
        let img = gradient_image(4);
        assert_eq!(flip_horizontal(&flip_horizontal(&img, 4), 4), img);
    }

    #[test]
    fn test_centered_crop_is_identity() {
        let img = gradient_image(8);
        assert_eq!(reflect_crop(&img, 8, 1, 1, 1), img);
    }

    #[test]
    fn test_reflect_crop_shift() {
        let size = 4;
        let img = gradient_image(size);
        // Shift by one row down: row 0 comes from reflected row 1
        let out = reflect_crop(&img, size, 1, 0, 1);
        assert_eq!(out[0], img[size]);
        assert_eq!(out[size], img[0]);
    }

    #[test]
    fn test_augment_preserves_shape_and_range() {
        let img = gradient_image(32);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let weak = WeakAugment::new(32).apply(&img, &mut rng);
        let strong = StrongAugment::new(32).apply(&img, &mut rng);

        assert_eq!(weak.len(), img.len());
        assert_eq!(strong.len(), img.len());
        assert!(strong.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_augment_is_seeded() {
        let img = gradient_image(16);
        let strong = StrongAugment::new(16);
        let a = strong.apply(&img, &mut ChaCha8Rng::seed_from_u64(9));
        let b = strong.apply(&img, &mut ChaCha8Rng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn test_autocontrast_stretches_range() {
        let mut img = vec![0.25; CHANNELS * 4];
        img[0] = 0.5;
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        apply_op(&mut img, PhotometricOp::AutoContrast, 2, &mut rng);
        assert_eq!(img[0], 1.0);
        assert_eq!(img[1], 0.0);
        // Constant channels are left untouched
        assert_eq!(img[4], 0.25);
    }
}
