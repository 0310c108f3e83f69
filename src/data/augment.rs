use image::{imageops, GrayImage, Rgb, RgbImage};
use rand::Rng;

/// Parameters of one sample's augmentation, kept so that predictions on
/// different views can be aligned.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AugParams {
    pub flipped: bool,
    pub brightness: f32,
    pub contrast: f32,
    pub grayscale: bool,
}

impl Default for AugParams {
    fn default() -> Self {
        AugParams {
            flipped: false,
            brightness: 1.0,
            contrast: 1.0,
            grayscale: false,
        }
    }
}

impl AugParams {
    /// Weak view: geometric only (horizontal flip with probability 0.5).
    pub fn sample_weak<R: Rng>(rng: &mut R) -> Self {
        AugParams {
            flipped: rng.random_bool(0.5),
            ..Default::default()
        }
    }

    /// Strong view on top of a weak one: same geometry, photometric jitter.
    pub fn sample_strong<R: Rng>(rng: &mut R, weak: &AugParams) -> Self {
        AugParams {
            flipped: weak.flipped,
            brightness: rng.random_range(0.6..1.4),
            contrast: rng.random_range(0.6..1.4),
            grayscale: rng.random_bool(0.2),
        }
    }

    pub fn is_photometric_identity(&self) -> bool {
        self.brightness == 1.0 && self.contrast == 1.0 && !self.grayscale
    }
}

pub fn flip_rgb(img: &RgbImage, params: &AugParams) -> RgbImage {
    if params.flipped {
        imageops::flip_horizontal(img)
    } else {
        img.clone()
    }
}

pub fn flip_gray(img: &GrayImage, params: &AugParams) -> GrayImage {
    if params.flipped {
        imageops::flip_horizontal(img)
    } else {
        img.clone()
    }
}

fn luminance(p: &Rgb<u8>) -> f32 {
    0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32
}

/// Brightness, then contrast around the mean luminance, then optional greyscale.
pub fn photometric(img: &RgbImage, params: &AugParams) -> RgbImage {
    if params.is_photometric_identity() {
        return img.clone();
    }
    let n = (img.width() * img.height()).max(1) as f32;
    let mean = img.pixels().map(luminance).sum::<f32>() / n * params.brightness;

    let mut out = img.clone();
    for px in out.pixels_mut() {
        let mut c = [0f32; 3];
        for (k, v) in c.iter_mut().enumerate() {
            let bright = px[k] as f32 * params.brightness;
            *v = (bright - mean) * params.contrast + mean;
        }
        if params.grayscale {
            let l = 0.299 * c[0] + 0.587 * c[1] + 0.114 * c[2];
            c = [l; 3];
        }
        for k in 0..3 {
            px[k] = c[k].round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}
