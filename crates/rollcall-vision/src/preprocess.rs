//! Grayscale resampling and tensor packing shared by the three networks.

use ndarray::Array4;
use rollcall_core::FaceBox;

/// Square region of the source frame, in frame pixels. May extend past the
/// frame edges; samples outside read as `fill`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub x: f32,
    pub y: f32,
    pub side: f32,
}

impl Region {
    /// Square around the centre of `face`, `scale` times its longer side.
    pub fn around(face: &FaceBox, scale: f32) -> Self {
        let side = face.width.max(face.height) * scale;
        let cx = face.x + face.width / 2.0;
        let cy = face.y + face.height / 2.0;
        Self {
            x: cx - side / 2.0,
            y: cy - side / 2.0,
            side,
        }
    }

    /// Map a point given in `[0, 1]` crop coordinates back to the frame.
    pub fn to_frame(&self, u: f32, v: f32) -> (f32, f32) {
        (self.x + u * self.side, self.y + v * self.side)
    }
}

/// Bilinearly resample `region` of a grayscale frame to `size x size`.
pub fn crop_resize(frame: &[u8], width: usize, height: usize, region: Region, size: usize, fill: u8) -> Vec<u8> {
    let mut out = vec![fill; size * size];
    if width == 0 || height == 0 || frame.len() < width * height || region.side <= 0.0 {
        return out;
    }

    let step = region.side / size as f32;
    for oy in 0..size {
        let sy = region.y + (oy as f32 + 0.5) * step - 0.5;
        if sy < -0.5 || sy > height as f32 - 0.5 {
            continue;
        }
        let y0 = sy.floor().clamp(0.0, (height - 1) as f32) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (sy - sy.floor()).clamp(0.0, 1.0);

        for ox in 0..size {
            let sx = region.x + (ox as f32 + 0.5) * step - 0.5;
            if sx < -0.5 || sx > width as f32 - 0.5 {
                continue;
            }
            let x0 = sx.floor().clamp(0.0, (width - 1) as f32) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (sx - sx.floor()).clamp(0.0, 1.0);

            let top = frame[y0 * width + x0] as f32 * (1.0 - fx) + frame[y0 * width + x1] as f32 * fx;
            let bottom = frame[y1 * width + x0] as f32 * (1.0 - fx) + frame[y1 * width + x1] as f32 * fx;
            out[oy * size + ox] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Scale and offset that fit a `width x height` frame into a centred square.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn fit(width: usize, height: usize, size: usize) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        Self {
            scale,
            pad_x: (size as f32 - width as f32 * scale) / 2.0,
            pad_y: (size as f32 - height as f32 * scale) / 2.0,
        }
    }

    /// The source region that the letterboxed square covers.
    pub fn region(&self, size: usize) -> Region {
        Region {
            x: -self.pad_x / self.scale,
            y: -self.pad_y / self.scale,
            side: size as f32 / self.scale,
        }
    }

    /// Map a letterboxed coordinate back to the source frame.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Pack a `size x size` grayscale crop into a 1x3xHxW tensor, replicating
/// luma into all three channels: `(pixel - mean[c]) / std`.
pub fn to_nchw(gray: &[u8], size: usize, mean: [f32; 3], std: f32) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let pixel = gray.get(y * size + x).copied().unwrap_or(0) as f32;
            for (c, m) in mean.iter().enumerate() {
                tensor[[0, c, y, x]] = (pixel - m) / std;
            }
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_resize_uniform() {
        let frame = vec![90u8; 40 * 30];
        let region = Region { x: 5.0, y: 5.0, side: 20.0 };
        let out = crop_resize(&frame, 40, 30, region, 8, 0);
        assert!(out.iter().all(|&p| p == 90));
    }

    #[test]
    fn test_crop_outside_frame_uses_fill() {
        let frame = vec![200u8; 10 * 10];
        let region = Region { x: 100.0, y: 100.0, side: 10.0 };
        let out = crop_resize(&frame, 10, 10, region, 4, 7);
        assert!(out.iter().all(|&p| p == 7));
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let lb = Letterbox::fit(640, 480, 640);
        assert!((lb.scale - 1.0).abs() < 1e-6);
        assert!((lb.pad_y - 80.0).abs() < 1e-6);

        let (x, y) = lb.unmap(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_letterbox_region_covers_frame() {
        let lb = Letterbox::fit(320, 240, 640);
        let region = lb.region(640);
        // Width fills the square; height is padded equally top and bottom.
        assert!((region.x - 0.0).abs() < 1e-4);
        assert!((region.side - 320.0).abs() < 1e-4);
        assert!((region.y + 40.0).abs() < 1e-4);
    }

    #[test]
    fn test_region_around_face() {
        let face = FaceBox { x: 10.0, y: 20.0, width: 40.0, height: 60.0 };
        let region = Region::around(&face, 1.0);
        assert_eq!(region, Region { x: 0.0, y: 20.0, side: 60.0 });
        assert_eq!(region.to_frame(0.5, 0.5), (30.0, 50.0));
    }

    #[test]
    fn test_to_nchw_shape_and_channels() {
        let tensor = to_nchw(&vec![128u8; 16], 4, [127.5, 127.5, 127.5], 128.0);
        assert_eq!(tensor.shape(), &[1, 3, 4, 4]);
        let expected = (128.0 - 127.5) / 128.0;
        assert!((tensor[[0, 2, 3, 3]] - expected).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 1, 1]], tensor[[0, 1, 1, 1]]);
    }
}
