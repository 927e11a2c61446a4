use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::{imageops::FilterType, DynamicImage};

const MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Decode, convert to RGB, resize to `size`x`size` and normalize into CHW order.
pub fn image_to_chw(bytes: &[u8], size: usize) -> Result<Vec<f32>, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    Ok(normalize(&img, size))
}

fn normalize(img: &DynamicImage, size: usize) -> Vec<f32> {
    let rgb = img
        .resize_exact(size as u32, size as u32, FilterType::Triangle)
        .to_rgb8();
    let plane = size * size;
    let mut out = vec![0.0f32; 3 * plane];
    for (i, pixel) in rgb.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + i] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }
    out
}

/// Wrap a CHW buffer as a batch of one: `[1, 3, size, size]`.
pub fn to_batch<B: Backend>(chw: Vec<f32>, size: usize, device: &B::Device) -> Tensor<B, 4> {
    Tensor::from_data(TensorData::new(chw, [1, 3, size, size]), device)
}
