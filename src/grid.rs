//! # Image Grids
//!
//! Tiles a batch of images into one picture and writes it as a binary
//! PGM (one channel) or PPM (three channels) file.

use candle_core::{DType, Tensor};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::GtnError;
use crate::GtnResult;

/// Tile `(B, C, H, W)` into `(C, rows·(H+p)+p, cols·(W+p)+p)` with `nrow`
/// images per row and `padding` zero pixels between and around them
pub fn make_grid(images: &Tensor, nrow: usize, padding: usize) -> GtnResult<Tensor> {
    let (b, c, h, w) = images.dims4()?;
    if b == 0 {
        return Err(GtnError::DataExhausted("cannot tile an empty batch".to_string()));
    }
    let cols = nrow.clamp(1, b);
    let rows = b.div_ceil(cols);
    let images = images.to_dtype(DType::F32)?;
    let blank = Tensor::zeros((c, h, w), DType::F32, images.device())?;

    let mut grid_rows = Vec::with_capacity(rows);
    for r in 0..rows {
        let mut tiles = Vec::with_capacity(cols);
        for col in 0..cols {
            let idx = r * cols + col;
            let tile = if idx < b {
                images.get(idx)?
            } else {
                blank.clone()
            };
            tiles.push(tile.pad_with_zeros(1, padding, 0)?.pad_with_zeros(2, padding, 0)?);
        }
        grid_rows.push(Tensor::cat(&tiles, 2)?);
    }
    let grid = Tensor::cat(&grid_rows, 1)?;
    Ok(grid.pad_with_zeros(1, 0, padding)?.pad_with_zeros(2, 0, padding)?)
}

/// Min/max-normalise to bytes
fn to_bytes(image: &Tensor) -> GtnResult<Vec<u8>> {
    let values: Vec<f32> = image.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    let (lo, hi) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = if hi > lo { hi - lo } else { 1.0 };
    Ok(values
        .iter()
        .map(|v| (((v - lo) / range) * 255.0).round().clamp(0.0, 255.0) as u8)
        .collect())
}

/// Write a `(C, H, W)` image as PGM (`C = 1`) or PPM (`C = 3`)
pub fn write_image(image: &Tensor, path: impl AsRef<Path>) -> GtnResult<()> {
    let (c, h, w) = image.dims3()?;
    let (magic, data) = match c {
        1 => ("P5", to_bytes(image)?),
        // PPM wants interleaved RGB
        3 => ("P6", to_bytes(&image.permute((1, 2, 0))?.contiguous()?)?),
        _ => {
            return Err(GtnError::InvalidConfig(format!(
                "can only write 1 or 3 channel images, got {}",
                c
            )))
        }
    };
    let file = File::create(path.as_ref())
        .map_err(|e| GtnError::Io(format!("Failed to create {:?}: {}", path.as_ref(), e)))?;
    let mut out = BufWriter::new(file);
    write!(out, "{}\n{} {}\n255\n", magic, w, h)?;
    out.write_all(&data)?;
    out.flush()?;
    Ok(())
}

/// [`make_grid`] then [`write_image`]
pub fn save_grid(images: &Tensor, nrow: usize, padding: usize, path: impl AsRef<Path>) -> GtnResult<()> {
    let grid = make_grid(images, nrow, padding)?;
    write_image(&grid, &path)?;
    log::info!("Wrote {} image grid to {:?}", images.dim(0)?, path.as_ref());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_grid_shape() {
        let images = Tensor::ones((5, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let grid = make_grid(&images, 3, 2).unwrap();
        // 2 rows x 3 cols of 4x4 tiles with 2px padding
        assert_eq!(grid.dims(), &[1, 2 * 6 + 2, 3 * 6 + 2]);
        let lit: f32 = grid.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(lit, 5.0 * 16.0);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let images = Tensor::zeros((0, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(make_grid(&images, 4, 1).is_err());
    }

    #[test]
    fn test_write_pgm() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.pgm");
        let images = Tensor::rand(0.5f32, 1.0, (4, 1, 3, 3), &Device::Cpu).unwrap();
        save_grid(&images, 2, 1, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header = b"P5\n9 9\n255\n";
        assert!(bytes.starts_with(header));
        assert_eq!(bytes.len(), header.len() + 81);
        // padding is the minimum, so it maps to 0; some pixel hits 255
        assert_eq!(bytes[header.len()], 0);
        assert!(bytes[header.len()..].contains(&255));
    }

    #[test]
    fn test_save_grid_takes_owned_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owned.pgm");
        let images = Tensor::rand(0.0f32, 1.0, (3, 1, 2, 2), &Device::Cpu).unwrap();
        save_grid(&images, 3, 0, path.clone()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"P5\n6 2\n255\n"));
    }

    #[test]
    fn test_write_ppm_and_reject_two_channels() {
        let dir = tempfile::tempdir().unwrap();
        let rgb = Tensor::randn(0f32, 1.0, (3, 2, 2), &Device::Cpu).unwrap();
        write_image(&rgb, dir.path().join("x.ppm")).unwrap();
        let bytes = std::fs::read(dir.path().join("x.ppm")).unwrap();
        assert!(bytes.starts_with(b"P6\n2 2\n255\n"));

        let two = Tensor::zeros((2, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(write_image(&two, dir.path().join("y.pgm")).is_err());
    }
}
