//! FLUX latents are patchified into 2x2 patches and flattened into a sequence before entering the transformer.

use ndarray::{Array2, Array3, Array4, ArrayView3};
use ndarray_rand::{rand_distr::StandardNormal, RandomExt};
use rand::Rng;
use tracing::debug;

use crate::FluxError;

/// Returns the unpacked latent height & width for an image of `height` x `width` pixels. Both are rounded down to an
/// even number so the latents can be split into 2x2 patches.
pub fn latent_dims(height: usize, width: usize, vae_scale_factor: usize) -> (usize, usize) {
	(2 * (height / (vae_scale_factor * 2)), 2 * (width / (vae_scale_factor * 2)))
}

/// Packs `(batch, channels, h, w)` latents into `(batch, (h / 2) * (w / 2), channels * 4)`.
pub fn pack_latents(latents: Array4<f32>) -> anyhow::Result<Array3<f32>> {
	let (batch_size, channels, height, width) = latents.dim();
	if height % 2 != 0 || width % 2 != 0 {
		return Err(FluxError::invalid_argument(format!("latent size {height}x{width} must be even to be packed")).into());
	}

	let patches = latents
		.as_standard_layout()
		.into_owned()
		.into_shape((batch_size, channels, height / 2, 2, width / 2, 2))?
		.permuted_axes([0, 2, 4, 1, 3, 5]);
	Ok(patches
		.as_standard_layout()
		.into_owned()
		.into_shape((batch_size, (height / 2) * (width / 2), channels * 4))?)
}

/// Inverse of [`pack_latents`] for an image of `height` x `width` pixels.
pub fn unpack_latents(latents: ArrayView3<'_, f32>, height: usize, width: usize, vae_scale_factor: usize) -> anyhow::Result<Array4<f32>> {
	let (batch_size, num_patches, channels) = latents.dim();
	let (height, width) = latent_dims(height, width, vae_scale_factor);
	if num_patches != (height / 2) * (width / 2) || channels % 4 != 0 {
		return Err(FluxError::invalid_argument(format!(
			"packed latents of shape {:?} do not match a {height}x{width} latent image",
			latents.shape()
		))
		.into());
	}

	let latents = latents
		.as_standard_layout()
		.into_owned()
		.into_shape((batch_size, height / 2, width / 2, channels / 4, 2, 2))?
		.permuted_axes([0, 3, 1, 4, 2, 5]);
	Ok(latents
		.as_standard_layout()
		.into_owned()
		.into_shape((batch_size, channels / 4, height, width))?)
}

/// Positional ids for each packed latent patch, `((h / 2) * (w / 2), 3)`: column 1 holds the patch row and column 2
/// the patch column.
pub fn latent_image_ids(height: usize, width: usize) -> Array2<f32> {
	let (rows, cols) = (height / 2, width / 2);
	Array2::from_shape_fn((rows * cols, 3), |(i, axis)| match axis {
		1 => (i / cols) as f32,
		2 => (i % cols) as f32,
		_ => 0.0
	})
}

/// Prepares the initial packed latents and their image ids.
///
/// If `latents` is `None`, Gaussian noise of shape `(batch_size, num_channels_latents, h, w)` is drawn from `rng` and
/// packed. Otherwise the given packed latents are validated and used as-is.
pub fn prepare_latents<R: Rng + ?Sized>(
	batch_size: usize,
	num_channels_latents: usize,
	height: usize,
	width: usize,
	vae_scale_factor: usize,
	rng: &mut R,
	latents: Option<Array3<f32>>
) -> anyhow::Result<(Array3<f32>, Array2<f32>)> {
	let (latent_height, latent_width) = latent_dims(height, width, vae_scale_factor);
	let image_ids = latent_image_ids(latent_height, latent_width);
	let expected = (batch_size, (latent_height / 2) * (latent_width / 2), num_channels_latents * 4);

	if let Some(latents) = latents {
		if latents.dim() != expected {
			return Err(FluxError::invalid_argument(format!("expected latents of shape {expected:?}, got {:?}", latents.shape())).into());
		}
		return Ok((latents, image_ids));
	}

	let noise = Array4::<f32>::random_using((batch_size, num_channels_latents, latent_height, latent_width), StandardNormal, rng);
	let latents = pack_latents(noise)?;
	debug!(shape = ?latents.shape(), "prepared latents");
	Ok((latents, image_ids))
}
