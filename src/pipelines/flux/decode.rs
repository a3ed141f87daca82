use image::{DynamicImage, Rgb32FImage};
use ndarray::{Array3, Array4, ArrayView3, Axis};

use super::{latents::unpack_latents, FluxVaeDecoder};
use crate::FluxError;

/// The representation [`decode_latents`] produces.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
	/// float32 RGB [`DynamicImage`]s. **This is the default.**
	#[default]
	Image,
	/// `(height, width, 3)` arrays in `[0, 1]`.
	Array
}

/// A single decoded image.
#[derive(Debug, Clone)]
pub enum FluxOutput {
	/// An image, from [`OutputType::Image`].
	Image(DynamicImage),
	/// An `(height, width, 3)` array, from [`OutputType::Array`].
	Array(Array3<f32>)
}

impl FluxOutput {
	/// Returns the image, converting from an array if needed.
	pub fn into_image(self) -> anyhow::Result<DynamicImage> {
		match self {
			Self::Image(image) => Ok(image),
			Self::Array(array) => to_image(array.view())
		}
	}

	/// Returns the array if this output was produced with [`OutputType::Array`].
	pub fn as_array(&self) -> Option<ArrayView3<'_, f32>> {
		match self {
			Self::Array(array) => Some(array.view()),
			Self::Image(_) => None
		}
	}
}

/// Decodes packed latents into images of `height` x `width` pixels.
///
/// The latents are unpacked, rescaled with `latents / scaling_factor + shift_factor`, decoded by the VAE and then
/// mapped from `[-1, 1]` to `[0, 1]`. One output is returned for each latent in the batch.
pub fn decode_latents<V: FluxVaeDecoder + ?Sized>(
	vae: &V,
	latents: ArrayView3<'_, f32>,
	height: usize,
	width: usize,
	output_type: OutputType
) -> anyhow::Result<Vec<FluxOutput>> {
	let latents = unpack_latents(latents, height, width, vae.scale_factor())?;
	let scaling_factor = vae.scaling_factor();
	let shift_factor = vae.shift_factor();
	let latents = latents.mapv(|x| x / scaling_factor + shift_factor);

	let decoded = vae.decode(latents.view())?;
	postprocess(decoded, output_type)
}

fn postprocess(images: Array4<f32>, output_type: OutputType) -> anyhow::Result<Vec<FluxOutput>> {
	// NCHW -> NHWC
	let images = images.permuted_axes([0, 2, 3, 1]);
	images
		.axis_iter(Axis(0))
		.map(|image| -> anyhow::Result<FluxOutput> {
			let image = image.mapv(|x| (x / 2.0 + 0.5).clamp(0.0, 1.0));
			Ok(match output_type {
				OutputType::Array => FluxOutput::Array(image),
				OutputType::Image => FluxOutput::Image(to_image(image.view())?)
			})
		})
		.collect()
}

fn to_image(image: ArrayView3<'_, f32>) -> anyhow::Result<DynamicImage> {
	let (height, width, channels) = image.dim();
	if channels != 3 {
		return Err(FluxError::invalid_argument(format!("decoded image has {channels} channels, expected 3")).into());
	}
	Ok(DynamicImage::ImageRgb32F(
		Rgb32FImage::from_raw(width as _, height as _, image.iter().copied().collect()).ok_or_else(|| anyhow::anyhow!("failed to construct image"))?
	))
}
