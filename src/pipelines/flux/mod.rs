// Copyright 2022-2023 pyke.io
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// 	http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
	fmt::Debug,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc
	}
};

use image::DynamicImage;
use ndarray::{Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayView4};

mod decode;
mod denoise;
#[cfg(feature = "flux-onnx")]
mod impl_onnx;
mod impl_txt2img;
mod latents;
mod timesteps;

pub use self::decode::{decode_latents, FluxOutput, OutputType};
pub use self::denoise::{denoise, DenoiseOutput};
#[cfg(feature = "flux-onnx")]
pub use self::impl_onnx::{OrtTextEncoder, OrtTransformer, OrtVaeDecoder};
pub use self::impl_txt2img::{FluxGeneration, FluxTxt2ImgOptions, MAX_SEED};
pub use self::latents::{latent_dims, latent_image_ids, pack_latents, prepare_latents, unpack_latents};
pub use self::timesteps::{calculate_timestep_shift, prepare_timesteps, BASE_SEQ_LEN, BASE_SHIFT, MAX_SEQ_LEN, MAX_SHIFT};
use crate::{DiffusionDeviceControl, Prompt};

/// Options for loading the FLUX pipeline.
#[derive(Default, Debug, Clone)]
pub struct FluxOptions {
	/// A [`DiffusionDeviceControl`] object, mapping what device to place each model on.
	pub devices: DiffusionDeviceControl
}

/// Prompt conditioning produced by a [`FluxTextEncoder`], already repeated for `num_images_per_prompt`.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptEmbeddings {
	/// Per-token T5 embeddings, shape `(batch, max_sequence_length, joint_attention_dim)`.
	pub prompt_embeds: Array3<f32>,
	/// Pooled CLIP embeddings, shape `(batch, pooled_projection_dim)`.
	pub pooled_prompt_embeds: Array2<f32>,
	/// Positional ids of the text tokens, shape `(max_sequence_length, 3)`. All zeros for FLUX.1.
	pub text_ids: Array2<f32>
}

/// Encodes prompts into transformer conditioning.
pub trait FluxTextEncoder {
	/// Encodes `prompt` (CLIP) and `prompt_2` (T5; falls back to `prompt`) into [`PromptEmbeddings`] with a batch
	/// size of `prompt.len() * num_images_per_prompt`.
	fn encode_prompt(&self, prompt: &Prompt, prompt_2: Option<&Prompt>, num_images_per_prompt: usize, max_sequence_length: usize)
	-> anyhow::Result<PromptEmbeddings>;
}

/// Inputs to a single transformer forward pass.
#[derive(Debug, Clone, Copy)]
pub struct TransformerInput<'a> {
	/// Packed latents, `(batch, image_seq_len, in_channels)`.
	pub hidden_states: ArrayView3<'a, f32>,
	/// Current timestep divided by 1000, broadcast to `(batch,)`.
	pub timestep: ArrayView1<'a, f32>,
	/// Guidance scale broadcast to `(batch,)`, only for guidance-distilled models.
	pub guidance: Option<ArrayView1<'a, f32>>,
	/// Pooled CLIP embeddings, see [`PromptEmbeddings::pooled_prompt_embeds`].
	pub pooled_projections: ArrayView2<'a, f32>,
	/// T5 embeddings, see [`PromptEmbeddings::prompt_embeds`].
	pub encoder_hidden_states: ArrayView3<'a, f32>,
	/// Text token ids, `(max_sequence_length, 3)`.
	pub txt_ids: ArrayView2<'a, f32>,
	/// Latent patch ids, `(image_seq_len, 3)`. See [`latent_image_ids`].
	pub img_ids: ArrayView2<'a, f32>
}

/// The FLUX transformer: predicts the velocity field for the current latents.
pub trait FluxTransformer {
	/// Number of channels of the packed latents (`4 * vae latent channels`). 64 for FLUX.1.
	fn in_channels(&self) -> usize;

	/// Whether the transformer takes a guidance embedding (FLUX.1-dev) or is guidance-free (FLUX.1-schnell).
	fn guidance_embeds(&self) -> bool;

	/// Runs one forward pass, returning a noise/velocity prediction with the shape of `input.hidden_states`.
	fn forward(&self, input: TransformerInput<'_>) -> anyhow::Result<Array3<f32>>;

	/// Releases cached accelerator memory. Called after every denoising step and once after the loop.
	fn empty_cache(&self) {}
}

/// The VAE decoder, mapping unpacked latents back to pixel space.
pub trait FluxVaeDecoder {
	/// Latents are divided by this before decoding.
	fn scaling_factor(&self) -> f32;

	/// Added to the latents after scaling, before decoding.
	fn shift_factor(&self) -> f32;

	/// Spatial downsampling factor between pixels and latents.
	fn scale_factor(&self) -> usize {
		8
	}

	/// Decodes `(batch, channels, h, w)` latents into `(batch, 3, height, width)` images in `[-1, 1]`.
	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>>;
}

/// A cooperative interruption flag for a running generation.
///
/// The denoising loop checks the flag once per timestep. Once set, every remaining timestep is consumed without
/// running the transformer or the scheduler, and the latents at that point are decoded as the final image.
///
/// ```
/// # use realtime_flux::Interrupt;
/// let interrupt = Interrupt::new();
/// let handle = interrupt.clone();
/// handle.interrupt();
/// assert!(interrupt.is_interrupted());
/// ```
#[derive(Default, Debug, Clone)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
	/// Creates a new, unset interrupt.
	pub fn new() -> Self {
		Self::default()
	}

	/// Requests that the generation holding this token stop doing work.
	pub fn interrupt(&self) {
		self.0.store(true, Ordering::Release);
	}

	/// Returns `true` if [`Interrupt::interrupt`] has been called on this token or any of its clones.
	pub fn is_interrupted(&self) -> bool {
		self.0.load(Ordering::Acquire)
	}

	/// Clears the flag so the token can be reused for another generation.
	pub fn reset(&self) {
		self.0.store(false, Ordering::Release);
	}
}

/// Describes a function to be called on each step of the pipeline. Returning `false` interrupts the generation.
pub enum FluxCallback {
	/// A simple callback to be used for e.g. reporting progress updates.
	Progress {
		/// Describes how frequently to call this callback (3 = every 3 steps).
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (f32): This step's timestep.
		cb: Box<dyn Fn(usize, f32) -> bool>
	},
	/// A callback to receive this step's packed latents.
	Latents {
		/// Describes how frequently to call this callback (3 = every 3 steps).
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (f32): This step's timestep.
		/// - **`latents`** (`Array3<f32>`): Scheduler latent outputs for this step.
		cb: Box<dyn Fn(usize, f32, Array3<f32>) -> bool>
	},
	/// A callback to receive this step's fully decoded latents, for progressively displaying the image as it forms.
	/// This runs the VAE decoder on each call.
	Decoded {
		/// Describes how frequently to call this callback (3 = every 3 steps).
		frequency: usize,
		/// Function Parameters:
		/// - **`step`** (usize): The current step number.
		/// - **`timestep`** (f32): This step's timestep.
		/// - **`image`** (`Vec<DynamicImage>`): Vector of decoded images for this step.
		cb: Box<dyn Fn(usize, f32, Vec<DynamicImage>) -> bool>
	}
}

impl Debug for FluxCallback {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("<FluxCallback>")
	}
}

/// A [FLUX](https://github.com/black-forest-labs/flux) text-to-image pipeline, composed from a text encoder, a
/// transformer and a VAE decoder.
///
/// The scheduler is not part of the pipeline; it is passed to every call so one pipeline can serve several schedules.
///
/// With ONNX models (feature `flux-onnx`):
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use realtime_flux::{
/// 	FlowMatchEulerDiscreteScheduler, FluxOptions, FluxPipeline, FluxTxt2ImgOptions, Interrupt, OrtEnvironment,
/// 	SchedulerOptimizedDefaults
/// };
///
/// let environment = OrtEnvironment::default().into_arc();
/// let mut scheduler = FlowMatchEulerDiscreteScheduler::flux_schnell_optimized_default()?;
/// let pipeline = FluxPipeline::new(&environment, "./flux.1-schnell/", FluxOptions::default())?;
///
/// let generation = FluxTxt2ImgOptions::default()
/// 	.with_prompts("a tiny astronaut hatching from an egg on the moon", None)
/// 	.with_steps(1)
/// 	.run(&pipeline, &mut scheduler, &Interrupt::new())?;
/// println!("{}", generation.latency_label());
/// # Ok(())
/// # }
/// ```
pub struct FluxPipeline<E, T, V> {
	text_encoder: E,
	transformer: T,
	vae: V,
	default_sample_size: usize
}

impl<E, T, V> FluxPipeline<E, T, V>
where
	E: FluxTextEncoder,
	T: FluxTransformer,
	V: FluxVaeDecoder
{
	/// Builds a pipeline from already-loaded components.
	pub fn from_components(text_encoder: E, transformer: T, vae: V) -> Self {
		Self {
			text_encoder,
			transformer,
			vae,
			default_sample_size: 128
		}
	}

	/// Overrides the default sample size (in latent pixels). The default image size is
	/// `default_sample_size * vae.scale_factor()`.
	pub fn with_default_sample_size(mut self, default_sample_size: usize) -> Self {
		self.default_sample_size = default_sample_size;
		self
	}

	/// Default image height and width in pixels (1024 for FLUX.1).
	pub fn default_size(&self) -> usize {
		self.default_sample_size * self.vae.scale_factor()
	}

	/// The text encoder.
	pub fn text_encoder(&self) -> &E {
		&self.text_encoder
	}

	/// The transformer.
	pub fn transformer(&self) -> &T {
		&self.transformer
	}

	/// The VAE decoder.
	pub fn vae(&self) -> &V {
		&self.vae
	}

	/// Encodes the given prompt(s) into transformer conditioning.
	pub fn encode_prompt(
		&self,
		prompt: &Prompt,
		prompt_2: Option<&Prompt>,
		num_images_per_prompt: usize,
		max_sequence_length: usize
	) -> anyhow::Result<PromptEmbeddings> {
		self.text_encoder.encode_prompt(prompt, prompt_2, num_images_per_prompt, max_sequence_length)
	}

	/// Decodes packed latents into images of `height` x `width`. See [`decode_latents`].
	pub fn decode_latents(&self, latents: ArrayView3<'_, f32>, height: usize, width: usize, output_type: OutputType) -> anyhow::Result<Vec<FluxOutput>> {
		decode_latents(&self.vae, latents, height, width, output_type)
	}
}
