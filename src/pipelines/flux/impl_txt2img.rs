use std::time::{Duration, Instant};

use image::DynamicImage;
use ndarray::{Array1, Array3};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{info, warn};

use super::{
	calculate_timestep_shift, decode_latents, denoise, prepare_latents, prepare_timesteps, FluxCallback, FluxOutput, FluxPipeline, FluxTextEncoder,
	FluxTransformer, FluxVaeDecoder, Interrupt, OutputType
};
use crate::{FlowScheduler, FluxError, Prompt};

/// Largest seed picked by [`FluxTxt2ImgOptions::with_random_seed`].
pub const MAX_SEED: u64 = i32::MAX as u64;

/// The longest T5 sequence FLUX.1 was trained with.
const MAX_T5_SEQUENCE_LENGTH: usize = 512;

/// Options for the FLUX text-to-image pipeline.
#[derive(Debug)]
pub struct FluxTxt2ImgOptions {
	/// The height of the image. **Must be divisible by 16.**
	pub height: u32,
	/// The width of the image. **Must be divisible by 16.**
	pub width: u32,
	/// Guidance scale, only used by guidance-distilled models. FLUX.1-schnell ignores it.
	pub guidance_scale: f32,
	/// The number of inference steps. Ignored if `timesteps` or `sigmas` is set.
	pub steps: usize,
	/// The seed used to draw the initial noise. A random seed is picked (and reported back) if `None`.
	pub seed: Option<u64>,
	/// The prompt(s) given to the CLIP text encoder.
	pub positive_prompt: Prompt,
	/// The prompt(s) given to the T5 text encoder. Defaults to `positive_prompt`.
	pub prompt_2: Option<Prompt>,
	/// Number of images generated for each prompt.
	pub num_images_per_prompt: usize,
	/// Number of T5 tokens the prompt is padded or truncated to. At most 512.
	pub max_sequence_length: usize,
	/// Explicit timesteps. Mutually exclusive with `sigmas`.
	pub timesteps: Option<Vec<f32>>,
	/// Explicit sigmas. Mutually exclusive with `timesteps`. Defaults to `linspace(1, 1 / steps, steps)`.
	pub sigmas: Option<Vec<f32>>,
	/// Packed initial latents to use instead of drawing noise from the seed.
	pub latents: Option<Array3<f32>>,
	/// The representation of the final images.
	pub output_type: OutputType,
	/// Called after each denoising step.
	pub callback: Option<FluxCallback>
}

impl Default for FluxTxt2ImgOptions {
	fn default() -> Self {
		Self {
			height: 1024,
			width: 1024,
			guidance_scale: 3.5,
			steps: 4,
			seed: None,
			positive_prompt: Prompt::default(),
			prompt_2: None,
			num_images_per_prompt: 1,
			max_sequence_length: 300,
			timesteps: None,
			sigmas: None,
			latents: None,
			output_type: OutputType::Image,
			callback: None
		}
	}
}

fn round_to_patch(value: u32, what: &str) -> u32 {
	let rounded = (value / 16).max(1) * 16;
	if rounded != value {
		warn!("{what} {value} is not a multiple of 16, rounding to {rounded}");
	}
	rounded
}

// builder for options
impl FluxTxt2ImgOptions {
	/// Set the size of the image. **Size will be rounded to a multiple of 16.**
	pub fn with_size(self, width: u32, height: u32) -> Self {
		self.with_width(width).with_height(height)
	}
	/// Set the width of the image. **Width will be rounded to a multiple of 16.**
	#[inline]
	pub fn with_width(mut self, width: u32) -> Self {
		self.width = round_to_patch(width, "width");
		self
	}
	/// Set the height of the image. **Height will be rounded to a multiple of 16.**
	#[inline]
	pub fn with_height(mut self, height: u32) -> Self {
		self.height = round_to_patch(height, "height");
		self
	}
	/// The number of steps to take to generate the image. FLUX.1-schnell produces usable images in 1-4 steps.
	pub fn with_steps(mut self, steps: usize) -> Self {
		self.steps = steps;
		self
	}
	/// Set the prompt(s) to use when generating the image. `prompt_2`, if given, is sent to the T5 encoder instead of
	/// `positive_prompt`.
	pub fn with_prompts<P>(mut self, positive_prompt: P, prompt_2: Option<P>) -> Self
	where
		P: Into<Prompt>
	{
		self.positive_prompt = positive_prompt.into();
		self.prompt_2 = prompt_2.map(|p| p.into());
		self
	}
	/// Set the seed to use when first generating noise.
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.seed = Some(seed);
		self
	}
	/// Use a random seed in `0..=MAX_SEED`, so that each run generates a different image.
	pub fn with_random_seed(mut self) -> Self {
		self.seed = None;
		self
	}
	/// Guidance scale for guidance-distilled models.
	pub fn with_guidance_scale(mut self, guidance_scale: f32) -> Self {
		self.guidance_scale = guidance_scale;
		self
	}
	/// Number of images to generate for each prompt.
	pub fn with_num_images_per_prompt(mut self, num_images_per_prompt: usize) -> Self {
		self.num_images_per_prompt = num_images_per_prompt;
		self
	}
	/// Number of T5 tokens the prompt is padded or truncated to.
	pub fn with_max_sequence_length(mut self, max_sequence_length: usize) -> Self {
		self.max_sequence_length = max_sequence_length;
		self
	}
	/// Use explicit timesteps instead of a step count.
	pub fn with_timesteps(mut self, timesteps: Vec<f32>) -> Self {
		self.timesteps = Some(timesteps);
		self
	}
	/// Use explicit sigmas instead of a step count.
	pub fn with_sigmas(mut self, sigmas: Vec<f32>) -> Self {
		self.sigmas = Some(sigmas);
		self
	}
	/// Start from the given packed latents instead of seeded noise.
	pub fn with_latents(mut self, latents: Array3<f32>) -> Self {
		self.latents = Some(latents);
		self
	}
	/// Set the representation of the final images.
	pub fn with_output_type(mut self, output_type: OutputType) -> Self {
		self.output_type = output_type;
		self
	}
}

// builder for callbacks
impl FluxTxt2ImgOptions {
	/// Calls `callback` with the step index and timestep every `frequency` steps. Return `false` to stop the
	/// generation; the remaining steps are skipped and the current latents are decoded.
	pub fn callback_progress<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f32) -> bool + 'static
	{
		self.callback = Some(FluxCallback::Progress { frequency, cb: Box::new(callback) });
		self
	}
	/// Calls `callback` with the step index, timestep and packed latents every `frequency` steps.
	pub fn callback_latents<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f32, Array3<f32>) -> bool + 'static
	{
		self.callback = Some(FluxCallback::Latents { frequency, cb: Box::new(callback) });
		self
	}
	/// Calls `callback` with the step index, timestep and fully decoded images every `frequency` steps. This runs the
	/// VAE decoder on each call.
	pub fn callback_decoded<F>(mut self, frequency: usize, callback: F) -> Self
	where
		F: Fn(usize, f32, Vec<DynamicImage>) -> bool + 'static
	{
		self.callback = Some(FluxCallback::Decoded { frequency, cb: Box::new(callback) });
		self
	}
}

fn is_due(step: usize, frequency: usize) -> bool {
	frequency != 0 && step % frequency == 0
}

impl FluxTxt2ImgOptions {
	fn check_inputs<V: FluxVaeDecoder>(&self, vae: &V) -> anyhow::Result<()> {
		if vae.scale_factor() == 0 {
			return Err(FluxError::invalid_argument("the VAE scale factor must be greater than 0").into());
		}
		let patch = (vae.scale_factor() * 2) as u32;
		if self.height % patch != 0 || self.width % patch != 0 {
			return Err(FluxError::invalid_argument(format!("`width` ({}) and `height` ({}) must be divisible by {patch}", self.width, self.height)).into());
		}
		if self.positive_prompt.is_empty() {
			return Err(FluxError::invalid_argument("at least one prompt must be given").into());
		}
		if let Some(prompt_2) = &self.prompt_2 {
			if prompt_2.len() != self.positive_prompt.len() {
				return Err(FluxError::invalid_argument(format!(
					"`prompt_2` has batch size {}, but `prompt` has batch size {}",
					prompt_2.len(),
					self.positive_prompt.len()
				))
				.into());
			}
		}
		if self.num_images_per_prompt == 0 {
			return Err(FluxError::invalid_argument("`num_images_per_prompt` must be >0").into());
		}
		if self.max_sequence_length > MAX_T5_SEQUENCE_LENGTH {
			return Err(FluxError::invalid_argument(format!(
				"`max_sequence_length` cannot be greater than {MAX_T5_SEQUENCE_LENGTH} but is {}",
				self.max_sequence_length
			))
			.into());
		}
		if self.steps == 0 && self.timesteps.is_none() && self.sigmas.is_none() {
			return Err(FluxError::invalid_argument("`steps` must be >0").into());
		}
		Ok(())
	}

	/// Generates images from the given text prompt(s), decoding the final latents once.
	///
	/// `scheduler` must be a flow-matching scheduler. `interrupt` can be set from another thread (or by a callback
	/// returning `false`) to skip the remaining denoising steps.
	///
	/// See [`FluxTxt2ImgOptions`] for additional configuration.
	///
	/// # Examples
	///
	/// ```no_run
	/// # fn main() -> anyhow::Result<()> {
	/// # use realtime_flux::{FluxPipeline, FlowMatchEulerDiscreteScheduler, FluxOptions, FluxTxt2ImgOptions, Interrupt, OrtEnvironment};
	/// # let environment = OrtEnvironment::default().into_arc();
	/// # let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	/// let pipeline = FluxPipeline::new(&environment, "./flux.1-schnell/", FluxOptions::default())?;
	///
	/// let generation = FluxTxt2ImgOptions::default()
	/// 	.with_prompts("a cute white cat holding a sign that says hello world", None)
	/// 	.with_seed(42)
	/// 	.with_steps(1)
	/// 	.run(&pipeline, &mut scheduler, &Interrupt::new())?;
	/// generation.into_image()?.into_rgb8().save("result.png")?;
	/// # Ok(())
	/// # }
	/// ```
	pub fn run<E, T, V, S>(&self, pipeline: &FluxPipeline<E, T, V>, scheduler: &mut S, interrupt: &Interrupt) -> anyhow::Result<FluxGeneration>
	where
		E: FluxTextEncoder,
		T: FluxTransformer,
		V: FluxVaeDecoder,
		S: FlowScheduler + ?Sized
	{
		let start = Instant::now();
		let seed = self.seed.unwrap_or_else(|| rand::thread_rng().gen_range(0..=MAX_SEED));
		let mut rng = StdRng::seed_from_u64(seed);

		self.check_inputs(pipeline.vae())?;

		let (height, width) = (self.height as usize, self.width as usize);
		let batch_size = self.positive_prompt.len() * self.num_images_per_prompt;

		let conditioning = pipeline.encode_prompt(&self.positive_prompt, self.prompt_2.as_ref(), self.num_images_per_prompt, self.max_sequence_length)?;

		let num_channels_latents = pipeline.transformer().in_channels() / 4;
		let (latents, img_ids) = prepare_latents(batch_size, num_channels_latents, height, width, pipeline.vae().scale_factor(), &mut rng, self.latents.clone())?;

		let default_sigmas: Vec<f32>;
		let sigmas = match (&self.timesteps, &self.sigmas) {
			(None, None) => {
				default_sigmas = Array1::linspace(1.0, 1.0 / self.steps as f32, self.steps).to_vec();
				Some(default_sigmas.as_slice())
			}
			(_, sigmas) => sigmas.as_deref()
		};
		let mu = calculate_timestep_shift(latents.shape()[1]);
		let (timesteps, num_inference_steps) = prepare_timesteps(scheduler, self.steps, self.timesteps.as_deref(), sigmas, Some(mu))?;

		let callback = self.callback.as_ref();
		let vae = pipeline.vae();
		let output = denoise(
			pipeline.transformer(),
			scheduler,
			latents,
			&conditioning,
			img_ids.view(),
			timesteps.view(),
			self.guidance_scale,
			interrupt,
			|i, t, latents| {
				Ok(match callback {
					Some(FluxCallback::Progress { frequency, cb }) if is_due(i, *frequency) => cb(i, t),
					Some(FluxCallback::Latents { frequency, cb }) if is_due(i, *frequency) => cb(i, t, latents.to_owned()),
					Some(FluxCallback::Decoded { frequency, cb }) if is_due(i, *frequency) => {
						let images = decode_latents(vae, latents, height, width, OutputType::Image)?
							.into_iter()
							.map(FluxOutput::into_image)
							.collect::<anyhow::Result<Vec<_>>>()?;
						cb(i, t, images)
					}
					_ => true
				})
			}
		)?;

		let images = pipeline.decode_latents(output.latents.view(), height, width, self.output_type)?;
		let latency = start.elapsed();
		info!(
			seed,
			steps = num_inference_steps,
			steps_run = output.steps_run,
			latency_ms = latency.as_millis() as u64,
			"generated {} image(s)",
			images.len()
		);

		Ok(FluxGeneration { images, seed, latency })
	}
}

/// The result of a text-to-image generation.
#[derive(Debug, Clone)]
pub struct FluxGeneration {
	/// One output for each prompt * `num_images_per_prompt`.
	pub images: Vec<FluxOutput>,
	/// The seed the initial noise was drawn with.
	pub seed: u64,
	/// Wall-clock time of the whole generation, including prompt encoding and decoding.
	pub latency: Duration
}

impl FluxGeneration {
	/// Human-readable latency, e.g. `Latency: 0.42 seconds`.
	pub fn latency_label(&self) -> String {
		format!("Latency: {:.2} seconds", self.latency.as_secs_f64())
	}

	/// Returns the first image of the batch.
	pub fn into_image(self) -> anyhow::Result<DynamicImage> {
		self.images
			.into_iter()
			.next()
			.ok_or_else(|| anyhow::anyhow!("generation produced no images"))?
			.into_image()
	}
}
