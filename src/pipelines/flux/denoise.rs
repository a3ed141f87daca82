use ndarray::{Array1, Array3, ArrayView1, ArrayView2, ArrayView3};
use tracing::{debug, trace};

use super::{FluxTransformer, Interrupt, PromptEmbeddings, TransformerInput};
use crate::{FlowScheduler, FluxError};

/// Result of [`denoise`].
#[derive(Debug, Clone, PartialEq)]
pub struct DenoiseOutput {
	/// Latents after the last executed step (the initial latents if no step was executed).
	pub latents: Array3<f32>,
	/// Number of timesteps for which the transformer and scheduler were run.
	pub steps_run: usize,
	/// Number of timesteps consumed without work because the generation was interrupted.
	pub steps_skipped: usize
}

/// Runs the denoising loop over `timesteps`.
///
/// For each timestep the transformer predicts a velocity for the current latents and the scheduler advances them.
/// `on_step` is called after every executed step with the step index, the timestep and the new latents; returning
/// `Ok(false)` sets `interrupt`.
///
/// `interrupt` is checked at the start of every iteration. An interrupted loop does not exit early: the remaining
/// timesteps are still iterated, but neither the transformer nor the scheduler is called for them
/// (`steps_run + steps_skipped == timesteps.len()`).
///
/// [`FluxTransformer::empty_cache`] is called after every executed step and once after the loop.
#[allow(clippy::too_many_arguments)]
pub fn denoise<T, S, F>(
	transformer: &T,
	scheduler: &mut S,
	latents: Array3<f32>,
	conditioning: &PromptEmbeddings,
	img_ids: ArrayView2<'_, f32>,
	timesteps: ArrayView1<'_, f32>,
	guidance_scale: f32,
	interrupt: &Interrupt,
	mut on_step: F
) -> anyhow::Result<DenoiseOutput>
where
	T: FluxTransformer + ?Sized,
	S: FlowScheduler + ?Sized,
	F: FnMut(usize, f32, ArrayView3<'_, f32>) -> anyhow::Result<bool>
{
	let batch_size = latents.shape()[0];
	let shape = latents.dim();
	let guidance = if transformer.guidance_embeds() { Some(Array1::from_elem(batch_size, guidance_scale)) } else { None };

	let mut latents = latents;
	let mut steps_run = 0;
	let mut steps_skipped = 0;
	for (i, &t) in timesteps.iter().enumerate() {
		if interrupt.is_interrupted() {
			steps_skipped += 1;
			continue;
		}

		let timestep = Array1::from_elem(batch_size, t / 1000.0);
		let noise_pred = transformer.forward(TransformerInput {
			hidden_states: latents.view(),
			timestep: timestep.view(),
			guidance: guidance.as_ref().map(|g| g.view()),
			pooled_projections: conditioning.pooled_prompt_embeds.view(),
			encoder_hidden_states: conditioning.prompt_embeds.view(),
			txt_ids: conditioning.text_ids.view(),
			img_ids: img_ids.view()
		})?;

		latents = scheduler.step(noise_pred.view(), t, latents.view())?;
		if latents.dim() != shape {
			return Err(FluxError::invalid_argument(format!("scheduler changed the latent shape from {shape:?} to {:?}", latents.dim())).into());
		}
		transformer.empty_cache();
		steps_run += 1;
		trace!(step = i, timestep = t, "denoising step done");

		if !on_step(i, t, latents.view())? {
			debug!(step = i, "interrupted by step callback");
			interrupt.interrupt();
		}
	}
	transformer.empty_cache();

	if steps_skipped > 0 {
		debug!(steps_run, steps_skipped, "denoising was interrupted");
	}

	Ok(DenoiseOutput { latents, steps_run, steps_skipped })
}

#[cfg(test)]
mod tests {
	use std::cell::{Cell, RefCell};

	use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView3};

	use super::*;
	use crate::{FlowMatchEulerDiscreteScheduler, FlowScheduler};

	#[derive(Default)]
	struct ConstantVelocity {
		guidance_embeds: bool,
		forwards: Cell<usize>,
		cache_releases: Cell<usize>,
		seen: RefCell<Vec<(Vec<f32>, Option<Vec<f32>>)>>
	}

	impl FluxTransformer for ConstantVelocity {
		fn in_channels(&self) -> usize {
			8
		}

		fn guidance_embeds(&self) -> bool {
			self.guidance_embeds
		}

		fn forward(&self, input: TransformerInput<'_>) -> anyhow::Result<Array3<f32>> {
			self.forwards.set(self.forwards.get() + 1);
			self.seen.borrow_mut().push((input.timestep.to_vec(), input.guidance.map(|g| g.to_vec())));
			Ok(Array3::ones(input.hidden_states.raw_dim()))
		}

		fn empty_cache(&self) {
			self.cache_releases.set(self.cache_releases.get() + 1);
		}
	}

	struct CountingScheduler {
		inner: FlowMatchEulerDiscreteScheduler,
		steps: usize
	}

	impl FlowScheduler for CountingScheduler {
		fn set_timesteps(&mut self, num_inference_steps: usize, mu: Option<f32>) -> anyhow::Result<()> {
			self.inner.set_timesteps(num_inference_steps, mu)
		}

		fn set_custom_timesteps(&mut self, timesteps: &[f32], mu: Option<f32>) -> anyhow::Result<()> {
			self.inner.set_custom_timesteps(timesteps, mu)
		}

		fn set_sigmas(&mut self, sigmas: &[f32], mu: Option<f32>) -> anyhow::Result<()> {
			self.inner.set_sigmas(sigmas, mu)
		}

		fn timesteps(&self) -> ArrayView1<'_, f32> {
			self.inner.timesteps()
		}

		fn step(&mut self, model_output: ArrayView3<'_, f32>, timestep: f32, sample: ArrayView3<'_, f32>) -> anyhow::Result<Array3<f32>> {
			self.steps += 1;
			self.inner.step(model_output, timestep, sample)
		}

		fn num_train_timesteps(&self) -> usize {
			self.inner.num_train_timesteps()
		}
	}

	fn setup() -> anyhow::Result<(CountingScheduler, Array1<f32>, PromptEmbeddings)> {
		let mut scheduler = CountingScheduler {
			inner: FlowMatchEulerDiscreteScheduler::default(),
			steps: 0
		};
		scheduler.set_sigmas(&[1.0, 0.75, 0.5, 0.25], None)?;
		let timesteps = scheduler.timesteps().to_owned();
		let conditioning = PromptEmbeddings {
			prompt_embeds: Array3::zeros((1, 4, 8)),
			pooled_prompt_embeds: Array2::zeros((1, 8)),
			text_ids: Array2::zeros((4, 3))
		};
		Ok((scheduler, timesteps, conditioning))
	}

	#[test]
	fn test_full_run() -> anyhow::Result<()> {
		let (mut scheduler, timesteps, conditioning) = setup()?;
		let transformer = ConstantVelocity::default();
		let ids = Array2::zeros((4, 3));
		let mut seen_steps = Vec::new();

		let out = denoise(&transformer, &mut scheduler, Array3::zeros((1, 4, 8)), &conditioning, ids.view(), timesteps.view(), 3.5, &Interrupt::new(), |i, _, _| {
			seen_steps.push(i);
			Ok(true)
		})?;

		assert_eq!(out.steps_run, 4);
		assert_eq!(out.steps_skipped, 0);
		assert_eq!(transformer.forwards.get(), 4);
		assert_eq!(scheduler.steps, 4);
		assert_eq!(transformer.cache_releases.get(), 5);
		assert_eq!(seen_steps, vec![0, 1, 2, 3]);
		// a constant unit velocity integrated from sigma 1 to sigma 0
		assert!(out.latents.iter().all(|&x| (x + 1.0).abs() < 1e-5));
		// timesteps reach the transformer divided by 1000, guidance is withheld from guidance-free models
		let seen = transformer.seen.borrow();
		assert!((seen[0].0[0] - 1.0).abs() < 1e-6);
		assert!((seen[1].0[0] - 0.75).abs() < 1e-6);
		assert!(seen.iter().all(|(_, guidance)| guidance.is_none()));
		Ok(())
	}

	#[test]
	fn test_guidance_is_broadcast() -> anyhow::Result<()> {
		let (mut scheduler, timesteps, conditioning) = setup()?;
		let transformer = ConstantVelocity {
			guidance_embeds: true,
			..Default::default()
		};
		let ids = Array2::zeros((4, 3));
		denoise(&transformer, &mut scheduler, Array3::zeros((1, 4, 8)), &conditioning, ids.view(), timesteps.view(), 3.5, &Interrupt::new(), |_, _, _| Ok(true))?;
		assert!(transformer.seen.borrow().iter().all(|(_, guidance)| guidance.as_deref() == Some(&[3.5][..])));
		Ok(())
	}

	#[test]
	fn test_interrupted_before_start() -> anyhow::Result<()> {
		let (mut scheduler, timesteps, conditioning) = setup()?;
		let transformer = ConstantVelocity::default();
		let ids = Array2::zeros((4, 3));
		let interrupt = Interrupt::new();
		interrupt.interrupt();

		let initial = Array3::from_elem((1, 4, 8), 0.5);
		let out = denoise(&transformer, &mut scheduler, initial.clone(), &conditioning, ids.view(), timesteps.view(), 0.0, &interrupt, |_, _, _| {
			panic!("no step should run")
		})?;

		assert_eq!(out.steps_run, 0);
		assert_eq!(out.steps_skipped, 4);
		assert_eq!(transformer.forwards.get(), 0);
		assert_eq!(scheduler.steps, 0);
		assert_eq!(out.latents, initial);
		Ok(())
	}

	#[test]
	fn test_callback_interrupts_remaining_steps() -> anyhow::Result<()> {
		let (mut scheduler, timesteps, conditioning) = setup()?;
		let transformer = ConstantVelocity::default();
		let ids = Array2::zeros((4, 3));
		let interrupt = Interrupt::new();

		let out = denoise(&transformer, &mut scheduler, Array3::zeros((1, 4, 8)), &conditioning, ids.view(), timesteps.view(), 0.0, &interrupt, |i, _, _| Ok(i < 1))?;

		assert!(interrupt.is_interrupted());
		assert_eq!(out.steps_run, 2);
		assert_eq!(out.steps_skipped, 2);
		assert_eq!(out.steps_run + out.steps_skipped, timesteps.len());
		assert!(out.latents.iter().all(|&x| (x + 0.5).abs() < 1e-5));
		Ok(())
	}
}
