//! The schedule functions, denoted Schedulers in the library, take in the output of a trained model, a sample which the
//! diffusion process is iterating on, and a timestep to return a denoised sample.
//!
//! * Flow-matching schedulers integrate a velocity field predicted by the model, walking the sample from pure noise
//!   (`sigma = 1`) to a clean latent (`sigma = 0`).
//! * The noise schedule can be materialized three ways: from a step count (optionally shifted by `mu`), from an
//!   explicit list of sigmas, or from an explicit list of timesteps.

use ndarray::{Array3, ArrayView1, ArrayView3};

cfg_if::cfg_if! {
	if #[cfg(feature = "scheduler-flow-match-euler")] {
		mod flow_match_euler;
		pub use self::flow_match_euler::*;
	}
}

/// A scheduler to be used in flow-matching diffusion pipelines.
pub trait FlowScheduler {
	/// Builds a schedule of `num_inference_steps` evenly spaced timesteps, shifted by `mu` if the scheduler uses
	/// resolution-dependent shifting.
	fn set_timesteps(&mut self, num_inference_steps: usize, mu: Option<f32>) -> anyhow::Result<()>;

	/// Uses the given timesteps verbatim. Sigmas are derived from them and shifted the same way as for
	/// [`FlowScheduler::set_timesteps`], so dynamically shifted schedulers require `mu` here too.
	fn set_custom_timesteps(&mut self, timesteps: &[f32], mu: Option<f32>) -> anyhow::Result<()>;

	/// Uses the given sigmas (noise levels, from `1.0` towards `0.0`). Timesteps are derived from them.
	fn set_sigmas(&mut self, sigmas: &[f32], mu: Option<f32>) -> anyhow::Result<()>;

	/// Returns the computed scheduler timesteps. One denoising iteration is run per timestep.
	fn timesteps(&self) -> ArrayView1<'_, f32>;

	/// Predict the sample at the next (less noisy) timestep from the model's velocity prediction.
	fn step(&mut self, model_output: ArrayView3<'_, f32>, timestep: f32, sample: ArrayView3<'_, f32>) -> anyhow::Result<Array3<f32>>;

	/// Returns the initial sigma noise value.
	fn init_noise_sigma(&self) -> f32 {
		1.0
	}

	/// Returns the number of train timesteps.
	fn num_train_timesteps(&self) -> usize;
}

/// Tuned constructors for specific model families.
pub trait SchedulerOptimizedDefaults {
	/// Scheduler configuration used by FLUX.1-schnell: static shift of `1.0`, no dynamic shifting.
	fn flux_schnell_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized;

	/// Scheduler configuration used by FLUX.1-dev: shift of `3.0` with resolution-dependent dynamic shifting.
	fn flux_dev_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized;
}
