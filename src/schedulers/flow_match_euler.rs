use std::{fs, path::PathBuf};

use ndarray::{concatenate, s, Array1, Array3, ArrayView1, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{FlowScheduler, SchedulerOptimizedDefaults};
use crate::{config::DiffusionPipeline, FluxError};

/// Configuration for [`FlowMatchEulerDiscreteScheduler`]. Field names match the `[scheduler]` table of a
/// `realtime-flux.toml` manifest; every field is optional there.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FlowMatchEulerDiscreteConfig {
	/// Number of diffusion steps used to train the model.
	pub num_train_timesteps: usize,
	/// Static shift applied to every sigma when dynamic shifting is disabled.
	pub shift: f32,
	/// Shift sigmas by a resolution-dependent `mu` instead of the static `shift`.
	pub use_dynamic_shifting: bool,
	/// Shift at `base_image_seq_len`. Informational; `mu` is computed by the pipeline.
	pub base_shift: f32,
	/// Shift at `max_image_seq_len`. Informational; `mu` is computed by the pipeline.
	pub max_shift: f32,
	/// Smallest image sequence length the shift was tuned for.
	pub base_image_seq_len: usize,
	/// Largest image sequence length the shift was tuned for.
	pub max_image_seq_len: usize
}

impl Default for FlowMatchEulerDiscreteConfig {
	fn default() -> Self {
		Self {
			num_train_timesteps: 1000,
			shift: 1.0,
			use_dynamic_shifting: false,
			base_shift: 0.5,
			max_shift: 1.15,
			base_image_seq_len: 256,
			max_image_seq_len: 4096
		}
	}
}

/// Euler scheduler for rectified-flow models, integrating the predicted velocity field from `sigma = 1` (noise) to
/// `sigma = 0` (data):
///
/// ```text
/// x_next = x + (sigma_next - sigma) * v(x, t)
/// ```
///
/// ```
/// # fn main() -> anyhow::Result<()> {
/// use realtime_flux::{FlowMatchEulerDiscreteScheduler, FlowScheduler, SchedulerOptimizedDefaults};
///
/// let mut scheduler = FlowMatchEulerDiscreteScheduler::flux_schnell_optimized_default()?;
/// scheduler.set_timesteps(4, None)?;
/// assert_eq!(scheduler.timesteps().len(), 4);
/// assert_eq!(scheduler.sigmas().len(), 5);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FlowMatchEulerDiscreteScheduler {
	config: FlowMatchEulerDiscreteConfig,
	sigmas: Array1<f32>,
	timesteps: Array1<f32>,
	sigma_min: f32,
	sigma_max: f32,
	num_inference_steps: Option<usize>,
	step_index: Option<usize>
}

impl Default for FlowMatchEulerDiscreteScheduler {
	fn default() -> Self {
		Self::build(FlowMatchEulerDiscreteConfig::default())
	}
}

impl FlowMatchEulerDiscreteScheduler {
	/// Creates a new instance of the scheduler.
	///
	/// # Errors
	/// Can error if:
	/// - `num_train_timesteps` is 0
	/// - `shift` is not a positive normal number
	pub fn new(config: FlowMatchEulerDiscreteConfig) -> anyhow::Result<Self> {
		if config.num_train_timesteps == 0 {
			anyhow::bail!("num_train_timesteps ({}) must be >0", config.num_train_timesteps);
		}
		if !config.shift.is_normal() || config.shift < 0.0 {
			anyhow::bail!("shift ({}) must be a positive normal number", config.shift);
		}
		Ok(Self::build(config))
	}

	/// Loads the scheduler configuration from the `[scheduler]` table of a pipeline's `realtime-flux.toml`. Pipelines
	/// without a `[scheduler]` table get the default configuration.
	pub fn from_pipeline_dir(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
		let root: PathBuf = root.into();
		let manifest: DiffusionPipeline = toml::from_str(&fs::read_to_string(root.join("realtime-flux.toml"))?)?;
		let DiffusionPipeline::Flux { inner, .. } = manifest;
		Self::new(inner.scheduler.unwrap_or_default())
	}

	fn build(config: FlowMatchEulerDiscreteConfig) -> Self {
		let n = config.num_train_timesteps as f32;
		let train_timesteps = Array1::linspace(1.0, n, config.num_train_timesteps).slice(s![..;-1]).to_owned();
		let mut sigmas = &train_timesteps / n;
		if !config.use_dynamic_shifting {
			let shift = config.shift;
			sigmas.mapv_inplace(|s| static_shift(shift, s));
		}

		let sigma_max = sigmas.first().copied().unwrap_or(1.0);
		let sigma_min = sigmas.last().copied().unwrap_or(0.0);
		let timesteps = &sigmas * n;

		Self {
			config,
			sigmas,
			timesteps,
			sigma_min,
			sigma_max,
			num_inference_steps: None,
			step_index: None
		}
	}

	/// Returns the scheduler configuration.
	pub fn config(&self) -> &FlowMatchEulerDiscreteConfig {
		&self.config
	}

	/// Returns the current sigmas, including the trailing `0.0`.
	pub fn sigmas(&self) -> ArrayView1<'_, f32> {
		self.sigmas.view()
	}

	/// Returns the number of inference steps of the current schedule, if one has been set.
	pub fn num_inference_steps(&self) -> Option<usize> {
		self.num_inference_steps
	}

	/// Index of the next sigma `step` will use. `None` until the first step after a schedule is set.
	pub fn step_index(&self) -> Option<usize> {
		self.step_index
	}

	/// Resolution-dependent shift: `exp(mu) / (exp(mu) + (1 / t - 1))`.
	pub fn time_shift(mu: f32, t: f32) -> f32 {
		let exp_mu = mu.exp();
		exp_mu / (exp_mu + (1.0 / t - 1.0))
	}

	fn apply_shift(&self, mut sigmas: Array1<f32>, mu: Option<f32>) -> anyhow::Result<Array1<f32>> {
		if self.config.use_dynamic_shifting {
			let mu = mu.ok_or(FluxError::MissingShift)?;
			sigmas.mapv_inplace(|s| Self::time_shift(mu, s));
		} else {
			let shift = self.config.shift;
			sigmas.mapv_inplace(|s| static_shift(shift, s));
		}
		Ok(sigmas)
	}

	fn install(&mut self, sigmas: Array1<f32>, timesteps: Option<Array1<f32>>, mu: Option<f32>) -> anyhow::Result<()> {
		let timesteps = timesteps.unwrap_or_else(|| &sigmas * self.config.num_train_timesteps as f32);

		debug!(steps = timesteps.len(), ?mu, first_sigma = sigmas.first().copied(), "flow-match schedule set");

		self.num_inference_steps = Some(timesteps.len());
		self.sigmas = concatenate![Axis(0), sigmas, Array1::zeros(1)];
		self.timesteps = timesteps;
		self.step_index = None;
		Ok(())
	}

	fn index_for_timestep(&self, timestep: f32) -> anyhow::Result<usize> {
		let indices: Vec<usize> = self
			.timesteps
			.iter()
			.enumerate()
			.filter(|&(_, &t)| t == timestep)
			.map(|(i, _)| i)
			.collect();
		// duplicated timesteps (e.g. img2img restarts) begin from the second occurrence
		match indices.as_slice() {
			[] => Err(FluxError::TimestepNotInSchedule(timestep).into()),
			[only] => Ok(*only),
			[_, second, ..] => Ok(*second)
		}
	}
}

fn static_shift(shift: f32, s: f32) -> f32 {
	shift * s / (1.0 + (shift - 1.0) * s)
}

impl FlowScheduler for FlowMatchEulerDiscreteScheduler {
	fn set_timesteps(&mut self, num_inference_steps: usize, mu: Option<f32>) -> anyhow::Result<()> {
		if num_inference_steps == 0 {
			return Err(FluxError::invalid_argument("num_inference_steps must be >0").into());
		}
		let n = self.config.num_train_timesteps as f32;
		let timesteps = Array1::linspace(self.sigma_max * n, self.sigma_min * n, num_inference_steps);
		let sigmas = self.apply_shift(timesteps / n, mu)?;
		self.install(sigmas, None, mu)
	}

	fn set_custom_timesteps(&mut self, timesteps: &[f32], mu: Option<f32>) -> anyhow::Result<()> {
		if timesteps.is_empty() {
			return Err(FluxError::invalid_argument("`timesteps` must not be empty").into());
		}
		let timesteps = Array1::from_vec(timesteps.to_vec());
		// the timesteps themselves stay as given, only the sigmas are shifted
		let sigmas = self.apply_shift(&timesteps / self.config.num_train_timesteps as f32, mu)?;
		self.install(sigmas, Some(timesteps), mu)
	}

	fn set_sigmas(&mut self, sigmas: &[f32], mu: Option<f32>) -> anyhow::Result<()> {
		if sigmas.is_empty() {
			return Err(FluxError::invalid_argument("`sigmas` must not be empty").into());
		}
		let sigmas = self.apply_shift(Array1::from_vec(sigmas.to_vec()), mu)?;
		self.install(sigmas, None, mu)
	}

	fn timesteps(&self) -> ArrayView1<'_, f32> {
		self.timesteps.view()
	}

	fn step(&mut self, model_output: ArrayView3<'_, f32>, timestep: f32, sample: ArrayView3<'_, f32>) -> anyhow::Result<Array3<f32>> {
		if model_output.shape() != sample.shape() {
			return Err(FluxError::invalid_argument(format!(
				"model output shape {:?} does not match sample shape {:?}",
				model_output.shape(),
				sample.shape()
			))
			.into());
		}

		let step_index = match self.step_index {
			Some(step_index) => step_index,
			None => self.index_for_timestep(timestep)?
		};

		let sigma = *self.sigmas.get(step_index).ok_or(FluxError::ScheduleExhausted)?;
		let sigma_next = *self.sigmas.get(step_index + 1).ok_or(FluxError::ScheduleExhausted)?;
		let dt = sigma_next - sigma;

		let mut prev_sample = sample.to_owned();
		Zip::from(&mut prev_sample).and(&model_output).par_for_each(|x, &v| {
			*x += dt * v;
		});

		self.step_index = Some(step_index + 1);
		Ok(prev_sample)
	}

	fn num_train_timesteps(&self) -> usize {
		self.config.num_train_timesteps
	}
}

impl SchedulerOptimizedDefaults for FlowMatchEulerDiscreteScheduler {
	fn flux_schnell_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized
	{
		Self::new(FlowMatchEulerDiscreteConfig::default())
	}

	fn flux_dev_optimized_default() -> anyhow::Result<Self>
	where
		Self: Sized
	{
		Self::new(FlowMatchEulerDiscreteConfig {
			shift: 3.0,
			use_dynamic_shifting: true,
			..Default::default()
		})
	}
}
