use ndarray::Array1;
use tracing::debug;

use crate::{FlowScheduler, FluxError};

/// Image sequence length at which the shift is [`BASE_SHIFT`].
pub const BASE_SEQ_LEN: usize = 256;
/// Image sequence length at which the shift is [`MAX_SHIFT`].
pub const MAX_SEQ_LEN: usize = 4096;
/// Shift at [`BASE_SEQ_LEN`].
pub const BASE_SHIFT: f32 = 0.5;
/// Shift at [`MAX_SEQ_LEN`].
pub const MAX_SHIFT: f32 = 1.2;

/// Calculates the timestep shift (`mu`) for an image sequence length (the number of packed latent patches, 4096 for a
/// 1024x1024 image).
///
/// The shift is linear in the sequence length, passing through `(BASE_SEQ_LEN, BASE_SHIFT)` and
/// `(MAX_SEQ_LEN, MAX_SHIFT)`; lengths outside that range are extrapolated.
///
/// ```
/// # use realtime_flux::calculate_timestep_shift;
/// assert!((calculate_timestep_shift(256) - 0.5).abs() < 1e-6);
/// assert!((calculate_timestep_shift(4096) - 1.2).abs() < 1e-6);
/// ```
pub fn calculate_timestep_shift(image_seq_len: usize) -> f32 {
	let m = (MAX_SHIFT - BASE_SHIFT) / (MAX_SEQ_LEN - BASE_SEQ_LEN) as f32;
	let b = BASE_SHIFT - m * BASE_SEQ_LEN as f32;
	image_seq_len as f32 * m + b
}

/// Materializes the timestep schedule on `scheduler` and returns it along with the number of inference steps.
///
/// At most one of `timesteps` and `sigmas` may be given:
/// - `timesteps`: used verbatim via [`FlowScheduler::set_custom_timesteps`] with `mu`.
/// - `sigmas`: used via [`FlowScheduler::set_sigmas`].
/// - neither: [`FlowScheduler::set_timesteps`] with `num_inference_steps` and `mu`.
///
/// The returned step count is the length of the scheduler's schedule, which may differ from `num_inference_steps`.
///
/// # Errors
/// [`FluxError::InvalidArgument`] if both `timesteps` and `sigmas` are given. Scheduler errors are returned as-is.
pub fn prepare_timesteps<S: FlowScheduler + ?Sized>(
	scheduler: &mut S,
	num_inference_steps: usize,
	timesteps: Option<&[f32]>,
	sigmas: Option<&[f32]>,
	mu: Option<f32>
) -> anyhow::Result<(Array1<f32>, usize)> {
	match (timesteps, sigmas) {
		(Some(_), Some(_)) => return Err(FluxError::invalid_argument("only one of `timesteps` or `sigmas` can be passed").into()),
		(Some(timesteps), None) => scheduler.set_custom_timesteps(timesteps, mu)?,
		(None, Some(sigmas)) => scheduler.set_sigmas(sigmas, mu)?,
		(None, None) => scheduler.set_timesteps(num_inference_steps, mu)?
	}

	let timesteps = scheduler.timesteps().to_owned();
	let num_inference_steps = timesteps.len();
	debug!(num_inference_steps, ?mu, "prepared timesteps");
	Ok((timesteps, num_inference_steps))
}

#[cfg(test)]
mod tests {
	use ndarray::{Array1, Array3, ArrayView1, ArrayView3};

	use super::*;

	#[derive(Default)]
	struct RecordingScheduler {
		calls: Vec<String>,
		timesteps: Array1<f32>
	}

	impl FlowScheduler for RecordingScheduler {
		fn set_timesteps(&mut self, num_inference_steps: usize, mu: Option<f32>) -> anyhow::Result<()> {
			self.calls.push(format!("steps {num_inference_steps} {mu:?}"));
			// pretend the scheduler adds a step, as some schedulers do
			self.timesteps = Array1::linspace(1000.0, 0.0, num_inference_steps + 1);
			Ok(())
		}

		fn set_custom_timesteps(&mut self, timesteps: &[f32], _: Option<f32>) -> anyhow::Result<()> {
			self.calls.push("timesteps".to_string());
			self.timesteps = Array1::from_vec(timesteps.to_vec());
			Ok(())
		}

		fn set_sigmas(&mut self, sigmas: &[f32], _: Option<f32>) -> anyhow::Result<()> {
			self.calls.push("sigmas".to_string());
			self.timesteps = Array1::from_iter(sigmas.iter().map(|s| s * 1000.0));
			Ok(())
		}

		fn timesteps(&self) -> ArrayView1<'_, f32> {
			self.timesteps.view()
		}

		fn step(&mut self, _: ArrayView3<'_, f32>, _: f32, sample: ArrayView3<'_, f32>) -> anyhow::Result<Array3<f32>> {
			Ok(sample.to_owned())
		}

		fn num_train_timesteps(&self) -> usize {
			1000
		}
	}

	#[test]
	fn test_shift_anchors() {
		assert!((calculate_timestep_shift(BASE_SEQ_LEN) - BASE_SHIFT).abs() < 1e-6);
		assert!((calculate_timestep_shift(MAX_SEQ_LEN) - MAX_SHIFT).abs() < 1e-6);
	}

	#[test]
	fn test_shift_is_linear() {
		let m = (MAX_SHIFT - BASE_SHIFT) / (MAX_SEQ_LEN - BASE_SEQ_LEN) as f32;
		let b = BASE_SHIFT - m * BASE_SEQ_LEN as f32;
		for len in [0, 1, 64, 256, 1024, 2176, 4096, 8192, 16384] {
			let expected = m * len as f32 + b;
			assert!((calculate_timestep_shift(len) - expected).abs() < 1e-5, "len {len}");
			assert!(calculate_timestep_shift(len).is_finite());
		}
		// extrapolates below the base anchor
		assert!(calculate_timestep_shift(0) < BASE_SHIFT);
	}

	#[test]
	fn test_both_lists_rejected() {
		let pairs: [(&[f32], &[f32]); 3] = [(&[1000.0], &[1.0]), (&[1000.0, 500.0], &[1.0, 0.5]), (&[1.0, 2.0, 3.0], &[0.1])];
		for (timesteps, sigmas) in pairs {
			let mut scheduler = RecordingScheduler::default();
			let err = prepare_timesteps(&mut scheduler, 4, Some(timesteps), Some(sigmas), Some(1.0)).unwrap_err();
			assert!(matches!(err.downcast_ref::<FluxError>(), Some(FluxError::InvalidArgument(_))));
			assert!(scheduler.calls.is_empty());
		}
	}

	#[test]
	fn test_dispatch() -> anyhow::Result<()> {
		let mut scheduler = RecordingScheduler::default();
		let (timesteps, n) = prepare_timesteps(&mut scheduler, 4, Some(&[900.0, 100.0]), None, None)?;
		assert_eq!(timesteps.to_vec(), vec![900.0, 100.0]);
		assert_eq!(n, 2);

		let (_, n) = prepare_timesteps(&mut scheduler, 4, None, Some(&[1.0, 0.75, 0.5]), None)?;
		assert_eq!(n, 3);

		let (timesteps, n) = prepare_timesteps(&mut scheduler, 4, None, None, Some(1.2))?;
		assert_eq!(n, 5);
		assert_eq!(n, timesteps.len());

		assert_eq!(scheduler.calls, vec!["timesteps".to_string(), "sigmas".to_string(), "steps 4 Some(1.2)".to_string()]);
		Ok(())
	}
}
