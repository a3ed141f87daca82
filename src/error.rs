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

use thiserror::Error;

/// Errors raised by the pipeline and schedulers themselves.
///
/// Pipeline functions return [`anyhow::Result`]; use [`anyhow::Error::downcast_ref`] to match on these. Errors coming
/// from ONNX Runtime, the tokenizer or ndarray are passed through untouched and will not downcast to `FluxError`.
///
/// ```
/// # use realtime_flux::FluxError;
/// let err: anyhow::Error = FluxError::InvalidArgument("nope".to_string()).into();
/// assert!(matches!(err.downcast_ref::<FluxError>(), Some(FluxError::InvalidArgument(_))));
/// ```
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum FluxError {
	/// An argument (or combination of arguments) was rejected before any work was done.
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	/// The scheduler was asked to step a timestep that is not part of its current schedule.
	#[error("timestep {0} is not part of the current schedule")]
	TimestepNotInSchedule(f32),
	/// The scheduler was stepped more times than its schedule allows.
	#[error("scheduler stepped past the end of its schedule")]
	ScheduleExhausted,
	/// A dynamically shifted schedule was requested without a shift (`mu`) value.
	#[error("`mu` must be provided when `use_dynamic_shifting` is enabled")]
	MissingShift
}

impl FluxError {
	pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
		Self::InvalidArgument(msg.into())
	}
}
