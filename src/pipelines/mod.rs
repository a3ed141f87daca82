//! Diffusion pipelines.

use std::ops::Deref;

mod flux;

pub use self::flux::*;

/// Text prompt(s) used as input in diffusion pipelines. One image (or `num_images_per_prompt` images) is generated for
/// each prompt in the batch.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Prompt(pub(crate) Vec<String>);

impl Prompt {
	/// Returns the batch with each prompt repeated `per_prompt` times, in order.
	pub(crate) fn expanded(&self, per_prompt: usize) -> Vec<&str> {
		self.0.iter().flat_map(|p| std::iter::repeat(p.as_str()).take(per_prompt)).collect()
	}
}

impl Deref for Prompt {
	type Target = Vec<String>;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl<'s> From<&'s str> for Prompt {
	fn from(value: &'s str) -> Self {
		Self(vec![value.to_string()])
	}
}

impl From<String> for Prompt {
	fn from(value: String) -> Self {
		Self(vec![value])
	}
}

impl<'s> From<&'s String> for Prompt {
	fn from(value: &'s String) -> Self {
		Self(vec![value.clone()])
	}
}

impl<'s> From<&'s [&'s str]> for Prompt {
	fn from(value: &'s [&'s str]) -> Self {
		Self(value.iter().map(|v| v.to_string()).collect())
	}
}

impl<'s, const N: usize> From<[&'s str; N]> for Prompt {
	fn from(value: [&'s str; N]) -> Self {
		Self(value.iter().map(|v| v.to_string()).collect())
	}
}

impl<'s> From<Vec<&'s str>> for Prompt {
	fn from(value: Vec<&'s str>) -> Self {
		Self(value.into_iter().map(str::to_string).collect())
	}
}

impl From<Vec<String>> for Prompt {
	fn from(value: Vec<String>) -> Self {
		Self(value)
	}
}
