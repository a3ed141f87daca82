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

//! Prompt tokenization for the CLIP and T5 text encoders.

use std::path::PathBuf;

use ndarray::Array2;
use tokenizers::{EncodeInput, PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

/// A [HuggingFace tokenizers](https://github.com/huggingface/tokenizers) tokenizer producing fixed-length token id
/// batches.
///
/// FLUX uses two of these: a CLIP tokenizer (77 tokens) for the pooled embedding and a T5 tokenizer (up to 512 tokens)
/// for the per-token embeddings.
pub struct PromptTokenizer {
	inner: Tokenizer,
	model_max_length: usize,
	pad_token_id: u32
}

impl PromptTokenizer {
	/// Loads a tokenizer from a `tokenizer.json` file.
	pub fn new(path: impl Into<PathBuf>, model_max_length: usize, pad_token_id: u32) -> anyhow::Result<Self> {
		let bytes = std::fs::read(path.into())?;
		Self::from_bytes(bytes, model_max_length, pad_token_id)
	}

	/// Loads a tokenizer from the contents of a `tokenizer.json` file.
	pub fn from_bytes<B: AsRef<[u8]>>(bytes: B, model_max_length: usize, pad_token_id: u32) -> anyhow::Result<Self> {
		let tokenizer: Tokenizer = serde_json::from_slice(bytes.as_ref())?;
		Ok(Self {
			inner: tokenizer,
			model_max_length,
			pad_token_id
		})
	}

	/// Returns the maximum number of tokens the text encoder accepts. 77 for CLIP.
	#[allow(clippy::len_without_is_empty)]
	pub fn len(&self) -> usize {
		self.model_max_length
	}

	/// Returns the ID of the padding token.
	pub fn pad(&self) -> u32 {
		self.pad_token_id
	}

	/// Encodes the input string(s) into arrays of token IDs, without padding or truncation.
	pub fn encode<'s, E>(&self, enc: Vec<E>) -> anyhow::Result<Vec<Vec<u32>>>
	where
		E: Into<EncodeInput<'s>> + Send
	{
		Ok(self
			.inner
			.encode_batch(enc, true)
			.map_err(|e| anyhow::anyhow!("{e:?}"))?
			.iter()
			.map(|f| f.get_ids().to_vec())
			.collect())
	}

	/// Encodes the input prompts into a `(batch, max_length)` array, truncating long prompts and padding short ones
	/// with the padding token. `max_length` is capped to [`PromptTokenizer::len`].
	///
	/// Truncation happens before special tokens are added, so every row still ends in the end-of-string token; CLIP
	/// reads its pooled output at that position.
	pub fn encode_padded<'s, E>(&self, enc: Vec<E>, max_length: usize) -> anyhow::Result<Array2<i32>>
	where
		E: Into<EncodeInput<'s>> + Send
	{
		let batch_size = enc.len();
		let max_length = max_length.min(self.model_max_length);

		let mut tokenizer = self.inner.clone();
		tokenizer.with_truncation(Some(TruncationParams { max_length, ..Default::default() }));
		tokenizer.with_padding(Some(PaddingParams {
			strategy: PaddingStrategy::Fixed(max_length),
			pad_id: self.pad_token_id,
			..Default::default()
		}));

		Ok(Array2::from_shape_vec(
			(batch_size, max_length),
			tokenizer
				.encode_batch(enc, true)
				.map_err(|e| anyhow::anyhow!("{e:?}"))?
				.iter()
				.flat_map(|v| v.get_ids().iter().map(|tok| *tok as i32).collect::<Vec<i32>>())
				.collect()
		)?)
	}
}
