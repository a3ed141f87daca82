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
	fs,
	path::{Path, PathBuf},
	sync::Arc
};

use ndarray::{concatenate, Array2, Array3, Array4, ArrayView4, Axis, IxDyn};
use ort::{
	tensor::{FromArray, InputTensor, OrtOwnedTensor},
	Environment, Session, SessionBuilder
};
use tracing::debug;

use super::{FluxOptions, FluxPipeline, FluxTextEncoder, FluxTransformer, FluxVaeDecoder, PromptEmbeddings, TransformerInput};
use crate::{
	config::{DiffusionFramework, DiffusionPipeline, FluxConfig},
	tokenizer::PromptTokenizer,
	DiffusionDevice, Prompt
};

const MANIFEST: &str = "realtime-flux.toml";

fn load_session(environment: &Arc<Environment>, device: &DiffusionDevice, path: impl AsRef<Path>) -> anyhow::Result<Session> {
	let path = path.as_ref();
	debug!(path = %path.display(), ?device, "loading session");
	Ok(SessionBuilder::new(environment)?
		.with_execution_providers([device.clone().into()])?
		.with_model_from_file(path)?)
}

fn extract<D: ndarray::Dimension>(output: &ort::tensor::DynOrtTensor<'_, IxDyn>) -> anyhow::Result<ndarray::Array<f32, D>> {
	let tensor: OrtOwnedTensor<'_, f32, IxDyn> = output.try_extract()?;
	let array = tensor.view().to_owned().into_dimensionality()?;
	Ok(array)
}

/// CLIP + T5 text encoders backed by ONNX Runtime sessions.
///
/// The CLIP text model must output the pooled embedding as its second output; the T5 encoder must output the last
/// hidden state as its first output.
pub struct OrtTextEncoder {
	tokenizer: PromptTokenizer,
	tokenizer_2: PromptTokenizer,
	text_encoder: Session,
	text_encoder_2: Session
}

impl OrtTextEncoder {
	/// Creates a text encoder from already loaded tokenizers and sessions.
	pub fn new(tokenizer: PromptTokenizer, tokenizer_2: PromptTokenizer, text_encoder: Session, text_encoder_2: Session) -> Self {
		Self {
			tokenizer,
			tokenizer_2,
			text_encoder,
			text_encoder_2
		}
	}

	fn clip_pooled(&self, prompts: Vec<&str>) -> anyhow::Result<Array2<f32>> {
		let input_ids = self.tokenizer.encode_padded(prompts, self.tokenizer.len())?;
		let outputs = self.text_encoder.run(vec![InputTensor::from_array(input_ids.into_dyn())])?;
		let pooled = outputs.get(1).ok_or_else(|| anyhow::anyhow!("CLIP text encoder has no pooled output"))?;
		extract(pooled)
	}

	fn t5_embeds(&self, prompts: Vec<&str>, max_sequence_length: usize) -> anyhow::Result<Array3<f32>> {
		let input_ids = self.tokenizer_2.encode_padded(prompts, max_sequence_length)?;
		let outputs = self.text_encoder_2.run(vec![InputTensor::from_array(input_ids.into_dyn())])?;
		extract(&outputs[0])
	}
}

impl FluxTextEncoder for OrtTextEncoder {
	fn encode_prompt(&self, prompt: &Prompt, prompt_2: Option<&Prompt>, num_images_per_prompt: usize, max_sequence_length: usize) -> anyhow::Result<PromptEmbeddings> {
		let prompt_2 = prompt_2.unwrap_or(prompt);

		let pooled_prompt_embeds = self.clip_pooled(prompt.expanded(num_images_per_prompt))?;
		let prompt_embeds = self.t5_embeds(prompt_2.expanded(num_images_per_prompt), max_sequence_length)?;
		let text_ids = Array2::zeros((prompt_embeds.shape()[1], 3));
		debug!(prompt_embeds = ?prompt_embeds.shape(), pooled_prompt_embeds = ?pooled_prompt_embeds.shape(), "encoded prompt");

		Ok(PromptEmbeddings {
			prompt_embeds,
			pooled_prompt_embeds,
			text_ids
		})
	}
}

/// The FLUX transformer backed by an ONNX Runtime session.
///
/// Inputs are bound by name: `hidden_states`, `encoder_hidden_states`, `pooled_projections`, `timestep`, `img_ids`,
/// `txt_ids` and, for guidance-distilled models, `guidance`.
pub struct OrtTransformer {
	session: Session,
	in_channels: usize,
	guidance_embeds: bool
}

impl OrtTransformer {
	/// Wraps a loaded transformer session.
	pub fn new(session: Session, in_channels: usize, guidance_embeds: bool) -> Self {
		Self { session, in_channels, guidance_embeds }
	}
}

impl FluxTransformer for OrtTransformer {
	fn in_channels(&self) -> usize {
		self.in_channels
	}

	fn guidance_embeds(&self) -> bool {
		self.guidance_embeds
	}

	fn forward(&self, input: TransformerInput<'_>) -> anyhow::Result<Array3<f32>> {
		let inputs = self
			.session
			.inputs
			.iter()
			.map(|i| -> anyhow::Result<InputTensor> {
				Ok(match i.name.as_str() {
					"hidden_states" => InputTensor::from_array(input.hidden_states.to_owned().into_dyn()),
					"encoder_hidden_states" => InputTensor::from_array(input.encoder_hidden_states.to_owned().into_dyn()),
					"pooled_projections" => InputTensor::from_array(input.pooled_projections.to_owned().into_dyn()),
					"timestep" => InputTensor::from_array(input.timestep.to_owned().into_dyn()),
					"img_ids" => InputTensor::from_array(input.img_ids.to_owned().into_dyn()),
					"txt_ids" => InputTensor::from_array(input.txt_ids.to_owned().into_dyn()),
					"guidance" => InputTensor::from_array(
						input
							.guidance
							.ok_or_else(|| anyhow::anyhow!("transformer expects a guidance input but the model is configured without one"))?
							.to_owned()
							.into_dyn()
					),
					name => anyhow::bail!("unexpected transformer input `{name}`")
				})
			})
			.collect::<anyhow::Result<Vec<_>>>()?;

		let outputs = self.session.run(inputs)?;
		extract(&outputs[0])
	}
}

/// The FLUX VAE decoder backed by an ONNX Runtime session. Latents are decoded one batch item at a time.
pub struct OrtVaeDecoder {
	session: Session,
	scaling_factor: f32,
	shift_factor: f32,
	scale_factor: usize
}

impl OrtVaeDecoder {
	/// Wraps a loaded VAE decoder session.
	pub fn new(session: Session, scaling_factor: f32, shift_factor: f32, scale_factor: usize) -> Self {
		Self {
			session,
			scaling_factor,
			shift_factor,
			scale_factor
		}
	}
}

impl FluxVaeDecoder for OrtVaeDecoder {
	fn scaling_factor(&self) -> f32 {
		self.scaling_factor
	}

	fn shift_factor(&self) -> f32 {
		self.shift_factor
	}

	fn scale_factor(&self) -> usize {
		self.scale_factor
	}

	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		let mut images = Vec::with_capacity(latents.shape()[0]);
		for latent_chunk in latents.axis_iter(Axis(0)) {
			let latent_chunk = latent_chunk.into_dyn().insert_axis(Axis(0));
			let outputs = self.session.run(vec![InputTensor::from_array(latent_chunk.to_owned())])?;
			let image: Array4<f32> = extract(&outputs[0])?;
			images.push(image);
		}
		let views = images.iter().map(|i| i.view()).collect::<Vec<_>>();
		Ok(concatenate(Axis(0), &views)?)
	}
}

impl FluxPipeline<OrtTextEncoder, OrtTransformer, OrtVaeDecoder> {
	/// Creates a new FLUX pipeline, loading models from `root`.
	///
	/// `root` must contain a `realtime-flux.toml` manifest describing the tokenizers and the ONNX models.
	///
	/// ```no_run
	/// # fn main() -> anyhow::Result<()> {
	/// # use realtime_flux::{FluxPipeline, FluxOptions, OrtEnvironment};
	/// # let environment = OrtEnvironment::default().into_arc();
	/// let pipeline = FluxPipeline::new(&environment, "./flux.1-schnell/", FluxOptions::default())?;
	/// # Ok(())
	/// # }
	/// ```
	pub fn new(environment: &Arc<Environment>, root: impl Into<PathBuf>, options: FluxOptions) -> anyhow::Result<Self> {
		let root: PathBuf = root.into();
		let config: DiffusionPipeline = toml::from_str(&fs::read_to_string(root.join(MANIFEST))?)?;
		let config: FluxConfig = match config {
			DiffusionPipeline::Flux { framework, inner } => {
				match framework {
					DiffusionFramework::Onnx => ()
				}
				inner
			}
		};
		config.validate()?;
		let devices = &options.devices;

		let tokenizer = PromptTokenizer::new(root.join(&config.tokenizer.path), config.tokenizer.model_max_length, config.tokenizer.pad_token)?;
		let tokenizer_2 = PromptTokenizer::new(root.join(&config.tokenizer_2.path), config.tokenizer_2.model_max_length, config.tokenizer_2.pad_token)?;
		let text_encoder = load_session(environment, &devices.text_encoder, root.join(&config.text_encoder.path))?;
		let text_encoder_2 = load_session(environment, &devices.text_encoder_2, root.join(&config.text_encoder_2.path))?;

		let transformer = load_session(environment, &devices.transformer, root.join(&config.transformer.path))?;
		let vae_decoder = load_session(environment, &devices.vae_decoder, root.join(&config.vae.decoder))?;

		Ok(Self::from_components(
			OrtTextEncoder::new(tokenizer, tokenizer_2, text_encoder, text_encoder_2),
			OrtTransformer::new(transformer, config.transformer.in_channels, config.transformer.guidance_embeds),
			OrtVaeDecoder::new(vae_decoder, config.vae.scaling_factor, config.vae.shift_factor, config.vae.scale_factor)
		))
	}
}
