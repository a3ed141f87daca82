use serde::{Deserialize, Serialize};

use crate::FluxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiffusionFramework {
	Onnx
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TokenizerConfig {
	pub path: String,
	pub model_max_length: usize,
	#[serde(default)]
	pub pad_token: u32
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TextEncoderConfig {
	pub path: String
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TransformerConfig {
	pub path: String,
	#[serde(default = "default_in_channels")]
	pub in_channels: usize,
	#[serde(default)]
	pub guidance_embeds: bool
}

fn default_in_channels() -> usize {
	64
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VAEConfig {
	pub decoder: String,
	pub scaling_factor: f32,
	pub shift_factor: f32,
	#[serde(default = "default_vae_scale_factor")]
	pub scale_factor: usize
}

fn default_vae_scale_factor() -> usize {
	8
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FluxConfig {
	pub tokenizer: TokenizerConfig,
	pub tokenizer_2: TokenizerConfig,
	pub text_encoder: TextEncoderConfig,
	pub text_encoder_2: TextEncoderConfig,
	pub transformer: TransformerConfig,
	pub vae: VAEConfig,
	#[cfg(feature = "scheduler-flow-match-euler")]
	pub scheduler: Option<crate::schedulers::FlowMatchEulerDiscreteConfig>
}

impl FluxConfig {
	pub fn validate(&self) -> anyhow::Result<()> {
		if self.vae.scale_factor == 0 {
			return Err(FluxError::invalid_argument("`vae.scale-factor` must be greater than 0").into());
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "pipeline", rename_all = "kebab-case")]
pub enum DiffusionPipeline {
	Flux {
		framework: DiffusionFramework,
		#[serde(flatten)]
		inner: FluxConfig
	}
}
