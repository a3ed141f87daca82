//! `realtime-flux` is a library for realtime text-to-image generation with flow-matching [FLUX] models using
//! [ONNX Runtime], inspired by [HuggingFace diffusers].
//!
//! A generation runs through four stages: the timestep shift is calculated from the image size, the scheduler's
//! timesteps are prepared, the latents are denoised by the transformer (and can be interrupted at any time), and the
//! final latents are decoded by the VAE.
//! ```ignore
//! use realtime_flux::{
//! 	FlowMatchEulerDiscreteScheduler, FluxOptions, FluxPipeline, FluxTxt2ImgOptions, Interrupt, OrtEnvironment,
//! 	SchedulerOptimizedDefaults
//! };
//!
//! let environment = OrtEnvironment::default().into_arc();
//! let mut scheduler = FlowMatchEulerDiscreteScheduler::flux_schnell_optimized_default()?;
//! let pipeline = FluxPipeline::new(&environment, "./flux.1-schnell/", FluxOptions::default())?;
//!
//! let generation = FluxTxt2ImgOptions::default()
//! 	.with_prompts("photo of a red fox", None)
//! 	.with_steps(1)
//! 	.run(&pipeline, &mut scheduler, &Interrupt::new())?;
//! ```
//!
//! See [`FluxPipeline`] for more info on the FLUX pipeline. Model collaborators are traits ([`FluxTextEncoder`],
//! [`FluxTransformer`], [`FluxVaeDecoder`]) so other backends can be plugged in with
//! [`FluxPipeline::from_components`].
//!
//! [FLUX]: https://github.com/black-forest-labs/flux
//! [ONNX Runtime]: https://onnxruntime.ai/
//! [HuggingFace diffusers]: https://github.com/huggingface/diffusers

#![warn(missing_docs)]
#![warn(rustdoc::all)]
#![warn(clippy::correctness, clippy::suspicious, clippy::complexity, clippy::perf, clippy::style)]
#![allow(clippy::tabs_in_doc_comments)]

pub(crate) mod config;
mod error;
pub mod pipelines;
pub mod schedulers;
#[cfg(feature = "tokenizers")]
pub mod tokenizer;

pub use ort::Environment as OrtEnvironment;
use ort::ExecutionProvider;

pub use self::error::FluxError;
pub use self::pipelines::*;
pub use self::schedulers::*;

/// How the CUDA memory arena grows when a session needs more device memory.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaExtendStrategy {
	/// Grow by powers of two. Fewer, larger allocations.
	#[default]
	PowerOfTwo,
	/// Grow by exactly the requested amount. Keeps peak VRAM usage down for the large FLUX transformer.
	SameAsRequested
}

impl ArenaExtendStrategy {
	fn as_str(self) -> &'static str {
		match self {
			Self::PowerOfTwo => "kNextPowerOfTwo",
			Self::SameAsRequested => "kSameAsRequested"
		}
	}
}

impl From<ArenaExtendStrategy> for String {
	fn from(val: ArenaExtendStrategy) -> Self {
		val.as_str().to_string()
	}
}

/// The type of search done for cuDNN convolution algorithms. Only the VAE decoder has convolutions worth searching.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CuDNNConvolutionAlgorithmSearch {
	/// Exhaustive kernel search, the ONNX Runtime default.
	#[default]
	Exhaustive,
	/// Heuristic kernel search; cheaper to set up than `Exhaustive`.
	Heuristic,
	/// cuDNN's default kernels without any search. **Not** ONNX Runtime's default, which is `Exhaustive`.
	Default
}

impl CuDNNConvolutionAlgorithmSearch {
	fn as_str(self) -> &'static str {
		match self {
			Self::Exhaustive => "EXHAUSTIVE",
			Self::Heuristic => "HEURISTIC",
			Self::Default => "DEFAULT"
		}
	}
}

impl From<CuDNNConvolutionAlgorithmSearch> for String {
	fn from(val: CuDNNConvolutionAlgorithmSearch) -> Self {
		val.as_str().to_string()
	}
}

/// Device options for the CUDA execution provider.
///
/// For low-VRAM devices running FLUX.1, it's best to use a float16 transformer with the following parameters:
/// ```ignore
/// CUDADeviceOptions {
/// 	memory_limit: Some(12_000_000_000),
/// 	arena_extend_strategy: Some(ArenaExtendStrategy::SameAsRequested),
/// 	..Default::default()
/// }
/// ```
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CUDADeviceOptions {
	/// The strategy to use for extending the device memory arena. See [`ArenaExtendStrategy`] for more info.
	pub arena_extend_strategy: Option<ArenaExtendStrategy>,
	/// Per-session (aka per-model) memory limit. Models may use all available VRAM if a memory limit is not set.
	/// VRAM usage may be higher than the memory limit (though typically not by much).
	pub memory_limit: Option<usize>,
	/// The type of search done for cuDNN convolution algorithms. See [`CuDNNConvolutionAlgorithmSearch`].
	pub cudnn_conv_algorithm_search: Option<CuDNNConvolutionAlgorithmSearch>
}

impl From<CUDADeviceOptions> for ExecutionProvider {
	fn from(val: CUDADeviceOptions) -> Self {
		let mut ep = ExecutionProvider::cuda();
		if let Some(arena_extend_strategy) = val.arena_extend_strategy {
			ep = ep.with("arena_extend_strategy", arena_extend_strategy);
		}
		if let Some(memory_limit) = val.memory_limit {
			ep = ep.with("gpu_mem_limit", memory_limit.to_string());
		}
		if let Some(cudnn_conv_algorithm_search) = val.cudnn_conv_algorithm_search {
			ep = ep.with("cudnn_conv_algo_search", cudnn_conv_algorithm_search);
		}
		ep
	}
}

/// A device to place one of the pipeline's models on.
///
/// If a device is not specified, or a configured execution provider is not available, the model will be placed on the
/// CPU.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DiffusionDevice {
	/// Use the CPU as a device. **This is the default device unless another device is specified.**
	CPU,
	/// Use NVIDIA CUDA as a device. Requires an NVIDIA Kepler GPU or later.
	///
	/// First value is the device ID (which can be set to 0 in most cases). Second value is additional execution
	/// provider parameters, see [`CUDADeviceOptions`].
	CUDA(usize, Option<CUDADeviceOptions>),
	/// Use NVIDIA TensorRT as a device. Requires an NVIDIA Kepler GPU or later.
	TensorRT,
	/// Custom execution provider w/ options. Other execution providers have not been tested and may not work with some
	/// models.
	Custom(ExecutionProvider)
}

impl From<DiffusionDevice> for ExecutionProvider {
	fn from(value: DiffusionDevice) -> Self {
		match value {
			DiffusionDevice::CPU => ExecutionProvider::cpu(),
			DiffusionDevice::CUDA(device, options) => ExecutionProvider::from(options.unwrap_or_default()).with("device_id", device.to_string()),
			DiffusionDevice::TensorRT => ExecutionProvider::tensorrt(),
			DiffusionDevice::Custom(ep) => ep
		}
	}
}

/// Select which device each model should be placed on.
///
/// The transformer is by far the largest model in the pipeline. On GPUs with little VRAM, it may be favorable to place
/// the text encoders and VAE decoder on the CPU so the transformer can be placed on the GPU:
/// ```ignore
/// DiffusionDeviceControl {
/// 	transformer: DiffusionDevice::CUDA(0, None),
/// 	..Default::default()
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DiffusionDeviceControl {
	/// The device on which to place the CLIP text encoder.
	pub text_encoder: DiffusionDevice,
	/// The device on which to place the T5 text encoder.
	pub text_encoder_2: DiffusionDevice,
	/// The device on which to place the FLUX transformer.
	pub transformer: DiffusionDevice,
	/// The device on which to place the variational autoencoder decoder.
	pub vae_decoder: DiffusionDevice
}

impl DiffusionDeviceControl {
	/// Constructs [`DiffusionDeviceControl`] with all models on the same device.
	///
	/// ```ignore
	/// let pipeline = FluxPipeline::new(
	/// 	&environment,
	/// 	"./flux.1-schnell/",
	/// 	FluxOptions {
	/// 		devices: DiffusionDeviceControl::all(DiffusionDevice::CUDA(0, None))
	/// 	}
	/// )?;
	/// ```
	///
	/// Note that if you are setting `memory_limit` in [`CUDADeviceOptions`], the memory limit is **per session** (aka
	/// per model), NOT for the entire pipeline.
	pub fn all(device: DiffusionDevice) -> Self {
		Self {
			text_encoder: device.clone(),
			text_encoder_2: device.clone(),
			transformer: device.clone(),
			vae_decoder: device
		}
	}
}

impl Default for DiffusionDeviceControl {
	fn default() -> Self {
		DiffusionDeviceControl::all(DiffusionDevice::CPU)
	}
}
