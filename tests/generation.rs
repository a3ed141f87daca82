use std::{
	cell::{Cell, RefCell},
	rc::Rc
};

use image::GenericImageView;
use ndarray::{Array2, Array3, Array4, ArrayView4};
use rand::{rngs::StdRng, SeedableRng};
use realtime_flux::{
	calculate_timestep_shift, prepare_latents, unpack_latents, FlowMatchEulerDiscreteScheduler, FluxError, FluxPipeline, FluxTextEncoder,
	FluxTransformer, FluxTxt2ImgOptions, FluxVaeDecoder, Interrupt, OutputType, Prompt, PromptEmbeddings, SchedulerOptimizedDefaults,
	TransformerInput, MAX_SEED
};

struct ZeroTextEncoder;

impl FluxTextEncoder for ZeroTextEncoder {
	fn encode_prompt(&self, prompt: &Prompt, _: Option<&Prompt>, num_images_per_prompt: usize, max_sequence_length: usize) -> anyhow::Result<PromptEmbeddings> {
		let batch_size = prompt.len() * num_images_per_prompt;
		Ok(PromptEmbeddings {
			prompt_embeds: Array3::zeros((batch_size, max_sequence_length, 32)),
			pooled_prompt_embeds: Array2::zeros((batch_size, 16)),
			text_ids: Array2::zeros((max_sequence_length, 3))
		})
	}
}

#[derive(Default)]
struct CountingTransformer {
	guidance_embeds: bool,
	forwards: Cell<usize>,
	guidance: RefCell<Vec<Option<Vec<f32>>>>
}

impl FluxTransformer for CountingTransformer {
	fn in_channels(&self) -> usize {
		64
	}

	fn guidance_embeds(&self) -> bool {
		self.guidance_embeds
	}

	fn forward(&self, input: TransformerInput<'_>) -> anyhow::Result<Array3<f32>> {
		self.forwards.set(self.forwards.get() + 1);
		self.guidance.borrow_mut().push(input.guidance.map(|g| g.to_vec()));
		Ok(Array3::zeros(input.hidden_states.raw_dim()))
	}
}

#[derive(Default)]
struct RecordingVae {
	decoded: RefCell<Vec<Array4<f32>>>
}

impl FluxVaeDecoder for RecordingVae {
	fn scaling_factor(&self) -> f32 {
		1.0
	}

	fn shift_factor(&self) -> f32 {
		0.0
	}

	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		self.decoded.borrow_mut().push(latents.to_owned());
		let (b, _, h, w) = latents.dim();
		Ok(Array4::zeros((b, 3, h * 8, w * 8)))
	}
}

type FakePipeline = FluxPipeline<ZeroTextEncoder, CountingTransformer, RecordingVae>;

fn pipeline() -> FakePipeline {
	FluxPipeline::from_components(ZeroTextEncoder, CountingTransformer::default(), RecordingVae::default())
}

fn options() -> FluxTxt2ImgOptions {
	FluxTxt2ImgOptions::default()
		.with_prompts("a cute white cat holding a sign that says hello world", None)
		.with_size(256, 256)
		.with_max_sequence_length(16)
}

fn assert_invalid_argument(err: anyhow::Error) {
	assert!(matches!(err.downcast_ref::<FluxError>(), Some(FluxError::InvalidArgument(_))), "unexpected error: {err}");
}

#[test]
fn single_step_generation() -> anyhow::Result<()> {
	let pipeline = pipeline();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	let generation = FluxTxt2ImgOptions::default()
		.with_prompts("a cute white cat holding a sign that says hello world", None)
		.with_size(1024, 1024)
		.with_steps(1)
		.with_seed(42)
		.run(&pipeline, &mut scheduler, &Interrupt::new())?;

	assert_eq!(pipeline.default_size(), 1024);
	assert_eq!(generation.seed, 42);
	assert_eq!(pipeline.transformer().forwards.get(), 1);
	assert_eq!(scheduler.step_index(), Some(1));
	assert_eq!(pipeline.vae().decoded.borrow().len(), 1);
	assert_eq!(generation.images.len(), 1);
	let image = generation.clone().into_image()?;
	assert_eq!(image.dimensions(), (1024, 1024));
	assert!(generation.latency_label().starts_with("Latency: "));
	assert!(generation.latency_label().ends_with(" seconds"));
	Ok(())
}

#[test]
fn interrupted_before_start_decodes_initial_latents() -> anyhow::Result<()> {
	let pipeline = pipeline();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	let interrupt = Interrupt::new();
	interrupt.interrupt();

	let generation = options().with_seed(7).run(&pipeline, &mut scheduler, &interrupt)?;

	assert_eq!(pipeline.transformer().forwards.get(), 0);
	assert_eq!(scheduler.step_index(), None);
	assert_eq!(generation.images.len(), 1);

	let (initial, _) = prepare_latents(1, 16, 256, 256, 8, &mut StdRng::seed_from_u64(7), None)?;
	let decoded = pipeline.vae().decoded.borrow();
	assert_eq!(decoded.len(), 1);
	assert_eq!(decoded[0], unpack_latents(initial.view(), 256, 256, 8)?);
	Ok(())
}

#[test]
fn callback_can_interrupt() -> anyhow::Result<()> {
	let pipeline = pipeline();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	let calls = Rc::new(Cell::new(0));
	let calls_cb = Rc::clone(&calls);
	let interrupt = Interrupt::new();

	let generation = options()
		.with_steps(4)
		.callback_progress(1, move |step, _| {
			calls_cb.set(calls_cb.get() + 1);
			step < 1
		})
		.run(&pipeline, &mut scheduler, &interrupt)?;

	assert!(interrupt.is_interrupted());
	assert_eq!(calls.get(), 2);
	assert_eq!(pipeline.transformer().forwards.get(), 2);
	assert_eq!(pipeline.vae().decoded.borrow().len(), 1);
	assert_eq!(generation.images.len(), 1);
	Ok(())
}

#[test]
fn decoded_callback_sees_images() -> anyhow::Result<()> {
	let pipeline = pipeline();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	let seen = Rc::new(Cell::new(0));
	let seen_cb = Rc::clone(&seen);

	options()
		.with_steps(4)
		.callback_decoded(2, move |_, _, images| {
			assert_eq!(images.len(), 1);
			seen_cb.set(seen_cb.get() + 1);
			true
		})
		.run(&pipeline, &mut scheduler, &Interrupt::new())?;

	// steps 0 and 2, plus the final decode
	assert_eq!(seen.get(), 2);
	assert_eq!(pipeline.vae().decoded.borrow().len(), 3);
	Ok(())
}

#[test]
fn both_timesteps_and_sigmas_rejected() {
	let pipeline = pipeline();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	let err = options()
		.with_timesteps(vec![1000.0, 500.0])
		.with_sigmas(vec![1.0, 0.5])
		.run(&pipeline, &mut scheduler, &Interrupt::new())
		.unwrap_err();
	assert_invalid_argument(err);
	assert_eq!(pipeline.transformer().forwards.get(), 0);
	assert!(pipeline.vae().decoded.borrow().is_empty());
}

#[test]
fn iterations_match_schedule_length() -> anyhow::Result<()> {
	let pipeline = pipeline();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	options()
		.with_timesteps(vec![1000.0, 750.0, 500.0])
		.run(&pipeline, &mut scheduler, &Interrupt::new())?;
	assert_eq!(pipeline.transformer().forwards.get(), 3);

	let pipeline = self::pipeline();
	options()
		.with_sigmas(vec![1.0, 0.8, 0.6, 0.4, 0.2])
		.run(&pipeline, &mut scheduler, &Interrupt::new())?;
	assert_eq!(pipeline.transformer().forwards.get(), 5);

	let pipeline = self::pipeline();
	options().with_steps(3).run(&pipeline, &mut scheduler, &Interrupt::new())?;
	assert_eq!(pipeline.transformer().forwards.get(), 3);
	Ok(())
}

#[test]
fn same_seed_same_latents() -> anyhow::Result<()> {
	let run = |seed: u64| -> anyhow::Result<Array4<f32>> {
		let pipeline = pipeline();
		let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
		options().with_seed(seed).with_steps(2).run(&pipeline, &mut scheduler, &Interrupt::new())?;
		let decoded = pipeline.vae().decoded.borrow();
		Ok(decoded[0].clone())
	};
	assert_eq!(run(1234)?, run(1234)?);
	assert_ne!(run(1234)?, run(4321)?);
	Ok(())
}

#[test]
fn random_seed_is_reported() -> anyhow::Result<()> {
	let pipeline = pipeline();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	let generation = options().with_seed(3).with_random_seed().run(&pipeline, &mut scheduler, &Interrupt::new())?;
	assert!(generation.seed <= MAX_SEED);
	Ok(())
}

#[test]
fn batch_and_array_output() -> anyhow::Result<()> {
	let pipeline = pipeline();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	let generation = options()
		.with_prompts(["a red fox", "a blue fox"], None)
		.with_num_images_per_prompt(2)
		.with_output_type(OutputType::Array)
		.run(&pipeline, &mut scheduler, &Interrupt::new())?;

	assert_eq!(generation.images.len(), 4);
	for image in &generation.images {
		let array = image.as_array().expect("array output");
		assert_eq!(array.dim(), (256, 256, 3));
		// a zero decode maps to mid-gray
		assert!(array.iter().all(|&x| (x - 0.5).abs() < 1e-6));
	}
	Ok(())
}

#[test]
fn guidance_only_for_guidance_models() -> anyhow::Result<()> {
	let pipeline = FluxPipeline::from_components(
		ZeroTextEncoder,
		CountingTransformer {
			guidance_embeds: true,
			..Default::default()
		},
		RecordingVae::default()
	);
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	options().with_steps(2).with_guidance_scale(5.0).run(&pipeline, &mut scheduler, &Interrupt::new())?;
	assert!(pipeline.transformer().guidance.borrow().iter().all(|g| g.as_deref() == Some(&[5.0][..])));

	let pipeline = self::pipeline();
	options().with_steps(2).with_guidance_scale(5.0).run(&pipeline, &mut scheduler, &Interrupt::new())?;
	assert!(pipeline.transformer().guidance.borrow().iter().all(Option::is_none));
	Ok(())
}

#[test]
fn invalid_arguments_rejected() {
	let pipeline = pipeline();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();

	let mut unaligned = options();
	unaligned.width = 1000;
	assert_invalid_argument(unaligned.run(&pipeline, &mut scheduler, &Interrupt::new()).unwrap_err());

	assert_invalid_argument(options().with_max_sequence_length(513).run(&pipeline, &mut scheduler, &Interrupt::new()).unwrap_err());
	assert_invalid_argument(options().with_steps(0).run(&pipeline, &mut scheduler, &Interrupt::new()).unwrap_err());
	assert_invalid_argument(
		options()
			.with_prompts(vec!["a", "b"], Some(vec!["c"]))
			.run(&pipeline, &mut scheduler, &Interrupt::new())
			.unwrap_err()
	);
	assert_invalid_argument(FluxTxt2ImgOptions::default().run(&pipeline, &mut scheduler, &Interrupt::new()).unwrap_err());

	assert_eq!(pipeline.transformer().forwards.get(), 0);
}

#[test]
fn dynamic_shift_follows_image_size() -> anyhow::Result<()> {
	let pipeline = pipeline();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::flux_dev_optimized_default()?;
	options()
		.with_size(1024, 1024)
		.with_steps(4)
		.with_seed(0)
		.run(&pipeline, &mut scheduler, &Interrupt::new())?;
	assert_eq!(pipeline.transformer().forwards.get(), 4);

	// 1024x1024 packs into 4096 tokens, the top of the shift range
	let mu = calculate_timestep_shift(4096);
	assert!((mu - 1.2).abs() < 1e-6);

	let expected = [1.0, 0.75, 0.5, 0.25]
		.into_iter()
		.map(|s| FlowMatchEulerDiscreteScheduler::time_shift(1.2, s))
		.chain([0.0])
		.collect::<Vec<f32>>();
	let sigmas = scheduler.sigmas();
	assert_eq!(sigmas.len(), expected.len());
	for (actual, expected) in sigmas.iter().zip(&expected) {
		assert!((actual - expected).abs() < 1e-5, "{actual} != {expected}");
	}
	Ok(())
}

struct FlatVae;

impl FluxVaeDecoder for FlatVae {
	fn scaling_factor(&self) -> f32 {
		1.0
	}

	fn shift_factor(&self) -> f32 {
		0.0
	}

	fn scale_factor(&self) -> usize {
		0
	}

	fn decode(&self, latents: ArrayView4<'_, f32>) -> anyhow::Result<Array4<f32>> {
		Ok(latents.to_owned())
	}
}

#[test]
fn zero_vae_scale_factor_rejected() {
	let pipeline = FluxPipeline::from_components(ZeroTextEncoder, CountingTransformer::default(), FlatVae);
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	assert_invalid_argument(options().run(&pipeline, &mut scheduler, &Interrupt::new()).unwrap_err());
	assert_eq!(pipeline.transformer().forwards.get(), 0);
}

#[test]
fn enhance_rerun_reuses_reported_seed() -> anyhow::Result<()> {
	let first = pipeline();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::default();
	let generation = options().with_random_seed().with_steps(1).run(&first, &mut scheduler, &Interrupt::new())?;

	let enhanced = pipeline();
	options().with_seed(generation.seed).with_steps(2).run(&enhanced, &mut scheduler, &Interrupt::new())?;
	assert_eq!(enhanced.transformer().forwards.get(), 2);
	// the fake transformer predicts zero velocity, so both runs decode their starting noise
	assert_eq!(first.vae().decoded.borrow()[0], enhanced.vae().decoded.borrow()[0]);
	Ok(())
}
