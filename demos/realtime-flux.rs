use realtime_flux::{
	ArenaExtendStrategy, CUDADeviceOptions, DiffusionDevice, DiffusionDeviceControl, FlowMatchEulerDiscreteScheduler, FluxOptions, FluxPipeline,
	FluxTxt2ImgOptions, Interrupt, OrtEnvironment
};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

	let environment = OrtEnvironment::default().into_arc();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::from_pipeline_dir("./flux.1-schnell/")?;
	let pipeline = FluxPipeline::new(
		&environment,
		"./flux.1-schnell/",
		FluxOptions {
			devices: DiffusionDeviceControl {
				transformer: DiffusionDevice::CUDA(
					0,
					Some(CUDADeviceOptions {
						memory_limit: Some(12_000_000_000),
						arena_extend_strategy: Some(ArenaExtendStrategy::SameAsRequested),
						..Default::default()
					})
				),
				..Default::default()
			}
		}
	)?;

	let generation = FluxTxt2ImgOptions::default()
		.with_prompts("a cute white cat holding a sign that says hello world", None)
		.with_seed(42)
		.with_steps(1)
		.run(&pipeline, &mut scheduler, &Interrupt::new())?;
	println!("seed {}, {}", generation.seed, generation.latency_label());
	generation.into_image()?.into_rgb8().save("result.png")?;

	Ok(())
}
