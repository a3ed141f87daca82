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

use std::{cell::RefCell, env};

use kdam::{tqdm, BarExt};
use realtime_flux::{
	DiffusionDevice, DiffusionDeviceControl, FlowMatchEulerDiscreteScheduler, FluxGeneration, FluxOptions, FluxPipeline, FluxTxt2ImgOptions,
	Interrupt, OrtEnvironment, OrtTextEncoder, OrtTransformer, OrtVaeDecoder
};
use requestty::Question;
use show_image::{ImageInfo, ImageView, WindowOptions, WindowProxy};
use tracing_subscriber::EnvFilter;

const MAX_STEPS: i64 = 4;
/// Minimum steps for the enhance pass.
const ENHANCE_STEPS: usize = 2;

type Pipeline = FluxPipeline<OrtTextEncoder, OrtTransformer, OrtVaeDecoder>;

fn generate(
	pipeline: &Pipeline,
	scheduler: &mut FlowMatchEulerDiscreteScheduler,
	interrupt: &Interrupt,
	options: FluxTxt2ImgOptions,
	steps: usize
) -> anyhow::Result<FluxGeneration> {
	interrupt.reset();
	let pb = RefCell::new(tqdm!(total = steps, desc = "generating"));
	options
		.with_steps(steps)
		.callback_progress(1, move |step, _| {
			pb.borrow_mut().update_to(step + 1);
			true
		})
		.run(pipeline, scheduler, interrupt)
}

fn show(window: &WindowProxy, generation: FluxGeneration) -> anyhow::Result<()> {
	println!("seed {}, {}", generation.seed, generation.latency_label());
	let image = generation.into_image()?.into_rgb8();
	let image = ImageView::new(ImageInfo::rgb8(image.width(), image.height()), &image);
	window.set_image("result", image)?;
	Ok(())
}

#[show_image::main]
fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

	let mut path = env::current_dir()?;
	path.push(env::args().nth(1).unwrap_or_else(|| "flux.1-schnell".to_string()));

	let environment = OrtEnvironment::default().into_arc();
	let mut scheduler = FlowMatchEulerDiscreteScheduler::from_pipeline_dir(&path)?;
	let pipeline = FluxPipeline::new(
		&environment,
		&path,
		FluxOptions {
			devices: DiffusionDeviceControl {
				transformer: DiffusionDevice::CUDA(0, None),
				vae_decoder: DiffusionDevice::CUDA(0, None),
				..Default::default()
			}
		}
	)?;
	let size = pipeline.default_size() as u32;

	let window = show_image::create_window("realtime-flux", WindowOptions::default().set_size([size, size]))?;
	let interrupt = Interrupt::new();
	let mut seed = Some(42);

	loop {
		let prompt = match requestty::prompt_one(Question::input("prompt").message("🔮 enter your prompt").build()) {
			Ok(answer) => match answer.as_string() {
				Some(prompt) if !prompt.is_empty() => prompt.to_string(),
				_ => continue
			},
			Err(_) => break
		};
		let steps = requestty::prompt_one(
			Question::int("steps")
				.message("👣 inference steps")
				.default(1)
				.validate(|n, _| {
					if (1..=MAX_STEPS).contains(&n) {
						Ok(())
					} else {
						Err(format!("steps must be between 1 and {MAX_STEPS}"))
					}
				})
				.build()
		)?
		.as_int()
		.unwrap_or(1) as usize;
		let randomize = requestty::prompt_one(Question::confirm("randomize").message("🎲 random seed?").default(false).build())?
			.as_bool()
			.unwrap_or(false);

		let new_options = || FluxTxt2ImgOptions::default().with_size(size, size).with_prompts(prompt.as_str(), None);
		let options = match seed {
			Some(seed) if !randomize => new_options().with_seed(seed),
			_ => new_options().with_random_seed()
		};

		let generation = generate(&pipeline, &mut scheduler, &interrupt, options, steps)?;
		let generation_seed = generation.seed;
		seed = Some(generation_seed);
		show(&window, generation)?;

		// same prompt and seed, more steps
		let enhance = requestty::prompt_one(Question::confirm("enhance").message("🚀 enhance image?").default(false).build())?
			.as_bool()
			.unwrap_or(false);
		if enhance {
			let steps = ENHANCE_STEPS.max(steps + 1).min(MAX_STEPS as usize);
			let generation = generate(&pipeline, &mut scheduler, &interrupt, new_options().with_seed(generation_seed), steps)?;
			show(&window, generation)?;
		}
	}

	Ok(())
}
