#![warn(rust_2018_idioms)]

use std::process;

use clap::Parser;
use env_logger::Env;
use kvminilib::{
	args::Args,
	params::Params,
	vm::{self, DefaultBackend},
};

/// Progress messages are shown unless `RUST_LOG` says otherwise.
fn logger(env: Env<'_>) -> env_logger::Builder {
	env_logger::Builder::from_env(env.default_filter_or("info"))
}

fn run_kvmini() -> i32 {
	logger(Env::default()).init();

	let args = Args::parse();
	let image = args.guest_args.image.clone();
	let params = Params::from(args);
	log::info!(
		"kvmini {}: {} of guest memory, image {}",
		env!("CARGO_PKG_VERSION"),
		params.memory_size,
		image.display()
	);

	let handle = match DefaultBackend::open(&params.device) {
		Ok(handle) => handle,
		Err(err) => {
			log::error!("{err}");
			return 1;
		}
	};

	let stats = params.stats;
	let res = vm::launch(handle, &image, params);
	if stats {
		if let Some(stats) = res.stats {
			println!("Run statistics:");
			println!("{stats}");
		}
	}
	res.code
}

fn main() {
	process::exit(run_kvmini())
}
