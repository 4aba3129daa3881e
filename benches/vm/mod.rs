use std::io::Cursor;

use criterion::{Criterion, criterion_group};
use kvminilib::{consts::DEFAULT_GUEST_SIZE, mem::MmapMemory};

pub fn load_image_reference_size(c: &mut Criterion) {
	let image: Vec<u8> = (0..DEFAULT_GUEST_SIZE).map(|i| i as u8).collect();
	let mut mem = MmapMemory::new(DEFAULT_GUEST_SIZE).expect("Unable to map guest memory");

	c.bench_function("mem::load_image(64 KiB)", |b| {
		b.iter(|| mem.load_image(Cursor::new(&image)).unwrap())
	});
}

pub fn load_image_small(c: &mut Criterion) {
	let image = [0xe6, 0x10, 0xf4];
	let mut mem = MmapMemory::new(DEFAULT_GUEST_SIZE).expect("Unable to map guest memory");

	c.bench_function("mem::load_image(3 bytes)", |b| {
		b.iter(|| mem.load_image(&image[..]).unwrap())
	});
}

criterion_group!(
	load_image_benchmark_group,
	load_image_reference_size,
	load_image_small
);
