//! Port I/O echo functionality
use std::{
	cell::RefCell,
	fs::{File, OpenOptions},
	io::{self, Write},
	str,
};

use crate::{HypervisorResult, params};

/// The destination of the lines written for serviced port I/O exits.
#[derive(Debug, Default)]
pub enum Destination {
	/// Same IO as the kvmini process.
	#[default]
	StdIo,
	/// Redirect output to a file.
	File(RefCell<File>),
	/// Redirect output to a buffer.
	Buffer(RefCell<String>),
	/// Ignore all output.
	None,
}

/// Handles the port I/O echo.
#[derive(Debug)]
pub struct KvminiSerial {
	pub(crate) destination: Destination,
}
impl KvminiSerial {
	pub fn from_params(params: &params::Output) -> HypervisorResult<Self> {
		Ok(Self {
			destination: match params {
				params::Output::None => Destination::None,
				params::Output::StdIo => Destination::StdIo,
				params::Output::Buffer => {
					Destination::Buffer(RefCell::new(String::with_capacity(1024)))
				}
				params::Output::File(path) => {
					let f = OpenOptions::new()
						.write(true)
						.create(true)
						.truncate(true)
						.open(path)
						.inspect_err(|e| error!("Unable to create port I/O output file: {e}"))?;
					Destination::File(RefCell::new(f))
				}
			},
		})
	}

	/// Output a utf8 buffer to the configured output destination.
	pub fn output(&self, buf: &[u8]) -> io::Result<()> {
		match &self.destination {
			Destination::StdIo => io::stdout().write_all(buf),
			Destination::None => Ok(()),
			Destination::Buffer(b) => {
				b.borrow_mut().push_str(str::from_utf8(buf).map_err(|e| {
					io::Error::new(
						io::ErrorKind::InvalidData,
						format!("invalid UTF-8 bytes in output: {e:?}"),
					)
				})?);
				Ok(())
			}
			Destination::File(f) => f.borrow_mut().write_all(buf),
		}
	}

	/// Reports a serviced port I/O access.
	pub fn port_io(&self, port: u16, data: u32) -> io::Result<()> {
		self.output(format!("IO port: {port:x}, data: {data:x}\n").as_bytes())
	}

	/// Everything written so far, if the output is buffered.
	pub fn buffered_output(&self) -> Option<String> {
		match &self.destination {
			Destination::Buffer(b) => Some(b.borrow().clone()),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::fs;

	use super::*;
	use crate::params::Output;

	#[test]
	fn test_buffered_port_io() {
		let serial = KvminiSerial::from_params(&Output::Buffer).unwrap();
		serial.port_io(0x10, 0x2).unwrap();
		serial.port_io(0x3f8, 0xdeadbeef).unwrap();
		assert_eq!(
			serial.buffered_output().unwrap(),
			"IO port: 10, data: 2\nIO port: 3f8, data: deadbeef\n"
		);
	}

	#[test]
	fn test_invalid_utf8_is_rejected() {
		let serial = KvminiSerial::from_params(&Output::Buffer).unwrap();
		let err = serial.output(&[0xff, 0xfe]).unwrap_err();
		assert_eq!(err.kind(), io::ErrorKind::InvalidData);
	}

	#[test]
	fn test_file_output() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("io.log");
		let serial = KvminiSerial::from_params(&Output::File(path.clone())).unwrap();
		serial.port_io(0x10, 0x2).unwrap();
		assert_eq!(serial.buffered_output(), None);
		drop(serial);
		assert_eq!(fs::read_to_string(path).unwrap(), "IO port: 10, data: 2\n");
	}

	#[test]
	fn test_discarded_output() {
		let serial = KvminiSerial::from_params(&Output::None).unwrap();
		serial.port_io(0x10, 0x2).unwrap();
		assert_eq!(serial.buffered_output(), None);
	}
}
