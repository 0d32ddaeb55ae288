// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

#![allow(clippy::float_cmp)]

use {
	crate::{
		common::{Error, Result, TagSet},
		description::{ObjectId, ServiceId, TopologyVersion}
	},
	std::{fmt, io::{Read, Write}},
	serde::{Serialize, Deserialize}
};

pub const MIN_WIRE_VERSION: i32 = 6;
pub const MAX_WIRE_VERSION: i32 = 21;
/// Default `maxMessageSizeBytes`, used until the server reports its own.
pub const MAX_MESSAGE_SIZE_BYTES: usize = 48_000_000;

#[cfg(feature = "compress")]
pub const SUPPORTED_COMPRESSORS: [Compressor; 2] = [Compressor::Zstd, Compressor::Noop];
#[cfg(not(feature = "compress"))]
pub const SUPPORTED_COMPRESSORS: [Compressor; 1] = [Compressor::Noop];

/// OP_MSG flag bits
pub const FLAG_CHECKSUM_PRESENT: u32 = 1;
pub const FLAG_MORE_TO_COME:     u32 = 1 << 1;
pub const FLAG_EXHAUST_ALLOWED:  u32 = 1 << 16;

const HEADER_LEN:             usize = 16;
const COMPRESSION_HEADER_LEN: usize = 9;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InvalidReplyError {
	/// The opcode was not MSG
	OpCode,
	/// Response_to did not match request_id
	ResponseTo,
	/// Payload type was not 0
	PayloadType,
	/// The message length is out of bounds
	Length,
	/// Invalid compressor
	Compression
}

#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
	Compressed = 2012,
	Msg        = 2013
}

impl OpCode {
	fn from_i32(v: i32) -> std::result::Result<Self, InvalidReplyError> {
		match v {
			2012 => Ok(Self::Compressed),
			2013 => Ok(Self::Msg),
			_    => Err(InvalidReplyError::OpCode)
		}
	}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
	pub message_length: u32,
	pub request_id:     i32,
	pub response_to:    i32,
	pub op_code:        OpCode
}

impl Header {
	fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
		let mut buf = [0u8; HEADER_LEN];
		reader.read_exact(&mut buf)?;
		Ok(Self {
			message_length: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
			request_id:     i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
			response_to:    i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
			op_code:        OpCode::from_i32(i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]))?
		})
	}

	fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&self.message_length.to_le_bytes());
		slice[4..8].copy_from_slice(&self.request_id.to_le_bytes());
		slice[8..12].copy_from_slice(&self.response_to.to_le_bytes());
		slice[12..16].copy_from_slice(&(self.op_code as i32).to_le_bytes());
	}
}

struct CompressionData {
	original_opcode:   OpCode,
	uncompressed_size: u32,
	compressor_id:     Compressor
}

impl CompressionData {
	fn copy_from_slice(buf: &[u8]) -> std::result::Result<Self, InvalidReplyError> {
		if buf.len() < COMPRESSION_HEADER_LEN {
			return Err(InvalidReplyError::Length);
		}

		Ok(Self {
			original_opcode:   OpCode::from_i32(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))?,
			uncompressed_size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
			compressor_id:     match buf[8] {
				0 => Compressor::Noop,
				1 => Compressor::Snappy,
				2 => Compressor::Zlib,
				3 => Compressor::Zstd,
				_ => return Err(InvalidReplyError::Compression)
			}
		})
	}

	fn copy_to_slice(self, slice: &mut [u8]) {
		slice[0..4].copy_from_slice(&(self.original_opcode as i32).to_le_bytes());
		slice[4..8].copy_from_slice(&self.uncompressed_size.to_le_bytes());
		slice[8] = self.compressor_id as _;
	}
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Compressor {
	Noop   = 0,
	Snappy = 1,
	Zlib   = 2,
	Zstd   = 3
}

impl Compressor {
	pub fn is_supported(self) -> bool {
		SUPPORTED_COMPRESSORS.contains(&self)
	}

	/// Picks the first of the requested compressors the server offered and this crate supports.
	pub fn negotiate(requested: &[Self], offered: &[Self]) -> Option<Self> {
		requested.iter()
			.copied()
			.find(|c| c.is_supported() && offered.contains(c))
	}

	fn compress(self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
		match self {
			Self::Noop => dst.extend_from_slice(src),
			#[cfg(feature = "compress")]
			Self::Zstd => {
				let mut encoder = zstd::Encoder::new(dst, 0)?;
				encoder.write_all(src)?;
				encoder.finish()?;
			}
			compressor => return Err(Error::InvalidSettings(format!("unsupported compressor: {:?}", compressor)))
		}
		Ok(())
	}

	fn decompress(self, src: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
		if uncompressed_size > MAX_MESSAGE_SIZE_BYTES {
			return Err(InvalidReplyError::Length.into());
		}

		let mut buf = vec![0u8; uncompressed_size];
		match self {
			Self::Noop => (&src[..]).read_exact(&mut buf)?,
			#[cfg(feature = "compress")]
			Self::Zstd => zstd::stream::read::Decoder::new(src)?.read_exact(&mut buf)?,
			_ => return Err(InvalidReplyError::Compression.into())
		}
		Ok(buf)
	}
}

impl std::str::FromStr for Compressor {
	type Err = ();

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(match s {
			"noop"   => Self::Noop,
			"snappy" => Self::Snappy,
			"zlib"   => Self::Zlib,
			"zstd"   => Self::Zstd,
			_ => return Err(())
		})
	}
}

impl Serialize for Compressor {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> where
		S: serde::Serializer {
		serializer.serialize_str(match self {
			Self::Noop   => "noop",
			Self::Snappy => "snappy",
			Self::Zlib   => "zlib",
			Self::Zstd   => "zstd"
		})
	}
}

impl<'de> Deserialize<'de> for Compressor {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error> where
		D: serde::Deserializer<'de> {
		Ok(String::deserialize(deserializer)?.parse().unwrap_or(Self::Noop))
	}
}

/// A single OP_MSG with one body section.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
	pub request_id:  i32,
	pub response_to: i32,
	pub flags:       u32,
	/// The encoded body document
	pub document:    Vec<u8>
}

impl Message {
	pub fn more_to_come(&self) -> bool {
		self.flags & FLAG_MORE_TO_COME != 0
	}
}

pub trait Wire: Read + Write {
	/// Sends an OP_MSG with the given request id, optionally compressed.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/message/OP_MSG.rst
	/// https://github.com/mongodb/specifications/blob/master/source/compression/OP_COMPRESSED.rst
	fn send(
		&mut self,
		request_id: i32,
		flags:      u32,
		compressor: Option<Compressor>,
		document:   &[u8]
	) -> Result<()> {
		let mut payload = Vec::with_capacity(5 + document.len());
		payload.extend_from_slice(&flags.to_le_bytes());
		payload.push(0);  // payload type
		payload.extend_from_slice(document);

		let buf = match compressor {
			None => {
				let mut buf = vec![0u8; HEADER_LEN];
				buf.extend_from_slice(&payload);
				Header {
					message_length: buf.len() as _,
					request_id,
					response_to:    0,
					op_code:        OpCode::Msg
				}.copy_to_slice(&mut buf[..HEADER_LEN]);
				buf
			}
			Some(compressor) => {
				let mut buf = vec![0u8; HEADER_LEN + COMPRESSION_HEADER_LEN];
				compressor.compress(&payload, &mut buf)?;

				Header {
					message_length: buf.len() as _,
					request_id,
					response_to:    0,
					op_code:        OpCode::Compressed
				}.copy_to_slice(&mut buf[..HEADER_LEN]);

				CompressionData {
					original_opcode:   OpCode::Msg,
					uncompressed_size: payload.len() as _,
					compressor_id:     compressor
				}.copy_to_slice(&mut buf[HEADER_LEN..HEADER_LEN + COMPRESSION_HEADER_LEN]);
				buf
			}
		};

		self.write_all(&buf)?;
		self.flush()?;
		Ok(())
	}

	/// Receives the next message. Matching `response_to` is left to the caller, since
	/// exhaust replies answer the previous reply rather than the request.
	fn recv(&mut self) -> Result<Message> {
		let mut header = Header::read(self)?;
		let length = header.message_length as usize;

		if length < HEADER_LEN + 5 || length > MAX_MESSAGE_SIZE_BYTES {
			return Err(InvalidReplyError::Length.into());
		}

		let mut buf = vec![0u8; length - HEADER_LEN];
		self.read_exact(&mut buf)?;

		if header.op_code == OpCode::Compressed {
			let data = CompressionData::copy_from_slice(&buf)?;
			header.op_code = data.original_opcode;
			buf = data.compressor_id.decompress(&buf[COMPRESSION_HEADER_LEN..], data.uncompressed_size as _)?;
		}

		if header.op_code != OpCode::Msg {
			return Err(InvalidReplyError::OpCode.into());
		} else if buf.len() < 5 {
			return Err(InvalidReplyError::Length.into());
		}

		let flags = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
		if buf[4] != 0 {
			return Err(InvalidReplyError::PayloadType.into());
		}

		let end = match flags & FLAG_CHECKSUM_PRESENT {
			0 => buf.len(),
			_ => buf.len().checked_sub(4).filter(|end| *end >= 5).ok_or(InvalidReplyError::Length)?
		};

		Ok(Message {
			request_id:  header.request_id,
			response_to: header.response_to,
			flags,
			document:    buf[5..end].to_vec()
		})
	}
}

impl<T: Read + Write + ?Sized> Wire for T {}

/// Encodes and decodes command documents. The document format itself is not part of this crate.
pub trait Codec: Send + Sync + fmt::Debug {
	fn encode_hello(&self, command: &HelloCommand) -> Result<Vec<u8>>;

	fn decode_hello(&self, document: &[u8]) -> Result<HelloReply>;

	/// Decodes the generic part of any reply, used to detect command errors.
	fn decode_reply(&self, document: &[u8]) -> Result<GenericReply>;
}

/// The `hello` command, or legacy `isMaster` before the server reported `helloOk`.
///
/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloCommand<'a> {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub hello:             Option<i32>,
	#[serde(rename = "isMaster", skip_serializing_if = "Option::is_none")]
	pub is_master:         Option<i32>,
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	pub hello_ok:          bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub client:            Option<ClientMetadata<'a>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub compression:       Option<&'a [Compressor]>,
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	pub load_balanced:     bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub topology_version:  Option<&'a TopologyVersion>,
	#[serde(rename = "maxAwaitTimeMS", skip_serializing_if = "Option::is_none")]
	pub max_await_time_ms: Option<u64>,
	#[serde(rename = "$db")]
	pub db:                &'a str
}

impl<'a> HelloCommand<'a> {
	pub fn new(legacy: bool) -> Self {
		Self {
			hello:             if legacy { None } else { Some(1) },
			is_master:         if legacy { Some(1) } else { None },
			hello_ok:          true,
			client:            None,
			compression:       None,
			load_balanced:     false,
			topology_version:  None,
			max_await_time_ms: None,
			db:                "admin"
		}
	}

	/// Makes this an awaitable hello that the server answers once its topology version changes.
	pub fn awaitable(mut self, topology_version: &'a TopologyVersion, max_await_time_ms: u64) -> Self {
		self.topology_version = Some(topology_version);
		self.max_await_time_ms = Some(max_await_time_ms);
		self
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetadata<'a> {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub application: Option<ApplicationMetadata<'a>>,
	pub driver:      DriverMetadata<'a>,
	pub os:          OsMetadata<'a>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub platform:    Option<&'a str>
}

impl<'a> ClientMetadata<'a> {
	pub fn new(app_name: Option<&'a str>) -> Self {
		Self {
			application: app_name.map(|name| ApplicationMetadata { name }),
			driver: DriverMetadata {
				name:    crate::DRIVER_NAME,
				version: env!("CARGO_PKG_VERSION")
			},
			os: OsMetadata {
				r#type:       std::env::consts::OS,
				architecture: Some(std::env::consts::ARCH)
			},
			platform: None
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplicationMetadata<'a> {
	pub name: &'a str
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverMetadata<'a> {
	pub name:    &'a str,
	pub version: &'a str
}

#[derive(Debug, Clone, Serialize)]
pub struct OsMetadata<'a> {
	#[serde(rename = "type")]
	pub r#type:       &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub architecture: Option<&'a str>
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HelloReply {
	#[serde(flatten)]
	pub generic:                         GenericReply,
	pub is_writable_primary:             Option<bool>,
	pub ismaster:                        Option<bool>,
	pub hello_ok:                        Option<bool>,
	pub max_bson_object_size:            Option<i32>,
	pub max_message_size_bytes:          Option<i32>,
	pub max_write_batch_size:            Option<i32>,
	pub logical_session_timeout_minutes: Option<i64>,
	pub connection_id:                   Option<i64>,
	pub min_wire_version:                i32,
	pub max_wire_version:                i32,
	pub read_only:                       Option<bool>,
	pub compression:                     Option<Vec<Compressor>>,
	pub sasl_supported_mechs:            Option<Vec<String>>,
	pub topology_version:                Option<TopologyVersion>,
	// load balanced
	pub service_id:                      Option<ServiceId>,
	// sharded instances
	pub msg:                             Option<String>,
	// replica sets
	pub set_name:                        Option<String>,
	pub set_version:                     Option<i32>,
	pub secondary:                       Option<bool>,
	pub hosts:                           Option<Vec<String>>,
	pub passives:                        Option<Vec<String>>,
	pub arbiters:                        Option<Vec<String>>,
	pub primary:                         Option<String>,
	pub arbiter_only:                    Option<bool>,
	pub passive:                         Option<bool>,
	pub hidden:                          Option<bool>,
	pub tags:                            Option<TagSet>,
	pub me:                              Option<String>,
	pub election_id:                     Option<ObjectId>,
	pub last_write:                      Option<LastWrite>,
	#[serde(rename = "isreplicaset")]
	pub is_replica_set:                  Option<bool>
}

impl HelloReply {
	pub fn is_primary(&self) -> bool {
		self.is_writable_primary.or(self.ismaster).unwrap_or(false)
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LastWrite {
	/// milliseconds since the unix epoch
	pub last_write_date: i64
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenericReply {
	pub ok:               f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub errmsg:           Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code:             Option<i32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code_name:        Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub topology_version: Option<TopologyVersion>
}

impl GenericReply {
	pub fn into_result(self) -> Result<()> {
		if self.ok == 1f64 {
			Ok(())
		} else {
			Err(Error::Command {
				code:             self.code.unwrap_or_default(),
				code_name:        self.code_name.unwrap_or_default(),
				message:          self.errmsg.unwrap_or_default(),
				topology_version: self.topology_version
			})
		}
	}
}
