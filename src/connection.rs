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

use {
	crate::{
		common::{Error, Result, ConnectionSettings},
		description::{EndPoint, ConnectionId, ServiceId},
		stream::{Transport, StreamFactory, AbortHandle},
		wire::{Wire, Codec, Message, Compressor, HelloCommand, HelloReply, ClientMetadata, InvalidReplyError,
			FLAG_EXHAUST_ALLOWED},
		auth::{Authenticator, CredentialCache},
		utils::CancellationToken
	},
	std::{
		fmt,
		sync::{Arc, atomic::{AtomicI32, Ordering}},
		time::{Duration, Instant}
	}
};

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

fn next_request_id() -> i32 {
	NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// What the server told us about itself during the handshake.
#[derive(Debug, Clone)]
pub struct ConnectionDescription {
	pub connection_id: ConnectionId,
	pub hello:         HelloReply,
	pub compressor:    Option<Compressor>,
	pub service_id:    Option<ServiceId>
}

impl ConnectionDescription {
	pub fn max_wire_version(&self) -> i32 {
		self.hello.max_wire_version
	}
}

/// A single connection to a server. It is opened with `open`, which performs the handshake and
/// authenticates. Any I/O error marks the connection as perished, it must not be reused afterwards.
#[derive(Debug)]
pub struct Connection {
	id:          ConnectionId,
	transport:   Box<dyn Transport>,
	codec:       Arc<dyn Codec>,
	settings:    Arc<ConnectionSettings>,
	description: Option<ConnectionDescription>,
	compressor:  Option<Compressor>,
	/// the request id of the last reply while the server is streaming replies
	streaming:   Option<i32>,
	created:     Instant,
	perished:    bool
}

impl Connection {
	pub fn new(
		id:        ConnectionId,
		transport: Box<dyn Transport>,
		codec:     Arc<dyn Codec>,
		settings:  Arc<ConnectionSettings>
	) -> Self {
		Self {
			id,
			transport,
			codec,
			settings,
			description: None,
			compressor:  None,
			streaming:   None,
			created:     Instant::now(),
			perished:    false
		}
	}

	/// Performs the handshake and authenticates. Compression is only enabled afterwards,
	/// since neither the handshake nor the authentication conversation may be compressed.
	///
	/// see https://github.com/mongodb/specifications/blob/master/source/mongodb-handshake/handshake.rst
	pub fn open(&mut self, authenticator: Option<&dyn Authenticator>, credentials: &CredentialCache) -> Result<()> {
		if self.description.is_some() {
			return Err(Error::InvalidOperation("the connection is already open"));
		}

		let settings = self.settings.clone();
		let compressors = settings.compressors.iter()
			.copied()
			.filter(|c| c.is_supported())
			.collect::<Vec<_>>();

		let command = HelloCommand {
			client:        Some(ClientMetadata::new(settings.app_name.as_deref())),
			compression:   if compressors.is_empty() { None } else { Some(compressors.as_slice()) },
			load_balanced: settings.load_balanced,
			..HelloCommand::new(!settings.load_balanced)
		};

		let hello = self.hello(&command)?;

		if settings.load_balanced && hello.service_id.is_none() {
			return Err(Error::IncompatibleDriver(
				"Driver attempted to initialize in load balancing mode, but the server does not support this mode.".to_string()));
		}

		self.id.server = hello.connection_id;
		let compressor = Compressor::negotiate(&compressors, hello.compression.as_deref().unwrap_or(&[]));
		self.description = Some(ConnectionDescription {
			connection_id: self.id.clone(),
			service_id:    hello.service_id,
			compressor,
			hello
		});

		if let Some(authenticator) = authenticator {
			authenticator.authenticate(self, credentials)?;
		}

		self.compressor = compressor;
		tracing::trace!(connection = %self.id, ?compressor, "connection opened");
		Ok(())
	}

	/// Sends a command and returns the raw reply document. Error replies are turned into
	/// `Error::Command` without perishing the connection.
	pub fn command(&mut self, document: &[u8]) -> Result<Vec<u8>> {
		let compressor = self.compressor;
		let message = self.round_trip(0, compressor, document)?;
		self.codec.decode_reply(&message.document)?.into_result()?;
		Ok(message.document)
	}

	/// Sends a `hello` command. An awaitable hello allows the server to stream further replies,
	/// which are read with `receive_hello`.
	pub fn hello(&mut self, command: &HelloCommand) -> Result<HelloReply> {
		let document = self.codec.encode_hello(command)?;
		let flags = match command.max_await_time_ms {
			Some(_) => FLAG_EXHAUST_ALLOWED,
			None    => 0
		};

		let message = self.round_trip(flags, None, &document)?;
		self.decode_hello(&message)
	}

	/// Reads the next streamed `hello` reply.
	pub fn receive_hello(&mut self) -> Result<HelloReply> {
		let response_to = self.streaming
			.ok_or(Error::InvalidOperation("the server is not streaming replies"))?;
		let message = self.receive(response_to)?;
		self.decode_hello(&message)
	}

	/// Whether the server announced further replies with the `moreToCome` flag.
	pub fn is_streaming(&self) -> bool {
		self.streaming.is_some()
	}

	pub fn id(&self) -> &ConnectionId {
		&self.id
	}

	pub fn endpoint(&self) -> &EndPoint {
		&self.id.server_id.endpoint
	}

	pub fn description(&self) -> Option<&ConnectionDescription> {
		self.description.as_ref()
	}

	pub fn service_id(&self) -> Option<ServiceId> {
		self.description.as_ref().and_then(|d| d.service_id)
	}

	pub fn created(&self) -> Instant {
		self.created
	}

	pub fn is_perished(&self) -> bool {
		self.perished
	}

	pub fn mark_perished(&mut self) {
		self.perished = true;
	}

	pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
		self.transport.set_read_timeout(timeout)
	}

	/// A handle that shuts the underlying socket down, interrupting a blocked read.
	pub fn abort_handle(&self) -> AbortHandle {
		self.transport.abort_handle()
	}

	fn round_trip(&mut self, flags: u32, compressor: Option<Compressor>, document: &[u8]) -> Result<Message> {
		if self.perished {
			return Err(Error::InvalidOperation("the connection has perished"));
		}

		let request_id = next_request_id();
		if let Err(e) = self.transport.send(request_id, flags, compressor, document) {
			self.perished = true;
			return Err(e);
		}

		self.receive(request_id)
	}

	fn receive(&mut self, response_to: i32) -> Result<Message> {
		let result = self.transport.recv().and_then(|message| match message.response_to == response_to {
			true  => Ok(message),
			false => Err(InvalidReplyError::ResponseTo.into())
		});

		match result {
			Ok(message) => {
				self.streaming = match message.more_to_come() {
					true  => Some(message.request_id),
					false => None
				};
				Ok(message)
			}
			Err(e) => {
				self.perished = true;
				self.streaming = None;
				Err(e)
			}
		}
	}

	fn decode_hello(&self, message: &Message) -> Result<HelloReply> {
		let reply = self.codec.decode_hello(&message.document)?;
		reply.generic.clone().into_result()?;
		Ok(reply)
	}
}

/// Opens connections to a server.
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
	/// Opens and authenticates a connection. The token aborts the attempt at any stage.
	fn open(&self, id: ConnectionId, cancel: &CancellationToken) -> Result<Connection>;
}

#[derive(Debug, Clone)]
pub struct BinaryConnectionFactory {
	streams:       Arc<dyn StreamFactory>,
	codec:         Arc<dyn Codec>,
	settings:      Arc<ConnectionSettings>,
	authenticator: Option<Arc<dyn Authenticator>>,
	credentials:   Arc<CredentialCache>
}

impl BinaryConnectionFactory {
	pub fn new(streams: Arc<dyn StreamFactory>, codec: Arc<dyn Codec>, settings: ConnectionSettings) -> Self {
		Self {
			streams,
			codec,
			settings:      Arc::new(settings),
			authenticator: None,
			credentials:   Arc::new(CredentialCache::default())
		}
	}

	pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>, credentials: Arc<CredentialCache>) -> Self {
		self.authenticator = Some(authenticator);
		self.credentials = credentials;
		self
	}

	/// The same factory without authentication and compression, used for monitoring connections.
	pub fn for_monitoring(&self) -> Self {
		Self {
			authenticator: None,
			settings:      Arc::new(ConnectionSettings {
				compressors: Vec::new(),
				..(*self.settings).clone()
			}),
			..self.clone()
		}
	}

	pub fn settings(&self) -> &ConnectionSettings {
		&self.settings
	}
}

impl ConnectionFactory for BinaryConnectionFactory {
	fn open(&self, id: ConnectionId, cancel: &CancellationToken) -> Result<Connection> {
		cancel.check()?;
		let transport = self.streams.create_stream(&id.server_id.endpoint, cancel)?;
		let abort = transport.abort_handle();
		let _registration = cancel.register(move || abort.abort());

		let mut connection = Connection::new(id, transport, self.codec.clone(), self.settings.clone());
		match connection.open(self.authenticator.as_deref(), &self.credentials) {
			Ok(()) => Ok(connection),
			Err(_) if cancel.is_cancelled() => Err(Error::Cancelled),
			Err(e) => Err(e)
		}
	}
}
