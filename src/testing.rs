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

//! Fakes shared by the unit tests.

use {
	crate::{
		common::{Error, Result, ConnectionSettings, ServerMonitorSettings},
		description::{EndPoint, ServerId, ServerDescription},
		stream::{Transport, StreamFactory, AbortHandle},
		wire::{Wire, Codec, HelloCommand, HelloReply, GenericReply, MAX_WIRE_VERSION},
		connection::{ConnectionFactory, BinaryConnectionFactory},
		monitor::{ServerMonitor, ServerMonitorFactory, DescriptionListener},
		apm::{ClusterEvent, EventSubscriber, EventDispatcher},
		utils::CancellationToken
	},
	std::{
		io::{self, Read, Write, Cursor},
		sync::{Arc, Mutex, atomic::{AtomicBool, AtomicUsize, Ordering}},
		collections::HashMap,
		time::Duration
	}
};

/// Encodes commands as JSON.
#[derive(Debug, Default)]
pub(crate) struct JsonCodec;

impl Codec for JsonCodec {
	fn encode_hello(&self, command: &HelloCommand) -> Result<Vec<u8>> {
		serde_json::to_vec(command).map_err(|e| Error::Codec(e.to_string()))
	}

	fn decode_hello(&self, document: &[u8]) -> Result<HelloReply> {
		serde_json::from_slice(document).map_err(|e| Error::Codec(e.to_string()))
	}

	fn decode_reply(&self, document: &[u8]) -> Result<GenericReply> {
		serde_json::from_slice(document).map_err(|e| Error::Codec(e.to_string()))
	}
}

/// A successful hello reply of a standalone server.
pub(crate) fn hello_reply() -> HelloReply {
	HelloReply {
		generic:             GenericReply { ok: 1.0, ..GenericReply::default() },
		is_writable_primary: Some(true),
		min_wire_version:    0,
		max_wire_version:    MAX_WIRE_VERSION,
		..HelloReply::default()
	}
}

pub(crate) fn is_hello(request: &[u8]) -> bool {
	request.starts_with(b"{\"hello\"") || request.starts_with(b"{\"isMaster\"")
}

type Handler = Box<dyn FnMut(&[u8]) -> Vec<(u32, Vec<u8>)> + Send>;

/// A transport that answers every request through a handler. Each reply is a pair of
/// flags and document; consecutive replies are chained like exhaust replies. Once all
/// replies have been read, reads report the end of the stream.
pub(crate) struct FakeTransport {
	handler:  Handler,
	written:  Vec<u8>,
	pending:  Vec<u8>,
	requests: Arc<Mutex<Vec<Vec<u8>>>>,
	aborted:  Arc<AtomicBool>,
	next_id:  i32
}

impl std::fmt::Debug for FakeTransport {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("FakeTransport")
			.field("pending", &self.pending.len())
			.finish()
	}
}

impl FakeTransport {
	pub(crate) fn new(handler: impl FnMut(&[u8]) -> Vec<(u32, Vec<u8>)> + Send + 'static) -> Self {
		Self {
			handler:  Box::new(handler),
			written:  Vec::new(),
			pending:  Vec::new(),
			requests: Arc::default(),
			aborted:  Arc::default(),
			next_id:  1_000_000
		}
	}

	/// The documents of all requests sent so far.
	pub(crate) fn requests(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
		self.requests.clone()
	}

	fn dispatch(&mut self) -> io::Result<()> {
		if self.written.is_empty() {
			return Ok(());
		}

		let invalid = |e: Error| io::Error::new(io::ErrorKind::InvalidData, e.to_string());
		let request = Cursor::new(std::mem::take(&mut self.written)).recv().map_err(invalid)?;
		self.requests.lock().unwrap().push(request.document.clone());

		let mut response_to = request.request_id;
		for (flags, document) in (self.handler)(&request.document) {
			let mut frame = Cursor::new(Vec::new());
			frame.send(self.next_id, flags, None, &document).map_err(invalid)?;
			let mut frame = frame.into_inner();
			frame[8..12].copy_from_slice(&response_to.to_le_bytes());
			response_to = self.next_id;
			self.next_id += 1;
			self.pending.extend_from_slice(&frame);
		}
		Ok(())
	}
}

impl Read for FakeTransport {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		if self.aborted.load(Ordering::SeqCst) {
			return Err(io::ErrorKind::ConnectionAborted.into());
		}

		let n = buf.len().min(self.pending.len());
		buf[..n].copy_from_slice(&self.pending[..n]);
		self.pending.drain(..n);
		Ok(n)
	}
}

impl Write for FakeTransport {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		if self.aborted.load(Ordering::SeqCst) {
			return Err(io::ErrorKind::ConnectionAborted.into());
		}

		self.written.extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		self.dispatch()
	}
}

impl Transport for FakeTransport {
	fn set_read_timeout(&mut self, _: Option<Duration>) -> Result<()> {
		Ok(())
	}

	fn abort_handle(&self) -> AbortHandle {
		let aborted = self.aborted.clone();
		AbortHandle::new(move || aborted.store(true, Ordering::SeqCst))
	}
}

/// Creates `FakeTransport`s that answer hellos with a configurable reply and every other
/// command with `{ ok: 1 }`. While failing, new connections are refused and existing ones
/// stop answering.
#[derive(Debug, Default)]
pub(crate) struct FakeStreamFactory {
	pub(crate) hello:    Mutex<HelloReply>,
	pub(crate) delay:    Mutex<Duration>,
	pub(crate) requests: Arc<Mutex<Vec<Vec<u8>>>>,
	fail:                Arc<AtomicBool>,
	opened:              AtomicUsize
}

impl FakeStreamFactory {
	pub(crate) fn healthy() -> Self {
		Self { hello: Mutex::new(hello_reply()), ..Self::default() }
	}

	pub(crate) fn set_failing(&self, fail: bool) {
		self.fail.store(fail, Ordering::SeqCst);
	}

	pub(crate) fn opened(&self) -> usize {
		self.opened.load(Ordering::SeqCst)
	}

	/// Number of requests containing `pattern`.
	pub(crate) fn count_requests(&self, pattern: &str) -> usize {
		self.requests.lock().unwrap().iter()
			.filter(|request| String::from_utf8_lossy(request).contains(pattern))
			.count()
	}
}

impl StreamFactory for FakeStreamFactory {
	fn create_stream(&self, endpoint: &EndPoint, cancel: &CancellationToken) -> Result<Box<dyn Transport>> {
		cancel.check()?;
		let delay = *self.delay.lock().unwrap();
		if delay > Duration::from_millis(0) && cancel.sleep(delay) {
			return Err(Error::Cancelled);
		}

		if self.fail.load(Ordering::SeqCst) {
			return Err(Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, endpoint.to_string())));
		}

		self.opened.fetch_add(1, Ordering::SeqCst);
		let hello = serde_json::to_vec(&*self.hello.lock().unwrap()).unwrap();
		let fail = self.fail.clone();
		let mut transport = FakeTransport::new(move |request| match (fail.load(Ordering::SeqCst), is_hello(request)) {
			(true, _)     => Vec::new(),
			(false, true) => vec![(0, hello.clone())],
			(false, _)    => vec![(0, br#"{"ok":1}"#.to_vec())]
		});
		transport.requests = self.requests.clone();
		Ok(Box::new(transport))
	}
}

/// A connection factory on top of a `FakeStreamFactory`.
pub(crate) fn connection_factory(streams: Arc<FakeStreamFactory>) -> Arc<dyn ConnectionFactory> {
	Arc::new(BinaryConnectionFactory::new(streams, Arc::new(JsonCodec), ConnectionSettings::default()))
}

/// Records the names of all events.
#[derive(Debug, Default)]
pub(crate) struct EventRecorder(Mutex<Vec<&'static str>>);

impl EventRecorder {
	pub(crate) fn names(&self) -> Vec<&'static str> {
		self.0.lock().unwrap().clone()
	}

	pub(crate) fn count(&self, name: &str) -> usize {
		self.0.lock().unwrap().iter().filter(|n| **n == name).count()
	}
}

impl EventSubscriber for EventRecorder {
	fn handle(&self, event: &ClusterEvent) {
		self.0.lock().unwrap().push(event.name());
	}
}

pub(crate) fn recording_dispatcher() -> (EventDispatcher, Arc<EventRecorder>) {
	let recorder = Arc::new(EventRecorder::default());
	(EventDispatcher::new(vec![recorder.clone()]), recorder)
}

/// A monitor that never connects. Descriptions are published by the test.
#[derive(Debug)]
pub(crate) struct ManualMonitor {
	listener:    Mutex<Option<Arc<dyn DescriptionListener>>>,
	description: Mutex<Arc<ServerDescription>>,
	pub(crate) heartbeats:  AtomicUsize,
	pub(crate) invalidated: AtomicUsize,
	pub(crate) shut_down:   AtomicBool
}

impl ManualMonitor {
	pub(crate) fn publish(&self, description: ServerDescription) {
		let description = Arc::new(description);
		let old = std::mem::replace(&mut *self.description.lock().unwrap(), description.clone());
		let listener = self.listener.lock().unwrap().clone();
		if let Some(listener) = listener {
			listener.on_description(&old, description);
		}
	}
}

impl ServerMonitor for ManualMonitor {
	fn initialize(&self, listener: Arc<dyn DescriptionListener>) -> Result<()> {
		*self.listener.lock().unwrap() = Some(listener);
		Ok(())
	}

	fn description(&self) -> Arc<ServerDescription> {
		self.description.lock().unwrap().clone()
	}

	fn request_heartbeat(&self) {
		self.heartbeats.fetch_add(1, Ordering::SeqCst);
	}

	fn cancel_current_check(&self) {}

	fn invalidate(&self, reason: &'static str, error: Option<Arc<Error>>) {
		self.invalidated.fetch_add(1, Ordering::SeqCst);
		let description = self.description().unknown(reason, error);
		self.publish(description);
	}

	fn shutdown(&self) {
		self.shut_down.store(true, Ordering::SeqCst);
		*self.listener.lock().unwrap() = None;
	}
}

/// Hands out `ManualMonitor`s and keeps them for the test to drive.
#[derive(Debug, Default)]
pub(crate) struct ManualMonitorFactory {
	monitors: Mutex<HashMap<EndPoint, Arc<ManualMonitor>>>,
	settings: ServerMonitorSettings
}

impl ManualMonitorFactory {
	pub(crate) fn get(&self, endpoint: &EndPoint) -> Arc<ManualMonitor> {
		self.monitors.lock().unwrap()[endpoint].clone()
	}

	pub(crate) fn try_get(&self, endpoint: &EndPoint) -> Option<Arc<ManualMonitor>> {
		self.monitors.lock().unwrap().get(endpoint).cloned()
	}
}

impl ServerMonitorFactory for ManualMonitorFactory {
	fn create(&self, server_id: ServerId) -> Arc<dyn ServerMonitor> {
		let monitor = Arc::new(ManualMonitor {
			description: Mutex::new(Arc::new(ServerDescription::new(server_id.clone()))),
			listener:    Mutex::new(None),
			heartbeats:  AtomicUsize::new(0),
			invalidated: AtomicUsize::new(0),
			shut_down:   AtomicBool::new(false)
		});
		self.monitors.lock().unwrap().insert(server_id.endpoint, monitor.clone());
		monitor
	}

	fn settings(&self) -> &ServerMonitorSettings {
		&self.settings
	}
}
