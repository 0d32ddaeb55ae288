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

#[cfg(feature = "tls")]
use {crate::common::TlsSettings, rustls::Session};
use {
	crate::{
		common::{Error, Result, TcpStreamSettings, Socks5ProxySettings},
		description::EndPoint,
		utils::CancellationToken
	},
	std::{
		fmt,
		io::{self, Read, Write},
		net::{TcpStream, ToSocketAddrs, Shutdown, IpAddr},
		sync::Arc,
		time::Duration
	}
};

/// Interrupts blocking I/O on a transport from another thread.
#[derive(Clone)]
pub struct AbortHandle(Arc<dyn Fn() + Send + Sync>);

impl AbortHandle {
	pub fn new(abort: impl Fn() + Send + Sync + 'static) -> Self {
		Self(Arc::new(abort))
	}

	pub fn noop() -> Self {
		Self::new(|| ())
	}

	pub fn abort(&self) {
		(self.0)()
	}

	fn shutdown(stream: &TcpStream) -> Self {
		match stream.try_clone() {
			Ok(stream) => Self::new(move || { let _ = stream.shutdown(Shutdown::Both); }),
			Err(_) => Self::noop()
		}
	}
}

impl fmt::Debug for AbortHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("AbortHandle")
	}
}

/// A connected byte stream.
pub trait Transport: Read + Write + Send + fmt::Debug {
	fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;

	fn abort_handle(&self) -> AbortHandle;
}

/// Opens transports to servers.
pub trait StreamFactory: Send + Sync + fmt::Debug {
	fn create_stream(&self, endpoint: &EndPoint, cancel: &CancellationToken) -> Result<Box<dyn Transport>>;
}

#[allow(clippy::large_enum_variant)]
pub enum Stream {
	Tcp(TcpStream),
	#[cfg(feature = "tls")]
	Tls(Box<rustls::StreamOwned<rustls::ClientSession, TcpStream>>)
}

impl fmt::Debug for Stream {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			Self::Tcp(..) => "Stream::Tcp(...)",
			#[cfg(feature = "tls")]
			Self::Tls(..) => "Stream::Tls(...)"
		})
	}
}

impl Stream {
	fn socket(&self) -> &TcpStream {
		match self {
			Self::Tcp(stream) => stream,
			#[cfg(feature = "tls")]
			Self::Tls(stream) => &stream.sock
		}
	}
}

impl Read for Stream {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match self {
			Self::Tcp(stream) => stream.read(buf),
			#[cfg(feature = "tls")]
			Self::Tls(stream) => stream.read(buf)
		}
	}
}

impl Write for Stream {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self {
			Self::Tcp(stream) => stream.write(buf),
			#[cfg(feature = "tls")]
			Self::Tls(stream) => stream.write(buf)
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self {
			Self::Tcp(stream) => stream.flush(),
			#[cfg(feature = "tls")]
			Self::Tls(stream) => stream.flush()
		}
	}
}

impl Transport for Stream {
	fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
		// a zero timeout is rejected by the OS
		let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
		self.socket().set_read_timeout(timeout)?;
		Ok(())
	}

	fn abort_handle(&self) -> AbortHandle {
		AbortHandle::shutdown(self.socket())
	}
}

/// Opens TCP connections, optionally through a SOCKS5 proxy and wrapped in TLS.
#[derive(Debug, Clone, Default)]
pub struct TcpStreamFactory {
	settings: TcpStreamSettings,
	#[cfg(feature = "tls")]
	tls:      Option<TlsSettings>
}

impl TcpStreamFactory {
	pub fn new(settings: TcpStreamSettings) -> Self {
		Self {
			settings,
			#[cfg(feature = "tls")]
			tls: None
		}
	}

	#[cfg(feature = "tls")]
	pub fn with_tls(mut self, tls: TlsSettings) -> Self {
		self.tls = Some(tls);
		self
	}

	fn connect(&self, endpoint: &EndPoint, cancel: &CancellationToken) -> Result<TcpStream> {
		let target = self.settings.proxy.as_ref().map_or(endpoint, |proxy| &proxy.endpoint);
		let addrs = (target.host(), target.port()).to_socket_addrs()
			.map_err(|e| Error::Dns(format!("failed to resolve {}: {}", target, e)))?;

		let mut last_error = None;
		for addr in addrs {
			cancel.check()?;
			match TcpStream::connect_timeout(&addr, self.settings.connect_timeout) {
				Ok(stream) => {
					stream.set_nodelay(self.settings.no_delay)?;
					stream.set_read_timeout(self.settings.read_timeout)?;
					stream.set_write_timeout(self.settings.write_timeout)?;
					return Ok(stream);
				}
				Err(e) if e.kind() == io::ErrorKind::TimedOut => last_error = Some(Error::ConnectTimeout(target.clone())),
				Err(e) => last_error = Some(e.into())
			}
		}

		Err(last_error.unwrap_or_else(|| Error::Dns(format!("no addresses found for {}", target))))
	}

	#[cfg(feature = "tls")]
	fn wrap_tls(&self, tls: &TlsSettings, endpoint: &EndPoint, stream: TcpStream) -> Result<Stream> {
		let name = tls.server_name.as_deref().unwrap_or_else(|| endpoint.host());
		let session = rustls::ClientSession::new(&tls.config, webpki::DNSNameRef::try_from_ascii_str(name)?);
		let mut stream = rustls::StreamOwned::new(session, stream);

		// complete the handshake eagerly so certificate errors surface while opening
		while stream.sess.is_handshaking() {
			stream.sess.complete_io(&mut stream.sock)?;
		}

		Ok(Stream::Tls(Box::new(stream)))
	}
}

impl StreamFactory for TcpStreamFactory {
	fn create_stream(&self, endpoint: &EndPoint, cancel: &CancellationToken) -> Result<Box<dyn Transport>> {
		let mut stream = self.connect(endpoint, cancel)?;
		let abort = AbortHandle::shutdown(&stream);
		let _registration = cancel.register(move || abort.abort());

		let result = (|| -> Result<Stream> {
			if let Some(proxy) = &self.settings.proxy {
				socks5_handshake(&mut stream, endpoint, proxy)?;
			}

			#[cfg(feature = "tls")]
			{
				if let Some(tls) = &self.tls {
					return self.wrap_tls(tls, endpoint, stream);
				}
			}

			Ok(Stream::Tcp(stream))
		})();

		match result {
			Err(_) if cancel.is_cancelled() => Err(Error::Cancelled),
			Err(e) => Err(e),
			Ok(stream) => {
				tracing::trace!(%endpoint, ?stream, "stream opened");
				Ok(Box::new(stream))
			}
		}
	}
}

const SOCKS_VERSION:       u8 = 5;
const SOCKS_NO_AUTH:       u8 = 0;
const SOCKS_USER_PASS:     u8 = 2;
const SOCKS_NO_ACCEPTABLE: u8 = 0xFF;
const SOCKS_CONNECT:       u8 = 1;
const SOCKS_ATYP_IPV4:     u8 = 1;
const SOCKS_ATYP_DOMAIN:   u8 = 3;
const SOCKS_ATYP_IPV6:     u8 = 4;

/// Asks the proxy to connect to `endpoint`.
///
/// see https://tools.ietf.org/html/rfc1928 and https://tools.ietf.org/html/rfc1929
fn socks5_handshake<S: Read + Write>(stream: &mut S, endpoint: &EndPoint, proxy: &Socks5ProxySettings) -> Result<()> {
	let credentials = match (&proxy.username, &proxy.password) {
		(Some(username), Some(password)) => Some((username.as_bytes(), password.as_bytes())),
		_ => None
	};

	// greeting

	match credentials {
		Some(_) => stream.write_all(&[SOCKS_VERSION, 2, SOCKS_NO_AUTH, SOCKS_USER_PASS])?,
		None    => stream.write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH])?
	}

	let mut reply = [0u8; 2];
	stream.read_exact(&mut reply)?;
	if reply[0] != SOCKS_VERSION {
		return Err(Error::Proxy(format!("unexpected protocol version {}", reply[0])));
	}

	match (reply[1], credentials) {
		(SOCKS_NO_AUTH, _) => (),
		(SOCKS_USER_PASS, Some((username, password))) => {
			if username.len() > 255 || password.len() > 255 {
				return Err(Error::Proxy("username and password must not exceed 255 bytes".to_string()));
			}

			let mut buf = Vec::with_capacity(3 + username.len() + password.len());
			buf.push(1);
			buf.push(username.len() as u8);
			buf.extend_from_slice(username);
			buf.push(password.len() as u8);
			buf.extend_from_slice(password);
			stream.write_all(&buf)?;

			stream.read_exact(&mut reply)?;
			if reply[1] != 0 {
				return Err(Error::Proxy("authentication failed".to_string()));
			}
		}
		(SOCKS_NO_ACCEPTABLE, _) => return Err(Error::Proxy("no acceptable authentication method".to_string())),
		(method, _) => return Err(Error::Proxy(format!("unsupported authentication method {}", method)))
	}

	// connect

	let mut buf = vec![SOCKS_VERSION, SOCKS_CONNECT, 0];
	match endpoint.host().parse::<IpAddr>() {
		Ok(IpAddr::V4(ip)) => {
			buf.push(SOCKS_ATYP_IPV4);
			buf.extend_from_slice(&ip.octets());
		}
		Ok(IpAddr::V6(ip)) => {
			buf.push(SOCKS_ATYP_IPV6);
			buf.extend_from_slice(&ip.octets());
		}
		Err(_) if endpoint.host().len() <= 255 => {
			buf.push(SOCKS_ATYP_DOMAIN);
			buf.push(endpoint.host().len() as u8);
			buf.extend_from_slice(endpoint.host().as_bytes());
		}
		Err(_) => return Err(Error::Proxy(format!("host name too long: {}", endpoint.host())))
	}
	buf.extend_from_slice(&endpoint.port().to_be_bytes());
	stream.write_all(&buf)?;
	stream.flush()?;

	let mut reply = [0u8; 4];
	stream.read_exact(&mut reply)?;
	if reply[1] != 0 {
		return Err(Error::Proxy(match reply[1] {
			1 => "general SOCKS server failure".to_string(),
			2 => "connection not allowed by ruleset".to_string(),
			3 => "network unreachable".to_string(),
			4 => "host unreachable".to_string(),
			5 => "connection refused".to_string(),
			6 => "TTL expired".to_string(),
			7 => "command not supported".to_string(),
			8 => "address type not supported".to_string(),
			code => format!("unknown error {}", code)
		}));
	}

	// skip the bound address
	let len = match reply[3] {
		SOCKS_ATYP_IPV4 => 4,
		SOCKS_ATYP_IPV6 => 16,
		SOCKS_ATYP_DOMAIN => {
			let mut len = [0u8; 1];
			stream.read_exact(&mut len)?;
			len[0] as usize
		}
		atyp => return Err(Error::Proxy(format!("invalid address type {}", atyp)))
	};
	let mut bound = vec![0u8; len + 2];
	stream.read_exact(&mut bound)?;
	Ok(())
}
