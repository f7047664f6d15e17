//! A scripted transport for exercising exchanges without a network

use std::{collections::VecDeque, io, time::Duration};

use super::{Transport, TrustAnchor};

/// What the mock does on the next connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scripted {
    /// Accepts the connection and answers with these raw bytes
    Respond(Vec<u8>),
    /// Accepts the connection and never answers
    Stall,
    /// Refuses the connection
    Refuse,
    /// Gives up on the connection after the timeout
    TimeOut,
}

#[derive(Debug)]
struct Connection {
    response: Option<Vec<u8>>,
    pos: usize,
    request: Vec<u8>,
}

/// A transport that replays scripted responses and records requests
///
/// Each call to [`connect()`][Transport::connect] takes the next scripted
/// behavior. With nothing scripted, connections are refused.
#[derive(Debug)]
pub struct MockTransport {
    script: VecDeque<Scripted>,
    current: Option<Connection>,
    requests: Vec<Vec<u8>>,
    chunk_size: usize,
    network_ready: bool,
    connections: usize,
    reconnects: usize,
    timeout: Option<Duration>,
    trust: Option<TrustAnchor>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Constructs a mock with nothing scripted
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            current: None,
            requests: Vec::new(),
            chunk_size: usize::MAX,
            network_ready: true,
            connections: 0,
            reconnects: 0,
            timeout: None,
            trust: None,
        }
    }

    /// Queues a raw response
    pub fn respond_raw(&mut self, raw: impl Into<Vec<u8>>) -> &mut Self {
        self.script.push_back(Scripted::Respond(raw.into()));
        self
    }

    /// Queues an HTTP response with a JSON body and a `Content-Length`
    pub fn respond_json(&mut self, status: u16, body: &str) -> &mut Self {
        let reason = match status {
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Unknown",
        };
        let raw = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason,
            body.len(),
            body
        );
        self.respond_raw(raw)
    }

    /// Queues a connection that never answers
    pub fn stall(&mut self) -> &mut Self {
        self.script.push_back(Scripted::Stall);
        self
    }

    /// Queues a refused connection
    pub fn refuse(&mut self) -> &mut Self {
        self.script.push_back(Scripted::Refuse);
        self
    }

    /// Queues a connection attempt that times out
    pub fn time_out(&mut self) -> &mut Self {
        self.script.push_back(Scripted::TimeOut);
        self
    }

    /// Delivers responses at most `chunk_size` bytes at a time
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Marks the network link as up or down
    pub fn set_network_ready(&mut self, ready: bool) {
        self.network_ready = ready;
    }

    /// The requests written so far, one per completed connection
    pub fn requests(&self) -> &[Vec<u8>] {
        &self.requests
    }

    /// The most recent request as text
    pub fn last_request(&self) -> Option<String> {
        self.requests
            .last()
            .map(|r| String::from_utf8_lossy(r).into_owned())
    }

    /// The number of connection attempts
    pub fn connections(&self) -> usize {
        self.connections
    }

    /// The number of times a network reconnect was requested
    pub fn reconnects(&self) -> usize {
        self.reconnects
    }

    /// The number of scripted behaviors not yet used
    pub fn remaining(&self) -> usize {
        self.script.len()
    }

    /// The last timeout configured
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The last trust anchor configured
    pub fn trust(&self) -> Option<&TrustAnchor> {
        self.trust.as_ref()
    }

    fn remaining_response(&self) -> usize {
        match &self.current {
            Some(Connection {
                response: Some(data),
                pos,
                ..
            }) => data.len() - pos,
            _ => 0,
        }
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, _host: &str, _port: u16) -> io::Result<()> {
        self.stop();
        self.connections += 1;

        if !self.network_ready {
            return Err(io::ErrorKind::NotConnected.into());
        }

        let response = match self.script.pop_front() {
            Some(Scripted::Respond(data)) => Some(data),
            Some(Scripted::Stall) => None,
            Some(Scripted::Refuse) | None => return Err(io::ErrorKind::ConnectionRefused.into()),
            Some(Scripted::TimeOut) => return Err(io::ErrorKind::TimedOut.into()),
        };

        self.current = Some(Connection {
            response,
            pos: 0,
            request: Vec::new(),
        });
        Ok(())
    }

    fn connected(&self) -> bool {
        match &self.current {
            Some(Connection {
                response: Some(data),
                pos,
                request,
            }) => request.is_empty() || *pos < data.len(),
            Some(Connection { response: None, .. }) => true,
            None => false,
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.current {
            Some(conn) => {
                conn.request.extend_from_slice(buf);
                Ok(buf.len())
            }
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk_size = self.chunk_size;
        match &mut self.current {
            Some(Connection {
                response: Some(data),
                pos,
                ..
            }) => {
                let n = (data.len() - *pos).min(buf.len()).min(chunk_size);
                buf[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            Some(_) => Ok(0),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn available(&mut self) -> io::Result<usize> {
        Ok(self.remaining_response().min(self.chunk_size))
    }

    fn stop(&mut self) {
        if let Some(conn) = self.current.take() {
            if !conn.request.is_empty() {
                self.requests.push(conn.request);
            }
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    fn set_trust(&mut self, trust: &TrustAnchor) -> io::Result<()> {
        self.trust = Some(trust.clone());
        Ok(())
    }

    fn network_ready(&self) -> bool {
        self.network_ready
    }

    fn reconnect(&mut self) {
        self.reconnects += 1;
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;

    use super::*;

    #[test]
    fn replays_in_chunks_and_records_request() -> Result<()> {
        let mut transport = MockTransport::new().with_chunk_size(4);
        transport.respond_raw("HTTP/1.1 200 OK\r\n\r\n");

        transport.connect("example.com", 443)?;
        transport.write(b"GET / HTTP/1.1\r\n\r\n")?;

        let mut received = Vec::new();
        let mut buf = [0; 16];
        while transport.available()? > 0 {
            let n = transport.read(&mut buf)?;
            assert!(n <= 4);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"HTTP/1.1 200 OK\r\n\r\n");
        assert!(!transport.connected());

        transport.stop();
        assert_eq!(transport.last_request().as_deref(), Some("GET / HTTP/1.1\r\n\r\n"));
        Ok(())
    }

    #[test]
    fn unscripted_connections_are_refused() {
        let mut transport = MockTransport::new();
        let err = transport.connect("example.com", 443).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(transport.connections(), 1);
    }

    #[test]
    fn stalled_connection_stays_open() -> Result<()> {
        let mut transport = MockTransport::new();
        transport.stall();
        transport.connect("example.com", 443)?;
        transport.write(b"x")?;

        assert!(transport.connected());
        assert_eq!(transport.available()?, 0);
        Ok(())
    }
}
