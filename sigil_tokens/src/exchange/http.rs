use std::{
    io,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use sigil::JwtRef;
use url::Url;

use super::{dto, ExchangeError, ExchangedToken, TokenExchange, JWT_BEARER_GRANT_TYPE};
use crate::{
    transport::{Transport, TrustAnchor},
    TokenUriRef,
};

/// Timing and size limits for an exchange
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    #[serde(with = "millis")]
    timeout: Duration,
    #[serde(with = "millis")]
    poll_interval: Duration,
    max_response_len: usize,
}

impl Default for ExchangeConfig {
    /// Default exchange limits
    ///
    /// Waits up to 10 seconds for a response, polling every 10 milliseconds,
    /// and rejects responses larger than 16 KiB.
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            max_response_len: 16 * 1024,
        }
    }
}

impl ExchangeConfig {
    /// Sets how long to wait for the connection and the response
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets how long to pause between checks for response data
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the largest response accepted, headers included
    pub fn with_max_response_len(mut self, max_response_len: usize) -> Self {
        self.max_response_len = max_response_len;
        self
    }

    /// How long to wait for the connection and the response
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// How long to pause between checks for response data
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// The largest response accepted, headers included
    #[must_use]
    pub fn max_response_len(&self) -> usize {
        self.max_response_len
    }
}

/// Exchanges assertions over HTTP/1.1 on a [`Transport`]
///
/// Each exchange opens a fresh connection and closes it afterwards.
#[derive(Debug)]
pub struct HttpTokenExchange<T> {
    transport: T,
    config: ExchangeConfig,
}

impl<T: Transport> HttpTokenExchange<T> {
    /// Constructs an exchange with default limits
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ExchangeConfig::default())
    }

    /// Constructs an exchange with the given limits
    pub fn with_config(transport: T, config: ExchangeConfig) -> Self {
        Self { transport, config }
    }

    /// The exchange limits
    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Releases the underlying transport
    pub fn into_inner(self) -> T {
        self.transport
    }

    fn round_trip(
        &mut self,
        endpoint: &Endpoint,
        assertion: &JwtRef,
    ) -> Result<RawResponse, ExchangeError> {
        let request = endpoint.request(assertion);
        write_all(&mut self.transport, request.as_bytes())?;
        tracing::trace!(len = request.len(), "sent token request");

        let deadline = Instant::now() + self.config.timeout;
        let mut response = Vec::new();
        let mut buf = [0; 512];

        loop {
            if self.transport.available()? > 0 {
                let n = self.transport.read(&mut buf)?;
                response.extend_from_slice(&buf[..n]);
                if response.len() > self.config.max_response_len {
                    return Err(ExchangeError::malformed("response too large"));
                }
                if let Some(parsed) = RawResponse::parse(&response, false)? {
                    return Ok(parsed);
                }
                continue;
            }

            if !self.transport.connected() {
                return match RawResponse::parse(&response, true)? {
                    Some(parsed) => Ok(parsed),
                    None => Err(ExchangeError::malformed(
                        "connection closed before response was complete",
                    )),
                };
            }

            if Instant::now() >= deadline {
                tracing::debug!(received = response.len(), "token response timed out");
                return Err(ExchangeError::Timeout);
            }

            std::thread::sleep(self.config.poll_interval);
        }
    }
}

impl<T: Transport> TokenExchange for HttpTokenExchange<T> {
    #[tracing::instrument(
        skip(self, assertion),
        fields(
            host = tracing::field::Empty,
            path = tracing::field::Empty,
        ),
    )]
    fn exchange(
        &mut self,
        token_uri: &TokenUriRef,
        assertion: &JwtRef,
    ) -> Result<ExchangedToken, ExchangeError> {
        let endpoint = Endpoint::parse(token_uri)?;
        let span = tracing::Span::current();
        span.record("host", endpoint.host.as_str());
        span.record("path", endpoint.path.as_str());

        if !self.transport.network_ready() {
            tracing::debug!("network is down, requesting reconnect");
            self.transport.reconnect();
            return Err(ExchangeError::NetworkUnavailable(None));
        }

        self.transport.set_timeout(self.config.timeout);
        self.transport
            .connect(&endpoint.host, endpoint.port)
            .map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ExchangeError::Timeout,
                _ => ExchangeError::NetworkUnavailable(Some(e)),
            })?;

        let result = self.round_trip(&endpoint, assertion);
        self.transport.stop();

        let raw = result?;
        tracing::debug!(
            response.status = raw.status,
            response.len = raw.body.len(),
            "received token response from issuing authority"
        );
        raw.into_token()
    }

    fn set_trust(&mut self, trust: &TrustAnchor) -> io::Result<()> {
        self.transport.set_trust(trust)
    }
}

fn write_all<T: Transport + ?Sized>(transport: &mut T, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match transport.write(data)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => data = &data[n..],
        }
    }
    Ok(())
}

#[derive(Debug)]
struct Endpoint {
    host: String,
    port: u16,
    path: String,
}

impl Endpoint {
    fn parse(token_uri: &TokenUriRef) -> Result<Self, ExchangeError> {
        let url = Url::parse(token_uri.as_str())
            .map_err(|e| ExchangeError::InvalidEndpoint(e.to_string()))?;

        if url.scheme() != "https" {
            return Err(ExchangeError::InvalidEndpoint(format!(
                "scheme `{}` is not https",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| ExchangeError::InvalidEndpoint("no host".into()))?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(443);

        let mut path = url.path().to_owned();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        Ok(Self { host, port, path })
    }

    fn request(&self, assertion: &JwtRef) -> String {
        // Assertions are base64url segments joined by `.`, none of which need
        // form encoding.
        let body = format!(
            "grant_type={}&assertion={}",
            JWT_BEARER_GRANT_TYPE,
            assertion.as_str()
        );

        let host = if self.port == 443 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        };

        format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nAccept: application/json\r\nConnection: close\r\n\r\n{}",
            self.path,
            host,
            body.len(),
            body
        )
    }
}

#[derive(Debug)]
struct RawResponse {
    status: u16,
    body: Vec<u8>,
}

impl RawResponse {
    /// Parses a response if it is complete
    ///
    /// Without a `Content-Length`, the response is only complete once the
    /// connection has closed.
    fn parse(data: &[u8], closed: bool) -> Result<Option<Self>, ExchangeError> {
        let header_end = match find(data, b"\r\n\r\n") {
            Some(idx) => idx,
            None => return Ok(None),
        };

        let head = std::str::from_utf8(&data[..header_end])
            .map_err(|_| ExchangeError::malformed("response headers are not text"))?;
        let mut lines = head.split("\r\n");

        let status = lines
            .next()
            .and_then(parse_status_line)
            .ok_or_else(|| ExchangeError::malformed("invalid status line"))?;

        let mut content_length = None;
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ExchangeError::malformed("invalid header line"))?;
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| ExchangeError::malformed("invalid content length"))?,
                );
            } else if name.eq_ignore_ascii_case("transfer-encoding")
                && !value.eq_ignore_ascii_case("identity")
            {
                return Err(ExchangeError::malformed(format!(
                    "unsupported transfer encoding `{}`",
                    value
                )));
            }
        }

        let body = &data[header_end + 4..];
        match content_length {
            Some(len) if body.len() >= len => Ok(Some(Self {
                status,
                body: body[..len].to_vec(),
            })),
            Some(_) => Ok(None),
            None if closed => Ok(Some(Self {
                status,
                body: body.to_vec(),
            })),
            None => Ok(None),
        }
    }

    fn into_token(self) -> Result<ExchangedToken, ExchangeError> {
        if self.status != 200 {
            let detail: dto::ErrorResponse =
                serde_json::from_slice(&self.body).unwrap_or_default();
            return Err(ExchangeError::HttpStatus {
                code: self.status,
                error: detail.error,
                error_description: detail.error_description,
            });
        }

        let resp: dto::TokenResponse = serde_json::from_slice(&self.body)
            .map_err(|e| ExchangeError::malformed(e.to_string()))?;

        if resp.access_token.as_str().is_empty() {
            return Err(ExchangeError::malformed("empty access_token"));
        }
        if resp.expires_in.map_or(false, |e| e.0 == 0) {
            return Err(ExchangeError::malformed("expires_in must be positive"));
        }

        Ok(ExchangedToken {
            access_token: resp.access_token.to_owned(),
            token_type: resp
                .token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Bearer".to_owned()),
            expires_in: resp.expires_in,
        })
    }
}

fn parse_status_line(line: &str) -> Option<u16> {
    let mut parts = line.splitn(3, ' ');
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use sigil::Jwt;
    use sigil_clock::DurationSecs;

    use super::*;
    use crate::{transport::mock::MockTransport, TokenUri};

    const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

    fn assertion() -> Jwt {
        Jwt::from_static("eyJhbGciOiJSUzI1NiJ9.e30.c2lnbmF0dXJl")
    }

    fn fast() -> ExchangeConfig {
        ExchangeConfig::default()
            .with_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(1))
    }

    fn exchange_with(transport: MockTransport) -> HttpTokenExchange<MockTransport> {
        HttpTokenExchange::with_config(transport, fast())
    }

    #[test]
    fn sends_form_encoded_jwt_bearer_grant() -> Result<()> {
        let mut transport = MockTransport::new();
        transport.respond_json(
            200,
            r#"{"access_token":"abc123","expires_in":3600,"token_type":"Bearer"}"#,
        );
        let mut exchange = exchange_with(transport);

        let token = exchange.exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())?;
        assert_eq!(token.access_token.as_str(), "abc123");
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.expires_in, Some(DurationSecs(3600)));

        let request = exchange.transport().last_request().unwrap_or_default();
        let body = "grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer&assertion=eyJhbGciOiJSUzI1NiJ9.e30.c2lnbmF0dXJl";
        assert!(request.starts_with("POST /token HTTP/1.1\r\n"));
        assert!(request.contains("Host: oauth2.googleapis.com\r\n"));
        assert!(request.contains("Content-Type: application/x-www-form-urlencoded\r\n"));
        assert!(request.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(request.ends_with(&format!("\r\n\r\n{}", body)));
        Ok(())
    }

    #[test]
    fn reassembles_chunked_delivery() -> Result<()> {
        let mut transport = MockTransport::new().with_chunk_size(7);
        transport.respond_json(200, r#"{"access_token":"abc123","expires_in":3599}"#);
        let mut exchange = exchange_with(transport);

        let token = exchange.exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())?;
        assert_eq!(token.expires_in, Some(DurationSecs(3599)));
        assert_eq!(token.token_type, "Bearer");
        Ok(())
    }

    #[test]
    fn body_without_length_is_read_to_close() -> Result<()> {
        let mut transport = MockTransport::new();
        transport
            .respond_raw("HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n{\"access_token\":\"t\"}");
        let mut exchange = exchange_with(transport);

        let token = exchange.exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())?;
        assert_eq!(token.access_token.as_str(), "t");
        assert_eq!(token.expires_in, None);
        Ok(())
    }

    #[test]
    fn error_body_is_surfaced() {
        let mut transport = MockTransport::new();
        transport.respond_json(
            400,
            r#"{"error":"invalid_grant","error_description":"Invalid JWT Signature."}"#,
        );
        let mut exchange = exchange_with(transport);

        let err = exchange
            .exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())
            .unwrap_err();
        match err {
            ExchangeError::HttpStatus {
                code,
                error,
                error_description,
            } => {
                assert_eq!(code, 400);
                assert_eq!(error.as_deref(), Some("invalid_grant"));
                assert_eq!(error_description.as_deref(), Some("Invalid JWT Signature."));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn non_json_error_body_still_reports_status() {
        let mut transport = MockTransport::new();
        transport.respond_raw("HTTP/1.1 502 Bad Gateway\r\nContent-Length: 5\r\n\r\noops!");
        let mut exchange = exchange_with(transport);

        let err = exchange
            .exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::HttpStatus {
                code: 502,
                error: None,
                error_description: None
            }
        ));
    }

    #[test]
    fn missing_access_token_is_malformed() {
        let mut transport = MockTransport::new();
        transport.respond_json(200, r#"{"expires_in":3600}"#);
        let mut exchange = exchange_with(transport);

        let err = exchange
            .exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::MalformedResponse(_)));
    }

    #[test]
    fn zero_lifetime_is_malformed() {
        let mut transport = MockTransport::new();
        transport.respond_json(200, r#"{"access_token":"abc123","expires_in":0}"#);
        let mut exchange = exchange_with(transport);

        let err = exchange
            .exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::MalformedResponse(_)));
    }

    #[test]
    fn chunked_encoding_is_rejected() {
        let mut transport = MockTransport::new();
        transport.respond_raw(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        );
        let mut exchange = exchange_with(transport);

        let err = exchange
            .exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::MalformedResponse(_)));
    }

    #[test]
    fn stalled_response_times_out_and_closes() {
        let mut transport = MockTransport::new();
        transport.stall();
        let mut exchange = exchange_with(transport);

        let err = exchange
            .exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Timeout));
        assert!(!exchange.transport().connected());
        assert_eq!(exchange.transport().requests().len(), 1);
    }

    #[test]
    fn refused_connection_is_network_unavailable() {
        let mut transport = MockTransport::new();
        transport.refuse();
        let mut exchange = exchange_with(transport);

        let err = exchange
            .exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NetworkUnavailable(Some(_))));
    }

    #[test]
    fn connect_timeout_is_timeout() {
        let mut transport = MockTransport::new();
        transport.time_out();
        let mut exchange = exchange_with(transport);

        let err = exchange
            .exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Timeout));
        assert!(!exchange.transport().connected());
    }

    #[test]
    fn network_down_requests_reconnect() {
        let mut transport = MockTransport::new();
        transport.set_network_ready(false);
        let mut exchange = exchange_with(transport);

        let err = exchange
            .exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::NetworkUnavailable(None)));
        assert_eq!(exchange.transport().reconnects(), 1);
        assert_eq!(exchange.transport().connections(), 0);
    }

    #[test]
    fn oversized_response_is_malformed() {
        let mut transport = MockTransport::new();
        transport.respond_json(200, &format!(r#"{{"access_token":"{}"}}"#, "a".repeat(64)));
        let mut exchange =
            HttpTokenExchange::with_config(transport, fast().with_max_response_len(32));

        let err = exchange
            .exchange(TokenUriRef::from_str(TOKEN_URI), &assertion())
            .unwrap_err();
        assert!(matches!(err, ExchangeError::MalformedResponse(_)));
    }

    #[test]
    fn plain_http_endpoint_is_rejected() {
        let mut exchange = exchange_with(MockTransport::new());
        let uri = TokenUri::from_static("http://localhost:8080/token");

        let err = exchange.exchange(&uri, &assertion()).unwrap_err();
        assert!(matches!(err, ExchangeError::InvalidEndpoint(_)));
        assert_eq!(exchange.transport().connections(), 0);
    }

    #[test]
    fn non_default_port_and_query_are_kept() -> Result<()> {
        let endpoint = Endpoint::parse(TokenUriRef::from_str(
            "https://auth.example.com:8443/oauth/token?tenant=fleet",
        ))?;
        assert_eq!(endpoint.host, "auth.example.com");
        assert_eq!(endpoint.port, 8443);
        assert_eq!(endpoint.path, "/oauth/token?tenant=fleet");
        assert!(endpoint
            .request(&assertion())
            .contains("Host: auth.example.com:8443\r\n"));
        Ok(())
    }
}
