//! The poll-driven token lifecycle
//!
//! A [`TokenManager`] owns everything needed to keep an access token fresh:
//! the configuration, the parsed credential, the current token and the
//! backoff state. It never runs on its own. The host calls
//! [`tick()`][TokenManager::tick()] from its main loop, and each tick either
//! does nothing or performs one complete refresh attempt.
//!
//! Hosts that defer work to a scheduler can split an attempt in two with
//! [`prepare_refresh()`][TokenManager::prepare_refresh()] and
//! [`complete_refresh()`][TokenManager::complete_refresh()]. Outcomes from
//! before an [`end()`][TokenManager::end()] or
//! [`begin()`][TokenManager::begin()] are discarded.

use std::{error::Error as StdError, fmt, time::Duration};

use sigil::Jwt;
use sigil_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{
    assertion::{AssertionBuilder, BuildError},
    backoff::{ErrorBackoffHandler, WithBackoff},
    config::SignerConfig,
    credentials::Credential,
    exchange::{ExchangeError, ExchangedToken, TokenExchange},
    status::{ErrorKind, TokenError, TokenInfo, TokenKind},
    storage::Storage,
    tokens::{IssuedToken, TokenLifetimeConfig, TokenState, TokenStatus},
    TokenUri,
};

/// A callback invoked whenever the manager's state or error changes
pub type StatusCallback = Box<dyn FnMut(&TokenInfo) + Send>;

/// One refresh attempt, ready to be run
#[derive(Debug)]
pub struct RefreshJob {
    generation: u64,
    issued: UnixTime,
    token_uri: TokenUri,
    assertion: Jwt,
}

impl RefreshJob {
    /// The time the job's assertion was signed
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Performs the exchange
    ///
    /// This blocks for as long as the exchange does.
    pub fn run<E: TokenExchange + ?Sized>(self, exchange: &mut E) -> RefreshOutcome {
        tracing::debug!(token_uri = %self.token_uri, "requesting new token");
        let result = exchange.exchange(&self.token_uri, &self.assertion);
        RefreshOutcome {
            generation: self.generation,
            issued: self.issued,
            result,
        }
    }
}

/// The result of a [`RefreshJob`]
#[derive(Debug)]
pub struct RefreshOutcome {
    generation: u64,
    issued: UnixTime,
    result: Result<ExchangedToken, ExchangeError>,
}

impl RefreshOutcome {
    /// The result of the exchange
    pub fn result(&self) -> &Result<ExchangedToken, ExchangeError> {
        &self.result
    }
}

/// Keeps a service-account access token fresh
///
/// Not internally synchronized. Hosts that share a manager between threads
/// must wrap it in a lock.
pub struct TokenManager<E, S, C = System> {
    exchange: E,
    storage: S,
    clock: C,
    config: Option<SignerConfig>,
    assertions: AssertionBuilder,
    backoff: ErrorBackoffHandler,
    credential: Option<Credential>,
    trust_applied: bool,
    token: Option<IssuedToken>,
    state: TokenState,
    error: Option<TokenError>,
    halted: bool,
    retry_at: Option<UnixTime>,
    force_refresh: bool,
    generation: u64,
    on_status: Option<StatusCallback>,
}

impl<E, S, C> fmt::Debug for TokenManager<E, S, C>
where
    E: fmt::Debug,
    S: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("exchange", &self.exchange)
            .field("storage", &self.storage)
            .field("clock", &self.clock)
            .field("config", &self.config)
            .field("credential", &self.credential)
            .field("token", &self.token)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("halted", &self.halted)
            .field("retry_at", &self.retry_at)
            .field("force_refresh", &self.force_refresh)
            .field("generation", &self.generation)
            .field("on_status", &self.on_status.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl<E, S, C> TokenManager<E, S, C>
where
    E: TokenExchange,
    S: Storage,
    C: Clock,
{
    /// Constructs an idle manager around its collaborators
    ///
    /// Nothing happens until [`begin()`][Self::begin()] is called.
    pub fn new(exchange: E, storage: S, clock: C) -> Self {
        Self {
            exchange,
            storage,
            clock,
            config: None,
            assertions: AssertionBuilder::default(),
            backoff: ErrorBackoffHandler::default(),
            credential: None,
            trust_applied: false,
            token: None,
            state: TokenState::Uninitialized,
            error: None,
            halted: false,
            retry_at: None,
            force_refresh: false,
            generation: 0,
            on_status: None,
        }
    }

    /// Registers a callback for state and error changes
    pub fn on_status(&mut self, callback: impl FnMut(&TokenInfo) + Send + 'static) {
        self.on_status = Some(Box::new(callback));
    }

    /// Starts managing tokens with the given configuration
    ///
    /// Any previous token, credential and error are dropped. The first
    /// refresh happens on the next tick.
    pub fn begin(&mut self, config: SignerConfig) {
        tracing::info!(credentials = ?config.credentials, "beginning token management");

        self.assertions = AssertionBuilder::from_lifetime_config(&config.lifetime)
            .with_scope(config.scopes.as_deref());
        self.backoff = ErrorBackoffHandler::new(config.backoff);
        self.config = Some(config);
        self.clear();
        self.transition(TokenState::Uninitialized, None);
    }

    /// Stops managing tokens
    ///
    /// The credential and token are dropped. An exchange already in flight
    /// on another task is discarded when it completes.
    pub fn end(&mut self) {
        tracing::info!("ending token management");
        self.config = None;
        self.clear();
        self.transition(TokenState::Uninitialized, None);
    }

    /// Starts over with the current configuration
    ///
    /// This is how a host recovers from a credential-fatal error after
    /// correcting the credential.
    pub fn reset(&mut self) {
        if let Some(config) = self.config.take() {
            self.begin(config);
        }
    }

    fn clear(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.credential = None;
        self.trust_applied = false;
        self.token = None;
        self.halted = false;
        self.retry_at = None;
        self.force_refresh = false;
        self.backoff.success();
    }

    /// Requests a refresh on the next tick, even if the token is fresh
    ///
    /// Any pending backoff is skipped.
    pub fn refresh_token(&mut self) {
        self.force_refresh = true;
    }

    /// Drives the lifecycle at the clock's current time
    ///
    /// Returns the state after the tick.
    pub fn tick(&mut self) -> TokenState {
        let now = self.clock.now();
        if let Some(job) = self.prepare_refresh(now) {
            let outcome = job.run(&mut self.exchange);
            let finished = self.clock.now();
            self.complete_refresh(outcome, finished);
        }
        self.state
    }

    /// Drives the lifecycle at the given time
    pub fn tick_at(&mut self, now: UnixTime) -> TokenState {
        if let Some(job) = self.prepare_refresh(now) {
            let outcome = job.run(&mut self.exchange);
            self.complete_refresh(outcome, now);
        }
        self.state
    }

    /// Decides whether a refresh is due, and if so prepares it
    ///
    /// On `Some`, the manager is in [`TokenState::Requesting`] until the
    /// outcome is passed to [`complete_refresh()`][Self::complete_refresh()].
    /// While requesting, no further jobs are prepared.
    pub fn prepare_refresh(&mut self, now: UnixTime) -> Option<RefreshJob> {
        if self.config.is_none() || self.halted || self.state == TokenState::Requesting {
            return None;
        }

        if let Some(token) = &self.token {
            if self.state == TokenState::Ready && now >= token.expiry() {
                tracing::info!(expiry = token.expiry().0, "access token expired");
                let error = self.error.clone();
                self.transition(TokenState::Expired, error);
            }
        }

        if !self.assertions_clock_is_set(now) {
            let floor = self.clock_floor();
            tracing::debug!(now = now.0, floor = floor.0, "waiting for clock to be set");
            let err = BuildError::ClockNotSet { now, floor };
            self.transition(self.state, Some(TokenError::from(&err)));
            return None;
        }

        if self.error.as_ref().map(|e| e.kind()) == Some(ErrorKind::ClockNotSet) {
            self.transition(self.state, None);
        }

        let forced = self.force_refresh;
        if !forced && !self.refresh_due(now) {
            return None;
        }

        if !forced {
            if let Some(retry_at) = self.retry_at {
                if now < retry_at {
                    tracing::trace!(
                        retry_at = retry_at.0,
                        remaining = retry_at.saturating_duration_since(now).0,
                        "backing off"
                    );
                    return None;
                }
            }
        }

        let credential = match self.credential.take() {
            Some(credential) => credential,
            None => match self.load_credential(now) {
                Some(credential) => credential,
                None => return None,
            },
        };

        if !self.trust_applied && !self.apply_trust(now) {
            self.credential = Some(credential);
            return None;
        }

        let assertion = match self.assertions.build(&credential, now) {
            Ok(assertion) => assertion,
            Err(err) => {
                self.credential = Some(credential);
                self.fail(TokenError::from(&err), &err, now);
                return None;
            }
        };

        let job = RefreshJob {
            generation: self.generation,
            issued: now,
            token_uri: credential.token_uri().to_owned(),
            assertion,
        };
        self.credential = Some(credential);
        self.force_refresh = false;
        self.retry_at = None;

        let error = self.error.clone();
        self.transition(TokenState::Requesting, error);
        Some(job)
    }

    /// Applies the outcome of a refresh job
    ///
    /// Outcomes of jobs prepared before the latest [`begin()`][Self::begin()]
    /// or [`end()`][Self::end()] are ignored.
    pub fn complete_refresh(&mut self, outcome: RefreshOutcome, now: UnixTime) {
        if outcome.generation != self.generation || self.state != TokenState::Requesting {
            tracing::debug!(
                job_generation = outcome.generation,
                generation = self.generation,
                "discarding outcome of abandoned refresh"
            );
            return;
        }

        match outcome.result.with_backoff(&mut self.backoff) {
            Ok(exchanged) => {
                let lifetime = exchanged
                    .expires_in
                    .unwrap_or_else(|| self.assertions_lifetime());
                let token = self.lifetime_config().create_token(
                    &exchanged.access_token,
                    exchanged.token_type,
                    lifetime,
                    outcome.issued,
                );

                tracing::info!(
                    lifetime = token.lifetime().0,
                    stale = token.stale().0,
                    expiry = token.expiry().0,
                    "received new access token"
                );

                let state = if now < token.expiry() {
                    TokenState::Ready
                } else {
                    tracing::warn!(
                        expiry = token.expiry().0,
                        now = now.0,
                        "access token expired before the exchange completed"
                    );
                    TokenState::Expired
                };

                self.token = Some(token);
                self.retry_at = None;
                self.transition(state, None);
            }
            Err((err, delay)) => {
                let token_error = TokenError::from(&err);
                if token_error.is_fatal() {
                    self.fail(token_error, &err, now);
                } else {
                    self.retry(token_error, &err, delay, outcome.issued.max(now), now);
                }
            }
        }
    }

    fn load_credential(&mut self, now: UnixTime) -> Option<Credential> {
        let config = self.config.as_ref()?;
        let source = config.credentials.clone();
        let max_len = config.max_file_len;
        match source.load(&mut self.storage, max_len) {
            Ok(credential) => {
                tracing::info!(
                    client_email = %credential.client_email(),
                    token_uri = %credential.token_uri(),
                    "loaded service account"
                );
                Some(credential)
            }
            Err(err) => {
                self.fail(TokenError::from(&err), &err, now);
                None
            }
        }
    }

    fn apply_trust(&mut self, now: UnixTime) -> bool {
        let (trust, max_len) = match &self.config {
            Some(config) => (config.trust.clone(), config.max_file_len),
            None => return false,
        };

        let applied = trust
            .resolve(&mut self.storage, max_len)
            .and_then(|anchor| self.exchange.set_trust(&anchor));

        match applied {
            Ok(()) => {
                self.trust_applied = true;
                true
            }
            Err(err) => {
                let delay = self.backoff.error();
                let token_error = TokenError::new(
                    ErrorKind::Io,
                    format!("unable to configure server trust: {}", err),
                );
                self.retry(token_error, &err, delay, now, now);
                false
            }
        }
    }

    fn fail(&mut self, token_error: TokenError, err: &(dyn StdError + 'static), now: UnixTime) {
        if token_error.is_fatal() {
            tracing::error!(
                error = err,
                code = token_error.code(),
                "unrecoverable token error, halting until reset"
            );
            self.halted = true;
            self.transition(TokenState::Error, Some(token_error));
        } else {
            let delay = self.backoff.error();
            self.retry(token_error, err, delay, now, now);
        }
    }

    fn retry(
        &mut self,
        token_error: TokenError,
        err: &(dyn StdError + 'static),
        delay: Duration,
        from: UnixTime,
        now: UnixTime,
    ) {
        let retry_at = from + ceil_secs(delay);
        tracing::warn!(
            error = err,
            code = token_error.code(),
            failures = self.backoff.failures(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "error requesting token, will retry"
        );
        self.retry_at = Some(retry_at);

        let usable = self.token.as_ref().map_or(false, |t| now < t.expiry());
        let state = if usable {
            TokenState::Ready
        } else {
            TokenState::Error
        };
        self.transition(state, Some(token_error));
    }

    fn transition(&mut self, state: TokenState, error: Option<TokenError>) {
        let state_changed = self.state != state;
        let error_changed = self.error != error;
        if !state_changed && !error_changed {
            return;
        }

        if state_changed {
            tracing::debug!(from = %self.state, to = %state, "token state changed");
        }

        self.state = state;
        self.error = error;

        if let Some(callback) = &mut self.on_status {
            let info = TokenInfo {
                kind: if self.config.is_some() {
                    TokenKind::AccessToken
                } else {
                    TokenKind::Undefined
                },
                state: self.state,
                error: self.error.clone(),
            };
            callback(&info);
        }
    }

    fn refresh_due(&self, now: UnixTime) -> bool {
        match &self.token {
            None => true,
            Some(token) => token.token_status_at(now) != TokenStatus::Fresh,
        }
    }

    fn lifetime_config(&self) -> TokenLifetimeConfig {
        self.config
            .as_ref()
            .map(|c| c.lifetime)
            .unwrap_or_default()
    }

    fn assertions_lifetime(&self) -> DurationSecs {
        self.lifetime_config().assertion_lifetime()
    }

    fn clock_floor(&self) -> UnixTime {
        self.lifetime_config().clock_floor()
    }

    fn assertions_clock_is_set(&self, now: UnixTime) -> bool {
        self.lifetime_config().clock_is_set(now)
    }
}

impl<E, S, C> TokenManager<E, S, C>
where
    C: Clock,
{
    /// The lifecycle state
    pub fn state(&self) -> TokenState {
        self.state
    }

    /// Whether a token is held and has not yet expired
    ///
    /// Pair this with [`access_token()`][Self::access_token()].
    pub fn token_ready(&self) -> bool {
        self.token_ready_at(self.clock.now())
    }

    /// Whether a token is held and will not have expired at `now`
    pub fn token_ready_at(&self, now: UnixTime) -> bool {
        self.state == TokenState::Ready && self.token.as_ref().map_or(false, |t| now < t.expiry())
    }

    /// The most recently issued access token, or an empty string
    ///
    /// The token is returned whatever the state; check
    /// [`token_ready()`][Self::token_ready()] before relying on it.
    pub fn access_token(&self) -> &str {
        self.token
            .as_ref()
            .map_or("", |t| t.access_token().as_str())
    }

    /// The expiry of the most recently issued token, or zero
    pub fn expired_timestamp(&self) -> UnixTime {
        self.token.as_ref().map_or(UnixTime(0), |t| t.expiry())
    }

    /// The most recently issued token with its lifetime details
    pub fn token(&self) -> Option<&IssuedToken> {
        self.token.as_ref()
    }

    /// The most recent failure, cleared on success
    pub fn last_error(&self) -> Option<&TokenError> {
        self.error.as_ref()
    }

    /// Consecutive failures since the last success
    pub fn failures(&self) -> u32 {
        self.backoff.failures()
    }

    /// The earliest time the next attempt will be made after a failure
    pub fn retry_at(&self) -> Option<UnixTime> {
        self.retry_at
    }

    /// A snapshot of the manager's status
    pub fn token_info(&self) -> TokenInfo {
        TokenInfo {
            kind: self.token_kind(),
            state: self.state,
            error: self.error.clone(),
        }
    }

    fn token_kind(&self) -> TokenKind {
        if self.config.is_some() {
            TokenKind::AccessToken
        } else {
            TokenKind::Undefined
        }
    }

    /// The kind of token being managed, as text
    pub fn token_type(&self) -> &'static str {
        self.token_kind().as_str()
    }

    /// The lifecycle state, as text
    pub fn token_status(&self) -> &'static str {
        self.state.as_str()
    }

    /// The most recent failure as `code: <n>, message: <text>`, or empty
    pub fn token_error(&self) -> String {
        self.token_info().error_string()
    }

    /// The exchange collaborator
    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    /// The exchange collaborator, mutably
    ///
    /// Hosts that defer refresh jobs run them against this.
    pub fn exchange_mut(&mut self) -> &mut E {
        &mut self.exchange
    }

    /// The storage collaborator
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// The storage collaborator, mutably
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// The clock
    pub fn clock(&self) -> &C {
        &self.clock
    }
}

fn ceil_secs(delay: Duration) -> DurationSecs {
    DurationSecs(delay.as_secs() + u64::from(delay.subsec_nanos() > 0))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io,
        sync::{Arc, Mutex},
    };

    use color_eyre::Result;
    use sigil::JwtRef;
    use sigil_clock::SharedTestClock;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        backoff::ErrorBackoffConfig, credentials::CredentialSource, storage::MemoryStorage,
        test::*, transport::TrustConfig, AccessToken, TokenUriRef,
    };

    #[derive(Debug, Default)]
    struct ScriptedExchange {
        responses: VecDeque<Result<ExchangedToken, ExchangeError>>,
        calls: usize,
    }

    impl ScriptedExchange {
        fn token(mut self, token: &'static str, expires_in: u64) -> Self {
            self.responses.push_back(Ok(ExchangedToken {
                access_token: AccessToken::from_static(token),
                token_type: "Bearer".into(),
                expires_in: Some(DurationSecs(expires_in)),
            }));
            self
        }

        fn fail(mut self, err: ExchangeError) -> Self {
            self.responses.push_back(Err(err));
            self
        }
    }

    impl TokenExchange for ScriptedExchange {
        fn exchange(
            &mut self,
            _token_uri: &TokenUriRef,
            _assertion: &JwtRef,
        ) -> Result<ExchangedToken, ExchangeError> {
            self.calls += 1;
            self.responses
                .pop_front()
                .unwrap_or(Err(ExchangeError::NetworkUnavailable(None)))
        }
    }

    fn config() -> SignerConfig {
        SignerConfig::new(CredentialSource::document(service_account_json()))
    }

    fn manager(
        exchange: ScriptedExchange,
        now: u64,
    ) -> (
        TokenManager<ScriptedExchange, MemoryStorage, SharedTestClock>,
        SharedTestClock,
    ) {
        let clock = SharedTestClock::new(UnixTime(now));
        let mut manager = TokenManager::new(exchange, MemoryStorage::new(), clock.clone());
        manager.begin(config());
        (manager, clock)
    }

    #[test]
    fn idle_until_begun() {
        let clock = SharedTestClock::new(UnixTime(5000));
        let mut manager =
            TokenManager::new(ScriptedExchange::default(), MemoryStorage::new(), clock);

        assert_eq!(manager.tick(), TokenState::Uninitialized);
        assert_eq!(manager.exchange().calls, 0);
        assert_eq!(manager.token_type(), "undefined");
        assert_eq!(manager.access_token(), "");
        assert_eq!(manager.expired_timestamp(), UnixTime(0));
    }

    #[test]
    fn first_tick_issues_token() {
        let (mut manager, _clock) =
            manager(ScriptedExchange::default().token("abc123", 3600), 1000);

        assert_eq!(manager.tick(), TokenState::Ready);
        assert!(manager.token_ready());
        assert_eq!(manager.access_token(), "abc123");
        assert_eq!(manager.expired_timestamp(), UnixTime(4600));
        assert_eq!(manager.token_type(), "OAuth2.0 access token");
        assert_eq!(manager.token_status(), "ready");
        assert_eq!(manager.token_error(), "");
    }

    #[test]
    fn clock_not_set_waits_without_backoff() {
        let (mut manager, clock) = manager(ScriptedExchange::default().token("abc123", 3600), 0);

        assert_eq!(manager.tick(), TokenState::Uninitialized);
        assert_eq!(manager.exchange().calls, 0);
        assert_eq!(manager.failures(), 0);
        assert_eq!(manager.last_error().map(|e| e.kind()), Some(ErrorKind::ClockNotSet));
        assert!(manager.token_error().starts_with("code: -30, message: "));

        clock.set(UnixTime(1_700_000_000));
        assert_eq!(manager.tick(), TokenState::Ready);
        assert_eq!(manager.last_error(), None);
    }

    #[test]
    fn ready_becomes_expired() {
        let (mut manager, clock) = manager(
            ScriptedExchange::default()
                .token("abc123", 3600)
                .fail(ExchangeError::Timeout),
            1000,
        );
        manager.tick();

        clock.set(UnixTime(4600));
        assert!(!manager.token_ready());
        assert_eq!(manager.tick(), TokenState::Error);
        assert_eq!(manager.access_token(), "abc123");
        assert!(!manager.token_ready());
    }

    #[test]
    fn forced_refresh_skips_freshness() {
        let (mut manager, _clock) = manager(
            ScriptedExchange::default()
                .token("first", 3600)
                .token("second", 3600),
            2000,
        );
        manager.tick();
        manager.tick();
        assert_eq!(manager.exchange().calls, 1);

        manager.refresh_token();
        manager.tick();
        assert_eq!(manager.exchange().calls, 2);
        assert_eq!(manager.access_token(), "second");
    }

    #[test]
    fn missing_expires_in_uses_assertion_lifetime() {
        let mut exchange = ScriptedExchange::default();
        exchange.responses.push_back(Ok(ExchangedToken {
            access_token: AccessToken::from_static("abc123"),
            token_type: "Bearer".into(),
            expires_in: None,
        }));
        let (mut manager, _clock) = manager(exchange, 1000);

        manager.tick();
        assert_eq!(manager.expired_timestamp(), UnixTime(4600));
    }

    #[test]
    fn transient_failure_keeps_valid_token() {
        let (mut manager, clock) = manager(
            ScriptedExchange::default()
                .token("abc123", 3600)
                .fail(ExchangeError::HttpStatus {
                    code: 503,
                    error: None,
                    error_description: None,
                }),
            1000,
        );
        manager.tick();

        clock.set(UnixTime(4400));
        assert_eq!(manager.tick(), TokenState::Ready);
        assert!(manager.token_ready());
        assert_eq!(manager.access_token(), "abc123");
        assert_eq!(manager.last_error().map(|e| e.code()), Some(503));
        assert_eq!(manager.retry_at(), Some(UnixTime(4403)));
    }

    #[test]
    fn invalid_endpoint_is_fatal() {
        let (mut manager, clock) = manager(
            ScriptedExchange::default().fail(ExchangeError::InvalidEndpoint("no host".into())),
            1000,
        );

        assert_eq!(manager.tick(), TokenState::Error);
        clock.inc(3600);
        manager.tick();
        assert_eq!(manager.exchange().calls, 1);
    }

    #[test]
    fn small_key_is_fatal_before_network() {
        let clock = SharedTestClock::new(UnixTime(1000));
        let mut manager =
            TokenManager::new(ScriptedExchange::default(), MemoryStorage::new(), clock);
        manager.begin(SignerConfig::new(CredentialSource::document(
            service_account_json_with_key(PRIVATE_KEY_480),
        )));

        assert_eq!(manager.tick(), TokenState::Error);
        assert_eq!(manager.last_error().map(|e| e.kind()), Some(ErrorKind::KeyTooSmall));
        assert_eq!(manager.exchange().calls, 0);
    }

    #[test]
    fn reset_recovers_from_fatal_error() -> Result<()> {
        let clock = SharedTestClock::new(UnixTime(1000));
        let mut manager = TokenManager::new(
            ScriptedExchange::default().token("abc123", 3600),
            MemoryStorage::new(),
            clock,
        );
        manager.begin(SignerConfig::new(CredentialSource::file(
            "service_account.json",
            Default::default(),
        )));

        assert_eq!(manager.tick(), TokenState::Error);
        assert_eq!(
            manager.last_error().map(|e| e.kind()),
            Some(ErrorKind::CredentialUnreadable)
        );
        assert_eq!(manager.tick(), TokenState::Error);

        manager.storage_mut().insert(
            Default::default(),
            "service_account.json",
            service_account_json(),
        );
        manager.reset();
        assert_eq!(manager.tick(), TokenState::Ready);
        Ok(())
    }

    #[test]
    fn oversized_credential_file_halts() {
        let clock = SharedTestClock::new(UnixTime(1000));
        let storage = MemoryStorage::new().with_file(
            Default::default(),
            "service_account.json",
            service_account_json(),
        );
        let mut manager =
            TokenManager::new(ScriptedExchange::default().token("abc123", 3600), storage, clock);
        manager.begin(
            SignerConfig::new(CredentialSource::file(
                "service_account.json",
                Default::default(),
            ))
            .with_max_file_len(256),
        );

        assert_eq!(manager.tick(), TokenState::Error);
        assert_eq!(
            manager.last_error().map(|e| e.kind()),
            Some(ErrorKind::CredentialUnreadable)
        );
        assert_eq!(manager.exchange().calls, 0);
    }

    #[test]
    fn deferred_outcome_after_end_is_discarded() {
        let (mut manager, _clock) =
            manager(ScriptedExchange::default().token("abc123", 3600), 1000);

        let job = manager.prepare_refresh(UnixTime(1000));
        assert!(job.is_some());
        assert_eq!(manager.state(), TokenState::Requesting);
        assert!(manager.prepare_refresh(UnixTime(1000)).is_none());

        manager.end();
        if let Some(job) = job {
            let outcome = job.run(manager.exchange_mut());
            manager.complete_refresh(outcome, UnixTime(1001));
        }

        assert_eq!(manager.state(), TokenState::Uninitialized);
        assert_eq!(manager.access_token(), "");
    }

    #[test]
    fn deferred_outcome_is_applied() {
        let (mut manager, _clock) =
            manager(ScriptedExchange::default().token("abc123", 3599), 1000);

        if let Some(job) = manager.prepare_refresh(UnixTime(1000)) {
            let outcome = job.run(manager.exchange_mut());
            assert!(outcome.result().is_ok());
            manager.complete_refresh(outcome, UnixTime(1002));
        }

        assert!(manager.token_ready_at(UnixTime(4598)));
        assert!(!manager.token_ready_at(UnixTime(4599)));
    }

    #[test]
    fn late_outcome_with_lapsed_expiry_is_expired() {
        let (mut manager, _clock) = manager(
            ScriptedExchange::default()
                .token("abc123", 60)
                .token("def456", 3600),
            1000,
        );

        if let Some(job) = manager.prepare_refresh(UnixTime(1000)) {
            let outcome = job.run(manager.exchange_mut());
            manager.complete_refresh(outcome, UnixTime(2000));
        }

        assert_eq!(manager.state(), TokenState::Expired);
        assert_eq!(manager.expired_timestamp(), UnixTime(1060));
        assert!(!manager.token_ready_at(UnixTime(2000)));
        assert_eq!(manager.last_error(), None);

        assert_eq!(manager.tick_at(UnixTime(2001)), TokenState::Ready);
        assert_eq!(manager.access_token(), "def456");
        assert_eq!(manager.expired_timestamp(), UnixTime(5601));
    }

    #[test]
    fn callback_sees_transitions_and_errors() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (mut manager, clock) = manager(ScriptedExchange::default().token("abc123", 3600), 0);
        {
            let seen = seen.clone();
            manager.on_status(move |info| {
                if let Ok(mut seen) = seen.lock() {
                    seen.push((info.state, info.error.as_ref().map(|e| e.code())));
                }
            });
        }

        manager.tick();
        manager.tick();
        clock.set(UnixTime(1000));
        manager.tick();

        let seen = seen.lock().map(|s| s.clone()).unwrap_or_default();
        assert_eq!(
            seen,
            vec![
                (TokenState::Uninitialized, Some(-30)),
                (TokenState::Uninitialized, None),
                (TokenState::Requesting, None),
                (TokenState::Ready, None),
            ]
        );
    }

    #[test]
    fn trust_is_applied_once() {
        #[derive(Debug, Default)]
        struct TrustRecorder {
            inner: ScriptedExchange,
            trust_calls: usize,
        }

        impl TokenExchange for TrustRecorder {
            fn exchange(
                &mut self,
                token_uri: &TokenUriRef,
                assertion: &JwtRef,
            ) -> Result<ExchangedToken, ExchangeError> {
                self.inner.exchange(token_uri, assertion)
            }

            fn set_trust(&mut self, _trust: &crate::transport::TrustAnchor) -> io::Result<()> {
                self.trust_calls += 1;
                Ok(())
            }
        }

        let clock = SharedTestClock::new(UnixTime(1000));
        let exchange = TrustRecorder {
            inner: ScriptedExchange::default()
                .token("first", 600)
                .token("second", 600),
            trust_calls: 0,
        };
        let mut manager = TokenManager::new(exchange, MemoryStorage::new(), clock.clone());
        manager.begin(config().with_trust(TrustConfig::Insecure));

        manager.tick();
        clock.inc(600);
        manager.tick();
        assert_eq!(manager.access_token(), "second");
        assert_eq!(manager.exchange().trust_calls, 1);
    }

    #[test]
    fn missing_ca_file_backs_off() {
        let (mut manager, _clock) =
            manager(ScriptedExchange::default().token("abc123", 3600), 1000);
        manager.begin(config().with_trust(TrustConfig::CaCertFile {
            path: "/ca.pem".into(),
            storage: Default::default(),
        }));

        assert_eq!(manager.tick(), TokenState::Error);
        assert_eq!(manager.last_error().map(|e| e.kind()), Some(ErrorKind::Io));
        assert_eq!(manager.failures(), 1);
        assert_eq!(manager.exchange().calls, 0);
    }

    #[test]
    fn custom_timing_is_honored() {
        let clock = SharedTestClock::new(UnixTime(10_000));
        let mut manager = TokenManager::new(
            ScriptedExchange::default()
                .fail(ExchangeError::Timeout)
                .token("abc123", 3600),
            MemoryStorage::new(),
            clock.clone(),
        );
        manager.begin(
            config()
                .with_lifetime(TokenLifetimeConfig::default().with_refresh_margin(DurationSecs(60)))
                .with_backoff(ErrorBackoffConfig::new(
                    Duration::from_secs(10),
                    Duration::from_secs(60),
                )),
        );

        assert_eq!(manager.tick(), TokenState::Error);
        assert_eq!(manager.retry_at(), Some(UnixTime(10_010)));

        clock.inc(9);
        manager.tick();
        assert_eq!(manager.exchange().calls, 1);

        clock.inc(1);
        assert_eq!(manager.tick(), TokenState::Ready);
        assert_eq!(manager.token().map(|t| t.stale()), Some(UnixTime(10_010 + 3540)));
    }

    #[test]
    #[traced_test]
    fn logs_never_contain_the_token() {
        let (mut manager, _clock) = manager(
            ScriptedExchange::default().token("ya29.secret-token-value", 3600),
            1000,
        );
        manager.tick();

        assert!(logs_contain("received new access token"));
        assert!(!logs_contain("ya29.secret-token-value"));
    }
}
