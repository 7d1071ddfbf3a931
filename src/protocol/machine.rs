//! Handshake state machine.
//!
//! One sans-IO machine per connection, in one of two roles over a shared
//! validation core. The caller feeds decoded frames to [`Handshake::advance`]
//! and writes whatever it returns; deadlines are exposed through
//! [`Handshake::deadline`] for the driver to enforce.
//!
//! ```text
//! server:  WaitHello ──hello──► SentMirror ──bind──► SentSeal ──enter_flow──► Flowing
//! client:  Idle ──start──► SentHello ──mirror──► SentBind ──seal──► Flowing
//!
//!          any pre-Flow state ──error / timeout / abort──► Rejected
//! ```
//!
//! | State      | Role   | Expects | Deadline         |
//! |------------|--------|---------|------------------|
//! | WaitHello  | server | hello   | `timeouts.hello` |
//! | SentMirror | server | bind    | `timeouts.bind`  |
//! | SentSeal   | server | -       | `timeouts.seal`  |
//! | Idle       | client | -       | none             |
//! | SentHello  | client | mirror  | `timeouts.mirror`|
//! | SentBind   | client | seal    | `timeouts.seal`  |
//! | Flowing    | both   | -       | none             |
//!
//! The server's nonce lease lives inside the state, so any transition to
//! Rejected, or dropping the machine, releases it before the call returns.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::frame::{Bind, Feature, Frame, Hello, Mirror, Step, ThreadId};
use super::identity::{BindError, IdentityProvider};
use super::negotiate::{check_mirror, ServerSupport};
use super::replay::{NonceLease, ReplayGuard};
use super::session::{EstablishedSession, Role};
use super::trust::{TrustError, TrustSealer, TrustVerifier, TRUST_FEATURE};
use crate::error::{ErrorCode, LhsError, Result};

/// Slack added to the Bind deadline when reserving a nonce.
pub const RESERVE_GRACE: Duration = Duration::from_secs(5);

/// Per-step deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTimeouts {
    /// Server waiting for Hello
    pub hello: Duration,
    /// Client waiting for Mirror
    pub mirror: Duration,
    /// Server waiting for Bind
    pub bind: Duration,
    /// Client waiting for Seal; server finishing the Seal write
    pub seal: Duration,
}

impl Default for HandshakeTimeouts {
    fn default() -> Self {
        let step = Duration::from_secs(10);
        Self {
            hello: step,
            mirror: step,
            bind: step,
            seal: step,
        }
    }
}

impl HandshakeTimeouts {
    /// Same deadline for every step
    pub fn uniform(step: Duration) -> Self {
        Self {
            hello: step,
            mirror: step,
            bind: step,
            seal: step,
        }
    }
}

/// Everything a server-side machine needs; shared across connections.
pub struct ServerContext {
    support: ServerSupport,
    sealer: TrustSealer,
    identity: Arc<dyn IdentityProvider>,
    replay: ReplayGuard,
    seal_ttl: Duration,
}

impl ServerContext {
    /// Default Seal lifetime
    pub const DEFAULT_SEAL_TTL: Duration = Duration::from_secs(300);

    /// Create a context
    pub fn new(
        support: ServerSupport,
        sealer: TrustSealer,
        identity: Arc<dyn IdentityProvider>,
        replay: ReplayGuard,
    ) -> Self {
        Self {
            support,
            sealer,
            identity,
            replay,
            seal_ttl: Self::DEFAULT_SEAL_TTL,
        }
    }

    /// Set the Seal lifetime
    pub fn with_seal_ttl(mut self, ttl: Duration) -> Self {
        self.seal_ttl = ttl;
        self
    }

    /// Support table
    pub fn support(&self) -> &ServerSupport {
        &self.support
    }

    /// Sealer
    pub fn sealer(&self) -> &TrustSealer {
        &self.sealer
    }

    /// Nonce guard
    pub fn replay(&self) -> &ReplayGuard {
        &self.replay
    }

    /// Seal lifetime
    pub fn seal_ttl(&self) -> Duration {
        self.seal_ttl
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("support", &self.support)
            .field("sealer", &self.sealer)
            .field("identity", &self.identity.name())
            .field("replay", &self.replay)
            .field("seal_ttl", &self.seal_ttl)
            .finish()
    }
}

/// Observable machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Server awaiting Hello
    WaitHello,
    /// Server sent Mirror, awaiting Bind
    SentMirror,
    /// Server produced Seal, awaiting delivery
    SentSeal,
    /// Client not started
    Idle,
    /// Client sent Hello, awaiting Mirror
    SentHello,
    /// Client sent Bind, awaiting Seal
    SentBind,
    /// Handshake complete
    Flowing,
    /// Terminal failure
    Rejected,
}

enum State {
    WaitHello,
    SentMirror {
        hello: Hello,
        mirror: Mirror,
        lease: NonceLease,
    },
    SentSeal(EstablishedSession),
    Idle,
    SentHello,
    SentBind {
        mirror: Mirror,
    },
    Flowing(EstablishedSession),
    Rejected(ErrorCode),
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            Self::WaitHello => Phase::WaitHello,
            Self::SentMirror { .. } => Phase::SentMirror,
            Self::SentSeal(_) => Phase::SentSeal,
            Self::Idle => Phase::Idle,
            Self::SentHello => Phase::SentHello,
            Self::SentBind { .. } => Phase::SentBind,
            Self::Flowing(_) => Phase::Flowing,
            Self::Rejected(_) => Phase::Rejected,
        }
    }
}

enum RoleContext {
    Server(Arc<ServerContext>),
    Client {
        hello: Hello,
        bind: Bind,
        verifier: Arc<TrustVerifier>,
    },
}

/// A terminal failure and whether the peer should be told.
#[derive(Debug)]
pub struct Rejection {
    /// What went wrong
    pub error: LhsError,
    /// False when the peer caused it with its own error frame, or the
    /// transport is already gone
    pub notify_peer: bool,
}

/// Outcome of feeding one frame to the machine.
#[derive(Debug)]
pub enum Advance {
    /// Send this frame next
    Reply(Frame),
    /// Client reached Flow
    Established(EstablishedSession),
    /// Terminal failure
    Rejected(Rejection),
}

/// Per-connection handshake state machine.
pub struct Handshake {
    ctx: RoleContext,
    state: State,
    timeouts: HandshakeTimeouts,
    deadline: Option<Instant>,
    steps: Vec<Step>,
    frame_limit: u64,
    mirror_seen: bool,
}

impl Handshake {
    /// Server machine, waiting for Hello from now.
    pub fn server(ctx: Arc<ServerContext>, timeouts: HandshakeTimeouts) -> Self {
        let frame_limit = ctx.support.max_frame_cap;
        Self {
            ctx: RoleContext::Server(ctx),
            state: State::WaitHello,
            timeouts,
            deadline: Some(Instant::now() + timeouts.hello),
            steps: Vec::with_capacity(4),
            frame_limit,
            mirror_seen: false,
        }
    }

    /// Client machine; call [`Handshake::start`] to get the Hello.
    pub fn client(
        hello: Hello,
        bind: Bind,
        verifier: Arc<TrustVerifier>,
        timeouts: HandshakeTimeouts,
    ) -> Self {
        let frame_limit = hello.max_frame_bytes;
        Self {
            ctx: RoleContext::Client {
                hello,
                bind,
                verifier,
            },
            state: State::Idle,
            timeouts,
            deadline: None,
            steps: Vec::with_capacity(4),
            frame_limit,
            mirror_seen: false,
        }
    }

    /// Role of this machine
    pub fn role(&self) -> Role {
        match self.ctx {
            RoleContext::Server(_) => Role::Server,
            RoleContext::Client { .. } => Role::Client,
        }
    }

    /// Client: the Bind this machine will send once a Mirror is accepted.
    /// The upgrade binding sends it up front.
    pub fn bind_frame(&self) -> Option<Frame> {
        match &self.ctx {
            RoleContext::Client { bind, .. } => Some(Frame::Bind(bind.clone())),
            RoleContext::Server(_) => None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Step the machine accepts next, if any.
    pub fn expected_step(&self) -> Option<Step> {
        match self.state {
            State::WaitHello => Some(Step::Hello),
            State::SentMirror { .. } => Some(Step::Bind),
            State::SentHello => Some(Step::Mirror),
            State::SentBind { .. } => Some(Step::Seal),
            State::SentSeal(_) | State::Idle | State::Flowing(_) | State::Rejected(_) => None,
        }
    }

    /// Deadline for the current state
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Frame size limit for the next incoming frame
    pub fn frame_limit(&self) -> u64 {
        self.frame_limit
    }

    /// True once a Mirror has been sent or received
    pub fn has_mirror(&self) -> bool {
        self.mirror_seen
    }

    /// Steps sent and received so far, in order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// True in Flowing or Rejected
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Flowing(_) | State::Rejected(_))
    }

    /// Code of the terminal failure, if rejected
    pub fn rejected_code(&self) -> Option<ErrorCode> {
        match self.state {
            State::Rejected(code) => Some(code),
            _ => None,
        }
    }

    /// Established session; `NotEstablished` before Flow.
    pub fn ensure_flow(&self) -> Result<&EstablishedSession> {
        match &self.state {
            State::Flowing(session) => Ok(session),
            _ => Err(LhsError::NotEstablished),
        }
    }

    /// Client: emit the Hello and start waiting for Mirror.
    pub fn start(&mut self) -> Result<Frame> {
        let hello = match (&self.ctx, &self.state) {
            (RoleContext::Client { hello, .. }, State::Idle) => hello.clone(),
            (_, State::Rejected(_)) => return Err(LhsError::Terminated),
            _ => {
                return Err(LhsError::OutOfOrder {
                    expected: self.expected_step(),
                    got: Step::Hello,
                })
            },
        };

        self.state = State::SentHello;
        self.deadline = Some(Instant::now() + self.timeouts.mirror);
        self.steps.push(Step::Hello);
        debug!(role = %Role::Client, version = %hello.lri_version, "hello sent");
        Ok(Frame::Hello(hello))
    }

    /// Feed one decoded frame.
    pub fn advance(&mut self, frame: Frame) -> Advance {
        let got = frame.step();
        match self.state {
            State::Rejected(_) => {
                return Advance::Rejected(Rejection {
                    error: LhsError::Terminated,
                    notify_peer: false,
                })
            },
            // Flow frames belong to the payload channel; the session stays up.
            State::Flowing(_) => {
                return Advance::Rejected(Rejection {
                    error: LhsError::OutOfOrder {
                        expected: None,
                        got,
                    },
                    notify_peer: false,
                })
            },
            _ => {},
        }

        if let Frame::Error(report) = frame {
            return Advance::Rejected(self.fail(
                LhsError::PeerRejected {
                    code: report.code,
                    detail: report.detail,
                },
                false,
            ));
        }

        if let Some(rejection) = self.check_deadline(Instant::now()) {
            return Advance::Rejected(rejection);
        }

        let expected = self.expected_step();
        if expected != Some(got) {
            return Advance::Rejected(self.fail(LhsError::OutOfOrder { expected, got }, true));
        }
        self.steps.push(got);
        debug!(role = %self.role(), step = %got, "frame accepted");

        let state = std::mem::replace(&mut self.state, State::Rejected(ErrorCode::Internal));
        let outcome = match (state, frame) {
            (State::WaitHello, Frame::Hello(hello)) => self.on_hello(hello),
            (State::SentMirror { hello, mirror, lease }, Frame::Bind(bind)) => {
                self.on_bind(hello, mirror, lease, bind)
            },
            (State::SentHello, Frame::Mirror(mirror)) => self.on_mirror(mirror),
            (State::SentBind { mirror }, Frame::Seal(seal)) => self.on_seal(mirror, &seal),
            _ => Err(LhsError::OutOfOrder { expected, got }),
        };

        match outcome {
            Ok(advance) => advance,
            Err(error) => Advance::Rejected(self.fail(error, true)),
        }
    }

    fn server_ctx(&self) -> Result<Arc<ServerContext>> {
        match &self.ctx {
            RoleContext::Server(ctx) => Ok(Arc::clone(ctx)),
            RoleContext::Client { .. } => Err(LhsError::Terminated),
        }
    }

    fn on_hello(&mut self, hello: Hello) -> Result<Advance> {
        let ctx = self.server_ctx()?;
        let negotiated = ctx.support.negotiate(&hello)?;
        let lease = ctx.replay.reserve(self.timeouts.bind + RESERVE_GRACE)?;
        let mirror =
            negotiated.into_mirror(lease.nonce().to_string(), ctx.support.server_id.clone());

        debug!(
            client_id = hello.client_id.as_deref().unwrap_or("-"),
            version = %mirror.lri_version,
            encoding = %mirror.encoding,
            max_frame_bytes = mirror.max_frame_bytes,
            "capabilities negotiated"
        );

        self.frame_limit = mirror.max_frame_bytes;
        self.deadline = Some(Instant::now() + self.timeouts.bind);
        self.mirror_seen = true;
        self.steps.push(Step::Mirror);
        self.state = State::SentMirror {
            hello,
            mirror: mirror.clone(),
            lease,
        };
        Ok(Advance::Reply(Frame::Mirror(mirror)))
    }

    fn on_bind(
        &mut self,
        hello: Hello,
        mirror: Mirror,
        mut lease: NonceLease,
        bind: Bind,
    ) -> Result<Advance> {
        let ctx = self.server_ctx()?;
        let thread = ThreadId::parse(&bind.thread)?;
        let auth = bind.auth.as_ref().ok_or(BindError::MissingCredential)?;
        ctx.identity.authenticate(&thread, auth)?;

        if !mirror.features.contains(TRUST_FEATURE) {
            return Err(TrustError::NotNegotiated(Feature::Ltp).into());
        }

        let ttl = chrono::Duration::from_std(ctx.seal_ttl)
            .map_err(|e| LhsError::Config(format!("seal ttl out of range: {e}")))?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let seal = ctx
            .sealer
            .seal(&hello, &mirror, &bind, session_id, Utc::now() + ttl)?;

        if !lease.commit(ctx.seal_ttl) {
            // Reservation expired between Mirror and Bind.
            return Err(LhsError::Timeout(Step::Bind));
        }

        let session =
            EstablishedSession::new(Role::Server, &mirror, &seal, thread.as_str(), hello.client_id);
        self.deadline = Some(Instant::now() + self.timeouts.seal);
        self.steps.push(Step::Seal);
        self.state = State::SentSeal(session);
        Ok(Advance::Reply(Frame::Seal(seal)))
    }

    fn on_mirror(&mut self, mirror: Mirror) -> Result<Advance> {
        let bind = match &self.ctx {
            RoleContext::Client { hello, bind, .. } => {
                check_mirror(hello, &mirror)?;
                bind.clone()
            },
            RoleContext::Server(_) => return Err(LhsError::Terminated),
        };

        debug!(
            server_id = mirror.server_id.as_deref().unwrap_or("-"),
            encoding = %mirror.encoding,
            "mirror accepted"
        );

        self.frame_limit = mirror.max_frame_bytes;
        self.deadline = Some(Instant::now() + self.timeouts.seal);
        self.mirror_seen = true;
        self.steps.push(Step::Bind);
        self.state = State::SentBind { mirror };
        Ok(Advance::Reply(Frame::Bind(bind)))
    }

    fn on_seal(&mut self, mirror: Mirror, seal: &super::frame::Seal) -> Result<Advance> {
        let RoleContext::Client {
            hello,
            bind,
            verifier,
        } = &self.ctx
        else {
            return Err(LhsError::Terminated);
        };

        verifier.verify(hello, &mirror, bind, seal)?;

        let session = EstablishedSession::new(
            Role::Client,
            &mirror,
            seal,
            &bind.thread,
            hello.client_id.clone(),
        );
        info!(
            session_id = %session.session_id(),
            encoding = %session.encoding(),
            "handshake established"
        );
        self.deadline = None;
        self.state = State::Flowing(session.clone());
        Ok(Advance::Established(session))
    }

    /// Server: the Seal reached the peer; enter Flow.
    pub fn enter_flow(&mut self) -> Result<EstablishedSession> {
        match std::mem::replace(&mut self.state, State::Rejected(ErrorCode::Internal)) {
            State::SentSeal(session) => {
                info!(
                    session_id = %session.session_id(),
                    thread = %session.thread(),
                    encoding = %session.encoding(),
                    "handshake established"
                );
                self.deadline = None;
                self.state = State::Flowing(session.clone());
                Ok(session)
            },
            State::Rejected(code) => {
                self.state = State::Rejected(code);
                Err(LhsError::Terminated)
            },
            other => {
                self.state = other;
                Err(LhsError::NotEstablished)
            },
        }
    }

    /// Reject if the current deadline has passed.
    pub fn check_deadline(&mut self, now: Instant) -> Option<Rejection> {
        match self.deadline {
            Some(deadline) if now >= deadline => Some(self.expire()),
            _ => None,
        }
    }

    /// The driver observed the current deadline pass.
    pub fn expire(&mut self) -> Rejection {
        let step = self.expected_step().unwrap_or(Step::Seal);
        self.fail(LhsError::Timeout(step), true)
    }

    /// Terminal failure detected outside the machine (codec, transport).
    pub fn reject(&mut self, error: LhsError, notify_peer: bool) -> Rejection {
        self.fail(error, notify_peer)
    }

    /// Tear down without a protocol error, e.g. on cancellation.
    pub fn abort(&mut self) {
        if !self.is_finished() {
            debug!(role = %self.role(), phase = ?self.phase(), "handshake aborted");
            self.state = State::Rejected(ErrorCode::Internal);
            self.deadline = None;
        }
    }

    fn fail(&mut self, error: LhsError, notify_peer: bool) -> Rejection {
        let code = error.code();
        if !matches!(self.state, State::Flowing(_)) {
            warn!(role = %self.role(), phase = ?self.phase(), code = %code, error = %error, "handshake rejected");
            // Dropping the old state releases any unsealed nonce.
            self.state = State::Rejected(code);
            self.deadline = None;
        }
        Rejection { error, notify_peer }
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role())
            .field("phase", &self.phase())
            .field("steps", &self.steps)
            .field("frame_limit", &self.frame_limit)
            .finish()
    }
}
