//! DICOM association module
//!
//! This module contains the association state machine,
//! which owns one transport connection
//! and enforces the legal sequence of PDUs over it,
//! as well as the utilities for establishing associations.
//!
//! As an association requester, often as a service class user (SCU),
//! a new association can be started
//! via the [`ClientAssociationOptions`][1] type.
//! The minimum required properties are the proposed abstract syntaxes
//! and the transport (or TCP socket address) to the target node.
//!
//! As an association acceptor,
//! usually taking the role of a service class provider (SCP),
//! a newly accepted [transport][2] can be passed to
//! a previously prepared [`ServerAssociationOptions`][3],
//! which negotiates according to an [`AcceptorPolicy`][4].
//!
//! Both yield an [`Association`],
//! which can be driven directly PDU by PDU,
//! or handed over to the [service](crate::service) layer.
//!
//! [1]: crate::association::client::ClientAssociationOptions
//! [2]: crate::association::transport::Transport
//! [3]: crate::association::server::ServerAssociationOptions
//! [4]: crate::association::policy::AcceptorPolicy
pub mod client;
pub mod policy;
pub mod server;
pub mod state;
pub mod transport;

pub(crate) mod uid;

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use snafu::{ensure, Backtrace, IntoError, OptionExt, ResultExt, Snafu};
use tracing::{debug, error, info, warn};

use crate::pdu::{
    read_pdu_from_wire, writer::encode_pdu, AbortRQServiceProviderReason, AbortRQSource,
    AssociationAC, AssociationRJ, AssociationRQ, AsyncOperationsWindow, PDataValue, Pdu, PduType,
    PresentationContextNegotiated, PresentationContextResultReason, DEFAULT_MAX_PDU,
    MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};

pub use client::ClientAssociationOptions;
pub use policy::{AcceptAny, AcceptCalledAeTitle, AccessControl, AcceptorPolicy};
pub use server::ServerAssociationOptions;
pub use state::{Role, State};
pub use transport::Transport;

use transport::TransportReader;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// missing abstract syntax to begin negotiation
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("too many presentation contexts proposed ({}, maximum is 128)", count))]
    TooManyPresentationContexts { count: usize, backtrace: Backtrace },

    /// could not connect to the remote node
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not configure the transport read timeout
    SetReadTimeout {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to encode PDU
    EncodePdu {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to send PDU message on wire
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "PDU is too large ({} bytes) to be sent to the remote application entity (maximum is {})",
        length,
        max_pdu_length
    ))]
    SendTooLongPdu {
        length: usize,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    /// failed to receive PDU message
    Receive {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// received an invalid PDU
    InvalidPdu {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    #[snafu(display("unexpected {} in state {}", pdu_type, state))]
    UnexpectedPdu {
        state: State,
        pdu_type: PduType,
        backtrace: Backtrace,
    },

    #[snafu(display("cannot send {} in state {}", pdu_type, state))]
    IllegalSend {
        state: State,
        pdu_type: PduType,
        backtrace: Backtrace,
    },

    #[snafu(display("association is not established (state: {})", state))]
    NotEstablished { state: State, backtrace: Backtrace },

    /// association is closed
    Closed { backtrace: Backtrace },

    #[snafu(display("timed out waiting for a PDU in state {}", state))]
    Timeout { state: State, backtrace: Backtrace },

    #[snafu(display("association aborted by {}", abort_source))]
    Aborted {
        abort_source: AbortRQSource,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected: {}", association_rj.source))]
    Rejected {
        association_rj: AssociationRJ,
        backtrace: Backtrace,
    },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("presentation context {} in response was never proposed", id))]
    UnknownPresentationContext { id: u8, backtrace: Backtrace },

    /// no presentation contexts accepted by the remote node
    NoAcceptedPresentationContexts { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad classification of association errors.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// the peer violated the protocol, the association was aborted
    Protocol,
    /// the association request was rejected
    Rejected,
    /// the association was aborted by either side
    Aborted,
    /// the transport connection failed
    Transport,
    /// the API was used in a way not allowed in the current state
    Usage,
    /// no PDU arrived in time, the association was aborted
    Timeout,
}

impl Error {
    /// Classify this error,
    /// telling local misuse apart from wire-visible faults.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingAbstractSyntax { .. }
            | Error::TooManyPresentationContexts { .. }
            | Error::EncodePdu { .. }
            | Error::SendTooLongPdu { .. }
            | Error::IllegalSend { .. }
            | Error::NotEstablished { .. }
            | Error::Closed { .. } => ErrorKind::Usage,
            Error::Connect { .. }
            | Error::SetReadTimeout { .. }
            | Error::WireSend { .. }
            | Error::Receive { .. } => ErrorKind::Transport,
            Error::InvalidPdu { .. }
            | Error::UnexpectedPdu { .. }
            | Error::ProtocolVersionMismatch { .. }
            | Error::UnknownPresentationContext { .. } => ErrorKind::Protocol,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Aborted { .. } => ErrorKind::Aborted,
            Error::Rejected { .. } | Error::NoAcceptedPresentationContexts { .. } => {
                ErrorKind::Rejected
            }
        }
    }
}

/// How an association came to be closed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CloseReason {
    /// orderly release
    Released,
    /// the association request was rejected
    Rejected,
    /// aborted by either side
    Aborted { source: AbortRQSource },
    /// the transport connection failed
    Failed { message: String },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Released => f.write_str("association released"),
            CloseReason::Rejected => f.write_str("association rejected"),
            CloseReason::Aborted { source } => write!(f, "association aborted by {}", source),
            CloseReason::Failed { message } => write!(f, "association failed: {}", message),
        }
    }
}

/// Timing and decoding options of an association.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationConfig {
    /// how long to wait for the association request or response
    pub accept_timeout: Option<Duration>,
    /// how long to wait for the release response
    pub release_timeout: Option<Duration>,
    /// how long to wait between fragments of one DIMSE message
    pub dimse_timeout: Option<Duration>,
    /// how long to wait for the next DIMSE message, `None` to wait forever
    pub idle_timeout: Option<Duration>,
    /// grace period before closing the transport in the `Terminating` state
    pub close_delay: Duration,
    /// whether receiving PDUs must not surpass the negotiated maximum PDU length
    pub strict: bool,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        AssociationConfig {
            accept_timeout: Some(Duration::from_secs(30)),
            release_timeout: Some(Duration::from_secs(30)),
            dimse_timeout: Some(Duration::from_secs(60)),
            idle_timeout: None,
            close_delay: Duration::from_millis(50),
            strict: true,
        }
    }
}

/// Observer of association lifecycle events.
///
/// All methods have empty default implementations.
pub trait AssociationListener: Send + Sync {
    fn on_established(&self, _association: &Association) {}

    /// Called on a transport failure, before closing.
    fn on_error(&self, _association: &Association, _error: &Error) {}

    fn on_closing(&self, _association: &Association) {}

    /// Called exactly once per association, after `on_closing`.
    fn on_closed(&self, _association: &Association) {}
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A DICOM association over one transport connection.
///
/// The association moves through the [states](State) of the upper layer
/// state machine as PDUs are sent and received,
/// and can never be reopened once closed.
/// Reading and writing use independent locks,
/// so a value of this type can be shared between threads
/// (usually behind an [`Arc`]),
/// with one thread blocked on a read while others write.
pub struct Association {
    role: Role,
    transport: Box<dyn Transport>,
    config: AssociationConfig,
    state: Mutex<State>,
    state_changed: Condvar,
    /// PDU read buffer, also the read lock
    reader: Mutex<BytesMut>,
    /// PDU write lock
    writer: Mutex<()>,
    request: OnceLock<AssociationRQ>,
    accept: OnceLock<AssociationAC>,
    message_id: Mutex<u16>,
    properties: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    listeners: Mutex<Vec<Arc<dyn AssociationListener>>>,
    close_reason: Mutex<Option<CloseReason>>,
    closing_notified: AtomicBool,
    closed_notified: AtomicBool,
    /// P-DATA values received but not consumed yet, also the DIMSE read lock
    pub(crate) incoming: Mutex<VecDeque<PDataValue>>,
    /// DIMSE message write lock
    pub(crate) outgoing: Mutex<()>,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("request", &self.request.get())
            .field("accept", &self.accept.get())
            .finish()
    }
}

impl Association {
    /// Create an association in its initial state
    /// over an already open transport.
    pub(crate) fn new(role: Role, transport: Box<dyn Transport>, config: AssociationConfig) -> Self {
        Association {
            role,
            transport,
            config,
            state: Mutex::new(State::initial(role)),
            state_changed: Condvar::new(),
            reader: Mutex::new(BytesMut::with_capacity(DEFAULT_MAX_PDU as usize)),
            writer: Mutex::new(()),
            request: OnceLock::new(),
            accept: OnceLock::new(),
            message_id: Mutex::new(1),
            properties: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            close_reason: Mutex::new(None),
            closing_notified: AtomicBool::new(false),
            closed_notified: AtomicBool::new(false),
            incoming: Mutex::new(VecDeque::new()),
            outgoing: Mutex::new(()),
        }
    }

    /// Which side of the association this node holds.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The current state of the association.
    pub fn state(&self) -> State {
        *lock(&self.state)
    }

    pub fn is_established(&self) -> bool {
        self.state().is_established()
    }

    pub fn config(&self) -> &AssociationConfig {
        &self.config
    }

    /// The association request, once sent or received.
    pub fn request(&self) -> Option<&AssociationRQ> {
        self.request.get()
    }

    /// The association acknowledgement, once sent or received.
    pub fn accept(&self) -> Option<&AssociationAC> {
        self.accept.get()
    }

    pub(crate) fn set_request(&self, rq: AssociationRQ) {
        if self.request.set(rq).is_err() {
            warn!("Association request was already set");
        }
    }

    pub(crate) fn set_accept(&self, ac: AssociationAC) {
        if self.accept.set(ac).is_err() {
            warn!("Association acknowledgement was already set");
        }
    }

    /// The calling AE title, once the request is known.
    pub fn calling_ae_title(&self) -> Option<&str> {
        self.request().map(|rq| rq.calling_ae_title.as_str())
    }

    /// The called AE title, once the request is known.
    pub fn called_ae_title(&self) -> Option<&str> {
        self.request().map(|rq| rq.called_ae_title.as_str())
    }

    /// The AE title of the remote node.
    pub fn peer_ae_title(&self) -> Option<&str> {
        match self.role {
            Role::Requestor => self.called_ae_title(),
            Role::Acceptor => self.calling_ae_title(),
        }
    }

    /// All presentation contexts, combining proposals with their results.
    pub fn presentation_contexts(&self) -> Vec<PresentationContextNegotiated> {
        let (rq, ac) = match (self.request(), self.accept()) {
            (Some(rq), Some(ac)) => (rq, ac),
            _ => return Vec::new(),
        };
        ac.presentation_contexts
            .iter()
            .filter_map(|result| {
                let proposed = rq
                    .presentation_contexts
                    .iter()
                    .find(|pc| pc.id == result.id)?;
                Some(PresentationContextNegotiated {
                    id: result.id,
                    reason: result.reason,
                    abstract_syntax: uid::trim_uid(proposed.abstract_syntax.as_str().into())
                        .into_owned(),
                    transfer_syntax: uid::trim_uid(result.transfer_syntax.as_str().into())
                        .into_owned(),
                })
            })
            .collect()
    }

    /// Look up a negotiated presentation context by its identifier.
    pub fn presentation_context(&self, id: u8) -> Option<PresentationContextNegotiated> {
        self.presentation_contexts()
            .into_iter()
            .find(|pc| pc.id == id)
    }

    /// The first accepted presentation context for the given abstract syntax.
    pub fn presentation_context_for(&self, abstract_syntax: &str) -> Option<PresentationContextNegotiated> {
        let abstract_syntax = uid::trim_uid_str(abstract_syntax);
        self.presentation_contexts()
            .into_iter()
            .find(|pc| pc.is_accepted() && pc.abstract_syntax == abstract_syntax)
    }

    /// The maximum PDU length which this node declared to admit.
    pub fn local_max_pdu_length(&self) -> u32 {
        let declared = match self.role {
            Role::Requestor => self.request().and_then(|rq| rq.max_pdu_length()),
            Role::Acceptor => self.accept().and_then(|ac| ac.max_pdu_length()),
        };
        match declared {
            None => DEFAULT_MAX_PDU,
            Some(0) => MAXIMUM_PDU_SIZE,
            Some(len) => len,
        }
    }

    /// The maximum PDU length which the remote node admits.
    ///
    /// A declared length of 0 (unlimited) is reported as
    /// [`MAXIMUM_PDU_SIZE`].
    pub fn peer_max_pdu_length(&self) -> u32 {
        let declared = match self.role {
            Role::Requestor => self.accept().and_then(|ac| ac.max_pdu_length()),
            Role::Acceptor => self.request().and_then(|rq| rq.max_pdu_length()),
        };
        match declared {
            None => DEFAULT_MAX_PDU,
            Some(0) => MAXIMUM_PDU_SIZE,
            Some(len) => len,
        }
    }

    /// The negotiated asynchronous operations window,
    /// from the point of view of this node:
    /// how many operations it may invoke,
    /// and how many it may be asked to perform.
    pub fn async_ops_window(&self) -> AsyncOperationsWindow {
        let window = self
            .accept()
            .and_then(|ac| ac.async_operations_window())
            .unwrap_or_default();
        match self.role {
            Role::Requestor => window,
            Role::Acceptor => window.reversed(),
        }
    }

    /// Obtain a fresh message ID.
    ///
    /// Message IDs are 16-bit values.
    /// They increase monotonically until `u16::MAX`,
    /// after which the sequence wraps around to 1,
    /// so an ID is only greater than those seen before it
    /// until the wrap occurs.
    pub fn next_message_id(&self) -> u16 {
        let mut counter = lock(&self.message_id);
        let id = *counter;
        *counter = if id == u16::MAX { 1 } else { id + 1 };
        id
    }

    /// Take note of a message ID seen on the wire,
    /// so that subsequently assigned IDs are greater.
    pub fn observe_message_id(&self, id: u16) {
        let mut counter = lock(&self.message_id);
        if id >= *counter {
            *counter = if id == u16::MAX { 1 } else { id + 1 };
        }
    }

    /// Attach a value to the association under the given key,
    /// replacing any previous one.
    pub fn set_property<K, T>(&self, key: K, value: T)
    where
        K: Into<String>,
        T: Any + Send + Sync,
    {
        lock(&self.properties).insert(key.into(), Arc::new(value));
    }

    /// Retrieve a value attached to the association,
    /// if present and of the given type.
    pub fn property<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = lock(&self.properties).get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Detach a value from the association.
    /// Returns whether it was present.
    pub fn remove_property(&self, key: &str) -> bool {
        lock(&self.properties).remove(key).is_some()
    }

    /// Register an observer of association lifecycle events.
    pub fn add_listener(&self, listener: Arc<dyn AssociationListener>) {
        lock(&self.listeners).push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn AssociationListener>> {
        lock(&self.listeners).clone()
    }

    /// How the association was closed, if it is closing or closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.close_reason).clone()
    }

    fn set_close_reason(&self, reason: CloseReason) {
        let mut close_reason = lock(&self.close_reason);
        if close_reason.is_none() {
            *close_reason = Some(reason);
        }
    }

    pub(crate) fn notify_established(&self) {
        info!(
            "Association established ({:?}) with {}",
            self.role,
            self.peer_ae_title().unwrap_or("unknown AE")
        );
        for listener in self.listeners() {
            listener.on_established(self);
        }
    }

    fn notify_closing(&self) {
        if !self.closing_notified.swap(true, Ordering::SeqCst) {
            for listener in self.listeners() {
                listener.on_closing(self);
            }
        }
    }

    fn notify_closed(&self) {
        if !self.closed_notified.swap(true, Ordering::SeqCst) {
            for listener in self.listeners() {
                listener.on_closed(self);
            }
        }
    }

    fn set_state(&self, next: State) -> State {
        let mut state = lock(&self.state);
        let previous = std::mem::replace(&mut *state, next);
        drop(state);
        if previous != next {
            debug!("Association state: {} -> {}", previous, next);
            self.state_changed.notify_all();
        }
        previous
    }

    /// The read timeout applying when waiting for a PDU in the given state.
    fn timeout_for(&self, state: State) -> Option<Duration> {
        match state {
            State::AwaitingAssociateRequest | State::AwaitingAssociateResponse => {
                self.config.accept_timeout
            }
            State::AwaitingReleaseResponse
            | State::AcceptorAwaitingReadResponse
            | State::RequestorAwaitingReadResponse => self.config.release_timeout,
            _ => self.config.idle_timeout,
        }
    }

    /// The maximum length of PDUs accepted on read.
    fn read_max_pdu_length(&self, state: State) -> u32 {
        if state.is_negotiating() {
            MAXIMUM_PDU_SIZE
        } else {
            self.local_max_pdu_length()
                .clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE)
        }
    }

    /// Send a PDU to the remote node.
    ///
    /// Fails without sending if the PDU kind
    /// is not allowed in the current state.
    pub fn send(&self, pdu: &Pdu) -> Result<()> {
        let pdu_type = pdu.pdu_type();
        let bytes = encode_pdu(pdu).context(EncodePduSnafu)?;
        if let Pdu::PData { .. } = pdu {
            let max_pdu_length = self.peer_max_pdu_length();
            ensure!(
                bytes.len() - PDU_HEADER_SIZE as usize <= max_pdu_length as usize,
                SendTooLongPduSnafu {
                    length: bytes.len(),
                    max_pdu_length,
                }
            );
        }

        let writer = lock(&self.writer);
        let (previous, next) = {
            let mut state = lock(&self.state);
            let previous = *state;
            ensure!(!previous.is_closing(), ClosedSnafu);
            let next = previous.on_send(pdu_type).context(IllegalSendSnafu {
                state: previous,
                pdu_type,
            })?;
            *state = next;
            (previous, next)
        };
        if previous != next {
            debug!("{} sent: {} -> {}", pdu_type, previous, next);
            self.state_changed.notify_all();
        }

        if let Err(e) = self.transport.write_all(&bytes) {
            drop(writer);
            if let Pdu::AbortRQ { source } = pdu {
                debug!("Could not send A-ABORT: {}", e);
                self.terminate(CloseReason::Aborted { source: *source });
                return Ok(());
            }
            return Err(self.fail(WireSendSnafu.into_error(e)));
        }
        drop(writer);

        if next == State::Terminating {
            let reason = match pdu {
                Pdu::AbortRQ { source } => CloseReason::Aborted { source: *source },
                Pdu::AssociationRJ(_) => CloseReason::Rejected,
                _ => CloseReason::Released,
            };
            self.terminate(reason);
        }
        Ok(())
    }

    /// Receive the next PDU from the remote node,
    /// waiting as long as configured for the current state.
    pub fn receive(&self) -> Result<Pdu> {
        let timeout = self.timeout_for(self.state());
        self.receive_timeout(timeout)
    }

    /// Receive the next PDU from the remote node,
    /// waiting at most the given time (`None` waits forever).
    ///
    /// A PDU not allowed in the current state
    /// aborts the association and fails with [`Error::UnexpectedPdu`].
    /// A received A-ABORT or A-ASSOCIATE-RJ
    /// closes the association and is reported as an error.
    /// Release collisions are resolved internally.
    pub fn receive_timeout(&self, timeout: Option<Duration>) -> Result<Pdu> {
        let mut buffer = lock(&self.reader);
        loop {
            let state = self.state();
            ensure!(!state.is_closing(), ClosedSnafu);

            if let Err(e) = self.transport.set_read_timeout(timeout) {
                return Err(self.fail(SetReadTimeoutSnafu.into_error(e)));
            }
            let max_pdu_length = self.read_max_pdu_length(state);
            let pdu = match read_pdu_from_wire(
                &mut TransportReader(&*self.transport),
                &mut buffer,
                max_pdu_length,
                self.config.strict,
            ) {
                Ok(pdu) => pdu,
                Err(e) => return Err(self.on_read_error(e)),
            };

            if let Some(pdu) = self.on_received(pdu)? {
                return Ok(pdu);
            }
        }
    }

    fn on_read_error(&self, e: crate::pdu::reader::Error) -> Error {
        let state = self.state();
        if state.is_closing() {
            debug!("Read interrupted by association closing: {}", e);
            return ClosedSnafu.build();
        }
        if e.is_timeout() {
            warn!("Timed out waiting for a PDU in state {}", state);
            self.abort_with(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            ));
            return TimeoutSnafu { state }.build();
        }
        if e.is_transport() {
            return self.fail(ReceiveSnafu.into_error(e));
        }
        error!("Invalid PDU received: {}", e);
        self.abort_with(AbortRQSource::ServiceProvider(e.abort_reason()));
        InvalidPduSnafu.into_error(e)
    }

    /// Apply the state transition of a received PDU.
    /// Returns `None` if the PDU was consumed internally.
    fn on_received(&self, pdu: Pdu) -> Result<Option<Pdu>> {
        let pdu_type = pdu.pdu_type();
        let (previous, next) = {
            let mut state = lock(&self.state);
            let previous = *state;
            ensure!(!previous.is_closing(), ClosedSnafu);
            match previous.on_receive(self.role, pdu_type) {
                Some(next) => {
                    *state = next;
                    (previous, next)
                }
                None => {
                    drop(state);
                    let reason = match pdu_type {
                        PduType::Unknown(_) => AbortRQServiceProviderReason::UnrecognizedPdu,
                        _ => AbortRQServiceProviderReason::UnexpectedPdu,
                    };
                    warn!("Unexpected {} in state {}, aborting", pdu_type, previous);
                    self.abort_with(AbortRQSource::ServiceProvider(reason));
                    return UnexpectedPduSnafu {
                        state: previous,
                        pdu_type,
                    }
                    .fail();
                }
            }
        };
        if previous != next {
            debug!("{} received: {} -> {}", pdu_type, previous, next);
            self.state_changed.notify_all();
        }

        match pdu {
            Pdu::AbortRQ { source } => {
                warn!("Association aborted by the remote node: {}", source);
                self.terminate(CloseReason::Aborted { source });
                AbortedSnafu {
                    abort_source: source,
                }
                .fail()
            }
            Pdu::AssociationRJ(association_rj) => {
                info!("Association rejected: {}", association_rj.source);
                self.terminate(CloseReason::Rejected);
                RejectedSnafu { association_rj }.fail()
            }
            Pdu::ReleaseRQ if next == State::RequestorAwaitingLocalResponse => {
                debug!("Release collision, answering first");
                self.send(&Pdu::ReleaseRP)?;
                Ok(None)
            }
            Pdu::ReleaseRQ if next == State::AcceptorAwaitingReadResponse => {
                debug!("Release collision, waiting for the answer first");
                Ok(None)
            }
            Pdu::ReleaseRP if next == State::AcceptorAwaitingWriteResponse => {
                self.send(&Pdu::ReleaseRP)?;
                Ok(Some(Pdu::ReleaseRP))
            }
            Pdu::ReleaseRP => {
                self.terminate(CloseReason::Released);
                Ok(Some(Pdu::ReleaseRP))
            }
            pdu => Ok(Some(pdu)),
        }
    }

    /// Send an A-ABORT, ignoring failures.
    pub(crate) fn abort_with(&self, source: AbortRQSource) {
        if let Err(e) = self.send(&Pdu::AbortRQ { source }) {
            debug!("Could not abort association: {}", e);
            self.terminate(CloseReason::Aborted { source });
        }
    }

    /// Enter the `Terminating` state,
    /// then close the transport after the configured delay.
    fn terminate(&self, reason: CloseReason) {
        self.set_close_reason(reason);
        {
            let mut state = lock(&self.state);
            if *state == State::Idle {
                return;
            }
            *state = State::Terminating;
        }
        self.state_changed.notify_all();
        self.notify_closing();

        std::thread::sleep(self.config.close_delay);
        if let Err(e) = self.transport.shutdown() {
            debug!("Could not shut down transport: {}", e);
        }
        self.set_state(State::Idle);
        self.notify_closed();
    }

    /// Drop the association immediately after a transport failure.
    fn fail(&self, error: Error) -> Error {
        if self.state().is_closing() {
            return error;
        }
        error!("Association failed: {}", error);
        self.set_close_reason(CloseReason::Failed {
            message: error.to_string(),
        });
        self.set_state(State::Idle);
        if let Err(e) = self.transport.shutdown() {
            debug!("Could not shut down transport: {}", e);
        }
        for listener in self.listeners() {
            listener.on_error(self, &error);
        }
        self.notify_closing();
        self.notify_closed();
        error
    }

    /// Release the association gracefully,
    /// waiting for the release response.
    ///
    /// P-DATA received in the meantime is discarded.
    /// Use [`ActiveAssociation::release`](crate::service::ActiveAssociation::release)
    /// instead if a dispatcher is running on this association.
    pub fn release(&self) -> Result<()> {
        self.send(&Pdu::ReleaseRQ)?;
        loop {
            match self.receive()? {
                Pdu::ReleaseRP => return Ok(()),
                pdu => warn!("Discarding {} while releasing", pdu.short_description()),
            }
        }
    }

    /// Abort the association as the service user.
    ///
    /// Does nothing if the association is already closing.
    pub fn abort(&self) -> Result<()> {
        if self.state().is_closing() {
            return Ok(());
        }
        match self.send(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        }) {
            Err(Error::Closed { .. }) => Ok(()),
            other => other,
        }
    }

    /// Block until the association is closed.
    pub fn wait_for_close(&self) {
        let mut state = lock(&self.state);
        while *state != State::Idle {
            state = self
                .state_changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the association is closed or the timeout elapses.
    /// Returns whether the association is closed.
    pub fn wait_for_close_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while *state != State::Idle {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .state_changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Check that at least one presentation context was accepted.
    pub(crate) fn has_accepted_presentation_context(&self) -> bool {
        self.accept().map_or(false, |ac| {
            ac.presentation_contexts
                .iter()
                .any(|pc| pc.reason == PresentationContextResultReason::Acceptance)
        })
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        let state = self.state();
        if !state.is_closing() {
            debug!("Association dropped in state {}, aborting", state);
            self.abort_with(AbortRQSource::ServiceUser);
        } else if state == State::Terminating {
            let _ = self.transport.shutdown();
        }
    }
}
