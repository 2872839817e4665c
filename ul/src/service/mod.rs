//! Concurrent dispatch of DIMSE messages over an established association.
//!
//! An [`ActiveAssociation`] takes over an [`Association`]
//! and runs a small pool of worker threads reading from it.
//! One worker at a time reads the next message (the leader),
//! handing the association over to another one
//! as soon as the message is read,
//! so that reading continues while a request is being performed.
//!
//! - Requests are routed by SOP class
//!   to the services of a [`ServiceRegistry`].
//! - Responses are delivered to the [`ResponseListener`]
//!   of the invocation they respond to,
//!   such as a [`FutureResponse`].
//! - Cancel requests are delivered to the [`CancelListener`]
//!   registered for the operation they target.
//!
//! The number of worker threads
//! follows the negotiated asynchronous operations window.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::Duration;

use snafu::{ensure, Backtrace, IntoError, ResultExt, Snafu};
use tracing::{debug, error, info, warn};

use crate::association::{lock, Association, AssociationListener, CloseReason, State};
use crate::dimse::{
    write_message, Command, CommandField, DataSetReader, DataSource, DimseMessage, DimseReader,
    Incoming, Status,
};
use crate::pdu::{AbortRQServiceProviderReason, AbortRQSource, Pdu};

pub mod future;
pub mod registry;

pub use future::FutureResponse;
pub use registry::{DimseService, ServiceRegistry, VerificationService};

fn describe(reason: &Option<CloseReason>) -> String {
    match reason {
        Some(reason) => reason.to_string(),
        None => "association closed".to_string(),
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// association failure
    Association {
        #[snafu(backtrace)]
        source: crate::association::Error,
    },

    /// failed to transfer DIMSE message
    Dimse {
        #[snafu(backtrace)]
        source: crate::dimse::Error,
    },

    #[snafu(display("association is not established (state: {})", state))]
    NotEstablished { state: State, backtrace: Backtrace },

    #[snafu(display("{}", describe(reason)))]
    Closed {
        reason: Option<CloseReason>,
        backtrace: Backtrace,
    },

    /// only request commands can be invoked
    NotARequest { backtrace: Backtrace },

    #[snafu(display("message ID {} is already awaiting a response", message_id))]
    DuplicateMessageId { message_id: u16, backtrace: Backtrace },

    #[snafu(display("unrecognized command field {:?}", code))]
    UnrecognizedCommand {
        code: Option<u16>,
        backtrace: Backtrace,
    },

    /// no release response in time, the association was aborted
    ReleaseTimeout { backtrace: Backtrace },

    /// could not spawn worker thread
    SpawnWorker {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Observer of the responses to one invoked operation.
pub trait ResponseListener: Send + Sync {
    /// Called for every response, pending ones included,
    /// in the order of arrival.
    fn on_response(&self, response: DimseMessage);

    /// Called if the association closes
    /// before the final response was received.
    fn on_closed(&self, reason: &CloseReason);
}

/// Observer of cancel requests targeting one performed operation.
pub trait CancelListener: Send + Sync {
    fn on_cancel(&self, presentation_context_id: u8, message_id: u16);
}

impl<F> CancelListener for F
where
    F: Fn(u8, u16) + Send + Sync,
{
    fn on_cancel(&self, presentation_context_id: u8, message_id: u16) {
        self(presentation_context_id, message_id)
    }
}

/// Options of the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// whether a command and the start of its data set
    /// may share a P-DATA-TF PDU
    pub pack_pdvs: bool,
    /// number of worker threads when the peer
    /// does not limit the operations performed
    pub max_workers: usize,
    /// how long a future still waits for a final response
    /// after the association closed
    pub close_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            pack_pdvs: false,
            max_workers: 16,
            close_grace: Duration::from_millis(100),
        }
    }
}

struct Shared {
    association: Association,
    registry: ServiceRegistry,
    config: DispatcherConfig,
    /// maximum invocations in flight, 0 if unbounded
    max_invoked: usize,
    /// response correlation table
    responses: Mutex<HashMap<u16, Arc<dyn ResponseListener>>>,
    responses_changed: Condvar,
    cancels: Mutex<HashMap<u16, Arc<dyn CancelListener>>>,
    /// requests being performed
    performing: Mutex<usize>,
    performing_changed: Condvar,
}

impl Shared {
    /// Complete all outstanding invocations
    /// and wake every thread waiting on the dispatcher.
    fn on_closing(&self) {
        let reason = self
            .association
            .close_reason()
            .unwrap_or(CloseReason::Released);
        let listeners: Vec<_> = {
            let mut responses = lock(&self.responses);
            let listeners = responses.drain().collect();
            self.responses_changed.notify_all();
            listeners
        };
        if !listeners.is_empty() {
            info!(
                "Completing {} outstanding invocations: {}",
                listeners.len(),
                reason
            );
        }
        for (_, listener) in listeners {
            listener.on_closed(&reason);
        }
        lock(&self.cancels).clear();
        let _performing = lock(&self.performing);
        self.performing_changed.notify_all();
    }
}

/// Association listener relaying the close to the dispatcher.
struct CloseHook(Weak<Shared>);

impl AssociationListener for CloseHook {
    fn on_closing(&self, _association: &Association) {
        if let Some(shared) = self.0.upgrade() {
            shared.on_closing();
        }
    }
}

/// Counts a request as being performed while alive.
struct Performing<'a>(&'a Shared);

impl<'a> Performing<'a> {
    fn begin(shared: &'a Shared) -> Self {
        *lock(&shared.performing) += 1;
        Performing(shared)
    }
}

impl Drop for Performing<'_> {
    fn drop(&mut self) {
        let mut performing = lock(&self.0.performing);
        *performing = performing.saturating_sub(1);
        self.0.performing_changed.notify_all();
    }
}

/// An established association driven by a pool of worker threads.
///
/// This is a cheap handle:
/// clones refer to the same association and dispatcher.
/// The workers stop once the association is closed,
/// after which the association is dropped with the last handle.
#[derive(Clone)]
pub struct ActiveAssociation {
    shared: Arc<Shared>,
}

impl fmt::Debug for ActiveAssociation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveAssociation")
            .field("association", &self.shared.association)
            .field("registry", &self.shared.registry)
            .field("config", &self.shared.config)
            .finish()
    }
}

impl ActiveAssociation {
    /// Start dispatching messages over an established association.
    pub fn start(
        association: Association,
        registry: ServiceRegistry,
        config: DispatcherConfig,
    ) -> Result<Self> {
        let state = association.state();
        ensure!(state.is_established(), NotEstablishedSnafu { state });

        let window = association.async_ops_window();
        let workers = match window.max_operations_performed {
            0 => config.max_workers,
            n => usize::from(n),
        }
        .max(1);

        let shared = Arc::new(Shared {
            max_invoked: usize::from(window.max_operations_invoked),
            association,
            registry,
            config,
            responses: Mutex::new(HashMap::new()),
            responses_changed: Condvar::new(),
            cancels: Mutex::new(HashMap::new()),
            performing: Mutex::new(0),
            performing_changed: Condvar::new(),
        });
        shared
            .association
            .add_listener(Arc::new(CloseHook(Arc::downgrade(&shared))));

        debug!(
            "Starting {} workers (window: {} invoked, {} performed)",
            workers, window.max_operations_invoked, window.max_operations_performed
        );
        for i in 0..workers {
            let active = ActiveAssociation {
                shared: Arc::clone(&shared),
            };
            let spawned = std::thread::Builder::new()
                .name(format!("dimse-worker-{}", i))
                .spawn(move || active.run_worker());
            if let Err(e) = spawned {
                error!("Could not spawn worker thread: {}", e);
                shared.association.abort_with(AbortRQSource::ServiceUser);
                return Err(SpawnWorkerSnafu.into_error(e));
            }
        }
        Ok(ActiveAssociation { shared })
    }

    /// The underlying association.
    pub fn association(&self) -> &Association {
        &self.shared.association
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Number of invocations awaiting their final response.
    pub fn outstanding_invocations(&self) -> usize {
        lock(&self.shared.responses).len()
    }

    fn closed_error(&self) -> Error {
        ClosedSnafu {
            reason: self.shared.association.close_reason(),
        }
        .build()
    }

    /// Invoke an operation, delivering its responses to the given listener.
    ///
    /// A message ID of 0 in the command is replaced by a fresh one.
    /// Blocks while the negotiated number of invocations
    /// is already awaiting responses.
    /// Returns the message ID of the request.
    pub fn invoke(
        &self,
        presentation_context_id: u8,
        mut command: Command,
        data: Option<&mut dyn DataSource>,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<u16> {
        let association = &self.shared.association;
        let state = association.state();
        ensure!(state.is_established(), NotEstablishedSnafu { state });
        ensure!(
            command.command_field().map_or(false, CommandField::is_request),
            NotARequestSnafu
        );

        let message_id = match command.message_id() {
            Some(id) if id != 0 => id,
            _ => {
                let id = association.next_message_id();
                command.set_message_id(id);
                id
            }
        };

        {
            let mut responses = lock(&self.shared.responses);
            loop {
                if association.state().is_closing() {
                    return Err(self.closed_error());
                }
                if self.shared.max_invoked == 0 || responses.len() < self.shared.max_invoked {
                    break;
                }
                debug!(
                    "{} invocations outstanding, waiting to invoke message {}",
                    responses.len(),
                    message_id
                );
                responses = self
                    .shared
                    .responses_changed
                    .wait(responses)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            ensure!(
                !responses.contains_key(&message_id),
                DuplicateMessageIdSnafu { message_id }
            );
            responses.insert(message_id, listener);
        }

        if let Err(e) = write_message(
            association,
            presentation_context_id,
            &command,
            data,
            self.shared.config.pack_pdvs,
        ) {
            lock(&self.shared.responses).remove(&message_id);
            self.shared.responses_changed.notify_all();
            return Err(e).context(DimseSnafu);
        }
        Ok(message_id)
    }

    /// Invoke an operation, obtaining a handle to its responses.
    pub fn invoke_future(
        &self,
        presentation_context_id: u8,
        command: Command,
        data: Option<&mut dyn DataSource>,
    ) -> Result<FutureResponse> {
        let future = FutureResponse::new(self.shared.config.close_grace);
        self.invoke(
            presentation_context_id,
            command,
            data,
            Arc::new(future.clone()),
        )?;
        Ok(future)
    }

    /// Request the peer to cancel the operation with the given message ID.
    ///
    /// The invocation remains outstanding until its final response.
    pub fn cancel(&self, presentation_context_id: u8, message_id: u16) -> Result<()> {
        debug!("Cancelling message {}", message_id);
        write_message(
            &self.shared.association,
            presentation_context_id,
            &Command::cancel_rq(message_id),
            None,
            self.shared.config.pack_pdvs,
        )
        .context(DimseSnafu)
    }

    /// Write a response to a request being performed.
    pub fn write_response(
        &self,
        presentation_context_id: u8,
        command: &Command,
        data: Option<&mut dyn DataSource>,
    ) -> Result<()> {
        write_message(
            &self.shared.association,
            presentation_context_id,
            command,
            data,
            self.shared.config.pack_pdvs,
        )
        .context(DimseSnafu)
    }

    /// Be notified of cancel requests for the operation with the given message ID.
    pub fn register_cancel_listener(&self, message_id: u16, listener: Arc<dyn CancelListener>) {
        lock(&self.shared.cancels).insert(message_id, listener);
    }

    pub fn remove_cancel_listener(&self, message_id: u16) -> bool {
        lock(&self.shared.cancels).remove(&message_id).is_some()
    }

    /// Release the association gracefully.
    ///
    /// With `wait_on_rsp`,
    /// waits for every outstanding invocation to receive its final response first.
    /// Returns once the association is closed.
    /// If the release response does not arrive in time,
    /// the association is aborted.
    pub fn release(&self, wait_on_rsp: bool) -> Result<()> {
        let association = &self.shared.association;
        if wait_on_rsp {
            let mut responses = lock(&self.shared.responses);
            while !responses.is_empty() && !association.state().is_closing() {
                debug!(
                    "Waiting for {} responses before releasing",
                    responses.len()
                );
                responses = self
                    .shared
                    .responses_changed
                    .wait(responses)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        association.send(&Pdu::ReleaseRQ).context(AssociationSnafu)?;
        let closed = match association.config().release_timeout {
            Some(timeout) => association.wait_for_close_timeout(timeout),
            None => {
                association.wait_for_close();
                true
            }
        };
        if !closed {
            warn!("No release response in time, aborting");
            association.abort_with(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            ));
            association.wait_for_close();
            return ReleaseTimeoutSnafu.fail();
        }
        match association.close_reason() {
            Some(CloseReason::Released) => Ok(()),
            _ => Err(self.closed_error()),
        }
    }

    /// Abort the association and wait for it to close.
    pub fn abort(&self) -> Result<()> {
        self.shared.association.abort().context(AssociationSnafu)?;
        self.shared.association.wait_for_close();
        Ok(())
    }

    /// Block until the association is closed.
    pub fn wait_for_close(&self) {
        self.shared.association.wait_for_close();
    }

    fn run_worker(self) {
        loop {
            match self.read_and_dispatch() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    if !self.shared.association.state().is_closing() {
                        error!("Dispatcher failed: {}", e);
                        self.shared.association.abort_with(AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::ReasonNotSpecified,
                        ));
                    } else {
                        debug!("Worker stopped: {}", e);
                    }
                    break;
                }
            }
        }
        debug!("Worker exiting");
    }

    /// Read one message and dispatch it.
    /// Returns whether to carry on reading.
    fn read_and_dispatch(&self) -> Result<bool> {
        let association = &self.shared.association;
        let mut reader = DimseReader::new(association);
        if association.state().is_closing() {
            return Ok(false);
        }

        let (presentation_context_id, command) = match reader.read_command().context(DimseSnafu)? {
            Incoming::Message {
                presentation_context_id,
                command,
            } => (presentation_context_id, command),
            Incoming::ReleaseRequested => {
                drop(reader);
                self.answer_release()?;
                return Ok(false);
            }
            Incoming::Released => return Ok(false),
        };

        let field = match command.command_field() {
            Some(field) => field,
            None => {
                let code = command.command_field_code();
                error!("Unrecognized command field {:?}, aborting", code);
                association.abort_with(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnrecognizedPduParameter,
                ));
                return UnrecognizedCommandSnafu { code }.fail();
            }
        };

        if field.is_response() {
            // delivered before the next message can be read,
            // so that a final response never trails the close
            let data = reader.read_data_set().context(DimseSnafu)?;
            self.deliver_response(DimseMessage {
                presentation_context_id,
                command,
                data,
            });
        } else if field.is_cancel() {
            drop(reader);
            self.deliver_cancel(presentation_context_id, &command);
        } else {
            let _performing = Performing::begin(&self.shared);
            let data = reader.into_data_set();
            self.perform(presentation_context_id, command, data)?;
        }
        Ok(true)
    }

    fn deliver_response(&self, response: DimseMessage) {
        let message_id = match response.command.message_id_being_responded_to() {
            Some(id) => id,
            None => {
                warn!("Discarding response without a message ID being responded to");
                return;
            }
        };
        let listener = {
            let mut responses = lock(&self.shared.responses);
            if response.command.is_pending() {
                responses.get(&message_id).cloned()
            } else {
                let listener = responses.remove(&message_id);
                self.shared.responses_changed.notify_all();
                listener
            }
        };
        match listener {
            Some(listener) => listener.on_response(response),
            None => warn!("Discarding response to unknown message {}", message_id),
        }
    }

    fn deliver_cancel(&self, presentation_context_id: u8, command: &Command) {
        let message_id = match command.message_id_being_responded_to() {
            Some(id) => id,
            None => {
                warn!("Discarding C-CANCEL without a message ID being responded to");
                return;
            }
        };
        let listener = lock(&self.shared.cancels).get(&message_id).cloned();
        match listener {
            Some(listener) => listener.on_cancel(presentation_context_id, message_id),
            None => debug!("Ignoring C-CANCEL for message {}", message_id),
        }
    }

    fn perform(
        &self,
        presentation_context_id: u8,
        command: Command,
        data: Option<DataSetReader<'_>>,
    ) -> Result<()> {
        let service = command
            .sop_class_uid()
            .and_then(|uid| self.shared.registry.get(&uid));
        let service = match service {
            Some(service) => service,
            None => {
                warn!(
                    "No service for SOP class {}, refusing {}",
                    command.sop_class_uid().as_deref().unwrap_or("(none)"),
                    command
                );
                if let Some(data) = data {
                    data.close().context(DimseSnafu)?;
                }
                return match Command::response_to(&command, Status::NO_SUCH_SOP_CLASS) {
                    Some(rsp) => self.write_response(presentation_context_id, &rsp, None),
                    None => Ok(()),
                };
            }
        };

        let description = command.to_string();
        if let Err(e) = service.on_request(self, presentation_context_id, command, data) {
            if self.shared.association.state().is_closing() {
                return Err(e);
            }
            warn!("Failed to perform {}: {}", description, e);
        }
        Ok(())
    }

    /// Answer a release request from the peer
    /// once all requests being performed are complete.
    fn answer_release(&self) -> Result<()> {
        let association = &self.shared.association;
        {
            let mut performing = lock(&self.shared.performing);
            while *performing > 0 && !association.state().is_closing() {
                debug!(
                    "Release requested, waiting for {} operations",
                    *performing
                );
                performing = self
                    .shared
                    .performing_changed
                    .wait(performing)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        info!("Releasing association on request");
        association.send(&Pdu::ReleaseRP).context(AssociationSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DispatcherConfig::default();
        assert!(!config.pack_pdvs);
        assert!(config.max_workers >= 1);
    }

    #[test]
    fn closed_error_names_the_reason() {
        let err = ClosedSnafu {
            reason: Some(CloseReason::Aborted {
                source: AbortRQSource::ServiceUser,
            }),
        }
        .build();
        assert!(err.to_string().contains("aborted"));
        let err = ClosedSnafu { reason: None }.build();
        assert_eq!(err.to_string(), "association closed");
    }
}
