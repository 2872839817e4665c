//! Services performing inbound requests, keyed by SOP class.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::association::uid::trim_uid_str;
use crate::dimse::{Command, DataSetReader, Status};

use super::{ActiveAssociation, Result};

/// A provider of DIMSE services for one or more SOP classes.
///
/// The service is called on a worker thread of the dispatcher
/// for every request of a SOP class it was registered for,
/// and writes its responses with
/// [`write_response`](ActiveAssociation::write_response).
///
/// The data set reader holds the message read lock of the association:
/// no other message is read until it is consumed or dropped.
pub trait DimseService: Send + Sync {
    fn on_request(
        &self,
        association: &ActiveAssociation,
        presentation_context_id: u8,
        command: Command,
        data: Option<DataSetReader<'_>>,
    ) -> Result<()>;
}

impl<F> DimseService for F
where
    F: Fn(&ActiveAssociation, u8, Command, Option<DataSetReader<'_>>) -> Result<()> + Send + Sync,
{
    fn on_request(
        &self,
        association: &ActiveAssociation,
        presentation_context_id: u8,
        command: Command,
        data: Option<DataSetReader<'_>>,
    ) -> Result<()> {
        self(association, presentation_context_id, command, data)
    }
}

/// Service class provider of the Verification SOP class:
/// answers every C-ECHO request with success.
#[derive(Debug, Default, Copy, Clone)]
pub struct VerificationService;

impl DimseService for VerificationService {
    fn on_request(
        &self,
        association: &ActiveAssociation,
        presentation_context_id: u8,
        command: Command,
        data: Option<DataSetReader<'_>>,
    ) -> Result<()> {
        drop(data);
        let status = if command.command_field() == Some(crate::dimse::CommandField::CEchoRq) {
            Status::SUCCESS
        } else {
            Status::UNRECOGNIZED_OPERATION
        };
        match Command::response_to(&command, status) {
            Some(rsp) => association.write_response(presentation_context_id, &rsp, None),
            None => Ok(()),
        }
    }
}

/// Collection of services keyed by SOP class UID.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn DimseService>>,
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.services.keys()).finish()
    }
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the service for the given SOP class,
    /// replacing any previous one.
    pub fn with_service<S>(mut self, sop_class_uid: &str, service: S) -> Self
    where
        S: DimseService + 'static,
    {
        self.register(sop_class_uid, Arc::new(service));
        self
    }

    /// Register the built-in [`VerificationService`].
    pub fn with_verification(self) -> Self {
        self.with_service(dicom_dictionary_std::uids::VERIFICATION, VerificationService)
    }

    pub fn register(&mut self, sop_class_uid: &str, service: Arc<dyn DimseService>) {
        let uid = trim_uid_str(sop_class_uid).to_string();
        debug!("Registering service for {}", uid);
        self.services.insert(uid, service);
    }

    pub fn unregister(&mut self, sop_class_uid: &str) -> bool {
        self.services
            .remove(trim_uid_str(sop_class_uid))
            .is_some()
    }

    /// The service registered for the given SOP class.
    pub fn get(&self, sop_class_uid: &str) -> Option<Arc<dyn DimseService>> {
        self.services
            .get(trim_uid_str(sop_class_uid))
            .cloned()
    }

    /// The SOP classes with a registered service.
    pub fn sop_classes(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}
