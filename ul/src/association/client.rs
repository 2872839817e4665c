//! Association requester module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity is the one requesting the association.
//! See [`ClientAssociationOptions`](self::ClientAssociationOptions)
//! for details and examples on how to create an association.
use std::{
    borrow::Cow,
    fmt,
    net::{TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use snafu::{ensure, ResultExt};
use tracing::{debug, warn};

use crate::{
    pdu::{
        AbortRQSource, AsyncOperationsWindow, AssociationRQ, CommonExtendedNegotiation, Pdu,
        PresentationContextProposed, RoleSelection, UserIdentity, UserIdentityType,
        UserVariableItem, DEFAULT_MAX_PDU, DICOM_APPLICATION_CONTEXT_NAME,
    },
    IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME,
};

use super::{
    uid::trim_uid, Association, AssociationConfig, AssociationListener, ConnectSnafu,
    MissingAbstractSyntaxSnafu, NoAcceptedPresentationContextsSnafu,
    ProtocolVersionMismatchSnafu, Result, Role, TooManyPresentationContextsSnafu, Transport,
    UnexpectedPduSnafu, UnknownPresentationContextSnafu,
};

/// The maximum number of presentation contexts in one association,
/// as identifiers are odd numbers from 1 to 255.
const MAX_PRESENTATION_CONTEXTS: usize = 128;

/// A DICOM association builder for a client node.
/// The final outcome is an [`Association`] in the requestor role.
///
/// This is the standard way of requesting and establishing
/// an association with another DICOM node,
/// that one usually taking the role of a service class provider (SCP).
///
/// # Example
///
/// ```no_run
/// # use dicom_ulp::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"])
///    .establish_tcp("129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
///
/// At least one presentation context must be specified,
/// using the method [`with_presentation_context`](Self::with_presentation_context)
/// and supplying both an abstract syntax and list of transfer syntaxes.
///
/// A helper method [`with_abstract_syntax`](Self::with_abstract_syntax) will
/// include by default the transfer syntaxes
/// _Explicit VR Little Endian_ and _Implicit VR Little Endian_
/// in the resulting presentation context.
///
/// Presentation context identifiers are assigned in insertion order:
/// 1, 3, 5, and so on.
#[derive(Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title
    called_ae_title: Cow<'a, str>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the list of requested presentation contexts
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length requested for receiving PDUs
    max_pdu_length: u32,
    /// the proposed asynchronous operations window, if any
    async_operations_window: Option<AsyncOperationsWindow>,
    /// SCP/SCU role selection proposals
    roles: Vec<RoleSelection>,
    /// SOP class extended negotiation proposals
    extended_negotiation: Vec<(Cow<'a, str>, Vec<u8>)>,
    /// SOP class common extended negotiation items
    common_extended_negotiation: Vec<CommonExtendedNegotiation>,
    /// user identity negotiation request
    user_identity: Option<UserIdentity>,
    implementation_class_uid: Cow<'a, str>,
    implementation_version_name: Cow<'a, str>,
    /// timeouts and decoding options of the association
    config: AssociationConfig,
    listeners: Vec<Arc<dyn AssociationListener>>,
    /// TCP connection timeout
    connection_timeout: Option<Duration>,
}

impl fmt::Debug for ClientAssociationOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAssociationOptions")
            .field("calling_ae_title", &self.calling_ae_title)
            .field("called_ae_title", &self.called_ae_title)
            .field("application_context_name", &self.application_context_name)
            .field("presentation_contexts", &self.presentation_contexts)
            .field("protocol_version", &self.protocol_version)
            .field("max_pdu_length", &self.max_pdu_length)
            .field("async_operations_window", &self.async_operations_window)
            .field("roles", &self.roles)
            .field("extended_negotiation", &self.extended_negotiation)
            .field("common_extended_negotiation", &self.common_extended_negotiation)
            .field("user_identity", &self.user_identity)
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .field("connection_timeout", &self.connection_timeout)
            .finish()
    }
}

impl<'a> Default for ClientAssociationOptions<'a> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.into(),
            presentation_contexts: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            async_operations_window: None,
            roles: Vec::new(),
            extended_negotiation: Vec::new(),
            common_extended_negotiation: Vec::new(),
            user_identity: None,
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.into(),
            implementation_version_name: IMPLEMENTATION_VERSION_NAME.into(),
            config: AssociationConfig::default(),
            listeners: Vec::new(),
            connection_timeout: None,
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    /// Passing an empty string resets the AE title to the default.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let cae = called_ae_title.into();
        self.called_ae_title = if cae.is_empty() { "ANY-SCP".into() } else { cae };
        self
    }

    /// Override the application context name.
    pub fn application_context_name<T>(mut self, name: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.application_context_name = name.into();
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntax_uids
            .into_iter()
            .map(|t| trim_uid(t.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// to the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Override the protocol version to propose.
    pub fn protocol_version(mut self, protocol_version: u16) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Propose an asynchronous operations window:
    /// how many operations this node wishes to invoke
    /// and to perform at the same time (0 for unlimited).
    ///
    /// No window is proposed by default,
    /// meaning that operations are synchronous.
    pub fn async_operations_window(mut self, max_invoked: u16, max_performed: u16) -> Self {
        self.async_operations_window = Some(AsyncOperationsWindow::new(max_invoked, max_performed));
        self
    }

    /// Propose the SCU and SCP roles of this node for the given SOP class.
    pub fn with_role<T>(mut self, sop_class_uid: T, scu_role: bool, scp_role: bool) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.roles.push(RoleSelection {
            sop_class_uid: trim_uid(sop_class_uid.into()).into_owned(),
            scu_role,
            scp_role,
        });
        self
    }

    /// Propose SOP class extended negotiation
    /// with the given service class application information.
    pub fn with_extended_negotiation<T>(mut self, sop_class_uid: T, info: Vec<u8>) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.extended_negotiation
            .push((trim_uid(sop_class_uid.into()), info));
        self
    }

    /// Declare the service class and related general SOP classes
    /// of a SOP class.
    pub fn with_common_extended_negotiation(mut self, item: CommonExtendedNegotiation) -> Self {
        self.common_extended_negotiation.push(item);
        self
    }

    /// Identify the user with a user name only.
    pub fn username<T>(self, username: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let username = username.into();
        self.user_identity(UserIdentity::new(
            false,
            UserIdentityType::Username,
            username.as_bytes().to_vec(),
            Vec::new(),
        ))
    }

    /// Identify the user with a user name and password.
    pub fn username_password<T, U>(self, username: T, password: U) -> Self
    where
        T: Into<Cow<'a, str>>,
        U: Into<Cow<'a, str>>,
    {
        let username = username.into();
        let password = password.into();
        self.user_identity(UserIdentity::new(
            false,
            UserIdentityType::UsernamePassword,
            username.as_bytes().to_vec(),
            password.as_bytes().to_vec(),
        ))
    }

    /// Request user identity negotiation with any kind of identity.
    pub fn user_identity(mut self, user_identity: UserIdentity) -> Self {
        self.user_identity = Some(user_identity);
        self
    }

    /// Override the implementation class UID sent to the acceptor.
    pub fn implementation_class_uid<T>(mut self, uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.implementation_class_uid = trim_uid(uid.into());
        self
    }

    /// Override the implementation version name sent to the acceptor.
    pub fn implementation_version_name<T>(mut self, name: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.implementation_version_name = name.into();
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    /// Override all timeouts and decoding options.
    pub fn config(mut self, config: AssociationConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the time to wait for the association acknowledgement.
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.accept_timeout = Some(timeout);
        self
    }

    /// Set the time to wait for the TCP connection to be established.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Register a lifecycle listener on the association,
    /// before any event can take place.
    pub fn with_listener(mut self, listener: Arc<dyn AssociationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build the association request PDU from these options.
    pub fn build_request(&self) -> Result<AssociationRQ> {
        // presentation contexts represent intent,
        // they should not be omitted by the user
        ensure!(
            !self.presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );
        ensure!(
            self.presentation_contexts.len() <= MAX_PRESENTATION_CONTEXTS,
            TooManyPresentationContextsSnafu {
                count: self.presentation_contexts.len()
            }
        );

        let presentation_contexts: Vec<_> = self
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                id: (2 * i + 1) as u8,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes.iter().map(|uid| uid.to_string()).collect(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(self.implementation_class_uid.to_string()),
        ];
        if let Some(window) = self.async_operations_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(window));
        }
        user_variables.extend(self.roles.iter().cloned().map(UserVariableItem::RoleSelection));
        user_variables.push(UserVariableItem::ImplementationVersionName(
            self.implementation_version_name.to_string(),
        ));
        user_variables.extend(self.extended_negotiation.iter().map(|(uid, info)| {
            UserVariableItem::SopClassExtendedNegotiationSubItem(uid.to_string(), info.clone())
        }));
        user_variables.extend(
            self.common_extended_negotiation
                .iter()
                .cloned()
                .map(UserVariableItem::SopClassCommonExtendedNegotiationSubItem),
        );
        if let Some(identity) = &self.user_identity {
            user_variables.push(UserVariableItem::UserIdentityItem(identity.clone()));
        }

        Ok(AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: self.called_ae_title.to_string(),
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts,
            user_variables,
        })
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    pub fn establish_tcp<A: ToSocketAddrs>(self, address: A) -> Result<Association> {
        // fail early, before connecting
        self.build_request()?;
        let socket = match self.connection_timeout {
            Some(timeout) => connect_timeout(address, timeout)?,
            None => TcpStream::connect(address).context(ConnectSnafu)?,
        };
        self.establish(socket)
    }

    /// Request a new DICOM association over an open transport,
    /// negotiating the presentation contexts in the process.
    ///
    /// Fails if the association is rejected,
    /// or if no presentation context was accepted
    /// (in which case the association is aborted).
    pub fn establish<T: Transport>(self, transport: T) -> Result<Association> {
        let rq = self.build_request()?;
        let association = Association::new(Role::Requestor, Box::new(transport), self.config);
        for listener in self.listeners {
            association.add_listener(listener);
        }

        association.set_request(rq.clone());
        association.send(&Pdu::AssociationRQ(rq.clone()))?;

        let ac = match association.receive()? {
            Pdu::AssociationAC(ac) => ac,
            // other PDUs are refused by the state machine
            pdu => {
                return UnexpectedPduSnafu {
                    state: association.state(),
                    pdu_type: pdu.pdu_type(),
                }
                .fail()
            }
        };

        if ac.protocol_version != rq.protocol_version {
            warn!(
                "Protocol version mismatch: expected {}, got {}",
                rq.protocol_version, ac.protocol_version
            );
            association.abort_with(AbortRQSource::ServiceUser);
            return ProtocolVersionMismatchSnafu {
                expected: rq.protocol_version,
                got: ac.protocol_version,
            }
            .fail();
        }
        if let Some(pc) = ac
            .presentation_contexts
            .iter()
            .find(|pc| !rq.presentation_contexts.iter().any(|p| p.id == pc.id))
        {
            let id = pc.id;
            association.abort_with(AbortRQSource::ServiceUser);
            return UnknownPresentationContextSnafu { id }.fail();
        }

        association.set_accept(ac);
        if !association.has_accepted_presentation_context() {
            association.abort_with(AbortRQSource::ServiceUser);
            return NoAcceptedPresentationContextsSnafu.fail();
        }
        debug!(
            "Negotiated presentation contexts: {:?}",
            association.presentation_contexts()
        );
        association.notify_established();
        Ok(association)
    }
}

/// Connect to the first resolved address which answers in time.
fn connect_timeout<A: ToSocketAddrs>(address: A, timeout: Duration) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in address.to_socket_addrs().context(ConnectSnafu)? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(socket) => return Ok(socket),
            Err(e) => last_error = Some(e),
        }
    }
    let e = last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "address resolved to nothing",
        )
    });
    Err(e).context(ConnectSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::Error;
    use matches::matches;

    #[test]
    fn request_assigns_odd_presentation_context_ids() {
        let rq = ClientAssociationOptions::new()
            .with_abstract_syntax("1.2.840.10008.1.1")
            .with_presentation_context("1.2.840.10008.5.1.4.1.1.7\0", vec!["1.2.840.10008.1.2"])
            .with_abstract_syntax("1.2.840.10008.5.1.4.1.1.2")
            .calling_ae_title("STORE-SCU")
            .called_ae_title("STORE-SCP")
            .build_request()
            .unwrap();

        let ids: Vec<u8> = rq.presentation_contexts.iter().map(|pc| pc.id).collect();
        assert_eq!(ids, vec![1, 3, 5]);
        assert_eq!(rq.presentation_contexts[1].abstract_syntax, "1.2.840.10008.5.1.4.1.1.7");
        assert_eq!(
            rq.presentation_contexts[0].transfer_syntaxes,
            vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"]
        );
        assert_eq!(rq.calling_ae_title, "STORE-SCU");
        assert_eq!(rq.called_ae_title, "STORE-SCP");
        assert_eq!(rq.max_pdu_length(), Some(DEFAULT_MAX_PDU));
        assert_eq!(rq.async_operations_window(), None);
    }

    #[test]
    fn request_carries_optional_user_variables() {
        let rq = ClientAssociationOptions::new()
            .with_abstract_syntax("1.2.840.10008.1.1")
            .async_operations_window(4, 2)
            .with_role("1.2.840.10008.1.1", true, false)
            .with_extended_negotiation("1.2.840.10008.1.1", vec![1, 0])
            .username_password("user", "secret")
            .build_request()
            .unwrap();

        assert_eq!(
            rq.async_operations_window(),
            Some(AsyncOperationsWindow::new(4, 2))
        );
        assert!(rq.user_variables.contains(&UserVariableItem::RoleSelection(RoleSelection {
            sop_class_uid: "1.2.840.10008.1.1".to_string(),
            scu_role: true,
            scp_role: false,
        })));
        assert!(rq
            .user_variables
            .contains(&UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2.840.10008.1.1".to_string(),
                vec![1, 0]
            )));
        let identity = rq.user_identity().unwrap();
        assert_eq!(identity.identity_type(), UserIdentityType::UsernamePassword);
        assert_eq!(identity.primary_field(), b"user");
        assert_eq!(identity.secondary_field(), b"secret");
    }

    #[test]
    fn request_without_abstract_syntax_fails() {
        let err = ClientAssociationOptions::new().build_request().unwrap_err();
        assert!(matches!(err, Error::MissingAbstractSyntax { .. }));
    }

    #[test]
    fn request_with_too_many_presentation_contexts_fails() {
        let mut options = ClientAssociationOptions::new();
        for _ in 0..129 {
            options = options.with_abstract_syntax("1.2.840.10008.1.1");
        }
        let err = options.build_request().unwrap_err();
        assert!(matches!(
            err,
            Error::TooManyPresentationContexts { count: 129, .. }
        ));
    }
}
