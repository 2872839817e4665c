//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to create an association.
//!
//! ## Basic Usage
//!
//! Spawn a thread for each incoming association request.
//! ```no_run
//! # use std::net::TcpListener;
//! # use dicom_ulp::association::server::ServerAssociationOptions;
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! # let tcp_listener: TcpListener = unimplemented!();
//! let scp_options = ServerAssociationOptions::new()
//!    .accept_called_ae_title()
//!    .ae_title("STORE-SCP")
//!    .with_transfer_syntaxes("1.2.840.10008.1.1", ["1.2.840.10008.1.2.1"]);
//!
//! for stream in tcp_listener.incoming() {
//!     let scp_options = scp_options.clone();
//!     std::thread::spawn(move || {
//!         let association = scp_options.establish(stream?)?;
//!         // ...
//!         # Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
//!     });
//! }
//! # Ok(())
//! # }
//! ```
use std::{borrow::Cow, fmt, sync::Arc, time::Duration};

use snafu::ensure;
use tracing::{debug, info};

use crate::pdu::Pdu;

use super::{
    policy::{
        AcceptAny, AcceptCalledAeTitle, AccessControl, AcceptorPolicy, ExtendedNegotiationHandler,
        UserIdentityNegotiator,
    },
    Association, AssociationConfig, AssociationListener, MissingAbstractSyntaxSnafu,
    RejectedSnafu, Result, Role, Transport, UnexpectedPduSnafu,
};

/// A DICOM association builder for an acceptor DICOM node,
/// often taking the role of a service class provider (SCP).
///
/// This is the standard way of negotiating and establishing
/// an association with a requesting node.
/// Negotiation is delegated to an [`AcceptorPolicy`],
/// which can be built separately and passed with [`policy`](Self::policy),
/// or configured through the builder methods of this type,
/// which forward to the policy.
///
/// Access control logic is also available,
/// enabling application entities to decide on
/// whether to accept or reject the association request
/// based on the _called_ and _calling_ AE titles.
///
/// - By default, the application will accept requests from anyone
///   ([`AcceptAny`])
/// - To only accept requests with a matching _called_ AE title,
///   call the method [`accept_called_ae_title`](Self::accept_called_ae_title)
///   ([`AcceptCalledAeTitle`]).
/// - Any other policy can be implemented through the [`AccessControl`] trait.
///
/// The SCP will by default accept all transfer syntaxes
/// supported by the main [transfer syntax registry][1],
/// unless specific transfer syntaxes are given per abstract syntax.
///
/// [1]: dicom_transfer_syntax_registry
#[derive(Clone, Default)]
pub struct ServerAssociationOptions {
    policy: AcceptorPolicy,
    config: AssociationConfig,
    listeners: Vec<Arc<dyn AssociationListener>>,
}

impl fmt::Debug for ServerAssociationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerAssociationOptions")
            .field("policy", &self.policy)
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ServerAssociationOptions {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole acceptor policy.
    pub fn policy(mut self, policy: AcceptorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Retrieve the acceptor policy in use.
    pub fn get_policy(&self) -> &AcceptorPolicy {
        &self.policy
    }

    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the options are first created.
    pub fn accept_any(self) -> Self {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    ///
    /// The default is to accept any requesting node
    /// regardless of the specified AE titles.
    pub fn accept_called_ae_title(self) -> Self {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    ///
    /// The default is to accept any requesting node
    /// regardless of the specified AE titles.
    pub fn ae_access_control<P>(mut self, access_control: P) -> Self
    where
        P: AccessControl + 'static,
    {
        self.policy = self.policy.ae_access_control(access_control);
        self
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<'a, T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.policy = self.policy.ae_title(ae_title);
        self
    }

    /// Include this abstract syntax
    /// in the list of proposed presentation contexts,
    /// accepting any supported transfer syntax.
    pub fn with_abstract_syntax<'a, T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.policy = self.policy.with_abstract_syntax(abstract_syntax_uid);
        self
    }

    /// Include this abstract syntax
    /// with the given transfer syntaxes, in order of preference.
    pub fn with_transfer_syntaxes<'a, T, I, U>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: I,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
        I: IntoIterator<Item = U>,
        U: Into<Cow<'a, str>>,
    {
        self.policy = self
            .policy
            .with_transfer_syntaxes(abstract_syntax_uid, transfer_syntax_uids);
        self
    }

    /// Override the maximum expected PDU length.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.policy = self.policy.max_pdu_length(value);
        self
    }

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.policy = self.policy.promiscuous(promiscuous);
        self
    }

    /// Define how many operations this node may invoke and perform
    /// asynchronously.
    pub fn async_operations_window(mut self, max_invoked: u16, max_performed: u16) -> Self {
        self.policy = self
            .policy
            .async_operations_window(max_invoked, max_performed);
        self
    }

    /// Declare the roles this node may take for the given SOP class.
    pub fn with_role<'a, T>(mut self, sop_class_uid: T, scu: bool, scp: bool) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.policy = self.policy.with_role(sop_class_uid, scu, scp);
        self
    }

    /// Register a SOP class extended negotiation handler.
    pub fn with_extended_negotiation<'a, T, H>(mut self, sop_class_uid: T, handler: H) -> Self
    where
        T: Into<Cow<'a, str>>,
        H: ExtendedNegotiationHandler + 'static,
    {
        self.policy = self.policy.with_extended_negotiation(sop_class_uid, handler);
        self
    }

    /// Negotiate user identity with the given negotiator.
    pub fn user_identity_negotiator<N>(mut self, negotiator: N) -> Self
    where
        N: UserIdentityNegotiator + 'static,
    {
        self.policy = self.policy.user_identity_negotiator(negotiator);
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

    /// Set the time to wait for the association request.
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.config.accept_timeout = Some(timeout);
        self
    }

    /// Register a lifecycle listener on every association established.
    pub fn with_listener(mut self, listener: Arc<dyn AssociationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Negotiate an association with the given transport,
    /// which must have just been accepted.
    ///
    /// If the request is rejected,
    /// the rejection is sent to the requestor,
    /// the transport is closed,
    /// and the rejection is returned as an error.
    pub fn establish<T: Transport>(&self, transport: T) -> Result<Association> {
        ensure!(!self.policy.accepts_nothing(), MissingAbstractSyntaxSnafu);

        let association = Association::new(Role::Acceptor, Box::new(transport), self.config.clone());
        for listener in &self.listeners {
            association.add_listener(Arc::clone(listener));
        }

        let rq = match association.receive()? {
            Pdu::AssociationRQ(rq) => rq,
            // other PDUs are refused by the state machine
            pdu => {
                return UnexpectedPduSnafu {
                    state: association.state(),
                    pdu_type: pdu.pdu_type(),
                }
                .fail()
            }
        };
        debug!(
            "Association request from {} to {}",
            rq.calling_ae_title, rq.called_ae_title
        );
        association.set_request(rq.clone());

        match self.policy.negotiate(&rq) {
            Ok(ac) => {
                association.set_accept(ac.clone());
                association.send(&Pdu::AssociationAC(ac))?;
                association.notify_established();
                Ok(association)
            }
            Err(association_rj) => {
                info!(
                    "Rejecting association from {}: {}",
                    rq.calling_ae_title, association_rj.source
                );
                association.send(&Pdu::AssociationRJ(association_rj.clone()))?;
                RejectedSnafu { association_rj }.fail()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::Error;
    use matches::matches;

    #[test]
    fn options_without_abstract_syntax_refuse_to_establish() {
        let listener = std::net::TcpListener::bind("localhost:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();

        let err = ServerAssociationOptions::new().establish(stream).unwrap_err();
        assert!(matches!(err, Error::MissingAbstractSyntax { .. }));
        drop(client);
    }

    #[test]
    fn builder_methods_forward_to_policy() {
        let options = ServerAssociationOptions::new()
            .ae_title("STORE-SCP")
            .max_pdu_length(32_768)
            .with_abstract_syntax("1.2.840.10008.1.1");
        assert_eq!(options.get_policy().get_ae_title(), "STORE-SCP");
        assert_eq!(options.get_policy().get_max_pdu_length(), 32_768);
        assert!(!options.get_policy().accepts_nothing());
    }
}
