//! Acceptor policy for association negotiation.
//!
//! An [`AcceptorPolicy`] holds everything an association acceptor
//! needs to decide on an incoming association request:
//! which AE titles it answers to,
//! which abstract syntaxes it supports and with which transfer syntaxes,
//! and how to negotiate the optional user information items.
//! [`AcceptorPolicy::negotiate`] turns a request into
//! an acknowledgement or a rejection, without any I/O.
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use tracing::{debug, warn};

use crate::association::uid::trim_uid;
use crate::pdu::{
    AssociationAC, AssociationRJ, AssociationRJServiceProviderASCEReason,
    AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ, AsyncOperationsWindow,
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    RoleSelection, UserIdentity, UserVariableItem, DEFAULT_MAX_PDU,
    DICOM_APPLICATION_CONTEXT_NAME,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own.
pub trait AccessControl: Send + Sync {
    /// Obtain the decision of whether to accept an incoming association request
    /// based on the recorded application entity titles and/or user identity.
    ///
    /// Returns Ok(()) if the requester node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// that match the called AE title with the node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// Handler of SOP class extended negotiation for one SOP class.
///
/// Receives the service class application information proposed by the requestor
/// and returns the information to send back,
/// or `None` to leave the item unanswered.
pub trait ExtendedNegotiationHandler: Send + Sync {
    fn negotiate(&self, sop_class_uid: &str, application_info: &[u8]) -> Option<Vec<u8>>;
}

impl<F> ExtendedNegotiationHandler for F
where
    F: Fn(&str, &[u8]) -> Option<Vec<u8>> + Send + Sync,
{
    fn negotiate(&self, sop_class_uid: &str, application_info: &[u8]) -> Option<Vec<u8>> {
        self(sop_class_uid, application_info)
    }
}

/// Negotiator of user identity.
pub trait UserIdentityNegotiator: Send + Sync {
    /// Decide on the user identity proposed by the requestor, if any.
    ///
    /// `Ok(Some(response))` accepts the identity with the given server response,
    /// which is only sent if the requestor asked for a positive response.
    /// `Ok(None)` accepts without a response.
    /// `Err(source)` rejects the association permanently.
    fn negotiate(
        &self,
        user_identity: Option<&UserIdentity>,
    ) -> Result<Option<Vec<u8>>, AssociationRJSource>;
}

impl<F> UserIdentityNegotiator for F
where
    F: Fn(Option<&UserIdentity>) -> Result<Option<Vec<u8>>, AssociationRJSource> + Send + Sync,
{
    fn negotiate(
        &self,
        user_identity: Option<&UserIdentity>,
    ) -> Result<Option<Vec<u8>>, AssociationRJSource> {
        self(user_identity)
    }
}

/// SCU/SCP roles which this node is willing to take for a SOP class.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct RoleCapability {
    pub scu: bool,
    pub scp: bool,
}

/// The local policy of an association acceptor.
///
/// Policies are built with chained setters
/// and may be shared across many connections.
///
/// # Example
///
/// ```
/// # use dicom_ulp::association::policy::AcceptorPolicy;
/// let policy = AcceptorPolicy::new()
///     .ae_title("STORE-SCP")
///     .with_transfer_syntaxes(
///         "1.2.840.10008.5.1.4.1.1.7",
///         ["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
///     )
///     .with_abstract_syntax("1.2.840.10008.1.1");
/// # let _ = policy;
/// ```
#[derive(Clone)]
pub struct AcceptorPolicy {
    /// the AE title of this DICOM node
    ae_title: String,
    /// the supported protocol version bits
    protocol_version: u16,
    /// proposed application context name -> responded name
    application_contexts: HashMap<String, String>,
    /// accepted called AE titles, empty to accept any
    called_ae_titles: Vec<String>,
    /// accepted calling AE titles, empty to accept any
    calling_ae_titles: Vec<String>,
    access_control: Arc<dyn AccessControl>,
    /// sub-policies applying to specific calling AE titles
    calling_overrides: HashMap<String, AcceptorPolicy>,
    /// sub-policies applying to specific called AE titles
    called_overrides: HashMap<String, AcceptorPolicy>,
    /// abstract syntax -> accepted transfer syntaxes, by preference
    presentation_contexts: HashMap<String, Vec<String>>,
    /// whether to accept any abstract syntax
    promiscuous: bool,
    roles: HashMap<String, RoleCapability>,
    extended_negotiation: HashMap<String, Arc<dyn ExtendedNegotiationHandler>>,
    user_identity: Option<Arc<dyn UserIdentityNegotiator>>,
    /// operations this node may invoke and perform
    async_operations_window: AsyncOperationsWindow,
    /// the maximum PDU length that this node admits
    max_pdu_length: u32,
    implementation_class_uid: String,
    implementation_version_name: String,
}

impl fmt::Debug for AcceptorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptorPolicy")
            .field("ae_title", &self.ae_title)
            .field("protocol_version", &self.protocol_version)
            .field("application_contexts", &self.application_contexts)
            .field("called_ae_titles", &self.called_ae_titles)
            .field("calling_ae_titles", &self.calling_ae_titles)
            .field("calling_overrides", &self.calling_overrides)
            .field("called_overrides", &self.called_overrides)
            .field("presentation_contexts", &self.presentation_contexts)
            .field("promiscuous", &self.promiscuous)
            .field("roles", &self.roles)
            .field(
                "extended_negotiation",
                &self.extended_negotiation.keys().collect::<Vec<_>>(),
            )
            .field("user_identity", &self.user_identity.is_some())
            .field("async_operations_window", &self.async_operations_window)
            .field("max_pdu_length", &self.max_pdu_length)
            .finish()
    }
}

impl Default for AcceptorPolicy {
    fn default() -> Self {
        AcceptorPolicy {
            ae_title: "THIS-SCP".to_string(),
            protocol_version: 1,
            application_contexts: HashMap::new(),
            called_ae_titles: Vec::new(),
            calling_ae_titles: Vec::new(),
            access_control: Arc::new(AcceptAny),
            calling_overrides: HashMap::new(),
            called_overrides: HashMap::new(),
            presentation_contexts: HashMap::new(),
            promiscuous: false,
            roles: HashMap::new(),
            extended_negotiation: HashMap::new(),
            user_identity: None,
            async_operations_window: AsyncOperationsWindow::synchronous(),
            max_pdu_length: DEFAULT_MAX_PDU,
            implementation_class_uid: IMPLEMENTATION_CLASS_UID.to_string(),
            implementation_version_name: IMPLEMENTATION_VERSION_NAME.to_string(),
        }
    }
}

impl AcceptorPolicy {
    /// Create a new policy accepting any AE title
    /// and no abstract syntax.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<'a, T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into().into_owned();
        self
    }

    /// Override the supported protocol version.
    pub fn protocol_version(mut self, protocol_version: u16) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    /// Accept an application context name other than the DICOM one,
    /// responding with the given name.
    pub fn with_application_context<'a, T, U>(mut self, proposed: T, responded: U) -> Self
    where
        T: Into<Cow<'a, str>>,
        U: Into<Cow<'a, str>>,
    {
        self.application_contexts.insert(
            trim_uid(proposed.into()).into_owned(),
            trim_uid(responded.into()).into_owned(),
        );
        self
    }

    /// Only accept associations calling this AE title.
    /// May be called multiple times.
    pub fn with_called_ae_title<'a, T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_titles.push(ae_title.into().into_owned());
        self
    }

    /// Only accept associations from this AE title.
    /// May be called multiple times.
    pub fn with_calling_ae_title<'a, T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_titles.push(ae_title.into().into_owned());
        self
    }

    /// Change the access control hook.
    ///
    /// The default is to accept any requesting node.
    pub fn ae_access_control<A>(mut self, access_control: A) -> Self
    where
        A: AccessControl + 'static,
    {
        self.access_control = Arc::new(access_control);
        self
    }

    /// Use a different policy for requests from the given calling AE title.
    ///
    /// The sub-policy may itself contain overrides per called AE title.
    pub fn with_calling_override<'a, T>(mut self, calling_ae_title: T, policy: AcceptorPolicy) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_overrides
            .insert(calling_ae_title.into().into_owned(), policy);
        self
    }

    /// Use a different policy for requests to the given called AE title.
    pub fn with_called_override<'a, T>(mut self, called_ae_title: T, policy: AcceptorPolicy) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_overrides
            .insert(called_ae_title.into().into_owned(), policy);
        self
    }

    /// Support this abstract syntax
    /// with any transfer syntax known to the transfer syntax registry.
    pub fn with_abstract_syntax<'a, T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.presentation_contexts
            .insert(trim_uid(abstract_syntax_uid.into()).into_owned(), Vec::new());
        self
    }

    /// Support this abstract syntax
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
        let transfer_syntaxes = transfer_syntax_uids
            .into_iter()
            .map(|ts| trim_uid(ts.into()).into_owned())
            .collect();
        self.presentation_contexts.insert(
            trim_uid(abstract_syntax_uid.into()).into_owned(),
            transfer_syntaxes,
        );
        self
    }

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Declare the roles this node may take for the given SOP class
    /// when the requestor proposes a role selection.
    pub fn with_role<'a, T>(mut self, sop_class_uid: T, scu: bool, scp: bool) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.roles.insert(
            trim_uid(sop_class_uid.into()).into_owned(),
            RoleCapability { scu, scp },
        );
        self
    }

    /// Register a SOP class extended negotiation handler.
    pub fn with_extended_negotiation<'a, T, H>(mut self, sop_class_uid: T, handler: H) -> Self
    where
        T: Into<Cow<'a, str>>,
        H: ExtendedNegotiationHandler + 'static,
    {
        self.extended_negotiation.insert(
            trim_uid(sop_class_uid.into()).into_owned(),
            Arc::new(handler),
        );
        self
    }

    /// Negotiate user identity with the given negotiator.
    ///
    /// Without a negotiator, user identity items are accepted
    /// and left unanswered.
    pub fn user_identity_negotiator<N>(mut self, negotiator: N) -> Self
    where
        N: UserIdentityNegotiator + 'static,
    {
        self.user_identity = Some(Arc::new(negotiator));
        self
    }

    /// Define how many operations this node may invoke and perform
    /// asynchronously. 0 means unlimited.
    ///
    /// The default is 1 and 1.
    pub fn async_operations_window(mut self, max_invoked: u16, max_performed: u16) -> Self {
        self.async_operations_window = AsyncOperationsWindow::new(max_invoked, max_performed);
        self
    }

    /// Override the maximum PDU length that this node admits.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override the implementation class UID.
    pub fn implementation_class_uid<'a, T>(mut self, uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.implementation_class_uid = trim_uid(uid.into()).into_owned();
        self
    }

    /// Override the implementation version name.
    pub fn implementation_version_name<'a, T>(mut self, name: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.implementation_version_name = name.into().into_owned();
        self
    }

    /// The AE title of this node.
    pub fn get_ae_title(&self) -> &str {
        &self.ae_title
    }

    /// The maximum PDU length that this node admits.
    pub fn get_max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    /// Whether no abstract syntax would ever be accepted.
    pub(crate) fn accepts_nothing(&self) -> bool {
        !self.promiscuous
            && self.presentation_contexts.is_empty()
            && self
                .calling_overrides
                .values()
                .chain(self.called_overrides.values())
                .all(|p| p.accepts_nothing())
    }

    /// Pick the policy applying to the given pair of AE titles.
    fn resolve(&self, calling_ae_title: &str, called_ae_title: &str) -> &AcceptorPolicy {
        let policy = self.calling_overrides.get(calling_ae_title).unwrap_or(self);
        policy
            .called_overrides
            .get(called_ae_title)
            .unwrap_or(policy)
    }

    /// Decide on an association request.
    ///
    /// Returns the association acknowledgement to send back,
    /// or the rejection if the association cannot be accepted at all.
    /// Rejecting individual presentation contexts does not reject the association.
    pub fn negotiate(&self, rq: &AssociationRQ) -> Result<AssociationAC, AssociationRJ> {
        let calling_ae_title = rq.calling_ae_title.as_str();
        let called_ae_title = rq.called_ae_title.as_str();

        if !self.called_ae_titles.is_empty()
            && !self.called_ae_titles.iter().any(|t| t == called_ae_title)
        {
            debug!("Called AE title `{}` not recognized", called_ae_title);
            return Err(AssociationRJ::permanent(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            )));
        }
        if !self.calling_ae_titles.is_empty()
            && !self.calling_ae_titles.iter().any(|t| t == calling_ae_title)
        {
            debug!("Calling AE title `{}` not recognized", calling_ae_title);
            return Err(AssociationRJ::permanent(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            )));
        }

        let policy = self.resolve(calling_ae_title, called_ae_title);
        policy.negotiate_resolved(rq)
    }

    fn negotiate_resolved(&self, rq: &AssociationRQ) -> Result<AssociationAC, AssociationRJ> {
        if rq.protocol_version & self.protocol_version == 0 {
            debug!("Protocol version {} not supported", rq.protocol_version);
            return Err(AssociationRJ::permanent(
                AssociationRJSource::ServiceProviderASCE(
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
                ),
            ));
        }

        self.access_control
            .check_access(
                &self.ae_title,
                &rq.calling_ae_title,
                &rq.called_ae_title,
                rq.user_identity(),
            )
            .map_err(|reason| {
                AssociationRJ::permanent(AssociationRJSource::ServiceUser(reason))
            })?;

        let application_context_name = self.resolve_application_context(&rq.application_context_name)?;

        let presentation_contexts = rq
            .presentation_contexts
            .iter()
            .map(|pc| self.negotiate_presentation_context(pc))
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(self.implementation_class_uid.clone()),
            UserVariableItem::ImplementationVersionName(self.implementation_version_name.clone()),
        ];

        if let Some(proposed) = rq.async_operations_window() {
            let window = negotiate_window(proposed, self.async_operations_window.reversed());
            user_variables.push(UserVariableItem::AsyncOperationsWindow(window));
        }

        for item in &rq.user_variables {
            match item {
                UserVariableItem::RoleSelection(role) => {
                    if let Some(capability) = self.roles.get(trim_uid(Cow::from(role.sop_class_uid.as_str())).as_ref()) {
                        user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
                            sop_class_uid: role.sop_class_uid.clone(),
                            scu_role: role.scu_role && capability.scu,
                            scp_role: role.scp_role && capability.scp,
                        }));
                    }
                }
                UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, info) => {
                    let handler = self
                        .extended_negotiation
                        .get(trim_uid(Cow::from(sop_class_uid.as_str())).as_ref());
                    if let Some(response) =
                        handler.and_then(|handler| handler.negotiate(sop_class_uid, info))
                    {
                        user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                            sop_class_uid.clone(),
                            response,
                        ));
                    }
                }
                _ => {}
            }
        }

        if let Some(negotiator) = &self.user_identity {
            let identity = rq.user_identity();
            match negotiator.negotiate(identity) {
                Ok(Some(response)) => {
                    if identity.map_or(false, |id| id.positive_response_requested()) {
                        user_variables.push(UserVariableItem::UserIdentityAc(response));
                    }
                }
                Ok(None) => {}
                Err(source) => {
                    debug!("User identity rejected: {}", source);
                    return Err(AssociationRJ::permanent(source));
                }
            }
        }

        Ok(AssociationAC {
            protocol_version: self.protocol_version,
            calling_ae_title: rq.calling_ae_title.clone(),
            called_ae_title: rq.called_ae_title.clone(),
            application_context_name,
            presentation_contexts,
            user_variables,
        })
    }

    fn resolve_application_context(&self, proposed: &str) -> Result<String, AssociationRJ> {
        let proposed = trim_uid(Cow::from(proposed));
        if let Some(name) = self.application_contexts.get(proposed.as_ref()) {
            return Ok(name.clone());
        }
        if proposed == DICOM_APPLICATION_CONTEXT_NAME {
            return Ok(proposed.into_owned());
        }
        debug!("Application context `{}` not supported", proposed);
        Err(AssociationRJ::permanent(AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
        )))
    }

    fn negotiate_presentation_context(
        &self,
        pc: &PresentationContextProposed,
    ) -> PresentationContextResult {
        let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax.as_str()));
        let proposed: Vec<_> = pc
            .transfer_syntaxes
            .iter()
            .map(|ts| trim_uid(Cow::from(ts.as_str())))
            .collect();
        // convention: echo the first proposed transfer syntax
        // when the result does not carry a meaningful one
        let first_proposed = proposed
            .first()
            .map(|ts| ts.to_string())
            .unwrap_or_default();

        let accepted = match self.presentation_contexts.get(abstract_syntax.as_ref()) {
            Some(transfer_syntaxes) if !transfer_syntaxes.is_empty() => transfer_syntaxes
                .iter()
                .find(|ts| proposed.iter().any(|p| p == ts.as_str()))
                .cloned(),
            Some(_) => choose_supported(proposed.iter()).map(|ts| ts.to_string()),
            None if self.promiscuous => choose_supported(proposed.iter()).map(|ts| ts.to_string()),
            None => {
                debug!(
                    "Presentation context {}: abstract syntax {} not supported",
                    pc.id, abstract_syntax
                );
                return PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: first_proposed,
                };
            }
        };

        match accepted {
            Some(transfer_syntax) => PresentationContextResult {
                id: pc.id,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax,
            },
            None => {
                warn!(
                    "Presentation context {}: no acceptable transfer syntax for {}",
                    pc.id, abstract_syntax
                );
                PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                    transfer_syntax: first_proposed,
                }
            }
        }
    }
}

/// Combine the proposed asynchronous operations window with the local one,
/// both from the requestor's point of view.
/// 0 stands for unlimited and defers to the other side.
fn negotiate_window(
    proposed: AsyncOperationsWindow,
    local: AsyncOperationsWindow,
) -> AsyncOperationsWindow {
    fn min_nonzero(a: u16, b: u16) -> u16 {
        match (a, b) {
            (0, x) | (x, 0) => x,
            (a, b) => a.min(b),
        }
    }
    AsyncOperationsWindow::new(
        min_nonzero(
            proposed.max_operations_invoked,
            local.max_operations_invoked,
        ),
        min_nonzero(
            proposed.max_operations_performed,
            local.max_operations_performed,
        ),
    )
}

/// Check that the main transfer syntax registry
/// supports the given transfer syntax,
/// meaning that it can parse and decode DICOM data sets.
///
/// ```
/// # use dicom_ulp::association::policy::is_supported;
/// // Implicit VR Little Endian is guaranteed to be supported
/// assert!(is_supported("1.2.840.10008.1.2"));
/// ```
pub fn is_supported(ts_uid: &str) -> bool {
    TransferSyntaxRegistry
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// From a sequence of transfer syntaxes,
/// choose the first transfer syntax to be supported
/// by the main transfer syntax registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter().find(|ts| is_supported(ts.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{AssociationRJResult, UserIdentityType};
    use matches::matches;
    use rstest::rstest;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
    const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";

    fn request(presentation_contexts: Vec<PresentationContextProposed>) -> AssociationRQ {
        AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "STORE-SCU".to_string(),
            called_ae_title: "STORE-SCP".to_string(),
            application_context_name: DICOM_APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts,
            user_variables: vec![UserVariableItem::MaxLength(16_384)],
        }
    }

    fn pc(id: u8, abstract_syntax: &str, transfer_syntaxes: &[&str]) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn rejection_source(result: Result<AssociationAC, AssociationRJ>) -> AssociationRJSource {
        match result {
            Err(rj) => {
                assert_eq!(rj.result, AssociationRJResult::Permanent);
                rj.source
            }
            Ok(ac) => panic!("expected rejection, got {:?}", ac),
        }
    }

    #[test]
    fn accepts_supported_and_rejects_unknown_abstract_syntax_in_order() {
        let policy = AcceptorPolicy::new()
            .with_transfer_syntaxes(VERIFICATION, [IMPLICIT_VR_LE]);
        let rq = request(vec![
            pc(1, VERIFICATION, &[IMPLICIT_VR_LE]),
            pc(3, CT_IMAGE_STORAGE, &[EXPLICIT_VR_LE, IMPLICIT_VR_LE]),
        ]);

        let ac = policy.negotiate(&rq).unwrap();
        assert_eq!(
            ac.presentation_contexts,
            vec![
                PresentationContextResult {
                    id: 1,
                    reason: PresentationContextResultReason::Acceptance,
                    transfer_syntax: IMPLICIT_VR_LE.to_string(),
                },
                // the first proposed transfer syntax is echoed back
                PresentationContextResult {
                    id: 3,
                    reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                    transfer_syntax: EXPLICIT_VR_LE.to_string(),
                },
            ]
        );

        // negotiation is deterministic
        assert_eq!(policy.negotiate(&rq).unwrap(), ac);
    }

    #[rstest]
    #[case(&[EXPLICIT_VR_LE, IMPLICIT_VR_LE], Some(IMPLICIT_VR_LE))]
    #[case(&[JPEG_BASELINE, EXPLICIT_VR_LE], Some(EXPLICIT_VR_LE))]
    #[case(&[JPEG_BASELINE], None)]
    fn transfer_syntax_chosen_in_policy_order(
        #[case] proposed: &[&str],
        #[case] expected: Option<&str>,
    ) {
        let policy = AcceptorPolicy::new()
            .with_transfer_syntaxes(CT_IMAGE_STORAGE, [IMPLICIT_VR_LE, EXPLICIT_VR_LE]);
        let ac = policy
            .negotiate(&request(vec![pc(1, CT_IMAGE_STORAGE, proposed)]))
            .unwrap();
        let result = &ac.presentation_contexts[0];
        match expected {
            Some(ts) => {
                assert_eq!(result.reason, PresentationContextResultReason::Acceptance);
                assert_eq!(result.transfer_syntax, ts);
            }
            None => {
                assert_eq!(
                    result.reason,
                    PresentationContextResultReason::TransferSyntaxesNotSupported
                );
            }
        }
    }

    #[test]
    fn abstract_syntax_without_list_uses_registry() {
        let policy = AcceptorPolicy::new().with_abstract_syntax(VERIFICATION);
        let ac = policy
            .negotiate(&request(vec![pc(1, VERIFICATION, &["1.2.3.4.5.6", IMPLICIT_VR_LE])]))
            .unwrap();
        assert_eq!(
            ac.presentation_contexts[0].reason,
            PresentationContextResultReason::Acceptance
        );
        assert_eq!(ac.presentation_contexts[0].transfer_syntax, IMPLICIT_VR_LE);
    }

    #[test]
    fn padded_uids_are_trimmed() {
        let policy = AcceptorPolicy::new().with_transfer_syntaxes(VERIFICATION, [IMPLICIT_VR_LE]);
        let ac = policy
            .negotiate(&request(vec![pc(1, "1.2.840.10008.1.1\0", &["1.2.840.10008.1.2\0"])]))
            .unwrap();
        assert_eq!(
            ac.presentation_contexts[0].reason,
            PresentationContextResultReason::Acceptance
        );
    }

    #[test]
    fn rejects_unsupported_protocol_version() {
        let policy = AcceptorPolicy::new().with_abstract_syntax(VERIFICATION);
        let mut rq = request(vec![pc(1, VERIFICATION, &[IMPLICIT_VR_LE])]);
        rq.protocol_version = 2;
        assert_eq!(
            rejection_source(policy.negotiate(&rq)),
            AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported
            )
        );
    }

    #[test]
    fn rejects_unknown_application_context() {
        let policy = AcceptorPolicy::new().with_abstract_syntax(VERIFICATION);
        let mut rq = request(vec![pc(1, VERIFICATION, &[IMPLICIT_VR_LE])]);
        rq.application_context_name = "1.2.3.4".to_string();
        assert_eq!(
            rejection_source(policy.negotiate(&rq)),
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported
            )
        );

        // unless it is registered
        let policy = policy.with_application_context("1.2.3.4", "1.2.3.4.1");
        let ac = policy.negotiate(&rq).unwrap();
        assert_eq!(ac.application_context_name, "1.2.3.4.1");
    }

    #[test]
    fn ae_title_allow_lists() {
        let policy = AcceptorPolicy::new()
            .with_abstract_syntax(VERIFICATION)
            .with_called_ae_title("STORE-SCP")
            .with_calling_ae_title("MODALITY");
        let mut rq = request(vec![pc(1, VERIFICATION, &[IMPLICIT_VR_LE])]);
        assert_eq!(
            rejection_source(policy.negotiate(&rq)),
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized
            )
        );
        rq.calling_ae_title = "MODALITY".to_string();
        assert!(policy.negotiate(&rq).is_ok());
        rq.called_ae_title = "OTHER".to_string();
        assert_eq!(
            rejection_source(policy.negotiate(&rq)),
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized
            )
        );
    }

    #[test]
    fn access_control_hook() {
        let policy = AcceptorPolicy::new()
            .ae_title("MAIN-SCP")
            .with_abstract_syntax(VERIFICATION)
            .ae_access_control(AcceptCalledAeTitle);
        let rq = request(vec![pc(1, VERIFICATION, &[IMPLICIT_VR_LE])]);
        assert_eq!(
            rejection_source(policy.negotiate(&rq)),
            AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized
            )
        );
        let policy = policy.ae_title("STORE-SCP");
        assert!(policy.negotiate(&rq).is_ok());
    }

    #[test]
    fn two_level_overrides() {
        let policy = AcceptorPolicy::new()
            .with_abstract_syntax(VERIFICATION)
            .with_calling_override(
                "STORE-SCU",
                AcceptorPolicy::new()
                    .with_transfer_syntaxes(CT_IMAGE_STORAGE, [EXPLICIT_VR_LE])
                    .with_called_override(
                        "ARCHIVE",
                        AcceptorPolicy::new().with_transfer_syntaxes(CT_IMAGE_STORAGE, [IMPLICIT_VR_LE]),
                    ),
            );

        let rq = request(vec![pc(1, CT_IMAGE_STORAGE, &[IMPLICIT_VR_LE, EXPLICIT_VR_LE])]);
        let ac = policy.negotiate(&rq).unwrap();
        assert_eq!(ac.presentation_contexts[0].transfer_syntax, EXPLICIT_VR_LE);

        let mut rq_archive = rq.clone();
        rq_archive.called_ae_title = "ARCHIVE".to_string();
        let ac = policy.negotiate(&rq_archive).unwrap();
        assert_eq!(ac.presentation_contexts[0].transfer_syntax, IMPLICIT_VR_LE);

        let mut rq_other = rq;
        rq_other.calling_ae_title = "OTHER-SCU".to_string();
        let ac = policy.negotiate(&rq_other).unwrap();
        assert_eq!(
            ac.presentation_contexts[0].reason,
            PresentationContextResultReason::AbstractSyntaxNotSupported
        );
    }

    #[rstest]
    #[case((1, 1), (0, 0), (1, 1))]
    #[case((0, 0), (5, 3), (3, 5))]
    #[case((2, 2), (2, 2), (2, 2))]
    #[case((10, 0), (4, 2), (2, 4))]
    #[case((0, 0), (0, 0), (0, 0))]
    fn async_window_is_elementwise_minimum(
        #[case] proposed: (u16, u16),
        #[case] local: (u16, u16),
        #[case] expected: (u16, u16),
    ) {
        let policy = AcceptorPolicy::new()
            .with_abstract_syntax(VERIFICATION)
            .async_operations_window(local.0, local.1);
        let mut rq = request(vec![pc(1, VERIFICATION, &[IMPLICIT_VR_LE])]);
        rq.user_variables
            .push(UserVariableItem::AsyncOperationsWindow(AsyncOperationsWindow::new(
                proposed.0, proposed.1,
            )));
        let ac = policy.negotiate(&rq).unwrap();
        assert_eq!(
            ac.async_operations_window(),
            Some(AsyncOperationsWindow::new(expected.0, expected.1))
        );
    }

    #[test]
    fn no_async_window_without_proposal() {
        let policy = AcceptorPolicy::new()
            .with_abstract_syntax(VERIFICATION)
            .async_operations_window(4, 4);
        let ac = policy
            .negotiate(&request(vec![pc(1, VERIFICATION, &[IMPLICIT_VR_LE])]))
            .unwrap();
        assert_eq!(ac.async_operations_window(), None);
    }

    #[test]
    fn role_selection_is_logical_and() {
        let policy = AcceptorPolicy::new()
            .with_abstract_syntax(CT_IMAGE_STORAGE)
            .with_role(CT_IMAGE_STORAGE, true, false);
        let mut rq = request(vec![pc(1, CT_IMAGE_STORAGE, &[IMPLICIT_VR_LE])]);
        rq.user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
            sop_class_uid: CT_IMAGE_STORAGE.to_string(),
            scu_role: true,
            scp_role: true,
        }));
        rq.user_variables.push(UserVariableItem::RoleSelection(RoleSelection {
            sop_class_uid: VERIFICATION.to_string(),
            scu_role: true,
            scp_role: true,
        }));
        let ac = policy.negotiate(&rq).unwrap();
        let roles: Vec<_> = ac
            .user_variables
            .iter()
            .filter_map(|item| match item {
                UserVariableItem::RoleSelection(role) => Some(role),
                _ => None,
            })
            .collect();
        assert_eq!(
            roles,
            vec![&RoleSelection {
                sop_class_uid: CT_IMAGE_STORAGE.to_string(),
                scu_role: true,
                scp_role: false,
            }]
        );
    }

    #[test]
    fn extended_negotiation_requires_handler() {
        let policy = AcceptorPolicy::new()
            .with_abstract_syntax(CT_IMAGE_STORAGE)
            .with_extended_negotiation(CT_IMAGE_STORAGE, |_: &str, info: &[u8]| {
                Some(info.iter().map(|b| b & 0x01).collect())
            });
        let mut rq = request(vec![pc(1, CT_IMAGE_STORAGE, &[IMPLICIT_VR_LE])]);
        rq.user_variables
            .push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                CT_IMAGE_STORAGE.to_string(),
                vec![3, 2],
            ));
        rq.user_variables
            .push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                VERIFICATION.to_string(),
                vec![1],
            ));
        let ac = policy.negotiate(&rq).unwrap();
        let items: Vec<_> = ac
            .user_variables
            .iter()
            .filter(|item| matches!(item, UserVariableItem::SopClassExtendedNegotiationSubItem(..)))
            .collect();
        assert_eq!(
            items,
            vec![&UserVariableItem::SopClassExtendedNegotiationSubItem(
                CT_IMAGE_STORAGE.to_string(),
                vec![1, 0]
            )]
        );
    }

    #[test]
    fn user_identity_negotiation() {
        let policy = AcceptorPolicy::new()
            .with_abstract_syntax(VERIFICATION)
            .user_identity_negotiator(|identity: Option<&UserIdentity>| match identity {
                Some(id) if id.primary_field() == b"alice" => Ok(Some(b"welcome".to_vec())),
                _ => Err(AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::NoReasonGiven,
                )),
            });

        let mut rq = request(vec![pc(1, VERIFICATION, &[IMPLICIT_VR_LE])]);
        assert!(policy.negotiate(&rq).is_err());

        rq.user_variables.push(UserVariableItem::UserIdentityItem(UserIdentity::new(
            true,
            UserIdentityType::Username,
            b"alice".to_vec(),
            vec![],
        )));
        let ac = policy.negotiate(&rq).unwrap();
        assert!(ac
            .user_variables
            .contains(&UserVariableItem::UserIdentityAc(b"welcome".to_vec())));

        let rq_bob = AssociationRQ {
            user_variables: vec![UserVariableItem::UserIdentityItem(UserIdentity::new(
                false,
                UserIdentityType::Username,
                b"bob".to_vec(),
                vec![],
            ))],
            ..rq
        };
        assert_eq!(
            rejection_source(policy.negotiate(&rq_bob)),
            AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven)
        );
    }

    #[test]
    fn accepts_nothing_without_abstract_syntaxes() {
        assert!(AcceptorPolicy::new().accepts_nothing());
        assert!(!AcceptorPolicy::new().promiscuous(true).accepts_nothing());
        assert!(!AcceptorPolicy::new()
            .with_calling_override("A", AcceptorPolicy::new().with_abstract_syntax(VERIFICATION))
            .accepts_nothing());
    }
}
