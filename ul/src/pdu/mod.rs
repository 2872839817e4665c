//! Protocol Data Unit module
//!
//! This module comprises the data structures representing
//! the protocol data units (PDUs) of the DICOM upper layer protocol
//! and their variable items,
//! as well as a [reader](reader) and a [writer](writer)
//! converting them from and to their binary form.
//!
//! PDUs and sub-items are closed variants:
//! decoding dispatches on the item type code,
//! and anything unrecognized is retained verbatim
//! in an `Unknown` variant instead of failing.
pub mod reader;
pub mod writer;

use std::fmt::Display;

pub use reader::{read_pdu, read_pdu_from_wire, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE, PDU_HEADER_SIZE};
pub use writer::{encode_pdu, write_pdu};

/// The DICOM application context name,
/// the only one defined by the standard.
pub const DICOM_APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// The maximum length of an application entity title, in characters.
pub const AE_TITLE_LENGTH: usize = 16;

/// The kind of a protocol data unit, identified by its type code.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PduType {
    /// A-ASSOCIATE-RQ (01H)
    AssociationRQ,
    /// A-ASSOCIATE-AC (02H)
    AssociationAC,
    /// A-ASSOCIATE-RJ (03H)
    AssociationRJ,
    /// P-DATA-TF (04H)
    PData,
    /// A-RELEASE-RQ (05H)
    ReleaseRQ,
    /// A-RELEASE-RP (06H)
    ReleaseRP,
    /// A-ABORT (07H)
    AbortRQ,
    /// Any other type code
    Unknown(u8),
}

impl PduType {
    /// Obtain the PDU type code as written on the wire.
    pub fn code(self) -> u8 {
        match self {
            PduType::AssociationRQ => 0x01,
            PduType::AssociationAC => 0x02,
            PduType::AssociationRJ => 0x03,
            PduType::PData => 0x04,
            PduType::ReleaseRQ => 0x05,
            PduType::ReleaseRP => 0x06,
            PduType::AbortRQ => 0x07,
            PduType::Unknown(code) => code,
        }
    }
}

impl Display for PduType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PduType::AssociationRQ => f.write_str("A-ASSOCIATE-RQ"),
            PduType::AssociationAC => f.write_str("A-ASSOCIATE-AC"),
            PduType::AssociationRJ => f.write_str("A-ASSOCIATE-RJ"),
            PduType::PData => f.write_str("P-DATA-TF"),
            PduType::ReleaseRQ => f.write_str("A-RELEASE-RQ"),
            PduType::ReleaseRP => f.write_str("A-RELEASE-RP"),
            PduType::AbortRQ => f.write_str("A-ABORT"),
            PduType::Unknown(code) => write!(f, "unknown PDU {:02X}H", code),
        }
    }
}

/// Message component for a proposed presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier
    pub id: u8,
    /// the expected abstract syntax UID
    /// (commonly referring to the expected SOP class)
    pub abstract_syntax: String,
    /// a list of transfer syntax UIDs to support in this interaction
    pub transfer_syntaxes: Vec<String>,
}

/// Message component for the outcome of a proposed presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub transfer_syntax: String,
}

/// A presentation context as seen after negotiation,
/// combining the proposal with its result.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextNegotiated {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

impl PresentationContextNegotiated {
    /// Whether the presentation context was accepted by the acceptor.
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub(crate) fn from(reason: u8) -> Option<PresentationContextResultReason> {
        let result = match reason {
            0 => PresentationContextResultReason::Acceptance,
            1 => PresentationContextResultReason::UserRejection,
            2 => PresentationContextResultReason::NoReason,
            3 => PresentationContextResultReason::AbstractSyntaxNotSupported,
            4 => PresentationContextResultReason::TransferSyntaxesNotSupported,
            _ => {
                return None;
            }
        };

        Some(result)
    }
}

impl Display for PresentationContextResultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            PresentationContextResultReason::Acceptance => "acceptance",
            PresentationContextResultReason::UserRejection => "user rejection",
            PresentationContextResultReason::NoReason => "no reason",
            PresentationContextResultReason::AbstractSyntaxNotSupported => {
                "abstract syntax not supported"
            }
            PresentationContextResultReason::TransferSyntaxesNotSupported => {
                "transfer syntaxes not supported"
            }
        };
        f.write_str(msg)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent = 1,
    Transient = 2,
}

impl AssociationRJResult {
    pub(crate) fn from(value: u8) -> Option<AssociationRJResult> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source of an association rejection, along with its reason.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderASCE(AssociationRJServiceProviderASCEReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub(crate) fn from(source: u8, reason: u8) -> Option<AssociationRJSource> {
        use AssociationRJServiceProviderPresentationReason as Presentation;
        use AssociationRJServiceUserReason as User;

        let result = match (source, reason) {
            (1, 1) => AssociationRJSource::ServiceUser(User::NoReasonGiven),
            (1, 2) => AssociationRJSource::ServiceUser(User::ApplicationContextNameNotSupported),
            (1, 3) => AssociationRJSource::ServiceUser(User::CallingAETitleNotRecognized),
            (1, 7) => AssociationRJSource::ServiceUser(User::CalledAETitleNotRecognized),
            (1, x @ 4..=6) | (1, x @ 8..=10) => {
                AssociationRJSource::ServiceUser(User::Reserved(x))
            }
            (2, 1) => AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::NoReasonGiven,
            ),
            (2, 2) => AssociationRJSource::ServiceProviderASCE(
                AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported,
            ),
            (3, 1) => AssociationRJSource::ServiceProviderPresentation(
                Presentation::TemporaryCongestion,
            ),
            (3, 2) => {
                AssociationRJSource::ServiceProviderPresentation(Presentation::LocalLimitExceeded)
            }
            (3, x @ 0) | (3, x @ 3..=7) => {
                AssociationRJSource::ServiceProviderPresentation(Presentation::Reserved(x))
            }
            _ => {
                return None;
            }
        };
        Some(result)
    }

    /// The source and reason codes, as written on the wire.
    pub fn codes(&self) -> (u8, u8) {
        match self {
            AssociationRJSource::ServiceUser(reason) => {
                let code = match reason {
                    AssociationRJServiceUserReason::NoReasonGiven => 1,
                    AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 2,
                    AssociationRJServiceUserReason::CallingAETitleNotRecognized => 3,
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized => 7,
                    AssociationRJServiceUserReason::Reserved(code) => *code,
                };
                (1, code)
            }
            AssociationRJSource::ServiceProviderASCE(reason) => {
                let code = match reason {
                    AssociationRJServiceProviderASCEReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported => 2,
                };
                (2, code)
            }
            AssociationRJSource::ServiceProviderPresentation(reason) => {
                let code = match reason {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(code) => *code,
                };
                (3, code)
            }
        }
    }
}

impl Display for AssociationRJSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJSource::ServiceUser(r) => write!(f, "service user: {}", r),
            AssociationRJSource::ServiceProviderASCE(r) => {
                write!(f, "service provider (ACSE): {}", r)
            }
            AssociationRJSource::ServiceProviderPresentation(r) => {
                write!(f, "service provider (presentation): {}", r)
            }
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

impl Display for AssociationRJServiceUserReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceUserReason::NoReasonGiven => f.write_str("no reason given"),
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                f.write_str("application context name not supported")
            }
            AssociationRJServiceUserReason::CallingAETitleNotRecognized => {
                f.write_str("calling AE title not recognized")
            }
            AssociationRJServiceUserReason::CalledAETitleNotRecognized => {
                f.write_str("called AE title not recognized")
            }
            AssociationRJServiceUserReason::Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderASCEReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

impl Display for AssociationRJServiceProviderASCEReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceProviderASCEReason::NoReasonGiven => f.write_str("no reason given"),
            AssociationRJServiceProviderASCEReason::ProtocolVersionNotSupported => {
                f.write_str("protocol version not supported")
            }
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

impl Display for AssociationRJServiceProviderPresentationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                f.write_str("temporary congestion")
            }
            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                f.write_str("local limit exceeded")
            }
            AssociationRJServiceProviderPresentationReason::Reserved(code) => {
                write!(f, "reserved code {}", code)
            }
        }
    }
}

/// A presentation data value (PDV),
/// one fragment of a command or data set inside a P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

impl PDataValue {
    /// The message control header byte of this value.
    pub fn control_header(&self) -> u8 {
        let mut header = 0;
        if self.value_type == PDataValueType::Command {
            header |= 0x01;
        }
        if self.is_last {
            header |= 0x02;
        }
        header
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source of an A-ABORT, along with the reason if given by the provider.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    pub(crate) fn from(source: u8, reason: u8) -> Option<AbortRQSource> {
        use AbortRQServiceProviderReason::*;
        let result = match (source, reason) {
            (0, _) => AbortRQSource::ServiceUser,
            (1, _) => AbortRQSource::Reserved,
            (2, 0) => AbortRQSource::ServiceProvider(ReasonNotSpecified),
            (2, 1) => AbortRQSource::ServiceProvider(UnrecognizedPdu),
            (2, 2) => AbortRQSource::ServiceProvider(UnexpectedPdu),
            (2, 3) => AbortRQSource::ServiceProvider(Reserved),
            (2, 4) => AbortRQSource::ServiceProvider(UnrecognizedPduParameter),
            (2, 5) => AbortRQSource::ServiceProvider(UnexpectedPduParameter),
            (2, 6) => AbortRQSource::ServiceProvider(InvalidPduParameter),
            (_, _) => {
                return None;
            }
        };

        Some(result)
    }

    /// The source and reason codes, as written on the wire.
    pub fn codes(&self) -> (u8, u8) {
        use AbortRQServiceProviderReason::*;
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(reason) => {
                let code = match reason {
                    ReasonNotSpecified => 0,
                    UnrecognizedPdu => 1,
                    UnexpectedPdu => 2,
                    Reserved => 3,
                    UnrecognizedPduParameter => 4,
                    UnexpectedPduParameter => 5,
                    InvalidPduParameter => 6,
                };
                (2, code)
            }
        }
    }
}

impl Display for AbortRQSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortRQSource::ServiceUser => f.write_str("service user"),
            AbortRQSource::ServiceProvider(reason) => write!(f, "service provider: {}", reason),
            AbortRQSource::Reserved => f.write_str("reserved source"),
        }
    }
}

/// An enumeration of supported A-ABORT PDU provider reasons.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    /// Reason Not Specified
    ReasonNotSpecified,
    /// Unrecognized PDU
    UnrecognizedPdu,
    /// Unexpected PDU
    UnexpectedPdu,
    /// Reserved
    Reserved,
    /// Unrecognized PDU parameter
    UnrecognizedPduParameter,
    /// Unexpected PDU parameter
    UnexpectedPduParameter,
    /// Invalid PDU parameter
    InvalidPduParameter,
}

impl Display for AbortRQServiceProviderReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            AbortRQServiceProviderReason::ReasonNotSpecified => "reason not specified",
            AbortRQServiceProviderReason::UnrecognizedPdu => "unrecognized PDU",
            AbortRQServiceProviderReason::UnexpectedPdu => "unexpected PDU",
            AbortRQServiceProviderReason::Reserved => "reserved code",
            AbortRQServiceProviderReason::UnrecognizedPduParameter => "unrecognized PDU parameter",
            AbortRQServiceProviderReason::UnexpectedPduParameter => "unexpected PDU parameter",
            AbortRQServiceProviderReason::InvalidPduParameter => "invalid PDU parameter value",
        };
        f.write_str(msg)
    }
}

/// A variable item of an association request or acknowledgement.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    /// Unrecognized sub-item, kept as its type code and raw content
    Unknown(u8, Vec<u8>),
    /// Maximum length received (51H)
    MaxLength(u32),
    /// Implementation class UID (52H)
    ImplementationClassUID(String),
    /// Asynchronous operations window (53H)
    AsyncOperationsWindow(AsyncOperationsWindow),
    /// SCP/SCU role selection (54H)
    RoleSelection(RoleSelection),
    /// Implementation version name (55H)
    ImplementationVersionName(String),
    /// SOP class extended negotiation (56H):
    /// SOP class UID and service class application information
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    /// SOP class common extended negotiation (57H)
    SopClassCommonExtendedNegotiationSubItem(CommonExtendedNegotiation),
    /// User identity negotiation request (58H)
    UserIdentityItem(UserIdentity),
    /// User identity negotiation response (59H):
    /// the server response, empty if none
    UserIdentityAc(Vec<u8>),
}

/// Maximum number of asynchronous operations
/// which may be invoked and performed over one association.
///
/// A value of 0 means the number is not limited.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct AsyncOperationsWindow {
    pub max_operations_invoked: u16,
    pub max_operations_performed: u16,
}

impl AsyncOperationsWindow {
    pub fn new(max_operations_invoked: u16, max_operations_performed: u16) -> Self {
        AsyncOperationsWindow {
            max_operations_invoked,
            max_operations_performed,
        }
    }

    /// The window in effect when none was negotiated:
    /// one operation at a time in each direction.
    pub const fn synchronous() -> Self {
        AsyncOperationsWindow {
            max_operations_invoked: 1,
            max_operations_performed: 1,
        }
    }

    /// The same window as seen from the other peer,
    /// with the invoked and performed counts swapped.
    pub fn reversed(self) -> Self {
        AsyncOperationsWindow {
            max_operations_invoked: self.max_operations_performed,
            max_operations_performed: self.max_operations_invoked,
        }
    }
}

impl Default for AsyncOperationsWindow {
    fn default() -> Self {
        Self::synchronous()
    }
}

/// SCP/SCU role selection for one SOP class.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct RoleSelection {
    pub sop_class_uid: String,
    pub scu_role: bool,
    pub scp_role: bool,
}

/// SOP class common extended negotiation.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct CommonExtendedNegotiation {
    pub sop_class_uid: String,
    pub service_class_uid: String,
    pub related_general_sop_class_uids: Vec<String>,
}

#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
#[non_exhaustive]
pub enum UserIdentityType {
    Username,
    UsernamePassword,
    KerberosServiceTicket,
    SamlAssertion,
    Jwt,
}

impl UserIdentityType {
    pub(crate) fn from(user_identity_type: u8) -> Option<Self> {
        match user_identity_type {
            1 => Some(Self::Username),
            2 => Some(Self::UsernamePassword),
            3 => Some(Self::KerberosServiceTicket),
            4 => Some(Self::SamlAssertion),
            5 => Some(Self::Jwt),
            _ => None,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Username => 1,
            Self::UsernamePassword => 2,
            Self::KerberosServiceTicket => 3,
            Self::SamlAssertion => 4,
            Self::Jwt => 5,
        }
    }
}

/// An in-memory representation of a full Protocol Data Unit (PDU).
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub enum Pdu {
    /// Unrecognized PDU type
    Unknown { pdu_type: u8, data: Vec<u8> },
    /// Association request (A-ASSOCIATION-RQ)
    AssociationRQ(AssociationRQ),
    /// Association acknowledgement (A-ASSOCIATION-AC)
    AssociationAC(AssociationAC),
    /// Association rejection (A-ASSOCIATION-RJ)
    AssociationRJ(AssociationRJ),
    /// P-Data
    PData { data: Vec<PDataValue> },
    /// Association release request (A-RELEASE-RQ)
    ReleaseRQ,
    /// Association release reply (A-RELEASE-RP)
    ReleaseRP,
    /// Association abort request (A-ABORT-RQ)
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// The kind of this PDU.
    pub fn pdu_type(&self) -> PduType {
        match self {
            Pdu::Unknown { pdu_type, .. } => PduType::Unknown(*pdu_type),
            Pdu::AssociationRQ(_) => PduType::AssociationRQ,
            Pdu::AssociationAC(_) => PduType::AssociationAC,
            Pdu::AssociationRJ(_) => PduType::AssociationRJ,
            Pdu::PData { .. } => PduType::PData,
            Pdu::ReleaseRQ => PduType::ReleaseRQ,
            Pdu::ReleaseRP => PduType::ReleaseRP,
            Pdu::AbortRQ { .. } => PduType::AbortRQ,
        }
    }

    /// Provide a short description of the PDU.
    pub fn short_description(&self) -> impl std::fmt::Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl std::fmt::Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::Unknown { pdu_type, data } => {
                write!(
                    f,
                    "Unknown {{pdu_type: {}, data: {} bytes }}",
                    pdu_type,
                    data.len()
                )
            }
            Pdu::AssociationRQ(rq) => write!(
                f,
                "AssociationRQ {{ {} -> {}, {} presentation contexts }}",
                rq.calling_ae_title,
                rq.called_ae_title,
                rq.presentation_contexts.len()
            ),
            Pdu::AssociationAC(ac) => write!(
                f,
                "AssociationAC {{ {} -> {}, {} presentation contexts }}",
                ac.calling_ae_title,
                ac.called_ae_title,
                ac.presentation_contexts.len()
            ),
            Pdu::AssociationRJ { .. }
            | Pdu::ReleaseRQ
            | Pdu::ReleaseRP
            | Pdu::AbortRQ { .. } => std::fmt::Debug::fmt(self.0, f),
            Pdu::PData { data } => {
                if data.len() == 1 {
                    write!(
                        f,
                        "PData [({:?}, {} bytes)]",
                        data[0].value_type,
                        data[0].data.len()
                    )
                } else if data.len() == 2 {
                    write!(
                        f,
                        "PData [({:?}, {} bytes), ({:?}, {} bytes)]",
                        data[0].value_type,
                        data[0].data.len(),
                        data[1].value_type,
                        data[1].data.len(),
                    )
                } else {
                    write!(f, "PData [{} p-data values]", data.len())
                }
            }
        }
    }
}

/// An in-memory representation of an association request
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl AssociationRQ {
    /// The maximum PDU length which the requestor is willing to receive,
    /// if declared.
    pub fn max_pdu_length(&self) -> Option<u32> {
        max_length_of(&self.user_variables)
    }

    /// The asynchronous operations window proposed by the requestor, if any.
    pub fn async_operations_window(&self) -> Option<AsyncOperationsWindow> {
        async_window_of(&self.user_variables)
    }

    /// The user identity negotiation request, if any.
    pub fn user_identity(&self) -> Option<&UserIdentity> {
        self.user_variables.iter().find_map(|item| match item {
            UserVariableItem::UserIdentityItem(identity) => Some(identity),
            _ => None,
        })
    }
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An in-memory representation of an association acknowledgement
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl AssociationAC {
    /// The maximum PDU length which the acceptor is willing to receive,
    /// if declared.
    pub fn max_pdu_length(&self) -> Option<u32> {
        max_length_of(&self.user_variables)
    }

    /// The asynchronous operations window granted by the acceptor, if any.
    pub fn async_operations_window(&self) -> Option<AsyncOperationsWindow> {
        async_window_of(&self.user_variables)
    }
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// An in-memory representation of an association rejection.
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl AssociationRJ {
    /// A permanent rejection from the given source.
    pub fn permanent(source: AssociationRJSource) -> Self {
        AssociationRJ {
            result: AssociationRJResult::Permanent,
            source,
        }
    }
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

fn max_length_of(items: &[UserVariableItem]) -> Option<u32> {
    items.iter().find_map(|item| match item {
        UserVariableItem::MaxLength(len) => Some(*len),
        _ => None,
    })
}

fn async_window_of(items: &[UserVariableItem]) -> Option<AsyncOperationsWindow> {
    items.iter().find_map(|item| match item {
        UserVariableItem::AsyncOperationsWindow(window) => Some(*window),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use crate::pdu::{PDataValue, PDataValueType};

    use super::*;

    #[test]
    fn pdu_short_description() {
        let pdu = Pdu::AbortRQ {
            source: super::AbortRQSource::ServiceUser,
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "AbortRQ { source: ServiceUser }",
        );

        let pdu = Pdu::PData {
            data: vec![PDataValue {
                is_last: true,
                presentation_context_id: 2,
                value_type: PDataValueType::Data,
                data: vec![0x55; 384],
            }],
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "PData [(Data, 384 bytes)]",
        );
    }

    #[test]
    fn reject_source_codes_are_consistent() {
        for source in 1..=3 {
            for reason in 0..=10 {
                if let Some(rj) = AssociationRJSource::from(source, reason) {
                    assert_eq!(rj.codes(), (source, reason));
                }
            }
        }
    }

    #[test]
    fn abort_source_codes_are_consistent() {
        for reason in 0..=6 {
            let source = AbortRQSource::from(2, reason).unwrap();
            assert_eq!(source.codes(), (2, reason));
        }
        assert_eq!(AbortRQSource::from(0, 5), Some(AbortRQSource::ServiceUser));
        assert_eq!(AbortRQSource::from(2, 7), None);
    }

    #[test]
    fn pdv_control_header() {
        let mut pdv = PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Command,
            is_last: true,
            data: vec![],
        };
        assert_eq!(pdv.control_header(), 0x03);
        pdv.value_type = PDataValueType::Data;
        assert_eq!(pdv.control_header(), 0x02);
        pdv.is_last = false;
        assert_eq!(pdv.control_header(), 0x00);
    }
}
