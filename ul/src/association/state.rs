//! Association state machine tables.
//!
//! Each state declares which PDU kinds may be received and sent,
//! and which state follows.
//! Anything outside of these tables is a protocol violation
//! (when receiving) or a misuse of the API (when sending).
use std::fmt;

use crate::pdu::PduType;

/// The side of the association held by this application entity.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Role {
    /// The node which requested the association
    Requestor,
    /// The node which accepted the association
    Acceptor,
}

/// The state of an association.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum State {
    /// No association, the transport connection is closed
    Idle,
    /// Requestor: transport open, association request not sent yet
    AwaitingTransportOpen,
    /// Requestor: association request sent, waiting for the acceptor's answer
    AwaitingAssociateResponse,
    /// Acceptor: transport open, waiting for the association request
    AwaitingAssociateRequest,
    /// Acceptor: association request received, decision pending
    AwaitingLocalAssociateResponse,
    /// Ready for data transfer in both directions
    Established,
    /// Release requested locally, waiting for the peer's release response
    AwaitingReleaseResponse,
    /// Release requested by the peer, local response pending
    AwaitingLocalReleaseResponse,
    /// Release collision, requestor side: local release response pending
    RequestorAwaitingLocalResponse,
    /// Release collision, acceptor side: waiting for the peer's release response
    AcceptorAwaitingReadResponse,
    /// Release collision, requestor side: waiting for the peer's release response
    RequestorAwaitingReadResponse,
    /// Release collision, acceptor side: local release response pending
    AcceptorAwaitingWriteResponse,
    /// Closing the transport connection after a grace delay
    Terminating,
}

impl State {
    /// The initial state of a new association on an open transport.
    pub fn initial(role: Role) -> Self {
        match role {
            Role::Requestor => State::AwaitingTransportOpen,
            Role::Acceptor => State::AwaitingAssociateRequest,
        }
    }

    /// Whether the association is ready to transfer DIMSE messages.
    pub fn is_established(self) -> bool {
        self == State::Established
    }

    /// Whether P-DATA-TF PDUs may be received in this state.
    pub fn can_receive_data(self) -> bool {
        // P-DATA transitions do not depend on the role
        self.on_receive(Role::Requestor, PduType::PData).is_some()
    }

    /// Whether P-DATA-TF PDUs may be sent in this state.
    pub fn can_send_data(self) -> bool {
        matches!(
            self,
            State::Established | State::AwaitingLocalReleaseResponse
        )
    }

    /// Whether the association is closed or about to be.
    pub fn is_closing(self) -> bool {
        matches!(self, State::Terminating | State::Idle)
    }

    /// Whether association negotiation is still taking place.
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            State::AwaitingTransportOpen
                | State::AwaitingAssociateResponse
                | State::AwaitingAssociateRequest
                | State::AwaitingLocalAssociateResponse
        )
    }

    /// The state which follows from receiving a PDU of the given kind,
    /// or `None` if the PDU may not be received in this state.
    pub fn on_receive(self, role: Role, pdu_type: PduType) -> Option<State> {
        use PduType::*;
        use State::*;

        if let AbortRQ = pdu_type {
            return match self {
                Idle | Terminating => None,
                _ => Some(Terminating),
            };
        }

        match (self, pdu_type) {
            (AwaitingAssociateRequest, AssociationRQ) => Some(AwaitingLocalAssociateResponse),
            (AwaitingAssociateResponse, AssociationAC) => Some(Established),
            (AwaitingAssociateResponse, AssociationRJ) => Some(Terminating),
            (Established, PData) => Some(Established),
            (Established, ReleaseRQ) => Some(AwaitingLocalReleaseResponse),
            (AwaitingReleaseResponse, PData) => Some(AwaitingReleaseResponse),
            (AwaitingReleaseResponse, ReleaseRP) => Some(Terminating),
            (AwaitingReleaseResponse, ReleaseRQ) => match role {
                Role::Requestor => Some(RequestorAwaitingLocalResponse),
                Role::Acceptor => Some(AcceptorAwaitingReadResponse),
            },
            (AcceptorAwaitingReadResponse, ReleaseRP) => Some(AcceptorAwaitingWriteResponse),
            (RequestorAwaitingReadResponse, ReleaseRP) => Some(Terminating),
            _ => None,
        }
    }

    /// The state which follows from sending a PDU of the given kind,
    /// or `None` if the PDU may not be sent in this state.
    pub fn on_send(self, pdu_type: PduType) -> Option<State> {
        use PduType::*;
        use State::*;

        if let AbortRQ = pdu_type {
            return match self {
                Idle | Terminating => None,
                _ => Some(Terminating),
            };
        }

        match (self, pdu_type) {
            (AwaitingTransportOpen, AssociationRQ) => Some(AwaitingAssociateResponse),
            (AwaitingLocalAssociateResponse, AssociationAC) => Some(Established),
            (AwaitingLocalAssociateResponse, AssociationRJ) => Some(Terminating),
            (Established, PData) => Some(Established),
            (Established, ReleaseRQ) => Some(AwaitingReleaseResponse),
            (AwaitingLocalReleaseResponse, PData) => Some(AwaitingLocalReleaseResponse),
            (AwaitingLocalReleaseResponse, ReleaseRP) => Some(Terminating),
            (RequestorAwaitingLocalResponse, ReleaseRP) => Some(RequestorAwaitingReadResponse),
            (AcceptorAwaitingWriteResponse, ReleaseRP) => Some(Terminating),
            _ => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
