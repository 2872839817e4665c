//! This crate implements the DICOM upper layer protocol,
//! from the wire format up to the concurrent dispatch of DIMSE messages.
//!
//! The layers build on each other, leaf first:
//!
//! - The [`pdu`] module
//!   provides data structures representing _protocol data units_
//!   and their binary reader and writer.
//! - The [`association`] module
//!   comprises the association state machine,
//!   the acceptor policy for presentation context negotiation,
//!   and the requestor and acceptor association builders.
//! - The [`dimse`] module
//!   fragments and reassembles DIMSE messages
//!   (a command plus an optional data set)
//!   over P-DATA-TF PDUs.
//! - The [`service`] module
//!   runs an established association with a bounded worker pool,
//!   routing requests to registered services
//!   and correlating responses with their invocations.
//!
//! # Example
//!
//! ```no_run
//! # use dicom_ulp::association::client::ClientAssociationOptions;
//! # use dicom_ulp::service::{ActiveAssociation, DispatcherConfig, ServiceRegistry};
//! # use dicom_ulp::dimse::Command;
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let association = ClientAssociationOptions::new()
//!     .with_abstract_syntax("1.2.840.10008.1.1")
//!     .called_ae_title("ANY-SCP")
//!     .establish_tcp("127.0.0.1:104")?;
//!
//! let active = ActiveAssociation::start(
//!     association,
//!     ServiceRegistry::new(),
//!     DispatcherConfig::default(),
//! )?;
//! let response = active
//!     .invoke_future(1, Command::echo_rq(0), None)?
//!     .get()?;
//! println!("C-ECHO status: {:04X}H", response.command.status().unwrap_or(0xFFFF));
//! active.release(true)?;
//! # Ok(())
//! # }
//! ```

pub mod association;
pub mod dimse;
pub mod pdu;
pub mod service;

/// The default implementation class UID of this crate.
///
/// Automatically generated as per the standard, part 5, section B.2.
///
/// Associations take their implementation identifiers
/// as configuration, so this is only used when none is given.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.156227610253341005307660858504280353500";

/// The default implementation version name of this crate.
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-rs ULP 0.9";

// re-exports

pub use association::client::ClientAssociationOptions;
pub use association::policy::AcceptorPolicy;
pub use association::server::ServerAssociationOptions;
pub use association::{Association, State};
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
pub use service::{ActiveAssociation, FutureResponse};
