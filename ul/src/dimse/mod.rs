//! DIMSE message framing.
//!
//! A DIMSE message is a [command](Command) optionally followed by a data set,
//! each one split into presentation data values (PDVs)
//! carried by P-DATA-TF PDUs.
//! This module provides the [writer](writer) fragmenting messages
//! to the peer's maximum PDU length,
//! and the [reader](reader) reassembling them,
//! with the data set exposed as a pull source
//! so that it does not need to be buffered in full.
pub mod command;
pub mod reader;
pub mod writer;

use std::io::Write;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{Backtrace, OptionExt, ResultExt, Snafu};

pub use command::{Command, CommandField, Status};
pub use reader::{DataSetReader, DimseReader, Incoming};
pub use writer::{write_message, PDataWriter};

use crate::association::uid::trim_uid_str;
use crate::pdu::PDataValueType;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// association failure
    Association {
        #[snafu(backtrace)]
        source: crate::association::Error,
    },

    /// failed to encode command set
    EncodeCommand {
        source: dicom_object::WriteError,
        backtrace: Backtrace,
    },

    /// failed to decode command set
    DecodeCommand {
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "unexpected {:?} fragment on presentation context {} (expected {:?} on {})",
        value_type,
        presentation_context_id,
        expected_value_type,
        expected_presentation_context_id
    ))]
    UnexpectedFragment {
        value_type: PDataValueType,
        presentation_context_id: u8,
        expected_value_type: PDataValueType,
        expected_presentation_context_id: u8,
        backtrace: Backtrace,
    },

    /// association released in the middle of a message
    ReleasedMidMessage { backtrace: Backtrace },

    #[snafu(display("presentation context {} is not accepted", id))]
    PresentationContextNotAccepted { id: u8, backtrace: Backtrace },

    /// failed to write data set
    WriteData {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("unsupported transfer syntax {}", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    /// failed to decode data set
    DecodeDataSet {
        source: dicom_object::ReadError,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A producer of data set bytes,
/// written in the transfer syntax of the presentation context.
///
/// Implemented for byte vectors and slices.
/// Large data sets can be streamed from elsewhere
/// by implementing this trait.
pub trait DataSource {
    /// Write the whole data set to the given writer.
    fn write_to(&mut self, out: &mut dyn Write) -> std::io::Result<()>;
}

impl DataSource for Vec<u8> {
    fn write_to(&mut self, out: &mut dyn Write) -> std::io::Result<()> {
        out.write_all(self)
    }
}

impl DataSource for &[u8] {
    fn write_to(&mut self, out: &mut dyn Write) -> std::io::Result<()> {
        out.write_all(self)
    }
}

/// A data source encoding an in-memory DICOM object
/// with the given transfer syntax.
pub struct ObjectSource<'a> {
    obj: &'a InMemDicomObject,
    transfer_syntax_uid: &'a str,
}

impl<'a> ObjectSource<'a> {
    pub fn new(obj: &'a InMemDicomObject, transfer_syntax_uid: &'a str) -> Self {
        ObjectSource {
            obj,
            transfer_syntax_uid,
        }
    }
}

impl DataSource for ObjectSource<'_> {
    fn write_to(&mut self, out: &mut dyn Write) -> std::io::Result<()> {
        let uid = trim_uid_str(self.transfer_syntax_uid);
        let ts = TransferSyntaxRegistry.get(uid).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported transfer syntax {}", uid),
            )
        })?;
        self.obj
            .write_dataset_with_ts(out, ts)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

/// A complete DIMSE message, with its data set fully read.
#[derive(Debug, Clone, PartialEq)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: Command,
    /// the encoded data set, if any
    pub data: Option<Vec<u8>>,
}

impl DimseMessage {
    /// Decode the data set with the given transfer syntax,
    /// usually the one accepted for the message's presentation context.
    pub fn decode_data_set(&self, transfer_syntax_uid: &str) -> Result<Option<InMemDicomObject>> {
        let data = match &self.data {
            Some(data) => data,
            None => return Ok(None),
        };
        let uid = trim_uid_str(transfer_syntax_uid);
        let ts = TransferSyntaxRegistry
            .get(uid)
            .context(UnsupportedTransferSyntaxSnafu { uid })?;
        InMemDicomObject::read_dataset_with_ts(data.as_slice(), ts)
            .context(DecodeDataSetSnafu)
            .map(Some)
    }
}
