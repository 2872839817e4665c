//! DIMSE message writer.
use std::io::Write;
use std::sync::MutexGuard;

use snafu::{ensure, IntoError, ResultExt};
use tracing::trace;

use crate::association::{lock, Association};
use crate::pdu::{PDataValue, PDataValueType, Pdu};

use super::{
    AssociationSnafu, Command, DataSource, PresentationContextNotAcceptedSnafu, Result,
    WriteDataSnafu,
};

/// Bytes taken by a PDV besides its data:
/// item length, presentation context ID and message control header.
const PDV_HEADER_SIZE: usize = 6;

/// A P-Data value writer.
///
/// This exposes an API to iteratively construct and send
/// the fragments of one DIMSE message.
/// Using this as a [standard writer](std::io::Write)
/// will automatically split the incoming bytes
/// into separate PDVs and PDUs if they do not fit in a single one.
///
/// The writer holds the message write lock of the association,
/// so that fragments of different messages are never interleaved.
/// Each logical unit (the command, then the data set)
/// is started with [`begin`](Self::begin) and closed with [`end`](Self::end),
/// which marks the last fragment.
///
/// In pack mode, a closed command fragment is kept in the pending PDU,
/// so that the first data fragment can share it.
/// Otherwise, each logical unit ends its PDU.
#[must_use]
pub struct PDataWriter<'a> {
    association: &'a Association,
    _guard: MutexGuard<'a, ()>,
    presentation_context_id: u8,
    /// the maximum PDU length admitted by the peer
    max_pdu_length: usize,
    pack: bool,
    /// complete PDVs waiting to be sent in the same PDU
    pending: Vec<PDataValue>,
    /// bytes taken by the pending PDVs
    pending_len: usize,
    value_type: PDataValueType,
    /// data of the PDV in progress
    buffer: Vec<u8>,
    /// the last association error, kept while writing through `std::io`
    error: Option<crate::association::Error>,
}

impl<'a> PDataWriter<'a> {
    /// Prepare to write one message to the given presentation context,
    /// waiting for any other message being written to finish.
    pub fn new(association: &'a Association, presentation_context_id: u8, pack: bool) -> Self {
        let guard = lock(&association.outgoing);
        let max_pdu_length = association.peer_max_pdu_length() as usize;
        PDataWriter {
            association,
            _guard: guard,
            presentation_context_id,
            max_pdu_length,
            pack,
            pending: Vec::new(),
            pending_len: 0,
            value_type: PDataValueType::Command,
            buffer: Vec::new(),
            error: None,
        }
    }

    /// Start a new logical unit of the given type.
    pub fn begin(&mut self, value_type: PDataValueType) {
        debug_assert!(self.buffer.is_empty());
        self.value_type = value_type;
    }

    /// Bytes which can still be added to the PDV in progress
    /// without surpassing the maximum PDU length.
    fn capacity(&self) -> usize {
        self.max_pdu_length
            .saturating_sub(self.pending_len + PDV_HEADER_SIZE + self.buffer.len())
    }

    /// Move the PDV in progress to the pending PDU.
    fn close_pdv(&mut self, is_last: bool) {
        let data = std::mem::take(&mut self.buffer);
        self.pending_len += PDV_HEADER_SIZE + data.len();
        self.pending.push(PDataValue {
            presentation_context_id: self.presentation_context_id,
            value_type: self.value_type,
            is_last,
            data,
        });
    }

    /// Send the pending PDU, if any.
    fn send_pending(&mut self) -> Result<(), crate::association::Error> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.pending);
        self.pending_len = 0;
        trace!("Sending P-DATA-TF with {} PDVs", data.len());
        self.association.send(&Pdu::PData { data })
    }

    /// Close the logical unit in progress,
    /// marking its last fragment.
    pub fn end(&mut self) -> Result<()> {
        self.close_pdv(true);
        if !self.pack || self.value_type == PDataValueType::Data {
            self.send_pending().context(AssociationSnafu)?;
        }
        Ok(())
    }

    /// Send anything still pending.
    pub fn finish(mut self) -> Result<()> {
        self.send_pending().context(AssociationSnafu)
    }

    /// Convert an I/O error from this writer
    /// back to the association error which caused it, if any.
    fn take_error(&mut self, e: std::io::Error) -> super::Error {
        match self.error.take() {
            Some(source) => AssociationSnafu.into_error(source),
            None => WriteDataSnafu.into_error(e),
        }
    }
}

impl Write for PDataWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut capacity = self.capacity();
        if capacity == 0 {
            // the fragment in progress is full,
            // only now is it known not to be the last one
            if !self.buffer.is_empty() {
                self.close_pdv(false);
            }
            if let Err(e) = self.send_pending() {
                let io_error = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
                self.error = Some(e);
                return Err(io_error);
            }
            capacity = self.capacity();
        }
        let n = buf.len().min(capacity);
        self.buffer.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // fragments are only sent when full or closed
        Ok(())
    }
}

/// Write a DIMSE message to the given presentation context.
///
/// The command's data set type is adjusted
/// to whether a data source is given.
/// Data is pulled from the source and fragmented as it is produced.
pub fn write_message(
    association: &Association,
    presentation_context_id: u8,
    command: &Command,
    data: Option<&mut dyn DataSource>,
    pack: bool,
) -> Result<()> {
    ensure!(
        association
            .presentation_context(presentation_context_id)
            .map_or(false, |pc| pc.is_accepted()),
        PresentationContextNotAcceptedSnafu {
            id: presentation_context_id
        }
    );

    let mut command = command.clone();
    command.set_data_set_present(data.is_some());
    let command_data = command.encode()?;

    let mut writer = PDataWriter::new(association, presentation_context_id, pack);
    writer.begin(PDataValueType::Command);
    if let Err(e) = writer.write_all(&command_data) {
        return Err(writer.take_error(e));
    }
    writer.end()?;

    if let Some(data) = data {
        writer.begin(PDataValueType::Data);
        if let Err(e) = data.write_to(&mut writer) {
            return Err(writer.take_error(e));
        }
        writer.end()?;
    }
    writer.finish()
}
