//! DIMSE message reader.
use std::collections::VecDeque;
use std::io::Read;
use std::sync::MutexGuard;

use snafu::ResultExt;
use tracing::{debug, warn};

use crate::association::{lock, Association, UnexpectedPduSnafu};
use crate::pdu::{AbortRQServiceProviderReason, AbortRQSource, PDataValue, PDataValueType, Pdu};

use super::{
    AssociationSnafu, Command, DimseMessage, ReleasedMidMessageSnafu, Result,
    UnexpectedFragmentSnafu,
};

/// What was read from the association.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// The command of a DIMSE message
    Message {
        presentation_context_id: u8,
        command: Command,
    },
    /// The peer requested to release the association,
    /// a release response is due
    ReleaseRequested,
    /// The association was released
    Released,
}

/// Outcome of waiting for the next fragment.
enum Fragment {
    Value(PDataValue),
    ReleaseRequested,
    Released,
}

/// Pull the next PDV out of the queue,
/// receiving a new P-DATA-TF PDU when the queue is empty.
///
/// The first fragment of a message is awaited
/// with the timeout of the association state (the idle timeout),
/// the following ones with the DIMSE timeout.
fn next_fragment(
    association: &Association,
    queue: &mut VecDeque<PDataValue>,
    first: bool,
) -> Result<Fragment, crate::association::Error> {
    loop {
        if let Some(pdv) = queue.pop_front() {
            return Ok(Fragment::Value(pdv));
        }
        let pdu = if first {
            association.receive()?
        } else {
            association.receive_timeout(association.config().dimse_timeout)?
        };
        match pdu {
            Pdu::PData { data } => queue.extend(data),
            Pdu::ReleaseRQ => return Ok(Fragment::ReleaseRequested),
            Pdu::ReleaseRP => return Ok(Fragment::Released),
            // anything else is refused by the state machine
            pdu => {
                return UnexpectedPduSnafu {
                    state: association.state(),
                    pdu_type: pdu.pdu_type(),
                }
                .fail()
            }
        }
    }
}

/// Take the next fragment of a message in progress,
/// aborting the association if it does not continue the message.
fn continuation(
    association: &Association,
    queue: &mut VecDeque<PDataValue>,
    value_type: PDataValueType,
    presentation_context_id: u8,
) -> Result<PDataValue> {
    let pdv = match next_fragment(association, queue, false).context(AssociationSnafu)? {
        Fragment::Value(pdv) => pdv,
        Fragment::ReleaseRequested | Fragment::Released => {
            association.abort_with(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            ));
            return ReleasedMidMessageSnafu.fail();
        }
    };
    if pdv.value_type != value_type || pdv.presentation_context_id != presentation_context_id {
        return Err(framing_violation(
            association,
            &pdv,
            value_type,
            presentation_context_id,
        ));
    }
    Ok(pdv)
}

/// Abort the association over a framing violation.
fn framing_violation(
    association: &Association,
    pdv: &PDataValue,
    expected_value_type: PDataValueType,
    expected_presentation_context_id: u8,
) -> super::Error {
    warn!(
        "Unexpected {:?} fragment on presentation context {}, aborting",
        pdv.value_type, pdv.presentation_context_id
    );
    association.abort_with(AbortRQSource::ServiceProvider(
        AbortRQServiceProviderReason::UnexpectedPduParameter,
    ));
    UnexpectedFragmentSnafu {
        value_type: pdv.value_type,
        presentation_context_id: pdv.presentation_context_id,
        expected_value_type,
        expected_presentation_context_id,
    }
    .build()
}

/// Reader of DIMSE messages from an association.
///
/// Holds the message read lock of the association,
/// so that only one thread consumes fragments at a time.
/// The lock can be handed over to a [`DataSetReader`]
/// to stream the data set of the message just read,
/// or released by dropping the reader,
/// after which another thread may read the next message.
///
/// A data set left unread when the reader is dropped is drained.
pub struct DimseReader<'a> {
    association: &'a Association,
    queue: Option<MutexGuard<'a, VecDeque<PDataValue>>>,
    /// presentation context of a data set due next
    data_set: Option<u8>,
}

impl<'a> DimseReader<'a> {
    /// Wait for the message read lock of the association.
    pub fn new(association: &'a Association) -> Self {
        DimseReader {
            association,
            queue: Some(lock(&association.incoming)),
            data_set: None,
        }
    }

    fn queue(&mut self) -> &mut VecDeque<PDataValue> {
        self.queue
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("read lock is only released on consumption"))
    }

    /// Read the command of the next message.
    ///
    /// If the command announces a data set,
    /// it must be read with [`read_data_set`](Self::read_data_set)
    /// or [`into_data_set`](Self::into_data_set),
    /// or it will be discarded.
    pub fn read_command(&mut self) -> Result<Incoming> {
        self.discard_data_set()?;
        let association = self.association;

        let first = match next_fragment(association, self.queue(), true)
            .context(AssociationSnafu)?
        {
            Fragment::Value(pdv) => pdv,
            Fragment::ReleaseRequested => return Ok(Incoming::ReleaseRequested),
            Fragment::Released => return Ok(Incoming::Released),
        };
        let presentation_context_id = first.presentation_context_id;
        if first.value_type != PDataValueType::Command {
            return Err(framing_violation(
                association,
                &first,
                PDataValueType::Command,
                presentation_context_id,
            ));
        }

        let mut is_last = first.is_last;
        let mut command_data = first.data;
        while !is_last {
            let pdv = continuation(
                association,
                self.queue(),
                PDataValueType::Command,
                presentation_context_id,
            )?;
            is_last = pdv.is_last;
            command_data.extend_from_slice(&pdv.data);
        }

        let command = match Command::decode(&command_data) {
            Ok(command) => command,
            Err(e) => {
                warn!("Could not decode command: {}", e);
                association.abort_with(AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::InvalidPduParameter,
                ));
                return Err(e);
            }
        };
        if let Some(id) = command.message_id() {
            association.observe_message_id(id);
        }
        debug!(
            "Received {} on presentation context {}",
            command, presentation_context_id
        );

        if command.has_data_set() {
            self.data_set = Some(presentation_context_id);
        }
        Ok(Incoming::Message {
            presentation_context_id,
            command,
        })
    }

    /// Read the data set of the message just read into memory,
    /// keeping the read lock.
    ///
    /// Returns `None` if the message has no data set.
    pub fn read_data_set(&mut self) -> Result<Option<Vec<u8>>> {
        let presentation_context_id = match self.data_set.take() {
            Some(id) => id,
            None => return Ok(None),
        };
        let association = self.association;
        let mut data = Vec::new();
        loop {
            let pdv = continuation(
                association,
                self.queue(),
                PDataValueType::Data,
                presentation_context_id,
            )?;
            data.extend_from_slice(&pdv.data);
            if pdv.is_last {
                return Ok(Some(data));
            }
        }
    }

    /// Read a whole message, data set included, into memory.
    ///
    /// Returns `Ok(Err(incoming))` if something other than a message was read.
    pub fn read_message(&mut self) -> Result<Result<DimseMessage, Incoming>> {
        match self.read_command()? {
            Incoming::Message {
                presentation_context_id,
                command,
            } => {
                let data = self.read_data_set()?;
                Ok(Ok(DimseMessage {
                    presentation_context_id,
                    command,
                    data,
                }))
            }
            other => Ok(Err(other)),
        }
    }

    /// Hand over the read lock to a reader of the data set
    /// of the message just read.
    ///
    /// Returns `None` if the message has no data set,
    /// in which case the read lock is released.
    pub fn into_data_set(mut self) -> Option<DataSetReader<'a>> {
        let presentation_context_id = self.data_set.take()?;
        let queue = self.queue.take()?;
        Some(DataSetReader {
            association: self.association,
            queue,
            presentation_context_id,
            current: Vec::new(),
            position: 0,
            finished: false,
        })
    }

    fn discard_data_set(&mut self) -> Result<()> {
        if self.data_set.is_some() {
            debug!("Discarding unread data set");
            self.read_data_set()?;
        }
        Ok(())
    }
}

impl Drop for DimseReader<'_> {
    fn drop(&mut self) {
        if self.queue.is_some() && !self.association.state().is_closing() {
            if let Err(e) = self.discard_data_set() {
                debug!("Could not drain data set: {}", e);
            }
        }
    }
}

/// Pull reader of a data set following a command.
///
/// Fragments are received as the data is read.
/// Closing or dropping the reader drains the remaining fragments,
/// leaving the association ready for the next message.
pub struct DataSetReader<'a> {
    association: &'a Association,
    queue: MutexGuard<'a, VecDeque<PDataValue>>,
    presentation_context_id: u8,
    /// data of the current fragment
    current: Vec<u8>,
    position: usize,
    /// whether the last fragment was taken
    finished: bool,
}

impl std::fmt::Debug for DataSetReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSetReader")
            .field("presentation_context_id", &self.presentation_context_id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<'a> DataSetReader<'a> {
    pub fn presentation_context_id(&self) -> u8 {
        self.presentation_context_id
    }

    /// Take the next data fragment.
    fn next(&mut self) -> Result<()> {
        let pdv = continuation(
            self.association,
            &mut self.queue,
            PDataValueType::Data,
            self.presentation_context_id,
        );
        let pdv = match pdv {
            Ok(pdv) => pdv,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };
        self.finished = pdv.is_last;
        self.current = pdv.data;
        self.position = 0;
        Ok(())
    }

    /// Read the rest of the data set into memory.
    pub fn read_to_vec(mut self) -> Result<Vec<u8>> {
        let mut data = self.current[self.position..].to_vec();
        self.position = self.current.len();
        while !self.finished {
            self.next()?;
            data.extend_from_slice(&self.current);
            self.position = self.current.len();
        }
        Ok(data)
    }

    /// Discard the rest of the data set.
    pub fn close(mut self) -> Result<()> {
        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        self.position = self.current.len();
        while !self.finished {
            self.next()?;
            self.position = self.current.len();
        }
        Ok(())
    }
}

impl Read for DataSetReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.position == self.current.len() {
            if self.finished {
                return Ok(0);
            }
            if let Err(e) = self.next() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                ));
            }
        }
        let n = buf.len().min(self.current.len() - self.position);
        buf[..n].copy_from_slice(&self.current[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}

impl Drop for DataSetReader<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.association.state().is_closing() {
            if let Err(e) = self.drain() {
                debug!("Could not drain data set: {}", e);
            }
        }
    }
}
