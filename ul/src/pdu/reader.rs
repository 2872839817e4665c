//! PDU reader module
//!
//! Decoding never reads past the length declared by an item:
//! the content of every PDU and sub-item is sliced out first
//! and then parsed in isolation,
//! so a declared length which is inconsistent with the content
//! is reported as an error instead of desynchronizing the stream.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BytesMut};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{ErrorKind, Read};
use tracing::warn;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// The size of the chunks requested from the wire
/// while waiting for a full PDU.
const WIRE_CHUNK_SIZE: usize = 8_192;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("No PDU available"))]
    NoPduAvailable { backtrace: Backtrace },

    #[snafu(display("Connection closed with {} bytes of an incomplete PDU", buffered))]
    ConnectionClosed {
        buffered: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Field `{}` needs {} bytes but only {} remain in the item",
        field,
        expected,
        available
    ))]
    TruncatedField {
        field: &'static str,
        expected: usize,
        available: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("{} unexpected trailing bytes in `{}`", remaining, field))]
    TrailingBytes {
        field: &'static str,
        remaining: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32, backtrace: Backtrace },

    #[snafu(display(
        "Incoming pdu was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU contained an unexpected item {:?}", var_item))]
    InvalidPduVariable {
        var_item: PduVariableItem,
        backtrace: Backtrace,
    },

    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("Invalid reject source {} or reason {}", source_code, reason))]
    InvalidRejectSourceOrReason {
        source_code: u8,
        reason: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid reject result {}", result))]
    InvalidRejectResult { result: u8, backtrace: Backtrace },

    #[snafu(display("Invalid abort source {} or reason {}", source_code, reason))]
    InvalidAbortSourceOrReason {
        source_code: u8,
        reason: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid presentation context result reason {}", reason))]
    InvalidPresentationContextResultReason { reason: u8, backtrace: Backtrace },

    #[snafu(display("Unexpected sub-item {:02X}H in presentation context result", item_type))]
    InvalidTransferSyntaxSubItem { item_type: u8, backtrace: Backtrace },

    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        source: dicom_encoding::text::DecodeTextError,
        backtrace: Backtrace,
    },

    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The A-ABORT provider reason which a decoding failure
    /// should be reported to the peer with.
    pub fn abort_reason(&self) -> AbortRQServiceProviderReason {
        match self {
            Error::InvalidRejectSourceOrReason { .. }
            | Error::InvalidRejectResult { .. }
            | Error::InvalidAbortSourceOrReason { .. }
            | Error::InvalidPresentationContextResultReason { .. } => {
                AbortRQServiceProviderReason::UnrecognizedPduParameter
            }
            Error::InvalidPduVariable { .. } | Error::InvalidTransferSyntaxSubItem { .. } => {
                AbortRQServiceProviderReason::UnexpectedPduParameter
            }
            Error::InvalidMaxPdu { .. }
            | Error::NoPduAvailable { .. }
            | Error::ConnectionClosed { .. }
            | Error::ReadPdu { .. } => AbortRQServiceProviderReason::ReasonNotSpecified,
            _ => AbortRQServiceProviderReason::InvalidPduParameter,
        }
    }

    /// Whether the error originates from a read timeout on the wire.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::ReadPdu { source, .. } => matches!(
                source.kind(),
                ErrorKind::WouldBlock | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Whether the error concerns the transport rather than the PDU content.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::ReadPdu { .. } | Error::NoPduAvailable { .. } | Error::ConnectionClosed { .. }
        )
    }
}

/// Decode one PDU from the start of the given byte buffer.
///
/// Returns `Ok(None)` if the buffer does not contain a complete PDU yet,
/// in which case the buffer is left untouched.
/// Otherwise, the slice is advanced past the PDU.
///
/// The PDU length is checked against `max_pdu_length`
/// as soon as the header is available.
/// In strict mode,
/// PDUs longer than `max_pdu_length` are refused;
/// otherwise they are tolerated up to [`MAXIMUM_PDU_SIZE`].
///
/// Unknown variable items of an A-ASSOCIATE-RQ or A-ASSOCIATE-AC
/// are skipped with a warning,
/// so they are not reproduced when the PDU is encoded again.
/// Unknown sub-items of the user information item are kept instead,
/// as [`UserVariableItem::Unknown`](crate::pdu::UserVariableItem::Unknown).
pub fn read_pdu(buf: &mut &[u8], max_pdu_length: u32, strict: bool) -> Result<Option<Pdu>> {
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    if buf.len() < PDU_HEADER_SIZE as usize {
        return Ok(None);
    }

    let pdu_type = buf[0];
    let pdu_length = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);

    // Check max_pdu_length
    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "Incoming pdu was too large: length {}, maximum is {}",
            pdu_length, max_pdu_length
        );
    }

    let total = PDU_HEADER_SIZE as usize + pdu_length as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let body = &buf[PDU_HEADER_SIZE as usize..total];
    let pdu = decode_pdu_body(pdu_type, body)?;
    *buf = &buf[total..];
    Ok(Some(pdu))
}

/// Read one PDU from a blocking reader,
/// retaining any surplus bytes in `buffer` for subsequent calls.
///
/// Fails with [`Error::NoPduAvailable`] if the stream ends
/// before the first byte of a PDU,
/// and with [`Error::ConnectionClosed`] if it ends in the middle of one.
pub fn read_pdu_from_wire<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Pdu>
where
    R: Read + ?Sized,
{
    let mut chunk = [0u8; WIRE_CHUNK_SIZE];
    loop {
        let mut view = &buffer[..];
        if let Some(pdu) = read_pdu(&mut view, max_pdu_length, strict)? {
            let consumed = buffer.len() - view.len();
            buffer.advance(consumed);
            return Ok(pdu);
        }

        let n = loop {
            match reader.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context(ReadPduSnafu),
            }
        };
        if n == 0 {
            ensure!(!buffer.is_empty(), NoPduAvailableSnafu);
            return ConnectionClosedSnafu {
                buffered: buffer.len(),
            }
            .fail();
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

fn decode_pdu_body(pdu_type: u8, body: &[u8]) -> Result<Pdu> {
    let mut cursor = body;
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 => {
            // A-ASSOCIATE-RQ PDU Structure
            let (protocol_version, called_ae_title, calling_ae_title) =
                read_association_header(&mut cursor, &codec)?;

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            // 75-xxx - Variable items: one application context item,
            // one or more presentation context items, one user information item
            while !cursor.is_empty() {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextProposed(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    PduVariableItem::Unknown(item_type) => {
                        warn!("Skipping unknown variable item {:02X}H", item_type);
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x02 => {
            // A-ASSOCIATE-AC PDU Structure
            // (AE title fields are a copy of those in the request)
            let (protocol_version, called_ae_title, calling_ae_title) =
                read_association_header(&mut cursor, &codec)?;

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            while !cursor.is_empty() {
                match read_pdu_variable(&mut cursor, &codec)? {
                    PduVariableItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduVariableItem::PresentationContextResult(val) => {
                        presentation_contexts.push(val);
                    }
                    PduVariableItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    PduVariableItem::Unknown(item_type) => {
                        warn!("Skipping unknown variable item {:02X}H", item_type);
                    }
                    var_item => {
                        return InvalidPduVariableSnafu { var_item }.fail();
                    }
                }
            }

            Ok(Pdu::AssociationAC(AssociationAC {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            }))
        }
        0x03 => {
            // A-ASSOCIATE-RJ PDU Structure
            // 7 - Reserved, 8 - Result, 9 - Source, 10 - Reason/Diag.
            let fields = take(&mut cursor, 4, "A-ASSOCIATE-RJ")?;
            ensure_consumed(cursor, "A-ASSOCIATE-RJ")?;

            let result = AssociationRJResult::from(fields[1])
                .context(InvalidRejectResultSnafu { result: fields[1] })?;
            let source = AssociationRJSource::from(fields[2], fields[3]).context(
                InvalidRejectSourceOrReasonSnafu {
                    source_code: fields[2],
                    reason: fields[3],
                },
            )?;

            Ok(Pdu::AssociationRJ(AssociationRJ { result, source }))
        }
        0x04 => {
            // P-DATA-TF PDU Structure
            // 7-xxx - one or more presentation data value items
            let mut values = vec![];
            while !cursor.is_empty() {
                // 1-4 - Item-length, counting from the presentation context ID
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                let mut item = take(
                    &mut cursor,
                    item_length as usize,
                    "Presentation-data-value",
                )?;

                // 5 - Presentation-context-ID
                let presentation_context_id = item.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // 6 - Message Control Header:
                // bit 0 set for command information, bit 1 set on the last fragment
                let header = item.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;

                let value_type = if header & 0x01 > 0 {
                    PDataValueType::Command
                } else {
                    PDataValueType::Data
                };
                let is_last = (header & 0x02) > 0;

                values.push(PDataValue {
                    presentation_context_id,
                    value_type,
                    is_last,
                    data: item.to_vec(),
                })
            }

            Ok(Pdu::PData { data: values })
        }
        0x05 => {
            // A-RELEASE-RQ PDU Structure
            // 7-10 - Reserved
            ensure_at_most(cursor, 4, "A-RELEASE-RQ")?;
            Ok(Pdu::ReleaseRQ)
        }
        0x06 => {
            // A-RELEASE-RP PDU Structure
            // 7-10 - Reserved
            ensure_at_most(cursor, 4, "A-RELEASE-RP")?;
            Ok(Pdu::ReleaseRP)
        }
        0x07 => {
            // A-ABORT PDU Structure
            // 7 - Reserved, 8 - Reserved, 9 - Source, 10 - Reason/Diag
            let fields = take(&mut cursor, 4, "A-ABORT")?;
            ensure_consumed(cursor, "A-ABORT")?;

            let source = AbortRQSource::from(fields[2], fields[3]).context(
                InvalidAbortSourceOrReasonSnafu {
                    source_code: fields[2],
                    reason: fields[3],
                },
            )?;

            Ok(Pdu::AbortRQ { source })
        }
        _ => Ok(Pdu::Unknown {
            pdu_type,
            data: body.to_vec(),
        }),
    }
}

/// Read the fixed part shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC,
/// returning the protocol version, the called AE title
/// and the calling AE title.
fn read_association_header(
    cursor: &mut &[u8],
    codec: &dyn TextCodec,
) -> Result<(u16, String, String)> {
    // 7-8 - Protocol-version
    let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Protocol-version",
    })?;

    // 9-10 - Reserved
    take(cursor, 2, "Reserved")?;

    // 11-26 - Called-AE-title
    let called_ae_title = read_text(take(cursor, 16, "Called-AE-title")?, codec, "Called-AE-title")?;

    // 27-42 - Calling-AE-title
    let calling_ae_title =
        read_text(take(cursor, 16, "Calling-AE-title")?, codec, "Calling-AE-title")?;

    // 43-74 - Reserved
    take(cursor, 32, "Reserved")?;

    Ok((protocol_version, called_ae_title, calling_ae_title))
}

fn read_pdu_variable(cursor: &mut &[u8], codec: &dyn TextCodec) -> Result<PduVariableItem> {
    let (item_type, mut item) = read_item(cursor)?;

    match item_type {
        0x10 => {
            // Application Context Item Structure
            // 5-xxx - Application-context-name
            let val = read_text(item, codec, "Application-context-name")?;
            Ok(PduVariableItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item Structure (proposed)
            // 5 - Presentation-context-ID, 6-8 - Reserved
            let presentation_context_id = item.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;
            take(&mut item, 3, "Reserved")?;

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            // 9-xxx - one abstract syntax sub-item and one or more transfer syntax sub-items
            while !item.is_empty() {
                let (sub_item_type, sub_item) = read_item(&mut item)?;
                match sub_item_type {
                    0x30 => {
                        abstract_syntax =
                            Some(read_text(sub_item, codec, "Abstract-syntax-name")?);
                    }
                    0x40 => {
                        transfer_syntaxes.push(read_text(sub_item, codec, "Transfer-syntax-name")?);
                    }
                    _ => {
                        warn!(
                            "Skipping unknown presentation context sub-item {:02X}H",
                            sub_item_type
                        );
                    }
                }
            }

            ensure!(!transfer_syntaxes.is_empty(), MissingTransferSyntaxSnafu);

            Ok(PduVariableItem::PresentationContextProposed(
                PresentationContextProposed {
                    id: presentation_context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item Structure (result)
            // 5 - Presentation-context-ID, 6 - Reserved, 7 - Result/Reason, 8 - Reserved
            let fields = take(&mut item, 4, "Presentation context result")?;
            let presentation_context_id = fields[0];
            let reason = PresentationContextResultReason::from(fields[2])
                .context(InvalidPresentationContextResultReasonSnafu { reason: fields[2] })?;

            // 9-xxx - one transfer syntax sub-item,
            // not significant unless the context was accepted
            let mut transfer_syntax: Option<String> = None;
            while !item.is_empty() {
                let (sub_item_type, sub_item) = read_item(&mut item)?;
                ensure!(
                    sub_item_type == 0x40,
                    InvalidTransferSyntaxSubItemSnafu {
                        item_type: sub_item_type
                    }
                );
                ensure!(
                    transfer_syntax.is_none(),
                    MultipleTransferSyntaxesAcceptedSnafu
                );
                transfer_syntax = Some(read_text(sub_item, codec, "Transfer-syntax-name")?);
            }

            let transfer_syntax = match transfer_syntax {
                Some(ts) => ts,
                None if reason != PresentationContextResultReason::Acceptance => String::new(),
                None => return MissingTransferSyntaxSnafu.fail(),
            };

            Ok(PduVariableItem::PresentationContextResult(
                PresentationContextResult {
                    id: presentation_context_id,
                    reason,
                    transfer_syntax,
                },
            ))
        }
        0x50 => {
            // User Information Item Structure
            // 5-xxx - User-data sub-items
            let mut user_variables = vec![];
            while !item.is_empty() {
                let (sub_item_type, sub_item) = read_item(&mut item)?;
                user_variables.push(read_user_variable(sub_item_type, sub_item, codec)?);
            }

            Ok(PduVariableItem::UserVariables(user_variables))
        }
        _ => Ok(PduVariableItem::Unknown(item_type)),
    }
}

fn read_user_variable(
    item_type: u8,
    mut item: &[u8],
    codec: &dyn TextCodec,
) -> Result<UserVariableItem> {
    let variable = match item_type {
        0x51 => {
            // 5-8 - Maximum-length-received, 0 meaning unlimited
            let max_length = item.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Maximum-length-received",
            })?;
            UserVariableItem::MaxLength(max_length)
        }
        0x52 => {
            let uid = read_text(item, codec, "Implementation-class-uid")?;
            item = &[];
            UserVariableItem::ImplementationClassUID(uid)
        }
        0x53 => {
            // 5-6 - Maximum-number-operations-invoked
            let max_operations_invoked =
                item.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Maximum-number-operations-invoked",
                })?;
            // 7-8 - Maximum-number-operations-performed
            let max_operations_performed =
                item.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Maximum-number-operations-performed",
                })?;
            UserVariableItem::AsyncOperationsWindow(AsyncOperationsWindow {
                max_operations_invoked,
                max_operations_performed,
            })
        }
        0x54 => {
            let sop_class_uid = read_u16_prefixed_text(&mut item, codec, "SOP-class-uid")?;
            let roles = take(&mut item, 2, "SCU/SCP-role")?;
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid,
                scu_role: roles[0] == 1,
                scp_role: roles[1] == 1,
            })
        }
        0x55 => {
            let name = read_text(item, codec, "Implementation-version-name")?;
            item = &[];
            UserVariableItem::ImplementationVersionName(name)
        }
        0x56 => {
            let sop_class_uid = read_u16_prefixed_text(&mut item, codec, "SOP-class-uid")?;
            // xxx-xxx - Service-class-application-information,
            // until the end of the sub-item
            let info = item.to_vec();
            item = &[];
            UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, info)
        }
        0x57 => {
            let sop_class_uid = read_u16_prefixed_text(&mut item, codec, "SOP-class-uid")?;
            let service_class_uid =
                read_u16_prefixed_text(&mut item, codec, "Service-class-uid")?;
            let related_length = item.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Related-general-sop-class-identification-length",
            })?;
            let mut related = take(
                &mut item,
                related_length as usize,
                "Related-general-sop-class-identification",
            )?;
            let mut related_general_sop_class_uids = vec![];
            while !related.is_empty() {
                related_general_sop_class_uids.push(read_u16_prefixed_text(
                    &mut related,
                    codec,
                    "Related-general-sop-class-uid",
                )?);
            }
            UserVariableItem::SopClassCommonExtendedNegotiationSubItem(CommonExtendedNegotiation {
                sop_class_uid,
                service_class_uid,
                related_general_sop_class_uids,
            })
        }
        0x58 => {
            let fields = take(&mut item, 2, "User-Identity-type")?;
            let (identity_type, positive_response_requested) = (fields[0], fields[1]);
            let primary_field = read_u16_prefixed(&mut item, "User-Identity-primary-field")?;
            // only non-empty for username and password
            let secondary_field = read_u16_prefixed(&mut item, "User-Identity-secondary-field")?;
            ensure_consumed(item, "User Identity sub-item")?;

            match UserIdentityType::from(identity_type) {
                Some(identity_type) => UserVariableItem::UserIdentityItem(UserIdentity::new(
                    positive_response_requested == 1,
                    identity_type,
                    primary_field.to_vec(),
                    secondary_field.to_vec(),
                )),
                None => {
                    warn!("Unknown User Identity Type code {}", identity_type);
                    // keep the raw content
                    let mut raw = vec![identity_type, positive_response_requested];
                    raw.extend((primary_field.len() as u16).to_be_bytes());
                    raw.extend(primary_field);
                    raw.extend((secondary_field.len() as u16).to_be_bytes());
                    raw.extend(secondary_field);
                    UserVariableItem::Unknown(0x58, raw)
                }
            }
        }
        0x59 => {
            let response = read_u16_prefixed(&mut item, "Server-response")?;
            UserVariableItem::UserIdentityAc(response.to_vec())
        }
        _ => {
            let data = item.to_vec();
            item = &[];
            UserVariableItem::Unknown(item_type, data)
        }
    };

    ensure_consumed(item, "User information sub-item")?;
    Ok(variable)
}

/// Read the common (type, reserved, length) item framing,
/// returning the item type and its content.
fn read_item<'a>(cursor: &mut &'a [u8]) -> Result<(u8, &'a [u8])> {
    // 1 - Item-type
    let item_type = cursor
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    take(cursor, 1, "Reserved")?;

    // 3-4 - Item-length
    let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let item = take(cursor, item_length as usize, "Item")?;
    Ok((item_type, item))
}

fn take<'a>(cursor: &mut &'a [u8], n: usize, field: &'static str) -> Result<&'a [u8]> {
    ensure!(
        cursor.len() >= n,
        TruncatedFieldSnafu {
            field,
            expected: n,
            available: cursor.len(),
        }
    );
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}

fn read_u16_prefixed<'a>(cursor: &mut &'a [u8], field: &'static str) -> Result<&'a [u8]> {
    let len = cursor
        .read_u16::<BigEndian>()
        .context(ReadPduFieldSnafu { field })?;
    take(cursor, len as usize, field)
}

fn read_u16_prefixed_text(
    cursor: &mut &[u8],
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String> {
    let bytes = read_u16_prefixed(cursor, field)?;
    read_text(bytes, codec, field)
}

/// Decode a text field, discarding trailing space and null padding.
fn read_text(bytes: &[u8], codec: &dyn TextCodec, field: &'static str) -> Result<String> {
    let text = codec.decode(bytes).context(DecodeTextSnafu { field })?;
    Ok(text.trim_end_matches(|c| c == ' ' || c == '\0').to_string())
}

fn ensure_consumed(rest: &[u8], field: &'static str) -> Result<()> {
    ensure!(
        rest.is_empty(),
        TrailingBytesSnafu {
            field,
            remaining: rest.len(),
        }
    );
    Ok(())
}

fn ensure_at_most(rest: &[u8], max: usize, field: &'static str) -> Result<()> {
    ensure!(
        rest.len() <= max,
        TrailingBytesSnafu {
            field,
            remaining: rest.len() - max,
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::matches;

    #[test]
    fn incomplete_pdu_is_not_consumed() {
        // A-RELEASE-RQ cut short
        let bytes = [0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00];
        let mut view = &bytes[..];
        let pdu = read_pdu(&mut view, DEFAULT_MAX_PDU, true).unwrap();
        assert!(pdu.is_none());
        assert_eq!(view.len(), bytes.len());

        let mut view = &bytes[..3];
        assert!(read_pdu(&mut view, DEFAULT_MAX_PDU, true).unwrap().is_none());
    }

    #[test]
    fn oversized_pdu_is_refused_from_the_header() {
        // only the header is available, declaring an enormous length
        let bytes = [0x04, 0x00, 0x7F, 0xFF, 0xFF, 0xFF];
        let mut view = &bytes[..];
        let err = read_pdu(&mut view, DEFAULT_MAX_PDU, true).unwrap_err();
        assert!(matches!(err, Error::PduTooLarge { pdu_length: 0x7FFF_FFFF, .. }));

        let mut view = &bytes[..];
        let err = read_pdu(&mut view, DEFAULT_MAX_PDU, false).unwrap_err();
        assert!(matches!(err, Error::PduTooLarge { max_pdu_length: MAXIMUM_PDU_SIZE, .. }));
    }

    #[test]
    fn invalid_max_pdu_length_is_refused() {
        let mut view: &[u8] = &[];
        assert!(matches!(
            read_pdu(&mut view, 1024, true),
            Err(Error::InvalidMaxPdu { max_pdu_length: 1024, .. })
        ));
    }

    #[test]
    fn pdv_longer_than_pdu_is_rejected() {
        // P-DATA-TF with 8 bytes of content, but the PDV claims 16
        let bytes = [
            0x04, 0x00, 0x00, 0x00, 0x00, 0x08, //
            0x00, 0x00, 0x00, 0x10, 0x01, 0x03, 0xAA, 0xBB,
        ];
        let mut view = &bytes[..];
        let err = read_pdu(&mut view, DEFAULT_MAX_PDU, true).unwrap_err();
        assert!(matches!(err, Error::TruncatedField { .. }));
        assert_eq!(
            err.abort_reason(),
            AbortRQServiceProviderReason::InvalidPduParameter
        );
    }

    #[test]
    fn pdv_shorter_than_header_is_rejected() {
        let bytes = [
            0x04, 0x00, 0x00, 0x00, 0x00, 0x05, //
            0x00, 0x00, 0x00, 0x01, 0x01,
        ];
        let mut view = &bytes[..];
        let err = read_pdu(&mut view, DEFAULT_MAX_PDU, true).unwrap_err();
        assert!(matches!(err, Error::InvalidItemLength { length: 1, .. }));
    }

    #[test]
    fn malformed_max_length_sub_item_is_rejected() {
        // max length sub-item declaring 5 bytes
        let user_info = [0x51, 0x00, 0x00, 0x05, 0x00, 0x00, 0x40, 0x00, 0x00];
        let err = read_user_variable(0x51, &user_info[4..], &DefaultCharacterSetCodec)
            .unwrap_err();
        assert!(matches!(err, Error::TrailingBytes { remaining: 1, .. }));
    }

    #[test]
    fn unknown_user_sub_item_is_kept_verbatim() {
        let item = read_user_variable(0x6A, &[1, 2, 3], &DefaultCharacterSetCodec).unwrap();
        assert_eq!(item, UserVariableItem::Unknown(0x6A, vec![1, 2, 3]));
    }

    #[test]
    fn unknown_variable_item_is_skipped() {
        let rq = crate::pdu::AssociationRQ {
            protocol_version: 1,
            calling_ae_title: " SCU".to_string(),
            called_ae_title: "SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![crate::pdu::PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            }],
            user_variables: vec![UserVariableItem::MaxLength(16_384)],
        };
        let mut bytes = crate::pdu::writer::encode_pdu(&Pdu::AssociationRQ(rq.clone())).unwrap();
        bytes.extend_from_slice(&[0x60, 0x00, 0x00, 0x02, 0xAA, 0xBB]);
        let length = (bytes.len() - PDU_HEADER_SIZE as usize) as u32;
        bytes[2..6].copy_from_slice(&length.to_be_bytes());

        let mut view = &bytes[..];
        let pdu = read_pdu(&mut view, DEFAULT_MAX_PDU, true).unwrap().unwrap();
        // leading spaces are significant
        assert_eq!(pdu, Pdu::AssociationRQ(rq));
        assert!(view.is_empty());
    }

    #[test]
    fn abort_with_bad_source_is_unrecognized_parameter() {
        let bytes = [0x07, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x02, 0x09];
        let mut view = &bytes[..];
        let err = read_pdu(&mut view, DEFAULT_MAX_PDU, true).unwrap_err();
        assert_eq!(
            err.abort_reason(),
            AbortRQServiceProviderReason::UnrecognizedPduParameter
        );
    }

    #[test]
    fn empty_release_body_is_tolerated() {
        let bytes = [0x06, 0x00, 0x00, 0x00, 0x00, 0x00];
        let mut view = &bytes[..];
        let pdu = read_pdu(&mut view, DEFAULT_MAX_PDU, true).unwrap();
        assert_eq!(pdu, Some(Pdu::ReleaseRP));
        assert!(view.is_empty());
    }

    #[test]
    fn read_from_wire_reports_truncated_stream() {
        let bytes: &[u8] = &[0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00];
        let mut reader = bytes;
        let mut buffer = BytesMut::new();
        let err = read_pdu_from_wire(&mut reader, &mut buffer, DEFAULT_MAX_PDU, true)
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed { buffered: 7, .. }));

        let mut reader: &[u8] = &[];
        let err = read_pdu_from_wire(&mut reader, &mut BytesMut::new(), DEFAULT_MAX_PDU, true)
            .unwrap_err();
        assert!(matches!(err, Error::NoPduAvailable { .. }));
    }

    #[test]
    fn read_from_wire_keeps_surplus_bytes() {
        let bytes: &[u8] = &[
            0x05, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, //
            0x06, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00,
        ];
        let mut reader = bytes;
        let mut buffer = BytesMut::new();
        let first = read_pdu_from_wire(&mut reader, &mut buffer, DEFAULT_MAX_PDU, true).unwrap();
        assert_eq!(first, Pdu::ReleaseRQ);
        let second = read_pdu_from_wire(&mut reader, &mut buffer, DEFAULT_MAX_PDU, true).unwrap();
        assert_eq!(second, Pdu::ReleaseRP);
        assert!(buffer.is_empty());
    }
}
