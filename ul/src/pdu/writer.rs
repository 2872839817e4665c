//! PDU writer module
//!
//! All lengths are derived from the encoded content:
//! each variable-length structure is first built in a scratch buffer
//! by a chunk writer, and only then prefixed with its actual length.
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use std::convert::TryFrom;
use std::io::Write;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Could not write chunk of {} PDU structure", name))]
    WriteChunk {
        /// the name of the PDU structure
        name: &'static str,
        source: WriteChunkError,
    },

    #[snafu(display("Could not write field `{}`", field))]
    WriteField {
        field: &'static str,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {} reserved bytes", bytes))]
    WriteReserved {
        bytes: u32,
        backtrace: Backtrace,
        source: std::io::Error,
    },

    #[snafu(display("Could not encode field `{}`", field))]
    EncodeField {
        field: &'static str,
        source: dicom_encoding::text::EncodeTextError,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "AE title `{}` is too long ({} bytes, maximum is {})",
        ae_title,
        length,
        AE_TITLE_LENGTH
    ))]
    AeTitleTooLong {
        ae_title: String,
        length: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not send PDU to the wire"))]
    WirePdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum WriteChunkError {
    #[snafu(display("Failed to build chunk"))]
    BuildChunk {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },
    #[snafu(display("Chunk of {} bytes does not fit its length field", length))]
    ChunkTooLong { length: usize, backtrace: Backtrace },
    #[snafu(display("Failed to write chunk length"))]
    WriteLength {
        backtrace: Backtrace,
        source: std::io::Error,
    },
    #[snafu(display("Failed to write chunk data"))]
    WriteData {
        backtrace: Backtrace,
        source: std::io::Error,
    },
}

fn write_chunk_u32<F>(writer: &mut Vec<u8>, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    let length = u32::try_from(data.len())
        .ok()
        .ok_or_else(|| ChunkTooLongSnafu { length: data.len() }.build())?;
    writer
        .write_u32::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

fn write_chunk_u16<F>(writer: &mut Vec<u8>, func: F) -> std::result::Result<(), WriteChunkError>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut data = vec![];
    func(&mut data).context(BuildChunkSnafu)?;

    let length = u16::try_from(data.len())
        .ok()
        .ok_or_else(|| ChunkTooLongSnafu { length: data.len() }.build())?;
    writer
        .write_u16::<BigEndian>(length)
        .context(WriteLengthSnafu)?;

    writer.write_all(&data).context(WriteDataSnafu)?;

    Ok(())
}

/// Write a PDU to the given writer in one go.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write + ?Sized,
{
    let bytes = encode_pdu(pdu)?;
    writer.write_all(&bytes).context(WirePduSnafu)
}

/// Encode a PDU into a new byte vector.
pub fn encode_pdu(pdu: &Pdu) -> Result<Vec<u8>> {
    let mut writer = Vec::new();
    let codec = DefaultCharacterSetCodec;

    // 1 - PDU-type
    writer
        .write_u8(pdu.pdu_type().code())
        .context(WriteFieldSnafu { field: "PDU-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    // 3-6 - PDU-length
    write_chunk_u32(&mut writer, |writer| {
        match pdu {
            Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                calling_ae_title,
                called_ae_title,
                application_context_name,
                presentation_contexts,
                user_variables,
            }) => {
                write_association_header(
                    writer,
                    &codec,
                    *protocol_version,
                    called_ae_title,
                    calling_ae_title,
                )?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_proposed(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;
            }
            Pdu::AssociationAC(AssociationAC {
                protocol_version,
                calling_ae_title,
                called_ae_title,
                application_context_name,
                presentation_contexts,
                user_variables,
            }) => {
                write_association_header(
                    writer,
                    &codec,
                    *protocol_version,
                    called_ae_title,
                    calling_ae_title,
                )?;

                write_pdu_variable_application_context_name(
                    writer,
                    application_context_name,
                    &codec,
                )?;

                for presentation_context in presentation_contexts {
                    write_pdu_variable_presentation_context_result(
                        writer,
                        presentation_context,
                        &codec,
                    )?;
                }

                write_pdu_variable_user_variables(writer, user_variables, &codec)?;
            }
            Pdu::AssociationRJ(AssociationRJ { result, source }) => {
                // 7 - Reserved
                writer
                    .write_u8(0x00)
                    .context(WriteReservedSnafu { bytes: 1_u32 })?;

                // 8 - Result
                writer
                    .write_u8(*result as u8)
                    .context(WriteFieldSnafu { field: "Result" })?;

                // 9 - Source, 10 - Reason/Diag.
                let (source, reason) = source.codes();
                writer
                    .write_u8(source)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer.write_u8(reason).context(WriteFieldSnafu {
                    field: "Reason/Diag.",
                })?;
            }
            Pdu::PData { data } => {
                for presentation_data_value in data {
                    // 1-4 - Item-length
                    write_chunk_u32(writer, |writer| {
                        // 5 - Presentation-context-ID
                        writer
                            .write_u8(presentation_data_value.presentation_context_id)
                            .context(WriteFieldSnafu {
                                field: "Presentation-context-ID",
                            })?;

                        // 6 - Message Control Header
                        writer
                            .write_u8(presentation_data_value.control_header())
                            .context(WriteFieldSnafu {
                                field: "Message Control Header",
                            })?;

                        writer
                            .write_all(&presentation_data_value.data)
                            .context(WriteFieldSnafu {
                                field: "Presentation-data-value",
                            })?;
                        Ok(())
                    })
                    .context(WriteChunkSnafu {
                        name: "Presentation-data-value item",
                    })?;
                }
            }
            Pdu::ReleaseRQ | Pdu::ReleaseRP => {
                // 7-10 - Reserved
                writer
                    .write_u32::<BigEndian>(0)
                    .context(WriteReservedSnafu { bytes: 4_u32 })?;
            }
            Pdu::AbortRQ { source } => {
                // 7-8 - Reserved
                writer
                    .write_u16::<BigEndian>(0)
                    .context(WriteReservedSnafu { bytes: 2_u32 })?;

                // 9 - Source, 10 - Reason/Diag
                let (source, reason) = source.codes();
                writer
                    .write_u8(source)
                    .context(WriteFieldSnafu { field: "Source" })?;
                writer.write_u8(reason).context(WriteFieldSnafu {
                    field: "Reason/Diag",
                })?;
            }
            Pdu::Unknown { data, .. } => {
                writer
                    .write_all(data)
                    .context(WriteFieldSnafu { field: "Unknown" })?;
            }
        }
        Ok(())
    })
    .context(WriteChunkSnafu { name: "PDU" })?;

    Ok(writer)
}

/// Write the fixed part shared by A-ASSOCIATE-RQ and A-ASSOCIATE-AC.
fn write_association_header(
    writer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    protocol_version: u16,
    called_ae_title: &str,
    calling_ae_title: &str,
) -> Result<()> {
    // 7-8 - Protocol-version
    writer
        .write_u16::<BigEndian>(protocol_version)
        .context(WriteFieldSnafu {
            field: "Protocol-version",
        })?;

    // 9-10 - Reserved
    writer
        .write_u16::<BigEndian>(0x00)
        .context(WriteReservedSnafu { bytes: 2_u32 })?;

    // 11-26 - Called-AE-title
    write_ae_title(writer, codec, called_ae_title, "Called-AE-title")?;

    // 27-42 - Calling-AE-title
    write_ae_title(writer, codec, calling_ae_title, "Calling-AE-title")?;

    // 43-74 - Reserved
    writer
        .write_all(&[0; 32])
        .context(WriteReservedSnafu { bytes: 32_u32 })?;

    Ok(())
}

/// Write an AE title as exactly 16 characters, padded with trailing spaces.
fn write_ae_title(
    writer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    ae_title: &str,
    field: &'static str,
) -> Result<()> {
    let mut ae_title_bytes = codec.encode(ae_title).context(EncodeFieldSnafu { field })?;
    ensure!(
        ae_title_bytes.len() <= AE_TITLE_LENGTH,
        AeTitleTooLongSnafu {
            ae_title,
            length: ae_title_bytes.len(),
        }
    );
    ae_title_bytes.resize(AE_TITLE_LENGTH, b' ');
    writer
        .write_all(&ae_title_bytes)
        .context(WriteFieldSnafu { field })
}

/// Write a sub-item with the common (type, reserved, length) framing.
fn write_item<F>(writer: &mut Vec<u8>, item_type: u8, name: &'static str, func: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    // 1 - Item-type
    writer
        .write_u8(item_type)
        .context(WriteFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    writer
        .write_u8(0x00)
        .context(WriteReservedSnafu { bytes: 1_u32 })?;

    // 3-4 - Item-length
    write_chunk_u16(writer, func).context(WriteChunkSnafu { name })
}

fn write_text(
    writer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    text: &str,
    field: &'static str,
) -> Result<()> {
    let bytes = codec.encode(text).context(EncodeFieldSnafu { field })?;
    writer
        .write_all(&bytes)
        .context(WriteFieldSnafu { field })
}

/// Write a UID preceded by its 2-byte length.
fn write_u16_prefixed_text(
    writer: &mut Vec<u8>,
    codec: &dyn TextCodec,
    text: &str,
    field: &'static str,
) -> Result<()> {
    write_chunk_u16(writer, |writer| write_text(writer, codec, text, field))
        .context(WriteChunkSnafu { name: field })
}

fn write_u16_prefixed_bytes(writer: &mut Vec<u8>, data: &[u8], field: &'static str) -> Result<()> {
    write_chunk_u16(writer, |writer| {
        writer.write_all(data).context(WriteFieldSnafu { field })
    })
    .context(WriteChunkSnafu { name: field })
}

fn write_pdu_variable_application_context_name(
    writer: &mut Vec<u8>,
    application_context_name: &str,
    codec: &dyn TextCodec,
) -> Result<()> {
    // Application Context Item Structure (10H)
    write_item(writer, 0x10, "Application Context Item", |writer| {
        write_text(
            writer,
            codec,
            application_context_name,
            "Application-context-name",
        )
    })
}

fn write_pdu_variable_presentation_context_proposed(
    writer: &mut Vec<u8>,
    presentation_context: &PresentationContextProposed,
    codec: &dyn TextCodec,
) -> Result<()> {
    // Presentation Context Item Structure (20H)
    write_item(writer, 0x20, "Presentation Context Item", |writer| {
        // 5 - Presentation-context-ID
        writer
            .write_u8(presentation_context.id)
            .context(WriteFieldSnafu {
                field: "Presentation-context-ID",
            })?;

        // 6-8 - Reserved
        writer
            .write_all(&[0; 3])
            .context(WriteReservedSnafu { bytes: 3_u32 })?;

        // Abstract Syntax Sub-Item Structure (30H)
        write_item(writer, 0x30, "Abstract Syntax Sub-Item", |writer| {
            write_text(
                writer,
                codec,
                &presentation_context.abstract_syntax,
                "Abstract-syntax-name",
            )
        })?;

        // Transfer Syntax Sub-Items (40H)
        for transfer_syntax in &presentation_context.transfer_syntaxes {
            write_item(writer, 0x40, "Transfer Syntax Sub-Item", |writer| {
                write_text(writer, codec, transfer_syntax, "Transfer-syntax-name")
            })?;
        }

        Ok(())
    })
}

fn write_pdu_variable_presentation_context_result(
    writer: &mut Vec<u8>,
    presentation_context: &PresentationContextResult,
    codec: &dyn TextCodec,
) -> Result<()> {
    // Presentation Context Item Structure (21H)
    write_item(writer, 0x21, "Presentation Context Item", |writer| {
        // 5 - Presentation-context-ID, 6 - Reserved,
        // 7 - Result/Reason, 8 - Reserved
        writer
            .write_all(&[
                presentation_context.id,
                0x00,
                presentation_context.reason as u8,
                0x00,
            ])
            .context(WriteFieldSnafu {
                field: "Presentation context result",
            })?;

        // Transfer syntax sub-item (40H)
        write_item(writer, 0x40, "Transfer Syntax Sub-Item", |writer| {
            write_text(
                writer,
                codec,
                &presentation_context.transfer_syntax,
                "Transfer-syntax-name",
            )
        })
    })
}

fn write_pdu_variable_user_variables(
    writer: &mut Vec<u8>,
    user_variables: &[UserVariableItem],
    codec: &dyn TextCodec,
) -> Result<()> {
    if user_variables.is_empty() {
        return Ok(());
    }

    // User Information Item Structure (50H)
    write_item(writer, 0x50, "User Information Item", |writer| {
        for user_variable in user_variables {
            write_user_variable(writer, user_variable, codec)?;
        }
        Ok(())
    })
}

fn write_user_variable(
    writer: &mut Vec<u8>,
    user_variable: &UserVariableItem,
    codec: &dyn TextCodec,
) -> Result<()> {
    match user_variable {
        UserVariableItem::MaxLength(max_length) => {
            write_item(writer, 0x51, "Maximum Length Sub-Item", |writer| {
                writer
                    .write_u32::<BigEndian>(*max_length)
                    .context(WriteFieldSnafu {
                        field: "Maximum-length-received",
                    })
            })
        }
        UserVariableItem::ImplementationClassUID(uid) => {
            write_item(writer, 0x52, "Implementation Class UID Sub-Item", |writer| {
                write_text(writer, codec, uid, "Implementation-class-uid")
            })
        }
        UserVariableItem::AsyncOperationsWindow(window) => {
            write_item(writer, 0x53, "Asynchronous Operations Window Sub-Item", |writer| {
                writer
                    .write_u16::<BigEndian>(window.max_operations_invoked)
                    .context(WriteFieldSnafu {
                        field: "Maximum-number-operations-invoked",
                    })?;
                writer
                    .write_u16::<BigEndian>(window.max_operations_performed)
                    .context(WriteFieldSnafu {
                        field: "Maximum-number-operations-performed",
                    })
            })
        }
        UserVariableItem::RoleSelection(role) => {
            write_item(writer, 0x54, "SCP/SCU Role Selection Sub-Item", |writer| {
                write_u16_prefixed_text(writer, codec, &role.sop_class_uid, "SOP-class-uid")?;
                writer
                    .write_all(&[role.scu_role as u8, role.scp_role as u8])
                    .context(WriteFieldSnafu {
                        field: "SCU/SCP-role",
                    })
            })
        }
        UserVariableItem::ImplementationVersionName(name) => {
            write_item(writer, 0x55, "Implementation Version Name Sub-Item", |writer| {
                write_text(writer, codec, name, "Implementation-version-name")
            })
        }
        UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data) => {
            write_item(writer, 0x56, "SOP Class Extended Negotiation Sub-Item", |writer| {
                write_u16_prefixed_text(writer, codec, sop_class_uid, "SOP-class-uid")?;
                writer.write_all(data).context(WriteFieldSnafu {
                    field: "Service-class-application-information",
                })
            })
        }
        UserVariableItem::SopClassCommonExtendedNegotiationSubItem(negotiation) => write_item(
            writer,
            0x57,
            "SOP Class Common Extended Negotiation Sub-Item",
            |writer| {
                write_u16_prefixed_text(
                    writer,
                    codec,
                    &negotiation.sop_class_uid,
                    "SOP-class-uid",
                )?;
                write_u16_prefixed_text(
                    writer,
                    codec,
                    &negotiation.service_class_uid,
                    "Service-class-uid",
                )?;
                write_chunk_u16(writer, |writer| {
                    for uid in &negotiation.related_general_sop_class_uids {
                        write_u16_prefixed_text(
                            writer,
                            codec,
                            uid,
                            "Related-general-sop-class-uid",
                        )?;
                    }
                    Ok(())
                })
                .context(WriteChunkSnafu {
                    name: "Related-general-sop-class-identification",
                })
            },
        ),
        UserVariableItem::UserIdentityItem(user_identity) => {
            write_item(writer, 0x58, "User Identity Sub-Item", |writer| {
                // 5 - User-Identity-Type, 6 - Positive-response-requested
                writer
                    .write_all(&[
                        user_identity.identity_type().to_u8(),
                        user_identity.positive_response_requested() as u8,
                    ])
                    .context(WriteFieldSnafu {
                        field: "User-Identity-Type",
                    })?;
                write_u16_prefixed_bytes(writer, user_identity.primary_field(), "Primary-field")?;
                write_u16_prefixed_bytes(
                    writer,
                    user_identity.secondary_field(),
                    "Secondary-field",
                )
            })
        }
        UserVariableItem::UserIdentityAc(response) => {
            write_item(writer, 0x59, "User Identity Response Sub-Item", |writer| {
                write_u16_prefixed_bytes(writer, response, "Server-response")
            })
        }
        UserVariableItem::Unknown(item_type, data) => {
            write_item(writer, *item_type, "Unknown Sub-Item", |writer| {
                writer
                    .write_all(data)
                    .context(WriteFieldSnafu { field: "Unknown Data" })
            })
        }
    }
}
