//! DIMSE command sets.
//!
//! A [`Command`] is a typed view over the command attribute set
//! (group 0000H) which heads every DIMSE message.
//! Commands are always encoded in _Implicit VR Little Endian_.
use std::fmt;

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use snafu::ResultExt;

use super::{DecodeCommandSnafu, EncodeCommandSnafu, Result};
use crate::association::uid::trim_uid_str;

/// Value of _Command Data Set Type_ meaning that no data set follows.
pub const NO_DATA_SET: u16 = 0x0101;

/// Value of _Command Data Set Type_ used when a data set follows.
const DATA_SET_PRESENT: u16 = 0x0000;

/// The DIMSE operation identified by a command field.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CGetRq,
    CGetRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    NEventReportRq,
    NEventReportRsp,
    NGetRq,
    NGetRsp,
    NSetRq,
    NSetRsp,
    NActionRq,
    NActionRsp,
    NCreateRq,
    NCreateRsp,
    NDeleteRq,
    NDeleteRsp,
    CCancelRq,
}

impl CommandField {
    /// Interpret a command field value.
    pub fn from_code(code: u16) -> Option<Self> {
        use CommandField::*;
        let field = match code {
            0x0001 => CStoreRq,
            0x8001 => CStoreRsp,
            0x0010 => CGetRq,
            0x8010 => CGetRsp,
            0x0020 => CFindRq,
            0x8020 => CFindRsp,
            0x0021 => CMoveRq,
            0x8021 => CMoveRsp,
            0x0030 => CEchoRq,
            0x8030 => CEchoRsp,
            0x0100 => NEventReportRq,
            0x8100 => NEventReportRsp,
            0x0110 => NGetRq,
            0x8110 => NGetRsp,
            0x0120 => NSetRq,
            0x8120 => NSetRsp,
            0x0130 => NActionRq,
            0x8130 => NActionRsp,
            0x0140 => NCreateRq,
            0x8140 => NCreateRsp,
            0x0150 => NDeleteRq,
            0x8150 => NDeleteRsp,
            0x0FFF => CCancelRq,
            _ => return None,
        };
        Some(field)
    }

    /// The command field value as encoded.
    pub fn code(self) -> u16 {
        use CommandField::*;
        match self {
            CStoreRq => 0x0001,
            CStoreRsp => 0x8001,
            CGetRq => 0x0010,
            CGetRsp => 0x8010,
            CFindRq => 0x0020,
            CFindRsp => 0x8020,
            CMoveRq => 0x0021,
            CMoveRsp => 0x8021,
            CEchoRq => 0x0030,
            CEchoRsp => 0x8030,
            NEventReportRq => 0x0100,
            NEventReportRsp => 0x8100,
            NGetRq => 0x0110,
            NGetRsp => 0x8110,
            NSetRq => 0x0120,
            NSetRsp => 0x8120,
            NActionRq => 0x0130,
            NActionRsp => 0x8130,
            NCreateRq => 0x0140,
            NCreateRsp => 0x8140,
            NDeleteRq => 0x0150,
            NDeleteRsp => 0x8150,
            CCancelRq => 0x0FFF,
        }
    }

    /// Whether this is a request other than C-CANCEL.
    pub fn is_request(self) -> bool {
        self.code() & 0x8000 == 0 && self != CommandField::CCancelRq
    }

    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }

    pub fn is_cancel(self) -> bool {
        self == CommandField::CCancelRq
    }

    /// The response field matching this request field.
    pub fn response(self) -> Option<Self> {
        if self.is_request() {
            Self::from_code(self.code() | 0x8000)
        } else {
            None
        }
    }

    /// Whether the operation may receive multiple responses,
    /// and thus be canceled.
    pub fn is_cancelable(self) -> bool {
        matches!(
            self,
            CommandField::CGetRq | CommandField::CFindRq | CommandField::CMoveRq
        )
    }
}

impl fmt::Display for CommandField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CommandField::*;
        let name = match self {
            CStoreRq => "C-STORE-RQ",
            CStoreRsp => "C-STORE-RSP",
            CGetRq => "C-GET-RQ",
            CGetRsp => "C-GET-RSP",
            CFindRq => "C-FIND-RQ",
            CFindRsp => "C-FIND-RSP",
            CMoveRq => "C-MOVE-RQ",
            CMoveRsp => "C-MOVE-RSP",
            CEchoRq => "C-ECHO-RQ",
            CEchoRsp => "C-ECHO-RSP",
            NEventReportRq => "N-EVENT-REPORT-RQ",
            NEventReportRsp => "N-EVENT-REPORT-RSP",
            NGetRq => "N-GET-RQ",
            NGetRsp => "N-GET-RSP",
            NSetRq => "N-SET-RQ",
            NSetRsp => "N-SET-RSP",
            NActionRq => "N-ACTION-RQ",
            NActionRsp => "N-ACTION-RSP",
            NCreateRq => "N-CREATE-RQ",
            NCreateRsp => "N-CREATE-RSP",
            NDeleteRq => "N-DELETE-RQ",
            NDeleteRsp => "N-DELETE-RSP",
            CCancelRq => "C-CANCEL-RQ",
        };
        f.write_str(name)
    }
}

/// A DIMSE status code.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x0000);
    pub const PENDING: Status = Status(0xFF00);
    /// Pending, with optional keys not supported
    pub const PENDING_WARNING: Status = Status(0xFF01);
    pub const CANCEL: Status = Status(0xFE00);
    pub const NO_SUCH_SOP_CLASS: Status = Status(0x0118);
    pub const UNRECOGNIZED_OPERATION: Status = Status(0x0211);
    pub const PROCESSING_FAILURE: Status = Status(0x0110);

    /// Whether more responses follow this one.
    pub fn is_pending(self) -> bool {
        self.0 == 0xFF00 || self.0 == 0xFF01
    }

    pub fn is_success(self) -> bool {
        self.0 == 0x0000
    }

    pub fn is_warning(self) -> bool {
        matches!(self.0, 0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF)
    }

    pub fn is_cancel(self) -> bool {
        self.0 == 0xFE00
    }

    pub fn is_failure(self) -> bool {
        !(self.is_success() || self.is_pending() || self.is_warning() || self.is_cancel())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}H", self.0)
    }
}

/// A DIMSE command set.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    obj: InMemDicomObject,
}

impl Command {
    /// Create a command with the given command field
    /// and no data set.
    pub fn new(field: CommandField) -> Self {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [field.code()]),
        ));
        obj.put(DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ));
        Command { obj }
    }

    /// Wrap an existing command attribute set.
    pub fn from_object(obj: InMemDicomObject) -> Self {
        Command { obj }
    }

    /// Access the underlying attribute set.
    pub fn as_object(&self) -> &InMemDicomObject {
        &self.obj
    }

    pub fn into_object(self) -> InMemDicomObject {
        self.obj
    }

    /// A C-ECHO request for the Verification SOP class.
    ///
    /// A message ID of 0 is replaced by a fresh one on invocation.
    pub fn echo_rq(message_id: u16) -> Self {
        Command::new(CommandField::CEchoRq)
            .with_message_id(message_id)
            .with_affected_sop_class_uid(dicom_dictionary_std::uids::VERIFICATION)
    }

    /// A C-CANCEL request for the operation with the given message ID.
    pub fn cancel_rq(message_id_being_responded_to: u16) -> Self {
        Command::new(CommandField::CCancelRq)
            .with_message_id_being_responded_to(message_id_being_responded_to)
    }

    /// The response to the given request, with the given status.
    ///
    /// The SOP class and instance are copied from the request.
    /// Returns `None` if the command is not a request.
    pub fn response_to(rq: &Command, status: Status) -> Option<Self> {
        let field = rq.command_field()?.response()?;
        let mut rsp = Command::new(field).with_status(status);
        if let Some(id) = rq.message_id() {
            rsp = rsp.with_message_id_being_responded_to(id);
        }
        if let Some(uid) = rq.sop_class_uid() {
            rsp = rsp.with_affected_sop_class_uid(&uid);
        }
        if let Some(uid) = rq
            .affected_sop_instance_uid()
            .or_else(|| rq.requested_sop_instance_uid())
        {
            rsp = rsp.with_affected_sop_instance_uid(&uid);
        }
        Some(rsp)
    }

    fn put_u16(&mut self, tag: Tag, value: u16) {
        self.obj
            .put(DataElement::new(tag, VR::US, dicom_value!(U16, [value])));
    }

    fn put_uid(&mut self, tag: Tag, uid: &str) {
        let mut uid = trim_uid_str(uid).to_string();
        // UI values are padded with a null byte to even length
        if uid.len() % 2 == 1 {
            uid.push('\0');
        }
        self.obj
            .put(DataElement::new(tag, VR::UI, dicom_value!(Str, uid)));
    }

    fn get_u16(&self, tag: Tag) -> Option<u16> {
        self.obj.element(tag).ok()?.to_int::<u16>().ok()
    }

    fn get_uid(&self, tag: Tag) -> Option<String> {
        let value = self.obj.element(tag).ok()?.to_str().ok()?;
        let value = trim_uid_str(&value);
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    pub fn with_message_id(mut self, message_id: u16) -> Self {
        self.set_message_id(message_id);
        self
    }

    pub fn set_message_id(&mut self, message_id: u16) {
        self.put_u16(tags::MESSAGE_ID, message_id);
    }

    pub fn with_message_id_being_responded_to(mut self, message_id: u16) -> Self {
        self.put_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id);
        self
    }

    pub fn with_affected_sop_class_uid(mut self, uid: &str) -> Self {
        self.put_uid(tags::AFFECTED_SOP_CLASS_UID, uid);
        self
    }

    pub fn with_requested_sop_class_uid(mut self, uid: &str) -> Self {
        self.put_uid(tags::REQUESTED_SOP_CLASS_UID, uid);
        self
    }

    pub fn with_affected_sop_instance_uid(mut self, uid: &str) -> Self {
        self.put_uid(tags::AFFECTED_SOP_INSTANCE_UID, uid);
        self
    }

    pub fn with_requested_sop_instance_uid(mut self, uid: &str) -> Self {
        self.put_uid(tags::REQUESTED_SOP_INSTANCE_UID, uid);
        self
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.put_u16(tags::PRIORITY, priority);
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.put_u16(tags::STATUS, status.0);
        self
    }

    /// Declare whether a data set follows this command.
    pub fn set_data_set_present(&mut self, present: bool) {
        let value = if present { DATA_SET_PRESENT } else { NO_DATA_SET };
        self.put_u16(tags::COMMAND_DATA_SET_TYPE, value);
    }

    /// The raw command field value.
    pub fn command_field_code(&self) -> Option<u16> {
        self.get_u16(tags::COMMAND_FIELD)
    }

    /// The command field, if present and recognized.
    pub fn command_field(&self) -> Option<CommandField> {
        self.command_field_code().and_then(CommandField::from_code)
    }

    pub fn message_id(&self) -> Option<u16> {
        self.get_u16(tags::MESSAGE_ID)
    }

    pub fn message_id_being_responded_to(&self) -> Option<u16> {
        self.get_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO)
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        self.get_uid(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn requested_sop_class_uid(&self) -> Option<String> {
        self.get_uid(tags::REQUESTED_SOP_CLASS_UID)
    }

    /// The SOP class targeted by the command,
    /// affected or requested.
    pub fn sop_class_uid(&self) -> Option<String> {
        self.affected_sop_class_uid()
            .or_else(|| self.requested_sop_class_uid())
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        self.get_uid(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn requested_sop_instance_uid(&self) -> Option<String> {
        self.get_uid(tags::REQUESTED_SOP_INSTANCE_UID)
    }

    /// The raw status code, present in responses.
    pub fn status(&self) -> Option<u16> {
        self.get_u16(tags::STATUS)
    }

    pub fn status_code(&self) -> Option<Status> {
        self.status().map(Status)
    }

    /// Whether a data set follows this command.
    pub fn has_data_set(&self) -> bool {
        self.get_u16(tags::COMMAND_DATA_SET_TYPE)
            .map_or(false, |value| value != NO_DATA_SET)
    }

    /// Whether this is a response with a pending status.
    pub fn is_pending(&self) -> bool {
        self.status_code().map_or(false, Status::is_pending)
    }

    /// Encode the command set in Implicit VR Little Endian,
    /// starting with a freshly computed _Command Group Length_.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut obj = self.obj.clone();
        obj.remove_element(tags::COMMAND_GROUP_LENGTH);
        let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut body = Vec::new();
        obj.write_dataset_with_ts(&mut body, &ts)
            .context(EncodeCommandSnafu)?;

        let mut data = Vec::with_capacity(body.len() + 12);
        // (0000,0000) UL, 4 bytes
        data.extend_from_slice(&[0, 0, 0, 0, 4, 0, 0, 0]);
        data.extend_from_slice(&(body.len() as u32).to_le_bytes());
        data.extend_from_slice(&body);
        Ok(data)
    }

    /// Decode a command set encoded in Implicit VR Little Endian.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let obj = InMemDicomObject::read_dataset_with_ts(data, &ts).context(DecodeCommandSnafu)?;
        Ok(Command { obj })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command_field() {
            Some(field) => write!(f, "{}", field)?,
            None => write!(f, "command {:04X}H", self.command_field_code().unwrap_or(0))?,
        }
        if let Some(id) = self.message_id() {
            write!(f, " (id {})", id)?;
        }
        if let Some(id) = self.message_id_being_responded_to() {
            write!(f, " (responding to {})", id)?;
        }
        if let Some(status) = self.status_code() {
            write!(f, " [{}]", status)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn echo_request_encodes_with_group_length() {
        let rq = Command::echo_rq(7);
        let data = rq.encode().unwrap();

        // group length element first, covering the rest of the command
        assert_eq!(&data[0..8], &[0, 0, 0, 0, 4, 0, 0, 0]);
        let group_length = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        assert_eq!(group_length as usize, data.len() - 12);

        let decoded = Command::decode(&data).unwrap();
        assert_eq!(decoded.command_field(), Some(CommandField::CEchoRq));
        assert_eq!(decoded.message_id(), Some(7));
        assert_eq!(
            decoded.affected_sop_class_uid().as_deref(),
            Some("1.2.840.10008.1.1")
        );
        assert!(!decoded.has_data_set());
    }

    #[test]
    fn response_copies_request_identifiers() {
        let rq = Command::new(CommandField::CStoreRq)
            .with_message_id(3)
            .with_affected_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
            .with_affected_sop_instance_uid("1.2.3.4.5");
        let rsp = Command::response_to(&rq, Status::SUCCESS).unwrap();

        assert_eq!(rsp.command_field(), Some(CommandField::CStoreRsp));
        assert_eq!(rsp.message_id_being_responded_to(), Some(3));
        assert_eq!(rsp.message_id(), None);
        assert_eq!(
            rsp.affected_sop_class_uid().as_deref(),
            Some("1.2.840.10008.5.1.4.1.1.7")
        );
        assert_eq!(rsp.affected_sop_instance_uid().as_deref(), Some("1.2.3.4.5"));
        assert_eq!(rsp.status(), Some(0));
        assert!(Command::response_to(&rsp, Status::SUCCESS).is_none());
    }

    #[test]
    fn data_set_type_follows_declaration() {
        let mut rq = Command::new(CommandField::CFindRq);
        assert!(!rq.has_data_set());
        rq.set_data_set_present(true);
        assert!(rq.has_data_set());
        let decoded = Command::decode(&rq.encode().unwrap()).unwrap();
        assert!(decoded.has_data_set());
    }

    #[rstest]
    #[case(0x0000, false, true, false, false)]
    #[case(0xFF00, true, false, false, false)]
    #[case(0xFF01, true, false, false, false)]
    #[case(0xB007, false, false, true, false)]
    #[case(0xFE00, false, false, false, true)]
    #[case(0xA700, false, false, false, false)]
    #[case(0x0118, false, false, false, false)]
    fn status_classes(
        #[case] code: u16,
        #[case] pending: bool,
        #[case] success: bool,
        #[case] warning: bool,
        #[case] cancel: bool,
    ) {
        let status = Status(code);
        assert_eq!(status.is_pending(), pending);
        assert_eq!(status.is_success(), success);
        assert_eq!(status.is_warning(), warning);
        assert_eq!(status.is_cancel(), cancel);
        assert_eq!(status.is_failure(), !(pending || success || warning || cancel));
    }

    #[test]
    fn command_field_codes_are_consistent() {
        for code in 0..=0xFFFFu16 {
            if let Some(field) = CommandField::from_code(code) {
                assert_eq!(field.code(), code);
                if let Some(rsp) = field.response() {
                    assert!(rsp.is_response());
                    assert_eq!(rsp.code(), code | 0x8000);
                }
            }
        }
        assert!(CommandField::CCancelRq.response().is_none());
        assert!(!CommandField::CCancelRq.is_request());
    }
}
