use dicom_ulp::association::{
    client::ClientAssociationOptions, server::ServerAssociationOptions, CloseReason,
};
use dicom_ulp::dimse::{write_message, Command, CommandField, DimseReader, Incoming};
use dicom_ulp::pdu::{PDataValue, PDataValueType};
use dicom_ulp::Pdu;
use rstest::rstest;
use std::io::Read;
use std::net::TcpListener;
use std::thread::spawn;

static CT_IMAGE_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.2";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

const MAX_PDU_LENGTH: u32 = 4096;
const DATA_LENGTH: usize = 10_000;

fn store_rq() -> Command {
    Command::new(CommandField::CStoreRq)
        .with_message_id(1)
        .with_affected_sop_class_uid(CT_IMAGE_STORAGE_SOP_CLASS)
        .with_affected_sop_instance_uid("1.2.3.4.5")
        .with_priority(0)
}

fn patterned_data() -> Vec<u8> {
    (0..DATA_LENGTH).map(|i| (i % 251) as u8).collect()
}

/// Bytes taken by the PDVs in a P-DATA-TF PDU.
fn body_length(data: &[PDataValue]) -> usize {
    data.iter().map(|pdv| 6 + pdv.data.len()).sum()
}

#[rstest]
#[case(false)]
#[case(true)]
fn large_data_set_is_fragmented(#[case] pack: bool) {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = ServerAssociationOptions::new()
        .with_transfer_syntaxes(CT_IMAGE_STORAGE_SOP_CLASS, [IMPLICIT_VR_LE])
        .max_pdu_length(MAX_PDU_LENGTH);

    let h = spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let association = scp.establish(stream).unwrap();

        // first message, observed as it comes through the wire
        let mut pdus = Vec::new();
        loop {
            let data = match association.receive().unwrap() {
                Pdu::PData { data } => data,
                pdu => panic!("Unexpected PDU {:?}", pdu),
            };
            let done = data
                .iter()
                .any(|pdv| pdv.value_type == PDataValueType::Data && pdv.is_last);
            pdus.push(data);
            if done {
                break;
            }
        }

        // second message, through the DIMSE reader
        let mut reader = DimseReader::new(&association);
        let command = match reader.read_command().unwrap() {
            Incoming::Message {
                presentation_context_id,
                command,
            } => {
                assert_eq!(presentation_context_id, 1);
                command
            }
            incoming => panic!("Unexpected {:?}", incoming),
        };
        assert!(command.has_data_set());
        let mut data_set = reader.into_data_set().expect("a data set");
        let mut received = Vec::new();
        data_set.read_to_end(&mut received).unwrap();
        drop(data_set);

        match DimseReader::new(&association).read_command().unwrap() {
            Incoming::ReleaseRequested => association.send(&Pdu::ReleaseRP).unwrap(),
            incoming => panic!("Unexpected {:?}", incoming),
        }
        (pdus, command, received)
    });

    let association = ClientAssociationOptions::new()
        .with_presentation_context(CT_IMAGE_STORAGE_SOP_CLASS, vec![IMPLICIT_VR_LE])
        .establish_tcp(addr)
        .unwrap();
    assert_eq!(association.peer_max_pdu_length(), MAX_PDU_LENGTH);

    let data = patterned_data();
    for _ in 0..2 {
        let mut source = data.clone();
        write_message(&association, 1, &store_rq(), Some(&mut source), pack).unwrap();
    }
    association.release().unwrap();
    assert_eq!(association.close_reason(), Some(CloseReason::Released));

    let (pdus, command, received) = h.join().unwrap();

    // the command comes first, alone unless packing
    let first = &pdus[0];
    assert_eq!(first[0].value_type, PDataValueType::Command);
    assert!(first[0].is_last);
    assert_eq!(first.len(), if pack { 2 } else { 1 });

    for pdu in &pdus {
        assert!(body_length(pdu) <= MAX_PDU_LENGTH as usize);
    }
    let fragments: Vec<&PDataValue> = pdus
        .iter()
        .flatten()
        .filter(|pdv| pdv.value_type == PDataValueType::Data)
        .collect();
    assert!(fragments.len() >= 3);
    let (last, others) = fragments.split_last().unwrap();
    assert!(last.is_last);
    assert!(others.iter().all(|pdv| !pdv.is_last));
    let reassembled: Vec<u8> = fragments
        .iter()
        .flat_map(|pdv| pdv.data.iter().copied())
        .collect();
    assert_eq!(reassembled, data);

    assert_eq!(command.command_field(), Some(CommandField::CStoreRq));
    assert_eq!(
        command.affected_sop_instance_uid().as_deref(),
        Some("1.2.3.4.5")
    );
    assert_eq!(received, data);
}
