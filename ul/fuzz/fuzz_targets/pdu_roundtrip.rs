#![no_main]
use std::error::Error;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, bool, &[u8])| {
    let (maxlen, strict, data) = data;
    let _ = fuzz(maxlen, strict, data);
});

fn fuzz(maxlen: u32, strict: bool, mut data: &[u8]) -> Result<(), Box<dyn Error>> {
    // deserialize random bytes, skipping incomplete input
    let pdu = match dicom_ulp::pdu::read_pdu(&mut data, maxlen, strict)? {
        Some(pdu) => pdu,
        None => return Ok(()),
    };

    // serialize pdu back to bytes,
    // which may legitimately fail (e.g. text not encodable as written)
    let bytes = dicom_ulp::pdu::writer::encode_pdu(&pdu)?;

    // the re-encoded PDU may have grown (e.g. release bodies, padding),
    // so read it back with the most lenient limit
    let pdu2 = dicom_ulp::pdu::read_pdu(
        &mut bytes.as_slice(),
        dicom_ulp::pdu::MAXIMUM_PDU_SIZE,
        false,
    )
    .expect("serialized pdu should always deserialize")
    .expect("serialized pdu should be complete");

    // assert equivalence
    assert_eq!(
        pdu, pdu2,
        "pdu should be equal after serializing to/from bytes"
    );

    Ok(())
}
