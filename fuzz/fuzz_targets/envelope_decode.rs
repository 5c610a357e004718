//! Arbitrary bytes never panic the envelope decoder, and anything it accepts
//! decodes again after a re-encode.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pairlink_proto::Envelope;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = Envelope::decode(data) else {
        return;
    };
    let encoded = envelope.encode().expect("decoded envelope re-encodes");
    let again = Envelope::decode(&encoded).expect("re-encoded envelope decodes");
    assert_eq!(envelope.message_type, again.message_type);
    assert_eq!(envelope.sub_type, again.sub_type);
});
