//! Fuzz target for STUN Binding response decoding

#![no_main]

use arbitrary::Arbitrary;
use headlink_nat::stun::{TransactionId, decode_binding_response, encode_binding_response};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    transaction_id: TransactionId,
    /// Raw response bytes
    data: Vec<u8>,
    /// Mapped address for the well-formed path
    ip: u32,
    port: u16,
}

fuzz_target!(|input: Input| {
    let _ = decode_binding_response(&input.data, &input.transaction_id);

    let mapped = std::net::SocketAddrV4::new(input.ip.into(), input.port);
    let mut response = encode_binding_response(&input.transaction_id, mapped);
    assert_eq!(
        decode_binding_response(&response, &input.transaction_id).ok(),
        Some(mapped)
    );

    // Trailing garbage after a complete response must not panic
    response.extend_from_slice(&input.data);
    let _ = decode_binding_response(&response, &input.transaction_id);
});
