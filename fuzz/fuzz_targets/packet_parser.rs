//! Fuzz target for datagram parsing
//!
//! Everything the receive loop reads off the socket goes through the probe
//! decoder and the packet parser; neither may panic.

#![no_main]

use headlink_core::Packet;
use headlink_nat::hole_punch::Probe;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = Probe::decode(data);

    if let Ok(packet) = Packet::parse(data) {
        // Re-encoding a parsed packet reproduces the datagram
        assert_eq!(packet.encode(), data);
    }
});
