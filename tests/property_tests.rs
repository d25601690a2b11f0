//! Property-based tests for headlink
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Packet Codec Properties
// ============================================================================

mod packet_properties {
    use super::*;
    use headlink_core::packet::encode;
    use headlink_core::{HEADER_SIZE, Packet, PacketFlags};

    proptest! {
        /// Decoding an encoded packet reproduces every header field and the payload
        #[test]
        fn packet_roundtrip(
            channel_id in any::<u16>(),
            seq in any::<u32>(),
            ack in any::<bool>(),
            payload in prop::collection::vec(any::<u8>(), 0..=2048),
        ) {
            let flags = if ack { PacketFlags::new().with_ack() } else { PacketFlags::new() };
            let bytes = encode(channel_id, seq, &payload, flags);
            prop_assert_eq!(bytes.len(), HEADER_SIZE + payload.len());

            let packet = Packet::decode(&bytes).unwrap();
            prop_assert_eq!(packet.flags, flags);
            prop_assert_eq!(packet.channel_id, channel_id);
            prop_assert_eq!(packet.seq_num, seq);
            prop_assert_eq!(packet.payload, &payload[..]);
        }

        /// Anything shorter than the header is rejected
        #[test]
        fn runt_datagrams_rejected(data in prop::collection::vec(any::<u8>(), 0..HEADER_SIZE)) {
            prop_assert!(Packet::decode(&data).is_none());
        }

        /// Parsing never panics on arbitrary input
        #[test]
        fn parse_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = Packet::parse(&data);
        }
    }
}

// ============================================================================
// Channel Properties
// ============================================================================

mod channel_properties {
    use super::*;
    use headlink_core::packet::encode;
    use headlink_core::{Packet, PacketFlags, ReliableChannel, ReliableConfig, UnreliableChannel};
    use std::time::Duration;
    use tokio::time::Instant;

    fn data(seq: u32) -> Vec<u8> {
        encode(1, seq, &seq.to_be_bytes(), PacketFlags::new())
    }

    proptest! {
        /// next_seq_out advances by one per send and never per retransmission
        #[test]
        fn seq_advances_once_per_send(sends in 1usize..50, polls in 0usize..8) {
            let config = ReliableConfig {
                ack_timeout: Duration::from_millis(1),
                max_retransmits: 100,
                ..ReliableConfig::default()
            };
            let mut channel = ReliableChannel::new(1, config);
            let mut now = Instant::now();

            for expected in 0..sends {
                let (seq, _) = channel.prepare_send(b"x", now).unwrap();
                prop_assert_eq!(seq as usize, expected);
            }
            for _ in 0..polls {
                now += Duration::from_millis(10);
                let plan = channel.poll_retransmits(now);
                prop_assert_eq!(plan.resend.len(), sends);
            }
            prop_assert_eq!(channel.next_seq_out() as usize, sends);
            prop_assert_eq!(channel.pending_count(), sends);
        }

        /// Any arrival order, with duplicates, is delivered in order exactly once
        #[test]
        fn reliable_delivers_in_order(
            order in (1u32..40).prop_flat_map(|n| Just((0..n).collect::<Vec<u32>>()).prop_shuffle()),
            duplicates in prop::collection::vec(any::<prop::sample::Index>(), 0..10),
        ) {
            let mut arrivals = order.clone();
            for index in &duplicates {
                let seq = order[index.index(order.len())];
                let position = index.index(arrivals.len() + 1);
                arrivals.insert(position, seq);
            }

            let mut channel = ReliableChannel::new(1, ReliableConfig::default());
            let mut delivered = Vec::new();
            for seq in &arrivals {
                let bytes = data(*seq);
                let received = channel.on_receive(&Packet::decode(&bytes).unwrap());
                prop_assert!(received.ack.is_some());
                delivered.extend(received.delivered);
            }

            let expected: Vec<Vec<u8>> = (0..order.len() as u32).map(|s| s.to_be_bytes().to_vec()).collect();
            prop_assert_eq!(delivered, expected);
            prop_assert_eq!(channel.buffered_count(), 0);
            prop_assert_eq!(channel.next_seq_in() as usize, order.len());
        }

        /// Unreliable delivery is strictly increasing whatever the arrival order
        #[test]
        fn unreliable_accepts_increasing_only(arrivals in prop::collection::vec(0u32..64, 0..64)) {
            let mut channel = UnreliableChannel::new(1);
            let mut accepted: Vec<u32> = Vec::new();
            for seq in arrivals {
                let bytes = data(seq);
                if channel.on_receive(&Packet::decode(&bytes).unwrap()) {
                    accepted.push(seq);
                }
            }
            prop_assert!(accepted.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn unreliable_drops_stale_arrivals() {
        let mut channel = UnreliableChannel::new(1);
        let delivered: Vec<u32> = [2u32, 0, 3, 1]
            .into_iter()
            .filter(|&seq| {
                let bytes = data(seq);
                channel.on_receive(&Packet::decode(&bytes).unwrap())
            })
            .collect();
        assert_eq!(delivered, vec![2, 3]);
    }
}

// ============================================================================
// STUN Properties
// ============================================================================

mod stun_properties {
    use super::*;
    use headlink_nat::stun::{
        HEADER_SIZE, MAGIC_COOKIE, TransactionId, encode_binding_response, parse_binding_response,
    };
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn mapped_strategy() -> impl Strategy<Value = SocketAddrV4> {
        (any::<u32>(), any::<u16>()).prop_map(|(ip, port)| SocketAddrV4::new(Ipv4Addr::from(ip), port))
    }

    proptest! {
        /// A well-formed response decodes to the mapped address
        #[test]
        fn valid_response_decodes(tid in any::<TransactionId>(), mapped in mapped_strategy()) {
            let response = encode_binding_response(&tid, mapped);
            prop_assert_eq!(parse_binding_response(&response, &tid), Some(mapped));
        }

        /// Truncated responses are rejected
        #[test]
        fn truncated_rejected(tid in any::<TransactionId>(), mapped in mapped_strategy(), cut in 0usize..HEADER_SIZE) {
            let response = encode_binding_response(&tid, mapped);
            prop_assert_eq!(parse_binding_response(&response[..cut], &tid), None);
        }

        /// Any other transaction id is rejected
        #[test]
        fn mismatched_transaction_rejected(
            tid in any::<TransactionId>(),
            other in any::<TransactionId>(),
            mapped in mapped_strategy(),
        ) {
            prop_assume!(tid != other);
            let response = encode_binding_response(&tid, mapped);
            prop_assert_eq!(parse_binding_response(&response, &other), None);
        }

        /// Wrong cookie or message type is rejected
        #[test]
        fn bad_header_rejected(
            tid in any::<TransactionId>(),
            mapped in mapped_strategy(),
            cookie in any::<u32>(),
            msg_type in any::<u16>(),
        ) {
            let response = encode_binding_response(&tid, mapped);

            if cookie != MAGIC_COOKIE {
                let mut bad = response.clone();
                bad[4..8].copy_from_slice(&cookie.to_be_bytes());
                prop_assert_eq!(parse_binding_response(&bad, &tid), None);
            }
            if msg_type != 0x0101 {
                let mut bad = response;
                bad[0..2].copy_from_slice(&msg_type.to_be_bytes());
                prop_assert_eq!(parse_binding_response(&bad, &tid), None);
            }
        }
    }
}
