use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::transport::sequence::SeqNum;
use crate::wire;

pub const PROTOCOL_VERSION: u8 = 1;

/// The kind discriminant is the first byte of every datagram. CONNECT / DISCONNECT /
///  PING / PONG are transport-native control packets, separate from the application
///  codec; DATA and ACK belong to the per-class ARQ channels.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    Connect = 0,
    Disconnect = 1,
    Ping = 2,
    Pong = 3,
    Data = 4,
    Ack = 5,
}

/// One ordering/reliability-class sub-stream of a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DeliveryClass {
    /// Fire-and-forget: sequenced for statistics only, never retransmitted.
    Unreliable = 0,
    /// Selective-repeat ARQ with in-order dispatch.
    ReliableOrdered = 1,
}

pub const ALL_DELIVERY_CLASSES: [DeliveryClass; 2] =
    [DeliveryClass::Unreliable, DeliveryClass::ReliableOrdered];

/// A decoded datagram.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Connect { protocol_version: u8 },
    Disconnect { reason: String },
    Ping,
    Pong,
    Data { class: DeliveryClass, seq: SeqNum, payload: Bytes },
    Ack { class: DeliveryClass, seq: SeqNum },
}

impl Frame {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Frame::Connect { protocol_version } => {
                buf.put_u8(PacketKind::Connect.into());
                buf.put_u8(*protocol_version);
            }
            Frame::Disconnect { reason } => {
                buf.put_u8(PacketKind::Disconnect.into());
                wire::put_string(buf, reason);
            }
            Frame::Ping => buf.put_u8(PacketKind::Ping.into()),
            Frame::Pong => buf.put_u8(PacketKind::Pong.into()),
            Frame::Data { class, seq, payload } => {
                buf.put_u8(PacketKind::Data.into());
                buf.put_u8((*class).into());
                seq.ser(buf);
                buf.put_slice(payload);
            }
            Frame::Ack { class, seq } => {
                buf.put_u8(PacketKind::Ack.into());
                buf.put_u8((*class).into());
                seq.ser(buf);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    /// NB: takes ownership of the receive buffer so the DATA payload is a zero-copy slice.
    pub fn try_deser(mut buf: Bytes) -> anyhow::Result<Frame> {
        let kind = match PacketKind::try_from(buf.try_get_u8()?) {
            Ok(kind) => kind,
            Err(e) => bail!("unknown packet kind: {}", e),
        };

        let frame = match kind {
            PacketKind::Connect => Frame::Connect { protocol_version: buf.try_get_u8()? },
            PacketKind::Disconnect => Frame::Disconnect { reason: wire::try_get_string(&mut buf)? },
            PacketKind::Ping => Frame::Ping,
            PacketKind::Pong => Frame::Pong,
            PacketKind::Data => {
                let class = try_get_class(&mut buf)?;
                let seq = SeqNum::try_deser(&mut buf)?;
                Frame::Data { class, seq, payload: buf }
            }
            PacketKind::Ack => {
                let class = try_get_class(&mut buf)?;
                let seq = SeqNum::try_deser(&mut buf)?;
                Frame::Ack { class, seq }
            }
        };
        Ok(frame)
    }
}

fn try_get_class(buf: &mut impl Buf) -> anyhow::Result<DeliveryClass> {
    match DeliveryClass::try_from(buf.try_get_u8()?) {
        Ok(class) => Ok(class),
        Err(e) => bail!("unknown delivery class: {}", e),
    }
}

/// Writes a DATA frame header; the ARQ sender appends the payload and stores the final
///  wire bytes for retransmission.
pub fn write_data_header(buf: &mut BytesMut, class: DeliveryClass, seq: SeqNum) {
    buf.put_u8(PacketKind::Data.into());
    buf.put_u8(class.into());
    seq.ser(buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::connect(Frame::Connect { protocol_version: 1 })]
    #[case::disconnect(Frame::Disconnect { reason: "shutting down".to_string() })]
    #[case::ping(Frame::Ping)]
    #[case::pong(Frame::Pong)]
    #[case::data(Frame::Data {
        class: DeliveryClass::ReliableOrdered,
        seq: SeqNum::from_raw(1023),
        payload: Bytes::from_static(&[8, 1, 2, 3]),
    })]
    #[case::data_empty(Frame::Data {
        class: DeliveryClass::Unreliable,
        seq: SeqNum::ZERO,
        payload: Bytes::new(),
    })]
    #[case::ack(Frame::Ack { class: DeliveryClass::ReliableOrdered, seq: SeqNum::from_raw(512) })]
    fn test_frame_round_trip(#[case] frame: Frame) {
        let bytes = frame.to_bytes();
        assert_eq!(Frame::try_deser(bytes).unwrap(), frame);
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::unknown_kind(&[99])]
    #[case::unknown_class(&[4, 7, 0, 0])]
    #[case::truncated_seq(&[4, 1, 0])]
    #[case::ack_missing_seq(&[5, 1])]
    #[case::seq_out_of_modulus(&[5, 1, 255, 255])]
    fn test_malformed_frames_are_errors(#[case] raw: &'static [u8]) {
        assert!(Frame::try_deser(Bytes::from_static(raw)).is_err());
    }

    #[test]
    fn test_data_header_matches_frame_ser() {
        let mut buf = BytesMut::new();
        write_data_header(&mut buf, DeliveryClass::ReliableOrdered, SeqNum::from_raw(17));
        buf.put_slice(&[1, 2, 3]);

        let expected = Frame::Data {
            class: DeliveryClass::ReliableOrdered,
            seq: SeqNum::from_raw(17),
            payload: Bytes::from_static(&[1, 2, 3]),
        }
        .to_bytes();
        assert_eq!(buf.freeze(), expected);
    }
}
