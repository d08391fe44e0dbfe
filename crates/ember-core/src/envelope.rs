//! The message envelope: the single unit of communication between services,
//! between a worker's reactor and a service, and between the timer wheel and
//! a service. Every pump in the worker event loop (reactor, timer, inbox
//! drain) ultimately produces or consumes one of these.

use crate::buffer::Buffer;

/// The kind of an envelope — what produced it and how its `payload` and
/// `subtype` should be interpreted. Eleven kinds per spec §3.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum EnvelopeType {
    Unknown = 0,
    System = 1,
    Timer = 2,
    ServiceMsg = 3,
    ServiceResponse = 4,
    SocketTcp = 5,
    SocketUdp = 6,
    SocketWs = 7,
    SocketHttp = 8,
    Error = 9,
    Log = 10,
    Quit = 11,
}

impl EnvelopeType {
    pub fn from_u8(v: u8) -> EnvelopeType {
        match v {
            1 => EnvelopeType::System,
            2 => EnvelopeType::Timer,
            3 => EnvelopeType::ServiceMsg,
            4 => EnvelopeType::ServiceResponse,
            5 => EnvelopeType::SocketTcp,
            6 => EnvelopeType::SocketUdp,
            7 => EnvelopeType::SocketWs,
            8 => EnvelopeType::SocketHttp,
            9 => EnvelopeType::Error,
            10 => EnvelopeType::Log,
            11 => EnvelopeType::Quit,
            _ => EnvelopeType::Unknown,
        }
    }
}

/// `session` encodes request/response/one-way in a single signed field:
/// positive is an outstanding request awaiting a response carrying the same
/// magnitude negated, negative is that response, zero is fire-and-forget.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Session {
    Request(i64),
    Response(i64),
    OneWay,
}

impl Session {
    #[inline]
    pub fn from_raw(raw: i64) -> Session {
        if raw > 0 {
            Session::Request(raw)
        } else if raw < 0 {
            Session::Response(-raw)
        } else {
            Session::OneWay
        }
    }

    #[inline]
    pub fn into_raw(self) -> i64 {
        match self {
            Session::Request(id) => id,
            Session::Response(id) => -id,
            Session::OneWay => 0,
        }
    }

    /// The session id a reply to this envelope should carry.
    #[inline]
    pub fn reply_raw(self) -> i64 {
        match self {
            Session::Request(id) => -id,
            Session::Response(id) => -id,
            Session::OneWay => 0,
        }
    }
}

/// One message. `sender`/`receiver` are raw `Address` values (0 receiver
/// means broadcast to every service subscribed to `type`); `payload` is an
/// owned buffer so an envelope can be handed across an inbox boundary
/// without the sender retaining access to it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: EnvelopeType,
    pub subtype: u8,
    pub sender: u32,
    pub receiver: u32,
    pub session: i64,
    pub payload: Buffer,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, sender: u32, receiver: u32, session: i64, payload: Buffer) -> Envelope {
        Envelope {
            kind,
            subtype: 0,
            sender,
            receiver,
            session,
            payload,
        }
    }

    #[inline]
    pub fn with_subtype(mut self, subtype: u8) -> Envelope {
        self.subtype = subtype;
        self
    }

    #[inline]
    pub fn session(&self) -> Session {
        Session::from_raw(self.session)
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.receiver == 0
    }

    /// Builds the response envelope to send back to `self.sender`, on the
    /// matching session id, carrying `payload`.
    pub fn reply(&self, kind: EnvelopeType, payload: Buffer) -> Envelope {
        Envelope::new(kind, self.receiver, self.sender, self.session().reply_raw(), payload)
    }

    pub fn quit() -> Envelope {
        Envelope::new(EnvelopeType::Quit, 0, 0, 0, Buffer::new(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_type_roundtrips_through_u8() {
        for raw in 0u8..=11 {
            let kind = EnvelopeType::from_u8(raw);
            assert_eq!(kind as u8, raw);
        }
    }

    #[test]
    fn unknown_type_is_the_fallback() {
        assert_eq!(EnvelopeType::from_u8(200), EnvelopeType::Unknown);
    }

    #[test]
    fn session_classifies_by_sign() {
        assert_eq!(Session::from_raw(7), Session::Request(7));
        assert_eq!(Session::from_raw(-7), Session::Response(7));
        assert_eq!(Session::from_raw(0), Session::OneWay);
    }

    #[test]
    fn reply_raw_negates_request_session() {
        let req = Session::Request(42);
        assert_eq!(req.reply_raw(), -42);
    }

    #[test]
    fn reply_builds_envelope_with_swapped_addresses_and_negated_session() {
        let mut req = Envelope::new(EnvelopeType::ServiceMsg, 10, 20, 5, Buffer::new(4));
        req.payload.write_back(b"ping");

        let mut resp_payload = Buffer::new(4);
        resp_payload.write_back(b"pong");
        let resp = req.reply(EnvelopeType::ServiceResponse, resp_payload);

        assert_eq!(resp.sender, 20);
        assert_eq!(resp.receiver, 10);
        assert_eq!(resp.session, -5);
        assert_eq!(resp.payload.as_slice(), b"pong");
    }

    #[test]
    fn one_way_reply_session_stays_zero() {
        let msg = Envelope::new(EnvelopeType::ServiceMsg, 1, 2, 0, Buffer::new(0));
        let resp = msg.reply(EnvelopeType::ServiceResponse, Buffer::new(0));
        assert_eq!(resp.session, 0);
    }

    #[test]
    fn broadcast_receiver_is_zero() {
        let env = Envelope::new(EnvelopeType::System, 1, 0, 0, Buffer::new(0));
        assert!(env.is_broadcast());
    }
}
