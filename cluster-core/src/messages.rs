//! Overlay protocol wire messages
//!
//! Manual prost definitions for the hive, pseudosettle and pricing
//! protocols. All streams carry length-delimited messages; encoding is
//! deterministic and canonical.

use prost::Message as ProstMessage;

/// Batch of signed peer records gossiped by the hive protocol.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Peers {
    #[prost(message, repeated, tag = "1")]
    pub peers: Vec<MopAddress>,
}

/// Signed (underlay, overlay) binding on the wire.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MopAddress {
    #[prost(bytes = "vec", tag = "1")]
    pub overlay: Vec<u8>,

    #[prost(bytes = "vec", tag = "2")]
    pub underlay: Vec<u8>,

    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,

    /// 32-byte proof-of-identity nonce.
    #[prost(bytes = "vec", tag = "4")]
    pub transaction: Vec<u8>,
}

/// Pseudosettle refresh request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Payment {
    #[prost(uint64, tag = "1")]
    pub amount: u64,

    /// Initiator wall clock, unix seconds.
    #[prost(uint64, tag = "2")]
    pub timestamp: u64,
}

/// Pseudosettle refresh response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PaymentAck {
    #[prost(uint64, tag = "1")]
    pub accepted_amount: u64,

    /// Responder wall clock, unix seconds.
    #[prost(uint64, tag = "2")]
    pub timestamp: u64,
}

/// One-shot payment threshold announcement sent on connect.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AnnouncePaymentThreshold {
    /// Decimal string so the threshold is not bound to a wire integer width.
    #[prost(string, tag = "1")]
    pub threshold: String,
}

/// Encode a message with its length-delimited frame.
pub fn encode_framed<M: ProstMessage>(msg: &M) -> Vec<u8> {
    msg.encode_length_delimited_to_vec()
}

/// Decode one length-delimited message from the front of `buf`.
pub fn decode_framed<M: ProstMessage + Default>(buf: &[u8]) -> Result<M, prost::DecodeError> {
    M::decode_length_delimited(buf)
}
