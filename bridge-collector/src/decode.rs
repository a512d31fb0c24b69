//! Decoding of `SocketBridge` logs.
//!
//! ```text
//! event SocketBridge(
//!     uint256 amount, address token, uint256 toChainId, bytes32 bridgeName,
//!     address sender, address receiver, bytes32 metadata
//! )
//! ```
//!
//! None of the parameters are indexed, so all seven live in the log data as
//! 32 byte words.
use num_bigint::BigUint;
use thiserror::Error;

use bridge_common::types::BridgeEvent;

use crate::source::RawLog;

pub const SOCKET_BRIDGE_EVENT: &str = "SocketBridge";

/// keccak256 of the event signature.
pub const SOCKET_BRIDGE_TOPIC: &str =
    "0x74594da9e31ee4068e17809037db37db496702bf7d8d63afe6f97949277d1609";

const WORD: usize = 32;
const WORDS: usize = 7;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected event {0}")]
    UnexpectedEvent(String),
    #[error("unexpected topic {0}")]
    UnexpectedTopic(String),
    #[error("log data is not valid hex: {0}")]
    InvalidHex(String),
    #[error("log data is {0} bytes long, expected {len}", len = WORD * WORDS)]
    InvalidLength(usize),
    #[error("word {0} does not hold an address")]
    InvalidAddress(usize),
}

pub fn decode_bridge_event(log: &RawLog) -> Result<BridgeEvent, DecodeError> {
    if let Some(name) = log.event_name.as_deref() {
        if name != SOCKET_BRIDGE_EVENT {
            return Err(DecodeError::UnexpectedEvent(name.to_owned()));
        }
    }
    if let Some(topic) = log.topics.first() {
        if !topic.eq_ignore_ascii_case(SOCKET_BRIDGE_TOPIC) {
            return Err(DecodeError::UnexpectedTopic(topic.clone()));
        }
    }

    let data = hex::decode(log.data.strip_prefix("0x").unwrap_or(&log.data))
        .map_err(|error| DecodeError::InvalidHex(error.to_string()))?;
    if data.len() != WORD * WORDS {
        return Err(DecodeError::InvalidLength(data.len()));
    }
    let words: Vec<&[u8]> = data.chunks_exact(WORD).collect();

    Ok(BridgeEvent {
        event_name: SOCKET_BRIDGE_EVENT.to_owned(),
        amount: uint(words[0]),
        token: address(words[1], 1)?,
        to_chain_id: uint(words[2]),
        bridge_name: bytes32_label(words[3]),
        sender: address(words[4], 4)?,
        receiver: address(words[5], 5)?,
        metadata: format!("0x{}", hex::encode(words[6])),
        block_number: log.block_number,
        transaction_hash: log.transaction_hash.clone(),
        log_index: log.log_index,
    })
}

fn uint(word: &[u8]) -> String {
    BigUint::from_bytes_be(word).to_string()
}

fn address(word: &[u8], position: usize) -> Result<String, DecodeError> {
    let (padding, address) = word.split_at(WORD - 20);
    if padding.iter().any(|byte| *byte != 0) {
        return Err(DecodeError::InvalidAddress(position));
    }
    Ok(format!("0x{}", hex::encode(address)))
}

/// Bridge names are short ASCII strings right-padded with zeros. Anything
/// else is kept as hex.
fn bytes32_label(word: &[u8]) -> String {
    let end = word.iter().rposition(|byte| *byte != 0).map_or(0, |i| i + 1);
    let text = &word[..end];

    if !text.is_empty() && text.iter().all(|byte| byte.is_ascii_graphic() || *byte == b' ') {
        String::from_utf8_lossy(text).into_owned()
    } else {
        format!("0x{}", hex::encode(word))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn uint_word(value: u64) -> String {
        format!("{value:064x}")
    }

    fn address_word(address: &str) -> String {
        format!("{:0>64}", address.trim_start_matches("0x"))
    }

    fn label_word(label: &str) -> String {
        format!("{:0<64}", hex::encode(label))
    }

    /// A `SocketBridge` log as the node would deliver it.
    pub(crate) fn socket_bridge_log(
        token: &str,
        amount: u64,
        to_chain_id: u64,
        bridge_name: &str,
    ) -> RawLog {
        let data = [
            uint_word(amount),
            address_word(token),
            uint_word(to_chain_id),
            label_word(bridge_name),
            address_word("0x00000000000000000000000000000000000000a1"),
            address_word("0x00000000000000000000000000000000000000b2"),
            "11".repeat(32),
        ]
        .concat();

        RawLog {
            event_name: Some(SOCKET_BRIDGE_EVENT.to_owned()),
            address: "0x3a23f943181408eac424116af7b7790c94cb97a5".to_owned(),
            data: format!("0x{data}"),
            topics: vec![SOCKET_BRIDGE_TOPIC.to_owned()],
            block_number: Some(19_000_000),
            transaction_hash: Some(format!("0x{}", "ab".repeat(32))),
            log_index: Some(3),
        }
    }

    #[test]
    fn test_decode_socket_bridge_log() {
        let log = socket_bridge_log(
            "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48",
            2_500_000,
            8453,
            "socket",
        );

        let event = decode_bridge_event(&log).unwrap();

        assert_eq!(event.event_name, "SocketBridge");
        assert_eq!(event.token, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        assert_eq!(event.amount, "2500000");
        assert_eq!(event.to_chain_id, "8453");
        assert_eq!(event.bridge_name, "socket");
        assert_eq!(event.sender, "0x00000000000000000000000000000000000000a1");
        assert_eq!(event.receiver, "0x00000000000000000000000000000000000000b2");
        assert_eq!(event.metadata, format!("0x{}", "11".repeat(32)));
        assert_eq!(event.block_number, Some(19_000_000));
        assert_eq!(event.log_index, Some(3));
    }

    #[test]
    fn test_decode_amount_wider_than_u64() {
        let mut log = socket_bridge_log("0x01", 0, 1, "cctp");
        let amount = "f".repeat(64);
        log.data = format!("0x{}{}", amount, &log.data[66..]);

        let event = decode_bridge_event(&log).unwrap();

        assert_eq!(
            event.amount,
            "115792089237316195423570985008687907853269984665640564039457584007913129639935"
        );
    }

    #[test]
    fn test_decode_rejects_other_events() {
        let mut log = socket_bridge_log("0x01", 1, 1, "socket");
        log.event_name = Some("Transfer".to_owned());
        assert_eq!(
            decode_bridge_event(&log),
            Err(DecodeError::UnexpectedEvent("Transfer".to_owned()))
        );

        let mut log = socket_bridge_log("0x01", 1, 1, "socket");
        log.topics = vec![format!("0x{}", "00".repeat(32))];
        assert!(matches!(
            decode_bridge_event(&log),
            Err(DecodeError::UnexpectedTopic(_))
        ));
    }

    #[test]
    fn test_decode_rejects_malformed_data() {
        let mut log = socket_bridge_log("0x01", 1, 1, "socket");
        log.data.truncate(log.data.len() - 64);
        assert_eq!(
            decode_bridge_event(&log),
            Err(DecodeError::InvalidLength(192))
        );

        log.data = "0xnothex".to_owned();
        assert!(matches!(
            decode_bridge_event(&log),
            Err(DecodeError::InvalidHex(_))
        ));

        let mut log = socket_bridge_log("0x01", 1, 1, "socket");
        let dirty_token = format!("{}{}", "ff", &address_word("0x01")[2..]);
        log.data = format!("0x{}{}{}", &log.data[2..66], dirty_token, &log.data[130..]);
        assert_eq!(
            decode_bridge_event(&log),
            Err(DecodeError::InvalidAddress(1))
        );
    }

    #[test]
    fn test_bridge_name_falls_back_to_hex() {
        let mut word = [0u8; 32];
        word[0] = 0xff;
        assert_eq!(bytes32_label(&word), format!("0x{}{}", "ff", "00".repeat(31)));
        assert_eq!(bytes32_label(&[0u8; 32]), format!("0x{}", "00".repeat(32)));

        let mut word = [0u8; 32];
        word[..5].copy_from_slice(b"hop\0x");
        assert!(bytes32_label(&word).starts_with("0x"));

        let mut word = [0u8; 32];
        word[..8].copy_from_slice(b"across-2");
        assert_eq!(bytes32_label(&word), "across-2");
    }
}
