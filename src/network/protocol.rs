//! Text codec for the DCC control strings carried over the chat channel.
//!
//! The chat layer hands us the CTCP payload already split on whitespace,
//! with the leading `DCC` stripped, e.g. `["SEND", "file.bin", "2130706433",
//! "5000", "1024"]`. File names may contain spaces, so the name is rebuilt
//! from whatever leading tokens remain once the fixed trailing fields have
//! been taken off the end. That makes names ending in number-like words
//! inherently ambiguous; such offers are flagged rather than rejected.

use crate::{DccError, Result};
use std::borrow::Cow;
use std::net::Ipv4Addr;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DccMessage {
    SendOffer(SendOffer),
    ChatOffer(ChatOffer),
    ResumeRequest(ResumeMessage),
    AcceptResume(ResumeMessage),
    Reject(Reject),
}

/// `SEND <file> <ip> <port> <size> [token]`
///
/// A zero port with a token is a passive offer. A non-zero port with a token
/// is the receiver's answer to one of our passive offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOffer {
    pub file_name: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub size: u64,
    pub token: Option<String>,
    /// The name could also have been split differently.
    pub ambiguous_name: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOffer {
    pub extension: String,
    pub address: Ipv4Addr,
    pub port: u16,
    pub token: Option<String>,
}

/// Shared shape of `RESUME` and `ACCEPT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeMessage {
    pub file_name: String,
    pub port: u16,
    pub position: u64,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reject {
    Send { file_name: String },
    Chat,
}

impl SendOffer {
    pub fn is_passive(&self) -> bool {
        self.port == 0 && self.token.is_some()
    }

    pub fn is_passive_ack(&self) -> bool {
        self.port != 0 && self.token.is_some()
    }
}

impl DccMessage {
    pub fn verb(&self) -> &'static str {
        match self {
            DccMessage::SendOffer(_) => "SEND",
            DccMessage::ChatOffer(_) => "CHAT",
            DccMessage::ResumeRequest(_) => "RESUME",
            DccMessage::AcceptResume(_) => "ACCEPT",
            DccMessage::Reject(_) => "REJECT",
        }
    }
}

pub fn encode_numeric_ip(address: Ipv4Addr) -> String {
    u32::from(address).to_string()
}

/// Accepts the legacy 32-bit decimal form and, for lenient peers, a dotted quad.
pub fn decode_numeric_ip(value: &str) -> Result<Ipv4Addr> {
    if let Ok(numeric) = value.parse::<u32>() {
        return Ok(Ipv4Addr::from(numeric));
    }
    value
        .parse::<Ipv4Addr>()
        .map_err(|_| DccError::Protocol(format!("invalid address '{}'", value)))
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

fn quote_file_name(name: &str) -> Cow<'_, str> {
    if name.chars().any(char::is_whitespace) {
        Cow::Owned(format!("\"{}\"", name))
    } else {
        Cow::Borrowed(name)
    }
}

fn strip_quotes(name: &str) -> String {
    if name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
        name[1..name.len() - 1].to_string()
    } else {
        name.to_string()
    }
}

pub fn encode_send_offer(file_name: &str, address: Ipv4Addr, port: u16, size: u64) -> String {
    format!(
        "SEND {} {} {} {}",
        quote_file_name(file_name),
        encode_numeric_ip(address),
        port,
        size
    )
}

pub fn encode_send_offer_passive(
    file_name: &str,
    address: Ipv4Addr,
    size: u64,
    token: &str,
) -> String {
    format!(
        "SEND {} {} 0 {} {}",
        quote_file_name(file_name),
        encode_numeric_ip(address),
        size,
        token
    )
}

/// Receiver's answer to a passive offer: where the sender should connect.
pub fn encode_passive_send_ack(
    file_name: &str,
    address: Ipv4Addr,
    port: u16,
    size: u64,
    token: &str,
) -> String {
    format!(
        "SEND {} {} {} {} {}",
        quote_file_name(file_name),
        encode_numeric_ip(address),
        port,
        size,
        token
    )
}

pub fn encode_resume_request(file_name: &str, port: u16, position: u64) -> String {
    format!("RESUME {} {} {}", quote_file_name(file_name), port, position)
}

pub fn encode_resume_request_passive(file_name: &str, position: u64, token: &str) -> String {
    format!(
        "RESUME {} 0 {} {}",
        quote_file_name(file_name),
        position,
        token
    )
}

pub fn encode_accept(file_name: &str, port: u16, position: u64) -> String {
    format!("ACCEPT {} {} {}", quote_file_name(file_name), port, position)
}

pub fn encode_accept_passive(file_name: &str, position: u64, token: &str) -> String {
    format!(
        "ACCEPT {} 0 {} {}",
        quote_file_name(file_name),
        position,
        token
    )
}

pub fn encode_chat_offer(address: Ipv4Addr, port: u16) -> String {
    format!("CHAT chat {} {}", encode_numeric_ip(address), port)
}

pub fn encode_chat_offer_passive(address: Ipv4Addr, token: &str) -> String {
    format!("CHAT chat {} 0 {}", encode_numeric_ip(address), token)
}

pub fn encode_reject_send(file_name: &str) -> String {
    format!("REJECT SEND {}", quote_file_name(file_name))
}

pub fn encode_reject_chat() -> String {
    "REJECT CHAT chat".to_string()
}

pub fn decode<S: AsRef<str>>(args: &[S]) -> Result<DccMessage> {
    let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
    let (verb, rest) = args
        .split_first()
        .ok_or_else(|| DccError::Protocol("empty DCC request".to_string()))?;

    match verb.to_ascii_uppercase().as_str() {
        "SEND" => decode_send(rest).map(DccMessage::SendOffer),
        "CHAT" => decode_chat(rest).map(DccMessage::ChatOffer),
        "RESUME" => decode_resume("RESUME", rest).map(DccMessage::ResumeRequest),
        "ACCEPT" => decode_resume("ACCEPT", rest).map(DccMessage::AcceptResume),
        "REJECT" => decode_reject(rest).map(DccMessage::Reject),
        other => Err(DccError::protocol(other, "unsupported DCC type")),
    }
}

fn parse_port(verb: &str, value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .map_err(|_| DccError::protocol(verb, format!("invalid port '{}'", value)))
}

fn parse_u64(verb: &str, field: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| DccError::protocol(verb, format!("invalid {} '{}'", field, value)))
}

fn recover_file_name(verb: &str, parts: &[&str]) -> Result<String> {
    if parts.is_empty() {
        return Err(DccError::protocol(verb, "missing file name"));
    }
    let name = strip_quotes(&parts.join(" "));
    if name.is_empty() {
        return Err(DccError::protocol(verb, "empty file name"));
    }
    Ok(name)
}

fn parse_send_fields(rest: &[&str], with_token: bool) -> Result<SendOffer> {
    let trailing = if with_token { 4 } else { 3 };
    if rest.len() < trailing + 1 {
        return Err(DccError::protocol("SEND", "wrong number of arguments"));
    }
    let split = rest.len() - trailing;
    let (name_parts, fields) = rest.split_at(split);

    let file_name = recover_file_name("SEND", name_parts)?;
    let address = decode_numeric_ip(fields[0])
        .map_err(|_| DccError::protocol("SEND", format!("invalid address '{}'", fields[0])))?;
    let port = parse_port("SEND", fields[1])?;
    let size = parse_u64("SEND", "size", fields[2])?;
    let token = if with_token {
        Some(fields[3].to_string())
    } else {
        None
    };

    if port == 0 && token.is_none() {
        return Err(DccError::protocol("SEND", "zero port without token"));
    }

    Ok(SendOffer {
        file_name,
        address,
        port,
        size,
        token,
        ambiguous_name: false,
    })
}

fn decode_send(rest: &[&str]) -> Result<SendOffer> {
    let with_token = parse_send_fields(rest, true);
    let plain = parse_send_fields(rest, false);

    match (with_token, plain) {
        (Ok(mut offer), Ok(alternative)) => {
            warn!(
                "DCC SEND name is ambiguous: using '{}' (token {:?}), could also be '{}'",
                offer.file_name, offer.token, alternative.file_name
            );
            offer.ambiguous_name = true;
            Ok(offer)
        }
        (Ok(offer), Err(_)) => Ok(offer),
        (Err(_), Ok(offer)) => Ok(offer),
        (Err(_), Err(e)) => Err(e),
    }
}

fn decode_chat(rest: &[&str]) -> Result<ChatOffer> {
    let (extension, address, port, token) = match rest {
        [extension, address, port] => (*extension, *address, *port, None),
        [extension, address, port, token] => (*extension, *address, *port, Some(*token)),
        _ => return Err(DccError::protocol("CHAT", "wrong number of arguments")),
    };

    let address = decode_numeric_ip(address)
        .map_err(|_| DccError::protocol("CHAT", format!("invalid address '{}'", address)))?;
    let port = parse_port("CHAT", port)?;
    if port == 0 && token.is_none() {
        return Err(DccError::protocol("CHAT", "zero port without token"));
    }

    Ok(ChatOffer {
        extension: extension.to_string(),
        address,
        port,
        token: token.map(str::to_string),
    })
}

fn decode_resume(verb: &str, rest: &[&str]) -> Result<ResumeMessage> {
    let len = rest.len();

    if len >= 4 && rest[len - 3] == "0" {
        let file_name = recover_file_name(verb, &rest[..len - 3])?;
        let position = parse_u64(verb, "position", rest[len - 2])?;
        return Ok(ResumeMessage {
            file_name,
            port: 0,
            position,
            token: Some(rest[len - 1].to_string()),
        });
    }

    if len < 3 {
        return Err(DccError::protocol(verb, "wrong number of arguments"));
    }
    let file_name = recover_file_name(verb, &rest[..len - 2])?;
    let port = parse_port(verb, rest[len - 2])?;
    let position = parse_u64(verb, "position", rest[len - 1])?;

    Ok(ResumeMessage {
        file_name,
        port,
        position,
        token: None,
    })
}

fn decode_reject(rest: &[&str]) -> Result<Reject> {
    match rest.split_first() {
        Some((kind, name)) if kind.eq_ignore_ascii_case("SEND") => Ok(Reject::Send {
            file_name: recover_file_name("REJECT", name)?,
        }),
        Some((kind, _)) if kind.eq_ignore_ascii_case("CHAT") => Ok(Reject::Chat),
        _ => Err(DccError::protocol("REJECT", "unknown reject type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_text(text: &str) -> Result<DccMessage> {
        decode(&tokenize(text))
    }

    #[test]
    fn test_numeric_ip_roundtrip() {
        let addresses = [
            Ipv4Addr::new(0, 0, 0, 0),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 254),
            Ipv4Addr::new(10, 255, 0, 7),
            Ipv4Addr::new(255, 255, 255, 255),
        ];
        for address in addresses {
            assert_eq!(decode_numeric_ip(&encode_numeric_ip(address)).unwrap(), address);
        }
        assert_eq!(encode_numeric_ip(Ipv4Addr::new(127, 0, 0, 1)), "2130706433");
    }

    #[test]
    fn test_numeric_ip_accepts_dotted_and_rejects_ipv6() {
        assert_eq!(
            decode_numeric_ip("192.168.0.1").unwrap(),
            Ipv4Addr::new(192, 168, 0, 1)
        );
        assert!(decode_numeric_ip("::1").is_err());
        assert!(decode_numeric_ip("4294967296").is_err());
    }

    #[test]
    fn test_decode_quoted_name_with_space() {
        let message = decode_text("SEND \"a b.txt\" 2130706433 5000 1024").unwrap();
        let DccMessage::SendOffer(offer) = message else {
            panic!("expected a send offer");
        };
        assert_eq!(offer.file_name, "a b.txt");
        assert_eq!(offer.address, Ipv4Addr::LOCALHOST);
        assert_eq!(offer.port, 5000);
        assert_eq!(offer.size, 1024);
        assert_eq!(offer.token, None);
        assert!(!offer.ambiguous_name);
    }

    #[test]
    fn test_encode_quotes_names_with_spaces() {
        let text = encode_send_offer("a b.txt", Ipv4Addr::LOCALHOST, 5000, 1024);
        assert_eq!(text, "SEND \"a b.txt\" 2130706433 5000 1024");
        assert_eq!(
            encode_send_offer("plain.txt", Ipv4Addr::LOCALHOST, 5000, 1),
            "SEND plain.txt 2130706433 5000 1"
        );
    }

    #[test]
    fn test_decode_unquoted_name_with_spaces() {
        let DccMessage::SendOffer(offer) =
            decode_text("SEND my holiday photo.jpg 3232235777 4000 99").unwrap()
        else {
            panic!("expected a send offer");
        };
        assert_eq!(offer.file_name, "my holiday photo.jpg");
        assert_eq!(offer.address, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_decode_passive_offer() {
        let text = encode_send_offer_passive("file.bin", Ipv4Addr::LOCALHOST, 2048, "tok42");
        assert_eq!(text, "SEND file.bin 2130706433 0 2048 tok42");

        let DccMessage::SendOffer(offer) = decode_text(&text).unwrap() else {
            panic!("expected a send offer");
        };
        assert!(offer.is_passive());
        assert_eq!(offer.file_name, "file.bin");
        assert_eq!(offer.size, 2048);
        assert_eq!(offer.token.as_deref(), Some("tok42"));
    }

    #[test]
    fn test_numeric_trailing_word_is_flagged() {
        // "report 2130706433" plain, or "report" with token "7".
        let DccMessage::SendOffer(offer) =
            decode_text("SEND report 2130706433 5000 1024 7").unwrap()
        else {
            panic!("expected a send offer");
        };
        assert!(offer.ambiguous_name);
        assert_eq!(offer.file_name, "report");
        assert!(offer.is_passive_ack());
    }

    #[test]
    fn test_non_numeric_size_is_rejected() {
        let err = decode_text("SEND file.bin 2130706433 5000 big").unwrap_err();
        assert!(matches!(err, DccError::Protocol(_)));
        assert!(decode_text("SEND file.bin 2130706433 notaport 10").is_err());
        assert!(decode_text("SEND 2130706433 5000").is_err());
        assert!(decode_text("SEND file.bin 2130706433 0 10").is_err());
    }

    #[test]
    fn test_decode_resume_and_accept() {
        let DccMessage::ResumeRequest(resume) =
            decode_text(&encode_resume_request("movie.mkv", 5000, 4096)).unwrap()
        else {
            panic!("expected resume");
        };
        assert_eq!(resume.file_name, "movie.mkv");
        assert_eq!(resume.port, 5000);
        assert_eq!(resume.position, 4096);
        assert_eq!(resume.token, None);

        let DccMessage::AcceptResume(accept) =
            decode_text(&encode_accept_passive("two words", 4096, "9")).unwrap()
        else {
            panic!("expected accept");
        };
        assert_eq!(accept.file_name, "two words");
        assert_eq!(accept.port, 0);
        assert_eq!(accept.position, 4096);
        assert_eq!(accept.token.as_deref(), Some("9"));
    }

    #[test]
    fn test_decode_resume_rejects_bad_position() {
        assert!(decode_text("RESUME movie.mkv 5000 half").is_err());
        assert!(decode_text("ACCEPT movie.mkv").is_err());
    }

    #[test]
    fn test_decode_chat() {
        let DccMessage::ChatOffer(chat) =
            decode_text(&encode_chat_offer(Ipv4Addr::LOCALHOST, 6000)).unwrap()
        else {
            panic!("expected chat");
        };
        assert_eq!(chat.extension, "chat");
        assert_eq!(chat.port, 6000);

        let DccMessage::ChatOffer(chat) =
            decode_text(&encode_chat_offer_passive(Ipv4Addr::LOCALHOST, "3")).unwrap()
        else {
            panic!("expected chat");
        };
        assert_eq!(chat.port, 0);
        assert_eq!(chat.token.as_deref(), Some("3"));

        assert!(decode_text("CHAT chat 2130706433").is_err());
    }

    #[test]
    fn test_decode_reject() {
        assert_eq!(
            decode_text(&encode_reject_send("a b.txt")).unwrap(),
            DccMessage::Reject(Reject::Send {
                file_name: "a b.txt".to_string()
            })
        );
        assert_eq!(
            decode_text(&encode_reject_chat()).unwrap(),
            DccMessage::Reject(Reject::Chat)
        );
        assert!(decode_text("REJECT").is_err());
    }

    #[test]
    fn test_unknown_verb() {
        assert!(decode_text("XMIT file.bin 1 2 3").is_err());
        assert!(decode::<&str>(&[]).is_err());
    }
}
