use std::error;
use std::fmt;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned while decoding a raw datagram into a Packet
#[derive(Debug, PartialEq)]
pub enum DecodeError {
    Malformed(String),
    UnknownOpcode(u16),
}

impl error::Error for DecodeError {}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::Malformed(e) => write!(f, "Malformed packet: {}", e),
            DecodeError::UnknownOpcode(op) => write!(f, "Unknown opcode: {}", op),
        }
    }
}

type DecodeResult<T> = Result<T, DecodeError>;

/// Length of the opcode plus block number (or error code) header.
pub const HEADER_SIZE: usize = 4;

/// Block size used when no blksize option has been negotiated.
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// An ordered list of `name`/`value` option pairs as carried by requests and OACKs.
pub type OptionList = Vec<(String, String)>;

/// Represents the mode for a file the client wishes to read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
}

impl FileMode {
    /// Accepts the user-facing spellings: `ascii`/`netascii` and `binary`/`octet`.
    pub fn from_user_str(s: &str) -> Option<FileMode> {
        match s.to_ascii_lowercase().as_str() {
            "ascii" | "netascii" => Some(FileMode::NetAscii),
            "binary" | "octet" => Some(FileMode::Octet),
            _ => None,
        }
    }

    /// The canonical mode string sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    OptionRefused,
    Unknown(u16),
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            0 => ErrorCode::Undefined,
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionRefused,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        match code {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::OptionRefused => 8,
            ErrorCode::Unknown(other) => other,
        }
    }
}

/// The two-byte opcode leading every TFTP datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
    OAck,
}

impl OpCode {
    fn as_u16(self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
            OpCode::OAck => 6,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,

        /// Options offered to the server, in the order they are sent.
        options: OptionList,
    },

    /// A write request packet. Only ever built, never acted upon by the client.
    WriteReq {
        path: String,
        mode: FileMode,
        options: OptionList,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },

    /// An option acknowledgment packet
    OptionAck { options: OptionList },
}

pub fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given, or None if the buffer ran out before a 0 byte was found.
fn string_from_buffer(buf: &[u8]) -> Option<(String, usize)> {
    let end = buf.iter().position(|&c| c == 0x00)?;
    Some((buf[..end].iter().map(|&c| char::from(c)).collect(), end))
}

/// Reads the opcode at the start of a buffer of at least two bytes.
pub fn retrieve_op_code(buf: &[u8]) -> DecodeResult<OpCode> {
    if buf.len() < 2 {
        return Err(DecodeError::Malformed("Packet too short to hold an opcode".to_string()));
    }
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        6 => Ok(OpCode::OAck),
        _ => Err(DecodeError::UnknownOpcode(rawcode)),
    }
}

fn parse_request(buf: &[u8]) -> DecodeResult<(String, FileMode, OptionList)> {
    let (path, path_end) = string_from_buffer(buf).ok_or_else(|| {
        DecodeError::Malformed("Request path must be terminated with a null byte!".to_string())
    })?;

    let rest = &buf[path_end + 1..];
    let (raw_mode, mode_end) = string_from_buffer(rest).ok_or_else(|| {
        DecodeError::Malformed("Mode must be terminated with a null byte!".to_string())
    })?;

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        _ => return Err(DecodeError::Malformed(format!("Unknown file mode: '{raw_mode}'"))),
    };

    let mut options = OptionList::new();
    let mut cursor = &rest[mode_end + 1..];
    while !cursor.is_empty() {
        let (name, name_end) = string_from_buffer(cursor).ok_or_else(|| {
            DecodeError::Malformed("Option name must be terminated with a null byte!".to_string())
        })?;
        cursor = &cursor[name_end + 1..];
        let (value, value_end) = string_from_buffer(cursor).ok_or_else(|| {
            DecodeError::Malformed(format!("Value of option '{name}' must be terminated with a null byte!"))
        })?;
        cursor = &cursor[value_end + 1..];
        options.push((name, value));
    }

    Ok((path, mode, options))
}

fn parse_option_ack(buf: &[u8]) -> OptionList {
    // The option list is not length-framed, so anything that is not a complete
    // name/value pair at the end of the datagram is dropped.
    let mut options = OptionList::new();
    let mut cursor = buf;
    while let Some((name, name_end)) = string_from_buffer(cursor) {
        cursor = &cursor[name_end + 1..];
        match string_from_buffer(cursor) {
            Some((value, value_end)) => {
                cursor = &cursor[value_end + 1..];
                options.push((name, value));
            }
            None => break,
        }
    }
    options
}

fn require_header(buf: &[u8], what: &str) -> DecodeResult<()> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::Malformed(format!("{what} packet too short!")));
    }
    Ok(())
}

fn write_options(buf: &mut Vec<u8>, options: &[(String, String)]) {
    for (name, value) in options {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0x00);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0x00);
    }
}

fn write_request(buf: &mut Vec<u8>, path: &str, mode: FileMode, options: &[(String, String)]) {
    buf.extend_from_slice(path.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(mode.as_str().as_bytes());
    buf.push(0x00);
    write_options(buf, options);
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> DecodeResult<Packet> {
        match retrieve_op_code(buf)? {
            OpCode::Rrq => {
                let (path, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode, options })
            }
            OpCode::Wrq => {
                let (path, mode, options) = parse_request(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode, options })
            }
            OpCode::Data => {
                require_header(buf, "Data")?;
                Ok(Packet::Data {
                    block: u16_from_buffer(&buf[2..4]),
                    data: Vec::from(&buf[4..]),
                })
            }
            OpCode::Ack => {
                require_header(buf, "Ack")?;
                Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) })
            }
            OpCode::Error => {
                require_header(buf, "Error")?;
                let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
                // Be lenient with servers that forget the terminating null byte.
                let message = match string_from_buffer(&buf[4..]) {
                    Some((message, _)) => message,
                    None => buf[4..].iter().map(|&c| char::from(c)).collect(),
                };
                Ok(Packet::Error { code, message })
            }
            OpCode::OAck => Ok(Packet::OptionAck { options: parse_option_ack(&buf[2..]) }),
        }
    }

    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
            Packet::OptionAck { .. } => OpCode::OAck,
        }
    }

    /// Serializes the packet into its wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&self.op_code().as_u16().to_be_bytes());
        match self {
            Packet::ReadReq { path, mode, options } | Packet::WriteReq { path, mode, options } => {
                write_request(&mut buf, path, *mode, options);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                buf.extend_from_slice(&u16::from(*code).to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
            }
            Packet::OptionAck { options } => write_options(&mut buf, options),
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> OptionList {
        pairs.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F, 0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: octet
            0x6F, 0x63, 0x74, 0x65, 0x74, 0x00];

        let packet = Packet::parse_from_buf(&buf);
        assert_eq!(
            packet.unwrap(),
            Packet::ReadReq { path: "/path/to/data.txt".to_string(), mode: FileMode::Octet, options: vec![] }
        );
    }

    #[test]
    fn test_read_req_with_options_encodes_exactly() {
        let packet = Packet::ReadReq {
            path: "a.txt".to_string(),
            mode: FileMode::NetAscii,
            options: opts(&[("blksize", "1024"), ("timeout", "3"), ("tsize", "0")]),
        };
        let mut expected = vec![0x00, 0x01];
        expected.extend_from_slice(b"a.txt\0netascii\0blksize\01024\0timeout\03\0tsize\00\0");
        assert_eq!(packet.to_bytes(), expected);
        assert_eq!(Packet::parse_from_buf(&expected).unwrap(), packet);
    }

    #[test]
    fn test_write_req_encodes_with_opcode_two() {
        let packet = Packet::WriteReq {
            path: "up".to_string(),
            mode: FileMode::Octet,
            options: opts(&[("tsize", "42")]),
        };
        let bytes = packet.to_bytes();
        assert_eq!(&bytes[..2], &[0x00, 0x02]);
        assert_eq!(&bytes[2..], b"up\0octet\0tsize\042\0");
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0xBE, 0xEF];

        let packet = Packet::parse_from_buf(&buf);
        assert_eq!(packet.unwrap(), Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] });
    }

    #[test]
    fn test_block_numbers_are_binary_not_digits() {
        // Block 0x0A0B would read as "1011" if treated as ASCII-ish digits.
        let packet = Packet::parse_from_buf(&[0x00, 0x04, 0x0A, 0x0B]).unwrap();
        assert_eq!(packet, Packet::Ack { block: 2571 });
    }

    #[test]
    fn test_block_numbers_at_the_wraparound_edge() {
        for block in [1u16, 255, 256, 65534, 65535, 65535u16.wrapping_add(1)] {
            let ack = Packet::Ack { block };
            assert_eq!(Packet::parse_from_buf(&ack.to_bytes()).unwrap(), ack);
            let data = Packet::Data { block, data: vec![block as u8] };
            assert_eq!(Packet::parse_from_buf(&data.to_bytes()).unwrap(), data);
        }
        assert_eq!(Packet::Ack { block: 65535 }.to_bytes(), vec![0x00, 0x04, 0xFF, 0xFF]);
        assert_eq!(Packet::Ack { block: 0 }.to_bytes(), vec![0x00, 0x04, 0x00, 0x00]);
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        assert_eq!(Packet::parse_from_buf(&buf).unwrap(), Packet::Ack { block: 0x102f });
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x01,
            // Error message: Missing! with terminating nullchar
            0x4D, 0x69, 0x73, 0x73, 0x69, 0x6E, 0x67, 0x21, 0x00];

        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::Error { code: ErrorCode::FileNotFound, message: "Missing!".to_string() }
        );
    }

    #[test]
    fn test_error_packet_keeps_unknown_codes() {
        let packet = Packet::Error { code: ErrorCode::Unknown(42), message: "odd".to_string() };
        assert_eq!(packet.to_bytes(), b"\x00\x05\x00\x2aodd\x00".to_vec());
        assert_eq!(Packet::parse_from_buf(&packet.to_bytes()).unwrap(), packet);
    }

    #[test]
    fn test_option_ack_parses_pairs_in_order() {
        let mut buf = vec![0x00, 0x06];
        buf.extend_from_slice(b"tsize\01200\0BLKSIZE\0512\0");
        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::OptionAck { options: opts(&[("tsize", "1200"), ("BLKSIZE", "512")]) }
        );
    }

    #[test]
    fn test_option_ack_ignores_trailing_garbage() {
        let mut buf = vec![0x00, 0x06];
        buf.extend_from_slice(b"blksize\0512\0timeout\05");
        assert_eq!(
            Packet::parse_from_buf(&buf).unwrap(),
            Packet::OptionAck { options: opts(&[("blksize", "512")]) }
        );
        assert_eq!(
            Packet::parse_from_buf(&[0x00, 0x06]).unwrap(),
            Packet::OptionAck { options: vec![] }
        );
    }

    #[test]
    fn test_packet_parse_failures() {
        // Too short for an opcode
        assert!(matches!(Packet::parse_from_buf(&[0x10]), Err(DecodeError::Malformed(_))));
        // Invalid opcodes
        assert_eq!(Packet::parse_from_buf(&[0x10, 0x00]), Err(DecodeError::UnknownOpcode(0x1000)));
        assert_eq!(Packet::parse_from_buf(&[0x00, 0x07, 0x00, 0x01]), Err(DecodeError::UnknownOpcode(7)));
        assert_eq!(Packet::parse_from_buf(&[0x00, 0x00]), Err(DecodeError::UnknownOpcode(0)));
        // Unterminated path
        assert!(matches!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69]), Err(DecodeError::Malformed(_))));
        // Missing mode string
        assert!(matches!(Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00]), Err(DecodeError::Malformed(_))));
        // Invalid mode string
        assert!(matches!(
            Packet::parse_from_buf(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00]),
            Err(DecodeError::Malformed(_))
        ));
        // Unterminated option value
        assert!(matches!(
            Packet::parse_from_buf(b"\x00\x01f\x00octet\x00blksize\x00512"),
            Err(DecodeError::Malformed(_))
        ));
        // Truncated data and ack headers
        assert!(matches!(Packet::parse_from_buf(&[0x00, 0x03, 0x00]), Err(DecodeError::Malformed(_))));
        assert!(matches!(Packet::parse_from_buf(&[0x00, 0x04]), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_file_mode_synonyms() {
        assert_eq!(FileMode::from_user_str("ascii"), Some(FileMode::NetAscii));
        assert_eq!(FileMode::from_user_str("NetAscii"), Some(FileMode::NetAscii));
        assert_eq!(FileMode::from_user_str("binary"), Some(FileMode::Octet));
        assert_eq!(FileMode::from_user_str("octet"), Some(FileMode::Octet));
        assert_eq!(FileMode::from_user_str("mail"), None);
    }
}
