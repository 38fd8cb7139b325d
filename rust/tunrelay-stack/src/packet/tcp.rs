//! TCP header codec.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Data |     |N|C|E|U|A|P|R|S|F|                               |
//! | Offset| Res.|S|W|C|R|C|S|S|Y|I|            Window             |
//! |       |     | |R|E|G|K|H|T|N|N|                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |         Urgent Pointer        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Options                    |    Padding    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::BufMut;

use crate::error::HeaderError;

pub const TCP_MIN_HEADER_LEN: usize = 20;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WINDOW_SCALE: u8 = 3;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_TIMESTAMP: u8 = 8;

/// Largest shift RFC 7323 allows for window scaling.
pub const MAX_WINDOW_SCALE: u8 = 14;

/// Bytes a timestamp option occupies, padding included.
pub const TIMESTAMP_OPTION_LEN: usize = 12;

/// TCP control bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
    pub ns: bool,
}

impl TcpFlags {
    /// Flags from byte 13 plus the NS bit carried in byte 12.
    pub fn from_bits(flags: u8, ns: bool) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
            ns,
        }
    }

    /// Byte 13 of the header. NS is not included.
    pub fn to_byte(self) -> u8 {
        let mut flags = 0u8;
        if self.fin {
            flags |= 0x01;
        }
        if self.syn {
            flags |= 0x02;
        }
        if self.rst {
            flags |= 0x04;
        }
        if self.psh {
            flags |= 0x08;
        }
        if self.ack {
            flags |= 0x10;
        }
        if self.urg {
            flags |= 0x20;
        }
        if self.ece {
            flags |= 0x40;
        }
        if self.cwr {
            flags |= 0x80;
        }
        flags
    }

    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }

    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }

    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }

    pub fn rst_only() -> Self {
        Self { rst: true, ..Default::default() }
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (self.syn, "SYN"),
            (self.ack, "ACK"),
            (self.psh, "PSH"),
            (self.fin, "FIN"),
            (self.rst, "RST"),
            (self.urg, "URG"),
            (self.ece, "ECE"),
            (self.cwr, "CWR"),
            (self.ns, "NS"),
        ];
        let mut first = true;
        for (set, name) in names {
            if set {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

/// RFC 7323 timestamp option values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpTimestamp {
    /// TSval of the sender of this segment.
    pub sender: u32,
    /// TSecr: the peer value being echoed.
    pub reply_to: u32,
}

/// Options this stack understands. Unknown and SACK block options are
/// skipped on decode and never re-emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub timestamp: Option<TcpTimestamp>,
}

impl TcpOptions {
    pub fn is_empty(&self) -> bool {
        self.mss.is_none() && self.window_scale.is_none() && !self.sack_permitted && self.timestamp.is_none()
    }

    /// Parse an option block. Malformed trailing options end the scan
    /// without failing the header.
    pub fn parse(mut data: &[u8]) -> Self {
        let mut opts = Self::default();
        while let Some(&kind) = data.first() {
            match kind {
                OPT_END => break,
                OPT_NOP => {
                    data = &data[1..];
                    continue;
                }
                _ => {}
            }
            let Some(&len) = data.get(1) else { break };
            let len = usize::from(len);
            if len < 2 || len > data.len() {
                break;
            }
            let body = &data[2..len];
            match (kind, body.len()) {
                (OPT_MSS, 2) => opts.mss = Some(u16::from_be_bytes([body[0], body[1]])),
                (OPT_WINDOW_SCALE, 1) => opts.window_scale = Some(body[0].min(MAX_WINDOW_SCALE)),
                (OPT_SACK_PERMITTED, 0) => opts.sack_permitted = true,
                (OPT_TIMESTAMP, 8) => {
                    opts.timestamp = Some(TcpTimestamp {
                        sender: u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                        reply_to: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                    })
                }
                // SACK blocks (kind 5) and unknown kinds
                _ => {}
            }
            data = &data[len..];
        }
        opts
    }

    /// Encoded length in bytes, always a multiple of four.
    pub fn encoded_len(&self) -> usize {
        let mut len = 0;
        if self.mss.is_some() {
            len += 4;
        }
        if self.timestamp.is_some() {
            len += TIMESTAMP_OPTION_LEN;
        } else if self.sack_permitted {
            len += 4;
        }
        if self.window_scale.is_some() {
            len += 4;
        }
        len
    }

    /// Canonical layout: MSS, SACK-permitted folded into the timestamp
    /// word padding when both are present, then window scale.
    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        if let Some(mss) = self.mss {
            buf.put_u8(OPT_MSS);
            buf.put_u8(4);
            buf.put_u16(mss);
        }
        match (self.timestamp, self.sack_permitted) {
            (Some(ts), sack) => {
                if sack {
                    buf.put_u8(OPT_SACK_PERMITTED);
                    buf.put_u8(2);
                } else {
                    buf.put_u8(OPT_NOP);
                    buf.put_u8(OPT_NOP);
                }
                buf.put_u8(OPT_TIMESTAMP);
                buf.put_u8(10);
                buf.put_u32(ts.sender);
                buf.put_u32(ts.reply_to);
            }
            (None, true) => {
                buf.put_u8(OPT_NOP);
                buf.put_u8(OPT_NOP);
                buf.put_u8(OPT_SACK_PERMITTED);
                buf.put_u8(2);
            }
            (None, false) => {}
        }
        if let Some(shift) = self.window_scale {
            buf.put_u8(OPT_NOP);
            buf.put_u8(OPT_WINDOW_SCALE);
            buf.put_u8(3);
            buf.put_u8(shift);
        }
    }
}

/// Decoded TCP header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    pub options: TcpOptions,
}

impl TcpHeader {
    pub fn decode(buf: &[u8], offset: usize) -> Result<Self, HeaderError> {
        let data = buf.get(offset..).unwrap_or_default();
        if data.len() < TCP_MIN_HEADER_LEN {
            return Err(HeaderError::TooShort {
                layer: "TCP",
                expected: TCP_MIN_HEADER_LEN,
                actual: data.len(),
            });
        }

        let data_offset = data[12] >> 4;
        if data_offset < 5 {
            return Err(HeaderError::InvalidDataOffset(data_offset));
        }
        let header_len = usize::from(data_offset) * 4;
        if data.len() < header_len {
            return Err(HeaderError::OptionsOverrun {
                needed: header_len,
                available: data.len(),
            });
        }

        Ok(Self {
            source_port: u16::from_be_bytes([data[0], data[1]]),
            destination_port: u16::from_be_bytes([data[2], data[3]]),
            sequence_number: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: TcpFlags::from_bits(data[13], data[12] & 0x01 != 0),
            window_size: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent_pointer: u16::from_be_bytes([data[18], data[19]]),
            options: TcpOptions::parse(&data[TCP_MIN_HEADER_LEN..header_len]),
        })
    }

    pub fn header_len(&self) -> usize {
        TCP_MIN_HEADER_LEN + self.options.encoded_len()
    }

    /// Data offset in 32-bit words.
    pub fn data_offset(&self) -> u8 {
        (self.header_len() / 4) as u8
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.source_port);
        buf.put_u16(self.destination_port);
        buf.put_u32(self.sequence_number);
        buf.put_u32(self.ack_number);
        buf.put_u8((self.data_offset() << 4) | u8::from(self.flags.ns));
        buf.put_u8(self.flags.to_byte());
        buf.put_u16(self.window_size);
        buf.put_u16(self.checksum);
        buf.put_u16(self.urgent_pointer);
        self.options.encode_into(buf);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len());
        self.encode_into(&mut out);
        out
    }

    /// Header for a reply on the same flow: ports swapped, everything else
    /// reset.
    pub fn reversed(&self) -> Self {
        Self {
            source_port: self.destination_port,
            destination_port: self.source_port,
            ..Default::default()
        }
    }
}
