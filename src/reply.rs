//! # Reply assembly
//!
//! Each reply the tag can backscatter has a fixed layout with the CRC in
//! the last two bytes, high byte first. Buffers whose payload never
//! changes get their CRC once at boot; the rest reseal on update. The
//! Read reply is special: its image is rebuilt per command because the
//! leading header bit shifts payload, handle and CRC off byte alignment.

use crate::crc::{crc16, crc16_read_reply};
use crate::modulator::TxFrame;

pub const EPC_BYTES: usize = 12;
/// PC word + EPC, the CRC-covered span of an ACK reply.
const ACK_PAYLOAD: usize = 2 + EPC_BYTES;
/// Application payload limit of a Read reply.
pub const READ_DATA_MAX: usize = 16;

/// RN16 answer to a Query. With slotted inventory the token pool feeds
/// this buffer per slot and the reply is the bare 16-bit token; the
/// single-slot build keeps one boot-time token and appends a CRC.
pub struct QueryReply {
    buf: [u8; 4],
    with_crc: bool,
}

impl QueryReply {
    pub fn new(rn16: u16, with_crc: bool) -> Self {
        let mut reply = QueryReply {
            buf: [0; 4],
            with_crc,
        };
        reply.set_rn16(rn16.to_be_bytes());
        reply
    }

    pub fn set_rn16(&mut self, rn: [u8; 2]) {
        self.buf[..2].copy_from_slice(&rn);
        if self.with_crc {
            let crc = crc16(&self.buf[..2]);
            self.buf[2] = (crc >> 8) as u8;
            self.buf[3] = crc as u8;
        }
    }

    pub fn rn16(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    pub fn frame(&self) -> TxFrame<'_> {
        TxFrame {
            bytes: &self.buf,
            bits: if self.with_crc { 32 } else { 16 },
        }
    }
}

/// PC + EPC + CRC, the singulation reply.
pub struct AckReply {
    buf: [u8; ACK_PAYLOAD + 2],
}

impl AckReply {
    /// Assemble without sealing; sensor-in-EPC builds seal after the
    /// first sample instead.
    pub fn new(pc: u16, epc: &[u8; EPC_BYTES]) -> Self {
        let mut buf = [0u8; ACK_PAYLOAD + 2];
        buf[..2].copy_from_slice(&pc.to_be_bytes());
        buf[2..2 + EPC_BYTES].copy_from_slice(epc);
        AckReply { buf }
    }

    /// Compute the CRC over PC + EPC.
    pub fn seal(&mut self) {
        let crc = crc16(&self.buf[..ACK_PAYLOAD]);
        self.buf[ACK_PAYLOAD] = (crc >> 8) as u8;
        self.buf[ACK_PAYLOAD + 1] = crc as u8;
    }

    /// Embed a fresh sensor sample in the EPC field: byte 0 carries the
    /// sensor type, the sample follows, and the CRC is recomputed.
    pub fn set_sensor_id(&mut self, type_id: u8, data: &[u8]) {
        self.buf[2] = type_id;
        let n = data.len().min(EPC_BYTES - 1);
        self.buf[3..3 + n].copy_from_slice(&data[..n]);
        self.seal();
    }

    /// The PC + EPC image, which doubles as the EPC-bank memory that
    /// Select masks are matched against (bank bit address 16 onward).
    pub fn pc_epc(&self) -> &[u8] {
        &self.buf[..ACK_PAYLOAD]
    }

    pub fn frame(&self) -> TxFrame<'_> {
        TxFrame {
            bytes: &self.buf,
            bits: (self.buf.len() * 8) as u16,
        }
    }
}

/// New handle + CRC, the Req_RN answer.
pub struct ReqRnReply {
    buf: [u8; 4],
}

impl ReqRnReply {
    pub fn new() -> Self {
        ReqRnReply { buf: [0; 4] }
    }

    pub fn set_handle(&mut self, handle: u16) {
        self.buf[..2].copy_from_slice(&handle.to_be_bytes());
        let crc = crc16(&self.buf[..2]);
        self.buf[2] = (crc >> 8) as u8;
        self.buf[3] = crc as u8;
    }

    pub fn frame(&self) -> TxFrame<'_> {
        TxFrame {
            bytes: &self.buf,
            bits: 32,
        }
    }
}

impl Default for ReqRnReply {
    fn default() -> Self {
        Self::new()
    }
}

/// Read answer: header bit, payload, handle, CRC. The payload is staged
/// separately from the on-air image so repeated Reads never re-shift
/// already shifted bytes.
pub struct ReadReply {
    data: [u8; READ_DATA_MAX],
    len: usize,
    image: [u8; READ_DATA_MAX + 5],
}

impl ReadReply {
    pub fn new() -> Self {
        ReadReply {
            data: [0; READ_DATA_MAX],
            // one word of zeros until the application stages a payload
            len: 2,
            image: [0; READ_DATA_MAX + 5],
        }
    }

    /// Stage the application payload served by Read.
    pub fn stage(&mut self, data: &[u8]) {
        let n = data.len().min(READ_DATA_MAX);
        self.data[..n].copy_from_slice(&data[..n]);
        self.len = n;
    }

    /// Rebuild the on-air image for this handle.
    pub fn finalize(&mut self, handle: u16) {
        self.image = [0; READ_DATA_MAX + 5];
        self.image[..self.len].copy_from_slice(&self.data[..self.len]);
        self.image[self.len..self.len + 2].copy_from_slice(&handle.to_be_bytes());
        crc16_read_reply(&mut self.image, self.len);
    }

    pub fn frame(&self) -> TxFrame<'_> {
        TxFrame {
            bytes: &self.image,
            bits: (8 * (self.len + 4) + 1) as u16,
        }
    }
}

impl Default for ReadReply {
    fn default() -> Self {
        Self::new()
    }
}
