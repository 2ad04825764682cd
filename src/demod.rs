//! # Forward-link demodulation
//!
//! The reader talks pulse-interval encoding: every command opens with a
//! delimiter pulse, one data-0 reference symbol and an RTcal symbol whose
//! width is data-0 + data-1. Query commands append a TRcal symbol that
//! sets the backscatter link frequency. Everything after that preamble is
//! data, one symbol per edge, where the symbol width against RTcal/2
//! decides the bit.
//!
//! [`PieDecoder`] consumes the edge-to-edge tick counts captured by the
//! radio front end and assembles command bits MSB first into a bounded
//! buffer. It learns RTcal and TRcal per command, so the decision pivot
//! and the reply timing always follow the reader actually on the air.
//!
//! The decision itself mirrors the capture hardware: the pivot is kept as
//! `0xFFFF - RTcal/2` and a symbol is a one exactly when `ticks + pivot`
//! carries out of 16 bits.

/// Command buffer capacity. Sized well past the longest recognized
/// command so a Select with a full mask still fits.
pub const CMD_BUF_BYTES: usize = 64;

/// Shortest acceptable delimiter width, in capture-timer ticks.
pub const DELIM_MIN_TICKS: u16 = 0x10;
/// First delimiter width past the acceptance window.
pub const DELIM_MAX_TICKS: u16 = 0x40;

/// Receive deadline: no edge for this many ticks ends the command.
pub const RX_TIMEOUT_TICKS: u16 = 0x256;

/// Receive-path faults. Both silently restart reception; the tag never
/// answers a malformed forward link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeFault {
    /// The low pulse bracketing the command start was out of window.
    DelimiterNotFound,
    /// More bits arrived than the command buffer can hold.
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the rising edge that opens a candidate delimiter.
    Idle,
    /// Next edge closes the delimiter and must land in the window.
    Delimiter,
    /// First full symbol: the data-0 reference.
    Tari,
    /// Second symbol: RTcal, fixes the decision pivot.
    Rtcal,
    /// Third symbol: either TRcal or already the first data bit.
    FirstSymbol,
    /// Everything else is data.
    Data,
}

/// A fully or partially received command, borrowed from the decoder.
///
/// `bits` counts stored command bits; the preamble symbols are not part
/// of the count. The last byte is right aligned while a byte is still
/// filling, exactly as the bits were shifted in.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub cmd: &'a [u8],
    pub bits: u16,
    /// TRcal width in ticks; 0 when the preamble carried none.
    pub trcal: u16,
}

pub struct PieDecoder {
    phase: Phase,
    tari: u16,
    rtcal: u16,
    trcal: u16,
    pivot: u16,
    buf: [u8; CMD_BUF_BYTES],
    bits: u16,
}

impl PieDecoder {
    pub fn new() -> Self {
        PieDecoder {
            phase: Phase::Idle,
            tari: 0,
            rtcal: 0,
            trcal: 0,
            pivot: 0,
            buf: [0; CMD_BUF_BYTES],
            bits: 0,
        }
    }

    /// Drop any partial command and re-arm for the next delimiter.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.trcal = 0;
        self.bits = 0;
        self.buf = [0; CMD_BUF_BYTES];
    }

    /// Data-0 reference width of the current command, in ticks.
    pub fn tari(&self) -> u16 {
        self.tari
    }

    pub fn rtcal(&self) -> u16 {
        self.rtcal
    }

    /// Feed one captured edge interval.
    pub fn feed(&mut self, ticks: u16) -> Result<(), DecodeFault> {
        match self.phase {
            Phase::Idle => {
                // the edge itself opens the delimiter; the elapsed time
                // before it is idle carrier
                self.phase = Phase::Delimiter;
                Ok(())
            }
            Phase::Delimiter => {
                if (DELIM_MIN_TICKS..DELIM_MAX_TICKS).contains(&ticks) {
                    self.phase = Phase::Tari;
                    Ok(())
                } else {
                    self.reset();
                    Err(DecodeFault::DelimiterNotFound)
                }
            }
            Phase::Tari => {
                self.tari = ticks;
                self.phase = Phase::Rtcal;
                Ok(())
            }
            Phase::Rtcal => {
                self.rtcal = ticks;
                self.pivot = 0xFFFF - ticks / 2;
                self.phase = Phase::FirstSymbol;
                Ok(())
            }
            Phase::FirstSymbol => {
                self.phase = Phase::Data;
                if ticks >= self.rtcal {
                    self.trcal = ticks;
                    Ok(())
                } else {
                    self.push_symbol(ticks)
                }
            }
            Phase::Data => self.push_symbol(ticks),
        }
    }

    pub fn frame(&self) -> Frame<'_> {
        Frame {
            cmd: &self.buf,
            bits: self.bits,
            trcal: self.trcal,
        }
    }

    fn push_symbol(&mut self, ticks: u16) -> Result<(), DecodeFault> {
        let (_, carry) = ticks.overflowing_add(self.pivot);
        let idx = (self.bits / 8) as usize;
        if idx >= CMD_BUF_BYTES {
            self.reset();
            return Err(DecodeFault::Overflow);
        }
        self.buf[idx] = (self.buf[idx] << 1) | carry as u8;
        self.bits += 1;
        Ok(())
    }
}

impl Default for PieDecoder {
    fn default() -> Self {
        Self::new()
    }
}
