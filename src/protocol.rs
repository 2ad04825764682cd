//! # Tag protocol engine
//!
//! [`TagMachine`] is the pure heart of the tag: it owns the five-state
//! inventory machine, the slot counter, the session flags and the reply
//! buffers. It consumes decoded command frames and answers with what to
//! transmit and how to resume listening; nothing in here touches
//! hardware, which is what keeps every transition testable on the bench.
//!
//! Commands are dispatched the moment their recognition gate fires, so a
//! frame is offered after every received bit. A `None` from
//! [`TagMachine::on_frame`] means "keep listening": either the command is
//! still streaming in, or it failed its credential check and is silently
//! dropped.

use crate::cmd::{
    self, parse_ack, parse_query, parse_query_adjust, parse_query_rep, parse_read, parse_req_rn,
    parse_select, Command, MAX_QUERY_BITS, MAX_READ_BITS,
};
use crate::cmd::cmd_inventory::{QueryFields, SelFilter};
use crate::cmd::cmd_select::mask_matches;
use crate::demod::Frame;
use crate::lfsr::{Lfsr16, Rn16Pool};
use crate::modulator::{LinkParams, LinkTiming, TxFrame};
use crate::reply::{AckReply, QueryReply, ReadReply, ReqRnReply, EPC_BYTES};
use crate::session::Sessions;

/// Bit address of the PC word within the EPC memory bank.
const EPC_BANK_PC_START: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TagState {
    Ready,
    Arbitrate,
    Reply,
    Acknowledged,
    Open,
}

/// Which preformatted buffer to put on the air.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReplyKind {
    Query,
    Ack,
    ReqRn,
    Read,
}

/// How reception resumes after a consumed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Flow {
    /// Re-arm for the next delimiter immediately.
    Rearm,
    /// Run the idle bookkeeping (power check, slot rotation) first.
    Resync,
}

/// Outcome of a consumed command.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Step {
    pub reply: Option<ReplyKind>,
    pub flow: Flow,
}

impl Step {
    fn rearm(reply: Option<ReplyKind>) -> Self {
        Step {
            reply,
            flow: Flow::Rearm,
        }
    }

    fn resync(reply: Option<ReplyKind>) -> Self {
        Step {
            reply,
            flow: Flow::Resync,
        }
    }
}

/// Where sensor samples surface, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorPlacement {
    Off,
    /// Samples ride in the EPC field of the ACK reply.
    InId,
    /// Samples are served as the Read payload.
    InReadCommand,
}

/// What a Query arriving in Reply does.
///
/// Re-slotting can strand the tag in Arbitrate, which on harvested power
/// is the safer outcome; holding Reply re-presents the current RN16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueryInReplyPolicy {
    ReSlot,
    HoldReply,
}

/// Factory identity of the tag.
#[derive(Debug, Clone, Copy)]
pub struct TagIdent {
    pub epc: [u8; EPC_BYTES],
    pub pc: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct TagConfig {
    /// Slotted inventory: draw slot counters from the RN16 pool.
    /// Disabled, the tag always answers in slot zero.
    pub slots: bool,
    /// Session flags and Select handling.
    pub sessions: bool,
    /// Serve the Read command.
    pub reads: bool,
    pub sensor: SensorPlacement,
    /// EPC byte 0 marker written when samples ride in the ID.
    pub sensor_type_id: u8,
    pub query_in_reply: QueryInReplyPolicy,
    /// Drop to Ready whenever the receive deadline expires. Sensor
    /// applications run with this off so a round survives the gaps
    /// between reader transmissions.
    pub reset_on_timeout: bool,
}

impl Default for TagConfig {
    fn default() -> Self {
        TagConfig {
            slots: false,
            sessions: false,
            reads: true,
            sensor: SensorPlacement::Off,
            sensor_type_id: 0,
            query_in_reply: QueryInReplyPolicy::ReSlot,
            reset_on_timeout: true,
        }
    }
}

pub struct TagMachine {
    config: TagConfig,
    state: TagState,
    in_round: bool,
    q: u8,
    slot: u16,
    shift: u8,
    previous_session: u8,
    /// The 16-bit credential the next ACK / Req_RN / Read must echo:
    /// the slot token while singulating, the handle once in Open.
    expected_rn16: u16,
    handle: u16,
    link: LinkParams,
    pool: Rn16Pool,
    rng: Lfsr16,
    sessions: Sessions,
    query_reply: QueryReply,
    ack_reply: AckReply,
    req_rn_reply: ReqRnReply,
    read_reply: ReadReply,
}

impl TagMachine {
    pub fn new(ident: TagIdent, config: TagConfig) -> Self {
        let epc_word = u16::from_be_bytes([ident.epc[0], ident.epc[1]]);
        let pool = Rn16Pool::build(epc_word);
        let mut rng = Lfsr16::new(epc_word);
        let boot_rn = rng.next_rn16();

        let mut ack_reply = AckReply::new(ident.pc, &ident.epc);
        if config.sensor != SensorPlacement::InId {
            ack_reply.seal();
        }

        TagMachine {
            config,
            state: TagState::Ready,
            in_round: false,
            q: 0,
            slot: 0,
            shift: 0,
            previous_session: 0,
            expected_rn16: boot_rn,
            handle: boot_rn,
            link: LinkParams::default(),
            pool,
            rng,
            sessions: Sessions::new(),
            query_reply: QueryReply::new(boot_rn, !config.slots),
            ack_reply,
            req_rn_reply: ReqRnReply::new(),
            read_reply: ReadReply::new(),
        }
    }

    pub fn state(&self) -> TagState {
        self.state
    }

    pub fn config(&self) -> &TagConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    /// Return-link parameters latched from the last Query.
    pub fn link(&self) -> &LinkParams {
        &self.link
    }

    pub fn reply_frame(&self, kind: ReplyKind) -> TxFrame<'_> {
        match kind {
            ReplyKind::Query => self.query_reply.frame(),
            ReplyKind::Ack => self.ack_reply.frame(),
            ReplyKind::ReqRn => self.req_rn_reply.frame(),
            ReplyKind::Read => self.read_reply.frame(),
        }
    }

    /// Offer the (possibly still partial) command to the dispatcher.
    pub fn on_frame(&mut self, frame: &Frame<'_>) -> Option<Step> {
        match cmd::recognize(frame) {
            Some(command) => self.dispatch(command, frame),
            None => self.unrecognized(frame),
        }
    }

    /// Receive deadline expired with no complete command.
    pub fn on_timeout(&mut self) {
        if self.config.reset_on_timeout {
            self.state = TagState::Ready;
            self.in_round = false;
        }
        self.sessions.handle_timeout();
        if self.config.slots {
            self.shift = (self.shift + 1) & 3;
        }
    }

    /// Wake from a power dip: back to Ready, flags per persistence.
    pub fn on_power_restored(&mut self) {
        self.state = TagState::Ready;
        self.sessions.power_cycled(self.in_round);
        self.in_round = false;
    }

    /// Command buffer overflow: drop everything, start over.
    pub fn on_buffer_overflow(&mut self) {
        self.state = TagState::Ready;
    }

    /// Route a fresh sensor sample to wherever the build serves it.
    pub fn stage_sensor_sample(&mut self, data: &[u8]) {
        match self.config.sensor {
            SensorPlacement::InId => {
                self.ack_reply.set_sensor_id(self.config.sensor_type_id, data)
            }
            SensorPlacement::InReadCommand => self.read_reply.stage(data),
            SensorPlacement::Off => {}
        }
    }

    fn dispatch(&mut self, command: Command, frame: &Frame<'_>) -> Option<Step> {
        use Command::*;
        use TagState::*;
        match (self.state, command) {
            // Ready answers Query and applies Select; the rest is noise
            (Ready, Query) => Some(Step::rearm(self.handle_query(frame))),
            (Ready, Select) => {
                self.handle_select(frame);
                Some(Step::resync(None))
            }
            (Ready, _) => None,

            (Arbitrate, Query) => Some(Step::rearm(self.handle_query(frame))),
            (Arbitrate, QueryRep) => {
                if parse_query_rep(frame.cmd) != self.previous_session {
                    return None;
                }
                self.slot = self.slot.saturating_sub(1);
                let reply = (self.slot == 0).then(|| self.load_slot_token());
                if self.slot == 0 {
                    self.state = Reply;
                }
                Some(Step::resync(reply))
            }
            (Arbitrate, QueryAdjust) => {
                let f = parse_query_adjust(frame.cmd);
                if f.session != self.previous_session {
                    return None;
                }
                Some(Step::rearm(self.requeue_slot(f.increment)))
            }
            (Arbitrate, Select) => {
                self.handle_select(frame);
                Some(Step::resync(None))
            }
            (Arbitrate, _) => None,

            (Reply, Ack) => {
                let reply = self.handle_ack(frame, Acknowledged)?;
                Some(Step::rearm(Some(reply)))
            }
            (Reply, Query) => match self.config.query_in_reply {
                QueryInReplyPolicy::ReSlot => Some(Step::rearm(self.handle_query(frame))),
                QueryInReplyPolicy::HoldReply => Some(Step::rearm(Some(ReplyKind::Query))),
            },
            (Reply, QueryRep) => {
                self.state = Arbitrate;
                Some(Step::rearm(None))
            }
            (Reply, QueryAdjust) => {
                let f = parse_query_adjust(frame.cmd);
                if f.session != self.previous_session {
                    return None;
                }
                Some(Step::resync(self.requeue_slot(f.increment)))
            }
            (Reply, Select) => {
                self.handle_select(frame);
                Some(Step::resync(None))
            }
            (Reply, _) => None,

            (Acknowledged, ReqRn) => {
                let reply = self.handle_req_rn(frame)?;
                Some(Step::rearm(Some(reply)))
            }
            (Acknowledged, Query) => Some(Step::resync(self.handle_query(frame))),
            (Acknowledged, Ack) => {
                let reply = self.handle_ack(frame, Acknowledged)?;
                Some(Step::rearm(Some(reply)))
            }
            (Acknowledged, QueryRep) | (Acknowledged, QueryAdjust) => {
                self.state = Ready;
                Some(Step::resync(None))
            }
            (Acknowledged, Select) => {
                self.handle_select(frame);
                Some(Step::resync(None))
            }
            (Acknowledged, Nak) | (Acknowledged, Access) => {
                self.state = Arbitrate;
                Some(Step::resync(None))
            }
            (Acknowledged, Read) => {
                let reply = self.handle_read(frame, Arbitrate)?;
                Some(Step::resync(Some(reply)))
            }

            (Open, Read) => {
                let reply = self.handle_read(frame, Open)?;
                Some(Step::rearm(Some(reply)))
            }
            (Open, ReqRn) => {
                let reply = self.handle_req_rn(frame)?;
                Some(Step::rearm(Some(reply)))
            }
            (Open, Query) => Some(Step::resync(self.handle_query(frame))),
            (Open, QueryRep) => {
                self.state = Ready;
                Some(Step::rearm(None))
            }
            (Open, QueryAdjust) => {
                self.state = Ready;
                Some(Step::resync(None))
            }
            (Open, Ack) => {
                let reply = self.handle_ack(frame, Open)?;
                Some(Step::resync(Some(reply)))
            }
            (Open, Select) => {
                self.handle_select(frame);
                Some(Step::resync(None))
            }
            (Open, Nak) => {
                self.state = Arbitrate;
                Some(Step::resync(None))
            }
            (Open, Access) => None,
        }
    }

    /// No recognition gate fired. Long unrecognized traffic resets the
    /// receive path; a Select prefix is exempt because its mask keeps
    /// streaming past the gate.
    fn unrecognized(&mut self, frame: &Frame<'_>) -> Option<Step> {
        use TagState::*;
        let prefix = frame.cmd[0] & 0xF0;
        let reset = match self.state {
            Ready | Arbitrate => frame.bits >= MAX_QUERY_BITS && prefix != 0xA0,
            Reply => frame.bits >= MAX_QUERY_BITS && prefix != 0xA0 && prefix != 0x80,
            Acknowledged => frame.bits >= MAX_READ_BITS,
            Open => false,
        };
        if reset {
            self.state = if self.state == Acknowledged {
                Arbitrate
            } else {
                Ready
            };
            return Some(Step::resync(None));
        }
        None
    }

    fn handle_query(&mut self, frame: &Frame<'_>) -> Option<ReplyKind> {
        let f = parse_query(frame.cmd);
        if self.config.sessions && !self.participates(&f) {
            // sit the round out
            self.state = TagState::Ready;
            return None;
        }
        self.previous_session = f.session;
        self.in_round = true;
        self.link = LinkParams {
            encoding: f.encoding,
            timing: LinkTiming::from_query(frame.trcal, f.dr),
            trext: f.trext,
        };
        if self.config.slots {
            self.q = f.q;
            self.slot = self.pool.slot(self.q, self.shift);
        } else {
            self.q = 0;
            self.slot = 0;
        }
        if self.slot == 0 {
            let reply = self.load_slot_token();
            self.state = TagState::Reply;
            Some(reply)
        } else {
            self.state = TagState::Arbitrate;
            None
        }
    }

    /// Re-draw the slot counter after a QueryAdjust.
    fn requeue_slot(&mut self, increment: bool) -> Option<ReplyKind> {
        if increment && self.q < 15 {
            self.q += 1;
        }
        self.slot = if self.config.slots {
            self.pool.slot(self.q, self.shift)
        } else {
            0
        };
        if self.slot == 0 {
            let reply = self.load_slot_token();
            self.state = TagState::Reply;
            Some(reply)
        } else {
            self.state = TagState::Arbitrate;
            None
        }
    }

    /// Present the RN16 for the current slot and remember it as the
    /// credential the reader must echo back.
    fn load_slot_token(&mut self) -> ReplyKind {
        if self.config.slots {
            self.query_reply.set_rn16(self.pool.rn16(self.q, self.shift));
        }
        self.expected_rn16 = self.query_reply.rn16();
        ReplyKind::Query
    }

    fn participates(&self, f: &QueryFields) -> bool {
        let sel_ok = match f.sel {
            SelFilter::All => true,
            SelFilter::NotSelected => !self.sessions.sl(),
            SelFilter::Selected => self.sessions.sl(),
        };
        sel_ok && self.sessions.flag(f.session) == f.target
    }

    fn handle_ack(&mut self, frame: &Frame<'_>, next: TagState) -> Option<ReplyKind> {
        if parse_ack(frame.cmd) != self.expected_rn16 {
            return None;
        }
        self.state = next;
        Some(ReplyKind::Ack)
    }

    fn handle_req_rn(&mut self, frame: &Frame<'_>) -> Option<ReplyKind> {
        if parse_req_rn(frame.cmd) != self.expected_rn16 {
            return None;
        }
        self.handle = self.rng.next_rn16();
        self.req_rn_reply.set_handle(self.handle);
        self.expected_rn16 = self.handle;
        self.state = TagState::Open;
        Some(ReplyKind::ReqRn)
    }

    fn handle_read(&mut self, frame: &Frame<'_>, next: TagState) -> Option<ReplyKind> {
        if !self.config.reads {
            return None;
        }
        if parse_read(frame.cmd).rn != self.expected_rn16 {
            return None;
        }
        self.read_reply.finalize(self.expected_rn16);
        self.state = next;
        Some(ReplyKind::Read)
    }

    fn handle_select(&mut self, frame: &Frame<'_>) {
        if self.config.sessions {
            let f = parse_select(frame.cmd, frame.bits);
            // only the EPC bank is mapped; everything else never matches
            let matched = if f.mem_bank == 1 {
                mask_matches(
                    &f,
                    frame.cmd,
                    frame.bits,
                    self.ack_reply.pc_epc(),
                    EPC_BANK_PC_START,
                )
            } else {
                Some(false)
            };
            if let Some(matched) = matched {
                self.sessions.apply_select(f.target, f.action, matched);
            }
        }
        self.state = TagState::Ready;
    }

    #[cfg(test)]
    fn force_state(&mut self, state: TagState) {
        self.state = state;
    }

    #[cfg(test)]
    fn expected_rn16(&self) -> u16 {
        self.expected_rn16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demod::CMD_BUF_BYTES;

    const EPC: [u8; 12] = [
        0x24, 0x03, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA,
    ];

    fn machine(config: TagConfig) -> TagMachine {
        TagMachine::new(TagIdent { epc: EPC, pc: 0x3000 }, config)
    }

    fn frame<'a>(cmd: &'a [u8], bits: u16, trcal: u16) -> Frame<'a> {
        Frame { cmd, bits, trcal }
    }

    fn query_frame(buf: &mut [u8; CMD_BUF_BYTES], q: u8) -> Frame<'_> {
        buf[0] = 0x80;
        buf[1] = (q >> 1) & 0x07;
        buf[2] = (q & 1) << 5;
        Frame { cmd: buf, bits: 22, trcal: 70 }
    }

    fn ack_frame(buf: &mut [u8; CMD_BUF_BYTES], rn: u16) -> Frame<'_> {
        buf[0] = 0x40 | (rn >> 10) as u8;
        buf[1] = (rn >> 2) as u8;
        buf[2] = (rn & 3) as u8;
        Frame { cmd: buf, bits: 18, trcal: 0 }
    }

    fn req_rn_frame(buf: &mut [u8; CMD_BUF_BYTES], rn: u16) -> Frame<'_> {
        buf[0] = 0xC1;
        buf[1] = (rn >> 8) as u8;
        buf[2] = rn as u8;
        Frame { cmd: buf, bits: 40, trcal: 0 }
    }

    fn read_frame(buf: &mut [u8; CMD_BUF_BYTES], rn: u16) -> Frame<'_> {
        // opcode, membank 0b01, wordptr 0, wordcount 1, rn, CRC stub
        buf[0] = 0xC2;
        buf[1] = 0x40;
        buf[2] = 0x00;
        buf[3] = 0x40 | ((rn >> 10) & 0x3F) as u8;
        buf[4] = (rn >> 2) as u8;
        buf[5] = ((rn & 3) << 6) as u8;
        Frame { cmd: buf, bits: 57, trcal: 0 }
    }

    #[test]
    fn query_in_ready_answers_in_slot_zero() {
        let mut m = machine(TagConfig::default());
        let mut buf = [0u8; CMD_BUF_BYTES];
        let step = m.on_frame(&query_frame(&mut buf, 0)).expect("consumed");
        assert_eq!(step.reply, Some(ReplyKind::Query));
        assert_eq!(m.state(), TagState::Reply);
        let f = m.reply_frame(ReplyKind::Query);
        assert_eq!(f.bits, 32, "RN16 + CRC16 when slotting is off");
    }

    #[test]
    fn slotted_query_counts_down_through_queryrep() {
        let mut m = machine(TagConfig {
            slots: true,
            ..TagConfig::default()
        });
        let mut buf = [0u8; CMD_BUF_BYTES];
        // EPC word 0x2403 puts Q=4 shift=0 at slot 2
        let step = m.on_frame(&query_frame(&mut buf, 4)).expect("consumed");
        assert!(step.reply.is_none());
        assert_eq!(m.state(), TagState::Arbitrate);

        let rep = [0u8; 3];
        let step = m.on_frame(&frame(&rep, 4, 0)).expect("consumed");
        assert!(step.reply.is_none(), "slot 1: still waiting");
        assert_eq!(m.state(), TagState::Arbitrate);

        let step = m.on_frame(&frame(&rep, 4, 0)).expect("consumed");
        assert_eq!(step.reply, Some(ReplyKind::Query));
        assert_eq!(m.state(), TagState::Reply);
        assert_eq!(m.reply_frame(ReplyKind::Query).bits, 16, "bare RN16 when slotted");
        assert_eq!(m.expected_rn16(), 0x0912);
    }

    #[test]
    fn queryrep_session_mismatch_is_ignored() {
        let mut m = machine(TagConfig {
            slots: true,
            ..TagConfig::default()
        });
        let mut buf = [0u8; CMD_BUF_BYTES];
        m.on_frame(&query_frame(&mut buf, 4)).unwrap();
        let rep = [0x01u8, 0, 0]; // session 1, round runs in session 0
        assert!(m.on_frame(&frame(&rep, 4, 0)).is_none());
        assert_eq!(m.state(), TagState::Arbitrate);
    }

    #[test]
    fn ack_with_matching_rn16_singulates() {
        let mut m = machine(TagConfig::default());
        let mut buf = [0u8; CMD_BUF_BYTES];
        m.on_frame(&query_frame(&mut buf, 0)).unwrap();
        let rn = m.expected_rn16();

        let mut abuf = [0u8; CMD_BUF_BYTES];
        let step = m.on_frame(&ack_frame(&mut abuf, rn)).expect("consumed");
        assert_eq!(step.reply, Some(ReplyKind::Ack));
        assert_eq!(m.state(), TagState::Acknowledged);
        assert_eq!(m.reply_frame(ReplyKind::Ack).bits, 128);
    }

    #[test]
    fn ack_with_wrong_rn16_is_dropped() {
        let mut m = machine(TagConfig::default());
        let mut buf = [0u8; CMD_BUF_BYTES];
        m.on_frame(&query_frame(&mut buf, 0)).unwrap();
        let rn = m.expected_rn16();

        let mut abuf = [0u8; CMD_BUF_BYTES];
        assert!(m.on_frame(&ack_frame(&mut abuf, rn ^ 1)).is_none());
        assert_eq!(m.state(), TagState::Reply, "silent drop leaves state");
    }

    #[test]
    fn nak_in_acknowledged_arbitrates_without_reply() {
        let mut m = machine(TagConfig::default());
        m.force_state(TagState::Acknowledged);
        let nak = [0xC0u8, 0, 0];
        let step = m.on_frame(&frame(&nak, 8, 0)).expect("consumed");
        assert!(step.reply.is_none());
        assert_eq!(m.state(), TagState::Arbitrate);
    }

    #[test]
    fn req_rn_opens_with_fresh_handle() {
        let mut m = machine(TagConfig::default());
        let mut buf = [0u8; CMD_BUF_BYTES];
        m.on_frame(&query_frame(&mut buf, 0)).unwrap();
        let rn = m.expected_rn16();
        let mut abuf = [0u8; CMD_BUF_BYTES];
        m.on_frame(&ack_frame(&mut abuf, rn)).unwrap();

        let mut rbuf = [0u8; CMD_BUF_BYTES];
        let step = m.on_frame(&req_rn_frame(&mut rbuf, rn)).expect("consumed");
        assert_eq!(step.reply, Some(ReplyKind::ReqRn));
        assert_eq!(m.state(), TagState::Open);
        let handle = u16::from_be_bytes([
            m.reply_frame(ReplyKind::ReqRn).bytes[0],
            m.reply_frame(ReplyKind::ReqRn).bytes[1],
        ]);
        assert_eq!(m.expected_rn16(), handle);
        assert_ne!(handle, rn);
    }

    #[test]
    fn read_from_acknowledged_falls_back_to_arbitrate() {
        let mut m = machine(TagConfig::default());
        let mut buf = [0u8; CMD_BUF_BYTES];
        m.on_frame(&query_frame(&mut buf, 0)).unwrap();
        let rn = m.expected_rn16();
        let mut abuf = [0u8; CMD_BUF_BYTES];
        m.on_frame(&ack_frame(&mut abuf, rn)).unwrap();

        let mut dbuf = [0u8; CMD_BUF_BYTES];
        let step = m.on_frame(&read_frame(&mut dbuf, rn)).expect("consumed");
        assert_eq!(step.reply, Some(ReplyKind::Read));
        assert_eq!(m.state(), TagState::Arbitrate);
        let f = m.reply_frame(ReplyKind::Read);
        assert_eq!(f.bytes[0] & 0x80, 0, "header bit");
        assert_eq!(f.bits % 8, 1, "8n + 1 bits");
    }

    #[test]
    fn read_in_open_stays_open() {
        let mut m = machine(TagConfig::default());
        let mut buf = [0u8; CMD_BUF_BYTES];
        m.on_frame(&query_frame(&mut buf, 0)).unwrap();
        let rn = m.expected_rn16();
        let mut abuf = [0u8; CMD_BUF_BYTES];
        m.on_frame(&ack_frame(&mut abuf, rn)).unwrap();
        let mut qbuf = [0u8; CMD_BUF_BYTES];
        m.on_frame(&req_rn_frame(&mut qbuf, rn)).unwrap();
        let handle = m.expected_rn16();

        let mut dbuf = [0u8; CMD_BUF_BYTES];
        let step = m.on_frame(&read_frame(&mut dbuf, handle)).expect("consumed");
        assert_eq!(step.reply, Some(ReplyKind::Read));
        assert_eq!(m.state(), TagState::Open);
    }

    #[test]
    fn read_disabled_never_answers() {
        let mut m = machine(TagConfig {
            reads: false,
            ..TagConfig::default()
        });
        m.force_state(TagState::Open);
        let rn = m.expected_rn16();
        let mut dbuf = [0u8; CMD_BUF_BYTES];
        assert!(m.on_frame(&read_frame(&mut dbuf, rn)).is_none());
    }

    #[test]
    fn query_in_reply_policy() {
        for (policy, expect) in [
            (QueryInReplyPolicy::ReSlot, TagState::Reply),
            (QueryInReplyPolicy::HoldReply, TagState::Reply),
        ] {
            let mut m = machine(TagConfig {
                query_in_reply: policy,
                ..TagConfig::default()
            });
            let mut buf = [0u8; CMD_BUF_BYTES];
            m.on_frame(&query_frame(&mut buf, 0)).unwrap();
            let mut buf2 = [0u8; CMD_BUF_BYTES];
            let step = m.on_frame(&query_frame(&mut buf2, 0)).expect("consumed");
            assert_eq!(step.reply, Some(ReplyKind::Query));
            assert_eq!(m.state(), expect);
        }
        // with slots on, re-slotting can strand the tag in Arbitrate
        let mut m = machine(TagConfig {
            slots: true,
            ..TagConfig::default()
        });
        let mut buf = [0u8; CMD_BUF_BYTES];
        m.on_frame(&query_frame(&mut buf, 0)).unwrap();
        assert_eq!(m.state(), TagState::Reply);
        let mut buf2 = [0u8; CMD_BUF_BYTES];
        let step = m.on_frame(&query_frame(&mut buf2, 4)).expect("consumed");
        assert!(step.reply.is_none());
        assert_eq!(m.state(), TagState::Arbitrate);
    }

    #[test]
    fn nonparticipating_query_sits_out() {
        let mut m = machine(TagConfig {
            sessions: true,
            ..TagConfig::default()
        });
        let mut buf = [0u8; CMD_BUF_BYTES];
        // target B while the session 0 flag is A
        buf[0] = 0x80;
        buf[1] = 0x08;
        let f = Frame { cmd: &buf, bits: 22, trcal: 70 };
        let step = m.on_frame(&f).expect("consumed");
        assert!(step.reply.is_none(), "no backscatter from a bystander");
        assert_eq!(m.state(), TagState::Ready);
    }

    #[test]
    fn oversize_garbage_resets_reception() {
        let mut m = machine(TagConfig::default());
        let mut buf = [0u8; CMD_BUF_BYTES];
        buf[0] = 0xC4; // no such opcode
        let step = m.on_frame(&frame(&buf, 22, 0)).expect("consumed");
        assert!(step.reply.is_none());
        assert_eq!(step.flow, Flow::Resync);
        assert_eq!(m.state(), TagState::Ready);
    }

    #[test]
    fn select_prefix_streams_past_the_query_cutoff() {
        let mut m = machine(TagConfig::default());
        let mut buf = [0u8; CMD_BUF_BYTES];
        buf[0] = 0xA0;
        assert!(m.on_frame(&frame(&buf, 30, 0)).is_none());
    }

    #[test]
    fn timeout_bookkeeping() {
        let mut m = machine(TagConfig {
            slots: true,
            ..TagConfig::default()
        });
        m.force_state(TagState::Acknowledged);
        m.on_timeout();
        assert_eq!(m.state(), TagState::Ready);
        for expect in [2u8, 3, 0, 1] {
            m.on_timeout();
            assert_eq!(m.shift, expect);
        }

        let mut m = machine(TagConfig {
            reset_on_timeout: false,
            ..TagConfig::default()
        });
        m.force_state(TagState::Acknowledged);
        m.on_timeout();
        assert_eq!(m.state(), TagState::Acknowledged, "sensor builds hold state");
    }

    #[test]
    fn power_restore_applies_flag_persistence() {
        let mut m = machine(TagConfig {
            sessions: true,
            ..TagConfig::default()
        });
        m.force_state(TagState::Open);
        m.on_power_restored();
        assert_eq!(m.state(), TagState::Ready);
    }

    #[test]
    fn transition_table_is_exhaustive() {
        use Command::*;
        use TagState::*;

        // (command, expected state from each of the five states; None =
        // the command is ignored there and the state must not move)
        let table: &[(Command, [Option<TagState>; 5])] = &[
            (Query, [Some(Reply), Some(Reply), Some(Reply), Some(Reply), Some(Reply)]),
            (QueryRep, [None, Some(Reply), Some(Arbitrate), Some(Ready), Some(Ready)]),
            (QueryAdjust, [None, Some(Reply), Some(Reply), Some(Ready), Some(Ready)]),
            (Ack, [None, None, Some(Acknowledged), Some(Acknowledged), Some(Open)]),
            (ReqRn, [None, None, None, Some(Open), Some(Open)]),
            (Read, [None, None, None, Some(Arbitrate), Some(Open)]),
            (Nak, [None, None, None, Some(Arbitrate), Some(Arbitrate)]),
            (Select, [Some(Ready), Some(Ready), Some(Ready), Some(Ready), Some(Ready)]),
            (Access, [None, None, None, Some(Arbitrate), None]),
        ];
        let states = [Ready, Arbitrate, Reply, Acknowledged, Open];

        for &(command, expect) in table {
            for (i, &state) in states.iter().enumerate() {
                let mut m = machine(TagConfig::default());
                m.force_state(state);
                let rn = m.expected_rn16();
                let mut buf = [0u8; CMD_BUF_BYTES];
                let (opcode, bits) = match command {
                    Query => (0, 0),
                    QueryRep => (0x00, 4),
                    QueryAdjust => (0x48, 7),
                    Ack | ReqRn | Read => (0, 0),
                    Nak => (0xC0, 8),
                    Select => (0xA0, 45),
                    Access => (0xC6, 56),
                };
                buf[0] = opcode;
                let f = match command {
                    Query => query_frame(&mut buf, 0),
                    Ack => ack_frame(&mut buf, rn),
                    ReqRn => req_rn_frame(&mut buf, rn),
                    Read => read_frame(&mut buf, rn),
                    _ => frame(&buf, bits, 0),
                };
                let step = m.on_frame(&f);
                match expect[i] {
                    Some(next) => {
                        assert!(step.is_some(), "{command:?} consumed in {state:?}");
                        assert_eq!(m.state(), next, "{command:?} from {state:?}");
                    }
                    None => {
                        assert_eq!(m.state(), state, "{command:?} ignored in {state:?}");
                    }
                }
            }
        }
    }
}
