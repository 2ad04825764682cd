//! # Passive UHF Gen2 tag engine
//!
//! Baseband and protocol core for a batteryless, harvested-power UHF
//! transponder speaking a subset of the EPC Class-1 Generation-2 air
//! interface: inventory (Query, QueryRep, QueryAdjust, ACK, NAK),
//! selection (Select over the EPC bank) and access (Req_RN, Read).
//!
//! The crate splits along the hardware boundary:
//!
//! - [`demod::PieDecoder`] turns captured edge intervals into command
//!   bits, learning RTcal/TRcal per command.
//! - [`protocol::TagMachine`] owns the Ready / Arbitrate / Reply /
//!   Acknowledged / Open machine, slotting, session flags and the
//!   preformatted reply buffers.
//! - [`modulator::Waveform`] expands a reply into the exact sequence of
//!   load-switch toggle intervals (FM0 or Miller subcarrier).
//!
//! All three are pure and synchronous. [`Gen2Tag`] wires them to the
//! hardware through four small traits ([`RfFrontend`], [`Backscatter`],
//! [`PowerMonitor`], [`Sensor`]) and runs the receive/dispatch/reply
//! loop, parking the machine whenever harvested power sags.

#![cfg_attr(not(test), no_std)]

pub mod cmd;
pub mod crc;
pub mod demod;
pub mod lfsr;
pub mod modulator;
pub mod protocol;
pub mod reply;
pub mod session;

use embassy_time::{Duration, Timer};
use embedded_hal::digital::InputPin;
use embedded_hal_async::digital::Wait;

pub use demod::{DecodeFault, Frame, PieDecoder, RX_TIMEOUT_TICKS};
pub use modulator::{DivideRatio, LinkParams, LinkTiming, TxEncoding, TxFrame, Waveform};
pub use protocol::{
    Flow, QueryInReplyPolicy, ReplyKind, SensorPlacement, Step, TagConfig, TagIdent, TagMachine,
    TagState,
};
pub use session::InventoryFlag;

/// A receive timeout ticks over this many times between sensor samples.
const SENSOR_RESAMPLE_TIMEOUTS: u8 = 10;

/// Error driving the tag hardware. Protocol-level trouble (bad framing,
/// wrong credentials) never surfaces here; the tag just goes quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TagError {
    /// Receive path (edge capture or RX gate) failed
    Frontend,
    /// Backscatter path failed
    Backscatter,
}

/// One captured event on the receive path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxEdge {
    /// An RF edge, with the elapsed capture-timer ticks since the
    /// previous edge.
    Edge(u16),
    /// No edge within the deadline.
    Timeout,
}

/// Demodulated RF input: an envelope comparator feeding a capture timer.
///
/// The capture must latch the elapsed count and restart the timer in the
/// edge interrupt itself, so the interval handed back for edge N is the
/// time since edge N-1 with jitter well under one Tari.
pub trait RfFrontend {
    type Error;

    /// Gate the receive comparator (dropped across power-loss sleep).
    fn set_enabled(&mut self, on: bool) -> Result<(), Self::Error>;

    /// Wait for the next edge, or report that `deadline` ticks passed
    /// without one.
    #[allow(async_fn_in_trait)]
    async fn wait_edge(&mut self, deadline: u16) -> Result<RxEdge, Self::Error>;
}

/// The backscatter load switch.
pub trait Backscatter {
    type Error;

    /// Toggle the load switch at each interval boundary, back to back.
    ///
    /// The reader samples this waveform in real time: the implementation
    /// must replay the intervals cycle-exactly (hardware compare unit or
    /// interrupts-off loop) and must not yield until the last interval
    /// has been driven out.
    #[allow(async_fn_in_trait)]
    async fn modulate(&mut self, waveform: impl Iterator<Item = u16>) -> Result<(), Self::Error>;
}

/// Harvested-supply supervisor.
pub trait PowerMonitor {
    fn power_good(&mut self) -> bool;

    /// Park until the supply recovers.
    #[allow(async_fn_in_trait)]
    async fn wait_power_good(&mut self);
}

/// [`PowerMonitor`] over a supervisor comparator output pin.
pub struct SupervisorPin<P> {
    pin: P,
}

impl<P> SupervisorPin<P> {
    pub fn new(pin: P) -> Self {
        SupervisorPin { pin }
    }
}

impl<P: InputPin + Wait> PowerMonitor for SupervisorPin<P> {
    fn power_good(&mut self) -> bool {
        self.pin.is_high().unwrap_or(false)
    }

    async fn wait_power_good(&mut self) {
        let _ = self.pin.wait_for_high().await;
    }
}

/// Application sensor sampled into replies. The warm-up wait runs in the
/// tag's main loop so the radio keeps its timing.
pub trait Sensor {
    /// Switch the sensor supply on.
    fn power_up(&mut self);

    /// Settling time between power-up and a trustworthy sample.
    fn warmup(&self) -> Duration;

    /// Sample into `buf`, returning the number of bytes written.
    #[allow(async_fn_in_trait)]
    async fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// Sensor stub for identification-only builds.
pub struct NoSensor;

impl Sensor for NoSensor {
    fn power_up(&mut self) {}

    fn warmup(&self) -> Duration {
        Duration::from_ticks(0)
    }

    async fn read(&mut self, _buf: &mut [u8]) -> usize {
        0
    }
}

/// The assembled tag: protocol engine plus its hardware.
pub struct Gen2Tag<FE, BS, PW, SN> {
    frontend: FE,
    backscatter: BS,
    power: PW,
    sensor: SN,
    decoder: PieDecoder,
    machine: TagMachine,
    sample_countdown: u8,
}

impl<FE, BS, PW, SN> Gen2Tag<FE, BS, PW, SN>
where
    FE: RfFrontend,
    BS: Backscatter,
    PW: PowerMonitor,
    SN: Sensor,
{
    pub fn new(
        frontend: FE,
        backscatter: BS,
        power: PW,
        sensor: SN,
        ident: TagIdent,
        config: TagConfig,
    ) -> Self {
        Gen2Tag {
            frontend,
            backscatter,
            power,
            sensor,
            decoder: PieDecoder::new(),
            machine: TagMachine::new(ident, config),
            sample_countdown: 0,
        }
    }

    /// The protocol engine, for host-side inspection.
    pub fn machine(&self) -> &TagMachine {
        &self.machine
    }

    /// Run the tag. Returns only on a hardware fault.
    pub async fn run(&mut self) -> Result<(), TagError> {
        if !self.power.power_good() {
            self.sleep().await?;
        }
        if self.machine.config().sensor != SensorPlacement::Off {
            self.sample_sensor().await;
        }
        self.frontend
            .set_enabled(true)
            .map_err(|_| TagError::Frontend)?;
        self.decoder.reset();

        loop {
            let event = self
                .frontend
                .wait_edge(RX_TIMEOUT_TICKS)
                .await
                .map_err(|_| TagError::Frontend)?;
            match event {
                RxEdge::Edge(ticks) => match self.decoder.feed(ticks) {
                    Ok(()) => {
                        let step = self.machine.on_frame(&self.decoder.frame());
                        if let Some(step) = step {
                            if let Some(kind) = step.reply {
                                self.transmit(kind).await?;
                            }
                            match step.flow {
                                Flow::Rearm => self.decoder.reset(),
                                Flow::Resync => self.idle_tick().await?,
                            }
                        }
                    }
                    Err(DecodeFault::DelimiterNotFound) => self.idle_tick().await?,
                    Err(DecodeFault::Overflow) => {
                        self.machine.on_buffer_overflow();
                        self.decoder.reset();
                    }
                },
                RxEdge::Timeout => self.idle_tick().await?,
            }
        }
    }

    /// A reply never starts into a sagging supply; a truncated frame
    /// would fail its CRC at the reader anyway.
    async fn transmit(&mut self, kind: ReplyKind) -> Result<(), TagError> {
        if !self.power.power_good() {
            return Ok(());
        }
        let frame = self.machine.reply_frame(kind);
        let waveform = Waveform::new(&frame, self.machine.link());
        self.backscatter
            .modulate(waveform)
            .await
            .map_err(|_| TagError::Backscatter)
    }

    /// The idle bookkeeping shared by deadline expiry and command
    /// re-synchronization: power check, sensor cadence, slot rotation.
    async fn idle_tick(&mut self) -> Result<(), TagError> {
        if !self.power.power_good() {
            self.sleep().await?;
            self.machine.on_power_restored();
        }
        if self.machine.config().sensor != SensorPlacement::Off {
            self.sample_countdown += 1;
            if self.sample_countdown >= SENSOR_RESAMPLE_TIMEOUTS {
                self.sample_countdown = 0;
                self.sample_sensor().await;
            }
        }
        self.machine.on_timeout();
        self.decoder.reset();
        Ok(())
    }

    async fn sleep(&mut self) -> Result<(), TagError> {
        self.frontend
            .set_enabled(false)
            .map_err(|_| TagError::Frontend)?;
        self.power.wait_power_good().await;
        self.frontend
            .set_enabled(true)
            .map_err(|_| TagError::Frontend)
    }

    async fn sample_sensor(&mut self) {
        let mut buf = [0u8; reply::READ_DATA_MAX];
        self.sensor.power_up();
        Timer::after(self.sensor.warmup()).await;
        let n = self.sensor.read(&mut buf).await.min(buf.len());
        self.machine.stage_sensor_sample(&buf[..n]);
    }
}
