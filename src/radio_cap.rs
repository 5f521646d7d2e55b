//! Radio-chip capability surface.
//!
//! This is deliberately narrow: scheduling tx/rx at an absolute radio
//! tick, reading 40-bit hardware timestamps, and reporting status bits.
//! Everything above this trait (framing, slotting, contention) is
//! unaware of the concrete transceiver.

use bitflags::bitflags;

/// One radio tick is ≈ 15.65 ps; there are 65536 ticks per microsecond.
pub const TICKS_PER_US: u64 = 65536;

/// Approximate tick period in picoseconds, used only for documentation /
/// diagnostics — all real arithmetic stays in tick units.
pub const DW_TICK_PS: f32 = 15.65;

/// Speed of light, m/s.
pub const SPEED_OF_LIGHT: f32 = 299_792_458.0;

/// Seconds represented by one radio tick; used by the location engine to
/// turn tick deltas into metres.
pub const TIME_RES_SECONDS: f32 = 15.65e-12;

const TICK_BITS: u32 = 40;
const TICK_MASK: u64 = (1u64 << TICK_BITS) - 1;

/// A 40-bit modular hardware timestamp.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RadioTick(u64);

impl RadioTick {
    pub fn new(raw: u64) -> Self {
        RadioTick(raw & TICK_MASK)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Adds a (non-modular) tick delta, wrapping within the 40-bit space.
    pub fn wrapping_add(self, delta: u64) -> Self {
        RadioTick((self.0.wrapping_add(delta)) & TICK_MASK)
    }

    /// Shortest signed difference `self - other` in the 40-bit modular
    /// space, interpreted as ticks (positive: `self` is later).
    pub fn diff(self, other: Self) -> i64 {
        let half = 1i64 << (TICK_BITS - 1);
        let raw = (self.0 as i64) - (other.0 as i64);
        let full = 1i64 << TICK_BITS;
        let wrapped = ((raw % full) + full) % full;
        if wrapped >= half {
            wrapped - full
        } else {
            wrapped
        }
    }

    pub fn to_us(self) -> u64 {
        self.0 / TICKS_PER_US
    }
}

bitflags! {
    /// Status bits surfaced after `wait_event`.
    #[derive(Default)]
    pub struct RadioStatus: u16 {
        const TX_COMPLETE            = 1 << 0;
        const RX_COMPLETE_GOOD       = 1 << 1;
        const RX_FRAME_WAIT_TIMEOUT  = 1 << 2;
        const PREAMBLE_TIMEOUT       = 1 << 3;
        const PHY_HEADER_ERROR       = 1 << 4;
        const FCS_ERROR              = 1 << 5;
        const RS_FRAME_SYNC_LOSS     = 1 << 6;
        const SFD_TIMEOUT            = 1 << 7;
        const FILTER_REJECT          = 1 << 8;
        const LDE_ERROR              = 1 << 9;
    }
}

impl RadioStatus {
    /// Only `RX_COMPLETE_GOOD` warrants reading the payload; every other
    /// timeout/error bit means the slot should be treated as silent.
    pub fn is_rx_ok(&self) -> bool {
        self.contains(RadioStatus::RX_COMPLETE_GOOD)
    }

    pub fn is_tx_ok(&self) -> bool {
        self.contains(RadioStatus::TX_COMPLETE)
    }

    pub fn is_silent(&self) -> bool {
        !self.is_rx_ok() && !self.is_tx_ok()
    }
}

/// Narrow contract a UWB radio must provide. All scheduling is in
/// absolute radio ticks; antenna delay is applied internally by the
/// implementation (added on transmit, subtracted on receive).
pub trait RadioCap {
    type Error;

    /// Schedules a transmission to start at `at`; returns the tx offset
    /// actually latched (antenna-delay compensated).
    fn schedule_tx(&mut self, at: RadioTick) -> Result<RadioTick, Self::Error>;

    fn schedule_rx(&mut self, at: RadioTick) -> Result<(), Self::Error>;

    fn set_rx_timeout(&mut self, us: u32) -> Result<(), Self::Error>;

    fn wait_event(&mut self, timeout_us: u32) -> Result<RadioStatus, Self::Error>;

    fn read_rx_timestamp(&mut self) -> Result<RadioTick, Self::Error>;

    fn read_sys_timestamp(&mut self) -> Result<RadioTick, Self::Error>;

    fn read_rx_finfo(&mut self) -> Result<usize, Self::Error>;

    fn read_rx(&mut self, into: &mut [u8], offset: usize, n: usize) -> Result<(), Self::Error>;

    fn write_tx(&mut self, from: &[u8], offset: usize, n: usize) -> Result<(), Self::Error>;

    fn write_tx_fctrl(&mut self, offset: usize, length: usize) -> Result<(), Self::Error>;

    fn sleep(&mut self) -> Result<(), Self::Error>;

    fn wake(&mut self) -> Result<(), Self::Error>;

    /// Small fractional crystal-offset reading, used to scale
    /// partner-reported durations.
    fn rx_clock_offset(&mut self) -> Result<f32, Self::Error>;
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use super::*;
    use heapless::Vec;

    /// A single scripted radio event, replayed in order by `MockRadioCap`.
    #[derive(Clone, Debug)]
    pub enum Transaction {
        ScheduleTx,
        ScheduleRx,
        WaitEvent(RadioStatus),
        RxTimestamp(RadioTick),
        SysTimestamp(RadioTick),
        RxFinfo(usize),
        RxData(Vec<u8, 128>),
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct MockError;

    /// Deterministic, scripted `RadioCap` test double.
    pub struct MockRadioCap {
        script: Vec<Transaction, 32>,
        cursor: usize,
        pub tx_buf: Vec<u8, 128>,
        pub rx_clock_offset: f32,
    }

    impl MockRadioCap {
        pub fn new() -> Self {
            MockRadioCap {
                script: Vec::new(),
                cursor: 0,
                tx_buf: Vec::new(),
                rx_clock_offset: 0.0,
            }
        }

        pub fn expect(&mut self, t: Transaction) {
            self.script.push(t).ok();
        }

        pub fn done(&self) -> bool {
            self.cursor == self.script.len()
        }

        fn next(&mut self) -> Transaction {
            let t = self.script[self.cursor].clone();
            self.cursor += 1;
            t
        }
    }

    impl RadioCap for MockRadioCap {
        type Error = MockError;

        fn schedule_tx(&mut self, _at: RadioTick) -> Result<RadioTick, Self::Error> {
            match self.next() {
                Transaction::ScheduleTx => Ok(RadioTick::new(0)),
                _ => Err(MockError),
            }
        }

        fn schedule_rx(&mut self, _at: RadioTick) -> Result<(), Self::Error> {
            match self.next() {
                Transaction::ScheduleRx => Ok(()),
                _ => Err(MockError),
            }
        }

        fn set_rx_timeout(&mut self, _us: u32) -> Result<(), Self::Error> {
            Ok(())
        }

        fn wait_event(&mut self, _timeout_us: u32) -> Result<RadioStatus, Self::Error> {
            match self.next() {
                Transaction::WaitEvent(s) => Ok(s),
                _ => Err(MockError),
            }
        }

        fn read_rx_timestamp(&mut self) -> Result<RadioTick, Self::Error> {
            match self.next() {
                Transaction::RxTimestamp(t) => Ok(t),
                _ => Err(MockError),
            }
        }

        fn read_sys_timestamp(&mut self) -> Result<RadioTick, Self::Error> {
            match self.next() {
                Transaction::SysTimestamp(t) => Ok(t),
                _ => Err(MockError),
            }
        }

        fn read_rx_finfo(&mut self) -> Result<usize, Self::Error> {
            match self.next() {
                Transaction::RxFinfo(n) => Ok(n),
                _ => Err(MockError),
            }
        }

        fn read_rx(&mut self, into: &mut [u8], offset: usize, n: usize) -> Result<(), Self::Error> {
            match self.next() {
                Transaction::RxData(data) => {
                    into[..n].copy_from_slice(&data[offset..offset + n]);
                    Ok(())
                }
                _ => Err(MockError),
            }
        }

        fn write_tx(&mut self, from: &[u8], _offset: usize, n: usize) -> Result<(), Self::Error> {
            self.tx_buf.clear();
            self.tx_buf.extend_from_slice(&from[..n]).ok();
            Ok(())
        }

        fn write_tx_fctrl(&mut self, _offset: usize, _length: usize) -> Result<(), Self::Error> {
            Ok(())
        }

        fn sleep(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        fn wake(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }

        fn rx_clock_offset(&mut self) -> Result<f32, Self::Error> {
            Ok(self.rx_clock_offset)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tick_wraps_modularly() {
        let max = RadioTick::new(TICK_MASK);
        let wrapped = max.wrapping_add(1);
        assert_eq!(wrapped.raw(), 0);
    }

    #[test]
    fn tick_diff_handles_wraparound() {
        let a = RadioTick::new(TICK_MASK - 2);
        let b = RadioTick::new(2);
        // b is 4 ticks after a, modularly.
        assert_eq!(b.diff(a), 4);
        assert_eq!(a.diff(b), -4);
    }

    #[test]
    fn status_classifies_silence() {
        let ok = RadioStatus::RX_COMPLETE_GOOD;
        assert!(ok.is_rx_ok());
        let timeout = RadioStatus::RX_FRAME_WAIT_TIMEOUT;
        assert!(timeout.is_silent());
    }
}
