//! Device services the updater relies on besides flash
//!
//! Time, cooperative yielding and GPIO are reached through [System] so the
//! session logic can run against a [VirtualSystem] in tests, where delays
//! advance a virtual clock instead of sleeping.

use std::time::{Duration, Instant};

use strum::Display;

/// Boot mode latched from the strapping pins at reset
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum BootMode {
    /// UART download mode; a software restart does not leave it
    UartDownload,
    /// Normal boot from flash
    Flash,
    /// Boot from SDIO
    Sdio,
    /// Any other strapping
    Other(u8),
}

impl BootMode {
    /// Decode the strapping value (`GPI >> 16 & 0xf` on the ESP8266)
    pub const fn from_strapping(value: u8) -> BootMode {
        match value & 0xf {
            1 => BootMode::UartDownload,
            3 => BootMode::Flash,
            4..=7 => BootMode::Sdio,
            other => BootMode::Other(other),
        }
    }

    /// Whether a restart from this mode brings the device back into the
    /// application
    pub const fn can_restart_into_app(self) -> bool {
        !matches!(self, BootMode::UartDownload)
    }
}

/// An LED toggled while data is being received
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Led {
    pub pin: u8,
    /// Level at which the LED lights up
    pub active_high: bool,
}

impl Led {
    pub const fn new(pin: u8, active_high: bool) -> Self {
        Led { pin, active_high }
    }
}

/// Services provided by the device
pub trait System {
    /// Boot mode the device was started in
    fn boot_mode(&self) -> BootMode;

    /// Bytes of heap currently available
    fn free_heap(&self) -> usize;

    /// Milliseconds since an arbitrary, fixed point in time
    fn millis(&self) -> u64;

    /// Block for `ms` milliseconds
    fn delay(&mut self, ms: u64);

    /// Give other cooperative tasks a chance to run
    fn yield_now(&mut self) {}

    /// Drive a GPIO pin
    fn set_pin(&mut self, _pin: u8, _high: bool) {}
}

/// [System] for a hosted environment, backed by the real clock
#[derive(Debug)]
pub struct HostSystem {
    started: Instant,
    boot_mode: BootMode,
}

impl HostSystem {
    pub fn new() -> Self {
        HostSystem {
            started: Instant::now(),
            boot_mode: BootMode::Flash,
        }
    }
}

impl Default for HostSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl System for HostSystem {
    fn boot_mode(&self) -> BootMode {
        self.boot_mode
    }

    fn free_heap(&self) -> usize {
        usize::MAX
    }

    fn millis(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn delay(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// [System] with a virtual clock that only advances on [System::delay]
#[derive(Debug, Clone)]
pub struct VirtualSystem {
    now: u64,
    boot_mode: BootMode,
    free_heap: usize,
    delays: Vec<u64>,
    yields: usize,
    pins: Vec<(u8, bool)>,
}

impl VirtualSystem {
    pub fn new() -> Self {
        VirtualSystem {
            now: 0,
            boot_mode: BootMode::Flash,
            free_heap: 64 * 1024,
            delays: Vec::new(),
            yields: 0,
            pins: Vec::new(),
        }
    }

    pub fn with_boot_mode(mut self, boot_mode: BootMode) -> Self {
        self.boot_mode = boot_mode;
        self
    }

    pub fn with_free_heap(mut self, free_heap: usize) -> Self {
        self.free_heap = free_heap;
        self
    }

    /// Move the clock forward without recording a delay
    pub fn advance(&mut self, ms: u64) {
        self.now = self.now.saturating_add(ms);
    }

    /// Every delay requested so far
    pub fn delays(&self) -> &[u64] {
        &self.delays
    }

    pub fn yields(&self) -> usize {
        self.yields
    }

    /// Every pin level written so far, in order
    pub fn pin_writes(&self) -> &[(u8, bool)] {
        &self.pins
    }
}

impl Default for VirtualSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl System for VirtualSystem {
    fn boot_mode(&self) -> BootMode {
        self.boot_mode
    }

    fn free_heap(&self) -> usize {
        self.free_heap
    }

    fn millis(&self) -> u64 {
        self.now
    }

    fn delay(&mut self, ms: u64) {
        self.delays.push(ms);
        self.advance(ms);
    }

    fn yield_now(&mut self) {
        self.yields += 1;
    }

    fn set_pin(&mut self, pin: u8, high: bool) {
        self.pins.push((pin, high));
    }
}
