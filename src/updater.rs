//! The update session
//!
//! An [Updater] owns the flash, the device services and the command store for
//! its whole lifetime and runs at most one session at a time:
//!
//! ```text
//! begin ─▶ write / write_stream / write_available ─▶ end
//!   │                       │                          │
//!   └──────── any failure records the error and tears the session down
//! ```
//!
//! Bytes are collected in a [SectorBuffer] and flushed into the staging
//! window one buffer at a time, erasing each sector right before the first
//! write into it. Nothing outside the staging window is touched until [end]
//! leaves a [StagingCommand] for the bootloader.
//!
//! [end]: Updater::end

use std::time::Duration;

use log::{debug, error, info};

use crate::{
    buffer::SectorBuffer,
    command::{CommandStore, StagingCommand},
    config::UpdaterConfig,
    error::{Error, ErrorCode},
    flash::Flash,
    image::{self, ImageHeader, FLASH_MODE_OFFSET},
    layout::{Planner, StagingWindow, UpdateTarget},
    progress::UpdateObserver,
    stream::{AvailableSource, ByteSource, StallAction, StallTimer},
    system::{Led, System},
    verify::{self, Md5Checksum, SignatureVerifier, UpdateHash, Verification},
};

/// Result of a successfully closed session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagingOutcome {
    pub target: UpdateTarget,
    /// Address the image was staged at
    pub start: u32,
    /// Size of the staged image, without any signature trailer
    pub size: u32,
    /// Command left for the bootloader, if the image still has to be copied
    pub command: Option<StagingCommand>,
}

#[derive(Debug)]
struct Session {
    window: StagingWindow,
    cursor: u32,
    buffer: SectorBuffer,
}

impl Session {
    /// Bytes written to flash
    fn progress(&self) -> u32 {
        self.cursor - self.window.start
    }

    /// Bytes not yet written to flash
    fn remaining(&self) -> u32 {
        self.window.size - self.progress()
    }

    /// Bytes written to flash or waiting in the buffer
    fn accepted(&self) -> u32 {
        self.progress() + self.buffered()
    }

    fn buffered(&self) -> u32 {
        self.buffer.len() as u32
    }

    fn is_finished(&self) -> bool {
        self.cursor == self.window.end()
    }

    /// Whether the buffer has to go to flash now
    fn must_flush(&self) -> bool {
        !self.buffer.is_empty() && (self.buffer.is_full() || self.buffered() == self.remaining())
    }

    /// Mark the whole window as consumed after a fatal error
    fn exhaust(&mut self) {
        self.cursor = self.window.end();
    }

    /// Drop the signature trailer from the image once it has been verified
    fn strip_signature(&mut self, payload_size: u32) {
        debug_assert!(payload_size <= self.window.size);
        self.window.size = payload_size;
    }

    /// Shrink the image to what has been written on a forced close
    fn truncate_to_written(&mut self) {
        self.window.size = self.progress();
    }
}

/// Stages firmware and filesystem images in flash
pub struct Updater<F, S, C> {
    flash: F,
    system: S,
    commands: C,
    config: UpdaterConfig,
    session: Option<Session>,
    verification: Verification,
    md5: Md5Checksum,
    expected_md5: Option<String>,
    error: Option<Error>,
    observer: Option<Box<dyn UpdateObserver>>,
    led: Option<Led>,
    run_async: bool,
}

impl<F, S, C> Updater<F, S, C>
where
    F: Flash,
    S: System,
    C: CommandStore,
{
    pub fn new(flash: F, system: S, commands: C) -> Self {
        Self::with_config(flash, system, commands, UpdaterConfig::default())
    }

    pub fn with_config(flash: F, system: S, commands: C, config: UpdaterConfig) -> Self {
        Updater {
            flash,
            system,
            commands,
            config,
            session: None,
            verification: Verification::Checksum,
            md5: Md5Checksum::default(),
            expected_md5: None,
            error: None,
            observer: None,
            led: None,
            run_async: config.run_async,
        }
    }

    /// Open a session for an image of `size` bytes
    ///
    /// Fails with [Error::AlreadyRunning] and no further effect while another
    /// session is open. Any other failure is recorded.
    pub fn begin(
        &mut self,
        size: u32,
        target: UpdateTarget,
        led: Option<Led>,
        overwrite_fs: bool,
    ) -> Result<(), Error> {
        if self.session.is_some() {
            debug!("[begin] already running");
            return Err(Error::AlreadyRunning);
        }

        self.led = led;
        if target == UpdateTarget::Filesystem {
            debug!("[begin] Update Filesystem.");
        }

        let planner = Planner::new(self.config.layout, &self.flash, self.system.boot_mode());
        let window = match planner.plan(size, target, overwrite_fs) {
            Ok(window) => window,
            Err(err) => return Err(self.fail(err)),
        };

        let capacity = self
            .config
            .buffer_size_for(self.system.free_heap(), self.flash.sector_size());
        let buffer = match SectorBuffer::try_with_capacity(capacity) {
            Ok(buffer) => buffer,
            Err(_) => return Err(self.fail(Error::OutOfMemory)),
        };

        self.error = None;
        self.expected_md5 = None;
        self.md5.begin();

        debug!("[begin] startAddress:      {:#010x} ({})", window.start, window.start);
        debug!("[begin] size:              {:#010x} ({})", window.size, window.size);
        debug!("[begin] buffer size:       {}", capacity);

        self.session = Some(Session {
            window,
            cursor: window.start,
            buffer,
        });
        self.notify(|observer| observer.on_start());

        Ok(())
    }

    /// Expect the image to have the given MD5 digest, as 32 hex characters
    ///
    /// Call after [Updater::begin], which forgets any earlier expectation.
    pub fn set_md5(&mut self, expected: &str) -> Result<(), Error> {
        if expected.len() != 32 {
            return Err(Error::InvalidMd5(expected.len()));
        }

        self.expected_md5 = Some(expected.to_owned());
        Ok(())
    }

    /// Verify images against a detached signature instead of an MD5 digest
    pub fn install_signature(
        &mut self,
        hash: Box<dyn UpdateHash>,
        verifier: Box<dyn SignatureVerifier>,
    ) {
        self.verification = Verification::Signed { hash, verifier };
    }

    /// Stop yielding to other tasks while staging
    pub fn run_async(&mut self, run_async: bool) {
        self.run_async = run_async;
    }

    pub fn set_observer(&mut self, observer: Box<dyn UpdateObserver>) {
        self.observer = Some(observer);
    }

    /// Stage `data`, returning the number of bytes accepted
    ///
    /// Returns 0 when no session is open. Data that would take the image past
    /// its declared size is rejected as a whole.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let Some(session) = self.session.as_mut() else {
            return Ok(0);
        };
        if data.is_empty() {
            return Ok(0);
        }

        if session.accepted() == 0 {
            if let Err(err) = image::check_first_byte(session.window.target, data.first().copied())
            {
                session.exhaust();
                return Err(self.fail(err));
            }
        }

        let fits = u32::try_from(data.len())
            .ok()
            .and_then(|len| session.accepted().checked_add(len))
            .is_some_and(|total| total <= session.window.size);
        if !fits {
            return Err(self.fail(Error::NoSpace));
        }

        let mut left = data;
        while !left.is_empty() {
            let session = self.session_mut()?;
            let taken = session.buffer.fill(left);
            left = &left[taken..];

            if session.must_flush() {
                let full = session.buffer.is_full();
                if let Err(err) = self.flush() {
                    return Err(self.fail(err));
                }
                if full {
                    self.pause();
                }
            }
        }

        Ok(data.len())
    }

    /// Stage the rest of the image from a blocking byte source
    ///
    /// Gives up with [Error::StreamTimeout] when the source stays silent for
    /// `timeout`. Returns the number of bytes read, 0 when no session is open.
    pub fn write_stream<B: ByteSource>(
        &mut self,
        source: &mut B,
        timeout: Duration,
    ) -> Result<usize, Error> {
        let Some(session) = self.session.as_mut() else {
            return Ok(0);
        };

        if session.accepted() == 0 {
            if let Err(err) = image::check_first_byte(session.window.target, source.peek()) {
                session.exhaust();
                return Err(self.fail(err));
            }
        }

        let size = session.window.size;
        let policy = self.config.stream.with_timeout(timeout);
        let mut timer = StallTimer::start(policy, self.system.millis());
        let mut written = 0;

        self.notify(|observer| observer.on_progress(0, size));

        loop {
            let session = self.session_mut()?;
            if session.remaining() == 0 {
                break;
            }

            let want = session.buffer.spare().min((size - session.accepted()) as usize);
            self.led_on();

            let session = self.session_mut()?;
            let read = session
                .buffer
                .read_with(want, |buf| source.read_bytes(buf, timeout));

            if read == 0 {
                match timer.on_stall(self.system.millis()) {
                    StallAction::TimedOut => {
                        self.session_mut()?.exhaust();
                        return Err(self.fail(Error::StreamTimeout));
                    }
                    StallAction::Retry { backoff_ms } => self.system.delay(backoff_ms),
                }
            } else {
                timer.record_progress(self.system.millis());
            }
            self.led_off();

            if read > 0 {
                let session = self.session_mut()?;
                if session.must_flush() {
                    if let Err(err) = self.flush() {
                        return Err(self.fail(err));
                    }
                }

                written += read;
                let progress = self.progress();
                self.notify(|observer| observer.on_progress(progress, size));
            }

            self.pause();
        }

        let progress = self.progress();
        self.notify(|observer| observer.on_progress(progress, size));

        Ok(written)
    }

    /// Stage whatever a non-blocking source currently holds
    ///
    /// Returns the number of bytes consumed, 0 when no session is open.
    pub fn write_available<A: AvailableSource>(&mut self, source: &mut A) -> Result<usize, Error> {
        if self.session.is_none() {
            return Ok(0);
        }

        let mut written = 0;
        loop {
            let available = source.available();
            let session = self.session_mut()?;
            let fresh = session.accepted() == 0;
            let want = available
                .min(session.buffer.spare())
                .min((session.window.size - session.accepted()) as usize);
            if want == 0 {
                break;
            }

            let read = session.buffer.read_with(want, |buf| source.read(buf));
            if read == 0 {
                break;
            }

            if fresh {
                let first = session.buffer.as_slice().first().copied();
                if let Err(err) = image::check_first_byte(session.window.target, first) {
                    session.exhaust();
                    return Err(self.fail(err));
                }
            }

            if session.must_flush() {
                if let Err(err) = self.flush() {
                    return Err(self.fail(err));
                }
            }

            written += read;
            if self.remaining() == 0 {
                break;
            }
            self.pause();
        }

        Ok(written)
    }

    /// Close the session and, if the image checks out, leave a command for
    /// the bootloader
    ///
    /// With `even_if_remaining`, an image shorter than declared is staged as
    /// far as it was written.
    pub fn end(&mut self, even_if_remaining: bool) -> Result<StagingOutcome, Error> {
        let Some(session) = self.session.as_ref() else {
            debug!("no update");
            return Err(Error::NotRunning);
        };

        if session.accepted() == 0 {
            return Err(self.fail(Error::NoData));
        }

        if !session.is_finished() && !even_if_remaining {
            debug!(
                "premature end: pos:{}/{}",
                session.accepted(),
                session.window.size
            );
            let err = Error::Incomplete {
                written: session.accepted(),
                expected: session.window.size,
            };
            return Err(self.fail(err));
        }

        if even_if_remaining {
            if !session.buffer.is_empty() {
                if let Err(err) = self.flush() {
                    return Err(self.fail(err));
                }
            }
            self.session_mut()?.truncate_to_written();
        }

        if let Err(err) = self.verify() {
            return Err(self.fail(err));
        }
        if let Err(err) = self.check_staged_header() {
            return Err(self.fail(err));
        }

        let window = self.session_mut()?.window;
        let command = match window.target {
            UpdateTarget::Application => Some(StagingCommand::copy_raw(window.start, 0, window.size)),
            UpdateTarget::Filesystem if self.config.layout.atomic_fs => Some(
                StagingCommand::copy_raw(window.start, self.config.layout.fs_start, window.size),
            ),
            UpdateTarget::Filesystem => None,
        };

        if let Some(command) = &command {
            if let Err(err) = self.commands.write_command(command) {
                debug!("Failed to store staging command: {}", err);
                return Err(self.fail(Error::WriteFailed));
            }
        }

        match window.target {
            UpdateTarget::Application => {
                info!("Staged: address:{:#010x}, size:{:#010x}", window.start, window.size)
            }
            UpdateTarget::Filesystem => {
                info!("Filesystem: address:{:#010x}, size:{:#010x}", window.start, window.size)
            }
        }

        self.reset();

        Ok(StagingOutcome {
            target: window.target,
            start: window.start,
            size: window.size,
            command,
        })
    }

    /// Tear the open session down without recording an error
    pub fn abort(&mut self) {
        if self.session.is_some() {
            debug!("[Updater] aborted");
            self.reset();
        }
    }

    /// The error that ended the last session, if any
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn error_code(&self) -> ErrorCode {
        self.error.as_ref().map_or(ErrorCode::Ok, Error::code)
    }

    /// Human readable description of the recorded error
    pub fn error_string(&self) -> String {
        self.error
            .as_ref()
            .map_or_else(|| String::from("No Error"), ToString::to_string)
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Whether the whole declared image has been written to flash
    pub fn is_finished(&self) -> bool {
        self.session.as_ref().is_some_and(Session::is_finished)
    }

    /// Declared size of the open session, 0 if none
    pub fn size(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.window.size)
    }

    /// Bytes written to flash in the open session
    pub fn progress(&self) -> u32 {
        self.session.as_ref().map_or(0, Session::progress)
    }

    /// Bytes still to be written to flash in the open session
    pub fn remaining(&self) -> u32 {
        self.session.as_ref().map_or(0, Session::remaining)
    }

    /// The staging window of the open session
    pub fn window(&self) -> Option<StagingWindow> {
        self.session.as_ref().map(|s| s.window)
    }

    /// The MD5 digest of the last image closed, as lowercase hex
    pub fn md5_string(&self) -> String {
        self.md5.to_hex()
    }

    pub fn md5(&self) -> Option<[u8; 16]> {
        self.md5.digest()
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn system(&self) -> &S {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }

    pub fn commands(&self) -> &C {
        &self.commands
    }

    pub fn into_parts(self) -> (F, S, C) {
        (self.flash, self.system, self.commands)
    }

    fn session_mut(&mut self) -> Result<&mut Session, Error> {
        self.session.as_mut().ok_or(Error::NotRunning)
    }

    /// Write the buffer at the cursor, erasing the sector first when the
    /// cursor starts one
    fn flush(&mut self) -> Result<(), Error> {
        let run_async = self.run_async;
        let session = self.session.as_mut().ok_or(Error::NotRunning)?;
        let sector_size = self.flash.sector_size();
        let addr = session.cursor;

        if addr % sector_size == 0 {
            if !run_async {
                self.system.yield_now();
            }
            if let Err(err) = self.flash.erase_sector(addr / sector_size) {
                debug!("{}", err);
                session.exhaust();
                return Err(Error::EraseFailed);
            }
        }

        let patch = if addr == session.window.start
            && session.window.target == UpdateTarget::Application
        {
            image::flash_mode_override(session.buffer.as_slice(), self.flash.mode())
                .map(|mode| (FLASH_MODE_OFFSET, mode))
        } else {
            None
        };

        if !run_async {
            self.system.yield_now();
        }
        let written = {
            let persisted = session.buffer.persisted(patch);
            self.flash.write(addr, &persisted)
        };
        if let Err(err) = written {
            debug!("{}", err);
            session.exhaust();
            return Err(Error::WriteFailed);
        }

        // The digest covers the image as sent, not as persisted
        if !self.verification.is_signed() {
            self.md5.add(session.buffer.as_slice());
        }

        let len = session.buffered();
        session.cursor += len;
        session.buffer.clear();

        Ok(())
    }

    /// Check the staged image against its signature or digest
    fn verify(&mut self) -> Result<(), Error> {
        let run_async = self.run_async;
        let session = self.session.as_mut().ok_or(Error::NotRunning)?;

        match &mut self.verification {
            Verification::Signed { hash, verifier } => {
                let system = &mut self.system;
                let mut pause = || {
                    if !run_async {
                        system.yield_now();
                    }
                };

                let payload_size = verify::verify_signed(
                    &mut self.flash,
                    &mut **hash,
                    &**verifier,
                    session.window.start,
                    session.window.size,
                    &mut pause,
                )?;
                session.strip_signature(payload_size);
            }
            Verification::Checksum => {
                self.md5.calculate();
                let calculated = self.md5.to_hex();

                if let Some(expected) = &self.expected_md5 {
                    if !verify::md5_matches(expected, &calculated) {
                        return Err(Error::Md5Mismatch {
                            expected: expected.clone(),
                            calculated,
                        });
                    }
                    debug!("[Updater] MD5 Success: {}", expected);
                }
            }
        }

        Ok(())
    }

    /// Re-read the start of the staged image and check it can boot
    fn check_staged_header(&mut self) -> Result<(), Error> {
        let session = self.session.as_ref().ok_or(Error::NotRunning)?;
        if session.window.target != UpdateTarget::Application {
            return Ok(());
        }

        let mut raw = [0u8; ImageHeader::LEN];
        self.flash
            .read(session.window.start, &mut raw)
            .map_err(|_| Error::ReadFailed)?;

        image::check_staged_header(
            session.window.target,
            ImageHeader::from_bytes(raw),
            self.flash.real_size(),
            self.config.layout.flash_map_support,
        )
    }

    /// Record a session failure and tear the session down
    fn fail(&mut self, err: Error) -> Error {
        error!("[Updater] ERROR[{}]: {}", err.code() as u8, err);

        self.error = Some(err.clone());
        self.notify(|observer| observer.on_error(&err));
        self.reset();

        err
    }

    fn reset(&mut self) {
        self.session = None;
        self.notify(|observer| observer.on_end());
        self.led_off();
    }

    fn pause(&mut self) {
        if !self.run_async {
            self.system.yield_now();
        }
    }

    fn led_on(&mut self) {
        if let Some(led) = self.led {
            self.system.set_pin(led.pin, led.active_high);
        }
    }

    fn led_off(&mut self) {
        if let Some(led) = self.led {
            self.system.set_pin(led.pin, !led.active_high);
        }
    }

    fn notify(&mut self, event: impl FnOnce(&mut dyn UpdateObserver)) {
        if let Some(observer) = self.observer.as_deref_mut() {
            event(observer);
        }
    }
}

impl<F, S, C> std::fmt::Debug for Updater<F, S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("session", &self.session)
            .field("verification", &self.verification)
            .field("error", &self.error)
            .field("run_async", &self.run_async)
            .finish_non_exhaustive()
    }
}
