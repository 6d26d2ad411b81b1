#![allow(dead_code)]

use std::{cell::RefCell, rc::Rc};

use esp_updater::{
    flash::{FlashMode, FlashSize, MemoryFlash},
    image::ImageHeader,
    verify::Md5Checksum,
    Error,
    MemoryCommandStore,
    UpdateObserver,
    Updater,
    UpdaterConfig,
    VirtualSystem,
};

/// Size of the application running on the simulated device
pub const SKETCH_SIZE: u32 = 0x4_0000;

pub type TestUpdater = Updater<MemoryFlash, VirtualSystem, MemoryCommandStore>;

pub fn flash() -> MemoryFlash {
    MemoryFlash::new(FlashSize::_1Mb)
        .with_sketch_size(SKETCH_SIZE)
        .with_mode(FlashMode::Dio)
}

pub fn updater() -> TestUpdater {
    Updater::new(flash(), VirtualSystem::new(), MemoryCommandStore::new())
}

pub fn updater_with(config: UpdaterConfig) -> TestUpdater {
    Updater::with_config(flash(), VirtualSystem::new(), MemoryCommandStore::new(), config)
}

/// An application image for a 1 MB DIO flash, `len` bytes long
pub fn app_image(len: usize) -> Vec<u8> {
    let header = ImageHeader::new(1, FlashMode::Dio, FlashSize::_1Mb, 0);
    let mut data: Vec<u8> = (0..len)
        .map(|i| (i as u32).wrapping_mul(2_654_435_761).to_le_bytes()[3])
        .collect();
    let prefix = bytemuck::bytes_of(&header);
    let n = prefix.len().min(len);
    data[..n].copy_from_slice(&prefix[..n]);
    data
}

pub fn md5_hex(data: &[u8]) -> String {
    let mut md5 = Md5Checksum::default();
    md5.begin();
    md5.add(data);
    md5.calculate();
    md5.to_hex()
}

/// The bytes staged at `start`
pub fn staged(updater: &TestUpdater, start: u32, len: usize) -> &[u8] {
    &updater.flash().as_bytes()[start as usize..][..len]
}

/// Notifications received by an [UpdateObserver], in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    Progress(u32, u32),
    Error(u8),
    End,
}

/// Observer recording every notification into a shared log
#[derive(Default, Clone)]
pub struct Recorder(pub Rc<RefCell<Vec<Event>>>);

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.0.borrow().clone()
    }

    pub fn progress(&self) -> Vec<(u32, u32)> {
        self.0
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Progress(progress, total) => Some((*progress, *total)),
                _ => None,
            })
            .collect()
    }
}

impl UpdateObserver for Recorder {
    fn on_start(&mut self) {
        self.0.borrow_mut().push(Event::Start);
    }

    fn on_progress(&mut self, progress: u32, total: u32) {
        self.0.borrow_mut().push(Event::Progress(progress, total));
    }

    fn on_error(&mut self, error: &Error) {
        self.0.borrow_mut().push(Event::Error(error.code() as u8));
    }

    fn on_end(&mut self) {
        self.0.borrow_mut().push(Event::End);
    }
}
