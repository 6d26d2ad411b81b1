use std::{collections::VecDeque, time::Duration};

use esp_updater::{
    stream::{AvailableSource, ByteSource, IoSource},
    Error,
    ErrorCode,
    UpdateTarget,
};
use pretty_assertions::assert_eq;

mod common;

use common::*;

/// One step of a scripted connection
enum Step {
    Data(Vec<u8>),
    Silence,
}

/// [ByteSource] replaying a script of data bursts and silent reads
struct Scripted {
    steps: VecDeque<Step>,
}

impl Scripted {
    fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Scripted {
            steps: steps.into_iter().collect(),
        }
    }

    fn pending(&self) -> usize {
        self.steps
            .iter()
            .map(|step| match step {
                Step::Data(data) => data.len(),
                Step::Silence => 0,
            })
            .sum()
    }
}

impl ByteSource for Scripted {
    fn peek(&mut self) -> Option<u8> {
        self.steps.iter().find_map(|step| match step {
            Step::Data(data) => data.first().copied(),
            Step::Silence => None,
        })
    }

    fn read_bytes(&mut self, buf: &mut [u8], _timeout: Duration) -> usize {
        match self.steps.pop_front() {
            Some(Step::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.steps.push_front(Step::Data(data.split_off(n)));
                }
                n
            }
            Some(Step::Silence) | None => 0,
        }
    }
}

/// [AvailableSource] the test refills between calls
#[derive(Default)]
struct Mailbox {
    data: VecDeque<u8>,
}

impl AvailableSource for Mailbox {
    fn available(&mut self) -> usize {
        self.data.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.data.len());
        for (slot, byte) in buf.iter_mut().zip(self.data.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

#[test]
fn reader_is_staged_with_progress() {
    let data = app_image(10_000);
    let recorder = Recorder::default();
    let mut updater = updater();
    updater.set_observer(Box::new(recorder.clone()));

    updater.begin(10_000, UpdateTarget::Application, None, false).unwrap();
    updater.set_md5(&md5_hex(&data)).unwrap();
    let read = updater
        .write_stream(&mut IoSource::new(data.as_slice()), Duration::from_secs(1))
        .unwrap();
    let outcome = updater.end(false).unwrap();

    assert_eq!(read, 10_000);
    assert_eq!(staged(&updater, outcome.start, 10_000), data.as_slice());
    assert_eq!(
        recorder.progress(),
        [
            (0, 10_000),
            (4096, 10_000),
            (8192, 10_000),
            (10_000, 10_000),
            (10_000, 10_000)
        ]
    );
    assert_eq!(recorder.events().first(), Some(&Event::Start));
    assert_eq!(recorder.events().last(), Some(&Event::End));
}

#[test]
fn stalls_shorter_than_timeout_are_waited_out() {
    let data = app_image(3000);
    let mut source = Scripted::new(
        [Step::Data(data[..1000].to_vec())]
            .into_iter()
            .chain((0..5).map(|_| Step::Silence))
            .chain([Step::Data(data[1000..].to_vec())]),
    );
    let recorder = Recorder::default();
    let mut updater = updater();
    updater.set_observer(Box::new(recorder.clone()));

    updater.begin(3000, UpdateTarget::Application, None, false).unwrap();
    let read = updater.write_stream(&mut source, Duration::from_secs(1)).unwrap();

    assert_eq!(read, 3000);
    assert_eq!(updater.system().delays(), &[100; 5]);
    assert_eq!(
        recorder.progress(),
        [(0, 3000), (0, 3000), (3000, 3000), (3000, 3000)]
    );
    assert!(updater.end(false).is_ok());
}

#[test]
fn silent_source_times_out() {
    let data = app_image(1000);
    let mut source = Scripted::new([Step::Data(data[..100].to_vec())]);
    let recorder = Recorder::default();
    let mut updater = updater();
    updater.set_observer(Box::new(recorder.clone()));

    updater.begin(1000, UpdateTarget::Application, None, false).unwrap();

    assert_eq!(
        updater.write_stream(&mut source, Duration::from_millis(1000)),
        Err(Error::StreamTimeout)
    );
    assert_eq!(updater.error_code(), ErrorCode::Stream);
    assert_eq!(updater.error_string(), "Stream Read Timeout");
    assert!(!updater.is_running());
    assert_eq!(updater.system().delays().len(), 10);
    assert!(updater.flash().writes().is_empty());

    let events = recorder.events();
    assert_eq!(&events[events.len() - 2..], &[Event::Error(6), Event::End]);
}

#[test]
fn stream_with_bad_magic_is_left_unread() {
    let mut data = app_image(64);
    data[0] = 0xFF;
    let mut source = Scripted::new([Step::Data(data)]);
    let mut updater = updater();

    updater.begin(64, UpdateTarget::Application, None, false).unwrap();

    assert_eq!(
        updater.write_stream(&mut source, Duration::from_secs(1)),
        Err(Error::MagicByte)
    );
    assert_eq!(source.pending(), 64);
}

#[test]
fn stream_resumes_after_buffered_writes() {
    let data = app_image(6000);
    let mut updater = updater();

    updater.begin(6000, UpdateTarget::Application, None, false).unwrap();
    updater.set_md5(&md5_hex(&data)).unwrap();
    updater.write(&data[..100]).unwrap();

    let mut source = Scripted::new([Step::Data(data[100..].to_vec())]);
    let read = updater.write_stream(&mut source, Duration::from_secs(1)).unwrap();

    assert_eq!(read, 5900);
    assert!(updater.is_finished());
    assert!(updater.end(false).is_ok());
}

#[test]
fn stream_without_session_reads_nothing() {
    let data = app_image(64);
    let mut source = Scripted::new([Step::Data(data)]);
    let mut updater = updater();

    assert_eq!(updater.write_stream(&mut source, Duration::from_secs(1)), Ok(0));
    assert_eq!(source.pending(), 64);
}

#[test]
fn available_bytes_are_drained_across_calls() {
    let data = app_image(5000);
    let mut mailbox = Mailbox::default();
    let mut updater = updater();

    updater.begin(5000, UpdateTarget::Application, None, false).unwrap();
    updater.set_md5(&md5_hex(&data)).unwrap();

    mailbox.data.extend(&data[..3000]);
    assert_eq!(updater.write_available(&mut mailbox), Ok(3000));
    assert_eq!(updater.progress(), 0);
    assert_eq!(updater.write_available(&mut mailbox), Ok(0));

    mailbox.data.extend(&data[3000..]);
    assert_eq!(updater.write_available(&mut mailbox), Ok(2000));
    assert_eq!(updater.remaining(), 0);
    assert!(mailbox.data.is_empty());

    let outcome = updater.end(false).unwrap();
    assert_eq!(staged(&updater, outcome.start, 5000), data.as_slice());
}

#[test]
fn available_bytes_beyond_image_are_left() {
    let data = app_image(300);
    let mut mailbox = Mailbox::default();
    mailbox.data.extend(&data);
    mailbox.data.extend([0xAA; 50]);
    let mut updater = updater();

    updater.begin(300, UpdateTarget::Application, None, false).unwrap();

    assert_eq!(updater.write_available(&mut mailbox), Ok(300));
    assert_eq!(mailbox.data.len(), 50);
    assert!(updater.end(false).is_ok());
}

#[test]
fn available_bytes_with_bad_magic_fail() {
    let mut mailbox = Mailbox::default();
    mailbox.data.extend([0u8; 32]);
    let mut updater = updater();

    updater.begin(32, UpdateTarget::Application, None, false).unwrap();

    assert_eq!(updater.write_available(&mut mailbox), Err(Error::MagicByte));
    assert_eq!(updater.error_code(), ErrorCode::MagicByte);
    assert!(updater.flash().writes().is_empty());
}
