use evdev::{EventType, InputEvent};
use razer_remap_common::{keymap, tracing, MacroStep};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, warn};

use crate::device::DeviceMux;

/// Turns a raw key stream into KEY_DOWN / KEY_UP / DELAY macro steps
pub struct MacroRecorder {
    min_delay: Duration,
    steps: Vec<MacroStep>,
    last_event: Option<SystemTime>,
}

impl MacroRecorder {
    pub fn new(min_delay_ms: u64) -> Self {
        Self {
            min_delay: Duration::from_millis(min_delay_ms),
            steps: Vec::new(),
            last_event: None,
        }
    }

    /// Feed one raw device event; non-key events and auto-repeat are ignored
    pub fn record(&mut self, event: &InputEvent) {
        if event.event_type() != EventType::KEY {
            return;
        }
        self.push(event.code(), event.value(), event.timestamp());
    }

    pub fn push(&mut self, code: u16, value: i32, at: SystemTime) {
        let pressed = match value {
            1 => true,
            0 => false,
            _ => return,
        };

        let Some(name) = keymap::schema_name(code) else {
            warn!("Key code {} has no name, not recording it", code);
            return;
        };

        if let Some(last) = self.last_event {
            let gap = at.duration_since(last).unwrap_or_default();
            if gap >= self.min_delay {
                self.steps.push(MacroStep::Delay { ms: gap.as_millis() as u64 });
            }
        }
        self.last_event = Some(at);

        let key = name.to_string();
        let step = if pressed { MacroStep::KeyDown { key } } else { MacroStep::KeyUp { key } };
        debug!("Recorded {:?}", step);
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Hand back the recorded steps and start over
    pub fn finish(&mut self) -> Vec<MacroStep> {
        self.last_event = None;
        std::mem::take(&mut self.steps)
    }
}

/// Feed every event read from `mux` into `recorder` until `should_stop` or all devices are gone
pub fn record_session<F>(
    mux: &mut DeviceMux,
    recorder: &mut MacroRecorder,
    poll_timeout_ms: u16,
    should_stop: F,
) -> Result<(), nix::Error>
where
    F: Fn() -> bool,
{
    while !should_stop() && !mux.is_empty() {
        for token in mux.wait(poll_timeout_ms)? {
            let Some(device) = mux.device_mut(token) else {
                continue;
            };
            match device.read_batch() {
                Ok(events) => events.iter().for_each(|e| recorder.record(e)),
                Err(e) => {
                    error!("{}", e);
                    if let Some(mut device) = mux.remove(token) {
                        device.release();
                    }
                }
            }
        }
    }

    for mut device in mux.drain() {
        device.release();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InputDevice;
    use crate::error::DeviceError;
    use std::io::Write;
    use std::os::fd::{AsRawFd, OwnedFd, RawFd};

    const KEY_A: u16 = 30;
    const KEY_B: u16 = 48;
    const KEY_UNNAMED: u16 = 0x2ff;

    fn at(ms: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_millis(1_000_000 + ms)
    }

    #[test]
    fn test_infers_delays_from_timestamps() {
        let mut recorder = MacroRecorder::new(5);
        recorder.push(KEY_A, 1, at(0));
        recorder.push(KEY_A, 2, at(30));
        recorder.push(KEY_A, 0, at(80));
        recorder.push(KEY_B, 1, at(82));
        recorder.push(KEY_B, 0, at(120));

        assert_eq!(
            recorder.finish(),
            vec![
                MacroStep::KeyDown { key: "A".to_string() },
                MacroStep::Delay { ms: 80 },
                MacroStep::KeyUp { key: "A".to_string() },
                MacroStep::KeyDown { key: "B".to_string() },
                MacroStep::Delay { ms: 38 },
                MacroStep::KeyUp { key: "B".to_string() },
            ]
        );
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_ignores_non_key_and_unnamed_events() {
        let mut recorder = MacroRecorder::new(5);
        recorder.record(&InputEvent::new(EventType::RELATIVE, 0, 5));
        recorder.record(&InputEvent::new(EventType::SYNCHRONIZATION, 0, 0));
        recorder.push(KEY_UNNAMED, 1, at(0));
        assert!(recorder.is_empty());

        recorder.push(KEY_A, 1, at(10));
        assert_eq!(recorder.len(), 1);
    }

    #[test]
    fn test_finish_resets_timing() {
        let mut recorder = MacroRecorder::new(5);
        recorder.push(KEY_A, 1, at(0));
        recorder.finish();

        recorder.push(KEY_B, 1, at(500));
        assert_eq!(recorder.finish(), vec![MacroStep::KeyDown { key: "B".to_string() }]);
    }

    struct OneShot {
        read_end: OwnedFd,
        batch: Option<Vec<InputEvent>>,
    }

    impl InputDevice for OneShot {
        fn stable_id(&self) -> &str {
            "oneshot"
        }

        fn raw_fd(&self) -> RawFd {
            self.read_end.as_raw_fd()
        }

        fn read_batch(&mut self) -> Result<Vec<InputEvent>, DeviceError> {
            self.batch.take().ok_or_else(|| DeviceError::Read {
                stable_id: "oneshot".to_string(),
                source: std::io::Error::from_raw_os_error(19),
            })
        }

        fn release(&mut self) {}
    }

    #[test]
    fn test_session_records_until_device_is_lost() {
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        std::fs::File::from(write_end).write_all(b"x").unwrap();

        let batch = vec![
            InputEvent::new(EventType::KEY, KEY_A, 1),
            InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
            InputEvent::new(EventType::KEY, KEY_A, 0),
        ];
        let mut mux = DeviceMux::new().unwrap();
        mux.add(Box::new(OneShot { read_end, batch: Some(batch) })).unwrap();

        let mut recorder = MacroRecorder::new(1_000);
        record_session(&mut mux, &mut recorder, 50, || false).unwrap();

        assert!(mux.is_empty());
        assert_eq!(
            recorder.finish(),
            vec![
                MacroStep::KeyDown { key: "A".to_string() },
                MacroStep::KeyUp { key: "A".to_string() },
            ]
        );
    }
}
