use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, Key, RelativeAxisType};
use razer_remap_common::{keymap, tracing};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::OutputError;

const SYN_REPORT: u16 = 0x00;
const SYN_DROPPED: u16 = 0x03;

/// Destination for synthesized input reports
pub trait EventSink: Send {
    /// Write one report; the sink terminates it with SYN_REPORT
    fn emit(&mut self, events: &[InputEvent]) -> Result<(), OutputError>;
    fn close(&mut self);
}

/// uinput virtual device declaring every key, button and axis the engine can emit
pub struct UinputSink {
    device: Option<VirtualDevice>,
}

impl UinputSink {
    pub fn create(name: &str) -> Result<Self, OutputError> {
        info!("Initializing uinput virtual device");

        let mut keys = AttributeSet::<Key>::new();
        for code in keymap::VIRTUAL_KEY_CODES.chain(keymap::VIRTUAL_BUTTON_CODES) {
            keys.insert(Key::new(code));
        }

        let mut axes = AttributeSet::<RelativeAxisType>::new();
        for code in keymap::VIRTUAL_REL_AXES {
            axes.insert(RelativeAxisType(code));
        }

        let device = VirtualDeviceBuilder::new()
            .and_then(|builder| builder.name(name).with_keys(&keys))
            .and_then(|builder| builder.with_relative_axes(&axes))
            .and_then(|builder| builder.build())
            .map_err(OutputError::Create)?;

        info!("Successfully created uinput virtual device: {}", name);
        Ok(Self { device: Some(device) })
    }
}

impl EventSink for UinputSink {
    fn emit(&mut self, events: &[InputEvent]) -> Result<(), OutputError> {
        let device = self.device.as_mut().ok_or(OutputError::Closed)?;
        device.emit(events).map_err(OutputError::Write)
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            info!("Destroying uinput virtual device");
        }
    }
}

/// One event written to a [`MemorySink`]
#[derive(Debug, Clone, Copy)]
pub struct RecordedEvent {
    pub at: Instant,
    pub event_type: EventType,
    pub code: u16,
    pub value: i32,
}

impl RecordedEvent {
    pub fn is_key(&self) -> bool {
        self.event_type == EventType::KEY
    }

    pub fn is_syn_report(&self) -> bool {
        self.event_type == EventType::SYNCHRONIZATION && self.code == SYN_REPORT
    }
}

/// In-memory sink; clones share one log so a test can keep a handle
#[derive(Clone, Default)]
pub struct MemorySink {
    log: Arc<Mutex<Vec<RecordedEvent>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, each report followed by its SYN_REPORT
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `(code, value)` of every key event in write order
    pub fn key_events(&self) -> Vec<(u16, i32)> {
        self.events()
            .iter()
            .filter(|e| e.is_key())
            .map(|e| (e.code, e.value))
            .collect()
    }

    /// Reports as `(type, code, value)` lists, without the terminating SYN_REPORT
    pub fn reports(&self) -> Vec<Vec<(u16, u16, i32)>> {
        let mut reports = Vec::new();
        let mut current = Vec::new();
        for event in self.events() {
            if event.is_syn_report() {
                reports.push(std::mem::take(&mut current));
            } else {
                current.push((event.event_type.0, event.code, event.value));
            }
        }
        reports
    }

    pub fn clear(&self) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl EventSink for MemorySink {
    fn emit(&mut self, events: &[InputEvent]) -> Result<(), OutputError> {
        if self.is_closed() {
            return Err(OutputError::Closed);
        }

        let now = Instant::now();
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        for event in events {
            log.push(RecordedEvent {
                at: now,
                event_type: event.event_type(),
                code: event.code(),
                value: event.value(),
            });
        }
        log.push(RecordedEvent {
            at: now,
            event_type: EventType::SYNCHRONIZATION,
            code: SYN_REPORT,
            value: 0,
        });
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Who asserted a key on the virtual device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyOrigin {
    Binding,
    Macro,
}

/// Shared state behind the single writer lock
struct OutputState {
    sink: Box<dyn EventSink>,
    /// Keys currently held down by our own writes, in assertion order
    ledger: Vec<(u16, KeyOrigin)>,
    /// Passthrough events waiting for their source SYN_REPORT
    pending: Vec<InputEvent>,
    closed: bool,
}

/// The single writer to the virtual device; cloning shares the same device
#[derive(Clone)]
pub struct VirtualOutput {
    state: Arc<Mutex<OutputState>>,
}

/// Exclusive access to the virtual device for a sequence of writes
pub struct OutputGuard<'a> {
    state: MutexGuard<'a, OutputState>,
}

impl VirtualOutput {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            state: Arc::new(Mutex::new(OutputState {
                sink,
                ledger: Vec::new(),
                pending: Vec::new(),
                closed: false,
            })),
        }
    }

    pub fn lock(&self) -> OutputGuard<'_> {
        OutputGuard {
            state: self.state.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    pub fn passthrough(&self, event: InputEvent) -> Result<(), OutputError> {
        self.lock().passthrough(event)
    }

    pub fn press(&self, code: u16, origin: KeyOrigin) -> Result<(), OutputError> {
        self.lock().press(code, origin)
    }

    pub fn release(&self, code: u16) -> Result<(), OutputError> {
        self.lock().release(code)
    }

    pub fn repeat(&self, code: u16) -> Result<(), OutputError> {
        self.lock().repeat(code)
    }

    pub fn release_all(&self) -> usize {
        self.lock().release_all()
    }

    pub fn release_origin(&self, origin: KeyOrigin) -> usize {
        self.lock().release_origin(origin)
    }

    pub fn asserted(&self) -> Vec<u16> {
        self.lock().asserted()
    }

    pub fn close(&self) {
        self.lock().close()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().state.closed
    }
}

impl OutputGuard<'_> {
    /// Forward an unhandled source event, keeping it in its original report
    pub fn passthrough(&mut self, event: InputEvent) -> Result<(), OutputError> {
        if event.event_type() != EventType::SYNCHRONIZATION {
            self.state.pending.push(event);
            return Ok(());
        }

        match event.code() {
            SYN_REPORT => self.flush(),
            SYN_DROPPED => {
                debug!("Source dropped events, discarding partial report");
                self.state.pending.clear();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn press(&mut self, code: u16, origin: KeyOrigin) -> Result<(), OutputError> {
        self.write(&[key_event(code, 1)])?;
        if !self.state.ledger.iter().any(|(c, _)| *c == code) {
            self.state.ledger.push((code, origin));
        }
        Ok(())
    }

    pub fn release(&mut self, code: u16) -> Result<(), OutputError> {
        self.state.ledger.retain(|(c, _)| *c != code);
        self.write(&[key_event(code, 0)])
    }

    /// Auto-repeat for a key we currently hold
    pub fn repeat(&mut self, code: u16) -> Result<(), OutputError> {
        if !self.state.ledger.iter().any(|(c, _)| *c == code) {
            return Ok(());
        }
        self.write(&[key_event(code, 2)])
    }

    /// Release every asserted key in reverse assertion order; returns how many were released
    pub fn release_all(&mut self) -> usize {
        let keys: Vec<u16> = self.state.ledger.drain(..).rev().map(|(code, _)| code).collect();
        self.release_keys(&keys)
    }

    /// Release only the keys asserted by `origin`
    pub fn release_origin(&mut self, origin: KeyOrigin) -> usize {
        let keys: Vec<u16> = self
            .state
            .ledger
            .iter()
            .rev()
            .filter(|(_, o)| *o == origin)
            .map(|(code, _)| *code)
            .collect();
        self.state.ledger.retain(|(_, o)| *o != origin);
        self.release_keys(&keys)
    }

    pub fn asserted(&self) -> Vec<u16> {
        self.state.ledger.iter().map(|(code, _)| *code).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed
    }

    /// Release anything still held, then destroy the device
    pub fn close(&mut self) {
        if self.state.closed {
            return;
        }
        self.state.pending.clear();
        let released = self.release_all();
        if released > 0 {
            warn!("Released {} keys while closing the virtual device", released);
        }
        self.state.sink.close();
        self.state.closed = true;
    }

    fn release_keys(&mut self, keys: &[u16]) -> usize {
        if keys.is_empty() {
            return 0;
        }

        debug!("Releasing asserted keys: {:?}", keys);
        let events: Vec<InputEvent> = keys.iter().map(|&code| key_event(code, 0)).collect();
        if let Err(e) = self.write(&events) {
            warn!("Failed to release keys {:?}: {}", keys, e);
        }
        keys.len()
    }

    /// Emit the pending passthrough report first so relative order is preserved
    fn write(&mut self, events: &[InputEvent]) -> Result<(), OutputError> {
        self.flush()?;
        self.emit(events)
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        if self.state.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.state.pending);
        self.emit(&pending)
    }

    fn emit(&mut self, events: &[InputEvent]) -> Result<(), OutputError> {
        if self.state.closed {
            return Err(OutputError::Closed);
        }
        self.state.sink.emit(events)
    }
}

pub fn key_event(code: u16, value: i32) -> InputEvent {
    InputEvent::new(EventType::KEY, code, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: u16 = 30;
    const KEY_C: u16 = 46;
    const KEY_LEFTCTRL: u16 = 29;
    const REL: u16 = 0x02;

    fn output() -> (VirtualOutput, MemorySink) {
        let sink = MemorySink::new();
        (VirtualOutput::new(Box::new(sink.clone())), sink)
    }

    fn syn() -> InputEvent {
        InputEvent::new(EventType::SYNCHRONIZATION, SYN_REPORT, 0)
    }

    fn rel(code: u16, value: i32) -> InputEvent {
        InputEvent::new(EventType::RELATIVE, code, value)
    }

    #[test]
    fn test_passthrough_keeps_report_framing() {
        let (output, sink) = output();

        output.passthrough(rel(keymap::REL_X, 3)).unwrap();
        output.passthrough(rel(keymap::REL_Y, -2)).unwrap();
        assert!(sink.events().is_empty());

        output.passthrough(syn()).unwrap();
        assert_eq!(
            sink.reports(),
            vec![vec![(REL, keymap::REL_X, 3), (REL, keymap::REL_Y, -2)]]
        );

        // A bare SYN_REPORT with nothing pending writes nothing
        output.passthrough(syn()).unwrap();
        assert_eq!(sink.reports().len(), 1);
    }

    #[test]
    fn test_engine_write_flushes_pending_frame_first() {
        let (output, sink) = output();

        output.passthrough(rel(keymap::REL_X, 1)).unwrap();
        output.press(KEY_A, KeyOrigin::Binding).unwrap();
        output.passthrough(syn()).unwrap();

        assert_eq!(
            sink.reports(),
            vec![vec![(REL, keymap::REL_X, 1)], vec![(1, KEY_A, 1)]]
        );
    }

    #[test]
    fn test_ledger_tracks_press_and_release() {
        let (output, _sink) = output();

        output.press(KEY_LEFTCTRL, KeyOrigin::Binding).unwrap();
        output.press(KEY_C, KeyOrigin::Binding).unwrap();
        output.press(KEY_C, KeyOrigin::Macro).unwrap();
        assert_eq!(output.asserted(), vec![KEY_LEFTCTRL, KEY_C]);

        output.release(KEY_C).unwrap();
        assert_eq!(output.asserted(), vec![KEY_LEFTCTRL]);
    }

    #[test]
    fn test_release_all_reverses_assertion_order() {
        let (output, sink) = output();

        output.press(KEY_LEFTCTRL, KeyOrigin::Binding).unwrap();
        output.press(KEY_C, KeyOrigin::Macro).unwrap();
        output.press(KEY_A, KeyOrigin::Binding).unwrap();
        sink.clear();

        assert_eq!(output.release_all(), 3);
        assert_eq!(sink.key_events(), vec![(KEY_A, 0), (KEY_C, 0), (KEY_LEFTCTRL, 0)]);
        assert!(output.asserted().is_empty());
        assert_eq!(output.release_all(), 0);
    }

    #[test]
    fn test_release_origin_only_touches_that_origin() {
        let (output, sink) = output();

        output.press(KEY_LEFTCTRL, KeyOrigin::Binding).unwrap();
        output.press(KEY_A, KeyOrigin::Macro).unwrap();
        sink.clear();

        assert_eq!(output.release_origin(KeyOrigin::Macro), 1);
        assert_eq!(sink.key_events(), vec![(KEY_A, 0)]);
        assert_eq!(output.asserted(), vec![KEY_LEFTCTRL]);
    }

    #[test]
    fn test_repeat_only_for_held_keys() {
        let (output, sink) = output();

        output.repeat(KEY_A).unwrap();
        assert!(sink.key_events().is_empty());

        output.press(KEY_A, KeyOrigin::Binding).unwrap();
        output.repeat(KEY_A).unwrap();
        assert_eq!(sink.key_events(), vec![(KEY_A, 1), (KEY_A, 2)]);
    }

    #[test]
    fn test_close_releases_and_rejects_writes() {
        let (output, sink) = output();

        output.press(KEY_A, KeyOrigin::Binding).unwrap();
        output.close();

        assert!(sink.is_closed());
        assert!(output.is_closed());
        assert_eq!(sink.key_events(), vec![(KEY_A, 1), (KEY_A, 0)]);
        assert!(matches!(output.press(KEY_C, KeyOrigin::Binding), Err(OutputError::Closed)));

        // Second close is a no-op
        output.close();
        assert_eq!(sink.key_events().len(), 2);
    }
}
