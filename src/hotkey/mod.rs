//! Global key-combination listener for push-to-talk.
//!
//! Captures keyboard events system-wide via `rdev` on an owned OS thread.
//! A combo string (`"space"`, `"ctrl+space"`, `"down+right"`) is parsed into
//! a set of normalized key matchers; [`ComboTracker`] watches the live set
//! of depressed keys and emits `ComboDown` the first time it becomes a
//! superset of the combo and `ComboUp` the first time it ceases to be.
//! Auto-repeat presses are filtered by the pressed-set, and a debounce
//! window suppresses rapid re-triggers.

pub mod permissions;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use rdev::{listen, Event, EventType, Key};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{Result, VoiceError};

/// Events published to the PTT controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    /// The combo became fully held.
    ComboDown,
    /// The combo was released (any member key up).
    ComboUp,
    /// The cancel key was pressed.
    CancelDown,
}

/// A single matcher within a combo. Modifier names match either side of the
/// keyboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyMatcher {
    Exact(Key),
    Control,
    Shift,
    Alt,
    Meta,
}

impl KeyMatcher {
    fn matches(self, key: Key) -> bool {
        match self {
            Self::Exact(k) => key == k,
            Self::Control => matches!(key, Key::ControlLeft | Key::ControlRight),
            Self::Shift => matches!(key, Key::ShiftLeft | Key::ShiftRight),
            Self::Alt => matches!(key, Key::Alt | Key::AltGr),
            Self::Meta => matches!(key, Key::MetaLeft | Key::MetaRight),
        }
    }
}

/// Parse a combo string like `"ctrl+space"` into matchers.
pub(crate) fn parse_combo(combo: &str) -> Result<Vec<KeyMatcher>> {
    let mut matchers = Vec::new();
    for part in combo.split('+') {
        let name = part.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        let matcher = parse_key_name(&name).ok_or_else(|| {
            VoiceError::InvalidState(format!("unknown key in combo '{combo}': {name}"))
        })?;
        if !matchers.contains(&matcher) {
            matchers.push(matcher);
        }
    }
    if matchers.is_empty() {
        return Err(VoiceError::InvalidState(format!("empty key combo: '{combo}'")));
    }
    Ok(matchers)
}

fn parse_key_name(name: &str) -> Option<KeyMatcher> {
    use KeyMatcher::*;
    let key = match name {
        "ctrl" | "control" => return Some(Control),
        "shift" => return Some(Shift),
        "alt" | "option" => return Some(Alt),
        "meta" | "cmd" | "command" | "super" | "win" => return Some(Meta),
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        "space" => Key::Space,
        "tab" => Key::Tab,
        "enter" | "return" => Key::Return,
        "escape" | "esc" => Key::Escape,
        "backspace" => Key::Backspace,
        "capslock" => Key::CapsLock,
        "insert" => Key::Insert,
        "home" => Key::Home,
        "end" => Key::End,
        "pageup" => Key::PageUp,
        "pagedown" => Key::PageDown,
        "delete" => Key::Delete,
        "up" | "arrowup" => Key::UpArrow,
        "down" | "arrowdown" => Key::DownArrow,
        "left" | "arrowleft" => Key::LeftArrow,
        "right" | "arrowright" => Key::RightArrow,
        "a" => Key::KeyA,
        "b" => Key::KeyB,
        "c" => Key::KeyC,
        "d" => Key::KeyD,
        "e" => Key::KeyE,
        "f" => Key::KeyF,
        "g" => Key::KeyG,
        "h" => Key::KeyH,
        "i" => Key::KeyI,
        "j" => Key::KeyJ,
        "k" => Key::KeyK,
        "l" => Key::KeyL,
        "m" => Key::KeyM,
        "n" => Key::KeyN,
        "o" => Key::KeyO,
        "p" => Key::KeyP,
        "q" => Key::KeyQ,
        "r" => Key::KeyR,
        "s" => Key::KeyS,
        "t" => Key::KeyT,
        "u" => Key::KeyU,
        "v" => Key::KeyV,
        "w" => Key::KeyW,
        "x" => Key::KeyX,
        "y" => Key::KeyY,
        "z" => Key::KeyZ,
        "0" => Key::Num0,
        "1" => Key::Num1,
        "2" => Key::Num2,
        "3" => Key::Num3,
        "4" => Key::Num4,
        "5" => Key::Num5,
        "6" => Key::Num6,
        "7" => Key::Num7,
        "8" => Key::Num8,
        "9" => Key::Num9,
        _ => return None,
    };
    Some(Exact(key))
}

/// Pure combo state: pressed-set tracking, superset edge detection,
/// debounce, auto-repeat suppression. Driven by the listener thread and
/// unit-testable without an OS hook.
pub(crate) struct ComboTracker {
    combo: Vec<KeyMatcher>,
    cancel: Vec<KeyMatcher>,
    pressed: Vec<Key>,
    active: bool,
    last_down_ms: Option<u64>,
    debounce_ms: u64,
}

impl ComboTracker {
    pub(crate) fn new(combo: Vec<KeyMatcher>, cancel: Vec<KeyMatcher>, debounce_ms: u64) -> Self {
        Self {
            combo,
            cancel,
            pressed: Vec::new(),
            active: false,
            last_down_ms: None,
            debounce_ms,
        }
    }

    fn satisfied(&self) -> bool {
        self.combo
            .iter()
            .all(|m| self.pressed.iter().any(|&k| m.matches(k)))
    }

    /// Feed one OS key event; returns the handler event to publish, if any.
    pub(crate) fn on_key(&mut self, key: Key, down: bool, now_ms: u64) -> Option<KeyEvent> {
        if down {
            if self.pressed.contains(&key) {
                return None; // auto-repeat
            }
            self.pressed.push(key);

            if self.cancel.iter().any(|m| m.matches(key)) {
                return Some(KeyEvent::CancelDown);
            }

            if !self.active && self.satisfied() {
                if let Some(last) = self.last_down_ms {
                    if now_ms.saturating_sub(last) < self.debounce_ms {
                        // Inside the debounce window: swallow the press
                        // entirely so no orphan ComboUp follows.
                        self.pressed.retain(|&k| k != key);
                        return None;
                    }
                }
                self.active = true;
                self.last_down_ms = Some(now_ms);
                return Some(KeyEvent::ComboDown);
            }
        } else {
            self.pressed.retain(|&k| k != key);
            if self.active && !self.satisfied() {
                self.active = false;
                return Some(KeyEvent::ComboUp);
            }
        }
        None
    }
}

/// Configuration for the listener.
#[derive(Debug, Clone)]
pub struct HotkeyConfig {
    pub combo: String,
    pub cancel_key: String,
    pub debounce_ms: u64,
}

/// Global hotkey listener. The rdev hook runs on an OS thread this handler
/// owns; its callback only updates the tracker and try-sends events, never
/// blocking.
pub struct KeyboardHandler {
    config: HotkeyConfig,
    running: Arc<AtomicBool>,
    dropped_events: Arc<AtomicU64>,
    started: bool,
}

impl KeyboardHandler {
    pub fn new(config: HotkeyConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            dropped_events: Arc::new(AtomicU64::new(0)),
            started: false,
        }
    }

    /// Whether the platform permits a global listener.
    pub fn check_permission() -> bool {
        permissions::check_permission()
    }

    pub fn permission_guidance() -> &'static str {
        permissions::permission_guidance()
    }

    /// Start the listener thread. Fails with [`VoiceError::PermissionDenied`]
    /// when the platform permission is missing and with `InvalidState` when
    /// the combo cannot be parsed.
    pub fn start(&mut self, tx: mpsc::Sender<KeyEvent>) -> Result<()> {
        if self.started {
            return Ok(());
        }
        if !Self::check_permission() {
            return Err(VoiceError::PermissionDenied {
                guidance: Self::permission_guidance().to_string(),
            });
        }

        let combo = parse_combo(&self.config.combo)?;
        let cancel = parse_combo(&self.config.cancel_key)?;
        let mut tracker = ComboTracker::new(combo, cancel, self.config.debounce_ms);

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let dropped = self.dropped_events.clone();

        info!(
            combo = %self.config.combo,
            cancel = %self.config.cancel_key,
            "starting keyboard listener"
        );

        thread::Builder::new()
            .name("chatta-hotkey".into())
            .spawn(move || {
                let callback = move |event: Event| {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }
                    let (key, down) = match event.event_type {
                        EventType::KeyPress(key) => (key, true),
                        EventType::KeyRelease(key) => (key, false),
                        _ => return,
                    };
                    if let Some(out) = tracker.on_key(key, down, now_ms()) {
                        // Bounded queue, drop-newest: the callback must
                        // never block inside the OS hook.
                        if tx.try_send(out).is_err() {
                            dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                };
                if let Err(e) = listen(callback) {
                    warn!("keyboard listener error: {:?}", e);
                }
            })
            .map_err(|e| VoiceError::device(format!("failed to spawn hotkey thread: {e}")))?;

        self.started = true;
        Ok(())
    }

    /// Stop delivering events. The underlying rdev hook cannot be unhooked
    /// portably; the callback goes inert instead.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.started = false;
    }

    /// Events dropped due to queue overflow.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
