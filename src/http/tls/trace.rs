//! Handshake event tracing
//!
//! OpenSSL reports every handshake state transition through an info
//! callback. The `openssl` crate does not wrap `SSL_set_info_callback`, so
//! the callback is installed through FFI and finds its collector through
//! the connection's ex-data slot. Each collector is owned by the caller;
//! nothing is recorded in process-wide state.

use foreign_types::ForeignTypeRef;
use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::ssl::{Ssl, SslRef};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::SystemTime;

const SSL_CB_LOOP: c_int = 0x01;
const SSL_CB_EXIT: c_int = 0x02;
const SSL_CB_READ: c_int = 0x04;
const SSL_CB_ALERT: c_int = 0x4000;
const SSL_CB_HANDSHAKE_START: c_int = 0x10;
const SSL_CB_HANDSHAKE_DONE: c_int = 0x20;

extern "C" {
    fn SSL_set_info_callback(
        ssl: *mut openssl_sys::SSL,
        cb: Option<unsafe extern "C" fn(*const openssl_sys::SSL, c_int, c_int)>,
    );
    fn SSL_alert_type_string_long(value: c_int) -> *const c_char;
    fn SSL_alert_desc_string_long(value: c_int) -> *const c_char;
}

/// Marker of the cipher-negotiation step
pub const CIPHER_NEGOTIATION_MARKERS: &[&str] = &["change cipher spec"];

/// Markers of handshake completion
pub const COMPLETION_MARKERS: &[&str] = &["negotiation finished", "finish client handshake"];

/// One handshake sub-state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeEvent {
    pub timestamp: SystemTime,
    /// Position within the attempt, starting at 0
    pub sequence_index: usize,
    /// Diagnostic text from the TLS layer
    pub state_label: String,
}

impl HandshakeEvent {
    /// Case-insensitive substring match, treating `_` and `-` as spaces
    pub fn matches(&self, marker: &str) -> bool {
        normalize(&self.state_label).contains(&normalize(marker))
    }
}

fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '_' | '-' => ' ',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Index of the first event matching any of `markers`
pub fn position_in(events: &[HandshakeEvent], markers: &[&str]) -> Option<usize> {
    events
        .iter()
        .find(|event| markers.iter().any(|marker| event.matches(marker)))
        .map(|event| event.sequence_index)
}

/// Caller-owned collector of handshake events
///
/// Clones share the same event list, so a clone can be handed to a probe
/// or client while the caller keeps another to inspect.
#[derive(Debug, Clone, Default)]
pub struct HandshakeTrace {
    events: Arc<Mutex<Vec<HandshakeEvent>>>,
}

impl HandshakeTrace {
    pub fn new() -> Self {
        HandshakeTrace::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<HandshakeEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Discard events of a previous attempt
    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Append an event with the next sequence index
    pub fn record(&self, state_label: impl Into<String>) {
        let state_label = state_label.into();
        tracing::debug!(state = %state_label, "handshake");

        let mut events = self.lock();
        let sequence_index = events.len();
        events.push(HandshakeEvent {
            timestamp: SystemTime::now(),
            sequence_index,
            state_label,
        });
    }

    /// Snapshot of the recorded events
    pub fn events(&self) -> Vec<HandshakeEvent> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sequence index of the first event matching `marker`
    pub fn position(&self, marker: &str) -> Option<usize> {
        position_in(&self.lock(), &[marker])
    }

    /// Route the info callback of `ssl` into this trace
    pub(crate) fn attach(&self, ssl: &mut SslRef) -> Result<(), ErrorStack> {
        let index = trace_index()?;
        ssl.set_ex_data(index, self.clone());
        unsafe {
            SSL_set_info_callback(ssl.as_ptr(), Some(info_callback));
        }
        Ok(())
    }
}

static TRACE_INDEX: OnceLock<Index<Ssl, HandshakeTrace>> = OnceLock::new();

fn trace_index() -> Result<Index<Ssl, HandshakeTrace>, ErrorStack> {
    if let Some(index) = TRACE_INDEX.get() {
        return Ok(*index);
    }
    let index = Ssl::new_ex_index()?;
    Ok(*TRACE_INDEX.get_or_init(|| index))
}

unsafe fn static_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::from("unknown");
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

unsafe extern "C" fn info_callback(ssl: *const openssl_sys::SSL, kind: c_int, value: c_int) {
    let Some(index) = TRACE_INDEX.get() else {
        return;
    };
    let ssl = SslRef::from_ptr(ssl as *mut openssl_sys::SSL);
    let Some(trace) = ssl.ex_data(*index) else {
        return;
    };

    let state = ssl.state_string_long();
    let label = if kind & SSL_CB_ALERT != 0 {
        let direction = if kind & SSL_CB_READ != 0 { "read" } else { "write" };
        format!(
            "alert {}: {}:{}",
            direction,
            static_str(SSL_alert_type_string_long(value)),
            static_str(SSL_alert_desc_string_long(value))
        )
    } else if kind & SSL_CB_HANDSHAKE_START != 0 {
        format!("handshake start: {}", state)
    } else if kind & SSL_CB_HANDSHAKE_DONE != 0 {
        state.to_string()
    } else if kind & SSL_CB_LOOP != 0 {
        state.to_string()
    } else if kind & SSL_CB_EXIT != 0 && value == 0 {
        format!("failed in {}", state)
    } else {
        return;
    };

    trace.record(label);
}
