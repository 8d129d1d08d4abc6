use parking_lot::Mutex;
use serde::Serialize;

use crate::model::UnitId;

/// User-facing events raised by the navigator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    LoadFailed { target: String, message: String },
    SettingsSaved { channel_id: String },
    SaveFailed { channel_id: String, message: String },
    VisibilityChanged { unit: UnitId, hidden: bool },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notice: Notice) {}
}

/// Collects notices until the presentation layer drains them.
#[derive(Default)]
pub struct AlertState {
    pending: Mutex<Vec<Notice>>,
    initialized: Mutex<bool>,
}

impl AlertState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices raised before initialization are dropped.
    pub fn initialize(&self) {
        *self.initialized.lock() = true;
    }

    pub fn reset(&self) {
        self.pending.lock().clear();
        *self.initialized.lock() = false;
    }

    pub fn drain(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Notifier for AlertState {
    fn notify(&self, notice: Notice) {
        if *self.initialized.lock() {
            self.pending.lock().push(notice);
        }
    }
}
