//! Staff / shift / terminal context that every local write is stamped with.

use std::sync::RwLock;

use crate::error::OrderError;

/// Identity of whoever is operating the terminal right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub staff_id: String,
    pub shift_id: String,
    pub terminal_id: String,
}

/// Supplies the current operator context. `None` for any field means writes
/// are not allowed.
pub trait IdentityProvider: Send + Sync {
    fn staff_id(&self) -> Option<String>;
    fn shift_id(&self) -> Option<String>;
    fn terminal_id(&self) -> Option<String>;

    /// Full context, or a precondition error naming the first missing piece.
    fn require(&self) -> Result<SessionContext, OrderError> {
        let terminal_id = non_empty(self.terminal_id())
            .ok_or_else(|| OrderError::Precondition("terminal is not configured".into()))?;
        let staff_id = non_empty(self.staff_id())
            .ok_or_else(|| OrderError::Precondition("no staff member is signed in".into()))?;
        let shift_id = non_empty(self.shift_id())
            .ok_or_else(|| OrderError::Precondition("no active shift".into()))?;
        Ok(SessionContext {
            staff_id,
            shift_id,
            terminal_id,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// In-process session state updated by the host on sign-in and shift
/// open/close.
#[derive(Debug, Default)]
pub struct TerminalSession {
    terminal_id: RwLock<Option<String>>,
    staff_id: RwLock<Option<String>>,
    shift_id: RwLock<Option<String>>,
}

impl TerminalSession {
    pub fn new(terminal_id: impl Into<String>) -> Self {
        Self {
            terminal_id: RwLock::new(Some(terminal_id.into())),
            ..Self::default()
        }
    }

    pub fn sign_in(&self, staff_id: impl Into<String>) {
        write(&self.staff_id, Some(staff_id.into()));
    }

    pub fn sign_out(&self) {
        write(&self.staff_id, None);
        write(&self.shift_id, None);
    }

    pub fn open_shift(&self, shift_id: impl Into<String>) {
        write(&self.shift_id, Some(shift_id.into()));
    }

    pub fn close_shift(&self) {
        write(&self.shift_id, None);
    }
}

fn write(slot: &RwLock<Option<String>>, value: Option<String>) {
    match slot.write() {
        Ok(mut guard) => *guard = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

fn read(slot: &RwLock<Option<String>>) -> Option<String> {
    match slot.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

impl IdentityProvider for TerminalSession {
    fn staff_id(&self) -> Option<String> {
        read(&self.staff_id)
    }

    fn shift_id(&self) -> Option<String> {
        read(&self.shift_id)
    }

    fn terminal_id(&self) -> Option<String> {
        read(&self.terminal_id)
    }
}
