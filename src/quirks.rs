//! ## Quirks registry & hooks
//!
//! A process-wide, read-after-freeze table of `(vid, pid[, revision])` →
//! [`QuirksRecord`] entries. `open()` looks the device up,
//! merges the match with defaults, and freezes the result into the handle;
//! nothing after that point may mutate the record a given handle is using.
//! The registry itself stays mutable for *future* opens — callers populate
//! it via [`QuirksRegistry::register`] before calling `open`.
//!
//! Quirks are data, not code paths: a `QuirksRecord` is a plain set of
//! enumerated fields plus an optional vector of hook closures, never a
//! subclassed device type.

use std::fmt;
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::error::Error;
use crate::transaction::TransactionSnapshot;

/// What to do when INITIATE_ABORT fails or times out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AbortRecoveryPolicy {
    /// Surface the error as spec.md's §4.4 step 4 describes by default.
    #[default]
    Spec,
    /// Fall back to a full INITIATE_CLEAR + clear-halt on both bulk endpoints.
    Clear,
    /// Release and re-claim the interface, resetting the bTag counter.
    Reopen,
}

/// Which mechanism `read_stb()` should trust for the USB488 status byte
///.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadStatusByteVia {
    /// Read only from the interrupt-in endpoint.
    Interrupt,
    /// Read only via the READ_STATUS_BYTE control request.
    #[default]
    Control,
    /// Read both and require them to agree.
    Both,
}

/// The outcome of a hook invocation. Generic over what a `Replace` carries,
/// since `pre_open`/`post_open`/`abort_override` replace different things
/// than `before_write`/`after_read` do.
pub enum HookOutcome<T> {
    /// Proceed with the default behavior.
    Continue,
    /// Substitute the given value for the default behavior's output.
    Replace(T),
    /// Abort the operation with this error.
    Fail(Error),
}

impl<T> fmt::Debug for HookOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookOutcome::Continue => write!(f, "Continue"),
            HookOutcome::Replace(_) => write!(f, "Replace(..)"),
            HookOutcome::Fail(e) => write!(f, "Fail({e})"),
        }
    }
}

/// The minimal device identity a hook closure is given; hooks should not
/// need the live transport to make their decision.
#[derive(Clone, Debug)]
pub struct HookDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    pub interface_number: u8,
}

type PreOpenHook = dyn Fn(&HookDeviceInfo) -> HookOutcome<()> + Send + Sync;
type PostOpenHook = dyn Fn(&HookDeviceInfo) -> HookOutcome<()> + Send + Sync;
type TransactionHook =
    dyn Fn(&HookDeviceInfo, &TransactionSnapshot) -> HookOutcome<TransactionSnapshot> + Send + Sync;
type AbortOverrideHook =
    dyn Fn(&HookDeviceInfo) -> HookOutcome<AbortRecoveryPolicy> + Send + Sync;

/// Optional hook vector a `QuirksRecord` may carry (spec.md §4.5 "Hook
/// points"). Every field defaults to `None` (no override).
#[derive(Clone, Default)]
pub struct Hooks {
    pub pre_open: Option<Arc<PreOpenHook>>,
    pub post_open: Option<Arc<PostOpenHook>>,
    pub before_write: Option<Arc<TransactionHook>>,
    pub after_write: Option<Arc<TransactionHook>>,
    pub before_read: Option<Arc<TransactionHook>>,
    pub after_read: Option<Arc<TransactionHook>>,
    pub abort_override: Option<Arc<AbortOverrideHook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("pre_open", &self.pre_open.is_some())
            .field("post_open", &self.post_open.is_some())
            .field("before_write", &self.before_write.is_some())
            .field("after_write", &self.after_write.is_some())
            .field("before_read", &self.before_read.is_some())
            .field("after_read", &self.after_read.is_some())
            .field("abort_override", &self.abort_override.is_some())
            .finish()
    }
}

/// The set of behavioral overrides a specific device needs (spec.md §3
/// "Quirks record"). Every field has the documented spec-compliant default.
#[derive(Clone, Debug)]
pub struct QuirksRecord {
    /// Tolerate devices that skip the mandatory 4-byte alignment padding.
    pub read_extra_alignment_padding: bool,
    /// Treat GET_CAPABILITIES flags as unreliable; use conservative defaults.
    pub ignore_capabilities_flags: bool,
    /// Treat a short bulk-in packet as implicit EOM even without the bit set.
    pub accept_short_read_as_eom: bool,
    /// Device ships in an unusable state; `open` issues INITIATE_CLEAR first.
    pub requires_clear_before_first_io: bool,
    /// What to do when INITIATE_ABORT fails.
    pub abort_recovery_policy: AbortRecoveryPolicy,
    /// Where to trust the USB488 status byte from.
    pub read_status_byte_via: ReadStatusByteVia,
    /// Cap on a single BULK TransferSize field, if the device needs one
    /// smaller than `DEFAULT_MAX_TRANSFER_SIZE`.
    pub max_transfer_size: Option<u32>,
    /// Mandatory delay after a write with EOM set, before the next operation.
    pub post_write_settle_us: u64,
    /// Optional behavioral hook overrides.
    pub hooks: Hooks,
}

impl Default for QuirksRecord {
    fn default() -> Self {
        QuirksRecord {
            read_extra_alignment_padding: false,
            ignore_capabilities_flags: false,
            accept_short_read_as_eom: false,
            requires_clear_before_first_io: false,
            abort_recovery_policy: AbortRecoveryPolicy::default(),
            read_status_byte_via: ReadStatusByteVia::default(),
            max_transfer_size: None,
            post_write_settle_us: 0,
            hooks: Hooks::default(),
        }
    }
}

/// The `(vid, pid[, revision])` key a quirks entry is looked up by. A
/// `revision` regex lets one VID/PID pair carry different quirks for
/// different firmware revisions.
#[derive(Clone)]
pub struct QuirksKey {
    pub vendor_id: u16,
    pub product_id: u16,
    pub revision: Option<Regex>,
}

impl fmt::Debug for QuirksKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuirksKey")
            .field("vendor_id", &format_args!("{:#06x}", self.vendor_id))
            .field("product_id", &format_args!("{:#06x}", self.product_id))
            .field("revision", &self.revision.as_ref().map(|r| r.as_str()))
            .finish()
    }
}

impl QuirksKey {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        QuirksKey {
            vendor_id,
            product_id,
            revision: None,
        }
    }

    pub fn with_revision(vendor_id: u16, product_id: u16, revision: Regex) -> Self {
        QuirksKey {
            vendor_id,
            product_id,
            revision: Some(revision),
        }
    }

    fn matches(&self, vid: u16, pid: u16, firmware_revision: Option<&str>) -> bool {
        if self.vendor_id != vid || self.product_id != pid {
            return false;
        }
        match &self.revision {
            None => true,
            Some(re) => firmware_revision.is_some_and(|rev| re.is_match(rev)),
        }
    }
}

/// The process-wide quirks table. Callers populate it via [`register`]
/// before calling `open`; `open` then calls [`lookup`] once and freezes the
/// merged result into the handle.
#[derive(Default)]
pub struct QuirksRegistry {
    entries: Mutex<Vec<(QuirksKey, QuirksRecord)>>,
}

impl QuirksRegistry {
    pub fn new() -> Self {
        QuirksRegistry {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// The crate's built-in table. Empty by default: spec.md §1 explicitly
    /// disclaims "guaranteeing correct behaviour for devices whose quirks
    /// have not been catalogued", and this crate does not invent vendor
    /// entries it cannot verify against real hardware. Callers populate the
    /// table for the instruments they actually support via [`register`].
    pub fn builtin() -> Self {
        QuirksRegistry::new()
    }

    /// Register (or override) a quirks entry. A later registration with an
    /// identical key shadows an earlier one — entries are searched in
    /// reverse-registration order, and the first match, preferring an entry
    /// with a revision matcher over one without, wins.
    pub fn register(&self, key: QuirksKey, record: QuirksRecord) {
        self.entries.lock().unwrap().push((key, record));
    }

    /// Look up the quirks record for a device, merged with defaults. Never
    /// fails: an unmatched device simply gets `QuirksRecord::default()`.
    pub fn lookup(&self, vid: u16, pid: u16, firmware_revision: Option<&str>) -> QuirksRecord {
        let entries = self.entries.lock().unwrap();
        let mut best: Option<&QuirksRecord> = None;
        let mut best_has_revision = false;
        for (key, record) in entries.iter().rev() {
            if !key.matches(vid, pid, firmware_revision) {
                continue;
            }
            let has_revision = key.revision.is_some();
            if best.is_none() || (has_revision && !best_has_revision) {
                best = Some(record);
                best_has_revision = has_revision;
            }
        }
        best.cloned().unwrap_or_default()
    }
}
