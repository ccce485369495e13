//! Software model of the architecture surface.
//!
//! Backs every intrinsic on non-bare-metal builds. The model enforces the
//! same ordering contracts the hardware does (load-before-field-access,
//! clear-before-cross-PP-load is the *caller's* job and is checked one layer
//! up) and lets tests script the exits a guest "produces".

use crate::hve::{exit_reason, ExitInfo, HveError};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use spin::Mutex;

/// One recorded VM entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryEvent {
    pub structure: u64,
    pub launched: bool,
}

/// The whole software machine state.
pub struct SoftState {
    pub root: u64,
    pub tp: u64,
    pub tlb_flushes: u64,
    pub msrs: BTreeMap<u32, u64>,
    /// Simulate a processor without HVE support.
    pub hve_disabled: bool,
    /// The currently loaded control structure.
    pub loaded: Option<u64>,
    /// Per-structure "hardware" field storage.
    pub fields: BTreeMap<(u64, u16), u64>,
    /// Structures that have been cleared at least once.
    pub cleared: Vec<u64>,
    /// Exits the next entries will report, oldest first.
    pub pending_exits: VecDeque<ExitInfo>,
    /// Every entry ever performed.
    pub entries: Vec<EntryEvent>,
}

impl SoftState {
    const fn new() -> Self {
        SoftState {
            root: 0,
            tp: 0,
            tlb_flushes: 0,
            msrs: BTreeMap::new(),
            hve_disabled: false,
            loaded: None,
            fields: BTreeMap::new(),
            cleared: Vec::new(),
            pending_exits: VecDeque::new(),
            entries: Vec::new(),
        }
    }
}

static STATE: Mutex<SoftState> = Mutex::new(SoftState::new());

/// The shared model state.
pub fn state() -> &'static Mutex<SoftState> {
    &STATE
}

/// Serializes tests that script the shared model.
static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Take the model for one test. Tests that touch the model must hold this.
pub fn test_guard() -> spin::MutexGuard<'static, ()> {
    TEST_LOCK.lock()
}

/// Reset everything (test hook).
pub fn reset() {
    *STATE.lock() = SoftState::new();
}

/// Script the next exit (test hook).
pub fn push_exit(exit: ExitInfo) {
    STATE.lock().pending_exits.push_back(exit);
}

/// Every entry performed so far (test hook).
pub fn entries() -> Vec<EntryEvent> {
    STATE.lock().entries.clone()
}

pub(crate) fn clear(phys: u64) -> Result<(), HveError> {
    let mut s = STATE.lock();
    if s.loaded == Some(phys) {
        s.loaded = None;
    }
    if !s.cleared.contains(&phys) {
        s.cleared.push(phys);
    }
    Ok(())
}

pub(crate) fn load(phys: u64) -> Result<(), HveError> {
    let mut s = STATE.lock();
    if phys == 0 || phys % 4096 != 0 {
        return Err(HveError::BadStructure);
    }
    s.loaded = Some(phys);
    Ok(())
}

pub(crate) fn write_field(enc: u16, val: u64) -> Result<(), HveError> {
    let mut s = STATE.lock();
    let loaded = s.loaded.ok_or(HveError::NothingLoaded)?;
    s.fields.insert((loaded, enc), val);
    Ok(())
}

pub(crate) fn read_field(enc: u16) -> Result<u64, HveError> {
    let s = STATE.lock();
    let loaded = s.loaded.ok_or(HveError::NothingLoaded)?;
    Ok(s.fields.get(&(loaded, enc)).copied().unwrap_or(0))
}

pub(crate) fn vm_entry(launched: bool, _gprs: &mut [u64; 16]) -> Result<ExitInfo, HveError> {
    let mut s = STATE.lock();
    let structure = s.loaded.ok_or(HveError::NothingLoaded)?;
    s.entries.push(EntryEvent {
        structure,
        launched,
    });
    Ok(s.pending_exits.pop_front().unwrap_or(ExitInfo {
        reason: exit_reason::HLT,
        qualification: 0,
        interruption_info: 0,
        instruction_length: 1,
    }))
}
