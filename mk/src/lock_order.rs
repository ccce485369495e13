//! Lock ordering.
//!
//! Every shared mutable structure in the microkernel sits behind exactly
//! one spin lock, and no path holds two pool locks at once unless it
//! acquires them in the order below (release in reverse):
//!
//! ```text
//! Level 1  extension pool      (ExtPool::slots)
//! Level 2  VM pool             (VmPool::slots)
//! Level 3  VP pool             (VpPool::slots)
//! Level 4  VPS pool            (VpsPool::slots)
//! Level 5  page pool / huge pool (page before huge when both are needed)
//! Level 6  system / extension RPT
//! ```
//!
//! # Rules
//!
//! 1. **Syscall handlers sequence, pools do not call each other.** A VM
//!    destroy checks the VP pool and notifies the extension pool from the
//!    handler, never from inside `VmPool`. This is what keeps most paths
//!    at one lock.
//! 2. **The extension pool lock is never held across extension code.**
//!    `ExtPool::call` copies the callback target out, drops the lock, and
//!    only then transitions; extension callbacks issue syscalls, and
//!    syscalls take every other lock.
//! 3. **The VPS pool lock is never held across a guest entry.**
//!    `VpsPool::run` stages under the lock, enters with no lock held, and
//!    re-acquires to pull the exit state back.
//! 4. **TLS blocks are not locked.** Each PP mutates only its own block;
//!    cross-PP reads are debug-grade and tolerate tearing.
//! 5. **The VMExit log is single-producer per PP** and takes no lock on
//!    the write path.
//!
//! # Known multi-lock paths
//!
//! | Path | Locks, in order |
//! |------|-----------------|
//! | `Ext::load` | ext pool → page pool → system RPT |
//! | `Ext::alloc_page` / `alloc_heap` | ext pool → page pool (ext RPT is slot-private) |
//! | `Ext::alloc_huge` | ext pool → huge pool, then ext pool → page pool |
//! | `VpsPool::allocate` | VPS pool → huge pool |
//! | `mk_main` global init | page pool → system RPT |
//! | `ctl` teardown | page pool → huge pool → system RPT |
