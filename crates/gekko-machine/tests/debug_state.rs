//! Session-level persistence: debug registries written to disk must restore
//! into an equivalent session.

use gekko_debug::{MemCheck, MemCheckFlags};
use gekko_machine::Session;

#[test]
fn debug_state_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();

    let session = Session::default();
    session.add_breakpoint(0x8000_1000, false);
    session.add_breakpoint(0x8000_2000, true);
    session.add_memcheck(MemCheck {
        start: 0x8000_4000,
        end: 0x8000_40FF,
        flags: MemCheckFlags::READ | MemCheckFlags::WRITE | MemCheckFlags::BREAK,
    });
    session.save_debug_state(dir.path(), "mygame").unwrap();

    let restored = Session::default();
    restored.load_debug_state(dir.path(), "mygame").unwrap();

    assert_eq!(restored.breakpoint_strings(), session.breakpoint_strings());
    assert_eq!(restored.memcheck_strings(), session.memcheck_strings());
    assert!(restored.is_breakpoint(0x8000_1000));
    assert!(restored.is_breakpoint(0x8000_2000));

    // A fresh session with no files on disk loads as empty.
    let empty = Session::default();
    empty.load_debug_state(dir.path(), "othergame").unwrap();
    assert!(empty.breakpoint_strings().is_empty());
    assert!(empty.memcheck_strings().is_empty());
}

#[test]
fn load_replaces_existing_state() {
    let dir = tempfile::tempdir().unwrap();

    let saved = Session::default();
    saved.add_breakpoint(0x8000_5000, false);
    saved.save_debug_state(dir.path(), "slot").unwrap();

    let session = Session::default();
    session.add_breakpoint(0x8000_9000, false);
    session.load_debug_state(dir.path(), "slot").unwrap();

    assert!(session.is_breakpoint(0x8000_5000));
    assert!(!session.is_breakpoint(0x8000_9000));
}
