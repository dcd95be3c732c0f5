//! `Locker::is_active` is process-wide, so this check runs in its own binary.

use openworkers_isolate_host::{Isolate, Locker};

#[test]
fn test_reset_active() {
    Locker::reset_active();
    assert!(!Locker::is_active());

    let isolate = Isolate::new(true);
    {
        let mut locker = Locker::new(&isolate);
        assert!(!Locker::is_active());

        locker.enter();
        assert!(Locker::is_active());
    }

    // Stays active after the locker is gone
    assert!(Locker::is_active());

    Locker::reset_active();
    assert!(!Locker::is_active());
}
