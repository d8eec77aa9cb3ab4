use meshwire::replay::{Admit, ReplayWindow, MAX_SEQNO, WINDOW_BITS};

#[test]
fn test_in_order_stream() {
    let mut window = ReplayWindow::new();
    for seqno in 1..=5 {
        assert_eq!(window.admit(seqno), Admit::Accepted { lost: 0 });
    }
    assert_eq!(window.received_seqno(), 5);
    assert_eq!(window.pending(), 0);
}

#[test]
fn test_reorder_within_window() {
    let mut window = ReplayWindow::new();
    assert_eq!(window.admit(1), Admit::Accepted { lost: 0 });
    assert_eq!(window.admit(2), Admit::Accepted { lost: 0 });
    // 3 is skipped over; the gap is reported once.
    assert_eq!(window.admit(4), Admit::Accepted { lost: 1 });
    assert_eq!(window.admit(5), Admit::Accepted { lost: 0 });
    assert_eq!(window.pending(), 1);

    // The straggler is still pending, so it gets in exactly once.
    assert_eq!(window.admit(3), Admit::Accepted { lost: 0 });
    assert_eq!(window.pending(), 0);
    assert_eq!(window.admit(3), Admit::Reject);
    assert_eq!(window.received_seqno(), 5);
}

#[test]
fn test_replay_rejected() {
    let mut window = ReplayWindow::new();
    for seqno in 1..=5 {
        window.admit(seqno);
    }
    assert_eq!(window.admit(3), Admit::Reject);
    assert_eq!(window.admit(5), Admit::Reject);
    assert_eq!(window.received_seqno(), 5);
}

#[test]
fn test_zero_is_never_valid() {
    let mut window = ReplayWindow::new();
    assert_eq!(window.admit(0), Admit::Reject);
}

#[test]
fn test_jump_at_window_edge_resets_bitmap() {
    let mut window = ReplayWindow::new();
    for seqno in 1..=10 {
        window.admit(seqno);
    }
    // Leave some holes pending, then jump exactly one window ahead.
    assert_eq!(window.admit(13), Admit::Accepted { lost: 2 });
    assert_eq!(window.pending(), 2);

    let jumped = 13 + WINDOW_BITS;
    assert_eq!(window.admit(jumped), Admit::Accepted { lost: WINDOW_BITS - 1 });
    assert_eq!(window.received_seqno(), jumped);
    assert_eq!(window.pending(), 0);

    // The holes from before the jump are gone for good.
    assert_eq!(window.admit(11), Admit::Reject);
    assert_eq!(window.admit(12), Admit::Reject);
}

#[test]
fn test_reject_at_and_below_window_floor() {
    let mut window = ReplayWindow::new();
    window.admit(1);
    assert_eq!(window.admit(300), Admit::Accepted { lost: 298 });

    // 300 - 256 = 44 is exactly one window back.
    assert_eq!(window.admit(300 - WINDOW_BITS), Admit::Reject);
    assert_eq!(window.admit(300 - WINDOW_BITS - 1), Admit::Reject);
    // Just inside the window, but its pending bit was wiped by the jump.
    assert_eq!(window.admit(300 - WINDOW_BITS + 1), Admit::Reject);
}

#[test]
fn test_in_window_gap_marks_pending() {
    let mut window = ReplayWindow::new();
    window.admit(1);
    assert_eq!(window.admit(100), Admit::Accepted { lost: 98 });
    assert_eq!(window.pending(), 98);

    for seqno in 2..100 {
        assert_eq!(window.admit(seqno), Admit::Accepted { lost: 0 }, "seqno {seqno}");
    }
    assert_eq!(window.pending(), 0);
    for seqno in 2..100 {
        assert_eq!(window.admit(seqno), Admit::Reject, "seqno {seqno}");
    }
}

#[test]
fn test_rekey_threshold() {
    let mut window = ReplayWindow::new();
    window.admit(5);
    assert!(!window.needs_rekey());

    window.admit(MAX_SEQNO + 2);
    assert!(window.needs_rekey());
}

#[test]
fn test_reset_clears_everything() {
    let mut window = ReplayWindow::new();
    window.admit(1);
    window.admit(50);
    assert!(window.pending() > 0);

    window.reset();
    assert_eq!(window.received_seqno(), 0);
    assert_eq!(window.pending(), 0);
    assert_eq!(window.admit(1), Admit::Accepted { lost: 0 });
}
