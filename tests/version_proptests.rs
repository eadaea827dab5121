//! Property tests for the page version word.

use proptest::prelude::*;

use ironwood::version::PageVersion;

/// A single lock-modify-unlock step.
#[derive(Debug, Clone, Copy)]
enum Step {
    Plain,
    Insert,
    Split,
    SetKeyCount(usize),
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Plain),
        Just(Step::Insert),
        Just(Step::Split),
        (0usize..=127).prop_map(Step::SetKeyCount),
    ]
}

proptest! {
    /// The insert and split counters advance exactly with the declared
    /// intents, and the lock bit never survives an unlock.
    #[test]
    fn counters_track_declared_intents(steps in proptest::collection::vec(step_strategy(), 1..40)) {
        let version = PageVersion::new();
        let mut expected_inserts: u64 = 0;
        let mut expected_splits: u32 = 0;
        let mut expected_count: usize = 0;
        for step in steps {
            let before = version.stable();
            {
                let mut guard = version.lock();
                match step {
                    Step::Plain => {}
                    Step::Insert => {
                        guard.mark_inserting();
                        expected_inserts += 1;
                    }
                    Step::Split => {
                        guard.mark_splitting();
                        expected_splits += 1;
                    }
                    Step::SetKeyCount(count) => {
                        guard.set_key_count(count);
                        guard.mark_inserting();
                        expected_inserts += 1;
                        expected_count = count;
                    }
                }
            }
            let after = version.stable();
            prop_assert!(!after.is_locked());
            prop_assert!(!after.is_inserting());
            prop_assert!(!after.is_splitting());
            prop_assert_eq!(after.key_count(), expected_count);
            prop_assert_eq!(after.insert_counter(), expected_inserts % 256);
            prop_assert_eq!(after.split_counter(), expected_splits);
            // has_changed fires exactly when an intent was declared.
            match step {
                Step::Plain => prop_assert!(!version.has_changed(before)),
                _ => prop_assert!(version.has_changed(before)),
            }
            match step {
                Step::Split => prop_assert!(version.has_split(before)),
                _ => prop_assert!(!version.has_split(before)),
            }
        }
    }

    /// Initialization flags are faithfully reported.
    #[test]
    fn initialize_flags(border in any::<bool>(), root in any::<bool>(), supremum in any::<bool>()) {
        let version = PageVersion::new();
        version.initialize(border, root, supremum);
        let snap = version.observe();
        prop_assert_eq!(snap.is_border(), border);
        prop_assert_eq!(snap.is_root(), root);
        prop_assert_eq!(snap.is_high_fence_supremum(), supremum);
        prop_assert_eq!(snap.key_count(), 0);
        prop_assert_eq!(snap.split_counter(), 0);
    }
}
