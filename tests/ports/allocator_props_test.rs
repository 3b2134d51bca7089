//! Property checks: free and allocated intervals always tile the space.

use proptest::prelude::*;

use attguard::ports::IntervalAllocator;

#[derive(Debug, Clone)]
enum Step {
    Allocate(u32),
    Release(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0_u32..300).prop_map(Step::Allocate),
        (0_usize..16).prop_map(Step::Release),
    ]
}

proptest! {
    #[test]
    fn tiling_holds_after_every_step(steps in proptest::collection::vec(step(), 1..80)) {
        let mut alloc = IntervalAllocator::new(1000, 3000);
        let mut held: Vec<u32> = Vec::new();

        for step in steps {
            match step {
                Step::Allocate(count) => {
                    if let Ok(range) = alloc.allocate(count) {
                        prop_assert_eq!(range.width(), count);
                        held.push(range.lo);
                    }
                }
                Step::Release(pick) => {
                    if !held.is_empty() {
                        let lo = held.remove(pick % held.len());
                        prop_assert!(alloc.deallocate(lo).is_ok());
                    }
                }
            }
            prop_assert!(alloc.check_invariants().is_ok(), "{:?}", alloc.check_invariants());
        }

        for lo in held {
            prop_assert!(alloc.deallocate(lo).is_ok());
        }
        prop_assert_eq!(alloc.free_ranges().count(), 1);
    }

    #[test]
    fn allocations_never_overlap(counts in proptest::collection::vec(1_u32..200, 1..40)) {
        let mut alloc = IntervalAllocator::new(0, 2000);
        let mut ranges = Vec::new();
        for count in counts {
            if let Ok(range) = alloc.allocate(count) {
                ranges.push(range);
            }
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i.saturating_add(1)) {
                prop_assert!(!a.overlaps(b), "{} overlaps {}", a, b);
            }
        }
    }
}
