//! Process-wide controls. Lives in its own test binary: a parallelism limit
//! applies to every arena of the process.

use anyhow::Result;
use parking_lot::{Mutex, MutexGuard, const_mutex};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use taskweave::runtime::global_control::Parameter;
use taskweave::{Arena, GlobalControl, TaskGroup, WaitStatus, this_arena};

// Controls are process-wide, tests touching them must not overlap.
static SERIAL: Mutex<()> = const_mutex(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

/// Runs `n` short tasks in a group and returns the slots they ran on.
fn slots_used(arena: &Arena, n: usize) -> Result<HashSet<Option<usize>>> {
    let slots = Arc::new(Mutex::new(HashSet::new()));
    let group = TaskGroup::new(arena)?;

    for _ in 0..n {
        let slots = Arc::clone(&slots);
        group.run(move || {
            thread::sleep(Duration::from_micros(50));
            slots.lock().insert(this_arena::current_thread_index());
        })?;
    }

    assert_eq!(group.wait(), WaitStatus::Complete);
    let slots = slots.lock().clone();
    Ok(slots)
}

#[test]
fn test_limit_of_one_runs_on_waiting_thread() -> Result<()> {
    let _serial = serial();
    let workers = 4;

    let control = GlobalControl::new(Parameter::MaxAllowedParallelism, 1);
    assert_eq!(GlobalControl::active_value(Parameter::MaxAllowedParallelism), Some(1));

    let arena = Arena::builder().worker_threads(workers).try_build()?;
    let slots = slots_used(&arena, 200)?;

    // Only the reserved slot, right after the dedicated ones.
    assert_eq!(slots, HashSet::from([Some(workers)]));

    drop(control);
    assert_eq!(GlobalControl::active_value(Parameter::MaxAllowedParallelism), None);
    Ok(())
}

#[test]
fn test_limit_caps_dedicated_slots() -> Result<()> {
    let _serial = serial();
    let workers = 4;

    let _control = GlobalControl::new(Parameter::MaxAllowedParallelism, 2);
    let arena = Arena::builder().worker_threads(workers).try_build()?;
    let slots = slots_used(&arena, 500)?;

    // Slot 0 and the waiting thread's slot may run tasks.
    for slot in &slots {
        assert!(
            matches!(slot, Some(0)) || *slot == Some(workers),
            "task ran on capped slot {slot:?}"
        );
    }
    Ok(())
}

#[test]
fn test_nested_controls_restrictive_value_wins() {
    let _serial = serial();
    let parallelism = || GlobalControl::active_value(Parameter::MaxAllowedParallelism);
    let stack_size = || GlobalControl::active_value(Parameter::ThreadStackSize);

    let outer = GlobalControl::new(Parameter::MaxAllowedParallelism, 4);
    assert_eq!(parallelism(), Some(4));
    {
        let inner = GlobalControl::new(Parameter::MaxAllowedParallelism, 2);
        assert_eq!(inner.value(), 2);
        assert_eq!(parallelism(), Some(2));

        let looser = GlobalControl::new(Parameter::MaxAllowedParallelism, 8);
        assert_eq!(parallelism(), Some(2));
        drop(looser);
    }
    assert_eq!(parallelism(), Some(4));
    drop(outer);
    assert_eq!(parallelism(), None);

    let small = GlobalControl::new(Parameter::ThreadStackSize, 1 << 20);
    let large = GlobalControl::new(Parameter::ThreadStackSize, 4 << 20);
    assert_eq!(stack_size(), Some(4 << 20));
    drop(large);
    assert_eq!(stack_size(), Some(1 << 20));
    drop(small);
    assert_eq!(stack_size(), None);
}

#[test]
fn test_lifting_limit_resumes_workers() -> Result<()> {
    let _serial = serial();
    let workers = 2;

    let control = GlobalControl::new(Parameter::MaxAllowedParallelism, 1);
    let arena = Arena::builder().worker_threads(workers).try_build()?;
    assert_eq!(slots_used(&arena, 50)?, HashSet::from([Some(workers)]));
    drop(control);

    // Capped workers re-check the limit on their own, give them a few rounds.
    let mut seen = HashSet::new();
    for _ in 0..50 {
        seen.extend(slots_used(&arena, 200)?);
        if seen.iter().any(|slot| matches!(slot, Some(s) if *s < workers)) {
            return Ok(());
        }
    }

    panic!("no dedicated worker ran a task after the limit was lifted: {seen:?}");
}

#[test]
#[should_panic(expected = "greater than 0")]
fn test_zero_value_rejected() {
    let _serial = serial();
    let _control = GlobalControl::new(Parameter::MaxAllowedParallelism, 0);
}
