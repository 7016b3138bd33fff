//! Fibonacci through the public API, in the three continuation-passing styles
//! the scheduler supports.

use anyhow::Result;
use rstest::rstest;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use taskweave::{Arena, ExecutionContext, Task, TaskGroup, TaskRef, WaitStatus};

type Slot = Arc<AtomicU64>;

fn slot() -> Slot {
    Arc::new(AtomicU64::new(0))
}

/// Sums two result slots into a third once both children are done.
struct Sum {
    x: Slot,
    y: Slot,
    out: Slot,
}

impl Task for Sum {
    fn execute(&mut self, _cx: &mut ExecutionContext<'_>) -> Option<TaskRef> {
        let sum = self.x.load(Ordering::Acquire) + self.y.load(Ordering::Acquire);
        self.out.store(sum, Ordering::Release);
        None
    }
}

/// Continuation plus two children, the second one bypassed.
struct Fib {
    n: u64,
    out: Slot,
}

impl Task for Fib {
    fn execute(&mut self, cx: &mut ExecutionContext<'_>) -> Option<TaskRef> {
        if self.n < 2 {
            self.out.store(self.n, Ordering::Release);
            return None;
        }

        let (x, y) = (slot(), slot());
        let sum = Sum {
            x: Arc::clone(&x),
            y: Arc::clone(&y),
            out: Arc::clone(&self.out),
        };
        let c = cx.allocate_continuation(2, sum).expect("allocate continuation");

        let a = cx
            .create_child(c, Fib { n: self.n - 2, out: x })
            .expect("create child");
        let b = cx
            .create_child(c, Fib { n: self.n - 1, out: y })
            .expect("create child");

        cx.spawn(a).expect("spawn");
        Some(b)
    }
}

/// Continuation plus one child, the running task recycled as the second.
struct FibRecycleChild {
    n: u64,
    out: Slot,
}

impl Task for FibRecycleChild {
    fn execute(&mut self, cx: &mut ExecutionContext<'_>) -> Option<TaskRef> {
        if self.n < 2 {
            self.out.store(self.n, Ordering::Release);
            return None;
        }

        let (x, y) = (slot(), slot());
        let sum = Sum {
            x: Arc::clone(&x),
            y: Arc::clone(&y),
            out: Arc::clone(&self.out),
        };
        let c = cx.allocate_continuation(2, sum).expect("allocate continuation");

        let a = cx
            .create_child(c, FibRecycleChild { n: self.n - 2, out: x })
            .expect("create child");
        cx.spawn(a).expect("spawn");

        self.n -= 1;
        self.out = y;
        cx.recycle_as_child_of(c).expect("recycle as child");
        Some(cx.current())
    }
}

/// The running task becomes the continuation of its own two children.
struct FibRecycleContinuation {
    n: u64,
    out: Slot,
    children: Option<(Slot, Slot)>,
}

impl FibRecycleContinuation {
    fn new(n: u64, out: Slot) -> Self {
        Self {
            n,
            out,
            children: None,
        }
    }
}

impl Task for FibRecycleContinuation {
    fn execute(&mut self, cx: &mut ExecutionContext<'_>) -> Option<TaskRef> {
        if cx.is_resumed() {
            let (x, y) = self.children.take().expect("resumed without children");
            let sum = x.load(Ordering::Acquire) + y.load(Ordering::Acquire);
            self.out.store(sum, Ordering::Release);
            return None;
        }

        if self.n < 2 {
            self.out.store(self.n, Ordering::Release);
            return None;
        }

        let (x, y) = (slot(), slot());
        self.children = Some((Arc::clone(&x), Arc::clone(&y)));

        let me = cx.current();
        cx.recycle_as_continuation().expect("recycle as continuation");

        let a = cx
            .create_child_and_increment(me, FibRecycleContinuation::new(self.n - 1, x))
            .expect("create child");
        let b = cx
            .create_child_and_increment(me, FibRecycleContinuation::new(self.n - 2, y))
            .expect("create child");

        cx.spawn(a).expect("spawn");
        Some(b)
    }
}

#[derive(Debug, Clone, Copy)]
enum Style {
    Spawn,
    RecycleChild,
    RecycleContinuation,
}

fn fib(arena: &Arena, style: Style, n: u64) -> Result<u64> {
    let out = slot();
    let group = TaskGroup::new(arena)?;

    match style {
        Style::Spawn => group.spawn(Fib {
            n,
            out: Arc::clone(&out),
        })?,
        Style::RecycleChild => group.spawn(FibRecycleChild {
            n,
            out: Arc::clone(&out),
        })?,
        Style::RecycleContinuation => {
            group.spawn(FibRecycleContinuation::new(n, Arc::clone(&out)))?
        }
    };

    assert_eq!(group.wait(), WaitStatus::Complete);
    Ok(out.load(Ordering::Acquire))
}

#[rstest]
fn test_fibonacci(
    #[values(Style::Spawn, Style::RecycleChild, Style::RecycleContinuation)] style: Style,
    #[values(1, 2, 8)] workers: usize,
) -> Result<()> {
    let arena = Arena::builder().worker_threads(workers).try_build()?;

    assert_eq!(fib(&arena, style, 0)?, 0);
    assert_eq!(fib(&arena, style, 1)?, 1);
    assert_eq!(fib(&arena, style, 10)?, 55);
    assert_eq!(fib(&arena, style, 20)?, 6765);

    let stats = arena.stats();
    assert!(stats.bypassed > 0);
    assert_eq!(stats.live_heap_tasks, 0);
    Ok(())
}

#[test]
fn test_fibonacci_from_arena_thread() -> Result<()> {
    let arena = Arena::builder().max_concurrency(4).try_build()?;

    let res = arena.execute(|| fib(&arena, Style::Spawn, 15))??;
    assert_eq!(res, 610);
    Ok(())
}
