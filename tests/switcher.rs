//! Switcher coordination tests against an in-memory process spec.
//!
//! The fake spec stands in for llama-server so the single-slot, reuse, swap
//! and serialization behavior can be exercised without subprocesses.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use llamactl::error::Result;
use llamactl::switch::{ProcessContext, ProcessSpec, ProcessSwitcher};

#[derive(Clone, Default)]
struct World {
    live: Arc<AtomicUsize>,
    started: Arc<AtomicUsize>,
    overlap: Arc<AtomicBool>,
    log: Arc<Mutex<Vec<String>>>,
}

impl World {
    fn record(&self, event: &str) {
        self.log.lock().unwrap().push(event.to_string());
    }

    fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct FakeSpec {
    world: World,
    context_size: u32,
}

struct FakeContext {
    world: World,
    /// Serial number of the underlying "process"; reuse keeps it stable.
    instance: usize,
}

#[async_trait]
impl ProcessSpec for FakeSpec {
    type Context = FakeContext;

    fn accepts(&self, pending: &Self) -> bool {
        self.context_size >= pending.context_size
    }

    async fn start(&self) -> Result<FakeContext> {
        if self.world.live.fetch_add(1, Ordering::SeqCst) != 0 {
            self.world.overlap.store(true, Ordering::SeqCst);
        }
        let instance = self.world.started.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeContext {
            world: self.world.clone(),
            instance,
        })
    }
}

#[async_trait]
impl ProcessContext for FakeContext {
    async fn close(&mut self, _force: bool) -> Result<()> {
        self.world.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn spec(world: &World, context_size: u32) -> FakeSpec {
    FakeSpec {
        world: world.clone(),
        context_size,
    }
}

#[tokio::test]
async fn identical_specs_reuse_the_process() {
    let world = World::default();
    let switcher = ProcessSwitcher::new();

    let first = switcher
        .with_context(spec(&world, 512), |ctx: &FakeContext| {
            let instance = ctx.instance;
            Box::pin(async move { instance })
        })
        .await
        .unwrap();
    let second = switcher
        .with_context(spec(&world, 512), |ctx: &FakeContext| {
            let instance = ctx.instance;
            Box::pin(async move { instance })
        })
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(world.started.load(Ordering::SeqCst), 1);
    assert!(switcher.is_active().await);
}

#[tokio::test]
async fn growing_context_swaps_the_process() {
    let world = World::default();
    let switcher = ProcessSwitcher::new();

    let small = switcher
        .with_context(spec(&world, 512), |ctx: &FakeContext| {
            let instance = ctx.instance;
            Box::pin(async move { instance })
        })
        .await
        .unwrap();
    // 512 does not accept 1024, so a fresh process must be started.
    let large = switcher
        .with_context(spec(&world, 1024), |ctx: &FakeContext| {
            let instance = ctx.instance;
            Box::pin(async move { instance })
        })
        .await
        .unwrap();
    // ...which in turn serves later smaller requests.
    let shrunk = switcher
        .with_context(spec(&world, 512), |ctx: &FakeContext| {
            let instance = ctx.instance;
            Box::pin(async move { instance })
        })
        .await
        .unwrap();

    assert_ne!(small, large);
    assert_eq!(large, shrunk);
    assert_eq!(world.started.load(Ordering::SeqCst), 2);
    assert!(!world.overlap.load(Ordering::SeqCst), "two processes were live at once");
    assert_eq!(world.live.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn at_most_one_process_is_ever_live() {
    let world = World::default();
    let switcher = Arc::new(ProcessSwitcher::new());

    let mut handles = Vec::new();
    for i in 0..8u32 {
        let switcher = switcher.clone();
        let world = world.clone();
        handles.push(tokio::spawn(async move {
            // Alternate between incompatible demands to force swaps.
            let ctx_size = if i % 2 == 0 { 256 } else { 2048 };
            switcher
                .with_context(spec(&world, ctx_size), |_: &FakeContext| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    })
                })
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(!world.overlap.load(Ordering::SeqCst));
    assert_eq!(world.live.load(Ordering::SeqCst), 1);
    switcher.stop().await.unwrap();
    assert_eq!(world.live.load(Ordering::SeqCst), 0);
    assert!(!switcher.is_active().await);
}

#[tokio::test]
async fn bodies_never_interleave() {
    let world = World::default();
    let switcher = Arc::new(ProcessSwitcher::new());

    let slow = {
        let switcher = switcher.clone();
        let world = world.clone();
        tokio::spawn(async move {
            switcher
                .with_context(spec(&world, 512), |_: &FakeContext| {
                    let world = world.clone();
                    Box::pin(async move {
                        world.record("slow-start");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        world.record("slow-end");
                    })
                })
                .await
                .unwrap();
        })
    };
    // Give the slow caller a head start into the lock.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let fast = {
        let switcher = switcher.clone();
        let world = world.clone();
        tokio::spawn(async move {
            switcher
                .with_context(spec(&world, 512), |_: &FakeContext| {
                    let world = world.clone();
                    Box::pin(async move {
                        world.record("fast-start");
                        world.record("fast-end");
                    })
                })
                .await
                .unwrap();
        })
    };
    slow.await.unwrap();
    fast.await.unwrap();

    assert_eq!(
        world.events(),
        vec!["slow-start", "slow-end", "fast-start", "fast-end"]
    );
}

#[tokio::test]
async fn stop_without_a_process_is_a_noop() {
    let switcher: ProcessSwitcher<FakeSpec> = ProcessSwitcher::new();
    switcher.stop().await.unwrap();
    switcher.stop().await.unwrap();
    assert!(!switcher.is_active().await);
}
