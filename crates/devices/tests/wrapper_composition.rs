#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Every wrapper stack must deliver exactly one commit or rollback to the
//! transport per resolved read.

use std::{sync::Arc, time::Duration};

use {
    flowline_devices::{
        InputDeviceManager, Message, MessageBundle, OutputDeviceManager,
        transports::InMemoryDeviceManager,
        wrappers::{
            CollectionInputDeviceManager, CollectionOrder, FailoverOutputDeviceManager,
            RateLimitedInputDeviceManager, RateLimiter, ShortCircuitInputDeviceManager,
            ShortCircuitPolicy, TransformerInputDeviceManager, TransformerOutputDeviceManager,
            ZlibTransformer,
        },
    },
    rstest::rstest,
};

fn stack(memory: &Arc<InMemoryDeviceManager>, depth: usize) -> Arc<dyn InputDeviceManager> {
    let zlib = Arc::new(ZlibTransformer::default());
    let mut mgr: Arc<dyn InputDeviceManager> = memory.clone();
    for level in 0..depth {
        mgr = match level % 4 {
            0 => Arc::new(TransformerInputDeviceManager::new(mgr, zlib.clone())),
            1 => Arc::new(ShortCircuitInputDeviceManager::new(
                mgr,
                ShortCircuitPolicy::default(),
            )),
            2 => Arc::new(RateLimitedInputDeviceManager::new(
                mgr,
                Arc::new(RateLimiter::new(1000, Duration::from_secs(1)).unwrap()),
            )),
            _ => Arc::new(CollectionInputDeviceManager::new(
                vec![mgr],
                CollectionOrder::Sequential,
            )),
        };
    }
    mgr
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(4)]
#[case(7)]
#[tokio::test]
async fn one_completion_reaches_the_transport(#[case] depth: usize) {
    let memory = Arc::new(InMemoryDeviceManager::new());
    memory.push("in", Message::new("commit-me"));
    memory.push("in", Message::new("roll-me-back"));

    let dev = stack(&memory, depth).create_input_device("in").await.unwrap();

    let first = dev
        .read_message(Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.bundle().message.bytes(), b"commit-me");
    first.commit().await.unwrap();

    let second = dev
        .read_message(Duration::from_millis(20))
        .await
        .unwrap()
        .unwrap();
    second.rollback().await.unwrap();

    let stats = memory.stats("in");
    assert_eq!(stats.commits, 1);
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(memory.peek("in").unwrap().bytes(), b"roll-me-back");
}

#[tokio::test]
async fn compressed_failover_round_trip() {
    let primary = Arc::new(InMemoryDeviceManager::new());
    let backup = Arc::new(InMemoryDeviceManager::new());
    let zlib = Arc::new(ZlibTransformer::new(9).unwrap());

    let out_mgr = TransformerOutputDeviceManager::new(
        Arc::new(FailoverOutputDeviceManager::new(primary.clone(), backup.clone())),
        zlib.clone(),
    );
    let out = out_mgr.create_output_device("q").await.unwrap();
    primary.set_available(false);
    out.send_message(&MessageBundle::new(Message::new("x".repeat(500))))
        .await
        .unwrap();
    assert_eq!(backup.len("q"), 1);

    let input = TransformerInputDeviceManager::new(backup.clone(), zlib)
        .create_input_device("q")
        .await
        .unwrap();
    let r = input.read_message(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(r.bundle().message.len(), 500);
    r.commit().await.unwrap();
}
