#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    flowline_common::ServiceState,
    flowline_devices::{
        DeviceManager, Error as DeviceError, INPUT_DEVICE_NAME_HEADER, Message,
        transports::InMemoryDeviceManager,
    },
    flowline_pipeline::{
        Error, FixedRouterPipelineHandler, FnPipelineHandler, HandlerInput, LoopHealthMonitor,
        PipelineHandler, PipelineResult, PipelineService, PipelineServiceConfig,
    },
    rstest::rstest,
};

fn config(inputs: &[&str]) -> PipelineServiceConfig {
    PipelineServiceConfig {
        name: "test".into(),
        input_devices: inputs.iter().map(|s| s.to_string()).collect(),
        poll_timeout: Duration::from_millis(20),
        loop_failure_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

fn devices(memory: &InMemoryDeviceManager) -> DeviceManager {
    DeviceManager::new()
        .with_input_manager(Arc::new(memory.clone()))
        .with_output_manager(Arc::new(memory.clone()))
}

fn service(
    memory: &InMemoryDeviceManager,
    inputs: &[&str],
    handler: impl PipelineHandler + 'static,
) -> Arc<PipelineService> {
    Arc::new(PipelineService::new(
        config(inputs),
        Arc::new(handler),
        devices(memory),
    ))
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn forward_to(output: &'static str) -> FnPipelineHandler {
    FnPipelineHandler::new(move |input: HandlerInput| async move {
        Ok(Some(PipelineResult::single(output, input.bundle.forwarded())))
    })
}

#[tokio::test]
async fn fixed_router_forwards_then_commits() {
    let memory = InMemoryDeviceManager::new();
    memory.push("in", Message::new(&b"x"[..]));
    let svc = service(&memory, &["in"], FixedRouterPipelineHandler::new("OUT"));

    let task = tokio::spawn({
        let svc = Arc::clone(&svc);
        async move { svc.run().await }
    });
    eventually(|| memory.stats("in").commits == 1).await;
    svc.stop();
    task.await.unwrap().unwrap();

    let out = memory.drain("OUT");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].bytes(), b"x");
    assert!(out[0].headers().is_empty());
    assert!(memory.is_empty("in"));
    assert_eq!(memory.stats("in").rollbacks, 0);
    assert_eq!(svc.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn handler_failure_rolls_back_and_loop_continues() {
    let memory = InMemoryDeviceManager::new();
    memory.push("in", Message::new("m"));
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = FnPipelineHandler::new({
        let calls = Arc::clone(&calls);
        move |input: HandlerInput| {
            let first = calls.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    anyhow::bail!("transient handler failure");
                }
                Ok(Some(PipelineResult::single("out", input.bundle.forwarded())))
            }
        }
    });
    let svc = service(&memory, &["in"], handler);
    let failures = Arc::new(AtomicUsize::new(0));
    svc.loop_events().subscribe({
        let failures = Arc::clone(&failures);
        move |m| {
            failures.fetch_add(m.handler_failures, Ordering::SeqCst);
        }
    });

    let task = tokio::spawn({
        let svc = Arc::clone(&svc);
        async move { svc.run().await }
    });
    eventually(|| memory.stats("in").commits == 1).await;
    svc.stop();
    task.await.unwrap().unwrap();

    let stats = memory.stats("in");
    assert_eq!(stats.rollbacks, 1);
    assert_eq!(stats.read, 2);
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(memory.drain("out").len(), 1);
}

#[tokio::test]
async fn handler_panic_is_a_handler_failure() {
    let memory = InMemoryDeviceManager::new();
    memory.push("in", Message::new("boom"));
    memory.push("in", Message::new("fine"));
    let panicked = Arc::new(AtomicBool::new(false));
    let handler = FnPipelineHandler::new({
        let panicked = Arc::clone(&panicked);
        move |input: HandlerInput| {
            let explode =
                input.bundle.message.bytes() == b"boom" && !panicked.swap(true, Ordering::SeqCst);
            async move {
                assert!(!explode, "handler exploded");
                Ok(Some(PipelineResult::single("out", input.bundle.forwarded())))
            }
        }
    });
    let svc = service(&memory, &["in"], handler);

    let task = tokio::spawn({
        let svc = Arc::clone(&svc);
        async move { svc.run().await }
    });
    eventually(|| memory.stats("in").commits == 2).await;
    svc.stop();
    task.await.unwrap().unwrap();

    assert_eq!(memory.stats("in").rollbacks, 1);
    let out: Vec<Vec<u8>> = memory.drain("out").iter().map(|m| m.bytes().to_vec()).collect();
    assert_eq!(out, vec![b"boom".to_vec(), b"fine".to_vec()]);
}

#[tokio::test]
async fn transport_loss_fails_the_service() {
    let memory = InMemoryDeviceManager::new();
    let svc = service(&memory, &["in"], forward_to("out"));
    let mut handle = svc.handle();

    let task = tokio::spawn({
        let svc = Arc::clone(&svc);
        async move { svc.run().await }
    });
    handle.wait_for(ServiceState::Running).await;
    memory.set_available(false);

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Device(DeviceError::Transport { .. })), "{err}");
    assert_eq!(svc.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn send_failure_rolls_back_the_read() {
    let memory = InMemoryDeviceManager::new();
    memory.push("in", Message::new("m"));
    // No output manager: every send fails to construct its device.
    let devices = DeviceManager::new().with_input_manager(Arc::new(memory.clone()));
    let svc = PipelineService::new(config(&["in"]), Arc::new(forward_to("out")), devices);

    let err = svc.run().await.unwrap_err();
    assert!(matches!(err, Error::Device(DeviceError::Construction { .. })), "{err}");
    assert_eq!(memory.len("in"), 1);
    assert_eq!(memory.stats("in").rollbacks, 1);
    assert_eq!(memory.stats("in").commits, 0);
}

#[tokio::test]
async fn missing_input_manager_fails_before_reading() {
    let memory = InMemoryDeviceManager::new();
    memory.push("in", Message::new("m"));
    let devices = DeviceManager::new().with_output_manager(Arc::new(memory.clone()));
    let svc = PipelineService::new(config(&["in"]), Arc::new(forward_to("out")), devices);
    let states = Arc::new(Mutex::new(Vec::new()));
    svc.state_events().subscribe({
        let states = Arc::clone(&states);
        move |s| states.lock().unwrap().push(*s)
    });

    let err = svc.run().await.unwrap_err();
    assert!(matches!(err, Error::Device(DeviceError::Construction { .. })));
    assert_eq!(memory.stats("in").read, 0);
    assert_eq!(*states.lock().unwrap(), vec![ServiceState::Stopped]);
}

#[tokio::test]
async fn declared_output_without_output_manager_fails_before_reading() {
    let memory = InMemoryDeviceManager::new();
    memory.push("in", Message::new("m"));
    let devices = DeviceManager::new().with_input_manager(Arc::new(memory.clone()));
    let svc = PipelineService::new(
        config(&["in"]),
        Arc::new(FixedRouterPipelineHandler::new("out")),
        devices,
    );
    let states = Arc::new(Mutex::new(Vec::new()));
    svc.state_events().subscribe({
        let states = Arc::clone(&states);
        move |s| states.lock().unwrap().push(*s)
    });

    let err = svc.run().await.unwrap_err();
    assert!(matches!(err, Error::Device(DeviceError::Construction { .. })), "{err}");
    assert_eq!(memory.stats("in").read, 0);
    assert_eq!(memory.len("in"), 1);
    assert_eq!(*states.lock().unwrap(), vec![ServiceState::Stopped]);
}

#[tokio::test]
async fn closure_handler_outputs_are_created_at_startup() {
    let memory = InMemoryDeviceManager::new();
    let devices = DeviceManager::new().with_input_manager(Arc::new(memory.clone()));
    let handler = forward_to("out").with_output_devices(["out"]);
    let svc = PipelineService::new(config(&["in"]), Arc::new(handler), devices);

    let err = svc.run().await.unwrap_err();
    assert!(matches!(err, Error::Device(DeviceError::Construction { ref device, .. }) if device == "out"), "{err}");
    assert_eq!(memory.stats("in").read, 0);
}

#[tokio::test]
async fn no_input_devices_is_a_config_error() {
    let memory = InMemoryDeviceManager::new();
    let svc = service(&memory, &[], FixedRouterPipelineHandler::new("out"));
    let err = svc.run().await.unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}

#[tokio::test]
async fn handler_declared_devices_are_used() {
    let memory = InMemoryDeviceManager::new();
    memory.push("declared", Message::new("m"));
    let handler = forward_to("out").with_input_devices(["declared"]);
    let svc = service(&memory, &[], handler);

    let task = tokio::spawn({
        let svc = Arc::clone(&svc);
        async move { svc.run().await }
    });
    eventually(|| memory.stats("declared").commits == 1).await;
    svc.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn lifecycle_transitions_and_idempotent_stop() {
    let memory = InMemoryDeviceManager::new();
    let svc = service(&memory, &["in"], forward_to("out"));
    let states = Arc::new(Mutex::new(Vec::new()));
    svc.state_events().subscribe({
        let states = Arc::clone(&states);
        move |s| states.lock().unwrap().push(*s)
    });
    assert_eq!(svc.state(), ServiceState::Created);

    let mut handle = svc.handle();
    let task = tokio::spawn({
        let svc = Arc::clone(&svc);
        async move { svc.run().await }
    });
    handle.wait_for(ServiceState::Running).await;
    handle.stop();
    svc.stop();
    handle.stop();
    task.await.unwrap().unwrap();

    assert_eq!(
        *states.lock().unwrap(),
        vec![ServiceState::Running, ServiceState::Stopping, ServiceState::Stopped]
    );

    let again = svc.run().await.unwrap_err();
    assert!(matches!(again, Error::AlreadyStarted { .. }));
}

#[tokio::test]
async fn devices_are_polled_in_rotation() {
    let memory = InMemoryDeviceManager::new();
    for i in 0..3 {
        memory.push("a", Message::new(format!("a{i}").into_bytes()));
        memory.push("b", Message::new(format!("b{i}").into_bytes()));
    }
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = FnPipelineHandler::new({
        let seen = Arc::clone(&seen);
        move |input: HandlerInput| {
            let from_header = input
                .bundle
                .device_headers
                .get(INPUT_DEVICE_NAME_HEADER)
                .and_then(|v| v.as_str())
                .map(str::to_string);
            assert_eq!(from_header.as_deref(), Some(input.device.as_str()));
            seen.lock().unwrap().push(input.device);
            async { Ok::<_, anyhow::Error>(None) }
        }
    });
    let svc = service(&memory, &["a", "b"], handler);

    let task = tokio::spawn({
        let svc = Arc::clone(&svc);
        async move { svc.run().await }
    });
    eventually(|| seen.lock().unwrap().len() == 6).await;
    svc.stop();
    task.await.unwrap().unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec!["a", "b", "b", "a", "a", "b"]);
    assert_eq!(memory.stats("a").commits, 3);
    assert_eq!(memory.stats("b").commits, 3);
}

#[rstest]
#[case(1)]
#[case(3)]
#[case(10)]
#[tokio::test]
async fn batched_reads_commit_every_message(#[case] batch: usize) {
    let memory = InMemoryDeviceManager::new();
    for i in 0u8..5 {
        memory.push("in", Message::new(vec![i]));
    }
    let svc = Arc::new(PipelineService::new(
        PipelineServiceConfig {
            max_batch_read_count: batch,
            ..config(&["in"])
        },
        Arc::new(forward_to("out")),
        devices(&memory),
    ));

    let task = tokio::spawn({
        let svc = Arc::clone(&svc);
        async move { svc.run().await }
    });
    eventually(|| memory.stats("in").commits == 5).await;
    svc.stop();
    task.await.unwrap().unwrap();

    let out: Vec<u8> = memory.drain("out").iter().map(|m| m.bytes()[0]).collect();
    assert_eq!(out, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn empty_result_list_sends_nothing() {
    let memory = InMemoryDeviceManager::new();
    memory.push("in", Message::new("m"));
    let handler = FnPipelineHandler::new(|_input: HandlerInput| async {
        Ok(Some(PipelineResult::new("out", Vec::new())))
    });
    let svc = service(&memory, &["in"], handler);

    let task = tokio::spawn({
        let svc = Arc::clone(&svc);
        async move { svc.run().await }
    });
    eventually(|| memory.stats("in").commits == 1).await;
    svc.stop();
    task.await.unwrap().unwrap();
    assert_eq!(memory.stats("out").sent, 0);
}

#[tokio::test]
async fn health_monitor_stops_a_failing_service() {
    let memory = InMemoryDeviceManager::new();
    memory.push("in", Message::new("poison"));
    let handler =
        FnPipelineHandler::new(|_input: HandlerInput| async { anyhow::bail!("always fails") });
    let svc = service(&memory, &["in"], handler);
    let monitor = LoopHealthMonitor {
        max_consecutive_failures: Some(3),
        max_inactivity: None,
    };
    let _guard = monitor.attach(&svc);

    tokio::time::timeout(Duration::from_secs(5), svc.run())
        .await
        .unwrap()
        .unwrap();
    assert!(memory.stats("in").rollbacks >= 3);
    assert_eq!(memory.len("in"), 1);
}

#[tokio::test]
async fn health_monitor_stops_a_stuck_handler() {
    let memory = InMemoryDeviceManager::new();
    memory.push("in", Message::new("slow"));
    let handler = FnPipelineHandler::new(|_input: HandlerInput| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(None)
    });
    let svc = service(&memory, &["in"], handler);
    let monitor = LoopHealthMonitor {
        max_consecutive_failures: None,
        max_inactivity: Some(Duration::from_millis(100)),
    };
    let guard = monitor.attach(&svc);

    tokio::time::timeout(Duration::from_secs(5), svc.run())
        .await
        .unwrap()
        .unwrap();
    // The in-flight message still finishes before the service stops.
    assert_eq!(memory.stats("in").commits, 1);
    drop(guard);
    assert!(svc.loop_events().is_empty());
}
