//! End-to-end scenarios on the loopback device.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rulebus::journal::Journal;
use rulebus::{
    loopback_device, ControlDefinition, ControlType, DeviceDefinition, Engine, EngineBuilder,
    EngineConfig, EngineError, InMemoryBus, LogSink, MessageBus, Publication, Runtime,
};

const SET_LOUD: &str = "/devices/loopback/controls/set_loud/on";
const SET_SILENT: &str = "/devices/loopback/controls/set_silent/on";
const GAUGE: &str = "/devices/loopback/controls/gauge/on";

fn builder(journal: &Journal) -> EngineBuilder {
    EngineBuilder::new(
        Arc::new(journal.clone()) as Arc<dyn MessageBus>,
        Arc::new(journal.clone()) as Arc<dyn LogSink>,
    )
    .with_device(loopback_device())
}

fn loopback_engine(journal: &Journal) -> Engine {
    builder(journal)
        .with_fn_rule("announce gauge", "loopback/gauge", |ctx| {
            let message = format!("gauge set to {}", ctx.event().new);
            ctx.info(message);
            Ok(())
        })
        .with_fn_rule("loud button", "loopback/set_loud", |ctx| {
            ctx.info("set_loud button pressed");
            ctx.set_cell("loopback/gauge", 42)?;
            Ok(())
        })
        .with_fn_rule("silent button", "loopback/set_silent", |ctx| {
            ctx.info("set_silent button pressed");
            ctx.set_cell("loopback/gauge~", 84)?;
            Ok(())
        })
        .build()
        .unwrap()
}

#[test]
fn scenario_loud_set_notifies_gauge_rule() {
    let journal = Journal::new();
    let engine = loopback_engine(&journal);

    engine.handle_inbound(SET_LOUD, "1").unwrap();

    journal.verify_ordered(&[
        "echo -> /devices/loopback/controls/set_loud/on: [1] (QoS 1)",
        "engine -> /devices/loopback/controls/set_loud: [1] (QoS 1)",
        "[info] set_loud button pressed",
        "engine -> /devices/loopback/controls/gauge: [42] (QoS 1, retained)",
        "[info] gauge set to 42",
    ]);
}

#[test]
fn scenario_silent_set_publishes_without_notifying() {
    let journal = Journal::new();
    let engine = loopback_engine(&journal);

    engine.handle_inbound(SET_SILENT, "1").unwrap();

    journal.verify_unordered(&[
        "echo -> /devices/loopback/controls/set_silent/on: [1] (QoS 1)",
        "engine -> /devices/loopback/controls/set_silent: [1] (QoS 1)",
        "[info] set_silent button pressed",
        "engine -> /devices/loopback/controls/gauge: [84] (QoS 1, retained)",
    ]);
}

#[test]
fn scenarios_in_sequence() {
    let journal = Journal::new();
    let engine = loopback_engine(&journal);

    engine.handle_inbound(SET_LOUD, "1").unwrap();
    assert_eq!(journal.take().len(), 5);

    engine.handle_inbound(SET_SILENT, "1").unwrap();
    assert_eq!(journal.take().len(), 4);

    assert_eq!(engine.read("loopback", "gauge").unwrap().as_f64(), Some(84.0));
}

#[test]
fn identical_stimuli_produce_identical_output() {
    let first = Journal::new();
    let second = Journal::new();
    let a = loopback_engine(&first);
    let b = loopback_engine(&second);

    for engine in [&a, &b] {
        engine.handle_inbound(SET_LOUD, "1").unwrap();
        engine.handle_inbound(GAUGE, "7").unwrap();
        engine.handle_inbound(SET_SILENT, "1").unwrap();
    }
    assert_eq!(first.lines(), second.lines());

    // Pressing again repeats the same sequence.
    let before = first.take();
    a.handle_inbound(SET_LOUD, "1").unwrap();
    a.handle_inbound(GAUGE, "7").unwrap();
    a.handle_inbound(SET_SILENT, "1").unwrap();
    assert_eq!(first.take(), before);
}

#[test]
fn invalid_value_is_echoed_and_logged() {
    let journal = Journal::new();
    let engine = loopback_engine(&journal);

    let err = engine.handle_inbound(GAUGE, "not a number").unwrap_err();
    assert!(matches!(err, EngineError::InvalidValueKind { .. }));

    journal.verify_ordered(&[
        "echo -> /devices/loopback/controls/gauge/on: [not a number] (QoS 1)",
        "[error] invalid value for loopback/gauge (value): \"not a number\"",
    ]);
}

#[test]
fn unknown_control_produces_nothing() {
    let journal = Journal::new();
    let engine = loopback_engine(&journal);

    let err = engine
        .handle_inbound("/devices/loopback/controls/volume/on", "3")
        .unwrap_err();
    assert_eq!(err.to_string(), "unknown control: loopback/volume");
    assert!(journal.entries().is_empty());
}

#[test]
fn failing_rule_does_not_stop_siblings() {
    let journal = Journal::new();
    let engine = builder(&journal)
        .with_fn_rule("broken", "loopback/set_loud", |ctx| {
            ctx.read("loopback", "missing")?;
            Ok(())
        })
        .with_fn_rule("panicky", "loopback/set_loud", |_ctx| panic!("rule exploded"))
        .with_fn_rule("loud button", "loopback/set_loud", |ctx| {
            ctx.info("set_loud button pressed");
            Ok(())
        })
        .build()
        .unwrap();

    let report = engine.handle_inbound(SET_LOUD, "1").unwrap();
    assert_eq!(report.failures.len(), 2);

    journal.verify_ordered(&[
        "echo -> /devices/loopback/controls/set_loud/on: [1] (QoS 1)",
        "engine -> /devices/loopback/controls/set_loud: [1] (QoS 1)",
        "[error] rule 'broken' failed: unknown control: loopback/missing",
        "[error] rule 'panicky' failed: panic: rule exploded",
        "[info] set_loud button pressed",
    ]);
}

#[test]
fn ping_pong_rules_stop_at_cascade_bound() {
    let journal = Journal::new();
    let ping = Arc::new(AtomicUsize::new(0));
    let hits = ping.clone();
    let engine = builder(&journal)
        .with_config(EngineConfig::default().with_max_cascade_depth(2))
        .with_fn_rule("ping", "loopback/set_loud", move |ctx| {
            hits.fetch_add(1, Ordering::SeqCst);
            ctx.set("loopback", "set_silent", true)?;
            Ok(())
        })
        .with_fn_rule("pong", "loopback/set_silent", |ctx| {
            ctx.set("loopback", "set_loud", true)?;
            Ok(())
        })
        .build()
        .unwrap();

    let report = engine.handle_inbound(SET_LOUD, "1").unwrap();

    // depth 0 ping, depth 1 pong, depth 2 ping, depth 3 dropped
    assert_eq!(ping.load(Ordering::SeqCst), 2);
    assert_eq!(report.dropped_cascades, 1);
    assert_eq!(
        journal.lines().last().map(String::as_str),
        Some("[warn] cascade depth 2 exceeded for loopback/set_silent, rules not triggered")
    );
}

#[test]
fn late_subscriber_receives_retained_gauge() {
    let bus = InMemoryBus::new();
    let journal = Journal::wrapping(Arc::new(bus.clone()));
    let engine = loopback_engine(&journal);

    engine.handle_inbound(SET_LOUD, "1").unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(
        "/devices/loopback/controls/+",
        Arc::new(move |p: &Publication| sink.lock().unwrap().push(p.to_string())),
    )
    .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        ["/devices/loopback/controls/gauge: [42] (QoS 1, retained)"]
    );
}

#[test]
fn retained_policy_follows_each_control() {
    let bus = InMemoryBus::new();
    let journal = Journal::wrapping(Arc::new(bus.clone()));
    let panel = DeviceDefinition::new("panel")
        .with_control(ControlDefinition::new("v", ControlType::Value).with_retained(false))
        .with_control(ControlDefinition::new("b", ControlType::PushButton).with_retained(true));
    let engine = builder(&journal)
        .with_device(panel)
        .with_fn_rule("press sets v", "panel/b", |ctx| {
            ctx.set("panel", "v", 5)?;
            Ok(())
        })
        .build()
        .unwrap();

    engine.handle_inbound("/devices/panel/controls/b/on", "1").unwrap();
    engine.handle_inbound("/devices/panel/controls/v/on", "2").unwrap();
    engine.set("panel/v", 3).unwrap();
    engine.handle_inbound(GAUGE, "7").unwrap();

    journal.verify_ordered(&[
        "echo -> /devices/panel/controls/b/on: [1] (QoS 1)",
        "engine -> /devices/panel/controls/b: [1] (QoS 1, retained)",
        "engine -> /devices/panel/controls/v: [5] (QoS 1)",
        "echo -> /devices/panel/controls/v/on: [2] (QoS 1)",
        "engine -> /devices/panel/controls/v: [2] (QoS 1)",
        "engine -> /devices/panel/controls/v: [3] (QoS 1)",
        "echo -> /devices/loopback/controls/gauge/on: [7] (QoS 1)",
        "engine -> /devices/loopback/controls/gauge: [7] (QoS 1, retained)",
    ]);
    assert!(bus.retained("/devices/panel/controls/v").is_none());
    assert_eq!(bus.retained("/devices/panel/controls/b").unwrap().payload, "1");
    assert!(bus.retained("/devices/panel/controls/b/on").is_none());
}

#[tokio::test]
async fn runtime_processes_client_writes_from_the_bus() {
    let bus = InMemoryBus::new();
    let journal = Journal::wrapping(Arc::new(bus.clone()));
    let engine = Arc::new(loopback_engine(&journal));
    let handle = Runtime::new(engine.clone(), Arc::new(bus.clone()))
        .start()
        .unwrap();

    bus.publish(&Publication::client(SET_SILENT, "1")).unwrap();
    handle.deliver(SET_LOUD, "1").await.unwrap();
    handle.shutdown().await;

    // Client writes bypass the journal; echoes were not re-consumed.
    journal.verify_ordered(&[
        "echo -> /devices/loopback/controls/set_silent/on: [1] (QoS 1)",
        "engine -> /devices/loopback/controls/set_silent: [1] (QoS 1)",
        "[info] set_silent button pressed",
        "engine -> /devices/loopback/controls/gauge: [84] (QoS 1, retained)",
        "echo -> /devices/loopback/controls/set_loud/on: [1] (QoS 1)",
        "engine -> /devices/loopback/controls/set_loud: [1] (QoS 1)",
        "[info] set_loud button pressed",
        "engine -> /devices/loopback/controls/gauge: [42] (QoS 1, retained)",
        "[info] gauge set to 42",
    ]);
    assert_eq!(engine.read("loopback", "gauge").unwrap().as_f64(), Some(42.0));
}
