//! End-to-end tests: in-process controller plus runner(s), virtual time.
//!
//! These drive the whole scheduling plane (volume models, grant clamping,
//! data-pool loans, the runner loop and drain) and assert on the telemetry
//! stream alone, the way an external observer would.

use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::runtime::Handle;
use tokio::time::Duration;

use stampede::config::ConfigManager;
use stampede::context::Capabilities;
use stampede::controller::Controller;
use stampede::datapool::{IterablePool, RecyclablePool};
use stampede::errors::JourneyError;
use stampede::messages::{MemorySink, SharedSink};
use stampede::registry::Registry;
use stampede::runner::{Runner, RunnerOptions};
use stampede::scenario::ScenarioManager;
use stampede::volume::ConstantVolume;
use stampede::wire::DirectRunnerTransport;

fn test_registry() -> Arc<Registry> {
    Registry::builder()
        .journey("sleepy", |_ctx, _args| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .journey("quick", |_ctx, _args| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .journey("instant", |_ctx, _args| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .journey("forever", |_ctx, _args| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .journey("failing", |_ctx, _args| async {
            Err(JourneyError::error("server said no").with_field("status_code", 500))
        })
        .journey("panicky", |_ctx, _args| async {
            panic!("journey exploded on its first statement");
        })
        .build()
}

fn make_controller(manager: ScenarioManager) -> Arc<Mutex<Controller>> {
    Arc::new(Mutex::new(Controller::new(
        "e2e",
        manager,
        ConfigManager::new(),
        Duration::from_secs(10),
    )))
}

fn make_runner(
    controller: &Arc<Mutex<Controller>>,
    sink: SharedSink,
    registry: Arc<Registry>,
) -> Runner {
    Runner::new(
        Box::new(DirectRunnerTransport::new(controller.clone())),
        sink,
        registry,
        Capabilities::default(),
        Handle::current(),
        RunnerOptions::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn constant_volume_sustains_population() {
    let mut manager = ScenarioManager::with_defaults();
    manager.add_scenario("sleepy", None, Box::new(ConstantVolume::lasting(10, 5.0)));
    let controller = make_controller(manager);
    let sink = MemorySink::new();

    make_runner(&controller, sink.clone(), test_registry())
        .run()
        .await
        .unwrap();

    // Volume 10 of one-second journeys over five seconds: ~50 invocations.
    let starts = sink.count_kind("start");
    let ends = sink.count_kind("end");
    assert_eq!(starts, ends, "every start must have a matching end");
    assert!((40..=60).contains(&starts), "got {} starts", starts);
    assert!(controller.lock().unwrap().should_stop());
}

#[tokio::test(start_paused = true)]
async fn recyclable_pool_caps_concurrency_and_recycles() {
    let mut manager = ScenarioManager::with_defaults();
    let pool = RecyclablePool::new(vec![json!("a"), json!("b"), json!("c")]);
    manager.add_scenario(
        "quick",
        Some(Box::new(pool)),
        Box::new(ConstantVolume::lasting(5, 5.0)),
    );
    let controller = make_controller(manager);
    let sink = MemorySink::new();

    make_runner(&controller, sink.clone(), test_registry())
        .run()
        .await
        .unwrap();

    let messages = sink.snapshot();
    let starts: Vec<_> = messages.iter().filter(|m| m.kind == "start").collect();
    assert!(!starts.is_empty());

    // Volume 5 against a pool of 3: only the pool's items ever run.
    for msg in &starts {
        let data_id = msg.data_id.expect("pooled grants always carry a data id");
        assert!((1..=3).contains(&data_id), "unexpected data_id {}", data_id);
    }

    // Every item cycles through many times at steady state.
    for data_id in 1..=3u64 {
        let uses = starts.iter().filter(|m| m.data_id == Some(data_id)).count();
        assert!(uses >= 5, "data_id {} only used {} times", data_id, uses);
    }

    // At-most-one holder: per item, start and end strictly alternate.
    for data_id in 1..=3u64 {
        let mut open = false;
        for msg in messages
            .iter()
            .filter(|m| m.data_id == Some(data_id) && (m.kind == "start" || m.kind == "end"))
        {
            match msg.kind.as_str() {
                "start" => {
                    assert!(!open, "data_id {} checked out twice concurrently", data_id);
                    open = true;
                }
                _ => open = false,
            }
        }
        assert!(!open, "data_id {} never returned", data_id);
    }
}

#[tokio::test(start_paused = true)]
async fn iterable_pool_exhaustion_ends_the_scenario() {
    let mut manager = ScenarioManager::with_defaults();
    let pool = IterablePool::new((0..7).map(|i| json!({ "row": i })));
    manager.add_scenario("sleepy", Some(Box::new(pool)), Box::new(ConstantVolume::new(10)));
    let controller = make_controller(manager);
    let sink = MemorySink::new();

    make_runner(&controller, sink.clone(), test_registry())
        .run()
        .await
        .unwrap();

    // Seven items total: exactly seven grants ever, then a clean shutdown.
    assert_eq!(sink.count_kind("start"), 7);
    assert_eq!(sink.count_kind("end"), 7);

    let mut ctl = controller.lock().unwrap();
    assert!(ctl.should_stop());
    ctl.report(&*sink);
    let report = sink.snapshot().into_iter().last().unwrap();
    assert_eq!(report.kind, "controller_report");
    assert_eq!(report.fields["required"], json!({}));
}

#[tokio::test(start_paused = true)]
async fn two_runners_split_two_scenarios_fairly() {
    let mut manager = ScenarioManager::with_defaults();
    manager.add_scenario("sleepy", None, Box::new(ConstantVolume::lasting(4, 6.0)));
    manager.add_scenario("sleepy", None, Box::new(ConstantVolume::lasting(6, 6.0)));
    let controller = make_controller(manager);
    let sink = MemorySink::new();
    let registry = test_registry();

    let r1 = make_runner(&controller, sink.clone(), registry.clone());
    let r2 = make_runner(&controller, sink.clone(), registry);
    let (a, b) = tokio::join!(r1.run(), r2.run());
    a.unwrap();
    b.unwrap();

    let messages = sink.snapshot();
    let starts: Vec<_> = messages.iter().filter(|m| m.kind == "start").collect();
    let total = starts.len() as f64;
    assert!(total >= 30.0, "only {} starts", total);

    // Fair share: neither runner hogs the work.
    for runner_id in [1u64, 2] {
        let share = starts
            .iter()
            .filter(|m| m.runner_id == Some(runner_id))
            .count() as f64
            / total;
        assert!(
            (0.3..=0.7).contains(&share),
            "runner {} ran {:.0}% of the work",
            runner_id,
            share * 100.0
        );
    }

    // Scenario mix tracks the 4:6 volume ratio.
    let scenario_1 = starts
        .iter()
        .filter(|m| m.scenario_id == Some(1))
        .count() as f64
        / total;
    assert!(
        (0.25..=0.55).contains(&scenario_1),
        "scenario 1 was {:.0}% of starts",
        scenario_1 * 100.0
    );
}

#[tokio::test(start_paused = true)]
async fn domain_error_emits_exactly_one_error_frame() {
    let mut manager = ScenarioManager::with_defaults();
    manager.add_scenario("failing", None, Box::new(ConstantVolume::lasting(2, 2.0)));
    let controller = make_controller(manager);
    let sink = MemorySink::new();

    make_runner(&controller, sink.clone(), test_registry())
        .run()
        .await
        .unwrap();

    let messages = sink.snapshot();
    let starts = sink.count_kind("start");
    let errors = sink.count_kind("error");
    let exceptions = sink.count_kind("exception");
    let ends = sink.count_kind("end");

    assert!(starts >= 2);
    // One error per failure, end still emitted, never a duplicate exception.
    assert_eq!(errors, starts);
    assert_eq!(ends, starts);
    assert_eq!(exceptions, 0);

    let error = messages.iter().find(|m| m.kind == "error").unwrap();
    assert_eq!(error.fields["status_code"], 500);
    assert_eq!(error.transaction, "__root__");
}

#[tokio::test(start_paused = true)]
async fn panicking_journey_cannot_stall_the_runner() {
    let mut manager = ScenarioManager::with_defaults();
    manager.add_scenario("panicky", None, Box::new(ConstantVolume::lasting(1, 3.0)));
    manager.add_scenario("instant", None, Box::new(ConstantVolume::lasting(2, 3.0)));
    let controller = make_controller(manager);
    let sink = MemorySink::new();

    make_runner(&controller, sink.clone(), test_registry())
        .run()
        .await
        .expect("a panicking journey must not take the runner down");

    let messages = sink.snapshot();
    let exceptions = sink.count_kind("exception");
    assert!(exceptions >= 1, "panic was never reported");

    let exception = messages.iter().find(|m| m.kind == "exception").unwrap();
    assert_eq!(exception.fields["ex_type"], "panic");
    assert!(exception.fields["message"]
        .as_str()
        .unwrap()
        .contains("exploded"));

    // The healthy scenario kept making progress alongside the panics.
    let healthy_starts = messages
        .iter()
        .filter(|m| m.kind == "start" && m.scenario_id == Some(2))
        .count();
    assert!(healthy_starts >= 5, "only {} healthy starts", healthy_starts);

    // A panic skips the end frame; everything else pairs up.
    let starts = sink.count_kind("start");
    let ends = sink.count_kind("end");
    assert_eq!(starts - ends, exceptions);
}

#[tokio::test(start_paused = true)]
async fn spawn_rate_bounds_grant_throughput() {
    let mut manager = ScenarioManager::new(0.0, 1.0, 0.01, Some(20.0));
    manager.add_scenario("forever", None, Box::new(ConstantVolume::lasting(1000, 5.0)));
    let controller = make_controller(manager);
    let sink = MemorySink::new();

    make_runner(&controller, sink.clone(), test_registry())
        .run()
        .await
        .unwrap();

    let starts = sink.count_kind("start");
    // 20 starts/sec over 5 seconds, plus a bounded first-second allowance.
    assert!(starts <= 140, "spawn rate ceiling exceeded: {} starts", starts);
    assert!(starts >= 40, "spawn rate throttled too hard: {} starts", starts);
}

#[tokio::test(start_paused = true)]
async fn start_delay_holds_work_back() {
    let mut manager = ScenarioManager::new(3.0, 1.0, 0.01, None);
    manager.add_scenario("instant", None, Box::new(ConstantVolume::lasting(2, 1.0)));
    let controller = make_controller(manager);
    let sink = MemorySink::new();

    let started = tokio::time::Instant::now();
    make_runner(&controller, sink.clone(), test_registry())
        .run()
        .await
        .unwrap();

    // Nothing could have run before the delay elapsed.
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(sink.count_kind("start") >= 1);
}
