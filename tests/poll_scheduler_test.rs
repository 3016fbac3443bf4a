//! Integration tests for the poll scheduler against the journaling mock link.

use mercury_itc::client::ItcClient;
use mercury_itc::hardware::link::SharedLink;
use mercury_itc::hardware::mock::{Journal, MockLink};
use mercury_itc::measurement::{Reading, Unit, Value};
use mercury_itc::messages::{FeedEvent, FeedValue, WorkerKind};
use mercury_itc::power::PowerRatioCalculator;
use mercury_itc::protocol::MeasurementKind;
use mercury_itc::registry::{
    default_channels, default_pairs, ChannelDefinition, ChannelRegistry, Tier,
};
use mercury_itc::scheduler::{PollCycle, PollScheduler, TickOutcome};
use mercury_itc::session::ConnectionState;
use mercury_itc::worker::WorkerControl;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct Rig {
    scheduler: PollScheduler,
    registry: Arc<ChannelRegistry>,
    journal: Journal,
    feed: mpsc::UnboundedReceiver<FeedEvent>,
    _state: watch::Sender<ConnectionState>,
}

async fn rig_with<F>(registry: ChannelRegistry, state: ConnectionState, responder: F) -> Rig
where
    F: FnMut(&str) -> Option<String> + Send + 'static,
{
    let mock = MockLink::new(responder);
    let journal = mock.journal();
    let link = SharedLink::new(mock);
    link.open().await.expect("mock link opens");
    journal.clear();

    let registry = Arc::new(registry);
    let (state_tx, state_rx) = watch::channel(state);
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = PollScheduler::new(
        ItcClient::new(link),
        registry.clone(),
        Arc::new(PowerRatioCalculator::new()),
        state_rx,
        tx,
    );

    Rig {
        scheduler,
        registry,
        journal,
        feed: rx,
        _state: state_tx,
    }
}

fn factory_registry() -> ChannelRegistry {
    ChannelRegistry::new(&default_channels(), &default_pairs(), Some("DB4"))
        .expect("factory layout is valid")
}

async fn factory_rig() -> Rig {
    let mut itc = mercury_itc::hardware::mock::SimulatedItc::default();
    rig_with(factory_registry(), ConnectionState::Connected, move |request| {
        itc.respond(request)
    })
    .await
}

fn drain(feed: &mut mpsc::UnboundedReceiver<FeedEvent>) -> Vec<FeedEvent> {
    let mut events = Vec::new();
    while let Ok(event) = feed.try_recv() {
        events.push(event);
    }
    events
}

fn updates_for(events: &[FeedEvent], channel: &str) -> Vec<FeedValue> {
    events
        .iter()
        .filter_map(|event| match event {
            FeedEvent::Update(update) if update.channel_id == channel => Some(update.value.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_every_transaction_is_followed_by_a_recycle() {
    let mut rig = factory_rig().await;

    for _ in 0..8 {
        let before = rig.journal.len();
        rig.scheduler.tick().await;
        let ops = rig.journal.ops()[before..].to_vec();
        let writes = ops
            .iter()
            .filter(|op| matches!(op, mercury_itc::hardware::mock::LinkOp::Write(_)))
            .count();
        // write, read, close, open per transaction
        assert_eq!(ops.len(), writes * 4);
    }
    assert_eq!(rig.journal.recycles(), rig.journal.writes().len());
}

#[tokio::test]
async fn test_transactions_per_tick_follow_the_phases() {
    let mut rig = factory_rig().await;

    let mut per_tick = Vec::new();
    for _ in 0..5 {
        match rig.scheduler.tick().await {
            TickOutcome::Polled { transactions } => per_tick.push(transactions),
            TickOutcome::Halted => panic!("connected scheduler halted"),
        }
    }
    // tick 0: all five channels
    // tick 1: two primaries, plus VLIM and SIG:VOLT for both heaters
    // ticks 2-3: primaries only
    // tick 4: all five again
    assert_eq!(per_tick, vec![5, 6, 2, 2, 5]);
    assert_eq!(rig.journal.writes().len(), 20);
}

#[tokio::test]
async fn test_secondary_channels_read_only_on_phase_zero() {
    let mut rig = factory_rig().await;

    for _ in 0..12 {
        let phase = rig.scheduler.cycle().secondary_phase();
        assert!(phase < PollCycle::PHASES);
        assert!(rig.scheduler.cycle().meter_phase() < PollCycle::PHASES);

        let before = rig.journal.writes().len();
        rig.scheduler.tick().await;
        let writes = rig.journal.writes()[before..].to_vec();

        let read_secondary = writes.iter().any(|w| w == "READ:DEV:DB6.T1:TEMP:SIG:TEMP");
        assert_eq!(read_secondary, phase == 0, "phase {phase}");
        assert!(writes.iter().any(|w| w == "READ:DEV:MB1.T1:TEMP:SIG:TEMP"));
    }
}

#[tokio::test]
async fn test_invalid_reading_keeps_last_known_value() {
    let mut first = true;
    let mut rig = rig_with(factory_registry(), ConnectionState::Connected, move |request| {
        let path = request.strip_prefix("READ:")?;
        if path == "DEV:MB1.T1:TEMP:SIG:TEMP" && first {
            first = false;
            return Some(format!("STAT:{path}:23.4K"));
        }
        Some(format!("STAT:{path}:INVALID"))
    })
    .await;

    rig.scheduler.tick().await;
    let events = drain(&mut rig.feed);
    let expected = Value::Reading(Reading::new(23.4, Unit::Kelvin));
    assert_eq!(
        updates_for(&events, "MB1"),
        vec![FeedValue::Reading(expected.clone())]
    );

    for _ in 0..3 {
        rig.scheduler.tick().await;
    }
    let events = drain(&mut rig.feed);
    assert!(updates_for(&events, "MB1").is_empty());
    assert_eq!(rig.registry.last_known("MB1"), Some(expected));
    assert_eq!(rig.registry.last_known("DB6"), None);
}

#[tokio::test]
async fn test_gas_flow_handoff_on_tenth_primary_tick() {
    let mut rig = factory_rig().await;
    assert!(rig.registry.set_gas_flow_tier(Tier::Primary));

    for tick in 1..=9 {
        rig.scheduler.tick().await;
        assert_eq!(rig.registry.tier("DB4").expect("DB4 exists"), Tier::Primary, "tick {tick}");
        assert_eq!(rig.scheduler.cycle().handoff_counter(), tick);
    }

    let before = rig.journal.writes().len();
    rig.scheduler.tick().await;
    // still read as Primary on the tenth tick, then demoted
    assert!(rig.journal.writes()[before..]
        .iter()
        .any(|w| w == "READ:DEV:DB4.G1:AUX:SIG:PERC"));
    assert_eq!(rig.registry.tier("DB4").expect("DB4 exists"), Tier::Secondary);
    assert_eq!(rig.scheduler.cycle().handoff_counter(), 0);

    rig.scheduler.tick().await;
    assert_eq!(rig.scheduler.cycle().handoff_counter(), 0);
}

#[tokio::test]
async fn test_power_ratio_survives_failed_voltage_read() {
    let volts_fail = Arc::new(AtomicBool::new(false));
    let fail = volts_fail.clone();
    let mut rig = rig_with(factory_registry(), ConnectionState::Connected, move |request| {
        let path = request.strip_prefix("READ:")?;
        let value = if path.ends_with(":VLIM") {
            "20.0V"
        } else if path.ends_with(":SIG:VOLT") && !fail.load(Ordering::SeqCst) {
            "10.0V"
        } else if path.ends_with(":SIG:VOLT") {
            "INVALID"
        } else {
            "1.0K"
        };
        Some(format!("STAT:{path}:{value}"))
    })
    .await;

    rig.scheduler.tick().await;
    rig.scheduler.tick().await;
    let events = drain(&mut rig.feed);
    assert!(updates_for(&events, "MB0").contains(&FeedValue::PowerRatio(25.0)));
    assert!(updates_for(&events, "DB1").contains(&FeedValue::PowerRatio(25.0)));

    volts_fail.store(true, Ordering::SeqCst);
    for _ in 0..4 {
        rig.scheduler.tick().await;
    }
    let events = drain(&mut rig.feed);
    let ratios: Vec<_> = updates_for(&events, "MB0")
        .into_iter()
        .filter(|value| matches!(value, FeedValue::PowerRatio(_)))
        .collect();
    assert_eq!(ratios, vec![FeedValue::PowerRatio(25.0)]);
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_scheduler_emits_unavailable_once_then_halts() {
    let channels = vec![
        ChannelDefinition {
            id: "A".into(),
            name: "A.T".into(),
            address: "DEV:A.T1:TEMP".into(),
            measurement: MeasurementKind::Temp,
            tier: Tier::Primary,
        },
        ChannelDefinition {
            id: "B".into(),
            name: "B.%".into(),
            address: "DEV:B.G1:AUX".into(),
            measurement: MeasurementKind::Perc,
            tier: Tier::Secondary,
        },
    ];
    let registry = ChannelRegistry::new(&channels, &[], None).expect("two-channel registry");
    let rig = rig_with(registry, ConnectionState::Disconnected, |_| {
        Some("STAT:INVALID".to_string())
    })
    .await;
    let Rig {
        scheduler,
        journal,
        mut feed,
        ..
    } = rig;

    scheduler
        .run(WorkerControl::new(), Duration::from_secs(1))
        .await;

    let events = drain(&mut feed);
    let summary: Vec<(String, String)> = events
        .iter()
        .map(|event| match event {
            FeedEvent::Update(update) => (update.channel_id.clone(), update.value.to_string()),
            FeedEvent::Ended(kind) => ("ended".to_string(), kind.to_string()),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            ("A".to_string(), "N/A".to_string()),
            ("B".to_string(), "N/A".to_string()),
            ("ended".to_string(), WorkerKind::Poller.to_string()),
        ]
    );
    assert!(journal.is_empty());

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(feed.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_paused_scheduler_performs_no_io() {
    let rig = factory_rig().await;
    let Rig {
        scheduler,
        journal,
        mut feed,
        ..
    } = rig;

    let control = WorkerControl::new();
    control.pause();
    scheduler.run(control, Duration::from_secs(1)).await;

    assert!(journal.is_empty());
    assert_eq!(drain(&mut feed), vec![FeedEvent::Ended(WorkerKind::Poller)]);
}

#[tokio::test(start_paused = true)]
async fn test_pause_stops_a_running_scheduler_after_the_current_tick() {
    let rig = factory_rig().await;
    let Rig {
        scheduler,
        journal,
        mut feed,
        ..
    } = rig;

    let control = WorkerControl::new();
    let handle = tokio::spawn(scheduler.run(control.clone(), Duration::from_secs(1)));

    tokio::time::sleep(Duration::from_millis(3500)).await;
    control.pause();
    handle.await.expect("scheduler task completes");

    let writes = journal.writes().len();
    // ticks at 0s, 1s, 2s and 3s
    assert_eq!(writes, 5 + 6 + 2 + 2);
    let events = drain(&mut feed);
    assert_eq!(events.last(), Some(&FeedEvent::Ended(WorkerKind::Poller)));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(journal.writes().len(), writes);
}
